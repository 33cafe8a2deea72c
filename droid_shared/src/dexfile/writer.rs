//! Serializes a [`DexFile`].
//!
//! Writing happens in two steps. The whole model is canonicalized first, which fixes every
//! pool index. The data section is then laid out item by item, and the id sections and the
//! header that point into it are written last.
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use itertools::Itertools;
use log::debug;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use sha1::{Digest, Sha1};

use super::collector::{canonicalize, Pools};
use super::{
    compare_field_layout, compare_method_layout, Annotation, ClassDefinition, DexFile, EncodedAnnotation,
    EncodedValue, DEX_MAGIC, ENDIAN_CONSTANT, HEADER_SIZE, NO_INDEX,
};
use crate::bytecode::encode::{encode, EncodedCode, IndexResolver};
use crate::leb128::{write_sleb128, write_uleb128, write_uleb128p1};
use crate::types::{MethodReference, TypeReference};
use crate::FormatError;

pub(crate) const TYPE_HEADER_ITEM: u16 = 0x0000;
pub(crate) const TYPE_STRING_ID_ITEM: u16 = 0x0001;
pub(crate) const TYPE_TYPE_ID_ITEM: u16 = 0x0002;
pub(crate) const TYPE_PROTO_ID_ITEM: u16 = 0x0003;
pub(crate) const TYPE_FIELD_ID_ITEM: u16 = 0x0004;
pub(crate) const TYPE_METHOD_ID_ITEM: u16 = 0x0005;
pub(crate) const TYPE_CLASS_DEF_ITEM: u16 = 0x0006;
pub(crate) const TYPE_MAP_LIST: u16 = 0x1000;
pub(crate) const TYPE_TYPE_LIST: u16 = 0x1001;
pub(crate) const TYPE_ANNOTATION_SET_ITEM: u16 = 0x1003;
pub(crate) const TYPE_CLASS_DATA_ITEM: u16 = 0x2000;
pub(crate) const TYPE_CODE_ITEM: u16 = 0x2001;
pub(crate) const TYPE_STRING_DATA_ITEM: u16 = 0x2002;
pub(crate) const TYPE_DEBUG_INFO_ITEM: u16 = 0x2003;
pub(crate) const TYPE_ANNOTATION_ITEM: u16 = 0x2004;
pub(crate) const TYPE_ENCODED_ARRAY_ITEM: u16 = 0x2005;
pub(crate) const TYPE_ANNOTATIONS_DIRECTORY_ITEM: u16 = 0x2006;

pub(crate) const VALUE_BYTE: u8 = 0x00;
pub(crate) const VALUE_SHORT: u8 = 0x02;
pub(crate) const VALUE_CHAR: u8 = 0x03;
pub(crate) const VALUE_INT: u8 = 0x04;
pub(crate) const VALUE_LONG: u8 = 0x06;
pub(crate) const VALUE_FLOAT: u8 = 0x10;
pub(crate) const VALUE_DOUBLE: u8 = 0x11;
pub(crate) const VALUE_STRING: u8 = 0x17;
pub(crate) const VALUE_TYPE: u8 = 0x18;
pub(crate) const VALUE_FIELD: u8 = 0x19;
pub(crate) const VALUE_METHOD: u8 = 0x1a;
pub(crate) const VALUE_ENUM: u8 = 0x1b;
pub(crate) const VALUE_ARRAY: u8 = 0x1c;
pub(crate) const VALUE_ANNOTATION: u8 = 0x1d;
pub(crate) const VALUE_NULL: u8 = 0x1e;
pub(crate) const VALUE_BOOLEAN: u8 = 0x1f;

pub(crate) const DBG_END_SEQUENCE: u8 = 0x00;
pub(crate) const DBG_ADVANCE_PC: u8 = 0x01;
pub(crate) const DBG_ADVANCE_LINE: u8 = 0x02;
pub(crate) const DBG_FIRST_SPECIAL: u8 = 0x0a;
pub(crate) const DBG_LINE_BASE: i64 = -4;
pub(crate) const DBG_LINE_RANGE: i64 = 15;

/// Writes `dex` as a complete container
pub fn write(dex: &DexFile) -> Result<Vec<u8>, FormatError> {
    let pools = canonicalize(dex)?;
    check_limits(&pools)?;
    let classes = class_order(dex, &pools)?;
    debug!(
        "writing {} classes, {} strings, {} types, {} methods",
        classes.len(),
        pools.strings.len(),
        pools.types.len(),
        pools.methods.len()
    );

    let data_off = HEADER_SIZE
        + 4 * pools.strings.len() as u32
        + 4 * pools.types.len() as u32
        + 12 * pools.protos.len() as u32
        + 8 * pools.fields.len() as u32
        + 8 * pools.methods.len() as u32
        + 32 * classes.len() as u32;
    let mut data = DataSection::new(data_off);

    let type_lists = write_type_lists(&mut data, &pools, &classes)?;
    let string_offsets = write_strings(&mut data, &pools);
    let code_offsets = write_code(&mut data, &pools, &classes)?;
    let annotation_offsets = write_annotations(&mut data, &pools)?;
    let directories = write_annotation_directories(&mut data, &pools, &classes, &annotation_offsets)?;
    let class_data = write_class_data(&mut data, &pools, &classes, &code_offsets)?;
    let static_values = write_static_values(&mut data, &pools, &classes)?;

    data.align(4);
    let map_off = data.offset();
    data.record(TYPE_MAP_LIST, map_off);

    let mut out = Vec::with_capacity((data_off as usize) + data.bytes.len());
    out.resize(HEADER_SIZE as usize, 0);

    let mut map = vec![MapItem {
        item_type: TYPE_HEADER_ITEM,
        size: 1,
        offset: 0,
    }];
    let mut section = |out: &Vec<u8>, item_type: u16, size: usize| {
        if size > 0 {
            map.push(MapItem {
                item_type,
                size: size as u32,
                offset: out.len() as u32,
            });
        }
    };

    section(&out, TYPE_STRING_ID_ITEM, pools.strings.len());
    for offset in string_offsets.iter() {
        push_u32(&mut out, *offset);
    }

    section(&out, TYPE_TYPE_ID_ITEM, pools.types.len());
    for ty in pools.types.entries() {
        push_u32(&mut out, pools.string_index(&ty.descriptor())?);
    }

    section(&out, TYPE_PROTO_ID_ITEM, pools.protos.len());
    for proto in pools.protos.entries() {
        push_u32(&mut out, pools.string_index(&proto.shorty())?);
        push_u32(&mut out, pools.type_index(&proto.return_type)?);
        let parameters = type_indices(&pools, &proto.parameters)?;
        push_u32(&mut out, type_lists.get(&parameters).copied().unwrap_or(0));
    }

    section(&out, TYPE_FIELD_ID_ITEM, pools.fields.len());
    for field in pools.fields.entries() {
        push_u16(&mut out, pools.class_index(&field.owner)? as u16);
        push_u16(&mut out, pools.type_index(&field.field_type)? as u16);
        push_u32(&mut out, pools.string_index(&field.name)?);
    }

    section(&out, TYPE_METHOD_ID_ITEM, pools.methods.len());
    for method in pools.methods.entries() {
        push_u16(&mut out, pools.class_index(&method.owner)? as u16);
        push_u16(&mut out, pools.proto_index(&method.prototype)? as u16);
        push_u32(&mut out, pools.string_index(&method.name)?);
    }

    section(&out, TYPE_CLASS_DEF_ITEM, classes.len());
    for (index, class) in classes.iter().enumerate() {
        push_u32(&mut out, pools.class_index(&class.class)?);
        push_u32(&mut out, class.access.bits());
        match &class.superclass {
            Some(superclass) => push_u32(&mut out, pools.class_index(superclass)?),
            None => push_u32(&mut out, NO_INDEX),
        }
        let interfaces = class
            .interfaces
            .iter()
            .map(|i| pools.class_index(i).map(|index| index as u16))
            .collect::<Result<Vec<_>, _>>()?;
        push_u32(&mut out, type_lists.get(&interfaces).copied().unwrap_or(0));
        match &class.source_file {
            Some(source_file) => push_u32(&mut out, pools.string_index(source_file)?),
            None => push_u32(&mut out, NO_INDEX),
        }
        push_u32(&mut out, directories[index]);
        push_u32(&mut out, class_data[index]);
        push_u32(&mut out, static_values[index]);
    }

    debug_assert_eq!(out.len() as u32, data_off);
    map.extend(data.map.iter().cloned());
    let data_size = data.bytes.len() as u32 + 4 + 12 * map.len() as u32;
    out.extend_from_slice(&data.bytes);
    push_u32(&mut out, map.len() as u32);
    for item in map.iter() {
        push_u16(&mut out, item.item_type);
        push_u16(&mut out, 0);
        push_u32(&mut out, item.size);
        push_u32(&mut out, item.offset);
    }

    let file_size = out.len() as u32;
    let mut header = Vec::with_capacity(HEADER_SIZE as usize);
    header.extend_from_slice(DEX_MAGIC);
    header.resize(32, 0);
    push_u32(&mut header, file_size);
    push_u32(&mut header, HEADER_SIZE);
    push_u32(&mut header, ENDIAN_CONSTANT);
    push_u32(&mut header, 0);
    push_u32(&mut header, 0);
    push_u32(&mut header, map_off);
    let id_section = |header: &mut Vec<u8>, item_type: u16| {
        match map.iter().find(|m| m.item_type == item_type) {
            Some(item) => {
                push_u32(header, item.size);
                push_u32(header, item.offset);
            }
            None => {
                push_u32(header, 0);
                push_u32(header, 0);
            }
        }
    };
    id_section(&mut header, TYPE_STRING_ID_ITEM);
    id_section(&mut header, TYPE_TYPE_ID_ITEM);
    id_section(&mut header, TYPE_PROTO_ID_ITEM);
    id_section(&mut header, TYPE_FIELD_ID_ITEM);
    id_section(&mut header, TYPE_METHOD_ID_ITEM);
    id_section(&mut header, TYPE_CLASS_DEF_ITEM);
    push_u32(&mut header, data_size);
    push_u32(&mut header, data_off);
    out[..HEADER_SIZE as usize].copy_from_slice(&header);

    let signature = Sha1::digest(&out[32..]);
    out[12..32].copy_from_slice(&signature);
    let checksum = adler32(&out[12..]);
    out[8..12].copy_from_slice(&checksum.to_le_bytes());
    Ok(out)
}

/// Adler-32 over `bytes`, the container's checksum
pub fn adler32(bytes: &[u8]) -> u32 {
    const MOD_ADLER: u32 = 65521;
    let mut a = 1u32;
    let mut b = 0u32;
    for chunk in bytes.chunks(5552) {
        for byte in chunk {
            a += *byte as u32;
            b += a;
        }
        a %= MOD_ADLER;
        b %= MOD_ADLER;
    }
    (b << 16) | a
}

fn check_limits(pools: &Pools) -> Result<(), FormatError> {
    let limits = [
        ("type", pools.types.len()),
        ("prototype", pools.protos.len()),
        ("field", pools.fields.len()),
        ("method", pools.methods.len()),
    ];
    for (kind, len) in limits {
        if len > u16::MAX as usize + 1 {
            return Err(FormatError::TooManyEntries(kind, len));
        }
    }
    Ok(())
}

/// Orders classes so that a superclass or interface defined in the same container comes
/// before the classes extending it. Independent classes follow type order.
fn class_order<'a>(dex: &'a DexFile, pools: &Pools) -> Result<Vec<&'a ClassDefinition>, FormatError> {
    let mut graph: DiGraph<(u32, &ClassDefinition), ()> = DiGraph::new();
    let mut nodes = HashMap::new();
    for class in dex.classes.iter() {
        let index = pools.class_index(&class.class)?;
        let node = graph.add_node((index, class));
        nodes.insert(&class.class, node);
    }
    for class in dex.classes.iter() {
        let node = nodes[&class.class];
        for parent in class.superclass.iter().chain(class.interfaces.iter()) {
            if let Some(parent) = nodes.get(parent) {
                graph.add_edge(*parent, node, ());
            }
        }
    }

    let mut in_degree: HashMap<NodeIndex, usize> = graph
        .node_indices()
        .map(|n| (n, graph.neighbors_directed(n, Direction::Incoming).count()))
        .collect();
    let mut ready: BinaryHeap<Reverse<(u32, NodeIndex)>> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(node, _)| Reverse((graph[*node].0, *node)))
        .collect();

    let mut ordered = Vec::with_capacity(dex.classes.len());
    while let Some(Reverse((_, node))) = ready.pop() {
        ordered.push(graph[node].1);
        for child in graph.neighbors_directed(node, Direction::Outgoing) {
            if let Some(degree) = in_degree.get_mut(&child) {
                *degree -= 1;
                if *degree == 0 {
                    ready.push(Reverse((graph[child].0, child)));
                }
            }
        }
    }
    if ordered.len() != dex.classes.len() {
        let stuck = in_degree
            .iter()
            .filter(|(_, degree)| **degree > 0)
            .map(|(node, _)| graph[*node].1.class.to_string())
            .sorted()
            .next()
            .unwrap_or_default();
        return Err(FormatError::CyclicInheritance(stuck));
    }
    Ok(ordered)
}

#[derive(Debug, Clone)]
struct MapItem {
    item_type: u16,
    size: u32,
    offset: u32,
}

/// The data section under construction; offsets are absolute file offsets
struct DataSection {
    base: u32,
    bytes: Vec<u8>,
    map: Vec<MapItem>,
}

impl DataSection {
    fn new(base: u32) -> DataSection {
        DataSection {
            base,
            bytes: Vec::new(),
            map: Vec::new(),
        }
    }

    fn offset(&self) -> u32 {
        self.base + self.bytes.len() as u32
    }

    fn align(&mut self, alignment: u32) {
        while self.offset() % alignment != 0 {
            self.bytes.push(0);
        }
    }

    /// Notes one more item of `item_type` starting at `offset`
    fn record(&mut self, item_type: u16, offset: u32) {
        match self.map.last_mut() {
            Some(item) if item.item_type == item_type => item.size += 1,
            _ => self.map.push(MapItem {
                item_type,
                size: 1,
                offset,
            }),
        }
    }

    /// Aligns, records and returns the offset of a new item
    fn begin(&mut self, item_type: u16, alignment: u32) -> u32 {
        self.align(alignment);
        let offset = self.offset();
        self.record(item_type, offset);
        offset
    }
}

fn push_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn push_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn type_indices(pools: &Pools, types: &[TypeReference]) -> Result<Vec<u16>, FormatError> {
    types
        .iter()
        .map(|t| pools.type_index(t).map(|index| index as u16))
        .collect()
}

fn write_type_lists(
    data: &mut DataSection,
    pools: &Pools,
    classes: &[&ClassDefinition],
) -> Result<HashMap<Vec<u16>, u32>, FormatError> {
    let mut lists = Vec::new();
    for proto in pools.protos.entries() {
        lists.push(type_indices(pools, &proto.parameters)?);
    }
    for class in classes {
        let interfaces: Vec<TypeReference> = class.interfaces.iter().cloned().map(TypeReference::Class).collect();
        lists.push(type_indices(pools, &interfaces)?);
    }

    let mut offsets = HashMap::new();
    for list in lists {
        if list.is_empty() || offsets.contains_key(&list) {
            continue;
        }
        let offset = data.begin(TYPE_TYPE_LIST, 4);
        push_u32(&mut data.bytes, list.len() as u32);
        for index in list.iter() {
            push_u16(&mut data.bytes, *index);
        }
        offsets.insert(list, offset);
    }
    Ok(offsets)
}

/// Modified UTF-8: NUL and supplementary characters are spelled as UTF-16 units
pub fn to_mutf8(value: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len());
    for unit in value.encode_utf16() {
        match unit {
            0x0001..=0x007f => out.push(unit as u8),
            0x0000 | 0x0080..=0x07ff => {
                out.push(0xc0 | (unit >> 6) as u8);
                out.push(0x80 | (unit & 0x3f) as u8);
            }
            _ => {
                out.push(0xe0 | (unit >> 12) as u8);
                out.push(0x80 | ((unit >> 6) & 0x3f) as u8);
                out.push(0x80 | (unit & 0x3f) as u8);
            }
        }
    }
    out
}

fn write_strings(data: &mut DataSection, pools: &Pools) -> Vec<u32> {
    let mut offsets = Vec::with_capacity(pools.strings.len());
    for value in pools.strings.entries() {
        let offset = data.begin(TYPE_STRING_DATA_ITEM, 1);
        write_uleb128(&mut data.bytes, value.encode_utf16().count() as u32);
        data.bytes.extend(to_mutf8(value));
        data.bytes.push(0);
        offsets.push(offset);
    }
    offsets
}

fn write_debug_info(out: &mut Vec<u8>, lines: &[(u32, u32)], parameters: usize) {
    let line_start = lines.first().map(|(_, line)| *line).unwrap_or(0);
    write_uleb128(out, line_start);
    write_uleb128(out, parameters as u32);
    for _ in 0..parameters {
        write_uleb128p1(out, None);
    }
    let mut address = 0i64;
    let mut line = line_start as i64;
    for (next_address, next_line) in lines {
        let address_delta = *next_address as i64 - address;
        let mut line_delta = *next_line as i64 - line;
        if line_delta < DBG_LINE_BASE || line_delta >= DBG_LINE_BASE + DBG_LINE_RANGE {
            out.push(DBG_ADVANCE_LINE);
            write_sleb128(out, line_delta as i32);
            line_delta = 0;
        }
        let mut special =
            (line_delta - DBG_LINE_BASE) + address_delta * DBG_LINE_RANGE + DBG_FIRST_SPECIAL as i64;
        if special > 0xff {
            out.push(DBG_ADVANCE_PC);
            write_uleb128(out, address_delta as u32);
            special = (line_delta - DBG_LINE_BASE) + DBG_FIRST_SPECIAL as i64;
        }
        out.push(special as u8);
        address = *next_address as i64;
        line = *next_line as i64;
    }
    out.push(DBG_END_SEQUENCE);
}

/// Writes every line table and then every code item. Returns the code offset per method.
fn write_code(
    data: &mut DataSection,
    pools: &Pools,
    classes: &[&ClassDefinition],
) -> Result<HashMap<MethodReference, u32>, FormatError> {
    let mut encoded: Vec<(&MethodReference, usize, EncodedCode)> = Vec::new();
    for class in classes {
        let mut methods: Vec<_> = class.methods.iter().collect();
        methods.sort_by(|a, b| compare_method_layout(a, b));
        for method in methods {
            if let Some(body) = &method.body {
                let mut body = body.clone();
                let code = encode(&mut body, pools)?;
                encoded.push((&method.reference, method.reference.prototype.parameters.len(), code));
            }
        }
    }

    let mut debug_offsets = Vec::with_capacity(encoded.len());
    for (_, parameters, code) in encoded.iter() {
        if code.lines.is_empty() {
            debug_offsets.push(0);
            continue;
        }
        let offset = data.begin(TYPE_DEBUG_INFO_ITEM, 1);
        write_debug_info(&mut data.bytes, &code.lines, *parameters);
        debug_offsets.push(offset);
    }

    let mut offsets = HashMap::new();
    for ((method, _, code), debug_offset) in encoded.iter().zip(debug_offsets) {
        let offset = data.begin(TYPE_CODE_ITEM, 4);
        let out = &mut data.bytes;
        push_u16(out, code.registers_size);
        push_u16(out, code.ins_size);
        push_u16(out, code.outs_size);
        push_u16(out, code.tries.len() as u16);
        push_u32(out, debug_offset);
        push_u32(out, code.insns.len() as u32);
        for unit in code.insns.iter() {
            push_u16(out, *unit);
        }
        if !code.tries.is_empty() {
            if code.insns.len() % 2 == 1 {
                push_u16(out, 0);
            }
            let mut handler_bytes = Vec::new();
            let mut handler_offsets = Vec::with_capacity(code.handlers.len());
            write_uleb128(&mut handler_bytes, code.handlers.len() as u32);
            for handler in code.handlers.iter() {
                handler_offsets.push(handler_bytes.len() as u16);
                let size = handler.catches.len() as i32;
                write_sleb128(&mut handler_bytes, if handler.catch_all.is_some() { -size } else { size });
                for (type_index, address) in handler.catches.iter() {
                    write_uleb128(&mut handler_bytes, *type_index);
                    write_uleb128(&mut handler_bytes, *address);
                }
                if let Some(address) = handler.catch_all {
                    write_uleb128(&mut handler_bytes, address);
                }
            }
            for try_item in code.tries.iter() {
                push_u32(out, try_item.start_address);
                push_u16(out, try_item.instruction_count);
                push_u16(out, handler_offsets[try_item.handler]);
            }
            out.extend(handler_bytes);
        }
        offsets.insert((*method).clone(), offset);
    }
    Ok(offsets)
}

/// Unsigned index or char: as few little endian bytes as possible, at least one
fn write_unsigned_value(out: &mut Vec<u8>, value_type: u8, value: u64) {
    let size = (((64 - value.leading_zeros()) + 7) / 8).max(1);
    out.push((((size - 1) as u8) << 5) | value_type);
    out.extend_from_slice(&value.to_le_bytes()[..size as usize]);
}

fn write_signed_value(out: &mut Vec<u8>, value_type: u8, value: i64) {
    let mut size = 8;
    while size > 1 {
        let shift = 64 - 8 * (size - 1);
        if (value << shift) >> shift != value {
            break;
        }
        size -= 1;
    }
    out.push((((size - 1) as u8) << 5) | value_type);
    out.extend_from_slice(&value.to_le_bytes()[..size as usize]);
}

/// Floating point: the low zero bytes are dropped
fn write_float_value(out: &mut Vec<u8>, value_type: u8, bits: u64, width: usize) {
    let bytes = bits.to_le_bytes();
    let mut start = 0;
    while start < width - 1 && bytes[start] == 0 {
        start += 1;
    }
    out.push((((width - start - 1) as u8) << 5) | value_type);
    out.extend_from_slice(&bytes[start..width]);
}

pub(crate) fn write_encoded_value(out: &mut Vec<u8>, pools: &Pools, value: &EncodedValue) -> Result<(), FormatError> {
    match value {
        EncodedValue::Byte(value) => {
            out.push(VALUE_BYTE);
            out.push(*value as u8);
        }
        EncodedValue::Short(value) => write_signed_value(out, VALUE_SHORT, *value as i64),
        EncodedValue::Char(value) => write_unsigned_value(out, VALUE_CHAR, *value as u64),
        EncodedValue::Int(value) => write_signed_value(out, VALUE_INT, *value as i64),
        EncodedValue::Long(value) => write_signed_value(out, VALUE_LONG, *value),
        EncodedValue::Float(bits) => write_float_value(out, VALUE_FLOAT, *bits as u64, 4),
        EncodedValue::Double(bits) => write_float_value(out, VALUE_DOUBLE, *bits, 8),
        EncodedValue::String(value) => {
            write_unsigned_value(out, VALUE_STRING, pools.string_index(value)? as u64)
        }
        EncodedValue::Type(ty) => write_unsigned_value(out, VALUE_TYPE, pools.type_index(ty)? as u64),
        EncodedValue::Field(field) => write_unsigned_value(out, VALUE_FIELD, pools.field_index(field)? as u64),
        EncodedValue::Method(method) => {
            write_unsigned_value(out, VALUE_METHOD, pools.method_index(method)? as u64)
        }
        EncodedValue::Enum(field) => write_unsigned_value(out, VALUE_ENUM, pools.field_index(field)? as u64),
        EncodedValue::Array(values) => {
            out.push(VALUE_ARRAY);
            write_encoded_array(out, pools, values)?;
        }
        EncodedValue::Annotation(annotation) => {
            out.push(VALUE_ANNOTATION);
            write_encoded_annotation(out, pools, annotation)?;
        }
        EncodedValue::Null => out.push(VALUE_NULL),
        EncodedValue::Boolean(value) => out.push(((*value as u8) << 5) | VALUE_BOOLEAN),
    }
    Ok(())
}

fn write_encoded_array(out: &mut Vec<u8>, pools: &Pools, values: &[EncodedValue]) -> Result<(), FormatError> {
    write_uleb128(out, values.len() as u32);
    for value in values {
        write_encoded_value(out, pools, value)?;
    }
    Ok(())
}

fn write_encoded_annotation(out: &mut Vec<u8>, pools: &Pools, annotation: &EncodedAnnotation) -> Result<(), FormatError> {
    write_uleb128(out, pools.type_index(&annotation.annotation_type)?);
    let elements = annotation.sorted_elements();
    write_uleb128(out, elements.len() as u32);
    for element in elements {
        write_uleb128(out, pools.string_index(&element.name)?);
        write_encoded_value(out, pools, &element.value)?;
    }
    Ok(())
}

fn write_annotations(data: &mut DataSection, pools: &Pools) -> Result<Vec<u32>, FormatError> {
    let mut offsets = Vec::with_capacity(pools.annotations.len());
    for annotation in pools.annotations.entries() {
        let offset = data.begin(TYPE_ANNOTATION_ITEM, 1);
        data.bytes.push(annotation.visibility as u8);
        write_encoded_annotation(&mut data.bytes, pools, &annotation.annotation)?;
        offsets.push(offset);
    }
    Ok(offsets)
}

/// Pool indices of a set of annotations, ordered by annotation type
fn annotation_set(pools: &Pools, annotations: &[Annotation]) -> Result<Vec<u32>, FormatError> {
    let mut set = Vec::with_capacity(annotations.len());
    for annotation in annotations {
        let index = pools
            .annotations
            .index(annotation)
            .ok_or_else(|| FormatError::UnresolvedReference(annotation.to_string(), "annotation"))?;
        let type_index = pools.type_index(&annotation.annotation.annotation_type)?;
        set.push((type_index, index));
    }
    set.sort();
    Ok(set.into_iter().map(|(_, index)| index).collect())
}

fn write_annotation_directories(
    data: &mut DataSection,
    pools: &Pools,
    classes: &[&ClassDefinition],
    annotation_offsets: &[u32],
) -> Result<Vec<u32>, FormatError> {
    struct Directory {
        class: Option<Vec<u32>>,
        fields: Vec<(u32, Vec<u32>)>,
        methods: Vec<(u32, Vec<u32>)>,
    }

    let mut directories = Vec::with_capacity(classes.len());
    for class in classes {
        let class_set = if class.annotations.is_empty() {
            None
        } else {
            Some(annotation_set(pools, &class.annotations)?)
        };
        let mut fields = Vec::new();
        for field in class.fields.iter().filter(|f| !f.annotations.is_empty()) {
            fields.push((pools.field_index(&field.reference)?, annotation_set(pools, &field.annotations)?));
        }
        fields.sort();
        let mut methods = Vec::new();
        for method in class.methods.iter().filter(|m| !m.annotations.is_empty()) {
            methods.push((pools.method_index(&method.reference)?, annotation_set(pools, &method.annotations)?));
        }
        methods.sort();
        directories.push(Directory {
            class: class_set,
            fields,
            methods,
        });
    }

    let mut set_offsets: HashMap<Vec<u32>, u32> = HashMap::new();
    for directory in directories.iter() {
        let sets = directory
            .class
            .iter()
            .chain(directory.fields.iter().map(|(_, set)| set))
            .chain(directory.methods.iter().map(|(_, set)| set));
        for set in sets {
            if set_offsets.contains_key(set) {
                continue;
            }
            let offset = data.begin(TYPE_ANNOTATION_SET_ITEM, 4);
            push_u32(&mut data.bytes, set.len() as u32);
            for index in set {
                push_u32(&mut data.bytes, annotation_offsets[*index as usize]);
            }
            set_offsets.insert(set.clone(), offset);
        }
    }

    let mut offsets = Vec::with_capacity(directories.len());
    for directory in directories {
        if directory.class.is_none() && directory.fields.is_empty() && directory.methods.is_empty() {
            offsets.push(0);
            continue;
        }
        let offset = data.begin(TYPE_ANNOTATIONS_DIRECTORY_ITEM, 4);
        let class_offset = directory.class.as_ref().map(|set| set_offsets[set]).unwrap_or(0);
        push_u32(&mut data.bytes, class_offset);
        push_u32(&mut data.bytes, directory.fields.len() as u32);
        push_u32(&mut data.bytes, directory.methods.len() as u32);
        push_u32(&mut data.bytes, 0);
        for (index, set) in directory.fields.iter().chain(directory.methods.iter()) {
            push_u32(&mut data.bytes, *index);
            push_u32(&mut data.bytes, set_offsets[set]);
        }
        offsets.push(offset);
    }
    Ok(offsets)
}

fn write_class_data(
    data: &mut DataSection,
    pools: &Pools,
    classes: &[&ClassDefinition],
    code_offsets: &HashMap<MethodReference, u32>,
) -> Result<Vec<u32>, FormatError> {
    let mut offsets = Vec::with_capacity(classes.len());
    for class in classes {
        if class.fields.is_empty() && class.methods.is_empty() {
            offsets.push(0);
            continue;
        }
        let mut fields: Vec<_> = class.fields.iter().collect();
        fields.sort_by(|a, b| compare_field_layout(a, b));
        let mut methods: Vec<_> = class.methods.iter().collect();
        methods.sort_by(|a, b| compare_method_layout(a, b));
        let (static_fields, instance_fields): (Vec<_>, Vec<_>) = fields.into_iter().partition(|f| f.is_static());
        let (direct, virtual_methods): (Vec<_>, Vec<_>) = methods.into_iter().partition(|m| m.is_direct());

        let offset = data.begin(TYPE_CLASS_DATA_ITEM, 1);
        let out = &mut data.bytes;
        write_uleb128(out, static_fields.len() as u32);
        write_uleb128(out, instance_fields.len() as u32);
        write_uleb128(out, direct.len() as u32);
        write_uleb128(out, virtual_methods.len() as u32);
        for group in [static_fields, instance_fields] {
            let mut previous = 0;
            for field in group {
                let index = pools.field_index(&field.reference)?;
                write_uleb128(out, index - previous);
                write_uleb128(out, field.access.bits());
                previous = index;
            }
        }
        for group in [direct, virtual_methods] {
            let mut previous = 0;
            for method in group {
                let index = pools.method_index(&method.reference)?;
                write_uleb128(out, index - previous);
                write_uleb128(out, method.access.bits());
                write_uleb128(out, code_offsets.get(&method.reference).copied().unwrap_or(0));
                previous = index;
            }
        }
        offsets.push(offset);
    }
    Ok(offsets)
}

/// Static values up to the last static field that has one; earlier gaps get the type's default
fn write_static_values(
    data: &mut DataSection,
    pools: &Pools,
    classes: &[&ClassDefinition],
) -> Result<Vec<u32>, FormatError> {
    let mut arrays: HashMap<Vec<u8>, u32> = HashMap::new();
    let mut offsets = Vec::with_capacity(classes.len());
    for class in classes {
        let mut statics: Vec<_> = class.fields.iter().filter(|f| f.is_static()).collect();
        statics.sort_by(|a, b| a.reference.cmp(&b.reference));
        let Some(last) = statics.iter().rposition(|f| f.value.is_some()) else {
            offsets.push(0);
            continue;
        };
        let values: Vec<EncodedValue> = statics[..=last]
            .iter()
            .map(|f| {
                f.value
                    .clone()
                    .unwrap_or_else(|| EncodedValue::default_for(&f.reference.field_type))
            })
            .collect();
        let mut bytes = Vec::new();
        write_encoded_array(&mut bytes, pools, &values)?;
        if let Some(offset) = arrays.get(&bytes) {
            offsets.push(*offset);
            continue;
        }
        let offset = data.begin(TYPE_ENCODED_ARRAY_ITEM, 1);
        data.bytes.extend_from_slice(&bytes);
        arrays.insert(bytes, offset);
        offsets.push(offset);
    }
    Ok(offsets)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adler32() {
        assert_eq!(adler32(b"Wikipedia"), 0x11e6_0398);
    }

    #[test]
    fn test_mutf8() {
        assert_eq!(to_mutf8("a\0"), vec![b'a', 0xc0, 0x80]);
        assert_eq!(to_mutf8("\u{1f600}").len(), 6);
    }

    #[test]
    fn test_minimal_values() {
        let mut out = Vec::new();
        write_signed_value(&mut out, VALUE_INT, -1);
        write_signed_value(&mut out, VALUE_INT, 0x80);
        write_unsigned_value(&mut out, VALUE_CHAR, 0);
        write_float_value(&mut out, VALUE_FLOAT, 1.0f32.to_bits() as u64, 4);
        assert_eq!(out, vec![0x04, 0xff, 0x24, 0x80, 0x00, 0x03, 0x00, 0x30, 0x80, 0x3f]);
    }

    #[test]
    fn test_line_table() {
        let mut out = Vec::new();
        write_debug_info(&mut out, &[(0, 10), (3, 11), (4, 40)], 1);
        // line_start, one unnamed parameter, three entries, end.
        assert_eq!(
            out,
            vec![10, 1, 0, 0x0e, 0x0a + 5 + 45, DBG_ADVANCE_LINE, 29, 0x0a + 4 + 15, 0]
        );
    }
}
