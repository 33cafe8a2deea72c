//! Reads a container produced by [`writer`](super::writer) back into a [`DexFile`].
use std::collections::HashMap;

use log::trace;

use super::writer::*;
use super::{
    AccessFlags, Annotation, AnnotationElement, AnnotationVisibility, ClassDefinition, DexFile, EncodedAnnotation,
    EncodedValue, FieldDefinition, MethodDefinition, DEX_MAGIC, HEADER_SIZE, NO_INDEX,
};
use crate::bytecode::decode::{decode, ReferenceResolver};
use crate::bytecode::encode::{EncodedCatchHandler, EncodedCode, EncodedTry};
use crate::leb128::{read_sleb128, read_uleb128, read_uleb128p1};
use crate::types::{ClassReference, FieldReference, MethodReference, Prototype, TypeReference};
use crate::ReadError;

fn read_u16(data: &[u8], at: usize) -> Result<u16, ReadError> {
    let bytes = data.get(at..at + 2).ok_or(ReadError::Truncated(at))?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

fn read_u32(data: &[u8], at: usize) -> Result<u32, ReadError> {
    let bytes = data.get(at..at + 4).ok_or(ReadError::Truncated(at))?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn read_u8(data: &[u8], at: &mut usize) -> Result<u8, ReadError> {
    let byte = *data.get(*at).ok_or(ReadError::Truncated(*at))?;
    *at += 1;
    Ok(byte)
}

/// Decodes modified UTF-8 into a string
pub fn from_mutf8(bytes: &[u8]) -> Result<String, ReadError> {
    let mut units = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        let byte = bytes[index] as u16;
        let continuation = |offset: usize| -> Result<u16, ReadError> {
            bytes
                .get(index + offset)
                .map(|b| (*b & 0x3f) as u16)
                .ok_or(ReadError::Truncated(index + offset))
        };
        if byte & 0x80 == 0 {
            units.push(byte);
            index += 1;
        } else if byte & 0xe0 == 0xc0 {
            units.push(((byte & 0x1f) << 6) | continuation(1)?);
            index += 2;
        } else {
            units.push(((byte & 0x0f) << 12) | (continuation(1)? << 6) | continuation(2)?);
            index += 3;
        }
    }
    String::from_utf16(&units).map_err(|_| ReadError::Malformed("string data".to_string()))
}

/// The id sections of a container, used to resolve indices
#[derive(Debug, Default)]
pub struct IdSections {
    pub strings: Vec<String>,
    pub types: Vec<TypeReference>,
    pub protos: Vec<Prototype>,
    pub fields: Vec<FieldReference>,
    pub methods: Vec<MethodReference>,
}

impl IdSections {
    fn class(&self, index: u32) -> Result<ClassReference, ReadError> {
        match self.type_reference(index)? {
            TypeReference::Class(class) => Ok(class),
            other => Err(ReadError::Malformed(format!("{} used as a class", other))),
        }
    }
}

impl ReferenceResolver for IdSections {
    fn string(&self, index: u32) -> Result<String, ReadError> {
        self.strings
            .get(index as usize)
            .cloned()
            .ok_or(ReadError::BadIndex("string", index))
    }

    fn type_reference(&self, index: u32) -> Result<TypeReference, ReadError> {
        self.types
            .get(index as usize)
            .cloned()
            .ok_or(ReadError::BadIndex("type", index))
    }

    fn field(&self, index: u32) -> Result<FieldReference, ReadError> {
        self.fields
            .get(index as usize)
            .cloned()
            .ok_or(ReadError::BadIndex("field", index))
    }

    fn method(&self, index: u32) -> Result<MethodReference, ReadError> {
        self.methods
            .get(index as usize)
            .cloned()
            .ok_or(ReadError::BadIndex("method", index))
    }
}

/// Size and offset pairs of the header
struct Header {
    string_ids: (u32, u32),
    type_ids: (u32, u32),
    proto_ids: (u32, u32),
    field_ids: (u32, u32),
    method_ids: (u32, u32),
    class_defs: (u32, u32),
}

fn read_header(data: &[u8]) -> Result<Header, ReadError> {
    if data.len() < HEADER_SIZE as usize {
        return Err(ReadError::Truncated(data.len()));
    }
    if &data[..8] != DEX_MAGIC {
        return Err(ReadError::BadMagic);
    }
    let expected = read_u32(data, 8)?;
    let found = adler32(&data[12..]);
    if expected != found {
        return Err(ReadError::BadChecksum { expected, found });
    }
    let pair = |at: usize| -> Result<(u32, u32), ReadError> { Ok((read_u32(data, at)?, read_u32(data, at + 4)?)) };
    Ok(Header {
        string_ids: pair(56)?,
        type_ids: pair(64)?,
        proto_ids: pair(72)?,
        field_ids: pair(80)?,
        method_ids: pair(88)?,
        class_defs: pair(96)?,
    })
}

fn read_type_list(data: &[u8], ids: &IdSections, offset: u32) -> Result<Vec<TypeReference>, ReadError> {
    if offset == 0 {
        return Ok(Vec::new());
    }
    let offset = offset as usize;
    let size = read_u32(data, offset)?;
    (0..size as usize)
        .map(|i| ids.type_reference(read_u16(data, offset + 4 + 2 * i)? as u32))
        .collect()
}

fn read_ids(data: &[u8], header: &Header) -> Result<IdSections, ReadError> {
    let mut ids = IdSections::default();
    let (count, offset) = header.string_ids;
    for i in 0..count as usize {
        let mut at = read_u32(data, offset as usize + 4 * i)? as usize;
        read_uleb128(data, &mut at)?;
        let end = data[at..]
            .iter()
            .position(|b| *b == 0)
            .ok_or(ReadError::Truncated(at))?;
        ids.strings.push(from_mutf8(&data[at..at + end])?);
    }

    let (count, offset) = header.type_ids;
    for i in 0..count as usize {
        let descriptor = ids.string(read_u32(data, offset as usize + 4 * i)?)?;
        let ty = TypeReference::parse(&descriptor)
            .ok_or_else(|| ReadError::Malformed(format!("type descriptor {}", descriptor)))?;
        ids.types.push(ty);
    }

    let (count, offset) = header.proto_ids;
    for i in 0..count as usize {
        let at = offset as usize + 12 * i;
        let return_type = ids.type_reference(read_u32(data, at + 4)?)?;
        let parameters = read_type_list(data, &ids, read_u32(data, at + 8)?)?;
        ids.protos.push(Prototype::new(return_type, parameters));
    }

    let (count, offset) = header.field_ids;
    for i in 0..count as usize {
        let at = offset as usize + 8 * i;
        let owner = ids.class(read_u16(data, at)? as u32)?;
        let field_type = ids.type_reference(read_u16(data, at + 2)? as u32)?;
        let name = ids.string(read_u32(data, at + 4)?)?;
        ids.fields.push(FieldReference::new(owner, name, field_type));
    }

    let (count, offset) = header.method_ids;
    for i in 0..count as usize {
        let at = offset as usize + 8 * i;
        let owner = ids.class(read_u16(data, at)? as u32)?;
        let proto_index = read_u16(data, at + 2)? as usize;
        let prototype = ids
            .protos
            .get(proto_index)
            .cloned()
            .ok_or(ReadError::BadIndex("prototype", proto_index as u32))?;
        let name = ids.string(read_u32(data, at + 4)?)?;
        ids.methods.push(MethodReference::new(owner, name, prototype));
    }
    Ok(ids)
}

fn read_raw(data: &[u8], at: &mut usize, size: usize) -> Result<u64, ReadError> {
    let bytes = data.get(*at..*at + size).ok_or(ReadError::Truncated(*at))?;
    *at += size;
    Ok(bytes.iter().rev().fold(0u64, |acc, b| (acc << 8) | *b as u64))
}

fn sign_extend(value: u64, size: usize) -> i64 {
    let shift = 64 - 8 * size as u32;
    ((value << shift) as i64) >> shift
}

pub(crate) fn read_encoded_value(data: &[u8], at: &mut usize, ids: &IdSections) -> Result<EncodedValue, ReadError> {
    let header = read_u8(data, at)?;
    let value_type = header & 0x1f;
    let size = (header >> 5) as usize + 1;
    let too_wide = |limit: usize| {
        if size > limit {
            Err(ReadError::Malformed(format!("encoded value {:#x} of {} bytes", value_type, size)))
        } else {
            Ok(())
        }
    };

    let value = match value_type {
        VALUE_BYTE => EncodedValue::Byte(read_raw(data, at, 1)? as u8 as i8),
        VALUE_SHORT => EncodedValue::Short(sign_extend(read_raw(data, at, size)?, size) as i16),
        VALUE_CHAR => EncodedValue::Char(read_raw(data, at, size)? as u16),
        VALUE_INT => EncodedValue::Int(sign_extend(read_raw(data, at, size)?, size) as i32),
        VALUE_LONG => EncodedValue::Long(sign_extend(read_raw(data, at, size)?, size)),
        VALUE_FLOAT => {
            too_wide(4)?;
            EncodedValue::Float((read_raw(data, at, size)? << (8 * (4 - size))) as u32)
        }
        VALUE_DOUBLE => EncodedValue::Double(read_raw(data, at, size)? << (8 * (8 - size))),
        VALUE_STRING => EncodedValue::String(ids.string(read_raw(data, at, size)? as u32)?),
        VALUE_TYPE => EncodedValue::Type(ids.type_reference(read_raw(data, at, size)? as u32)?),
        VALUE_FIELD => EncodedValue::Field(ids.field(read_raw(data, at, size)? as u32)?),
        VALUE_METHOD => EncodedValue::Method(ids.method(read_raw(data, at, size)? as u32)?),
        VALUE_ENUM => EncodedValue::Enum(ids.field(read_raw(data, at, size)? as u32)?),
        VALUE_ARRAY => EncodedValue::Array(read_encoded_array(data, at, ids)?),
        VALUE_ANNOTATION => EncodedValue::Annotation(read_encoded_annotation(data, at, ids)?),
        VALUE_NULL => EncodedValue::Null,
        VALUE_BOOLEAN => EncodedValue::Boolean(size > 1),
        other => return Err(ReadError::Malformed(format!("encoded value type {:#x}", other))),
    };
    Ok(value)
}

fn read_encoded_array(data: &[u8], at: &mut usize, ids: &IdSections) -> Result<Vec<EncodedValue>, ReadError> {
    let size = read_uleb128(data, at)?;
    (0..size).map(|_| read_encoded_value(data, at, ids)).collect()
}

fn read_encoded_annotation(data: &[u8], at: &mut usize, ids: &IdSections) -> Result<EncodedAnnotation, ReadError> {
    let annotation_type = ids.type_reference(read_uleb128(data, at)?)?;
    let size = read_uleb128(data, at)?;
    let mut elements = Vec::with_capacity(size as usize);
    for _ in 0..size {
        let name = ids.string(read_uleb128(data, at)?)?;
        let value = read_encoded_value(data, at, ids)?;
        elements.push(AnnotationElement { name, value });
    }
    Ok(EncodedAnnotation {
        annotation_type,
        elements,
    })
}

fn read_annotation_set(data: &[u8], offset: u32, ids: &IdSections) -> Result<Vec<Annotation>, ReadError> {
    if offset == 0 {
        return Ok(Vec::new());
    }
    let size = read_u32(data, offset as usize)?;
    let mut annotations = Vec::with_capacity(size as usize);
    for i in 0..size as usize {
        let mut at = read_u32(data, offset as usize + 4 + 4 * i)? as usize;
        let visibility = match read_u8(data, &mut at)? {
            0 => AnnotationVisibility::Build,
            1 => AnnotationVisibility::Runtime,
            2 => AnnotationVisibility::System,
            other => return Err(ReadError::Malformed(format!("annotation visibility {}", other))),
        };
        let annotation = read_encoded_annotation(data, &mut at, ids)?;
        annotations.push(Annotation {
            visibility,
            annotation,
        });
    }
    Ok(annotations)
}

/// Member annotations of one class, keyed by field or method index
#[derive(Default)]
struct Directory {
    class: Vec<Annotation>,
    fields: HashMap<u32, Vec<Annotation>>,
    methods: HashMap<u32, Vec<Annotation>>,
}

fn read_directory(data: &[u8], offset: u32, ids: &IdSections) -> Result<Directory, ReadError> {
    if offset == 0 {
        return Ok(Directory::default());
    }
    let at = offset as usize;
    let class = read_annotation_set(data, read_u32(data, at)?, ids)?;
    let fields_size = read_u32(data, at + 4)? as usize;
    let methods_size = read_u32(data, at + 8)? as usize;
    let mut entry = at + 16;
    let mut fields = HashMap::new();
    for _ in 0..fields_size {
        fields.insert(read_u32(data, entry)?, read_annotation_set(data, read_u32(data, entry + 4)?, ids)?);
        entry += 8;
    }
    let mut methods = HashMap::new();
    for _ in 0..methods_size {
        methods.insert(read_u32(data, entry)?, read_annotation_set(data, read_u32(data, entry + 4)?, ids)?);
        entry += 8;
    }
    Ok(Directory {
        class,
        fields,
        methods,
    })
}

fn read_debug_info(data: &[u8], offset: u32) -> Result<Vec<(u32, u32)>, ReadError> {
    if offset == 0 {
        return Ok(Vec::new());
    }
    let mut at = offset as usize;
    let mut line = read_uleb128(data, &mut at)? as i64;
    let parameters = read_uleb128(data, &mut at)?;
    for _ in 0..parameters {
        read_uleb128p1(data, &mut at)?;
    }
    let mut address = 0i64;
    let mut lines = Vec::new();
    loop {
        let opcode = read_u8(data, &mut at)?;
        match opcode {
            DBG_END_SEQUENCE => break,
            DBG_ADVANCE_PC => address += read_uleb128(data, &mut at)? as i64,
            DBG_ADVANCE_LINE => line += read_sleb128(data, &mut at)? as i64,
            // start local, start local extended, end local, restart local
            0x03 => {
                read_uleb128(data, &mut at)?;
                read_uleb128p1(data, &mut at)?;
                read_uleb128p1(data, &mut at)?;
            }
            0x04 => {
                read_uleb128(data, &mut at)?;
                read_uleb128p1(data, &mut at)?;
                read_uleb128p1(data, &mut at)?;
                read_uleb128p1(data, &mut at)?;
            }
            0x05 | 0x06 => {
                read_uleb128(data, &mut at)?;
            }
            0x07 | 0x08 => {}
            0x09 => {
                read_uleb128p1(data, &mut at)?;
            }
            special => {
                let adjusted = (special - DBG_FIRST_SPECIAL) as i64;
                line += DBG_LINE_BASE + adjusted % DBG_LINE_RANGE;
                address += adjusted / DBG_LINE_RANGE;
                lines.push((address as u32, line as u32));
            }
        }
    }
    Ok(lines)
}

fn read_code(data: &[u8], offset: u32) -> Result<EncodedCode, ReadError> {
    let at = offset as usize;
    let registers_size = read_u16(data, at)?;
    let ins_size = read_u16(data, at + 2)?;
    let outs_size = read_u16(data, at + 4)?;
    let tries_size = read_u16(data, at + 6)? as usize;
    let debug_info_off = read_u32(data, at + 8)?;
    let insns_size = read_u32(data, at + 12)? as usize;
    let mut insns = Vec::with_capacity(insns_size);
    for i in 0..insns_size {
        insns.push(read_u16(data, at + 16 + 2 * i)?);
    }

    let mut tries = Vec::with_capacity(tries_size);
    let mut handlers = Vec::new();
    if tries_size > 0 {
        let mut tries_at = at + 16 + 2 * insns_size;
        if insns_size % 2 == 1 {
            tries_at += 2;
        }
        let list_at = tries_at + 8 * tries_size;
        let mut cursor = list_at;
        let count = read_uleb128(data, &mut cursor)?;
        let mut handler_offsets = HashMap::new();
        for index in 0..count as usize {
            handler_offsets.insert((cursor - list_at) as u16, index);
            let size = read_sleb128(data, &mut cursor)?;
            let mut catches = Vec::new();
            for _ in 0..size.unsigned_abs() {
                let type_index = read_uleb128(data, &mut cursor)?;
                let address = read_uleb128(data, &mut cursor)?;
                catches.push((type_index, address));
            }
            let catch_all = if size <= 0 {
                Some(read_uleb128(data, &mut cursor)?)
            } else {
                None
            };
            handlers.push(EncodedCatchHandler { catches, catch_all });
        }
        for i in 0..tries_size {
            let entry = tries_at + 8 * i;
            let handler_offset = read_u16(data, entry + 6)?;
            let handler = *handler_offsets
                .get(&handler_offset)
                .ok_or(ReadError::BadIndex("catch handler offset", handler_offset as u32))?;
            tries.push(EncodedTry {
                start_address: read_u32(data, entry)?,
                instruction_count: read_u16(data, entry + 4)?,
                handler,
            });
        }
    }

    Ok(EncodedCode {
        registers_size,
        ins_size,
        outs_size,
        insns,
        tries,
        handlers,
        lines: read_debug_info(data, debug_info_off)?,
    })
}

fn read_class(data: &[u8], at: usize, ids: &IdSections) -> Result<ClassDefinition, ReadError> {
    let class = ids.class(read_u32(data, at)?)?;
    let access = AccessFlags::from_bits_retain(read_u32(data, at + 4)?);
    let superclass = match read_u32(data, at + 8)? {
        NO_INDEX => None,
        index => Some(ids.class(index)?),
    };
    let interfaces = read_type_list(data, ids, read_u32(data, at + 12)?)?
        .into_iter()
        .map(|t| match t {
            TypeReference::Class(class) => Ok(class),
            other => Err(ReadError::Malformed(format!("interface {}", other))),
        })
        .collect::<Result<Vec<_>, _>>()?;
    let source_file = match read_u32(data, at + 16)? {
        NO_INDEX => None,
        index => Some(ids.string(index)?),
    };
    let mut directory = read_directory(data, read_u32(data, at + 20)?, ids)?;
    let class_data_off = read_u32(data, at + 24)?;
    let static_values_off = read_u32(data, at + 28)?;

    let mut definition = ClassDefinition::new(class, access, superclass);
    definition.interfaces = interfaces;
    definition.source_file = source_file;
    definition.annotations = directory.class.drain(..).collect();

    if class_data_off != 0 {
        let mut cursor = class_data_off as usize;
        let static_fields = read_uleb128(data, &mut cursor)?;
        let instance_fields = read_uleb128(data, &mut cursor)?;
        let direct_methods = read_uleb128(data, &mut cursor)?;
        let virtual_methods = read_uleb128(data, &mut cursor)?;
        for count in [static_fields, instance_fields] {
            let mut index = 0;
            for _ in 0..count {
                index += read_uleb128(data, &mut cursor)?;
                let access = AccessFlags::from_bits_retain(read_uleb128(data, &mut cursor)?);
                let mut field = FieldDefinition::new(ids.field(index)?, access);
                field.annotations = directory.fields.remove(&index).unwrap_or_default();
                definition.fields.push(field);
            }
        }
        for count in [direct_methods, virtual_methods] {
            let mut index = 0;
            for _ in 0..count {
                index += read_uleb128(data, &mut cursor)?;
                let access = AccessFlags::from_bits_retain(read_uleb128(data, &mut cursor)?);
                let code_off = read_uleb128(data, &mut cursor)?;
                let mut method = MethodDefinition::new(ids.method(index)?, access);
                if code_off != 0 {
                    let code = read_code(data, code_off)?;
                    method.body = Some(decode(&code, ids)?);
                }
                method.annotations = directory.methods.remove(&index).unwrap_or_default();
                definition.methods.push(method);
            }
        }
    }

    if static_values_off != 0 {
        let mut cursor = static_values_off as usize;
        let values = read_encoded_array(data, &mut cursor, ids)?;
        for (field, value) in definition
            .fields
            .iter_mut()
            .filter(|f| f.is_static())
            .zip(values)
        {
            field.value = Some(value);
        }
    }
    Ok(definition)
}

/// Parses a whole container
pub fn read(data: &[u8]) -> Result<DexFile, ReadError> {
    let header = read_header(data)?;
    let ids = read_ids(data, &header)?;
    let (count, offset) = header.class_defs;
    let mut classes = Vec::with_capacity(count as usize);
    for i in 0..count as usize {
        classes.push(read_class(data, offset as usize + 32 * i, &ids)?);
    }
    trace!("read {} classes, {} methods", classes.len(), ids.methods.len());
    Ok(DexFile { classes })
}

/// Parses only the id sections, enough to list the pools
pub fn read_ids_only(data: &[u8]) -> Result<IdSections, ReadError> {
    let header = read_header(data)?;
    read_ids(data, &header)
}
