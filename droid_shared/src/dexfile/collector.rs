//! Canonicalization of a container: every referenced entity is collected once, counted, and
//! then sorted into a pool by the total order of its kind.
//!
//! Pools are complete before anything is written, so every index handed out afterwards is final.
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;

use log::trace;

use super::{Annotation, DexFile, EncodedValue};
use crate::bytecode::encode::IndexResolver;
use crate::bytecode::{MethodBody, Operand};
use crate::types::{compare_ordinal, ClassReference, FieldReference, MethodReference, Prototype, TypeReference};
use crate::FormatError;

/// Entities of one kind in container order
#[derive(Debug, Clone)]
pub struct Pool<T> {
    entries: Vec<T>,
    frequencies: Vec<usize>,
    indices: HashMap<T, u32>,
}

impl<T: Clone + Eq + Hash + Display> Pool<T> {
    fn build(
        counts: HashMap<T, usize>,
        compare: impl Fn(&T, &T) -> Ordering,
        kind: &'static str,
    ) -> Result<Pool<T>, FormatError> {
        let mut counted: Vec<(T, usize)> = counts.into_iter().collect();
        counted.sort_by(|a, b| compare(&a.0, &b.0));
        for pair in counted.windows(2) {
            if compare(&pair[0].0, &pair[1].0) == Ordering::Equal {
                return Err(FormatError::CanonicalizationConflict(
                    pair[0].0.to_string(),
                    pair[1].0.to_string(),
                    kind,
                ));
            }
        }
        let mut entries = Vec::with_capacity(counted.len());
        let mut frequencies = Vec::with_capacity(counted.len());
        let mut indices = HashMap::with_capacity(counted.len());
        for (index, (entry, count)) in counted.into_iter().enumerate() {
            indices.insert(entry.clone(), index as u32);
            entries.push(entry);
            frequencies.push(count);
        }
        trace!("{} pool holds {} entries", kind, entries.len());
        Ok(Pool {
            entries,
            frequencies,
            indices,
        })
    }

    pub fn index(&self, value: &T) -> Option<u32> {
        self.indices.get(value).copied()
    }

    pub fn entries(&self) -> &[T] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// How many times the entry at `index` was referenced
    pub fn frequency(&self, index: u32) -> usize {
        self.frequencies.get(index as usize).copied().unwrap_or(0)
    }
}

impl Display for Annotation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "@{} {:?}", self.annotation.annotation_type, self.visibility)
    }
}

/// Counts every entity a container references
#[derive(Debug, Default)]
pub struct Collector {
    strings: HashMap<String, usize>,
    types: HashMap<TypeReference, usize>,
    protos: HashMap<Prototype, usize>,
    fields: HashMap<FieldReference, usize>,
    methods: HashMap<MethodReference, usize>,
    annotations: HashMap<Annotation, usize>,
}

impl Collector {
    pub fn new() -> Collector {
        Collector::default()
    }

    pub fn add_string(&mut self, value: &str) {
        *self.strings.entry(value.to_string()).or_insert(0) += 1;
    }

    pub fn add_type(&mut self, ty: &TypeReference) {
        self.add_string(&ty.descriptor());
        *self.types.entry(ty.clone()).or_insert(0) += 1;
    }

    pub fn add_class(&mut self, class: &ClassReference) {
        self.add_type(&TypeReference::Class(class.clone()));
    }

    pub fn add_prototype(&mut self, proto: &Prototype) {
        self.add_string(&proto.shorty());
        self.add_type(&proto.return_type);
        for parameter in proto.parameters.iter() {
            self.add_type(parameter);
        }
        *self.protos.entry(proto.clone()).or_insert(0) += 1;
    }

    pub fn add_field(&mut self, field: &FieldReference) {
        self.add_class(&field.owner);
        self.add_string(&field.name);
        self.add_type(&field.field_type);
        *self.fields.entry(field.clone()).or_insert(0) += 1;
    }

    pub fn add_method(&mut self, method: &MethodReference) {
        self.add_class(&method.owner);
        self.add_string(&method.name);
        self.add_prototype(&method.prototype);
        *self.methods.entry(method.clone()).or_insert(0) += 1;
    }

    pub fn add_value(&mut self, value: &EncodedValue) {
        match value {
            EncodedValue::String(value) => self.add_string(value),
            EncodedValue::Type(ty) => self.add_type(ty),
            EncodedValue::Field(field) | EncodedValue::Enum(field) => self.add_field(field),
            EncodedValue::Method(method) => self.add_method(method),
            EncodedValue::Array(values) => values.iter().for_each(|v| self.add_value(v)),
            EncodedValue::Annotation(annotation) => {
                self.add_type(&annotation.annotation_type);
                for element in annotation.elements.iter() {
                    self.add_string(&element.name);
                    self.add_value(&element.value);
                }
            }
            _ => {}
        }
    }

    pub fn add_annotation(&mut self, annotation: &Annotation) {
        self.add_value(&EncodedValue::Annotation(annotation.annotation.clone()));
        *self.annotations.entry(annotation.clone()).or_insert(0) += 1;
    }

    pub fn add_body(&mut self, body: &MethodBody) {
        for instruction in body.instructions() {
            match &instruction.operand {
                Operand::String(value) => self.add_string(value),
                Operand::Type(ty) => self.add_type(ty),
                Operand::Field(field) => self.add_field(field),
                Operand::Method(method) => self.add_method(method),
                _ => {}
            }
        }
        for handler in body.exception_handlers.iter() {
            for clause in handler.catches.iter() {
                self.add_class(&clause.exception_type);
            }
        }
    }

    pub fn add_file(&mut self, dex: &DexFile) {
        for class in dex.classes.iter() {
            self.add_class(&class.class);
            if let Some(superclass) = &class.superclass {
                self.add_class(superclass);
            }
            for interface in class.interfaces.iter() {
                self.add_class(interface);
            }
            if let Some(source_file) = &class.source_file {
                self.add_string(source_file);
            }
            class.annotations.iter().for_each(|a| self.add_annotation(a));
            for field in class.fields.iter() {
                self.add_field(&field.reference);
                if let Some(value) = &field.value {
                    self.add_value(value);
                }
                field.annotations.iter().for_each(|a| self.add_annotation(a));
            }
            for method in class.methods.iter() {
                self.add_method(&method.reference);
                if let Some(body) = &method.body {
                    self.add_body(body);
                }
                method.annotations.iter().for_each(|a| self.add_annotation(a));
            }
        }
    }

    /// Sorts every pool. Fails when two distinct entities compare equal.
    pub fn finish(self) -> Result<Pools, FormatError> {
        Ok(Pools {
            strings: Pool::build(self.strings, |a, b| compare_ordinal(a, b), "string")?,
            types: Pool::build(self.types, TypeReference::cmp, "type")?,
            protos: Pool::build(self.protos, Prototype::cmp, "prototype")?,
            fields: Pool::build(self.fields, FieldReference::cmp, "field")?,
            methods: Pool::build(self.methods, MethodReference::cmp, "method")?,
            annotations: Pool::build(self.annotations, Annotation::cmp, "annotation")?,
        })
    }
}

/// The sorted pools of one container
#[derive(Debug, Clone)]
pub struct Pools {
    pub strings: Pool<String>,
    pub types: Pool<TypeReference>,
    pub protos: Pool<Prototype>,
    pub fields: Pool<FieldReference>,
    pub methods: Pool<MethodReference>,
    pub annotations: Pool<Annotation>,
}

impl Pools {
    pub fn proto_index(&self, proto: &Prototype) -> Result<u32, FormatError> {
        self.protos
            .index(proto)
            .ok_or_else(|| FormatError::UnresolvedReference(proto.to_string(), "prototype"))
    }

    pub fn class_index(&self, class: &ClassReference) -> Result<u32, FormatError> {
        self.type_index(&TypeReference::Class(class.clone()))
    }
}

impl IndexResolver for Pools {
    fn string_index(&self, value: &str) -> Result<u32, FormatError> {
        self.strings
            .index(&value.to_string())
            .ok_or_else(|| FormatError::UnresolvedReference(format!("{:?}", value), "string"))
    }

    fn type_index(&self, ty: &TypeReference) -> Result<u32, FormatError> {
        self.types
            .index(ty)
            .ok_or_else(|| FormatError::UnresolvedReference(ty.to_string(), "type"))
    }

    fn field_index(&self, field: &FieldReference) -> Result<u32, FormatError> {
        self.fields
            .index(field)
            .ok_or_else(|| FormatError::UnresolvedReference(field.to_string(), "field"))
    }

    fn method_index(&self, method: &MethodReference) -> Result<u32, FormatError> {
        self.methods
            .index(method)
            .ok_or_else(|| FormatError::UnresolvedReference(method.to_string(), "method"))
    }
}

/// Collects and sorts every entity referenced by `dex`
pub fn canonicalize(dex: &DexFile) -> Result<Pools, FormatError> {
    let mut collector = Collector::new();
    collector.add_file(dex);
    collector.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{Opcode, Register};
    use crate::dexfile::{AccessFlags, ClassDefinition, MethodDefinition};

    #[test]
    fn test_pools_are_sorted_and_counted() {
        let owner = ClassReference::new("LFoo;");
        let mut class = ClassDefinition::new(owner.clone(), AccessFlags::PUBLIC, Some(ClassReference::object()));
        let run = MethodReference::new(owner.clone(), "run", Prototype::new(TypeReference::void(), vec![]));
        let mut body = MethodBody::new(1, 1);
        body.push(Opcode::ConstString, vec![Register::object(0)], Operand::String("zebra".into()));
        body.push(Opcode::ConstString, vec![Register::object(0)], Operand::String("apple".into()));
        body.push(Opcode::ReturnVoid, vec![], Operand::None);
        let mut method = MethodDefinition::new(run.clone(), AccessFlags::PUBLIC);
        method.body = Some(body);
        class.methods.push(method);
        let dex = DexFile { classes: vec![class] };

        let pools = canonicalize(&dex).unwrap();
        let strings = pools.strings.entries();
        let mut sorted = strings.to_vec();
        sorted.sort_by(|a, b| compare_ordinal(a, b));
        assert_eq!(strings, sorted.as_slice());
        assert!(strings.contains(&"LFoo;".to_string()));
        assert!(strings.contains(&"V".to_string()));

        let foo = pools.class_index(&owner).unwrap();
        assert!(pools.types.frequency(foo) >= 2);
        assert_eq!(pools.method_index(&run).unwrap(), 0);
        assert!(pools.string_index("missing").is_err());
    }

    #[test]
    fn test_conflict_is_reported() {
        // Two distinct values with the same descriptor cannot share one pool slot.
        let mut collector = Collector::new();
        collector.add_type(&TypeReference::int());
        collector.add_type(&TypeReference::class("I"));
        assert!(matches!(
            collector.finish(),
            Err(FormatError::CanonicalizationConflict(_, _, "type"))
        ));
    }
}
