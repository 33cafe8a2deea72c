//! This module defines the binary model of a container.
//!
//! A container holds class definitions, each with its fields, methods and annotations.
//! Definitions reference other entities by value; the [`collector`] turns those references
//! into sorted pools and the [`writer`] lays everything out on disk:
//! ```ignore
//! struct DexFile {
//!     header: Header,                   // magic, checksum, signature, section sizes and offsets
//!     string_ids: [u32; strings],       // offsets of string_data_item
//!     type_ids: [u32; types],           // string index of each descriptor
//!     proto_ids: [ProtoId; protos],
//!     field_ids: [FieldId; fields],
//!     method_ids: [MethodId; methods],
//!     class_defs: [ClassDef; classes],
//!     data: [u8],                       // lists, strings, code, annotations, class data
//!     map_list: MapList,                // last item of the data section
//! }
//! ```
pub mod collector;
pub mod writer;
pub mod reader;

use std::cmp::Ordering;

use bitflags::bitflags;

use crate::bytecode::MethodBody;
use crate::types::{compare_ordinal, ClassReference, FieldReference, MethodReference, TypeReference};

pub const DEX_MAGIC: &[u8; 8] = b"dex\n035\0";
pub const HEADER_SIZE: u32 = 0x70;
pub const ENDIAN_CONSTANT: u32 = 0x1234_5678;
pub const NO_INDEX: u32 = 0xffff_ffff;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub struct AccessFlags: u32 {
        const PUBLIC = 0x1;
        const PRIVATE = 0x2;
        const PROTECTED = 0x4;
        const STATIC = 0x8;
        const FINAL = 0x10;
        const SYNCHRONIZED = 0x20;
        const VOLATILE = 0x40;
        const BRIDGE = 0x40;
        const TRANSIENT = 0x80;
        const VARARGS = 0x80;
        const NATIVE = 0x100;
        const INTERFACE = 0x200;
        const ABSTRACT = 0x400;
        const STRICT = 0x800;
        const SYNTHETIC = 0x1000;
        const ANNOTATION = 0x2000;
        const ENUM = 0x4000;
        const CONSTRUCTOR = 0x10000;
        const DECLARED_SYNCHRONIZED = 0x20000;
    }
}

/// A constant as stored in static values and annotations.
/// Floating point values are kept as their bit patterns so that values stay comparable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EncodedValue {
    Byte(i8),
    Short(i16),
    Char(u16),
    Int(i32),
    Long(i64),
    Float(u32),
    Double(u64),
    String(String),
    Type(TypeReference),
    Field(FieldReference),
    Method(MethodReference),
    Enum(FieldReference),
    Array(Vec<EncodedValue>),
    Annotation(EncodedAnnotation),
    Null,
    Boolean(bool),
}

impl EncodedValue {
    /// The value a field of type `ty` holds before any initializer runs
    pub fn default_for(ty: &TypeReference) -> EncodedValue {
        use crate::PrimitiveType::*;
        match ty {
            TypeReference::Primitive(Boolean) => EncodedValue::Boolean(false),
            TypeReference::Primitive(Byte) => EncodedValue::Byte(0),
            TypeReference::Primitive(Short) => EncodedValue::Short(0),
            TypeReference::Primitive(Char) => EncodedValue::Char(0),
            TypeReference::Primitive(Int) => EncodedValue::Int(0),
            TypeReference::Primitive(Long) => EncodedValue::Long(0),
            TypeReference::Primitive(Float) => EncodedValue::Float(0),
            TypeReference::Primitive(Double) => EncodedValue::Double(0),
            _ => EncodedValue::Null,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AnnotationElement {
    pub name: String,
    pub value: EncodedValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EncodedAnnotation {
    pub annotation_type: TypeReference,
    pub elements: Vec<AnnotationElement>,
}

impl EncodedAnnotation {
    /// Elements in the order the container stores them, by name
    pub fn sorted_elements(&self) -> Vec<&AnnotationElement> {
        let mut elements: Vec<_> = self.elements.iter().collect();
        elements.sort_by(|a, b| compare_ordinal(&a.name, &b.name));
        elements
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AnnotationVisibility {
    Build = 0,
    Runtime = 1,
    System = 2,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Annotation {
    pub visibility: AnnotationVisibility,
    pub annotation: EncodedAnnotation,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldDefinition {
    pub reference: FieldReference,
    pub access: AccessFlags,
    /// Initial value of a static field
    pub value: Option<EncodedValue>,
    pub annotations: Vec<Annotation>,
}

impl FieldDefinition {
    pub fn new(reference: FieldReference, access: AccessFlags) -> FieldDefinition {
        FieldDefinition {
            reference,
            access,
            value: None,
            annotations: Vec::new(),
        }
    }

    pub fn is_static(&self) -> bool {
        self.access.contains(AccessFlags::STATIC)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MethodDefinition {
    pub reference: MethodReference,
    pub access: AccessFlags,
    pub body: Option<MethodBody>,
    pub annotations: Vec<Annotation>,
}

impl MethodDefinition {
    pub fn new(reference: MethodReference, access: AccessFlags) -> MethodDefinition {
        MethodDefinition {
            reference,
            access,
            body: None,
            annotations: Vec::new(),
        }
    }

    /// Direct methods are static, private or constructors; all others are dispatched virtually
    pub fn is_direct(&self) -> bool {
        self.access
            .intersects(AccessFlags::STATIC | AccessFlags::PRIVATE | AccessFlags::CONSTRUCTOR)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassDefinition {
    pub class: ClassReference,
    pub access: AccessFlags,
    pub superclass: Option<ClassReference>,
    pub interfaces: Vec<ClassReference>,
    pub source_file: Option<String>,
    pub annotations: Vec<Annotation>,
    pub fields: Vec<FieldDefinition>,
    pub methods: Vec<MethodDefinition>,
}

impl ClassDefinition {
    pub fn new(class: ClassReference, access: AccessFlags, superclass: Option<ClassReference>) -> ClassDefinition {
        ClassDefinition {
            class,
            access,
            superclass,
            interfaces: Vec::new(),
            source_file: None,
            annotations: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldDefinition> {
        self.fields.iter().find(|f| f.reference.name == name)
    }

    pub fn method(&self, reference: &MethodReference) -> Option<&MethodDefinition> {
        self.methods.iter().find(|m| &m.reference == reference)
    }

    pub fn method_mut(&mut self, reference: &MethodReference) -> Option<&mut MethodDefinition> {
        self.methods.iter_mut().find(|m| &m.reference == reference)
    }

    /// Sorts members into container order
    pub fn sort_members(&mut self) {
        self.fields.sort_by(compare_field_layout);
        self.methods.sort_by(compare_method_layout);
        self.annotations.sort_by(|a, b| a.annotation.annotation_type.cmp(&b.annotation.annotation_type));
    }
}

/// Static fields before instance fields, each group in field reference order
pub fn compare_field_layout(a: &FieldDefinition, b: &FieldDefinition) -> Ordering {
    b.is_static()
        .cmp(&a.is_static())
        .then_with(|| a.reference.cmp(&b.reference))
}

/// Direct methods before virtual methods, each group in method reference order
pub fn compare_method_layout(a: &MethodDefinition, b: &MethodDefinition) -> Ordering {
    b.is_direct()
        .cmp(&a.is_direct())
        .then_with(|| a.reference.cmp(&b.reference))
}

/// The binary model of one container
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DexFile {
    pub classes: Vec<ClassDefinition>,
}

impl DexFile {
    pub fn new() -> DexFile {
        DexFile::default()
    }

    pub fn class(&self, class: &ClassReference) -> Option<&ClassDefinition> {
        self.classes.iter().find(|c| &c.class == class)
    }

    pub fn class_mut(&mut self, class: &ClassReference) -> Option<&mut ClassDefinition> {
        self.classes.iter_mut().find(|c| &c.class == class)
    }

    /// Finds a method definition anywhere in the container
    pub fn method(&self, reference: &MethodReference) -> Option<&MethodDefinition> {
        self.class(&reference.owner)?.method(reference)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Prototype;

    #[test]
    fn test_member_layout() {
        let owner = ClassReference::new("LFoo;");
        let mut class = ClassDefinition::new(owner.clone(), AccessFlags::PUBLIC, Some(ClassReference::object()));
        class.fields.push(FieldDefinition::new(
            FieldReference::new(owner.clone(), "a", TypeReference::int()),
            AccessFlags::PUBLIC,
        ));
        class.fields.push(FieldDefinition::new(
            FieldReference::new(owner.clone(), "z", TypeReference::int()),
            AccessFlags::STATIC,
        ));
        let proto = Prototype::new(TypeReference::void(), vec![]);
        class.methods.push(MethodDefinition::new(
            MethodReference::new(owner.clone(), "run", proto.clone()),
            AccessFlags::PUBLIC,
        ));
        class.methods.push(MethodDefinition::new(
            MethodReference::new(owner, "<init>", proto),
            AccessFlags::PUBLIC | AccessFlags::CONSTRUCTOR,
        ));
        class.sort_members();

        assert_eq!(class.fields[0].reference.name, "z");
        assert_eq!(class.methods[0].reference.name, "<init>");
    }
}
