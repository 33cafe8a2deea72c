//! The vocabulary shared by every tree the compiler handles.
//!
//! Inputs arrive either as structured high level IR ([`hir`]) or as imported stack bytecode
//! ([`bytecode`]). Both are turned into the unified [`ast`] before any conversion runs.
pub mod ast;
pub mod bytecode;
pub mod hir;

use std::fmt;

use serde::{Deserialize, Serialize};

/// Where a node came from in the source document
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SourceLocation {
    #[serde(default)]
    pub document: String,
    #[serde(default)]
    pub line: u32,
    #[serde(default)]
    pub column: u32,
}

impl SourceLocation {
    pub fn new(document: impl Into<String>, line: u32, column: u32) -> Self {
        SourceLocation {
            document: document.into(),
            line,
            column,
        }
    }

    /// Line zero means the front end had no position for the node
    pub fn is_known(&self) -> bool {
        self.line > 0
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.document.is_empty() {
            write!(f, "<unknown>:{}:{}", self.line, self.column)
        } else {
            write!(f, "{}:{}:{}", self.document, self.line, self.column)
        }
    }
}

/// A type as the source inputs spell it
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeRef {
    Void,
    Bool,
    I8,
    U8,
    I16,
    U16,
    Char,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    String,
    Object,
    /// A type by its full name, nested types separated with `/`
    Named(String),
    /// An instantiation of a generic type
    Generic(String, Vec<TypeRef>),
    Array(Box<TypeRef>),
    Nullable(Box<TypeRef>),
    /// A type parameter of the enclosing type or method
    TypeParameter(String),
    /// A container descriptor that needs no conversion, used for synthesized classes
    Descriptor(String),
    /// The storage location behind a `ref` or `out` parameter
    ByRef(Box<TypeRef>),
}

/// How a value of a type is held in registers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StackKind {
    Void,
    Int,
    Long,
    Float,
    Double,
    Reference,
}

impl TypeRef {
    pub fn named(name: impl Into<String>) -> TypeRef {
        TypeRef::Named(name.into())
    }

    pub fn array_of(element: TypeRef) -> TypeRef {
        TypeRef::Array(Box::new(element))
    }

    pub fn nullable_of(inner: TypeRef) -> TypeRef {
        TypeRef::Nullable(Box::new(inner))
    }

    pub fn by_ref_of(referent: TypeRef) -> TypeRef {
        TypeRef::ByRef(Box::new(referent))
    }

    pub fn stack_kind(&self) -> StackKind {
        match self {
            TypeRef::Void => StackKind::Void,
            TypeRef::Bool
            | TypeRef::I8
            | TypeRef::U8
            | TypeRef::I16
            | TypeRef::U16
            | TypeRef::Char
            | TypeRef::I32
            | TypeRef::U32 => StackKind::Int,
            TypeRef::I64 | TypeRef::U64 => StackKind::Long,
            TypeRef::F32 => StackKind::Float,
            TypeRef::F64 => StackKind::Double,
            _ => StackKind::Reference,
        }
    }

    pub fn is_void(&self) -> bool {
        matches!(self, TypeRef::Void)
    }

    pub fn is_primitive(&self) -> bool {
        !matches!(self.stack_kind(), StackKind::Reference | StackKind::Void)
    }

    pub fn is_reference(&self) -> bool {
        self.stack_kind() == StackKind::Reference
    }

    pub fn is_wide(&self) -> bool {
        matches!(self.stack_kind(), StackKind::Long | StackKind::Double)
    }

    pub fn is_integer(&self) -> bool {
        matches!(self.stack_kind(), StackKind::Int | StackKind::Long) && *self != TypeRef::Bool
    }

    pub fn is_unsigned(&self) -> bool {
        matches!(self, TypeRef::U8 | TypeRef::U16 | TypeRef::U32 | TypeRef::U64 | TypeRef::Char)
    }

    /// Integer types narrower than a register
    pub fn is_small_integer(&self) -> bool {
        matches!(
            self,
            TypeRef::I8 | TypeRef::U8 | TypeRef::I16 | TypeRef::U16 | TypeRef::Char
        )
    }

    /// Full name of a named or generic type
    pub fn type_name(&self) -> Option<&str> {
        match self {
            TypeRef::Named(name) | TypeRef::Generic(name, _) => Some(name),
            _ => None,
        }
    }

    pub fn element(&self) -> Option<&TypeRef> {
        match self {
            TypeRef::Array(element) => Some(element),
            _ => None,
        }
    }

    pub fn nullable_inner(&self) -> Option<&TypeRef> {
        match self {
            TypeRef::Nullable(inner) => Some(inner),
            _ => None,
        }
    }

    pub fn referent(&self) -> Option<&TypeRef> {
        match self {
            TypeRef::ByRef(referent) => Some(referent),
            _ => None,
        }
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeRef::Void => write!(f, "void"),
            TypeRef::Bool => write!(f, "bool"),
            TypeRef::I8 => write!(f, "sbyte"),
            TypeRef::U8 => write!(f, "byte"),
            TypeRef::I16 => write!(f, "short"),
            TypeRef::U16 => write!(f, "ushort"),
            TypeRef::Char => write!(f, "char"),
            TypeRef::I32 => write!(f, "int"),
            TypeRef::U32 => write!(f, "uint"),
            TypeRef::I64 => write!(f, "long"),
            TypeRef::U64 => write!(f, "ulong"),
            TypeRef::F32 => write!(f, "float"),
            TypeRef::F64 => write!(f, "double"),
            TypeRef::String => write!(f, "string"),
            TypeRef::Object => write!(f, "object"),
            TypeRef::Named(name) => write!(f, "{}", name),
            TypeRef::Generic(name, arguments) => {
                write!(f, "{}<", name)?;
                for (i, argument) in arguments.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", argument)?;
                }
                write!(f, ">")
            }
            TypeRef::Array(element) => write!(f, "{}[]", element),
            TypeRef::Nullable(inner) => write!(f, "{}?", inner),
            TypeRef::TypeParameter(name) => write!(f, "!{}", name),
            TypeRef::Descriptor(descriptor) => write!(f, "{}", descriptor),
            TypeRef::ByRef(referent) => write!(f, "ref {}", referent),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldRef {
    pub owner: TypeRef,
    pub name: String,
    pub field_type: TypeRef,
}

impl FieldRef {
    pub fn new(owner: TypeRef, name: impl Into<String>, field_type: TypeRef) -> Self {
        FieldRef {
            owner,
            name: name.into(),
            field_type,
        }
    }
}

impl fmt::Display for FieldRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.owner, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MethodRef {
    pub owner: TypeRef,
    pub name: String,
    #[serde(default)]
    pub parameters: Vec<TypeRef>,
    pub return_type: TypeRef,
    #[serde(default)]
    pub is_static: bool,
    /// Type arguments of a generic method instantiation
    #[serde(default)]
    pub generic_arguments: Vec<TypeRef>,
}

impl MethodRef {
    pub fn new(owner: TypeRef, name: impl Into<String>, parameters: Vec<TypeRef>, return_type: TypeRef) -> Self {
        MethodRef {
            owner,
            name: name.into(),
            parameters,
            return_type,
            is_static: false,
            generic_arguments: Vec::new(),
        }
    }

    pub fn new_static(owner: TypeRef, name: impl Into<String>, parameters: Vec<TypeRef>, return_type: TypeRef) -> Self {
        MethodRef {
            is_static: true,
            ..MethodRef::new(owner, name, parameters, return_type)
        }
    }

    pub fn is_constructor(&self) -> bool {
        self.name == ".ctor"
    }
}

impl fmt::Display for MethodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}(", self.owner, self.name)?;
        for (i, parameter) in self.parameters.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", parameter)?;
        }
        write!(f, ")")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOperator {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    ShrUn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnaryOperator {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOperator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOperator {
    pub fn negate(self) -> CompareOperator {
        match self {
            CompareOperator::Eq => CompareOperator::Ne,
            CompareOperator::Ne => CompareOperator::Eq,
            CompareOperator::Lt => CompareOperator::Ge,
            CompareOperator::Ge => CompareOperator::Lt,
            CompareOperator::Gt => CompareOperator::Le,
            CompareOperator::Le => CompareOperator::Gt,
        }
    }
}

/// A literal value of a source tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Constant {
    Null,
    Bool(bool),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
    Char(u16),
}

impl Constant {
    /// The type a literal has when nothing else is known
    pub fn natural_type(&self) -> TypeRef {
        match self {
            Constant::Null => TypeRef::Object,
            Constant::Bool(_) => TypeRef::Bool,
            Constant::Int(_) => TypeRef::I32,
            Constant::Long(_) => TypeRef::I64,
            Constant::Float(_) => TypeRef::F32,
            Constant::Double(_) => TypeRef::F64,
            Constant::String(_) => TypeRef::String,
            Constant::Char(_) => TypeRef::Char,
        }
    }

    /// Integral value of the literal, if it has one
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Constant::Bool(value) => Some(*value as i64),
            Constant::Int(value) => Some(*value as i64),
            Constant::Long(value) => Some(*value),
            Constant::Char(value) => Some(*value as i64),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_kinds() {
        assert_eq!(TypeRef::U8.stack_kind(), StackKind::Int);
        assert_eq!(TypeRef::U64.stack_kind(), StackKind::Long);
        assert!(TypeRef::F64.is_wide());
        assert!(TypeRef::nullable_of(TypeRef::I32).is_reference());
        assert!(!TypeRef::Bool.is_integer());
        assert!(TypeRef::Char.is_small_integer());
        assert!(TypeRef::by_ref_of(TypeRef::I32).is_reference());
    }

    #[test]
    fn test_json_shape() {
        let ty: TypeRef = serde_json::from_str(r#"{"array": {"named": "App.Color"}}"#).unwrap();
        assert_eq!(ty, TypeRef::array_of(TypeRef::named("App.Color")));
        let ty: TypeRef = serde_json::from_str(r#"{"by_ref": "i32"}"#).unwrap();
        assert_eq!(ty.referent(), Some(&TypeRef::I32));
        let method: MethodRef = serde_json::from_str(
            r#"{"owner": "object", "name": ".ctor", "return_type": "void"}"#,
        )
        .unwrap();
        assert!(method.is_constructor());
        assert!(!method.is_static);
        assert_eq!(method.to_string(), "object::.ctor()");
    }
}
