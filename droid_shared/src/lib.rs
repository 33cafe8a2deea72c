//! Shared definitions for the droid target format.
//!
//! This crate knows about the container (a DEX 035 file), the register based
//! instructions stored inside of it and the identity map written next to it.
//! It does not know anything about the source representations the compiler reads.
pub mod types;
pub mod bytecode;
pub mod dexfile;
pub mod mapfile;
mod leb128;

pub use types::{ClassReference, FieldReference, MethodReference, Prototype, TypeReference};

use thiserror::Error;

/// The primitive types of the target runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PrimitiveType {
    Void,
    Boolean,
    Byte,
    Short,
    Char,
    Int,
    Long,
    Float,
    Double,
}

impl PrimitiveType {
    /// The single character descriptor of the primitive
    pub fn descriptor(self) -> char {
        match self {
            PrimitiveType::Void => 'V',
            PrimitiveType::Boolean => 'Z',
            PrimitiveType::Byte => 'B',
            PrimitiveType::Short => 'S',
            PrimitiveType::Char => 'C',
            PrimitiveType::Int => 'I',
            PrimitiveType::Long => 'J',
            PrimitiveType::Float => 'F',
            PrimitiveType::Double => 'D',
        }
    }

    pub fn from_descriptor(c: char) -> Option<PrimitiveType> {
        let primitive = match c {
            'V' => PrimitiveType::Void,
            'Z' => PrimitiveType::Boolean,
            'B' => PrimitiveType::Byte,
            'S' => PrimitiveType::Short,
            'C' => PrimitiveType::Char,
            'I' => PrimitiveType::Int,
            'J' => PrimitiveType::Long,
            'F' => PrimitiveType::Float,
            'D' => PrimitiveType::Double,
            _ => return None,
        };
        Some(primitive)
    }

    /// Long and double occupy a register pair
    pub fn is_wide(self) -> bool {
        matches!(self, PrimitiveType::Long | PrimitiveType::Double)
    }
}

/// Errors raised while building, canonicalizing or writing a container
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FormatError {
    #[error("reference to {0} has no entry in the {1} pool")]
    UnresolvedReference(String, &'static str),
    #[error("{0} and {1} compare equal in the {2} pool")]
    CanonicalizationConflict(String, String, &'static str),
    #[error("the {0} pool holds {1} entries, more than the format allows")]
    TooManyEntries(&'static str, usize),
    #[error("branch from instruction {from} to {to} is {distance} code units, out of range for {opcode}")]
    BranchOutOfRange {
        from: u32,
        to: u32,
        distance: i64,
        opcode: &'static str,
    },
    #[error("register v{register} does not fit operand {operand} of {opcode}")]
    RegisterOutOfRange {
        register: u16,
        operand: usize,
        opcode: &'static str,
    },
    #[error("instruction {0} is still referenced")]
    DanglingInstruction(u32),
    #[error("instruction {0} is not part of the method body")]
    UnknownInstruction(u32),
    #[error("class {0} inherits from itself")]
    CyclicInheritance(String),
    #[error("operand {operand} does not fit {opcode}")]
    OperandMismatch {
        operand: String,
        opcode: &'static str,
    },
}

/// Errors raised while reading a container back in
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ReadError {
    #[error("unexpected end of data at offset {0:#x}")]
    Truncated(usize),
    #[error("not a container, bad magic")]
    BadMagic,
    #[error("checksum mismatch, expected {expected:#010x} found {found:#010x}")]
    BadChecksum { expected: u32, found: u32 },
    #[error("{0} index {1} is out of range")]
    BadIndex(&'static str, u32),
    #[error("unknown opcode {0:#04x} at code unit {1}")]
    UnknownOpcode(u8, usize),
    #[error("malformed {0}")]
    Malformed(String),
}
