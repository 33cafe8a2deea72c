//! The register based instruction model.
//!
//! Instructions are kept symbolic: branch targets name other instructions by their
//! [`InstructionId`] and references to types or members are kept as values. Offsets and
//! pool indices only come into existence when a body is encoded.
pub mod opcodes;
pub mod body;
pub mod encode;
pub mod decode;

use std::fmt;

pub use body::{CatchClause, DebugInfo, DebugPosition, ExceptionHandler, InstructionRange, MethodBody};
pub use opcodes::{Access, Format, Opcode, RegisterUse};

use crate::types::{FieldReference, MethodReference, TypeReference};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RegisterKind {
    /// A 32-bit primitive
    Normal,
    /// The first half of a 64-bit pair, the second half lives at index + 1
    Wide,
    /// A reference
    Object,
}

impl RegisterKind {
    pub fn for_type(ty: &TypeReference) -> RegisterKind {
        if ty.is_wide() {
            RegisterKind::Wide
        } else if ty.is_reference() {
            RegisterKind::Object
        } else {
            RegisterKind::Normal
        }
    }

    pub fn width(self) -> u16 {
        match self {
            RegisterKind::Wide => 2,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Register {
    pub index: u16,
    pub kind: RegisterKind,
}

impl Register {
    pub fn new(index: u16, kind: RegisterKind) -> Register {
        Register { index, kind }
    }

    pub fn normal(index: u16) -> Register {
        Register::new(index, RegisterKind::Normal)
    }

    pub fn wide(index: u16) -> Register {
        Register::new(index, RegisterKind::Wide)
    }

    pub fn object(index: u16) -> Register {
        Register::new(index, RegisterKind::Object)
    }

    /// The second half of a wide register
    pub fn pair(self) -> Option<Register> {
        match self.kind {
            RegisterKind::Wide => Some(Register::normal(self.index + 1)),
            _ => None,
        }
    }

    /// Highest register index this operand touches
    pub fn last_index(self) -> u16 {
        self.index + self.kind.width() - 1
    }

    pub fn with_index(self, index: u16) -> Register {
        Register::new(index, self.kind)
    }

    /// Whether the whole operand fits in a register field of `bits` bits
    pub fn fits(self, bits: u8) -> bool {
        (self.last_index() as u32) < (1u32 << bits)
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.index)
    }
}

/// Stable identity of an instruction inside one method body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstructionId(pub(crate) u32);

impl InstructionId {
    pub fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Display for InstructionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The non-register operand of an instruction
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    None,
    /// Literal of const, const/4, const/16, const/high16 and the lit8/lit16 arithmetic forms
    Int(i32),
    /// Literal of the const-wide family
    Wide(i64),
    String(String),
    Type(TypeReference),
    Field(FieldReference),
    Method(MethodReference),
    /// Target of a goto or conditional branch
    Target(InstructionId),
    /// Jump table of a packed-switch, case `first_key + i` jumps to `targets[i]`
    PackedSwitch {
        first_key: i32,
        targets: Vec<InstructionId>,
    },
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::None => Ok(()),
            Operand::Int(value) => write!(f, "#{}", value),
            Operand::Wide(value) => write!(f, "#{}L", value),
            Operand::String(value) => write!(f, "{:?}", value),
            Operand::Type(ty) => write!(f, "{}", ty),
            Operand::Field(field) => write!(f, "{}", field),
            Operand::Method(method) => write!(f, "{}", method),
            Operand::Target(target) => write!(f, "{}", target),
            Operand::PackedSwitch { first_key, targets } => {
                write!(f, "{} -> [", first_key)?;
                for (i, target) in targets.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", target)?;
                }
                write!(f, "]")
            }
        }
    }
}

/// Kinds of the variable register list of an invoke, receiver first
pub fn argument_kinds(opcode: Opcode, operand: &Operand) -> Vec<RegisterKind> {
    let mut kinds = Vec::new();
    if let Operand::Method(method) = operand {
        if opcode.has_receiver() {
            kinds.push(RegisterKind::Object);
        }
        kinds.extend(method.prototype.parameters.iter().map(RegisterKind::for_type));
    }
    kinds
}

#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    id: InstructionId,
    pub opcode: Opcode,
    pub registers: Vec<Register>,
    pub operand: Operand,
}

impl Instruction {
    pub(crate) fn new(id: InstructionId, opcode: Opcode, registers: Vec<Register>, operand: Operand) -> Instruction {
        Instruction {
            id,
            opcode,
            registers,
            operand,
        }
    }

    pub fn id(&self) -> InstructionId {
        self.id
    }

    /// Every instruction this one can jump to
    pub fn targets(&self) -> Vec<InstructionId> {
        match &self.operand {
            Operand::Target(target) => vec![*target],
            Operand::PackedSwitch { targets, .. } => targets.clone(),
            _ => Vec::new(),
        }
    }

    /// Redirects jumps to `from` onto `to`, reporting whether anything changed
    pub fn retarget(&mut self, from: InstructionId, to: InstructionId) -> bool {
        match &mut self.operand {
            Operand::Target(target) if *target == from => {
                *target = to;
                true
            }
            Operand::PackedSwitch { targets, .. } => {
                let mut changed = false;
                for target in targets.iter_mut().filter(|t| **t == from) {
                    *target = to;
                    changed = true;
                }
                changed
            }
            _ => false,
        }
    }

    pub fn is_branch(&self) -> bool {
        !self.targets().is_empty()
    }

    /// Size in code units, not counting a switch payload
    pub fn size(&self) -> u32 {
        self.opcode.size()
    }

    /// Registers written by this instruction
    pub fn destinations(&self) -> impl Iterator<Item = Register> + '_ {
        let uses = self.opcode.register_uses();
        self.registers
            .iter()
            .zip(uses.iter())
            .filter(|(_, u)| u.access != Access::Read)
            .map(|(r, _)| *r)
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.opcode)?;
        for (i, register) in self.registers.iter().enumerate() {
            if i == 0 {
                write!(f, " {}", register)?;
            } else {
                write!(f, ", {}", register)?;
            }
        }
        if self.operand != Operand::None {
            if self.registers.is_empty() {
                write!(f, " {}", self.operand)?;
            } else {
                write!(f, ", {}", self.operand)?;
            }
        }
        Ok(())
    }
}
