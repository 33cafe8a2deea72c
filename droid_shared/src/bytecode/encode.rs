//! Turns a symbolic [`MethodBody`] into code units.
//!
//! Layout of the encoded instruction stream:
//! ```ignore
//! struct Insns {
//!     instructions: [u16; n],       // every instruction in body order
//!     padding: [u16; 0 or 1],       // a nop so that payloads start on an even unit
//!     payloads: [SwitchPayload; m], // one per packed-switch, in instruction order
//! }
//!
//! struct SwitchPayload {
//!     ident: u16,                   // 0x0100
//!     size: u16,
//!     first_key: i32,
//!     targets: [i32; size],         // relative to the packed-switch instruction
//! }
//! ```
use std::collections::HashMap;

use super::{Format, Instruction, InstructionId, MethodBody, Opcode, Operand, Register};
use crate::types::{FieldReference, MethodReference, TypeReference};
use crate::FormatError;

pub const PACKED_SWITCH_IDENT: u16 = 0x0100;

/// Maps references to pool indices while instructions are encoded
pub trait IndexResolver {
    fn string_index(&self, value: &str) -> Result<u32, FormatError>;
    fn type_index(&self, ty: &TypeReference) -> Result<u32, FormatError>;
    fn field_index(&self, field: &FieldReference) -> Result<u32, FormatError>;
    fn method_index(&self, method: &MethodReference) -> Result<u32, FormatError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedTry {
    pub start_address: u32,
    pub instruction_count: u16,
    /// Index into [`EncodedCode::handlers`]
    pub handler: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EncodedCatchHandler {
    /// `(type index, handler address)` pairs
    pub catches: Vec<(u32, u32)>,
    pub catch_all: Option<u32>,
}

/// A method body expressed with addresses and pool indices, ready for a `code_item`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedCode {
    pub registers_size: u16,
    pub ins_size: u16,
    pub outs_size: u16,
    pub insns: Vec<u16>,
    pub tries: Vec<EncodedTry>,
    pub handlers: Vec<EncodedCatchHandler>,
    /// `(address, line)` pairs of the line table, in address order
    pub lines: Vec<(u32, u32)>,
}

pub fn encode(body: &mut MethodBody, resolver: &dyn IndexResolver) -> Result<EncodedCode, FormatError> {
    body.flatten_exception_handlers();
    let offsets = body.offsets();
    let code_units = body.code_units();

    let mut payload_addresses = HashMap::new();
    let mut payload_address = code_units + code_units % 2;
    for instruction in body.instructions() {
        if let Operand::PackedSwitch { targets, .. } = &instruction.operand {
            payload_addresses.insert(instruction.id(), payload_address);
            payload_address += 4 + 2 * targets.len() as u32;
        }
    }

    let address_of = |id: InstructionId| -> Result<u32, FormatError> {
        body.position(id)
            .map(|index| offsets[index])
            .ok_or(FormatError::UnknownInstruction(id.value()))
    };

    let mut insns = Vec::with_capacity(payload_address as usize);
    let mut payloads = Vec::new();
    for (index, instruction) in body.instructions().iter().enumerate() {
        let address = offsets[index];
        let mut encoder = InstructionEncoder {
            instruction,
            address,
            resolver,
            out: &mut insns,
        };
        match &instruction.operand {
            Operand::PackedSwitch { first_key, targets } => {
                let payload = payload_addresses
                    .get(&instruction.id())
                    .copied()
                    .unwrap_or(address);
                encoder.encode_with_target(payload)?;
                payloads.push(PACKED_SWITCH_IDENT);
                payloads.push(targets.len() as u16);
                push_u32(&mut payloads, *first_key as u32);
                for target in targets {
                    let relative = address_of(*target)? as i64 - address as i64;
                    push_u32(&mut payloads, relative as i32 as u32);
                }
            }
            Operand::Target(target) => {
                let target = address_of(*target)?;
                encoder.encode_with_target(target)?;
            }
            _ => encoder.encode_plain()?,
        }
    }
    if !payloads.is_empty() {
        if insns.len() % 2 == 1 {
            insns.push(Opcode::Nop as u16);
        }
        insns.extend(payloads);
    }

    let mut tries = Vec::new();
    let mut handlers: Vec<EncodedCatchHandler> = Vec::new();
    let mut handler_indices: HashMap<EncodedCatchHandler, usize> = HashMap::new();
    for handler in body.exception_handlers.iter() {
        let start = address_of(handler.range.first)?;
        let last = body
            .instruction(handler.range.last)
            .ok_or(FormatError::UnknownInstruction(handler.range.last.value()))?;
        let end = address_of(handler.range.last)? + last.size();
        let count = end.saturating_sub(start);
        if count > u16::MAX as u32 {
            return Err(FormatError::TooManyEntries("try range", count as usize));
        }

        let mut catches = Vec::new();
        for clause in handler.catches.iter() {
            let ty = TypeReference::Class(clause.exception_type.clone());
            catches.push((resolver.type_index(&ty)?, address_of(clause.handler)?));
        }
        let catch_all = handler.catch_all.map(address_of).transpose()?;
        let encoded = EncodedCatchHandler { catches, catch_all };
        let index = match handler_indices.get(&encoded) {
            Some(index) => *index,
            None => {
                handlers.push(encoded.clone());
                handler_indices.insert(encoded, handlers.len() - 1);
                handlers.len() - 1
            }
        };
        tries.push(EncodedTry {
            start_address: start,
            instruction_count: count as u16,
            handler: index,
        });
    }

    let mut lines = Vec::new();
    for position in body.debug_info.positions.iter() {
        lines.push((address_of(position.instruction)?, position.line));
    }

    Ok(EncodedCode {
        registers_size: body.registers_size,
        ins_size: body.ins_size,
        outs_size: body.outs_size,
        insns,
        tries,
        handlers,
        lines,
    })
}

fn push_u32(out: &mut Vec<u16>, value: u32) {
    out.push(value as u16);
    out.push((value >> 16) as u16);
}

struct InstructionEncoder<'a> {
    instruction: &'a Instruction,
    address: u32,
    resolver: &'a dyn IndexResolver,
    out: &'a mut Vec<u16>,
}

impl InstructionEncoder<'_> {
    fn name(&self) -> &'static str {
        self.instruction.opcode.name()
    }

    fn register(&self, operand: usize) -> Result<u16, FormatError> {
        let bits = self.instruction.opcode.format().register_bits();
        let register = self.instruction.registers.get(operand).ok_or_else(|| {
            FormatError::OperandMismatch {
                operand: format!("missing register {}", operand),
                opcode: self.name(),
            }
        })?;
        let limit = bits.get(operand).copied().unwrap_or(16);
        if !register.fits(limit) {
            return Err(FormatError::RegisterOutOfRange {
                register: register.index,
                operand,
                opcode: self.name(),
            });
        }
        Ok(register.index)
    }

    fn mismatch(&self) -> FormatError {
        FormatError::OperandMismatch {
            operand: self.instruction.operand.to_string(),
            opcode: self.name(),
        }
    }

    fn literal(&self) -> Result<i64, FormatError> {
        match self.instruction.operand {
            Operand::Int(value) => Ok(value as i64),
            Operand::Wide(value) => Ok(value),
            _ => Err(self.mismatch()),
        }
    }

    fn checked_literal(&self, low: i64, high: i64) -> Result<i64, FormatError> {
        let value = self.literal()?;
        if value < low || value > high {
            return Err(self.mismatch());
        }
        Ok(value)
    }

    fn index(&self) -> Result<u32, FormatError> {
        match &self.instruction.operand {
            Operand::String(value) => self.resolver.string_index(value),
            Operand::Type(ty) => self.resolver.type_index(ty),
            Operand::Field(field) => self.resolver.field_index(field),
            Operand::Method(method) => self.resolver.method_index(method),
            _ => Err(self.mismatch()),
        }
    }

    fn index16(&self) -> Result<u16, FormatError> {
        let index = self.index()?;
        if index > u16::MAX as u32 {
            return Err(FormatError::TooManyEntries(self.name(), index as usize + 1));
        }
        Ok(index as u16)
    }

    fn op(&self) -> u16 {
        self.instruction.opcode as u16
    }

    fn encode_with_target(&mut self, target: u32) -> Result<(), FormatError> {
        let distance = target as i64 - self.address as i64;
        let out_of_range = || FormatError::BranchOutOfRange {
            from: self.address,
            to: target,
            distance,
            opcode: self.name(),
        };
        let units = match self.instruction.opcode.format() {
            Format::F10t => {
                if distance < i8::MIN as i64 || distance > i8::MAX as i64 || distance == 0 {
                    return Err(out_of_range());
                }
                vec![self.op() | ((distance as i8 as u8 as u16) << 8)]
            }
            Format::F20t => {
                if distance < i16::MIN as i64 || distance > i16::MAX as i64 || distance == 0 {
                    return Err(out_of_range());
                }
                vec![self.op(), distance as i16 as u16]
            }
            Format::F30t => vec![self.op(), distance as u32 as u16, ((distance as u32) >> 16) as u16],
            Format::F21t => {
                if distance < i16::MIN as i64 || distance > i16::MAX as i64 {
                    return Err(out_of_range());
                }
                let a = self.register(0)?;
                vec![self.op() | (a << 8), distance as i16 as u16]
            }
            Format::F22t => {
                if distance < i16::MIN as i64 || distance > i16::MAX as i64 {
                    return Err(out_of_range());
                }
                let a = self.register(0)?;
                let b = self.register(1)?;
                vec![self.op() | (a << 8) | (b << 12), distance as i16 as u16]
            }
            Format::F31t => {
                let a = self.register(0)?;
                vec![self.op() | (a << 8), distance as u32 as u16, ((distance as u32) >> 16) as u16]
            }
            _ => return Err(self.mismatch()),
        };
        self.out.extend(units);
        Ok(())
    }

    fn encode_plain(&mut self) -> Result<(), FormatError> {
        let opcode = self.instruction.opcode;
        let op = self.op();
        let units = match opcode.format() {
            Format::F10x => vec![op],
            Format::F12x => {
                let a = self.register(0)?;
                let b = self.register(1)?;
                vec![op | (a << 8) | (b << 12)]
            }
            Format::F11n => {
                let a = self.register(0)?;
                let literal = self.checked_literal(-8, 7)?;
                vec![op | (a << 8) | (((literal as u16) & 0xf) << 12)]
            }
            Format::F11x => vec![op | (self.register(0)? << 8)],
            Format::F22x => vec![op | (self.register(0)? << 8), self.register(1)?],
            Format::F32x => vec![op, self.register(0)?, self.register(1)?],
            Format::F21s => {
                let a = self.register(0)?;
                let literal = self.checked_literal(i16::MIN as i64, i16::MAX as i64)?;
                vec![op | (a << 8), literal as i16 as u16]
            }
            Format::F21h => {
                let a = self.register(0)?;
                let value = self.literal()?;
                let (shift, mask) = if opcode == Opcode::ConstWideHigh16 {
                    (48, 0x0000_ffff_ffff_ffffu64 as i64)
                } else {
                    (16, 0xffff)
                };
                if value & mask != 0 {
                    return Err(self.mismatch());
                }
                vec![op | (a << 8), (value >> shift) as u16]
            }
            Format::F31i => {
                let a = self.register(0)?;
                let literal = self.checked_literal(i32::MIN as i64, i32::MAX as i64)?;
                let value = literal as i32 as u32;
                vec![op | (a << 8), value as u16, (value >> 16) as u16]
            }
            Format::F51l => {
                let a = self.register(0)?;
                let value = self.literal()? as u64;
                vec![
                    op | (a << 8),
                    value as u16,
                    (value >> 16) as u16,
                    (value >> 32) as u16,
                    (value >> 48) as u16,
                ]
            }
            Format::F21c => vec![op | (self.register(0)? << 8), self.index16()?],
            Format::F31c => {
                let a = self.register(0)?;
                let index = self.index()?;
                vec![op | (a << 8), index as u16, (index >> 16) as u16]
            }
            Format::F22c => {
                let a = self.register(0)?;
                let b = self.register(1)?;
                vec![op | (a << 8) | (b << 12), self.index16()?]
            }
            Format::F23x => {
                let a = self.register(0)?;
                let b = self.register(1)?;
                let c = self.register(2)?;
                vec![op | (a << 8), b | (c << 8)]
            }
            Format::F22b => {
                let a = self.register(0)?;
                let b = self.register(1)?;
                let literal = self.checked_literal(i8::MIN as i64, i8::MAX as i64)?;
                vec![op | (a << 8), b | ((literal as i8 as u8 as u16) << 8)]
            }
            Format::F22s => {
                let a = self.register(0)?;
                let b = self.register(1)?;
                let literal = self.checked_literal(i16::MIN as i64, i16::MAX as i64)?;
                vec![op | (a << 8) | (b << 12), literal as i16 as u16]
            }
            Format::F35c => {
                let units = register_units(&self.instruction.registers);
                if units.len() > 5 {
                    return Err(self.mismatch());
                }
                for (operand, unit) in units.iter().enumerate() {
                    if *unit > 0xf {
                        return Err(FormatError::RegisterOutOfRange {
                            register: *unit,
                            operand,
                            opcode: self.name(),
                        });
                    }
                }
                let nibble = |i: usize| units.get(i).copied().unwrap_or(0);
                vec![
                    op | (nibble(4) << 8) | ((units.len() as u16) << 12),
                    self.index16()?,
                    nibble(0) | (nibble(1) << 4) | (nibble(2) << 8) | (nibble(3) << 12),
                ]
            }
            Format::F3rc => {
                let units = register_units(&self.instruction.registers);
                if units.len() > u8::MAX as usize {
                    return Err(self.mismatch());
                }
                let first = units.first().copied().unwrap_or(0);
                if units.iter().enumerate().any(|(i, unit)| *unit as usize != first as usize + i) {
                    return Err(FormatError::OperandMismatch {
                        operand: "non contiguous register range".to_string(),
                        opcode: self.name(),
                    });
                }
                vec![op | ((units.len() as u16) << 8), self.index16()?, first]
            }
            Format::F10t | Format::F20t | Format::F30t | Format::F21t | Format::F22t | Format::F31t => {
                return Err(self.mismatch());
            }
        };
        self.out.extend(units);
        Ok(())
    }
}

/// Register list of an invoke as individual units, wide registers taking two
pub fn register_units(registers: &[Register]) -> Vec<u16> {
    let mut units = Vec::with_capacity(registers.len());
    for register in registers {
        units.push(register.index);
        if let Some(pair) = register.pair() {
            units.push(pair.index);
        }
    }
    units
}
