//! Rebuilds a symbolic [`MethodBody`] from code units.
use std::collections::HashMap;

use super::encode::{EncodedCode, PACKED_SWITCH_IDENT};
use super::{
    argument_kinds, CatchClause, DebugPosition, ExceptionHandler, Format, InstructionId, InstructionRange,
    MethodBody, Opcode, Operand, Register, RegisterKind,
};
use crate::types::{FieldReference, MethodReference, TypeReference};
use crate::ReadError;

/// Maps pool indices back to references while instructions are decoded
pub trait ReferenceResolver {
    fn string(&self, index: u32) -> Result<String, ReadError>;
    fn type_reference(&self, index: u32) -> Result<TypeReference, ReadError>;
    fn field(&self, index: u32) -> Result<FieldReference, ReadError>;
    fn method(&self, index: u32) -> Result<MethodReference, ReadError>;
}

/// Operand as read from the stream, before addresses become identities
enum RawOperand {
    Resolved(Operand),
    Target(u32),
    Switch(u32),
}

struct RawInstruction {
    address: u32,
    opcode: Opcode,
    registers: Vec<Register>,
    operand: RawOperand,
}

pub fn decode(code: &EncodedCode, resolver: &dyn ReferenceResolver) -> Result<MethodBody, ReadError> {
    let insns = &code.insns;
    let mut raw = Vec::new();
    let mut address = 0usize;
    let mut payload_start = usize::MAX;

    while address < insns.len() && address < payload_start {
        let unit = insns[address];
        if unit == Opcode::Nop as u16
            && address + 1 == payload_start
            && address % 2 == 1
            && !covered_by_try(code, address as u32)
        {
            break;
        }
        let opcode = Opcode::from_u8((unit & 0xff) as u8)
            .ok_or(ReadError::UnknownOpcode((unit & 0xff) as u8, address))?;
        let size = opcode.size() as usize;
        if address + size > insns.len() {
            return Err(ReadError::Truncated(address));
        }
        let instruction = decode_instruction(opcode, &insns[address..address + size], address as u32, resolver)?;
        if let RawOperand::Switch(payload) = instruction.operand {
            payload_start = payload_start.min(payload as usize);
        }
        raw.push(instruction);
        address += size;
    }

    let mut body = MethodBody::new(code.registers_size, code.ins_size);
    body.outs_size = code.outs_size;
    let mut ids = HashMap::new();
    for instruction in raw.iter() {
        let id = body.push(instruction.opcode, instruction.registers.clone(), Operand::None);
        ids.insert(instruction.address, id);
    }
    let id_at = |address: u32| -> Result<InstructionId, ReadError> {
        ids.get(&address)
            .copied()
            .ok_or_else(|| ReadError::Malformed(format!("no instruction at address {}", address)))
    };

    for (index, instruction) in raw.into_iter().enumerate() {
        let operand = match instruction.operand {
            RawOperand::Resolved(operand) => operand,
            RawOperand::Target(target) => Operand::Target(id_at(target)?),
            RawOperand::Switch(payload) => {
                let (first_key, relative) = read_switch_payload(insns, payload as usize)?;
                let mut targets = Vec::with_capacity(relative.len());
                for offset in relative {
                    targets.push(id_at((instruction.address as i64 + offset as i64) as u32)?);
                }
                Operand::PackedSwitch { first_key, targets }
            }
        };
        body.instructions_mut()[index].operand = operand;
    }

    let addresses: Vec<u32> = body.offsets();
    for encoded in code.tries.iter() {
        let end = encoded.start_address + encoded.instruction_count as u32;
        let last_index = addresses
            .iter()
            .rposition(|a| *a < end)
            .ok_or_else(|| ReadError::Malformed("empty try range".to_string()))?;
        let last = body.instructions()[last_index].id();
        let handler = code
            .handlers
            .get(encoded.handler)
            .ok_or(ReadError::BadIndex("catch handler", encoded.handler as u32))?;
        let mut catches = Vec::new();
        for (type_index, handler_address) in handler.catches.iter() {
            let exception_type = match resolver.type_reference(*type_index)? {
                TypeReference::Class(class) => class,
                other => return Err(ReadError::Malformed(format!("catch of {}", other))),
            };
            catches.push(CatchClause {
                exception_type,
                handler: id_at(*handler_address)?,
            });
        }
        body.exception_handlers.push(ExceptionHandler {
            range: InstructionRange::new(id_at(encoded.start_address)?, last),
            catches,
            catch_all: handler.catch_all.map(id_at).transpose()?,
        });
    }

    for (address, line) in code.lines.iter() {
        body.debug_info.positions.push(DebugPosition {
            instruction: id_at(*address)?,
            line: *line,
        });
    }
    Ok(body)
}

fn covered_by_try(code: &EncodedCode, address: u32) -> bool {
    code.tries
        .iter()
        .any(|t| t.start_address <= address && address < t.start_address + t.instruction_count as u32)
}

fn read_u32(units: &[u16], at: usize) -> u32 {
    units[at] as u32 | ((units[at + 1] as u32) << 16)
}

fn read_switch_payload(insns: &[u16], at: usize) -> Result<(i32, Vec<i32>), ReadError> {
    if insns.get(at) != Some(&PACKED_SWITCH_IDENT) {
        return Err(ReadError::Malformed(format!("switch payload at {}", at)));
    }
    let size = *insns.get(at + 1).ok_or(ReadError::Truncated(at))? as usize;
    if at + 4 + 2 * size > insns.len() {
        return Err(ReadError::Truncated(at));
    }
    let first_key = read_u32(insns, at + 2) as i32;
    let targets = (0..size).map(|i| read_u32(insns, at + 4 + 2 * i) as i32).collect();
    Ok((first_key, targets))
}

fn decode_instruction(
    opcode: Opcode,
    units: &[u16],
    address: u32,
    resolver: &dyn ReferenceResolver,
) -> Result<RawInstruction, ReadError> {
    let aa = units[0] >> 8;
    let a = (units[0] >> 8) & 0xf;
    let b = units[0] >> 12;
    let relative = |offset: i64| (address as i64 + offset) as u32;
    let reference = |index: u32| -> Result<Operand, ReadError> {
        reference_operand(opcode, index, resolver)
    };

    let (numbers, operand): (Vec<u16>, RawOperand) = match opcode.format() {
        Format::F10x => (vec![], RawOperand::Resolved(Operand::None)),
        Format::F12x => (vec![a, b], RawOperand::Resolved(Operand::None)),
        Format::F11n => {
            let literal = ((b as i16) << 12 >> 12) as i32;
            (vec![a], RawOperand::Resolved(Operand::Int(literal)))
        }
        Format::F11x => (vec![aa], RawOperand::Resolved(Operand::None)),
        Format::F10t => (vec![], RawOperand::Target(relative(aa as u8 as i8 as i64))),
        Format::F20t => (vec![], RawOperand::Target(relative(units[1] as i16 as i64))),
        Format::F30t => (vec![], RawOperand::Target(relative(read_u32(units, 1) as i32 as i64))),
        Format::F22x => (vec![aa, units[1]], RawOperand::Resolved(Operand::None)),
        Format::F32x => (vec![units[1], units[2]], RawOperand::Resolved(Operand::None)),
        Format::F21t => (vec![aa], RawOperand::Target(relative(units[1] as i16 as i64))),
        Format::F22t => (vec![a, b], RawOperand::Target(relative(units[1] as i16 as i64))),
        Format::F31t => (vec![aa], RawOperand::Switch(relative(read_u32(units, 1) as i32 as i64))),
        Format::F21s => {
            let literal = units[1] as i16 as i64;
            (vec![aa], RawOperand::Resolved(literal_operand(opcode, literal)))
        }
        Format::F21h => {
            let operand = if opcode == Opcode::ConstWideHigh16 {
                Operand::Wide((units[1] as i64) << 48)
            } else {
                Operand::Int(((units[1] as u32) << 16) as i32)
            };
            (vec![aa], RawOperand::Resolved(operand))
        }
        Format::F31i => {
            let literal = read_u32(units, 1) as i32 as i64;
            (vec![aa], RawOperand::Resolved(literal_operand(opcode, literal)))
        }
        Format::F51l => {
            let value = (0..4).fold(0u64, |acc, i| acc | ((units[1 + i] as u64) << (16 * i)));
            (vec![aa], RawOperand::Resolved(Operand::Wide(value as i64)))
        }
        Format::F21c => (vec![aa], RawOperand::Resolved(reference(units[1] as u32)?)),
        Format::F31c => (vec![aa], RawOperand::Resolved(reference(read_u32(units, 1))?)),
        Format::F22c => (vec![a, b], RawOperand::Resolved(reference(units[1] as u32)?)),
        Format::F23x => (
            vec![aa, units[1] & 0xff, units[1] >> 8],
            RawOperand::Resolved(Operand::None),
        ),
        Format::F22b => {
            let literal = (units[1] >> 8) as u8 as i8 as i32;
            (vec![aa, units[1] & 0xff], RawOperand::Resolved(Operand::Int(literal)))
        }
        Format::F22s => {
            let literal = units[1] as i16 as i32;
            (vec![a, b], RawOperand::Resolved(Operand::Int(literal)))
        }
        Format::F35c => {
            let count = (units[0] >> 12) as usize;
            let all = [
                units[2] & 0xf,
                (units[2] >> 4) & 0xf,
                (units[2] >> 8) & 0xf,
                units[2] >> 12,
                (units[0] >> 8) & 0xf,
            ];
            if count > 5 {
                return Err(ReadError::Malformed(format!("{} with {} registers", opcode, count)));
            }
            (all[..count].to_vec(), RawOperand::Resolved(reference(units[1] as u32)?))
        }
        Format::F3rc => {
            let count = aa;
            let numbers = (0..count).map(|i| units[2] + i).collect();
            (numbers, RawOperand::Resolved(reference(units[1] as u32)?))
        }
    };

    let registers = match &operand {
        RawOperand::Resolved(resolved) if opcode.is_invoke() => {
            group_arguments(opcode, &argument_kinds(opcode, resolved), &numbers)?
        }
        RawOperand::Resolved(Operand::Type(array)) if opcode.format() == Format::F35c || opcode.format() == Format::F3rc => {
            let kind = array
                .element()
                .map(RegisterKind::for_type)
                .unwrap_or(RegisterKind::Object);
            numbers.iter().map(|n| Register::new(*n, kind)).collect()
        }
        _ => numbers
            .iter()
            .zip(opcode.register_uses())
            .map(|(n, u)| Register::new(*n, u.kind))
            .collect(),
    };

    Ok(RawInstruction {
        address,
        opcode,
        registers,
        operand,
    })
}

fn literal_operand(opcode: Opcode, literal: i64) -> Operand {
    if opcode.is_const_wide() {
        Operand::Wide(literal)
    } else {
        Operand::Int(literal as i32)
    }
}

fn reference_operand(opcode: Opcode, index: u32, resolver: &dyn ReferenceResolver) -> Result<Operand, ReadError> {
    let operand = match opcode {
        Opcode::ConstString | Opcode::ConstStringJumbo => Operand::String(resolver.string(index)?),
        Opcode::ConstClass
        | Opcode::CheckCast
        | Opcode::InstanceOf
        | Opcode::NewInstance
        | Opcode::NewArray
        | Opcode::FilledNewArray
        | Opcode::FilledNewArrayRange => Operand::Type(resolver.type_reference(index)?),
        op if op.is_invoke() => Operand::Method(resolver.method(index)?),
        _ => Operand::Field(resolver.field(index)?),
    };
    Ok(operand)
}

/// Pairs register numbers with the kinds of an invoke's arguments; wide arguments use two
fn group_arguments(opcode: Opcode, kinds: &[RegisterKind], numbers: &[u16]) -> Result<Vec<Register>, ReadError> {
    let mut registers = Vec::with_capacity(kinds.len());
    let mut next = 0;
    for kind in kinds {
        let Some(number) = numbers.get(next) else {
            return Err(ReadError::Malformed(format!("{} is missing arguments", opcode)));
        };
        if *kind == RegisterKind::Wide && numbers.get(next + 1) != Some(&(number + 1)) {
            return Err(ReadError::Malformed(format!("{} splits a wide argument", opcode)));
        }
        registers.push(Register::new(*number, *kind));
        next += kind.width() as usize;
    }
    if next != numbers.len() {
        return Err(ReadError::Malformed(format!("{} has extra arguments", opcode)));
    }
    Ok(registers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::encode::{encode, IndexResolver};
    use crate::types::{ClassReference, Prototype};
    use crate::FormatError;

    /// A single entry pool of each kind
    struct OneOfEach {
        method: MethodReference,
        field: FieldReference,
    }

    impl OneOfEach {
        fn new() -> OneOfEach {
            let owner = ClassReference::new("LFoo;");
            OneOfEach {
                method: MethodReference::new(
                    owner.clone(),
                    "bar",
                    Prototype::new(TypeReference::long(), vec![TypeReference::long(), TypeReference::int()]),
                ),
                field: FieldReference::new(owner, "count", TypeReference::int()),
            }
        }
    }

    impl IndexResolver for OneOfEach {
        fn string_index(&self, _: &str) -> Result<u32, FormatError> {
            Ok(0)
        }
        fn type_index(&self, _: &TypeReference) -> Result<u32, FormatError> {
            Ok(0)
        }
        fn field_index(&self, _: &FieldReference) -> Result<u32, FormatError> {
            Ok(0)
        }
        fn method_index(&self, _: &MethodReference) -> Result<u32, FormatError> {
            Ok(0)
        }
    }

    impl ReferenceResolver for OneOfEach {
        fn string(&self, _: u32) -> Result<String, ReadError> {
            Ok("hello".to_string())
        }
        fn type_reference(&self, _: u32) -> Result<TypeReference, ReadError> {
            Ok(TypeReference::class("Ljava/lang/Exception;"))
        }
        fn field(&self, _: u32) -> Result<FieldReference, ReadError> {
            Ok(self.field.clone())
        }
        fn method(&self, _: u32) -> Result<MethodReference, ReadError> {
            Ok(self.method.clone())
        }
    }

    #[test]
    fn test_decode_restores_body() {
        let pools = OneOfEach::new();
        let mut body = MethodBody::new(6, 3);
        let start = body.push(Opcode::ConstString, vec![Register::object(0)], Operand::String("hello".into()));
        body.push(
            Opcode::InvokeVirtual,
            vec![Register::object(0), Register::wide(3), Register::normal(5)],
            Operand::Method(pools.method.clone()),
        );
        body.push(Opcode::MoveResultWide, vec![Register::wide(1)], Operand::None);
        body.push(Opcode::ConstWideHigh16, vec![Register::wide(1)], Operand::Wide(1 << 48));
        let switch = body.push(Opcode::PackedSwitch, vec![Register::normal(5)], Operand::None);
        let ret = body.push(Opcode::ReturnVoid, vec![], Operand::None);
        let handler = body.push(Opcode::MoveException, vec![Register::object(0)], Operand::None);
        body.push(Opcode::Throw, vec![Register::object(0)], Operand::None);
        body.instruction_mut(switch).unwrap().operand = Operand::PackedSwitch {
            first_key: -1,
            targets: vec![ret, handler],
        };
        body.exception_handlers.push(ExceptionHandler {
            range: InstructionRange::new(start, switch),
            catches: vec![CatchClause {
                exception_type: ClassReference::new("Ljava/lang/Exception;"),
                handler,
            }],
            catch_all: None,
        });
        body.debug_info.positions.push(DebugPosition { instruction: start, line: 3 });
        body.outs_size = body.compute_outs_size();

        let code = encode(&mut body, &pools).unwrap();
        let decoded = decode(&code, &pools).unwrap();
        assert_eq!(decoded, body);
    }

    #[test]
    fn test_trailing_nop_in_try_survives() {
        let pools = OneOfEach::new();
        let mut body = MethodBody::new(1, 1);
        let switch = body.push(Opcode::PackedSwitch, vec![Register::normal(0)], Operand::None);
        let ret = body.push(Opcode::ReturnVoid, vec![], Operand::None);
        let nop = body.push(Opcode::Nop, vec![], Operand::None);
        body.instruction_mut(switch).unwrap().operand = Operand::PackedSwitch {
            first_key: 0,
            targets: vec![ret],
        };
        body.exception_handlers.push(ExceptionHandler {
            range: InstructionRange::new(ret, nop),
            catches: vec![],
            catch_all: Some(ret),
        });
        let code = encode(&mut body, &pools).unwrap();
        let decoded = decode(&code, &pools).unwrap();
        assert_eq!(decoded.len(), 3);
        assert_eq!(decoded, body);
    }
}
