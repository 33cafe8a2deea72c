//! Local rewrites run on a lowered body, in this order: width narrowing, `nop` removal and
//! branch form shrinking. Each pass leaves an already optimized body unchanged.
use droid_shared::bytecode::{InstructionId, MethodBody, Opcode, Operand, Register, RegisterKind};
use droid_shared::FormatError;

use crate::backend::compiler_utils::simplify_branches;

pub fn optimize(body: &mut MethodBody) -> Result<(), FormatError> {
    narrow_widths(body);
    remove_nops(body)?;
    // gotos that now sit right before their target
    simplify_branches(body)?;
    shrink_branches(body)?;
    Ok(())
}

fn narrow_const(register: Register, value: i64) -> Opcode {
    if (-8..=7).contains(&value) && register.fits(4) {
        Opcode::Const4
    } else if i16::try_from(value).is_ok() {
        Opcode::Const16
    } else if value & 0xffff == 0 {
        Opcode::ConstHigh16
    } else {
        Opcode::Const
    }
}

fn narrow_const_wide(value: i64) -> Opcode {
    if i16::try_from(value).is_ok() {
        Opcode::ConstWide16
    } else if i32::try_from(value).is_ok() {
        Opcode::ConstWide32
    } else if value & 0x0000_ffff_ffff_ffff == 0 {
        Opcode::ConstWideHigh16
    } else {
        Opcode::ConstWide
    }
}

fn narrow_move(kind: RegisterKind, to: Register, from: Register) -> Opcode {
    use Opcode::*;
    let [short, from16, long] = match kind {
        RegisterKind::Normal => [Move, MoveFrom16, Move16],
        RegisterKind::Wide => [MoveWide, MoveWideFrom16, MoveWide16],
        RegisterKind::Object => [MoveObject, MoveObjectFrom16, MoveObject16],
    };
    if to.fits(4) && from.fits(4) {
        short
    } else if to.fits(8) {
        from16
    } else {
        long
    }
}

fn move_kind(opcode: Opcode) -> Option<RegisterKind> {
    use Opcode::*;
    match opcode {
        Move | MoveFrom16 | Move16 => Some(RegisterKind::Normal),
        MoveWide | MoveWideFrom16 | MoveWide16 => Some(RegisterKind::Wide),
        MoveObject | MoveObjectFrom16 | MoveObject16 => Some(RegisterKind::Object),
        _ => None,
    }
}

/// Picks the shortest const and move forms for the registers and values involved
pub fn narrow_widths(body: &mut MethodBody) {
    for instruction in body.instructions_mut() {
        let opcode = instruction.opcode;
        let narrowed = match (&instruction.operand, instruction.registers.as_slice()) {
            (Operand::Int(value), [register]) if opcode.is_const() => {
                narrow_const(*register, *value as i64)
            }
            (Operand::Wide(value), [_]) if opcode.is_const_wide() => narrow_const_wide(*value),
            (_, [to, from]) => match move_kind(opcode) {
                Some(kind) => narrow_move(kind, *to, *from),
                None => continue,
            },
            _ => continue,
        };
        if narrowed != opcode {
            log::trace!("narrowed {} to {}", opcode.name(), narrowed.name());
            instruction.opcode = narrowed;
        }
    }
}

/// Drops every `nop` except try range ends, sending whatever pointed at one to the
/// instruction after it
pub fn remove_nops(body: &mut MethodBody) -> Result<(), FormatError> {
    let nops: Vec<InstructionId> = body
        .instructions()
        .iter()
        .filter(|instruction| instruction.opcode == Opcode::Nop)
        .map(|instruction| instruction.id())
        .collect();
    for id in nops {
        if body.is_try_end(id) {
            continue;
        }
        let Some(next) = body.next_after(id) else {
            continue;
        };
        body.reroute_incoming(id, next);
        body.remove(id)?;
    }
    Ok(())
}

fn goto_for(distance: i64) -> Opcode {
    if distance == 0 {
        Opcode::Goto32
    } else if i8::try_from(distance).is_ok() {
        Opcode::Goto
    } else if i16::try_from(distance).is_ok() {
        Opcode::Goto16
    } else {
        Opcode::Goto32
    }
}

/// Gives every goto the shortest form its distance allows.
///
/// A shorter goto only brings other branches closer, so the forms settle after a few rounds.
pub fn shrink_branches(body: &mut MethodBody) -> Result<(), FormatError> {
    loop {
        body.update_offsets();
        let offsets = body.offsets();
        let mut changes = Vec::new();
        for (index, instruction) in body.instructions().iter().enumerate() {
            if !instruction.opcode.is_goto() {
                continue;
            }
            let Operand::Target(target) = instruction.operand else {
                continue;
            };
            let position = body
                .position(target)
                .ok_or(FormatError::UnknownInstruction(target.value()))?;
            let distance = offsets[position] as i64 - offsets[index] as i64;
            let shortest = goto_for(distance);
            if shortest != instruction.opcode {
                changes.push((instruction.id(), shortest));
            }
        }
        if changes.is_empty() {
            return Ok(());
        }
        for (id, opcode) in changes {
            if let Some(instruction) = body.instruction_mut(id) {
                instruction.opcode = opcode;
            }
        }
        narrow_widths(body);
    }
}
