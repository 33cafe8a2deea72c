use std::collections::HashMap;

use droid_shared::bytecode::{Access, Format, InstructionId, MethodBody, Opcode, Operand, Register, RegisterKind};
use droid_shared::FormatError;

/// Registers v0..v3 are kept free for spilling once a frame outgrows 4-bit operands
pub const SCRATCH_REGISTERS: u16 = 4;

/// Register bindings of the method being lowered.
///
/// Indices are virtual while lowering: the incoming arguments take `0..arguments` and every
/// local or temporary comes after them. [`map_registers`] moves the arguments to the top of the
/// frame once the number of locals is known.
pub struct Frame {
    bindings: HashMap<String, Register>,
    arguments: u16,
    current_location: u16,
    high_water: u16,
}

impl Frame {
    pub fn new(arguments: u16) -> Self {
        Frame {
            bindings: HashMap::new(),
            arguments,
            current_location: arguments,
            high_water: arguments,
        }
    }

    pub fn arguments(&self) -> u16 {
        self.arguments
    }

    pub fn set_binding(&mut self, name: impl Into<String>, register: Register) {
        self.bindings.insert(name.into(), register);
    }

    /// Binds `name` to a fresh local, or returns the register it is already bound to
    pub fn add_binding(&mut self, name: &str, kind: RegisterKind) -> Register {
        if let Some(register) = self.bindings.get(name) {
            return *register;
        }
        let register = self.temporary(kind);
        self.bindings.insert(name.to_string(), register);
        register
    }

    pub fn is_bound(&self, name: &str) -> bool {
        self.bindings.contains_key(name)
    }

    pub fn get_binding(&self, name: &str) -> Option<Register> {
        self.bindings.get(name).copied()
    }

    pub fn temporary(&mut self, kind: RegisterKind) -> Register {
        let register = Register::new(self.current_location, kind);
        self.current_location += kind.width();
        self.high_water = self.high_water.max(self.current_location);
        register
    }

    /// Consecutive registers, for the argument list of an invoke
    pub fn temporaries(&mut self, kinds: &[RegisterKind]) -> Vec<Register> {
        kinds.iter().map(|kind| self.temporary(*kind)).collect()
    }

    pub fn get_location(&self) -> u16 {
        self.current_location
    }

    /// Frees every temporary allocated since `location` was taken
    pub fn release(&mut self, location: u16) {
        self.current_location = location.max(self.arguments);
    }

    pub fn locals_size(&self) -> u16 {
        self.high_water - self.arguments
    }
}

/// Where control lands from `start`, through gotos and `nop`s
fn final_target(body: &MethodBody, start: InstructionId) -> InstructionId {
    let mut target = start;
    let mut steps = 0;
    while let Some(instruction) = body.instruction(target) {
        if steps >= body.len() {
            break;
        }
        let next = match (&instruction.operand, instruction.opcode) {
            (Operand::Target(next), opcode) if opcode.is_goto() => *next,
            (_, Opcode::Nop) => match body.next_after(target) {
                Some(next) => next,
                None => break,
            },
            _ => break,
        };
        target = next;
        steps += 1;
    }
    target
}

/// Collapses goto chains, turns gotos to `return-void` into returns and drops gotos to the
/// following instruction, until nothing changes.
pub fn simplify_branches(body: &mut MethodBody) -> Result<(), FormatError> {
    loop {
        let mut changed = false;

        let ids: Vec<InstructionId> = body.instructions().iter().map(|i| i.id()).collect();
        for id in ids.iter().copied() {
            let targets = match body.instruction(id) {
                Some(instruction) => instruction.targets(),
                None => continue,
            };
            for target in targets {
                let last = final_target(body, target);
                if last != target {
                    if let Some(instruction) = body.instruction_mut(id) {
                        changed |= instruction.retarget(target, last);
                    }
                }
            }
        }

        for id in ids.iter().copied() {
            let Some(instruction) = body.instruction(id) else {
                continue;
            };
            let Operand::Target(target) = instruction.operand else {
                continue;
            };
            if !instruction.opcode.is_goto() {
                continue;
            }
            if body.instruction(target).is_some_and(|t| t.opcode == Opcode::ReturnVoid) {
                if let Some(instruction) = body.instruction_mut(id) {
                    instruction.opcode = Opcode::ReturnVoid;
                    instruction.operand = Operand::None;
                    changed = true;
                }
            }
        }

        let mut redundant = Vec::new();
        for instruction in body.instructions() {
            if let (true, Operand::Target(target)) = (instruction.opcode.is_goto(), &instruction.operand) {
                if body.next_after(instruction.id()) == Some(*target) && !body.is_try_end(instruction.id()) {
                    redundant.push((instruction.id(), *target));
                }
            }
        }
        for (id, next) in redundant {
            body.reroute_incoming(id, next);
            body.remove(id)?;
            changed = true;
        }

        if !changed {
            return Ok(());
        }
    }
}

/// Moves the arguments from the bottom of the virtual numbering to the top of the frame
pub fn map_registers(body: &mut MethodBody, arguments: u16, locals: u16) {
    for instruction in body.instructions_mut() {
        for register in instruction.registers.iter_mut() {
            let index = if register.index < arguments {
                register.index + locals
            } else {
                register.index - arguments
            };
            *register = register.with_index(index);
        }
    }
    body.registers_size = locals + arguments;
    body.ins_size = arguments;
}

fn fixed_operand_bits(opcode: Opcode) -> &'static [u8] {
    match opcode.format() {
        Format::F35c | Format::F3rc => &[],
        format => format.register_bits(),
    }
}

fn is_contiguous(registers: &[Register]) -> bool {
    registers
        .windows(2)
        .all(|pair| pair[0].last_index() + 1 == pair[1].index)
}

/// Makes every register operand fit its field.
///
/// Frames of more than 16 registers are shifted up by [`SCRATCH_REGISTERS`]; an operand that
/// still does not fit is copied through a scratch register with 16-bit moves. Fixed register
/// invokes whose arguments do not fit become `/range` invokes.
pub fn spill_registers(body: &mut MethodBody) -> Result<(), FormatError> {
    if body.registers_size <= 16 {
        return Ok(());
    }
    for instruction in body.instructions_mut() {
        for register in instruction.registers.iter_mut() {
            *register = register.with_index(register.index + SCRATCH_REGISTERS);
        }
    }
    body.registers_size += SCRATCH_REGISTERS;

    let ids: Vec<InstructionId> = body.instructions().iter().map(|i| i.id()).collect();
    for id in ids {
        let Some(instruction) = body.instruction(id) else {
            continue;
        };
        let opcode = instruction.opcode;

        if opcode.format() == Format::F35c {
            if instruction.registers.iter().all(|r| r.fits(4)) {
                continue;
            }
            if !is_contiguous(&instruction.registers) {
                return Err(FormatError::OperandMismatch {
                    operand: "register list".to_string(),
                    opcode: opcode.name(),
                });
            }
            if let Some(instruction) = body.instruction_mut(id) {
                instruction.opcode = opcode.to_range();
            }
            continue;
        }

        let bits = fixed_operand_bits(opcode);
        let uses = opcode.register_uses();
        let mut reads = Vec::new();
        let mut writes = Vec::new();
        let mut rewritten = instruction.registers.clone();
        let mut next_read = 0;
        let mut next_write = 0;
        for (position, register) in instruction.registers.iter().enumerate() {
            let (Some(bits), Some(usage)) = (bits.get(position), uses.get(position)) else {
                continue;
            };
            if register.fits(*bits) {
                continue;
            }
            let scratch = match usage.access {
                Access::Read | Access::ReadWrite => {
                    let scratch = register.with_index(next_read);
                    next_read += register.kind.width();
                    scratch
                }
                Access::Write => {
                    let scratch = register.with_index(next_write);
                    next_write += register.kind.width();
                    scratch
                }
            };
            if next_read > SCRATCH_REGISTERS || next_write > SCRATCH_REGISTERS {
                return Err(FormatError::RegisterOutOfRange {
                    register: register.index,
                    operand: position,
                    opcode: opcode.name(),
                });
            }
            if usage.access != Access::Write {
                reads.push((*register, scratch));
            }
            if usage.access != Access::Read {
                writes.push((*register, scratch));
            }
            rewritten[position] = scratch;
        }
        if reads.is_empty() && writes.is_empty() {
            continue;
        }

        if let Some(instruction) = body.instruction_mut(id) {
            instruction.registers = rewritten;
        }
        let mut first_inserted = None;
        for (register, scratch) in reads {
            let copy = body.insert_before(id, Opcode::move_for(register.kind), vec![scratch, register], Operand::None)?;
            first_inserted.get_or_insert(copy);
        }
        if let Some(first) = first_inserted {
            body.reroute_incoming(id, first);
        }
        let mut anchor = id;
        for (register, scratch) in writes {
            anchor = body.insert_after(anchor, Opcode::move_for(register.kind), vec![register, scratch], Operand::None)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use droid_shared::bytecode::{ExceptionHandler, InstructionRange};
    use droid_shared::types::{ClassReference, MethodReference, Prototype, TypeReference};
    use proptest::prelude::*;

    #[test]
    fn test_frame_bindings_and_release() {
        let mut frame = Frame::new(2);
        let x = frame.add_binding("x", RegisterKind::Wide);
        assert_eq!(x, Register::wide(2));
        assert_eq!(frame.add_binding("x", RegisterKind::Wide), x);
        let location = frame.get_location();
        let t = frame.temporary(RegisterKind::Object);
        assert_eq!(t.index, 4);
        frame.release(location);
        assert_eq!(frame.temporary(RegisterKind::Normal).index, 4);
        assert_eq!(frame.locals_size(), 3);
        assert!(frame.is_bound("x"));
    }

    #[test]
    fn test_goto_chain_and_return_pull() {
        let mut body = MethodBody::new(1, 0);
        let first = body.push(Opcode::Goto32, vec![], Operand::None);
        body.push(Opcode::Const, vec![Register::normal(0)], Operand::Int(1));
        let second = body.push(Opcode::Goto32, vec![], Operand::None);
        body.push(Opcode::Const, vec![Register::normal(0)], Operand::Int(2));
        let ret = body.push(Opcode::ReturnVoid, vec![], Operand::None);
        body.instruction_mut(first).unwrap().operand = Operand::Target(second);
        body.instruction_mut(second).unwrap().operand = Operand::Target(ret);

        simplify_branches(&mut body).unwrap();
        assert_eq!(body.instruction(first).unwrap().opcode, Opcode::ReturnVoid);
        assert_eq!(body.instruction(second).unwrap().opcode, Opcode::ReturnVoid);
    }

    #[test]
    fn test_goto_to_next_is_removed() {
        let mut body = MethodBody::new(1, 0);
        let branch = body.push(Opcode::IfEqz, vec![Register::normal(0)], Operand::None);
        let goto = body.push(Opcode::Goto32, vec![], Operand::None);
        let next = body.push(Opcode::Const, vec![Register::normal(0)], Operand::Int(1));
        body.push(Opcode::Return, vec![Register::normal(0)], Operand::None);
        body.instruction_mut(branch).unwrap().operand = Operand::Target(goto);
        body.instruction_mut(goto).unwrap().operand = Operand::Target(next);

        simplify_branches(&mut body).unwrap();
        assert_eq!(body.len(), 3);
        assert_eq!(body.instruction(branch).unwrap().operand, Operand::Target(next));
    }

    #[test]
    fn test_arguments_move_to_the_top() {
        let mut body = MethodBody::new(0, 0);
        body.push(Opcode::AddLong, vec![Register::wide(3), Register::wide(0), Register::wide(3)], Operand::None);
        map_registers(&mut body, 3, 2);
        assert_eq!(body.registers_size, 5);
        assert_eq!(body.ins_size, 3);
        let registers = &body.instructions()[0].registers;
        assert_eq!(registers[0], Register::wide(0));
        assert_eq!(registers[1], Register::wide(2));
    }

    #[test]
    fn test_spill_copies_through_scratch() {
        let mut body = MethodBody::new(20, 0);
        let neg = body.push(Opcode::NegInt, vec![Register::normal(14), Register::normal(2)], Operand::None);
        let goto = body.push(Opcode::Goto32, vec![], Operand::Target(neg));
        spill_registers(&mut body).unwrap();

        assert_eq!(body.registers_size, 24);
        let opcodes: Vec<Opcode> = body.instructions().iter().map(|i| i.opcode).collect();
        assert_eq!(opcodes, vec![Opcode::NegInt, Opcode::Move16, Opcode::Goto32]);
        let neg_instruction = body.instruction(neg).unwrap();
        assert_eq!(neg_instruction.registers, vec![Register::normal(0), Register::normal(6)]);
        assert_eq!(body.instructions()[1].registers, vec![Register::normal(18), Register::normal(0)]);
        assert_eq!(body.instruction(goto).unwrap().operand, Operand::Target(neg));
    }

    #[test]
    fn test_spilled_read_takes_incoming_branches() {
        let mut body = MethodBody::new(20, 0);
        let read = body.push(Opcode::Throw, vec![Register::object(300)], Operand::None);
        let goto = body.push(Opcode::Goto32, vec![], Operand::Target(read));
        body.exception_handlers.push(ExceptionHandler {
            range: InstructionRange::new(read, read),
            catches: vec![],
            catch_all: Some(goto),
        });
        spill_registers(&mut body).unwrap();

        let copy = body.instructions()[0].id();
        assert_eq!(body.instructions()[0].opcode, Opcode::MoveObject16);
        assert_eq!(body.instruction(goto).unwrap().operand, Operand::Target(copy));
        assert_eq!(body.exception_handlers[0].range.first, copy);
        assert_eq!(body.exception_handlers[0].range.last, read);
    }

    #[test]
    fn test_wide_invoke_becomes_range() {
        let method = MethodReference::new(
            ClassReference::new("LApp;"),
            "f",
            Prototype::new(TypeReference::void(), vec![TypeReference::long()]),
        );
        let mut body = MethodBody::new(20, 0);
        let invoke = body.push(Opcode::InvokeStatic, vec![Register::wide(15)], Operand::Method(method));
        spill_registers(&mut body).unwrap();
        assert_eq!(body.instruction(invoke).unwrap().opcode, Opcode::InvokeStaticRange);
    }

    proptest! {
        #[test]
        fn test_mapping_keeps_pairs_together(arguments in 0u16..8, locals in 0u16..8, index in 0u16..15) {
            prop_assume!(index + 1 < arguments + locals);
            prop_assume!(index + 1 != arguments);
            let map = |i: u16| if i < arguments { i + locals } else { i - arguments };
            let mut body = MethodBody::new(0, 0);
            body.push(Opcode::MoveWide16, vec![Register::wide(index), Register::wide(index)], Operand::None);
            map_registers(&mut body, arguments, locals);
            let mapped = body.instructions()[0].registers[0];
            prop_assert_eq!(mapped.index, map(index));
            prop_assert_eq!(mapped.last_index(), map(index + 1));
            prop_assert!(mapped.last_index() < arguments + locals);
        }
    }
}
