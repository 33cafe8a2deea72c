//! Method bodies: an ordered instruction list plus exception handlers and a line table.
//!
//! Ranges and branches refer to instructions by identity. Offsets are derived from the
//! instruction sizes and are cached until the next change to the list.
use std::collections::HashMap;

use super::{argument_kinds, Instruction, InstructionId, Opcode, Operand, Register, RegisterKind};
use crate::types::ClassReference;
use crate::FormatError;

/// A `(first, last)` span of instructions, both ends inclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstructionRange {
    pub first: InstructionId,
    pub last: InstructionId,
}

impl InstructionRange {
    pub fn new(first: InstructionId, last: InstructionId) -> InstructionRange {
        InstructionRange { first, last }
    }

    /// Positions `[start, end)` of the span in `body`
    pub fn bounds(&self, body: &MethodBody) -> Option<(usize, usize)> {
        let start = body.position(self.first)?;
        let end = body.position(self.last)? + 1;
        Some((start, end))
    }

    pub fn contains(&self, body: &MethodBody, id: InstructionId) -> bool {
        match (self.bounds(body), body.position(id)) {
            (Some((start, end)), Some(position)) => start <= position && position < end,
            _ => false,
        }
    }

    pub fn intersects(&self, body: &MethodBody, other: &InstructionRange) -> bool {
        match (self.bounds(body), other.bounds(body)) {
            (Some((a_start, a_end)), Some((b_start, b_end))) => a_start < b_end && b_start < a_end,
            _ => false,
        }
    }

    /// Grows the span so that it also covers `id`
    pub fn extend(&mut self, body: &MethodBody, id: InstructionId) {
        let (Some((start, end)), Some(position)) = (self.bounds(body), body.position(id)) else {
            return;
        };
        if position < start {
            self.first = id;
        }
        if position >= end {
            self.last = id;
        }
    }

    pub fn len(&self, body: &MethodBody) -> usize {
        self.bounds(body).map(|(start, end)| end - start).unwrap_or(0)
    }

    pub fn is_empty(&self, body: &MethodBody) -> bool {
        self.len(body) == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CatchClause {
    pub exception_type: ClassReference,
    pub handler: InstructionId,
}

/// Handlers protecting one range of instructions
#[derive(Debug, Clone, PartialEq)]
pub struct ExceptionHandler {
    pub range: InstructionRange,
    pub catches: Vec<CatchClause>,
    pub catch_all: Option<InstructionId>,
}

impl ExceptionHandler {
    pub fn handlers(&self) -> impl Iterator<Item = InstructionId> + '_ {
        self.catches
            .iter()
            .map(|c| c.handler)
            .chain(self.catch_all.iter().copied())
    }
}

/// One entry of the line table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebugPosition {
    pub instruction: InstructionId,
    pub line: u32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DebugInfo {
    pub positions: Vec<DebugPosition>,
}

impl DebugInfo {
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct MethodBody {
    instructions: Vec<Instruction>,
    positions: HashMap<InstructionId, usize>,
    offsets: Option<Vec<u32>>,
    next_id: u32,
    pub exception_handlers: Vec<ExceptionHandler>,
    pub debug_info: DebugInfo,
    /// Total registers of the frame, arguments included
    pub registers_size: u16,
    /// Registers holding the incoming arguments, at the top of the frame
    pub ins_size: u16,
    /// Largest argument register count of any invoke in the body
    pub outs_size: u16,
}

impl MethodBody {
    pub fn new(registers_size: u16, ins_size: u16) -> MethodBody {
        MethodBody {
            instructions: Vec::new(),
            positions: HashMap::new(),
            offsets: None,
            next_id: 0,
            exception_handlers: Vec::new(),
            debug_info: DebugInfo::default(),
            registers_size,
            ins_size,
            outs_size: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Mutable access to the instructions. Offsets are recomputed on the next read.
    pub fn instructions_mut(&mut self) -> &mut [Instruction] {
        self.offsets = None;
        &mut self.instructions
    }

    pub fn instruction(&self, id: InstructionId) -> Option<&Instruction> {
        self.position(id).map(|index| &self.instructions[index])
    }

    pub fn instruction_mut(&mut self, id: InstructionId) -> Option<&mut Instruction> {
        self.offsets = None;
        let index = self.position(id)?;
        Some(&mut self.instructions[index])
    }

    pub fn position(&self, id: InstructionId) -> Option<usize> {
        self.positions.get(&id).copied()
    }

    pub fn first(&self) -> Option<InstructionId> {
        self.instructions.first().map(Instruction::id)
    }

    pub fn last(&self) -> Option<InstructionId> {
        self.instructions.last().map(Instruction::id)
    }

    /// The instruction following `id`, if any
    pub fn next_after(&self, id: InstructionId) -> Option<InstructionId> {
        let index = self.position(id)?;
        self.instructions.get(index + 1).map(Instruction::id)
    }

    fn fresh_id(&mut self) -> InstructionId {
        let id = InstructionId(self.next_id);
        self.next_id += 1;
        id
    }

    pub fn push(&mut self, opcode: Opcode, registers: Vec<Register>, operand: Operand) -> InstructionId {
        let id = self.fresh_id();
        self.positions.insert(id, self.instructions.len());
        self.instructions.push(Instruction::new(id, opcode, registers, operand));
        self.offsets = None;
        id
    }

    /// Inserts a new instruction at position `index`
    pub fn insert_at(
        &mut self,
        index: usize,
        opcode: Opcode,
        registers: Vec<Register>,
        operand: Operand,
    ) -> InstructionId {
        let id = self.fresh_id();
        let index = index.min(self.instructions.len());
        self.instructions
            .insert(index, Instruction::new(id, opcode, registers, operand));
        self.rebuild_positions();
        id
    }

    pub fn insert_before(
        &mut self,
        anchor: InstructionId,
        opcode: Opcode,
        registers: Vec<Register>,
        operand: Operand,
    ) -> Result<InstructionId, FormatError> {
        let index = self
            .position(anchor)
            .ok_or(FormatError::UnknownInstruction(anchor.0))?;
        Ok(self.insert_at(index, opcode, registers, operand))
    }

    pub fn insert_after(
        &mut self,
        anchor: InstructionId,
        opcode: Opcode,
        registers: Vec<Register>,
        operand: Operand,
    ) -> Result<InstructionId, FormatError> {
        let index = self
            .position(anchor)
            .ok_or(FormatError::UnknownInstruction(anchor.0))?;
        Ok(self.insert_at(index + 1, opcode, registers, operand))
    }

    fn rebuild_positions(&mut self) {
        self.positions.clear();
        for (index, instruction) in self.instructions.iter().enumerate() {
            self.positions.insert(instruction.id(), index);
        }
        self.offsets = None;
    }

    /// Whether a branch, a try range or a catch handler names `id`
    pub fn is_referenced(&self, id: InstructionId) -> bool {
        self.instructions.iter().any(|i| i.targets().contains(&id))
            || self.exception_handlers.iter().any(|h| {
                h.range.first == id || h.range.last == id || h.handlers().any(|target| target == id)
            })
    }

    /// Whether `id` is the last instruction of some try range
    pub fn is_try_end(&self, id: InstructionId) -> bool {
        self.exception_handlers.iter().any(|h| h.range.last == id)
    }

    /// Points every branch, range bound, handler and line entry naming `from` at `to`
    pub fn reroute(&mut self, from: InstructionId, to: InstructionId) {
        for instruction in self.instructions.iter_mut() {
            instruction.retarget(from, to);
        }
        for handler in self.exception_handlers.iter_mut() {
            if handler.range.first == from {
                handler.range.first = to;
            }
            if handler.range.last == from {
                handler.range.last = to;
            }
            for catch in handler.catches.iter_mut() {
                if catch.handler == from {
                    catch.handler = to;
                }
            }
            if handler.catch_all == Some(from) {
                handler.catch_all = Some(to);
            }
        }
        for position in self.debug_info.positions.iter_mut() {
            if position.instruction == from {
                position.instruction = to;
            }
        }
    }

    /// Like [`MethodBody::reroute`] but leaves range ends alone, for removing an instruction
    /// whose successor takes over control flow into it
    pub fn reroute_incoming(&mut self, from: InstructionId, to: InstructionId) {
        for instruction in self.instructions.iter_mut() {
            instruction.retarget(from, to);
        }
        for handler in self.exception_handlers.iter_mut() {
            if handler.range.first == from {
                handler.range.first = to;
            }
            for catch in handler.catches.iter_mut() {
                if catch.handler == from {
                    catch.handler = to;
                }
            }
            if handler.catch_all == Some(from) {
                handler.catch_all = Some(to);
            }
        }
        for position in self.debug_info.positions.iter_mut() {
            if position.instruction == from {
                position.instruction = to;
            }
        }
    }

    /// Removes an instruction nothing refers to
    pub fn remove(&mut self, id: InstructionId) -> Result<Instruction, FormatError> {
        if self.is_referenced(id) {
            return Err(FormatError::DanglingInstruction(id.0));
        }
        let index = self
            .position(id)
            .ok_or(FormatError::UnknownInstruction(id.0))?;
        self.move_positions_off(&[id]);
        let removed = self.instructions.remove(index);
        self.rebuild_positions();
        Ok(removed)
    }

    /// Removes a batch of unreferenced instructions in one pass
    pub fn remove_all(&mut self, ids: &[InstructionId]) -> Result<(), FormatError> {
        for id in ids {
            if self.is_referenced(*id) {
                return Err(FormatError::DanglingInstruction(id.0));
            }
        }
        self.move_positions_off(ids);
        self.instructions.retain(|i| !ids.contains(&i.id()));
        self.rebuild_positions();
        Ok(())
    }

    /// Line entries on removed instructions move to the next survivor
    fn move_positions_off(&mut self, ids: &[InstructionId]) {
        let mut replacement = HashMap::new();
        for id in ids {
            let Some(mut index) = self.position(*id) else {
                continue;
            };
            while index < self.instructions.len() && ids.contains(&self.instructions[index].id()) {
                index += 1;
            }
            replacement.insert(*id, self.instructions.get(index).map(Instruction::id));
        }
        self.debug_info.positions.retain_mut(|position| match replacement.get(&position.instruction) {
            Some(Some(next)) => {
                position.instruction = *next;
                true
            }
            Some(None) => false,
            None => true,
        });
    }

    /// Recomputes the code unit offset of every instruction
    pub fn update_offsets(&mut self) {
        let mut offsets = Vec::with_capacity(self.instructions.len());
        let mut offset = 0;
        for instruction in self.instructions.iter() {
            offsets.push(offset);
            offset += instruction.size();
        }
        self.offsets = Some(offsets);
    }

    fn ensure_offsets(&mut self) -> &[u32] {
        if self.offsets.is_none() {
            self.update_offsets();
        }
        self.offsets.as_deref().unwrap_or(&[])
    }

    pub fn offset_of(&mut self, id: InstructionId) -> Result<u32, FormatError> {
        let index = self
            .position(id)
            .ok_or(FormatError::UnknownInstruction(id.0))?;
        Ok(self.ensure_offsets()[index])
    }

    /// Offsets of all instructions, in order
    pub fn offsets(&mut self) -> Vec<u32> {
        self.ensure_offsets().to_vec()
    }

    /// Size of the instruction stream in code units, payloads excluded
    pub fn code_units(&self) -> u32 {
        self.instructions.iter().map(Instruction::size).sum()
    }

    /// Splits overlapping try ranges into disjoint segments.
    ///
    /// Each segment carries the clauses of every range covering it, innermost range first.
    /// A clause for an exception type already caught by an inner range is dropped, and
    /// nothing after a catch-all is kept. Adjacent segments with the same clauses merge.
    pub fn flatten_exception_handlers(&mut self) {
        if self.exception_handlers.is_empty() {
            return;
        }
        let mut spans = Vec::new();
        for handler in self.exception_handlers.iter() {
            if let Some((start, end)) = handler.range.bounds(self) {
                spans.push((start, end, handler));
            }
        }
        let mut boundaries: Vec<usize> = spans.iter().flat_map(|(s, e, _)| [*s, *e]).collect();
        boundaries.sort_unstable();
        boundaries.dedup();

        let mut segments: Vec<(usize, usize, Vec<CatchClause>, Option<InstructionId>)> = Vec::new();
        for window in boundaries.windows(2) {
            let (start, end) = (window[0], window[1]);
            let mut covering: Vec<_> = spans
                .iter()
                .filter(|(s, e, _)| *s <= start && end <= *e)
                .collect();
            if covering.is_empty() {
                continue;
            }
            covering.sort_by_key(|(s, e, _)| e - s);

            let mut catches: Vec<CatchClause> = Vec::new();
            let mut catch_all = None;
            for (_, _, handler) in covering {
                if catch_all.is_some() {
                    break;
                }
                for clause in handler.catches.iter() {
                    if !catches.iter().any(|c| c.exception_type == clause.exception_type) {
                        catches.push(clause.clone());
                    }
                }
                catch_all = handler.catch_all;
            }

            match segments.last_mut() {
                Some(last) if last.1 == start && last.2 == catches && last.3 == catch_all => {
                    last.1 = end;
                }
                _ => segments.push((start, end, catches, catch_all)),
            }
        }

        self.exception_handlers = segments
            .into_iter()
            .map(|(start, end, catches, catch_all)| ExceptionHandler {
                range: InstructionRange::new(
                    self.instructions[start].id(),
                    self.instructions[end - 1].id(),
                ),
                catches,
                catch_all,
            })
            .collect();
    }

    /// Orders the line table by instruction and drops entries that add nothing
    pub fn normalize_debug_info(&mut self) {
        let mut positions: Vec<(usize, u32)> = self
            .debug_info
            .positions
            .iter()
            .filter_map(|p| self.position(p.instruction).map(|index| (index, p.line)))
            .collect();
        positions.sort_by_key(|(index, _)| *index);

        let mut normalized: Vec<(usize, u32)> = Vec::new();
        for (index, line) in positions {
            match normalized.last_mut() {
                Some(last) if last.0 == index => last.1 = line,
                _ => normalized.push((index, line)),
            }
        }
        normalized.dedup_by(|next, previous| next.1 == previous.1);

        self.debug_info.positions = normalized
            .into_iter()
            .map(|(index, line)| DebugPosition {
                instruction: self.instructions[index].id(),
                line,
            })
            .collect();
    }

    /// Resets every register kind to the one the opcode dictates.
    ///
    /// Encoding keeps only register numbers, so a body read back from a container carries
    /// exactly these kinds.
    pub fn canonicalize_register_kinds(&mut self) {
        for instruction in self.instructions.iter_mut() {
            let kinds: Vec<RegisterKind> = if instruction.opcode.is_invoke() {
                argument_kinds(instruction.opcode, &instruction.operand)
            } else {
                instruction.opcode.register_uses().iter().map(|u| u.kind).collect()
            };
            if kinds.len() != instruction.registers.len() {
                continue;
            }
            for (register, kind) in instruction.registers.iter_mut().zip(kinds) {
                register.kind = kind;
            }
        }
    }

    /// Largest register count passed to an invoke
    pub fn compute_outs_size(&self) -> u16 {
        self.instructions
            .iter()
            .filter(|i| i.opcode.is_invoke())
            .map(|i| i.registers.iter().map(|r| r.kind.width()).sum::<u16>())
            .max()
            .unwrap_or(0)
    }

    /// The body with every instruction identity replaced by its position
    fn positional(&self) -> PositionalBody {
        let at = |id: InstructionId| self.position(id).unwrap_or(usize::MAX);
        let instructions = self
            .instructions
            .iter()
            .map(|i| {
                let operand = match &i.operand {
                    Operand::Target(target) => PositionalOperand::Target(at(*target)),
                    Operand::PackedSwitch { first_key, targets } => PositionalOperand::Switch(
                        *first_key,
                        targets.iter().map(|t| at(*t)).collect(),
                    ),
                    other => PositionalOperand::Plain(other.clone()),
                };
                (i.opcode, i.registers.clone(), operand)
            })
            .collect();
        let handlers = self
            .exception_handlers
            .iter()
            .map(|h| {
                (
                    at(h.range.first),
                    at(h.range.last),
                    h.catches
                        .iter()
                        .map(|c| (c.exception_type.clone(), at(c.handler)))
                        .collect(),
                    h.catch_all.map(at),
                )
            })
            .collect();
        let lines = self
            .debug_info
            .positions
            .iter()
            .map(|p| (at(p.instruction), p.line))
            .collect();
        PositionalBody {
            frame: (self.registers_size, self.ins_size, self.outs_size),
            instructions,
            handlers,
            lines,
        }
    }
}

#[derive(PartialEq)]
enum PositionalOperand {
    Plain(Operand),
    Target(usize),
    Switch(i32, Vec<usize>),
}

type PositionalHandler = (usize, usize, Vec<(ClassReference, usize)>, Option<usize>);

#[derive(PartialEq)]
struct PositionalBody {
    frame: (u16, u16, u16),
    instructions: Vec<(Opcode, Vec<Register>, PositionalOperand)>,
    handlers: Vec<PositionalHandler>,
    lines: Vec<(usize, u32)>,
}

/// Bodies are equal when they hold the same instructions at the same positions,
/// whatever identities those instructions carry
impl PartialEq for MethodBody {
    fn eq(&self, other: &Self) -> bool {
        self.positional() == other.positional()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ClassReference;

    fn body_with_nops(count: usize) -> (MethodBody, Vec<InstructionId>) {
        let mut body = MethodBody::new(1, 0);
        let ids = (0..count)
            .map(|_| body.push(Opcode::Nop, vec![], Operand::None))
            .collect();
        (body, ids)
    }

    #[test]
    fn test_offsets_follow_sizes() {
        let mut body = MethodBody::new(2, 0);
        let a = body.push(Opcode::Const, vec![Register::normal(0)], Operand::Int(70000));
        let b = body.push(Opcode::Goto32, vec![], Operand::Target(a));
        let c = body.push(Opcode::ReturnVoid, vec![], Operand::None);
        assert_eq!(body.offset_of(a).unwrap(), 0);
        assert_eq!(body.offset_of(b).unwrap(), 3);
        assert_eq!(body.offset_of(c).unwrap(), 6);

        body.instruction_mut(b).unwrap().opcode = Opcode::Goto;
        assert_eq!(body.offset_of(c).unwrap(), 4);

        body.insert_before(a, Opcode::Nop, vec![], Operand::None).unwrap();
        assert_eq!(body.offset_of(c).unwrap(), 5);
    }

    #[test]
    fn test_remove_refuses_referenced() {
        let (mut body, ids) = body_with_nops(3);
        body.push(Opcode::Goto, vec![], Operand::Target(ids[1]));
        assert_eq!(body.remove(ids[1]), Err(FormatError::DanglingInstruction(ids[1].0)));

        body.reroute(ids[1], ids[2]);
        assert!(body.remove(ids[1]).is_ok());
        assert_eq!(body.len(), 3);
        assert_eq!(body.instructions()[2].targets(), vec![ids[2]]);
    }

    #[test]
    fn test_range_operations() {
        let (body, ids) = body_with_nops(6);
        let mut range = InstructionRange::new(ids[1], ids[3]);
        assert!(range.contains(&body, ids[2]));
        assert!(!range.contains(&body, ids[4]));
        assert!(range.intersects(&body, &InstructionRange::new(ids[3], ids[5])));
        assert!(!range.intersects(&body, &InstructionRange::new(ids[4], ids[5])));
        range.extend(&body, ids[5]);
        assert_eq!(range.len(&body), 5);
        range.extend(&body, ids[0]);
        assert_eq!(range.first, ids[0]);
    }

    #[test]
    fn test_flatten_nested_ranges() {
        let (mut body, ids) = body_with_nops(6);
        let io = ClassReference::new("Ljava/io/IOException;");
        let any = ClassReference::new("Ljava/lang/Exception;");
        // Outer range first, inner range second.
        body.exception_handlers.push(ExceptionHandler {
            range: InstructionRange::new(ids[0], ids[3]),
            catches: vec![CatchClause { exception_type: any.clone(), handler: ids[5] }],
            catch_all: None,
        });
        body.exception_handlers.push(ExceptionHandler {
            range: InstructionRange::new(ids[1], ids[2]),
            catches: vec![CatchClause { exception_type: io.clone(), handler: ids[4] }],
            catch_all: None,
        });
        body.flatten_exception_handlers();

        let handlers = &body.exception_handlers;
        assert_eq!(handlers.len(), 3);
        assert_eq!(handlers[0].range, InstructionRange::new(ids[0], ids[0]));
        assert_eq!(handlers[1].range, InstructionRange::new(ids[1], ids[2]));
        assert_eq!(handlers[1].catches[0].exception_type, io);
        assert_eq!(handlers[1].catches[1].exception_type, any);
        assert_eq!(handlers[2].range, InstructionRange::new(ids[3], ids[3]));

        let flattened = body.exception_handlers.clone();
        body.flatten_exception_handlers();
        assert_eq!(body.exception_handlers, flattened);
    }

    #[test]
    fn test_positions_move_to_survivor() {
        let (mut body, ids) = body_with_nops(3);
        body.debug_info.positions.push(DebugPosition { instruction: ids[0], line: 7 });
        body.remove_all(&ids[..2]).unwrap();
        assert_eq!(body.debug_info.positions, vec![DebugPosition { instruction: ids[2], line: 7 }]);
    }

    #[test]
    fn test_equality_ignores_identities() {
        let mut a = MethodBody::new(1, 0);
        a.push(Opcode::Nop, vec![], Operand::None);
        let target = a.push(Opcode::ReturnVoid, vec![], Operand::None);
        a.insert_at(0, Opcode::Goto, vec![], Operand::Target(target));

        let mut b = MethodBody::new(1, 0);
        let goto = b.push(Opcode::Goto, vec![], Operand::None);
        b.push(Opcode::Nop, vec![], Operand::None);
        let target = b.push(Opcode::ReturnVoid, vec![], Operand::None);
        b.instruction_mut(goto).unwrap().operand = Operand::Target(target);

        assert_eq!(a, b);
    }
}
