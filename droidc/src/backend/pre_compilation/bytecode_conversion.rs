//! Symbolic execution of imported stack bytecode into the unified tree.
//!
//! Values pushed on the operand stack become expression trees. Anything that could observe an
//! effect is moved into a temporary before the effect happens, and values still on the stack
//! at the end of a basic block are handed to its successors through per depth stack variables.
use std::collections::{BTreeSet, HashMap};

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Bfs, EdgeRef};

use crate::backend::pre_compilation::hir_conversion::{compare_code, constant_expression};
use crate::backend::pre_compilation::ConversionContext;
use crate::error::CompilerError;
use crate::trees::ast::{AstBlock, AstCatch, AstCode, AstExpression, AstNode, AstOperand, AstTryCatch, AstVariable, VariableKind};
use crate::trees::bytecode::{Body, InvokeKind, StackInstruction};
use crate::trees::{SourceLocation, StackKind, TypeRef};

#[derive(Debug, Clone)]
enum StackValue {
    Value(AstExpression),
    /// Result of `new` whose constructor has not run yet
    Uninitialized { id: usize, ty: TypeRef },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Edge {
    Flow,
    Exception,
}

#[derive(Debug, Clone, Copy)]
struct BasicBlock {
    start: usize,
    /// Exclusive
    end: usize,
}

/// Exception table entries sharing one protected range
#[derive(Debug, Clone)]
struct TryGroup {
    start: usize,
    end: usize,
    handlers: Vec<(Option<TypeRef>, usize)>,
}

fn label(index: usize) -> String {
    format!("IL_{:04}", index)
}

fn kind_suffix(kind: StackKind) -> char {
    match kind {
        StackKind::Int => 'i',
        StackKind::Long => 'j',
        StackKind::Float => 'f',
        StackKind::Double => 'd',
        StackKind::Reference | StackKind::Void => 'a',
    }
}

/// The single type every variable of a stack kind is declared with
fn kind_type(kind: StackKind) -> TypeRef {
    match kind {
        StackKind::Int => TypeRef::I32,
        StackKind::Long => TypeRef::I64,
        StackKind::Float => TypeRef::F32,
        StackKind::Double => TypeRef::F64,
        StackKind::Reference | StackKind::Void => TypeRef::Object,
    }
}

fn exception_type() -> TypeRef {
    TypeRef::named("System.Exception")
}

pub struct BytecodeConverter<'a> {
    context: &'a ConversionContext<'a>,
    next_object: usize,
}

impl<'a> BytecodeConverter<'a> {
    pub fn new(context: &'a ConversionContext<'a>) -> Self {
        BytecodeConverter { context, next_object: 0 }
    }

    pub fn convert(&mut self, body: &Body) -> Result<AstBlock, CompilerError> {
        let source = self.context.source;
        if body.instructions.is_empty() {
            return Err(CompilerError::unsupported(&source.location, "method body without instructions"));
        }
        let groups = self.try_groups(body)?;
        let blocks = self.basic_blocks(body)?;
        let block_of: HashMap<usize, usize> = blocks.iter().enumerate().map(|(i, b)| (b.start, i)).collect();

        let mut graph: DiGraph<usize, Edge> = DiGraph::new();
        for index in 0..blocks.len() {
            graph.add_node(index);
        }
        for (index, block) in blocks.iter().enumerate() {
            let last = &body.instructions[block.end - 1];
            let mut successors = last.targets();
            if !last.ends_flow() {
                if block.end >= body.instructions.len() {
                    return Err(CompilerError::unsupported(&self.location(body, block.end - 1), "control falls off the end of the method"));
                }
                successors.push(block.end);
            }
            for successor in successors {
                graph.add_edge(NodeIndex::new(index), NodeIndex::new(block_of[&successor]), Edge::Flow);
            }
            for group in groups.iter().filter(|g| g.start <= block.start && block.end <= g.end) {
                for (_, handler) in group.handlers.iter() {
                    graph.add_edge(NodeIndex::new(index), NodeIndex::new(block_of[handler]), Edge::Exception);
                }
            }
        }

        let mut entry_stacks: Vec<Option<Vec<TypeRef>>> = vec![None; blocks.len()];
        entry_stacks[0] = Some(Vec::new());
        for group in groups.iter() {
            for (catch_type, handler) in group.handlers.iter() {
                let ty = catch_type.clone().unwrap_or_else(exception_type);
                entry_stacks[block_of[handler]] = Some(vec![ty]);
            }
        }

        let mut parts: Vec<Option<Vec<AstNode>>> = vec![None; blocks.len()];
        let mut bfs = Bfs::new(&graph, NodeIndex::new(0));
        while let Some(node) = bfs.next(&graph) {
            let index = node.index();
            let Some(entry) = entry_stacks[index].clone() else {
                unreachable!("blocks are visited after a predecessor set their entry stack");
            };
            let handler_variable = groups
                .iter()
                .flat_map(|g| g.handlers.iter())
                .find(|(_, handler)| *handler == blocks[index].start)
                .map(|(catch_type, handler)| self.exception_variable(*handler, catch_type));
            let (nodes, exit) = self.convert_block(body, blocks[index], &entry, handler_variable)?;
            parts[index] = Some(nodes);
            for edge in graph.edges(node).filter(|e| *e.weight() == Edge::Flow) {
                let successor = edge.target().index();
                match &entry_stacks[successor] {
                    None => entry_stacks[successor] = Some(exit.clone()),
                    Some(existing) => {
                        let kinds = |stack: &[TypeRef]| stack.iter().map(TypeRef::stack_kind).collect::<Vec<_>>();
                        if kinds(existing) != kinds(&exit) {
                            return Err(CompilerError::unsupported(
                                &self.location(body, blocks[successor].start),
                                "operand stack differs between the paths reaching an instruction",
                            ));
                        }
                    }
                }
            }
        }

        let nodes = self.assemble(0, body.instructions.len(), &groups, &blocks, &mut parts);
        Ok(AstBlock::new(nodes))
    }

    /// Groups the exception table by protected range, outer ranges first
    fn try_groups(&self, body: &Body) -> Result<Vec<TryGroup>, CompilerError> {
        let mut groups: Vec<TryGroup> = Vec::new();
        let count = body.instructions.len();
        for entry in body.exception_table.iter() {
            if entry.start >= entry.end || entry.end > count || entry.handler >= count {
                return Err(CompilerError::unsupported(&self.context.source.location, "malformed exception table entry"));
            }
            match groups.iter_mut().find(|g| g.start == entry.start && g.end == entry.end) {
                Some(group) => group.handlers.push((entry.catch_type.clone(), entry.handler)),
                None => groups.push(TryGroup {
                    start: entry.start,
                    end: entry.end,
                    handlers: vec![(entry.catch_type.clone(), entry.handler)],
                }),
            }
        }
        groups.sort_by(|a, b| a.start.cmp(&b.start).then(b.end.cmp(&a.end)));
        for (i, a) in groups.iter().enumerate() {
            for b in groups[i + 1..].iter() {
                let disjoint = a.end <= b.start || b.end <= a.start;
                let nested = a.start <= b.start && b.end <= a.end;
                if !disjoint && !nested {
                    return Err(CompilerError::unsupported(
                        &self.location(body, b.start),
                        "exception ranges overlap without nesting",
                    ));
                }
            }
        }
        Ok(groups)
    }

    fn basic_blocks(&self, body: &Body) -> Result<Vec<BasicBlock>, CompilerError> {
        let count = body.instructions.len();
        let mut leaders = BTreeSet::from([0]);
        for (index, instruction) in body.instructions.iter().enumerate() {
            for target in instruction.targets() {
                if target >= count {
                    return Err(CompilerError::unsupported(&self.location(body, index), format!("branch to missing instruction {}", target)));
                }
                leaders.insert(target);
            }
            if (!instruction.targets().is_empty() || instruction.ends_flow()) && index + 1 < count {
                leaders.insert(index + 1);
            }
        }
        for entry in body.exception_table.iter() {
            leaders.insert(entry.start);
            leaders.insert(entry.handler);
            if entry.end < count {
                leaders.insert(entry.end);
            }
        }
        let starts: Vec<usize> = leaders.into_iter().collect();
        Ok(starts
            .iter()
            .enumerate()
            .map(|(i, start)| BasicBlock {
                start: *start,
                end: starts.get(i + 1).copied().unwrap_or(count),
            })
            .collect())
    }

    fn location(&self, body: &Body, index: usize) -> SourceLocation {
        let source = &self.context.source.location;
        match body.lines.iter().filter(|l| l.instruction <= index).max_by_key(|l| l.instruction) {
            Some(entry) => SourceLocation::new(source.document.clone(), entry.line, 1),
            None => source.clone(),
        }
    }

    fn exception_variable(&self, handler: usize, catch_type: &Option<TypeRef>) -> AstVariable {
        AstVariable::generated(format!("$e{}", handler), catch_type.clone().unwrap_or_else(exception_type))
    }

    fn stack_variable(&self, depth: usize, ty: &TypeRef) -> AstVariable {
        let kind = ty.stack_kind();
        AstVariable::generated(format!("$s{}{}", depth, kind_suffix(kind)), kind_type(kind))
    }

    /// The expression reading `slot`, and the variable behind it unless it holds `this`
    fn slot(&self, slot: u16, ty: &TypeRef, location: &SourceLocation) -> (AstExpression, Option<AstVariable>) {
        let source = self.context.source;
        let mut index = slot as usize;
        if !source.is_static {
            if index == 0 {
                return (AstExpression::this(source.declaring_type.clone(), location.clone()), None);
            }
            index -= 1;
        }
        let variable = match source.parameters.get(index) {
            Some(parameter) => AstVariable::new(parameter.name.clone(), parameter.ty.clone(), VariableKind::Parameter(index as u16)),
            None => {
                let kind = ty.stack_kind();
                AstVariable::new(format!("$l{}{}", slot, kind_suffix(kind)), kind_type(kind), VariableKind::Local)
            }
        };
        (AstExpression::load(&variable, location.clone()).with_type(ty.clone()), Some(variable))
    }

    fn pop(&self, stack: &mut Vec<StackValue>, location: &SourceLocation) -> Result<AstExpression, CompilerError> {
        match stack.pop() {
            Some(StackValue::Value(value)) => Ok(value),
            Some(StackValue::Uninitialized { ty, .. }) => {
                Err(CompilerError::unsupported(location, format!("use of {} before its constructor ran", ty)))
            }
            None => Err(CompilerError::unsupported(location, "operand stack underflow")),
        }
    }

    fn pop_n(&self, stack: &mut Vec<StackValue>, count: usize, location: &SourceLocation) -> Result<Vec<AstExpression>, CompilerError> {
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            values.push(self.pop(stack, location)?);
        }
        values.reverse();
        Ok(values)
    }

    /// Moves every stack entry matching `predicate` into a temporary, bottom to top
    fn flush(&self, stack: &mut [StackValue], out: &mut Vec<AstNode>, predicate: impl Fn(&AstExpression) -> bool) {
        for entry in stack.iter_mut() {
            let StackValue::Value(value) = entry else {
                continue;
            };
            if !predicate(value) {
                continue;
            }
            let location = value.location.clone();
            let temporary = self.context.temporary("t", value.result_type.clone());
            let load = AstExpression::load(&temporary, location.clone());
            let evaluated = std::mem::replace(value, load);
            out.push(AstNode::Expression(AstExpression::store(&temporary, evaluated, location)));
        }
    }

    fn flush_effects(&self, stack: &mut [StackValue], out: &mut Vec<AstNode>) {
        self.flush(stack, out, |value| value.any(&|e| !e.is_pure()));
    }

    fn convert_block(
        &mut self,
        body: &Body,
        block: BasicBlock,
        entry: &[TypeRef],
        exception: Option<AstVariable>,
    ) -> Result<(Vec<AstNode>, Vec<TypeRef>), CompilerError> {
        let mut out = Vec::new();
        let mut stack: Vec<StackValue> = entry
            .iter()
            .enumerate()
            .map(|(depth, ty)| {
                let location = self.location(body, block.start);
                let load = match (&exception, depth) {
                    (Some(variable), 0) => AstExpression::load(variable, location),
                    _ => AstExpression::load(&self.stack_variable(depth, ty), location).with_type(ty.clone()),
                };
                StackValue::Value(load)
            })
            .collect();

        for index in block.start..block.end {
            let location = self.location(body, index);
            let instruction = &body.instructions[index];
            let make = |code: AstCode, operand: AstOperand, arguments: Vec<AstExpression>, ty: TypeRef| {
                AstExpression::new(code, operand, arguments, ty, location.clone())
            };
            let is_last = index + 1 == block.end;
            match instruction {
                StackInstruction::Nop => {}
                StackInstruction::Push { value } => {
                    stack.push(StackValue::Value(constant_expression(value, value.natural_type(), location.clone())));
                }
                StackInstruction::Load { slot, ty } => {
                    let (load, _) = self.slot(*slot, ty, &location);
                    stack.push(StackValue::Value(load));
                }
                StackInstruction::Store { slot, ty } => {
                    let value = self.pop(&mut stack, &location)?;
                    let (_, variable) = self.slot(*slot, ty, &location);
                    let Some(variable) = variable else {
                        return Err(CompilerError::unsupported(&location, "store to the slot holding this"));
                    };
                    self.flush(&mut stack, &mut out, |e| e.any(&|e| e.is_load_of(&variable.name)));
                    self.flush_effects(&mut stack, &mut out);
                    out.push(AstNode::Expression(AstExpression::store(&variable, value, location.clone())));
                }
                StackInstruction::Increment { slot, amount } => {
                    let (load, variable) = self.slot(*slot, &TypeRef::I32, &location);
                    let Some(variable) = variable else {
                        return Err(CompilerError::unsupported(&location, "increment of the slot holding this"));
                    };
                    self.flush(&mut stack, &mut out, |e| e.any(&|e| e.is_load_of(&variable.name)));
                    let sum = make(AstCode::Add, AstOperand::None, vec![load, AstExpression::int(*amount, TypeRef::I32, location.clone())], TypeRef::I32);
                    out.push(AstNode::Expression(AstExpression::store(&variable, sum, location.clone())));
                }
                StackInstruction::Arithmetic { operator, ty } => {
                    let arguments = self.pop_n(&mut stack, 2, &location)?;
                    stack.push(StackValue::Value(make(AstCode::from_binary(*operator), AstOperand::None, arguments, ty.clone())));
                }
                StackInstruction::Negate { ty } => {
                    let value = self.pop(&mut stack, &location)?;
                    stack.push(StackValue::Value(make(AstCode::Neg, AstOperand::None, vec![value], ty.clone())));
                }
                StackInstruction::Convert { to, .. } => {
                    let value = self.pop(&mut stack, &location)?;
                    stack.push(StackValue::Value(make(AstCode::Conv, AstOperand::None, vec![value], to.clone())));
                }
                StackInstruction::IfCompare { operator, target, .. } => {
                    let arguments = self.pop_n(&mut stack, 2, &location)?;
                    let condition = make(compare_code(*operator), AstOperand::None, arguments, TypeRef::Bool);
                    self.spill(&mut stack, &mut out)?;
                    out.push(AstNode::Expression(AstExpression::label_branch(AstCode::Brtrue, label(*target), vec![condition], location.clone())));
                }
                StackInstruction::If { operator, ty, target } => {
                    let value = self.pop(&mut stack, &location)?;
                    let zero = match ty.stack_kind() {
                        StackKind::Reference | StackKind::Void => AstExpression::null(ty.clone(), location.clone()),
                        StackKind::Long => AstExpression::long(0, ty.clone(), location.clone()),
                        StackKind::Float => make(AstCode::LdcR4, AstOperand::Float(0), vec![], ty.clone()),
                        StackKind::Double => make(AstCode::LdcR8, AstOperand::Double(0), vec![], ty.clone()),
                        StackKind::Int => AstExpression::int(0, ty.clone(), location.clone()),
                    };
                    let condition = make(compare_code(*operator), AstOperand::None, vec![value, zero], TypeRef::Bool);
                    self.spill(&mut stack, &mut out)?;
                    out.push(AstNode::Expression(AstExpression::label_branch(AstCode::Brtrue, label(*target), vec![condition], location.clone())));
                }
                StackInstruction::Goto { target } => {
                    self.spill(&mut stack, &mut out)?;
                    out.push(AstNode::Expression(AstExpression::label_branch(AstCode::Br, label(*target), vec![], location.clone())));
                }
                StackInstruction::Switch { first_key, targets, default } => {
                    let value = self.pop(&mut stack, &location)?;
                    self.spill(&mut stack, &mut out)?;
                    let labels = targets.iter().map(|t| label(*t)).collect();
                    out.push(AstNode::Expression(AstExpression::statement(
                        AstCode::Switch,
                        AstOperand::Switch { first_key: *first_key, labels },
                        vec![value],
                        location.clone(),
                    )));
                    out.push(AstNode::Expression(AstExpression::label_branch(AstCode::Br, label(*default), vec![], location.clone())));
                }
                StackInstruction::Return { ty } => {
                    let arguments = if ty.is_void() { Vec::new() } else { vec![self.pop(&mut stack, &location)?] };
                    self.flush_effects(&mut stack, &mut out);
                    out.push(AstNode::Expression(AstExpression::statement(AstCode::Ret, AstOperand::None, arguments, location.clone())));
                }
                StackInstruction::GetField { field } => {
                    let instance = self.pop(&mut stack, &location)?;
                    stack.push(StackValue::Value(make(AstCode::Ldfld, AstOperand::Field(field.clone()), vec![instance], field.field_type.clone())));
                }
                StackInstruction::PutField { field } => {
                    let arguments = self.pop_n(&mut stack, 2, &location)?;
                    self.flush_effects(&mut stack, &mut out);
                    out.push(AstNode::Expression(AstExpression::statement(AstCode::Stfld, AstOperand::Field(field.clone()), arguments, location.clone())));
                }
                StackInstruction::GetStatic { field } => {
                    stack.push(StackValue::Value(make(AstCode::Ldsfld, AstOperand::Field(field.clone()), vec![], field.field_type.clone())));
                }
                StackInstruction::PutStatic { field } => {
                    let value = self.pop(&mut stack, &location)?;
                    self.flush_effects(&mut stack, &mut out);
                    out.push(AstNode::Expression(AstExpression::statement(AstCode::Stsfld, AstOperand::Field(field.clone()), vec![value], location.clone())));
                }
                StackInstruction::Invoke { method, kind } => {
                    let arguments = self.pop_n(&mut stack, method.parameters.len(), &location)?;
                    if method.is_static {
                        self.flush_effects(&mut stack, &mut out);
                        let call = make(AstCode::Call, AstOperand::Method(method.clone()), arguments, method.return_type.clone());
                        self.push_result(call, &mut stack, &mut out);
                        continue;
                    }
                    let receiver = stack.pop().ok_or_else(|| CompilerError::unsupported(&location, "operand stack underflow"))?;
                    match receiver {
                        StackValue::Uninitialized { id, ty } if method.is_constructor() => {
                            self.flush_effects(&mut stack, &mut out);
                            let created = make(AstCode::Newobj, AstOperand::Method(method.clone()), arguments, ty.clone());
                            let copies = stack
                                .iter()
                                .filter(|e| matches!(e, StackValue::Uninitialized { id: other, .. } if *other == id))
                                .count();
                            let replacement = match copies {
                                0 => {
                                    out.push(AstNode::Expression(created));
                                    continue;
                                }
                                1 => created,
                                _ => {
                                    let temporary = self.context.temporary("t", ty.clone());
                                    out.push(AstNode::Expression(AstExpression::store(&temporary, created, location.clone())));
                                    AstExpression::load(&temporary, location.clone())
                                }
                            };
                            for entry in stack.iter_mut() {
                                if matches!(entry, StackValue::Uninitialized { id: other, .. } if *other == id) {
                                    *entry = StackValue::Value(replacement.clone());
                                }
                            }
                        }
                        StackValue::Uninitialized { ty, .. } => {
                            return Err(CompilerError::unsupported(&location, format!("call on {} before its constructor ran", ty)));
                        }
                        StackValue::Value(receiver) => {
                            self.flush_effects(&mut stack, &mut out);
                            let code = match kind {
                                InvokeKind::Virtual | InvokeKind::Interface => AstCode::Callvirt,
                                InvokeKind::Special | InvokeKind::Static => AstCode::Call,
                            };
                            let mut all = Vec::with_capacity(arguments.len() + 1);
                            all.push(receiver);
                            all.extend(arguments);
                            let call = make(code, AstOperand::Method(method.clone()), all, method.return_type.clone());
                            self.push_result(call, &mut stack, &mut out);
                        }
                    }
                }
                StackInstruction::New { ty } => {
                    let id = self.next_object;
                    self.next_object += 1;
                    stack.push(StackValue::Uninitialized { id, ty: ty.clone() });
                }
                StackInstruction::Dup => {
                    let Some(top) = stack.last_mut() else {
                        return Err(CompilerError::unsupported(&location, "operand stack underflow"));
                    };
                    if let StackValue::Value(value) = top {
                        if !value.is_pure() {
                            let temporary = self.context.temporary("t", value.result_type.clone());
                            let evaluated = std::mem::replace(value, AstExpression::load(&temporary, location.clone()));
                            out.push(AstNode::Expression(AstExpression::store(&temporary, evaluated, location.clone())));
                        }
                    }
                    let copy = top.clone();
                    stack.push(copy);
                }
                StackInstruction::Pop => match stack.pop() {
                    Some(StackValue::Value(value)) if !value.is_pure() => {
                        self.flush_effects(&mut stack, &mut out);
                        out.push(AstNode::Expression(value));
                    }
                    Some(_) => {}
                    None => return Err(CompilerError::unsupported(&location, "operand stack underflow")),
                },
                StackInstruction::NewArray { element } => {
                    let length = self.pop(&mut stack, &location)?;
                    let ty = TypeRef::array_of(element.clone());
                    stack.push(StackValue::Value(make(AstCode::Newarr, AstOperand::Type(element.clone()), vec![length], ty)));
                }
                StackInstruction::ArrayLength => {
                    let array = self.pop(&mut stack, &location)?;
                    stack.push(StackValue::Value(make(AstCode::Ldlen, AstOperand::None, vec![array], TypeRef::I32)));
                }
                StackInstruction::ArrayLoad { element } => {
                    let arguments = self.pop_n(&mut stack, 2, &location)?;
                    stack.push(StackValue::Value(make(AstCode::Ldelem, AstOperand::Type(element.clone()), arguments, element.clone())));
                }
                StackInstruction::ArrayStore { element } => {
                    let arguments = self.pop_n(&mut stack, 3, &location)?;
                    self.flush_effects(&mut stack, &mut out);
                    out.push(AstNode::Expression(AstExpression::statement(AstCode::Stelem, AstOperand::Type(element.clone()), arguments, location.clone())));
                }
                StackInstruction::CheckCast { ty } => {
                    let value = self.pop(&mut stack, &location)?;
                    stack.push(StackValue::Value(make(AstCode::Castclass, AstOperand::Type(ty.clone()), vec![value], ty.clone())));
                }
                StackInstruction::InstanceOf { ty } => {
                    let value = self.pop(&mut stack, &location)?;
                    stack.push(StackValue::Value(make(AstCode::Isinst, AstOperand::Type(ty.clone()), vec![value], TypeRef::Bool)));
                }
                StackInstruction::Throw => {
                    let value = self.pop(&mut stack, &location)?;
                    self.flush_effects(&mut stack, &mut out);
                    out.push(AstNode::Expression(AstExpression::statement(AstCode::Throw, AstOperand::None, vec![value], location.clone())));
                }
            }
            if is_last && !instruction.ends_flow() && instruction.targets().is_empty() {
                self.spill(&mut stack, &mut out)?;
            }
        }

        let exit = stack
            .iter()
            .map(|entry| match entry {
                StackValue::Value(value) => value.result_type.clone(),
                StackValue::Uninitialized { ty, .. } => ty.clone(),
            })
            .collect();
        Ok((out, exit))
    }

    fn push_result(&self, call: AstExpression, stack: &mut Vec<StackValue>, out: &mut Vec<AstNode>) {
        if call.result_type.is_void() {
            out.push(AstNode::Expression(call));
        } else {
            stack.push(StackValue::Value(call));
        }
    }

    /// Stores what is left on the stack into the stack variables successors read
    fn spill(&self, stack: &mut [StackValue], out: &mut Vec<AstNode>) -> Result<(), CompilerError> {
        for (depth, entry) in stack.iter_mut().enumerate() {
            let value = match entry {
                StackValue::Value(value) => value,
                StackValue::Uninitialized { ty, .. } => {
                    return Err(CompilerError::unsupported(
                        &self.context.source.location,
                        format!("{} is live across a branch before its constructor ran", ty),
                    ));
                }
            };
            let variable = self.stack_variable(depth, &value.result_type);
            if value.is_load_of(&variable.name) {
                continue;
            }
            let location = value.location.clone();
            let load = AstExpression::load(&variable, location.clone()).with_type(value.result_type.clone());
            let evaluated = std::mem::replace(value, load);
            out.push(AstNode::Expression(AstExpression::store(&variable, evaluated, location)));
        }
        Ok(())
    }

    /// Lays the converted blocks out in instruction order, wrapping protected ranges
    fn assemble(
        &self,
        start: usize,
        end: usize,
        groups: &[TryGroup],
        blocks: &[BasicBlock],
        parts: &mut [Option<Vec<AstNode>>],
    ) -> Vec<AstNode> {
        let mut out = Vec::new();
        let mut index = blocks.partition_point(|b| b.start < start);
        let mut group_index = 0;
        while index < blocks.len() && blocks[index].start < end {
            let block_start = blocks[index].start;
            if let Some(group) = groups.get(group_index).filter(|g| g.start == block_start) {
                let inner_end = groups[group_index + 1..]
                    .iter()
                    .position(|g| g.start >= group.end)
                    .map(|p| group_index + 1 + p)
                    .unwrap_or(groups.len());
                let try_block = self.assemble(group.start, group.end, &groups[group_index + 1..inner_end], blocks, parts);
                let location = self.context.source.location.clone();
                let catches = group
                    .handlers
                    .iter()
                    .map(|(catch_type, handler)| AstCatch {
                        exception_type: catch_type.clone(),
                        variable: Some(self.exception_variable(*handler, catch_type)),
                        body: AstBlock::new(vec![AstNode::Expression(AstExpression::label_branch(
                            AstCode::Br,
                            label(*handler),
                            vec![],
                            location.clone(),
                        ))]),
                        location: location.clone(),
                    })
                    .collect();
                out.push(AstNode::TryCatch(AstTryCatch {
                    try_block: AstBlock::new(try_block),
                    catches,
                    finally: None,
                    location,
                }));
                index = blocks.partition_point(|b| b.start < group.end);
                group_index = inner_end;
                continue;
            }
            out.push(AstNode::Label(label(block_start)));
            if let Some(nodes) = parts[index].take() {
                out.extend(nodes);
            }
            index += 1;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::pre_compilation::tests::{codes, module, roots, source};
    use crate::backend::pre_compilation::DelegateRegistry;
    use crate::model::{MethodOrigin, NameConverter};
    use crate::trees::bytecode::{ExceptionEntry, LineEntry};
    use crate::trees::{BinaryOperator, CompareOperator, Constant, MethodRef};

    fn convert(is_static: bool, parameters: Vec<(&str, TypeRef)>, body: Body) -> Result<AstBlock, CompilerError> {
        let module = module(r#"{"name": "Lib", "scope": "lib", "types": [{"namespace": "Lib", "name": "Widget", "kind": "class"}]}"#);
        let names = NameConverter::new(&module);
        let delegates = DelegateRegistry::new();
        let source = source("Lib.Widget", "Run", is_static, parameters, MethodOrigin::Bytecode(body.clone()));
        let context = ConversionContext::new(&module, &names, &source, &delegates);
        BytecodeConverter::new(&context).convert(&body)
    }

    fn body(instructions: Vec<StackInstruction>) -> Body {
        Body {
            max_locals: 4,
            instructions,
            exception_table: Vec::new(),
            lines: vec![LineEntry { instruction: 0, line: 10 }],
        }
    }

    fn load(slot: u16) -> StackInstruction {
        StackInstruction::Load { slot, ty: TypeRef::I32 }
    }

    fn push(value: i32) -> StackInstruction {
        StackInstruction::Push { value: Constant::Int(value) }
    }

    fn ret() -> StackInstruction {
        StackInstruction::Return { ty: TypeRef::I32 }
    }

    #[test]
    fn test_straight_line_arithmetic() {
        let block = convert(
            true,
            vec![("a", TypeRef::I32), ("b", TypeRef::I32)],
            body(vec![load(0), load(1), StackInstruction::Arithmetic { operator: BinaryOperator::Add, ty: TypeRef::I32 }, ret()]),
        )
        .unwrap();
        assert_eq!(codes(&block), vec![AstCode::Ret, AstCode::Add, AstCode::Ldloc, AstCode::Ldloc]);
        block.for_each_expression(&mut |e| assert_eq!(e.location.line, 10));
    }

    #[test]
    fn test_new_dup_init_becomes_newobj() {
        let widget = TypeRef::named("Lib.Widget");
        let block = convert(
            true,
            vec![],
            body(vec![
                StackInstruction::New { ty: widget.clone() },
                StackInstruction::Dup,
                StackInstruction::Invoke {
                    method: MethodRef::new(widget.clone(), ".ctor", vec![], TypeRef::Void),
                    kind: InvokeKind::Special,
                },
                StackInstruction::Return { ty: widget },
            ]),
        )
        .unwrap();
        assert_eq!(codes(&block), vec![AstCode::Ret, AstCode::Newobj]);
    }

    #[test]
    fn test_value_live_across_branches_is_spilled() {
        // return p != 0 ? 1 : 2
        let block = convert(
            true,
            vec![("p", TypeRef::I32)],
            body(vec![
                load(0),
                StackInstruction::If { operator: CompareOperator::Eq, ty: TypeRef::I32, target: 4 },
                push(1),
                StackInstruction::Goto { target: 5 },
                push(2),
                ret(),
            ]),
        )
        .unwrap();
        assert_eq!(roots(&block), vec![AstCode::Brtrue, AstCode::Stloc, AstCode::Br, AstCode::Stloc, AstCode::Ret]);
        let mut spilled = Vec::new();
        block.for_each_root(&mut |root| {
            if root.code == AstCode::Stloc {
                spilled.push(root.variable().map(|v| v.name.clone()));
            }
        });
        assert_eq!(spilled, vec![Some("$s0i".to_string()), Some("$s0i".to_string())]);
    }

    #[test]
    fn test_pending_load_survives_store_to_its_slot() {
        let block = convert(
            true,
            vec![("p", TypeRef::I32)],
            body(vec![load(0), push(5), StackInstruction::Store { slot: 0, ty: TypeRef::I32 }, ret()]),
        )
        .unwrap();
        assert_eq!(roots(&block), vec![AstCode::Stloc, AstCode::Stloc, AstCode::Ret]);
    }

    #[test]
    fn test_exception_table_becomes_try_catch() {
        let throwable = TypeRef::named("System.Exception");
        let work = MethodRef::new_static(TypeRef::named("Lib.Widget"), "Work", vec![], TypeRef::Void);
        let mut body = body(vec![
            StackInstruction::Invoke { method: work, kind: InvokeKind::Static },
            StackInstruction::Goto { target: 3 },
            StackInstruction::Pop,
            StackInstruction::Return { ty: TypeRef::Void },
        ]);
        body.exception_table.push(ExceptionEntry { start: 0, end: 2, handler: 2, catch_type: Some(throwable) });
        let block = convert(true, vec![], body).unwrap();
        let AstNode::TryCatch(try_catch) = &block.body[0] else {
            panic!("{}", block);
        };
        assert_eq!(try_catch.catches.len(), 1);
        assert_eq!(try_catch.catches[0].variable.as_ref().map(|v| v.name.as_str()), Some("$e2"));
        assert_eq!(roots(&try_catch.try_block), vec![AstCode::Call, AstCode::Br]);
        assert!(block.body.contains(&AstNode::Label("IL_0002".to_string())));
    }

    #[test]
    fn test_overlapping_ranges_fail() {
        let mut body = body(vec![push(1), push(2), StackInstruction::Pop, StackInstruction::Pop, StackInstruction::Return { ty: TypeRef::Void }]);
        body.exception_table.push(ExceptionEntry { start: 0, end: 2, handler: 4, catch_type: None });
        body.exception_table.push(ExceptionEntry { start: 1, end: 3, handler: 4, catch_type: None });
        assert!(convert(true, vec![], body).is_err());
    }

    #[test]
    fn test_inconsistent_stack_fails() {
        let block = convert(
            true,
            vec![("p", TypeRef::I32)],
            body(vec![
                load(0),
                StackInstruction::If { operator: CompareOperator::Eq, ty: TypeRef::I32, target: 3 },
                push(1),
                StackInstruction::Return { ty: TypeRef::Void },
            ]),
        );
        assert!(block.is_err());
    }
}
