use std::collections::{HashMap, HashSet};

use droid_shared::bytecode::{
    argument_kinds, CatchClause, DebugPosition, ExceptionHandler, InstructionId, InstructionRange, MethodBody, Opcode,
    Operand, Register, RegisterKind,
};
use droid_shared::types::{ClassReference, FieldReference, MethodReference, Prototype, TypeReference};

use crate::backend::compiler_utils::{map_registers, simplify_branches, spill_registers, Frame};
use crate::backend::peephole;
use crate::backend::pre_compilation::ConversionContext;
use crate::error::CompilerError;
use crate::model::boxed_descriptor;
use crate::trees::ast::{AstBlock, AstCode, AstExpression, AstNode, AstOperand, AstTryCatch, AstVariable, VariableKind};
use crate::trees::{SourceLocation, StackKind, TypeRef};

/// Register kind holding a value of `ty`, `None` for void
pub fn register_kind(ty: &TypeRef) -> Option<RegisterKind> {
    match ty.stack_kind() {
        StackKind::Void => None,
        StackKind::Int | StackKind::Float => Some(RegisterKind::Normal),
        StackKind::Long | StackKind::Double => Some(RegisterKind::Wide),
        StackKind::Reference => Some(RegisterKind::Object),
    }
}

/// Member access opcodes in the order plain, wide, object, boolean, byte, char, short
type AccessFamily = [Opcode; 7];

const IGET: AccessFamily = [
    Opcode::Iget,
    Opcode::IgetWide,
    Opcode::IgetObject,
    Opcode::IgetBoolean,
    Opcode::IgetByte,
    Opcode::IgetChar,
    Opcode::IgetShort,
];
const IPUT: AccessFamily = [
    Opcode::Iput,
    Opcode::IputWide,
    Opcode::IputObject,
    Opcode::IputBoolean,
    Opcode::IputByte,
    Opcode::IputChar,
    Opcode::IputShort,
];
const SGET: AccessFamily = [
    Opcode::Sget,
    Opcode::SgetWide,
    Opcode::SgetObject,
    Opcode::SgetBoolean,
    Opcode::SgetByte,
    Opcode::SgetChar,
    Opcode::SgetShort,
];
const SPUT: AccessFamily = [
    Opcode::Sput,
    Opcode::SputWide,
    Opcode::SputObject,
    Opcode::SputBoolean,
    Opcode::SputByte,
    Opcode::SputChar,
    Opcode::SputShort,
];
const AGET: AccessFamily = [
    Opcode::Aget,
    Opcode::AgetWide,
    Opcode::AgetObject,
    Opcode::AgetBoolean,
    Opcode::AgetByte,
    Opcode::AgetChar,
    Opcode::AgetShort,
];
const APUT: AccessFamily = [
    Opcode::Aput,
    Opcode::AputWide,
    Opcode::AputObject,
    Opcode::AputBoolean,
    Opcode::AputByte,
    Opcode::AputChar,
    Opcode::AputShort,
];

fn access_opcode(family: &AccessFamily, ty: &TypeRef) -> Opcode {
    let index = match ty {
        TypeRef::Bool => 3,
        TypeRef::I8 | TypeRef::U8 => 4,
        TypeRef::Char | TypeRef::U16 => 5,
        TypeRef::I16 => 6,
        _ => match register_kind(ty) {
            Some(RegisterKind::Wide) => 1,
            Some(RegisterKind::Object) => 2,
            _ => 0,
        },
    };
    family[index]
}

fn binary_opcode(code: AstCode, kind: StackKind) -> Option<Opcode> {
    use Opcode::*;
    let opcode = match (kind, code) {
        (StackKind::Int, AstCode::Add) => AddInt,
        (StackKind::Int, AstCode::Sub) => SubInt,
        (StackKind::Int, AstCode::Mul) => MulInt,
        (StackKind::Int, AstCode::Div) => DivInt,
        (StackKind::Int, AstCode::Rem) => RemInt,
        (StackKind::Int, AstCode::And) => AndInt,
        (StackKind::Int, AstCode::Or) => OrInt,
        (StackKind::Int, AstCode::Xor) => XorInt,
        (StackKind::Int, AstCode::Shl) => ShlInt,
        (StackKind::Int, AstCode::Shr) => ShrInt,
        (StackKind::Int, AstCode::ShrUn) => UshrInt,
        (StackKind::Long, AstCode::Add) => AddLong,
        (StackKind::Long, AstCode::Sub) => SubLong,
        (StackKind::Long, AstCode::Mul) => MulLong,
        (StackKind::Long, AstCode::Div) => DivLong,
        (StackKind::Long, AstCode::Rem) => RemLong,
        (StackKind::Long, AstCode::And) => AndLong,
        (StackKind::Long, AstCode::Or) => OrLong,
        (StackKind::Long, AstCode::Xor) => XorLong,
        (StackKind::Long, AstCode::Shl) => ShlLong,
        (StackKind::Long, AstCode::Shr) => ShrLong,
        (StackKind::Long, AstCode::ShrUn) => UshrLong,
        (StackKind::Float, AstCode::Add) => AddFloat,
        (StackKind::Float, AstCode::Sub) => SubFloat,
        (StackKind::Float, AstCode::Mul) => MulFloat,
        (StackKind::Float, AstCode::Div) => DivFloat,
        (StackKind::Float, AstCode::Rem) => RemFloat,
        (StackKind::Double, AstCode::Add) => AddDouble,
        (StackKind::Double, AstCode::Sub) => SubDouble,
        (StackKind::Double, AstCode::Mul) => MulDouble,
        (StackKind::Double, AstCode::Div) => DivDouble,
        (StackKind::Double, AstCode::Rem) => RemDouble,
        _ => return None,
    };
    Some(opcode)
}

/// Branch on two registers for a comparison, signed
fn compare_opcode(code: AstCode) -> Opcode {
    match code {
        AstCode::Ceq => Opcode::IfEq,
        AstCode::Cne => Opcode::IfNe,
        AstCode::Clt => Opcode::IfLt,
        AstCode::Cle => Opcode::IfLe,
        AstCode::Cgt => Opcode::IfGt,
        AstCode::Cge => Opcode::IfGe,
        _ => unreachable!("{:?} is not a comparison", code),
    }
}

/// Branch on one register against zero
fn compare_zero_opcode(code: AstCode) -> Opcode {
    match code {
        AstCode::Ceq => Opcode::IfEqz,
        AstCode::Cne => Opcode::IfNez,
        AstCode::Clt => Opcode::IfLtz,
        AstCode::Cle => Opcode::IfLez,
        AstCode::Cgt => Opcode::IfGtz,
        AstCode::Cge => Opcode::IfGez,
        _ => unreachable!("{:?} is not a comparison", code),
    }
}

fn is_zero(expression: &AstExpression) -> bool {
    match (&expression.code, &expression.operand) {
        (AstCode::Ldnull, _) => true,
        (AstCode::LdcI4, AstOperand::Int(0)) => true,
        _ => false,
    }
}

fn unsigned_helper(code: AstCode, kind: StackKind) -> Option<MethodReference> {
    let name = match code {
        AstCode::Div => "divideUnsigned",
        AstCode::Rem => "remainderUnsigned",
        _ => return None,
    };
    let (owner, ty) = match kind {
        StackKind::Int => ("Ljava/lang/Integer;", TypeReference::int()),
        StackKind::Long => ("Ljava/lang/Long;", TypeReference::long()),
        _ => return None,
    };
    Some(MethodReference::new(
        ClassReference::new(owner),
        name,
        Prototype::new(ty.clone(), vec![ty.clone(), ty]),
    ))
}

enum Jump {
    Label(String),
    Switch { first_key: i32, labels: Vec<String> },
}

/// An open try region while its protected block is being lowered
struct Region {
    start: InstructionId,
    segments: Vec<(InstructionId, InstructionId)>,
    labels: HashSet<String>,
    finally: Option<AstBlock>,
}

/// Lowers the tree of one method to register instructions.
///
/// Labels become `nop` anchors and branches are emitted in their widest form; the passes run
/// by [`MethodCompiler::finish`] narrow and drop what is not needed.
pub struct MethodCompiler<'a, 'b> {
    context: &'a ConversionContext<'b>,
    debug_info: bool,
    frame: Frame,
    body: MethodBody,
    this: Option<Register>,
    parameters: Vec<Register>,
    labels: HashMap<String, InstructionId>,
    jumps: Vec<(InstructionId, Jump, SourceLocation)>,
    regions: Vec<Region>,
    renames: Vec<HashMap<String, String>>,
    /// Region starts placed after a jump out of the region, unreachable by fall through
    reopened: HashSet<InstructionId>,
    counter: u32,
}

impl<'a, 'b> MethodCompiler<'a, 'b> {
    pub fn new(context: &'a ConversionContext<'b>, debug_info: bool) -> Self {
        let source = context.source;
        let mut next = 0;
        let this = if source.is_static {
            None
        } else {
            next += 1;
            Some(Register::object(0))
        };
        let mut parameters = Vec::with_capacity(source.parameters.len());
        for parameter in source.parameters.iter() {
            let kind = register_kind(&parameter.ty).unwrap_or(RegisterKind::Normal);
            parameters.push(Register::new(next, kind));
            next += kind.width();
        }
        MethodCompiler {
            context,
            debug_info,
            frame: Frame::new(next),
            body: MethodBody::new(0, next),
            this,
            parameters,
            labels: HashMap::new(),
            jumps: Vec::new(),
            regions: Vec::new(),
            renames: Vec::new(),
            reopened: HashSet::new(),
            counter: 0,
        }
    }

    /// Lowers `block` and runs every pass up to the final body
    pub fn compile(mut self, block: &AstBlock) -> Result<MethodBody, CompilerError> {
        for variable in block.variables() {
            if matches!(variable.kind, VariableKind::Parameter(_)) {
                continue;
            }
            let kind = register_kind(&variable.ty).ok_or_else(|| {
                CompilerError::unsupported(&self.context.source.location, format!("variable {} of type void", variable.name))
            })?;
            self.frame.add_binding(&variable.name, kind);
        }
        self.compile_block(block)?;
        self.finish()
    }

    fn finish(mut self) -> Result<MethodBody, CompilerError> {
        if self.context.source.return_type.is_void() && !self.ends_flow() {
            self.body.push(Opcode::ReturnVoid, vec![], Operand::None);
        }
        self.resolve_jumps()?;
        simplify_branches(&mut self.body)?;
        map_registers(&mut self.body, self.frame.arguments(), self.frame.locals_size());
        spill_registers(&mut self.body)?;
        peephole::optimize(&mut self.body)?;
        self.body.outs_size = self.body.compute_outs_size();
        Ok(self.body)
    }

    fn resolve_jumps(&mut self) -> Result<(), CompilerError> {
        for (id, jump, location) in std::mem::take(&mut self.jumps) {
            let target = |label: &String| {
                self.labels
                    .get(label)
                    .copied()
                    .ok_or_else(|| CompilerError::unsupported(&location, format!("branch to undefined label {}", label)))
            };
            let operand = match &jump {
                Jump::Label(label) => Operand::Target(target(label)?),
                Jump::Switch { first_key, labels } => Operand::PackedSwitch {
                    first_key: *first_key,
                    targets: labels.iter().map(|label| target(label)).collect::<Result<Vec<_>, _>>()?,
                },
            };
            if let Some(instruction) = self.body.instruction_mut(id) {
                instruction.operand = operand;
            }
        }
        Ok(())
    }

    fn ends_flow(&self) -> bool {
        self.body
            .instructions()
            .iter()
            .rev()
            .find(|instruction| !self.reopened.contains(&instruction.id()))
            .is_some_and(|instruction| instruction.opcode.ends_flow())
    }

    fn fresh_label(&mut self) -> String {
        self.counter += 1;
        format!("$c{}", self.counter)
    }

    /// Label names are unique per copy of a finally block
    fn resolve_label(&self, label: &str) -> String {
        for renames in self.renames.iter().rev() {
            if let Some(renamed) = renames.get(label) {
                return renamed.clone();
            }
        }
        label.to_string()
    }

    fn place_label(&mut self, label: String) {
        let anchor = self.body.push(Opcode::Nop, vec![], Operand::None);
        self.labels.insert(label, anchor);
    }

    fn push_jump(&mut self, opcode: Opcode, registers: Vec<Register>, jump: Jump, location: &SourceLocation) {
        let id = self.body.push(opcode, registers, Operand::None);
        self.jumps.push((id, jump, location.clone()));
    }

    fn argument<'e>(&self, expression: &'e AstExpression, index: usize) -> Result<&'e AstExpression, CompilerError> {
        expression.arguments.get(index).ok_or_else(|| {
            CompilerError::unsupported(&expression.location, format!("{:?} is missing operand {}", expression.code, index))
        })
    }

    fn variable_register(&self, variable: &AstVariable, location: &SourceLocation) -> Result<Register, CompilerError> {
        let register = match variable.kind {
            VariableKind::Parameter(index) => self.parameters.get(index as usize).copied(),
            _ => self.frame.get_binding(&variable.name),
        };
        register.ok_or_else(|| CompilerError::unsupported(location, format!("unknown variable {}", variable.name)))
    }

    fn this_register(&self, location: &SourceLocation) -> Result<Register, CompilerError> {
        self.this
            .ok_or_else(|| CompilerError::unsupported(location, "this in a static method"))
    }

    fn target(&mut self, dest: Option<Register>, ty: &TypeRef) -> Register {
        match dest {
            Some(dest) => dest,
            None => self.frame.temporary(register_kind(ty).unwrap_or(RegisterKind::Normal)),
        }
    }

    fn move_register(&mut self, to: Register, from: Register) {
        if to.index != from.index {
            self.body.push(Opcode::move_for(to.kind), vec![to, from], Operand::None);
        }
    }

    /// `register` moved into `dest` when one was asked for
    fn deliver(&mut self, register: Register, dest: Option<Register>) -> Register {
        match dest {
            Some(dest) => {
                self.move_register(dest, register);
                dest
            }
            None => register,
        }
    }

    fn compile_block(&mut self, block: &AstBlock) -> Result<(), CompilerError> {
        for node in block.body.iter() {
            match node {
                AstNode::Label(label) => {
                    let label = self.resolve_label(label);
                    self.place_label(label);
                }
                AstNode::Expression(expression) => self.compile_statement(expression)?,
                AstNode::Block(inner) => self.compile_block(inner)?,
                AstNode::TryCatch(try_catch) => self.compile_try_catch(try_catch)?,
            }
        }
        Ok(())
    }

    fn compile_statement(&mut self, expression: &AstExpression) -> Result<(), CompilerError> {
        let start = self.body.len();
        let location = self.frame.get_location();
        self.compile_effect(expression)?;
        self.frame.release(location);

        if self.debug_info && expression.location.is_known() && self.body.len() > start {
            let instruction = self.body.instructions()[start].id();
            self.body.debug_info.positions.push(DebugPosition {
                instruction,
                line: expression.location.line,
            });
        }
        Ok(())
    }

    /// Lowers an expression whose value, if any, is not used
    fn compile_effect(&mut self, expression: &AstExpression) -> Result<(), CompilerError> {
        let location = &expression.location;
        match expression.code {
            AstCode::Nop => {}
            AstCode::Br => {
                let label = self.branch_label(expression)?;
                self.compile_exit(Some(&label))?;
                self.push_jump(Opcode::Goto32, vec![], Jump::Label(label.clone()), location);
                self.reopen_exited(Some(&label));
            }
            AstCode::Brtrue | AstCode::Brfalse => {
                let label = self.branch_label(expression)?;
                if self.exits_finally(Some(&label)) {
                    return Err(CompilerError::unsupported(location, "conditional branch out of a finally region"));
                }
                let condition = self.argument(expression, 0)?;
                self.compile_condition(condition, &label, expression.code == AstCode::Brtrue)?;
            }
            AstCode::Switch => {
                let AstOperand::Switch { first_key, labels } = &expression.operand else {
                    return Err(CompilerError::unsupported(location, "switch without a jump table"));
                };
                let labels: Vec<String> = labels.iter().map(|l| self.resolve_label(l)).collect();
                if labels.iter().any(|label| self.exits_finally(Some(label))) {
                    return Err(CompilerError::unsupported(location, "switch out of a finally region"));
                }
                let value = self.compile_value(self.argument(expression, 0)?, None)?;
                let jump = Jump::Switch {
                    first_key: *first_key,
                    labels,
                };
                self.push_jump(Opcode::PackedSwitch, vec![value], jump, location);
            }
            AstCode::Ret => self.compile_return(expression)?,
            AstCode::Throw => {
                let value = self.compile_value(self.argument(expression, 0)?, None)?;
                self.body.push(Opcode::Throw, vec![value], Operand::None);
            }
            AstCode::Stloc => {
                let variable = expression
                    .variable()
                    .ok_or_else(|| CompilerError::unsupported(location, "store without a variable"))?;
                let register = self.variable_register(variable, location)?;
                self.compile_into(self.argument(expression, 0)?, register)?;
            }
            AstCode::Stfld => {
                let field = self.field_operand(expression)?;
                let object = self.compile_value(self.argument(expression, 0)?, None)?;
                let value = self.compile_value(self.argument(expression, 1)?, None)?;
                let opcode = access_opcode(&IPUT, &field.1);
                self.body.push(opcode, vec![value, object], Operand::Field(field.0));
            }
            AstCode::Stsfld => {
                let field = self.field_operand(expression)?;
                let value = self.compile_value(self.argument(expression, 0)?, None)?;
                let opcode = access_opcode(&SPUT, &field.1);
                self.body.push(opcode, vec![value], Operand::Field(field.0));
            }
            AstCode::Stelem => {
                let array = self.argument(expression, 0)?;
                let value_expression = self.argument(expression, 2)?;
                let element = expression
                    .type_operand()
                    .or_else(|| array.result_type.element())
                    .cloned()
                    .unwrap_or_else(|| value_expression.result_type.clone());
                let array = self.compile_value(array, None)?;
                let index = self.compile_value(self.argument(expression, 1)?, None)?;
                let value = self.compile_value(value_expression, None)?;
                self.body.push(access_opcode(&APUT, &element), vec![value, array, index], Operand::None);
            }
            AstCode::Sequence => {
                for argument in expression.arguments.iter() {
                    self.compile_effect(argument)?;
                }
            }
            AstCode::Conditional if expression.result_type.is_void() => {
                let otherwise = self.fresh_label();
                let end = self.fresh_label();
                self.compile_condition(self.argument(expression, 0)?, &otherwise, false)?;
                self.compile_effect(self.argument(expression, 1)?)?;
                self.push_jump(Opcode::Goto32, vec![], Jump::Label(end.clone()), location);
                self.place_label(otherwise);
                self.compile_effect(self.argument(expression, 2)?)?;
                self.place_label(end);
            }
            _ => {
                self.compile_expression(expression, None)?;
            }
        }
        Ok(())
    }

    fn branch_label(&self, expression: &AstExpression) -> Result<String, CompilerError> {
        match &expression.operand {
            AstOperand::Label(label) => Ok(self.resolve_label(label)),
            _ => Err(CompilerError::unsupported(&expression.location, "branch without a label")),
        }
    }

    fn field_operand(&self, expression: &AstExpression) -> Result<(FieldReference, TypeRef), CompilerError> {
        let field = expression
            .field()
            .ok_or_else(|| CompilerError::unsupported(&expression.location, "field access without a field"))?;
        Ok((self.context.names.field_reference(field), field.field_type.clone()))
    }

    /// Number of innermost regions a jump to `label` leaves, every region when `label` is `None`
    fn exited_regions(&self, label: Option<&str>) -> usize {
        match label {
            None => self.regions.len(),
            Some(label) => self.regions.iter().rev().take_while(|r| !r.labels.contains(label)).count(),
        }
    }

    fn exits_finally(&self, label: Option<&str>) -> bool {
        let exited = self.exited_regions(label);
        self.regions.iter().rev().take(exited).any(|r| r.finally.is_some())
    }

    /// Runs the finally blocks of every region a jump leaves, each outside its own range
    fn compile_exit(&mut self, label: Option<&str>) -> Result<(), CompilerError> {
        if !self.exits_finally(label) {
            return Ok(());
        }
        let exited = self.exited_regions(label);
        let first = self.regions.len() - exited;
        for index in (first..self.regions.len()).rev() {
            let end = self.body.push(Opcode::Nop, vec![], Operand::None);
            let region = &mut self.regions[index];
            region.segments.push((region.start, end));
            if let Some(finally) = region.finally.clone() {
                let saved = self.frame.get_location();
                self.compile_finally(&finally)?;
                self.frame.release(saved);
            }
        }
        Ok(())
    }

    fn reopen_exited(&mut self, label: Option<&str>) {
        if !self.exits_finally(label) {
            return;
        }
        let exited = self.exited_regions(label);
        let first = self.regions.len() - exited;
        for index in first..self.regions.len() {
            let start = self.body.push(Opcode::Nop, vec![], Operand::None);
            self.reopened.insert(start);
            self.regions[index].start = start;
        }
    }

    /// Lowers a copy of a finally block with its own labels
    fn compile_finally(&mut self, finally: &AstBlock) -> Result<(), CompilerError> {
        self.counter += 1;
        let copy = self.counter;
        let mut renames = HashMap::new();
        finally.visit_nodes(&mut |node| {
            if let AstNode::Label(label) = node {
                renames.insert(label.clone(), format!("{}$f{}", label, copy));
            }
        });
        self.renames.push(renames);
        let result = self.compile_block(finally);
        self.renames.pop();
        result
    }

    fn compile_return(&mut self, expression: &AstExpression) -> Result<(), CompilerError> {
        let leaves_finally = self.exits_finally(None);
        let value = match expression.arguments.first() {
            Some(value) => {
                let dest = match (leaves_finally, register_kind(&value.result_type)) {
                    (true, Some(kind)) => Some(self.frame.temporary(kind)),
                    _ => None,
                };
                let register = match dest {
                    Some(dest) => self.compile_into(value, dest)?,
                    None => self.compile_value(value, None)?,
                };
                Some(register)
            }
            None => None,
        };
        self.compile_exit(None)?;
        match value {
            Some(register) => {
                let opcode = Opcode::return_for(Some(register.kind));
                self.body.push(opcode, vec![register], Operand::None);
            }
            None => {
                self.body.push(Opcode::ReturnVoid, vec![], Operand::None);
            }
        }
        self.reopen_exited(None);
        Ok(())
    }

    fn compile_try_catch(&mut self, try_catch: &AstTryCatch) -> Result<(), CompilerError> {
        if try_catch.finally.is_some() && !try_catch.catches.is_empty() {
            // try { try { .. } catch { .. } } finally { .. }
            let inner = AstTryCatch {
                try_block: try_catch.try_block.clone(),
                catches: try_catch.catches.clone(),
                finally: None,
                location: try_catch.location.clone(),
            };
            let outer = AstTryCatch {
                try_block: AstBlock::new(vec![AstNode::TryCatch(inner)]),
                catches: Vec::new(),
                finally: try_catch.finally.clone(),
                location: try_catch.location.clone(),
            };
            return self.compile_try_catch(&outer);
        }

        let location = &try_catch.location;
        let mut labels = HashSet::new();
        try_catch.try_block.visit_nodes(&mut |node| {
            if let AstNode::Label(label) = node {
                labels.insert(label.clone());
            }
        });
        let labels = labels.iter().map(|label| self.resolve_label(label)).collect();

        let start = self.body.push(Opcode::Nop, vec![], Operand::None);
        self.regions.push(Region {
            start,
            segments: Vec::new(),
            labels,
            finally: try_catch.finally.clone(),
        });
        let compiled = self.compile_block(&try_catch.try_block);
        let Some(mut region) = self.regions.pop() else {
            unreachable!("try region stack is empty");
        };
        compiled?;
        let falls_through = !self.ends_flow();
        let end = self.body.push(Opcode::Nop, vec![], Operand::None);
        region.segments.push((region.start, end));

        let after = self.fresh_label();
        let mut clauses = Vec::new();
        let mut catch_all = None;
        if let Some(finally) = &try_catch.finally {
            if falls_through {
                self.compile_finally(finally)?;
                if !self.ends_flow() {
                    self.push_jump(Opcode::Goto32, vec![], Jump::Label(after.clone()), location);
                }
            }
            let saved = self.frame.get_location();
            let exception = self.frame.temporary(RegisterKind::Object);
            let handler = self.body.push(Opcode::MoveException, vec![exception], Operand::None);
            self.compile_finally(finally)?;
            if !self.ends_flow() {
                self.body.push(Opcode::Throw, vec![exception], Operand::None);
            }
            self.frame.release(saved);
            catch_all = Some(handler);
        } else {
            if falls_through {
                self.push_jump(Opcode::Goto32, vec![], Jump::Label(after.clone()), location);
            }
            for catch in try_catch.catches.iter() {
                let handler = match &catch.variable {
                    Some(variable) => {
                        let register = self.variable_register(variable, &catch.location)?;
                        self.body.push(Opcode::MoveException, vec![register], Operand::None)
                    }
                    None => self.body.push(Opcode::Nop, vec![], Operand::None),
                };
                self.compile_block(&catch.body)?;
                if !self.ends_flow() {
                    self.push_jump(Opcode::Goto32, vec![], Jump::Label(after.clone()), &catch.location);
                }
                match &catch.exception_type {
                    Some(ty) => clauses.push(CatchClause {
                        exception_type: self.context.names.class_reference(ty),
                        handler,
                    }),
                    None => {
                        catch_all.get_or_insert(handler);
                    }
                }
            }
        }
        self.place_label(after);

        for (first, last) in region.segments {
            self.body.exception_handlers.push(ExceptionHandler {
                range: InstructionRange::new(first, last),
                catches: clauses.clone(),
                catch_all,
            });
        }
        Ok(())
    }

    /// Emits the branches jumping to `label` when `condition` evaluates to `jump_if`
    fn compile_condition(&mut self, condition: &AstExpression, label: &str, jump_if: bool) -> Result<(), CompilerError> {
        let location = &condition.location;
        match condition.code {
            AstCode::LogicNot => self.compile_condition(self.argument(condition, 0)?, label, !jump_if),
            AstCode::LogicAnd | AstCode::LogicOr => {
                let left = self.argument(condition, 0)?;
                let right = self.argument(condition, 1)?;
                // `and` jumping on true and `or` jumping on false need to skip over the right side
                let short_circuit = (condition.code == AstCode::LogicAnd) == jump_if;
                if short_circuit {
                    let skip = self.fresh_label();
                    self.compile_condition(left, &skip, !jump_if)?;
                    self.compile_condition(right, label, jump_if)?;
                    self.place_label(skip);
                } else {
                    self.compile_condition(left, label, jump_if)?;
                    self.compile_condition(right, label, jump_if)?;
                }
                Ok(())
            }
            AstCode::LdcI4 => {
                if let AstOperand::Int(value) = condition.operand {
                    if (value != 0) == jump_if {
                        self.push_jump(Opcode::Goto32, vec![], Jump::Label(label.to_string()), location);
                    }
                }
                Ok(())
            }
            code if code.is_compare() => self.compile_compare_branch(condition, label, jump_if),
            _ => {
                let value = self.compile_value(condition, None)?;
                let opcode = if jump_if { Opcode::IfNez } else { Opcode::IfEqz };
                self.push_jump(opcode, vec![value], Jump::Label(label.to_string()), location);
                Ok(())
            }
        }
    }

    fn compile_compare_branch(&mut self, compare: &AstExpression, label: &str, jump_if: bool) -> Result<(), CompilerError> {
        let location = &compare.location;
        let left = self.argument(compare, 0)?;
        let right = self.argument(compare, 1)?;
        let code = if jump_if {
            compare.code
        } else {
            compare.code.negate_compare().unwrap_or(compare.code)
        };
        let operand_type = if left.code == AstCode::Ldnull { &right.result_type } else { &left.result_type };
        let ordered = !matches!(compare.code, AstCode::Ceq | AstCode::Cne);
        let jump = || Jump::Label(label.to_string());

        match operand_type.stack_kind() {
            StackKind::Int | StackKind::Reference | StackKind::Void => {
                if ordered && operand_type.is_unsigned() {
                    let left = self.compile_value(left, None)?;
                    let right = self.compile_value(right, None)?;
                    let left = self.flip_sign(left);
                    let right = self.flip_sign(right);
                    self.push_jump(compare_opcode(code), vec![left, right], jump(), location);
                } else if is_zero(right) {
                    let left = self.compile_value(left, None)?;
                    self.push_jump(compare_zero_opcode(code), vec![left], jump(), location);
                } else {
                    let left = self.compile_value(left, None)?;
                    let right = self.compile_value(right, None)?;
                    self.push_jump(compare_opcode(code), vec![left, right], jump(), location);
                }
            }
            kind => {
                let mut left = self.compile_value(left, None)?;
                let mut right = self.compile_value(right, None)?;
                let opcode = match kind {
                    StackKind::Long => {
                        if ordered && operand_type.is_unsigned() {
                            left = self.flip_sign(left);
                            right = self.flip_sign(right);
                        }
                        Opcode::CmpLong
                    }
                    // NaN makes `<` and `<=` false through cmpg and `>` and `>=` through cmpl
                    StackKind::Float if matches!(compare.code, AstCode::Clt | AstCode::Cle) => Opcode::CmpgFloat,
                    StackKind::Float => Opcode::CmplFloat,
                    _ if matches!(compare.code, AstCode::Clt | AstCode::Cle) => Opcode::CmpgDouble,
                    _ => Opcode::CmplDouble,
                };
                let result = self.frame.temporary(RegisterKind::Normal);
                self.body.push(opcode, vec![result, left, right], Operand::None);
                self.push_jump(compare_zero_opcode(code), vec![result], jump(), location);
            }
        }
        Ok(())
    }

    /// Flips the sign bit so unsigned order becomes signed order
    fn flip_sign(&mut self, value: Register) -> Register {
        let mask = self.frame.temporary(value.kind);
        let result = self.frame.temporary(value.kind);
        if value.kind == RegisterKind::Wide {
            self.body.push(Opcode::ConstWide, vec![mask], Operand::Wide(i64::MIN));
            self.body.push(Opcode::XorLong, vec![result, value, mask], Operand::None);
        } else {
            self.body.push(Opcode::Const, vec![mask], Operand::Int(i32::MIN));
            self.body.push(Opcode::XorInt, vec![result, value, mask], Operand::None);
        }
        result
    }

    /// Lowers `expression` so its value ends up in `dest`
    fn compile_into(&mut self, expression: &AstExpression, dest: Register) -> Result<Register, CompilerError> {
        let register = self.compile_value(expression, Some(dest))?;
        self.move_register(dest, register);
        Ok(dest)
    }

    /// Lowers `expression` and returns the register holding its value.
    ///
    /// `dest` is a hint: instructions writing their result last write it there directly.
    fn compile_value(&mut self, expression: &AstExpression, dest: Option<Register>) -> Result<Register, CompilerError> {
        match self.compile_expression(expression, dest)? {
            Some(register) => Ok(register),
            None => Err(CompilerError::unsupported(
                &expression.location,
                format!("{:?} has no value", expression.code),
            )),
        }
    }

    fn compile_expression(&mut self, expression: &AstExpression, dest: Option<Register>) -> Result<Option<Register>, CompilerError> {
        let location = &expression.location;
        let ty = &expression.result_type;
        let register = match expression.code {
            AstCode::Ldloc => {
                let variable = expression
                    .variable()
                    .ok_or_else(|| CompilerError::unsupported(location, "load without a variable"))?;
                let register = self.variable_register(variable, location)?;
                self.deliver(register, dest)
            }
            AstCode::Ldthis => {
                let register = self.this_register(location)?;
                self.deliver(register, dest)
            }
            AstCode::Ldnull => {
                let dest = self.target(dest, ty);
                self.body.push(Opcode::Const, vec![dest], Operand::Int(0));
                dest
            }
            AstCode::LdcI4 | AstCode::LdcR4 => {
                let value = match expression.operand {
                    AstOperand::Int(value) => value,
                    AstOperand::Float(bits) => bits as i32,
                    _ => return Err(CompilerError::unsupported(location, "constant without a value")),
                };
                let dest = self.target(dest, ty);
                self.body.push(Opcode::Const, vec![dest], Operand::Int(value));
                dest
            }
            AstCode::LdcI8 | AstCode::LdcR8 => {
                let value = match expression.operand {
                    AstOperand::Long(value) => value,
                    AstOperand::Double(bits) => bits as i64,
                    _ => return Err(CompilerError::unsupported(location, "constant without a value")),
                };
                let dest = self.target(dest, ty);
                self.body.push(Opcode::ConstWide, vec![dest], Operand::Wide(value));
                dest
            }
            AstCode::Ldstr => {
                let AstOperand::String(value) = &expression.operand else {
                    return Err(CompilerError::unsupported(location, "string constant without a value"));
                };
                let dest = self.target(dest, ty);
                self.body.push(Opcode::ConstString, vec![dest], Operand::String(value.clone()));
                dest
            }
            AstCode::TypeOf => {
                let operand = expression
                    .type_operand()
                    .ok_or_else(|| CompilerError::unsupported(location, "typeof without a type"))?;
                let dest = self.target(dest, ty);
                if operand.is_primitive() || operand.is_void() {
                    let owner = boxed_descriptor(operand).unwrap_or("Ljava/lang/Void;");
                    let field = FieldReference::new(ClassReference::new(owner), "TYPE", TypeReference::class("Ljava/lang/Class;"));
                    self.body.push(Opcode::SgetObject, vec![dest], Operand::Field(field));
                } else {
                    let class = self.context.names.type_reference(operand);
                    self.body.push(Opcode::ConstClass, vec![dest], Operand::Type(class));
                }
                dest
            }
            AstCode::Ldfld => {
                let (field, field_type) = self.field_operand(expression)?;
                let object = self.compile_value(self.argument(expression, 0)?, None)?;
                let dest = self.target(dest, ty);
                self.body.push(access_opcode(&IGET, &field_type), vec![dest, object], Operand::Field(field));
                dest
            }
            AstCode::Ldsfld => {
                let (field, field_type) = self.field_operand(expression)?;
                let dest = self.target(dest, ty);
                self.body.push(access_opcode(&SGET, &field_type), vec![dest], Operand::Field(field));
                dest
            }
            AstCode::Newarr => {
                let length = self.compile_value(self.argument(expression, 0)?, None)?;
                let dest = self.target(dest, ty);
                let array = self.context.names.type_reference(ty);
                self.body.push(Opcode::NewArray, vec![dest, length], Operand::Type(array));
                dest
            }
            AstCode::InitArray => self.compile_init_array(expression)?,
            AstCode::Ldlen => {
                let array = self.compile_value(self.argument(expression, 0)?, None)?;
                let dest = self.target(dest, ty);
                self.body.push(Opcode::ArrayLength, vec![dest, array], Operand::None);
                dest
            }
            AstCode::Ldelem => {
                let element = expression.type_operand().cloned().unwrap_or_else(|| ty.clone());
                let array = self.compile_value(self.argument(expression, 0)?, None)?;
                let index = self.compile_value(self.argument(expression, 1)?, None)?;
                let dest = self.target(dest, ty);
                self.body.push(access_opcode(&AGET, &element), vec![dest, array, index], Operand::None);
                dest
            }
            code if code.is_arithmetic() => self.compile_arithmetic(expression, dest)?,
            AstCode::Neg | AstCode::Not => {
                let value = self.compile_value(self.argument(expression, 0)?, None)?;
                let opcode = match (expression.code, ty.stack_kind()) {
                    (AstCode::Neg, StackKind::Int) => Opcode::NegInt,
                    (AstCode::Neg, StackKind::Long) => Opcode::NegLong,
                    (AstCode::Neg, StackKind::Float) => Opcode::NegFloat,
                    (AstCode::Neg, StackKind::Double) => Opcode::NegDouble,
                    (AstCode::Not, StackKind::Int) => Opcode::NotInt,
                    (AstCode::Not, StackKind::Long) => Opcode::NotLong,
                    _ => return Err(CompilerError::unsupported(location, format!("{:?} of {}", expression.code, ty))),
                };
                let dest = self.target(dest, ty);
                self.body.push(opcode, vec![dest, value], Operand::None);
                dest
            }
            code if code.is_compare() || matches!(code, AstCode::LogicNot | AstCode::LogicAnd | AstCode::LogicOr) => {
                let result = self.frame.temporary(RegisterKind::Normal);
                let skip = self.fresh_label();
                self.body.push(Opcode::Const, vec![result], Operand::Int(0));
                self.compile_condition(expression, &skip, false)?;
                self.body.push(Opcode::Const, vec![result], Operand::Int(1));
                self.place_label(skip);
                result
            }
            AstCode::Conditional => {
                if ty.is_void() {
                    self.compile_effect(expression)?;
                    return Ok(None);
                }
                let result = self.frame.temporary(register_kind(ty).unwrap_or(RegisterKind::Normal));
                let otherwise = self.fresh_label();
                let end = self.fresh_label();
                self.compile_condition(self.argument(expression, 0)?, &otherwise, false)?;
                self.compile_into(self.argument(expression, 1)?, result)?;
                self.push_jump(Opcode::Goto32, vec![], Jump::Label(end.clone()), location);
                self.place_label(otherwise);
                self.compile_into(self.argument(expression, 2)?, result)?;
                self.place_label(end);
                result
            }
            AstCode::Sequence => {
                let Some((last, effects)) = expression.arguments.split_last() else {
                    return Ok(None);
                };
                for effect in effects {
                    self.compile_effect(effect)?;
                }
                return self.compile_expression(last, dest);
            }
            AstCode::Conv => self.compile_conversion(expression, dest)?,
            AstCode::Call | AstCode::Callvirt | AstCode::Newobj => return self.compile_call(expression, dest),
            AstCode::Castclass => {
                let target = expression.type_operand().unwrap_or(ty);
                let class = self.context.names.type_reference(target);
                let result = self.frame.temporary(RegisterKind::Object);
                self.compile_into(self.argument(expression, 0)?, result)?;
                self.body.push(Opcode::CheckCast, vec![result], Operand::Type(class));
                result
            }
            AstCode::Isinst => {
                let target = expression
                    .type_operand()
                    .ok_or_else(|| CompilerError::unsupported(location, "instance test without a type"))?;
                let class = self.context.names.type_reference(target);
                let value = self.compile_value(self.argument(expression, 0)?, None)?;
                let dest = self.target(dest, ty);
                self.body.push(Opcode::InstanceOf, vec![dest, value], Operand::Type(class));
                dest
            }
            AstCode::Nop
            | AstCode::Stloc
            | AstCode::Stfld
            | AstCode::Stsfld
            | AstCode::Stelem
            | AstCode::Br
            | AstCode::Brtrue
            | AstCode::Brfalse
            | AstCode::Switch
            | AstCode::Ret
            | AstCode::Throw => {
                self.compile_effect(expression)?;
                return Ok(None);
            }
            code => {
                return Err(CompilerError::unsupported(location, format!("{:?} reached code generation", code)));
            }
        };
        Ok(Some(register))
    }

    fn compile_init_array(&mut self, expression: &AstExpression) -> Result<Register, CompilerError> {
        let ty = &expression.result_type;
        let element = expression
            .type_operand()
            .cloned()
            .or_else(|| ty.element().cloned())
            .unwrap_or(TypeRef::Object);
        let length = self.frame.temporary(RegisterKind::Normal);
        self.body.push(Opcode::Const, vec![length], Operand::Int(expression.arguments.len() as i32));
        let array = self.frame.temporary(RegisterKind::Object);
        let array_type = self.context.names.type_reference(&TypeRef::array_of(element.clone()));
        self.body.push(Opcode::NewArray, vec![array, length], Operand::Type(array_type));
        let opcode = access_opcode(&APUT, &element);
        for (index, value) in expression.arguments.iter().enumerate() {
            let saved = self.frame.get_location();
            let value = self.compile_value(value, None)?;
            let position = self.frame.temporary(RegisterKind::Normal);
            self.body.push(Opcode::Const, vec![position], Operand::Int(index as i32));
            self.body.push(opcode, vec![value, array, position], Operand::None);
            self.frame.release(saved);
        }
        Ok(array)
    }

    fn compile_arithmetic(&mut self, expression: &AstExpression, dest: Option<Register>) -> Result<Register, CompilerError> {
        let location = &expression.location;
        let ty = &expression.result_type;
        let kind = ty.stack_kind();
        let left = self.compile_value(self.argument(expression, 0)?, None)?;
        let right = self.compile_value(self.argument(expression, 1)?, None)?;
        if ty.is_unsigned() {
            if let Some(helper) = unsigned_helper(expression.code, kind) {
                return self.invoke_helper(helper, &[left, right], ty, dest);
            }
        }
        let opcode = binary_opcode(expression.code, kind)
            .ok_or_else(|| CompilerError::unsupported(location, format!("{:?} of {}", expression.code, ty)))?;
        let dest = self.target(dest, ty);
        self.body.push(opcode, vec![dest, left, right], Operand::None);
        Ok(dest)
    }

    fn invoke_helper(
        &mut self,
        method: MethodReference,
        arguments: &[Register],
        ty: &TypeRef,
        dest: Option<Register>,
    ) -> Result<Register, CompilerError> {
        let kinds: Vec<RegisterKind> = arguments.iter().map(|r| r.kind).collect();
        let registers = self.frame.temporaries(&kinds);
        for (to, from) in registers.iter().zip(arguments) {
            self.move_register(*to, *from);
        }
        let units: u16 = kinds.iter().map(|k| k.width()).sum();
        let opcode = if units > 5 { Opcode::InvokeStaticRange } else { Opcode::InvokeStatic };
        self.body.push(opcode, registers, Operand::Method(method));
        let dest = self.target(dest, ty);
        self.body.push(Opcode::move_result_for(dest.kind), vec![dest], Operand::None);
        Ok(dest)
    }

    fn compile_conversion(&mut self, expression: &AstExpression, dest: Option<Register>) -> Result<Register, CompilerError> {
        let location = &expression.location;
        let value_expression = self.argument(expression, 0)?;
        let from = &value_expression.result_type;
        let to = &expression.result_type;

        if *to == TypeRef::Bool {
            let zero = match from.stack_kind() {
                StackKind::Int | StackKind::Reference => AstExpression::int(0, from.clone(), location.clone()),
                StackKind::Long => AstExpression::long(0, from.clone(), location.clone()),
                StackKind::Float => AstExpression::new(AstCode::LdcR4, AstOperand::Float(0), vec![], from.clone(), location.clone()),
                StackKind::Double => AstExpression::new(AstCode::LdcR8, AstOperand::Double(0), vec![], from.clone(), location.clone()),
                StackKind::Void => return Err(CompilerError::unsupported(location, "conversion from void to bool")),
            };
            let test = AstExpression::new(
                AstCode::Cne,
                AstOperand::None,
                vec![value_expression.clone(), zero],
                TypeRef::Bool,
                location.clone(),
            );
            let result = self.frame.temporary(RegisterKind::Normal);
            let skip = self.fresh_label();
            self.body.push(Opcode::Const, vec![result], Operand::Int(0));
            self.compile_condition(&test, &skip, false)?;
            self.body.push(Opcode::Const, vec![result], Operand::Int(1));
            self.place_label(skip);
            return Ok(result);
        }

        let value = self.compile_value(value_expression, None)?;
        let widening = match (from.stack_kind(), to.stack_kind()) {
            (StackKind::Int, StackKind::Int)
            | (StackKind::Long, StackKind::Long)
            | (StackKind::Float, StackKind::Float)
            | (StackKind::Double, StackKind::Double) => None,
            (StackKind::Int, StackKind::Long) => Some(Opcode::IntToLong),
            (StackKind::Int, StackKind::Float) => Some(Opcode::IntToFloat),
            (StackKind::Int, StackKind::Double) => Some(Opcode::IntToDouble),
            (StackKind::Long, StackKind::Int) => Some(Opcode::LongToInt),
            (StackKind::Long, StackKind::Float) => Some(Opcode::LongToFloat),
            (StackKind::Long, StackKind::Double) => Some(Opcode::LongToDouble),
            (StackKind::Float, StackKind::Int) => Some(Opcode::FloatToInt),
            (StackKind::Float, StackKind::Long) => Some(Opcode::FloatToLong),
            (StackKind::Float, StackKind::Double) => Some(Opcode::FloatToDouble),
            (StackKind::Double, StackKind::Int) => Some(Opcode::DoubleToInt),
            (StackKind::Double, StackKind::Long) => Some(Opcode::DoubleToLong),
            (StackKind::Double, StackKind::Float) => Some(Opcode::DoubleToFloat),
            _ => return Err(CompilerError::unsupported(location, format!("conversion from {} to {}", from, to))),
        };
        let narrowing = match to {
            TypeRef::I8 => Some((Opcode::IntToByte, Operand::None)),
            TypeRef::I16 => Some((Opcode::IntToShort, Operand::None)),
            TypeRef::Char | TypeRef::U16 => Some((Opcode::IntToChar, Operand::None)),
            TypeRef::U8 => Some((Opcode::AndIntLit16, Operand::Int(0xff))),
            _ => None,
        };
        let zero_extend = widening == Some(Opcode::IntToLong) && *from == TypeRef::U32;

        if widening.is_none() && narrowing.is_none() {
            return Ok(self.deliver(value, dest));
        }
        let dest = self.target(dest, to);
        let mut current = value;
        if let Some(opcode) = widening {
            self.body.push(opcode, vec![dest, current], Operand::None);
            current = dest;
        }
        if zero_extend {
            let mask = self.frame.temporary(RegisterKind::Wide);
            self.body.push(Opcode::ConstWide, vec![mask], Operand::Wide(0xffff_ffff));
            self.body.push(Opcode::AndLong, vec![dest, current, mask], Operand::None);
        }
        if let Some((opcode, operand)) = narrowing {
            self.body.push(opcode, vec![dest, current], operand);
        }
        Ok(dest)
    }

    fn invoke_opcode(&self, expression: &AstExpression) -> Opcode {
        let Some(method) = expression.method() else {
            unreachable!("call without a method operand");
        };
        let module = self.context.module;
        match expression.code {
            AstCode::Newobj => Opcode::InvokeDirect,
            _ if method.is_static => Opcode::InvokeStatic,
            AstCode::Call => {
                let on_this = expression.arguments.first().is_some_and(|a| a.code == AstCode::Ldthis);
                if method.is_constructor() || module.is_private(method) {
                    Opcode::InvokeDirect
                } else if on_this && method.owner != self.context.source.declaring_type {
                    Opcode::InvokeSuper
                } else {
                    Opcode::InvokeVirtual
                }
            }
            _ if module.is_interface(&method.owner) => Opcode::InvokeInterface,
            _ if module.is_private(method) => Opcode::InvokeDirect,
            _ => Opcode::InvokeVirtual,
        }
    }

    fn compile_call(&mut self, expression: &AstExpression, dest: Option<Register>) -> Result<Option<Register>, CompilerError> {
        let location = &expression.location;
        let method = expression
            .method()
            .ok_or_else(|| CompilerError::unsupported(location, "call without a method"))?;
        let reference = self.context.names.method_reference(method);
        let mut opcode = self.invoke_opcode(expression);
        let operand = Operand::Method(reference.clone());
        let kinds = argument_kinds(opcode, &operand);
        let creates = expression.code == AstCode::Newobj;
        let supplied = expression.arguments.len() + usize::from(creates);
        if supplied != kinds.len() {
            return Err(CompilerError::unsupported(
                location,
                format!("{} takes {} register arguments, {} given", method, kinds.len(), supplied),
            ));
        }

        let registers = self.frame.temporaries(&kinds);
        let mut arguments = registers.iter().copied();
        if creates {
            let Some(instance) = arguments.next() else {
                unreachable!("constructor call without a receiver register");
            };
            let class = self.context.names.type_reference(&method.owner);
            self.body.push(Opcode::NewInstance, vec![instance], Operand::Type(class));
        }
        for (argument, register) in expression.arguments.iter().zip(arguments) {
            let saved = self.frame.get_location();
            self.compile_into(argument, register)?;
            self.frame.release(saved);
        }
        let units: u16 = kinds.iter().map(|k| k.width()).sum();
        if units > 5 {
            opcode = opcode.to_range();
        }
        self.body.push(opcode, registers.clone(), operand);

        if creates {
            return Ok(Some(self.deliver(registers[0], dest)));
        }
        match register_kind(&method.return_type) {
            Some(kind) => {
                let dest = match dest {
                    Some(dest) if dest.kind == kind => dest,
                    _ => self.frame.temporary(kind),
                };
                self.body.push(Opcode::move_result_for(kind), vec![dest], Operand::None);
                Ok(Some(dest))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::pre_compilation::tests::{module, source};
    use crate::backend::pre_compilation::DelegateRegistry;
    use crate::model::{MethodOrigin, MethodSource, NameConverter};
    use crate::trees::ast::{AstCatch, AstTryCatch};
    use crate::trees::{FieldRef, MethodRef};
    use droid_shared::bytecode::Format;

    const TYPES: &str = r#"{"name": "App", "scope": "app", "types": [
        {"namespace": "App", "name": "Program", "kind": "class",
         "fields": [{"name": "count", "type": "i32", "is_static": true}]}
    ]}"#;

    fn loc(line: u32) -> SourceLocation {
        SourceLocation::new("Program.cs", line, 5)
    }

    fn lower(source: MethodSource, block: AstBlock) -> MethodBody {
        let module = module(TYPES);
        let names = NameConverter::new(&module);
        let delegates = DelegateRegistry::new();
        let context = ConversionContext::new(&module, &names, &source, &delegates);
        MethodCompiler::new(&context, true).compile(&block).unwrap()
    }

    fn opcodes(body: &MethodBody) -> Vec<Opcode> {
        body.instructions().iter().map(|i| i.opcode).collect()
    }

    fn statement(expression: AstExpression) -> AstNode {
        AstNode::Expression(expression)
    }

    fn parameter(name: &str, index: u16) -> AstVariable {
        AstVariable::new(name, TypeRef::I32, VariableKind::Parameter(index))
    }

    fn count() -> FieldRef {
        FieldRef::new(TypeRef::named("App.Program"), "count", TypeRef::I32)
    }

    fn store_count(value: i32, line: u32) -> AstNode {
        statement(AstExpression::statement(
            AstCode::Stsfld,
            AstOperand::Field(count()),
            vec![AstExpression::int(value, TypeRef::I32, loc(line))],
            loc(line),
        ))
    }

    fn ret(value: Option<AstExpression>, line: u32) -> AstNode {
        statement(AstExpression::statement(AstCode::Ret, AstOperand::None, value.into_iter().collect(), loc(line)))
    }

    fn fits_formats(body: &MethodBody) -> bool {
        body.instructions().iter().all(|instruction| match instruction.opcode.format() {
            Format::F35c => instruction.registers.iter().all(|r| r.fits(4)),
            Format::F3rc => true,
            format => instruction
                .registers
                .iter()
                .zip(format.register_bits())
                .all(|(register, bits)| register.fits(*bits)),
        })
    }

    #[test]
    fn test_arguments_sit_above_locals() {
        let a = parameter("a", 0);
        let b = parameter("b", 1);
        let sum = AstExpression::new(
            AstCode::Add,
            AstOperand::None,
            vec![AstExpression::load(&a, loc(2)), AstExpression::load(&b, loc(2))],
            TypeRef::I32,
            loc(2),
        );
        let mut source = source("App.Program", "Add", true, vec![("a", TypeRef::I32), ("b", TypeRef::I32)], MethodOrigin::Ast(AstBlock::default()));
        source.return_type = TypeRef::I32;
        let body = lower(source, AstBlock::new(vec![ret(Some(sum), 2)]));

        assert_eq!(opcodes(&body), vec![Opcode::AddInt, Opcode::Return]);
        assert_eq!(body.registers_size, 3);
        assert_eq!(body.ins_size, 2);
        assert_eq!(body.instructions()[0].registers, vec![Register::normal(0), Register::normal(1), Register::normal(2)]);
        assert_eq!(body.outs_size, 0);
    }

    #[test]
    fn test_branches_and_labels() {
        let flag = AstVariable::new("flag", TypeRef::Bool, VariableKind::Parameter(0));
        let block = AstBlock::new(vec![
            statement(AstExpression::label_branch(AstCode::Brfalse, "else", vec![AstExpression::load(&flag, loc(3))], loc(3))),
            store_count(1, 4),
            statement(AstExpression::label_branch(AstCode::Br, "end", vec![], SourceLocation::default())),
            AstNode::Label("else".into()),
            store_count(2, 6),
            AstNode::Label("end".into()),
            ret(None, 7),
        ]);
        let body = lower(source("App.Program", "Run", true, vec![("flag", TypeRef::Bool)], MethodOrigin::Ast(AstBlock::default())), block);

        assert_eq!(
            opcodes(&body),
            vec![
                Opcode::IfEqz,
                Opcode::Const4,
                Opcode::Sput,
                Opcode::ReturnVoid,
                Opcode::Const4,
                Opcode::Sput,
                Opcode::ReturnVoid,
            ]
        );
        let branch = &body.instructions()[0];
        assert_eq!(branch.operand, Operand::Target(body.instructions()[4].id()));
        let lines: Vec<u32> = body.debug_info.positions.iter().map(|p| p.line).collect();
        assert_eq!(lines, vec![3, 4, 6, 7]);
    }

    #[test]
    fn test_compare_values_and_long_compares() {
        let a = AstVariable::new("a", TypeRef::I64, VariableKind::Parameter(0));
        let b = AstVariable::new("b", TypeRef::I64, VariableKind::Parameter(1));
        let less = AstExpression::new(
            AstCode::Clt,
            AstOperand::None,
            vec![AstExpression::load(&a, loc(2)), AstExpression::load(&b, loc(2))],
            TypeRef::Bool,
            loc(2),
        );
        let mut source = source("App.Program", "Less", true, vec![("a", TypeRef::I64), ("b", TypeRef::I64)], MethodOrigin::Ast(AstBlock::default()));
        source.return_type = TypeRef::Bool;
        let body = lower(source, AstBlock::new(vec![ret(Some(less), 2)]));

        assert_eq!(
            opcodes(&body),
            vec![Opcode::Const4, Opcode::CmpLong, Opcode::IfGez, Opcode::Const4, Opcode::Return]
        );
        assert_eq!(body.ins_size, 4);
    }

    #[test]
    fn test_calls_use_contiguous_arguments() {
        let method = MethodRef::new_static(
            TypeRef::named("App.Program"),
            "Sum",
            vec![TypeRef::I64, TypeRef::I64, TypeRef::I64],
            TypeRef::I64,
        );
        let call = AstExpression::new(
            AstCode::Call,
            AstOperand::Method(method),
            vec![
                AstExpression::long(1, TypeRef::I64, loc(2)),
                AstExpression::long(2, TypeRef::I64, loc(2)),
                AstExpression::long(3, TypeRef::I64, loc(2)),
            ],
            TypeRef::I64,
            loc(2),
        );
        let body = lower(source("App.Program", "Run", true, vec![], MethodOrigin::Ast(AstBlock::default())), AstBlock::new(vec![statement(call)]));

        let invoke = body.instructions().iter().find(|i| i.opcode.is_invoke()).unwrap();
        assert_eq!(invoke.opcode, Opcode::InvokeStaticRange);
        assert_eq!(invoke.registers.iter().map(|r| r.index).collect::<Vec<_>>(), vec![0, 2, 4]);
        assert_eq!(body.outs_size, 6);
        assert!(opcodes(&body).contains(&Opcode::MoveResultWide));
    }

    #[test]
    fn test_void_call_statement() {
        let method = MethodRef::new_static(TypeRef::named("App.Program"), "Log", vec![TypeRef::I32], TypeRef::Void);
        let call = AstExpression::new(
            AstCode::Call,
            AstOperand::Method(method),
            vec![AstExpression::int(7, TypeRef::I32, loc(2))],
            TypeRef::Void,
            loc(2),
        );
        let block = AstBlock::new(vec![statement(call), ret(None, 3)]);
        let body = lower(source("App.Program", "Run", true, vec![], MethodOrigin::Ast(AstBlock::default())), block);

        assert_eq!(opcodes(&body), vec![Opcode::Const4, Opcode::InvokeStatic, Opcode::ReturnVoid]);
        assert_eq!(body.outs_size, 1);
    }

    #[test]
    fn test_try_catch_ranges_and_handlers() {
        let error = AstVariable::new("e", TypeRef::named("System.Exception"), VariableKind::Local);
        let try_catch = AstTryCatch {
            try_block: AstBlock::new(vec![store_count(1, 3)]),
            catches: vec![AstCatch {
                exception_type: Some(TypeRef::named("System.Exception")),
                variable: Some(error),
                body: AstBlock::new(vec![store_count(2, 5)]),
                location: loc(4),
            }],
            finally: None,
            location: loc(2),
        };
        let block = AstBlock::new(vec![AstNode::TryCatch(try_catch), ret(None, 7)]);
        let body = lower(source("App.Program", "Run", true, vec![], MethodOrigin::Ast(AstBlock::default())), block);

        assert_eq!(body.exception_handlers.len(), 1);
        let handler = &body.exception_handlers[0];
        assert_eq!(handler.catches.len(), 1);
        assert_eq!(handler.catches[0].exception_type.descriptor(), "Ljava/lang/Throwable;");
        assert_eq!(body.instruction(handler.catches[0].handler).unwrap().opcode, Opcode::MoveException);
        assert_eq!(body.instruction(handler.range.last).unwrap().opcode, Opcode::Nop);
        assert_eq!(body.instruction(handler.range.first).unwrap().opcode, Opcode::Const4);
    }

    #[test]
    fn test_finally_runs_on_both_paths() {
        let try_catch = AstTryCatch {
            try_block: AstBlock::new(vec![store_count(1, 3)]),
            catches: vec![],
            finally: Some(AstBlock::new(vec![store_count(9, 5)])),
            location: loc(2),
        };
        let block = AstBlock::new(vec![AstNode::TryCatch(try_catch), ret(None, 7)]);
        let body = lower(source("App.Program", "Run", true, vec![], MethodOrigin::Ast(AstBlock::default())), block);

        let nines = body
            .instructions()
            .iter()
            .filter(|i| i.operand == Operand::Int(9))
            .count();
        assert_eq!(nines, 2);
        let handler = &body.exception_handlers[0];
        let catch_all = handler.catch_all.unwrap();
        assert_eq!(body.instruction(catch_all).unwrap().opcode, Opcode::MoveException);
        assert!(opcodes(&body).contains(&Opcode::Throw));
    }

    #[test]
    fn test_return_inside_finally_region_runs_finally_first() {
        let try_catch = AstTryCatch {
            try_block: AstBlock::new(vec![store_count(1, 3), ret(None, 4)]),
            catches: vec![],
            finally: Some(AstBlock::new(vec![store_count(9, 6)])),
            location: loc(2),
        };
        let block = AstBlock::new(vec![AstNode::TryCatch(try_catch)]);
        let body = lower(source("App.Program", "Run", true, vec![], MethodOrigin::Ast(AstBlock::default())), block);

        let position = |value: i32| body.instructions().iter().position(|i| i.operand == Operand::Int(value)).unwrap();
        let first_return = body.instructions().iter().position(|i| i.opcode == Opcode::ReturnVoid).unwrap();
        assert!(position(1) < position(9) && position(9) < first_return);
        for handler in body.exception_handlers.iter() {
            let (start, end) = handler.range.bounds(&body).unwrap();
            assert!(!(start..end).contains(&position(9)));
        }
    }

    #[test]
    fn test_large_frames_spill() {
        let mut nodes = Vec::new();
        let variables: Vec<AstVariable> = (0..20).map(|i| AstVariable::new(format!("v{}", i), TypeRef::I32, VariableKind::Local)).collect();
        for (i, variable) in variables.iter().enumerate() {
            nodes.push(statement(AstExpression::store(variable, AstExpression::int(i as i32, TypeRef::I32, loc(2)), loc(2))));
        }
        let negated = AstExpression::new(AstCode::Neg, AstOperand::None, vec![AstExpression::load(&variables[19], loc(3))], TypeRef::I32, loc(3));
        nodes.push(statement(AstExpression::store(&variables[18], negated, loc(3))));
        nodes.push(ret(None, 4));
        let body = lower(source("App.Program", "Run", true, vec![], MethodOrigin::Ast(AstBlock::default())), AstBlock::new(nodes));

        assert!(body.registers_size > 16);
        assert!(fits_formats(&body));
        assert!(opcodes(&body).contains(&Opcode::NegInt));
    }

    #[test]
    fn test_unknown_code_is_reported() {
        let boxed = AstExpression::new(AstCode::Box, AstOperand::None, vec![AstExpression::int(1, TypeRef::I32, loc(2))], TypeRef::Object, loc(2));
        let module = module(TYPES);
        let names = NameConverter::new(&module);
        let delegates = DelegateRegistry::new();
        let source = source("App.Program", "Run", true, vec![], MethodOrigin::Ast(AstBlock::default()));
        let context = ConversionContext::new(&module, &names, &source, &delegates);
        let error = MethodCompiler::new(&context, true)
            .compile(&AstBlock::new(vec![statement(boxed)]))
            .unwrap_err();
        assert!(matches!(error, CompilerError::UnsupportedConstruct { location, .. } if location.line == 2));
    }
}
