use std::collections::HashMap;

use crate::backend::pre_compilation::ConversionContext;
use crate::error::CompilerError;
use crate::trees::ast::{AstBlock, AstCatch, AstCode, AstExpression, AstNode, AstOperand, AstTryCatch, AstVariable, VariableKind};
use crate::trees::hir::{Body, Expression, ExpressionKind, Statement, StatementKind, SwitchCase};
use crate::trees::{CompareOperator, Constant, SourceLocation, StackKind, TypeRef, UnaryOperator};

/// Largest gap a case table may have before a compare chain is used instead
const MAX_SWITCH_SPAN: i64 = 4096;

struct Jump {
    label: String,
    finally_depth: usize,
}

pub struct HirConverter<'a> {
    context: &'a ConversionContext<'a>,
    locals: HashMap<String, AstVariable>,
    breaks: Vec<Jump>,
    continues: Vec<Jump>,
    finally_depth: usize,
    labels: u32,
    /// Innermost known location, given to nodes whose input has none
    location: SourceLocation,
}

impl<'a> HirConverter<'a> {
    pub fn new(context: &'a ConversionContext<'a>) -> Self {
        HirConverter {
            context,
            locals: HashMap::new(),
            breaks: Vec::new(),
            continues: Vec::new(),
            finally_depth: 0,
            labels: 0,
            location: context.source.location.clone(),
        }
    }

    pub fn convert(&mut self, body: &Body) -> Result<AstBlock, CompilerError> {
        for local in body.locals.iter() {
            self.locals.insert(
                local.name.clone(),
                AstVariable::new(local.name.clone(), local.ty.clone(), VariableKind::Local),
            );
        }
        let nodes = self.convert_statements(&body.statements)?;
        Ok(AstBlock::new(nodes))
    }

    fn new_label(&mut self) -> String {
        let label = format!("L{}", self.labels);
        self.labels += 1;
        label
    }

    fn variable(&self, name: &str, location: &SourceLocation) -> Result<AstVariable, CompilerError> {
        if let Some(local) = self.locals.get(name) {
            return Ok(local.clone());
        }
        let source = self.context.source;
        match source.parameter_index(name) {
            Some(index) => Ok(AstVariable::new(
                name,
                source.parameters[index as usize].ty.clone(),
                VariableKind::Parameter(index),
            )),
            None => Err(CompilerError::unsupported(location, format!("unknown variable {}", name))),
        }
    }

    fn convert_statements(&mut self, statements: &[Statement]) -> Result<Vec<AstNode>, CompilerError> {
        let mut nodes = Vec::new();
        for statement in statements {
            self.convert_statement(statement, &mut nodes)?;
        }
        Ok(nodes)
    }

    fn enter(&mut self, location: &SourceLocation) -> SourceLocation {
        let outer = self.location.clone();
        if location.is_known() {
            self.location = location.clone();
        }
        outer
    }

    fn located(&self, location: &SourceLocation) -> SourceLocation {
        if location.is_known() {
            location.clone()
        } else {
            self.location.clone()
        }
    }

    fn convert_statement(&mut self, statement: &Statement, out: &mut Vec<AstNode>) -> Result<(), CompilerError> {
        let outer = self.enter(&statement.location);
        let result = self.convert_located_statement(statement, out);
        self.location = outer;
        result
    }

    fn convert_located_statement(&mut self, statement: &Statement, out: &mut Vec<AstNode>) -> Result<(), CompilerError> {
        let location = self.location.clone();
        match &statement.kind {
            StatementKind::Expression(expression) => {
                out.push(AstNode::Expression(self.convert_expression(expression)?));
            }
            StatementKind::Assign { target, value } => {
                let value = self.convert_expression(value)?;
                out.push(AstNode::Expression(self.store(target, value, &location)?));
            }
            StatementKind::CompoundAssign { operator, target, value } => {
                let load = self.convert_expression(target)?;
                if !load.code.is_load() && load.code != AstCode::Ldobj {
                    return Err(CompilerError::unsupported(&location, "compound assignment to a value that is not a variable, field or element"));
                }
                let value = self.convert_expression(value)?;
                out.push(AstNode::Expression(AstExpression::new(
                    AstCode::CompoundAssign,
                    AstOperand::Operator(*operator),
                    vec![load, value],
                    target.ty.clone(),
                    location,
                )));
            }
            StatementKind::If { condition, then, otherwise } => {
                let condition = self.convert_expression(condition)?;
                let end = self.new_label();
                if otherwise.is_empty() {
                    out.push(AstNode::Expression(AstExpression::label_branch(AstCode::Brfalse, end.clone(), vec![condition], location)));
                    out.extend(self.convert_statements(then)?);
                } else {
                    let other = self.new_label();
                    out.push(AstNode::Expression(AstExpression::label_branch(AstCode::Brfalse, other.clone(), vec![condition], location.clone())));
                    out.extend(self.convert_statements(then)?);
                    out.push(AstNode::Expression(AstExpression::label_branch(AstCode::Br, end.clone(), vec![], location)));
                    out.push(AstNode::Label(other));
                    out.extend(self.convert_statements(otherwise)?);
                }
                out.push(AstNode::Label(end));
            }
            StatementKind::While { condition, body } => {
                let start = self.new_label();
                let end = self.new_label();
                let condition = self.convert_expression(condition)?;
                out.push(AstNode::Label(start.clone()));
                out.push(AstNode::Expression(AstExpression::label_branch(AstCode::Brfalse, end.clone(), vec![condition], location.clone())));
                self.continues.push(Jump { label: start.clone(), finally_depth: self.finally_depth });
                self.breaks.push(Jump { label: end.clone(), finally_depth: self.finally_depth });
                let body = self.convert_statements(body);
                self.continues.pop();
                self.breaks.pop();
                out.extend(body?);
                out.push(AstNode::Expression(AstExpression::label_branch(AstCode::Br, start, vec![], location)));
                out.push(AstNode::Label(end));
            }
            StatementKind::Switch { value, cases, default } => {
                self.convert_switch(value, cases, default, &location, out)?;
            }
            StatementKind::Break => {
                let label = self.jump_label(&self.breaks, "break", &location)?;
                out.push(AstNode::Expression(AstExpression::label_branch(AstCode::Br, label, vec![], location)));
            }
            StatementKind::Continue => {
                let label = self.jump_label(&self.continues, "continue", &location)?;
                out.push(AstNode::Expression(AstExpression::label_branch(AstCode::Br, label, vec![], location)));
            }
            StatementKind::Return(value) => {
                if self.finally_depth > 0 {
                    return Err(CompilerError::unsupported(&location, "return from inside a try block with a finally clause"));
                }
                let arguments = match value {
                    Some(value) => vec![self.convert_expression(value)?],
                    None => Vec::new(),
                };
                out.push(AstNode::Expression(AstExpression::statement(AstCode::Ret, AstOperand::None, arguments, location)));
            }
            StatementKind::Throw(value) => {
                let value = self.convert_expression(value)?;
                out.push(AstNode::Expression(AstExpression::statement(AstCode::Throw, AstOperand::None, vec![value], location)));
            }
            StatementKind::Try { body, catches, finally } => {
                let has_finally = !finally.is_empty();
                if has_finally {
                    self.finally_depth += 1;
                }
                let converted = self.convert_try(body, catches, &location);
                if has_finally {
                    self.finally_depth -= 1;
                }
                let (try_block, catches) = converted?;
                let finally = if has_finally {
                    Some(AstBlock::new(self.convert_statements(finally)?))
                } else {
                    None
                };
                out.push(AstNode::TryCatch(AstTryCatch {
                    try_block,
                    catches,
                    finally,
                    location,
                }));
            }
            StatementKind::Block(statements) => {
                out.push(AstNode::Block(AstBlock::new(self.convert_statements(statements)?)));
            }
        }
        Ok(())
    }

    fn jump_label(&self, targets: &[Jump], what: &str, location: &SourceLocation) -> Result<String, CompilerError> {
        let Some(target) = targets.last() else {
            return Err(CompilerError::unsupported(location, format!("{} outside of a loop or switch", what)));
        };
        if target.finally_depth != self.finally_depth {
            return Err(CompilerError::unsupported(location, format!("{} out of a try block with a finally clause", what)));
        }
        Ok(target.label.clone())
    }

    fn convert_try(
        &mut self,
        body: &[Statement],
        catches: &[crate::trees::hir::CatchClause],
        location: &SourceLocation,
    ) -> Result<(AstBlock, Vec<AstCatch>), CompilerError> {
        let try_block = AstBlock::new(self.convert_statements(body)?);
        let mut converted = Vec::with_capacity(catches.len());
        for catch in catches {
            let variable = match &catch.variable {
                Some(name) => Some(self.variable(name, location)?),
                None => None,
            };
            converted.push(AstCatch {
                exception_type: catch.exception_type.clone(),
                variable,
                body: AstBlock::new(self.convert_statements(&catch.body)?),
                location: location.clone(),
            });
        }
        Ok((try_block, converted))
    }

    fn convert_switch(
        &mut self,
        value: &Expression,
        cases: &[SwitchCase],
        default: &[Statement],
        location: &SourceLocation,
        out: &mut Vec<AstNode>,
    ) -> Result<(), CompilerError> {
        let mut value = self.convert_expression(value)?;
        if value.result_type.stack_kind() != StackKind::Int || self.context.module.is_enum(&value.result_type) {
            value = AstExpression::new(AstCode::Conv, AstOperand::None, vec![value], TypeRef::I32, location.clone());
        }
        let temporary = self.context.temporary("sw", TypeRef::I32);
        out.push(AstNode::Expression(AstExpression::store(&temporary, value, location.clone())));

        let end = self.new_label();
        let default_label = self.new_label();
        let case_labels: Vec<String> = cases.iter().map(|_| self.new_label()).collect();
        let mut keys: Vec<(i32, usize)> = cases
            .iter()
            .enumerate()
            .flat_map(|(index, case)| case.values.iter().map(move |v| (*v, index)))
            .collect();
        keys.sort_by_key(|(key, _)| *key);
        keys.dedup_by_key(|(key, _)| *key);

        let load = || AstExpression::load(&temporary, location.clone());
        if let (Some((low, _)), Some((high, _))) = (keys.first(), keys.last()) {
            let span = *high as i64 - *low as i64 + 1;
            if keys.len() >= 3 && span <= 2 * keys.len() as i64 && span <= MAX_SWITCH_SPAN {
                let labels = (*low..=*high)
                    .map(|key| match keys.binary_search_by_key(&key, |(k, _)| *k) {
                        Ok(found) => case_labels[keys[found].1].clone(),
                        Err(_) => default_label.clone(),
                    })
                    .collect();
                out.push(AstNode::Expression(AstExpression::statement(
                    AstCode::Switch,
                    AstOperand::Switch { first_key: *low, labels },
                    vec![load()],
                    location.clone(),
                )));
            } else {
                for (key, index) in keys.iter() {
                    let compare = AstExpression::new(
                        AstCode::Ceq,
                        AstOperand::None,
                        vec![load(), AstExpression::int(*key, TypeRef::I32, location.clone())],
                        TypeRef::Bool,
                        location.clone(),
                    );
                    out.push(AstNode::Expression(AstExpression::label_branch(
                        AstCode::Brtrue,
                        case_labels[*index].clone(),
                        vec![compare],
                        location.clone(),
                    )));
                }
            }
        }
        out.push(AstNode::Expression(AstExpression::label_branch(AstCode::Br, default_label.clone(), vec![], location.clone())));

        self.breaks.push(Jump { label: end.clone(), finally_depth: self.finally_depth });
        let bodies = self.convert_switch_bodies(cases, &case_labels, default, &default_label, &end, location);
        self.breaks.pop();
        out.extend(bodies?);
        out.push(AstNode::Label(end));
        Ok(())
    }

    fn convert_switch_bodies(
        &mut self,
        cases: &[SwitchCase],
        case_labels: &[String],
        default: &[Statement],
        default_label: &str,
        end: &str,
        location: &SourceLocation,
    ) -> Result<Vec<AstNode>, CompilerError> {
        let mut nodes = Vec::new();
        for (case, label) in cases.iter().zip(case_labels) {
            nodes.push(AstNode::Label(label.clone()));
            nodes.extend(self.convert_statements(&case.body)?);
            nodes.push(AstNode::Expression(AstExpression::label_branch(AstCode::Br, end, vec![], location.clone())));
        }
        nodes.push(AstNode::Label(default_label.to_string()));
        nodes.extend(self.convert_statements(default)?);
        Ok(nodes)
    }

    fn store(&mut self, target: &Expression, value: AstExpression, location: &SourceLocation) -> Result<AstExpression, CompilerError> {
        let store = match &target.kind {
            ExpressionKind::Local(name) => {
                let variable = self.variable(name, &self.located(&target.location))?;
                AstExpression::store(&variable, value, location.clone())
            }
            ExpressionKind::Field { instance: Some(instance), field } => {
                let instance = self.convert_expression(instance)?;
                AstExpression::statement(AstCode::Stfld, AstOperand::Field(field.clone()), vec![instance, value], location.clone())
            }
            ExpressionKind::Field { instance: None, field } => {
                AstExpression::statement(AstCode::Stsfld, AstOperand::Field(field.clone()), vec![value], location.clone())
            }
            ExpressionKind::ArrayElement { array, index } => {
                let array = self.convert_expression(array)?;
                let index = self.convert_expression(index)?;
                AstExpression::statement(
                    AstCode::Stelem,
                    AstOperand::Type(target.ty.clone()),
                    vec![array, index, value],
                    location.clone(),
                )
            }
            ExpressionKind::Deref(address) => {
                let address = self.convert_expression(address)?;
                AstExpression::statement(AstCode::Stobj, AstOperand::Type(target.ty.clone()), vec![address, value], location.clone())
            }
            _ => return Err(CompilerError::unsupported(&self.located(&target.location), "assignment to an expression that is not a storage location")),
        };
        Ok(store)
    }

    fn convert_all(&mut self, expressions: &[Expression]) -> Result<Vec<AstExpression>, CompilerError> {
        expressions.iter().map(|e| self.convert_expression(e)).collect()
    }

    fn convert_expression(&mut self, expression: &Expression) -> Result<AstExpression, CompilerError> {
        let outer = self.enter(&expression.location);
        let result = self.convert_located_expression(expression);
        self.location = outer;
        result
    }

    fn convert_located_expression(&mut self, expression: &Expression) -> Result<AstExpression, CompilerError> {
        let location = self.location.clone();
        let ty = expression.ty.clone();
        let make = |code: AstCode, operand: AstOperand, arguments: Vec<AstExpression>, ty: TypeRef| {
            AstExpression::new(code, operand, arguments, ty, location.clone())
        };
        let converted = match &expression.kind {
            ExpressionKind::Constant(constant) => constant_expression(constant, ty, location.clone()),
            ExpressionKind::Local(name) => {
                let variable = self.variable(name, &location)?;
                AstExpression::load(&variable, location.clone()).with_type(ty)
            }
            ExpressionKind::This => {
                if self.context.source.is_static {
                    return Err(CompilerError::unsupported(&location, "this in a static method"));
                }
                AstExpression::this(ty, location.clone())
            }
            ExpressionKind::Field { instance: Some(instance), field } => {
                let instance = self.convert_expression(instance)?;
                make(AstCode::Ldfld, AstOperand::Field(field.clone()), vec![instance], ty)
            }
            ExpressionKind::Field { instance: None, field } => make(AstCode::Ldsfld, AstOperand::Field(field.clone()), vec![], ty),
            ExpressionKind::ArrayElement { array, index } => {
                let arguments = vec![self.convert_expression(array)?, self.convert_expression(index)?];
                make(AstCode::Ldelem, AstOperand::Type(ty.clone()), arguments, ty)
            }
            ExpressionKind::ArrayLength(array) => {
                let array = self.convert_expression(array)?;
                make(AstCode::Ldlen, AstOperand::None, vec![array], TypeRef::I32)
            }
            ExpressionKind::NewArray { element, length } => {
                let length = self.convert_expression(length)?;
                make(AstCode::Newarr, AstOperand::Type(element.clone()), vec![length], ty)
            }
            ExpressionKind::ArrayInitializer { element, values } => {
                let values = self.convert_all(values)?;
                make(AstCode::InitArray, AstOperand::Type(element.clone()), values, ty)
            }
            ExpressionKind::Binary { operator, left, right } => {
                let arguments = vec![self.convert_expression(left)?, self.convert_expression(right)?];
                make(AstCode::from_binary(*operator), AstOperand::None, arguments, ty)
            }
            ExpressionKind::Unary { operator, operand } => {
                let operand = self.convert_expression(operand)?;
                let code = match operator {
                    UnaryOperator::Neg => AstCode::Neg,
                    UnaryOperator::Not => AstCode::Not,
                };
                make(code, AstOperand::None, vec![operand], ty)
            }
            ExpressionKind::Compare { operator, left, right } => {
                let arguments = vec![self.convert_expression(left)?, self.convert_expression(right)?];
                make(compare_code(*operator), AstOperand::None, arguments, TypeRef::Bool)
            }
            ExpressionKind::And(left, right) => {
                let arguments = vec![self.convert_expression(left)?, self.convert_expression(right)?];
                make(AstCode::LogicAnd, AstOperand::None, arguments, TypeRef::Bool)
            }
            ExpressionKind::Or(left, right) => {
                let arguments = vec![self.convert_expression(left)?, self.convert_expression(right)?];
                make(AstCode::LogicOr, AstOperand::None, arguments, TypeRef::Bool)
            }
            ExpressionKind::Not(value) => {
                let value = self.convert_expression(value)?;
                make(AstCode::LogicNot, AstOperand::None, vec![value], TypeRef::Bool)
            }
            ExpressionKind::Conditional { condition, then, otherwise } => {
                let arguments = vec![
                    self.convert_expression(condition)?,
                    self.convert_expression(then)?,
                    self.convert_expression(otherwise)?,
                ];
                make(AstCode::Conditional, AstOperand::None, arguments, ty)
            }
            ExpressionKind::Call { method, instance, arguments, virtual_call } => {
                let mut converted = Vec::with_capacity(arguments.len() + 1);
                match instance {
                    Some(instance) => converted.push(self.convert_expression(instance)?),
                    None if !method.is_static => {
                        return Err(CompilerError::unsupported(&location, format!("instance call to {} without a receiver", method)));
                    }
                    None => {}
                }
                converted.extend(self.convert_all(arguments)?);
                let code = if *virtual_call { AstCode::Callvirt } else { AstCode::Call };
                make(code, AstOperand::Method(method.clone()), converted, ty)
            }
            ExpressionKind::New { constructor, arguments } => {
                let arguments = self.convert_all(arguments)?;
                make(AstCode::Newobj, AstOperand::Method(constructor.clone()), arguments, ty)
            }
            ExpressionKind::Cast { target, value } => {
                let value = self.convert_expression(value)?;
                let code = if target.is_primitive() && value.result_type.is_primitive() {
                    AstCode::Conv
                } else if target.is_primitive() {
                    AstCode::Unbox
                } else {
                    AstCode::Castclass
                };
                let operand = if code == AstCode::Conv { AstOperand::None } else { AstOperand::Type(target.clone()) };
                make(code, operand, vec![value], target.clone())
            }
            ExpressionKind::As { target, value } => {
                let value = self.convert_expression(value)?;
                make(AstCode::As, AstOperand::Type(target.clone()), vec![value], target.clone())
            }
            ExpressionKind::Is { target, value } => {
                let value = self.convert_expression(value)?;
                make(AstCode::Isinst, AstOperand::Type(target.clone()), vec![value], TypeRef::Bool)
            }
            ExpressionKind::Convert(value) => {
                let value = self.convert_expression(value)?;
                make(AstCode::Conv, AstOperand::None, vec![value], ty)
            }
            ExpressionKind::Box(value) => {
                let value = self.convert_expression(value)?;
                let boxed = value.result_type.clone();
                make(AstCode::Box, AstOperand::Type(boxed), vec![value], ty)
            }
            ExpressionKind::Unbox { target, value } => {
                let value = self.convert_expression(value)?;
                make(AstCode::Unbox, AstOperand::Type(target.clone()), vec![value], target.clone())
            }
            ExpressionKind::TypeOf(target) => make(AstCode::TypeOf, AstOperand::Type(target.clone()), vec![], ty),
            ExpressionKind::Default(target) => make(AstCode::DefaultValue, AstOperand::Type(target.clone()), vec![], target.clone()),
            ExpressionKind::DelegateCreate { delegate_type, target, method } => {
                let arguments = match target {
                    Some(target) => vec![self.convert_expression(target)?],
                    None => Vec::new(),
                };
                let operand = AstOperand::Delegate {
                    delegate_type: delegate_type.clone(),
                    method: method.clone(),
                };
                make(AstCode::DelegateNew, operand, arguments, delegate_type.clone())
            }
            ExpressionKind::DelegateInvoke { delegate, arguments } => {
                let delegate = self.convert_expression(delegate)?;
                let delegate_type = delegate.result_type.clone();
                let mut converted = vec![delegate];
                converted.extend(self.convert_all(arguments)?);
                make(AstCode::DelegateInvoke, AstOperand::Type(delegate_type), converted, ty)
            }
            ExpressionKind::HasValue(value) => {
                let value = self.convert_expression(value)?;
                make(AstCode::HasValue, AstOperand::None, vec![value], TypeRef::Bool)
            }
            ExpressionKind::GetValue(value) => {
                let value = self.convert_expression(value)?;
                make(AstCode::GetValue, AstOperand::None, vec![value], ty)
            }
            ExpressionKind::AddressOf { target, out } => {
                if !matches!(
                    target.kind,
                    ExpressionKind::Local(_) | ExpressionKind::Field { .. } | ExpressionKind::ArrayElement { .. } | ExpressionKind::Deref(_)
                ) {
                    return Err(CompilerError::unsupported(&location, "reference to an expression that is not a storage location"));
                }
                let target = self.convert_expression(target)?;
                let code = if *out { AstCode::OutAddressOf } else { AstCode::AddressOf };
                let ty = TypeRef::by_ref_of(target.result_type.clone());
                make(code, AstOperand::None, vec![target], ty)
            }
            ExpressionKind::Deref(address) => {
                let address = self.convert_expression(address)?;
                make(AstCode::Ldobj, AstOperand::Type(ty.clone()), vec![address], ty)
            }
        };
        Ok(converted)
    }
}

pub(super) fn compare_code(operator: CompareOperator) -> AstCode {
    match operator {
        CompareOperator::Eq => AstCode::Ceq,
        CompareOperator::Ne => AstCode::Cne,
        CompareOperator::Lt => AstCode::Clt,
        CompareOperator::Le => AstCode::Cle,
        CompareOperator::Gt => AstCode::Cgt,
        CompareOperator::Ge => AstCode::Cge,
    }
}

/// The load of a literal, typed `ty`
pub(super) fn constant_expression(constant: &Constant, ty: TypeRef, location: SourceLocation) -> AstExpression {
    let wide = ty.stack_kind() == StackKind::Long;
    match constant {
        Constant::Null => AstExpression::null(ty, location),
        Constant::Bool(value) => AstExpression::int(*value as i32, ty, location),
        Constant::Int(value) if wide => AstExpression::long(*value as i64, ty, location),
        Constant::Int(value) => AstExpression::int(*value, ty, location),
        Constant::Char(value) => AstExpression::int(*value as i32, ty, location),
        Constant::Long(value) if wide || ty.is_reference() => AstExpression::long(*value, ty, location),
        Constant::Long(value) => AstExpression::int(*value as i32, ty, location),
        Constant::Float(value) => AstExpression::new(AstCode::LdcR4, AstOperand::Float(value.to_bits()), vec![], ty, location),
        Constant::Double(value) => AstExpression::new(AstCode::LdcR8, AstOperand::Double(value.to_bits()), vec![], ty, location),
        Constant::String(value) => AstExpression::new(AstCode::Ldstr, AstOperand::String(value.clone()), vec![], ty, location),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::pre_compilation::tests::{expression, module, roots, source, statement};
    use crate::backend::pre_compilation::DelegateRegistry;
    use crate::model::{MethodOrigin, NameConverter};
    use crate::trees::hir::Local;

    fn int(value: i32) -> Expression {
        expression(ExpressionKind::Constant(Constant::Int(value)), TypeRef::I32)
    }

    fn local(name: &str) -> Expression {
        expression(ExpressionKind::Local(name.into()), TypeRef::I32)
    }

    fn convert(body: Body) -> Result<AstBlock, CompilerError> {
        let module = module(r#"{"name": "App", "scope": "app", "types": [{"namespace": "App", "name": "Program", "kind": "class"}]}"#);
        let names = NameConverter::new(&module);
        let delegates = DelegateRegistry::new();
        let source = source("App.Program", "Run", true, vec![("p", TypeRef::I32)], MethodOrigin::Hir(body.clone()));
        let context = ConversionContext::new(&module, &names, &source, &delegates);
        HirConverter::new(&context).convert(&body)
    }

    fn switch_body(values: &[i32]) -> Body {
        Body {
            locals: vec![],
            statements: vec![statement(StatementKind::Switch {
                value: local("p"),
                cases: values
                    .iter()
                    .map(|v| SwitchCase { values: vec![*v], body: vec![statement(StatementKind::Break)] })
                    .collect(),
                default: vec![],
            })],
        }
    }

    #[test]
    fn test_dense_switch_uses_a_table() {
        let block = convert(switch_body(&[1, 2, 4])).unwrap();
        let mut table = None;
        block.for_each_root(&mut |root| {
            if let AstOperand::Switch { first_key, labels } = &root.operand {
                table = Some((*first_key, labels.len()));
            }
        });
        assert_eq!(table, Some((1, 4)));
    }

    #[test]
    fn test_sparse_switch_uses_compares() {
        let block = convert(switch_body(&[1, 1000, 100000])).unwrap();
        let codes = roots(&block);
        assert!(!codes.contains(&AstCode::Switch));
        assert_eq!(codes.iter().filter(|c| **c == AstCode::Brtrue).count(), 3);
    }

    #[test]
    fn test_while_with_break_and_continue() {
        let body = Body {
            locals: vec![Local { name: "i".into(), ty: TypeRef::I32 }],
            statements: vec![statement(StatementKind::While {
                condition: expression(
                    ExpressionKind::Compare { operator: CompareOperator::Lt, left: Box::new(local("i")), right: Box::new(int(10)) },
                    TypeRef::Bool,
                ),
                body: vec![
                    statement(StatementKind::If { condition: expression(ExpressionKind::Constant(Constant::Bool(true)), TypeRef::Bool), then: vec![statement(StatementKind::Continue)], otherwise: vec![] }),
                    statement(StatementKind::Break),
                ],
            })],
        };
        let block = convert(body).unwrap();
        let labels: Vec<&AstNode> = block.body.iter().filter(|n| matches!(n, AstNode::Label(_))).collect();
        assert_eq!(labels.len(), 3);
        assert_eq!(block.referenced_labels().len(), 3);
    }

    #[test]
    fn test_break_outside_loop_fails() {
        let body = Body { locals: vec![], statements: vec![statement(StatementKind::Break)] };
        assert!(matches!(convert(body), Err(CompilerError::UnsupportedConstruct { .. })));
    }

    #[test]
    fn test_return_inside_finally_region_fails() {
        let body = Body {
            locals: vec![],
            statements: vec![statement(StatementKind::Try {
                body: vec![statement(StatementKind::Return(None))],
                catches: vec![],
                finally: vec![statement(StatementKind::Expression(int(1)))],
            })],
        };
        let error = convert(body).unwrap_err();
        assert!(error.to_string().contains("finally"));
    }

    #[test]
    fn test_unknown_variable_reports_location() {
        let body = Body { locals: vec![], statements: vec![statement(StatementKind::Expression(local("missing")))] };
        match convert(body) {
            Err(CompilerError::UnsupportedConstruct { location, .. }) => assert_eq!(location.line, 3),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_out_reference_to_a_parameter() {
        let address = ExpressionKind::AddressOf { target: Box::new(local("p")), out: true };
        let body = Body {
            locals: vec![],
            statements: vec![statement(StatementKind::Expression(expression(address, TypeRef::by_ref_of(TypeRef::I32))))],
        };
        let block = convert(body).unwrap();
        let mut found = None;
        block.for_each_root(&mut |root| found = Some((root.code, root.result_type.clone(), root.arguments[0].code)));
        assert_eq!(found, Some((AstCode::OutAddressOf, TypeRef::by_ref_of(TypeRef::I32), AstCode::Ldloc)));
    }

    #[test]
    fn test_reference_to_a_value_fails() {
        let address = ExpressionKind::AddressOf { target: Box::new(int(1)), out: false };
        let body = Body {
            locals: vec![],
            statements: vec![statement(StatementKind::Expression(expression(address, TypeRef::by_ref_of(TypeRef::I32))))],
        };
        assert!(matches!(convert(body), Err(CompilerError::UnsupportedConstruct { .. })));
    }

    #[test]
    fn test_int_literal_widens_for_long_targets() {
        let converted = constant_expression(&Constant::Int(3), TypeRef::I64, SourceLocation::default());
        assert_eq!(converted.code, AstCode::LdcI8);
        assert_eq!(converted.operand, AstOperand::Long(3));
    }
}
