use crate::backend::pre_compilation::ConversionContext;
use crate::error::CompilerError;
use crate::trees::ast::{AstBlock, AstCode, AstExpression, AstOperand};
use crate::trees::{SourceLocation, TypeRef};

pub fn convert(context: &ConversionContext, mut block: AstBlock) -> Result<AstBlock, CompilerError> {
    let converter = NullableConverter { context };
    block.walk_expressions_mut(&mut |expression| converter.convert_expression(expression))?;
    Ok(block)
}

/// A nullable value is its boxed form, or null when it has no value.
///
/// Lifted operators evaluate both operands once and produce null, or false for comparisons,
/// when either operand has no value.
struct NullableConverter<'a, 'b> {
    context: &'a ConversionContext<'b>,
}

fn is_nullable(ty: &TypeRef) -> bool {
    ty.nullable_inner().is_some()
}

fn not_null(value: AstExpression) -> AstExpression {
    let location = value.location.clone();
    let null = AstExpression::null(value.result_type.clone(), location.clone());
    AstExpression::new(AstCode::Cne, AstOperand::None, vec![value, null], TypeRef::Bool, location)
}

fn unbox(value: AstExpression, inner: &TypeRef) -> AstExpression {
    let location = value.location.clone();
    AstExpression::new(AstCode::Unbox, AstOperand::Type(inner.clone()), vec![value], inner.clone(), location)
}

fn boxed(value: AstExpression, nullable: &TypeRef) -> AstExpression {
    let location = value.location.clone();
    let inner = value.result_type.clone();
    AstExpression::new(AstCode::Box, AstOperand::Type(inner), vec![value], nullable.clone(), location)
}

impl NullableConverter<'_, '_> {
    fn convert_expression(&self, expression: &mut AstExpression) -> Result<(), CompilerError> {
        let location = expression.location.clone();
        match expression.code {
            AstCode::HasValue => {
                let value = expression.arguments.remove(0);
                *expression = not_null(value);
            }
            AstCode::GetValue => {
                let value = expression.arguments.remove(0);
                let inner = value.result_type.nullable_inner().cloned().unwrap_or_else(|| expression.result_type.clone());
                *expression = unbox(value, &inner);
            }
            AstCode::DefaultValue if is_nullable(&expression.result_type) => {
                *expression = AstExpression::null(expression.result_type.clone(), location);
            }
            AstCode::Conv => {
                let Some(argument) = expression.arguments.first() else {
                    return Ok(());
                };
                let target = expression.result_type.clone();
                match (is_nullable(&argument.result_type), target.nullable_inner().cloned()) {
                    (false, Some(inner)) => {
                        let mut value = expression.arguments.remove(0);
                        if value.code == AstCode::Ldnull {
                            *expression = value.with_type(target);
                            return Ok(());
                        }
                        if value.result_type != inner {
                            value = AstExpression::new(AstCode::Conv, AstOperand::None, vec![value], inner, location.clone());
                        }
                        *expression = boxed(value, &target);
                    }
                    (true, None) => {
                        let value = expression.arguments.remove(0);
                        let inner = value.result_type.nullable_inner().cloned().unwrap_or(TypeRef::Object);
                        let unboxed = unbox(value, &inner);
                        *expression = if inner == target {
                            unboxed
                        } else {
                            AstExpression::new(AstCode::Conv, AstOperand::None, vec![unboxed], target, location)
                        };
                    }
                    (true, Some(inner)) => {
                        let value = expression.arguments.remove(0);
                        let from = value.result_type.nullable_inner().cloned().unwrap_or(TypeRef::Object);
                        if from == inner {
                            *expression = value.with_type(target);
                        } else {
                            *expression = self.lift(vec![value], &location, |mut unboxed, location| {
                                let converted = AstExpression::new(AstCode::Conv, AstOperand::None, vec![unboxed.remove(0)], inner.clone(), location.clone());
                                boxed(converted, &target)
                            }, AstExpression::null(target.clone(), location.clone()));
                        }
                    }
                    (false, None) => {}
                }
            }
            code if code.is_arithmetic() || matches!(code, AstCode::Neg | AstCode::Not) => {
                if !expression.arguments.iter().any(|a| is_nullable(&a.result_type)) {
                    return Ok(());
                }
                let result = expression.result_type.clone();
                let inner = result.nullable_inner().cloned().unwrap_or_else(|| result.clone());
                let arguments = std::mem::take(&mut expression.arguments);
                let otherwise = AstExpression::null(result.clone(), location.clone());
                *expression = self.lift(arguments, &location, |operands, location| {
                    let computed = AstExpression::new(code, AstOperand::None, operands, inner.clone(), location.clone());
                    boxed(computed, &result)
                }, otherwise);
            }
            code if code.is_compare() => {
                let nullable = expression.arguments.iter().any(|a| is_nullable(&a.result_type));
                let against_null = expression.arguments.iter().any(|a| a.code == AstCode::Ldnull);
                if !nullable || against_null {
                    return Ok(());
                }
                let arguments = std::mem::take(&mut expression.arguments);
                let otherwise = if matches!(code, AstCode::Ceq | AstCode::Cne) {
                    // Equal when both are null, different when only one is.
                    None
                } else {
                    Some(AstExpression::int(0, TypeRef::Bool, location.clone()))
                };
                *expression = self.lift_compare(code, arguments, &location, otherwise);
            }
            _ => {}
        }
        Ok(())
    }

    /// Evaluates `operands` into temporaries and yields `compute` of their unboxed values when
    /// every nullable operand has a value, `otherwise` when one does not
    fn lift(
        &self,
        operands: Vec<AstExpression>,
        location: &SourceLocation,
        compute: impl FnOnce(Vec<AstExpression>, &SourceLocation) -> AstExpression,
        otherwise: AstExpression,
    ) -> AstExpression {
        let result = otherwise.result_type.clone();
        let (stores, loads) = self.evaluate_once(operands, location);
        let condition = self.all_have_values(&loads, location);
        let unboxed = loads
            .iter()
            .map(|l| match l.result_type.nullable_inner() {
                Some(inner) => unbox(l.clone(), inner),
                None => l.clone(),
            })
            .collect();
        let conditional = AstExpression::new(
            AstCode::Conditional,
            AstOperand::None,
            vec![condition, compute(unboxed, location), otherwise],
            result.clone(),
            location.clone(),
        );
        sequence(stores, conditional, result, location)
    }

    fn lift_compare(
        &self,
        code: AstCode,
        operands: Vec<AstExpression>,
        location: &SourceLocation,
        otherwise: Option<AstExpression>,
    ) -> AstExpression {
        let (stores, loads) = self.evaluate_once(operands, location);
        let condition = self.all_have_values(&loads, location);
        let unboxed = loads
            .iter()
            .map(|l| match l.result_type.nullable_inner() {
                Some(inner) => unbox(l.clone(), inner),
                None => l.clone(),
            })
            .collect();
        let compared = AstExpression::new(code, AstOperand::None, unboxed, TypeRef::Bool, location.clone());
        let otherwise = otherwise.unwrap_or_else(|| {
            let references = loads.iter().map(|l| l.clone().with_type(TypeRef::Object)).collect();
            AstExpression::new(code, AstOperand::None, references, TypeRef::Bool, location.clone())
        });
        let conditional = AstExpression::new(
            AstCode::Conditional,
            AstOperand::None,
            vec![condition, compared, otherwise],
            TypeRef::Bool,
            location.clone(),
        );
        sequence(stores, conditional, TypeRef::Bool, location)
    }

    fn evaluate_once(&self, operands: Vec<AstExpression>, location: &SourceLocation) -> (Vec<AstExpression>, Vec<AstExpression>) {
        let mut stores = Vec::new();
        let mut loads = Vec::new();
        for operand in operands {
            if operand.is_pure() {
                loads.push(operand);
                continue;
            }
            let temporary = self.context.temporary("nv", operand.result_type.clone());
            loads.push(AstExpression::load(&temporary, location.clone()));
            stores.push(AstExpression::store(&temporary, operand, location.clone()));
        }
        (stores, loads)
    }

    fn all_have_values(&self, loads: &[AstExpression], location: &SourceLocation) -> AstExpression {
        loads
            .iter()
            .filter(|l| is_nullable(&l.result_type))
            .map(|l| not_null(l.clone()))
            .reduce(|a, b| AstExpression::new(AstCode::LogicAnd, AstOperand::None, vec![a, b], TypeRef::Bool, location.clone()))
            .unwrap_or_else(|| AstExpression::int(1, TypeRef::Bool, location.clone()))
    }
}

fn sequence(mut stores: Vec<AstExpression>, value: AstExpression, ty: TypeRef, location: &SourceLocation) -> AstExpression {
    if stores.is_empty() {
        return value;
    }
    stores.push(value);
    AstExpression::new(AstCode::Sequence, AstOperand::None, stores, ty, location.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::pre_compilation::tests::{codes, module, source};
    use crate::backend::pre_compilation::DelegateRegistry;
    use crate::model::{MethodOrigin, NameConverter};
    use crate::trees::ast::{AstNode, AstVariable, VariableKind};

    fn run(root: AstExpression) -> AstBlock {
        let module = module(r#"{"name": "App", "scope": "app", "types": []}"#);
        let names = NameConverter::new(&module);
        let delegates = DelegateRegistry::new();
        let block = AstBlock::new(vec![AstNode::Expression(root)]);
        let source = source("App.P", "Run", true, vec![], MethodOrigin::Ast(block.clone()));
        let context = ConversionContext::new(&module, &names, &source, &delegates);
        convert(&context, block).unwrap()
    }

    fn loc() -> SourceLocation {
        SourceLocation::new("a.cs", 5, 1)
    }

    fn nullable_int() -> TypeRef {
        TypeRef::nullable_of(TypeRef::I32)
    }

    fn ret(value: AstExpression) -> AstExpression {
        AstExpression::statement(AstCode::Ret, AstOperand::None, vec![value], loc())
    }

    fn variable(name: &str) -> AstExpression {
        AstExpression::load(&AstVariable::new(name, nullable_int(), VariableKind::Local), loc())
    }

    #[test]
    fn test_has_value_is_null_check() {
        let has = AstExpression::new(AstCode::HasValue, AstOperand::None, vec![variable("a")], TypeRef::Bool, loc());
        assert_eq!(codes(&run(ret(has))), vec![AstCode::Ret, AstCode::Cne, AstCode::Ldloc, AstCode::Ldnull]);
    }

    #[test]
    fn test_wrapping_a_value_boxes_it() {
        let conv = AstExpression::new(AstCode::Conv, AstOperand::None, vec![AstExpression::int(4, TypeRef::I32, loc())], nullable_int(), loc());
        assert_eq!(codes(&run(ret(conv))), vec![AstCode::Ret, AstCode::Box, AstCode::LdcI4]);
    }

    #[test]
    fn test_lifted_addition() {
        let add = AstExpression::new(AstCode::Add, AstOperand::None, vec![variable("a"), variable("b")], nullable_int(), loc());
        let block = run(ret(add));
        let all = codes(&block);
        assert_eq!(&all[..3], &[AstCode::Ret, AstCode::Conditional, AstCode::LogicAnd]);
        assert!(all.contains(&AstCode::Box));
        assert_eq!(all.iter().filter(|c| **c == AstCode::Unbox).count(), 2);
        assert!(!all.contains(&AstCode::Sequence));
    }

    #[test]
    fn test_comparison_with_null_is_kept() {
        let eq = AstExpression::new(AstCode::Ceq, AstOperand::None, vec![variable("a"), AstExpression::null(nullable_int(), loc())], TypeRef::Bool, loc());
        assert_eq!(codes(&run(ret(eq))), vec![AstCode::Ret, AstCode::Ceq, AstCode::Ldloc, AstCode::Ldnull]);
    }
}
