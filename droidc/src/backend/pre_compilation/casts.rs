use crate::backend::pre_compilation::conversions::unbox;
use crate::backend::pre_compilation::ConversionContext;
use crate::error::CompilerError;
use crate::trees::ast::{AstBlock, AstCode, AstExpression, AstOperand};
use crate::trees::TypeRef;

pub fn convert(context: &ConversionContext, mut block: AstBlock) -> Result<AstBlock, CompilerError> {
    block.walk_expressions_mut(&mut |expression| {
        convert_expression(context, expression);
        Ok::<(), CompilerError>(())
    })?;
    Ok(block)
}

fn is_redundant(target: &TypeRef, value: &AstExpression) -> bool {
    *target == TypeRef::Object || *target == value.result_type || value.code == AstCode::Ldnull
}

fn convert_expression(context: &ConversionContext, expression: &mut AstExpression) {
    let location = expression.location.clone();
    match expression.code {
        AstCode::Castclass => {
            let Some(target) = expression.type_operand().cloned() else {
                return;
            };
            let Some(value) = expression.arguments.first() else {
                return;
            };
            if target.is_primitive() {
                let value = expression.arguments.remove(0);
                *expression = unbox(value, &target);
            } else if is_redundant(&target, value) {
                let ty = expression.result_type.clone();
                *expression = expression.arguments.remove(0).with_type(ty);
            }
        }
        AstCode::As => {
            let target = expression.type_operand().cloned().unwrap_or_else(|| expression.result_type.clone());
            let value = expression.arguments.remove(0);
            if is_redundant(&target, &value) {
                *expression = value.with_type(target);
                return;
            }
            let temporary = context.temporary("as", value.result_type.clone());
            let load = || AstExpression::load(&temporary, location.clone());
            let test = AstExpression::new(AstCode::Isinst, AstOperand::Type(target.clone()), vec![load()], TypeRef::Bool, location.clone());
            let cast = AstExpression::new(AstCode::Castclass, AstOperand::Type(target.clone()), vec![load()], target.clone(), location.clone());
            let conditional = AstExpression::new(
                AstCode::Conditional,
                AstOperand::None,
                vec![test, cast, AstExpression::null(target.clone(), location.clone())],
                target.clone(),
                location.clone(),
            );
            *expression = AstExpression::new(
                AstCode::Sequence,
                AstOperand::None,
                vec![AstExpression::store(&temporary, value, location.clone()), conditional],
                target,
                location,
            );
        }
        _ => {}
    }
}
