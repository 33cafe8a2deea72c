use crate::backend::pre_compilation::ConversionContext;
use crate::error::CompilerError;
use crate::model::boxed_descriptor;
use crate::trees::ast::{AstBlock, AstCode, AstExpression, AstOperand};
use crate::trees::{MethodRef, TypeRef};

pub fn convert(_context: &ConversionContext, mut block: AstBlock) -> Result<AstBlock, CompilerError> {
    block.walk_expressions_mut(&mut convert_expression)?;
    Ok(block)
}

fn boxed_type(ty: &TypeRef) -> Option<TypeRef> {
    boxed_descriptor(ty).map(|d| TypeRef::Descriptor(d.to_string()))
}

/// Name of the accessor reading the primitive out of its box
fn value_method(ty: &TypeRef) -> Option<&'static str> {
    let name = match ty {
        TypeRef::Bool => "booleanValue",
        TypeRef::I8 | TypeRef::U8 => "byteValue",
        TypeRef::I16 => "shortValue",
        TypeRef::U16 | TypeRef::Char => "charValue",
        TypeRef::I32 | TypeRef::U32 => "intValue",
        TypeRef::I64 | TypeRef::U64 => "longValue",
        TypeRef::F32 => "floatValue",
        TypeRef::F64 => "doubleValue",
        _ => return None,
    };
    Some(name)
}

/// Reads a value of type `target` out of the object `value`
pub(super) fn unbox(value: AstExpression, target: &TypeRef) -> AstExpression {
    let location = value.location.clone();
    let (Some(boxed), Some(accessor)) = (boxed_type(target), value_method(target)) else {
        return AstExpression::new(AstCode::Castclass, AstOperand::Type(target.clone()), vec![value], target.clone(), location);
    };
    let cast = AstExpression::new(AstCode::Castclass, AstOperand::Type(boxed.clone()), vec![value], boxed.clone(), location.clone());
    let method = MethodRef::new(boxed, accessor, vec![], target.clone());
    AstExpression::new(AstCode::Callvirt, AstOperand::Method(method), vec![cast], target.clone(), location)
}

fn box_value(value: AstExpression, result: &TypeRef) -> AstExpression {
    let location = value.location.clone();
    let Some(boxed) = boxed_type(&value.result_type) else {
        return value.with_type(result.clone());
    };
    let method = MethodRef::new_static(boxed.clone(), "valueOf", vec![value.result_type.clone()], boxed);
    AstExpression::new(AstCode::Call, AstOperand::Method(method), vec![value], result.clone(), location)
}

/// Boxing goes through the platform wrapper classes, conversions between reference types
/// become checked casts.
fn convert_expression(expression: &mut AstExpression) -> Result<(), CompilerError> {
    match expression.code {
        AstCode::Box => {
            let value = expression.arguments.remove(0);
            *expression = box_value(value, &expression.result_type);
        }
        AstCode::Unbox => {
            let target = expression.type_operand().cloned().unwrap_or_else(|| expression.result_type.clone());
            let value = expression.arguments.remove(0);
            *expression = unbox(value, &target).with_type(expression.result_type.clone());
        }
        AstCode::Conv => {
            let Some(argument) = expression.arguments.first() else {
                return Ok(());
            };
            let from = argument.result_type.clone();
            let to = expression.result_type.clone();
            if from == to || (from == TypeRef::Bool && to.is_integer()) {
                let value = expression.arguments.remove(0);
                *expression = value.with_type(to);
            } else if from.is_reference() && to.is_reference() {
                expression.code = AstCode::Castclass;
                expression.operand = AstOperand::Type(to);
            } else if from.is_reference() != to.is_reference() {
                return Err(CompilerError::unsupported(
                    &expression.location,
                    format!("conversion from {} to {}", from, to),
                ));
            }
        }
        _ => {}
    }
    Ok(())
}
