use crate::backend::pre_compilation::ConversionContext;
use crate::error::CompilerError;
use crate::model::ENUM_BASE;
use crate::trees::ast::{AstBlock, AstCode, AstExpression, AstOperand};
use crate::trees::{MethodRef, SourceLocation, StackKind, TypeRef};

pub fn convert(context: &ConversionContext, mut block: AstBlock) -> Result<AstBlock, CompilerError> {
    let converter = EnumConverter { context };
    block.walk_expressions_mut(&mut |expression| converter.convert_expression(expression))?;
    Ok(block)
}

fn enum_base() -> TypeRef {
    TypeRef::Descriptor(ENUM_BASE.to_string())
}

/// `long Enum.longValue()`
pub(super) fn long_value_method() -> MethodRef {
    MethodRef::new(enum_base(), "longValue", vec![], TypeRef::I64)
}

/// `static Enum Enum.get(Class, long)`
pub(super) fn get_method() -> MethodRef {
    MethodRef::new_static(
        enum_base(),
        "get",
        vec![TypeRef::Descriptor("Ljava/lang/Class;".to_string()), TypeRef::I64],
        enum_base(),
    )
}

/// Enum values are instances of their enum class, one per constant.
///
/// Literals become loads of the matching constant field, integral views of a value go through
/// `longValue` and integers become values through the runtime lookup.
struct EnumConverter<'a, 'b> {
    context: &'a ConversionContext<'b>,
}

impl EnumConverter<'_, '_> {
    fn is_enum(&self, ty: &TypeRef) -> bool {
        self.context.module.is_enum(ty)
    }

    fn convert_expression(&self, expression: &mut AstExpression) -> Result<(), CompilerError> {
        let location = expression.location.clone();
        match expression.code {
            AstCode::LdcI4 | AstCode::LdcI8 | AstCode::DefaultValue if self.is_enum(&expression.result_type) => {
                let value = match expression.operand {
                    AstOperand::Int(value) => value as i64,
                    AstOperand::Long(value) => value,
                    _ => 0,
                };
                *expression = self.enum_value(&expression.result_type, value, &location);
            }
            AstCode::Conv => {
                let Some(argument) = expression.arguments.first() else {
                    return Ok(());
                };
                let from_enum = self.is_enum(&argument.result_type);
                let to_enum = self.is_enum(&expression.result_type);
                match (from_enum, to_enum) {
                    (true, true) => {
                        let argument = expression.arguments.remove(0);
                        *expression = self.from_long(&expression.result_type, to_long(argument), &location);
                    }
                    (true, false) => {
                        let target = expression.result_type.clone();
                        let long = to_long(expression.arguments.remove(0));
                        *expression = if target.stack_kind() == StackKind::Long {
                            long.with_type(target)
                        } else {
                            AstExpression::new(AstCode::Conv, AstOperand::None, vec![long], target, location)
                        };
                    }
                    (false, true) => {
                        let argument = expression.arguments.remove(0);
                        let long = if argument.result_type.stack_kind() == StackKind::Long {
                            argument
                        } else {
                            AstExpression::new(AstCode::Conv, AstOperand::None, vec![argument], TypeRef::I64, location.clone())
                        };
                        *expression = self.from_long(&expression.result_type, long, &location);
                    }
                    (false, false) => {}
                }
            }
            code if code.is_arithmetic() || matches!(code, AstCode::Neg | AstCode::Not) => {
                let result_enum = self.is_enum(&expression.result_type);
                if !result_enum && !expression.arguments.iter().any(|a| self.is_enum(&a.result_type)) {
                    return Ok(());
                }
                for argument in expression.arguments.iter_mut() {
                    if self.is_enum(&argument.result_type) {
                        let value = std::mem::replace(argument, AstExpression::null(TypeRef::Object, location.clone()));
                        *argument = to_long(value);
                    } else if argument.result_type.stack_kind() == StackKind::Int && !matches!(code, AstCode::Shl | AstCode::Shr | AstCode::ShrUn) {
                        let value = std::mem::replace(argument, AstExpression::null(TypeRef::Object, location.clone()));
                        *argument = AstExpression::new(AstCode::Conv, AstOperand::None, vec![value], TypeRef::I64, location.clone());
                    }
                }
                if result_enum {
                    let enum_type = expression.result_type.clone();
                    expression.result_type = TypeRef::I64;
                    let computed = std::mem::replace(expression, AstExpression::null(TypeRef::Object, location.clone()));
                    *expression = self.from_long(&enum_type, computed, &location);
                }
            }
            AstCode::Clt | AstCode::Cle | AstCode::Cgt | AstCode::Cge => {
                if expression.arguments.iter().any(|a| self.is_enum(&a.result_type)) {
                    for argument in expression.arguments.iter_mut() {
                        let value = std::mem::replace(argument, AstExpression::null(TypeRef::Object, location.clone()));
                        *argument = if self.is_enum(&value.result_type) {
                            to_long(value)
                        } else {
                            AstExpression::new(AstCode::Conv, AstOperand::None, vec![value], TypeRef::I64, location.clone())
                        };
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// The constant holding `value`, or a runtime lookup when no constant does
    fn enum_value(&self, ty: &TypeRef, value: i64, location: &SourceLocation) -> AstExpression {
        match self.context.module.enum_constant(ty, value) {
            Some(field) => AstExpression::new(AstCode::Ldsfld, AstOperand::Field(field), vec![], ty.clone(), location.clone()),
            None => self.from_long(ty, AstExpression::long(value, TypeRef::I64, location.clone()), location),
        }
    }

    fn from_long(&self, ty: &TypeRef, value: AstExpression, location: &SourceLocation) -> AstExpression {
        let class = AstExpression::new(
            AstCode::TypeOf,
            AstOperand::Type(ty.clone()),
            vec![],
            TypeRef::named("System.Type"),
            location.clone(),
        );
        let lookup = AstExpression::new(AstCode::Call, AstOperand::Method(get_method()), vec![class, value], enum_base(), location.clone());
        AstExpression::new(AstCode::Castclass, AstOperand::Type(ty.clone()), vec![lookup], ty.clone(), location.clone())
    }
}

fn to_long(value: AstExpression) -> AstExpression {
    let location = value.location.clone();
    AstExpression::new(AstCode::Callvirt, AstOperand::Method(long_value_method()), vec![value], TypeRef::I64, location)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::pre_compilation::tests::{codes, module, source};
    use crate::backend::pre_compilation::DelegateRegistry;
    use crate::model::{MethodOrigin, NameConverter};
    use crate::trees::ast::AstNode;

    const TYPES: &str = r#"{"name": "App", "scope": "app", "types": [
        {"namespace": "App", "name": "Color", "kind": "enum",
         "fields": [{"name": "value__", "type": "i32"},
                    {"name": "Red", "type": {"named": "App.Color"}, "is_static": true, "constant": {"int": 0}},
                    {"name": "Green", "type": {"named": "App.Color"}, "is_static": true, "constant": {"int": 1}}]}
    ]}"#;

    fn run(root: AstExpression) -> AstBlock {
        let module = module(TYPES);
        let names = NameConverter::new(&module);
        let delegates = DelegateRegistry::new();
        let block = AstBlock::new(vec![AstNode::Expression(root)]);
        let source = source("App.P", "Run", true, vec![], MethodOrigin::Ast(block.clone()));
        let context = ConversionContext::new(&module, &names, &source, &delegates);
        convert(&context, block).unwrap()
    }

    fn color() -> TypeRef {
        TypeRef::named("App.Color")
    }

    fn ret(value: AstExpression) -> AstExpression {
        AstExpression::statement(AstCode::Ret, AstOperand::None, vec![value], SourceLocation::default())
    }

    #[test]
    fn test_literal_becomes_constant_field() {
        let block = run(ret(AstExpression::int(1, color(), SourceLocation::default())));
        let mut field = None;
        block.for_each_expression(&mut |e| {
            if e.code == AstCode::Ldsfld {
                field = e.field().map(|f| f.name.clone());
            }
        });
        assert_eq!(field.as_deref(), Some("Green"));
    }

    #[test]
    fn test_unknown_value_uses_lookup() {
        let block = run(ret(AstExpression::int(7, color(), SourceLocation::default())));
        assert_eq!(codes(&block), vec![AstCode::Ret, AstCode::Castclass, AstCode::Call, AstCode::TypeOf, AstCode::LdcI8]);
    }

    #[test]
    fn test_conversion_to_int_reads_long_value() {
        let value = AstExpression::new(AstCode::Ldsfld, AstOperand::None, vec![], color(), SourceLocation::default());
        let conv = AstExpression::new(AstCode::Conv, AstOperand::None, vec![value], TypeRef::I32, SourceLocation::default());
        let block = run(ret(conv));
        assert_eq!(codes(&block), vec![AstCode::Ret, AstCode::Conv, AstCode::Callvirt, AstCode::Ldsfld]);
    }

    #[test]
    fn test_flags_arithmetic_round_trips_through_long() {
        let a = AstExpression::int(0, color(), SourceLocation::default());
        let b = AstExpression::int(1, color(), SourceLocation::default());
        let or = AstExpression::new(AstCode::Or, AstOperand::None, vec![a, b], color(), SourceLocation::default());
        let block = run(ret(or));
        let all = codes(&block);
        assert_eq!(&all[..4], &[AstCode::Ret, AstCode::Castclass, AstCode::Call, AstCode::TypeOf]);
        assert_eq!(all.iter().filter(|c| **c == AstCode::Callvirt).count(), 2);
        let again = {
            let module = module(TYPES);
            let names = NameConverter::new(&module);
            let delegates = DelegateRegistry::new();
            let source = source("App.P", "Run", true, vec![], MethodOrigin::Ast(block.clone()));
            let context = ConversionContext::new(&module, &names, &source, &delegates);
            convert(&context, block.clone()).unwrap()
        };
        assert_eq!(again, block);
    }
}
