use crate::backend::pre_compilation::ConversionContext;
use crate::error::CompilerError;
use crate::model::{GENERIC_INSTANCE_FIELD, GENERIC_METHOD_PARAMETER};
use crate::trees::ast::{AstBlock, AstCode, AstExpression, AstOperand, AstVariable, VariableKind};
use crate::trees::{FieldRef, MethodRef, SourceLocation, TypeRef};

pub fn convert(context: &ConversionContext, mut block: AstBlock) -> Result<AstBlock, CompilerError> {
    let converter = GenericsConverter { context };
    block.walk_expressions_mut(&mut |expression| converter.convert_expression(expression))?;
    Ok(block)
}

fn class_type() -> TypeRef {
    TypeRef::named("System.Type")
}

fn class_array() -> TypeRef {
    TypeRef::array_of(class_type())
}

/// `boolean Class.isInstance(Object)`
fn is_instance_method() -> MethodRef {
    MethodRef::new(class_type(), "isInstance", vec![TypeRef::Object], TypeRef::Bool)
}

/// Type arguments are erased on the target. Where a body needs the runtime class of a type
/// parameter, it reads it from the class array its instance or its caller provides.
struct GenericsConverter<'a, 'b> {
    context: &'a ConversionContext<'b>,
}

impl GenericsConverter<'_, '_> {
    fn convert_expression(&self, expression: &mut AstExpression) -> Result<(), CompilerError> {
        let location = expression.location.clone();
        match expression.code {
            AstCode::TypeOf => {
                if let Some(TypeRef::TypeParameter(name)) = expression.type_operand() {
                    *expression = self.class_of_parameter(name, &location)?;
                }
            }
            AstCode::Castclass if matches!(expression.type_operand(), Some(TypeRef::TypeParameter(_))) => {
                let ty = expression.result_type.clone();
                *expression = expression.arguments.remove(0).with_type(ty);
            }
            AstCode::Isinst if matches!(expression.type_operand(), Some(TypeRef::TypeParameter(_))) => {
                let target = expression.type_operand().cloned().unwrap_or(TypeRef::Object);
                let value = expression.arguments.remove(0);
                *expression = AstExpression::new(
                    AstCode::Callvirt,
                    AstOperand::Method(is_instance_method()),
                    vec![self.class_of(&target, &location)?, value],
                    TypeRef::Bool,
                    location,
                );
            }
            AstCode::As if matches!(expression.type_operand(), Some(TypeRef::TypeParameter(_))) => {
                let target = expression.type_operand().cloned().unwrap_or(TypeRef::Object);
                let value = expression.arguments.remove(0);
                let temporary = self.context.temporary("as", value.result_type.clone());
                let load = || AstExpression::load(&temporary, location.clone());
                let test = AstExpression::new(
                    AstCode::Callvirt,
                    AstOperand::Method(is_instance_method()),
                    vec![self.class_of(&target, &location)?, load()],
                    TypeRef::Bool,
                    location.clone(),
                );
                let conditional = AstExpression::new(
                    AstCode::Conditional,
                    AstOperand::None,
                    vec![test, load().with_type(target.clone()), AstExpression::null(target.clone(), location.clone())],
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
            AstCode::Call | AstCode::Callvirt => {
                let Some(method) = expression.method() else {
                    return Ok(());
                };
                if self.context.names.needs_generic_parameter(method) {
                    let arguments = method.generic_arguments.clone();
                    let classes = self.class_array(&arguments, &location)?;
                    expression.arguments.push(classes);
                }
            }
            AstCode::Newobj => {
                let Some(method) = expression.method() else {
                    return Ok(());
                };
                if self.context.names.needs_generic_instance(&method.owner) {
                    let arguments = match &method.owner {
                        TypeRef::Generic(_, arguments) => arguments.clone(),
                        _ => Vec::new(),
                    };
                    let classes = self.class_array(&arguments, &location)?;
                    expression.arguments.push(classes);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn class_array(&self, arguments: &[TypeRef], location: &SourceLocation) -> Result<AstExpression, CompilerError> {
        let classes = arguments
            .iter()
            .map(|argument| self.class_of(argument, location))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(AstExpression::new(AstCode::InitArray, AstOperand::Type(class_type()), classes, class_array(), location.clone()))
    }

    /// The runtime class of `ty` as an expression
    fn class_of(&self, ty: &TypeRef, location: &SourceLocation) -> Result<AstExpression, CompilerError> {
        match ty {
            TypeRef::TypeParameter(name) => self.class_of_parameter(name, location),
            _ => Ok(AstExpression::new(AstCode::TypeOf, AstOperand::Type(ty.clone()), vec![], class_type(), location.clone())),
        }
    }

    fn class_of_parameter(&self, name: &str, location: &SourceLocation) -> Result<AstExpression, CompilerError> {
        let source = self.context.source;
        let (array, index) = if let Some(index) = source.method_type_parameters.iter().position(|p| p == name) {
            let parameter = source
                .parameter_index(GENERIC_METHOD_PARAMETER)
                .ok_or_else(|| CompilerError::unsupported(location, format!("runtime class of {} is not passed to this method", name)))?;
            let variable = AstVariable::new(GENERIC_METHOD_PARAMETER, class_array(), VariableKind::Parameter(parameter));
            (AstExpression::load(&variable, location.clone()), index)
        } else if let Some(index) = source.class_type_parameters.iter().position(|p| p == name) {
            if source.is_static {
                return Err(CompilerError::unsupported(location, format!("runtime class of {} in a static method", name)));
            }
            let field = FieldRef::new(source.declaring_type.clone(), GENERIC_INSTANCE_FIELD, class_array());
            let this = AstExpression::this(source.declaring_type.clone(), location.clone());
            (AstExpression::new(AstCode::Ldfld, AstOperand::Field(field), vec![this], class_array(), location.clone()), index)
        } else {
            return Err(CompilerError::unsupported(location, format!("unknown type parameter {}", name)));
        };
        let index = AstExpression::int(index as i32, TypeRef::I32, location.clone());
        Ok(AstExpression::new(AstCode::Ldelem, AstOperand::None, vec![array, index], class_type(), location.clone()))
    }
}
