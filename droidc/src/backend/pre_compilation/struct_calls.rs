use crate::backend::pre_compilation::ConversionContext;
use crate::error::CompilerError;
use crate::trees::ast::{AstBlock, AstCode, AstExpression, AstNode, AstOperand, VariableKind};
use crate::trees::{MethodRef, SourceLocation, TypeRef};

/// Name of the copy method every value type gets
pub const CLONE_METHOD: &str = "$Clone";

pub fn convert(context: &ConversionContext, mut block: AstBlock) -> Result<AstBlock, CompilerError> {
    let converter = StructCallConverter { context };
    block.walk_expressions_mut(&mut |expression| converter.convert_expression(expression))?;
    let initializers: Vec<AstNode> = block
        .variables()
        .into_iter()
        .filter(|v| v.kind == VariableKind::Local && context.module.is_struct(&v.ty))
        .map(|variable| {
            let location = context.source.location.clone();
            AstNode::Expression(AstExpression::store(&variable, construct(&variable.ty, &location), location))
        })
        .collect();
    block.body.splice(0..0, initializers);
    Ok(block)
}

/// Value types are classes on the target, so copying a value means cloning the instance.
///
/// A struct value read from storage is cloned whenever it is stored elsewhere or passed as an
/// argument. Receivers are not cloned, calls operate on the storage itself.
struct StructCallConverter<'a, 'b> {
    context: &'a ConversionContext<'b>,
}

pub(super) fn clone_method(ty: &TypeRef) -> MethodRef {
    MethodRef::new(ty.clone(), CLONE_METHOD, vec![], ty.clone())
}

fn construct(ty: &TypeRef, location: &SourceLocation) -> AstExpression {
    let constructor = MethodRef::new(ty.clone(), ".ctor", vec![], TypeRef::Void);
    AstExpression::new(AstCode::Newobj, AstOperand::Method(constructor), vec![], ty.clone(), location.clone())
}

impl StructCallConverter<'_, '_> {
    fn is_struct(&self, ty: &TypeRef) -> bool {
        self.context.module.is_struct(ty)
    }

    fn convert_expression(&self, expression: &mut AstExpression) -> Result<(), CompilerError> {
        match expression.code {
            AstCode::DefaultValue if self.is_struct(&expression.result_type) => {
                *expression = construct(&expression.result_type, &expression.location);
            }
            AstCode::Stloc | AstCode::Stsfld | AstCode::Stfld | AstCode::Stelem => {
                if let Some(value) = expression.arguments.last_mut() {
                    self.clone_if_stored(value);
                }
            }
            AstCode::Call | AstCode::Callvirt | AstCode::Newobj => {
                let has_receiver = expression.code != AstCode::Newobj && expression.method().is_some_and(|m| !m.is_static);
                let skip = usize::from(has_receiver);
                for argument in expression.arguments.iter_mut().skip(skip) {
                    self.clone_if_stored(argument);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn clone_if_stored(&self, value: &mut AstExpression) {
        if !value.code.is_load() || !self.is_struct(&value.result_type) {
            return;
        }
        let location = value.location.clone();
        let ty = value.result_type.clone();
        let original = std::mem::replace(value, AstExpression::null(TypeRef::Object, location.clone()));
        *value = AstExpression::new(AstCode::Callvirt, AstOperand::Method(clone_method(&ty)), vec![original], ty, location);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::pre_compilation::tests::{codes, module, roots, source};
    use crate::backend::pre_compilation::DelegateRegistry;
    use crate::model::{MethodOrigin, NameConverter};
    use crate::trees::ast::AstVariable;

    const TYPES: &str = r#"{"name": "App", "scope": "app", "types": [
        {"namespace": "App", "name": "Point", "kind": "struct",
         "fields": [{"name": "x", "type": "i32"}, {"name": "y", "type": "i32"}]}
    ]}"#;

    fn run(block: AstBlock) -> AstBlock {
        let module = module(TYPES);
        let names = NameConverter::new(&module);
        let delegates = DelegateRegistry::new();
        let source = source("App.P", "Run", true, vec![], MethodOrigin::Ast(block.clone()));
        let context = ConversionContext::new(&module, &names, &source, &delegates);
        convert(&context, block).unwrap()
    }

    fn loc() -> SourceLocation {
        SourceLocation::new("a.cs", 7, 3)
    }

    fn point() -> TypeRef {
        TypeRef::named("App.Point")
    }

    #[test]
    fn test_assignment_clones_and_locals_are_constructed() {
        let a = AstVariable::new("a", point(), VariableKind::Local);
        let b = AstVariable::new("b", point(), VariableKind::Local);
        let block = run(AstBlock::new(vec![AstNode::Expression(AstExpression::store(&b, AstExpression::load(&a, loc()), loc()))]));
        assert_eq!(roots(&block), vec![AstCode::Stloc, AstCode::Stloc, AstCode::Stloc]);
        let all = codes(&block);
        assert_eq!(&all[all.len() - 3..], &[AstCode::Stloc, AstCode::Callvirt, AstCode::Ldloc]);
        assert_eq!(all.iter().filter(|c| **c == AstCode::Newobj).count(), 2);
    }

    #[test]
    fn test_receiver_is_not_cloned() {
        let a = AstVariable::new("a", point(), VariableKind::Parameter(0));
        let length = MethodRef::new(point(), "Length", vec![point()], TypeRef::I32);
        let call = AstExpression::new(
            AstCode::Call,
            AstOperand::Method(length),
            vec![AstExpression::load(&a, loc()), AstExpression::load(&a, loc())],
            TypeRef::I32,
            loc(),
        );
        let ret = AstExpression::statement(AstCode::Ret, AstOperand::None, vec![call], loc());
        let block = run(AstBlock::new(vec![AstNode::Expression(ret)]));
        assert_eq!(codes(&block), vec![AstCode::Ret, AstCode::Call, AstCode::Ldloc, AstCode::Callvirt, AstCode::Ldloc]);
    }

    #[test]
    fn test_default_value_constructs() {
        let default = AstExpression::new(AstCode::DefaultValue, AstOperand::Type(point()), vec![], point(), loc());
        let ret = AstExpression::statement(AstCode::Ret, AstOperand::None, vec![default], loc());
        let block = run(AstBlock::new(vec![AstNode::Expression(ret)]));
        assert_eq!(codes(&block), vec![AstCode::Ret, AstCode::Newobj]);
    }
}
