use crate::backend::pre_compilation::ConversionContext;
use crate::error::CompilerError;
use crate::trees::ast::{AstBlock, AstCode, AstExpression, AstNode, AstOperand};
use crate::trees::{MethodRef, StackKind, TypeRef};

/// Last rewrites before generics and casts: default values become constants and the leftovers
/// of earlier converters are folded away.
pub fn convert(context: &ConversionContext, mut block: AstBlock) -> Result<AstBlock, CompilerError> {
    block.walk_expressions_mut(&mut |expression| {
        simplify(context, expression);
        Ok::<(), CompilerError>(())
    })?;
    remove_empty(&mut block);
    Ok(block)
}

fn default_constant(context: &ConversionContext, expression: &AstExpression) -> AstExpression {
    let ty = expression.result_type.clone();
    let location = expression.location.clone();
    match ty.stack_kind() {
        StackKind::Int => AstExpression::int(0, ty, location),
        StackKind::Long => AstExpression::long(0, ty, location),
        StackKind::Float => AstExpression::new(AstCode::LdcR4, AstOperand::Float(0), vec![], ty, location),
        StackKind::Double => AstExpression::new(AstCode::LdcR8, AstOperand::Double(0), vec![], ty, location),
        StackKind::Reference if context.module.is_struct(&ty) => {
            let constructor = MethodRef::new(ty.clone(), ".ctor", vec![], TypeRef::Void);
            AstExpression::new(AstCode::Newobj, AstOperand::Method(constructor), vec![], ty, location)
        }
        StackKind::Reference | StackKind::Void => AstExpression::null(ty, location),
    }
}

fn simplify(context: &ConversionContext, expression: &mut AstExpression) {
    match expression.code {
        AstCode::DefaultValue => *expression = default_constant(context, expression),
        AstCode::Sequence if expression.arguments.len() == 1 => {
            let ty = expression.result_type.clone();
            *expression = expression.arguments.remove(0).with_type(ty);
        }
        AstCode::Conv if expression.arguments.first().is_some_and(|a| a.result_type == expression.result_type) => {
            *expression = expression.arguments.remove(0);
        }
        AstCode::LogicNot if expression.arguments.first().is_some_and(|a| a.code == AstCode::LogicNot) => {
            let mut inner = expression.arguments.remove(0);
            *expression = inner.arguments.remove(0);
        }
        AstCode::Brtrue | AstCode::Brfalse if expression.arguments.first().is_some_and(|a| a.code == AstCode::LogicNot) => {
            let mut negated = expression.arguments.remove(0);
            expression.arguments.insert(0, negated.arguments.remove(0));
            expression.code = if expression.code == AstCode::Brtrue { AstCode::Brfalse } else { AstCode::Brtrue };
        }
        _ => {}
    }
}

fn remove_empty(block: &mut AstBlock) {
    let nodes = std::mem::take(&mut block.body);
    for node in nodes {
        match node {
            AstNode::Expression(expression) if expression.code == AstCode::Nop && expression.arguments.is_empty() => {}
            AstNode::Block(mut inner) => {
                remove_empty(&mut inner);
                block.body.push(AstNode::Block(inner));
            }
            AstNode::TryCatch(mut try_catch) => {
                remove_empty(&mut try_catch.try_block);
                for catch in try_catch.catches.iter_mut() {
                    remove_empty(&mut catch.body);
                }
                if let Some(finally) = try_catch.finally.as_mut() {
                    remove_empty(finally);
                }
                if try_catch.try_block.body.is_empty() {
                    // Nothing can throw, only the finally block runs.
                    if let Some(finally) = try_catch.finally {
                        block.body.push(AstNode::Block(finally));
                    }
                } else {
                    block.body.push(AstNode::TryCatch(try_catch));
                }
            }
            other => block.body.push(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::pre_compilation::tests::{codes, module, roots, source};
    use crate::backend::pre_compilation::DelegateRegistry;
    use crate::model::{MethodOrigin, NameConverter};
    use crate::trees::ast::{AstCatch, AstTryCatch, AstVariable, VariableKind};
    use crate::trees::SourceLocation;

    fn run(block: AstBlock) -> AstBlock {
        let module = module(r#"{"name": "App", "scope": "app", "types": []}"#);
        let names = NameConverter::new(&module);
        let delegates = DelegateRegistry::new();
        let source = source("App.P", "Run", true, vec![], MethodOrigin::Ast(block.clone()));
        let context = ConversionContext::new(&module, &names, &source, &delegates);
        convert(&context, block).unwrap()
    }

    fn loc() -> SourceLocation {
        SourceLocation::new("a.cs", 8, 1)
    }

    fn flag() -> AstExpression {
        AstExpression::load(&AstVariable::new("flag", TypeRef::Bool, VariableKind::Local), loc())
    }

    fn not(value: AstExpression) -> AstExpression {
        AstExpression::new(AstCode::LogicNot, AstOperand::None, vec![value], TypeRef::Bool, loc())
    }

    #[test]
    fn test_defaults_become_constants() {
        let default = |ty: TypeRef| AstExpression::new(AstCode::DefaultValue, AstOperand::Type(ty.clone()), vec![], ty, loc());
        let x = AstVariable::new("x", TypeRef::F64, VariableKind::Local);
        let s = AstVariable::new("s", TypeRef::String, VariableKind::Local);
        let block = run(AstBlock::new(vec![
            AstNode::Expression(AstExpression::store(&x, default(TypeRef::F64), loc())),
            AstNode::Expression(AstExpression::store(&s, default(TypeRef::String), loc())),
        ]));
        assert_eq!(codes(&block), vec![AstCode::Stloc, AstCode::LdcR8, AstCode::Stloc, AstCode::Ldnull]);
    }

    #[test]
    fn test_negations_fold() {
        let block = run(AstBlock::new(vec![
            AstNode::Expression(AstExpression::label_branch(AstCode::Brtrue, "L0", vec![not(flag())], loc())),
            AstNode::Expression(AstExpression::label_branch(AstCode::Brtrue, "L0", vec![not(not(flag()))], loc())),
            AstNode::Label("L0".into()),
        ]));
        assert_eq!(codes(&block), vec![AstCode::Brfalse, AstCode::Ldloc, AstCode::Brtrue, AstCode::Ldloc]);
    }

    #[test]
    fn test_empty_try_keeps_its_finally() {
        let finally = AstBlock::new(vec![AstNode::Expression(AstExpression::statement(AstCode::Ret, AstOperand::None, vec![], loc()))]);
        let try_catch = AstTryCatch {
            try_block: AstBlock::new(vec![AstNode::Expression(AstExpression::statement(AstCode::Nop, AstOperand::None, vec![], loc()))]),
            catches: vec![AstCatch { exception_type: None, variable: None, body: AstBlock::default(), location: loc() }],
            finally: Some(finally),
            location: loc(),
        };
        let block = run(AstBlock::new(vec![AstNode::TryCatch(try_catch)]));
        assert!(matches!(&block.body[0], AstNode::Block(_)));
        assert_eq!(roots(&block), vec![AstCode::Ret]);
    }
}
