use crate::backend::pre_compilation::ConversionContext;
use crate::error::CompilerError;
use crate::trees::ast::{AstBlock, AstCode, AstExpression, AstNode, AstOperand};
use crate::trees::TypeRef;

pub fn convert(context: &ConversionContext, mut block: AstBlock) -> Result<AstBlock, CompilerError> {
    let converter = CompoundAssignmentConverter { context };
    block.rewrite_roots(&mut |root| converter.convert_root(root))?;
    Ok(block)
}

/// Turns `target op= value` into an explicit load, compute and store.
///
/// Receivers and indices that are not pure are evaluated once into temporaries.
struct CompoundAssignmentConverter<'a, 'b> {
    context: &'a ConversionContext<'b>,
}

impl CompoundAssignmentConverter<'_, '_> {
    fn convert_root(&self, root: AstExpression) -> Result<Vec<AstNode>, CompilerError> {
        if root.code != AstCode::CompoundAssign {
            if root.arguments.iter().any(|a| a.any(&|e| e.code == AstCode::CompoundAssign)) {
                return Err(CompilerError::unsupported(&root.location, "compound assignment used as a value"));
            }
            return Ok(vec![AstNode::Expression(root)]);
        }
        let AstOperand::Operator(operator) = root.operand else {
            unreachable!("compound assignments carry their operator");
        };
        let location = root.location.clone();
        let mut arguments = root.arguments.into_iter();
        let (Some(mut target), Some(value)) = (arguments.next(), arguments.next()) else {
            unreachable!("compound assignments have a target and a value");
        };

        let mut nodes = Vec::new();
        for argument in target.arguments.iter_mut() {
            if !argument.is_pure() {
                let temporary = self.context.temporary("ca", argument.result_type.clone());
                let evaluated = std::mem::replace(argument, AstExpression::load(&temporary, location.clone()));
                nodes.push(AstNode::Expression(AstExpression::store(&temporary, evaluated, location.clone())));
            }
        }

        let target_type = target.result_type.clone();
        let compute_type = if target_type.is_small_integer() { TypeRef::I32 } else { target_type.clone() };
        let mut computed = AstExpression::new(
            AstCode::from_binary(operator),
            AstOperand::None,
            vec![target.clone(), value],
            compute_type,
            location.clone(),
        );
        if target_type.is_small_integer() {
            computed = AstExpression::new(AstCode::Conv, AstOperand::None, vec![computed], target_type, location.clone());
        }

        let store = match target.code {
            AstCode::Ldloc => AstExpression::statement(AstCode::Stloc, target.operand, vec![computed], location),
            AstCode::Ldsfld => AstExpression::statement(AstCode::Stsfld, target.operand, vec![computed], location),
            AstCode::Ldfld => {
                let mut arguments = target.arguments;
                arguments.push(computed);
                AstExpression::statement(AstCode::Stfld, target.operand, arguments, location)
            }
            AstCode::Ldelem => {
                let mut arguments = target.arguments;
                arguments.push(computed);
                AstExpression::statement(AstCode::Stelem, target.operand, arguments, location)
            }
            AstCode::Ldobj => {
                let mut arguments = target.arguments;
                arguments.push(computed);
                AstExpression::statement(AstCode::Stobj, target.operand, arguments, location)
            }
            _ => return Err(CompilerError::unsupported(&location, "compound assignment to a value that is not a storage location")),
        };
        nodes.push(AstNode::Expression(store));
        Ok(nodes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::pre_compilation::tests::{module, roots, source};
    use crate::backend::pre_compilation::DelegateRegistry;
    use crate::model::{MethodOrigin, NameConverter};
    use crate::trees::{BinaryOperator, FieldRef, MethodRef, SourceLocation};

    fn run(block: AstBlock) -> Result<AstBlock, CompilerError> {
        let module = module(r#"{"name": "App", "scope": "app", "types": []}"#);
        let names = NameConverter::new(&module);
        let delegates = DelegateRegistry::new();
        let source = source("App.P", "Run", true, vec![], MethodOrigin::Ast(block.clone()));
        let context = ConversionContext::new(&module, &names, &source, &delegates);
        convert(&context, block)
    }

    fn loc() -> SourceLocation {
        SourceLocation::new("a.cs", 2, 1)
    }

    fn compound(target: AstExpression, ty: TypeRef) -> AstExpression {
        AstExpression::new(
            AstCode::CompoundAssign,
            AstOperand::Operator(BinaryOperator::Add),
            vec![target, AstExpression::int(1, TypeRef::I32, loc())],
            ty,
            loc(),
        )
    }

    #[test]
    fn test_field_with_call_receiver_uses_temporary() {
        let owner = TypeRef::named("App.P");
        let get = MethodRef::new_static(owner.clone(), "Get", vec![], owner.clone());
        let receiver = AstExpression::new(AstCode::Call, AstOperand::Method(get), vec![], owner.clone(), loc());
        let field = FieldRef::new(owner, "count", TypeRef::I16);
        let load = AstExpression::new(AstCode::Ldfld, AstOperand::Field(field), vec![receiver], TypeRef::I16, loc());
        let block = run(AstBlock::new(vec![AstNode::Expression(compound(load, TypeRef::I16))])).unwrap();
        assert_eq!(roots(&block), vec![AstCode::Stloc, AstCode::Stfld]);
        let mut conversions = 0;
        block.for_each_expression(&mut |e| conversions += (e.code == AstCode::Conv) as usize);
        assert_eq!(conversions, 1);
    }

    #[test]
    fn test_nested_compound_assignment_fails() {
        let field = FieldRef::new(TypeRef::named("App.P"), "total", TypeRef::I32);
        let inner = compound(AstExpression::new(AstCode::Ldsfld, AstOperand::Field(field), vec![], TypeRef::I32, loc()), TypeRef::I32);
        let outer = AstExpression::statement(AstCode::Ret, AstOperand::None, vec![inner], loc());
        assert!(run(AstBlock::new(vec![AstNode::Expression(outer)])).is_err());
    }
}
