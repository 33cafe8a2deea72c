use crate::backend::pre_compilation::field_initialization::ATOMIC_UPDATER_POSTFIX;
use crate::backend::pre_compilation::ConversionContext;
use crate::error::CompilerError;
use crate::trees::ast::{AstBlock, AstCode, AstExpression, AstOperand};
use crate::trees::{FieldRef, MethodRef};

const INTERLOCKED: &str = "System.Threading.Interlocked";

/// Operation of `Interlocked` and the updater method performing it
const OPERATIONS: [(&str, &str); 5] = [
    ("Increment", "IncrementAndGet"),
    ("Decrement", "DecrementAndGet"),
    ("Add", "AddAndGet"),
    ("Exchange", "GetAndSet"),
    ("CompareExchange", "CompareExchange"),
];

pub fn convert(context: &ConversionContext, mut block: AstBlock) -> Result<AstBlock, CompilerError> {
    block.walk_expressions_mut(&mut |expression| convert_expression(context, expression))?;
    Ok(block)
}

/// `Interlocked.Op(ref obj.field, ...)` becomes `Owner.field$fu.OpAndGet(obj, ...)` when the
/// owner declares an updater for the field. Other interlocked calls are left to the reference
/// lowering.
fn convert_expression(context: &ConversionContext, expression: &mut AstExpression) -> Result<(), CompilerError> {
    if expression.code != AstCode::Call {
        return Ok(());
    }
    let Some(method) = expression.method() else {
        return Ok(());
    };
    if !method.is_static || method.owner.type_name() != Some(INTERLOCKED) {
        return Ok(());
    }
    let Some(&(_, operation)) = OPERATIONS.iter().find(|(name, _)| *name == method.name) else {
        return Ok(());
    };
    let Some(address) = expression.arguments.first() else {
        return Ok(());
    };
    let Some(target) = address.arguments.first() else {
        return Ok(());
    };
    if address.code != AstCode::AddressOf || target.code != AstCode::Ldfld {
        return Ok(());
    }
    let Some(field) = target.field() else {
        return Ok(());
    };
    let Some(owner) = context.module.definition(&field.owner) else {
        return Ok(());
    };
    let updater_name = format!("{}{}", field.name, ATOMIC_UPDATER_POSTFIX);
    let Some(updater) = owner.field(&updater_name).filter(|f| f.is_static) else {
        return Ok(());
    };

    let location = expression.location.clone();
    let rest = expression.arguments.len() - 1;
    let Some(updater_method) = context
        .module
        .definition(&updater.field_type)
        .and_then(|definition| definition.methods.iter().find(|m| m.name == operation && !m.is_static && m.parameters.len() == rest + 1))
    else {
        return Err(CompilerError::unsupported(
            &location,
            format!("{} has no {} for Interlocked.{}", updater.field_type, operation, method.name),
        ));
    };
    let updater_field = FieldRef::new(field.owner.clone(), updater_name, updater.field_type.clone());
    let updater_method = MethodRef::new(
        updater.field_type.clone(),
        operation,
        updater_method.parameter_types(),
        updater_method.return_type.clone(),
    );

    let mut arguments = std::mem::take(&mut expression.arguments).into_iter();
    let Some(mut address) = arguments.next() else {
        unreachable!("the reference argument was inspected above");
    };
    let Some(mut target) = address.arguments.pop() else {
        unreachable!("the referenced field was inspected above");
    };
    let Some(instance) = target.arguments.pop() else {
        return Err(CompilerError::unsupported(&location, "instance field without a receiver"));
    };
    let load_updater = AstExpression::new(
        AstCode::Ldsfld,
        AstOperand::Field(updater_field),
        vec![],
        updater.field_type.clone(),
        location.clone(),
    );
    let mut converted = vec![load_updater, instance];
    converted.extend(arguments);
    let ty = expression.result_type.clone();
    *expression = AstExpression::new(AstCode::Callvirt, AstOperand::Method(updater_method), converted, ty, location);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::pre_compilation::tests::{module, source};
    use crate::backend::pre_compilation::DelegateRegistry;
    use crate::model::{MethodOrigin, NameConverter};
    use crate::trees::ast::AstNode;
    use crate::trees::{SourceLocation, TypeRef};

    const TYPES: &str = r#"{"name": "App", "scope": "app", "types": [
        {"namespace": "App", "name": "Counter", "kind": "class",
         "fields": [{"name": "count", "type": "i32"},
                    {"name": "plain", "type": "i32"},
                    {"name": "count$fu", "type": {"named": "App.IntUpdater"}, "is_static": true}]},
        {"namespace": "App", "name": "IntUpdater", "kind": "class",
         "methods": [{"name": "IncrementAndGet", "return_type": "i32", "parameters": [{"name": "o", "type": "object"}]},
                     {"name": "AddAndGet", "return_type": "i32",
                      "parameters": [{"name": "o", "type": "object"}, {"name": "delta", "type": "i32"}]}]}
    ]}"#;

    fn loc() -> SourceLocation {
        SourceLocation::new("Counter.cs", 12, 9)
    }

    fn interlocked(name: &str, field: &str, extra: Vec<AstExpression>) -> AstExpression {
        let by_ref = TypeRef::by_ref_of(TypeRef::I32);
        let mut parameters = vec![by_ref.clone()];
        parameters.extend(extra.iter().map(|e| e.result_type.clone()));
        let method = MethodRef::new_static(TypeRef::named(INTERLOCKED), name, parameters, TypeRef::I32);
        let load = AstExpression::new(
            AstCode::Ldfld,
            AstOperand::Field(FieldRef::new(TypeRef::named("App.Counter"), field, TypeRef::I32)),
            vec![AstExpression::this(TypeRef::named("App.Counter"), loc())],
            TypeRef::I32,
            loc(),
        );
        let mut arguments = vec![AstExpression::new(AstCode::AddressOf, AstOperand::None, vec![load], by_ref, loc())];
        arguments.extend(extra);
        AstExpression::new(AstCode::Call, AstOperand::Method(method), arguments, TypeRef::I32, loc())
    }

    fn run(call: AstExpression) -> Result<AstExpression, CompilerError> {
        let module = module(TYPES);
        let names = NameConverter::new(&module);
        let delegates = DelegateRegistry::new();
        let source = source("App.Counter", "Tick", false, vec![], MethodOrigin::Ast(AstBlock::default()));
        let context = ConversionContext::new(&module, &names, &source, &delegates);
        let block = convert(&context, AstBlock::new(vec![AstNode::Expression(call)]))?;
        let Some(AstNode::Expression(root)) = block.body.into_iter().next() else { panic!() };
        Ok(root)
    }

    #[test]
    fn test_increment_goes_through_the_updater() {
        let call = run(interlocked("Increment", "count", vec![])).unwrap();
        assert_eq!(call.code, AstCode::Callvirt);
        let method = call.method().unwrap();
        assert_eq!(method.owner, TypeRef::named("App.IntUpdater"));
        assert_eq!(method.name, "IncrementAndGet");
        let arguments: Vec<AstCode> = call.arguments.iter().map(|a| a.code).collect();
        assert_eq!(arguments, vec![AstCode::Ldsfld, AstCode::Ldthis]);
        assert_eq!(call.arguments[0].field().unwrap().name, "count$fu");
        assert_eq!(call.result_type, TypeRef::I32);
    }

    #[test]
    fn test_add_keeps_its_operand() {
        let call = run(interlocked("Add", "count", vec![AstExpression::int(5, TypeRef::I32, loc())])).unwrap();
        assert_eq!(call.method().unwrap().name, "AddAndGet");
        assert_eq!(call.arguments.len(), 3);
        assert_eq!(call.arguments[2].operand, AstOperand::Int(5));
    }

    #[test]
    fn test_field_without_updater_is_left_alone() {
        let original = interlocked("Increment", "plain", vec![]);
        assert_eq!(run(original.clone()).unwrap(), original);
    }

    #[test]
    fn test_missing_updater_operation_is_rejected() {
        let value = AstExpression::int(1, TypeRef::I32, loc());
        match run(interlocked("Exchange", "count", vec![value])) {
            Err(CompilerError::UnsupportedConstruct { location, message }) => {
                assert_eq!(location.line, 12);
                assert!(message.contains("GetAndSet"), "{}", message);
            }
            other => panic!("{:?}", other),
        }
    }
}
