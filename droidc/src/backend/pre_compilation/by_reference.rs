use crate::backend::pre_compilation::ConversionContext;
use crate::error::CompilerError;
use crate::trees::ast::{AstBlock, AstCode, AstExpression, AstOperand};
use crate::trees::{SourceLocation, TypeRef};

/// Lowers references to one-element arrays.
///
/// A `ref` or `out` parameter holds an array of its referent type, read and written at index
/// zero. A caller passing a local, field or element copies it into a fresh array before the
/// call and back out after it. `out` arguments start from an empty array.
pub fn convert(context: &ConversionContext, mut block: AstBlock) -> Result<AstBlock, CompilerError> {
    block.walk_expressions_mut(&mut |expression| convert_expression(context, expression))?;
    let mut stray = None;
    block.for_each_expression(&mut |expression| {
        if stray.is_none() && is_address(expression) {
            stray = Some(expression.location.clone());
        }
    });
    match stray {
        Some(location) => Err(CompilerError::unsupported(&location, "reference used outside a call argument")),
        None => Ok(block),
    }
}

fn is_address(expression: &AstExpression) -> bool {
    matches!(expression.code, AstCode::AddressOf | AstCode::OutAddressOf)
}

fn zero(location: &SourceLocation) -> AstExpression {
    AstExpression::int(0, TypeRef::I32, location.clone())
}

fn convert_expression(context: &ConversionContext, expression: &mut AstExpression) -> Result<(), CompilerError> {
    let location = expression.location.clone();
    match expression.code {
        AstCode::Ldobj => {
            let Some(address) = expression.arguments.pop() else {
                return Err(CompilerError::unsupported(&location, "load through a missing reference"));
            };
            let ty = expression.result_type.clone();
            *expression = if is_address(&address) {
                referenced_location(address)?.with_type(ty)
            } else {
                AstExpression::new(AstCode::Ldelem, AstOperand::Type(ty.clone()), vec![address, zero(&location)], ty, location)
            };
        }
        AstCode::Stobj => {
            let (Some(value), Some(address)) = (expression.arguments.pop(), expression.arguments.pop()) else {
                return Err(CompilerError::unsupported(&location, "store through a missing reference"));
            };
            let referent = expression
                .type_operand()
                .cloned()
                .or_else(|| address.result_type.referent().cloned())
                .unwrap_or_else(|| value.result_type.clone());
            *expression = if is_address(&address) {
                store_to(referenced_location(address)?, value, location)?
            } else {
                AstExpression::statement(AstCode::Stelem, AstOperand::Type(referent), vec![address, zero(&location), value], location)
            };
        }
        AstCode::Call | AstCode::Callvirt | AstCode::Newobj | AstCode::DelegateInvoke
            if expression.arguments.iter().any(is_address) =>
        {
            convert_call(context, expression)?;
        }
        _ => {}
    }
    Ok(())
}

/// The load an `AddressOf` refers to
fn referenced_location(mut address: AstExpression) -> Result<AstExpression, CompilerError> {
    address
        .arguments
        .pop()
        .ok_or_else(|| CompilerError::unsupported(&address.location, "reference without a target"))
}

/// The store writing `value` to the location `load` reads
pub(super) fn store_to(load: AstExpression, value: AstExpression, location: SourceLocation) -> Result<AstExpression, CompilerError> {
    let code = match load.code {
        AstCode::Ldloc => AstCode::Stloc,
        AstCode::Ldsfld => AstCode::Stsfld,
        AstCode::Ldfld => AstCode::Stfld,
        AstCode::Ldelem => AstCode::Stelem,
        _ => return Err(CompilerError::unsupported(&location, "reference to a value that is not a storage location")),
    };
    let mut arguments = load.arguments;
    arguments.push(value);
    Ok(AstExpression::statement(code, load.operand, arguments, location))
}

/// Passes every referenced location through a one-element array and writes it back after the
/// call. The call's value, if any, is kept in a temporary while the locations are updated.
fn convert_call(context: &ConversionContext, call: &mut AstExpression) -> Result<(), CompilerError> {
    let location = call.location.clone();
    let mut write_backs = Vec::new();
    for argument in call.arguments.iter_mut().filter(|a| is_address(a)) {
        let out = argument.code == AstCode::OutAddressOf;
        let mut target = referenced_location(std::mem::replace(argument, zero(&location)))?;
        let referent = target.result_type.clone();

        let mut effects = Vec::new();
        for receiver in target.arguments.iter_mut().filter(|r| !r.is_pure()) {
            let temporary = context.temporary("rr", receiver.result_type.clone());
            let evaluated = std::mem::replace(receiver, AstExpression::load(&temporary, location.clone()));
            effects.push(AstExpression::store(&temporary, evaluated, location.clone()));
        }
        let array_type = TypeRef::array_of(referent.clone());
        let array = context.temporary("ref", array_type.clone());
        let initial = if out {
            let length = AstExpression::int(1, TypeRef::I32, location.clone());
            AstExpression::new(AstCode::Newarr, AstOperand::Type(referent.clone()), vec![length], array_type.clone(), location.clone())
        } else {
            AstExpression::new(AstCode::InitArray, AstOperand::Type(referent.clone()), vec![target.clone()], array_type.clone(), location.clone())
        };
        effects.push(AstExpression::store(&array, initial, location.clone()));
        effects.push(AstExpression::load(&array, location.clone()));
        *argument = AstExpression::new(AstCode::Sequence, AstOperand::None, effects, array_type, location.clone());

        let element = AstExpression::new(
            AstCode::Ldelem,
            AstOperand::Type(referent.clone()),
            vec![AstExpression::load(&array, location.clone()), zero(&location)],
            referent,
            location.clone(),
        );
        write_backs.push(store_to(target, element, location.clone())?);
    }

    let ty = call.result_type.clone();
    let original = std::mem::replace(call, zero(&location));
    let mut sequence = Vec::with_capacity(write_backs.len() + 2);
    if ty.is_void() {
        sequence.push(original);
        sequence.extend(write_backs);
    } else {
        let result = context.temporary("rv", ty.clone());
        sequence.push(AstExpression::store(&result, original, location.clone()));
        sequence.extend(write_backs);
        sequence.push(AstExpression::load(&result, location.clone()));
    }
    *call = AstExpression::new(AstCode::Sequence, AstOperand::None, sequence, ty, location);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::pre_compilation::tests::{codes, module, source};
    use crate::backend::pre_compilation::DelegateRegistry;
    use crate::model::{MethodOrigin, NameConverter};
    use crate::trees::ast::{AstNode, AstVariable, VariableKind};
    use crate::trees::{FieldRef, MethodRef};

    fn loc() -> SourceLocation {
        SourceLocation::new("Refs.cs", 3, 5)
    }

    fn run(block: AstBlock) -> Result<AstBlock, CompilerError> {
        let module = module(r#"{"name": "App", "scope": "app", "types": []}"#);
        let names = NameConverter::new(&module);
        let delegates = DelegateRegistry::new();
        let source = source("App.P", "Run", true, vec![], MethodOrigin::Ast(block.clone()));
        let context = ConversionContext::new(&module, &names, &source, &delegates);
        convert(&context, block)
    }

    fn address(code: AstCode, target: AstExpression) -> AstExpression {
        let ty = TypeRef::by_ref_of(target.result_type.clone());
        AstExpression::new(code, AstOperand::None, vec![target], ty, loc())
    }

    fn try_parse(result: TypeRef) -> MethodRef {
        MethodRef::new_static(
            TypeRef::named("App.P"),
            "TryParse",
            vec![TypeRef::String, TypeRef::by_ref_of(TypeRef::I32)],
            result,
        )
    }

    fn root(block: &AstBlock) -> &AstExpression {
        let Some(AstNode::Expression(root)) = block.body.first() else { panic!() };
        root
    }

    #[test]
    fn test_parameter_reads_and_writes_index_zero() {
        let parameter = AstVariable::new("x", TypeRef::by_ref_of(TypeRef::I32), VariableKind::Parameter(0));
        let read = AstExpression::new(
            AstCode::Ldobj,
            AstOperand::Type(TypeRef::I32),
            vec![AstExpression::load(&parameter, loc())],
            TypeRef::I32,
            loc(),
        );
        let incremented = AstExpression::new(AstCode::Add, AstOperand::None, vec![read, AstExpression::int(1, TypeRef::I32, loc())], TypeRef::I32, loc());
        let write = AstExpression::statement(
            AstCode::Stobj,
            AstOperand::Type(TypeRef::I32),
            vec![AstExpression::load(&parameter, loc()), incremented],
            loc(),
        );
        let block = run(AstBlock::new(vec![AstNode::Expression(write)])).unwrap();
        assert_eq!(
            codes(&block),
            vec![AstCode::Stelem, AstCode::Ldloc, AstCode::LdcI4, AstCode::Add, AstCode::Ldelem, AstCode::Ldloc, AstCode::LdcI4, AstCode::LdcI4]
        );
        let store = root(&block);
        assert_eq!(store.operand, AstOperand::Type(TypeRef::I32));
        assert_eq!(store.arguments[1].operand, AstOperand::Int(0));
    }

    #[test]
    fn test_local_is_copied_in_and_out() {
        let value = AstVariable::new("value", TypeRef::I32, VariableKind::Local);
        let ok = AstVariable::new("ok", TypeRef::Bool, VariableKind::Local);
        let call = AstExpression::new(
            AstCode::Call,
            AstOperand::Method(try_parse(TypeRef::Bool)),
            vec![
                AstExpression::new(AstCode::Ldstr, AstOperand::String("7".into()), vec![], TypeRef::String, loc()),
                address(AstCode::AddressOf, AstExpression::load(&value, loc())),
            ],
            TypeRef::Bool,
            loc(),
        );
        let block = run(AstBlock::new(vec![AstNode::Expression(AstExpression::store(&ok, call, loc()))])).unwrap();

        let store = root(&block);
        assert_eq!(store.code, AstCode::Stloc);
        let sequence = &store.arguments[0];
        assert_eq!(sequence.code, AstCode::Sequence);
        assert_eq!(sequence.result_type, TypeRef::Bool);
        let steps: Vec<AstCode> = sequence.arguments.iter().map(|a| a.code).collect();
        assert_eq!(steps, vec![AstCode::Stloc, AstCode::Stloc, AstCode::Ldloc]);

        let call = &sequence.arguments[0].arguments[0];
        let passed = &call.arguments[1];
        assert_eq!(passed.code, AstCode::Sequence);
        assert_eq!(passed.arguments[0].arguments[0].code, AstCode::InitArray);
        assert_eq!(passed.result_type, TypeRef::array_of(TypeRef::I32));

        let write_back = &sequence.arguments[1];
        assert_eq!(write_back.variable().unwrap().name, "value");
        assert_eq!(write_back.arguments[0].code, AstCode::Ldelem);
    }

    #[test]
    fn test_out_field_starts_empty_and_receiver_is_evaluated_once() {
        let holder = MethodRef::new_static(TypeRef::named("App.P"), "Holder", vec![], TypeRef::named("App.Box"));
        let field = FieldRef::new(TypeRef::named("App.Box"), "value", TypeRef::I32);
        let target = AstExpression::new(
            AstCode::Ldfld,
            AstOperand::Field(field),
            vec![AstExpression::new(AstCode::Call, AstOperand::Method(holder), vec![], TypeRef::named("App.Box"), loc())],
            TypeRef::I32,
            loc(),
        );
        let call = AstExpression::statement(
            AstCode::Call,
            AstOperand::Method(try_parse(TypeRef::Void)),
            vec![AstExpression::null(TypeRef::String, loc()), address(AstCode::OutAddressOf, target)],
            loc(),
        );
        let block = run(AstBlock::new(vec![AstNode::Expression(call)])).unwrap();
        let sequence = root(&block);
        let steps: Vec<AstCode> = sequence.arguments.iter().map(|a| a.code).collect();
        assert_eq!(steps, vec![AstCode::Call, AstCode::Stfld]);

        let passed = &sequence.arguments[0].arguments[1];
        let setup: Vec<AstCode> = passed.arguments.iter().map(|a| a.code).collect();
        assert_eq!(setup, vec![AstCode::Stloc, AstCode::Stloc, AstCode::Ldloc]);
        assert_eq!(passed.arguments[1].arguments[0].code, AstCode::Newarr);
        let calls = codes(&block).into_iter().filter(|c| *c == AstCode::Call).count();
        assert_eq!(calls, 2);
        assert_eq!(sequence.arguments[1].arguments[0].code, AstCode::Ldloc);
    }

    #[test]
    fn test_reference_outside_a_call_is_rejected() {
        let value = AstVariable::new("value", TypeRef::I32, VariableKind::Local);
        let alias = AstVariable::new("alias", TypeRef::by_ref_of(TypeRef::I32), VariableKind::Local);
        let store = AstExpression::store(&alias, address(AstCode::AddressOf, AstExpression::load(&value, loc())), loc());
        match run(AstBlock::new(vec![AstNode::Expression(store)])) {
            Err(CompilerError::UnsupportedConstruct { location, .. }) => assert_eq!(location.line, 3),
            other => panic!("{:?}", other),
        }
    }
}
