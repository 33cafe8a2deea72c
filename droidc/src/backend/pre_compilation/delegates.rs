//! Delegates become classes: every distinct (delegate type, target method) pair gets one
//! synthesized subclass of the delegate type whose `Invoke` forwards to the method.
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use sha2::{Digest, Sha256};

use crate::backend::pre_compilation::ConversionContext;
use crate::error::CompilerError;
use crate::model::{MethodOrigin, MethodSource, ParameterDefinition};
use crate::trees::ast::{AstBlock, AstCode, AstExpression, AstNode, AstOperand, AstVariable, VariableKind};
use crate::trees::{FieldRef, MethodRef, SourceLocation, TypeRef};

/// Field of a delegate instance holding the receiver of an instance method
pub const TARGET_FIELD: &str = "$target";
/// Separates the owner of the target method from the key hash in instance class names
pub const INSTANCE_MARKER: &str = "$$Delegate$";

#[derive(Debug, Clone, PartialEq)]
pub struct DelegateInstance {
    /// The synthesized class, as a descriptor
    pub class: TypeRef,
    pub delegate_type: TypeRef,
    pub method: MethodRef,
    pub invoke_parameters: Vec<TypeRef>,
    pub invoke_return: TypeRef,
    pub location: SourceLocation,
    /// Short hash of the (delegate type, method) pair, stable across builds
    pub hash: String,
}

impl DelegateInstance {
    pub fn has_target(&self) -> bool {
        !self.method.is_static
    }

    pub fn target_field(&self) -> Option<FieldRef> {
        self.has_target()
            .then(|| FieldRef::new(self.class.clone(), TARGET_FIELD, self.method.owner.clone()))
    }

    pub fn constructor(&self) -> MethodRef {
        let parameters = if self.has_target() { vec![self.method.owner.clone()] } else { Vec::new() };
        MethodRef::new(self.class.clone(), ".ctor", parameters, TypeRef::Void)
    }

    /// `Invoke` as declared by the delegate type
    pub fn invoke(&self) -> MethodRef {
        MethodRef::new(self.delegate_type.clone(), "Invoke", self.invoke_parameters.clone(), self.invoke_return.clone())
    }

    fn method_source(&self, name: &str, parameters: Vec<ParameterDefinition>, return_type: TypeRef, body: AstBlock) -> MethodSource {
        MethodSource {
            declaring_type: self.class.clone(),
            name: name.to_string(),
            is_static: false,
            parameters,
            return_type,
            class_type_parameters: Vec::new(),
            method_type_parameters: Vec::new(),
            location: self.location.clone(),
            origin: MethodOrigin::Ast(body),
        }
    }

    /// Calls the delegate base constructor and stores the target
    pub fn constructor_source(&self) -> MethodSource {
        let location = self.location.clone();
        let this = || AstExpression::this(self.class.clone(), location.clone());
        let base = MethodRef::new(self.delegate_type.clone(), ".ctor", vec![], TypeRef::Void);
        let mut body = vec![AstNode::Expression(AstExpression::statement(
            AstCode::Call,
            AstOperand::Method(base),
            vec![this()],
            location.clone(),
        ))];
        let mut parameters = Vec::new();
        if let Some(field) = self.target_field() {
            let target = AstVariable::new("target", self.method.owner.clone(), VariableKind::Parameter(0));
            parameters.push(ParameterDefinition { name: target.name.clone(), ty: target.ty.clone() });
            body.push(AstNode::Expression(AstExpression::statement(
                AstCode::Stfld,
                AstOperand::Field(field),
                vec![this(), AstExpression::load(&target, location.clone())],
                location.clone(),
            )));
        }
        body.push(AstNode::Expression(AstExpression::statement(AstCode::Ret, AstOperand::None, vec![], location)));
        self.method_source(".ctor", parameters, TypeRef::Void, AstBlock::new(body))
    }

    /// Forwards the arguments to the target method
    pub fn invoke_source(&self) -> MethodSource {
        let location = self.location.clone();
        let parameters: Vec<ParameterDefinition> = self
            .invoke_parameters
            .iter()
            .enumerate()
            .map(|(i, ty)| ParameterDefinition { name: format!("p{}", i), ty: ty.clone() })
            .collect();
        let mut arguments = Vec::new();
        let code = match self.target_field() {
            Some(field) => {
                let this = AstExpression::this(self.class.clone(), location.clone());
                arguments.push(AstExpression::new(
                    AstCode::Ldfld,
                    AstOperand::Field(field),
                    vec![this],
                    self.method.owner.clone(),
                    location.clone(),
                ));
                AstCode::Callvirt
            }
            None => AstCode::Call,
        };
        for (i, parameter) in parameters.iter().enumerate() {
            let variable = AstVariable::new(parameter.name.clone(), parameter.ty.clone(), VariableKind::Parameter(i as u16));
            arguments.push(AstExpression::load(&variable, location.clone()));
        }
        let call = AstExpression::new(
            code,
            AstOperand::Method(self.method.clone()),
            arguments,
            self.method.return_type.clone(),
            location.clone(),
        );
        let body = if self.invoke_return.is_void() {
            vec![
                AstNode::Expression(call),
                AstNode::Expression(AstExpression::statement(AstCode::Ret, AstOperand::None, vec![], location)),
            ]
        } else {
            vec![AstNode::Expression(AstExpression::statement(AstCode::Ret, AstOperand::None, vec![call], location))]
        };
        self.method_source("Invoke", parameters, self.invoke_return.clone(), AstBlock::new(body))
    }
}

/// Delegate instances requested while compiling, shared by all workers
#[derive(Debug, Default)]
pub struct DelegateRegistry {
    instances: Mutex<BTreeMap<String, DelegateInstance>>,
}

impl DelegateRegistry {
    pub fn new() -> Self {
        DelegateRegistry::default()
    }

    fn key(delegate_type: &TypeRef, method: &MethodRef) -> String {
        format!("{}|{}|{}", delegate_type, method, method.is_static)
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, DelegateInstance>> {
        // Instances are inserted whole, so a worker that panicked cannot have left the map half updated
        match self.instances.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// The instance class for `method` wrapped as `delegate_type`, created on first request
    pub fn get_or_create(
        &self,
        context: &ConversionContext,
        delegate_type: &TypeRef,
        method: &MethodRef,
        location: &SourceLocation,
    ) -> Result<DelegateInstance, CompilerError> {
        let key = Self::key(delegate_type, method);
        let mut instances = self.lock();
        if let Some(instance) = instances.get_mut(&key) {
            if precedes(location, &instance.location) {
                instance.location = location.clone();
            }
            return Ok(instance.clone());
        }
        let instance = Self::describe(context, delegate_type, method, location)?;
        log::debug!("delegate instance {} for {}", instance.class, key);
        instances.insert(key, instance.clone());
        Ok(instance)
    }

    /// The instance `get_or_create` would return, without recording it
    pub fn describe(
        context: &ConversionContext,
        delegate_type: &TypeRef,
        method: &MethodRef,
        location: &SourceLocation,
    ) -> Result<DelegateInstance, CompilerError> {
        let key = Self::key(delegate_type, method);
        let invoke = context
            .module
            .delegate_invoke(delegate_type)
            .ok_or_else(|| CompilerError::unsupported(location, format!("{} is not a delegate type", delegate_type)))?;
        let owner = context.names.class_reference(&method.owner).descriptor().to_string();
        let hash = hex::encode(Sha256::digest(key.as_bytes()));
        let hash = hash[..8].to_string();
        Ok(DelegateInstance {
            class: TypeRef::Descriptor(format!("{}{}{};", owner.trim_end_matches(';'), INSTANCE_MARKER, hash)),
            delegate_type: delegate_type.clone(),
            method: method.clone(),
            invoke_parameters: invoke.parameter_types(),
            invoke_return: invoke.return_type.clone(),
            location: location.clone(),
            hash,
        })
    }

    /// Records an instance made by `describe`
    pub fn register(&self, instance: DelegateInstance) {
        let key = Self::key(&instance.delegate_type, &instance.method);
        let mut instances = self.lock();
        match instances.get_mut(&key) {
            Some(existing) => {
                if precedes(&instance.location, &existing.location) {
                    existing.location = instance.location;
                }
            }
            None => {
                instances.insert(key, instance);
            }
        }
    }

    /// Every instance created so far, ordered by key
    pub fn instances(&self) -> Vec<DelegateInstance> {
        self.lock().values().cloned().collect()
    }
}

/// Known locations first, then document order. An instance requested from several methods keeps
/// the least location, so the result does not depend on which worker asked first.
fn precedes(a: &SourceLocation, b: &SourceLocation) -> bool {
    (!a.is_known(), &a.document, a.line, a.column) < (!b.is_known(), &b.document, b.line, b.column)
}

pub fn convert(context: &ConversionContext, mut block: AstBlock) -> Result<AstBlock, CompilerError> {
    block.walk_expressions_mut(&mut |expression| convert_expression(context, expression))?;
    Ok(block)
}

fn convert_expression(context: &ConversionContext, expression: &mut AstExpression) -> Result<(), CompilerError> {
    match expression.code {
        AstCode::DelegateNew => {
            let AstOperand::Delegate { delegate_type, method } = &expression.operand else {
                unreachable!("delegate creation carries its delegate type and method");
            };
            let instance = context.delegates.get_or_create(context, delegate_type, method, &expression.location)?;
            let arguments = std::mem::take(&mut expression.arguments);
            if arguments.len() != usize::from(instance.has_target()) {
                return Err(CompilerError::unsupported(&expression.location, "delegate target does not match its method"));
            }
            *expression = AstExpression::new(
                AstCode::Newobj,
                AstOperand::Method(instance.constructor()),
                arguments,
                expression.result_type.clone(),
                expression.location.clone(),
            );
        }
        AstCode::DelegateInvoke => {
            let delegate_type = match &expression.operand {
                AstOperand::Type(ty) => ty.clone(),
                _ => expression.arguments.first().map(|a| a.result_type.clone()).unwrap_or(TypeRef::Object),
            };
            let invoke = context
                .module
                .delegate_invoke(&delegate_type)
                .ok_or_else(|| CompilerError::unsupported(&expression.location, format!("{} is not a delegate type", delegate_type)))?;
            let method = MethodRef::new(delegate_type, "Invoke", invoke.parameter_types(), invoke.return_type.clone());
            expression.code = AstCode::Callvirt;
            expression.operand = AstOperand::Method(method);
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::pre_compilation::tests::{codes, module, source};
    use crate::model::NameConverter;

    const TYPES: &str = r#"{"name": "App", "scope": "app", "types": [
        {"namespace": "App", "name": "Handler", "kind": "delegate", "base": {"named": "System.MulticastDelegate"},
         "methods": [{"name": "Invoke", "parameters": [{"name": "x", "type": "i32"}], "return_type": "i32", "is_virtual": true, "is_abstract": true}]},
        {"namespace": "App", "name": "Program", "kind": "class",
         "methods": [{"name": "Twice", "parameters": [{"name": "x", "type": "i32"}], "return_type": "i32"}]}
    ]}"#;

    fn loc() -> SourceLocation {
        SourceLocation::new("Program.cs", 9, 13)
    }

    fn handler() -> TypeRef {
        TypeRef::named("App.Handler")
    }

    fn twice() -> MethodRef {
        MethodRef::new(TypeRef::named("App.Program"), "Twice", vec![TypeRef::I32], TypeRef::I32)
    }

    fn create() -> AstExpression {
        let operand = AstOperand::Delegate { delegate_type: handler(), method: twice() };
        let target = AstExpression::this(TypeRef::named("App.Program"), loc());
        AstExpression::new(AstCode::DelegateNew, operand, vec![target], handler(), loc())
    }

    #[test]
    fn test_creation_and_invocation() {
        let module = module(TYPES);
        let names = NameConverter::new(&module);
        let delegates = DelegateRegistry::new();
        let d = AstVariable::new("d", handler(), VariableKind::Local);
        let invoke = AstExpression::new(
            AstCode::DelegateInvoke,
            AstOperand::Type(handler()),
            vec![AstExpression::load(&d, loc()), AstExpression::int(3, TypeRef::I32, loc())],
            TypeRef::I32,
            loc(),
        );
        let block = AstBlock::new(vec![
            AstNode::Expression(AstExpression::store(&d, create(), loc())),
            AstNode::Expression(AstExpression::statement(AstCode::Ret, AstOperand::None, vec![invoke], loc())),
        ]);
        let source = source("App.Program", "Run", false, vec![], MethodOrigin::Ast(block.clone()));
        let context = ConversionContext::new(&module, &names, &source, &delegates);
        let block = convert(&context, block).unwrap();
        assert_eq!(
            codes(&block),
            vec![AstCode::Stloc, AstCode::Newobj, AstCode::Ldthis, AstCode::Ret, AstCode::Callvirt, AstCode::Ldloc, AstCode::LdcI4]
        );

        let instances = delegates.instances();
        assert_eq!(instances.len(), 1);
        let TypeRef::Descriptor(class) = &instances[0].class else { panic!() };
        assert!(class.starts_with("Lapp/Program$$Delegate$"), "{}", class);
        assert_eq!(class.len(), "Lapp/Program$$Delegate$".len() + 9);
        assert_eq!(instances[0].invoke_parameters, vec![TypeRef::I32]);
    }

    #[test]
    fn test_same_pair_shares_one_instance() {
        let module = module(TYPES);
        let names = NameConverter::new(&module);
        let delegates = DelegateRegistry::new();
        let block = AstBlock::new(vec![
            AstNode::Expression(AstExpression::statement(AstCode::Ret, AstOperand::None, vec![create()], loc())),
        ]);
        let source = source("App.Program", "Run", false, vec![], MethodOrigin::Ast(block.clone()));
        let context = ConversionContext::new(&module, &names, &source, &delegates);
        let first = convert(&context, block.clone()).unwrap();
        let second = convert(&context, block).unwrap();
        assert_eq!(first, second);
        assert_eq!(delegates.instances().len(), 1);
    }

    #[test]
    fn test_synthesized_bodies() {
        let module = module(TYPES);
        let names = NameConverter::new(&module);
        let delegates = DelegateRegistry::new();
        let block = AstBlock::default();
        let source = source("App.Program", "Run", false, vec![], MethodOrigin::Ast(block));
        let context = ConversionContext::new(&module, &names, &source, &delegates);
        let instance = delegates.get_or_create(&context, &handler(), &twice(), &loc()).unwrap();

        let constructor = instance.constructor_source();
        assert_eq!(constructor.parameters.len(), 1);
        let MethodOrigin::Ast(body) = &constructor.origin else { panic!() };
        assert_eq!(crate::backend::pre_compilation::tests::roots(body), vec![AstCode::Call, AstCode::Stfld, AstCode::Ret]);

        let invoke = instance.invoke_source();
        let MethodOrigin::Ast(body) = &invoke.origin else { panic!() };
        assert_eq!(codes(body), vec![AstCode::Ret, AstCode::Callvirt, AstCode::Ldfld, AstCode::Ldthis, AstCode::Ldloc]);
    }

    #[test]
    fn test_described_instances_match_created_ones() {
        let module = module(TYPES);
        let names = NameConverter::new(&module);
        let delegates = DelegateRegistry::new();
        let source = source("App.Program", "Run", false, vec![], MethodOrigin::Ast(AstBlock::default()));
        let context = ConversionContext::new(&module, &names, &source, &delegates);
        let described = DelegateRegistry::describe(&context, &handler(), &twice(), &loc()).unwrap();
        assert!(delegates.instances().is_empty());

        delegates.register(described.clone());
        let created = delegates.get_or_create(&context, &handler(), &twice(), &SourceLocation::new("Other.cs", 2, 1)).unwrap();
        assert_eq!(created.class, described.class);
        // "Other.cs" sorts after "Program.cs"
        assert_eq!(created.location, loc());
        delegates.register(DelegateRegistry::describe(&context, &handler(), &twice(), &SourceLocation::new("A.cs", 5, 1)).unwrap());
        assert_eq!(delegates.instances()[0].location.document, "A.cs");
        assert_eq!(delegates.instances().len(), 1);
        let TypeRef::Descriptor(class) = &created.class else { panic!() };
        assert!(class.ends_with(&format!("{};", created.hash)));
    }

    #[test]
    fn test_unknown_delegate_type_fails() {
        let module = module(TYPES);
        let names = NameConverter::new(&module);
        let delegates = DelegateRegistry::new();
        let source = source("App.Program", "Run", false, vec![], MethodOrigin::Ast(AstBlock::default()));
        let context = ConversionContext::new(&module, &names, &source, &delegates);
        assert!(delegates.get_or_create(&context, &TypeRef::named("App.Program"), &twice(), &loc()).is_err());
    }
}
