use crate::backend::pre_compilation::ConversionContext;
use crate::error::CompilerError;
use crate::model::{FieldDefinition, TypeDefinition, GENERIC_INSTANCE_FIELD, GENERIC_INSTANCE_PARAMETER};
use crate::trees::ast::{AstBlock, AstCode, AstExpression, AstNode, AstOperand, AstVariable, VariableKind};
use crate::trees::{FieldRef, MethodRef, SourceLocation, TypeRef};

/// Static fields named `<field>$fu` hold the atomic updater of `<field>`
pub const ATOMIC_UPDATER_POSTFIX: &str = "$fu";

const UPDATER_FACTORY: &str = "NewUpdater";

pub fn is_atomic_updater(field: &FieldDefinition) -> bool {
    field.is_static && field.name.len() > ATOMIC_UPDATER_POSTFIX.len() && field.name.ends_with(ATOMIC_UPDATER_POSTFIX)
}

/// Gives fields that need a non-null default their value when the constructor does not.
///
/// Static fields are initialized at the start of the static constructor, atomic updaters
/// first. Instance fields are initialized right after the first call to the base constructor,
/// unless the constructor delegates to another constructor of the same type.
pub struct FieldInitialization<'a> {
    context: &'a ConversionContext<'a>,
}

impl<'a> FieldInitialization<'a> {
    pub fn new(context: &'a ConversionContext<'a>) -> Self {
        FieldInitialization { context }
    }

    pub fn add_field_initialization(&self, mut block: AstBlock) -> Result<AstBlock, CompilerError> {
        let source = self.context.source;
        if !source.is_constructor() && !source.is_static_constructor() {
            return Ok(block);
        }
        let Some(definition) = self.context.module.definition(&source.declaring_type) else {
            return Ok(block);
        };
        let location = source.location.clone();
        let owner = definition.self_type();

        if source.is_static_constructor() {
            let mut initializers = Vec::new();
            for field in definition.fields.iter().filter(|f| is_atomic_updater(f)) {
                initializers.push(self.create_updater(definition, field, &location)?);
            }
            for field in self.fields_to_initialize(definition, true, &block) {
                let reference = FieldRef::new(owner.clone(), field.name.clone(), field.field_type.clone());
                let default = default_value(&field.field_type, &location);
                initializers.push(AstNode::Expression(AstExpression::statement(
                    AstCode::Stsfld,
                    AstOperand::Field(reference),
                    vec![default],
                    location.clone(),
                )));
            }
            block.body.splice(0..0, initializers);
            return Ok(block);
        }

        if self.calls_own_constructor(&block) {
            return Ok(block);
        }
        let this = || AstExpression::this(owner.clone(), location.clone());
        let mut initializers: Vec<AstNode> = Vec::new();
        if self.context.names.needs_generic_instance(&owner) {
            if let Some(index) = source.parameter_index(GENERIC_INSTANCE_PARAMETER) {
                let classes = TypeRef::array_of(TypeRef::named("System.Type"));
                let parameter = AstVariable::new(GENERIC_INSTANCE_PARAMETER, classes.clone(), VariableKind::Parameter(index));
                initializers.push(AstNode::Expression(AstExpression::statement(
                    AstCode::Stfld,
                    AstOperand::Field(FieldRef::new(owner.clone(), GENERIC_INSTANCE_FIELD, classes)),
                    vec![this(), AstExpression::load(&parameter, location.clone())],
                    location.clone(),
                )));
            }
        }
        for field in self.fields_to_initialize(definition, false, &block) {
            let reference = FieldRef::new(owner.clone(), field.name.clone(), field.field_type.clone());
            initializers.push(AstNode::Expression(AstExpression::statement(
                AstCode::Stfld,
                AstOperand::Field(reference),
                vec![this(), default_value(&field.field_type, &location)],
                location.clone(),
            )));
        }
        if initializers.is_empty() {
            return Ok(block);
        }
        let base = definition.base.as_ref().and_then(|b| b.type_name()).unwrap_or("System.Object");
        let is_base_call = |e: &AstExpression| {
            e.code == AstCode::Call
                && e.method()
                    .is_some_and(|m| m.is_constructor() && m.owner.type_name().unwrap_or("System.Object") == base)
        };
        if let Some(initializers) = insert_after_first(&mut block, &is_base_call, initializers) {
            block.body.splice(0..0, initializers);
        }
        Ok(block)
    }

    /// `field = FieldType.NewUpdater(typeof(Owner), [typeof(T),] "name")`
    ///
    /// The three-parameter factory also takes the class of the updated field, generic types by
    /// their definition.
    fn create_updater(&self, definition: &TypeDefinition, field: &FieldDefinition, location: &SourceLocation) -> Result<AstNode, CompilerError> {
        let unsupported = |message: String| CompilerError::UnsupportedConstruct {
            location: location.clone(),
            message,
        };
        let factory = self
            .context
            .module
            .definition(&field.field_type)
            .and_then(|updater| {
                updater
                    .methods
                    .iter()
                    .find(|m| m.name == UPDATER_FACTORY && m.is_static && matches!(m.parameters.len(), 2 | 3))
            })
            .ok_or_else(|| unsupported(format!("{} has no {} factory for {}", field.field_type, UPDATER_FACTORY, field.name)))?;
        let base_name = &field.name[..field.name.len() - ATOMIC_UPDATER_POSTFIX.len()];
        let type_of = |ty: TypeRef| AstExpression::new(AstCode::TypeOf, AstOperand::Type(ty), vec![], TypeRef::named("System.Type"), location.clone());

        let mut arguments = vec![type_of(definition.self_type())];
        if factory.parameters.len() == 3 {
            let updated = definition
                .field(base_name)
                .ok_or_else(|| unsupported(format!("atomic updater {} has no field {}", field.name, base_name)))?;
            let updated_type = match &updated.field_type {
                TypeRef::Generic(name, _) => TypeRef::Named(name.clone()),
                other => other.clone(),
            };
            arguments.push(type_of(updated_type));
        }
        arguments.push(AstExpression::new(
            AstCode::Ldstr,
            AstOperand::String(base_name.to_string()),
            vec![],
            TypeRef::String,
            location.clone(),
        ));

        let method = MethodRef::new_static(field.field_type.clone(), UPDATER_FACTORY, factory.parameter_types(), factory.return_type.clone());
        let create = AstExpression::new(AstCode::Call, AstOperand::Method(method), arguments, factory.return_type.clone(), location.clone());
        let reference = FieldRef::new(definition.self_type(), field.name.clone(), field.field_type.clone());
        Ok(AstNode::Expression(AstExpression::statement(
            AstCode::Stsfld,
            AstOperand::Field(reference),
            vec![create],
            location.clone(),
        )))
    }

    fn fields_to_initialize<'d>(&self, definition: &'d TypeDefinition, statics: bool, block: &AstBlock) -> Vec<&'d FieldDefinition> {
        let store = if statics { AstCode::Stsfld } else { AstCode::Stfld };
        let owner = definition.self_type();
        definition
            .fields
            .iter()
            .filter(|f| f.is_static == statics && f.constant.is_none())
            .filter(|f| self.context.module.is_enum(&f.field_type))
            .filter(|f| !is_initialized(block, store, &owner, &f.name))
            .collect()
    }

    fn calls_own_constructor(&self, block: &AstBlock) -> bool {
        let own = self.context.source.declaring_type.type_name();
        let mut found = false;
        block.for_each_expression(&mut |expression| {
            if expression.code == AstCode::Call {
                if let Some(method) = expression.method() {
                    found |= method.is_constructor() && method.owner.type_name() == own;
                }
            }
        });
        found
    }
}

/// Inserts `nodes` right after the first statement matching `predicate`, inside the block
/// holding that statement. Hands the nodes back when nothing matches.
fn insert_after_first(block: &mut AstBlock, predicate: &impl Fn(&AstExpression) -> bool, mut nodes: Vec<AstNode>) -> Option<Vec<AstNode>> {
    for index in 0..block.body.len() {
        if matches!(&block.body[index], AstNode::Expression(expression) if expression.any(predicate)) {
            block.body.splice(index + 1..index + 1, nodes);
            return None;
        }
        let nested: Vec<&mut AstBlock> = match &mut block.body[index] {
            AstNode::Expression(_) | AstNode::Label(_) => Vec::new(),
            AstNode::Block(inner) => vec![inner],
            AstNode::TryCatch(try_catch) => std::iter::once(&mut try_catch.try_block)
                .chain(try_catch.catches.iter_mut().map(|c| &mut c.body))
                .chain(try_catch.finally.as_mut())
                .collect(),
        };
        for inner in nested {
            nodes = insert_after_first(inner, predicate, nodes)?;
        }
    }
    Some(nodes)
}

fn is_initialized(block: &AstBlock, store: AstCode, owner: &TypeRef, name: &str) -> bool {
    let mut found = false;
    block.for_each_expression(&mut |expression| {
        found |= expression.code == store
            && expression.field().is_some_and(|f| f.name == name && f.owner.type_name() == owner.type_name());
    });
    found
}

fn default_value(ty: &TypeRef, location: &SourceLocation) -> AstExpression {
    AstExpression::new(AstCode::DefaultValue, AstOperand::Type(ty.clone()), vec![], ty.clone(), location.clone())
}
