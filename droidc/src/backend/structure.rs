//! Class skeletons for every source type, and the list of bodies the workers compile.
//!
//! Besides the declared members, the skeletons carry everything the converters rely on at run
//! time: enum constants and their construction, the `$Clone` of value types, default
//! constructors, the generic instance field and the delegate type shape.
use droid_shared::dexfile::{
    AccessFlags, Annotation, AnnotationElement, AnnotationVisibility, ClassDefinition, DexFile, EncodedAnnotation,
    EncodedValue, FieldDefinition as DexField, MethodDefinition as DexMethod,
};
use droid_shared::mapfile::{DelegateEntry, FieldEntry, IdentityMap, MethodEntry, TypeEntry};
use droid_shared::{ClassReference, MethodReference, PrimitiveType, TypeReference};

use crate::backend::pre_compilation::delegates::DelegateInstance;
use crate::backend::pre_compilation::{is_atomic_updater, CLONE_METHOD};
use crate::error::CompilerError;
use crate::model::{
    class_descriptor, AnnotationDefinition, CompilationUnit, FieldDefinition, MethodBodySource, MethodDefinition,
    MethodOrigin, MethodSource, Module, NameConverter, ParameterDefinition, TypeDefinition, TypeKind, Visibility,
    DELEGATE_BASE, ENUM_BASE, GENERIC_INSTANCE_FIELD, GENERIC_INSTANCE_PARAMETER, GENERIC_METHOD_PARAMETER,
};
use crate::trees::ast::{AstBlock, AstCode, AstExpression, AstNode, AstOperand, AstVariable, VariableKind};
use crate::trees::{hir, Constant, FieldRef, MethodRef, SourceLocation, TypeRef};

/// Stable identity of a method across builds
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScopeKey {
    /// Name of the input declaring the method
    pub input: String,
    pub type_scope: String,
    pub method_scope: String,
}

/// One body to produce
#[derive(Debug, Clone)]
pub struct MethodJob {
    pub source: MethodSource,
    pub reference: MethodReference,
    pub key: ScopeKey,
}

#[derive(Debug)]
pub struct Structure {
    pub dex: DexFile,
    /// Types, fields and methods of this build; inputs are filled in by the driver
    pub map: IdentityMap,
    pub jobs: Vec<MethodJob>,
}

/// `"{input scope}:{type scope}"`, the type's full name standing in for a missing scope id
pub fn type_scope_key(unit: &CompilationUnit, definition: &TypeDefinition) -> String {
    let scope = definition.scope_id.clone().unwrap_or_else(|| definition.full_name());
    format!("{}:{}", unit.scope, scope)
}

pub fn method_scope_key(scope_id: Option<&String>, reference: &MethodReference) -> String {
    match scope_id {
        Some(scope) => scope.clone(),
        None => format!("{}{}", reference.name, reference.prototype.signature()),
    }
}

// Scope keys of synthesized members
const ENUM_CONSTRUCTOR_SCOPE: &str = "$enum.ctor";
const ENUM_INITIALIZER_SCOPE: &str = "$enum.cctor";
const CLONE_SCOPE: &str = "$clone";
const DEFAULT_CONSTRUCTOR_SCOPE: &str = "$ctor";
const STATIC_CONSTRUCTOR_SCOPE: &str = "$cctor";
const DELEGATE_INSTANCE_SCOPE: &str = "$delegate:";

fn class_array() -> TypeRef {
    TypeRef::array_of(TypeRef::named("System.Type"))
}

fn visibility_flags(visibility: Visibility) -> AccessFlags {
    match visibility {
        Visibility::Public => AccessFlags::PUBLIC,
        Visibility::Protected => AccessFlags::PROTECTED,
        Visibility::Internal => AccessFlags::empty(),
        Visibility::Private => AccessFlags::PRIVATE,
    }
}

fn class_access(definition: &TypeDefinition) -> AccessFlags {
    let mut access = if definition.is_public { AccessFlags::PUBLIC } else { AccessFlags::empty() };
    match definition.kind {
        TypeKind::Interface => access |= AccessFlags::INTERFACE | AccessFlags::ABSTRACT,
        TypeKind::Enum => access |= AccessFlags::ENUM | AccessFlags::FINAL,
        TypeKind::Struct => access |= AccessFlags::FINAL,
        TypeKind::Delegate => access |= AccessFlags::ABSTRACT,
        TypeKind::Class => {
            if definition.is_abstract {
                access |= AccessFlags::ABSTRACT;
            }
            if definition.is_sealed {
                access |= AccessFlags::FINAL;
            }
        }
    }
    access
}

/// A literal as the static value of a field of type `ty`
pub fn encoded_constant(constant: &Constant, ty: &TypeReference) -> Option<EncodedValue> {
    use PrimitiveType::*;
    if let Constant::String(value) = constant {
        return Some(EncodedValue::String(value.clone()));
    }
    if matches!(constant, Constant::Null) {
        return Some(EncodedValue::Null);
    }
    let value = match ty {
        TypeReference::Primitive(Float) => {
            let value = match constant {
                Constant::Float(value) => *value,
                Constant::Double(value) => *value as f32,
                other => other.as_i64()? as f32,
            };
            return Some(EncodedValue::Float(value.to_bits()));
        }
        TypeReference::Primitive(Double) => {
            let value = match constant {
                Constant::Float(value) => *value as f64,
                Constant::Double(value) => *value,
                other => other.as_i64()? as f64,
            };
            return Some(EncodedValue::Double(value.to_bits()));
        }
        _ => constant.as_i64()?,
    };
    let encoded = match ty {
        TypeReference::Primitive(Boolean) => EncodedValue::Boolean(value != 0),
        TypeReference::Primitive(Byte) => EncodedValue::Byte(value as i8),
        TypeReference::Primitive(Short) => EncodedValue::Short(value as i16),
        TypeReference::Primitive(Char) => EncodedValue::Char(value as u16),
        TypeReference::Primitive(Int) => EncodedValue::Int(value as i32),
        TypeReference::Primitive(Long) => EncodedValue::Long(value),
        _ => return None,
    };
    Some(encoded)
}

fn annotation(definition: &AnnotationDefinition) -> Annotation {
    let elements = definition
        .arguments
        .iter()
        .filter_map(|argument| {
            let natural = match argument.value.natural_type() {
                TypeRef::Bool => TypeReference::Primitive(PrimitiveType::Boolean),
                TypeRef::I64 => TypeReference::long(),
                TypeRef::F32 => TypeReference::Primitive(PrimitiveType::Float),
                TypeRef::F64 => TypeReference::Primitive(PrimitiveType::Double),
                TypeRef::Char => TypeReference::Primitive(PrimitiveType::Char),
                _ => TypeReference::int(),
            };
            let value = encoded_constant(&argument.value, &natural)?;
            Some(AnnotationElement {
                name: argument.name.clone(),
                value,
            })
        })
        .collect();
    Annotation {
        visibility: AnnotationVisibility::Runtime,
        annotation: EncodedAnnotation {
            annotation_type: TypeReference::class(&class_descriptor(&definition.annotation_type)),
            elements,
        },
    }
}

fn ret(location: &SourceLocation) -> AstNode {
    AstNode::Expression(AstExpression::statement(AstCode::Ret, AstOperand::None, vec![], location.clone()))
}

/// Builds the skeleton of every type in the module
pub struct StructureBuilder<'a> {
    module: &'a Module,
    names: &'a NameConverter,
    dex: DexFile,
    map: IdentityMap,
    jobs: Vec<MethodJob>,
}

/// What is being built for the type at hand
struct TypeScope<'d> {
    unit: &'d CompilationUnit,
    definition: &'d TypeDefinition,
    class: ClassDefinition,
    entry: TypeEntry,
    owner: TypeRef,
    location: SourceLocation,
}

impl TypeScope<'_> {
    fn key(&self, method_scope: String) -> ScopeKey {
        ScopeKey {
            input: self.unit.name.clone(),
            type_scope: self.entry.scope_key.clone(),
            method_scope,
        }
    }

    fn method_source(&self, name: &str, is_static: bool, parameters: Vec<ParameterDefinition>, return_type: TypeRef, origin: MethodOrigin) -> MethodSource {
        MethodSource {
            declaring_type: self.owner.clone(),
            name: name.to_string(),
            is_static,
            parameters,
            return_type,
            class_type_parameters: self.definition.generic_parameters.clone(),
            method_type_parameters: Vec::new(),
            location: self.location.clone(),
            origin,
        }
    }
}

impl<'a> StructureBuilder<'a> {
    pub fn new(module: &'a Module, names: &'a NameConverter, package: &str) -> Self {
        StructureBuilder {
            module,
            names,
            dex: DexFile::new(),
            map: IdentityMap::new(package),
            jobs: Vec::new(),
        }
    }

    pub fn build(mut self) -> Result<Structure, CompilerError> {
        let module = self.module;
        for (unit, definition) in module.all_types() {
            self.build_type(unit, definition)?;
        }
        log::debug!("structure: {} classes, {} bodies to produce", self.dex.classes.len(), self.jobs.len());
        Ok(Structure {
            dex: self.dex,
            map: self.map,
            jobs: self.jobs,
        })
    }

    fn build_type(&mut self, unit: &CompilationUnit, definition: &TypeDefinition) -> Result<(), CompilerError> {
        let owner = definition.self_type();
        let class_reference = self.names.class_reference(&owner);
        let superclass = match definition.kind {
            TypeKind::Enum => ClassReference::new(ENUM_BASE),
            TypeKind::Delegate => ClassReference::new(DELEGATE_BASE),
            TypeKind::Interface => ClassReference::object(),
            TypeKind::Class | TypeKind::Struct => definition
                .base
                .as_ref()
                .map(|base| self.names.class_reference(base))
                .unwrap_or_else(ClassReference::object),
        };
        let mut class = ClassDefinition::new(class_reference.clone(), class_access(definition), Some(superclass));
        class.interfaces = definition.interfaces.iter().map(|i| self.names.class_reference(i)).collect();
        class.source_file = definition.source_file.clone();
        class.annotations = definition.annotations.iter().map(annotation).collect();

        let mut scope = TypeScope {
            unit,
            definition,
            class,
            entry: TypeEntry {
                name: definition.full_name(),
                scope_key: type_scope_key(unit, definition),
                dex_name: class_reference.descriptor().to_string(),
                input: unit.name.clone(),
                fields: Vec::new(),
                methods: Vec::new(),
                delegate: None,
            },
            owner,
            location: SourceLocation::new(definition.source_file.clone().unwrap_or_default(), 0, 0),
        };

        self.add_fields(&mut scope);
        match definition.kind {
            TypeKind::Enum => self.add_enum_members(&mut scope)?,
            TypeKind::Delegate => self.add_delegate_members(&mut scope),
            TypeKind::Class | TypeKind::Struct | TypeKind::Interface => {
                for method in definition.methods.iter() {
                    self.add_declared_method(&mut scope, method);
                }
                if definition.kind == TypeKind::Struct {
                    self.add_struct_members(&mut scope);
                }
                self.add_static_constructor(&mut scope);
            }
        }

        log::trace!("{} -> {}", scope.entry.name, scope.entry.dex_name);
        self.dex.classes.push(scope.class);
        self.map.types.push(scope.entry);
        Ok(())
    }

    fn push_field(&self, scope: &mut TypeScope, field: DexField, name: &str, scope_key: String) {
        scope.entry.fields.push(FieldEntry {
            name: name.to_string(),
            scope_key,
            dex_name: field.reference.name.clone(),
            dex_type: field.reference.field_type.descriptor(),
        });
        scope.class.fields.push(field);
    }

    fn add_fields(&self, scope: &mut TypeScope) {
        let definition = scope.definition;
        let is_enum = definition.kind == TypeKind::Enum;
        for field in definition.fields.iter() {
            if is_enum && !field.is_static {
                // the underlying value lives in the enum base class
                continue;
            }
            let field_type = if is_enum { scope.owner.clone() } else { field.field_type.clone() };
            let reference = self.names.field_reference(&FieldRef::new(scope.owner.clone(), field.name.clone(), field_type));
            let mut access = visibility_flags(field.visibility);
            if field.is_static {
                access |= AccessFlags::STATIC;
            }
            if field.is_readonly || is_enum {
                access |= AccessFlags::FINAL;
            }
            if is_enum {
                access |= AccessFlags::ENUM;
            }
            let mut dex_field = DexField::new(reference, access);
            if field.is_static && !is_enum {
                dex_field.value = field
                    .constant
                    .as_ref()
                    .and_then(|constant| encoded_constant(constant, &dex_field.reference.field_type));
            }
            dex_field.annotations = field.annotations.iter().map(annotation).collect();
            let key = field.scope_id.clone().unwrap_or_else(|| field.name.clone());
            self.push_field(scope, dex_field, &field.name, key);
        }

        if self.names.needs_generic_instance(&scope.owner) {
            let reference = self.names.field_reference(&FieldRef::new(scope.owner.clone(), GENERIC_INSTANCE_FIELD, class_array()));
            let field = DexField::new(reference, AccessFlags::PROTECTED | AccessFlags::FINAL | AccessFlags::SYNTHETIC);
            self.push_field(scope, field, GENERIC_INSTANCE_FIELD, GENERIC_INSTANCE_FIELD.to_string());
        }
    }

    /// Adds the method to the class and the map, and queues its body if it has one
    fn push_method(&mut self, scope: &mut TypeScope, name: &str, method_scope: String, method: DexMethod, source: Option<MethodSource>) {
        scope.entry.methods.push(MethodEntry {
            name: name.to_string(),
            scope_key: method_scope.clone(),
            dex_name: method.reference.name.clone(),
            dex_signature: method.reference.prototype.signature(),
            positions: Vec::new(),
        });
        if let Some(source) = source {
            self.jobs.push(MethodJob {
                source,
                reference: method.reference.clone(),
                key: scope.key(method_scope),
            });
        }
        scope.class.methods.push(method);
    }

    fn method_ref(owner: &TypeRef, method: &MethodDefinition) -> MethodRef {
        MethodRef {
            owner: owner.clone(),
            name: method.name.clone(),
            parameters: method.parameter_types(),
            return_type: method.return_type.clone(),
            is_static: method.is_static,
            generic_arguments: Vec::new(),
        }
    }

    fn add_declared_method(&mut self, scope: &mut TypeScope, method: &MethodDefinition) {
        let method_ref = Self::method_ref(&scope.owner, method);
        let reference = self.names.method_reference(&method_ref);
        let is_interface = scope.definition.kind == TypeKind::Interface;

        let mut access = if method.is_static_constructor() {
            AccessFlags::STATIC | AccessFlags::CONSTRUCTOR
        } else if is_interface {
            AccessFlags::PUBLIC | AccessFlags::ABSTRACT
        } else {
            visibility_flags(method.visibility)
        };
        if method.is_constructor() {
            access |= AccessFlags::CONSTRUCTOR;
        }
        if method.is_static && !method.is_static_constructor() {
            access |= AccessFlags::STATIC;
        }
        if method.is_abstract {
            access |= AccessFlags::ABSTRACT;
        }

        let mut parameters = method.parameters.clone();
        let extra = if method.is_constructor() {
            self.names.needs_generic_instance(&scope.owner).then_some(GENERIC_INSTANCE_PARAMETER)
        } else {
            self.names.needs_generic_parameter(&method_ref).then_some(GENERIC_METHOD_PARAMETER)
        };
        if let Some(name) = extra {
            parameters.push(ParameterDefinition { name: name.to_string(), ty: class_array() });
        }

        let origin = match &method.body {
            Some(MethodBodySource::Hir(body)) => Some(MethodOrigin::Hir(body.clone())),
            Some(MethodBodySource::Bytecode(body)) => Some(MethodOrigin::Bytecode(body.clone())),
            None => None,
        };
        if origin.is_none() && !access.contains(AccessFlags::ABSTRACT) {
            access |= AccessFlags::NATIVE;
        }
        let source = origin.map(|origin| MethodSource {
            declaring_type: scope.owner.clone(),
            name: method.name.clone(),
            is_static: method.is_static || method.is_static_constructor(),
            parameters,
            return_type: method.return_type.clone(),
            class_type_parameters: scope.definition.generic_parameters.clone(),
            method_type_parameters: method.generic_parameters.clone(),
            location: method.source_location(scope.definition.source_file.as_deref()),
            origin,
        });

        let mut dex_method = DexMethod::new(reference, access);
        dex_method.annotations = method.annotations.iter().map(annotation).collect();
        let method_scope = method_scope_key(method.scope_id.as_ref(), &dex_method.reference);
        self.push_method(scope, &method.name, method_scope, dex_method, source);
    }

    /// A constructor calling the parameterless base constructor, fields initialized by the pipeline
    fn default_constructor(&self, scope: &TypeScope, base: TypeRef) -> MethodSource {
        let location = scope.location.clone();
        let this = hir::Expression::new(hir::ExpressionKind::This, scope.owner.clone(), location.clone());
        let call = hir::ExpressionKind::Call {
            method: MethodRef::new(base, ".ctor", vec![], TypeRef::Void),
            instance: Some(Box::new(this)),
            arguments: Vec::new(),
            virtual_call: false,
        };
        let statement = |kind| hir::Statement { kind, location: location.clone() };
        let body = hir::Body {
            locals: Vec::new(),
            statements: vec![
                statement(hir::StatementKind::Expression(hir::Expression::new(call, TypeRef::Void, location.clone()))),
                statement(hir::StatementKind::Return(None)),
            ],
        };
        let mut parameters = Vec::new();
        if self.names.needs_generic_instance(&scope.owner) {
            parameters.push(ParameterDefinition { name: GENERIC_INSTANCE_PARAMETER.to_string(), ty: class_array() });
        }
        scope.method_source(".ctor", false, parameters, TypeRef::Void, MethodOrigin::Hir(body))
    }

    fn add_synthesized(&mut self, scope: &mut TypeScope, method_scope: &str, access: AccessFlags, source: MethodSource) {
        let method_ref = MethodRef {
            owner: scope.owner.clone(),
            name: source.name.clone(),
            parameters: source
                .parameters
                .iter()
                .filter(|p| p.name != GENERIC_INSTANCE_PARAMETER)
                .map(|p| p.ty.clone())
                .collect(),
            return_type: source.return_type.clone(),
            is_static: source.is_static,
            generic_arguments: Vec::new(),
        };
        let reference = self.names.method_reference(&method_ref);
        let name = source.name.clone();
        self.push_method(scope, &name, method_scope.to_string(), DexMethod::new(reference, access), Some(source));
    }

    /// Value types get a parameterless constructor when they lack one, and `$Clone`
    fn add_struct_members(&mut self, scope: &mut TypeScope) {
        let definition = scope.definition;
        if definition.find_method(".ctor", &[]).is_none() {
            let base = definition.base.clone().unwrap_or(TypeRef::Object);
            let source = self.default_constructor(scope, base);
            self.add_synthesized(scope, DEFAULT_CONSTRUCTOR_SCOPE, AccessFlags::PUBLIC | AccessFlags::CONSTRUCTOR, source);
        }

        let location = scope.location.clone();
        let owner = scope.owner.clone();
        let copy = AstVariable::generated("$copy", owner.clone());
        let constructor = MethodRef::new(owner.clone(), ".ctor", vec![], TypeRef::Void);
        let mut body = vec![AstNode::Expression(AstExpression::store(
            &copy,
            AstExpression::new(AstCode::Newobj, AstOperand::Method(constructor), vec![], owner.clone(), location.clone()),
            location.clone(),
        ))];
        for field in definition.fields.iter().filter(|f| !f.is_static) {
            let reference = FieldRef::new(owner.clone(), field.name.clone(), field.field_type.clone());
            let value = AstExpression::new(
                AstCode::Ldfld,
                AstOperand::Field(reference.clone()),
                vec![AstExpression::this(owner.clone(), location.clone())],
                field.field_type.clone(),
                location.clone(),
            );
            body.push(AstNode::Expression(AstExpression::statement(
                AstCode::Stfld,
                AstOperand::Field(reference),
                vec![AstExpression::load(&copy, location.clone()), value],
                location.clone(),
            )));
        }
        body.push(AstNode::Expression(AstExpression::statement(
            AstCode::Ret,
            AstOperand::None,
            vec![AstExpression::load(&copy, location.clone())],
            location,
        )));
        let source = scope.method_source(CLONE_METHOD, false, Vec::new(), owner, MethodOrigin::Ast(AstBlock::new(body)));
        self.add_synthesized(scope, CLONE_SCOPE, AccessFlags::PUBLIC, source);
    }

    /// Constants are instances of the enum class created by the static constructor
    fn add_enum_members(&mut self, scope: &mut TypeScope) -> Result<(), CompilerError> {
        let definition = scope.definition;
        if let Some(method) = definition.methods.iter().find(|m| m.is_static_constructor()) {
            let location = method.source_location(definition.source_file.as_deref());
            return Err(CompilerError::unsupported(&location, format!("static constructor of enum {}", definition.full_name())));
        }
        for method in definition.methods.iter() {
            self.add_declared_method(scope, method);
        }

        let location = scope.location.clone();
        let owner = scope.owner.clone();
        let enum_base = TypeRef::Descriptor(ENUM_BASE.to_string());
        let constructor_parameters = vec![TypeRef::String, TypeRef::I64];

        let name = AstVariable::new("name", TypeRef::String, VariableKind::Parameter(0));
        let value = AstVariable::new("value", TypeRef::I64, VariableKind::Parameter(1));
        let base = MethodRef::new(enum_base, ".ctor", constructor_parameters.clone(), TypeRef::Void);
        let body = AstBlock::new(vec![
            AstNode::Expression(AstExpression::statement(
                AstCode::Call,
                AstOperand::Method(base),
                vec![
                    AstExpression::this(owner.clone(), location.clone()),
                    AstExpression::load(&name, location.clone()),
                    AstExpression::load(&value, location.clone()),
                ],
                location.clone(),
            )),
            ret(&location),
        ]);
        let parameters = vec![
            ParameterDefinition { name: name.name.clone(), ty: TypeRef::String },
            ParameterDefinition { name: value.name.clone(), ty: TypeRef::I64 },
        ];
        let source = scope.method_source(".ctor", false, parameters, TypeRef::Void, MethodOrigin::Ast(body));
        self.add_synthesized(scope, ENUM_CONSTRUCTOR_SCOPE, AccessFlags::PRIVATE | AccessFlags::CONSTRUCTOR, source);

        let constructor = MethodRef::new(owner.clone(), ".ctor", constructor_parameters, TypeRef::Void);
        let mut created: Vec<(i64, FieldRef)> = Vec::new();
        let mut body = Vec::new();
        for (field, value) in definition.enum_constants() {
            let reference = FieldRef::new(owner.clone(), field.name.clone(), owner.clone());
            let instance = match created.iter().find(|(v, _)| *v == value) {
                Some((_, existing)) => AstExpression::new(
                    AstCode::Ldsfld,
                    AstOperand::Field(existing.clone()),
                    vec![],
                    owner.clone(),
                    location.clone(),
                ),
                None => AstExpression::new(
                    AstCode::Newobj,
                    AstOperand::Method(constructor.clone()),
                    vec![
                        AstExpression::new(AstCode::Ldstr, AstOperand::String(field.name.clone()), vec![], TypeRef::String, location.clone()),
                        AstExpression::long(value, TypeRef::I64, location.clone()),
                    ],
                    owner.clone(),
                    location.clone(),
                ),
            };
            body.push(AstNode::Expression(AstExpression::statement(
                AstCode::Stsfld,
                AstOperand::Field(reference.clone()),
                vec![instance],
                location.clone(),
            )));
            created.push((value, reference));
        }
        body.push(ret(&location));
        let source = scope.method_source(".cctor", true, Vec::new(), TypeRef::Void, MethodOrigin::Ast(AstBlock::new(body)));
        self.add_synthesized(scope, ENUM_INITIALIZER_SCOPE, AccessFlags::STATIC | AccessFlags::CONSTRUCTOR, source);
        Ok(())
    }

    /// Delegate types keep only their `Invoke`, instances are subclasses made on demand
    fn add_delegate_members(&mut self, scope: &mut TypeScope) {
        let source = self.default_constructor(scope, TypeRef::Descriptor(DELEGATE_BASE.to_string()));
        self.add_synthesized(scope, DEFAULT_CONSTRUCTOR_SCOPE, AccessFlags::PROTECTED | AccessFlags::CONSTRUCTOR, source);
        let Some(invoke) = self.module.delegate_invoke(&scope.owner) else {
            return;
        };
        let reference = self.names.method_reference(&Self::method_ref(&scope.owner, invoke));
        let method = DexMethod::new(reference, AccessFlags::PUBLIC | AccessFlags::ABSTRACT);
        let method_scope = method_scope_key(invoke.scope_id.as_ref(), &method.reference);
        self.push_method(scope, &invoke.name, method_scope, method, None);
    }

    /// An empty static constructor when static fields need a non-null default and none is declared
    fn add_static_constructor(&mut self, scope: &mut TypeScope) {
        let definition = scope.definition;
        if definition.kind == TypeKind::Interface || definition.methods.iter().any(|m| m.is_static_constructor()) {
            return;
        }
        let needs_init = |field: &FieldDefinition| {
            is_atomic_updater(field) || (field.is_static && field.constant.is_none() && self.module.is_enum(&field.field_type))
        };
        if !definition.fields.iter().any(needs_init) {
            return;
        }
        let body = hir::Body {
            locals: Vec::new(),
            statements: vec![hir::Statement {
                kind: hir::StatementKind::Return(None),
                location: scope.location.clone(),
            }],
        };
        let source = scope.method_source(".cctor", true, Vec::new(), TypeRef::Void, MethodOrigin::Hir(body));
        self.add_synthesized(scope, STATIC_CONSTRUCTOR_SCOPE, AccessFlags::STATIC | AccessFlags::CONSTRUCTOR, source);
    }
}

/// The class of a delegate instance with its map entry, and the jobs producing its two bodies.
///
/// The instance belongs to the input declaring the delegate type, since its `Invoke` follows
/// that declaration.
pub fn delegate_instance_class(
    instance: &DelegateInstance,
    module: &Module,
    names: &NameConverter,
) -> (ClassDefinition, TypeEntry, Vec<MethodJob>) {
    let class = names.class_reference(&instance.class);
    let unit = module
        .definition(&instance.delegate_type)
        .and_then(|definition| module.unit_of(&definition.full_name()));
    let (input, input_scope) = unit.map(|unit| (unit.name.as_str(), unit.scope.as_str())).unwrap_or_default();
    let mut entry = TypeEntry {
        name: class.descriptor().to_string(),
        scope_key: format!("{}:{}{}", input_scope, DELEGATE_INSTANCE_SCOPE, instance.hash),
        dex_name: class.descriptor().to_string(),
        input: input.to_string(),
        fields: Vec::new(),
        methods: Vec::new(),
        delegate: Some(DelegateEntry {
            delegate_type: serde_json::to_value(&instance.delegate_type).unwrap_or_default(),
            method: serde_json::to_value(&instance.method).unwrap_or_default(),
        }),
    };
    let superclass = names.class_reference(&instance.delegate_type);
    let mut definition = ClassDefinition::new(class, AccessFlags::PUBLIC | AccessFlags::FINAL | AccessFlags::SYNTHETIC, Some(superclass));
    if let Some(field) = instance.target_field() {
        let field = DexField::new(names.field_reference(&field), AccessFlags::PRIVATE | AccessFlags::FINAL);
        entry.fields.push(FieldEntry {
            name: field.reference.name.clone(),
            scope_key: field.reference.name.clone(),
            dex_name: field.reference.name.clone(),
            dex_type: field.reference.field_type.descriptor(),
        });
        definition.fields.push(field);
    }

    let constructor = names.method_reference(&instance.constructor());
    let invoke = MethodRef::new(
        instance.class.clone(),
        "Invoke",
        instance.invoke_parameters.clone(),
        instance.invoke_return.clone(),
    );
    let invoke = names.method_reference(&invoke);
    let mut jobs = Vec::with_capacity(2);
    for (method_scope, reference, access, source) in [
        (DEFAULT_CONSTRUCTOR_SCOPE, constructor, AccessFlags::PUBLIC | AccessFlags::CONSTRUCTOR, instance.constructor_source()),
        ("Invoke", invoke, AccessFlags::PUBLIC | AccessFlags::FINAL, instance.invoke_source()),
    ] {
        entry.methods.push(MethodEntry {
            name: source.name.clone(),
            scope_key: method_scope.to_string(),
            dex_name: reference.name.clone(),
            dex_signature: reference.prototype.signature(),
            positions: Vec::new(),
        });
        definition.methods.push(DexMethod::new(reference.clone(), access));
        let key = ScopeKey {
            input: entry.input.clone(),
            type_scope: entry.scope_key.clone(),
            method_scope: method_scope.to_string(),
        };
        jobs.push(MethodJob { source, reference, key });
    }
    (definition, entry, jobs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::pre_compilation::tests::module;
    use crate::backend::pre_compilation::{ConversionContext, DelegateRegistry};

    const TYPES: &str = r#"{"name": "App", "scope": "app", "types": [
        {"namespace": "App", "name": "Color", "kind": "enum", "scope_id": "02000002",
         "fields": [
            {"name": "value__", "type": "i32"},
            {"name": "Red", "type": {"named": "App.Color"}, "is_static": true, "constant": {"int": 1}},
            {"name": "Green", "type": {"named": "App.Color"}, "is_static": true, "constant": {"int": 2}},
            {"name": "Crimson", "type": {"named": "App.Color"}, "is_static": true, "constant": {"int": 1}}
         ]},
        {"namespace": "App", "name": "Point", "kind": "struct", "scope_id": "02000003",
         "fields": [{"name": "X", "type": "i32"}, {"name": "Y", "type": "i32"}]},
        {"namespace": "App", "name": "Handler", "kind": "delegate",
         "methods": [
            {"name": ".ctor", "parameters": [{"name": "o", "type": "object"}, {"name": "m", "type": "i64"}], "return_type": "void"},
            {"name": "Invoke", "parameters": [{"name": "x", "type": "i32"}], "return_type": "i32", "is_virtual": true, "is_abstract": true}
         ]},
        {"namespace": "App", "name": "Program", "kind": "class", "scope_id": "02000005",
         "fields": [
            {"name": "Limit", "type": "i16", "is_static": true, "is_readonly": true, "constant": {"int": 300}},
            {"name": "Name", "type": "string", "is_static": true, "constant": {"string": "demo"}},
            {"name": "Favorite", "type": {"named": "App.Color"}, "is_static": true}
         ],
         "methods": [
            {"name": "Run", "scope_id": "06000001", "is_static": true, "return_type": "void", "body": {"hir": {"statements": []}}},
            {"name": "Twice", "parameters": [{"name": "x", "type": "i32"}], "return_type": "i32", "is_virtual": true,
             "body": {"hir": {"statements": []}}},
            {"name": "Native", "return_type": "void", "is_static": true}
         ]}
    ]}"#;

    fn structure() -> Structure {
        let module = module(TYPES);
        let names = NameConverter::new(&module);
        StructureBuilder::new(&module, &names, "app").build().unwrap()
    }

    fn class<'s>(structure: &'s Structure, descriptor: &str) -> &'s ClassDefinition {
        structure.dex.class(&ClassReference::new(descriptor)).unwrap()
    }

    #[test]
    fn test_enum_classes() {
        let structure = structure();
        let color = class(&structure, "Lapp/Color;");
        assert_eq!(color.superclass, Some(ClassReference::new(ENUM_BASE)));
        assert!(color.access.contains(AccessFlags::ENUM | AccessFlags::FINAL));
        assert!(color.field("value__").is_none());
        let red = color.field("Red").unwrap();
        assert!(red.access.contains(AccessFlags::STATIC | AccessFlags::ENUM));
        assert_eq!(red.reference.field_type.descriptor(), "Lapp/Color;");
        assert!(red.value.is_none());

        let signatures: Vec<String> = color
            .methods
            .iter()
            .map(|m| format!("{}{}", m.reference.name, m.reference.prototype.signature()))
            .collect();
        assert_eq!(signatures, vec!["<init>(Ljava/lang/String;J)V", "<clinit>()V"]);

        let initializer = structure.jobs.iter().find(|j| j.reference.name == "<clinit>" && j.reference.owner == color.class).unwrap();
        let MethodOrigin::Ast(body) = &initializer.source.origin else { panic!() };
        let mut created = 0;
        let mut reused = 0;
        body.for_each_expression(&mut |e| match e.code {
            AstCode::Newobj => created += 1,
            AstCode::Ldsfld => reused += 1,
            _ => {}
        });
        assert_eq!((created, reused), (2, 1));
    }

    #[test]
    fn test_struct_members() {
        let structure = structure();
        let point = class(&structure, "Lapp/Point;");
        assert!(point.access.contains(AccessFlags::FINAL));
        let names: Vec<&str> = point.methods.iter().map(|m| m.reference.name.as_str()).collect();
        assert_eq!(names, vec!["<init>", CLONE_METHOD]);
        let clone = structure.jobs.iter().find(|j| j.reference.name == CLONE_METHOD).unwrap();
        assert_eq!(clone.reference.prototype.signature(), "()Lapp/Point;");
        assert_eq!(clone.key.method_scope, CLONE_SCOPE);
        let MethodOrigin::Ast(body) = &clone.source.origin else { panic!() };
        let mut stores = 0;
        body.for_each_expression(&mut |e| stores += usize::from(e.code == AstCode::Stfld));
        assert_eq!(stores, 2);
    }

    #[test]
    fn test_delegate_types_are_abstract() {
        let structure = structure();
        let handler = class(&structure, "Lapp/Handler;");
        assert_eq!(handler.superclass, Some(ClassReference::new(DELEGATE_BASE)));
        assert!(handler.access.contains(AccessFlags::ABSTRACT));
        assert_eq!(handler.methods.len(), 2);
        let invoke = handler.methods.iter().find(|m| m.reference.name == "Invoke").unwrap();
        assert!(invoke.access.contains(AccessFlags::ABSTRACT));
        assert_eq!(invoke.reference.prototype.signature(), "(I)I");
        let constructor = handler.methods.iter().find(|m| m.reference.name == "<init>").unwrap();
        assert!(constructor.access.contains(AccessFlags::PROTECTED));
        assert_eq!(constructor.reference.prototype.signature(), "()V");
    }

    #[test]
    fn test_fields_and_declared_methods() {
        let structure = structure();
        let program = class(&structure, "Lapp/Program;");
        assert_eq!(program.field("Limit").unwrap().value, Some(EncodedValue::Short(300)));
        assert_eq!(program.field("Name").unwrap().value, Some(EncodedValue::String("demo".into())));
        assert_eq!(program.field("Favorite").unwrap().value, None);

        let native = program.methods.iter().find(|m| m.reference.name == "Native").unwrap();
        assert!(native.access.contains(AccessFlags::NATIVE | AccessFlags::STATIC));
        // Favorite needs a non-null default, so a static constructor is synthesized
        assert!(program.methods.iter().any(|m| m.reference.name == "<clinit>"));
        let queued: Vec<&str> = structure
            .jobs
            .iter()
            .filter(|j| j.reference.owner == program.class)
            .map(|j| j.reference.name.as_str())
            .collect();
        assert_eq!(queued, vec!["Run", "Twice", "<clinit>"]);
    }

    #[test]
    fn test_identity_map_entries() {
        let structure = structure();
        let program = structure.map.types.iter().find(|t| t.name == "App.Program").unwrap();
        assert_eq!(program.scope_key, "app:02000005");
        assert_eq!(program.dex_name, "Lapp/Program;");
        assert_eq!(program.input, "App");
        let run = program.methods.iter().find(|m| m.name == "Run").unwrap();
        assert_eq!(run.scope_key, "06000001");
        let twice = program.methods.iter().find(|m| m.name == "Twice").unwrap();
        assert_eq!(twice.scope_key, "Twice(I)I");
        assert_eq!(twice.dex_signature, "(I)I");
        let handler = structure.map.types.iter().find(|t| t.name == "App.Handler").unwrap();
        assert_eq!(handler.scope_key, "app:App.Handler");
        assert!(program.fields.iter().any(|f| f.dex_name == "Limit" && f.dex_type == "S"));
    }

    #[test]
    fn test_generic_instance_members() {
        let module = module(
            r#"{"name": "App", "scope": "app", "types": [{
                "namespace": "App", "name": "Box`1", "kind": "class", "generic_parameters": ["T"],
                "methods": [
                    {"name": ".ctor", "return_type": "void", "body": {"hir": {"statements": []}}},
                    {"name": "Kind", "return_type": {"named": "System.Type"},
                     "body": {"hir": {"statements": [{"kind": {"return": {"kind": {"type_of": {"type_parameter": "T"}}, "type": {"named": "System.Type"}}}}]}}}
                ]}]}"#,
        );
        let names = NameConverter::new(&module);
        let structure = StructureBuilder::new(&module, &names, "app").build().unwrap();
        let boxed = class(&structure, "Lapp/Box;");
        assert_eq!(boxed.field(GENERIC_INSTANCE_FIELD).unwrap().reference.field_type.descriptor(), "[Ljava/lang/Class;");
        let constructor = structure.jobs.iter().find(|j| j.reference.name == "<init>").unwrap();
        assert_eq!(constructor.reference.prototype.signature(), "([Ljava/lang/Class;)V");
        assert_eq!(constructor.source.parameters.last().unwrap().name, GENERIC_INSTANCE_PARAMETER);
    }

    #[test]
    fn test_delegate_instance_class() {
        let module = module(TYPES);
        let names = NameConverter::new(&module);
        let delegates = DelegateRegistry::new();
        let source = crate::backend::pre_compilation::tests::source("App.Program", "Run", true, vec![], MethodOrigin::Ast(AstBlock::default()));
        let context = ConversionContext::new(&module, &names, &source, &delegates);
        let twice = MethodRef::new(TypeRef::named("App.Program"), "Twice", vec![TypeRef::I32], TypeRef::I32);
        let instance = delegates
            .get_or_create(&context, &TypeRef::named("App.Handler"), &twice, &SourceLocation::new("Program.cs", 4, 1))
            .unwrap();
        let (class, entry, jobs) = delegate_instance_class(&instance, &module, &names);
        assert_eq!(class.superclass, Some(ClassReference::new("Lapp/Handler;")));
        assert_eq!(class.fields.len(), 1);
        assert_eq!(class.fields[0].reference.field_type.descriptor(), "Lapp/Program;");
        let signatures: Vec<String> = jobs.iter().map(|j| format!("{}{}", j.reference.name, j.reference.prototype.signature())).collect();
        assert_eq!(signatures, vec!["<init>(Lapp/Program;)V", "Invoke(I)I"]);

        assert_eq!(entry.dex_name, class.class.descriptor());
        assert_eq!(entry.scope_key, format!("app:$delegate:{}", instance.hash));
        assert_eq!(entry.input, "App");
        let delegate = entry.delegate.as_ref().unwrap();
        assert_eq!(serde_json::from_value::<TypeRef>(delegate.delegate_type.clone()).unwrap(), TypeRef::named("App.Handler"));
        assert_eq!(serde_json::from_value::<MethodRef>(delegate.method.clone()).unwrap(), twice);
        let keys: Vec<&str> = jobs.iter().map(|j| j.key.method_scope.as_str()).collect();
        assert_eq!(keys, vec![DEFAULT_CONSTRUCTOR_SCOPE, "Invoke"]);
        assert!(jobs.iter().all(|j| j.key.type_scope == entry.scope_key));
    }

    #[test]
    fn test_atomic_updater_gets_a_static_constructor() {
        let module = module(
            r#"{"name": "App", "scope": "app", "types": [
                {"namespace": "App", "name": "Counter", "kind": "class",
                 "fields": [{"name": "count", "type": "i32"},
                            {"name": "count$fu", "type": {"named": "App.IntUpdater"}, "is_static": true}]},
                {"namespace": "App", "name": "IntUpdater", "kind": "class",
                 "methods": [{"name": "NewUpdater", "is_static": true, "return_type": {"named": "App.IntUpdater"},
                              "parameters": [{"name": "owner", "type": {"named": "System.Type"}}, {"name": "name", "type": "string"}]}]}]}"#,
        );
        let names = NameConverter::new(&module);
        let structure = StructureBuilder::new(&module, &names, "app").build().unwrap();
        let counter = class(&structure, "Lapp/Counter;");
        assert!(counter.methods.iter().any(|m| m.reference.name == "<clinit>"));
        let updater = class(&structure, "Lapp/IntUpdater;");
        assert!(updater.methods.iter().all(|m| m.reference.name != "<clinit>"));
    }

    #[test]
    fn test_enum_static_constructor_is_rejected() {
        let module = module(
            r#"{"name": "App", "scope": "app", "types": [{
                "namespace": "App", "name": "Mode", "kind": "enum",
                "methods": [{"name": ".cctor", "is_static": true, "return_type": "void", "body": {"hir": {"statements": []}}}]}]}"#,
        );
        let names = NameConverter::new(&module);
        assert!(StructureBuilder::new(&module, &names, "app").build().is_err());
    }
}
