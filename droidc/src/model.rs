//! The loaded source type system and the names its entities get inside the container.
//!
//! A [`CompilationUnit`] is one source input. All units of a build form a [`Module`], which
//! answers the type questions the converters ask. [`NameConverter`] is the renaming service
//! that decides every container descriptor and member name.
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use droid_shared::{ClassReference, FieldReference, MethodReference, PrimitiveType, Prototype, TypeReference};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::BuildError;
use crate::trees::ast::AstBlock;
use crate::trees::hir::ExpressionKind;
use crate::trees::{bytecode, hir, Constant, MethodRef, FieldRef, SourceLocation, TypeRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeKind {
    Class,
    Struct,
    Enum,
    Interface,
    Delegate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    #[default]
    Public,
    Protected,
    Internal,
    Private,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationArgument {
    pub name: String,
    pub value: Constant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationDefinition {
    /// Full name of the annotation type
    pub annotation_type: String,
    #[serde(default)]
    pub arguments: Vec<AnnotationArgument>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub name: String,
    #[serde(default)]
    pub scope_id: Option<String>,
    #[serde(rename = "type")]
    pub field_type: TypeRef,
    #[serde(default)]
    pub visibility: Visibility,
    #[serde(default)]
    pub is_static: bool,
    #[serde(default)]
    pub is_readonly: bool,
    /// Compile time value of a literal field
    #[serde(default)]
    pub constant: Option<Constant>,
    #[serde(default)]
    pub annotations: Vec<AnnotationDefinition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: TypeRef,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MethodBodySource {
    Hir(hir::Body),
    Bytecode(bytecode::Body),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodDefinition {
    pub name: String,
    #[serde(default)]
    pub scope_id: Option<String>,
    #[serde(default)]
    pub visibility: Visibility,
    #[serde(default)]
    pub is_static: bool,
    #[serde(default)]
    pub is_virtual: bool,
    #[serde(default)]
    pub is_abstract: bool,
    #[serde(default)]
    pub parameters: Vec<ParameterDefinition>,
    pub return_type: TypeRef,
    #[serde(default)]
    pub generic_parameters: Vec<String>,
    #[serde(default)]
    pub body: Option<MethodBodySource>,
    #[serde(default)]
    pub location: SourceLocation,
    #[serde(default)]
    pub annotations: Vec<AnnotationDefinition>,
}

impl MethodDefinition {
    pub fn is_constructor(&self) -> bool {
        self.name == ".ctor"
    }

    pub fn is_static_constructor(&self) -> bool {
        self.name == ".cctor"
    }

    pub fn parameter_types(&self) -> Vec<TypeRef> {
        self.parameters.iter().map(|p| p.ty.clone()).collect()
    }

    /// Where diagnostics about the method point when the input gave it no location
    pub fn source_location(&self, source_file: Option<&str>) -> SourceLocation {
        if self.location.is_known() {
            return self.location.clone();
        }
        let document = source_file.unwrap_or(&self.location.document);
        match &self.body {
            Some(MethodBodySource::Hir(body)) => {
                if let Some(location) = body.first_location() {
                    return location.clone();
                }
            }
            Some(MethodBodySource::Bytecode(body)) => {
                if let Some(entry) = body.lines.iter().min_by_key(|entry| entry.instruction) {
                    return SourceLocation::new(document, entry.line, 0);
                }
            }
            None => {}
        }
        match source_file {
            Some(file) => SourceLocation::new(file, 1, 0),
            None => self.location.clone(),
        }
    }

    /// Whether the body asks for the runtime class of one of `parameters`
    pub fn uses_type_parameters_reflectively(&self, parameters: &[String]) -> bool {
        let Some(MethodBodySource::Hir(body)) = &self.body else {
            return false;
        };
        let is_parameter = |ty: &TypeRef| matches!(ty, TypeRef::TypeParameter(name) if parameters.contains(name));
        body.any_expression(&|expression| match &expression.kind {
            ExpressionKind::TypeOf(ty) => is_parameter(ty),
            ExpressionKind::Is { target, .. } | ExpressionKind::As { target, .. } => is_parameter(target),
            _ => false,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeDefinition {
    #[serde(default)]
    pub namespace: String,
    /// Simple name, nested types separated with `/`
    pub name: String,
    #[serde(default)]
    pub scope_id: Option<String>,
    pub kind: TypeKind,
    #[serde(default)]
    pub base: Option<TypeRef>,
    #[serde(default)]
    pub interfaces: Vec<TypeRef>,
    #[serde(default)]
    pub generic_parameters: Vec<String>,
    #[serde(default)]
    pub fields: Vec<FieldDefinition>,
    #[serde(default)]
    pub methods: Vec<MethodDefinition>,
    #[serde(default)]
    pub annotations: Vec<AnnotationDefinition>,
    #[serde(default)]
    pub source_file: Option<String>,
    #[serde(default = "default_true")]
    pub is_public: bool,
    #[serde(default)]
    pub is_abstract: bool,
    #[serde(default)]
    pub is_sealed: bool,
}

fn default_true() -> bool {
    true
}

impl TypeDefinition {
    pub fn full_name(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.namespace, self.name)
        }
    }

    /// The type as seen from inside its own bodies
    pub fn self_type(&self) -> TypeRef {
        if self.generic_parameters.is_empty() {
            TypeRef::Named(self.full_name())
        } else {
            TypeRef::Generic(
                self.full_name(),
                self.generic_parameters.iter().cloned().map(TypeRef::TypeParameter).collect(),
            )
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldDefinition> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Static fields holding the members of an enum, with their values
    pub fn enum_constants(&self) -> Vec<(&FieldDefinition, i64)> {
        self.fields
            .iter()
            .filter(|f| f.is_static)
            .filter_map(|f| f.constant.as_ref().and_then(Constant::as_i64).map(|value| (f, value)))
            .collect()
    }

    /// Integral type backing an enum
    pub fn enum_underlying_type(&self) -> TypeRef {
        self.fields
            .iter()
            .find(|f| !f.is_static)
            .map(|f| f.field_type.clone())
            .unwrap_or(TypeRef::I32)
    }

    /// Whether instances carry the runtime classes of the type arguments
    pub fn needs_generic_instance(&self) -> bool {
        !self.generic_parameters.is_empty()
            && self
                .methods
                .iter()
                .filter(|m| !m.is_static)
                .any(|m| m.uses_type_parameters_reflectively(&self.generic_parameters))
    }

    pub fn find_method(&self, name: &str, parameters: &[TypeRef]) -> Option<&MethodDefinition> {
        self.methods
            .iter()
            .find(|m| m.name == name && m.parameter_types() == parameters)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompilationUnit {
    pub name: String,
    /// Stable identity of the input, unaffected by renames
    pub scope: String,
    pub types: Vec<TypeDefinition>,
}

impl CompilationUnit {
    pub fn from_json(text: &str) -> Result<CompilationUnit, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// One loaded source input together with its change detection data
#[derive(Debug, Clone)]
pub struct InputAssembly {
    pub path: PathBuf,
    pub unit: CompilationUnit,
    pub content_hash: String,
    pub timestamp: u64,
}

impl InputAssembly {
    pub fn load(path: &Path) -> Result<InputAssembly, BuildError> {
        let input_error = |message: String| BuildError::Input {
            path: path.to_path_buf(),
            message,
        };
        let bytes = std::fs::read(path).map_err(|e| input_error(e.to_string()))?;
        let text = std::str::from_utf8(&bytes).map_err(|e| input_error(e.to_string()))?;
        let unit = CompilationUnit::from_json(text).map_err(|e| input_error(e.to_string()))?;
        let timestamp = std::fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Ok(InputAssembly::new(path.to_path_buf(), unit, &bytes, timestamp))
    }

    pub fn new(path: PathBuf, unit: CompilationUnit, bytes: &[u8], timestamp: u64) -> InputAssembly {
        InputAssembly {
            path,
            unit,
            content_hash: hex::encode(Sha256::digest(bytes)),
            timestamp,
        }
    }

    pub fn name(&self) -> &str {
        &self.unit.name
    }
}

/// All types of a build, by full name
#[derive(Debug, Default)]
pub struct Module {
    units: Vec<CompilationUnit>,
    types: HashMap<String, (usize, usize)>,
}

impl Module {
    pub fn new(units: Vec<CompilationUnit>) -> Self {
        let mut types = HashMap::new();
        for (unit_index, unit) in units.iter().enumerate() {
            for (type_index, definition) in unit.types.iter().enumerate() {
                types.insert(definition.full_name(), (unit_index, type_index));
            }
        }
        Module { units, types }
    }

    pub fn units(&self) -> &[CompilationUnit] {
        &self.units
    }

    /// Every type with its unit, in input order
    pub fn all_types(&self) -> impl Iterator<Item = (&CompilationUnit, &TypeDefinition)> {
        self.units
            .iter()
            .flat_map(|unit| unit.types.iter().map(move |t| (unit, t)))
    }

    pub fn type_named(&self, name: &str) -> Option<&TypeDefinition> {
        let (unit, index) = self.types.get(name)?;
        self.units.get(*unit)?.types.get(*index)
    }

    pub fn unit_of(&self, name: &str) -> Option<&CompilationUnit> {
        let (unit, _) = self.types.get(name)?;
        self.units.get(*unit)
    }

    pub fn definition(&self, ty: &TypeRef) -> Option<&TypeDefinition> {
        self.type_named(ty.type_name()?)
    }

    fn kind_of(&self, ty: &TypeRef) -> Option<TypeKind> {
        self.definition(ty).map(|d| d.kind)
    }

    pub fn is_enum(&self, ty: &TypeRef) -> bool {
        self.kind_of(ty) == Some(TypeKind::Enum)
    }

    pub fn is_struct(&self, ty: &TypeRef) -> bool {
        self.kind_of(ty) == Some(TypeKind::Struct)
    }

    pub fn is_interface(&self, ty: &TypeRef) -> bool {
        self.kind_of(ty) == Some(TypeKind::Interface)
    }

    pub fn is_delegate(&self, ty: &TypeRef) -> bool {
        self.kind_of(ty) == Some(TypeKind::Delegate)
    }

    pub fn find_method(&self, method: &MethodRef) -> Option<&MethodDefinition> {
        self.definition(&method.owner)?
            .find_method(&method.name, &method.parameters)
    }

    pub fn find_field(&self, field: &FieldRef) -> Option<&FieldDefinition> {
        self.definition(&field.owner)?.field(&field.name)
    }

    pub fn is_private(&self, method: &MethodRef) -> bool {
        self.find_method(method)
            .is_some_and(|m| m.visibility == Visibility::Private)
    }

    pub fn needs_generic_instance(&self, ty: &TypeRef) -> bool {
        self.definition(ty).is_some_and(TypeDefinition::needs_generic_instance)
    }

    /// Whether calls to the method pass the runtime classes of its type arguments
    pub fn needs_generic_parameter(&self, method: &MethodRef) -> bool {
        self.find_method(method).is_some_and(|m| {
            !m.generic_parameters.is_empty() && m.uses_type_parameters_reflectively(&m.generic_parameters)
        })
    }

    /// The enum member holding `value`, if any
    pub fn enum_constant(&self, ty: &TypeRef, value: i64) -> Option<FieldRef> {
        let definition = self.definition(ty)?;
        definition
            .enum_constants()
            .into_iter()
            .find(|(_, v)| *v == value)
            .map(|(field, _)| FieldRef::new(ty.clone(), field.name.clone(), ty.clone()))
    }

    /// The abstract `Invoke` of a delegate type
    pub fn delegate_invoke(&self, ty: &TypeRef) -> Option<&MethodDefinition> {
        let definition = self.definition(ty)?;
        if definition.kind != TypeKind::Delegate {
            return None;
        }
        definition.methods.iter().find(|m| m.name == "Invoke")
    }
}

/// Where the tree of a method comes from
#[derive(Debug, Clone, PartialEq)]
pub enum MethodOrigin {
    Hir(hir::Body),
    Bytecode(bytecode::Body),
    /// A tree synthesized by the compiler itself
    Ast(AstBlock),
}

/// Everything the pipeline needs to know to compile one method
#[derive(Debug, Clone, PartialEq)]
pub struct MethodSource {
    pub declaring_type: TypeRef,
    pub name: String,
    pub is_static: bool,
    /// Declared parameters followed by any synthesized ones
    pub parameters: Vec<ParameterDefinition>,
    pub return_type: TypeRef,
    pub class_type_parameters: Vec<String>,
    pub method_type_parameters: Vec<String>,
    pub location: SourceLocation,
    pub origin: MethodOrigin,
}

/// Parameter carrying the classes of a generic type's arguments into its constructors
pub const GENERIC_INSTANCE_PARAMETER: &str = "$gi";
/// Parameter carrying the classes of a generic method's arguments
pub const GENERIC_METHOD_PARAMETER: &str = "$gm";
/// Field holding the classes of a generic instance's type arguments
pub const GENERIC_INSTANCE_FIELD: &str = "$g";

impl MethodSource {
    pub fn is_constructor(&self) -> bool {
        self.name == ".ctor"
    }

    pub fn is_static_constructor(&self) -> bool {
        self.name == ".cctor"
    }

    pub fn parameter_index(&self, name: &str) -> Option<u16> {
        self.parameters.iter().position(|p| p.name == name).map(|i| i as u16)
    }

    /// Human readable name used in diagnostics
    pub fn display_name(&self) -> String {
        format!("{}::{}", self.declaring_type, self.name)
    }
}

fn well_known(name: &str) -> Option<&'static str> {
    let descriptor = match name {
        "System.Object" | "System.ValueType" => "Ljava/lang/Object;",
        "System.String" => "Ljava/lang/String;",
        "System.Type" => "Ljava/lang/Class;",
        "System.Exception" => "Ljava/lang/Throwable;",
        "System.Enum" => "Ldroid/internal/Enum;",
        "System.Delegate" | "System.MulticastDelegate" => "Ldroid/internal/Delegate;",
        "System.Boolean" => "Ljava/lang/Boolean;",
        "System.SByte" | "System.Byte" => "Ljava/lang/Byte;",
        "System.Int16" => "Ljava/lang/Short;",
        "System.UInt16" | "System.Char" => "Ljava/lang/Character;",
        "System.Int32" | "System.UInt32" => "Ljava/lang/Integer;",
        "System.Int64" | "System.UInt64" => "Ljava/lang/Long;",
        "System.Single" => "Ljava/lang/Float;",
        "System.Double" => "Ljava/lang/Double;",
        _ => return None,
    };
    Some(descriptor)
}

pub const ENUM_BASE: &str = "Ldroid/internal/Enum;";
pub const DELEGATE_BASE: &str = "Ldroid/internal/Delegate;";

/// Descriptor of the class boxing a primitive type
pub fn boxed_descriptor(ty: &TypeRef) -> Option<&'static str> {
    let descriptor = match ty {
        TypeRef::Bool => "Ljava/lang/Boolean;",
        TypeRef::I8 | TypeRef::U8 => "Ljava/lang/Byte;",
        TypeRef::I16 => "Ljava/lang/Short;",
        TypeRef::U16 | TypeRef::Char => "Ljava/lang/Character;",
        TypeRef::I32 | TypeRef::U32 => "Ljava/lang/Integer;",
        TypeRef::I64 | TypeRef::U64 => "Ljava/lang/Long;",
        TypeRef::F32 => "Ljava/lang/Float;",
        TypeRef::F64 => "Ljava/lang/Double;",
        _ => return None,
    };
    Some(descriptor)
}

/// Converts a full type name to a class descriptor: `App.Ui.Outer/Inner`1` to `Lapp/ui/Outer$Inner;`
pub fn class_descriptor(full_name: &str) -> String {
    if let Some(descriptor) = well_known(full_name) {
        return descriptor.to_string();
    }
    let split = full_name.find('/').unwrap_or(full_name.len());
    let (namespace, simple) = match full_name[..split].rfind('.') {
        Some(dot) => (&full_name[..dot], &full_name[dot + 1..]),
        None => ("", full_name),
    };
    let simple = simple
        .split('/')
        .map(|part| part.split('`').next().unwrap_or(part))
        .collect::<Vec<_>>()
        .join("$");
    if namespace.is_empty() {
        format!("L{};", simple)
    } else {
        format!("L{}/{};", namespace.to_lowercase().replace('.', "/"), simple)
    }
}

pub fn member_name(name: &str) -> &str {
    match name {
        ".ctor" => "<init>",
        ".cctor" => "<clinit>",
        other => other,
    }
}

/// Maps source entities to container references.
///
/// Overloads that would collapse onto the same container signature get a `$n` suffix, decided
/// once per build in declaration order.
#[derive(Debug, Default)]
pub struct NameConverter {
    generic_instance_types: HashSet<String>,
    generic_parameter_methods: HashSet<(String, String, Vec<TypeRef>)>,
    renamed_methods: HashMap<(String, String, Vec<TypeRef>), String>,
}

impl NameConverter {
    pub fn new(module: &Module) -> Self {
        let mut converter = NameConverter::default();
        for (_, definition) in module.all_types() {
            let full_name = definition.full_name();
            if definition.needs_generic_instance() {
                converter.generic_instance_types.insert(full_name.clone());
            }
            for method in definition.methods.iter() {
                if !method.generic_parameters.is_empty()
                    && method.uses_type_parameters_reflectively(&method.generic_parameters)
                {
                    converter.generic_parameter_methods.insert((
                        full_name.clone(),
                        method.name.clone(),
                        method.parameter_types(),
                    ));
                }
            }
        }

        for (_, definition) in module.all_types() {
            let full_name = definition.full_name();
            let owner = definition.self_type();
            let mut taken: HashSet<(String, String)> = HashSet::new();
            for method in definition.methods.iter() {
                let reference = MethodRef {
                    owner: owner.clone(),
                    name: method.name.clone(),
                    parameters: method.parameter_types(),
                    return_type: method.return_type.clone(),
                    is_static: method.is_static,
                    generic_arguments: Vec::new(),
                };
                let prototype = converter.prototype(&reference).signature();
                let base = member_name(&method.name).to_string();
                let mut name = base.clone();
                let mut suffix = 1;
                while taken.contains(&(name.clone(), prototype.clone())) {
                    name = format!("{}${}", base, suffix);
                    suffix += 1;
                }
                taken.insert((name.clone(), prototype));
                if name != base {
                    converter
                        .renamed_methods
                        .insert((full_name.clone(), method.name.clone(), method.parameter_types()), name);
                }
            }
        }
        converter
    }

    pub fn type_reference(&self, ty: &TypeRef) -> TypeReference {
        let primitive = |p| TypeReference::Primitive(p);
        match ty {
            TypeRef::Void => primitive(PrimitiveType::Void),
            TypeRef::Bool => primitive(PrimitiveType::Boolean),
            TypeRef::I8 | TypeRef::U8 => primitive(PrimitiveType::Byte),
            TypeRef::I16 => primitive(PrimitiveType::Short),
            TypeRef::U16 | TypeRef::Char => primitive(PrimitiveType::Char),
            TypeRef::I32 | TypeRef::U32 => primitive(PrimitiveType::Int),
            TypeRef::I64 | TypeRef::U64 => primitive(PrimitiveType::Long),
            TypeRef::F32 => primitive(PrimitiveType::Float),
            TypeRef::F64 => primitive(PrimitiveType::Double),
            TypeRef::String => TypeReference::string(),
            TypeRef::Object | TypeRef::TypeParameter(_) => TypeReference::object(),
            TypeRef::Named(name) | TypeRef::Generic(name, _) => TypeReference::class(&class_descriptor(name)),
            // one-element arrays carry references across calls
            TypeRef::Array(element) | TypeRef::ByRef(element) => TypeReference::array_of(self.type_reference(element)),
            TypeRef::Nullable(inner) => match boxed_descriptor(inner) {
                Some(boxed) => TypeReference::class(boxed),
                None => self.type_reference(inner),
            },
            TypeRef::Descriptor(descriptor) => {
                TypeReference::parse(descriptor).unwrap_or_else(|| TypeReference::class(descriptor))
            }
        }
    }

    /// The class a type denotes, primitives standing for their boxes
    pub fn class_reference(&self, ty: &TypeRef) -> ClassReference {
        match self.type_reference(ty) {
            TypeReference::Class(class) => class,
            TypeReference::Array(element) => ClassReference::new(format!("[{}", element.descriptor())),
            TypeReference::Primitive(_) => ClassReference::new(boxed_descriptor(ty).unwrap_or("Ljava/lang/Object;")),
        }
    }

    pub fn field_reference(&self, field: &FieldRef) -> FieldReference {
        FieldReference::new(
            self.class_reference(&field.owner),
            field.name.clone(),
            self.type_reference(&field.field_type),
        )
    }

    fn owner_key(method: &MethodRef) -> Option<(String, String, Vec<TypeRef>)> {
        let owner = method.owner.type_name()?;
        Some((owner.to_string(), method.name.clone(), method.parameters.clone()))
    }

    pub fn needs_generic_instance(&self, ty: &TypeRef) -> bool {
        ty.type_name().is_some_and(|name| self.generic_instance_types.contains(name))
    }

    pub fn needs_generic_parameter(&self, method: &MethodRef) -> bool {
        NameConverter::owner_key(method).is_some_and(|key| self.generic_parameter_methods.contains(&key))
    }

    pub fn prototype(&self, method: &MethodRef) -> Prototype {
        let mut parameters: Vec<TypeReference> = method.parameters.iter().map(|p| self.type_reference(p)).collect();
        let extra = if method.is_constructor() {
            self.needs_generic_instance(&method.owner)
        } else {
            self.needs_generic_parameter(method)
        };
        if extra {
            parameters.push(TypeReference::array_of(TypeReference::class("Ljava/lang/Class;")));
        }
        Prototype::new(self.type_reference(&method.return_type), parameters)
    }

    pub fn method_name(&self, method: &MethodRef) -> String {
        NameConverter::owner_key(method)
            .and_then(|key| self.renamed_methods.get(&key).cloned())
            .unwrap_or_else(|| member_name(&method.name).to_string())
    }

    pub fn method_reference(&self, method: &MethodRef) -> MethodReference {
        MethodReference::new(
            self.class_reference(&method.owner),
            self.method_name(method),
            self.prototype(method),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn unit(json: &str) -> CompilationUnit {
        CompilationUnit::from_json(json).unwrap()
    }

    #[test]
    fn test_class_descriptors() {
        assert_eq!(class_descriptor("App.Ui.Outer/Inner`1"), "Lapp/ui/Outer$Inner;");
        assert_eq!(class_descriptor("Program"), "LProgram;");
        assert_eq!(class_descriptor("System.Exception"), "Ljava/lang/Throwable;");
        assert_eq!(class_descriptor("System.Collections.List`1"), "Lsystem/collections/List;");
    }

    #[test]
    fn test_method_location_falls_back_to_its_body() {
        let unit = unit(
            r#"{"name": "App", "scope": "app", "types": [{
                "namespace": "App", "name": "Program", "kind": "class", "source_file": "Program.cs",
                "methods": [
                    {"name": "Run", "is_static": true, "return_type": "void",
                     "body": {"hir": {"statements": [
                        {"kind": {"block": [{"kind": {"return": null}, "location": {"document": "Program.cs", "line": 7, "column": 9}}]}}
                     ]}}},
                    {"name": "Empty", "is_static": true, "return_type": "void", "body": {"hir": {"statements": []}}}
                ]}]}"#,
        );
        let definition = &unit.types[0];
        let run = definition.methods[0].source_location(definition.source_file.as_deref());
        assert_eq!((run.document.as_str(), run.line), ("Program.cs", 7));
        let empty = definition.methods[1].source_location(definition.source_file.as_deref());
        assert_eq!((empty.document.as_str(), empty.line), ("Program.cs", 1));
        assert!(!definition.methods[1].source_location(None).is_known());
    }

    #[test]
    fn test_type_references() {
        let names = NameConverter::default();
        assert_eq!(names.type_reference(&TypeRef::U8).descriptor(), "B");
        assert_eq!(names.type_reference(&TypeRef::nullable_of(TypeRef::I32)).descriptor(), "Ljava/lang/Integer;");
        assert_eq!(
            names.type_reference(&TypeRef::array_of(TypeRef::TypeParameter("T".into()))).descriptor(),
            "[Ljava/lang/Object;"
        );
        assert_eq!(names.type_reference(&TypeRef::Descriptor("[I".into())).descriptor(), "[I");
        assert_eq!(names.type_reference(&TypeRef::by_ref_of(TypeRef::I64)).descriptor(), "[J");
    }

    #[test]
    fn test_overloads_collapsing_onto_one_signature_are_renamed() {
        let module = Module::new(vec![unit(
            r#"{"name": "App", "scope": "app", "types": [{
                "namespace": "App", "name": "Math", "kind": "class",
                "methods": [
                    {"name": "Abs", "parameters": [{"name": "v", "type": "i32"}], "return_type": "i32", "is_static": true},
                    {"name": "Abs", "parameters": [{"name": "v", "type": "u32"}], "return_type": "i32", "is_static": true}
                ]}]}"#,
        )]);
        let names = NameConverter::new(&module);
        let owner = TypeRef::named("App.Math");
        let signed = MethodRef::new_static(owner.clone(), "Abs", vec![TypeRef::I32], TypeRef::I32);
        let unsigned = MethodRef::new_static(owner, "Abs", vec![TypeRef::U32], TypeRef::I32);
        assert_eq!(names.method_reference(&signed).name, "Abs");
        assert_eq!(names.method_reference(&unsigned).name, "Abs$1");
        assert_eq!(names.method_reference(&unsigned).prototype.signature(), "(I)I");
    }

    #[test]
    fn test_generic_instance_parameter() {
        let module = Module::new(vec![unit(
            r#"{"name": "App", "scope": "app", "types": [{
                "namespace": "App", "name": "Box`1", "kind": "class", "generic_parameters": ["T"],
                "methods": [
                    {"name": ".ctor", "return_type": "void", "body": {"hir": {"statements": []}}},
                    {"name": "Kind", "return_type": {"named": "System.Type"},
                     "body": {"hir": {"statements": [{"kind": {"return": {"kind": {"type_of": {"type_parameter": "T"}}, "type": {"named": "System.Type"}}}}]}}}
                ]}]}"#,
        )]);
        let names = NameConverter::new(&module);
        let owner = TypeRef::Generic("App.Box`1".into(), vec![TypeRef::I32]);
        assert!(module.needs_generic_instance(&owner));
        let constructor = MethodRef::new(owner, ".ctor", vec![], TypeRef::Void);
        let reference = names.method_reference(&constructor);
        assert_eq!(reference.name, "<init>");
        assert_eq!(reference.prototype.signature(), "([Ljava/lang/Class;)V");
        assert_eq!(reference.owner.descriptor(), "Lapp/Box;");
    }
}
