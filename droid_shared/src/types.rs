//! References to types, prototypes, fields and methods of the target runtime.
//!
//! Every reference is a plain value. Two references are the same entity when they are
//! equal, and each kind carries a total order used to lay out the pools of a container.
use std::cmp::Ordering;
use std::fmt;

use crate::PrimitiveType;

/// Ordinal comparison over UTF-16 code units, the order string pools are sorted in
pub fn compare_ordinal(a: &str, b: &str) -> Ordering {
    a.encode_utf16().cmp(b.encode_utf16())
}

/// A class or interface, identified by its descriptor (`Lpkg/Name;`)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClassReference {
    descriptor: String,
}

impl ClassReference {
    /// Creates a reference from a descriptor such as `Ljava/lang/Object;`
    pub fn new<S: Into<String>>(descriptor: S) -> ClassReference {
        ClassReference {
            descriptor: descriptor.into(),
        }
    }

    /// Creates a reference from a package (`java/lang` or `java.lang`) and a simple name
    pub fn from_parts(package: &str, name: &str) -> ClassReference {
        let package = package.replace('.', "/");
        if package.is_empty() {
            ClassReference::new(format!("L{};", name))
        } else {
            ClassReference::new(format!("L{}/{};", package, name))
        }
    }

    pub fn object() -> ClassReference {
        ClassReference::new("Ljava/lang/Object;")
    }

    pub fn string() -> ClassReference {
        ClassReference::new("Ljava/lang/String;")
    }

    pub fn class() -> ClassReference {
        ClassReference::new("Ljava/lang/Class;")
    }

    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    /// The package part with `/` separators, empty for the default package
    pub fn package(&self) -> &str {
        let inner = self.inner();
        match inner.rfind('/') {
            Some(index) => &inner[..index],
            None => "",
        }
    }

    pub fn simple_name(&self) -> &str {
        let inner = self.inner();
        match inner.rfind('/') {
            Some(index) => &inner[index + 1..],
            None => inner,
        }
    }

    /// The dotted name used by the runtime's reflection (`java.lang.Object`)
    pub fn java_name(&self) -> String {
        self.inner().replace('/', ".")
    }

    fn inner(&self) -> &str {
        self.descriptor
            .strip_prefix('L')
            .and_then(|d| d.strip_suffix(';'))
            .unwrap_or(&self.descriptor)
    }
}

impl Ord for ClassReference {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_ordinal(&self.descriptor, &other.descriptor)
    }
}

impl PartialOrd for ClassReference {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ClassReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.descriptor)
    }
}

/// Any type that can appear in a container
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeReference {
    Primitive(PrimitiveType),
    Class(ClassReference),
    Array(Box<TypeReference>),
}

impl TypeReference {
    pub fn void() -> TypeReference {
        TypeReference::Primitive(PrimitiveType::Void)
    }

    pub fn int() -> TypeReference {
        TypeReference::Primitive(PrimitiveType::Int)
    }

    pub fn boolean() -> TypeReference {
        TypeReference::Primitive(PrimitiveType::Boolean)
    }

    pub fn long() -> TypeReference {
        TypeReference::Primitive(PrimitiveType::Long)
    }

    pub fn object() -> TypeReference {
        TypeReference::Class(ClassReference::object())
    }

    pub fn string() -> TypeReference {
        TypeReference::Class(ClassReference::string())
    }

    pub fn class(descriptor: &str) -> TypeReference {
        TypeReference::Class(ClassReference::new(descriptor))
    }

    pub fn array_of(element: TypeReference) -> TypeReference {
        TypeReference::Array(Box::new(element))
    }

    /// Parses a full descriptor, rejecting trailing characters
    pub fn parse(descriptor: &str) -> Option<TypeReference> {
        let (ty, rest) = TypeReference::parse_prefix(descriptor)?;
        if rest.is_empty() {
            Some(ty)
        } else {
            None
        }
    }

    /// Parses one descriptor from the start of `descriptor` and returns the remainder
    pub fn parse_prefix(descriptor: &str) -> Option<(TypeReference, &str)> {
        let first = descriptor.chars().next()?;
        match first {
            '[' => {
                let (element, rest) = TypeReference::parse_prefix(&descriptor[1..])?;
                Some((TypeReference::array_of(element), rest))
            }
            'L' => {
                let end = descriptor.find(';')?;
                let class = ClassReference::new(&descriptor[..=end]);
                Some((TypeReference::Class(class), &descriptor[end + 1..]))
            }
            c => {
                let primitive = PrimitiveType::from_descriptor(c)?;
                Some((TypeReference::Primitive(primitive), &descriptor[1..]))
            }
        }
    }

    pub fn descriptor(&self) -> String {
        match self {
            TypeReference::Primitive(primitive) => primitive.descriptor().to_string(),
            TypeReference::Class(class) => class.descriptor().to_string(),
            TypeReference::Array(element) => format!("[{}", element.descriptor()),
        }
    }

    /// The character used for this type in a prototype's shorty
    pub fn shorty(&self) -> char {
        match self {
            TypeReference::Primitive(primitive) => primitive.descriptor(),
            _ => 'L',
        }
    }

    pub fn is_void(&self) -> bool {
        matches!(self, TypeReference::Primitive(PrimitiveType::Void))
    }

    pub fn is_wide(&self) -> bool {
        matches!(self, TypeReference::Primitive(p) if p.is_wide())
    }

    pub fn is_reference(&self) -> bool {
        !matches!(self, TypeReference::Primitive(_))
    }

    pub fn as_class(&self) -> Option<&ClassReference> {
        match self {
            TypeReference::Class(class) => Some(class),
            _ => None,
        }
    }

    pub fn element(&self) -> Option<&TypeReference> {
        match self {
            TypeReference::Array(element) => Some(element),
            _ => None,
        }
    }

    /// Number of registers a value of this type occupies
    pub fn register_width(&self) -> u16 {
        if self.is_void() {
            0
        } else if self.is_wide() {
            2
        } else {
            1
        }
    }
}

impl Ord for TypeReference {
    fn cmp(&self, other: &Self) -> Ordering {
        // Pools of type ids have to follow the order of their descriptor strings.
        compare_ordinal(&self.descriptor(), &other.descriptor())
    }
}

impl PartialOrd for TypeReference {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for TypeReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.descriptor())
    }
}

impl From<ClassReference> for TypeReference {
    fn from(class: ClassReference) -> Self {
        TypeReference::Class(class)
    }
}

impl From<PrimitiveType> for TypeReference {
    fn from(primitive: PrimitiveType) -> Self {
        TypeReference::Primitive(primitive)
    }
}

/// A method prototype: return type plus parameter types
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Prototype {
    pub return_type: TypeReference,
    pub parameters: Vec<TypeReference>,
}

impl Prototype {
    pub fn new(return_type: TypeReference, parameters: Vec<TypeReference>) -> Prototype {
        Prototype {
            return_type,
            parameters,
        }
    }

    pub fn shorty(&self) -> String {
        std::iter::once(&self.return_type)
            .chain(self.parameters.iter())
            .map(TypeReference::shorty)
            .collect()
    }

    /// The signature as written in the identity map, `(ILjava/lang/String;)V`
    pub fn signature(&self) -> String {
        let parameters: String = self.parameters.iter().map(|p| p.descriptor()).collect();
        format!("({}){}", parameters, self.return_type.descriptor())
    }

    pub fn parse_signature(signature: &str) -> Option<Prototype> {
        let mut rest = signature.strip_prefix('(')?;
        let mut parameters = Vec::new();
        while !rest.starts_with(')') {
            let (parameter, remainder) = TypeReference::parse_prefix(rest)?;
            parameters.push(parameter);
            rest = remainder;
        }
        let return_type = TypeReference::parse(&rest[1..])?;
        Some(Prototype::new(return_type, parameters))
    }

    /// Registers needed for the parameters, not counting `this`
    pub fn parameter_registers(&self) -> u16 {
        self.parameters.iter().map(TypeReference::register_width).sum()
    }
}

impl Ord for Prototype {
    fn cmp(&self, other: &Self) -> Ordering {
        // Vec's ordering puts the shorter list first on a common prefix.
        self.return_type
            .cmp(&other.return_type)
            .then_with(|| self.parameters.cmp(&other.parameters))
    }
}

impl PartialOrd for Prototype {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Prototype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.signature())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldReference {
    pub owner: ClassReference,
    pub name: String,
    pub field_type: TypeReference,
}

impl FieldReference {
    pub fn new<S: Into<String>>(owner: ClassReference, name: S, field_type: TypeReference) -> FieldReference {
        FieldReference {
            owner,
            name: name.into(),
            field_type,
        }
    }
}

impl Ord for FieldReference {
    fn cmp(&self, other: &Self) -> Ordering {
        self.owner
            .cmp(&other.owner)
            .then_with(|| compare_ordinal(&self.name, &other.name))
            .then_with(|| self.field_type.cmp(&other.field_type))
    }
}

impl PartialOrd for FieldReference {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for FieldReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}:{}", self.owner, self.name, self.field_type)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodReference {
    pub owner: ClassReference,
    pub name: String,
    pub prototype: Prototype,
}

impl MethodReference {
    pub fn new<S: Into<String>>(owner: ClassReference, name: S, prototype: Prototype) -> MethodReference {
        MethodReference {
            owner,
            name: name.into(),
            prototype,
        }
    }

    pub fn is_constructor(&self) -> bool {
        self.name == "<init>"
    }

    pub fn is_static_constructor(&self) -> bool {
        self.name == "<clinit>"
    }
}

impl Ord for MethodReference {
    fn cmp(&self, other: &Self) -> Ordering {
        self.owner
            .cmp(&other.owner)
            .then_with(|| compare_ordinal(&self.name, &other.name))
            .then_with(|| self.prototype.cmp(&other.prototype))
    }
}

impl PartialOrd for MethodReference {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for MethodReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}{}", self.owner, self.name, self.prototype)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn descriptor_strategy() -> impl Strategy<Value = TypeReference> {
        let leaf = prop_oneof![
            Just(TypeReference::int()),
            Just(TypeReference::long()),
            Just(TypeReference::boolean()),
            "[a-c]{1,2}(/[a-c]{1,2})?".prop_map(|name| TypeReference::class(&format!("L{};", name))),
        ];
        leaf.prop_recursive(2, 4, 1, |inner| inner.prop_map(TypeReference::array_of))
    }

    fn method_strategy() -> impl Strategy<Value = MethodReference> {
        (
            "[a-c]{1,2}",
            "[a-c<>]{1,3}",
            descriptor_strategy(),
            proptest::collection::vec(descriptor_strategy(), 0..3),
        )
            .prop_map(|(owner, name, ret, params)| {
                MethodReference::new(
                    ClassReference::new(format!("L{};", owner)),
                    name,
                    Prototype::new(ret, params),
                )
            })
    }

    #[test]
    fn test_parse_descriptors() {
        let ty = TypeReference::parse("[[Ljava/lang/String;").unwrap();
        assert_eq!(ty, TypeReference::array_of(TypeReference::array_of(TypeReference::string())));
        assert_eq!(ty.descriptor(), "[[Ljava/lang/String;");
        assert!(TypeReference::parse("Ljava/lang/String;I").is_none());
        assert!(TypeReference::parse("Q").is_none());

        let proto = Prototype::parse_signature("(IJLjava/lang/Object;)V").unwrap();
        assert_eq!(proto.shorty(), "VIJL");
        assert_eq!(proto.parameter_registers(), 4);
        assert_eq!(proto.signature(), "(IJLjava/lang/Object;)V");
    }

    #[test]
    fn test_class_parts() {
        let class = ClassReference::from_parts("droid.internal", "Enum");
        assert_eq!(class.descriptor(), "Ldroid/internal/Enum;");
        assert_eq!(class.package(), "droid/internal");
        assert_eq!(class.simple_name(), "Enum");
        assert_eq!(class.java_name(), "droid.internal.Enum");
    }

    #[test]
    fn test_shorter_parameter_list_first() {
        let short = Prototype::new(TypeReference::void(), vec![TypeReference::int()]);
        let long = Prototype::new(
            TypeReference::void(),
            vec![TypeReference::int(), TypeReference::int()],
        );
        assert_eq!(short.cmp(&long), Ordering::Less);
    }

    #[test]
    fn test_ordinal_uses_utf16_units() {
        // U+FF5E is a single unit larger than the surrogate pair of U+1F600.
        assert_eq!(compare_ordinal("\u{ff5e}", "\u{1f600}"), Ordering::Greater);
        assert_eq!(compare_ordinal("a", "b"), Ordering::Less);
    }

    proptest! {
        #[test]
        fn method_order_is_total(a in method_strategy(), b in method_strategy(), c in method_strategy()) {
            prop_assert_eq!(a.cmp(&b) == Ordering::Equal, a == b);
            prop_assert_eq!(a.cmp(&b), b.cmp(&a).reverse());
            if a <= b && b <= c {
                prop_assert!(a <= c);
            }
        }

        #[test]
        fn type_order_is_total(a in descriptor_strategy(), b in descriptor_strategy()) {
            prop_assert_eq!(a.cmp(&b) == Ordering::Equal, a == b);
            prop_assert_eq!(a.cmp(&b), b.cmp(&a).reverse());
        }
    }
}
