//! The unified tree every method body is converted into.
//!
//! Control flow is expressed with labels and branch expressions, structured only by blocks and
//! try/catch regions. Every stage after tree construction works on this form.
use std::fmt;

use super::{BinaryOperator, FieldRef, MethodRef, SourceLocation, TypeRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VariableKind {
    Local,
    /// Index into the declared parameters, `this` not counted
    Parameter(u16),
    /// Introduced by a tree builder or a converter
    Generated,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AstVariable {
    pub name: String,
    pub ty: TypeRef,
    pub kind: VariableKind,
}

impl AstVariable {
    pub fn new(name: impl Into<String>, ty: TypeRef, kind: VariableKind) -> Self {
        AstVariable {
            name: name.into(),
            ty,
            kind,
        }
    }

    pub fn generated(name: impl Into<String>, ty: TypeRef) -> Self {
        AstVariable::new(name, ty, VariableKind::Generated)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AstCode {
    Nop,
    Ldnull,
    LdcI4,
    LdcI8,
    LdcR4,
    LdcR8,
    Ldstr,
    TypeOf,
    DefaultValue,
    Ldloc,
    Stloc,
    Ldthis,
    Ldfld,
    Stfld,
    Ldsfld,
    Stsfld,
    Newarr,
    InitArray,
    Ldlen,
    Ldelem,
    Stelem,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    ShrUn,
    Neg,
    Not,
    Ceq,
    Cne,
    Clt,
    Cle,
    Cgt,
    Cge,
    LogicNot,
    LogicAnd,
    LogicOr,
    Conv,
    Box,
    Unbox,
    Call,
    Callvirt,
    Newobj,
    Castclass,
    Isinst,
    As,
    Br,
    Brtrue,
    Brfalse,
    Switch,
    Ret,
    Throw,
    /// `condition ? then : otherwise`
    Conditional,
    /// Evaluates every argument in order, the value is the last one
    Sequence,
    CompoundAssign,
    DelegateNew,
    DelegateInvoke,
    HasValue,
    GetValue,
    /// Reference to the location its argument loads from
    AddressOf,
    /// Like `AddressOf`, for a location the callee only writes
    OutAddressOf,
    /// Load through a reference
    Ldobj,
    /// Store through a reference: address, value
    Stobj,
}

impl AstCode {
    pub fn from_binary(operator: BinaryOperator) -> AstCode {
        match operator {
            BinaryOperator::Add => AstCode::Add,
            BinaryOperator::Sub => AstCode::Sub,
            BinaryOperator::Mul => AstCode::Mul,
            BinaryOperator::Div => AstCode::Div,
            BinaryOperator::Rem => AstCode::Rem,
            BinaryOperator::And => AstCode::And,
            BinaryOperator::Or => AstCode::Or,
            BinaryOperator::Xor => AstCode::Xor,
            BinaryOperator::Shl => AstCode::Shl,
            BinaryOperator::Shr => AstCode::Shr,
            BinaryOperator::ShrUn => AstCode::ShrUn,
        }
    }

    pub fn is_arithmetic(self) -> bool {
        matches!(
            self,
            AstCode::Add
                | AstCode::Sub
                | AstCode::Mul
                | AstCode::Div
                | AstCode::Rem
                | AstCode::And
                | AstCode::Or
                | AstCode::Xor
                | AstCode::Shl
                | AstCode::Shr
                | AstCode::ShrUn
        )
    }

    pub fn is_compare(self) -> bool {
        matches!(
            self,
            AstCode::Ceq | AstCode::Cne | AstCode::Clt | AstCode::Cle | AstCode::Cgt | AstCode::Cge
        )
    }

    /// The comparison that holds exactly when this one does not
    pub fn negate_compare(self) -> Option<AstCode> {
        let negated = match self {
            AstCode::Ceq => AstCode::Cne,
            AstCode::Cne => AstCode::Ceq,
            AstCode::Clt => AstCode::Cge,
            AstCode::Cge => AstCode::Clt,
            AstCode::Cgt => AstCode::Cle,
            AstCode::Cle => AstCode::Cgt,
            _ => return None,
        };
        Some(negated)
    }

    pub fn is_call(self) -> bool {
        matches!(self, AstCode::Call | AstCode::Callvirt | AstCode::Newobj)
    }

    pub fn is_branch(self) -> bool {
        matches!(self, AstCode::Br | AstCode::Brtrue | AstCode::Brfalse | AstCode::Switch)
    }

    /// Loads that read a storage location without any other effect
    pub fn is_load(self) -> bool {
        matches!(
            self,
            AstCode::Ldloc | AstCode::Ldthis | AstCode::Ldfld | AstCode::Ldsfld | AstCode::Ldelem
        )
    }

    /// Control does not continue after the expression
    pub fn ends_flow(self) -> bool {
        matches!(self, AstCode::Br | AstCode::Ret | AstCode::Throw)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AstOperand {
    None,
    Int(i32),
    Long(i64),
    /// Bit pattern of a float literal
    Float(u32),
    /// Bit pattern of a double literal
    Double(u64),
    String(String),
    Type(TypeRef),
    Field(FieldRef),
    Method(MethodRef),
    Variable(AstVariable),
    Label(String),
    Switch { first_key: i32, labels: Vec<String> },
    Operator(BinaryOperator),
    Delegate { delegate_type: TypeRef, method: MethodRef },
}

#[derive(Debug, Clone, PartialEq)]
pub struct AstExpression {
    pub code: AstCode,
    pub operand: AstOperand,
    pub arguments: Vec<AstExpression>,
    pub result_type: TypeRef,
    pub location: SourceLocation,
}

impl AstExpression {
    pub fn new(
        code: AstCode,
        operand: AstOperand,
        arguments: Vec<AstExpression>,
        result_type: TypeRef,
        location: SourceLocation,
    ) -> Self {
        AstExpression {
            code,
            operand,
            arguments,
            result_type,
            location,
        }
    }

    /// An expression evaluated for its effect only
    pub fn statement(code: AstCode, operand: AstOperand, arguments: Vec<AstExpression>, location: SourceLocation) -> Self {
        AstExpression::new(code, operand, arguments, TypeRef::Void, location)
    }

    pub fn int(value: i32, ty: TypeRef, location: SourceLocation) -> Self {
        AstExpression::new(AstCode::LdcI4, AstOperand::Int(value), vec![], ty, location)
    }

    pub fn long(value: i64, ty: TypeRef, location: SourceLocation) -> Self {
        AstExpression::new(AstCode::LdcI8, AstOperand::Long(value), vec![], ty, location)
    }

    pub fn null(ty: TypeRef, location: SourceLocation) -> Self {
        AstExpression::new(AstCode::Ldnull, AstOperand::None, vec![], ty, location)
    }

    pub fn this(ty: TypeRef, location: SourceLocation) -> Self {
        AstExpression::new(AstCode::Ldthis, AstOperand::None, vec![], ty, location)
    }

    pub fn load(variable: &AstVariable, location: SourceLocation) -> Self {
        AstExpression::new(
            AstCode::Ldloc,
            AstOperand::Variable(variable.clone()),
            vec![],
            variable.ty.clone(),
            location,
        )
    }

    pub fn store(variable: &AstVariable, value: AstExpression, location: SourceLocation) -> Self {
        AstExpression::statement(AstCode::Stloc, AstOperand::Variable(variable.clone()), vec![value], location)
    }

    pub fn label_branch(code: AstCode, label: impl Into<String>, arguments: Vec<AstExpression>, location: SourceLocation) -> Self {
        AstExpression::statement(code, AstOperand::Label(label.into()), arguments, location)
    }

    pub fn with_type(mut self, ty: TypeRef) -> Self {
        self.result_type = ty;
        self
    }

    pub fn variable(&self) -> Option<&AstVariable> {
        match &self.operand {
            AstOperand::Variable(variable) => Some(variable),
            _ => None,
        }
    }

    pub fn method(&self) -> Option<&MethodRef> {
        match &self.operand {
            AstOperand::Method(method) => Some(method),
            _ => None,
        }
    }

    pub fn field(&self) -> Option<&FieldRef> {
        match &self.operand {
            AstOperand::Field(field) => Some(field),
            _ => None,
        }
    }

    pub fn type_operand(&self) -> Option<&TypeRef> {
        match &self.operand {
            AstOperand::Type(ty) => Some(ty),
            _ => None,
        }
    }

    pub fn is_load_of(&self, variable: &str) -> bool {
        self.code == AstCode::Ldloc && self.variable().is_some_and(|v| v.name == variable)
    }

    /// Labels this expression may jump to
    pub fn label_targets(&self) -> Vec<&str> {
        match (&self.code, &self.operand) {
            (AstCode::Br | AstCode::Brtrue | AstCode::Brfalse, AstOperand::Label(label)) => vec![label.as_str()],
            (AstCode::Switch, AstOperand::Switch { labels, .. }) => labels.iter().map(String::as_str).collect(),
            _ => Vec::new(),
        }
    }

    /// Whether evaluating the expression can neither throw nor change any state
    pub fn is_pure(&self) -> bool {
        match self.code {
            AstCode::Ldnull
            | AstCode::LdcI4
            | AstCode::LdcI8
            | AstCode::LdcR4
            | AstCode::LdcR8
            | AstCode::Ldstr
            | AstCode::Ldloc
            | AstCode::Ldthis
            | AstCode::TypeOf => true,
            _ => false,
        }
    }

    /// Visits the expression tree, children before their parent
    pub fn walk_mut<E>(&mut self, f: &mut impl FnMut(&mut AstExpression) -> Result<(), E>) -> Result<(), E> {
        for argument in self.arguments.iter_mut() {
            argument.walk_mut(f)?;
        }
        f(self)
    }

    /// Visits the expression tree, parents before their children
    pub fn walk<'a>(&'a self, f: &mut impl FnMut(&'a AstExpression)) {
        f(self);
        for argument in self.arguments.iter() {
            argument.walk(f);
        }
    }

    pub fn any(&self, predicate: &impl Fn(&AstExpression) -> bool) -> bool {
        predicate(self) || self.arguments.iter().any(|a| a.any(predicate))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AstCatch {
    /// `None` catches everything
    pub exception_type: Option<TypeRef>,
    pub variable: Option<AstVariable>,
    pub body: AstBlock,
    pub location: SourceLocation,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AstTryCatch {
    pub try_block: AstBlock,
    pub catches: Vec<AstCatch>,
    pub finally: Option<AstBlock>,
    pub location: SourceLocation,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AstNode {
    Expression(AstExpression),
    Label(String),
    Block(AstBlock),
    TryCatch(AstTryCatch),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct AstBlock {
    pub body: Vec<AstNode>,
}

impl AstBlock {
    pub fn new(body: Vec<AstNode>) -> Self {
        AstBlock { body }
    }

    /// Calls `f` on every root expression, in tree order
    pub fn for_each_root<'a>(&'a self, f: &mut impl FnMut(&'a AstExpression)) {
        for node in self.body.iter() {
            match node {
                AstNode::Expression(expression) => f(expression),
                AstNode::Label(_) => {}
                AstNode::Block(block) => block.for_each_root(f),
                AstNode::TryCatch(try_catch) => {
                    try_catch.try_block.for_each_root(f);
                    for catch in try_catch.catches.iter() {
                        catch.body.for_each_root(f);
                    }
                    if let Some(finally) = &try_catch.finally {
                        finally.for_each_root(f);
                    }
                }
            }
        }
    }

    /// Calls `f` on every expression of the block, parents before children
    pub fn for_each_expression<'a>(&'a self, f: &mut impl FnMut(&'a AstExpression)) {
        self.for_each_root(&mut |root| root.walk(f));
    }

    /// Mutable visit of every expression, children before parents
    pub fn walk_expressions_mut<E>(
        &mut self,
        f: &mut impl FnMut(&mut AstExpression) -> Result<(), E>,
    ) -> Result<(), E> {
        for node in self.body.iter_mut() {
            match node {
                AstNode::Expression(expression) => expression.walk_mut(f)?,
                AstNode::Label(_) => {}
                AstNode::Block(block) => block.walk_expressions_mut(f)?,
                AstNode::TryCatch(try_catch) => {
                    try_catch.try_block.walk_expressions_mut(f)?;
                    for catch in try_catch.catches.iter_mut() {
                        catch.body.walk_expressions_mut(f)?;
                    }
                    if let Some(finally) = try_catch.finally.as_mut() {
                        finally.walk_expressions_mut(f)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Replaces every root expression node with the nodes `f` returns for it
    pub fn rewrite_roots<E>(
        &mut self,
        f: &mut impl FnMut(AstExpression) -> Result<Vec<AstNode>, E>,
    ) -> Result<(), E> {
        let nodes = std::mem::take(&mut self.body);
        let mut rewritten = Vec::with_capacity(nodes.len());
        for node in nodes {
            match node {
                AstNode::Expression(expression) => rewritten.extend(f(expression)?),
                AstNode::Block(mut block) => {
                    block.rewrite_roots(f)?;
                    rewritten.push(AstNode::Block(block));
                }
                AstNode::TryCatch(mut try_catch) => {
                    try_catch.try_block.rewrite_roots(f)?;
                    for catch in try_catch.catches.iter_mut() {
                        catch.body.rewrite_roots(f)?;
                    }
                    if let Some(finally) = try_catch.finally.as_mut() {
                        finally.rewrite_roots(f)?;
                    }
                    rewritten.push(AstNode::TryCatch(try_catch));
                }
                label @ AstNode::Label(_) => rewritten.push(label),
            }
        }
        self.body = rewritten;
        Ok(())
    }

    /// Every label some branch in the block refers to
    pub fn referenced_labels(&self) -> Vec<String> {
        let mut labels = Vec::new();
        self.for_each_expression(&mut |expression| {
            for label in expression.label_targets() {
                if !labels.iter().any(|l: &String| l == label) {
                    labels.push(label.to_string());
                }
            }
        });
        labels
    }

    /// Every variable loaded or stored in the block, in order of first appearance
    pub fn variables(&self) -> Vec<AstVariable> {
        let mut variables: Vec<AstVariable> = Vec::new();
        let mut add = |variable: &AstVariable| {
            if !variables.iter().any(|v| v.name == variable.name) {
                variables.push(variable.clone());
            }
        };
        self.visit_nodes(&mut |node| match node {
            AstNode::Expression(root) => root.walk(&mut |expression| {
                if let Some(variable) = expression.variable() {
                    add(variable);
                }
            }),
            AstNode::TryCatch(try_catch) => {
                for catch in try_catch.catches.iter() {
                    if let Some(variable) = &catch.variable {
                        add(variable);
                    }
                }
            }
            _ => {}
        });
        variables
    }

    /// Visits every node, nested ones included, in tree order
    pub fn visit_nodes<'a>(&'a self, f: &mut impl FnMut(&'a AstNode)) {
        for node in self.body.iter() {
            f(node);
            match node {
                AstNode::Block(block) => block.visit_nodes(f),
                AstNode::TryCatch(try_catch) => {
                    try_catch.try_block.visit_nodes(f);
                    for catch in try_catch.catches.iter() {
                        catch.body.visit_nodes(f);
                    }
                    if let Some(finally) = &try_catch.finally {
                        finally.visit_nodes(f);
                    }
                }
                _ => {}
            }
        }
    }
}

fn write_expression(f: &mut fmt::Formatter<'_>, expression: &AstExpression) -> fmt::Result {
    write!(f, "{:?}", expression.code)?;
    match &expression.operand {
        AstOperand::None => {}
        AstOperand::Int(value) => write!(f, " {}", value)?,
        AstOperand::Long(value) => write!(f, " {}L", value)?,
        AstOperand::Float(bits) => write!(f, " {}f", f32::from_bits(*bits))?,
        AstOperand::Double(bits) => write!(f, " {}d", f64::from_bits(*bits))?,
        AstOperand::String(value) => write!(f, " {:?}", value)?,
        AstOperand::Type(ty) => write!(f, " {}", ty)?,
        AstOperand::Field(field) => write!(f, " {}", field)?,
        AstOperand::Method(method) => write!(f, " {}", method)?,
        AstOperand::Variable(variable) => write!(f, " {}", variable.name)?,
        AstOperand::Label(label) => write!(f, " {}", label)?,
        AstOperand::Switch { first_key, labels } => write!(f, " {} [{}]", first_key, labels.join(", "))?,
        AstOperand::Operator(operator) => write!(f, " {:?}", operator)?,
        AstOperand::Delegate { delegate_type, method } => write!(f, " {} -> {}", delegate_type, method)?,
    }
    if !expression.arguments.is_empty() {
        write!(f, "(")?;
        for (i, argument) in expression.arguments.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write_expression(f, argument)?;
        }
        write!(f, ")")?;
    }
    Ok(())
}

fn write_block(f: &mut fmt::Formatter<'_>, block: &AstBlock, depth: usize) -> fmt::Result {
    let indent = "  ".repeat(depth);
    for node in block.body.iter() {
        match node {
            AstNode::Expression(expression) => {
                write!(f, "{}", indent)?;
                write_expression(f, expression)?;
                writeln!(f)?;
            }
            AstNode::Label(label) => writeln!(f, "{}{}:", indent, label)?,
            AstNode::Block(inner) => {
                writeln!(f, "{}{{", indent)?;
                write_block(f, inner, depth + 1)?;
                writeln!(f, "{}}}", indent)?;
            }
            AstNode::TryCatch(try_catch) => {
                writeln!(f, "{}try {{", indent)?;
                write_block(f, &try_catch.try_block, depth + 1)?;
                for catch in try_catch.catches.iter() {
                    let ty = catch.exception_type.as_ref().map(|t| t.to_string()).unwrap_or_default();
                    let name = catch.variable.as_ref().map(|v| v.name.as_str()).unwrap_or("_");
                    writeln!(f, "{}}} catch {} {} {{", indent, ty, name)?;
                    write_block(f, &catch.body, depth + 1)?;
                }
                if let Some(finally) = &try_catch.finally {
                    writeln!(f, "{}}} finally {{", indent)?;
                    write_block(f, finally, depth + 1)?;
                }
                writeln!(f, "{}}}", indent)?;
            }
        }
    }
    Ok(())
}

impl fmt::Display for AstBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_block(f, self, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc() -> SourceLocation {
        SourceLocation::default()
    }

    #[test]
    fn test_rewrite_roots_reaches_nested_blocks() {
        let x = AstVariable::new("x", TypeRef::I32, VariableKind::Local);
        let mut block = AstBlock::new(vec![
            AstNode::Expression(AstExpression::store(&x, AstExpression::int(1, TypeRef::I32, loc()), loc())),
            AstNode::Block(AstBlock::new(vec![AstNode::Expression(AstExpression::statement(
                AstCode::Nop,
                AstOperand::None,
                vec![],
                loc(),
            ))])),
        ]);
        block
            .rewrite_roots::<()>(&mut |expression| {
                if expression.code == AstCode::Nop {
                    Ok(vec![])
                } else {
                    Ok(vec![AstNode::Expression(expression)])
                }
            })
            .unwrap();
        let mut roots = 0;
        block.for_each_root(&mut |_| roots += 1);
        assert_eq!(roots, 1);
        assert_eq!(block.variables(), vec![x]);
    }

    #[test]
    fn test_display() {
        let block = AstBlock::new(vec![
            AstNode::Label("L0".to_string()),
            AstNode::Expression(AstExpression::label_branch(AstCode::Br, "L0", vec![], loc())),
        ]);
        assert_eq!(block.to_string(), "L0:\nBr L0\n");
        assert_eq!(block.referenced_labels(), vec!["L0".to_string()]);
    }
}
