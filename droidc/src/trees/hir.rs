//! Structured high level IR, as produced by the front end for source methods.
use serde::{Deserialize, Serialize};

use super::{BinaryOperator, CompareOperator, Constant, FieldRef, MethodRef, SourceLocation, TypeRef, UnaryOperator};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Local {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: TypeRef,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Body {
    #[serde(default)]
    pub locals: Vec<Local>,
    pub statements: Vec<Statement>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    pub kind: StatementKind,
    #[serde(default)]
    pub location: SourceLocation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchCase {
    pub values: Vec<i32>,
    pub body: Vec<Statement>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatchClause {
    /// `None` catches everything
    #[serde(default)]
    pub exception_type: Option<TypeRef>,
    #[serde(default)]
    pub variable: Option<String>,
    pub body: Vec<Statement>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatementKind {
    Expression(Expression),
    Assign {
        target: Expression,
        value: Expression,
    },
    CompoundAssign {
        operator: BinaryOperator,
        target: Expression,
        value: Expression,
    },
    If {
        condition: Expression,
        then: Vec<Statement>,
        #[serde(default)]
        otherwise: Vec<Statement>,
    },
    While {
        condition: Expression,
        body: Vec<Statement>,
    },
    Switch {
        value: Expression,
        cases: Vec<SwitchCase>,
        #[serde(default)]
        default: Vec<Statement>,
    },
    Break,
    Continue,
    Return(Option<Expression>),
    Throw(Expression),
    Try {
        body: Vec<Statement>,
        #[serde(default)]
        catches: Vec<CatchClause>,
        #[serde(default)]
        finally: Vec<Statement>,
    },
    Block(Vec<Statement>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expression {
    pub kind: ExpressionKind,
    #[serde(rename = "type")]
    pub ty: TypeRef,
    #[serde(default)]
    pub location: SourceLocation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpressionKind {
    Constant(Constant),
    /// A local variable or a parameter, by name
    Local(String),
    This,
    Field {
        #[serde(default)]
        instance: Option<Box<Expression>>,
        field: FieldRef,
    },
    ArrayElement {
        array: Box<Expression>,
        index: Box<Expression>,
    },
    ArrayLength(Box<Expression>),
    NewArray {
        element: TypeRef,
        length: Box<Expression>,
    },
    ArrayInitializer {
        element: TypeRef,
        values: Vec<Expression>,
    },
    Binary {
        operator: BinaryOperator,
        left: Box<Expression>,
        right: Box<Expression>,
    },
    Unary {
        operator: UnaryOperator,
        operand: Box<Expression>,
    },
    Compare {
        operator: CompareOperator,
        left: Box<Expression>,
        right: Box<Expression>,
    },
    And(Box<Expression>, Box<Expression>),
    Or(Box<Expression>, Box<Expression>),
    Not(Box<Expression>),
    Conditional {
        condition: Box<Expression>,
        then: Box<Expression>,
        otherwise: Box<Expression>,
    },
    Call {
        method: MethodRef,
        #[serde(default)]
        instance: Option<Box<Expression>>,
        #[serde(default)]
        arguments: Vec<Expression>,
        /// Dispatch on the runtime type of the instance
        #[serde(default)]
        virtual_call: bool,
    },
    New {
        constructor: MethodRef,
        #[serde(default)]
        arguments: Vec<Expression>,
    },
    Cast {
        target: TypeRef,
        value: Box<Expression>,
    },
    As {
        target: TypeRef,
        value: Box<Expression>,
    },
    Is {
        target: TypeRef,
        value: Box<Expression>,
    },
    /// Numeric conversion to the expression's type
    Convert(Box<Expression>),
    Box(Box<Expression>),
    Unbox {
        target: TypeRef,
        value: Box<Expression>,
    },
    TypeOf(TypeRef),
    Default(TypeRef),
    DelegateCreate {
        delegate_type: TypeRef,
        #[serde(default)]
        target: Option<Box<Expression>>,
        method: MethodRef,
    },
    DelegateInvoke {
        delegate: Box<Expression>,
        #[serde(default)]
        arguments: Vec<Expression>,
    },
    HasValue(Box<Expression>),
    GetValue(Box<Expression>),
    /// Reference to a local, field or array element, passed to a `ref` or `out` parameter
    AddressOf {
        target: Box<Expression>,
        /// The callee only writes through the reference
        #[serde(default)]
        out: bool,
    },
    /// The value a reference points to; also an assignment target
    Deref(Box<Expression>),
}

impl Expression {
    pub fn new(kind: ExpressionKind, ty: TypeRef, location: SourceLocation) -> Self {
        Expression { kind, ty, location }
    }
}

impl ExpressionKind {
    /// Direct subexpressions, in evaluation order
    pub fn children(&self) -> Vec<&Expression> {
        match self {
            ExpressionKind::Constant(_)
            | ExpressionKind::Local(_)
            | ExpressionKind::This
            | ExpressionKind::TypeOf(_)
            | ExpressionKind::Default(_) => vec![],
            ExpressionKind::Field { instance, .. } => instance.iter().map(|i| i.as_ref()).collect(),
            ExpressionKind::ArrayElement { array, index } => vec![array.as_ref(), index.as_ref()],
            ExpressionKind::ArrayLength(value)
            | ExpressionKind::Not(value)
            | ExpressionKind::Convert(value)
            | ExpressionKind::Box(value)
            | ExpressionKind::HasValue(value)
            | ExpressionKind::GetValue(value)
            | ExpressionKind::Deref(value) => vec![value.as_ref()],
            ExpressionKind::AddressOf { target, .. } => vec![target.as_ref()],
            ExpressionKind::NewArray { length, .. } => vec![length.as_ref()],
            ExpressionKind::ArrayInitializer { values, .. } => values.iter().collect(),
            ExpressionKind::Binary { left, right, .. } | ExpressionKind::Compare { left, right, .. } => {
                vec![left.as_ref(), right.as_ref()]
            }
            ExpressionKind::And(left, right) | ExpressionKind::Or(left, right) => vec![left.as_ref(), right.as_ref()],
            ExpressionKind::Unary { operand, .. } => vec![operand.as_ref()],
            ExpressionKind::Conditional { condition, then, otherwise } => vec![condition.as_ref(), then.as_ref(), otherwise.as_ref()],
            ExpressionKind::Call { instance, arguments, .. } => instance
                .iter()
                .map(|i| i.as_ref())
                .chain(arguments.iter())
                .collect(),
            ExpressionKind::New { arguments, .. } => arguments.iter().collect(),
            ExpressionKind::Cast { value, .. }
            | ExpressionKind::As { value, .. }
            | ExpressionKind::Is { value, .. }
            | ExpressionKind::Unbox { value, .. } => vec![value.as_ref()],
            ExpressionKind::DelegateCreate { target, .. } => target.iter().map(|t| t.as_ref()).collect(),
            ExpressionKind::DelegateInvoke { delegate, arguments } => {
                std::iter::once(delegate.as_ref()).chain(arguments.iter()).collect()
            }
        }
    }
}

impl Expression {
    pub fn any(&self, predicate: &impl Fn(&Expression) -> bool) -> bool {
        predicate(self) || self.kind.children().into_iter().any(|c| c.any(predicate))
    }
}

impl Statement {
    /// Whether some expression of the statement or of a nested statement matches
    pub fn any_expression(&self, predicate: &impl Fn(&Expression) -> bool) -> bool {
        let nested = |statements: &[Statement]| statements.iter().any(|s| s.any_expression(predicate));
        match &self.kind {
            StatementKind::Expression(value) | StatementKind::Throw(value) => value.any(predicate),
            StatementKind::Assign { target, value } | StatementKind::CompoundAssign { target, value, .. } => {
                target.any(predicate) || value.any(predicate)
            }
            StatementKind::If { condition, then, otherwise } => {
                condition.any(predicate) || nested(then) || nested(otherwise)
            }
            StatementKind::While { condition, body } => condition.any(predicate) || nested(body),
            StatementKind::Switch { value, cases, default } => {
                value.any(predicate) || cases.iter().any(|c| nested(&c.body)) || nested(default)
            }
            StatementKind::Return(value) => value.as_ref().is_some_and(|v| v.any(predicate)),
            StatementKind::Try { body, catches, finally } => {
                nested(body) || catches.iter().any(|c| nested(&c.body)) || nested(finally)
            }
            StatementKind::Block(statements) => nested(statements),
            StatementKind::Break | StatementKind::Continue => false,
        }
    }
}

impl Statement {
    /// The statement's own location, or the first one found in its nested statements
    pub fn first_location(&self) -> Option<&SourceLocation> {
        if self.location.is_known() {
            return Some(&self.location);
        }
        let nested: Vec<&[Statement]> = match &self.kind {
            StatementKind::If { then, otherwise, .. } => vec![then.as_slice(), otherwise.as_slice()],
            StatementKind::While { body, .. } => vec![body.as_slice()],
            StatementKind::Switch { cases, default, .. } => cases
                .iter()
                .map(|c| c.body.as_slice())
                .chain(std::iter::once(default.as_slice()))
                .collect(),
            StatementKind::Try { body, catches, finally } => std::iter::once(body.as_slice())
                .chain(catches.iter().map(|c| c.body.as_slice()))
                .chain(std::iter::once(finally.as_slice()))
                .collect(),
            StatementKind::Block(statements) => vec![statements.as_slice()],
            _ => vec![],
        };
        nested.into_iter().flatten().find_map(|s| s.first_location())
    }
}

impl Body {
    pub fn any_expression(&self, predicate: &impl Fn(&Expression) -> bool) -> bool {
        self.statements.iter().any(|s| s.any_expression(predicate))
    }

    pub fn first_location(&self) -> Option<&SourceLocation> {
        self.statements.iter().find_map(|s| s.first_location())
    }
}
