//! Stack bytecode of methods imported from a library.
//!
//! Every slot holds one value whatever its width. Slot 0 holds `this` for instance methods,
//! the parameters follow, and locals come after the parameters. Branch targets and exception
//! table bounds are instruction indices.
use serde::{Deserialize, Serialize};

use super::{BinaryOperator, CompareOperator, Constant, FieldRef, MethodRef, TypeRef};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Body {
    pub max_locals: u16,
    pub instructions: Vec<StackInstruction>,
    #[serde(default)]
    pub exception_table: Vec<ExceptionEntry>,
    #[serde(default)]
    pub lines: Vec<LineEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionEntry {
    pub start: usize,
    /// Exclusive
    pub end: usize,
    pub handler: usize,
    #[serde(default)]
    pub catch_type: Option<TypeRef>,
}

/// The first instruction of a source line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineEntry {
    pub instruction: usize,
    pub line: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvokeKind {
    Static,
    Virtual,
    Special,
    Interface,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StackInstruction {
    Nop,
    Push { value: Constant },
    Load { slot: u16, #[serde(rename = "type")] ty: TypeRef },
    Store { slot: u16, #[serde(rename = "type")] ty: TypeRef },
    Increment { slot: u16, amount: i32 },
    Arithmetic { operator: BinaryOperator, #[serde(rename = "type")] ty: TypeRef },
    Negate { #[serde(rename = "type")] ty: TypeRef },
    Convert { from: TypeRef, to: TypeRef },
    /// Compares the two topmost values and branches when the comparison holds
    IfCompare { operator: CompareOperator, #[serde(rename = "type")] ty: TypeRef, target: usize },
    /// Compares the topmost value with zero or null
    If { operator: CompareOperator, #[serde(rename = "type")] ty: TypeRef, target: usize },
    Goto { target: usize },
    Switch { first_key: i32, targets: Vec<usize>, default: usize },
    Return { #[serde(rename = "type")] ty: TypeRef },
    GetField { field: FieldRef },
    PutField { field: FieldRef },
    GetStatic { field: FieldRef },
    PutStatic { field: FieldRef },
    Invoke { method: MethodRef, kind: InvokeKind },
    New { #[serde(rename = "type")] ty: TypeRef },
    Dup,
    Pop,
    NewArray { element: TypeRef },
    ArrayLength,
    ArrayLoad { element: TypeRef },
    ArrayStore { element: TypeRef },
    CheckCast { #[serde(rename = "type")] ty: TypeRef },
    InstanceOf { #[serde(rename = "type")] ty: TypeRef },
    Throw,
}

impl StackInstruction {
    /// Indices this instruction may transfer control to, besides the next one
    pub fn targets(&self) -> Vec<usize> {
        match self {
            StackInstruction::IfCompare { target, .. }
            | StackInstruction::If { target, .. }
            | StackInstruction::Goto { target } => vec![*target],
            StackInstruction::Switch { targets, default, .. } => {
                let mut all = targets.clone();
                all.push(*default);
                all
            }
            _ => Vec::new(),
        }
    }

    /// Control never reaches the next instruction
    pub fn ends_flow(&self) -> bool {
        matches!(
            self,
            StackInstruction::Goto { .. }
                | StackInstruction::Switch { .. }
                | StackInstruction::Return { .. }
                | StackInstruction::Throw
        )
    }
}
