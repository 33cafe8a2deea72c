use std::collections::{HashMap, HashSet};

use crate::trees::ast::{AstBlock, AstCode, AstExpression, AstNode, AstOperand, VariableKind};

enum Substitution {
    Found,
    Blocked,
    NotFound,
}

/// Simplifications that know nothing about the target format. Runs until nothing changes.
pub struct Optimizer {
    changed: bool,
}

impl Optimizer {
    pub fn new() -> Self {
        Optimizer { changed: false }
    }

    pub fn optimize(&mut self, mut block: AstBlock) -> AstBlock {
        loop {
            self.changed = false;
            self.flatten(&mut block);
            self.inline_temporaries(&mut block);
            let referenced: HashSet<String> = block.referenced_labels().into_iter().collect();
            self.remove_dead_code(&mut block, &referenced);
            let referenced: HashSet<String> = block.referenced_labels().into_iter().collect();
            self.remove_unused_labels(&mut block, &referenced);
            if !self.changed {
                return block;
            }
        }
    }

    /// Splices nested plain blocks into their parent
    fn flatten(&mut self, block: &mut AstBlock) {
        let nodes = std::mem::take(&mut block.body);
        for node in nodes {
            match node {
                AstNode::Block(mut inner) => {
                    self.flatten(&mut inner);
                    self.changed = true;
                    block.body.extend(inner.body);
                }
                AstNode::TryCatch(mut try_catch) => {
                    self.flatten(&mut try_catch.try_block);
                    for catch in try_catch.catches.iter_mut() {
                        self.flatten(&mut catch.body);
                    }
                    if let Some(finally) = try_catch.finally.as_mut() {
                        self.flatten(finally);
                    }
                    block.body.push(AstNode::TryCatch(try_catch));
                }
                AstNode::Expression(expression) if is_nop(&expression) => self.changed = true,
                other => block.body.push(other),
            }
        }
    }

    /// Moves the value of a generated variable that is stored and loaded exactly once into its
    /// use in the next statement, when nothing evaluated in between could observe the move.
    fn inline_temporaries(&mut self, block: &mut AstBlock) {
        let mut stores: HashMap<String, usize> = HashMap::new();
        let mut loads: HashMap<String, usize> = HashMap::new();
        block.for_each_expression(&mut |expression| {
            let Some(variable) = expression.variable() else {
                return;
            };
            if variable.kind != VariableKind::Generated {
                return;
            }
            let counter = if expression.code == AstCode::Stloc { &mut stores } else { &mut loads };
            *counter.entry(variable.name.clone()).or_default() += 1;
        });
        let mut catch_variables = HashSet::new();
        block.visit_nodes(&mut |node| {
            if let AstNode::TryCatch(try_catch) = node {
                for catch in try_catch.catches.iter() {
                    if let Some(variable) = &catch.variable {
                        catch_variables.insert(variable.name.clone());
                    }
                }
            }
        });
        let single_use = |name: &str| {
            stores.get(name) == Some(&1) && loads.get(name) == Some(&1) && !catch_variables.contains(name)
        };
        self.inline_in_block(block, &single_use);
    }

    fn inline_in_block(&mut self, block: &mut AstBlock, single_use: &impl Fn(&str) -> bool) {
        let mut index = 0;
        while index < block.body.len() {
            match &mut block.body[index] {
                AstNode::TryCatch(try_catch) => {
                    self.inline_in_block(&mut try_catch.try_block, single_use);
                    for catch in try_catch.catches.iter_mut() {
                        self.inline_in_block(&mut catch.body, single_use);
                    }
                    if let Some(finally) = try_catch.finally.as_mut() {
                        self.inline_in_block(finally, single_use);
                    }
                }
                AstNode::Block(inner) => self.inline_in_block(inner, single_use),
                _ => {}
            }

            let candidate = match (&block.body[index], block.body.get(index + 1)) {
                (AstNode::Expression(store), Some(AstNode::Expression(_)))
                    if store.code == AstCode::Stloc && store.variable().is_some_and(|v| single_use(&v.name)) =>
                {
                    store.variable().map(|v| v.name.clone())
                }
                _ => None,
            };
            let Some(name) = candidate else {
                index += 1;
                continue;
            };
            let AstNode::Expression(store) = &block.body[index] else {
                unreachable!("candidate stores are expressions");
            };
            let mut value = store.arguments.first().cloned();
            let AstNode::Expression(next) = &mut block.body[index + 1] else {
                unreachable!("candidate is followed by an expression");
            };
            let mut attempt = next.clone();
            if let Substitution::Found = substitute(&mut attempt, &name, &mut value) {
                *next = attempt;
                block.body.remove(index);
                self.changed = true;
            } else {
                index += 1;
            }
        }
    }

    /// Drops statements after an unconditional transfer up to the next referenced label, and
    /// branches to the label that directly follows them
    fn remove_dead_code(&mut self, block: &mut AstBlock, referenced: &HashSet<String>) {
        let nodes = std::mem::take(&mut block.body);
        let mut unreachable = false;
        for node in nodes {
            match node {
                AstNode::Label(label) => {
                    if referenced.contains(&label) {
                        unreachable = false;
                    }
                    block.body.push(AstNode::Label(label));
                }
                AstNode::Expression(_) if unreachable => self.changed = true,
                AstNode::Expression(expression) => {
                    unreachable = expression.code.ends_flow();
                    block.body.push(AstNode::Expression(expression));
                }
                AstNode::TryCatch(mut try_catch) => {
                    self.remove_dead_code(&mut try_catch.try_block, referenced);
                    for catch in try_catch.catches.iter_mut() {
                        self.remove_dead_code(&mut catch.body, referenced);
                    }
                    if let Some(finally) = try_catch.finally.as_mut() {
                        self.remove_dead_code(finally, referenced);
                    }
                    unreachable = false;
                    block.body.push(AstNode::TryCatch(try_catch));
                }
                AstNode::Block(mut inner) => {
                    self.remove_dead_code(&mut inner, referenced);
                    unreachable = false;
                    block.body.push(AstNode::Block(inner));
                }
            }
        }

        let mut index = 0;
        while index < block.body.len() {
            let target = match &block.body[index] {
                AstNode::Expression(e) if e.code == AstCode::Br => match &e.operand {
                    AstOperand::Label(label) => Some(label.clone()),
                    _ => None,
                },
                _ => None,
            };
            let falls_into = target.is_some_and(|target| {
                block.body[index + 1..]
                    .iter()
                    .take_while(|n| matches!(n, AstNode::Label(_)))
                    .any(|n| matches!(n, AstNode::Label(l) if *l == target))
            });
            if falls_into {
                block.body.remove(index);
                self.changed = true;
            } else {
                index += 1;
            }
        }
    }

    fn remove_unused_labels(&mut self, block: &mut AstBlock, referenced: &HashSet<String>) {
        let before = block.body.len();
        block
            .body
            .retain(|node| !matches!(node, AstNode::Label(label) if !referenced.contains(label)));
        self.changed |= block.body.len() != before;
        for node in block.body.iter_mut() {
            match node {
                AstNode::TryCatch(try_catch) => {
                    self.remove_unused_labels(&mut try_catch.try_block, referenced);
                    for catch in try_catch.catches.iter_mut() {
                        self.remove_unused_labels(&mut catch.body, referenced);
                    }
                    if let Some(finally) = try_catch.finally.as_mut() {
                        self.remove_unused_labels(finally, referenced);
                    }
                }
                AstNode::Block(inner) => self.remove_unused_labels(inner, referenced),
                _ => {}
            }
        }
    }
}

fn is_nop(expression: &AstExpression) -> bool {
    expression.code == AstCode::Nop && expression.arguments.is_empty()
}

/// Replaces the load of `name` in `expression` by `value`, in evaluation order, giving up as
/// soon as something that is not pure would be evaluated before the load
fn substitute(expression: &mut AstExpression, name: &str, value: &mut Option<AstExpression>) -> Substitution {
    if expression.is_load_of(name) {
        if let Some(value) = value.take() {
            *expression = value;
            return Substitution::Found;
        }
        return Substitution::Blocked;
    }
    if matches!(expression.code, AstCode::AddressOf | AstCode::OutAddressOf)
        && expression.arguments.first().is_some_and(|target| target.is_load_of(name))
    {
        // the variable itself is referenced, not its value
        return Substitution::Blocked;
    }
    if matches!(expression.code, AstCode::LogicAnd | AstCode::LogicOr | AstCode::Conditional) {
        // Only the first operand is always evaluated.
        return match expression.arguments.first_mut() {
            Some(first) => substitute(first, name, value),
            None => Substitution::NotFound,
        };
    }
    for argument in expression.arguments.iter_mut() {
        match substitute(argument, name, value) {
            Substitution::NotFound => {
                if argument.any(&|e| !e.is_pure()) {
                    return Substitution::Blocked;
                }
            }
            other => return other,
        }
    }
    Substitution::NotFound
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trees::ast::AstVariable;
    use crate::trees::{MethodRef, SourceLocation, TypeRef};

    fn loc() -> SourceLocation {
        SourceLocation::new("a.cs", 1, 1)
    }

    fn call(name: &str, arguments: Vec<AstExpression>) -> AstExpression {
        let method = MethodRef::new_static(TypeRef::named("App.P"), name, vec![TypeRef::I32; arguments.len()], TypeRef::I32);
        AstExpression::new(AstCode::Call, AstOperand::Method(method), arguments, TypeRef::I32, loc())
    }

    fn expression(e: AstExpression) -> AstNode {
        AstNode::Expression(e)
    }

    #[test]
    fn test_single_use_temporary_is_inlined() {
        let t = AstVariable::generated("$t0", TypeRef::I32);
        let x = AstVariable::new("x", TypeRef::I32, VariableKind::Local);
        let block = AstBlock::new(vec![
            expression(AstExpression::store(&t, call("F", vec![]), loc())),
            expression(AstExpression::store(&x, call("G", vec![AstExpression::load(&t, loc())]), loc())),
        ]);
        let block = Optimizer::new().optimize(block);
        assert_eq!(block.body.len(), 1);
        let AstNode::Expression(store) = &block.body[0] else { panic!() };
        assert_eq!(store.arguments[0].arguments[0].code, AstCode::Call);
    }

    #[test]
    fn test_inlining_never_moves_past_effects() {
        let t = AstVariable::generated("$t0", TypeRef::I32);
        let block = AstBlock::new(vec![
            expression(AstExpression::store(&t, call("F", vec![]), loc())),
            expression(call("G", vec![call("H", vec![]), AstExpression::load(&t, loc())])),
        ]);
        let block = Optimizer::new().optimize(block);
        assert_eq!(block.body.len(), 2);
    }

    #[test]
    fn test_referenced_temporary_stays() {
        let t = AstVariable::generated("$t0", TypeRef::I32);
        let address = AstExpression::new(
            AstCode::AddressOf,
            AstOperand::None,
            vec![AstExpression::load(&t, loc())],
            TypeRef::by_ref_of(TypeRef::I32),
            loc(),
        );
        let block = AstBlock::new(vec![
            expression(AstExpression::store(&t, call("F", vec![]), loc())),
            expression(call("G", vec![address])),
        ]);
        let block = Optimizer::new().optimize(block);
        assert_eq!(block.body.len(), 2);
    }

    #[test]
    fn test_branch_to_next_and_dead_code() {
        let block = AstBlock::new(vec![
            expression(AstExpression::label_branch(AstCode::Br, "L1", vec![], loc())),
            expression(call("Dead", vec![])),
            AstNode::Label("L0".into()),
            AstNode::Label("L1".into()),
            AstNode::Block(AstBlock::new(vec![expression(AstExpression::statement(AstCode::Ret, AstOperand::None, vec![], loc()))])),
        ]);
        let block = Optimizer::new().optimize(block);
        assert_eq!(block.body.len(), 1);
        assert!(matches!(&block.body[0], AstNode::Expression(e) if e.code == AstCode::Ret));
    }

    #[test]
    fn test_idempotent() {
        let t = AstVariable::generated("$t0", TypeRef::I32);
        let block = AstBlock::new(vec![
            AstNode::Label("L0".into()),
            expression(AstExpression::store(&t, call("F", vec![]), loc())),
            expression(AstExpression::label_branch(AstCode::Brtrue, "L0", vec![AstExpression::load(&t, loc())], loc())),
        ]);
        let once = Optimizer::new().optimize(block);
        let twice = Optimizer::new().optimize(once.clone());
        assert_eq!(once, twice);
    }
}
