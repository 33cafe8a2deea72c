use std::cell::Cell;

use clap::ValueEnum;

use crate::backend::pre_compilation::bytecode_conversion::BytecodeConverter;
use crate::backend::pre_compilation::field_initialization::FieldInitialization;
use crate::backend::pre_compilation::hir_conversion::HirConverter;
use crate::backend::pre_compilation::optimizer::Optimizer;
use crate::error::CompilerError;
use crate::model::{MethodOrigin, MethodSource, Module, NameConverter};
use crate::trees::ast::{AstBlock, AstVariable};
use crate::trees::TypeRef;

mod by_reference;
mod bytecode_conversion;
mod casts;
mod cleanup;
mod compound_assignment;
mod conversions;
pub mod delegates;
mod enums;
mod field_initialization;
mod generics;
mod hir_conversion;
mod interlocked;
mod nullables;
mod optimizer;
mod struct_calls;

pub use delegates::{DelegateInstance, DelegateRegistry};
pub use field_initialization::is_atomic_updater;
pub use struct_calls::CLONE_METHOD;

/// Stage after which the tree pipeline stops, for inspecting intermediate trees
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum StopAstConversion {
    #[default]
    None,
    AfterBuild,
    AfterOptimizing,
    AfterCompoundAssignmentConverter,
    AfterInterlockedConverter,
    AfterByReferenceParamConverter,
    AfterEnumConverter,
    AfterNullableConverter,
    AfterStructCallConverter,
    AfterDelegateConverter,
    AfterConversionConverter,
    AfterCleanupConverter,
    AfterGenericsConverter,
    AfterCastConverter,
}

/// What every converter may consult while rewriting one method
pub struct ConversionContext<'a> {
    pub module: &'a Module,
    pub names: &'a NameConverter,
    pub source: &'a MethodSource,
    pub delegates: &'a DelegateRegistry,
    counter: Cell<u32>,
}

impl<'a> ConversionContext<'a> {
    pub fn new(
        module: &'a Module,
        names: &'a NameConverter,
        source: &'a MethodSource,
        delegates: &'a DelegateRegistry,
    ) -> Self {
        ConversionContext {
            module,
            names,
            source,
            delegates,
            counter: Cell::new(0),
        }
    }

    fn next(&self) -> u32 {
        let value = self.counter.get();
        self.counter.set(value + 1);
        value
    }

    /// A fresh compiler generated variable
    pub fn temporary(&self, prefix: &str, ty: TypeRef) -> AstVariable {
        AstVariable::generated(format!("${}{}", prefix, self.next()), ty)
    }

    /// A fresh label name
    pub fn label(&self) -> String {
        format!("$L{}", self.next())
    }
}

type Converter = fn(&ConversionContext, AstBlock) -> Result<AstBlock, CompilerError>;

const CONVERTERS: [(StopAstConversion, Converter); 11] = [
    (StopAstConversion::AfterCompoundAssignmentConverter, compound_assignment::convert),
    (StopAstConversion::AfterInterlockedConverter, interlocked::convert),
    (StopAstConversion::AfterByReferenceParamConverter, by_reference::convert),
    (StopAstConversion::AfterEnumConverter, enums::convert),
    (StopAstConversion::AfterNullableConverter, nullables::convert),
    (StopAstConversion::AfterStructCallConverter, struct_calls::convert),
    (StopAstConversion::AfterDelegateConverter, delegates::convert),
    (StopAstConversion::AfterConversionConverter, conversions::convert),
    (StopAstConversion::AfterCleanupConverter, cleanup::convert),
    (StopAstConversion::AfterGenericsConverter, generics::convert),
    (StopAstConversion::AfterCastConverter, casts::convert),
];

/// Builds the tree of a method and runs every conversion up to `stop`
pub fn create_optimized_ast(context: &ConversionContext, stop: StopAstConversion) -> Result<AstBlock, CompilerError> {
    let source = context.source;
    let mut block = match &source.origin {
        MethodOrigin::Hir(body) => {
            let mut converter = HirConverter::new(context);
            let block = converter.convert(body)?;
            FieldInitialization::new(context).add_field_initialization(block)?
        }
        MethodOrigin::Bytecode(body) => {
            let mut converter = BytecodeConverter::new(context);
            let block = converter.convert(body)?;
            FieldInitialization::new(context).add_field_initialization(block)?
        }
        MethodOrigin::Ast(block) => block.clone(),
    };
    log::trace!("{} after build:\n{}", source.display_name(), block);
    if stop == StopAstConversion::AfterBuild {
        return Ok(block);
    }

    block = Optimizer::new().optimize(block);
    if stop == StopAstConversion::AfterOptimizing {
        return Ok(block);
    }

    for (stage, converter) in CONVERTERS.iter() {
        block = converter(context, block)?;
        log::trace!("{} {:?}:\n{}", source.display_name(), stage, block);
        if stop == *stage {
            return Ok(block);
        }
    }
    Ok(Optimizer::new().optimize(block))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model::{CompilationUnit, ParameterDefinition};
    use crate::trees::ast::{AstCode, AstNode};
    use crate::trees::hir::{Body, Expression, ExpressionKind, Statement, StatementKind};
    use crate::trees::{BinaryOperator, Constant, SourceLocation};

    pub(crate) fn module(json: &str) -> Module {
        Module::new(vec![CompilationUnit::from_json(json).unwrap()])
    }

    pub(crate) fn source(owner: &str, name: &str, is_static: bool, parameters: Vec<(&str, TypeRef)>, origin: MethodOrigin) -> MethodSource {
        MethodSource {
            declaring_type: TypeRef::named(owner),
            name: name.to_string(),
            is_static,
            parameters: parameters
                .into_iter()
                .map(|(name, ty)| ParameterDefinition { name: name.to_string(), ty })
                .collect(),
            return_type: TypeRef::Void,
            class_type_parameters: Vec::new(),
            method_type_parameters: Vec::new(),
            location: SourceLocation::new("Program.cs", 1, 1),
            origin,
        }
    }

    pub(crate) fn expression(kind: ExpressionKind, ty: TypeRef) -> Expression {
        Expression::new(kind, ty, SourceLocation::new("Program.cs", 3, 5))
    }

    pub(crate) fn statement(kind: StatementKind) -> Statement {
        Statement {
            kind,
            location: SourceLocation::new("Program.cs", 3, 5),
        }
    }

    pub(crate) fn roots(block: &AstBlock) -> Vec<AstCode> {
        let mut codes = Vec::new();
        block.for_each_root(&mut |root| codes.push(root.code));
        codes
    }

    pub(crate) fn codes(block: &AstBlock) -> Vec<AstCode> {
        let mut codes = Vec::new();
        block.for_each_expression(&mut |expression| codes.push(expression.code));
        codes
    }

    fn compound_body() -> Body {
        let local = || expression(ExpressionKind::Local("x".into()), TypeRef::I32);
        Body {
            locals: vec![crate::trees::hir::Local { name: "x".into(), ty: TypeRef::I32 }],
            statements: vec![
                statement(StatementKind::Assign {
                    target: local(),
                    value: expression(ExpressionKind::Constant(Constant::Int(1)), TypeRef::I32),
                }),
                statement(StatementKind::CompoundAssign {
                    operator: BinaryOperator::Add,
                    target: local(),
                    value: expression(ExpressionKind::Constant(Constant::Int(2)), TypeRef::I32),
                }),
                statement(StatementKind::Return(None)),
            ],
        }
    }

    #[test]
    fn test_stop_points() {
        let module = module(r#"{"name": "App", "scope": "app", "types": [{"namespace": "App", "name": "Program", "kind": "class"}]}"#);
        let names = NameConverter::new(&module);
        let delegates = DelegateRegistry::new();
        let source = source("App.Program", "Run", true, vec![], MethodOrigin::Hir(compound_body()));
        let context = ConversionContext::new(&module, &names, &source, &delegates);

        let built = create_optimized_ast(&context, StopAstConversion::AfterBuild).unwrap();
        assert!(codes(&built).contains(&AstCode::CompoundAssign));

        let converted = create_optimized_ast(&context, StopAstConversion::AfterCompoundAssignmentConverter).unwrap();
        assert!(!codes(&converted).contains(&AstCode::CompoundAssign));
        assert!(codes(&converted).contains(&AstCode::Add));

        let full = create_optimized_ast(&context, StopAstConversion::None).unwrap();
        assert_eq!(roots(&full), vec![AstCode::Stloc, AstCode::Stloc, AstCode::Ret]);
        assert_eq!(create_optimized_ast(&context, StopAstConversion::None).unwrap(), full);
    }

    #[test]
    fn test_every_node_has_a_location() {
        let module = module(r#"{"name": "App", "scope": "app", "types": [{"namespace": "App", "name": "Program", "kind": "class"}]}"#);
        let names = NameConverter::new(&module);
        let delegates = DelegateRegistry::new();
        let source = source("App.Program", "Run", true, vec![], MethodOrigin::Hir(compound_body()));
        let context = ConversionContext::new(&module, &names, &source, &delegates);
        let block = create_optimized_ast(&context, StopAstConversion::None).unwrap();
        block.for_each_expression(&mut |expression| assert!(expression.location.is_known(), "{:?}", expression.code));
        assert!(block.body.iter().all(|n| !matches!(n, AstNode::Block(_))));
    }

    #[test]
    fn test_expressions_without_location_inherit_the_statement() {
        let body: Body = serde_json::from_str(
            r#"{"locals": [{"name": "x", "type": "i32"}], "statements": [
                {"kind": {"assign": {
                    "target": {"kind": {"local": "x"}, "type": "i32"},
                    "value": {"kind": {"binary": {"operator": "add",
                        "left": {"kind": {"constant": {"int": 1}}, "type": "i32"},
                        "right": {"kind": {"constant": {"int": 2}}, "type": "i32"}}}, "type": "i32"}}},
                 "location": {"document": "Program.cs", "line": 4, "column": 9}},
                {"kind": {"return": null}}
            ]}"#,
        )
        .unwrap();
        let module = module(r#"{"name": "App", "scope": "app", "types": [{"namespace": "App", "name": "Program", "kind": "class"}]}"#);
        let names = NameConverter::new(&module);
        let delegates = DelegateRegistry::new();
        let source = source("App.Program", "Run", true, vec![], MethodOrigin::Hir(body));
        let context = ConversionContext::new(&module, &names, &source, &delegates);

        let built = create_optimized_ast(&context, StopAstConversion::AfterBuild).unwrap();
        let mut lines = Vec::new();
        built.for_each_expression(&mut |expression| {
            assert_eq!(expression.location.document, "Program.cs");
            lines.push((expression.code, expression.location.line));
        });
        assert!(lines.contains(&(AstCode::Add, 4)));
        assert!(lines.contains(&(AstCode::LdcI4, 4)));
        // The return has no location of its own and takes the method's
        assert!(lines.contains(&(AstCode::Ret, 1)));
    }

    #[test]
    fn test_references_lower_to_array_elements() {
        let module = module(r#"{"name": "App", "scope": "app", "types": [{"namespace": "App", "name": "Program", "kind": "class"}]}"#);
        let names = NameConverter::new(&module);
        let delegates = DelegateRegistry::new();

        let bump: Body = serde_json::from_str(
            r#"{"statements": [
                {"kind": {"compound_assign": {"operator": "add",
                    "target": {"kind": {"deref": {"kind": {"local": "x"}, "type": {"by_ref": "i32"}}}, "type": "i32"},
                    "value": {"kind": {"constant": {"int": 1}}, "type": "i32"}}}},
                {"kind": {"return": null}}
            ]}"#,
        )
        .unwrap();
        let source = source("App.Program", "Bump", true, vec![("x", TypeRef::by_ref_of(TypeRef::I32))], MethodOrigin::Hir(bump));
        let context = ConversionContext::new(&module, &names, &source, &delegates);
        let interlocked = create_optimized_ast(&context, StopAstConversion::AfterInterlockedConverter).unwrap();
        assert!(codes(&interlocked).contains(&AstCode::Stobj));
        let lowered = create_optimized_ast(&context, StopAstConversion::None).unwrap();
        let all = codes(&lowered);
        assert_eq!(roots(&lowered), vec![AstCode::Stelem, AstCode::Ret]);
        assert!(all.contains(&AstCode::Ldelem));
        assert!(!all.iter().any(|c| matches!(c, AstCode::Ldobj | AstCode::Stobj | AstCode::AddressOf)));

        let run: Body = serde_json::from_str(
            r#"{"locals": [{"name": "v", "type": "i32"}], "statements": [
                {"kind": {"assign": {"target": {"kind": {"local": "v"}, "type": "i32"},
                                     "value": {"kind": {"constant": {"int": 1}}, "type": "i32"}}}},
                {"kind": {"expression": {"kind": {"call": {
                    "method": {"owner": {"named": "App.Program"}, "name": "Bump", "parameters": [{"by_ref": "i32"}],
                               "return_type": "void", "is_static": true},
                    "arguments": [{"kind": {"address_of": {"target": {"kind": {"local": "v"}, "type": "i32"}}},
                                   "type": {"by_ref": "i32"}}]}}, "type": "void"}}},
                {"kind": {"return": null}}
            ]}"#,
        )
        .unwrap();
        let source = self::source("App.Program", "Run", true, vec![], MethodOrigin::Hir(run));
        let context = ConversionContext::new(&module, &names, &source, &delegates);
        let lowered = create_optimized_ast(&context, StopAstConversion::None).unwrap();
        let all = codes(&lowered);
        assert!(all.contains(&AstCode::InitArray));
        assert!(!all.contains(&AstCode::AddressOf));
        let mut written_back = false;
        lowered.for_each_expression(&mut |e| {
            written_back |= e.code == AstCode::Stloc && e.variable().is_some_and(|v| v.name == "v") && e.arguments[0].code == AstCode::Ldelem;
        });
        assert!(written_back);
    }
}
