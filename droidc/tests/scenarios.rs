use std::path::{Path, PathBuf};

use droid_shared::bytecode::{ExceptionHandler, InstructionRange, MethodBody, Opcode, Operand, Register};
use droid_shared::dexfile::{reader, writer, AccessFlags, ClassDefinition, DexFile, MethodDefinition};
use droid_shared::{ClassReference, MethodReference, Prototype, TypeReference};
use droidc::backend::{build, peephole, BuildReport};
use droidc::config::{BuildOptions, CacheMode, CONTAINER_FILE, MAP_FILE};
use serde_json::{json, Value};

fn location(line: u32) -> Value {
    json!({"document": "Program.cs", "line": line, "column": 9})
}

fn constant(value: i32) -> Value {
    json!({"kind": {"constant": {"int": value}}, "type": "i32"})
}

fn static_field(owner: &str, name: &str, ty: Value) -> Value {
    json!({"kind": {"field": {"field": {"owner": {"named": owner}, "name": name, "field_type": ty.clone()}}}, "type": ty})
}

fn store_total(value: i32, line: u32) -> Value {
    json!({"kind": {"assign": {"target": static_field("App.Program", "Total", json!("i32")), "value": constant(value)}}, "location": location(line)})
}

fn ret(line: u32) -> Value {
    json!({"kind": {"return": null}, "location": location(line)})
}

fn library() -> Value {
    let x = json!({"kind": {"local": "x"}, "type": "i32"});
    json!({"name": "Lib", "scope": "lib", "types": [
        {"namespace": "Lib", "name": "Util", "kind": "class", "scope_id": "02000002", "is_public": true,
         "methods": [
            {"name": "Twice", "scope_id": "06000001", "is_static": true, "return_type": "i32",
             "parameters": [{"name": "x", "type": "i32"}],
             "body": {"hir": {"statements": [
                {"kind": {"return": {"kind": {"binary": {"operator": "add", "left": x, "right": x}}, "type": "i32"}},
                 "location": {"document": "Util.cs", "line": 5, "column": 9}}
             ]}}}
         ]}
    ]})
}

/// An enum, a class holding two enum fields and a program calling into the library
fn application(run: &str) -> Value {
    let color = json!({"named": "App.Color"});
    let this = json!({"kind": "this", "type": {"named": "App.Holder"}});
    let base_call = json!({"kind": {"call": {"method": {"owner": "object", "name": ".ctor", "return_type": "void"}, "instance": this}}, "type": "void"});
    let twice = json!({"kind": {"call": {
        "method": {"owner": {"named": "Lib.Util"}, "name": "Twice", "parameters": ["i32"], "return_type": "i32", "is_static": true},
        "arguments": [constant(21)]}}, "type": "i32"});

    let mut otherwise = Vec::new();
    for _ in 0..200 {
        otherwise.push(store_total(2, 12));
    }
    json!({"name": "App", "scope": "app", "types": [
        {"namespace": "App", "name": "Color", "kind": "enum", "scope_id": "02000002",
         "fields": [
            {"name": "value__", "type": "i32"},
            {"name": "Red", "type": color, "is_static": true, "constant": {"int": 0}},
            {"name": "Green", "type": color, "is_static": true, "constant": {"int": 1}}
         ]},
        {"namespace": "App", "name": "Holder", "kind": "class", "scope_id": "02000003",
         "fields": [
            {"name": "foreground", "type": color},
            {"name": "background", "type": color}
         ],
         "methods": [
            {"name": ".ctor", "scope_id": "06000010", "return_type": "void",
             "body": {"hir": {"statements": [
                {"kind": {"expression": base_call}, "location": location(20)},
                ret(21)
             ]}}}
         ]},
        {"namespace": "App", "name": "Program", "kind": "class", "scope_id": "02000004",
         "fields": [{"name": "Total", "type": "i32", "is_static": true}],
         "methods": [
            {"name": run, "scope_id": "06000020", "is_static": true, "return_type": "void",
             "body": {"hir": {"statements": [
                {"kind": {"assign": {"target": static_field("App.Program", "Total", json!("i32")), "value": twice}}, "location": location(30)},
                ret(31)
             ]}}},
            {"name": "Branchy", "scope_id": "06000021", "is_static": true, "return_type": "void",
             "parameters": [{"name": "flag", "type": "bool"}],
             "body": {"hir": {"statements": [
                {"kind": {"if": {
                    "condition": {"kind": {"local": "flag"}, "type": "bool"},
                    "then": [store_total(1, 11)],
                    "otherwise": otherwise}},
                 "location": location(10)},
                store_total(3, 13),
                ret(14)
             ]}}}
         ]}
    ]})
}

/// A delegate type and a program that creates and invokes an instance of it
fn events() -> Value {
    let handler = json!({"named": "Ev.Handler"});
    let x = json!({"kind": {"local": "x"}, "type": "i32"});
    let twice = json!({"owner": {"named": "Ev.Program"}, "name": "Twice", "parameters": ["i32"], "return_type": "i32", "is_static": true});
    let current = static_field("Ev.Program", "Current", handler.clone());
    let create = json!({"kind": {"delegate_create": {"delegate_type": handler.clone(), "method": twice}}, "type": handler.clone()});
    let invoke = json!({"kind": {"delegate_invoke": {"delegate": current.clone(), "arguments": [constant(7)]}}, "type": "i32"});
    json!({"name": "Ev", "scope": "ev", "types": [
        {"namespace": "Ev", "name": "Handler", "kind": "delegate", "scope_id": "02000002",
         "methods": [
            {"name": "Invoke", "scope_id": "06000001", "parameters": [{"name": "x", "type": "i32"}], "return_type": "i32",
             "is_virtual": true, "is_abstract": true}
         ]},
        {"namespace": "Ev", "name": "Program", "kind": "class", "scope_id": "02000003",
         "fields": [{"name": "Current", "type": handler, "is_static": true}],
         "methods": [
            {"name": "Twice", "scope_id": "06000002", "is_static": true, "return_type": "i32",
             "parameters": [{"name": "x", "type": "i32"}],
             "body": {"hir": {"statements": [
                {"kind": {"return": {"kind": {"binary": {"operator": "add", "left": x, "right": x}}, "type": "i32"}}, "location": location(5)}
             ]}}},
            {"name": "Run", "scope_id": "06000003", "is_static": true, "return_type": "void",
             "body": {"hir": {"statements": [
                {"kind": {"assign": {"target": current, "value": create}}, "location": location(8)},
                ret(9)
             ]}}},
            {"name": "Call", "scope_id": "06000004", "is_static": true, "return_type": "i32",
             "body": {"hir": {"statements": [
                {"kind": {"return": invoke}, "location": location(12)}
             ]}}}
         ]}
    ]})
}

fn write_inputs(directory: &Path, run: &str) -> Vec<PathBuf> {
    let inputs = vec![directory.join("Lib.json"), directory.join("App.json")];
    std::fs::write(&inputs[0], library().to_string()).unwrap();
    std::fs::write(&inputs[1], application(run).to_string()).unwrap();
    inputs
}

fn build_into(inputs: &[PathBuf], output: &Path, cache: Option<&Path>, mode: CacheMode) -> BuildReport {
    let options = BuildOptions {
        inputs: inputs.to_vec(),
        output: output.to_path_buf(),
        cache_dir: cache.map(Path::to_path_buf),
        cache_mode: mode,
        jobs: 3,
        ..Default::default()
    };
    build(&options).unwrap()
}

fn container(output: &Path) -> Vec<u8> {
    std::fs::read(output.join(CONTAINER_FILE)).unwrap()
}

fn body<'d>(dex: &'d DexFile, class: &str, method: &str) -> &'d MethodBody {
    dex.classes
        .iter()
        .find(|c| c.class.descriptor() == class)
        .and_then(|c| c.methods.iter().find(|m| m.reference.name == method))
        .and_then(|m| m.body.as_ref())
        .unwrap()
}

fn opcodes(body: &MethodBody) -> Vec<Opcode> {
    body.instructions().iter().map(|i| i.opcode).collect()
}

#[test]
fn test_far_goto_uses_medium_form() {
    let directory = tempfile::tempdir().unwrap();
    let inputs = write_inputs(directory.path(), "Run");
    let output = directory.path().join("out");
    build_into(&inputs, &output, None, CacheMode::Disabled);

    let dex = reader::read(&container(&output)).unwrap();
    let opcodes = opcodes(body(&dex, "Lapp/Program;", "Branchy"));
    assert_eq!(opcodes.iter().filter(|&&op| op == Opcode::Goto16).count(), 1);
    assert!(!opcodes.contains(&Opcode::Goto32));
    assert!(!opcodes.contains(&Opcode::Goto));
}

#[test]
fn test_try_end_nop_survives_into_container() {
    let mut guarded = MethodBody::new(1, 0);
    let first = guarded.push(Opcode::Const4, vec![Register::normal(0)], Operand::Int(1));
    guarded.push(Opcode::Nop, vec![], Operand::None);
    let end = guarded.push(Opcode::Nop, vec![], Operand::None);
    guarded.push(Opcode::Nop, vec![], Operand::None);
    let handler = guarded.push(Opcode::ReturnVoid, vec![], Operand::None);
    guarded.exception_handlers.push(ExceptionHandler {
        range: InstructionRange::new(first, end),
        catches: vec![],
        catch_all: Some(handler),
    });
    peephole::remove_nops(&mut guarded).unwrap();
    assert_eq!(opcodes(&guarded), vec![Opcode::Const4, Opcode::Nop, Opcode::ReturnVoid]);

    let owner = ClassReference::new("Lapp/Guarded;");
    let reference = MethodReference::new(owner.clone(), "run", Prototype::new(TypeReference::void(), vec![]));
    let mut method = MethodDefinition::new(reference, AccessFlags::PUBLIC | AccessFlags::STATIC);
    method.body = Some(guarded);
    let mut class = ClassDefinition::new(owner, AccessFlags::PUBLIC, Some(ClassReference::object()));
    class.methods.push(method);
    let mut dex = DexFile::new();
    dex.classes.push(class);

    let read = reader::read(&writer::write(&dex).unwrap()).unwrap();
    let read_back = body(&read, "Lapp/Guarded;", "run");
    assert_eq!(opcodes(read_back), vec![Opcode::Const4, Opcode::Nop, Opcode::ReturnVoid]);
    let range = &read_back.exception_handlers[0].range;
    assert_eq!(range.first, read_back.instructions()[0].id());
    assert_eq!(range.last, read_back.instructions()[1].id());
    assert_eq!(read_back.exception_handlers[0].catch_all, Some(read_back.instructions()[2].id()));
}

#[test]
fn test_enum_fields_initialized_after_base_constructor() {
    let directory = tempfile::tempdir().unwrap();
    let inputs = write_inputs(directory.path(), "Run");
    let output = directory.path().join("out");
    build_into(&inputs, &output, None, CacheMode::Disabled);

    let dex = reader::read(&container(&output)).unwrap();
    let body = body(&dex, "Lapp/Holder;", "<init>");
    let instructions = body.instructions();
    assert_eq!(instructions[0].opcode, Opcode::InvokeDirect);
    let Operand::Method(base) = &instructions[0].operand else {
        panic!("first instruction is not the base constructor call")
    };
    assert_eq!(base.owner.descriptor(), "Ljava/lang/Object;");

    let stores: Vec<(usize, String)> = instructions
        .iter()
        .enumerate()
        .filter_map(|(index, instruction)| match &instruction.operand {
            Operand::Field(field) if instruction.opcode == Opcode::IputObject => Some((index, field.name.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(stores.len(), 2);
    assert!(stores.iter().all(|(index, _)| *index > 0));
    let mut names: Vec<&str> = stores.iter().map(|(_, name)| name.as_str()).collect();
    names.sort();
    assert_eq!(names, vec!["background", "foreground"]);
    assert_eq!(instructions.last().unwrap().opcode, Opcode::ReturnVoid);
}

#[test]
fn test_unchanged_rebuild_hits_every_method() {
    let directory = tempfile::tempdir().unwrap();
    let inputs = write_inputs(directory.path(), "Run");
    let first = directory.path().join("first");
    let fresh = build_into(&inputs, &first, None, CacheMode::Disabled);
    assert_eq!(fresh.cache.lookups(), 0);

    let second = directory.path().join("second");
    let cached = build_into(&inputs, &second, Some(&first), CacheMode::Enabled);
    assert_eq!(cached.cache.misses, 0);
    assert_eq!(cached.cache.hits, cached.methods);
    assert_eq!(container(&first), container(&second));
    assert_eq!(
        std::fs::read_to_string(first.join(MAP_FILE)).unwrap(),
        std::fs::read_to_string(second.join(MAP_FILE)).unwrap()
    );
}

#[test]
fn test_cache_modes_produce_identical_containers() {
    let directory = tempfile::tempdir().unwrap();
    let inputs = write_inputs(directory.path(), "Run");
    let previous = directory.path().join("previous");
    build_into(&inputs, &previous, None, CacheMode::Enabled);

    let mut outputs = Vec::new();
    for (name, mode) in [("disabled", CacheMode::Disabled), ("advisory", CacheMode::Advisory), ("enabled", CacheMode::Enabled)] {
        let output = directory.path().join(name);
        let report = build_into(&inputs, &output, Some(&previous), mode);
        match mode {
            CacheMode::Disabled => assert_eq!(report.cache.lookups(), 0),
            _ => assert_eq!(report.cache.hits, report.methods),
        }
        outputs.push(container(&output));
    }
    assert_eq!(outputs[0], outputs[1]);
    assert_eq!(outputs[1], outputs[2]);
}

#[test]
fn test_changed_input_is_recompiled() {
    let directory = tempfile::tempdir().unwrap();
    let inputs = write_inputs(directory.path(), "Run");
    let previous = directory.path().join("previous");
    build_into(&inputs, &previous, None, CacheMode::Disabled);

    // Renaming a method changes the application input only
    std::fs::write(&inputs[1], application("Go").to_string()).unwrap();
    let cached_output = directory.path().join("cached");
    let report = build_into(&inputs, &cached_output, Some(&previous), CacheMode::Enabled);
    assert_eq!(report.cache.hits, 1);
    assert_eq!(report.cache.misses, report.methods - 1);

    let fresh_output = directory.path().join("fresh");
    build_into(&inputs, &fresh_output, None, CacheMode::Disabled);
    assert_eq!(container(&cached_output), container(&fresh_output));

    let dex = reader::read(&container(&cached_output)).unwrap();
    assert!(dex
        .class(&ClassReference::new("Lapp/Program;"))
        .is_some_and(|class| class.methods.iter().any(|m| m.reference.name == "Go")));
}

#[test]
fn test_unchanged_rebuild_with_delegate_hits_every_method() {
    let directory = tempfile::tempdir().unwrap();
    let input = directory.path().join("Events.json");
    std::fs::write(&input, events().to_string()).unwrap();
    let inputs = vec![input];
    let first = directory.path().join("first");
    let fresh = build_into(&inputs, &first, None, CacheMode::Disabled);

    let dex = reader::read(&container(&first)).unwrap();
    let instance = dex
        .classes
        .iter()
        .find(|class| class.class.descriptor().starts_with("Lev/Program$$Delegate$"))
        .unwrap();
    assert_eq!(instance.superclass, Some(ClassReference::new("Lev/Handler;")));
    let names: Vec<&str> = instance.methods.iter().map(|m| m.reference.name.as_str()).collect();
    assert_eq!(names, vec!["<init>", "Invoke"]);

    let second = directory.path().join("second");
    let cached = build_into(&inputs, &second, Some(&first), CacheMode::Enabled);
    assert_eq!(cached.methods, fresh.methods);
    assert_eq!(cached.cache.misses, 0);
    assert_eq!(cached.cache.hits, cached.methods);
    assert_eq!(container(&first), container(&second));
    assert_eq!(
        std::fs::read_to_string(first.join(MAP_FILE)).unwrap(),
        std::fs::read_to_string(second.join(MAP_FILE)).unwrap()
    );
}
