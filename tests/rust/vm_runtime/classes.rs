mod support;

use std::rc::Rc;

use sable_bytecode::{Assembler, Chunk, ChunkFlags, Constant, FrameLayout, Opcode};
use sable_vm_runtime::{Class, Instance, Panic, Value, VmError};

use support::{body, define, finish_module, function, imm, int, machine, sym};

fn names(class: &Class) -> Vec<String> {
    class
        .resolution_names()
        .iter()
        .map(|name| name.to_string())
        .collect()
}

#[test]
fn diamond_linearizes_breadth_first_with_front_insertion() {
    let a = Class::new("A", vec![]);
    let b = Class::new("B", vec![a.clone()]);
    let c = Class::new("C", vec![a.clone()]);
    let d = Class::new("D", vec![b.clone(), c.clone()]);

    assert_eq!(names(&d), vec!["D", "B", "A", "C"]);
    assert_eq!(names(&a), vec!["A"]);
    assert!(d.is_derived_from(&a));
    assert!(d.is_derived_from(&c));
    assert!(!b.is_derived_from(&c));
}

#[test]
fn lookup_follows_resolution_order() {
    let a = Class::new("A", vec![]);
    a.set_attribute(Rc::from("x"), Value::Integer(1));
    a.set_attribute(Rc::from("only_a"), Value::from("a"));
    let b = Class::new("B", vec![a.clone()]);
    b.set_attribute(Rc::from("x"), Value::Integer(2));
    let c = Class::new("C", vec![a.clone()]);
    c.set_attribute(Rc::from("x"), Value::Integer(3));
    c.set_attribute(Rc::from("y"), Value::Integer(4));
    let d = Class::new("D", vec![b, c]);

    assert_eq!(d.lookup("x").and_then(|value| value.as_int()), Some(2));
    assert_eq!(d.lookup("y").and_then(|value| value.as_int()), Some(4));
    assert!(d.lookup("z").is_none());

    let flattened = d.flattened();
    assert_eq!(flattened.get("x").and_then(Value::as_int), Some(2));
    assert_eq!(flattened.get("only_a").and_then(Value::as_str), Some("a"));

    let instance = Instance::new(d.clone());
    instance.set_attribute(Rc::from("x"), Value::Integer(9));
    assert_eq!(instance.attribute("x").and_then(|value| value.as_int()), Some(9));
    assert_eq!(d.lookup("x").and_then(|value| value.as_int()), Some(2));
}

#[test]
fn subclass_links_do_not_keep_classes_alive() {
    let a = Class::new("A", vec![]);
    let b = Class::new("B", vec![a.clone()]);
    let c = Class::new("C", vec![a.clone()]);
    assert_eq!(a.subclasses().len(), 2);

    drop(c);
    let remaining = a.subclasses();
    assert_eq!(remaining.len(), 1);
    assert!(Rc::ptr_eq(&remaining[0], &b));
}

/// Class body defining `method(self)` that returns `result`.
fn class_body(class: &str, method: &str, result: &str) -> Chunk {
    let method_chunk = function(
        method,
        1,
        1,
        &[(Opcode::Push, vec![sym(result)]), (Opcode::Return, vec![])],
    );
    let mut assembler = Assembler::new();
    assembler.emit(Opcode::GetLocal, vec![imm(0)]).expect("class");
    assembler
        .emit(Opcode::MakeFunction, vec![body(method_chunk), imm(0)])
        .expect("method");
    assembler
        .emit(Opcode::SetAttribute, vec![sym(method)])
        .expect("attach");
    assembler.push_constant(Constant::None).expect("none");
    assembler.emit_op(Opcode::Return).expect("return");
    let layout = FrameLayout {
        locals_count: 1,
        ..FrameLayout::new(class)
    };
    assembler
        .assemble(layout.with_flags(ChunkFlags::CLASS))
        .expect("class body")
}

/// Emit `MAKE_CLASS name body n; SET_GLOBAL name` with the named globals as bases.
fn declare_class(assembler: &mut Assembler, name: &str, bases: &[&str], body_chunk: Chunk) {
    for base in bases {
        assembler
            .emit(Opcode::GetGlobal, vec![sym(base)])
            .expect("base");
    }
    assembler
        .emit(
            Opcode::MakeClass,
            vec![sym(name), body(body_chunk), imm(bases.len() as u8)],
        )
        .expect("make class");
    assembler
        .emit(Opcode::SetGlobal, vec![sym(name)])
        .expect("store class");
}

/// Module with `Base.name -> "base"` and `Derived(Base).name -> "derived"`.
fn hierarchy(extra: Vec<(&str, Chunk)>) -> Chunk {
    let mut assembler = Assembler::new();
    declare_class(&mut assembler, "Base", &[], class_body("Base", "name", "base"));
    declare_class(
        &mut assembler,
        "Derived",
        &["Base"],
        class_body("Derived", "name", "derived"),
    );
    for (name, chunk) in extra {
        define(&mut assembler, name, chunk);
    }
    finish_module(assembler, "shapes", 0)
}

#[test]
fn class_bodies_run_and_methods_bind_to_instances() {
    // make(): d = Derived(); d.value = 7; return [d.name(), d.value]
    let make = function(
        "make",
        0,
        1,
        &[
            (Opcode::GetGlobal, vec![sym("Derived")]),
            (Opcode::New, vec![]),
            (Opcode::SetLocal, vec![imm(0)]),
            (Opcode::GetLocal, vec![imm(0)]),
            (Opcode::PushInt, vec![int(7)]),
            (Opcode::SetAttribute, vec![sym("value")]),
            (Opcode::GetLocal, vec![imm(0)]),
            (Opcode::GetAttribute, vec![sym("name")]),
            (Opcode::Call, vec![imm(0)]),
            (Opcode::GetLocal, vec![imm(0)]),
            (Opcode::GetAttribute, vec![sym("value")]),
            (Opcode::MakeArray, vec![imm(2)]),
            (Opcode::Return, vec![]),
        ],
    );
    let mut machine = machine();
    machine
        .register_module("shapes", &hierarchy(vec![("make", make)]))
        .expect("register");

    let result = machine
        .call("shapes", "make", vec![])
        .and_then(|value| value.to_vec())
        .expect("pair");
    assert_eq!(result[0].as_str(), Some("derived"));
    assert_eq!(result[1].as_int(), Some(7));

    let module = machine.module("shapes").expect("loaded");
    let Some(Value::Class(derived)) = module.global("Derived") else {
        panic!("Derived should be a class");
    };
    assert_eq!(names(&derived), vec!["Derived", "Base"]);
    let Some(Value::Class(base)) = module.global("Base") else {
        panic!("Base should be a class");
    };
    assert_eq!(base.subclasses().len(), 1);
}

#[test]
fn super_reads_from_the_base_and_instance_of_scans_the_order() {
    // both(): d = Derived(); return [d.name(), super(d, Base).name(),
    //                                d instanceof Base, Base() instanceof Derived]
    let both = function(
        "both",
        0,
        1,
        &[
            (Opcode::GetGlobal, vec![sym("Derived")]),
            (Opcode::New, vec![]),
            (Opcode::SetLocal, vec![imm(0)]),
            (Opcode::GetLocal, vec![imm(0)]),
            (Opcode::GetAttribute, vec![sym("name")]),
            (Opcode::Call, vec![imm(0)]),
            (Opcode::GetLocal, vec![imm(0)]),
            (Opcode::GetGlobal, vec![sym("Base")]),
            (Opcode::Super, vec![]),
            (Opcode::GetAttribute, vec![sym("name")]),
            (Opcode::Call, vec![imm(0)]),
            (Opcode::GetLocal, vec![imm(0)]),
            (Opcode::GetGlobal, vec![sym("Base")]),
            (Opcode::InstanceOf, vec![]),
            (Opcode::GetGlobal, vec![sym("Base")]),
            (Opcode::New, vec![]),
            (Opcode::GetGlobal, vec![sym("Derived")]),
            (Opcode::InstanceOf, vec![]),
            (Opcode::MakeArray, vec![imm(4)]),
            (Opcode::Return, vec![]),
        ],
    );
    let mut machine = machine();
    machine
        .register_module("shapes", &hierarchy(vec![("both", both)]))
        .expect("register");
    let result = machine
        .call("shapes", "both", vec![])
        .and_then(|value| value.to_vec())
        .expect("four results");
    assert_eq!(result[0].as_str(), Some("derived"));
    assert_eq!(result[1].as_str(), Some("base"));
    assert_eq!(result[2].as_bool(), Some(true));
    assert_eq!(result[3].as_bool(), Some(false));
}

#[test]
fn proxy_writes_land_on_the_instance() {
    // poke(): d = Derived(); super(d, Base).tag = "set"; return d.tag
    let poke = function(
        "poke",
        0,
        1,
        &[
            (Opcode::GetGlobal, vec![sym("Derived")]),
            (Opcode::New, vec![]),
            (Opcode::SetLocal, vec![imm(0)]),
            (Opcode::GetLocal, vec![imm(0)]),
            (Opcode::GetGlobal, vec![sym("Base")]),
            (Opcode::Super, vec![]),
            (Opcode::Push, vec![sym("set")]),
            (Opcode::SetAttribute, vec![sym("tag")]),
            (Opcode::GetLocal, vec![imm(0)]),
            (Opcode::GetAttribute, vec![sym("tag")]),
            (Opcode::Return, vec![]),
        ],
    );
    let mut machine = machine();
    machine
        .register_module("shapes", &hierarchy(vec![("poke", poke)]))
        .expect("register");
    let tag = machine.call("shapes", "poke", vec![]).expect("tag");
    assert_eq!(tag.as_str(), Some("set"));
}

#[test]
fn super_on_an_unrelated_class_is_fatal() {
    // Base() viewed as Derived
    let wrong = function(
        "wrong",
        0,
        0,
        &[
            (Opcode::GetGlobal, vec![sym("Base")]),
            (Opcode::New, vec![]),
            (Opcode::GetGlobal, vec![sym("Derived")]),
            (Opcode::Super, vec![]),
            (Opcode::Return, vec![]),
        ],
    );
    let mut machine = machine();
    machine
        .register_module("shapes", &hierarchy(vec![("wrong", wrong)]))
        .expect("register");
    assert!(machine.call("shapes", "wrong", vec![]).is_none());
    let halt = machine.last_halt().expect("halted");
    assert!(!halt.recoverable);
    assert_eq!(halt.message(), Some("Base is not derived from Derived"));
}

#[test]
fn invalid_bases_abort_class_creation() {
    let empty = || {
        let mut assembler = Assembler::new();
        assembler.push_constant(Constant::None).expect("none");
        assembler.emit_op(Opcode::Return).expect("return");
        assembler
            .assemble(FrameLayout::new("Empty").with_flags(ChunkFlags::CLASS))
            .expect("body")
    };

    let mut not_a_class = Assembler::new();
    not_a_class
        .push_constant(Constant::Integer(3))
        .expect("bogus base");
    not_a_class
        .emit(Opcode::MakeClass, vec![sym("Bad"), body(empty()), imm(1)])
        .expect("make class");
    not_a_class.emit_op(Opcode::Pop).expect("pop");
    let not_a_class = finish_module(not_a_class, "bad", 0);

    let mut duplicate = Assembler::new();
    declare_class(&mut duplicate, "Root", &[], empty());
    declare_class(&mut duplicate, "Twice", &["Root", "Root"], empty());
    let duplicate = finish_module(duplicate, "twice", 0);

    let mut machine = machine();
    machine.register_module("bad", &not_a_class).expect("register");
    machine.register_module("twice", &duplicate).expect("register");

    assert!(matches!(machine.load_module("bad"), Err(VmError::Halted { .. })));
    assert_eq!(
        machine.last_halt().and_then(Panic::message),
        Some("class Bad cannot inherit from int")
    );
    assert!(machine.module("bad").is_none());

    assert!(matches!(machine.load_module("twice"), Err(VmError::Halted { .. })));
    let halt = machine.last_halt().expect("halted");
    assert!(!halt.recoverable);
    assert_eq!(halt.message(), Some("class Twice lists base Root more than once"));
}
