mod support;

use sable_bytecode::{Assembler, Chunk, ChunkFlags, Constant, FrameLayout, Opcode, Operand};
use sable_vm_runtime::{MachineConfig, Panic, Value};

use support::{body, define, finish_module, function, imm, int, machine, machine_with, module_of, sym};

/// f(x): try { return 10 / x } recover { return -1 }
fn guarded_divide() -> Chunk {
    let mut assembler = Assembler::new();
    let start = assembler.position();
    assembler.emit(Opcode::PushInt, vec![int(10)]).expect("ten");
    assembler.emit(Opcode::GetLocal, vec![imm(0)]).expect("x");
    assembler.emit_op(Opcode::Div).expect("divide");
    let end = assembler.position();
    assembler.emit_op(Opcode::Return).expect("return quotient");
    let recovery = assembler.position();
    assembler.emit(Opcode::PushInt, vec![int(-1)]).expect("fallback");
    assembler.emit_op(Opcode::Return).expect("return fallback");
    assembler
        .guard(start, end, recovery, Some(1))
        .expect("guard");
    assembler
        .assemble(FrameLayout::function("f", 1, 2))
        .expect("assemble")
}

#[test]
fn guarded_division_by_zero_returns_fallback() {
    let mut machine = machine();
    machine
        .register_module("main", &module_of("main", vec![("f", guarded_divide())]))
        .expect("register");

    let fallback = machine.call("main", "f", vec![Value::Integer(0)]);
    assert_eq!(fallback.and_then(|value| value.as_int()), Some(-1));
    let quotient = machine.call("main", "f", vec![Value::Integer(5)]);
    assert_eq!(quotient.and_then(|value| value.as_int()), Some(2));
    assert_eq!(machine.status(), 0);
}

#[test]
fn recovery_keeps_the_frame_and_stores_the_payload() {
    // catcher(): local 0 = "before"; try { thrower() } recover(e -> local 1)
    // return [local 0, local 1]
    let thrower = function(
        "thrower",
        0,
        0,
        &[
            (Opcode::Push, vec![sym("boom")]),
            (Opcode::Throw, vec![]),
        ],
    );
    let mut assembler = Assembler::new();
    assembler.push_constant(Constant::string("before")).expect("marker");
    assembler.emit(Opcode::SetLocal, vec![imm(0)]).expect("store marker");
    let start = assembler.position();
    assembler.emit(Opcode::PushInt, vec![int(99)]).expect("pending operand");
    assembler.emit(Opcode::GetGlobal, vec![sym("thrower")]).expect("callee");
    assembler.emit(Opcode::Call, vec![imm(0)]).expect("call");
    let end = assembler.position();
    assembler.emit_op(Opcode::Pop).expect("discard result");
    assembler.emit_op(Opcode::Pop).expect("discard pending");
    let recovery = assembler.position();
    assembler.emit(Opcode::GetLocal, vec![imm(0)]).expect("marker");
    assembler.emit(Opcode::GetLocal, vec![imm(1)]).expect("payload");
    assembler.emit(Opcode::MakeArray, vec![imm(2)]).expect("pair");
    assembler.emit_op(Opcode::Return).expect("return");
    assembler.guard(start, end, recovery, Some(1)).expect("guard");
    let catcher = assembler
        .assemble(FrameLayout::function("catcher", 0, 2))
        .expect("assemble");

    let mut machine = machine();
    machine
        .register_module(
            "main",
            &module_of("main", vec![("thrower", thrower), ("catcher", catcher)]),
        )
        .expect("register");
    let pair = machine
        .call("main", "catcher", vec![])
        .and_then(|value| value.to_vec())
        .expect("catcher returns a pair");
    assert_eq!(pair.len(), 2, "pending operand was trimmed from the stack");
    assert_eq!(pair[0].as_str(), Some("before"));
    assert_eq!(pair[1].as_str(), Some("boom"));
}

#[test]
fn guard_range_excludes_its_start_offset() {
    // The guard covers (start, end]; a fault in an instruction ending exactly
    // at `start` is outside it.
    let mut assembler = Assembler::new();
    assembler.push_constant(Constant::string("early")).expect("payload");
    assembler.emit_op(Opcode::Throw).expect("throw");
    let start = assembler.position();
    assembler.emit_op(Opcode::Nop).expect("nop");
    let end = assembler.position();
    let recovery = assembler.position();
    assembler.push_constant(Constant::None).expect("none");
    assembler.emit_op(Opcode::Return).expect("return");
    assembler.guard(start, end, recovery, None).expect("guard");
    let early = assembler
        .assemble(FrameLayout::function("early", 0, 0))
        .expect("assemble");

    let mut machine = machine();
    machine
        .register_module("main", &module_of("main", vec![("early", early)]))
        .expect("register");
    assert!(machine.call("main", "early", vec![]).is_none());
    assert_eq!(
        machine.last_halt().and_then(Panic::message),
        Some("early")
    );
}

#[test]
fn panics_cross_native_reentry_to_an_outer_guard() {
    // outer(): try { call(thrower) } recover(e) { return e }
    let thrower = function(
        "thrower",
        0,
        0,
        &[
            (Opcode::Push, vec![sym("inner")]),
            (Opcode::Throw, vec![]),
        ],
    );
    let mut assembler = Assembler::new();
    let start = assembler.position();
    assembler.emit(Opcode::GetGlobal, vec![sym("call")]).expect("native");
    assembler.emit(Opcode::GetGlobal, vec![sym("thrower")]).expect("callee");
    assembler.emit(Opcode::Call, vec![imm(1)]).expect("call");
    let end = assembler.position();
    assembler.emit_op(Opcode::Return).expect("return");
    let recovery = assembler.position();
    assembler.emit(Opcode::GetLocal, vec![imm(0)]).expect("payload");
    assembler.emit_op(Opcode::Return).expect("return payload");
    assembler.guard(start, end, recovery, Some(0)).expect("guard");
    let outer = assembler
        .assemble(FrameLayout::function("outer", 0, 1))
        .expect("assemble");

    let mut machine = machine();
    machine
        .register_module(
            "main",
            &module_of("main", vec![("thrower", thrower), ("outer", outer)]),
        )
        .expect("register");
    let payload = machine.call("main", "outer", vec![]).expect("recovered");
    assert_eq!(payload.as_str(), Some("inner"));
}

#[test]
fn fatal_panics_skip_guards() {
    let mut assembler = Assembler::new();
    let start = assembler.position();
    assembler.emit(Opcode::PushInt, vec![int(3)]).expect("not a class");
    assembler.emit_op(Opcode::New).expect("new");
    let end = assembler.position();
    assembler.emit_op(Opcode::Return).expect("return");
    let recovery = assembler.position();
    assembler.push_constant(Constant::None).expect("none");
    assembler.emit_op(Opcode::Return).expect("return");
    assembler.guard(start, end, recovery, None).expect("guard");
    let build = assembler
        .assemble(FrameLayout::function("build", 0, 0))
        .expect("assemble");

    let mut machine = machine();
    machine
        .register_module("main", &module_of("main", vec![("build", build)]))
        .expect("register");
    assert!(machine.call("main", "build", vec![]).is_none());
    let halt = machine.last_halt().expect("halted");
    assert!(!halt.recoverable);
    assert_eq!(halt.message(), Some("cannot instantiate int"));
    assert!(halt.report(3).starts_with("unrecovered fatal panic: cannot instantiate int"));
}

#[test]
fn throwing_none_is_itself_a_panic() {
    let thrower = function(
        "thrower",
        0,
        0,
        &[(Opcode::Push, vec![Operand::Constant(Constant::None)]), (Opcode::Throw, vec![])],
    );
    let mut machine = machine();
    machine
        .register_module("main", &module_of("main", vec![("thrower", thrower)]))
        .expect("register");
    assert!(machine.call("main", "thrower", vec![]).is_none());
    assert_eq!(
        machine.last_halt().and_then(Panic::message),
        Some("cannot throw none")
    );
}

#[test]
fn arity_errors_name_the_function_and_counts() {
    let identity = function(
        "identity",
        1,
        1,
        &[(Opcode::GetLocal, vec![imm(0)]), (Opcode::Return, vec![])],
    );
    let mut machine = machine();
    machine
        .register_module("main", &module_of("main", vec![("identity", identity)]))
        .expect("register");
    let outcome = machine.call(
        "main",
        "identity",
        vec![Value::Integer(1), Value::Integer(2)],
    );
    assert!(outcome.is_none());
    assert_eq!(
        machine.last_halt().and_then(Panic::message),
        Some("identity() takes 1 argument(s) but 2 were given")
    );
}

#[test]
fn variadic_functions_pack_the_tail() {
    // collect(first, rest...) returns rest
    let mut assembler = Assembler::new();
    assembler.emit(Opcode::GetLocal, vec![imm(1)]).expect("rest");
    assembler.emit_op(Opcode::Return).expect("return");
    let collect = assembler
        .assemble(FrameLayout::function("collect", 2, 2).with_flags(ChunkFlags::VARIADIC))
        .expect("assemble");

    let mut machine = machine();
    machine
        .register_module("main", &module_of("main", vec![("collect", collect)]))
        .expect("register");

    let rest = machine
        .call(
            "main",
            "collect",
            vec![Value::Integer(1), Value::Integer(2), Value::Integer(3)],
        )
        .and_then(|value| value.to_vec())
        .expect("array of the tail");
    let rest: Vec<i64> = rest.iter().filter_map(Value::as_int).collect();
    assert_eq!(rest, vec![2, 3]);

    let empty = machine
        .call("main", "collect", vec![Value::Integer(1)])
        .and_then(|value| value.to_vec())
        .expect("empty tail");
    assert!(empty.is_empty());

    assert!(machine.call("main", "collect", vec![]).is_none());
    assert_eq!(
        machine.last_halt().and_then(Panic::message),
        Some("collect() takes at least 1 argument(s) but 0 were given")
    );
}

#[test]
fn captured_values_precede_arguments() {
    // add_base = MAKE_FUNCTION(body, captures [100]); add_base(5) == 105
    let adder = function(
        "add_base",
        1,
        2,
        &[
            (Opcode::GetLocal, vec![imm(0)]),
            (Opcode::GetLocal, vec![imm(1)]),
            (Opcode::Add, vec![]),
            (Opcode::Return, vec![]),
        ],
    );
    let adder = Chunk {
        bound_arg_count: 1,
        ..adder
    };
    let mut assembler = Assembler::new();
    assembler.emit(Opcode::PushInt, vec![int(100)]).expect("capture");
    assembler
        .emit(Opcode::MakeFunction, vec![body(adder), imm(1)])
        .expect("make function");
    assembler.emit(Opcode::SetGlobal, vec![sym("add_base")]).expect("store");
    let main = finish_module(assembler, "main", 0);

    let mut machine = machine();
    machine.register_module("main", &main).expect("register");
    let value = machine.call("main", "add_base", vec![Value::Integer(5)]);
    assert_eq!(value.and_then(|value| value.as_int()), Some(105));
}

#[test]
fn runaway_recursion_overflows_with_a_collapsed_trace() {
    let mut assembler = Assembler::new();
    define(
        &mut assembler,
        "recurse",
        function(
            "recurse",
            0,
            0,
            &[
                (Opcode::GetGlobal, vec![sym("recurse")]),
                (Opcode::Call, vec![imm(0)]),
                (Opcode::Return, vec![]),
            ],
        ),
    );
    let main = finish_module(assembler, "main", 0);

    let mut machine = machine_with(MachineConfig {
        max_call_depth: 16,
        search_roots: Vec::new(),
        ..MachineConfig::default()
    });
    machine.register_module("main", &main).expect("register");
    assert!(machine.call("main", "recurse", vec![]).is_none());
    assert_eq!(machine.status(), 1);

    let halt = machine.last_halt().expect("halted");
    assert!(halt.recoverable);
    assert_eq!(halt.message(), Some("stack overflow: call depth exceeds 16"));
    assert_eq!(halt.trace.len(), 16);
    assert_eq!(
        halt.collapsed_trace(3),
        vec![
            "at recurse in main@4".to_owned(),
            "at recurse in main@4".to_owned(),
            "at recurse in main@4".to_owned(),
            "... 13 more identical frame(s) omitted".to_owned(),
        ]
    );
}

#[test]
fn collapsing_only_folds_consecutive_runs() {
    let mut panic = Panic::recoverable("x");
    panic.trace = ["a", "a", "b", "a", "a", "a", "a"]
        .iter()
        .map(|line| line.to_string())
        .collect();
    assert_eq!(
        panic.collapsed_trace(2),
        vec!["a", "a", "b", "a", "a", "... 2 more identical frame(s) omitted"]
    );
    assert_eq!(
        panic.report(2).lines().next(),
        Some("unrecovered panic: x")
    );
}

/// recurse() { return recurse() }
fn self_recursive() -> Chunk {
    function(
        "recurse",
        0,
        0,
        &[
            (Opcode::GetGlobal, vec![sym("recurse")]),
            (Opcode::Call, vec![imm(0)]),
            (Opcode::Return, vec![]),
        ],
    )
}

/// catcher(): try { return <global callee>() } recover(e) { return e }
fn catching(callee: &str) -> Chunk {
    let mut assembler = Assembler::new();
    let start = assembler.position();
    assembler.emit(Opcode::GetGlobal, vec![sym(callee)]).expect("callee");
    assembler.emit(Opcode::Call, vec![imm(0)]).expect("call");
    let end = assembler.position();
    assembler.emit_op(Opcode::Return).expect("return");
    let recovery = assembler.position();
    assembler.emit(Opcode::GetLocal, vec![imm(0)]).expect("payload");
    assembler.emit_op(Opcode::Return).expect("return payload");
    assembler.guard(start, end, recovery, Some(0)).expect("guard");
    assembler
        .assemble(FrameLayout::function("catcher", 0, 1))
        .expect("assemble")
}

#[test]
fn guards_catch_call_depth_overflow() {
    let main = module_of(
        "main",
        vec![("recurse", self_recursive()), ("catcher", catching("recurse"))],
    );
    let mut machine = machine_with(MachineConfig {
        max_call_depth: 16,
        search_roots: Vec::new(),
        ..MachineConfig::default()
    });
    machine.register_module("main", &main).expect("register");

    let payload = machine.call("main", "catcher", vec![]).expect("recovered");
    assert_eq!(payload.as_str(), Some("stack overflow: call depth exceeds 16"));
    assert_eq!(machine.status(), 0);

    // The machine is still usable once the overflow has been absorbed.
    let again = machine.call("main", "catcher", vec![]).expect("recovered again");
    assert_eq!(again.as_str(), Some("stack overflow: call depth exceeds 16"));
}

/// g() { return call(g) }
fn reentrant() -> Chunk {
    function(
        "g",
        0,
        0,
        &[
            (Opcode::GetGlobal, vec![sym("call")]),
            (Opcode::GetGlobal, vec![sym("g")]),
            (Opcode::Call, vec![imm(1)]),
            (Opcode::Return, vec![]),
        ],
    )
}

#[test]
fn native_reentry_is_bounded_by_a_recoverable_overflow() {
    let config = MachineConfig {
        max_native_reentry: 16,
        search_roots: Vec::new(),
        ..MachineConfig::default()
    };

    let mut machine = machine_with(config.clone());
    machine
        .register_module("main", &module_of("main", vec![("g", reentrant())]))
        .expect("register");
    assert!(machine.call("main", "g", vec![]).is_none());
    assert_eq!(machine.status(), 1);
    let halt = machine.last_halt().expect("halted");
    assert!(halt.recoverable);
    assert_eq!(halt.message(), Some("stack overflow: native re-entry exceeds 16"));
    // Each level leaves a `g` frame and the native `call` frame above it.
    assert_eq!(halt.trace.len(), 32);
    assert_eq!(halt.trace[0], "at native call");

    let mut machine = machine_with(config);
    machine
        .register_module(
            "main",
            &module_of("main", vec![("g", reentrant()), ("catcher", catching("g"))]),
        )
        .expect("register");
    let payload = machine.call("main", "catcher", vec![]).expect("recovered");
    assert_eq!(payload.as_str(), Some("stack overflow: native re-entry exceeds 16"));
    assert_eq!(machine.status(), 0);
}

#[test]
fn panics_crossing_native_reentry_are_profiled_once() {
    // outer(): try { call(thrower) } recover(e) { return e }
    let thrower = function(
        "thrower",
        0,
        0,
        &[
            (Opcode::Push, vec![sym("inner")]),
            (Opcode::Throw, vec![]),
        ],
    );
    let mut assembler = Assembler::new();
    let start = assembler.position();
    assembler.emit(Opcode::GetGlobal, vec![sym("call")]).expect("native");
    assembler.emit(Opcode::GetGlobal, vec![sym("thrower")]).expect("callee");
    assembler.emit(Opcode::Call, vec![imm(1)]).expect("call");
    let end = assembler.position();
    assembler.emit_op(Opcode::Return).expect("return");
    let recovery = assembler.position();
    assembler.emit(Opcode::GetLocal, vec![imm(0)]).expect("payload");
    assembler.emit_op(Opcode::Return).expect("return payload");
    assembler.guard(start, end, recovery, Some(0)).expect("guard");
    let outer = assembler
        .assemble(FrameLayout::function("outer", 0, 1))
        .expect("assemble");

    let mut machine = machine_with(MachineConfig {
        profile: true,
        search_roots: Vec::new(),
        ..MachineConfig::default()
    });
    machine
        .register_module(
            "main",
            &module_of("main", vec![("thrower", thrower), ("outer", outer)]),
        )
        .expect("register");
    let payload = machine.call("main", "outer", vec![]).expect("recovered");
    assert_eq!(payload.as_str(), Some("inner"));

    let report = machine.profile_report().expect("profiling enabled");
    assert_eq!(report.panics_raised, 1);
    assert_eq!(report.panics_recovered, 1);
}
