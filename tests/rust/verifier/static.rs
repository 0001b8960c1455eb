use sable_bytecode::{
    Assembler, Chunk, ChunkFlags, Constant, FrameLayout, Guard, Opcode, Operand, MAX_CHUNK_NESTING,
};
use sable_verifier::{seal, verify, verify_tree, VerifyError, ViolationKind};

fn raw_chunk(code: Vec<u8>, constants: Vec<Constant>) -> Chunk {
    Chunk {
        code,
        constants,
        locals_count: 1,
        ..Chunk::default()
    }
}

fn kinds(chunk: &Chunk) -> Vec<ViolationKind> {
    verify(chunk)
        .expect("code should decode")
        .violations
        .iter()
        .map(|violation| violation.kind)
        .collect()
}

fn if_else_chunk() -> Chunk {
    let mut assembler = Assembler::new();
    assembler
        .emit(Opcode::GetLocal, vec![Operand::Imm8(0)])
        .expect("condition");
    let otherwise = assembler.jump(Opcode::JumpIfFalse).expect("branch");
    assembler
        .emit(Opcode::PushInt, vec![Operand::Imm32(1)])
        .expect("then");
    let done = assembler.jump(Opcode::Jump).expect("skip else");
    assembler.bind(otherwise).expect("else");
    assembler
        .emit(Opcode::PushInt, vec![Operand::Imm32(2)])
        .expect("else");
    assembler.bind(done).expect("join");
    assembler.emit_op(Opcode::Return).expect("return");
    assembler
        .assemble(FrameLayout::function("choose", 1, 1))
        .expect("assemble")
}

#[test]
fn accepts_assembled_branches() {
    let chunk = if_else_chunk();
    let report = verify(&chunk).expect("decode");
    assert!(report.ok(), "unexpected violations: {:?}", report.violations);
    assert_eq!(report.max_stack, 1);
    assert_eq!(report.final_stack, 0);
    assert!(report.summary().ok);
}

#[test]
fn reports_jump_into_the_middle_of_an_instruction() {
    // PUSH_INT 7; JUMP -4 (lands on byte 2, inside PUSH_INT); RETURN
    let code = vec![
        Opcode::PushInt as u8,
        0,
        0,
        0,
        7,
        Opcode::Jump as u8,
        0xff,
        0xfc,
        Opcode::Return as u8,
    ];
    let report = verify(&raw_chunk(code, vec![])).expect("decode");
    let summary = report.summary();
    assert!(!summary.ok);
    assert_eq!(summary.first_violation_kind, Some(ViolationKind::MisalignedJump));
    assert_eq!(summary.first_violation_subject, 5);
    assert_eq!(report.violations[0].observed, 4);
    assert!(report.violations[0].message.contains("not an instruction boundary"));
}

#[test]
fn reports_underflow_and_dup_out_of_range() {
    let code = vec![
        Opcode::PushInt as u8,
        0,
        0,
        0,
        1,
        Opcode::DupAt as u8,
        1,
        Opcode::Add as u8,
        Opcode::Add as u8,
        Opcode::Return as u8,
    ];
    assert_eq!(
        kinds(&raw_chunk(code, vec![])),
        vec![ViolationKind::DupOutOfRange, ViolationKind::StackUnderflow]
    );
}

#[test]
fn reports_disagreeing_depths_at_a_join() {
    // PUSH_INT 1; GET_LOCAL 0; JUMP_IF_TRUE +1; POP; RETURN
    // The branch reaches RETURN with one value, the fall-through with none.
    let code = vec![
        Opcode::PushInt as u8,
        0,
        0,
        0,
        1,
        Opcode::GetLocal as u8,
        0,
        Opcode::JumpIfTrue as u8,
        0,
        1,
        Opcode::Pop as u8,
        Opcode::Return as u8,
    ];
    let report = verify(&raw_chunk(code, vec![])).expect("decode");
    assert_eq!(report.violations.len(), 1);
    let violation = &report.violations[0];
    assert_eq!(violation.kind, ViolationKind::StackMismatch);
    assert_eq!(violation.subject, 11);
    assert_eq!((violation.observed, violation.expected), (0, 1));
    assert_eq!(report.final_stack, 0);
}

#[test]
fn reports_symbol_operands_that_are_not_strings() {
    let code = vec![
        Opcode::GetGlobal as u8,
        0,
        0,
        Opcode::Import as u8,
        0,
        1,
        Opcode::Pop as u8,
        Opcode::Return as u8,
    ];
    let chunk = raw_chunk(code, vec![Constant::Integer(4), Constant::string("math")]);
    let report = verify(&chunk).expect("decode");
    assert_eq!(report.violations.len(), 1);
    assert_eq!(report.violations[0].kind, ViolationKind::ConstantKind);
    assert_eq!(report.violations[0].subject, 0);
    assert!(report.violations[0]
        .message
        .contains("expects a string constant, found int"));
}

#[test]
fn reports_function_bodies_that_are_not_chunks() {
    let code = vec![
        Opcode::MakeFunction as u8,
        0,
        0,
        0,
        Opcode::Return as u8,
    ];
    let chunk = raw_chunk(code, vec![Constant::string("not code")]);
    assert_eq!(kinds(&chunk), vec![ViolationKind::ConstantKind]);
}

#[test]
fn reports_capture_count_mismatch() {
    let body = Chunk {
        code: vec![Opcode::PushInt as u8, 0, 0, 0, 0, Opcode::Return as u8],
        bound_arg_count: 2,
        locals_count: 2,
        ..Chunk::default()
    };
    let code = vec![
        Opcode::PushInt as u8,
        0,
        0,
        0,
        9,
        Opcode::MakeFunction as u8,
        0,
        0,
        1,
        Opcode::Return as u8,
    ];
    let chunk = raw_chunk(code, vec![Constant::chunk(body)]);
    assert_eq!(kinds(&chunk), vec![ViolationKind::BoundArity]);
}

#[test]
fn reports_guard_and_local_slot_problems() {
    let code = vec![
        Opcode::GetLocal as u8,
        3,
        Opcode::Return as u8,
    ];
    let mut chunk = raw_chunk(code, vec![]);
    chunk.guards = vec![
        Guard {
            start: 0,
            end: 3,
            recovery: 2,
            slot: Some(0),
        },
        Guard {
            start: 2,
            end: 2,
            recovery: 1,
            slot: Some(5),
        },
    ];
    assert_eq!(
        kinds(&chunk),
        vec![
            ViolationKind::GuardRange,
            ViolationKind::GuardRecovery,
            ViolationKind::GuardSlot,
            ViolationKind::LocalSlot,
        ]
    );
}

#[test]
fn verify_tree_visits_nested_chunks() {
    let inner = raw_chunk(vec![Opcode::Add as u8, Opcode::Return as u8], vec![]);
    let middle = Chunk {
        code: vec![Opcode::PushInt as u8, 0, 0, 0, 0, Opcode::Return as u8],
        constants: vec![Constant::chunk(inner)],
        ..Chunk::default()
    };
    let outer = raw_chunk(
        vec![Opcode::PushInt as u8, 0, 0, 0, 0, Opcode::Return as u8],
        vec![Constant::chunk(middle)],
    );

    let reports = verify_tree(&outer).expect("decode");
    let depths: Vec<usize> = reports.iter().map(|entry| entry.depth).collect();
    assert_eq!(depths, vec![0, 1, 2]);
    assert!(reports[0].report.ok());
    assert!(reports[1].report.ok());
    assert!(!reports[2].report.ok());
}

#[test]
fn seal_restores_max_stack_and_rejects_bad_trees() {
    let mut body = Assembler::new();
    for value in 0..3 {
        body.emit(Opcode::PushInt, vec![Operand::Imm32(value)])
            .expect("push");
    }
    body.emit(Opcode::MakeArray, vec![Operand::Imm8(3)])
        .expect("array");
    body.emit_op(Opcode::Return).expect("return");
    let mut body = body
        .assemble(FrameLayout::function("triple", 0, 0))
        .expect("body");
    body.max_stack = 0;
    let module = raw_chunk(
        vec![Opcode::Push as u8, 0, 0, Opcode::Return as u8],
        vec![Constant::chunk(body)],
    );

    let sealed = seal(&module).expect("tree is valid");
    assert_eq!(sealed.max_stack, 1);
    let nested = sealed.constants[0].as_chunk().expect("nested");
    assert_eq!(nested.max_stack, 3);

    let broken = raw_chunk(vec![Opcode::Pop as u8], vec![]);
    let wrapper = Chunk {
        code: vec![Opcode::Push as u8, 0, 0, Opcode::Return as u8],
        constants: vec![Constant::chunk(broken)],
        flags: ChunkFlags::MODULE,
        ..Chunk::default()
    };
    match seal(&wrapper) {
        Err(VerifyError::Rejected { summary, .. }) => {
            assert_eq!(summary.first_violation_kind, Some(ViolationKind::StackUnderflow));
        }
        other => panic!("expected rejection, got {other:?}"),
    }

    let undecodable = raw_chunk(vec![0xee], vec![]);
    assert!(matches!(seal(&undecodable), Err(VerifyError::Decode { .. })));
}

#[test]
fn recovery_code_starts_from_an_empty_stack() {
    // PUSH_INT 7; try { 1 / 0; POP } JUMP done; recover: POP; done: RETURN
    // The 7 is gone once the guard fires, so the POP at recovery underflows.
    let mut leaky = Assembler::new();
    leaky
        .emit(Opcode::PushInt, vec![Operand::Imm32(7)])
        .expect("pending");
    let start = leaky.position();
    leaky
        .emit(Opcode::PushInt, vec![Operand::Imm32(1)])
        .expect("dividend");
    leaky
        .emit(Opcode::PushInt, vec![Operand::Imm32(0)])
        .expect("divisor");
    leaky.emit_op(Opcode::Div).expect("divide");
    leaky.emit_op(Opcode::Pop).expect("discard quotient");
    let end = leaky.position();
    let done = leaky.jump(Opcode::Jump).expect("skip recovery");
    let recovery = leaky.position();
    leaky.emit_op(Opcode::Pop).expect("pop the pending value");
    leaky.bind(done).expect("join");
    leaky.emit_op(Opcode::Return).expect("return");
    leaky.guard(start, end, recovery, None).expect("guard");
    let leaky = leaky
        .assemble(FrameLayout::function("leaky", 0, 0))
        .expect("assembler tracks the fall-through depth only");
    assert!(kinds(&leaky).contains(&ViolationKind::StackUnderflow));
    assert!(matches!(seal(&leaky), Err(VerifyError::Rejected { .. })));

    // Recovery that rebuilds the value it returns joins `done` at depth 1.
    let mut rebuilt = Assembler::new();
    rebuilt
        .emit(Opcode::PushInt, vec![Operand::Imm32(7)])
        .expect("pending");
    let start = rebuilt.position();
    rebuilt
        .emit(Opcode::PushInt, vec![Operand::Imm32(1)])
        .expect("dividend");
    rebuilt
        .emit(Opcode::PushInt, vec![Operand::Imm32(0)])
        .expect("divisor");
    rebuilt.emit_op(Opcode::Div).expect("divide");
    rebuilt.emit_op(Opcode::Pop).expect("discard quotient");
    let end = rebuilt.position();
    let done = rebuilt.jump(Opcode::Jump).expect("skip recovery");
    let recovery = rebuilt.position();
    rebuilt
        .emit(Opcode::PushInt, vec![Operand::Imm32(-1)])
        .expect("fallback");
    rebuilt.bind(done).expect("join");
    rebuilt.emit_op(Opcode::Return).expect("return");
    rebuilt.guard(start, end, recovery, None).expect("guard");
    let rebuilt = rebuilt
        .assemble(FrameLayout::function("rebuilt", 0, 0))
        .expect("assemble");
    assert_eq!(kinds(&rebuilt), vec![]);
    let sealed = seal(&rebuilt).expect("clean");
    assert_eq!(sealed.max_stack, 3);
}

#[test]
fn chunk_trees_nested_past_the_limit_are_refused() {
    let mut chunk = raw_chunk(vec![Opcode::PushInt as u8, 0, 0, 0, 0, Opcode::Return as u8], vec![]);
    for _ in 0..=MAX_CHUNK_NESTING {
        chunk = raw_chunk(
            vec![Opcode::PushInt as u8, 0, 0, 0, 0, Opcode::Return as u8],
            vec![Constant::chunk(chunk)],
        );
    }
    assert!(matches!(
        verify_tree(&chunk),
        Err(VerifyError::TooDeep { limit: MAX_CHUNK_NESTING, .. })
    ));
    assert!(matches!(
        seal(&chunk),
        Err(VerifyError::TooDeep { limit: MAX_CHUNK_NESTING, .. })
    ));

    let Constant::Chunk(shallower) = &chunk.constants[0] else {
        panic!("nested chunk");
    };
    let reports = verify_tree(shallower).expect("at the limit");
    assert_eq!(reports.len(), MAX_CHUNK_NESTING + 1);
}
