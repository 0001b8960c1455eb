#![allow(dead_code)]

use std::cell::RefCell;
use std::io::{self, Write};
use std::rc::Rc;

use sable_bytecode::{Assembler, Chunk, Constant, FrameLayout, Opcode, Operand};
use sable_vm_runtime::{Machine, MachineConfig};

pub fn sym(name: &str) -> Operand {
    Operand::Constant(Constant::string(name))
}

pub fn int(value: i32) -> Operand {
    Operand::Imm32(value)
}

pub fn imm(value: u8) -> Operand {
    Operand::Imm8(value)
}

pub fn body(chunk: Chunk) -> Operand {
    Operand::Constant(Constant::chunk(chunk))
}

/// Machine with no file-system search roots.
pub fn machine() -> Machine {
    machine_with(MachineConfig {
        search_roots: Vec::new(),
        ..MachineConfig::default()
    })
}

pub fn machine_with(config: MachineConfig) -> Machine {
    Machine::new(config)
}

/// Emit `MAKE_FUNCTION chunk 0; SET_GLOBAL name`.
pub fn define(assembler: &mut Assembler, name: &str, chunk: Chunk) {
    assembler
        .emit(Opcode::MakeFunction, vec![body(chunk), imm(0)])
        .expect("make function");
    assembler
        .emit(Opcode::SetGlobal, vec![sym(name)])
        .expect("set global");
}

/// Finish a module body with `PUSH none; RETURN` and assemble it.
pub fn finish_module(mut assembler: Assembler, name: &str, locals: u8) -> Chunk {
    assembler
        .push_constant(Constant::None)
        .expect("push none");
    assembler.emit_op(Opcode::Return).expect("return");
    assembler
        .assemble(FrameLayout::module(name, locals))
        .expect("module assembles")
}

/// Module whose body only defines the given functions as globals.
pub fn module_of(name: &str, functions: Vec<(&str, Chunk)>) -> Chunk {
    let mut assembler = Assembler::new();
    for (global, chunk) in functions {
        define(&mut assembler, global, chunk);
    }
    finish_module(assembler, name, 0)
}

/// Function whose body is `steps` followed by nothing else.
pub fn function(
    name: &str,
    arg_count: u8,
    locals: u8,
    steps: &[(Opcode, Vec<Operand>)],
) -> Chunk {
    let mut assembler = Assembler::new();
    for (opcode, operands) in steps {
        assembler
            .emit(*opcode, operands.clone())
            .unwrap_or_else(|error| panic!("emit {opcode:?}: {error}"));
    }
    assembler
        .assemble(FrameLayout::function(name, arg_count, locals))
        .expect("function assembles")
}

/// Print sink shared between the test and the machine.
#[derive(Clone, Default)]
pub struct Output(Rc<RefCell<Vec<u8>>>);

impl Output {
    pub fn attach(machine: &mut Machine) -> Output {
        let output = Output::default();
        machine.set_output(Box::new(output.clone()));
        output
    }

    pub fn text(&self) -> String {
        String::from_utf8(self.0.borrow().clone()).expect("utf-8 output")
    }
}

impl Write for Output {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
