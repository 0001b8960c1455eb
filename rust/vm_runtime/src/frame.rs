use std::rc::Rc;

use sable_bytecode::Chunk;

use crate::object::{Class, Module};
use crate::value::Value;

/// Why a frame exists; decides what its `RETURN` produces.
#[derive(Debug, Clone)]
pub enum FrameRole {
    Function,
    /// Module body run on behalf of the host.
    Module,
    /// Module body run by an `IMPORT` instruction.
    Import,
    /// Class body; the class is local 0 and is what the frame returns.
    Class(Rc<Class>),
    Native(Rc<str>),
}

/// Activation record on the call stack.
///
/// Native frames carry no chunk and no locals; they exist so a panic raised
/// inside a native can be attributed to it in the trace.
#[derive(Debug)]
pub struct Frame {
    pub module: Option<Rc<Module>>,
    pub chunk: Option<Rc<Chunk>>,
    pub locals: Vec<Value>,
    /// Operand stack height when the frame was entered.
    pub operand_base: usize,
    pub pc: usize,
    pub role: FrameRole,
}

impl Frame {
    pub fn script(
        module: Rc<Module>,
        chunk: Rc<Chunk>,
        locals: Vec<Value>,
        operand_base: usize,
        role: FrameRole,
    ) -> Self {
        Self {
            module: Some(module),
            chunk: Some(chunk),
            locals,
            operand_base,
            pc: 0,
            role,
        }
    }

    pub fn native(name: Rc<str>, operand_base: usize) -> Self {
        Self {
            module: None,
            chunk: None,
            locals: Vec::new(),
            operand_base,
            pc: 0,
            role: FrameRole::Native(name),
        }
    }

    pub fn is_native(&self) -> bool {
        self.chunk.is_none()
    }

    /// One trace line for this frame.
    pub fn describe(&self) -> String {
        let module = self
            .module
            .as_ref()
            .map(|module| module.name.as_ref())
            .unwrap_or("?");
        match (&self.role, &self.chunk) {
            (FrameRole::Native(name), _) => format!("at native {name}"),
            (FrameRole::Module | FrameRole::Import, _) => format!("at module {module}"),
            (FrameRole::Class(class), _) => format!("at class body {} in {module}", class.name),
            (FrameRole::Function, Some(chunk)) => {
                // pc already points past the instruction being executed.
                let offset = self.pc.saturating_sub(1);
                match chunk.line_at(offset) {
                    Some(line) => format!("at {} in {module}:{line}", chunk.name()),
                    None => format!("at {} in {module}@{offset}", chunk.name()),
                }
            }
            (FrameRole::Function, None) => format!("at <unknown> in {module}"),
        }
    }
}
