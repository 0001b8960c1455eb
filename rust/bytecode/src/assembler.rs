//! Bytecode assembler.
//!
//! The compiler drives an [`Assembler`] through `emit`/`jump`/`bind` calls and
//! finally calls [`Assembler::assemble`] to obtain an immutable [`Chunk`].
//! The assembler owns three pieces of bookkeeping:
//!
//! * a constant pool, deduplicated by value and kept in first-insertion order
//!   so that identical programs produce identical bytes;
//! * a label table for jumps whose targets are not yet known;
//! * a virtual operand stack depth, derived from the opcode table, which is
//!   used to reject code that would pop from an empty stack and to size the
//!   frame's operand stack ahead of time.

use std::collections::HashMap;

use byteorder::{BigEndian, ByteOrder};

use crate::chunk::{Attribute, Chunk, Constant, FrameLayout, Guard, LineEntry, LocalEntry};
use crate::error::AssemblyError;
use crate::instruction::{Instruction, Operand};
use crate::opcode::Opcode;

/// Largest number of entries addressable by a u16 pool index.
pub const MAX_CONSTANTS: usize = u16::MAX as usize + 1;

/// Handle to a jump whose target has not been resolved yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(usize);

impl Label {
    pub fn id(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone)]
struct LabelSlot {
    instruction: usize,
    site: usize,
    stack_size: usize,
    bound: bool,
}

/// Insertion-ordered, deduplicating constant pool.
#[derive(Debug, Clone, Default)]
pub struct ConstantPool {
    entries: Vec<Constant>,
    indices: HashMap<Constant, u16>,
}

impl ConstantPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the index of `value`, adding it if unseen.
    pub fn intern(&mut self, value: &Constant) -> Result<u16, AssemblyError> {
        if let Some(index) = self.index_of(value) {
            return Ok(index);
        }
        if self.entries.len() >= MAX_CONSTANTS {
            return Err(AssemblyError::PoolOverflow {
                limit: MAX_CONSTANTS,
            });
        }
        let index = self.entries.len() as u16;
        self.entries.push(value.clone());
        self.indices.insert(value.clone(), index);
        Ok(index)
    }

    pub fn index_of(&self, value: &Constant) -> Option<u16> {
        self.indices.get(value).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn into_vec(self) -> Vec<Constant> {
        self.entries
    }
}

/// Accumulates instructions for a single chunk.
#[derive(Debug, Default)]
pub struct Assembler {
    instructions: Vec<Instruction>,
    offsets: Vec<usize>,
    position: usize,
    pool: ConstantPool,
    stack_size: usize,
    max_stack_size: usize,
    labels: Vec<LabelSlot>,
    guards: Vec<Guard>,
    lines: Vec<LineEntry>,
    locals: Vec<LocalEntry>,
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current byte offset; the position the next instruction will occupy.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Tracked operand stack depth after the last emitted instruction.
    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    pub fn max_stack_size(&self) -> usize {
        self.max_stack_size
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn pool(&self) -> &ConstantPool {
        &self.pool
    }

    /// Append an instruction after validating it against the opcode table.
    pub fn emit(&mut self, opcode: Opcode, operands: Vec<Operand>) -> Result<(), AssemblyError> {
        let operation = opcode.operation();
        if operands.len() != operation.operands.len() {
            return Err(AssemblyError::OperandCount {
                opcode,
                expected: operation.operands.len(),
                actual: operands.len(),
            });
        }
        for (index, (operand, expected)) in operands.iter().zip(operation.operands).enumerate() {
            let found = operand.operand_type();
            if found != *expected {
                return Err(AssemblyError::OperandType {
                    opcode,
                    index,
                    expected: *expected,
                    found,
                });
            }
        }

        let pops = operation.pops(&operands);
        let pushes = operation.pushes(&operands);
        if pops > self.stack_size {
            return Err(AssemblyError::StackUnderflow {
                opcode,
                pops,
                depth: self.stack_size,
            });
        }

        for operand in &operands {
            if let Operand::Constant(constant) = operand {
                self.pool.intern(constant)?;
            }
        }

        self.stack_size = self.stack_size - pops + pushes;
        self.max_stack_size = self.max_stack_size.max(self.stack_size);

        let instruction = Instruction::new(opcode, operands);
        self.offsets.push(self.position);
        self.position += instruction.size();
        self.instructions.push(instruction);
        Ok(())
    }

    /// Emit an operand-less instruction.
    pub fn emit_op(&mut self, opcode: Opcode) -> Result<(), AssemblyError> {
        self.emit(opcode, Vec::new())
    }

    /// Emit `PUSH` for a constant.
    pub fn push_constant(&mut self, constant: Constant) -> Result<(), AssemblyError> {
        self.emit(Opcode::Push, vec![Operand::Constant(constant)])
    }

    /// Emit a jump with a placeholder offset and return its label.
    pub fn jump(&mut self, opcode: Opcode) -> Result<Label, AssemblyError> {
        if !opcode.is_jump() {
            return Err(AssemblyError::NotAJump(opcode));
        }
        let site = self.position;
        self.emit(opcode, vec![Operand::Imm16(0)])?;
        let label = Label(self.labels.len());
        self.labels.push(LabelSlot {
            instruction: self.instructions.len() - 1,
            site,
            stack_size: self.stack_size,
            bound: false,
        });
        Ok(label)
    }

    /// Resolve `label` to the current position.
    pub fn bind(&mut self, label: Label) -> Result<(), AssemblyError> {
        let target = self.position;
        self.resolve(label, target)
    }

    /// Resolve `label` to an already-assembled position (a loop head).
    pub fn bind_to(&mut self, label: Label, position: usize) -> Result<(), AssemblyError> {
        if position != self.position && self.offsets.binary_search(&position).is_err() {
            return Err(AssemblyError::MisalignedPosition { position });
        }
        self.resolve(label, position)
    }

    fn resolve(&mut self, label: Label, target: usize) -> Result<(), AssemblyError> {
        let slot = self
            .labels
            .get(label.0)
            .ok_or(AssemblyError::UnknownLabel(label.0))?;
        if slot.bound {
            return Err(AssemblyError::LabelRebound(label.0));
        }

        let instruction = &self.instructions[slot.instruction];
        // The VM applies the offset once the whole jump has been read.
        let origin = slot.site + instruction.size();
        let offset = target as i64 - origin as i64;
        let offset = i16::try_from(offset).map_err(|_| AssemblyError::OffsetOverflow { offset })?;

        let stack_size = slot.stack_size;
        let index = slot.instruction;
        self.instructions[index].operands[0] = Operand::Imm16(offset);
        self.labels[label.0].bound = true;
        self.stack_size = stack_size;
        Ok(())
    }

    /// Register a protected range `(start, end]` recovering at `recovery`.
    pub fn guard(
        &mut self,
        start: usize,
        end: usize,
        recovery: usize,
        slot: Option<u8>,
    ) -> Result<(), AssemblyError> {
        let (start, end, recovery) = (start as u32, end as u32, recovery as u32);
        if start >= end {
            return Err(AssemblyError::InvalidGuard {
                start,
                end,
                recovery,
            });
        }
        self.guards.push(Guard {
            start,
            end,
            recovery,
            slot,
        });
        Ok(())
    }

    /// Record that code from the current position originates on `line`.
    pub fn mark_line(&mut self, line: u32) {
        if self.lines.last().map(|entry| entry.line) == Some(line) {
            return;
        }
        let offset = self.position as u32;
        if let Some(last) = self.lines.last_mut() {
            if last.offset == offset {
                last.line = line;
                return;
            }
        }
        self.lines.push(LineEntry { offset, line });
    }

    /// Name a local slot over `[start, end)` for debuggers and traces.
    pub fn declare_local(&mut self, name: impl Into<String>, slot: u8, start: usize, end: usize) {
        self.locals.push(LocalEntry {
            name: name.into(),
            slot,
            start: start as u32,
            end: end as u32,
        });
    }

    /// Serialise the instructions into a chunk.
    pub fn assemble(self, layout: FrameLayout) -> Result<Chunk, AssemblyError> {
        let unbound = self.labels.iter().filter(|slot| !slot.bound).count();
        if unbound > 0 {
            return Err(AssemblyError::UnboundLabels { count: unbound });
        }
        if self.position > i32::MAX as usize {
            return Err(AssemblyError::CodeTooLarge {
                length: self.position,
            });
        }
        for guard in &self.guards {
            let recovery = guard.recovery as usize;
            let aligned = recovery == self.position || self.offsets.binary_search(&recovery).is_ok();
            if guard.end as usize > self.position || !aligned {
                return Err(AssemblyError::InvalidGuard {
                    start: guard.start,
                    end: guard.end,
                    recovery: guard.recovery,
                });
            }
        }

        let mut code = Vec::with_capacity(self.position);
        for instruction in &self.instructions {
            encode_instruction(instruction, &self.pool, &mut code);
        }

        let mut attributes = Vec::new();
        if !layout.name.is_empty() {
            attributes.push(Attribute::Name(layout.name));
        }
        if !self.lines.is_empty() {
            attributes.push(Attribute::LineNumbers(self.lines));
        }
        if !self.locals.is_empty() {
            attributes.push(Attribute::LocalVariables(self.locals));
        }

        Ok(Chunk {
            code,
            constants: self.pool.into_vec(),
            guards: self.guards,
            flags: layout.flags,
            arg_count: layout.arg_count,
            bound_arg_count: layout.bound_arg_count,
            locals_count: layout.locals_count,
            max_stack: u16::try_from(self.max_stack_size).unwrap_or(u16::MAX),
            attributes,
        })
    }
}

fn encode_instruction(instruction: &Instruction, pool: &ConstantPool, code: &mut Vec<u8>) {
    let mut buffer = [0u8; 8];
    code.push(instruction.opcode as u8);
    for operand in &instruction.operands {
        match operand {
            Operand::Imm8(value) => code.push(*value),
            Operand::Imm16(value) => {
                BigEndian::write_i16(&mut buffer, *value);
                code.extend_from_slice(&buffer[..2]);
            }
            Operand::Imm32(value) => {
                BigEndian::write_i32(&mut buffer, *value);
                code.extend_from_slice(&buffer[..4]);
            }
            Operand::Imm64(value) => {
                BigEndian::write_i64(&mut buffer, *value);
                code.extend_from_slice(&buffer[..8]);
            }
            Operand::Constant(constant) => {
                // Interned by `emit`, so the lookup cannot miss.
                let index = pool.index_of(constant).unwrap_or(u16::MAX);
                BigEndian::write_u16(&mut buffer, index);
                code.extend_from_slice(&buffer[..2]);
            }
        }
    }
}
