//! Decoding raw code bytes back into typed instructions.
//!
//! Decoding is symmetric with the assembler's encoding: the same opcode table
//! drives operand widths, and constant indices are turned back into logical
//! constants through a caller-supplied resolver, so a decoded instruction
//! compares equal to the one that was emitted.

use std::fmt;

use byteorder::{BigEndian, ByteOrder};

use crate::chunk::{Chunk, Constant};
use crate::error::DecodeError;
use crate::instruction::{Instruction, Operand};
use crate::opcode::{Opcode, OperandType};

/// Iterator over `(offset, instruction)` pairs.
pub struct Disassembler<'a, R> {
    code: &'a [u8],
    offset: usize,
    resolver: R,
    failed: bool,
}

impl<'a, R> Disassembler<'a, R>
where
    R: Fn(u16) -> Option<Constant>,
{
    pub fn new(code: &'a [u8], resolver: R) -> Self {
        Self {
            code,
            offset: 0,
            resolver,
            failed: false,
        }
    }

    /// Decode the instruction starting at the current offset.
    pub fn decode_next(&mut self) -> Result<(usize, Instruction), DecodeError> {
        let start = self.offset;
        let byte = *self
            .code
            .get(start)
            .ok_or(DecodeError::Truncated { offset: start })?;
        let opcode = Opcode::from_byte(byte).ok_or(DecodeError::UnknownOpcode {
            byte,
            offset: start,
        })?;
        let operation = opcode.operation();
        let size = operation.instruction_size();
        if start + size > self.code.len() {
            return Err(DecodeError::Truncated { offset: start });
        }

        let mut cursor = start + 1;
        let mut operands = Vec::with_capacity(operation.operands.len());
        for operand_type in operation.operands {
            let bytes = &self.code[cursor..cursor + operand_type.byte_width()];
            let operand = match operand_type {
                OperandType::Imm8 => Operand::Imm8(bytes[0]),
                OperandType::Imm16 => Operand::Imm16(BigEndian::read_i16(bytes)),
                OperandType::Imm32 => Operand::Imm32(BigEndian::read_i32(bytes)),
                OperandType::Imm64 => Operand::Imm64(BigEndian::read_i64(bytes)),
                OperandType::Constant => {
                    let index = BigEndian::read_u16(bytes);
                    let constant = (self.resolver)(index).ok_or(DecodeError::MissingConstant {
                        index,
                        offset: start,
                    })?;
                    Operand::Constant(constant)
                }
            };
            operands.push(operand);
            cursor += operand_type.byte_width();
        }

        self.offset = cursor;
        Ok((start, Instruction::new(opcode, operands)))
    }
}

impl<'a, R> Iterator for Disassembler<'a, R>
where
    R: Fn(u16) -> Option<Constant>,
{
    type Item = Result<(usize, Instruction), DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.code.len() {
            return None;
        }
        let decoded = self.decode_next();
        self.failed = decoded.is_err();
        Some(decoded)
    }
}

/// Decode a whole chunk against its own constant pool.
pub fn disassemble(chunk: &Chunk) -> Result<Vec<(usize, Instruction)>, DecodeError> {
    Disassembler::new(&chunk.code, |index| chunk.constant(index).cloned()).collect()
}

/// Human readable listing of a chunk and, recursively, its nested chunks.
pub struct Listing<'a>(pub &'a Chunk);

impl fmt::Display for Listing<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_listing(f, self.0, 0)
    }
}

fn write_listing(f: &mut fmt::Formatter<'_>, chunk: &Chunk, depth: usize) -> fmt::Result {
    let indent = "  ".repeat(depth);
    writeln!(
        f,
        "{indent}chunk {} (args {}, bound {}, locals {}, max stack {}, flags 0x{:02x})",
        chunk.name(),
        chunk.arg_count,
        chunk.bound_arg_count,
        chunk.locals_count,
        chunk.max_stack,
        chunk.flags.bits()
    )?;
    match disassemble(chunk) {
        Ok(instructions) => {
            for (offset, instruction) in &instructions {
                match instruction.jump_offset() {
                    Some(relative) => {
                        let target = *offset as i64 + instruction.size() as i64 + relative as i64;
                        writeln!(f, "{indent}  {offset:>5}  {instruction}  -> {target}")?;
                    }
                    None => writeln!(f, "{indent}  {offset:>5}  {instruction}")?,
                }
            }
        }
        Err(error) => writeln!(f, "{indent}  <undecodable: {error}>")?,
    }
    for guard in &chunk.guards {
        writeln!(
            f,
            "{indent}  guard ({}, {}] -> {} slot {:?}",
            guard.start, guard.end, guard.recovery, guard.slot
        )?;
    }
    for constant in &chunk.constants {
        if let Constant::Chunk(nested) = constant {
            write_listing(f, nested, depth + 1)?;
        }
    }
    Ok(())
}
