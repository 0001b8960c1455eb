//! Typed instructions exchanged between the assembler, the disassembler and
//! the verifier.

use std::fmt;

use crate::chunk::Constant;
use crate::opcode::{Opcode, OperandType, Operation};

/// Immediate or constant operand.
///
/// Constant operands carry the logical constant rather than a pool index;
/// the index is only chosen when the owning chunk is serialised.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Imm8(u8),
    Imm16(i16),
    Imm32(i32),
    Imm64(i64),
    Constant(Constant),
}

impl Operand {
    pub fn operand_type(&self) -> OperandType {
        match self {
            Operand::Imm8(_) => OperandType::Imm8,
            Operand::Imm16(_) => OperandType::Imm16,
            Operand::Imm32(_) => OperandType::Imm32,
            Operand::Imm64(_) => OperandType::Imm64,
            Operand::Constant(_) => OperandType::Constant,
        }
    }

    pub fn as_imm8(&self) -> Option<u8> {
        match self {
            Operand::Imm8(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_imm16(&self) -> Option<i16> {
        match self {
            Operand::Imm16(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_constant(&self) -> Option<&Constant> {
        match self {
            Operand::Constant(value) => Some(value),
            _ => None,
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Imm8(value) => write!(f, "{value}"),
            Operand::Imm16(value) => write!(f, "{value:+}"),
            Operand::Imm32(value) => write!(f, "{value}"),
            Operand::Imm64(value) => write!(f, "{:?}", f64::from_bits(*value as u64)),
            Operand::Constant(constant) => write!(f, "{constant}"),
        }
    }
}

/// An opcode together with its bound operands.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub opcode: Opcode,
    pub operands: Vec<Operand>,
}

impl Instruction {
    pub fn new(opcode: Opcode, operands: Vec<Operand>) -> Self {
        Self { opcode, operands }
    }

    pub fn operation(&self) -> &'static Operation {
        self.opcode.operation()
    }

    /// Encoded size in bytes.
    pub fn size(&self) -> usize {
        1 + self
            .operands
            .iter()
            .map(|operand| operand.operand_type().byte_width())
            .sum::<usize>()
    }

    /// Values popped by this instruction.
    pub fn pops(&self) -> usize {
        self.operation().pops(&self.operands)
    }

    /// Values pushed by this instruction.
    pub fn pushes(&self) -> usize {
        self.operation().pushes(&self.operands)
    }

    /// Relative offset carried by a jump instruction.
    pub fn jump_offset(&self) -> Option<i16> {
        if self.opcode.is_jump() {
            self.operands.first().and_then(Operand::as_imm16)
        } else {
            None
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.opcode.mnemonic())?;
        for operand in &self.operands {
            write!(f, " {operand}")?;
        }
        Ok(())
    }
}
