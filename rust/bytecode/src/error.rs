//! Error types shared by the assembler, disassembler and chunk codec.

use thiserror::Error;

use crate::opcode::{Opcode, OperandType};

/// Programmer errors raised while assembling a chunk.  Never recovered.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AssemblyError {
    #[error("{opcode} expects {expected} operands but received {actual}")]
    OperandCount {
        opcode: Opcode,
        expected: usize,
        actual: usize,
    },
    #[error("{opcode} operand {index} must be {expected:?}, found {found:?}")]
    OperandType {
        opcode: Opcode,
        index: usize,
        expected: OperandType,
        found: OperandType,
    },
    #[error("{opcode} would pop {pops} values from a stack of depth {depth}")]
    StackUnderflow {
        opcode: Opcode,
        pops: usize,
        depth: usize,
    },
    #[error("{0} is not a jump operation")]
    NotAJump(Opcode),
    #[error("label {0} was already bound")]
    LabelRebound(usize),
    #[error("label {0} does not belong to this assembler")]
    UnknownLabel(usize),
    #[error("{count} label(s) were never bound")]
    UnboundLabels { count: usize },
    #[error("jump offset {offset} does not fit in a signed 16-bit operand")]
    OffsetOverflow { offset: i64 },
    #[error("bind position {position} is not an instruction boundary")]
    MisalignedPosition { position: usize },
    #[error("guard range {start}..{end} (recovery {recovery}) is invalid")]
    InvalidGuard { start: u32, end: u32, recovery: u32 },
    #[error("constant pool is full (limit {limit})")]
    PoolOverflow { limit: usize },
    #[error("code length {length} exceeds the addressable range")]
    CodeTooLarge { length: usize },
}

/// Malformed bytecode encountered while decoding.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unknown opcode 0x{byte:02x} at offset {offset}")]
    UnknownOpcode { byte: u8, offset: usize },
    #[error("instruction at offset {offset} is truncated")]
    Truncated { offset: usize },
    #[error("constant index {index} at offset {offset} has no backing value")]
    MissingConstant { index: u16, offset: usize },
}

/// Failures reading or writing the binary chunk record.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid utf-8 in {context}")]
    InvalidUtf8 { context: &'static str },
    #[error("unknown constant tag {0}")]
    UnknownConstantTag(u8),
    #[error("unknown chunk flags 0x{0:02x}")]
    UnknownFlags(u8),
    #[error("{what} exceeds the format limit ({length} > {limit})")]
    TooLong {
        what: &'static str,
        length: usize,
        limit: usize,
    },
    #[error("malformed {attribute} attribute: {reason}")]
    MalformedAttribute {
        attribute: String,
        reason: &'static str,
    },
    #[error("guard field {field} is out of range")]
    GuardOutOfRange { field: &'static str },
    #[error("chunk constants nest deeper than {limit} levels")]
    TooDeep { limit: usize },
}
