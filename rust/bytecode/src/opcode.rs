//! Instruction model for the Sable virtual machine.
//!
//! Every opcode is described by a static [`Operation`] record: the operand
//! shape it expects and how many values it pops from and pushes onto the
//! operand stack.  The table is plain data.  The assembler consults it to
//! reject malformed operand lists and to track the live stack depth, and the
//! verifier re-derives stack balance from raw bytes with the very same
//! records, so the two can never disagree about an instruction's effect.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::instruction::Operand;

use ConstantRole::{Body, Symbol};
use Effect::Fixed;
use OperandType::{Constant, Imm16, Imm32, Imm64, Imm8};

/// Enumeration of all opcodes recognised by the VM.
///
/// The discriminant is the byte written to the instruction stream.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Opcode {
    Nop = 0,
    /// Push a constant pool entry.
    Push,
    /// Push a 32-bit immediate integer.
    PushInt,
    /// Push a float whose IEEE-754 bits are the 64-bit immediate.
    PushFloat,
    Pop,
    Dup,
    /// Copy the value `n` slots below the top (0 = top).
    DupAt,
    Swap,
    GetLocal,
    SetLocal,
    GetGlobal,
    SetGlobal,
    GetAttribute,
    /// Pops the value, then the target.
    SetAttribute,
    GetIndex,
    /// Pops the value, the index, then the target.
    SetIndex,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Neg,
    Not,
    /// Unconditional jump with a relative 16-bit offset.
    Jump,
    JumpIfTrue,
    JumpIfFalse,
    /// Pops `argc` arguments and the callee beneath them.
    Call,
    Return,
    MakeArray,
    /// Instantiate a function from a chunk constant, capturing `n` bound values.
    MakeFunction,
    /// Build a class from `n` bases and run its body chunk.
    MakeClass,
    New,
    Super,
    InstanceOf,
    Import,
    Throw,
}

/// Shape of a single operand in the instruction stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperandType {
    Imm8,
    Imm16,
    Imm32,
    Imm64,
    /// Constant pool reference, encoded as a u16 index.
    Constant,
}

impl OperandType {
    /// Number of bytes the operand occupies once encoded.
    pub const fn byte_width(self) -> usize {
        match self {
            OperandType::Imm8 => 1,
            OperandType::Imm16 => 2,
            OperandType::Imm32 => 4,
            OperandType::Imm64 => 8,
            OperandType::Constant => 2,
        }
    }
}

/// Declarative pop/push count.  Most are fixed; a few depend on an immediate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    Fixed(usize),
    /// The value of the `Imm8` operand at `index`, plus `extra`.
    Operand { index: usize, extra: usize },
}

impl Effect {
    fn evaluate(self, operands: &[Operand]) -> usize {
        match self {
            Effect::Fixed(count) => count,
            Effect::Operand { index, extra } => match operands.get(index) {
                Some(Operand::Imm8(value)) => *value as usize + extra,
                _ => extra,
            },
        }
    }
}

/// Constant kind required by an operand, checked statically by the verifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstantRole {
    Any,
    Symbol,
    Body,
}

/// Immutable descriptor for one opcode.
#[derive(Debug)]
pub struct Operation {
    pub opcode: Opcode,
    pub mnemonic: &'static str,
    pub operands: &'static [OperandType],
    pub roles: &'static [ConstantRole],
    pub pop: Effect,
    pub push: Effect,
}

impl Operation {
    /// Number of values popped given the actual operands.
    pub fn pops(&self, operands: &[Operand]) -> usize {
        self.pop.evaluate(operands)
    }

    /// Number of values pushed given the actual operands.
    pub fn pushes(&self, operands: &[Operand]) -> usize {
        self.push.evaluate(operands)
    }

    /// Encoded size of an instruction using this operation.
    pub fn instruction_size(&self) -> usize {
        1 + self
            .operands
            .iter()
            .map(|operand| operand.byte_width())
            .sum::<usize>()
    }

    /// Required constant kind for the constant operand at `index`.
    pub fn constant_role(&self, index: usize) -> ConstantRole {
        let position = self.operands[..index]
            .iter()
            .filter(|ty| **ty == OperandType::Constant)
            .count();
        self.roles.get(position).copied().unwrap_or(ConstantRole::Any)
    }
}

const fn op(
    opcode: Opcode,
    mnemonic: &'static str,
    operands: &'static [OperandType],
    pop: Effect,
    push: Effect,
) -> Operation {
    Operation {
        opcode,
        mnemonic,
        operands,
        roles: &[],
        pop,
        push,
    }
}

const fn op_with_roles(
    opcode: Opcode,
    mnemonic: &'static str,
    operands: &'static [OperandType],
    roles: &'static [ConstantRole],
    pop: Effect,
    push: Effect,
) -> Operation {
    Operation {
        opcode,
        mnemonic,
        operands,
        roles,
        pop,
        push,
    }
}

/// Indexed by opcode byte.
static OPERATIONS: [Operation; Opcode::COUNT] = [
    op(Opcode::Nop, "NOP", &[], Fixed(0), Fixed(0)),
    op(Opcode::Push, "PUSH", &[Constant], Fixed(0), Fixed(1)),
    op(Opcode::PushInt, "PUSH_INT", &[Imm32], Fixed(0), Fixed(1)),
    op(Opcode::PushFloat, "PUSH_FLOAT", &[Imm64], Fixed(0), Fixed(1)),
    op(Opcode::Pop, "POP", &[], Fixed(1), Fixed(0)),
    op(Opcode::Dup, "DUP", &[], Fixed(1), Fixed(2)),
    op(Opcode::DupAt, "DUP_AT", &[Imm8], Fixed(0), Fixed(1)),
    op(Opcode::Swap, "SWAP", &[], Fixed(2), Fixed(2)),
    op(Opcode::GetLocal, "GET_LOCAL", &[Imm8], Fixed(0), Fixed(1)),
    op(Opcode::SetLocal, "SET_LOCAL", &[Imm8], Fixed(1), Fixed(0)),
    op_with_roles(
        Opcode::GetGlobal,
        "GET_GLOBAL",
        &[Constant],
        &[Symbol],
        Fixed(0),
        Fixed(1),
    ),
    op_with_roles(
        Opcode::SetGlobal,
        "SET_GLOBAL",
        &[Constant],
        &[Symbol],
        Fixed(1),
        Fixed(0),
    ),
    op_with_roles(
        Opcode::GetAttribute,
        "GET_ATTRIBUTE",
        &[Constant],
        &[Symbol],
        Fixed(1),
        Fixed(1),
    ),
    op_with_roles(
        Opcode::SetAttribute,
        "SET_ATTRIBUTE",
        &[Constant],
        &[Symbol],
        Fixed(2),
        Fixed(0),
    ),
    op(Opcode::GetIndex, "GET_INDEX", &[], Fixed(2), Fixed(1)),
    op(Opcode::SetIndex, "SET_INDEX", &[], Fixed(3), Fixed(0)),
    op(Opcode::Add, "ADD", &[], Fixed(2), Fixed(1)),
    op(Opcode::Sub, "SUB", &[], Fixed(2), Fixed(1)),
    op(Opcode::Mul, "MUL", &[], Fixed(2), Fixed(1)),
    op(Opcode::Div, "DIV", &[], Fixed(2), Fixed(1)),
    op(Opcode::Mod, "MOD", &[], Fixed(2), Fixed(1)),
    op(Opcode::Eq, "EQ", &[], Fixed(2), Fixed(1)),
    op(Opcode::Ne, "NE", &[], Fixed(2), Fixed(1)),
    op(Opcode::Lt, "LT", &[], Fixed(2), Fixed(1)),
    op(Opcode::Le, "LE", &[], Fixed(2), Fixed(1)),
    op(Opcode::Gt, "GT", &[], Fixed(2), Fixed(1)),
    op(Opcode::Ge, "GE", &[], Fixed(2), Fixed(1)),
    op(Opcode::Neg, "NEG", &[], Fixed(1), Fixed(1)),
    op(Opcode::Not, "NOT", &[], Fixed(1), Fixed(1)),
    op(Opcode::Jump, "JUMP", &[Imm16], Fixed(0), Fixed(0)),
    op(Opcode::JumpIfTrue, "JUMP_IF_TRUE", &[Imm16], Fixed(1), Fixed(0)),
    op(Opcode::JumpIfFalse, "JUMP_IF_FALSE", &[Imm16], Fixed(1), Fixed(0)),
    op(
        Opcode::Call,
        "CALL",
        &[Imm8],
        Effect::Operand { index: 0, extra: 1 },
        Fixed(1),
    ),
    op(Opcode::Return, "RETURN", &[], Fixed(1), Fixed(0)),
    op(
        Opcode::MakeArray,
        "MAKE_ARRAY",
        &[Imm8],
        Effect::Operand { index: 0, extra: 0 },
        Fixed(1),
    ),
    op_with_roles(
        Opcode::MakeFunction,
        "MAKE_FUNCTION",
        &[Constant, Imm8],
        &[Body],
        Effect::Operand { index: 1, extra: 0 },
        Fixed(1),
    ),
    op_with_roles(
        Opcode::MakeClass,
        "MAKE_CLASS",
        &[Constant, Constant, Imm8],
        &[Symbol, Body],
        Effect::Operand { index: 2, extra: 0 },
        Fixed(1),
    ),
    op(Opcode::New, "NEW", &[], Fixed(1), Fixed(1)),
    op(Opcode::Super, "SUPER", &[], Fixed(2), Fixed(1)),
    op(Opcode::InstanceOf, "INSTANCE_OF", &[], Fixed(2), Fixed(1)),
    op_with_roles(
        Opcode::Import,
        "IMPORT",
        &[Constant],
        &[Symbol],
        Fixed(0),
        Fixed(1),
    ),
    op(Opcode::Throw, "THROW", &[], Fixed(1), Fixed(0)),
];

impl Opcode {
    /// Number of real opcodes.
    pub const COUNT: usize = Opcode::Throw as usize + 1;

    /// Decode an opcode byte.
    pub fn from_byte(byte: u8) -> Option<Opcode> {
        let index = byte as usize;
        if index < Self::COUNT {
            Some(OPERATIONS[index].opcode)
        } else {
            None
        }
    }

    /// Descriptor for this opcode.
    pub fn operation(self) -> &'static Operation {
        &OPERATIONS[self as usize]
    }

    pub fn mnemonic(self) -> &'static str {
        self.operation().mnemonic
    }

    /// Whether this opcode carries a relative jump offset.
    pub fn is_jump(self) -> bool {
        matches!(self, Opcode::Jump | Opcode::JumpIfTrue | Opcode::JumpIfFalse)
    }

    /// Look an opcode up by its mnemonic (case-sensitive).
    pub fn from_mnemonic(mnemonic: &str) -> Option<Opcode> {
        OPERATIONS[..Self::COUNT]
            .iter()
            .find(|operation| operation.mnemonic == mnemonic)
            .map(|operation| operation.opcode)
    }

    /// Iterate every opcode in byte order.
    pub fn all() -> impl Iterator<Item = Opcode> {
        OPERATIONS[..Self::COUNT]
            .iter()
            .map(|operation| operation.opcode)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}
