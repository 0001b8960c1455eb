//! JSON assembly listings.
//!
//! A listing describes one chunk as a sequence of steps fed through the
//! [`Assembler`]:
//!
//! ```json
//! {
//!   "name": "main",
//!   "kind": "module",
//!   "code": [
//!     { "op": "PUSH_INT", "args": [1] },
//!     { "label": "top" },
//!     { "line": 4 },
//!     { "op": "JUMP_IF_FALSE", "args": ["done"] },
//!     { "op": "MAKE_FUNCTION", "args": [{ "name": "f", "code": [] }, 0] }
//!   ],
//!   "guards": [{ "start": "try", "end": "tried", "recovery": "catch", "slot": 1 }]
//! }
//! ```
//!
//! Jump operands name labels. Constant operands are JSON scalars, with an
//! object standing for a nested chunk listing.

use std::collections::HashMap;

use sable_bytecode::{
    AssemblyError, Assembler, Chunk, ChunkFlags, Constant, FrameLayout, Label, Opcode, Operand,
    OperandType,
};
use serde::Deserialize;
use serde_json::Value as Json;
use thiserror::Error;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkKind {
    #[default]
    Function,
    Module,
    Class,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChunkListing {
    pub name: String,
    #[serde(default)]
    pub kind: ChunkKind,
    #[serde(default)]
    pub args: u8,
    #[serde(default)]
    pub bound: u8,
    #[serde(default)]
    pub locals: u8,
    #[serde(default)]
    pub variadic: bool,
    pub code: Vec<Step>,
    #[serde(default)]
    pub guards: Vec<GuardListing>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Step {
    Label {
        label: String,
    },
    Line {
        line: u32,
    },
    Instruction {
        op: String,
        #[serde(default)]
        args: Vec<Json>,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GuardListing {
    pub start: String,
    pub end: String,
    pub recovery: String,
    #[serde(default)]
    pub slot: Option<u8>,
}

#[derive(Debug, Error)]
pub enum ListingError {
    #[error("invalid listing: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{chunk}: unknown opcode {op}")]
    UnknownOpcode { chunk: String, op: String },
    #[error("{chunk}: {op} takes {expected} operand(s) but {found} were given")]
    OperandCount {
        chunk: String,
        op: Opcode,
        expected: usize,
        found: usize,
    },
    #[error("{chunk}: operand {index} of {op} must be {expected}")]
    Operand {
        chunk: String,
        op: Opcode,
        index: usize,
        expected: &'static str,
    },
    #[error("{chunk}: label '{label}' is defined twice")]
    DuplicateLabel { chunk: String, label: String },
    #[error("{chunk}: label '{label}' is never defined")]
    UndefinedLabel { chunk: String, label: String },
    #[error("{chunk}: {source}")]
    Assembly {
        chunk: String,
        #[source]
        source: AssemblyError,
    },
}

/// Parse and assemble a listing document.
pub fn assemble_str(text: &str) -> Result<Chunk, ListingError> {
    let listing: ChunkListing = serde_json::from_str(text)?;
    listing.assemble()
}

impl ChunkListing {
    pub fn layout(&self) -> FrameLayout {
        let layout = match self.kind {
            ChunkKind::Function => FrameLayout::function(self.name.as_str(), self.args, self.locals),
            ChunkKind::Module => FrameLayout::module(self.name.as_str(), self.locals),
            ChunkKind::Class => FrameLayout {
                locals_count: self.locals,
                ..FrameLayout::new(self.name.as_str())
            }
            .with_flags(ChunkFlags::CLASS),
        };
        let layout = layout.with_bound_args(self.bound);
        if self.variadic {
            layout.with_flags(ChunkFlags::VARIADIC)
        } else {
            layout
        }
    }

    pub fn assemble(&self) -> Result<Chunk, ListingError> {
        let mut builder = Builder {
            chunk: &self.name,
            assembler: Assembler::new(),
            defined: HashMap::new(),
            pending: HashMap::new(),
        };
        for step in &self.code {
            builder.step(step)?;
        }
        if let Some(label) = builder.pending.keys().next() {
            return Err(ListingError::UndefinedLabel {
                chunk: self.name.clone(),
                label: label.clone(),
            });
        }
        for guard in &self.guards {
            let start = builder.position_of(&guard.start)?;
            let end = builder.position_of(&guard.end)?;
            let recovery = builder.position_of(&guard.recovery)?;
            builder
                .assembler
                .guard(start, end, recovery, guard.slot)
                .map_err(|source| builder.assembly(source))?;
        }
        let Builder { assembler, .. } = builder;
        assembler
            .assemble(self.layout())
            .map_err(|source| ListingError::Assembly {
                chunk: self.name.clone(),
                source,
            })
    }
}

struct Builder<'a> {
    chunk: &'a str,
    assembler: Assembler,
    defined: HashMap<String, usize>,
    pending: HashMap<String, Vec<Label>>,
}

impl Builder<'_> {
    fn step(&mut self, step: &Step) -> Result<(), ListingError> {
        match step {
            Step::Label { label } => self.define(label),
            Step::Line { line } => {
                self.assembler.mark_line(*line);
                Ok(())
            }
            Step::Instruction { op, args } => {
                let opcode = Opcode::from_mnemonic(op).ok_or_else(|| ListingError::UnknownOpcode {
                    chunk: self.chunk.to_owned(),
                    op: op.clone(),
                })?;
                self.instruction(opcode, args)
            }
        }
    }

    fn define(&mut self, label: &str) -> Result<(), ListingError> {
        let position = self.assembler.position();
        if self.defined.insert(label.to_owned(), position).is_some() {
            return Err(ListingError::DuplicateLabel {
                chunk: self.chunk.to_owned(),
                label: label.to_owned(),
            });
        }
        for jump in self.pending.remove(label).unwrap_or_default() {
            self.assembler.bind(jump).map_err(|source| self.assembly(source))?;
        }
        Ok(())
    }

    fn instruction(&mut self, opcode: Opcode, args: &[Json]) -> Result<(), ListingError> {
        let shapes = opcode.operation().operands;
        if shapes.len() != args.len() {
            return Err(ListingError::OperandCount {
                chunk: self.chunk.to_owned(),
                op: opcode,
                expected: shapes.len(),
                found: args.len(),
            });
        }

        if opcode.is_jump() {
            let target = args[0].as_str().ok_or_else(|| self.operand(opcode, 0, "a label name"))?;
            let jump = self.assembler.jump(opcode).map_err(|source| self.assembly(source))?;
            return match self.defined.get(target) {
                Some(&position) => self
                    .assembler
                    .bind_to(jump, position)
                    .map_err(|source| self.assembly(source)),
                None => {
                    self.pending.entry(target.to_owned()).or_default().push(jump);
                    Ok(())
                }
            };
        }

        let mut operands = Vec::with_capacity(args.len());
        for (index, (shape, arg)) in shapes.iter().zip(args).enumerate() {
            operands.push(self.operand_value(opcode, index, *shape, arg)?);
        }
        self.assembler
            .emit(opcode, operands)
            .map_err(|source| self.assembly(source))
    }

    fn operand_value(
        &self,
        opcode: Opcode,
        index: usize,
        shape: OperandType,
        arg: &Json,
    ) -> Result<Operand, ListingError> {
        let operand = match shape {
            OperandType::Imm8 => arg
                .as_u64()
                .and_then(|value| u8::try_from(value).ok())
                .map(Operand::Imm8),
            OperandType::Imm16 => arg
                .as_i64()
                .and_then(|value| i16::try_from(value).ok())
                .map(Operand::Imm16),
            OperandType::Imm32 => arg
                .as_i64()
                .and_then(|value| i32::try_from(value).ok())
                .map(Operand::Imm32),
            // PUSH_FLOAT carries the bit pattern of an f64.
            OperandType::Imm64 => arg
                .as_f64()
                .map(|value| Operand::Imm64(value.to_bits() as i64)),
            OperandType::Constant => {
                return match self.constant(arg) {
                    Some(constant) => constant.map(Operand::Constant),
                    None => Err(self.operand(opcode, index, "a scalar or a chunk listing")),
                };
            }
        };
        operand.ok_or_else(|| self.operand(opcode, index, shape_name(shape)))
    }

    /// `None` when `arg` is not a constant; nested listing errors propagate.
    fn constant(&self, arg: &Json) -> Option<Result<Constant, ListingError>> {
        let constant = match arg {
            Json::Null => Constant::None,
            Json::Bool(value) => Constant::Boolean(*value),
            Json::Number(number) => match number.as_i64() {
                Some(value) => Constant::Integer(value),
                None => Constant::Float(number.as_f64()?),
            },
            Json::String(text) => Constant::string(text),
            Json::Object(_) => {
                let nested = ChunkListing::deserialize(arg).map_err(ListingError::from);
                return Some(nested.and_then(|listing| listing.assemble()).map(Constant::chunk));
            }
            Json::Array(_) => return None,
        };
        Some(Ok(constant))
    }

    fn position_of(&self, label: &str) -> Result<usize, ListingError> {
        self.defined
            .get(label)
            .copied()
            .ok_or_else(|| ListingError::UndefinedLabel {
                chunk: self.chunk.to_owned(),
                label: label.to_owned(),
            })
    }

    fn operand(&self, op: Opcode, index: usize, expected: &'static str) -> ListingError {
        ListingError::Operand {
            chunk: self.chunk.to_owned(),
            op,
            index,
            expected,
        }
    }

    fn assembly(&self, source: AssemblyError) -> ListingError {
        ListingError::Assembly {
            chunk: self.chunk.to_owned(),
            source,
        }
    }
}

fn shape_name(shape: OperandType) -> &'static str {
    match shape {
        OperandType::Imm8 => "an integer in 0..=255",
        OperandType::Imm16 => "a 16-bit integer",
        OperandType::Imm32 => "a 32-bit integer",
        OperandType::Imm64 => "a number",
        OperandType::Constant => "a constant",
    }
}
