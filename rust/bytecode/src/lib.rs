//! Sable bytecode: instruction model, assembler, disassembler and the binary
//! chunk record shared by the verifier and the virtual machine.

pub mod assembler;
pub mod chunk;
pub mod codec;
pub mod disassembler;
pub mod error;
pub mod instruction;
pub mod opcode;

pub use assembler::{Assembler, ConstantPool, Label};
pub use chunk::{
    Attribute, Chunk, ChunkFlags, Constant, FrameLayout, Guard, LineEntry, LocalEntry,
    MAX_CHUNK_NESTING,
};
pub use disassembler::{disassemble, Disassembler, Listing};
pub use error::{AssemblyError, CodecError, DecodeError};
pub use instruction::{Instruction, Operand};
pub use opcode::{ConstantRole, Effect, Opcode, OperandType, Operation};
