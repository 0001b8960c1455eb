//! Compiled units of code and the data they carry.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::mem;
use std::ops::BitOr;
use std::rc::Rc;

/// Constant pool entry.
#[derive(Debug, Clone)]
pub enum Constant {
    None,
    String(Rc<str>),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Chunk(Rc<Chunk>),
}

impl Constant {
    pub fn string(value: impl AsRef<str>) -> Self {
        Constant::String(Rc::from(value.as_ref()))
    }

    pub fn chunk(chunk: Chunk) -> Self {
        Constant::Chunk(Rc::new(chunk))
    }

    /// Helpful string describing the variant for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Constant::None => "none",
            Constant::String(_) => "string",
            Constant::Integer(_) => "int",
            Constant::Float(_) => "float",
            Constant::Boolean(_) => "bool",
            Constant::Chunk(_) => "chunk",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Constant::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_chunk(&self) -> Option<&Rc<Chunk>> {
        match self {
            Constant::Chunk(chunk) => Some(chunk),
            _ => None,
        }
    }
}

/// Pool equality: floats compare by bit pattern, chunks by identity.
impl PartialEq for Constant {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Constant::None, Constant::None) => true,
            (Constant::String(a), Constant::String(b)) => a == b,
            (Constant::Integer(a), Constant::Integer(b)) => a == b,
            (Constant::Float(a), Constant::Float(b)) => a.to_bits() == b.to_bits(),
            (Constant::Boolean(a), Constant::Boolean(b)) => a == b,
            (Constant::Chunk(a), Constant::Chunk(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Eq for Constant {}

impl Hash for Constant {
    fn hash<H: Hasher>(&self, state: &mut H) {
        mem::discriminant(self).hash(state);
        match self {
            Constant::None => {}
            Constant::String(value) => value.hash(state),
            Constant::Integer(value) => value.hash(state),
            Constant::Float(value) => value.to_bits().hash(state),
            Constant::Boolean(value) => value.hash(state),
            Constant::Chunk(chunk) => Rc::as_ptr(chunk).hash(state),
        }
    }
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::None => f.write_str("none"),
            Constant::String(value) => write!(f, "{value:?}"),
            Constant::Integer(value) => write!(f, "{value}"),
            Constant::Float(value) => write!(f, "{value:?}"),
            Constant::Boolean(value) => write!(f, "{value}"),
            Constant::Chunk(chunk) => write!(f, "<chunk {}>", chunk.name()),
        }
    }
}

/// Chunk flag set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ChunkFlags(u8);

impl ChunkFlags {
    pub const NONE: ChunkFlags = ChunkFlags(0);
    /// The last parameter collects surplus arguments into an array.
    pub const VARIADIC: ChunkFlags = ChunkFlags(0x01);
    pub const MODULE: ChunkFlags = ChunkFlags(0x02);
    pub const CLASS: ChunkFlags = ChunkFlags(0x04);

    const KNOWN: u8 = 0x07;

    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Returns `None` when unknown bits are set.
    pub const fn from_bits(bits: u8) -> Option<ChunkFlags> {
        if bits & !Self::KNOWN == 0 {
            Some(ChunkFlags(bits))
        } else {
            None
        }
    }

    pub const fn contains(self, other: ChunkFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ChunkFlags {
    type Output = ChunkFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        ChunkFlags(self.0 | rhs.0)
    }
}

/// Protected byte range mapping to a recovery offset.
///
/// A panic raised while the frame's pc lies in `(start, end]` resumes at
/// `recovery`; pc is read after the faulting instruction was consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Guard {
    pub start: u32,
    pub end: u32,
    pub recovery: u32,
    /// Local slot receiving the panic payload.
    pub slot: Option<u8>,
}

impl Guard {
    pub fn covers(&self, pc: usize) -> bool {
        pc > self.start as usize && pc <= self.end as usize
    }
}

/// Source line active from `offset` onwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineEntry {
    pub offset: u32,
    pub line: u32,
}

/// Name of a local slot over a byte range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEntry {
    pub name: String,
    pub slot: u8,
    pub start: u32,
    pub end: u32,
}

/// Debug attribute attached to a chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attribute {
    Name(String),
    LineNumbers(Vec<LineEntry>),
    LocalVariables(Vec<LocalEntry>),
}

impl Attribute {
    /// Key under which the attribute is serialised.
    pub fn key(&self) -> &'static str {
        match self {
            Attribute::Name(_) => "Name",
            Attribute::LineNumbers(_) => "LineNumbers",
            Attribute::LocalVariables(_) => "LocalVariables",
        }
    }
}

/// Header values fixed when a chunk is assembled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameLayout {
    pub name: String,
    pub arg_count: u8,
    pub bound_arg_count: u8,
    pub locals_count: u8,
    pub flags: ChunkFlags,
}

impl FrameLayout {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn function(name: impl Into<String>, arg_count: u8, locals_count: u8) -> Self {
        Self {
            name: name.into(),
            arg_count,
            locals_count: locals_count.max(arg_count),
            ..Self::default()
        }
    }

    pub fn module(name: impl Into<String>, locals_count: u8) -> Self {
        Self {
            name: name.into(),
            locals_count,
            flags: ChunkFlags::MODULE,
            ..Self::default()
        }
    }

    pub fn with_flags(mut self, flags: ChunkFlags) -> Self {
        self.flags = self.flags | flags;
        self
    }

    pub fn with_bound_args(mut self, bound_arg_count: u8) -> Self {
        self.bound_arg_count = bound_arg_count;
        self
    }
}

/// Deepest chain of chunk constants (function inside function ...) that the
/// codec reads and the verifier walks.
pub const MAX_CHUNK_NESTING: usize = 64;

/// Immutable compiled unit: a module body, function body or class body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Chunk {
    pub code: Vec<u8>,
    pub constants: Vec<Constant>,
    pub guards: Vec<Guard>,
    pub flags: ChunkFlags,
    pub arg_count: u8,
    pub bound_arg_count: u8,
    pub locals_count: u8,
    /// Deepest operand stack the code can reach.
    pub max_stack: u16,
    pub attributes: Vec<Attribute>,
}

impl Chunk {
    pub fn name(&self) -> &str {
        self.attributes
            .iter()
            .find_map(|attribute| match attribute {
                Attribute::Name(name) => Some(name.as_str()),
                _ => None,
            })
            .unwrap_or("<anonymous>")
    }

    pub fn is_variadic(&self) -> bool {
        self.flags.contains(ChunkFlags::VARIADIC)
    }

    /// Source line for the instruction at `offset`, if a line table exists.
    pub fn line_at(&self, offset: usize) -> Option<u32> {
        let lines = self.attributes.iter().find_map(|attribute| match attribute {
            Attribute::LineNumbers(lines) => Some(lines),
            _ => None,
        })?;
        lines
            .iter()
            .take_while(|entry| entry.offset as usize <= offset)
            .last()
            .map(|entry| entry.line)
    }

    /// Name of a local slot live at `offset`.
    pub fn local_name(&self, slot: u8, offset: usize) -> Option<&str> {
        self.attributes.iter().find_map(|attribute| match attribute {
            Attribute::LocalVariables(locals) => locals
                .iter()
                .find(|entry| {
                    entry.slot == slot
                        && entry.start as usize <= offset
                        && offset < entry.end as usize
                })
                .map(|entry| entry.name.as_str()),
            _ => None,
        })
    }

    /// Resolve a pool index.
    pub fn constant(&self, index: u16) -> Option<&Constant> {
        self.constants.get(index as usize)
    }
}
