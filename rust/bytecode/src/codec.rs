//! Binary chunk record used by the module cache.
//!
//! Layout (big-endian):
//!
//! ```text
//! flags u8 | arg_count u8 | bound_arg_count u8 | locals_count u8
//! code_len u32 | code bytes
//! constant_count u16 | tagged constants
//! guard_count u16 | (start i32, end i32, recovery i32, slot i8)*
//! attribute_count u16 | (name str, payload_len u32, payload)*
//! ```
//!
//! Strings are a u16 byte length followed by UTF-8.  Integers and floats are
//! written with the narrow 32-bit tag whenever the value survives the
//! narrowing exactly, which keeps decode-then-encode byte-identical.

use std::collections::HashMap;
use std::io::{Cursor, Read, Write};
use std::rc::Rc;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use tracing::warn;

use crate::chunk::{
    Attribute, Chunk, ChunkFlags, Constant, Guard, LineEntry, LocalEntry, MAX_CHUNK_NESTING,
};
use crate::error::CodecError;

const TAG_NONE: u8 = 0;
const TAG_STRING: u8 = 1;
const TAG_INT32: u8 = 2;
const TAG_FLOAT32: u8 = 3;
const TAG_BOOL: u8 = 4;
const TAG_CHUNK: u8 = 5;
const TAG_INT64: u8 = 6;
const TAG_FLOAT64: u8 = 7;

/// Serialises one named debug attribute.
pub trait AttributeCodec {
    fn key(&self) -> &'static str;
    fn encode(&self, attribute: &Attribute, out: &mut Vec<u8>) -> Result<(), CodecError>;
    fn decode(&self, payload: &[u8]) -> Result<Attribute, CodecError>;
}

/// Registry of attribute codecs keyed by attribute name.
pub struct AttributeCodecs {
    codecs: HashMap<&'static str, Box<dyn AttributeCodec>>,
}

impl AttributeCodecs {
    /// Registry with no codecs; every attribute is dropped on write.
    pub fn empty() -> Self {
        Self {
            codecs: HashMap::new(),
        }
    }

    /// Codecs for every attribute the assembler produces.
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        registry.register(Box::new(NameCodec));
        registry.register(Box::new(LineNumberCodec));
        registry.register(Box::new(LocalVariableCodec));
        registry
    }

    pub fn register(&mut self, codec: Box<dyn AttributeCodec>) {
        self.codecs.insert(codec.key(), codec);
    }

    fn get(&self, key: &str) -> Option<&dyn AttributeCodec> {
        self.codecs.get(key).map(|codec| codec.as_ref())
    }
}

impl Default for AttributeCodecs {
    fn default() -> Self {
        Self::standard()
    }
}

/// Write a chunk record, recursing into nested chunk constants.
pub fn write_chunk<W: Write>(
    out: &mut W,
    chunk: &Chunk,
    codecs: &AttributeCodecs,
) -> Result<(), CodecError> {
    out.write_u8(chunk.flags.bits())?;
    out.write_u8(chunk.arg_count)?;
    out.write_u8(chunk.bound_arg_count)?;
    out.write_u8(chunk.locals_count)?;

    let code_len = u32::try_from(chunk.code.len()).map_err(|_| CodecError::TooLong {
        what: "code",
        length: chunk.code.len(),
        limit: u32::MAX as usize,
    })?;
    out.write_u32::<BigEndian>(code_len)?;
    out.write_all(&chunk.code)?;

    out.write_u16::<BigEndian>(count_u16("constant pool", chunk.constants.len())?)?;
    for constant in &chunk.constants {
        write_constant(out, constant, codecs)?;
    }

    out.write_u16::<BigEndian>(count_u16("guard table", chunk.guards.len())?)?;
    for guard in &chunk.guards {
        out.write_i32::<BigEndian>(guard_field(guard.start, "start")?)?;
        out.write_i32::<BigEndian>(guard_field(guard.end, "end")?)?;
        out.write_i32::<BigEndian>(guard_field(guard.recovery, "recovery")?)?;
        let slot = match guard.slot {
            Some(slot) => i8::try_from(slot).map_err(|_| CodecError::GuardOutOfRange {
                field: "slot",
            })?,
            None => -1,
        };
        out.write_i8(slot)?;
    }

    let mut encoded = Vec::with_capacity(chunk.attributes.len());
    for attribute in &chunk.attributes {
        match codecs.get(attribute.key()) {
            Some(codec) => {
                let mut payload = Vec::new();
                codec.encode(attribute, &mut payload)?;
                encoded.push((attribute.key(), payload));
            }
            None => warn!(attribute = attribute.key(), "no codec registered, dropping attribute"),
        }
    }
    out.write_u16::<BigEndian>(count_u16("attribute table", encoded.len())?)?;
    for (key, payload) in encoded {
        write_str(out, key)?;
        let length = u32::try_from(payload.len()).map_err(|_| CodecError::TooLong {
            what: "attribute payload",
            length: payload.len(),
            limit: u32::MAX as usize,
        })?;
        out.write_u32::<BigEndian>(length)?;
        out.write_all(&payload)?;
    }
    Ok(())
}

/// Read a chunk record.  `max_stack` is left at zero; callers restore it
/// from verification.  Nested chunk constants deeper than
/// [`MAX_CHUNK_NESTING`] are rejected.
pub fn read_chunk<R: Read>(input: &mut R, codecs: &AttributeCodecs) -> Result<Chunk, CodecError> {
    read_nested_chunk(input, codecs, 0)
}

fn read_nested_chunk<R: Read>(
    input: &mut R,
    codecs: &AttributeCodecs,
    depth: usize,
) -> Result<Chunk, CodecError> {
    if depth > MAX_CHUNK_NESTING {
        return Err(CodecError::TooDeep {
            limit: MAX_CHUNK_NESTING,
        });
    }
    let flag_bits = input.read_u8()?;
    let flags = ChunkFlags::from_bits(flag_bits).ok_or(CodecError::UnknownFlags(flag_bits))?;
    let arg_count = input.read_u8()?;
    let bound_arg_count = input.read_u8()?;
    let locals_count = input.read_u8()?;

    let code_len = input.read_u32::<BigEndian>()? as usize;
    let mut code = Vec::new();
    input.by_ref().take(code_len as u64).read_to_end(&mut code)?;
    if code.len() != code_len {
        return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
    }

    let constant_count = input.read_u16::<BigEndian>()?;
    let mut constants = Vec::with_capacity(constant_count as usize);
    for _ in 0..constant_count {
        constants.push(read_constant(input, codecs, depth)?);
    }

    let guard_count = input.read_u16::<BigEndian>()?;
    let mut guards = Vec::with_capacity(guard_count as usize);
    for _ in 0..guard_count {
        let start = read_guard_field(input, "start")?;
        let end = read_guard_field(input, "end")?;
        let recovery = read_guard_field(input, "recovery")?;
        let slot = match input.read_i8()? {
            -1 => None,
            slot if slot >= 0 => Some(slot as u8),
            _ => return Err(CodecError::GuardOutOfRange { field: "slot" }),
        };
        guards.push(Guard {
            start,
            end,
            recovery,
            slot,
        });
    }

    let attribute_count = input.read_u16::<BigEndian>()?;
    let mut attributes = Vec::with_capacity(attribute_count as usize);
    for _ in 0..attribute_count {
        let key = read_str(input, "attribute name")?;
        let length = input.read_u32::<BigEndian>()? as usize;
        let mut payload = Vec::new();
        input.by_ref().take(length as u64).read_to_end(&mut payload)?;
        if payload.len() != length {
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
        }
        match codecs.get(&key) {
            Some(codec) => attributes.push(codec.decode(&payload)?),
            None => warn!(attribute = %key, "skipping attribute without a registered codec"),
        }
    }

    Ok(Chunk {
        code,
        constants,
        guards,
        flags,
        arg_count,
        bound_arg_count,
        locals_count,
        max_stack: 0,
        attributes,
    })
}

fn write_constant<W: Write>(
    out: &mut W,
    constant: &Constant,
    codecs: &AttributeCodecs,
) -> Result<(), CodecError> {
    match constant {
        Constant::None => out.write_u8(TAG_NONE)?,
        Constant::String(value) => {
            out.write_u8(TAG_STRING)?;
            write_str(out, value)?;
        }
        Constant::Integer(value) => match i32::try_from(*value) {
            Ok(narrow) => {
                out.write_u8(TAG_INT32)?;
                out.write_i32::<BigEndian>(narrow)?;
            }
            Err(_) => {
                out.write_u8(TAG_INT64)?;
                out.write_i64::<BigEndian>(*value)?;
            }
        },
        Constant::Float(value) => {
            let narrow = *value as f32;
            if (narrow as f64).to_bits() == value.to_bits() {
                out.write_u8(TAG_FLOAT32)?;
                out.write_f32::<BigEndian>(narrow)?;
            } else {
                out.write_u8(TAG_FLOAT64)?;
                out.write_f64::<BigEndian>(*value)?;
            }
        }
        Constant::Boolean(value) => {
            out.write_u8(TAG_BOOL)?;
            out.write_u8(u8::from(*value))?;
        }
        Constant::Chunk(chunk) => {
            out.write_u8(TAG_CHUNK)?;
            write_chunk(out, chunk, codecs)?;
        }
    }
    Ok(())
}

fn read_constant<R: Read>(
    input: &mut R,
    codecs: &AttributeCodecs,
    depth: usize,
) -> Result<Constant, CodecError> {
    let tag = input.read_u8()?;
    let constant = match tag {
        TAG_NONE => Constant::None,
        TAG_STRING => Constant::String(Rc::from(read_str(input, "string constant")?)),
        TAG_INT32 => Constant::Integer(input.read_i32::<BigEndian>()? as i64),
        TAG_FLOAT32 => Constant::Float(input.read_f32::<BigEndian>()? as f64),
        TAG_BOOL => Constant::Boolean(input.read_u8()? != 0),
        TAG_CHUNK => Constant::Chunk(Rc::new(read_nested_chunk(input, codecs, depth + 1)?)),
        TAG_INT64 => Constant::Integer(input.read_i64::<BigEndian>()?),
        TAG_FLOAT64 => Constant::Float(input.read_f64::<BigEndian>()?),
        other => return Err(CodecError::UnknownConstantTag(other)),
    };
    Ok(constant)
}

/// Write a u16-length-prefixed UTF-8 string.
pub fn write_str<W: Write>(out: &mut W, value: &str) -> Result<(), CodecError> {
    out.write_u16::<BigEndian>(count_u16("string", value.len())?)?;
    out.write_all(value.as_bytes())?;
    Ok(())
}

/// Read a u16-length-prefixed UTF-8 string.
pub fn read_str<R: Read>(input: &mut R, context: &'static str) -> Result<String, CodecError> {
    let length = input.read_u16::<BigEndian>()? as usize;
    let mut bytes = vec![0u8; length];
    input.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8 { context })
}

fn count_u16(what: &'static str, length: usize) -> Result<u16, CodecError> {
    u16::try_from(length).map_err(|_| CodecError::TooLong {
        what,
        length,
        limit: u16::MAX as usize,
    })
}

fn guard_field(value: u32, field: &'static str) -> Result<i32, CodecError> {
    i32::try_from(value).map_err(|_| CodecError::GuardOutOfRange { field })
}

fn read_guard_field<R: Read>(input: &mut R, field: &'static str) -> Result<u32, CodecError> {
    let value = input.read_i32::<BigEndian>()?;
    u32::try_from(value).map_err(|_| CodecError::GuardOutOfRange { field })
}

fn malformed(attribute: &str, reason: &'static str) -> CodecError {
    CodecError::MalformedAttribute {
        attribute: attribute.to_owned(),
        reason,
    }
}

struct NameCodec;

impl AttributeCodec for NameCodec {
    fn key(&self) -> &'static str {
        "Name"
    }

    fn encode(&self, attribute: &Attribute, out: &mut Vec<u8>) -> Result<(), CodecError> {
        match attribute {
            Attribute::Name(name) => write_str(out, name),
            _ => Err(malformed(self.key(), "attribute variant mismatch")),
        }
    }

    fn decode(&self, payload: &[u8]) -> Result<Attribute, CodecError> {
        let mut cursor = Cursor::new(payload);
        Ok(Attribute::Name(read_str(&mut cursor, "chunk name")?))
    }
}

struct LineNumberCodec;

impl AttributeCodec for LineNumberCodec {
    fn key(&self) -> &'static str {
        "LineNumbers"
    }

    fn encode(&self, attribute: &Attribute, out: &mut Vec<u8>) -> Result<(), CodecError> {
        let Attribute::LineNumbers(entries) = attribute else {
            return Err(malformed(self.key(), "attribute variant mismatch"));
        };
        out.write_u16::<BigEndian>(count_u16("line table", entries.len())?)?;
        for entry in entries {
            out.write_u32::<BigEndian>(entry.offset)?;
            out.write_u32::<BigEndian>(entry.line)?;
        }
        Ok(())
    }

    fn decode(&self, payload: &[u8]) -> Result<Attribute, CodecError> {
        let mut cursor = Cursor::new(payload);
        let count = cursor.read_u16::<BigEndian>()?;
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let offset = cursor.read_u32::<BigEndian>()?;
            let line = cursor.read_u32::<BigEndian>()?;
            entries.push(LineEntry { offset, line });
        }
        if cursor.position() as usize != payload.len() {
            return Err(malformed(self.key(), "trailing bytes"));
        }
        Ok(Attribute::LineNumbers(entries))
    }
}

struct LocalVariableCodec;

impl AttributeCodec for LocalVariableCodec {
    fn key(&self) -> &'static str {
        "LocalVariables"
    }

    fn encode(&self, attribute: &Attribute, out: &mut Vec<u8>) -> Result<(), CodecError> {
        let Attribute::LocalVariables(entries) = attribute else {
            return Err(malformed(self.key(), "attribute variant mismatch"));
        };
        out.write_u16::<BigEndian>(count_u16("local table", entries.len())?)?;
        for entry in entries {
            write_str(out, &entry.name)?;
            out.write_u8(entry.slot)?;
            out.write_u32::<BigEndian>(entry.start)?;
            out.write_u32::<BigEndian>(entry.end)?;
        }
        Ok(())
    }

    fn decode(&self, payload: &[u8]) -> Result<Attribute, CodecError> {
        let mut cursor = Cursor::new(payload);
        let count = cursor.read_u16::<BigEndian>()?;
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let name = read_str(&mut cursor, "local name")?;
            let slot = cursor.read_u8()?;
            let start = cursor.read_u32::<BigEndian>()?;
            let end = cursor.read_u32::<BigEndian>()?;
            entries.push(LocalEntry {
                name,
                slot,
                start,
                end,
            });
        }
        if cursor.position() as usize != payload.len() {
            return Err(malformed(self.key(), "trailing bytes"));
        }
        Ok(Attribute::LocalVariables(entries))
    }
}
