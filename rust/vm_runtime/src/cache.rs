//! `.sblc` module cache files.
//!
//! Layout (big-endian): signature `SBL`, format version, CRC32 of the source
//! the module was compiled from, module name, source path, then the module's
//! chunk record as written by [`sable_bytecode::codec`].  Everything read back
//! is re-verified before it is handed to the machine.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use sable_bytecode::codec::{read_chunk, read_str, write_chunk, write_str, AttributeCodecs};
use sable_bytecode::{Chunk, CodecError};
use sable_verifier::{seal, VerifyError};
use thiserror::Error;
use tracing::debug;

pub const SIGNATURE: [u8; 3] = *b"SBL";
pub const VERSION: u8 = 1;
pub const CACHE_EXTENSION: &str = "sblc";
pub const SOURCE_EXTENSION: &str = "sbl";

#[derive(Debug, Clone, PartialEq)]
pub struct CacheFile {
    pub name: String,
    pub source_path: String,
    /// CRC32 of the source bytes.
    pub checksum: u32,
    pub chunk: Chunk,
}

pub fn checksum(source: &[u8]) -> u32 {
    crc32fast::hash(source)
}

pub fn write_cache<W: Write>(
    out: &mut W,
    file: &CacheFile,
    codecs: &AttributeCodecs,
) -> Result<(), CacheError> {
    out.write_all(&SIGNATURE)?;
    out.write_u8(VERSION)?;
    out.write_u32::<BigEndian>(file.checksum)?;
    write_str(out, &file.name)?;
    write_str(out, &file.source_path)?;
    write_chunk(out, &file.chunk, codecs)?;
    Ok(())
}

/// Read and verify a cache file.
///
/// With `expected` set, a file whose recorded checksum differs is rejected as
/// stale.  The returned chunk tree has its `max_stack` values restored.
pub fn read_cache<R: Read>(
    input: &mut R,
    codecs: &AttributeCodecs,
    expected: Option<u32>,
) -> Result<CacheFile, CacheError> {
    let mut signature = [0u8; 3];
    input.read_exact(&mut signature)?;
    if signature != SIGNATURE {
        return Err(CacheError::Signature(signature));
    }
    let version = input.read_u8()?;
    if version != VERSION {
        return Err(CacheError::Version {
            found: version,
            supported: VERSION,
        });
    }
    let recorded = input.read_u32::<BigEndian>()?;
    if let Some(expected) = expected {
        if expected != recorded {
            return Err(CacheError::ChecksumMismatch { expected, recorded });
        }
    }
    let name = read_str(input, "module name")?;
    let source_path = read_str(input, "source path")?;
    let chunk = read_chunk(input, codecs)?;
    let chunk = seal(&chunk)?;
    debug!(module = %name, checksum = recorded, "cache record verified");
    Ok(CacheFile {
        name,
        source_path,
        checksum: recorded,
        chunk,
    })
}

pub fn store(path: &Path, file: &CacheFile, codecs: &AttributeCodecs) -> Result<(), CacheError> {
    let mut out = BufWriter::new(File::create(path)?);
    write_cache(&mut out, file, codecs)?;
    out.flush()?;
    Ok(())
}

pub fn load(
    path: &Path,
    codecs: &AttributeCodecs,
    expected: Option<u32>,
) -> Result<CacheFile, CacheError> {
    let mut input = BufReader::new(File::open(path)?);
    read_cache(&mut input, codecs, expected)
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("not a module cache (signature {0:?})")]
    Signature([u8; 3]),
    #[error("cache format version {found} is not supported (expected {supported})")]
    Version { found: u8, supported: u8 },
    #[error("cache is stale: source checksum {expected:08x}, cache built from {recorded:08x}")]
    ChecksumMismatch { expected: u32, recorded: u32 },
    #[error("malformed cache record: {0}")]
    Codec(#[from] CodecError),
    #[error("cached bytecode failed verification: {0}")]
    Verify(#[from] VerifyError),
}
