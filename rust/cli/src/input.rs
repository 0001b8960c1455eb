//! Reading the chunk a command operates on.

use std::fs;
use std::path::{Path, PathBuf};

use sable_bytecode::codec::AttributeCodecs;
use sable_bytecode::Chunk;
use sable_vm_runtime::cache::{self, CACHE_EXTENSION};
use sable_vm_runtime::CacheError;
use thiserror::Error;
use tracing::debug;

use crate::listing::{assemble_str, ListingError};

#[derive(Debug, Clone)]
pub struct LoadedChunk {
    /// Module name the chunk is registered under.
    pub name: String,
    pub path: PathBuf,
    pub chunk: Chunk,
}

#[derive(Debug, Error)]
pub enum InputError {
    #[error("cannot read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{}: {source}", .path.display())]
    Cache {
        path: PathBuf,
        #[source]
        source: CacheError,
    },
    #[error("{}: {source}", .path.display())]
    Listing {
        path: PathBuf,
        #[source]
        source: ListingError,
    },
    #[error("{}: expected a .sblc cache file or a .json listing", .path.display())]
    Unsupported { path: PathBuf },
}

/// Load a `.sblc` cache file or assemble a `.json` listing.
///
/// Cache files are verified on the way in; listings are returned as assembled.
pub fn read_input(path: &Path) -> Result<LoadedChunk, InputError> {
    let extension = path.extension().and_then(|extension| extension.to_str());
    match extension {
        Some(CACHE_EXTENSION) => {
            let file = cache::load(path, &AttributeCodecs::standard(), None).map_err(|source| {
                InputError::Cache {
                    path: path.to_path_buf(),
                    source,
                }
            })?;
            debug!(module = %file.name, path = %path.display(), "read cache file");
            Ok(LoadedChunk {
                name: file.name,
                path: path.to_path_buf(),
                chunk: file.chunk,
            })
        }
        Some("json") => {
            let text = fs::read_to_string(path).map_err(|source| InputError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            let chunk = assemble_str(&text).map_err(|source| InputError::Listing {
                path: path.to_path_buf(),
                source,
            })?;
            debug!(chunk = chunk.name(), path = %path.display(), "assembled listing");
            Ok(LoadedChunk {
                name: chunk.name().to_owned(),
                path: path.to_path_buf(),
                chunk,
            })
        }
        _ => Err(InputError::Unsupported {
            path: path.to_path_buf(),
        }),
    }
}
