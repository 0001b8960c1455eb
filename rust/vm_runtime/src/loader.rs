//! Module resolution.
//!
//! The machine asks each [`ModuleLoader`] in turn for a module name and
//! takes the first hit.  [`MemoryLoader`] serves chunks registered by the
//! host; [`CacheLoader`] looks for `.sblc` and `.sbl` files under a list of
//! search roots.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use sable_bytecode::codec::AttributeCodecs;
use sable_bytecode::Chunk;
use sable_verifier::{seal, VerifyError};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::{self, CacheError, CacheFile, CACHE_EXTENSION, SOURCE_EXTENSION};

/// A resolved module, ready to be run.
#[derive(Debug, Clone)]
pub struct ModuleSource {
    pub name: String,
    pub path: Option<PathBuf>,
    pub chunk: Chunk,
    /// Whether `chunk` has already been through [`seal`].
    pub verified: bool,
}

pub trait ModuleLoader {
    /// `Ok(None)` means this loader does not know the name.
    fn resolve(&self, name: &str) -> Result<Option<ModuleSource>, LoadError>;
}

/// Front end turning Sable source text into a module chunk.
pub trait SourceCompiler {
    fn compile(&self, name: &str, path: &Path, source: &str) -> Result<Chunk, CompileError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct CompileError {
    pub message: String,
    pub line: Option<u32>,
}

impl CompileError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            line: None,
        }
    }

    pub fn at_line(mut self, line: u32) -> Self {
        self.line = Some(line);
        self
    }
}

/// Pre-assembled chunks keyed by module name.  Chunks are sealed on insert.
#[derive(Debug, Default)]
pub struct MemoryLoader {
    modules: HashMap<String, Chunk>,
}

impl MemoryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, chunk: &Chunk) -> Result<(), VerifyError> {
        let sealed = seal(chunk)?;
        self.modules.insert(name.to_owned(), sealed);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }
}

impl ModuleLoader for MemoryLoader {
    fn resolve(&self, name: &str) -> Result<Option<ModuleSource>, LoadError> {
        Ok(self.modules.get(name).map(|chunk| ModuleSource {
            name: name.to_owned(),
            path: None,
            chunk: chunk.clone(),
            verified: true,
        }))
    }
}

/// File-system loader over a list of search roots.
///
/// `pkg.util` maps to `<root>/pkg/util.sblc` (and `.sbl`).  A cache file is
/// used when it verifies and, if the source is present, its checksum matches
/// the source; otherwise the source is compiled and the cache rewritten.
pub struct CacheLoader {
    roots: Vec<PathBuf>,
    compiler: Option<Box<dyn SourceCompiler>>,
    write_cache: bool,
    codecs: AttributeCodecs,
}

impl CacheLoader {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self {
            roots,
            compiler: None,
            write_cache: true,
            codecs: AttributeCodecs::standard(),
        }
    }

    pub fn with_compiler(mut self, compiler: Box<dyn SourceCompiler>) -> Self {
        self.compiler = Some(compiler);
        self
    }

    pub fn with_cache_writes(mut self, enabled: bool) -> Self {
        self.write_cache = enabled;
        self
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    fn candidates(&self, name: &str) -> impl Iterator<Item = (PathBuf, PathBuf)> + '_ {
        let relative: PathBuf = name.split('.').collect();
        self.roots.iter().map(move |root| {
            let base = root.join(&relative);
            (
                base.with_extension(CACHE_EXTENSION),
                base.with_extension(SOURCE_EXTENSION),
            )
        })
    }

    fn compile(&self, name: &str, source_path: &Path, bytes: &[u8]) -> Result<Chunk, LoadError> {
        let compiler = self.compiler.as_ref().ok_or_else(|| LoadError::NoCompiler {
            path: source_path.to_path_buf(),
        })?;
        let text = std::str::from_utf8(bytes).map_err(|_| LoadError::Encoding {
            path: source_path.to_path_buf(),
        })?;
        let chunk = compiler
            .compile(name, source_path, text)
            .map_err(|source| LoadError::Compile {
                path: source_path.to_path_buf(),
                source,
            })?;
        Ok(seal(&chunk)?)
    }
}

impl ModuleLoader for CacheLoader {
    fn resolve(&self, name: &str) -> Result<Option<ModuleSource>, LoadError> {
        let mut rejected: Option<LoadError> = None;
        for (cache_path, source_path) in self.candidates(name) {
            let source = if source_path.is_file() {
                Some(fs::read(&source_path).map_err(|source| LoadError::Io {
                    path: source_path.clone(),
                    source,
                })?)
            } else {
                None
            };
            let expected = source.as_deref().map(cache::checksum);

            if cache_path.is_file() {
                match cache::load(&cache_path, &self.codecs, expected) {
                    Ok(file) => {
                        debug!(module = name, path = %cache_path.display(), "module cache hit");
                        return Ok(Some(ModuleSource {
                            name: name.to_owned(),
                            path: Some(PathBuf::from(file.source_path)),
                            chunk: file.chunk,
                            verified: true,
                        }));
                    }
                    Err(error) => {
                        warn!(module = name, path = %cache_path.display(), %error, "discarding module cache");
                        rejected = Some(LoadError::Cache {
                            path: cache_path.clone(),
                            source: error,
                        });
                    }
                }
            }

            let Some(bytes) = source else {
                continue;
            };
            let chunk = self.compile(name, &source_path, &bytes)?;
            if self.write_cache {
                let file = CacheFile {
                    name: name.to_owned(),
                    source_path: source_path.display().to_string(),
                    checksum: cache::checksum(&bytes),
                    chunk: chunk.clone(),
                };
                match cache::store(&cache_path, &file, &self.codecs) {
                    Ok(()) => info!(module = name, path = %cache_path.display(), "module cache written"),
                    Err(error) => warn!(module = name, %error, "could not write module cache"),
                }
            }
            return Ok(Some(ModuleSource {
                name: name.to_owned(),
                path: Some(source_path),
                chunk,
                verified: true,
            }));
        }
        match rejected {
            Some(error) => Err(error),
            None => Ok(None),
        }
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("cannot read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("rejected cache {}: {source}", .path.display())]
    Cache {
        path: PathBuf,
        #[source]
        source: CacheError,
    },
    #[error("{} is not valid utf-8", .path.display())]
    Encoding { path: PathBuf },
    #[error("cannot compile {}: {source}", .path.display())]
    Compile {
        path: PathBuf,
        #[source]
        source: CompileError,
    },
    #[error("{} needs compiling but no compiler is configured", .path.display())]
    NoCompiler { path: PathBuf },
    #[error(transparent)]
    Verify(#[from] VerifyError),
}
