//! Machine configuration.
//!
//! Defaults suit an interactive run; every field can be overridden from JSON
//! or from `SABLE_*` environment variables.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    /// Frames allowed on the call stack before a "stack overflow" panic.
    pub max_call_depth: usize,
    /// Nested dispatch loops natives may start before a "stack overflow"
    /// panic.  Each one costs native stack, so this stays well below
    /// `max_call_depth`.
    pub max_native_reentry: usize,
    /// Identical consecutive trace lines printed before collapsing.
    pub trace_repeat_threshold: usize,
    /// Instructions executed before the machine halts; 0 disables the limit.
    pub instruction_limit: u64,
    /// Write `.sblc` files after compiling a source module.
    pub cache_enabled: bool,
    pub profile: bool,
    pub search_roots: Vec<PathBuf>,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            max_call_depth: 256,
            max_native_reentry: 64,
            trace_repeat_threshold: 3,
            instruction_limit: 0,
            cache_enabled: true,
            profile: false,
            search_roots: vec![PathBuf::from(".")],
        }
    }
}

impl MachineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for the `SABLE_*` keys.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(value) = lookup("SABLE_CACHE") {
            config.cache_enabled = parse_flag("SABLE_CACHE", &value)?;
        }
        if let Some(value) = lookup("SABLE_PROFILE") {
            config.profile = parse_flag("SABLE_PROFILE", &value)?;
        }
        if let Some(value) = lookup("SABLE_MAX_DEPTH") {
            config.max_call_depth = value
                .trim()
                .parse::<usize>()
                .ok()
                .filter(|depth| *depth > 0)
                .ok_or(ConfigError::InvalidNumber {
                    key: "SABLE_MAX_DEPTH",
                    value,
                })?;
        }
        if let Some(value) = lookup("SABLE_MAX_REENTRY") {
            config.max_native_reentry = value
                .trim()
                .parse::<usize>()
                .ok()
                .filter(|depth| *depth > 0)
                .ok_or(ConfigError::InvalidNumber {
                    key: "SABLE_MAX_REENTRY",
                    value,
                })?;
        }
        if let Some(value) = lookup("SABLE_INSTRUCTION_LIMIT") {
            config.instruction_limit =
                value
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| ConfigError::InvalidNumber {
                        key: "SABLE_INSTRUCTION_LIMIT",
                        value: value.clone(),
                    })?;
        }
        if let Some(value) = lookup("SABLE_PATH") {
            let roots: Vec<PathBuf> = std::env::split_paths(&value)
                .filter(|root| !root.as_os_str().is_empty())
                .collect();
            if !roots.is_empty() {
                config.search_roots = roots;
            }
        }
        Ok(config)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        if config.max_call_depth == 0 {
            return Err(ConfigError::InvalidNumber {
                key: "max_call_depth",
                value: "0".to_owned(),
            });
        }
        if config.max_native_reentry == 0 {
            return Err(ConfigError::InvalidNumber {
                key: "max_native_reentry",
                value: "0".to_owned(),
            });
        }
        Ok(config)
    }
}

fn parse_flag(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" => Ok(false),
        _ => Err(ConfigError::InvalidFlag {
            key,
            value: value.to_owned(),
        }),
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key} must be a boolean flag, got '{value}'")]
    InvalidFlag { key: &'static str, value: String },
    #[error("{key} must be a positive number, got '{value}'")]
    InvalidNumber { key: &'static str, value: String },
    #[error("invalid configuration document: {0}")]
    Json(#[from] serde_json::Error),
}
