//! Execution profile gathered while the machine runs.
//!
//! Only populated when profiling is enabled in the configuration; the
//! dispatch loop skips every hook otherwise.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use sable_bytecode::Opcode;
use serde::{Deserialize, Serialize};

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Snapshot handed to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileReport {
    pub instructions: u64,
    pub calls: u64,
    pub max_call_depth: usize,
    pub panics_raised: u64,
    pub panics_recovered: u64,
    /// Executed instructions keyed by mnemonic.
    pub opcodes: BTreeMap<String, u64>,
    /// Executed instructions keyed by chunk name.
    pub chunks: BTreeMap<String, u64>,
    #[serde(rename = "elapsed_ms", with = "duration_millis")]
    pub elapsed: Duration,
}

#[derive(Debug)]
pub struct Profiler {
    started: Instant,
    instructions: u64,
    calls: u64,
    max_call_depth: usize,
    panics_raised: u64,
    panics_recovered: u64,
    opcodes: BTreeMap<Opcode, u64>,
    chunks: BTreeMap<String, u64>,
}

impl Default for Profiler {
    fn default() -> Self {
        Self::new()
    }
}

impl Profiler {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            instructions: 0,
            calls: 0,
            max_call_depth: 0,
            panics_raised: 0,
            panics_recovered: 0,
            opcodes: BTreeMap::new(),
            chunks: BTreeMap::new(),
        }
    }

    pub fn record_instruction(&mut self, chunk: &str, opcode: Opcode) {
        self.instructions += 1;
        *self.opcodes.entry(opcode).or_default() += 1;
        match self.chunks.get_mut(chunk) {
            Some(count) => *count += 1,
            None => {
                self.chunks.insert(chunk.to_owned(), 1);
            }
        }
    }

    /// A frame was pushed, leaving `depth` frames on the stack.
    pub fn record_call(&mut self, depth: usize) {
        self.calls += 1;
        self.max_call_depth = self.max_call_depth.max(depth);
    }

    pub fn record_panic(&mut self) {
        self.panics_raised += 1;
    }

    pub fn record_recovery(&mut self) {
        self.panics_recovered += 1;
    }

    pub fn report(&self) -> ProfileReport {
        ProfileReport {
            instructions: self.instructions,
            calls: self.calls,
            max_call_depth: self.max_call_depth,
            panics_raised: self.panics_raised,
            panics_recovered: self.panics_recovered,
            opcodes: self
                .opcodes
                .iter()
                .map(|(opcode, count)| (opcode.mnemonic().to_owned(), *count))
                .collect(),
            chunks: self.chunks.clone(),
            elapsed: self.started.elapsed(),
        }
    }
}
