//! The machine's single exception-like signal.
//!
//! A panic is an ordinary value travelling through `Result`; it is only ever
//! handled by the machine's unwinding loop, never by Rust unwinding.

use std::fmt;

use crate::value::Value;

#[derive(Debug, Clone)]
pub struct Panic {
    pub payload: Value,
    /// Fatal panics skip every guard and halt the machine.
    pub recoverable: bool,
    /// Descriptions of the frames popped so far, innermost first.
    pub trace: Vec<String>,
    /// Set once the profiler has counted this panic.
    pub(crate) counted: bool,
}

impl Panic {
    pub fn new(payload: Value, recoverable: bool) -> Self {
        Self {
            payload,
            recoverable,
            trace: Vec::new(),
            counted: false,
        }
    }

    pub fn recoverable(message: impl AsRef<str>) -> Self {
        Self::new(Value::string(message), true)
    }

    pub fn fatal(message: impl AsRef<str>) -> Self {
        Self::new(Value::string(message), false)
    }

    /// Payload text when the payload is a string.
    pub fn message(&self) -> Option<&str> {
        self.payload.as_str()
    }

    /// Trace lines with runs of identical frames longer than `threshold`
    /// folded into a single summary line.
    pub fn collapsed_trace(&self, threshold: usize) -> Vec<String> {
        let threshold = threshold.max(1);
        let mut lines = Vec::new();
        let mut index = 0;
        while index < self.trace.len() {
            let line = &self.trace[index];
            let run = self.trace[index..]
                .iter()
                .take_while(|candidate| *candidate == line)
                .count();
            lines.extend(std::iter::repeat(line.clone()).take(run.min(threshold)));
            if run > threshold {
                lines.push(format!(
                    "... {} more identical frame(s) omitted",
                    run - threshold
                ));
            }
            index += run;
        }
        lines
    }

    /// Multi-line report printed when the machine halts.
    pub fn report(&self, threshold: usize) -> String {
        let kind = if self.recoverable { "panic" } else { "fatal panic" };
        let mut report = format!("unrecovered {kind}: {}", self.payload);
        for line in self.collapsed_trace(threshold) {
            report.push_str("\n  ");
            report.push_str(&line);
        }
        report
    }
}

impl fmt::Display for Panic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "panic: {}", self.payload)
    }
}
