//! Static verification of Sable bytecode.

pub mod checkers;
pub mod r#static;

pub use r#static::{
    seal, verify, verify_tree, ChunkReport, VerificationReport, VerificationSummary, VerifyError,
    Violation, ViolationKind,
};
