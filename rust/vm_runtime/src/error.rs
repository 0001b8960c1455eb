use thiserror::Error;

use sable_verifier::VerifyError;

use crate::loader::LoadError;

/// Failures reported to the host embedding the machine.
#[derive(Debug, Error)]
pub enum VmError {
    #[error("module '{0}' not found")]
    ModuleNotFound(String),
    #[error("failed to load module '{name}': {source}")]
    Load {
        name: String,
        #[source]
        source: LoadError,
    },
    #[error("module '{name}' failed verification: {source}")]
    Verify {
        name: String,
        #[source]
        source: VerifyError,
    },
    #[error("module '{module}' has no attribute '{attribute}'")]
    AttributeMissing { module: String, attribute: String },
    #[error("machine halted: {message}")]
    Halted { message: String },
}
