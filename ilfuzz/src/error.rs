use std::path::PathBuf;

use thiserror::Error;

/// Reasons an instrumentation run is refused or fails.
///
/// Nothing is written back to disk when any of these is returned.
#[derive(Debug, Error)]
pub enum InstrumentationError {
    #[error("the specified assembly is already instrumented")]
    AlreadyInstrumented,

    #[error("cannot instrument mixed-mode assemblies")]
    MixedMode,

    #[error("at least one prefix is required when instrumenting {0}")]
    MissingCorePrefix(String),

    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("not a valid module image: {0}")]
    Malformed(#[from] serde_cbor::Error),

    #[error("branch at {index} in {method} targets {target}, past the end of the body")]
    InvalidBranchTarget {
        method: String,
        index: usize,
        target: usize,
    },

    #[error("exception handler #{handler} in {method} has an invalid range")]
    InvalidHandler { method: String, handler: usize },
}
