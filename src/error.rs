//! Crate-wide error taxonomy.
//!
//! Mirrors the four-way split the control loop distinguishes: configuration
//! problems caught before the loop starts, executor-reported target
//! failures, fatal I/O, and internal invariant violations. Only the first
//! two are ever recovered from; the loop propagates everything else.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FuzzError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("executor error: {0}")]
    Executor(String),

    #[error("internal invariant violated: {0}")]
    Invariant(String),
}

impl FuzzError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Matches the exit code taxonomy of the CLI: configuration errors are
    /// user mistakes (exit 1), everything else is a fatal runtime error
    /// (exit 2).
    pub fn exit_code(&self) -> i32 {
        match self {
            FuzzError::Config(_) => 1,
            FuzzError::Io { .. } | FuzzError::Executor(_) | FuzzError::Invariant(_) => 2,
        }
    }
}

pub type Result<T> = std::result::Result<T, FuzzError>;
