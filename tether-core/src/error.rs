use crate::models::StreamSource;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TetherError {
    #[error("Failed to launch '{program}': {source}")]
    LaunchFailure {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read {stream}: {source}")]
    StreamReadFailure {
        stream: StreamSource,
        #[source]
        source: std::io::Error,
    },

    #[error("Process exited with non-zero code {code}")]
    NonZeroExit { code: i32 },

    #[error("Execution was cancelled")]
    Cancelled,

    #[error("Timed out after {0:?} waiting for process")]
    Timeout(Duration),

    #[error("Failed to convert process output: {0}")]
    ConversionFailure(String),

    #[error("Destination already exists: {}", .0.display())]
    PathConflict(PathBuf),

    #[error("Not a directory: {}", .0.display())]
    NotADirectory(PathBuf),

    #[error("Execution error: {0}")]
    ExecutionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

impl TetherError {
    /// Exit code carried by a `NonZeroExit`, if this is one.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            TetherError::NonZeroExit { code } => Some(*code),
            _ => None,
        }
    }

    /// Cancellation is caller-driven and should not be reported as a fault.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TetherError::Cancelled)
    }

    pub fn launch(program: impl Into<String>, source: std::io::Error) -> Self {
        TetherError::LaunchFailure {
            program: program.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, TetherError>;
