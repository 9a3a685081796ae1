//! Error types for the launcher

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RunnerError {
    /// Bad command line; the launcher exits with status 2
    #[error("{0}")]
    InvalidArgument(String),

    #[error("Test manifest {path}: {reason}")]
    Manifest { path: PathBuf, reason: String },

    #[error("Manifest server failed: {0}")]
    Server(String),

    #[error("Interrupted")]
    Interrupted,

    #[error(transparent)]
    Common(#[from] steeplechase_common::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RunnerError {
    /// Process exit status for this error
    pub fn exit_code(&self) -> u8 {
        match self {
            RunnerError::InvalidArgument(_) => 2,
            _ => 1,
        }
    }
}

pub type RunnerResult<T> = Result<T, RunnerError>;
