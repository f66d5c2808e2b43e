//! Error types for the bam2tcc library

use std::io;
use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum TccError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to open {0}")]
    Open(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("worker failure: {0}")]
    Worker(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}
