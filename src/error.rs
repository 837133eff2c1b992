use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CombError>;

#[derive(Debug, Error)]
pub enum CombError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("out of space: no free extent of the requested length")]
    OutOfSpace,
    #[error("paging violation: {0}")]
    Paging(&'static str),
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
    #[error("corruption detected: {0}")]
    Corruption(&'static str),
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
}

impl CombError {
    /// Whether the error is a contract violation against the update map
    /// rather than an environmental failure.
    pub fn is_paging(&self) -> bool {
        matches!(self, CombError::Paging(_))
    }

    pub fn is_out_of_space(&self) -> bool {
        matches!(self, CombError::OutOfSpace)
    }
}
