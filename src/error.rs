//! Error types for directory tree reconstruction.
//!
//! Everything except `DepthExceeded` is recoverable at the granularity of a
//! single cluster, record or directory: the scan logs it and moves on.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DirTreeError {
    #[error("decode failure: {0}")]
    Decode(String),

    #[error("corrupted structure: {0}")]
    Corruption(String),

    #[error("read of {len} bytes at offset {offset} exceeds buffer of {size} bytes")]
    OutOfBounds {
        offset: usize,
        len: usize,
        size: usize,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("consistency violation: {0}")]
    Consistency(String),

    #[error("directory nesting exceeds {0} levels, parent chain is probably cyclic")]
    DepthExceeded(usize),

    #[error("invalid volume: {0}")]
    InvalidVolume(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DirTreeError>;

impl DirTreeError {
    /// Only a runaway recursion aborts the whole enumeration.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DirTreeError::DepthExceeded(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DirTreeError::NotFound(_))
    }
}
