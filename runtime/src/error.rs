//! Error handling (§7, §4.15 of `SPEC_FULL.md`).
//!
//! Hot paths inside the directories, queues, and scheduler propagate the bare
//! [`abi::ResultCode`] — it's `Copy`, it's free to construct, and most of its
//! variants are handled by a caller that immediately retries or blocks rather
//! than by a human. [`PrsError`] exists at the API boundary, where a result
//! code alone isn't enough context for a caller embedding this runtime.

use abi::ResultCode;
use thiserror::Error;

/// Public-facing error type. Wraps a [`ResultCode`] with the operation and
/// object that produced it.
#[derive(Debug, Error)]
pub enum PrsError {
    #[error("{operation}: {code:?}")]
    Code { operation: &'static str, code: ResultCode },

    #[error("object {id:?} not found")]
    NotFound { id: abi::ObjectId },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("platform error in {operation}: {source}")]
    Platform { operation: &'static str, #[source] source: std::io::Error },
}

impl PrsError {
    #[must_use]
    pub fn code(operation: &'static str, code: ResultCode) -> Self {
        Self::Code { operation, code }
    }
}

pub type Result<T> = std::result::Result<T, PrsError>;

/// Maps a [`ResultCode`] other than `Ok` to a [`PrsError`], naming the
/// operation that produced it. Used at API boundaries; internals keep
/// propagating bare `ResultCode`.
pub fn check(operation: &'static str, code: ResultCode) -> Result<()> {
    if code.is_ok() {
        Ok(())
    } else {
        Err(PrsError::code(operation, code))
    }
}
