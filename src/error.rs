//! # Error Kinds
//!
//! This module defines the typed error kinds a table surfaces. Errors are
//! propagated as `eyre::Report` throughout the crate; callers that need to
//! distinguish a kind (for example to retry after a discarded snapshot, or
//! to treat a missing revision as non-fatal) recover it with
//! `report.downcast_ref::<TableError>()`.
//!
//! ## Kinds
//!
//! - **Opening**: the data file or a valid base file could not be opened or
//!   created. Nothing was modified.
//! - **Corrupt**: an on-disk invariant is violated: a block whose stored
//!   level disagrees with its position, a missing tag continuation, a
//!   decompression size mismatch, a block overwritten while this handle is
//!   the writer, or a tree deeper than the cursor can address.
//! - **Modified**: a read-only handle observed a block written by a newer
//!   revision than its snapshot. The snapshot has been discarded by the
//!   writer; reopen and retry.
//! - **Storage**: a general storage fault: I/O error, fsync failure, a
//!   failed base rename where the temp file survived, or a commit with a
//!   non-increasing revision.
//! - **Unimplemented**: the payload exceeds what the item encoding can
//!   express (oversized key on add, too many tag components).
//! - **Closed**: the handle was latched shut with `close(true)`.
//!
//! None of these are recovered locally. Commit wraps its body so that any
//! failure closes the data file, leaving `cancel()` able to rebuild from the
//! last good base.

use thiserror::Error;

/// Typed error kinds carried inside `eyre::Report`.
#[derive(Debug, Error)]
pub enum TableError {
    #[error("database opening error: {0}")]
    Opening(String),

    #[error("database corrupt: {0}")]
    Corrupt(String),

    #[error("the revision being read has been discarded by the writer; reopen and retry")]
    Modified,

    #[error("database error: {0}")]
    Storage(String),

    #[error("unimplemented: {0}")]
    Unimplemented(String),

    #[error("table has been closed")]
    Closed,
}

impl TableError {
    pub fn opening(msg: impl Into<String>) -> eyre::Report {
        TableError::Opening(msg.into()).into()
    }

    pub fn corrupt(msg: impl Into<String>) -> eyre::Report {
        TableError::Corrupt(msg.into()).into()
    }

    pub fn storage(msg: impl Into<String>) -> eyre::Report {
        TableError::Storage(msg.into()).into()
    }

    pub fn unimplemented(msg: impl Into<String>) -> eyre::Report {
        TableError::Unimplemented(msg.into()).into()
    }
}
