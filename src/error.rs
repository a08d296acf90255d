//! Error kinds the core distinguishes.
//!
//! Capacity exhaustion in the per-document frequency table is deliberately
//! not a variant here: it's handled locally by dropping the token and must
//! never surface. Phase 1 and phase 2 of the indexer never produce errors;
//! only segment flush and the final merge do, and those are collected and
//! returned by `finish`.

use std::path::PathBuf;

/// Errors surfaced by [`crate::indexer::ParallelIndexer::finish`].
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// Raised by segment flush or final merge when the filesystem rejects
    /// writes/reads.
    #[error("I/O error writing or reading segment {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// `add_batch` called with mismatched slice lengths, or a doc-id that
    /// violates the monotonicity invariant.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Segment file header/framing mismatch discovered during merge.
    #[error("segment format error in {path}: {reason}")]
    FormatError { path: PathBuf, reason: String },
}

impl IndexError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn format(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::FormatError {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
