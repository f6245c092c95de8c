//! Error taxonomy. Every failure is fatal: an iteration either completes
//! or the job aborts with the partition index and the violated invariant.

use thiserror::Error;

/// Helper type for a call that could go wrong.
pub type TreecodeResult<T> = Result<T, TreecodeError>;

#[derive(Error, Debug)]
pub enum TreecodeError {
    /// A rejected configuration value.
    #[error("configuration rejected: {0}")]
    Config(String),

    /// Splitter counts do not sum to the universe count.
    #[error("decomposition covered {decomposed} of {expected} particles")]
    DecompositionMismatch { decomposed: usize, expected: usize },

    /// A tree piece received a particle count different from what the
    /// splitter assigned to it.
    #[error("tree piece {tp} received {got} particles, expected {expected}")]
    DeliveryMismatch { tp: usize, got: usize, expected: usize },

    /// The splitter search produced more partitions than allowed.
    #[error("{n_treepieces} tree pieces exceed the configured limit of {limit}")]
    CapacityOverflow { n_treepieces: usize, limit: usize },

    /// A structural invariant does not hold.
    #[error("invariant violated on partition {tp}: {detail}")]
    InvariantViolation { tp: i64, detail: String },

    /// A worker branch aborted; the message names the original failure.
    #[error("worker branch aborted: {0}")]
    BranchFailure(String),

    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("particle file rejected: {0}")]
    Parse(#[from] serde_json::Error),
}

impl TreecodeError {
    /// Invariant violation on a partition; `tp < 0` means process-wide.
    pub fn invariant(tp: i64, detail: impl Into<String>) -> Self {
        TreecodeError::InvariantViolation {
            tp,
            detail: detail.into(),
        }
    }
}
