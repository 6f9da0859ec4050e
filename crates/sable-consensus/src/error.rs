//! Consensus error types.

use thiserror::Error;

/// Errors returned by consensus validation and difficulty conversion code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConsensusError {
    /// Invalid compact target encoding in `bits`.
    #[error("invalid compact target bits")]
    InvalidBits,

    /// Target decoded to zero or otherwise unusable.
    #[error("invalid difficulty target")]
    InvalidTarget,

    /// Proof-of-work hash did not meet the required target.
    #[error("insufficient proof of work")]
    InsufficientPoW,

    /// Header timestamp is ahead of the local clock plus the allowed skew.
    /// Depends on `now`, so the same header may pass later.
    #[error("timestamp {timestamp} too far in the future (limit {limit})")]
    TimestampTooNew {
        /// Header timestamp.
        timestamp: u64,
        /// Latest acceptable timestamp at validation time.
        limit: u64,
    },

    /// Header fields violated basic consensus constraints.
    #[error("invalid header: {0}")]
    InvalidHeader(&'static str),

    /// Unknown network name in configuration.
    #[error("unknown network: {0}")]
    UnknownNetwork(String),
}
