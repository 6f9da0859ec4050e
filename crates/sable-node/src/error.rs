//! Node-level error types.

use sable_core::{BlockHash, CoreError, Nullifier, TxId};
use sable_state::{BlockError, StateError, TxError};
use thiserror::Error;

use crate::config::ConfigError;

pub use sable_state::ErrorKind;

/// Failures of the persistent key-value backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// The backend reported an I/O or internal error.
    #[error("storage backend: {0}")]
    Backend(String),

    /// A stored value could not be decoded.
    #[error("corrupt record under key {key}: {reason}")]
    Codec {
        /// Hex of the offending key.
        key: String,
        /// Decoder message.
        reason: String,
    },

    /// Write rejected by a test backend.
    #[error("injected write failure")]
    Injected,
}

impl From<sled::Error> for StorageError {
    fn from(e: sled::Error) -> Self {
        StorageError::Backend(e.to_string())
    }
}

/// Why a block was not accepted, or why the chain cannot proceed.
#[derive(Debug, Error)]
pub enum ChainError {
    /// The block is already stored.
    #[error("block {0} already known")]
    AlreadyKnown(BlockHash),

    /// The block was rejected before; it is never re-validated.
    #[error("block {0} previously rejected")]
    KnownInvalid(BlockHash),

    /// The parent is not stored yet.
    #[error("block {block} has unknown parent {parent}")]
    UnknownParent {
        /// Submitted block.
        block: BlockHash,
        /// Missing parent.
        parent: BlockHash,
    },

    /// The block descends from a rejected block.
    #[error("block {block} descends from rejected block {ancestor}")]
    InvalidAncestor {
        /// Submitted block.
        block: BlockHash,
        /// Rejected ancestor.
        ancestor: BlockHash,
    },

    /// The block violates a consensus rule.
    #[error("block {hash} rejected: {source}")]
    Block {
        /// Rejected block.
        hash: BlockHash,
        /// Violated rule.
        source: BlockError,
    },

    /// Switching to the heavier branch failed; the previous head was kept.
    #[error("reorg aborted: {0}")]
    ReorgAborted(StateError),

    /// Chain state error outside a reorg.
    #[error(transparent)]
    State(StateError),

    /// Persisting the change failed; in-memory state was rolled back.
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),

    /// The stored chain starts from a different genesis.
    #[error("stored genesis {found} does not match expected {expected}")]
    GenesisMismatch {
        /// Genesis supplied by configuration.
        expected: BlockHash,
        /// Genesis found in storage.
        found: BlockHash,
    },

    /// The configured genesis block is malformed.
    #[error("invalid genesis block: {0}")]
    InvalidGenesis(String),

    /// Stored data is inconsistent with itself.
    #[error("stored chain is corrupted: {0}")]
    Corrupted(String),

    /// A previous failure left the state unrecoverable; no block is accepted.
    #[error("chain halted: {0}")]
    Halted(String),

    /// A block template could not be assembled.
    #[error("cannot assemble block template: {0}")]
    Template(BlockError),

    /// No canonical block inserted this tree position.
    #[error("unknown note position {0}")]
    UnknownPosition(u64),
}

impl ChainError {
    /// Error class.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ChainError::AlreadyKnown(_) => ErrorKind::Duplicate,
            ChainError::KnownInvalid(_) | ChainError::InvalidAncestor { .. } => {
                ErrorKind::Consensus
            }
            ChainError::UnknownParent { .. } => ErrorKind::Orphan,
            ChainError::Block { source, .. } => source.kind(),
            ChainError::ReorgAborted(_) => ErrorKind::Consensus,
            ChainError::State(e) => e.kind(),
            ChainError::Storage(_) => ErrorKind::Transient,
            ChainError::Template(_) | ChainError::UnknownPosition(_) => ErrorKind::Structural,
            ChainError::GenesisMismatch { .. }
            | ChainError::InvalidGenesis(_)
            | ChainError::Corrupted(_)
            | ChainError::Halted(_) => ErrorKind::Fatal,
        }
    }

    /// Whether resubmitting the same block later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Transient | ErrorKind::Orphan | ErrorKind::Capacity
        )
    }

    /// Whether the block that caused this error must be remembered as invalid.
    pub fn marks_invalid(&self) -> bool {
        match self {
            ChainError::Block { source, .. } => source.is_permanent(),
            ChainError::InvalidAncestor { .. } => true,
            _ => false,
        }
    }
}

/// Why a transaction was not admitted to the pool.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MempoolError {
    /// Only regular transactions are pooled.
    #[error("coinbase transactions are not pooled")]
    NotRegular,

    /// The transaction could not be encoded.
    #[error("malformed transaction: {0}")]
    Malformed(#[from] CoreError),

    /// A contextual rule failed against the current head.
    #[error("invalid transaction: {0}")]
    Invalid(#[from] TxError),

    /// Cannot be mined in the next block.
    #[error("expired at height {expiration} (next block {next_height})")]
    Expired {
        /// Declared expiration.
        expiration: u64,
        /// Height of the next block.
        next_height: u64,
    },

    /// Already in the pool.
    #[error("transaction {0} already in pool")]
    AlreadyKnown(TxId),

    /// Shares a nullifier with a pooled transaction paying at least as much.
    #[error("nullifier {nullifier} already spent by pooled transaction {existing}")]
    Conflict {
        /// Shared nullifier.
        nullifier: Nullifier,
        /// Pooled transaction that keeps its place.
        existing: TxId,
    },

    /// The pool is full and this fee rate does not beat the cheapest entry.
    #[error("fee rate {fee_rate} does not exceed eviction threshold {threshold}")]
    FeeTooLow {
        /// Offered fee rate (atoms per 1000 bytes).
        fee_rate: u64,
        /// Lowest fee rate the pool would have to evict.
        threshold: u64,
    },

    /// Larger than the whole pool budget.
    #[error("transaction of {size} bytes exceeds pool budget {max}")]
    TooLarge {
        /// Serialized size.
        size: usize,
        /// Pool byte budget.
        max: usize,
    },
}

impl MempoolError {
    /// Error class.
    pub fn kind(&self) -> ErrorKind {
        match self {
            MempoolError::NotRegular | MempoolError::Malformed(_) => ErrorKind::Structural,
            MempoolError::Invalid(TxError::DoubleSpend { .. }) => ErrorKind::DoubleSpend,
            MempoolError::Invalid(TxError::Structural(_)) => ErrorKind::Structural,
            MempoolError::Invalid(_) | MempoolError::Expired { .. } => ErrorKind::Consensus,
            MempoolError::AlreadyKnown(_) => ErrorKind::Duplicate,
            MempoolError::Conflict { .. } => ErrorKind::DoubleSpend,
            MempoolError::FeeTooLow { .. } | MempoolError::TooLarge { .. } => ErrorKind::Capacity,
        }
    }

    /// Whether resubmitting later (or with a higher fee) may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Capacity | ErrorKind::DoubleSpend)
    }
}

/// Failure to start a node.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Bad configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The chain could not be opened.
    #[error(transparent)]
    Chain(#[from] ChainError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use sable_consensus::ConsensusError;
    use sable_core::Hash32;

    #[test]
    fn storage_failures_are_retryable() {
        let err = ChainError::Storage(StorageError::Injected);
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert!(err.is_retryable());
        assert!(!err.marks_invalid());
    }

    #[test]
    fn abandoned_validation_is_not_memoized() {
        let hash = Hash32::zero();
        let abandoned = ChainError::Block {
            hash,
            source: BlockError::Abandoned,
        };
        assert!(!abandoned.marks_invalid());
        let bad = ChainError::Block {
            hash,
            source: BlockError::Structural(CoreError::InvalidValue("x")),
        };
        assert!(bad.marks_invalid());
        assert_eq!(bad.kind(), ErrorKind::Structural);
    }

    #[test]
    fn clock_dependent_header_failure_is_not_memoized() {
        let early = ChainError::Block {
            hash: Hash32::zero(),
            source: BlockError::InvalidHeader(ConsensusError::TimestampTooNew {
                timestamp: 10,
                limit: 5,
            }),
        };
        assert!(!early.marks_invalid());
        assert!(early.is_retryable());
        let bad_bits = ChainError::Block {
            hash: Hash32::zero(),
            source: BlockError::InvalidHeader(ConsensusError::InvalidBits),
        };
        assert!(bad_bits.marks_invalid());
        assert!(!bad_bits.is_retryable());
    }

    #[test]
    fn orphans_retry_duplicates_do_not() {
        let orphan = ChainError::UnknownParent {
            block: Hash32::zero(),
            parent: Hash32([1; 32]),
        };
        assert!(orphan.is_retryable());
        assert!(!ChainError::AlreadyKnown(Hash32::zero()).is_retryable());
    }
}
