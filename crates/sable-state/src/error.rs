//! State transition and validation errors.

use sable_consensus::ConsensusError;
use sable_core::{Amount, BlockHash, CoreError, Nullifier, Root};
use thiserror::Error;

/// Coarse error classes callers use to decide between retrying and giving up.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed shape; never retried.
    Structural,
    /// Consensus violation; the block is invalid forever.
    Consensus,
    /// Nullifier conflict.
    DoubleSpend,
    /// Storage or scheduling failure; safe to retry.
    Transient,
    /// Pool or tree capacity exhausted; retry with a higher fee or later.
    Capacity,
    /// Already known; nothing to do.
    Duplicate,
    /// Parent unknown; retry once the parent arrives.
    Orphan,
    /// Chain-state invariant violated; block acceptance halts.
    Fatal,
}

/// Errors produced by the note commitment tree.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TreeError {
    /// Every leaf position of the fixed-depth tree is in use.
    #[error("note commitment tree is full ({capacity} leaves)")]
    TreeFull {
        /// Leaf capacity of the tree.
        capacity: u64,
    },

    /// The height was never committed to the tree.
    #[error("no tree state committed at height {0}")]
    UnknownHeight(u64),

    /// The requested position was not yet inserted at the requested height.
    #[error("position {position} not inserted (tree size {size})")]
    PositionNotYetInserted {
        /// Requested leaf position.
        position: u64,
        /// Tree size at the requested height.
        size: u64,
    },

    /// Heights must be committed in order without gaps.
    #[error("expected to commit height {expected}, got {got}")]
    NonContiguousHeight {
        /// Next height the tree can commit.
        expected: u64,
        /// Height the caller asked for.
        got: u64,
    },

    /// A persisted checkpoint does not match the root recomputed from leaves.
    #[error("checkpoint at height {height} does not match its leaves")]
    CheckpointMismatch {
        /// Height whose stored root disagrees.
        height: u64,
    },

    /// A frontier was requested beyond the current tree size.
    #[error("tree size {requested} exceeds current size {size}")]
    SizeOutOfRange {
        /// Requested size.
        requested: u64,
        /// Current size.
        size: u64,
    },
}

/// Errors produced by the nullifier set.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NullifierError {
    /// The nullifier is already spent, or appears twice in the batch.
    #[error("double spend of nullifier {nullifier}")]
    DoubleSpend {
        /// First duplicate found.
        nullifier: Nullifier,
    },

    /// A removal did not match a prior insertion.
    #[error("nullifier {nullifier} not recorded at height {height}")]
    NotRecorded {
        /// Nullifier that could not be removed.
        nullifier: Nullifier,
        /// Height it was expected at.
        height: u64,
    },
}

/// Errors produced while applying or unwinding blocks on the chain state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    /// Commitment tree failure.
    #[error(transparent)]
    Tree(#[from] TreeError),

    /// Nullifier set failure.
    #[error(transparent)]
    Nullifier(#[from] NullifierError),

    /// The block's height does not fit the tip it is applied to or removed from.
    #[error("block at height {got} does not fit the tip (expected height {expected})")]
    NotAtTip {
        /// Height the operation required.
        expected: u64,
        /// Height carried by the block.
        got: u64,
    },

    /// The block does not build on the current tip, or is not the tip.
    #[error("block at height {height} is not linked to the current tip")]
    NotLinked {
        /// Height carried by the block.
        height: u64,
    },

    /// Applying the block produced a different tree than its header commits to.
    #[error("commitment root mismatch at height {height}")]
    CommitmentMismatch {
        /// Height of the offending block.
        height: u64,
    },

    /// A reorg failed part way and the pre-reorg state was restored.
    #[error("reorg aborted at block {block}: {source}")]
    ReorgAborted {
        /// Block whose application failed.
        block: BlockHash,
        /// Underlying failure.
        source: Box<StateError>,
    },

    /// The state could not be restored; it no longer matches any chain.
    #[error("chain state corrupted: {0}")]
    Corrupted(String),
}

impl StateError {
    /// Error class.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StateError::Tree(TreeError::TreeFull { .. }) => ErrorKind::Capacity,
            StateError::Nullifier(NullifierError::DoubleSpend { .. }) => ErrorKind::DoubleSpend,
            StateError::ReorgAborted { .. } => ErrorKind::Consensus,
            StateError::Corrupted(_) => ErrorKind::Fatal,
            _ => ErrorKind::Consensus,
        }
    }
}

/// Why a single transaction is unacceptable in its context.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TxError {
    /// Malformed transaction.
    #[error("malformed transaction: {0}")]
    Structural(CoreError),

    /// The expiration height has been reached.
    #[error("expired at height {expiration} (block height {height})")]
    Expired {
        /// Declared expiration.
        expiration: u64,
        /// Height the transaction was checked against.
        height: u64,
    },

    /// Fee is below the activated minimum.
    #[error("fee {fee} below minimum {min}")]
    FeeBelowMinimum {
        /// Fee paid.
        fee: Amount,
        /// Required minimum.
        min: Amount,
    },

    /// A spend references a root that is not recent on this branch.
    #[error("spend {spend} anchored to unknown or stale root {anchor}")]
    UnknownAnchor {
        /// Spend index.
        spend: usize,
        /// Offending anchor.
        anchor: Root,
    },

    /// A spend proof failed verification.
    #[error("spend {0} proof does not verify")]
    InvalidSpendProof(usize),

    /// An output proof failed verification.
    #[error("output {0} proof does not verify")]
    InvalidOutputProof(usize),

    /// A nullifier is already spent or repeats within the transaction or block.
    #[error("double spend of nullifier {nullifier}")]
    DoubleSpend {
        /// Conflicting nullifier.
        nullifier: Nullifier,
    },
}

/// Why a candidate block is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BlockError {
    /// Malformed block or transaction shape.
    #[error("malformed block: {0}")]
    Structural(CoreError),

    /// Header rule violation (height, time, difficulty, PoW, merkle root).
    #[error("invalid header: {0}")]
    InvalidHeader(#[from] ConsensusError),

    /// Transaction at `index` violates a contextual rule.
    #[error("invalid transaction {index}: {source}")]
    InvalidTransaction {
        /// Position of the transaction in the block.
        index: usize,
        /// Underlying failure.
        source: TxError,
    },

    /// Coinbase value does not balance against fees and the reward schedule.
    #[error(
        "value balance violated: minted {minted}, fees {fees}, claimed reward {claimed_reward}, allowed {allowed_reward}"
    )]
    ValueBalance {
        /// Declared coinbase output value.
        minted: Amount,
        /// Sum of regular transaction fees.
        fees: Amount,
        /// Reward the coinbase claims.
        claimed_reward: Amount,
        /// Reward the schedule allows at this height.
        allowed_reward: Amount,
    },

    /// Header commitment root or note size does not match the applied outputs.
    #[error("commitment mismatch: header {header_root}/{header_size}, computed {computed_root}/{computed_size}")]
    CommitmentMismatch {
        /// Root committed in the header.
        header_root: Root,
        /// Size committed in the header.
        header_size: u64,
        /// Root after appending the block's outputs.
        computed_root: Root,
        /// Size after appending the block's outputs.
        computed_size: u64,
    },

    /// The outputs do not fit in the tree.
    #[error(transparent)]
    Tree(#[from] TreeError),

    /// Validation was cancelled because a heavier competitor is being applied.
    #[error("validation abandoned")]
    Abandoned,
}

impl BlockError {
    /// Error class.
    pub fn kind(&self) -> ErrorKind {
        match self {
            BlockError::Structural(_) => ErrorKind::Structural,
            BlockError::InvalidTransaction {
                source: TxError::DoubleSpend { .. },
                ..
            } => ErrorKind::DoubleSpend,
            BlockError::InvalidTransaction {
                source: TxError::Structural(_),
                ..
            } => ErrorKind::Structural,
            BlockError::Tree(TreeError::TreeFull { .. }) => ErrorKind::Capacity,
            BlockError::Abandoned
            | BlockError::InvalidHeader(ConsensusError::TimestampTooNew { .. }) => {
                ErrorKind::Transient
            }
            _ => ErrorKind::Consensus,
        }
    }

    /// Whether the block must be remembered as permanently invalid.
    pub fn is_permanent(&self) -> bool {
        !matches!(
            self,
            BlockError::Abandoned
                | BlockError::InvalidHeader(ConsensusError::TimestampTooNew { .. })
        )
    }
}
