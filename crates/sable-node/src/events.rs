//! Notifications emitted when the canonical head moves.

use sable_core::BlockHash;

/// The canonical head changed.
///
/// `rolled_back` lists the blocks removed from the canonical chain, tip
/// first; `applied` lists the blocks that replaced them, oldest first and
/// ending with `new_head`. A plain extension has an empty `rolled_back`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeadChange {
    /// New canonical tip.
    pub new_head: BlockHash,
    /// Height of the new tip.
    pub new_height: u64,
    /// Height of the last block shared by the old and new chains.
    pub ancestor_height: u64,
    /// Blocks that left the canonical chain.
    pub rolled_back: Vec<BlockHash>,
    /// Blocks that joined the canonical chain.
    pub applied: Vec<BlockHash>,
}

impl HeadChange {
    /// Whether any block was rolled back.
    pub fn is_reorg(&self) -> bool {
        !self.rolled_back.is_empty()
    }

    /// Number of blocks rolled back.
    pub fn depth(&self) -> usize {
        self.rolled_back.len()
    }
}
