//! Canonical chain state: commitment tree, nullifier set and the hash of
//! every canonical block by height.
//!
//! Blocks arrive here already validated. This module only applies and
//! unwinds them, and applies whole reorg plans with restore-on-failure.

use sable_core::{Block, BlockHash, Commitment, Nullifier, Root};
use tracing::{debug, warn};

use crate::error::StateError;
use crate::nullifier::NullifierSet;
use crate::tree::{MerkleWitness, NoteCommitmentTree};

/// A canonical block referenced by a reorg plan.
pub type PlannedBlock<'a> = (BlockHash, &'a Block);

/// Ledger state of the canonical chain.
#[derive(Clone, Debug)]
pub struct ChainState {
    tree: NoteCommitmentTree,
    nullifiers: NullifierSet,
    /// Canonical block hashes indexed by height.
    chain: Vec<BlockHash>,
}

impl ChainState {
    /// Empty state; the first applied block must be genesis (height 0).
    pub fn new(tree_depth: u8) -> Self {
        Self {
            tree: NoteCommitmentTree::new(tree_depth),
            nullifiers: NullifierSet::new(),
            chain: Vec::new(),
        }
    }

    /// Reassemble state loaded from storage.
    ///
    /// `chain` lists canonical hashes from genesis; the tree must have one
    /// committed height per canonical block.
    pub fn from_parts(
        tree: NoteCommitmentTree,
        nullifiers: NullifierSet,
        chain: Vec<BlockHash>,
    ) -> Result<Self, StateError> {
        let committed = tree.committed_height().map_or(0, |h| h + 1);
        if committed != chain.len() as u64 {
            return Err(StateError::Corrupted(format!(
                "tree has {committed} committed heights, chain has {} blocks",
                chain.len()
            )));
        }
        if let Some((nf, height)) = nullifiers.iter().find(|(_, h)| **h >= committed) {
            return Err(StateError::Corrupted(format!(
                "nullifier {nf} recorded at height {height} above the tip"
            )));
        }
        Ok(Self {
            tree,
            nullifiers,
            chain,
        })
    }

    /// Height and hash of the canonical tip.
    pub fn tip(&self) -> Option<(u64, BlockHash)> {
        let hash = *self.chain.last()?;
        Some((self.chain.len() as u64 - 1, hash))
    }

    /// Canonical hash at `height`.
    pub fn hash_at(&self, height: u64) -> Option<BlockHash> {
        usize::try_from(height)
            .ok()
            .and_then(|h| self.chain.get(h))
            .copied()
    }

    /// Whether `hash` is the canonical block at `height`.
    pub fn is_canonical(&self, hash: &BlockHash, height: u64) -> bool {
        self.hash_at(height).as_ref() == Some(hash)
    }

    /// Canonical hashes from genesis to tip.
    pub fn canonical_hashes(&self) -> &[BlockHash] {
        &self.chain
    }

    /// The note commitment tree.
    pub fn tree(&self) -> &NoteCommitmentTree {
        &self.tree
    }

    /// The spent nullifier set.
    pub fn nullifiers(&self) -> &NullifierSet {
        &self.nullifiers
    }

    /// Root after the canonical block at `height`.
    pub fn root_at(&self, height: u64) -> Result<Root, StateError> {
        Ok(self.tree.root_at(height)?)
    }

    /// Canonical roots at `parent_height` and up to `window` heights below it.
    pub fn recent_roots(&self, parent_height: u64, window: u64) -> impl Iterator<Item = Root> + '_ {
        let start = parent_height.saturating_sub(window);
        (start..=parent_height).filter_map(|h| self.tree.root_at(h).ok())
    }

    /// Authentication path for `position` against the root at `height`.
    pub fn witness(&self, position: u64, height: u64) -> Result<MerkleWitness, StateError> {
        Ok(self.tree.witness(position, height)?)
    }

    /// Extend the canonical chain by one block.
    ///
    /// Leaves the state untouched on failure.
    pub fn apply_block(&mut self, hash: BlockHash, block: &Block) -> Result<(), StateError> {
        let height = block.header.height;
        let expected = self.chain.len() as u64;
        if height != expected {
            return Err(StateError::NotAtTip {
                expected,
                got: height,
            });
        }
        if let Some(tip) = self.chain.last() {
            if block.header.prev != *tip {
                return Err(StateError::NotLinked { height });
            }
        }
        if self.tree.committed_height().map_or(0, |h| h + 1) != height {
            return Err(StateError::Corrupted(format!(
                "tree committed height out of step with chain at {height}"
            )));
        }

        let nullifiers: Vec<Nullifier> = block.nullifiers().collect();
        let commitments: Vec<Commitment> = block.commitments().collect();

        self.nullifiers.insert_all(&nullifiers, height)?;

        if let Err(e) = self.tree.append_all(&commitments) {
            self.undo_nullifiers(&nullifiers, height)?;
            return Err(e.into());
        }

        if self.tree.root() != block.header.commitment_root
            || self.tree.len() != block.header.note_size
        {
            self.tree.discard_uncommitted();
            self.undo_nullifiers(&nullifiers, height)?;
            return Err(StateError::CommitmentMismatch { height });
        }

        self.tree.commit_height(height)?;
        self.chain.push(hash);
        Ok(())
    }

    /// Remove the canonical tip, which must be `hash`.
    ///
    /// Leaves the state untouched on failure.
    pub fn unwind_block(&mut self, hash: BlockHash, block: &Block) -> Result<(), StateError> {
        let height = block.header.height;
        let expected = (self.chain.len() as u64).saturating_sub(1);
        if self.chain.is_empty() || height != expected {
            return Err(StateError::NotAtTip {
                expected,
                got: height,
            });
        }
        if self.chain.last() != Some(&hash) {
            return Err(StateError::NotLinked { height });
        }
        // Genesis is never unwound.
        let parent_height = height
            .checked_sub(1)
            .ok_or(StateError::NotAtTip { expected: 1, got: 0 })?;

        let nullifiers: Vec<Nullifier> = block.nullifiers().collect();
        self.nullifiers.remove_all(&nullifiers, height)?;

        if let Err(e) = self.tree.truncate_to(parent_height) {
            self.nullifiers
                .insert_all(&nullifiers, height)
                .map_err(|re| StateError::Corrupted(re.to_string()))?;
            return Err(e.into());
        }

        self.chain.pop();
        Ok(())
    }

    /// Switch branches: unwind `unwind` (tip first, down to just above the
    /// common ancestor) then connect `connect` (ancestor + 1 first).
    ///
    /// Whole-or-nothing: if any step fails, completed steps are reversed and
    /// [`StateError::ReorgAborted`] is returned with the pre-reorg state
    /// intact. [`StateError::Corrupted`] means the reversal itself failed.
    pub fn apply_reorg(
        &mut self,
        unwind: &[PlannedBlock<'_>],
        connect: &[PlannedBlock<'_>],
    ) -> Result<(), StateError> {
        for (done, (hash, block)) in unwind.iter().enumerate() {
            if let Err(source) = self.unwind_block(*hash, block) {
                warn!(block = %hash, error = %source, "reorg unwind failed; restoring");
                self.restore(&[], &unwind[..done])?;
                return Err(StateError::ReorgAborted {
                    block: *hash,
                    source: Box::new(source),
                });
            }
        }

        for (done, (hash, block)) in connect.iter().enumerate() {
            if let Err(source) = self.apply_block(*hash, block) {
                warn!(block = %hash, error = %source, "reorg connect failed; restoring");
                self.restore(&connect[..done], unwind)?;
                return Err(StateError::ReorgAborted {
                    block: *hash,
                    source: Box::new(source),
                });
            }
        }

        debug!(
            unwound = unwind.len(),
            connected = connect.len(),
            tip = ?self.tip(),
            "reorg applied"
        );
        Ok(())
    }

    /// Reverse `connected` (newest first) then re-apply `unwound` (oldest first).
    fn restore(
        &mut self,
        connected: &[PlannedBlock<'_>],
        unwound: &[PlannedBlock<'_>],
    ) -> Result<(), StateError> {
        for (hash, block) in connected.iter().rev() {
            self.unwind_block(*hash, block)
                .map_err(|e| StateError::Corrupted(format!("restore unwind {hash}: {e}")))?;
        }
        for (hash, block) in unwound.iter().rev() {
            self.apply_block(*hash, block)
                .map_err(|e| StateError::Corrupted(format!("restore apply {hash}: {e}")))?;
        }
        Ok(())
    }

    fn undo_nullifiers(&mut self, nullifiers: &[Nullifier], height: u64) -> Result<(), StateError> {
        self.nullifiers
            .remove_all(nullifiers, height)
            .map_err(|e| StateError::Corrupted(e.to_string()))
    }
}
