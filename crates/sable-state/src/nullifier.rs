//! Nullifier set.
//!
//! Each spent nullifier maps to the height of the canonical block that
//! revealed it, so a block's insertions can be undone exactly on reorg and
//! a side branch can ask "spent at or below the fork point?".
//!
//! Requirements:
//! - membership checks must be fast
//! - a block's nullifiers are inserted all-or-nothing
//! - iteration order does not matter for consensus (only presence/absence)

use hashbrown::{HashMap, HashSet};

use sable_core::Nullifier;

use crate::error::NullifierError;

/// Answers whether a nullifier is already spent on some branch.
pub trait NullifierView {
    /// Returns `true` if `nf` is spent.
    fn is_spent(&self, nf: &Nullifier) -> bool;
}

/// Spent nullifiers of the canonical chain.
#[derive(Clone, Debug, Default)]
pub struct NullifierSet {
    spent: HashMap<Nullifier, u64>,
}

impl NullifierSet {
    /// Create a new empty nullifier set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the nullifier has already been spent.
    pub fn contains(&self, nf: &Nullifier) -> bool {
        self.spent.contains_key(nf)
    }

    /// Height of the block that spent `nf`.
    pub fn height_of(&self, nf: &Nullifier) -> Option<u64> {
        self.spent.get(nf).copied()
    }

    /// Record every nullifier of `batch` as spent at `height`.
    ///
    /// Fails without modifying the set if any nullifier is already spent or
    /// repeats within the batch.
    pub fn insert_all(&mut self, batch: &[Nullifier], height: u64) -> Result<(), NullifierError> {
        let mut staged = HashSet::with_capacity(batch.len());
        for nf in batch {
            if self.spent.contains_key(nf) || !staged.insert(*nf) {
                return Err(NullifierError::DoubleSpend { nullifier: *nf });
            }
        }
        for nf in batch {
            self.spent.insert(*nf, height);
        }
        Ok(())
    }

    /// Undo a prior `insert_all(batch, height)`.
    ///
    /// Fails without modifying the set unless every nullifier is recorded at
    /// exactly `height`.
    pub fn remove_all(&mut self, batch: &[Nullifier], height: u64) -> Result<(), NullifierError> {
        for nf in batch {
            if self.spent.get(nf) != Some(&height) {
                return Err(NullifierError::NotRecorded {
                    nullifier: *nf,
                    height,
                });
            }
        }
        for nf in batch {
            self.spent.remove(nf);
        }
        Ok(())
    }

    /// Iterate `(nullifier, height)` pairs in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = (&Nullifier, &u64)> {
        self.spent.iter()
    }

    /// Number of spent nullifiers tracked.
    pub fn len(&self) -> usize {
        self.spent.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.spent.is_empty()
    }
}

impl NullifierView for NullifierSet {
    fn is_spent(&self, nf: &Nullifier) -> bool {
        self.contains(nf)
    }
}

/// Nullifiers spent on a branch that leaves the canonical chain at `fork_height`.
///
/// Canonical spends above the fork point belong to a competing branch and do
/// not count; spends by the branch's own blocks do.
#[derive(Debug)]
pub struct BranchNullifiers<'a> {
    canonical: &'a NullifierSet,
    fork_height: u64,
    branch: HashSet<Nullifier>,
}

impl<'a> BranchNullifiers<'a> {
    /// View of `canonical` truncated at `fork_height`, plus `branch` spends.
    pub fn new(
        canonical: &'a NullifierSet,
        fork_height: u64,
        branch: impl IntoIterator<Item = Nullifier>,
    ) -> Self {
        Self {
            canonical,
            fork_height,
            branch: branch.into_iter().collect(),
        }
    }
}

impl NullifierView for BranchNullifiers<'_> {
    fn is_spent(&self, nf: &Nullifier) -> bool {
        self.branch.contains(nf)
            || self
                .canonical
                .height_of(nf)
                .is_some_and(|h| h <= self.fork_height)
    }
}
