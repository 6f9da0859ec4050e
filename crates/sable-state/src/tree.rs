// Consensus-critical. Changes require a network upgrade + tests.
//! Fixed-depth, append-only note commitment tree.
//!
//! Leaves are note commitments in insertion order. Empty positions hash to a
//! per-level empty node, so the root of a tree of any size is well defined:
//! `empty(0) = H_empty`, `empty(l) = H_node(empty(l-1), empty(l-1))`.
//!
//! The tree keeps every complete subtree node (`nodes[level]`) so that
//! witnesses against any committed height can be produced without replay,
//! and truncating back to a height is a plain `Vec::truncate` per level.
//!
//! [`Frontier`] is the constant-size view used to preview the root after a
//! candidate block without touching the tree.
//!
//! Hash function: BLAKE3 with domain separators.

use std::sync::OnceLock;

use hashbrown::HashMap;
use sable_core::{hash32, Commitment, Hash32, Root};

use crate::error::TreeError;

/// Domain separator for interior nodes.
const DS_TREE_NODE: &[u8] = b"SABLE::NOTE_TREE_NODE::V0";
/// Domain separator for leaves.
const DS_TREE_LEAF: &[u8] = b"SABLE::NOTE_TREE_LEAF::V0";
/// Domain separator for the empty leaf.
const DS_TREE_EMPTY: &[u8] = b"SABLE::NOTE_TREE_EMPTY::V0";

/// Deepest supported tree; keeps capacities representable in `u64`.
pub const MAX_TREE_DEPTH: u8 = 62;

/// Tree size and root recorded when a block height is committed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Checkpoint {
    /// Number of leaves after the block.
    pub size: u64,
    /// Root after the block.
    pub root: Root,
}

/// Authentication path for one leaf against the root at some height.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MerkleWitness {
    /// Leaf position.
    pub position: u64,
    /// Siblings from the leaf level upward; `path.len()` equals the depth.
    pub path: Vec<Hash32>,
}

impl MerkleWitness {
    /// Root implied by this path for `commitment`.
    pub fn root(&self, commitment: &Commitment) -> Root {
        let mut node = leaf_hash(commitment);
        for (level, sibling) in self.path.iter().enumerate() {
            node = if (self.position >> level) & 1 == 0 {
                parent_hash(&node, sibling)
            } else {
                parent_hash(sibling, &node)
            };
        }
        node
    }

    /// Whether `commitment` sits at `position` under `root`.
    pub fn verify(&self, commitment: &Commitment, root: &Root) -> bool {
        self.root(commitment) == *root
    }
}

/// Rightmost path of a tree: enough to append and compute roots.
#[derive(Clone, Debug)]
pub struct Frontier {
    depth: u8,
    size: u64,
    /// Complete left-sibling subtree roots keyed by level.
    ///
    /// A level is present iff bit `level` of `size` is set.
    ommers: HashMap<u8, Hash32>,
}

impl Frontier {
    /// Empty frontier for a tree of `depth`.
    pub fn new(depth: u8) -> Self {
        Self {
            depth: depth.min(MAX_TREE_DEPTH),
            size: 0,
            ommers: HashMap::new(),
        }
    }

    /// Number of leaves covered.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Append one commitment, returning its position.
    pub fn append(&mut self, commitment: &Commitment) -> Result<u64, TreeError> {
        let capacity = capacity(self.depth);
        if self.size >= capacity {
            return Err(TreeError::TreeFull { capacity });
        }

        let mut node = leaf_hash(commitment);
        let mut level: u8 = 0;
        let mut idx = self.size;

        // While the index is odd at this level a complete left sibling exists;
        // combine and carry upward.
        while idx & 1 == 1 {
            let left = self
                .ommers
                .remove(&level)
                .unwrap_or_else(|| empty_at(level));
            node = parent_hash(&left, &node);
            idx >>= 1;
            level += 1;
        }

        self.ommers.insert(level, node);
        let position = self.size;
        self.size += 1;
        Ok(position)
    }

    /// Root of the tree this frontier describes.
    pub fn root(&self) -> Root {
        if self.size == capacity(self.depth) {
            return self
                .ommers
                .get(&self.depth)
                .copied()
                .unwrap_or_else(|| empty_at(self.depth));
        }

        let mut spine = empty_at(0);
        for level in 0..self.depth {
            spine = match self.ommers.get(&level) {
                Some(left) => parent_hash(left, &spine),
                None => parent_hash(&spine, &empty_at(level)),
            };
        }
        spine
    }
}

/// The note commitment tree with per-height checkpoints.
#[derive(Clone, Debug)]
pub struct NoteCommitmentTree {
    depth: u8,
    leaves: Vec<Commitment>,
    /// `nodes[l][i]` is the root of the complete subtree covering leaves
    /// `i * 2^l .. (i + 1) * 2^l`.
    nodes: Vec<Vec<Hash32>>,
    /// Indexed by block height.
    checkpoints: Vec<Checkpoint>,
}

impl NoteCommitmentTree {
    /// Empty tree of `depth` with no committed heights.
    pub fn new(depth: u8) -> Self {
        let depth = depth.min(MAX_TREE_DEPTH);
        Self {
            depth,
            leaves: Vec::new(),
            nodes: vec![Vec::new(); depth as usize + 1],
            checkpoints: Vec::new(),
        }
    }

    /// Rebuild a tree from its leaves and per-height checkpoints.
    ///
    /// Every recomputed root must equal the stored one.
    pub fn restore(
        depth: u8,
        leaves: &[Commitment],
        checkpoints: &[Checkpoint],
    ) -> Result<Self, TreeError> {
        let mut tree = Self::new(depth);
        for (height, cp) in checkpoints.iter().enumerate() {
            let height = height as u64;
            let start = tree.len();
            if cp.size < start || cp.size > leaves.len() as u64 {
                return Err(TreeError::CheckpointMismatch { height });
            }
            tree.append_all(&leaves[start as usize..cp.size as usize])?;
            if tree.commit_height(height)? != cp.root {
                return Err(TreeError::CheckpointMismatch { height });
            }
        }
        if tree.len() != leaves.len() as u64 {
            let height = tree.committed_height().unwrap_or(0);
            return Err(TreeError::CheckpointMismatch { height });
        }
        Ok(tree)
    }

    /// Tree depth.
    pub fn depth(&self) -> u8 {
        self.depth
    }

    /// Maximum number of leaves.
    pub fn capacity(&self) -> u64 {
        capacity(self.depth)
    }

    /// Number of leaves, including any appended since the last commit.
    pub fn len(&self) -> u64 {
        self.leaves.len() as u64
    }

    /// Whether no leaf was ever appended.
    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    /// Commitment stored at `position`.
    pub fn leaf(&self, position: u64) -> Option<Commitment> {
        usize::try_from(position)
            .ok()
            .and_then(|p| self.leaves.get(p))
            .copied()
    }

    /// Leaves from `start` to the end.
    pub fn leaves_from(&self, start: u64) -> &[Commitment] {
        let start = usize::try_from(start).unwrap_or(usize::MAX).min(self.leaves.len());
        &self.leaves[start..]
    }

    /// Append one commitment, returning its position.
    pub fn append(&mut self, commitment: Commitment) -> Result<u64, TreeError> {
        let position = self.len();
        let capacity = self.capacity();
        if position >= capacity {
            return Err(TreeError::TreeFull { capacity });
        }

        let mut node = leaf_hash(&commitment);
        self.nodes[0].push(node);
        let mut idx = position as usize;
        let mut level = 0usize;
        while idx & 1 == 1 && level < self.depth as usize {
            let left = self.nodes[level][idx - 1];
            node = parent_hash(&left, &node);
            level += 1;
            idx >>= 1;
            self.nodes[level].push(node);
        }

        self.leaves.push(commitment);
        Ok(position)
    }

    /// Append all `commitments` or none of them.
    pub fn append_all(&mut self, commitments: &[Commitment]) -> Result<(), TreeError> {
        let capacity = self.capacity();
        if self.len().saturating_add(commitments.len() as u64) > capacity {
            return Err(TreeError::TreeFull { capacity });
        }
        for cm in commitments {
            self.append(*cm)?;
        }
        Ok(())
    }

    /// Root over all current leaves.
    pub fn root(&self) -> Root {
        self.root_for_size(self.len())
    }

    /// Record the current size and root as the state after block `height`.
    ///
    /// Heights are committed contiguously from 0.
    pub fn commit_height(&mut self, height: u64) -> Result<Root, TreeError> {
        let expected = self.checkpoints.len() as u64;
        if height != expected {
            return Err(TreeError::NonContiguousHeight {
                expected,
                got: height,
            });
        }
        let root = self.root();
        self.checkpoints.push(Checkpoint {
            size: self.len(),
            root,
        });
        Ok(root)
    }

    /// Highest committed height.
    pub fn committed_height(&self) -> Option<u64> {
        (self.checkpoints.len() as u64).checked_sub(1)
    }

    /// Checkpoint recorded for `height`.
    pub fn checkpoint(&self, height: u64) -> Result<Checkpoint, TreeError> {
        usize::try_from(height)
            .ok()
            .and_then(|h| self.checkpoints.get(h))
            .copied()
            .ok_or(TreeError::UnknownHeight(height))
    }

    /// Root after block `height`.
    pub fn root_at(&self, height: u64) -> Result<Root, TreeError> {
        Ok(self.checkpoint(height)?.root)
    }

    /// Size after block `height`.
    pub fn size_at(&self, height: u64) -> Result<u64, TreeError> {
        Ok(self.checkpoint(height)?.size)
    }

    /// Authentication path for `position` against the root at `height`.
    pub fn witness(&self, position: u64, height: u64) -> Result<MerkleWitness, TreeError> {
        let size = self.size_at(height)?;
        if position >= size {
            return Err(TreeError::PositionNotYetInserted { position, size });
        }

        let spines = self.spines(size);
        let mut path = Vec::with_capacity(self.depth as usize);
        for level in 0..self.depth as usize {
            let sibling = (position >> level) ^ 1;
            let complete = size >> level;
            let node = if sibling < complete {
                self.nodes[level][sibling as usize]
            } else if sibling == complete {
                spines[level]
            } else {
                empty_at(level as u8)
            };
            path.push(node);
        }
        Ok(MerkleWitness { position, path })
    }

    /// Drop every leaf and checkpoint above `height`.
    pub fn truncate_to(&mut self, height: u64) -> Result<(), TreeError> {
        let size = self.size_at(height)?;
        self.truncate_leaves(size);
        self.checkpoints.truncate(height as usize + 1);
        Ok(())
    }

    /// Drop leaves appended since the last committed height.
    pub fn discard_uncommitted(&mut self) {
        let size = self.checkpoints.last().map_or(0, |c| c.size);
        self.truncate_leaves(size);
    }

    /// Frontier after block `height`.
    pub fn frontier_at(&self, height: u64) -> Result<Frontier, TreeError> {
        self.frontier_for_size(self.size_at(height)?)
    }

    /// Frontier over the first `size` leaves.
    pub fn frontier_for_size(&self, size: u64) -> Result<Frontier, TreeError> {
        if size > self.len() {
            return Err(TreeError::SizeOutOfRange {
                requested: size,
                size: self.len(),
            });
        }
        let mut ommers = HashMap::new();
        for level in 0..=self.depth {
            let idx = size >> level;
            if idx & 1 == 1 {
                ommers.insert(level, self.nodes[level as usize][idx as usize - 1]);
            }
        }
        Ok(Frontier {
            depth: self.depth,
            size,
            ommers,
        })
    }

    /// Height of the block that inserted `position`.
    pub fn height_of_position(&self, position: u64) -> Option<u64> {
        let height = self.checkpoints.partition_point(|c| c.size <= position);
        (height < self.checkpoints.len()).then_some(height as u64)
    }

    fn truncate_leaves(&mut self, size: u64) {
        self.leaves.truncate(size as usize);
        for (level, nodes) in self.nodes.iter_mut().enumerate() {
            nodes.truncate((size >> level) as usize);
        }
    }

    /// `spines[l]` is the node at level `l` holding leaf `size` (or the
    /// first empty position): partially filled, or entirely empty.
    fn spines(&self, size: u64) -> Vec<Hash32> {
        let mut spines = Vec::with_capacity(self.depth as usize + 1);
        let mut spine = empty_at(0);
        spines.push(spine);
        for level in 0..self.depth as usize {
            let idx = size >> level;
            spine = if idx & 1 == 1 {
                parent_hash(&self.nodes[level][idx as usize - 1], &spine)
            } else {
                parent_hash(&spine, &empty_at(level as u8))
            };
            spines.push(spine);
        }
        spines
    }

    fn root_for_size(&self, size: u64) -> Root {
        if size == self.capacity() {
            return self.nodes[self.depth as usize][0];
        }
        self.spines(size)[self.depth as usize]
    }
}

fn capacity(depth: u8) -> u64 {
    1u64 << depth
}

fn leaf_hash(commitment: &Commitment) -> Hash32 {
    hash32(DS_TREE_LEAF, commitment.as_bytes())
}

/// Compute parent hash for two child nodes.
fn parent_hash(left: &Hash32, right: &Hash32) -> Hash32 {
    let mut bytes = [0u8; 64];
    bytes[..32].copy_from_slice(left.as_bytes());
    bytes[32..].copy_from_slice(right.as_bytes());
    hash32(DS_TREE_NODE, &bytes)
}

/// Root of an entirely empty subtree of `2^level` leaves.
pub fn empty_at(level: u8) -> Hash32 {
    static EMPTY: OnceLock<Vec<Hash32>> = OnceLock::new();
    let table = EMPTY.get_or_init(|| {
        let mut table = Vec::with_capacity(MAX_TREE_DEPTH as usize + 1);
        let mut node = hash32(DS_TREE_EMPTY, &[]);
        table.push(node);
        for _ in 0..MAX_TREE_DEPTH {
            node = parent_hash(&node, &node);
            table.push(node);
        }
        table
    });
    table[level.min(MAX_TREE_DEPTH) as usize]
}
