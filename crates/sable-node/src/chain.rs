//! Block index, fork choice and persistence of the canonical chain.
//!
//! A block moves through `Unvalidated -> ValidOrphan -> ValidCanonical`, or
//! ends in `Invalid`. Every valid block is kept forever; only its canonical
//! status changes. Validation is `&self` and may run concurrently against any
//! known parent; [`ChainProcessor::commit`] is `&mut self` and serializes
//! head changes.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use borsh::{BorshDeserialize, BorshSerialize};
use hashbrown::{HashMap, HashSet};
use num_bigint::BigUint;
use sable_consensus::{
    median_time_past, tip_is_better, validate_pow, work_from_bits, ConsensusParams,
    ConsensusRules, HeaderContext, NetworkUpgrade,
};
use sable_core::{
    tx_merkle_root, Amount, Block, BlockHash, BlockHeader, Commitment, Hash32, Nullifier, Root,
    Transaction, PROTOCOL_VERSION,
};
use sable_state::{
    BindingProofVerifier, BlockError, BlockValidator, BranchNullifiers, ChainState, Checkpoint, Frontier,
    MerkleWitness, NoteCommitmentTree, NullifierSet, PlannedBlock, ProofVerifier, StateError,
    TxContext, TxError, ValidatedBlock, ValidationContext,
};
use tracing::{debug, error, info, warn};

use crate::error::{ChainError, StorageError};
use crate::events::HeadChange;
use crate::storage::{decode, get_decoded, keys, ChainStorage, WriteBatch};

/// Where a known block stands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum BlockStatus {
    /// Valid, stored, not on the canonical chain.
    ValidOrphan,
    /// Valid and on the canonical chain.
    ValidCanonical,
    /// Rejected; never re-validated.
    Invalid,
}

/// Persisted per-block metadata.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct IndexRecord {
    /// Block height.
    pub height: u64,
    /// Cumulative work, big-endian.
    pub cumulative_work: Vec<u8>,
    /// Arrival order; breaks work ties.
    pub seen: u64,
    /// Canonical status when last written.
    pub status: BlockStatus,
}

/// Everything a miner needs to assemble a child of `prev`.
#[derive(Clone, Debug)]
pub struct BlockTemplate {
    /// Parent hash.
    pub prev: BlockHash,
    /// Height of the block to build.
    pub height: u64,
    /// Required difficulty bits.
    pub bits: u32,
    /// Median-time-past of the parent's ancestry; the timestamp must exceed it.
    pub median_time_past: u64,
    /// Smallest timestamp at or after `now` that satisfies the time rules.
    pub timestamp: u64,
    /// Reward the coinbase may claim.
    pub reward: Amount,
    /// Commitment tree frontier after the parent.
    pub frontier: Frontier,
    /// Size limit of the serialized block.
    pub max_block_bytes: usize,
}

impl BlockTemplate {
    /// Unmined block over `txs`, the first of which must be the coinbase.
    ///
    /// Fills in the tx merkle root and the commitment root and size after
    /// appending every output to the frontier; the nonce is left at zero.
    pub fn assemble(&self, txs: Vec<Transaction>) -> Result<Block, BlockError> {
        let mut frontier = self.frontier.clone();
        for cm in txs.iter().flat_map(|tx| tx.commitments()) {
            frontier.append(&cm)?;
        }
        Ok(Block {
            header: BlockHeader {
                version: PROTOCOL_VERSION,
                height: self.height,
                prev: self.prev,
                tx_merkle_root: tx_merkle_root(&txs).map_err(BlockError::Structural)?,
                commitment_root: frontier.root(),
                note_size: frontier.size(),
                timestamp: self.timestamp,
                bits: self.bits,
                nonce: 0,
            },
            txs,
        })
    }
}

struct BlockEntry {
    block: Arc<Block>,
    height: u64,
    cumulative_work: BigUint,
    seen: u64,
}

impl BlockEntry {
    fn record(&self, status: BlockStatus) -> IndexRecord {
        IndexRecord {
            height: self.height,
            cumulative_work: self.cumulative_work.to_bytes_be(),
            seen: self.seen,
            status,
        }
    }
}

/// A parent's position relative to the canonical chain.
struct Branch<'a> {
    /// Highest canonical ancestor (the parent itself when canonical).
    fork_height: u64,
    /// Non-canonical blocks from the fork point up to the parent, oldest first.
    side: Vec<&'a BlockEntry>,
}

struct ParentContext {
    header: HeaderContext,
    anchors: HashSet<Root>,
}

/// Head change computed before any state is touched.
struct ReorgPlan {
    ancestor_height: u64,
    old_height: u64,
    old_size: u64,
    /// Tip first.
    unwind: Vec<(BlockHash, Arc<Block>)>,
    /// Oldest first; ends with the new head.
    connect: Vec<(BlockHash, Arc<Block>)>,
}

impl ReorgPlan {
    fn unwind_plan(&self) -> Vec<PlannedBlock<'_>> {
        self.unwind.iter().map(|(h, b)| (*h, b.as_ref())).collect()
    }

    fn connect_plan(&self) -> Vec<PlannedBlock<'_>> {
        self.connect.iter().map(|(h, b)| (*h, b.as_ref())).collect()
    }
}

/// Owns the block index and the canonical [`ChainState`].
pub struct ChainProcessor {
    rules: ConsensusRules,
    verifier: Box<dyn ProofVerifier>,
    storage: Arc<dyn ChainStorage>,
    entries: HashMap<BlockHash, BlockEntry>,
    invalid: HashSet<BlockHash>,
    state: ChainState,
    genesis: BlockHash,
    next_seen: u64,
    halted: Option<String>,
}

impl ChainProcessor {
    /// Open the chain in `storage`, initializing it with `genesis` when empty.
    pub fn open(
        storage: Arc<dyn ChainStorage>,
        params: ConsensusParams,
        genesis: Block,
    ) -> Result<Self, ChainError> {
        Self::open_with_verifier(storage, params, genesis, Box::new(BindingProofVerifier))
    }

    /// [`ChainProcessor::open`] with a custom proof verifier.
    pub fn open_with_verifier(
        storage: Arc<dyn ChainStorage>,
        params: ConsensusParams,
        genesis: Block,
        verifier: Box<dyn ProofVerifier>,
    ) -> Result<Self, ChainError> {
        check_genesis(&genesis)?;
        let genesis_hash = genesis
            .hash()
            .map_err(|e| ChainError::InvalidGenesis(e.to_string()))?;
        let mut processor = Self {
            state: ChainState::new(params.tree_depth),
            rules: ConsensusRules::new(params),
            verifier,
            storage,
            entries: HashMap::new(),
            invalid: HashSet::new(),
            genesis: genesis_hash,
            next_seen: 0,
            halted: None,
        };

        match get_decoded::<BlockHash>(processor.storage.as_ref(), keys::CHAIN_HEAD)? {
            None => processor.init(genesis_hash, genesis)?,
            Some(head) => processor.reload(head)?,
        }
        Ok(processor)
    }

    fn init(&mut self, hash: BlockHash, genesis: Block) -> Result<(), ChainError> {
        self.state
            .apply_block(hash, &genesis)
            .map_err(|e| ChainError::InvalidGenesis(e.to_string()))?;
        let entry = BlockEntry {
            cumulative_work: work_from_bits(genesis.header.bits)
                .map_err(|e| ChainError::InvalidGenesis(e.to_string()))?,
            block: Arc::new(genesis),
            height: 0,
            seen: 0,
        };

        let mut batch = WriteBatch::new();
        batch.put(keys::block(&hash), entry.block.as_ref())?;
        batch.put(keys::index(&hash), &entry.record(BlockStatus::ValidCanonical))?;
        for (position, cm) in self.state.tree().leaves_from(0).iter().enumerate() {
            batch.put(keys::tree_leaf(position as u64), cm)?;
        }
        let root = self.state.tree().root();
        batch.put(keys::tree_root(0), &(root, self.state.tree().len()))?;
        for nf in entry.block.nullifiers() {
            batch.put(keys::nullifier(&nf), &0u64)?;
        }
        batch.put(keys::CHAIN_HEAD.to_vec(), &hash)?;
        self.storage.write_batch(batch)?;

        info!(%hash, "initialized chain from genesis");
        self.entries.insert(hash, entry);
        self.next_seen = 1;
        Ok(())
    }

    fn reload(&mut self, head: BlockHash) -> Result<(), ChainError> {
        let storage = Arc::clone(&self.storage);

        for (key, value) in storage.scan_prefix(keys::INDEX)? {
            let hash = Hash32(key_suffix(&key, keys::INDEX)?);
            let record: IndexRecord = decode(&key, &value)?;
            let block: Block = get_decoded(storage.as_ref(), &keys::block(&hash))?
                .ok_or_else(|| ChainError::Corrupted(format!("index {hash} has no block")))?;
            self.next_seen = self.next_seen.max(record.seen + 1);
            self.entries.insert(
                hash,
                BlockEntry {
                    block: Arc::new(block),
                    height: record.height,
                    cumulative_work: BigUint::from_bytes_be(&record.cumulative_work),
                    seen: record.seen,
                },
            );
        }

        let mut chain = Vec::new();
        let mut cursor = head;
        let mut expected = None;
        loop {
            let entry = self.entry(&cursor)?;
            if expected.is_some_and(|h| h != entry.height) {
                return Err(ChainError::Corrupted(format!(
                    "block {cursor} stored at unexpected height {}",
                    entry.height
                )));
            }
            chain.push(cursor);
            if entry.height == 0 {
                break;
            }
            expected = Some(entry.height - 1);
            cursor = entry.block.header.prev;
        }
        chain.reverse();
        if let Some(&found) = chain.first() {
            if found != self.genesis {
                return Err(ChainError::GenesisMismatch {
                    expected: self.genesis,
                    found,
                });
            }
        }

        let mut leaves = Vec::new();
        for (key, value) in storage.scan_prefix(keys::TREE_LEAF)? {
            leaves.push(decode::<Commitment>(&key, &value)?);
        }
        let mut checkpoints = Vec::new();
        for (key, value) in storage.scan_prefix(keys::TREE_ROOT)? {
            let (root, size): (Root, u64) = decode(&key, &value)?;
            checkpoints.push(Checkpoint { size, root });
        }
        let tree = NoteCommitmentTree::restore(self.rules.params().tree_depth, &leaves, &checkpoints)
            .map_err(|e| ChainError::Corrupted(e.to_string()))?;

        let mut nullifiers = NullifierSet::new();
        for (key, value) in storage.scan_prefix(keys::NULLIFIER)? {
            let nf = Nullifier(key_suffix(&key, keys::NULLIFIER)?);
            let height: u64 = decode(&key, &value)?;
            nullifiers
                .insert_all(&[nf], height)
                .map_err(|e| ChainError::Corrupted(e.to_string()))?;
        }

        let state = ChainState::from_parts(tree, nullifiers, chain)
            .map_err(|e| ChainError::Corrupted(e.to_string()))?;
        for (height, hash) in state.canonical_hashes().iter().enumerate() {
            let header = &self.entry(hash)?.block.header;
            let cp = state
                .tree()
                .checkpoint(height as u64)
                .map_err(|e| ChainError::Corrupted(e.to_string()))?;
            if cp.root != header.commitment_root || cp.size != header.note_size {
                return Err(ChainError::Corrupted(format!(
                    "tree state at height {height} does not match block {hash}"
                )));
            }
        }
        self.state = state;

        info!(
            height = self.head_height(),
            head = %head,
            blocks = self.entries.len(),
            "reloaded chain from storage"
        );
        Ok(())
    }

    /// Consensus rules in force.
    pub fn rules(&self) -> &ConsensusRules {
        &self.rules
    }

    /// Canonical ledger state.
    pub fn state(&self) -> &ChainState {
        &self.state
    }

    /// Genesis hash.
    pub fn genesis_hash(&self) -> BlockHash {
        self.genesis
    }

    /// Canonical tip.
    pub fn head(&self) -> BlockHash {
        self.state.tip().map_or(self.genesis, |(_, hash)| hash)
    }

    /// Height of the canonical tip.
    pub fn head_height(&self) -> u64 {
        self.state.tip().map_or(0, |(height, _)| height)
    }

    /// Stored block by hash.
    pub fn block(&self, hash: &BlockHash) -> Option<Arc<Block>> {
        self.entries.get(hash).map(|e| Arc::clone(&e.block))
    }

    /// Status of a known block.
    pub fn status(&self, hash: &BlockHash) -> Option<BlockStatus> {
        if self.invalid.contains(hash) {
            return Some(BlockStatus::Invalid);
        }
        self.entries.get(hash).map(|e| {
            if self.state.is_canonical(hash, e.height) {
                BlockStatus::ValidCanonical
            } else {
                BlockStatus::ValidOrphan
            }
        })
    }

    /// Cumulative work of a stored block.
    pub fn cumulative_work(&self, hash: &BlockHash) -> Option<&BigUint> {
        self.entries.get(hash).map(|e| &e.cumulative_work)
    }

    /// Cumulative work `block` would have if accepted.
    pub fn candidate_work(&self, block: &Block) -> Option<BigUint> {
        let parent = self.entries.get(&block.header.prev)?;
        let work = work_from_bits(block.header.bits).ok()?;
        Some(&parent.cumulative_work + work)
    }

    /// Canonical hash at `height`.
    pub fn canonical_hash(&self, height: u64) -> Option<BlockHash> {
        self.state.hash_at(height)
    }

    /// Commitment root after the canonical block at `height`.
    pub fn root_at(&self, height: u64) -> Result<Root, ChainError> {
        self.state.root_at(height).map_err(ChainError::State)
    }

    /// Authentication path for `position` against the root at `height`.
    pub fn witness(&self, position: u64, height: u64) -> Result<MerkleWitness, ChainError> {
        self.state.witness(position, height).map_err(ChainError::State)
    }

    /// Whether `nf` is spent on the canonical chain.
    pub fn is_nullifier_spent(&self, nf: &Nullifier) -> bool {
        self.state.nullifiers().contains(nf)
    }

    /// Whether a previous failure stopped block acceptance.
    pub fn is_halted(&self) -> bool {
        self.halted.is_some()
    }

    /// Whether the note at `position` is spendable at the current head.
    ///
    /// Coinbase outputs wait until the head is `maturity_window` blocks past
    /// their block; other notes are spendable once canonical.
    pub fn is_output_spendable(&self, position: u64) -> Result<bool, ChainError> {
        let tree = self.state.tree();
        let height = tree
            .height_of_position(position)
            .ok_or(ChainError::UnknownPosition(position))?;
        let hash = self
            .state
            .hash_at(height)
            .ok_or(ChainError::UnknownPosition(position))?;
        let block = &self.entry(&hash)?.block;
        let first = match height.checked_sub(1) {
            Some(parent) => tree.size_at(parent).map_err(|e| ChainError::State(e.into()))?,
            None => 0,
        };
        let coinbase_outputs = block.coinbase().map_or(0, |tx| tx.outputs.len() as u64);
        if position < first + coinbase_outputs {
            return Ok(self.rules.is_block_mature(height, self.head_height()));
        }
        Ok(true)
    }

    /// Difficulty bits required for a child of `parent`.
    pub fn next_bits(&self, parent: &BlockHash) -> Result<u32, ChainError> {
        Ok(self.parent_context(*parent, 0)?.header.expected_bits)
    }

    /// Template for extending the canonical head.
    pub fn block_template(&self, now: u64) -> Result<BlockTemplate, ChainError> {
        self.block_template_on(self.head(), now)
    }

    /// Template for a child of any stored block.
    pub fn block_template_on(&self, parent: BlockHash, now: u64) -> Result<BlockTemplate, ChainError> {
        self.ensure_running()?;
        let parent_entry = self.entries.get(&parent).ok_or(ChainError::UnknownParent {
            block: Hash32::zero(),
            parent,
        })?;
        let branch = self.branch(parent)?;
        let frontier = self.branch_frontier(&branch)?;
        let ctx = self.parent_context(parent, now)?.header;
        let height = parent_entry.height + 1;

        let mut timestamp = now.max(ctx.median_time_past + 1);
        if self.rules.is_active(NetworkUpgrade::SequentialBlockTime, height) {
            timestamp = timestamp.max(ctx.parent_timestamp + 1);
        }
        Ok(BlockTemplate {
            prev: parent,
            height,
            bits: ctx.expected_bits,
            median_time_past: ctx.median_time_past,
            timestamp,
            reward: self.rules.reward_at(height),
            frontier,
            max_block_bytes: self.rules.params().max_block_bytes,
        })
    }

    /// Check a loose transaction against the canonical head, as if mined in
    /// the next block. `staged` holds nullifiers claimed by transactions
    /// selected alongside it.
    pub fn check_transaction(
        &self,
        tx: &Transaction,
        staged: &mut HashSet<Nullifier>,
    ) -> Result<(), TxError> {
        let head_height = self.head_height();
        let anchors: HashSet<Root> = self
            .state
            .recent_roots(head_height, self.rules.params().anchor_window)
            .collect();
        let ctx = TxContext {
            height: head_height + 1,
            anchors: &anchors,
            nullifiers: self.state.nullifiers(),
        };
        BlockValidator::new(&self.rules, self.verifier.as_ref()).validate_transaction(tx, &ctx, staged)
    }

    /// Validate `block` against its parent's branch without touching state.
    pub fn validate(
        &self,
        block: Arc<Block>,
        now: u64,
        cancel: Option<Arc<AtomicBool>>,
    ) -> Result<ValidatedBlock, ChainError> {
        self.ensure_running()?;
        let hash = block.hash().map_err(|e| ChainError::Block {
            hash: Hash32::zero(),
            source: BlockError::Structural(e),
        })?;
        self.check_admissible(hash, &block)?;

        let parent = block.header.prev;
        let branch = self.branch(parent)?;
        let nullifiers = BranchNullifiers::new(
            self.state.nullifiers(),
            branch.fork_height,
            branch.side.iter().flat_map(|e| e.block.nullifiers()),
        );
        let frontier = self.branch_frontier(&branch)?;
        let ParentContext { header, anchors } = self.parent_context(parent, now)?;
        let ctx = ValidationContext {
            parent_hash: parent,
            header,
            anchors,
            nullifiers: &nullifiers,
            frontier,
            cancel,
        };

        let validated = BlockValidator::new(&self.rules, self.verifier.as_ref())
            .validate(block, &ctx)
            .map_err(|source| ChainError::Block { hash, source })?;
        debug!(%hash, height = validated.height(), fork_height = branch.fork_height, "block validated");
        Ok(validated)
    }

    /// Store a validated block and move the head if it now carries the most work.
    ///
    /// Returns the head change, or `None` when the block was stored as a
    /// side branch. On any error the chain is exactly as before the call.
    pub fn commit(&mut self, validated: ValidatedBlock) -> Result<Option<HeadChange>, ChainError> {
        self.ensure_running()?;
        let hash = validated.hash();
        let block = Arc::clone(validated.block());
        if self.entries.contains_key(&hash) {
            return Err(ChainError::AlreadyKnown(hash));
        }
        let parent = self
            .entries
            .get(&block.header.prev)
            .ok_or(ChainError::UnknownParent {
                block: hash,
                parent: block.header.prev,
            })?;
        let work = work_from_bits(block.header.bits).map_err(|e| ChainError::Block {
            hash,
            source: e.into(),
        })?;
        let entry = BlockEntry {
            cumulative_work: &parent.cumulative_work + work,
            height: block.header.height,
            block,
            seen: self.next_seen,
        };
        self.next_seen += 1;

        let head = self.entry(&self.head())?;
        if !tip_is_better(&entry.cumulative_work, entry.seen, &head.cumulative_work, head.seen) {
            let mut batch = WriteBatch::new();
            batch.put(keys::block(&hash), entry.block.as_ref())?;
            batch.put(keys::index(&hash), &entry.record(BlockStatus::ValidOrphan))?;
            self.storage.write_batch(batch)?;
            info!(%hash, height = entry.height, work = %entry.cumulative_work, "stored side-branch block");
            self.entries.insert(hash, entry);
            return Ok(None);
        }

        self.switch_head(hash, entry).map(Some)
    }

    /// Validate then commit, remembering consensus failures.
    pub fn submit(&mut self, block: Arc<Block>, now: u64) -> Result<Option<HeadChange>, ChainError> {
        let result = self
            .validate(block, now, None)
            .and_then(|validated| self.commit(validated));
        if let Err(err) = &result {
            self.record_rejection(err);
        }
        result
    }

    /// Remember the block behind `err` as invalid when the failure is permanent.
    pub fn record_rejection(&mut self, err: &ChainError) {
        let hash = match err {
            ChainError::Block { hash, .. } => *hash,
            ChainError::InvalidAncestor { block, .. } => *block,
            _ => return,
        };
        if err.marks_invalid() {
            warn!(%hash, error = %err, "block rejected");
            self.invalid.insert(hash);
        } else {
            debug!(%hash, error = %err, "block not accepted");
        }
    }

    fn switch_head(&mut self, hash: BlockHash, entry: BlockEntry) -> Result<HeadChange, ChainError> {
        let plan = self.plan_reorg(hash, &entry)?;
        let unwind = plan.unwind_plan();
        let connect = plan.connect_plan();

        if let Err(e) = self.state.apply_reorg(&unwind, &connect) {
            return Err(self.reorg_failure(e));
        }

        let persisted = self
            .head_change_batch(hash, &entry, &plan)
            .and_then(|batch| self.storage.write_batch(batch).map_err(ChainError::from));
        if let Err(err) = persisted {
            let back_unwind: Vec<PlannedBlock<'_>> = connect.iter().rev().copied().collect();
            let back_connect: Vec<PlannedBlock<'_>> = unwind.iter().rev().copied().collect();
            if let Err(e) = self.state.apply_reorg(&back_unwind, &back_connect) {
                let reason = format!("rollback after failed write: {e}");
                error!(%hash, reason = %reason, "chain halted");
                self.halted = Some(reason.clone());
                return Err(ChainError::Halted(reason));
            }
            warn!(%hash, error = %err, "write failed; head change rolled back");
            return Err(err);
        }

        let change = HeadChange {
            new_head: hash,
            new_height: entry.height,
            ancestor_height: plan.ancestor_height,
            rolled_back: plan.unwind.iter().map(|(h, _)| *h).collect(),
            applied: plan.connect.iter().map(|(h, _)| *h).collect(),
        };
        if change.is_reorg() {
            info!(
                %hash,
                height = entry.height,
                ancestor = plan.ancestor_height,
                depth = change.depth(),
                work = %entry.cumulative_work,
                "reorganized to heavier branch"
            );
        } else {
            info!(%hash, height = entry.height, txs = entry.block.txs.len(), "block connected");
        }
        self.entries.insert(hash, entry);
        Ok(change)
    }

    fn plan_reorg(&self, hash: BlockHash, entry: &BlockEntry) -> Result<ReorgPlan, ChainError> {
        let (old_height, _) = self.tip()?;
        let mut connect = vec![(hash, Arc::clone(&entry.block))];
        let mut cursor = entry.block.header.prev;
        let ancestor_height = loop {
            let e = self.entry(&cursor)?;
            if self.state.is_canonical(&cursor, e.height) {
                break e.height;
            }
            connect.push((cursor, Arc::clone(&e.block)));
            cursor = e.block.header.prev;
        };
        connect.reverse();

        let mut unwind = Vec::new();
        for height in (ancestor_height + 1..=old_height).rev() {
            let h = self
                .state
                .hash_at(height)
                .ok_or_else(|| ChainError::Corrupted(format!("no canonical block at {height}")))?;
            unwind.push((h, Arc::clone(&self.entry(&h)?.block)));
        }

        Ok(ReorgPlan {
            ancestor_height,
            old_height,
            old_size: self.state.tree().len(),
            unwind,
            connect,
        })
    }

    /// One batch moving storage from the pre-plan chain to the current state.
    fn head_change_batch(
        &self,
        hash: BlockHash,
        entry: &BlockEntry,
        plan: &ReorgPlan,
    ) -> Result<WriteBatch, ChainError> {
        let mut batch = WriteBatch::new();
        batch.put(keys::block(&hash), entry.block.as_ref())?;

        for (h, block) in &plan.unwind {
            batch.put(keys::index(h), &self.entry(h)?.record(BlockStatus::ValidOrphan))?;
            for nf in block.nullifiers() {
                batch.delete(keys::nullifier(&nf));
            }
        }
        for (h, block) in &plan.connect {
            let record = if *h == hash {
                entry.record(BlockStatus::ValidCanonical)
            } else {
                self.entry(h)?.record(BlockStatus::ValidCanonical)
            };
            batch.put(keys::index(h), &record)?;
            for nf in block.nullifiers() {
                batch.put(keys::nullifier(&nf), &block.header.height)?;
            }
        }

        let tree = self.state.tree();
        let ancestor_size = tree
            .size_at(plan.ancestor_height)
            .map_err(|e| ChainError::State(e.into()))?;
        for position in tree.len()..plan.old_size {
            batch.delete(keys::tree_leaf(position));
        }
        for (offset, cm) in tree.leaves_from(ancestor_size).iter().enumerate() {
            batch.put(keys::tree_leaf(ancestor_size + offset as u64), cm)?;
        }
        for height in entry.height + 1..=plan.old_height {
            batch.delete(keys::tree_root(height));
        }
        for height in plan.ancestor_height + 1..=entry.height {
            let cp = tree
                .checkpoint(height)
                .map_err(|e| ChainError::State(e.into()))?;
            batch.put(keys::tree_root(height), &(cp.root, cp.size))?;
        }

        batch.put(keys::CHAIN_HEAD.to_vec(), &hash)?;
        Ok(batch)
    }

    fn reorg_failure(&mut self, e: StateError) -> ChainError {
        match e {
            StateError::Corrupted(reason) => {
                error!(reason = %reason, "chain state corrupted; halting");
                self.halted = Some(reason.clone());
                ChainError::State(StateError::Corrupted(reason))
            }
            other => {
                warn!(error = %other, "reorg aborted; previous head kept");
                ChainError::ReorgAborted(other)
            }
        }
    }

    fn ensure_running(&self) -> Result<(), ChainError> {
        match &self.halted {
            Some(reason) => Err(ChainError::Halted(reason.clone())),
            None => Ok(()),
        }
    }

    fn check_admissible(&self, hash: BlockHash, block: &Block) -> Result<(), ChainError> {
        let parent = block.header.prev;
        if self.entries.contains_key(&hash) {
            return Err(ChainError::AlreadyKnown(hash));
        }
        if self.invalid.contains(&hash) {
            return Err(ChainError::KnownInvalid(hash));
        }
        if self.invalid.contains(&parent) {
            return Err(ChainError::InvalidAncestor {
                block: hash,
                ancestor: parent,
            });
        }
        if !self.entries.contains_key(&parent) {
            return Err(ChainError::UnknownParent {
                block: hash,
                parent,
            });
        }
        Ok(())
    }

    fn tip(&self) -> Result<(u64, BlockHash), ChainError> {
        self.state
            .tip()
            .ok_or_else(|| ChainError::Corrupted("canonical chain is empty".into()))
    }

    fn entry(&self, hash: &BlockHash) -> Result<&BlockEntry, ChainError> {
        self.entries
            .get(hash)
            .ok_or_else(|| ChainError::Corrupted(format!("missing index entry {hash}")))
    }

    fn branch(&self, tip: BlockHash) -> Result<Branch<'_>, ChainError> {
        let mut side = Vec::new();
        let mut cursor = tip;
        loop {
            let entry = self.entry(&cursor)?;
            if self.state.is_canonical(&cursor, entry.height) {
                side.reverse();
                return Ok(Branch {
                    fork_height: entry.height,
                    side,
                });
            }
            side.push(entry);
            cursor = entry.block.header.prev;
        }
    }

    fn branch_frontier(&self, branch: &Branch<'_>) -> Result<Frontier, ChainError> {
        let mut frontier = self
            .state
            .tree()
            .frontier_at(branch.fork_height)
            .map_err(|e| ChainError::State(e.into()))?;
        for cm in branch.side.iter().flat_map(|e| e.block.commitments()) {
            frontier
                .append(&cm)
                .map_err(|e| ChainError::State(e.into()))?;
        }
        Ok(frontier)
    }

    /// Up to `count` blocks ending at `tip`, oldest first.
    fn ancestors(&self, tip: BlockHash, count: usize) -> Result<Vec<&BlockEntry>, ChainError> {
        let mut out = Vec::with_capacity(count);
        let mut cursor = tip;
        while out.len() < count {
            let entry = self.entry(&cursor)?;
            out.push(entry);
            if entry.height == 0 {
                break;
            }
            cursor = entry.block.header.prev;
        }
        out.reverse();
        Ok(out)
    }

    fn parent_context(&self, parent: BlockHash, now: u64) -> Result<ParentContext, ChainError> {
        let params = self.rules.params();
        let anchor_depth = usize::try_from(params.anchor_window)
            .unwrap_or(usize::MAX)
            .saturating_add(1);
        let depth = params
            .difficulty_window
            .max(params.median_time_window)
            .max(anchor_depth);
        let ancestors = self.ancestors(parent, depth)?;
        let parent_entry = ancestors
            .last()
            .ok_or_else(|| ChainError::Corrupted(format!("missing index entry {parent}")))?;

        let timestamps: Vec<u64> = ancestors.iter().map(|e| e.block.header.timestamp).collect();
        let window: Vec<(u64, u32)> = ancestors
            .iter()
            .map(|e| (e.block.header.timestamp, e.block.header.bits))
            .collect();
        let parent_timestamp = parent_entry.block.header.timestamp;
        let expected_bits = self
            .rules
            .target_difficulty(&window)
            .map_err(|e| ChainError::Corrupted(format!("difficulty after {parent}: {e}")))?;

        Ok(ParentContext {
            header: HeaderContext {
                parent_height: parent_entry.height,
                parent_timestamp,
                median_time_past: median_time_past(&timestamps, params.median_time_window)
                    .unwrap_or(parent_timestamp),
                expected_bits,
                now,
            },
            anchors: ancestors
                .iter()
                .rev()
                .take(anchor_depth)
                .map(|e| e.block.header.commitment_root)
                .collect(),
        })
    }
}

fn key_suffix(key: &[u8], prefix: &[u8]) -> Result<[u8; 32], StorageError> {
    key.get(prefix.len()..)
        .and_then(|suffix| <[u8; 32]>::try_from(suffix).ok())
        .ok_or_else(|| StorageError::Codec {
            key: hex::encode(key),
            reason: "key suffix is not 32 bytes".into(),
        })
}

fn check_genesis(genesis: &Block) -> Result<(), ChainError> {
    let invalid = |reason: &str| ChainError::InvalidGenesis(reason.to_string());
    if genesis.header.height != 0 || genesis.header.prev != Hash32::zero() {
        return Err(invalid("genesis must be height 0 with a zero parent"));
    }
    genesis
        .validate_sanity()
        .map_err(|e| ChainError::InvalidGenesis(e.to_string()))?;
    let merkle = tx_merkle_root(&genesis.txs).map_err(|e| ChainError::InvalidGenesis(e.to_string()))?;
    if merkle != genesis.header.tx_merkle_root {
        return Err(invalid("tx merkle root mismatch"));
    }
    validate_pow(&genesis.header).map_err(|e| ChainError::InvalidGenesis(e.to_string()))
}
