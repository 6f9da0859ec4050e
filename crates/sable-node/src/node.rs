//! Node coordinator: serializes head changes, keeps the mempool in step
//! with the canonical chain and fans head changes out to subscribers.
//!
//! Lock order is chain, then mempool. The in-flight registry and the
//! subscriber list are leaf locks held only briefly.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use hashbrown::{HashMap, HashSet};
use num_bigint::BigUint;
use sable_core::{
    txid, Amount, Block, BlockHash, Nullifier, Output, Transaction, TransactionKind, TxId,
    PROTOCOL_VERSION,
};
use sable_state::{MerkleWitness, TxError};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::chain::ChainProcessor;
use crate::config::{NodeConfig, StorageKind};
use crate::error::{ChainError, MempoolError, NodeError};
use crate::events::HeadChange;
use crate::genesis::build_genesis;
use crate::mempool::MemPool;
use crate::storage::{ChainStorage, MemoryStorage, SledStorage};

/// Current Unix time in seconds.
pub fn unix_now() -> u64 {
    u64::try_from(OffsetDateTime::now_utc().unix_timestamp()).unwrap_or(0)
}

struct InFlight {
    ticket: u64,
    work: BigUint,
    cancel: Arc<AtomicBool>,
}

/// Chain processor and mempool behind the locks that order their updates.
pub struct Node {
    chain: RwLock<ChainProcessor>,
    mempool: Mutex<MemPool>,
    subscribers: Mutex<Vec<Sender<HeadChange>>>,
    in_flight: Mutex<HashMap<u64, Vec<InFlight>>>,
    next_ticket: AtomicU64,
}

impl Node {
    /// Wrap an opened chain with an empty mempool of `mempool_max_bytes`.
    pub fn new(chain: ChainProcessor, mempool_max_bytes: usize) -> Self {
        Self {
            chain: RwLock::new(chain),
            mempool: Mutex::new(MemPool::new(mempool_max_bytes)),
            subscribers: Mutex::new(Vec::new()),
            in_flight: Mutex::new(HashMap::new()),
            next_ticket: AtomicU64::new(0),
        }
    }

    /// Open the configured storage and chain.
    pub fn open(config: &NodeConfig) -> Result<Self, NodeError> {
        let params = config.consensus_params()?;
        let genesis =
            build_genesis(&params).map_err(|e| ChainError::InvalidGenesis(e.to_string()))?;
        let storage: Arc<dyn ChainStorage> = match config.storage {
            StorageKind::Sled => {
                Arc::new(SledStorage::open(&config.chain_db_path()).map_err(ChainError::from)?)
            }
            StorageKind::Memory => Arc::new(MemoryStorage::new()),
        };
        let chain = ChainProcessor::open(storage, params, genesis)?;
        info!(
            network = %config.network,
            head = %chain.head(),
            height = chain.head_height(),
            "node opened"
        );
        Ok(Self::new(chain, config.mempool_max_bytes))
    }

    /// Shared view of the chain.
    pub fn chain(&self) -> RwLockReadGuard<'_, ChainProcessor> {
        self.chain.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// The mempool. Do not hold this while calling back into the node.
    pub fn mempool(&self) -> MutexGuard<'_, MemPool> {
        self.mempool.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn chain_mut(&self) -> RwLockWriteGuard<'_, ChainProcessor> {
        self.chain.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Canonical tip.
    pub fn head(&self) -> BlockHash {
        self.chain().head()
    }

    /// Height of the canonical tip.
    pub fn head_height(&self) -> u64 {
        self.chain().head_height()
    }

    /// Receive every future head change.
    pub fn subscribe(&self) -> Receiver<HeadChange> {
        let (tx, rx) = mpsc::channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Validate `block` concurrently with other submissions, then apply it.
    ///
    /// Returns the head change if the block moved the head. Mempool
    /// maintenance for that change completes before the chain lock is
    /// released; subscribers are notified afterwards.
    pub fn submit_block(&self, block: Block, now: u64) -> Result<Option<HeadChange>, ChainError> {
        let block = Arc::new(block);
        let cancel = Arc::new(AtomicBool::new(false));
        let height = block.header.height;

        let (validated, work) = {
            let chain = self.chain();
            let work = chain.candidate_work(&block);
            let ticket = work
                .as_ref()
                .map(|w| self.register(height, w.clone(), Arc::clone(&cancel)));
            let result = chain.validate(Arc::clone(&block), now, Some(cancel));
            if let Some(ticket) = ticket {
                self.unregister(height, ticket);
            }
            (result, work)
        };

        let validated = match validated {
            Ok(v) => v,
            Err(err) => {
                if err.marks_invalid() {
                    self.chain_mut().record_rejection(&err);
                }
                return Err(err);
            }
        };
        if let Some(work) = &work {
            self.abandon_weaker(height, work);
        }

        let change = {
            let mut chain = self.chain_mut();
            let change = chain.commit(validated)?;
            if let Some(change) = &change {
                let mut pool = self.mempool();
                on_head_change(&chain, &mut pool, change);
            }
            change
        };
        if let Some(change) = &change {
            self.broadcast(change);
        }
        Ok(change)
    }

    /// Check `tx` against the canonical head and pool it.
    pub fn submit_transaction(&self, tx: Transaction) -> Result<TxId, MempoolError> {
        if tx.kind != TransactionKind::Regular {
            return Err(MempoolError::NotRegular);
        }
        let chain = self.chain();
        let head_height = chain.head_height();
        chain
            .check_transaction(&tx, &mut HashSet::new())
            .map_err(|e| match e {
                TxError::Expired { expiration, height } => MempoolError::Expired {
                    expiration,
                    next_height: height,
                },
                other => MempoolError::Invalid(other),
            })?;
        let mut pool = self.mempool();
        let id = pool.add(tx, head_height)?;
        info!(txid = %id, pooled = pool.len(), "transaction accepted");
        Ok(id)
    }

    /// Unmined block extending the head: a coinbase paying reward plus
    /// fees to `coinbase_outputs`, then the best mempool transactions that
    /// are still valid at the head.
    pub fn block_template(
        &self,
        coinbase_outputs: Vec<Output>,
        now: u64,
    ) -> Result<Block, ChainError> {
        let chain = self.chain();
        let template = chain.block_template(now)?;
        let pool = self.mempool();

        let coinbase_shell = coinbase(coinbase_outputs, template.reward, template.reward);
        let mut budget = template
            .max_block_bytes
            .saturating_sub(sable_core::tx_size(&coinbase_shell).unwrap_or(0))
            .saturating_sub(HEADER_RESERVE);

        let mut staged: HashSet<Nullifier> = HashSet::new();
        let mut minted = template.reward;
        let mut txs = Vec::new();
        for entry in pool.candidates_for_block(budget) {
            if entry.size > budget {
                continue;
            }
            let mut attempt = staged.clone();
            if let Err(e) = chain.check_transaction(&entry.tx, &mut attempt) {
                debug!(txid = %entry.txid, error = %e, "skipping stale mempool entry");
                continue;
            }
            let Ok(next) = minted.checked_add(entry.tx.fee) else {
                continue;
            };
            minted = next;
            staged = attempt;
            budget -= entry.size;
            txs.push(entry.tx.clone());
        }

        let mut all = Vec::with_capacity(txs.len() + 1);
        all.push(coinbase(coinbase_shell.outputs, template.reward, minted));
        all.extend(txs);
        template.assemble(all).map_err(ChainError::Template)
    }

    /// Authentication path for `position` against the root at `height`.
    pub fn witness(&self, position: u64, height: u64) -> Result<MerkleWitness, ChainError> {
        self.chain().witness(position, height)
    }

    /// Whether the note at `position` may be spent at the current head.
    pub fn is_output_spendable(&self, position: u64) -> Result<bool, ChainError> {
        self.chain().is_output_spendable(position)
    }

    fn register(&self, height: u64, work: BigUint, cancel: Arc<AtomicBool>) -> u64 {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(height)
            .or_default()
            .push(InFlight {
                ticket,
                work,
                cancel,
            });
        ticket
    }

    fn unregister(&self, height: u64, ticket: u64) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(list) = in_flight.get_mut(&height) {
            list.retain(|f| f.ticket != ticket);
            if list.is_empty() {
                in_flight.remove(&height);
            }
        }
    }

    /// Cancel validations at `height` of blocks carrying less work than `work`.
    fn abandon_weaker(&self, height: u64, work: &BigUint) {
        let in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        for flight in in_flight.get(&height).into_iter().flatten() {
            if &flight.work < work {
                flight.cancel.store(true, Ordering::Relaxed);
                debug!(height, ticket = flight.ticket, "abandoning weaker validation");
            }
        }
    }

    fn broadcast(&self, change: &HeadChange) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| tx.send(change.clone()).is_ok());
    }
}

/// Space kept free for the header and length prefixes.
const HEADER_RESERVE: usize = 256;

fn coinbase(outputs: Vec<Output>, reward: Amount, minted: Amount) -> Transaction {
    Transaction {
        version: PROTOCOL_VERSION,
        kind: TransactionKind::Coinbase,
        spends: vec![],
        outputs,
        fee: Amount::zero(),
        expiration: 0,
        claimed_reward: reward,
        minted,
        memo: vec![],
    }
}

/// Bring the pool in line with a new head.
fn on_head_change(chain: &ChainProcessor, pool: &mut MemPool, change: &HeadChange) {
    let applied: Vec<Arc<Block>> = change.applied.iter().filter_map(|h| chain.block(h)).collect();
    let mined: Vec<TxId> = applied
        .iter()
        .flat_map(|b| b.txs.iter())
        .filter_map(|tx| txid(tx).ok())
        .collect();
    let spent: Vec<Nullifier> = applied.iter().flat_map(|b| b.nullifiers()).collect();

    let removed = pool.remove_mined(&mined);
    let conflicted = pool.remove_conflicting(&spent).len();
    let expired = pool.remove_expired(change.new_height + 1).len();

    // Anchors age out of the window on every advance, not only on reorgs.
    let stale = pool
        .remove_where(|e| chain.check_transaction(&e.tx, &mut HashSet::new()).is_err())
        .len();

    let mut readmitted = 0usize;
    if change.is_reorg() {
        let mined: HashSet<TxId> = mined.into_iter().collect();
        for hash in change.rolled_back.iter().rev() {
            let Some(block) = chain.block(hash) else {
                warn!(%hash, "rolled-back block missing from index");
                continue;
            };
            for tx in block.txs.iter().filter(|tx| tx.kind == TransactionKind::Regular) {
                let Ok(id) = txid(tx) else { continue };
                if mined.contains(&id) || pool.contains(&id) {
                    continue;
                }
                if let Err(e) = chain.check_transaction(tx, &mut HashSet::new()) {
                    debug!(txid = %id, error = %e, "rolled-back transaction not re-admitted");
                    continue;
                }
                match pool.add(tx.clone(), change.new_height) {
                    Ok(_) => readmitted += 1,
                    Err(e) => debug!(txid = %id, error = %e, "rolled-back transaction not re-admitted"),
                }
            }
        }
    }

    info!(
        head = %change.new_head,
        height = change.new_height,
        depth = change.depth(),
        removed,
        conflicted,
        expired,
        stale,
        readmitted,
        pooled = pool.len(),
        "mempool updated for new head"
    );
}
