//! Fee-prioritized pool of pending regular transactions.
//!
//! The pool only enforces pool policy (size budget, fee-rate ordering,
//! nullifier conflicts, expiry). Contextual validity against the chain is
//! checked by the caller before [`MemPool::add`].

use std::cmp::Reverse;
use std::collections::BTreeMap;

use hashbrown::{HashMap, HashSet};
use sable_core::{tx_size, txid, Nullifier, Transaction, TransactionKind, TxId};
use tracing::debug;

use crate::error::MempoolError;

/// Atoms per 1000 serialized bytes.
pub fn fee_rate(fee_atoms: u64, size: usize) -> u64 {
    let size = size.max(1) as u128;
    let rate = u128::from(fee_atoms) * 1000 / size;
    u64::try_from(rate).unwrap_or(u64::MAX)
}

/// A pooled transaction.
#[derive(Clone, Debug)]
pub struct MempoolEntry {
    /// The transaction.
    pub tx: Transaction,
    /// Its identifier.
    pub txid: TxId,
    /// Serialized size in bytes.
    pub size: usize,
    /// Fee rate in atoms per 1000 bytes.
    pub fee_rate: u64,
    /// Insertion order.
    pub seq: u64,
    /// Nullifiers it spends.
    pub nullifiers: Vec<Nullifier>,
}

type PriorityKey = (Reverse<u64>, u64);

impl MempoolEntry {
    fn priority(&self) -> PriorityKey {
        (Reverse(self.fee_rate), self.seq)
    }
}

/// Pending transactions, at most `max_bytes` in total, never two spending
/// the same nullifier.
pub struct MemPool {
    max_bytes: usize,
    total_bytes: usize,
    next_seq: u64,
    entries: HashMap<TxId, MempoolEntry>,
    /// Best first: highest fee rate, then earliest insertion.
    by_priority: BTreeMap<PriorityKey, TxId>,
    spent: HashMap<Nullifier, TxId>,
}

impl MemPool {
    /// Empty pool holding at most `max_bytes` of serialized transactions.
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            total_bytes: 0,
            next_seq: 0,
            entries: HashMap::new(),
            by_priority: BTreeMap::new(),
            spent: HashMap::new(),
        }
    }

    /// Admit `tx` while the canonical head is at `head_height`.
    ///
    /// A transaction sharing a nullifier with pooled entries replaces them
    /// only with a strictly higher fee rate. When the pool is full, entries
    /// with a strictly lower fee rate are evicted, cheapest first. Nothing
    /// changes on error.
    pub fn add(&mut self, tx: Transaction, head_height: u64) -> Result<TxId, MempoolError> {
        if tx.kind != TransactionKind::Regular {
            return Err(MempoolError::NotRegular);
        }
        tx.validate_sanity()?;
        let id = txid(&tx)?;
        if self.entries.contains_key(&id) {
            return Err(MempoolError::AlreadyKnown(id));
        }
        let next_height = head_height + 1;
        if tx.is_expired_at(next_height) {
            return Err(MempoolError::Expired {
                expiration: tx.expiration,
                next_height,
            });
        }
        let size = tx_size(&tx)?;
        if size > self.max_bytes {
            return Err(MempoolError::TooLarge {
                size,
                max: self.max_bytes,
            });
        }
        let rate = fee_rate(tx.fee.atoms(), size);

        let mut replaced: Vec<TxId> = Vec::new();
        for nf in tx.nullifiers() {
            let Some(existing) = self.spent.get(&nf) else {
                continue;
            };
            if replaced.contains(existing) {
                continue;
            }
            let holder = self.entries.get(existing).map_or(0, |e| e.fee_rate);
            if holder >= rate {
                return Err(MempoolError::Conflict {
                    nullifier: nf,
                    existing: *existing,
                });
            }
            replaced.push(*existing);
        }

        let freed: usize = replaced
            .iter()
            .filter_map(|id| self.entries.get(id))
            .map(|e| e.size)
            .sum();
        let mut needed = (self.total_bytes - freed + size).saturating_sub(self.max_bytes);
        let mut evicted: Vec<TxId> = Vec::new();
        for (key, victim) in self.by_priority.iter().rev() {
            if needed == 0 {
                break;
            }
            if replaced.contains(victim) {
                continue;
            }
            if key.0 .0 >= rate {
                return Err(MempoolError::FeeTooLow {
                    fee_rate: rate,
                    threshold: self.eviction_threshold().unwrap_or(0),
                });
            }
            let victim_size = self.entries.get(victim).map_or(0, |e| e.size);
            needed = needed.saturating_sub(victim_size);
            evicted.push(*victim);
        }

        for id in &replaced {
            self.remove(id);
            debug!(txid = %id, "replaced by higher fee rate");
        }
        for id in &evicted {
            self.remove(id);
            debug!(txid = %id, "evicted for space");
        }

        let entry = MempoolEntry {
            nullifiers: tx.nullifiers().collect(),
            tx,
            txid: id,
            size,
            fee_rate: rate,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        for nf in &entry.nullifiers {
            self.spent.insert(*nf, id);
        }
        self.by_priority.insert(entry.priority(), id);
        self.total_bytes += size;
        self.entries.insert(id, entry);
        debug!(txid = %id, fee_rate = rate, size, pooled = self.entries.len(), "transaction pooled");
        Ok(id)
    }

    /// Drop transactions included in a block.
    pub fn remove_mined(&mut self, txids: &[TxId]) -> usize {
        txids.iter().filter(|id| self.remove(id).is_some()).count()
    }

    /// Drop every entry spending one of `nullifiers`.
    pub fn remove_conflicting<'a>(
        &mut self,
        nullifiers: impl IntoIterator<Item = &'a Nullifier>,
    ) -> Vec<TxId> {
        let doomed: HashSet<TxId> = nullifiers
            .into_iter()
            .filter_map(|nf| self.spent.get(nf).copied())
            .collect();
        let mut removed: Vec<TxId> = doomed.into_iter().collect();
        removed.retain(|id| self.remove(id).is_some());
        removed
    }

    /// Drop entries that can no longer be mined at `height`.
    pub fn remove_expired(&mut self, height: u64) -> Vec<TxId> {
        self.remove_where(|e| e.tx.is_expired_at(height))
    }

    /// Drop entries for which `reject` returns true.
    pub fn remove_where(&mut self, mut reject: impl FnMut(&MempoolEntry) -> bool) -> Vec<TxId> {
        let doomed: Vec<TxId> = self
            .entries
            .values()
            .filter(|e| reject(e))
            .map(|e| e.txid)
            .collect();
        for id in &doomed {
            self.remove(id);
        }
        doomed
    }

    /// Entries for the next block: fee rate descending, insertion order on
    /// ties, packed greedily under `max_size` bytes without sharing a nullifier.
    pub fn candidates_for_block(&self, max_size: usize) -> Vec<&MempoolEntry> {
        let mut out = Vec::new();
        let mut used = 0usize;
        let mut claimed: HashSet<Nullifier> = HashSet::new();
        for id in self.by_priority.values() {
            let Some(entry) = self.entries.get(id) else {
                continue;
            };
            if used + entry.size > max_size {
                continue;
            }
            if entry.nullifiers.iter().any(|nf| claimed.contains(nf)) {
                continue;
            }
            claimed.extend(entry.nullifiers.iter().copied());
            used += entry.size;
            out.push(entry);
        }
        out
    }

    /// Pooled entry by id.
    pub fn get(&self, id: &TxId) -> Option<&MempoolEntry> {
        self.entries.get(id)
    }

    /// Whether `id` is pooled.
    pub fn contains(&self, id: &TxId) -> bool {
        self.entries.contains_key(id)
    }

    /// Pooled transaction spending `nf`.
    pub fn spender_of(&self, nf: &Nullifier) -> Option<TxId> {
        self.spent.get(nf).copied()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the pool is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total serialized size of pooled transactions.
    pub fn size_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Byte budget.
    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Lowest pooled fee rate; a full pool only admits strictly higher rates.
    pub fn eviction_threshold(&self) -> Option<u64> {
        self.by_priority.keys().next_back().map(|key| key.0 .0)
    }

    /// All entries, best first.
    pub fn iter(&self) -> impl Iterator<Item = &MempoolEntry> {
        self.by_priority
            .values()
            .filter_map(|id| self.entries.get(id))
    }

    fn remove(&mut self, id: &TxId) -> Option<MempoolEntry> {
        let entry = self.entries.remove(id)?;
        self.by_priority.remove(&entry.priority());
        for nf in &entry.nullifiers {
            if self.spent.get(nf) == Some(id) {
                self.spent.remove(nf);
            }
        }
        self.total_bytes -= entry.size;
        Some(entry)
    }
}
