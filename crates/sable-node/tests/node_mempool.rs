//! Node coordinator: mempool admission, head-change maintenance, templates
//! and concurrent submission.

use std::sync::Arc;
use std::thread;

use proptest::prelude::*;
use sable_core::{txid, Amount, TxId};
use sable_node::testkit::{build_child, memory_node, mine, nullifier, output, regular_tx, NOW};
use sable_node::{BlockStatus, MemPool, MempoolError, Node};
use sable_state::TxError;

fn genesis_root(node: &Node) -> sable_core::Root {
    node.chain().root_at(0).expect("root")
}

#[test]
fn higher_fee_rate_replaces_conflict_and_is_mined_from_template() {
    let node = memory_node();
    let anchor = genesis_root(&node);
    let t1 = regular_tx(&[nullifier(1), nullifier(2)], anchor, 500);
    let t2 = regular_tx(&[nullifier(1)], anchor, 1_000);
    let id1 = node.submit_transaction(t1).expect("t1");
    let id2 = node.submit_transaction(t2.clone()).expect("t2");
    {
        let pool = node.mempool();
        assert!(!pool.contains(&id1));
        assert!(pool.contains(&id2));
    }

    let mut block = node.block_template(vec![output(77)], NOW).expect("template");
    assert_eq!(block.txs.len(), 2);
    assert_eq!(block.txs[1], t2);
    let reward = node.chain().rules().reward_at(1);
    assert_eq!(
        block.txs[0].minted,
        reward.checked_add(Amount::from_atoms(1_000)).expect("sum")
    );
    mine(&mut block);

    let change = node.submit_block(block, NOW).expect("valid").expect("head moved");
    assert_eq!(change.new_height, 1);
    assert!(node.mempool().is_empty());
    assert!(node.chain().is_nullifier_spent(&nullifier(1)));
    assert!(!node.chain().is_nullifier_spent(&nullifier(2)));
}

#[test]
fn admission_checks_run_against_the_head() {
    let node = memory_node();
    let anchor = genesis_root(&node);

    let mut coinbase = regular_tx(&[nullifier(1)], anchor, 1);
    coinbase.kind = sable_core::TransactionKind::Coinbase;
    assert_eq!(node.submit_transaction(coinbase), Err(MempoolError::NotRegular));

    let unknown = regular_tx(&[nullifier(1)], sable_core::Hash32([3; 32]), 1);
    assert!(matches!(
        node.submit_transaction(unknown),
        Err(MempoolError::Invalid(TxError::UnknownAnchor { .. }))
    ));

    let mut expiring = regular_tx(&[nullifier(2)], anchor, 1);
    expiring.expiration = 1;
    assert_eq!(
        node.submit_transaction(expiring),
        Err(MempoolError::Expired {
            expiration: 1,
            next_height: 1
        })
    );

    let spent = regular_tx(&[nullifier(4)], anchor, 1);
    let head = node.head();
    let block = build_child(&node.chain(), head, vec![spent], 1);
    node.submit_block(block, NOW).expect("block");
    let again = regular_tx(&[nullifier(4)], anchor, 2);
    let err = node.submit_transaction(again).expect_err("spent");
    assert!(matches!(
        err,
        MempoolError::Invalid(TxError::DoubleSpend { .. })
    ));
    assert!(node.mempool().is_empty());
}

#[test]
fn head_change_removes_mined_conflicting_and_expired_entries() {
    let node = memory_node();
    let anchor = genesis_root(&node);
    let mined = regular_tx(&[nullifier(1)], anchor, 10);
    let conflicting = regular_tx(&[nullifier(2)], anchor, 10);
    let mut expiring = regular_tx(&[nullifier(3)], anchor, 10);
    expiring.expiration = 2;
    let survivor = regular_tx(&[nullifier(4)], anchor, 10);
    for tx in [&mined, &conflicting, &expiring, &survivor] {
        node.submit_transaction(tx.clone()).expect("pooled");
    }

    let rival = regular_tx(&[nullifier(2)], anchor, 99);
    let head = node.head();
    let block = build_child(&node.chain(), head, vec![mined, rival], 1);
    node.submit_block(block, NOW).expect("block");

    let pool = node.mempool();
    assert_eq!(pool.len(), 1);
    assert!(pool.contains(&txid(&survivor).expect("txid")));
}

#[test]
fn entries_with_anchors_outside_the_window_leave_on_head_advance() {
    let node = memory_node();
    let anchor = genesis_root(&node);
    let tx = regular_tx(&[nullifier(1)], anchor, 10);
    assert_eq!(tx.expiration, 0);
    let id = node.submit_transaction(tx).expect("pooled");
    let window = node.chain().rules().params().anchor_window;

    for _ in 0..2 {
        let head = node.head();
        let block = build_child(&node.chain(), head, vec![], 1);
        node.submit_block(block, NOW).expect("block");
    }
    assert!(node.mempool().contains(&id));

    for _ in 2..window + 3 {
        let head = node.head();
        let block = build_child(&node.chain(), head, vec![], 1);
        node.submit_block(block, NOW).expect("block");
    }
    assert_eq!(node.head_height(), window + 3);
    assert!(!node.mempool().contains(&id));
    assert_eq!(node.mempool().size_bytes(), 0);
}

#[test]
fn reorg_readmits_rolled_back_transactions_still_valid() {
    let node = memory_node();
    let events = node.subscribe();
    let genesis = node.head();
    let anchor = genesis_root(&node);

    let kept = regular_tx(&[nullifier(1)], anchor, 10);
    let replaced = regular_tx(&[nullifier(2)], anchor, 10);
    let kept_id = txid(&kept).expect("txid");
    let replaced_id = txid(&replaced).expect("txid");

    let a1 = build_child(&node.chain(), genesis, vec![kept, replaced], 1);
    let a1_hash = a1.hash().expect("hash");
    node.submit_block(a1, NOW).expect("a1");
    assert!(node.mempool().is_empty());

    let b1 = build_child(
        &node.chain(),
        genesis,
        vec![regular_tx(&[nullifier(2)], anchor, 50)],
        2,
    );
    let b1_hash = b1.hash().expect("hash");
    assert_eq!(node.submit_block(b1, NOW).expect("b1"), None);
    let b2 = build_child(&node.chain(), b1_hash, vec![], 2);
    let change = node.submit_block(b2, NOW).expect("b2").expect("reorg");
    assert_eq!(change.rolled_back, vec![a1_hash]);

    {
        let pool = node.mempool();
        assert!(pool.contains(&kept_id));
        assert!(!pool.contains(&replaced_id));
        assert_eq!(pool.len(), 1);
    }
    assert_eq!(node.chain().status(&a1_hash), Some(BlockStatus::ValidOrphan));

    let received: Vec<_> = events.try_iter().collect();
    assert_eq!(received.len(), 2);
    assert!(!received[0].is_reorg());
    assert_eq!(received[1], change);
}

#[test]
fn concurrent_competing_blocks_settle_on_first_committed() {
    let node = Arc::new(memory_node());
    let genesis = node.head();
    let blocks: Vec<_> = (0..8)
        .map(|tag| build_child(&node.chain(), genesis, vec![], tag))
        .collect();
    let hashes: Vec<_> = blocks.iter().map(|b| b.hash().expect("hash")).collect();

    let results: Vec<_> = thread::scope(|scope| {
        let handles: Vec<_> = blocks
            .into_iter()
            .map(|block| {
                let node = Arc::clone(&node);
                scope.spawn(move || node.submit_block(block, NOW))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("thread"))
            .collect()
    });

    let moved = results
        .iter()
        .filter(|r| matches!(r, Ok(Some(_))))
        .count();
    assert_eq!(moved, 1);
    assert!(results.iter().all(Result::is_ok));

    let chain = node.chain();
    assert_eq!(chain.head_height(), 1);
    let canonical = hashes
        .iter()
        .filter(|h| chain.status(h) == Some(BlockStatus::ValidCanonical))
        .count();
    assert_eq!(canonical, 1);
    assert!(hashes.contains(&chain.head()));
}

#[test]
fn concurrent_transaction_submission_never_pools_conflicts() {
    let node = Arc::new(memory_node());
    let anchor = genesis_root(&node);
    thread::scope(|scope| {
        for worker in 0..4u64 {
            let node = Arc::clone(&node);
            scope.spawn(move || {
                for i in 0..10u64 {
                    let tx = regular_tx(&[nullifier(i % 5)], anchor, 10 + worker * 10 + i);
                    let _ = node.submit_transaction(tx);
                }
            });
        }
    });
    assert_pool_invariants(&node.mempool());
    assert!(node.mempool().len() <= 5);
}

fn assert_pool_invariants(pool: &MemPool) {
    let mut seen = std::collections::HashSet::new();
    let mut bytes = 0usize;
    for entry in pool.iter() {
        bytes += entry.size;
        for nf in &entry.nullifiers {
            assert!(seen.insert(*nf), "nullifier {nf} pooled twice");
            assert_eq!(pool.spender_of(nf), Some(entry.txid));
        }
    }
    assert_eq!(bytes, pool.size_bytes());
    assert!(pool.size_bytes() <= pool.max_bytes());
}

proptest! {
    /// Whatever arrives, the pool stays within budget and conflict-free, and
    /// block candidates come out by fee rate without conflicts.
    #[test]
    fn pool_invariants_hold_under_random_arrivals(
        arrivals in prop::collection::vec((0u64..6, 0u64..6, 1u64..50_000), 1..40),
        capacity in 2usize..6,
    ) {
        let anchor = sable_core::Hash32([1; 32]);
        let unit = sable_core::tx_size(&regular_tx(&[nullifier(0), nullifier(1)], anchor, 1))
            .expect("size");
        let mut pool = MemPool::new(unit * capacity);
        for (a, b, fee) in arrivals {
            let nfs = if a == b { vec![nullifier(a)] } else { vec![nullifier(a), nullifier(b)] };
            let _ = pool.add(regular_tx(&nfs, anchor, fee), 0);
            assert_pool_invariants(&pool);
        }

        let budget = unit * 2;
        let picked = pool.candidates_for_block(budget);
        let mut claimed = std::collections::HashSet::new();
        let mut used = 0usize;
        let mut last_rate = u64::MAX;
        let mut ids: Vec<TxId> = Vec::new();
        for entry in picked {
            prop_assert!(entry.fee_rate <= last_rate);
            last_rate = entry.fee_rate;
            for nf in &entry.nullifiers {
                prop_assert!(claimed.insert(*nf));
            }
            used += entry.size;
            ids.push(entry.txid);
        }
        prop_assert!(used <= budget);
        let best = pool.iter().next().map(|e| e.txid);
        prop_assert_eq!(ids.first().copied(), best);
    }
}
