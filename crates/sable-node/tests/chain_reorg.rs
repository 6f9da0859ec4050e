//! Fork choice and reorganization against competing branches.

use std::collections::BTreeMap;
use std::sync::Arc;

use proptest::prelude::*;
use sable_core::{Block, BlockHash, Nullifier, Root, Transaction};
use sable_node::testkit::{build_child, memory_chain, nullifier, regular_tx, NOW};
use sable_node::{BlockStatus, ChainProcessor, HeadChange};

#[derive(Debug, PartialEq, Eq)]
struct Snapshot {
    head: BlockHash,
    roots: Vec<Root>,
    leaves: u64,
    nullifiers: BTreeMap<Nullifier, u64>,
}

fn snapshot(chain: &ChainProcessor) -> Snapshot {
    let roots = (0..=chain.head_height())
        .map(|h| chain.root_at(h).expect("root"))
        .collect();
    Snapshot {
        head: chain.head(),
        roots,
        leaves: chain.state().tree().len(),
        nullifiers: chain
            .state()
            .nullifiers()
            .iter()
            .map(|(nf, h)| (*nf, *h))
            .collect(),
    }
}

/// Build and submit one block per entry of `txs` on top of `parent`.
fn grow(
    chain: &mut ChainProcessor,
    parent: BlockHash,
    txs: Vec<Vec<Transaction>>,
    tag: u64,
) -> Vec<(Block, Option<HeadChange>)> {
    let mut out = Vec::new();
    let mut tip = parent;
    for block_txs in txs {
        let block = build_child(chain, tip, block_txs, tag);
        tip = block.hash().expect("hash");
        let change = chain
            .submit(Arc::new(block.clone()), NOW)
            .expect("valid block");
        out.push((block, change));
    }
    out
}

fn hashes(blocks: &[(Block, Option<HeadChange>)]) -> Vec<BlockHash> {
    blocks.iter().map(|(b, _)| b.hash().expect("hash")).collect()
}

#[test]
fn longer_branch_from_genesis_replaces_shorter() {
    let (mut chain, _) = memory_chain();
    let genesis = chain.genesis_hash();
    let anchor = chain.root_at(0).expect("genesis root");

    let a = grow(
        &mut chain,
        genesis,
        vec![vec![], vec![regular_tx(&[nullifier(1)], anchor, 10)], vec![]],
        1,
    );
    let a_hashes = hashes(&a);
    assert_eq!(chain.head(), a_hashes[2]);
    assert_eq!(chain.head_height(), 3);
    assert!(chain.is_nullifier_spent(&nullifier(1)));

    let mut b = grow(
        &mut chain,
        genesis,
        vec![
            vec![],
            vec![],
            vec![regular_tx(&[nullifier(2)], anchor, 20)],
        ],
        2,
    );

    // Equal work keeps the branch seen first.
    for (block, change) in &b {
        assert!(change.is_none());
        assert_eq!(
            chain.status(&block.hash().expect("hash")),
            Some(BlockStatus::ValidOrphan)
        );
    }
    assert_eq!(chain.head(), a_hashes[2]);
    assert!(chain.is_nullifier_spent(&nullifier(1)));
    assert!(!chain.is_nullifier_spent(&nullifier(2)));

    let b3 = b[2].0.hash().expect("hash");
    b.extend(grow(&mut chain, b3, vec![vec![]], 2));
    let b_hashes = hashes(&b);

    let change = b[3].1.clone().expect("reorg on B4");
    assert_eq!(change.new_head, b_hashes[3]);
    assert_eq!(change.new_height, 4);
    assert_eq!(change.ancestor_height, 0);
    assert_eq!(
        change.rolled_back,
        a_hashes.iter().rev().copied().collect::<Vec<_>>()
    );
    assert_eq!(change.applied, b_hashes);
    assert_eq!(change.depth(), 3);

    assert!(!chain.is_nullifier_spent(&nullifier(1)));
    assert!(chain.is_nullifier_spent(&nullifier(2)));
    for h in &a_hashes {
        assert_eq!(chain.status(h), Some(BlockStatus::ValidOrphan));
    }
    for (height, h) in b_hashes.iter().enumerate() {
        assert_eq!(chain.status(h), Some(BlockStatus::ValidCanonical));
        assert_eq!(chain.canonical_hash(height as u64 + 1), Some(*h));
    }

    // Same state as applying B alone.
    let (mut fresh, _) = memory_chain();
    for (block, _) in &b {
        fresh.submit(Arc::new(block.clone()), NOW).expect("fresh");
    }
    assert_eq!(snapshot(&chain), snapshot(&fresh));
}

#[test]
fn heavier_branch_wins_regardless_of_arrival_order() {
    let (mut builder, _) = memory_chain();
    let genesis = builder.genesis_hash();
    let a = grow(&mut builder, genesis, vec![vec![]; 3], 1);
    let b = grow(&mut builder, genesis, vec![vec![]; 4], 2);
    let b_tip = hashes(&b)[3];
    assert_eq!(builder.head(), b_tip);

    let (mut reversed, _) = memory_chain();
    for (block, _) in b.iter().chain(a.iter()) {
        reversed
            .submit(Arc::new(block.clone()), NOW)
            .expect("submit");
    }
    assert_eq!(reversed.head(), b_tip);
    assert_eq!(snapshot(&reversed), snapshot(&builder));
}

#[test]
fn side_branch_may_spend_nullifier_spent_after_fork() {
    let (mut chain, _) = memory_chain();
    let genesis = chain.genesis_hash();
    let anchor = chain.root_at(0).expect("root");
    let spend = || vec![regular_tx(&[nullifier(5)], anchor, 1)];

    grow(&mut chain, genesis, vec![spend()], 1);
    assert!(chain.is_nullifier_spent(&nullifier(5)));

    // Same nullifier on a branch forked at genesis is not a double spend.
    let b = grow(&mut chain, genesis, vec![spend(), vec![]], 2);
    assert!(b[1].1.as_ref().is_some_and(HeadChange::is_reorg));
    assert_eq!(chain.state().nullifiers().height_of(&nullifier(5)), Some(1));
}

#[test]
fn reorg_to_deeper_fork_point_keeps_shared_prefix() {
    let (mut chain, _) = memory_chain();
    let genesis = chain.genesis_hash();
    let a = grow(&mut chain, genesis, vec![vec![]; 4], 1);
    let fork = hashes(&a)[1];
    let b = grow(&mut chain, fork, vec![vec![]; 3], 2);
    let change = b[2].1.clone().expect("reorg");
    assert_eq!(change.ancestor_height, 2);
    assert_eq!(change.rolled_back.len(), 2);
    assert_eq!(chain.canonical_hash(2), Some(fork));
    assert_eq!(chain.head_height(), 5);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    /// Reorganizing onto a heavier branch leaves the same roots and
    /// nullifiers as applying that branch to a fresh chain.
    #[test]
    fn reorg_matches_fresh_application(
        a_len in 1usize..4,
        fork_seed in 0usize..4,
        extra in 1usize..3,
        reuse in any::<bool>(),
    ) {
        let fork_height = fork_seed % a_len;
        let (mut chain, _) = memory_chain();
        let genesis = chain.genesis_hash();
        let anchor = chain.root_at(0).expect("root");

        let a_txs = (1..=a_len as u64)
            .map(|h| vec![regular_tx(&[nullifier(100 + h)], anchor, h)])
            .collect();
        let a = grow(&mut chain, genesis, a_txs, 1);
        let fork = if fork_height == 0 { genesis } else { hashes(&a)[fork_height - 1] };

        let b_len = a_len - fork_height + extra;
        let b_txs = (1..=b_len as u64)
            .map(|i| {
                let h = fork_height as u64 + i;
                let nf = if reuse { nullifier(100 + h) } else { nullifier(200 + h) };
                vec![regular_tx(&[nf], anchor, 2 * h)]
            })
            .collect();
        let b = grow(&mut chain, fork, b_txs, 2);
        prop_assert_eq!(chain.head(), *hashes(&b).last().expect("tip"));

        let (mut fresh, _) = memory_chain();
        for (block, _) in a.iter().take(fork_height).chain(b.iter()) {
            fresh.submit(Arc::new(block.clone()), NOW).expect("fresh");
        }
        prop_assert_eq!(snapshot(&chain), snapshot(&fresh));
    }
}
