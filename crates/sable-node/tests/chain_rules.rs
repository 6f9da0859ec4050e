//! Block acceptance rules enforced by the chain processor.

use std::sync::Arc;

use sable_consensus::{validate_pow, ConsensusError};
use sable_core::{tx_merkle_root, Amount, Block, GENESIS_BITS};
use sable_node::testkit::{build_child, extend_head, memory_chain, mine, nullifier, regular_tx, NOW};
use sable_node::{BlockStatus, ChainError, ErrorKind};
use sable_state::{BlockError, TxError};

fn submit(chain: &mut sable_node::ChainProcessor, block: &Block) -> Result<(), ChainError> {
    chain.submit(Arc::new(block.clone()), NOW).map(|_| ())
}

#[test]
fn double_spend_against_chain_is_memoized_and_poisons_descendants() {
    let (mut chain, _) = memory_chain();
    let anchor = chain.root_at(0).expect("root");
    let first = build_child(&chain, chain.head(), vec![regular_tx(&[nullifier(1)], anchor, 1)], 1);
    submit(&mut chain, &first).expect("first spend");

    let again = build_child(&chain, chain.head(), vec![regular_tx(&[nullifier(1)], anchor, 2)], 1);
    let bad_hash = again.hash().expect("hash");
    let err = submit(&mut chain, &again).expect_err("double spend");
    assert!(matches!(
        err,
        ChainError::Block {
            source: BlockError::InvalidTransaction {
                index: 1,
                source: TxError::DoubleSpend { .. }
            },
            ..
        }
    ));
    assert!(!err.is_retryable());
    assert_eq!(chain.status(&bad_hash), Some(BlockStatus::Invalid));
    assert!(matches!(
        submit(&mut chain, &again),
        Err(ChainError::KnownInvalid(h)) if h == bad_hash
    ));

    let mut child = again.clone();
    child.header.prev = bad_hash;
    child.header.height += 1;
    mine(&mut child);
    assert!(matches!(
        submit(&mut chain, &child),
        Err(ChainError::InvalidAncestor { ancestor, .. }) if ancestor == bad_hash
    ));
    assert!(matches!(
        submit(&mut chain, &child),
        Err(ChainError::KnownInvalid(_))
    ));
    assert_eq!(chain.head_height(), 1);
}

#[test]
fn nullifier_repeated_within_block_is_rejected() {
    let (mut chain, _) = memory_chain();
    let anchor = chain.root_at(0).expect("root");
    let block = build_child(
        &chain,
        chain.head(),
        vec![
            regular_tx(&[nullifier(9)], anchor, 1),
            regular_tx(&[nullifier(9)], anchor, 2),
        ],
        1,
    );
    let err = submit(&mut chain, &block).expect_err("duplicate nullifier");
    assert!(matches!(
        err,
        ChainError::Block {
            source: BlockError::InvalidTransaction {
                index: 2,
                source: TxError::DoubleSpend { .. }
            },
            ..
        }
    ));
    assert_eq!(err.kind(), ErrorKind::DoubleSpend);
    assert!(!chain.is_nullifier_spent(&nullifier(9)));
}

#[test]
fn expired_transaction_cannot_be_mined() {
    let (mut chain, _) = memory_chain();
    let anchor = chain.root_at(0).expect("root");
    extend_head(&mut chain, 1, 1);

    let mut tx = regular_tx(&[nullifier(3)], anchor, 1);
    tx.expiration = 2;
    let block = build_child(&chain, chain.head(), vec![tx.clone()], 1);
    assert!(matches!(
        submit(&mut chain, &block),
        Err(ChainError::Block {
            source: BlockError::InvalidTransaction {
                source: TxError::Expired {
                    expiration: 2,
                    height: 2
                },
                ..
            },
            ..
        })
    ));

    tx.expiration = 3;
    let block = build_child(&chain, chain.head(), vec![tx], 1);
    submit(&mut chain, &block).expect("not yet expired");
}

#[test]
fn anchors_outside_the_window_are_stale() {
    let (mut chain, _) = memory_chain();
    let stale = chain.root_at(0).expect("root");
    extend_head(&mut chain, 7, 1);
    let window = chain.rules().params().anchor_window;
    let recent = chain.root_at(7 - window).expect("root");

    let block = build_child(&chain, chain.head(), vec![regular_tx(&[nullifier(1)], stale, 1)], 1);
    assert!(matches!(
        submit(&mut chain, &block),
        Err(ChainError::Block {
            source: BlockError::InvalidTransaction {
                source: TxError::UnknownAnchor { spend: 0, .. },
                ..
            },
            ..
        })
    ));

    let block = build_child(&chain, chain.head(), vec![regular_tx(&[nullifier(1)], recent, 1)], 1);
    submit(&mut chain, &block).expect("oldest root in window");
}

#[test]
fn coinbase_value_must_balance() {
    let (mut chain, _) = memory_chain();
    let mut block = build_child(&chain, chain.head(), vec![], 1);
    block.txs[0].minted = block.txs[0]
        .minted
        .checked_add(Amount::from_atoms(1))
        .expect("add");
    block.header.tx_merkle_root = tx_merkle_root(&block.txs).expect("merkle");
    mine(&mut block);
    assert!(matches!(
        submit(&mut chain, &block),
        Err(ChainError::Block {
            source: BlockError::ValueBalance { .. },
            ..
        })
    ));
}

#[test]
fn header_rules_reject_bad_pow_and_time() {
    let (mut chain, _) = memory_chain();
    let mut block = build_child(&chain, chain.head(), vec![], 1);
    while validate_pow(&block.header).is_ok() {
        block.header.nonce += 1;
    }
    assert!(matches!(
        submit(&mut chain, &block),
        Err(ChainError::Block {
            source: BlockError::InvalidHeader(_),
            ..
        })
    ));

    let genesis_ts = chain
        .block(&chain.genesis_hash())
        .expect("genesis")
        .header
        .timestamp;
    let mut early = build_child(&chain, chain.head(), vec![], 2);
    early.header.timestamp = genesis_ts;
    mine(&mut early);
    assert!(matches!(
        submit(&mut chain, &early),
        Err(ChainError::Block {
            source: BlockError::InvalidHeader(_),
            ..
        })
    ));
    assert_eq!(chain.head_height(), 0);
}

#[test]
fn early_block_is_retried_once_the_clock_catches_up() {
    let (mut chain, _) = memory_chain();
    let skew = chain.rules().params().max_future_skew_secs;
    let mut block = build_child(&chain, chain.head(), vec![], 1);
    block.header.timestamp = NOW + skew + 30;
    mine(&mut block);
    let hash = block.hash().expect("hash");

    let err = chain
        .submit(Arc::new(block.clone()), NOW)
        .expect_err("ahead of clock");
    assert!(matches!(
        err,
        ChainError::Block {
            source: BlockError::InvalidHeader(ConsensusError::TimestampTooNew { .. }),
            ..
        }
    ));
    assert_eq!(err.kind(), ErrorKind::Transient);
    assert!(err.is_retryable());
    assert_eq!(chain.status(&hash), None);

    let later = NOW + 3_600;
    let change = chain
        .submit(Arc::new(block), later)
        .expect("accepted later")
        .expect("head moved");
    assert_eq!(change.new_head, hash);
    assert_eq!(chain.status(&hash), Some(BlockStatus::ValidCanonical));
}

#[test]
fn unknown_parent_and_duplicates_are_not_memoized() {
    let (mut builder, _) = memory_chain();
    let hashes = extend_head(&mut builder, 2, 1);
    let b1 = builder.block(&hashes[0]).expect("b1");
    let b2 = builder.block(&hashes[1]).expect("b2");

    let (mut chain, _) = memory_chain();
    let err = chain.submit(Arc::clone(&b2), NOW).expect_err("orphan");
    assert_eq!(err.kind(), ErrorKind::Orphan);
    assert!(err.is_retryable());
    assert_eq!(chain.status(&hashes[1]), None);

    chain.submit(b1, NOW).expect("parent");
    chain.submit(Arc::clone(&b2), NOW).expect("child after parent");
    assert!(matches!(
        chain.submit(b2, NOW),
        Err(ChainError::AlreadyKnown(_))
    ));
}

#[test]
fn coinbase_outputs_mature_after_window() {
    let (mut chain, _) = memory_chain();
    let maturity = chain.rules().params().maturity_window;
    extend_head(&mut chain, 1, 1);
    // Genesis holds position 0; block 1's coinbase output is position 1.
    assert!(!chain.is_output_spendable(1).expect("known"));

    extend_head(&mut chain, (maturity - 1) as usize, 1);
    assert!(!chain.is_output_spendable(1).expect("known"));
    extend_head(&mut chain, 1, 1);
    assert!(chain.is_output_spendable(1).expect("known"));

    let anchor = chain.root_at(chain.head_height()).expect("root");
    let block = build_child(&chain, chain.head(), vec![regular_tx(&[nullifier(1)], anchor, 1)], 1);
    submit(&mut chain, &block).expect("spend");
    let coinbase_pos = chain.state().tree().len() - 2;
    assert!(!chain.is_output_spendable(coinbase_pos).expect("coinbase"));
    assert!(chain.is_output_spendable(coinbase_pos + 1).expect("regular"));
    assert!(matches!(
        chain.is_output_spendable(1_000),
        Err(ChainError::UnknownPosition(1_000))
    ));
}

#[test]
fn witnesses_verify_against_historical_roots() {
    let (mut chain, _) = memory_chain();
    extend_head(&mut chain, 4, 1);
    let tree = chain.state().tree();
    for height in 0..=chain.head_height() {
        let root = chain.root_at(height).expect("root");
        let size = tree.size_at(height).expect("size");
        for position in 0..size {
            let leaf = tree.leaf(position).expect("leaf");
            let witness = chain.witness(position, height).expect("witness");
            assert!(witness.verify(&leaf, &root));
        }
    }
}

#[test]
fn template_extends_head_at_regtest_limit() {
    let (mut chain, _) = memory_chain();
    extend_head(&mut chain, 3, 1);
    let template = chain.block_template(NOW).expect("template");
    assert_eq!(template.prev, chain.head());
    assert_eq!(template.height, 4);
    assert_eq!(template.bits, GENESIS_BITS);
    assert!(template.timestamp > template.median_time_past);
    assert_eq!(template.frontier.size(), chain.state().tree().len());
    assert_eq!(chain.next_bits(&chain.head()).expect("bits"), GENESIS_BITS);
}
