//! Block and transaction builders for tests, on regtest parameters.
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;

use sable_consensus::{validate_pow, ConsensusParams};
use sable_core::{
    commit_bytes, derive_nullifier, output_binding, spend_binding, Amount, Block, BlockHash,
    Nullifier, Output, Root, Spend, Transaction, TransactionKind, GENESIS_TIMESTAMP,
    PROTOCOL_VERSION,
};

use crate::chain::ChainProcessor;
use crate::genesis::build_genesis;
use crate::node::Node;
use crate::storage::MemoryStorage;

/// Wall clock used by tests: a year after genesis.
pub const NOW: u64 = GENESIS_TIMESTAMP + 365 * 24 * 60 * 60;

/// Spacing that keeps regtest difficulty at the pow limit.
pub const SPACING: u64 = 60;

/// Regtest consensus parameters.
pub fn params() -> ConsensusParams {
    ConsensusParams::regtest()
}

/// Regtest genesis block.
pub fn genesis() -> Block {
    build_genesis(&params()).expect("genesis")
}

/// Deterministic nullifier.
pub fn nullifier(tag: u64) -> Nullifier {
    derive_nullifier(b"testkit", &tag.to_le_bytes())
}

/// Output with a valid binding proof.
pub fn output(tag: u64) -> Output {
    let commitment = commit_bytes(&tag.to_le_bytes());
    Output {
        commitment,
        proof: output_binding(&commitment),
    }
}

/// Spend of `nf` anchored at `anchor` with a valid binding proof.
pub fn spend(nf: Nullifier, anchor: Root) -> Spend {
    Spend {
        nullifier: nf,
        anchor,
        proof: spend_binding(&nf, &anchor),
    }
}

/// Regular transaction spending `nullifiers` under `anchor`, one output.
///
/// The output is derived from the inputs, so equal arguments give equal txids.
pub fn regular_tx(nullifiers: &[Nullifier], anchor: Root, fee: u64) -> Transaction {
    let mut seed = Vec::new();
    for nf in nullifiers {
        seed.extend_from_slice(nf.as_bytes());
    }
    seed.extend_from_slice(anchor.as_bytes());
    seed.extend_from_slice(&fee.to_le_bytes());
    let commitment = commit_bytes(&seed);
    Transaction {
        version: PROTOCOL_VERSION,
        kind: TransactionKind::Regular,
        spends: nullifiers.iter().map(|nf| spend(*nf, anchor)).collect(),
        outputs: vec![Output {
            commitment,
            proof: output_binding(&commitment),
        }],
        fee: Amount::from_atoms(fee),
        expiration: 0,
        claimed_reward: Amount::zero(),
        minted: Amount::zero(),
        memo: vec![],
    }
}

/// Coinbase claiming `reward` and declaring `minted`.
pub fn coinbase(outputs: Vec<Output>, reward: Amount, minted: Amount) -> Transaction {
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

/// Grind the nonce until the header meets its target.
pub fn mine(block: &mut Block) {
    while validate_pow(&block.header).is_err() {
        block.header.nonce += 1;
    }
}

/// Mined child of `parent` carrying `txs` after a coinbase tagged `tag`.
///
/// Blocks built from the same parent with different tags differ.
pub fn build_child(
    chain: &ChainProcessor,
    parent: BlockHash,
    txs: Vec<Transaction>,
    tag: u64,
) -> Block {
    let parent_ts = chain.block(&parent).expect("parent").header.timestamp;
    let mut template = chain.block_template_on(parent, NOW).expect("template");
    template.timestamp = parent_ts + SPACING;

    let fees = txs
        .iter()
        .fold(Amount::zero(), |acc, tx| acc.checked_add(tx.fee).expect("fees"));
    let minted = template.reward.checked_add(fees).expect("minted");
    let cb = coinbase(
        vec![output(tag << 32 | template.height)],
        template.reward,
        minted,
    );
    let mut all = vec![cb];
    all.extend(txs);
    let mut block = template.assemble(all).expect("assemble");
    mine(&mut block);
    block
}

/// Submit `n` empty children on top of `parent`; returns their hashes.
pub fn extend(chain: &mut ChainProcessor, parent: BlockHash, n: usize, tag: u64) -> Vec<BlockHash> {
    let mut hashes = Vec::with_capacity(n);
    let mut tip = parent;
    for _ in 0..n {
        let block = build_child(chain, tip, vec![], tag);
        tip = block.hash().expect("hash");
        chain.submit(Arc::new(block), NOW).expect("submit");
        hashes.push(tip);
    }
    hashes
}

/// Submit `n` empty blocks on the canonical head.
pub fn extend_head(chain: &mut ChainProcessor, n: usize, tag: u64) -> Vec<BlockHash> {
    let head = chain.head();
    extend(chain, head, n, tag)
}

/// Regtest chain over a fresh in-memory store.
pub fn memory_chain() -> (ChainProcessor, Arc<MemoryStorage>) {
    let storage = Arc::new(MemoryStorage::new());
    let chain = ChainProcessor::open(storage.clone(), params(), genesis()).expect("open");
    (chain, storage)
}

/// Node over a fresh in-memory regtest chain with a 1 MiB mempool.
pub fn memory_node() -> Node {
    Node::new(memory_chain().0, 1 << 20)
}
