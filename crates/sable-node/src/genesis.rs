//! Deterministic genesis blocks.

use sable_consensus::{validate_pow, ConsensusParams};
use sable_core::{
    commit_bytes, output_binding, tx_merkle_root, Amount, Block, BlockHeader, Hash32, Output,
    Transaction, TransactionKind, GENESIS_TIMESTAMP, PROTOCOL_VERSION,
};
use sable_state::{BlockError, Frontier};

/// Memo carried by every genesis coinbase.
pub const GENESIS_MEMO: &[u8] = b"Sable genesis: shielded by default";

/// Build and mine the genesis block for `params.network`.
///
/// The coinbase claims no reward, so genesis mints nothing. The block is
/// mined at the network's pow limit.
pub fn build_genesis(params: &ConsensusParams) -> Result<Block, BlockError> {
    let commitment = commit_bytes(format!("sable/genesis/{}", params.network).as_bytes());
    let coinbase = Transaction {
        version: PROTOCOL_VERSION,
        kind: TransactionKind::Coinbase,
        spends: vec![],
        outputs: vec![Output {
            commitment,
            proof: output_binding(&commitment),
        }],
        fee: Amount::zero(),
        expiration: 0,
        claimed_reward: Amount::zero(),
        minted: Amount::zero(),
        memo: GENESIS_MEMO.to_vec(),
    };
    let txs = vec![coinbase];

    let mut frontier = Frontier::new(params.tree_depth);
    frontier.append(&commitment)?;

    let mut block = Block {
        header: BlockHeader {
            version: PROTOCOL_VERSION,
            height: 0,
            prev: Hash32::zero(),
            tx_merkle_root: tx_merkle_root(&txs).map_err(BlockError::Structural)?,
            commitment_root: frontier.root(),
            note_size: frontier.size(),
            timestamp: GENESIS_TIMESTAMP,
            bits: params.pow_limit_bits,
            nonce: 0,
        },
        txs,
    };
    while validate_pow(&block.header).is_err() {
        block.header.nonce = block.header.nonce.wrapping_add(1);
    }
    Ok(block)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn genesis_is_deterministic_per_network() {
        let regtest = ConsensusParams::regtest();
        let a = build_genesis(&regtest).expect("genesis");
        let b = build_genesis(&regtest).expect("genesis");
        assert_eq!(a.hash().expect("hash"), b.hash().expect("hash"));
        assert!(validate_pow(&a.header).is_ok());
        assert_eq!(a.header.note_size, 1);

        let testnet = build_genesis(&ConsensusParams::testnet()).expect("genesis");
        assert_ne!(a.txs[0].outputs[0].commitment, testnet.txs[0].outputs[0].commitment);
    }
}
