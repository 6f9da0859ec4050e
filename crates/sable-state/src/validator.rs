// Consensus-critical. Changes require a network upgrade + tests.
//! Contextual block and transaction validation.
//!
//! Validation reads chain data through a [`ValidationContext`] and never
//! mutates state, so any number of candidates may be validated while the
//! canonical state stays readable. A successful run yields a
//! [`ValidatedBlock`], the only input the state layer commits.
//!
//! Order of checks, cheapest first:
//! 1. structure (shape, sizes, coinbase placement)
//! 2. header (link, height, time, difficulty, PoW, tx merkle root)
//! 3. each transaction (expiry, fee floor, anchors, proofs, nullifiers)
//! 4. value balance of the coinbase
//! 5. commitment root and note size after appending all outputs

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hashbrown::HashSet;
use sable_consensus::{validate_header, ConsensusError, ConsensusRules, HeaderContext, NetworkUpgrade};
use sable_core::{
    output_binding, spend_binding, tx_merkle_root, Amount, Block, BlockHash, CoreError, Nullifier,
    Output, Root, Spend, Transaction, TransactionKind,
};

use crate::error::{BlockError, TxError};
use crate::nullifier::NullifierView;
use crate::tree::Frontier;

/// Verifies the zero-knowledge proofs attached to spends and outputs.
pub trait ProofVerifier: Send + Sync {
    /// Whether `spend.proof` is valid for its nullifier and anchor.
    fn verify_spend(&self, spend: &Spend) -> bool;
    /// Whether `output.proof` is valid for its commitment.
    fn verify_output(&self, output: &Output) -> bool;
}

/// Accepts proofs that bind exactly the public inputs they claim to cover.
///
/// Stands in for a real proving system until one is integrated.
#[derive(Clone, Copy, Debug, Default)]
pub struct BindingProofVerifier;

impl ProofVerifier for BindingProofVerifier {
    fn verify_spend(&self, spend: &Spend) -> bool {
        spend.proof == spend_binding(&spend.nullifier, &spend.anchor)
    }

    fn verify_output(&self, output: &Output) -> bool {
        output.proof == output_binding(&output.commitment)
    }
}

/// Branch-relative facts a single transaction is checked against.
pub struct TxContext<'a> {
    /// Height the transaction would be mined at.
    pub height: u64,
    /// Roots a spend may be anchored to.
    pub anchors: &'a HashSet<Root>,
    /// Spent nullifiers on the branch.
    pub nullifiers: &'a dyn NullifierView,
}

/// Everything a candidate block is validated against, captured from its
/// parent's branch.
pub struct ValidationContext<'a> {
    /// Hash of the parent the candidate must link to.
    pub parent_hash: BlockHash,
    /// Ancestor-derived header facts.
    pub header: HeaderContext,
    /// Commitment roots of the last `anchor_window` blocks up to the parent.
    pub anchors: HashSet<Root>,
    /// Spent nullifiers on the parent's branch.
    pub nullifiers: &'a dyn NullifierView,
    /// Commitment tree frontier after the parent.
    pub frontier: Frontier,
    /// Set when a heavier competitor is being applied; validation stops early.
    pub cancel: Option<Arc<AtomicBool>>,
}

impl ValidationContext<'_> {
    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Acquire))
    }
}

/// A block that passed every rule against its parent's branch.
///
/// Only [`BlockValidator`] constructs this.
#[derive(Clone, Debug)]
pub struct ValidatedBlock {
    hash: BlockHash,
    block: Arc<Block>,
    fees: Amount,
}

impl ValidatedBlock {
    /// Header hash.
    pub fn hash(&self) -> BlockHash {
        self.hash
    }

    /// Height of the block.
    pub fn height(&self) -> u64 {
        self.block.header.height
    }

    /// The validated block.
    pub fn block(&self) -> &Arc<Block> {
        &self.block
    }

    /// Sum of regular transaction fees.
    pub fn fees(&self) -> Amount {
        self.fees
    }
}

/// Checks candidate blocks and loose transactions against consensus rules.
pub struct BlockValidator<'a> {
    rules: &'a ConsensusRules,
    verifier: &'a dyn ProofVerifier,
}

impl<'a> BlockValidator<'a> {
    /// Validator for `rules` using `verifier` for proofs.
    pub fn new(rules: &'a ConsensusRules, verifier: &'a dyn ProofVerifier) -> Self {
        Self { rules, verifier }
    }

    /// Validate `block` as the child of the context's parent.
    pub fn validate(
        &self,
        block: Arc<Block>,
        ctx: &ValidationContext<'_>,
    ) -> Result<ValidatedBlock, BlockError> {
        let header = &block.header;
        let hash = block.hash().map_err(BlockError::Structural)?;

        block.validate_sanity().map_err(BlockError::Structural)?;
        let size = block.size().map_err(BlockError::Structural)?;
        if size > self.rules.params().max_block_bytes {
            return Err(BlockError::Structural(CoreError::InvalidValue(
                "block exceeds max block size",
            )));
        }
        if ctx.is_cancelled() {
            return Err(BlockError::Abandoned);
        }

        if header.prev != ctx.parent_hash {
            return Err(ConsensusError::InvalidHeader("prev does not match parent").into());
        }
        validate_header(self.rules, header, &ctx.header)?;
        let merkle_root = tx_merkle_root(&block.txs).map_err(BlockError::Structural)?;
        if merkle_root != header.tx_merkle_root {
            return Err(ConsensusError::InvalidHeader("tx merkle root mismatch").into());
        }

        let tx_ctx = TxContext {
            height: header.height,
            anchors: &ctx.anchors,
            nullifiers: ctx.nullifiers,
        };
        let mut staged = HashSet::new();
        let mut fees = Amount::zero();
        for (index, tx) in block.txs.iter().enumerate() {
            if ctx.is_cancelled() {
                return Err(BlockError::Abandoned);
            }
            self.validate_transaction(tx, &tx_ctx, &mut staged)
                .map_err(|source| BlockError::InvalidTransaction { index, source })?;
            if tx.kind == TransactionKind::Regular {
                fees = fees.checked_add(tx.fee).map_err(BlockError::Structural)?;
            }
        }

        let coinbase = block
            .coinbase()
            .ok_or(BlockError::Structural(CoreError::InvalidValue("missing coinbase")))?;
        let allowed_reward = self.rules.reward_at(header.height);
        let balanced = fees
            .checked_add(coinbase.claimed_reward)
            .is_ok_and(|expected| expected == coinbase.minted);
        if !balanced || coinbase.claimed_reward > allowed_reward {
            return Err(BlockError::ValueBalance {
                minted: coinbase.minted,
                fees,
                claimed_reward: coinbase.claimed_reward,
                allowed_reward,
            });
        }

        let mut frontier = ctx.frontier.clone();
        for cm in block.commitments() {
            frontier.append(&cm)?;
        }
        let computed_root = frontier.root();
        if computed_root != header.commitment_root || frontier.size() != header.note_size {
            return Err(BlockError::CommitmentMismatch {
                header_root: header.commitment_root,
                header_size: header.note_size,
                computed_root,
                computed_size: frontier.size(),
            });
        }

        Ok(ValidatedBlock { hash, block, fees })
    }

    /// Validate one transaction in context.
    ///
    /// `staged` collects nullifiers already claimed by earlier transactions
    /// of the same block (or pool selection); this transaction's nullifiers
    /// are added on success and on failure alike.
    pub fn validate_transaction(
        &self,
        tx: &Transaction,
        ctx: &TxContext<'_>,
        staged: &mut HashSet<Nullifier>,
    ) -> Result<(), TxError> {
        tx.validate_sanity().map_err(TxError::Structural)?;

        if tx.is_expired_at(ctx.height) {
            return Err(TxError::Expired {
                expiration: tx.expiration,
                height: ctx.height,
            });
        }

        if tx.kind == TransactionKind::Regular
            && self.rules.is_active(NetworkUpgrade::MinimumFee, ctx.height)
        {
            let min = self.rules.params().min_fee;
            if tx.fee < min {
                return Err(TxError::FeeBelowMinimum { fee: tx.fee, min });
            }
        }

        for (i, spend) in tx.spends.iter().enumerate() {
            if !ctx.anchors.contains(&spend.anchor) {
                return Err(TxError::UnknownAnchor {
                    spend: i,
                    anchor: spend.anchor,
                });
            }
            if !self.verifier.verify_spend(spend) {
                return Err(TxError::InvalidSpendProof(i));
            }
        }

        for (i, output) in tx.outputs.iter().enumerate() {
            if !self.verifier.verify_output(output) {
                return Err(TxError::InvalidOutputProof(i));
            }
        }

        for nf in tx.nullifiers() {
            if !staged.insert(nf) || ctx.nullifiers.is_spent(&nf) {
                return Err(TxError::DoubleSpend { nullifier: nf });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain_state::ChainState;
    use sable_consensus::{validate_pow, ConsensusParams};
    use sable_core::{
        commit_bytes, derive_nullifier, BlockHeader, Commitment, Hash32, GENESIS_BITS,
        GENESIS_TIMESTAMP, PROTOCOL_VERSION,
    };

    fn rules() -> ConsensusRules {
        ConsensusRules::new(ConsensusParams::regtest())
    }

    fn cm(tag: u8) -> Commitment {
        commit_bytes(&[tag])
    }

    fn nf(tag: u8) -> Nullifier {
        derive_nullifier(b"sk", &[tag])
    }

    fn output(tag: u8) -> Output {
        let commitment = cm(tag);
        Output {
            commitment,
            proof: output_binding(&commitment),
        }
    }

    fn spend_tx(nf_tag: u8, anchor: Root, out_tag: u8, fee: u64) -> Transaction {
        let nullifier = nf(nf_tag);
        Transaction {
            version: PROTOCOL_VERSION,
            kind: TransactionKind::Regular,
            spends: vec![Spend {
                nullifier,
                anchor,
                proof: spend_binding(&nullifier, &anchor),
            }],
            outputs: vec![output(out_tag)],
            fee: Amount::from_atoms(fee),
            expiration: 0,
            claimed_reward: Amount::zero(),
            minted: Amount::zero(),
            memo: vec![],
        }
    }

    fn coinbase(tag: u8, reward: Amount, fees: Amount) -> Transaction {
        Transaction {
            version: PROTOCOL_VERSION,
            kind: TransactionKind::Coinbase,
            spends: vec![],
            outputs: vec![output(tag)],
            fee: Amount::zero(),
            expiration: 0,
            claimed_reward: reward,
            minted: fees.checked_add(reward).expect("sum"),
            memo: vec![],
        }
    }

    /// Assemble and mine a block over `frontier`.
    fn build(height: u64, prev: BlockHash, timestamp: u64, frontier: &Frontier, txs: Vec<Transaction>) -> Block {
        let mut f = frontier.clone();
        for c in txs.iter().flat_map(|t| t.commitments()) {
            f.append(&c).expect("append");
        }
        let mut block = Block {
            header: BlockHeader {
                version: PROTOCOL_VERSION,
                height,
                prev,
                tx_merkle_root: tx_merkle_root(&txs).expect("merkle"),
                commitment_root: f.root(),
                note_size: f.size(),
                timestamp,
                bits: GENESIS_BITS,
                nonce: 0,
            },
            txs,
        };
        while validate_pow(&block.header).is_err() {
            block.header.nonce += 1;
        }
        block
    }

    struct Fixture {
        rules: ConsensusRules,
        state: ChainState,
        genesis: Block,
        genesis_hash: BlockHash,
    }

    impl Fixture {
        fn new() -> Self {
            let rules = rules();
            let mut state = ChainState::new(rules.params().tree_depth);
            let genesis = build(
                0,
                Hash32::zero(),
                GENESIS_TIMESTAMP,
                &Frontier::new(rules.params().tree_depth),
                vec![coinbase(0, Amount::zero(), Amount::zero())],
            );
            let genesis_hash = genesis.hash().expect("hash");
            state.apply_block(genesis_hash, &genesis).expect("genesis");
            Self {
                rules,
                state,
                genesis,
                genesis_hash,
            }
        }

        fn anchor(&self) -> Root {
            self.genesis.header.commitment_root
        }

        fn ctx(&self) -> ValidationContext<'_> {
            ValidationContext {
                parent_hash: self.genesis_hash,
                header: HeaderContext {
                    parent_height: 0,
                    parent_timestamp: GENESIS_TIMESTAMP,
                    median_time_past: GENESIS_TIMESTAMP,
                    expected_bits: GENESIS_BITS,
                    now: GENESIS_TIMESTAMP + 1_000,
                },
                anchors: [self.anchor()].into_iter().collect(),
                nullifiers: self.state.nullifiers(),
                frontier: self.state.tree().frontier_at(0).expect("frontier"),
                cancel: None,
            }
        }

        fn child(&self, regular: Vec<Transaction>, reward: Amount) -> Block {
            let fees = regular
                .iter()
                .fold(Amount::zero(), |acc, tx| acc.checked_add(tx.fee).expect("fees"));
            let mut txs = vec![coinbase(1, reward, fees)];
            txs.extend(regular);
            build(
                1,
                self.genesis_hash,
                GENESIS_TIMESTAMP + 60,
                &self.state.tree().frontier_at(0).expect("frontier"),
                txs,
            )
        }

        fn check(&self, block: Block) -> Result<ValidatedBlock, BlockError> {
            BlockValidator::new(&self.rules, &BindingProofVerifier).validate(Arc::new(block), &self.ctx())
        }
    }

    #[test]
    fn accepts_well_formed_child() {
        let fx = Fixture::new();
        let reward = fx.rules.reward_at(1);
        let block = fx.child(vec![spend_tx(1, fx.anchor(), 10, 7)], reward);
        let validated = fx.check(block).expect("valid");
        assert_eq!(validated.height(), 1);
        assert_eq!(validated.fees(), Amount::from_atoms(7));
    }

    #[test]
    fn rejects_forged_spend_proof() {
        let fx = Fixture::new();
        let mut tx = spend_tx(1, fx.anchor(), 10, 0);
        tx.spends[0].proof = vec![0; 32];
        let block = fx.child(vec![tx], Amount::zero());
        assert_eq!(
            fx.check(block).err(),
            Some(BlockError::InvalidTransaction {
                index: 1,
                source: TxError::InvalidSpendProof(0)
            })
        );
    }

    #[test]
    fn rejects_unknown_anchor() {
        let fx = Fixture::new();
        let stale = Hash32([9; 32]);
        let block = fx.child(vec![spend_tx(1, stale, 10, 0)], Amount::zero());
        assert!(matches!(
            fx.check(block),
            Err(BlockError::InvalidTransaction {
                index: 1,
                source: TxError::UnknownAnchor { spend: 0, .. }
            })
        ));
    }

    #[test]
    fn rejects_nullifier_reused_within_block() {
        let fx = Fixture::new();
        let a = spend_tx(1, fx.anchor(), 10, 0);
        let b = spend_tx(1, fx.anchor(), 11, 0);
        let err = fx.check(fx.child(vec![a, b], Amount::zero())).expect_err("double spend");
        assert_eq!(err.kind(), crate::error::ErrorKind::DoubleSpend);
        assert!(matches!(err, BlockError::InvalidTransaction { index: 2, .. }));
    }

    #[test]
    fn rejects_nullifier_spent_on_branch() {
        let fx = Fixture::new();
        // Pretend the genesis block already spent nf(1).
        let mut spent = crate::nullifier::NullifierSet::new();
        spent.insert_all(&[nf(1)], 0).expect("insert");
        let block = fx.child(vec![spend_tx(1, fx.anchor(), 10, 0)], Amount::zero());
        let mut ctx = fx.ctx();
        ctx.nullifiers = &spent;
        let err = BlockValidator::new(&fx.rules, &BindingProofVerifier)
            .validate(Arc::new(block), &ctx)
            .expect_err("spent");
        assert!(matches!(
            err,
            BlockError::InvalidTransaction {
                source: TxError::DoubleSpend { .. },
                ..
            }
        ));
    }

    #[test]
    fn rejects_overclaimed_reward() {
        let fx = Fixture::new();
        let too_much = fx.rules.reward_at(1).checked_add(Amount::from_atoms(1)).expect("sum");
        let block = fx.child(vec![], too_much);
        assert!(matches!(fx.check(block), Err(BlockError::ValueBalance { .. })));
    }

    #[test]
    fn rejects_minted_not_matching_fees() {
        let fx = Fixture::new();
        let mut block = fx.child(vec![spend_tx(1, fx.anchor(), 10, 5)], Amount::zero());
        block.txs[0].minted = Amount::from_atoms(4);
        block.header.tx_merkle_root = tx_merkle_root(&block.txs).expect("merkle");
        while validate_pow(&block.header).is_err() {
            block.header.nonce += 1;
        }
        assert!(matches!(fx.check(block), Err(BlockError::ValueBalance { .. })));
    }

    #[test]
    fn rejects_wrong_commitment_root() {
        let fx = Fixture::new();
        let mut block = fx.child(vec![], Amount::zero());
        block.header.note_size += 1;
        while validate_pow(&block.header).is_err() {
            block.header.nonce += 1;
        }
        assert!(matches!(fx.check(block), Err(BlockError::CommitmentMismatch { .. })));
    }

    #[test]
    fn rejects_expired_transaction() {
        let fx = Fixture::new();
        let mut tx = spend_tx(1, fx.anchor(), 10, 0);
        tx.expiration = 1;
        let block = fx.child(vec![tx], Amount::zero());
        assert!(matches!(
            fx.check(block),
            Err(BlockError::InvalidTransaction {
                source: TxError::Expired { expiration: 1, height: 1 },
                ..
            })
        ));
    }

    #[test]
    fn rejects_unexpected_bits() {
        let fx = Fixture::new();
        let mut block = fx.child(vec![], Amount::zero());
        block.header.bits = 0x2000_ffff;
        assert!(matches!(fx.check(block), Err(BlockError::InvalidHeader(_))));
    }

    #[test]
    fn minimum_fee_applies_after_activation() {
        let mut params = ConsensusParams::regtest();
        params.min_fee = Amount::from_atoms(10);
        params.activations.minimum_fee = Some(1);
        let rules = ConsensusRules::new(params);
        let fx = Fixture::new();
        let block = fx.child(vec![spend_tx(1, fx.anchor(), 10, 9)], Amount::zero());
        let err = BlockValidator::new(&rules, &BindingProofVerifier)
            .validate(Arc::new(block), &fx.ctx())
            .expect_err("fee too low");
        assert!(matches!(
            err,
            BlockError::InvalidTransaction {
                source: TxError::FeeBelowMinimum { .. },
                ..
            }
        ));
    }

    #[test]
    fn cancelled_validation_is_abandoned() {
        let fx = Fixture::new();
        let block = fx.child(vec![], Amount::zero());
        let mut ctx = fx.ctx();
        ctx.cancel = Some(Arc::new(AtomicBool::new(true)));
        let err = BlockValidator::new(&fx.rules, &BindingProofVerifier)
            .validate(Arc::new(block), &ctx)
            .expect_err("abandoned");
        assert_eq!(err, BlockError::Abandoned);
        assert!(!err.is_permanent());
    }
}
