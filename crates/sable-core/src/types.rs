// Consensus-critical. Changes require a network upgrade + tests.
//! Canonical protocol types for Sable v0.
//!
//! This module defines all consensus-visible data structures and primitive
//! value types used across the protocol. All types here must remain
//! backward-compatible once released.

use crate::constants::*;
use borsh::{BorshDeserialize, BorshSerialize};
use core::fmt;
use core::str::FromStr;

/// Errors related to parsing, validation, or construction of core protocol types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoreError {
    /// Hex string had an unexpected byte length.
    #[error("invalid hex length: expected {expected} bytes, got {got} bytes")]
    InvalidHexLength {
        /// Expected number of bytes.
        expected: usize,
        /// Actual number of bytes provided.
        got: usize,
    },

    /// Hex decoding failed. Holds the decoder's message.
    #[error("invalid hex: {0}")]
    InvalidHex(String),

    /// Arithmetic overflow or underflow occurred.
    #[error("amount overflow or underflow")]
    AmountOverflow,

    /// A value violated protocol constraints.
    #[error("invalid value: {0}")]
    InvalidValue(&'static str),

    /// A transaction inside a block violated structural constraints.
    #[error("transaction {index}: {reason}")]
    InvalidTransactionAt {
        /// Position of the transaction in the block.
        index: usize,
        /// Violated constraint.
        reason: &'static str,
    },
}

/// Defines a fixed-size opaque byte value with hex `Display`/`FromStr`.
macro_rules! fixed_bytes {
    ($(#[$meta:meta])* $name:ident, $len:expr) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, BorshSerialize, BorshDeserialize)]
        pub struct $name(pub [u8; $len]);

        impl $name {
            /// Returns the all-zero value.
            pub const fn zero() -> Self {
                Self([0u8; $len])
            }

            /// Returns the underlying byte array.
            pub const fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), hex::encode(self.0))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&hex::encode(self.0))
            }
        }

        impl From<[u8; $len]> for $name {
            fn from(value: [u8; $len]) -> Self {
                Self(value)
            }
        }

        impl From<$name> for [u8; $len] {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl FromStr for $name {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let s = s.strip_prefix("0x").unwrap_or(s);
                let bytes = hex::decode(s).map_err(|e| CoreError::InvalidHex(e.to_string()))?;
                if bytes.len() != $len {
                    return Err(CoreError::InvalidHexLength {
                        expected: $len,
                        got: bytes.len(),
                    });
                }
                let mut arr = [0u8; $len];
                arr.copy_from_slice(&bytes);
                Ok(Self(arr))
            }
        }
    };
}

fixed_bytes!(
    /// Fixed-size 32-byte hash used throughout the protocol.
    Hash32,
    HASH32_LEN
);

fixed_bytes!(
    /// Commitment to a shielded note; the leaf value of the commitment tree.
    Commitment,
    COMMITMENT_LEN
);

fixed_bytes!(
    /// Nullifier identifying a spent note.
    Nullifier,
    NULLIFIER_LEN
);

/// Block hash type.
pub type BlockHash = Hash32;

/// Transaction identifier type.
pub type TxId = Hash32;

/// Root of the note commitment tree.
pub type Root = Hash32;

/// Amount expressed in the smallest unit ("atoms").
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, BorshSerialize, BorshDeserialize)]
pub struct Amount(pub u64);

impl Amount {
    /// Returns a zero amount.
    pub const fn zero() -> Self {
        Self(0)
    }

    /// Constructs an amount from atoms.
    pub const fn from_atoms(atoms: u64) -> Self {
        Self(atoms)
    }

    /// Returns the underlying atom value.
    pub const fn atoms(self) -> u64 {
        self.0
    }

    /// Checked addition.
    pub fn checked_add(self, other: Amount) -> Result<Self, CoreError> {
        self.0
            .checked_add(other.0)
            .map(Self)
            .ok_or(CoreError::AmountOverflow)
    }

    /// Checked subtraction.
    pub fn checked_sub(self, other: Amount) -> Result<Self, CoreError> {
        self.0
            .checked_sub(other.0)
            .map(Self)
            .ok_or(CoreError::AmountOverflow)
    }
}

impl fmt::Debug for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Amount({} atoms)", self.0)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} atoms", self.0)
    }
}

/// Transaction kind.
///
/// `Coinbase` is the only transaction type allowed to mint new supply.
#[derive(Clone, Copy, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
pub enum TransactionKind {
    /// Coinbase transaction (must be tx[0] of a block).
    Coinbase,
    /// Regular transaction (spends notes via nullifiers).
    Regular,
}

/// A shielded spend: reveals a nullifier and proves membership of the spent
/// note under `anchor`.
#[derive(Clone, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
pub struct Spend {
    /// Nullifier of the note being spent.
    pub nullifier: Nullifier,
    /// Commitment tree root the spend proof was built against.
    pub anchor: Root,
    /// Opaque proof bytes.
    pub proof: Vec<u8>,
}

/// A shielded output: a new note commitment plus its well-formedness proof.
#[derive(Clone, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
pub struct Output {
    /// Commitment appended to the note commitment tree.
    pub commitment: Commitment,
    /// Opaque proof bytes.
    pub proof: Vec<u8>,
}

/// Public transaction container (v0).
///
/// Note values are hidden inside commitments. The coinbase carries the
/// declared value of its outputs (`minted`) and the reward it claims so the
/// block's value balance can be checked without opening any note.
#[derive(Clone, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
pub struct Transaction {
    /// Protocol version for this transaction.
    pub version: u16,
    /// Transaction kind.
    pub kind: TransactionKind,
    /// Notes consumed by this transaction (Regular only).
    pub spends: Vec<Spend>,
    /// Newly created notes.
    pub outputs: Vec<Output>,
    /// Public transaction fee, in atoms (Regular only).
    pub fee: Amount,
    /// Last height (exclusive) this transaction may be mined at; 0 means never expires.
    pub expiration: u64,
    /// Block reward claimed by the miner (Coinbase only).
    pub claimed_reward: Amount,
    /// Declared value of the coinbase outputs: reward plus collected fees (Coinbase only).
    pub minted: Amount,
    /// Optional encrypted memo payload.
    pub memo: Vec<u8>,
}

impl Transaction {
    /// Performs basic structural validation.
    pub fn validate_sanity(&self) -> Result<(), CoreError> {
        if self.version != PROTOCOL_VERSION {
            return Err(CoreError::InvalidValue("unsupported transaction version"));
        }
        if self.outputs.len() > MAX_OUTPUTS_PER_TX {
            return Err(CoreError::InvalidValue("too many outputs"));
        }
        if self.memo.len() > MAX_MEMO_BYTES {
            return Err(CoreError::InvalidValue("memo too large"));
        }

        match self.kind {
            TransactionKind::Coinbase => {
                if !self.spends.is_empty() {
                    return Err(CoreError::InvalidValue("coinbase must have no spends"));
                }
                if self.fee != Amount::zero() {
                    return Err(CoreError::InvalidValue("coinbase fee must be zero"));
                }
                if self.outputs.is_empty() {
                    return Err(CoreError::InvalidValue("coinbase must have >= 1 output"));
                }
                if self.expiration != 0 {
                    return Err(CoreError::InvalidValue("coinbase must not expire"));
                }
                Ok(())
            }
            TransactionKind::Regular => {
                if self.spends.is_empty() {
                    return Err(CoreError::InvalidValue("transaction has no spends"));
                }
                if self.spends.len() > MAX_SPENDS_PER_TX {
                    return Err(CoreError::InvalidValue("too many spends"));
                }
                if self.outputs.is_empty() {
                    return Err(CoreError::InvalidValue("transaction has no outputs"));
                }
                if self.claimed_reward != Amount::zero() || self.minted != Amount::zero() {
                    return Err(CoreError::InvalidValue(
                        "regular tx must not carry coinbase claims",
                    ));
                }
                Ok(())
            }
        }
    }

    /// Nullifiers revealed by this transaction, in spend order.
    pub fn nullifiers(&self) -> impl Iterator<Item = Nullifier> + '_ {
        self.spends.iter().map(|s| s.nullifier)
    }

    /// Commitments created by this transaction, in output order.
    pub fn commitments(&self) -> impl Iterator<Item = Commitment> + '_ {
        self.outputs.iter().map(|o| o.commitment)
    }

    /// Whether the transaction can no longer be mined at `height`.
    pub fn is_expired_at(&self, height: u64) -> bool {
        self.expiration != 0 && self.expiration <= height
    }
}

/// Block header containing consensus-critical metadata.
#[derive(Clone, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
pub struct BlockHeader {
    /// Protocol version.
    pub version: u16,
    /// Sequence number; genesis is height 0.
    pub height: u64,
    /// Hash of the previous block.
    pub prev: BlockHash,
    /// Merkle root of transaction identifiers.
    pub tx_merkle_root: Hash32,
    /// Commitment tree root after this block.
    pub commitment_root: Root,
    /// Commitment tree size after this block.
    pub note_size: u64,
    /// Block timestamp (Unix seconds).
    pub timestamp: u64,
    /// Compact difficulty target.
    pub bits: u32,
    /// Proof-of-work nonce.
    pub nonce: u64,
}

/// Full block (header + transactions).
#[derive(Clone, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
pub struct Block {
    /// Block header.
    pub header: BlockHeader,
    /// Transactions included in this block.
    pub txs: Vec<Transaction>,
}

impl Block {
    /// Performs basic structural validation.
    ///
    /// Checks the block shape only: exactly one coinbase in first position and
    /// sane transactions. Context-dependent rules live in the validator.
    pub fn validate_sanity(&self) -> Result<(), CoreError> {
        if self.header.version != PROTOCOL_VERSION {
            return Err(CoreError::InvalidValue("unsupported block version"));
        }
        if self.txs.is_empty() {
            return Err(CoreError::InvalidValue("block has no transactions"));
        }

        for (index, tx) in self.txs.iter().enumerate() {
            let expected = if index == 0 {
                TransactionKind::Coinbase
            } else {
                TransactionKind::Regular
            };
            if tx.kind != expected {
                let reason = if index == 0 {
                    "tx[0] must be coinbase"
                } else {
                    "only tx[0] may be coinbase"
                };
                return Err(CoreError::InvalidTransactionAt { index, reason });
            }
            tx.validate_sanity().map_err(|e| CoreError::InvalidTransactionAt {
                index,
                reason: match e {
                    CoreError::InvalidValue(reason) => reason,
                    _ => "sanity validation failed",
                },
            })?;
        }
        Ok(())
    }

    /// The coinbase transaction, if the block has one in first position.
    pub fn coinbase(&self) -> Option<&Transaction> {
        self.txs.first().filter(|tx| tx.kind == TransactionKind::Coinbase)
    }

    /// All nullifiers revealed in this block, in block order.
    pub fn nullifiers(&self) -> impl Iterator<Item = Nullifier> + '_ {
        self.txs.iter().flat_map(|tx| tx.nullifiers())
    }

    /// All commitments created in this block, in block order.
    pub fn commitments(&self) -> impl Iterator<Item = Commitment> + '_ {
        self.txs.iter().flat_map(|tx| tx.commitments())
    }

    /// Number of notes this block appends to the commitment tree.
    pub fn output_count(&self) -> u64 {
        self.txs.iter().map(|tx| tx.outputs.len() as u64).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(byte: u8) -> Output {
        Output {
            commitment: Commitment([byte; 32]),
            proof: vec![],
        }
    }

    fn coinbase() -> Transaction {
        Transaction {
            version: PROTOCOL_VERSION,
            kind: TransactionKind::Coinbase,
            spends: vec![],
            outputs: vec![output(1)],
            fee: Amount::zero(),
            expiration: 0,
            claimed_reward: Amount::from_atoms(10),
            minted: Amount::from_atoms(10),
            memo: vec![],
        }
    }

    fn regular() -> Transaction {
        Transaction {
            version: PROTOCOL_VERSION,
            kind: TransactionKind::Regular,
            spends: vec![Spend {
                nullifier: Nullifier([7; 32]),
                anchor: Hash32::zero(),
                proof: vec![],
            }],
            outputs: vec![output(2)],
            fee: Amount::from_atoms(1),
            expiration: 0,
            claimed_reward: Amount::zero(),
            minted: Amount::zero(),
            memo: vec![],
        }
    }

    fn block(txs: Vec<Transaction>) -> Block {
        Block {
            header: BlockHeader {
                version: PROTOCOL_VERSION,
                height: 1,
                prev: Hash32::zero(),
                tx_merkle_root: Hash32::zero(),
                commitment_root: Hash32::zero(),
                note_size: 0,
                timestamp: 1,
                bits: GENESIS_BITS,
                nonce: 0,
            },
            txs,
        }
    }

    #[test]
    fn hex_roundtrip_and_prefix() {
        let h = Hash32([0xab; 32]);
        let parsed: Hash32 = format!("0x{h}").parse().expect("parse");
        assert_eq!(parsed, h);
        assert!(matches!(
            "abcd".parse::<Nullifier>(),
            Err(CoreError::InvalidHexLength { expected: 32, got: 2 })
        ));
        assert!(matches!("zz".parse::<Hash32>(), Err(CoreError::InvalidHex(_))));
    }

    #[test]
    fn coinbase_must_come_first() {
        let b = block(vec![regular(), coinbase()]);
        assert!(matches!(
            b.validate_sanity(),
            Err(CoreError::InvalidTransactionAt { index: 0, .. })
        ));
    }

    #[test]
    fn second_coinbase_rejected_with_index() {
        let b = block(vec![coinbase(), regular(), coinbase()]);
        assert!(matches!(
            b.validate_sanity(),
            Err(CoreError::InvalidTransactionAt { index: 2, .. })
        ));
    }

    #[test]
    fn regular_tx_cannot_claim_reward() {
        let mut tx = regular();
        tx.minted = Amount::from_atoms(5);
        assert!(tx.validate_sanity().is_err());
    }

    #[test]
    fn expiration_zero_never_expires() {
        let mut tx = regular();
        assert!(!tx.is_expired_at(u64::MAX));
        tx.expiration = 10;
        assert!(!tx.is_expired_at(9));
        assert!(tx.is_expired_at(10));
    }

    #[test]
    fn block_iterators_follow_block_order() {
        let b = block(vec![coinbase(), regular()]);
        assert_eq!(b.output_count(), 2);
        let cms: Vec<_> = b.commitments().collect();
        assert_eq!(cms, vec![Commitment([1; 32]), Commitment([2; 32])]);
        assert_eq!(b.nullifiers().count(), 1);
    }
}
