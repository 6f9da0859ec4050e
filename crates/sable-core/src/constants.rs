//! Protocol-wide constants for Sable v0.

/// Protocol semantic version (v0).
pub const PROTOCOL_VERSION: u16 = 0;

/// Length in bytes of a 32-byte hash.
pub const HASH32_LEN: usize = 32;

/// Length in bytes of a note commitment.
pub const COMMITMENT_LEN: usize = 32;

/// Length in bytes of a nullifier.
pub const NULLIFIER_LEN: usize = 32;

/// Number of atomic units per one Sable.
///
/// 1 Sable = 10^8 atoms.
pub const ATOMS_PER_SABLE: u64 = 100_000_000;

/// Maximum number of outputs allowed in a single transaction.
///
/// This is a DoS-prevention bound, not a protocol limitation.
pub const MAX_OUTPUTS_PER_TX: usize = 16;

/// Maximum number of spends (nullifiers) allowed in a single transaction.
///
/// This is a DoS-prevention bound, not a privacy constraint.
pub const MAX_SPENDS_PER_TX: usize = 16;

/// Maximum serialized transaction size (in bytes).
///
/// Transactions exceeding this size are rejected before verification.
pub const MAX_TX_BYTES: usize = 200_000;

/// Maximum memo payload carried by a transaction.
pub const MAX_MEMO_BYTES: usize = 512;

/// Domain separator used when hashing block headers.
pub const DS_BLOCK_HEADER: &[u8] = b"SABLE::BLOCK_HEADER::V0";

/// Domain separator used when hashing transactions.
pub const DS_TX: &[u8] = b"SABLE::TX::V0";

/// Domain separator for the transaction merkle tree committed in headers.
pub const DS_TX_MERKLE: &[u8] = b"SABLE::TX_MERKLE::V0";

/// Domain separator used when deriving note commitments.
pub const DS_COMMITMENT: &[u8] = b"SABLE::COMMITMENT::V0";

/// Domain separator used when deriving nullifiers.
pub const DS_NULLIFIER: &[u8] = b"SABLE::NULLIFIER::V0";

/// Domain separator for the placeholder spend proof binding.
pub const DS_SPEND_PROOF: &[u8] = b"SABLE::SPEND_PROOF::V0";

/// Domain separator for the placeholder output proof binding.
pub const DS_OUTPUT_PROOF: &[u8] = b"SABLE::OUTPUT_PROOF::V0";

/// Block time target in seconds.
pub const BLOCK_TIME_SECS: u64 = 60;

/// Number of trailing blocks feeding the LWMA difficulty computation.
pub const DIFFICULTY_WINDOW: usize = 45;

/// Number of blocks per halving interval (4 years at 60s blocks).
pub const HALVING_INTERVAL_BLOCKS: u64 = 2_102_400;

/// Initial block reward in atoms (8.0 SABLE).
pub const INITIAL_REWARD_ATOMS: u64 = 8 * ATOMS_PER_SABLE;

/// Tail emission reward in atoms (0.1 SABLE).
pub const TAIL_EMISSION_ATOMS: u64 = ATOMS_PER_SABLE / 10;

/// Confirmations required before a block reward becomes spendable.
pub const COINBASE_MATURITY: u64 = 100;

/// Number of recent commitment roots a spend may be anchored to.
pub const ANCHOR_WINDOW: u64 = 100;

/// Depth of the note commitment tree (2^32 leaves).
pub const NOTE_TREE_DEPTH: u8 = 32;

/// Maximum serialized block size accepted by consensus.
pub const MAX_BLOCK_BYTES: usize = 2_000_000;

/// Allowed clock skew for block timestamps ahead of local time.
pub const MAX_FUTURE_SKEW_SECS: u64 = 2 * 60 * 60;

/// Number of ancestors feeding median-time-past.
pub const MEDIAN_TIME_WINDOW: usize = 11;

/// Numerator of the maximum per-block target increase (difficulty drop).
pub const MAX_TARGET_INCREASE_NUM: u32 = 5;

/// Denominator of the maximum per-block target increase (difficulty drop).
pub const MAX_TARGET_INCREASE_DEN: u32 = 4;

/// Easiest compact target; used for genesis and regtest.
pub const GENESIS_BITS: u32 = 0x207f_ffff;

/// Genesis timestamp (Unix seconds).
pub const GENESIS_TIMESTAMP: u64 = 1_735_689_600;
