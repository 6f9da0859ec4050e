//! Static network parameters and activation gating.
//!
//! Parameters are consumed as configuration; nothing here is loaded from disk.

use core::fmt;
use core::str::FromStr;

use sable_core::{
    Amount, ANCHOR_WINDOW, BLOCK_TIME_SECS, COINBASE_MATURITY, DIFFICULTY_WINDOW, GENESIS_BITS,
    HALVING_INTERVAL_BLOCKS, INITIAL_REWARD_ATOMS, MAX_BLOCK_BYTES, MAX_FUTURE_SKEW_SECS,
    MEDIAN_TIME_WINDOW, NOTE_TREE_DEPTH, TAIL_EMISSION_ATOMS,
};

use crate::error::ConsensusError;

/// Which chain the node follows.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Network {
    /// Production network.
    Mainnet,
    /// Public test network.
    Testnet,
    /// Local regression-test network with an easy target and short windows.
    Regtest,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Regtest => "regtest",
        })
    }
}

impl FromStr for Network {
    type Err = ConsensusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mainnet" | "main" => Ok(Network::Mainnet),
            "testnet" | "test" => Ok(Network::Testnet),
            "regtest" => Ok(Network::Regtest),
            other => Err(ConsensusError::UnknownNetwork(other.to_string())),
        }
    }
}

/// Rule changes that switch on at a configured height.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NetworkUpgrade {
    /// Block timestamps must strictly exceed the parent's timestamp.
    SequentialBlockTime,
    /// Regular transactions must pay at least `min_fee`.
    MinimumFee,
}

/// Activation heights; `None` means the upgrade is never active.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Activations {
    /// Height at which [`NetworkUpgrade::SequentialBlockTime`] activates.
    pub sequential_block_time: Option<u64>,
    /// Height at which [`NetworkUpgrade::MinimumFee`] activates.
    pub minimum_fee: Option<u64>,
}

impl Activations {
    /// Activation height of `upgrade`, if scheduled.
    pub fn height_of(&self, upgrade: NetworkUpgrade) -> Option<u64> {
        match upgrade {
            NetworkUpgrade::SequentialBlockTime => self.sequential_block_time,
            NetworkUpgrade::MinimumFee => self.minimum_fee,
        }
    }
}

/// Consensus constants for one network.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConsensusParams {
    /// Network these parameters belong to.
    pub network: Network,
    /// Easiest allowed compact target.
    pub pow_limit_bits: u32,
    /// Target spacing between blocks, in seconds.
    pub target_block_secs: u64,
    /// Trailing blocks fed into the difficulty computation.
    pub difficulty_window: usize,
    /// How far ahead of local time a block timestamp may be.
    pub max_future_skew_secs: u64,
    /// Ancestors used for median-time-past.
    pub median_time_window: usize,
    /// Confirmations before a block reward may be spent.
    pub maturity_window: u64,
    /// How many blocks back a spend anchor may lag the parent.
    pub anchor_window: u64,
    /// Reward of the first halving epoch.
    pub initial_reward: Amount,
    /// Blocks per halving epoch.
    pub halving_interval: u64,
    /// Reward floor once halvings drop below it.
    pub tail_emission: Amount,
    /// Maximum serialized block size.
    pub max_block_bytes: usize,
    /// Minimum fee once [`NetworkUpgrade::MinimumFee`] is active.
    pub min_fee: Amount,
    /// Depth of the note commitment tree.
    pub tree_depth: u8,
    /// Upgrade activation heights.
    pub activations: Activations,
}

impl ConsensusParams {
    /// Mainnet parameters.
    pub fn mainnet() -> Self {
        Self {
            network: Network::Mainnet,
            pow_limit_bits: 0x1f00_ffff,
            target_block_secs: BLOCK_TIME_SECS,
            difficulty_window: DIFFICULTY_WINDOW,
            max_future_skew_secs: MAX_FUTURE_SKEW_SECS,
            median_time_window: MEDIAN_TIME_WINDOW,
            maturity_window: COINBASE_MATURITY,
            anchor_window: ANCHOR_WINDOW,
            initial_reward: Amount::from_atoms(INITIAL_REWARD_ATOMS),
            halving_interval: HALVING_INTERVAL_BLOCKS,
            tail_emission: Amount::from_atoms(TAIL_EMISSION_ATOMS),
            max_block_bytes: MAX_BLOCK_BYTES,
            min_fee: Amount::from_atoms(1_000),
            tree_depth: NOTE_TREE_DEPTH,
            activations: Activations {
                sequential_block_time: Some(1),
                minimum_fee: Some(1),
            },
        }
    }

    /// Testnet parameters: mainnet economics, easier target.
    pub fn testnet() -> Self {
        Self {
            network: Network::Testnet,
            pow_limit_bits: GENESIS_BITS,
            activations: Activations {
                sequential_block_time: Some(10_000),
                minimum_fee: None,
            },
            ..Self::mainnet()
        }
    }

    /// Regtest parameters: easiest target and short windows so tests can
    /// exercise maturity, anchors and difficulty quickly.
    pub fn regtest() -> Self {
        Self {
            network: Network::Regtest,
            pow_limit_bits: GENESIS_BITS,
            difficulty_window: 10,
            maturity_window: 3,
            anchor_window: 5,
            halving_interval: 150,
            min_fee: Amount::zero(),
            activations: Activations::default(),
            ..Self::mainnet()
        }
    }

    /// Parameters for a named network.
    pub fn for_network(network: Network) -> Self {
        match network {
            Network::Mainnet => Self::mainnet(),
            Network::Testnet => Self::testnet(),
            Network::Regtest => Self::regtest(),
        }
    }
}
