//! The consensus rule set bound to one network's parameters.

use num_bigint::BigUint;
use sable_core::Amount;

use crate::difficulty::{bits_to_target, next_bits_lwma};
use crate::error::ConsensusError;
use crate::params::{ConsensusParams, NetworkUpgrade};
use crate::reward;

/// Pure consensus functions parameterized by [`ConsensusParams`].
///
/// Holds no mutable state; every method returns the same output for the
/// same input on every node.
#[derive(Clone, Debug)]
pub struct ConsensusRules {
    params: ConsensusParams,
}

impl ConsensusRules {
    /// Bind rules to a parameter set.
    pub fn new(params: ConsensusParams) -> Self {
        Self { params }
    }

    /// Underlying parameters.
    pub fn params(&self) -> &ConsensusParams {
        &self.params
    }

    /// Easiest allowed target.
    pub fn pow_limit(&self) -> Result<BigUint, ConsensusError> {
        bits_to_target(self.params.pow_limit_bits)
    }

    /// Required bits for the block after `window` (oldest first, ending at the parent).
    ///
    /// Only the trailing `difficulty_window` entries are considered.
    pub fn target_difficulty(&self, window: &[(u64, u32)]) -> Result<u32, ConsensusError> {
        let start = window.len().saturating_sub(self.params.difficulty_window);
        next_bits_lwma(
            &window[start..],
            self.params.target_block_secs,
            &self.pow_limit()?,
        )
    }

    /// Whether a reward minted at `height` may be spent at `current_height`.
    pub fn is_block_mature(&self, height: u64, current_height: u64) -> bool {
        reward::is_block_mature(&self.params, height, current_height)
    }

    /// Block reward at `height`.
    pub fn reward_at(&self, height: u64) -> Amount {
        reward::reward_at(&self.params, height)
    }

    /// Whether `upgrade` is in force for a block at `height`.
    pub fn is_active(&self, upgrade: NetworkUpgrade, height: u64) -> bool {
        self.params
            .activations
            .height_of(upgrade)
            .is_some_and(|activation| height >= activation)
    }
}
