// Consensus-critical. Changes require a network upgrade + tests.
//! Emission schedule and reward maturity.

use sable_core::Amount;

use crate::params::ConsensusParams;

/// Block reward at `height`: halving every `halving_interval` blocks, never
/// below the tail emission.
pub fn reward_at(params: &ConsensusParams, height: u64) -> Amount {
    let epochs = height / params.halving_interval.max(1);

    let shifted = if epochs >= 63 {
        0u64
    } else {
        params.initial_reward.atoms() >> (epochs as u32)
    };

    Amount::from_atoms(shifted.max(params.tail_emission.atoms()))
}

/// Whether a reward minted at `height` is spendable once the chain is at `current_height`.
pub fn is_block_mature(params: &ConsensusParams, height: u64, current_height: u64) -> bool {
    current_height
        .checked_sub(height)
        .is_some_and(|depth| depth >= params.maturity_window)
}
