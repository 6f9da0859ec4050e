// Consensus-critical. Changes require a network upgrade + tests.
//! Work calculation helpers (heaviest-chain selection).

use crate::difficulty::bits_to_target;
use crate::error::ConsensusError;
use num_bigint::BigUint;
use num_traits::{One, Zero};

/// Compute per-block work from compact `bits`.
///
/// Work is defined as `work = floor((2^256) / (target + 1))`.
pub fn work_from_bits(bits: u32) -> Result<BigUint, ConsensusError> {
    let target = bits_to_target(bits)?;
    if target.is_zero() {
        return Err(ConsensusError::InvalidTarget);
    }

    let two_256 = BigUint::one() << 256u32;
    Ok(&two_256 / (&target + BigUint::one()))
}

/// Return true if tip A is strictly better than tip B.
///
/// Greater cumulative work wins. On equal work the tip seen first wins;
/// hashes never break ties so miners gain nothing from grinding them.
pub fn tip_is_better(a_work: &BigUint, a_seen: u64, b_work: &BigUint, b_seen: u64) -> bool {
    if a_work != b_work {
        a_work > b_work
    } else {
        a_seen < b_seen
    }
}
