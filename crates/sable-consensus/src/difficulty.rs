// Consensus-critical. Changes require a network upgrade + tests.
//! Difficulty target utilities.
//!
//! Sable v0 uses a Bitcoin-style "compact" encoding in `BlockHeader.bits`.
//! This encodes a 256-bit target as: `bits = (exponent << 24) | mantissa`
//! where mantissa is 3 bytes. The target is interpreted as:
//!
//! - exponent = (bits >> 24) as u8
//! - mantissa = bits & 0x007fffff (we reject sign bit)
//!
//! Then: target = mantissa * 2^(8*(exponent-3))
//!
//! This module provides strict, consensus-safe conversions without floats.

use crate::error::ConsensusError;
use num_bigint::BigUint;
use num_traits::Zero;
use sable_core::{MAX_TARGET_INCREASE_DEN, MAX_TARGET_INCREASE_NUM};

/// Decode compact `bits` to a full target (`BigUint`).
///
/// Rejects encodings that are negative, overflow-prone, or represent zero.
pub fn bits_to_target(bits: u32) -> Result<BigUint, ConsensusError> {
    let exponent = ((bits >> 24) & 0xff) as u8;
    let mantissa = bits & 0x00ff_ffff;

    // Reject negative targets (sign bit set in mantissa).
    if (bits & 0x0080_0000) != 0 {
        return Err(ConsensusError::InvalidBits);
    }

    if mantissa == 0 {
        return Err(ConsensusError::InvalidTarget);
    }

    // Anything above 2^256 cannot be compared against a 32-byte hash.
    if exponent > 32 {
        return Err(ConsensusError::InvalidBits);
    }

    let mant = BigUint::from(mantissa as u64);

    let target = if exponent <= 3 {
        let shift = 8u32 * (3u32 - exponent as u32);
        mant >> shift
    } else {
        let shift = 8u32 * (exponent as u32 - 3u32);
        mant << shift
    };

    if target.is_zero() {
        return Err(ConsensusError::InvalidTarget);
    }

    Ok(target)
}

/// Encode a target (`BigUint`) into compact `bits`.
///
/// The encoding is normalized to match Bitcoin-style compact behavior, so
/// `target_to_bits(bits_to_target(b))` returns `b` for normalized `b`.
pub fn target_to_bits(target: &BigUint) -> Result<u32, ConsensusError> {
    if target.is_zero() {
        return Err(ConsensusError::InvalidTarget);
    }

    // Big-endian bytes without leading zeros.
    let mut bytes = target.to_bytes_be();
    let mut exponent = bytes.len() as u32;

    while bytes.len() < 3 {
        bytes.push(0);
    }
    let mut mantissa = ((bytes[0] as u32) << 16) | ((bytes[1] as u32) << 8) | (bytes[2] as u32);

    // If mantissa's highest bit is set, shift it right by 8 and increase exponent.
    if (mantissa & 0x0080_0000) != 0 {
        mantissa >>= 8;
        exponent = exponent
            .checked_add(1)
            .ok_or(ConsensusError::InvalidBits)?;
    }

    mantissa &= 0x00ff_ffff;
    if mantissa == 0 {
        return Err(ConsensusError::InvalidBits);
    }

    if exponent > 255 {
        return Err(ConsensusError::InvalidBits);
    }

    Ok((exponent << 24) | mantissa)
}

/// Compare a 32-byte hash value (big-endian) with a target.
/// Returns `true` if `hash <= target`.
pub fn hash_meets_target(hash_be: &[u8; 32], target: &BigUint) -> bool {
    let h = BigUint::from_bytes_be(hash_be);
    h <= *target
}

/// Easiest target the next block may have relative to the previous target.
pub fn max_target_increase(prev_target: &BigUint) -> BigUint {
    (prev_target * MAX_TARGET_INCREASE_NUM) / MAX_TARGET_INCREASE_DEN
}

/// Compute the next difficulty target using a Linear Weighted Moving Average (LWMA).
///
/// `window` holds `(timestamp, bits)` pairs ordered oldest -> newest, ending
/// at the parent of the block being targeted. Each solve time is clamped to
/// `[1, 6 * target_secs]` so a single manipulated timestamp has a bounded
/// effect, and newer solve times carry more weight.
///
/// With fewer than two samples the parent's bits carry over. The result never
/// exceeds `max_target` nor `prev_target * MAX_TARGET_INCREASE_NUM / DEN`.
pub fn next_bits_lwma(
    window: &[(u64, u32)],
    target_secs: u64,
    max_target: &BigUint,
) -> Result<u32, ConsensusError> {
    let Some(&(_, prev_bits)) = window.last() else {
        return target_to_bits(max_target);
    };
    if window.len() < 2 {
        return Ok(prev_bits);
    }

    let mut sum_target = BigUint::zero();
    for &(_, bits) in window {
        sum_target += bits_to_target(bits)?;
    }
    let n = window.len() as u64;
    let avg_target = &sum_target / n;

    let target_secs = target_secs.max(1);
    let mut sum_weighted: u128 = 0;
    for (idx, pair) in window.windows(2).enumerate() {
        let raw = pair[1].0.saturating_sub(pair[0].0);
        let clamped = raw.clamp(1, target_secs.saturating_mul(6));
        let weight = (idx as u128) + 1; // weights 1..N-1
        sum_weighted = sum_weighted.saturating_add((clamped as u128).saturating_mul(weight));
    }

    // On-target solve times make the weighted sum equal k, leaving the average unchanged.
    let solves = (n - 1) as u128;
    let k = (solves * (solves + 1) / 2).saturating_mul(target_secs as u128).max(1);

    let mut next_target = (&avg_target * BigUint::from(sum_weighted)) / BigUint::from(k);

    let prev_target = bits_to_target(prev_bits)?;
    let max_increase = max_target_increase(&prev_target);
    if next_target > max_increase {
        next_target = max_increase;
    }
    if next_target > *max_target {
        next_target = max_target.clone();
    }
    if next_target.is_zero() {
        next_target = BigUint::from(1u32);
    }

    target_to_bits(&next_target)
}
