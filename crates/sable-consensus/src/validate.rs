// Consensus-critical. Changes require a network upgrade + tests.
//! Context-free header rules: versions, timestamps, proof of work.
//!
//! This module does not touch chain state (commitments/nullifiers). Callers
//! supply the ancestor data (median-time-past, parent timestamp, expected
//! bits) and a reference `now`, so every check stays deterministic.

use crate::error::ConsensusError;
use crate::params::NetworkUpgrade;
use crate::pow::validate_pow;
use crate::rules::ConsensusRules;
use sable_core::{BlockHeader, PROTOCOL_VERSION};

/// Ancestor-derived facts a header is checked against.
#[derive(Clone, Copy, Debug)]
pub struct HeaderContext {
    /// Height of the parent block.
    pub parent_height: u64,
    /// Timestamp of the parent block.
    pub parent_timestamp: u64,
    /// Median-time-past over the parent's ancestry.
    pub median_time_past: u64,
    /// Bits required by the difficulty rule for this height.
    pub expected_bits: u32,
    /// Local clock reading (Unix seconds).
    pub now: u64,
}

/// Validate a non-genesis header against its parent context.
///
/// Order: version, height, timestamp (MTP, sequential rule, future skew),
/// difficulty bits, then proof of work, so cheap checks reject first.
pub fn validate_header(
    rules: &ConsensusRules,
    header: &BlockHeader,
    ctx: &HeaderContext,
) -> Result<(), ConsensusError> {
    if header.version != PROTOCOL_VERSION {
        return Err(ConsensusError::InvalidHeader("unsupported header version"));
    }
    if Some(header.height) != ctx.parent_height.checked_add(1) {
        return Err(ConsensusError::InvalidHeader("height must be parent height + 1"));
    }
    if header.timestamp <= ctx.median_time_past {
        return Err(ConsensusError::InvalidHeader("timestamp below MTP"));
    }
    if rules.is_active(NetworkUpgrade::SequentialBlockTime, header.height)
        && header.timestamp <= ctx.parent_timestamp
    {
        return Err(ConsensusError::InvalidHeader("timestamp not after parent"));
    }
    if !is_within_future_skew(header.timestamp, ctx.now, rules.params().max_future_skew_secs) {
        return Err(ConsensusError::TimestampTooNew {
            timestamp: header.timestamp,
            limit: ctx.now.saturating_add(rules.params().max_future_skew_secs),
        });
    }
    if header.bits != ctx.expected_bits {
        return Err(ConsensusError::InvalidHeader("unexpected difficulty bits"));
    }
    validate_pow(header)
}

/// Whether `candidate` is no further than `max_skew_secs` ahead of `now`.
///
/// Timestamps in the past are governed by median-time-past, not by this bound.
pub fn is_within_future_skew(candidate: u64, now: u64, max_skew_secs: u64) -> bool {
    candidate <= now.saturating_add(max_skew_secs)
}

/// Compute median-time-past over the last `window` timestamps (oldest first).
pub fn median_time_past(timestamps: &[u64], window: usize) -> Option<u64> {
    if timestamps.is_empty() {
        return None;
    }
    let start = timestamps.len().saturating_sub(window.max(1));
    let mut buf: Vec<u64> = timestamps[start..].to_vec();
    buf.sort_unstable();
    Some(buf[buf.len() / 2])
}
