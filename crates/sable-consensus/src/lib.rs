#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

//! Sable consensus rules for PoW blocks (v0).
//!
//! This crate is responsible for:
//! - network parameters and upgrade activation gating
//! - compact difficulty target encoding/decoding (Bitcoin-style `bits`)
//! - the LWMA difficulty adjustment
//! - proof-of-work validation against the target
//! - cumulative work and fork-choice ordering
//! - the emission schedule and reward maturity
//!
//! It intentionally does **not** include networking, mempool policy, or state updates.

pub mod difficulty;
pub mod error;
pub mod params;
pub mod pow;
pub mod reward;
pub mod rules;
pub mod validate;
pub mod work;

pub use difficulty::*;
pub use error::*;
pub use params::*;
pub use pow::*;
pub use reward::*;
pub use rules::*;
pub use validate::*;
pub use work::*;
