#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

//! Sable state machine (v0).
//!
//! Responsibilities:
//! - Maintain the fixed-depth note commitment tree with per-height roots
//! - Maintain the nullifier set (spent tags) with the height that spent each
//! - Validate candidate blocks against their parent's branch
//! - Apply, unwind and reorg validated blocks on the canonical state
//!
//! Proofs are checked through the [`ProofVerifier`] trait; the default
//! [`BindingProofVerifier`] only checks that a proof binds its public inputs.

pub mod chain_state;
pub mod error;
pub mod nullifier;
pub mod tree;
pub mod validator;

pub use chain_state::*;
pub use error::*;
pub use nullifier::*;
pub use tree::*;
pub use validator::*;
