#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

//! Sable core: canonical types, constants, hashing, and serialization helpers.

pub mod constants;
pub mod crypto;
pub mod serialization;
pub mod types;

pub use constants::*;
pub use crypto::*;
pub use serialization::*;
pub use types::*;
