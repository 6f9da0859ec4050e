#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

//! Sable node core.
//!
//! - [`chain::ChainProcessor`]: block index, fork choice, reorgs and persistence
//! - [`mempool::MemPool`]: fee-prioritized pending transactions
//! - [`node::Node`]: locking, mempool maintenance and head-change fan-out
//! - [`storage`]: the key-value interface plus sled and in-memory backends

pub mod chain;
pub mod config;
pub mod error;
pub mod events;
pub mod genesis;
pub mod mempool;
pub mod node;
pub mod storage;
#[cfg(any(test, feature = "testkit"))]
pub mod testkit;

pub use chain::{BlockStatus, BlockTemplate, ChainProcessor, IndexRecord};
pub use config::{ConfigError, NodeConfig, StorageKind};
pub use error::{ChainError, ErrorKind, MempoolError, NodeError, StorageError};
pub use events::HeadChange;
pub use genesis::build_genesis;
pub use mempool::{MemPool, MempoolEntry};
pub use node::Node;
pub use storage::{ChainStorage, MemoryStorage, SledStorage, WriteBatch};
