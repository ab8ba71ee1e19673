//! spvchain — a Simplified-Payment-Verification header chain.
//!
//! The crate accepts batches of block headers, validates them against
//! proof-of-work and difficulty-retarget rules, keeps the best chain in a
//! durable [`storage::BlockStore`], resolves forks, and exposes chain
//! mutations (including reorgs) to downstream consumers as an explicit
//! add/remove sequence via [`stream::HeaderStream`].

pub mod core;
pub mod storage;
pub mod stream;

#[cfg(test)]
pub(crate) mod testutil;

pub use crate::core::chain::{AddError, Blockchain, ChainError, ChainEvent, ChainOptions};
pub use crate::core::params::{Bitcoin, Checkpoint, NetworkParams};
pub use crate::core::types::{ChainPath, Hash256, Header, StoredBlock, Tip, NULL_HASH};
pub use crate::storage::{BlockStore, PutOpts, StoreError, StoreOptions};
pub use crate::stream::{HeaderEvent, HeaderStream, Op, StopRule, StreamOptions};
