//! Network parameters: the per-chain configuration the engine validates
//! against. The engine itself never computes a retarget formula; it only
//! enforces that a header's compact bits match what the parameters'
//! `calculate_target` returns.

use std::future::Future;

use crate::core::chain::{Blockchain, ChainError};
use crate::core::difficulty::{calculate_pow_target, expand_target, Target};
use crate::core::types::{Hash256, Header, StoredBlock, NULL_HASH};

/// A hard-coded trusted block. Ancestry and retarget verification never
/// reach below the last checkpoint.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub height: u32,
    pub header: Header,
}

/// Chain-specific consensus configuration
pub trait NetworkParams: Send + Sync + 'static {
    fn genesis_header(&self) -> Header;

    /// The easiest permitted target; retarget results are capped here
    fn max_target(&self) -> Target;

    fn checkpoint(&self) -> Option<Checkpoint> {
        None
    }

    /// Blocks between difficulty recalculations
    fn retarget_interval(&self) -> u32 {
        2016
    }

    /// Scheduled seconds between blocks
    fn target_spacing(&self) -> u32 {
        600
    }

    fn target_timespan(&self) -> u32 {
        self.retarget_interval() * self.target_spacing()
    }

    /// Maximum distance between a header's timestamp and its parent's
    fn max_time_drift(&self) -> u32 {
        4 * 60 * 60
    }

    fn should_retarget(&self, height: u32) -> bool {
        height != 0 && height % self.retarget_interval() == 0
    }

    /// Expected target for `block`, which sits on a retarget boundary.
    /// `chain` gives access to the ancestry of the branch being extended.
    fn calculate_target(
        &self,
        block: &StoredBlock,
        chain: &Blockchain<Self>,
    ) -> impl Future<Output = Result<Target, ChainError>> + Send
    where
        Self: Sized;
}

/// The usual retarget: timespan measured against the boundary one interval
/// back on the candidate's own branch, scaled and clamped by
/// [`calculate_pow_target`]. Shared by every shipped parameter set.
pub async fn standard_retarget<P: NetworkParams>(
    params: &P,
    block: &StoredBlock,
    chain: &Blockchain<P>,
) -> Result<Target, ChainError> {
    let prev = chain.get_block(&block.header.prev_hash).await?;
    let first = chain
        .get_ancestor(&prev, block.height - params.retarget_interval())
        .await?;
    let timespan = block.header.timestamp.saturating_sub(first.header.timestamp);
    let prev_target = expand_target(prev.header.bits).ok_or(ChainError::BadDifficultyBits {
        got: prev.header.bits,
        expected: None,
    })?;
    Ok(calculate_pow_target(
        timespan,
        &prev_target,
        params.target_timespan(),
        &params.max_target(),
    ))
}

// ─── Bitcoin mainnet ─────────────────────────────────────────────────

/// Merkle root of the bitcoin genesis block, internal byte order
const BITCOIN_GENESIS_MERKLE_ROOT: Hash256 = [
    0x3b, 0xa3, 0xed, 0xfd, 0x7a, 0x7b, 0x12, 0xb2, 0x7a, 0xc7, 0x2c, 0x3e, 0x67, 0x76, 0x8f,
    0x61, 0x7f, 0xc8, 0x1b, 0xc3, 0x88, 0x8a, 0x51, 0x32, 0x3a, 0x9f, 0xb8, 0xaa, 0x4b, 0x1e,
    0x5e, 0x4a,
];

/// Bitcoin mainnet parameters
#[derive(Debug, Clone, Copy, Default)]
pub struct Bitcoin;

impl NetworkParams for Bitcoin {
    fn genesis_header(&self) -> Header {
        Header {
            version: 1,
            prev_hash: NULL_HASH,
            merkle_root: BITCOIN_GENESIS_MERKLE_ROOT,
            timestamp: 1231006505,
            bits: 0x1d00ffff,
            nonce: 2083236893,
        }
    }

    fn max_target(&self) -> Target {
        expand_target(0x1d00ffff).expect("constant bits")
    }

    fn calculate_target(
        &self,
        block: &StoredBlock,
        chain: &Blockchain<Self>,
    ) -> impl Future<Output = Result<Target, ChainError>> + Send {
        standard_retarget(self, block, chain)
    }
}
