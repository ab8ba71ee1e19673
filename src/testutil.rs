//! Shared helpers for the async chain tests: throwaway parameters with a
//! trivial difficulty floor, and a nonce-grinding test miner.

use std::future::Future;
use std::sync::Arc;

use crate::core::chain::{Blockchain, ChainError};
use crate::core::difficulty::{expand_target, meets_target, Target};
use crate::core::params::{standard_retarget, Checkpoint, NetworkParams};
use crate::core::types::{Header, StoredBlock, NULL_HASH};
use crate::storage::{BlockStore, StoreOptions};

/// Easiest target the compact encoding can express with a clear sign bit
pub const TEST_BITS: u32 = 0x207fffff;

pub const GENESIS_TIMESTAMP: u32 = 10_000;

#[derive(Debug, Clone)]
pub struct TestParams {
    pub genesis_bits: u32,
    pub interval: u32,
    pub checkpoint: Option<Checkpoint>,
}

impl Default for TestParams {
    fn default() -> Self {
        TestParams {
            genesis_bits: TEST_BITS,
            interval: 2016,
            checkpoint: None,
        }
    }
}

impl NetworkParams for TestParams {
    fn genesis_header(&self) -> Header {
        Header {
            version: 1,
            prev_hash: NULL_HASH,
            merkle_root: NULL_HASH,
            timestamp: GENESIS_TIMESTAMP,
            bits: self.genesis_bits,
            nonce: 0,
        }
    }

    fn max_target(&self) -> Target {
        expand_target(TEST_BITS).expect("constant bits")
    }

    fn checkpoint(&self) -> Option<Checkpoint> {
        self.checkpoint.clone()
    }

    fn retarget_interval(&self) -> u32 {
        self.interval
    }

    fn calculate_target(
        &self,
        block: &StoredBlock,
        chain: &Blockchain<Self>,
    ) -> impl Future<Output = Result<Target, ChainError>> + Send {
        standard_retarget(self, block, chain)
    }
}

/// A fresh chain over a temporary database
pub async fn new_chain(params: TestParams) -> Arc<Blockchain<TestParams>> {
    let db = sled::Config::new().temporary(true).open().unwrap();
    let store = BlockStore::new(db, StoreOptions::default());
    Blockchain::new(params, store)
}

/// Grind nonces until the header satisfies its own bits
pub fn mine_header_at(prev: &StoredBlock, bits: u32, timestamp: u32) -> Header {
    let target = expand_target(bits).expect("test bits");
    let mut nonce: u32 = rand::random();
    loop {
        let header = Header {
            version: 1,
            prev_hash: prev.hash(),
            merkle_root: NULL_HASH,
            timestamp,
            bits,
            nonce,
        };
        if meets_target(&header.hash(), &target) {
            return header;
        }
        nonce = nonce.wrapping_add(1);
    }
}

pub fn mine_header(prev: &StoredBlock, bits: u32, spacing: u32) -> Header {
    mine_header_at(prev, bits, prev.header.timestamp + spacing)
}

/// A header whose hash deliberately misses its target
pub fn mine_invalid_header(prev: &StoredBlock, bits: u32, spacing: u32) -> Header {
    let target = expand_target(bits).expect("test bits");
    let mut nonce: u32 = rand::random();
    loop {
        let header = Header {
            version: 1,
            prev_hash: prev.hash(),
            merkle_root: NULL_HASH,
            timestamp: prev.header.timestamp + spacing,
            bits,
            nonce,
        };
        if !meets_target(&header.hash(), &target) {
            return header;
        }
        nonce = nonce.wrapping_add(1);
    }
}

/// Mine `count` connected headers on top of `prev`, keeping its bits.
/// Callers crossing a retarget boundary compute the boundary bits
/// themselves.
pub fn mine_chain(prev: &StoredBlock, count: usize, spacing: u32) -> Vec<Header> {
    let mut headers = Vec::with_capacity(count);
    let mut prev = prev.clone();
    for _ in 0..count {
        let header = mine_header(&prev, prev.header.bits, spacing);
        prev = StoredBlock {
            height: prev.height + 1,
            header,
            next: None,
        };
        headers.push(header);
    }
    headers
}
