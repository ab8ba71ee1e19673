use serde::{Deserialize, Serialize};
use std::fmt;

/// A 32-byte hash used throughout the system.
///
/// Hashes are kept in the internal (little-endian) byte order everywhere:
/// stored, compared and used as storage keys. Only display/log output uses
/// the reversed hex form people know from block explorers.
pub type Hash256 = [u8; 32];

/// Null hash (all zeros) used for the genesis header's prev_hash
pub const NULL_HASH: Hash256 = [0u8; 32];

/// Double SHA-256
pub fn sha256d(data: &[u8]) -> Hash256 {
    use sha2::{Digest, Sha256};
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&second);
    hash
}

/// Reversed-hex rendering of a hash (explorer byte order)
pub fn hash_hex(hash: &Hash256) -> String {
    let mut bytes = *hash;
    bytes.reverse();
    hex::encode(bytes)
}

// ─── Header ──────────────────────────────────────────────────────────

/// A block header: the fixed-size metadata sufficient to verify
/// proof-of-work and chain linkage. Immutable once constructed.
///
/// Identity is `sha256d` over the canonical 80-byte encoding, so two
/// headers with the same fields are the same block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub version: i32,
    pub prev_hash: Hash256,
    pub merkle_root: Hash256,
    /// Unix seconds
    pub timestamp: u32,
    /// Compact difficulty target
    pub bits: u32,
    pub nonce: u32,
}

impl Header {
    /// Canonical encoded size: 4 + 32 + 32 + 4 + 4 + 4
    pub const ENCODED_LEN: usize = 80;

    /// Canonical wire encoding: little-endian integers, hashes as-is.
    pub fn to_bytes(&self) -> [u8; Self::ENCODED_LEN] {
        let mut buf = [0u8; Self::ENCODED_LEN];
        buf[0..4].copy_from_slice(&self.version.to_le_bytes());
        buf[4..36].copy_from_slice(&self.prev_hash);
        buf[36..68].copy_from_slice(&self.merkle_root);
        buf[68..72].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[72..76].copy_from_slice(&self.bits.to_le_bytes());
        buf[76..80].copy_from_slice(&self.nonce.to_le_bytes());
        buf
    }

    /// Decode the canonical encoding. Returns `None` on a short/long slice.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::ENCODED_LEN {
            return None;
        }
        let mut prev_hash = [0u8; 32];
        prev_hash.copy_from_slice(&bytes[4..36]);
        let mut merkle_root = [0u8; 32];
        merkle_root.copy_from_slice(&bytes[36..68]);
        Some(Header {
            version: i32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            prev_hash,
            merkle_root,
            timestamp: u32::from_le_bytes(bytes[68..72].try_into().unwrap()),
            bits: u32::from_le_bytes(bytes[72..76].try_into().unwrap()),
            nonce: u32::from_le_bytes(bytes[76..80].try_into().unwrap()),
        })
    }

    /// Block identity: double SHA-256 of the canonical encoding
    pub fn hash(&self) -> Hash256 {
        sha256d(&self.to_bytes())
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] bits={:08x} ts={}",
            hash_hex(&self.hash()),
            self.bits,
            self.timestamp,
        )
    }
}

// ─── Stored chain records ────────────────────────────────────────────

/// A block as recorded by the store: height assigned once at insertion,
/// plus the canonical-successor link.
///
/// `next` is the hash of the successor on the currently-recorded best path
/// through this block; `None` at the frontier or on abandoned branches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredBlock {
    pub height: u32,
    pub header: Header,
    pub next: Option<Hash256>,
}

impl StoredBlock {
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }
}

impl fmt::Display for StoredBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {}", self.height, self.header)
    }
}

/// The singleton tip pointer, persisted separately from block records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tip {
    pub height: u32,
    pub hash: Hash256,
}

/// The divergence between two chain positions.
///
/// `add` is ordered ancestor→descendant, `remove` descendant→ancestor.
/// `fork` is `None` iff one endpoint is a direct ancestor of the other.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainPath {
    pub add: Vec<StoredBlock>,
    pub remove: Vec<StoredBlock>,
    pub fork: Option<StoredBlock>,
}
