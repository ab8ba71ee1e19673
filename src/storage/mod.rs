//! Durable block storage.
//!
//! One record per block hash (height, header, optional canonical-successor
//! hash), a sparse height→hash index written every `index_interval` blocks,
//! and a singleton tip record. Writes are staged in an open transaction and
//! applied as one atomic sled batch, either explicitly via [`BlockStore::commit`]
//! or by a timer once the transaction has been open for `commit_interval`.
//! Reads go through the open transaction (read-your-writes) and queue behind
//! an in-flight commit instead of racing it.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::core::types::{Hash256, StoredBlock, Tip};

/// Key of the singleton tip record. Block keys are raw 32-byte hashes and
/// index keys are decimal height strings, so short literal keys can't clash.
const TIP_KEY: &[u8] = b"tip";

fn height_key(height: u32) -> Vec<u8> {
    height.to_string().into_bytes()
}

fn db_err(e: sled::Error) -> StoreError {
    StoreError::Db(e.to_string())
}

/// Tuning knobs for the store
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Write a height→hash index entry every this many blocks
    pub index_interval: u32,
    /// Auto-commit an open transaction after this long
    pub commit_interval: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        StoreOptions {
            index_interval: 1000,
            commit_interval: Duration::from_secs(1),
        }
    }
}

/// Options for a single [`BlockStore::put`]
#[derive(Debug, Default, Clone, Copy)]
pub struct PutOpts<'a> {
    /// This block becomes the new best tip (implies `best`)
    pub tip: bool,
    /// This insertion is part of the canonical path: link `prev.next` to it
    pub best: bool,
    /// The previous block to link from
    pub prev: Option<&'a StoredBlock>,
}

struct Txn {
    staged: HashMap<Vec<u8>, Vec<u8>>,
    /// Bumped on every commit; pending auto-commit timers check it to
    /// avoid committing a transaction they did not watch being opened.
    generation: u64,
    open: bool,
}

struct Inner {
    db: sled::Db,
    opts: StoreOptions,
    closed: AtomicBool,
    txn: Mutex<Txn>,
}

/// Durable, keyed storage of headers with chain-linkage metadata.
///
/// Cheap to clone; clones share the same underlying database and open
/// transaction.
#[derive(Clone)]
pub struct BlockStore {
    inner: Arc<Inner>,
}

impl BlockStore {
    /// Open or create a database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path).map_err(db_err)?;
        Ok(Self::new(db, StoreOptions::default()))
    }

    /// Wrap an already-opened sled database
    pub fn new(db: sled::Db, opts: StoreOptions) -> Self {
        BlockStore {
            inner: Arc::new(Inner {
                db,
                opts,
                closed: AtomicBool::new(false),
                txn: Mutex::new(Txn {
                    staged: HashMap::new(),
                    generation: 0,
                    open: false,
                }),
            }),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Stage a block record in the open transaction.
    ///
    /// Re-insertion of an already-stored hash is idempotent: the originally
    /// assigned height and any recorded successor link are preserved.
    pub async fn put(&self, block: &StoredBlock, opts: PutOpts<'_>) -> Result<(), StoreError> {
        let best = opts.best || opts.tip;
        if best && opts.prev.is_none() {
            return Err(StoreError::MissingField("prev"));
        }

        let hash = block.hash();
        let mut txn = self.inner.txn.lock().await;
        if self.is_closed() {
            return Err(StoreError::StoreClosed);
        }

        let mut record = block.clone();
        if let Some(existing) = self.read_record(&txn, &hash)? {
            record.height = existing.height;
            if record.next.is_none() {
                record.next = existing.next;
            }
        }

        let mut writes = vec![(hash.to_vec(), encode_block(&record)?)];
        if best {
            let prev = opts.prev.expect("checked above");
            let linked = StoredBlock {
                height: prev.height,
                header: prev.header,
                next: Some(hash),
            };
            writes.push((prev.hash().to_vec(), encode_block(&linked)?));
            if record.height % self.inner.opts.index_interval == 0 {
                writes.push((height_key(record.height), hash.to_vec()));
            }
        }
        if opts.tip {
            let tip = Tip {
                height: record.height,
                hash,
            };
            let encoded = serde_json::to_vec(&tip).map_err(|e| StoreError::Codec(e.to_string()))?;
            writes.push((TIP_KEY.to_vec(), encoded));
        }

        self.stage(&mut txn, writes);
        Ok(())
    }

    /// Fetch a stored block, reading through the open transaction
    pub async fn get(&self, hash: &Hash256) -> Result<StoredBlock, StoreError> {
        let txn = self.inner.txn.lock().await;
        if self.is_closed() {
            return Err(StoreError::StoreClosed);
        }
        self.read_record(&txn, hash)?.ok_or(StoreError::NotFound)
    }

    /// Nearest indexed hash at or below `height`, rounded down to the index
    /// interval. Advisory fast path only; ancestry stays prevHash-based.
    pub async fn get_index(&self, height: u32) -> Result<Hash256, StoreError> {
        let txn = self.inner.txn.lock().await;
        if self.is_closed() {
            return Err(StoreError::StoreClosed);
        }
        let interval = self.inner.opts.index_interval;
        let mut h = height - height % interval;
        loop {
            if let Some(bytes) = self.read_raw(&txn, &height_key(h))? {
                let hash: Hash256 = bytes
                    .try_into()
                    .map_err(|_| StoreError::Codec("bad index entry".into()))?;
                return Ok(hash);
            }
            if h == 0 {
                return Err(StoreError::NotFound);
            }
            h -= interval;
        }
    }

    /// Read the tip record joined with its full stored block
    pub async fn get_tip(&self) -> Result<(Tip, StoredBlock), StoreError> {
        let txn = self.inner.txn.lock().await;
        if self.is_closed() {
            return Err(StoreError::StoreClosed);
        }
        let bytes = self
            .read_raw(&txn, TIP_KEY)?
            .ok_or(StoreError::NotFound)?;
        let tip: Tip =
            serde_json::from_slice(&bytes).map_err(|e| StoreError::Codec(e.to_string()))?;
        let block = self
            .read_record(&txn, &tip.hash)?
            .ok_or(StoreError::NotFound)?;
        Ok((tip, block))
    }

    /// Apply the open transaction as one atomic batch and flush
    pub async fn commit(&self) -> Result<(), StoreError> {
        let mut txn = self.inner.txn.lock().await;
        self.commit_locked(&mut txn).await
    }

    /// Flush pending writes and close. Idempotent; safe to call while
    /// already closed.
    pub async fn close(&self) -> Result<(), StoreError> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut txn = self.inner.txn.lock().await;
        self.commit_locked(&mut txn).await?;
        self.inner.db.flush_async().await.map_err(db_err)?;
        Ok(())
    }

    /// Is there an open transaction with staged writes?
    pub async fn has_pending(&self) -> bool {
        !self.inner.txn.lock().await.staged.is_empty()
    }

    // ─── Internals ───────────────────────────────────────────────────

    fn stage(&self, txn: &mut Txn, writes: Vec<(Vec<u8>, Vec<u8>)>) {
        for (key, value) in writes {
            txn.staged.insert(key, value);
        }
        if !txn.open {
            txn.open = true;
            let generation = txn.generation;
            let store = self.clone();
            let ttl = self.inner.opts.commit_interval;
            tokio::spawn(async move {
                tokio::time::sleep(ttl).await;
                let mut txn = store.inner.txn.lock().await;
                if txn.open && txn.generation == generation {
                    if let Err(e) = store.commit_locked(&mut txn).await {
                        tracing::warn!("auto-commit failed: {}", e);
                    }
                }
            });
        }
    }

    async fn commit_locked(&self, txn: &mut Txn) -> Result<(), StoreError> {
        txn.generation += 1;
        txn.open = false;
        if txn.staged.is_empty() {
            return Ok(());
        }
        let mut batch = sled::Batch::default();
        for (key, value) in txn.staged.drain() {
            batch.insert(key, value);
        }
        self.inner.db.apply_batch(batch).map_err(db_err)?;
        self.inner.db.flush_async().await.map_err(db_err)?;
        Ok(())
    }

    fn read_raw(&self, txn: &Txn, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        if let Some(value) = txn.staged.get(key) {
            return Ok(Some(value.clone()));
        }
        match self.inner.db.get(key).map_err(db_err)? {
            Some(value) => Ok(Some(value.to_vec())),
            None => Ok(None),
        }
    }

    fn read_record(&self, txn: &Txn, hash: &Hash256) -> Result<Option<StoredBlock>, StoreError> {
        match self.read_raw(txn, hash)? {
            Some(bytes) => Ok(Some(decode_block(&bytes)?)),
            None => Ok(None),
        }
    }
}

fn encode_block(block: &StoredBlock) -> Result<Vec<u8>, StoreError> {
    bincode::serialize(block).map_err(|e| StoreError::Codec(e.to_string()))
}

fn decode_block(bytes: &[u8]) -> Result<StoredBlock, StoreError> {
    bincode::deserialize(bytes).map_err(|e| StoreError::Codec(e.to_string()))
}

// ─── Errors ──────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum StoreError {
    MissingField(&'static str),
    NotFound,
    StoreClosed,
    Db(String),
    Codec(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::MissingField(field) => write!(f, "must specify {}", field),
            StoreError::NotFound => write!(f, "not found"),
            StoreError::StoreClosed => write!(f, "store is closed"),
            StoreError::Db(e) => write!(f, "database error: {}", e),
            StoreError::Codec(e) => write!(f, "encoding error: {}", e),
        }
    }
}

impl std::error::Error for StoreError {}
