use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex, RwLock};

use crate::core::difficulty::{compress_target, expand_target, meets_target};
use crate::core::params::NetworkParams;
use crate::core::types::{hash_hex, ChainPath, Hash256, Header, StoredBlock};
use crate::storage::{BlockStore, PutOpts, StoreError};

/// Engine configuration that is not consensus-critical
#[derive(Debug, Clone, Default)]
pub struct ChainOptions {
    /// Reject reorgs deeper than this; defaults to one retarget interval
    pub max_reorg_depth: Option<u32>,
    /// Start from genesis even when the parameters carry a checkpoint
    pub ignore_checkpoint: bool,
}

/// Chain mutation notifications, broadcast to subscribers.
///
/// `Tip` fires for every accepted header that advances the tip; `Reorg`
/// fires once per batch that removed blocks from the canonical path.
#[derive(Debug, Clone)]
pub enum ChainEvent {
    Tip(StoredBlock),
    Reorg { path: ChainPath, tip: StoredBlock },
}

/// The validation and fork-choice engine.
///
/// Owns the current tip and drives [`BlockStore`] updates. Fork choice is
/// by height, as a deliberate simplification: a competing branch must end
/// strictly higher than the current tip to win, regardless of work.
/// Cumulative-work selection would slot in where [`Blockchain::add_headers`]
/// compares `last.height` against the previous tip height.
pub struct Blockchain<P: NetworkParams> {
    params: P,
    store: BlockStore,
    genesis: StoredBlock,
    checkpoint: Option<StoredBlock>,
    max_reorg_depth: u32,
    tip: RwLock<StoredBlock>,
    ready: watch::Sender<bool>,
    events: broadcast::Sender<ChainEvent>,
    /// Single-writer guard: at most one ingestion in flight
    ingest: Mutex<()>,
}

impl<P: NetworkParams> Blockchain<P> {
    pub fn new(params: P, store: BlockStore) -> Arc<Self> {
        Self::with_options(params, store, ChainOptions::default())
    }

    /// Construct the chain and spawn its startup task. Queries made before
    /// genesis/checkpoint insertion finishes wait for readiness instead of
    /// failing.
    pub fn with_options(params: P, store: BlockStore, opts: ChainOptions) -> Arc<Self> {
        let genesis = StoredBlock {
            height: 0,
            header: params.genesis_header(),
            next: None,
        };
        let checkpoint = if opts.ignore_checkpoint {
            None
        } else {
            params.checkpoint().map(|cp| StoredBlock {
                height: cp.height,
                header: cp.header,
                next: None,
            })
        };
        let tip = checkpoint.clone().unwrap_or_else(|| genesis.clone());
        let max_reorg_depth = opts.max_reorg_depth.unwrap_or_else(|| params.retarget_interval());
        let (ready, _) = watch::channel(false);
        let (events, _) = broadcast::channel(64);

        let chain = Arc::new(Blockchain {
            params,
            store,
            genesis,
            checkpoint,
            max_reorg_depth,
            tip: RwLock::new(tip),
            ready,
            events,
            ingest: Mutex::new(()),
        });
        let init = chain.clone();
        tokio::spawn(async move { init.initialize().await });
        chain
    }

    async fn initialize(&self) {
        match self.init_store().await {
            Ok(()) => {}
            // the chain is being torn down, not malfunctioning
            Err(ChainError::Store(StoreError::StoreClosed)) => {}
            Err(e) => tracing::error!("chain initialization failed: {}", e),
        }
        // send_replace: the value must stick even with no receiver yet
        self.ready.send_replace(true);
    }

    async fn init_store(&self) -> Result<(), ChainError> {
        let mut trusted = vec![self.genesis.clone()];
        if let Some(cp) = &self.checkpoint {
            trusted.push(cp.clone());
        }
        for block in &trusted {
            match self.store.get(&block.hash()).await {
                Ok(_) => {}
                Err(StoreError::NotFound) => {
                    self.store.put(block, PutOpts::default()).await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        match self.store.get_tip().await {
            Ok((tip, block)) => {
                tracing::info!(
                    "💾 loaded chain tip: height={} hash={}",
                    tip.height,
                    hash_hex(&tip.hash)
                );
                *self.tip.write().await = block;
            }
            Err(StoreError::NotFound) => {}
            Err(e) => return Err(e.into()),
        }
        self.store.commit().await?;
        Ok(())
    }

    /// Wait for the startup task to finish
    async fn ready(&self) {
        let mut rx = self.ready.subscribe();
        let _ = rx.wait_for(|ready| *ready).await;
    }

    pub fn genesis(&self) -> &StoredBlock {
        &self.genesis
    }

    pub fn checkpoint(&self) -> Option<&StoredBlock> {
        self.checkpoint.as_ref()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChainEvent> {
        self.events.subscribe()
    }

    pub async fn tip(&self) -> StoredBlock {
        self.ready().await;
        self.tip.read().await.clone()
    }

    pub async fn height(&self) -> u32 {
        self.tip().await.height
    }

    /// Flush the store's open transaction, for callers that need durability
    /// before acknowledging upstream
    pub async fn commit(&self) -> Result<(), ChainError> {
        self.ready().await;
        Ok(self.store.commit().await?)
    }

    pub async fn close(&self) -> Result<(), ChainError> {
        self.ready().await;
        Ok(self.store.close().await?)
    }

    // ─── Header ingestion ────────────────────────────────────────────

    /// Validate and persist an ordered batch of headers.
    ///
    /// The batch must connect to an already-stored block and must end
    /// strictly higher than the current tip. On the first invalid header
    /// ingestion stops; the accepted prefix stays committed and is returned
    /// inside the error. Only one batch may be in flight at a time.
    pub async fn add_headers(&self, headers: &[Header]) -> Result<Vec<StoredBlock>, AddError> {
        self.ready().await;
        let _guard = match self.ingest.try_lock() {
            Ok(guard) => guard,
            Err(_) => return Err(AddError::empty(ChainError::ConcurrentIngestion)),
        };
        if headers.is_empty() {
            return Ok(Vec::new());
        }

        let prev_tip = self.tip.read().await.clone();

        let start = match self.store.get(&headers[0].prev_hash).await {
            Ok(block) => block,
            Err(StoreError::NotFound) => return Err(AddError::empty(ChainError::NotConnected)),
            Err(e) => return Err(AddError::empty(e.into())),
        };

        let mut accepted: Vec<StoredBlock> = Vec::with_capacity(headers.len());
        let mut prev = start;
        for header in headers {
            match self.add_header(&prev, header).await {
                Ok(block) => {
                    accepted.push(block.clone());
                    prev = block;
                }
                Err(kind) => {
                    let _ = self.store.commit().await;
                    return Err(AddError { accepted, kind });
                }
            }
        }
        let last = prev;

        if last.height <= prev_tip.height {
            let _ = self.store.commit().await;
            return Err(AddError {
                accepted,
                kind: ChainError::TipNotHigher,
            });
        }

        let path = match self.get_path_inner(&prev_tip, &last).await {
            Ok(path) => path,
            Err(kind) => {
                let _ = self.store.commit().await;
                return Err(AddError { accepted, kind });
            }
        };

        if !path.remove.is_empty() {
            if path.remove.len() as u32 > self.max_reorg_depth {
                let kind = ChainError::ReorgTooDeep {
                    depth: path.remove.len() as u32,
                    max: self.max_reorg_depth,
                };
                if let Err(e) = self.restore_tip(&prev_tip).await {
                    return Err(AddError { accepted, kind: e });
                }
                let _ = self.store.commit().await;
                return Err(AddError { accepted, kind });
            }
            if let Err(kind) = self.relink(&path).await {
                return Err(AddError { accepted, kind });
            }
            tracing::info!(
                "🔄 reorg: {} removed, {} added, new tip #{} {}",
                path.remove.len(),
                path.add.len(),
                last.height,
                hash_hex(&last.hash())
            );
            let _ = self.events.send(ChainEvent::Reorg {
                path,
                tip: last.clone(),
            });
        }

        if let Err(kind) = self.store.commit().await {
            return Err(AddError {
                accepted,
                kind: kind.into(),
            });
        }
        Ok(accepted)
    }

    /// Validate one header against `prev` and stage it.
    ///
    /// Accepting a header that out-heights the current tip advances the tip
    /// and emits a tip-change notification.
    async fn add_header(&self, prev: &StoredBlock, header: &Header) -> Result<StoredBlock, ChainError> {
        let height = prev.height + 1;

        if header.prev_hash != prev.hash() {
            return Err(ChainError::Disconnected { height });
        }

        self.check_timestamp(prev, header).await?;

        let retarget = self.params.should_retarget(height);
        if !retarget && header.bits != prev.header.bits {
            return Err(ChainError::UnexpectedDifficultyChange { height });
        }

        let target = expand_target(header.bits).ok_or(ChainError::BadDifficultyBits {
            got: header.bits,
            expected: None,
        })?;
        let hash = header.hash();
        if !meets_target(&hash, &target) {
            return Err(ChainError::ProofOfWorkTooWeak { hash });
        }

        let block = StoredBlock {
            height,
            header: *header,
            next: None,
        };

        if retarget && !self.checkpoint_protected(height) {
            let expected = self.params.calculate_target(&block, self).await?;
            let expected_bits = compress_target(&expected);
            if expected_bits != header.bits {
                return Err(ChainError::BadDifficultyBits {
                    got: header.bits,
                    expected: Some(expected_bits),
                });
            }
        }

        let is_tip = height > self.tip.read().await.height;
        self.store
            .put(
                &block,
                PutOpts {
                    tip: is_tip,
                    best: is_tip,
                    prev: Some(prev),
                },
            )
            .await?;

        if is_tip {
            *self.tip.write().await = block.clone();
            let _ = self.events.send(ChainEvent::Tip(block.clone()));
        }
        Ok(block)
    }

    /// Timestamp sanity: within drift of the parent, and strictly above the
    /// median of the preceding 11 timestamps.
    async fn check_timestamp(&self, prev: &StoredBlock, header: &Header) -> Result<(), ChainError> {
        let height = prev.height + 1;
        if header.timestamp.abs_diff(prev.header.timestamp) > self.params.max_time_drift() {
            return Err(ChainError::TimestampTooFarAhead { height });
        }

        let mut stamps = Vec::with_capacity(11);
        let mut cursor = prev.clone();
        loop {
            stamps.push(cursor.header.timestamp);
            if stamps.len() == 11 || cursor.height == 0 {
                break;
            }
            match self.store.get(&cursor.header.prev_hash).await {
                Ok(block) => cursor = block,
                // bottom of stored ancestry (checkpoint)
                Err(StoreError::NotFound) => break,
                Err(e) => return Err(e.into()),
            }
        }
        stamps.sort_unstable();
        let median = stamps[stamps.len() / 2];
        if header.timestamp <= median {
            return Err(ChainError::TimestampTooOld { height, median });
        }
        Ok(())
    }

    fn checkpoint_protected(&self, height: u32) -> bool {
        self.checkpoint
            .as_ref()
            .map_or(false, |cp| height < cp.height + self.params.retarget_interval())
    }

    /// Re-record the `add` side of a path as the canonical segment,
    /// updating every `next` link from the fork point to the new tip.
    async fn relink(&self, path: &ChainPath) -> Result<(), ChainError> {
        let first = match path.add.first() {
            Some(block) => block,
            None => return Ok(()),
        };
        let mut prev = self.store.get(&first.header.prev_hash).await?;
        let count = path.add.len();
        for (i, block) in path.add.iter().enumerate() {
            self.store
                .put(
                    block,
                    PutOpts {
                        tip: i + 1 == count,
                        best: true,
                        prev: Some(&prev),
                    },
                )
                .await?;
            prev = block.clone();
        }
        Ok(())
    }

    /// Put the pre-batch tip back after refusing a too-deep reorg
    async fn restore_tip(&self, old: &StoredBlock) -> Result<(), ChainError> {
        match self.store.get(&old.header.prev_hash).await {
            Ok(prev) => {
                self.store
                    .put(
                        old,
                        PutOpts {
                            tip: true,
                            best: true,
                            prev: Some(&prev),
                        },
                    )
                    .await?;
            }
            // the old tip is genesis or the checkpoint; nothing above it
            // could have been removed, so the tip record is still right
            Err(StoreError::NotFound) => {}
            Err(e) => return Err(e.into()),
        }
        *self.tip.write().await = old.clone();
        Ok(())
    }

    // ─── Ancestor paths ──────────────────────────────────────────────

    /// Compute the divergence between two stored positions.
    ///
    /// O(divergence depth) in time and store reads. Antisymmetric:
    /// `get_path(a, b).add` equals `get_path(b, a).remove` reversed.
    pub async fn get_path(&self, from: &StoredBlock, to: &StoredBlock) -> Result<ChainPath, ChainError> {
        self.ready().await;
        self.get_path_inner(from, to).await
    }

    async fn get_path_inner(&self, from: &StoredBlock, to: &StoredBlock) -> Result<ChainPath, ChainError> {
        let mut path = ChainPath::default();
        let down = from.height > to.height;
        let (mut top, bottom) = if down {
            (from.clone(), to.clone())
        } else {
            (to.clone(), from.clone())
        };

        // `add` is collected descendant-first and reversed at the end
        let mut add_rev: Vec<StoredBlock> = Vec::new();

        // walk the higher side down to the lower height
        while top.height > bottom.height {
            if down {
                path.remove.push(top.clone());
            } else {
                add_rev.push(top.clone());
            }
            top = self.ancestor_of(&top).await?;
        }

        if top.hash() != bottom.hash() {
            // two branches at equal height: descend in lock-step until the
            // hashes coincide at the fork point
            let (mut from_side, mut to_side) = if down { (top, bottom) } else { (bottom, top) };
            loop {
                if from_side.height == 0 || to_side.height == 0 {
                    return Err(ChainError::NoCommonAncestor);
                }
                path.remove.push(from_side.clone());
                add_rev.push(to_side.clone());
                from_side = self.ancestor_of(&from_side).await?;
                to_side = self.ancestor_of(&to_side).await?;
                if from_side.hash() == to_side.hash() {
                    path.fork = Some(from_side);
                    break;
                }
            }
        }

        add_rev.reverse();
        path.add = add_rev;
        Ok(path)
    }

    async fn ancestor_of(&self, block: &StoredBlock) -> Result<StoredBlock, ChainError> {
        match self.store.get(&block.header.prev_hash).await {
            Ok(parent) => Ok(parent),
            // ran out of stored ancestry without converging
            Err(StoreError::NotFound) => Err(ChainError::NoCommonAncestor),
            Err(e) => Err(e.into()),
        }
    }

    // ─── Queries ─────────────────────────────────────────────────────

    pub async fn get_block(&self, hash: &Hash256) -> Result<StoredBlock, ChainError> {
        self.ready().await;
        Ok(self.store.get(hash).await?)
    }

    /// Walk `prev_hash` links from `from` down to `height`
    pub async fn get_ancestor(&self, from: &StoredBlock, height: u32) -> Result<StoredBlock, ChainError> {
        self.ready().await;
        if height > from.height {
            return Err(ChainError::InvalidHeight {
                height,
                tip: from.height,
            });
        }
        let mut block = from.clone();
        while block.height > height {
            block = self.store.get(&block.header.prev_hash).await?;
        }
        Ok(block)
    }

    /// Canonical block at `height`: nearest height-index entry, then
    /// forward along `next` links; falls back to a backward walk from the
    /// tip when the index cannot serve the height.
    pub async fn get_block_at_height(&self, height: u32) -> Result<StoredBlock, ChainError> {
        self.ready().await;
        let tip = self.tip.read().await.clone();
        if height > tip.height {
            return Err(ChainError::InvalidHeight {
                height,
                tip: tip.height,
            });
        }
        if height == tip.height {
            return Ok(tip);
        }
        if height == self.genesis.height {
            return Ok(self.store.get(&self.genesis.hash()).await?);
        }
        if let Some(cp) = &self.checkpoint {
            if height == cp.height {
                return Ok(self.store.get(&cp.hash()).await?);
            }
        }

        if let Ok(hash) = self.store.get_index(height).await {
            if let Ok(mut block) = self.store.get(&hash).await {
                while block.height <= height {
                    if block.height == height {
                        return Ok(block);
                    }
                    match block.next {
                        Some(next) => match self.store.get(&next).await {
                            Ok(b) => block = b,
                            Err(_) => break,
                        },
                        None => break,
                    }
                }
            }
        }

        // the index is advisory; ancestry is authoritative
        let mut block = tip;
        while block.height > height {
            block = self.store.get(&block.header.prev_hash).await?;
        }
        Ok(block)
    }

    /// Deepest canonical block whose timestamp is at or after `timestamp`.
    /// The walk stops once it has passed `timestamp - margin`, so the result
    /// tolerates locally non-monotonic timestamps up to `margin` seconds.
    pub async fn get_block_at_time(&self, timestamp: u32, margin: u32) -> Result<StoredBlock, ChainError> {
        self.ready().await;
        let tip = self.tip.read().await.clone();
        let mut best = tip.clone();
        let mut cursor = tip;
        loop {
            if cursor.header.timestamp >= timestamp {
                best = cursor.clone();
            }
            if cursor.header.timestamp < timestamp.saturating_sub(margin) || cursor.height == 0 {
                break;
            }
            cursor = match self.store.get(&cursor.header.prev_hash).await {
                Ok(block) => block,
                // bottom of stored ancestry
                Err(StoreError::NotFound) => break,
                Err(e) => return Err(e.into()),
            };
        }
        Ok(best)
    }

    /// A short list of ancestor hashes for sync handshakes, newest first
    pub async fn get_locator(&self, from: Option<Hash256>) -> Result<Vec<Hash256>, ChainError> {
        self.ready().await;
        let start = match from {
            Some(hash) => hash,
            None => self.tip.read().await.hash(),
        };
        let mut locator = Vec::new();
        let mut cursor = match self.store.get(&start).await {
            Ok(block) => block,
            Err(StoreError::NotFound) => return Ok(locator),
            Err(e) => return Err(e.into()),
        };
        loop {
            locator.push(cursor.hash());
            if locator.len() >= 6 || cursor.height == 0 {
                break;
            }
            cursor = match self.store.get(&cursor.header.prev_hash).await {
                Ok(block) => block,
                Err(StoreError::NotFound) => break,
                Err(e) => return Err(e.into()),
            };
        }
        Ok(locator)
    }
}

// ─── Errors ──────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ChainError {
    Disconnected { height: u32 },
    UnexpectedDifficultyChange { height: u32 },
    ProofOfWorkTooWeak { hash: Hash256 },
    BadDifficultyBits { got: u32, expected: Option<u32> },
    TimestampTooOld { height: u32, median: u32 },
    TimestampTooFarAhead { height: u32 },
    NoCommonAncestor,
    ReorgTooDeep { depth: u32, max: u32 },
    ConcurrentIngestion,
    NotConnected,
    TipNotHigher,
    InvalidHeight { height: u32, tip: u32 },
    Store(StoreError),
}

impl From<StoreError> for ChainError {
    fn from(e: StoreError) -> Self {
        ChainError::Store(e)
    }
}

impl std::fmt::Display for ChainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainError::Disconnected { height } => {
                write!(f, "header not connected to previous at height {}", height)
            }
            ChainError::UnexpectedDifficultyChange { height } => {
                write!(f, "unexpected difficulty change at height {}", height)
            }
            ChainError::ProofOfWorkTooWeak { hash } => {
                write!(f, "mining hash is above target: {}", hash_hex(hash))
            }
            ChainError::BadDifficultyBits { got, expected: Some(expected) } => write!(
                f,
                "bits in header ({:08x}) different than expected ({:08x})",
                got, expected
            ),
            ChainError::BadDifficultyBits { got, expected: None } => {
                write!(f, "difficulty bits do not decode: {:08x}", got)
            }
            ChainError::TimestampTooOld { height, median } => write!(
                f,
                "timestamp at height {} is not greater than median {} of previous timestamps",
                height, median
            ),
            ChainError::TimestampTooFarAhead { height } => {
                write!(f, "timestamp at height {} is too far from previous", height)
            }
            ChainError::NoCommonAncestor => write!(f, "blocks are not in the same chain"),
            ChainError::ReorgTooDeep { depth, max } => {
                write!(f, "reorg of depth {} exceeds maximum {}", depth, max)
            }
            ChainError::ConcurrentIngestion => {
                write!(f, "another batch of headers is already being added")
            }
            ChainError::NotConnected => write!(f, "block does not connect to chain"),
            ChainError::TipNotHigher => write!(f, "new tip is not higher than current tip"),
            ChainError::InvalidHeight { height, tip } => {
                write!(f, "height {} is out of range (tip is {})", height, tip)
            }
            ChainError::Store(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ChainError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ChainError::Store(e) => Some(e),
            _ => None,
        }
    }
}

/// A batch ingestion failure, carrying the prefix that was accepted and
/// committed before the offending header.
#[derive(Debug)]
pub struct AddError {
    pub accepted: Vec<StoredBlock>,
    pub kind: ChainError,
}

impl AddError {
    fn empty(kind: ChainError) -> Self {
        AddError {
            accepted: Vec::new(),
            kind,
        }
    }
}

impl std::fmt::Display for AddError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({} headers accepted)", self.kind, self.accepted.len())
    }
}

impl std::error::Error for AddError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::difficulty::calculate_pow_target;
    use crate::core::params::Checkpoint;
    use crate::core::types::NULL_HASH;
    use crate::storage::StoreOptions;
    use crate::testutil::*;

    #[tokio::test]
    async fn test_starts_at_genesis() {
        let chain = new_chain(TestParams::default()).await;
        assert_eq!(chain.height().await, 0);
        let tip = chain.tip().await;
        assert_eq!(tip.hash(), chain.genesis().hash());
        let stored = chain.get_block(&tip.hash()).await.unwrap();
        assert_eq!(stored.header, chain.genesis().header);
    }

    #[tokio::test]
    async fn test_add_headers_extends_tip() {
        let chain = new_chain(TestParams::default()).await;
        let headers = mine_chain(chain.genesis(), 10, 600);
        let accepted = chain.add_headers(&headers).await.unwrap();
        assert_eq!(accepted.len(), 10);
        assert_eq!(chain.height().await, 10);
        assert_eq!(chain.tip().await.hash(), headers[9].hash());
        // next links are in place along the whole path
        let genesis = chain.get_block(&chain.genesis().hash()).await.unwrap();
        assert_eq!(genesis.next, Some(headers[0].hash()));
    }

    #[tokio::test]
    async fn test_unconnected_batch_rejected() {
        let chain = new_chain(TestParams::default()).await;
        let other = StoredBlock {
            height: 0,
            header: Header {
                prev_hash: [7u8; 32],
                ..chain.genesis().header
            },
            next: None,
        };
        let headers = mine_chain(&other, 2, 600);
        let err = chain.add_headers(&headers).await.unwrap_err();
        assert!(matches!(err.kind, ChainError::NotConnected));
        assert!(err.accepted.is_empty());
    }

    #[tokio::test]
    async fn test_partial_batch_keeps_accepted_prefix() {
        let chain = new_chain(TestParams::default()).await;
        let mut headers = mine_chain(chain.genesis(), 4, 600);
        let prev = StoredBlock {
            height: 4,
            header: headers[3],
            next: None,
        };
        headers.push(mine_invalid_header(&prev, TEST_BITS, 600));
        headers.extend(mine_chain(&prev, 2, 600)); // never reached

        let err = chain.add_headers(&headers).await.unwrap_err();
        assert!(matches!(err.kind, ChainError::ProofOfWorkTooWeak { .. }));
        assert_eq!(err.accepted.len(), 4);
        // the valid prefix advanced the tip and stayed committed
        assert_eq!(chain.height().await, 4);
        assert!(chain.get_block(&headers[3].hash()).await.is_ok());
    }

    #[tokio::test]
    async fn test_disconnected_header_rejected() {
        let chain = new_chain(TestParams::default()).await;
        let mut headers = mine_chain(chain.genesis(), 3, 600);
        headers[2].prev_hash = [3u8; 32];
        let err = chain.add_headers(&headers).await.unwrap_err();
        assert!(matches!(err.kind, ChainError::Disconnected { height: 3 }));
        assert_eq!(err.accepted.len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_ingestion_rejected() {
        let chain = new_chain(TestParams::default()).await;
        let headers = mine_chain(chain.genesis(), 1, 600);
        let guard = chain.ingest.try_lock().unwrap();
        let err = chain.add_headers(&headers).await.unwrap_err();
        assert!(matches!(err.kind, ChainError::ConcurrentIngestion));
        drop(guard);
        chain.add_headers(&headers).await.unwrap();
    }

    #[tokio::test]
    async fn test_off_boundary_difficulty_change_rejected() {
        let chain = new_chain(TestParams::default()).await;
        let mut headers = mine_chain(chain.genesis(), 2, 600);
        let prev = StoredBlock {
            height: 1,
            header: headers[0],
            next: None,
        };
        headers[1] = mine_header(&prev, 0x207ffffe, 600);
        let err = chain.add_headers(&headers).await.unwrap_err();
        assert!(matches!(
            err.kind,
            ChainError::UnexpectedDifficultyChange { height: 2 }
        ));
    }

    #[tokio::test]
    async fn test_median_timestamp_rejected() {
        let chain = new_chain(TestParams::default()).await;
        let headers = mine_chain(chain.genesis(), 12, 600);
        chain.add_headers(&headers).await.unwrap();

        // a timestamp at (or below) the median of the last 11 must fail
        let tip = chain.tip().await;
        let stale = mine_header_at(&tip, TEST_BITS, tip.header.timestamp - 6 * 600);
        let err = chain.add_headers(&[stale]).await.unwrap_err();
        assert!(matches!(err.kind, ChainError::TimestampTooOld { .. }));
    }

    #[tokio::test]
    async fn test_timestretched_header_rejected() {
        let chain = new_chain(TestParams::default()).await;
        let headers = mine_chain(chain.genesis(), 2, 600);
        chain.add_headers(&headers).await.unwrap();

        let tip = chain.tip().await;
        let stretched = mine_header_at(&tip, TEST_BITS, tip.header.timestamp + 1_000_000);
        let err = chain.add_headers(&[stretched]).await.unwrap_err();
        assert!(matches!(
            err.kind,
            ChainError::TimestampTooFarAhead { .. }
        ));
    }

    #[tokio::test]
    async fn test_reorg_not_higher_rejected() {
        let chain = new_chain(TestParams::default()).await;
        let headers = mine_chain(chain.genesis(), 10, 600);
        chain.add_headers(&headers).await.unwrap();

        // fork from height 5, ending at the same height as the tip
        let fork_base = chain.get_block_at_height(5).await.unwrap();
        let branch = mine_chain(&fork_base, 5, 601);
        let err = chain.add_headers(&branch).await.unwrap_err();
        assert!(matches!(err.kind, ChainError::TipNotHigher));
        assert_eq!(chain.height().await, 10);
        assert_eq!(chain.tip().await.hash(), headers[9].hash());
    }

    #[tokio::test]
    async fn test_reorg_to_higher_fork() {
        let chain = new_chain(TestParams::default()).await;
        let mut events = chain.subscribe();
        let headers = mine_chain(chain.genesis(), 10, 600);
        chain.add_headers(&headers).await.unwrap();

        let fork_base = chain.get_block_at_height(5).await.unwrap();
        let branch = mine_chain(&fork_base, 6, 601);
        chain.add_headers(&branch).await.unwrap();

        assert_eq!(chain.height().await, 11);
        assert_eq!(chain.tip().await.hash(), branch[5].hash());

        // exactly one reorg event, removing 10..=6 and adding 6..=11
        let mut reorg = None;
        while let Ok(event) = events.try_recv() {
            if let ChainEvent::Reorg { path, tip } = event {
                assert!(reorg.is_none(), "single reorg expected");
                reorg = Some((path, tip));
            }
        }
        let (path, tip) = reorg.expect("reorg event");
        assert_eq!(tip.height, 11);
        let removed: Vec<u32> = path.remove.iter().map(|b| b.height).collect();
        assert_eq!(removed, vec![10, 9, 8, 7, 6]);
        let added: Vec<u32> = path.add.iter().map(|b| b.height).collect();
        assert_eq!(added, vec![6, 7, 8, 9, 10, 11]);
        assert_eq!(path.fork.as_ref().unwrap().hash(), fork_base.hash());
        assert_eq!(
            path.remove.iter().map(|b| b.hash()).collect::<Vec<_>>(),
            headers[5..].iter().map(|h| h.hash()).collect::<Vec<_>>().into_iter().rev().collect::<Vec<_>>()
        );

        // the canonical walk now follows the new branch
        let at7 = chain.get_block_at_height(7).await.unwrap();
        assert_eq!(at7.hash(), branch[1].hash());
        // abandoned blocks remain queryable
        assert!(chain.get_block(&headers[9].hash()).await.is_ok());
    }

    #[tokio::test]
    async fn test_reorg_deeper_than_limit_rejected() {
        let chain = {
            let db = sled::Config::new().temporary(true).open().unwrap();
            let store = crate::storage::BlockStore::new(db, StoreOptions::default());
            Blockchain::with_options(
                TestParams::default(),
                store,
                ChainOptions {
                    max_reorg_depth: Some(3),
                    ignore_checkpoint: false,
                },
            )
        };
        let headers = mine_chain(chain.genesis(), 10, 600);
        chain.add_headers(&headers).await.unwrap();

        let fork_base = chain.get_block_at_height(5).await.unwrap();
        let branch = mine_chain(&fork_base, 6, 601);
        let err = chain.add_headers(&branch).await.unwrap_err();
        assert!(matches!(
            err.kind,
            ChainError::ReorgTooDeep { depth: 5, max: 3 }
        ));
        // the old tip is retained
        assert_eq!(chain.height().await, 10);
        assert_eq!(chain.tip().await.hash(), headers[9].hash());
        assert_eq!(
            chain.get_block_at_height(7).await.unwrap().hash(),
            headers[6].hash()
        );
    }

    #[tokio::test]
    async fn test_get_path_antisymmetry() {
        let chain = new_chain(TestParams::default()).await;
        let headers = mine_chain(chain.genesis(), 10, 600);
        chain.add_headers(&headers).await.unwrap();
        let old_tip = chain.tip().await;

        let fork_base = chain.get_block_at_height(5).await.unwrap();
        let branch = mine_chain(&fork_base, 6, 601);
        chain.add_headers(&branch).await.unwrap();
        let new_tip = chain.tip().await;

        let forward = chain.get_path(&old_tip, &new_tip).await.unwrap();
        let backward = chain.get_path(&new_tip, &old_tip).await.unwrap();

        let rev =
            |blocks: &[StoredBlock]| blocks.iter().rev().map(|b| b.hash()).collect::<Vec<_>>();
        let ids = |blocks: &[StoredBlock]| blocks.iter().map(|b| b.hash()).collect::<Vec<_>>();
        assert_eq!(ids(&forward.add), rev(&backward.remove));
        assert_eq!(ids(&forward.remove), rev(&backward.add));
        assert_eq!(
            forward.fork.as_ref().unwrap().hash(),
            backward.fork.as_ref().unwrap().hash()
        );
    }

    #[tokio::test]
    async fn test_get_path_direct_ancestor_has_no_fork() {
        let chain = new_chain(TestParams::default()).await;
        let headers = mine_chain(chain.genesis(), 5, 600);
        chain.add_headers(&headers).await.unwrap();

        let low = chain.get_block_at_height(2).await.unwrap();
        let tip = chain.tip().await;
        let path = chain.get_path(&low, &tip).await.unwrap();
        assert!(path.fork.is_none());
        assert!(path.remove.is_empty());
        let added: Vec<u32> = path.add.iter().map(|b| b.height).collect();
        assert_eq!(added, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn test_retarget_boundary_enforced() {
        let params = TestParams {
            genesis_bits: 0x2007ffff,
            interval: 8,
            ..TestParams::default()
        };
        let max_target = params.max_target();
        let chain = new_chain(params).await;
        // 2400s spacing makes the first interval take 4x its schedule
        let headers = mine_chain(chain.genesis(), 7, 2400);
        chain.add_headers(&headers).await.unwrap();
        let tip = chain.tip().await;

        // wrong: keeping the old bits across the boundary
        let unchanged = mine_header(&tip, 0x2007ffff, 2400);
        let err = chain.add_headers(&[unchanged]).await.unwrap_err();
        match err.kind {
            ChainError::BadDifficultyBits { got, expected } => {
                assert_eq!(got, 0x2007ffff);
                let prev_target = expand_target(0x2007ffff).unwrap();
                let four_x = calculate_pow_target(4 * 8 * 600, &prev_target, 8 * 600, &max_target);
                assert_eq!(expected, Some(compress_target(&four_x)));
            }
            other => panic!("expected BadDifficultyBits, got {:?}", other),
        }

        // right: the clamped 4x retarget
        let prev_target = expand_target(0x2007ffff).unwrap();
        let expected = compress_target(&calculate_pow_target(
            4 * 8 * 600,
            &prev_target,
            8 * 600,
            &max_target,
        ));
        let retargeted = mine_header(&tip, expected, 2400);
        chain.add_headers(&[retargeted]).await.unwrap();
        assert_eq!(chain.height().await, 8);
    }

    #[tokio::test]
    async fn test_checkpoint_chain_starts_at_checkpoint() {
        let checkpoint_header = Header {
            version: 1,
            prev_hash: [0xaa; 32],
            merkle_root: NULL_HASH,
            timestamp: GENESIS_TIMESTAMP + 100 * 600,
            bits: TEST_BITS,
            nonce: 0,
        };
        let params = TestParams {
            checkpoint: Some(Checkpoint {
                height: 100,
                header: checkpoint_header,
            }),
            ..TestParams::default()
        };
        let chain = new_chain(params).await;
        let tip = chain.tip().await;
        assert_eq!(tip.height, 100);
        assert_eq!(tip.header, checkpoint_header);

        // extend on top without any ancestry below the checkpoint
        let headers = mine_chain(&tip, 3, 600);
        chain.add_headers(&headers).await.unwrap();
        assert_eq!(chain.height().await, 103);
        assert_eq!(
            chain.get_block_at_height(101).await.unwrap().hash(),
            headers[0].hash()
        );
    }

    #[tokio::test]
    async fn test_reopen_recovers_tip_and_genesis_is_idempotent() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        {
            let store = crate::storage::BlockStore::new(db.clone(), StoreOptions::default());
            let chain = Blockchain::new(TestParams::default(), store);
            let headers = mine_chain(chain.genesis(), 5, 600);
            chain.add_headers(&headers).await.unwrap();
            chain.commit().await.unwrap();
        }
        let store = crate::storage::BlockStore::new(db, StoreOptions::default());
        let chain = Blockchain::new(TestParams::default(), store);
        assert_eq!(chain.height().await, 5);
        // re-inserting genesis on startup did not disturb its record
        let genesis = chain.get_block(&chain.genesis().hash()).await.unwrap();
        assert_eq!(genesis.height, 0);
        assert!(genesis.next.is_some());
    }

    #[tokio::test]
    async fn test_get_block_at_height_uses_index_and_fallback() {
        // interval 2: even heights indexed
        let db = sled::Config::new().temporary(true).open().unwrap();
        let store = crate::storage::BlockStore::new(
            db,
            StoreOptions {
                index_interval: 2,
                ..StoreOptions::default()
            },
        );
        let chain = Blockchain::new(TestParams::default(), store);
        let headers = mine_chain(chain.genesis(), 9, 600);
        chain.add_headers(&headers).await.unwrap();
        for height in 1..=9u32 {
            let block = chain.get_block_at_height(height).await.unwrap();
            assert_eq!(block.hash(), headers[height as usize - 1].hash());
        }

        // default interval leaves no usable entries at these heights, so
        // resolution falls back to the backward walk from the tip
        let chain = new_chain(TestParams::default()).await;
        let headers = mine_chain(chain.genesis(), 9, 600);
        chain.add_headers(&headers).await.unwrap();
        for height in [1u32, 4, 8] {
            let block = chain.get_block_at_height(height).await.unwrap();
            assert_eq!(block.hash(), headers[height as usize - 1].hash());
        }
        let err = chain.get_block_at_height(10).await.unwrap_err();
        assert!(matches!(err, ChainError::InvalidHeight { height: 10, tip: 9 }));
    }

    #[tokio::test]
    async fn test_get_block_at_time() {
        let chain = new_chain(TestParams::default()).await;
        let headers = mine_chain(chain.genesis(), 5, 600);
        chain.add_headers(&headers).await.unwrap();
        // timestamps: genesis 10000, then 10600..13000 in 600s steps

        let at = chain.get_block_at_time(11_800, 0).await.unwrap();
        assert_eq!(at.height, 3);
        let between = chain.get_block_at_time(11_900, 0).await.unwrap();
        assert_eq!(between.height, 4);
        // predating the whole chain resolves to genesis
        let early = chain.get_block_at_time(1, 0).await.unwrap();
        assert_eq!(early.height, 0);
        // later than the tip resolves to the tip
        let late = chain.get_block_at_time(99_999, 0).await.unwrap();
        assert_eq!(late.height, 5);
    }

    #[tokio::test]
    async fn test_get_locator() {
        let chain = new_chain(TestParams::default()).await;
        let headers = mine_chain(chain.genesis(), 10, 600);
        chain.add_headers(&headers).await.unwrap();

        let locator = chain.get_locator(None).await.unwrap();
        assert_eq!(locator.len(), 6);
        assert_eq!(locator[0], headers[9].hash());
        assert_eq!(locator[5], headers[4].hash());

        // a short chain stops at genesis
        let short = new_chain(TestParams::default()).await;
        let locator = short.get_locator(None).await.unwrap();
        assert_eq!(locator, vec![short.genesis().hash()]);
    }
}
