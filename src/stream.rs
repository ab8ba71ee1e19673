//! A pull-based, reorg-aware sequence of chain mutations.
//!
//! Each item is an add or remove of one header at one height: replaying the
//! sequence reproduces every canonical-chain transition the engine went
//! through, including reorgs, from the starting position onward. The
//! consumer drives the stream by awaiting [`HeaderStream::next`]; nothing is
//! produced without a pull in flight, which is the backpressure boundary.

use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::core::chain::{Blockchain, ChainError, ChainEvent};
use crate::core::params::NetworkParams;
use crate::core::types::{hash_hex, ChainPath, Hash256, Header, StoredBlock, NULL_HASH};
use crate::storage::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Add,
    Remove,
}

/// One chain mutation as seen by a consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderEvent {
    pub height: u32,
    pub header: Header,
    pub op: Op,
}

/// Optional end-of-sequence condition, applied to added blocks
#[derive(Debug, Clone, Copy)]
pub enum StopRule {
    Hash(Hash256),
    Height(u32),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StreamOptions {
    /// Position to stream from; defaults to the chain base (checkpoint or
    /// genesis). When given, the starting block itself is not emitted — the
    /// consumer is assumed to already have it.
    pub from: Option<Hash256>,
    pub stop: Option<StopRule>,
}

/// A lazily-pulled, possibly-infinite sequence of `{height, header, op}`
/// items, self-resynchronizing across concurrent reorgs.
pub struct HeaderStream<P: NetworkParams> {
    chain: Arc<Blockchain<P>>,
    events: broadcast::Receiver<ChainEvent>,
    /// Next hash to emit; `None` means caught up to the tip
    cursor: Option<Hash256>,
    start: Hash256,
    /// One-shot: the starting position may lie on an abandoned fork and
    /// must first be reconciled onto the best chain
    first: bool,
    last: Option<StoredBlock>,
    /// Replayed path items not yet pulled by the consumer
    pending: VecDeque<HeaderEvent>,
    stop: Option<StopRule>,
    done: bool,
}

impl<P: NetworkParams> HeaderStream<P> {
    pub fn new(chain: Arc<Blockchain<P>>, opts: StreamOptions) -> Self {
        // subscribe before reading any chain state so no tip change can
        // fall between the initial walk and the first suspension
        let events = chain.subscribe();
        let base = chain
            .checkpoint()
            .map(|cp| cp.hash())
            .unwrap_or_else(|| chain.genesis().hash());
        let from = opts.from.filter(|hash| *hash != NULL_HASH);
        let start = from.unwrap_or(base);
        HeaderStream {
            chain,
            events,
            cursor: Some(start),
            start,
            first: from.is_some(),
            last: None,
            pending: VecDeque::new(),
            stop: opts.stop,
            done: false,
        }
    }

    /// Pull the next chain mutation. Suspends while caught up to the tip;
    /// returns `None` once the stop condition has been emitted (or the
    /// chain is gone) and `Err` on a store inconsistency, after which the
    /// stream is finished.
    pub async fn next(&mut self) -> Option<Result<HeaderEvent, StreamError>> {
        loop {
            if self.done {
                return None;
            }
            // pending path work is checked on every pull, not only when a
            // notification arrives
            if let Some(event) = self.pending.pop_front() {
                self.check_stop(&event);
                return Some(Ok(event));
            }

            let Some(hash) = self.cursor else {
                // caught up: suspend until the chain advances
                match self.events.recv().await {
                    Ok(ChainEvent::Tip(tip)) => {
                        if let Err(e) = self.sync_to(tip).await {
                            return self.fail(e);
                        }
                    }
                    // the following Tip events carry the resynchronization
                    Ok(ChainEvent::Reorg { .. }) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        // dropped notifications; re-check the chain itself
                        let tip = self.chain.tip().await;
                        if let Err(e) = self.sync_to(tip).await {
                            return self.fail(e);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        self.done = true;
                        return None;
                    }
                }
                continue;
            };

            match self.chain.get_block(&hash).await {
                Ok(block) => {
                    if self.first {
                        self.first = false;
                        if let Err(e) = self.reconcile_start(block).await {
                            return self.fail(e);
                        }
                        continue;
                    }
                    self.cursor = block.next;
                    self.last = Some(block.clone());
                    let event = HeaderEvent {
                        height: block.height,
                        header: block.header,
                        op: Op::Add,
                    };
                    self.check_stop(&event);
                    return Some(Ok(event));
                }
                Err(ChainError::Store(StoreError::NotFound)) => {
                    if hash == self.start && self.last.is_none() {
                        // the starting block is not known yet; wait for the
                        // chain to move and look again
                        match self.events.recv().await {
                            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                            Err(broadcast::error::RecvError::Closed) => {
                                self.done = true;
                                return None;
                            }
                        }
                    } else {
                        return self.fail(StreamError::MissingSuccessor(hash));
                    }
                }
                Err(e) => return self.fail(StreamError::Chain(e)),
            }
        }
    }

    /// Finish the stream early; subsequent pulls return `None`
    pub fn end(&mut self) {
        self.done = true;
    }

    /// Replay the path from the last emitted position to a new tip
    async fn sync_to(&mut self, tip: StoredBlock) -> Result<(), StreamError> {
        let Some(last) = self.last.clone() else {
            return Ok(());
        };
        // the tip only ever moves up; a lower or equal "new" tip is a stale
        // notification that a resynchronization already covered
        if tip.height <= last.height {
            return Ok(());
        }
        let path = self.chain.get_path(&last, &tip).await?;
        self.push_path(&path);
        self.cursor = tip.next;
        self.last = Some(tip);
        Ok(())
    }

    /// First-pull handling: if the starting position is on an abandoned
    /// fork, emit the remove/add path that lands the consumer on the best
    /// chain before the forward walk begins.
    async fn reconcile_start(&mut self, block: StoredBlock) -> Result<(), StreamError> {
        let best = match self.chain.get_block_at_height(block.height).await {
            Ok(best) => best,
            // the start sits above the current tip; nothing to reconcile
            Err(ChainError::InvalidHeight { .. }) => {
                self.cursor = block.next;
                self.last = Some(block);
                return Ok(());
            }
            Err(e) => return Err(StreamError::Chain(e)),
        };
        if best.hash() == block.hash() {
            // already on the best chain; continue past the start
            self.cursor = block.next;
            self.last = Some(block);
            return Ok(());
        }
        let path = self.chain.get_path(&block, &best).await?;
        self.push_path(&path);
        self.cursor = best.next;
        self.last = Some(best);
        Ok(())
    }

    /// Queue a path as removals (descending) then additions (ascending)
    fn push_path(&mut self, path: &ChainPath) {
        for block in &path.remove {
            self.pending.push_back(HeaderEvent {
                height: block.height,
                header: block.header,
                op: Op::Remove,
            });
        }
        for block in &path.add {
            self.pending.push_back(HeaderEvent {
                height: block.height,
                header: block.header,
                op: Op::Add,
            });
        }
    }

    fn check_stop(&mut self, event: &HeaderEvent) {
        let Some(stop) = self.stop else { return };
        let hit = match stop {
            StopRule::Height(height) => event.op == Op::Add && event.height >= height,
            StopRule::Hash(hash) => event.op == Op::Add && event.header.hash() == hash,
        };
        if hit {
            self.done = true;
            self.pending.clear();
        }
    }

    fn fail(&mut self, e: StreamError) -> Option<Result<HeaderEvent, StreamError>> {
        self.done = true;
        Some(Err(e))
    }
}

// ─── Errors ──────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum StreamError {
    /// The chain should continue to this block, but the store has no
    /// record of it — store corruption or a logic bug upstream.
    MissingSuccessor(Hash256),
    Chain(ChainError),
}

impl From<ChainError> for StreamError {
    fn from(e: ChainError) -> Self {
        StreamError::Chain(e)
    }
}

impl std::fmt::Display for StreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamError::MissingSuccessor(hash) => write!(
                f,
                "chain should continue to block {}, but it was not found in the block store",
                hash_hex(hash)
            ),
            StreamError::Chain(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for StreamError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StreamError::Chain(e) => Some(e),
            StreamError::MissingSuccessor(_) => None,
        }
    }
}
