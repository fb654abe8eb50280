//! Single-consumer, many-producer batching queue that admits new series and
//! back-pressured writes without holding the shard's write lock (§4.4).
//!
//! Modeled after `committer.rs`'s drain loop: a `start()` function spawns a
//! task holding the only receiver, and callers get back a cheap-to-clone
//! client whose `insert()` returns a `WaitGroup` that resolves once the
//! batch containing that op has drained.

use std::{
    sync::{
        atomic::{
            AtomicI64,
            Ordering,
        },
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::{
    mpsc,
    oneshot,
};
use tracing::warn;

use crate::{
    collaborators::{
        Block,
        Series,
    },
    entry::Entry,
    errors,
    types::{
        BlockStart,
        SeriesId,
        Timestamp,
    },
};

#[derive(Clone, Debug)]
pub struct PendingIndex {
    pub block_start: BlockStart,
    pub enqueued_at: Timestamp,
    pub tags: Vec<(Arc<str>, Arc<str>)>,
}

pub enum InsertAction {
    /// A pending write, optionally piggybacking an index insert (§4.6).
    Write {
        ts: Timestamp,
        value: f64,
        unit: Arc<str>,
        annotation: Option<Arc<[u8]>>,
        index: Option<PendingIndex>,
    },
    /// An index-only insert, used when a write was already applied
    /// synchronously and only indexing needs to piggyback on the queue.
    Index(PendingIndex),
    /// A retrieved-block / bootstrap hydrate.
    Hydrate(Block),
    /// Install-only: used by `LoadBlocks`'s synchronous find-or-insert,
    /// which needs an entry installed in the map but applies the actual
    /// series mutation itself, outside the queue.
    InstallOnly,
}

pub struct InsertOp<S: Series> {
    pub id: SeriesId,
    /// The tentative entry the producer built, installed if absent or
    /// discarded in favor of the existing one (§4.5 Pass 1).
    pub entry: Arc<Entry<S>>,
    pub action: InsertAction,
    pub skip_rate_limit: bool,
    /// Set by the producer if it already holds a ref on `entry` that the
    /// queue must release after Pass 2 runs.
    pub release_entry_ref: bool,
}

/// Handle for a producer to await completion of the batch containing its
/// op.
pub struct WaitGroup {
    rx: oneshot::Receiver<Result<(), Arc<anyhow::Error>>>,
}

impl WaitGroup {
    pub async fn wait(self) -> anyhow::Result<()> {
        match self.rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(anyhow::anyhow!("{e:#}")),
            Err(_) => Err(errors::queue_stopped()),
        }
    }
}

#[async_trait]
pub trait InsertBatchHandler<S: Series>: Send + Sync + 'static {
    /// Runs the two-pass batch handler (§4.5) and reports, per op index,
    /// whether that specific op succeeded. The overall `Err` only covers
    /// batch-fatal conditions (e.g. the shard is closing); individual op
    /// failures are reported through `op_results`.
    async fn handle_batch(
        &self,
        batch: Vec<InsertOp<S>>,
    ) -> anyhow::Result<Vec<Result<(), anyhow::Error>>>;
}

enum QueueMessage<S: Series> {
    Insert(InsertOp<S>, oneshot::Sender<Result<(), Arc<anyhow::Error>>>),
}

struct RateLimiter {
    tokens: AtomicI64,
    capacity: i64,
}

impl RateLimiter {
    fn new(capacity: usize) -> Self {
        Self {
            tokens: AtomicI64::new(capacity as i64),
            capacity: capacity as i64,
        }
    }

    fn try_acquire(&self) -> bool {
        loop {
            let current = self.tokens.load(Ordering::SeqCst);
            if current <= 0 {
                return false;
            }
            if self
                .tokens
                .compare_exchange(current, current - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Refill by `amount`, capped at capacity. Called once per Tick, per
    /// §4.4's "refill rate is configured per tick duration".
    fn refill(&self, amount: usize) {
        loop {
            let current = self.tokens.load(Ordering::SeqCst);
            let next = (current + amount as i64).min(self.capacity);
            if self
                .tokens
                .compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return;
            }
        }
    }
}

#[derive(Clone)]
pub struct InsertQueueClient<S: Series> {
    sender: mpsc::Sender<QueueMessage<S>>,
    rate_limiter: Arc<RateLimiter>,
}

impl<S: Series> InsertQueueClient<S> {
    /// Enqueue `op`. Fails fast (without waiting on the drain loop) if the
    /// queue is at capacity or, for rate-limited ops, if the token bucket
    /// is exhausted (§4.4).
    pub async fn insert(&self, op: InsertOp<S>) -> anyhow::Result<WaitGroup> {
        if !op.skip_rate_limit && !self.rate_limiter.try_acquire() {
            crate::metrics::INSERT_THROTTLED_TOTAL.inc();
            return Err(errors::rate_limited());
        }
        let (tx, rx) = oneshot::channel();
        self.sender
            .try_send(QueueMessage::Insert(op, tx))
            .map_err(|_| errors::insert_queue_full())?;
        Ok(WaitGroup { rx })
    }

    pub fn refill_rate_limit(&self, amount: usize) {
        self.rate_limiter.refill(amount);
    }
}

pub fn start<S, H>(
    handler: Arc<H>,
    capacity: usize,
    rate_limit_capacity: usize,
) -> (InsertQueueClient<S>, tokio::task::JoinHandle<()>)
where
    S: Series,
    H: InsertBatchHandler<S>,
{
    let (sender, receiver) = mpsc::channel(capacity);
    let rate_limiter = Arc::new(RateLimiter::new(rate_limit_capacity));
    let client = InsertQueueClient {
        sender,
        rate_limiter,
    };
    let join = tokio::task::spawn(drain_loop(receiver, handler));
    (client, join)
}

async fn drain_loop<S, H>(mut receiver: mpsc::Receiver<QueueMessage<S>>, handler: Arc<H>)
where
    S: Series,
    H: InsertBatchHandler<S>,
{
    loop {
        let Some(first) = receiver.recv().await else {
            return;
        };
        let mut ops = Vec::new();
        let mut replies = Vec::new();
        push(first, &mut ops, &mut replies);
        // Coalesce everything else already queued, per §4.4: "pulls all
        // currently queued ops as one batch".
        while let Ok(msg) = receiver.try_recv() {
            push(msg, &mut ops, &mut replies);
        }
        let batch_len = ops.len();
        crate::metrics::INSERT_BATCH_ENTRIES.observe(batch_len as f64);
        match handler.handle_batch(ops).await {
            Ok(results) => {
                for (reply, result) in replies.into_iter().zip(results) {
                    let _ = reply.send(result.map_err(Arc::new));
                }
            },
            Err(e) => {
                warn!("insert batch handler failed fatally: {e:#}");
                let shared = Arc::new(e);
                for reply in replies {
                    let _ = reply.send(Err(shared.clone()));
                }
            },
        }
    }
}

fn push<S: Series>(
    msg: QueueMessage<S>,
    ops: &mut Vec<InsertOp<S>>,
    replies: &mut Vec<oneshot::Sender<Result<(), Arc<anyhow::Error>>>>,
) {
    let QueueMessage::Insert(op, reply) = msg;
    ops.push(op);
    replies.push(reply);
}

pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(50);
