//! The shard runtime: coordinates lookups, writes, reads, tick, bootstrap,
//! flush, snapshot, cold flush, cleanup, and the metadata scan (§4.5-§4.12,
//! §6, §11). Generalized from `committer.rs`'s single-consumer drain loop
//! and `retention.rs`'s block-state machine.

use std::{
    collections::HashMap,
    sync::{
        atomic::{
            AtomicU64,
            Ordering,
        },
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use common::{
    sync::{
        new_split_rw_lock,
        Writer,
    },
    CancelToken,
    IsCanceled,
    Runtime,
};
use parking_lot::Mutex as PLMutex;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{
    info,
    warn,
};

use crate::{
    collaborators::{
        Block,
        BlockLeaseManager,
        BlockRetriever,
        CachePolicy,
        FilesetDeleter,
        FlushPreparer,
        InfoFileScanner,
        Merger,
        NamespaceContext,
        NamespaceReaderManager,
        ReverseIndex,
        Series,
        SeriesFactory,
        SnapshotPreparer,
        StreamingReader,
        TickOutcome,
        WriteKind,
    },
    entry::Entry,
    errors,
    flush_state::{
        FlushState,
        FlushStatus,
    },
    insert_queue::{
        self,
        InsertAction,
        InsertBatchHandler,
        InsertOp,
        PendingIndex,
    },
    metadata_pager::{
        self,
        MetadataPage,
        PageToken,
    },
    metrics,
    shard_map::{
        Cursor,
        ShardMap,
    },
    types::{
        BlockStart,
        SeriesId,
        Timestamp,
        UniqueIndex,
        Volume,
    },
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BootstrapState {
    NotBootstrapped,
    Bootstrapping,
    Bootstrapped,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ShardState {
    Open,
    Closing,
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertMode {
    Synchronous,
    Asynchronous,
}

pub struct ShardConfig {
    pub block_size: i64,
    pub cache_policy: CachePolicy,
    pub insert_mode: InsertMode,
    pub insert_queue_capacity: usize,
    pub insert_rate_limit_per_tick: usize,
    pub tick_batch_size: usize,
    pub tick_sleep_per_series: Duration,
    pub cursor_min_batch: usize,
    pub metadata_page_default_limit: usize,
    pub flush_state_retention_blocks: usize,
}

impl ShardConfig {
    /// Build a config from the environment-tunable knobs (`common::knobs`),
    /// requiring only the namespace-specific `block_size`.
    pub fn from_knobs(block_size: i64, cache_policy: CachePolicy, insert_mode: InsertMode) -> Self {
        Self {
            block_size,
            cache_policy,
            insert_mode,
            insert_queue_capacity: *common::knobs::SHARD_INSERT_QUEUE_CAPACITY,
            insert_rate_limit_per_tick: *common::knobs::SHARD_INSERT_RATE_LIMIT_PER_TICK,
            tick_batch_size: *common::knobs::SHARD_TICK_BATCH_SIZE,
            tick_sleep_per_series: Duration::from_micros(*common::knobs::SHARD_TICK_SLEEP_PER_SERIES_MICROS),
            cursor_min_batch: *common::knobs::SHARD_CURSOR_MIN_BATCH,
            metadata_page_default_limit: *common::knobs::SHARD_METADATA_PAGE_DEFAULT_LIMIT,
            flush_state_retention_blocks: *common::knobs::SHARD_FLUSH_STATE_RETENTION_BLOCKS,
        }
    }
}

/// The out-of-scope collaborators this spec treats as external (§1, §6).
pub struct Collaborators<S: Series> {
    pub series_factory: Arc<dyn SeriesFactory<S>>,
    pub reverse_index: Option<Arc<dyn ReverseIndex>>,
    pub block_retriever: Arc<dyn BlockRetriever>,
    pub namespace_reader_manager: Arc<dyn NamespaceReaderManager>,
    pub merger: Arc<dyn Merger>,
    pub lease_manager: Arc<dyn BlockLeaseManager>,
    pub info_file_scanner: Arc<dyn InfoFileScanner>,
    pub fileset_deleter: Arc<dyn FilesetDeleter>,
    pub flush_preparer: Arc<dyn FlushPreparer>,
    pub snapshot_preparer: Arc<dyn SnapshotPreparer>,
}

/// A longer-lived hold on a series (§11 `SeriesRefResolver`/`DocRef`). Drop
/// releases the refcount automatically.
pub struct SeriesRef<S: Series> {
    entry: Arc<Entry<S>>,
}

impl<S: Series> SeriesRef<S> {
    pub fn entry(&self) -> &Entry<S> {
        &self.entry
    }

    pub fn release_ref(self) {
        drop(self);
    }
}

impl<S: Series> Drop for SeriesRef<S> {
    fn drop(&mut self) {
        self.entry.release_ref();
    }
}

#[derive(Clone, Debug)]
pub struct WriteResult {
    pub id: SeriesId,
    pub unique_index: UniqueIndex,
    pub was_written: bool,
}

#[derive(Default)]
struct TickWaitGroup(Arc<(std::sync::atomic::AtomicI64, tokio::sync::Notify)>);

impl Clone for TickWaitGroup {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl TickWaitGroup {
    fn add(&self) {
        self.0 .0.fetch_add(1, Ordering::SeqCst);
    }

    fn done(&self) {
        if self.0 .0.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0 .1.notify_waiters();
        }
    }

    async fn wait_zero(&self) {
        loop {
            if self.0 .0.load(Ordering::SeqCst) <= 0 {
                return;
            }
            self.0 .1.notified().await;
        }
    }
}

struct ShardInner<S: Series> {
    map: ShardMap<S>,
    state: ShardState,
    bootstrap_state: BootstrapState,
    ticking: bool,
}

/// `ReverseIndex::write_batch`/entry bookkeeping, the per-series write/tick/
/// flush dispatch, and the paginated metadata scan all live on this shared
/// core so the insert queue's drain task can hold a `Weak` reference to it
/// without a reference cycle through `Shard` itself.
struct ShardCore<S: Series, RT: Runtime> {
    inner: Writer<ShardInner<S>>,
    flush_state: Writer<FlushState>,
    queue_client: PLMutex<Option<insert_queue::InsertQueueClient<S>>>,
    queue_join: AsyncMutex<Option<tokio::task::JoinHandle<()>>>,
    collaborators: Collaborators<S>,
    runtime: RT,
    config: ShardConfig,
    tick_gate: TickWaitGroup,
    next_unique_index: AtomicU64,
    index_enabled: bool,
    snapshot_indices: PLMutex<HashMap<BlockStart, u64>>,
    /// The namespace's retention horizon (§9 "Global state"), set via
    /// `Shard::set_retention_horizon`. Defaults to `i64::MIN` -- nothing is
    /// beyond retention until the namespace says otherwise.
    retention_horizon: std::sync::atomic::AtomicI64,
}

impl<S: Series, RT: Runtime> ShardCore<S, RT> {
    fn reserve_unique_index(&self) -> UniqueIndex {
        self.next_unique_index.fetch_add(1, Ordering::SeqCst)
    }

    fn queue(&self) -> insert_queue::InsertQueueClient<S> {
        self.queue_client
            .lock()
            .clone()
            .expect("insert queue client set before any shard method is reachable")
    }

    fn now(&self) -> Timestamp {
        self.runtime
            .system_time()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as Timestamp)
            .unwrap_or(0)
    }

    fn block_start_for(&self, ts: Timestamp) -> BlockStart {
        if let Some(ri) = &self.collaborators.reverse_index {
            return ri.block_start_for_write_time(ts, self.config.block_size);
        }
        ts - ts.rem_euclid(self.config.block_size)
    }

    /// The two-pass insert batch handler (§4.5).
    async fn run_batch(&self, mut batch: Vec<InsertOp<S>>) -> anyhow::Result<Vec<Result<(), anyhow::Error>>> {
        {
            let mut inner = self.inner.write();
            if inner.state != ShardState::Open {
                let err = errors::shard_closed();
                return Ok(batch.iter().map(|_| Err(anyhow::anyhow!("{err:#}"))).collect());
            }
            for op in batch.iter_mut() {
                if !op.release_entry_ref {
                    if let Some(existing) = inner.map.get(&op.id) {
                        op.entry = existing;
                    } else {
                        inner.map.insert(op.entry.clone());
                    }
                }
                let has_pending_action = !matches!(op.action, InsertAction::InstallOnly);
                if has_pending_action {
                    op.entry.acquire_ref();
                    op.release_entry_ref = true;
                }
            }
        }

        let mut results = Vec::with_capacity(batch.len());
        let mut index_batch = Vec::new();
        for op in batch {
            let release = op.release_entry_ref;
            let entry = op.entry.clone();
            let result = self.apply_pass_two(op, &mut index_batch).await;
            if release {
                entry.release_ref();
            }
            results.push(result);
        }
        if !index_batch.is_empty() {
            if let Some(ri) = &self.collaborators.reverse_index {
                if let Err(e) = ri.write_batch(index_batch).await {
                    warn!("reverse index write_batch failed: {e:#}");
                }
            }
        }
        Ok(results)
    }

    async fn apply_pass_two(
        &self,
        op: InsertOp<S>,
        index_batch: &mut Vec<crate::collaborators::IndexWriteOp>,
    ) -> anyhow::Result<()> {
        match op.action {
            InsertAction::InstallOnly => Ok(()),
            InsertAction::Write {
                ts,
                value,
                unit,
                annotation,
                index,
            } => {
                op.entry.series.write(ts, value, &unit, annotation).await?;
                if let Some(pending) = index {
                    self.enqueue_index(&op.entry, pending, index_batch);
                }
                Ok(())
            },
            InsertAction::Index(pending) => {
                self.enqueue_index(&op.entry, pending, index_batch);
                Ok(())
            },
            InsertAction::Hydrate(block) => op.entry.series.on_retrieve_block(block).await,
        }
    }

    fn enqueue_index(
        &self,
        entry: &Entry<S>,
        pending: PendingIndex,
        index_batch: &mut Vec<crate::collaborators::IndexWriteOp>,
    ) {
        entry.on_index_prepare(pending.block_start);
        index_batch.push(crate::collaborators::IndexWriteOp {
            id: entry.id.clone(),
            tags: pending.tags,
            block_start: pending.block_start,
            enqueued_at: pending.enqueued_at,
        });
    }
}

struct InsertHandler<S: Series, RT: Runtime> {
    core: std::sync::Weak<ShardCore<S, RT>>,
}

#[async_trait]
impl<S: Series, RT: Runtime> InsertBatchHandler<S> for InsertHandler<S, RT> {
    async fn handle_batch(&self, batch: Vec<InsertOp<S>>) -> anyhow::Result<Vec<Result<(), anyhow::Error>>> {
        match self.core.upgrade() {
            Some(core) => core.run_batch(batch).await,
            None => Ok(batch.iter().map(|_| Err(errors::shard_closed())).collect()),
        }
    }
}

/// A per-shard storage engine instance. Cheap to clone (an `Arc` around
/// the actual state).
pub struct Shard<S: Series, RT: Runtime = common::TokioRuntime> {
    core: Arc<ShardCore<S, RT>>,
}

impl<S: Series, RT: Runtime> Clone for Shard<S, RT> {
    fn clone(&self) -> Self {
        Self { core: self.core.clone() }
    }
}

impl<S: Series, RT: Runtime> Shard<S, RT> {
    pub fn start(collaborators: Collaborators<S>, runtime: RT, config: ShardConfig) -> Self {
        let index_enabled = collaborators.reverse_index.is_some();
        let (_reader, inner_writer) = new_split_rw_lock(ShardInner {
            map: ShardMap::new(),
            state: ShardState::Open,
            bootstrap_state: BootstrapState::NotBootstrapped,
            ticking: false,
        });
        let (_fs_reader, flush_state_writer) = new_split_rw_lock(FlushState::new());
        let capacity = config.insert_queue_capacity;
        let rate_limit = config.insert_rate_limit_per_tick;
        let core = Arc::new_cyclic(|weak: &std::sync::Weak<ShardCore<S, RT>>| {
            let handler = Arc::new(InsertHandler { core: weak.clone() });
            let (client, join) = insert_queue::start(handler, capacity, rate_limit);
            ShardCore {
                inner: inner_writer,
                flush_state: flush_state_writer,
                queue_client: PLMutex::new(Some(client)),
                queue_join: AsyncMutex::new(Some(join)),
                collaborators,
                runtime,
                config,
                tick_gate: TickWaitGroup::default(),
                next_unique_index: AtomicU64::new(0),
                index_enabled,
                snapshot_indices: PLMutex::new(HashMap::new()),
                retention_horizon: std::sync::atomic::AtomicI64::new(i64::MIN),
            }
        });
        Self { core }
    }

    pub fn num_series(&self) -> usize {
        self.core.inner.read().map.len()
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.core.inner.read().bootstrap_state == BootstrapState::Bootstrapped
    }

    pub fn bootstrap_state(&self) -> BootstrapState {
        self.core.inner.read().bootstrap_state
    }

    fn require_bootstrapped(&self, op: &str) -> anyhow::Result<()> {
        if self.core.inner.read().bootstrap_state != BootstrapState::Bootstrapped {
            return Err(errors::not_bootstrapped(op));
        }
        Ok(())
    }

    // ---- §4.6 Write path, §11 WriteTagged ----------------------------

    pub async fn write(
        &self,
        id: SeriesId,
        ts: Timestamp,
        value: f64,
        unit: Arc<str>,
        annotation: Option<Arc<[u8]>>,
        should_index: bool,
    ) -> anyhow::Result<WriteResult> {
        self.write_impl(id, ts, value, unit, annotation, should_index, None).await
    }

    pub async fn write_tagged(
        &self,
        id: SeriesId,
        tags: Vec<(Arc<str>, Arc<str>)>,
        ts: Timestamp,
        value: f64,
        unit: Arc<str>,
        annotation: Option<Arc<[u8]>>,
        should_index: bool,
    ) -> anyhow::Result<WriteResult> {
        self.write_impl(id, ts, value, unit, annotation, should_index, Some(tags))
            .await
    }

    async fn write_impl(
        &self,
        id: SeriesId,
        ts: Timestamp,
        value: f64,
        unit: Arc<str>,
        annotation: Option<Arc<[u8]>>,
        should_index: bool,
        tags: Option<Vec<(Arc<str>, Arc<str>)>>,
    ) -> anyhow::Result<WriteResult> {
        // Fast path: already in the map.
        let existing = self.core.inner.read().map.get(&id);
        if let Some(entry) = existing {
            entry.acquire_ref();
            let res = self
                .write_to_existing(&entry, ts, value, &unit, annotation, should_index, tags.as_deref())
                .await;
            entry.release_ref();
            return res.map(|was_written| WriteResult {
                id,
                unique_index: entry.unique_index,
                was_written,
            });
        }

        if should_index && self.core.config.insert_mode == InsertMode::Synchronous {
            // §4.6: indexing a series that doesn't exist yet requires async
            // inserts -- only the async path piggybacks an index write onto
            // the insert batch; synchronous mode installs the entry and
            // returns before any index write could run.
            return Err(errors::indexing_requires_async());
        }
        let block_start = self.core.block_start_for(ts);
        let unique_index = self.core.reserve_unique_index();
        let series = self.core.collaborators.series_factory.create(&id);
        let entry = Arc::new(Entry::new(id.clone(), unique_index, series, self.core.now()));

        match self.core.config.insert_mode {
            InsertMode::Synchronous => {
                let op = InsertOp {
                    id: id.clone(),
                    entry,
                    action: InsertAction::InstallOnly,
                    skip_rate_limit: false,
                    release_entry_ref: false,
                };
                let wg = self.core.queue().insert(op).await?;
                wg.wait().await?;
                let installed = self
                    .core
                    .inner
                    .read()
                    .map
                    .get(&id)
                    .expect("entry installed by the queue before its WaitGroup resolves");
                installed.acquire_ref();
                let was_written = self
                    .write_to_existing(&installed, ts, value, &unit, annotation, false, None)
                    .await;
                installed.release_ref();
                Ok(WriteResult {
                    id,
                    unique_index: installed.unique_index,
                    was_written: was_written?,
                })
            },
            InsertMode::Asynchronous => {
                if should_index && !self.core.index_enabled {
                    return Err(errors::indexing_requires_async());
                }
                let pending_index = should_index.then(|| PendingIndex {
                    block_start,
                    enqueued_at: self.core.now(),
                    tags: tags.unwrap_or_default(),
                });
                let op = InsertOp {
                    id: id.clone(),
                    entry,
                    action: InsertAction::Write {
                        ts,
                        value,
                        unit,
                        annotation,
                        index: pending_index,
                    },
                    skip_rate_limit: false,
                    release_entry_ref: false,
                };
                self.core.queue().insert(op).await?;
                // §4.6: wasWritten is reported true unconditionally on the
                // async path; the true value isn't known until the queue
                // drains and downstream commit-log logic treats any
                // non-false value as "written" anyway (§9 open question a).
                Ok(WriteResult {
                    id,
                    unique_index,
                    was_written: true,
                })
            },
        }
    }

    async fn write_to_existing(
        &self,
        entry: &Entry<S>,
        ts: Timestamp,
        value: f64,
        unit: &str,
        annotation: Option<Arc<[u8]>>,
        should_index: bool,
        tags: Option<&[(Arc<str>, Arc<str>)]>,
    ) -> anyhow::Result<bool> {
        entry.series.write(ts, value, unit, annotation).await?;
        if should_index {
            let block_start = self.core.block_start_for(ts);
            if entry.needs_index_update(block_start) {
                if !self.core.index_enabled {
                    return Err(errors::indexing_requires_async());
                }
                entry.on_index_prepare(block_start);
                if let Some(ri) = &self.core.collaborators.reverse_index {
                    let op = crate::collaborators::IndexWriteOp {
                        id: entry.id.clone(),
                        tags: tags.map(|t| t.to_vec()).unwrap_or_default(),
                        block_start,
                        enqueued_at: self.core.now(),
                    };
                    ri.write_batch(vec![op]).await?;
                }
            }
        }
        Ok(true)
    }

    // ---- §4.7 Read path, §11 FetchBlocksForColdFlush ------------------

    pub async fn read_encoded(&self, id: &[u8], start: Timestamp, end: Timestamp) -> Vec<(Timestamp, f64)> {
        let existing = self.core.inner.read().map.get(id);
        if let Some(entry) = existing {
            entry.acquire_ref();
            let result = entry.series.read_encoded(start, end);
            entry.release_ref();
            return result;
        }
        match self.core.config.cache_policy {
            CachePolicy::CacheAll => Vec::new(),
            CachePolicy::CacheNone => Vec::new(),
        }
    }

    pub async fn fetch_blocks(&self, id: &[u8], block_start: BlockStart, volume: Volume) -> anyhow::Result<Vec<u8>> {
        let existing = self.core.inner.read().map.get(id);
        if existing.is_some() {
            return Ok(Vec::new());
        }
        if self.core.config.cache_policy == CachePolicy::CacheAll {
            return Ok(Vec::new());
        }
        let stream = self
            .core
            .collaborators
            .block_retriever
            .stream(&Arc::from(id.to_vec().into_boxed_slice()), block_start, volume)
            .await?;
        Ok(stream.segments.into_iter().flat_map(|s| s.0.to_vec()).collect())
    }

    /// §11: bypasses the "cache all" short-circuit -- cold flush must
    /// always see in-memory dirty data.
    pub fn fetch_blocks_for_cold_flush(&self, id: &[u8], block_start: BlockStart) -> Option<bool> {
        self.core
            .inner
            .read()
            .map
            .get(id)
            .map(|entry| entry.series.cold_dirty(block_start))
    }

    pub fn series_ref_resolver(&self, id: &[u8]) -> Option<SeriesRef<S>> {
        let entry = self.core.inner.read().map.get(id)?;
        entry.acquire_ref();
        Some(SeriesRef { entry })
    }

    /// §11: alias for `series_ref_resolver`, kept for peer-repair callers.
    pub fn doc_ref(&self, id: &[u8]) -> Option<SeriesRef<S>> {
        self.series_ref_resolver(id)
    }

    // ---- §4.8 Tick -----------------------------------------------------

    pub async fn tick(&self, cancel: &CancelToken) -> anyhow::Result<TickReport> {
        self.tick_impl(cancel, false).await
    }

    async fn tick_impl(&self, cancel: &CancelToken, close_tick: bool) -> anyhow::Result<TickReport> {
        let timer = metrics::tick_timer();
        {
            let horizon = self.retention_horizon();
            self.core.flush_state.write().prune(
                horizon,
                self.core.config.block_size,
                self.core.config.flush_state_retention_blocks,
            );
        }

        // §4.4: the new-series token bucket refills once per Tick.
        self.core.queue().refill_rate_limit(self.core.config.insert_rate_limit_per_tick);

        {
            let mut inner = self.core.inner.write();
            if inner.ticking {
                anyhow::bail!("tick already in progress");
            }
            if inner.state != ShardState::Open && !close_tick {
                return Err(errors::shard_closed());
            }
            inner.ticking = true;
            self.core.tick_gate.add();
        }

        let block_states = self.core.flush_state.read().snapshot(self.core.index_enabled);
        let ns_ctx = NamespaceContext {
            retention_horizon: self.retention_horizon(),
            block_size: self.core.config.block_size,
        };

        let result = self.tick_scan(cancel, close_tick, &block_states, &ns_ctx).await;

        {
            let mut inner = self.core.inner.write();
            inner.ticking = false;
        }
        self.core.tick_gate.done();

        match &result {
            Ok(report) => {
                metrics::TICK_ACTIVE_SERIES_ENTRIES.set(report.active_series as f64);
                timer.finish_with(if report.canceled { "canceled" } else { "ok" });
            },
            Err(_) => {
                timer.finish_with("error");
            },
        }
        result
    }

    async fn tick_scan(
        &self,
        cancel: &CancelToken,
        close_tick: bool,
        block_states: &crate::collaborators::BlockStateSnapshot,
        ns_ctx: &NamespaceContext,
    ) -> anyhow::Result<TickReport> {
        let mut cursor: Cursor<S> = Cursor::new();
        let mut report = TickReport::default();
        let mut since_poll = 0usize;

        loop {
            let n = self.core.inner.read().map.len();
            let batch_size = Cursor::<S>::batch_size(n, self.core.config.cursor_min_batch);
            let batch = {
                let inner = self.core.inner.read();
                cursor.next_batch(&inner.map, batch_size)
            };
            if batch.is_empty() {
                break;
            }

            let mut expired = Vec::new();
            for entry in &batch {
                since_poll += 1;
                if since_poll >= self.core.config.tick_batch_size {
                    since_poll = 0;
                    if cancel.is_canceled() || (self.is_closing() && !close_tick) {
                        cursor.stop();
                        for e in &batch {
                            e.release_ref();
                        }
                        report.canceled = true;
                        return Ok(report);
                    }
                    if !self.core.config.tick_sleep_per_series.is_zero() {
                        self.core
                            .runtime
                            .wait(self.core.config.tick_sleep_per_series * self.core.config.tick_batch_size as u32)
                            .await;
                    }
                }
                let outcome = if close_tick {
                    Ok(TickOutcome::AllDataExpired)
                } else {
                    entry.series.tick(block_states, ns_ctx).await
                };
                match outcome {
                    Ok(TickOutcome::AllDataExpired) => expired.push(entry.clone()),
                    Ok(TickOutcome::Active) => report.active_series += 1,
                    Err(e) => {
                        warn!("series tick failed for {:?}: {e:#}", entry.id);
                        report.errors += 1;
                    },
                }
            }

            // Release the cursor's hold on every entry in this batch before
            // checking purgeability: `Entry::purgeable` requires refcount
            // == 1 (only the map's own hold left), which can never be true
            // while the scan is still holding its batch ref.
            for entry in &batch {
                entry.release_ref();
            }
            {
                let mut inner = self.core.inner.write();
                for entry in &expired {
                    let index_gcd = self.is_index_gcd(entry);
                    if entry.purgeable(self.core.index_enabled, index_gcd) {
                        inner.map.delete(&entry.id);
                        metrics::TICK_PURGED_TOTAL.inc();
                        report.purged += 1;
                    } else {
                        report.active_series += 1;
                    }
                }
            }
        }
        Ok(report)
    }

    fn is_index_gcd(&self, entry: &Entry<S>) -> bool {
        if !self.core.index_enabled {
            return true;
        }
        if entry.index_garbage_collected() {
            return true;
        }
        if let Some(ri) = &self.core.collaborators.reverse_index {
            for block_start in self.core.flush_state.read().block_starts() {
                if ri.is_garbage_collected(&entry.id, block_start) {
                    entry.mark_index_garbage_collected();
                    return true;
                }
            }
        }
        false
    }

    fn is_closing(&self) -> bool {
        self.core.inner.read().state != ShardState::Open
    }

    /// Set the namespace's current retention horizon (§1, §9 "Global
    /// state"): the earliest timestamp the namespace still promises to
    /// retain. Owned by the namespace, not derived here, since the shard
    /// has no view into sibling shards' data to compute it itself.
    pub fn set_retention_horizon(&self, horizon: Timestamp) {
        self.core.retention_horizon.store(horizon, Ordering::SeqCst);
    }

    fn retention_horizon(&self) -> Timestamp {
        self.core.retention_horizon.load(Ordering::SeqCst)
    }

    // ---- §4.9 Flush / Snapshot / Cold-Flush ----------------------------

    pub async fn warm_flush(&self, block_start: BlockStart) -> anyhow::Result<()> {
        self.require_bootstrapped("WarmFlush")?;
        let timer = metrics::warm_flush_timer();
        self.core.flush_state.write().set_warm_data_status(block_start, FlushStatus::InProgress);

        let ids = self.collect_ids_for_block(block_start);
        let mut failed = false;
        for id in ids {
            let entry = self.core.inner.read().map.get(&id);
            let Some(entry) = entry else { continue };
            entry.acquire_ref();
            let res = entry.series.warm_flush(block_start).await;
            let res = match res {
                Ok(Some(segment)) => {
                    self.core
                        .collaborators
                        .flush_preparer
                        .prepare_data(&id, block_start, segment)
                        .await
                },
                Ok(None) => Ok(()),
                Err(e) => Err(e),
            };
            entry.release_ref();
            if let Err(e) = res {
                warn!("warm flush failed for series in block {block_start}: {e:#}");
                failed = true;
                break;
            }
        }

        let mut flush_state = self.core.flush_state.write();
        if failed {
            flush_state.set_warm_data_status(block_start, FlushStatus::Failed);
            timer.finish_with("error");
            anyhow::bail!("warm flush failed for block_start={block_start}");
        }
        flush_state.set_warm_data_status(block_start, FlushStatus::Success);
        drop(flush_state);
        timer.finish();
        Ok(())
    }

    pub async fn snapshot(&self, block_start: BlockStart, _snapshot_time: Timestamp) -> anyhow::Result<u64> {
        self.require_bootstrapped("Snapshot")?;
        let timer = metrics::snapshot_timer();
        let snapshot_index = {
            let mut indices = self.core.snapshot_indices.lock();
            let next = indices.entry(block_start).or_insert(0);
            let assigned = *next;
            *next += 1;
            assigned
        };

        let ids = self.collect_ids_for_block(block_start);
        for id in ids {
            let Some(entry) = self.core.inner.read().map.get(&id) else {
                continue;
            };
            entry.acquire_ref();
            let res = entry.series.warm_flush(block_start).await;
            let res = match res {
                Ok(Some(segment)) => {
                    self.core
                        .collaborators
                        .snapshot_preparer
                        .prepare_data(&id, block_start, snapshot_index, segment)
                        .await
                },
                Ok(None) => Ok(()),
                Err(e) => Err(e),
            };
            entry.release_ref();
            if let Err(e) = res {
                timer.finish_with("error");
                return Err(e.context(format!("snapshot {snapshot_index} failed for block {block_start}")));
            }
        }
        timer.finish();
        Ok(snapshot_index)
    }

    /// §11: pure function over the `BlockState` snapshot -- a block-start
    /// needs a snapshot iff its warm data hasn't flushed successfully.
    pub fn filter_blocks_need_snapshot(&self, candidates: &[BlockStart]) -> Vec<BlockStart> {
        let flush_state = self.core.flush_state.read();
        candidates
            .iter()
            .copied()
            .filter(|&bs| flush_state.get(bs).warm_status.data_flushed != FlushStatus::Success)
            .collect()
    }

    pub async fn cold_flush(&self) -> anyhow::Result<Vec<BlockStart>> {
        self.require_bootstrapped("ColdFlush")?;
        if !self.core.flush_state.read().is_initialized() {
            return Err(errors::not_bootstrapped("ColdFlush"));
        }
        let timer = metrics::cold_flush_timer();

        // First pass: collect, per block-start, the dirty series on
        // already-warm-flushed blocks (§4.9: cold flush never operates on
        // never-warm-flushed blocks).
        let mut dirty_by_block: HashMap<BlockStart, Vec<SeriesId>> = HashMap::new();
        {
            let inner = self.core.inner.read();
            let flush_state = self.core.flush_state.read();
            let mut cursor: Cursor<S> = Cursor::new();
            loop {
                let n = inner.map.len();
                let batch_size = Cursor::<S>::batch_size(n, self.core.config.cursor_min_batch);
                let batch = cursor.next_batch(&inner.map, batch_size);
                if batch.is_empty() {
                    break;
                }
                for entry in &batch {
                    for block_start in flush_state.block_starts() {
                        let state = flush_state.get(block_start);
                        if state.warm_status.data_flushed == FlushStatus::Success && entry.series.cold_dirty(block_start)
                        {
                            dirty_by_block.entry(block_start).or_default().push(entry.id.clone());
                        }
                    }
                    entry.release_ref();
                }
            }
        }

        let mut written_volumes = Vec::new();
        for (block_start, dirty) in dirty_by_block {
            let from_volume = self.core.flush_state.read().get(block_start).cold_version_flushed;
            let to_volume = from_volume + 1;
            match self.core.collaborators.merger.merge(block_start, from_volume, to_volume, dirty).await {
                Ok(true) => {
                    if let Err(e) = self.finish_writing(block_start, to_volume, false).await {
                        metrics::INVARIANT_VIOLATIONS_TOTAL
                            .with_label_values(&["lease_update_failed"])
                            .inc();
                        ::errors::report_invariant_violation(&e);
                        continue;
                    }
                    metrics::COLD_FLUSH_LATEST_VOLUME_ENTRIES.set(to_volume as f64);
                    written_volumes.push(block_start);
                },
                Ok(false) => {
                    // Short-circuit: nothing dirty, no new volume written.
                },
                Err(e) => {
                    // Cold flush continues across block-starts on error
                    // (§7).
                    warn!("cold flush merge failed for block_start={block_start}: {e:#}");
                },
            }
        }
        timer.finish();
        Ok(written_volumes)
    }

    /// §4.9 `finishWriting`. The strict ordering here -- `coldVersionFlushed`
    /// advances, then the lease manager is notified, then
    /// `coldVersionRetrievable` advances -- is the central correctness
    /// property of the whole flush subsystem: readers must never observe a
    /// block-start whose in-memory copy has been evicted while disk
    /// readers still point at the old volume.
    async fn finish_writing(&self, block_start: BlockStart, next_version: Volume, mark_warm_success: bool) -> anyhow::Result<()> {
        {
            let mut flush_state = self.core.flush_state.write();
            if mark_warm_success {
                flush_state.mark_warm_success(block_start);
            }
            flush_state.advance_cold_flushed(block_start, next_version);
        }
        self.core
            .collaborators
            .lease_manager
            .update_open_leases(block_start, next_version)
            .await
            .map_err(|e| errors::lease_update_failed(block_start, next_version, e))?;
        self.core.flush_state.write().advance_cold_retrievable(block_start, next_version);
        Ok(())
    }

    fn collect_ids_for_block(&self, _block_start: BlockStart) -> Vec<SeriesId> {
        // Every currently-installed series is a flush candidate for any
        // block-start; `Series::warm_flush` itself reports `Ok(None)` for
        // block-starts it has no data for via an empty segment.
        let inner = self.core.inner.read();
        let mut cursor: Cursor<S> = Cursor::new();
        let mut ids = Vec::with_capacity(inner.map.len());
        loop {
            let n = inner.map.len();
            let batch_size = Cursor::<S>::batch_size(n, self.core.config.cursor_min_batch);
            let batch = cursor.next_batch(&inner.map, batch_size);
            if batch.is_empty() {
                break;
            }
            for entry in &batch {
                ids.push(entry.id.clone());
                entry.release_ref();
            }
        }
        ids
    }

    // ---- §4.10 Bootstrap, LoadBlocks ------------------------------------

    pub async fn prepare_bootstrap(&self) -> anyhow::Result<()> {
        let info_files = self.core.collaborators.info_file_scanner.scan().await?;
        let index_blocks = if self.core.index_enabled {
            self.core.collaborators.info_file_scanner.index_flushed_blocks().await?
        } else {
            Vec::new()
        };
        let mut flush_state = self.core.flush_state.write();
        for info in info_files {
            flush_state.record_info_file(info.block_start, info.volume_index);
        }
        if self.core.index_enabled {
            for (index_block_start, index_block_end) in index_blocks {
                let mut bs = index_block_start;
                while bs < index_block_end {
                    flush_state.mark_index_flushed(bs);
                    bs += self.core.config.block_size;
                }
            }
        }
        flush_state.mark_initialized();
        Ok(())
    }

    pub async fn bootstrap(&self) -> anyhow::Result<()> {
        {
            let mut inner = self.core.inner.write();
            if inner.bootstrap_state != BootstrapState::NotBootstrapped {
                return Err(errors::already_bootstrapped());
            }
            inner.bootstrap_state = BootstrapState::Bootstrapping;
        }
        let result = self.core.collaborators.block_retriever.cache_shard_indices().await;
        let mut inner = self.core.inner.write();
        match result {
            Ok(()) => {
                inner.bootstrap_state = BootstrapState::Bootstrapped;
                info!("shard bootstrap complete, {} series", inner.map.len());
                Ok(())
            },
            Err(e) => {
                inner.bootstrap_state = BootstrapState::NotBootstrapped;
                Err(e)
            },
        }
    }

    /// §4.10. `budget_bytes` bounds the estimated size of `blocks`; exceeding
    /// it fails the whole call with the load-limit sentinel before any
    /// series are touched.
    pub async fn load_blocks(&self, blocks: HashMap<SeriesId, Vec<Block>>, budget_bytes: u64) -> anyhow::Result<()> {
        self.load_blocks_tagged(blocks, budget_bytes, "bootstrap").await
    }

    /// §11 `Repair`: thin wrapper over `LoadBlocks` that requires the shard
    /// to already be bootstrapped and tags the write source for metrics.
    pub async fn repair(&self, blocks: HashMap<SeriesId, Vec<Block>>, budget_bytes: u64) -> anyhow::Result<()> {
        self.require_bootstrapped("Repair")?;
        self.load_blocks_tagged(blocks, budget_bytes, "repair").await
    }

    async fn load_blocks_tagged(
        &self,
        blocks: HashMap<SeriesId, Vec<Block>>,
        budget_bytes: u64,
        source: &'static str,
    ) -> anyhow::Result<()> {
        let estimated: u64 = blocks
            .values()
            .flat_map(|v| v.iter())
            .map(|b| b.segment.0.len() as u64)
            .sum();
        if estimated > budget_bytes {
            metrics::LOAD_LIMIT_HITS_TOTAL.with_label_values(&[source]).inc();
            return Err(errors::load_limit_hit(budget_bytes, estimated));
        }

        for (id, series_blocks) in blocks {
            let entry = {
                let existing = self.core.inner.read().map.get(&id);
                match existing {
                    Some(e) => e,
                    None => {
                        let unique_index = self.core.reserve_unique_index();
                        let series = self.core.collaborators.series_factory.create(&id);
                        let new_entry = Arc::new(Entry::new(id.clone(), unique_index, series, self.core.now()));
                        let mut inner = self.core.inner.write();
                        match inner.map.get(&id) {
                            Some(existing) => existing,
                            None => {
                                new_entry.acquire_ref();
                                inner.map.insert(new_entry.clone());
                                new_entry
                            },
                        }
                    },
                }
            };
            for block in series_blocks {
                let block_start = block.start;
                if let Err(e) = entry.series.load_block(block, WriteKind::ColdWrite).await {
                    warn!("load_block failed for {:?}: {e:#}", entry.id);
                    continue;
                }
                if self.core.index_enabled && entry.needs_index_update(block_start) {
                    entry.on_index_prepare(block_start);
                    if let Some(ri) = &self.core.collaborators.reverse_index {
                        let op = crate::collaborators::IndexWriteOp {
                            id: entry.id.clone(),
                            tags: Vec::new(),
                            block_start,
                            enqueued_at: self.core.now(),
                        };
                        let _ = ri.write_batch(vec![op]).await;
                    }
                }
            }
        }
        Ok(())
    }

    // ---- §11 AggregateTiles, Close, FlushState, LatestVolume, streaming -

    pub async fn aggregate_tiles(&self, id: &[u8], block_start: BlockStart) -> anyhow::Result<()> {
        let Some(entry) = self.core.inner.read().map.get(id) else {
            anyhow::bail!("no series found for aggregate_tiles at block_start={block_start}");
        };
        entry.acquire_ref();
        let res = entry.series.aggregate_tiles(block_start).await;
        entry.release_ref();
        res
    }

    pub async fn close(&self) -> anyhow::Result<()> {
        {
            let mut inner = self.core.inner.write();
            if inner.state != ShardState::Open {
                return Ok(());
            }
            inner.state = ShardState::Closing;
        }
        if let Some(client) = self.core.queue_client.lock().take() {
            drop(client);
        }
        if let Some(join) = self.core.queue_join.lock().await.take() {
            let _ = join.await;
        }
        self.core.tick_gate.wait_zero().await;
        let _ = self.tick_impl(&CancelToken::new(), true).await;
        self.core.inner.write().state = ShardState::Closed;
        Ok(())
    }

    pub fn flush_state(&self) -> crate::collaborators::BlockStateSnapshot {
        self.core.flush_state.read().snapshot(self.core.index_enabled)
    }

    pub fn latest_volume(&self, block_start: BlockStart) -> Option<Volume> {
        let state = self.core.flush_state.read().get(block_start);
        if state.cold_version_flushed == 0 && state.warm_status.data_flushed != FlushStatus::Success {
            return self.core.collaborators.namespace_reader_manager.latest_volume(block_start);
        }
        Some(state.cold_version_flushed)
    }

    pub async fn open_streaming_reader(&self, block_start: BlockStart) -> anyhow::Result<StreamingReader> {
        let volume = self.core.flush_state.read().get(block_start).cold_version_retrievable;
        self.core
            .collaborators
            .block_retriever
            .open_streaming_reader(block_start, volume)
            .await
    }

    // ---- §4.11 Metadata pager -------------------------------------------

    pub async fn fetch_blocks_metadata_v2(
        &self,
        start: Timestamp,
        end: Timestamp,
        limit: Option<usize>,
        token: Option<PageToken>,
    ) -> anyhow::Result<MetadataPage> {
        let limit = limit.unwrap_or(self.core.config.metadata_page_default_limit);
        let retention_horizon = self.retention_horizon();

        let active_cursor = match token {
            None => Some(0u64),
            Some(PageToken::Active { index_cursor }) => Some(index_cursor),
            Some(PageToken::Flushed { .. }) => None,
        };

        if let Some(cursor) = active_cursor {
            let (page, active_exhausted) = self.active_phase(start, end, limit, cursor);
            metrics::METADATA_PAGE_RESULTS_TOTAL
                .with_label_values(&["active"])
                .inc_by(page.results.len() as u64);
            if !active_exhausted {
                return Ok(page);
            }
            // Active phase exhausted: always fall through into the flushed
            // phase in the same call, even if this page also happened to
            // fill exactly to `limit` -- otherwise a page that coincidentally
            // fills right as the last live series is consumed would return
            // `next_token: None` and silently skip every flushed block
            // behind it.
            let flushed = metadata_pager::flushed_phase(
                self.core.collaborators.namespace_reader_manager.as_ref(),
                start,
                end,
                self.core.config.block_size,
                retention_horizon,
                limit.saturating_sub(page.results.len()),
                None,
            )
            .await?;
            let mut results = page.results;
            results.extend(flushed.results);
            metrics::METADATA_PAGE_RESULTS_TOTAL
                .with_label_values(&["flushed"])
                .inc_by(results.len() as u64);
            return Ok(MetadataPage {
                results,
                next_token: flushed.next_token,
            });
        }

        let Some(PageToken::Flushed {
            curr_block_start,
            curr_block_entry_idx,
            volume,
        }) = token
        else {
            unreachable!("active_cursor is None only when token is the Flushed variant")
        };
        let page = metadata_pager::flushed_phase(
            self.core.collaborators.namespace_reader_manager.as_ref(),
            start,
            end,
            self.core.config.block_size,
            retention_horizon,
            limit,
            Some((curr_block_start, curr_block_entry_idx, volume)),
        )
        .await?;
        metrics::METADATA_PAGE_RESULTS_TOTAL
            .with_label_values(&["flushed"])
            .inc_by(page.results.len() as u64);
        Ok(page)
    }

    /// Returns the page plus whether the active phase ran out of entries
    /// (as opposed to stopping because `limit` was reached) -- the caller
    /// needs that distinction kept separate from "page is full" to decide
    /// whether to continue into the flushed phase.
    fn active_phase(&self, start: Timestamp, end: Timestamp, limit: usize, cursor: UniqueIndex) -> (MetadataPage, bool) {
        let inner = self.core.inner.read();
        let mut results = Vec::new();
        let mut shard_cursor: Cursor<S> = Cursor::new();
        let mut next_cursor = cursor;
        loop {
            let n = inner.map.len();
            let batch_size = Cursor::<S>::batch_size(n, self.core.config.cursor_min_batch);
            let batch = shard_cursor.next_batch(&inner.map, batch_size);
            if batch.is_empty() {
                return (
                    MetadataPage {
                        results,
                        next_token: None,
                    },
                    true,
                );
            }
            // Once the page fills, still release every remaining entry's
            // ref (no accounting skipped), but stop advancing `next_cursor`
            // past an entry whose own results didn't fully fit -- resuming
            // there means we re-fetch that entry's metadata (possibly
            // re-emitting results already returned this page, which a
            // duplicate-tolerant caller can dedupe) instead of skipping
            // whatever it still had queued up.
            let mut hit_limit = false;
            for entry in &batch {
                if !hit_limit && entry.unique_index >= cursor {
                    let mut fully_consumed = true;
                    for meta in entry.series.fetch_blocks_metadata(start, end) {
                        if results.len() >= limit {
                            hit_limit = true;
                            fully_consumed = false;
                            break;
                        }
                        results.push(meta);
                    }
                    next_cursor = if fully_consumed { entry.unique_index + 1 } else { entry.unique_index };
                }
                entry.release_ref();
            }
            if hit_limit {
                return (
                    MetadataPage {
                        results,
                        next_token: Some(PageToken::Active { index_cursor: next_cursor }),
                    },
                    false,
                );
            }
        }
    }

    // ---- §4.12 Cleanup ---------------------------------------------------

    pub async fn cleanup_expired_filesets(&self, earliest: BlockStart) -> anyhow::Result<usize> {
        let entries = self.core.collaborators.fileset_deleter.enumerate().await?;
        let mut deleted = 0;
        for (block_start, volume) in entries {
            if block_start < earliest {
                self.core.collaborators.fileset_deleter.delete(block_start, volume).await?;
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    pub async fn cleanup_compacted_filesets(&self) -> anyhow::Result<usize> {
        // Cleanup never runs concurrently with flush (external mutual
        // exclusion assumed, §4.12); the snapshot taken here stays
        // authoritative for the whole call.
        let snapshot = self.flush_state();
        let entries = self.core.collaborators.fileset_deleter.enumerate().await?;
        let mut deleted = 0;
        for (block_start, volume) in entries {
            if let Some(state) = snapshot.blocks.get(&block_start) {
                if volume < state.cold_version {
                    self.core.collaborators.fileset_deleter.delete(block_start, volume).await?;
                    deleted += 1;
                }
            }
        }
        Ok(deleted)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TickReport {
    pub active_series: u64,
    pub purged: u64,
    pub errors: u64,
    pub canceled: bool,
}
