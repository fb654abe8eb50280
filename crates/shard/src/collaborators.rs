//! Contracts for everything the shard treats as an external collaborator:
//! the per-series encoder, the secondary inverted index, the block
//! retriever, the fileset reader/writer/merger, the namespace reader cache,
//! and the block lease manager. None of these are implemented here beyond
//! an in-memory fake (`crate::test_support`) -- production wiring lives
//! outside this crate's scope.

use std::sync::Arc;

use async_trait::async_trait;

use crate::types::{
    BlockStart,
    SeriesId,
    Timestamp,
    Volume,
};

/// An opaque, already-encoded run of samples. The shard never interprets
/// the bytes; it only moves them between collaborators.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Segment(pub Arc<[u8]>);

#[derive(Clone, Debug)]
pub struct Block {
    pub start: BlockStart,
    pub segment: Segment,
}

/// Whether a `LoadBlocks` call is installing data from a live bootstrap
/// feed or a warm-path retrieval hydrate. Both always land in the cold
/// buffer (§4.10): loads race with ordinary write traffic and only the
/// cold path is guaranteed to eventually reconcile with on-disk data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteKind {
    ColdWrite,
}

/// How the shard should treat a lookup miss on the read path (§4.7).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CachePolicy {
    /// Absence from the map is authoritative; never consult the retriever.
    CacheAll,
    /// Fall through to the block retriever on a miss.
    CacheNone,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickOutcome {
    Active,
    AllDataExpired,
}

/// Immutable view of `FlushState` handed to `Series::tick` and the read
/// path so they can reason about which block-starts are retrievable
/// in-memory without taking the `FlushState` lock themselves.
#[derive(Clone, Debug, Default)]
pub struct BlockStateSnapshot {
    pub bootstrapped: bool,
    pub blocks: std::collections::BTreeMap<BlockStart, BlockStateEntry>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct BlockStateEntry {
    pub warm_retrievable: bool,
    pub cold_version: Volume,
}

/// Namespace-level context threaded through tick and flush calls:
/// retention horizon and block size, the only namespace state a shard
/// needs without holding a registry (§9 "Global state").
#[derive(Clone, Copy, Debug)]
pub struct NamespaceContext {
    pub retention_horizon: Timestamp,
    pub block_size: i64,
}

#[derive(Clone, Debug)]
pub struct BlockMetadataEntry {
    pub id: SeriesId,
    pub size: u64,
    pub checksum: u32,
}

/// The per-series engine: out of scope for this spec, modeled as a
/// capability interface (§9 "Dynamic dispatch").
#[async_trait]
pub trait Series: Send + Sync + 'static {
    fn is_empty(&self) -> bool;

    async fn write(
        &self,
        ts: Timestamp,
        value: f64,
        unit: &str,
        annotation: Option<Arc<[u8]>>,
    ) -> anyhow::Result<()>;

    async fn on_retrieve_block(&self, block: Block) -> anyhow::Result<()>;

    async fn load_block(&self, block: Block, kind: WriteKind) -> anyhow::Result<()>;

    async fn tick(
        &self,
        block_states: &BlockStateSnapshot,
        ctx: &NamespaceContext,
    ) -> anyhow::Result<TickOutcome>;

    async fn warm_flush(&self, block_start: BlockStart) -> anyhow::Result<Option<Segment>>;

    /// True iff this series holds dirty cold-buffer data for `block_start`
    /// that has not yet been incorporated into `coldVersionFlushed`.
    fn cold_dirty(&self, block_start: BlockStart) -> bool;

    async fn aggregate_tiles(&self, block_start: BlockStart) -> anyhow::Result<()>;

    fn fetch_blocks_metadata(&self, start: Timestamp, end: Timestamp) -> Vec<BlockMetadataEntry>;

    fn read_encoded(&self, start: Timestamp, end: Timestamp) -> Vec<(Timestamp, f64)>;
}

#[derive(Clone, Debug)]
pub struct IndexWriteOp {
    pub id: SeriesId,
    pub tags: Vec<(Arc<str>, Arc<str>)>,
    pub block_start: BlockStart,
    pub enqueued_at: Timestamp,
}

#[async_trait]
pub trait ReverseIndex: Send + Sync + 'static {
    async fn write_batch(&self, ops: Vec<IndexWriteOp>) -> anyhow::Result<()>;

    fn block_start_for_write_time(&self, ts: Timestamp, block_size: i64) -> BlockStart;

    fn warm_flush_block_starts(&self) -> Vec<BlockStart>;

    /// Whether `id` has been evicted from the index for `block_start`,
    /// releasing the entry's `indexGarbageCollected` hold on purge.
    fn is_garbage_collected(&self, id: &SeriesId, block_start: BlockStart) -> bool;
}

pub struct BlockStream {
    pub segments: Vec<Segment>,
}

pub struct StreamingReader {
    pub block_start: BlockStart,
    pub volume: Volume,
}

#[async_trait]
pub trait BlockRetriever: Send + Sync + 'static {
    async fn stream(
        &self,
        id: &SeriesId,
        block_start: BlockStart,
        volume: Volume,
    ) -> anyhow::Result<BlockStream>;

    async fn cache_shard_indices(&self) -> anyhow::Result<()>;

    async fn open_streaming_reader(
        &self,
        block_start: BlockStart,
        volume: Volume,
    ) -> anyhow::Result<StreamingReader>;
}

#[async_trait]
pub trait FilesetReader: Send + Sync + 'static {
    /// Number of metadata entries already read from this reader, used to
    /// resume a flushed-phase page at the right offset.
    fn metadata_read(&self) -> u64;

    fn volume(&self) -> Volume;

    async fn read_metadata_entry(&mut self) -> anyhow::Result<Option<BlockMetadataEntry>>;
}

#[async_trait]
pub trait NamespaceReaderManager: Send + Sync + 'static {
    async fn get(
        &self,
        block_start: BlockStart,
        volume: Volume,
    ) -> anyhow::Result<Option<Arc<tokio::sync::Mutex<dyn FilesetReader>>>>;

    async fn put(&self, block_start: BlockStart, volume: Volume, reader: Arc<tokio::sync::Mutex<dyn FilesetReader>>);

    fn fileset_exists_at(&self, block_start: BlockStart, volume: Volume) -> bool;

    fn latest_volume(&self, block_start: BlockStart) -> Option<Volume>;
}

/// Persists a warm-flushed segment to durable storage (§4.9 step 1, §6
/// `FlushPreparer.PrepareData`). The shard itself never writes a byte to
/// disk; it only decides when a block-start's data is ready to hand off.
#[async_trait]
pub trait FlushPreparer: Send + Sync + 'static {
    async fn prepare_data(&self, id: &SeriesId, block_start: BlockStart, segment: Segment) -> anyhow::Result<()>;
}

/// Persists a snapshot segment (§6 `SnapshotPreparer.PrepareData`), keyed by
/// its own monotonic snapshot index rather than a volume -- snapshots are a
/// point-in-time export, not part of the cold-flush volume chain.
#[async_trait]
pub trait SnapshotPreparer: Send + Sync + 'static {
    async fn prepare_data(
        &self,
        id: &SeriesId,
        block_start: BlockStart,
        snapshot_index: u64,
        segment: Segment,
    ) -> anyhow::Result<()>;
}

#[async_trait]
pub trait Merger: Send + Sync + 'static {
    /// Merge `from_volume`'s on-disk data with the in-memory dirty series
    /// listed in `dirty`, writing the result as `to_volume`. A merger that
    /// finds nothing dirty and `from_volume == to_volume - 1` with no new
    /// data may short-circuit and report no new volume written.
    async fn merge(
        &self,
        block_start: BlockStart,
        from_volume: Volume,
        to_volume: Volume,
        dirty: Vec<SeriesId>,
    ) -> anyhow::Result<bool>;
}

#[async_trait]
pub trait BlockLeaseManager: Send + Sync + 'static {
    /// Blocks until every leaseholder of a volume older than `volume` for
    /// `block_start` has released or switched. Failure is an invariant
    /// violation (§4.9 step 3).
    async fn update_open_leases(&self, block_start: BlockStart, volume: Volume) -> anyhow::Result<()>;
}

/// Scanned from on-disk info files during `PrepareBootstrap` (§4.10).
#[derive(Clone, Copy, Debug)]
pub struct InfoFile {
    pub block_start: BlockStart,
    pub volume_index: Volume,
}

#[async_trait]
pub trait InfoFileScanner: Send + Sync + 'static {
    async fn scan(&self) -> anyhow::Result<Vec<InfoFile>>;

    /// Index-flushed index-block boundaries, each wider than a data block;
    /// used to mark every data block-start inside them as `indexFlushed`.
    async fn index_flushed_blocks(&self) -> anyhow::Result<Vec<(BlockStart, BlockStart)>>;
}

/// Constructs a fresh, empty `Series` for an id the shard has never seen
/// before. Out of scope for this spec in the sense that series internals
/// aren't specified, but the shard still needs a way to produce one on a
/// write/hydrate miss (§3 "created on first write").
pub trait SeriesFactory<S: Series>: Send + Sync + 'static {
    fn create(&self, id: &SeriesId) -> S;
}

#[async_trait]
pub trait FilesetDeleter: Send + Sync + 'static {
    async fn delete(&self, block_start: BlockStart, volume: Volume) -> anyhow::Result<()>;

    async fn enumerate(&self) -> anyhow::Result<Vec<(BlockStart, Volume)>>;
}
