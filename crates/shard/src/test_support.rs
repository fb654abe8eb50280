//! In-memory fakes for every collaborator trait (§9 "Dynamic dispatch").
//! `#[cfg(test)]`-only: these exist for this crate's own integration tests
//! in `tests.rs`, not as a reusable test-kit exported to other crates.

use std::{
    collections::{
        BTreeMap,
        HashMap,
        HashSet,
    },
    sync::{
        atomic::{
            AtomicU64,
            Ordering,
        },
        Arc,
    },
};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{
    collaborators::{
        Block,
        BlockLeaseManager,
        BlockMetadataEntry,
        BlockRetriever,
        BlockStateSnapshot,
        BlockStream,
        FilesetDeleter,
        FilesetReader,
        FlushPreparer,
        IndexWriteOp,
        InfoFile,
        InfoFileScanner,
        Merger,
        NamespaceContext,
        NamespaceReaderManager,
        ReverseIndex,
        Segment,
        Series,
        SeriesFactory,
        SnapshotPreparer,
        StreamingReader,
        TickOutcome,
        WriteKind,
    },
    types::{
        BlockStart,
        SeriesId,
        Timestamp,
        Volume,
    },
};

#[derive(Default)]
struct FakeSeriesState {
    samples: BTreeMap<Timestamp, (f64, String, Option<Arc<[u8]>>)>,
    cold_dirty: HashSet<BlockStart>,
    loaded: Vec<Block>,
    retrieved: Vec<Block>,
}

/// An in-memory series: keeps every sample it's ever been given and reports
/// itself empty once they're all gone, which is all `Entry::purgeable`
/// needs from a real encoder.
#[derive(Default)]
pub struct FakeSeries {
    state: Mutex<FakeSeriesState>,
}

impl FakeSeries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sample_count(&self) -> usize {
        self.state.lock().samples.len()
    }

    pub fn mark_cold_dirty(&self, block_start: BlockStart) {
        self.state.lock().cold_dirty.insert(block_start);
    }

    pub fn clear_cold_dirty(&self, block_start: BlockStart) {
        self.state.lock().cold_dirty.remove(&block_start);
    }

    pub fn loaded_blocks(&self) -> Vec<Block> {
        self.state.lock().loaded.clone()
    }

    pub fn retrieved_blocks(&self) -> Vec<Block> {
        self.state.lock().retrieved.clone()
    }

    /// Drop every sample older than `retention_horizon`, mirroring what a
    /// real encoder's tick would do before reporting itself empty.
    pub fn expire_before(&self, retention_horizon: Timestamp) {
        self.state.lock().samples.retain(|&ts, _| ts >= retention_horizon);
    }
}

#[async_trait]
impl Series for FakeSeries {
    fn is_empty(&self) -> bool {
        self.state.lock().samples.is_empty()
    }

    async fn write(
        &self,
        ts: Timestamp,
        value: f64,
        unit: &str,
        annotation: Option<Arc<[u8]>>,
    ) -> anyhow::Result<()> {
        self.state.lock().samples.insert(ts, (value, unit.to_string(), annotation));
        Ok(())
    }

    async fn on_retrieve_block(&self, block: Block) -> anyhow::Result<()> {
        self.state.lock().retrieved.push(block);
        Ok(())
    }

    async fn load_block(&self, block: Block, _kind: WriteKind) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        state.cold_dirty.insert(block.start);
        state.loaded.push(block);
        Ok(())
    }

    async fn tick(
        &self,
        _block_states: &BlockStateSnapshot,
        ctx: &NamespaceContext,
    ) -> anyhow::Result<TickOutcome> {
        self.expire_before(ctx.retention_horizon);
        if self.is_empty() {
            Ok(TickOutcome::AllDataExpired)
        } else {
            Ok(TickOutcome::Active)
        }
    }

    async fn warm_flush(&self, block_start: BlockStart) -> anyhow::Result<Option<Segment>> {
        let state = self.state.lock();
        let in_block: Vec<_> = state
            .samples
            .range(block_start..)
            .take_while(|(&ts, _)| ts < block_start + i64::MAX / 2)
            .collect();
        if in_block.is_empty() {
            return Ok(None);
        }
        let bytes: Vec<u8> = in_block.iter().flat_map(|(&ts, _)| ts.to_le_bytes()).collect();
        Ok(Some(Segment(Arc::from(bytes))))
    }

    fn cold_dirty(&self, block_start: BlockStart) -> bool {
        self.state.lock().cold_dirty.contains(&block_start)
    }

    async fn aggregate_tiles(&self, _block_start: BlockStart) -> anyhow::Result<()> {
        Ok(())
    }

    fn fetch_blocks_metadata(&self, start: Timestamp, end: Timestamp) -> Vec<BlockMetadataEntry> {
        let state = self.state.lock();
        if state.samples.range(start..end).next().is_some() {
            vec![BlockMetadataEntry {
                id: Arc::from(b"fake".as_slice()),
                size: state.samples.len() as u64,
                checksum: 0,
            }]
        } else {
            Vec::new()
        }
    }

    fn read_encoded(&self, start: Timestamp, end: Timestamp) -> Vec<(Timestamp, f64)> {
        self.state
            .lock()
            .samples
            .range(start..end)
            .map(|(&ts, (value, _, _))| (ts, *value))
            .collect()
    }
}

#[derive(Default)]
pub struct FakeSeriesFactory;

impl SeriesFactory<FakeSeries> for FakeSeriesFactory {
    fn create(&self, _id: &SeriesId) -> FakeSeries {
        FakeSeries::new()
    }
}

#[derive(Default)]
struct FakeReverseIndexState {
    writes: Vec<IndexWriteOp>,
    garbage_collected: HashSet<(SeriesId, BlockStart)>,
}

/// Records every write batch it's handed and lets a test mark individual
/// `(id, block_start)` pairs as garbage collected, which is all
/// `Entry::purgeable` needs from a real reverse index.
#[derive(Default)]
pub struct FakeReverseIndex {
    state: Mutex<FakeReverseIndexState>,
}

impl FakeReverseIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn writes(&self) -> Vec<IndexWriteOp> {
        self.state.lock().writes.clone()
    }

    pub fn mark_garbage_collected(&self, id: SeriesId, block_start: BlockStart) {
        self.state.lock().garbage_collected.insert((id, block_start));
    }
}

#[async_trait]
impl ReverseIndex for FakeReverseIndex {
    async fn write_batch(&self, ops: Vec<IndexWriteOp>) -> anyhow::Result<()> {
        self.state.lock().writes.extend(ops);
        Ok(())
    }

    fn block_start_for_write_time(&self, ts: Timestamp, block_size: i64) -> BlockStart {
        ts - ts.rem_euclid(block_size)
    }

    fn warm_flush_block_starts(&self) -> Vec<BlockStart> {
        self.state.lock().writes.iter().map(|op| op.block_start).collect()
    }

    fn is_garbage_collected(&self, id: &SeriesId, block_start: BlockStart) -> bool {
        self.state.lock().garbage_collected.contains(&(id.clone(), block_start))
    }
}

/// Hands back an empty stream for anything not explicitly seeded; good
/// enough for exercising the read-path's fallthrough without a real
/// retriever.
#[derive(Default)]
pub struct FakeBlockRetriever {
    seeded: Mutex<HashMap<(SeriesId, BlockStart, Volume), BlockStream>>,
}

impl FakeBlockRetriever {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, id: SeriesId, block_start: BlockStart, volume: Volume, segments: Vec<Segment>) {
        self.seeded.lock().insert((id, block_start, volume), BlockStream { segments });
    }
}

#[async_trait]
impl BlockRetriever for FakeBlockRetriever {
    async fn stream(&self, id: &SeriesId, block_start: BlockStart, volume: Volume) -> anyhow::Result<BlockStream> {
        Ok(self
            .seeded
            .lock()
            .get(&(id.clone(), block_start, volume))
            .map(|s| BlockStream { segments: s.segments.clone() })
            .unwrap_or(BlockStream { segments: Vec::new() }))
    }

    async fn cache_shard_indices(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn open_streaming_reader(&self, block_start: BlockStart, volume: Volume) -> anyhow::Result<StreamingReader> {
        Ok(StreamingReader { block_start, volume })
    }
}

/// A fileset reader that serves metadata entries from an in-memory list,
/// tracking how many it's handed out so `metadata_read` resumes correctly
/// across pager calls.
pub struct FakeFilesetReader {
    entries: Vec<BlockMetadataEntry>,
    read: u64,
    volume: Volume,
}

impl FakeFilesetReader {
    pub fn new(entries: Vec<BlockMetadataEntry>, volume: Volume) -> Self {
        Self {
            entries,
            read: 0,
            volume,
        }
    }
}

#[async_trait]
impl FilesetReader for FakeFilesetReader {
    fn metadata_read(&self) -> u64 {
        self.read
    }

    fn volume(&self) -> Volume {
        self.volume
    }

    async fn read_metadata_entry(&mut self) -> anyhow::Result<Option<BlockMetadataEntry>> {
        let idx = self.read as usize;
        if idx >= self.entries.len() {
            return Ok(None);
        }
        self.read += 1;
        Ok(Some(self.entries[idx].clone()))
    }
}

type ReaderHandle = Arc<tokio::sync::Mutex<dyn FilesetReader>>;

#[derive(Default)]
struct FakeNamespaceReaderManagerState {
    readers: HashMap<(BlockStart, Volume), ReaderHandle>,
    latest_volume: HashMap<BlockStart, Volume>,
}

#[derive(Default)]
pub struct FakeNamespaceReaderManager {
    state: Mutex<FakeNamespaceReaderManagerState>,
}

impl FakeNamespaceReaderManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, block_start: BlockStart, volume: Volume, reader: FakeFilesetReader) {
        let mut state = self.state.lock();
        state.readers.insert((block_start, volume), crate::metadata_pager::new_reader_handle(reader));
        let latest = state.latest_volume.entry(block_start).or_insert(volume);
        *latest = (*latest).max(volume);
    }
}

#[async_trait]
impl NamespaceReaderManager for FakeNamespaceReaderManager {
    async fn get(&self, block_start: BlockStart, volume: Volume) -> anyhow::Result<Option<ReaderHandle>> {
        Ok(self.state.lock().readers.get(&(block_start, volume)).cloned())
    }

    async fn put(&self, block_start: BlockStart, volume: Volume, reader: ReaderHandle) {
        self.state.lock().readers.insert((block_start, volume), reader);
    }

    fn fileset_exists_at(&self, block_start: BlockStart, volume: Volume) -> bool {
        self.state.lock().readers.contains_key(&(block_start, volume))
    }

    fn latest_volume(&self, block_start: BlockStart) -> Option<Volume> {
        self.state.lock().latest_volume.get(&block_start).copied()
    }
}

/// Always reports something merged, so cold-flush tests can assert the
/// lease manager and flush-state advance without needing a real merge
/// implementation.
#[derive(Default)]
pub struct FakeMerger {
    calls: Mutex<Vec<(BlockStart, Volume, Volume, Vec<SeriesId>)>>,
}

impl FakeMerger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<(BlockStart, Volume, Volume, Vec<SeriesId>)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl Merger for FakeMerger {
    async fn merge(
        &self,
        block_start: BlockStart,
        from_volume: Volume,
        to_volume: Volume,
        dirty: Vec<SeriesId>,
    ) -> anyhow::Result<bool> {
        let wrote = to_volume > from_volume || !dirty.is_empty();
        self.calls.lock().push((block_start, from_volume, to_volume, dirty));
        Ok(wrote)
    }
}

/// Records every segment handed to it, keyed by `(id, block_start)`, so
/// tests can assert warm flush actually persisted the bytes the series
/// produced rather than only flipping `FlushState` bits.
#[derive(Default)]
pub struct FakeFlushPreparer {
    prepared: Mutex<HashMap<(SeriesId, BlockStart), Segment>>,
}

impl FakeFlushPreparer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prepared(&self, id: &SeriesId, block_start: BlockStart) -> Option<Segment> {
        self.prepared.lock().get(&(id.clone(), block_start)).cloned()
    }
}

#[async_trait]
impl FlushPreparer for FakeFlushPreparer {
    async fn prepare_data(&self, id: &SeriesId, block_start: BlockStart, segment: Segment) -> anyhow::Result<()> {
        self.prepared.lock().insert((id.clone(), block_start), segment);
        Ok(())
    }
}

/// Records every segment handed to it, keyed by `(id, block_start,
/// snapshot_index)`.
#[derive(Default)]
pub struct FakeSnapshotPreparer {
    prepared: Mutex<HashMap<(SeriesId, BlockStart, u64), Segment>>,
}

impl FakeSnapshotPreparer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prepared(&self, id: &SeriesId, block_start: BlockStart, snapshot_index: u64) -> Option<Segment> {
        self.prepared.lock().get(&(id.clone(), block_start, snapshot_index)).cloned()
    }
}

#[async_trait]
impl SnapshotPreparer for FakeSnapshotPreparer {
    async fn prepare_data(
        &self,
        id: &SeriesId,
        block_start: BlockStart,
        snapshot_index: u64,
        segment: Segment,
    ) -> anyhow::Result<()> {
        self.prepared.lock().insert((id.clone(), block_start, snapshot_index), segment);
        Ok(())
    }
}

/// Counts calls so tests can assert `finishWriting`'s lease-manager call
/// happens exactly once per cold flush (§4.9 step 3).
#[derive(Default)]
pub struct FakeBlockLeaseManager {
    calls: AtomicU64,
    fail_next: Mutex<bool>,
}

impl FakeBlockLeaseManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn fail_next_call(&self) {
        *self.fail_next.lock() = true;
    }
}

#[async_trait]
impl BlockLeaseManager for FakeBlockLeaseManager {
    async fn update_open_leases(&self, _block_start: BlockStart, _volume: Volume) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut fail = self.fail_next.lock();
        if *fail {
            *fail = false;
            anyhow::bail!("fake lease manager failure");
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeInfoFileScanner {
    info_files: Mutex<Vec<InfoFile>>,
    index_flushed: Mutex<Vec<(BlockStart, BlockStart)>>,
}

impl FakeInfoFileScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_info_file(&self, block_start: BlockStart, volume_index: Volume) {
        self.info_files.lock().push(InfoFile { block_start, volume_index });
    }

    pub fn seed_index_flushed_range(&self, start: BlockStart, end: BlockStart) {
        self.index_flushed.lock().push((start, end));
    }
}

#[async_trait]
impl InfoFileScanner for FakeInfoFileScanner {
    async fn scan(&self) -> anyhow::Result<Vec<InfoFile>> {
        Ok(self.info_files.lock().clone())
    }

    async fn index_flushed_blocks(&self) -> anyhow::Result<Vec<(BlockStart, BlockStart)>> {
        Ok(self.index_flushed.lock().clone())
    }
}

#[derive(Default)]
pub struct FakeFilesetDeleter {
    filesets: Mutex<HashSet<(BlockStart, Volume)>>,
    deleted: Mutex<Vec<(BlockStart, Volume)>>,
}

impl FakeFilesetDeleter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, block_start: BlockStart, volume: Volume) {
        self.filesets.lock().insert((block_start, volume));
    }

    pub fn deleted(&self) -> Vec<(BlockStart, Volume)> {
        self.deleted.lock().clone()
    }
}

#[async_trait]
impl FilesetDeleter for FakeFilesetDeleter {
    async fn delete(&self, block_start: BlockStart, volume: Volume) -> anyhow::Result<()> {
        self.filesets.lock().remove(&(block_start, volume));
        self.deleted.lock().push((block_start, volume));
        Ok(())
    }

    async fn enumerate(&self) -> anyhow::Result<Vec<(BlockStart, Volume)>> {
        Ok(self.filesets.lock().iter().copied().collect())
    }
}
