//! Refcounted wrapper around a series (§3, §4.1).

use std::{
    collections::HashSet,
    sync::atomic::{
        AtomicBool,
        AtomicI64,
        Ordering,
    },
};

use errors::{
    report_invariant_violation,
    ErrorMetadata,
};
use parking_lot::Mutex;

use crate::{
    collaborators::Series,
    types::{
        BlockStart,
        SeriesId,
        Timestamp,
        UniqueIndex,
    },
};

/// One per live series on a shard. Lives while either held by the shard
/// map/list or referenced by any reader/writer; destroyed only by Tick.
///
/// `unique_index` is assigned once, at construction, from the shard's
/// monotonic counter (§8 invariant 5: unique across the shard's lifetime,
/// strictly increasing with insert order). A tentative entry built for an
/// id that turns out to already be present is discarded by the insert
/// batch handler (§4.5 Pass 1) without ever entering the map; its index is
/// simply never reused, which satisfies "strictly increasing" without
/// requiring indices to be contiguous.
pub struct Entry<S: Series> {
    pub id: SeriesId,
    pub unique_index: UniqueIndex,
    pub series: S,
    pub insert_time: Timestamp,
    reader_writer_count: AtomicI64,
    indexed_block_starts: Mutex<HashSet<BlockStart>>,
    index_garbage_collected: AtomicBool,
}

impl<S: Series> Entry<S> {
    pub fn new(id: SeriesId, unique_index: UniqueIndex, series: S, insert_time: Timestamp) -> Self {
        Self {
            id,
            unique_index,
            series,
            insert_time,
            // The map's own implicit hold counts as one.
            reader_writer_count: AtomicI64::new(1),
            indexed_block_starts: Mutex::new(HashSet::new()),
            index_garbage_collected: AtomicBool::new(false),
        }
    }

    pub fn acquire_ref(&self) {
        self.reader_writer_count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn release_ref(&self) {
        self.reader_writer_count.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn ref_count(&self) -> i64 {
        self.reader_writer_count.load(Ordering::SeqCst)
    }

    /// True iff this entry is a candidate for purge: the map's own
    /// reference is the only one outstanding, the series reports itself
    /// empty, and (if indexing is enabled) the index has GC'd it.
    ///
    /// A count below 1 is reported as an invariant violation and treated
    /// as "not purgeable" (§4.1, §7, §9 open question (b)).
    pub fn purgeable(&self, index_enabled: bool, index_gcd: bool) -> bool {
        let count = self.ref_count();
        if count < 1 {
            crate::metrics::INVARIANT_VIOLATIONS_TOTAL
                .with_label_values(&["entry_refcount_below_one"])
                .inc();
            report_invariant_violation(
                &anyhow::anyhow!("entry {:?} refcount {count} < 1 at purge check", self.id)
                    .context(ErrorMetadata::invariant_violation(
                        "entry_refcount_below_one",
                        format!("refcount {count} below 1 for entry during purge scan"),
                    )),
            );
            return false;
        }
        count == 1 && self.series.is_empty() && (!index_enabled || index_gcd)
    }

    pub fn mark_index_garbage_collected(&self) {
        self.index_garbage_collected.store(true, Ordering::SeqCst);
    }

    pub fn index_garbage_collected(&self) -> bool {
        self.index_garbage_collected.load(Ordering::SeqCst)
    }

    /// Whether this entry still needs an index insert enqueued for
    /// `block_start` -- consults the per-block-start index bitmap.
    pub fn needs_index_update(&self, block_start: BlockStart) -> bool {
        !self.indexed_block_starts.lock().contains(&block_start)
    }

    /// Atomically mark `block_start` as "in flight" towards the index, so
    /// concurrent writers don't double-enqueue it.
    pub fn on_index_prepare(&self, block_start: BlockStart) {
        self.indexed_block_starts.lock().insert(block_start);
    }
}

impl<S: Series> std::fmt::Debug for Entry<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entry")
            .field("id", &self.id)
            .field("unique_index", &self.unique_index)
            .field("ref_count", &self.ref_count())
            .finish()
    }
}
