//! One counter/gauge/histogram per testable shard operation, following the
//! teacher's `database::metrics` module: every subsystem gets its own
//! static, registered once, reported from the call site that owns the
//! outcome.

use metrics::{
    register_convex_counter,
    register_convex_gauge,
    register_convex_histogram,
    StatusTimer,
};

register_convex_gauge!(pub INSERT_QUEUE_DEPTH_ENTRIES, "Pending ops in the insert queue");

register_convex_counter!(
    pub INSERT_THROTTLED_TOTAL,
    "Inserts rejected by the new-series rate limiter"
);

register_convex_histogram!(pub INSERT_BATCH_ENTRIES, "Size of each drained insert batch");

register_convex_histogram!(
    pub TICK_SECONDS,
    "Time spent in a single Tick pass",
    &["status"]
);

register_convex_gauge!(
    pub TICK_ACTIVE_SERIES_ENTRIES,
    "Series observed active by the last Tick"
);

register_convex_counter!(pub TICK_PURGED_TOTAL, "Entries purged by Tick");

register_convex_histogram!(
    pub WARM_FLUSH_SECONDS,
    "Time spent warm-flushing a block-start",
    &["status"]
);

register_convex_histogram!(
    pub SNAPSHOT_SECONDS,
    "Time spent snapshotting a block-start",
    &["status"]
);

register_convex_histogram!(
    pub COLD_FLUSH_SECONDS,
    "Time spent cold-flushing a block-start",
    &["status"]
);

register_convex_gauge!(
    pub COLD_FLUSH_LATEST_VOLUME_ENTRIES,
    "Most recent volume produced by cold flush"
);

register_convex_histogram!(
    pub METADATA_PAGE_SECONDS,
    "Time spent servicing a metadata page request",
    &["phase"]
);

register_convex_counter!(
    pub METADATA_PAGE_RESULTS_TOTAL,
    "Metadata entries returned per phase",
    &["phase"]
);

register_convex_counter!(
    pub INVARIANT_VIOLATIONS_TOTAL,
    "Invariant violations observed, by kind",
    &["kind"]
);

register_convex_counter!(
    pub LOAD_LIMIT_HITS_TOTAL,
    "LoadBlocks calls rejected for exceeding the memory budget",
    &["source"]
);

pub fn tick_timer() -> StatusTimer {
    StatusTimer::new(&TICK_SECONDS)
}

pub fn warm_flush_timer() -> StatusTimer {
    StatusTimer::new(&WARM_FLUSH_SECONDS)
}

pub fn snapshot_timer() -> StatusTimer {
    StatusTimer::new(&SNAPSHOT_SECONDS)
}

pub fn cold_flush_timer() -> StatusTimer {
    StatusTimer::new(&COLD_FLUSH_SECONDS)
}
