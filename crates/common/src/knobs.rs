//! Environment-tunable constants. Every knob has a sane production default;
//! tests and operators override them with `SHARD_*` environment variables.

use std::{
    sync::LazyLock,
    time::Duration,
};

use cmd_util::env::env_config;

/// Maximum number of pending inserts an `InsertQueue` will buffer before
/// applying backpressure to callers.
pub static SHARD_INSERT_QUEUE_CAPACITY: LazyLock<usize> =
    LazyLock::new(|| env_config("SHARD_INSERT_QUEUE_CAPACITY", 4096));

/// Maximum number of queued inserts drained into a single shard per tick.
pub static SHARD_INSERT_RATE_LIMIT_PER_TICK: LazyLock<usize> =
    LazyLock::new(|| env_config("SHARD_INSERT_RATE_LIMIT_PER_TICK", 128));

/// Number of entries scanned by the shard-map cursor in a single tick batch.
pub static SHARD_TICK_BATCH_SIZE: LazyLock<usize> =
    LazyLock::new(|| env_config("SHARD_TICK_BATCH_SIZE", 4096));

/// Optional artificial delay inserted between series during a tick scan,
/// used by tests that want to observe a tick mid-flight.
pub static SHARD_TICK_SLEEP_PER_SERIES_MICROS: LazyLock<u64> =
    LazyLock::new(|| env_config("SHARD_TICK_SLEEP_PER_SERIES_MICROS", 0));

/// Floor on how many entries the cursor advances per batch, even when the
/// shard is nearly empty, so a mostly-idle shard still makes scan progress.
pub static SHARD_CURSOR_MIN_BATCH: LazyLock<usize> =
    LazyLock::new(|| env_config("SHARD_CURSOR_MIN_BATCH", 16));

/// Default page size for the metadata pager when the caller doesn't specify
/// one.
pub static SHARD_METADATA_PAGE_DEFAULT_LIMIT: LazyLock<usize> =
    LazyLock::new(|| env_config("SHARD_METADATA_PAGE_DEFAULT_LIMIT", 4096));

/// Number of retired flush generations to keep `FlushState` history for,
/// bounding how far behind a lagging reader can be before its flushed-phase
/// page token is rejected as stale.
pub static SHARD_FLUSH_STATE_RETENTION_BLOCKS: LazyLock<usize> =
    LazyLock::new(|| env_config("SHARD_FLUSH_STATE_RETENTION_BLOCKS", 2));

pub static INITIAL_BACKOFF: Duration = Duration::from_millis(10);
pub static MAX_BACKOFF: Duration = Duration::from_secs(5);
