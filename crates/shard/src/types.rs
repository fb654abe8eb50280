//! Small shared value types used across the shard engine.

use std::sync::Arc;

/// A series identifier. Shared via `Arc` so the shard map, the list, and
/// every `Entry` referencing it can hold the same allocation without
/// copying -- the byte identity lives as long as any holder needs it.
pub type SeriesId = Arc<[u8]>;

/// A block-start timestamp (nanoseconds since epoch, aligned to the
/// namespace's block size). Block-starts are the unit flush/snapshot/
/// cold-flush and the metadata pager operate over.
pub type BlockStart = i64;

/// A sample timestamp, nanoseconds since epoch.
pub type Timestamp = i64;

/// A monotonically increasing fileset volume index for a (shard,
/// block-start) pair. Volume 0 is the warm flush; volumes >= 1 are cold
/// flushes.
pub type Volume = u64;

/// A monotonically assigned, per-shard-lifetime-unique integer identifying
/// a series, stable across process restarts only insofar as bootstrap
/// reassigns it consistently (this spec does not require persisting it).
pub type UniqueIndex = u64;
