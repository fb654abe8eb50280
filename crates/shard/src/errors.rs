//! Shard-specific error constructors layered on `errors::ErrorMetadata`
//! (§7's taxonomy).

use errors::ErrorMetadata;

pub fn shard_closed() -> anyhow::Error {
    anyhow::anyhow!("shard is closed").context(ErrorMetadata::invalid_params(
        "ShardClosed",
        "the shard is closed and no longer accepts operations",
    ))
}

pub fn malformed_page_token(detail: impl std::fmt::Display) -> anyhow::Error {
    anyhow::anyhow!("malformed page token: {detail}").context(ErrorMetadata::invalid_params(
        "MalformedPageToken",
        format!("page token could not be decoded: {detail}"),
    ))
}

pub fn insert_queue_full() -> anyhow::Error {
    anyhow::anyhow!("insert queue full").context(ErrorMetadata::transient(
        "InsertQueueFull",
        "the insert queue is at capacity; retry with backoff",
    ))
}

pub fn rate_limited() -> anyhow::Error {
    anyhow::anyhow!("new-series insert rate limited").context(ErrorMetadata::transient(
        "InsertRateLimited",
        "new-series insert rate limit exceeded for this tick interval",
    ))
}

pub fn queue_stopped() -> anyhow::Error {
    anyhow::anyhow!("insert queue stopped").context(ErrorMetadata::internal(
        "InsertQueueStopped",
        "the insert queue was stopped before this op drained",
    ))
}

pub fn indexing_requires_async() -> anyhow::Error {
    anyhow::anyhow!("indexing requires async inserts").context(ErrorMetadata::invalid_params(
        "IndexingRequiresAsyncInserts",
        "caller requested indexing for a missing series but async inserts are disabled",
    ))
}

pub fn not_bootstrapped(op: &str) -> anyhow::Error {
    anyhow::anyhow!("{op} requires bootstrap").context(ErrorMetadata::invalid_params(
        "ShardNotBootstrapped",
        format!("{op} called before the shard finished bootstrapping"),
    ))
}

pub fn already_bootstrapped() -> anyhow::Error {
    anyhow::anyhow!("duplicate bootstrap").context(ErrorMetadata::invalid_params(
        "ShardAlreadyBootstrapped",
        "Bootstrap called more than once",
    ))
}

pub fn load_limit_hit(budget_bytes: u64, estimated_bytes: u64) -> anyhow::Error {
    anyhow::anyhow!("load limit hit: estimated {estimated_bytes} bytes exceeds budget {budget_bytes}")
        .context(ErrorMetadata::load_limit_hit(
            "LoadLimitHit",
            format!("estimated load of {estimated_bytes} bytes exceeds the {budget_bytes} byte budget"),
        ))
}

pub fn lease_update_failed(block_start: i64, volume: u64, source: anyhow::Error) -> anyhow::Error {
    source
        .context(format!(
            "lease manager failed to update open leases for block_start={block_start} volume={volume}"
        ))
        .context(ErrorMetadata::invariant_violation(
            "LeaseUpdateFailed",
            "block lease manager failed to transfer open leases before advancing coldVersionRetrievable",
        ))
}
