//! Cooperative cancellation for long-running scans (most notably Tick's
//! cursor walk over a shard's entries). A `CancelToken` is cheap to clone
//! and check; callers are expected to poll `is_canceled()` between batches
//! rather than at every single entry.

pub use tokio_util::sync::{
    CancellationToken as CancelToken,
    WaitForCancellationFuture,
};

pub trait IsCanceled {
    fn is_canceled(&self) -> bool;
}

impl IsCanceled for CancelToken {
    fn is_canceled(&self) -> bool {
        self.is_cancelled()
    }
}

/// A token that is never canceled, for call sites (tests, one-shot tools)
/// that don't wire up real cancellation.
#[derive(Clone, Copy, Debug, Default)]
pub struct NeverCanceled;

impl IsCanceled for NeverCanceled {
    fn is_canceled(&self) -> bool {
        false
    }
}
