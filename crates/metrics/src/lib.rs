//! Metrics registration and reporting helpers used across the shard engine.
//! Backed by the real `prometheus` crate rather than an internal fork, but
//! otherwise the same shape as the rest of the workspace: declare a static
//! with `register_convex_*!`, report through the `log_*` helpers, and time
//! operations with `Timer`/`StatusTimer`/`CancelableTimer`.

mod labels;
mod macros;
mod metrics;
mod reporting;
mod timer;

pub use crate::{
    labels::*,
    macros::*,
    metrics::*,
    reporting::{
        get_desc,
        log_counter,
        log_counter_with_labels,
        log_distribution,
        log_distribution_with_labels,
        log_gauge,
        log_gauge_with_labels,
    },
    timer::{
        CancelableTimer,
        StatusTimer,
        Timer,
    },
};
