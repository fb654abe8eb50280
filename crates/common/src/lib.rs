//! Ambient infrastructure shared by the shard engine: the `Runtime`
//! abstraction, shutdown signaling, split reader/writer locks, backoff, and
//! the environment-tunable knobs.

pub mod backoff;
pub mod cancellation;
pub mod knobs;
pub mod runtime;
pub mod shutdown;
pub mod sync;

pub use crate::{
    backoff::Backoff,
    cancellation::{
        CancelToken,
        IsCanceled,
        NeverCanceled,
    },
    runtime::{
        block_in_place,
        shutdown_and_join,
        tokio_spawn,
        JoinError,
        Runtime,
        SpawnHandle,
        TestRuntime,
        TokioRuntime,
    },
    shutdown::{
        ShutdownMessage,
        ShutdownSignal,
    },
    sync::{
        new_split_rw_lock,
        Reader,
        Writer,
    },
};
