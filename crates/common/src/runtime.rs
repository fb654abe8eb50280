//! Runtime trait for abstracting away OS-esque features (time, spawning,
//! randomness) so the shard engine can be parameterized by different
//! executors -- production `tokio`, or a test runtime that lets tests
//! control wall-clock waits deterministically.

use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    time::{
        Duration,
        SystemTime,
    },
};

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use rand::RngCore;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Error, Debug)]
pub enum JoinError {
    #[error("future canceled")]
    Canceled,
    #[error("future panicked: {0}")]
    Panicked(String),
}

impl From<tokio::task::JoinError> for JoinError {
    fn from(e: tokio::task::JoinError) -> Self {
        if e.is_cancelled() {
            JoinError::Canceled
        } else {
            JoinError::Panicked(e.to_string())
        }
    }
}

pub trait SpawnHandle: Send + Sync {
    fn shutdown(&mut self);
    fn join(&mut self) -> BoxFuture<'_, Result<(), JoinError>>;
}

/// Shut the associated future down, preempting it at its next yield point,
/// and join on its result.
pub async fn shutdown_and_join(mut handle: Box<dyn SpawnHandle>) -> anyhow::Result<()> {
    handle.shutdown();
    if let Err(e) = handle.join().await {
        if !matches!(e, JoinError::Canceled) {
            return Err(e.into());
        }
    }
    Ok(())
}

#[async_trait]
pub trait Runtime: Clone + Sync + Send + 'static {
    /// Sleep for the given duration.
    fn wait(&self, duration: Duration) -> BoxFuture<'static, ()>;

    /// Spawn a future on the runtime's executor.
    fn spawn(
        &self,
        name: &'static str,
        f: impl Future<Output = ()> + Send + 'static,
    ) -> Box<dyn SpawnHandle>;

    /// Return (a potentially virtualized) reading from the system clock.
    fn system_time(&self) -> SystemTime;

    /// Return (a potentially virtualized) reading from a monotonic clock.
    fn monotonic_now(&self) -> Instant;

    /// A source of randomness. Boxed so the trait stays object-safe-ish for
    /// call sites that don't want to be generic over `R: RngCore`.
    fn rng(&self) -> Box<dyn RngCore + Send>;
}

/// Spawn a plain `tokio` task and give it a name (surfaced in panics and
/// traces). Not parameterized by `Runtime` because it's only ever used from
/// inside a `Runtime` impl or from test harnesses that already know they're
/// on a `tokio` executor.
pub fn tokio_spawn<T>(
    _name: &'static str,
    f: impl Future<Output = T> + Send + 'static,
) -> tokio::task::JoinHandle<T>
where
    T: Send + 'static,
{
    tokio::task::spawn(f)
}

/// Run a blocking closure without starving the async executor. Delegates to
/// `tokio::task::block_in_place` when on a multi-threaded runtime, and just
/// calls the closure directly otherwise (e.g. under `#[tokio::test]`'s
/// single-threaded flavor, where `block_in_place` would panic).
pub fn block_in_place<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == tokio::runtime::RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        },
        _ => f(),
    }
}

#[derive(Clone)]
pub struct TokioRuntime;

impl TokioRuntime {
    pub fn new() -> Self {
        Self
    }
}

impl Default for TokioRuntime {
    fn default() -> Self {
        Self::new()
    }
}

struct TokioSpawnHandle(Option<tokio::task::JoinHandle<()>>);

impl SpawnHandle for TokioSpawnHandle {
    fn shutdown(&mut self) {
        if let Some(h) = self.0.take() {
            h.abort();
        }
    }

    fn join(&mut self) -> BoxFuture<'_, Result<(), JoinError>> {
        Box::pin(async move {
            match self.0.take() {
                None => Ok(()),
                Some(h) => h.await.map_err(JoinError::from),
            }
        })
    }
}

#[async_trait]
impl Runtime for TokioRuntime {
    fn wait(&self, duration: Duration) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(duration))
    }

    fn spawn(
        &self,
        name: &'static str,
        f: impl Future<Output = ()> + Send + 'static,
    ) -> Box<dyn SpawnHandle> {
        Box::new(TokioSpawnHandle(Some(tokio_spawn(name, f))))
    }

    fn system_time(&self) -> SystemTime {
        SystemTime::now()
    }

    fn monotonic_now(&self) -> Instant {
        Instant::now()
    }

    fn rng(&self) -> Box<dyn RngCore + Send> {
        Box::new(rand::rngs::StdRng::from_entropy())
    }
}

use rand::SeedableRng;

/// A deterministic test runtime: real `tokio` time and spawning (so
/// `#[tokio::test(start_paused = true)]` still works for advancing the
/// clock), but a seeded RNG so flaky-by-randomness tests become
/// reproducible.
#[derive(Clone)]
pub struct TestRuntime {
    seed: Arc<Mutex<u64>>,
}

impl TestRuntime {
    pub fn new(seed: u64) -> Self {
        Self {
            seed: Arc::new(Mutex::new(seed)),
        }
    }
}

impl Default for TestRuntime {
    fn default() -> Self {
        Self::new(0)
    }
}

#[async_trait]
impl Runtime for TestRuntime {
    fn wait(&self, duration: Duration) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(duration))
    }

    fn spawn(
        &self,
        name: &'static str,
        f: impl Future<Output = ()> + Send + 'static,
    ) -> Box<dyn SpawnHandle> {
        Box::new(TokioSpawnHandle(Some(tokio_spawn(name, f))))
    }

    fn system_time(&self) -> SystemTime {
        SystemTime::now()
    }

    fn monotonic_now(&self) -> Instant {
        Instant::now()
    }

    fn rng(&self) -> Box<dyn RngCore + Send> {
        let mut seed = self.seed.lock();
        *seed = seed.wrapping_add(1);
        Box::new(rand::rngs::StdRng::seed_from_u64(*seed))
    }
}

pub type PinBoxFut<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
