//! A broadcast channel used to signal fatal, unrecoverable errors across
//! the process: any subsystem that hits an error it cannot recover from
//! calls `.signal(err)`, and everything holding a receiver (most notably
//! the top-level server loop) wakes up and begins a graceful shutdown.

use std::sync::Arc;

use async_broadcast::{
    broadcast,
    Receiver,
    Sender,
};

#[derive(Clone, Debug)]
pub enum ShutdownMessage {
    Error(Arc<anyhow::Error>),
    AllowCompletion,
}

impl ShutdownMessage {
    pub fn error(e: anyhow::Error) -> Self {
        Self::Error(Arc::new(e))
    }
}

#[derive(Clone)]
pub struct ShutdownSignal {
    tx: Sender<ShutdownMessage>,
}

impl ShutdownSignal {
    pub fn new() -> (Self, Receiver<ShutdownMessage>) {
        let (mut tx, rx) = broadcast(1);
        tx.set_overflow(true);
        (Self { tx }, rx)
    }

    /// A signal that panics if it's ever actually used -- for call sites
    /// that structurally need a `ShutdownSignal` but are not wired into a
    /// real shutdown path (e.g. a one-off CLI invocation).
    pub fn panic() -> Self {
        let (tx, _rx) = broadcast(1);
        Self { tx }
    }

    #[cfg(test)]
    pub fn no_op() -> Self {
        let (mut tx, rx) = broadcast(1);
        tx.set_overflow(true);
        std::mem::forget(rx);
        Self { tx }
    }

    pub fn signal(&self, error: anyhow::Error) {
        let _ = self.tx.try_broadcast(ShutdownMessage::error(error));
    }

    pub fn signal_completion_allowed(&self) {
        let _ = self.tx.try_broadcast(ShutdownMessage::AllowCompletion);
    }
}
