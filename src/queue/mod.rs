//! The durable task queue between the batcher and the upload loop.
//!
//! The journal treats the queue as an opaque crash-safe FIFO: a task put
//! here survives a process crash and is re-delivered until completed. The
//! shipped implementation is [`FsQueue`]; the trait exists so the journal's
//! state machine never depends on the storage layout.
use crate::error::Result;

use bytes::Bytes;
use futures::future::BoxFuture;
use std::time::Duration;

mod fs;
pub use fs::FsQueue;

/// One pending unit of work handed out by [`TaskQueue::take`].
///
/// The task keeps its queue identity so it can be acknowledged
/// ([`complete`](TaskQueue::complete)) or re-delivered
/// ([`retry`](TaskQueue::retry)) later; staged tasks are held by the upload
/// loop for exactly this purpose.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueTask {
    pub(crate) id: String,
    pub payload: Bytes,
}

impl QueueTask {
    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Counters reported by a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Tasks on disk awaiting delivery.
    pub pending: u64,
    /// Tasks delivered but neither completed nor retried.
    pub in_flight: u64,
    /// Tasks accepted since the queue was opened.
    pub enqueued: u64,
    /// Tasks acknowledged since the queue was opened.
    pub completed: u64,
    /// Re-deliveries requested since the queue was opened.
    pub retried: u64,
}

impl QueueStats {
    pub(crate) fn merge(&mut self, other: &QueueStats) {
        self.pending += other.pending;
        self.in_flight += other.in_flight;
        self.enqueued += other.enqueued;
        self.completed += other.completed;
        self.retried += other.retried;
    }
}

/// A crash-safe FIFO of opaque task payloads.
pub trait TaskQueue: Send + Sync {
    /// Durably append a task.
    fn put(&self, payload: Bytes) -> BoxFuture<'_, Result<()>>;

    /// Pop the oldest available task, waiting for one to arrive.
    fn take(&self) -> BoxFuture<'_, Result<QueueTask>>;

    /// Like [`take`](Self::take), but gives up after `timeout` and returns
    /// `None` when the queue stayed empty.
    fn take_timeout(&self, timeout: Duration) -> BoxFuture<'_, Result<Option<QueueTask>>>;

    /// Acknowledge a task. Its bytes are gone from the queue for good.
    fn complete<'a>(&'a self, task: &'a QueueTask) -> BoxFuture<'a, Result<()>>;

    /// Return a task for re-delivery. A no-op for tasks that were never
    /// claimed, so a startup scan may retry everything it inspected.
    fn retry<'a>(&'a self, task: &'a QueueTask) -> BoxFuture<'a, Result<()>>;

    /// Non-destructive scan of every task awaiting delivery, oldest first.
    /// All scanned tasks remain available to [`take`](Self::take).
    fn pending(&self) -> BoxFuture<'_, Result<Vec<QueueTask>>>;

    fn stats(&self) -> BoxFuture<'_, Result<QueueStats>>;
}
