//! In-memory record batching ahead of the durable queue.
use crate::error::Result;

use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::time::Instant;

/// Receives drained batches from a [`Batcher`].
///
/// `None` is delivered when a timed flush found the buffer empty; downstream
/// treats it as a liveness tick rather than data.
pub trait BatchSink<T>: Send + Sync {
    fn deliver(&self, batch: Option<Vec<T>>) -> BoxFuture<'_, Result<()>>;
}

/// A bounded FIFO accumulator that drains to its sink when full, on a
/// latency timer, and on close.
///
/// Deliveries are serialized: producers and the timer may race into a flush,
/// but the sink only ever sees one batch at a time. The timer task holds a
/// weak reference, so dropping the last `Batcher` handle stops it.
pub struct Batcher<T> {
    shared: Arc<Shared<T>>,
}

struct Shared<T> {
    buf: Mutex<Vec<T>>,
    max_batch: Option<usize>,
    latency: Duration,
    sink: Arc<dyn BatchSink<T>>,
    closed: AtomicBool,
    // Last-flush instant; holding the lock is what serializes deliveries.
    flushed: tokio::sync::Mutex<Instant>,
}

impl<T: Send + 'static> Batcher<T> {
    pub fn new(max_batch: Option<usize>, latency: Duration, sink: Arc<dyn BatchSink<T>>) -> Self {
        let shared = Arc::new(Shared {
            buf: Mutex::new(Vec::new()),
            max_batch,
            latency,
            sink,
            closed: AtomicBool::new(false),
            flushed: tokio::sync::Mutex::new(Instant::now()),
        });
        spawn_timer(Arc::downgrade(&shared));
        Self { shared }
    }

    /// Enqueue one record. A full buffer is flushed synchronously before the
    /// record is accepted; records are never dropped.
    pub async fn put(&self, item: T) -> Result<()> {
        let mut item = item;
        loop {
            item = {
                let mut buf = self.shared.buf.lock().unwrap();
                if self.shared.max_batch.is_none_or(|m| buf.len() < m) {
                    buf.push(item);
                    return Ok(());
                }
                item
            };
            self.shared.flush().await?;
        }
    }

    /// Drain whatever is buffered right now.
    pub async fn flush(&self) -> Result<()> {
        self.shared.flush().await
    }

    /// Final flush. The timer stops and the batcher must not be used
    /// afterwards.
    pub async fn close(&self) -> Result<()> {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.flush().await
    }
}

impl<T: Send> Shared<T> {
    async fn flush(&self) -> Result<()> {
        let mut flushed = self.flushed.lock().await;
        let drained = {
            let mut buf = self.buf.lock().unwrap();
            std::mem::take(&mut *buf)
        };
        *flushed = Instant::now();
        let batch = if drained.is_empty() {
            None
        } else {
            Some(drained)
        };
        self.sink.deliver(batch).await
    }
}

fn spawn_timer<T: Send + 'static>(weak: Weak<Shared<T>>) {
    tokio::spawn(async move {
        loop {
            let deadline = match weak.upgrade() {
                Some(shared) => *shared.flushed.lock().await + shared.latency,
                None => return,
            };
            tokio::time::sleep_until(deadline).await;
            let Some(shared) = weak.upgrade() else { return };
            if shared.closed.load(Ordering::Acquire) {
                return;
            }
            let due = *shared.flushed.lock().await + shared.latency <= Instant::now();
            if due
                && let Err(e) = shared.flush().await
            {
                tracing::error!(error = %e, "timed batch flush failed");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct CollectSink {
        batches: Mutex<Vec<Option<Vec<u32>>>>,
    }

    impl CollectSink {
        fn snapshot(&self) -> Vec<Option<Vec<u32>>> {
            self.batches.lock().unwrap().clone()
        }
    }

    impl BatchSink<u32> for CollectSink {
        fn deliver(&self, batch: Option<Vec<u32>>) -> BoxFuture<'_, Result<()>> {
            self.batches.lock().unwrap().push(batch);
            Box::pin(async { Ok(()) })
        }
    }

    #[tokio::test]
    async fn full_buffer_flushes_before_accepting() {
        let sink = Arc::new(CollectSink::default());
        let batcher = Batcher::new(Some(2), Duration::from_secs(60), sink.clone());
        for n in 0..5 {
            batcher.put(n).await.unwrap();
        }
        batcher.close().await.unwrap();
        assert_eq!(
            sink.snapshot(),
            vec![Some(vec![0, 1]), Some(vec![2, 3]), Some(vec![4])]
        );
    }

    #[tokio::test]
    async fn latency_timer_flushes_idle_buffer() {
        let sink = Arc::new(CollectSink::default());
        let batcher = Batcher::new(None, Duration::from_millis(50), sink.clone());
        batcher.put(7).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        let snapshot = sink.snapshot();
        assert_eq!(snapshot.first(), Some(&Some(vec![7])));
        // Later ticks on an empty buffer deliver the liveness signal.
        assert!(snapshot.iter().skip(1).all(|b| b.is_none()));
        drop(batcher);
    }

    #[tokio::test]
    async fn close_flushes_the_remainder() {
        let sink = Arc::new(CollectSink::default());
        let batcher = Batcher::new(Some(10), Duration::from_secs(60), sink.clone());
        batcher.put(1).await.unwrap();
        batcher.put(2).await.unwrap();
        batcher.close().await.unwrap();
        assert_eq!(sink.snapshot(), vec![Some(vec![1, 2])]);
    }

    #[tokio::test]
    async fn dropping_the_batcher_stops_the_timer() {
        let sink = Arc::new(CollectSink::default());
        let batcher = Batcher::new(None, Duration::from_millis(20), sink.clone());
        drop(batcher);
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(sink.snapshot().is_empty());
    }
}
