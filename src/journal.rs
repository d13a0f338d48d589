//! The journal itself: admission, batching, and lifecycle.
use crate::batch::{BatchSink, Batcher};
use crate::consumer::Consumer;
use crate::error::{Error, Result};
use crate::frame::{BytesEncoder, Compressor, Framing, RecordEncoder, encode_batch};
use crate::partition::{Clock, DirectoryFormat, SystemClock};
use crate::position::{Action, Position, advance};
use crate::queue::{FsQueue, QueueStats, TaskQueue};
use crate::store::{ObjectStore, PartLimits, SdkStore};

use bytes::Bytes;
use futures::future::BoxFuture;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Semaphore, TryAcquireError};
use tokio::task::JoinHandle;

/// State shared between producers, the flush stage, and the upload loop.
pub(crate) struct JournalShared {
    /// Admission permits; one per record between `put` and store ack.
    pub(crate) semaphore: Semaphore,
    pub(crate) capacity: usize,
    pub(crate) enqueued: AtomicU64,
    pub(crate) uploaded: AtomicU64,
    closed: AtomicBool,
}

impl JournalShared {
    fn new(capacity: usize) -> Self {
        Self {
            semaphore: Semaphore::new(capacity),
            capacity,
            enqueued: AtomicU64::new(0),
            uploaded: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn closing(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn set_closing(&self) -> bool {
        self.closed.swap(true, Ordering::AcqRel)
    }
}

/// Counters observable through [`Journal::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JournalStats {
    /// Records accepted by `put` since the journal opened, plus records
    /// re-admitted by recovery.
    pub enqueued: u64,
    /// Records whose bytes the store has acknowledged.
    pub uploaded: u64,
    pub queue: QueueStats,
}

impl JournalStats {
    pub(crate) fn merge(&mut self, other: &JournalStats) {
        self.enqueued += other.enqueued;
        self.uploaded += other.uploaded;
        self.queue.merge(&other.queue);
    }
}

/// Encodes drained batches and turns them into durable queue tasks.
///
/// This is the only mutator of the write position; the batcher serializes
/// deliveries, so the lock is never contended.
struct FlushStage<R> {
    encoder: Arc<dyn RecordEncoder<R>>,
    framing: Framing,
    compressor: Compressor,
    queue: Arc<dyn TaskQueue>,
    format: DirectoryFormat,
    clock: Arc<dyn Clock>,
    limits: PartLimits,
    position: tokio::sync::Mutex<Position>,
}

impl<R: Send + Sync + 'static> BatchSink<R> for FlushStage<R> {
    fn deliver(&self, batch: Option<Vec<R>>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let records = batch.unwrap_or_default();
            let count = records.len() as u64;
            let payload = encode_batch(
                &records,
                self.encoder.as_ref(),
                &self.framing,
                &self.compressor,
            )?;

            let dir = self.format.directory(self.clock.now_utc());
            let mut position = self.position.lock().await;
            let adv = advance(&position, &dir, payload.len() as u64, &self.limits);

            // An idle tick that moved nothing needs no task.
            if count == 0 && adv.before.is_empty() && adv.after.is_empty() && adv.position == *position
            {
                return Ok(());
            }

            for action in &adv.before {
                self.queue.put(action.encode()?).await?;
            }
            let append = Action::Append {
                pos: adv.position.clone(),
                count,
                payload: payload.to_vec(),
            };
            self.queue.put(append.encode()?).await?;
            for action in &adv.after {
                self.queue.put(action.encode()?).await?;
            }
            *position = adv.position;
            Ok(())
        })
    }
}

/// A reliable journal of records streamed to an object store.
///
/// Producers call [`put`](Journal::put) concurrently; records are batched,
/// framed, staged in a local durable queue, and uploaded by a single
/// background loop as multipart objects partitioned by time.
pub struct Journal<R = Bytes> {
    shared: Arc<JournalShared>,
    queue: Arc<dyn TaskQueue>,
    batcher: Batcher<R>,
    consumer: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl<R> std::fmt::Debug for Journal<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal").finish_non_exhaustive()
    }
}

impl<R: Send + Sync + 'static> Journal<R> {
    /// Submit one record.
    ///
    /// Returns `Ok(false)` when the journal is at capacity, i.e. the gap
    /// between accepted and uploaded records has reached `max_queue_size`;
    /// the record was not accepted and may be retried. Calling `put` after
    /// [`close`](Journal::close) is an error.
    pub async fn put(&self, record: R) -> Result<bool> {
        if self.shared.closing() {
            return Err(Error::closed());
        }
        match self.shared.semaphore.try_acquire() {
            Ok(permit) => permit.forget(),
            Err(TryAcquireError::NoPermits) => return Ok(false),
            Err(TryAcquireError::Closed) => return Err(Error::closed()),
        }
        if let Err(e) = self.batcher.put(record).await {
            self.shared.semaphore.add_permits(1);
            return Err(e);
        }
        self.shared.enqueued.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    /// Counters for this journal.
    pub async fn stats(&self) -> Result<JournalStats> {
        Ok(JournalStats {
            enqueued: self.shared.enqueued.load(Ordering::Relaxed),
            uploaded: self.shared.uploaded.load(Ordering::Relaxed),
            queue: self.queue.stats().await?,
        })
    }

    /// Flush everything and shut down.
    ///
    /// Subsequent `put` calls fail immediately; the upload loop drains the
    /// durable queue, closes every open object, and stops. Closing twice is
    /// an error.
    pub async fn close(&self) -> Result<()> {
        if self.shared.set_closing() {
            return Err(Error::closed());
        }
        self.batcher.close().await?;
        self.queue.put(Action::Flush.encode()?).await?;
        let handle = self.consumer.lock().unwrap().take();
        if let Some(handle) = handle {
            handle.await.map_err(Error::consumer)?;
        }
        Ok(())
    }
}

impl<R> Drop for Journal<R> {
    fn drop(&mut self) {
        // An abandoned journal must not leave a detached upload loop behind;
        // the durable queue carries its unfinished work to the next open.
        if let Some(handle) = self.consumer.lock().unwrap().take() {
            handle.abort();
        }
    }
}

/// Configures and builds a [`Journal`].
pub struct JournalBuilder<R = Bytes> {
    pub(crate) bucket: String,
    pub(crate) local_directory: PathBuf,
    pub(crate) credentials: Option<(String, String)>,
    pub(crate) directory_format: String,
    pub(crate) encoder: Arc<dyn RecordEncoder<R>>,
    pub(crate) compressor: Compressor,
    pub(crate) framing: Framing,
    pub(crate) fsync: bool,
    pub(crate) suffix: Option<String>,
    pub(crate) id: Option<String>,
    pub(crate) max_queue_size: usize,
    pub(crate) max_batch_size: Option<usize>,
    pub(crate) max_batch_latency: Duration,
    pub(crate) expiration: Option<Duration>,
    pub(crate) shards: Option<usize>,
    pub(crate) store: Option<Arc<dyn ObjectStore>>,
    pub(crate) clock: Arc<dyn Clock>,
}

impl JournalBuilder<Bytes> {
    /// Start configuring a journal writing to `bucket`, staging through the
    /// durable queue at `local_directory`. Records pass through unencoded.
    pub fn new<B: Into<String>, P: Into<PathBuf>>(bucket: B, local_directory: P) -> Self {
        Self {
            bucket: bucket.into(),
            local_directory: local_directory.into(),
            credentials: None,
            directory_format: DirectoryFormat::DEFAULT_PATTERN.to_string(),
            encoder: Arc::new(BytesEncoder),
            compressor: Compressor::Identity,
            framing: Framing::default(),
            fsync: true,
            suffix: None,
            id: None,
            max_queue_size: 65_536,
            max_batch_size: None,
            max_batch_latency: Duration::from_secs(60),
            expiration: None,
            shards: None,
            store: None,
            clock: Arc::new(SystemClock),
        }
    }
}

impl<R> Clone for JournalBuilder<R> {
    fn clone(&self) -> Self {
        Self {
            bucket: self.bucket.clone(),
            local_directory: self.local_directory.clone(),
            credentials: self.credentials.clone(),
            directory_format: self.directory_format.clone(),
            encoder: self.encoder.clone(),
            compressor: self.compressor.clone(),
            framing: self.framing.clone(),
            fsync: self.fsync,
            suffix: self.suffix.clone(),
            id: self.id.clone(),
            max_queue_size: self.max_queue_size,
            max_batch_size: self.max_batch_size,
            max_batch_latency: self.max_batch_latency,
            expiration: self.expiration,
            shards: self.shards,
            store: self.store.clone(),
            clock: self.clock.clone(),
        }
    }
}

impl<R> JournalBuilder<R> {
    /// Use a static access key pair instead of ambient credentials.
    pub fn credentials<T: Into<String>, U: Into<String>>(mut self, access_key: T, secret_key: U) -> Self {
        self.credentials = Some((access_key.into(), secret_key.into()));
        self
    }

    /// `strftime`-style UTC pattern for time partitions. A leading
    /// single-quoted segment (`'prefix'/%Y/%m/%d`) becomes a fixed key
    /// prefix.
    pub fn directory_format<T: Into<String>>(mut self, fmt: T) -> Self {
        self.directory_format = fmt.into();
        self
    }

    /// Encode records of a different type.
    pub fn encoder<S, E>(self, encoder: E) -> JournalBuilder<S>
    where
        E: RecordEncoder<S> + 'static,
    {
        JournalBuilder {
            bucket: self.bucket,
            local_directory: self.local_directory,
            credentials: self.credentials,
            directory_format: self.directory_format,
            encoder: Arc::new(encoder),
            compressor: self.compressor,
            framing: self.framing,
            fsync: self.fsync,
            suffix: self.suffix,
            id: self.id,
            max_queue_size: self.max_queue_size,
            max_batch_size: self.max_batch_size,
            max_batch_latency: self.max_batch_latency,
            expiration: self.expiration,
            shards: self.shards,
            store: self.store,
            clock: self.clock,
        }
    }

    /// Compress batch payloads. Also picks the object-key suffix unless one
    /// is set explicitly.
    pub fn compressor(mut self, compressor: Compressor) -> Self {
        self.compressor = compressor;
        self
    }

    /// Separator written after each record (default newline).
    pub fn delimiter<T: Into<Bytes>>(mut self, delimiter: T) -> Self {
        self.framing.delimiter = Some(delimiter.into());
        self
    }

    /// Write records back to back with no separator.
    pub fn no_delimiter(mut self) -> Self {
        self.framing.delimiter = None;
        self
    }

    /// Prefix each record with its big-endian 32-bit length.
    pub fn sized(mut self, sized: bool) -> Self {
        self.framing.sized = sized;
        self
    }

    /// Whether durable-queue writes fsync before acknowledging (default
    /// true).
    pub fn fsync(mut self, fsync: bool) -> Self {
        self.fsync = fsync;
        self
    }

    /// Explicit object-key suffix, overriding the compressor-derived one.
    pub fn suffix<T: Into<String>>(mut self, suffix: T) -> Self {
        self.suffix = Some(suffix.into());
        self
    }

    /// Identifier baked into object keys (default: local hostname).
    pub fn id<T: Into<String>>(mut self, id: T) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Cap on records accepted but not yet uploaded.
    pub fn max_queue_size(mut self, records: usize) -> Self {
        self.max_queue_size = records;
        self
    }

    /// Batcher capacity in records.
    pub fn max_batch_size(mut self, records: usize) -> Self {
        self.max_batch_size = Some(records);
        self
    }

    /// Batcher flush interval (default 60 s).
    pub fn max_batch_latency(mut self, latency: Duration) -> Self {
        self.max_batch_latency = latency;
        self
    }

    /// Reclaim stranded uploads older than this.
    pub fn expiration(mut self, expiration: Duration) -> Self {
        self.expiration = Some(expiration);
        self
    }

    /// Fan out over this many journals (at most 36).
    pub fn shards(mut self, shards: usize) -> Self {
        self.shards = Some(shards);
        self
    }

    /// Use this object store instead of building an SDK client.
    pub fn store<S: ObjectStore + 'static>(mut self, store: S) -> Self {
        self.store = Some(Arc::new(store));
        self
    }

    /// Read time from this clock instead of the system clock.
    pub fn clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }
}

impl<R: Send + Sync + 'static> JournalBuilder<R> {
    /// Build a single journal.
    ///
    /// Fails if `shards` was set; build with
    /// [`build_sharded`](Self::build_sharded) instead.
    pub async fn build(self) -> Result<Journal<R>> {
        if self.shards.is_some() {
            return Err(Error::config("shards is set; use build_sharded"));
        }
        self.build_single(None).await
    }

    pub(crate) async fn build_single(self, shard: Option<char>) -> Result<Journal<R>> {
        if self.bucket.is_empty() {
            return Err(Error::config("bucket is required"));
        }
        if self.max_queue_size == 0 {
            return Err(Error::config("max_queue_size must be positive"));
        }
        if self.max_batch_size == Some(0) {
            return Err(Error::config("max_batch_size must be positive"));
        }
        if self.max_batch_latency.is_zero() {
            return Err(Error::config("max_batch_latency must be positive"));
        }

        let format = DirectoryFormat::parse(&self.directory_format)?;
        let format = match shard {
            Some(id) => format.with_shard_prefix(id),
            None => format,
        };
        let local_directory = match shard {
            Some(id) => self.local_directory.join(id.to_string()),
            None => self.local_directory.clone(),
        };

        let queue: Arc<dyn TaskQueue> = Arc::new(FsQueue::open(local_directory, self.fsync).await?);
        let store: Arc<dyn ObjectStore> = match self.store {
            Some(store) => store,
            None => match &self.credentials {
                Some((access, secret)) => Arc::new(SdkStore::with_credentials(access, secret).await),
                None => Arc::new(SdkStore::defaults().await),
            },
        };
        let limits = store.limits();

        let id = self
            .id
            .unwrap_or_else(|| gethostname::gethostname().to_string_lossy().into_owned());
        let suffix = self
            .suffix
            .or_else(|| self.compressor.suffix().map(String::from));

        let shared = Arc::new(JournalShared::new(self.max_queue_size));
        let mut consumer = Consumer::new(
            queue.clone(),
            store,
            shared.clone(),
            self.bucket,
            id,
            suffix,
            format.clone(),
            self.clock.clone(),
            self.expiration,
        );
        let start_part = consumer.recover().await?;

        // The first object of a journal's life is the one transition the
        // position arithmetic cannot announce itself.
        let initial = Position::new(0, start_part, format.directory(self.clock.now_utc()));
        queue.put(Action::Start(initial.clone()).encode()?).await?;

        let sink = Arc::new(FlushStage {
            encoder: self.encoder,
            framing: self.framing,
            compressor: self.compressor,
            queue: queue.clone(),
            format,
            clock: self.clock,
            limits,
            position: tokio::sync::Mutex::new(initial),
        });
        let batcher = Batcher::new(self.max_batch_size, self.max_batch_latency, sink);
        let handle = tokio::spawn(consumer.run());

        Ok(Journal {
            shared,
            queue,
            batcher,
            consumer: std::sync::Mutex::new(Some(handle)),
        })
    }
}
