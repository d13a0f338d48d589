//! The upload loop.
//!
//! One task owns the map of open multipart uploads and is the only caller of
//! mutating store operations. It pops tasks from the durable queue, walks
//! the per-object state machine, and acknowledges queue tasks only once the
//! bytes they carried are committed to the store.
use crate::error::{Error, Result};
use crate::journal::JournalShared;
use crate::partition::{Clock, DirectoryFormat};
use crate::position::{Action, ObjectKey, Position, object_key, parse_object_key};
use crate::queue::{QueueTask, TaskQueue};
use crate::store::{ObjectStore, ObjectUri, PartLimits, UploadDescriptor, UploadedPart};
use crate::sweep;

use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// How long a take waits once the close latch is set; an empty wait means
/// the queue has drained and the loop may stop.
const CLOSING_TAKE: Duration = Duration::from_secs(5);
/// Backoff between attempts of an operation the loop cannot skip.
const RETRY_PAUSE: Duration = Duration::from_secs(1);

/// Everything known about one open multipart upload.
struct ObjectState {
    descriptor: UploadDescriptor,
    parts: BTreeMap<u64, PartSlot>,
}

enum PartSlot {
    /// Staged chunks not yet sent. The queue tasks ride along: they are
    /// acknowledged together when the part commits.
    Pending { chunks: Vec<PendingChunk> },
    Uploaded(UploadedPart),
}

struct PendingChunk {
    task: QueueTask,
    count: u64,
    payload: Bytes,
}

pub(crate) struct Consumer {
    queue: Arc<dyn TaskQueue>,
    store: Arc<dyn ObjectStore>,
    shared: Arc<JournalShared>,
    limits: PartLimits,
    bucket: String,
    id: String,
    suffix: Option<String>,
    format: DirectoryFormat,
    clock: Arc<dyn Clock>,
    expiration: Option<Duration>,
    last_sweep: Option<Instant>,
    state: HashMap<ObjectKey, ObjectState>,
}

impl Consumer {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        queue: Arc<dyn TaskQueue>,
        store: Arc<dyn ObjectStore>,
        shared: Arc<JournalShared>,
        bucket: String,
        id: String,
        suffix: Option<String>,
        format: DirectoryFormat,
        clock: Arc<dyn Clock>,
        expiration: Option<Duration>,
    ) -> Self {
        let limits = store.limits();
        Self {
            queue,
            store,
            shared,
            limits,
            bucket,
            id,
            suffix,
            format,
            clock,
            expiration,
            last_sweep: None,
            state: HashMap::new(),
        }
    }

    /// Rebuild upload state after a restart.
    ///
    /// Open uploads under this journal's prefix are adopted and scheduled
    /// for completion; pending queue tasks are inspected (and left in place)
    /// to pre-acquire admission permits and find the highest part index any
    /// of them references. Returns the part index fresh writes must start
    /// at: the first part of the next untouched object, so new data never
    /// interleaves with recovered state.
    pub(crate) async fn recover(&mut self) -> Result<u64> {
        let prefix = self.format.prefix().map(|p| format!("{p}/"));
        let uploads = self
            .store
            .list_uploads(&self.bucket, prefix.as_deref())
            .await?;

        let mut highest: Option<u64> = None;
        for upload in uploads {
            let Some(parsed) = parse_object_key(&upload.key) else {
                continue;
            };
            if parsed.id != self.id {
                continue;
            }
            let first_part = parsed.file_number * self.limits.max_parts;
            let descriptor = UploadDescriptor::new(
                ObjectUri::new(self.bucket.clone(), upload.key.clone()),
                upload.id,
            );
            let committed = self.store.list_parts(&descriptor).await?;

            let mut parts = BTreeMap::new();
            let mut top = first_part;
            for part in committed {
                let index = first_part + part.part_number as u64 - 1;
                top = top.max(index);
                parts.insert(index, PartSlot::Uploaded(part));
            }
            highest = Some(highest.map_or(top, |h| h.max(top)));

            let key = ObjectKey {
                first_part,
                dir: parsed.dir.to_string(),
            };
            info!(upload = %descriptor, parts = parts.len(), "recovered open upload");
            self.state.insert(key.clone(), ObjectState { descriptor, parts });

            let end = Action::End(Position::new(0, first_part, key.dir));
            self.queue.put(end.encode()?).await?;
        }

        let mut recovered_records: u64 = 0;
        for task in &self.queue.pending().await? {
            match Action::decode(&task.payload) {
                Ok(Action::Append { pos, count, .. }) => {
                    recovered_records += count;
                    highest = Some(highest.map_or(pos.part, |h| h.max(pos.part)));
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(task = task.id(), error = %e, "pending task is corrupt; it will be skipped")
                }
            }
            self.queue.retry(task).await?;
        }

        if recovered_records > 0 {
            let permits = u32::try_from(recovered_records)
                .map_err(|_| Error::queue_too_small(recovered_records, self.shared.capacity))?;
            match self.shared.semaphore.try_acquire_many(permits) {
                Ok(acquired) => acquired.forget(),
                Err(_) => {
                    return Err(Error::queue_too_small(recovered_records, self.shared.capacity));
                }
            }
            self.shared.enqueued.fetch_add(recovered_records, Ordering::Relaxed);
            info!(records = recovered_records, "re-admitted recovered records");
        }

        Ok(highest.map_or(0, |h| (h / self.limits.max_parts + 1) * self.limits.max_parts))
    }

    pub(crate) async fn run(mut self) {
        loop {
            self.maybe_sweep().await;

            let task = if self.shared.closing() {
                match self.queue.take_timeout(CLOSING_TAKE).await {
                    Ok(Some(task)) => task,
                    Ok(None) => break,
                    Err(e) => {
                        error!(error = %e, "take from durable queue failed");
                        sleep(RETRY_PAUSE).await;
                        continue;
                    }
                }
            } else {
                match self.queue.take().await {
                    Ok(task) => task,
                    Err(e) => {
                        error!(error = %e, "take from durable queue failed");
                        sleep(RETRY_PAUSE).await;
                        continue;
                    }
                }
            };

            let action = match Action::decode(&task.payload) {
                Ok(action) => action,
                Err(e) => {
                    warn!(task = task.id(), error = %e, "skipping corrupt task");
                    Action::Skip
                }
            };

            // A task addressing an object we hold no upload for refers to
            // work that was already finished or abandoned; it is dropped.
            if let Some(key) = self.gate_key(&action)
                && !self.state.contains_key(&key)
            {
                match &action {
                    Action::Append { count, .. } => {
                        warn!(object = %key, records = count, "dropping staged records for an absent upload");
                        self.discard_records(*count);
                    }
                    _ => debug!(object = %key, "dropping task for an absent upload"),
                }
                if let Err(e) = self.queue.complete(&task).await {
                    error!(error = %e, "completing dropped task failed");
                }
                continue;
            }

            if let Err(e) = self.dispatch(task.clone(), action).await {
                info!(error = %e, task = task.id(), "task failed; re-queueing");
                if let Err(e) = self.queue.retry(&task).await {
                    error!(error = %e, "re-queueing task failed");
                }
                sleep(RETRY_PAUSE).await;
            }
        }
        debug!("upload loop drained and stopped");
    }

    /// Account records whose staged task is dropped without an upload. The
    /// bytes are gone, but the admission permits taken at `put` (or by
    /// recovery) must come back and the counter gap must still close.
    fn discard_records(&self, count: u64) {
        if count == 0 {
            return;
        }
        self.shared.uploaded.fetch_add(count, Ordering::Relaxed);
        self.shared.semaphore.add_permits(count as usize);
    }

    fn gate_key(&self, action: &Action) -> Option<ObjectKey> {
        match action {
            Action::Append { pos, .. } | Action::Upload(pos) | Action::End(pos) => {
                Some(ObjectKey::of(pos, &self.limits))
            }
            Action::Start(_) | Action::Flush | Action::Skip => None,
        }
    }

    async fn dispatch(&mut self, task: QueueTask, action: Action) -> Result<()> {
        match action {
            Action::Start(pos) => {
                let key = ObjectKey::of(&pos, &self.limits);
                if !self.state.contains_key(&key) {
                    let uri = ObjectUri::new(
                        self.bucket.clone(),
                        object_key(
                            &key.dir,
                            &self.id,
                            pos.file_number(&self.limits),
                            self.suffix.as_deref(),
                        ),
                    );
                    // Nothing can move until the object exists.
                    let descriptor = loop {
                        match self.store.create_upload(&uri).await {
                            Ok(descriptor) => break descriptor,
                            Err(e) => {
                                warn!(%uri, error = %e, "initiating upload failed; retrying");
                                sleep(RETRY_PAUSE).await;
                            }
                        }
                    };
                    info!(upload = %descriptor, "opened multipart upload");
                    self.state.insert(
                        key,
                        ObjectState {
                            descriptor,
                            parts: BTreeMap::new(),
                        },
                    );
                }
                self.queue.complete(&task).await
            }

            Action::Append { pos, count, payload } => {
                if count == 0 {
                    // Empty liveness tick from the batcher.
                    return self.queue.complete(&task).await;
                }
                let key = ObjectKey::of(&pos, &self.limits);
                let Some(object) = self.state.get_mut(&key) else {
                    self.discard_records(count);
                    return self.queue.complete(&task).await;
                };
                let slot = object
                    .parts
                    .entry(pos.part)
                    .or_insert_with(|| PartSlot::Pending { chunks: Vec::new() });
                match slot {
                    PartSlot::Pending { chunks } => {
                        chunks.push(PendingChunk {
                            task,
                            count,
                            payload: Bytes::from(payload),
                        });
                        Ok(())
                    }
                    PartSlot::Uploaded(_) => {
                        warn!(part = pos.part, records = count, "records arrived for a committed part; dropping");
                        self.discard_records(count);
                        self.queue.complete(&task).await
                    }
                }
            }

            Action::Upload(pos) => {
                let key = ObjectKey::of(&pos, &self.limits);
                self.flush_part(&key, pos.part, false).await?;
                self.queue.complete(&task).await
            }

            Action::End(pos) => {
                let key = ObjectKey::of(&pos, &self.limits);
                let Some(object) = self.state.get(&key) else {
                    return self.queue.complete(&task).await;
                };
                let pending: Vec<u64> = object
                    .parts
                    .iter()
                    .filter_map(|(index, slot)| {
                        matches!(slot, PartSlot::Pending { .. }).then_some(*index)
                    })
                    .collect();
                let known_parts = object.parts.len() as u64;

                match pending.as_slice() {
                    [] => {
                        self.finish_object(&key).await?;
                        self.queue.complete(&task).await
                    }
                    // One short part left in the final slot: send it with the
                    // last-part hint, skipping the minimum-size rule.
                    &[part] if part % self.limits.max_parts == known_parts - 1 => {
                        self.flush_part(&key, part, true).await?;
                        self.finish_object(&key).await?;
                        self.queue.complete(&task).await
                    }
                    waiting => {
                        debug!(object = %key, waiting = waiting.len(), "parts still uploading; re-queueing end");
                        self.queue.retry(&task).await?;
                        sleep(RETRY_PAUSE).await;
                        Ok(())
                    }
                }
            }

            Action::Flush => {
                let keys: Vec<ObjectKey> = self.state.keys().cloned().collect();
                for key in keys {
                    let end = Action::End(Position::new(0, key.first_part, key.dir));
                    self.queue.put(end.encode()?).await?;
                }
                self.queue.complete(&task).await
            }

            Action::Skip => self.queue.complete(&task).await,
        }
    }

    /// Send the staged chunks of one part. On success the chunks' queue
    /// tasks are acknowledged and their admission permits released; on
    /// failure everything stays staged for the caller to retry.
    async fn flush_part(&mut self, key: &ObjectKey, part: u64, last: bool) -> Result<()> {
        let (descriptor, body) = {
            let Some(object) = self.state.get(key) else {
                return Ok(());
            };
            let Some(PartSlot::Pending { chunks }) = object.parts.get(&part) else {
                // Already committed, or never staged: a duplicate flush.
                return Ok(());
            };
            let mut body = Vec::with_capacity(chunks.iter().map(|c| c.payload.len()).sum());
            for chunk in chunks {
                body.extend_from_slice(&chunk.payload);
            }
            (object.descriptor.clone(), Bytes::from(body))
        };

        let part_number = (part % self.limits.max_parts) as i32 + 1;
        let uploaded = self
            .store
            .upload_part(&descriptor, part_number, body, last)
            .await?;
        debug!(upload = %descriptor, part_number, "part committed");

        let Some(object) = self.state.get_mut(key) else {
            return Ok(());
        };
        let Some(slot) = object.parts.get_mut(&part) else {
            return Ok(());
        };
        let previous = std::mem::replace(slot, PartSlot::Uploaded(uploaded));
        let PartSlot::Pending { chunks } = previous else {
            return Ok(());
        };

        let mut records = 0u64;
        for chunk in &chunks {
            records += chunk.count;
            if let Err(e) = self.queue.complete(&chunk.task).await {
                // The bytes are committed; the stale task will be dropped by
                // the gate when it is re-delivered.
                error!(error = %e, task = chunk.task.id(), "acknowledging staged task failed");
            }
        }
        self.shared.uploaded.fetch_add(records, Ordering::Relaxed);
        self.shared.semaphore.add_permits(records as usize);
        Ok(())
    }

    /// Complete the object from its committed parts, or abort it when
    /// nothing was ever uploaded.
    async fn finish_object(&mut self, key: &ObjectKey) -> Result<()> {
        let Some(object) = self.state.get(key) else {
            return Ok(());
        };
        let parts: Vec<UploadedPart> = object
            .parts
            .values()
            .filter_map(|slot| match slot {
                PartSlot::Uploaded(part) => Some(part.clone()),
                PartSlot::Pending { .. } => None,
            })
            .collect();

        let outcome = if parts.is_empty() {
            self.store.abort_upload(&object.descriptor).await
        } else {
            self.store
                .complete_upload(&object.descriptor, &parts)
                .await
                .map(drop)
        };
        match outcome {
            Ok(()) => info!(upload = %object.descriptor, parts = parts.len(), "object closed"),
            Err(e) if e.is_not_found() => {
                warn!(upload = %object.descriptor, "upload vanished before it could be closed")
            }
            Err(e) => return Err(e),
        }
        self.state.remove(key);
        Ok(())
    }

    async fn maybe_sweep(&mut self) {
        let Some(expiration) = self.expiration else {
            return;
        };
        if self
            .last_sweep
            .is_some_and(|at| at.elapsed() < sweep::SWEEP_INTERVAL)
        {
            return;
        }
        sweep::sweep_expired(
            self.store.as_ref(),
            &self.bucket,
            &self.format,
            self.clock.as_ref(),
            expiration,
        )
        .await;
        self.last_sweep = Some(Instant::now());
    }
}
