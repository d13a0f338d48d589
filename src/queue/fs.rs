use super::{QueueStats, QueueTask, TaskQueue};
use crate::error::{Error, Result};

use bytes::Bytes;
use futures::future::BoxFuture;
use std::collections::{BTreeSet, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::AsyncWriteExt as _;
use tokio::sync::Notify;
use uuid::timestamp::context::ContextV7;
use uuid::{Timestamp, Uuid};

const TASK_EXT: &str = "task";
const TMP_EXT: &str = "tmp";

/// File-backed [`TaskQueue`].
///
/// Each task is one file named by a monotonic UUIDv7, so lexicographic file
/// order is arrival order. A put writes to a `.tmp` sibling and renames it
/// into place (optionally fsyncing first); completion deletes the file.
/// Claims live only in memory: after a crash every unacknowledged task file
/// is still on disk and is re-delivered on the next open.
///
/// The directory must be owned by exactly one `FsQueue` at a time.
pub struct FsQueue {
    dir: PathBuf,
    fsync: bool,
    ctx: Mutex<ContextV7>,
    notify: Notify,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    available: BTreeSet<String>,
    in_flight: HashSet<String>,
    enqueued: u64,
    completed: u64,
    retried: u64,
}

impl FsQueue {
    /// Open (creating if necessary) the queue directory and index the task
    /// files a previous process left behind.
    pub async fn open<P: Into<PathBuf>>(dir: P, fsync: bool) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::queue(&dir, e))?;

        let mut available = BTreeSet::new();
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| Error::queue(&dir, e))?;
        while let Some(entry) = entries.next_entry().await.map_err(|e| Error::queue(&dir, e))? {
            let path = entry.path();
            match path.extension().and_then(|e| e.to_str()) {
                Some(TASK_EXT) => {
                    if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                        available.insert(stem.to_string());
                    }
                }
                // A .tmp file is a put that never got acknowledged; drop it.
                Some(TMP_EXT) => {
                    let _ = tokio::fs::remove_file(&path).await;
                }
                _ => {}
            }
        }

        Ok(Self {
            dir,
            fsync,
            ctx: Mutex::new(ContextV7::new()),
            notify: Notify::new(),
            state: Mutex::new(State {
                available,
                ..State::default()
            }),
        })
    }

    /// The directory this queue owns.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn task_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.{TASK_EXT}"))
    }

    async fn write_task(&self, id: &str, payload: &[u8]) -> io::Result<()> {
        let tmp = self.dir.join(format!("{id}.{TMP_EXT}"));
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(payload).await?;
        if self.fsync {
            file.sync_all().await?;
        }
        drop(file);
        tokio::fs::rename(&tmp, self.task_path(id)).await
    }

    // Reads before claiming so that a caller cancelled mid-take (a timed
    // take hitting its deadline) cannot strand a task in the in-flight set.
    async fn claim_next(&self) -> Result<Option<QueueTask>> {
        let id = {
            let state = self.state.lock().unwrap();
            match state.available.first() {
                Some(id) => id.clone(),
                None => return Ok(None),
            }
        };
        let payload = tokio::fs::read(self.task_path(&id))
            .await
            .map_err(|e| Error::queue(&self.dir, e))?;
        {
            let mut state = self.state.lock().unwrap();
            state.available.remove(&id);
            state.in_flight.insert(id.clone());
        }
        Ok(Some(QueueTask {
            id,
            payload: Bytes::from(payload),
        }))
    }
}

impl TaskQueue for FsQueue {
    fn put(&self, payload: Bytes) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let id = Uuid::new_v7(Timestamp::now(&*self.ctx.lock().unwrap())).to_string();
            self.write_task(&id, &payload)
                .await
                .map_err(|e| Error::queue(&self.dir, e))?;
            {
                let mut state = self.state.lock().unwrap();
                state.available.insert(id);
                state.enqueued += 1;
            }
            self.notify.notify_one();
            Ok(())
        })
    }

    fn take(&self) -> BoxFuture<'_, Result<QueueTask>> {
        Box::pin(async move {
            loop {
                let notified = self.notify.notified();
                if let Some(task) = self.claim_next().await? {
                    return Ok(task);
                }
                notified.await;
            }
        })
    }

    fn take_timeout(&self, timeout: Duration) -> BoxFuture<'_, Result<Option<QueueTask>>> {
        Box::pin(async move {
            match tokio::time::timeout(timeout, self.take()).await {
                Ok(task) => task.map(Some),
                Err(_) => Ok(None),
            }
        })
    }

    fn complete<'a>(&'a self, task: &'a QueueTask) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            match tokio::fs::remove_file(self.task_path(&task.id)).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::queue(&self.dir, e)),
            }
            let mut state = self.state.lock().unwrap();
            state.in_flight.remove(&task.id);
            state.completed += 1;
            Ok(())
        })
    }

    fn retry<'a>(&'a self, task: &'a QueueTask) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            {
                let mut state = self.state.lock().unwrap();
                if !state.in_flight.remove(&task.id) {
                    return Ok(());
                }
                state.available.insert(task.id.clone());
                state.retried += 1;
            }
            self.notify.notify_one();
            Ok(())
        })
    }

    fn pending(&self) -> BoxFuture<'_, Result<Vec<QueueTask>>> {
        Box::pin(async move {
            let ids: Vec<String> = {
                let state = self.state.lock().unwrap();
                state.available.iter().cloned().collect()
            };
            let mut tasks = Vec::with_capacity(ids.len());
            for id in ids {
                match tokio::fs::read(self.task_path(&id)).await {
                    Ok(payload) => tasks.push(QueueTask {
                        id,
                        payload: Bytes::from(payload),
                    }),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(Error::queue(&self.dir, e)),
                }
            }
            Ok(tasks)
        })
    }

    fn stats(&self) -> BoxFuture<'_, Result<QueueStats>> {
        Box::pin(async move {
            let state = self.state.lock().unwrap();
            Ok(QueueStats {
                pending: state.available.len() as u64,
                in_flight: state.in_flight.len() as u64,
                enqueued: state.enqueued,
                completed: state.completed,
                retried: state.retried,
            })
        })
    }
}
