//! Fan-out across parallel journals.
//!
//! Each shard is a full journal with its own durable-queue directory
//! (`<base>/<shard_id>`) and its own key prefix (`<shard_id>/…`), so shards
//! never contend on local state or object keys. Records are spread
//! round-robin; nothing is promised about ordering across shards.
use crate::error::{Error, Result};
use crate::journal::{Journal, JournalBuilder, JournalStats};

use std::sync::atomic::{AtomicUsize, Ordering};

/// Shard identifiers, in shard-index order.
const SHARD_IDS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// N journals behind one round-robin dispatcher.
pub struct ShardedJournal<R> {
    shards: Vec<Journal<R>>,
    counter: AtomicUsize,
}

impl<R> std::fmt::Debug for ShardedJournal<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardedJournal").finish_non_exhaustive()
    }
}

impl<R: Send + Sync + 'static> ShardedJournal<R> {
    /// Submit one record to the next shard in rotation.
    pub async fn put(&self, record: R) -> Result<bool> {
        let next = self.counter.fetch_add(1, Ordering::Relaxed) % self.shards.len();
        self.shards[next].put(record).await
    }

    /// Counters summed over every shard.
    pub async fn stats(&self) -> Result<JournalStats> {
        let mut merged = JournalStats::default();
        for shard in &self.shards {
            merged.merge(&shard.stats().await?);
        }
        Ok(merged)
    }

    /// Close every shard in sequence.
    pub async fn close(&self) -> Result<()> {
        for shard in &self.shards {
            shard.close().await?;
        }
        Ok(())
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }
}

impl<R: Send + Sync + 'static> JournalBuilder<R> {
    /// Build the configured number of shards.
    pub async fn build_sharded(self) -> Result<ShardedJournal<R>> {
        let count = self
            .shards
            .ok_or_else(|| Error::config("shards is not set"))?;
        if count == 0 || count > SHARD_IDS.len() {
            return Err(Error::config(format!(
                "shards must be between 1 and {}",
                SHARD_IDS.len()
            )));
        }

        // The admission cap applies to the whole journal, split over shards.
        let per_shard_queue = (self.max_queue_size / count).max(1);
        let mut shards = Vec::with_capacity(count);
        for id in &SHARD_IDS[..count] {
            let builder = JournalBuilder {
                shards: None,
                max_queue_size: per_shard_queue,
                ..self.clone()
            };
            shards.push(builder.build_single(Some(*id as char)).await?);
        }
        Ok(ShardedJournal {
            shards,
            counter: AtomicUsize::new(0),
        })
    }
}
