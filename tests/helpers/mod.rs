use s3_journal::testing::{ManualClock, MemoryStore};
use s3_journal::{JournalBuilder, PartLimits};

use chrono::{DateTime, TimeZone as _, Utc};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

pub static TRACER: LazyLock<()> = LazyLock::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
});

pub const BUCKET: &str = "journal-test-bucket";
pub const NODE: &str = "node";

/// Geometry small enough that a handful of short records exercises part and
/// object rollover.
pub fn small_limits() -> PartLimits {
    PartLimits {
        min_part_size: 16,
        max_part_size: 1 << 20,
        max_parts: 4,
    }
}

pub fn store() -> Arc<MemoryStore> {
    Arc::new(MemoryStore::with_limits(small_limits()))
}

pub fn jan15(h: u32, m: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 15, h, m, s).unwrap()
}

pub fn jan16(h: u32, m: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 16, h, m, s).unwrap()
}

pub fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::at(jan15(12, 0, 0)))
}

/// A builder wired to the in-memory store with a fast flush cadence.
pub fn builder(
    store: &Arc<MemoryStore>,
    clock: &Arc<ManualClock>,
    dir: &std::path::Path,
) -> JournalBuilder {
    JournalBuilder::new(BUCKET, dir)
        .id(NODE)
        .store(store.clone())
        .clock(clock.clone())
        .max_batch_latency(Duration::from_millis(50))
}

/// A record that alone pushes a part past the 16-byte minimum.
pub fn big_record() -> bytes::Bytes {
    bytes::Bytes::from_static(b"0123456789abcdefg")
}

/// Wait out at least one batch-latency interval.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(300)).await;
}
