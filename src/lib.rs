#![cfg_attr(docsrs, feature(doc_cfg))]

//! # Description
//!
//! A reliable, high-throughput journal to an S3-compatible object store.
//!
//! Producers submit discrete records with [`Journal::put`]; the journal
//! batches them, applies per-record framing and optional compression, stages
//! the payloads in a local crash-safe queue, and streams them to
//! time-partitioned objects through the store's multipart upload API. A
//! record accepted by `put` is uploaded exactly once, even across a process
//! crash and restart over the same local directory.
//!
//! Three rules shape the pipeline:
//!
//! * a part is flushed once it exceeds the store's minimum part size, and
//!   only the final part of an object may be smaller;
//! * an object rolls over after the store's maximum part count, and whenever
//!   the time partition advances;
//! * producers are backpressured end to end: an admission permit taken at
//!   `put` is only returned when the store acknowledges the bytes.
//!
//! # Examples
//!
//! ```no_run
//! use s3_journal::{Compressor, JournalBuilder};
//! use bytes::Bytes;
//! use std::time::Duration;
//!
//! # async fn f() -> s3_journal::Result<()> {
//! /// Credentials and region come from the ambient AWS environment; an
//! /// explicit key pair can be set with `credentials`.
//! let journal = JournalBuilder::new("a-bucket-us-east-1", "/var/spool/events")
//!     .id("worker-1")
//!     .directory_format("'events'/%Y/%m/%d")
//!     .compressor(Compressor::Gzip)
//!     .max_batch_size(512)
//!     .max_batch_latency(Duration::from_secs(5))
//!     .build()
//!     .await?;
//!
//! /// `put` is cheap and callable from many tasks. `Ok(false)` means the
//! /// journal is at capacity and the record was not accepted.
//! for n in 0..100_000u64 {
//!     while !journal.put(Bytes::from(n.to_string())).await? {
//!         tokio::time::sleep(Duration::from_millis(10)).await;
//!     }
//! }
//!
//! /// Closing flushes the batcher, drains the durable queue, and completes
//! /// every open object.
//! journal.close().await?;
//! #     Ok(())
//! # }
//! ```
#[doc(hidden)]
pub extern crate aws_config;
#[doc(hidden)]
pub extern crate aws_sdk_s3 as aws_sdk;

pub mod batch;
pub mod error;
pub use error::{Error, ErrorKind, Result};

pub mod frame;
#[doc(inline)]
pub use frame::{BytesEncoder, Compressor, Framing, JsonEncoder, RecordEncoder};

pub mod partition;
pub use partition::{Clock, DirectoryFormat, SystemClock};

pub mod position;

pub mod queue;
pub use queue::{FsQueue, QueueStats, TaskQueue};

pub mod store;
#[doc(inline)]
pub use store::{ObjectStore, PartLimits, SdkStore};

pub mod testing;

mod consumer;
mod journal;
#[doc(inline)]
pub use journal::{Journal, JournalBuilder, JournalStats};

mod shard;
pub use shard::ShardedJournal;

mod sweep;
