//! In-memory test doubles.
//!
//! [`MemoryStore`] implements [`ObjectStore`] against process memory while
//! enforcing the same part-size rules a real store would, so journal tests
//! catch part-geometry violations without network access. [`ManualClock`]
//! pins the journal's notion of time.
use crate::error::{Error, ErrorKind, Result};
use crate::partition::Clock;
use crate::store::{
    EntityTag, ObjectStore, ObjectUri, OpenUpload, PartLimits, UploadDescriptor, UploadId,
    UploadedPart,
};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// An [`ObjectStore`] that keeps uploads and completed objects in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    limits: PartLimits,
    fail_part_uploads: AtomicBool,
    deny_completes: AtomicBool,
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    next_id: u64,
    uploads: HashMap<String, Open>,
    objects: BTreeMap<String, Vec<Bytes>>,
    aborted: Vec<String>,
}

#[derive(Debug)]
struct Open {
    bucket: String,
    key: String,
    parts: BTreeMap<i32, Bytes>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store enforcing the given part geometry instead of the S3 defaults.
    pub fn with_limits(limits: PartLimits) -> Self {
        Self {
            limits,
            ..Self::default()
        }
    }

    /// Make every part upload fail until turned off again.
    pub fn fail_part_uploads(&self, on: bool) {
        self.fail_part_uploads.store(on, Ordering::SeqCst);
    }

    /// Make every complete request fail with an access-denied error.
    pub fn deny_completes(&self, on: bool) {
        self.deny_completes.store(on, Ordering::SeqCst);
    }

    /// The body of a completed object.
    pub fn object(&self, key: &str) -> Option<Bytes> {
        let inner = self.inner.lock().unwrap();
        inner.objects.get(key).map(|parts| {
            let mut body = Vec::new();
            for p in parts {
                body.extend_from_slice(p);
            }
            Bytes::from(body)
        })
    }

    /// Part sizes of a completed object, in part order.
    pub fn object_parts(&self, key: &str) -> Option<Vec<usize>> {
        let inner = self.inner.lock().unwrap();
        inner
            .objects
            .get(key)
            .map(|parts| parts.iter().map(Bytes::len).collect())
    }

    /// Keys of every completed object.
    pub fn object_keys(&self) -> Vec<String> {
        self.inner.lock().unwrap().objects.keys().cloned().collect()
    }

    /// Number of multipart uploads still open.
    pub fn open_upload_count(&self) -> usize {
        self.inner.lock().unwrap().uploads.len()
    }

    /// Keys whose uploads were aborted.
    pub fn aborted_keys(&self) -> Vec<String> {
        self.inner.lock().unwrap().aborted.clone()
    }

    /// Open an upload directly, as a crashed peer would have left one.
    pub fn seed_upload(&self, bucket: &str, key: &str) -> UploadDescriptor {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.fresh_id();
        inner.uploads.insert(
            id.clone(),
            Open {
                bucket: bucket.to_string(),
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
        UploadDescriptor::new(ObjectUri::new(bucket, key), UploadId::from(id))
    }

    /// Commit a part to a seeded upload without going through the journal.
    pub fn seed_part(&self, descriptor: &UploadDescriptor, part_number: i32, body: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        let open = inner
            .uploads
            .get_mut(&*descriptor.id)
            .expect("seeded upload exists");
        open.parts.insert(part_number, Bytes::copy_from_slice(body));
    }
}

impl Inner {
    fn fresh_id(&mut self) -> String {
        self.next_id += 1;
        format!("upload-{:04}", self.next_id)
    }
}

impl ObjectStore for MemoryStore {
    fn limits(&self) -> PartLimits {
        self.limits
    }

    fn create_upload<'a>(&'a self, uri: &'a ObjectUri) -> BoxFuture<'a, Result<UploadDescriptor>> {
        Box::pin(async move {
            let mut inner = self.inner.lock().unwrap();
            let id = inner.fresh_id();
            inner.uploads.insert(
                id.clone(),
                Open {
                    bucket: uri.bucket.clone(),
                    key: uri.key.clone(),
                    parts: BTreeMap::new(),
                },
            );
            Ok(UploadDescriptor::new(uri.clone(), UploadId::from(id)))
        })
    }

    fn upload_part<'a>(
        &'a self,
        descriptor: &'a UploadDescriptor,
        part_number: i32,
        body: Bytes,
        last_part: bool,
    ) -> BoxFuture<'a, Result<UploadedPart>> {
        Box::pin(async move {
            if self.fail_part_uploads.load(Ordering::SeqCst) {
                return Err(Error::store_msg(
                    "UploadPart",
                    descriptor.to_string(),
                    ErrorKind::Store,
                    "injected part upload failure",
                ));
            }
            let limits = self.limits;
            let mut inner = self.inner.lock().unwrap();
            let open = inner
                .uploads
                .get_mut(&*descriptor.id)
                .ok_or_else(|| {
                    Error::store_msg(
                        "UploadPart",
                        descriptor.to_string(),
                        ErrorKind::NotFound,
                        "no such upload",
                    )
                })?;
            if part_number < 1 || part_number as u64 > limits.max_parts {
                return Err(Error::store_msg(
                    "UploadPart",
                    descriptor.to_string(),
                    ErrorKind::Store,
                    "part number out of range",
                ));
            }
            if body.len() as u64 > limits.max_part_size {
                return Err(Error::store_msg(
                    "UploadPart",
                    descriptor.to_string(),
                    ErrorKind::Store,
                    "part above maximum size",
                ));
            }
            if !last_part && (body.len() as u64) <= limits.min_part_size {
                return Err(Error::store_msg(
                    "UploadPart",
                    descriptor.to_string(),
                    ErrorKind::Store,
                    "non-final part below minimum size",
                ));
            }
            let etag = EntityTag::from(format!("etag-{}-{part_number}", descriptor.id));
            open.parts.insert(part_number, body);
            Ok(UploadedPart::new(part_number, etag))
        })
    }

    fn complete_upload<'a>(
        &'a self,
        descriptor: &'a UploadDescriptor,
        parts: &'a [UploadedPart],
    ) -> BoxFuture<'a, Result<EntityTag>> {
        Box::pin(async move {
            if self.deny_completes.load(Ordering::SeqCst) {
                return Err(Error::store_msg(
                    "CompleteMultipartUpload",
                    descriptor.to_string(),
                    ErrorKind::AccessDenied,
                    "injected access denial",
                ));
            }
            let mut inner = self.inner.lock().unwrap();
            let open = inner.uploads.get(&*descriptor.id).ok_or_else(|| {
                Error::store_msg(
                    "CompleteMultipartUpload",
                    descriptor.to_string(),
                    ErrorKind::NotFound,
                    "no such upload",
                )
            })?;
            if parts.is_empty() {
                return Err(Error::store_msg(
                    "CompleteMultipartUpload",
                    descriptor.to_string(),
                    ErrorKind::Store,
                    "completed with no parts",
                ));
            }
            for (i, part) in parts.iter().enumerate() {
                if part.part_number != i as i32 + 1 {
                    return Err(Error::store_msg(
                        "CompleteMultipartUpload",
                        descriptor.to_string(),
                        ErrorKind::Store,
                        "part numbers not contiguous from 1",
                    ));
                }
                if !open.parts.contains_key(&part.part_number) {
                    return Err(Error::store_msg(
                        "CompleteMultipartUpload",
                        descriptor.to_string(),
                        ErrorKind::Store,
                        "part was never uploaded",
                    ));
                }
            }
            for (i, body) in open.parts.values().enumerate() {
                if i + 1 < open.parts.len() && (body.len() as u64) <= self.limits.min_part_size {
                    return Err(Error::store_msg(
                        "CompleteMultipartUpload",
                        descriptor.to_string(),
                        ErrorKind::Store,
                        "non-final part below minimum size",
                    ));
                }
            }

            let open = inner.uploads.remove(&*descriptor.id).unwrap();
            let body: Vec<Bytes> = open.parts.into_values().collect();
            inner.objects.insert(open.key.clone(), body);
            Ok(EntityTag::from(format!("etag-{}", descriptor.id)))
        })
    }

    fn abort_upload<'a>(&'a self, descriptor: &'a UploadDescriptor) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut inner = self.inner.lock().unwrap();
            match inner.uploads.remove(&*descriptor.id) {
                Some(open) => {
                    inner.aborted.push(open.key);
                    Ok(())
                }
                None => Err(Error::store_msg(
                    "AbortMultipartUpload",
                    descriptor.to_string(),
                    ErrorKind::NotFound,
                    "no such upload",
                )),
            }
        })
    }

    fn list_uploads<'a>(
        &'a self,
        bucket: &'a str,
        prefix: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Vec<OpenUpload>>> {
        Box::pin(async move {
            let inner = self.inner.lock().unwrap();
            let mut found: Vec<OpenUpload> = inner
                .uploads
                .iter()
                .filter(|(_, open)| {
                    open.bucket == bucket && prefix.is_none_or(|p| open.key.starts_with(p))
                })
                .map(|(id, open)| OpenUpload {
                    key: open.key.clone(),
                    id: UploadId::from(id.as_str()),
                })
                .collect();
            found.sort_by(|a, b| a.key.cmp(&b.key));
            Ok(found)
        })
    }

    fn list_parts<'a>(
        &'a self,
        descriptor: &'a UploadDescriptor,
    ) -> BoxFuture<'a, Result<Vec<UploadedPart>>> {
        Box::pin(async move {
            let inner = self.inner.lock().unwrap();
            let open = inner.uploads.get(&*descriptor.id).ok_or_else(|| {
                Error::store_msg(
                    "ListParts",
                    descriptor.to_string(),
                    ErrorKind::NotFound,
                    "no such upload",
                )
            })?;
            Ok(open
                .parts
                .iter()
                .map(|(n, _)| {
                    UploadedPart::new(*n, EntityTag::from(format!("etag-{}-{n}", descriptor.id)))
                })
                .collect())
        })
    }
}

/// A [`Clock`] that only moves when told to.
#[derive(Debug)]
pub struct ManualClock(Mutex<DateTime<Utc>>);

impl ManualClock {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self(Mutex::new(now))
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.0.lock().unwrap() = now;
    }
}

impl Clock for ManualClock {
    fn now_utc(&self) -> DateTime<Utc> {
        *self.0.lock().unwrap()
    }
}
