//! The object-store interface consumed by the journal.
//!
//! [`ObjectStore`] covers the multipart operations the upload state machine
//! needs: initiate, upload-part, complete, abort, and the two listing calls
//! used by startup recovery and the expiration sweeper. The production
//! implementation is [`SdkStore`]; tests use
//! [`MemoryStore`](crate::testing::MemoryStore).
use crate::error::Result;

use bytes::Bytes;
use futures::future::BoxFuture;
use std::fmt::{self, Display, Formatter};
use std::ops::Deref;
use std::sync::Arc;

mod sdk;
pub use sdk::SdkStore;

/// Part-size rules of the target object store.
///
/// The conventional S3 values are [`PartLimits::S3`]. Stores used in tests
/// may shrink these to exercise rollover behavior with small payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartLimits {
    /// A part below this size may not be uploaded, except the final part of
    /// an object.
    pub min_part_size: u64,
    /// No part may exceed this size.
    pub max_part_size: u64,
    /// An object is completed after at most this many parts.
    pub max_parts: u64,
}

impl PartLimits {
    // https://docs.aws.amazon.com/AmazonS3/latest/userguide/qfacts.html
    pub const S3: PartLimits = PartLimits {
        min_part_size: 5 * (1 << 20),
        max_part_size: 5 * (1 << 30),
        max_parts: 10_000,
    };
}

impl Default for PartLimits {
    fn default() -> Self {
        Self::S3
    }
}

/// The address of an object in the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ObjectUri {
    pub bucket: String,
    pub key: String,
}

impl ObjectUri {
    pub fn new<B: Into<String>, K: Into<String>>(bucket: B, key: K) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

impl Display for ObjectUri {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.key)
    }
}

/// ID assigned by the store for an open multipart upload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadId(String);

impl UploadId {
    pub fn new<T: Into<String>>(id: T) -> Self {
        Self(id.into())
    }
}

impl Deref for UploadId {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

impl Display for UploadId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for UploadId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for UploadId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Entity tag assigned to an uploaded part or a completed object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityTag(String);

impl EntityTag {
    pub fn new<T: Into<String>>(etag: T) -> Self {
        Self(etag.into())
    }
}

impl Deref for EntityTag {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

impl Display for EntityTag {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for EntityTag {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for EntityTag {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Identifies one open multipart upload: the target address plus the ID the
/// store assigned when the upload was initiated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadDescriptor {
    pub uri: ObjectUri,
    pub id: UploadId,
}

impl UploadDescriptor {
    pub fn new(uri: ObjectUri, id: UploadId) -> Self {
        Self { uri, id }
    }
}

impl Display for UploadDescriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.uri, self.id)
    }
}

/// A committed part of an open upload.
///
/// Every `UploadedPart` must be retained: the set of them is what a
/// complete-upload request is made from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedPart {
    /// 1-based number of the part within its object.
    pub part_number: i32,
    pub etag: EntityTag,
}

impl UploadedPart {
    pub fn new(part_number: i32, etag: EntityTag) -> Self {
        Self { part_number, etag }
    }
}

/// One in-progress multipart upload returned by a listing call.
#[derive(Debug, Clone)]
pub struct OpenUpload {
    pub key: String,
    pub id: UploadId,
}

/// Operations in a multipart upload.
///
/// Implementations are used through `Arc<dyn ObjectStore>`, so the methods
/// return boxed futures.
pub trait ObjectStore: Send + Sync {
    /// Part-size rules enforced by this store.
    fn limits(&self) -> PartLimits {
        PartLimits::S3
    }

    /// Initiate a multipart upload for `uri`.
    fn create_upload<'a>(&'a self, uri: &'a ObjectUri) -> BoxFuture<'a, Result<UploadDescriptor>>;

    /// Upload one part. `last_part` hints that this is the final part of the
    /// object and may be smaller than the minimum part size.
    fn upload_part<'a>(
        &'a self,
        descriptor: &'a UploadDescriptor,
        part_number: i32,
        body: Bytes,
        last_part: bool,
    ) -> BoxFuture<'a, Result<UploadedPart>>;

    /// Complete the upload from its committed parts.
    fn complete_upload<'a>(
        &'a self,
        descriptor: &'a UploadDescriptor,
        parts: &'a [UploadedPart],
    ) -> BoxFuture<'a, Result<EntityTag>>;

    /// Abort the upload, discarding any committed parts.
    fn abort_upload<'a>(&'a self, descriptor: &'a UploadDescriptor) -> BoxFuture<'a, Result<()>>;

    /// List in-progress multipart uploads in `bucket`, optionally restricted
    /// to keys under `prefix`.
    fn list_uploads<'a>(
        &'a self,
        bucket: &'a str,
        prefix: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Vec<OpenUpload>>>;

    /// List the parts already committed to an open upload.
    fn list_parts<'a>(
        &'a self,
        descriptor: &'a UploadDescriptor,
    ) -> BoxFuture<'a, Result<Vec<UploadedPart>>>;
}

impl<S: ObjectStore> ObjectStore for Arc<S> {
    fn limits(&self) -> PartLimits {
        S::limits(self)
    }

    fn create_upload<'a>(&'a self, uri: &'a ObjectUri) -> BoxFuture<'a, Result<UploadDescriptor>> {
        S::create_upload(self, uri)
    }

    fn upload_part<'a>(
        &'a self,
        descriptor: &'a UploadDescriptor,
        part_number: i32,
        body: Bytes,
        last_part: bool,
    ) -> BoxFuture<'a, Result<UploadedPart>> {
        S::upload_part(self, descriptor, part_number, body, last_part)
    }

    fn complete_upload<'a>(
        &'a self,
        descriptor: &'a UploadDescriptor,
        parts: &'a [UploadedPart],
    ) -> BoxFuture<'a, Result<EntityTag>> {
        S::complete_upload(self, descriptor, parts)
    }

    fn abort_upload<'a>(&'a self, descriptor: &'a UploadDescriptor) -> BoxFuture<'a, Result<()>> {
        S::abort_upload(self, descriptor)
    }

    fn list_uploads<'a>(
        &'a self,
        bucket: &'a str,
        prefix: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Vec<OpenUpload>>> {
        S::list_uploads(self, bucket, prefix)
    }

    fn list_parts<'a>(
        &'a self,
        descriptor: &'a UploadDescriptor,
    ) -> BoxFuture<'a, Result<Vec<UploadedPart>>> {
        S::list_parts(self, descriptor)
    }
}
