use super::{EntityTag, ObjectStore, ObjectUri, OpenUpload, PartLimits, UploadDescriptor, UploadId, UploadedPart};
use crate::error::{Error, ErrorKind, Result};

use aws_config::ConfigLoader;
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use bytes::Bytes;
use futures::future::BoxFuture;

/// Object store backed by the official AWS SDK.
#[derive(Debug, Clone)]
pub struct SdkStore {
    client: aws_sdk_s3::Client,
    limits: PartLimits,
}

impl SdkStore {
    /// Create an `SdkStore` from an existing SDK client.
    pub fn new(client: aws_sdk_s3::Client) -> Self {
        Self {
            client,
            limits: PartLimits::S3,
        }
    }

    /// Create an `SdkStore` from the supplied [`ConfigLoader`].
    ///
    /// [`ConfigLoader`]: aws_config::ConfigLoader
    pub async fn from_config(loader: ConfigLoader) -> Self {
        let config = loader.load().await;
        let client = aws_sdk_s3::Client::new(&config);
        Self::new(client)
    }

    /// Create an `SdkStore` using the default [`ConfigLoader`], which reads
    /// credentials and region from the ambient environment.
    pub async fn defaults() -> Self {
        let loader = aws_config::from_env();
        Self::from_config(loader).await
    }

    /// Create an `SdkStore` with an explicit static access key pair,
    /// otherwise using the ambient environment.
    pub async fn with_credentials(access_key: &str, secret_key: &str) -> Self {
        let creds = aws_sdk_s3::config::Credentials::new(
            access_key.to_string(),
            secret_key.to_string(),
            None,
            None,
            "s3-journal",
        );
        let loader = aws_config::from_env().credentials_provider(creds);
        Self::from_config(loader).await
    }
}

impl ObjectStore for SdkStore {
    fn limits(&self) -> PartLimits {
        self.limits
    }

    fn create_upload<'a>(&'a self, uri: &'a ObjectUri) -> BoxFuture<'a, Result<UploadDescriptor>> {
        Box::pin(async move {
            let resp = self
                .client
                .create_multipart_upload()
                .bucket(&uri.bucket)
                .key(&uri.key)
                .send()
                .await
                .map_err(|e| sdk_err("CreateMultipartUpload", uri.to_string(), e))?;

            let id = resp.upload_id().ok_or_else(|| {
                Error::store_msg(
                    "CreateMultipartUpload",
                    uri.to_string(),
                    ErrorKind::Store,
                    "response missing upload_id",
                )
            })?;

            Ok(UploadDescriptor::new(uri.clone(), UploadId::from(id)))
        })
    }

    fn upload_part<'a>(
        &'a self,
        descriptor: &'a UploadDescriptor,
        part_number: i32,
        body: Bytes,
        _last_part: bool,
    ) -> BoxFuture<'a, Result<UploadedPart>> {
        // S3 applies the minimum-size rule at complete time, so the last-part
        // hint has no effect on the wire request.
        Box::pin(async move {
            let resp = self
                .client
                .upload_part()
                .upload_id(&*descriptor.id)
                .bucket(&descriptor.uri.bucket)
                .key(&descriptor.uri.key)
                .part_number(part_number)
                .body(ByteStream::from(body))
                .send()
                .await
                .map_err(|e| sdk_err("UploadPart", descriptor.to_string(), e))?;

            let etag = resp.e_tag().ok_or_else(|| {
                Error::store_msg(
                    "UploadPart",
                    descriptor.to_string(),
                    ErrorKind::Store,
                    "response missing e_tag",
                )
            })?;

            Ok(UploadedPart::new(part_number, EntityTag::from(etag)))
        })
    }

    fn complete_upload<'a>(
        &'a self,
        descriptor: &'a UploadDescriptor,
        parts: &'a [UploadedPart],
    ) -> BoxFuture<'a, Result<EntityTag>> {
        Box::pin(async move {
            let completed = parts.iter().fold(Vec::new(), |mut acc, p| {
                acc.push(
                    CompletedPart::builder()
                        .e_tag(p.etag.to_string())
                        .part_number(p.part_number)
                        .build(),
                );
                acc
            });
            let multipart = CompletedMultipartUpload::builder()
                .set_parts(Some(completed))
                .build();

            let resp = self
                .client
                .complete_multipart_upload()
                .upload_id(&*descriptor.id)
                .bucket(&descriptor.uri.bucket)
                .key(&descriptor.uri.key)
                .multipart_upload(multipart)
                .send()
                .await
                .map_err(|e| sdk_err("CompleteMultipartUpload", descriptor.to_string(), e))?;

            let etag = resp.e_tag().ok_or_else(|| {
                Error::store_msg(
                    "CompleteMultipartUpload",
                    descriptor.to_string(),
                    ErrorKind::Store,
                    "response missing e_tag",
                )
            })?;

            Ok(EntityTag::from(etag))
        })
    }

    fn abort_upload<'a>(&'a self, descriptor: &'a UploadDescriptor) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.client
                .abort_multipart_upload()
                .upload_id(&*descriptor.id)
                .bucket(&descriptor.uri.bucket)
                .key(&descriptor.uri.key)
                .send()
                .await
                .map_err(|e| sdk_err("AbortMultipartUpload", descriptor.to_string(), e))?;
            Ok(())
        })
    }

    fn list_uploads<'a>(
        &'a self,
        bucket: &'a str,
        prefix: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Vec<OpenUpload>>> {
        Box::pin(async move {
            let mut uploads = Vec::new();
            let mut key_marker: Option<String> = None;
            let mut id_marker: Option<String> = None;

            loop {
                let resp = self
                    .client
                    .list_multipart_uploads()
                    .bucket(bucket)
                    .set_prefix(prefix.map(str::to_string))
                    .set_key_marker(key_marker.take())
                    .set_upload_id_marker(id_marker.take())
                    .send()
                    .await
                    .map_err(|e| sdk_err("ListMultipartUploads", bucket.to_string(), e))?;

                for u in resp.uploads() {
                    if let (Some(key), Some(id)) = (u.key(), u.upload_id()) {
                        uploads.push(OpenUpload {
                            key: key.to_string(),
                            id: UploadId::from(id),
                        });
                    }
                }
                if !resp.is_truncated().unwrap_or(false) {
                    return Ok(uploads);
                }
                key_marker = resp.next_key_marker().map(str::to_string);
                id_marker = resp.next_upload_id_marker().map(str::to_string);
            }
        })
    }

    fn list_parts<'a>(
        &'a self,
        descriptor: &'a UploadDescriptor,
    ) -> BoxFuture<'a, Result<Vec<UploadedPart>>> {
        Box::pin(async move {
            let mut parts = Vec::new();
            let mut marker: Option<String> = None;

            loop {
                let resp = self
                    .client
                    .list_parts()
                    .upload_id(&*descriptor.id)
                    .bucket(&descriptor.uri.bucket)
                    .key(&descriptor.uri.key)
                    .set_part_number_marker(marker.take())
                    .send()
                    .await
                    .map_err(|e| sdk_err("ListParts", descriptor.to_string(), e))?;

                for p in resp.parts() {
                    if let (Some(n), Some(etag)) = (p.part_number(), p.e_tag()) {
                        parts.push(UploadedPart::new(n, EntityTag::from(etag)));
                    }
                }
                if !resp.is_truncated().unwrap_or(false) {
                    return Ok(parts);
                }
                marker = resp.next_part_number_marker().map(str::to_string);
            }
        })
    }
}

fn sdk_err<E>(op: &'static str, target: String, err: SdkError<E>) -> Error
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    Error::store(op, target, classify(&err), err)
}

fn classify<E: ProvideErrorMetadata>(err: &SdkError<E>) -> ErrorKind {
    if let Some(resp) = err.raw_response() {
        match resp.status().as_u16() {
            403 => return ErrorKind::AccessDenied,
            404 => return ErrorKind::NotFound,
            _ => {}
        }
    }
    match err.as_service_error().and_then(|e| e.code()) {
        Some("NoSuchUpload" | "NoSuchKey" | "NoSuchBucket") => ErrorKind::NotFound,
        Some("AccessDenied") => ErrorKind::AccessDenied,
        _ => ErrorKind::Store,
    }
}
