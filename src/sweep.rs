//! Reclamation of stranded multipart uploads.
//!
//! A crashed writer leaves its open uploads behind, and the store bills for
//! their parts until someone closes them. The sweep walks every open upload
//! in the bucket, works out the age of its time partition, and closes the
//! stale ones: completed when parts were committed, aborted otherwise.
use crate::partition::{Clock, DirectoryFormat};
use crate::position::parse_object_key;
use crate::store::{ObjectStore, ObjectUri, UploadDescriptor};

use std::time::Duration;
use tracing::{info, warn};

/// Sweeps run at most this often.
pub(crate) const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

pub(crate) async fn sweep_expired(
    store: &dyn ObjectStore,
    bucket: &str,
    format: &DirectoryFormat,
    clock: &dyn Clock,
    expiration: Duration,
) {
    // No prefix: stranded uploads of crashed peers sharing the bucket are
    // fair game too, as long as their keys parse under our layout.
    let uploads = match store.list_uploads(bucket, None).await {
        Ok(uploads) => uploads,
        Err(e) => {
            warn!(error = %e, "expiration sweep could not list uploads");
            return;
        }
    };
    let Ok(max_age) = chrono::TimeDelta::from_std(expiration) else {
        return;
    };

    let now = clock.now_utc();
    for upload in uploads {
        let Some(parsed) = parse_object_key(&upload.key) else {
            continue;
        };
        let Some(written_at) = format.parse_directory(parsed.dir) else {
            continue;
        };
        if now.signed_duration_since(written_at) <= max_age {
            continue;
        }
        let descriptor =
            UploadDescriptor::new(ObjectUri::new(bucket, upload.key.clone()), upload.id);
        reclaim(store, &descriptor).await;
    }
}

async fn reclaim(store: &dyn ObjectStore, descriptor: &UploadDescriptor) {
    let parts = match store.list_parts(descriptor).await {
        Ok(parts) => parts,
        Err(e) if e.is_not_found() => return,
        Err(e) => {
            warn!(upload = %descriptor, error = %e, "could not list parts of stale upload");
            return;
        }
    };

    let outcome = if parts.is_empty() {
        store.abort_upload(descriptor).await
    } else {
        store.complete_upload(descriptor, &parts).await.map(drop)
    };
    match outcome {
        Ok(()) => info!(upload = %descriptor, "reclaimed stale upload"),
        Err(e) if e.is_not_found() => {}
        Err(e) if e.is_access_denied() => {
            if let Err(e) = store.abort_upload(descriptor).await {
                warn!(upload = %descriptor, error = %e, "could not abort stale upload");
            }
        }
        Err(e) => warn!(upload = %descriptor, error = %e, "could not reclaim stale upload"),
    }
}
