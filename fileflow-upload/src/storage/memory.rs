use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use super::{ObjectStoragePort, StorageError};
use crate::{parts::PartTag, types::ObjectLocation};

/// Which port call a queued fault applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageFault {
    Initiate,
    PresignPart,
    PresignPut,
    Complete,
    Abort,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum UploadState {
    Open,
    Completed { etag: String, parts: Vec<PartTag> },
    Aborted,
}

#[derive(Default)]
struct Inner {
    uploads: HashMap<String, (ObjectLocation, UploadState)>,
    faults: HashMap<StorageFault, VecDeque<StorageError>>,
    calls: HashMap<StorageFault, usize>,
}

/// In-process object store for tests and local runs.
///
/// Faults queued with [`fail_next`](Self::fail_next) are returned by the
/// next matching calls in order. Completing the same handle twice with the
/// same parts returns the original ETag.
#[derive(Default)]
pub struct MemoryObjectStorage {
    inner: Mutex<Inner>,
}

impl MemoryObjectStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, op: StorageFault, err: StorageError) {
        self.inner.lock().faults.entry(op).or_default().push_back(err);
    }

    /// Number of calls made for `op`, failed ones included.
    pub fn calls(&self, op: StorageFault) -> usize {
        self.inner.lock().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn is_completed(&self, handle: &str) -> bool {
        matches!(
            self.inner.lock().uploads.get(handle),
            Some((_, UploadState::Completed { .. }))
        )
    }

    pub fn is_aborted(&self, handle: &str) -> bool {
        matches!(self.inner.lock().uploads.get(handle), Some((_, UploadState::Aborted)))
    }

    fn enter(inner: &mut Inner, op: StorageFault) -> Result<(), StorageError> {
        *inner.calls.entry(op).or_default() += 1;
        match inner.faults.get_mut(&op).and_then(|q| q.pop_front()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn open_upload<'a>(
        inner: &'a mut Inner,
        location: &ObjectLocation,
        handle: &str,
    ) -> Result<&'a mut UploadState, StorageError> {
        match inner.uploads.get_mut(handle) {
            Some((loc, state)) if loc == location => Ok(state),
            _ => Err(StorageError::permanent(format!("NoSuchUpload: {handle}"))),
        }
    }
}

#[async_trait]
impl ObjectStoragePort for MemoryObjectStorage {
    async fn initiate_multipart(&self, location: &ObjectLocation, _content_type: &str) -> Result<String, StorageError> {
        let mut inner = self.inner.lock();
        Self::enter(&mut inner, StorageFault::Initiate)?;
        let handle = format!("mpu-{}", Uuid::new_v4().simple());
        inner.uploads.insert(handle.clone(), (location.clone(), UploadState::Open));
        Ok(handle)
    }

    async fn presign_part_url(
        &self,
        location: &ObjectLocation,
        upload_handle: &str,
        part_number: u32,
        ttl: Duration,
    ) -> Result<String, StorageError> {
        let mut inner = self.inner.lock();
        Self::enter(&mut inner, StorageFault::PresignPart)?;
        match Self::open_upload(&mut inner, location, upload_handle)? {
            UploadState::Open => Ok(format!(
                "memory://{}/{}?uploadId={}&partNumber={}&expires={}",
                location.bucket,
                location.key,
                upload_handle,
                part_number,
                ttl.as_secs()
            )),
            _ => Err(StorageError::permanent(format!("upload {upload_handle} is closed"))),
        }
    }

    async fn presign_put_url(
        &self,
        location: &ObjectLocation,
        _content_type: &str,
        ttl: Duration,
    ) -> Result<String, StorageError> {
        let mut inner = self.inner.lock();
        Self::enter(&mut inner, StorageFault::PresignPut)?;
        Ok(format!(
            "memory://{}/{}?sig={}&expires={}",
            location.bucket,
            location.key,
            Uuid::new_v4().simple(),
            ttl.as_secs()
        ))
    }

    async fn complete_multipart(
        &self,
        location: &ObjectLocation,
        upload_handle: &str,
        parts: &[PartTag],
    ) -> Result<String, StorageError> {
        let mut inner = self.inner.lock();
        Self::enter(&mut inner, StorageFault::Complete)?;
        let state = Self::open_upload(&mut inner, location, upload_handle)?;
        match state {
            UploadState::Open => {
                if parts.is_empty() {
                    return Err(StorageError::permanent("MalformedXML: no parts"));
                }
                let etag = format!("\"{}-{}\"", Uuid::new_v4().simple(), parts.len());
                *state = UploadState::Completed {
                    etag: etag.clone(),
                    parts: parts.to_vec(),
                };
                Ok(etag)
            }
            UploadState::Completed { etag, parts: done } if done.as_slice() == parts => Ok(etag.clone()),
            UploadState::Completed { .. } => Err(StorageError::permanent("InvalidPart: parts differ from completed upload")),
            UploadState::Aborted => Err(StorageError::permanent(format!("NoSuchUpload: {upload_handle}"))),
        }
    }

    async fn abort_multipart(&self, location: &ObjectLocation, upload_handle: &str) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        Self::enter(&mut inner, StorageFault::Abort)?;
        let state = Self::open_upload(&mut inner, location, upload_handle)?;
        match state {
            UploadState::Open => {
                *state = UploadState::Aborted;
                Ok(())
            }
            _ => Err(StorageError::permanent(format!("NoSuchUpload: {upload_handle}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(n: u32) -> Vec<PartTag> {
        (1..=n)
            .map(|i| PartTag {
                part_number: i,
                etag: format!("e{i}"),
            })
            .collect()
    }

    #[tokio::test]
    async fn complete_is_idempotent_for_same_parts() {
        let storage = MemoryObjectStorage::new();
        let loc = ObjectLocation::new("b", "k");
        let handle = storage.initiate_multipart(&loc, "video/mp4").await.unwrap();

        let first = storage.complete_multipart(&loc, &handle, &tags(2)).await.unwrap();
        let again = storage.complete_multipart(&loc, &handle, &tags(2)).await.unwrap();
        assert_eq!(first, again);
        assert!(storage.is_completed(&handle));

        let err = storage.complete_multipart(&loc, &handle, &tags(3)).await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn queued_faults_fire_once_in_order() {
        let storage = MemoryObjectStorage::new();
        let loc = ObjectLocation::new("b", "k");
        storage.fail_next(StorageFault::PresignPut, StorageError::transient("503"));

        let err = storage
            .presign_put_url(&loc, "image/png", Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(storage
            .presign_put_url(&loc, "image/png", Duration::from_secs(60))
            .await
            .is_ok());
        assert_eq!(storage.calls(StorageFault::PresignPut), 2);
    }

    #[tokio::test]
    async fn abort_of_unknown_handle_is_permanent() {
        let storage = MemoryObjectStorage::new();
        let err = storage
            .abort_multipart(&ObjectLocation::new("b", "k"), "missing")
            .await
            .unwrap_err();
        assert_eq!(err, StorageError::permanent("NoSuchUpload: missing"));
    }
}
