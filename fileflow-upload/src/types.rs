use std::fmt;

use chrono::{DateTime, Datelike, Utc};
use fileflow_core::TenantId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique, unguessable identifier for an upload session
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(format!("upl_{}", Uuid::new_v4().simple()))
    }

    pub fn from_string(id: String) -> Self {
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Single PUT or multipart upload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionKind {
    Single,
    Multipart,
}

impl SessionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Single => "SINGLE",
            Self::Multipart => "MULTIPART",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "SINGLE" => Some(Self::Single),
            "MULTIPART" => Some(Self::Multipart),
            _ => None,
        }
    }
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Visibility of the stored object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessType {
    Public,
    #[default]
    Internal,
}

impl AccessType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "PUBLIC",
            Self::Internal => "INTERNAL",
        }
    }
}

/// Where an object lives in the object store
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectLocation {
    pub bucket: String,
    pub key: String,
}

impl ObjectLocation {
    pub fn new<B: Into<String>, K: Into<String>>(bucket: B, key: K) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for ObjectLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// What the client wants to upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    pub tenant_id: TenantId,
    pub file_name: String,
    pub content_type: String,
    pub declared_size: u64,
    pub access: AccessType,
    pub purpose: Option<String>,
    pub source: Option<String>,
    /// Target bucket; the configured default when absent
    pub bucket: Option<String>,
    pub idempotency_key: Option<String>,
    /// Notified through the outbox once the upload completes
    pub callback_url: Option<String>,
}

impl UploadRequest {
    pub fn new<T, F, C>(tenant_id: T, file_name: F, content_type: C, declared_size: u64) -> Self
    where
        T: Into<TenantId>,
        F: Into<String>,
        C: Into<String>,
    {
        Self {
            tenant_id: tenant_id.into(),
            file_name: file_name.into(),
            content_type: content_type.into(),
            declared_size,
            access: AccessType::default(),
            purpose: None,
            source: None,
            bucket: None,
            idempotency_key: None,
            callback_url: None,
        }
    }

    pub fn with_access(mut self, access: AccessType) -> Self {
        self.access = access;
        self
    }

    pub fn with_purpose<S: Into<String>>(mut self, purpose: S) -> Self {
        self.purpose = Some(purpose.into());
        self
    }

    pub fn with_source<S: Into<String>>(mut self, source: S) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_bucket<S: Into<String>>(mut self, bucket: S) -> Self {
        self.bucket = Some(bucket.into());
        self
    }

    pub fn with_idempotency_key<S: Into<String>>(mut self, key: S) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_callback_url<S: Into<String>>(mut self, url: S) -> Self {
        self.callback_url = Some(url.into());
        self
    }

    /// The client's key, if it sent a non-blank one. Only client keys
    /// deduplicate; other sessions get a key generated from their id.
    pub fn client_idempotency_key(&self) -> Option<&str> {
        self.idempotency_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
    }
}

/// Multipart upload request: the base request plus chunking
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartRequest {
    pub upload: UploadRequest,
    /// Bytes per part; derived from the size and limits when absent
    pub part_size: Option<u64>,
}

impl MultipartRequest {
    pub fn new(upload: UploadRequest) -> Self {
        Self {
            upload,
            part_size: None,
        }
    }

    pub fn with_part_size(mut self, part_size: u64) -> Self {
        self.part_size = Some(part_size);
        self
    }
}

/// A part as reported by the client at completion time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportedPart {
    pub part_number: u32,
    pub etag: String,
}

impl ReportedPart {
    pub fn new<S: Into<String>>(part_number: u32, etag: S) -> Self {
        Self {
            part_number,
            etag: etag.into(),
        }
    }
}

/// Strategy for generating object keys
pub trait StorageKeyStrategy: Send + Sync {
    fn object_key(&self, tenant_id: &TenantId, session_id: &SessionId, now: DateTime<Utc>) -> String;
}

/// Default key strategy: tenant/yyyy/mm/dd/session_id
#[derive(Debug, Clone, Default)]
pub struct DatePartitionedKeys;

impl StorageKeyStrategy for DatePartitionedKeys {
    fn object_key(&self, tenant_id: &TenantId, session_id: &SessionId, now: DateTime<Utc>) -> String {
        format!(
            "{}/{:04}/{:02}/{:02}/{}",
            tenant_id,
            now.year(),
            now.month(),
            now.day(),
            session_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn session_ids_are_prefixed_and_unique() {
        let a = SessionId::new();
        let b = SessionId::new();
        assert!(a.as_str().starts_with("upl_"));
        assert_eq!(a.as_str().len(), 4 + 32);
        assert_ne!(a, b);
    }

    #[test]
    fn kind_parses_its_own_rendering() {
        assert_eq!(SessionKind::parse("SINGLE"), Some(SessionKind::Single));
        assert_eq!(SessionKind::parse(SessionKind::Multipart.as_str()), Some(SessionKind::Multipart));
        assert_eq!(SessionKind::parse("single"), None);
    }

    #[test]
    fn only_non_blank_client_keys_count() {
        let request = UploadRequest::new("t1", "cat.png", "image/png", 2048);
        assert_eq!(request.client_idempotency_key(), None);

        let explicit = request.clone().with_idempotency_key("client-key");
        assert_eq!(explicit.client_idempotency_key(), Some("client-key"));

        let blank = request.with_idempotency_key("  ");
        assert_eq!(blank.client_idempotency_key(), None);
    }

    #[test]
    fn keys_are_partitioned_by_day() {
        let now = Utc.with_ymd_and_hms(2026, 3, 7, 12, 0, 0).unwrap();
        let key = DatePartitionedKeys.object_key(&TenantId::new("t1"), &SessionId::from("upl_x"), now);
        assert_eq!(key, "t1/2026/03/07/upl_x");
    }
}
