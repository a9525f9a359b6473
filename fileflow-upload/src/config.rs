use std::time::Duration;

use fileflow_core::FlowConfigSnapshot;

const GIB: u64 = 1024 * 1024 * 1024;
const MIB: u64 = 1024 * 1024;

/// Limits and TTLs for the session coordinator
#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub single_url_ttl: Duration,
    pub part_url_ttl: Duration,
    pub single_session_ttl: Duration,
    pub multipart_session_ttl: Duration,
    pub max_declared_bytes: u64,
    pub min_part_bytes: u64,
    pub max_parts: u32,
    /// Upper bound on any single object-storage call
    pub storage_timeout: Duration,
    pub default_bucket: String,
    /// Re-read attempts when a part commit loses a version race
    pub conflict_retries: u32,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            single_url_ttl: Duration::from_secs(15 * 60),
            part_url_ttl: Duration::from_secs(24 * 60 * 60),
            single_session_ttl: Duration::from_secs(15 * 60),
            multipart_session_ttl: Duration::from_secs(24 * 60 * 60),
            max_declared_bytes: 5 * GIB,
            min_part_bytes: 5 * MIB,
            max_parts: 10_000,
            storage_timeout: Duration::from_secs(10),
            default_bucket: "uploads".to_string(),
            conflict_retries: 3,
        }
    }
}

impl UploadConfig {
    pub fn from_snapshot(snapshot: &FlowConfigSnapshot) -> Self {
        let d = Self::default();
        Self {
            single_url_ttl: snapshot
                .get_duration_secs("upload.single_url_ttl_secs")
                .unwrap_or(d.single_url_ttl),
            part_url_ttl: snapshot
                .get_duration_secs("upload.part_url_ttl_secs")
                .unwrap_or(d.part_url_ttl),
            single_session_ttl: snapshot
                .get_duration_secs("upload.single_session_ttl_secs")
                .unwrap_or(d.single_session_ttl),
            multipart_session_ttl: snapshot
                .get_duration_secs("upload.multipart_session_ttl_secs")
                .unwrap_or(d.multipart_session_ttl),
            max_declared_bytes: snapshot
                .get_u64("upload.max_declared_bytes")
                .unwrap_or(d.max_declared_bytes),
            min_part_bytes: snapshot
                .get_u64("upload.min_part_bytes")
                .filter(|n| *n > 0)
                .unwrap_or(d.min_part_bytes),
            max_parts: snapshot
                .get_u32("upload.max_parts")
                .filter(|n| *n > 0)
                .unwrap_or(d.max_parts),
            storage_timeout: snapshot
                .get_duration_secs("upload.storage_timeout_secs")
                .unwrap_or(d.storage_timeout),
            default_bucket: snapshot
                .get_string("upload.default_bucket")
                .unwrap_or(d.default_bucket),
            conflict_retries: snapshot
                .get_u32("upload.conflict_retries")
                .unwrap_or(d.conflict_retries),
        }
    }

    pub fn with_single_session_ttl(mut self, ttl: Duration) -> Self {
        self.single_session_ttl = ttl;
        self
    }

    pub fn with_multipart_session_ttl(mut self, ttl: Duration) -> Self {
        self.multipart_session_ttl = ttl;
        self
    }

    pub fn with_min_part_bytes(mut self, bytes: u64) -> Self {
        self.min_part_bytes = bytes;
        self
    }

    pub fn with_max_parts(mut self, max: u32) -> Self {
        self.max_parts = max;
        self
    }

    pub fn with_storage_timeout(mut self, timeout: Duration) -> Self {
        self.storage_timeout = timeout;
        self
    }

    pub fn with_default_bucket<S: Into<String>>(mut self, bucket: S) -> Self {
        self.default_bucket = bucket.into();
        self
    }
}

/// Settings for the expiration listener and reconciliation sweep
#[derive(Debug, Clone)]
pub struct ExpirationConfig {
    pub sweep_interval: Duration,
    pub sweep_page_size: usize,
    /// Wait before resubscribing after the notification stream fails
    pub listener_retry_delay: Duration,
}

impl Default for ExpirationConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(60 * 60),
            sweep_page_size: 100,
            listener_retry_delay: Duration::from_secs(5),
        }
    }
}

impl ExpirationConfig {
    pub fn from_snapshot(snapshot: &FlowConfigSnapshot) -> Self {
        let d = Self::default();
        Self {
            sweep_interval: snapshot
                .get_duration_secs("expiration.sweep_interval_secs")
                .unwrap_or(d.sweep_interval),
            sweep_page_size: snapshot
                .get_usize("expiration.sweep_page_size")
                .filter(|n| *n > 0)
                .unwrap_or(d.sweep_page_size),
            listener_retry_delay: snapshot
                .get_duration_secs("expiration.listener_retry_secs")
                .unwrap_or(d.listener_retry_delay),
        }
    }

    pub fn with_sweep_page_size(mut self, size: usize) -> Self {
        self.sweep_page_size = size;
        self
    }
}
