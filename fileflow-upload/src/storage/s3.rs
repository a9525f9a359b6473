use std::time::Duration;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_credential_types::Credentials;
use aws_sdk_s3::{
    config::http::HttpResponse,
    error::{DisplayErrorContext, ProvideErrorMetadata, SdkError},
    presigning::PresigningConfig,
    types::{CompletedMultipartUpload, CompletedPart},
    Client,
};
use fileflow_core::{ConfigError, FlowConfigSnapshot};
use tracing::debug;

use super::{ObjectStoragePort, StorageError};
use crate::{parts::PartTag, types::ObjectLocation};

/// Connection settings for an S3-compatible endpoint
#[derive(Debug, Clone)]
pub struct S3StorageConfig {
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    /// Custom endpoint for MinIO / RustFS style servers
    pub endpoint_url: Option<String>,
    pub force_path_style: bool,
}

impl S3StorageConfig {
    pub fn from_snapshot(snapshot: &FlowConfigSnapshot) -> Result<Self, ConfigError> {
        Ok(Self {
            region: snapshot.require("storage.s3.region")?.to_string(),
            access_key_id: snapshot.require("storage.s3.access_key_id")?.to_string(),
            secret_access_key: snapshot.require("storage.s3.secret_access_key")?.to_string(),
            endpoint_url: snapshot.get_string("storage.s3.endpoint_url"),
            force_path_style: snapshot.get_bool("storage.s3.force_path_style").unwrap_or(false),
        })
    }
}

/// [`ObjectStoragePort`] over `aws-sdk-s3`.
#[derive(Clone)]
pub struct S3ObjectStorage {
    client: Client,
}

impl S3ObjectStorage {
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    pub async fn connect(config: S3StorageConfig) -> Self {
        let credentials = Credentials::new(
            config.access_key_id,
            config.secret_access_key,
            None,
            None,
            "fileflow",
        );

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region))
            .credentials_provider(credentials);
        if let Some(endpoint) = config.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        let shared = loader.load().await;

        let client = Client::from_conf(
            aws_sdk_s3::config::Builder::from(&shared)
                .force_path_style(config.force_path_style)
                .build(),
        );
        Self { client }
    }

    fn presigning(ttl: Duration) -> Result<PresigningConfig, StorageError> {
        PresigningConfig::expires_in(ttl).map_err(|e| StorageError::permanent(format!("invalid presign ttl: {e}")))
    }
}

/// Timeouts, dispatch failures, 5xx, 429 and SlowDown are worth retrying.
fn classify<E>(op: &'static str, err: SdkError<E, HttpResponse>) -> StorageError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let transient = match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => true,
        SdkError::ServiceError(ctx) => {
            let status = ctx.raw().status().as_u16();
            status >= 500 || status == 429 || ctx.err().code() == Some("SlowDown")
        }
        _ => false,
    };
    let message = format!("{op}: {}", DisplayErrorContext(&err));
    debug!(op, transient, error = %message, "S3 call failed");
    if transient {
        StorageError::Transient(message)
    } else {
        StorageError::Permanent(message)
    }
}

#[async_trait]
impl ObjectStoragePort for S3ObjectStorage {
    async fn initiate_multipart(&self, location: &ObjectLocation, content_type: &str) -> Result<String, StorageError> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(&location.bucket)
            .key(&location.key)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| classify("create_multipart_upload", e))?;

        output
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| StorageError::permanent("create_multipart_upload returned no upload id"))
    }

    async fn presign_part_url(
        &self,
        location: &ObjectLocation,
        upload_handle: &str,
        part_number: u32,
        ttl: Duration,
    ) -> Result<String, StorageError> {
        let part_number = i32::try_from(part_number)
            .map_err(|_| StorageError::permanent(format!("part number {part_number} out of range")))?;
        let request = self
            .client
            .upload_part()
            .bucket(&location.bucket)
            .key(&location.key)
            .upload_id(upload_handle)
            .part_number(part_number)
            .presigned(Self::presigning(ttl)?)
            .await
            .map_err(|e| classify("upload_part presign", e))?;
        Ok(request.uri().to_string())
    }

    async fn presign_put_url(
        &self,
        location: &ObjectLocation,
        content_type: &str,
        ttl: Duration,
    ) -> Result<String, StorageError> {
        let request = self
            .client
            .put_object()
            .bucket(&location.bucket)
            .key(&location.key)
            .content_type(content_type)
            .presigned(Self::presigning(ttl)?)
            .await
            .map_err(|e| classify("put_object presign", e))?;
        Ok(request.uri().to_string())
    }

    async fn complete_multipart(
        &self,
        location: &ObjectLocation,
        upload_handle: &str,
        parts: &[PartTag],
    ) -> Result<String, StorageError> {
        let mut completed = Vec::with_capacity(parts.len());
        for part in parts {
            let number = i32::try_from(part.part_number)
                .map_err(|_| StorageError::permanent(format!("part number {} out of range", part.part_number)))?;
            completed.push(CompletedPart::builder().part_number(number).e_tag(&part.etag).build());
        }

        let output = self
            .client
            .complete_multipart_upload()
            .bucket(&location.bucket)
            .key(&location.key)
            .upload_id(upload_handle)
            .multipart_upload(CompletedMultipartUpload::builder().set_parts(Some(completed)).build())
            .send()
            .await
            .map_err(|e| classify("complete_multipart_upload", e))?;

        Ok(output.e_tag().unwrap_or_default().to_string())
    }

    async fn abort_multipart(&self, location: &ObjectLocation, upload_handle: &str) -> Result<(), StorageError> {
        self.client
            .abort_multipart_upload()
            .bucket(&location.bucket)
            .key(&location.key)
            .upload_id(upload_handle)
            .send()
            .await
            .map_err(|e| classify("abort_multipart_upload", e))?;
        Ok(())
    }
}
