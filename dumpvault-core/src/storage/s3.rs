/*!
Amazon S3 storage adapter implementation.

Artifacts are stored as objects using the official AWS SDK. The SDK is async;
the adapter owns a Tokio runtime and blocks on it, so callers stay synchronous.
*/

use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::runtime::Runtime;
use tracing::{debug, error, info};

use super::StorageAdapter;
use crate::config::StorageConfig;
use crate::{Result, VaultError};

const SCHEME: &str = "s3://";

/// Amazon S3 (or S3-compatible) storage adapter
///
/// Config keys: `bucket` (required), `region`, `endpoint` (switches to
/// path-style addressing for S3-compatible services).
///
/// # Authentication
/// The adapter uses the standard AWS credential provider chain:
/// 1. Environment variables (AWS_ACCESS_KEY_ID, AWS_SECRET_ACCESS_KEY, AWS_SESSION_TOKEN)
/// 2. AWS credentials file (~/.aws/credentials)
/// 3. IAM roles for EC2 instances
/// 4. ECS task roles
///
/// # Example
/// ```rust,no_run
/// use dumpvault_core::config::StorageConfig;
/// use dumpvault_core::storage::{S3Storage, StorageAdapter};
/// use std::path::Path;
///
/// let config = StorageConfig::s3_storage("my-backups").with("region", "eu-west-1");
/// let storage = S3Storage::from_config(&config)?;
/// let location = storage.upload(Path::new("/tmp/orders_backup.sql.gz"), "db/orders_backup.sql.gz")?;
/// assert_eq!(location, "s3://my-backups/db/orders_backup.sql.gz");
/// # Ok::<(), dumpvault_core::VaultError>(())
/// ```
#[derive(Debug)]
pub struct S3Storage {
    client: S3Client,
    bucket: String,
    runtime: Arc<Runtime>,
}

impl S3Storage {
    /// Create an adapter from a storage config
    ///
    /// # Errors
    /// * `VaultError::Configuration` - `bucket` missing or a key has the wrong type
    /// * `VaultError::StorageIo` - no credentials, or the runtime cannot be created
    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        let bucket = config.require_str("bucket")?.to_string();
        let region = config.optional_str("region")?.map(str::to_string);
        let endpoint = config.optional_str("endpoint")?.map(str::to_string);

        let runtime = Runtime::new().map_err(|e| {
            VaultError::storage(format!("Failed to create async runtime for S3 client: {e}"))
        })?;

        let sdk_config = runtime.block_on(async {
            let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
            if let Some(region) = region {
                loader = loader.region(Region::new(region));
            }
            loader.load().await
        });

        if sdk_config.credentials_provider().is_none() {
            return Err(VaultError::storage(
                "AWS credentials not found. Please set AWS_ACCESS_KEY_ID, AWS_SECRET_ACCESS_KEY, and AWS_REGION environment variables",
            ));
        }

        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if let Some(endpoint) = &endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        let client = S3Client::from_conf(builder.build());

        info!(bucket = %bucket, endpoint = ?endpoint, "Initialized S3 storage adapter");

        Ok(Self {
            client,
            bucket,
            runtime: Arc::new(runtime),
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Object key for an address given as a key or as `s3://bucket/key`
    fn key_for(&self, address: &str) -> Result<String> {
        object_key(&self.bucket, address)
    }
}

fn object_key(bucket: &str, address: &str) -> Result<String> {
    let key = match address.strip_prefix(SCHEME) {
        Some(rest) => {
            let (addr_bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
            if addr_bucket != bucket {
                return Err(VaultError::configuration(format!(
                    "address {address} refers to bucket '{addr_bucket}', storage is configured for '{bucket}'"
                )));
            }
            key
        }
        None => address,
    };

    let key = key.trim_start_matches('/');
    if key.is_empty() {
        return Err(VaultError::configuration(format!(
            "address '{address}' does not name an object"
        )));
    }
    Ok(key.to_string())
}

impl StorageAdapter for S3Storage {
    fn upload(&self, local_path: &Path, remote_address: &str) -> Result<String> {
        let key = self.key_for(remote_address)?;
        if !local_path.is_file() {
            return Err(VaultError::not_found(format!(
                "{} does not exist",
                local_path.display()
            )));
        }

        info!(bucket = %self.bucket, key = %key, "Uploading artifact to S3");

        let result = self.runtime.block_on(async {
            let body = ByteStream::from_path(local_path).await.map_err(|e| {
                VaultError::storage(format!("Failed to read {}: {}", local_path.display(), e))
            })?;
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(&key)
                .body(body)
                .send()
                .await
                .map_err(|e| map_s3_error("put_object", e, &key))
        });

        if let Err(e) = result {
            error!(bucket = %self.bucket, key = %key, error = %e, "Failed to upload artifact to S3");
            return Err(e);
        }

        Ok(format!("{SCHEME}{}/{}", self.bucket, key))
    }

    fn download(&self, remote_address: &str, local_path: &Path) -> Result<PathBuf> {
        let key = self.key_for(remote_address)?;
        info!(bucket = %self.bucket, key = %key, "Downloading artifact from S3");

        self.runtime.block_on(async {
            let output = self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(&key)
                .send()
                .await
                .map_err(|e| map_s3_error("get_object", e, &key))?;

            let mut file = tokio::fs::File::create(local_path)
                .await
                .map_err(|e| VaultError::io(format!("create {}", local_path.display()), e))?;

            let mut body = output.body;
            let mut written = 0usize;
            while let Some(chunk) = body.try_next().await.map_err(|e| {
                VaultError::storage(format!("Failed to read S3 object stream: {e}"))
            })? {
                file.write_all(&chunk)
                    .await
                    .map_err(|e| VaultError::io(format!("write {}", local_path.display()), e))?;
                written += chunk.len();
            }
            file.flush()
                .await
                .map_err(|e| VaultError::io(format!("flush {}", local_path.display()), e))?;

            debug!(bucket = %self.bucket, key = %key, size = written, "Downloaded artifact from S3");
            Ok(local_path.to_path_buf())
        })
    }

    fn list_files(&self, prefix: &str) -> Result<Vec<String>> {
        let scheme_form = prefix.starts_with(SCHEME);
        let key_prefix = if scheme_form {
            let rest = &prefix[SCHEME.len()..];
            match rest.split_once('/') {
                Some((bucket, key)) if bucket == self.bucket => key.to_string(),
                Some((bucket, _)) => {
                    return Err(VaultError::configuration(format!(
                        "prefix {prefix} refers to bucket '{bucket}', storage is configured for '{}'",
                        self.bucket
                    )))
                }
                None => String::new(),
            }
        } else {
            prefix.trim_start_matches('/').to_string()
        };

        let keys = self.runtime.block_on(async {
            let mut pages = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&key_prefix)
                .into_paginator()
                .send();

            let mut keys = Vec::new();
            while let Some(page) = pages.next().await {
                let page = page.map_err(|e| map_s3_error("list_objects_v2", e, &key_prefix))?;
                keys.extend(page.contents().iter().filter_map(|o| o.key().map(str::to_string)));
            }
            Ok::<_, VaultError>(keys)
        })?;

        let mut addresses: Vec<String> = keys
            .into_iter()
            .map(|key| {
                if scheme_form {
                    format!("{SCHEME}{}/{}", self.bucket, key)
                } else {
                    key
                }
            })
            .collect();
        addresses.sort();
        Ok(addresses)
    }

    fn backend_name(&self) -> &'static str {
        "s3"
    }
}

/// Map AWS SDK errors to VaultError with appropriate context
fn map_s3_error<E: ProvideErrorMetadata + std::fmt::Debug>(
    op: &str,
    error: SdkError<E>,
    key: &str,
) -> VaultError {
    match &error {
        SdkError::DispatchFailure(dispatch_err) => {
            VaultError::storage(format!("S3 {op} request failed to dispatch: {dispatch_err:?}"))
        }
        SdkError::TimeoutError(_) => {
            VaultError::storage(format!("S3 {op} request timed out (key: {key})"))
        }
        SdkError::ResponseError(response_err) => {
            VaultError::storage(format!("S3 {op} response error: {response_err:?}"))
        }
        SdkError::ServiceError(service_err) => match service_err.err().code() {
            Some(code) => classify_service_error(op, code, service_err.err().message(), key),
            None => VaultError::storage(format!("S3 {op} service error: {service_err:?}")),
        },
        _ => VaultError::storage(format!("S3 {op} error: {error}")),
    }
}

fn classify_service_error(op: &str, code: &str, message: Option<&str>, key: &str) -> VaultError {
    match code {
        "NoSuchKey" | "NotFound" => VaultError::not_found(format!("S3 object '{key}' not found")),
        "NoSuchBucket" => VaultError::storage("S3 bucket not found"),
        "AccessDenied" | "Forbidden" => {
            VaultError::storage("Access denied to S3 (check credentials and permissions)")
        }
        "InvalidBucketName" => VaultError::storage("Invalid S3 bucket name"),
        _ => VaultError::storage(format!(
            "S3 {op} service error ({code}): {}",
            message.unwrap_or("Unknown error")
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_s3::operation::get_object::GetObjectError;

    #[test]
    fn test_object_key_forms() {
        assert_eq!(object_key("bk", "db/a.sql.gz").unwrap(), "db/a.sql.gz");
        assert_eq!(object_key("bk", "/db/a.sql.gz").unwrap(), "db/a.sql.gz");
        assert_eq!(object_key("bk", "s3://bk/db/a.sql.gz").unwrap(), "db/a.sql.gz");
    }

    #[test]
    fn test_object_key_rejects_other_bucket_and_empty() {
        let err = object_key("bk", "s3://other/a.sql.gz").unwrap_err();
        assert!(matches!(err, VaultError::Configuration(_)));
        assert!(object_key("bk", "s3://bk/").is_err());
        assert!(object_key("bk", "").is_err());
    }

    #[test]
    fn test_from_config_requires_bucket() {
        let err = S3Storage::from_config(&StorageConfig::new("s3")).unwrap_err();
        assert!(matches!(err, VaultError::Configuration(_)));
        assert!(err.to_string().contains("'bucket'"));
    }

    #[test]
    fn test_missing_key_maps_to_not_found() {
        let err = classify_service_error("get_object", "NoSuchKey", None, "db/a.sql.gz");
        assert!(err.is_not_found());
        assert!(err.to_string().contains("db/a.sql.gz"));

        let err = classify_service_error("put_object", "AccessDenied", None, "k");
        assert!(matches!(err, VaultError::StorageIo(_)));

        let err = classify_service_error("put_object", "SlowDown", Some("reduce rate"), "k");
        assert!(err.to_string().contains("SlowDown"));
        assert!(err.to_string().contains("reduce rate"));
    }

    #[test]
    fn test_timeout_error_mapping() {
        let timeout = SdkError::<GetObjectError>::timeout_error("deadline exceeded");
        let mapped = map_s3_error("get_object", timeout, "test-key");

        match mapped {
            VaultError::StorageIo(msg) => {
                assert!(msg.contains("timed out"));
                assert!(msg.contains("test-key"));
            }
            other => panic!("Expected storage error for timeout, got {other:?}"),
        }
    }
}
