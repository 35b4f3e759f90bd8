//! Object store configuration for S3 and local filesystem access.

use crate::config::OutputConfig;
use anyhow::{Context, Result};
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::{ClientOptions, ObjectStore, RetryConfig};
use std::sync::Arc;
use std::time::Duration;

/// Parse an S3 URI into bucket and key components.
///
/// Accepts URIs in the format `s3://bucket/key/path`.
///
/// # Errors
/// Returns an error if the URI is malformed (missing scheme, bucket, or key).
pub fn parse_s3_uri(uri: &str) -> Result<(&str, &str)> {
    let without_scheme = uri
        .strip_prefix("s3://")
        .with_context(|| format!("Invalid S3 URI: expected 's3://' prefix in '{}'", uri))?;

    without_scheme
        .split_once('/')
        .with_context(|| format!("Invalid S3 URI: expected 's3://bucket/key' format in '{}'", uri))
}

/// Client options for artifact and report traffic.
///
/// Artifacts are small and written one per unit, so the pool is sized for
/// many short requests rather than bulk transfer.
fn create_client_options() -> ClientOptions {
    ClientOptions::new()
        .with_connect_timeout(Duration::from_secs(5))
        .with_timeout(Duration::from_secs(60))
        .with_pool_idle_timeout(Duration::from_secs(90))
        .with_pool_max_idle_per_host(64)
}

/// Retry configuration for transient failures (429 and 5xx).
fn create_retry_config() -> RetryConfig {
    RetryConfig {
        max_retries: 5,
        backoff: object_store::BackoffConfig {
            init_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            base: 2.0,
        },
        retry_timeout: Duration::from_secs(120),
    }
}

/// Create an authenticated S3 client.
///
/// Credentials and region are loaded from (in order):
/// - Environment variables (AWS_ACCESS_KEY_ID, AWS_SECRET_ACCESS_KEY, AWS_REGION)
/// - AWS config files (~/.aws/credentials, ~/.aws/config)
/// - EC2 instance profile (IMDS)
pub fn create_s3_store(bucket: &str) -> Result<Arc<dyn ObjectStore>> {
    tracing::info!("Creating S3 client for bucket: {}", bucket);

    let builder = AmazonS3Builder::from_env()
        .with_bucket_name(bucket)
        .with_client_options(create_client_options())
        .with_retry(create_retry_config())
        .with_virtual_hosted_style_request(true);

    Ok(Arc::new(builder.build()?))
}

/// Create the store for artifacts and reports.
/// Uses LocalFileSystem if local_path is set, otherwise S3 with credentials.
pub fn create_output_store(output: &OutputConfig) -> Result<Arc<dyn ObjectStore>> {
    match (&output.local_path, &output.bucket) {
        (Some(local_path), _) => {
            let path = std::path::Path::new(local_path);
            if !path.exists() {
                std::fs::create_dir_all(path)?;
            }
            tracing::info!("Creating LocalFileSystem store at: {}", path.display());
            Ok(Arc::new(LocalFileSystem::new_with_prefix(path)?))
        }
        (_, Some(bucket)) => create_s3_store(bucket),
        _ => anyhow::bail!("Invalid config: no output destination"),
    }
}

/// Object key prefix under the output store.
/// Empty for local output, since the path is baked into the store.
pub fn get_output_prefix(output: &OutputConfig) -> &str {
    if output.is_local() {
        ""
    } else {
        output.prefix().unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_s3_store() {
        assert!(create_s3_store("test-bucket").is_ok());
    }

    #[test]
    fn test_local_output_store() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nested/out");
        let output = OutputConfig {
            local_path: Some(target.to_string_lossy().into_owned()),
            bucket: None,
            prefix: None,
        };

        assert!(create_output_store(&output).is_ok());
        assert!(target.exists());
        assert_eq!(get_output_prefix(&output), "");
    }

    #[test]
    fn test_s3_output_prefix() {
        let output = OutputConfig {
            local_path: None,
            bucket: Some("bucket".into()),
            prefix: Some("runs/7".into()),
        };
        assert_eq!(get_output_prefix(&output), "runs/7");
    }

    #[test]
    fn test_parse_s3_uri() {
        let (bucket, key) = parse_s3_uri("s3://my-bucket/samples/barcode01.tsv").unwrap();
        assert_eq!(bucket, "my-bucket");
        assert_eq!(key, "samples/barcode01.tsv");

        let (bucket, key) = parse_s3_uri("s3://bucket/file.tsv").unwrap();
        assert_eq!(bucket, "bucket");
        assert_eq!(key, "file.tsv");
    }

    #[test]
    fn test_parse_s3_uri_invalid() {
        assert!(parse_s3_uri("bucket/key").is_err());
        assert!(parse_s3_uri("http://bucket/key").is_err());
        assert!(parse_s3_uri("s3://bucket").is_err());
    }
}
