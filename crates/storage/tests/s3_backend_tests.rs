//! S3 backend tests against a MinIO container.
//!
//! Require Docker. Set SKIP_S3_TESTS=1 to skip.

use aws_config::BehaviorVersion;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::Credentials;
use bytes::Bytes;
use keyrelay_storage::{ObjectStore, S3Backend, StorageError};
use testcontainers::core::{IntoContainerPort, WaitFor};
use testcontainers::{ContainerAsync, GenericImage, ImageExt, runners::AsyncRunner};

const MINIO_IMAGE: &str = "minio/minio";
const MINIO_TAG: &str = "RELEASE.2024-02-12T21-36-45Z";
const BUCKET: &str = "keyrelay-test";

fn should_skip_s3_tests() -> bool {
    std::env::var("SKIP_S3_TESTS").is_ok()
}

struct MinioHarness {
    _container: ContainerAsync<GenericImage>,
    backend: S3Backend,
}

impl MinioHarness {
    async fn new(prefix: Option<String>) -> Result<Self, String> {
        let access_key = "minio-access-key";
        let secret_key = "minio-secret-key";

        let container = GenericImage::new(MINIO_IMAGE, MINIO_TAG)
            .with_exposed_port(9000.tcp())
            .with_wait_for(WaitFor::message_on_stdout("API:"))
            .with_env_var("MINIO_ROOT_USER", access_key)
            .with_env_var("MINIO_ROOT_PASSWORD", secret_key)
            .with_cmd(vec!["server", "/data"])
            .start()
            .await
            .map_err(|e| format!("failed to start MinIO container: {e}"))?;

        let host = container
            .get_host()
            .await
            .map_err(|e| format!("failed to get host: {e}"))?;
        let port = container
            .get_host_port_ipv4(9000.tcp())
            .await
            .map_err(|e| format!("failed to get port: {e}"))?;
        let endpoint = format!("http://{host}:{port}");

        let config = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(aws_config::Region::new("eu-west-1"))
            .credentials_provider(Credentials::new(access_key, secret_key, None, None, "test"))
            .http_client(aws_smithy_http_client::Builder::new().build_http())
            .endpoint_url(endpoint.clone())
            .force_path_style(true)
            .build();
        Client::from_conf(config)
            .create_bucket()
            .bucket(BUCKET)
            .send()
            .await
            .map_err(|e| format!("failed to create bucket: {e}"))?;

        let backend = S3Backend::new(
            BUCKET,
            Some(endpoint),
            Some("eu-west-1".to_string()),
            prefix,
            Some(access_key.to_string()),
            Some(secret_key.to_string()),
            true,
        )
        .await
        .map_err(|e| format!("failed to create S3 backend: {e}"))?;

        Ok(Self {
            _container: container,
            backend,
        })
    }
}

#[tokio::test]
async fn test_s3_export_archive_lifecycle() {
    if should_skip_s3_tests() {
        return;
    }

    let harness = match MinioHarness::new(Some("prefix".to_string())).await {
        Ok(harness) => harness,
        Err(err) => {
            eprintln!("Skipping S3 test: {err}");
            return;
        }
    };
    let backend = &harness.backend;

    backend.health_check().await.unwrap();

    backend
        .put("exposures/ie/1.zip", Bytes::from_static(b"one"))
        .await
        .unwrap();
    backend
        .put("exposures/ie/2.zip", Bytes::from_static(b"two"))
        .await
        .unwrap();
    backend
        .put("exposures/gb/3.zip", Bytes::from_static(b"three"))
        .await
        .unwrap();

    let mut ie = backend.list("exposures/ie/").await.unwrap();
    ie.sort();
    assert_eq!(ie, vec!["exposures/ie/1.zip", "exposures/ie/2.zip"]);
    assert_eq!(
        backend.get("exposures/gb/3.zip").await.unwrap(),
        Bytes::from_static(b"three")
    );

    backend.delete("exposures/ie/1.zip").await.unwrap();
    assert!(!backend.exists("exposures/ie/1.zip").await.unwrap());
    assert!(matches!(
        backend.delete("exposures/ie/1.zip").await,
        Err(StorageError::NotFound(_))
    ));
    assert!(matches!(
        backend.get("exposures/ie/1.zip").await,
        Err(StorageError::NotFound(_))
    ));
}
