//! Engine test utilities.

#![allow(dead_code)]

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use keyrelay_core::config::{
    AppConfig, CertificateConfig, GatewayConfig, KeySource, PeerServerConfig,
};
use keyrelay_core::validity::rolling_interval_number;
use keyrelay_core::{ExposureKey, KeyData, ReportType};
use keyrelay_engine::EngineState;
use keyrelay_metadata::{MetadataStore, SqliteStore};
use keyrelay_storage::{FilesystemBackend, ObjectStore};
use std::net::TcpListener;
use std::sync::Arc;
use tempfile::TempDir;
use time::{Duration, OffsetDateTime};

pub fn can_bind_localhost() -> bool {
    TcpListener::bind("127.0.0.1:0").is_ok()
}

/// Engine state over a temporary SQLite key store and filesystem export store.
pub struct TestEngine {
    pub state: EngineState,
    pub sqlite: Arc<SqliteStore>,
    _temp_dir: TempDir,
}

impl TestEngine {
    pub async fn new(config: AppConfig) -> Self {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let sqlite = Arc::new(
            SqliteStore::new(temp_dir.path().join("keys.db"))
                .await
                .expect("Failed to open key store"),
        );
        let metadata: Arc<dyn MetadataStore> = sqlite.clone();
        let storage: Arc<dyn ObjectStore> = Arc::new(
            FilesystemBackend::new(temp_dir.path().join("out"))
                .await
                .expect("Failed to open export store"),
        );
        Self {
            state: EngineState::new(config, metadata, storage),
            sqlite,
            _temp_dir: temp_dir,
        }
    }

    pub fn store(&self) -> &dyn MetadataStore {
        self.state.metadata.as_ref()
    }
}

/// Base64 of a 16-byte key filled with `byte`.
pub fn key_b64(byte: u8) -> String {
    STANDARD.encode([byte; 16])
}

/// A local key whose broadcast window closed `days_ago` days before `now`.
pub fn expired_key(byte: u8, now: OffsetDateTime, days_ago: i64) -> ExposureKey {
    ExposureKey::local(
        KeyData::from_bytes(&[byte; 16]).expect("valid key"),
        rolling_interval_number(now - Duration::days(days_ago)),
        vec!["IE".to_string()],
    )
}

/// A local key that is still being broadcast at `now`.
pub fn valid_key(byte: u8, now: OffsetDateTime) -> ExposureKey {
    ExposureKey::local(
        KeyData::from_bytes(&[byte; 16]).expect("valid key"),
        rolling_interval_number(now),
        vec!["IE".to_string()],
    )
}

pub fn peer_config(id: &str, url: &str) -> PeerServerConfig {
    PeerServerConfig {
        id: id.to_string(),
        url: url.to_string(),
        token: "peer-token".to_string(),
        max_age_days: 14,
        private_key: KeySource::Generate,
    }
}

/// A throwaway certificate and key, inline.
pub fn certificate(name: &str) -> CertificateConfig {
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec![name.to_string()])
            .expect("Failed to generate certificate");
    CertificateConfig {
        cert: KeySource::Value { value: cert.pem() },
        key: KeySource::Value {
            value: key_pair.serialize_pem(),
        },
    }
}

pub fn gateway_config(url: &str, download: bool, upload: bool) -> GatewayConfig {
    GatewayConfig {
        url: url.to_string(),
        download,
        upload,
        auth: certificate("efgs-auth.test"),
        sign: Some(certificate("efgs-sign.test")),
        origin: "IE".to_string(),
        visited_countries: vec!["DE".to_string(), "FR".to_string()],
        accepted_report_types: vec![ReportType::ConfirmedTest],
    }
}
