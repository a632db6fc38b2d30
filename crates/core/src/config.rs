//! Configuration types shared across crates.

use crate::ReportType;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Storage backend configuration for export archives.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Local filesystem storage (non-production).
    Filesystem {
        /// Root directory for export archives.
        path: PathBuf,
    },
    /// S3-compatible storage.
    S3 {
        /// Bucket name.
        bucket: String,
        /// Optional endpoint URL (for MinIO, etc.).
        endpoint: Option<String>,
        /// AWS region.
        region: Option<String>,
        /// Optional key prefix.
        prefix: Option<String>,
        /// AWS access key ID. Falls back to the ambient credential chain if not set.
        access_key_id: Option<String>,
        /// AWS secret access key. Falls back to the ambient credential chain if not set.
        secret_access_key: Option<String>,
        /// Force path-style URLs. Required for MinIO and some S3-compatible services.
        #[serde(default)]
        force_path_style: bool,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Filesystem {
            path: PathBuf::from("./out"),
        }
    }
}

impl StorageConfig {
    /// Validate storage configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            StorageConfig::S3 {
                bucket,
                access_key_id,
                secret_access_key,
                ..
            } => {
                if bucket.is_empty() {
                    return Err("s3 config requires a non-empty bucket".to_string());
                }
                match (access_key_id.as_ref(), secret_access_key.as_ref()) {
                    (Some(_), Some(_)) | (None, None) => Ok(()),
                    _ => Err(
                        "s3 config requires both access_key_id and secret_access_key when either is set"
                            .to_string(),
                    ),
                }
            }
            _ => Ok(()),
        }
    }
}

/// PostgreSQL SSL mode configuration.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PgSslMode {
    Disable,
    #[default]
    Prefer,
    Require,
}

/// Key store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetadataConfig {
    /// SQLite database (local runs and tests).
    Sqlite {
        /// Database file path.
        path: PathBuf,
    },
    /// PostgreSQL database.
    Postgres {
        /// Connection URL. Takes precedence over individual fields.
        url: Option<String>,
        host: Option<String>,
        #[serde(default = "default_pg_port")]
        port: Option<u16>,
        username: Option<String>,
        /// Prefer `KEYRELAY_METADATA__PASSWORD` over storing this in a file.
        password: Option<String>,
        database: Option<String>,
        ssl_mode: Option<PgSslMode>,
        #[serde(default = "default_max_connections")]
        max_connections: u32,
        /// Statement timeout in milliseconds.
        #[serde(default = "default_statement_timeout_ms")]
        statement_timeout_ms: Option<u64>,
    },
}

fn default_max_connections() -> u32 {
    5
}

fn default_pg_port() -> Option<u16> {
    Some(5432)
}

fn default_statement_timeout_ms() -> Option<u64> {
    Some(60_000)
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: PathBuf::from("./data/keyrelay.db"),
        }
    }
}

impl MetadataConfig {
    /// Validate metadata configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            MetadataConfig::Sqlite { .. } => Ok(()),
            MetadataConfig::Postgres {
                url,
                host,
                database,
                ..
            } => match (url.as_ref(), host.as_ref(), database.as_ref()) {
                (Some(_), _, _) => Ok(()),
                (None, Some(_), Some(_)) => Ok(()),
                (None, None, _) => {
                    Err("postgres config requires either 'url' or 'host' + 'database'".to_string())
                }
                (None, Some(_), None) => Err(
                    "postgres config requires 'database' when using individual fields".to_string(),
                ),
            },
        }
    }
}

/// Source of PEM-encoded key or certificate material.
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum KeySource {
    /// Material stored in a file.
    File { path: PathBuf },
    /// Material stored in an environment variable.
    Env { var: String },
    /// Material provided inline (NOT recommended for production).
    Value { value: String },
    /// Generate a throwaway key at startup (development only).
    Generate,
}

impl KeySource {
    /// Load the PEM text, or `None` for [`KeySource::Generate`].
    pub fn resolve(&self) -> crate::Result<Option<String>> {
        match self {
            Self::File { path } => Ok(Some(std::fs::read_to_string(path)?)),
            Self::Env { var } => std::env::var(var)
                .map(Some)
                .map_err(|e| crate::Error::Config(format!("environment variable {var}: {e}"))),
            Self::Value { value } => Ok(Some(value.clone())),
            Self::Generate => Ok(None),
        }
    }

    fn is_generate(&self) -> bool {
        matches!(self, Self::Generate)
    }
}

impl fmt::Debug for KeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File { path } => f.debug_struct("File").field("path", path).finish(),
            Self::Env { var } => f.debug_struct("Env").field("var", var).finish(),
            Self::Value { .. } => write!(f, "Value([REDACTED])"),
            Self::Generate => write!(f, "Generate"),
        }
    }
}

/// A certificate with its private key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CertificateConfig {
    pub cert: KeySource,
    pub key: KeySource,
}

impl CertificateConfig {
    fn validate(&self, section: &str) -> Result<(), String> {
        if self.cert.is_generate() || self.key.is_generate() {
            return Err(format!(
                "{section} requires an existing certificate and key; 'generate' is not supported"
            ));
        }
        Ok(())
    }
}

/// Outbound HTTP client settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HttpClientConfig {
    /// Total request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Connection establishment timeout in seconds.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_connect_timeout_secs() -> u64 {
    10
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl HttpClientConfig {
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_secs)
    }

    pub fn connect_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.timeout_secs == 0 {
            return Err("http.timeout_secs cannot be 0; a hung peer would stall the run".to_string());
        }
        Ok(())
    }
}

/// A peer health-authority server.
#[derive(Clone, Serialize, Deserialize)]
pub struct PeerServerConfig {
    /// Identifier used for cursors and as the origin of keys it sends.
    pub id: String,
    /// Base URL of the peer's federation API.
    pub url: String,
    /// Bearer token presented to the peer.
    pub token: String,
    /// How far back the download date reaches, in days.
    #[serde(default = "default_max_age_days")]
    pub max_age_days: i64,
    /// ES256 key used to sign upload payloads.
    pub private_key: KeySource,
}

/// Upper bound on how far back a peer download may resume.
pub const MAX_PEER_AGE_DAYS: i64 = 365;

fn default_max_age_days() -> i64 {
    14
}

impl fmt::Debug for PeerServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerServerConfig")
            .field("id", &self.id)
            .field("url", &self.url)
            .field("token", &"[REDACTED]")
            .field("max_age_days", &self.max_age_days)
            .field("private_key", &self.private_key)
            .finish()
    }
}

/// Multi-country gateway settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Base URL of the gateway API.
    pub url: String,
    /// Pull keys from the gateway.
    #[serde(default)]
    pub download: bool,
    /// Push local keys to the gateway.
    #[serde(default)]
    pub upload: bool,
    /// Client certificate for mutual TLS.
    pub auth: CertificateConfig,
    /// Certificate used to sign upload batches. Required when `upload` is set.
    pub sign: Option<CertificateConfig>,
    /// Origin country stamped on uploaded keys.
    #[serde(default = "default_origin")]
    pub origin: String,
    /// Visited countries stamped on uploaded keys.
    #[serde(default = "default_visited_countries")]
    pub visited_countries: Vec<String>,
    /// Report types accepted from the gateway.
    #[serde(default = "default_accepted_report_types")]
    pub accepted_report_types: Vec<ReportType>,
}

fn default_origin() -> String {
    "IE".to_string()
}

fn default_visited_countries() -> Vec<String> {
    [
        "AT", "BE", "BG", "HR", "CY", "CZ", "DK", "EE", "FI", "FR", "DE", "GR", "HU", "IE", "IT",
        "LV", "LT", "LU", "MT", "NL", "PL", "PT", "RO", "SK", "SI", "ES", "SE",
    ]
    .iter()
    .map(|c| c.to_string())
    .collect()
}

fn default_accepted_report_types() -> Vec<ReportType> {
    vec![ReportType::ConfirmedTest]
}

impl GatewayConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.url.is_empty() {
            return Err("efgs.url cannot be empty".to_string());
        }
        self.auth.validate("efgs.auth")?;
        match (&self.sign, self.upload) {
            (Some(sign), _) => sign.validate("efgs.sign")?,
            (None, true) => return Err("efgs.upload requires an efgs.sign certificate".to_string()),
            (None, false) => {}
        }
        if self.origin.is_empty() {
            return Err("efgs.origin cannot be empty".to_string());
        }
        Ok(())
    }
}

/// Federation partners.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InteropConfig {
    #[serde(default)]
    pub servers: Vec<PeerServerConfig>,
    pub efgs: Option<GatewayConfig>,
    /// Maximum number of keys pushed per upload batch.
    #[serde(default = "default_upload_page_size")]
    pub upload_page_size: i64,
}

fn default_upload_page_size() -> i64 {
    1000
}

impl Default for InteropConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            efgs: None,
            upload_page_size: default_upload_page_size(),
        }
    }
}

impl InteropConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.upload_page_size <= 0 {
            return Err("interop.upload_page_size must be positive".to_string());
        }
        let mut seen = std::collections::HashSet::new();
        for server in &self.servers {
            if server.id.is_empty() || server.url.is_empty() {
                return Err("interop.servers entries require both 'id' and 'url'".to_string());
            }
            if server.id == crate::GATEWAY_SERVER_ID {
                return Err(format!(
                    "interop server id '{}' is reserved for the gateway",
                    server.id
                ));
            }
            if !seen.insert(server.id.as_str()) {
                return Err(format!("duplicate interop server id '{}'", server.id));
            }
            if !(1..=MAX_PEER_AGE_DAYS).contains(&server.max_age_days) {
                return Err(format!(
                    "interop server '{}' max_age_days must be between 1 and {MAX_PEER_AGE_DAYS}",
                    server.id
                ));
            }
        }
        if let Some(efgs) = &self.efgs {
            efgs.validate()?;
        }
        Ok(())
    }
}

/// Export file generation settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Region that keys without a native region are exported under.
    pub default_region: String,
    /// Regions that get their own export files.
    #[serde(default)]
    pub native_regions: Vec<String>,
    /// App bundle id written into the signature info.
    #[serde(default)]
    pub app_bundle_id: Option<String>,
    /// Signature algorithm OID written into the signature info.
    #[serde(default = "default_signature_algorithm")]
    pub signature_algorithm: String,
    #[serde(default)]
    pub verification_key_id: Option<String>,
    #[serde(default)]
    pub verification_key_version: Option<String>,
    /// ECDSA P-256 key used to sign `export.bin`.
    pub private_key: KeySource,
    /// Minutes added to a key's lifetime before it may be exported.
    #[serde(default)]
    pub variance_offset_mins: i64,
    /// Treat every key as expired.
    #[serde(default)]
    pub disable_valid_key_check: bool,
    /// Age after which keys and covering export files are swept.
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    /// Number of daily windows regenerated on each run.
    #[serde(default = "default_export_days")]
    pub export_days: i64,
}

fn default_signature_algorithm() -> String {
    "1.2.840.10045.4.3.2".to_string()
}

fn default_retention_days() -> i64 {
    crate::RETENTION_DAYS
}

fn default_export_days() -> i64 {
    14
}

impl ExportConfig {
    /// Export settings for tests: generated key, `IE` default region.
    pub fn for_testing() -> Self {
        Self {
            default_region: "IE".to_string(),
            native_regions: vec!["IE".to_string()],
            app_bundle_id: Some("com.example.covidtracker".to_string()),
            signature_algorithm: default_signature_algorithm(),
            verification_key_id: Some("272".to_string()),
            verification_key_version: Some("v1".to_string()),
            private_key: KeySource::Generate,
            variance_offset_mins: 0,
            disable_valid_key_check: false,
            retention_days: default_retention_days(),
            export_days: default_export_days(),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.default_region.is_empty() {
            return Err("exports.default_region cannot be empty".to_string());
        }
        if self.retention_days <= 0 {
            return Err("exports.retention_days must be positive".to_string());
        }
        if !(0..=self.retention_days).contains(&self.export_days) {
            return Err(format!(
                "exports.export_days must be between 0 and retention_days ({})",
                self.retention_days
            ));
        }
        Ok(())
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppConfig {
    /// Key store configuration.
    #[serde(default)]
    pub metadata: MetadataConfig,
    /// Export archive storage configuration.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Outbound HTTP settings.
    #[serde(default)]
    pub http: HttpClientConfig,
    /// Federation partners.
    #[serde(default)]
    pub interop: InteropConfig,
    /// Export generation settings (required).
    pub exports: ExportConfig,
}

impl AppConfig {
    /// Configuration for tests: default stores, no partners, test export settings.
    pub fn for_testing() -> Self {
        Self {
            metadata: MetadataConfig::default(),
            storage: StorageConfig::default(),
            http: HttpClientConfig::default(),
            interop: InteropConfig::default(),
            exports: ExportConfig::for_testing(),
        }
    }

    /// Validate every section, returning the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        self.metadata.validate()?;
        self.storage.validate()?;
        self.http.validate()?;
        self.interop.validate()?;
        self.exports.validate()?;
        Ok(())
    }
}
