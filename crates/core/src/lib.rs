//! Core domain types and shared logic for keyrelay.
//!
//! This crate defines the data model used by every other crate:
//! - Temporary exposure keys and their epidemiological metadata
//! - The validity filter deciding when a key may leave the service
//! - Federation wire shapes for peer servers and the gateway
//! - The gateway batch signing record layout
//! - Configuration types

pub mod batch_record;
pub mod config;
pub mod error;
pub mod exposure;
pub mod federation;
pub mod validity;

pub use batch_record::{RECORD_LAYOUT, RecordField, batch_signing_bytes};
pub use error::{Error, Result};
pub use exposure::{ExposureKey, KeyData, ReportType};
pub use federation::{FederatedKey, GatewayKey, GatewayKeyProfile, PeerKey};
pub use validity::{ValidityFilter, is_still_valid};

/// Length of raw temporary exposure key material in bytes.
pub const KEY_DATA_LEN: usize = 16;

/// Default number of 10-minute intervals a key stays valid for.
pub const DEFAULT_ROLLING_PERIOD: i32 = 144;

/// Length of one rolling interval in seconds.
pub const ROLLING_INTERVAL_SECS: i64 = 600;

/// Days after which keys and the export files covering them are swept.
pub const RETENTION_DAYS: i64 = 14;

/// Server id used for the multi-country gateway in cursor tables.
pub const GATEWAY_SERVER_ID: &str = "efgs";

/// Metric events written to the `metrics` table.
pub mod events {
    pub const INTEROP_KEYS_DOWNLOADED: &str = "INTEROP_KEYS_DOWNLOADED";
    pub const INTEROP_KEYS_UPLOADED: &str = "INTEROP_KEYS_UPLOADED";
    pub const EFGS_KEYS_DOWNLOADED: &str = "EFGS_KEYS_DOWNLOADED";
    pub const EFGS_KEYS_UPLOADED: &str = "EFGS_KEYS_UPLOADED";
}
