//! Database models mapping to the key store schema.

use keyrelay_core::{ExposureKey, KeyData};
use sqlx::FromRow;
use time::OffsetDateTime;

// =============================================================================
// Exposures
// =============================================================================

/// Stored temporary exposure key.
#[derive(Debug, Clone, FromRow)]
pub struct ExposureRow {
    pub id: i64,
    /// Base64 key material, unique across the table.
    pub key_data: String,
    pub rolling_start_number: i32,
    pub rolling_period: i32,
    pub transmission_risk_level: i32,
    /// Comma-separated region codes.
    pub regions: String,
    /// `None` for locally generated keys.
    pub origin: Option<String>,
    pub days_since_onset: i32,
    pub created_at: OffsetDateTime,
}

impl ExposureRow {
    pub fn region_list(&self) -> Vec<String> {
        split_regions(&self.regions)
    }

    /// Decode into the domain type, re-checking the key length.
    pub fn to_exposure_key(&self) -> keyrelay_core::Result<ExposureKey> {
        Ok(ExposureKey {
            key_data: KeyData::from_base64(&self.key_data)?,
            rolling_start_number: self.rolling_start_number,
            rolling_period: self.rolling_period,
            transmission_risk_level: self.transmission_risk_level,
            regions: self.region_list(),
            origin: self.origin.clone(),
            days_since_onset: self.days_since_onset,
        })
    }
}

pub(crate) fn join_regions(regions: &[String]) -> String {
    regions.join(",")
}

pub(crate) fn split_regions(regions: &str) -> Vec<String> {
    regions
        .split(',')
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(str::to_string)
        .collect()
}

// =============================================================================
// Federation batches
// =============================================================================

/// Continuation tag recorded after a successful download page.
#[derive(Debug, Clone, FromRow)]
pub struct DownloadBatchRow {
    pub id: i64,
    pub batch_tag: String,
    pub server_id: String,
    pub created_at: OffsetDateTime,
}

/// Committed upload to a federation destination.
#[derive(Debug, Clone, FromRow)]
pub struct UploadBatchRow {
    pub id: i64,
    pub exposure_count: i32,
    /// Highest local exposure id included in the batch.
    pub last_exposure_id: i64,
    pub server_id: String,
    pub created_at: OffsetDateTime,
}

/// Parameters for opening an upload batch.
#[derive(Debug, Clone)]
pub struct NewUploadBatch {
    pub server_id: String,
    pub exposure_count: i32,
    pub last_exposure_id: i64,
    pub created_at: OffsetDateTime,
}

// =============================================================================
// Export files
// =============================================================================

/// Generated export archive covering the key id range `(since, last]`.
#[derive(Debug, Clone, FromRow)]
pub struct ExportFileRow {
    pub id: i64,
    /// Object store key of the archive.
    pub path: String,
    pub exposure_count: i32,
    pub since_exposure_id: i64,
    pub last_exposure_id: i64,
    pub first_exposure_created_at: OffsetDateTime,
    pub region: String,
    pub created_at: OffsetDateTime,
}

/// Parameters for recording an export archive.
#[derive(Debug, Clone)]
pub struct NewExportFile {
    pub path: String,
    pub exposure_count: i32,
    pub since_exposure_id: i64,
    pub last_exposure_id: i64,
    pub first_exposure_created_at: OffsetDateTime,
    pub region: String,
    pub created_at: OffsetDateTime,
}
