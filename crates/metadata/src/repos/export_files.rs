//! Export file repository trait.

use crate::error::MetadataResult;
use crate::models::{ExportFileRow, NewExportFile};
use async_trait::async_trait;
use time::OffsetDateTime;

/// Repository for generated export file records.
#[async_trait]
pub trait ExportFileRepo: Send + Sync {
    /// Highest `last_exposure_id` among files created before `created_before` (0 if none).
    async fn max_exported_exposure_id_before(
        &self,
        created_before: OffsetDateTime,
    ) -> MetadataResult<i64>;

    /// Whether a file already covers exactly this key range and region.
    async fn export_file_exists(
        &self,
        since_exposure_id: i64,
        last_exposure_id: i64,
        region: &str,
    ) -> MetadataResult<bool>;

    /// Record a generated file. Returns false if the `(since, last, region)`
    /// triple was already recorded.
    async fn create_export_file(&self, file: &NewExportFile) -> MetadataResult<bool>;

    /// Delete every file whose `last_exposure_id` is at or below the given id,
    /// returning the deleted rows.
    async fn delete_export_files_through(
        &self,
        last_exposure_id: i64,
    ) -> MetadataResult<Vec<ExportFileRow>>;

    /// All recorded files, oldest first.
    async fn list_export_files(&self) -> MetadataResult<Vec<ExportFileRow>>;
}
