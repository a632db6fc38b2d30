//! Federation cursor repository trait.
//!
//! Download cursors are the batch tags most recently recorded per source;
//! upload cursors are the highest exposure id recorded per destination. Both
//! are only ever written in the same transaction as the data they gate.

use crate::error::MetadataResult;
use crate::models::{DownloadBatchRow, NewUploadBatch, UploadBatchRow};
use async_trait::async_trait;
use keyrelay_core::ExposureKey;
use time::OffsetDateTime;

/// An upload batch row inserted inside an open transaction.
///
/// The cursor only advances for other readers once [`commit`] succeeds.
/// Dropping without committing rolls the transaction back.
///
/// [`commit`]: PendingUploadBatch::commit
#[async_trait]
pub trait PendingUploadBatch: Send {
    /// Id of the inserted row, used as the outbound batch tag.
    fn batch_id(&self) -> i64;

    /// Commit the batch, advancing the destination's cursor.
    async fn commit(self: Box<Self>) -> MetadataResult<()>;

    /// Roll back the batch, leaving the cursor unchanged.
    async fn rollback(self: Box<Self>) -> MetadataResult<()>;
}

/// Repository for download and upload batch provenance.
#[async_trait]
pub trait BatchRepo: Send + Sync {
    /// Most recent download batch for `server_id`, optionally only among
    /// batches recorded at or after `since`.
    async fn latest_download_batch(
        &self,
        server_id: &str,
        since: Option<OffsetDateTime>,
    ) -> MetadataResult<Option<DownloadBatchRow>>;

    /// Insert a downloaded batch's keys and record its continuation tag in
    /// one transaction. Returns the number of keys actually inserted.
    async fn ingest_download_batch(
        &self,
        server_id: &str,
        batch_tag: Option<&str>,
        exposures: &[ExposureKey],
        created_at: OffsetDateTime,
    ) -> MetadataResult<u64>;

    /// Highest exposure id already uploaded to `server_id` (0 if none).
    async fn last_uploaded_exposure_id(&self, server_id: &str) -> MetadataResult<i64>;

    /// Open a transaction and insert an upload batch row in it.
    async fn begin_upload_batch(
        &self,
        batch: &NewUploadBatch,
    ) -> MetadataResult<Box<dyn PendingUploadBatch>>;

    /// Committed upload batches for `server_id`, oldest first.
    async fn list_upload_batches(&self, server_id: &str) -> MetadataResult<Vec<UploadBatchRow>>;
}
