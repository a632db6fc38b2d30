//! Exposure repository trait.

use crate::error::MetadataResult;
use crate::models::ExposureRow;
use async_trait::async_trait;
use keyrelay_core::ExposureKey;
use time::OffsetDateTime;

/// Repository for temporary exposure keys.
#[async_trait]
pub trait ExposureRepo: Send + Sync {
    /// Insert keys, silently skipping any whose `key_data` already exists.
    /// Returns the number of rows actually inserted.
    async fn insert_exposures(
        &self,
        exposures: &[ExposureKey],
        created_at: OffsetDateTime,
    ) -> MetadataResult<u64>;

    /// Get a key by its base64 key material.
    async fn get_exposure_by_key(&self, key_data: &str) -> MetadataResult<Option<ExposureRow>>;

    /// Locally generated keys (`origin IS NULL`) with id above `after_id`, ascending by id.
    async fn get_local_exposures_after(
        &self,
        after_id: i64,
        limit: i64,
    ) -> MetadataResult<Vec<ExposureRow>>;

    /// Keys with id above `after_id`, optionally created before `created_before`,
    /// ordered by key material.
    async fn get_exposures_for_export(
        &self,
        after_id: i64,
        created_before: Option<OffsetDateTime>,
    ) -> MetadataResult<Vec<ExposureRow>>;

    /// Lowest id among keys created at or after `since`.
    async fn min_exposure_id_since(&self, since: OffsetDateTime) -> MetadataResult<Option<i64>>;

    /// Delete a key and re-insert it with identical fields and a fresh
    /// `created_at`, atomically. Returns the new id, or `None` if the key
    /// no longer exists.
    async fn defer_exposure(
        &self,
        id: i64,
        created_at: OffsetDateTime,
    ) -> MetadataResult<Option<i64>>;

    /// Delete keys created before `cutoff`. Returns the highest deleted id.
    async fn delete_exposures_created_before(
        &self,
        cutoff: OffsetDateTime,
    ) -> MetadataResult<Option<i64>>;

    /// Total number of stored keys.
    async fn count_exposures(&self) -> MetadataResult<i64>;
}
