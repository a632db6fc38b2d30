//! Key store trait and SQLite implementation.

use crate::error::MetadataResult;
use crate::repos::{BatchRepo, ExportFileRepo, ExposureRepo, MetricRepo};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Combined key store trait.
#[async_trait]
pub trait MetadataStore:
    ExposureRepo + BatchRepo + ExportFileRepo + MetricRepo + Send + Sync
{
    /// Run database migrations.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check database connectivity and health.
    async fn health_check(&self) -> MetadataResult<()>;
}

/// SQLite-based key store.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Open (creating if needed) a SQLite store and apply the schema.
    pub async fn new(path: impl AsRef<Path>) -> MetadataResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        // A single connection serializes writers. Callers must not issue pool
        // queries while holding an open upload batch transaction.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;

        tracing::debug!(path = %path.display(), "Opened SQLite key store");
        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

mod sqlite_impl {
    use super::*;
    use crate::models::*;
    use crate::repos::PendingUploadBatch;
    use keyrelay_core::ExposureKey;
    use sqlx::SqliteConnection;
    use time::{Date, OffsetDateTime, UtcOffset};

    /// Timestamps are stored as text and compared lexically, so every bound
    /// value is normalized to UTC with whole seconds.
    fn db_timestamp(at: OffsetDateTime) -> OffsetDateTime {
        let at = at.to_offset(UtcOffset::UTC);
        at.replace_nanosecond(0).unwrap_or(at)
    }

    async fn insert_exposure_rows(
        conn: &mut SqliteConnection,
        exposures: &[ExposureKey],
        created_at: OffsetDateTime,
    ) -> MetadataResult<u64> {
        let mut inserted = 0;
        for key in exposures {
            let result = sqlx::query(
                r#"
                INSERT INTO exposures (
                    key_data, rolling_start_number, rolling_period,
                    transmission_risk_level, regions, origin,
                    days_since_onset, created_at
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (key_data) DO NOTHING
                "#,
            )
            .bind(key.key_data.to_base64())
            .bind(key.rolling_start_number)
            .bind(key.rolling_period)
            .bind(key.transmission_risk_level)
            .bind(join_regions(&key.regions))
            .bind(key.origin.as_deref())
            .bind(key.days_since_onset)
            .bind(db_timestamp(created_at))
            .execute(&mut *conn)
            .await?;
            inserted += result.rows_affected();
        }
        Ok(inserted)
    }

    #[async_trait]
    impl ExposureRepo for SqliteStore {
        async fn insert_exposures(
            &self,
            exposures: &[ExposureKey],
            created_at: OffsetDateTime,
        ) -> MetadataResult<u64> {
            let mut tx = self.pool.begin().await?;
            let inserted = insert_exposure_rows(&mut tx, exposures, created_at).await?;
            tx.commit().await?;
            Ok(inserted)
        }

        async fn get_exposure_by_key(&self, key_data: &str) -> MetadataResult<Option<ExposureRow>> {
            let row = sqlx::query_as::<_, ExposureRow>(
                r#"
                SELECT id, key_data, rolling_start_number, rolling_period,
                       transmission_risk_level, regions, origin,
                       days_since_onset, created_at
                FROM exposures
                WHERE key_data = ?
                "#,
            )
            .bind(key_data)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn get_local_exposures_after(
            &self,
            after_id: i64,
            limit: i64,
        ) -> MetadataResult<Vec<ExposureRow>> {
            let rows = sqlx::query_as::<_, ExposureRow>(
                r#"
                SELECT id, key_data, rolling_start_number, rolling_period,
                       transmission_risk_level, regions, origin,
                       days_since_onset, created_at
                FROM exposures
                WHERE id > ? AND origin IS NULL
                ORDER BY id ASC
                LIMIT ?
                "#,
            )
            .bind(after_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn get_exposures_for_export(
            &self,
            after_id: i64,
            created_before: Option<OffsetDateTime>,
        ) -> MetadataResult<Vec<ExposureRow>> {
            let rows = match created_before {
                Some(end) => {
                    sqlx::query_as::<_, ExposureRow>(
                        r#"
                        SELECT id, key_data, rolling_start_number, rolling_period,
                               transmission_risk_level, regions, origin,
                               days_since_onset, created_at
                        FROM exposures
                        WHERE id > ? AND created_at < ?
                        ORDER BY key_data ASC
                        "#,
                    )
                    .bind(after_id)
                    .bind(db_timestamp(end))
                    .fetch_all(&self.pool)
                    .await?
                }
                None => {
                    sqlx::query_as::<_, ExposureRow>(
                        r#"
                        SELECT id, key_data, rolling_start_number, rolling_period,
                               transmission_risk_level, regions, origin,
                               days_since_onset, created_at
                        FROM exposures
                        WHERE id > ?
                        ORDER BY key_data ASC
                        "#,
                    )
                    .bind(after_id)
                    .fetch_all(&self.pool)
                    .await?
                }
            };
            Ok(rows)
        }

        async fn min_exposure_id_since(
            &self,
            since: OffsetDateTime,
        ) -> MetadataResult<Option<i64>> {
            let id: Option<i64> =
                sqlx::query_scalar("SELECT MIN(id) FROM exposures WHERE created_at >= ?")
                    .bind(db_timestamp(since))
                    .fetch_one(&self.pool)
                    .await?;
            Ok(id)
        }

        async fn defer_exposure(
            &self,
            id: i64,
            created_at: OffsetDateTime,
        ) -> MetadataResult<Option<i64>> {
            let mut tx = self.pool.begin().await?;

            let row = sqlx::query_as::<_, ExposureRow>(
                r#"
                SELECT id, key_data, rolling_start_number, rolling_period,
                       transmission_risk_level, regions, origin,
                       days_since_onset, created_at
                FROM exposures
                WHERE id = ?
                "#,
            )
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;

            let Some(row) = row else {
                tx.rollback().await?;
                return Ok(None);
            };

            sqlx::query("DELETE FROM exposures WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;

            let result = sqlx::query(
                r#"
                INSERT INTO exposures (
                    key_data, rolling_start_number, rolling_period,
                    transmission_risk_level, regions, origin,
                    days_since_onset, created_at
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&row.key_data)
            .bind(row.rolling_start_number)
            .bind(row.rolling_period)
            .bind(row.transmission_risk_level)
            .bind(&row.regions)
            .bind(row.origin.as_deref())
            .bind(row.days_since_onset)
            .bind(db_timestamp(created_at))
            .execute(&mut *tx)
            .await?;
            let new_id = result.last_insert_rowid();

            tx.commit().await?;
            Ok(Some(new_id))
        }

        async fn delete_exposures_created_before(
            &self,
            cutoff: OffsetDateTime,
        ) -> MetadataResult<Option<i64>> {
            let mut tx = self.pool.begin().await?;
            let max_id: Option<i64> =
                sqlx::query_scalar("SELECT MAX(id) FROM exposures WHERE created_at < ?")
                    .bind(db_timestamp(cutoff))
                    .fetch_one(&mut *tx)
                    .await?;
            sqlx::query("DELETE FROM exposures WHERE created_at < ?")
                .bind(db_timestamp(cutoff))
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok(max_id)
        }

        async fn count_exposures(&self) -> MetadataResult<i64> {
            let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM exposures")
                .fetch_one(&self.pool)
                .await?;
            Ok(count)
        }
    }

    struct SqlitePendingUploadBatch {
        tx: sqlx::Transaction<'static, Sqlite>,
        batch_id: i64,
    }

    #[async_trait]
    impl PendingUploadBatch for SqlitePendingUploadBatch {
        fn batch_id(&self) -> i64 {
            self.batch_id
        }

        async fn commit(self: Box<Self>) -> MetadataResult<()> {
            self.tx.commit().await?;
            Ok(())
        }

        async fn rollback(self: Box<Self>) -> MetadataResult<()> {
            self.tx.rollback().await?;
            Ok(())
        }
    }

    #[async_trait]
    impl BatchRepo for SqliteStore {
        async fn latest_download_batch(
            &self,
            server_id: &str,
            since: Option<OffsetDateTime>,
        ) -> MetadataResult<Option<DownloadBatchRow>> {
            let row = match since {
                Some(since) => {
                    sqlx::query_as::<_, DownloadBatchRow>(
                        r#"
                        SELECT id, batch_tag, server_id, created_at
                        FROM download_batches
                        WHERE server_id = ? AND created_at >= ?
                        ORDER BY id DESC
                        LIMIT 1
                        "#,
                    )
                    .bind(server_id)
                    .bind(db_timestamp(since))
                    .fetch_optional(&self.pool)
                    .await?
                }
                None => {
                    sqlx::query_as::<_, DownloadBatchRow>(
                        r#"
                        SELECT id, batch_tag, server_id, created_at
                        FROM download_batches
                        WHERE server_id = ?
                        ORDER BY id DESC
                        LIMIT 1
                        "#,
                    )
                    .bind(server_id)
                    .fetch_optional(&self.pool)
                    .await?
                }
            };
            Ok(row)
        }

        async fn ingest_download_batch(
            &self,
            server_id: &str,
            batch_tag: Option<&str>,
            exposures: &[ExposureKey],
            created_at: OffsetDateTime,
        ) -> MetadataResult<u64> {
            let mut tx = self.pool.begin().await?;
            let inserted = insert_exposure_rows(&mut tx, exposures, created_at).await?;

            if let Some(tag) = batch_tag {
                sqlx::query(
                    "INSERT INTO download_batches (batch_tag, server_id, created_at) VALUES (?, ?, ?)",
                )
                .bind(tag)
                .bind(server_id)
                .bind(db_timestamp(created_at))
                .execute(&mut *tx)
                .await?;
            }

            tx.commit().await?;
            Ok(inserted)
        }

        async fn last_uploaded_exposure_id(&self, server_id: &str) -> MetadataResult<i64> {
            let id: i64 = sqlx::query_scalar(
                "SELECT COALESCE(MAX(last_exposure_id), 0) FROM upload_batches WHERE server_id = ?",
            )
            .bind(server_id)
            .fetch_one(&self.pool)
            .await?;
            Ok(id)
        }

        async fn begin_upload_batch(
            &self,
            batch: &NewUploadBatch,
        ) -> MetadataResult<Box<dyn PendingUploadBatch>> {
            let mut tx = self.pool.begin().await?;
            let result = sqlx::query(
                r#"
                INSERT INTO upload_batches (exposure_count, last_exposure_id, server_id, created_at)
                VALUES (?, ?, ?, ?)
                "#,
            )
            .bind(batch.exposure_count)
            .bind(batch.last_exposure_id)
            .bind(&batch.server_id)
            .bind(db_timestamp(batch.created_at))
            .execute(&mut *tx)
            .await?;
            let batch_id = result.last_insert_rowid();

            Ok(Box::new(SqlitePendingUploadBatch { tx, batch_id }))
        }

        async fn list_upload_batches(&self, server_id: &str) -> MetadataResult<Vec<UploadBatchRow>> {
            let rows = sqlx::query_as::<_, UploadBatchRow>(
                r#"
                SELECT id, exposure_count, last_exposure_id, server_id, created_at
                FROM upload_batches
                WHERE server_id = ?
                ORDER BY id ASC
                "#,
            )
            .bind(server_id)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }
    }

    #[async_trait]
    impl ExportFileRepo for SqliteStore {
        async fn max_exported_exposure_id_before(
            &self,
            created_before: OffsetDateTime,
        ) -> MetadataResult<i64> {
            let id: i64 = sqlx::query_scalar(
                "SELECT COALESCE(MAX(last_exposure_id), 0) FROM exposure_export_files WHERE created_at < ?",
            )
            .bind(db_timestamp(created_before))
            .fetch_one(&self.pool)
            .await?;
            Ok(id)
        }

        async fn export_file_exists(
            &self,
            since_exposure_id: i64,
            last_exposure_id: i64,
            region: &str,
        ) -> MetadataResult<bool> {
            let exists: bool = sqlx::query_scalar(
                r#"
                SELECT EXISTS(
                    SELECT 1 FROM exposure_export_files
                    WHERE since_exposure_id = ? AND last_exposure_id = ? AND region = ?
                )
                "#,
            )
            .bind(since_exposure_id)
            .bind(last_exposure_id)
            .bind(region)
            .fetch_one(&self.pool)
            .await?;
            Ok(exists)
        }

        async fn create_export_file(&self, file: &NewExportFile) -> MetadataResult<bool> {
            let result = sqlx::query(
                r#"
                INSERT INTO exposure_export_files (
                    path, exposure_count, since_exposure_id, last_exposure_id,
                    first_exposure_created_at, region, created_at
                )
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (since_exposure_id, last_exposure_id, region) DO NOTHING
                "#,
            )
            .bind(&file.path)
            .bind(file.exposure_count)
            .bind(file.since_exposure_id)
            .bind(file.last_exposure_id)
            .bind(db_timestamp(file.first_exposure_created_at))
            .bind(&file.region)
            .bind(db_timestamp(file.created_at))
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn delete_export_files_through(
            &self,
            last_exposure_id: i64,
        ) -> MetadataResult<Vec<ExportFileRow>> {
            let mut tx = self.pool.begin().await?;
            let rows = sqlx::query_as::<_, ExportFileRow>(
                r#"
                SELECT id, path, exposure_count, since_exposure_id, last_exposure_id,
                       first_exposure_created_at, region, created_at
                FROM exposure_export_files
                WHERE last_exposure_id <= ?
                ORDER BY id ASC
                "#,
            )
            .bind(last_exposure_id)
            .fetch_all(&mut *tx)
            .await?;
            sqlx::query("DELETE FROM exposure_export_files WHERE last_exposure_id <= ?")
                .bind(last_exposure_id)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok(rows)
        }

        async fn list_export_files(&self) -> MetadataResult<Vec<ExportFileRow>> {
            let rows = sqlx::query_as::<_, ExportFileRow>(
                r#"
                SELECT id, path, exposure_count, since_exposure_id, last_exposure_id,
                       first_exposure_created_at, region, created_at
                FROM exposure_export_files
                ORDER BY id ASC
                "#,
            )
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }
    }

    #[async_trait]
    impl MetricRepo for SqliteStore {
        async fn record_metric(
            &self,
            date: Date,
            event: &str,
            os: &str,
            version: &str,
            value: i64,
        ) -> MetadataResult<()> {
            sqlx::query(
                r#"
                INSERT INTO metrics (date, event, os, version, value)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT (date, event, os, version)
                DO UPDATE SET value = metrics.value + excluded.value
                "#,
            )
            .bind(date)
            .bind(event)
            .bind(os)
            .bind(version)
            .bind(value)
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn get_metric(
            &self,
            date: Date,
            event: &str,
            os: &str,
            version: &str,
        ) -> MetadataResult<Option<i64>> {
            let value: Option<i64> = sqlx::query_scalar(
                "SELECT value FROM metrics WHERE date = ? AND event = ? AND os = ? AND version = ?",
            )
            .bind(date)
            .bind(event)
            .bind(os)
            .bind(version)
            .fetch_optional(&self.pool)
            .await?;
            Ok(value)
        }
    }
}

/// SQLite schema. `AUTOINCREMENT` keeps ids monotonic across deletes, which
/// the export and upload cursors rely on.
const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS exposures (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    key_data TEXT NOT NULL UNIQUE,
    rolling_start_number INTEGER NOT NULL,
    rolling_period INTEGER NOT NULL DEFAULT 144,
    transmission_risk_level INTEGER NOT NULL DEFAULT 0,
    regions TEXT NOT NULL DEFAULT '',
    origin TEXT,
    days_since_onset INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_exposures_created_at ON exposures(created_at);
CREATE INDEX IF NOT EXISTS idx_exposures_origin_id ON exposures(origin, id);

CREATE TABLE IF NOT EXISTS download_batches (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    batch_tag TEXT NOT NULL,
    server_id TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_download_batches_server ON download_batches(server_id, id);

CREATE TABLE IF NOT EXISTS upload_batches (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    exposure_count INTEGER NOT NULL,
    last_exposure_id INTEGER NOT NULL,
    server_id TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_upload_batches_server ON upload_batches(server_id, last_exposure_id);

CREATE TABLE IF NOT EXISTS exposure_export_files (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    path TEXT NOT NULL,
    exposure_count INTEGER NOT NULL,
    since_exposure_id INTEGER NOT NULL,
    last_exposure_id INTEGER NOT NULL,
    first_exposure_created_at TEXT NOT NULL,
    region TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE (since_exposure_id, last_exposure_id, region)
);
CREATE INDEX IF NOT EXISTS idx_export_files_created_at ON exposure_export_files(created_at);

CREATE TABLE IF NOT EXISTS metrics (
    date TEXT NOT NULL,
    event TEXT NOT NULL,
    os TEXT NOT NULL DEFAULT '',
    version TEXT NOT NULL DEFAULT '',
    value INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (date, event, os, version)
);
"#;
