//! PostgreSQL-based key store implementation.

use crate::error::MetadataResult;
use crate::models::*;
use crate::repos::{BatchRepo, ExportFileRepo, ExposureRepo, MetricRepo, PendingUploadBatch};
use crate::store::MetadataStore;
use async_trait::async_trait;
use keyrelay_core::ExposureKey;
use keyrelay_core::config::PgSslMode;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode as SqlxPgSslMode};
use sqlx::{PgConnection, Pool, Postgres};
use std::str::FromStr;
use time::{Date, OffsetDateTime};

/// PostgreSQL schema (embedded).
const POSTGRES_SCHEMA: &str = include_str!("postgres_schema.sql");

fn postgres_schema_statements(schema: &str) -> Vec<&str> {
    schema
        .split(';')
        .filter_map(|statement| {
            let trimmed = statement.trim();
            if trimmed.is_empty() {
                return None;
            }
            let has_sql = trimmed.lines().any(|line| {
                let line = line.trim();
                !line.is_empty() && !line.starts_with("--")
            });
            has_sql.then_some(trimmed)
        })
        .collect()
}

/// PostgreSQL-based key store.
pub struct PostgresStore {
    pool: Pool<Postgres>,
}

impl PostgresStore {
    /// Create a new PostgreSQL store from a connection URL.
    pub async fn from_url(
        url: &str,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        let opts = PgConnectOptions::from_str(url)?;
        Self::connect(opts, max_connections, statement_timeout_ms).await
    }

    /// Create a new PostgreSQL store from individual connection parameters.
    ///
    /// Lets the password come from its own environment variable rather than
    /// being embedded in a URL.
    #[allow(clippy::too_many_arguments)]
    pub async fn from_params(
        host: &str,
        port: u16,
        username: Option<&str>,
        password: Option<&str>,
        database: &str,
        ssl_mode: Option<PgSslMode>,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        let mut opts = PgConnectOptions::new()
            .host(host)
            .port(port)
            .database(database);

        if let Some(user) = username {
            opts = opts.username(user);
        }

        if let Some(pass) = password {
            opts = opts.password(pass);
        }

        if let Some(mode) = ssl_mode {
            let sqlx_mode = match mode {
                PgSslMode::Disable => SqlxPgSslMode::Disable,
                PgSslMode::Prefer => SqlxPgSslMode::Prefer,
                PgSslMode::Require => SqlxPgSslMode::Require,
            };
            opts = opts.ssl_mode(sqlx_mode);
        }

        tracing::info!(
            host = host,
            port = port,
            database = database,
            username = username.unwrap_or("<none>"),
            ssl_mode = ?ssl_mode,
            "Connecting to PostgreSQL with individual parameters"
        );

        Self::connect(opts, max_connections, statement_timeout_ms).await
    }

    async fn connect(
        mut opts: PgConnectOptions,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        if let Some(timeout_ms) = statement_timeout_ms {
            opts = opts.options([("statement_timeout", format!("{}ms", timeout_ms))]);
            tracing::info!("PostgreSQL statement_timeout set to {}ms", timeout_ms);
        }

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;

        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for PostgresStore {
    async fn migrate(&self) -> MetadataResult<()> {
        // Prepared statements cannot hold more than one command.
        for statement in postgres_schema_statements(POSTGRES_SCHEMA) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

async fn insert_exposure_rows(
    conn: &mut PgConnection,
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
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
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
        .bind(created_at)
        .execute(&mut *conn)
        .await?;
        inserted += result.rows_affected();
    }
    Ok(inserted)
}

#[async_trait]
impl ExposureRepo for PostgresStore {
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
            WHERE key_data = $1
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
            WHERE id > $1 AND origin IS NULL
            ORDER BY id ASC
            LIMIT $2
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
        let rows = sqlx::query_as::<_, ExposureRow>(
            r#"
            SELECT id, key_data, rolling_start_number, rolling_period,
                   transmission_risk_level, regions, origin,
                   days_since_onset, created_at
            FROM exposures
            WHERE id > $1 AND ($2::timestamptz IS NULL OR created_at < $2)
            ORDER BY key_data COLLATE "C" ASC
            "#,
        )
        .bind(after_id)
        .bind(created_before)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn min_exposure_id_since(&self, since: OffsetDateTime) -> MetadataResult<Option<i64>> {
        let id: Option<i64> =
            sqlx::query_scalar("SELECT MIN(id) FROM exposures WHERE created_at >= $1")
                .bind(since)
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

        let deleted = sqlx::query_as::<_, ExposureRow>(
            r#"
            DELETE FROM exposures
            WHERE id = $1
            RETURNING id, key_data, rolling_start_number, rolling_period,
                      transmission_risk_level, regions, origin,
                      days_since_onset, created_at
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = deleted else {
            tx.rollback().await?;
            return Ok(None);
        };

        let new_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO exposures (
                key_data, rolling_start_number, rolling_period,
                transmission_risk_level, regions, origin,
                days_since_onset, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id
            "#,
        )
        .bind(&row.key_data)
        .bind(row.rolling_start_number)
        .bind(row.rolling_period)
        .bind(row.transmission_risk_level)
        .bind(&row.regions)
        .bind(row.origin.as_deref())
        .bind(row.days_since_onset)
        .bind(created_at)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(new_id))
    }

    async fn delete_exposures_created_before(
        &self,
        cutoff: OffsetDateTime,
    ) -> MetadataResult<Option<i64>> {
        let deleted: Vec<i64> =
            sqlx::query_scalar("DELETE FROM exposures WHERE created_at < $1 RETURNING id")
                .bind(cutoff)
                .fetch_all(&self.pool)
                .await?;
        Ok(deleted.into_iter().max())
    }

    async fn count_exposures(&self) -> MetadataResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM exposures")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

struct PgPendingUploadBatch {
    tx: sqlx::Transaction<'static, Postgres>,
    batch_id: i64,
}

#[async_trait]
impl PendingUploadBatch for PgPendingUploadBatch {
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
impl BatchRepo for PostgresStore {
    async fn latest_download_batch(
        &self,
        server_id: &str,
        since: Option<OffsetDateTime>,
    ) -> MetadataResult<Option<DownloadBatchRow>> {
        let row = sqlx::query_as::<_, DownloadBatchRow>(
            r#"
            SELECT id, batch_tag, server_id, created_at
            FROM download_batches
            WHERE server_id = $1 AND ($2::timestamptz IS NULL OR created_at >= $2)
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(server_id)
        .bind(since)
        .fetch_optional(&self.pool)
        .await?;
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
                "INSERT INTO download_batches (batch_tag, server_id, created_at) VALUES ($1, $2, $3)",
            )
            .bind(tag)
            .bind(server_id)
            .bind(created_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(inserted)
    }

    async fn last_uploaded_exposure_id(&self, server_id: &str) -> MetadataResult<i64> {
        let id: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(last_exposure_id), 0) FROM upload_batches WHERE server_id = $1",
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
        let batch_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO upload_batches (exposure_count, last_exposure_id, server_id, created_at)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(batch.exposure_count)
        .bind(batch.last_exposure_id)
        .bind(&batch.server_id)
        .bind(batch.created_at)
        .fetch_one(&mut *tx)
        .await?;

        Ok(Box::new(PgPendingUploadBatch { tx, batch_id }))
    }

    async fn list_upload_batches(&self, server_id: &str) -> MetadataResult<Vec<UploadBatchRow>> {
        let rows = sqlx::query_as::<_, UploadBatchRow>(
            r#"
            SELECT id, exposure_count, last_exposure_id, server_id, created_at
            FROM upload_batches
            WHERE server_id = $1
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
impl ExportFileRepo for PostgresStore {
    async fn max_exported_exposure_id_before(
        &self,
        created_before: OffsetDateTime,
    ) -> MetadataResult<i64> {
        let id: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(last_exposure_id), 0) FROM exposure_export_files WHERE created_at < $1",
        )
        .bind(created_before)
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
                WHERE since_exposure_id = $1 AND last_exposure_id = $2 AND region = $3
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
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (since_exposure_id, last_exposure_id, region) DO NOTHING
            "#,
        )
        .bind(&file.path)
        .bind(file.exposure_count)
        .bind(file.since_exposure_id)
        .bind(file.last_exposure_id)
        .bind(file.first_exposure_created_at)
        .bind(&file.region)
        .bind(file.created_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_export_files_through(
        &self,
        last_exposure_id: i64,
    ) -> MetadataResult<Vec<ExportFileRow>> {
        let mut rows = sqlx::query_as::<_, ExportFileRow>(
            r#"
            DELETE FROM exposure_export_files
            WHERE last_exposure_id <= $1
            RETURNING id, path, exposure_count, since_exposure_id, last_exposure_id,
                      first_exposure_created_at, region, created_at
            "#,
        )
        .bind(last_exposure_id)
        .fetch_all(&self.pool)
        .await?;
        rows.sort_by_key(|row| row.id);
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
impl MetricRepo for PostgresStore {
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
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (date, event, os, version)
            DO UPDATE SET value = metrics.value + EXCLUDED.value
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
            "SELECT value FROM metrics WHERE date = $1 AND event = $2 AND os = $3 AND version = $4",
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

#[cfg(test)]
mod tests {
    use super::postgres_schema_statements;

    #[test]
    fn schema_splitter_skips_comment_only_chunks() {
        let schema = r#"
            -- header comment
            CREATE TABLE a (id INT);
            -- trailing comment only
            ;
            CREATE INDEX idx_a ON a(id);
        "#;

        let statements = postgres_schema_statements(schema);
        assert_eq!(statements.len(), 2);
        assert!(statements[0].contains("CREATE TABLE a"));
        assert!(statements[1].contains("CREATE INDEX idx_a"));
    }

    #[test]
    fn embedded_schema_creates_every_table() {
        let statements = postgres_schema_statements(super::POSTGRES_SCHEMA);
        for table in [
            "exposures",
            "download_batches",
            "upload_batches",
            "exposure_export_files",
            "metrics",
        ] {
            let needle = format!("CREATE TABLE IF NOT EXISTS {table} ");
            assert!(
                statements.iter().any(|s| s.contains(&needle)),
                "missing table {table}"
            );
        }
    }
}
