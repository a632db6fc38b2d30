//! Export window resolution and archive generation.

use super::format::{ExportBatch, build_archive};
use crate::error::SyncResult;
use crate::metrics;
use crate::report::{ExportReport, GeneratedExport};
use crate::state::EngineState;
use bytes::Bytes;
use keyrelay_core::ExposureKey;
use keyrelay_core::config::ExportConfig;
use keyrelay_metadata::models::{ExposureRow, NewExportFile};
use keyrelay_signer::ExportSigner;
use keyrelay_storage::StorageError;
use std::collections::BTreeMap;
use time::{Date, Duration, OffsetDateTime};

/// A range of key creation times exported together.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExportWindow {
    pub start: OffsetDateTime,
    /// Exclusive upper bound on `created_at`; `None` for the latest window.
    pub end: Option<OffsetDateTime>,
    /// Resume after the newest export file instead of scanning from `start`.
    pub fast_path: bool,
}

impl ExportWindow {
    /// Everything created from the start of `today` on.
    pub fn latest(today: Date) -> Self {
        Self {
            start: today.midnight().assume_utc(),
            end: None,
            fast_path: true,
        }
    }

    /// Keys created on `day`.
    pub fn daily(day: Date) -> Self {
        let start = day.midnight().assume_utc();
        Self {
            start,
            end: Some(start + Duration::days(1)),
            fast_path: false,
        }
    }
}

/// Windows of one run: the latest window, then one per day for the
/// `export_days` days before today, oldest first.
pub fn windows(now: OffsetDateTime, export_days: i64) -> Vec<ExportWindow> {
    let today = now.date();
    let mut windows = vec![ExportWindow::latest(today)];
    windows.extend(
        (1..=export_days)
            .rev()
            .map(|days| ExportWindow::daily(today.saturating_sub(Duration::days(days)))),
    );
    windows
}

/// Region a key is exported under: its first native region, else the default.
pub fn export_region<'a>(key: &'a ExposureKey, config: &'a ExportConfig) -> &'a str {
    key.regions
        .iter()
        .find(|region| config.native_regions.contains(region))
        .map(String::as_str)
        .unwrap_or(config.default_region.as_str())
}

/// Keys of one region, in `key_data` order.
#[derive(Debug, Default)]
struct Partition {
    keys: Vec<ExposureKey>,
    first_id: i64,
    last_id: i64,
    first_created_at: Option<OffsetDateTime>,
    last_created_at: Option<OffsetDateTime>,
}

impl Partition {
    fn push(&mut self, row: &ExposureRow, key: ExposureKey) {
        if self.keys.is_empty() {
            self.first_id = row.id;
            self.last_id = row.id;
        } else {
            self.first_id = self.first_id.min(row.id);
            self.last_id = self.last_id.max(row.id);
        }
        self.first_created_at = Some(
            self.first_created_at
                .map_or(row.created_at, |at| at.min(row.created_at)),
        );
        self.last_created_at = Some(
            self.last_created_at
                .map_or(row.created_at, |at| at.max(row.created_at)),
        );
        self.keys.push(key);
    }
}

/// Generates export archives for one run.
pub struct ExportBuilder<'a> {
    state: &'a EngineState,
    signer: ExportSigner,
    now: OffsetDateTime,
    last_stamp: i64,
}

impl<'a> ExportBuilder<'a> {
    pub fn new(state: &'a EngineState, signer: ExportSigner, now: OffsetDateTime) -> Self {
        Self {
            state,
            signer,
            now,
            last_stamp: 0,
        }
    }

    /// Id after which the window's keys start, or `None` if it has none.
    async fn start_id(&self, window: &ExportWindow) -> SyncResult<Option<i64>> {
        let store = self.state.metadata.as_ref();
        if window.fast_path {
            let exported = store.max_exported_exposure_id_before(self.now).await?;
            if exported > 0 {
                return Ok(Some(exported));
            }
        }
        Ok(store
            .min_exposure_id_since(window.start)
            .await?
            .map(|id| id - 1))
    }

    /// Export one window.
    pub async fn export_window(
        &mut self,
        window: &ExportWindow,
        report: &mut ExportReport,
    ) -> SyncResult<()> {
        let Some(start_id) = self.start_id(window).await? else {
            tracing::debug!(start = %window.start, "No keys for export window");
            report.skipped_windows += 1;
            return Ok(());
        };

        let store = self.state.metadata.as_ref();
        let config = &self.state.config.exports;
        let validity = self.state.validity_filter();
        let rows = store.get_exposures_for_export(start_id, window.end).await?;

        let mut partitions: BTreeMap<String, Partition> = BTreeMap::new();
        for row in &rows {
            if validity.is_still_valid(row.rolling_start_number, row.rolling_period, self.now) {
                if let Some(new_id) = store.defer_exposure(row.id, self.now).await? {
                    tracing::debug!(exposure_id = row.id, new_id, "Deferred still-valid key");
                    report.deferred += 1;
                    metrics::KEYS_DEFERRED.inc();
                }
                continue;
            }

            let key = match row.to_exposure_key() {
                Ok(key) => key,
                Err(e) => {
                    tracing::warn!(exposure_id = row.id, error = %e, "Skipping malformed key");
                    continue;
                }
            };
            let region = export_region(&key, config).to_string();
            partitions.entry(region).or_default().push(row, key);
        }

        for (region, partition) in partitions {
            self.write_partition(&region, partition, report).await?;
        }
        Ok(())
    }

    /// Epoch-millisecond file stamp, strictly increasing within the run.
    fn next_stamp(&mut self) -> i64 {
        let millis = (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64;
        self.last_stamp = millis.max(self.last_stamp + 1);
        self.last_stamp
    }

    async fn write_partition(
        &mut self,
        region: &str,
        partition: Partition,
        report: &mut ExportReport,
    ) -> SyncResult<()> {
        let store = self.state.metadata.as_ref();
        let (Some(first_created_at), Some(last_created_at)) =
            (partition.first_created_at, partition.last_created_at)
        else {
            return Ok(());
        };

        if store
            .export_file_exists(partition.first_id, partition.last_id, region)
            .await?
        {
            tracing::debug!(
                region,
                since_exposure_id = partition.first_id,
                last_exposure_id = partition.last_id,
                "Export file already exists"
            );
            report.existing += 1;
            return Ok(());
        }

        let batch = ExportBatch {
            region,
            start_timestamp: first_created_at.unix_timestamp().max(0) as u64,
            end_timestamp: last_created_at.unix_timestamp().max(0) as u64,
            keys: &partition.keys,
        };
        let archive = build_archive(&batch, &self.state.config.exports, &self.signer)?;

        let path = format!(
            "exposures/{}/{}.zip",
            region.to_lowercase(),
            self.next_stamp()
        );
        self.state.storage.put(&path, Bytes::from(archive)).await?;

        let created = store
            .create_export_file(&NewExportFile {
                path: path.clone(),
                exposure_count: partition.keys.len() as i32,
                since_exposure_id: partition.first_id,
                last_exposure_id: partition.last_id,
                first_exposure_created_at: first_created_at,
                region: region.to_string(),
                created_at: self.now,
            })
            .await?;

        if !created {
            tracing::info!(region, path = %path, "Export file recorded concurrently, removing archive");
            match self.state.storage.delete(&path).await {
                Ok(()) | Err(StorageError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
            report.existing += 1;
            return Ok(());
        }

        metrics::EXPORT_FILES_GENERATED
            .with_label_values(&[region])
            .inc();
        tracing::info!(
            region,
            path = %path,
            keys = partition.keys.len(),
            since_exposure_id = partition.first_id,
            last_exposure_id = partition.last_id,
            "Generated export file"
        );
        report.files.push(GeneratedExport {
            path,
            region: region.to_string(),
            exposure_count: partition.keys.len(),
            since_exposure_id: partition.first_id,
            last_exposure_id: partition.last_id,
        });
        Ok(())
    }
}
