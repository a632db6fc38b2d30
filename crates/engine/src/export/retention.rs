//! Retention cleanup for keys and the export files covering them.

use crate::error::SyncResult;
use crate::metrics;
use crate::report::ExportReport;
use crate::state::EngineState;
use keyrelay_storage::StorageError;
use time::{Duration, OffsetDateTime};

/// Keys created before this instant are swept.
pub fn retention_cutoff(now: OffsetDateTime, retention_days: i64) -> OffsetDateTime {
    now.date().midnight().assume_utc() - Duration::days(retention_days)
}

/// Delete expired keys, then every export file whose range ends at or below
/// the highest deleted id together with its archive.
pub async fn sweep(
    state: &EngineState,
    now: OffsetDateTime,
    report: &mut ExportReport,
) -> SyncResult<()> {
    let store = state.metadata.as_ref();
    let cutoff = retention_cutoff(now, state.config.exports.retention_days);

    let Some(max_deleted) = store.delete_exposures_created_before(cutoff).await? else {
        tracing::debug!(cutoff = %cutoff, "No expired keys");
        return Ok(());
    };
    report.expired_through = Some(max_deleted);

    let files = store.delete_export_files_through(max_deleted).await?;
    for file in files {
        match state.storage.delete(&file.path).await {
            Ok(()) => {}
            Err(StorageError::NotFound(_)) => {
                tracing::warn!(path = %file.path, "Expired export archive was already gone");
            }
            Err(e) => return Err(e.into()),
        }
        metrics::EXPORT_FILES_REMOVED.inc();
        report.removed_files.push(file.path);
    }

    tracing::info!(
        cutoff = %cutoff,
        expired_through = max_deleted,
        removed_files = report.removed_files.len(),
        "Retention sweep complete"
    );
    Ok(())
}
