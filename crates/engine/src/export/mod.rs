//! Export generation.
//!
//! A run sweeps expired keys first, then exports the latest window and one
//! window per recent day. Regenerating a window whose key range already has
//! a file is a no-op, so runs can be repeated safely.

pub mod builder;
pub mod format;
pub mod retention;

pub use builder::{ExportBuilder, ExportWindow, export_region, windows};
pub use format::{EXPORT_HEADER, build_archive};

use crate::error::{SyncError, SyncResult};
use crate::metrics;
use crate::report::ExportReport;
use crate::state::EngineState;
use keyrelay_signer::ExportSigner;
use time::OffsetDateTime;

/// Run retention cleanup and generate export files.
pub async fn run_export(state: &EngineState, now: OffsetDateTime) -> SyncResult<ExportReport> {
    let _timer = metrics::JOB_DURATION
        .with_label_values(&["export"])
        .start_timer();
    let mut report = ExportReport::default();

    let result = async {
        let signer = ExportSigner::from_source(&state.config.exports.private_key)?;
        retention::sweep(state, now, &mut report).await?;

        let mut builder = ExportBuilder::new(state, signer, now);
        for window in windows(now, state.config.exports.export_days) {
            builder.export_window(&window, &mut report).await?;
        }
        Ok::<_, SyncError>(())
    }
    .await;

    if let Err(err) = result {
        tracing::error!(error = %err, "Export aborted");
        metrics::record_sync_failure("export", err.kind());
        return Err(err);
    }

    tracing::info!(
        files = report.files.len(),
        deferred = report.deferred,
        existing = report.existing,
        removed = report.removed_files.len(),
        "Export complete"
    );
    Ok(report)
}
