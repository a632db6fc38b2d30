//! Per-run outcome summaries.

use crate::error::SyncError;

/// Result of syncing with one source or destination.
#[derive(Debug)]
pub struct SyncOutcome {
    /// Peer id or `efgs`.
    pub target: String,
    pub batches: u64,
    pub keys: u64,
    pub error: Option<SyncError>,
}

impl SyncOutcome {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            batches: 0,
            keys: 0,
            error: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Outcomes of a download or upload run, one per target in run order.
#[derive(Debug, Default)]
pub struct SyncReport {
    pub outcomes: Vec<SyncOutcome>,
}

impl SyncReport {
    /// Number of targets that were aborted.
    pub fn failures(&self) -> usize {
        self.outcomes.iter().filter(|o| !o.is_ok()).count()
    }

    pub fn outcome(&self, target: &str) -> Option<&SyncOutcome> {
        self.outcomes.iter().find(|o| o.target == target)
    }
}

pub type DownloadReport = SyncReport;
pub type UploadReport = SyncReport;

/// An export archive written during a run.
#[derive(Debug, Clone)]
pub struct GeneratedExport {
    pub path: String,
    pub region: String,
    pub exposure_count: usize,
    pub since_exposure_id: i64,
    pub last_exposure_id: i64,
}

/// Outcome of an export run.
#[derive(Debug, Default)]
pub struct ExportReport {
    pub files: Vec<GeneratedExport>,
    /// Still-valid keys re-queued for a later run.
    pub deferred: u64,
    /// Partitions that already had a file for the same id range.
    pub existing: u64,
    /// Windows without any candidate key.
    pub skipped_windows: u64,
    /// Highest exposure id removed by retention cleanup.
    pub expired_through: Option<i64>,
    pub removed_files: Vec<String>,
}
