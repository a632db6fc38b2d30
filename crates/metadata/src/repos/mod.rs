//! Repository traits for key store operations.

pub mod batches;
pub mod export_files;
pub mod exposures;
pub mod metrics;

pub use batches::{BatchRepo, PendingUploadBatch};
pub use export_files::ExportFileRepo;
pub use exposures::ExposureRepo;
pub use metrics::MetricRepo;
