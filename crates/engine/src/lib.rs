//! Federation sync and export engine for keyrelay.
//!
//! This crate drives the three batch jobs:
//! - Download: pull key batches from peer servers and the gateway
//! - Upload: push locally submitted keys to the same partners
//! - Export: sweep expired keys and write signed export archives

pub mod client;
pub mod download;
pub mod error;
pub mod export;
pub mod metrics;
pub mod report;
pub mod state;
pub mod upload;

pub use download::{DownloadOptions, run_download};
pub use error::{ErrorKind, SyncError, SyncResult};
pub use export::run_export;
pub use report::{DownloadReport, ExportReport, SyncOutcome, SyncReport, UploadReport};
pub use state::EngineState;
pub use upload::run_upload;
