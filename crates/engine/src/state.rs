//! Shared state for sync and export jobs.

use keyrelay_core::ValidityFilter;
use keyrelay_core::config::AppConfig;
use keyrelay_metadata::MetadataStore;
use keyrelay_storage::ObjectStore;
use std::sync::Arc;

/// Configuration plus the key store and export object store every job uses.
#[derive(Clone)]
pub struct EngineState {
    pub config: Arc<AppConfig>,
    pub metadata: Arc<dyn MetadataStore>,
    pub storage: Arc<dyn ObjectStore>,
}

impl EngineState {
    pub fn new(
        config: AppConfig,
        metadata: Arc<dyn MetadataStore>,
        storage: Arc<dyn ObjectStore>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            metadata,
            storage,
        }
    }

    /// Validity filter built from the export settings.
    pub fn validity_filter(&self) -> ValidityFilter {
        ValidityFilter::new(
            self.config.exports.variance_offset_mins,
            self.config.exports.disable_valid_key_check,
        )
    }
}
