//! Metric counter repository trait.

use crate::error::MetadataResult;
use async_trait::async_trait;
use time::Date;

/// Repository for daily accumulated counters.
#[async_trait]
pub trait MetricRepo: Send + Sync {
    /// Add `value` to the counter for `(date, event, os, version)`, creating it if needed.
    async fn record_metric(
        &self,
        date: Date,
        event: &str,
        os: &str,
        version: &str,
        value: i64,
    ) -> MetadataResult<()>;

    /// Current value of a counter.
    async fn get_metric(
        &self,
        date: Date,
        event: &str,
        os: &str,
        version: &str,
    ) -> MetadataResult<Option<i64>>;
}
