//! Download synchronizer.
//!
//! Pulls batches from each peer server, then from the gateway, following the
//! continuation tags the source hands back. Each batch is validated as a
//! whole and stored together with its tag in one transaction, so a source
//! that fails halfway keeps everything it delivered before the failure.

use crate::client::{GatewayClient, PeerClient, PeerPage};
use crate::error::{SyncError, SyncResult};
use crate::metrics;
use crate::report::{DownloadReport, SyncOutcome};
use crate::state::EngineState;
use async_trait::async_trait;
use keyrelay_core::events::{EFGS_KEYS_DOWNLOADED, INTEROP_KEYS_DOWNLOADED};
use keyrelay_core::{FederatedKey, GATEWAY_SERVER_ID, ReportType};
use keyrelay_metadata::MetadataStore;
use time::{Date, Duration, OffsetDateTime};

/// Options for a download run.
#[derive(Clone, Debug, Default)]
pub struct DownloadOptions {
    /// Only resume peer cursors recorded on or after this date.
    pub since: Option<Date>,
}

/// Download loop state for one source.
#[derive(Debug)]
pub enum SyncState {
    Fetching { tag: Option<String> },
    Exhausted,
    Aborted(SyncError),
}

/// Normalize a continuation tag: empty and `"null"` mean there is none.
pub fn continuation(tag: Option<String>) -> Option<String> {
    tag.filter(|t| !t.is_empty() && t != "null")
}

/// State after a page was stored. A missing tag, or the tag that was just
/// sent, ends the loop.
pub fn after_page(sent: Option<&str>, next: Option<String>) -> SyncState {
    match next {
        Some(tag) if Some(tag.as_str()) != sent => SyncState::Fetching { tag: Some(tag) },
        _ => SyncState::Exhausted,
    }
}

/// One response from a source.
#[derive(Debug)]
pub enum Fetched {
    Page {
        keys: Vec<FederatedKey>,
        /// Tag recorded as the cursor and sent with the next request.
        cursor: Option<String>,
    },
    Exhausted,
}

/// A federation source the download loop can page through.
#[async_trait]
pub trait BatchSource: Send + Sync {
    fn id(&self) -> &str;

    /// Event written to the `metrics` table once the source is exhausted.
    fn metric_event(&self) -> &'static str;

    /// Tag to resume from.
    async fn resume_tag(&self, store: &dyn MetadataStore) -> SyncResult<Option<String>>;

    async fn fetch(&self, tag: Option<&str>) -> SyncResult<Fetched>;

    /// Whether a well-formed key should be stored.
    fn accept(&self, _key: &FederatedKey) -> bool {
        true
    }
}

/// A peer health-authority server.
pub struct PeerSource {
    client: PeerClient,
    /// Date in the download path.
    date: Date,
    since: Option<OffsetDateTime>,
}

impl PeerSource {
    pub fn new(client: PeerClient, date: Date, since: Option<OffsetDateTime>) -> Self {
        Self {
            client,
            date,
            since,
        }
    }
}

#[async_trait]
impl BatchSource for PeerSource {
    fn id(&self) -> &str {
        self.client.id()
    }

    fn metric_event(&self) -> &'static str {
        INTEROP_KEYS_DOWNLOADED
    }

    async fn resume_tag(&self, store: &dyn MetadataStore) -> SyncResult<Option<String>> {
        let latest = store.latest_download_batch(self.id(), self.since).await?;
        Ok(latest.map(|row| row.batch_tag))
    }

    async fn fetch(&self, tag: Option<&str>) -> SyncResult<Fetched> {
        Ok(match self.client.download(self.date, tag).await? {
            PeerPage::Batch(batch) => Fetched::Page {
                keys: batch.exposures.into_iter().map(FederatedKey::Peer).collect(),
                cursor: batch.batch_tag,
            },
            PeerPage::Exhausted => Fetched::Exhausted,
        })
    }
}

/// The multi-country gateway. Cursors are scoped to the run date.
pub struct GatewaySource {
    client: GatewayClient,
    date: Date,
    accepted: Vec<ReportType>,
}

impl GatewaySource {
    pub fn new(client: GatewayClient, date: Date, accepted: Vec<ReportType>) -> Self {
        Self {
            client,
            date,
            accepted,
        }
    }
}

#[async_trait]
impl BatchSource for GatewaySource {
    fn id(&self) -> &str {
        GATEWAY_SERVER_ID
    }

    fn metric_event(&self) -> &'static str {
        EFGS_KEYS_DOWNLOADED
    }

    async fn resume_tag(&self, store: &dyn MetadataStore) -> SyncResult<Option<String>> {
        let since = self.date.midnight().assume_utc();
        let latest = store.latest_download_batch(self.id(), Some(since)).await?;
        Ok(latest.map(|row| row.batch_tag))
    }

    async fn fetch(&self, tag: Option<&str>) -> SyncResult<Fetched> {
        Ok(match self.client.download(self.date, tag).await? {
            Some(page) => {
                tracing::debug!(
                    batch_tag = ?page.batch_tag,
                    next_batch_tag = ?page.next_batch_tag,
                    keys = page.keys.len(),
                    "Fetched gateway page"
                );
                Fetched::Page {
                    keys: page.keys.into_iter().map(FederatedKey::Gateway).collect(),
                    cursor: page.next_batch_tag,
                }
            }
            None => Fetched::Exhausted,
        })
    }

    fn accept(&self, key: &FederatedKey) -> bool {
        match key.report_type() {
            Some(report_type) => {
                report_type == ReportType::ConfirmedTest && self.accepted.contains(&report_type)
            }
            None => false,
        }
    }
}

async fn ingest_page(
    store: &dyn MetadataStore,
    source: &dyn BatchSource,
    sent: Option<&str>,
    now: OffsetDateTime,
    outcome: &mut SyncOutcome,
) -> SyncResult<SyncState> {
    let (keys, cursor) = match source.fetch(sent).await? {
        Fetched::Exhausted => return Ok(SyncState::Exhausted),
        Fetched::Page { keys, cursor } => (keys, continuation(cursor)),
    };
    let id = source.id();

    // Reject the whole batch before anything is written.
    for key in &keys {
        if let Err(e) = key.decode_key_data() {
            metrics::BATCHES_REJECTED.with_label_values(&[id]).inc();
            return Err(SyncError::integrity(
                id,
                format!("key {}: {e}", key.key_data()),
            ));
        }
    }

    let received = keys.len();
    let mut exposures = Vec::with_capacity(received);
    for key in keys {
        if source.accept(&key) {
            exposures.push(key.into_exposure(id)?);
        }
    }
    let filtered = received - exposures.len();

    let inserted = store
        .ingest_download_batch(id, cursor.as_deref(), &exposures, now)
        .await?;

    outcome.batches += 1;
    outcome.keys += inserted;
    metrics::KEYS_DOWNLOADED
        .with_label_values(&[id])
        .inc_by(inserted);
    if filtered > 0 {
        metrics::KEYS_FILTERED
            .with_label_values(&[id])
            .inc_by(filtered as u64);
    }

    tracing::info!(
        source = %id,
        batch_tag = ?cursor,
        received,
        filtered,
        inserted,
        "Stored downloaded batch"
    );

    Ok(after_page(sent, cursor))
}

/// Page through `source` until it is exhausted or fails.
pub async fn sync_source(
    store: &dyn MetadataStore,
    source: &dyn BatchSource,
    now: OffsetDateTime,
) -> SyncOutcome {
    let mut outcome = SyncOutcome::new(source.id());
    tracing::info!(source = %source.id(), "Beginning download");

    let mut state = match source.resume_tag(store).await {
        Ok(tag) => SyncState::Fetching { tag },
        Err(e) => SyncState::Aborted(e),
    };

    loop {
        state = match state {
            SyncState::Fetching { tag } => {
                match ingest_page(store, source, tag.as_deref(), now, &mut outcome).await {
                    Ok(next) => next,
                    Err(e) => SyncState::Aborted(e),
                }
            }
            SyncState::Exhausted => {
                let recorded = store
                    .record_metric(
                        now.date(),
                        source.metric_event(),
                        "",
                        "",
                        outcome.keys as i64,
                    )
                    .await;
                match recorded {
                    Ok(()) => {
                        tracing::info!(
                            source = %source.id(),
                            batches = outcome.batches,
                            inserted = outcome.keys,
                            "No more batches to download"
                        );
                        break;
                    }
                    Err(e) => SyncState::Aborted(e.into()),
                }
            }
            SyncState::Aborted(err) => {
                tracing::error!(
                    source = %source.id(),
                    batches = outcome.batches,
                    error = %err,
                    "Download aborted"
                );
                metrics::record_sync_failure("download", err.kind());
                outcome.error = Some(err);
                break;
            }
        };
    }

    outcome
}

fn failed(target: &str, err: SyncError) -> SyncOutcome {
    tracing::error!(source = %target, error = %err, "Download source unavailable");
    metrics::record_sync_failure("download", err.kind());
    let mut outcome = SyncOutcome::new(target);
    outcome.error = Some(err);
    outcome
}

/// Download from every configured peer, then from the gateway when enabled.
pub async fn run_download(
    state: &EngineState,
    options: &DownloadOptions,
    now: OffsetDateTime,
) -> DownloadReport {
    let _timer = metrics::JOB_DURATION
        .with_label_values(&["download"])
        .start_timer();
    let run_date = now.date();
    let since = options.since.map(|date| date.midnight().assume_utc());
    let interop = &state.config.interop;
    let mut report = DownloadReport::default();

    for server in &interop.servers {
        let outcome = match PeerClient::new(server, &state.config.http) {
            Ok(client) => {
                let date = run_date.saturating_sub(Duration::days(server.max_age_days));
                let source = PeerSource::new(client, date, since);
                sync_source(state.metadata.as_ref(), &source, now).await
            }
            Err(e) => failed(&server.id, e),
        };
        report.outcomes.push(outcome);
    }

    if let Some(efgs) = interop.efgs.as_ref().filter(|efgs| efgs.download) {
        let outcome = match GatewayClient::new(efgs, &state.config.http) {
            Ok(client) => {
                let source =
                    GatewaySource::new(client, run_date, efgs.accepted_report_types.clone());
                sync_source(state.metadata.as_ref(), &source, now).await
            }
            Err(e) => failed(GATEWAY_SERVER_ID, e),
        };
        report.outcomes.push(outcome);
    }

    report
}
