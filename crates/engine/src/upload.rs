//! Upload synchronizer.
//!
//! Pushes locally submitted keys to each peer server and to the gateway. A
//! destination's cursor is the highest exposure id of its committed upload
//! batches. The batch row is inserted in a transaction that only commits once
//! the push succeeded, so a failed push leaves the cursor where it was and
//! the next run re-sends the same range.

use crate::client::{GatewayClient, PeerClient};
use crate::error::{SyncError, SyncResult};
use crate::metrics;
use crate::report::{SyncOutcome, UploadReport};
use crate::state::EngineState;
use async_trait::async_trait;
use keyrelay_core::config::GatewayConfig;
use keyrelay_core::events::{EFGS_KEYS_UPLOADED, INTEROP_KEYS_UPLOADED};
use keyrelay_core::{
    ExposureKey, GATEWAY_SERVER_ID, GatewayKey, GatewayKeyProfile, PeerKey, ROLLING_INTERVAL_SECS,
    batch_signing_bytes,
};
use keyrelay_metadata::MetadataStore;
use keyrelay_metadata::models::NewUploadBatch;
use keyrelay_signer::{GatewayBatchSigner, PeerPayloadSigner};
use time::OffsetDateTime;

/// Keys whose rolling start is older than this are not sent to the gateway.
const GATEWAY_MAX_KEY_AGE_SECS: i64 = 14 * 24 * 60 * 60;

/// A federation destination for local keys.
#[async_trait]
pub trait BatchDestination: Send + Sync {
    fn id(&self) -> &str;

    /// Event written to the `metrics` table after each committed batch.
    fn metric_event(&self) -> &'static str;

    /// Keys of a page this destination accepts.
    fn select(&self, keys: Vec<ExposureKey>, _now: OffsetDateTime) -> Vec<ExposureKey> {
        keys
    }

    /// Sign and push one batch. Returns the number of keys the destination
    /// stored.
    async fn push(&self, batch_tag: &str, keys: &[ExposureKey]) -> SyncResult<u64>;
}

/// A peer server, sent ES256-signed key lists.
pub struct PeerDestination {
    client: PeerClient,
    signer: PeerPayloadSigner,
}

impl PeerDestination {
    pub fn new(client: PeerClient, signer: PeerPayloadSigner) -> Self {
        Self { client, signer }
    }
}

#[async_trait]
impl BatchDestination for PeerDestination {
    fn id(&self) -> &str {
        self.client.id()
    }

    fn metric_event(&self) -> &'static str {
        INTEROP_KEYS_UPLOADED
    }

    async fn push(&self, batch_tag: &str, keys: &[ExposureKey]) -> SyncResult<u64> {
        let payload: Vec<PeerKey> = keys.iter().map(PeerKey::from_exposure).collect();
        let signed = self.signer.sign(&payload)?;
        let stored = self.client.upload(batch_tag, &signed).await?;
        Ok(stored.unwrap_or(keys.len() as u64))
    }
}

/// The gateway, sent keys stamped with this deployment's profile and a
/// detached CMS signature.
pub struct GatewayDestination {
    client: GatewayClient,
    signer: GatewayBatchSigner,
    profile: GatewayKeyProfile,
}

impl GatewayDestination {
    pub fn new(client: GatewayClient, signer: GatewayBatchSigner, profile: GatewayKeyProfile) -> Self {
        Self {
            client,
            signer,
            profile,
        }
    }

    pub fn from_config(config: &GatewayConfig, client: GatewayClient) -> SyncResult<Self> {
        let sign = config
            .sign
            .as_ref()
            .ok_or_else(|| SyncError::Config("efgs.upload requires efgs.sign".to_string()))?;
        let profile = GatewayKeyProfile {
            origin: config.origin.clone(),
            visited_countries: config.visited_countries.clone(),
        };
        Ok(Self::new(
            client,
            GatewayBatchSigner::from_config(sign)?,
            profile,
        ))
    }
}

/// Whether a key started rolling within the gateway's acceptance window.
pub fn within_gateway_window(rolling_start_number: i32, now: OffsetDateTime) -> bool {
    let started = i64::from(rolling_start_number) * ROLLING_INTERVAL_SECS;
    now.unix_timestamp() - started < GATEWAY_MAX_KEY_AGE_SECS
}

#[async_trait]
impl BatchDestination for GatewayDestination {
    fn id(&self) -> &str {
        GATEWAY_SERVER_ID
    }

    fn metric_event(&self) -> &'static str {
        EFGS_KEYS_UPLOADED
    }

    fn select(&self, keys: Vec<ExposureKey>, now: OffsetDateTime) -> Vec<ExposureKey> {
        keys.into_iter()
            .filter(|key| within_gateway_window(key.rolling_start_number, now))
            .collect()
    }

    async fn push(&self, batch_tag: &str, keys: &[ExposureKey]) -> SyncResult<u64> {
        let gateway_keys: Vec<GatewayKey> = keys
            .iter()
            .map(|key| GatewayKey::for_upload(key, &self.profile))
            .collect();
        let content = batch_signing_bytes(&gateway_keys)?;
        let signature = self.signer.batch_signature(&content)?;
        self.client
            .upload(batch_tag, &signature, &gateway_keys)
            .await?;
        Ok(gateway_keys.len() as u64)
    }
}

/// Upload one page. Returns false once nothing is left to send.
async fn upload_page(
    store: &dyn MetadataStore,
    destination: &dyn BatchDestination,
    page_size: i64,
    now: OffsetDateTime,
    outcome: &mut SyncOutcome,
) -> SyncResult<bool> {
    let id = destination.id();
    let cursor = store.last_uploaded_exposure_id(id).await?;
    let rows = store.get_local_exposures_after(cursor, page_size).await?;
    let Some(last_exposure_id) = rows.last().map(|row| row.id) else {
        return Ok(false);
    };

    let mut keys = Vec::with_capacity(rows.len());
    for row in &rows {
        match row.to_exposure_key() {
            Ok(key) => keys.push(key),
            Err(e) => {
                tracing::warn!(destination = %id, exposure_id = row.id, error = %e, "Skipping malformed local key");
            }
        }
    }
    let keys = destination.select(keys, now);

    let pending = store
        .begin_upload_batch(&NewUploadBatch {
            server_id: id.to_string(),
            exposure_count: keys.len() as i32,
            last_exposure_id,
            created_at: now,
        })
        .await?;
    let batch_tag = pending.batch_id().to_string();

    if keys.is_empty() {
        pending.commit().await?;
        tracing::info!(
            destination = %id,
            batch_tag = %batch_tag,
            last_exposure_id,
            "No eligible keys in page, advancing cursor"
        );
        return Ok(true);
    }

    let stored = match destination.push(&batch_tag, &keys).await {
        Ok(stored) => stored,
        Err(e) => {
            if let Err(rollback_err) = pending.rollback().await {
                tracing::warn!(destination = %id, error = %rollback_err, "Failed to roll back upload batch");
            }
            return Err(e);
        }
    };
    pending.commit().await?;

    outcome.batches += 1;
    outcome.keys += keys.len() as u64;
    metrics::KEYS_UPLOADED
        .with_label_values(&[id])
        .inc_by(keys.len() as u64);
    // The batch is delivered and committed at this point.
    if let Err(e) = store
        .record_metric(now.date(), destination.metric_event(), "", "", stored as i64)
        .await
    {
        tracing::warn!(destination = %id, error = %e, "Failed to record upload metric");
    }

    tracing::info!(
        destination = %id,
        batch_tag = %batch_tag,
        uploaded = keys.len(),
        stored,
        "Uploaded batch"
    );
    Ok(true)
}

/// Push pages to `destination` until none are left or a push fails.
pub async fn sync_destination(
    store: &dyn MetadataStore,
    destination: &dyn BatchDestination,
    page_size: i64,
    now: OffsetDateTime,
) -> SyncOutcome {
    let mut outcome = SyncOutcome::new(destination.id());
    tracing::info!(destination = %destination.id(), "Beginning upload");

    loop {
        match upload_page(store, destination, page_size, now, &mut outcome).await {
            Ok(true) => continue,
            Ok(false) => {
                tracing::info!(
                    destination = %destination.id(),
                    batches = outcome.batches,
                    uploaded = outcome.keys,
                    "No more keys to upload"
                );
                break;
            }
            Err(err) => {
                tracing::error!(destination = %destination.id(), error = %err, "Upload aborted");
                metrics::record_sync_failure("upload", err.kind());
                outcome.error = Some(err);
                break;
            }
        }
    }

    outcome
}

fn failed(target: &str, err: SyncError) -> SyncOutcome {
    tracing::error!(destination = %target, error = %err, "Upload destination unavailable");
    metrics::record_sync_failure("upload", err.kind());
    let mut outcome = SyncOutcome::new(target);
    outcome.error = Some(err);
    outcome
}

/// Upload to every configured peer, then to the gateway when enabled.
pub async fn run_upload(state: &EngineState, now: OffsetDateTime) -> UploadReport {
    let _timer = metrics::JOB_DURATION
        .with_label_values(&["upload"])
        .start_timer();
    let interop = &state.config.interop;
    let page_size = interop.upload_page_size;
    let mut report = UploadReport::default();

    for server in &interop.servers {
        let destination = PeerClient::new(server, &state.config.http).and_then(|client| {
            let signer = PeerPayloadSigner::from_source(&server.private_key)?;
            Ok(PeerDestination::new(client, signer))
        });
        let outcome = match destination {
            Ok(destination) => {
                sync_destination(state.metadata.as_ref(), &destination, page_size, now).await
            }
            Err(e) => failed(&server.id, e),
        };
        report.outcomes.push(outcome);
    }

    if let Some(efgs) = interop.efgs.as_ref().filter(|efgs| efgs.upload) {
        let destination = GatewayClient::new(efgs, &state.config.http)
            .and_then(|client| GatewayDestination::from_config(efgs, client));
        let outcome = match destination {
            Ok(destination) => {
                sync_destination(state.metadata.as_ref(), &destination, page_size, now).await
            }
            Err(e) => failed(GATEWAY_SERVER_ID, e),
        };
        report.outcomes.push(outcome);
    }

    report
}
