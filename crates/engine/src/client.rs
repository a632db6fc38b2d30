//! HTTP clients for peer servers and the gateway.

use crate::error::{SyncError, SyncResult};
use keyrelay_core::config::{GatewayConfig, HttpClientConfig, PeerServerConfig};
use keyrelay_core::{GATEWAY_SERVER_ID, GatewayKey, PeerKey};
use reqwest::StatusCode;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use time::Date;

const GATEWAY_ACCEPT: &str = "application/json; version=1.0";

fn build_http(config: &HttpClientConfig) -> reqwest::ClientBuilder {
    reqwest::Client::builder()
        .timeout(config.timeout())
        .connect_timeout(config.connect_timeout())
}

fn base_url(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}

/// Batch tags are opaque; peers may send them as strings or numbers.
fn opaque_tag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(tag)) => Some(tag),
        Some(Value::Number(tag)) => Some(tag.to_string()),
        _ => None,
    })
}

/// Body of a `200` peer download response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerBatch {
    #[serde(default, deserialize_with = "opaque_tag")]
    pub batch_tag: Option<String>,
    #[serde(default)]
    pub exposures: Vec<PeerKey>,
}

/// Result of one peer download request.
#[derive(Debug)]
pub enum PeerPage {
    Batch(PeerBatch),
    Exhausted,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PeerUploadRequest<'a> {
    batch_tag: &'a str,
    payload: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PeerUploadResponse {
    #[serde(default)]
    inserted_exposures: Option<Value>,
}

/// Client for a peer health-authority server.
#[derive(Clone)]
pub struct PeerClient {
    http: reqwest::Client,
    id: String,
    base_url: String,
    token: String,
}

impl PeerClient {
    pub fn new(config: &PeerServerConfig, http: &HttpClientConfig) -> SyncResult<Self> {
        let client = build_http(http)
            .build()
            .map_err(|e| SyncError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http: client,
            id: config.id.clone(),
            base_url: base_url(&config.url),
            token: config.token.clone(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// `GET {url}/download/{date}?batchTag=<tag>`.
    pub async fn download(&self, date: Date, batch_tag: Option<&str>) -> SyncResult<PeerPage> {
        let url = format!("{}/download/{date}", self.base_url);
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .query(&[("batchTag", batch_tag.unwrap_or_default())])
            .send()
            .await
            .map_err(|e| SyncError::transport(&self.id, e))?;

        match response.status() {
            StatusCode::OK => {
                let body = response
                    .text()
                    .await
                    .map_err(|e| SyncError::transport(&self.id, e))?;
                let batch = serde_json::from_str(&body).map_err(|e| {
                    SyncError::transport(&self.id, format!("malformed download body: {e}"))
                })?;
                Ok(PeerPage::Batch(batch))
            }
            StatusCode::NO_CONTENT => Ok(PeerPage::Exhausted),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(SyncError::transport(
                    &self.id,
                    format!("download failed ({status}): {body}"),
                ))
            }
        }
    }

    /// `POST {url}/upload` with a signed payload.
    ///
    /// Returns the number of keys the peer reports as stored, if it says.
    pub async fn upload(&self, batch_tag: &str, payload: &str) -> SyncResult<Option<u64>> {
        let url = format!("{}/upload", self.base_url);
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .json(&PeerUploadRequest { batch_tag, payload })
            .send()
            .await
            .map_err(|e| SyncError::transport(&self.id, e))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(SyncError::transport(
                &self.id,
                format!("upload failed ({status}): {body}"),
            ));
        }

        let inserted = serde_json::from_str::<PeerUploadResponse>(&body)
            .ok()
            .and_then(|r| r.inserted_exposures)
            .and_then(|v| match v {
                Value::Number(n) => n.as_u64(),
                Value::String(s) => s.parse().ok(),
                _ => None,
            });
        Ok(inserted)
    }
}

impl std::fmt::Debug for PeerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerClient")
            .field("id", &self.id)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

/// One page of gateway keys.
#[derive(Debug, Default)]
pub struct GatewayPage {
    pub batch_tag: Option<String>,
    pub next_batch_tag: Option<String>,
    pub keys: Vec<GatewayKey>,
}

#[derive(Deserialize)]
struct GatewayDownloadBody {
    #[serde(default)]
    keys: Vec<GatewayKey>,
}

#[derive(Serialize)]
struct GatewayUploadBody<'a> {
    keys: &'a [GatewayKey],
}

/// Client for the multi-country gateway, authenticated with mutual TLS.
#[derive(Clone, Debug)]
pub struct GatewayClient {
    http: reqwest::Client,
    base_url: String,
}

impl GatewayClient {
    pub fn new(config: &GatewayConfig, http: &HttpClientConfig) -> SyncResult<Self> {
        let cert = config.auth.cert.resolve()?;
        let key = config.auth.key.resolve()?;
        let (Some(cert), Some(key)) = (cert, key) else {
            return Err(SyncError::Config(
                "efgs.auth requires a certificate and key".to_string(),
            ));
        };

        let mut pem = key.into_bytes();
        pem.push(b'\n');
        pem.extend_from_slice(cert.as_bytes());
        let identity = reqwest::Identity::from_pem(&pem)
            .map_err(|e| SyncError::Config(format!("invalid efgs.auth identity: {e}")))?;

        let client = build_http(http)
            .identity(identity)
            .build()
            .map_err(|e| SyncError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http: client,
            base_url: base_url(&config.url),
        })
    }

    /// `GET {url}/diagnosiskeys/download/{date}`.
    ///
    /// `404` and `204` both mean there is nothing (more) to download and come
    /// back as `None`.
    pub async fn download(
        &self,
        date: Date,
        batch_tag: Option<&str>,
    ) -> SyncResult<Option<GatewayPage>> {
        let url = format!("{}/diagnosiskeys/download/{date}", self.base_url);
        let mut request = self.http.get(url).header("Accept", GATEWAY_ACCEPT);
        if let Some(tag) = batch_tag {
            request = request.header("batchTag", tag);
        }

        let response = request
            .send()
            .await
            .map_err(|e| SyncError::transport(GATEWAY_SERVER_ID, e))?;

        match response.status() {
            StatusCode::NOT_FOUND | StatusCode::NO_CONTENT => return Ok(None),
            status if !status.is_success() => {
                let body = response.text().await.unwrap_or_default();
                return Err(SyncError::transport(
                    GATEWAY_SERVER_ID,
                    format!("download failed ({status}): {body}"),
                ));
            }
            _ => {}
        }

        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let batch_tag = header("batchtag");
        let next_batch_tag = header("nextbatchtag");

        let body = response
            .text()
            .await
            .map_err(|e| SyncError::transport(GATEWAY_SERVER_ID, e))?;
        let keys = if body.trim().is_empty() {
            Vec::new()
        } else {
            serde_json::from_str::<GatewayDownloadBody>(&body)
                .map_err(|e| {
                    SyncError::transport(GATEWAY_SERVER_ID, format!("malformed download body: {e}"))
                })?
                .keys
        };

        Ok(Some(GatewayPage {
            batch_tag,
            next_batch_tag,
            keys,
        }))
    }

    /// `POST {url}/diagnosiskeys/upload` with a detached batch signature.
    pub async fn upload(
        &self,
        batch_tag: &str,
        batch_signature: &str,
        keys: &[GatewayKey],
    ) -> SyncResult<()> {
        let url = format!("{}/diagnosiskeys/upload", self.base_url);
        let body = serde_json::to_vec(&GatewayUploadBody { keys })
            .map_err(|e| SyncError::Encoding(e.to_string()))?;

        let response = self
            .http
            .post(url)
            .header("Content-Type", GATEWAY_ACCEPT)
            .header("batchTag", batch_tag)
            .header("batchSignature", batch_signature)
            .body(body)
            .send()
            .await
            .map_err(|e| SyncError::transport(GATEWAY_SERVER_ID, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::transport(
                GATEWAY_SERVER_ID,
                format!("upload failed ({status}): {body}"),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn peer_batch_accepts_numeric_and_null_tags() {
        let numeric: PeerBatch =
            serde_json::from_value(json!({ "batchTag": 42, "exposures": [] })).unwrap();
        assert_eq!(numeric.batch_tag.as_deref(), Some("42"));

        let null: PeerBatch = serde_json::from_value(json!({ "batchTag": null })).unwrap();
        assert!(null.batch_tag.is_none());
        assert!(null.exposures.is_empty());
    }

    #[test]
    fn base_url_drops_trailing_slash() {
        assert_eq!(base_url("https://peer.example/api/"), "https://peer.example/api");
    }
}
