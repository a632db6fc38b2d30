//! Wire shapes exchanged with federation partners.
//!
//! Peer servers and the gateway describe the same key with different field
//! names and enumerations. Both shapes are kept as distinct types and mapped
//! into [`ExposureKey`] explicitly at the synchronizer boundary.

use crate::exposure::{ExposureKey, KeyData, ReportType, clamp_gateway_days_since_onset};
use crate::{DEFAULT_ROLLING_PERIOD, Result};
use serde::{Deserialize, Serialize};

/// Key as exchanged with peer health-authority servers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerKey {
    pub key_data: String,
    pub rolling_start_number: i32,
    #[serde(default = "default_rolling_period")]
    pub rolling_period: i32,
    #[serde(default)]
    pub transmission_risk_level: i32,
    #[serde(default)]
    pub regions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub days_since_onset: Option<i32>,
}

fn default_rolling_period() -> i32 {
    DEFAULT_ROLLING_PERIOD
}

impl PeerKey {
    /// Outbound representation of a locally generated key.
    pub fn from_exposure(key: &ExposureKey) -> Self {
        Self {
            key_data: key.key_data.to_base64(),
            rolling_start_number: key.rolling_start_number,
            rolling_period: key.rolling_period,
            transmission_risk_level: key.transmission_risk_level,
            regions: key.regions.clone(),
            origin: None,
            days_since_onset: Some(key.days_since_onset),
        }
    }
}

/// Key as exchanged with the multi-country gateway.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayKey {
    pub key_data: String,
    pub rolling_start_interval_number: i32,
    #[serde(default = "default_rolling_period")]
    pub rolling_period: i32,
    #[serde(default)]
    pub transmission_risk_level: i32,
    #[serde(default)]
    pub visited_countries: Vec<String>,
    #[serde(default)]
    pub origin: String,
    #[serde(default)]
    pub report_type: ReportType,
    #[serde(rename = "days_since_onset_of_symptoms", default)]
    pub days_since_onset_of_symptoms: i32,
}

/// Fixed attributes stamped on every key this service sends to the gateway.
#[derive(Clone, Debug)]
pub struct GatewayKeyProfile {
    pub origin: String,
    pub visited_countries: Vec<String>,
}

impl GatewayKey {
    /// Outbound representation of a locally generated key.
    pub fn for_upload(key: &ExposureKey, profile: &GatewayKeyProfile) -> Self {
        Self {
            key_data: key.key_data.to_base64(),
            rolling_start_interval_number: key.rolling_start_number,
            rolling_period: key.rolling_period,
            transmission_risk_level: key.transmission_risk_level,
            visited_countries: profile.visited_countries.clone(),
            origin: profile.origin.clone(),
            report_type: ReportType::ConfirmedTest,
            days_since_onset_of_symptoms: clamp_gateway_days_since_onset(key.days_since_onset),
        }
    }
}

/// A key received from a federation source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FederatedKey {
    Peer(PeerKey),
    Gateway(GatewayKey),
}

impl FederatedKey {
    /// Base64 key material as received.
    pub fn key_data(&self) -> &str {
        match self {
            Self::Peer(key) => &key.key_data,
            Self::Gateway(key) => &key.key_data,
        }
    }

    /// Decode and length-check the key material.
    pub fn decode_key_data(&self) -> Result<KeyData> {
        KeyData::from_base64(self.key_data())
    }

    /// Report type, when the source carries one.
    pub fn report_type(&self) -> Option<ReportType> {
        match self {
            Self::Peer(_) => None,
            Self::Gateway(key) => Some(key.report_type),
        }
    }

    /// Map into the stored representation.
    ///
    /// Peer keys without an explicit origin are attributed to `source_id`.
    /// Gateway keys are attributed to their origin country, which also
    /// becomes their only region.
    pub fn into_exposure(self, source_id: &str) -> Result<ExposureKey> {
        let key_data = self.decode_key_data()?;
        Ok(match self {
            Self::Peer(key) => ExposureKey {
                key_data,
                rolling_start_number: key.rolling_start_number,
                rolling_period: key.rolling_period,
                transmission_risk_level: key.transmission_risk_level,
                regions: key.regions,
                origin: Some(key.origin.unwrap_or_else(|| source_id.to_string())),
                days_since_onset: key.days_since_onset.unwrap_or(0),
            },
            Self::Gateway(key) => {
                let origin = if key.origin.is_empty() {
                    source_id.to_string()
                } else {
                    key.origin
                };
                ExposureKey {
                    key_data,
                    rolling_start_number: key.rolling_start_interval_number,
                    rolling_period: key.rolling_period,
                    transmission_risk_level: key.transmission_risk_level,
                    regions: vec![origin.clone()],
                    origin: Some(origin),
                    days_since_onset: key.days_since_onset_of_symptoms,
                }
            }
        })
    }
}
