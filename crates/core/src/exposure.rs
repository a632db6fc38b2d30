//! Temporary exposure key types.

use crate::{DEFAULT_ROLLING_PERIOD, Error, KEY_DATA_LEN, Result};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Raw temporary exposure key material (always exactly 16 bytes).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyData([u8; KEY_DATA_LEN]);

impl KeyData {
    /// Wrap raw key bytes, rejecting anything that is not 16 bytes long.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let raw: [u8; KEY_DATA_LEN] = bytes.try_into().map_err(|_| Error::InvalidKeyLength {
            expected: KEY_DATA_LEN,
            actual: bytes.len(),
        })?;
        Ok(Self(raw))
    }

    /// Decode key material from its base64 wire form.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|e| Error::InvalidKeyEncoding(e.to_string()))?;
        Self::from_bytes(&bytes)
    }

    /// Encode as standard base64, the form stored in the `exposures` table.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_DATA_LEN] {
        &self.0
    }
}

impl fmt::Display for KeyData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

impl fmt::Debug for KeyData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyData({self})")
    }
}

/// Report type of a diagnosis key, as used by the gateway and export format.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReportType {
    ConfirmedTest,
    ConfirmedClinicalDiagnosis,
    SelfReport,
    Recursive,
    Revoked,
    /// Any value this service does not recognize. Must stay the last variant.
    #[default]
    #[serde(other)]
    Unknown,
}

impl ReportType {
    /// Numeric value shared by the export protobuf and the gateway signing record.
    pub fn as_i32(self) -> i32 {
        match self {
            Self::Unknown => 0,
            Self::ConfirmedTest => 1,
            Self::ConfirmedClinicalDiagnosis => 2,
            Self::SelfReport => 3,
            Self::Recursive => 4,
            Self::Revoked => 5,
        }
    }
}

/// A temporary exposure key with its epidemiological metadata.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExposureKey {
    pub key_data: KeyData,
    /// Index of the 10-minute interval the key started broadcasting in.
    pub rolling_start_number: i32,
    pub rolling_period: i32,
    /// Stored as received; normalized only when exported.
    pub transmission_risk_level: i32,
    pub regions: Vec<String>,
    /// `None` for keys submitted to this service, the source name otherwise.
    pub origin: Option<String>,
    pub days_since_onset: i32,
}

impl ExposureKey {
    /// Build a locally generated key with default rolling period and no onset data.
    pub fn local(key_data: KeyData, rolling_start_number: i32, regions: Vec<String>) -> Self {
        Self {
            key_data,
            rolling_start_number,
            rolling_period: DEFAULT_ROLLING_PERIOD,
            transmission_risk_level: 0,
            regions,
            origin: None,
            days_since_onset: 0,
        }
    }
}

/// Map a transmission risk level outside 0..=8 to 0.
pub fn normalize_risk_level(level: i32) -> i32 {
    if (0..=8).contains(&level) { level } else { 0 }
}

/// Clamp days since onset to the range accepted by the export format.
pub fn clamp_days_since_onset(days: i32) -> i32 {
    days.clamp(-14, 14)
}

/// Clamp days since onset to the range accepted by the gateway.
pub fn clamp_gateway_days_since_onset(days: i32) -> i32 {
    days.clamp(0, 14)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_data_roundtrips_through_base64() {
        let key = KeyData::from_bytes(&[7u8; 16]).unwrap();
        let decoded = KeyData::from_base64(&key.to_base64()).unwrap();
        assert_eq!(key, decoded);
    }

    #[test]
    fn key_data_rejects_wrong_length() {
        let short = STANDARD.encode([1u8; 15]);
        match KeyData::from_base64(&short) {
            Err(Error::InvalidKeyLength { expected, actual }) => {
                assert_eq!(expected, 16);
                assert_eq!(actual, 15);
            }
            other => panic!("expected length error, got {other:?}"),
        }
    }

    #[test]
    fn key_data_rejects_bad_base64() {
        assert!(matches!(
            KeyData::from_base64("not base64!"),
            Err(Error::InvalidKeyEncoding(_))
        ));
    }

    #[test]
    fn risk_level_outside_range_becomes_zero() {
        assert_eq!(normalize_risk_level(15), 0);
        assert_eq!(normalize_risk_level(-1), 0);
        assert_eq!(normalize_risk_level(8), 8);
        assert_eq!(normalize_risk_level(0), 0);
    }

    #[test]
    fn days_since_onset_clamping() {
        assert_eq!(clamp_days_since_onset(99), 14);
        assert_eq!(clamp_days_since_onset(-99), -14);
        assert_eq!(clamp_days_since_onset(3), 3);
        assert_eq!(clamp_gateway_days_since_onset(-3), 0);
        assert_eq!(clamp_gateway_days_since_onset(99), 14);
    }

    #[test]
    fn report_type_parses_unknown_values() {
        let parsed: ReportType = serde_json::from_str("\"CONFIRMED_TEST\"").unwrap();
        assert_eq!(parsed, ReportType::ConfirmedTest);
        let other: ReportType = serde_json::from_str("\"SOMETHING_NEW\"").unwrap();
        assert_eq!(other, ReportType::Unknown);
        assert_eq!(ReportType::SelfReport.as_i32(), 3);
    }

    #[test]
    fn unknown_report_type_is_default_and_round_trips() {
        assert_eq!(ReportType::default(), ReportType::Unknown);
        assert_eq!(ReportType::Unknown.as_i32(), 0);
        assert_eq!(
            serde_json::to_string(&ReportType::Unknown).unwrap(),
            "\"UNKNOWN\""
        );
        let parsed: Vec<ReportType> =
            serde_json::from_str("[\"REVOKED\", \"UNKNOWN\", \"RECURSIVE\"]").unwrap();
        assert_eq!(
            parsed,
            vec![ReportType::Revoked, ReportType::Unknown, ReportType::Recursive]
        );
    }
}
