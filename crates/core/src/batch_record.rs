//! Gateway batch signing record.
//!
//! The gateway verifies an upload by rebuilding, for every key, a record made
//! of fixed fields in a fixed order. Each field is rendered to bytes
//! (big-endian integers, UTF-8 strings, raw key material), base64-encoded and
//! terminated by a `.`. Records are ordered by their base64 form and
//! concatenated; the result is the content covered by the batch signature.

use crate::federation::GatewayKey;
use crate::{Error, KeyData, Result};
use base64::{Engine as _, engine::general_purpose::STANDARD};

/// One field of the signing record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordField {
    KeyData,
    RollingStartIntervalNumber,
    RollingPeriod,
    TransmissionRiskLevel,
    VisitedCountries,
    Origin,
    ReportType,
    DaysSinceOnsetOfSymptoms,
}

/// Field order expected by the gateway.
pub const RECORD_LAYOUT: [RecordField; 8] = [
    RecordField::KeyData,
    RecordField::RollingStartIntervalNumber,
    RecordField::RollingPeriod,
    RecordField::TransmissionRiskLevel,
    RecordField::VisitedCountries,
    RecordField::Origin,
    RecordField::ReportType,
    RecordField::DaysSinceOnsetOfSymptoms,
];

const FIELD_TERMINATOR: char = '.';

fn unsigned_be(field: &'static str, value: i32) -> Result<Vec<u8>> {
    let value = u32::try_from(value).map_err(|_| Error::InvalidField {
        field,
        reason: format!("{value} is negative"),
    })?;
    Ok(value.to_be_bytes().to_vec())
}

impl RecordField {
    /// Raw bytes of this field for `key`.
    pub fn encode(self, key: &GatewayKey) -> Result<Vec<u8>> {
        match self {
            Self::KeyData => Ok(KeyData::from_base64(&key.key_data)?.as_bytes().to_vec()),
            Self::RollingStartIntervalNumber => {
                unsigned_be("rollingStartIntervalNumber", key.rolling_start_interval_number)
            }
            Self::RollingPeriod => unsigned_be("rollingPeriod", key.rolling_period),
            Self::TransmissionRiskLevel => Ok(key.transmission_risk_level.to_be_bytes().to_vec()),
            Self::VisitedCountries => Ok(key.visited_countries.join(",").into_bytes()),
            Self::Origin => Ok(key.origin.as_bytes().to_vec()),
            Self::ReportType => Ok(key.report_type.as_i32().to_be_bytes().to_vec()),
            Self::DaysSinceOnsetOfSymptoms => {
                unsigned_be("days_since_onset_of_symptoms", key.days_since_onset_of_symptoms)
            }
        }
    }
}

/// Render the signing record of a single key.
pub fn encode_record(key: &GatewayKey) -> Result<String> {
    let mut record = String::new();
    for field in RECORD_LAYOUT {
        record.push_str(&STANDARD.encode(field.encode(key)?));
        record.push(FIELD_TERMINATOR);
    }
    Ok(record)
}

/// Content covered by the batch signature for `keys`.
pub fn batch_signing_bytes(keys: &[GatewayKey]) -> Result<Vec<u8>> {
    let mut records = keys
        .iter()
        .map(|key| {
            let record = encode_record(key)?;
            Ok((STANDARD.encode(record.as_bytes()), record))
        })
        .collect::<Result<Vec<_>>>()?;
    records.sort_by(|(a, _), (b, _)| a.cmp(b));

    Ok(records
        .into_iter()
        .flat_map(|(_, record)| record.into_bytes())
        .collect())
}
