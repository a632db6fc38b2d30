//! Export archive format.
//!
//! An export archive is a zip holding `export.bin` (a 16-byte header followed
//! by a `TemporaryExposureKeyExport` protobuf) and `export.sig` (a
//! `TEKSignatureList` signing the exact `export.bin` bytes).

use crate::error::SyncResult;
use keyrelay_core::config::ExportConfig;
use keyrelay_core::exposure::{clamp_days_since_onset, normalize_risk_level};
use keyrelay_core::{ExposureKey, ReportType};
use keyrelay_signer::ExportSigner;
use prost::Message;
use std::io::{Cursor, Write};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipWriter};

/// Header preceding the protobuf in `export.bin`.
pub const EXPORT_HEADER: &[u8; 16] = b"EK Export v1    ";

pub const EXPORT_BIN: &str = "export.bin";
pub const EXPORT_SIG: &str = "export.sig";

#[derive(Clone, PartialEq, Message)]
pub struct TemporaryExposureKeyExport {
    #[prost(fixed64, optional, tag = "1")]
    pub start_timestamp: Option<u64>,
    #[prost(fixed64, optional, tag = "2")]
    pub end_timestamp: Option<u64>,
    #[prost(string, optional, tag = "3")]
    pub region: Option<String>,
    #[prost(int32, optional, tag = "4")]
    pub batch_num: Option<i32>,
    #[prost(int32, optional, tag = "5")]
    pub batch_size: Option<i32>,
    #[prost(message, repeated, tag = "6")]
    pub signature_infos: Vec<SignatureInfo>,
    #[prost(message, repeated, tag = "7")]
    pub keys: Vec<TemporaryExposureKey>,
    #[prost(message, repeated, tag = "8")]
    pub revised_keys: Vec<TemporaryExposureKey>,
}

#[derive(Clone, PartialEq, Message)]
pub struct SignatureInfo {
    #[prost(string, optional, tag = "1")]
    pub app_bundle_id: Option<String>,
    #[prost(string, optional, tag = "3")]
    pub verification_key_version: Option<String>,
    #[prost(string, optional, tag = "4")]
    pub verification_key_id: Option<String>,
    #[prost(string, optional, tag = "5")]
    pub signature_algorithm: Option<String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct TemporaryExposureKey {
    #[prost(bytes = "vec", optional, tag = "1")]
    pub key_data: Option<Vec<u8>>,
    #[prost(int32, optional, tag = "2")]
    pub transmission_risk_level: Option<i32>,
    #[prost(int32, optional, tag = "3")]
    pub rolling_start_interval_number: Option<i32>,
    #[prost(int32, optional, tag = "4")]
    pub rolling_period: Option<i32>,
    /// Report type enum value.
    #[prost(int32, optional, tag = "5")]
    pub report_type: Option<i32>,
    #[prost(sint32, optional, tag = "6")]
    pub days_since_onset_of_symptoms: Option<i32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct TekSignatureList {
    #[prost(message, repeated, tag = "1")]
    pub signatures: Vec<TekSignature>,
}

#[derive(Clone, PartialEq, Message)]
pub struct TekSignature {
    #[prost(message, optional, tag = "1")]
    pub signature_info: Option<SignatureInfo>,
    #[prost(int32, optional, tag = "2")]
    pub batch_num: Option<i32>,
    #[prost(int32, optional, tag = "3")]
    pub batch_size: Option<i32>,
    #[prost(bytes = "vec", optional, tag = "4")]
    pub signature: Option<Vec<u8>>,
}

impl SignatureInfo {
    pub fn from_config(config: &ExportConfig) -> Self {
        Self {
            app_bundle_id: config.app_bundle_id.clone(),
            verification_key_version: config.verification_key_version.clone(),
            verification_key_id: config.verification_key_id.clone(),
            signature_algorithm: Some(config.signature_algorithm.clone()),
        }
    }
}

impl TemporaryExposureKey {
    /// Export form of a stored key. Out-of-range values are clamped, never
    /// rejected.
    pub fn from_exposure(key: &ExposureKey) -> Self {
        Self {
            key_data: Some(key.key_data.as_bytes().to_vec()),
            transmission_risk_level: Some(normalize_risk_level(key.transmission_risk_level)),
            rolling_start_interval_number: Some(key.rolling_start_number),
            rolling_period: Some(key.rolling_period),
            report_type: Some(ReportType::ConfirmedTest.as_i32()),
            days_since_onset_of_symptoms: Some(clamp_days_since_onset(key.days_since_onset)),
        }
    }
}

/// Contents of one export file before encoding.
#[derive(Debug, Clone)]
pub struct ExportBatch<'a> {
    pub region: &'a str,
    /// Unix seconds of the earliest and latest `created_at` in the batch.
    pub start_timestamp: u64,
    pub end_timestamp: u64,
    pub keys: &'a [ExposureKey],
}

/// `export.bin` bytes for a batch.
pub fn encode_export_bin(batch: &ExportBatch<'_>, signature_info: &SignatureInfo) -> Vec<u8> {
    let export = TemporaryExposureKeyExport {
        start_timestamp: Some(batch.start_timestamp),
        end_timestamp: Some(batch.end_timestamp),
        region: Some(batch.region.to_string()),
        batch_num: Some(1),
        batch_size: Some(1),
        signature_infos: vec![signature_info.clone()],
        keys: batch
            .keys
            .iter()
            .map(TemporaryExposureKey::from_exposure)
            .collect(),
        revised_keys: Vec::new(),
    };

    let mut bin = Vec::with_capacity(EXPORT_HEADER.len() + export.encoded_len());
    bin.extend_from_slice(EXPORT_HEADER);
    bin.extend_from_slice(&export.encode_to_vec());
    bin
}

/// `export.sig` bytes signing `export_bin`.
pub fn encode_export_sig(
    export_bin: &[u8],
    signature_info: &SignatureInfo,
    signer: &ExportSigner,
) -> Vec<u8> {
    TekSignatureList {
        signatures: vec![TekSignature {
            signature_info: Some(signature_info.clone()),
            batch_num: Some(1),
            batch_size: Some(1),
            signature: Some(signer.sign(export_bin)),
        }],
    }
    .encode_to_vec()
}

/// Zip `export.bin` and `export.sig` with fixed entry timestamps.
pub fn write_archive(export_bin: &[u8], export_sig: &[u8]) -> SyncResult<Vec<u8>> {
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(DateTime::default());

    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    zip.start_file(EXPORT_BIN, options)?;
    zip.write_all(export_bin)?;
    zip.start_file(EXPORT_SIG, options)?;
    zip.write_all(export_sig)?;
    Ok(zip.finish()?.into_inner())
}

/// Build a signed export archive for `batch`.
pub fn build_archive(
    batch: &ExportBatch<'_>,
    config: &ExportConfig,
    signer: &ExportSigner,
) -> SyncResult<Vec<u8>> {
    let signature_info = SignatureInfo::from_config(config);
    let export_bin = encode_export_bin(batch, &signature_info);
    let export_sig = encode_export_sig(&export_bin, &signature_info, signer);
    write_archive(&export_bin, &export_sig)
}
