mod common;

use common::{TestEngine, expired_key, key_b64, valid_key};
use keyrelay_core::config::AppConfig;
use keyrelay_engine::export::format::{
    EXPORT_BIN, EXPORT_SIG, TekSignatureList, TemporaryExposureKeyExport,
};
use keyrelay_engine::run_export;
use keyrelay_metadata::repos::{ExportFileRepo, ExposureRepo};
use prost::Message;
use std::io::{Cursor, Read};
use time::{Duration, OffsetDateTime};

async fn read_entry(engine: &TestEngine, path: &str, name: &str) -> Vec<u8> {
    let archive = engine.state.storage.get(path).await.unwrap();
    let mut zip = zip::ZipArchive::new(Cursor::new(archive.to_vec())).unwrap();
    let mut entry = zip.by_name(name).unwrap();
    let mut out = Vec::new();
    entry.read_to_end(&mut out).unwrap();
    out
}

async fn read_export(engine: &TestEngine, path: &str) -> TemporaryExposureKeyExport {
    let bin = read_entry(engine, path, EXPORT_BIN).await;
    assert_eq!(&bin[..16], b"EK Export v1    ");
    TemporaryExposureKeyExport::decode(&bin[16..]).unwrap()
}

#[tokio::test]
async fn export_writes_one_signed_file_per_region() {
    let now = OffsetDateTime::now_utc();
    let mut config = AppConfig::for_testing();
    config.exports.native_regions = vec!["IE".to_string(), "NI".to_string()];
    let engine = TestEngine::new(config).await;

    let mut ni = expired_key(3, now, 2);
    ni.regions = vec!["NI".to_string()];
    let mut clamped = expired_key(1, now, 2);
    clamped.transmission_risk_level = 15;
    clamped.days_since_onset = 99;
    engine
        .store()
        .insert_exposures(&[clamped, expired_key(2, now, 3), ni], now)
        .await
        .unwrap();

    let report = run_export(&engine.state, now).await.unwrap();
    assert_eq!(report.files.len(), 2);
    assert_eq!(report.deferred, 0);

    let ie = report.files.iter().find(|f| f.region == "IE").unwrap();
    assert!(ie.path.starts_with("exposures/ie/"));
    assert!(ie.path.ends_with(".zip"));
    assert_eq!(ie.exposure_count, 2);
    let ni = report.files.iter().find(|f| f.region == "NI").unwrap();
    assert!(ni.path.starts_with("exposures/ni/"));
    assert_ne!(ie.path, ni.path);

    let export = read_export(&engine, &ie.path).await;
    assert_eq!(export.region.as_deref(), Some("IE"));
    assert_eq!(export.keys.len(), 2);
    // Keys are ordered by key material.
    assert_eq!(export.keys[0].key_data.as_deref(), Some(&[1u8; 16][..]));
    assert_eq!(export.keys[0].transmission_risk_level, Some(0));
    assert_eq!(export.keys[0].days_since_onset_of_symptoms, Some(14));
    assert_eq!(export.start_timestamp, Some(now.unix_timestamp() as u64));

    let sig = read_entry(&engine, &ie.path, EXPORT_SIG).await;
    let sig = TekSignatureList::decode(sig.as_slice()).unwrap();
    assert_eq!(sig.signatures.len(), 1);
    assert_eq!(sig.signatures[0].batch_num, Some(1));

    let files = engine.store().list_export_files().await.unwrap();
    assert_eq!(files.len(), 2);
}

#[tokio::test]
async fn second_export_run_is_a_no_op() {
    let now = OffsetDateTime::now_utc();
    let engine = TestEngine::new(AppConfig::for_testing()).await;
    engine
        .store()
        .insert_exposures(&[expired_key(1, now, 2), expired_key(2, now, 2)], now)
        .await
        .unwrap();

    let first = run_export(&engine.state, now).await.unwrap();
    assert_eq!(first.files.len(), 1);
    let bin = read_entry(&engine, &first.files[0].path, EXPORT_BIN).await;

    let second = run_export(&engine.state, now).await.unwrap();
    assert!(second.files.is_empty());
    assert_eq!(engine.store().list_export_files().await.unwrap().len(), 1);

    let later = run_export(&engine.state, now + Duration::minutes(5))
        .await
        .unwrap();
    assert!(later.files.is_empty());

    let again = read_entry(&engine, &first.files[0].path, EXPORT_BIN).await;
    assert_eq!(bin, again);
}

#[tokio::test]
async fn still_valid_keys_are_deferred_not_exported() {
    let now = OffsetDateTime::now_utc();
    let engine = TestEngine::new(AppConfig::for_testing()).await;
    let store = engine.store();

    store
        .insert_exposures(&[expired_key(1, now, 2), valid_key(2, now)], now)
        .await
        .unwrap();
    let before = store.get_exposure_by_key(&key_b64(2)).await.unwrap().unwrap();

    let report = run_export(&engine.state, now).await.unwrap();
    assert_eq!(report.deferred, 1);
    assert_eq!(report.files.len(), 1);

    let export = read_export(&engine, &report.files[0].path).await;
    assert_eq!(export.keys.len(), 1);
    assert_eq!(export.keys[0].key_data.as_deref(), Some(&[1u8; 16][..]));

    let after = store.get_exposure_by_key(&key_b64(2)).await.unwrap().unwrap();
    assert!(after.id > before.id);
    assert!(after.created_at >= before.created_at);
    assert_eq!(after.rolling_start_number, before.rolling_start_number);
    assert_eq!(after.rolling_period, before.rolling_period);
    assert_eq!(after.transmission_risk_level, before.transmission_risk_level);
    assert_eq!(after.regions, before.regions);
    assert_eq!(after.origin, before.origin);
}

#[tokio::test]
async fn disabled_validity_check_exports_everything() {
    let now = OffsetDateTime::now_utc();
    let mut config = AppConfig::for_testing();
    config.exports.disable_valid_key_check = true;
    let engine = TestEngine::new(config).await;

    engine
        .store()
        .insert_exposures(&[valid_key(1, now), valid_key(2, now)], now)
        .await
        .unwrap();

    let report = run_export(&engine.state, now).await.unwrap();
    assert_eq!(report.deferred, 0);
    assert_eq!(report.files.len(), 1);
    assert_eq!(report.files[0].exposure_count, 2);
}

#[tokio::test]
async fn retention_removes_old_keys_and_their_files() {
    let now = OffsetDateTime::now_utc();
    let then = now - Duration::days(20);
    let engine = TestEngine::new(AppConfig::for_testing()).await;
    let store = engine.store();

    store
        .insert_exposures(&[expired_key(1, then, 2)], then)
        .await
        .unwrap();
    let old = run_export(&engine.state, then).await.unwrap();
    assert_eq!(old.files.len(), 1);
    let old_path = old.files[0].path.clone();
    assert!(engine.state.storage.exists(&old_path).await.unwrap());

    store
        .insert_exposures(&[expired_key(2, now, 2)], now)
        .await
        .unwrap();
    let report = run_export(&engine.state, now).await.unwrap();

    assert_eq!(report.removed_files, vec![old_path.clone()]);
    assert!(report.expired_through.is_some());
    assert!(!engine.state.storage.exists(&old_path).await.unwrap());
    assert!(store.get_exposure_by_key(&key_b64(1)).await.unwrap().is_none());

    assert_eq!(report.files.len(), 1);
    let remaining = store.list_export_files().await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].path, report.files[0].path);
}

#[tokio::test]
async fn daily_window_exports_yesterdays_keys() {
    let now = OffsetDateTime::now_utc();
    let yesterday = now - Duration::days(1);
    let engine = TestEngine::new(AppConfig::for_testing()).await;

    engine
        .store()
        .insert_exposures(&[expired_key(4, now, 3)], yesterday)
        .await
        .unwrap();

    let report = run_export(&engine.state, now).await.unwrap();
    assert_eq!(report.files.len(), 1);
    assert_eq!(report.files[0].exposure_count, 1);

    let again = run_export(&engine.state, now).await.unwrap();
    assert!(again.files.is_empty());
    assert_eq!(again.existing, 1);
}
