//! Integration tests for key store implementations.

mod common;

use common::{federated_key, local_key, run_metadata_test_both};
use keyrelay_metadata::models::{NewExportFile, NewUploadBatch};
use time::macros::{date, datetime};
use time::{Duration, OffsetDateTime};

#[tokio::test]
async fn test_insert_skips_duplicate_key_data() {
    run_metadata_test_both(|store| async move {
        let now = OffsetDateTime::now_utc();
        let keys = vec![local_key(1, "IE"), local_key(2, "IE")];

        assert_eq!(store.insert_exposures(&keys, now).await.unwrap(), 2);
        // Same key material again, plus one new key.
        let again = vec![local_key(2, "IE"), local_key(3, "IE")];
        assert_eq!(store.insert_exposures(&again, now).await.unwrap(), 1);
        assert_eq!(store.count_exposures().await.unwrap(), 3);

        let row = store
            .get_exposure_by_key(&local_key(1, "IE").key_data.to_base64())
            .await
            .unwrap()
            .expect("stored key");
        let decoded = row.to_exposure_key().unwrap();
        assert_eq!(decoded, local_key(1, "IE"));
    })
    .await;
}

#[tokio::test]
async fn test_local_exposures_exclude_federated_keys() {
    run_metadata_test_both(|store| async move {
        let now = OffsetDateTime::now_utc();
        let keys = vec![
            local_key(1, "IE"),
            federated_key(2, "NI"),
            local_key(3, "IE"),
            local_key(4, "IE"),
        ];
        store.insert_exposures(&keys, now).await.unwrap();

        let all = store.get_local_exposures_after(0, 1000).await.unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.iter().all(|row| row.origin.is_none()));
        assert!(all.windows(2).all(|w| w[0].id < w[1].id));

        let limited = store.get_local_exposures_after(0, 2).await.unwrap();
        assert_eq!(limited.len(), 2);

        let after = store
            .get_local_exposures_after(limited[1].id, 1000)
            .await
            .unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].id, all[2].id);
    })
    .await;
}

#[tokio::test]
async fn test_export_query_orders_by_key_and_respects_end() {
    run_metadata_test_both(|store| async move {
        let early = datetime!(2021-03-10 08:00 UTC);
        let late = datetime!(2021-03-10 20:00 UTC);
        store
            .insert_exposures(&[local_key(9, "IE"), local_key(1, "IE")], early)
            .await
            .unwrap();
        store
            .insert_exposures(&[local_key(5, "IE")], late)
            .await
            .unwrap();

        let all = store.get_exposures_for_export(0, None).await.unwrap();
        let keys: Vec<_> = all.iter().map(|r| r.key_data.clone()).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        assert_eq!(all.len(), 3);

        let before_noon = store
            .get_exposures_for_export(0, Some(datetime!(2021-03-10 12:00 UTC)))
            .await
            .unwrap();
        assert_eq!(before_noon.len(), 2);

        let min_late = store.min_exposure_id_since(late).await.unwrap();
        let late_row = store
            .get_exposure_by_key(&local_key(5, "IE").key_data.to_base64())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(min_late, Some(late_row.id));
        assert_eq!(
            store
                .min_exposure_id_since(late + Duration::hours(1))
                .await
                .unwrap(),
            None
        );
    })
    .await;
}

#[tokio::test]
async fn test_export_order_is_bytewise_on_both_backends() {
    run_metadata_test_both(|store| async move {
        let now = OffsetDateTime::now_utc();
        // Base64 forms start with 'a', 'B', '/' and '+'; a locale collation
        // would order these differently from their bytes.
        let keys = vec![
            local_key(0x68, "IE"),
            local_key(0x04, "IE"),
            local_key(0xFC, "IE"),
            local_key(0xF8, "IE"),
        ];
        store.insert_exposures(&keys, now).await.unwrap();

        let rows = store.get_exposures_for_export(0, None).await.unwrap();
        let order: Vec<_> = rows.iter().map(|r| &r.key_data[..1]).collect();
        assert_eq!(order, vec!["+", "/", "B", "a"]);
    })
    .await;
}

#[tokio::test]
async fn test_defer_exposure_reinserts_with_new_id() {
    run_metadata_test_both(|store| async move {
        let created = datetime!(2021-03-10 08:00 UTC);
        let deferred_at = datetime!(2021-03-10 09:00 UTC);
        store
            .insert_exposures(&[local_key(1, "IE"), local_key(2, "IE")], created)
            .await
            .unwrap();

        let key = local_key(1, "IE").key_data.to_base64();
        let before = store.get_exposure_by_key(&key).await.unwrap().unwrap();

        let new_id = store
            .defer_exposure(before.id, deferred_at)
            .await
            .unwrap()
            .expect("row existed");
        assert!(new_id > before.id);

        let after = store.get_exposure_by_key(&key).await.unwrap().unwrap();
        assert_eq!(after.id, new_id);
        assert_eq!(after.created_at, deferred_at);
        assert_eq!(after.rolling_start_number, before.rolling_start_number);
        assert_eq!(after.regions, before.regions);
        assert_eq!(store.count_exposures().await.unwrap(), 2);

        // Deferring an id that no longer exists is a no-op.
        assert_eq!(
            store.defer_exposure(before.id, deferred_at).await.unwrap(),
            None
        );
    })
    .await;
}

#[tokio::test]
async fn test_delete_exposures_returns_max_deleted_id() {
    run_metadata_test_both(|store| async move {
        let old = datetime!(2021-02-01 00:00 UTC);
        let recent = datetime!(2021-03-10 00:00 UTC);
        store
            .insert_exposures(&[local_key(1, "IE"), local_key(2, "IE")], old)
            .await
            .unwrap();
        store
            .insert_exposures(&[local_key(3, "IE")], recent)
            .await
            .unwrap();

        let old_max = store
            .get_exposure_by_key(&local_key(2, "IE").key_data.to_base64())
            .await
            .unwrap()
            .unwrap()
            .id;

        let cutoff = datetime!(2021-02-24 00:00 UTC);
        let deleted = store.delete_exposures_created_before(cutoff).await.unwrap();
        assert_eq!(deleted, Some(old_max));
        assert_eq!(store.count_exposures().await.unwrap(), 1);

        assert_eq!(
            store.delete_exposures_created_before(cutoff).await.unwrap(),
            None
        );
    })
    .await;
}

#[tokio::test]
async fn test_download_batch_records_cursor_with_keys() {
    run_metadata_test_both(|store| async move {
        let day = datetime!(2021-03-10 10:00 UTC);
        assert!(store.latest_download_batch("ni", None).await.unwrap().is_none());

        let inserted = store
            .ingest_download_batch("ni", Some("tag-1"), &[federated_key(1, "ni")], day)
            .await
            .unwrap();
        assert_eq!(inserted, 1);
        store
            .ingest_download_batch(
                "ni",
                Some("tag-2"),
                &[federated_key(1, "ni"), federated_key(2, "ni")],
                day + Duration::minutes(5),
            )
            .await
            .unwrap();

        let latest = store.latest_download_batch("ni", None).await.unwrap().unwrap();
        assert_eq!(latest.batch_tag, "tag-2");
        assert_eq!(store.count_exposures().await.unwrap(), 2);

        // Scoped lookups ignore batches recorded before `since`.
        let next_day = datetime!(2021-03-11 00:00 UTC);
        assert!(
            store
                .latest_download_batch("ni", Some(next_day))
                .await
                .unwrap()
                .is_none()
        );
        assert!(store.latest_download_batch("efgs", None).await.unwrap().is_none());

        // Terminal pages store keys without a cursor row.
        store
            .ingest_download_batch("ni", None, &[federated_key(3, "ni")], day)
            .await
            .unwrap();
        let latest = store.latest_download_batch("ni", None).await.unwrap().unwrap();
        assert_eq!(latest.batch_tag, "tag-2");
    })
    .await;
}

#[tokio::test]
async fn test_upload_batch_commit_and_rollback() {
    run_metadata_test_both(|store| async move {
        let now = OffsetDateTime::now_utc();
        assert_eq!(store.last_uploaded_exposure_id("ni").await.unwrap(), 0);

        let pending = store
            .begin_upload_batch(&NewUploadBatch {
                server_id: "ni".to_string(),
                exposure_count: 3,
                last_exposure_id: 7,
                created_at: now,
            })
            .await
            .unwrap();
        assert!(pending.batch_id() > 0);
        pending.rollback().await.unwrap();
        assert_eq!(store.last_uploaded_exposure_id("ni").await.unwrap(), 0);

        let pending = store
            .begin_upload_batch(&NewUploadBatch {
                server_id: "ni".to_string(),
                exposure_count: 3,
                last_exposure_id: 7,
                created_at: now,
            })
            .await
            .unwrap();
        let batch_id = pending.batch_id();
        pending.commit().await.unwrap();
        assert_eq!(store.last_uploaded_exposure_id("ni").await.unwrap(), 7);
        assert_eq!(store.last_uploaded_exposure_id("efgs").await.unwrap(), 0);

        let batches = store.list_upload_batches("ni").await.unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].id, batch_id);
        assert_eq!(batches[0].exposure_count, 3);
    })
    .await;
}

#[tokio::test]
async fn test_export_file_records() {
    run_metadata_test_both(|store| async move {
        let created = datetime!(2021-03-10 12:00 UTC);
        let file = NewExportFile {
            path: "exposures/ie/1615377600000.zip".to_string(),
            exposure_count: 4,
            since_exposure_id: 0,
            last_exposure_id: 10,
            first_exposure_created_at: datetime!(2021-03-10 08:00 UTC),
            region: "IE".to_string(),
            created_at: created,
        };

        assert!(!store.export_file_exists(0, 10, "IE").await.unwrap());
        assert!(store.create_export_file(&file).await.unwrap());
        assert!(!store.create_export_file(&file).await.unwrap());
        assert!(store.export_file_exists(0, 10, "IE").await.unwrap());
        assert!(!store.export_file_exists(0, 10, "GB").await.unwrap());

        assert_eq!(
            store.max_exported_exposure_id_before(created).await.unwrap(),
            0
        );
        assert_eq!(
            store
                .max_exported_exposure_id_before(created + Duration::seconds(1))
                .await
                .unwrap(),
            10
        );

        let later = NewExportFile {
            path: "exposures/ie/1615381200000.zip".to_string(),
            since_exposure_id: 10,
            last_exposure_id: 20,
            ..file.clone()
        };
        assert!(store.create_export_file(&later).await.unwrap());

        let deleted = store.delete_export_files_through(15).await.unwrap();
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].path, file.path);

        let remaining = store.list_export_files().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].last_exposure_id, 20);
    })
    .await;
}

#[tokio::test]
async fn test_metric_upsert_accumulates() {
    run_metadata_test_both(|store| async move {
        let day = date!(2021 - 03 - 10);
        assert_eq!(
            store.get_metric(day, "INTEROP_KEYS_DOWNLOADED", "", "").await.unwrap(),
            None
        );

        store
            .record_metric(day, "INTEROP_KEYS_DOWNLOADED", "", "", 5)
            .await
            .unwrap();
        store
            .record_metric(day, "INTEROP_KEYS_DOWNLOADED", "", "", 7)
            .await
            .unwrap();
        store
            .record_metric(day.next_day().unwrap(), "INTEROP_KEYS_DOWNLOADED", "", "", 1)
            .await
            .unwrap();

        assert_eq!(
            store.get_metric(day, "INTEROP_KEYS_DOWNLOADED", "", "").await.unwrap(),
            Some(12)
        );
        assert_eq!(
            store.get_metric(day, "EFGS_KEYS_DOWNLOADED", "", "").await.unwrap(),
            None
        );
    })
    .await;
}
