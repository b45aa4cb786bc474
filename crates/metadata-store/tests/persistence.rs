//! Durability of item records across a close and reopen of the database file.

use metadata_store::models::item::{insert_item, update_item};
use metadata_store::{Database, HydrationInfo, ItemRecord, ItemState, UploadCheckpoint};
use tempfile::TempDir;
use time::OffsetDateTime;

fn now() -> OffsetDateTime {
    let now = OffsetDateTime::now_utc();
    now.replace_millisecond(now.millisecond()).unwrap()
}

async fn setup_test_db() -> (Database, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let db = Database::new(temp_dir.path().join("metadata.db"))
        .await
        .unwrap();
    (db, temp_dir)
}

#[tokio::test]
async fn test_every_field_survives_reopen() {
    let (db, temp_dir) = setup_test_db().await;

    let mut item = ItemRecord::new("item-1", Some("root".into()), "report.pdf", ItemState::Error, now());
    item.etag = Some("E1".into());
    item.remote_etag = Some("E2".into());
    item.base_etag = Some("E1".into());
    item.size = 123_456;
    item.hydration = Some(HydrationInfo {
        started_at: Some(now()),
        completed_at: Some(now()),
        worker_id: None,
        error: Some("connection reset".into()),
    });
    item.last_error = Some("connection reset".into());
    item.is_temporary_error = true;
    item.local_changes = true;
    item.local_revision = 3;
    item.upload = Some(UploadCheckpoint {
        session: "session-9".into(),
        offset: 20 * 1024 * 1024,
        total: 64 * 1024 * 1024,
    });
    item.retry_count = 2;
    item.last_accessed_at = Some(now());
    item.version = 7;

    let mut tx = db.begin_immediate().await.unwrap();
    insert_item(&mut tx, &item).await.unwrap();
    tx.commit().await.unwrap();
    db.close().await;

    let reopened = Database::new(temp_dir.path().join("metadata.db"))
        .await
        .unwrap();
    let stored = reopened.get_item("item-1").await.unwrap().unwrap();
    assert_eq!(stored, item);
}

#[tokio::test]
async fn test_committed_update_survives_reopen() {
    let (db, temp_dir) = setup_test_db().await;

    let item = ItemRecord::new("item-2", None, "notes.txt", ItemState::Ghost, now());
    let mut tx = db.begin_immediate().await.unwrap();
    insert_item(&mut tx, &item).await.unwrap();
    tx.commit().await.unwrap();

    let mut hydrated = item.clone();
    hydrated.state = ItemState::Hydrated;
    hydrated.etag = Some("E1".into());
    hydrated.size = 512;
    hydrated.version = 1;
    let mut tx = db.begin_immediate().await.unwrap();
    update_item(&mut tx, &hydrated).await.unwrap();
    tx.commit().await.unwrap();
    db.close().await;

    let reopened = Database::new(temp_dir.path().join("metadata.db"))
        .await
        .unwrap();
    let stored = reopened.get_item("item-2").await.unwrap().unwrap();
    assert_eq!(stored.state, ItemState::Hydrated);
    assert_eq!(stored.etag.as_deref(), Some("E1"));
    assert_eq!(stored.size, 512);
}

#[tokio::test]
async fn test_writers_on_different_records_do_not_fail() {
    let (db, _temp_dir) = setup_test_db().await;

    let mut handles = Vec::new();
    for i in 0..16 {
        let db = db.clone();
        handles.push(tokio::spawn(async move {
            let item = ItemRecord::new(format!("item-{i}"), None, format!("f{i}"), ItemState::Ghost, now());
            let mut tx = db.begin_immediate().await.unwrap();
            insert_item(&mut tx, &item).await.unwrap();
            tx.commit().await.unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(db.list_items().await.unwrap().len(), 16);
}
