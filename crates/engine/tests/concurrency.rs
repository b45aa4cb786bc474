//! Many records and many callers at once.

mod common;

use std::time::Duration;

use common::{remote_item, setup};
use engine::delta::DeltaChange;
use engine::error::EvictionError;
use engine::remote::{Fault, RemoteErrorKind, RemoteOp};
use engine::{EngineEvent, ItemState};
use tokio_util::sync::CancellationToken;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_twenty_records_hydrate_and_upload() {
    let h = setup().await;
    h.engine.start();

    let mut changes = Vec::new();
    for i in 0..20 {
        let id = format!("item-{i}");
        let data = format!("content of item {i}");
        let etag = h.remote.insert(&id, data.clone().into_bytes());
        changes.push(DeltaChange::Upsert(remote_item(&id, &etag, data.len())));
    }
    let summary = h.engine.delta().apply(changes).await;
    assert_eq!(summary.created, 20);

    let mut reads = Vec::new();
    for i in 0..20 {
        let engine = h.engine.clone();
        reads.push(tokio::spawn(async move {
            let id = format!("item-{i}");
            let content = engine.read(&id).await.unwrap();
            content.read_all().await.unwrap()
        }));
    }
    for (i, read) in reads.into_iter().enumerate() {
        let bytes = read.await.unwrap();
        assert_eq!(bytes.as_ref(), format!("content of item {i}").as_bytes());
    }

    let mut writes = Vec::new();
    for i in 0..20 {
        let engine = h.engine.clone();
        writes.push(tokio::spawn(async move {
            let id = format!("item-{i}");
            engine
                .write(&id, format!("edited item {i}").as_bytes())
                .await
                .unwrap();
            engine.write_close(&id).await.unwrap();
        }));
    }
    for write in writes {
        write.await.unwrap();
    }

    for i in 0..20 {
        let id = format!("item-{i}");
        let record = h.wait_for(&id, ItemState::Hydrated).await;
        assert!(!record.local_changes);
        assert_eq!(
            h.remote.content(&id).unwrap().as_ref(),
            format!("edited item {i}").as_bytes()
        );
    }
    h.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_readers_share_one_download() {
    let h = setup().await;
    h.publish("shared", b"0123456789ab").await;
    h.remote.set_latency(Some(Duration::from_millis(20)));

    let mut readers = Vec::new();
    for _ in 0..8 {
        let engine = h.engine.clone();
        readers.push(tokio::spawn(async move {
            let content = engine.read("shared").await.unwrap();
            content.read_all().await.unwrap()
        }));
    }
    for reader in readers {
        assert_eq!(reader.await.unwrap().as_ref(), b"0123456789ab");
    }

    // three 4-byte chunks, fetched once
    assert_eq!(h.remote.download_count("shared"), 3);
}

#[tokio::test]
async fn test_open_file_blocks_eviction() {
    let h = setup().await;
    h.publish("doc", b"hello").await;

    let content = h.engine.read("doc").await.unwrap();
    assert!(matches!(
        h.engine.sweeper().evict("doc").await,
        Err(EvictionError::InUse(_))
    ));
    assert_eq!(h.record("doc").await.state, ItemState::Hydrated);

    drop(content);
    h.engine.sweeper().evict("doc").await.unwrap();
    assert_eq!(h.record("doc").await.state, ItemState::Ghost);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_delete_cancels_hydration() {
    let h = setup().await;
    h.publish("slow", b"0123456789abcdefghij").await;
    h.remote.set_latency(Some(Duration::from_millis(50)));
    let events = h.engine.subscribe();

    let engine = h.engine.clone();
    let reader = tokio::spawn(async move { engine.read("slow").await });
    h.wait_for("slow", ItemState::Hydrating).await;

    let deleted = h.engine.delete_local("slow").await.unwrap();
    assert_eq!(deleted.state, ItemState::Deleted);
    assert!(reader.await.unwrap().is_err());
    assert_eq!(h.record("slow").await.state, ItemState::Deleted);

    let states: Vec<_> = events
        .drain()
        .filter_map(|event| match event {
            EngineEvent::StateChanged(change) if change.id == "slow" => Some(change.new_state),
            _ => None,
        })
        .collect();
    assert_eq!(states.last(), Some(&ItemState::Deleted));
    assert!(states.contains(&ItemState::Hydrating));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_no_half_applied_records_under_load() {
    let h = setup().await;
    let mut changes = Vec::new();
    for i in 0..20 {
        let id = format!("item-{i}");
        let etag = h.remote.insert(&id, vec![b'x'; 16]);
        changes.push(DeltaChange::Upsert(remote_item(&id, &etag, 16)));
    }
    h.engine.delta().apply(changes).await;
    h.remote
        .inject(Fault::new(RemoteOp::Download, RemoteErrorKind::PermissionDenied).for_id("item-7"));

    let done = CancellationToken::new();
    let observer = {
        let state = h.engine.state().clone();
        let done = done.clone();
        tokio::spawn(async move {
            let mut observed = 0;
            while !done.is_cancelled() {
                for record in state.db().list_items().await.unwrap() {
                    match record.state {
                        ItemState::Hydrating => {
                            let hydration = record.hydration.as_ref().unwrap();
                            assert!(hydration.started_at.is_some());
                            assert!(hydration.worker_id.is_some());
                        }
                        ItemState::Error => {
                            assert!(!record.last_error.as_deref().unwrap_or("").is_empty());
                        }
                        _ => {}
                    }
                    observed += 1;
                }
                tokio::task::yield_now().await;
            }
            observed
        })
    };

    let mut reads = Vec::new();
    for i in 0..20 {
        let engine = h.engine.clone();
        reads.push(tokio::spawn(async move {
            engine.read(&format!("item-{i}")).await.is_ok()
        }));
    }
    let mut succeeded = 0;
    for read in reads {
        if read.await.unwrap() {
            succeeded += 1;
        }
    }
    done.cancel();
    assert!(observer.await.unwrap() > 0);

    assert_eq!(succeeded, 19);
    assert_eq!(h.record("item-7").await.state, ItemState::Error);
}
