//! The State Manager as the single gate for lifecycle transitions.

use std::sync::Arc;

use engine::events::EventBus;
use engine::state::{table, NewItem, StateManager, TransitionFields, WorkerKind};
use engine::{EngineEvent, ItemState, StateError};
use metadata_store::models::item::insert_item;
use metadata_store::{Database, ItemRecord};
use time::OffsetDateTime;

fn now() -> OffsetDateTime {
    let now = OffsetDateTime::now_utc();
    now.replace_millisecond(now.millisecond()).unwrap()
}

async fn setup() -> StateManager {
    let db = Database::in_memory().await.unwrap();
    StateManager::new(db, EventBus::new(256))
}

/// Insert a record directly in `state`, bypassing the transition rules
async fn seed(state: &StateManager, id: &str, item_state: ItemState) -> ItemRecord {
    let mut record = ItemRecord::new(id, None, id, item_state, now());
    record.etag = Some("E1".into());
    record.remote_etag = Some("E1".into());
    record.size = 10;
    record.version = 1;
    match item_state {
        ItemState::Error => {
            record.last_error = Some("connection reset".into());
            record.is_temporary_error = true;
        }
        ItemState::DirtyLocal | ItemState::Conflict => {
            record.local_changes = true;
            record.local_revision = 1;
            record.base_etag = Some("E1".into());
        }
        _ => {}
    }

    let mut tx = state.db().begin_immediate().await.unwrap();
    insert_item(&mut tx, &record).await.unwrap();
    tx.commit().await.unwrap();
    record
}

#[tokio::test]
async fn test_every_state_pair() {
    let state = setup().await;

    for from in ItemState::ALL {
        for to in ItemState::ALL {
            let id = format!("{from}-{to}");
            let seeded = seed(&state, &id, from).await;
            let fields = if to == ItemState::Error {
                TransitionFields::error("boom", true)
            } else {
                TransitionFields::new()
            };

            let result = state.transition(&id, to, fields).await;
            let stored = state.require(&id).await.unwrap();

            if table::is_allowed(from, to) {
                let done = result.unwrap_or_else(|e| panic!("{from} -> {to}: {e}"));
                assert_eq!(done.prior, from);
                assert_eq!(stored.state, to);
                assert_eq!(stored.version, seeded.version + 1);
            } else {
                assert!(
                    matches!(result, Err(StateError::InvalidTransition { .. })),
                    "{from} -> {to} should be rejected"
                );
                assert_eq!(stored, seeded, "{from} -> {to} mutated the record");
            }
        }
    }
}

#[tokio::test]
async fn test_events_follow_commit_order() {
    let state = setup().await;
    let events = state.events().subscribe();

    state
        .create(NewItem::remote("a", None, "a.txt", "E1", 3))
        .await
        .unwrap();
    for target in [ItemState::Hydrating, ItemState::Hydrated, ItemState::DirtyLocal] {
        state
            .transition("a", target, TransitionFields::new())
            .await
            .unwrap();
    }

    let changes: Vec<_> = events
        .drain()
        .filter_map(|event| match event {
            EngineEvent::StateChanged(change) => Some(change),
            _ => None,
        })
        .collect();
    let observed: Vec<_> = changes
        .iter()
        .map(|c| (c.prior_state, c.new_state, c.version))
        .collect();
    assert_eq!(
        observed,
        vec![
            (None, ItemState::Ghost, 1),
            (Some(ItemState::Ghost), ItemState::Hydrating, 2),
            (Some(ItemState::Hydrating), ItemState::Hydrated, 3),
            (Some(ItemState::Hydrated), ItemState::DirtyLocal, 4),
        ]
    );
}

#[tokio::test]
async fn test_virtual_entries_stay_hydrated() {
    let state = setup().await;
    let created = state
        .create(NewItem::virtual_entry("v", None, "README", 12))
        .await
        .unwrap();
    assert_eq!(created.state, ItemState::Hydrated);
    assert!(created.is_virtual);

    for target in [ItemState::Ghost, ItemState::DirtyLocal, ItemState::Deleted, ItemState::Error] {
        let fields = TransitionFields::error("boom", false);
        let err = state.transition("v", target, fields).await.unwrap_err();
        assert!(matches!(err, StateError::VirtualEntryImmutable(_)), "{target}");
    }
    assert!(matches!(
        state.record_local_write("v", 1).await,
        Err(StateError::VirtualEntryImmutable(_))
    ));
    assert!(matches!(
        state
            .claim("v", WorkerKind::Upload, &[ItemState::Hydrated])
            .await,
        Err(StateError::VirtualEntryImmutable(_))
    ));

    // hydrated to hydrated is accepted and changes nothing
    state
        .transition("v", ItemState::Hydrated, TransitionFields::new())
        .await
        .unwrap();
    assert_eq!(state.require("v").await.unwrap(), created);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_attempts_on_one_record() {
    let state = setup().await;
    state
        .create(NewItem::remote("a", None, "a", "E1", 10))
        .await
        .unwrap();

    let state = Arc::new(state);
    let mut handles = Vec::new();
    for _ in 0..10 {
        let state = state.clone();
        handles.push(tokio::spawn(async move {
            state.begin_hydration("a", WorkerKind::Hydration).await
        }));
    }

    let mut leases = Vec::new();
    let mut rejected = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(lease) => leases.push(lease),
            Err(StateError::InvalidTransition { from, .. }) => {
                assert_eq!(from, ItemState::Hydrating);
                rejected += 1;
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    assert_eq!(leases.len(), 1);
    assert_eq!(rejected, 9);
    let record = state.require("a").await.unwrap();
    assert_eq!(record.state, ItemState::Hydrating);
    assert_eq!(record.version, 2);
    assert_eq!(
        record.hydration_worker(),
        Some(leases[0].worker_id),
    );
}

#[tokio::test]
async fn test_error_stamps_and_clears() {
    let state = setup().await;
    state
        .create(NewItem::remote("a", None, "a", "E1", 10))
        .await
        .unwrap();
    let lease = state
        .begin_hydration("a", WorkerKind::Hydration)
        .await
        .unwrap();

    // an empty message is refused and the record is left alone
    let before = state.require("a").await.unwrap();
    let err = state
        .transition("a", ItemState::Error, TransitionFields::error("  ", true))
        .await
        .unwrap_err();
    assert!(matches!(err, StateError::InvalidFields { .. }));
    assert_eq!(state.require("a").await.unwrap(), before);

    let fields = TransitionFields::error("timed out", true).with_lease(lease.worker_id);
    state.transition("a", ItemState::Error, fields).await.unwrap();
    let failed = state.require("a").await.unwrap();
    assert_eq!(failed.last_error.as_deref(), Some("timed out"));
    assert!(failed.is_temporary_error);
    assert_eq!(failed.retry_count, 1);
    let hydration = failed.hydration.clone().unwrap();
    assert_eq!(hydration.error.as_deref(), Some("timed out"));
    assert!(hydration.completed_at.is_some());
    drop(lease);

    let status = state.status("a").await.unwrap();
    assert_eq!(status.state, ItemState::Error);
    assert_eq!(status.last_error.as_deref(), Some("timed out"));

    let _retry = state
        .begin_hydration("a", WorkerKind::Hydration)
        .await
        .unwrap();
    let retrying = state.require("a").await.unwrap();
    assert_eq!(retrying.last_error, None);
    assert!(!retrying.is_temporary_error);
    assert_eq!(retrying.retry_count, 1);
}

#[tokio::test]
async fn test_stale_lease_cannot_complete() {
    let state = setup().await;
    state
        .create(NewItem::remote("a", None, "a", "E1", 10))
        .await
        .unwrap();

    let first = state
        .begin_hydration("a", WorkerKind::Hydration)
        .await
        .unwrap();
    // someone else fails the hydration, revoking the first worker
    state
        .transition("a", ItemState::Error, TransitionFields::error("aborted", true))
        .await
        .unwrap();
    assert!(first.is_cancelled());

    let second = state
        .begin_hydration("a", WorkerKind::Hydration)
        .await
        .unwrap();
    let fields = TransitionFields::new()
        .with_etag("E1")
        .with_lease(first.worker_id);
    let err = state
        .transition("a", ItemState::Hydrated, fields)
        .await
        .unwrap_err();
    assert!(matches!(err, StateError::LeaseLost { .. }));

    // dropping the stale lease leaves the new holder registered
    drop(first);
    assert_eq!(
        state.active_worker("a").map(|h| h.worker_id),
        Some(second.worker_id)
    );
    let fields = TransitionFields::new()
        .with_etag("E1")
        .with_lease(second.worker_id);
    state.transition("a", ItemState::Hydrated, fields).await.unwrap();
}

#[tokio::test]
async fn test_create_rejects_duplicates() {
    let state = setup().await;
    state
        .create(NewItem::local("a", None, "a", 1))
        .await
        .unwrap();
    let err = state
        .create(NewItem::remote("a", None, "a", "E1", 1))
        .await
        .unwrap_err();
    assert!(matches!(err, StateError::AlreadyExists(_)));

    let record = state.require("a").await.unwrap();
    assert_eq!(record.state, ItemState::DirtyLocal);
    assert!(record.local_changes);
    assert_eq!(record.local_revision, 1);
}

#[tokio::test]
async fn test_recover_fails_orphaned_hydrations() {
    let state = setup().await;
    seed(&state, "orphan", ItemState::Hydrating).await;
    state
        .create(NewItem::remote("live", None, "live", "E1", 1))
        .await
        .unwrap();
    let _lease = state
        .begin_hydration("live", WorkerKind::Hydration)
        .await
        .unwrap();

    assert_eq!(state.recover().await.unwrap(), 1);

    let orphan = state.require("orphan").await.unwrap();
    assert_eq!(orphan.state, ItemState::Error);
    assert!(orphan.is_temporary_error);
    assert_eq!(
        state.require("live").await.unwrap().state,
        ItemState::Hydrating
    );
}
