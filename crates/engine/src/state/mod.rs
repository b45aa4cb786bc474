//! State Manager
//!
//! The only writer of item records. Every operation:
//!
//! 1. takes the record's lock, so writers of one record queue up while
//!    writers of different records proceed independently,
//! 2. reads, validates and writes the record inside one `BEGIN IMMEDIATE`
//!    transaction, so a failed validation leaves the row untouched and a
//!    reader sees either the old row or the new one,
//! 3. after commit, and still under the lock, updates the worker registry
//!    and publishes the state-change event. Per record, events therefore go
//!    out in commit order.

mod fields;
mod locks;
mod registry;
pub mod table;

use std::time::Duration;

use metadata_store::models::item::{fetch_item, insert_item, update_item};
use metadata_store::{Database, HydrationInfo, ItemRecord, ItemState, UploadCheckpoint};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::StateError;
use crate::events::{EngineEvent, EventBus, StateChange};

pub use fields::{ItemStatus, NewItem, NewItemKind, RemoteUpdate, TransitionFields};
pub use locks::{RecordGuard, RecordLocks};
pub use registry::{WorkerHandle, WorkerKind, WorkerLease, WorkerRegistry};

/// Re-read interval while waiting on a record, in case its event was lost
const SETTLE_POLL: Duration = Duration::from_secs(1);

/// Current time truncated to what the store keeps
pub(crate) fn now() -> OffsetDateTime {
    let now = OffsetDateTime::now_utc();
    now.replace_millisecond(now.millisecond()).unwrap_or(now)
}

/// A committed transition
#[derive(Debug, Clone)]
pub struct Transitioned {
    pub prior: ItemState,
    pub record: ItemRecord,
}

#[derive(Debug, Clone)]
pub struct StateManager {
    db: Database,
    locks: RecordLocks,
    workers: WorkerRegistry,
    events: EventBus,
}

impl StateManager {
    pub fn new(db: Database, events: EventBus) -> Self {
        Self {
            db,
            locks: RecordLocks::default(),
            workers: WorkerRegistry::default(),
            events,
        }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn workers(&self) -> &WorkerRegistry {
        &self.workers
    }

    pub async fn get(&self, id: &str) -> Result<Option<ItemRecord>, StateError> {
        Ok(self.db.get_item(id).await?)
    }

    pub async fn require(&self, id: &str) -> Result<ItemRecord, StateError> {
        self.get(id)
            .await?
            .ok_or_else(|| StateError::NotFound(id.to_string()))
    }

    /// Read-only status, served straight from the store
    pub async fn status(&self, id: &str) -> Result<ItemStatus, StateError> {
        let record = self.require(id).await?;
        Ok(ItemStatus {
            id: record.id,
            state: record.state,
            etag: record.etag,
            last_error: record.last_error,
            is_temporary_error: record.is_temporary_error,
        })
    }

    /// Insert a new record and announce it with no prior state
    pub async fn create(&self, item: NewItem) -> Result<ItemRecord, StateError> {
        let _guard = self.locks.lock(&item.id).await;
        let now = now();

        let mut tx = self.db.begin_immediate().await?;
        if fetch_item(&mut tx, &item.id).await?.is_some() {
            return Err(StateError::AlreadyExists(item.id));
        }

        let state = match item.kind {
            NewItemKind::Remote => ItemState::Ghost,
            NewItemKind::Local => ItemState::DirtyLocal,
            NewItemKind::Virtual => ItemState::Hydrated,
        };
        let mut record = ItemRecord::new(item.id, item.parent_id, item.name, state, now);
        record.size = item.size;
        record.modified_at = item.modified_at.unwrap_or(now);
        record.version = 1;
        match item.kind {
            NewItemKind::Remote => {
                record.remote_etag = item.etag.clone();
                record.etag = item.etag;
            }
            NewItemKind::Local => {
                record.local_changes = true;
                record.local_revision = 1;
            }
            NewItemKind::Virtual => {
                record.is_virtual = true;
                record.etag = item.etag;
            }
        }

        insert_item(&mut tx, &record).await?;
        tx.commit().await?;

        info!(id = %record.id, state = %record.state, "created item");
        self.publish(&record, None, now);
        Ok(record)
    }

    /// Move `id` to `target`, applying `fields` in the same transaction.
    ///
    /// Fails without mutating anything when the pair is not in the
    /// transition table, the entry is virtual, or the caller's lease or
    /// expected revision no longer holds.
    pub async fn transition(
        &self,
        id: &str,
        target: ItemState,
        fields: TransitionFields,
    ) -> Result<Transitioned, StateError> {
        let _guard = self.locks.lock(id).await;
        self.transition_locked(id, target, &fields, None).await
    }

    /// Move `id` to HYDRATING and register a new worker for it
    pub async fn begin_hydration(&self, id: &str, kind: WorkerKind) -> Result<WorkerLease, StateError> {
        let _guard = self.locks.lock(id).await;
        let handle = WorkerHandle {
            worker_id: Uuid::new_v4(),
            kind,
            cancel: CancellationToken::new(),
            started_at: now(),
        };
        let fields = TransitionFields::new().with_worker(handle.worker_id);
        let done = self
            .transition_locked(id, ItemState::Hydrating, &fields, Some(&handle))
            .await?;
        Ok(WorkerLease::new(
            id,
            &handle,
            done.record.version,
            self.workers.clone(),
        ))
    }

    /// Register a worker on `id` without changing its state
    pub async fn claim(
        &self,
        id: &str,
        kind: WorkerKind,
        allowed: &[ItemState],
    ) -> Result<WorkerLease, StateError> {
        let _guard = self.locks.lock(id).await;
        let record = self.require(id).await?;
        if record.is_virtual {
            return Err(StateError::VirtualEntryImmutable(id.to_string()));
        }
        if !allowed.contains(&record.state) {
            return Err(StateError::WrongState {
                id: id.to_string(),
                state: record.state,
            });
        }
        if let Some(holder) = self.workers.get(id) {
            return Err(StateError::Busy {
                id: id.to_string(),
                worker_id: holder.worker_id,
            });
        }

        let handle = WorkerHandle {
            worker_id: Uuid::new_v4(),
            kind,
            cancel: CancellationToken::new(),
            started_at: now(),
        };
        self.workers.insert(id, handle.clone());
        debug!(id, worker = %handle.worker_id, ?kind, "claimed item");
        Ok(WorkerLease::new(
            id,
            &handle,
            record.version,
            self.workers.clone(),
        ))
    }

    /// Metadata-only update from the remote; never changes state
    pub async fn update_remote(
        &self,
        id: &str,
        update: RemoteUpdate,
    ) -> Result<ItemRecord, StateError> {
        let _guard = self.locks.lock(id).await;

        let mut tx = self.db.begin_immediate().await?;
        let record = load(&mut tx, id).await?;
        if record.state.is_terminal() {
            return Err(StateError::InvalidTransition {
                id: id.to_string(),
                from: record.state,
                to: record.state,
            });
        }

        let mut next = record.clone();
        if let Some(name) = update.name {
            next.name = name;
        }
        if let Some(parent_id) = update.parent_id {
            next.parent_id = Some(parent_id);
        }
        if let Some(remote_etag) = update.remote_etag {
            next.remote_etag = Some(remote_etag);
        }
        if update.remote_gone {
            next.remote_etag = None;
        }
        if let Some(modified_at) = update.modified_at {
            next.modified_at = modified_at;
        }
        if let Some(size) = update.size {
            if record.state == ItemState::Ghost {
                next.size = size;
            }
        }
        if next == record {
            return Ok(record);
        }

        next.version += 1;
        update_item(&mut tx, &next).await?;
        tx.commit().await?;
        debug!(id, version = next.version, "updated remote metadata");
        Ok(next)
    }

    /// A local write-close: bump the local revision and, unless the entry
    /// already carries unsent edits, move it to DIRTY_LOCAL.
    pub async fn record_local_write(&self, id: &str, size: u64) -> Result<Transitioned, StateError> {
        let _guard = self.locks.lock(id).await;
        let now = now();

        let mut tx = self.db.begin_immediate().await?;
        let record = load(&mut tx, id).await?;
        if record.is_virtual {
            return Err(StateError::VirtualEntryImmutable(id.to_string()));
        }
        let prior = record.state;

        let changes_state = match prior {
            ItemState::Ghost | ItemState::Hydrated => true,
            ItemState::DirtyLocal | ItemState::Conflict => false,
            ItemState::Error if record.local_changes => false,
            _ => {
                return Err(StateError::InvalidTransition {
                    id: id.to_string(),
                    from: prior,
                    to: ItemState::DirtyLocal,
                })
            }
        };

        let mut next = if changes_state {
            let holder = self.workers.get(id);
            if let Some(holder) = holder {
                return Err(StateError::Busy {
                    id: id.to_string(),
                    worker_id: holder.worker_id,
                });
            }
            apply(
                &record,
                ItemState::DirtyLocal,
                &TransitionFields::new(),
                None,
                now,
            )?
        } else {
            let mut next = record.clone();
            next.version += 1;
            next
        };
        // a session holds bytes of the previous revision
        next.upload = None;
        next.local_revision += 1;
        next.size = size;
        next.modified_at = now;

        update_item(&mut tx, &next).await?;
        tx.commit().await?;

        debug!(id, revision = next.local_revision, state = %next.state, "recorded local write");
        if changes_state {
            self.publish(&next, Some(prior), now);
        }
        Ok(Transitioned {
            prior,
            record: next,
        })
    }

    /// Persist the position of an in-flight upload of local revision
    /// `revision`. Only the worker holding the record may do this, and only
    /// while the revision is still current.
    pub async fn save_upload_checkpoint(
        &self,
        id: &str,
        worker_id: Uuid,
        revision: i64,
        checkpoint: Option<UploadCheckpoint>,
    ) -> Result<(), StateError> {
        let _guard = self.locks.lock(id).await;
        self.check_holder(id, worker_id)?;

        let mut tx = self.db.begin_immediate().await?;
        let record = load(&mut tx, id).await?;
        if record.local_revision != revision {
            return Err(StateError::RevisionChanged {
                id: id.to_string(),
                expected: revision,
                actual: record.local_revision,
            });
        }
        let mut next = record;
        next.upload = checkpoint;
        next.version += 1;
        update_item(&mut tx, &next).await?;
        tx.commit().await?;
        Ok(())
    }

    /// After uploading a revision that was superseded mid-flight: record the
    /// uploaded version as the new base and keep the entry DIRTY_LOCAL.
    pub async fn rebase_local(
        &self,
        id: &str,
        worker_id: Option<Uuid>,
        etag: &str,
    ) -> Result<ItemRecord, StateError> {
        let _guard = self.locks.lock(id).await;
        if let Some(worker_id) = worker_id {
            self.check_holder(id, worker_id)?;
        }

        let mut tx = self.db.begin_immediate().await?;
        let record = load(&mut tx, id).await?;
        if record.state != ItemState::DirtyLocal {
            return Err(StateError::WrongState {
                id: id.to_string(),
                state: record.state,
            });
        }

        let mut next = record;
        next.etag = Some(etag.to_string());
        next.remote_etag = Some(etag.to_string());
        next.base_etag = Some(etag.to_string());
        next.upload = None;
        next.version += 1;
        update_item(&mut tx, &next).await?;
        tx.commit().await?;

        info!(id, etag, revision = next.local_revision, "rebased local edit");
        Ok(next)
    }

    /// Record a read access for eviction ordering
    pub async fn touch(&self, id: &str) -> Result<bool, StateError> {
        Ok(self.db.touch_item(id, now()).await?)
    }

    /// Signal the worker holding `id`
    pub fn cancel(&self, id: &str) -> bool {
        self.workers.cancel(id)
    }

    pub fn cancel_all(&self) -> usize {
        self.workers.cancel_all()
    }

    pub fn active_worker(&self, id: &str) -> Option<WorkerHandle> {
        self.workers.get(id)
    }

    /// Drop DELETED records older than `retention`
    pub async fn purge_deleted(&self, retention: Duration) -> Result<u64, StateError> {
        let purged = self.db.purge_deleted(now() - retention).await?;
        if purged > 0 {
            info!(purged, "purged deleted records");
        }
        Ok(purged)
    }

    /// Fail hydrations that were in flight when a previous process died.
    ///
    /// Call once at startup, before any worker runs.
    pub async fn recover(&self) -> Result<usize, StateError> {
        let stuck = self.db.list_by_state(ItemState::Hydrating).await?;
        let mut recovered = 0;
        for record in stuck {
            if self.workers.get(&record.id).is_some() {
                continue;
            }
            let fields = TransitionFields::error("interrupted before completion", true);
            match self.transition(&record.id, ItemState::Error, fields).await {
                Ok(_) => recovered += 1,
                Err(e) => warn!(id = %record.id, error = %e, "failed to recover item"),
            }
        }
        if recovered > 0 {
            info!(recovered, "recovered interrupted transfers");
        }
        Ok(recovered)
    }

    /// Wait up to `limit` for `id` to leave `state`, returning the record as
    /// last seen.
    pub async fn wait_while(
        &self,
        id: &str,
        state: ItemState,
        limit: Duration,
    ) -> Result<ItemRecord, StateError> {
        // subscribe before reading so no transition slips between the two
        let events = self.events.subscribe();
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            let record = self.require(id).await?;
            let current = tokio::time::Instant::now();
            if record.state != state || current >= deadline {
                return Ok(record);
            }
            let poll = (deadline - current).min(SETTLE_POLL);
            let _ = tokio::time::timeout(poll, async {
                while let Ok(event) = events.recv_async().await {
                    if matches!(&event, EngineEvent::StateChanged(change) if change.id == id) {
                        break;
                    }
                }
            })
            .await;
        }
    }

    async fn transition_locked(
        &self,
        id: &str,
        target: ItemState,
        fields: &TransitionFields,
        claim: Option<&WorkerHandle>,
    ) -> Result<Transitioned, StateError> {
        let now = now();
        let mut tx = self.db.begin_immediate().await?;
        let record = load(&mut tx, id).await?;
        let prior = record.state;

        if record.is_virtual {
            if prior == ItemState::Hydrated && target == ItemState::Hydrated {
                return Ok(Transitioned { prior, record });
            }
            return Err(StateError::VirtualEntryImmutable(id.to_string()));
        }
        if !table::is_allowed(prior, target) {
            return Err(StateError::InvalidTransition {
                id: id.to_string(),
                from: prior,
                to: target,
            });
        }

        let holder = self.workers.get(id);
        if let Some(lease) = fields.lease {
            if holder.as_ref().map(|h| h.worker_id) != Some(lease) {
                return Err(StateError::LeaseLost {
                    id: id.to_string(),
                    worker_id: lease,
                });
            }
        }
        if claim.is_some() {
            if let Some(holder) = &holder {
                return Err(StateError::Busy {
                    id: id.to_string(),
                    worker_id: holder.worker_id,
                });
            }
        }
        if let Some(expected) = fields.expected_revision {
            if record.local_revision != expected {
                return Err(StateError::RevisionChanged {
                    id: id.to_string(),
                    expected,
                    actual: record.local_revision,
                });
            }
        }

        let worker = if target == ItemState::Hydrating {
            Some(fields.worker_id.unwrap_or_else(Uuid::new_v4))
        } else {
            None
        };
        let next = apply(&record, target, fields, worker, now)?;

        update_item(&mut tx, &next).await?;
        tx.commit().await?;

        // the previous owner's claim ends with the state it was working on
        if let Some(holder) = holder {
            if fields.lease != Some(holder.worker_id) {
                holder.cancel.cancel();
            }
            self.workers.remove(id);
        }
        if let Some(handle) = claim {
            self.workers.insert(id, handle.clone());
        }

        debug!(id, from = %prior, to = %target, version = next.version, "state transition");
        self.publish(&next, Some(prior), now);
        Ok(Transitioned {
            prior,
            record: next,
        })
    }

    fn check_holder(&self, id: &str, worker_id: Uuid) -> Result<(), StateError> {
        match self.workers.get(id) {
            Some(holder) if holder.worker_id == worker_id => Ok(()),
            _ => Err(StateError::LeaseLost {
                id: id.to_string(),
                worker_id,
            }),
        }
    }

    fn publish(&self, record: &ItemRecord, prior: Option<ItemState>, at: OffsetDateTime) {
        self.events.publish(EngineEvent::StateChanged(StateChange {
            id: record.id.clone(),
            prior_state: prior,
            new_state: record.state,
            version: record.version,
            timestamp: at,
        }));
    }
}

async fn load(conn: &mut sqlx::SqliteConnection, id: &str) -> Result<ItemRecord, StateError> {
    fetch_item(conn, id)
        .await?
        .ok_or_else(|| StateError::NotFound(id.to_string()))
}

/// Compute the record after moving it to `target`.
fn apply(
    record: &ItemRecord,
    target: ItemState,
    fields: &TransitionFields,
    worker: Option<Uuid>,
    now: OffsetDateTime,
) -> Result<ItemRecord, StateError> {
    let from = record.state;
    if fields.etag.is_some() && target != ItemState::Hydrated {
        return Err(StateError::InvalidFields {
            id: record.id.clone(),
            reason: format!("etag can only change on entry to hydrated, not {target}"),
        });
    }

    let mut next = record.clone();
    next.state = target;
    next.state_changed_at = now;
    next.version += 1;
    if let Some(at) = fields.modified_at {
        next.modified_at = at;
    }
    if let Some(remote_etag) = &fields.remote_etag {
        next.remote_etag = Some(remote_etag.clone());
    }
    if fields.remote_gone {
        next.remote_etag = None;
    }

    match target {
        ItemState::Hydrating => {
            next.hydration = Some(HydrationInfo {
                started_at: Some(now),
                completed_at: None,
                worker_id: worker,
                error: None,
            });
            next.last_error = None;
            next.is_temporary_error = false;
        }
        ItemState::Hydrated => {
            if let Some(etag) = &fields.etag {
                next.etag = Some(etag.clone());
            }
            if let Some(size) = fields.size {
                next.size = size;
            }
            if let Some((etag, since)) = &fields.observed_remote {
                // a delta that landed meanwhile knows better
                if record.version == *since || next.remote_etag.is_none() {
                    next.remote_etag = Some(etag.clone());
                }
            }
            if from == ItemState::Hydrating {
                if let Some(hydration) = next.hydration.as_mut() {
                    hydration.completed_at = Some(now);
                    hydration.error = None;
                }
            } else {
                next.hydration = None;
            }
            next.local_changes = false;
            next.base_etag = None;
            next.upload = None;
            next.last_error = None;
            next.is_temporary_error = false;
            next.retry_count = 0;
        }
        ItemState::DirtyLocal => {
            next.base_etag = match &fields.base_etag {
                Some(base) => Some(base.clone()),
                None => match from {
                    ItemState::Conflict => next.remote_etag.clone(),
                    ItemState::Ghost => record.remote_etag.clone().or_else(|| record.etag.clone()),
                    _ => record.etag.clone(),
                },
            };
            if from == ItemState::Conflict {
                // the old session was opened against a superseded base
                next.upload = None;
            }
            if let Some(size) = fields.size {
                next.size = size;
            }
            next.local_changes = true;
            next.last_error = None;
            next.is_temporary_error = false;
        }
        ItemState::Conflict => {
            next.upload = None;
            next.last_error = None;
            next.is_temporary_error = false;
        }
        ItemState::Error => {
            let message = fields
                .error
                .as_deref()
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .ok_or_else(|| StateError::InvalidFields {
                    id: record.id.clone(),
                    reason: "error requires a message".to_string(),
                })?
                .to_string();
            if from == ItemState::Hydrating {
                let hydration = next.hydration.get_or_insert(HydrationInfo {
                    started_at: None,
                    completed_at: None,
                    worker_id: None,
                    error: None,
                });
                hydration.completed_at = Some(now);
                hydration.error = Some(message.clone());
            }
            next.last_error = Some(message);
            next.is_temporary_error = fields.temporary;
            if fields.temporary {
                next.retry_count = next.retry_count.saturating_add(1);
            }
        }
        ItemState::Ghost => {
            next.hydration = None;
            if let Some(size) = fields.size {
                next.size = size;
            }
            next.last_error = None;
            next.is_temporary_error = false;
        }
        ItemState::Deleted => {
            next.upload = None;
            if let Some(hydration) = next.hydration.as_mut() {
                hydration.worker_id = None;
            }
        }
    }

    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(state: ItemState) -> ItemRecord {
        let mut record = ItemRecord::new("a", None, "a", state, now());
        record.etag = Some("E1".into());
        record.remote_etag = Some("E1".into());
        record.size = 10;
        record.version = 3;
        record
    }

    #[test]
    fn test_hydrating_stamps_worker_and_start() {
        let worker = Uuid::new_v4();
        let next = apply(
            &record(ItemState::Ghost),
            ItemState::Hydrating,
            &TransitionFields::new(),
            Some(worker),
            now(),
        )
        .unwrap();
        let hydration = next.hydration.unwrap();
        assert!(hydration.started_at.is_some());
        assert_eq!(hydration.worker_id, Some(worker));
        assert_eq!(next.version, 4);
    }

    #[test]
    fn test_error_requires_message() {
        let err = apply(
            &record(ItemState::Hydrating),
            ItemState::Error,
            &TransitionFields::error("   ", true),
            None,
            now(),
        )
        .unwrap_err();
        assert!(matches!(err, StateError::InvalidFields { .. }));
    }

    #[test]
    fn test_error_after_hydration_sets_completion() {
        let mut hydrating = record(ItemState::Hydrating);
        hydrating.hydration = Some(HydrationInfo {
            started_at: Some(now()),
            completed_at: None,
            worker_id: Some(Uuid::new_v4()),
            error: None,
        });
        let next = apply(
            &hydrating,
            ItemState::Error,
            &TransitionFields::error("timed out", true),
            None,
            now(),
        )
        .unwrap();
        let hydration = next.hydration.unwrap();
        assert!(hydration.completed_at.is_some());
        assert_eq!(hydration.error.as_deref(), Some("timed out"));
        assert_eq!(next.last_error.as_deref(), Some("timed out"));
        assert!(next.is_temporary_error);
        assert_eq!(next.retry_count, 1);
    }

    #[test]
    fn test_eviction_keeps_etag_and_size() {
        let next = apply(
            &record(ItemState::Hydrated),
            ItemState::Ghost,
            &TransitionFields::new(),
            None,
            now(),
        )
        .unwrap();
        assert_eq!(next.etag.as_deref(), Some("E1"));
        assert_eq!(next.size, 10);
        assert!(next.hydration.is_none());
    }

    #[test]
    fn test_etag_only_changes_on_hydrated() {
        let err = apply(
            &record(ItemState::Hydrated),
            ItemState::Ghost,
            &TransitionFields::new().with_etag("E2"),
            None,
            now(),
        )
        .unwrap_err();
        assert!(matches!(err, StateError::InvalidFields { .. }));
    }

    #[test]
    fn test_keep_local_rebases_on_remote() {
        let mut conflicted = record(ItemState::Conflict);
        conflicted.remote_etag = Some("E2".into());
        conflicted.base_etag = Some("E1".into());
        conflicted.local_changes = true;
        conflicted.upload = Some(UploadCheckpoint {
            session: "s".into(),
            offset: 5,
            total: 10,
        });

        let next = apply(
            &conflicted,
            ItemState::DirtyLocal,
            &TransitionFields::new(),
            None,
            now(),
        )
        .unwrap();
        assert_eq!(next.base_etag.as_deref(), Some("E2"));
        assert!(next.upload.is_none());
    }

    #[test]
    fn test_observed_remote_yields_to_newer_delta() {
        let mut hydrating = record(ItemState::Hydrating);
        hydrating.remote_etag = Some("E3".into());

        let stale = apply(
            &hydrating,
            ItemState::Hydrated,
            &TransitionFields::new()
                .with_etag("E2")
                .observed_remote("E2", hydrating.version - 1),
            None,
            now(),
        )
        .unwrap();
        assert_eq!(stale.remote_etag.as_deref(), Some("E3"));
        assert!(stale.is_stale());

        let fresh = apply(
            &hydrating,
            ItemState::Hydrated,
            &TransitionFields::new()
                .with_etag("E2")
                .observed_remote("E2", hydrating.version),
            None,
            now(),
        )
        .unwrap();
        assert_eq!(fresh.remote_etag.as_deref(), Some("E2"));
    }

    #[test]
    fn test_hydrated_clears_local_and_error_state() {
        let mut dirty = record(ItemState::DirtyLocal);
        dirty.local_changes = true;
        dirty.base_etag = Some("E1".into());
        dirty.retry_count = 2;

        let next = apply(
            &dirty,
            ItemState::Hydrated,
            &TransitionFields::new().with_etag("E2").with_size(20),
            None,
            now(),
        )
        .unwrap();
        assert!(!next.local_changes);
        assert!(next.base_etag.is_none());
        assert_eq!(next.retry_count, 0);
        assert_eq!(next.etag.as_deref(), Some("E2"));
        assert_eq!(next.size, 20);
    }
}
