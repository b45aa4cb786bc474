//! Delta Ingestor
//!
//! Applies change notifications from the remote to the local records:
//! new entries appear as GHOST, changed content makes HYDRATED entries stale,
//! and changes that collide with unsent local edits are handed to the
//! Conflict Reconciler.

use std::time::Duration;

use metadata_store::{ItemRecord, ItemState};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::cache::ContentCache;
use crate::conflict::{ConflictReconciler, Decision};
use crate::error::StateError;
use crate::state::{NewItem, RemoteUpdate, StateManager, TransitionFields};

/// How long a removal waits for an in-flight hydration to stop
const CANCEL_WAIT: Duration = Duration::from_secs(5);
/// Re-reads of a record whose state moved while a change was applied
const MAX_ATTEMPTS: usize = 3;

/// An entry as the remote reports it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteItem {
    pub id: String,
    pub parent_id: Option<String>,
    pub name: String,
    pub etag: String,
    pub size: u64,
    pub modified_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub is_virtual: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DeltaChange {
    Upsert(RemoteItem),
    Remove { id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaOutcome {
    Created,
    MetadataUpdated,
    /// Cached content dropped; the entry is GHOST at the new version
    MarkedStale,
    Conflicted,
    /// The new remote version was noted; the state was left alone
    Recorded,
    Deleted,
    /// Could not be applied now; the next delta for the entry will
    Deferred,
    Ignored,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeltaSummary {
    pub created: usize,
    pub updated: usize,
    pub stale: usize,
    pub conflicted: usize,
    pub recorded: usize,
    pub deleted: usize,
    pub deferred: usize,
    pub ignored: usize,
    pub failed: usize,
}

impl DeltaSummary {
    fn count(&mut self, outcome: DeltaOutcome) {
        let slot = match outcome {
            DeltaOutcome::Created => &mut self.created,
            DeltaOutcome::MetadataUpdated => &mut self.updated,
            DeltaOutcome::MarkedStale => &mut self.stale,
            DeltaOutcome::Conflicted => &mut self.conflicted,
            DeltaOutcome::Recorded => &mut self.recorded,
            DeltaOutcome::Deleted => &mut self.deleted,
            DeltaOutcome::Deferred => &mut self.deferred,
            DeltaOutcome::Ignored => &mut self.ignored,
        };
        *slot += 1;
    }
}

#[derive(Clone)]
pub struct DeltaIngestor {
    state: StateManager,
    cache: ContentCache,
    reconciler: ConflictReconciler,
}

impl DeltaIngestor {
    pub fn new(state: StateManager, cache: ContentCache, reconciler: ConflictReconciler) -> Self {
        Self {
            state,
            cache,
            reconciler,
        }
    }

    /// Apply a batch in order. One failing change does not stop the rest.
    pub async fn apply(&self, changes: Vec<DeltaChange>) -> DeltaSummary {
        let mut summary = DeltaSummary::default();
        for change in changes {
            let (id, result) = match change {
                DeltaChange::Upsert(item) => {
                    let id = item.id.clone();
                    (id, self.create_or_update(item).await)
                }
                DeltaChange::Remove { id } => {
                    let result = self.remove(&id).await;
                    (id, result)
                }
            };
            match result {
                Ok(outcome) => summary.count(outcome),
                Err(e) => {
                    warn!(id = %id, error = %e, "failed to apply remote change");
                    summary.failed += 1;
                }
            }
        }
        debug!(?summary, "applied delta");
        summary
    }

    /// The remote created or changed `item`
    pub async fn create_or_update(&self, item: RemoteItem) -> Result<DeltaOutcome, StateError> {
        for _ in 0..MAX_ATTEMPTS {
            let Some(record) = self.state.get(&item.id).await? else {
                match self.state.create(new_item(&item)).await {
                    Ok(_) => return Ok(DeltaOutcome::Created),
                    Err(StateError::AlreadyExists(_)) => continue,
                    Err(e) => return Err(e),
                }
            };

            match self.update_existing(&record, &item).await {
                Err(StateError::InvalidTransition { .. }) => {
                    debug!(id = %item.id, "entry moved while applying change, retrying");
                    continue;
                }
                result => return result,
            }
        }
        Ok(DeltaOutcome::Deferred)
    }

    async fn update_existing(
        &self,
        record: &ItemRecord,
        item: &RemoteItem,
    ) -> Result<DeltaOutcome, StateError> {
        let id = record.id.as_str();
        if record.state == ItemState::Deleted {
            return Ok(DeltaOutcome::Ignored);
        }

        let mut update = RemoteUpdate {
            name: Some(item.name.clone()),
            parent_id: item.parent_id.clone(),
            remote_etag: Some(item.etag.clone()),
            size: Some(item.size),
            modified_at: item.modified_at,
            ..RemoteUpdate::default()
        };
        if record.is_virtual {
            update.remote_etag = None;
            update.size = None;
            self.state.update_remote(id, update).await?;
            return Ok(DeltaOutcome::MetadataUpdated);
        }

        let unchanged = record.etag.as_deref() == Some(item.etag.as_str());
        match record.state {
            ItemState::Ghost => {
                self.state.update_remote(id, update).await?;
                Ok(DeltaOutcome::MetadataUpdated)
            }
            ItemState::Hydrated if unchanged => {
                self.state.update_remote(id, update).await?;
                Ok(DeltaOutcome::MetadataUpdated)
            }
            ItemState::Hydrated => {
                self.state.update_remote(id, update).await?;
                self.mark_stale(id, item.size).await?;
                info!(id, etag = %item.etag, "cached content is stale");
                Ok(DeltaOutcome::MarkedStale)
            }
            ItemState::DirtyLocal => {
                self.state.update_remote(id, update).await?;
                match self.reconciler.on_remote_change(id, &item.etag).await? {
                    Decision::Conflict => Ok(DeltaOutcome::Conflicted),
                    _ => Ok(DeltaOutcome::Recorded),
                }
            }
            ItemState::Hydrating | ItemState::Error | ItemState::Conflict => {
                self.state.update_remote(id, update).await?;
                Ok(DeltaOutcome::Recorded)
            }
            ItemState::Deleted => Ok(DeltaOutcome::Ignored),
        }
    }

    /// HYDRATED → GHOST at the new version. The old file goes unless a
    /// reader still has it open; the next hydration replaces it then.
    async fn mark_stale(&self, id: &str, size: u64) -> Result<(), StateError> {
        let guard = self.cache.begin_eviction(id);
        self.state
            .transition(id, ItemState::Ghost, TransitionFields::new().with_size(size))
            .await?;
        if let Some(guard) = guard {
            if let Err(e) = self.cache.remove(id).await {
                warn!(id, error = %e, "failed to drop stale content");
            }
            drop(guard);
        }
        Ok(())
    }

    /// The remote deleted `id`
    pub async fn remove(&self, id: &str) -> Result<DeltaOutcome, StateError> {
        for _ in 0..MAX_ATTEMPTS {
            let Some(record) = self.state.get(id).await? else {
                return Ok(DeltaOutcome::Ignored);
            };
            if record.is_virtual || record.state == ItemState::Deleted {
                return Ok(DeltaOutcome::Ignored);
            }

            let result = match record.state {
                ItemState::Error if record.local_changes => {
                    // unsent edits: leave the entry for the user
                    self.note_gone(id).await.map(|_| DeltaOutcome::Deferred)
                }
                ItemState::Ghost | ItemState::Hydrated | ItemState::Error => self.delete(id).await,
                ItemState::DirtyLocal => match self.reconciler.on_remote_delete(id).await? {
                    Decision::Conflict => Ok(DeltaOutcome::Conflicted),
                    _ => self.note_gone(id).await.map(|_| DeltaOutcome::Recorded),
                },
                ItemState::Conflict => self.note_gone(id).await.map(|_| DeltaOutcome::Recorded),
                ItemState::Hydrating => {
                    self.note_gone(id).await?;
                    self.state.cancel(id);
                    let settled = self
                        .state
                        .wait_while(id, ItemState::Hydrating, CANCEL_WAIT)
                        .await?;
                    if settled.state == ItemState::Hydrating {
                        return Ok(DeltaOutcome::Deferred);
                    }
                    continue;
                }
                ItemState::Deleted => Ok(DeltaOutcome::Ignored),
            };

            match result {
                Err(StateError::InvalidTransition { .. }) => continue,
                result => return result,
            }
        }
        Ok(DeltaOutcome::Deferred)
    }

    async fn delete(&self, id: &str) -> Result<DeltaOutcome, StateError> {
        let guard = self.cache.begin_eviction(id);
        self.state
            .transition(id, ItemState::Deleted, TransitionFields::new())
            .await?;
        if let Err(e) = self.cache.remove(id).await {
            warn!(id, error = %e, "failed to drop deleted content");
        }
        drop(guard);
        info!(id, "deleted by remote");
        Ok(DeltaOutcome::Deleted)
    }

    async fn note_gone(&self, id: &str) -> Result<(), StateError> {
        let update = RemoteUpdate {
            remote_gone: true,
            ..RemoteUpdate::default()
        };
        self.state.update_remote(id, update).await.map(|_| ())
    }
}

fn new_item(item: &RemoteItem) -> NewItem {
    let new = if item.is_virtual {
        NewItem::virtual_entry(item.id.clone(), item.parent_id.clone(), item.name.clone(), item.size)
    } else {
        NewItem::remote(
            item.id.clone(),
            item.parent_id.clone(),
            item.name.clone(),
            item.etag.clone(),
            item.size,
        )
    };
    match item.modified_at {
        Some(at) => new.with_modified_at(at),
        None => new,
    }
}
