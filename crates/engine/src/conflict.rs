//! Conflict Reconciler
//!
//! Decides whether a remote change collides with unsent local edits, and
//! carries out the user's resolution of a CONFLICT entry. Local content is
//! never discarded without an explicit `accept_remote`.

use metadata_store::{ItemRecord, ItemState};
use tracing::info;

use crate::cache::ContentCache;
use crate::error::{HydrationError, StateError};
use crate::hydration::HydrationEngine;
use crate::state::{StateManager, TransitionFields};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The remote is still at the local edit's base; the edit can go up
    Mergeable,
    /// Both sides changed
    Conflict,
    /// No unsent local edit to collide with
    NotApplicable,
}

/// Compare a DIRTY_LOCAL entry's base with the remote's current version.
/// `None` means the remote object is gone.
pub fn decide(record: &ItemRecord, remote_etag: Option<&str>) -> Decision {
    if record.state != ItemState::DirtyLocal {
        return Decision::NotApplicable;
    }
    if record.base_etag.as_deref() == remote_etag {
        Decision::Mergeable
    } else {
        Decision::Conflict
    }
}

#[derive(Clone)]
pub struct ConflictReconciler {
    state: StateManager,
    hydration: HydrationEngine,
    cache: ContentCache,
}

impl ConflictReconciler {
    pub fn new(state: StateManager, hydration: HydrationEngine, cache: ContentCache) -> Self {
        Self {
            state,
            hydration,
            cache,
        }
    }

    /// The remote now holds `remote_etag`
    pub async fn on_remote_change(&self, id: &str, remote_etag: &str) -> Result<Decision, StateError> {
        let record = self.state.require(id).await?;
        let decision = decide(&record, Some(remote_etag));
        if decision == Decision::Conflict {
            let fields = TransitionFields::new().with_remote_etag(remote_etag);
            self.state.transition(id, ItemState::Conflict, fields).await?;
            info!(id, base = ?record.base_etag, remote = remote_etag, "conflict detected");
        }
        Ok(decision)
    }

    /// The remote object was deleted
    pub async fn on_remote_delete(&self, id: &str) -> Result<Decision, StateError> {
        let record = self.state.require(id).await?;
        let decision = decide(&record, None);
        if decision == Decision::Conflict {
            let fields = TransitionFields::new().with_remote_gone();
            self.state.transition(id, ItemState::Conflict, fields).await?;
            info!(id, base = ?record.base_etag, "remote deleted under local edit");
        }
        Ok(decision)
    }

    /// Resolve in favor of the local content. The entry goes back to
    /// DIRTY_LOCAL, rebased on the remote version it conflicted with, and
    /// needs an upload.
    pub async fn keep_local(&self, id: &str) -> Result<ItemRecord, StateError> {
        let done = self
            .state
            .transition(id, ItemState::DirtyLocal, TransitionFields::new())
            .await?;
        info!(id, base = ?done.record.base_etag, "conflict resolved with local version");
        Ok(done.record)
    }

    /// Resolve in favor of the remote, discarding the local edit. If the
    /// remote side was a deletion, the entry is deleted.
    pub async fn accept_remote(&self, id: &str) -> Result<ItemRecord, HydrationError> {
        let record = self.state.require(id).await?;
        if record.state != ItemState::Conflict {
            return Err(StateError::WrongState {
                id: id.to_string(),
                state: record.state,
            }
            .into());
        }
        if record.remote_etag.is_none() {
            return self.accept_deletion(id).await;
        }

        match self.hydration.refresh_conflicted(id).await {
            Err(HydrationError::Remote { source, .. }) if source.is_not_found() => {
                self.accept_deletion(id).await
            }
            result => result,
        }
    }

    async fn accept_deletion(&self, id: &str) -> Result<ItemRecord, HydrationError> {
        self.state
            .transition(id, ItemState::DirtyLocal, TransitionFields::new().with_remote_gone())
            .await?;
        let done = self
            .state
            .transition(id, ItemState::Deleted, TransitionFields::new())
            .await?;
        self.cache
            .remove(id)
            .await
            .map_err(|e| HydrationError::io(id, e))?;
        info!(id, "conflict resolved by accepting remote deletion");
        Ok(done.record)
    }
}
