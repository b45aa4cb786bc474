//! In-flight worker registry
//!
//! Maps a record id to the worker that currently owns it. Entries are only
//! added or removed by the [`StateManager`](super::StateManager) while it
//! holds the record's lock, next to the commit they belong to.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerKind {
    Hydration,
    Upload,
    /// Download of the remote side of a conflict
    Refresh,
}

#[derive(Debug, Clone)]
pub struct WorkerHandle {
    pub worker_id: Uuid,
    pub kind: WorkerKind,
    pub cancel: CancellationToken,
    pub started_at: OffsetDateTime,
}

#[derive(Debug, Clone, Default)]
pub struct WorkerRegistry {
    inner: Arc<Mutex<HashMap<String, WorkerHandle>>>,
}

impl WorkerRegistry {
    pub fn get(&self, id: &str) -> Option<WorkerHandle> {
        self.inner.lock().get(id).cloned()
    }

    pub(crate) fn insert(&self, id: &str, handle: WorkerHandle) {
        self.inner.lock().insert(id.to_string(), handle);
    }

    /// Remove the entry only if `worker_id` still owns it
    pub(crate) fn release(&self, id: &str, worker_id: Uuid) -> bool {
        let mut inner = self.inner.lock();
        match inner.get(id) {
            Some(handle) if handle.worker_id == worker_id => {
                inner.remove(id);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn remove(&self, id: &str) -> Option<WorkerHandle> {
        self.inner.lock().remove(id)
    }

    /// Signal the worker on `id`; it leaves the registry when its record
    /// transitions
    pub fn cancel(&self, id: &str) -> bool {
        match self.inner.lock().get(id) {
            Some(handle) => {
                handle.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) -> usize {
        let inner = self.inner.lock();
        for handle in inner.values() {
            handle.cancel.cancel();
        }
        inner.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Ownership of a record by one worker. Dropping the lease releases the
/// registry entry if the worker still holds it.
#[derive(Debug)]
pub struct WorkerLease {
    pub id: String,
    pub worker_id: Uuid,
    pub kind: WorkerKind,
    pub cancel: CancellationToken,
    /// Record version right after the lease was taken
    pub version: i64,
    registry: WorkerRegistry,
}

impl WorkerLease {
    pub(crate) fn new(id: &str, handle: &WorkerHandle, version: i64, registry: WorkerRegistry) -> Self {
        Self {
            id: id.to_string(),
            worker_id: handle.worker_id,
            kind: handle.kind,
            cancel: handle.cancel.clone(),
            version,
            registry,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        self.registry.release(&self.id, self.worker_id);
    }
}
