//! Per-record async locks, created on demand and dropped when idle

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type LockTable = Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>;

#[derive(Debug, Clone, Default)]
pub struct RecordLocks {
    table: LockTable,
}

/// Exclusive access to one record id
#[derive(Debug)]
pub struct RecordGuard {
    id: String,
    table: LockTable,
    entry: Arc<AsyncMutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl RecordLocks {
    pub async fn lock(&self, id: &str) -> RecordGuard {
        let entry = self
            .table
            .lock()
            .entry(id.to_string())
            .or_default()
            .clone();
        let guard = entry.clone().lock_owned().await;
        RecordGuard {
            id: id.to_string(),
            table: self.table.clone(),
            entry,
            guard: Some(guard),
        }
    }

    /// Ids with a live lock entry
    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for RecordGuard {
    fn drop(&mut self) {
        let mut table = self.table.lock();
        self.guard.take();
        // the table and this guard are the only holders: nobody is waiting
        if Arc::strong_count(&self.entry) == 2 {
            table.remove(&self.id);
        }
    }
}
