//! Inputs to State Manager operations

use time::OffsetDateTime;
use uuid::Uuid;

/// Field updates that accompany a transition.
///
/// Timing and ownership fields are stamped by the State Manager itself;
/// this only carries what the caller learned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransitionFields {
    /// New content version; only accepted on entry to HYDRATED
    pub etag: Option<String>,
    pub size: Option<u64>,
    pub remote_etag: Option<String>,
    /// The remote object no longer exists
    pub remote_gone: bool,
    /// Set `remote_etag` to this etag unless the record changed after
    /// the given version
    pub observed_remote: Option<(String, i64)>,
    pub base_etag: Option<String>,
    pub modified_at: Option<OffsetDateTime>,
    /// Required on entry to ERROR
    pub error: Option<String>,
    pub temporary: bool,
    /// Worker to stamp on entry to HYDRATING; generated when absent
    pub worker_id: Option<Uuid>,
    /// Lease the caller holds; the transition fails if it was lost
    pub lease: Option<Uuid>,
    /// Fail unless the local revision still equals this
    pub expected_revision: Option<i64>,
}

impl TransitionFields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn error(message: impl Into<String>, temporary: bool) -> Self {
        Self {
            error: Some(message.into()),
            temporary,
            ..Self::default()
        }
    }

    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = Some(etag.into());
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_remote_etag(mut self, etag: impl Into<String>) -> Self {
        self.remote_etag = Some(etag.into());
        self
    }

    pub fn with_remote_gone(mut self) -> Self {
        self.remote_gone = true;
        self
    }

    pub fn observed_remote(mut self, etag: impl Into<String>, since_version: i64) -> Self {
        self.observed_remote = Some((etag.into(), since_version));
        self
    }

    pub fn with_base_etag(mut self, etag: impl Into<String>) -> Self {
        self.base_etag = Some(etag.into());
        self
    }

    pub fn with_modified_at(mut self, at: OffsetDateTime) -> Self {
        self.modified_at = Some(at);
        self
    }

    pub fn with_worker(mut self, worker_id: Uuid) -> Self {
        self.worker_id = Some(worker_id);
        self
    }

    pub fn with_lease(mut self, worker_id: Uuid) -> Self {
        self.lease = Some(worker_id);
        self
    }

    pub fn expecting_revision(mut self, revision: i64) -> Self {
        self.expected_revision = Some(revision);
        self
    }
}

/// A record to create
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewItem {
    pub id: String,
    pub parent_id: Option<String>,
    pub name: String,
    pub etag: Option<String>,
    pub size: u64,
    pub modified_at: Option<OffsetDateTime>,
    pub kind: NewItemKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NewItemKind {
    /// Discovered on the remote; starts GHOST
    Remote,
    /// Created locally; starts DIRTY_LOCAL
    Local,
    /// Synthetic and always resident; pinned to HYDRATED
    Virtual,
}

impl NewItem {
    pub fn remote(
        id: impl Into<String>,
        parent_id: Option<String>,
        name: impl Into<String>,
        etag: impl Into<String>,
        size: u64,
    ) -> Self {
        Self {
            id: id.into(),
            parent_id,
            name: name.into(),
            etag: Some(etag.into()),
            size,
            modified_at: None,
            kind: NewItemKind::Remote,
        }
    }

    pub fn local(
        id: impl Into<String>,
        parent_id: Option<String>,
        name: impl Into<String>,
        size: u64,
    ) -> Self {
        Self {
            id: id.into(),
            parent_id,
            name: name.into(),
            etag: None,
            size,
            modified_at: None,
            kind: NewItemKind::Local,
        }
    }

    pub fn virtual_entry(
        id: impl Into<String>,
        parent_id: Option<String>,
        name: impl Into<String>,
        size: u64,
    ) -> Self {
        Self {
            id: id.into(),
            parent_id,
            name: name.into(),
            etag: None,
            size,
            modified_at: None,
            kind: NewItemKind::Virtual,
        }
    }

    pub fn with_modified_at(mut self, at: OffsetDateTime) -> Self {
        self.modified_at = Some(at);
        self
    }
}

/// Metadata reported by the remote that does not change lifecycle state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteUpdate {
    pub name: Option<String>,
    pub parent_id: Option<String>,
    pub remote_etag: Option<String>,
    /// The remote object no longer exists
    pub remote_gone: bool,
    /// Applied only while the content is not resident
    pub size: Option<u64>,
    pub modified_at: Option<OffsetDateTime>,
}

/// The answer to a status query
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ItemStatus {
    pub id: String,
    pub state: metadata_store::ItemState,
    pub etag: Option<String>,
    pub last_error: Option<String>,
    pub is_temporary_error: bool,
}
