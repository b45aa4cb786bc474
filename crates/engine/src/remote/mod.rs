//! Boundary to the remote storage service
//!
//! The engine never speaks a wire protocol itself. Everything it needs from
//! the service is expressed by [`RemoteStorage`]; a real client implements it
//! over HTTP, and [`MemoryRemote`] implements it in memory for tests and
//! embedding.

mod memory;

use std::ops::Range;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

pub use memory::{Fault, MemoryRemote, RemoteOp, RemoteRequest};

/// What the remote reports about one object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub id: String,
    pub etag: String,
    pub size: u64,
}

/// Where uploaded content lands
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTarget {
    pub id: String,
    pub parent_id: Option<String>,
    pub name: String,
}

/// Acknowledgement of one session chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkAck {
    /// More bytes are expected starting at `next_offset`
    Accepted { next_offset: u64 },
    /// The chunk completed the session
    Completed(RemoteEntry),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteErrorKind {
    Timeout,
    Network,
    RateLimited,
    ServerError,
    NotFound,
    PermissionDenied,
    QuotaExceeded,
    /// The upload session is unknown to the service
    SessionExpired,
    /// The object changed between two calls of the same transfer
    PreconditionFailed,
    /// The request itself was refused
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
    /// Server-provided delay before the next attempt
    pub retry_after: Option<Duration>,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn not_found(id: &str) -> Self {
        Self::new(RemoteErrorKind::NotFound, format!("{id} does not exist"))
    }

    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }

    /// Whether the same call may succeed if simply repeated
    pub fn is_retriable(&self) -> bool {
        matches!(
            self.kind,
            RemoteErrorKind::Timeout
                | RemoteErrorKind::Network
                | RemoteErrorKind::RateLimited
                | RemoteErrorKind::ServerError
        )
    }

    /// Whether a later, fresh attempt of the whole transfer may succeed
    pub fn is_temporary(&self) -> bool {
        self.is_retriable()
            || matches!(
                self.kind,
                RemoteErrorKind::SessionExpired | RemoteErrorKind::PreconditionFailed
            )
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == RemoteErrorKind::NotFound
    }
}

/// Operations the engine needs from the remote storage service
#[async_trait]
pub trait RemoteStorage: Send + Sync + 'static {
    /// Current version and size of an object
    async fn stat(&self, id: &str) -> Result<RemoteEntry, RemoteError>;

    /// Bytes `range` of version `etag`; fails with `PreconditionFailed` if
    /// the object is no longer at that version
    async fn download_chunk(
        &self,
        id: &str,
        etag: &str,
        range: Range<u64>,
    ) -> Result<Bytes, RemoteError>;

    /// Replace (or create) an object in one request
    async fn upload_small(
        &self,
        target: &UploadTarget,
        data: Bytes,
    ) -> Result<RemoteEntry, RemoteError>;

    /// Start a chunked upload of `total` bytes, returning the session handle
    async fn open_upload_session(
        &self,
        target: &UploadTarget,
        total: u64,
    ) -> Result<String, RemoteError>;

    /// Send bytes starting at `offset`. Re-sending an acknowledged range is
    /// accepted.
    async fn upload_chunk(
        &self,
        session: &str,
        offset: u64,
        data: Bytes,
        total: u64,
    ) -> Result<ChunkAck, RemoteError>;

    /// Bytes of the session the service has durably received
    async fn session_offset(&self, session: &str) -> Result<u64, RemoteError>;

    async fn cancel_upload_session(&self, session: &str) -> Result<(), RemoteError>;
}
