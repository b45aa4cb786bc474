//! Error types for the sync engine.

use std::path::PathBuf;

use metadata_store::{ItemState, StoreError};
use thiserror::Error;
use uuid::Uuid;

use crate::remote::RemoteError;

/// Failures of a State Manager operation. None of them mutate the record.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("invalid transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: ItemState,
        to: ItemState,
    },

    #[error("item not found: {0}")]
    NotFound(String),

    #[error("virtual entry {0} is pinned to hydrated")]
    VirtualEntryImmutable(String),

    #[error("item already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid fields for {id}: {reason}")]
    InvalidFields { id: String, reason: String },

    /// Another worker holds the record.
    #[error("item {id} is busy with worker {worker_id}")]
    Busy { id: String, worker_id: Uuid },

    /// The caller's worker lease was revoked or replaced.
    #[error("worker {worker_id} no longer owns {id}")]
    LeaseLost { id: String, worker_id: Uuid },

    /// The operation needs the record in a different state.
    #[error("item {id} is {state}")]
    WrongState { id: String, state: ItemState },

    /// The local content was rewritten after the caller read it.
    #[error("local revision of {id} moved from {expected} to {actual}")]
    RevisionChanged {
        id: String,
        expected: i64,
        actual: i64,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<sqlx::Error> for StateError {
    fn from(err: sqlx::Error) -> Self {
        StateError::Store(StoreError::from(err))
    }
}

/// Failures of the Hydration Engine.
#[derive(Debug, Error)]
pub enum HydrationError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error("remote error hydrating {id}: {source}")]
    Remote {
        id: String,
        #[source]
        source: RemoteError,
    },

    #[error("cache I/O error hydrating {id}: {source}")]
    Io {
        id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("hydration of {0} was cancelled")]
    Cancelled(String),

    #[error("{id} cannot be hydrated while {state}")]
    NotHydratable { id: String, state: ItemState },

    #[error("remote returned {actual} bytes for {id}, expected {expected}")]
    ShortRead {
        id: String,
        expected: u64,
        actual: u64,
    },
}

impl HydrationError {
    /// Whether a later attempt may succeed without user intervention.
    pub fn is_temporary(&self) -> bool {
        match self {
            HydrationError::Remote { source, .. } => source.is_temporary(),
            HydrationError::ShortRead { .. } => true,
            // nothing wrong with the entry itself
            HydrationError::Cancelled(_) => true,
            _ => false,
        }
    }

    pub(crate) fn io(id: &str, source: std::io::Error) -> Self {
        HydrationError::Io {
            id: id.to_string(),
            source,
        }
    }
}

/// Failures of the Upload Manager.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error("remote error uploading {id}: {source}")]
    Remote {
        id: String,
        #[source]
        source: RemoteError,
    },

    #[error("cache I/O error uploading {id}: {source}")]
    Io {
        id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("upload of {0} was cancelled")]
    Cancelled(String),

    #[error("{id} has nothing to upload while {state}")]
    NotUploadable { id: String, state: ItemState },

    #[error("local content for {0} is missing")]
    MissingContent(String),

    /// The remote entry moved on since the local edit began. An expected
    /// outcome rather than a system failure.
    #[error("remote changed under local edit of {id}: base {base:?}, remote {remote:?}")]
    ConflictDetected {
        id: String,
        base: Option<String>,
        remote: Option<String>,
    },
}

impl UploadError {
    pub fn is_temporary(&self) -> bool {
        match self {
            UploadError::Remote { source, .. } => source.is_temporary(),
            // the session stays resumable
            UploadError::Cancelled(_) => true,
            _ => false,
        }
    }

    pub(crate) fn io(id: &str, source: std::io::Error) -> Self {
        UploadError::Io {
            id: id.to_string(),
            source,
        }
    }
}

/// Failures of the Eviction Sweeper.
#[derive(Debug, Error)]
pub enum EvictionError {
    #[error("{id} is not evictable while {state} (virtual: {is_virtual})")]
    NotEvictable {
        id: String,
        state: ItemState,
        is_virtual: bool,
    },

    #[error("{0} has active readers or writers")]
    InUse(String),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("cache I/O error evicting {id}: {source}")]
    Io {
        id: String,
        #[source]
        source: std::io::Error,
    },
}

/// What a filesystem handler sees when an access cannot be served.
#[derive(Debug, Error)]
pub enum AccessError {
    /// The entry is in ERROR; the message is the persisted `last_error`.
    #[error("{id}: {message}")]
    Failed { id: String, message: String },

    #[error("no such item: {0}")]
    NotFound(String),

    #[error("{0} has been deleted")]
    Deleted(String),

    #[error("{0} is busy")]
    Busy(String),

    #[error(transparent)]
    Hydration(#[from] HydrationError),

    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("cache I/O error for {id}: {source}")]
    Io {
        id: String,
        #[source]
        source: std::io::Error,
    },
}

/// Failures loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Failures opening or running the engine as a whole.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("failed to open content cache at {path}: {source}")]
    Cache {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to initialize logging: {0}")]
    Logging(String),
}
