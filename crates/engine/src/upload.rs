//! Upload Manager
//!
//! Pushes DIRTY_LOCAL content to the remote. Small files go up in one
//! request; larger ones through a resumable session whose position is
//! checkpointed on the record after every acknowledged chunk, so a later
//! attempt continues where the last one stopped.
//!
//! Before the first byte and again before the last chunk the remote version
//! is compared with the version the local edit was based on. A mismatch
//! means someone else changed the file: the entry becomes CONFLICT instead
//! of overwriting their change.

use std::sync::Arc;

use bytes::Bytes;
use metadata_store::{ItemRecord, ItemState, UploadCheckpoint};
use tracing::{debug, info, warn};

use crate::cache::ContentCache;
use crate::config::UploadConfig;
use crate::error::{StateError, UploadError};
use crate::events::EngineEvent;
use crate::remote::{ChunkAck, RemoteEntry, RemoteErrorKind, RemoteStorage, UploadTarget};
use crate::retry::{RetryError, RetryPolicy};
use crate::state::{StateManager, TransitionFields, WorkerKind, WorkerLease};

/// How an upload ended when it did not fail
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    /// The remote holds the local content; the entry is HYDRATED
    Uploaded { etag: String },
    /// The file was written again meanwhile; the entry stays DIRTY_LOCAL
    /// and needs another upload
    Superseded,
}

#[derive(Clone)]
pub struct UploadManager {
    state: StateManager,
    remote: Arc<dyn RemoteStorage>,
    cache: ContentCache,
    retry: RetryPolicy,
    small_threshold: u64,
    chunk_size: u64,
}

impl UploadManager {
    pub fn new(
        state: StateManager,
        remote: Arc<dyn RemoteStorage>,
        cache: ContentCache,
        retry: RetryPolicy,
        config: &UploadConfig,
    ) -> Self {
        Self {
            state,
            remote,
            cache,
            retry,
            small_threshold: config.small_threshold,
            chunk_size: config.chunk_size.max(1),
        }
    }

    /// Upload a DIRTY_LOCAL entry
    pub async fn upload(&self, id: &str) -> Result<UploadOutcome, UploadError> {
        let lease = self
            .state
            .claim(id, WorkerKind::Upload, &[ItemState::DirtyLocal])
            .await
            .map_err(|e| match e {
                StateError::WrongState { id, state } => UploadError::NotUploadable { id, state },
                other => other.into(),
            })?;
        let record = self.state.require(id).await?;
        info!(id, revision = record.local_revision, "upload started");

        match self.push(&record, &lease).await {
            Ok(entry) => self.finish(&record, &lease, entry).await,
            Err(err) => self.fail(&record, &lease, err).await,
        }
    }

    /// Retry an upload that ended in ERROR. The entry passes through
    /// HYDRATING while the worker runs.
    pub async fn resume(&self, id: &str) -> Result<UploadOutcome, UploadError> {
        let record = self.state.require(id).await?;
        if record.state != ItemState::Error || !record.local_changes {
            return Err(UploadError::NotUploadable {
                id: id.to_string(),
                state: record.state,
            });
        }

        let lease = self.state.begin_hydration(id, WorkerKind::Upload).await?;
        let record = self.state.require(id).await?;
        info!(id, checkpoint = ?record.upload, "resuming upload");

        let err = match self.push(&record, &lease).await {
            Ok(entry) => {
                let fields = TransitionFields::new()
                    .with_etag(entry.etag.clone())
                    .with_size(entry.size)
                    .with_remote_etag(entry.etag.clone())
                    .with_lease(lease.worker_id)
                    .expecting_revision(record.local_revision);
                self.state.transition(id, ItemState::Hydrated, fields).await?;
                info!(id, etag = %entry.etag, "upload complete");
                return Ok(UploadOutcome::Uploaded { etag: entry.etag });
            }
            Err(err) => err,
        };

        // a HYDRATING entry cannot become CONFLICT; the conflict is left for
        // the user to resolve from ERROR
        let temporary = match &err {
            UploadError::ConflictDetected { .. } => false,
            other => other.is_temporary(),
        };
        self.record_error(&lease, &err, temporary).await;
        Err(err)
    }

    async fn push(&self, record: &ItemRecord, lease: &WorkerLease) -> Result<RemoteEntry, UploadError> {
        let id = record.id.as_str();
        let size = self
            .cache
            .len(id)
            .await
            .map_err(|e| UploadError::io(id, e))?
            .ok_or_else(|| UploadError::MissingContent(id.to_string()))?;

        self.check_base(record, lease).await?;

        let target = UploadTarget {
            id: record.id.clone(),
            parent_id: record.parent_id.clone(),
            name: record.name.clone(),
        };
        if size <= self.small_threshold {
            let data = self
                .cache
                .read_range(id, 0, size)
                .await
                .map_err(|e| UploadError::io(id, e))?;
            let remote = &self.remote;
            let entry = self
                .retry
                .run("upload", &lease.cancel, |_| {
                    remote.upload_small(&target, data.clone())
                })
                .await
                .map_err(|e| remote_error(id, e))?;
            self.progress(id, size, size);
            return Ok(entry);
        }

        self.push_session(record, lease, &target, size).await
    }

    async fn push_session(
        &self,
        record: &ItemRecord,
        lease: &WorkerLease,
        target: &UploadTarget,
        size: u64,
    ) -> Result<RemoteEntry, UploadError> {
        let id = record.id.as_str();
        let remote = &self.remote;
        let (session, mut offset) = self.open_or_resume(record, lease, target, size).await?;

        loop {
            if lease.is_cancelled() {
                return Err(UploadError::Cancelled(id.to_string()));
            }
            let end = (offset + self.chunk_size).min(size);
            if end == size && offset > 0 {
                self.check_base(record, lease).await?;
            }

            let data: Bytes = self
                .cache
                .read_range(id, offset, end - offset)
                .await
                .map_err(|e| UploadError::io(id, e))?;
            let chunk_offset = offset;
            let ack = self
                .retry
                .run("upload chunk", &lease.cancel, |_| {
                    remote.upload_chunk(&session, chunk_offset, data.clone(), size)
                })
                .await
                .map_err(|e| remote_error(id, e))?;

            match ack {
                ChunkAck::Accepted { next_offset } if next_offset > offset => {
                    offset = next_offset;
                    let checkpoint = UploadCheckpoint {
                        session: session.clone(),
                        offset,
                        total: size,
                    };
                    self.state
                        .save_upload_checkpoint(
                            id,
                            lease.worker_id,
                            record.local_revision,
                            Some(checkpoint),
                        )
                        .await?;
                    self.progress(id, offset, size);
                }
                ChunkAck::Accepted { next_offset } => {
                    return Err(UploadError::Remote {
                        id: id.to_string(),
                        source: crate::remote::RemoteError::new(
                            RemoteErrorKind::Rejected,
                            format!("session stalled at {next_offset}"),
                        ),
                    });
                }
                ChunkAck::Completed(entry) => {
                    self.progress(id, size, size);
                    return Ok(entry);
                }
            }
        }
    }

    /// Continue the checkpointed session if the service still knows it,
    /// otherwise open a new one.
    async fn open_or_resume(
        &self,
        record: &ItemRecord,
        lease: &WorkerLease,
        target: &UploadTarget,
        size: u64,
    ) -> Result<(String, u64), UploadError> {
        let id = record.id.as_str();
        let remote = &self.remote;

        if let Some(checkpoint) = &record.upload {
            if checkpoint.total == size {
                let session = checkpoint.session.as_str();
                match self
                    .retry
                    .run("session offset", &lease.cancel, |_| remote.session_offset(session))
                    .await
                {
                    Ok(offset) => {
                        info!(id, session, offset, "resuming upload session");
                        return Ok((checkpoint.session.clone(), offset));
                    }
                    Err(RetryError::Remote(e)) if e.kind == RemoteErrorKind::SessionExpired => {
                        debug!(id, session, "upload session expired, starting over");
                    }
                    Err(e) => return Err(remote_error(id, e)),
                }
            } else {
                self.abandon(&checkpoint.session).await;
            }
        }

        let session = self
            .retry
            .run("open session", &lease.cancel, |_| {
                remote.open_upload_session(target, size)
            })
            .await
            .map_err(|e| remote_error(id, e))?;
        let checkpoint = UploadCheckpoint {
            session: session.clone(),
            offset: 0,
            total: size,
        };
        self.state
            .save_upload_checkpoint(id, lease.worker_id, record.local_revision, Some(checkpoint))
            .await?;
        debug!(id, session = %session, total = size, "opened upload session");
        Ok((session, 0))
    }

    /// Fail with `ConflictDetected` unless the remote is still at the
    /// version the local edit started from.
    async fn check_base(&self, record: &ItemRecord, lease: &WorkerLease) -> Result<(), UploadError> {
        let id = record.id.as_str();
        let remote = &self.remote;
        let current = match self
            .retry
            .run("stat", &lease.cancel, |_| remote.stat(id))
            .await
        {
            Ok(entry) => Some(entry.etag),
            Err(RetryError::Remote(e)) if e.is_not_found() => None,
            Err(e) => return Err(remote_error(id, e)),
        };

        if current == record.base_etag {
            return Ok(());
        }
        Err(UploadError::ConflictDetected {
            id: id.to_string(),
            base: record.base_etag.clone(),
            remote: current,
        })
    }

    async fn finish(
        &self,
        record: &ItemRecord,
        lease: &WorkerLease,
        entry: RemoteEntry,
    ) -> Result<UploadOutcome, UploadError> {
        let id = record.id.as_str();
        let fields = TransitionFields::new()
            .with_etag(entry.etag.clone())
            .with_size(entry.size)
            .with_remote_etag(entry.etag.clone())
            .with_lease(lease.worker_id)
            .expecting_revision(record.local_revision);

        match self.state.transition(id, ItemState::Hydrated, fields).await {
            Ok(_) => {
                info!(id, etag = %entry.etag, bytes = entry.size, "upload complete");
                Ok(UploadOutcome::Uploaded { etag: entry.etag })
            }
            Err(StateError::RevisionChanged { actual, .. }) => {
                self.state
                    .rebase_local(id, Some(lease.worker_id), &entry.etag)
                    .await?;
                info!(id, etag = %entry.etag, revision = actual, "upload superseded by newer write");
                Ok(UploadOutcome::Superseded)
            }
            Err(err @ StateError::LeaseLost { .. }) => self.settle_own_conflict(record, entry, err).await,
            Err(e) => Err(e.into()),
        }
    }

    /// The delta announcing this very upload can land between the push and
    /// the commit and flag the entry CONFLICT against our own version.
    async fn settle_own_conflict(
        &self,
        record: &ItemRecord,
        entry: RemoteEntry,
        lost: StateError,
    ) -> Result<UploadOutcome, UploadError> {
        let id = record.id.as_str();
        let current = self.state.require(id).await?;
        if current.state != ItemState::Conflict
            || current.remote_etag.as_deref() != Some(entry.etag.as_str())
        {
            return Err(lost.into());
        }

        let fields = TransitionFields::new()
            .with_etag(entry.etag.clone())
            .with_size(entry.size)
            .with_remote_etag(entry.etag.clone())
            .expecting_revision(record.local_revision);
        match self.state.transition(id, ItemState::Hydrated, fields).await {
            Ok(_) => {
                info!(id, etag = %entry.etag, "upload complete, own change cleared from conflict");
                Ok(UploadOutcome::Uploaded { etag: entry.etag })
            }
            Err(StateError::RevisionChanged { .. }) => {
                let fields = TransitionFields::new().with_base_etag(entry.etag.clone());
                self.state.transition(id, ItemState::DirtyLocal, fields).await?;
                self.state.rebase_local(id, None, &entry.etag).await?;
                info!(id, etag = %entry.etag, "upload superseded by newer write");
                Ok(UploadOutcome::Superseded)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn fail(
        &self,
        record: &ItemRecord,
        lease: &WorkerLease,
        err: UploadError,
    ) -> Result<UploadOutcome, UploadError> {
        let id = record.id.as_str();
        match &err {
            UploadError::ConflictDetected { base, remote, .. } => {
                warn!(id, ?base, ?remote, "remote changed under local edit");
                if let Some(checkpoint) = &record.upload {
                    self.abandon(&checkpoint.session).await;
                }
                let fields = match remote {
                    Some(etag) => TransitionFields::new().with_remote_etag(etag.clone()),
                    None => TransitionFields::new().with_remote_gone(),
                }
                .with_lease(lease.worker_id);
                if let Err(e) = self.state.transition(id, ItemState::Conflict, fields).await {
                    warn!(id, error = %e, "failed to record conflict");
                }
            }
            UploadError::State(StateError::RevisionChanged { .. }) => {
                // bytes already sent belong to an older revision
                if let Some(checkpoint) = self.state.get(id).await?.and_then(|r| r.upload) {
                    self.abandon(&checkpoint.session).await;
                }
                debug!(id, "local content changed mid-upload");
                return Ok(UploadOutcome::Superseded);
            }
            UploadError::State(StateError::LeaseLost { .. }) => {
                debug!(id, "upload taken over");
            }
            other => {
                let temporary = other.is_temporary();
                self.record_error(lease, &err, temporary).await;
            }
        }
        Err(err)
    }

    async fn record_error(&self, lease: &WorkerLease, err: &UploadError, temporary: bool) {
        let message = match err {
            UploadError::Cancelled(_) => "cancelled".to_string(),
            other => other.to_string(),
        };
        warn!(id = %lease.id, error = %message, temporary, "upload failed");

        let fields = TransitionFields::error(message, temporary).with_lease(lease.worker_id);
        match self.state.transition(&lease.id, ItemState::Error, fields).await {
            Ok(_) => {}
            Err(StateError::LeaseLost { .. }) => {
                debug!(id = %lease.id, "record taken over before failure was recorded");
            }
            Err(e) => warn!(id = %lease.id, error = %e, "failed to record upload error"),
        }
    }

    async fn abandon(&self, session: &str) {
        if let Err(e) = self.remote.cancel_upload_session(session).await {
            debug!(session, error = %e, "failed to cancel upload session");
        }
    }

    fn progress(&self, id: &str, bytes: u64, total: u64) {
        self.state.events().publish(EngineEvent::UploadProgress {
            id: id.to_string(),
            bytes,
            total,
        });
    }
}

fn remote_error(id: &str, err: RetryError) -> UploadError {
    match err {
        RetryError::Cancelled => UploadError::Cancelled(id.to_string()),
        RetryError::Remote(source) => UploadError::Remote {
            id: id.to_string(),
            source,
        },
    }
}

#[cfg(test)]
mod tests {
    use metadata_store::Database;

    use super::*;
    use crate::events::EventBus;
    use crate::remote::{Fault, MemoryRemote, RemoteOp, RemoteRequest};
    use crate::state::NewItem;

    struct Harness {
        uploads: UploadManager,
        state: StateManager,
        remote: Arc<MemoryRemote>,
        cache: ContentCache,
        _dir: tempfile::TempDir,
    }

    async fn setup() -> Harness {
        let dir = tempfile::TempDir::new().unwrap();
        let db = Database::in_memory().await.unwrap();
        let state = StateManager::new(db, EventBus::new(256));
        let remote = Arc::new(MemoryRemote::new());
        let cache = ContentCache::open(dir.path(), 1024 * 1024).await.unwrap();
        let config = UploadConfig {
            small_threshold: 8,
            chunk_size: 4,
        };
        let uploads = UploadManager::new(
            state.clone(),
            remote.clone(),
            cache.clone(),
            RetryPolicy::immediate(2),
            &config,
        );
        Harness {
            uploads,
            state,
            remote,
            cache,
            _dir: dir,
        }
    }

    async fn local_file(h: &Harness, id: &str, data: &[u8]) {
        h.cache.write_all(id, data).await.unwrap();
        h.state
            .create(NewItem::local(id, None, id, data.len() as u64))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_small_file_single_request() {
        let h = setup().await;
        local_file(&h, "a", b"tiny").await;

        let outcome = h.uploads.upload("a").await.unwrap();
        let UploadOutcome::Uploaded { etag } = outcome else {
            panic!("expected upload");
        };
        assert_eq!(h.remote.content("a").unwrap(), Bytes::from_static(b"tiny"));

        let record = h.state.require("a").await.unwrap();
        assert_eq!(record.state, ItemState::Hydrated);
        assert_eq!(record.etag.as_deref(), Some(etag.as_str()));
        assert!(!record.local_changes);
        assert!(h
            .remote
            .requests()
            .iter()
            .any(|r| matches!(r, RemoteRequest::UploadSmall { .. })));
    }

    #[tokio::test]
    async fn test_large_file_uses_session() {
        let h = setup().await;
        local_file(&h, "a", b"0123456789abcdef").await;

        h.uploads.upload("a").await.unwrap();
        assert_eq!(h.remote.chunk_offsets("a"), vec![0, 4, 8, 12]);
        assert_eq!(
            h.remote.content("a").unwrap(),
            Bytes::from_static(b"0123456789abcdef")
        );
        let record = h.state.require("a").await.unwrap();
        assert!(record.upload.is_none());
        assert_eq!(record.size, 16);
    }

    #[tokio::test]
    async fn test_remote_change_becomes_conflict() {
        let h = setup().await;
        let base = h.remote.insert("a", "original");
        h.state
            .create(NewItem::remote("a", None, "a", base.clone(), 8))
            .await
            .unwrap();
        h.cache.write_all("a", b"mine").await.unwrap();
        h.state.record_local_write("a", 4).await.unwrap();

        let theirs = h.remote.insert("a", "theirs");
        let err = h.uploads.upload("a").await.unwrap_err();
        assert!(matches!(err, UploadError::ConflictDetected { .. }));

        let record = h.state.require("a").await.unwrap();
        assert_eq!(record.state, ItemState::Conflict);
        assert_eq!(record.base_etag.as_deref(), Some(base.as_str()));
        assert_eq!(record.remote_etag.as_deref(), Some(theirs.as_str()));
        assert_eq!(h.remote.content("a").unwrap(), Bytes::from_static(b"theirs"));
    }

    #[tokio::test]
    async fn test_failure_checkpoints_session() {
        let h = setup().await;
        local_file(&h, "a", b"0123456789abcdef").await;
        h.remote.inject(
            Fault::new(RemoteOp::UploadChunk, RemoteErrorKind::ServerError)
                .at_offset(8)
                .times(2),
        );

        let err = h.uploads.upload("a").await.unwrap_err();
        assert!(err.is_temporary());

        let record = h.state.require("a").await.unwrap();
        assert_eq!(record.state, ItemState::Error);
        assert!(record.is_temporary_error);
        assert!(record.local_changes);
        assert_eq!(record.upload.as_ref().unwrap().offset, 8);
    }

    #[tokio::test]
    async fn test_write_after_upload_start_is_superseded() {
        let h = setup().await;
        local_file(&h, "a", b"tiny").await;
        let record = h.state.require("a").await.unwrap();
        let lease = h
            .state
            .claim("a", WorkerKind::Upload, &[ItemState::DirtyLocal])
            .await
            .unwrap();

        h.cache.write_all("a", b"newer").await.unwrap();
        h.state.record_local_write("a", 5).await.unwrap();

        let entry = h.uploads.push(&record, &lease).await.unwrap();
        let outcome = h.uploads.finish(&record, &lease, entry.clone()).await.unwrap();
        assert_eq!(outcome, UploadOutcome::Superseded);

        let record = h.state.require("a").await.unwrap();
        assert_eq!(record.state, ItemState::DirtyLocal);
        assert_eq!(record.base_etag.as_deref(), Some(entry.etag.as_str()));
    }

    /// Start an upload of a local edit to "a" and push its bytes
    async fn pushed(h: &Harness) -> (ItemRecord, WorkerLease, RemoteEntry) {
        let base = h.remote.insert("a", "original");
        h.state
            .create(NewItem::remote("a", None, "a", base, 8))
            .await
            .unwrap();
        h.cache.write_all("a", b"mine").await.unwrap();
        h.state.record_local_write("a", 4).await.unwrap();

        let record = h.state.require("a").await.unwrap();
        let lease = h
            .state
            .claim("a", WorkerKind::Upload, &[ItemState::DirtyLocal])
            .await
            .unwrap();
        let entry = h.uploads.push(&record, &lease).await.unwrap();
        (record, lease, entry)
    }

    #[tokio::test]
    async fn test_own_change_reported_before_commit() {
        let h = setup().await;
        let (record, lease, entry) = pushed(&h).await;

        // the remote announces our upload before it commits
        h.state
            .transition(
                "a",
                ItemState::Conflict,
                TransitionFields::new().with_remote_etag(entry.etag.clone()),
            )
            .await
            .unwrap();
        assert!(lease.is_cancelled());

        let outcome = h.uploads.finish(&record, &lease, entry.clone()).await.unwrap();
        assert_eq!(
            outcome,
            UploadOutcome::Uploaded {
                etag: entry.etag.clone()
            }
        );
        let record = h.state.require("a").await.unwrap();
        assert_eq!(record.state, ItemState::Hydrated);
        assert_eq!(record.etag.as_deref(), Some(entry.etag.as_str()));
        assert!(!record.local_changes);
        assert_eq!(record.base_etag, None);
    }

    #[tokio::test]
    async fn test_foreign_change_before_commit_stays_conflicted() {
        let h = setup().await;
        let (record, lease, entry) = pushed(&h).await;

        h.state
            .transition(
                "a",
                ItemState::Conflict,
                TransitionFields::new().with_remote_etag("someone-else"),
            )
            .await
            .unwrap();

        let err = h.uploads.finish(&record, &lease, entry).await.unwrap_err();
        assert!(matches!(err, UploadError::State(StateError::LeaseLost { .. })));
        assert_eq!(h.state.require("a").await.unwrap().state, ItemState::Conflict);
    }

    #[tokio::test]
    async fn test_clean_entry_is_not_uploadable() {
        let h = setup().await;
        let etag = h.remote.insert("a", "x");
        h.state
            .create(NewItem::remote("a", None, "a", etag, 1))
            .await
            .unwrap();

        let err = h.uploads.upload("a").await.unwrap_err();
        assert!(matches!(err, UploadError::NotUploadable { .. }));
    }
}
