//! Hydration Engine
//!
//! Brings remote content into the local cache on first access. One worker
//! per record: the first reader moves the record to HYDRATING and downloads,
//! concurrent readers wait for the resulting state change and then serve
//! from the cache.
//!
//! Content is downloaded in chunks into a staged file that replaces the
//! cached object only once complete. Every chunk is requested against the
//! etag the download started with, so a remote change mid-transfer fails the
//! download instead of mixing two versions.

use std::sync::Arc;
use std::time::Duration;

use metadata_store::{ItemRecord, ItemState};
use tracing::{debug, info, warn};

use crate::cache::{ContentCache, HydratedContent, StagedFile};
use crate::config::HydrationConfig;
use crate::error::{HydrationError, StateError};
use crate::events::EngineEvent;
use crate::remote::{RemoteEntry, RemoteStorage};
use crate::retry::{RetryError, RetryPolicy};
use crate::state::table::{self, HydratePlan};
use crate::state::{StateManager, TransitionFields, WorkerKind, WorkerLease};

/// How long a reader waits on another worker's download before re-checking
const WAIT_LIMIT: Duration = Duration::from_secs(30);
/// Back-off while a record is briefly held by a worker or an eviction
const CONTENDED_DELAY: Duration = Duration::from_millis(10);

#[derive(Clone)]
pub struct HydrationEngine {
    state: StateManager,
    remote: Arc<dyn RemoteStorage>,
    cache: ContentCache,
    retry: RetryPolicy,
    chunk_size: u64,
    progress_interval: u64,
}

impl HydrationEngine {
    pub fn new(
        state: StateManager,
        remote: Arc<dyn RemoteStorage>,
        cache: ContentCache,
        retry: RetryPolicy,
        config: &HydrationConfig,
    ) -> Self {
        Self {
            state,
            remote,
            cache,
            retry,
            chunk_size: config.chunk_size.max(1),
            progress_interval: config.progress_interval.max(1),
        }
    }

    /// Make the content of `id` available locally and pin it for the
    /// caller.
    ///
    /// With `force`, a HYDRATED entry is downloaded again and an ERROR entry
    /// holding unsent local edits may be overwritten.
    pub async fn hydrate(&self, id: &str, force: bool) -> Result<HydratedContent, HydrationError> {
        loop {
            let record = self.state.require(id).await?;
            let refresh = force
                && !record.is_virtual
                && matches!(record.state, ItemState::Hydrated | ItemState::Error);

            match table::hydrate_plan(record.state, record.is_virtual, record.local_changes) {
                HydratePlan::Serve if !refresh => match self.serve(&record).await? {
                    Some(content) => return Ok(content),
                    None => {
                        tokio::time::sleep(CONTENDED_DELAY).await;
                        continue;
                    }
                },
                HydratePlan::Serve => {}
                HydratePlan::Download => {
                    if record.state == ItemState::Ghost && !force {
                        if let Some(content) = self.reuse(&record).await? {
                            return Ok(content);
                        }
                    }
                }
                HydratePlan::Wait => {
                    debug!(id, "waiting on in-flight hydration");
                    self.state
                        .wait_while(id, ItemState::Hydrating, WAIT_LIMIT)
                        .await?;
                    continue;
                }
                HydratePlan::Gone => {
                    return Err(HydrationError::NotHydratable {
                        id: id.to_string(),
                        state: record.state,
                    })
                }
            }

            match self.download(&record).await {
                // lost the race to another reader
                Err(HydrationError::State(StateError::Busy { .. }))
                | Err(HydrationError::State(StateError::InvalidTransition {
                    from: ItemState::Hydrating,
                    ..
                })) => {
                    tokio::time::sleep(CONTENDED_DELAY).await;
                    continue;
                }
                result => return result,
            }
        }
    }

    /// Download the remote version of a CONFLICT entry and resolve the
    /// conflict in its favor. On failure the entry stays CONFLICT.
    pub async fn refresh_conflicted(&self, id: &str) -> Result<ItemRecord, HydrationError> {
        let lease = self
            .state
            .claim(id, WorkerKind::Refresh, &[ItemState::Conflict])
            .await?;

        let entry = self.stat(&lease).await?;
        let staged = self.download_to_stage(&lease, &entry).await?;
        staged
            .commit(&self.cache)
            .await
            .map_err(|e| HydrationError::io(id, e))?;

        let fields = TransitionFields::new()
            .with_etag(entry.etag.clone())
            .with_size(entry.size)
            .with_remote_etag(entry.etag.clone())
            .with_lease(lease.worker_id);
        let done = self.state.transition(id, ItemState::Hydrated, fields).await?;
        info!(id, etag = %entry.etag, "conflict resolved with remote version");
        Ok(done.record)
    }

    /// Pin cached content that a reader may be served. `None` while the
    /// file is being evicted.
    async fn serve(&self, record: &ItemRecord) -> Result<Option<HydratedContent>, HydrationError> {
        let Some(pin) = self.cache.pin(&record.id) else {
            return Ok(None);
        };
        if !self.cache.contains(&record.id).await {
            return Err(HydrationError::io(
                &record.id,
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no cached content for {} while {}", record.id, record.state),
                ),
            ));
        }
        Ok(Some(HydratedContent::new(
            &record.id,
            record.size,
            record.etag.clone(),
            self.cache.clone(),
            pin,
        )))
    }

    /// A GHOST whose current version is still on disk, e.g. after a crash
    /// between eviction commit and file removal, is promoted without a
    /// download.
    async fn reuse(&self, record: &ItemRecord) -> Result<Option<HydratedContent>, HydrationError> {
        if record.etag.is_none() || record.is_stale() {
            return Ok(None);
        }
        let Some(pin) = self.cache.pin(&record.id) else {
            return Ok(None);
        };
        let cached = self
            .cache
            .len(&record.id)
            .await
            .map_err(|e| HydrationError::io(&record.id, e))?;
        if cached != Some(record.size) {
            return Ok(None);
        }

        match self
            .state
            .transition(&record.id, ItemState::Hydrated, TransitionFields::new())
            .await
        {
            Ok(done) => {
                debug!(id = %record.id, "reused cached content");
                Ok(Some(HydratedContent::new(
                    &record.id,
                    done.record.size,
                    done.record.etag,
                    self.cache.clone(),
                    pin,
                )))
            }
            Err(StateError::InvalidTransition { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn download(&self, record: &ItemRecord) -> Result<HydratedContent, HydrationError> {
        let id = record.id.as_str();
        let lease = self.state.begin_hydration(id, WorkerKind::Hydration).await?;
        info!(id, worker = %lease.worker_id, "hydration started");

        let entry = match self.fetch(record, &lease).await {
            Ok(entry) => entry,
            Err(err) => {
                self.fail(&lease, &err).await;
                return Err(err);
            }
        };

        let Some(pin) = self.cache.pin(id) else {
            let err = HydrationError::io(
                id,
                std::io::Error::new(std::io::ErrorKind::WouldBlock, "content is being evicted"),
            );
            self.fail(&lease, &err).await;
            return Err(err);
        };

        let fields = TransitionFields::new()
            .with_etag(entry.etag.clone())
            .with_size(entry.size)
            .observed_remote(entry.etag.clone(), lease.version)
            .with_lease(lease.worker_id);
        let done = self.state.transition(id, ItemState::Hydrated, fields).await?;
        info!(id, etag = %entry.etag, bytes = entry.size, "hydration complete");

        if done.record.is_stale() {
            // the remote moved on while we downloaded; serve what we have,
            // the next access fetches the newer version
            debug!(id, remote = ?done.record.remote_etag, "hydrated content already stale");
            if let Err(e) = self
                .state
                .transition(id, ItemState::Ghost, TransitionFields::new())
                .await
            {
                debug!(id, error = %e, "could not mark stale content");
            }
        }

        Ok(HydratedContent::new(
            id,
            entry.size,
            Some(entry.etag),
            self.cache.clone(),
            pin,
        ))
    }

    /// Put the current remote version of `record` in the cache
    async fn fetch(
        &self,
        record: &ItemRecord,
        lease: &WorkerLease,
    ) -> Result<RemoteEntry, HydrationError> {
        let entry = self.stat(lease).await?;

        let cached = self
            .cache
            .len(&record.id)
            .await
            .map_err(|e| HydrationError::io(&record.id, e))?;
        if record.etag.as_deref() == Some(entry.etag.as_str()) && cached == Some(entry.size) {
            debug!(id = %record.id, "cached content already current");
            return Ok(entry);
        }

        let staged = self.download_to_stage(lease, &entry).await?;
        staged
            .commit(&self.cache)
            .await
            .map_err(|e| HydrationError::io(&record.id, e))?;
        Ok(entry)
    }

    async fn stat(&self, lease: &WorkerLease) -> Result<RemoteEntry, HydrationError> {
        let remote = &self.remote;
        let id = lease.id.as_str();
        self.retry
            .run("stat", &lease.cancel, |_| remote.stat(id))
            .await
            .map_err(|e| remote_error(id, e))
    }

    async fn download_to_stage(
        &self,
        lease: &WorkerLease,
        entry: &RemoteEntry,
    ) -> Result<StagedFile, HydrationError> {
        let id = lease.id.as_str();
        let etag = entry.etag.as_str();
        let remote = &self.remote;
        let mut staged = self.cache.stage(id).map_err(|e| HydrationError::io(id, e))?;

        let mut offset = 0;
        let mut next_progress = self.progress_interval;
        while offset < entry.size {
            if lease.is_cancelled() {
                return Err(HydrationError::Cancelled(id.to_string()));
            }
            let range = offset..(offset + self.chunk_size).min(entry.size);
            let chunk = self
                .retry
                .run("download", &lease.cancel, |_| {
                    remote.download_chunk(id, etag, range.clone())
                })
                .await
                .map_err(|e| remote_error(id, e))?;
            if chunk.is_empty() {
                return Err(HydrationError::ShortRead {
                    id: id.to_string(),
                    expected: entry.size,
                    actual: offset,
                });
            }

            staged
                .write(&chunk)
                .await
                .map_err(|e| HydrationError::io(id, e))?;
            offset += chunk.len() as u64;

            if offset >= next_progress && offset < entry.size {
                self.progress(id, offset, entry.size);
                next_progress = offset + self.progress_interval;
            }
        }
        self.progress(id, offset, entry.size);

        Ok(staged)
    }

    fn progress(&self, id: &str, bytes: u64, total: u64) {
        self.state.events().publish(EngineEvent::HydrationProgress {
            id: id.to_string(),
            bytes,
            total,
        });
    }

    async fn fail(&self, lease: &WorkerLease, err: &HydrationError) {
        let message = match err {
            HydrationError::Cancelled(_) => "cancelled".to_string(),
            other => other.to_string(),
        };
        warn!(id = %lease.id, error = %message, "hydration failed");

        let fields = TransitionFields::error(message, err.is_temporary()).with_lease(lease.worker_id);
        match self.state.transition(&lease.id, ItemState::Error, fields).await {
            Ok(_) => {}
            Err(StateError::LeaseLost { .. }) => {
                debug!(id = %lease.id, "record taken over before failure was recorded");
            }
            Err(e) => warn!(id = %lease.id, error = %e, "failed to record hydration error"),
        }
    }
}

fn remote_error(id: &str, err: RetryError) -> HydrationError {
    match err {
        RetryError::Cancelled => HydrationError::Cancelled(id.to_string()),
        RetryError::Remote(source) => HydrationError::Remote {
            id: id.to_string(),
            source,
        },
    }
}
