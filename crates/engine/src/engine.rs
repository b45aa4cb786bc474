//! The entry point filesystem handlers talk to.
//!
//! [`SyncEngine`] wires the State Manager, the content cache and the workers
//! together, answers reads and writes, and owns the background tasks.

use std::sync::Arc;
use std::time::Duration;

use metadata_store::{Database, ItemRecord, ItemState};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{ContentCache, HydratedContent};
use crate::config::EngineConfig;
use crate::conflict::ConflictReconciler;
use crate::delta::DeltaIngestor;
use crate::error::{AccessError, EngineError, HydrationError, StateError, UploadError};
use crate::events::{EngineEvent, EventBus};
use crate::eviction::EvictionSweeper;
use crate::hydration::HydrationEngine;
use crate::jobs::{self, Job, JobDispatcher, JobReceiver};
use crate::remote::RemoteStorage;
use crate::retry::RetryPolicy;
use crate::state::{ItemStatus, NewItem, StateManager, TransitionFields};
use crate::upload::{UploadManager, UploadOutcome};

/// How long a delete waits for an in-flight hydration to wind down
const DELETE_WAIT: Duration = Duration::from_secs(5);
const DELETE_ATTEMPTS: usize = 3;
/// How long shutdown waits for cancelled workers to record their outcome
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Outcome of one re-drive pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RedriveReport {
    pub attempted: usize,
    pub recovered: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<Inner>,
}

struct Inner {
    config: EngineConfig,
    state: StateManager,
    cache: ContentCache,
    hydration: HydrationEngine,
    uploads: UploadManager,
    sweeper: EvictionSweeper,
    reconciler: ConflictReconciler,
    delta: DeltaIngestor,
    jobs: JobDispatcher,
    receiver: Mutex<Option<JobReceiver>>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("data_dir", &self.inner.config.data_dir)
            .field("pending_jobs", &self.inner.jobs.pending())
            .finish()
    }
}

impl SyncEngine {
    /// Open the engine described by `config`, creating its database and
    /// cache directories as needed
    pub async fn open(
        config: EngineConfig,
        remote: Arc<dyn RemoteStorage>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let db = match &config.database_url {
            Some(url) => Database::connect(url).await?,
            None => Database::new(config.db_path()).await?,
        };
        Self::with_database(config, db, remote).await
    }

    /// Build the engine over an already opened database.
    ///
    /// Hydrations left HYDRATING by a previous process are failed as
    /// temporary errors, and DIRTY_LOCAL entries are queued for upload.
    /// Nothing runs until [`start`](Self::start).
    pub async fn with_database(
        config: EngineConfig,
        db: Database,
        remote: Arc<dyn RemoteStorage>,
    ) -> Result<Self, EngineError> {
        let state = StateManager::new(db, EventBus::new(config.events.capacity));

        let cache_dir = config.cache_dir();
        let cache = ContentCache::open(&cache_dir, config.cache.hot_bytes)
            .await
            .map_err(|source| EngineError::Cache {
                path: cache_dir.clone(),
                source,
            })?;

        let retry = RetryPolicy::from_config(&config.retry);
        let hydration = HydrationEngine::new(
            state.clone(),
            remote.clone(),
            cache.clone(),
            retry.clone(),
            &config.hydration,
        );
        let uploads = UploadManager::new(
            state.clone(),
            remote,
            cache.clone(),
            retry,
            &config.upload,
        );
        let sweeper = EvictionSweeper::new(state.clone(), cache.clone(), config.eviction.clone())
            .with_deleted_retention(config.gc.deleted_retention());
        let reconciler = ConflictReconciler::new(state.clone(), hydration.clone(), cache.clone());
        let delta = DeltaIngestor::new(state.clone(), cache.clone(), reconciler.clone());
        let (jobs, receiver) = JobDispatcher::new();

        let recovered = state.recover().await?;
        let dirty = state.db().list_by_state(ItemState::DirtyLocal).await?;
        for record in &dirty {
            if let Err(e) = jobs.dispatch_upload(&record.id) {
                warn!(id = %record.id, error = %e, "failed to queue pending upload");
            }
        }

        info!(
            data_dir = %config.data_dir.display(),
            recovered,
            pending_uploads = dirty.len(),
            "sync engine opened"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                state,
                cache,
                hydration,
                uploads,
                sweeper,
                reconciler,
                delta,
                jobs,
                receiver: Mutex::new(Some(receiver)),
                shutdown: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Spawn the job worker, the eviction sweeper and the re-drive timer.
    /// Calling it twice has no effect.
    pub fn start(&self) {
        let Some(receiver) = self.inner.receiver.lock().take() else {
            return;
        };
        let config = &self.inner.config;
        let shutdown = self.inner.shutdown.clone();

        let worker = tokio::spawn(jobs::run_worker(
            self.clone(),
            receiver,
            config.workers.max_concurrent,
            shutdown.clone(),
        ));
        let sweeper = tokio::spawn(
            self.inner
                .sweeper
                .clone()
                .run(config.eviction.sweep_interval(), shutdown.clone()),
        );
        let redrive = tokio::spawn(schedule_redrives(
            self.inner.jobs.clone(),
            config.retry.redrive_interval(),
            shutdown,
        ));

        self.inner.tasks.lock().extend([worker, sweeper, redrive]);
        info!("sync engine started");
    }

    /// Stop background work: cancel every worker, wait briefly for them to
    /// record their outcome, then close the database
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let cancelled = self.inner.state.cancel_all();
        info!(cancelled, "sync engine shutting down");

        let tasks = std::mem::take(&mut *self.inner.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "background task panicked");
            }
        }

        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        while !self.inner.state.workers().is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        self.inner.state.db().close().await;
        info!("sync engine stopped");
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn state(&self) -> &StateManager {
        &self.inner.state
    }

    pub fn cache(&self) -> &ContentCache {
        &self.inner.cache
    }

    pub fn hydration(&self) -> &HydrationEngine {
        &self.inner.hydration
    }

    pub fn uploads(&self) -> &UploadManager {
        &self.inner.uploads
    }

    pub fn sweeper(&self) -> &EvictionSweeper {
        &self.inner.sweeper
    }

    pub fn reconciler(&self) -> &ConflictReconciler {
        &self.inner.reconciler
    }

    pub fn delta(&self) -> &DeltaIngestor {
        &self.inner.delta
    }

    pub fn jobs(&self) -> &JobDispatcher {
        &self.inner.jobs
    }

    pub fn subscribe(&self) -> flume::Receiver<EngineEvent> {
        self.inner.state.events().subscribe()
    }

    pub async fn status(&self, id: &str) -> Result<ItemStatus, StateError> {
        self.inner.state.status(id).await
    }

    /// Open an entry for reading, hydrating it first if needed.
    ///
    /// An entry in ERROR is not downloaded again here; the handler gets the
    /// persisted error until a re-drive or an explicit [`retry`](Self::retry).
    /// One whose upload failed still serves its local content.
    pub async fn read(&self, id: &str) -> Result<HydratedContent, AccessError> {
        let record = self.existing(id).await?;
        match record.state {
            ItemState::Deleted => return Err(AccessError::Deleted(id.to_string())),
            ItemState::Error if !record.local_changes => return Err(failed(record)),
            _ => {}
        }

        let content = match self.inner.hydration.hydrate(id, false).await {
            Ok(content) => content,
            Err(HydrationError::NotHydratable {
                state: ItemState::Deleted,
                ..
            }) => return Err(AccessError::Deleted(id.to_string())),
            Err(err) => {
                let record = self.existing(id).await?;
                if record.state == ItemState::Error {
                    return Err(failed(record));
                }
                return Err(err.into());
            }
        };

        if let Err(e) = self.inner.state.touch(id).await {
            debug!(id, error = %e, "failed to record access");
        }
        Ok(content)
    }

    /// Replace an entry's content. The entry becomes DIRTY_LOCAL; the upload
    /// is queued by [`write_close`](Self::write_close).
    pub async fn write(&self, id: &str, data: &[u8]) -> Result<ItemRecord, AccessError> {
        let record = self.existing(id).await?;
        if record.is_virtual {
            return Err(StateError::VirtualEntryImmutable(id.to_string()).into());
        }
        match record.state {
            ItemState::Deleted => return Err(AccessError::Deleted(id.to_string())),
            ItemState::Hydrating => return Err(AccessError::Busy(id.to_string())),
            ItemState::Error if !record.local_changes => return Err(failed(record)),
            _ => {}
        }

        let Some(pin) = self.inner.cache.pin(id) else {
            return Err(AccessError::Busy(id.to_string()));
        };
        let size = self
            .inner
            .cache
            .write_all(id, data)
            .await
            .map_err(|source| AccessError::Io {
                id: id.to_string(),
                source,
            })?;
        let done = self
            .inner
            .state
            .record_local_write(id, size)
            .await
            .map_err(|e| match e {
                StateError::Busy { id, .. } => AccessError::Busy(id),
                StateError::InvalidTransition {
                    id,
                    from: ItemState::Hydrating,
                    ..
                } => AccessError::Busy(id),
                other => other.into(),
            })?;
        drop(pin);

        debug!(id, size, revision = done.record.local_revision, "local write");
        Ok(done.record)
    }

    /// The handler closed a written file; queue its upload
    pub async fn write_close(&self, id: &str) -> Result<(), AccessError> {
        let record = self.existing(id).await?;
        if record.state == ItemState::DirtyLocal {
            self.queue_upload(id);
        }
        Ok(())
    }

    /// Create a new file that exists only locally until its upload lands
    pub async fn create_local(
        &self,
        parent_id: Option<String>,
        name: &str,
        data: &[u8],
    ) -> Result<ItemRecord, AccessError> {
        let id = format!("local-{}", Uuid::new_v4());
        let size = self.write_content(&id, data).await?;
        let record = self
            .inner
            .state
            .create(NewItem::local(&id, parent_id, name, size))
            .await?;
        self.queue_upload(&id);
        info!(id, name, size, "created local item");
        Ok(record)
    }

    /// Register synthetic content that never leaves HYDRATED
    pub async fn create_virtual(
        &self,
        id: &str,
        parent_id: Option<String>,
        name: &str,
        data: &[u8],
    ) -> Result<ItemRecord, AccessError> {
        let size = self.write_content(id, data).await?;
        let record = self
            .inner
            .state
            .create(NewItem::virtual_entry(id, parent_id, name, size))
            .await?;
        Ok(record)
    }

    /// Delete an entry locally. An in-flight hydration is cancelled first;
    /// a conflicted entry discards both sides.
    pub async fn delete_local(&self, id: &str) -> Result<ItemRecord, AccessError> {
        for _ in 0..DELETE_ATTEMPTS {
            let record = self.existing(id).await?;
            if record.is_virtual {
                return Err(StateError::VirtualEntryImmutable(id.to_string()).into());
            }

            let result = match record.state {
                ItemState::Deleted => return Ok(record),
                ItemState::Hydrating => {
                    self.inner.state.cancel(id);
                    self.inner
                        .state
                        .wait_while(id, ItemState::Hydrating, DELETE_WAIT)
                        .await?;
                    continue;
                }
                ItemState::Conflict => match self
                    .inner
                    .state
                    .transition(id, ItemState::DirtyLocal, TransitionFields::new())
                    .await
                {
                    Ok(_) => self.mark_deleted(id).await,
                    Err(e) => Err(e),
                },
                _ => self.mark_deleted(id).await,
            };

            match result {
                Ok(record) => {
                    if let Err(e) = self.inner.cache.remove(id).await {
                        warn!(id, error = %e, "failed to remove cached content");
                    }
                    info!(id, "deleted locally");
                    return Ok(record);
                }
                Err(StateError::InvalidTransition { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(AccessError::Busy(id.to_string()))
    }

    /// Resolve a conflict in favor of the local content and queue its upload
    pub async fn keep_local(&self, id: &str) -> Result<ItemRecord, StateError> {
        let record = self.inner.reconciler.keep_local(id).await?;
        self.queue_upload(id);
        Ok(record)
    }

    /// Resolve a conflict in favor of the remote
    pub async fn accept_remote(&self, id: &str) -> Result<ItemRecord, HydrationError> {
        self.inner.reconciler.accept_remote(id).await
    }

    /// Retry an entry in ERROR: a pending upload is resumed, anything else is
    /// hydrated again
    pub async fn retry(&self, id: &str) -> Result<(), AccessError> {
        let record = self.existing(id).await?;
        if record.state != ItemState::Error {
            return Err(StateError::WrongState {
                id: id.to_string(),
                state: record.state,
            }
            .into());
        }
        if record.local_changes {
            self.inner.uploads.resume(id).await?;
        } else {
            self.inner.hydration.hydrate(id, false).await?;
        }
        Ok(())
    }

    /// Retry every ERROR entry whose failure was temporary and that has not
    /// used up its re-drives
    pub async fn redrive_errors(&self) -> Result<RedriveReport, StateError> {
        let candidates = self
            .inner
            .state
            .db()
            .redrive_candidates(self.inner.config.retry.max_redrives)
            .await?;

        let mut report = RedriveReport::default();
        for record in candidates {
            report.attempted += 1;
            match self.retry(&record.id).await {
                Ok(()) => report.recovered += 1,
                Err(e) => {
                    debug!(id = %record.id, error = %e, "re-drive failed");
                    report.failed += 1;
                }
            }
        }

        if report.attempted > 0 {
            info!(
                attempted = report.attempted,
                recovered = report.recovered,
                failed = report.failed,
                "re-drive pass"
            );
        }
        Ok(report)
    }

    /// Execute one queued job
    pub async fn run_job(&self, job: Job) -> anyhow::Result<()> {
        match job {
            Job::Hydrate { id } => {
                self.inner.hydration.hydrate(&id, false).await?;
            }
            Job::Upload { id } => match self.inner.uploads.upload(&id).await {
                Ok(UploadOutcome::Uploaded { .. }) => {}
                // written again while uploading; push the newer content
                Ok(UploadOutcome::Superseded) => self.inner.jobs.dispatch_upload(&id)?,
                Err(UploadError::NotUploadable { state, .. }) => {
                    debug!(id, %state, "nothing to upload");
                }
                Err(UploadError::State(StateError::Busy { .. })) => {
                    debug!(id, "upload already running");
                }
                Err(e) => return Err(e.into()),
            },
            Job::Evict { id } => {
                self.inner.sweeper.evict(&id).await?;
            }
            Job::Sweep => {
                self.inner.sweeper.sweep().await?;
            }
            Job::Redrive => {
                self.redrive_errors().await?;
            }
        }
        Ok(())
    }

    async fn existing(&self, id: &str) -> Result<ItemRecord, AccessError> {
        self.inner
            .state
            .get(id)
            .await?
            .ok_or_else(|| AccessError::NotFound(id.to_string()))
    }

    async fn write_content(&self, id: &str, data: &[u8]) -> Result<u64, AccessError> {
        self.inner
            .cache
            .write_all(id, data)
            .await
            .map_err(|source| AccessError::Io {
                id: id.to_string(),
                source,
            })
    }

    async fn mark_deleted(&self, id: &str) -> Result<ItemRecord, StateError> {
        let done = self
            .inner
            .state
            .transition(id, ItemState::Deleted, TransitionFields::new())
            .await?;
        Ok(done.record)
    }

    fn queue_upload(&self, id: &str) {
        if let Err(e) = self.inner.jobs.dispatch_upload(id) {
            warn!(id, error = %e, "failed to queue upload");
        }
    }
}

fn failed(record: ItemRecord) -> AccessError {
    AccessError::Failed {
        message: record
            .last_error
            .unwrap_or_else(|| "unknown error".to_string()),
        id: record.id,
    }
}

async fn schedule_redrives(jobs: JobDispatcher, interval: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if jobs.dispatch(Job::Redrive).is_err() {
                    break;
                }
            }
        }
    }
    debug!("re-drive timer stopped");
}
