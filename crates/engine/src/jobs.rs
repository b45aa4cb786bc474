//! Background job queue
//!
//! Filesystem handlers never wait on the network for anything but the read
//! they serve. Uploads, prefetches, sweeps and re-drives are queued here and
//! executed by [`run_worker`] on a bounded number of concurrent tasks.

use std::sync::Arc;

use anyhow::Result;
use futures::StreamExt;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::SyncEngine;

/// Work the engine performs in the background
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Job {
    /// Prefetch an entry's content
    Hydrate { id: String },
    /// Push a DIRTY_LOCAL entry
    Upload { id: String },
    Evict { id: String },
    /// One eviction pass over the whole cache
    Sweep,
    /// Re-drive ERROR entries with temporary failures
    Redrive,
}

impl Job {
    pub fn name(&self) -> &'static str {
        match self {
            Job::Hydrate { .. } => "hydrate",
            Job::Upload { .. } => "upload",
            Job::Evict { .. } => "evict",
            Job::Sweep => "sweep",
            Job::Redrive => "redrive",
        }
    }
}

/// Cloneable handle for queueing jobs from anywhere in the engine
#[derive(Debug, Clone)]
pub struct JobDispatcher {
    tx: flume::Sender<Job>,
}

impl JobDispatcher {
    /// Create a dispatcher and the receiver the worker consumes
    pub fn new() -> (Self, JobReceiver) {
        let (tx, rx) = flume::unbounded();
        (Self { tx }, JobReceiver { rx })
    }

    /// Queue a job; fails only once the receiver is gone
    pub fn dispatch(&self, job: Job) -> Result<()> {
        self.tx
            .send(job)
            .map_err(|_| anyhow::anyhow!("job receiver has been dropped"))
    }

    pub fn dispatch_upload(&self, id: &str) -> Result<()> {
        self.dispatch(Job::Upload { id: id.to_string() })
    }

    pub fn dispatch_hydrate(&self, id: &str) -> Result<()> {
        self.dispatch(Job::Hydrate { id: id.to_string() })
    }

    /// Jobs queued but not yet picked up
    pub fn pending(&self) -> usize {
        self.tx.len()
    }
}

/// Receiving end of the queue, owned by the worker
#[derive(Debug)]
pub struct JobReceiver {
    rx: flume::Receiver<Job>,
}

impl JobReceiver {
    /// Take a queued job without waiting
    pub fn try_recv(&self) -> Option<Job> {
        self.rx.try_recv().ok()
    }

    pub fn into_async(self) -> flume::r#async::RecvStream<'static, Job> {
        self.rx.into_stream()
    }
}

/// Execute queued jobs, at most `max_concurrent` at a time, until
/// `shutdown` fires or every dispatcher is dropped.
pub async fn run_worker(
    engine: SyncEngine,
    receiver: JobReceiver,
    max_concurrent: usize,
    shutdown: CancellationToken,
) {
    info!(max_concurrent, "starting background job worker");
    let limit = Arc::new(Semaphore::new(max_concurrent.max(1)));
    let mut stream = receiver.into_async();

    loop {
        let job = tokio::select! {
            _ = shutdown.cancelled() => break,
            job = stream.next() => match job {
                Some(job) => job,
                None => break,
            },
        };

        let permit = tokio::select! {
            _ = shutdown.cancelled() => break,
            permit = limit.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let engine = engine.clone();
        tokio::spawn(async move {
            let name = job.name();
            debug!(job = ?job, "running job");
            if let Err(e) = engine.run_job(job).await {
                warn!(job = name, error = %e, "job failed");
            }
            drop(permit);
        });
    }

    info!("background job worker stopped");
}
