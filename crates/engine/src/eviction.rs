//! Eviction Sweeper
//!
//! Frees cache space by returning HYDRATED entries to GHOST. Only clean,
//! non-virtual entries qualify, and only while nobody has their file open.

use std::sync::Arc;
use std::time::Duration;

use metadata_store::{ItemRecord, ItemState};
use serde::Serialize;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::ContentCache;
use crate::config::{EvictionConfig, GcConfig};
use crate::error::{EvictionError, StateError};
use crate::state::{self, table, StateManager, TransitionFields};

/// Decides which candidates go first
pub trait EvictionPolicy: Send + Sync + 'static {
    /// Reorder `candidates` so the entry to evict first comes first
    fn rank(&self, candidates: &mut [ItemRecord]);
}

/// Oldest access first; entries never read count from when they settled
#[derive(Debug, Clone, Copy, Default)]
pub struct LeastRecentlyAccessed;

impl EvictionPolicy for LeastRecentlyAccessed {
    fn rank(&self, candidates: &mut [ItemRecord]) {
        candidates.sort_by_key(last_used);
    }
}

fn last_used(record: &ItemRecord) -> OffsetDateTime {
    record.last_accessed_at.unwrap_or(record.state_changed_at)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub examined: usize,
    pub evicted: usize,
    pub skipped: usize,
    pub freed_bytes: u64,
    pub cached_before: u64,
    pub cached_after: u64,
}

#[derive(Clone)]
pub struct EvictionSweeper {
    state: StateManager,
    cache: ContentCache,
    policy: Arc<dyn EvictionPolicy>,
    config: EvictionConfig,
    /// DELETED records older than this are purged by [`run`](Self::run)
    deleted_retention: Duration,
}

impl EvictionSweeper {
    pub fn new(state: StateManager, cache: ContentCache, config: EvictionConfig) -> Self {
        Self::with_policy(state, cache, config, Arc::new(LeastRecentlyAccessed))
    }

    pub fn with_policy(
        state: StateManager,
        cache: ContentCache,
        config: EvictionConfig,
        policy: Arc<dyn EvictionPolicy>,
    ) -> Self {
        Self {
            state,
            cache,
            policy,
            config,
            deleted_retention: GcConfig::default().deleted_retention(),
        }
    }

    pub fn with_deleted_retention(mut self, retention: Duration) -> Self {
        self.deleted_retention = retention;
        self
    }

    /// Evict one entry, returning the bytes freed
    pub async fn evict(&self, id: &str) -> Result<u64, EvictionError> {
        let record = self.state.require(id).await?;
        if !table::is_evictable(record.state, record.is_virtual) {
            return Err(EvictionError::NotEvictable {
                id: id.to_string(),
                state: record.state,
                is_virtual: record.is_virtual,
            });
        }

        // blocks new readers until the file is gone
        let Some(guard) = self.cache.begin_eviction(id) else {
            return Err(EvictionError::InUse(id.to_string()));
        };
        if self.state.active_worker(id).is_some() {
            return Err(EvictionError::InUse(id.to_string()));
        }

        match self
            .state
            .transition(id, ItemState::Ghost, TransitionFields::new())
            .await
        {
            Ok(_) => {}
            Err(StateError::InvalidTransition { from, .. }) => {
                return Err(EvictionError::NotEvictable {
                    id: id.to_string(),
                    state: from,
                    is_virtual: false,
                })
            }
            Err(e) => return Err(e.into()),
        }

        let freed = self
            .cache
            .remove(id)
            .await
            .map_err(|source| EvictionError::Io {
                id: id.to_string(),
                source,
            })?;
        drop(guard);

        debug!(id, freed, "evicted");
        Ok(freed)
    }

    /// One pass: evict down to the low watermark when over budget, and
    /// evict idle entries regardless of pressure.
    pub async fn sweep(&self) -> Result<SweepReport, EvictionError> {
        let cached = self.state.db().cached_bytes().await?;
        let mut report = SweepReport {
            cached_before: cached,
            cached_after: cached,
            ..SweepReport::default()
        };

        let over_budget = cached > self.config.max_cache_bytes;
        let idle_cutoff = self.config.idle_ttl().map(|ttl| state::now() - ttl);
        if !over_budget && idle_cutoff.is_none() {
            return Ok(report);
        }

        let low = self.config.low_watermark_bytes();
        let mut candidates = self
            .state
            .db()
            .eviction_candidates(self.config.batch)
            .await?;
        self.policy.rank(&mut candidates);

        let mut remaining = cached;
        for record in candidates {
            let pressure = over_budget && remaining > low;
            let idle = idle_cutoff.is_some_and(|cutoff| last_used(&record) < cutoff);
            if !pressure && !idle {
                continue;
            }
            report.examined += 1;

            match self.evict(&record.id).await {
                Ok(freed) => {
                    report.evicted += 1;
                    report.freed_bytes += freed;
                    remaining = remaining.saturating_sub(record.size);
                }
                Err(EvictionError::InUse(_)) | Err(EvictionError::NotEvictable { .. }) => {
                    report.skipped += 1;
                }
                Err(e) => {
                    warn!(id = %record.id, error = %e, "eviction failed");
                    report.skipped += 1;
                }
            }
        }
        report.cached_after = remaining;

        if report.evicted > 0 {
            info!(
                evicted = report.evicted,
                freed = report.freed_bytes,
                cached = report.cached_after,
                "eviction sweep"
            );
        }
        Ok(report)
    }

    /// Sweep and purge old DELETED records every `interval` until
    /// `shutdown` fires
    pub async fn run(self, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        warn!(error = %e, "eviction sweep failed");
                    }
                    if let Err(e) = self.state.purge_deleted(self.deleted_retention).await {
                        warn!(error = %e, "failed to purge deleted records");
                    }
                }
            }
        }
        debug!("eviction sweeper stopped");
    }
}
