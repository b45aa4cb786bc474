#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use engine::delta::{DeltaChange, RemoteItem};
use engine::remote::MemoryRemote;
use engine::{EngineConfig, ItemRecord, ItemState, SyncEngine};
use tempfile::TempDir;

pub struct Harness {
    pub engine: SyncEngine,
    pub remote: Arc<MemoryRemote>,
    pub dir: TempDir,
}

/// Small chunks and fast retries so transfers take several calls
pub fn test_config(dir: &Path) -> EngineConfig {
    let mut config = EngineConfig::for_dir(dir);
    config.hydration.chunk_size = 4;
    config.hydration.progress_interval = 4;
    config.upload.small_threshold = 8;
    config.upload.chunk_size = 4;
    config.retry.max_attempts = 3;
    config.retry.base_delay_ms = 1;
    config.retry.max_delay_ms = 2;
    config.retry.jitter = false;
    config.retry.redrive_interval_secs = 3600;
    config.eviction.sweep_interval_secs = 3600;
    config
}

pub async fn setup() -> Harness {
    setup_with(|_| {}).await
}

pub async fn setup_with(tweak: impl FnOnce(&mut EngineConfig)) -> Harness {
    let dir = TempDir::new().unwrap();
    let remote = Arc::new(MemoryRemote::new());
    let mut config = test_config(dir.path());
    tweak(&mut config);
    let engine = SyncEngine::open(config, remote.clone()).await.unwrap();
    Harness {
        engine,
        remote,
        dir,
    }
}

impl Harness {
    /// Put `data` on the remote and announce it through a delta
    pub async fn publish(&self, id: &str, data: &[u8]) -> String {
        let etag = self.remote.insert(id, data.to_vec());
        self.engine
            .delta()
            .apply(vec![DeltaChange::Upsert(remote_item(id, &etag, data.len()))])
            .await;
        etag
    }

    pub async fn record(&self, id: &str) -> ItemRecord {
        self.engine.state().require(id).await.unwrap()
    }

    /// Poll until `id` reaches `state`, failing after a few seconds
    pub async fn wait_for(&self, id: &str, state: ItemState) -> ItemRecord {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let record = self.record(id).await;
            if record.state == state {
                return record;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "{id} stuck in {} waiting for {state}",
                record.state
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

pub fn remote_item(id: &str, etag: &str, size: usize) -> RemoteItem {
    RemoteItem {
        id: id.to_string(),
        parent_id: Some("root".to_string()),
        name: format!("{id}.bin"),
        etag: etag.to_string(),
        size: size as u64,
        modified_at: None,
        is_virtual: false,
    }
}
