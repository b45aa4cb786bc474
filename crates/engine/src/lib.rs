//! Cirrus sync engine
//!
//! Keeps the local view of a cloud drive consistent with the remote. Every
//! entry is tracked by one record in the metadata store whose lifecycle
//! state says where its content lives:
//!
//! - `GHOST`: metadata only, content on the remote
//! - `HYDRATING`: a transfer is in flight
//! - `HYDRATED`: content cached locally, in sync
//! - `DIRTY_LOCAL`: local edits waiting for upload
//! - `CONFLICT`: local and remote both changed
//! - `ERROR`: the last transfer failed
//! - `DELETED`: tombstone awaiting purge
//!
//! The [`state::StateManager`] is the only writer of those records. The
//! hydration engine, upload manager, eviction sweeper, conflict reconciler
//! and delta ingestor all go through it, and [`SyncEngine`] ties them
//! together behind the operations a filesystem front end needs.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use engine::remote::MemoryRemote;
//! use engine::{EngineConfig, SyncEngine};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let remote = Arc::new(MemoryRemote::new());
//! let engine = SyncEngine::open(EngineConfig::for_dir("/tmp/cirrus"), remote).await?;
//! engine.start();
//!
//! let content = engine.read("01ABCDEF").await?;
//! let bytes = content.read_all().await?;
//! println!("read {} bytes", bytes.len());
//!
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod conflict;
pub mod delta;
mod engine;
pub mod error;
pub mod events;
pub mod eviction;
pub mod hydration;
pub mod jobs;
pub mod logging;
pub mod remote;
pub mod retry;
pub mod state;
pub mod upload;

pub use config::EngineConfig;
pub use engine::{RedriveReport, SyncEngine};
pub use error::{
    AccessError, ConfigError, EngineError, EvictionError, HydrationError, StateError, UploadError,
};
pub use events::{EngineEvent, StateChange};
pub use metadata_store::{ItemRecord, ItemState};
