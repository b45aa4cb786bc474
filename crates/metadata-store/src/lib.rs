//! Durable item metadata for the cirrus sync engine
//!
//! This crate owns the SQLite schema that records, for every filesystem
//! entry, where its content lives (remote only, local, being transferred)
//! and what went wrong last. It knows nothing about the transition rules:
//! the engine's state manager is the only writer and composes the
//! connection-level primitives in [`models::item`] inside its own
//! transactions.
//!
//! # Example
//!
//! ```rust,no_run
//! use metadata_store::Database;
//!
//! # async fn example() -> Result<(), metadata_store::StoreError> {
//! let db = Database::new("/tmp/cirrus/metadata.db").await?;
//! if let Some(item) = db.get_item("01ABCDEF").await? {
//!     println!("{} is {}", item.name, item.state);
//! }
//! # Ok(())
//! # }
//! ```

mod database;
mod error;
pub mod models;
pub mod types;

pub use database::Database;
pub use error::{Result, StoreError};
pub use models::{HydrationInfo, ItemRecord, UploadCheckpoint};
pub use types::ItemState;
