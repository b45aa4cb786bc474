//! SQLite database holding one record per filesystem entry.
//!
//! The pool runs in WAL mode so readers never wait on a writer. Writers go
//! through [`Database::begin_immediate`], which takes the write lock up front:
//! two transactions that each read a record and then update it would
//! otherwise race on the lock upgrade and fail instead of queueing.

use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Sqlite, Transaction};
use tracing::info;
use url::Url;

use crate::error::{Result, StoreError};

/// How long a writer waits for the database lock before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// Database connection pool for item metadata.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl std::ops::Deref for Database {
    type Target = SqlitePool;

    fn deref(&self) -> &Self::Target {
        &self.pool
    }
}

impl Database {
    /// Open (or create) a file-based database and run migrations.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Migration(format!("Failed to create database directory: {}", e))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.run_migrations().await?;

        info!("Metadata database initialized at {:?}", path);
        Ok(db)
    }

    /// Create a new in-memory database.
    ///
    /// Every pooled connection to `:memory:` would see its own empty
    /// database, so the pool is pinned to one connection that is never
    /// recycled.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.run_migrations().await?;

        info!("Metadata database initialized in-memory");
        Ok(db)
    }

    /// Connect using a `sqlite://` URL; `sqlite::memory:` selects the
    /// in-memory database.
    pub async fn connect(url: &Url) -> Result<Self> {
        if url.as_str() == "sqlite::memory:" {
            return Self::in_memory().await;
        }
        match url.to_file_path() {
            Ok(path) => Self::new(path).await,
            // sqlite://relative/path is not a file URL
            Err(()) => Self::new(url.as_str().trim_start_matches("sqlite://")).await,
        }
    }

    /// Start a write transaction holding the database write lock.
    pub async fn begin_immediate(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin_with("BEGIN IMMEDIATE").await?)
    }

    /// Close every pooled connection, flushing the WAL.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Run database migrations.
    pub(crate) async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS items (
                id TEXT PRIMARY KEY,
                parent_id TEXT,
                name TEXT NOT NULL,
                state TEXT NOT NULL CHECK (state IN (
                    'ghost', 'hydrating', 'hydrated', 'dirty_local',
                    'conflict', 'error', 'deleted'
                )),
                etag TEXT,
                remote_etag TEXT,
                base_etag TEXT,
                size INTEGER NOT NULL DEFAULT 0,
                modified_at TEXT NOT NULL,
                created_at TEXT NOT NULL,
                hydration_started_at TEXT,
                hydration_completed_at TEXT,
                hydration_worker_id TEXT,
                hydration_error TEXT,
                last_error TEXT,
                is_temporary_error INTEGER NOT NULL DEFAULT 0,
                is_virtual INTEGER NOT NULL DEFAULT 0,
                local_changes INTEGER NOT NULL DEFAULT 0,
                local_revision INTEGER NOT NULL DEFAULT 0,
                upload_session TEXT,
                upload_offset INTEGER,
                upload_total INTEGER,
                retry_count INTEGER NOT NULL DEFAULT 0,
                last_accessed_at TEXT,
                state_changed_at TEXT NOT NULL,
                version INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_items_parent ON items(parent_id)")
            .execute(&self.pool)
            .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_items_state ON items(state)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
