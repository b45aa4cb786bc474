use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::types::ItemState;

/// Bookkeeping for the most recent hydration attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HydrationInfo {
    pub started_at: Option<OffsetDateTime>,
    pub completed_at: Option<OffsetDateTime>,
    pub worker_id: Option<Uuid>,
    pub error: Option<String>,
}

/// Position of an in-flight session upload, persisted after every
/// acknowledged chunk so a later attempt resumes instead of restarting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadCheckpoint {
    pub session: String,
    pub offset: u64,
    pub total: u64,
}

/// One filesystem entry as stored in the `items` table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRecord {
    pub id: String,
    pub parent_id: Option<String>,
    pub name: String,
    pub state: ItemState,
    /// Version of the content last synced into (or out of) the local cache
    pub etag: Option<String>,
    /// Latest version the remote has reported
    pub remote_etag: Option<String>,
    /// Version the pending local edit was made against
    pub base_etag: Option<String>,
    pub size: u64,
    pub modified_at: OffsetDateTime,
    pub created_at: OffsetDateTime,
    pub hydration: Option<HydrationInfo>,
    pub last_error: Option<String>,
    pub is_temporary_error: bool,
    pub is_virtual: bool,
    /// Local edits exist that the remote has not accepted yet
    pub local_changes: bool,
    pub local_revision: i64,
    pub upload: Option<UploadCheckpoint>,
    pub retry_count: u32,
    pub last_accessed_at: Option<OffsetDateTime>,
    pub state_changed_at: OffsetDateTime,
    /// Incremented on every committed mutation
    pub version: i64,
}

impl ItemRecord {
    /// A fresh record with every optional field empty.
    pub fn new(
        id: impl Into<String>,
        parent_id: Option<String>,
        name: impl Into<String>,
        state: ItemState,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            id: id.into(),
            parent_id,
            name: name.into(),
            state,
            etag: None,
            remote_etag: None,
            base_etag: None,
            size: 0,
            modified_at: now,
            created_at: now,
            hydration: None,
            last_error: None,
            is_temporary_error: false,
            is_virtual: false,
            local_changes: false,
            local_revision: 0,
            upload: None,
            retry_count: 0,
            last_accessed_at: None,
            state_changed_at: now,
            version: 0,
        }
    }

    /// Worker that owns the current hydration, if any.
    pub fn hydration_worker(&self) -> Option<Uuid> {
        self.hydration.as_ref().and_then(|h| h.worker_id)
    }

    /// Whether the remote is known to hold a newer version than the cache.
    pub fn is_stale(&self) -> bool {
        match (&self.etag, &self.remote_etag) {
            (Some(local), Some(remote)) => local != remote,
            _ => false,
        }
    }
}

const SELECT_ITEMS: &str = r#"
    SELECT
        id, parent_id, name, state, etag, remote_etag, base_etag, size,
        modified_at, created_at, hydration_started_at, hydration_completed_at,
        hydration_worker_id, hydration_error, last_error, is_temporary_error,
        is_virtual, local_changes, local_revision, upload_session,
        upload_offset, upload_total, retry_count, last_accessed_at,
        state_changed_at, version
    FROM items
"#;

impl Database {
    /// Get an item by ID
    pub async fn get_item(&self, id: &str) -> Result<Option<ItemRecord>> {
        let sql = format!("{SELECT_ITEMS} WHERE id = ?1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&**self)
            .await?;

        row.as_ref().map(row_to_item).transpose()
    }

    /// List every item, oldest first
    pub async fn list_items(&self) -> Result<Vec<ItemRecord>> {
        let sql = format!("{SELECT_ITEMS} ORDER BY created_at ASC, id ASC");
        let rows = sqlx::query(&sql).fetch_all(&**self).await?;
        rows.iter().map(row_to_item).collect()
    }

    /// List the live (not deleted) children of a directory entry
    pub async fn list_children(&self, parent_id: &str) -> Result<Vec<ItemRecord>> {
        let sql = format!("{SELECT_ITEMS} WHERE parent_id = ?1 AND state != 'deleted' ORDER BY name");
        let rows = sqlx::query(&sql)
            .bind(parent_id)
            .fetch_all(&**self)
            .await?;
        rows.iter().map(row_to_item).collect()
    }

    /// List every item currently in `state`
    pub async fn list_by_state(&self, state: ItemState) -> Result<Vec<ItemRecord>> {
        let sql = format!("{SELECT_ITEMS} WHERE state = ?1 ORDER BY state_changed_at ASC");
        let rows = sqlx::query(&sql)
            .bind(state)
            .fetch_all(&**self)
            .await?;
        rows.iter().map(row_to_item).collect()
    }

    /// Number of items per state, omitting empty states
    pub async fn count_by_state(&self) -> Result<Vec<(ItemState, u64)>> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS count FROM items GROUP BY state")
            .fetch_all(&**self)
            .await?;

        rows.iter()
            .map(|row| {
                let state: ItemState = row.try_get("state")?;
                let count: i64 = row.try_get("count")?;
                Ok((state, count as u64))
            })
            .collect()
    }

    /// Hydrated, non-virtual items, coldest first.
    ///
    /// Never-accessed items sort before everything else. Timestamps are
    /// stored in UTC so text order is time order.
    pub async fn eviction_candidates(&self, limit: u32) -> Result<Vec<ItemRecord>> {
        let sql = format!(
            "{SELECT_ITEMS} WHERE state = 'hydrated' AND is_virtual = 0 \
             ORDER BY last_accessed_at ASC, state_changed_at ASC LIMIT ?1"
        );
        let rows = sqlx::query(&sql)
            .bind(limit as i64)
            .fetch_all(&**self)
            .await?;
        rows.iter().map(row_to_item).collect()
    }

    /// Errored items whose failure was temporary and that have been retried
    /// fewer than `max_attempts` times
    pub async fn redrive_candidates(&self, max_attempts: u32) -> Result<Vec<ItemRecord>> {
        let sql = format!(
            "{SELECT_ITEMS} WHERE state = 'error' AND is_temporary_error = 1 \
             AND retry_count < ?1 ORDER BY state_changed_at ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(max_attempts as i64)
            .fetch_all(&**self)
            .await?;
        rows.iter().map(row_to_item).collect()
    }

    /// Total size of content held in the local cache
    pub async fn cached_bytes(&self) -> Result<u64> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(size), 0) AS total
            FROM items
            WHERE state IN ('hydrated', 'dirty_local', 'conflict') AND is_virtual = 0
            "#,
        )
        .fetch_one(&**self)
        .await?;
        let total: i64 = row.try_get("total")?;
        Ok(total as u64)
    }

    /// Record a read access; not a lifecycle change, so the version is kept
    pub async fn touch_item(&self, id: &str, at: OffsetDateTime) -> Result<bool> {
        let result = sqlx::query("UPDATE items SET last_accessed_at = ?1 WHERE id = ?2")
            .bind(at)
            .bind(id)
            .execute(&**self)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Drop deleted records whose deletion is older than `before`
    pub async fn purge_deleted(&self, before: OffsetDateTime) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM items WHERE state = 'deleted' AND state_changed_at < ?1")
                .bind(before)
                .execute(&**self)
                .await?;
        Ok(result.rows_affected())
    }
}

/// Read one item on a connection that is usually inside a transaction
pub async fn fetch_item(conn: &mut SqliteConnection, id: &str) -> Result<Option<ItemRecord>> {
    let sql = format!("{SELECT_ITEMS} WHERE id = ?1");
    let row = sqlx::query(&sql)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(row_to_item).transpose()
}

/// Insert a new item
pub async fn insert_item(conn: &mut SqliteConnection, item: &ItemRecord) -> Result<()> {
    let hydration = item.hydration.as_ref();
    let upload = item.upload.as_ref();

    sqlx::query(
        r#"
        INSERT INTO items (
            id, parent_id, name, state, etag, remote_etag, base_etag, size,
            modified_at, created_at, hydration_started_at, hydration_completed_at,
            hydration_worker_id, hydration_error, last_error, is_temporary_error,
            is_virtual, local_changes, local_revision, upload_session,
            upload_offset, upload_total, retry_count, last_accessed_at,
            state_changed_at, version
        )
        VALUES (
            ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
            ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26
        )
        "#,
    )
    .bind(&item.id)
    .bind(&item.parent_id)
    .bind(&item.name)
    .bind(item.state)
    .bind(&item.etag)
    .bind(&item.remote_etag)
    .bind(&item.base_etag)
    .bind(item.size as i64)
    .bind(item.modified_at)
    .bind(item.created_at)
    .bind(hydration.and_then(|h| h.started_at))
    .bind(hydration.and_then(|h| h.completed_at))
    .bind(hydration.and_then(|h| h.worker_id).map(|w| w.to_string()))
    .bind(hydration.and_then(|h| h.error.clone()))
    .bind(&item.last_error)
    .bind(item.is_temporary_error)
    .bind(item.is_virtual)
    .bind(item.local_changes)
    .bind(item.local_revision)
    .bind(upload.map(|u| u.session.clone()))
    .bind(upload.map(|u| u.offset as i64))
    .bind(upload.map(|u| u.total as i64))
    .bind(item.retry_count as i64)
    .bind(item.last_accessed_at)
    .bind(item.state_changed_at)
    .bind(item.version)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Overwrite every column of an existing item
pub async fn update_item(conn: &mut SqliteConnection, item: &ItemRecord) -> Result<bool> {
    let hydration = item.hydration.as_ref();
    let upload = item.upload.as_ref();

    let result = sqlx::query(
        r#"
        UPDATE items
        SET parent_id = ?2, name = ?3, state = ?4, etag = ?5, remote_etag = ?6,
            base_etag = ?7, size = ?8, modified_at = ?9,
            hydration_started_at = ?10, hydration_completed_at = ?11,
            hydration_worker_id = ?12, hydration_error = ?13,
            last_error = ?14, is_temporary_error = ?15, is_virtual = ?16,
            local_changes = ?17, local_revision = ?18, upload_session = ?19,
            upload_offset = ?20, upload_total = ?21, retry_count = ?22,
            last_accessed_at = ?23, state_changed_at = ?24, version = ?25
        WHERE id = ?1
        "#,
    )
    .bind(&item.id)
    .bind(&item.parent_id)
    .bind(&item.name)
    .bind(item.state)
    .bind(&item.etag)
    .bind(&item.remote_etag)
    .bind(&item.base_etag)
    .bind(item.size as i64)
    .bind(item.modified_at)
    .bind(hydration.and_then(|h| h.started_at))
    .bind(hydration.and_then(|h| h.completed_at))
    .bind(hydration.and_then(|h| h.worker_id).map(|w| w.to_string()))
    .bind(hydration.and_then(|h| h.error.clone()))
    .bind(&item.last_error)
    .bind(item.is_temporary_error)
    .bind(item.is_virtual)
    .bind(item.local_changes)
    .bind(item.local_revision)
    .bind(upload.map(|u| u.session.clone()))
    .bind(upload.map(|u| u.offset as i64))
    .bind(upload.map(|u| u.total as i64))
    .bind(item.retry_count as i64)
    .bind(item.last_accessed_at)
    .bind(item.state_changed_at)
    .bind(item.version)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() > 0)
}

fn row_to_item(row: &SqliteRow) -> Result<ItemRecord> {
    let id: String = row.try_get("id")?;

    let worker_id = match row.try_get::<Option<String>, _>("hydration_worker_id")? {
        Some(raw) => Some(Uuid::parse_str(&raw).map_err(|_| StoreError::Corrupt {
            id: id.clone(),
            column: "hydration_worker_id",
            value: raw.clone(),
        })?),
        None => None,
    };
    let started_at: Option<OffsetDateTime> = row.try_get("hydration_started_at")?;
    let completed_at: Option<OffsetDateTime> = row.try_get("hydration_completed_at")?;
    let hydration_error: Option<String> = row.try_get("hydration_error")?;

    let hydration = if started_at.is_some()
        || completed_at.is_some()
        || worker_id.is_some()
        || hydration_error.is_some()
    {
        Some(HydrationInfo {
            started_at,
            completed_at,
            worker_id,
            error: hydration_error,
        })
    } else {
        None
    };

    let upload = match (
        row.try_get::<Option<String>, _>("upload_session")?,
        row.try_get::<Option<i64>, _>("upload_offset")?,
        row.try_get::<Option<i64>, _>("upload_total")?,
    ) {
        (Some(session), Some(offset), Some(total)) => Some(UploadCheckpoint {
            session,
            offset: offset as u64,
            total: total as u64,
        }),
        _ => None,
    };

    Ok(ItemRecord {
        parent_id: row.try_get("parent_id")?,
        name: row.try_get("name")?,
        state: row.try_get("state")?,
        etag: row.try_get("etag")?,
        remote_etag: row.try_get("remote_etag")?,
        base_etag: row.try_get("base_etag")?,
        size: row.try_get::<i64, _>("size")? as u64,
        modified_at: row.try_get("modified_at")?,
        created_at: row.try_get("created_at")?,
        hydration,
        last_error: row.try_get("last_error")?,
        is_temporary_error: row.try_get::<i64, _>("is_temporary_error")? != 0,
        is_virtual: row.try_get::<i64, _>("is_virtual")? != 0,
        local_changes: row.try_get::<i64, _>("local_changes")? != 0,
        local_revision: row.try_get("local_revision")?,
        upload,
        retry_count: row.try_get::<i64, _>("retry_count")? as u32,
        last_accessed_at: row.try_get("last_accessed_at")?,
        state_changed_at: row.try_get("state_changed_at")?,
        version: row.try_get("version")?,
        id,
    })
}
