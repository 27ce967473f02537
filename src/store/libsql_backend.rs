//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info, warn};

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{CheckpointRecord, CheckpointWrite, Database, PreferenceRecord};

const CHECKPOINT_COLUMNS: &str =
    "thread_id, user_id, item_id, status, state, version, created_at, updated_at";

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    _db: Arc<LibSqlDatabase>,
    conn: Connection,
    closed: AtomicBool,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            _db: Arc::new(db),
            conn,
            closed: AtomicBool::new(false),
        })
    }

    /// Get the connection, failing once the store is closed.
    fn conn(&self) -> Result<&Connection, DatabaseError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DatabaseError::Closed);
        }
        Ok(&self.conn)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn row_to_checkpoint(row: &libsql::Row) -> Result<CheckpointRecord, libsql::Error> {
    Ok(CheckpointRecord {
        thread_id: row.get(0)?,
        user_id: row.get(1)?,
        item_id: row.get(2)?,
        status: row.get(3)?,
        state: row.get(4)?,
        version: row.get(5)?,
        created_at: parse_datetime(&row.get::<String>(6)?),
        updated_at: parse_datetime(&row.get::<String>(7)?),
    })
}

fn row_to_preference(row: &libsql::Row) -> Result<PreferenceRecord, libsql::Error> {
    Ok(PreferenceRecord {
        namespace: row.get(0)?,
        key: row.get(1)?,
        value: row.get(2)?,
        created_at: parse_datetime(&row.get::<String>(3)?),
        updated_at: parse_datetime(&row.get::<String>(4)?),
    })
}

fn is_unique_violation(e: &libsql::Error) -> bool {
    e.to_string().contains("UNIQUE constraint failed")
}

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()?).await
    }

    // ── Checkpoints ─────────────────────────────────────────────────

    async fn save_checkpoint(
        &self,
        cp: CheckpointWrite<'_>,
        expected_version: i64,
    ) -> Result<i64, DatabaseError> {
        let conn = self.conn()?;
        let now = Utc::now().to_rfc3339();

        if expected_version == 0 {
            let inserted = conn
                .execute(
                    "INSERT INTO checkpoints
                        (thread_id, user_id, item_id, status, state, version, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?6)",
                    params![cp.thread_id, cp.user_id, cp.item_id, cp.status, cp.state, now],
                )
                .await;
            return match inserted {
                Ok(_) => {
                    debug!(thread_id = cp.thread_id, status = cp.status, version = 1, "Checkpoint created");
                    Ok(1)
                }
                Err(e) if is_unique_violation(&e) && e.to_string().contains("item_id") => {
                    Err(DatabaseError::Constraint(format!(
                        "item {} already has a thread",
                        cp.item_id
                    )))
                }
                Err(e) if is_unique_violation(&e) => Err(DatabaseError::VersionConflict {
                    entity: "checkpoint".to_string(),
                    id: cp.thread_id.to_string(),
                    expected: 0,
                }),
                Err(e) => Err(DatabaseError::Query(format!("save_checkpoint insert: {e}"))),
            };
        }

        let updated = conn
            .execute(
                "UPDATE checkpoints
                 SET status = ?1, state = ?2, version = version + 1, updated_at = ?3
                 WHERE thread_id = ?4 AND version = ?5",
                params![cp.status, cp.state, now, cp.thread_id, expected_version],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_checkpoint update: {e}")))?;

        if updated == 0 {
            warn!(
                thread_id = cp.thread_id,
                expected = expected_version,
                "Checkpoint version conflict"
            );
            return Err(DatabaseError::VersionConflict {
                entity: "checkpoint".to_string(),
                id: cp.thread_id.to_string(),
                expected: expected_version,
            });
        }

        let version = expected_version + 1;
        debug!(thread_id = cp.thread_id, status = cp.status, version, "Checkpoint saved");
        Ok(version)
    }

    async fn load_checkpoint(
        &self,
        thread_id: &str,
    ) -> Result<Option<CheckpointRecord>, DatabaseError> {
        let conn = self.conn()?;
        let mut rows = conn
            .query(
                &format!("SELECT {CHECKPOINT_COLUMNS} FROM checkpoints WHERE thread_id = ?1"),
                params![thread_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("load_checkpoint: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_checkpoint(&row)
                .map(Some)
                .map_err(|e| DatabaseError::Query(format!("load_checkpoint row parse: {e}"))),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("load_checkpoint: {e}"))),
        }
    }

    async fn find_thread_by_item(
        &self,
        user_id: &str,
        item_id: &str,
    ) -> Result<Option<String>, DatabaseError> {
        let conn = self.conn()?;
        let mut rows = conn
            .query(
                "SELECT thread_id FROM checkpoints WHERE user_id = ?1 AND item_id = ?2",
                params![user_id, item_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_thread_by_item: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row
                .get::<String>(0)
                .map(Some)
                .map_err(|e| DatabaseError::Query(format!("find_thread_by_item row parse: {e}"))),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("find_thread_by_item: {e}"))),
        }
    }

    async fn list_checkpoints_by_status(
        &self,
        status: &str,
    ) -> Result<Vec<CheckpointRecord>, DatabaseError> {
        let conn = self.conn()?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {CHECKPOINT_COLUMNS} FROM checkpoints WHERE status = ?1 ORDER BY created_at ASC"
                ),
                params![status],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_checkpoints_by_status: {e}")))?;

        let mut records = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_checkpoints_by_status: {e}")))?
        {
            records.push(row_to_checkpoint(&row).map_err(|e| {
                DatabaseError::Query(format!("list_checkpoints_by_status row parse: {e}"))
            })?);
        }
        Ok(records)
    }

    // ── Preferences ─────────────────────────────────────────────────

    async fn get_preference(
        &self,
        namespace: &str,
        key: &str,
    ) -> Result<Option<PreferenceRecord>, DatabaseError> {
        let conn = self.conn()?;
        let mut rows = conn
            .query(
                "SELECT namespace, key, value, created_at, updated_at
                 FROM preferences WHERE namespace = ?1 AND key = ?2",
                params![namespace, key],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_preference: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_preference(&row)
                .map(Some)
                .map_err(|e| DatabaseError::Query(format!("get_preference row parse: {e}"))),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_preference: {e}"))),
        }
    }

    async fn insert_preference_if_absent(
        &self,
        namespace: &str,
        key: &str,
        value: &str,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn()?;
        let now = Utc::now().to_rfc3339();
        let inserted = conn
            .execute(
                "INSERT INTO preferences (namespace, key, value, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)
                 ON CONFLICT (namespace, key) DO NOTHING",
                params![namespace, key, value, now],
            )
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    DatabaseError::Constraint(format!("preference {namespace}/{key}: {e}"))
                } else {
                    DatabaseError::Query(format!("insert_preference_if_absent: {e}"))
                }
            })?;
        Ok(inserted > 0)
    }

    async fn put_preference(
        &self,
        namespace: &str,
        key: &str,
        value: &str,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn()?;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO preferences (namespace, key, value, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT (namespace, key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at",
            params![namespace, key, value, now],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("put_preference: {e}")))?;

        debug!(namespace, key, chars = value.len(), "Preference stored");
        Ok(())
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    async fn close(&self) -> Result<(), DatabaseError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Err(e) = self.conn.execute("PRAGMA optimize", ()).await {
            warn!(error = %e, "PRAGMA optimize failed on close");
        }
        info!("Database closed");
        Ok(())
    }
}
