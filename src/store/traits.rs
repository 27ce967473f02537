//! Unified `Database` trait: single async interface for all persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DatabaseError;

/// A persisted workflow checkpoint.
#[derive(Debug, Clone)]
pub struct CheckpointRecord {
    pub thread_id: String,
    pub user_id: String,
    pub item_id: String,
    /// Thread status label, duplicated out of `state` for indexed lookups.
    pub status: String,
    /// Serialized thread snapshot (JSON).
    pub state: String,
    /// Incremented on every write; starts at 1.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Checkpoint contents to write.
#[derive(Debug, Clone, Copy)]
pub struct CheckpointWrite<'a> {
    pub thread_id: &'a str,
    pub user_id: &'a str,
    pub item_id: &'a str,
    pub status: &'a str,
    pub state: &'a str,
}

/// A stored preference profile.
#[derive(Debug, Clone)]
pub struct PreferenceRecord {
    pub namespace: String,
    pub key: String,
    pub value: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Backend-agnostic database trait covering checkpoints and preferences.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Checkpoints ─────────────────────────────────────────────────

    /// Write a checkpoint with compare-and-swap on `version`.
    ///
    /// `expected_version == 0` inserts a new row. Otherwise the row is only
    /// replaced if its stored version still equals `expected_version`.
    /// Returns the new version. A lost race yields
    /// `DatabaseError::VersionConflict`; a second thread for the same
    /// `(user_id, item_id)` yields `DatabaseError::Constraint`.
    async fn save_checkpoint(
        &self,
        checkpoint: CheckpointWrite<'_>,
        expected_version: i64,
    ) -> Result<i64, DatabaseError>;

    /// Latest checkpoint for a thread.
    async fn load_checkpoint(
        &self,
        thread_id: &str,
    ) -> Result<Option<CheckpointRecord>, DatabaseError>;

    /// Thread id already handling a given source item, if any.
    async fn find_thread_by_item(
        &self,
        user_id: &str,
        item_id: &str,
    ) -> Result<Option<String>, DatabaseError>;

    /// All checkpoints whose thread is in `status`, oldest first.
    async fn list_checkpoints_by_status(
        &self,
        status: &str,
    ) -> Result<Vec<CheckpointRecord>, DatabaseError>;

    // ── Preferences ─────────────────────────────────────────────────

    async fn get_preference(
        &self,
        namespace: &str,
        key: &str,
    ) -> Result<Option<PreferenceRecord>, DatabaseError>;

    /// Insert unless a row exists. Returns whether this call inserted it.
    async fn insert_preference_if_absent(
        &self,
        namespace: &str,
        key: &str,
        value: &str,
    ) -> Result<bool, DatabaseError>;

    /// Insert or replace the value.
    async fn put_preference(
        &self,
        namespace: &str,
        key: &str,
        value: &str,
    ) -> Result<(), DatabaseError>;

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Stop accepting calls. Later calls fail with `DatabaseError::Closed`.
    async fn close(&self) -> Result<(), DatabaseError>;
}
