//! Checkpoint persistence and per-thread mutual exclusion.
//!
//! Every node transition writes the whole thread snapshot back under its id
//! with compare-and-swap on `version`. Start, resume and retry all take the
//! thread's lock first, so two calls for the same thread never interleave
//! inside one process; the version check catches writers in other processes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use chrono::Utc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::agent::thread::{ThreadStatus, WorkflowThread};
use crate::error::{DatabaseError, Error, WorkflowError};
use crate::store::{CheckpointWrite, Database};

type LockMap = Arc<StdMutex<HashMap<String, Arc<Mutex<()>>>>>;

/// Held while a call drives a thread. Dropping it releases the thread and
/// forgets its lock entry once nobody else is waiting on it.
pub struct ThreadLock {
    guard: Option<OwnedMutexGuard<()>>,
    thread_id: String,
    locks: LockMap,
}

impl Drop for ThreadLock {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = locks.get(&self.thread_id)
            && Arc::strong_count(entry) == 1
        {
            locks.remove(&self.thread_id);
        }
    }
}

/// Loads and stores thread snapshots.
pub struct CheckpointManager {
    db: Arc<dyn Database>,
    locks: LockMap,
}

impl CheckpointManager {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self {
            db,
            locks: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    pub fn database(&self) -> &Arc<dyn Database> {
        &self.db
    }

    /// Wait for exclusive use of a thread.
    pub async fn lock(&self, thread_id: &str) -> ThreadLock {
        let mutex = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(
                locks
                    .entry(thread_id.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };
        let guard = mutex.lock_owned().await;
        ThreadLock {
            guard: Some(guard),
            thread_id: thread_id.to_string(),
            locks: Arc::clone(&self.locks),
        }
    }

    /// Number of threads currently locked or waited on.
    pub fn active_locks(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Load a thread and the checkpoint version it was read at.
    pub async fn load(&self, thread_id: &str) -> Result<(WorkflowThread, i64), Error> {
        let record = self
            .db
            .load_checkpoint(thread_id)
            .await?
            .ok_or_else(|| WorkflowError::ThreadNotFound {
                id: thread_id.to_string(),
            })?;

        let thread: WorkflowThread =
            serde_json::from_str(&record.state).map_err(|e| WorkflowError::CorruptCheckpoint {
                id: thread_id.to_string(),
                reason: e.to_string(),
            })?;

        debug!(
            thread_id,
            version = record.version,
            status = %thread.status,
            node = thread.node.name(),
            "Checkpoint loaded"
        );
        Ok((thread, record.version))
    }

    /// Persist a snapshot. `version` is the version the thread was read at
    /// (0 for a thread never saved) and is advanced on success.
    pub async fn save(
        &self,
        thread: &mut WorkflowThread,
        version: &mut i64,
    ) -> Result<(), DatabaseError> {
        thread.updated_at = Utc::now();
        let state = serde_json::to_string(&*thread)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        let write = CheckpointWrite {
            thread_id: &thread.id,
            user_id: &thread.user_id,
            item_id: &thread.email_input.id,
            status: thread.status.as_str(),
            state: &state,
        };
        let new_version = self.db.save_checkpoint(write, *version).await?;

        debug!(
            thread_id = %thread.id,
            version = new_version,
            status = %thread.status,
            node = thread.node.name(),
            "Checkpoint saved"
        );
        *version = new_version;
        Ok(())
    }

    /// Thread already handling a given source item.
    pub async fn find_by_item(
        &self,
        user_id: &str,
        item_id: &str,
    ) -> Result<Option<String>, DatabaseError> {
        self.db.find_thread_by_item(user_id, item_id).await
    }

    /// All threads in `status`, oldest first. Unreadable snapshots are skipped.
    pub async fn list_by_status(
        &self,
        status: ThreadStatus,
    ) -> Result<Vec<WorkflowThread>, DatabaseError> {
        let records = self.db.list_checkpoints_by_status(status.as_str()).await?;

        let mut threads = Vec::with_capacity(records.len());
        for record in records {
            match serde_json::from_str::<WorkflowThread>(&record.state) {
                Ok(thread) => threads.push(thread),
                Err(e) => warn!(
                    thread_id = %record.thread_id,
                    error = %e,
                    "Skipping unreadable checkpoint"
                ),
            }
        }
        Ok(threads)
    }
}
