//! Persistence layer: libSQL-backed storage for checkpoints and preferences.

pub mod libsql_backend;
mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{CheckpointRecord, CheckpointWrite, Database, PreferenceRecord};
