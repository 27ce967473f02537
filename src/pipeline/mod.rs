//! Inbound email handling: types, prompts and intake.

pub mod intake;
pub mod prompts;
pub mod types;

pub use intake::{IntakeReport, process_unread};
pub use types::{Classification, EmailInput, TriageResult};
