//! Learned preference memory.

pub mod preferences;

pub use preferences::{PREFERENCE_KEY, PreferenceKind, PreferenceStore};
