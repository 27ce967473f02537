//! Configuration types.

use std::path::PathBuf;

use crate::error::ConfigError;
use crate::pipeline::prompts::DEFAULT_BACKGROUND;

/// Default ceiling on decide → approve iterations per thread.
const DEFAULT_MAX_ITERATIONS: u32 = 12;

/// Workflow engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum number of Decide steps a single thread may take before it is
    /// failed (guards against an oracle that never selects `done`).
    pub max_iterations: u32,
    /// Background profile of the mailbox owner, injected into every prompt.
    pub background: String,
    /// Assistant name used as the first element of preference namespaces.
    pub assistant: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            background: DEFAULT_BACKGROUND.to_string(),
            assistant: "email_assistant".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(raw) = std::env::var("INBOX_AGENT_MAX_ITERATIONS") {
            config.max_iterations = parse_positive("INBOX_AGENT_MAX_ITERATIONS", &raw)?;
        }
        if let Ok(background) = std::env::var("INBOX_AGENT_BACKGROUND")
            && !background.trim().is_empty()
        {
            config.background = background;
        }
        if let Ok(assistant) = std::env::var("INBOX_AGENT_ASSISTANT")
            && !assistant.trim().is_empty()
        {
            config.assistant = assistant;
        }

        Ok(config)
    }
}

/// Durable store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub db_path: PathBuf,
}

impl StoreConfig {
    pub fn from_env() -> Self {
        let db_path = std::env::var("INBOX_AGENT_DB_PATH")
            .unwrap_or_else(|_| "./data/inbox-agent.db".to_string());
        Self {
            db_path: PathBuf::from(db_path),
        }
    }
}

fn parse_positive(key: &str, raw: &str) -> Result<u32, ConfigError> {
    match raw.trim().parse::<u32>() {
        Ok(0) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "must be greater than zero".to_string(),
        }),
        Ok(n) => Ok(n),
        Err(e) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
    }
}
