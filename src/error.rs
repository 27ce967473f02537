//! Error types for the inbox agent.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),
}

impl Error {
    /// Whether the caller may retry the same operation later.
    ///
    /// Transient oracle/provider failures and lost checkpoint races are
    /// retryable; persisted state only ever reflects completed transitions.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Llm(e) => e.is_retryable(),
            Self::Provider(e) => e.is_retryable(),
            Self::Database(DatabaseError::VersionConflict { .. }) => true,
            _ => false,
        }
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Version conflict on {entity} {id}: expected version {expected}")]
    VersionConflict {
        entity: String,
        id: String,
        expected: i64,
    },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Database is closed")]
    Closed,
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Provider {provider} rejected the request: {reason}")]
    Rejected { provider: String, reason: String },

    #[error("Context length exceeded: {used} tokens used, {limit} allowed")]
    ContextLengthExceeded { used: usize, limit: usize },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LlmError {
    /// Timeouts, overloads and quota errors are transient.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RequestFailed { .. } | Self::RateLimited { .. })
    }
}

/// Tool execution errors.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Tool {name} not found")]
    NotFound { name: String },

    #[error("Tool execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),
}

/// Mailbox / calendar provider errors.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("Credentials expired for user {user_id}")]
    AuthExpired { user_id: String },

    #[error("Rate limited by provider, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Provider request failed: {0}")]
    Failed(String),
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Failed(_))
    }
}

/// Workflow engine errors surfaced to the caller.
///
/// Contract violations by the oracle or a human decision are not errors:
/// they mark the thread failed and come back as an outcome.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("Thread {id} not found")]
    ThreadNotFound { id: String },

    #[error("Thread {id} is {status}, not suspended")]
    NotSuspended { id: String, status: String },

    #[error("Decision answers request {given}, but thread {id} is waiting on {live}")]
    StaleRequest {
        id: String,
        given: String,
        live: String,
    },

    #[error("Thread {id} is reviewing '{action}'; the decision must name its request_id")]
    MissingRequestId { id: String, action: String },

    #[error("Corrupt checkpoint for thread {id}: {reason}")]
    CorruptCheckpoint { id: String, reason: String },
}

/// Result type alias for the agent.
pub type Result<T> = std::result::Result<T, Error>;
