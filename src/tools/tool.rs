//! The `Tool` trait and its output type.

use std::time::Duration;

use async_trait::async_trait;

use crate::context::ToolContext;
use crate::memory::PreferenceKind;

pub use crate::error::ToolError;

/// Result of a successful tool invocation.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub result: serde_json::Value,
    pub duration: Duration,
}

impl ToolOutput {
    pub fn success(result: serde_json::Value, duration: Duration) -> Self {
        Self { result, duration }
    }

    pub fn text(text: impl Into<String>, duration: Duration) -> Self {
        Self {
            result: serde_json::Value::String(text.into()),
            duration,
        }
    }

    /// Content for the tool-result message appended to the thread.
    pub fn to_message_content(&self) -> String {
        match &self.result {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// A capability the decide step can select.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema of the parameters object.
    fn parameters_schema(&self) -> serde_json::Value;

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError>;

    /// Whether a human must approve the call before it runs.
    fn requires_approval(&self) -> bool {
        false
    }

    /// Whether a reviewer may accept or edit the call, as opposed to only
    /// answering it with feedback.
    fn accepts_edits(&self) -> bool {
        true
    }

    /// Preference profile that learns from human feedback on this tool.
    fn preference_kind(&self) -> Option<PreferenceKind> {
        None
    }
}

/// Extract a required string parameter.
pub fn require_str<'a>(params: &'a serde_json::Value, key: &str) -> Result<&'a str, ToolError> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolError::InvalidParameters(format!("missing required parameter '{key}'")))
}

/// Deserialize the whole parameter object into `T`.
pub fn parse_params<T: serde::de::DeserializeOwned>(
    params: serde_json::Value,
) -> Result<T, ToolError> {
    serde_json::from_value(params).map_err(|e| ToolError::InvalidParameters(e.to_string()))
}
