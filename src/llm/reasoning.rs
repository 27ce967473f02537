//! Reasoning layer: the oracle the workflow consults.
//!
//! Wraps an `LlmProvider` with the three calls the engine needs:
//! classification, tool selection and preference rewriting.

use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::error::LlmError;
use crate::llm::provider::{
    ChatMessage, CompletionRequest, LlmProvider, ToolCall, ToolChoice, ToolCompletionRequest,
    ToolDefinition,
};
use crate::pipeline::types::TriageResult;

/// Name of the forced tool used for classification.
pub const ROUTE_TOOL: &str = "route_email";

const TRIAGE_MAX_TOKENS: u32 = 1024;
const DECIDE_MAX_TOKENS: u32 = 4096;
const REWRITE_MAX_TOKENS: u32 = 4096;

/// Token usage from an LLM call.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl TokenUsage {
    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}

/// Output of the decide step.
#[derive(Debug, Clone)]
pub struct ToolSelection {
    /// Text the model produced alongside its tool calls.
    pub content: Option<String>,
    /// Calls in the order the model emitted them.
    pub tool_calls: Vec<ToolCall>,
    pub usage: TokenUsage,
}

/// Reasoning layer that wraps an LLM provider.
pub struct Reasoning {
    llm: Arc<dyn LlmProvider>,
}

impl Reasoning {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm }
    }

    pub fn model_name(&self) -> &str {
        self.llm.model_name()
    }

    /// Classify an email.
    ///
    /// Prefers the forced `route_email` tool call; falls back to a JSON
    /// object in the text. An answer with no parseable payload at all is
    /// `LlmError::InvalidResponse`.
    pub async fn classify(
        &self,
        system_prompt: String,
        user_prompt: String,
    ) -> Result<TriageResult, LlmError> {
        let request = ToolCompletionRequest::new(
            vec![ChatMessage::system(system_prompt), ChatMessage::user(user_prompt)],
            vec![route_tool_definition()],
        )
        .with_tool_choice(ToolChoice::Tool(ROUTE_TOOL.to_string()))
        .with_temperature(0.0)
        .with_max_tokens(TRIAGE_MAX_TOKENS);

        let response = self.llm.complete_with_tools(request).await?;
        self.record_usage("classify", response.input_tokens, response.output_tokens);

        if let Some(call) = response.tool_calls.iter().find(|c| c.name == ROUTE_TOOL) {
            return serde_json::from_value(call.args.clone()).map_err(|e| {
                LlmError::InvalidResponse {
                    provider: self.llm.model_name().to_string(),
                    reason: format!("route_email arguments: {e}"),
                }
            });
        }

        let text = response.content.unwrap_or_default();
        let json = extract_json_object(&text);
        serde_json::from_str(&json).map_err(|e| LlmError::InvalidResponse {
            provider: self.llm.model_name().to_string(),
            reason: format!("no classification in response ({e}): {text}"),
        })
    }

    /// Ask the model to pick the next tool call.
    pub async fn select_tool(
        &self,
        system_prompt: String,
        history: &[ChatMessage],
        tools: Vec<ToolDefinition>,
    ) -> Result<ToolSelection, LlmError> {
        let mut messages = Vec::with_capacity(history.len() + 1);
        messages.push(ChatMessage::system(system_prompt));
        messages.extend_from_slice(history);

        let request = ToolCompletionRequest::new(messages, tools)
            .with_tool_choice(ToolChoice::Any)
            .with_temperature(0.0)
            .with_max_tokens(DECIDE_MAX_TOKENS);

        let response = self.llm.complete_with_tools(request).await?;
        self.record_usage("select_tool", response.input_tokens, response.output_tokens);

        Ok(ToolSelection {
            content: response.content,
            tool_calls: response.tool_calls,
            usage: TokenUsage {
                input_tokens: response.input_tokens,
                output_tokens: response.output_tokens,
            },
        })
    }

    /// Produce a rewritten preference profile from feedback messages.
    ///
    /// Returns the model's full text with any `<profile>` wrapper removed.
    pub async fn rewrite_preferences(
        &self,
        system_prompt: String,
        feedback: Vec<ChatMessage>,
    ) -> Result<String, LlmError> {
        let mut messages = Vec::with_capacity(feedback.len() + 1);
        messages.push(ChatMessage::system(system_prompt));
        messages.extend(feedback);

        let request = CompletionRequest::new(messages)
            .with_temperature(0.0)
            .with_max_tokens(REWRITE_MAX_TOKENS);

        let response = self.llm.complete(request).await?;
        self.record_usage("rewrite_preferences", response.input_tokens, response.output_tokens);

        Ok(strip_profile_tags(&response.content))
    }

    fn record_usage(&self, op: &'static str, input_tokens: u32, output_tokens: u32) {
        let (input_rate, output_rate) = self.llm.cost_per_token();
        let cost = input_rate * Decimal::from(input_tokens) + output_rate * Decimal::from(output_tokens);
        debug!(
            op,
            model = %self.llm.model_name(),
            input_tokens,
            output_tokens,
            cost_usd = %cost.round_dp(6),
            "LLM usage"
        );
    }
}

/// Log a classification's reasoning. Reasoning is never persisted.
pub fn log_reasoning(thread_id: &str, result: &TriageResult) {
    info!(
        thread_id,
        classification = %result.classification,
        reasoning = %result.reasoning,
        "Classifier reasoning"
    );
}

fn route_tool_definition() -> ToolDefinition {
    ToolDefinition {
        name: ROUTE_TOOL.to_string(),
        description: "Analyze the unread email and route it according to its content.".to_string(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "reasoning": {
                    "type": "string",
                    "description": "Step-by-step reasoning behind the classification."
                },
                "classification": {
                    "type": "string",
                    "enum": ["ignore", "respond", "notify"],
                    "description": "'ignore' for irrelevant emails, 'notify' for important information that needs no reply, 'respond' for emails that need a reply."
                }
            },
            "required": ["reasoning", "classification"]
        }),
    }
}

fn strip_profile_tags(text: &str) -> String {
    let trimmed = text.trim();
    if let Some(start) = trimmed.find("<profile>")
        && let Some(end) = trimmed.rfind("</profile>")
        && end > start
    {
        return trimmed[start + "<profile>".len()..end].trim().to_string();
    }
    trimmed.to_string()
}

/// Extract a JSON object from LLM output (handles markdown wrapping).
pub fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('{') {
                return inner.to_string();
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::llm::provider::{
        CompletionResponse, FinishReason, ToolCompletionRequest, ToolCompletionResponse,
    };
    use crate::pipeline::types::Classification;

    /// Returns canned responses and records the last tool request.
    struct Canned {
        tool_response: ToolCompletionResponse,
        text: String,
        last_choice: Mutex<Option<ToolChoice>>,
    }

    impl Canned {
        fn tool(content: Option<&str>, tool_calls: Vec<ToolCall>) -> Self {
            Self {
                tool_response: ToolCompletionResponse {
                    content: content.map(String::from),
                    tool_calls,
                    input_tokens: 100,
                    output_tokens: 20,
                    finish_reason: FinishReason::ToolUse,
                    response_id: None,
                },
                text: String::new(),
                last_choice: Mutex::new(None),
            }
        }

        fn text(text: &str) -> Self {
            let mut canned = Self::tool(None, vec![]);
            canned.text = text.to_string();
            canned
        }
    }

    #[async_trait]
    impl LlmProvider for Canned {
        fn model_name(&self) -> &str {
            "canned"
        }

        fn cost_per_token(&self) -> (Decimal, Decimal) {
            (Decimal::new(3, 6), Decimal::new(15, 6))
        }

        async fn complete(
            &self,
            _request: CompletionRequest,
        ) -> Result<CompletionResponse, LlmError> {
            Ok(CompletionResponse {
                content: self.text.clone(),
                input_tokens: 10,
                output_tokens: 10,
                finish_reason: FinishReason::Stop,
                response_id: None,
            })
        }

        async fn complete_with_tools(
            &self,
            request: ToolCompletionRequest,
        ) -> Result<ToolCompletionResponse, LlmError> {
            *self.last_choice.lock().unwrap() = Some(request.tool_choice.clone());
            Ok(self.tool_response.clone())
        }
    }

    #[tokio::test]
    async fn classify_reads_forced_tool_call() {
        let llm = Arc::new(Canned::tool(
            None,
            vec![ToolCall {
                id: "t1".into(),
                name: ROUTE_TOOL.into(),
                args: serde_json::json!({"reasoning": "direct question", "classification": "respond"}),
            }],
        ));
        let reasoning = Reasoning::new(llm.clone());
        let result = reasoning.classify("sys".into(), "user".into()).await.unwrap();
        assert_eq!(result.parse().unwrap(), Classification::Respond);
        assert_eq!(
            *llm.last_choice.lock().unwrap(),
            Some(ToolChoice::Tool(ROUTE_TOOL.into()))
        );
    }

    #[tokio::test]
    async fn classify_falls_back_to_text_json() {
        let llm = Arc::new(Canned::tool(
            Some("Sure:\n```json\n{\"reasoning\": \"newsletter\", \"classification\": \"ignore\"}\n```"),
            vec![],
        ));
        let result = Reasoning::new(llm).classify("s".into(), "u".into()).await.unwrap();
        assert_eq!(result.parse().unwrap(), Classification::Ignore);
    }

    #[tokio::test]
    async fn classify_without_payload_is_invalid_response() {
        let llm = Arc::new(Canned::tool(Some("I am not sure."), vec![]));
        let err = Reasoning::new(llm).classify("s".into(), "u".into()).await.unwrap_err();
        assert!(matches!(err, LlmError::InvalidResponse { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn select_tool_forces_a_call() {
        let llm = Arc::new(Canned::tool(
            None,
            vec![ToolCall {
                id: "c1".into(),
                name: "done".into(),
                args: serde_json::json!({}),
            }],
        ));
        let selection = Reasoning::new(llm.clone())
            .select_tool("sys".into(), &[ChatMessage::user("go")], vec![])
            .await
            .unwrap();
        assert_eq!(selection.tool_calls.len(), 1);
        assert_eq!(selection.usage.total(), 120);
        assert_eq!(*llm.last_choice.lock().unwrap(), Some(ToolChoice::Any));
    }

    #[tokio::test]
    async fn rewrite_strips_profile_wrapper() {
        let llm = Arc::new(Canned::text("<profile>\nIGNORE:\n- ads\n</profile>"));
        let out = Reasoning::new(llm)
            .rewrite_preferences("sys".into(), vec![ChatMessage::user("ignore ads")])
            .await
            .unwrap();
        assert_eq!(out, "IGNORE:\n- ads");
    }

    #[test]
    fn extract_json_variants() {
        assert_eq!(extract_json_object(r#"{"a":1}"#), r#"{"a":1}"#);
        assert_eq!(
            extract_json_object("text ```json\n{\"a\":1}\n``` more"),
            r#"{"a":1}"#
        );
        assert_eq!(extract_json_object("x {\"a\":1} y"), r#"{"a":1}"#);
        assert_eq!(extract_json_object("no json"), "no json");
    }

    #[test]
    fn strip_profile_tags_passthrough() {
        assert_eq!(strip_profile_tags("  plain text \n"), "plain text");
    }
}
