//! Bridges rig-core's `CompletionModel` to our `LlmProvider` trait.
//!
//! rig owns the HTTP transport and the provider wire format. This module
//! only converts messages, tool definitions and errors between the two.

use async_trait::async_trait;
use rig::OneOrMany;
use rig::completion::{self, CompletionError, CompletionModel};
use rig::message::{
    AssistantContent, Message, ToolChoice as RigToolChoice, ToolResultContent, UserContent,
};
use rust_decimal::Decimal;
use tracing::debug;

use crate::error::LlmError;
use crate::llm::costs;
use crate::llm::provider::{
    ChatMessage, CompletionRequest, CompletionResponse, FinishReason, LlmProvider, ToolCall,
    ToolChoice, ToolCompletionRequest, ToolCompletionResponse, ToolDefinition,
};

const PROVIDER: &str = "anthropic";
const DEFAULT_MAX_TOKENS: u32 = 2048;

/// `LlmProvider` over any rig completion model.
pub struct RigAdapter<M: CompletionModel> {
    model: M,
    model_name: String,
}

impl<M: CompletionModel> RigAdapter<M> {
    pub fn new(model: M, model_name: &str) -> Self {
        Self {
            model,
            model_name: model_name.to_string(),
        }
    }

    async fn send(
        &self,
        messages: &[ChatMessage],
        tools: Vec<completion::ToolDefinition>,
        tool_choice: Option<RigToolChoice>,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
    ) -> Result<(Option<String>, Vec<ToolCall>, u32, u32), LlmError> {
        let (preamble, mut history) = to_rig_messages(messages);
        let prompt = history.pop().ok_or_else(|| LlmError::Rejected {
            provider: PROVIDER.to_string(),
            reason: "request carries no user or assistant message".to_string(),
        })?;

        let mut builder = self
            .model
            .completion_request(prompt)
            .messages(history)
            .tools(tools)
            .max_tokens(u64::from(max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)));
        if let Some(preamble) = preamble {
            builder = builder.preamble(preamble);
        }
        if let Some(temperature) = temperature {
            builder = builder.temperature(f64::from(temperature));
        }
        if let Some(choice) = tool_choice {
            builder = builder.tool_choice(choice);
        }

        let response = self
            .model
            .completion(builder.build())
            .await
            .map_err(|e| map_completion_error(PROVIDER, e))?;

        let (content, calls) = split_choice(response.choice);
        Ok((
            content,
            calls,
            saturating_u32(response.usage.input_tokens),
            saturating_u32(response.usage.output_tokens),
        ))
    }
}

#[async_trait]
impl<M> LlmProvider for RigAdapter<M>
where
    M: CompletionModel + 'static,
{
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn cost_per_token(&self) -> (Decimal, Decimal) {
        costs::model_cost(&self.model_name)
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let (content, _, input_tokens, output_tokens) = self
            .send(
                &request.messages,
                Vec::new(),
                None,
                request.max_tokens,
                request.temperature,
            )
            .await?;
        debug!(model = %self.model_name, "Completion received");

        Ok(CompletionResponse {
            content: content.unwrap_or_default(),
            input_tokens,
            output_tokens,
            finish_reason: FinishReason::Stop,
            response_id: None,
        })
    }

    async fn complete_with_tools(
        &self,
        request: ToolCompletionRequest,
    ) -> Result<ToolCompletionResponse, LlmError> {
        let tools: Vec<completion::ToolDefinition> =
            request.tools.iter().map(to_rig_tool).collect();
        let tool_choice = (!tools.is_empty()).then(|| to_rig_tool_choice(&request.tool_choice));

        let (content, tool_calls, input_tokens, output_tokens) = self
            .send(
                &request.messages,
                tools,
                tool_choice,
                request.max_tokens,
                request.temperature,
            )
            .await?;
        debug!(
            model = %self.model_name,
            tool_calls = tool_calls.len(),
            "Tool completion received"
        );

        let finish_reason = if tool_calls.is_empty() {
            FinishReason::Stop
        } else {
            FinishReason::ToolUse
        };
        Ok(ToolCompletionResponse {
            content,
            tool_calls,
            input_tokens,
            output_tokens,
            finish_reason,
            response_id: None,
        })
    }
}

// ── Conversions ─────────────────────────────────────────────────────

/// Split out the system preamble and convert the rest to rig messages.
///
/// Consecutive tool results are folded into one user turn so every result
/// for an assistant turn travels together.
fn to_rig_messages(messages: &[ChatMessage]) -> (Option<String>, Vec<Message>) {
    let mut system_parts: Vec<&str> = Vec::new();
    let mut history: Vec<Message> = Vec::new();
    let mut results: Vec<UserContent> = Vec::new();

    for msg in messages {
        if !matches!(msg, ChatMessage::Tool { .. }) {
            flush_results(&mut results, &mut history);
        }
        match msg {
            ChatMessage::System { content } => system_parts.push(content),
            ChatMessage::User { content } => history.push(Message::user(content.clone())),
            ChatMessage::Assistant {
                content,
                tool_calls,
            } => {
                let mut blocks = Vec::with_capacity(tool_calls.len() + 1);
                if let Some(text) = content
                    && !text.is_empty()
                {
                    blocks.push(AssistantContent::text(text.clone()));
                }
                for call in tool_calls {
                    blocks.push(AssistantContent::tool_call(
                        call.id.clone(),
                        call.name.clone(),
                        call.args.clone(),
                    ));
                }
                if let Ok(content) = OneOrMany::many(blocks) {
                    history.push(Message::Assistant { id: None, content });
                }
            }
            ChatMessage::Tool {
                tool_call_id,
                content,
                is_error,
                ..
            } => {
                let text = if *is_error && !content.starts_with("Error") {
                    format!("Error: {content}")
                } else {
                    content.clone()
                };
                results.push(UserContent::tool_result(
                    tool_call_id.clone(),
                    OneOrMany::one(ToolResultContent::text(text)),
                ));
            }
        }
    }
    flush_results(&mut results, &mut history);

    let preamble = (!system_parts.is_empty()).then(|| system_parts.join("\n\n"));
    (preamble, history)
}

fn flush_results(results: &mut Vec<UserContent>, history: &mut Vec<Message>) {
    if let Ok(content) = OneOrMany::many(std::mem::take(results)) {
        history.push(Message::User { content });
    }
}

fn to_rig_tool(def: &ToolDefinition) -> completion::ToolDefinition {
    completion::ToolDefinition {
        name: def.name.clone(),
        description: def.description.clone(),
        parameters: def.parameters.clone(),
    }
}

fn to_rig_tool_choice(choice: &ToolChoice) -> RigToolChoice {
    match choice {
        ToolChoice::Auto => RigToolChoice::Auto,
        ToolChoice::Any => RigToolChoice::Required,
        ToolChoice::Tool(name) => RigToolChoice::Specific {
            function_names: vec![name.clone()],
        },
    }
}

fn split_choice(choice: OneOrMany<AssistantContent>) -> (Option<String>, Vec<ToolCall>) {
    let mut text = String::new();
    let mut calls = Vec::new();
    for content in choice {
        match content {
            AssistantContent::Text(t) => text.push_str(&t.text),
            AssistantContent::ToolCall(call) => calls.push(ToolCall {
                id: call.id,
                name: call.function.name,
                args: call.function.arguments,
            }),
            _ => {}
        }
    }
    ((!text.is_empty()).then_some(text), calls)
}

fn saturating_u32(n: u64) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

// ── Errors ──────────────────────────────────────────────────────────

/// Map a rig error onto our error kinds.
///
/// Only a response that arrived intact but carried nothing usable is an
/// `InvalidResponse`. Transport failures, undecodable bodies and error
/// bodies we do not recognise are all retryable.
fn map_completion_error(provider: &str, err: CompletionError) -> LlmError {
    match err {
        CompletionError::ProviderError(body) => provider_error(provider, &body),
        CompletionError::ResponseError(reason) => LlmError::InvalidResponse {
            provider: provider.to_string(),
            reason,
        },
        other => LlmError::RequestFailed {
            provider: provider.to_string(),
            reason: other.to_string(),
        },
    }
}

/// Classify an error body returned by the provider.
///
/// Anthropic answers non-2xx statuses with
/// `{"type": "error", "error": {"type": ..., "message": ...}}`. Gateways in
/// front of it (408, 409, 425, 502, ...) return anything at all, so a body
/// that is not in that shape is treated as transient.
fn provider_error(provider: &str, body: &str) -> LlmError {
    let error_type = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/type")
                .and_then(|t| t.as_str())
                .map(str::to_string)
        });

    match error_type.as_deref() {
        Some("rate_limit_error") | Some("overloaded_error") => LlmError::RateLimited {
            provider: provider.to_string(),
            retry_after: None,
        },
        Some("authentication_error") | Some("permission_error") => LlmError::AuthFailed {
            provider: provider.to_string(),
        },
        Some("invalid_request_error") | Some("not_found_error") | Some("request_too_large") => {
            LlmError::Rejected {
                provider: provider.to_string(),
                reason: body.to_string(),
            }
        }
        _ => LlmError::RequestFailed {
            provider: provider.to_string(),
            reason: body.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(id: &str, name: &str) -> ToolCall {
        ToolCall {
            id: id.into(),
            name: name.into(),
            args: serde_json::json!({"x": 1}),
        }
    }

    fn error_body(kind: &str) -> String {
        serde_json::json!({"type": "error", "error": {"type": kind, "message": "m"}}).to_string()
    }

    #[test]
    fn system_messages_become_the_preamble() {
        let (preamble, history) = to_rig_messages(&[
            ChatMessage::system("be brief"),
            ChatMessage::system("be kind"),
            ChatMessage::user("hello"),
        ]);
        assert_eq!(preamble.as_deref(), Some("be brief\n\nbe kind"));
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn tool_results_fold_into_one_user_turn() {
        let (_, history) = to_rig_messages(&[
            ChatMessage::user("respond"),
            ChatMessage::assistant_with_tool_calls(
                None,
                vec![call("a", "send_email"), call("b", "done")],
            ),
            ChatMessage::tool_result("a", "send_email", "sent"),
            ChatMessage::tool_error("b", "done", "not executed"),
            ChatMessage::user("next"),
        ]);
        assert_eq!(history.len(), 4);
        match &history[1] {
            Message::Assistant { content, .. } => assert_eq!(content.len(), 2),
            other => panic!("expected assistant turn, got {other:?}"),
        }
        match &history[2] {
            Message::User { content } => assert_eq!(content.len(), 2),
            other => panic!("expected tool results, got {other:?}"),
        }
    }

    #[test]
    fn forced_tool_choice_names_the_tool() {
        assert!(matches!(
            to_rig_tool_choice(&ToolChoice::Any),
            RigToolChoice::Required
        ));
        match to_rig_tool_choice(&ToolChoice::Tool("route_email".into())) {
            RigToolChoice::Specific { function_names } => {
                assert_eq!(function_names, vec!["route_email".to_string()])
            }
            other => panic!("unexpected choice {other:?}"),
        }
    }

    #[test]
    fn overload_and_quota_errors_are_retryable() {
        for kind in ["rate_limit_error", "overloaded_error", "api_error", "timeout_error"] {
            let err = provider_error("anthropic", &error_body(kind));
            assert!(err.is_retryable(), "{kind} should be retryable");
        }
    }

    #[test]
    fn gateway_statuses_are_retryable() {
        for body in [
            "408 Request Timeout",
            "<html><body>409 Conflict</body></html>",
            "425 Too Early",
            "",
        ] {
            let err = provider_error("anthropic", body);
            assert!(err.is_retryable(), "{body:?} should be retryable");
            assert!(!matches!(err, LlmError::InvalidResponse { .. }));
        }
    }

    #[test]
    fn client_side_errors_are_not_retried() {
        assert!(matches!(
            provider_error("anthropic", &error_body("authentication_error")),
            LlmError::AuthFailed { .. }
        ));
        let rejected = provider_error("anthropic", &error_body("invalid_request_error"));
        assert!(matches!(rejected, LlmError::Rejected { .. }));
        assert!(!rejected.is_retryable());
    }

    #[test]
    fn undecodable_bodies_are_retryable() {
        let decode = serde_json::from_str::<serde_json::Value>("{truncated").unwrap_err();
        let err = map_completion_error("anthropic", CompletionError::JsonError(decode));
        assert!(err.is_retryable());

        let empty = map_completion_error(
            "anthropic",
            CompletionError::ResponseError("no content".into()),
        );
        assert!(matches!(empty, LlmError::InvalidResponse { .. }));
    }
}
