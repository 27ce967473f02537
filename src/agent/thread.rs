//! Workflow thread state.
//!
//! A `WorkflowThread` is the full, serializable state of one email's trip
//! through the workflow. `node` is the continuation marker: which step runs
//! next when the thread is driven again, in this process or another one.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::llm::{ChatMessage, ToolCall};
use crate::pipeline::types::{Classification, EmailInput};

/// Lifecycle status of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadStatus {
    Running,
    Suspended,
    Completed,
    Failed,
}

impl ThreadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Suspended => "suspended",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for ThreadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Next step to run for a thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Node {
    /// Ask the oracle for ignore / respond / notify.
    Classify,
    /// Suspend and ask whether a `notify` email deserves a reply.
    NotifyGate,
    /// Ask the oracle for the next tool call.
    Decide,
    /// Send the selected call to approval or run it directly.
    Route { tool_call_id: String },
    /// Suspend for human review of the selected call.
    Approve { tool_call_id: String },
    /// A reviewed call was claimed for execution. Seeing this on load means
    /// the previous run stopped before recording the result.
    Act { tool_call_id: String },
    /// Mark the source email read and complete.
    Finalize,
    /// Nothing left to run.
    End,
}

impl Node {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Classify => "classify",
            Self::NotifyGate => "notify_gate",
            Self::Decide => "decide",
            Self::Route { .. } => "route",
            Self::Approve { .. } => "approve",
            Self::Act { .. } => "act",
            Self::Finalize => "finalize",
            Self::End => "end",
        }
    }
}

/// Which reviewer responses a pending request accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionConfig {
    pub allow_ignore: bool,
    pub allow_respond: bool,
    pub allow_edit: bool,
    pub allow_accept: bool,
}

impl ActionConfig {
    /// The notify gate: reply or drop, nothing to accept.
    pub fn notify_gate() -> Self {
        Self {
            allow_ignore: true,
            allow_respond: true,
            allow_edit: false,
            allow_accept: false,
        }
    }

    /// Review of a gated tool call.
    pub fn tool_review(accepts_edits: bool) -> Self {
        Self {
            allow_ignore: true,
            allow_respond: true,
            allow_edit: accepts_edits,
            allow_accept: accepts_edits,
        }
    }

    pub fn allows(&self, kind: DecisionType) -> bool {
        match kind {
            DecisionType::Accept => self.allow_accept,
            DecisionType::Edit => self.allow_edit,
            DecisionType::Ignore => self.allow_ignore,
            DecisionType::Response => self.allow_respond,
        }
    }
}

/// A pending action awaiting a human decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    /// Identifies this suspension; decisions may echo it back.
    pub request_id: String,
    /// Tool name, or `Email Assistant: notify` for the notify gate.
    pub action: String,
    pub args: serde_json::Value,
    pub config: ActionConfig,
    /// The source email's fields.
    pub description: serde_json::Value,
}

impl ActionRequest {
    pub fn new(
        action: impl Into<String>,
        args: serde_json::Value,
        config: ActionConfig,
        description: serde_json::Value,
    ) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            action: action.into(),
            args,
            config,
            description,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionType {
    Accept,
    Edit,
    Ignore,
    Response,
}

impl DecisionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::Edit => "edit",
            Self::Ignore => "ignore",
            Self::Response => "response",
        }
    }
}

/// A human decision that resumes a suspended thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    #[serde(rename = "type")]
    pub kind: DecisionType,
    /// Edited tool args for `edit`, feedback text for `response`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<serde_json::Value>,
    /// The request this decision answers. Required when resuming a tool
    /// review; optional at the notify gate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl Decision {
    pub fn accept() -> Self {
        Self {
            kind: DecisionType::Accept,
            args: None,
            request_id: None,
        }
    }

    pub fn ignore() -> Self {
        Self {
            kind: DecisionType::Ignore,
            args: None,
            request_id: None,
        }
    }

    pub fn edit(args: serde_json::Value) -> Self {
        Self {
            kind: DecisionType::Edit,
            args: Some(args),
            request_id: None,
        }
    }

    pub fn response(feedback: impl Into<String>) -> Self {
        Self {
            kind: DecisionType::Response,
            args: Some(serde_json::Value::String(feedback.into())),
            request_id: None,
        }
    }

    pub fn for_request(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Free-text feedback carried by a `response` decision.
    pub fn feedback(&self) -> String {
        match &self.args {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        }
    }

    /// Replacement args carried by an `edit` decision.
    ///
    /// Accepts the bare args object or an `{"args": {...}}` envelope.
    pub fn edited_args(&self) -> Option<serde_json::Value> {
        match &self.args {
            Some(serde_json::Value::Object(map)) => match map.get("args") {
                Some(inner @ serde_json::Value::Object(_)) => Some(inner.clone()),
                _ => Some(serde_json::Value::Object(map.clone())),
            },
            _ => None,
        }
    }
}

/// What a start / resume / retry call left the thread in.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed {
        classification: Option<Classification>,
    },
    Suspended(ActionRequest),
    Failed {
        reason: String,
    },
}

impl Outcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Suspended(_))
    }

    pub fn pending_request(&self) -> Option<&ActionRequest> {
        match self {
            Self::Suspended(request) => Some(request),
            _ => None,
        }
    }
}

/// One workflow execution for one inbound email.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowThread {
    pub id: String,
    pub user_id: String,
    pub status: ThreadStatus,
    pub email_input: EmailInput,
    /// Set once by classification; never reset afterwards.
    #[serde(default)]
    pub classification: Option<Classification>,
    /// Append-only, except that an `edit` rewrites one call's args.
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub pending_request: Option<ActionRequest>,
    pub node: Node,
    /// Decide steps taken so far.
    #[serde(default)]
    pub iterations: u32,
    /// Request ids whose decision has been applied.
    #[serde(default)]
    pub resolved_requests: Vec<String>,
    #[serde(default)]
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowThread {
    pub fn new(email_input: EmailInput) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: email_input.user_id.clone(),
            status: ThreadStatus::Running,
            email_input,
            classification: None,
            messages: Vec::new(),
            pending_request: None,
            node: Node::Classify,
            iterations: 0,
            resolved_requests: Vec::new(),
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Record the classification. Returns false if one was already set.
    pub fn set_classification(&mut self, classification: Classification) -> bool {
        if self.classification.is_some() {
            return false;
        }
        self.classification = Some(classification);
        true
    }

    pub fn suspend(&mut self, request: ActionRequest) {
        self.status = ThreadStatus::Suspended;
        self.pending_request = Some(request);
    }

    /// Move past a suspension point after its decision has been accepted.
    pub fn resolve_pending(&mut self) -> Option<ActionRequest> {
        let request = self.pending_request.take()?;
        self.resolved_requests.push(request.request_id.clone());
        self.status = ThreadStatus::Running;
        Some(request)
    }

    pub fn is_resolved(&self, request_id: &str) -> bool {
        self.resolved_requests.iter().any(|id| id == request_id)
    }

    pub fn complete(&mut self) {
        self.status = ThreadStatus::Completed;
        self.pending_request = None;
        self.node = Node::End;
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        self.status = ThreadStatus::Failed;
        self.pending_request = None;
        self.failure_reason = Some(reason.into());
        self.node = Node::End;
    }

    /// Find a tool call by id on any assistant message.
    pub fn find_tool_call(&self, tool_call_id: &str) -> Option<&ToolCall> {
        self.messages
            .iter()
            .rev()
            .flat_map(|m| m.tool_calls())
            .find(|c| c.id == tool_call_id)
    }

    /// Replace the args of one tool call in place. Other calls on the same
    /// message are left untouched. Returns false if the call is unknown.
    pub fn replace_tool_call_args(&mut self, tool_call_id: &str, args: serde_json::Value) -> bool {
        for message in self.messages.iter_mut().rev() {
            if let ChatMessage::Assistant { tool_calls, .. } = message
                && let Some(call) = tool_calls.iter_mut().find(|c| c.id == tool_call_id)
            {
                call.args = args;
                return true;
            }
        }
        false
    }

    /// Outcome for a thread that is not running.
    pub fn outcome(&self) -> Option<Outcome> {
        match self.status {
            ThreadStatus::Running => None,
            ThreadStatus::Suspended => self.pending_request.clone().map(Outcome::Suspended),
            ThreadStatus::Completed => Some(Outcome::Completed {
                classification: self.classification,
            }),
            ThreadStatus::Failed => Some(Outcome::Failed {
                reason: self.failure_reason.clone().unwrap_or_default(),
            }),
        }
    }
}
