//! Shared types for inbound mail and its triage.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ── Inbound item ────────────────────────────────────────────────────

/// A single inbound email as handed to the workflow.
///
/// Provider adapters convert their native format into this struct; the body
/// is already plain text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailInput {
    /// Provider message id.
    pub id: String,
    /// Sender address.
    pub from: String,
    /// Recipient address(es).
    pub to: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body: String,
    /// Provider conversation id, used for replies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    /// Mailbox owner the item belongs to.
    pub user_id: String,
    /// Received timestamp as reported by the provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
}

impl EmailInput {
    /// Structured description used in action requests and feedback messages.
    pub fn description(&self) -> serde_json::Value {
        serde_json::json!({
            "author": self.from,
            "to": self.to,
            "subject": self.subject,
            "body": self.body,
            "id": self.id,
        })
    }

    /// Markdown rendering of the email for humans and prompts.
    pub fn to_markdown(&self) -> String {
        format!(
            "**Subject**: {}\n**From**: {}\n**To**: {}\n\n{}\n\n---",
            self.subject, self.from, self.to, self.body
        )
    }
}

// ── Classification ──────────────────────────────────────────────────

/// Triage decision for an inbound email.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    /// Not worth tracking; finalize immediately.
    Ignore,
    /// Needs a reply; enter the response loop.
    Respond,
    /// Worth knowing about; ask the human first.
    Notify,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ignore => "ignore",
            Self::Respond => "respond",
            Self::Notify => "notify",
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Classification {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ignore" => Ok(Self::Ignore),
            "respond" => Ok(Self::Respond),
            "notify" => Ok(Self::Notify),
            other => Err(format!("unknown classification: '{other}'")),
        }
    }
}

/// Raw classifier output.
///
/// `label` is kept as text so an out-of-enum answer can be told apart from a
/// transport failure; `reasoning` is for logs only.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TriageResult {
    #[serde(default)]
    pub reasoning: String,
    #[serde(default, alias = "action")]
    pub classification: String,
}

impl TriageResult {
    pub fn parse(&self) -> Result<Classification, String> {
        self.classification.parse()
    }
}
