//! Mailbox and calendar provider contract.
//!
//! The engine never talks to a mail service directly; everything goes
//! through `MailboxProvider`. Real adapters (Gmail, Graph, IMAP) live outside
//! this crate. `DryRunMailbox` logs instead of sending.

use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::ProviderError;
use crate::pipeline::types::EmailInput;

/// An outbound email, either a reply or a new message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingEmail {
    pub body_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_email: Option<String>,
    /// Omitted for replies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_message_id: Option<String>,
}

impl OutgoingEmail {
    pub fn is_reply(&self) -> bool {
        self.thread_id.is_some() || self.reply_to_message_id.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendReceipt {
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
}

/// A busy slot on the user's calendar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalendarEvent {
    pub summary: String,
    pub start: String,
    pub end: String,
}

/// Parameters for a new calendar event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeetingRequest {
    pub attendees: Vec<String>,
    pub title: String,
    /// `YYYY-MM-DDTHH:MM:SS`
    pub start_time: String,
    pub end_time: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleReceipt {
    pub event_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
}

/// External mailbox + calendar collaborator.
///
/// Any call may fail with `ProviderError::AuthExpired` or
/// `ProviderError::RateLimited`.
#[async_trait]
pub trait MailboxProvider: Send + Sync {
    /// Unread inbox items for `user_id`.
    async fn fetch_unread(&self, user_id: &str) -> Result<Vec<EmailInput>, ProviderError>;

    async fn send(&self, user_id: &str, email: &OutgoingEmail) -> Result<SendReceipt, ProviderError>;

    async fn mark_read(&self, user_id: &str, item_id: &str) -> Result<(), ProviderError>;

    /// Events on each of `dates` (`DD-MM-YYYY`).
    async fn check_availability(
        &self,
        user_id: &str,
        dates: &[String],
    ) -> Result<Vec<CalendarEvent>, ProviderError>;

    async fn schedule(
        &self,
        user_id: &str,
        meeting: &MeetingRequest,
    ) -> Result<ScheduleReceipt, ProviderError>;
}

/// Mailbox that logs every side effect and performs none.
///
/// Seeded with a fixed inbox; `mark_read` removes items from it.
#[derive(Default)]
pub struct DryRunMailbox {
    unread: Mutex<Vec<EmailInput>>,
}

impl DryRunMailbox {
    pub fn new(inbox: Vec<EmailInput>) -> Self {
        Self {
            unread: Mutex::new(inbox),
        }
    }

    fn unread(&self) -> Result<std::sync::MutexGuard<'_, Vec<EmailInput>>, ProviderError> {
        self.unread
            .lock()
            .map_err(|_| ProviderError::Failed("dry-run inbox lock poisoned".to_string()))
    }
}

#[async_trait]
impl MailboxProvider for DryRunMailbox {
    async fn fetch_unread(&self, user_id: &str) -> Result<Vec<EmailInput>, ProviderError> {
        let unread = self.unread()?;
        Ok(unread.iter().filter(|e| e.user_id == user_id).cloned().collect())
    }

    async fn send(&self, user_id: &str, email: &OutgoingEmail) -> Result<SendReceipt, ProviderError> {
        info!(
            user_id,
            to = email.to_email.as_deref().unwrap_or("(thread sender)"),
            reply = email.is_reply(),
            chars = email.body_text.len(),
            "[dry-run] send email"
        );
        Ok(SendReceipt {
            message_id: format!("dry-run-{}", Uuid::new_v4()),
            thread_id: email.thread_id.clone(),
        })
    }

    async fn mark_read(&self, user_id: &str, item_id: &str) -> Result<(), ProviderError> {
        info!(user_id, item_id, "[dry-run] mark read");
        self.unread()?.retain(|e| e.id != item_id);
        Ok(())
    }

    async fn check_availability(
        &self,
        user_id: &str,
        dates: &[String],
    ) -> Result<Vec<CalendarEvent>, ProviderError> {
        info!(user_id, ?dates, "[dry-run] check availability");
        Ok(Vec::new())
    }

    async fn schedule(
        &self,
        user_id: &str,
        meeting: &MeetingRequest,
    ) -> Result<ScheduleReceipt, ProviderError> {
        info!(
            user_id,
            title = %meeting.title,
            start = %meeting.start_time,
            attendees = meeting.attendees.len(),
            "[dry-run] schedule meeting"
        );
        Ok(ScheduleReceipt {
            event_id: format!("dry-run-{}", Uuid::new_v4()),
            link: None,
        })
    }
}
