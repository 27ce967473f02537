//! Mailbox and calendar tools.
//!
//! `send_email`, `schedule_meeting` and `question` are gated behind human
//! approval. `check_calendar` is read-only and runs immediately. `done`
//! marks the task finished and is handled by the engine itself.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use crate::channels::{MailboxProvider, MeetingRequest, OutgoingEmail};
use crate::context::ToolContext;
use crate::memory::PreferenceKind;
use crate::tools::tool::{Tool, ToolError, ToolOutput, parse_params, require_str};

pub const SEND_EMAIL: &str = "send_email";
pub const SCHEDULE_MEETING: &str = "schedule_meeting";
pub const CHECK_CALENDAR: &str = "check_calendar";
pub const QUESTION: &str = "question";
pub const DONE: &str = "done";

// ── send_email ──────────────────────────────────────────────────────

/// Sends a reply or a new email. Requires approval.
pub struct SendEmailTool {
    mailbox: Arc<dyn MailboxProvider>,
}

impl SendEmailTool {
    pub fn new(mailbox: Arc<dyn MailboxProvider>) -> Self {
        Self { mailbox }
    }
}

#[async_trait]
impl Tool for SendEmailTool {
    fn name(&self) -> &str {
        SEND_EMAIL
    }

    fn description(&self) -> &str {
        "Send an email. To reply to the current email, pass thread_id, reply_to_message_id \
         and to_email and omit subject. For a new email, pass to_email and subject."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "body_text": {"type": "string", "description": "Plain-text body"},
                "to_email": {"type": "string", "description": "Recipient address"},
                "subject": {"type": "string", "description": "Subject, new emails only"},
                "thread_id": {"type": "string", "description": "Conversation to reply in"},
                "reply_to_message_id": {"type": "string", "description": "Message being answered"}
            },
            "required": ["body_text"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        require_str(&params, "body_text")?;
        let email: OutgoingEmail = parse_params(params)?;
        if email.to_email.is_none() && !email.is_reply() {
            return Err(ToolError::InvalidParameters(
                "new emails need to_email".to_string(),
            ));
        }

        let receipt = self.mailbox.send(&ctx.user_id, &email).await?;
        Ok(ToolOutput::success(
            serde_json::json!({
                "status": "sent",
                "message_id": receipt.message_id,
                "thread_id": receipt.thread_id,
            }),
            start.elapsed(),
        ))
    }

    fn requires_approval(&self) -> bool {
        true
    }

    fn preference_kind(&self) -> Option<PreferenceKind> {
        Some(PreferenceKind::Response)
    }
}

// ── schedule_meeting ────────────────────────────────────────────────

/// Creates a calendar event. Requires approval.
pub struct ScheduleMeetingTool {
    mailbox: Arc<dyn MailboxProvider>,
}

impl ScheduleMeetingTool {
    pub fn new(mailbox: Arc<dyn MailboxProvider>) -> Self {
        Self { mailbox }
    }
}

#[async_trait]
impl Tool for ScheduleMeetingTool {
    fn name(&self) -> &str {
        SCHEDULE_MEETING
    }

    fn description(&self) -> &str {
        "Schedule a calendar meeting. Times use YYYY-MM-DDTHH:MM:SS."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "attendees": {"type": "array", "items": {"type": "string"}},
                "title": {"type": "string"},
                "start_time": {"type": "string", "description": "YYYY-MM-DDTHH:MM:SS"},
                "end_time": {"type": "string", "description": "YYYY-MM-DDTHH:MM:SS"},
                "timezone": {"type": "string", "description": "IANA zone, default UTC"},
                "description": {"type": "string"}
            },
            "required": ["attendees", "title", "start_time", "end_time"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let meeting: MeetingRequest = parse_params(params)?;
        if meeting.attendees.is_empty() {
            return Err(ToolError::InvalidParameters(
                "attendees must not be empty".to_string(),
            ));
        }

        let receipt = self.mailbox.schedule(&ctx.user_id, &meeting).await?;
        Ok(ToolOutput::success(
            serde_json::json!({
                "status": "scheduled",
                "event_id": receipt.event_id,
                "title": meeting.title,
                "start_time": meeting.start_time,
                "end_time": meeting.end_time,
            }),
            start.elapsed(),
        ))
    }

    fn requires_approval(&self) -> bool {
        true
    }

    fn preference_kind(&self) -> Option<PreferenceKind> {
        Some(PreferenceKind::Calendar)
    }
}

// ── check_calendar ──────────────────────────────────────────────────

/// Lists events on the given days. Read-only, no approval.
pub struct CheckCalendarTool {
    mailbox: Arc<dyn MailboxProvider>,
}

impl CheckCalendarTool {
    pub fn new(mailbox: Arc<dyn MailboxProvider>) -> Self {
        Self { mailbox }
    }
}

#[async_trait]
impl Tool for CheckCalendarTool {
    fn name(&self) -> &str {
        CHECK_CALENDAR
    }

    fn description(&self) -> &str {
        "Check calendar availability on the given dates (DD-MM-YYYY)."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "dates": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Days to check, DD-MM-YYYY"
                }
            },
            "required": ["dates"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let dates: Vec<String> = params
            .get("dates")
            .and_then(|v| v.as_array())
            .ok_or_else(|| ToolError::InvalidParameters("missing required parameter 'dates'".into()))?
            .iter()
            .filter_map(|d| d.as_str())
            .map(|d| d.trim().to_string())
            .collect();
        if dates.is_empty() {
            return Err(ToolError::InvalidParameters("no dates given".to_string()));
        }
        for date in &dates {
            chrono::NaiveDate::parse_from_str(date, "%d-%m-%Y").map_err(|_| {
                ToolError::InvalidParameters(format!("invalid date '{date}', use DD-MM-YYYY"))
            })?;
        }

        let events = self.mailbox.check_availability(&ctx.user_id, &dates).await?;
        Ok(ToolOutput::success(
            serde_json::json!({
                "dates": dates,
                "busy": events,
            }),
            start.elapsed(),
        ))
    }
}

// ── question ────────────────────────────────────────────────────────

/// Asks the user something the assistant cannot answer alone. The answer
/// comes back as the reviewer's free-text response.
pub struct QuestionTool;

#[async_trait]
impl Tool for QuestionTool {
    fn name(&self) -> &str {
        QUESTION
    }

    fn description(&self) -> &str {
        "Ask the user a question you need answered before you can reply."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "content": {"type": "string", "description": "The question"}
            },
            "required": ["content"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let content = require_str(&params, "content")?;
        Ok(ToolOutput::text(format!("Asked: {content}"), start.elapsed()))
    }

    fn requires_approval(&self) -> bool {
        true
    }

    fn accepts_edits(&self) -> bool {
        false
    }
}

// ── done ────────────────────────────────────────────────────────────

/// Signals that the email has been fully handled.
pub struct DoneTool;

#[async_trait]
impl Tool for DoneTool {
    fn name(&self) -> &str {
        DONE
    }

    fn description(&self) -> &str {
        "Call when the email has been fully handled."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "done": {"type": "boolean"}
            }
        })
    }

    async fn execute(
        &self,
        _params: serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        Ok(ToolOutput::text("done", std::time::Duration::ZERO))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    use crate::channels::{CalendarEvent, ScheduleReceipt, SendReceipt};
    use crate::error::ProviderError;
    use crate::pipeline::types::EmailInput;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<OutgoingEmail>>,
        scheduled: Mutex<Vec<MeetingRequest>>,
        fail_send: bool,
    }

    #[async_trait]
    impl MailboxProvider for Recorder {
        async fn fetch_unread(&self, _user_id: &str) -> Result<Vec<EmailInput>, ProviderError> {
            Ok(vec![])
        }
        async fn send(
            &self,
            _user_id: &str,
            email: &OutgoingEmail,
        ) -> Result<SendReceipt, ProviderError> {
            if self.fail_send {
                return Err(ProviderError::AuthExpired {
                    user_id: "u".into(),
                });
            }
            self.sent.lock().unwrap().push(email.clone());
            Ok(SendReceipt {
                message_id: "m".into(),
                thread_id: None,
            })
        }
        async fn mark_read(&self, _user_id: &str, _item_id: &str) -> Result<(), ProviderError> {
            Ok(())
        }
        async fn check_availability(
            &self,
            _user_id: &str,
            dates: &[String],
        ) -> Result<Vec<CalendarEvent>, ProviderError> {
            Ok(dates
                .iter()
                .map(|d| CalendarEvent {
                    summary: "Standup".into(),
                    start: format!("{d} 09:00"),
                    end: format!("{d} 09:15"),
                })
                .collect())
        }
        async fn schedule(
            &self,
            _user_id: &str,
            meeting: &MeetingRequest,
        ) -> Result<ScheduleReceipt, ProviderError> {
            self.scheduled.lock().unwrap().push(meeting.clone());
            Ok(ScheduleReceipt {
                event_id: "e".into(),
                link: None,
            })
        }
    }

    fn ctx() -> ToolContext {
        ToolContext::new("thread", "u", "item")
    }

    #[tokio::test]
    async fn send_email_passes_args_through() {
        let mailbox = Arc::new(Recorder::default());
        let tool = SendEmailTool::new(mailbox.clone());
        let out = tool
            .execute(
                serde_json::json!({"body_text": "Thanks!", "to_email": "a@example.com", "thread_id": "t1"}),
                &ctx(),
            )
            .await
            .unwrap();
        assert_eq!(out.result["status"], "sent");
        let sent = mailbox.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].body_text, "Thanks!");
        assert_eq!(sent[0].thread_id.as_deref(), Some("t1"));
    }

    #[tokio::test]
    async fn send_email_rejects_new_mail_without_recipient() {
        let tool = SendEmailTool::new(Arc::new(Recorder::default()));
        let err = tool
            .execute(serde_json::json!({"body_text": "x", "subject": "hi"}), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidParameters(_)));
    }

    #[tokio::test]
    async fn send_email_surfaces_provider_errors() {
        let mailbox = Arc::new(Recorder {
            fail_send: true,
            ..Default::default()
        });
        let err = SendEmailTool::new(mailbox)
            .execute(serde_json::json!({"body_text": "x", "to_email": "a@b"}), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Provider(ProviderError::AuthExpired { .. })));
    }

    #[tokio::test]
    async fn check_calendar_validates_dates() {
        let tool = CheckCalendarTool::new(Arc::new(Recorder::default()));
        let ok = tool
            .execute(serde_json::json!({"dates": ["05-01-2026"]}), &ctx())
            .await
            .unwrap();
        assert_eq!(ok.result["busy"][0]["summary"], "Standup");

        let bad = tool
            .execute(serde_json::json!({"dates": ["2026-01-05"]}), &ctx())
            .await;
        assert!(bad.is_err());
    }

    #[tokio::test]
    async fn schedule_meeting_requires_attendees() {
        let mailbox = Arc::new(Recorder::default());
        let tool = ScheduleMeetingTool::new(mailbox.clone());
        let empty = tool
            .execute(
                serde_json::json!({"attendees": [], "title": "x", "start_time": "a", "end_time": "b"}),
                &ctx(),
            )
            .await;
        assert!(empty.is_err());

        tool.execute(
            serde_json::json!({
                "attendees": ["a@example.com"],
                "title": "Sync",
                "start_time": "2026-01-05T10:00:00",
                "end_time": "2026-01-05T10:30:00"
            }),
            &ctx(),
        )
        .await
        .unwrap();
        assert_eq!(mailbox.scheduled.lock().unwrap()[0].title, "Sync");
    }

    #[test]
    fn gating_flags() {
        let mailbox: Arc<dyn MailboxProvider> = Arc::new(Recorder::default());
        assert!(SendEmailTool::new(mailbox.clone()).requires_approval());
        assert!(ScheduleMeetingTool::new(mailbox.clone()).requires_approval());
        assert!(!CheckCalendarTool::new(mailbox).requires_approval());
        assert!(QuestionTool.requires_approval());
        assert!(!QuestionTool.accepts_edits());
        assert!(!DoneTool.requires_approval());
        assert_eq!(QuestionTool.preference_kind(), None);
    }
}
