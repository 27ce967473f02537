//! Built-in tools.

mod mail;

pub use mail::{
    CHECK_CALENDAR, CheckCalendarTool, DONE, DoneTool, QUESTION, QuestionTool, SCHEDULE_MEETING,
    SEND_EMAIL, ScheduleMeetingTool, SendEmailTool,
};

use std::sync::Arc;

use crate::channels::MailboxProvider;
use crate::tools::ToolRegistry;

/// Register the mail and calendar tool set.
pub fn register_mail_tools(registry: &ToolRegistry, mailbox: Arc<dyn MailboxProvider>) {
    registry.register_sync(Arc::new(SendEmailTool::new(Arc::clone(&mailbox))));
    registry.register_sync(Arc::new(ScheduleMeetingTool::new(Arc::clone(&mailbox))));
    registry.register_sync(Arc::new(CheckCalendarTool::new(mailbox)));
    registry.register_sync(Arc::new(QuestionTool));
    registry.register_sync(Arc::new(DoneTool));
}
