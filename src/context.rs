//! Who and what a tool invocation acts on behalf of.

use serde::Serialize;

/// Context for a single tool invocation.
#[derive(Debug, Clone, Serialize)]
pub struct ToolContext {
    /// Workflow thread that triggered the call.
    pub thread_id: String,
    /// Mailbox owner.
    pub user_id: String,
    /// Source item (email) the thread processes.
    pub item_id: String,
    /// Provider-side conversation id of the source item, if any.
    pub mail_thread_id: Option<String>,
}

impl ToolContext {
    pub fn new(
        thread_id: impl Into<String>,
        user_id: impl Into<String>,
        item_id: impl Into<String>,
    ) -> Self {
        Self {
            thread_id: thread_id.into(),
            user_id: user_id.into(),
            item_id: item_id.into(),
            mail_thread_id: None,
        }
    }

    pub fn with_mail_thread(mut self, mail_thread_id: Option<String>) -> Self {
        self.mail_thread_id = mail_thread_id;
        self
    }
}
