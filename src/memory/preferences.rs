//! Namespaced preference profiles learned from human feedback.
//!
//! Each profile is one text value under `(assistant, kind)` with the fixed
//! key `user_preferences`. Profiles are created lazily with a default and
//! rewritten whole by the oracle on every feedback update.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{DatabaseError, Error};
use crate::llm::{ChatMessage, Reasoning};
use crate::pipeline::prompts::{
    DEFAULT_CALENDAR_PREFERENCES, DEFAULT_RESPONSE_PREFERENCES, DEFAULT_TRIAGE_RULES,
    build_preference_update_prompt,
};
use crate::store::Database;

/// Key every profile is stored under.
pub const PREFERENCE_KEY: &str = "user_preferences";

/// Which profile a namespace holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreferenceKind {
    /// Rules the classifier follows.
    Triage,
    /// How replies should be written.
    Response,
    /// Meeting length and scheduling habits.
    Calendar,
}

impl PreferenceKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Triage => "triage_preferences",
            Self::Response => "response_preferences",
            Self::Calendar => "cal_preferences",
        }
    }

    pub fn default_value(&self) -> &'static str {
        match self {
            Self::Triage => DEFAULT_TRIAGE_RULES,
            Self::Response => DEFAULT_RESPONSE_PREFERENCES,
            Self::Calendar => DEFAULT_CALENDAR_PREFERENCES,
        }
    }
}

impl fmt::Display for PreferenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Store of learned preference profiles.
///
/// Updates to the same namespace are serialized; different namespaces
/// update in parallel.
pub struct PreferenceStore {
    db: Arc<dyn Database>,
    reasoning: Arc<Reasoning>,
    assistant: String,
    triage_lock: Mutex<()>,
    response_lock: Mutex<()>,
    calendar_lock: Mutex<()>,
}

impl PreferenceStore {
    pub fn new(db: Arc<dyn Database>, reasoning: Arc<Reasoning>, assistant: impl Into<String>) -> Self {
        Self {
            db,
            reasoning,
            assistant: assistant.into(),
            triage_lock: Mutex::new(()),
            response_lock: Mutex::new(()),
            calendar_lock: Mutex::new(()),
        }
    }

    fn lock_for(&self, kind: PreferenceKind) -> &Mutex<()> {
        match kind {
            PreferenceKind::Triage => &self.triage_lock,
            PreferenceKind::Response => &self.response_lock,
            PreferenceKind::Calendar => &self.calendar_lock,
        }
    }

    /// Storage namespace for a profile kind.
    pub fn namespace(&self, kind: PreferenceKind) -> String {
        format!("{}/{}", self.assistant, kind.label())
    }

    /// Current profile, created with its default on first read.
    ///
    /// Concurrent first reads race on the insert; the loser re-reads and
    /// returns the winner's value.
    pub async fn get(&self, kind: PreferenceKind) -> Result<String, DatabaseError> {
        let namespace = self.namespace(kind);
        if let Some(record) = self.db.get_preference(&namespace, PREFERENCE_KEY).await? {
            return Ok(record.value);
        }

        let default = kind.default_value();
        match self
            .db
            .insert_preference_if_absent(&namespace, PREFERENCE_KEY, default)
            .await
        {
            Ok(true) => {
                debug!(namespace = %namespace, "Seeded default preferences");
                return Ok(default.to_string());
            }
            Ok(false) => {}
            Err(DatabaseError::Constraint(reason)) => {
                warn!(namespace = %namespace, reason = %reason, "Preference insert lost a race");
            }
            Err(e) => return Err(e),
        }

        self.db
            .get_preference(&namespace, PREFERENCE_KEY)
            .await?
            .map(|record| record.value)
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "preference".to_string(),
                id: namespace,
            })
    }

    /// Rewrite a profile from feedback messages and store the result.
    ///
    /// The oracle is instructed to make minimal edits; its full output
    /// replaces the stored value. An empty answer keeps the old value.
    pub async fn update(
        &self,
        kind: PreferenceKind,
        feedback: Vec<ChatMessage>,
    ) -> Result<String, Error> {
        let namespace = self.namespace(kind);
        let _guard = self.lock_for(kind).lock().await;

        let current = self
            .db
            .get_preference(&namespace, PREFERENCE_KEY)
            .await?
            .map(|record| record.value)
            .unwrap_or_default();

        let prompt = build_preference_update_prompt(&namespace, &current);
        let rewritten = self.reasoning.rewrite_preferences(prompt, feedback).await?;

        if rewritten.trim().is_empty() {
            warn!(namespace = %namespace, "Preference rewrite came back empty, keeping current profile");
            return Ok(current);
        }

        self.db
            .put_preference(&namespace, PREFERENCE_KEY, &rewritten)
            .await?;
        info!(
            namespace = %namespace,
            before = current.len(),
            after = rewritten.len(),
            "Preferences updated from feedback"
        );
        Ok(rewritten)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use rust_decimal::Decimal;

    use crate::error::LlmError;
    use crate::llm::{
        CompletionRequest, CompletionResponse, FinishReason, LlmProvider, ToolCompletionRequest,
        ToolCompletionResponse,
    };
    use crate::store::LibSqlBackend;

    /// Appends the latest feedback line to whatever profile it is shown.
    struct AppendingLlm {
        calls: AtomicUsize,
        seen_prompts: StdMutex<Vec<String>>,
        reply_empty: bool,
    }

    impl AppendingLlm {
        fn new(reply_empty: bool) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                seen_prompts: StdMutex::new(Vec::new()),
                reply_empty,
            }
        }
    }

    #[async_trait]
    impl LlmProvider for AppendingLlm {
        fn model_name(&self) -> &str {
            "appending"
        }

        fn cost_per_token(&self) -> (Decimal, Decimal) {
            (Decimal::ZERO, Decimal::ZERO)
        }

        async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            // Yield so concurrent updates would interleave without the lock.
            tokio::time::sleep(Duration::from_millis(5)).await;

            let mut system = String::new();
            let mut feedback = String::new();
            for msg in &request.messages {
                match msg {
                    ChatMessage::System { content } => system = content.clone(),
                    ChatMessage::User { content } => feedback = content.clone(),
                    _ => {}
                }
            }
            self.seen_prompts.lock().unwrap().push(system.clone());

            let current = system
                .split("<profile>\n")
                .nth(1)
                .and_then(|rest| rest.split("\n</profile>").next())
                .unwrap_or("")
                .to_string();
            let content = if self.reply_empty {
                String::new()
            } else if current.is_empty() {
                format!("- {feedback}")
            } else {
                format!("{current}\n- {feedback}")
            };
            Ok(CompletionResponse {
                content,
                input_tokens: 0,
                output_tokens: 0,
                finish_reason: FinishReason::Stop,
                response_id: None,
            })
        }

        async fn complete_with_tools(
            &self,
            _request: ToolCompletionRequest,
        ) -> Result<ToolCompletionResponse, LlmError> {
            Err(LlmError::InvalidResponse {
                provider: "appending".into(),
                reason: "tools not supported".into(),
            })
        }
    }

    async fn store(llm: Arc<AppendingLlm>) -> (PreferenceStore, Arc<dyn Database>) {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let store = PreferenceStore::new(
            Arc::clone(&db),
            Arc::new(Reasoning::new(llm)),
            "email_assistant",
        );
        (store, db)
    }

    #[tokio::test]
    async fn get_seeds_default_once() {
        let (store, db) = store(Arc::new(AppendingLlm::new(false))).await;
        let value = store.get(PreferenceKind::Calendar).await.unwrap();
        assert_eq!(value, DEFAULT_CALENDAR_PREFERENCES);

        db.put_preference(&store.namespace(PreferenceKind::Calendar), PREFERENCE_KEY, "15 min only")
            .await
            .unwrap();
        assert_eq!(store.get(PreferenceKind::Calendar).await.unwrap(), "15 min only");
    }

    #[tokio::test]
    async fn concurrent_first_reads_agree() {
        let (store, _db) = store(Arc::new(AppendingLlm::new(false))).await;
        let store = Arc::new(store);
        let reads = futures::future::join_all(
            (0..8).map(|_| {
                let store = Arc::clone(&store);
                async move { store.get(PreferenceKind::Triage).await }
            }),
        )
        .await;
        for read in reads {
            assert_eq!(read.unwrap(), DEFAULT_TRIAGE_RULES);
        }
    }

    #[tokio::test]
    async fn update_preserves_existing_lines() {
        let (store, _db) = store(Arc::new(AppendingLlm::new(false))).await;
        let before = store.get(PreferenceKind::Triage).await.unwrap();
        let after = store
            .update(
                PreferenceKind::Triage,
                vec![ChatMessage::user("newsletters from acme are ignore")],
            )
            .await
            .unwrap();
        for line in before.lines() {
            assert!(after.contains(line), "lost line: {line}");
        }
        assert!(after.ends_with("- newsletters from acme are ignore"));
    }

    #[tokio::test]
    async fn update_on_missing_profile_starts_from_empty() {
        let llm = Arc::new(AppendingLlm::new(false));
        let (store, _db) = store(Arc::clone(&llm)).await;
        let after = store
            .update(PreferenceKind::Response, vec![ChatMessage::user("sign off with Cheers")])
            .await
            .unwrap();
        assert_eq!(after, "- sign off with Cheers");
        assert!(llm.seen_prompts.lock().unwrap()[0].contains("email_assistant/response_preferences"));
    }

    #[tokio::test]
    async fn same_namespace_updates_do_not_lose_feedback() {
        let (store, _db) = store(Arc::new(AppendingLlm::new(false))).await;
        let store = Arc::new(store);
        store.get(PreferenceKind::Calendar).await.unwrap();

        let updates = (0..4).map(|i| {
            let store = Arc::clone(&store);
            async move {
                store
                    .update(PreferenceKind::Calendar, vec![ChatMessage::user(format!("rule {i}"))])
                    .await
            }
        });
        for result in futures::future::join_all(updates).await {
            result.unwrap();
        }

        let final_value = store.get(PreferenceKind::Calendar).await.unwrap();
        for i in 0..4 {
            assert!(final_value.contains(&format!("rule {i}")), "lost rule {i}");
        }
    }

    #[tokio::test]
    async fn empty_rewrite_keeps_old_value() {
        let llm = Arc::new(AppendingLlm::new(true));
        let (store, _db) = store(Arc::clone(&llm)).await;
        let before = store.get(PreferenceKind::Response).await.unwrap();
        let after = store
            .update(PreferenceKind::Response, vec![ChatMessage::user("x")])
            .await
            .unwrap();
        assert_eq!(before, after);
        assert_eq!(store.get(PreferenceKind::Response).await.unwrap(), before);
        assert_eq!(llm.calls.load(Ordering::SeqCst), 1);
    }
}
