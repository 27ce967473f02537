//! Workflow engine: drives threads from node to node.
//!
//! A call to `start_workflow`, `resume` or `retry` runs one thread forward
//! until it suspends on an `ActionRequest` or reaches a terminal state. The
//! snapshot is persisted after every transition, and only after the work of
//! that transition succeeded, so a failed call can be retried from the last
//! checkpoint without repeating anything.

use std::sync::{Arc, Mutex as StdMutex};

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::agent::checkpoint::CheckpointManager;
use crate::agent::thread::{
    ActionConfig, ActionRequest, Decision, Node, Outcome, ThreadStatus, WorkflowThread,
};
use crate::channels::MailboxProvider;
use crate::config::EngineConfig;
use crate::context::ToolContext;
use crate::error::{DatabaseError, Error, LlmError, ToolError, WorkflowError};
use crate::llm::reasoning::log_reasoning;
use crate::llm::{ChatMessage, LlmProvider, Reasoning, ToolCall};
use crate::memory::{PreferenceKind, PreferenceStore};
use crate::pipeline::prompts::{
    build_agent_system_prompt, build_triage_system_prompt, build_triage_user_prompt,
    respond_kickoff,
};
use crate::pipeline::types::{Classification, EmailInput};
use crate::store::Database;
use crate::tools::ToolRegistry;
use crate::tools::builtin::{DONE, register_mail_tools};

/// Action label of the notify gate's request.
pub const NOTIFY_ACTION: &str = "Email Assistant: notify";

/// A suspended thread and what it waits on.
#[derive(Debug, Clone)]
pub struct PendingThread {
    pub thread_id: String,
    pub user_id: String,
    pub item_id: String,
    pub subject: String,
    pub request: ActionRequest,
}

/// The workflow engine.
pub struct WorkflowEngine {
    pub(super) config: EngineConfig,
    pub(super) reasoning: Arc<Reasoning>,
    pub(super) tools: Arc<ToolRegistry>,
    pub(super) mailbox: Arc<dyn MailboxProvider>,
    pub(super) preferences: Arc<PreferenceStore>,
    pub(super) checkpoints: CheckpointManager,
    background: StdMutex<Vec<JoinHandle<()>>>,
}

impl WorkflowEngine {
    /// Build an engine with the mail tool set registered against `mailbox`.
    pub fn new(
        config: EngineConfig,
        db: Arc<dyn Database>,
        llm: Arc<dyn LlmProvider>,
        mailbox: Arc<dyn MailboxProvider>,
    ) -> Self {
        let tools = ToolRegistry::new();
        register_mail_tools(&tools, Arc::clone(&mailbox));
        Self::with_tools(config, db, llm, mailbox, Arc::new(tools))
    }

    /// Build an engine around a caller-supplied registry.
    pub fn with_tools(
        config: EngineConfig,
        db: Arc<dyn Database>,
        llm: Arc<dyn LlmProvider>,
        mailbox: Arc<dyn MailboxProvider>,
        tools: Arc<ToolRegistry>,
    ) -> Self {
        let reasoning = Arc::new(Reasoning::new(llm));
        let preferences = Arc::new(PreferenceStore::new(
            Arc::clone(&db),
            Arc::clone(&reasoning),
            config.assistant.clone(),
        ));
        Self {
            config,
            reasoning,
            tools,
            mailbox,
            preferences,
            checkpoints: CheckpointManager::new(db),
            background: StdMutex::new(Vec::new()),
        }
    }

    pub fn preferences(&self) -> &Arc<PreferenceStore> {
        &self.preferences
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    // ── Exposed operations ──────────────────────────────────────────

    /// Start a thread for an inbound item and run it to its first
    /// suspension or to completion.
    ///
    /// An item that already has a thread is not started twice: the existing
    /// thread is retried instead, which also picks up a start that failed
    /// on a transient error.
    pub async fn start_workflow(&self, item: EmailInput) -> Result<(String, Outcome), Error> {
        if let Some(existing) = self.checkpoints.find_by_item(&item.user_id, &item.id).await? {
            info!(thread_id = %existing, item_id = %item.id, "Item already has a thread");
            let outcome = self.retry(&existing).await?;
            return Ok((existing, outcome));
        }

        let mut thread = WorkflowThread::new(item);
        let lock = self.checkpoints.lock(&thread.id).await;
        let mut version = 0;
        match self.checkpoints.save(&mut thread, &mut version).await {
            Ok(()) => {}
            Err(DatabaseError::Constraint(_)) => {
                drop(lock);
                let existing = self
                    .checkpoints
                    .find_by_item(&thread.user_id, &thread.email_input.id)
                    .await?
                    .ok_or_else(|| WorkflowError::ThreadNotFound {
                        id: thread.email_input.id.clone(),
                    })?;
                warn!(thread_id = %existing, "Concurrent start for the same item");
                let outcome = self.retry(&existing).await?;
                return Ok((existing, outcome));
            }
            Err(e) => return Err(e.into()),
        }

        info!(
            thread_id = %thread.id,
            item_id = %thread.email_input.id,
            user_id = %thread.user_id,
            "Workflow started"
        );
        let outcome = self.drive(&mut thread, &mut version).await?;
        Ok((thread.id, outcome))
    }

    /// Deliver a human decision to a suspended thread and run it to the next
    /// suspension or to completion.
    ///
    /// Decisions on a tool review must carry the `request_id` they answer.
    /// At the notify gate it may be omitted.
    pub async fn resume(&self, thread_id: &str, decision: Decision) -> Result<Outcome, Error> {
        let _lock = self.checkpoints.lock(thread_id).await;
        let (mut thread, mut version) = self.checkpoints.load(thread_id).await?;

        if let Some(request_id) = decision.request_id.as_deref()
            && thread.is_resolved(request_id)
        {
            info!(thread_id, request_id, "Decision already applied, replaying outcome");
            return thread.outcome().ok_or_else(|| not_suspended(&thread));
        }

        let Some(pending) = thread.pending_request.clone() else {
            return Err(not_suspended(&thread));
        };
        if thread.status != ThreadStatus::Suspended {
            return Err(not_suspended(&thread));
        }
        match decision.request_id.as_deref() {
            Some(given) if given != pending.request_id => {
                return Err(WorkflowError::StaleRequest {
                    id: thread.id.clone(),
                    given: given.to_string(),
                    live: pending.request_id,
                }
                .into());
            }
            // A tool review runs a side effect, so an unnamed decision could
            // land on a later request than the one the human saw.
            None if matches!(thread.node, Node::Approve { .. }) => {
                return Err(WorkflowError::MissingRequestId {
                    id: thread.id.clone(),
                    action: pending.action,
                }
                .into());
            }
            _ => {}
        }
        if !pending.config.allows(decision.kind) {
            let reason = format!(
                "decision '{}' is not allowed for action '{}'",
                decision.kind.as_str(),
                pending.action
            );
            return self.violate(&mut thread, &mut version, reason).await;
        }

        info!(
            thread_id,
            request_id = %pending.request_id,
            action = %pending.action,
            decision = decision.kind.as_str(),
            "Resuming thread"
        );
        if let Some(outcome) = self
            .apply_decision(&mut thread, &mut version, &pending, &decision)
            .await?
        {
            return Ok(outcome);
        }
        self.drive(&mut thread, &mut version).await
    }

    /// Continue a running thread from its persisted node. Suspended and
    /// terminal threads return their current outcome untouched.
    pub async fn retry(&self, thread_id: &str) -> Result<Outcome, Error> {
        let _lock = self.checkpoints.lock(thread_id).await;
        let (mut thread, mut version) = self.checkpoints.load(thread_id).await?;
        if let Some(outcome) = thread.outcome() {
            return Ok(outcome);
        }
        info!(thread_id, node = thread.node.name(), "Retrying thread");
        self.drive(&mut thread, &mut version).await
    }

    /// Latest persisted state of a thread.
    pub async fn get_thread(&self, thread_id: &str) -> Result<WorkflowThread, Error> {
        let (thread, _) = self.checkpoints.load(thread_id).await?;
        Ok(thread)
    }

    /// Thread already handling a source item.
    pub async fn thread_for_item(
        &self,
        user_id: &str,
        item_id: &str,
    ) -> Result<Option<String>, Error> {
        Ok(self.checkpoints.find_by_item(user_id, item_id).await?)
    }

    /// All threads waiting on a human decision.
    pub async fn pending_threads(&self) -> Result<Vec<PendingThread>, Error> {
        let threads = self
            .checkpoints
            .list_by_status(ThreadStatus::Suspended)
            .await?;
        Ok(threads
            .into_iter()
            .filter_map(|thread| {
                let request = thread.pending_request?;
                Some(PendingThread {
                    thread_id: thread.id,
                    user_id: thread.user_id,
                    item_id: thread.email_input.id,
                    subject: thread.email_input.subject,
                    request,
                })
            })
            .collect())
    }

    /// Threads left RUNNING by a call that failed part-way. Each can be
    /// continued with `retry`.
    pub async fn running_threads(&self) -> Result<Vec<WorkflowThread>, Error> {
        Ok(self
            .checkpoints
            .list_by_status(ThreadStatus::Running)
            .await?)
    }

    /// Wait for preference updates still running in the background.
    pub async fn flush_preference_updates(&self) {
        let handles: Vec<_> = {
            let mut background = self.background.lock().unwrap_or_else(|e| e.into_inner());
            background.drain(..).collect()
        };
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                error!(error = %e, "Background preference update panicked");
            }
        }
    }

    /// Finish background work and close the store.
    pub async fn shutdown(&self) -> Result<(), Error> {
        self.flush_preference_updates().await;
        self.checkpoints.database().close().await?;
        info!("Workflow engine shut down");
        Ok(())
    }

    // ── Node driver ─────────────────────────────────────────────────

    async fn drive(
        &self,
        thread: &mut WorkflowThread,
        version: &mut i64,
    ) -> Result<Outcome, Error> {
        loop {
            let step = match thread.node.clone() {
                Node::Classify => self.classify(thread, version).await?,
                Node::NotifyGate => self.notify_gate(thread, version).await?,
                Node::Decide => self.decide(thread, version).await?,
                Node::Route { tool_call_id } => self.route(thread, version, &tool_call_id).await?,
                Node::Approve { tool_call_id } => {
                    self.approve(thread, version, &tool_call_id).await?
                }
                Node::Act { tool_call_id } => {
                    self.recover_claimed(thread, version, &tool_call_id).await?
                }
                Node::Finalize => self.finalize(thread, version).await?,
                Node::End => Some(terminal_outcome(thread)),
            };
            if let Some(outcome) = step {
                return Ok(outcome);
            }
        }
    }

    async fn classify(
        &self,
        thread: &mut WorkflowThread,
        version: &mut i64,
    ) -> Result<Option<Outcome>, Error> {
        let rules = self.preferences.get(PreferenceKind::Triage).await?;
        let system = build_triage_system_prompt(&self.config.background, &rules);
        let user = build_triage_user_prompt(&thread.email_input);

        let result = match self.reasoning.classify(system, user).await {
            Ok(result) => result,
            Err(LlmError::InvalidResponse { reason, .. }) => {
                let reason = format!("classifier returned no usable answer: {reason}");
                return self.violate(thread, version, reason).await.map(Some);
            }
            Err(e) => return Err(e.into()),
        };
        log_reasoning(&thread.id, &result);

        let classification = match result.parse() {
            Ok(c) => c,
            Err(raw) => {
                let reason = format!("invalid classification '{raw}'");
                return self.violate(thread, version, reason).await.map(Some);
            }
        };
        thread.set_classification(classification);
        thread.node = match classification {
            Classification::Respond => {
                thread
                    .messages
                    .push(ChatMessage::user(respond_kickoff(&thread.email_input)));
                Node::Decide
            }
            Classification::Ignore => Node::Finalize,
            Classification::Notify => Node::NotifyGate,
        };

        info!(
            thread_id = %thread.id,
            classification = %classification,
            node = thread.node.name(),
            "Email classified"
        );
        self.checkpoints.save(thread, version).await?;
        Ok(None)
    }

    async fn notify_gate(
        &self,
        thread: &mut WorkflowThread,
        version: &mut i64,
    ) -> Result<Option<Outcome>, Error> {
        let request = ActionRequest::new(
            NOTIFY_ACTION,
            serde_json::json!({}),
            ActionConfig::notify_gate(),
            thread.email_input.description(),
        );
        self.suspend(thread, version, request).await.map(Some)
    }

    async fn decide(
        &self,
        thread: &mut WorkflowThread,
        version: &mut i64,
    ) -> Result<Option<Outcome>, Error> {
        if thread.iterations >= self.config.max_iterations {
            let reason = format!(
                "no done after {} decide steps",
                self.config.max_iterations
            );
            return self.violate(thread, version, reason).await.map(Some);
        }

        let response_prefs = self.preferences.get(PreferenceKind::Response).await?;
        let calendar_prefs = self.preferences.get(PreferenceKind::Calendar).await?;
        let today = Utc::now().format("%Y-%m-%d").to_string();
        let system = build_agent_system_prompt(
            &self.config.background,
            &response_prefs,
            &calendar_prefs,
            &thread.email_input,
            &today,
        );

        let tools = self.tools.tool_definitions().await;
        let selection = match self
            .reasoning
            .select_tool(system, &thread.messages, tools)
            .await
        {
            Ok(selection) => selection,
            Err(LlmError::InvalidResponse { reason, .. }) => {
                let reason = format!("tool selection returned no usable answer: {reason}");
                return self.violate(thread, version, reason).await.map(Some);
            }
            Err(e) => return Err(e.into()),
        };

        let mut calls = selection.tool_calls.into_iter();
        let Some(selected) = calls.next() else {
            return self
                .violate(thread, version, "decide step selected no tool".to_string())
                .await
                .map(Some);
        };
        let extra: Vec<ToolCall> = calls.collect();

        thread.iterations += 1;
        let mut all_calls = Vec::with_capacity(extra.len() + 1);
        all_calls.push(selected.clone());
        all_calls.extend(extra.iter().cloned());
        thread.messages.push(ChatMessage::assistant_with_tool_calls(
            selection.content,
            all_calls,
        ));
        for call in &extra {
            warn!(thread_id = %thread.id, tool = %call.name, "Dropping extra tool call");
            thread.messages.push(ChatMessage::tool_error(
                &call.id,
                &call.name,
                "Not executed: only one tool call is handled per turn.",
            ));
        }

        if selected.name == DONE {
            thread
                .messages
                .push(ChatMessage::tool_result(&selected.id, &selected.name, "done"));
            thread.node = Node::Finalize;
        } else {
            thread.node = Node::Route {
                tool_call_id: selected.id.clone(),
            };
        }

        info!(
            thread_id = %thread.id,
            tool = %selected.name,
            iteration = thread.iterations,
            "Tool selected"
        );
        self.checkpoints.save(thread, version).await?;
        Ok(None)
    }

    async fn route(
        &self,
        thread: &mut WorkflowThread,
        version: &mut i64,
        tool_call_id: &str,
    ) -> Result<Option<Outcome>, Error> {
        let call = self.selected_call(thread, tool_call_id)?;

        match self.tools.get(&call.name).await {
            Some(tool) if tool.requires_approval() => {
                thread.node = Node::Approve {
                    tool_call_id: call.id,
                };
            }
            Some(_) => {
                info!(thread_id = %thread.id, tool = %call.name, "Running tool without review");
                let message = self.invoke_tool(thread, &call, call.args.clone()).await;
                thread.messages.push(message);
                thread.node = Node::Decide;
            }
            None => {
                warn!(thread_id = %thread.id, tool = %call.name, "Unknown tool selected");
                let err = ToolError::NotFound {
                    name: call.name.clone(),
                };
                thread
                    .messages
                    .push(ChatMessage::tool_error(&call.id, &call.name, err.to_string()));
                thread.node = Node::Decide;
            }
        }

        self.checkpoints.save(thread, version).await?;
        Ok(None)
    }

    async fn approve(
        &self,
        thread: &mut WorkflowThread,
        version: &mut i64,
        tool_call_id: &str,
    ) -> Result<Option<Outcome>, Error> {
        let call = self.selected_call(thread, tool_call_id)?;
        let accepts_edits = match self.tools.get(&call.name).await {
            Some(tool) => tool.accepts_edits(),
            None => false,
        };
        let request = ActionRequest::new(
            call.name,
            call.args,
            ActionConfig::tool_review(accepts_edits),
            thread.email_input.description(),
        );
        self.suspend(thread, version, request).await.map(Some)
    }

    /// A decision was claimed for this call but its result never recorded.
    /// The call may or may not have run, so it is not run again.
    async fn recover_claimed(
        &self,
        thread: &mut WorkflowThread,
        version: &mut i64,
        tool_call_id: &str,
    ) -> Result<Option<Outcome>, Error> {
        let name = thread
            .find_tool_call(tool_call_id)
            .map(|c| c.name.clone())
            .unwrap_or_default();
        warn!(thread_id = %thread.id, tool = %name, "Approved call has no recorded result");
        thread.messages.push(ChatMessage::tool_error(
            tool_call_id,
            &name,
            "Outcome unknown: processing stopped after this call was approved and before its \
             result was recorded. Do not assume it succeeded and do not repeat it.",
        ));
        thread.node = Node::Decide;
        self.checkpoints.save(thread, version).await?;
        Ok(None)
    }

    async fn finalize(
        &self,
        thread: &mut WorkflowThread,
        version: &mut i64,
    ) -> Result<Option<Outcome>, Error> {
        self.mailbox
            .mark_read(&thread.user_id, &thread.email_input.id)
            .await?;
        thread.complete();
        info!(
            thread_id = %thread.id,
            classification = ?thread.classification,
            "Workflow completed"
        );
        self.checkpoints.save(thread, version).await?;
        Ok(Some(terminal_outcome(thread)))
    }

    // ── Shared helpers ──────────────────────────────────────────────

    async fn suspend(
        &self,
        thread: &mut WorkflowThread,
        version: &mut i64,
        request: ActionRequest,
    ) -> Result<Outcome, Error> {
        info!(
            thread_id = %thread.id,
            node = thread.node.name(),
            request_id = %request.request_id,
            action = %request.action,
            "Thread suspended for review"
        );
        thread.suspend(request.clone());
        self.checkpoints.save(thread, version).await?;
        Ok(Outcome::Suspended(request))
    }

    /// Mark the thread failed for a broken oracle or decision contract.
    pub(super) async fn violate(
        &self,
        thread: &mut WorkflowThread,
        version: &mut i64,
        reason: String,
    ) -> Result<Outcome, Error> {
        warn!(thread_id = %thread.id, node = thread.node.name(), reason = %reason, "Contract violation");
        thread.fail(reason);
        self.checkpoints.save(thread, version).await?;
        Ok(terminal_outcome(thread))
    }

    pub(super) fn selected_call(
        &self,
        thread: &WorkflowThread,
        tool_call_id: &str,
    ) -> Result<ToolCall, Error> {
        thread.find_tool_call(tool_call_id).cloned().ok_or_else(|| {
            WorkflowError::CorruptCheckpoint {
                id: thread.id.clone(),
                reason: format!("tool call {tool_call_id} is not in the message log"),
            }
            .into()
        })
    }

    /// Run a tool and turn its result into a tool message. Failures become
    /// error messages so the decide loop can pick another action.
    pub(super) async fn invoke_tool(
        &self,
        thread: &WorkflowThread,
        call: &ToolCall,
        args: serde_json::Value,
    ) -> ChatMessage {
        let ctx = ToolContext::new(&thread.id, &thread.user_id, &thread.email_input.id)
            .with_mail_thread(thread.email_input.thread_id.clone());

        let result = match self.tools.get(&call.name).await {
            Some(tool) => tool.execute(args, &ctx).await,
            None => Err(ToolError::NotFound {
                name: call.name.clone(),
            }),
        };

        match result {
            Ok(output) => {
                info!(
                    thread_id = %thread.id,
                    tool = %call.name,
                    elapsed_ms = output.duration.as_millis() as u64,
                    "Tool executed"
                );
                ChatMessage::tool_result(&call.id, &call.name, output.to_message_content())
            }
            Err(e) => {
                warn!(thread_id = %thread.id, tool = %call.name, error = %e, "Tool failed");
                ChatMessage::tool_error(&call.id, &call.name, format!("Error: {e}"))
            }
        }
    }

    /// Learn from feedback in the background. Failures are logged only.
    pub(super) fn spawn_preference_update(
        &self,
        thread_id: &str,
        kind: PreferenceKind,
        feedback: Vec<ChatMessage>,
    ) {
        let preferences = Arc::clone(&self.preferences);
        let thread_id = thread_id.to_string();
        let handle = tokio::spawn(async move {
            if let Err(e) = preferences.update(kind, feedback).await {
                error!(
                    thread_id = %thread_id,
                    namespace = %preferences.namespace(kind),
                    error = %e,
                    "Background preference update failed"
                );
            }
        });

        let mut background = self.background.lock().unwrap_or_else(|e| e.into_inner());
        background.retain(|h| !h.is_finished());
        background.push(handle);
    }
}

fn terminal_outcome(thread: &WorkflowThread) -> Outcome {
    thread.outcome().unwrap_or_else(|| Outcome::Failed {
        reason: format!("thread ended while {}", thread.status),
    })
}

fn not_suspended(thread: &WorkflowThread) -> Error {
    WorkflowError::NotSuspended {
        id: thread.id.clone(),
        status: thread.status.to_string(),
    }
    .into()
}
