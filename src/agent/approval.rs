//! Approval flow: applies a human decision at a suspension point.

use tracing::info;

use crate::agent::thread::{ActionRequest, Decision, DecisionType, Node, Outcome, WorkflowThread};
use crate::error::{Error, WorkflowError};
use crate::llm::{ChatMessage, ToolCall};
use crate::memory::PreferenceKind;
use crate::tools::builtin::{QUESTION, SCHEDULE_MEETING, SEND_EMAIL};

use super::engine::WorkflowEngine;

impl WorkflowEngine {
    /// Apply `decision` to the request the thread is suspended on.
    ///
    /// Returns `Some` when the decision ends the thread, `None` when the
    /// driver should carry on from the node the decision moved to. The
    /// caller has already checked the request id and the request's config.
    pub(super) async fn apply_decision(
        &self,
        thread: &mut WorkflowThread,
        version: &mut i64,
        pending: &ActionRequest,
        decision: &Decision,
    ) -> Result<Option<Outcome>, Error> {
        match thread.node.clone() {
            Node::NotifyGate => self.apply_notify_decision(thread, version, decision).await,
            Node::Approve { tool_call_id } => {
                self.apply_review_decision(thread, version, pending, decision, &tool_call_id)
                    .await
            }
            other => Err(WorkflowError::CorruptCheckpoint {
                id: thread.id.clone(),
                reason: format!("suspended at node '{}'", other.name()),
            }
            .into()),
        }
    }

    async fn apply_notify_decision(
        &self,
        thread: &mut WorkflowThread,
        version: &mut i64,
        decision: &Decision,
    ) -> Result<Option<Outcome>, Error> {
        let notice = ChatMessage::user(format!(
            "Email to notify user about: {}",
            thread.email_input.description()
        ));

        let (note, feedback, next) = match decision.kind {
            DecisionType::Response => {
                let reply = ChatMessage::user(format!(
                    "User wants to reply to the email. Use this feedback to respond: {}",
                    decision.feedback()
                ));
                let feedback = vec![
                    ChatMessage::user(
                        "The user decided to respond to the email, so update the triage \
                         preferences to capture this.",
                    ),
                    notice.clone(),
                    reply.clone(),
                ];
                (reply, feedback, Node::Decide)
            }
            DecisionType::Ignore => {
                let note = ChatMessage::user(
                    "The user decided to ignore the email even though it was classified as \
                     notify. Update triage preferences to capture this.",
                );
                let feedback = vec![notice.clone(), note.clone()];
                (note, feedback, Node::Finalize)
            }
            other => {
                let reason = format!("notify gate cannot take decision '{}'", other.as_str());
                return self.violate(thread, version, reason).await.map(Some);
            }
        };

        // Learn first: a failed rewrite leaves the thread suspended.
        self.preferences
            .update(PreferenceKind::Triage, feedback)
            .await?;

        thread.resolve_pending();
        thread.messages.push(notice);
        thread.messages.push(note);
        thread.node = next;
        info!(
            thread_id = %thread.id,
            decision = decision.kind.as_str(),
            node = thread.node.name(),
            "Notify decision applied"
        );
        self.checkpoints.save(thread, version).await?;
        Ok(None)
    }

    async fn apply_review_decision(
        &self,
        thread: &mut WorkflowThread,
        version: &mut i64,
        pending: &ActionRequest,
        decision: &Decision,
        tool_call_id: &str,
    ) -> Result<Option<Outcome>, Error> {
        let call = self.selected_call(thread, tool_call_id)?;
        let kind = match self.tools.get(&call.name).await {
            Some(tool) => tool.preference_kind(),
            None => None,
        };

        match decision.kind {
            DecisionType::Accept => {
                self.claim(thread, version, &call).await?;
                let result = self.invoke_tool(thread, &call, call.args.clone()).await;
                thread.messages.push(result);
                thread.node = Node::Decide;
                self.checkpoints.save(thread, version).await?;
            }
            DecisionType::Edit => {
                let Some(edited) = decision.edited_args() else {
                    let reason = "edit decision carries no argument object".to_string();
                    return self.violate(thread, version, reason).await.map(Some);
                };
                thread.replace_tool_call_args(&call.id, edited.clone());
                self.claim(thread, version, &call).await?;
                let result = self.invoke_tool(thread, &call, edited.clone()).await;
                thread.messages.push(result);
                thread.node = Node::Decide;
                self.checkpoints.save(thread, version).await?;

                if let Some(kind) = kind {
                    let feedback = vec![
                        ChatMessage::user(format!(
                            "Email being handled: {}",
                            pending.description
                        )),
                        ChatMessage::user(edit_feedback(&call, &edited)),
                    ];
                    self.spawn_preference_update(&thread.id, kind, feedback);
                }
            }
            DecisionType::Ignore => {
                let refusal = ignore_message(&call.name);
                let feedback = vec![
                    ChatMessage::user(format!("Email being handled: {}", pending.description)),
                    ChatMessage::user(format!(
                        "The user ignored the {} action. Emails like this one should not be \
                         classified as respond. Update triage preferences to capture this.",
                        call.name
                    )),
                ];
                self.preferences
                    .update(PreferenceKind::Triage, feedback)
                    .await?;

                thread.resolve_pending();
                thread
                    .messages
                    .push(ChatMessage::tool_result(&call.id, &call.name, refusal));
                thread.complete();
                info!(
                    thread_id = %thread.id,
                    tool = %call.name,
                    "Action ignored, workflow ended"
                );
                self.checkpoints.save(thread, version).await?;
                return Ok(thread.outcome());
            }
            DecisionType::Response => {
                let content = response_message(&call.name, &decision.feedback());
                if let Some(kind) = kind {
                    let feedback = vec![
                        ChatMessage::user(format!("Email being handled: {}", pending.description)),
                        ChatMessage::user(format!(
                            "The user reviewed this {} call: {}\n{content}",
                            call.name, call.args
                        )),
                    ];
                    self.preferences.update(kind, feedback).await?;
                }

                thread.resolve_pending();
                thread
                    .messages
                    .push(ChatMessage::tool_result(&call.id, &call.name, content));
                thread.node = Node::Decide;
                self.checkpoints.save(thread, version).await?;
            }
        }

        info!(
            thread_id = %thread.id,
            tool = %call.name,
            decision = decision.kind.as_str(),
            "Review decision applied"
        );
        Ok(None)
    }

    /// Record that the pending call is about to run. Once this is persisted
    /// the call is never started again for this decision.
    async fn claim(
        &self,
        thread: &mut WorkflowThread,
        version: &mut i64,
        call: &ToolCall,
    ) -> Result<(), Error> {
        thread.resolve_pending();
        thread.node = Node::Act {
            tool_call_id: call.id.clone(),
        };
        self.checkpoints.save(thread, version).await?;
        Ok(())
    }
}

fn ignore_message(tool: &str) -> String {
    match tool {
        SEND_EMAIL => "User ignored this email draft. Ignore this email and end the workflow.",
        SCHEDULE_MEETING => {
            "User ignored this calendar meeting draft. Ignore this email and end the workflow."
        }
        QUESTION => "User ignored this question. Ignore this email and end the workflow.",
        _ => "User ignored this action. Ignore this email and end the workflow.",
    }
    .to_string()
}

fn response_message(tool: &str, feedback: &str) -> String {
    match tool {
        SEND_EMAIL => {
            format!("User gave feedback to fold into the reply. Feedback: {feedback}")
        }
        SCHEDULE_MEETING => {
            format!("User gave feedback to fold into the meeting request. Feedback: {feedback}")
        }
        QUESTION => format!(
            "User answered the question; use the answer for any follow-up. Answer: {feedback}"
        ),
        _ => format!("User gave feedback on this action. Feedback: {feedback}"),
    }
}

fn edit_feedback(call: &ToolCall, edited: &serde_json::Value) -> String {
    format!(
        "The user edited the {name} call before it ran.\n\
         Original arguments: {original}\n\
         Edited arguments: {edited}\n\
         Capture the preference this edit reveals and keep everything else unchanged.",
        name = call.name,
        original = call.args,
    )
}
