//! One-shot intake: fetch unread mail and start a thread per new item.

use futures::future::join_all;
use tracing::{info, warn};

use crate::agent::{Outcome, ThreadStatus, WorkflowEngine};
use crate::channels::MailboxProvider;
use crate::error::Error;

/// What an intake pass did.
#[derive(Debug, Default)]
pub struct IntakeReport {
    /// Items whose thread is suspended or finished.
    pub skipped: Vec<String>,
    /// Items whose thread was left running by an earlier failure and was
    /// driven again. Their outcome is listed under `started` or `failed`.
    pub retried: Vec<String>,
    /// `(item_id, thread_id, outcome)` per started thread.
    pub started: Vec<(String, String, Outcome)>,
    /// Items whose start failed, with the error text.
    pub failed: Vec<(String, String)>,
}

impl IntakeReport {
    pub fn suspended(&self) -> usize {
        self.started
            .iter()
            .filter(|(_, _, outcome)| matches!(outcome, Outcome::Suspended(_)))
            .count()
    }
}

/// Fetch `user_id`'s unread items and start their threads concurrently.
///
/// Items whose thread is suspended or finished are skipped. A thread still
/// RUNNING was interrupted by a transient failure and is retried. A failed
/// start is reported per item and does not stop the others.
pub async fn process_unread(
    engine: &WorkflowEngine,
    mailbox: &dyn MailboxProvider,
    user_id: &str,
) -> Result<IntakeReport, Error> {
    let items = mailbox.fetch_unread(user_id).await?;
    let mut report = IntakeReport::default();

    let mut work = Vec::with_capacity(items.len());
    for item in items {
        let Some(thread_id) = engine.thread_for_item(&item.user_id, &item.id).await? else {
            work.push(item);
            continue;
        };
        let thread = engine.get_thread(&thread_id).await?;
        if thread.status == ThreadStatus::Running {
            report.retried.push(item.id.clone());
            work.push(item);
        } else {
            report.skipped.push(item.id);
        }
    }

    // `start_workflow` retries an item's existing thread instead of
    // starting a second one.
    let starts = work.into_iter().map(|item| async move {
        let item_id = item.id.clone();
        (item_id, engine.start_workflow(item).await)
    });

    for (item_id, result) in join_all(starts).await {
        match result {
            Ok((thread_id, outcome)) => report.started.push((item_id, thread_id, outcome)),
            Err(e) => {
                warn!(item_id = %item_id, error = %e, "Failed to start workflow");
                report.failed.push((item_id, e.to_string()));
            }
        }
    }

    info!(
        user_id,
        started = report.started.len(),
        suspended = report.suspended(),
        skipped = report.skipped.len(),
        retried = report.retried.len(),
        failed = report.failed.len(),
        "Intake pass finished"
    );
    Ok(report)
}
