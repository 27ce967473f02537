use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};

use inbox_agent::agent::{Decision, Outcome, WorkflowEngine};
use inbox_agent::channels::{DryRunMailbox, MailboxProvider};
use inbox_agent::config::{EngineConfig, StoreConfig};
use inbox_agent::llm::{LlmConfig, create_provider};
use inbox_agent::pipeline::{EmailInput, process_unread};
use inbox_agent::store::{Database, LibSqlBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_tracing();

    let inbox_path = std::env::args().nth(1).map(PathBuf::from).unwrap_or_else(|| {
        eprintln!("Usage: inbox-agent <emails.json>");
        eprintln!("  The file holds one email object or an array of them.");
        std::process::exit(2);
    });
    let inbox = load_inbox(&inbox_path)?;

    let engine_config = EngineConfig::from_env()?;
    let store_config = StoreConfig::from_env();
    let llm_config = LlmConfig::from_env()?;

    eprintln!("📬 Inbox Agent v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", llm_config.model);
    eprintln!("   Database: {}", store_config.db_path.display());
    eprintln!("   Inbox: {} email(s) from {}", inbox.len(), inbox_path.display());

    let llm = create_provider(&llm_config)?;

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&store_config.db_path)
            .await
            .with_context(|| {
                format!("failed to open database at {}", store_config.db_path.display())
            })?,
    );

    // ── Engine ───────────────────────────────────────────────────────────
    let mut users: Vec<String> = inbox.iter().map(|e| e.user_id.clone()).collect();
    users.sort();
    users.dedup();

    let mailbox = Arc::new(DryRunMailbox::new(inbox));
    let engine = WorkflowEngine::new(
        engine_config,
        db,
        llm,
        Arc::clone(&mailbox) as Arc<dyn MailboxProvider>,
    );
    eprintln!("   Tools: {} registered\n", engine.tools().count());

    for user in &users {
        let report = process_unread(&engine, mailbox.as_ref(), user).await?;
        for (item_id, error) in &report.failed {
            eprintln!("   ✗ {item_id}: {error}");
        }
        for (item_id, thread_id, outcome) in &report.started {
            print_outcome(item_id, thread_id, outcome);
        }
    }

    review_loop(&engine).await?;

    engine.shutdown().await?;
    Ok(())
}

/// Retry interrupted threads, then walk pending threads and resume each
/// with a decision read from stdin.
async fn review_loop(engine: &WorkflowEngine) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    for thread in engine.running_threads().await? {
        match engine.retry(&thread.id).await {
            Ok(outcome) => print_outcome(&thread.email_input.id, &thread.id, &outcome),
            Err(e) => eprintln!("   ✗ {} still running: {e}", thread.id),
        }
    }

    loop {
        let pending = engine.pending_threads().await?;
        let Some(next) = pending.into_iter().next() else {
            eprintln!("No threads awaiting review.");
            return Ok(());
        };

        println!("\n── {} ({}) ──", next.subject, next.thread_id);
        println!("{}", serde_json::to_string_pretty(&next.request)?);
        eprintln!(
            "Decision JSON, e.g. {{\"type\": \"accept\"}} or {{\"type\": \"response\", \"args\": \"...\"}}. \
             Empty line to stop."
        );

        let Some(line) = lines.next_line().await? else {
            return Ok(());
        };
        let line = line.trim();
        if line.is_empty() || line == "/quit" {
            return Ok(());
        }

        // The reviewer answers the request printed above.
        let decision: Decision = match serde_json::from_str::<Decision>(line) {
            Ok(d) if d.request_id.is_none() => d.for_request(&next.request.request_id),
            Ok(d) => d,
            Err(e) => {
                eprintln!("Invalid decision: {e}");
                continue;
            }
        };
        match engine.resume(&next.thread_id, decision).await {
            Ok(outcome) => print_outcome(&next.item_id, &next.thread_id, &outcome),
            Err(e) if e.is_retryable() => eprintln!("Transient failure, try again: {e}"),
            Err(e) => return Err(e.into()),
        }
    }
}

fn print_outcome(item_id: &str, thread_id: &str, outcome: &Outcome) {
    match outcome {
        Outcome::Completed { classification } => {
            let label = classification.map(|c| c.to_string()).unwrap_or_default();
            println!("✓ {item_id} [{thread_id}] completed ({label})");
        }
        Outcome::Suspended(request) => {
            println!("⏸ {item_id} [{thread_id}] waiting on {}", request.action);
        }
        Outcome::Failed { reason } => {
            println!("✗ {item_id} [{thread_id}] failed: {reason}");
        }
    }
}

fn load_inbox(path: &PathBuf) -> anyhow::Result<Vec<EmailInput>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let value: serde_json::Value =
        serde_json::from_str(&raw).with_context(|| format!("{} is not JSON", path.display()))?;
    let inbox = if value.is_array() {
        serde_json::from_value(value)?
    } else {
        vec![serde_json::from_value(value)?]
    };
    Ok(inbox)
}

/// Log to stderr, or to a daily file under `INBOX_AGENT_LOG_DIR` when set.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    match std::env::var("INBOX_AGENT_LOG_DIR") {
        Ok(dir) if !dir.trim().is_empty() => {
            let appender = tracing_appender::rolling::daily(dir, "inbox-agent.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_target(false)
                .init();
            None
        }
    }
}
