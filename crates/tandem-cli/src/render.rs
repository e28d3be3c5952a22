//! Terminal rendering of notifications and saved sessions

use std::io::Write;

use console::style;
use serde_json::Value;

use tandem_core::notify::Notification;
use tandem_core::session::{AgentSessionRecord, AgentSessionView, TranscriptEntry, TranscriptRole};
use tandem_core::{AgentStatus, PtyStatus};

pub fn notification(notification: &Notification) {
    match notification {
        Notification::PtyOutput { data, .. } => {
            print!("{}", data);
            let _ = std::io::stdout().flush();
        }
        Notification::PtyStatus {
            status,
            exit_code,
            error,
            ..
        } => match status {
            PtyStatus::Exited => println!(
                "{}",
                style(format!("Shell exited (code {})", exit_code.map_or("?".to_string(), |c| c.to_string())))
                    .dim()
            ),
            PtyStatus::Error => println!(
                "{}",
                style(format!("Terminal error: {}", error.as_deref().unwrap_or("unknown"))).red()
            ),
            _ => {}
        },
        Notification::PtyClosed { .. } | Notification::AgentUserMessage { .. } => {}
        Notification::AgentStatus { status, error, .. } => {
            if *status == AgentStatus::Error {
                if let Some(error) = error {
                    println!("{}", style(format!("Session error: {}", error)).red());
                }
            }
        }
        Notification::AgentInit { resume_id, model, .. } => {
            tracing::debug!(resume_id = %resume_id, "Conversation started");
            if let Some(model) = model {
                println!("{}", style(format!("[{}]", model)).dim());
            }
        }
        Notification::AgentCompaction { pre_tokens, .. } => {
            let detail = pre_tokens.map(|t| format!(" ({} tokens before)", t)).unwrap_or_default();
            println!("{}", style(format!("Conversation compacted{}", detail)).yellow());
        }
        Notification::AgentAssistant { message, .. } => assistant(message),
        Notification::AgentResult {
            is_error,
            result,
            cost_usd,
            total_cost_usd,
            ..
        } => {
            if *is_error {
                let reason = result.as_deref().unwrap_or("turn failed");
                println!("{}", style(format!("Error: {}", reason)).red());
            }
            println!(
                "{}",
                style(format!("${:.4} (total ${:.4})", cost_usd, total_cost_usd)).dim()
            );
        }
        Notification::AgentToolProgress {
            tool_name,
            elapsed_seconds,
            ..
        } => {
            println!("{}", style(format!("  {} running {:.0}s", tool_name, elapsed_seconds)).dim());
        }
        Notification::AgentError { message, .. } => {
            println!("{}", style(format!("Error: {}", message)).red());
        }
        Notification::AgentClosed { .. } => println!("{}", style("Session closed").dim()),
        Notification::AgentUsage { .. } | Notification::AgentDelta { .. } | Notification::AgentRaw { .. } => {}
    }
}

/// Text blocks print as-is, tool calls as a one-line summary
fn assistant(message: &Value) {
    let content = message
        .get("content")
        .or_else(|| message.pointer("/message/content"))
        .and_then(Value::as_array);
    let Some(blocks) = content else { return };

    for block in blocks {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(text) = block.get("text").and_then(Value::as_str) {
                    println!("{}", text);
                }
            }
            Some("tool_use") => {
                let name = block.get("name").and_then(Value::as_str).unwrap_or("tool");
                println!("{} {}", style("▶").cyan(), style(name).cyan().bold());
            }
            _ => {}
        }
    }
}

pub fn session(view: &AgentSessionView) {
    println!("  Status: {}", style(format!("{:?}", view.status)).cyan());
    println!("  Conversation: {}", view.resume_id.as_deref().unwrap_or("(not started)"));
    println!("  Directory: {}", view.cwd.display());
    if let Some(model) = &view.model {
        println!("  Model: {}", model);
    }
    println!(
        "  Turns: {}  Tokens: {} in / {} out  Cost: ${:.4}",
        view.turns, view.input_tokens, view.output_tokens, view.total_cost_usd
    );
}

pub fn record(record: &AgentSessionRecord) {
    println!(
        "  {} {} {} {}",
        style(&record.id).cyan(),
        style(format!("{:?}", record.status)).dim(),
        record.updated_at.format("%Y-%m-%d %H:%M"),
        style(record.cwd.display()).dim()
    );
}

pub fn transcript_entry(entry: &TranscriptEntry) {
    match entry.role {
        TranscriptRole::User => println!("{} {}", style(">").green().bold(), entry.content),
        TranscriptRole::Assistant => println!("{}", entry.content),
        _ => println!(
            "{} {}",
            style("▶").cyan(),
            style(entry.tool_name.as_deref().unwrap_or(&entry.content)).cyan()
        ),
    }
}
