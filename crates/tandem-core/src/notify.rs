//! Observer notifications
//!
//! Everything the registries report to the front-end goes through one
//! fire-and-forget [`Notifier`]. A torn-down observer must never surface as
//! an error in the session state machines.

use serde::Serialize;
use serde_json::Value;
use tandem_process::TerminationOutcome;
use tokio::sync::mpsc;
use tracing::trace;

use crate::pty::PtyStatus;
use crate::session::AgentStatus;

/// A notification for the observer, one variant per channel
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    /// Raw terminal output
    PtyOutput { session_id: String, data: String },
    /// Terminal session status change
    PtyStatus {
        session_id: String,
        status: PtyStatus,
        exit_code: Option<i32>,
        error: Option<String>,
    },
    /// Terminal session removed from the registry
    PtyClosed {
        session_id: String,
        outcome: TerminationOutcome,
    },
    /// Agent session status change
    AgentStatus {
        session_id: String,
        status: AgentStatus,
        /// The child process is gone; the next send takes the cold path
        process_exited: bool,
        error: Option<String>,
    },
    /// Echo of a user turn in its display form
    AgentUserMessage {
        session_id: String,
        id: String,
        content: String,
    },
    /// Capability metadata from the stream's init event
    AgentInit {
        session_id: String,
        resume_id: String,
        model: Option<String>,
        tools: Vec<String>,
        slash_commands: Vec<String>,
        mcp_servers: Value,
    },
    /// Conversation was compacted
    AgentCompaction {
        session_id: String,
        trigger: Option<String>,
        pre_tokens: Option<u64>,
    },
    /// Full structured content of an assistant turn
    AgentAssistant { session_id: String, message: Value },
    /// Token usage reported with an assistant turn
    AgentUsage { session_id: String, usage: Value },
    /// Incremental delta, superseded by the next assistant turn
    AgentDelta { session_id: String, event: Value },
    /// Turn result metadata
    AgentResult {
        session_id: String,
        subtype: String,
        is_error: bool,
        num_turns: Option<u64>,
        duration_ms: Option<u64>,
        cost_usd: f64,
        total_cost_usd: f64,
        result: Option<String>,
    },
    /// Elapsed-time heartbeat of a running tool
    AgentToolProgress {
        session_id: String,
        tool_use_id: String,
        tool_name: String,
        elapsed_seconds: f64,
    },
    /// Stream event with an unrecognized tag, passed through verbatim
    AgentRaw { session_id: String, payload: Value },
    /// Human-readable failure
    AgentError { session_id: String, message: String },
    /// Agent session removed from the registry
    AgentClosed { session_id: String },
}

impl Notification {
    /// Channel name for transports that route by string
    pub fn channel(&self) -> &'static str {
        match self {
            Self::PtyOutput { .. } => "pty:output",
            Self::PtyStatus { .. } => "pty:status",
            Self::PtyClosed { .. } => "pty:closed",
            Self::AgentStatus { .. } => "agent:status",
            Self::AgentUserMessage { .. } => "agent:user-message",
            Self::AgentInit { .. } => "agent:init",
            Self::AgentCompaction { .. } => "agent:compaction",
            Self::AgentAssistant { .. } => "agent:assistant",
            Self::AgentUsage { .. } => "agent:usage",
            Self::AgentDelta { .. } => "agent:delta",
            Self::AgentResult { .. } => "agent:result",
            Self::AgentToolProgress { .. } => "agent:tool-progress",
            Self::AgentRaw { .. } => "agent:raw",
            Self::AgentError { .. } => "agent:error",
            Self::AgentClosed { .. } => "agent:closed",
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            Self::PtyOutput { session_id, .. }
            | Self::PtyStatus { session_id, .. }
            | Self::PtyClosed { session_id, .. }
            | Self::AgentStatus { session_id, .. }
            | Self::AgentUserMessage { session_id, .. }
            | Self::AgentInit { session_id, .. }
            | Self::AgentCompaction { session_id, .. }
            | Self::AgentAssistant { session_id, .. }
            | Self::AgentUsage { session_id, .. }
            | Self::AgentDelta { session_id, .. }
            | Self::AgentResult { session_id, .. }
            | Self::AgentToolProgress { session_id, .. }
            | Self::AgentRaw { session_id, .. }
            | Self::AgentError { session_id, .. }
            | Self::AgentClosed { session_id } => session_id,
        }
    }
}

/// Fire-and-forget sink for notifications
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Type alias for the receiving end of a [`ChannelNotifier`]
pub type NotificationReceiver = mpsc::UnboundedReceiver<Notification>;

/// Forwards notifications into a channel; a dropped receiver is ignored
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, NotificationReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, notification: Notification) {
        if self.tx.send(notification).is_err() {
            trace!("Notification dropped, observer is gone");
        }
    }
}

/// Discards every notification
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn notify(&self, _notification: Notification) {}
}
