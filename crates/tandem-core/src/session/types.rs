//! Agent session types
//!
//! These types are the surface front-ends see: creation options, send
//! options and outcomes, snapshots, and the optional external listener.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::CredentialProfile;
use crate::stream::ResultEvent;

/// Unique identifier for an agent session
pub type SessionId = String;

/// Status of an agent session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Ready for the next message
    Idle,
    /// A turn is in flight
    Streaming,
    /// The last spawn or stream failed
    Error,
}

/// Options for [`AgentRegistry::create`](super::AgentRegistry::create)
#[derive(Debug, Clone, Default)]
pub struct CreateAgentOptions {
    /// Free-form kind tag; the configured default when `None`
    pub kind: Option<String>,
    /// Working directory; derived from the session id when `None`
    pub cwd: Option<PathBuf>,
    /// Conversation to resume on the first send
    pub resume_id: Option<String>,
    pub model: Option<String>,
}

/// Per-send options for a cold-path spawn
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendOptions {
    pub model: Option<String>,
    pub max_turns: Option<u32>,
}

/// What happened to a message handed to `send_message`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Pushed onto the live stream; no process was spawned
    Pushed,
    /// A new process and stream were started for it
    Spawned,
    /// Starting the stream failed; the session is in `error` status
    Failed { message: String },
}

impl SendOutcome {
    pub fn is_delivered(&self) -> bool {
        !matches!(self, Self::Failed { .. })
    }
}

/// Credential profile identity captured when a session is created
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileSnapshot {
    pub id: Option<String>,
    pub base_url: Option<String>,
}

impl ProfileSnapshot {
    pub fn capture(profile: Option<&CredentialProfile>) -> Self {
        Self {
            id: profile.map(|p| p.id.clone()),
            base_url: profile.and_then(|p| p.base_url.clone()),
        }
    }

    /// Whether `current` differs from this snapshot.
    ///
    /// Compares base URLs when one was recorded, otherwise profile ids.
    pub fn differs_from(&self, current: Option<&CredentialProfile>) -> bool {
        let current = Self::capture(current);
        match &self.base_url {
            Some(base_url) => current.base_url.as_ref() != Some(base_url),
            None => current.id != self.id,
        }
    }
}

/// Snapshot of an agent session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentSessionView {
    pub id: SessionId,
    pub kind: String,
    pub status: AgentStatus,
    pub resume_id: Option<String>,
    pub cwd: PathBuf,
    pub model: Option<String>,
    pub pid: Option<u32>,
    /// A bridge and stream are attached; the next send is a push
    pub has_live_stream: bool,
    pub total_cost_usd: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub turns: u64,
    pub profile: ProfileSnapshot,
    pub transcript_len: usize,
    pub created_at: DateTime<Utc>,
}

/// Result of [`AgentRegistry::reopen`](super::AgentRegistry::reopen)
#[derive(Debug, Clone, PartialEq)]
pub struct ReopenResult {
    pub session: AgentSessionView,
    /// The active credential profile is not the one the session was created with
    pub profile_changed: bool,
}

/// External observer of completed turns and failures (e.g. a chat relay).
///
/// Panics inside a listener are caught and logged by the dispatch loop.
pub trait SessionListener: Send + Sync {
    fn on_result(&self, _session_id: &str, _result: &ResultEvent) {}

    fn on_error(&self, _session_id: &str, _message: &str) {}
}
