//! Types for terminal-style sessions

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Lifecycle of a PTY session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PtyStatus {
    /// Created, no process yet
    Starting,
    Running,
    Exited,
    /// Spawn failed or start was refused
    Error,
}

impl PtyStatus {
    /// Whether the session holds (or is about to hold) a live process
    pub fn is_live(self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    #[default]
    Foreground,
    Background,
}

/// Options for [`PtyRegistry::create`](super::PtyRegistry::create)
#[derive(Debug, Clone, Default)]
pub struct CreatePtyOptions {
    pub project_id: Option<String>,
    pub title: Option<String>,
    pub cwd: PathBuf,
    /// Conversation to resume when the assistant is launched
    pub resume_id: Option<String>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
}

/// Snapshot of a PTY session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PtySessionView {
    pub id: String,
    pub project_id: Option<String>,
    pub title: String,
    pub cwd: PathBuf,
    pub resume_id: Option<String>,
    pub status: PtyStatus,
    pub pid: Option<u32>,
    pub visibility: Visibility,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
}
