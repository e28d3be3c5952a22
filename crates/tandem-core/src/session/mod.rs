//! Streaming agent sessions
//!
//! An agent session wraps one conversation with the assistant CLI over the
//! stream-json protocol. Key components:
//!
//! - `AgentRegistry`: owns the sessions and their live streams
//! - `MessageBridge`: buffers user turns until the CLI pulls them
//! - the dispatch loop: one per live stream, turns events into notifications
//! - `SessionStore`: persistence of records and transcripts
//!
//! # Architecture
//!
//! ```text
//! send_message ──▶ [live stream?] ──yes──▶ bridge.push ─────────────┐
//!                       │                                           │
//!                       no                                          ▼
//!                       └──▶ spawn CLI ──▶ bridge ──▶ stdin    [CLI process]
//!                                                                   │
//!          notifications ◀── dispatch loop ◀── stream events ◀──────┘
//! ```

mod dispatch;
mod message;
pub mod persistence;
mod registry;
mod types;

pub use message::{Attachment, NormalizedMessage, OutgoingMessage, normalize};
pub use persistence::{
    AgentSessionRecord, JsonFileStore, MemoryStore, RecordStatus, SessionStore, TranscriptEntry,
    TranscriptRole,
};
pub use registry::{AgentRegistry, COMPACT_COMMAND, unpack_archive_path};
pub use types::{
    AgentSessionView, AgentStatus, CreateAgentOptions, ProfileSnapshot, ReopenResult,
    SendOptions, SendOutcome, SessionId, SessionListener,
};
