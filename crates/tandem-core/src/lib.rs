//! Tandem Core - Session lifecycle orchestration for the assistant CLI
//!
//! This crate drives many concurrent conversations with a CLI-based
//! assistant, in two flavors:
//! - PTY sessions: the CLI runs inside an interactive shell on a
//!   pseudo-terminal
//! - Agent sessions: a long-lived CLI process driven over the stream-json
//!   protocol, with a background dispatch loop per live stream
//!
//! The two registries share an occupancy guard so one resumable
//! conversation is never driven from both sides at once.

pub mod bridge;
pub mod config;
pub mod env;
pub mod error;
pub mod guard;
pub mod notify;
pub mod pty;
pub mod session;
pub mod stream;
pub mod testing;

pub use bridge::{BridgeReceiver, MessageBridge};
pub use config::{Config, ConfigManager, CredentialProfile};
pub use env::{EnvironmentBuilder, ProfileEnvironment, ProfileSource, StaticProfiles};
pub use error::{Error, ErrorKind, Result};
pub use guard::{OccupancyGuard, OccupancyProbe, link};
pub use notify::{ChannelNotifier, Notification, NotificationReceiver, Notifier, NullNotifier};

// PTY exports
pub use pty::{
    CreatePtyOptions, NativePtyBackend, PtyBackend, PtyRegistry, PtySessionView, PtyStatus,
    Visibility,
};

// Agent session exports
pub use session::{
    AgentRegistry, AgentSessionView, AgentStatus, CreateAgentOptions, JsonFileStore, MemoryStore,
    OutgoingMessage, ReopenResult, SendOptions, SendOutcome, SessionListener, SessionStore,
};

// Streaming protocol exports
pub use stream::{CliProtocol, QueryControl, QueryOptions, StreamEvent, StreamingProtocol};

pub use tandem_process::{EscalationPolicy, TerminationOutcome};
