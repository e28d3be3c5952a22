//! Terminal-style sessions
//!
//! A PTY session hosts the assistant CLI inside an interactive shell. Its
//! I/O is callback-driven; there is no background task per session.

mod backend;
mod registry;
mod types;

pub use backend::{NativePtyBackend, PtyBackend, PtyCallbacks, PtyProcess, PtySpawnRequest};
pub use registry::PtyRegistry;
pub use types::{CreatePtyOptions, PtySessionView, PtyStatus, Visibility};
