//! Tandem Process - Session process termination
//!
//! This crate provides the termination capabilities the session registries
//! rely on:
//! - `TreeKiller`: forcefully terminate a process together with its descendants
//! - `TerminationEscalator`: interrupt, wait, interrupt again, wait longer,
//!   then force-kill
//!
//! Callers only ever talk to these two capabilities. The platform strategy
//! (process-group signals on Unix, `taskkill /T` on Windows) stays private to
//! the `tree` module.

pub mod escalate;
pub mod tree;

pub use escalate::{EscalationPolicy, Terminable, TerminationEscalator, TerminationOutcome};
pub use tree::{kill_tree, NativeTreeKiller, TreeKiller};

/// Process termination errors
#[derive(Debug, thiserror::Error)]
pub enum TerminateError {
    #[error("Invalid process id: {0}")]
    InvalidPid(u32),
    #[error("Failed to signal process {pid}: {message}")]
    Signal { pid: u32, message: String },
    #[error("Process tree termination is not supported on this platform")]
    Unsupported,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
