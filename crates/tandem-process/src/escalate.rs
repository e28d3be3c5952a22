//! Escalating termination policy
//!
//! A graceful close runs:
//!
//! ```text
//! interrupt ─▶ wait(first) ─▶ interrupt ─▶ wait(second) ─▶ force kill
//!     └── exited? stop ──────────┴── exited? stop ──┘
//! ```
//!
//! The escalator never decides *how* a target is interrupted or killed; it
//! only owns the ordering and the waits.

use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use crate::TerminateError;

/// Something that can be asked to stop, politely first.
pub trait Terminable: Send + Sync {
    /// Whether the exit of the process has already been observed
    fn has_exited(&self) -> bool;

    /// Send one soft interrupt (e.g. Ctrl-C into a terminal)
    fn interrupt(&self) -> Result<(), TerminateError>;

    /// Terminate the process and its descendants immediately
    fn force_kill(&self) -> Result<(), TerminateError>;
}

/// Waits used between escalation steps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EscalationPolicy {
    /// Wait after the first interrupt
    pub first_wait: Duration,
    /// Wait after the second interrupt, before force-killing
    pub second_wait: Duration,
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self {
            first_wait: Duration::from_millis(500),
            second_wait: Duration::from_millis(1000),
        }
    }
}

/// How a termination ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationOutcome {
    /// The process was gone before anything was sent
    AlreadyExited,
    /// Exited during the first wait
    ExitedAfterFirstInterrupt,
    /// Exited during the second wait
    ExitedAfterSecondInterrupt,
    /// Ignored both interrupts (or was never asked) and was force-killed
    ForceKilled,
}

/// Runs the interrupt → wait → interrupt → wait longer → kill sequence
#[derive(Debug, Clone, Default)]
pub struct TerminationEscalator {
    policy: EscalationPolicy,
}

impl TerminationEscalator {
    pub fn new(policy: EscalationPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> EscalationPolicy {
        self.policy
    }

    /// Gracefully terminate `target`, short-circuiting as soon as it is
    /// observed to have exited.
    pub async fn terminate<T: Terminable + ?Sized>(&self, target: &T) -> TerminationOutcome {
        if target.has_exited() {
            return TerminationOutcome::AlreadyExited;
        }

        if let Err(e) = target.interrupt() {
            warn!("First interrupt failed: {}", e);
        }
        tokio::time::sleep(self.policy.first_wait).await;
        if target.has_exited() {
            debug!("Process exited after first interrupt");
            return TerminationOutcome::ExitedAfterFirstInterrupt;
        }

        if let Err(e) = target.interrupt() {
            warn!("Second interrupt failed: {}", e);
        }
        tokio::time::sleep(self.policy.second_wait).await;
        if target.has_exited() {
            debug!("Process exited after second interrupt");
            return TerminationOutcome::ExitedAfterSecondInterrupt;
        }

        self.force(target)
    }

    /// Force-kill without any interrupt.
    pub fn force<T: Terminable + ?Sized>(&self, target: &T) -> TerminationOutcome {
        if let Err(e) = target.force_kill() {
            warn!("Force kill failed: {}", e);
        }
        TerminationOutcome::ForceKilled
    }
}
