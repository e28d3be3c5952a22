//! Process-tree termination
//!
//! Session children are spawned as process-group leaders (the PTY backend
//! calls `setsid`, the agent CLI is spawned with `process_group(0)`), so on
//! Unix a single `killpg` reaches every descendant. Windows has no process
//! groups in that sense and walks the tree with `taskkill /T`.

use tracing::debug;

use crate::TerminateError;

/// Capability to forcefully terminate a process and all of its descendants.
///
/// Killing a process that already exited must be a no-op, not an error.
pub trait TreeKiller: Send + Sync {
    fn kill_tree(&self, pid: u32) -> Result<(), TerminateError>;
}

/// Tree killer backed by the host operating system
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeTreeKiller;

impl TreeKiller for NativeTreeKiller {
    fn kill_tree(&self, pid: u32) -> Result<(), TerminateError> {
        kill_tree(pid)
    }
}

/// Forcefully terminate `pid` and its descendants.
pub fn kill_tree(pid: u32) -> Result<(), TerminateError> {
    if pid == 0 || pid > i32::MAX as u32 {
        return Err(TerminateError::InvalidPid(pid));
    }
    debug!("Killing process tree rooted at {}", pid);
    platform::kill_tree(pid)
}

#[cfg(unix)]
mod platform {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, killpg, Signal};
    use nix::unistd::Pid;

    use crate::TerminateError;

    pub(super) fn kill_tree(pid: u32) -> Result<(), TerminateError> {
        let target = Pid::from_raw(pid as i32);
        match killpg(target, Signal::SIGKILL) {
            Ok(()) => Ok(()),
            // Not a group leader (or the group is gone): fall back to the pid itself.
            Err(Errno::ESRCH) | Err(Errno::EPERM) => match kill(target, Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => Ok(()),
                Err(e) => Err(TerminateError::Signal {
                    pid,
                    message: e.desc().to_string(),
                }),
            },
            Err(e) => Err(TerminateError::Signal {
                pid,
                message: e.desc().to_string(),
            }),
        }
    }
}

#[cfg(windows)]
mod platform {
    use std::os::windows::process::CommandExt;
    use std::process::{Command, Stdio};

    use crate::TerminateError;

    /// Windows creation flag to hide the console window
    const CREATE_NO_WINDOW: u32 = 0x08000000;

    /// `taskkill` exit code when the pid no longer exists
    const TASKKILL_NOT_FOUND: i32 = 128;

    pub(super) fn kill_tree(pid: u32) -> Result<(), TerminateError> {
        let status = Command::new("taskkill")
            .args(["/PID", &pid.to_string(), "/T", "/F"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .creation_flags(CREATE_NO_WINDOW)
            .status()?;

        if status.success() || status.code() == Some(TASKKILL_NOT_FOUND) {
            Ok(())
        } else {
            Err(TerminateError::Signal {
                pid,
                message: format!("taskkill exited with {:?}", status.code()),
            })
        }
    }
}

#[cfg(not(any(unix, windows)))]
mod platform {
    use crate::TerminateError;

    pub(super) fn kill_tree(_pid: u32) -> Result<(), TerminateError> {
        Err(TerminateError::Unsupported)
    }
}
