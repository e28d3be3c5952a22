//! Pseudo-terminal process backend

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use portable_pty::{ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// What to launch inside a new pseudo-terminal
#[derive(Debug, Clone, PartialEq)]
pub struct PtySpawnRequest {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
    pub cols: u16,
    pub rows: u16,
}

/// Output and exit callbacks wired to a spawned process
#[derive(Clone)]
pub struct PtyCallbacks {
    pub on_data: Arc<dyn Fn(&[u8]) + Send + Sync>,
    pub on_exit: Arc<dyn Fn(Option<i32>) + Send + Sync>,
}

/// A live process attached to a pseudo-terminal
pub trait PtyProcess: Send {
    fn pid(&self) -> Option<u32>;

    fn write(&mut self, data: &[u8]) -> Result<()>;

    fn resize(&mut self, cols: u16, rows: u16) -> Result<()>;

    /// Soft interrupt: Ctrl-C typed into the terminal
    fn interrupt(&mut self) -> Result<()> {
        self.write(&[0x03])
    }

    /// Kill just this process
    fn kill(&mut self) -> Result<()>;
}

/// Spawns processes attached to pseudo-terminals
pub trait PtyBackend: Send + Sync {
    /// Spawn `request`; output and exit are reported through `callbacks`.
    /// Must be called from within a tokio runtime.
    fn spawn(&self, request: PtySpawnRequest, callbacks: PtyCallbacks) -> Result<Box<dyn PtyProcess>>;
}

/// Backend using the platform's native pseudo-terminal
#[derive(Debug, Default, Clone, Copy)]
pub struct NativePtyBackend;

impl NativePtyBackend {
    pub fn new() -> Self {
        Self
    }
}

impl PtyBackend for NativePtyBackend {
    fn spawn(&self, request: PtySpawnRequest, callbacks: PtyCallbacks) -> Result<Box<dyn PtyProcess>> {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows: request.rows,
                cols: request.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| Error::Process(format!("Failed to open pty: {}", e)))?;

        let mut cmd = CommandBuilder::new(&request.program);
        cmd.args(&request.args);
        cmd.cwd(&request.cwd);
        // The request carries the complete environment
        if !request.env.is_empty() {
            cmd.env_clear();
        }
        for (key, value) in &request.env {
            cmd.env(key, value);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| Error::Process(format!("Failed to spawn {}: {}", request.program, e)))?;
        // Only the child may hold the slave side, or the reader never sees EOF
        drop(pair.slave);

        let pid = child.process_id();
        info!("PTY spawned {} (pid {:?})", request.program, pid);

        let killer = child.clone_killer();
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| Error::Process(format!("Failed to take pty writer: {}", e)))?;
        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| Error::Process(format!("Failed to clone pty reader: {}", e)))?;

        let on_data = callbacks.on_data.clone();
        tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => on_data(&buf[..n]),
                    Err(e) => {
                        debug!("PTY read ended: {}", e);
                        break;
                    }
                }
            }
        });

        let on_exit = callbacks.on_exit;
        tokio::task::spawn_blocking(move || {
            let code = match child.wait() {
                Ok(status) => Some(status.exit_code() as i32),
                Err(e) => {
                    warn!("Failed to wait for pty child: {}", e);
                    None
                }
            };
            on_exit(code);
        });

        Ok(Box::new(NativePtyProcess {
            master: pair.master,
            writer,
            killer,
            pid,
        }))
    }
}

struct NativePtyProcess {
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    pid: Option<u32>,
}

impl PtyProcess for NativePtyProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.writer.write_all(data)?;
        self.writer.flush()?;
        Ok(())
    }

    fn resize(&mut self, cols: u16, rows: u16) -> Result<()> {
        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| Error::Process(format!("Failed to resize pty: {}", e)))
    }

    fn kill(&mut self) -> Result<()> {
        self.killer.kill()?;
        Ok(())
    }
}
