//! PTY session registry
//!
//! Owns every terminal-style session: create, start, write, resize, close.
//! Failures never escape the I/O entry points; they are logged, or turned
//! into an `error` status plus a notification.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tandem_process::{
    NativeTreeKiller, Terminable, TerminateError, TerminationEscalator, TerminationOutcome,
    TreeKiller,
};
use tracing::{debug, info, warn};

use super::backend::{PtyBackend, PtyCallbacks, PtyProcess, PtySpawnRequest};
use super::types::{CreatePtyOptions, PtySessionView, PtyStatus, Visibility};
use crate::config::{CliConfig, Config, PtyConfig};
use crate::env::{EnvironmentBuilder, ProfileEnvironment, ProfileSource, StaticProfiles};
use crate::error::{Error, Result};
use crate::guard::{OccupancyGuard, OccupancyProbe};
use crate::notify::{Notification, Notifier};

struct PtyState {
    status: PtyStatus,
    pid: Option<u32>,
    visibility: Visibility,
    exit_code: Option<i32>,
    error: Option<String>,
}

struct PtySession {
    id: String,
    project_id: Option<String>,
    title: String,
    cwd: std::path::PathBuf,
    resume_id: Option<String>,
    cols: u16,
    rows: u16,
    state: Mutex<PtyState>,
    process: Mutex<Option<Box<dyn PtyProcess>>>,
    /// Set by the exit callback
    exited: Arc<AtomicBool>,
    closing: AtomicBool,
}

impl PtySession {
    fn view(&self) -> PtySessionView {
        let state = self.state.lock();
        PtySessionView {
            id: self.id.clone(),
            project_id: self.project_id.clone(),
            title: self.title.clone(),
            cwd: self.cwd.clone(),
            resume_id: self.resume_id.clone(),
            status: state.status,
            pid: state.pid,
            visibility: state.visibility,
            exit_code: state.exit_code,
            error: state.error.clone(),
        }
    }

    fn is_alive(&self) -> bool {
        !self.exited.load(Ordering::SeqCst) && self.process.lock().is_some()
    }

    /// Run `f` against the process if it is alive; errors are logged
    fn with_process(&self, what: &str, f: impl FnOnce(&mut dyn PtyProcess) -> Result<()>) {
        if self.exited.load(Ordering::SeqCst) {
            return;
        }
        let mut process = self.process.lock();
        if let Some(process) = process.as_mut() {
            if let Err(e) = f(process.as_mut()) {
                warn!("PTY {} {} failed: {}", self.id, what, e);
            }
        }
    }
}

/// Escalation target for one session
struct PtyTarget {
    session: Arc<PtySession>,
    killer: Arc<dyn TreeKiller>,
}

impl Terminable for PtyTarget {
    fn has_exited(&self) -> bool {
        !self.session.is_alive()
    }

    fn interrupt(&self) -> std::result::Result<(), TerminateError> {
        let mut process = self.session.process.lock();
        match process.as_mut() {
            Some(process) => process
                .interrupt()
                .map_err(|e| TerminateError::Io(std::io::Error::other(e.to_string()))),
            None => Ok(()),
        }
    }

    fn force_kill(&self) -> std::result::Result<(), TerminateError> {
        let mut process = self.session.process.lock();
        let Some(process) = process.as_mut() else {
            return Ok(());
        };
        let tree = match process.pid() {
            Some(pid) => self.killer.kill_tree(pid),
            None => Err(TerminateError::Unsupported),
        };
        match tree {
            Ok(()) => Ok(()),
            Err(e) => {
                debug!("Tree kill of PTY {} failed ({}), killing child", self.session.id, e);
                process
                    .kill()
                    .map_err(|e| TerminateError::Io(std::io::Error::other(e.to_string())))
            }
        }
    }
}

/// Registry of terminal-style sessions
pub struct PtyRegistry {
    sessions: RwLock<HashMap<String, Arc<PtySession>>>,
    focused: RwLock<Option<String>>,
    backend: Arc<dyn PtyBackend>,
    notifier: Arc<dyn Notifier>,
    env: Arc<dyn EnvironmentBuilder>,
    profiles: Arc<dyn ProfileSource>,
    killer: Arc<dyn TreeKiller>,
    escalator: TerminationEscalator,
    guard: OccupancyGuard,
    config: PtyConfig,
    cli: CliConfig,
}

impl PtyRegistry {
    pub fn new(config: &Config, backend: Arc<dyn PtyBackend>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            focused: RwLock::new(None),
            backend,
            notifier,
            env: Arc::new(ProfileEnvironment::new()),
            profiles: Arc::new(StaticProfiles::from_config(config)),
            killer: Arc::new(NativeTreeKiller),
            escalator: TerminationEscalator::new(config.pty.escalation_policy()),
            guard: OccupancyGuard::new(),
            config: config.pty.clone(),
            cli: config.cli.clone(),
        }
    }

    pub fn with_environment(mut self, env: Arc<dyn EnvironmentBuilder>) -> Self {
        self.env = env;
        self
    }

    pub fn with_profiles(mut self, profiles: Arc<dyn ProfileSource>) -> Self {
        self.profiles = profiles;
        self
    }

    pub fn with_tree_killer(mut self, killer: Arc<dyn TreeKiller>) -> Self {
        self.killer = killer;
        self
    }

    /// Guard consulted before resuming a conversation
    pub fn guard(&self) -> &OccupancyGuard {
        &self.guard
    }

    /// Register a new session. No process is started yet.
    pub fn create(&self, options: CreatePtyOptions) -> PtySessionView {
        let id = uuid::Uuid::new_v4().to_string();
        let title = options
            .title
            .unwrap_or_else(|| format!("Session {}", &id[..8]));

        let session = Arc::new(PtySession {
            id: id.clone(),
            project_id: options.project_id,
            title,
            cwd: options.cwd,
            resume_id: options.resume_id,
            cols: options.cols.unwrap_or(self.config.cols),
            rows: options.rows.unwrap_or(self.config.rows),
            state: Mutex::new(PtyState {
                status: PtyStatus::Starting,
                pid: None,
                visibility: Visibility::Foreground,
                exit_code: None,
                error: None,
            }),
            process: Mutex::new(None),
            exited: Arc::new(AtomicBool::new(false)),
            closing: AtomicBool::new(false),
        });

        let view = session.view();
        self.sessions.write().insert(id.clone(), session);
        info!("Created PTY session {}", id);
        view
    }

    /// Spawn the shell and type the launch command into it.
    ///
    /// Only an unknown id or a repeated start is an `Err`; spawn failures end
    /// in status `error` plus a notification.
    pub async fn start(&self, id: &str) -> Result<()> {
        let session = self.session(id)?;
        if session.state.lock().status != PtyStatus::Starting || session.process.lock().is_some() {
            return Err(Error::StateConflict(format!("PTY session {} already started", id)));
        }

        if let Some(resume_id) = &session.resume_id {
            if self.guard.is_active_elsewhere(resume_id) {
                self.fail(&session, Error::InUseByOtherMode(resume_id.clone()).to_string());
                return Ok(());
            }
        }

        let mut env = self.env.build_env(self.profiles.active_profile().as_ref());
        env.insert("TERM".to_string(), "xterm-256color".to_string());

        let request = PtySpawnRequest {
            program: self.config.resolve_shell(),
            args: Vec::new(),
            cwd: session.cwd.clone(),
            env,
            cols: session.cols,
            rows: session.rows,
        };

        let process = match self.backend.spawn(request, self.callbacks(&session)) {
            Ok(process) => process,
            Err(e) => {
                self.fail(&session, e.to_string());
                return Ok(());
            }
        };

        let pid = process.pid();
        *session.process.lock() = Some(process);
        {
            let mut state = session.state.lock();
            // The exit callback may already have run
            if state.status == PtyStatus::Starting {
                state.status = PtyStatus::Running;
            }
            state.pid = pid;
        }
        info!("PTY session {} running (pid {:?})", id, pid);
        self.notify_status(&session);

        tokio::time::sleep(self.config.launch_delay()).await;
        let command = self.launch_command(session.resume_id.as_deref());
        session.with_process("launch", |p| p.write(command.as_bytes()));

        Ok(())
    }

    /// Write raw bytes; a no-op unless the process is alive
    pub fn write(&self, id: &str, data: &[u8]) {
        let session = self.sessions.read().get(id).cloned();
        if let Some(session) = session {
            session.with_process("write", |p| p.write(data));
        }
    }

    /// Write `line` followed by a carriage return
    pub fn write_line(&self, id: &str, line: &str) {
        self.write(id, format!("{}\r", line).as_bytes());
    }

    /// Resize the terminal; a no-op unless the process is alive
    pub fn resize(&self, id: &str, cols: u16, rows: u16) {
        let session = self.sessions.read().get(id).cloned();
        if let Some(session) = session {
            session.with_process("resize", |p| p.resize(cols, rows));
        }
    }

    /// Terminate the session's process and remove it.
    ///
    /// Graceful: interrupt, wait, interrupt, wait longer, force-kill,
    /// stopping as soon as the process is seen to exit. Otherwise force-kill
    /// immediately. Returns `None` for an unknown or already-closing session.
    pub async fn close(&self, id: &str, graceful: bool) -> Option<TerminationOutcome> {
        let session = self.sessions.read().get(id).cloned()?;
        if session.closing.swap(true, Ordering::SeqCst) {
            return None;
        }

        let target = PtyTarget {
            session: session.clone(),
            killer: self.killer.clone(),
        };
        let outcome = if graceful {
            self.escalator.terminate(&target).await
        } else {
            self.escalator.force(&target)
        };

        self.remove(&session, outcome);
        Some(outcome)
    }

    /// Close every session. Graceful closes run one after another; forced
    /// closes are fired without waiting on any process.
    pub async fn close_all(&self, graceful: bool) {
        let ids: Vec<String> = self.sessions.read().keys().cloned().collect();
        info!("Closing {} PTY sessions (graceful: {})", ids.len(), graceful);

        for id in ids {
            if graceful {
                self.close(&id, true).await;
                continue;
            }
            let session = self.sessions.read().get(&id).cloned();
            if let Some(session) = session {
                if session.closing.swap(true, Ordering::SeqCst) {
                    continue;
                }
                let target = PtyTarget {
                    session: session.clone(),
                    killer: self.killer.clone(),
                };
                let outcome = self.escalator.force(&target);
                self.remove(&session, outcome);
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<PtySessionView> {
        self.sessions.read().get(id).map(|s| s.view())
    }

    pub fn list(&self) -> Vec<PtySessionView> {
        self.sessions.read().values().map(|s| s.view()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    pub fn focus(&self, id: &str) -> Result<()> {
        if !self.sessions.read().contains_key(id) {
            return Err(Error::UnknownSession(id.to_string()));
        }
        *self.focused.write() = Some(id.to_string());
        Ok(())
    }

    pub fn focused(&self) -> Option<String> {
        self.focused.read().clone()
    }

    pub fn set_visibility(&self, id: &str, visibility: Visibility) -> Result<()> {
        let session = self.session(id)?;
        session.state.lock().visibility = visibility;
        Ok(())
    }

    fn session(&self, id: &str) -> Result<Arc<PtySession>> {
        self.sessions
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::UnknownSession(id.to_string()))
    }

    fn callbacks(&self, session: &Arc<PtySession>) -> PtyCallbacks {
        let data_notifier = self.notifier.clone();
        let data_id = session.id.clone();

        let exit_notifier = self.notifier.clone();
        let exited = session.exited.clone();
        let weak = Arc::downgrade(session);

        PtyCallbacks {
            on_data: Arc::new(move |data: &[u8]| {
                data_notifier.notify(Notification::PtyOutput {
                    session_id: data_id.clone(),
                    data: String::from_utf8_lossy(data).into_owned(),
                });
            }),
            on_exit: Arc::new(move |code: Option<i32>| {
                exited.store(true, Ordering::SeqCst);
                let Some(session) = weak.upgrade() else {
                    return;
                };
                info!("PTY session {} exited with {:?}", session.id, code);
                {
                    let mut state = session.state.lock();
                    state.status = PtyStatus::Exited;
                    state.exit_code = code;
                }
                exit_notifier.notify(Notification::PtyStatus {
                    session_id: session.id.clone(),
                    status: PtyStatus::Exited,
                    exit_code: code,
                    error: None,
                });
            }),
        }
    }

    fn launch_command(&self, resume_id: Option<&str>) -> String {
        let mut parts = vec![shell_quote(&self.cli.program)];
        parts.extend(self.cli.extra_args.iter().map(|a| shell_quote(a)));
        if let Some(resume_id) = resume_id {
            parts.push("--resume".to_string());
            parts.push(shell_quote(resume_id));
        }
        format!("{}\r", parts.join(" "))
    }

    fn fail(&self, session: &PtySession, message: String) {
        warn!("PTY session {} failed to start: {}", session.id, message);
        {
            let mut state = session.state.lock();
            state.status = PtyStatus::Error;
            state.error = Some(message);
        }
        self.notify_status(session);
    }

    fn notify_status(&self, session: &PtySession) {
        let state = session.state.lock();
        self.notifier.notify(Notification::PtyStatus {
            session_id: session.id.clone(),
            status: state.status,
            exit_code: state.exit_code,
            error: state.error.clone(),
        });
    }

    fn remove(&self, session: &PtySession, outcome: TerminationOutcome) {
        self.sessions.write().remove(&session.id);
        {
            let mut focused = self.focused.write();
            if focused.as_deref() == Some(session.id.as_str()) {
                *focused = None;
            }
        }
        {
            let mut state = session.state.lock();
            if state.status.is_live() {
                state.status = PtyStatus::Exited;
            }
        }
        session.process.lock().take();
        info!("Closed PTY session {} ({:?})", session.id, outcome);
        self.notifier.notify(Notification::PtyClosed {
            session_id: session.id.clone(),
            outcome,
        });
    }
}

impl OccupancyProbe for PtyRegistry {
    fn is_resumable_identity_active(&self, resume_id: &str) -> bool {
        self.sessions.read().values().any(|s| {
            s.resume_id.as_deref() == Some(resume_id) && s.state.lock().status == PtyStatus::Running
        })
    }
}

fn shell_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':' | '='));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}
