//! Agent session registry
//!
//! Owns every streaming agent session. `send_message` is the central
//! transition: a cheap push onto a live stream when one exists, otherwise a
//! cold spawn of a new process, bridge, and dispatch loop.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tandem_process::{NativeTreeKiller, TreeKiller};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::dispatch::Dispatcher;
use super::message::{self, OutgoingMessage};
use super::persistence::{AgentSessionRecord, RecordStatus, SessionStore, TranscriptEntry};
use super::types::{
    AgentSessionView, AgentStatus, CreateAgentOptions, ProfileSnapshot, ReopenResult,
    SendOptions, SendOutcome, SessionListener,
};
use crate::bridge::{self, MessageBridge};
use crate::config::{AgentConfig, Config};
use crate::env::{EnvironmentBuilder, ProfileEnvironment, ProfileSource, StaticProfiles};
use crate::error::{Error, Result};
use crate::guard::{OccupancyGuard, OccupancyProbe};
use crate::notify::{Notification, Notifier};
use crate::stream::{
    InitSnapshot, McpServerStatus, ModelInfo, ProcessSpawnHook, QueryControl, QueryOptions,
    SlashCommand, SpawnRequest, StreamingProtocol,
};

/// Control message that asks the CLI to compact the conversation
pub const COMPACT_COMMAND: &str = "/compact";

/// A bridge and the stream handle fed by it. They only ever exist together.
pub(super) struct LiveStream {
    pub(super) bridge: MessageBridge<Value>,
    pub(super) control: Arc<dyn QueryControl>,
    pub(super) generation: u64,
}

pub(super) struct AgentState {
    pub(super) status: AgentStatus,
    pub(super) resume_id: Option<String>,
    pub(super) cwd: PathBuf,
    pub(super) model: Option<String>,
    pub(super) live: Option<LiveStream>,
    pub(super) loop_handle: Option<JoinHandle<()>>,
    pub(super) init_snapshot: Option<InitSnapshot>,
    pub(super) transcript: Vec<TranscriptEntry>,
    pub(super) total_cost_usd: f64,
    /// Cost the current process has reported so far
    pub(super) query_cost_usd: f64,
    pub(super) input_tokens: u64,
    pub(super) output_tokens: u64,
    pub(super) turns: u64,
    /// Bumped on every cold spawn
    pub(super) generation: u64,
    pub(super) spawning: bool,
    pub(super) closing: bool,
}

impl AgentState {
    pub(super) fn live_generation(&self) -> Option<u64> {
        self.live.as_ref().map(|l| l.generation)
    }
}

pub(super) struct AgentSession {
    pub(super) id: String,
    pub(super) kind: String,
    pub(super) profile: ProfileSnapshot,
    pub(super) created_at: DateTime<Utc>,
    pub(super) state: Mutex<AgentState>,
    /// Child process id, filled in by the spawn hook
    pub(super) pid: Arc<Mutex<Option<u32>>>,
}

impl AgentSession {
    fn new(
        id: String,
        kind: String,
        cwd: PathBuf,
        resume_id: Option<String>,
        model: Option<String>,
        profile: ProfileSnapshot,
    ) -> Self {
        Self {
            id,
            kind,
            profile,
            created_at: Utc::now(),
            state: Mutex::new(AgentState {
                status: AgentStatus::Idle,
                resume_id,
                cwd,
                model,
                live: None,
                loop_handle: None,
                init_snapshot: None,
                transcript: Vec::new(),
                total_cost_usd: 0.0,
                query_cost_usd: 0.0,
                input_tokens: 0,
                output_tokens: 0,
                turns: 0,
                generation: 0,
                spawning: false,
                closing: false,
            }),
            pid: Arc::new(Mutex::new(None)),
        }
    }

    fn from_record(record: AgentSessionRecord, transcript: Vec<TranscriptEntry>) -> Self {
        let session = Self::new(
            record.id,
            record.kind,
            record.cwd,
            record.resume_id,
            record.model,
            ProfileSnapshot {
                id: record.profile_id,
                base_url: record.profile_base_url,
            },
        );
        {
            let mut state = session.state.lock();
            state.transcript = transcript;
            state.total_cost_usd = record.total_cost_usd;
            state.input_tokens = record.input_tokens;
            state.output_tokens = record.output_tokens;
            state.turns = record.turns;
        }
        Self {
            created_at: record.created_at,
            ..session
        }
    }

    pub(super) fn record(&self, state: &AgentState) -> AgentSessionRecord {
        AgentSessionRecord {
            id: self.id.clone(),
            kind: self.kind.clone(),
            cwd: state.cwd.clone(),
            resume_id: state.resume_id.clone(),
            status: if state.closing {
                RecordStatus::Closed
            } else {
                RecordStatus::Open
            },
            profile_id: self.profile.id.clone(),
            profile_base_url: self.profile.base_url.clone(),
            model: state.model.clone(),
            total_cost_usd: state.total_cost_usd,
            input_tokens: state.input_tokens,
            output_tokens: state.output_tokens,
            turns: state.turns,
            created_at: self.created_at,
            updated_at: Utc::now(),
        }
    }

    fn view(&self) -> AgentSessionView {
        let state = self.state.lock();
        AgentSessionView {
            id: self.id.clone(),
            kind: self.kind.clone(),
            status: state.status,
            resume_id: state.resume_id.clone(),
            cwd: state.cwd.clone(),
            model: state.model.clone(),
            pid: *self.pid.lock(),
            has_live_stream: state.live.is_some(),
            total_cost_usd: state.total_cost_usd,
            input_tokens: state.input_tokens,
            output_tokens: state.output_tokens,
            turns: state.turns,
            profile: self.profile.clone(),
            transcript_len: state.transcript.len(),
            created_at: self.created_at,
        }
    }
}

/// Collaborators the dispatch loops share with the registry
pub(super) struct Shared {
    pub(super) notifier: Arc<dyn Notifier>,
    store: Arc<dyn SessionStore>,
    listener: RwLock<Option<Arc<dyn SessionListener>>>,
}

impl Shared {
    pub(super) fn persist(&self, record: &AgentSessionRecord) {
        if let Err(e) = self.store.update_session(record) {
            warn!("Failed to persist session {}: {}", record.id, e);
        }
    }

    pub(super) fn append_transcript(&self, id: &str, entry: &TranscriptEntry) {
        if let Err(e) = self.store.append_transcript(id, entry) {
            warn!("Failed to append transcript of session {}: {}", id, e);
        }
    }

    pub(super) fn listener(&self) -> Option<Arc<dyn SessionListener>> {
        self.listener.read().clone()
    }
}

/// Captures the real child pid and repairs archive-packaged paths
struct RegistrySpawnHook {
    session_id: String,
    pid: Arc<Mutex<Option<u32>>>,
}

impl ProcessSpawnHook for RegistrySpawnHook {
    fn prepare(&self, request: &mut SpawnRequest) {
        if let Some(fixed) = unpack_archive_path(&request.program) {
            debug!("Repaired program path for {}: {}", self.session_id, fixed);
            request.program = fixed;
        }
        for arg in request.args.iter_mut() {
            if let Some(fixed) = unpack_archive_path(arg) {
                *arg = fixed;
            }
        }
    }

    fn spawned(&self, pid: u32) {
        debug!("Session {} spawned pid {}", self.session_id, pid);
        *self.pid.lock() = Some(pid);
    }
}

/// Point a path inside an `app.asar` archive at the unpacked copy, which is
/// the only place an executable can actually be launched from.
pub fn unpack_archive_path(path: &str) -> Option<String> {
    if !path.contains("app.asar/") && !path.contains("app.asar\\") {
        return None;
    }
    Some(
        path.replace("app.asar/", "app.asar.unpacked/")
            .replace("app.asar\\", "app.asar.unpacked\\"),
    )
}

/// Registry of streaming agent sessions
pub struct AgentRegistry {
    sessions: RwLock<HashMap<String, Arc<AgentSession>>>,
    shared: Arc<Shared>,
    protocol: Arc<dyn StreamingProtocol>,
    env: Arc<dyn EnvironmentBuilder>,
    profiles: Arc<dyn ProfileSource>,
    killer: Arc<dyn TreeKiller>,
    guard: OccupancyGuard,
    config: AgentConfig,
}

impl AgentRegistry {
    pub fn new(
        config: &Config,
        protocol: Arc<dyn StreamingProtocol>,
        store: Arc<dyn SessionStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            shared: Arc::new(Shared {
                notifier,
                store,
                listener: RwLock::new(None),
            }),
            protocol,
            env: Arc::new(ProfileEnvironment::new()),
            profiles: Arc::new(StaticProfiles::from_config(config)),
            killer: Arc::new(NativeTreeKiller),
            guard: OccupancyGuard::new(),
            config: config.agent.clone(),
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

    /// Register (or clear) the external listener
    pub fn set_listener(&self, listener: Option<Arc<dyn SessionListener>>) {
        *self.shared.listener.write() = listener;
    }

    /// Create a session. Persisting the initial record is best-effort.
    pub fn create(&self, options: CreateAgentOptions) -> AgentSessionView {
        let id = uuid::Uuid::new_v4().to_string();
        let kind = options
            .kind
            .unwrap_or_else(|| self.config.default_kind.clone());
        let cwd = match options.cwd {
            Some(cwd) => cwd,
            None => {
                let cwd = self.config.sessions_root().join(&id);
                if let Err(e) = std::fs::create_dir_all(&cwd) {
                    warn!("Failed to create working directory {:?}: {}", cwd, e);
                }
                cwd
            }
        };
        let profile = ProfileSnapshot::capture(self.profiles.active_profile().as_ref());

        let session = Arc::new(AgentSession::new(
            id.clone(),
            kind,
            cwd,
            options.resume_id,
            options.model,
            profile,
        ));
        let record = session.record(&session.state.lock());
        if let Err(e) = self.shared.store.create_session(&record) {
            warn!("Failed to persist new session {}: {}", id, e);
        }

        let view = session.view();
        self.sessions.write().insert(id.clone(), session);
        info!("Created agent session {} ({})", id, view.kind);
        view
    }

    /// Make a persisted session resident again (status idle).
    ///
    /// A changed credential profile is reported in the result, never refused.
    pub fn reopen(&self, id: &str) -> Result<ReopenResult> {
        let resident = self.sessions.read().get(id).cloned();
        let session = match resident {
            Some(session) => session,
            None => self.load(id)?,
        };

        let profile_changed = session
            .profile
            .differs_from(self.profiles.active_profile().as_ref());
        if profile_changed {
            warn!(
                "Session {} was created with profile {:?}; the active profile has changed",
                id, session.profile.id
            );
        }

        Ok(ReopenResult {
            session: session.view(),
            profile_changed,
        })
    }

    /// Send a user turn.
    ///
    /// Fails with `AlreadyStreaming` while a turn is in flight and with
    /// `InUseByOtherMode` when the conversation is being driven elsewhere.
    /// A failed spawn is reported as [`SendOutcome::Failed`].
    pub async fn send_message(
        &self,
        id: &str,
        message: impl Into<OutgoingMessage>,
        options: SendOptions,
    ) -> Result<SendOutcome> {
        let session = self.resolve(id)?;
        let normalized = message::normalize(message.into())?;

        let cold = {
            let mut state = session.state.lock();
            if state.closing {
                return Err(Error::StateConflict(format!("Session {} is closing", id)));
            }
            if state.status == AgentStatus::Streaming {
                return Err(Error::AlreadyStreaming(id.to_string()));
            }
            if state.spawning {
                return Err(Error::StateConflict(format!("Session {} is still starting", id)));
            }

            let fast = state.live.as_ref().is_some_and(|l| !l.bridge.is_ended());
            if fast {
                if let Some(live) = &state.live {
                    live.bridge.push(normalized.wire.clone());
                }
                state.status = AgentStatus::Streaming;
                None
            } else {
                state.spawning = true;
                Some((
                    state.cwd.clone(),
                    state.resume_id.clone(),
                    options.model.clone().or_else(|| state.model.clone()),
                ))
            }
        };

        let Some((cwd, resume_id, model)) = cold else {
            debug!("Pushed message onto live stream of {}", id);
            self.record_user_turn(&session, &normalized.display);
            self.notify_status(id, AgentStatus::Streaming, false, None);
            return Ok(SendOutcome::Pushed);
        };

        if let Some(resume_id) = &resume_id {
            if self.guard.is_active_elsewhere(resume_id) {
                return self.fail_spawn(&session, Error::InUseByOtherMode(resume_id.clone()));
            }
        }

        self.record_user_turn(&session, &normalized.display);
        match self
            .start_stream(&session, normalized.wire, cwd, resume_id, model, options.max_turns)
            .await
        {
            Ok(()) => Ok(SendOutcome::Spawned),
            Err(e) => self.fail_spawn(&session, e),
        }
    }

    async fn start_stream(
        &self,
        session: &Arc<AgentSession>,
        wire: Value,
        cwd: PathBuf,
        resume_id: Option<String>,
        model: Option<String>,
        max_turns: Option<u32>,
    ) -> Result<()> {
        let env = self.env.build_env(self.profiles.active_profile().as_ref());
        let (bridge, input) = bridge::channel();
        bridge.push(wire);

        info!(
            "Starting stream for session {} (resume: {:?})",
            session.id, resume_id
        );
        let options = QueryOptions {
            cwd,
            env,
            model,
            max_turns,
            resume: resume_id,
            spawn_hook: Some(Arc::new(RegistrySpawnHook {
                session_id: session.id.clone(),
                pid: session.pid.clone(),
            })),
        };
        let stream = self.protocol.query(input, options).await?;

        let generation = {
            let mut state = session.state.lock();
            state.spawning = false;
            if state.closing {
                drop(state);
                bridge.abort();
                stream.control.close();
                return Err(Error::Cancelled);
            }
            state.generation += 1;
            let generation = state.generation;
            let previous = state.live.replace(LiveStream {
                bridge,
                control: stream.control.clone(),
                generation,
            });
            if let Some(previous) = previous {
                previous.bridge.abort();
                previous.control.close();
            }
            state.status = AgentStatus::Streaming;
            state.query_cost_usd = 0.0;
            state.init_snapshot = None;
            generation
        };
        self.notify_status(&session.id, AgentStatus::Streaming, false, None);

        let dispatcher = Dispatcher {
            session: session.clone(),
            shared: self.shared.clone(),
            generation,
        };
        let handle = tokio::spawn(dispatcher.run(stream.events));

        let mut state = session.state.lock();
        if state.live_generation() == Some(generation) {
            state.loop_handle = Some(handle);
        }
        Ok(())
    }

    fn fail_spawn(&self, session: &AgentSession, error: Error) -> Result<SendOutcome> {
        let message = error.to_string();
        warn!("Failed to start stream for session {}: {}", session.id, message);
        {
            let mut state = session.state.lock();
            state.spawning = false;
            state.status = AgentStatus::Error;
        }
        *session.pid.lock() = None;

        self.shared.notifier.notify(Notification::AgentError {
            session_id: session.id.clone(),
            message: message.clone(),
        });
        self.notify_status(&session.id, AgentStatus::Error, true, Some(message.clone()));

        match error {
            Error::InUseByOtherMode(_) => Err(error),
            _ => Ok(SendOutcome::Failed { message }),
        }
    }

    /// Interrupt the turn in flight.
    ///
    /// The cooperative interrupt keeps the process and conversation alive;
    /// if it fails the process is torn down instead. Either way the session
    /// ends up idle.
    pub async fn cancel(&self, id: &str) -> Result<()> {
        let session = self.session(id)?;
        let live = {
            let state = session.state.lock();
            state
                .live
                .as_ref()
                .map(|l| (l.control.clone(), l.generation))
        };

        let Some((control, generation)) = live else {
            let changed = {
                let mut state = session.state.lock();
                let changed = state.status != AgentStatus::Idle;
                state.status = AgentStatus::Idle;
                changed
            };
            if changed {
                self.notify_status(id, AgentStatus::Idle, true, None);
            }
            return Ok(());
        };

        match control.interrupt().await {
            Ok(()) => {
                info!("Interrupted turn of session {}", id);
                {
                    let mut state = session.state.lock();
                    if state.live_generation() == Some(generation) {
                        state.status = AgentStatus::Idle;
                    }
                }
                self.notify_status(id, AgentStatus::Idle, false, None);
            }
            Err(e) => {
                warn!("Interrupt of session {} failed ({}), tearing down", id, e);
                let taken = {
                    let mut state = session.state.lock();
                    if state.live_generation() == Some(generation) {
                        state.loop_handle = None;
                        state.status = AgentStatus::Idle;
                        state.live.take()
                    } else {
                        None
                    }
                };
                if let Some(live) = taken {
                    live.bridge.abort();
                    live.control.close();
                    self.kill_process(&session);
                    *session.pid.lock() = None;
                }
                self.notify_status(id, AgentStatus::Idle, true, None);
            }
        }
        Ok(())
    }

    /// Close a session and remove it. Closing an unknown or already-closing
    /// session is a no-op.
    pub async fn close(&self, id: &str) -> Result<()> {
        let session = self.sessions.read().get(id).cloned();
        let Some(session) = session else {
            debug!("Close of unknown session {} ignored", id);
            return Ok(());
        };

        let (live, handle) = {
            let mut state = session.state.lock();
            if state.closing {
                return Ok(());
            }
            state.closing = true;
            (
                state
                    .live
                    .as_ref()
                    .map(|l| (l.bridge.clone(), l.control.clone())),
                state.loop_handle.take(),
            )
        };

        // The stream must be marked closed before the process dies, so its
        // exit reads as a cancellation
        if let Some((bridge, control)) = &live {
            bridge.end();
            control.close();
        }
        self.kill_process(&session);

        if let Some(handle) = handle {
            let abort = handle.abort_handle();
            if tokio::time::timeout(self.config.close_timeout(), handle)
                .await
                .is_err()
            {
                warn!(
                    "Closing session {}: {}",
                    id,
                    Error::ShutdownTimeout(self.config.close_timeout_ms)
                );
                abort.abort();
            }
        }

        {
            let mut state = session.state.lock();
            if let Some(live) = state.live.take() {
                live.bridge.abort();
            }
            state.loop_handle = None;
            if state.status == AgentStatus::Streaming {
                state.status = AgentStatus::Idle;
            }
        }
        *session.pid.lock() = None;

        if let Err(e) = self.shared.store.close_session(id) {
            warn!("Failed to mark session {} closed: {}", id, e);
        }

        if self.sessions.write().remove(id).is_some() {
            info!("Closed agent session {}", id);
            self.shared.notifier.notify(Notification::AgentClosed {
                session_id: id.to_string(),
            });
        }
        Ok(())
    }

    /// Tear every session down without waiting on anything.
    ///
    /// Buffered input is discarded, every process tree is killed once, and
    /// the registry is emptied in one pass.
    pub fn close_all_sync(&self) {
        let sessions: Vec<Arc<AgentSession>> =
            self.sessions.write().drain().map(|(_, s)| s).collect();
        info!("Closing {} agent sessions", sessions.len());

        for session in sessions {
            let (live, handle) = {
                let mut state = session.state.lock();
                state.closing = true;
                if state.status == AgentStatus::Streaming {
                    state.status = AgentStatus::Idle;
                }
                (state.live.take(), state.loop_handle.take())
            };

            if let Some(live) = &live {
                live.bridge.abort();
                live.control.close();
            }
            let pid = session.pid.lock().take();
            if let Some(pid) = pid {
                if let Err(e) = self.killer.kill_tree(pid) {
                    warn!("Failed to kill process tree {} of {}: {}", pid, session.id, e);
                }
            }
            if let Some(handle) = handle {
                handle.abort();
            }
            if let Err(e) = self.shared.store.close_session(&session.id) {
                warn!("Failed to mark session {} closed: {}", session.id, e);
            }
        }
    }

    /// Close the session and remove its persisted record
    pub async fn delete(&self, id: &str) -> Result<()> {
        self.close(id).await?;
        if let Err(e) = self.shared.store.delete_session(id) {
            warn!("Failed to delete session {}: {}", id, e);
        }
        Ok(())
    }

    /// Compact the conversation: pushed onto the live stream when there is
    /// one, otherwise a one-turn process is resumed just for it.
    pub async fn compact_conversation(&self, id: &str) -> Result<SendOutcome> {
        let session = self.resolve(id)?;
        let (live, resumable) = {
            let state = session.state.lock();
            (
                state.live.as_ref().is_some_and(|l| !l.bridge.is_ended()),
                state.resume_id.is_some(),
            )
        };

        if live {
            return self
                .send_message(id, COMPACT_COMMAND, SendOptions::default())
                .await;
        }
        if resumable {
            let options = SendOptions {
                max_turns: Some(1),
                ..Default::default()
            };
            return self.send_message(id, COMPACT_COMMAND, options).await;
        }
        Err(Error::NoActiveStream(id.to_string()))
    }

    /// Switch the model of the live stream
    pub async fn set_model(&self, id: &str, model: Option<String>) -> Result<()> {
        let session = self.session(id)?;
        let control = self.live_control(&session)?;
        control.set_model(model.clone()).await?;

        let record = {
            let mut state = session.state.lock();
            state.model = model;
            session.record(&state)
        };
        self.shared.persist(&record);
        Ok(())
    }

    pub async fn supported_models(&self, id: &str) -> Result<Vec<ModelInfo>> {
        let session = self.session(id)?;
        self.live_control(&session)?.supported_models().await
    }

    pub async fn supported_commands(&self, id: &str) -> Result<Vec<SlashCommand>> {
        let session = self.session(id)?;
        self.live_control(&session)?.supported_commands().await
    }

    pub async fn account_info(&self, id: &str) -> Result<Value> {
        let session = self.session(id)?;
        self.live_control(&session)?.account_info().await
    }

    pub async fn mcp_server_status(&self, id: &str) -> Result<Vec<McpServerStatus>> {
        let session = self.session(id)?;
        self.live_control(&session)?.mcp_server_status().await
    }

    /// Full initialization snapshot, fetched once per stream
    pub async fn initialization_result(&self, id: &str) -> Result<InitSnapshot> {
        let session = self.session(id)?;
        let control = self.live_control(&session)?;
        if let Some(snapshot) = session.state.lock().init_snapshot.clone() {
            return Ok(snapshot);
        }

        let snapshot = control.initialization_result().await?;
        session.state.lock().init_snapshot = Some(snapshot.clone());
        Ok(snapshot)
    }

    pub fn get(&self, id: &str) -> Option<AgentSessionView> {
        self.sessions.read().get(id).map(|s| s.view())
    }

    /// Resident sessions
    pub fn list(&self) -> Vec<AgentSessionView> {
        self.sessions.read().values().map(|s| s.view()).collect()
    }

    /// Every persisted session, resident or not
    pub fn list_persisted(&self) -> Result<Vec<AgentSessionRecord>> {
        self.shared.store.list_sessions()
    }

    pub fn transcript(&self, id: &str) -> Result<Vec<TranscriptEntry>> {
        let resident = self.sessions.read().get(id).cloned();
        match resident {
            Some(session) => Ok(session.state.lock().transcript.clone()),
            None => self.shared.store.load_transcript(id),
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    fn session(&self, id: &str) -> Result<Arc<AgentSession>> {
        self.sessions
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::UnknownSession(id.to_string()))
    }

    /// Resident session, reopening it from storage if needed
    fn resolve(&self, id: &str) -> Result<Arc<AgentSession>> {
        let resident = self.sessions.read().get(id).cloned();
        match resident {
            Some(session) => Ok(session),
            None => self.load(id),
        }
    }

    fn load(&self, id: &str) -> Result<Arc<AgentSession>> {
        let record = self
            .shared
            .store
            .get_session(id)?
            .ok_or_else(|| Error::UnknownSession(id.to_string()))?;
        let was_closed = record.status == RecordStatus::Closed;
        let transcript = self.shared.store.load_transcript(id).unwrap_or_else(|e| {
            warn!("Failed to load transcript of session {}: {}", id, e);
            Vec::new()
        });

        let session = Arc::new(AgentSession::from_record(record, transcript));
        let session = self
            .sessions
            .write()
            .entry(id.to_string())
            .or_insert(session)
            .clone();

        if was_closed {
            let record = session.record(&session.state.lock());
            self.shared.persist(&record);
        }
        info!("Reopened agent session {}", id);
        Ok(session)
    }

    fn live_control(&self, session: &AgentSession) -> Result<Arc<dyn QueryControl>> {
        session
            .state
            .lock()
            .live
            .as_ref()
            .map(|l| l.control.clone())
            .ok_or_else(|| Error::NoActiveStream(session.id.clone()))
    }

    fn record_user_turn(&self, session: &AgentSession, display: &str) {
        let entry = TranscriptEntry::user(display);
        session.state.lock().transcript.push(entry.clone());
        self.shared.append_transcript(&session.id, &entry);
        self.shared.notifier.notify(Notification::AgentUserMessage {
            session_id: session.id.clone(),
            id: entry.id,
            content: entry.content,
        });
    }

    fn kill_process(&self, session: &AgentSession) {
        let pid = *session.pid.lock();
        if let Some(pid) = pid {
            if let Err(e) = self.killer.kill_tree(pid) {
                warn!("Failed to kill process tree {} of {}: {}", pid, session.id, e);
            }
        }
    }

    fn notify_status(
        &self,
        id: &str,
        status: AgentStatus,
        process_exited: bool,
        error: Option<String>,
    ) {
        self.shared.notifier.notify(Notification::AgentStatus {
            session_id: id.to_string(),
            status,
            process_exited,
            error,
        });
    }
}

impl OccupancyProbe for AgentRegistry {
    fn is_resumable_identity_active(&self, resume_id: &str) -> bool {
        self.sessions.read().values().any(|s| {
            let state = s.state.lock();
            state.resume_id.as_deref() == Some(resume_id) && (state.live.is_some() || state.spawning)
        })
    }
}
