//! Deterministic fakes for driving the registries without real processes
//!
//! - [`FakeProtocol`]: a scripted [`StreamingProtocol`]; each query is
//!   exposed as a [`FakeQuery`] handle so a test can emit events and inspect
//!   what the registry pushed
//! - [`FakePtyBackend`]: pseudo-terminal processes that exit after a chosen
//!   number of interrupts
//! - [`FakeTreeKiller`], [`RecordingNotifier`], [`FailingStore`]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tandem_process::{TerminateError, TreeKiller};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::bridge::BridgeReceiver;
use crate::error::{Error, Result};
use crate::notify::{Notification, Notifier};
use crate::pty::{PtyBackend, PtyCallbacks, PtyProcess, PtySpawnRequest};
use crate::session::{AgentSessionRecord, SessionStore, TranscriptEntry};
use crate::stream::{
    InitSnapshot, McpServerStatus, ModelInfo, QueryControl, QueryOptions, QueryStream,
    SlashCommand, SpawnRequest, StreamEvent, StreamingProtocol,
};

/// Poll `condition` every few milliseconds until it holds or `timeout` passes
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ---------------------------------------------------------------------------
// Streaming protocol
// ---------------------------------------------------------------------------

struct FakeQueryInner {
    index: usize,
    pid: u32,
    options: QueryOptions,
    request: SpawnRequest,
    sender: Mutex<Option<mpsc::UnboundedSender<Result<StreamEvent>>>>,
    received: Mutex<Vec<Value>>,
    interrupts: AtomicUsize,
    interrupt_fails: AtomicBool,
    /// `close` ends the stream like a killed process instead of a cancellation
    close_reports_exit: AtomicBool,
    closed: AtomicBool,
    input_ended: AtomicBool,
    model_changes: Mutex<Vec<Option<String>>>,
}

/// Handle on one query started through [`FakeProtocol`]
#[derive(Clone)]
pub struct FakeQuery {
    inner: Arc<FakeQueryInner>,
}

impl FakeQuery {
    /// Emit an event as if the CLI had printed it
    pub fn emit(&self, event: StreamEvent) -> bool {
        match self.inner.sender.lock().as_ref() {
            Some(sender) => sender.send(Ok(event)).is_ok(),
            None => false,
        }
    }

    /// Emit a raw JSON line
    pub fn emit_json(&self, value: Value) -> bool {
        self.emit(StreamEvent::from_value(value))
    }

    pub fn emit_init(&self, resume_id: &str) -> bool {
        self.emit_json(json!({
            "type": "system",
            "subtype": "init",
            "session_id": resume_id,
            "model": "fake-model",
            "tools": ["Read", "Write"],
            "slash_commands": ["compact"],
        }))
    }

    pub fn emit_assistant(&self, text: &str) -> bool {
        self.emit_json(json!({
            "type": "assistant",
            "message": {
                "id": format!("msg_{}", self.inner.index),
                "content": [{ "type": "text", "text": text }],
                "usage": { "input_tokens": 10, "output_tokens": 5 },
            },
        }))
    }

    /// Emit a successful `result` with the query's running cost
    pub fn emit_result(&self, total_cost_usd: f64) -> bool {
        self.emit_json(json!({
            "type": "result",
            "subtype": "success",
            "is_error": false,
            "num_turns": 1,
            "duration_ms": 12,
            "total_cost_usd": total_cost_usd,
            "result": "done",
        }))
    }

    /// End the event stream cleanly, as a process exiting with status 0
    pub fn finish(&self) {
        self.inner.sender.lock().take();
    }

    /// End the event stream with an error
    pub fn fail(&self, message: &str) {
        if let Some(sender) = self.inner.sender.lock().take() {
            let _ = sender.send(Err(Error::Process(message.to_string())));
        }
    }

    /// Messages pulled from the bridge so far, in order
    pub fn received(&self) -> Vec<Value> {
        self.inner.received.lock().clone()
    }

    /// Text content of each received user turn
    pub fn received_texts(&self) -> Vec<String> {
        self.received()
            .iter()
            .map(|m| match &m["message"]["content"] {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            })
            .collect()
    }

    pub fn interrupts(&self) -> usize {
        self.inner.interrupts.load(Ordering::SeqCst)
    }

    pub fn set_interrupt_fails(&self, fails: bool) {
        self.inner.interrupt_fails.store(fails, Ordering::SeqCst);
    }

    pub fn set_close_reports_exit(&self, reports_exit: bool) {
        self.inner.close_reports_exit.store(reports_exit, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// The bridge feeding this query has ended
    pub fn input_ended(&self) -> bool {
        self.inner.input_ended.load(Ordering::SeqCst)
    }

    pub fn pid(&self) -> u32 {
        self.inner.pid
    }

    pub fn resume(&self) -> Option<String> {
        self.inner.options.resume.clone()
    }

    pub fn max_turns(&self) -> Option<u32> {
        self.inner.options.max_turns
    }

    pub fn model(&self) -> Option<String> {
        self.inner.options.model.clone()
    }

    pub fn env(&self) -> HashMap<String, String> {
        self.inner.options.env.clone()
    }

    /// Command line after the spawn hook's `prepare`
    pub fn request(&self) -> SpawnRequest {
        self.inner.request.clone()
    }

    pub fn model_changes(&self) -> Vec<Option<String>> {
        self.inner.model_changes.lock().clone()
    }
}

#[async_trait]
impl QueryControl for FakeQuery {
    async fn interrupt(&self) -> Result<()> {
        self.inner.interrupts.fetch_add(1, Ordering::SeqCst);
        if self.inner.interrupt_fails.load(Ordering::SeqCst) {
            return Err(Error::Process("interrupt rejected".to_string()));
        }
        Ok(())
    }

    fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(sender) = self.inner.sender.lock().take() {
            let error = if self.inner.close_reports_exit.load(Ordering::SeqCst) {
                Error::Process(format!("fake-cli (pid {}) exited with signal: 9", self.inner.pid))
            } else {
                Error::Cancelled
            };
            let _ = sender.send(Err(error));
        }
    }

    async fn set_model(&self, model: Option<String>) -> Result<()> {
        self.inner.model_changes.lock().push(model);
        Ok(())
    }

    async fn supported_models(&self) -> Result<Vec<ModelInfo>> {
        Ok(vec![ModelInfo {
            value: "fake-model".to_string(),
            display_name: "Fake".to_string(),
            description: String::new(),
        }])
    }

    async fn supported_commands(&self) -> Result<Vec<SlashCommand>> {
        Ok(vec![SlashCommand {
            name: "compact".to_string(),
            description: "Compact the conversation".to_string(),
            argument_hint: None,
        }])
    }

    async fn account_info(&self) -> Result<Value> {
        Ok(json!({ "email": "test@example.com" }))
    }

    async fn mcp_server_status(&self) -> Result<Vec<McpServerStatus>> {
        Ok(Vec::new())
    }

    async fn initialization_result(&self) -> Result<InitSnapshot> {
        Ok(InitSnapshot {
            commands: self.supported_commands().await?,
            models: self.supported_models().await?,
            account: self.account_info().await?,
            output_style: Some("default".to_string()),
        })
    }
}

#[derive(Default)]
struct FakeProtocolState {
    queries: Vec<FakeQuery>,
    fail_next: Option<String>,
    auto_reply: bool,
}

/// Scripted [`StreamingProtocol`].
///
/// In manual mode the test drives every event through the [`FakeQuery`]
/// handles. With auto-reply each received user turn is answered with an
/// `init` (first turn only), an `assistant` echo and a `result`.
#[derive(Clone, Default)]
pub struct FakeProtocol {
    state: Arc<Mutex<FakeProtocolState>>,
    next_pid: Arc<AtomicU32>,
}

impl FakeProtocol {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn auto_reply() -> Self {
        let protocol = Self::default();
        protocol.state.lock().auto_reply = true;
        protocol
    }

    /// Make the next `query` fail with a process error
    pub fn fail_next(&self, message: &str) {
        self.state.lock().fail_next = Some(message.to_string());
    }

    /// Number of queries started (processes spawned)
    pub fn spawn_count(&self) -> usize {
        self.state.lock().queries.len()
    }

    pub fn queries(&self) -> Vec<FakeQuery> {
        self.state.lock().queries.clone()
    }

    pub fn last(&self) -> Option<FakeQuery> {
        self.state.lock().queries.last().cloned()
    }

    fn reply(query: &FakeQuery, message: &Value, turn: usize) {
        if turn == 1 {
            let resume_id = query
                .resume()
                .unwrap_or_else(|| format!("conv-{}", query.inner.index));
            query.emit_init(&resume_id);
        }
        let text = match &message["message"]["content"] {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        query.emit_assistant(&format!("echo: {}", text));
        query.emit_result(0.01 * turn as f64);
    }
}

#[async_trait]
impl StreamingProtocol for FakeProtocol {
    async fn query(&self, mut input: BridgeReceiver<Value>, options: QueryOptions) -> Result<QueryStream> {
        let (index, auto_reply) = {
            let mut state = self.state.lock();
            if let Some(message) = state.fail_next.take() {
                return Err(Error::Process(message));
            }
            (state.queries.len(), state.auto_reply)
        };

        let mut request = SpawnRequest {
            program: "fake-cli".to_string(),
            args: Vec::new(),
            cwd: options.cwd.clone(),
            env: options.env.clone(),
        };
        let pid = 10_000 + self.next_pid.fetch_add(1, Ordering::SeqCst);
        if let Some(hook) = &options.spawn_hook {
            hook.prepare(&mut request);
            hook.spawned(pid);
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        let query = FakeQuery {
            inner: Arc::new(FakeQueryInner {
                index,
                pid,
                options,
                request,
                sender: Mutex::new(Some(sender)),
                received: Mutex::new(Vec::new()),
                interrupts: AtomicUsize::new(0),
                interrupt_fails: AtomicBool::new(false),
                close_reports_exit: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                input_ended: AtomicBool::new(false),
                model_changes: Mutex::new(Vec::new()),
            }),
        };
        self.state.lock().queries.push(query.clone());

        let reader = query.clone();
        tokio::spawn(async move {
            let mut turn = 0;
            while let Some(message) = input.recv().await {
                turn += 1;
                reader.inner.received.lock().push(message.clone());
                if auto_reply {
                    Self::reply(&reader, &message, turn);
                }
            }
            // Like the CLI, exit once stdin is closed
            reader.inner.input_ended.store(true, Ordering::SeqCst);
            reader.finish();
        });

        Ok(QueryStream {
            events: Box::pin(stream::unfold(receiver, |mut receiver| async move {
                receiver.recv().await.map(|event| (event, receiver))
            })),
            control: Arc::new(query),
        })
    }
}

// ---------------------------------------------------------------------------
// Notifier, tree killer, store
// ---------------------------------------------------------------------------

/// Notifier that keeps every notification
#[derive(Debug, Default, Clone)]
pub struct RecordingNotifier {
    notifications: Arc<Mutex<Vec<Notification>>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<Notification> {
        self.notifications.lock().clone()
    }

    /// Notifications on one channel, e.g. `"agent:status"`
    pub fn on_channel(&self, channel: &str) -> Vec<Notification> {
        self.notifications
            .lock()
            .iter()
            .filter(|n| n.channel() == channel)
            .cloned()
            .collect()
    }

    pub fn count(&self, channel: &str) -> usize {
        self.on_channel(channel).len()
    }

    pub fn clear(&self) {
        self.notifications.lock().clear();
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: Notification) {
        self.notifications.lock().push(notification);
    }
}

/// Tree killer that only records the pids it was asked to kill
#[derive(Debug, Default, Clone)]
pub struct FakeTreeKiller {
    killed: Arc<Mutex<Vec<u32>>>,
    fail: Arc<AtomicBool>,
}

impl FakeTreeKiller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn killed(&self) -> Vec<u32> {
        self.killed.lock().clone()
    }

    /// Make every later kill fail after recording it
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl TreeKiller for FakeTreeKiller {
    fn kill_tree(&self, pid: u32) -> std::result::Result<(), TerminateError> {
        self.killed.lock().push(pid);
        if self.fail.load(Ordering::SeqCst) {
            return Err(TerminateError::Unsupported);
        }
        Ok(())
    }
}

/// Store whose every operation fails
#[derive(Debug, Default, Clone, Copy)]
pub struct FailingStore;

impl FailingStore {
    fn error() -> Error {
        Error::Storage("store unavailable".to_string())
    }
}

impl SessionStore for FailingStore {
    fn create_session(&self, _record: &AgentSessionRecord) -> Result<()> {
        Err(Self::error())
    }

    fn update_session(&self, _record: &AgentSessionRecord) -> Result<()> {
        Err(Self::error())
    }

    fn close_session(&self, _id: &str) -> Result<()> {
        Err(Self::error())
    }

    fn delete_session(&self, _id: &str) -> Result<()> {
        Err(Self::error())
    }

    fn append_transcript(&self, _id: &str, _entry: &TranscriptEntry) -> Result<()> {
        Err(Self::error())
    }

    fn get_session(&self, _id: &str) -> Result<Option<AgentSessionRecord>> {
        Err(Self::error())
    }

    fn load_transcript(&self, _id: &str) -> Result<Vec<TranscriptEntry>> {
        Err(Self::error())
    }

    fn list_sessions(&self) -> Result<Vec<AgentSessionRecord>> {
        Err(Self::error())
    }
}

// ---------------------------------------------------------------------------
// Pseudo-terminal
// ---------------------------------------------------------------------------

struct FakePtyInner {
    pid: u32,
    request: PtySpawnRequest,
    callbacks: PtyCallbacks,
    /// Exit after this many interrupts; never when `None`
    exit_after: Option<usize>,
    writes: Mutex<Vec<Vec<u8>>>,
    sizes: Mutex<Vec<(u16, u16)>>,
    interrupts: AtomicUsize,
    interrupted_at: Mutex<Vec<Instant>>,
    kills: AtomicUsize,
    exited: AtomicBool,
}

impl FakePtyInner {
    fn exit(&self, code: Option<i32>) {
        if !self.exited.swap(true, Ordering::SeqCst) {
            (self.callbacks.on_exit)(code);
        }
    }
}

/// Handle on one process spawned by [`FakePtyBackend`]
#[derive(Clone)]
pub struct FakePtyHandle {
    inner: Arc<FakePtyInner>,
}

impl FakePtyHandle {
    pub fn pid(&self) -> u32 {
        self.inner.pid
    }

    pub fn request(&self) -> PtySpawnRequest {
        self.inner.request.clone()
    }

    /// Everything written to the terminal, lossily decoded
    pub fn written(&self) -> String {
        let writes = self.inner.writes.lock();
        writes
            .iter()
            .map(|w| String::from_utf8_lossy(w).into_owned())
            .collect()
    }

    pub fn sizes(&self) -> Vec<(u16, u16)> {
        self.inner.sizes.lock().clone()
    }

    pub fn interrupts(&self) -> usize {
        self.inner.interrupts.load(Ordering::SeqCst)
    }

    /// When each interrupt arrived, on the tokio clock
    pub fn interrupted_at(&self) -> Vec<Instant> {
        self.inner.interrupted_at.lock().clone()
    }

    pub fn kills(&self) -> usize {
        self.inner.kills.load(Ordering::SeqCst)
    }

    pub fn has_exited(&self) -> bool {
        self.inner.exited.load(Ordering::SeqCst)
    }

    /// Produce terminal output
    pub fn output(&self, data: &str) {
        (self.inner.callbacks.on_data)(data.as_bytes());
    }

    /// Exit on its own
    pub fn exit(&self, code: i32) {
        self.inner.exit(Some(code));
    }
}

struct FakePtyProcess {
    inner: Arc<FakePtyInner>,
}

impl PtyProcess for FakePtyProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.inner.pid)
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        if data == [0x03] {
            self.inner.interrupted_at.lock().push(Instant::now());
            let count = self.inner.interrupts.fetch_add(1, Ordering::SeqCst) + 1;
            if self.inner.exit_after.is_some_and(|n| count >= n) {
                self.inner.exit(Some(130));
            }
            return Ok(());
        }
        self.inner.writes.lock().push(data.to_vec());
        Ok(())
    }

    fn resize(&mut self, cols: u16, rows: u16) -> Result<()> {
        self.inner.sizes.lock().push((cols, rows));
        Ok(())
    }

    fn kill(&mut self) -> Result<()> {
        self.inner.kills.fetch_add(1, Ordering::SeqCst);
        self.inner.exit(None);
        Ok(())
    }
}

#[derive(Default)]
struct FakePtyBackendState {
    spawned: Vec<FakePtyHandle>,
    fail_spawn: Option<String>,
    exit_after: Option<usize>,
}

/// Backend spawning [`FakePtyHandle`] processes
#[derive(Clone, Default)]
pub struct FakePtyBackend {
    state: Arc<Mutex<FakePtyBackendState>>,
    next_pid: Arc<AtomicU32>,
}

impl FakePtyBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Later processes exit after `n` interrupts; `None` ignores interrupts
    pub fn exit_after_interrupts(&self, n: Option<usize>) {
        self.state.lock().exit_after = n;
    }

    pub fn fail_spawn(&self, message: &str) {
        self.state.lock().fail_spawn = Some(message.to_string());
    }

    pub fn spawned(&self) -> Vec<FakePtyHandle> {
        self.state.lock().spawned.clone()
    }

    pub fn last(&self) -> Option<FakePtyHandle> {
        self.state.lock().spawned.last().cloned()
    }
}

impl PtyBackend for FakePtyBackend {
    fn spawn(&self, request: PtySpawnRequest, callbacks: PtyCallbacks) -> Result<Box<dyn PtyProcess>> {
        let mut state = self.state.lock();
        if let Some(message) = state.fail_spawn.take() {
            return Err(Error::Process(message));
        }

        let inner = Arc::new(FakePtyInner {
            pid: 20_000 + self.next_pid.fetch_add(1, Ordering::SeqCst),
            request,
            callbacks,
            exit_after: state.exit_after,
            writes: Mutex::new(Vec::new()),
            sizes: Mutex::new(Vec::new()),
            interrupts: AtomicUsize::new(0),
            interrupted_at: Mutex::new(Vec::new()),
            kills: AtomicUsize::new(0),
            exited: AtomicBool::new(false),
        });
        state.spawned.push(FakePtyHandle {
            inner: inner.clone(),
        });
        Ok(Box::new(FakePtyProcess { inner }))
    }
}
