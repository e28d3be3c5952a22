//! Streaming protocol backed by the assistant CLI
//!
//! The CLI is launched once per query and kept alive across turns:
//!
//! ```text
//!  bridge ──writer task──▶ stdin   (user turns + control requests)
//!  events ◀─reader task─── stdout  (events + control responses)
//!                          stderr ──▶ debug log, tail kept for errors
//! ```
//!
//! Control requests are correlated with their responses by request id.

use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::{
    InitSnapshot, McpServerStatus, ModelInfo, QueryControl, QueryOptions, QueryStream,
    SlashCommand, SpawnRequest, StreamEvent, StreamingProtocol,
};
use crate::bridge::BridgeReceiver;
use crate::config::CliConfig;
use crate::error::{Error, Result};

const INIT_TIMEOUT: Duration = Duration::from_secs(30);
const CONTROL_TIMEOUT: Duration = Duration::from_secs(30);
const STDERR_TAIL_LINES: usize = 20;

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<Result<Value>>>>>;

/// Launches the assistant CLI in stream-json mode
#[derive(Debug, Clone)]
pub struct CliProtocol {
    program: String,
    extra_args: Vec<String>,
}

impl CliProtocol {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            extra_args: Vec::new(),
        }
    }

    pub fn from_config(config: &CliConfig) -> Self {
        Self {
            program: config.program.clone(),
            extra_args: config.extra_args.clone(),
        }
    }

    fn build_request(&self, options: &QueryOptions) -> SpawnRequest {
        let mut args: Vec<String> = [
            "--input-format",
            "stream-json",
            "--output-format",
            "stream-json",
            "--verbose",
            "--include-partial-messages",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        if let Some(model) = &options.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        if let Some(max_turns) = options.max_turns {
            args.push("--max-turns".to_string());
            args.push(max_turns.to_string());
        }
        if let Some(resume) = &options.resume {
            args.push("--resume".to_string());
            args.push(resume.clone());
        }
        args.extend(self.extra_args.iter().cloned());

        SpawnRequest {
            program: self.program.clone(),
            args,
            cwd: options.cwd.clone(),
            env: options.env.clone(),
        }
    }
}

#[async_trait]
impl StreamingProtocol for CliProtocol {
    async fn query(&self, mut input: BridgeReceiver<Value>, options: QueryOptions) -> Result<QueryStream> {
        let mut request = self.build_request(&options);
        if let Some(hook) = &options.spawn_hook {
            hook.prepare(&mut request);
        }

        let mut cmd = Command::new(&request.program);
        cmd.args(&request.args)
            .current_dir(&request.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if !request.env.is_empty() {
            cmd.env_clear().envs(&request.env);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Process(format!("Failed to spawn {}: {}", request.program, e)))?;
        let pid = child.id();
        info!("Started {} (pid {:?}) in {:?}", request.program, pid, request.cwd);
        if let (Some(hook), Some(pid)) = (&options.spawn_hook, pid) {
            hook.spawned(pid);
        }

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Process("Failed to capture stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Process("Failed to capture stdout".to_string()))?;
        let stderr = child.stderr.take();

        let control = Arc::new(CliControl {
            stdin: Arc::new(tokio::sync::Mutex::new(Some(stdin))),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            closed: Arc::new(AtomicBool::new(false)),
            pid,
            init: Mutex::new(None),
        });

        let stderr_tail = Arc::new(Mutex::new(VecDeque::new()));
        if let Some(stderr) = stderr {
            let tail = stderr_tail.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("cli stderr: {}", line);
                    let mut tail = tail.lock();
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            });
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel::<Result<StreamEvent>>();
        {
            let pending = control.pending.clone();
            let closed = control.closed.clone();
            let program = request.program.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => {
                            let line = line.trim();
                            if line.is_empty() {
                                continue;
                            }
                            let value: Value = match serde_json::from_str(line) {
                                Ok(value) => value,
                                Err(e) => {
                                    debug!("Skipping non-JSON output line: {}", e);
                                    continue;
                                }
                            };
                            if value.get("type").and_then(Value::as_str) == Some("control_response") {
                                route_control_response(&pending, &value);
                                continue;
                            }
                            let _ = events_tx.send(Ok(StreamEvent::from_value(value)));
                        }
                        Ok(None) => break,
                        Err(e) => {
                            let _ = events_tx.send(Err(Error::Io(e)));
                            break;
                        }
                    }
                }

                let status = child.wait().await;
                pending.lock().clear();

                if closed.load(Ordering::SeqCst) {
                    let _ = events_tx.send(Err(Error::Cancelled));
                    return;
                }
                match status {
                    Ok(status) if status.success() => debug!("{} exited cleanly", program),
                    Ok(status) => {
                        let tail: Vec<String> = stderr_tail.lock().iter().cloned().collect();
                        let mut message = format!("{} exited with {}", program, status);
                        if !tail.is_empty() {
                            message.push_str(": ");
                            message.push_str(&tail.join("\n"));
                        }
                        let _ = events_tx.send(Err(Error::Process(message)));
                    }
                    Err(e) => {
                        let _ = events_tx.send(Err(Error::Io(e)));
                    }
                }
            });
        }

        let init = match tokio::time::timeout(
            INIT_TIMEOUT,
            control.request(json!({ "subtype": "initialize" })),
        )
        .await
        {
            Ok(Ok(reply)) => serde_json::from_value::<InitSnapshot>(reply).unwrap_or_else(|e| {
                warn!("Unexpected initialize reply: {}", e);
                InitSnapshot::default()
            }),
            Ok(Err(e)) => {
                control.close();
                return Err(e);
            }
            Err(_) => {
                control.close();
                return Err(Error::Protocol("Timed out waiting for initialize".to_string()));
            }
        };
        *control.init.lock() = Some(init);

        {
            let stdin = control.stdin.clone();
            tokio::spawn(async move {
                while let Some(message) = input.recv().await {
                    if let Err(e) = write_line(&stdin, &message).await {
                        warn!("Failed to write user turn: {}", e);
                        break;
                    }
                }
                // Input ended; closing stdin lets the CLI finish on its own
                stdin.lock().await.take();
            });
        }

        let events = futures::stream::unfold(events_rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        })
        .boxed();

        Ok(QueryStream { events, control })
    }
}

async fn write_line(stdin: &tokio::sync::Mutex<Option<ChildStdin>>, value: &Value) -> Result<()> {
    let mut guard = stdin.lock().await;
    let stdin = guard
        .as_mut()
        .ok_or_else(|| Error::Protocol("stdin already closed".to_string()))?;
    let json = serde_json::to_string(value)?;
    stdin.write_all(json.as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await?;
    Ok(())
}

fn route_control_response(
    pending: &Mutex<HashMap<String, oneshot::Sender<Result<Value>>>>,
    value: &Value,
) {
    let Some(response) = value.get("response") else {
        return;
    };
    let Some(id) = response.get("request_id").and_then(Value::as_str) else {
        return;
    };
    let Some(tx) = pending.lock().remove(id) else {
        debug!("Control response for unknown request {}", id);
        return;
    };

    let result = match response.get("subtype").and_then(Value::as_str) {
        Some("success") => Ok(response.get("response").cloned().unwrap_or(Value::Null)),
        _ => Err(Error::Protocol(
            response
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("control request failed")
                .to_string(),
        )),
    };
    let _ = tx.send(result);
}

/// Control handle of a running CLI query
struct CliControl {
    stdin: Arc<tokio::sync::Mutex<Option<ChildStdin>>>,
    pending: PendingMap,
    next_id: AtomicU64,
    closed: Arc<AtomicBool>,
    pid: Option<u32>,
    init: Mutex<Option<InitSnapshot>>,
}

impl CliControl {
    async fn request(&self, request: Value) -> Result<Value> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Cancelled);
        }

        let id = format!("req_{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id.clone(), tx);

        let line = json!({
            "type": "control_request",
            "request_id": id,
            "request": request,
        });
        if let Err(e) = write_line(&self.stdin, &line).await {
            self.pending.lock().remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(CONTROL_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Process("CLI exited before replying".to_string())),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(Error::Protocol(format!("Control request {} timed out", id)))
            }
        }
    }

    fn snapshot(&self) -> Result<InitSnapshot> {
        self.init
            .lock()
            .clone()
            .ok_or_else(|| Error::Protocol("Query not initialized".to_string()))
    }
}

#[async_trait]
impl QueryControl for CliControl {
    async fn interrupt(&self) -> Result<()> {
        self.request(json!({ "subtype": "interrupt" })).await.map(|_| ())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(pid) = self.pid {
            if let Err(e) = tandem_process::kill_tree(pid) {
                warn!("Failed to kill CLI process {}: {}", pid, e);
            }
        }
    }

    async fn set_model(&self, model: Option<String>) -> Result<()> {
        self.request(json!({ "subtype": "set_model", "model": model }))
            .await
            .map(|_| ())
    }

    async fn supported_models(&self) -> Result<Vec<ModelInfo>> {
        Ok(self.snapshot()?.models)
    }

    async fn supported_commands(&self) -> Result<Vec<SlashCommand>> {
        Ok(self.snapshot()?.commands)
    }

    async fn account_info(&self) -> Result<Value> {
        Ok(self.snapshot()?.account)
    }

    async fn mcp_server_status(&self) -> Result<Vec<McpServerStatus>> {
        let reply = self.request(json!({ "subtype": "mcp_status" })).await?;
        let servers = reply.get("mcpServers").cloned().unwrap_or(Value::Array(Vec::new()));
        Ok(serde_json::from_value(servers)?)
    }

    async fn initialization_result(&self) -> Result<InitSnapshot> {
        self.snapshot()
    }
}
