//! Event dispatch loop
//!
//! One loop per live stream. It pulls events one at a time, updates the
//! session, persists what must survive, and notifies the observer. Errors
//! end the loop but never escape it.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use futures::StreamExt;
use futures::stream::BoxStream;
use tracing::{debug, error, info, warn};

use super::persistence::TranscriptEntry;
use super::registry::{AgentSession, Shared};
use super::types::AgentStatus;
use crate::error::{Error, Result};
use crate::notify::Notification;
use crate::stream::{AssistantEvent, ContentBlock, InitEvent, ResultEvent, StreamEvent};

pub(super) struct Dispatcher {
    pub(super) session: Arc<AgentSession>,
    pub(super) shared: Arc<Shared>,
    /// Generation of the stream this loop consumes
    pub(super) generation: u64,
}

impl Dispatcher {
    pub(super) async fn run(self, mut events: BoxStream<'static, Result<StreamEvent>>) {
        let id = self.session.id.clone();
        debug!("Dispatch loop starting for session {} (generation {})", id, self.generation);

        let outcome: Result<()> = async {
            while let Some(event) = events.next().await {
                let event = event?;
                if !self.is_current() {
                    debug!("Dropping {} event of stale stream for {}", event.tag(), id);
                    continue;
                }
                self.handle(event);
            }
            Ok::<(), Error>(())
        }
        .await;

        let (status, message) = match outcome {
            Ok(()) => (AgentStatus::Idle, None),
            Err(e) if e.is_cancellation() => {
                debug!("Stream for session {} cancelled", id);
                (AgentStatus::Idle, None)
            }
            Err(e) if self.session.state.lock().closing => {
                debug!("Stream for session {} ended during close: {}", id, e);
                (AgentStatus::Idle, None)
            }
            Err(e) => {
                let message = e.to_string();
                error!("Stream for session {} failed: {}", id, message);
                (AgentStatus::Error, Some(message))
            }
        };

        self.finish(status, message);
        debug!("Dispatch loop ended for session {}", id);
    }

    fn is_current(&self) -> bool {
        self.session.state.lock().live_generation() == Some(self.generation)
    }

    fn handle(&self, event: StreamEvent) {
        match event {
            StreamEvent::Init(init) => self.on_init(init),
            StreamEvent::CompactBoundary(boundary) => {
                self.notify(Notification::AgentCompaction {
                    session_id: self.session.id.clone(),
                    trigger: boundary.compact_metadata.trigger,
                    pre_tokens: boundary.compact_metadata.pre_tokens,
                });
            }
            StreamEvent::Assistant(assistant) => self.on_assistant(assistant),
            StreamEvent::PartialDelta(delta) => {
                self.notify(Notification::AgentDelta {
                    session_id: self.session.id.clone(),
                    event: delta.event,
                });
            }
            StreamEvent::Result(result) => self.on_result(result),
            StreamEvent::ToolProgress(progress) => {
                self.notify(Notification::AgentToolProgress {
                    session_id: self.session.id.clone(),
                    tool_use_id: progress.tool_use_id,
                    tool_name: progress.tool_name,
                    elapsed_seconds: progress.elapsed_time_seconds,
                });
            }
            StreamEvent::Unknown(payload) => {
                self.notify(Notification::AgentRaw {
                    session_id: self.session.id.clone(),
                    payload,
                });
            }
        }
    }

    fn on_init(&self, init: InitEvent) {
        info!("Session {} attached to conversation {}", self.session.id, init.session_id);
        let record = {
            let mut state = self.session.state.lock();
            state.resume_id = Some(init.session_id.clone());
            if init.model.is_some() {
                state.model = init.model.clone();
            }
            self.session.record(&state)
        };
        self.shared.persist(&record);

        self.notify(Notification::AgentInit {
            session_id: self.session.id.clone(),
            resume_id: init.session_id,
            model: init.model,
            tools: init.tools,
            slash_commands: init.slash_commands,
            mcp_servers: init.mcp_servers,
        });
    }

    fn on_assistant(&self, assistant: AssistantEvent) {
        let message = serde_json::to_value(&assistant.message).unwrap_or_default();
        self.notify(Notification::AgentAssistant {
            session_id: self.session.id.clone(),
            message,
        });

        let entries: Vec<TranscriptEntry> = assistant
            .message
            .content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } if !text.is_empty() => {
                    Some(TranscriptEntry::assistant(text.clone()))
                }
                ContentBlock::ToolUse { id, name, input } => {
                    Some(TranscriptEntry::tool_use(id.clone(), name.clone(), input.clone()))
                }
                _ => None,
            })
            .collect();

        for entry in &entries {
            self.shared.append_transcript(&self.session.id, entry);
        }

        let usage = assistant.message.usage;
        {
            let mut state = self.session.state.lock();
            state.transcript.extend(entries);
            if let Some(usage) = &usage {
                state.input_tokens += usage.input_tokens;
                state.output_tokens += usage.output_tokens;
            }
        }

        if let Some(usage) = usage {
            self.notify(Notification::AgentUsage {
                session_id: self.session.id.clone(),
                usage: serde_json::to_value(usage).unwrap_or_default(),
            });
        }
    }

    fn on_result(&self, result: ResultEvent) {
        let (cost_usd, total_cost_usd, record) = {
            let mut state = self.session.state.lock();
            // The CLI reports the running cost of the whole process
            let reported = result.total_cost_usd.unwrap_or(state.query_cost_usd);
            let cost = (reported - state.query_cost_usd).max(0.0);
            state.query_cost_usd = reported;
            state.total_cost_usd += cost;
            state.turns += 1;
            if state.live.is_some() {
                state.status = AgentStatus::Idle;
            }
            (cost, state.total_cost_usd, self.session.record(&state))
        };
        self.shared.persist(&record);

        self.notify(Notification::AgentStatus {
            session_id: self.session.id.clone(),
            status: AgentStatus::Idle,
            process_exited: false,
            error: None,
        });
        self.notify(Notification::AgentResult {
            session_id: self.session.id.clone(),
            subtype: result.subtype.clone(),
            is_error: result.is_error,
            num_turns: result.num_turns,
            duration_ms: result.duration_ms,
            cost_usd,
            total_cost_usd,
            result: result.result.clone(),
        });

        if let Some(listener) = self.shared.listener() {
            guard_listener(&self.session.id, "on_result", || {
                listener.on_result(&self.session.id, &result)
            });
        }
    }

    /// Clear the live stream if it is still ours and report the final status
    fn finish(&self, status: AgentStatus, message: Option<String>) {
        let cleared = {
            let mut state = self.session.state.lock();
            if state.live_generation() != Some(self.generation) {
                false
            } else {
                if let Some(live) = state.live.take() {
                    live.bridge.end();
                }
                state.loop_handle = None;
                state.status = status;
                *self.session.pid.lock() = None;
                true
            }
        };

        if !cleared {
            debug!(
                "Stream generation {} of {} already detached",
                self.generation, self.session.id
            );
            return;
        }

        if let Some(message) = &message {
            self.notify(Notification::AgentError {
                session_id: self.session.id.clone(),
                message: message.clone(),
            });
            if let Some(listener) = self.shared.listener() {
                guard_listener(&self.session.id, "on_error", || {
                    listener.on_error(&self.session.id, message)
                });
            }
        }

        self.notify(Notification::AgentStatus {
            session_id: self.session.id.clone(),
            status,
            process_exited: true,
            error: message,
        });
    }

    fn notify(&self, notification: Notification) {
        self.shared.notifier.notify(notification);
    }
}

/// Call into an external listener, containing any panic
pub(super) fn guard_listener(session_id: &str, what: &str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        warn!("Session listener {} panicked for session {}", what, session_id);
    }
}
