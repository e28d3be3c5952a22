//! Typed events of the streaming protocol
//!
//! The CLI emits one JSON object per line, tagged by `type` (and `subtype`
//! for system events). Every line becomes a [`StreamEvent`]; a tag we do not
//! know, or a payload that does not fit its variant, becomes
//! [`StreamEvent::Unknown`] carrying the raw object.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};

/// One event pulled from a query's output
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// `system/init`: carries the resumable conversation identity
    Init(InitEvent),
    /// `system/compact_boundary`
    CompactBoundary(CompactBoundaryEvent),
    /// `assistant`: a complete assistant turn
    Assistant(AssistantEvent),
    /// `stream_event`: incremental delta of the turn in progress
    PartialDelta(PartialDeltaEvent),
    /// `result`: the turn finished
    Result(ResultEvent),
    /// `tool_progress`: heartbeat of a running tool
    ToolProgress(ToolProgressEvent),
    /// Anything else, verbatim
    Unknown(Value),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitEvent {
    pub session_id: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub slash_commands: Vec<String>,
    #[serde(default)]
    pub mcp_servers: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompactMetadata {
    #[serde(default)]
    pub trigger: Option<String>,
    #[serde(default)]
    pub pre_tokens: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactBoundaryEvent {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub compact_metadata: CompactMetadata,
}

/// Token usage as reported by the CLI
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_input_tokens: u64,
    pub cache_read_input_tokens: u64,
}

/// A block of assistant content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantEvent {
    pub message: AssistantMessage,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub parent_tool_use_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialDeltaEvent {
    pub event: Value,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEvent {
    pub subtype: String,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub num_turns: Option<u64>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    /// Cost of this query so far, as reported by the CLI
    #[serde(default)]
    pub total_cost_usd: Option<f64>,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub usage: Option<Usage>,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolProgressEvent {
    pub tool_use_id: String,
    pub tool_name: String,
    #[serde(default, alias = "elapsed_seconds")]
    pub elapsed_time_seconds: f64,
}

impl StreamEvent {
    /// Classify one parsed JSON object
    pub fn from_value(value: Value) -> Self {
        let kind = value.get("type").and_then(Value::as_str).map(str::to_owned);
        let subtype = value.get("subtype").and_then(Value::as_str).map(str::to_owned);

        match (kind.as_deref(), subtype.as_deref()) {
            (Some("system"), Some("init")) => parse(value, Self::Init),
            (Some("system"), Some("compact_boundary")) => parse(value, Self::CompactBoundary),
            (Some("assistant"), _) => parse(value, Self::Assistant),
            (Some("stream_event"), _) => parse(value, Self::PartialDelta),
            (Some("result"), _) => parse(value, Self::Result),
            (Some("tool_progress"), _) => parse(value, Self::ToolProgress),
            _ => Self::Unknown(value),
        }
    }

    /// Parse one line of CLI output
    pub fn from_line(line: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(line)
            .map_err(|e| Error::Protocol(format!("Malformed event line: {}", e)))?;
        Ok(Self::from_value(value))
    }

    /// Short tag for logging
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Init(_) => "init",
            Self::CompactBoundary(_) => "compact_boundary",
            Self::Assistant(_) => "assistant",
            Self::PartialDelta(_) => "stream_event",
            Self::Result(_) => "result",
            Self::ToolProgress(_) => "tool_progress",
            Self::Unknown(_) => "unknown",
        }
    }
}

fn parse<T: DeserializeOwned>(value: Value, wrap: fn(T) -> StreamEvent) -> StreamEvent {
    match T::deserialize(&value) {
        Ok(event) => wrap(event),
        Err(e) => {
            debug!("Event did not fit its variant, passing through: {}", e);
            StreamEvent::Unknown(value)
        }
    }
}
