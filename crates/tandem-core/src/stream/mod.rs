//! Streaming protocol abstraction
//!
//! A query takes a pull-based sequence of user turns (a [`BridgeReceiver`])
//! and returns a pull-based sequence of [`StreamEvent`]s plus a control
//! handle for out-of-band operations on the running conversation.

mod cli;
mod event;

pub use cli::CliProtocol;
pub use event::{
    AssistantEvent, AssistantMessage, CompactBoundaryEvent, CompactMetadata, ContentBlock,
    InitEvent, PartialDeltaEvent, ResultEvent, StreamEvent, ToolProgressEvent, Usage,
};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bridge::BridgeReceiver;
use crate::error::Result;

/// The command line a query is about to launch
#[derive(Debug, Clone, PartialEq)]
pub struct SpawnRequest {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
}

/// Lets the caller observe and adjust the child process of a query
pub trait ProcessSpawnHook: Send + Sync {
    /// Called before launch; may rewrite the command line
    fn prepare(&self, _request: &mut SpawnRequest) {}

    /// Called with the real pid once the child is running
    fn spawned(&self, pid: u32);
}

/// Options for one query
#[derive(Clone, Default)]
pub struct QueryOptions {
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
    pub model: Option<String>,
    pub max_turns: Option<u32>,
    /// Resumable conversation identity to reattach to
    pub resume: Option<String>,
    pub spawn_hook: Option<Arc<dyn ProcessSpawnHook>>,
}

impl std::fmt::Debug for QueryOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryOptions")
            .field("cwd", &self.cwd)
            .field("model", &self.model)
            .field("max_turns", &self.max_turns)
            .field("resume", &self.resume)
            .field("spawn_hook", &self.spawn_hook.is_some())
            .finish()
    }
}

/// A slash command the CLI accepts
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SlashCommand {
    pub name: String,
    pub description: String,
    pub argument_hint: Option<String>,
}

/// A model the CLI can switch to
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ModelInfo {
    pub value: String,
    pub display_name: String,
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct McpServerStatus {
    pub name: String,
    pub status: String,
    pub server_info: Option<Value>,
}

/// Reply to the initialize handshake
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct InitSnapshot {
    pub commands: Vec<SlashCommand>,
    pub models: Vec<ModelInfo>,
    pub account: Value,
    pub output_style: Option<String>,
}

/// Out-of-band operations on a running query
#[async_trait]
pub trait QueryControl: Send + Sync {
    /// Interrupt the turn in flight; the conversation stays open
    async fn interrupt(&self) -> Result<()>;

    /// Tear the query down. Synchronous so shutdown paths can call it.
    fn close(&self);

    async fn set_model(&self, model: Option<String>) -> Result<()>;

    async fn supported_models(&self) -> Result<Vec<ModelInfo>>;

    async fn supported_commands(&self) -> Result<Vec<SlashCommand>>;

    async fn account_info(&self) -> Result<Value>;

    async fn mcp_server_status(&self) -> Result<Vec<McpServerStatus>>;

    async fn initialization_result(&self) -> Result<InitSnapshot>;
}

/// A running query
pub struct QueryStream {
    pub events: BoxStream<'static, Result<StreamEvent>>,
    pub control: Arc<dyn QueryControl>,
}

/// Starts multi-turn queries
#[async_trait]
pub trait StreamingProtocol: Send + Sync {
    async fn query(&self, input: BridgeReceiver<Value>, options: QueryOptions) -> Result<QueryStream>;
}
