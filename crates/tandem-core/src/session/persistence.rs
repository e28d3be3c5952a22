//! Session persistence - save and load agent session records
//!
//! The registry only ever talks to a [`SessionStore`], and always
//! best-effort: a failing store is logged at the call site and never changes
//! the session state machine.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};

/// Whether a persisted session may still be reopened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Open,
    Closed,
}

/// Persisted state of one agent session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSessionRecord {
    pub id: String,
    pub kind: String,
    pub cwd: PathBuf,
    /// Resumable conversation identity issued by the streaming protocol
    pub resume_id: Option<String>,
    pub status: RecordStatus,
    /// Credential profile snapshot taken at creation
    pub profile_id: Option<String>,
    /// Older records were written without it
    #[serde(default)]
    pub profile_base_url: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub total_cost_usd: f64,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub turns: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Who produced a transcript entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptRole {
    User,
    Assistant,
    ToolUse,
}

/// One line of a session transcript
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub id: String,
    pub role: TranscriptRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_input: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl TranscriptEntry {
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(TranscriptRole::User, content.into())
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(TranscriptRole::Assistant, content.into())
    }

    pub fn tool_use(id: impl Into<String>, name: impl Into<String>, input: serde_json::Value) -> Self {
        let name = name.into();
        Self {
            id: id.into(),
            role: TranscriptRole::ToolUse,
            content: name.clone(),
            tool_name: Some(name),
            tool_input: Some(input),
            created_at: Utc::now(),
        }
    }

    fn new(role: TranscriptRole, content: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            content,
            tool_name: None,
            tool_input: None,
            created_at: Utc::now(),
        }
    }
}

/// Narrow CRUD surface the agent registry persists through
pub trait SessionStore: Send + Sync {
    fn create_session(&self, record: &AgentSessionRecord) -> Result<()>;
    fn update_session(&self, record: &AgentSessionRecord) -> Result<()>;
    /// Mark a record closed
    fn close_session(&self, id: &str) -> Result<()>;
    fn delete_session(&self, id: &str) -> Result<()>;
    fn append_transcript(&self, id: &str, entry: &TranscriptEntry) -> Result<()>;
    fn get_session(&self, id: &str) -> Result<Option<AgentSessionRecord>>;
    fn load_transcript(&self, id: &str) -> Result<Vec<TranscriptEntry>>;
    /// All records, most recently updated first
    fn list_sessions(&self) -> Result<Vec<AgentSessionRecord>>;
}

/// Stores each session as `<id>.json` with its transcript in `<id>.jsonl`
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    fn transcript_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.jsonl", id))
    }

    fn write_record(&self, record: &AgentSessionRecord) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let json = serde_json::to_string_pretty(record)?;
        std::fs::write(self.record_path(&record.id), json)?;
        Ok(())
    }
}

impl SessionStore for JsonFileStore {
    fn create_session(&self, record: &AgentSessionRecord) -> Result<()> {
        if self.record_path(&record.id).exists() {
            return Err(Error::Storage(format!("Session {} already exists", record.id)));
        }
        self.write_record(record)
    }

    fn update_session(&self, record: &AgentSessionRecord) -> Result<()> {
        self.write_record(record)
    }

    fn close_session(&self, id: &str) -> Result<()> {
        let mut record = self
            .get_session(id)?
            .ok_or_else(|| Error::Storage(format!("No record for session {}", id)))?;
        record.status = RecordStatus::Closed;
        record.updated_at = Utc::now();
        self.write_record(&record)
    }

    fn delete_session(&self, id: &str) -> Result<()> {
        for path in [self.record_path(id), self.transcript_path(id)] {
            if path.exists() {
                std::fs::remove_file(path)?;
            }
        }
        Ok(())
    }

    fn append_transcript(&self, id: &str, entry: &TranscriptEntry) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.transcript_path(id))?;
        let line = serde_json::to_string(entry)?;
        writeln!(file, "{}", line)?;
        Ok(())
    }

    fn get_session(&self, id: &str) -> Result<Option<AgentSessionRecord>> {
        let path = self.record_path(id);
        if !path.exists() {
            return Ok(None);
        }

        let json = std::fs::read_to_string(&path)?;
        let record: AgentSessionRecord = serde_json::from_str(&json)?;
        Ok(Some(record))
    }

    fn load_transcript(&self, id: &str) -> Result<Vec<TranscriptEntry>> {
        let path = self.transcript_path(id);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let content = std::fs::read_to_string(&path)?;
        let mut entries = Vec::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!("Skipping bad transcript line in {:?}: {}", path, e),
            }
        }
        Ok(entries)
    }

    fn list_sessions(&self) -> Result<Vec<AgentSessionRecord>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut sessions = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                match std::fs::read_to_string(&path) {
                    Ok(json) => match serde_json::from_str::<AgentSessionRecord>(&json) {
                        Ok(session) => sessions.push(session),
                        Err(e) => warn!("Failed to parse session {:?}: {}", path, e),
                    },
                    Err(e) => warn!("Failed to read session {:?}: {}", path, e),
                }
            }
        }

        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(sessions)
    }
}

/// In-process store, for tests and ephemeral front-ends
#[derive(Debug, Default)]
pub struct MemoryStore {
    sessions: Mutex<HashMap<String, (AgentSessionRecord, Vec<TranscriptEntry>)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemoryStore {
    fn create_session(&self, record: &AgentSessionRecord) -> Result<()> {
        let mut sessions = self.sessions.lock();
        if sessions.contains_key(&record.id) {
            return Err(Error::Storage(format!("Session {} already exists", record.id)));
        }
        sessions.insert(record.id.clone(), (record.clone(), Vec::new()));
        Ok(())
    }

    fn update_session(&self, record: &AgentSessionRecord) -> Result<()> {
        let mut sessions = self.sessions.lock();
        match sessions.get_mut(&record.id) {
            Some((existing, _)) => *existing = record.clone(),
            None => {
                sessions.insert(record.id.clone(), (record.clone(), Vec::new()));
            }
        }
        Ok(())
    }

    fn close_session(&self, id: &str) -> Result<()> {
        let mut sessions = self.sessions.lock();
        let (record, _) = sessions
            .get_mut(id)
            .ok_or_else(|| Error::Storage(format!("No record for session {}", id)))?;
        record.status = RecordStatus::Closed;
        record.updated_at = Utc::now();
        Ok(())
    }

    fn delete_session(&self, id: &str) -> Result<()> {
        self.sessions.lock().remove(id);
        Ok(())
    }

    fn append_transcript(&self, id: &str, entry: &TranscriptEntry) -> Result<()> {
        let mut sessions = self.sessions.lock();
        let (_, transcript) = sessions
            .get_mut(id)
            .ok_or_else(|| Error::Storage(format!("No record for session {}", id)))?;
        transcript.push(entry.clone());
        Ok(())
    }

    fn get_session(&self, id: &str) -> Result<Option<AgentSessionRecord>> {
        Ok(self.sessions.lock().get(id).map(|(r, _)| r.clone()))
    }

    fn load_transcript(&self, id: &str) -> Result<Vec<TranscriptEntry>> {
        Ok(self
            .sessions
            .lock()
            .get(id)
            .map(|(_, t)| t.clone())
            .unwrap_or_default())
    }

    fn list_sessions(&self) -> Result<Vec<AgentSessionRecord>> {
        let mut sessions: Vec<_> = self.sessions.lock().values().map(|(r, _)| r.clone()).collect();
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(sessions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str) -> AgentSessionRecord {
        let now = Utc::now();
        AgentSessionRecord {
            id: id.to_string(),
            kind: "chat".to_string(),
            cwd: PathBuf::from("/tmp"),
            resume_id: None,
            status: RecordStatus::Open,
            profile_id: None,
            profile_base_url: None,
            model: None,
            total_cost_usd: 0.0,
            input_tokens: 0,
            output_tokens: 0,
            turns: 0,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_memory_store_lifecycle() {
        let store = MemoryStore::new();
        store.create_session(&record("a")).unwrap();
        assert!(store.create_session(&record("a")).is_err());

        store.append_transcript("a", &TranscriptEntry::user("hi")).unwrap();
        store.close_session("a").unwrap();

        let loaded = store.get_session("a").unwrap().unwrap();
        assert_eq!(loaded.status, RecordStatus::Closed);
        assert_eq!(store.load_transcript("a").unwrap().len(), 1);

        store.delete_session("a").unwrap();
        assert!(store.get_session("a").unwrap().is_none());
    }

    #[test]
    fn test_record_without_base_url_still_parses() {
        let json = r#"{
            "id": "old", "kind": "chat", "cwd": "/tmp", "resume_id": "r1",
            "status": "open", "profile_id": "work",
            "created_at": "2024-01-01T00:00:00Z", "updated_at": "2024-01-01T00:00:00Z"
        }"#;
        let record: AgentSessionRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.profile_base_url, None);
        assert_eq!(record.resume_id.as_deref(), Some("r1"));
    }
}
