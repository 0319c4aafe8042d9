//! Session transcript and persistence.
//!
//! A session owns its message list exclusively and keeps cumulative
//! metadata counters alongside it. Crossing the high-water mark compresses
//! the transcript: a leading system message survives, everything up to the
//! most recent twenty messages collapses into one assistant placeholder.
//! Sessions persist to the workspace `history.json` and to a global
//! named-session index so `continue` and `resume <name|id>` can rehydrate.

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use sable_core::{ChatMessage, TokenUsage, runtime_dir};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// High-water mark on the in-memory transcript.
pub const DEFAULT_MAX_MESSAGES: usize = 100;

/// Messages preserved verbatim at the tail after compression.
const KEEP_RECENT: usize = 20;

const TOPIC_HINT_MESSAGES: usize = 5;
const TOPIC_HINT_CHARS: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub messages: Vec<ChatMessage>,
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
    pub project_path: String,
    pub model: String,
    pub tokens: TokenUsage,
    #[serde(default)]
    pub tokens_by_model: BTreeMap<String, TokenUsage>,
    #[serde(default)]
    pub tools_used: BTreeSet<String>,
    #[serde(default)]
    pub successful_tool_calls: u64,
    #[serde(default)]
    pub failed_tool_calls: u64,
    #[serde(default)]
    pub api_time_ms: u64,
    #[serde(default)]
    pub tool_time_ms: u64,
}

fn default_max_messages() -> usize {
    DEFAULT_MAX_MESSAGES
}

impl Session {
    pub fn new(project_path: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            // v7: time-ordered with an entropy tail.
            id: Uuid::now_v7().to_string(),
            started_at: Utc::now(),
            messages: Vec::new(),
            max_messages: DEFAULT_MAX_MESSAGES,
            project_path: project_path.into(),
            model: model.into(),
            tokens: TokenUsage::default(),
            tokens_by_model: BTreeMap::new(),
            tools_used: BTreeSet::new(),
            successful_tool_calls: 0,
            failed_tool_calls: 0,
            api_time_ms: 0,
            tool_time_ms: 0,
        }
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// Append a message, compressing when the transcript crosses the
    /// high-water mark.
    pub fn append(&mut self, message: ChatMessage) {
        self.messages.push(message);
        if self.messages.len() > self.max_messages {
            self.compress_history();
        }
    }

    pub fn record_tool_call(&mut self, name: &str, success: bool, elapsed_ms: u64) {
        self.tools_used.insert(name.to_string());
        if success {
            self.successful_tool_calls += 1;
        } else {
            self.failed_tool_calls += 1;
        }
        self.tool_time_ms += elapsed_ms;
    }

    pub fn record_usage(&mut self, model: &str, usage: &TokenUsage) {
        self.tokens.absorb(usage);
        self.tokens_by_model
            .entry(model.to_string())
            .or_default()
            .absorb(usage);
    }

    pub fn record_api_time(&mut self, elapsed_ms: u64) {
        self.api_time_ms += elapsed_ms;
    }

    /// Collapse everything between a leading system message and the most
    /// recent [`KEEP_RECENT`] messages into one assistant placeholder with
    /// a topic hint from the removed user messages.
    pub fn compress_history(&mut self) {
        let has_system = matches!(self.messages.first(), Some(ChatMessage::System { .. }));
        let head = usize::from(has_system);
        if self.messages.len() <= head + KEEP_RECENT + 1 {
            return;
        }

        let tail_start = self.messages.len() - KEEP_RECENT;
        let removed: Vec<ChatMessage> = self.messages[head..tail_start].to_vec();

        let topics: Vec<String> = removed
            .iter()
            .filter_map(|msg| match msg {
                ChatMessage::User { content } => {
                    Some(content.chars().take(TOPIC_HINT_CHARS).collect::<String>())
                }
                _ => None,
            })
            .take(TOPIC_HINT_MESSAGES)
            .collect();

        let summary = if topics.is_empty() {
            format!(
                "[Previous conversation compressed: {} messages removed]",
                removed.len()
            )
        } else {
            format!(
                "[Previous conversation compressed: {} messages removed. Topics: {}]",
                removed.len(),
                topics.join(", ")
            )
        };

        let mut compressed = Vec::with_capacity(head + 1 + KEEP_RECENT);
        if has_system {
            compressed.push(self.messages[0].clone());
        }
        compressed.push(ChatMessage::Assistant {
            content: Some(summary),
            tool_calls: vec![],
        });
        compressed.extend_from_slice(&self.messages[tail_start..]);
        self.messages = compressed;
    }

    /// First-user-message preview for the session index.
    pub fn preview(&self) -> String {
        self.messages
            .iter()
            .find_map(|msg| match msg {
                ChatMessage::User { content } => {
                    Some(content.chars().take(80).collect::<String>())
                }
                _ => None,
            })
            .unwrap_or_default()
    }
}

// ── Persistence ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionIndexEntry {
    pub id: String,
    pub name: Option<String>,
    pub start_time: DateTime<Utc>,
    pub last_access_time: DateTime<Utc>,
    pub project_path: String,
    pub model: String,
    pub message_count: usize,
    pub preview: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionIndex {
    pub last_session_id: Option<String>,
    #[serde(default)]
    pub sessions: BTreeMap<String, SessionIndexEntry>,
}

/// Disk layout: `<workspace>/.sable/history.json` for the current session,
/// `<global>/sessions/{<id>.json, index.json}` for the named-session store.
/// Single-writer; no cross-process locking.
pub struct SessionStore {
    workspace: PathBuf,
    sessions_root: PathBuf,
}

impl SessionStore {
    pub fn new(workspace: &Path) -> Result<Self> {
        let global = sable_core::global_dir()
            .ok_or_else(|| anyhow!("HOME/USERPROFILE is not set; cannot locate session store"))?;
        Ok(Self::at(workspace, &global.join("sessions")))
    }

    /// Explicit roots, for tests and embedding hosts.
    pub fn at(workspace: &Path, sessions_root: &Path) -> Self {
        Self {
            workspace: workspace.to_path_buf(),
            sessions_root: sessions_root.to_path_buf(),
        }
    }

    fn history_path(&self) -> PathBuf {
        runtime_dir(&self.workspace).join("history.json")
    }

    fn index_path(&self) -> PathBuf {
        self.sessions_root.join("index.json")
    }

    fn session_path(&self, id: &str) -> PathBuf {
        self.sessions_root.join(format!("{id}.json"))
    }

    /// Persist the session to both stores and update the index. An
    /// existing name is preserved when `name` is not given.
    pub fn save(&self, session: &Session, name: Option<&str>) -> Result<()> {
        let payload = serde_json::to_vec_pretty(session)?;

        let history = self.history_path();
        fs::create_dir_all(history.parent().expect("history has parent"))?;
        fs::write(&history, &payload)?;

        fs::create_dir_all(&self.sessions_root)?;
        fs::write(self.session_path(&session.id), &payload)?;

        let mut index = self.load_index()?;
        let existing_name = index
            .sessions
            .get(&session.id)
            .and_then(|entry| entry.name.clone());
        index.sessions.insert(
            session.id.clone(),
            SessionIndexEntry {
                id: session.id.clone(),
                name: name.map(str::to_string).or(existing_name),
                start_time: session.started_at,
                last_access_time: Utc::now(),
                project_path: session.project_path.clone(),
                model: session.model.clone(),
                message_count: session.message_count(),
                preview: session.preview(),
            },
        );
        index.last_session_id = Some(session.id.clone());
        self.write_index(&index)
    }

    pub fn load_index(&self) -> Result<SessionIndex> {
        let path = self.index_path();
        if !path.exists() {
            return Ok(SessionIndex::default());
        }
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }

    fn write_index(&self, index: &SessionIndex) -> Result<()> {
        fs::create_dir_all(&self.sessions_root)?;
        fs::write(self.index_path(), serde_json::to_vec_pretty(index)?)?;
        Ok(())
    }

    pub fn load_by_id(&self, id: &str) -> Result<Option<Session>> {
        let path = self.session_path(id);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&fs::read_to_string(path)?)?))
    }

    /// `continue`: the most recently saved session.
    pub fn load_latest(&self) -> Result<Option<Session>> {
        match self.load_index()?.last_session_id {
            Some(id) => self.load_by_id(&id),
            None => Ok(None),
        }
    }

    /// `resume <name|id>`: id takes precedence, then the first index entry
    /// with a matching user-assigned name.
    pub fn resolve(&self, name_or_id: &str) -> Result<Option<Session>> {
        if let Some(session) = self.load_by_id(name_or_id)? {
            return Ok(Some(session));
        }
        let index = self.load_index()?;
        for entry in index.sessions.values() {
            if entry.name.as_deref() == Some(name_or_id) {
                return self.load_by_id(&entry.id);
            }
        }
        Ok(None)
    }

    /// The workspace-local current session, if any.
    pub fn load_workspace_history(&self) -> Result<Option<Session>> {
        let path = self.history_path();
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&fs::read_to_string(path)?)?))
    }
}
