use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub mod errors;

pub type Result<T> = anyhow::Result<T>;

/// Workspace-local runtime directory.
pub fn runtime_dir(workspace: &Path) -> PathBuf {
    workspace.join(".sable")
}

/// Global runtime directory (`~/.sable`), if a home directory is known.
pub fn global_dir() -> Option<PathBuf> {
    let home = std::env::var("HOME")
        .ok()
        .or_else(|| std::env::var("USERPROFILE").ok())?;
    Some(Path::new(&home).join(".sable"))
}

// ── Conversation types ──────────────────────────────────────────────────

/// A tool invocation requested by the model. `arguments` stays a JSON
/// string, preserving the remote service's shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// The textual answer returned to the model for one tool call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub content: String,
    pub is_error: bool,
}

impl ToolResult {
    pub fn ok(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            content: content.into(),
            is_error: true,
        }
    }
}

/// A message in a multi-turn conversation. Immutable once appended to a
/// transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role")]
pub enum ChatMessage {
    #[serde(rename = "system")]
    System { content: String },
    #[serde(rename = "user")]
    User { content: String },
    #[serde(rename = "assistant")]
    Assistant {
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(skip_serializing_if = "Vec::is_empty", default)]
        tool_calls: Vec<ToolCall>,
    },
    #[serde(rename = "tool")]
    Tool {
        tool_call_id: String,
        content: String,
    },
}

impl ChatMessage {
    pub fn role(&self) -> &'static str {
        match self {
            Self::System { .. } => "system",
            Self::User { .. } => "user",
            Self::Assistant { .. } => "assistant",
            Self::Tool { .. } => "tool",
        }
    }

    /// Tool results are fed back verbatim; failure bodies already carry
    /// their own explanation and the error flag travels in the counters.
    pub fn from_tool_result(result: &ToolResult) -> Self {
        Self::Tool {
            tool_call_id: result.tool_call_id.clone(),
            content: result.content.clone(),
        }
    }
}

/// Remove every `<think>…</think>` span from assistant content. Providers
/// running in reasoning mode interleave these with the visible reply.
pub fn strip_think_spans(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    let mut rest = content;
    while let Some(start) = rest.find("<think>") {
        out.push_str(&rest[..start]);
        match rest[start..].find("</think>") {
            Some(end) => rest = &rest[start + end + "</think>".len()..],
            None => {
                // Unterminated span: drop the remainder.
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out.trim().to_string()
}

// ── Token accounting ────────────────────────────────────────────────────

/// Token usage reported by the completion endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cache_read_tokens: u64,
    pub reasoning_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }

    /// Fold another usage record into this one.
    pub fn absorb(&mut self, other: &TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
        self.reasoning_tokens += other.reasoning_tokens;
    }
}

// ── Tool descriptors ────────────────────────────────────────────────────

/// One property in a tool's parameter object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertySpec {
    #[serde(rename = "type")]
    pub value_type: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub description: String,
    #[serde(rename = "enum", skip_serializing_if = "Option::is_none", default)]
    pub allowed: Option<Vec<String>>,
}

impl PropertySpec {
    pub fn string(description: impl Into<String>) -> Self {
        Self {
            value_type: "string".to_string(),
            description: description.into(),
            allowed: None,
        }
    }

    pub fn integer(description: impl Into<String>) -> Self {
        Self {
            value_type: "integer".to_string(),
            description: description.into(),
            allowed: None,
        }
    }

    pub fn enumerated(description: impl Into<String>, values: &[&str]) -> Self {
        Self {
            value_type: "string".to_string(),
            description: description.into(),
            allowed: Some(values.iter().map(|v| v.to_string()).collect()),
        }
    }
}

/// JSON-schema-shaped parameter object for a tool. Lenient on input:
/// helper processes advertise schemas that may omit any of the fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterSchema {
    #[serde(rename = "type", default = "default_schema_type")]
    pub schema_type: String,
    #[serde(default)]
    pub properties: BTreeMap<String, PropertySpec>,
    #[serde(default)]
    pub required: Vec<String>,
}

fn default_schema_type() -> String {
    "object".to_string()
}

impl Default for ParameterSchema {
    fn default() -> Self {
        Self {
            schema_type: "object".to_string(),
            properties: BTreeMap::new(),
            required: Vec::new(),
        }
    }
}

impl ParameterSchema {
    pub fn new(properties: Vec<(&str, PropertySpec)>, required: &[&str]) -> Self {
        Self {
            schema_type: "object".to_string(),
            properties: properties
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
            required: required.iter().map(|r| r.to_string()).collect(),
        }
    }
}

/// Invocation handler for a registered tool. Receives the parsed argument
/// object and returns the textual body fed back to the model.
pub type ToolHandler = Arc<dyn Fn(&serde_json::Value) -> Result<String> + Send + Sync>;

/// A registered capability: schema plus handler plus safety flag.
#[derive(Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameters: ParameterSchema,
    /// True when the tool has no side effects and is exempt from the
    /// approval prompt under the `unsafe-only` approval mode.
    pub auto_safe: bool,
    pub handler: ToolHandler,
}

impl std::fmt::Debug for ToolDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDescriptor")
            .field("name", &self.name)
            .field("auto_safe", &self.auto_safe)
            .finish()
    }
}

/// The function-call schema sent to the completion endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionDefinition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: ParameterSchema,
}

impl ToolDescriptor {
    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            tool_type: "function".to_string(),
            function: FunctionDefinition {
                name: self.name.clone(),
                description: self.description.clone(),
                parameters: self.parameters.clone(),
            },
        }
    }
}

// ── Observer callbacks ──────────────────────────────────────────────────

pub type ChunkCallback = Arc<dyn Fn(&str) + Send + Sync>;
pub type ToolStartCallback = Arc<dyn Fn(&str, &serde_json::Value) + Send + Sync>;
pub type ToolEndCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Narrow observer interface the renderer implements. The default value is
/// the null-object variant; the core never inspects renderer state.
#[derive(Clone, Default)]
pub struct AgentCallbacks {
    pub on_chunk: Option<ChunkCallback>,
    pub on_tool_start: Option<ToolStartCallback>,
    pub on_tool_end: Option<ToolEndCallback>,
}

impl AgentCallbacks {
    pub fn emit_chunk(&self, text: &str) {
        if let Some(cb) = &self.on_chunk {
            cb(text);
        }
    }

    pub fn emit_tool_start(&self, name: &str, args: &serde_json::Value) {
        if let Some(cb) = &self.on_tool_start {
            cb(name, args);
        }
    }

    pub fn emit_tool_end(&self, name: &str, summary: &str) {
        if let Some(cb) = &self.on_tool_end {
            cb(name, summary);
        }
    }
}

// ── Configuration ───────────────────────────────────────────────────────

/// Completion-endpoint configuration. Resolved defaults ← `~/.sable/.env`
/// ← process environment, in that order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub embedding_model: String,
    pub rerank_model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout_seconds: u64,
    pub max_retries: u8,
    pub retry_base_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            embedding_model: "text-embedding-3-small".to_string(),
            rerank_model: "rerank-v1".to_string(),
            max_tokens: 4096,
            temperature: 0.2,
            timeout_seconds: 120,
            max_retries: 3,
            retry_base_ms: 1_000,
        }
    }
}

impl LlmConfig {
    /// Resolve configuration from `~/.sable/.env` and the process
    /// environment (`SABLE_API_URL`, `SABLE_API_KEY`, `SABLE_MODEL`).
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        let mut vars = BTreeMap::new();
        if let Some(dir) = global_dir() {
            let env_path = dir.join(".env");
            if let Ok(raw) = fs::read_to_string(&env_path) {
                vars.extend(parse_env_file(&raw));
            }
        }
        for key in ["SABLE_API_URL", "SABLE_API_KEY", "SABLE_MODEL"] {
            if let Ok(value) = std::env::var(key) {
                vars.insert(key.to_string(), value);
            }
        }
        cfg.apply_vars(&vars);
        cfg
    }

    fn apply_vars(&mut self, vars: &BTreeMap<String, String>) {
        if let Some(url) = vars.get("SABLE_API_URL") {
            self.base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(key) = vars.get("SABLE_API_KEY")
            && !key.is_empty()
        {
            self.api_key = Some(key.clone());
        }
        if let Some(model) = vars.get("SABLE_MODEL") {
            self.model = model.clone();
        }
    }
}

/// Parse `KEY=VALUE` lines. Values may be single- or double-quoted; blank
/// lines and `#` comments are skipped.
pub fn parse_env_file(raw: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let mut value = value.trim();
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            value = &value[1..value.len() - 1];
        }
        out.insert(key.to_string(), value.to_string());
    }
    out
}
