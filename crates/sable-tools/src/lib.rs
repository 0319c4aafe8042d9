//! Tool registry and executor.
//!
//! The registry maps tool names to descriptors (schema + handler + safety
//! flag). Registration happens during startup; the external-tool bridge may
//! add and remove entries while its helper processes live. The executor
//! parses arguments, applies the approval gate and the dangerous-command
//! guard, invokes the handler, and truncates oversized output.

use sable_core::{ToolCall, ToolDefinition, ToolDescriptor, ToolResult};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};

mod guard;

pub use guard::{SHELL_TOOL_NAMES, check_command_guard};

/// Output ceiling applied to handler results.
pub const DEFAULT_MAX_OUTPUT_CHARS: usize = 50_000;

/// Marker appended exactly once when output is cut at the ceiling.
pub const TRUNCATION_MARKER: &str = "… (output truncated)";

/// Runtime policy controlling when the user is prompted before execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalMode {
    Always,
    Never,
    UnsafeOnly,
}

impl ApprovalMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "always" => Some(Self::Always),
            "never" => Some(Self::Never),
            "unsafe-only" | "unsafe_only" => Some(Self::UnsafeOnly),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Always => "always",
            Self::Never => "never",
            Self::UnsafeOnly => "unsafe-only",
        }
    }
}

/// Approval prompt. Receives the tool name and parsed arguments; returns
/// whether the user approved the call.
pub type ApprovalCallback = Arc<dyn Fn(&str, &Value) -> bool + Send + Sync>;

/// In-memory map from tool name to descriptor. Interior locking lets the
/// bridge register helper tools after startup; readers see a consistent
/// snapshot per call.
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<BTreeMap<String, ToolDescriptor>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor. Idempotent per name: last write wins.
    pub fn register(&self, descriptor: ToolDescriptor) {
        self.tools
            .write()
            .expect("tool registry poisoned")
            .insert(descriptor.name.clone(), descriptor);
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.tools
            .write()
            .expect("tool registry poisoned")
            .remove(name)
            .is_some()
    }

    pub fn get(&self, name: &str) -> Option<ToolDescriptor> {
        self.tools
            .read()
            .expect("tool registry poisoned")
            .get(name)
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.tools
            .read()
            .expect("tool registry poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Schema-only listing, in the shape sent to the completion endpoint.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .read()
            .expect("tool registry poisoned")
            .values()
            .map(ToolDescriptor::definition)
            .collect()
    }

    pub fn is_auto_safe(&self, name: &str) -> bool {
        self.tools
            .read()
            .expect("tool registry poisoned")
            .get(name)
            .map(|d| d.auto_safe)
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.tools.read().expect("tool registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Approval-gated tool dispatcher. Every failure mode is returned as an
/// error-flagged [`ToolResult`]; nothing here crosses the boundary as an
/// exception.
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    approval_mode: Mutex<ApprovalMode>,
    approval_cb: Mutex<Option<ApprovalCallback>>,
    max_output_chars: usize,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            approval_mode: Mutex::new(ApprovalMode::UnsafeOnly),
            approval_cb: Mutex::new(None),
            max_output_chars: DEFAULT_MAX_OUTPUT_CHARS,
        }
    }

    pub fn with_output_limit(mut self, max_output_chars: usize) -> Self {
        self.max_output_chars = max_output_chars;
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Runtime mode toggle (the "YOLO" switch flips this to `Never`).
    pub fn set_approval_mode(&self, mode: ApprovalMode) {
        *self.approval_mode.lock().expect("approval mode poisoned") = mode;
    }

    pub fn approval_mode(&self) -> ApprovalMode {
        *self.approval_mode.lock().expect("approval mode poisoned")
    }

    pub fn set_approval_callback(&self, cb: ApprovalCallback) {
        *self.approval_cb.lock().expect("approval callback poisoned") = Some(cb);
    }

    /// Execute one call. Short-circuiting failures (unknown tool, malformed
    /// arguments) never reach the handler and are idempotent.
    pub fn execute(&self, call: &ToolCall) -> ToolResult {
        let args: Value = match serde_json::from_str(&call.arguments) {
            Ok(value) => value,
            Err(err) => {
                return ToolResult::error(
                    &call.id,
                    format!("Invalid tool arguments: {err}"),
                );
            }
        };

        let Some(descriptor) = self.registry.get(&call.name) else {
            return ToolResult::error(&call.id, format!("Unknown tool: {}", call.name));
        };

        // The guard applies regardless of approval mode.
        if SHELL_TOOL_NAMES.contains(&call.name.as_str())
            && let Some(command) = args.get("command").and_then(Value::as_str)
            && let Some(reason) = check_command_guard(command)
        {
            return ToolResult::error(
                &call.id,
                format!("Command rejected by safety guard: {reason}"),
            );
        }

        let needs_approval = match self.approval_mode() {
            ApprovalMode::Always => true,
            ApprovalMode::Never => false,
            ApprovalMode::UnsafeOnly => !descriptor.auto_safe,
        };
        if needs_approval {
            let approved = self
                .approval_cb
                .lock()
                .expect("approval callback poisoned")
                .as_ref()
                .map(|cb| cb(&call.name, &args))
                // No prompt handler wired: deny in non-interactive mode.
                .unwrap_or(false);
            if !approved {
                return ToolResult::error(&call.id, "Tool call denied by user");
            }
        }

        match (descriptor.handler)(&args) {
            Ok(output) => ToolResult::ok(&call.id, truncate_output(&output, self.max_output_chars)),
            Err(err) => ToolResult::error(&call.id, err.to_string()),
        }
    }

    /// Sequential batch execution, preserving call order in the results.
    pub fn execute_batch(&self, calls: &[ToolCall]) -> Vec<ToolResult> {
        calls.iter().map(|call| self.execute(call)).collect()
    }
}

/// Cut output at the ceiling (on a char boundary) with a single visible
/// truncation marker.
pub fn truncate_output(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push('\n');
    out.push_str(TRUNCATION_MARKER);
    out
}
