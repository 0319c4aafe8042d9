//! Hook pipeline: ordered, event-scoped interceptors.
//!
//! Handlers run in registration order and may observe, amend, or block the
//! surrounding operation. Inline handlers race a per-descriptor timeout on a
//! worker thread; command handlers run under the platform shell with the
//! full input JSON in the `HOOK_INPUT` environment variable. The first
//! blocking output halts the pipeline for that event.

use anyhow::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::Read;
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::Duration;
use wait_timeout::ChildExt;

/// Default per-handler timeout.
pub const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HookEvent {
    SessionStart,
    UserPromptSubmit,
    PreToolUse,
    PostToolUse,
    PostToolUseFailure,
    Stop,
    SessionEnd,
}

impl HookEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SessionStart => "SessionStart",
            Self::UserPromptSubmit => "UserPromptSubmit",
            Self::PreToolUse => "PreToolUse",
            Self::PostToolUse => "PostToolUse",
            Self::PostToolUseFailure => "PostToolUseFailure",
            Self::Stop => "Stop",
            Self::SessionEnd => "SessionEnd",
        }
    }
}

/// What a handler returned. Subprocess stdout is parsed into this shape,
/// accepting both snake_case and camelCase keys.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HookOutput {
    pub block: bool,
    #[serde(alias = "blockReason")]
    pub block_reason: Option<String>,
    #[serde(alias = "modifiedInput")]
    pub modified_input: Option<Value>,
    #[serde(alias = "addContent")]
    pub add_content: Option<String>,
}

impl HookOutput {
    pub fn blocking(reason: impl Into<String>) -> Self {
        Self {
            block: true,
            block_reason: Some(reason.into()),
            ..Default::default()
        }
    }
}

pub type InlineHookHandler = Arc<dyn Fn(&Value) -> Result<HookOutput> + Send + Sync>;

#[derive(Clone)]
pub enum HookAction {
    /// In-process handler, raced against the descriptor timeout.
    Inline(InlineHookHandler),
    /// Shell command; non-zero exit synthesizes a blocking output.
    Command(String),
}

#[derive(Clone)]
pub struct HookDescriptor {
    pub id: String,
    pub event: HookEvent,
    /// Optional regex matched against `input.tool_name`; a non-matching
    /// handler is skipped.
    pub matcher: Option<Regex>,
    pub action: HookAction,
    pub timeout: Duration,
    /// Fire-and-forget: run detached, result never consumed.
    pub fire_and_forget: bool,
}

impl HookDescriptor {
    pub fn inline(
        id: impl Into<String>,
        event: HookEvent,
        handler: impl Fn(&Value) -> Result<HookOutput> + Send + Sync + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            event,
            matcher: None,
            action: HookAction::Inline(Arc::new(handler)),
            timeout: DEFAULT_HOOK_TIMEOUT,
            fire_and_forget: false,
        }
    }

    pub fn command(id: impl Into<String>, event: HookEvent, command: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            event,
            matcher: None,
            action: HookAction::Command(command.into()),
            timeout: DEFAULT_HOOK_TIMEOUT,
            fire_and_forget: false,
        }
    }

    pub fn with_matcher(mut self, pattern: &str) -> Result<Self> {
        self.matcher = Some(Regex::new(pattern)?);
        Ok(self)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn detached(mut self) -> Self {
        self.fire_and_forget = true;
        self
    }
}

/// Record of one handler execution, reported to the run logger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookRun {
    pub id: String,
    pub event: HookEvent,
    pub success: bool,
    pub timed_out: bool,
    pub exit_code: Option<i32>,
}

type WarnLogger = Arc<dyn Fn(&str) + Send + Sync>;
pub type RunLogger = Arc<dyn Fn(&HookRun) + Send + Sync>;

/// How one handler execution went, before its output is folded into the
/// pipeline result.
struct RunOutcome {
    output: Option<HookOutput>,
    success: bool,
    timed_out: bool,
    exit_code: Option<i32>,
    error: Option<String>,
}

impl RunOutcome {
    fn ok(output: Option<HookOutput>) -> Self {
        Self {
            output,
            success: true,
            timed_out: false,
            exit_code: None,
            error: None,
        }
    }
}

/// Registered hooks plus optional sinks: a warning logger for timeouts and
/// local handler failures (which never abort the pipeline), and a run
/// logger receiving one structured [`HookRun`] per handler execution.
#[derive(Default)]
pub struct HookPipeline {
    hooks: RwLock<Vec<HookDescriptor>>,
    warn: RwLock<Option<WarnLogger>>,
    run_log: RwLock<Option<RunLogger>>,
}

impl HookPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_warn_logger(&self, logger: WarnLogger) {
        *self.warn.write().expect("hook warn poisoned") = Some(logger);
    }

    pub fn set_run_logger(&self, logger: RunLogger) {
        *self.run_log.write().expect("hook run log poisoned") = Some(logger);
    }

    pub fn register(&self, descriptor: HookDescriptor) {
        self.hooks
            .write()
            .expect("hook registry poisoned")
            .push(descriptor);
    }

    pub fn unregister(&self, id: &str) -> bool {
        let mut hooks = self.hooks.write().expect("hook registry poisoned");
        let before = hooks.len();
        hooks.retain(|h| h.id != id);
        hooks.len() != before
    }

    pub fn len(&self) -> usize {
        self.hooks.read().expect("hook registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every matching handler for `event` in registration order,
    /// collecting their outputs. Stops at the first blocking output.
    pub fn execute(&self, event: HookEvent, input: &Value) -> Vec<HookOutput> {
        let snapshot: Vec<HookDescriptor> = self
            .hooks
            .read()
            .expect("hook registry poisoned")
            .iter()
            .filter(|h| h.event == event)
            .cloned()
            .collect();

        let mut outputs = Vec::new();
        for descriptor in snapshot {
            if let Some(matcher) = &descriptor.matcher
                && let Some(tool_name) = input.get("tool_name").and_then(Value::as_str)
                && !matcher.is_match(tool_name)
            {
                continue;
            }

            if descriptor.fire_and_forget {
                let action = descriptor.action.clone();
                let input = input.clone();
                let timeout = descriptor.timeout;
                let id = descriptor.id.clone();
                let run_log = self.run_log.read().expect("hook run log poisoned").clone();
                thread::spawn(move || {
                    let outcome = run_action(&action, &input, timeout);
                    if let Some(logger) = run_log {
                        logger(&HookRun {
                            id,
                            event,
                            success: outcome.success,
                            timed_out: outcome.timed_out,
                            exit_code: outcome.exit_code,
                        });
                    }
                });
                continue;
            }

            let outcome = run_action(&descriptor.action, input, descriptor.timeout);
            self.record_run(&HookRun {
                id: descriptor.id.clone(),
                event,
                success: outcome.success,
                timed_out: outcome.timed_out,
                exit_code: outcome.exit_code,
            });
            if let Some(error) = &outcome.error {
                self.warn(&format!(
                    "hook '{}' ({}) failed: {error}",
                    descriptor.id,
                    event.as_str()
                ));
            }
            if let Some(output) = outcome.output {
                let blocked = output.block;
                outputs.push(output);
                if blocked {
                    break;
                }
            }
        }
        outputs
    }

    fn warn(&self, message: &str) {
        if let Some(logger) = self.warn.read().expect("hook warn poisoned").as_ref() {
            logger(message);
        } else {
            eprintln!("[sable WARN] {message}");
        }
    }

    fn record_run(&self, run: &HookRun) {
        if let Some(logger) = self.run_log.read().expect("hook run log poisoned").as_ref() {
            logger(run);
        }
    }
}

/// Build the base hook input carried by every event.
pub fn base_input(session_id: &str, project_path: &str, model: &str) -> Value {
    serde_json::json!({
        "session_id": session_id,
        "project_path": project_path,
        "model": model,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })
}

fn run_action(action: &HookAction, input: &Value, timeout: Duration) -> RunOutcome {
    match action {
        HookAction::Inline(handler) => run_inline(handler, input, timeout),
        HookAction::Command(command) => run_command(command, input, timeout),
    }
}

fn failed_outcome(error: String, timed_out: bool, exit_code: Option<i32>) -> RunOutcome {
    RunOutcome {
        output: None,
        success: false,
        timed_out,
        exit_code,
        error: Some(error),
    }
}

/// Race the handler against the timeout on a worker thread. A losing
/// handler keeps running detached; its result is dropped with the channel.
fn run_inline(handler: &InlineHookHandler, input: &Value, timeout: Duration) -> RunOutcome {
    let (tx, rx) = mpsc::channel();
    let handler = Arc::clone(handler);
    let input = input.clone();
    thread::spawn(move || {
        let _ = tx.send(handler(&input));
    });
    match rx.recv_timeout(timeout) {
        Ok(Ok(output)) => RunOutcome::ok(Some(output)),
        Ok(Err(err)) => failed_outcome(err.to_string(), false, None),
        Err(_) => failed_outcome(format!("hook timed out after {timeout:?}"), true, None),
    }
}

fn run_command(command: &str, input: &Value, timeout: Duration) -> RunOutcome {
    let input_json = match serde_json::to_string(input) {
        Ok(raw) => raw,
        Err(err) => return failed_outcome(err.to_string(), false, None),
    };
    let mut cmd = platform_shell(command);
    cmd.env("HOOK_INPUT", input_json);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => return failed_outcome(err.to_string(), false, None),
    };
    // Drain pipes on threads so a chatty hook cannot deadlock on a full
    // pipe buffer before the timeout fires.
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let stdout_handle = thread::spawn(move || read_to_string_opt(stdout));
    let stderr_handle = thread::spawn(move || read_to_string_opt(stderr));

    let status = match child.wait_timeout(timeout) {
        Ok(Some(status)) => status,
        Ok(None) => {
            let _ = child.kill();
            let _ = child.wait();
            return failed_outcome(
                format!("hook command timed out after {timeout:?}"),
                true,
                None,
            );
        }
        Err(err) => return failed_outcome(err.to_string(), false, None),
    };

    let stdout = stdout_handle.join().unwrap_or_default();
    let stderr = stderr_handle.join().unwrap_or_default();

    if status.success() {
        let trimmed = stdout.trim();
        if trimmed.is_empty() {
            return RunOutcome {
                exit_code: status.code(),
                ..RunOutcome::ok(None)
            };
        }
        // Best effort: unparsable stdout is silently ignored.
        return RunOutcome {
            exit_code: status.code(),
            ..RunOutcome::ok(serde_json::from_str::<HookOutput>(trimmed).ok())
        };
    }

    let code = status.code().unwrap_or(-1);
    let reason = if stderr.trim().is_empty() {
        format!("Hook exited with code {code}")
    } else {
        stderr.trim().to_string()
    };
    RunOutcome {
        output: Some(HookOutput::blocking(reason)),
        success: false,
        timed_out: false,
        exit_code: Some(code),
        error: None,
    }
}

fn platform_shell(command: &str) -> Command {
    if cfg!(target_os = "windows") {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(command);
        cmd
    } else {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd
    }
}

fn read_to_string_opt(pipe: Option<impl Read>) -> String {
    let mut out = String::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_string(&mut out);
    }
    out
}
