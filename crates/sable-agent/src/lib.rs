//! Orchestrator: assembles the system prompt, owns the multi-turn history
//! and the session record, and launches the agent loop for each turn.
//!
//! The per-turn tool transcript lives inside the loop and is not carried
//! forward; the running history holds only user/assistant exchanges.

mod agent_loop;
mod history;
pub mod prompts;
mod subagent;

pub use agent_loop::{
    Agent, AgentConfig, AgentResponse, DEFAULT_MAX_ITERATIONS, DEFAULT_WORD_DELAY,
};
pub use subagent::SubAgentKind;

use anyhow::Result;
use sable_core::{AgentCallbacks, ChatMessage};
use sable_hooks::{HookEvent, HookPipeline, base_input};
use sable_llm::ChatClient;
use sable_memory::{DEFAULT_MIN_SIMILARITY, MemoryStore};
use sable_observe::Observer;
use sable_session::{Session, SessionStore};
use sable_tools::ToolExecutor;
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Model calls allowed per orchestrated turn.
pub const DEFAULT_MAX_TURNS: usize = 15;

/// Memories retrieved per user message.
const MEMORY_RECALL_LIMIT: usize = 5;

/// Entries shown from the shallow workspace listing.
const LISTING_LIMIT: usize = 50;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
    pub max_turns: usize,
    pub plan_mode: bool,
    pub system_prompt_override: Option<String>,
    pub word_delay: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            max_tokens: 4096,
            temperature: None,
            max_turns: DEFAULT_MAX_TURNS,
            plan_mode: false,
            system_prompt_override: None,
            word_delay: DEFAULT_WORD_DELAY,
        }
    }
}

pub struct Orchestrator {
    workspace: PathBuf,
    config: OrchestratorConfig,
    llm: Arc<dyn ChatClient>,
    executor: Arc<ToolExecutor>,
    hooks: Arc<HookPipeline>,
    memory: Option<Arc<MemoryStore>>,
    observer: Arc<Observer>,
    session: Session,
    history: Vec<ChatMessage>,
    context_file: String,
    dir_listing: Vec<String>,
}

impl Orchestrator {
    pub fn new(
        workspace: &Path,
        config: OrchestratorConfig,
        llm: Arc<dyn ChatClient>,
        executor: Arc<ToolExecutor>,
        hooks: Arc<HookPipeline>,
        memory: Option<Arc<MemoryStore>>,
    ) -> Result<Self> {
        let session = Session::new(workspace.to_string_lossy(), &config.model);
        Self::with_session(workspace, config, llm, executor, hooks, memory, session)
    }

    /// Construct around an existing (resumed) session, replaying its
    /// exchanges into the running history.
    pub fn with_session(
        workspace: &Path,
        config: OrchestratorConfig,
        llm: Arc<dyn ChatClient>,
        executor: Arc<ToolExecutor>,
        hooks: Arc<HookPipeline>,
        memory: Option<Arc<MemoryStore>>,
        session: Session,
    ) -> Result<Self> {
        let observer = Arc::new(Observer::new(workspace)?);
        let warn_observer = Arc::clone(&observer);
        hooks.set_warn_logger(Arc::new(move |msg: &str| warn_observer.warn_log(msg)));
        let run_observer = Arc::clone(&observer);
        hooks.set_run_logger(Arc::new(move |run: &sable_hooks::HookRun| {
            let detail = serde_json::to_string(run).unwrap_or_else(|_| run.id.clone());
            let _ = run_observer.record_event("hook", &detail);
        }));

        let context_file = fs::read_to_string(workspace.join("SABLE.md")).unwrap_or_default();
        let dir_listing = shallow_listing(workspace);
        let history = session
            .messages
            .iter()
            .filter(|msg| matches!(msg.role(), "user" | "assistant"))
            .cloned()
            .collect();

        let orchestrator = Self {
            workspace: workspace.to_path_buf(),
            config,
            llm,
            executor,
            hooks,
            memory,
            observer,
            session,
            history,
            context_file,
            dir_listing,
        };
        orchestrator
            .hooks
            .execute(HookEvent::SessionStart, &orchestrator.hook_input());
        Ok(orchestrator)
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    pub fn set_plan_mode(&mut self, plan_mode: bool) {
        self.config.plan_mode = plan_mode;
    }

    pub fn set_verbose(&self, verbose: bool) {
        self.observer.set_verbose(verbose);
    }

    fn hook_input(&self) -> serde_json::Value {
        base_input(
            &self.session.id,
            &self.workspace.to_string_lossy(),
            &self.config.model,
        )
    }

    /// One user turn: hooks, memory recall, prompt assembly, agent run,
    /// history and session bookkeeping.
    pub fn chat(&mut self, user_message: &str, callbacks: &AgentCallbacks) -> Result<AgentResponse> {
        let mut prompt_input = self.hook_input();
        prompt_input["prompt"] = json!(user_message);
        let prompt_outputs = self.hooks.execute(HookEvent::UserPromptSubmit, &prompt_input);
        if let Some(block) = prompt_outputs.iter().find(|output| output.block) {
            let reason = block.block_reason.as_deref().unwrap_or("blocked");
            return Ok(AgentResponse {
                content: format!("Prompt blocked by hook: {reason}"),
                ..Default::default()
            });
        }
        let extra_context: Vec<String> = prompt_outputs
            .into_iter()
            .filter_map(|output| output.add_content)
            .collect();

        let memories = self.recall_memories(user_message);
        let system_prompt = prompts::build_system_prompt(
            self.config.system_prompt_override.as_deref(),
            &memories,
            &self.dir_listing,
            &self.context_file,
            self.config.plan_mode,
            &extra_context,
        );

        self.history.push(ChatMessage::User {
            content: user_message.to_string(),
        });
        let prior: Vec<ChatMessage> = self.history[..self.history.len() - 1].to_vec();

        let agent_config = AgentConfig {
            model: self.config.model.clone(),
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
            max_iterations: self.config.max_turns,
            word_delay: self.config.word_delay,
            session_id: self.session.id.clone(),
            project_path: self.workspace.to_string_lossy().to_string(),
        };
        let mut agent = Agent::new(
            self.llm.as_ref(),
            Arc::clone(&self.executor),
            Arc::clone(&self.hooks),
            agent_config,
            system_prompt,
            self.executor.registry().definitions(),
        );

        let response = match agent.run(user_message, callbacks, &prior) {
            Ok(response) => response,
            Err(err) => {
                // The turn failed; the orchestrator and its history survive.
                self.history.pop();
                self.observer
                    .warn_log(&sable_core::errors::classify(&err).to_string());
                return Err(err);
            }
        };

        self.history.push(ChatMessage::Assistant {
            content: Some(response.content.clone()),
            tool_calls: vec![],
        });

        self.session.append(ChatMessage::User {
            content: user_message.to_string(),
        });
        self.session.append(ChatMessage::Assistant {
            content: Some(response.content.clone()),
            tool_calls: vec![],
        });
        self.session
            .record_usage(&self.config.model, &response.token_usage);
        self.session.record_api_time(response.api_time_ms);
        self.session.tool_time_ms += response.tool_time_ms;
        self.session.successful_tool_calls += response.successful_tool_calls;
        self.session.failed_tool_calls += response.failed_tool_calls;
        for tool in &response.tools_used {
            self.session.tools_used.insert(tool.clone());
        }

        let mut stop_input = self.hook_input();
        stop_input["message_count"] = json!(self.session.message_count());
        stop_input["tokens_used"] = json!(self.session.tokens.total());
        self.hooks.execute(HookEvent::Stop, &stop_input);

        let _ = self.observer.record_event(
            "turn",
            &format!(
                "iterations={} tools={} tokens={}",
                response.iterations,
                response.tools_used.len(),
                response.token_usage.total()
            ),
        );
        Ok(response)
    }

    fn recall_memories(&self, user_message: &str) -> Vec<String> {
        let Some(memory) = &self.memory else {
            return Vec::new();
        };
        match memory.search(user_message, MEMORY_RECALL_LIMIT, DEFAULT_MIN_SIMILARITY) {
            Ok(results) => results
                .into_iter()
                .map(|result| result.memory.content)
                .collect(),
            Err(err) => {
                self.observer.warn_log(&format!("memory recall failed: {err}"));
                Vec::new()
            }
        }
    }

    /// Run a predefined sub-agent on a task. Sub-agents get a restricted
    /// schema subset and share no history with the main conversation.
    pub fn run_sub_agent(&self, kind: SubAgentKind, task: &str) -> Result<AgentResponse> {
        let tools = self
            .executor
            .registry()
            .definitions()
            .into_iter()
            .filter(|def| kind.allows_tool(&def.function.name))
            .collect();
        let agent_config = AgentConfig {
            model: self.config.model.clone(),
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            word_delay: self.config.word_delay,
            session_id: self.session.id.clone(),
            project_path: self.workspace.to_string_lossy().to_string(),
        };
        let mut agent = Agent::new(
            self.llm.as_ref(),
            Arc::clone(&self.executor),
            Arc::clone(&self.hooks),
            agent_config,
            kind.system_prompt().to_string(),
            tools,
        );
        agent.run(task, &AgentCallbacks::default(), &[])
    }

    pub fn save_session(&self, store: &SessionStore, name: Option<&str>) -> Result<()> {
        store.save(&self.session, name)
    }

    /// Final teardown: fires `SessionEnd` with aggregate metrics.
    pub fn shutdown(&self) {
        let mut input = self.hook_input();
        input["message_count"] = json!(self.session.message_count());
        input["tokens_used"] = json!(self.session.tokens.total());
        self.hooks.execute(HookEvent::SessionEnd, &input);
    }
}

/// Shallow root listing gathered once at startup.
fn shallow_listing(workspace: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(workspace) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| {
            let name = entry.file_name().to_string_lossy().to_string();
            if entry.path().is_dir() {
                format!("{name}/")
            } else {
                name
            }
        })
        .filter(|name| !matches!(name.as_str(), ".git/" | ".sable/" | "target/"))
        .collect();
    names.sort();
    names.truncate(LISTING_LIMIT);
    names
}
