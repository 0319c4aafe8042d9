//! The bounded think/act loop.
//!
//! One `run` spans up to `max_iterations` model calls. Each iteration sends
//! the transcript plus the active tool schemas, appends the assistant
//! reply, and dispatches its tool calls in order through the hook pipeline
//! and the executor. The loop ends on an assistant reply without tool
//! calls, or when the iteration bound is exhausted.

use crate::history::sanitize_history;
use anyhow::Result;
use sable_core::{
    AgentCallbacks, ChatMessage, TokenUsage, ToolDefinition, ToolResult, strip_think_spans,
};
use sable_hooks::{HookEvent, HookPipeline, base_input};
use sable_llm::{ChatClient, ChatRequest};
use sable_tools::ToolExecutor;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default bound on model calls per run; the orchestrator passes its own.
pub const DEFAULT_MAX_ITERATIONS: usize = 10;

/// Spacing between words when the final reply is streamed to `on_chunk`.
pub const DEFAULT_WORD_DELAY: Duration = Duration::from_millis(20);

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
    pub max_iterations: usize,
    pub word_delay: Duration,
    pub session_id: String,
    pub project_path: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            max_tokens: 4096,
            temperature: None,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            word_delay: DEFAULT_WORD_DELAY,
            session_id: String::new(),
            project_path: String::new(),
        }
    }
}

/// Outcome of one agent turn.
#[derive(Debug, Clone, Default)]
pub struct AgentResponse {
    pub content: String,
    pub tools_used: Vec<String>,
    pub iterations: usize,
    pub api_time_ms: u64,
    pub tool_time_ms: u64,
    pub successful_tool_calls: u64,
    pub failed_tool_calls: u64,
    pub token_usage: TokenUsage,
}

pub struct Agent<'a> {
    llm: &'a dyn ChatClient,
    executor: Arc<ToolExecutor>,
    hooks: Arc<HookPipeline>,
    config: AgentConfig,
    tools: Vec<ToolDefinition>,
    messages: Vec<ChatMessage>,
}

impl<'a> Agent<'a> {
    pub fn new(
        llm: &'a dyn ChatClient,
        executor: Arc<ToolExecutor>,
        hooks: Arc<HookPipeline>,
        config: AgentConfig,
        system_prompt: String,
        tools: Vec<ToolDefinition>,
    ) -> Self {
        Self {
            llm,
            executor,
            hooks,
            config,
            tools,
            messages: vec![ChatMessage::System {
                content: system_prompt,
            }],
        }
    }

    /// The transcript built so far (system + replay + this turn).
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Run one turn. Prior history is replayed verbatim (after hygiene
    /// repair) before the current user message.
    pub fn run(
        &mut self,
        user_message: &str,
        callbacks: &AgentCallbacks,
        prior_history: &[ChatMessage],
    ) -> Result<AgentResponse> {
        let mut replay = prior_history.to_vec();
        let repairs = sanitize_history(&mut replay);
        if repairs.dropped_tool_messages > 0 || repairs.stripped_tool_calls > 0 {
            eprintln!(
                "[sable WARN] repaired replayed history: dropped {} tool messages, stripped {} tool calls",
                repairs.dropped_tool_messages, repairs.stripped_tool_calls
            );
        }
        self.messages.extend(replay);
        self.messages.push(ChatMessage::User {
            content: user_message.to_string(),
        });

        let mut response = AgentResponse::default();
        let mut accumulated = String::new();

        while response.iterations < self.config.max_iterations {
            response.iterations += 1;

            let request = ChatRequest {
                model: self.config.model.clone(),
                messages: self.messages.clone(),
                tools: self.tools.clone(),
                max_tokens: self.config.max_tokens,
                temperature: self.config.temperature,
            };
            let api_start = Instant::now();
            let reply = self.llm.complete_chat(&request)?;
            response.api_time_ms += api_start.elapsed().as_millis() as u64;
            if let Some(usage) = &reply.usage {
                response.token_usage.absorb(usage);
            }

            let content = strip_think_spans(&reply.content);
            let is_final = reply.tool_calls.is_empty();
            self.messages.push(ChatMessage::Assistant {
                content: if content.is_empty() {
                    None
                } else {
                    Some(content.clone())
                },
                tool_calls: reply.tool_calls.clone(),
            });

            if !content.is_empty() {
                if is_final {
                    self.emit_word_by_word(&content, callbacks);
                } else {
                    callbacks.emit_chunk(&format!("{content}\n\n"));
                }
                if !accumulated.is_empty() {
                    accumulated.push_str("\n\n");
                }
                accumulated.push_str(&content);
            }

            if is_final {
                response.content = accumulated;
                return Ok(response);
            }

            let mut results = Vec::with_capacity(reply.tool_calls.len());
            for call in &reply.tool_calls {
                results.push(self.dispatch_tool_call(call, callbacks, &mut response));
            }
            for result in results {
                self.messages.push(ChatMessage::from_tool_result(&result));
            }
        }

        // Iteration budget exhausted: report honestly what accumulated.
        response.content = accumulated;
        Ok(response)
    }

    fn dispatch_tool_call(
        &self,
        call: &sable_core::ToolCall,
        callbacks: &AgentCallbacks,
        response: &mut AgentResponse,
    ) -> ToolResult {
        let parsed_args: Value = serde_json::from_str(&call.arguments).unwrap_or_else(|_| json!({}));

        let mut hook_input = self.hook_input();
        hook_input["tool_name"] = json!(call.name);
        hook_input["tool_input"] = parsed_args.clone();
        let pre = self.hooks.execute(HookEvent::PreToolUse, &hook_input);
        if let Some(block) = pre.iter().find(|output| output.block) {
            let reason = block.block_reason.as_deref().unwrap_or("blocked");
            response.failed_tool_calls += 1;
            return ToolResult::error(&call.id, format!("Tool blocked by hook: {reason}"));
        }

        // A hook may amend the arguments; the last modification wins.
        let mut effective = call.clone();
        let mut parsed_args = parsed_args;
        if let Some(modified) = pre
            .iter()
            .rev()
            .find_map(|output| output.modified_input.clone())
        {
            effective.arguments = modified.to_string();
            parsed_args = modified;
        }

        callbacks.emit_tool_start(&effective.name, &parsed_args);
        let tool_start = Instant::now();
        let result = self.executor.execute(&effective);
        let elapsed_ms = tool_start.elapsed().as_millis() as u64;
        response.tool_time_ms += elapsed_ms;

        let mut post_input = self.hook_input();
        post_input["tool_name"] = json!(call.name);
        post_input["tool_input"] = parsed_args;
        post_input["tool_output"] = json!(result.content);
        post_input["duration"] = json!(elapsed_ms);
        if result.is_error {
            post_input["error"] = json!(result.content);
            self.hooks.execute(HookEvent::PostToolUseFailure, &post_input);
            response.failed_tool_calls += 1;
            callbacks.emit_tool_end(&call.name, "Error");
        } else {
            self.hooks.execute(HookEvent::PostToolUse, &post_input);
            response.successful_tool_calls += 1;
            callbacks.emit_tool_end(&call.name, &result.content);
        }
        response.tools_used.push(call.name.clone());
        result
    }

    fn hook_input(&self) -> Value {
        base_input(
            &self.config.session_id,
            &self.config.project_path,
            &self.config.model,
        )
    }

    fn emit_word_by_word(&self, content: &str, callbacks: &AgentCallbacks) {
        if callbacks.on_chunk.is_none() {
            return;
        }
        let mut words = content.split_whitespace().peekable();
        while let Some(word) = words.next() {
            if words.peek().is_some() {
                callbacks.emit_chunk(&format!("{word} "));
                if !self.config.word_delay.is_zero() {
                    std::thread::sleep(self.config.word_delay);
                }
            } else {
                callbacks.emit_chunk(word);
            }
        }
    }
}
