//! HTTP client for the completion provider.
//!
//! Speaks the OpenAI-compatible wire protocol: `POST /chat/completions`
//! (synchronous and SSE streaming), `POST /embeddings`, and `POST /rerank`.
//! Some providers never populate structured `tool_calls`; after every
//! non-streaming completion the textual fallback parser recovers calls from
//! `<tool_call>…</tool_call>` markup or a bare JSON array.

use anyhow::{Result, anyhow};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use sable_core::{ChatMessage, LlmConfig, TokenUsage, ToolCall, ToolDefinition};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::io::BufReader;
use std::thread;
use std::time::Duration;

mod extract;
mod stream;

pub use extract::extract_textual_tool_calls;
pub use stream::{ChatStream, StreamDelta, ToolCallDelta, collect_stream, parse_stream_chunk};

/// Stream type returned by [`CompletionClient::complete_chat_streaming`].
pub type HttpChatStream = ChatStream<BufReader<reqwest::blocking::Response>>;

/// A chat-completion request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
}

/// A fully assembled assistant turn.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: String,
    pub usage: Option<TokenUsage>,
}

/// One entry returned by the rerank endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct RerankEntry {
    pub index: usize,
    pub score: f32,
}

/// Seam used by the agent loop; lets tests script completions without HTTP.
pub trait ChatClient: Send + Sync {
    fn complete_chat(&self, req: &ChatRequest) -> Result<ChatResponse>;
}

/// Seam used by the memory store for embeddings and rerank.
pub trait EmbeddingClient: Send + Sync {
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
    fn rerank(&self, query: &str, documents: &[String], top_n: usize) -> Result<Vec<RerankEntry>>;
}

pub struct CompletionClient {
    cfg: LlmConfig,
    client: Client,
}

impl CompletionClient {
    pub fn new(cfg: LlmConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_seconds))
            .build()?;
        Ok(Self { cfg, client })
    }

    pub fn config(&self) -> &LlmConfig {
        &self.cfg
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.cfg.base_url.trim_end_matches('/'))
    }

    /// POST a JSON payload with the retry policy: up to `max_retries` extra
    /// attempts on 5xx and on non-timeout transport errors, linear backoff
    /// `retry_base_ms × attempt`. Timeouts surface immediately.
    fn post_with_retry(&self, path: &str, payload: &Value) -> Result<reqwest::blocking::Response> {
        let url = self.endpoint(path);
        let mut last_err: Option<anyhow::Error> = None;

        for attempt in 0..=u64::from(self.cfg.max_retries) {
            let mut builder = self.client.post(&url).json(payload);
            if let Some(key) = &self.cfg.api_key {
                builder = builder.bearer_auth(key);
            }
            match builder.send() {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp);
                    }
                    let body = resp.text().unwrap_or_default();
                    last_err = Some(anyhow!("api error {status}: {body}"));
                    if !status.is_server_error() && status != StatusCode::TOO_MANY_REQUESTS {
                        break;
                    }
                }
                Err(err) if err.is_timeout() => {
                    return Err(anyhow!("request to {url} timed out: {err}"));
                }
                Err(err) => {
                    last_err = Some(anyhow!("request to {url} failed: {err}"));
                }
            }
            if attempt < u64::from(self.cfg.max_retries) {
                thread::sleep(Duration::from_millis(
                    self.cfg.retry_base_ms.saturating_mul(attempt + 1),
                ));
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("request to {url} failed without detail")))
    }

    /// Open a streaming completion. Tool definitions are refused here: the
    /// provider does not guarantee tool choice in the streaming regime.
    pub fn complete_chat_streaming(&self, req: &ChatRequest) -> Result<HttpChatStream> {
        if !req.tools.is_empty() {
            return Err(anyhow!("tools are not supported in streaming mode"));
        }
        let payload = build_chat_payload(req, true);
        let resp = self.post_with_retry("/chat/completions", &payload)?;
        Ok(ChatStream::new(BufReader::new(resp)))
    }
}

impl ChatClient for CompletionClient {
    fn complete_chat(&self, req: &ChatRequest) -> Result<ChatResponse> {
        let payload = build_chat_payload(req, false);
        let resp = self.post_with_retry("/chat/completions", &payload)?;
        let body: Value = resp.json()?;
        let mut response = parse_chat_payload(&body)?;

        // Fallback extraction for providers that answer with inline markup
        // instead of structured tool_calls.
        if response.tool_calls.is_empty()
            && (response.content.contains("<tool_call>") || response.content.contains("\"name\""))
        {
            let (content, calls) = extract_textual_tool_calls(&response.content);
            response.content = content;
            response.tool_calls = calls;
        }
        Ok(response)
    }
}

impl EmbeddingClient for CompletionClient {
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let payload = json!({
            "model": self.cfg.embedding_model,
            "input": texts,
        });
        let resp = self.post_with_retry("/embeddings", &payload)?;
        let body: Value = resp.json()?;
        let data = body
            .get("data")
            .and_then(Value::as_array)
            .ok_or_else(|| anyhow!("embeddings payload missing data array"))?;
        let mut out = Vec::with_capacity(data.len());
        for entry in data {
            let vector = entry
                .get("embedding")
                .and_then(Value::as_array)
                .ok_or_else(|| anyhow!("embeddings entry missing vector"))?
                .iter()
                .filter_map(Value::as_f64)
                .map(|v| v as f32)
                .collect();
            out.push(vector);
        }
        Ok(out)
    }

    fn rerank(&self, query: &str, documents: &[String], top_n: usize) -> Result<Vec<RerankEntry>> {
        let payload = json!({
            "model": self.cfg.rerank_model,
            "query": query,
            "documents": documents,
            "top_n": top_n,
        });
        let resp = self.post_with_retry("/rerank", &payload)?;
        let body: Value = resp.json()?;
        let results = body
            .get("results")
            .and_then(Value::as_array)
            .ok_or_else(|| anyhow!("rerank payload missing results array"))?;
        let mut out = Vec::with_capacity(results.len());
        for entry in results {
            let index = entry
                .get("index")
                .and_then(Value::as_u64)
                .ok_or_else(|| anyhow!("rerank entry missing index"))? as usize;
            let score = entry
                .get("score")
                .and_then(Value::as_f64)
                .unwrap_or_default() as f32;
            out.push(RerankEntry { index, score });
        }
        out.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        Ok(out)
    }
}

fn build_chat_payload(req: &ChatRequest, stream: bool) -> Value {
    let messages: Vec<Value> = req.messages.iter().map(message_to_wire).collect();
    let mut payload = json!({
        "model": req.model,
        "messages": messages,
        "max_tokens": req.max_tokens,
        "stream": stream,
    });
    if let Some(temperature) = req.temperature {
        payload["temperature"] = json!(temperature);
    }
    if !req.tools.is_empty() {
        payload["tools"] = json!(req.tools);
        payload["tool_choice"] = json!("auto");
    }
    payload
}

/// Map a transcript message onto the provider's wire shape. Assistant tool
/// calls are nested under `function` on the wire; internally they are flat.
fn message_to_wire(msg: &ChatMessage) -> Value {
    match msg {
        ChatMessage::System { content } => json!({"role": "system", "content": content}),
        ChatMessage::User { content } => json!({"role": "user", "content": content}),
        ChatMessage::Assistant {
            content,
            tool_calls,
        } => {
            let mut wire = json!({"role": "assistant", "content": content});
            if !tool_calls.is_empty() {
                wire["tool_calls"] = Value::Array(
                    tool_calls
                        .iter()
                        .map(|tc| {
                            json!({
                                "id": tc.id,
                                "type": "function",
                                "function": {"name": tc.name, "arguments": tc.arguments},
                            })
                        })
                        .collect(),
                );
            }
            wire
        }
        ChatMessage::Tool {
            tool_call_id,
            content,
        } => json!({"role": "tool", "tool_call_id": tool_call_id, "content": content}),
    }
}

/// Parse a non-streaming `/chat/completions` body.
pub fn parse_chat_payload(body: &Value) -> Result<ChatResponse> {
    let choice = body
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|arr| arr.first())
        .ok_or_else(|| anyhow!("completion payload missing choices"))?;
    let message = choice
        .get("message")
        .ok_or_else(|| anyhow!("completion payload missing message"))?;

    let content = message
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let tool_calls = message
        .get("tool_calls")
        .and_then(Value::as_array)
        .map(|calls| {
            calls
                .iter()
                .filter_map(|call| {
                    let function = call.get("function")?;
                    Some(ToolCall {
                        id: call.get("id").and_then(Value::as_str).unwrap_or_default().to_string(),
                        name: function.get("name")?.as_str()?.to_string(),
                        arguments: function
                            .get("arguments")
                            .and_then(Value::as_str)
                            .unwrap_or("{}")
                            .to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let finish_reason = choice
        .get("finish_reason")
        .and_then(Value::as_str)
        .unwrap_or("stop")
        .to_string();

    Ok(ChatResponse {
        content,
        tool_calls,
        finish_reason,
        usage: body.get("usage").map(parse_usage),
    })
}

/// Accept both the DeepSeek-style flat cache counters and the OpenAI-style
/// nested detail objects.
fn parse_usage(usage: &Value) -> TokenUsage {
    let cache_read = usage
        .get("prompt_cache_hit_tokens")
        .and_then(Value::as_u64)
        .or_else(|| {
            usage
                .get("prompt_tokens_details")
                .and_then(|d| d.get("cached_tokens"))
                .and_then(Value::as_u64)
        })
        .unwrap_or_default();
    let reasoning = usage
        .get("reasoning_tokens")
        .and_then(Value::as_u64)
        .or_else(|| {
            usage
                .get("completion_tokens_details")
                .and_then(|d| d.get("reasoning_tokens"))
                .and_then(Value::as_u64)
        })
        .unwrap_or_default();
    TokenUsage {
        prompt_tokens: usage.get("prompt_tokens").and_then(Value::as_u64).unwrap_or_default(),
        completion_tokens: usage
            .get("completion_tokens")
            .and_then(Value::as_u64)
            .unwrap_or_default(),
        cache_read_tokens: cache_read,
        reasoning_tokens: reasoning,
    }
}

/// Aggregate tool-call deltas (indexed by `index`, argument fragments
/// appended) into complete tool calls.
pub(crate) fn merge_tool_call_deltas(deltas: &[ToolCallDelta]) -> Vec<ToolCall> {
    let mut by_index: BTreeMap<usize, (String, String, String)> = BTreeMap::new();
    for delta in deltas {
        let entry = by_index.entry(delta.index).or_default();
        if let Some(id) = &delta.id {
            entry.0 = id.clone();
        }
        if let Some(name) = &delta.name {
            entry.1 = name.clone();
        }
        entry.2.push_str(&delta.arguments);
    }
    by_index
        .into_values()
        .filter(|(_, name, _)| !name.is_empty())
        .map(|(id, name, arguments)| ToolCall {
            id,
            name,
            arguments,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sable_testkit::{MockLlmServer, Scenario, start_mock_llm_server};

    fn client_for(mock: &MockLlmServer, retry_ms: u64) -> CompletionClient {
        CompletionClient::new(LlmConfig {
            base_url: mock.base_url.clone(),
            api_key: Some("test-key".to_string()),
            retry_base_ms: retry_ms,
            ..Default::default()
        })
        .expect("client")
    }

    fn request(messages: Vec<ChatMessage>) -> ChatRequest {
        ChatRequest {
            model: "pilot-1".to_string(),
            messages,
            tools: vec![],
            max_tokens: 512,
            temperature: None,
        }
    }

    #[test]
    fn parse_chat_payload_reads_structured_tool_calls() {
        let body = serde_json::json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_9",
                        "type": "function",
                        "function": {"name": "read_file", "arguments": "{\"path\":\"x\"}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3}
        });
        let parsed = parse_chat_payload(&body).expect("parse");
        assert_eq!(parsed.tool_calls.len(), 1);
        assert_eq!(parsed.tool_calls[0].name, "read_file");
        assert_eq!(parsed.finish_reason, "tool_calls");
        assert_eq!(parsed.usage.as_ref().unwrap().prompt_tokens, 12);
    }

    #[test]
    fn parse_usage_accepts_both_cache_shapes() {
        let deepseek_style = serde_json::json!({
            "prompt_tokens": 10, "completion_tokens": 2, "prompt_cache_hit_tokens": 8
        });
        assert_eq!(parse_usage(&deepseek_style).cache_read_tokens, 8);

        let openai_style = serde_json::json!({
            "prompt_tokens": 10,
            "completion_tokens": 2,
            "prompt_tokens_details": {"cached_tokens": 6},
            "completion_tokens_details": {"reasoning_tokens": 4}
        });
        let usage = parse_usage(&openai_style);
        assert_eq!(usage.cache_read_tokens, 6);
        assert_eq!(usage.reasoning_tokens, 4);
    }

    #[test]
    fn completes_against_mock_server() {
        let mock = start_mock_llm_server();
        mock.push(Scenario::TextResponse("hello there".to_string()));
        let client = client_for(&mock, 1);

        let response = client
            .complete_chat(&request(vec![ChatMessage::User {
                content: "hi".to_string(),
            }]))
            .expect("complete");
        assert_eq!(response.content, "hello there");
        assert!(response.tool_calls.is_empty());
    }

    #[test]
    fn retries_on_server_error_then_succeeds() {
        let mock = start_mock_llm_server();
        mock.push(Scenario::HttpError(500));
        mock.push(Scenario::HttpError(503));
        mock.push(Scenario::TextResponse("recovered".to_string()));
        let client = client_for(&mock, 1);

        let response = client
            .complete_chat(&request(vec![ChatMessage::User {
                content: "hi".to_string(),
            }]))
            .expect("complete after retries");
        assert_eq!(response.content, "recovered");
    }

    #[test]
    fn client_error_is_not_retried() {
        let mock = start_mock_llm_server();
        mock.push(Scenario::HttpError(400));
        mock.push(Scenario::TextResponse("should not be reached".to_string()));
        let client = client_for(&mock, 1);

        let err = client
            .complete_chat(&request(vec![ChatMessage::User {
                content: "hi".to_string(),
            }]))
            .expect_err("400 must fail");
        assert!(err.to_string().contains("400"));
        assert_eq!(mock.served(), 1);
    }

    #[test]
    fn textual_tool_calls_are_extracted_after_completion() {
        let mock = start_mock_llm_server();
        mock.push(Scenario::TextResponse(
            "I will look.\n<tool_call>{\"name\":\"find_files\",\"arguments\":{\"pattern\":\"*.md\"}}</tool_call>"
                .to_string(),
        ));
        let client = client_for(&mock, 1);

        let response = client
            .complete_chat(&request(vec![ChatMessage::User {
                content: "find docs".to_string(),
            }]))
            .expect("complete");
        assert_eq!(response.content, "I will look.");
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].name, "find_files");
        let args: Value = serde_json::from_str(&response.tool_calls[0].arguments).expect("args");
        assert_eq!(args["pattern"], "*.md");
    }

    #[test]
    fn streaming_refuses_tool_definitions() {
        let mock = start_mock_llm_server();
        let client = client_for(&mock, 1);
        let mut req = request(vec![ChatMessage::User {
            content: "hi".to_string(),
        }]);
        req.tools = vec![sable_core::ToolDefinition {
            tool_type: "function".to_string(),
            function: sable_core::FunctionDefinition {
                name: "read_file".to_string(),
                description: "read".to_string(),
                parameters: sable_core::ParameterSchema::default(),
            },
        }];
        let err = client.complete_chat_streaming(&req).expect_err("must refuse");
        assert!(err.to_string().contains("streaming"));
    }

    #[test]
    fn assistant_wire_shape_nests_function() {
        let wire = message_to_wire(&ChatMessage::Assistant {
            content: None,
            tool_calls: vec![ToolCall {
                id: "c1".to_string(),
                name: "read_file".to_string(),
                arguments: "{}".to_string(),
            }],
        });
        assert_eq!(wire["tool_calls"][0]["function"]["name"], "read_file");
        assert_eq!(wire["tool_calls"][0]["type"], "function");
    }

    #[test]
    fn merge_tool_call_deltas_appends_fragments() {
        let deltas = vec![
            ToolCallDelta {
                index: 0,
                id: Some("c1".to_string()),
                name: Some("read_file".to_string()),
                arguments: "{\"pa".to_string(),
            },
            ToolCallDelta {
                index: 0,
                id: None,
                name: None,
                arguments: "th\":\"x\"}".to_string(),
            },
        ];
        let calls = merge_tool_call_deltas(&deltas);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].arguments, "{\"path\":\"x\"}");
    }
}
