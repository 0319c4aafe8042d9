//! SSE streaming support for `/chat/completions`.
//!
//! The stream is a pull sequence of typed deltas; consumers must tolerate
//! empty chunks and a duplicated `finish_reason`. `collect_stream` folds a
//! delta sequence into one assembled response.

use crate::{ChatResponse, merge_tool_call_deltas};
use anyhow::Result;
use sable_core::TokenUsage;
use serde_json::Value;
use std::io::BufRead;

/// One parsed `data:` chunk.
#[derive(Debug, Clone, Default)]
pub struct StreamDelta {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallDelta>,
    pub finish_reason: Option<String>,
    pub usage: Option<TokenUsage>,
}

/// A fragment of one tool call, keyed by its position in the call list.
#[derive(Debug, Clone)]
pub struct ToolCallDelta {
    pub index: usize,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: String,
}

/// Iterator over SSE lines from an open streaming response. Ends at
/// `data: [DONE]` or on transport EOF.
#[derive(Debug)]
pub struct ChatStream<R: BufRead> {
    reader: R,
    done: bool,
}

impl<R: BufRead> ChatStream<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            done: false,
        }
    }
}

impl<R: BufRead> Iterator for ChatStream<R> {
    type Item = Result<StreamDelta>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            let mut line = String::new();
            match self.reader.read_line(&mut line) {
                Ok(0) => {
                    self.done = true;
                    return None;
                }
                Ok(_) => {}
                Err(err) => {
                    self.done = true;
                    return Some(Err(err.into()));
                }
            }
            let trimmed = line.trim();
            let Some(payload) = trimmed.strip_prefix("data:") else {
                continue;
            };
            let payload = payload.trim();
            if payload == "[DONE]" {
                self.done = true;
                return None;
            }
            match serde_json::from_str::<Value>(payload) {
                Ok(value) => return Some(Ok(parse_stream_chunk(&value))),
                // Malformed keep-alive noise: skip rather than abort.
                Err(_) => continue,
            }
        }
    }
}

/// Parse one streaming chunk body into a delta.
pub fn parse_stream_chunk(value: &Value) -> StreamDelta {
    let mut delta = StreamDelta {
        usage: value.get("usage").map(crate::parse_usage),
        ..Default::default()
    };
    let Some(choice) = value
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|arr| arr.first())
    else {
        return delta;
    };

    delta.finish_reason = choice
        .get("finish_reason")
        .and_then(Value::as_str)
        .map(str::to_string);

    let Some(body) = choice.get("delta") else {
        return delta;
    };
    delta.content = body
        .get("content")
        .and_then(Value::as_str)
        .map(str::to_string);
    if let Some(calls) = body.get("tool_calls").and_then(Value::as_array) {
        for call in calls {
            let index = call.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;
            let function = call.get("function");
            delta.tool_calls.push(ToolCallDelta {
                index,
                id: call.get("id").and_then(Value::as_str).map(str::to_string),
                name: function
                    .and_then(|f| f.get("name"))
                    .and_then(Value::as_str)
                    .map(str::to_string),
                arguments: function
                    .and_then(|f| f.get("arguments"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            });
        }
    }
    delta
}

/// Consume a chunk stream and aggregate it into a complete response.
pub fn collect_stream<I>(stream: I) -> Result<ChatResponse>
where
    I: IntoIterator<Item = Result<StreamDelta>>,
{
    let mut content = String::new();
    let mut deltas = Vec::new();
    let mut finish_reason: Option<String> = None;
    let mut usage: Option<TokenUsage> = None;

    for chunk in stream {
        let chunk = chunk?;
        if let Some(text) = chunk.content {
            content.push_str(&text);
        }
        deltas.extend(chunk.tool_calls);
        if finish_reason.is_none() {
            finish_reason = chunk.finish_reason;
        }
        if chunk.usage.is_some() {
            usage = chunk.usage;
        }
    }

    Ok(ChatResponse {
        content,
        tool_calls: merge_tool_call_deltas(&deltas),
        finish_reason: finish_reason.unwrap_or_else(|| "stop".to_string()),
        usage,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn stream_from(raw: &str) -> ChatStream<Cursor<Vec<u8>>> {
        ChatStream::new(Cursor::new(raw.as_bytes().to_vec()))
    }

    #[test]
    fn collects_content_deltas_until_done() {
        let raw = "data: {\"choices\":[{\"delta\":{\"content\":\"hel\"}}]}\n\n\
                   data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n\
                   data: [DONE]\n";
        let response = collect_stream(stream_from(raw)).expect("collect");
        assert_eq!(response.content, "hello");
        assert_eq!(response.finish_reason, "stop");
    }

    #[test]
    fn aggregates_tool_call_fragments_by_index() {
        let raw = concat!(
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"c1\",\"function\":{\"name\":\"read_file\",\"arguments\":\"{\\\"pa\"}}]}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"th\\\":\\\"x\\\"}\"}}]}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"tool_calls\"}]}\n\n",
            "data: [DONE]\n",
        );
        let response = collect_stream(stream_from(raw)).expect("collect");
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].id, "c1");
        assert_eq!(response.tool_calls[0].arguments, "{\"path\":\"x\"}");
        assert_eq!(response.finish_reason, "tool_calls");
    }

    #[test]
    fn tolerates_empty_chunks_and_duplicate_finish_reason() {
        let raw = "data: {\"choices\":[{\"delta\":{}}]}\n\n\
                   data: {\"choices\":[{\"delta\":{\"content\":\"ok\"},\"finish_reason\":\"stop\"}]}\n\n\
                   data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n\
                   data: [DONE]\n";
        let response = collect_stream(stream_from(raw)).expect("collect");
        assert_eq!(response.content, "ok");
        assert_eq!(response.finish_reason, "stop");
    }

    #[test]
    fn non_data_lines_are_skipped() {
        let raw = ": keep-alive\n\ndata: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n\ndata: [DONE]\n";
        let chunks: Vec<_> = stream_from(raw).collect::<Result<Vec<_>>>().expect("chunks");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content.as_deref(), Some("x"));
    }

    #[test]
    fn eof_without_done_terminates_stream() {
        let raw = "data: {\"choices\":[{\"delta\":{\"content\":\"partial\"}}]}\n";
        let response = collect_stream(stream_from(raw)).expect("collect");
        assert_eq!(response.content, "partial");
    }
}
