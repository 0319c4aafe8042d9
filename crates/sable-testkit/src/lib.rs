//! Test support: a scripted mock completion server.
//!
//! The server listens on a random local port and answers each incoming
//! HTTP request with the next queued [`Scenario`], regardless of path, so
//! chat, embeddings, and rerank endpoints can all be scripted from one
//! queue. An empty queue yields a default text response.

use serde_json::{Value, json};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

/// A scripted response for the mock server.
#[derive(Debug, Clone)]
pub enum Scenario {
    /// A chat completion with plain text content.
    TextResponse(String),
    /// A chat completion carrying one structured tool call.
    ToolCall {
        id: String,
        name: String,
        arguments: String,
    },
    /// A chat completion carrying several structured tool calls.
    MultiToolCall(Vec<(String, String, String)>),
    /// An arbitrary JSON body (embeddings, rerank, custom shapes).
    Json(Value),
    /// An HTTP error status with an empty JSON body.
    HttpError(u16),
}

pub struct MockLlmServer {
    /// Base URL without a path, e.g. `http://127.0.0.1:43121`.
    pub base_url: String,
    scenario_tx: mpsc::Sender<Scenario>,
    served: Arc<AtomicUsize>,
    stop_tx: Option<mpsc::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl MockLlmServer {
    pub fn push(&self, scenario: Scenario) {
        let _ = self.scenario_tx.send(scenario);
    }

    pub fn push_many(&self, scenarios: impl IntoIterator<Item = Scenario>) {
        for scenario in scenarios {
            let _ = self.scenario_tx.send(scenario);
        }
    }

    /// Number of requests answered so far.
    pub fn served(&self) -> usize {
        self.served.load(Ordering::SeqCst)
    }
}

impl Drop for MockLlmServer {
    fn drop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Start a mock completion server on a random local port.
pub fn start_mock_llm_server() -> MockLlmServer {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock llm");
    listener
        .set_nonblocking(true)
        .expect("set nonblocking listener");
    let addr = listener.local_addr().expect("mock addr");
    let (stop_tx, stop_rx) = mpsc::channel::<()>();
    let (scenario_tx, scenario_rx) = mpsc::channel::<Scenario>();
    let served = Arc::new(AtomicUsize::new(0));
    let served_inner = Arc::clone(&served);

    let handle = thread::spawn(move || {
        loop {
            if stop_rx.try_recv().is_ok() {
                break;
            }
            match listener.accept() {
                Ok((mut stream, _)) => {
                    let scenario = scenario_rx.try_recv().ok();
                    served_inner.fetch_add(1, Ordering::SeqCst);
                    let _ = serve_connection(&mut stream, scenario.as_ref());
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(5));
                }
                Err(_) => break,
            }
        }
    });

    MockLlmServer {
        base_url: format!("http://{addr}"),
        scenario_tx,
        served,
        stop_tx: Some(stop_tx),
        handle: Some(handle),
    }
}

/// Create a temporary workspace directory for a test.
pub fn temp_workspace() -> tempfile::TempDir {
    tempfile::tempdir().expect("create temp workspace")
}

fn serve_connection(stream: &mut TcpStream, scenario: Option<&Scenario>) -> std::io::Result<()> {
    drain_request(stream)?;
    let (status, body) = match scenario {
        Some(Scenario::HttpError(code)) => (*code, json!({"error": "scripted failure"})),
        Some(Scenario::TextResponse(text)) => (200, chat_body(Some(text), &[])),
        Some(Scenario::ToolCall {
            id,
            name,
            arguments,
        }) => (
            200,
            chat_body(None, &[(id.clone(), name.clone(), arguments.clone())]),
        ),
        Some(Scenario::MultiToolCall(calls)) => (200, chat_body(None, calls)),
        Some(Scenario::Json(value)) => (200, value.clone()),
        None => (200, chat_body(Some("ok"), &[])),
    };

    let body = serde_json::to_string(&body).expect("serialize body");
    let reason = if status == 200 { "OK" } else { "Error" };
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes())?;
    stream.flush()
}

fn chat_body(content: Option<&str>, calls: &[(String, String, String)]) -> Value {
    let tool_calls: Vec<Value> = calls
        .iter()
        .map(|(id, name, arguments)| {
            json!({
                "id": id,
                "type": "function",
                "function": {"name": name, "arguments": arguments},
            })
        })
        .collect();
    let finish_reason = if tool_calls.is_empty() {
        "stop"
    } else {
        "tool_calls"
    };
    let mut message = json!({"role": "assistant", "content": content});
    if !tool_calls.is_empty() {
        message["tool_calls"] = Value::Array(tool_calls);
    }
    json!({
        "choices": [{"message": message, "finish_reason": finish_reason}],
        "usage": {"prompt_tokens": 100, "completion_tokens": 50},
    })
}

fn drain_request(stream: &mut TcpStream) -> std::io::Result<()> {
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 1024];
    let mut header_end = None;
    while header_end.is_none() {
        let read = stream.read(&mut chunk)?;
        if read == 0 {
            return Ok(());
        }
        buffer.extend_from_slice(&chunk[..read]);
        header_end = find_subsequence(&buffer, b"\r\n\r\n").map(|idx| idx + 4);
        if buffer.len() > 1_048_576 {
            return Ok(());
        }
    }
    let header_len = header_end.unwrap_or(buffer.len());
    let content_length = parse_content_length(&buffer[..header_len]);
    let mut body_len = buffer.len() - header_len;
    while body_len < content_length {
        let read = stream.read(&mut chunk)?;
        if read == 0 {
            break;
        }
        body_len += read;
    }
    Ok(())
}

fn parse_content_length(headers: &[u8]) -> usize {
    let text = String::from_utf8_lossy(headers);
    for line in text.lines() {
        if let Some((key, value)) = line.split_once(':')
            && key.trim().eq_ignore_ascii_case("content-length")
        {
            return value.trim().parse().unwrap_or(0);
        }
    }
    0
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_post(base_url: &str, path: &str, body: &str) -> (u16, String) {
        let addr = base_url.trim_start_matches("http://");
        let mut stream = TcpStream::connect(addr).expect("connect");
        let request = format!(
            "POST {path} HTTP/1.1\r\nHost: mock\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        stream.write_all(request.as_bytes()).expect("write");
        let mut response = String::new();
        stream.read_to_string(&mut response).expect("read");
        let status = response
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        let body = response
            .split_once("\r\n\r\n")
            .map(|(_, b)| b.to_string())
            .unwrap_or_default();
        (status, body)
    }

    #[test]
    fn serves_scripted_scenarios_in_order() {
        let mock = start_mock_llm_server();
        mock.push_many([
            Scenario::TextResponse("first".to_string()),
            Scenario::HttpError(503),
        ]);

        let (status, body) = raw_post(&mock.base_url, "/chat/completions", "{}");
        assert_eq!(status, 200);
        assert!(body.contains("first"));

        let (status, _) = raw_post(&mock.base_url, "/chat/completions", "{}");
        assert_eq!(status, 503);
        assert_eq!(mock.served(), 2);
    }

    #[test]
    fn empty_queue_yields_default_response() {
        let mock = start_mock_llm_server();
        let (status, body) = raw_post(&mock.base_url, "/chat/completions", "{}");
        assert_eq!(status, 200);
        assert!(body.contains("ok"));
    }

    #[test]
    fn json_scenario_serves_arbitrary_bodies() {
        let mock = start_mock_llm_server();
        mock.push(Scenario::Json(json!({"data": [{"embedding": [0.1, 0.2]}]})));
        let (status, body) = raw_post(&mock.base_url, "/embeddings", "{\"input\":[\"x\"]}");
        assert_eq!(status, 200);
        assert!(body.contains("embedding"));
    }
}
