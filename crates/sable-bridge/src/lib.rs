//! External-tool bridge.
//!
//! Spawns long-lived helper processes and speaks line-delimited JSON-RPC
//! 2.0 over their stdio. After the `initialize` handshake the helper's
//! advertised tools are wrapped and registered into the tool registry as
//! `mcp_<server>_<tool>`; wrappers issue `tools/call` and return the
//! response as text. Requests carry monotonically increasing integer ids;
//! a reader thread routes responses to per-request channels.

use anyhow::{Result, anyhow};
use sable_core::{ParameterSchema, ToolDescriptor};
use sable_tools::ToolRegistry;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap};
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::Duration;

/// Protocol version sent in the `initialize` handshake.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Per-request deadline; on expiry the pending entry is removed and the
/// awaiting caller fails.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// ── JSON-RPC 2.0 framing ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Configuration for one helper process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelperSpec {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment overrides layered over the inherited environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// A tool advertised by a helper via `tools/list`.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Value,
}

type PendingMap = Arc<Mutex<HashMap<u64, mpsc::Sender<JsonRpcResponse>>>>;

/// One live helper connection.
#[derive(Debug)]
pub struct BridgeConnection {
    name: String,
    child: Mutex<Child>,
    stdin: Mutex<ChildStdin>,
    pending: PendingMap,
    next_id: AtomicU64,
    timeout: Duration,
}

impl BridgeConnection {
    /// Spawn the helper and run the `initialize` handshake.
    pub fn connect(spec: &HelperSpec) -> Result<Arc<Self>> {
        Self::connect_with_timeout(spec, REQUEST_TIMEOUT)
    }

    pub fn connect_with_timeout(spec: &HelperSpec, timeout: Duration) -> Result<Arc<Self>> {
        let mut command = Command::new(&spec.command);
        command
            .args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        let mut child = command
            .spawn()
            .map_err(|err| anyhow!("failed to spawn helper '{}': {err}", spec.name))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("helper '{}' has no stdin", spec.name))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("helper '{}' has no stdout", spec.name))?;

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let reader_pending = Arc::clone(&pending);
        thread::spawn(move || {
            let reader = BufReader::new(stdout);
            for line in reader.lines() {
                let Ok(line) = line else { break };
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let Ok(response) = serde_json::from_str::<JsonRpcResponse>(trimmed) else {
                    continue;
                };
                let Some(id) = response.id else { continue };
                if let Some(tx) = reader_pending.lock().expect("pending poisoned").remove(&id) {
                    let _ = tx.send(response);
                }
            }
        });

        let conn = Arc::new(Self {
            name: spec.name.clone(),
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            pending,
            next_id: AtomicU64::new(1),
            timeout,
        });

        conn.request(
            "initialize",
            json!({"protocolVersion": PROTOCOL_VERSION, "capabilities": {}}),
        )?;
        conn.notify("notifications/initialized", json!({}))?;
        Ok(conn)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn send(&self, request: &JsonRpcRequest) -> Result<()> {
        let line = serde_json::to_string(request)?;
        let mut stdin = self.stdin.lock().expect("stdin poisoned");
        writeln!(stdin, "{line}")?;
        stdin.flush()?;
        Ok(())
    }

    /// Issue a request and wait for its response, bounded by the timeout.
    pub fn request(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel();
        self.pending
            .lock()
            .expect("pending poisoned")
            .insert(id, tx);

        let request = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: Some(id),
            method: method.to_string(),
            params,
        };
        if let Err(err) = self.send(&request) {
            self.pending.lock().expect("pending poisoned").remove(&id);
            return Err(err);
        }

        match rx.recv_timeout(self.timeout) {
            Ok(response) => {
                if let Some(error) = response.error {
                    return Err(anyhow!(
                        "helper '{}' {method} error {}: {}",
                        self.name,
                        error.code,
                        error.message
                    ));
                }
                Ok(response.result.unwrap_or(Value::Null))
            }
            Err(_) => {
                self.pending.lock().expect("pending poisoned").remove(&id);
                Err(anyhow!(
                    "helper '{}' {method} request timed out after {:?}",
                    self.name,
                    self.timeout
                ))
            }
        }
    }

    pub fn notify(&self, method: &str, params: Value) -> Result<()> {
        self.send(&JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: None,
            method: method.to_string(),
            params,
        })
    }

    pub fn list_tools(&self) -> Result<Vec<RemoteToolSpec>> {
        let result = self.request("tools/list", json!({}))?;
        let tools = result
            .get("tools")
            .and_then(Value::as_array)
            .ok_or_else(|| anyhow!("helper '{}' tools/list missing tools array", self.name))?;
        Ok(tools
            .iter()
            .filter_map(|tool| serde_json::from_value(tool.clone()).ok())
            .collect())
    }

    /// Invoke a remote tool, returning its response as text.
    pub fn call_tool(&self, name: &str, arguments: &Value) -> Result<String> {
        let result = self.request(
            "tools/call",
            json!({"name": name, "arguments": arguments}),
        )?;
        Ok(response_text(&result))
    }

    pub fn list_resources(&self) -> Result<Value> {
        self.request("resources/list", json!({}))
    }

    pub fn read_resource(&self, uri: &str) -> Result<Value> {
        self.request("resources/read", json!({"uri": uri}))
    }

    /// Terminate the helper and close its pipes.
    pub fn disconnect(&self) {
        let mut child = self.child.lock().expect("child poisoned");
        let _ = child.kill();
        let _ = child.wait();
    }
}

impl Drop for BridgeConnection {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Flatten a `tools/call` result to text: text content parts are joined,
/// anything structured is JSON-stringified.
pub fn response_text(result: &Value) -> String {
    if let Some(parts) = result.get("content").and_then(Value::as_array) {
        let texts: Vec<&str> = parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect();
        if !texts.is_empty() {
            return texts.join("\n");
        }
    }
    match result {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Registry name for a remote tool wrapper.
pub fn wrapper_name(server: &str, tool: &str) -> String {
    format!("mcp_{server}_{tool}")
}

/// Register every advertised tool as an approval-required wrapper.
/// Returns the wrapper names so they can be unregistered on disconnect.
pub fn register_helper_tools(
    conn: &Arc<BridgeConnection>,
    registry: &ToolRegistry,
) -> Result<Vec<String>> {
    let mut registered = Vec::new();
    for tool in conn.list_tools()? {
        let name = wrapper_name(conn.name(), &tool.name);
        let parameters =
            serde_json::from_value::<ParameterSchema>(tool.input_schema.clone()).unwrap_or_default();
        let remote_name = tool.name.clone();
        let handler_conn = Arc::clone(conn);
        registry.register(ToolDescriptor {
            name: name.clone(),
            description: format!("[MCP:{}] {}", conn.name(), tool.description),
            parameters,
            auto_safe: false,
            handler: Arc::new(move |args| handler_conn.call_tool(&remote_name, args)),
        });
        registered.push(name);
    }
    Ok(registered)
}

/// Owns every live helper connection plus the wrapper names each one
/// contributed to the registry.
#[derive(Default)]
pub struct ExternalToolBridge {
    connections: Mutex<Vec<(Arc<BridgeConnection>, Vec<String>)>>,
}

impl ExternalToolBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect one helper and merge its tools into the registry.
    pub fn connect(&self, spec: &HelperSpec, registry: &ToolRegistry) -> Result<usize> {
        let conn = BridgeConnection::connect(spec)?;
        let names = register_helper_tools(&conn, registry)?;
        let count = names.len();
        self.connections
            .lock()
            .expect("connections poisoned")
            .push((conn, names));
        Ok(count)
    }

    /// Disconnect every helper, removing its wrappers from the registry.
    pub fn disconnect_all(&self, registry: &ToolRegistry) {
        let mut connections = self.connections.lock().expect("connections poisoned");
        for (conn, names) in connections.drain(..) {
            for name in names {
                registry.unregister(&name);
            }
            conn.disconnect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapper_names_follow_the_contract() {
        assert_eq!(wrapper_name("github", "search"), "mcp_github_search");
    }

    #[test]
    fn response_text_joins_text_content_parts() {
        let result = json!({"content": [
            {"type": "text", "text": "first"},
            {"type": "text", "text": "second"},
        ]});
        assert_eq!(response_text(&result), "first\nsecond");
    }

    #[test]
    fn response_text_stringifies_structured_results() {
        let result = json!({"rows": [1, 2, 3]});
        assert_eq!(response_text(&result), r#"{"rows":[1,2,3]}"#);
        assert_eq!(response_text(&json!("plain")), "plain");
    }

    #[test]
    fn request_serialization_matches_jsonrpc() {
        let request = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: Some(7),
            method: "tools/list".to_string(),
            params: json!({}),
        };
        let raw = serde_json::to_string(&request).expect("serialize");
        assert!(raw.contains(r#""jsonrpc":"2.0""#));
        assert!(raw.contains(r#""id":7"#));

        let notification = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: None,
            method: "notifications/initialized".to_string(),
            params: json!({}),
        };
        let raw = serde_json::to_string(&notification).expect("serialize");
        assert!(!raw.contains(r#""id""#));
    }

    #[cfg(unix)]
    mod live_helper {
        use super::*;
        use std::fs;

        const HELPER_SCRIPT: &str = r#"#!/bin/sh
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  case "$line" in
    *'"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","capabilities":{}}}\n' "$id" ;;
    *'"tools/list"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"echo","description":"Echo text back","inputSchema":{"type":"object","properties":{"text":{"type":"string"}},"required":["text"]}}]}}\n' "$id" ;;
    *'"tools/call"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"echoed"}]}}\n' "$id" ;;
    *'"resources/list"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"resources":[]}}\n' "$id" ;;
    *) : ;;
  esac
done
"#;

        fn helper_spec(dir: &std::path::Path) -> HelperSpec {
            let script = dir.join("helper.sh");
            fs::write(&script, HELPER_SCRIPT).expect("write helper");
            HelperSpec {
                name: "helper".to_string(),
                command: "sh".to_string(),
                args: vec![script.to_string_lossy().to_string()],
                env: BTreeMap::new(),
            }
        }

        #[test]
        fn handshake_discovery_and_call_round_trip() {
            let dir = tempfile::tempdir().expect("tempdir");
            let spec = helper_spec(dir.path());
            let conn = BridgeConnection::connect(&spec).expect("connect");

            let tools = conn.list_tools().expect("list tools");
            assert_eq!(tools.len(), 1);
            assert_eq!(tools[0].name, "echo");

            let text = conn
                .call_tool("echo", &json!({"text": "hi"}))
                .expect("call tool");
            assert_eq!(text, "echoed");

            let resources = conn.list_resources().expect("resources");
            assert!(resources["resources"].as_array().unwrap().is_empty());
            conn.disconnect();
        }

        #[test]
        fn advertised_tools_register_as_gated_wrappers() {
            let dir = tempfile::tempdir().expect("tempdir");
            let spec = helper_spec(dir.path());
            let registry = ToolRegistry::new();

            let conn = BridgeConnection::connect(&spec).expect("connect");
            let names = register_helper_tools(&conn, &registry).expect("register");
            assert_eq!(names, vec!["mcp_helper_echo".to_string()]);

            let descriptor = registry.get("mcp_helper_echo").expect("registered");
            assert!(!descriptor.auto_safe);
            assert!(descriptor.description.starts_with("[MCP:helper] "));
            assert!(descriptor.parameters.required.contains(&"text".to_string()));

            let output = (descriptor.handler)(&json!({"text": "hi"})).expect("invoke");
            assert_eq!(output, "echoed");
            conn.disconnect();
        }

        #[test]
        fn unresponsive_helper_times_out_and_clears_pending() {
            let spec = HelperSpec {
                name: "mute".to_string(),
                command: "sh".to_string(),
                args: vec!["-c".to_string(), "cat > /dev/null".to_string()],
                env: BTreeMap::new(),
            };
            let err = BridgeConnection::connect_with_timeout(&spec, Duration::from_millis(100))
                .expect_err("initialize must time out");
            assert!(err.to_string().contains("timed out"));
        }

        #[test]
        fn bridge_disconnect_removes_wrappers() {
            let dir = tempfile::tempdir().expect("tempdir");
            let spec = helper_spec(dir.path());
            let registry = ToolRegistry::new();
            let bridge = ExternalToolBridge::new();

            let count = bridge.connect(&spec, &registry).expect("connect");
            assert_eq!(count, 1);
            assert!(registry.get("mcp_helper_echo").is_some());

            bridge.disconnect_all(&registry);
            assert!(registry.get("mcp_helper_echo").is_none());
        }
    }
}
