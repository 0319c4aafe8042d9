//! Textual tool-call recovery.
//!
//! Providers without native function calling answer with inline
//! `<tool_call>{…}</tool_call>` markup, or occasionally a bare JSON array of
//! call objects. Both forms accept `name`/`function` and
//! `arguments`/`parameters` key aliases.

use regex::Regex;
use sable_core::ToolCall;
use serde_json::Value;
use std::sync::OnceLock;

fn markup_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<tool_call>(.*?)</tool_call>").expect("valid regex"))
}

/// Parse tool calls out of assistant content, returning the content with
/// every `<tool_call>…</tool_call>` region stripped plus the recovered
/// calls with synthesized `call_<ts>_<index>` ids.
pub fn extract_textual_tool_calls(content: &str) -> (String, Vec<ToolCall>) {
    let ts = chrono::Utc::now().timestamp_millis();
    let mut calls = Vec::new();

    for (index, capture) in markup_regex().captures_iter(content).enumerate() {
        let inner = capture[1].trim();
        if let Ok(value) = serde_json::from_str::<Value>(inner)
            && let Some(call) = call_from_value(&value, ts, index)
        {
            calls.push(call);
        }
    }

    if calls.is_empty()
        && let Some(array) = find_top_level_array(content)
    {
        for (index, entry) in array.iter().enumerate() {
            if let Some(call) = call_from_value(entry, ts, index) {
                calls.push(call);
            }
        }
    }

    let cleaned = markup_regex().replace_all(content, "").trim().to_string();
    (cleaned, calls)
}

/// Accept `{name|function, arguments|parameters}`; `function` may itself be
/// the nested `{name, arguments}` object from the structured wire shape.
fn call_from_value(value: &Value, ts: i64, index: usize) -> Option<ToolCall> {
    let (name, args_source) = if let Some(name) = value.get("name").and_then(Value::as_str) {
        (name.to_string(), value)
    } else {
        match value.get("function")? {
            Value::String(name) => (name.clone(), value),
            nested @ Value::Object(_) => {
                (nested.get("name")?.as_str()?.to_string(), nested)
            }
            _ => return None,
        }
    };

    let arguments = match args_source
        .get("arguments")
        .or_else(|| args_source.get("parameters"))
    {
        Some(Value::String(raw)) => raw.clone(),
        Some(value) => value.to_string(),
        None => "{}".to_string(),
    };

    Some(ToolCall {
        id: format!("call_{ts}_{index}"),
        name,
        arguments,
    })
}

/// Find the first top-level JSON array whose first element is a call-shaped
/// object. String contents and escapes are respected while bracket matching.
fn find_top_level_array(content: &str) -> Option<Vec<Value>> {
    let bytes = content.as_bytes();
    let mut search_from = 0;
    while let Some(offset) = content[search_from..].find('[') {
        let start = search_from + offset;
        if let Some(end) = matching_bracket(bytes, start)
            && let Ok(Value::Array(array)) = serde_json::from_str(&content[start..=end])
            && array.first().is_some_and(|first| {
                first.get("name").is_some() || first.get("function").is_some()
            })
        {
            return Some(array);
        }
        search_from = start + 1;
    }
    None
}

fn matching_bracket(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'[' | b'{' => depth += 1,
            b']' | b'}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}
