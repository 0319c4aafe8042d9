//! Replay hygiene for prior history.
//!
//! Providers reject transcripts where a `tool` message has no matching
//! `tool_calls` entry on a preceding assistant message, or where an
//! assistant's tool calls were never answered. Replayed history is
//! normalized before it is handed to the loop.

use sable_core::ChatMessage;
use std::collections::HashSet;

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct HistoryRepairStats {
    pub(crate) dropped_tool_messages: usize,
    pub(crate) stripped_tool_calls: usize,
}

/// Normalize history so every tool message answers a pending call and no
/// assistant message keeps calls that were never answered.
pub(crate) fn sanitize_history(messages: &mut Vec<ChatMessage>) -> HistoryRepairStats {
    let mut stats = HistoryRepairStats::default();
    let mut normalized: Vec<ChatMessage> = Vec::with_capacity(messages.len());
    let mut pending: HashSet<String> = HashSet::new();
    let mut pending_assistant: Option<usize> = None;

    let flush_pending =
        |normalized: &mut Vec<ChatMessage>,
         pending: &mut HashSet<String>,
         pending_assistant: &mut Option<usize>,
         stats: &mut HistoryRepairStats| {
            if pending.is_empty() {
                return;
            }
            if let Some(idx) = pending_assistant.take()
                && let Some(ChatMessage::Assistant { tool_calls, .. }) = normalized.get_mut(idx)
            {
                let before = tool_calls.len();
                tool_calls.retain(|tc| !pending.contains(&tc.id));
                stats.stripped_tool_calls += before - tool_calls.len();
            }
            pending.clear();
        };

    for message in messages.drain(..) {
        match message {
            ChatMessage::Assistant {
                content,
                tool_calls,
            } => {
                flush_pending(&mut normalized, &mut pending, &mut pending_assistant, &mut stats);
                if !tool_calls.is_empty() {
                    pending.extend(tool_calls.iter().map(|tc| tc.id.clone()));
                    pending_assistant = Some(normalized.len());
                }
                normalized.push(ChatMessage::Assistant {
                    content,
                    tool_calls,
                });
            }
            ChatMessage::Tool {
                tool_call_id,
                content,
            } => {
                if pending.remove(&tool_call_id) {
                    normalized.push(ChatMessage::Tool {
                        tool_call_id,
                        content,
                    });
                    if pending.is_empty() {
                        pending_assistant = None;
                    }
                } else {
                    stats.dropped_tool_messages += 1;
                }
            }
            other => {
                flush_pending(&mut normalized, &mut pending, &mut pending_assistant, &mut stats);
                normalized.push(other);
            }
        }
    }
    flush_pending(&mut normalized, &mut pending, &mut pending_assistant, &mut stats);

    *messages = normalized;
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use sable_core::ToolCall;

    fn call(id: &str) -> ToolCall {
        ToolCall {
            id: id.to_string(),
            name: "read_file".to_string(),
            arguments: "{}".to_string(),
        }
    }

    #[test]
    fn well_formed_history_is_untouched() {
        let mut messages = vec![
            ChatMessage::User {
                content: "q".to_string(),
            },
            ChatMessage::Assistant {
                content: None,
                tool_calls: vec![call("c1")],
            },
            ChatMessage::Tool {
                tool_call_id: "c1".to_string(),
                content: "ok".to_string(),
            },
            ChatMessage::Assistant {
                content: Some("done".to_string()),
                tool_calls: vec![],
            },
        ];
        let original = messages.clone();
        let stats = sanitize_history(&mut messages);
        assert_eq!(stats.dropped_tool_messages, 0);
        assert_eq!(stats.stripped_tool_calls, 0);
        assert_eq!(messages, original);
    }

    #[test]
    fn orphaned_tool_messages_are_dropped() {
        let mut messages = vec![
            ChatMessage::Tool {
                tool_call_id: "ghost".to_string(),
                content: "stale".to_string(),
            },
            ChatMessage::User {
                content: "q".to_string(),
            },
        ];
        let stats = sanitize_history(&mut messages);
        assert_eq!(stats.dropped_tool_messages, 1);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role(), "user");
    }

    #[test]
    fn unanswered_tool_calls_are_stripped() {
        let mut messages = vec![
            ChatMessage::Assistant {
                content: None,
                tool_calls: vec![call("c1"), call("c2")],
            },
            ChatMessage::Tool {
                tool_call_id: "c1".to_string(),
                content: "ok".to_string(),
            },
            ChatMessage::User {
                content: "next".to_string(),
            },
        ];
        let stats = sanitize_history(&mut messages);
        assert_eq!(stats.stripped_tool_calls, 1);
        match &messages[0] {
            ChatMessage::Assistant { tool_calls, .. } => {
                assert_eq!(tool_calls.len(), 1);
                assert_eq!(tool_calls[0].id, "c1");
            }
            _ => panic!("expected assistant"),
        }
    }

    #[test]
    fn trailing_unanswered_calls_are_stripped_at_the_end() {
        let mut messages = vec![ChatMessage::Assistant {
            content: Some("thinking".to_string()),
            tool_calls: vec![call("c9")],
        }];
        let stats = sanitize_history(&mut messages);
        assert_eq!(stats.stripped_tool_calls, 1);
        match &messages[0] {
            ChatMessage::Assistant { tool_calls, .. } => assert!(tool_calls.is_empty()),
            _ => panic!("expected assistant"),
        }
    }
}
