use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single NDJSON message emitted by Claude Code (`--output-format
/// stream-json`).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// First message on stream: session initialisation.
    System(SystemEvent),

    /// An assistant turn (text or tool calls).
    Assistant(AssistantEvent),

    /// A user turn (tool results injected back into the conversation).
    User(UserEvent),

    /// Final result message — emitted once at the very end.
    Result(ResultEvent),

    /// Any message type not explicitly handled above.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SystemEvent {
    pub subtype: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AssistantEvent {
    pub message: Option<AgentMessage>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UserEvent {
    pub message: Option<AgentMessage>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentMessage {
    pub role: Option<String>,
    pub content: Option<Vec<ContentBlock>>,
}

/// A single content block inside an assistant or user message.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Plain text output.
    Text { text: String },

    /// A tool invocation by the agent.
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },

    /// Result returned by a tool (appears in user turn).
    ToolResult {
        tool_use_id: String,
        content: Option<Value>,
        is_error: Option<bool>,
    },

    #[serde(other)]
    Unknown,
}

/// Final result event, emitted once when the agent finishes.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResultEvent {
    pub subtype: Option<String>,
    /// Textual output (may be empty if last turn was a tool call).
    pub result: Option<String>,
    pub is_error: Option<bool>,
    pub duration_ms: Option<u64>,
    pub num_turns: Option<u64>,
}

/// Tools whose invocation mutates a file in the workspace.
const EDITING_TOOLS: &[&str] = &["Edit", "Write", "MultiEdit", "NotebookEdit"];

/// What the engine needs out of a finished transcript.
#[derive(Debug, Clone, Default)]
pub struct StreamSummary {
    /// Final text the agent produced (falls back to collected assistant
    /// text when the result message is empty).
    pub result_text: String,
    /// Whether the result message flagged an error.
    pub is_error: bool,
    /// Files touched by editing tool calls, deduplicated in first-seen
    /// order.
    pub files_modified: Vec<String>,
}

/// Parse a full NDJSON stream. Malformed lines are skipped — a transcript
/// cut short by a kill or timeout still yields whatever arrived.
pub fn parse_stream(data: &str) -> StreamSummary {
    let mut summary = StreamSummary::default();
    let mut assistant_text = String::new();

    for line in data.lines() {
        if line.is_empty() {
            continue;
        }
        let event: AgentEvent = match serde_json::from_str(line) {
            Ok(e) => e,
            Err(_) => continue,
        };
        match event {
            AgentEvent::Assistant(e) => {
                let Some(blocks) = e.message.and_then(|m| m.content) else {
                    continue;
                };
                for block in blocks {
                    match block {
                        ContentBlock::Text { text } => {
                            if !assistant_text.is_empty() {
                                assistant_text.push('\n');
                            }
                            assistant_text.push_str(&text);
                        }
                        ContentBlock::ToolUse { name, input, .. } => {
                            if EDITING_TOOLS.contains(&name.as_str()) {
                                if let Some(path) = input.get("file_path").and_then(Value::as_str) {
                                    if !summary.files_modified.iter().any(|f| f == path) {
                                        summary.files_modified.push(path.to_string());
                                    }
                                }
                            }
                        }
                        _ => {}
                    }
                }
            }
            AgentEvent::Result(e) => {
                summary.is_error = e.is_error.unwrap_or(false);
                if let Some(text) = e.result {
                    summary.result_text = text;
                }
            }
            _ => {}
        }
    }

    if summary.result_text.is_empty() && !assistant_text.is_empty() {
        summary.result_text = assistant_text;
    }

    summary
}

// ── Tests ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_result_text() {
        let data = concat!(
            r#"{"type":"system","subtype":"init"}"#,
            "\n",
            r#"{"type":"result","subtype":"success","result":"Fixed the import.","is_error":false}"#,
            "\n",
        );
        let summary = parse_stream(data);
        assert_eq!(summary.result_text, "Fixed the import.");
        assert!(!summary.is_error);
    }

    #[test]
    fn collects_edited_files_from_tool_use() {
        let data = concat!(
            r#"{"type":"assistant","message":{"role":"assistant","content":[{"type":"tool_use","id":"t1","name":"Edit","input":{"file_path":"/addons/sale_custom/models/sale.py","old_string":"a","new_string":"b"}}]}}"#,
            "\n",
            r#"{"type":"assistant","message":{"role":"assistant","content":[{"type":"tool_use","id":"t2","name":"Write","input":{"file_path":"/addons/sale_custom/models/order.py","content":"x"}}]}}"#,
            "\n",
            r#"{"type":"assistant","message":{"role":"assistant","content":[{"type":"tool_use","id":"t3","name":"Edit","input":{"file_path":"/addons/sale_custom/models/sale.py","old_string":"c","new_string":"d"}}]}}"#,
            "\n",
            r#"{"type":"result","result":"done"}"#,
            "\n",
        );
        let summary = parse_stream(data);
        assert_eq!(
            summary.files_modified,
            vec![
                "/addons/sale_custom/models/sale.py",
                "/addons/sale_custom/models/order.py"
            ]
        );
    }

    #[test]
    fn read_only_tools_do_not_count_as_modifications() {
        let data = concat!(
            r#"{"type":"assistant","message":{"role":"assistant","content":[{"type":"tool_use","id":"t1","name":"Read","input":{"file_path":"/addons/x/models/a.py"}}]}}"#,
            "\n",
            r#"{"type":"result","result":"nothing to do"}"#,
            "\n",
        );
        assert!(parse_stream(data).files_modified.is_empty());
    }

    #[test]
    fn falls_back_to_assistant_text_when_result_is_empty() {
        let data = concat!(
            r#"{"type":"assistant","message":{"role":"assistant","content":[{"type":"text","text":"Looking at the traceback."}]}}"#,
            "\n",
            r#"{"type":"assistant","message":{"role":"assistant","content":[{"type":"text","text":"Applied the fix."}]}}"#,
            "\n",
        );
        let summary = parse_stream(data);
        assert_eq!(summary.result_text, "Looking at the traceback.\nApplied the fix.");
    }

    #[test]
    fn garbage_lines_are_skipped() {
        let data = "not json\n{\"type\":\"result\",\"result\":\"ok\"}\n{broken\n";
        let summary = parse_stream(data);
        assert_eq!(summary.result_text, "ok");
    }

    #[test]
    fn error_result_is_flagged() {
        let data = r#"{"type":"result","subtype":"error_max_turns","result":"","is_error":true}"#;
        assert!(parse_stream(data).is_error);
    }

    #[test]
    fn unknown_event_types_are_tolerated() {
        let data = concat!(
            r#"{"type":"stream_event","weird":true}"#,
            "\n",
            r#"{"type":"result","result":"fine"}"#,
            "\n",
        );
        assert_eq!(parse_stream(data).result_text, "fine");
    }
}
