use serde::Deserialize;
use serde_json::Value;

use super::AgentOutput;

/// Separator written after every tool result so a reader can see work units.
pub const TOOL_RESULT_SEPARATOR: &str = "\n----------------------------------------\n";

/// Events from the agent CLI's stream-json output format
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "assistant")]
    Assistant {
        message: AssistantMessage,
        #[serde(default)]
        session_id: Option<String>,
    },

    #[serde(rename = "user")]
    User {
        #[serde(default)]
        message: Option<UserMessage>,
        #[serde(default)]
        session_id: Option<String>,
    },

    #[serde(rename = "result")]
    Result {
        subtype: String,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        session_id: Option<String>,
    },

    #[serde(rename = "system")]
    System {
        subtype: String,
        #[serde(default)]
        session_id: Option<String>,
    },

    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "tool_use")]
    ToolUse {
        name: String,
        #[serde(default)]
        input: Value,
        #[serde(default)]
        id: String,
    },

    #[serde(rename = "text")]
    Text { text: String },

    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
pub struct UserMessage {
    #[serde(default)]
    pub content: UserContent,
}

/// A user turn is either plain text or a list of blocks (tool results).
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum UserContent {
    Text(String),
    Blocks(Vec<UserBlock>),
}

impl Default for UserContent {
    fn default() -> Self {
        UserContent::Blocks(Vec::new())
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum UserBlock {
    #[serde(rename = "tool_result")]
    ToolResult {
        #[serde(default)]
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
    },

    #[serde(other)]
    Other,
}

/// Flatten tool-result content (string or list of text blocks) into text.
fn tool_result_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| item.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Extract a human-readable description from a tool use event
pub fn describe_tool_use(name: &str, input: &Value) -> String {
    let field = |key: &str| input.get(key).and_then(|v| v.as_str());
    match name {
        "Read" => format!("Reading: {}", field("file_path").map(shorten_path).unwrap_or_else(|| "file".into())),
        "Write" => format!("Creating: {}", field("file_path").map(shorten_path).unwrap_or_else(|| "file".into())),
        "Edit" | "MultiEdit" => format!("Editing: {}", field("file_path").map(shorten_path).unwrap_or_else(|| "file".into())),
        "Bash" => format!(
            "Running: {}",
            field("command")
                .map(|s| crate::util::truncate_chars(s, 60))
                .unwrap_or_else(|| "command".into())
        ),
        "Glob" => format!("Searching: {}", field("pattern").unwrap_or("*")),
        "Grep" => format!(
            "Grep: {}",
            field("pattern")
                .map(|s| crate::util::truncate_chars(s, 30))
                .unwrap_or_else(|| "pattern".into())
        ),
        _ => name.to_string(),
    }
}

/// Shorten a file path to just the last 2 components
fn shorten_path(path: &str) -> String {
    let parts: Vec<&str> = path.split('/').collect();
    if parts.len() <= 2 {
        path.to_string()
    } else {
        parts[parts.len() - 2..].join("/")
    }
}

/// Accumulates a stream of agent events into a transcript.
///
/// Text, tool invocations and tool results are appended in arrival order.
/// `last_message` tracks the most recent assistant text or final result.
#[derive(Debug, Default)]
pub struct TranscriptBuilder {
    transcript: String,
    last_message: String,
    session_id: Option<String>,
    error: Option<String>,
}

impl TranscriptBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one stdout line. Lines that are not JSON events are kept verbatim.
    pub fn push_line(&mut self, line: &str) -> Vec<AgentOutput> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Vec::new();
        }
        match serde_json::from_str::<StreamEvent>(trimmed) {
            Ok(event) => self.push_event(event),
            Err(_) => {
                self.transcript.push_str(line);
                self.transcript.push('\n');
                vec![AgentOutput::Text(line.to_string())]
            }
        }
    }

    pub fn push_event(&mut self, event: StreamEvent) -> Vec<AgentOutput> {
        let mut out = Vec::new();
        match event {
            StreamEvent::System { subtype, session_id } => {
                if let Some(id) = session_id.filter(|s| !s.is_empty()) {
                    self.session_id = Some(id);
                }
                if subtype == "init" {
                    out.push(AgentOutput::Status("Session started".to_string()));
                }
            }
            StreamEvent::Assistant { message, session_id } => {
                self.remember_session(session_id);
                for block in message.content {
                    match block {
                        ContentBlock::Text { text } => {
                            if text.trim().is_empty() {
                                continue;
                            }
                            self.transcript.push_str(&text);
                            self.transcript.push('\n');
                            self.last_message = text.clone();
                            out.push(AgentOutput::Text(text));
                        }
                        ContentBlock::ToolUse { name, input, .. } => {
                            let summary = describe_tool_use(&name, &input);
                            self.transcript.push_str(&format!("[tool] {}\n", summary));
                            out.push(AgentOutput::Tool(summary));
                        }
                        ContentBlock::Other => {}
                    }
                }
            }
            StreamEvent::User { message, session_id } => {
                self.remember_session(session_id);
                if let Some(UserMessage {
                    content: UserContent::Blocks(blocks),
                }) = message
                {
                    for block in blocks {
                        if let UserBlock::ToolResult { content, is_error, .. } = block {
                            let text = tool_result_text(&content);
                            if is_error {
                                self.transcript.push_str("[tool error] ");
                            }
                            self.transcript.push_str(&text);
                            self.transcript.push_str(TOOL_RESULT_SEPARATOR);
                            out.push(AgentOutput::ToolResult(crate::util::truncate_chars(
                                text.lines().next().unwrap_or(""),
                                120,
                            )));
                        }
                    }
                }
            }
            StreamEvent::Result {
                subtype,
                result,
                is_error,
                session_id,
            } => {
                self.remember_session(session_id);
                if let Some(text) = result.filter(|r| !r.trim().is_empty()) {
                    if text != self.last_message {
                        self.transcript.push_str(&text);
                        self.transcript.push('\n');
                    }
                    self.last_message = text;
                }
                if is_error || subtype.starts_with("error") {
                    self.error = Some(if self.last_message.is_empty() {
                        subtype
                    } else {
                        self.last_message.clone()
                    });
                }
            }
            StreamEvent::Unknown => {}
        }
        out
    }

    fn remember_session(&mut self, session_id: Option<String>) {
        if let Some(id) = session_id.filter(|s| !s.is_empty()) {
            self.session_id = Some(id);
        }
    }

    /// Error reported by a final `result` event, if any.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn finish(self) -> (String, String, Option<String>) {
        (self.transcript, self.last_message, self.session_id)
    }
}
