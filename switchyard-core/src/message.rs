// ABOUTME: Canonical chat history shared by all three wire dialects.
// ABOUTME: Also renders a history suffix into the flat prompt a backend session accepts.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    /// Messages the client authored, as opposed to the model
    pub fn is_client(self) -> bool {
        matches!(self, Role::User | Role::Tool)
    }

    fn label(self) -> &'static str {
        match self {
            Role::System => "System",
            Role::User => "User",
            Role::Assistant => "Assistant",
            Role::Tool => "Tool",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    ToolCall {
        id: String,
        name: String,
        arguments: Value,
    },
    ToolResult {
        call_id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub parts: Vec<ContentPart>,
}

impl ChatMessage {
    pub fn new(role: Role, parts: Vec<ContentPart>) -> Self {
        Self { role, parts }
    }

    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self::new(role, vec![ContentPart::Text { text: text.into() }])
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::text(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::text(Role::Assistant, text)
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::text(Role::System, text)
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(
            Role::Tool,
            vec![ContentPart::ToolResult {
                call_id: call_id.into(),
                content: content.into(),
                is_error: false,
            }],
        )
    }

    /// Concatenated text parts
    pub fn text_content(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn tool_results(&self) -> impl Iterator<Item = (&str, &str)> {
        self.parts.iter().filter_map(|p| match p {
            ContentPart::ToolResult {
                call_id, content, ..
            } => Some((call_id.as_str(), content.as_str())),
            _ => None,
        })
    }

    pub fn has_tool_results(&self) -> bool {
        self.tool_results().next().is_some()
    }
}

/// Tool results in the trailing run of client-authored messages that carry
/// them, oldest first. Empty unless the last message is such a message.
pub fn trailing_tool_results(messages: &[ChatMessage]) -> Vec<(String, String)> {
    let run = messages
        .iter()
        .rev()
        .take_while(|m| m.role.is_client() && m.has_tool_results())
        .count();
    messages[messages.len() - run..]
        .iter()
        .flat_map(|m| m.tool_results())
        .map(|(id, content)| (id.to_string(), content.to_string()))
        .collect()
}

/// System messages joined, for the backend's system prompt
pub fn system_prompt(messages: &[ChatMessage]) -> Option<String> {
    let parts: Vec<String> = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(ChatMessage::text_content)
        .filter(|t| !t.is_empty())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n\n"))
    }
}

/// Render messages into the flat prompt a backend session takes. System
/// messages are skipped; they travel as the session's system prompt.
pub fn format_prompt(messages: &[ChatMessage]) -> String {
    let mut blocks = Vec::new();
    for message in messages.iter().filter(|m| m.role != Role::System) {
        let mut text = Vec::new();
        for part in &message.parts {
            match part {
                ContentPart::Text { text: t } => {
                    if !t.is_empty() {
                        text.push(t.as_str());
                    }
                }
                ContentPart::ToolCall {
                    id,
                    name,
                    arguments,
                } => {
                    flush_text(&mut blocks, message.role, &mut text);
                    blocks.push(format!("[Assistant called tool {} ({})]: {}", name, id, arguments));
                }
                ContentPart::ToolResult {
                    call_id, content, ..
                } => {
                    flush_text(&mut blocks, message.role, &mut text);
                    blocks.push(format!("[Tool result {}]: {}", call_id, content));
                }
            }
        }
        flush_text(&mut blocks, message.role, &mut text);
    }
    blocks.join("\n\n")
}

fn flush_text(blocks: &mut Vec<String>, role: Role, text: &mut Vec<&str>) {
    if !text.is_empty() {
        blocks.push(format!("[{}]: {}", role.label(), text.join("\n")));
        text.clear();
    }
}
