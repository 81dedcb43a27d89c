// ABOUTME: Anthropic messages dialect: POST /v1/messages.
// ABOUTME: Maps content blocks onto the canonical history and renders message_* SSE events.

use super::{parse_arguments, short_id, Dialect};
use crate::server::AppState;
use axum::{body::Bytes, extract::State, response::Response};
use serde::Deserialize;
use serde_json::{json, Value};
use switchyard_core::{
    ChatMessage, ContentPart, ExchangeRequest, GatewayError, ProtocolRenderer, Role, ToolCall,
    ToolDefinition, Transport, WireFrame,
};

pub async fn messages(State(state): State<AppState>, body: Bytes) -> Response {
    super::handle::<AnthropicMessages>(state, body).await
}

pub struct AnthropicMessages;

#[derive(Debug, Deserialize)]
pub struct MessagesRequest {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub system: Option<Value>,
    pub messages: Vec<AnthropicMessage>,
    #[serde(default)]
    pub tools: Vec<AnthropicTool>,
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub max_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct AnthropicMessage {
    pub role: String,
    pub content: MessageContent,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Option<Value>,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Deserialize)]
pub struct AnthropicTool {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub input_schema: Option<Value>,
}

/// Text of a string or text-block-array field
fn blocks_text(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

fn convert_message(message: AnthropicMessage) -> Result<ChatMessage, GatewayError> {
    let role = match message.role.as_str() {
        "user" => Role::User,
        "assistant" => Role::Assistant,
        other => {
            return Err(GatewayError::InvalidRequest(format!(
                "unsupported message role '{}'",
                other
            )))
        }
    };
    let parts = match message.content {
        MessageContent::Text(text) => vec![ContentPart::Text { text }],
        MessageContent::Blocks(blocks) => blocks
            .into_iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(ContentPart::Text { text }),
                ContentBlock::ToolUse { id, name, input } => Some(ContentPart::ToolCall {
                    id,
                    name,
                    arguments: input,
                }),
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                } => Some(ContentPart::ToolResult {
                    call_id: tool_use_id,
                    content: blocks_text(content.as_ref()),
                    is_error,
                }),
                ContentBlock::Unsupported => None,
            })
            .collect(),
    };
    Ok(ChatMessage::new(role, parts))
}

impl Dialect for AnthropicMessages {
    const NAME: &'static str = "anthropic";

    type Request = MessagesRequest;

    fn into_exchange(request: MessagesRequest) -> Result<ExchangeRequest, GatewayError> {
        if request.stream == Some(false) {
            return Err(GatewayError::InvalidRequest(
                "only streaming requests are supported (set stream: true)".to_string(),
            ));
        }
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        let system = blocks_text(request.system.as_ref());
        if !system.is_empty() {
            messages.push(ChatMessage::system(system));
        }
        for message in request.messages {
            messages.push(convert_message(message)?);
        }
        let tools = request
            .tools
            .into_iter()
            .map(|t| {
                ToolDefinition::new(
                    t.name,
                    t.description,
                    t.input_schema
                        .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
                )
            })
            .collect();
        Ok(ExchangeRequest {
            model: request.model,
            messages,
            tools,
        })
    }

    fn renderer(model: &str) -> Box<dyn ProtocolRenderer> {
        Box::new(MessageEventRenderer::new(model))
    }

    fn error_body(err: &GatewayError) -> Value {
        let error_type = if err.status_code() >= 500 {
            "api_error"
        } else {
            "invalid_request_error"
        };
        json!({
            "type": "error",
            "error": {
                "type": error_type,
                "message": err.to_string(),
            }
        })
    }
}

/// Renders Anthropic streaming events, one message per response
pub struct MessageEventRenderer {
    id: String,
    model: String,
    started: bool,
    next_index: usize,
    open_text_block: Option<usize>,
}

impl MessageEventRenderer {
    pub fn new(model: &str) -> Self {
        Self {
            id: new_message_id(),
            model: model.to_string(),
            started: false,
            next_index: 0,
            open_text_block: None,
        }
    }

    fn ensure_started(&mut self, transport: &Transport) {
        if self.started {
            return;
        }
        self.started = true;
        transport.send(WireFrame::named(
            "message_start",
            json!({
                "type": "message_start",
                "message": {
                    "id": self.id,
                    "type": "message",
                    "role": "assistant",
                    "model": self.model,
                    "content": [],
                    "stop_reason": null,
                    "stop_sequence": null,
                    "usage": {"input_tokens": 0, "output_tokens": 0},
                }
            }),
        ));
    }

    fn close_text_block(&mut self, transport: &Transport) {
        if let Some(index) = self.open_text_block.take() {
            transport.send(block_stop(index));
        }
    }

    fn finish(&mut self, transport: &Transport, stop_reason: &str) {
        self.ensure_started(transport);
        self.close_text_block(transport);
        transport.send(WireFrame::named(
            "message_delta",
            json!({
                "type": "message_delta",
                "delta": {"stop_reason": stop_reason, "stop_sequence": null},
                "usage": {"output_tokens": 0},
            }),
        ));
        transport.send(WireFrame::named(
            "message_stop",
            json!({"type": "message_stop"}),
        ));
    }

    fn take_index(&mut self) -> usize {
        let index = self.next_index;
        self.next_index += 1;
        index
    }
}

fn new_message_id() -> String {
    format!("msg_{}", short_id())
}

fn block_stop(index: usize) -> WireFrame {
    WireFrame::named(
        "content_block_stop",
        json!({"type": "content_block_stop", "index": index}),
    )
}

impl ProtocolRenderer for MessageEventRenderer {
    fn flush_deltas(&mut self, transport: &Transport, texts: &[String]) {
        let text = texts.concat();
        if text.is_empty() {
            return;
        }
        self.ensure_started(transport);
        let index = match self.open_text_block {
            Some(index) => index,
            None => {
                let index = self.take_index();
                transport.send(WireFrame::named(
                    "content_block_start",
                    json!({
                        "type": "content_block_start",
                        "index": index,
                        "content_block": {"type": "text", "text": ""},
                    }),
                ));
                self.open_text_block = Some(index);
                index
            }
        };
        transport.send(WireFrame::named(
            "content_block_delta",
            json!({
                "type": "content_block_delta",
                "index": index,
                "delta": {"type": "text_delta", "text": text},
            }),
        ));
    }

    fn emit_tools_and_finish(&mut self, transport: &Transport, tools: &[ToolCall]) {
        self.ensure_started(transport);
        self.close_text_block(transport);
        for tool in tools {
            let index = self.take_index();
            transport.send(WireFrame::named(
                "content_block_start",
                json!({
                    "type": "content_block_start",
                    "index": index,
                    "content_block": {
                        "type": "tool_use",
                        "id": tool.id,
                        "name": tool.name,
                        "input": {},
                    },
                }),
            ));
            transport.send(WireFrame::named(
                "content_block_delta",
                json!({
                    "type": "content_block_delta",
                    "index": index,
                    "delta": {"type": "input_json_delta", "partial_json": tool.arguments_json()},
                }),
            ));
            transport.send(block_stop(index));
        }
        self.finish(transport, "tool_use");
    }

    fn send_completed(&mut self, transport: &Transport) {
        self.finish(transport, "end_turn");
    }

    fn send_failed(&mut self, transport: &Transport, message: &str) {
        transport.send(WireFrame::named(
            "error",
            json!({
                "type": "error",
                "error": {"type": "api_error", "message": message},
            }),
        ));
    }

    fn teardown(&mut self) {
        self.started = false;
        self.open_text_block = None;
    }

    fn reset(&mut self) {
        self.id = new_message_id();
        self.started = false;
        self.next_index = 0;
        self.open_text_block = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(frames: &[WireFrame]) -> Vec<String> {
        frames
            .iter()
            .filter_map(|f| match f {
                WireFrame::Event { event, .. } => event.clone(),
                WireFrame::Done => None,
            })
            .collect()
    }

    fn parse(body: Value) -> Result<ExchangeRequest, GatewayError> {
        AnthropicMessages::into_exchange(serde_json::from_value(body).unwrap())
    }

    #[test]
    fn test_converts_blocks_and_system() {
        let request = parse(json!({
            "model": "m",
            "max_tokens": 1024,
            "system": [{"type": "text", "text": "be brief"}],
            "messages": [
                {"role": "user", "content": "find foo"},
                {"role": "assistant", "content": [
                    {"type": "text", "text": "Looking"},
                    {"type": "tool_use", "id": "tu1", "name": "search", "input": {"q": "foo"}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "tu1", "content": [{"type": "text", "text": "foo.rs"}]}
                ]}
            ],
            "tools": [{"name": "search", "input_schema": {"type": "object"}}]
        }))
        .unwrap();

        assert_eq!(request.messages[0], ChatMessage::system("be brief"));
        assert_eq!(request.messages[2].parts.len(), 2);
        let results: Vec<_> = request.messages[3].tool_results().collect();
        assert_eq!(results, vec![("tu1", "foo.rs")]);
        assert_eq!(request.messages[3].role, Role::User);
        assert_eq!(request.tools.len(), 1);
    }

    #[test]
    fn test_unknown_blocks_are_skipped() {
        let request = parse(json!({
            "messages": [{"role": "user", "content": [
                {"type": "image", "source": {}},
                {"type": "text", "text": "hi"}
            ]}]
        }))
        .unwrap();
        assert_eq!(request.messages[0].text_content(), "hi");
    }

    #[test]
    fn test_error_envelope_shape() {
        let body = AnthropicMessages::error_body(&GatewayError::InvalidRequest("bad".to_string()));
        assert_eq!(
            body,
            json!({"type": "error", "error": {"type": "invalid_request_error", "message": "bad"}})
        );
    }

    #[test]
    fn test_text_stream_event_order() {
        let (transport, mut stream) = Transport::channel();
        let mut r = MessageEventRenderer::new("m");
        r.flush_deltas(&transport, &["Hi".to_string()]);
        r.flush_deltas(&transport, &[" there".to_string()]);
        r.send_completed(&transport);

        let frames = stream.drain();
        assert_eq!(
            names(&frames),
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop"
            ]
        );
        match &frames[5] {
            WireFrame::Event { data, .. } => assert_eq!(data["delta"]["stop_reason"], "end_turn"),
            WireFrame::Done => unreachable!(),
        }
    }

    #[test]
    fn test_tool_use_blocks_follow_text() {
        let (transport, mut stream) = Transport::channel();
        let mut r = MessageEventRenderer::new("m");
        r.flush_deltas(&transport, &["Looking".to_string()]);
        r.emit_tools_and_finish(
            &transport,
            &[ToolCall {
                id: "tu1".to_string(),
                name: "search".to_string(),
                arguments: json!({"q": "foo"}),
            }],
        );

        let frames = stream.drain();
        let tool_start = frames
            .iter()
            .find_map(|f| match f {
                WireFrame::Event { data, .. } if data["content_block"]["type"] == "tool_use" => {
                    Some(data.clone())
                }
                _ => None,
            })
            .unwrap();
        assert_eq!(tool_start["index"], 1);
        assert_eq!(tool_start["content_block"]["name"], "search");
        let stop = frames
            .iter()
            .find_map(|f| match f {
                WireFrame::Event { event, data } if event.as_deref() == Some("message_delta") => {
                    Some(data["delta"]["stop_reason"].clone())
                }
                _ => None,
            })
            .unwrap();
        assert_eq!(stop, "tool_use");
    }

    #[test]
    fn test_failure_is_error_event() {
        let (transport, mut stream) = Transport::channel();
        let mut r = MessageEventRenderer::new("m");
        r.send_failed(&transport, "boom");
        let frames = stream.drain();
        assert_eq!(names(&frames), vec!["error"]);
    }
}
