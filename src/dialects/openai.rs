// ABOUTME: OpenAI chat-completions dialect: POST /v1/chat/completions.
// ABOUTME: Maps chat messages onto the canonical history and renders chat.completion.chunk SSE.

use super::{arguments_string, parse_arguments, unix_now, Dialect};
use crate::server::AppState;
use axum::{body::Bytes, extract::State, response::Response};
use serde::Deserialize;
use serde_json::{json, Value};
use switchyard_core::{
    ChatMessage, ContentPart, ExchangeRequest, GatewayError, ProtocolRenderer, Role, ToolCall,
    ToolDefinition, Transport, WireFrame,
};

pub async fn chat_completions(State(state): State<AppState>, body: Bytes) -> Response {
    super::handle::<OpenAiChat>(state, body).await
}

pub struct OpenAiChat;

#[derive(Debug, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default)]
    pub model: Option<String>,
    pub messages: Vec<ChatCompletionMessage>,
    #[serde(default)]
    pub tools: Vec<ChatTool>,
    #[serde(default)]
    pub stream: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct ChatCompletionMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<Value>,
    #[serde(default)]
    pub tool_calls: Vec<ChatToolCall>,
    #[serde(default)]
    pub tool_call_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChatToolCall {
    pub id: String,
    pub function: ChatFunctionCall,
}

#[derive(Debug, Deserialize)]
pub struct ChatFunctionCall {
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

#[derive(Debug, Deserialize)]
pub struct ChatTool {
    #[serde(rename = "type", default = "function_type")]
    pub tool_type: String,
    pub function: ChatFunctionDef,
}

#[derive(Debug, Deserialize)]
pub struct ChatFunctionDef {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: Option<Value>,
}

fn function_type() -> String {
    "function".to_string()
}

/// Text of a string or array-of-parts content field
fn content_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

fn convert_message(message: ChatCompletionMessage) -> Result<ChatMessage, GatewayError> {
    let text = content_text(message.content.as_ref());
    match message.role.as_str() {
        "system" | "developer" => Ok(ChatMessage::system(text)),
        "user" => Ok(ChatMessage::user(text)),
        "assistant" => {
            let mut parts = Vec::new();
            if !text.is_empty() {
                parts.push(ContentPart::Text { text });
            }
            parts.extend(message.tool_calls.into_iter().map(|call| ContentPart::ToolCall {
                id: call.id,
                name: call.function.name,
                arguments: parse_arguments(&call.function.arguments),
            }));
            Ok(ChatMessage::new(Role::Assistant, parts))
        }
        "tool" => {
            let call_id = message.tool_call_id.ok_or_else(|| {
                GatewayError::InvalidRequest("tool message is missing tool_call_id".to_string())
            })?;
            Ok(ChatMessage::tool_result(call_id, text))
        }
        other => Err(GatewayError::InvalidRequest(format!(
            "unsupported message role '{}'",
            other
        ))),
    }
}

impl Dialect for OpenAiChat {
    const NAME: &'static str = "openai";

    type Request = ChatCompletionRequest;

    fn into_exchange(request: ChatCompletionRequest) -> Result<ExchangeRequest, GatewayError> {
        if request.stream == Some(false) {
            return Err(GatewayError::InvalidRequest(
                "only streaming requests are supported (set stream: true)".to_string(),
            ));
        }
        let messages = request
            .messages
            .into_iter()
            .map(convert_message)
            .collect::<Result<Vec<_>, _>>()?;
        let tools = request
            .tools
            .into_iter()
            .filter(|t| t.tool_type == "function")
            .map(|t| {
                ToolDefinition::new(
                    t.function.name,
                    t.function.description,
                    t.function
                        .parameters
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
        Box::new(ChatChunkRenderer::new(model))
    }

    fn error_body(err: &GatewayError) -> Value {
        let error_type = if err.status_code() >= 500 {
            "server_error"
        } else {
            "invalid_request_error"
        };
        let code = match err {
            GatewayError::UnknownModel(_) => json!("model_not_found"),
            _ => Value::Null,
        };
        json!({
            "error": {
                "message": err.to_string(),
                "type": error_type,
                "param": null,
                "code": code,
            }
        })
    }
}

/// Renders `chat.completion.chunk` frames terminated by `[DONE]`
pub struct ChatChunkRenderer {
    id: String,
    model: String,
    created: u64,
    started: bool,
}

impl ChatChunkRenderer {
    pub fn new(model: &str) -> Self {
        Self {
            id: new_completion_id(),
            model: model.to_string(),
            created: unix_now(),
            started: false,
        }
    }

    fn chunk(&self, delta: Value, finish_reason: Option<&str>) -> WireFrame {
        WireFrame::data(json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish_reason,
            }],
        }))
    }

    fn ensure_started(&mut self, transport: &Transport) {
        if !self.started {
            self.started = true;
            transport.send(self.chunk(json!({"role": "assistant", "content": ""}), None));
        }
    }

    fn finish(&mut self, transport: &Transport, reason: &str) {
        self.ensure_started(transport);
        transport.send(self.chunk(json!({}), Some(reason)));
        transport.send(WireFrame::Done);
    }
}

fn new_completion_id() -> String {
    format!("chatcmpl-{}", super::short_id())
}

impl ProtocolRenderer for ChatChunkRenderer {
    fn flush_deltas(&mut self, transport: &Transport, texts: &[String]) {
        let text = texts.concat();
        if text.is_empty() {
            return;
        }
        self.ensure_started(transport);
        transport.send(self.chunk(json!({"content": text}), None));
    }

    fn emit_tools_and_finish(&mut self, transport: &Transport, tools: &[ToolCall]) {
        self.ensure_started(transport);
        for (index, tool) in tools.iter().enumerate() {
            transport.send(self.chunk(
                json!({
                    "tool_calls": [{
                        "index": index,
                        "id": tool.id,
                        "type": "function",
                        "function": {
                            "name": tool.name,
                            "arguments": arguments_string(&tool.arguments),
                        },
                    }],
                }),
                None,
            ));
        }
        self.finish(transport, "tool_calls");
    }

    fn send_completed(&mut self, transport: &Transport) {
        self.finish(transport, "stop");
    }

    fn send_failed(&mut self, transport: &Transport, message: &str) {
        transport.send(WireFrame::data(json!({
            "error": {
                "message": message,
                "type": "server_error",
                "param": null,
                "code": null,
            }
        })));
        transport.send(WireFrame::Done);
    }

    fn teardown(&mut self) {
        self.started = false;
    }

    fn reset(&mut self) {
        self.id = new_completion_id();
        self.created = unix_now();
        self.started = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(body: Value) -> Result<ExchangeRequest, GatewayError> {
        OpenAiChat::into_exchange(serde_json::from_value(body).unwrap())
    }

    fn frames(renderer: impl FnOnce(&mut ChatChunkRenderer, &Transport)) -> Vec<WireFrame> {
        let (transport, mut stream) = Transport::channel();
        let mut r = ChatChunkRenderer::new("m");
        renderer(&mut r, &transport);
        stream.drain()
    }

    fn data(frame: &WireFrame) -> &Value {
        match frame {
            WireFrame::Event { data, .. } => data,
            WireFrame::Done => panic!("unexpected [DONE]"),
        }
    }

    #[test]
    fn test_converts_tool_conversation() {
        let request = parse(json!({
            "model": "m",
            "stream": true,
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": [{"type": "text", "text": "find foo"}]},
                {"role": "assistant", "content": null, "tool_calls": [
                    {"id": "c1", "type": "function", "function": {"name": "search", "arguments": "{\"q\":\"foo\"}"}}
                ]},
                {"role": "tool", "tool_call_id": "c1", "content": "foo.rs"}
            ],
            "tools": [{"type": "function", "function": {"name": "search", "parameters": {"type": "object"}}}]
        }))
        .unwrap();

        assert_eq!(request.messages.len(), 4);
        assert_eq!(request.messages[0].role, Role::System);
        assert_eq!(request.messages[1].text_content(), "find foo");
        assert_eq!(
            request.messages[2].parts,
            vec![ContentPart::ToolCall {
                id: "c1".to_string(),
                name: "search".to_string(),
                arguments: json!({"q": "foo"}),
            }]
        );
        assert!(request.messages[3].has_tool_results());
        assert_eq!(request.tools[0].name, "search");
    }

    #[test]
    fn test_rejects_non_streaming_and_bad_roles() {
        let err = parse(json!({"messages": [{"role": "user", "content": "hi"}], "stream": false}))
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert!(parse(json!({"messages": [{"role": "robot", "content": "hi"}]})).is_err());
        assert!(parse(json!({"messages": [{"role": "tool", "content": "x"}]})).is_err());
    }

    #[test]
    fn test_error_envelope_shape() {
        let body = OpenAiChat::error_body(&GatewayError::InvalidRequest("bad".to_string()));
        assert_eq!(
            body,
            json!({"error": {"message": "bad", "type": "invalid_request_error", "param": null, "code": null}})
        );
    }

    #[test]
    fn test_text_then_stop() {
        let frames = frames(|r, t| {
            r.flush_deltas(t, &["Hel".to_string(), "lo".to_string()]);
            r.send_completed(t);
            r.teardown();
        });
        assert_eq!(frames.len(), 4);
        assert_eq!(data(&frames[0])["choices"][0]["delta"]["role"], "assistant");
        assert_eq!(data(&frames[1])["choices"][0]["delta"]["content"], "Hello");
        assert_eq!(data(&frames[2])["choices"][0]["finish_reason"], "stop");
        assert_eq!(frames[3], WireFrame::Done);
    }

    #[test]
    fn test_tool_calls_finish_with_tool_calls_reason() {
        let tools = vec![
            ToolCall {
                id: "c1".to_string(),
                name: "search".to_string(),
                arguments: json!({"q": "x"}),
            },
            ToolCall {
                id: "c2".to_string(),
                name: "read".to_string(),
                arguments: json!({}),
            },
        ];
        let frames = frames(|r, t| r.emit_tools_and_finish(t, &tools));
        let second = &data(&frames[2])["choices"][0]["delta"]["tool_calls"][0];
        assert_eq!(second["index"], 1);
        assert_eq!(second["function"]["name"], "read");
        assert_eq!(
            data(&frames[1])["choices"][0]["delta"]["tool_calls"][0]["function"]["arguments"],
            "{\"q\":\"x\"}"
        );
        assert_eq!(data(&frames[3])["choices"][0]["finish_reason"], "tool_calls");
        assert_eq!(frames[4], WireFrame::Done);
    }

    #[test]
    fn test_reset_starts_a_new_completion() {
        let (transport, mut stream) = Transport::channel();
        let mut r = ChatChunkRenderer::new("m");
        r.flush_deltas(&transport, &["a".to_string()]);
        let first_id = data(&stream.drain()[0])["id"].clone();
        r.reset();
        r.flush_deltas(&transport, &["b".to_string()]);
        let next = stream.drain();
        assert_eq!(next.len(), 2);
        assert_ne!(data(&next[0])["id"], first_id);
    }
}
