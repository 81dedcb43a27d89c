// ABOUTME: OpenAI responses dialect: POST /v1/responses.
// ABOUTME: Maps input items onto the canonical history and renders response.* SSE events.

use super::{arguments_string, parse_arguments, short_id, unix_now, Dialect};
use crate::server::AppState;
use axum::{body::Bytes, extract::State, response::Response};
use serde::Deserialize;
use serde_json::{json, Value};
use switchyard_core::{
    ChatMessage, ContentPart, ExchangeRequest, GatewayError, ProtocolRenderer, Role, ToolCall,
    ToolDefinition, Transport, WireFrame,
};

pub async fn responses(State(state): State<AppState>, body: Bytes) -> Response {
    super::handle::<OpenAiResponses>(state, body).await
}

pub struct OpenAiResponses;

#[derive(Debug, Deserialize)]
pub struct ResponsesRequest {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub instructions: Option<String>,
    pub input: ResponsesInput,
    #[serde(default)]
    pub tools: Vec<ResponsesTool>,
    #[serde(default)]
    pub stream: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ResponsesInput {
    Text(String),
    Items(Vec<InputItem>),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputItem {
    Message {
        role: String,
        content: Value,
    },
    FunctionCall {
        call_id: String,
        name: String,
        #[serde(default)]
        arguments: String,
    },
    FunctionCallOutput {
        call_id: String,
        output: Value,
    },
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Deserialize)]
pub struct ResponsesTool {
    #[serde(rename = "type", default = "default_tool_type")]
    pub tool_type: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: Option<Value>,
}

fn default_tool_type() -> String {
    "function".to_string()
}

/// Text of a string or an array of input_text/output_text parts
fn content_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter(|p| {
                matches!(
                    p.get("type").and_then(Value::as_str),
                    Some("input_text") | Some("output_text") | Some("text")
                )
            })
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

impl OpenAiResponses {
    fn convert_items(items: Vec<InputItem>) -> Result<Vec<ChatMessage>, GatewayError> {
        let mut messages: Vec<ChatMessage> = Vec::with_capacity(items.len());
        for item in items {
            match item {
                InputItem::Message { role, content } => {
                    let role = match role.as_str() {
                        "system" | "developer" => Role::System,
                        "user" => Role::User,
                        "assistant" => Role::Assistant,
                        other => {
                            return Err(GatewayError::InvalidRequest(format!(
                                "unsupported message role '{}'",
                                other
                            )))
                        }
                    };
                    messages.push(ChatMessage::text(role, content_text(&content)));
                }
                InputItem::FunctionCall {
                    call_id,
                    name,
                    arguments,
                } => {
                    let part = ContentPart::ToolCall {
                        id: call_id,
                        name,
                        arguments: parse_arguments(&arguments),
                    };
                    // Consecutive calls belong to one assistant turn
                    match messages.last_mut() {
                        Some(last) if last.role == Role::Assistant => last.parts.push(part),
                        _ => messages.push(ChatMessage::new(Role::Assistant, vec![part])),
                    }
                }
                InputItem::FunctionCallOutput { call_id, output } => {
                    let content = match output {
                        Value::String(s) => s,
                        other => content_text(&other),
                    };
                    messages.push(ChatMessage::tool_result(call_id, content));
                }
                InputItem::Unsupported => {}
            }
        }
        Ok(messages)
    }
}

impl Dialect for OpenAiResponses {
    const NAME: &'static str = "responses";

    type Request = ResponsesRequest;

    fn into_exchange(request: ResponsesRequest) -> Result<ExchangeRequest, GatewayError> {
        if request.stream == Some(false) {
            return Err(GatewayError::InvalidRequest(
                "only streaming requests are supported (set stream: true)".to_string(),
            ));
        }
        let mut messages = Vec::new();
        if let Some(instructions) = request.instructions.filter(|s| !s.is_empty()) {
            messages.push(ChatMessage::system(instructions));
        }
        match request.input {
            ResponsesInput::Text(text) => messages.push(ChatMessage::user(text)),
            ResponsesInput::Items(items) => messages.extend(Self::convert_items(items)?),
        }

        let mut tools = Vec::with_capacity(request.tools.len());
        for tool in request.tools {
            if tool.tool_type != "function" {
                tracing::debug!(tool_type = %tool.tool_type, "Skipping non-function tool");
                continue;
            }
            let name = tool.name.ok_or_else(|| {
                GatewayError::InvalidRequest("function tools require a name".to_string())
            })?;
            tools.push(ToolDefinition::new(
                name,
                tool.description,
                tool.parameters
                    .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
            ));
        }

        Ok(ExchangeRequest {
            model: request.model,
            messages,
            tools,
        })
    }

    fn renderer(model: &str) -> Box<dyn ProtocolRenderer> {
        Box::new(ResponseEventRenderer::new(model))
    }

    fn error_body(err: &GatewayError) -> Value {
        let error_type = if err.status_code() >= 500 {
            "server_error"
        } else {
            "invalid_request_error"
        };
        json!({
            "error": {
                "message": err.to_string(),
                "type": error_type,
                "code": err.code(),
            }
        })
    }
}

/// Renders responses-API streaming events with a running sequence number
pub struct ResponseEventRenderer {
    id: String,
    model: String,
    created_at: u64,
    sequence: u64,
    started: bool,
    /// Completed output items, echoed in the final response object
    output: Vec<Value>,
    open_message: Option<OpenMessage>,
}

struct OpenMessage {
    item_id: String,
    output_index: usize,
    text: String,
}

impl ResponseEventRenderer {
    pub fn new(model: &str) -> Self {
        Self {
            id: new_response_id(),
            model: model.to_string(),
            created_at: unix_now(),
            sequence: 0,
            started: false,
            output: Vec::new(),
            open_message: None,
        }
    }

    fn emit(&mut self, transport: &Transport, event: &str, mut data: Value) {
        if let Value::Object(map) = &mut data {
            map.insert("type".to_string(), json!(event));
            map.insert("sequence_number".to_string(), json!(self.sequence));
        }
        self.sequence += 1;
        transport.send(WireFrame::named(event, data));
    }

    fn response_object(&self, status: &str) -> Value {
        json!({
            "id": self.id,
            "object": "response",
            "created_at": self.created_at,
            "status": status,
            "model": self.model,
            "output": self.output,
        })
    }

    fn ensure_started(&mut self, transport: &Transport) {
        if self.started {
            return;
        }
        self.started = true;
        let response = self.response_object("in_progress");
        self.emit(
            transport,
            "response.created",
            json!({ "response": response }),
        );
    }

    fn close_message(&mut self, transport: &Transport) {
        let Some(open) = self.open_message.take() else {
            return;
        };
        let part = json!({"type": "output_text", "text": open.text, "annotations": []});
        self.emit(
            transport,
            "response.output_text.done",
            json!({
                "item_id": open.item_id,
                "output_index": open.output_index,
                "content_index": 0,
                "text": open.text,
            }),
        );
        self.emit(
            transport,
            "response.content_part.done",
            json!({
                "item_id": open.item_id,
                "output_index": open.output_index,
                "content_index": 0,
                "part": part,
            }),
        );
        let item = json!({
            "id": open.item_id,
            "type": "message",
            "status": "completed",
            "role": "assistant",
            "content": [part],
        });
        self.emit(
            transport,
            "response.output_item.done",
            json!({"output_index": open.output_index, "item": item}),
        );
        self.output.push(item);
    }

    fn complete(&mut self, transport: &Transport) {
        self.ensure_started(transport);
        self.close_message(transport);
        let response = self.response_object("completed");
        self.emit(
            transport,
            "response.completed",
            json!({ "response": response }),
        );
    }
}

fn new_response_id() -> String {
    format!("resp_{}", short_id())
}

impl ProtocolRenderer for ResponseEventRenderer {
    fn flush_deltas(&mut self, transport: &Transport, texts: &[String]) {
        let text = texts.concat();
        if text.is_empty() {
            return;
        }
        self.ensure_started(transport);

        if self.open_message.is_none() {
            let item_id = format!("msg_{}", short_id());
            let output_index = self.output.len();
            self.emit(
                transport,
                "response.output_item.added",
                json!({
                    "output_index": output_index,
                    "item": {
                        "id": item_id,
                        "type": "message",
                        "status": "in_progress",
                        "role": "assistant",
                        "content": [],
                    },
                }),
            );
            self.emit(
                transport,
                "response.content_part.added",
                json!({
                    "item_id": item_id,
                    "output_index": output_index,
                    "content_index": 0,
                    "part": {"type": "output_text", "text": "", "annotations": []},
                }),
            );
            self.open_message = Some(OpenMessage {
                item_id,
                output_index,
                text: String::new(),
            });
        }

        let (item_id, output_index) = match self.open_message.as_mut() {
            Some(open) => {
                open.text.push_str(&text);
                (open.item_id.clone(), open.output_index)
            }
            None => return,
        };
        self.emit(
            transport,
            "response.output_text.delta",
            json!({
                "item_id": item_id,
                "output_index": output_index,
                "content_index": 0,
                "delta": text,
            }),
        );
    }

    fn emit_tools_and_finish(&mut self, transport: &Transport, tools: &[ToolCall]) {
        self.ensure_started(transport);
        self.close_message(transport);
        for tool in tools {
            let item_id = format!("fc_{}", short_id());
            let output_index = self.output.len();
            let arguments = arguments_string(&tool.arguments);
            self.emit(
                transport,
                "response.output_item.added",
                json!({
                    "output_index": output_index,
                    "item": {
                        "id": item_id,
                        "type": "function_call",
                        "status": "in_progress",
                        "call_id": tool.id,
                        "name": tool.name,
                        "arguments": "",
                    },
                }),
            );
            self.emit(
                transport,
                "response.function_call_arguments.delta",
                json!({
                    "item_id": item_id,
                    "output_index": output_index,
                    "delta": arguments,
                }),
            );
            self.emit(
                transport,
                "response.function_call_arguments.done",
                json!({
                    "item_id": item_id,
                    "output_index": output_index,
                    "arguments": arguments,
                }),
            );
            let item = json!({
                "id": item_id,
                "type": "function_call",
                "status": "completed",
                "call_id": tool.id,
                "name": tool.name,
                "arguments": arguments,
            });
            self.emit(
                transport,
                "response.output_item.done",
                json!({"output_index": output_index, "item": item}),
            );
            self.output.push(item);
        }
        self.complete(transport);
    }

    fn send_completed(&mut self, transport: &Transport) {
        self.complete(transport);
    }

    fn send_failed(&mut self, transport: &Transport, message: &str) {
        self.ensure_started(transport);
        let mut response = self.response_object("failed");
        response["error"] = json!({"code": "server_error", "message": message});
        self.emit(
            transport,
            "response.failed",
            json!({ "response": response }),
        );
    }

    fn teardown(&mut self) {
        self.started = false;
        self.open_message = None;
    }

    fn reset(&mut self) {
        self.id = new_response_id();
        self.created_at = unix_now();
        self.sequence = 0;
        self.started = false;
        self.output.clear();
        self.open_message = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn events(frames: &[WireFrame]) -> Vec<(String, Value)> {
        frames
            .iter()
            .filter_map(|f| match f {
                WireFrame::Event {
                    event: Some(name),
                    data,
                } => Some((name.clone(), data.clone())),
                _ => None,
            })
            .collect()
    }

    fn parse(body: Value) -> Result<ExchangeRequest, GatewayError> {
        OpenAiResponses::into_exchange(serde_json::from_value(body).unwrap())
    }

    #[test]
    fn test_string_input_becomes_user_message() {
        let request = parse(json!({"model": "m", "input": "hello", "instructions": "be kind"})).unwrap();
        assert_eq!(
            request.messages,
            vec![ChatMessage::system("be kind"), ChatMessage::user("hello")]
        );
    }

    #[test]
    fn test_items_map_calls_and_outputs() {
        let request = parse(json!({
            "input": [
                {"type": "message", "role": "user", "content": [{"type": "input_text", "text": "find foo"}]},
                {"type": "function_call", "call_id": "c1", "name": "search", "arguments": "{\"q\":\"foo\"}"},
                {"type": "function_call", "call_id": "c2", "name": "read", "arguments": "{}"},
                {"type": "function_call_output", "call_id": "c1", "output": "foo.rs"}
            ],
            "tools": [
                {"type": "function", "name": "search", "parameters": {"type": "object"}},
                {"type": "web_search"}
            ]
        }))
        .unwrap();

        assert_eq!(request.messages.len(), 3);
        assert_eq!(request.messages[1].role, Role::Assistant);
        assert_eq!(request.messages[1].parts.len(), 2);
        let results: Vec<_> = request.messages[2].tool_results().collect();
        assert_eq!(results, vec![("c1", "foo.rs")]);
        assert_eq!(request.tools.len(), 1);
    }

    #[test]
    fn test_rejects_non_streaming() {
        let err = parse(json!({"input": "hi", "stream": false})).unwrap_err();
        assert!(matches!(err, GatewayError::InvalidRequest(_)));
    }

    #[test]
    fn test_sequence_numbers_increase() {
        let (transport, mut stream) = Transport::channel();
        let mut r = ResponseEventRenderer::new("m");
        r.flush_deltas(&transport, &["Hi".to_string()]);
        r.send_completed(&transport);

        let events = events(&stream.drain());
        let names: Vec<_> = events.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "response.created",
                "response.output_item.added",
                "response.content_part.added",
                "response.output_text.delta",
                "response.output_text.done",
                "response.content_part.done",
                "response.output_item.done",
                "response.completed"
            ]
        );
        for (i, (_, data)) in events.iter().enumerate() {
            assert_eq!(data["sequence_number"], i as u64);
        }
        let completed = &events[7].1["response"];
        assert_eq!(completed["status"], "completed");
        assert_eq!(completed["output"][0]["content"][0]["text"], "Hi");
    }

    #[test]
    fn test_function_call_items() {
        let (transport, mut stream) = Transport::channel();
        let mut r = ResponseEventRenderer::new("m");
        r.emit_tools_and_finish(
            &transport,
            &[ToolCall {
                id: "c1".to_string(),
                name: "search".to_string(),
                arguments: json!({"q": "foo"}),
            }],
        );

        let events = events(&stream.drain());
        let done = events
            .iter()
            .find(|(n, _)| n == "response.function_call_arguments.done")
            .unwrap();
        assert_eq!(done.1["arguments"], "{\"q\":\"foo\"}");
        let (last, data) = events.last().unwrap();
        assert_eq!(last, "response.completed");
        assert_eq!(data["response"]["output"][0]["call_id"], "c1");
    }

    #[test]
    fn test_failure_event() {
        let (transport, mut stream) = Transport::channel();
        let mut r = ResponseEventRenderer::new("m");
        r.send_failed(&transport, "boom");
        let events = events(&stream.drain());
        assert_eq!(events.last().unwrap().0, "response.failed");
        assert_eq!(events.last().unwrap().1["response"]["error"]["message"], "boom");
    }
}
