// ABOUTME: MCP (Model Context Protocol) bridge endpoint, one per conversation
// ABOUTME: Lists the client's tools to the backend and parks tools/call until the client answers

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use switchyard_core::{metrics, Conversation};

use crate::server::AppState;

pub const PROTOCOL_VERSION: &str = "2024-11-05";

pub const PARSE_ERROR: i32 = -32700;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

/// JSON-RPC request structure
#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(default)]
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// JSON-RPC response structure
#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Serialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
}

impl JsonRpcResponse {
    fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    fn failure(id: Value, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
            }),
        }
    }
}

/// Handle POST /mcp/{conversation_id}
pub async fn mcp_handler(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    body: Bytes,
) -> Response {
    let request: JsonRpcRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!(conversation_id = %conversation_id, error = %e, "Unparseable MCP request");
            let response = JsonRpcResponse::failure(Value::Null, PARSE_ERROR, "Parse error");
            return (StatusCode::OK, Json(response)).into_response();
        }
    };
    tracing::debug!(conversation_id = %conversation_id, method = %request.method, "MCP request received");

    // Notifications carry no id and get no JSON-RPC reply
    let Some(id) = request.id.clone() else {
        return StatusCode::ACCEPTED.into_response();
    };

    let Some(conversation) = state.gateway.manager().get(&conversation_id) else {
        tracing::warn!(conversation_id = %conversation_id, method = %request.method, "MCP request for unknown conversation");
        let response = JsonRpcResponse::failure(id, INTERNAL_ERROR, "conversation not found");
        return (StatusCode::OK, Json(response)).into_response();
    };

    let response = match request.method.as_str() {
        "initialize" => handle_initialize(id, &state),
        "tools/list" => handle_tools_list(id, &conversation),
        "tools/call" => handle_tools_call(id, &conversation, &request.params).await,
        "ping" => JsonRpcResponse::success(id, json!({})),
        method => JsonRpcResponse::failure(
            id,
            METHOD_NOT_FOUND,
            format!("Method not found: {}", method),
        ),
    };

    (StatusCode::OK, Json(response)).into_response()
}

fn handle_initialize(id: Value, state: &AppState) -> JsonRpcResponse {
    JsonRpcResponse::success(
        id,
        json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {
                "tools": {}
            },
            "serverInfo": {
                "name": state.gateway.settings().mcp_server_name,
                "version": env!("CARGO_PKG_VERSION")
            }
        }),
    )
}

fn handle_tools_list(id: Value, conversation: &Conversation) -> JsonRpcResponse {
    let tools: Vec<Value> = conversation
        .bridge()
        .listed_tools()
        .into_iter()
        .map(|tool| {
            json!({
                "name": tool.name,
                "description": tool.description.unwrap_or_default(),
                "inputSchema": tool.input_schema,
            })
        })
        .collect();
    JsonRpcResponse::success(id, json!({ "tools": tools }))
}

/// Park the call on the router and answer with whatever the client's tool
/// result turns out to be
async fn handle_tools_call(
    id: Value,
    conversation: &Conversation,
    params: &Value,
) -> JsonRpcResponse {
    let Some(raw_name) = params.get("name").and_then(Value::as_str) else {
        return JsonRpcResponse::failure(id, INVALID_PARAMS, "tools/call requires a tool name");
    };
    let bridge = conversation.bridge();
    let name = bridge.resolve_name(raw_name);

    let pending = match bridge.router().register_incoming(&name) {
        Ok(pending) => pending,
        Err(e) => {
            tracing::warn!(
                conversation_id = %conversation.id(),
                tool = %name,
                error = %e,
                "Rejected unannounced tool call"
            );
            metrics::record_tool_route("unannounced");
            return JsonRpcResponse::failure(id, INTERNAL_ERROR, e.to_string());
        }
    };

    tracing::info!(
        conversation_id = %conversation.id(),
        tool = %name,
        call_id = %pending.call_id(),
        "Waiting for client tool result"
    );
    match pending.wait().await {
        Ok(result) => {
            metrics::record_tool_route("completed");
            JsonRpcResponse::success(
                id,
                json!({
                    "content": [{
                        "type": "text",
                        "text": result
                    }]
                }),
            )
        }
        Err(e) => {
            tracing::warn!(
                conversation_id = %conversation.id(),
                tool = %name,
                error = %e,
                "Tool call did not complete"
            );
            metrics::record_tool_route("rejected");
            JsonRpcResponse::failure(id, INTERNAL_ERROR, e.to_string())
        }
    }
}
