// ABOUTME: Tests for the per-conversation MCP bridge endpoint
// ABOUTME: Covers JSON-RPC plumbing, tool listing, and tools/call parking until the client answers

use axum::{
    body::{to_bytes, Body},
    http::{header, Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use std::time::Duration;
use switchyard::server::{build_router, AppState};
use switchyard_agent::backends::mock::{MockBackend, MockController};
use switchyard_agent::{AgentEvent, ToolRequest};
use switchyard_core::{
    BridgeSettings, ConversationManager, Gateway, GatewaySettings, ToolDefinition,
};
use tower::ServiceExt;

fn app(mock: MockBackend) -> (Router, MockController, ConversationManager) {
    let controller = mock.controller();
    let manager = ConversationManager::new(BridgeSettings::default());
    let gateway = Gateway::new(
        manager.clone(),
        mock.into_handle(),
        GatewaySettings::default(),
    );
    (build_router(AppState::new(gateway)), controller, manager)
}

async fn post_raw(app: Router, uri: String, body: String) -> (StatusCode, String, Option<String>) {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let conversation = response
        .headers()
        .get("x-switchyard-conversation")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let bytes = tokio::time::timeout(
        Duration::from_secs(5),
        to_bytes(response.into_body(), usize::MAX),
    )
    .await
    .expect("response body did not finish")
    .unwrap();
    (status, String::from_utf8(bytes.to_vec()).unwrap(), conversation)
}

async fn rpc(app: &Router, conversation_id: &str, body: Value) -> (StatusCode, Value) {
    let (status, text, _) = post_raw(
        app.clone(),
        format!("/mcp/{}", conversation_id),
        body.to_string(),
    )
    .await;
    let value = if text.is_empty() {
        Value::Null
    } else {
        serde_json::from_str(&text).unwrap()
    };
    (status, value)
}

fn search_tool() -> ToolDefinition {
    ToolDefinition::new(
        "search",
        Some("Search files".to_string()),
        json!({"type": "object", "properties": {"query": {"type": "string"}}}),
    )
}

async fn wait_for(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

// ============================================================================
// JSON-RPC plumbing
// ============================================================================

#[tokio::test]
async fn test_initialize_returns_server_info() {
    let (app, _, manager) = app(MockBackend::new());
    let conversation = manager.create(true);

    let (status, body) = rpc(
        &app,
        conversation.id(),
        json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}}),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], 1);
    assert_eq!(body["result"]["protocolVersion"], "2024-11-05");
    assert_eq!(body["result"]["serverInfo"]["name"], "switchyard");
    assert!(body["result"]["capabilities"]["tools"].is_object());
}

#[tokio::test]
async fn test_notification_is_acknowledged_without_body() {
    let (app, _, manager) = app(MockBackend::new());
    let conversation = manager.create(true);

    let (status, body) = rpc(
        &app,
        conversation.id(),
        json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
    )
    .await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body, Value::Null);
}

#[tokio::test]
async fn test_unknown_conversation_is_an_error() {
    let (app, _, _) = app(MockBackend::new());

    let (status, body) = rpc(
        &app,
        "missing",
        json!({"jsonrpc": "2.0", "id": 7, "method": "tools/list"}),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], 7);
    assert_eq!(body["error"]["message"], "conversation not found");
}

#[tokio::test]
async fn test_parse_error() {
    let (app, _, manager) = app(MockBackend::new());
    let conversation = manager.create(true);

    let (_, text, _) = post_raw(
        app,
        format!("/mcp/{}", conversation.id()),
        "{not json".to_string(),
    )
    .await;
    let body: Value = serde_json::from_str(&text).unwrap();

    assert_eq!(body["error"]["code"], -32700);
    assert_eq!(body["id"], Value::Null);
}

#[tokio::test]
async fn test_unknown_method_and_missing_params() {
    let (app, _, manager) = app(MockBackend::new());
    let conversation = manager.create(true);

    let (_, body) = rpc(
        &app,
        conversation.id(),
        json!({"jsonrpc": "2.0", "id": 1, "method": "resources/list"}),
    )
    .await;
    assert_eq!(body["error"]["code"], -32601);

    let (_, body) = rpc(
        &app,
        conversation.id(),
        json!({"jsonrpc": "2.0", "id": 2, "method": "tools/call", "params": {}}),
    )
    .await;
    assert_eq!(body["error"]["code"], -32602);
}

// ============================================================================
// Tools
// ============================================================================

#[tokio::test]
async fn test_tools_list_strips_namespace() {
    let (app, _, manager) = app(MockBackend::new());
    let conversation = manager.create(true);
    conversation.bridge().cache_tools(vec![ToolDefinition::new(
        "workspace__search",
        None,
        json!({"type": "object", "properties": {"query": {"type": "string"}}}),
    )]);

    let (_, body) = rpc(
        &app,
        conversation.id(),
        json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}),
    )
    .await;

    let tools = body["result"]["tools"].as_array().unwrap();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0]["name"], "search");
    assert_eq!(tools[0]["inputSchema"]["properties"]["query"]["type"], "string");
}

#[tokio::test]
async fn test_tools_call_without_announcement_is_rejected() {
    let (app, _, manager) = app(MockBackend::new());
    let conversation = manager.create(true);
    conversation.bridge().cache_tools(vec![search_tool()]);

    let (_, body) = rpc(
        &app,
        conversation.id(),
        json!({
            "jsonrpc": "2.0",
            "id": 3,
            "method": "tools/call",
            "params": {"name": "search", "arguments": {"query": "foo"}}
        }),
    )
    .await;

    assert_eq!(body["error"]["code"], -32603);
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("no expected call"));
    assert!(!conversation.bridge().router().has_pending());
}

#[tokio::test]
async fn test_tools_call_resolves_with_client_result() {
    let mock = MockBackend::new().on_prompt("find").respond_with(vec![
        AgentEvent::TextDelta("Looking.".to_string()),
        AgentEvent::TurnBoundary {
            tool_requests: vec![ToolRequest::bridged(
                "tc-1",
                "mcp__switchyard__search",
                json!({"query": "foo"}),
            )],
        },
    ]);
    let (app, controller, manager) = app(mock);

    let tools = json!([{
        "type": "function",
        "function": {
            "name": "search",
            "parameters": {"type": "object", "properties": {"query": {"type": "string"}}}
        }
    }]);

    // First exchange ends with the tool call surfaced to the client
    let (status, body, conversation_id) = post_raw(
        app.clone(),
        "/v1/chat/completions".to_string(),
        json!({
            "stream": true,
            "messages": [{"role": "user", "content": "find foo"}],
            "tools": tools
        })
        .to_string(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("\"finish_reason\":\"tool_calls\""));
    let conversation_id = conversation_id.unwrap();

    // The backend's tool subsystem invokes the bridged tool
    let mcp_app = app.clone();
    let mcp_id = conversation_id.clone();
    let mcp_call = tokio::spawn(async move {
        rpc(
            &mcp_app,
            &mcp_id,
            json!({
                "jsonrpc": "2.0",
                "id": 11,
                "method": "tools/call",
                "params": {"name": "mcp__switchyard__search", "arguments": {"query": "foo"}}
            }),
        )
        .await
    });
    let conversation = manager.get(&conversation_id).unwrap();
    wait_for(|| conversation.bridge().router().pending_count() == 1).await;

    // The client answers with the tool result
    let continuation = tokio::spawn(post_raw(
        app.clone(),
        "/v1/chat/completions".to_string(),
        json!({
            "stream": true,
            "messages": [
                {"role": "user", "content": "find foo"},
                {"role": "assistant", "content": "Looking.", "tool_calls": [
                    {"id": "tc-1", "type": "function", "function": {"name": "search", "arguments": "{\"query\":\"foo\"}"}}
                ]},
                {"role": "tool", "tool_call_id": "tc-1", "content": "src/foo.rs"}
            ],
            "tools": tools
        })
        .to_string(),
    ));

    let (_, body) = mcp_call.await.unwrap();
    assert_eq!(body["id"], 11);
    assert_eq!(body["result"]["content"][0]["text"], "src/foo.rs");

    // The backend finishes its turn after reading the tool output
    let session_id = controller.sessions()[0].clone();
    assert!(
        controller
            .emit(&session_id, AgentEvent::TextDelta("Found src/foo.rs".to_string()))
            .await
    );
    assert!(controller.emit(&session_id, AgentEvent::Idle).await);

    let (status, body, continued_id) = continuation.await.unwrap();
    assert_eq!(status, StatusCode::OK);
    assert_eq!(continued_id.as_deref(), Some(conversation_id.as_str()));
    assert!(body.contains("Found src/foo.rs"));
    assert!(body.contains("\"finish_reason\":\"stop\""));

    // The tool result never reached the backend as a prompt
    assert_eq!(controller.prompts().len(), 1);
}

#[tokio::test]
async fn test_tools_call_rejected_before_boundary_then_carries_exact_result() {
    let mock = MockBackend::new()
        .on_prompt("find")
        .respond_with(vec![AgentEvent::TextDelta("Looking.".to_string())]);
    let (app, controller, manager) = app(mock);

    let tools = json!([{
        "type": "function",
        "function": {
            "name": "search",
            "parameters": {"type": "object", "properties": {"query": {"type": "string"}}}
        }
    }]);
    let call = |id: u64| {
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "tools/call",
            "params": {"name": "mcp__switchyard__search", "arguments": {"query": "foo"}}
        })
    };

    let first = tokio::spawn(post_raw(
        app.clone(),
        "/v1/chat/completions".to_string(),
        json!({
            "stream": true,
            "messages": [{"role": "user", "content": "find foo"}],
            "tools": tools
        })
        .to_string(),
    ));
    wait_for(|| controller.prompts().len() == 1).await;
    let conversation = manager.primary().unwrap();
    let session_id = controller.sessions()[0].clone();

    // The backend has not announced the call yet
    let (_, body) = rpc(&app, conversation.id(), call(1)).await;
    assert_eq!(body["error"]["code"], -32603);
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("no expected call"));

    assert!(
        controller
            .emit(
                &session_id,
                AgentEvent::TurnBoundary {
                    tool_requests: vec![ToolRequest::bridged(
                        "tc-7",
                        "mcp__switchyard__search",
                        json!({"query": "foo"}),
                    )],
                },
            )
            .await
    );
    let (status, body, _) = first.await.unwrap();
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("\"finish_reason\":\"tool_calls\""));

    let mcp_app = app.clone();
    let mcp_id = conversation.id().to_string();
    let second_call = call(2);
    let parked = tokio::spawn(async move { rpc(&mcp_app, &mcp_id, second_call).await });
    wait_for(|| conversation.bridge().router().pending_count() == 1).await;

    let payload = "{\"hits\":[\"src/foo.rs\"],\n\"note\":\"tabs\\tand \\\"quotes\\\"\"}";
    let continuation = tokio::spawn(post_raw(
        app.clone(),
        "/v1/chat/completions".to_string(),
        json!({
            "stream": true,
            "messages": [
                {"role": "user", "content": "find foo"},
                {"role": "assistant", "content": "Looking.", "tool_calls": [
                    {"id": "tc-7", "type": "function", "function": {"name": "search", "arguments": "{\"query\":\"foo\"}"}}
                ]},
                {"role": "tool", "tool_call_id": "tc-7", "content": payload}
            ],
            "tools": tools
        })
        .to_string(),
    ));

    let (_, body) = parked.await.unwrap();
    assert_eq!(body["id"], 2);
    assert_eq!(body["result"]["content"][0]["text"], payload);

    assert!(controller.emit(&session_id, AgentEvent::Idle).await);
    let (status, _, _) = continuation.await.unwrap();
    assert_eq!(status, StatusCode::OK);
    assert!(!conversation.bridge().router().has_pending());
}
