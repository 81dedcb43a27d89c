// ABOUTME: Tests for the scripted mock backend.
// ABOUTME: Validates scripts, prompt recording, injection, and failure modes.

use serde_json::json;
use std::time::Duration;
use switchyard_agent::backends::mock::MockBackend;
use switchyard_agent::{AgentEvent, ErrorCode, McpServerConfig, SessionConfig, ToolRequest};

async fn next(receiver: &mut switchyard_agent::EventReceiver) -> AgentEvent {
    tokio::time::timeout(Duration::from_secs(2), receiver.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event stream closed")
}

#[tokio::test]
async fn test_mock_backend_returns_configured_text_response() {
    let mock = MockBackend::new().on_prompt("hello").respond_text("Hi there!");
    let handle = mock.into_handle();

    let session = handle.create_session(SessionConfig::default()).await.unwrap();
    let mut events = session.subscribe().await.unwrap();
    session.send("hello").await.unwrap();

    assert_eq!(next(&mut events).await, AgentEvent::TextDelta("Hi there!".to_string()));
    assert_eq!(next(&mut events).await, AgentEvent::Idle);
}

#[tokio::test]
async fn test_mock_backend_tool_script() {
    let mock = MockBackend::new().on_prompt("search").respond_with(vec![
        AgentEvent::TextDelta("Looking".to_string()),
        AgentEvent::TurnBoundary {
            tool_requests: vec![ToolRequest::bridged("tc-1", "search", json!({"q": "rust"}))],
        },
    ]);
    let handle = mock.into_handle();
    let session = handle.create_session(SessionConfig::default()).await.unwrap();
    let mut events = session.subscribe().await.unwrap();
    session.send("please search").await.unwrap();

    assert!(matches!(next(&mut events).await, AgentEvent::TextDelta(_)));
    match next(&mut events).await {
        AgentEvent::TurnBoundary { tool_requests } => {
            assert_eq!(tool_requests.len(), 1);
            assert_eq!(tool_requests[0].call_id, "tc-1");
            assert!(tool_requests[0].bridged);
        }
        other => panic!("Expected TurnBoundary, got {:?}", other),
    }
}

#[tokio::test]
async fn test_mock_backend_error_response() {
    let mock = MockBackend::new()
        .on_prompt("fail")
        .respond_error(ErrorCode::BackendError, "Something went wrong");
    let handle = mock.into_handle();
    let session = handle.create_session(SessionConfig::default()).await.unwrap();
    let mut events = session.subscribe().await.unwrap();
    session.send("fail").await.unwrap();

    match next(&mut events).await {
        AgentEvent::Error { code, message } => {
            assert_eq!(code, ErrorCode::BackendError);
            assert_eq!(message, "Something went wrong");
        }
        other => panic!("Expected Error event, got {:?}", other),
    }
}

#[tokio::test]
async fn test_mock_backend_records_prompts_and_config() {
    let mock = MockBackend::new();
    let controller = mock.controller();
    let handle = mock.into_handle();

    let config = SessionConfig {
        model: Some("mock-model".to_string()),
        mcp_servers: vec![McpServerConfig {
            name: "bridge".to_string(),
            url: "http://localhost/mcp/c1".to_string(),
        }],
        ..SessionConfig::default()
    };
    let session = handle.create_session(config.clone()).await.unwrap();
    session.send("first").await.unwrap();
    session.send("second").await.unwrap();

    let prompts = controller.prompts();
    assert_eq!(prompts.len(), 2);
    assert_eq!(prompts[0].text, "first");
    assert_eq!(prompts[1].session_id, session.id());
    assert_eq!(controller.session_config(session.id()), Some(config));
}

#[tokio::test]
async fn test_mock_backend_unmatched_prompt_falls_back_to_echo() {
    let handle = MockBackend::new().into_handle();
    let session = handle.create_session(SessionConfig::default()).await.unwrap();
    let mut events = session.subscribe().await.unwrap();
    session.send("anything").await.unwrap();

    match next(&mut events).await {
        AgentEvent::TextDelta(text) => assert!(text.contains("no expectation")),
        other => panic!("Expected TextDelta, got {:?}", other),
    }
    assert_eq!(next(&mut events).await, AgentEvent::Idle);
}

#[tokio::test]
async fn test_mock_controller_emits_into_subscriber() {
    let mock = MockBackend::new();
    let controller = mock.controller();
    let handle = mock.into_handle();
    let session = handle.create_session(SessionConfig::default()).await.unwrap();

    assert!(!controller.emit(session.id(), AgentEvent::Idle).await);

    let mut events = session.subscribe().await.unwrap();
    assert!(controller.emit(session.id(), AgentEvent::TextDelta("late".to_string())).await);
    assert_eq!(next(&mut events).await, AgentEvent::TextDelta("late".to_string()));
}

#[tokio::test]
async fn test_mock_backend_send_failure_and_creation_failure() {
    let handle = MockBackend::new().on_prompt("boom").fail_send("send rejected").into_handle();
    let session = handle.create_session(SessionConfig::default()).await.unwrap();
    let err = session.send("boom").await.unwrap_err();
    assert!(err.to_string().contains("send rejected"));

    let handle = MockBackend::new().fail_session_creation("no capacity").into_handle();
    let err = handle
        .create_session(SessionConfig::default())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("no capacity"));
}

#[tokio::test]
async fn test_mock_backend_records_abort_and_close() {
    let mock = MockBackend::new();
    let controller = mock.controller();
    let handle = mock.into_handle();
    let session = handle.create_session(SessionConfig::default()).await.unwrap();

    session.abort().await.unwrap();
    assert_eq!(controller.aborted(), vec![session.id().to_string()]);

    session.close();
    // close is fire-and-forget; a round-trip through the worker orders it
    handle.list_models().await.unwrap();
    assert!(controller.is_closed(session.id()));
}

#[tokio::test]
async fn test_mock_backend_models() {
    let handle = MockBackend::new().with_models(&["alpha", "beta"]).into_handle();
    let models = handle.list_models().await.unwrap();
    let ids: Vec<&str> = models.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["alpha", "beta"]);
}
