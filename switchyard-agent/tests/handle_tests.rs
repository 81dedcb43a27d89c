// ABOUTME: Tests for AgentHandle, SessionHandle, and EventReceiver plumbing.
// ABOUTME: Covers Send/Sync bounds and behaviour when the backend worker is gone.

use switchyard_agent::handle::{AgentHandle, EventReceiver, SessionHandle};
use switchyard_agent::{AgentEvent, SessionConfig};
use tokio::sync::mpsc;

fn assert_send<T: Send>() {}
fn assert_sync<T: Sync>() {}

#[test]
fn test_agent_handle_is_send_sync() {
    assert_send::<AgentHandle>();
    assert_sync::<AgentHandle>();
}

#[test]
fn test_session_handle_is_send_sync() {
    assert_send::<SessionHandle>();
    assert_sync::<SessionHandle>();
}

#[test]
fn test_event_receiver_is_send() {
    assert_send::<EventReceiver>();
}

#[tokio::test]
async fn test_event_receiver_receives_events() {
    let (tx, rx) = mpsc::channel(32);
    let mut receiver = EventReceiver::new(rx);

    tx.send(AgentEvent::TextDelta("hello".to_string()))
        .await
        .unwrap();
    tx.send(AgentEvent::Idle).await.unwrap();
    drop(tx);

    let event1 = receiver.recv().await.unwrap();
    assert!(matches!(event1, AgentEvent::TextDelta(s) if s == "hello"));

    let event2 = receiver.recv().await.unwrap();
    assert_eq!(event2, AgentEvent::Idle);

    assert!(receiver.recv().await.is_none());
}

#[tokio::test]
async fn test_create_session_fails_when_worker_closed() {
    let (tx, rx) = mpsc::channel(1);
    drop(rx);
    let handle = AgentHandle::new(tx, "gone");

    let err = handle
        .create_session(SessionConfig::default())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Backend worker closed"));
}

#[tokio::test]
async fn test_list_models_fails_when_worker_drops_reply() {
    let (tx, mut rx) = mpsc::channel(1);
    let handle = AgentHandle::new(tx, "flaky");

    tokio::spawn(async move {
        // Receive the command and drop it without replying
        let _ = rx.recv().await;
    });

    let err = handle.list_models().await.unwrap_err();
    assert!(err.to_string().contains("dropped reply"));
}
