// ABOUTME: Mock backend for testing - plays pre-configured event scripts per prompt.
// ABOUTME: Records prompts and sessions, and lets tests inject events into a live session.
//!
//! # Example
//!
//! ```no_run
//! use switchyard_agent::backends::mock::MockBackend;
//! use switchyard_agent::{AgentEvent, SessionConfig, ToolRequest};
//! use serde_json::json;
//!
//! # async fn example() {
//! let mock = MockBackend::new()
//!     .on_prompt("hello").respond_text("Hi there!")
//!     .on_prompt("search").respond_with(vec![
//!         AgentEvent::TextDelta("Let me look".to_string()),
//!         AgentEvent::TurnBoundary {
//!             tool_requests: vec![ToolRequest::bridged("tc-1", "search", json!({"q": "x"}))],
//!         },
//!     ]);
//!
//! let handle = mock.into_handle();
//! let session = handle.create_session(SessionConfig::default()).await.unwrap();
//! let mut events = session.subscribe().await.unwrap();
//! session.send("hello").await.unwrap();
//!
//! assert_eq!(events.recv().await, Some(AgentEvent::TextDelta("Hi there!".to_string())));
//! assert_eq!(events.recv().await, Some(AgentEvent::Idle));
//! # }
//! ```

use crate::config::SessionConfig;
use crate::event::{AgentEvent, ErrorCode};
use crate::handle::{AgentHandle, Command};
use crate::model::ModelInfo;
use anyhow::Result;
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// `[backend]` table for `type = "mock"`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MockConfig {
    /// Model ids to advertise instead of `mock-model`
    #[serde(default)]
    pub models: Option<Vec<String>>,
}

impl MockConfig {
    pub fn from_table(table: &serde_json::Value) -> Result<Self> {
        let config: MockConfig = serde_json::from_value(table.clone())?;
        if config.models.as_ref().is_some_and(Vec::is_empty) {
            anyhow::bail!("models must list at least one id");
        }
        Ok(config)
    }
}

/// Mock backend for testing
pub struct MockBackend {
    expectations: Arc<Mutex<VecDeque<Expectation>>>,
    state: Arc<Mutex<MockState>>,
    models: Vec<ModelInfo>,
    fail_create: Option<String>,
}

struct Expectation {
    pattern: String,
    reply: Reply,
}

enum Reply {
    Events(Vec<AgentEvent>),
    SendError(String),
}

#[derive(Default)]
struct MockState {
    sessions: HashMap<String, MockSession>,
    order: Vec<String>,
    prompts: Vec<RecordedPrompt>,
    aborted: Vec<String>,
}

struct MockSession {
    config: SessionConfig,
    event_tx: Option<mpsc::Sender<AgentEvent>>,
    closed: bool,
}

/// A prompt the mock received
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedPrompt {
    pub session_id: String,
    pub text: String,
}

/// Test-side view into a running mock backend
#[derive(Clone)]
pub struct MockController {
    state: Arc<Mutex<MockState>>,
}

impl MockController {
    /// Every prompt received so far, in order
    pub fn prompts(&self) -> Vec<RecordedPrompt> {
        self.lock().prompts.clone()
    }

    /// Ids of created sessions, in creation order
    pub fn sessions(&self) -> Vec<String> {
        self.lock().order.clone()
    }

    /// Config a session was created with
    pub fn session_config(&self, session_id: &str) -> Option<SessionConfig> {
        self.lock()
            .sessions
            .get(session_id)
            .map(|s| s.config.clone())
    }

    /// Ids of sessions that have been aborted
    pub fn aborted(&self) -> Vec<String> {
        self.lock().aborted.clone()
    }

    pub fn is_closed(&self, session_id: &str) -> bool {
        self.lock()
            .sessions
            .get(session_id)
            .map(|s| s.closed)
            .unwrap_or(false)
    }

    /// Push an event to the session's current subscriber. Returns false if
    /// nobody is subscribed.
    pub async fn emit(&self, session_id: &str, event: AgentEvent) -> bool {
        let tx = self
            .lock()
            .sessions
            .get(session_id)
            .and_then(|s| s.event_tx.clone());
        match tx {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl MockBackend {
    /// Create a new mock backend with no expectations
    pub fn new() -> Self {
        Self {
            expectations: Arc::new(Mutex::new(VecDeque::new())),
            state: Arc::new(Mutex::new(MockState::default())),
            models: vec![ModelInfo::new("mock-model")],
            fail_create: None,
        }
    }

    /// Set up an expectation for a prompt containing the given pattern
    pub fn on_prompt(self, pattern: &str) -> ExpectationBuilder {
        ExpectationBuilder {
            backend: self,
            pattern: pattern.to_string(),
        }
    }

    /// Replace the advertised model list
    pub fn with_models(mut self, ids: &[&str]) -> Self {
        self.models = ids.iter().map(|id| ModelInfo::new(*id)).collect();
        self
    }

    /// Make every session creation fail with the given message
    pub fn fail_session_creation(mut self, message: &str) -> Self {
        self.fail_create = Some(message.to_string());
        self
    }

    /// Controller for inspecting and driving the backend from tests
    pub fn controller(&self) -> MockController {
        MockController {
            state: Arc::clone(&self.state),
        }
    }

    /// Convert this backend into an AgentHandle
    pub fn into_handle(self) -> AgentHandle {
        let (tx, mut rx) = mpsc::channel::<Command>(32);
        let name = "mock";
        let expectations = self.expectations;
        let state = self.state;
        let models = self.models;
        let fail_create = self.fail_create;

        tokio::spawn(async move {
            let mut session_counter = 0u64;

            while let Some(cmd) = rx.recv().await {
                match cmd {
                    Command::CreateSession { config, reply } => {
                        if let Some(message) = &fail_create {
                            let _ = reply.send(Err(anyhow::anyhow!(message.clone())));
                            continue;
                        }
                        session_counter += 1;
                        let session_id = format!("mock-session-{}", session_counter);
                        {
                            let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
                            state.sessions.insert(
                                session_id.clone(),
                                MockSession {
                                    config,
                                    event_tx: None,
                                    closed: false,
                                },
                            );
                            state.order.push(session_id.clone());
                        }
                        let _ = reply.send(Ok(session_id));
                    }
                    Command::Subscribe {
                        session_id,
                        event_tx,
                        reply,
                    } => {
                        let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
                        match state.sessions.get_mut(&session_id) {
                            Some(session) => {
                                session.event_tx = Some(event_tx);
                                let _ = reply.send(Ok(()));
                            }
                            None => {
                                let _ = reply.send(Err(anyhow::anyhow!(
                                    "Unknown session: {}",
                                    session_id
                                )));
                            }
                        }
                    }
                    Command::Send {
                        session_id,
                        prompt,
                        reply,
                    } => {
                        let event_tx = {
                            let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
                            let Some(session) = state.sessions.get(&session_id) else {
                                let _ = reply.send(Err(anyhow::anyhow!(
                                    "Unknown session: {}",
                                    session_id
                                )));
                                continue;
                            };
                            let event_tx = session.event_tx.clone();
                            state.prompts.push(RecordedPrompt {
                                session_id: session_id.clone(),
                                text: prompt.clone(),
                            });
                            event_tx
                        };

                        // FIFO preference: take the front expectation when it matches,
                        // otherwise the first matching one anywhere in the queue.
                        let expected = {
                            let mut exp = expectations.lock().unwrap_or_else(|e| e.into_inner());
                            match exp.front() {
                                Some(front) if prompt.contains(&front.pattern) => exp.pop_front(),
                                _ => exp
                                    .iter()
                                    .position(|e| prompt.contains(&e.pattern))
                                    .and_then(|i| exp.remove(i)),
                            }
                        };

                        let events = match expected.map(|e| e.reply) {
                            Some(Reply::SendError(message)) => {
                                let _ = reply.send(Err(anyhow::anyhow!(message)));
                                continue;
                            }
                            Some(Reply::Events(events)) => events,
                            None => vec![
                                AgentEvent::TextDelta(format!(
                                    "Mock: no expectation for '{}'",
                                    prompt
                                )),
                                AgentEvent::Idle,
                            ],
                        };
                        let _ = reply.send(Ok(()));

                        let Some(event_tx) = event_tx else {
                            tracing::debug!(session_id = %session_id, "No subscriber, dropping scripted events");
                            continue;
                        };
                        tokio::spawn(async move {
                            for event in events {
                                if event_tx.send(event).await.is_err() {
                                    break;
                                }
                            }
                        });
                    }
                    Command::Abort { session_id, reply } => {
                        let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
                        state.aborted.push(session_id);
                        let _ = reply.send(Ok(()));
                    }
                    Command::CloseSession { session_id } => {
                        let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
                        if let Some(session) = state.sessions.get_mut(&session_id) {
                            session.closed = true;
                            session.event_tx = None;
                        }
                    }
                    Command::ListModels { reply } => {
                        let _ = reply.send(Ok(models.clone()));
                    }
                }
            }
        });

        AgentHandle::new(tx, name)
    }

    pub fn check_config(table: &serde_json::Value) -> Result<()> {
        MockConfig::from_table(table).map(|_| ())
    }

    /// Factory function for the registry
    pub fn factory() -> crate::registry::BackendFactory {
        Box::new(|table| {
            let config = MockConfig::from_table(table)?;
            let mut backend = MockBackend::new();
            if let Some(models) = &config.models {
                let ids: Vec<&str> = models.iter().map(String::as_str).collect();
                backend = backend.with_models(&ids);
            }
            Ok(backend.into_handle())
        })
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for setting up mock expectations with a fluent API
pub struct ExpectationBuilder {
    backend: MockBackend,
    pattern: String,
}

impl ExpectationBuilder {
    /// Respond with a list of events
    pub fn respond_with(self, events: Vec<AgentEvent>) -> MockBackend {
        self.push(Reply::Events(events))
    }

    /// Respond with a text delta followed by idle
    pub fn respond_text(self, text: &str) -> MockBackend {
        self.respond_with(vec![AgentEvent::TextDelta(text.to_string()), AgentEvent::Idle])
    }

    /// Respond with an error event
    pub fn respond_error(self, code: ErrorCode, message: &str) -> MockBackend {
        self.respond_with(vec![AgentEvent::error(code, message)])
    }

    /// Reject the send itself
    pub fn fail_send(self, message: &str) -> MockBackend {
        self.push(Reply::SendError(message.to_string()))
    }

    fn push(self, reply: Reply) -> MockBackend {
        self.backend
            .expectations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Expectation {
                pattern: self.pattern,
                reply,
            });
        self.backend
    }
}
