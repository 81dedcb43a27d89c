// ABOUTME: Drives one backend session's events into whichever client transport is attached.
// ABOUTME: Dialects supply a ProtocolRenderer; event handling and teardown are shared here.

use crate::conversation::Conversation;
use crate::metrics;
use crate::reply::Transport;
use crate::tool_router::RejectReason;
use serde_json::Value;
use std::sync::Arc;
use switchyard_agent::{AgentEvent, EventReceiver, ToolRequest};
use tokio_util::sync::CancellationToken;

/// A tool call surfaced to the client, name already resolved to the
/// client's own spelling
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

impl ToolCall {
    /// Arguments as the JSON string most dialects carry
    pub fn arguments_json(&self) -> String {
        self.arguments.to_string()
    }
}

/// Wire-format half of the streaming core
///
/// Renderers hold per-response state (ids, open blocks, whether the start
/// frame went out) and emit it lazily with the first frame.
pub trait ProtocolRenderer: Send {
    /// Emit buffered text
    fn flush_deltas(&mut self, transport: &Transport, texts: &[String]);
    /// Emit tool calls and finish the response with a tool-use stop
    fn emit_tools_and_finish(&mut self, transport: &Transport, tools: &[ToolCall]);
    /// Finish the response normally
    fn send_completed(&mut self, transport: &Transport);
    /// Finish the response with an error
    fn send_failed(&mut self, transport: &Transport, message: &str);
    /// Release per-response state after a terminal frame
    fn teardown(&mut self);
    /// Prepare for the next response in the same turn chain
    fn reset(&mut self);
}

/// How a streaming task ended
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    Completed,
    Failed(String),
    Cancelled,
    StreamClosed,
}

enum Flow {
    Continue,
    Stop(TurnOutcome),
}

pub struct StreamingCore {
    conversation: Arc<Conversation>,
    renderer: Box<dyn ProtocolRenderer>,
    pending_text: Vec<String>,
}

impl StreamingCore {
    pub fn new(conversation: Arc<Conversation>, renderer: Box<dyn ProtocolRenderer>) -> Self {
        Self {
            conversation,
            renderer,
            pending_text: Vec::new(),
        }
    }

    /// Consume events until the session goes idle, fails, or `cancel` fires.
    /// Dropping `events` on return unsubscribes.
    pub async fn run(mut self, mut events: EventReceiver, cancel: CancellationToken) -> TurnOutcome {
        let conversation_id = self.conversation.id().to_string();
        let outcome = loop {
            tokio::select! {
                _ = cancel.cancelled() => break TurnOutcome::Cancelled,
                event = events.recv() => match event {
                    Some(event) => {
                        if let Flow::Stop(outcome) = self.handle_event(event) {
                            break outcome;
                        }
                    }
                    None => {
                        let message = "backend event stream closed";
                        self.handle_event(AgentEvent::error(
                            switchyard_agent::ErrorCode::BackendError,
                            message,
                        ));
                        break TurnOutcome::StreamClosed;
                    }
                },
            }
        };
        tracing::debug!(conversation_id = %conversation_id, outcome = ?outcome, "Streaming task finished");
        outcome
    }

    fn handle_event(&mut self, event: AgentEvent) -> Flow {
        match event {
            AgentEvent::TextDelta(text) => {
                self.pending_text.push(text);
                Flow::Continue
            }
            AgentEvent::TurnBoundary { tool_requests } => {
                self.on_turn_boundary(tool_requests);
                Flow::Continue
            }
            AgentEvent::Idle => {
                self.on_idle();
                Flow::Stop(TurnOutcome::Completed)
            }
            AgentEvent::Error { code, message } => {
                tracing::warn!(
                    conversation_id = %self.conversation.id(),
                    code = ?code,
                    error = %message,
                    "Backend reported an error"
                );
                self.on_error(&message);
                Flow::Stop(TurnOutcome::Failed(message))
            }
            AgentEvent::Usage(usage) => {
                metrics::record_usage(&usage);
                Flow::Continue
            }
        }
    }

    fn on_turn_boundary(&mut self, requests: Vec<ToolRequest>) {
        let conversation = Arc::clone(&self.conversation);
        let bridge = conversation.bridge();

        let surfaced: Vec<ToolRequest> = if bridge.bridging_active() {
            let before = requests.len();
            let kept: Vec<ToolRequest> = requests.into_iter().filter(|r| r.bridged).collect();
            if kept.len() < before {
                tracing::debug!(
                    conversation_id = %conversation.id(),
                    dropped = before - kept.len(),
                    "Ignoring built-in tool requests"
                );
            }
            kept
        } else {
            requests
        };

        if surfaced.is_empty() {
            let texts = std::mem::take(&mut self.pending_text);
            if !texts.is_empty() {
                let renderer = &mut self.renderer;
                let flushed = bridge
                    .reply()
                    .with_transport(|t| renderer.flush_deltas(t, &texts));
                if flushed.is_none() {
                    // Nothing to write to; keep the text for the next flush.
                    self.pending_text = texts;
                }
            }
            return;
        }

        let calls: Vec<ToolCall> = surfaced
            .into_iter()
            .map(|request| {
                let name = bridge.resolve_name(&request.name);
                let arguments = bridge.normalize_arguments(&name, request.arguments);
                bridge.router().register_expected(&request.call_id, &name);
                ToolCall {
                    id: request.call_id,
                    name,
                    arguments,
                }
            })
            .collect();

        let texts = std::mem::take(&mut self.pending_text);
        match bridge.reply().detach() {
            Some(transport) => {
                if !texts.is_empty() {
                    self.renderer.flush_deltas(&transport, &texts);
                }
                self.renderer.emit_tools_and_finish(&transport, &calls);
                self.renderer.reset();
                // Signal before the stream closes so a follow-up request
                // never sees this exchange still waiting.
                bridge.reply().signal_done();
                drop(transport);
                tracing::info!(
                    conversation_id = %conversation.id(),
                    tools = calls.len(),
                    "Surfaced tool calls to client"
                );
            }
            None => {
                tracing::debug!(
                    conversation_id = %conversation.id(),
                    tools = calls.len(),
                    dropped_text = texts.len(),
                    "No transport attached, tool calls registered only"
                );
            }
        }
    }

    fn on_idle(&mut self) {
        let conversation = Arc::clone(&self.conversation);
        let bridge = conversation.bridge();

        let texts = std::mem::take(&mut self.pending_text);
        let transport = bridge.reply().detach();
        if let Some(transport) = &transport {
            if !texts.is_empty() {
                self.renderer.flush_deltas(transport, &texts);
            }
            self.renderer.send_completed(transport);
            self.renderer.teardown();
        }
        // Done fires before the conversation reads as idle, so whoever
        // claims it next can arm a fresh waiter.
        bridge.reply().signal_done();
        bridge.lifecycle().mark_inactive();
        drop(transport);
        tracing::debug!(conversation_id = %conversation.id(), "Session idle");
    }

    fn on_error(&mut self, message: &str) {
        let conversation = Arc::clone(&self.conversation);
        let bridge = conversation.bridge();
        bridge.lifecycle().mark_errored();
        self.pending_text.clear();

        let transport = bridge.reply().detach();
        if let Some(transport) = &transport {
            self.renderer.send_failed(transport, message);
            self.renderer.teardown();
        }
        bridge.reply().signal_done();
        bridge.lifecycle().mark_inactive();
        drop(transport);
        metrics::record_error("backend_event");
    }
}

/// Tear a conversation's exchange down after the client hung up on
/// `transport_id`. Synchronous and idempotent: does nothing if the
/// transport was already detached by idle/error/tool completion or
/// replaced by a newer one. Returns true if it performed the teardown.
pub fn handle_disconnect(conversation: &Conversation, transport_id: u64) -> bool {
    let bridge = conversation.bridge();
    let Some(transport) = bridge.reply().detach_if(transport_id) else {
        return false;
    };
    drop(transport);
    tracing::warn!(conversation_id = %conversation.id(), transport_id, "Client disconnected mid-stream");
    bridge.reply().signal_done();

    // Isolated conversations release their session from the end callback.
    let session = conversation.session();
    bridge.lifecycle().mark_errored();
    bridge.lifecycle().cleanup_with(RejectReason::ClientDisconnected);
    conversation.cancel_turn();
    if let Some(session) = session {
        tokio::spawn(async move {
            if let Err(e) = session.abort().await {
                tracing::warn!(session_id = %session.id(), error = %e, "Failed to abort session after disconnect");
            }
        });
    }
    metrics::record_error("client_disconnect");
    true
}

/// Run [`handle_disconnect`] when the client side of `transport` goes away
pub fn watch_disconnect(conversation: Arc<Conversation>, transport: &Transport) {
    let closed = transport.closed_token();
    let transport_id = transport.id();
    tokio::spawn(async move {
        closed.cancelled().await;
        handle_disconnect(&conversation, transport_id);
    });
}
