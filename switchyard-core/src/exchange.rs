// ABOUTME: One client request/response exchange, independent of wire dialect.
// ABOUTME: Routes continuations, reuses or isolates conversations, and starts the streaming task.

use crate::conversation::{Conversation, ConversationManager, NewRequestMatch};
use crate::message::{format_prompt, system_prompt, trailing_tool_results, ChatMessage, Role};
use crate::metrics;
use crate::reply::{DoneSignal, Transport, TransportStream};
use crate::streaming::{watch_disconnect, ProtocolRenderer, StreamingCore};
use crate::tool_cache::ToolDefinition;
use std::path::PathBuf;
use std::sync::Arc;
use switchyard_agent::{AgentHandle, McpServerConfig, ModelInfo, SessionConfig};

/// Settings the gateway needs to wire sessions back to the MCP bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewaySettings {
    /// Base URL the backend uses to reach this server
    pub public_url: String,
    /// Name the bridge is registered under in each backend session
    pub mcp_server_name: String,
    /// Working directory passed to new sessions
    pub working_dir: Option<PathBuf>,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            public_url: "http://127.0.0.1:8080".to_string(),
            mcp_server_name: "switchyard".to_string(),
            working_dir: None,
        }
    }
}

impl GatewaySettings {
    pub fn mcp_url(&self, conversation_id: &str) -> String {
        format!(
            "{}/mcp/{}",
            self.public_url.trim_end_matches('/'),
            conversation_id
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error("unknown model '{0}'")]
    UnknownModel(String),
    #[error("{0}")]
    Conflict(String),
    #[error("backend error: {0}")]
    Backend(String),
}

impl GatewayError {
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::InvalidRequest(_) | GatewayError::UnknownModel(_) => 400,
            GatewayError::Conflict(_) => 409,
            GatewayError::Backend(_) => 500,
        }
    }

    /// Short machine-readable code for error envelopes
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::InvalidRequest(_) => "invalid_request",
            GatewayError::UnknownModel(_) => "model_not_found",
            GatewayError::Conflict(_) => "conflict",
            GatewayError::Backend(_) => "backend_error",
        }
    }

    fn backend(err: anyhow::Error) -> Self {
        GatewayError::Backend(format!("{:#}", err))
    }
}

/// A request after dialect parsing
#[derive(Debug, Clone, Default)]
pub struct ExchangeRequest {
    pub model: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    New,
    Reuse,
    Continuation,
}

impl ExchangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ExchangeKind::New => "new",
            ExchangeKind::Reuse => "reuse",
            ExchangeKind::Continuation => "continuation",
        }
    }
}

/// A started exchange. The caller streams `stream` to the client.
#[derive(Debug)]
pub struct Exchange {
    pub conversation_id: String,
    pub kind: ExchangeKind,
    pub model: String,
    pub stream: TransportStream,
    pub done: DoneSignal,
}

#[derive(Clone)]
pub struct Gateway {
    manager: ConversationManager,
    agent: AgentHandle,
    settings: GatewaySettings,
}

impl Gateway {
    pub fn new(manager: ConversationManager, agent: AgentHandle, settings: GatewaySettings) -> Self {
        Self {
            manager,
            agent,
            settings,
        }
    }

    pub fn manager(&self) -> &ConversationManager {
        &self.manager
    }

    pub fn agent(&self) -> &AgentHandle {
        &self.agent
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    pub async fn list_models(&self) -> Result<Vec<ModelInfo>, GatewayError> {
        self.agent.list_models().await.map_err(GatewayError::backend)
    }

    /// Resolve a requested model id against the backend's list: exact,
    /// then case-insensitive, then unique prefix. No request picks the
    /// first model.
    pub async fn resolve_model(
        &self,
        requested: Option<&str>,
        needs_tools: bool,
    ) -> Result<String, GatewayError> {
        let models = self.list_models().await?;
        let model = pick_model(&models, requested)?;
        if needs_tools && !model.supports_tools {
            return Err(GatewayError::InvalidRequest(format!(
                "model '{}' does not support tools",
                model.id
            )));
        }
        Ok(model.id.clone())
    }

    /// Start an exchange for a parsed request. `make_renderer` is only
    /// called when a new streaming task starts; continuations keep the
    /// renderer of the task already running.
    pub async fn begin<F>(
        &self,
        request: ExchangeRequest,
        make_renderer: F,
    ) -> Result<Exchange, GatewayError>
    where
        F: FnOnce(&str) -> Box<dyn ProtocolRenderer> + Send,
    {
        if request.messages.is_empty() {
            return Err(GatewayError::InvalidRequest(
                "messages must not be empty".to_string(),
            ));
        }
        let model = self
            .resolve_model(request.model.as_deref(), !request.tools.is_empty())
            .await?;

        if let Some(conversation) = self.manager.find_by_continuation(&request.messages) {
            return self.continue_exchange(conversation, &request.messages, model);
        }

        let mut found = self.manager.find_for_new_request();
        if found.is_reuse {
            let conversation = &found.conversation;
            let model_changed = conversation.model().is_some_and(|m| m != model);
            let history_reset = request.messages.len() <= conversation.sent_message_count();
            if model_changed || history_reset {
                tracing::info!(
                    conversation_id = %conversation.id(),
                    model_changed,
                    history_reset,
                    "Primary conversation no longer matches client history"
                );
                self.manager.clear_primary();
                found = self.manager.find_for_new_request();
            }
        }

        let NewRequestMatch {
            conversation,
            is_reuse,
        } = found;
        let bridge = conversation.bridge();
        bridge.lifecycle().mark_active();

        // A waiter still armed belongs to an exchange that has not finished.
        // Its transport, turn and router entries are left untouched.
        let done = match bridge.reply().wait_until_done() {
            Ok(done) => done,
            Err(e) => {
                tracing::warn!(conversation_id = %conversation.id(), error = %e, "Conversation still has an exchange in flight");
                metrics::record_error("exchange_conflict");
                return Err(GatewayError::Conflict(e.to_string()));
            }
        };

        match self
            .start_exchange(&conversation, is_reuse, request, &model, done, make_renderer)
            .await
        {
            Ok(exchange) => Ok(exchange),
            Err(e) => {
                tracing::warn!(conversation_id = %conversation.id(), error = %e, "Exchange failed to start");
                metrics::record_error("exchange_start");
                conversation.cancel_turn();
                bridge.reply().detach();
                bridge.reply().signal_done();
                bridge.lifecycle().mark_inactive();
                if !is_reuse {
                    self.manager.remove(conversation.id());
                }
                Err(e)
            }
        }
    }

    fn continue_exchange(
        &self,
        conversation: Arc<Conversation>,
        messages: &[ChatMessage],
        model: String,
    ) -> Result<Exchange, GatewayError> {
        let bridge = conversation.bridge();
        let done = bridge
            .reply()
            .wait_until_done()
            .map_err(|e| GatewayError::Conflict(e.to_string()))?;

        let (transport, stream) = Transport::channel();
        watch_disconnect(Arc::clone(&conversation), &transport);
        if let Some(previous) = bridge.reply().attach(transport) {
            tracing::debug!(conversation_id = %conversation.id(), transport_id = previous.id(), "Continuation replaced an attached transport");
        }

        let results = trailing_tool_results(messages);
        for (call_id, content) in results {
            let outcome = bridge.router().resolve(&call_id, content);
            metrics::record_tool_route(outcome.as_str());
            tracing::info!(
                conversation_id = %conversation.id(),
                call_id = %call_id,
                outcome = outcome.as_str(),
                "Replayed tool result"
            );
        }
        conversation.record_sent(messages.len());
        metrics::record_conversation("continued");

        Ok(Exchange {
            conversation_id: conversation.id().to_string(),
            kind: ExchangeKind::Continuation,
            model,
            stream,
            done,
        })
    }

    async fn start_exchange<F>(
        &self,
        conversation: &Arc<Conversation>,
        is_reuse: bool,
        request: ExchangeRequest,
        model: &str,
        done: DoneSignal,
        make_renderer: F,
    ) -> Result<Exchange, GatewayError>
    where
        F: FnOnce(&str) -> Box<dyn ProtocolRenderer> + Send,
    {
        let bridge = conversation.bridge();
        let ExchangeRequest {
            messages, tools, ..
        } = request;
        if !tools.is_empty() {
            bridge.cache_tools(tools);
        }

        let sent = conversation.sent_message_count().min(messages.len());
        let suffix = unsent_suffix(&messages, sent);
        let prompt = format_prompt(suffix);
        if prompt.is_empty() {
            return Err(GatewayError::InvalidRequest(
                "request carries no new user content".to_string(),
            ));
        }

        let session = match conversation.session() {
            Some(session) => session,
            None => {
                let config = SessionConfig {
                    model: Some(model.to_string()),
                    system_prompt: system_prompt(&messages),
                    mcp_servers: vec![McpServerConfig {
                        name: self.settings.mcp_server_name.clone(),
                        url: self.settings.mcp_url(conversation.id()),
                    }],
                    working_dir: self.settings.working_dir.clone(),
                };
                let session = self
                    .agent
                    .create_session(config)
                    .await
                    .map_err(GatewayError::backend)?;
                tracing::info!(conversation_id = %conversation.id(), session_id = %session.id(), "Backend session created");
                conversation.set_session(session.clone());
                session
            }
        };
        conversation.set_model(model);

        let events = session.subscribe().await.map_err(GatewayError::backend)?;
        session
            .send(&prompt)
            .await
            .map_err(GatewayError::backend)?;
        conversation.record_sent(messages.len());

        let (transport, stream) = Transport::channel();
        watch_disconnect(Arc::clone(conversation), &transport);
        bridge.reply().attach(transport);

        let cancel = conversation.start_turn();
        let core = StreamingCore::new(Arc::clone(conversation), make_renderer(model));
        tokio::spawn(core.run(events, cancel));

        let kind = if is_reuse {
            ExchangeKind::Reuse
        } else {
            ExchangeKind::New
        };
        tracing::info!(
            conversation_id = %conversation.id(),
            kind = kind.as_str(),
            forwarded = suffix.len(),
            "Exchange started"
        );

        Ok(Exchange {
            conversation_id: conversation.id().to_string(),
            kind,
            model: model.to_string(),
            stream,
            done,
        })
    }
}

/// Messages past `sent`, minus the leading assistant turns the session
/// produced itself
fn unsent_suffix(messages: &[ChatMessage], sent: usize) -> &[ChatMessage] {
    let suffix = &messages[sent..];
    if sent == 0 {
        return suffix;
    }
    let echoed = suffix
        .iter()
        .take_while(|m| m.role == Role::Assistant)
        .count();
    &suffix[echoed..]
}

fn pick_model<'a>(
    models: &'a [ModelInfo],
    requested: Option<&str>,
) -> Result<&'a ModelInfo, GatewayError> {
    let Some(requested) = requested.filter(|r| !r.is_empty()) else {
        return models
            .first()
            .ok_or_else(|| GatewayError::Backend("backend reports no models".to_string()));
    };
    if let Some(exact) = models.iter().find(|m| m.id == requested) {
        return Ok(exact);
    }
    if let Some(folded) = models.iter().find(|m| m.id.eq_ignore_ascii_case(requested)) {
        return Ok(folded);
    }
    let lowered = requested.to_ascii_lowercase();
    let mut prefixed = models
        .iter()
        .filter(|m| m.id.to_ascii_lowercase().starts_with(&lowered));
    match (prefixed.next(), prefixed.next()) {
        (Some(only), None) => Ok(only),
        _ => Err(GatewayError::UnknownModel(requested.to_string())),
    }
}
