// ABOUTME: ACP protocol backend - drives claude-code-acp, codex-acp, or any ACP agent.
// ABOUTME: One persistent agent process serves every session; bridged MCP tool calls become turn boundaries.

use crate::config::{McpServerConfig, SessionConfig};
use crate::event::{AgentEvent, ErrorCode, ToolRequest};
use crate::handle::{AgentHandle, Command};
use crate::model::ModelInfo;
use acp::Agent as _;
use agent_client_protocol as acp;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;
use tokio::process::{Child, Command as ProcessCommand};
use tokio::sync::mpsc;
use tokio_util::compat::{TokioAsyncReadCompatExt, TokioAsyncWriteCompatExt};

/// Parallel tool calls arriving within this window share one turn boundary
const TOOL_BATCH_WINDOW: Duration = Duration::from_millis(50);

/// Configuration for the ACP backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcpConfig {
    /// Path to the ACP binary (codex-acp or claude-code-acp)
    pub binary: String,
    /// Timeout in seconds for a single prompt, tool round-trips included
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Working directory for the agent
    #[serde(default = "default_working_dir")]
    pub working_dir: PathBuf,
    /// Extra CLI arguments to pass to the ACP binary
    #[serde(default)]
    pub extra_args: Vec<String>,
    /// Model ids advertised to clients
    #[serde(default = "default_models")]
    pub models: Vec<String>,
}

fn default_timeout() -> u64 {
    1800
}

fn default_working_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_models() -> Vec<String> {
    vec!["default".to_string()]
}

impl AcpConfig {
    /// Parse and check a `[backend]` table
    pub fn from_table(table: &serde_json::Value) -> Result<Self> {
        if table.get("binary").is_none() {
            anyhow::bail!("binary is required for the acp backend");
        }
        let config: AcpConfig =
            serde_json::from_value(table.clone()).context("Failed to parse acp backend table")?;
        if config.binary.trim().is_empty() {
            anyhow::bail!("binary must not be empty");
        }
        if config.binary.contains("..") || config.binary.contains('\0') {
            anyhow::bail!("Invalid agent binary path");
        }
        if config.models.is_empty() {
            anyhow::bail!("ACP backend needs at least one model id");
        }
        if config.timeout_secs == 0 {
            anyhow::bail!("timeout_secs must be greater than zero");
        }
        Ok(config)
    }
}

/// MCP tool names are surfaced by ACP agents as `mcp__<server>__<tool>`
fn bridge_prefix(server: &McpServerConfig) -> String {
    format!("mcp__{}__", server.name)
}

/// Per-session routing state on the worker thread
struct SessionSink {
    event_tx: Option<mpsc::Sender<AgentEvent>>,
    bridge_prefixes: Vec<String>,
    /// Sent ahead of the first prompt, ACP has no system prompt slot
    system_prompt: Option<String>,
    pending_tools: Vec<ToolRequest>,
    flush_scheduled: bool,
    /// Bumped by every subscription
    generation: u64,
    /// Generation of the prompt still running, if any
    running: Option<u64>,
}

impl SessionSink {
    fn new(bridge_prefixes: Vec<String>, system_prompt: Option<String>) -> Self {
        Self {
            event_tx: None,
            bridge_prefixes,
            system_prompt,
            pending_tools: Vec::new(),
            flush_scheduled: false,
            generation: 0,
            running: None,
        }
    }

    fn subscribe(&mut self, event_tx: mpsc::Sender<AgentEvent>) {
        self.generation += 1;
        self.event_tx = Some(event_tx);
    }

    fn start_prompt(&mut self) -> u64 {
        self.running = Some(self.generation);
        self.generation
    }

    /// Mark `generation`'s prompt finished. True if its subscriber is
    /// still the current one.
    fn finish_prompt(&mut self, generation: u64) -> bool {
        if self.running == Some(generation) {
            self.running = None;
        }
        self.generation == generation
    }

    /// A prompt from before the current subscription is still producing
    /// output (typically a cancelled one that has not settled)
    fn is_draining(&self) -> bool {
        self.running.is_some_and(|g| g != self.generation)
    }
}

/// Handler for ACP client-side callbacks
struct AcpClientHandler {
    sessions: Mutex<HashMap<String, SessionSink>>,
}

impl AcpClientHandler {
    fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn with_session<T>(&self, session_id: &str, f: impl FnOnce(&mut SessionSink) -> T) -> Option<T> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.get_mut(session_id).map(f)
    }

    fn send_event(&self, session_id: &str, event: AgentEvent) {
        let tx = self
            .with_session(session_id, |sink| {
                if sink.is_draining() {
                    tracing::debug!(session_id = %session_id, ?event, "Dropping output of superseded prompt");
                    return None;
                }
                sink.event_tx.clone()
            })
            .flatten();
        let Some(tx) = tx else {
            tracing::debug!(session_id = %session_id, ?event, "No subscriber, dropping event");
            return;
        };
        if let Err(e) = tx.try_send(event) {
            match e {
                mpsc::error::TrySendError::Full(dropped_event) => {
                    tracing::warn!(
                        event = ?dropped_event,
                        "Event channel buffer full, dropping event"
                    );
                }
                mpsc::error::TrySendError::Closed(_) => {
                    tracing::debug!(session_id = %session_id, "Event channel closed, subscriber dropped");
                }
            }
        }
    }

    /// Emit any batched tool calls as one turn boundary
    fn flush_tools(&self, session_id: &str) {
        let batch = self
            .with_session(session_id, |sink| {
                sink.flush_scheduled = false;
                std::mem::take(&mut sink.pending_tools)
            })
            .unwrap_or_default();
        if !batch.is_empty() {
            tracing::debug!(session_id = %session_id, count = batch.len(), "Emitting tool turn boundary");
            self.send_event(
                session_id,
                AgentEvent::TurnBoundary {
                    tool_requests: batch,
                },
            );
        }
    }
}

fn content_text(content: acp::ContentBlock) -> String {
    match content {
        acp::ContentBlock::Text(t) => t.text,
        acp::ContentBlock::ResourceLink(r) => r.uri,
        _ => String::new(),
    }
}

/// Wrapper so the connection and the worker share one handler
struct HandlerWrapper(Rc<AcpClientHandler>);

#[async_trait::async_trait(?Send)]
impl acp::Client for HandlerWrapper {
    async fn request_permission(
        &self,
        args: acp::RequestPermissionRequest,
    ) -> acp::Result<acp::RequestPermissionResponse> {
        tracing::debug!(
            session_id = %args.session_id,
            tool_call_id = %args.tool_call.tool_call_id,
            "Auto-approving permission request"
        );

        let allow_option = args
            .options
            .iter()
            .find(|opt| matches!(opt.kind, acp::PermissionOptionKind::AllowOnce))
            .or_else(|| args.options.first());

        if let Some(option) = allow_option {
            Ok(acp::RequestPermissionResponse::new(
                acp::RequestPermissionOutcome::Selected(acp::SelectedPermissionOutcome::new(
                    option.option_id.clone(),
                )),
            ))
        } else {
            Ok(acp::RequestPermissionResponse::new(
                acp::RequestPermissionOutcome::Cancelled,
            ))
        }
    }

    async fn session_notification(&self, args: acp::SessionNotification) -> acp::Result<()> {
        let session_id = args.session_id.to_string();
        match args.update {
            acp::SessionUpdate::AgentMessageChunk(chunk) => {
                let text = content_text(chunk.content);
                if !text.is_empty() {
                    // Keep ordering: tool calls announced before this text go first
                    self.0.flush_tools(&session_id);
                    self.0.send_event(&session_id, AgentEvent::TextDelta(text));
                }
            }
            acp::SessionUpdate::ToolCall(tool_call) => {
                let name = tool_call.title.clone();
                let call_id = tool_call.tool_call_id.to_string();
                let arguments = tool_call
                    .raw_input
                    .clone()
                    .unwrap_or_else(|| serde_json::json!({}));

                let schedule = self.0.with_session(&session_id, |sink| {
                    let bridged = sink
                        .bridge_prefixes
                        .iter()
                        .any(|prefix| name.starts_with(prefix.as_str()));
                    if !bridged {
                        return false;
                    }
                    sink.pending_tools.push(ToolRequest::bridged(
                        call_id.clone(),
                        name.clone(),
                        arguments,
                    ));
                    let first = !sink.flush_scheduled;
                    sink.flush_scheduled = true;
                    first
                });

                match schedule {
                    Some(true) => {
                        let handler = Rc::clone(&self.0);
                        tokio::task::spawn_local(async move {
                            tokio::time::sleep(TOOL_BATCH_WINDOW).await;
                            handler.flush_tools(&session_id);
                        });
                    }
                    Some(false) => {
                        tracing::debug!(tool = %name, call_id = %call_id, "Built-in or batched tool call");
                    }
                    None => {
                        tracing::debug!(session_id = %session_id, "Tool call for unknown session");
                    }
                }
            }
            acp::SessionUpdate::AgentThoughtChunk(_) => {
                tracing::trace!(session_id = %session_id, "Ignoring thought chunk");
            }
            other => {
                tracing::debug!(?other, "Ignoring unhandled session update type");
            }
        }
        Ok(())
    }

    async fn write_text_file(
        &self,
        _args: acp::WriteTextFileRequest,
    ) -> acp::Result<acp::WriteTextFileResponse> {
        Err(acp::Error::method_not_found())
    }

    async fn read_text_file(
        &self,
        _args: acp::ReadTextFileRequest,
    ) -> acp::Result<acp::ReadTextFileResponse> {
        Err(acp::Error::method_not_found())
    }

    async fn create_terminal(
        &self,
        _args: acp::CreateTerminalRequest,
    ) -> acp::Result<acp::CreateTerminalResponse> {
        Err(acp::Error::method_not_found())
    }

    async fn terminal_output(
        &self,
        _args: acp::TerminalOutputRequest,
    ) -> acp::Result<acp::TerminalOutputResponse> {
        Err(acp::Error::method_not_found())
    }

    async fn release_terminal(
        &self,
        _args: acp::ReleaseTerminalRequest,
    ) -> acp::Result<acp::ReleaseTerminalResponse> {
        Err(acp::Error::method_not_found())
    }

    async fn wait_for_terminal_exit(
        &self,
        _args: acp::WaitForTerminalExitRequest,
    ) -> acp::Result<acp::WaitForTerminalExitResponse> {
        Err(acp::Error::method_not_found())
    }

    async fn kill_terminal_command(
        &self,
        _args: acp::KillTerminalCommandRequest,
    ) -> acp::Result<acp::KillTerminalCommandResponse> {
        Err(acp::Error::method_not_found())
    }

    async fn ext_method(&self, _args: acp::ExtRequest) -> acp::Result<acp::ExtResponse> {
        Err(acp::Error::method_not_found())
    }

    async fn ext_notification(&self, _args: acp::ExtNotification) -> acp::Result<()> {
        Ok(())
    }
}

/// Persistent ACP connection shared by all sessions
struct AcpConnection {
    child: Child,
    conn: acp::ClientSideConnection,
    handler: Rc<AcpClientHandler>,
    working_dir: PathBuf,
}

impl Drop for AcpConnection {
    fn drop(&mut self) {
        if let Err(e) = self.child.start_kill() {
            tracing::warn!(error = %e, "Failed to kill ACP agent process during Drop");
        }
    }
}

impl AcpConnection {
    async fn spawn(working_dir: &Path, agent_binary: &str, extra_args: &[String]) -> Result<Self> {
        if !working_dir.exists() {
            anyhow::bail!(
                "Working directory does not exist: {}",
                working_dir.display()
            );
        }

        tracing::info!(binary = %agent_binary, ?extra_args, cwd = %working_dir.display(), "Spawning ACP agent");

        let mut child = ProcessCommand::new(agent_binary)
            .args(extra_args)
            .current_dir(working_dir)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .context("Failed to spawn ACP agent")?;

        let stdin = child.stdin.take().context("Failed to get stdin")?;
        let stdout = child.stdout.take().context("Failed to get stdout")?;

        let handler = Rc::new(AcpClientHandler::new());
        let (conn, handle_io) = acp::ClientSideConnection::new(
            HandlerWrapper(Rc::clone(&handler)),
            stdin.compat_write(),
            stdout.compat(),
            |fut| {
                tokio::task::spawn_local(fut);
            },
        );
        tokio::task::spawn_local(handle_io);

        let working_dir = working_dir
            .canonicalize()
            .unwrap_or_else(|_| working_dir.to_path_buf());

        Ok(Self {
            child,
            conn,
            handler,
            working_dir,
        })
    }

    async fn initialize(&self) -> Result<()> {
        self.conn
            .initialize(
                acp::InitializeRequest::new(acp::ProtocolVersion::V1)
                    .client_capabilities(acp::ClientCapabilities::default())
                    .client_info(
                        acp::Implementation::new("switchyard", env!("CARGO_PKG_VERSION"))
                            .title("switchyard gateway"),
                    ),
            )
            .await
            .context("ACP initialization failed")?;

        tracing::info!("ACP connection initialized");
        Ok(())
    }

    async fn new_session(&self, config: SessionConfig) -> Result<String> {
        let cwd = config
            .working_dir
            .clone()
            .unwrap_or_else(|| self.working_dir.clone());
        let servers = config
            .mcp_servers
            .iter()
            .map(|s| acp::McpServer::Http(acp::McpServerHttp::new(s.name.clone(), s.url.clone())))
            .collect();

        let response = self
            .conn
            .new_session(acp::NewSessionRequest::new(cwd).mcp_servers(servers))
            .await
            .context("Failed to create new ACP session")?;

        let session_id = response.session_id.to_string();
        tracing::info!(
            session_id = %session_id,
            model = ?config.model,
            mcp_servers = config.mcp_servers.len(),
            "Created ACP session"
        );

        let mut sessions = self.handler.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.insert(
            session_id.clone(),
            SessionSink::new(
                config.mcp_servers.iter().map(bridge_prefix).collect(),
                config.system_prompt,
            ),
        );
        Ok(session_id)
    }

    async fn cancel(&self, session_id: &str) -> Result<()> {
        self.conn
            .cancel(acp::CancelNotification::new(acp::SessionId::new(
                session_id.to_string(),
            )))
            .await
            .context("Failed to cancel ACP operation")?;
        Ok(())
    }
}

/// Run one prompt to completion and translate its outcome into a terminal event
async fn run_prompt(
    connection: Rc<AcpConnection>,
    session_id: String,
    generation: u64,
    text: String,
    timeout: Duration,
) {
    tracing::debug!(session_id = %session_id, generation, prompt_len = text.len(), "Sending prompt");

    let request = acp::PromptRequest::new(
        acp::SessionId::new(session_id.clone()),
        vec![acp::ContentBlock::Text(acp::TextContent::new(text))],
    );
    let result = tokio::time::timeout(timeout, connection.conn.prompt(request)).await;

    let handler = &connection.handler;
    handler.flush_tools(&session_id);

    let terminal = match result {
        Ok(Ok(response)) if matches!(response.stop_reason, acp::StopReason::Cancelled) => {
            AgentEvent::error(ErrorCode::Cancelled, "Prompt cancelled")
        }
        Ok(Ok(response)) => {
            tracing::debug!(session_id = %session_id, stop_reason = ?response.stop_reason, "Prompt completed");
            AgentEvent::Idle
        }
        Ok(Err(e)) => {
            tracing::error!(session_id = %session_id, error = %e, "Prompt failed");
            AgentEvent::error(ErrorCode::BackendError, format!("ACP prompt error: {}", e))
        }
        Err(_) => {
            tracing::error!(session_id = %session_id, timeout_secs = timeout.as_secs(), "Prompt timed out");
            AgentEvent::error(
                ErrorCode::Timeout,
                format!("ACP prompt timed out after {} seconds", timeout.as_secs()),
            )
        }
    };

    let current = handler
        .with_session(&session_id, |sink| sink.finish_prompt(generation))
        .unwrap_or(false);
    if current {
        handler.send_event(&session_id, terminal);
    } else {
        tracing::debug!(session_id = %session_id, generation, event = ?terminal, "Prompt outlived its subscriber, dropping terminal event");
    }
}

/// Run the ACP worker on a dedicated thread
fn run_worker(config: AcpConfig, mut cmd_rx: mpsc::Receiver<Command>) {
    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "Failed to create tokio runtime for ACP worker");
            return;
        }
    };

    rt.block_on(async {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let connection =
                    match AcpConnection::spawn(&config.working_dir, &config.binary, &config.extra_args)
                        .await
                    {
                        Ok(c) => Rc::new(c),
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to spawn ACP agent");
                            return;
                        }
                    };

                if let Err(e) = connection.initialize().await {
                    tracing::error!(error = %e, "Failed to initialize ACP connection");
                    return;
                }

                let timeout = Duration::from_secs(config.timeout_secs);
                tracing::info!("ACP worker started");

                while let Some(cmd) = cmd_rx.recv().await {
                    match cmd {
                        Command::CreateSession { config, reply } => {
                            let _ = reply.send(connection.new_session(config).await);
                        }
                        Command::Subscribe {
                            session_id,
                            event_tx,
                            reply,
                        } => {
                            let found = connection
                                .handler
                                .with_session(&session_id, |sink| sink.subscribe(event_tx));
                            let _ = reply.send(
                                found.ok_or_else(|| anyhow::anyhow!("Unknown session: {}", session_id)),
                            );
                        }
                        Command::Send {
                            session_id,
                            prompt,
                            reply,
                        } => {
                            let started = connection.handler.with_session(&session_id, |sink| {
                                (sink.start_prompt(), sink.system_prompt.take())
                            });
                            let Some((generation, system)) = started else {
                                let _ = reply
                                    .send(Err(anyhow::anyhow!("Unknown session: {}", session_id)));
                                continue;
                            };
                            let text = match system {
                                Some(system) => format!("<system>\n{}\n</system>\n\n{}", system, prompt),
                                None => prompt,
                            };
                            let _ = reply.send(Ok(()));
                            tokio::task::spawn_local(run_prompt(
                                Rc::clone(&connection),
                                session_id,
                                generation,
                                text,
                                timeout,
                            ));
                        }
                        Command::Abort { session_id, reply } => {
                            let _ = reply.send(connection.cancel(&session_id).await);
                        }
                        Command::CloseSession { session_id } => {
                            let mut sessions = connection
                                .handler
                                .sessions
                                .lock()
                                .unwrap_or_else(|e| e.into_inner());
                            sessions.remove(&session_id);
                            tracing::debug!(session_id = %session_id, "Released ACP session");
                        }
                        Command::ListModels { reply } => {
                            let models = config.models.iter().map(ModelInfo::new).collect();
                            let _ = reply.send(Ok(models));
                        }
                    }
                }

                tracing::info!("ACP worker shutting down");
            })
            .await;
    });
}

/// ACP backend implementation
pub struct AcpBackend {
    config: AcpConfig,
}

impl AcpBackend {
    /// Create a new ACP backend with the given config
    pub fn new(config: AcpConfig) -> Self {
        Self { config }
    }

    pub fn check_config(table: &serde_json::Value) -> Result<()> {
        AcpConfig::from_table(table).map(|_| ())
    }

    /// Create an AgentHandle that communicates with this backend
    pub fn into_handle(self) -> AgentHandle {
        let (tx, rx) = mpsc::channel::<Command>(32);
        let config = self.config;

        // The ACP connection is !Send, so it lives on its own thread
        thread::spawn(move || {
            run_worker(config, rx);
        });

        AgentHandle::new(tx, "acp")
    }

    /// Factory function for the registry
    pub fn factory() -> crate::registry::BackendFactory {
        Box::new(|table| {
            let config = AcpConfig::from_table(table)?;
            Ok(AcpBackend::new(config).into_handle())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bridge_prefix_uses_mcp_naming() {
        let server = McpServerConfig {
            name: "xcode".to_string(),
            url: "http://127.0.0.1:8080/mcp/abc".to_string(),
        };
        assert_eq!(bridge_prefix(&server), "mcp__xcode__");
    }

    #[test]
    fn test_acp_config_defaults() {
        let config: AcpConfig =
            serde_json::from_value(serde_json::json!({"binary": "claude-code-acp"})).unwrap();
        assert_eq!(config.timeout_secs, 1800);
        assert_eq!(config.models, vec!["default".to_string()]);
        assert!(config.extra_args.is_empty());
    }

    #[test]
    fn test_acp_table_checks() {
        assert!(AcpBackend::check_config(&serde_json::json!({"binary": "codex-acp"})).is_ok());
        assert!(AcpBackend::check_config(&serde_json::json!({})).is_err());
        assert!(AcpBackend::check_config(&serde_json::json!({"binary": "../agent"})).is_err());
        assert!(
            AcpBackend::check_config(&serde_json::json!({"binary": "a", "models": []})).is_err()
        );
        assert!(
            AcpBackend::check_config(&serde_json::json!({"binary": "a", "timeout_secs": 0}))
                .is_err()
        );
    }

    #[test]
    fn test_flush_tools_without_subscriber_clears_batch() {
        let handler = AcpClientHandler::new();
        let mut sink = SessionSink::new(vec![], None);
        sink.pending_tools = vec![ToolRequest::bridged("t1", "mcp__x__a", serde_json::json!({}))];
        sink.flush_scheduled = true;
        handler.sessions.lock().unwrap().insert("s1".to_string(), sink);

        handler.flush_tools("s1");

        let sessions = handler.sessions.lock().unwrap();
        let sink = sessions.get("s1").unwrap();
        assert!(sink.pending_tools.is_empty());
        assert!(!sink.flush_scheduled);
    }

    #[test]
    fn test_resubscribe_drops_output_of_cancelled_prompt() {
        let handler = AcpClientHandler::new();
        let (old_tx, mut old_rx) = mpsc::channel(8);
        let (new_tx, mut new_rx) = mpsc::channel(8);

        let old_generation = {
            let mut sink = SessionSink::new(vec![], None);
            sink.subscribe(old_tx);
            let generation = sink.start_prompt();
            handler.sessions.lock().unwrap().insert("s1".to_string(), sink);
            generation
        };
        handler.send_event("s1", AgentEvent::TextDelta("first".to_string()));
        assert_eq!(old_rx.try_recv().unwrap(), AgentEvent::TextDelta("first".to_string()));

        // Follow-up exchange subscribes before the cancelled prompt settles
        handler.with_session("s1", |sink| sink.subscribe(new_tx));
        handler.send_event("s1", AgentEvent::TextDelta("late".to_string()));
        let current = handler
            .with_session("s1", |sink| sink.finish_prompt(old_generation))
            .unwrap();
        assert!(!current);
        assert!(new_rx.try_recv().is_err());

        // The new prompt's output flows again
        let next = handler.with_session("s1", |sink| sink.start_prompt()).unwrap();
        assert_ne!(next, old_generation);
        handler.send_event("s1", AgentEvent::Idle);
        assert_eq!(new_rx.try_recv().unwrap(), AgentEvent::Idle);
        assert!(handler.with_session("s1", |sink| sink.finish_prompt(next)).unwrap());
    }

    #[test]
    fn test_finish_prompt_keeps_newer_prompt_running() {
        let mut sink = SessionSink::new(vec![], None);
        let (tx, _rx) = mpsc::channel(1);
        sink.subscribe(tx.clone());
        let first = sink.start_prompt();
        sink.subscribe(tx);
        let second = sink.start_prompt();

        assert!(!sink.finish_prompt(first));
        assert_eq!(sink.running, Some(second));
        assert!(!sink.is_draining());
    }
}
