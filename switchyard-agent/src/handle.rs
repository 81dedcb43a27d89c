// ABOUTME: AgentHandle and SessionHandle provide Send+Sync access to a backend worker.
// ABOUTME: Every operation is a command over a channel with a oneshot reply.

use crate::config::SessionConfig;
use crate::model::ModelInfo;
use crate::AgentEvent;
use anyhow::Result;
use tokio::sync::{mpsc, oneshot};

/// Capacity of the per-subscription event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 2048;

/// Commands sent from handles to the backend worker
#[derive(Debug)]
pub enum Command {
    CreateSession {
        config: SessionConfig,
        reply: oneshot::Sender<Result<String>>,
    },
    Send {
        session_id: String,
        prompt: String,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Replace the session's event sink. The previous subscriber, if any,
    /// stops receiving events.
    Subscribe {
        session_id: String,
        event_tx: mpsc::Sender<AgentEvent>,
        reply: oneshot::Sender<Result<()>>,
    },
    Abort {
        session_id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    CloseSession {
        session_id: String,
    },
    ListModels {
        reply: oneshot::Sender<Result<Vec<ModelInfo>>>,
    },
}

/// Send + Sync handle to a backend.
///
/// Internally communicates with a worker task that runs the actual backend,
/// so backends with `!Send` internals (like ACP) can be used from any task.
#[derive(Clone)]
pub struct AgentHandle {
    tx: mpsc::Sender<Command>,
    name: &'static str,
}

impl AgentHandle {
    /// Create a new AgentHandle with the given command channel and backend name
    pub fn new(tx: mpsc::Sender<Command>, name: &'static str) -> Self {
        Self { tx, name }
    }

    /// Get the backend name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Create a new backend session
    pub async fn create_session(&self, config: SessionConfig) -> Result<SessionHandle> {
        let session_id = request(&self.tx, |reply| Command::CreateSession { config, reply }).await?;
        Ok(SessionHandle {
            id: session_id,
            tx: self.tx.clone(),
        })
    }

    /// List the models the backend can serve
    pub async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        request(&self.tx, |reply| Command::ListModels { reply }).await
    }
}

impl std::fmt::Debug for AgentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentHandle")
            .field("name", &self.name)
            .finish()
    }
}

/// Handle to one backend session.
#[derive(Clone)]
pub struct SessionHandle {
    id: String,
    tx: mpsc::Sender<Command>,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Send a prompt. Returns once the backend has accepted it; output arrives
    /// on the subscribed EventReceiver.
    pub async fn send(&self, prompt: &str) -> Result<()> {
        let session_id = self.id.clone();
        let prompt = prompt.to_string();
        request(&self.tx, |reply| Command::Send {
            session_id,
            prompt,
            reply,
        })
        .await
    }

    /// Subscribe to the session's events. Dropping the receiver unsubscribes.
    pub async fn subscribe(&self) -> Result<EventReceiver> {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let session_id = self.id.clone();
        request(&self.tx, |reply| Command::Subscribe {
            session_id,
            event_tx,
            reply,
        })
        .await?;
        Ok(EventReceiver::new(event_rx))
    }

    /// Abort whatever the session is currently doing
    pub async fn abort(&self) -> Result<()> {
        let session_id = self.id.clone();
        request(&self.tx, |reply| Command::Abort { session_id, reply }).await
    }

    /// Release the session on the backend. Best effort.
    pub fn close(&self) {
        let command = Command::CloseSession {
            session_id: self.id.clone(),
        };
        if self.tx.try_send(command).is_err() {
            tracing::debug!(session_id = %self.id, "Backend worker gone, session not closed");
        }
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle").field("id", &self.id).finish()
    }
}

async fn request<T>(
    tx: &mpsc::Sender<Command>,
    build: impl FnOnce(oneshot::Sender<Result<T>>) -> Command,
) -> Result<T> {
    let (reply_tx, reply_rx) = oneshot::channel();
    tx.send(build(reply_tx))
        .await
        .map_err(|_| anyhow::anyhow!("Backend worker closed"))?;
    reply_rx
        .await
        .map_err(|_| anyhow::anyhow!("Backend worker dropped reply channel"))?
}

/// Receiver for streaming events from a session subscription.
///
/// This is `Send` so it can be passed across async task boundaries.
pub struct EventReceiver {
    rx: mpsc::Receiver<AgentEvent>,
}

impl EventReceiver {
    /// Create a new EventReceiver wrapping the given channel
    pub fn new(rx: mpsc::Receiver<AgentEvent>) -> Self {
        Self { rx }
    }

    /// Receive the next event, or None if the stream is closed
    pub async fn recv(&mut self) -> Option<AgentEvent> {
        self.rx.recv().await
    }
}
