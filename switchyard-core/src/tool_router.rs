// ABOUTME: Pairs tool calls the agent announced with tool invocations arriving on the MCP bridge.
// ABOUTME: FIFO per tool name; pending invocations wait for the client's result or a timeout.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Default time a bridged tool invocation waits for the client's result
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(300);

/// Why every outstanding call was rejected at once
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    SessionEnded,
    SessionCleanup,
    ClientDisconnected,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RejectReason::SessionEnded => "session ended",
            RejectReason::SessionCleanup => "session cleanup",
            RejectReason::ClientDisconnected => "client disconnected",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouterError {
    #[error("no expected call for tool '{0}'")]
    NoExpectedCall(String),
    #[error("tool call {call_id} timed out after {secs}s")]
    Timeout { call_id: String, secs: u64 },
    #[error("{0}")]
    Rejected(RejectReason),
    #[error("tool call completion dropped")]
    CompletionDropped,
}

/// What `resolve` did with a result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveOutcome {
    /// A waiting invocation received the result
    Delivered,
    /// The id was still only expected; it was removed so later calls stay aligned
    Unmatched,
    /// The router had never heard of the id
    NotFound,
}

impl ResolveOutcome {
    pub fn is_handled(self) -> bool {
        !matches!(self, ResolveOutcome::NotFound)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResolveOutcome::Delivered => "delivered",
            ResolveOutcome::Unmatched => "unmatched",
            ResolveOutcome::NotFound => "not_found",
        }
    }
}

type Completion = oneshot::Sender<Result<String, RouterError>>;

struct PendingEntry {
    name: String,
    completion: Completion,
    timer: JoinHandle<()>,
}

#[derive(Default)]
struct RouterInner {
    /// Announced call ids per tool name, oldest first. Empty queues are removed.
    expected: HashMap<String, VecDeque<String>>,
    pending: HashMap<String, PendingEntry>,
}

/// An MCP invocation bound to a call id, waiting for its result
#[derive(Debug)]
pub struct PendingCall {
    call_id: String,
    name: String,
    rx: oneshot::Receiver<Result<String, RouterError>>,
}

impl PendingCall {
    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the client's result, a rejection, or the timeout
    pub async fn wait(self) -> Result<String, RouterError> {
        self.rx.await.unwrap_or(Err(RouterError::CompletionDropped))
    }
}

#[derive(Clone)]
pub struct ToolRouter {
    inner: Arc<Mutex<RouterInner>>,
    timeout: Duration,
}

impl ToolRouter {
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RouterInner::default())),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Record that the agent announced `call_id` for `name`
    pub fn register_expected(&self, call_id: &str, name: &str) {
        tracing::debug!(call_id = %call_id, tool = %name, "Tool call expected");
        self.lock()
            .expected
            .entry(name.to_string())
            .or_default()
            .push_back(call_id.to_string());
    }

    /// Bind an MCP invocation of `name` to the oldest announced call id.
    ///
    /// Fails immediately when nothing was announced under that name.
    /// Must be called inside a tokio runtime; the timeout runs as a task.
    pub fn register_incoming(&self, name: &str) -> Result<PendingCall, RouterError> {
        let mut inner = self.lock();
        let call_id = match inner.expected.get_mut(name) {
            Some(queue) => {
                let id = queue.pop_front();
                if queue.is_empty() {
                    inner.expected.remove(name);
                }
                id
            }
            None => None,
        };
        let Some(call_id) = call_id else {
            tracing::warn!(tool = %name, "Tool invoked on bridge without a matching announced call");
            return Err(RouterError::NoExpectedCall(name.to_string()));
        };

        let (tx, rx) = oneshot::channel();
        let timer = tokio::spawn(expire_after(
            Arc::downgrade(&self.inner),
            call_id.clone(),
            self.timeout,
        ));
        inner.pending.insert(
            call_id.clone(),
            PendingEntry {
                name: name.to_string(),
                completion: tx,
                timer,
            },
        );
        tracing::debug!(call_id = %call_id, tool = %name, "Tool call pending");

        Ok(PendingCall {
            call_id,
            name: name.to_string(),
            rx,
        })
    }

    /// Deliver the client's result for `call_id`
    pub fn resolve(&self, call_id: &str, result: String) -> ResolveOutcome {
        let mut inner = self.lock();
        if let Some(entry) = inner.pending.remove(call_id) {
            entry.timer.abort();
            let _ = entry.completion.send(Ok(result));
            tracing::debug!(call_id = %call_id, tool = %entry.name, "Tool result delivered");
            return ResolveOutcome::Delivered;
        }

        let found = inner.expected.iter_mut().find_map(|(name, queue)| {
            let pos = queue.iter().position(|id| id == call_id)?;
            queue.remove(pos);
            Some((name.clone(), queue.is_empty()))
        });
        match found {
            Some((name, now_empty)) => {
                if now_empty {
                    inner.expected.remove(&name);
                }
                tracing::warn!(call_id = %call_id, tool = %name, "Tool result arrived before the agent invoked the tool");
                ResolveOutcome::Unmatched
            }
            None => {
                tracing::warn!(call_id = %call_id, "Tool result for unknown call id");
                ResolveOutcome::NotFound
            }
        }
    }

    /// Reject every pending call and forget every expected one. Returns how
    /// many waiters were rejected.
    pub fn reject_all(&self, reason: RejectReason) -> usize {
        let (pending, expected) = {
            let mut inner = self.lock();
            (
                std::mem::take(&mut inner.pending),
                std::mem::take(&mut inner.expected),
            )
        };
        let count = pending.len();
        for (call_id, entry) in pending {
            entry.timer.abort();
            tracing::debug!(call_id = %call_id, tool = %entry.name, reason = %reason, "Tool call rejected");
            let _ = entry.completion.send(Err(RouterError::Rejected(reason)));
        }
        if count > 0 || !expected.is_empty() {
            tracing::info!(
                rejected = count,
                expected_dropped = expected.values().map(VecDeque::len).sum::<usize>(),
                reason = %reason,
                "Tool router cleared"
            );
        }
        count
    }

    /// True while any call is expected or pending
    pub fn has_pending(&self) -> bool {
        let inner = self.lock();
        !inner.expected.is_empty() || !inner.pending.is_empty()
    }

    /// True if `call_id` is expected or pending here
    pub fn has_call(&self, call_id: &str) -> bool {
        let inner = self.lock();
        inner.pending.contains_key(call_id)
            || inner
                .expected
                .values()
                .any(|queue| queue.iter().any(|id| id == call_id))
    }

    pub fn expected_count(&self, name: &str) -> usize {
        self.lock().expected.get(name).map(VecDeque::len).unwrap_or(0)
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    fn lock(&self) -> MutexGuard<'_, RouterInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for ToolRouter {
    fn default() -> Self {
        Self::new(DEFAULT_TOOL_TIMEOUT)
    }
}

async fn expire_after(inner: Weak<Mutex<RouterInner>>, call_id: String, timeout: Duration) {
    tokio::time::sleep(timeout).await;
    let Some(inner) = inner.upgrade() else {
        return;
    };
    let entry = inner
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .pending
        .remove(&call_id);
    if let Some(entry) = entry {
        tracing::warn!(call_id = %call_id, tool = %entry.name, "Tool call timed out waiting for client result");
        let _ = entry.completion.send(Err(RouterError::Timeout {
            call_id,
            secs: timeout.as_secs(),
        }));
    }
}
