// ABOUTME: The client connection a conversation is currently streaming to, plus the done signal.
// ABOUTME: A Transport is the write half of one HTTP streaming response.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::{CancellationToken, DropGuard};

static NEXT_TRANSPORT_ID: AtomicU64 = AtomicU64::new(1);

/// One server-sent event as the dialect renderers produce it
#[derive(Debug, Clone, PartialEq)]
pub enum WireFrame {
    /// `event: <name>` (when present) followed by `data: <json>`
    Event { event: Option<String>, data: Value },
    /// OpenAI's literal `data: [DONE]` terminator
    Done,
}

impl WireFrame {
    pub fn data(data: Value) -> Self {
        WireFrame::Event { event: None, data }
    }

    pub fn named(event: &str, data: Value) -> Self {
        WireFrame::Event {
            event: Some(event.to_string()),
            data,
        }
    }
}

/// Write half of a streaming response.
///
/// Dropping the Transport ends the response stream. The paired
/// [`TransportStream`] cancels `closed` when the HTTP layer drops it, which
/// is how client disconnects are observed.
#[derive(Debug)]
pub struct Transport {
    id: u64,
    tx: mpsc::UnboundedSender<WireFrame>,
    closed: CancellationToken,
    frames_sent: AtomicUsize,
}

impl Transport {
    pub fn channel() -> (Transport, TransportStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();
        let transport = Transport {
            id: NEXT_TRANSPORT_ID.fetch_add(1, Ordering::Relaxed),
            tx,
            closed: closed.clone(),
            frames_sent: AtomicUsize::new(0),
        };
        let stream = TransportStream {
            rx,
            _guard: closed.drop_guard(),
        };
        (transport, stream)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queue a frame. Returns false once the client side is gone.
    pub fn send(&self, frame: WireFrame) -> bool {
        let ok = self.tx.send(frame).is_ok();
        if ok {
            self.frames_sent.fetch_add(1, Ordering::Relaxed);
        }
        ok
    }

    pub fn frames_sent(&self) -> usize {
        self.frames_sent.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Token cancelled when the read half is dropped
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }
}

/// Read half of a streaming response, held by the HTTP body
#[derive(Debug)]
pub struct TransportStream {
    rx: mpsc::UnboundedReceiver<WireFrame>,
    _guard: DropGuard,
}

impl TransportStream {
    /// Next frame, or None once the Transport has been dropped
    pub async fn recv(&mut self) -> Option<WireFrame> {
        self.rx.recv().await
    }

    /// Drain everything that is already queued
    pub fn drain(&mut self) -> Vec<WireFrame> {
        std::iter::from_fn(|| self.rx.try_recv().ok()).collect()
    }
}

/// Resolves when the current exchange is over
#[derive(Debug)]
pub struct DoneSignal {
    rx: oneshot::Receiver<()>,
}

impl DoneSignal {
    pub async fn wait(self) {
        let _ = self.rx.await;
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ReplyError {
    #[error("an exchange is already waiting on this conversation")]
    AlreadyWaiting,
}

#[derive(Default)]
struct ReplyState {
    current: Option<Transport>,
    done: Option<oneshot::Sender<()>>,
}

#[derive(Default)]
pub struct ReplyTracker {
    state: Mutex<ReplyState>,
}

impl ReplyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `transport` the current one. A previously attached transport is
    /// returned; dropping it ends that response.
    pub fn attach(&self, transport: Transport) -> Option<Transport> {
        let previous = self.lock().current.replace(transport);
        if let Some(prev) = &previous {
            tracing::debug!(transport_id = prev.id(), "Replacing attached transport");
        }
        previous
    }

    pub fn detach(&self) -> Option<Transport> {
        self.lock().current.take()
    }

    /// Detach only if `id` is still the attached transport
    pub fn detach_if(&self, id: u64) -> Option<Transport> {
        let mut state = self.lock();
        match &state.current {
            Some(t) if t.id() == id => state.current.take(),
            _ => None,
        }
    }

    pub fn is_attached(&self) -> bool {
        self.lock().current.is_some()
    }

    pub fn current_id(&self) -> Option<u64> {
        self.lock().current.as_ref().map(Transport::id)
    }

    /// Run `f` against the attached transport, if any
    pub fn with_transport<R>(&self, f: impl FnOnce(&Transport) -> R) -> Option<R> {
        self.lock().current.as_ref().map(f)
    }

    /// Arm a fresh done signal for the exchange that is starting
    pub fn wait_until_done(&self) -> Result<DoneSignal, ReplyError> {
        let mut state = self.lock();
        if state.done.as_ref().is_some_and(|tx| !tx.is_closed()) {
            return Err(ReplyError::AlreadyWaiting);
        }
        let (tx, rx) = oneshot::channel();
        state.done = Some(tx);
        Ok(DoneSignal { rx })
    }

    /// Fire the done signal. Returns false if nothing was waiting.
    pub fn signal_done(&self) -> bool {
        match self.lock().done.take() {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ReplyState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
