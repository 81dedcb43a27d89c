// ABOUTME: Active/errored flags for a conversation's backend session.
// ABOUTME: Ending a session rejects outstanding tool calls and fires the end callback once.

use crate::tool_router::{RejectReason, ToolRouter};
use std::sync::{Mutex, MutexGuard};

type EndCallback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct LifecycleState {
    active: bool,
    errored: bool,
    on_end: Option<EndCallback>,
}

pub struct SessionLifecycle {
    router: ToolRouter,
    state: Mutex<LifecycleState>,
}

impl SessionLifecycle {
    pub fn new(router: ToolRouter) -> Self {
        Self {
            router,
            state: Mutex::new(LifecycleState::default()),
        }
    }

    pub fn is_active(&self) -> bool {
        self.lock().active
    }

    pub fn is_errored(&self) -> bool {
        self.lock().errored
    }

    pub fn mark_active(&self) {
        self.lock().active = true;
    }

    /// Sticky for the life of the conversation
    pub fn mark_errored(&self) {
        self.lock().errored = true;
    }

    /// Register the callback fired when the session ends. Replaces any
    /// callback that has not fired yet.
    pub fn set_on_end(&self, callback: impl FnOnce() + Send + 'static) {
        self.lock().on_end = Some(Box::new(callback));
    }

    /// The backend went idle or failed
    pub fn mark_inactive(&self) {
        self.finish(RejectReason::SessionEnded);
    }

    /// Tear down on conversation removal. Safe to call more than once.
    pub fn cleanup(&self) {
        self.finish(RejectReason::SessionCleanup);
    }

    /// Tear down with an explicit rejection reason
    pub fn cleanup_with(&self, reason: RejectReason) {
        self.finish(reason);
    }

    fn finish(&self, reason: RejectReason) {
        let callback = {
            let mut state = self.lock();
            state.active = false;
            state.on_end.take()
        };
        self.router.reject_all(reason);
        // The callback may take the conversation manager's lock.
        if let Some(callback) = callback {
            callback();
        }
    }

    fn lock(&self) -> MutexGuard<'_, LifecycleState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for SessionLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("SessionLifecycle")
            .field("active", &state.active)
            .field("errored", &state.errored)
            .field("has_on_end", &state.on_end.is_some())
            .finish()
    }
}
