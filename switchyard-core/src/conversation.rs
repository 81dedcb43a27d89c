// ABOUTME: Conversations map a client chat onto one backend session plus its bridge state.
// ABOUTME: The manager picks which conversation serves a request: continuation, reuse, or isolation.

use crate::bridge::{BridgeSettings, ToolBridgeState};
use crate::message::{ChatMessage, trailing_tool_results};
use crate::metrics;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use switchyard_agent::SessionHandle;
use tokio_util::sync::CancellationToken;

pub struct Conversation {
    id: String,
    is_primary: bool,
    bridge: ToolBridgeState,
    session: Mutex<Option<SessionHandle>>,
    sent_message_count: AtomicUsize,
    model: Mutex<Option<String>>,
    turn: Mutex<Option<CancellationToken>>,
}

impl Conversation {
    pub fn new(id: impl Into<String>, is_primary: bool, settings: &BridgeSettings) -> Self {
        Self {
            id: id.into(),
            is_primary,
            bridge: ToolBridgeState::new(settings),
            session: Mutex::new(None),
            sent_message_count: AtomicUsize::new(0),
            model: Mutex::new(None),
            turn: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_primary(&self) -> bool {
        self.is_primary
    }

    pub fn bridge(&self) -> &ToolBridgeState {
        &self.bridge
    }

    pub fn is_active(&self) -> bool {
        self.bridge.lifecycle().is_active()
    }

    pub fn session(&self) -> Option<SessionHandle> {
        lock(&self.session).clone()
    }

    pub fn has_session(&self) -> bool {
        lock(&self.session).is_some()
    }

    pub fn set_session(&self, session: SessionHandle) {
        *lock(&self.session) = Some(session);
    }

    pub fn take_session(&self) -> Option<SessionHandle> {
        lock(&self.session).take()
    }

    /// Number of history messages the backend session already has
    pub fn sent_message_count(&self) -> usize {
        self.sent_message_count.load(Ordering::SeqCst)
    }

    /// Raise the sent count to `count`. Never lowers it.
    pub fn record_sent(&self, count: usize) {
        self.sent_message_count.fetch_max(count, Ordering::SeqCst);
    }

    pub fn model(&self) -> Option<String> {
        lock(&self.model).clone()
    }

    pub fn set_model(&self, model: &str) {
        *lock(&self.model) = Some(model.to_string());
    }

    /// Install the cancellation token of the streaming task now driving
    /// this conversation
    pub fn start_turn(&self) -> CancellationToken {
        let token = CancellationToken::new();
        if let Some(previous) = lock(&self.turn).replace(token.clone()) {
            previous.cancel();
        }
        token
    }

    /// Stop the streaming task, if one is running
    pub fn cancel_turn(&self) {
        if let Some(token) = lock(&self.turn).take() {
            token.cancel();
        }
    }

    /// Reject everything outstanding, stop streaming, release the session
    pub fn cleanup(&self) {
        self.bridge.lifecycle().cleanup();
        self.cancel_turn();
        if let Some(transport) = self.bridge.reply().detach() {
            tracing::debug!(conversation_id = %self.id, transport_id = transport.id(), "Dropping transport on cleanup");
        }
        self.bridge.reply().signal_done();
        if let Some(session) = self.take_session() {
            session.close();
        }
    }
}

impl std::fmt::Debug for Conversation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conversation")
            .field("id", &self.id)
            .field("is_primary", &self.is_primary)
            .field("active", &self.is_active())
            .field("sent_message_count", &self.sent_message_count())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Which conversation a fresh top-level request landed on
#[derive(Debug, Clone)]
pub struct NewRequestMatch {
    pub conversation: Arc<Conversation>,
    /// True when an idle primary is being reused
    pub is_reuse: bool,
}

#[derive(Default)]
struct ManagerInner {
    conversations: HashMap<String, Arc<Conversation>>,
    primary_id: Option<String>,
}

impl ManagerInner {
    fn primary(&self) -> Option<&Arc<Conversation>> {
        self.primary_id
            .as_ref()
            .and_then(|id| self.conversations.get(id))
    }
}

#[derive(Clone)]
pub struct ConversationManager {
    inner: Arc<Mutex<ManagerInner>>,
    settings: BridgeSettings,
}

impl ConversationManager {
    pub fn new(settings: BridgeSettings) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ManagerInner::default())),
            settings,
        }
    }

    pub fn settings(&self) -> &BridgeSettings {
        &self.settings
    }

    /// Create and register a conversation. Creating a primary replaces any
    /// existing primary, which is cleaned up.
    pub fn create(&self, is_primary: bool) -> Arc<Conversation> {
        let (conversation, displaced) = {
            let mut inner = self.lock();
            let displaced = if is_primary {
                inner
                    .primary_id
                    .take()
                    .and_then(|id| inner.conversations.remove(&id))
            } else {
                None
            };
            (self.create_locked(&mut inner, is_primary), displaced)
        };
        if let Some(old) = displaced {
            tracing::info!(conversation_id = %old.id(), "Primary conversation displaced");
            old.cleanup();
        }
        conversation
    }

    fn create_locked(&self, inner: &mut ManagerInner, is_primary: bool) -> Arc<Conversation> {
        let id = uuid::Uuid::new_v4().to_string();
        let conversation = Arc::new(Conversation::new(id.clone(), is_primary, &self.settings));

        if is_primary {
            inner.primary_id = Some(id.clone());
        } else {
            let weak: Weak<Mutex<ManagerInner>> = Arc::downgrade(&self.inner);
            let conversation_id = id.clone();
            conversation
                .bridge()
                .lifecycle()
                .set_on_end(move || evict_isolated(weak, &conversation_id));
        }
        inner.conversations.insert(id.clone(), Arc::clone(&conversation));
        metrics::record_conversation(if is_primary { "created" } else { "isolated" });
        metrics::set_active_conversations(inner.conversations.len() as u64);
        tracing::info!(conversation_id = %id, is_primary, "Conversation created");
        conversation
    }

    /// Pick the conversation for a request that is not a tool continuation.
    ///
    /// An idle primary that already has a session is reused and marked
    /// active before the manager lock is released, so a concurrent request
    /// sees it busy. Idle isolated conversations are evicted. A busy or
    /// session-less primary
    /// sends the request to a fresh isolated conversation. With no primary,
    /// a primary is created.
    pub fn find_for_new_request(&self) -> NewRequestMatch {
        let mut inner = self.lock();
        let reusable = inner
            .primary()
            .map(|p| (Arc::clone(p), !p.is_active() && p.has_session()));

        match reusable {
            Some((primary, true)) => {
                let idle: Vec<String> = inner
                    .conversations
                    .iter()
                    .filter(|(_, c)| !c.is_primary() && !c.is_active())
                    .map(|(id, _)| id.clone())
                    .collect();
                let evicted: Vec<Arc<Conversation>> = idle
                    .iter()
                    .filter_map(|id| inner.conversations.remove(id))
                    .collect();
                primary.bridge().lifecycle().mark_active();
                metrics::set_active_conversations(inner.conversations.len() as u64);
                drop(inner);

                for conversation in evicted {
                    tracing::info!(conversation_id = %conversation.id(), "Evicting idle isolated conversation");
                    metrics::record_conversation("removed");
                    conversation.cleanup();
                }
                metrics::record_conversation("reused");
                tracing::info!(conversation_id = %primary.id(), "Reusing primary conversation");
                NewRequestMatch {
                    conversation: primary,
                    is_reuse: true,
                }
            }
            Some((primary, false)) => {
                tracing::info!(conversation_id = %primary.id(), "Primary busy, isolating request");
                NewRequestMatch {
                    conversation: self.create_locked(&mut inner, false),
                    is_reuse: false,
                }
            }
            None => NewRequestMatch {
                conversation: self.create_locked(&mut inner, true),
                is_reuse: false,
            },
        }
    }

    /// Find the conversation a tool-result request continues.
    ///
    /// None unless the history ends in client-authored tool results. A
    /// conversation whose router knows any of those call ids wins; otherwise
    /// any conversation with an active session is taken.
    pub fn find_by_continuation(&self, messages: &[ChatMessage]) -> Option<Arc<Conversation>> {
        let results = trailing_tool_results(messages);
        if results.is_empty() {
            return None;
        }

        let inner = self.lock();
        let by_call = inner.conversations.values().find(|c| {
            results
                .iter()
                .any(|(call_id, _)| c.bridge().router().has_call(call_id))
        });
        if let Some(found) = by_call {
            return Some(Arc::clone(found));
        }

        let fallback = inner.conversations.values().find(|c| c.is_active()).cloned();
        if let Some(found) = &fallback {
            tracing::warn!(conversation_id = %found.id(), "Tool results match no known call, using an active conversation");
        }
        fallback
    }

    pub fn get(&self, id: &str) -> Option<Arc<Conversation>> {
        self.lock().conversations.get(id).cloned()
    }

    pub fn primary(&self) -> Option<Arc<Conversation>> {
        self.lock().primary().cloned()
    }

    /// Remove the primary and clean it up
    pub fn clear_primary(&self) {
        let removed = {
            let mut inner = self.lock();
            let removed = inner
                .primary_id
                .take()
                .and_then(|id| inner.conversations.remove(&id));
            metrics::set_active_conversations(inner.conversations.len() as u64);
            removed
        };
        if let Some(conversation) = removed {
            tracing::info!(conversation_id = %conversation.id(), "Primary conversation cleared");
            metrics::record_conversation("removed");
            conversation.cleanup();
        }
    }

    /// Remove a conversation and clean it up
    pub fn remove(&self, id: &str) {
        let removed = {
            let mut inner = self.lock();
            if inner.primary_id.as_deref() == Some(id) {
                inner.primary_id = None;
            }
            let removed = inner.conversations.remove(id);
            metrics::set_active_conversations(inner.conversations.len() as u64);
            removed
        };
        if let Some(conversation) = removed {
            tracing::info!(conversation_id = %id, "Conversation removed");
            metrics::record_conversation("removed");
            conversation.cleanup();
        }
    }

    /// Clean up every conversation
    pub fn shutdown(&self) {
        let all: Vec<Arc<Conversation>> = {
            let mut inner = self.lock();
            inner.primary_id = None;
            inner.conversations.drain().map(|(_, c)| c).collect()
        };
        metrics::set_active_conversations(0);
        if !all.is_empty() {
            tracing::info!(count = all.len(), "Cleaning up conversations");
        }
        for conversation in all {
            conversation.cleanup();
        }
    }

    pub fn len(&self) -> usize {
        self.lock().conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, ManagerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// End callback of an isolated conversation: drop it from the manager.
/// Runs after the lifecycle has already rejected outstanding calls.
fn evict_isolated(manager: Weak<Mutex<ManagerInner>>, conversation_id: &str) {
    let Some(inner) = manager.upgrade() else {
        return;
    };
    let removed = {
        let mut inner = inner.lock().unwrap_or_else(|e| e.into_inner());
        let removed = inner.conversations.remove(conversation_id);
        metrics::set_active_conversations(inner.conversations.len() as u64);
        removed
    };
    if let Some(conversation) = removed {
        tracing::info!(conversation_id = %conversation_id, "Isolated conversation finished");
        metrics::record_conversation("removed");
        if let Some(session) = conversation.take_session() {
            session.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchyard_agent::backends::mock::MockBackend;
    use switchyard_agent::SessionConfig;

    async fn session() -> SessionHandle {
        MockBackend::new()
            .into_handle()
            .create_session(SessionConfig::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_first_request_creates_primary() {
        let manager = ConversationManager::new(BridgeSettings::default());
        let found = manager.find_for_new_request();
        assert!(!found.is_reuse);
        assert!(found.conversation.is_primary());
        assert_eq!(manager.primary().unwrap().id(), found.conversation.id());
    }

    #[tokio::test]
    async fn test_idle_primary_with_session_is_reused() {
        let manager = ConversationManager::new(BridgeSettings::default());
        let primary = manager.find_for_new_request().conversation;
        primary.set_session(session().await);

        let found = manager.find_for_new_request();
        assert!(found.is_reuse);
        assert_eq!(found.conversation.id(), primary.id());
    }

    #[tokio::test]
    async fn test_reuse_claims_primary_for_one_request() {
        let manager = ConversationManager::new(BridgeSettings::default());
        let primary = manager.find_for_new_request().conversation;
        primary.set_session(session().await);

        let winner = manager.find_for_new_request();
        assert!(winner.is_reuse);
        assert!(primary.is_active());

        let other = manager.find_for_new_request();
        assert!(!other.is_reuse);
        assert!(!other.conversation.is_primary());
    }

    #[tokio::test]
    async fn test_sessionless_primary_isolates() {
        let manager = ConversationManager::new(BridgeSettings::default());
        let primary = manager.find_for_new_request().conversation;
        let found = manager.find_for_new_request();
        assert!(!found.is_reuse);
        assert!(!found.conversation.is_primary());
        assert_ne!(found.conversation.id(), primary.id());
    }

    #[tokio::test]
    async fn test_busy_primary_isolates_and_isolated_evicts_on_end() {
        let manager = ConversationManager::new(BridgeSettings::default());
        let primary = manager.find_for_new_request().conversation;
        primary.set_session(session().await);
        primary.bridge().lifecycle().mark_active();

        let isolated = manager.find_for_new_request().conversation;
        assert!(!isolated.is_primary());
        assert_eq!(manager.len(), 2);

        isolated.bridge().lifecycle().mark_active();
        isolated.bridge().lifecycle().mark_inactive();
        assert!(manager.get(isolated.id()).is_none());
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test]
    async fn test_reuse_evicts_idle_isolated() {
        let manager = ConversationManager::new(BridgeSettings::default());
        let primary = manager.find_for_new_request().conversation;
        primary.set_session(session().await);
        primary.bridge().lifecycle().mark_active();
        let isolated = manager.find_for_new_request().conversation;
        primary.bridge().lifecycle().mark_inactive();

        let found = manager.find_for_new_request();
        assert!(found.is_reuse);
        assert!(manager.get(isolated.id()).is_none());
    }

    #[tokio::test]
    async fn test_continuation_none_for_plain_history() {
        let manager = ConversationManager::new(BridgeSettings::default());
        let conv = manager.find_for_new_request().conversation;
        conv.bridge().lifecycle().mark_active();

        assert!(manager.find_by_continuation(&[]).is_none());
        assert!(manager
            .find_by_continuation(&[ChatMessage::user("hi")])
            .is_none());
        let assistant_last = vec![
            ChatMessage::tool_result("c1", "r"),
            ChatMessage::assistant("done"),
        ];
        assert!(manager.find_by_continuation(&assistant_last).is_none());
    }

    #[tokio::test]
    async fn test_continuation_matches_by_call_id() {
        let manager = ConversationManager::new(BridgeSettings::default());
        let primary = manager.find_for_new_request().conversation;
        primary.set_session(session().await);
        primary.bridge().lifecycle().mark_active();
        let isolated = manager.find_for_new_request().conversation;
        isolated.bridge().router().register_expected("c9", "search");

        let found = manager
            .find_by_continuation(&[ChatMessage::tool_result("c9", "ok")])
            .unwrap();
        assert_eq!(found.id(), isolated.id());
    }

    #[tokio::test]
    async fn test_continuation_falls_back_to_active() {
        let manager = ConversationManager::new(BridgeSettings::default());
        let conv = manager.find_for_new_request().conversation;
        assert!(manager
            .find_by_continuation(&[ChatMessage::tool_result("zz", "ok")])
            .is_none());
        conv.bridge().lifecycle().mark_active();
        let found = manager
            .find_by_continuation(&[ChatMessage::tool_result("zz", "ok")])
            .unwrap();
        assert_eq!(found.id(), conv.id());
    }

    #[tokio::test]
    async fn test_clear_primary_rejects_pending() {
        let manager = ConversationManager::new(BridgeSettings::default());
        let primary = manager.find_for_new_request().conversation;
        primary.bridge().router().register_expected("c1", "search");
        let pending = primary.bridge().router().register_incoming("search").unwrap();

        manager.clear_primary();
        assert!(manager.primary().is_none());
        assert!(manager.is_empty());
        assert_eq!(pending.wait().await.unwrap_err().to_string(), "session cleanup");
    }

    #[tokio::test]
    async fn test_record_sent_is_monotonic() {
        let conv = Conversation::new("c", true, &BridgeSettings::default());
        conv.record_sent(4);
        conv.record_sent(2);
        assert_eq!(conv.sent_message_count(), 4);
    }

    #[tokio::test]
    async fn test_at_most_one_primary() {
        let manager = ConversationManager::new(BridgeSettings::default());
        let first = manager.create(true);
        let second = manager.create(true);
        assert_eq!(manager.primary().unwrap().id(), second.id());
        assert!(manager.get(first.id()).is_none());
    }
}
