//! In-memory session store.
//!
//! One [`Session`] per live client connection, keyed by connection id.
//! The store is an injected object (passed into the protocol server and
//! the sweep task) rather than process-global state, so the core stays
//! testable. Sessions die with their connection or after the idle
//! threshold, whichever comes first.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::router::SubscriptionPlan;

/// Hard cap on per-session history. Oldest messages are dropped first.
pub const MAX_SESSION_MESSAGES: usize = 100;

/// How the session's provider credential is sourced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyMode {
    /// The end user's own secret; never persisted, never logged.
    Byok,
    /// Server-held credential metered against the user's subscription.
    Managed,
}

/// Role of a chat message sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

/// A message in session history. Immutable once appended; `id` is unique
/// within the session (the assistant message reuses its run id so client
/// and server agree on identity across the streaming lifecycle).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub role: MessageRole,
    pub content: String,
    /// Unix millis.
    pub timestamp: u64,
}

impl ChatMessage {
    pub fn user(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: MessageRole::User,
            content: content.into(),
            timestamp: now_millis(),
        }
    }

    pub fn assistant(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: MessageRole::Assistant,
            content: content.into(),
            timestamp: now_millis(),
        }
    }
}

/// Routing target and credential for a session, set by the `config`
/// action (and, in managed mode, overridden per request by the router).
#[derive(Clone)]
pub struct SessionConfig {
    pub model: String,
    pub provider: String,
    pub api_key: String,
    pub key_mode: KeyMode,
    pub fid: Option<u64>,
    pub plan: Option<SubscriptionPlan>,
}

/// One live connection's conversation state.
#[derive(Clone)]
pub struct Session {
    pub id: String,
    pub messages: Vec<ChatMessage>,
    pub model: String,
    pub provider: String,
    pub api_key: String,
    pub key_mode: KeyMode,
    pub fid: Option<u64>,
    pub plan: Option<SubscriptionPlan>,
    pub created_at: u64,
    pub last_activity: u64,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("messages", &self.messages.len())
            .field("model", &self.model)
            .field("provider", &self.provider)
            .field("api_key", &"<redacted>")
            .field("key_mode", &self.key_mode)
            .field("fid", &self.fid)
            .field("plan", &self.plan)
            .field("last_activity", &self.last_activity)
            .finish()
    }
}

/// Registry of active sessions, keyed by connection id.
#[derive(Default)]
pub struct SessionStore {
    inner: RwLock<HashMap<String, Session>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the session for a connection, or update its routing config
    /// if it already exists (re-auth or provider switch). History and
    /// creation time survive reconfiguration.
    pub fn configure(&self, session_id: &str, config: SessionConfig) -> Session {
        let now = now_millis();
        let mut sessions = self.inner.write();
        let session = sessions
            .entry(session_id.to_string())
            .and_modify(|s| {
                s.model = config.model.clone();
                s.provider = config.provider.clone();
                s.api_key = config.api_key.clone();
                s.key_mode = config.key_mode;
                s.fid = config.fid;
                s.plan = config.plan;
                s.last_activity = now;
            })
            .or_insert_with(|| Session {
                id: session_id.to_string(),
                messages: Vec::new(),
                model: config.model,
                provider: config.provider,
                api_key: config.api_key,
                key_mode: config.key_mode,
                fid: config.fid,
                plan: config.plan,
                created_at: now,
                last_activity: now,
            });
        session.clone()
    }

    pub fn get(&self, session_id: &str) -> Option<Session> {
        self.inner.read().get(session_id).cloned()
    }

    /// Refresh the idle clock on inbound activity.
    pub fn touch(&self, session_id: &str) {
        if let Some(session) = self.inner.write().get_mut(session_id) {
            session.last_activity = now_millis();
        }
    }

    /// Append a message, dropping the oldest entries beyond the cap.
    /// A no-op if the session is gone (e.g. the connection closed while
    /// a stream was still in flight).
    pub fn append_message(&self, session_id: &str, message: ChatMessage) {
        let mut sessions = self.inner.write();
        if let Some(session) = sessions.get_mut(session_id) {
            session.messages.push(message);
            if session.messages.len() > MAX_SESSION_MESSAGES {
                let excess = session.messages.len() - MAX_SESSION_MESSAGES;
                session.messages.drain(..excess);
            }
            session.last_activity = now_millis();
        }
    }

    /// The session's message list; empty if the session does not exist.
    pub fn history(&self, session_id: &str) -> Vec<ChatMessage> {
        self.inner
            .read()
            .get(session_id)
            .map(|s| s.messages.clone())
            .unwrap_or_default()
    }

    pub fn remove(&self, session_id: &str) -> bool {
        self.inner.write().remove(session_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Remove every session whose last activity is at or before `cutoff_ms`.
    ///
    /// Snapshot-then-filter: candidates are collected under the read
    /// lock, then removed one by one, tolerating concurrent creates and
    /// deletes between the two steps.
    pub fn sweep_older_than(&self, cutoff_ms: u64) -> usize {
        let stale: Vec<String> = {
            let sessions = self.inner.read();
            sessions
                .values()
                .filter(|s| s.last_activity <= cutoff_ms)
                .map(|s| s.id.clone())
                .collect()
        };

        let mut removed = 0;
        for id in stale {
            let mut sessions = self.inner.write();
            if sessions
                .get(&id)
                .is_some_and(|s| s.last_activity <= cutoff_ms)
            {
                sessions.remove(&id);
                removed += 1;
            }
        }
        removed
    }

    #[cfg(test)]
    fn set_last_activity(&self, session_id: &str, ts: u64) {
        if let Some(session) = self.inner.write().get_mut(session_id) {
            session.last_activity = ts;
        }
    }
}

/// Periodic idle sweep. Runs until the shutdown channel flips to `true`.
pub async fn idle_sweep_loop(
    store: Arc<SessionStore>,
    interval: Duration,
    max_idle: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick fires immediately; skip it so a fresh server does
    // not sweep before anything could go idle.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let cutoff = now_millis().saturating_sub(max_idle.as_millis() as u64);
                let removed = store.sweep_older_than(cutoff);
                if removed > 0 {
                    info!(target: "ws", removed, "idle sessions evicted");
                } else {
                    debug!(target: "ws", "idle sweep found nothing to evict");
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn byok_config() -> SessionConfig {
        SessionConfig {
            model: "gpt-4o".to_string(),
            provider: "openai".to_string(),
            api_key: "sk-test".to_string(),
            key_mode: KeyMode::Byok,
            fid: None,
            plan: None,
        }
    }

    #[test]
    fn test_configure_creates_then_updates() {
        let store = SessionStore::new();
        let created = store.configure("conn-1", byok_config());
        assert_eq!(created.provider, "openai");
        assert!(created.messages.is_empty());

        store.append_message("conn-1", ChatMessage::user("m1", "hello"));

        // Reconfigure with a different provider; history survives.
        let updated = store.configure(
            "conn-1",
            SessionConfig {
                provider: "anthropic".to_string(),
                model: "claude-opus-4-20250514".to_string(),
                ..byok_config()
            },
        );
        assert_eq!(updated.provider, "anthropic");
        assert_eq!(updated.messages.len(), 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_history_empty_for_missing_session() {
        let store = SessionStore::new();
        assert!(store.history("nope").is_empty());
    }

    #[test]
    fn test_append_to_missing_session_is_noop() {
        let store = SessionStore::new();
        store.append_message("gone", ChatMessage::assistant("m1", "late output"));
        assert!(store.is_empty());
    }

    #[test]
    fn test_message_cap_keeps_most_recent_in_order() {
        let store = SessionStore::new();
        store.configure("conn-1", byok_config());

        for i in 0..(MAX_SESSION_MESSAGES + 10) {
            store.append_message("conn-1", ChatMessage::user(format!("m{i}"), format!("msg {i}")));
        }

        let history = store.history("conn-1");
        assert_eq!(history.len(), MAX_SESSION_MESSAGES);
        assert_eq!(history[0].id, "m10");
        assert_eq!(history.last().unwrap().id, format!("m{}", MAX_SESSION_MESSAGES + 9));
    }

    #[test]
    fn test_remove() {
        let store = SessionStore::new();
        store.configure("conn-1", byok_config());
        assert!(store.remove("conn-1"));
        assert!(!store.remove("conn-1"));
        assert!(store.get("conn-1").is_none());
    }

    #[test]
    fn test_sweep_removes_only_stale_sessions() {
        let store = SessionStore::new();
        store.configure("stale", byok_config());
        store.configure("fresh", byok_config());

        let now = now_millis();
        store.set_last_activity("stale", now - 31 * 60 * 1000);

        let removed = store.sweep_older_than(now - 30 * 60 * 1000);
        assert_eq!(removed, 1);
        assert!(store.get("stale").is_none());
        assert!(store.get("fresh").is_some());
    }

    #[test]
    fn test_touch_rescues_session_from_sweep() {
        let store = SessionStore::new();
        store.configure("conn-1", byok_config());
        let now = now_millis();
        store.set_last_activity("conn-1", now - 60_000);
        store.touch("conn-1");

        assert_eq!(store.sweep_older_than(now - 30_000), 0);
        assert!(store.get("conn-1").is_some());
    }

    #[test]
    fn test_session_debug_redacts_api_key() {
        let store = SessionStore::new();
        let session = store.configure("conn-1", byok_config());
        let rendered = format!("{session:?}");
        assert!(!rendered.contains("sk-test"));
    }

    #[tokio::test]
    async fn test_idle_sweep_loop_stops_on_shutdown() {
        let store = Arc::new(SessionStore::new());
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(idle_sweep_loop(
            store.clone(),
            Duration::from_secs(3600),
            Duration::from_secs(3600),
            rx,
        ));
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sweep loop should exit on shutdown")
            .unwrap();
    }
}
