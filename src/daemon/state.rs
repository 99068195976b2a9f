//! Cross-container shared state.
//!
//! Each table has its own lock and none is ever held across I/O; handlers
//! snapshot what they need and release. Every key involving a container is
//! purged when that container disconnects.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Session metadata older than this is dropped from completion answers.
pub const SESSION_METADATA_MAX_AGE: Duration = Duration::from_secs(30);

/// Agents enumerated by `get_usage_status`.
pub const KNOWN_AGENTS: [&str; 8] = [
    "superclaude",
    "supercodex",
    "supergemini",
    "superqwen",
    "claude",
    "codex",
    "gemini",
    "qwen",
];

/// Latest mirrored pane content for one (container, session).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionBuffer {
    pub buffer: String,
    #[serde(default)]
    pub cursor_x: u32,
    #[serde(default)]
    pub cursor_y: u32,
    #[serde(default)]
    pub pane_width: u32,
    #[serde(default)]
    pub pane_height: u32,
}

/// One tmux session as reported by a container's `state_update`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub name: String,
    #[serde(default)]
    pub windows: u32,
    #[serde(default)]
    pub attached: bool,
    #[serde(default)]
    pub agent_type: Option<String>,
    #[serde(default)]
    pub identifier: Option<String>,
}

#[derive(Debug, Clone)]
struct SessionMetadata {
    sessions: Vec<SessionInfo>,
    updated_at: Instant,
}

/// Notification ids held for auto-dismissal.
#[derive(Debug, Clone, Default)]
pub struct ActiveNotification {
    pub desktop_id: Option<u32>,
    pub telegram: Option<TelegramMessageRef>,
}

#[derive(Debug, Clone)]
pub struct TelegramMessageRef {
    pub chat_id: String,
    pub message_id: i64,
}

/// Advisory rate-limit state per agent.
#[derive(Debug, Clone)]
pub struct RateLimitEntry {
    pub limited: bool,
    pub detected_at: DateTime<Utc>,
    pub resets_at: Option<DateTime<Utc>>,
    pub error_type: Option<String>,
    pub reported_by: String,
}

/// Stream subscriber callback. Must be fast and non-blocking; a subscriber
/// that needs to queue work owns its own queue.
pub type StreamSubscriber = Arc<dyn Fn(&SessionBuffer) + Send + Sync>;

type SessionKey = (String, String);

#[derive(Default)]
pub struct DaemonState {
    session_buffers: Mutex<HashMap<SessionKey, SessionBuffer>>,
    stream_subscribers: Mutex<HashMap<SessionKey, Vec<(u64, StreamSubscriber)>>>,
    container_state: Mutex<HashMap<String, Vec<String>>>,
    session_metadata: Mutex<HashMap<String, SessionMetadata>>,
    active_notifications: Mutex<HashMap<SessionKey, ActiveNotification>>,
    recent_notifications: Mutex<HashMap<SessionKey, (Instant, Value)>>,
    session_activity: Mutex<HashMap<SessionKey, Instant>>,
    rate_limits: Mutex<HashMap<String, RateLimitEntry>>,
    next_subscriber_id: AtomicU64,
}

impl DaemonState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    // ========================================================================
    // Terminal stream mirroring
    // ========================================================================

    pub fn register_stream(&self, container: &str, session: &str) {
        self.session_buffers
            .lock()
            .entry((container.to_string(), session.to_string()))
            .or_default();
    }

    /// Store the latest buffer and return the subscriber snapshot to fan out
    /// to. Callbacks are invoked by the caller with no lock held.
    pub fn store_stream_data(
        &self,
        container: &str,
        session: &str,
        data: SessionBuffer,
    ) -> Vec<StreamSubscriber> {
        let key = (container.to_string(), session.to_string());
        self.session_buffers.lock().insert(key.clone(), data);
        self.session_activity.lock().insert(key.clone(), Instant::now());
        self.stream_subscribers
            .lock()
            .get(&key)
            .map(|subs| subs.iter().map(|(_, cb)| cb.clone()).collect())
            .unwrap_or_default()
    }

    pub fn unregister_stream(&self, container: &str, session: &str) {
        let key = (container.to_string(), session.to_string());
        self.session_buffers.lock().remove(&key);
        self.session_activity.lock().remove(&key);
    }

    pub fn session_buffer(&self, container: &str, session: &str) -> Option<SessionBuffer> {
        self.session_buffers
            .lock()
            .get(&(container.to_string(), session.to_string()))
            .cloned()
    }

    /// Subscribe to stream updates; returns a token for unsubscribe.
    pub fn subscribe_stream(
        &self,
        container: &str,
        session: &str,
        callback: StreamSubscriber,
    ) -> u64 {
        let token = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        self.stream_subscribers
            .lock()
            .entry((container.to_string(), session.to_string()))
            .or_default()
            .push((token, callback));
        token
    }

    pub fn unsubscribe_stream(&self, container: &str, session: &str, token: u64) {
        let key = (container.to_string(), session.to_string());
        let mut subscribers = self.stream_subscribers.lock();
        if let Some(subs) = subscribers.get_mut(&key) {
            subs.retain(|(t, _)| *t != token);
            if subs.is_empty() {
                subscribers.remove(&key);
            }
        }
    }

    // ========================================================================
    // Container state / session metadata caches
    // ========================================================================

    pub fn update_worktrees(&self, container: &str, worktrees: Vec<String>) {
        self.container_state
            .lock()
            .insert(container.to_string(), worktrees);
    }

    pub fn update_sessions(&self, container: &str, sessions: Vec<SessionInfo>) {
        self.session_metadata.lock().insert(
            container.to_string(),
            SessionMetadata {
                sessions,
                updated_at: Instant::now(),
            },
        );
    }

    /// Cached sessions for one container, dropping stale data.
    pub fn sessions_of(&self, container: &str, max_age: Duration) -> Vec<SessionInfo> {
        self.session_metadata
            .lock()
            .get(container)
            .filter(|meta| meta.updated_at.elapsed() <= max_age)
            .map(|meta| meta.sessions.clone())
            .unwrap_or_default()
    }

    /// Cached sessions across all containers, dropping stale entries.
    pub fn all_sessions(&self, max_age: Duration) -> Vec<(String, Vec<SessionInfo>)> {
        self.session_metadata
            .lock()
            .iter()
            .filter(|(_, meta)| meta.updated_at.elapsed() <= max_age)
            .map(|(container, meta)| (container.clone(), meta.sessions.clone()))
            .collect()
    }

    pub fn worktrees_of(&self, container: &str) -> Vec<String> {
        self.container_state
            .lock()
            .get(container)
            .cloned()
            .unwrap_or_default()
    }

    pub fn all_worktrees(&self) -> Vec<(String, Vec<String>)> {
        self.container_state
            .lock()
            .iter()
            .map(|(container, worktrees)| (container.clone(), worktrees.clone()))
            .collect()
    }

    // ========================================================================
    // Notifications
    // ========================================================================

    pub fn set_active_notification(
        &self,
        container: &str,
        session: &str,
        notification: ActiveNotification,
    ) {
        self.active_notifications
            .lock()
            .insert((container.to_string(), session.to_string()), notification);
    }

    pub fn take_active_notification(
        &self,
        container: &str,
        session: &str,
    ) -> Option<ActiveNotification> {
        self.active_notifications
            .lock()
            .remove(&(container.to_string(), session.to_string()))
    }

    pub fn has_active_notification(&self, container: &str, session: &str) -> bool {
        self.active_notifications
            .lock()
            .contains_key(&(container.to_string(), session.to_string()))
    }

    /// Dedup check: a notification for the same key inside the window reuses
    /// the first dispatch's outcome.
    pub fn recent_notification_outcome(
        &self,
        container: &str,
        session: &str,
        window: Duration,
    ) -> Option<Value> {
        let key = (container.to_string(), session.to_string());
        self.recent_notifications
            .lock()
            .get(&key)
            .filter(|(at, _)| at.elapsed() <= window)
            .map(|(_, outcome)| outcome.clone())
    }

    /// Record a dispatch outcome and purge entries older than the window.
    pub fn record_notification_outcome(
        &self,
        container: &str,
        session: &str,
        window: Duration,
        outcome: Value,
    ) {
        let mut recent = self.recent_notifications.lock();
        recent.retain(|_, (at, _)| at.elapsed() <= window);
        recent.insert(
            (container.to_string(), session.to_string()),
            (Instant::now(), outcome),
        );
    }

    // ========================================================================
    // Rate limits
    // ========================================================================

    pub fn report_rate_limit(&self, agent: &str, entry: RateLimitEntry) {
        self.rate_limits.lock().insert(agent.to_string(), entry);
    }

    pub fn clear_rate_limit(&self, agent: &str) -> bool {
        self.rate_limits.lock().remove(agent).is_some()
    }

    /// Whether an agent is available, lazily clearing expired limits.
    /// Returns `(available, resets_at)`.
    pub fn check_agent(&self, agent: &str) -> (bool, Option<DateTime<Utc>>) {
        let mut limits = self.rate_limits.lock();
        let Some(entry) = limits.get(agent) else {
            return (true, None);
        };
        if !entry.limited {
            return (true, None);
        }
        match entry.resets_at {
            Some(resets_at) if resets_at <= Utc::now() => {
                limits.remove(agent);
                (true, None)
            }
            resets_at => (false, resets_at),
        }
    }

    /// Status of every known agent, lazily clearing expired limits.
    pub fn usage_status(&self) -> Value {
        let now = Utc::now();
        let mut limits = self.rate_limits.lock();
        limits.retain(|_, entry| entry.resets_at.map(|t| t > now).unwrap_or(true));

        let mut status = serde_json::Map::new();
        for agent in KNOWN_AGENTS {
            let entry = limits.get(agent);
            let limited = entry.map(|e| e.limited).unwrap_or(false);
            let resets_at = entry.and_then(|e| e.resets_at).filter(|_| limited);
            let resets_in = resets_at.map(|t| (t - now).num_seconds().max(0));

            status.insert(
                agent.to_string(),
                serde_json::json!({
                    "available": !limited,
                    "limited": limited,
                    "resets_at": resets_at.map(|t| t.to_rfc3339()),
                    "resets_in_seconds": resets_in,
                    "error_type": entry.and_then(|e| e.error_type.clone()),
                }),
            );
        }
        Value::Object(status)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Remove every entry keyed by this container. Called on disconnect.
    pub fn purge_container(&self, container: &str) {
        self.session_buffers
            .lock()
            .retain(|(c, _), _| c != container);
        self.stream_subscribers
            .lock()
            .retain(|(c, _), _| c != container);
        self.session_activity
            .lock()
            .retain(|(c, _), _| c != container);
        self.container_state.lock().remove(container);
        self.session_metadata.lock().remove(container);
        self.active_notifications
            .lock()
            .retain(|(c, _), _| c != container);
        self.recent_notifications
            .lock()
            .retain(|(c, _), _| c != container);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stream_data_fans_out_to_subscribers() {
        let state = DaemonState::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        state.subscribe_stream(
            "boxctl-x",
            "s1",
            Arc::new(move |data: &SessionBuffer| sink.lock().push(data.buffer.clone())),
        );

        for text in ["a", "ab", "abc"] {
            let subs = state.store_stream_data(
                "boxctl-x",
                "s1",
                SessionBuffer {
                    buffer: text.to_string(),
                    ..Default::default()
                },
            );
            for sub in subs {
                sub(&state.session_buffer("boxctl-x", "s1").unwrap());
            }
        }

        assert_eq!(*seen.lock(), vec!["a", "ab", "abc"]);
    }

    #[test]
    fn test_unsubscribe_stops_fanout() {
        let state = DaemonState::new();
        let token = state.subscribe_stream("boxctl-x", "s1", Arc::new(|_| {}));
        assert_eq!(
            state
                .store_stream_data("boxctl-x", "s1", SessionBuffer::default())
                .len(),
            1
        );

        state.unsubscribe_stream("boxctl-x", "s1", token);
        assert!(state
            .store_stream_data("boxctl-x", "s1", SessionBuffer::default())
            .is_empty());
    }

    #[test]
    fn test_purge_on_disconnect_clears_every_table() {
        let state = DaemonState::new();
        state.register_stream("boxctl-x", "s1");
        state.store_stream_data("boxctl-x", "s1", SessionBuffer::default());
        state.subscribe_stream("boxctl-x", "s1", Arc::new(|_| {}));
        state.update_worktrees("boxctl-x", vec!["feature".into()]);
        state.update_sessions(
            "boxctl-x",
            vec![SessionInfo {
                name: "claude".into(),
                windows: 1,
                attached: false,
                agent_type: None,
                identifier: None,
            }],
        );
        state.set_active_notification("boxctl-x", "s1", ActiveNotification::default());
        state.record_notification_outcome(
            "boxctl-x",
            "s1",
            Duration::from_secs(5),
            json!({"ok": true}),
        );

        // A second container's entries must survive the purge.
        state.update_worktrees("boxctl-y", vec!["main".into()]);

        state.purge_container("boxctl-x");

        assert!(state.session_buffer("boxctl-x", "s1").is_none());
        assert!(state
            .sessions_of("boxctl-x", SESSION_METADATA_MAX_AGE)
            .is_empty());
        assert!(state.worktrees_of("boxctl-x").is_empty());
        assert!(!state.has_active_notification("boxctl-x", "s1"));
        assert!(state
            .recent_notification_outcome("boxctl-x", "s1", Duration::from_secs(5))
            .is_none());
        assert!(state
            .store_stream_data("boxctl-x", "s1", SessionBuffer::default())
            .is_empty());

        assert_eq!(state.worktrees_of("boxctl-y"), vec!["main".to_string()]);
    }

    #[test]
    fn test_dedup_window() {
        let state = DaemonState::new();
        let window = Duration::from_millis(50);

        assert!(state
            .recent_notification_outcome("boxctl-x", "s1", window)
            .is_none());

        state.record_notification_outcome("boxctl-x", "s1", window, json!({"ok": true}));
        assert_eq!(
            state.recent_notification_outcome("boxctl-x", "s1", window),
            Some(json!({"ok": true}))
        );

        std::thread::sleep(Duration::from_millis(80));
        assert!(state
            .recent_notification_outcome("boxctl-x", "s1", window)
            .is_none());

        // Inserting again purges the expired entry rather than growing.
        state.record_notification_outcome("boxctl-x", "s2", window, json!({"ok": true}));
        assert!(state
            .recent_notification_outcome("boxctl-x", "s1", window)
            .is_none());
    }

    #[test]
    fn test_rate_limit_lazy_expiry() {
        let state = DaemonState::new();
        state.report_rate_limit(
            "claude",
            RateLimitEntry {
                limited: true,
                detected_at: Utc::now(),
                resets_at: Some(Utc::now() + chrono::Duration::milliseconds(30)),
                error_type: Some("usage_limit".into()),
                reported_by: "boxctl-x".into(),
            },
        );

        let (available, resets_at) = state.check_agent("claude");
        assert!(!available);
        assert!(resets_at.is_some());

        std::thread::sleep(Duration::from_millis(50));
        let (available, _) = state.check_agent("claude");
        assert!(available);

        // The entry was cleared, not just reported available.
        let status = state.usage_status();
        assert_eq!(status["claude"]["available"], true);
        assert_eq!(status["claude"]["limited"], false);
    }

    #[test]
    fn test_usage_status_lists_known_agents() {
        let state = DaemonState::new();
        let status = state.usage_status();
        for agent in KNOWN_AGENTS {
            assert!(status.get(agent).is_some(), "{agent} missing");
        }
    }

    #[test]
    fn test_stale_session_metadata_filtered() {
        let state = DaemonState::new();
        state.update_sessions(
            "boxctl-x",
            vec![SessionInfo {
                name: "claude".into(),
                windows: 1,
                attached: true,
                agent_type: Some("claude".into()),
                identifier: None,
            }],
        );

        assert_eq!(state.sessions_of("boxctl-x", Duration::from_secs(30)).len(), 1);
        assert!(state.sessions_of("boxctl-x", Duration::ZERO).is_empty());
    }
}
