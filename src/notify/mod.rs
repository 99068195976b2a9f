//! Notification dispatch.
//!
//! A notify request fans out to the configured channels (desktop always,
//! Telegram when enabled), records the returned ids for auto-dismissal, and
//! coalesces repeats for the same (container, session) inside the
//! deduplication window.

pub mod desktop;
pub mod telegram;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::host::NotificationsConfig;
use crate::daemon::state::{ActiveNotification, DaemonState};

use telegram::TelegramClient;

/// Parsed `notify` payload.
#[derive(Debug, Clone)]
pub struct NotifyRequest {
    pub title: String,
    pub message: String,
    pub urgency: String,
    pub summary_short: String,
    pub summary_long: String,
    pub notify_type: String,
    pub container: String,
    pub session: String,
    pub project: String,
}

impl NotifyRequest {
    pub fn from_payload(payload: &Value) -> Self {
        let text =
            |v: &Value, key: &str| v.get(key).and_then(Value::as_str).unwrap_or("").to_string();

        let title = payload
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or("boxctl")
            .to_string();
        let message = payload
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("Notification")
            .to_string();

        let mut urgency = payload
            .get("urgency")
            .and_then(Value::as_str)
            .unwrap_or("normal")
            .to_string();
        if urgency == "high" {
            urgency = "critical".to_string();
        }

        let metadata = payload.get("metadata").cloned().unwrap_or(Value::Null);
        let pick = |key: &str| {
            let value = text(&metadata, key);
            if value.is_empty() {
                message.clone()
            } else {
                value
            }
        };

        Self {
            title,
            urgency,
            summary_short: pick("summary_short"),
            summary_long: pick("summary_long"),
            notify_type: text(&metadata, "notify_type"),
            container: text(&metadata, "container"),
            session: text(&metadata, "session"),
            project: text(&metadata, "project"),
            message,
        }
    }
}

/// Owns channel clients and the notification policy.
pub struct Notifier {
    config: NotificationsConfig,
    hook: Option<PathBuf>,
    telegram: TelegramClient,
}

impl Notifier {
    pub fn new(config: NotificationsConfig, hook: Option<PathBuf>) -> Self {
        Self {
            config,
            hook,
            telegram: TelegramClient::new(),
        }
    }

    fn dedup_window(&self) -> Duration {
        Duration::from_millis(self.config.deduplication_window)
    }

    /// Dispatch a notification, returning `{ok, channels}`.
    pub async fn dispatch(&self, state: &Arc<DaemonState>, request: NotifyRequest) -> Value {
        let keyed = !request.container.is_empty() && !request.session.is_empty();

        if keyed {
            if let Some(outcome) = state.recent_notification_outcome(
                &request.container,
                &request.session,
                self.dedup_window(),
            ) {
                debug!(
                    "Coalescing notification for {}/{} inside dedup window",
                    request.container, request.session
                );
                return outcome;
            }
        }

        debug!(
            "Notify: type={} title={:?} short={:?}",
            request.notify_type, request.title, request.summary_short
        );

        let mut channels = serde_json::Map::new();
        let mut active = ActiveNotification::default();

        match desktop::send(&request.title, &request.summary_short, &request.urgency).await {
            Ok(id) => {
                channels.insert("desktop".into(), json!(true));
                if id > 0 {
                    active.desktop_id = Some(id);
                }
            }
            Err(e) => {
                warn!("Desktop notification failed: {e}");
                channels.insert("desktop".into(), json!(false));
            }
        }

        if let Some(telegram_config) = self.config.telegram.as_ref().filter(|t| t.enabled) {
            let sent = self
                .telegram
                .send(
                    telegram_config,
                    &request.summary_long,
                    &request.notify_type,
                    &request.project,
                    &request.session,
                )
                .await;
            channels.insert("telegram".into(), json!(sent.is_some()));
            active.telegram = sent;
        }

        if keyed && (active.desktop_id.is_some() || active.telegram.is_some()) {
            state.set_active_notification(&request.container, &request.session, active);
        }

        if request.urgency == "critical" {
            desktop::beep().await;
        }

        self.run_hook(&request).await;

        let ok = channels.values().all(|sent| sent == &json!(true));
        let outcome = json!({"ok": ok, "channels": Value::Object(channels)});

        if keyed {
            state.record_notification_outcome(
                &request.container,
                &request.session,
                self.dedup_window(),
                outcome.clone(),
            );
        }
        outcome
    }

    /// Dismiss the active notification for a resumed session, honoring the
    /// `auto_dismiss` setting.
    pub async fn dismiss_for_session(
        &self,
        state: &Arc<DaemonState>,
        container: &str,
        session: &str,
    ) {
        if !self.config.auto_dismiss {
            return;
        }

        let Some(active) = state.take_active_notification(container, session) else {
            debug!("No active notification for {container}/{session}");
            return;
        };

        debug!("Dismissing notifications for {container}/{session}");

        if let Some(id) = active.desktop_id {
            desktop::dismiss(id).await;
        }

        if let (Some(message), Some(telegram_config)) =
            (active.telegram, self.config.telegram.as_ref())
        {
            self.telegram.delete(telegram_config, &message).await;
        }
    }

    /// Run the user's notify hook: `hook title summary urgency`.
    async fn run_hook(&self, request: &NotifyRequest) {
        let Some(hook) = &self.hook else {
            return;
        };
        if !hook.is_file() {
            return;
        }

        let mut command = tokio::process::Command::new(hook);
        command
            .args([&request.title, &request.summary_short, &request.urgency])
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());

        let result = tokio::time::timeout(Duration::from_secs(5), command.status()).await;
        match result {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!("Notify hook failed: {e}"),
            Err(_) => warn!("Notify hook timed out"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_payload_defaults() {
        let request = NotifyRequest::from_payload(&json!({}));
        assert_eq!(request.title, "boxctl");
        assert_eq!(request.message, "Notification");
        assert_eq!(request.urgency, "normal");
        assert_eq!(request.summary_short, "Notification");
        assert!(request.container.is_empty());
    }

    #[test]
    fn test_high_urgency_coerced_to_critical() {
        let request = NotifyRequest::from_payload(&json!({"urgency": "high"}));
        assert_eq!(request.urgency, "critical");
    }

    #[test]
    fn test_summaries_fall_back_to_message() {
        let request = NotifyRequest::from_payload(&json!({
            "title": "T",
            "message": "M",
            "metadata": {
                "summary_long": "a longer summary",
                "container": "boxctl-x",
                "session": "s1",
            }
        }));
        assert_eq!(request.summary_short, "M");
        assert_eq!(request.summary_long, "a longer summary");
        assert_eq!(request.container, "boxctl-x");
        assert_eq!(request.session, "s1");
    }
}
