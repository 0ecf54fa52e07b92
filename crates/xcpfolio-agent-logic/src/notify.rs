//! Webhook notifications for agent events
//!
//! Fire-and-forget: delivery failures are logged and swallowed, and no
//! control-flow decision ever depends on a notification outcome.

use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

/// Event severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

/// A structured event emitted by the controllers.
#[derive(Debug, Clone)]
pub struct AgentEvent {
    pub severity: Severity,
    pub title: String,
    pub detail: serde_json::Value,
}

enum Sink {
    Disabled,
    Webhook { client: reqwest::Client, url: String },
    Capture(Arc<Mutex<Vec<AgentEvent>>>),
}

/// Structured event sink.
pub struct Notifier {
    sink: Sink,
}

impl Notifier {
    /// Webhook-backed notifier if a URL is configured, else disabled.
    pub fn new(webhook_url: Option<String>) -> Self {
        match webhook_url {
            Some(url) if !url.is_empty() => {
                let client = reqwest::Client::builder()
                    .timeout(Duration::from_secs(10))
                    .build()
                    .expect("reqwest client");
                Self {
                    sink: Sink::Webhook { client, url },
                }
            }
            _ => Self {
                sink: Sink::Disabled,
            },
        }
    }

    pub fn disabled() -> Self {
        Self {
            sink: Sink::Disabled,
        }
    }

    /// Notifier that records events in memory; used by controller tests to
    /// assert on emitted warnings/criticals.
    pub fn capture() -> (Self, Arc<Mutex<Vec<AgentEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                sink: Sink::Capture(events.clone()),
            },
            events,
        )
    }

    pub async fn send(&self, severity: Severity, title: &str, detail: serde_json::Value) {
        match &self.sink {
            Sink::Disabled => {
                debug!("[notify/{}] {}", severity.as_str(), title);
            }
            Sink::Capture(events) => {
                events.lock().expect("capture poisoned").push(AgentEvent {
                    severity,
                    title: title.to_string(),
                    detail,
                });
            }
            Sink::Webhook { client, url } => {
                let payload = json!({
                    "severity": severity.as_str(),
                    "title": title,
                    "detail": detail,
                    "source": "xcpfolio-agent",
                    "at": chrono::Utc::now().to_rfc3339(),
                });
                match client.post(url).json(&payload).send().await {
                    Ok(response) if response.status().is_success() => {}
                    Ok(response) => {
                        warn!(
                            "Notification '{}' rejected: HTTP {}",
                            title,
                            response.status()
                        );
                    }
                    Err(e) => warn!("Notification '{}' failed: {}", title, e),
                }
            }
        }
    }

    pub async fn info(&self, title: &str, detail: serde_json::Value) {
        self.send(Severity::Info, title, detail).await;
    }

    pub async fn warning(&self, title: &str, detail: serde_json::Value) {
        self.send(Severity::Warning, title, detail).await;
    }

    pub async fn critical(&self, title: &str, detail: serde_json::Value) {
        self.send(Severity::Critical, title, detail).await;
    }
}
