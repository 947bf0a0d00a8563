//! Outbound webhook notifications
//!
//! Fire-and-forget: delivery failures are logged at debug and otherwise
//! swallowed; the lifecycle never waits on a notification.

use crate::messages::HostEvent;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

/// Notification payload POSTed to the configured webhook
#[derive(Debug, Serialize)]
struct EventPayload<'a> {
    event: &'static str,
    host: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    origin: Option<&'a str>,
    timestamp: String,
}

/// Webhook notification sender
pub struct Notifier {
    client: reqwest::Client,
    webhook_url: Option<String>,
}

impl Notifier {
    pub fn new(webhook_url: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self {
            client,
            webhook_url,
        }
    }

    /// Deliver one event. Never fails; callers should not await this on a
    /// latency-sensitive path.
    pub async fn send(&self, event: &HostEvent) {
        let Some(url) = &self.webhook_url else {
            return;
        };

        let (kind, host, origin) = match event {
            HostEvent::HostStarting { host, origin } => {
                ("host_starting", host.as_str(), origin.as_deref())
            }
            HostEvent::HostStopping { host } => ("host_stopping", host.as_str(), None),
        };

        let payload = EventPayload {
            event: kind,
            host,
            origin,
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        match self.client.post(url).json(&payload).send().await {
            Ok(response) if response.status().is_success() => {
                debug!(event = kind, host, "Notification delivered");
            }
            Ok(response) => {
                warn!(event = kind, host, status = %response.status(), "Notification rejected");
            }
            Err(e) => {
                debug!(event = kind, host, error = %e, "Notification delivery failed");
            }
        }
    }
}
