//! Best-effort webhook notifier.
//!
//! Delivery is fire-and-forget: failures are logged at warn and never
//! propagate into the pipeline.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::Notifier;

/// Posts messages as JSON to a configured webhook URL.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    /// Creates a notifier posting to `url`.
    #[must_use]
    pub fn new(url: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            url: url.to_string(),
            client,
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, message: &str) {
        let payload = serde_json::json!({ "text": message });
        match self.client.post(&self.url).json(&payload).send().await {
            Ok(response) if response.status().is_success() => {
                debug!("notification delivered");
            }
            Ok(response) => {
                warn!(status = response.status().as_u16(), "notification rejected");
            }
            Err(e) => {
                warn!(error = %e, "notification delivery failed");
            }
        }
    }
}

/// Sends a notification without blocking the caller.
pub fn notify_detached(notifier: &Arc<dyn Notifier>, message: String) {
    let notifier = Arc::clone(notifier);
    tokio::spawn(async move {
        notifier.notify(&message).await;
    });
}
