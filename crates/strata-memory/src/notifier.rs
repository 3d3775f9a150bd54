//! World-model notification: the best-effort hand-off after insight extraction.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use strata_types::config::WorldModelConfig;
use strata_types::error::{StrataError, StrataResult};
use strata_types::pipeline::WorldModelEvent;
use tokio::sync::broadcast;
use tracing::debug;

/// Receives one event per ingested packet once its extraction is stored.
#[async_trait]
pub trait WorldModelNotifier: Send + Sync {
    /// Deliver an event. Failures are reported as `ProviderDegraded`.
    async fn notify(&self, event: &WorldModelEvent) -> StrataResult<()>;

    /// Short name for logs and health output.
    fn name(&self) -> &'static str;
}

/// Drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

#[async_trait]
impl WorldModelNotifier for NoopNotifier {
    async fn notify(&self, _event: &WorldModelEvent) -> StrataResult<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "noop"
    }
}

/// In-process fan-out over a tokio broadcast channel.
pub struct BroadcastNotifier {
    sender: broadcast::Sender<WorldModelEvent>,
}

impl BroadcastNotifier {
    /// Create a notifier whose channel buffers up to `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to future events.
    pub fn subscribe(&self) -> broadcast::Receiver<WorldModelEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl WorldModelNotifier for BroadcastNotifier {
    async fn notify(&self, event: &WorldModelEvent) -> StrataResult<()> {
        // No subscribers is not a failure.
        let delivered = self.sender.send(event.clone()).unwrap_or(0);
        debug!(packet_id = %event.packet.id, delivered, "Broadcast world-model event");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "broadcast"
    }
}

/// POSTs each event as JSON to a configured URL.
pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    /// Create a webhook notifier with a per-request timeout.
    pub fn new(url: impl Into<String>, timeout: Duration) -> StrataResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StrataError::Config(format!("webhook client: {e}")))?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl WorldModelNotifier for WebhookNotifier {
    async fn notify(&self, event: &WorldModelEvent) -> StrataResult<()> {
        let resp = self
            .client
            .post(&self.url)
            .json(event)
            .send()
            .await
            .map_err(|e| StrataError::ProviderDegraded(format!("webhook: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(StrataError::ProviderDegraded(format!(
                "webhook returned {status}"
            )));
        }
        debug!(packet_id = %event.packet.id, url = %self.url, "Delivered world-model event");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "webhook"
    }
}

/// The notifier selected by configuration: a webhook when a URL is set,
/// otherwise the given in-process broadcast channel.
pub fn create_notifier(
    config: &WorldModelConfig,
    broadcast: Arc<BroadcastNotifier>,
) -> StrataResult<Arc<dyn WorldModelNotifier>> {
    match config.webhook_url.as_deref().map(str::trim) {
        Some(url) if !url.is_empty() => Ok(Arc::new(WebhookNotifier::new(
            url,
            Duration::from_millis(config.timeout_ms),
        )?)),
        _ => Ok(broadcast),
    }
}
