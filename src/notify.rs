use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::{BoxId, Notice, PlanterBox};

#[allow(dead_code)]
const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for live box updates. Subscribers (status pages, the
/// admin map) get the committed row after every state change.
pub struct NotifyHub {
    channels: DashMap<BoxId, broadcast::Sender<PlanterBox>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to updates for one box. Creates the channel if needed.
    pub fn subscribe(&self, box_id: BoxId) -> broadcast::Receiver<PlanterBox> {
        let sender = self
            .channels
            .entry(box_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Broadcast a committed row. No-op if nobody is listening.
    pub fn send(&self, box_id: BoxId, row: &PlanterBox) {
        if let Some(sender) = self.channels.get(&box_id) {
            let _ = sender.send(row.clone());
        }
    }
}

#[derive(Debug)]
pub struct DeliveryError(pub String);

impl std::fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "delivery failed: {}", self.0)
    }
}

impl std::error::Error for DeliveryError {}

/// Delivery collaborator for queued notices. Rendering and transport
/// live behind this trait; the dispatcher only cares whether the
/// attempt succeeded. Implementations must be safe to call more than
/// once per notice — delivery is at-least-once.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, notice: &Notice) -> Result<(), DeliveryError>;
}

/// Logs the notice and reports success. Default for deployments that
/// handle mail entirely outside the engine.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn deliver(&self, notice: &Notice) -> Result<(), DeliveryError> {
        tracing::info!(
            kind = notice.kind.as_str(),
            recipient = %notice.recipient_email,
            box_id = notice.box_id,
            "notice delivered to log"
        );
        Ok(())
    }
}
