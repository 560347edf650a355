use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::notifications::{PaymentNotification, PaymentNotificationKind};

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }
}

// Events raised by the payment reconciliation flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    PaymentStatusChanged(PaymentNotification),
}

/// Drains the event channel until every sender is dropped
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match event {
            Event::PaymentStatusChanged(notification) => match notification.kind {
                PaymentNotificationKind::PaymentFailed
                | PaymentNotificationKind::RefundFailed => warn!(
                    order_id = %notification.order_id,
                    user_id = %notification.user_id,
                    kind = %notification.kind,
                    "{}",
                    notification.message
                ),
                _ => info!(
                    order_id = %notification.order_id,
                    user_id = %notification.user_id,
                    kind = %notification.kind,
                    "{}",
                    notification.message
                ),
            },
        }
    }

    info!("Event processing loop stopped");
}
