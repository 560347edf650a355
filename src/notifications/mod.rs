use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strum::Display;
use thiserror::Error;
use tracing::instrument;

use crate::events::{Event, EventSender};

/// User-facing payment outcomes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PaymentNotificationKind {
    PaymentCompleted,
    PaymentFailed,
    PaymentExpired,
    RefundPending,
    Refunded,
    RefundFailed,
}

/// Message emitted after an order's payment status changes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentNotification {
    pub order_id: String,
    pub user_id: String,
    pub kind: PaymentNotificationKind,
    pub message: String,
    pub amount: Option<Decimal>,
    pub currency: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl PaymentNotification {
    pub fn new(
        order_id: impl Into<String>,
        user_id: impl Into<String>,
        kind: PaymentNotificationKind,
    ) -> Self {
        let order_id = order_id.into();
        let message = match kind {
            PaymentNotificationKind::PaymentCompleted => {
                format!("Payment received for order {}", order_id)
            }
            PaymentNotificationKind::PaymentFailed => {
                format!("Payment for order {} failed", order_id)
            }
            PaymentNotificationKind::PaymentExpired => {
                format!("Checkout for order {} expired", order_id)
            }
            PaymentNotificationKind::RefundPending => {
                format!("Refund for order {} is being processed", order_id)
            }
            PaymentNotificationKind::Refunded => format!("Order {} has been refunded", order_id),
            PaymentNotificationKind::RefundFailed => {
                format!("Refund for order {} could not be completed", order_id)
            }
        };

        Self {
            order_id,
            user_id: user_id.into(),
            kind,
            message,
            amount: None,
            currency: None,
            occurred_at: Utc::now(),
        }
    }

    pub fn with_amount(mut self, amount: Decimal, currency: impl Into<String>) -> Self {
        self.amount = Some(amount);
        self.currency = Some(currency.into());
        self
    }
}

/// Notification service errors
#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("Notification channel closed: {0}")]
    ChannelClosed(String),
    #[error("Notification delivery failed: {0}")]
    Delivery(String),
}

/// Fan-out seam for payment notifications (email, websocket, ...)
#[async_trait]
pub trait PaymentNotifier: Send + Sync {
    async fn notify(&self, notification: PaymentNotification) -> Result<(), NotificationError>;
}

/// Publishes notifications onto the in-process event channel
#[derive(Debug, Clone)]
pub struct EventNotifier {
    events: EventSender,
}

impl EventNotifier {
    pub fn new(events: EventSender) -> Self {
        Self { events }
    }
}

#[async_trait]
impl PaymentNotifier for EventNotifier {
    #[instrument(skip(self, notification), fields(order_id = %notification.order_id, kind = %notification.kind))]
    async fn notify(&self, notification: PaymentNotification) -> Result<(), NotificationError> {
        self.events
            .send(Event::PaymentStatusChanged(notification))
            .await
            .map_err(NotificationError::ChannelClosed)
    }
}
