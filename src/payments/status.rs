use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use utoipa::ToSchema;

/// Payment lifecycle of an order.
///
/// `PENDING → {COMPLETED, FAILED, EXPIRED}` is driven only by verified gateway
/// events; `COMPLETED → {REFUND_PENDING, REFUNDED}` by refund calls and refund
/// webhooks. A declined or expired attempt can still be paid afterwards, so
/// `FAILED` and `EXPIRED` also accept `COMPLETED`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, ToSchema,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
    Expired,
    Refunded,
    RefundPending,
}

impl PaymentStatus {
    /// Whether an order in this state may move to `next`.
    pub fn can_transition_to(self, next: PaymentStatus) -> bool {
        use PaymentStatus::*;
        matches!(
            (self, next),
            (Pending, Completed)
                | (Pending, Failed)
                | (Pending, Expired)
                | (Pending, Pending)
                | (Failed, Pending)
                | (Failed, Completed)
                | (Expired, Pending)
                | (Expired, Completed)
                | (Completed, RefundPending)
                | (Completed, Refunded)
                | (RefundPending, Refunded)
                | (RefundPending, Completed)
        )
    }

    /// A new payment attempt may only start before the order has been paid.
    pub fn accepts_new_attempt(self) -> bool {
        self.can_transition_to(PaymentStatus::Pending)
    }
}

/// Outcome of the latest refund attempt on an order
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, ToSchema,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum RefundStatus {
    RefundPending,
    Refunded,
    Failed,
}

impl RefundStatus {
    /// Maps a gateway refund status (`succeeded`, `pending`, `failed`, ...)
    pub fn from_gateway(status: &str) -> Self {
        match status {
            "succeeded" => RefundStatus::Refunded,
            "failed" | "canceled" => RefundStatus::Failed,
            _ => RefundStatus::RefundPending,
        }
    }

    /// Order payment status implied by this refund outcome
    pub fn payment_status(self) -> PaymentStatus {
        match self {
            RefundStatus::Refunded => PaymentStatus::Refunded,
            RefundStatus::RefundPending => PaymentStatus::RefundPending,
            RefundStatus::Failed => PaymentStatus::Completed,
        }
    }
}

/// Fulfillment status set alongside a completed payment
pub const ORDER_STATUS_PROCESSING: &str = "PROCESSING";
