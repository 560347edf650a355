//! Gateway webhook payloads.
//!
//! Only the fields the reconciliation flow reads are modelled; everything else
//! in the payload is ignored so new gateway fields never break parsing.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::errors::ServiceError;

pub const PAYMENT_INTENT_SUCCEEDED: &str = "payment_intent.succeeded";
pub const PAYMENT_INTENT_FAILED: &str = "payment_intent.payment_failed";
pub const CHECKOUT_SESSION_COMPLETED: &str = "checkout.session.completed";
pub const CHECKOUT_SESSION_EXPIRED: &str = "checkout.session.expired";
pub const REFUND_UPDATED: &str = "refund.updated";
pub const CHARGE_REFUND_UPDATED: &str = "charge.refund.updated";

/// Metadata key carrying the local order id on every gateway object we create
pub const ORDER_ID_KEY: &str = "orderId";
pub const USER_ID_KEY: &str = "userId";

/// Envelope shared by every webhook delivery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    /// Unix seconds at which the gateway created the event
    #[serde(default)]
    pub created: i64,
    pub data: EventData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventData {
    pub object: Value,
}

/// Id-or-object field; the gateway inlines the object when it is expanded
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Expandable {
    Id(String),
    Object { id: String },
}

impl Expandable {
    pub fn id(&self) -> &str {
        match self {
            Expandable::Id(id) => id,
            Expandable::Object { id } => id,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PaymentError {
    pub code: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentIntentObject {
    pub id: String,
    #[serde(default)]
    pub amount: i64,
    pub amount_received: Option<i64>,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub payment_method: Option<Expandable>,
    #[serde(default)]
    pub payment_method_types: Vec<String>,
    pub last_payment_error: Option<PaymentError>,
}

impl PaymentIntentObject {
    /// Payment method id, falling back to the first allowed method type
    pub fn payment_method(&self) -> Option<String> {
        self.payment_method
            .as_ref()
            .map(|pm| pm.id().to_string())
            .or_else(|| self.payment_method_types.first().cloned())
    }

    pub fn error_message(&self) -> String {
        self.last_payment_error
            .as_ref()
            .and_then(|e| e.message.clone())
            .unwrap_or_else(|| "Payment failed".to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutSessionObject {
    pub id: String,
    pub amount_total: Option<i64>,
    pub currency: Option<String>,
    pub payment_intent: Option<Expandable>,
    pub payment_status: Option<String>,
    #[serde(default)]
    pub payment_method_types: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundObject {
    pub id: String,
    #[serde(default)]
    pub amount: i64,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub status: String,
    pub payment_intent: Option<Expandable>,
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Event dispatched on by the payment service
#[derive(Debug, Clone)]
pub enum WebhookEvent {
    PaymentIntentSucceeded(PaymentIntentObject),
    PaymentIntentFailed(PaymentIntentObject),
    CheckoutSessionCompleted(CheckoutSessionObject),
    CheckoutSessionExpired(CheckoutSessionObject),
    RefundUpdated(RefundObject),
    /// Forward-compatible no-op
    Unrecognized,
}

fn metadata_value<'a>(metadata: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    metadata
        .get(key)
        .map(String::as_str)
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

impl WebhookEvent {
    /// The local order id carried in the object's metadata, if any
    pub fn order_id(&self) -> Option<&str> {
        let metadata = self.metadata()?;
        metadata_value(metadata, ORDER_ID_KEY)
    }

    fn metadata(&self) -> Option<&HashMap<String, String>> {
        match self {
            WebhookEvent::PaymentIntentSucceeded(pi) | WebhookEvent::PaymentIntentFailed(pi) => {
                Some(&pi.metadata)
            }
            WebhookEvent::CheckoutSessionCompleted(s) | WebhookEvent::CheckoutSessionExpired(s) => {
                Some(&s.metadata)
            }
            WebhookEvent::RefundUpdated(r) => Some(&r.metadata),
            WebhookEvent::Unrecognized => None,
        }
    }
}

impl GatewayEvent {
    pub fn parse(payload: &[u8]) -> Result<Self, ServiceError> {
        serde_json::from_slice(payload)
            .map_err(|e| ServiceError::BadRequest(format!("invalid webhook payload: {}", e)))
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.created, 0)
            .single()
            .unwrap_or_else(Utc::now)
    }

    /// Decodes `data.object` according to the event type
    pub fn classify(&self) -> Result<WebhookEvent, ServiceError> {
        let event = match self.event_type.as_str() {
            PAYMENT_INTENT_SUCCEEDED => WebhookEvent::PaymentIntentSucceeded(self.object()?),
            PAYMENT_INTENT_FAILED => WebhookEvent::PaymentIntentFailed(self.object()?),
            CHECKOUT_SESSION_COMPLETED => WebhookEvent::CheckoutSessionCompleted(self.object()?),
            CHECKOUT_SESSION_EXPIRED => WebhookEvent::CheckoutSessionExpired(self.object()?),
            REFUND_UPDATED | CHARGE_REFUND_UPDATED => WebhookEvent::RefundUpdated(self.object()?),
            _ => WebhookEvent::Unrecognized,
        };
        Ok(event)
    }

    fn object<T: serde::de::DeserializeOwned>(&self) -> Result<T, ServiceError> {
        serde_json::from_value(self.data.object.clone()).map_err(|e| {
            ServiceError::BadRequest(format!(
                "invalid {} object in event {}: {}",
                self.event_type, self.id, e
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn envelope(event_type: &str, object: Value) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "id": "evt_1",
            "object": "event",
            "type": event_type,
            "created": 1_700_000_000,
            "livemode": false,
            "data": { "object": object }
        }))
        .unwrap()
    }

    #[test]
    fn classifies_payment_intent_succeeded() {
        let payload = envelope(
            PAYMENT_INTENT_SUCCEEDED,
            json!({
                "id": "pi_1",
                "object": "payment_intent",
                "amount": 4999,
                "amount_received": 4999,
                "currency": "usd",
                "payment_method": "pm_card_visa",
                "payment_method_types": ["card"],
                "metadata": { "orderId": "ORD-1", "userId": "user-9" }
            }),
        );
        let event = GatewayEvent::parse(&payload).unwrap();
        let classified = event.classify().unwrap();
        assert_eq!(classified.order_id(), Some("ORD-1"));
        assert_matches!(classified, WebhookEvent::PaymentIntentSucceeded(pi) => {
            assert_eq!(pi.payment_method().as_deref(), Some("pm_card_visa"));
        });
        assert_eq!(event.created_at().timestamp(), 1_700_000_000);
    }

    #[test]
    fn expanded_payment_intent_on_session() {
        let payload = envelope(
            CHECKOUT_SESSION_COMPLETED,
            json!({
                "id": "cs_1",
                "amount_total": 8999,
                "currency": "usd",
                "payment_intent": { "id": "pi_123", "object": "payment_intent" },
                "metadata": {}
            }),
        );
        let classified = GatewayEvent::parse(&payload).unwrap().classify().unwrap();
        assert_eq!(classified.order_id(), None);
        assert_matches!(classified, WebhookEvent::CheckoutSessionCompleted(s) => {
            assert_eq!(s.payment_intent.unwrap().id(), "pi_123");
        });
    }

    #[test]
    fn unknown_types_are_unrecognized() {
        let payload = envelope("customer.created", json!({ "id": "cus_1" }));
        let classified = GatewayEvent::parse(&payload).unwrap().classify().unwrap();
        assert_matches!(classified, WebhookEvent::Unrecognized);
    }

    #[test]
    fn failed_intent_falls_back_to_generic_message() {
        let pi: PaymentIntentObject =
            serde_json::from_value(json!({ "id": "pi_2", "last_payment_error": null })).unwrap();
        assert_eq!(pi.error_message(), "Payment failed");
        assert_eq!(pi.payment_method(), None);
    }

    #[test]
    fn malformed_payload_is_bad_request() {
        assert_matches!(
            GatewayEvent::parse(b"not json"),
            Err(ServiceError::BadRequest(_))
        );
        let payload = envelope(PAYMENT_INTENT_SUCCEEDED, json!({ "amount": 10 }));
        assert_matches!(
            GatewayEvent::parse(&payload).unwrap().classify(),
            Err(ServiceError::BadRequest(_))
        );
    }
}
