use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::errors::ServiceError;

/// Parameters for a new payment intent; `amount` is already in minor units
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentIntentParams {
    pub amount: i64,
    pub currency: String,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatedPaymentIntent {
    pub id: String,
    pub client_secret: Option<String>,
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CheckoutLineItem {
    pub name: String,
    pub description: Option<String>,
    pub images: Vec<String>,
    /// Unit price in minor units
    pub unit_amount: i64,
    pub quantity: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CheckoutSessionParams {
    pub currency: String,
    pub line_items: Vec<CheckoutLineItem>,
    pub success_url: String,
    pub cancel_url: String,
    /// Local order id, echoed back as `client_reference_id`
    pub client_reference_id: String,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatedCheckoutSession {
    pub id: String,
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RefundParams {
    pub payment_intent_id: String,
    /// Minor units; `None` refunds the full captured amount
    pub amount: Option<i64>,
    pub reason: Option<String>,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatedRefund {
    pub id: String,
    #[serde(default)]
    pub amount: i64,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub status: String,
}

/// Outbound calls to the hosted payment processor.
///
/// Implementations map transport and API errors to
/// [`ServiceError::UpstreamFailure`]; callers never retry locally.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_payment_intent(
        &self,
        params: PaymentIntentParams,
    ) -> Result<CreatedPaymentIntent, ServiceError>;

    async fn create_checkout_session(
        &self,
        params: CheckoutSessionParams,
    ) -> Result<CreatedCheckoutSession, ServiceError>;

    async fn create_refund(&self, params: RefundParams) -> Result<CreatedRefund, ServiceError>;
}
