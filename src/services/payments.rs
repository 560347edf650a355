//! Order/payment reconciliation against the hosted payment gateway.
//!
//! Client-initiated calls only ever put an order into `PENDING`; every other
//! payment status is reached exclusively through a verified webhook event or
//! an explicit refund call.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use strum::Display;
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;
use validator::Validate;

use crate::cache::CacheService;
use crate::entities::order::Model as OrderModel;
use crate::errors::ServiceError;
use crate::metrics::{
    record_webhook_event, CHECKOUT_SESSIONS_CREATED, PAYMENT_INTENTS_CREATED, REFUNDS,
    WEBHOOK_DEAD_LETTERS,
};
use crate::notifications::{PaymentNotification, PaymentNotificationKind, PaymentNotifier};
use crate::payments::amount::{ensure_positive, from_minor_units, to_minor_units};
use crate::payments::events::{
    CheckoutSessionObject, GatewayEvent, PaymentIntentObject, RefundObject, WebhookEvent,
    ORDER_ID_KEY, USER_ID_KEY,
};
use crate::payments::{
    CheckoutLineItem, CheckoutSessionParams, PaymentGateway, PaymentIntentParams, PaymentStatus,
    RefundParams, RefundStatus, WebhookVerifier, ORDER_STATUS_PROCESSING,
};
use crate::repositories::{
    DeadLetterSink, NewDeadLetter, OrderPaymentUpdate, OrderStore, ProductCatalog,
};

#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct CreatePaymentIntentRequest {
    /// Amount in major currency units, e.g. `49.99`
    #[schema(value_type = f64, example = 49.99)]
    pub amount: Decimal,
    /// ISO currency code; the configured default when omitted
    #[validate(length(equal = 3))]
    pub currency: Option<String>,
    #[validate(length(min = 1))]
    pub order_id: String,
    #[validate(length(min = 1))]
    pub user_id: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct PaymentIntentResponse {
    pub client_secret: Option<String>,
    pub payment_intent_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct CheckoutItem {
    #[validate(length(min = 1))]
    pub product_id: String,
    #[validate(range(min = 1, max = 1000))]
    pub quantity: u32,
}

#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct CreateCheckoutSessionRequest {
    #[validate(length(min = 1))]
    pub order_id: String,
    #[validate(length(min = 1))]
    pub user_id: String,
    #[validate(length(min = 1))]
    pub items: Vec<CheckoutItem>,
    #[validate(url)]
    pub success_url: String,
    #[validate(url)]
    pub cancel_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct CheckoutSessionResponse {
    pub session_id: String,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct RefundRequest {
    /// Partial refund amount in major units; omitted refunds everything
    #[schema(value_type = Option<f64>)]
    pub amount: Option<Decimal>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct RefundRecord {
    pub refund_id: String,
    pub order_id: String,
    pub payment_intent_id: String,
    #[schema(value_type = f64)]
    pub amount: Decimal,
    pub currency: String,
    /// Status reported by the gateway, e.g. `succeeded` or `pending`
    pub gateway_status: String,
    pub refund_status: RefundStatus,
}

/// Acknowledgement returned to the gateway once an event has been handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct WebhookAck {
    pub received: bool,
}

/// What a verified webhook event did to local state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum WebhookOutcome {
    Applied,
    /// Transition not allowed from the current state (duplicate or regression)
    Skipped,
    /// Older than the last event applied to the order
    Stale,
    /// Failure or expiry of an attempt the order has since replaced
    Superseded,
    DeadLettered,
    Ignored,
}

pub struct PaymentService {
    gateway: Option<Arc<dyn PaymentGateway>>,
    verifier: Option<WebhookVerifier>,
    orders: Arc<dyn OrderStore>,
    catalog: Arc<dyn ProductCatalog>,
    dead_letters: Arc<dyn DeadLetterSink>,
    notifier: Arc<dyn PaymentNotifier>,
    cache: CacheService,
    default_currency: String,
}

pub fn order_tag(order_id: &str) -> String {
    format!("order:{}", order_id)
}

pub fn user_orders_tag(user_id: &str) -> String {
    format!("user:{}:orders", user_id)
}

fn major_units_json(amount: Decimal) -> Value {
    amount
        .to_f64()
        .map(|a| json!(a))
        .unwrap_or_else(|| json!(amount.to_string()))
}

impl PaymentService {
    pub fn new(
        orders: Arc<dyn OrderStore>,
        catalog: Arc<dyn ProductCatalog>,
        dead_letters: Arc<dyn DeadLetterSink>,
        notifier: Arc<dyn PaymentNotifier>,
        cache: CacheService,
    ) -> Self {
        Self {
            gateway: None,
            verifier: None,
            orders,
            catalog,
            dead_letters,
            notifier,
            cache,
            default_currency: "usd".to_string(),
        }
    }

    pub fn with_gateway(mut self, gateway: Arc<dyn PaymentGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn with_webhook_verifier(mut self, verifier: WebhookVerifier) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn with_default_currency(mut self, currency: impl Into<String>) -> Self {
        self.default_currency = currency.into().to_lowercase();
        self
    }

    /// True iff a gateway secret key was supplied at startup
    pub fn is_configured(&self) -> bool {
        self.gateway.is_some()
    }

    fn gateway(&self) -> Result<&Arc<dyn PaymentGateway>, ServiceError> {
        self.gateway
            .as_ref()
            .ok_or_else(|| ServiceError::NotConfigured("payment gateway".to_string()))
    }

    async fn order_for_new_attempt(&self, order_id: &str) -> Result<OrderModel, ServiceError> {
        let order = self
            .orders
            .find_by_id(order_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("order {}", order_id)))?;

        let status = order.payment_status()?;
        if !status.accepts_new_attempt() {
            return Err(ServiceError::Conflict(format!(
                "order {} is already {}",
                order_id, status
            )));
        }
        Ok(order)
    }

    fn correlation_metadata(
        extra: &HashMap<String, String>,
        order_id: &str,
        user_id: &str,
    ) -> HashMap<String, String> {
        let mut metadata = extra.clone();
        metadata.insert(ORDER_ID_KEY.to_string(), order_id.to_string());
        metadata.insert(USER_ID_KEY.to_string(), user_id.to_string());
        metadata
    }

    /// Creates a gateway payment intent and marks the order `PENDING`
    #[instrument(skip(self, request), fields(order_id = %request.order_id))]
    pub async fn create_payment_intent(
        &self,
        request: CreatePaymentIntentRequest,
    ) -> Result<PaymentIntentResponse, ServiceError> {
        let gateway = self.gateway()?;
        request.validate()?;
        ensure_positive(request.amount)?;

        let order = self.order_for_new_attempt(&request.order_id).await?;
        let currency = request
            .currency
            .as_deref()
            .unwrap_or(&self.default_currency)
            .to_lowercase();

        let intent = gateway
            .create_payment_intent(PaymentIntentParams {
                amount: to_minor_units(request.amount)?,
                currency,
                metadata: Self::correlation_metadata(
                    &request.metadata,
                    &request.order_id,
                    &request.user_id,
                ),
            })
            .await
            .map_err(|e| {
                error!(error = %e, "failed to create payment intent");
                e
            })?;

        self.orders
            .update_fields(
                &order.id,
                order.version,
                OrderPaymentUpdate {
                    payment_status: Some(PaymentStatus::Pending),
                    payment_intent_id: Some(Some(intent.id.clone())),
                    checkout_session_id: Some(None),
                    ..Default::default()
                },
            )
            .await?;

        PAYMENT_INTENTS_CREATED.inc();
        self.invalidate_order_caches(&order.id, &order.user_id).await;
        info!(payment_intent_id = %intent.id, "payment intent created");

        Ok(PaymentIntentResponse {
            client_secret: intent.client_secret,
            payment_intent_id: intent.id,
        })
    }

    /// Creates a hosted checkout session priced from the product catalog
    #[instrument(skip(self, request), fields(order_id = %request.order_id))]
    pub async fn create_checkout_session(
        &self,
        request: CreateCheckoutSessionRequest,
    ) -> Result<CheckoutSessionResponse, ServiceError> {
        let gateway = self.gateway()?;
        request.validate()?;

        let mut line_items = Vec::with_capacity(request.items.len());
        for item in &request.items {
            item.validate()?;
            let product = self
                .catalog
                .find_by_id(&item.product_id)
                .await?
                .ok_or_else(|| ServiceError::NotFound(format!("product {}", item.product_id)))?;

            line_items.push(CheckoutLineItem {
                unit_amount: to_minor_units(product.price)?,
                images: product.image_urls(),
                name: product.name,
                description: product.description,
                quantity: item.quantity,
            });
        }

        let order = self.order_for_new_attempt(&request.order_id).await?;
        let currency = if order.currency.trim().is_empty() {
            self.default_currency.clone()
        } else {
            order.currency.to_lowercase()
        };

        let session = gateway
            .create_checkout_session(CheckoutSessionParams {
                currency,
                line_items,
                success_url: request.success_url.clone(),
                cancel_url: request.cancel_url.clone(),
                client_reference_id: request.order_id.clone(),
                metadata: Self::correlation_metadata(
                    &HashMap::new(),
                    &request.order_id,
                    &request.user_id,
                ),
            })
            .await
            .map_err(|e| {
                error!(error = %e, "failed to create checkout session");
                e
            })?;

        self.orders
            .update_fields(
                &order.id,
                order.version,
                OrderPaymentUpdate {
                    payment_status: Some(PaymentStatus::Pending),
                    checkout_session_id: Some(Some(session.id.clone())),
                    payment_intent_id: Some(None),
                    ..Default::default()
                },
            )
            .await?;

        CHECKOUT_SESSIONS_CREATED.inc();
        self.invalidate_order_caches(&order.id, &order.user_id).await;
        info!(session_id = %session.id, "checkout session created");

        Ok(CheckoutSessionResponse {
            session_id: session.id,
            url: session.url,
        })
    }

    /// Verifies and applies one gateway webhook delivery.
    ///
    /// Errors mean the event was not durably handled; the HTTP layer answers
    /// non-2xx so the gateway redelivers it.
    pub async fn handle_webhook(
        &self,
        signature: Option<&str>,
        payload: &[u8],
    ) -> Result<WebhookAck, ServiceError> {
        let verifier = self
            .verifier
            .as_ref()
            .ok_or_else(|| ServiceError::NotConfigured("webhook signing secret".to_string()))?;

        if let Err(e) = verifier.verify(signature.unwrap_or_default(), payload) {
            warn!(error = %e, "webhook signature verification failed");
            record_webhook_event("unknown", "invalid_signature");
            return Err(e.into());
        }

        let event = GatewayEvent::parse(payload)?;
        let result = match event.classify() {
            Ok(classified) => self.apply_event(&event, classified).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(outcome) => {
                info!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    %outcome,
                    "webhook event handled"
                );
                record_webhook_event(&event.event_type, &outcome.to_string());
                Ok(WebhookAck { received: true })
            }
            Err(e) => {
                error!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    error = %e,
                    "webhook event could not be applied"
                );
                record_webhook_event(&event.event_type, "error");
                Err(e)
            }
        }
    }

    async fn apply_event(
        &self,
        event: &GatewayEvent,
        classified: WebhookEvent,
    ) -> Result<WebhookOutcome, ServiceError> {
        if let WebhookEvent::Unrecognized = classified {
            info!(event_type = %event.event_type, "ignoring unhandled webhook event type");
            return Ok(WebhookOutcome::Ignored);
        }

        let order = match &classified {
            WebhookEvent::RefundUpdated(refund) => {
                self.locate_refund_order(event, classified.order_id(), refund)
                    .await?
            }
            _ => self.locate_order(event, classified.order_id()).await?,
        };
        let Some(order) = order else {
            return Ok(WebhookOutcome::DeadLettered);
        };

        match classified {
            WebhookEvent::PaymentIntentSucceeded(intent) => {
                self.on_payment_intent_succeeded(event, order, intent).await
            }
            WebhookEvent::PaymentIntentFailed(intent) => {
                self.on_payment_intent_failed(event, order, intent).await
            }
            WebhookEvent::CheckoutSessionCompleted(session) => {
                self.on_checkout_session_completed(event, order, session)
                    .await
            }
            WebhookEvent::CheckoutSessionExpired(session) => {
                self.on_checkout_session_expired(event, order, session)
                    .await
            }
            WebhookEvent::RefundUpdated(refund) => self.on_refund_updated(event, order, refund).await,
            WebhookEvent::Unrecognized => Ok(WebhookOutcome::Ignored),
        }
    }

    /// Finds the order named by the event, dead-lettering the event otherwise
    async fn locate_order(
        &self,
        event: &GatewayEvent,
        order_id: Option<&str>,
    ) -> Result<Option<OrderModel>, ServiceError> {
        let Some(order_id) = order_id else {
            self.dead_letter(event, None, "event metadata has no orderId")
                .await?;
            return Ok(None);
        };

        match self.orders.find_by_id(order_id).await? {
            Some(order) => Ok(Some(order)),
            None => {
                self.dead_letter(event, Some(order_id), "no order matches the event orderId")
                    .await?;
                Ok(None)
            }
        }
    }

    /// Refund events may lack our metadata; fall back to the payment intent
    async fn locate_refund_order(
        &self,
        event: &GatewayEvent,
        order_id: Option<&str>,
        refund: &RefundObject,
    ) -> Result<Option<OrderModel>, ServiceError> {
        if order_id.is_some() {
            return self.locate_order(event, order_id).await;
        }

        if let Some(intent) = &refund.payment_intent {
            if let Some(order) = self.orders.find_by_payment_intent(intent.id()).await? {
                return Ok(Some(order));
            }
        }

        self.dead_letter(event, None, "refund matches no order by orderId or payment intent")
            .await?;
        Ok(None)
    }

    async fn dead_letter(
        &self,
        event: &GatewayEvent,
        order_id: Option<&str>,
        reason: &str,
    ) -> Result<(), ServiceError> {
        self.dead_letters
            .record(NewDeadLetter {
                event_id: event.id.clone(),
                event_type: event.event_type.clone(),
                order_id: order_id.map(str::to_string),
                reason: reason.to_string(),
                payload: serde_json::to_value(event)?,
            })
            .await?;
        WEBHOOK_DEAD_LETTERS.inc();
        Ok(())
    }

    async fn on_payment_intent_succeeded(
        &self,
        event: &GatewayEvent,
        order: OrderModel,
        intent: PaymentIntentObject,
    ) -> Result<WebhookOutcome, ServiceError> {
        let amount = from_minor_units(intent.amount_received.unwrap_or(intent.amount));
        let payment_method = intent.payment_method();
        let currency = intent.currency.to_lowercase();

        let update = OrderPaymentUpdate {
            status: Some(ORDER_STATUS_PROCESSING.to_string()),
            payment_intent_id: Some(Some(intent.id.clone())),
            payment_method: payment_method.clone(),
            payment_details: Some(json!({
                "paymentIntentId": intent.id,
                "amount": major_units_json(amount),
                "currency": currency,
                "paymentMethod": payment_method,
                "eventId": event.id,
                "paidAt": event.created_at().to_rfc3339(),
            })),
            ..Default::default()
        };

        let notification =
            PaymentNotification::new(&order.id, &order.user_id, PaymentNotificationKind::PaymentCompleted)
                .with_amount(amount, currency);
        self.confirm_payment(event, order, Some(&intent.id), None, update, notification)
            .await
    }

    async fn on_payment_intent_failed(
        &self,
        event: &GatewayEvent,
        order: OrderModel,
        intent: PaymentIntentObject,
    ) -> Result<WebhookOutcome, ServiceError> {
        if let Some(current) = order.payment_intent_id.as_deref() {
            if current != intent.id {
                info!(
                    order_id = %order.id,
                    payment_intent_id = %intent.id,
                    current_payment_intent_id = %current,
                    "ignoring failure of a replaced payment intent"
                );
                return Ok(WebhookOutcome::Superseded);
            }
        }

        let update = OrderPaymentUpdate {
            payment_details: Some(json!({
                "paymentIntentId": intent.id,
                "error": intent.error_message(),
                "errorCode": intent.last_payment_error.as_ref().and_then(|e| e.code.clone()),
                "eventId": event.id,
                "failedAt": event.created_at().to_rfc3339(),
            })),
            ..Default::default()
        };

        let notification =
            PaymentNotification::new(&order.id, &order.user_id, PaymentNotificationKind::PaymentFailed);
        self.transition(event, order, PaymentStatus::Failed, update, notification)
            .await
    }

    async fn on_checkout_session_completed(
        &self,
        event: &GatewayEvent,
        order: OrderModel,
        session: CheckoutSessionObject,
    ) -> Result<WebhookOutcome, ServiceError> {
        let amount = from_minor_units(session.amount_total.unwrap_or_default());
        let currency = session
            .currency
            .clone()
            .unwrap_or_else(|| order.currency.clone())
            .to_lowercase();
        let payment_intent_id = session.payment_intent.as_ref().map(|pi| pi.id().to_string());
        let payment_method = session.payment_method_types.first().cloned();

        let update = OrderPaymentUpdate {
            status: Some(ORDER_STATUS_PROCESSING.to_string()),
            payment_intent_id: payment_intent_id.clone().map(Some),
            payment_method: payment_method.clone(),
            payment_details: Some(json!({
                "checkoutSessionId": session.id,
                "paymentIntentId": payment_intent_id,
                "amount": major_units_json(amount),
                "currency": currency,
                "paymentMethod": payment_method,
                "paymentStatus": session.payment_status,
                "eventId": event.id,
                "paidAt": event.created_at().to_rfc3339(),
            })),
            ..Default::default()
        };

        let notification =
            PaymentNotification::new(&order.id, &order.user_id, PaymentNotificationKind::PaymentCompleted)
                .with_amount(amount, currency);
        self.confirm_payment(
            event,
            order,
            payment_intent_id.as_deref(),
            Some(&session.id),
            update,
            notification,
        )
        .await
    }

    async fn on_checkout_session_expired(
        &self,
        event: &GatewayEvent,
        order: OrderModel,
        session: CheckoutSessionObject,
    ) -> Result<WebhookOutcome, ServiceError> {
        // A session is replaced by a newer session or by a direct intent
        let replaced = match order.checkout_session_id.as_deref() {
            Some(current) => current != session.id,
            None => order.payment_intent_id.is_some(),
        };
        if replaced {
            info!(
                order_id = %order.id,
                checkout_session_id = %session.id,
                "ignoring expiry of a replaced checkout session"
            );
            return Ok(WebhookOutcome::Superseded);
        }

        let update = OrderPaymentUpdate {
            payment_details: Some(json!({
                "checkoutSessionId": session.id,
                "eventId": event.id,
                "expiredAt": event.created_at().to_rfc3339(),
            })),
            ..Default::default()
        };

        let notification =
            PaymentNotification::new(&order.id, &order.user_id, PaymentNotificationKind::PaymentExpired);
        self.transition(event, order, PaymentStatus::Expired, update, notification)
            .await
    }

    async fn on_refund_updated(
        &self,
        event: &GatewayEvent,
        order: OrderModel,
        refund: RefundObject,
    ) -> Result<WebhookOutcome, ServiceError> {
        let refund_status = RefundStatus::from_gateway(&refund.status);
        let amount = from_minor_units(refund.amount);
        let currency = refund.currency.to_lowercase();

        let update = OrderPaymentUpdate {
            refund_status: Some(refund_status),
            refund_details: Some(json!({
                "refundId": refund.id,
                "amount": major_units_json(amount),
                "currency": currency,
                "status": refund.status,
                "failureReason": refund.failure_reason,
                "eventId": event.id,
                "updatedAt": event.created_at().to_rfc3339(),
            })),
            ..Default::default()
        };

        let kind = match refund_status {
            RefundStatus::Refunded => PaymentNotificationKind::Refunded,
            RefundStatus::RefundPending => PaymentNotificationKind::RefundPending,
            RefundStatus::Failed => PaymentNotificationKind::RefundFailed,
        };
        let notification =
            PaymentNotification::new(&order.id, &order.user_id, kind).with_amount(amount, currency);
        self.transition(
            event,
            order,
            refund_status.payment_status(),
            update,
            notification,
        )
        .await
    }

    /// Applies a confirmed payment, dead-lettering it when the order cannot
    /// take it and it is not the payment already recorded on the order.
    async fn confirm_payment(
        &self,
        event: &GatewayEvent,
        order: OrderModel,
        payment_intent_id: Option<&str>,
        checkout_session_id: Option<&str>,
        update: OrderPaymentUpdate,
        notification: PaymentNotification,
    ) -> Result<WebhookOutcome, ServiceError> {
        let already_recorded = matches!(
            (payment_intent_id, order.payment_intent_id.as_deref()),
            (Some(a), Some(b)) if a == b
        ) || matches!(
            (checkout_session_id, order.checkout_session_id.as_deref()),
            (Some(a), Some(b)) if a == b
        );
        let order_id = order.id.clone();

        let outcome = self
            .transition(event, order, PaymentStatus::Completed, update, notification)
            .await?;
        match outcome {
            WebhookOutcome::Skipped | WebhookOutcome::Stale if !already_recorded => {
                warn!(
                    order_id = %order_id,
                    event_id = %event.id,
                    "confirmed payment does not match the order's recorded payment"
                );
                self.dead_letter(
                    event,
                    Some(&order_id),
                    "confirmed payment could not be applied to the order",
                )
                .await?;
                Ok(WebhookOutcome::DeadLettered)
            }
            other => Ok(other),
        }
    }

    /// Applies a gateway-confirmed transition with a version check.
    ///
    /// Events older than the last applied one, and transitions the status
    /// machine does not allow, are acknowledged without touching the order.
    async fn transition(
        &self,
        event: &GatewayEvent,
        order: OrderModel,
        next: PaymentStatus,
        mut update: OrderPaymentUpdate,
        notification: PaymentNotification,
    ) -> Result<WebhookOutcome, ServiceError> {
        let current = order.payment_status()?;
        let created_at: DateTime<Utc> = event.created_at();

        if let Some(last) = order.last_payment_event_at {
            if created_at < last {
                info!(
                    order_id = %order.id,
                    event_created = %created_at,
                    last_applied = %last,
                    "ignoring stale payment event"
                );
                return Ok(WebhookOutcome::Stale);
            }
        }

        if !current.can_transition_to(next) {
            info!(
                order_id = %order.id,
                from = %current,
                to = %next,
                "payment event does not apply to current order state"
            );
            return Ok(WebhookOutcome::Skipped);
        }

        update.payment_status = Some(next);
        update.last_payment_event_at = Some(created_at);

        let updated = self
            .orders
            .update_fields(&order.id, order.version, update)
            .await
            .map_err(|e| {
                error!(order_id = %order.id, error = %e, "failed to persist payment transition");
                e
            })?;

        info!(order_id = %updated.id, from = %current, to = %next, "order payment status updated");
        self.after_transition(&updated, notification).await;
        Ok(WebhookOutcome::Applied)
    }

    async fn after_transition(&self, order: &OrderModel, notification: PaymentNotification) {
        if let Err(e) = self.notifier.notify(notification).await {
            warn!(order_id = %order.id, error = %e, "payment notification failed");
        }
        self.invalidate_order_caches(&order.id, &order.user_id).await;
    }

    async fn invalidate_order_caches(&self, order_id: &str, user_id: &str) {
        self.cache.invalidate_tag(&order_tag(order_id)).await;
        if !user_id.is_empty() {
            self.cache.invalidate_tag(&user_orders_tag(user_id)).await;
        }
    }

    /// Refunds a completed order, fully when `amount` is omitted
    #[instrument(skip(self, request))]
    pub async fn refund_payment(
        &self,
        order_id: &str,
        request: RefundRequest,
    ) -> Result<RefundRecord, ServiceError> {
        let gateway = self.gateway()?;

        let order = self
            .orders
            .find_by_id(order_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("order {}", order_id)))?;
        let payment_intent_id = order.refundable_payment_intent().ok_or_else(|| {
            ServiceError::NotFound(format!("payment intent for order {}", order_id))
        })?;

        let current = order.payment_status()?;
        if current != PaymentStatus::Completed {
            return Err(ServiceError::Conflict(format!(
                "order {} cannot be refunded while {}",
                order_id, current
            )));
        }

        let amount = match request.amount {
            Some(amount) => {
                ensure_positive(amount)?;
                Some(to_minor_units(amount)?)
            }
            None => None,
        };

        let refund = gateway
            .create_refund(RefundParams {
                payment_intent_id: payment_intent_id.clone(),
                amount,
                reason: request.reason.clone(),
                metadata: Self::correlation_metadata(&HashMap::new(), &order.id, &order.user_id),
            })
            .await
            .map_err(|e| {
                error!(error = %e, "failed to create refund");
                e
            })?;
        REFUNDS.with_label_values(&[refund.status.as_str()]).inc();

        let refund_status = if refund.status == "succeeded" {
            RefundStatus::Refunded
        } else {
            RefundStatus::RefundPending
        };
        let refunded = from_minor_units(refund.amount);
        let currency = if refund.currency.is_empty() {
            order.currency.to_lowercase()
        } else {
            refund.currency.to_lowercase()
        };

        let update = OrderPaymentUpdate {
            payment_status: Some(refund_status.payment_status()),
            refund_status: Some(refund_status),
            refund_details: Some(json!({
                "refundId": refund.id,
                "amount": major_units_json(refunded),
                "currency": currency,
                "status": refund.status,
                "reason": request.reason,
                "requestedAt": Utc::now().to_rfc3339(),
            })),
            ..Default::default()
        };
        let updated = self
            .orders
            .update_fields(&order.id, order.version, update)
            .await
            .map_err(|e| {
                // The refund exists at the gateway; its webhook reconciles the order
                error!(order_id = %order.id, refund_id = %refund.id, error = %e, "failed to record refund");
                e
            })?;

        let kind = match refund_status {
            RefundStatus::Refunded => PaymentNotificationKind::Refunded,
            _ => PaymentNotificationKind::RefundPending,
        };
        self.after_transition(
            &updated,
            PaymentNotification::new(&updated.id, &updated.user_id, kind)
                .with_amount(refunded, currency.clone()),
        )
        .await;

        info!(refund_id = %refund.id, status = %refund_status, "refund recorded");
        Ok(RefundRecord {
            refund_id: refund.id,
            order_id: updated.id,
            payment_intent_id,
            amount: refunded,
            currency,
            gateway_status: refund.status,
            refund_status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCacheBackend;
    use crate::entities::product::Model as ProductModel;
    use crate::notifications::NotificationError;
    use crate::payments::{
        CreatedCheckoutSession, CreatedPaymentIntent, CreatedRefund, PaymentIntentParams,
    };
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use mockall::mock;
    use rust_decimal_macros::dec;
    use std::sync::Mutex;
    use std::time::Duration;

    const SECRET: &str = "whsec_unit";

    mock! {
        pub Gateway {}

        #[async_trait]
        impl PaymentGateway for Gateway {
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
    }

    /// Order store with the same compare-and-set semantics as the database
    #[derive(Default)]
    struct MemoryOrders {
        rows: Mutex<HashMap<String, OrderModel>>,
        conflict_on_write: bool,
    }

    #[async_trait]
    impl OrderStore for MemoryOrders {
        async fn find_by_id(&self, id: &str) -> Result<Option<OrderModel>, ServiceError> {
            Ok(self.rows.lock().unwrap().get(id).cloned())
        }

        async fn find_by_payment_intent(
            &self,
            payment_intent_id: &str,
        ) -> Result<Option<OrderModel>, ServiceError> {
            Ok(self
                .rows
                .lock()
                .unwrap()
                .values()
                .find(|o| o.payment_intent_id.as_deref() == Some(payment_intent_id))
                .cloned())
        }

        async fn update_fields(
            &self,
            id: &str,
            expected_version: i32,
            update: OrderPaymentUpdate,
        ) -> Result<OrderModel, ServiceError> {
            if self.conflict_on_write {
                return Err(ServiceError::ConcurrentModification(id.to_string()));
            }
            let mut rows = self.rows.lock().unwrap();
            let row = rows
                .get_mut(id)
                .ok_or_else(|| ServiceError::NotFound(id.to_string()))?;
            if row.version != expected_version {
                return Err(ServiceError::ConcurrentModification(id.to_string()));
            }
            if let Some(v) = update.status {
                row.status = v;
            }
            if let Some(v) = update.payment_status {
                row.payment_status = v.to_string();
            }
            if let Some(v) = update.refund_status {
                row.refund_status = Some(v.to_string());
            }
            if let Some(v) = update.payment_intent_id {
                row.payment_intent_id = v;
            }
            if let Some(v) = update.checkout_session_id {
                row.checkout_session_id = v;
            }
            if let Some(v) = update.payment_method {
                row.payment_method = Some(v);
            }
            if let Some(v) = update.payment_details {
                row.payment_details = Some(v);
            }
            if let Some(v) = update.refund_details {
                row.refund_details = Some(v);
            }
            if let Some(v) = update.last_payment_event_at {
                row.last_payment_event_at = Some(v);
            }
            row.version += 1;
            Ok(row.clone())
        }
    }

    struct NoProducts;

    #[async_trait]
    impl ProductCatalog for NoProducts {
        async fn find_by_id(&self, _: &str) -> Result<Option<ProductModel>, ServiceError> {
            Ok(None)
        }
    }

    #[derive(Default)]
    struct Letters {
        recorded: Mutex<Vec<NewDeadLetter>>,
        fail: bool,
    }

    #[async_trait]
    impl DeadLetterSink for Letters {
        async fn record(&self, letter: NewDeadLetter) -> Result<(), ServiceError> {
            if self.fail {
                return Err(ServiceError::DatabaseError(sea_orm::DbErr::Custom(
                    "disk full".into(),
                )));
            }
            self.recorded.lock().unwrap().push(letter);
            Ok(())
        }
    }

    struct BrokenNotifier;

    #[async_trait]
    impl PaymentNotifier for BrokenNotifier {
        async fn notify(&self, _: PaymentNotification) -> Result<(), NotificationError> {
            Err(NotificationError::Delivery("smtp down".into()))
        }
    }

    fn order(id: &str) -> OrderModel {
        OrderModel {
            id: id.to_string(),
            user_id: "user-1".into(),
            status: "PENDING".into(),
            total_amount: dec!(49.99),
            currency: "usd".into(),
            payment_status: "PENDING".into(),
            refund_status: None,
            payment_intent_id: Some("pi_old".into()),
            checkout_session_id: None,
            payment_method: None,
            payment_details: None,
            refund_details: None,
            last_payment_event_at: None,
            created_at: Utc::now(),
            updated_at: None,
            version: 1,
        }
    }

    fn store_with(orders: &[&str]) -> Arc<MemoryOrders> {
        let store = MemoryOrders::default();
        for id in orders {
            store.rows.lock().unwrap().insert(id.to_string(), order(id));
        }
        Arc::new(store)
    }

    fn service(orders: Arc<dyn OrderStore>, letters: Arc<Letters>) -> PaymentService {
        PaymentService::new(
            orders,
            Arc::new(NoProducts),
            letters,
            Arc::new(BrokenNotifier),
            CacheService::new(Arc::new(InMemoryCacheBackend::new())),
        )
        .with_webhook_verifier(WebhookVerifier::new(SECRET, Duration::from_secs(300)))
    }

    fn signed(object: Value, event_type: &str) -> (String, Vec<u8>) {
        let payload = serde_json::to_vec(&json!({
            "id": "evt_1",
            "type": event_type,
            "created": 1_700_000_000,
            "data": { "object": object }
        }))
        .unwrap();
        let header = WebhookVerifier::new(SECRET, Duration::from_secs(300))
            .header_for(Utc::now().timestamp(), &payload);
        (header, payload)
    }

    fn succeeded(order_id: &str) -> Value {
        json!({
            "id": "pi_1",
            "amount": 4999,
            "currency": "usd",
            "metadata": { "orderId": order_id }
        })
    }

    #[tokio::test]
    async fn webhook_without_secret_is_not_configured() {
        let svc = PaymentService::new(
            store_with(&[]),
            Arc::new(NoProducts),
            Arc::new(Letters::default()),
            Arc::new(BrokenNotifier),
            CacheService::disabled(),
        );
        let result = svc.handle_webhook(Some("t=1,v1=00"), b"{}").await;
        assert_matches!(result, Err(ServiceError::NotConfigured(_)));
    }

    #[tokio::test]
    async fn version_conflict_is_not_acknowledged() {
        let store = Arc::new(MemoryOrders {
            conflict_on_write: true,
            ..Default::default()
        });
        store
            .rows
            .lock()
            .unwrap()
            .insert("ORD-1".into(), order("ORD-1"));
        let svc = service(store, Arc::new(Letters::default()));

        let (header, payload) = signed(succeeded("ORD-1"), "payment_intent.succeeded");
        let result = svc.handle_webhook(Some(&header), &payload).await;
        assert_matches!(result, Err(ServiceError::ConcurrentModification(id)) if id == "ORD-1");
    }

    #[tokio::test]
    async fn dead_letter_write_failure_is_not_acknowledged() {
        let letters = Arc::new(Letters {
            fail: true,
            ..Default::default()
        });
        let svc = service(store_with(&[]), letters);

        let (header, payload) = signed(succeeded("ORD-404"), "payment_intent.succeeded");
        let result = svc.handle_webhook(Some(&header), &payload).await;
        assert_matches!(result, Err(ServiceError::DatabaseError(_)));
    }

    #[tokio::test]
    async fn missing_order_id_goes_to_dead_letters() {
        let letters = Arc::new(Letters::default());
        let svc = service(store_with(&["ORD-1"]), letters.clone());

        let (header, payload) = signed(
            json!({ "id": "pi_1", "amount": 4999, "currency": "usd", "metadata": { "orderId": "  " } }),
            "payment_intent.succeeded",
        );
        let ack = svc.handle_webhook(Some(&header), &payload).await.unwrap();

        assert!(ack.received);
        let recorded = letters.recorded.lock().unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].order_id, None);
    }

    #[tokio::test]
    async fn notifier_failure_does_not_fail_webhook() {
        let store = store_with(&["ORD-1"]);
        let svc = service(store.clone(), Arc::new(Letters::default()));

        let (header, payload) = signed(succeeded("ORD-1"), "payment_intent.succeeded");
        let ack = svc.handle_webhook(Some(&header), &payload).await.unwrap();

        assert!(ack.received);
        let order = store.find_by_id("ORD-1").await.unwrap().unwrap();
        assert_eq!(order.payment_status().unwrap(), PaymentStatus::Completed);
        assert_eq!(order.status, ORDER_STATUS_PROCESSING);
    }

    #[tokio::test]
    async fn new_intent_replaces_previous_correlation_ids() {
        let store = store_with(&["ORD-1"]);
        store.rows.lock().unwrap().get_mut("ORD-1").unwrap().checkout_session_id =
            Some("cs_old".into());

        let mut gateway = MockGateway::new();
        gateway.expect_create_payment_intent().returning(|_| {
            Ok(CreatedPaymentIntent {
                id: "pi_new".into(),
                client_secret: Some("secret".into()),
                status: "requires_payment_method".into(),
            })
        });
        let svc = service(store.clone(), Arc::new(Letters::default()))
            .with_gateway(Arc::new(gateway))
            .with_default_currency("EUR");

        let result = svc
            .create_payment_intent(CreatePaymentIntentRequest {
                amount: dec!(49.99),
                currency: None,
                order_id: "ORD-1".into(),
                user_id: "user-1".into(),
                metadata: HashMap::new(),
            })
            .await
            .unwrap();

        assert_eq!(result.payment_intent_id, "pi_new");
        let order = store.find_by_id("ORD-1").await.unwrap().unwrap();
        assert_eq!(order.payment_intent_id.as_deref(), Some("pi_new"));
        assert_eq!(order.checkout_session_id, None);
        assert_eq!(order.payment_status().unwrap(), PaymentStatus::Pending);
    }

    #[tokio::test]
    async fn default_currency_is_lowercased_for_gateway() {
        let mut gateway = MockGateway::new();
        gateway
            .expect_create_payment_intent()
            .withf(|p| p.currency == "eur" && p.amount == 1050)
            .times(1)
            .returning(|_| {
                Ok(CreatedPaymentIntent {
                    id: "pi_eur".into(),
                    client_secret: None,
                    status: String::new(),
                })
            });
        let svc = service(store_with(&["ORD-1"]), Arc::new(Letters::default()))
            .with_gateway(Arc::new(gateway))
            .with_default_currency("EUR");

        svc.create_payment_intent(CreatePaymentIntentRequest {
            amount: dec!(10.499),
            currency: None,
            order_id: "ORD-1".into(),
            user_id: "user-1".into(),
            metadata: HashMap::new(),
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn failure_of_replaced_intent_leaves_order_untouched() {
        let store = store_with(&["ORD-1"]);
        let svc = service(store.clone(), Arc::new(Letters::default()));
        let before = store.find_by_id("ORD-1").await.unwrap().unwrap();

        let (header, payload) = signed(
            json!({ "id": "pi_1", "amount": 4999, "currency": "usd", "metadata": { "orderId": "ORD-1" } }),
            "payment_intent.payment_failed",
        );
        let ack = svc.handle_webhook(Some(&header), &payload).await.unwrap();

        assert!(ack.received);
        assert_eq!(store.find_by_id("ORD-1").await.unwrap().unwrap(), before);
    }

    #[test]
    fn cache_tags_follow_naming_scheme() {
        assert_eq!(order_tag("ORD-1"), "order:ORD-1");
        assert_eq!(user_orders_tag("user-1"), "user:user-1:orders");
    }
}
