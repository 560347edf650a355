#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{
    body::{self, Body},
    http::{Method, Request},
    response::Response,
    Router,
};
use chrono::Utc;
use mockall::mock;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use storefront_api::{
    app_router,
    cache::{CacheService, InMemoryCacheBackend},
    config::AppConfig,
    db,
    entities::{order::Model as OrderModel, product::Model as ProductModel},
    errors::ServiceError,
    notifications::{NotificationError, PaymentNotification, PaymentNotifier},
    payments::{
        CheckoutSessionParams, CreatedCheckoutSession, CreatedPaymentIntent, CreatedRefund,
        PaymentGateway, PaymentIntentParams, PaymentStatus, RefundParams, WebhookVerifier,
    },
    repositories::{DeadLetterRepository, OrderRepository, OrderStore, ProductRepository},
    services::{CachedProductCatalog, PaymentService},
    AppState,
};
use tower::ServiceExt;

pub const WEBHOOK_SECRET: &str = "whsec_test_secret";

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

/// Notifier that keeps every notification for later assertions
#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<PaymentNotification>>,
}

#[async_trait]
impl PaymentNotifier for RecordingNotifier {
    async fn notify(&self, notification: PaymentNotification) -> Result<(), NotificationError> {
        self.sent.lock().unwrap().push(notification);
        Ok(())
    }
}

impl RecordingNotifier {
    pub fn kinds(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|n| n.kind.to_string())
            .collect()
    }
}

/// Application wired against in-memory SQLite and the in-memory cache backend
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub orders: Arc<OrderRepository>,
    pub products: Arc<ProductRepository>,
    pub dead_letters: Arc<DeadLetterRepository>,
    pub notifier: Arc<RecordingNotifier>,
    pub cache: CacheService,
    pub verifier: WebhookVerifier,
}

impl TestApp {
    /// App without a payment gateway; payment calls fail with 503
    pub async fn new() -> Self {
        Self::build(None).await
    }

    pub async fn with_gateway(gateway: MockGateway) -> Self {
        Self::build(Some(Arc::new(gateway))).await
    }

    async fn build(gateway: Option<Arc<dyn PaymentGateway>>) -> Self {
        let cfg = AppConfig::new(
            "sqlite::memory:".to_string(),
            "127.0.0.1".to_string(),
            18_080,
            "test".to_string(),
        );

        let pool = db::establish_connection_with_config(&db::DbConfig::from(&cfg))
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");
        let db = Arc::new(pool);

        let cache = CacheService::new(Arc::new(InMemoryCacheBackend::new()));
        let orders = Arc::new(OrderRepository::new(db.clone()));
        let products = Arc::new(ProductRepository::new(db.clone()));
        let dead_letters = Arc::new(DeadLetterRepository::new(db.clone()));
        let notifier = Arc::new(RecordingNotifier::default());
        let verifier = WebhookVerifier::new(WEBHOOK_SECRET, cfg.webhook_tolerance());

        let catalog = CachedProductCatalog::new(
            products.clone(),
            cache.clone(),
            std::time::Duration::from_secs(cfg.cache_default_ttl_secs),
        );
        let mut payments = PaymentService::new(
            orders.clone(),
            Arc::new(catalog),
            dead_letters.clone(),
            notifier.clone(),
            cache.clone(),
        )
        .with_webhook_verifier(verifier.clone());
        if let Some(gateway) = gateway {
            payments = payments.with_gateway(gateway);
        }

        let state = AppState {
            db,
            config: cfg,
            payments: Arc::new(payments),
            cache: cache.clone(),
        };

        Self {
            router: app_router(state.clone()),
            state,
            orders,
            products,
            dead_letters,
            notifier,
            cache,
            verifier,
        }
    }

    pub async fn request(&self, method: Method, uri: &str, body: Option<Value>) -> Response {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = if let Some(json) = body {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&json).expect("failed to serialize json request body"))
        } else {
            Body::empty()
        };

        let request = builder.body(body).expect("failed to build request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }

    /// Sends a body exactly as given, with an optional content type
    pub async fn request_raw(
        &self,
        method: Method,
        uri: &str,
        body: &str,
        content_type: Option<&str>,
    ) -> Response {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(content_type) = content_type {
            builder = builder.header("content-type", content_type);
        }

        let request = builder
            .body(Body::from(body.to_string()))
            .expect("failed to build request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }

    /// Posts a raw webhook body with the given signature header value
    pub async fn post_webhook_raw(&self, payload: Vec<u8>, signature: Option<String>) -> Response {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri("/api/v1/payments/webhook")
            .header("content-type", "application/json");
        if let Some(signature) = signature {
            builder = builder.header("Stripe-Signature", signature);
        }

        let request = builder
            .body(Body::from(payload))
            .expect("failed to build request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }

    /// Posts a correctly signed webhook event
    pub async fn post_webhook(&self, event: &Value) -> Response {
        let payload = serde_json::to_vec(event).expect("event json");
        let signature = self.verifier.header_for(Utc::now().timestamp(), &payload);
        self.post_webhook_raw(payload, Some(signature)).await
    }

    pub async fn seed_order(&self, id: &str, user_id: &str, total: Decimal) -> OrderModel {
        self.orders
            .create(OrderModel {
                id: id.to_string(),
                user_id: user_id.to_string(),
                status: "PENDING".to_string(),
                total_amount: total,
                currency: "usd".to_string(),
                payment_status: PaymentStatus::Pending.to_string(),
                refund_status: None,
                payment_intent_id: None,
                checkout_session_id: None,
                payment_method: None,
                payment_details: None,
                refund_details: None,
                last_payment_event_at: None,
                created_at: Utc::now(),
                updated_at: None,
                version: 1,
            })
            .await
            .expect("failed to seed order")
    }

    pub async fn seed_product(&self, id: &str, name: &str, price: Decimal) -> ProductModel {
        self.products
            .create(ProductModel {
                id: id.to_string(),
                name: name.to_string(),
                description: Some(format!("{} (digital download)", name)),
                images: json!([format!("https://cdn.example.com/{}.png", id)]),
                price,
                currency: "usd".to_string(),
                is_active: true,
                created_at: Utc::now(),
                updated_at: None,
            })
            .await
            .expect("failed to seed product")
    }

    pub async fn order(&self, id: &str) -> OrderModel {
        self.orders
            .find_by_id(id)
            .await
            .expect("order lookup failed")
            .expect("order should exist")
    }
}

/// Gateway event envelope as delivered to the webhook endpoint
pub fn gateway_event(id: &str, event_type: &str, created: i64, object: Value) -> Value {
    json!({
        "id": id,
        "object": "event",
        "type": event_type,
        "created": created,
        "livemode": false,
        "data": { "object": object }
    })
}

pub async fn response_json(response: Response) -> Value {
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body bytes");
    serde_json::from_slice(&bytes).expect("json response")
}
