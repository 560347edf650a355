use axum::{
    body::Bytes,
    extract::{Json, Path, State},
    http::{HeaderMap, StatusCode},
    routing::post,
    Router,
};

use crate::errors::ServiceError;
use crate::services::payments::{
    CheckoutSessionResponse, CreateCheckoutSessionRequest, CreatePaymentIntentRequest,
    PaymentIntentResponse, RefundRecord, RefundRequest, WebhookAck,
};
use crate::{ApiResponse, AppState};

/// Header carrying the gateway's webhook signature
pub const SIGNATURE_HEADER: &str = "stripe-signature";

/// Start a payment intent for an order
#[utoipa::path(
    post,
    path = "/api/v1/payments/intents",
    request_body = CreatePaymentIntentRequest,
    responses(
        (status = 201, description = "Payment intent created", body = crate::ApiResponse<PaymentIntentResponse>),
        (status = 400, description = "Invalid amount or request", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
        (status = 409, description = "Order already paid", body = crate::errors::ErrorResponse),
        (status = 502, description = "Gateway failure", body = crate::errors::ErrorResponse),
        (status = 503, description = "Gateway not configured", body = crate::errors::ErrorResponse)
    ),
    tag = "Payments"
)]
pub async fn create_payment_intent(
    State(state): State<AppState>,
    Json(request): Json<CreatePaymentIntentRequest>,
) -> Result<(StatusCode, Json<ApiResponse<PaymentIntentResponse>>), ServiceError> {
    let intent = state.payments.create_payment_intent(request).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(intent))))
}

/// Start a hosted checkout session priced from the catalog
#[utoipa::path(
    post,
    path = "/api/v1/payments/checkout-sessions",
    request_body = CreateCheckoutSessionRequest,
    responses(
        (status = 201, description = "Checkout session created", body = crate::ApiResponse<CheckoutSessionResponse>),
        (status = 400, description = "Invalid request", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order or product not found", body = crate::errors::ErrorResponse),
        (status = 409, description = "Order already paid", body = crate::errors::ErrorResponse),
        (status = 502, description = "Gateway failure", body = crate::errors::ErrorResponse),
        (status = 503, description = "Gateway not configured", body = crate::errors::ErrorResponse)
    ),
    tag = "Payments"
)]
pub async fn create_checkout_session(
    State(state): State<AppState>,
    Json(request): Json<CreateCheckoutSessionRequest>,
) -> Result<(StatusCode, Json<ApiResponse<CheckoutSessionResponse>>), ServiceError> {
    let session = state.payments.create_checkout_session(request).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(session))))
}

/// Gateway webhook receiver.
///
/// The body is taken raw because the signature covers the exact bytes sent.
#[utoipa::path(
    post,
    path = "/api/v1/payments/webhook",
    request_body = String,
    params(
        ("Stripe-Signature" = String, Header, description = "t=<unix>,v1=<hex hmac>")
    ),
    responses(
        (status = 200, description = "Event handled", body = WebhookAck),
        (status = 400, description = "Invalid signature or payload", body = crate::errors::ErrorResponse),
        (status = 409, description = "Order changed concurrently; redeliver", body = crate::errors::ErrorResponse),
        (status = 503, description = "Webhook secret not configured", body = crate::errors::ErrorResponse)
    ),
    tag = "Payments"
)]
pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, ServiceError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());
    let ack = state.payments.handle_webhook(signature, &body).await?;
    Ok(Json(ack))
}

/// Refund a completed order, fully unless an amount is given
#[utoipa::path(
    post,
    path = "/api/v1/orders/{order_id}/refund",
    params(("order_id" = String, Path, description = "Order identifier")),
    request_body = RefundRequest,
    responses(
        (status = 200, description = "Refund issued", body = crate::ApiResponse<RefundRecord>),
        (status = 404, description = "Order or payment intent not found", body = crate::errors::ErrorResponse),
        (status = 409, description = "Order is not refundable", body = crate::errors::ErrorResponse),
        (status = 502, description = "Gateway failure", body = crate::errors::ErrorResponse),
        (status = 503, description = "Gateway not configured", body = crate::errors::ErrorResponse)
    ),
    tag = "Payments"
)]
pub async fn refund_order(
    State(state): State<AppState>,
    Path(order_id): Path<String>,
    body: Bytes,
) -> Result<Json<ApiResponse<RefundRecord>>, ServiceError> {
    let request = parse_refund_request(&body)?;
    let refund = state.payments.refund_payment(&order_id, request).await?;
    Ok(Json(ApiResponse::success(refund)))
}

/// An empty body asks for a full refund; anything else must be a valid
/// `RefundRequest`.
fn parse_refund_request(body: &[u8]) -> Result<RefundRequest, ServiceError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(RefundRequest::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| ServiceError::BadRequest(format!("invalid refund request: {}", e)))
}

pub fn payment_routes() -> Router<AppState> {
    Router::new()
        .route("/intents", post(create_payment_intent))
        .route("/checkout-sessions", post(create_checkout_session))
        .route("/webhook", post(payment_webhook))
}

pub fn order_routes() -> Router<AppState> {
    Router::new().route("/:order_id/refund", post(refund_order))
}
