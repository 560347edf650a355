use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Storefront API",
        version = "0.3.0",
        description = r#"
# Storefront payment API

Payment reconciliation for a digital-goods storefront.

- **Payment intents** and **hosted checkout sessions** put an order into `PENDING`.
- **Webhooks** from the gateway are the only path to `COMPLETED`, `FAILED` and `EXPIRED`.
- **Refunds** move a completed order to `REFUND_PENDING` or `REFUNDED`.

## Webhooks

`POST /api/v1/payments/webhook` expects the raw event body and a
`Stripe-Signature: t=<unix>,v1=<hex hmac-sha256>` header. Any non-2xx
response asks the gateway to redeliver the event.

## Errors

```json
{
  "error": "Not Found",
  "message": "Not found: order ORD-42",
  "request_id": "req-abc123xyz",
  "timestamp": "2024-01-01T00:00:00Z"
}
```
        "#,
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    ),
    servers(
        (url = "http://localhost:8080", description = "Local development")
    ),
    tags(
        (name = "Payments", description = "Payment intents, checkout sessions, webhooks and refunds"),
        (name = "Health", description = "Health check endpoints")
    ),
    paths(
        crate::handlers::payments::create_payment_intent,
        crate::handlers::payments::create_checkout_session,
        crate::handlers::payments::payment_webhook,
        crate::handlers::payments::refund_order,
        crate::handlers::health::health_check,
    ),
    components(
        schemas(
            crate::ApiResponse<serde_json::Value>,
            crate::services::payments::CreatePaymentIntentRequest,
            crate::services::payments::PaymentIntentResponse,
            crate::services::payments::CheckoutItem,
            crate::services::payments::CreateCheckoutSessionRequest,
            crate::services::payments::CheckoutSessionResponse,
            crate::services::payments::RefundRequest,
            crate::services::payments::RefundRecord,
            crate::services::payments::WebhookAck,
            crate::payments::PaymentStatus,
            crate::payments::RefundStatus,
            crate::handlers::health::HealthResponse,
            crate::handlers::health::HealthDetails,
            crate::handlers::health::ComponentHealth,
            crate::handlers::health::ComponentStatus,
            crate::errors::ErrorResponse
        )
    )
)]
pub struct ApiDocV1;

pub fn swagger_ui() -> SwaggerUi {
    SwaggerUi::new("/swagger-ui")
        .url("/api-docs/openapi.json", ApiDocV1::openapi())
        .config(utoipa_swagger_ui::Config::from("/api-docs/openapi.json").try_it_out_enabled(true))
}
