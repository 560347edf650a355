use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::{info, instrument, warn};

use super::gateway::{
    CheckoutSessionParams, CreatedCheckoutSession, CreatedPaymentIntent, CreatedRefund,
    PaymentGateway, PaymentIntentParams, RefundParams,
};
use crate::errors::ServiceError;
use crate::metrics::GATEWAY_REQUEST_DURATION;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Stripe configuration
#[derive(Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub api_base: String,
}

impl StripeConfig {
    pub fn new(secret_key: impl Into<String>, api_base: impl Into<String>) -> Self {
        Self {
            secret_key: secret_key.into(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct StripeErrorBody {
    error: StripeErrorDetail,
}

#[derive(Debug, Deserialize)]
struct StripeErrorDetail {
    #[serde(rename = "type")]
    kind: Option<String>,
    message: Option<String>,
}

/// Stripe REST client speaking form-encoded requests with basic auth
#[derive(Clone)]
pub struct StripeClient {
    config: StripeConfig,
    client: reqwest::Client,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ServiceError::InternalError(format!("HTTP client error: {}", e)))?;
        Ok(Self { config, client })
    }

    async fn post_form<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(String, String)],
    ) -> Result<T, ServiceError> {
        let url = format!("{}{}", self.config.api_base, path);
        let timer = GATEWAY_REQUEST_DURATION.start_timer();

        let response = self
            .client
            .post(&url)
            .basic_auth(&self.config.secret_key, Some(""))
            .form(params)
            .send()
            .await
            .map_err(|e| ServiceError::UpstreamFailure(format!("Stripe API error: {}", e)));
        timer.observe_duration();
        let response = response?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(upstream_error(status, &error_text));
        }

        response.json::<T>().await.map_err(|e| {
            ServiceError::UpstreamFailure(format!("Failed to parse Stripe response: {}", e))
        })
    }
}

fn upstream_error(status: StatusCode, body: &str) -> ServiceError {
    let detail = serde_json::from_str::<StripeErrorBody>(body)
        .ok()
        .map(|b| {
            format!(
                "{}: {}",
                b.error.kind.unwrap_or_else(|| "api_error".to_string()),
                b.error.message.unwrap_or_default()
            )
        })
        .unwrap_or_else(|| body.to_string());
    warn!(status = %status, "Stripe API error: {}", detail);
    ServiceError::UpstreamFailure(format!("Stripe returned {}: {}", status, detail))
}

fn push_metadata(
    params: &mut Vec<(String, String)>,
    prefix: &str,
    metadata: &std::collections::HashMap<String, String>,
) {
    let mut entries: Vec<_> = metadata.iter().collect();
    entries.sort();
    for (key, value) in entries {
        params.push((format!("{}[{}]", prefix, key), value.clone()));
    }
}

pub(crate) fn payment_intent_form(params: &PaymentIntentParams) -> Vec<(String, String)> {
    let mut form = vec![
        ("amount".to_string(), params.amount.to_string()),
        ("currency".to_string(), params.currency.to_lowercase()),
        (
            "automatic_payment_methods[enabled]".to_string(),
            "true".to_string(),
        ),
    ];
    push_metadata(&mut form, "metadata", &params.metadata);
    form
}

pub(crate) fn checkout_session_form(params: &CheckoutSessionParams) -> Vec<(String, String)> {
    let currency = params.currency.to_lowercase();
    let mut form = vec![
        ("mode".to_string(), "payment".to_string()),
        ("payment_method_types[0]".to_string(), "card".to_string()),
        ("success_url".to_string(), params.success_url.clone()),
        ("cancel_url".to_string(), params.cancel_url.clone()),
        (
            "client_reference_id".to_string(),
            params.client_reference_id.clone(),
        ),
    ];

    for (i, item) in params.line_items.iter().enumerate() {
        let base = format!("line_items[{}]", i);
        form.push((format!("{}[price_data][currency]", base), currency.clone()));
        form.push((
            format!("{}[price_data][unit_amount]", base),
            item.unit_amount.to_string(),
        ));
        form.push((
            format!("{}[price_data][product_data][name]", base),
            item.name.clone(),
        ));
        if let Some(description) = item.description.as_ref().filter(|d| !d.is_empty()) {
            form.push((
                format!("{}[price_data][product_data][description]", base),
                description.clone(),
            ));
        }
        for (j, image) in item.images.iter().enumerate() {
            form.push((
                format!("{}[price_data][product_data][images][{}]", base, j),
                image.clone(),
            ));
        }
        form.push((format!("{}[quantity]", base), item.quantity.to_string()));
    }

    push_metadata(&mut form, "metadata", &params.metadata);
    // Payment intent metadata lets `payment_intent.*` events correlate too
    push_metadata(&mut form, "payment_intent_data[metadata]", &params.metadata);
    form
}

pub(crate) fn refund_form(params: &RefundParams) -> Vec<(String, String)> {
    let mut form = vec![(
        "payment_intent".to_string(),
        params.payment_intent_id.clone(),
    )];
    if let Some(amount) = params.amount {
        form.push(("amount".to_string(), amount.to_string()));
    }
    if let Some(reason) = &params.reason {
        form.push(("reason".to_string(), reason.clone()));
    }
    push_metadata(&mut form, "metadata", &params.metadata);
    form
}

#[async_trait]
impl PaymentGateway for StripeClient {
    #[instrument(skip(self, params), fields(amount = params.amount, currency = %params.currency))]
    async fn create_payment_intent(
        &self,
        params: PaymentIntentParams,
    ) -> Result<CreatedPaymentIntent, ServiceError> {
        let intent: CreatedPaymentIntent = self
            .post_form("/v1/payment_intents", &payment_intent_form(&params))
            .await?;
        info!("PaymentIntent created: {}", intent.id);
        Ok(intent)
    }

    #[instrument(skip(self, params), fields(line_items = params.line_items.len()))]
    async fn create_checkout_session(
        &self,
        params: CheckoutSessionParams,
    ) -> Result<CreatedCheckoutSession, ServiceError> {
        let session: CreatedCheckoutSession = self
            .post_form("/v1/checkout/sessions", &checkout_session_form(&params))
            .await?;
        info!("Checkout session created: {}", session.id);
        Ok(session)
    }

    #[instrument(skip(self, params), fields(payment_intent = %params.payment_intent_id))]
    async fn create_refund(&self, params: RefundParams) -> Result<CreatedRefund, ServiceError> {
        let refund: CreatedRefund = self.post_form("/v1/refunds", &refund_form(&params)).await?;
        info!("Refund {} created with status {}", refund.id, refund.status);
        Ok(refund)
    }
}
