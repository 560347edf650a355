//! Payment gateway integration: outbound REST client, webhook verification
//! and the event/status model the reconciliation service dispatches on.

pub mod amount;
pub mod events;
pub mod gateway;
pub mod signature;
pub mod status;
pub mod stripe;

pub use gateway::{
    CheckoutLineItem, CheckoutSessionParams, CreatedCheckoutSession, CreatedPaymentIntent,
    CreatedRefund, PaymentGateway, PaymentIntentParams, RefundParams,
};
pub use signature::{SignatureError, WebhookVerifier};
pub use status::{PaymentStatus, RefundStatus, ORDER_STATUS_PROCESSING};
pub use stripe::{StripeClient, StripeConfig};
