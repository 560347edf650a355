use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::payments::{PaymentStatus, RefundStatus};

/// Order row as seen by the payment reconciliation flow.
///
/// Rows are created by the order-placement flow; this service only mutates the
/// payment columns and never deletes orders.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "orders")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub user_id: String,
    pub status: String,
    pub total_amount: Decimal,
    pub currency: String,
    pub payment_status: String,
    pub refund_status: Option<String>,
    pub payment_intent_id: Option<String>,
    pub checkout_session_id: Option<String>,
    pub payment_method: Option<String>,
    pub payment_details: Option<Json>,
    pub refund_details: Option<Json>,
    /// `created` time of the last gateway event applied to this order
    pub last_payment_event_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub version: i32,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Parsed payment status; unknown column values are reported as corrupt data
    pub fn payment_status(&self) -> Result<PaymentStatus, DbErr> {
        PaymentStatus::from_str(&self.payment_status).map_err(|_| {
            DbErr::Type(format!(
                "order {} has unknown payment status {}",
                self.id, self.payment_status
            ))
        })
    }

    pub fn refund_status(&self) -> Option<RefundStatus> {
        self.refund_status
            .as_deref()
            .and_then(|s| RefundStatus::from_str(s).ok())
    }

    /// Payment intent to refund: the correlation column first, then the id
    /// recorded in the payment details by a completed checkout session
    pub fn refundable_payment_intent(&self) -> Option<String> {
        self.payment_intent_id
            .clone()
            .filter(|id| !id.is_empty())
            .or_else(|| {
                self.payment_details
                    .as_ref()
                    .and_then(|d| d.get("paymentIntentId"))
                    .and_then(|v| v.as_str())
                    .filter(|id| !id.is_empty())
                    .map(str::to_string)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn order() -> Model {
        Model {
            id: "ORD-1".into(),
            user_id: "user-1".into(),
            status: "PENDING".into(),
            total_amount: dec!(10.00),
            currency: "usd".into(),
            payment_status: "PENDING".into(),
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
        }
    }

    #[test]
    fn payment_intent_falls_back_to_details() {
        let mut o = order();
        assert_eq!(o.refundable_payment_intent(), None);

        o.payment_details = Some(json!({ "paymentIntentId": "pi_from_details" }));
        assert_eq!(
            o.refundable_payment_intent().as_deref(),
            Some("pi_from_details")
        );

        o.payment_intent_id = Some("pi_column".into());
        assert_eq!(o.refundable_payment_intent().as_deref(), Some("pi_column"));
    }

    #[test]
    fn corrupt_status_is_an_error() {
        let mut o = order();
        o.payment_status = "PAID".into();
        assert!(o.payment_status().is_err());
    }
}
