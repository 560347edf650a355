use async_trait::async_trait;
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set,
};
use std::sync::Arc;
use tracing::debug;

use crate::entities::order::{
    ActiveModel as OrderActiveModel, Column, Entity as Order, Model as OrderModel,
};
use crate::errors::AppError;
use crate::repositories::{OrderPaymentUpdate, OrderStore, Repository};

use super::BaseRepository;

/// Repository for order operations
#[derive(Debug, Clone)]
pub struct OrderRepository {
    base: BaseRepository,
}

impl OrderRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self {
            base: BaseRepository::new(db),
        }
    }

    /// Inserts a new order row; used by the order-placement flow and tests
    pub async fn create(&self, order: OrderModel) -> Result<OrderModel, AppError> {
        let active: OrderActiveModel = order.into();
        active
            .insert(self.base.get_db())
            .await
            .map_err(AppError::DatabaseError)
    }
}

fn apply_update(update: OrderPaymentUpdate, next_version: i32) -> OrderActiveModel {
    let mut active = OrderActiveModel {
        version: Set(next_version),
        updated_at: Set(Some(Utc::now())),
        ..Default::default()
    };

    if let Some(status) = update.status {
        active.status = Set(status);
    }
    if let Some(payment_status) = update.payment_status {
        active.payment_status = Set(payment_status.to_string());
    }
    if let Some(refund_status) = update.refund_status {
        active.refund_status = Set(Some(refund_status.to_string()));
    }
    if let Some(payment_intent_id) = update.payment_intent_id {
        active.payment_intent_id = Set(payment_intent_id);
    }
    if let Some(checkout_session_id) = update.checkout_session_id {
        active.checkout_session_id = Set(checkout_session_id);
    }
    if let Some(payment_method) = update.payment_method {
        active.payment_method = Set(Some(payment_method));
    }
    if let Some(details) = update.payment_details {
        active.payment_details = Set(Some(details));
    }
    if let Some(details) = update.refund_details {
        active.refund_details = Set(Some(details));
    }
    if let Some(at) = update.last_payment_event_at {
        active.last_payment_event_at = Set(Some(at));
    }

    active
}

#[async_trait]
impl OrderStore for OrderRepository {
    async fn find_by_id(&self, id: &str) -> Result<Option<OrderModel>, AppError> {
        Order::find_by_id(id.to_string())
            .one(self.base.get_db())
            .await
            .map_err(AppError::DatabaseError)
    }

    async fn find_by_payment_intent(
        &self,
        payment_intent_id: &str,
    ) -> Result<Option<OrderModel>, AppError> {
        Order::find()
            .filter(Column::PaymentIntentId.eq(payment_intent_id))
            .one(self.base.get_db())
            .await
            .map_err(AppError::DatabaseError)
    }

    async fn update_fields(
        &self,
        id: &str,
        expected_version: i32,
        update: OrderPaymentUpdate,
    ) -> Result<OrderModel, AppError> {
        let db = self.base.get_db();
        let result = Order::update_many()
            .set(apply_update(update, expected_version + 1))
            .filter(Column::Id.eq(id))
            .filter(Column::Version.eq(expected_version))
            .exec(db)
            .await
            .map_err(AppError::DatabaseError)?;

        if result.rows_affected == 0 {
            return match OrderStore::find_by_id(self, id).await? {
                None => Err(AppError::NotFound(format!("order {}", id))),
                Some(current) => {
                    debug!(
                        order_id = id,
                        expected_version,
                        current_version = current.version,
                        "order update lost version race"
                    );
                    Err(AppError::ConcurrentModification(id.to_string()))
                }
            };
        }

        OrderStore::find_by_id(self, id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("order {}", id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{establish_connection, run_migrations};
    use crate::payments::{PaymentStatus, RefundStatus};
    use assert_matches::assert_matches;
    use rust_decimal_macros::dec;
    use serde_json::json;

    async fn repository() -> OrderRepository {
        let db = establish_connection("sqlite::memory:").await.unwrap();
        run_migrations(&db).await.unwrap();
        OrderRepository::new(Arc::new(db))
    }

    fn pending_order(id: &str) -> OrderModel {
        OrderModel {
            id: id.to_string(),
            user_id: "user-1".into(),
            status: "PENDING".into(),
            total_amount: dec!(89.99),
            currency: "usd".into(),
            payment_status: PaymentStatus::Pending.to_string(),
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

    #[tokio::test]
    async fn update_bumps_version_and_leaves_untouched_columns() {
        let repo = repository().await;
        repo.create(pending_order("ORD-1")).await.unwrap();

        let updated = repo
            .update_fields(
                "ORD-1",
                1,
                OrderPaymentUpdate {
                    payment_status: Some(PaymentStatus::Completed),
                    status: Some("PROCESSING".into()),
                    payment_details: Some(json!({ "amount": 89.99 })),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.version, 2);
        assert_eq!(updated.payment_status, "COMPLETED");
        assert_eq!(updated.payment_intent_id.as_deref(), Some("pi_old"));
        assert_eq!(updated.payment_details, Some(json!({ "amount": 89.99 })));
        assert!(updated.updated_at.is_some());
    }

    #[tokio::test]
    async fn stale_version_is_rejected() {
        let repo = repository().await;
        repo.create(pending_order("ORD-2")).await.unwrap();
        repo.update_fields("ORD-2", 1, OrderPaymentUpdate::default())
            .await
            .unwrap();

        let result = repo
            .update_fields(
                "ORD-2",
                1,
                OrderPaymentUpdate {
                    refund_status: Some(RefundStatus::Refunded),
                    ..Default::default()
                },
            )
            .await;
        assert_matches!(result, Err(AppError::ConcurrentModification(id)) if id == "ORD-2");

        let result = repo
            .update_fields("ORD-404", 1, OrderPaymentUpdate::default())
            .await;
        assert_matches!(result, Err(AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn correlation_ids_can_be_cleared() {
        let repo = repository().await;
        repo.create(pending_order("ORD-3")).await.unwrap();

        let updated = repo
            .update_fields(
                "ORD-3",
                1,
                OrderPaymentUpdate {
                    payment_intent_id: Some(None),
                    checkout_session_id: Some(Some("cs_1".into())),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.payment_intent_id, None);
        assert_eq!(updated.checkout_session_id.as_deref(), Some("cs_1"));

        assert!(repo.find_by_payment_intent("pi_old").await.unwrap().is_none());
    }
}
