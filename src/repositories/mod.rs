use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::DatabaseConnection;
use serde_json::Value;
use std::sync::Arc;

use crate::entities::{order::Model as OrderModel, product::Model as ProductModel};
use crate::errors::ServiceError;
use crate::payments::{PaymentStatus, RefundStatus};

pub mod dead_letter_repository;
pub mod order_repository;
pub mod product_repository;

pub use dead_letter_repository::{DeadLetterRepository, NewDeadLetter};
pub use order_repository::OrderRepository;
pub use product_repository::ProductRepository;

/// Repository trait for common database operations
pub trait Repository {
    fn get_db(&self) -> &DatabaseConnection;
}

#[derive(Debug, Clone)]
pub struct BaseRepository {
    db: Arc<DatabaseConnection>,
}

impl BaseRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

impl Repository for BaseRepository {
    fn get_db(&self) -> &DatabaseConnection {
        &self.db
    }
}

/// Payment columns written by the reconciliation flow.
///
/// `None` leaves a column untouched. The correlation ids are doubly optional so
/// a starting payment attempt can clear the id of the other flow.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrderPaymentUpdate {
    pub status: Option<String>,
    pub payment_status: Option<PaymentStatus>,
    pub refund_status: Option<RefundStatus>,
    pub payment_intent_id: Option<Option<String>>,
    pub checkout_session_id: Option<Option<String>>,
    pub payment_method: Option<String>,
    pub payment_details: Option<Value>,
    pub refund_details: Option<Value>,
    pub last_payment_event_at: Option<DateTime<Utc>>,
}

/// Order reads and compare-and-set writes used by the payment service
#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn find_by_id(&self, id: &str) -> Result<Option<OrderModel>, ServiceError>;

    async fn find_by_payment_intent(
        &self,
        payment_intent_id: &str,
    ) -> Result<Option<OrderModel>, ServiceError>;

    /// Applies `update` only if the row is still at `expected_version`.
    ///
    /// Fails with `NotFound` for an unknown id and `ConcurrentModification`
    /// when another writer got there first.
    async fn update_fields(
        &self,
        id: &str,
        expected_version: i32,
        update: OrderPaymentUpdate,
    ) -> Result<OrderModel, ServiceError>;
}

#[async_trait]
pub trait ProductCatalog: Send + Sync {
    async fn find_by_id(&self, id: &str) -> Result<Option<ProductModel>, ServiceError>;
}

/// Destination for verified gateway events that match no order
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn record(&self, letter: NewDeadLetter) -> Result<(), ServiceError>;
}
