use async_trait::async_trait;
use chrono::Utc;
use sea_orm::sea_query::OnConflict;
use sea_orm::{DatabaseConnection, DbErr, EntityTrait, QueryOrder, QuerySelect, Set};
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::entities::payment_dead_letter::{
    ActiveModel as DeadLetterActiveModel, Column, Entity as DeadLetter, Model as DeadLetterModel,
};
use crate::errors::AppError;
use crate::repositories::{DeadLetterSink, Repository};

use super::BaseRepository;

#[derive(Debug, Clone, PartialEq)]
pub struct NewDeadLetter {
    pub event_id: String,
    pub event_type: String,
    pub order_id: Option<String>,
    pub reason: String,
    pub payload: Value,
}

/// Stores gateway events that could not be correlated with an order
#[derive(Debug, Clone)]
pub struct DeadLetterRepository {
    base: BaseRepository,
}

impl DeadLetterRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self {
            base: BaseRepository::new(db),
        }
    }

    pub async fn list_recent(&self, limit: u64) -> Result<Vec<DeadLetterModel>, AppError> {
        DeadLetter::find()
            .order_by_desc(Column::CreatedAt)
            .limit(limit)
            .all(self.base.get_db())
            .await
            .map_err(AppError::DatabaseError)
    }
}

#[async_trait]
impl DeadLetterSink for DeadLetterRepository {
    /// Redeliveries of an already dead-lettered event are ignored
    async fn record(&self, letter: NewDeadLetter) -> Result<(), AppError> {
        warn!(
            event_id = %letter.event_id,
            event_type = %letter.event_type,
            order_id = ?letter.order_id,
            reason = %letter.reason,
            "dead-lettering payment event"
        );

        let active = DeadLetterActiveModel {
            id: Set(Uuid::new_v4()),
            event_id: Set(letter.event_id),
            event_type: Set(letter.event_type),
            order_id: Set(letter.order_id),
            reason: Set(letter.reason),
            payload: Set(letter.payload),
            created_at: Set(Utc::now()),
        };

        let result = DeadLetter::insert(active)
            .on_conflict(
                OnConflict::column(Column::EventId)
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(self.base.get_db())
            .await;

        match result {
            Ok(_) | Err(DbErr::RecordNotInserted) => Ok(()),
            Err(e) => Err(AppError::DatabaseError(e)),
        }
    }
}
