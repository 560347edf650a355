use async_trait::async_trait;
use sea_orm::{ActiveModelTrait, DatabaseConnection, EntityTrait};
use std::sync::Arc;

use crate::entities::product::{ActiveModel as ProductActiveModel, Entity as Product, Model as ProductModel};
use crate::errors::AppError;
use crate::repositories::{ProductCatalog, Repository};

use super::BaseRepository;

/// Repository for product lookups
#[derive(Debug, Clone)]
pub struct ProductRepository {
    base: BaseRepository,
}

impl ProductRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self {
            base: BaseRepository::new(db),
        }
    }

    pub async fn create(&self, product: ProductModel) -> Result<ProductModel, AppError> {
        let active: ProductActiveModel = product.into();
        active
            .insert(self.base.get_db())
            .await
            .map_err(AppError::DatabaseError)
    }
}

#[async_trait]
impl ProductCatalog for ProductRepository {
    async fn find_by_id(&self, id: &str) -> Result<Option<ProductModel>, AppError> {
        Product::find_by_id(id.to_string())
            .one(self.base.get_db())
            .await
            .map_err(AppError::DatabaseError)
    }
}
