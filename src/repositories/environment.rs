//! Environment repository

use std::sync::Arc;

use chrono::Utc;
use sea_orm::{ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, NotSet, QueryFilter, Set};
use uuid::Uuid;

use crate::models::environment::{self, Entity as EnvironmentEntity};

#[derive(Debug, Clone)]
pub struct EnvironmentRepository {
    pub db: Arc<DatabaseConnection>,
}

impl EnvironmentRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Looks up an environment by the public uuid used in webhook URLs
    pub async fn find_by_uuid(&self, uuid: Uuid) -> Result<Option<environment::Model>, DbErr> {
        EnvironmentEntity::find()
            .filter(environment::Column::Uuid.eq(uuid))
            .one(&*self.db)
            .await
    }

    pub async fn create(
        &self,
        name: &str,
        account_id: i32,
        webhooks_enabled: bool,
    ) -> Result<environment::Model, DbErr> {
        environment::ActiveModel {
            id: NotSet,
            uuid: Set(Uuid::new_v4()),
            account_id: Set(account_id),
            name: Set(name.to_string()),
            webhooks_enabled: Set(webhooks_enabled),
            created_at: Set(Utc::now().into()),
        }
        .insert(&*self.db)
        .await
    }
}
