use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set};
use tracing::error;

use super::{LockError, LockStore};
use crate::error::is_unique_violation;
use crate::models::lock::{self, Entity as Lock};

/// Lock table shared by every instance pointed at the same database.
/// The primary key on `key` arbitrates concurrent inserts.
#[derive(Debug, Clone)]
pub struct DatabaseLockStore {
    db: Arc<DatabaseConnection>,
}

impl DatabaseLockStore {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

fn unavailable(error: sea_orm::DbErr) -> LockError {
    error!(error = %error, "Lock store query failed");
    LockError::Unavailable(error.to_string())
}

#[async_trait]
impl LockStore for DatabaseLockStore {
    async fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, LockError> {
        let now = Utc::now();
        let now_db: sea_orm::prelude::DateTimeWithTimeZone = now.into();

        Lock::delete_many()
            .filter(lock::Column::Key.eq(key))
            .filter(lock::Column::ExpiresAt.lte(now_db))
            .exec(&*self.db)
            .await
            .map_err(unavailable)?;

        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(10));
        let row = lock::ActiveModel {
            key: Set(key.to_string()),
            owner: Set(owner.to_string()),
            expires_at: Set((now + ttl).into()),
        };

        match Lock::insert(row).exec_without_returning(&*self.db).await {
            Ok(_) => Ok(true),
            Err(error) if is_unique_violation(&error) => Ok(false),
            Err(error) => Err(unavailable(error)),
        }
    }

    async fn release(&self, key: &str, owner: &str) -> Result<(), LockError> {
        Lock::delete_many()
            .filter(lock::Column::Key.eq(key))
            .filter(lock::Column::Owner.eq(owner))
            .exec(&*self.db)
            .await
            .map_err(unavailable)?;
        Ok(())
    }
}
