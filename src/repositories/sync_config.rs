//! Sync configuration lookups for webhook fan-out

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, NotSet, QueryFilter,
    QueryOrder, Set,
};
use serde_json::Value;

use crate::error::ServiceError;
use crate::models::sync_config::{self, Entity as SyncConfigEntity};

/// A deployed sync or action with the webhook types it listens to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookSubscription {
    pub sync_name: String,
    pub kind: String,
    pub webhook_subscriptions: Vec<String>,
}

#[async_trait]
pub trait SyncConfigStore: Send + Sync {
    /// Active, non-deleted configs of the integration with at least one subscription
    async fn find_with_webhooks(
        &self,
        environment_id: i32,
        integration_id: i32,
    ) -> Result<Vec<WebhookSubscription>, ServiceError>;
}

#[derive(Debug, Clone)]
pub struct SyncConfigRepository {
    pub db: Arc<DatabaseConnection>,
}

impl SyncConfigRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn create(
        &self,
        environment_id: i32,
        integration_id: i32,
        sync_name: &str,
        kind: &str,
        webhook_subscriptions: &[&str],
    ) -> Result<sync_config::Model, ServiceError> {
        let active = sync_config::ActiveModel {
            id: NotSet,
            environment_id: Set(environment_id),
            integration_id: Set(integration_id),
            sync_name: Set(sync_name.to_string()),
            kind: Set(kind.to_string()),
            webhook_subscriptions: Set(Some(serde_json::json!(webhook_subscriptions))),
            active: Set(true),
            deleted: Set(false),
            created_at: Set(Utc::now().into()),
        };
        Ok(active.insert(&*self.db).await?)
    }
}

fn subscriptions(value: Option<Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::String(name) if !name.is_empty() => Some(name),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

#[async_trait]
impl SyncConfigStore for SyncConfigRepository {
    async fn find_with_webhooks(
        &self,
        environment_id: i32,
        integration_id: i32,
    ) -> Result<Vec<WebhookSubscription>, ServiceError> {
        let models = SyncConfigEntity::find()
            .filter(sync_config::Column::EnvironmentId.eq(environment_id))
            .filter(sync_config::Column::IntegrationId.eq(integration_id))
            .filter(sync_config::Column::Active.eq(true))
            .filter(sync_config::Column::Deleted.eq(false))
            .filter(sync_config::Column::WebhookSubscriptions.is_not_null())
            .order_by_asc(sync_config::Column::Id)
            .all(&*self.db)
            .await?;

        Ok(models
            .into_iter()
            .map(|model| WebhookSubscription {
                sync_name: model.sync_name,
                kind: model.kind,
                webhook_subscriptions: subscriptions(model.webhook_subscriptions),
            })
            .filter(|config| !config.webhook_subscriptions.is_empty())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_subscription_parsing_skips_junk() {
        assert_eq!(
            subscriptions(Some(json!(["deal.updated", "", 7, "deal.created"]))),
            vec!["deal.updated".to_string(), "deal.created".to_string()]
        );
        assert!(subscriptions(Some(json!({"not": "an array"}))).is_empty());
        assert!(subscriptions(None).is_empty());
    }
}
