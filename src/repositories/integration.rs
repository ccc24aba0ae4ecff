//! Integration (provider config) repository

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sea_orm::{ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, NotSet, QueryFilter, Set};
use serde_json::{Map, Value};

use crate::error::ServiceError;
use crate::models::integration::{self, Entity as IntegrationEntity};

/// Provider config as the engine sees it
#[derive(Debug, Clone, PartialEq)]
pub struct Integration {
    pub id: i32,
    pub environment_id: i32,
    pub unique_key: String,
    pub provider: String,
    pub oauth_client_id: Option<String>,
    pub oauth_client_secret: Option<String>,
    pub custom: Map<String, Value>,
}

impl Integration {
    /// String or number entry of the `custom` map
    pub fn custom_value(&self, key: &str) -> Option<String> {
        match self.custom.get(key)? {
            Value::String(value) if !value.is_empty() => Some(value.clone()),
            Value::Number(value) => Some(value.to_string()),
            _ => None,
        }
    }

    /// JWT issuer for app-style auth: `custom.app_id`, else the OAuth client id
    pub fn app_id(&self) -> Option<String> {
        self.custom_value("app_id")
            .or_else(|| self.oauth_client_id.clone().filter(|id| !id.is_empty()))
    }

    /// Signing key for app-style auth: `custom.private_key`, else the OAuth client secret
    pub fn app_private_key(&self) -> Option<String> {
        self.custom_value("private_key").or_else(|| {
            self.oauth_client_secret
                .clone()
                .filter(|secret| !secret.is_empty())
        })
    }

    pub fn webhook_secret(&self) -> Option<String> {
        self.custom_value("webhook_secret")
    }
}

impl From<integration::Model> for Integration {
    fn from(model: integration::Model) -> Self {
        Self {
            id: model.id,
            environment_id: model.environment_id,
            unique_key: model.unique_key,
            provider: model.provider,
            oauth_client_id: model.oauth_client_id,
            oauth_client_secret: model.oauth_client_secret,
            custom: match model.custom {
                Some(Value::Object(map)) => map,
                _ => Map::new(),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewIntegration {
    pub environment_id: i32,
    pub unique_key: String,
    pub provider: String,
    pub oauth_client_id: Option<String>,
    pub oauth_client_secret: Option<String>,
    pub custom: Map<String, Value>,
}

#[async_trait]
pub trait IntegrationStore: Send + Sync {
    async fn find_by_key(
        &self,
        provider_config_key: &str,
        environment_id: i32,
    ) -> Result<Option<Integration>, ServiceError>;

    async fn find_by_id(&self, id: i32) -> Result<Option<Integration>, ServiceError>;
}

#[derive(Debug, Clone)]
pub struct IntegrationRepository {
    pub db: Arc<DatabaseConnection>,
}

impl IntegrationRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn create(&self, integration: NewIntegration) -> Result<Integration, ServiceError> {
        let now = Utc::now();
        let active = integration::ActiveModel {
            id: NotSet,
            environment_id: Set(integration.environment_id),
            unique_key: Set(integration.unique_key),
            provider: Set(integration.provider),
            oauth_client_id: Set(integration.oauth_client_id),
            oauth_client_secret: Set(integration.oauth_client_secret),
            custom: Set(Some(Value::Object(integration.custom))),
            created_at: Set(now.into()),
            updated_at: Set(now.into()),
        };

        Ok(active.insert(&*self.db).await?.into())
    }
}

#[async_trait]
impl IntegrationStore for IntegrationRepository {
    async fn find_by_key(
        &self,
        provider_config_key: &str,
        environment_id: i32,
    ) -> Result<Option<Integration>, ServiceError> {
        Ok(IntegrationEntity::find()
            .filter(integration::Column::UniqueKey.eq(provider_config_key))
            .filter(integration::Column::EnvironmentId.eq(environment_id))
            .one(&*self.db)
            .await?
            .map(Integration::from))
    }

    async fn find_by_id(&self, id: i32) -> Result<Option<Integration>, ServiceError> {
        Ok(IntegrationEntity::find_by_id(id)
            .one(&*self.db)
            .await?
            .map(Integration::from))
    }
}
