//! # Credential lifecycle engine
//!
//! [`ConnectionService`] owns the connection lifecycle: upserts for every auth mode,
//! plain reads, the refresh-aware credential accessor, additive metadata and config
//! updates, and tombstoning.
//!
//! Expected failures come back as [`ServiceError`]; nothing here panics on bad input.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{error, info, instrument, warn};

use crate::credentials::{
    ApiKeyCredentials, AuthMode, BasicCredentials, Credentials, TableauCredentials,
    TbaCredentials, UnauthCredentials, parse_raw_credentials,
};
use crate::error::{ErrorKind, ServiceError};
use crate::providers::{ProviderTemplate, TemplateCatalog};
use crate::repositories::{
    Connection, ConnectionPatch, ConnectionRef, ConnectionStore, Integration, IntegrationStore,
    NewConnection,
};
use crate::scheduler::TaskScheduler;
use crate::token_refresh::TokenRefresher;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpsertOperation {
    Creation,
    Override,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpsertResult {
    pub connection: Connection,
    pub operation: UpsertOperation,
}

/// Everything needed to create or override a connection
#[derive(Debug, Clone)]
pub struct UpsertRequest {
    pub connection_id: String,
    pub provider_config_key: String,
    pub provider: String,
    pub credentials: Credentials,
    pub connection_config: Map<String, Value>,
    pub environment_id: i32,
    pub account_id: i32,
    /// `None` keeps whatever metadata is stored
    pub metadata: Option<Map<String, Value>>,
}

/// Either the API key or the username/password pair
#[derive(Debug, Clone)]
pub enum ApiCredentials {
    ApiKey(String),
    Basic { username: String, password: String },
}

/// Callbacks around a refresh performed by [`ConnectionService::get_connection_credentials`]
#[async_trait]
pub trait RefreshHooks: Send + Sync {
    async fn on_refresh_success(&self, _connection: &Connection, _integration: &Integration) {}

    async fn on_refresh_failed(
        &self,
        _connection: &Connection,
        _integration: &Integration,
        _template: &ProviderTemplate,
        _error: &ServiceError,
    ) {
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRefreshHooks;

impl RefreshHooks for NoopRefreshHooks {}

#[derive(Clone)]
pub struct ConnectionService {
    store: Arc<dyn ConnectionStore>,
    integrations: Arc<dyn IntegrationStore>,
    templates: Arc<TemplateCatalog>,
    refresher: TokenRefresher,
    scheduler: Arc<dyn TaskScheduler>,
}

impl std::fmt::Debug for ConnectionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionService")
            .field("templates", &self.templates.len())
            .field("refresher", &self.refresher)
            .finish_non_exhaustive()
    }
}

fn require_keys(connection: &ConnectionRef) -> Result<(), ServiceError> {
    if connection.connection_id.is_empty() {
        return Err(ServiceError::new(ErrorKind::MissingConnection));
    }
    if connection.provider_config_key.is_empty() {
        return Err(ServiceError::new(ErrorKind::MissingProviderConfig));
    }
    Ok(())
}

fn object_field(raw: &Value, key: &str) -> Option<Map<String, Value>> {
    raw.get(key).and_then(Value::as_object).cloned()
}

fn merged(mut base: Map<String, Value>, update: Map<String, Value>) -> Map<String, Value> {
    base.extend(update);
    base
}

impl ConnectionService {
    pub fn new(
        store: Arc<dyn ConnectionStore>,
        integrations: Arc<dyn IntegrationStore>,
        templates: Arc<TemplateCatalog>,
        refresher: TokenRefresher,
        scheduler: Arc<dyn TaskScheduler>,
    ) -> Self {
        Self {
            store,
            integrations,
            templates,
            refresher,
            scheduler,
        }
    }

    pub fn store(&self) -> &Arc<dyn ConnectionStore> {
        &self.store
    }

    /// Insert a new connection or override the live one with the same natural key.
    ///
    /// Overrides merge the supplied config and metadata into what is stored.
    #[instrument(skip_all, fields(
        connection_id = %request.connection_id,
        provider_config_key = %request.provider_config_key,
        environment_id = request.environment_id,
        account_id = request.account_id,
    ))]
    pub async fn upsert(&self, request: UpsertRequest) -> Result<UpsertResult, ServiceError> {
        let reference = ConnectionRef::new(
            &request.connection_id,
            &request.provider_config_key,
            request.environment_id,
        );
        require_keys(&reference)?;

        if let Some(existing) = self.store.find(&reference).await? {
            let patch = ConnectionPatch {
                provider: Some(request.provider),
                credentials: Some(request.credentials),
                connection_config: Some(merged(
                    existing.connection_config,
                    request.connection_config,
                )),
                metadata: Some(match request.metadata {
                    Some(metadata) => merged(existing.metadata, metadata),
                    None => existing.metadata,
                }),
            };
            let connection = self.store.update(existing.id, patch).await?;
            info!(id = connection.id, "Connection overridden");
            return Ok(UpsertResult {
                connection,
                operation: UpsertOperation::Override,
            });
        }

        let integration = self.integration(&reference).await?;
        let connection = self
            .store
            .insert(NewConnection {
                connection_id: request.connection_id,
                provider_config_key: request.provider_config_key,
                provider: request.provider,
                environment_id: request.environment_id,
                config_id: integration.id,
                credentials: request.credentials,
                connection_config: request.connection_config,
                metadata: request.metadata.unwrap_or_default(),
            })
            .await?;

        info!(id = connection.id, "Connection created");
        Ok(UpsertResult {
            connection,
            operation: UpsertOperation::Creation,
        })
    }

    pub async fn upsert_api_connection(
        &self,
        connection: &ConnectionRef,
        provider: &str,
        credentials: ApiCredentials,
        connection_config: Map<String, Value>,
        account_id: i32,
    ) -> Result<UpsertResult, ServiceError> {
        let credentials = match credentials {
            ApiCredentials::ApiKey(api_key) => Credentials::ApiKey(ApiKeyCredentials {
                api_key,
                raw: Value::Null,
            }),
            ApiCredentials::Basic { username, password } => {
                Credentials::Basic(BasicCredentials {
                    username,
                    password,
                    raw: Value::Null,
                })
            }
        };
        self.upsert(UpsertRequest {
            connection_id: connection.connection_id.clone(),
            provider_config_key: connection.provider_config_key.clone(),
            provider: provider.to_string(),
            credentials,
            connection_config,
            environment_id: connection.environment_id,
            account_id,
            metadata: None,
        })
        .await
    }

    pub async fn upsert_unauth_connection(
        &self,
        connection: &ConnectionRef,
        provider: &str,
        account_id: i32,
    ) -> Result<UpsertResult, ServiceError> {
        self.upsert(UpsertRequest {
            connection_id: connection.connection_id.clone(),
            provider_config_key: connection.provider_config_key.clone(),
            provider: provider.to_string(),
            credentials: Credentials::Unauth(UnauthCredentials::default()),
            connection_config: Map::new(),
            environment_id: connection.environment_id,
            account_id,
            metadata: None,
        })
        .await
    }

    pub async fn upsert_tba_connection(
        &self,
        connection: &ConnectionRef,
        provider: &str,
        credentials: TbaCredentials,
        connection_config: Map<String, Value>,
        account_id: i32,
    ) -> Result<UpsertResult, ServiceError> {
        self.upsert(UpsertRequest {
            connection_id: connection.connection_id.clone(),
            provider_config_key: connection.provider_config_key.clone(),
            provider: provider.to_string(),
            credentials: Credentials::Tba(credentials),
            connection_config,
            environment_id: connection.environment_id,
            account_id,
            metadata: None,
        })
        .await
    }

    pub async fn upsert_tableau_connection(
        &self,
        connection: &ConnectionRef,
        provider: &str,
        credentials: TableauCredentials,
        connection_config: Map<String, Value>,
        account_id: i32,
    ) -> Result<UpsertResult, ServiceError> {
        self.upsert(UpsertRequest {
            connection_id: connection.connection_id.clone(),
            provider_config_key: connection.provider_config_key.clone(),
            provider: provider.to_string(),
            credentials: Credentials::Tableau(credentials),
            connection_config,
            environment_id: connection.environment_id,
            account_id,
            metadata: None,
        })
        .await
    }

    /// Store credentials obtained outside the authorization flow.
    ///
    /// `raw` is parsed as a token response for `mode`. Its `connection_config` and
    /// `metadata` objects, when present, are stored with the connection.
    #[instrument(skip_all, fields(
        connection_id = %connection.connection_id,
        provider_config_key = %connection.provider_config_key,
        mode = %mode,
    ))]
    pub async fn import_oauth_connection(
        &self,
        connection: &ConnectionRef,
        provider: &str,
        mode: AuthMode,
        raw: &Value,
        account_id: i32,
    ) -> Result<UpsertResult, ServiceError> {
        let credentials = parse_raw_credentials(raw, mode)?;
        let result = self
            .upsert(UpsertRequest {
                connection_id: connection.connection_id.clone(),
                provider_config_key: connection.provider_config_key.clone(),
                provider: provider.to_string(),
                credentials,
                connection_config: object_field(raw, "connection_config").unwrap_or_default(),
                environment_id: connection.environment_id,
                account_id,
                metadata: object_field(raw, "metadata"),
            })
            .await?;

        info!(operation = ?result.operation, "Connection imported");
        Ok(result)
    }

    /// Import an API key or basic pair; the connection config starts empty.
    pub async fn import_api_auth_connection(
        &self,
        connection: &ConnectionRef,
        provider: &str,
        credentials: ApiCredentials,
        account_id: i32,
    ) -> Result<UpsertResult, ServiceError> {
        self.upsert_api_connection(connection, provider, credentials, Map::new(), account_id)
            .await
    }

    /// Stored connection as-is. Never refreshes.
    pub async fn get(&self, connection: &ConnectionRef) -> Result<Connection, ServiceError> {
        require_keys(connection)?;
        self.store
            .find(connection)
            .await?
            .ok_or_else(|| ServiceError::unknown_connection(connection))
    }

    /// Connection with credentials fit for an outbound call.
    ///
    /// Refreshable kinds go through the refresh protocol first. A failed refresh still
    /// stamps `last_fetched_at` so a broken connection is not retried in a hot loop.
    #[instrument(skip_all, fields(connection = %reference, instant_refresh))]
    pub async fn get_connection_credentials(
        &self,
        reference: &ConnectionRef,
        instant_refresh: bool,
        hooks: &dyn RefreshHooks,
    ) -> Result<Connection, ServiceError> {
        let mut connection = self.get(reference).await?;
        let integration = self.integration(reference).await?;
        let template = self.template(&integration)?;

        if connection.credentials.auth_mode().is_refreshable() {
            match self
                .refresher
                .refresh_if_needed(template, &integration, reference, instant_refresh)
                .await
            {
                Ok(outcome) => {
                    if outcome.refreshed {
                        hooks.on_refresh_success(&connection, &integration).await;
                    }
                    connection.credentials = outcome.credentials;
                }
                Err(refresh_error) => {
                    error!(kind = %refresh_error.kind(), "Failed to refresh credentials");
                    hooks
                        .on_refresh_failed(&connection, &integration, template, &refresh_error)
                        .await;
                    self.touch_last_fetched(&connection).await;
                    return Err(refresh_error.for_connection(reference));
                }
            }
        }

        self.touch_last_fetched(&connection).await;
        Ok(connection)
    }

    async fn touch_last_fetched(&self, connection: &Connection) {
        if let Err(error) = self.store.touch_last_fetched(connection.id).await {
            warn!(error = %error, "Failed to stamp last_fetched_at");
        }
    }

    /// Tombstone the connection and withdraw its queued tasks.
    #[instrument(skip_all, fields(connection = %reference))]
    pub async fn delete_connection(&self, reference: &ConnectionRef) -> Result<(), ServiceError> {
        let connection = self.get(reference).await?;
        self.store.soft_delete(connection.id).await?;
        self.scheduler.soft_delete_by_connection(&connection).await?;
        info!(id = connection.id, "Connection deleted");
        Ok(())
    }

    pub async fn update_metadata(
        &self,
        reference: &ConnectionRef,
        metadata: Map<String, Value>,
    ) -> Result<Map<String, Value>, ServiceError> {
        let connection = self.get(reference).await?;
        let metadata = merged(connection.metadata, metadata);
        self.patch(connection.id, None, Some(metadata))
            .await
            .map(|connection| connection.metadata)
    }

    pub async fn replace_metadata(
        &self,
        reference: &ConnectionRef,
        metadata: Map<String, Value>,
    ) -> Result<Map<String, Value>, ServiceError> {
        let connection = self.get(reference).await?;
        self.patch(connection.id, None, Some(metadata))
            .await
            .map(|connection| connection.metadata)
    }

    pub async fn update_connection_config(
        &self,
        reference: &ConnectionRef,
        config: Map<String, Value>,
    ) -> Result<Map<String, Value>, ServiceError> {
        let connection = self.get(reference).await?;
        let config = merged(connection.connection_config, config);
        self.patch(connection.id, Some(config), None)
            .await
            .map(|connection| connection.connection_config)
    }

    pub async fn replace_connection_config(
        &self,
        reference: &ConnectionRef,
        config: Map<String, Value>,
    ) -> Result<Map<String, Value>, ServiceError> {
        let connection = self.get(reference).await?;
        self.patch(connection.id, Some(config), None)
            .await
            .map(|connection| connection.connection_config)
    }

    /// Connections nobody has read credentials for since `older_than`
    pub async fn find_stale(
        &self,
        older_than: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<Connection>, ServiceError> {
        self.store.find_stale(older_than, limit).await
    }

    /// Live connections in `environment_id` whose config matches every pair
    pub async fn find_by_config_values(
        &self,
        environment_id: i32,
        pairs: &[(&str, &str)],
    ) -> Result<Vec<Connection>, ServiceError> {
        self.store.find_by_config_values(pairs, environment_id).await
    }

    async fn patch(
        &self,
        id: i32,
        connection_config: Option<Map<String, Value>>,
        metadata: Option<Map<String, Value>>,
    ) -> Result<Connection, ServiceError> {
        self.store
            .update(
                id,
                ConnectionPatch {
                    connection_config,
                    metadata,
                    ..ConnectionPatch::default()
                },
            )
            .await
    }

    async fn integration(&self, reference: &ConnectionRef) -> Result<Integration, ServiceError> {
        self.integrations
            .find_by_key(&reference.provider_config_key, reference.environment_id)
            .await?
            .ok_or_else(|| {
                ServiceError::unknown_provider_config(
                    &reference.provider_config_key,
                    reference.environment_id,
                )
            })
    }

    fn template(&self, integration: &Integration) -> Result<&ProviderTemplate, ServiceError> {
        self.templates.get(&integration.provider).ok_or_else(|| {
            ServiceError::new(ErrorKind::UnknownProviderTemplate)
                .with_payload(serde_json::json!({ "provider": integration.provider }))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_is_additive_and_right_biased() {
        let base = json!({"a": 1, "b": 2}).as_object().cloned().unwrap();
        let update = json!({"b": 3, "c": 4}).as_object().cloned().unwrap();
        assert_eq!(
            Value::Object(merged(base, update)),
            json!({"a": 1, "b": 3, "c": 4})
        );
    }

    #[test]
    fn test_require_keys() {
        assert_eq!(
            require_keys(&ConnectionRef::new("", "pck", 1))
                .unwrap_err()
                .kind(),
            ErrorKind::MissingConnection
        );
        assert_eq!(
            require_keys(&ConnectionRef::new("c", "", 1))
                .unwrap_err()
                .kind(),
            ErrorKind::MissingProviderConfig
        );
        assert!(require_keys(&ConnectionRef::new("c", "pck", 1)).is_ok());
    }

    #[test]
    fn test_operation_wire_names() {
        assert_eq!(
            serde_json::to_value(UpsertOperation::Creation).unwrap(),
            json!("creation")
        );
        assert_eq!(
            serde_json::to_value(UpsertOperation::Override).unwrap(),
            json!("override")
        );
    }
}
