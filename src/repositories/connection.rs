//! Connection repository
//!
//! [`ConnectionStore`] is the persistence seam the lifecycle engine and the webhook router
//! talk to. [`ConnectionRepository`] implements it over SeaORM, sealing the credential
//! union with AES-256-GCM bound to the connection's natural key. Every read and write is
//! scoped to non-deleted rows.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, DatabaseConnection, EntityTrait, NotSet,
    QueryFilter, QueryOrder, QuerySelect, Set,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::credentials::Credentials;
use crate::crypto::{CryptoKey, decrypt_credentials, encrypt_credentials};
use crate::error::{ErrorKind, ServiceError};
use crate::models::connection::{self, Entity as ConnectionEntity};

/// Natural key of a connection: (`connection_id`, `provider_config_key`, `environment_id`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionRef {
    pub connection_id: String,
    pub provider_config_key: String,
    pub environment_id: i32,
}

impl ConnectionRef {
    pub fn new(
        connection_id: impl Into<String>,
        provider_config_key: impl Into<String>,
        environment_id: i32,
    ) -> Self {
        Self {
            connection_id: connection_id.into(),
            provider_config_key: provider_config_key.into(),
            environment_id,
        }
    }

    /// Diagnostic payload embedded in errors; identifiers only
    pub fn to_payload(&self) -> Value {
        json!({
            "connection_id": self.connection_id,
            "provider_config_key": self.provider_config_key,
            "environment_id": self.environment_id,
        })
    }
}

impl fmt::Display for ConnectionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.environment_id, self.provider_config_key, self.connection_id
        )
    }
}

/// A decrypted connection row
#[derive(Debug, Clone, PartialEq)]
pub struct Connection {
    pub id: i32,
    pub connection_id: String,
    pub provider_config_key: String,
    pub provider: String,
    pub environment_id: i32,
    pub config_id: i32,
    pub credentials: Credentials,
    pub connection_config: Map<String, Value>,
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_fetched_at: Option<DateTime<Utc>>,
    pub deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Connection {
    pub fn reference(&self) -> ConnectionRef {
        ConnectionRef::new(
            &self.connection_id,
            &self.provider_config_key,
            self.environment_id,
        )
    }
}

/// Row to insert
#[derive(Debug, Clone)]
pub struct NewConnection {
    pub connection_id: String,
    pub provider_config_key: String,
    pub provider: String,
    pub environment_id: i32,
    pub config_id: i32,
    pub credentials: Credentials,
    pub connection_config: Map<String, Value>,
    pub metadata: Map<String, Value>,
}

impl NewConnection {
    fn reference(&self) -> ConnectionRef {
        ConnectionRef::new(
            &self.connection_id,
            &self.provider_config_key,
            self.environment_id,
        )
    }
}

/// Fields to overwrite on update; `None` leaves the column alone
#[derive(Debug, Clone, Default)]
pub struct ConnectionPatch {
    pub provider: Option<String>,
    pub credentials: Option<Credentials>,
    pub connection_config: Option<Map<String, Value>>,
    pub metadata: Option<Map<String, Value>>,
}

#[async_trait]
pub trait ConnectionStore: Send + Sync {
    async fn find(&self, connection: &ConnectionRef) -> Result<Option<Connection>, ServiceError>;

    /// Connections in `environment_id` whose config map has `key` equal to `value`
    async fn find_by_config_value(
        &self,
        key: &str,
        value: &str,
        environment_id: i32,
    ) -> Result<Vec<Connection>, ServiceError>;

    /// Connections in `environment_id` whose config map matches every `(key, value)` pair.
    ///
    /// An empty pair list matches nothing.
    async fn find_by_config_values(
        &self,
        pairs: &[(&str, &str)],
        environment_id: i32,
    ) -> Result<Vec<Connection>, ServiceError>;

    async fn insert(&self, connection: NewConnection) -> Result<Connection, ServiceError>;

    /// Rejects a credentials patch whose variant differs from the stored type tag.
    async fn update(&self, id: i32, patch: ConnectionPatch) -> Result<Connection, ServiceError>;

    async fn soft_delete(&self, id: i32) -> Result<(), ServiceError>;

    async fn touch_last_fetched(&self, id: i32) -> Result<(), ServiceError>;

    /// Connections not fetched since `older_than`, never-fetched ones included
    async fn find_stale(
        &self,
        older_than: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<Connection>, ServiceError>;
}

#[derive(Debug, Clone)]
pub struct ConnectionRepository {
    pub db: Arc<DatabaseConnection>,
    pub crypto_key: CryptoKey,
}

impl ConnectionRepository {
    pub fn new(db: Arc<DatabaseConnection>, crypto_key: CryptoKey) -> Self {
        Self { db, crypto_key }
    }

    fn decode(&self, model: connection::Model) -> Result<Connection, ServiceError> {
        let reference = ConnectionRef::new(
            &model.connection_id,
            &model.provider_config_key,
            model.environment_id,
        );

        let Some(ciphertext) = model.credentials.as_deref() else {
            return Err(ServiceError::storage("connection has no stored credentials")
                .with_payload(reference.to_payload()));
        };

        let credentials = decrypt_credentials(&self.crypto_key, &reference, ciphertext)
            .map_err(|error| {
                // Identifiers only, never the ciphertext.
                tracing::error!(
                    connection = %reference,
                    "Credential decryption failed"
                );
                ServiceError::from(error)
            })?;

        if credentials.auth_mode().as_str() != model.credentials_type {
            warn!(
                connection = %reference,
                stored_type = %model.credentials_type,
                decoded_type = %credentials.auth_mode(),
                "Credential type column disagrees with sealed payload"
            );
        }

        Ok(Connection {
            id: model.id,
            connection_id: model.connection_id,
            provider_config_key: model.provider_config_key,
            provider: model.provider,
            environment_id: model.environment_id,
            config_id: model.config_id,
            credentials,
            connection_config: json_map(model.connection_config),
            metadata: json_map(model.metadata),
            created_at: model.created_at.with_timezone(&Utc),
            updated_at: model.updated_at.with_timezone(&Utc),
            last_fetched_at: model.last_fetched_at.map(|at| at.with_timezone(&Utc)),
            deleted: model.deleted,
            deleted_at: model.deleted_at.map(|at| at.with_timezone(&Utc)),
        })
    }

    async fn find_live_model(&self, id: i32) -> Result<connection::Model, ServiceError> {
        ConnectionEntity::find_by_id(id)
            .filter(connection::Column::Deleted.eq(false))
            .one(&*self.db)
            .await?
            .ok_or_else(|| {
                ServiceError::new(ErrorKind::UnknownConnection)
                    .with_payload(json!({ "id": id }))
            })
    }

    /// Raw row lookup including tombstones, for audits and tests
    pub async fn find_row_including_deleted(
        &self,
        connection: &ConnectionRef,
    ) -> Result<Option<connection::Model>, ServiceError> {
        Ok(ConnectionEntity::find()
            .filter(connection::Column::ConnectionId.eq(&connection.connection_id))
            .filter(connection::Column::ProviderConfigKey.eq(&connection.provider_config_key))
            .filter(connection::Column::EnvironmentId.eq(connection.environment_id))
            .order_by_desc(connection::Column::Id)
            .one(&*self.db)
            .await?)
    }
}

fn json_map(value: Option<Value>) -> Map<String, Value> {
    match value {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

#[async_trait]
impl ConnectionStore for ConnectionRepository {
    async fn find(&self, connection: &ConnectionRef) -> Result<Option<Connection>, ServiceError> {
        let model = ConnectionEntity::find()
            .filter(connection::Column::ConnectionId.eq(&connection.connection_id))
            .filter(connection::Column::ProviderConfigKey.eq(&connection.provider_config_key))
            .filter(connection::Column::EnvironmentId.eq(connection.environment_id))
            .filter(connection::Column::Deleted.eq(false))
            .one(&*self.db)
            .await?;

        model.map(|model| self.decode(model)).transpose()
    }

    async fn find_by_config_value(
        &self,
        key: &str,
        value: &str,
        environment_id: i32,
    ) -> Result<Vec<Connection>, ServiceError> {
        self.find_by_config_values(&[(key, value)], environment_id)
            .await
    }

    async fn find_by_config_values(
        &self,
        pairs: &[(&str, &str)],
        environment_id: i32,
    ) -> Result<Vec<Connection>, ServiceError> {
        if pairs.is_empty() {
            return Ok(Vec::new());
        }

        let mut query = ConnectionEntity::find()
            .filter(connection::Column::EnvironmentId.eq(environment_id))
            .filter(connection::Column::Deleted.eq(false));
        for (key, value) in pairs {
            // CAST keeps numeric config values comparable to the textual identifier on SQLite.
            query = query.filter(Expr::cust_with_values(
                "CAST(connection_config ->> ? AS TEXT) = ?",
                [*key, *value],
            ));
        }
        let models = query
            .order_by_asc(connection::Column::Id)
            .all(&*self.db)
            .await?;

        debug!(
            keys = pairs.len(),
            environment_id,
            matches = models.len(),
            "Resolved connections by config values"
        );

        models.into_iter().map(|model| self.decode(model)).collect()
    }

    async fn insert(&self, connection: NewConnection) -> Result<Connection, ServiceError> {
        let reference = connection.reference();
        let ciphertext =
            encrypt_credentials(&self.crypto_key, &reference, &connection.credentials)?;
        let now = Utc::now();

        let active = connection::ActiveModel {
            id: NotSet,
            connection_id: Set(connection.connection_id),
            provider_config_key: Set(connection.provider_config_key),
            provider: Set(connection.provider),
            environment_id: Set(connection.environment_id),
            config_id: Set(connection.config_id),
            credentials_type: Set(connection.credentials.auth_mode().as_str().to_string()),
            credentials: Set(Some(ciphertext)),
            connection_config: Set(Some(Value::Object(connection.connection_config))),
            metadata: Set(Some(Value::Object(connection.metadata))),
            created_at: Set(now.into()),
            updated_at: Set(now.into()),
            last_fetched_at: Set(None),
            deleted: Set(false),
            deleted_at: Set(None),
        };

        let model = active.insert(&*self.db).await?;
        self.decode(model)
    }

    async fn update(&self, id: i32, patch: ConnectionPatch) -> Result<Connection, ServiceError> {
        let existing = self.find_live_model(id).await?;
        let reference = ConnectionRef::new(
            &existing.connection_id,
            &existing.provider_config_key,
            existing.environment_id,
        );

        let mut active: connection::ActiveModel = existing.clone().into();

        if let Some(credentials) = patch.credentials {
            let mode = credentials.auth_mode();
            if mode.as_str() != existing.credentials_type {
                return Err(
                    ServiceError::new(ErrorKind::CredentialTypeMismatch).with_payload(json!({
                        "connection_id": reference.connection_id,
                        "provider_config_key": reference.provider_config_key,
                        "environment_id": reference.environment_id,
                        "stored_type": existing.credentials_type,
                        "new_type": mode.as_str(),
                    })),
                );
            }
            let ciphertext = encrypt_credentials(&self.crypto_key, &reference, &credentials)?;
            active.credentials = Set(Some(ciphertext));
        }
        if let Some(provider) = patch.provider {
            active.provider = Set(provider);
        }
        if let Some(config) = patch.connection_config {
            active.connection_config = Set(Some(Value::Object(config)));
        }
        if let Some(metadata) = patch.metadata {
            active.metadata = Set(Some(Value::Object(metadata)));
        }
        active.updated_at = Set(Utc::now().into());

        let model = active.update(&*self.db).await?;
        self.decode(model)
    }

    async fn soft_delete(&self, id: i32) -> Result<(), ServiceError> {
        let now: sea_orm::prelude::DateTimeWithTimeZone = Utc::now().into();
        let result = ConnectionEntity::update_many()
            .col_expr(connection::Column::Deleted, Expr::value(true))
            .col_expr(connection::Column::DeletedAt, Expr::value(now))
            .col_expr(connection::Column::UpdatedAt, Expr::value(now))
            .col_expr(
                connection::Column::Credentials,
                Expr::value(Option::<Vec<u8>>::None),
            )
            .filter(connection::Column::Id.eq(id))
            .filter(connection::Column::Deleted.eq(false))
            .exec(&*self.db)
            .await?;

        if result.rows_affected == 0 {
            return Err(
                ServiceError::new(ErrorKind::UnknownConnection).with_payload(json!({ "id": id }))
            );
        }
        Ok(())
    }

    async fn touch_last_fetched(&self, id: i32) -> Result<(), ServiceError> {
        let now: sea_orm::prelude::DateTimeWithTimeZone = Utc::now().into();
        ConnectionEntity::update_many()
            .col_expr(connection::Column::LastFetchedAt, Expr::value(now))
            .filter(connection::Column::Id.eq(id))
            .filter(connection::Column::Deleted.eq(false))
            .exec(&*self.db)
            .await?;
        Ok(())
    }

    async fn find_stale(
        &self,
        older_than: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<Connection>, ServiceError> {
        let cutoff: sea_orm::prelude::DateTimeWithTimeZone = older_than.into();
        let models = ConnectionEntity::find()
            .filter(connection::Column::Deleted.eq(false))
            .filter(
                Condition::any()
                    .add(connection::Column::LastFetchedAt.is_null())
                    .add(connection::Column::LastFetchedAt.lt(cutoff)),
            )
            .order_by_asc(connection::Column::Id)
            .limit(limit)
            .all(&*self.db)
            .await?;

        models.into_iter().map(|model| self.decode(model)).collect()
    }
}
