//! Test utilities for database testing.
//!
//! In-memory SQLite with every migration applied, plus fixtures for environments,
//! integrations and a fully wired connection service.

use anyhow::Result;
use credential_hub::{
    connection_service::ConnectionService,
    credentials::AuthMode,
    crypto::CryptoKey,
    locking::{DatabaseLockStore, Locking},
    models::environment,
    providers::{ProviderTemplate, TemplateCatalog, TokenUrl},
    repositories::{
        ConnectionRepository, EnvironmentRepository, Integration, IntegrationRepository,
        NewIntegration, SyncConfigRepository,
    },
    scheduler::DatabaseTaskScheduler,
    token_exchange::HttpCredentialExchanger,
    token_refresh::{RefreshSettings, TokenRefresher},
};
use migration::{Migrator, MigratorTrait};
use sea_orm::{ConnectOptions, Database, DatabaseConnection};
use serde_json::Value;
use std::{sync::Arc, time::Duration};

/// Sets up an in-memory SQLite database with all migrations applied.
///
/// The pool holds a single connection; each SQLite memory connection is its own database.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let mut options = ConnectOptions::new("sqlite::memory:");
    options.max_connections(1).sqlx_logging(false);
    let db = Database::connect(options).await?;

    Migrator::up(&db, None).await?;

    Ok(db)
}

#[allow(dead_code)]
pub async fn setup_test_db_arc() -> Result<Arc<DatabaseConnection>> {
    Ok(Arc::new(setup_test_db().await?))
}

#[allow(dead_code)]
pub fn test_crypto_key() -> CryptoKey {
    CryptoKey::new(vec![7u8; 32]).expect("32-byte key")
}

#[allow(dead_code)]
pub async fn create_environment(
    db: &Arc<DatabaseConnection>,
    webhooks_enabled: bool,
) -> Result<environment::Model> {
    Ok(EnvironmentRepository::new(db.clone())
        .create("dev", 1, webhooks_enabled)
        .await?)
}

#[allow(dead_code)]
pub async fn create_integration(
    db: &Arc<DatabaseConnection>,
    environment_id: i32,
    unique_key: &str,
    provider: &str,
    custom: Value,
) -> Result<Integration> {
    Ok(IntegrationRepository::new(db.clone())
        .create(NewIntegration {
            environment_id,
            unique_key: unique_key.to_string(),
            provider: provider.to_string(),
            oauth_client_id: Some("client-id".to_string()),
            oauth_client_secret: Some("client-secret".to_string()),
            custom: custom.as_object().cloned().unwrap_or_default(),
        })
        .await?)
}

/// OAuth2 template whose token endpoint is `token_url`
#[allow(dead_code)]
pub fn oauth2_template(token_url: &str) -> ProviderTemplate {
    let mut template = ProviderTemplate::new(AuthMode::OAuth2);
    template.token_url = Some(TokenUrl::Single(token_url.to_string()));
    template
}

/// Everything a test needs to drive the credential engine against one database
#[allow(dead_code)]
pub struct TestHub {
    pub db: Arc<DatabaseConnection>,
    pub store: Arc<ConnectionRepository>,
    pub scheduler: Arc<DatabaseTaskScheduler>,
    pub service: ConnectionService,
}

#[allow(dead_code)]
pub fn lock_settings() -> RefreshSettings {
    RefreshSettings {
        lock_ttl: Duration::from_secs(2),
        ..RefreshSettings::default()
    }
}

/// Connection service over `db` using the shared `locks` table and a real HTTP exchanger.
#[allow(dead_code)]
pub fn build_hub(db: Arc<DatabaseConnection>, templates: TemplateCatalog) -> TestHub {
    let locking = Locking::new(Arc::new(DatabaseLockStore::new(db.clone())))
        .with_poll_interval(Duration::from_millis(10));
    build_hub_with_locking(db, templates, locking)
}

#[allow(dead_code)]
pub fn build_hub_with_locking(
    db: Arc<DatabaseConnection>,
    templates: TemplateCatalog,
    locking: Locking,
) -> TestHub {
    let store = Arc::new(ConnectionRepository::new(db.clone(), test_crypto_key()));
    let scheduler = Arc::new(DatabaseTaskScheduler::new(db.clone()));
    let exchanger = HttpCredentialExchanger::new(Duration::from_secs(5)).expect("http client");
    let refresher = TokenRefresher::new(store.clone(), Arc::new(exchanger), locking, lock_settings());

    let service = ConnectionService::new(
        store.clone(),
        Arc::new(IntegrationRepository::new(db.clone())),
        Arc::new(templates),
        refresher,
        scheduler.clone(),
    );

    TestHub {
        db,
        store,
        scheduler,
        service,
    }
}

#[allow(dead_code)]
pub fn sync_configs(db: &Arc<DatabaseConnection>) -> SyncConfigRepository {
    SyncConfigRepository::new(db.clone())
}
