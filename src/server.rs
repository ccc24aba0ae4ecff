//! # Server Configuration
//!
//! Wires the stores, the credential engine and the webhook router into shared state and
//! serves the HTTP surface.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    Json, Router, middleware,
    routing::{get, post},
};
use migration::{Migrator, MigratorTrait};
use sea_orm::DatabaseConnection;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use utoipa::OpenApi;

use crate::config::{AppConfig, LockBackend};
use crate::connection_service::ConnectionService;
use crate::crypto::CryptoKey;
use crate::db;
use crate::handlers;
use crate::locking::{DatabaseLockStore, Locking};
use crate::providers::TemplateCatalog;
use crate::repositories::{
    ConnectionRepository, EnvironmentRepository, IntegrationRepository, SyncConfigRepository,
};
use crate::scheduler::DatabaseTaskScheduler;
use crate::telemetry::trace_context_middleware;
use crate::token_exchange::HttpCredentialExchanger;
use crate::token_refresh::{RefreshSettings, TokenRefresher};
use crate::webhooks::{Dispatcher, HandlerRegistry, WebhookRouter};

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: Arc<DatabaseConnection>,
    pub environments: EnvironmentRepository,
    pub connections: Arc<ConnectionService>,
    pub router: Arc<WebhookRouter>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("profile", &self.config.profile)
            .field("router", &self.router)
            .finish_non_exhaustive()
    }
}

impl AppState {
    /// Builds every service over an already migrated database.
    pub fn from_parts(config: AppConfig, db: DatabaseConnection) -> anyhow::Result<Self> {
        let db = Arc::new(db);

        let crypto_key = match config.crypto_key.clone() {
            Some(bytes) => CryptoKey::new(bytes).context("Invalid CREDHUB_CRYPTO_KEY")?,
            None => {
                warn!("No CREDHUB_CRYPTO_KEY configured; credentials are sealed with a per-process key");
                CryptoKey::ephemeral()
            }
        };

        let templates = TemplateCatalog::load(config.provider_templates_path.as_deref())
            .context("Failed to load provider templates")?;

        let locking = match config.lock_backend {
            LockBackend::Database => Locking::new(Arc::new(DatabaseLockStore::new(db.clone()))),
            LockBackend::Memory => Locking::in_memory(),
        };

        let exchanger = HttpCredentialExchanger::new(config.http_timeout())
            .context("Failed to build HTTP client")?;

        let store = Arc::new(ConnectionRepository::new(db.clone(), crypto_key));
        let integrations = Arc::new(IntegrationRepository::new(db.clone()));
        let sync_configs = Arc::new(SyncConfigRepository::new(db.clone()));
        let scheduler = Arc::new(DatabaseTaskScheduler::new(db.clone()));

        let refresher = TokenRefresher::new(
            store.clone(),
            Arc::new(exchanger),
            locking,
            RefreshSettings::from(&config.refresh),
        );

        let connections = ConnectionService::new(
            store.clone(),
            integrations.clone(),
            Arc::new(templates),
            refresher,
            scheduler.clone(),
        );

        let router = WebhookRouter::new(
            integrations,
            Dispatcher::new(store, sync_configs, scheduler),
            HandlerRegistry::builtin(),
        );

        Ok(Self {
            config: Arc::new(config),
            environments: EnvironmentRepository::new(db.clone()),
            db,
            connections: Arc::new(connections),
            router: Arc::new(router),
        })
    }
}

/// Connects, migrates and assembles the application state
pub async fn build_state(config: AppConfig) -> anyhow::Result<AppState> {
    let db = db::init_pool(&config).await?;
    Migrator::up(&db, None)
        .await
        .context("Failed to run database migrations")?;
    AppState::from_parts(config, db)
}

/// Creates and configures the Axum application router
pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::root))
        .route("/healthz", get(handlers::healthz))
        .route("/readyz", get(handlers::readyz))
        .route(
            "/webhook/{environment_uuid}/{provider_config_key}",
            post(handlers::webhooks::receive_webhook),
        )
        .route("/openapi.json", get(openapi_json))
        .layer(middleware::from_fn(trace_context_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

/// Starts the server and runs until SIGINT or SIGTERM
pub async fn run_server(config: AppConfig) -> anyhow::Result<()> {
    let addr = config.bind_addr().context("Invalid server address")?;
    let profile = config.profile.clone();

    let state = build_state(config).await?;
    let app = create_app(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!(%addr, %profile, "Server listening");

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn watch_signals(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!(error = %error, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                warn!(error = %error, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
    shutdown.cancel();
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::root,
        crate::handlers::healthz,
        crate::handlers::readyz,
        crate::handlers::webhooks::receive_webhook,
    ),
    components(
        schemas(
            crate::models::ServiceInfo,
            crate::handlers::HealthStatus,
            crate::error::ApiError,
        )
    ),
    info(
        title = "Credential Hub API",
        description = "Connection credential storage, refresh and webhook routing",
        version = env!("CARGO_PKG_VERSION"),
    )
)]
pub struct ApiDoc;
