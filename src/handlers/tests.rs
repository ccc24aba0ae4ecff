//! # Tests for Handlers

use axum::{extract::State, http::StatusCode, response::Json};
use chrono::{Duration, Utc};
use migration::{Migrator, MigratorTrait};
use sea_orm::{ConnectOptions, Database, DatabaseConnection};

use crate::config::{AppConfig, LockBackend};
use crate::handlers::{healthz, readyz, root};
use crate::server::AppState;

#[tokio::test]
async fn test_root_handler_returns_expected_service_info() {
    let Json(service_info) = root().await;

    assert_eq!(service_info.service, "credential-hub");
    assert_eq!(service_info.version, env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_root_handler_returns_valid_json() {
    let Json(service_info) = root().await;
    let json = serde_json::to_value(&service_info).unwrap();

    assert!(json.get("service").is_some());
    assert!(json.get("version").is_some());
}

#[tokio::test]
async fn test_healthz_is_static() {
    let Json(status) = healthz().await;
    assert_eq!(status.status, "ok");
}

async fn memory_db() -> DatabaseConnection {
    let mut options = ConnectOptions::new("sqlite::memory:");
    options.max_connections(1).sqlx_logging(false);
    Database::connect(options).await.unwrap()
}

fn test_config() -> AppConfig {
    AppConfig {
        profile: "test".to_string(),
        crypto_key: Some(vec![1u8; 32]),
        lock_backend: LockBackend::Memory,
        ..AppConfig::default()
    }
}

#[tokio::test]
async fn test_readyz_reports_reachable_database() {
    let state = AppState::from_parts(test_config(), memory_db().await).unwrap();

    let (status, Json(body)) = readyz(State(state)).await.unwrap();
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.status, "ready");
}

#[tokio::test]
async fn test_state_connections_serve_the_stale_scan() {
    let db = memory_db().await;
    Migrator::up(&db, None).await.unwrap();
    let state = AppState::from_parts(test_config(), db).unwrap();

    let stale = state
        .connections
        .find_stale(Utc::now() - Duration::days(30), 10)
        .await
        .unwrap();
    assert!(stale.is_empty());
}
