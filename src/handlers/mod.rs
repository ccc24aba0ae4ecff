//! # API Handlers
//!
//! HTTP endpoint handlers for the credential hub.

pub mod webhooks;

use axum::{extract::State, http::StatusCode, response::Json};
use serde::Serialize;
use utoipa::ToSchema;

use crate::db;
use crate::error::ApiError;
use crate::models::ServiceInfo;
use crate::server::AppState;

/// Probe response body
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct HealthStatus {
    pub status: String,
}

/// Root handler that returns basic service information
#[utoipa::path(
    get,
    path = "/",
    responses(
        (status = 200, description = "Service information", body = ServiceInfo)
    ),
    tag = "root"
)]
pub async fn root() -> Json<ServiceInfo> {
    Json(ServiceInfo::default())
}

/// Liveness probe
#[utoipa::path(
    get,
    path = "/healthz",
    responses((status = 200, description = "Process is up", body = HealthStatus)),
    tag = "operations"
)]
pub async fn healthz() -> Json<HealthStatus> {
    Json(HealthStatus { status: "ok".to_string() })
}

/// Readiness probe; fails while the database is unreachable
#[utoipa::path(
    get,
    path = "/readyz",
    responses(
        (status = 200, description = "Database reachable", body = HealthStatus),
        (status = 503, description = "Database unreachable", body = ApiError)
    ),
    tag = "operations"
)]
pub async fn readyz(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<HealthStatus>), ApiError> {
    db::health_check(&state.db).await.map_err(|error| {
        tracing::warn!(error = %error, "Readiness check failed");
        ApiError::service_unavailable("Database is not reachable")
    })?;
    Ok((StatusCode::OK, Json(HealthStatus { status: "ready".to_string() })))
}

#[cfg(test)]
mod tests;
