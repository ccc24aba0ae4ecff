//! # Webhook Handlers
//!
//! Public entry point for provider webhooks. Providers get a 404 when webhooks are
//! switched off or the environment is unknown, and a 200 otherwise: routing problems
//! are logged here and never reported back.

use std::collections::HashMap;

use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, error, info};
use utoipa::IntoParams;
use uuid::Uuid;

use crate::server::AppState;
use crate::webhooks::WebhookRequest;

/// Path parameters for the webhook route
#[derive(Debug, Deserialize, IntoParams)]
pub struct WebhookPath {
    /// Public environment uuid
    #[param(example = "550e8400-e29b-41d4-a716-446655440000")]
    pub environment_uuid: String,
    /// Integration unique key within the environment
    #[param(min_length = 1, example = "jira-prod")]
    pub provider_config_key: String,
}

/// Bodies that are not JSON are routed as a JSON string.
pub(crate) fn parse_body(raw: &[u8]) -> Value {
    serde_json::from_slice(raw)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(raw).into_owned()))
}

fn query_object(query: HashMap<String, String>) -> Value {
    Value::Object(
        query
            .into_iter()
            .map(|(key, value)| (key, Value::String(value)))
            .collect::<Map<String, Value>>(),
    )
}

/// Receive a provider webhook
#[utoipa::path(
    post,
    path = "/webhook/{environment_uuid}/{provider_config_key}",
    params(WebhookPath),
    request_body(content = Object, description = "Provider payload, JSON or raw text"),
    responses(
        (status = 200, description = "Delivery accepted; echoed body for providers that expect it"),
        (status = 404, description = "Webhooks disabled or unknown environment")
    ),
    tag = "webhooks"
)]
pub async fn receive_webhook(
    State(state): State<AppState>,
    Path(path): Path<WebhookPath>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !state.config.webhooks_enabled {
        return StatusCode::NOT_FOUND.into_response();
    }

    let Ok(environment_uuid) = Uuid::parse_str(&path.environment_uuid) else {
        debug!(environment_uuid = %path.environment_uuid, "Webhook for a malformed environment uuid");
        return StatusCode::NOT_FOUND.into_response();
    };

    let environment = match state.environments.find_by_uuid(environment_uuid).await {
        Ok(Some(environment)) => environment,
        Ok(None) => return StatusCode::NOT_FOUND.into_response(),
        Err(db_error) => {
            error!(error = %db_error, "Failed to load environment for webhook");
            return StatusCode::OK.into_response();
        }
    };

    if !environment.webhooks_enabled {
        return StatusCode::NOT_FOUND.into_response();
    }

    let parsed = parse_body(&body);
    let query = query_object(query);
    let request = WebhookRequest::new(&headers, &query, &parsed, &body);

    match state
        .router
        .route(environment.id, &path.provider_config_key, request)
        .await
    {
        Ok(outcome) => {
            info!(
                provider_config_key = %path.provider_config_key,
                connections = outcome.connection_ids.len(),
                "Webhook routed"
            );
            match outcome.parsed_body {
                Some(echo) => (StatusCode::OK, Json(echo)).into_response(),
                None => StatusCode::OK.into_response(),
            }
        }
        Err(route_error) => {
            error!(
                provider_config_key = %path.provider_config_key,
                error = %route_error,
                "Webhook routing failed"
            );
            StatusCode::OK.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_body_falls_back_to_string() {
        assert_eq!(parse_body(br#"{"a":1}"#), json!({"a": 1}));
        assert_eq!(parse_body(b"token=abc"), json!("token=abc"));
        assert_eq!(parse_body(b""), json!(""));
    }

    #[test]
    fn test_query_object() {
        let query = HashMap::from([("connectionId".to_string(), "c1".to_string())]);
        assert_eq!(query_object(query), json!({"connectionId": "c1"}));
    }
}
