//! # Inbound webhook router
//!
//! A delivery addressed to an integration is handed to the handler registered for the
//! integration's provider. The handler verifies it (when the provider signs), splits it
//! into events and extracts each event's type and tenant identifier; the [`Dispatcher`]
//! then resolves connections and fans out scheduler tasks.
//!
//! Batch deliveries concatenate the ids of every event without deduplication.

mod dispatch;
mod handlers;

use std::sync::Arc;

use axum::http::HeaderMap;
use metrics::{counter, histogram};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

pub use dispatch::{Dispatcher, WebhookEvent};
pub use handlers::{
    CONNECTION_ID_PROP, GithubAppHandler, HandlerRegistry, JiraHandler, MicrosoftTeamsHandler,
    SalesforceHandler, StripeAppHandler, WebhookHandler,
};

use crate::error::ServiceError;
use crate::repositories::IntegrationStore;

/// One inbound delivery, borrowed from the HTTP layer
#[derive(Debug, Clone, Copy)]
pub struct WebhookRequest<'a> {
    pub headers: &'a HeaderMap,
    /// Query string as a JSON object
    pub query: &'a Value,
    /// Parsed body; a JSON string when the body was not JSON
    pub body: &'a Value,
    pub raw_body: &'a [u8],
}

impl<'a> WebhookRequest<'a> {
    pub fn new(
        headers: &'a HeaderMap,
        query: &'a Value,
        body: &'a Value,
        raw_body: &'a [u8],
    ) -> Self {
        Self {
            headers,
            query,
            body,
            raw_body,
        }
    }

    pub fn header(&self, name: &str) -> Option<&'a str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RouteOutcome {
    pub connection_ids: Vec<String>,
    /// Body to send back to the provider, for providers that expect an echo
    pub parsed_body: Option<Value>,
}

/// Walk a dotted path through objects (and arrays, by index).
pub fn lookup_path<'v>(value: &'v Value, path: &str) -> Option<&'v Value> {
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|at| items.get(at)),
        _ => None,
    })
}

/// Non-empty strings and numbers as text; anything else counts as absent.
pub fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(text) if !text.is_empty() => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

#[derive(Clone)]
pub struct WebhookRouter {
    integrations: Arc<dyn IntegrationStore>,
    dispatcher: Dispatcher,
    registry: HandlerRegistry,
}

impl std::fmt::Debug for WebhookRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookRouter")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl WebhookRouter {
    pub fn new(
        integrations: Arc<dyn IntegrationStore>,
        dispatcher: Dispatcher,
        registry: HandlerRegistry,
    ) -> Self {
        Self {
            integrations,
            dispatcher,
            registry,
        }
    }

    /// Route one delivery. Unknown integrations, unhandled providers and failed
    /// verification all yield an empty outcome.
    #[instrument(skip_all, fields(environment_id, provider_config_key))]
    pub async fn route(
        &self,
        environment_id: i32,
        provider_config_key: &str,
        request: WebhookRequest<'_>,
    ) -> Result<RouteOutcome, ServiceError> {
        let started = Instant::now();

        let Some(integration) = self
            .integrations
            .find_by_key(provider_config_key, environment_id)
            .await?
        else {
            warn!("Webhook for an unknown integration");
            return Ok(RouteOutcome::default());
        };

        let provider = integration.provider.clone();
        counter!("webhook_received_total", "provider" => provider.clone()).increment(1);

        let Some(handler) = self.registry.get(&provider) else {
            debug!(provider = %provider, "No webhook handler for provider");
            return Ok(RouteOutcome::default());
        };

        if let Err(rejection) = handler.verify(&integration, &request) {
            warn!(provider = %provider, reason = rejection.reason(), error = %rejection, "Webhook signature rejected");
            counter!(
                "webhook_rejected_total",
                "provider" => provider,
                "reason" => rejection.reason()
            )
            .increment(1);
            return Ok(RouteOutcome::default());
        }

        let mut connection_ids = Vec::new();
        for body in handler.events(request.body) {
            let event = WebhookEvent {
                event_type: handler.event_type(&request, body),
                identifier: handler.identifier(&request, body),
                identifier_path: handler.identifier_path(),
                config_prop: handler.config_prop(),
                body,
            };
            connection_ids.extend(self.dispatcher.dispatch(&integration, &event).await?);
        }

        histogram!("webhook_route_latency_ms").record(started.elapsed().as_secs_f64() * 1_000.0);

        Ok(RouteOutcome {
            connection_ids,
            parsed_body: handler.echo_body().then(|| request.body.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_lookup_path() {
        let value = json!({"a": {"b": [{"c": "deep"}]}, "n": 7});
        assert_eq!(lookup_path(&value, "a.b.0.c"), Some(&json!("deep")));
        assert_eq!(lookup_path(&value, "n"), Some(&json!(7)));
        assert_eq!(lookup_path(&value, "a.missing"), None);
        assert_eq!(lookup_path(&value, "n.too_far"), None);
    }

    #[test]
    fn test_scalar_string() {
        assert_eq!(scalar_string(&json!("x")), Some("x".to_string()));
        assert_eq!(scalar_string(&json!(12)), Some("12".to_string()));
        assert_eq!(scalar_string(&json!("")), None);
        assert_eq!(scalar_string(&json!(null)), None);
        assert_eq!(scalar_string(&json!({"id": 1})), None);
    }
}
