//! Per-provider webhook handlers and the static registry that selects them.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;

use super::{WebhookRequest, lookup_path, scalar_string};
use crate::repositories::Integration;
use crate::webhook_verification::{
    GITHUB_SIGNATURE_HEADER, STRIPE_SIGNATURE_HEADER, VerificationError, VerificationResult,
    verify_github_signature, verify_stripe_signature,
};

/// Stripe's own default tolerance for signed timestamps
const STRIPE_TOLERANCE_SECONDS: u64 = 300;

/// Config-map key that means "the identifier is the connection id itself"
pub const CONNECTION_ID_PROP: &str = "connectionId";

/// How one provider's deliveries are authenticated and addressed
pub trait WebhookHandler: Send + Sync {
    fn provider(&self) -> &'static str;

    /// Dotted path of the tenant identifier, looked up in the event then the query string
    fn identifier_path(&self) -> &'static str;

    /// Connection config key the identifier is matched against
    fn config_prop(&self) -> &'static str;

    /// Authenticity check; runs before any connection lookup.
    fn verify(&self, _integration: &Integration, _request: &WebhookRequest<'_>) -> VerificationResult<()> {
        Ok(())
    }

    /// Events carried by one delivery
    fn events<'a>(&self, body: &'a Value) -> Vec<&'a Value> {
        vec![body]
    }

    fn event_type(&self, request: &WebhookRequest<'_>, event: &Value) -> Option<String>;

    fn identifier(&self, request: &WebhookRequest<'_>, event: &Value) -> Option<String> {
        let path = self.identifier_path();
        lookup_path(event, path)
            .and_then(scalar_string)
            .or_else(|| lookup_path(request.query, path).and_then(scalar_string))
    }

    /// Whether the parsed body goes back to the provider in the response
    fn echo_body(&self) -> bool {
        false
    }
}

fn body_type(event: &Value, path: &str) -> Option<String> {
    lookup_path(event, path).and_then(scalar_string)
}

fn webhook_secret(integration: &Integration) -> VerificationResult<String> {
    integration
        .webhook_secret()
        .ok_or_else(|| VerificationError::MissingSecret {
            provider_config_key: integration.unique_key.clone(),
        })
}

/// Jira posts single events or arrays of them; each is routed on its own.
#[derive(Debug, Default)]
pub struct JiraHandler;

impl WebhookHandler for JiraHandler {
    fn provider(&self) -> &'static str {
        "jira"
    }

    fn identifier_path(&self) -> &'static str {
        "payload.user.accountId"
    }

    fn config_prop(&self) -> &'static str {
        "accountId"
    }

    fn events<'a>(&self, body: &'a Value) -> Vec<&'a Value> {
        match body {
            Value::Array(events) => events.iter().collect(),
            single => vec![single],
        }
    }

    fn event_type(&self, _request: &WebhookRequest<'_>, event: &Value) -> Option<String> {
        body_type(event, "payload.webhookEvent")
    }
}

#[derive(Debug, Default)]
pub struct StripeAppHandler;

impl WebhookHandler for StripeAppHandler {
    fn provider(&self) -> &'static str {
        "stripe-app"
    }

    fn identifier_path(&self) -> &'static str {
        "connectionId"
    }

    fn config_prop(&self) -> &'static str {
        CONNECTION_ID_PROP
    }

    fn verify(&self, integration: &Integration, request: &WebhookRequest<'_>) -> VerificationResult<()> {
        let signature = request.header(STRIPE_SIGNATURE_HEADER).unwrap_or_default();
        if signature.is_empty() {
            return Err(VerificationError::MissingSignature {
                header: "Stripe-Signature".to_string(),
            });
        }
        let secret = webhook_secret(integration)?;
        verify_stripe_signature(
            request.raw_body,
            signature,
            &secret,
            Utc::now().timestamp(),
            Some(STRIPE_TOLERANCE_SECONDS),
        )
    }

    fn event_type(&self, _request: &WebhookRequest<'_>, event: &Value) -> Option<String> {
        body_type(event, "type")
    }
}

/// Teams expects its activity echoed back.
#[derive(Debug, Default)]
pub struct MicrosoftTeamsHandler;

impl WebhookHandler for MicrosoftTeamsHandler {
    fn provider(&self) -> &'static str {
        "microsoft-teams"
    }

    fn identifier_path(&self) -> &'static str {
        "channelData.tenant.id"
    }

    fn config_prop(&self) -> &'static str {
        "tenantId"
    }

    fn event_type(&self, _request: &WebhookRequest<'_>, event: &Value) -> Option<String> {
        body_type(event, "type")
    }

    fn echo_body(&self) -> bool {
        true
    }
}

#[derive(Debug, Default)]
pub struct SalesforceHandler;

impl WebhookHandler for SalesforceHandler {
    fn provider(&self) -> &'static str {
        "salesforce"
    }

    fn identifier_path(&self) -> &'static str {
        "nango.connectionId"
    }

    fn config_prop(&self) -> &'static str {
        CONNECTION_ID_PROP
    }

    fn event_type(&self, _request: &WebhookRequest<'_>, event: &Value) -> Option<String> {
        body_type(event, "nango.eventType")
    }
}

/// GitHub apps: event name in `X-GitHub-Event`, installation id in the body
#[derive(Debug, Default)]
pub struct GithubAppHandler;

impl WebhookHandler for GithubAppHandler {
    fn provider(&self) -> &'static str {
        "github-app"
    }

    fn identifier_path(&self) -> &'static str {
        "installation.id"
    }

    fn config_prop(&self) -> &'static str {
        "installation_id"
    }

    fn verify(&self, integration: &Integration, request: &WebhookRequest<'_>) -> VerificationResult<()> {
        let signature = request.header(GITHUB_SIGNATURE_HEADER).unwrap_or_default();
        if signature.is_empty() {
            return Err(VerificationError::MissingSignature {
                header: "X-Hub-Signature-256".to_string(),
            });
        }
        let secret = webhook_secret(integration)?;
        verify_github_signature(request.raw_body, signature, &secret)
    }

    fn event_type(&self, request: &WebhookRequest<'_>, _event: &Value) -> Option<String> {
        request
            .header("x-github-event")
            .filter(|event| !event.is_empty())
            .map(str::to_string)
    }
}

/// Provider name to handler. Providers without an entry are not routed.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<&'static str, Arc<dyn WebhookHandler>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut providers: Vec<_> = self.handlers.keys().collect();
        providers.sort();
        f.debug_struct("HandlerRegistry")
            .field("providers", &providers)
            .finish()
    }
}

impl HandlerRegistry {
    pub fn builtin() -> Self {
        let mut registry = Self::default();
        registry.register(Arc::new(JiraHandler));
        registry.register(Arc::new(StripeAppHandler));
        registry.register(Arc::new(MicrosoftTeamsHandler));
        registry.register(Arc::new(SalesforceHandler));
        registry.register(Arc::new(GithubAppHandler));
        registry
    }

    pub fn register(&mut self, handler: Arc<dyn WebhookHandler>) {
        self.handlers.insert(handler.provider(), handler);
    }

    pub fn get(&self, provider: &str) -> Option<&dyn WebhookHandler> {
        self.handlers.get(provider).map(|handler| handler.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webhook_verification::sign_hex;
    use axum::http::{HeaderMap, HeaderValue};
    use serde_json::{Map, json};

    fn integration(custom: Value) -> Integration {
        Integration {
            id: 3,
            environment_id: 1,
            unique_key: "hooks".into(),
            provider: "stripe-app".into(),
            oauth_client_id: None,
            oauth_client_secret: None,
            custom: custom.as_object().cloned().unwrap_or_default(),
        }
    }

    #[test]
    fn test_registry_has_every_builtin_provider() {
        let registry = HandlerRegistry::builtin();
        for provider in [
            "jira",
            "stripe-app",
            "microsoft-teams",
            "salesforce",
            "github-app",
        ] {
            assert_eq!(registry.get(provider).unwrap().provider(), provider);
        }
        assert!(registry.get("hubspot").is_none());
    }

    #[test]
    fn test_jira_batches_and_paths() {
        let body = json!([
            {"payload": {"webhookEvent": "jira:issue_created", "user": {"accountId": "a1"}}},
            {"payload": {"webhookEvent": "jira:issue_updated", "user": {"accountId": "a2"}}}
        ]);
        let headers = HeaderMap::new();
        let query = Value::Object(Map::new());
        let request = WebhookRequest::new(&headers, &query, &body, b"");

        let handler = JiraHandler;
        let events = handler.events(&body);
        assert_eq!(events.len(), 2);
        assert_eq!(
            handler.event_type(&request, events[1]).as_deref(),
            Some("jira:issue_updated")
        );
        assert_eq!(handler.identifier(&request, events[0]).as_deref(), Some("a1"));
    }

    #[test]
    fn test_identifier_falls_back_to_query() {
        let body = json!({"type": "message"});
        let headers = HeaderMap::new();
        let query = json!({"connectionId": "conn-9"});
        let request = WebhookRequest::new(&headers, &query, &body, b"");

        assert_eq!(
            StripeAppHandler.identifier(&request, &body).as_deref(),
            Some("conn-9")
        );
    }

    #[test]
    fn test_github_event_type_comes_from_header_and_numeric_ids_stringify() {
        let body = json!({"installation": {"id": 4242}});
        let mut headers = HeaderMap::new();
        headers.insert("x-github-event", HeaderValue::from_static("push"));
        let query = Value::Object(Map::new());
        let request = WebhookRequest::new(&headers, &query, &body, b"");

        assert_eq!(
            GithubAppHandler.event_type(&request, &body).as_deref(),
            Some("push")
        );
        assert_eq!(
            GithubAppHandler.identifier(&request, &body).as_deref(),
            Some("4242")
        );
    }

    #[test]
    fn test_stripe_verification_needs_secret_and_signature() {
        let raw = br#"{"type":"deal.updated","connectionId":"c"}"#;
        let body: Value = serde_json::from_slice(raw).unwrap();
        let query = Value::Object(Map::new());

        let unsigned = HeaderMap::new();
        let request = WebhookRequest::new(&unsigned, &query, &body, raw);
        assert!(matches!(
            StripeAppHandler.verify(&integration(json!({"webhook_secret": "s"})), &request),
            Err(VerificationError::MissingSignature { .. })
        ));

        let now = Utc::now().timestamp().to_string();
        let signature = sign_hex("s", &[now.as_bytes(), b".", raw]);
        let mut signed = HeaderMap::new();
        signed.insert(
            "stripe-signature",
            HeaderValue::from_str(&format!("t={now},v1={signature}")).unwrap(),
        );
        let request = WebhookRequest::new(&signed, &query, &body, raw);

        assert!(matches!(
            StripeAppHandler.verify(&integration(json!({})), &request),
            Err(VerificationError::MissingSecret { .. })
        ));
        assert!(
            StripeAppHandler
                .verify(&integration(json!({"webhook_secret": "s"})), &request)
                .is_ok()
        );
    }
}
