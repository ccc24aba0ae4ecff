//! # Refresh-if-needed protocol
//!
//! Callers that need usable credentials go through [`TokenRefresher::refresh_if_needed`].
//! A refresh for one connection is serialized by a named lock,
//! `lock:refresh:{environment}:{provider_config_key}:{connection_id}`, and the
//! credentials are re-read both after the lock is taken and after a failed acquisition:
//!
//! - lock taken, still stale: exchange, persist, `refreshed = true`
//! - lock taken, already fresh: another holder refreshed first, `refreshed = false`
//! - lock not taken, fresh on re-read: someone refreshed while we waited, `refreshed = false`
//! - lock not taken, still stale: `refresh_token_external_error`, no exchange
//!
//! The lease is released on every return path once it is held.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::{counter, histogram};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::config::RefreshConfig;
use crate::credentials::{AuthMode, Credentials};
use crate::error::{ErrorKind, ServiceError};
use crate::locking::Locking;
use crate::providers::ProviderTemplate;
use crate::repositories::{ConnectionPatch, ConnectionRef, ConnectionStore, Integration};
use crate::token_exchange::CredentialExchanger;

const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(10);
const DEFAULT_EXPIRATION_BUFFER_SECONDS: i64 = 15 * 60;

#[derive(Debug, Clone, Copy)]
pub struct RefreshSettings {
    pub lock_ttl: Duration,
    /// Used when the provider template declares no buffer
    pub default_expiration_buffer: chrono::Duration,
}

impl RefreshSettings {
    /// Waiters give up a little after a legitimate holder's TTL would have run out.
    pub fn acquire_timeout(&self) -> Duration {
        self.lock_ttl.mul_f64(1.2)
    }
}

impl Default for RefreshSettings {
    fn default() -> Self {
        Self {
            lock_ttl: DEFAULT_LOCK_TTL,
            default_expiration_buffer: chrono::Duration::seconds(DEFAULT_EXPIRATION_BUFFER_SECONDS),
        }
    }
}

impl From<&RefreshConfig> for RefreshSettings {
    fn from(config: &RefreshConfig) -> Self {
        Self {
            lock_ttl: config.lock_ttl(),
            default_expiration_buffer: chrono::Duration::seconds(
                config.default_expiration_buffer_seconds,
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RefreshOutcome {
    /// True only when this call performed the exchange
    pub refreshed: bool,
    pub credentials: Credentials,
}

/// Lock name guarding refreshes of one connection
pub fn lock_key(connection: &ConnectionRef) -> String {
    format!(
        "lock:refresh:{}:{}:{}",
        connection.environment_id, connection.provider_config_key, connection.connection_id
    )
}

#[derive(Clone)]
pub struct TokenRefresher {
    store: Arc<dyn ConnectionStore>,
    exchanger: Arc<dyn CredentialExchanger>,
    locking: Locking,
    settings: RefreshSettings,
}

impl std::fmt::Debug for TokenRefresher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenRefresher")
            .field("locking", &self.locking)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl TokenRefresher {
    pub fn new(
        store: Arc<dyn ConnectionStore>,
        exchanger: Arc<dyn CredentialExchanger>,
        locking: Locking,
        settings: RefreshSettings,
    ) -> Self {
        Self {
            store,
            exchanger,
            locking,
            settings,
        }
    }

    pub fn settings(&self) -> &RefreshSettings {
        &self.settings
    }

    /// Whether `credentials` need an exchange right now.
    ///
    /// Plain OAuth2 without a refresh token is never refreshed unless the template opts in
    /// with `refresh_without_refresh_token`.
    pub async fn should_refresh(
        &self,
        template: &ProviderTemplate,
        integration: &Integration,
        credentials: &Credentials,
        instant: bool,
    ) -> bool {
        let plain_oauth2 =
            template.auth_mode == AuthMode::OAuth2 || credentials.auth_mode() == AuthMode::OAuth2;
        if plain_oauth2
            && !template.refresh_without_refresh_token
            && credentials.refresh_token().is_none()
        {
            return false;
        }

        if instant {
            return true;
        }

        if template.introspection_url.is_some()
            && self
                .exchanger
                .token_invalid(template, integration, credentials)
                .await
        {
            return true;
        }

        let buffer = template.expiration_buffer(self.settings.default_expiration_buffer);
        credentials.is_expiring(buffer, Utc::now())
    }

    /// Run the refresh protocol for `connection`. The stored row is the source of truth:
    /// it is read after the lock decision, never taken from the caller.
    #[instrument(skip_all, fields(connection = %connection, provider = %integration.provider))]
    pub async fn refresh_if_needed(
        &self,
        template: &ProviderTemplate,
        integration: &Integration,
        connection: &ConnectionRef,
        instant: bool,
    ) -> Result<RefreshOutcome, ServiceError> {
        let started = Instant::now();
        let key = lock_key(connection);

        let result = match self
            .locking
            .acquire(&key, self.settings.lock_ttl, self.settings.acquire_timeout())
            .await
        {
            Ok(lease) => {
                let result = self
                    .refresh_locked(template, integration, connection, instant)
                    .await;
                self.locking.release(lease).await;
                result
            }
            Err(lock_error) => {
                warn!(error = %lock_error, "Refresh lock not acquired, re-checking stored credentials");
                match self
                    .fresh_credentials(template, integration, connection, instant)
                    .await
                {
                    Ok(Some(credentials)) => Ok(RefreshOutcome {
                        refreshed: false,
                        credentials,
                    }),
                    Ok(None) => Err(ServiceError::refresh_external(lock_error.to_string())),
                    Err(error) => Err(ServiceError::refresh_external(error.to_string())),
                }
            }
        };

        let label = match &result {
            Ok(outcome) if outcome.refreshed => "refreshed",
            Ok(_) => "fresh",
            Err(_) => "failed",
        };
        counter!("credential_refresh_total", "result" => label).increment(1);
        histogram!("credential_refresh_latency_ms")
            .record(started.elapsed().as_secs_f64() * 1_000.0);

        if let Err(error) = &result {
            error!(kind = %error.kind(), "Token refresh failed");
        }
        result
    }

    async fn refresh_locked(
        &self,
        template: &ProviderTemplate,
        integration: &Integration,
        reference: &ConnectionRef,
        instant: bool,
    ) -> Result<RefreshOutcome, ServiceError> {
        let connection = self
            .store
            .find(reference)
            .await
            .map_err(|error| ServiceError::refresh_external(error.to_string()))?
            .ok_or_else(|| ServiceError::unknown_connection(reference))?;

        if !self
            .should_refresh(template, integration, &connection.credentials, instant)
            .await
        {
            debug!("Credentials already fresh");
            return Ok(RefreshOutcome {
                refreshed: false,
                credentials: connection.credentials,
            });
        }

        info!(mode = %template.auth_mode, "Token refresh started");

        let credentials = self
            .exchanger
            .exchange(
                template,
                integration,
                &connection.connection_config,
                &connection.credentials,
            )
            .await?;

        let patch = ConnectionPatch {
            credentials: Some(credentials),
            ..ConnectionPatch::default()
        };
        let stored = self
            .store
            .update(connection.id, patch)
            .await
            .map_err(|error| match error.kind() {
                ErrorKind::CredentialTypeMismatch => error,
                _ => ServiceError::refresh_external(error.to_string()),
            })?;

        info!("Token refresh succeeded");
        Ok(RefreshOutcome {
            refreshed: true,
            credentials: stored.credentials,
        })
    }

    /// Stored credentials when they no longer need a refresh
    async fn fresh_credentials(
        &self,
        template: &ProviderTemplate,
        integration: &Integration,
        reference: &ConnectionRef,
        instant: bool,
    ) -> Result<Option<Credentials>, ServiceError> {
        let connection = self
            .store
            .find(reference)
            .await?
            .ok_or_else(|| ServiceError::unknown_connection(reference))?;

        if self
            .should_refresh(template, integration, &connection.credentials, instant)
            .await
        {
            Ok(None)
        } else {
            Ok(Some(connection.credentials))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{AppCredentials, OAuth2Credentials};
    use crate::repositories::Connection;
    use serde_json::{Map, Value};

    struct NoExchange;

    #[async_trait::async_trait]
    impl CredentialExchanger for NoExchange {
        async fn exchange(
            &self,
            _: &ProviderTemplate,
            _: &Integration,
            _: &Map<String, Value>,
            _: &Credentials,
        ) -> Result<Credentials, ServiceError> {
            Err(ServiceError::refresh_external("unexpected exchange"))
        }

        async fn token_invalid(&self, _: &ProviderTemplate, _: &Integration, _: &Credentials) -> bool {
            true
        }
    }

    struct EmptyStore;

    #[async_trait::async_trait]
    impl ConnectionStore for EmptyStore {
        async fn find(&self, _: &ConnectionRef) -> Result<Option<Connection>, ServiceError> {
            Ok(None)
        }
        async fn find_by_config_value(
            &self,
            _: &str,
            _: &str,
            _: i32,
        ) -> Result<Vec<Connection>, ServiceError> {
            Ok(Vec::new())
        }
        async fn find_by_config_values(
            &self,
            _: &[(&str, &str)],
            _: i32,
        ) -> Result<Vec<Connection>, ServiceError> {
            Ok(Vec::new())
        }
        async fn insert(
            &self,
            _: crate::repositories::NewConnection,
        ) -> Result<Connection, ServiceError> {
            Err(ServiceError::storage("read only"))
        }
        async fn update(&self, _: i32, _: ConnectionPatch) -> Result<Connection, ServiceError> {
            Err(ServiceError::storage("read only"))
        }
        async fn soft_delete(&self, _: i32) -> Result<(), ServiceError> {
            Ok(())
        }
        async fn touch_last_fetched(&self, _: i32) -> Result<(), ServiceError> {
            Ok(())
        }
        async fn find_stale(
            &self,
            _: chrono::DateTime<Utc>,
            _: u64,
        ) -> Result<Vec<Connection>, ServiceError> {
            Ok(Vec::new())
        }
    }

    fn refresher() -> TokenRefresher {
        TokenRefresher::new(
            Arc::new(EmptyStore),
            Arc::new(NoExchange),
            Locking::in_memory(),
            RefreshSettings::default(),
        )
    }

    fn integration() -> Integration {
        Integration {
            id: 1,
            environment_id: 1,
            unique_key: "acme".into(),
            provider: "acme".into(),
            oauth_client_id: None,
            oauth_client_secret: None,
            custom: Map::new(),
        }
    }

    fn oauth2(refresh_token: Option<&str>, expires_in_minutes: i64) -> Credentials {
        Credentials::OAuth2(OAuth2Credentials {
            access_token: "at".into(),
            refresh_token: refresh_token.map(str::to_string),
            expires_at: Some(Utc::now() + chrono::Duration::minutes(expires_in_minutes)),
            raw: Value::Null,
        })
    }

    #[test]
    fn test_lock_key_format() {
        let key = lock_key(&ConnectionRef::new("conn-1", "hubspot", 42));
        assert_eq!(key, "lock:refresh:42:hubspot:conn-1");
    }

    #[test]
    fn test_acquire_timeout_exceeds_ttl() {
        let settings = RefreshSettings::default();
        assert_eq!(settings.acquire_timeout(), Duration::from_millis(12_000));
    }

    #[tokio::test]
    async fn test_should_refresh_rules() {
        let refresher = refresher();
        let integration = integration();
        let template = ProviderTemplate::new(AuthMode::OAuth2);

        assert!(
            refresher
                .should_refresh(&template, &integration, &oauth2(Some("rt"), 5), false)
                .await
        );
        assert!(
            !refresher
                .should_refresh(&template, &integration, &oauth2(Some("rt"), 60), false)
                .await
        );
        assert!(
            refresher
                .should_refresh(&template, &integration, &oauth2(Some("rt"), 60), true)
                .await
        );
        assert!(
            !refresher
                .should_refresh(&template, &integration, &oauth2(None, -5), true)
                .await
        );

        let mut legacy = ProviderTemplate::new(AuthMode::OAuth2);
        legacy.refresh_without_refresh_token = true;
        assert!(
            refresher
                .should_refresh(&legacy, &integration, &oauth2(None, -5), false)
                .await
        );
    }

    #[tokio::test]
    async fn test_template_buffer_and_introspection() {
        let refresher = refresher();
        let integration = integration();

        let mut short_buffer = ProviderTemplate::new(AuthMode::OAuth2);
        short_buffer.token_expiration_buffer = Some(60);
        assert!(
            !refresher
                .should_refresh(&short_buffer, &integration, &oauth2(Some("rt"), 5), false)
                .await
        );

        let mut introspected = ProviderTemplate::new(AuthMode::OAuth2);
        introspected.introspection_url = Some("https://example.test/introspect".into());
        assert!(
            refresher
                .should_refresh(&introspected, &integration, &oauth2(Some("rt"), 60), false)
                .await
        );
    }

    #[tokio::test]
    async fn test_app_credentials_without_expiry_stay_put() {
        let refresher = refresher();
        let template = ProviderTemplate::new(AuthMode::App);
        let credentials = Credentials::App(AppCredentials {
            access_token: "ghs".into(),
            expires_at: None,
            raw: Value::Null,
        });
        assert!(
            !refresher
                .should_refresh(&template, &integration(), &credentials, false)
                .await
        );
    }

    #[tokio::test]
    async fn test_missing_connection_is_unknown() {
        let refresher = refresher();
        let template = ProviderTemplate::new(AuthMode::OAuth2);
        let reference = ConnectionRef::new("ghost", "acme", 1);

        let error = refresher
            .refresh_if_needed(&template, &integration(), &reference, false)
            .await
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::UnknownConnection);
    }
}
