//! # Token exchange
//!
//! One dispatcher turns a provider template plus the stored credentials into a fresh
//! credential variant. Strategy is chosen by the template's auth mode:
//!
//! | template mode | strategy |
//! |---------------|----------|
//! | `OAUTH2_CC` | client-credentials grant with the stored client id/secret |
//! | `APP_STORE` | ES256 assertion posted as bearer |
//! | `APP`, `CUSTOM` (non-OAuth2 credentials) | RS256 app JWT exchanged for an installation token |
//! | `TABLEAU` | personal access token sign-in |
//! | anything else | OAuth2 refresh-token grant |
//!
//! Upstream rejections become `invalid_*` errors carrying the status and a truncated body.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{
    Client, RequestBuilder, Response,
    header::{ACCEPT, AUTHORIZATION},
};
use serde_json::{Map, Value, json};
use tracing::{debug, instrument, warn};

use crate::credentials::{
    AppStoreCredentials, AuthMode, Credentials, OAuth2ClientCredentials, OAuth2Credentials,
    TableauCredentials, parse_raw_credentials,
};
use crate::error::{ErrorKind, ServiceError};
use crate::providers::{BodyFormat, ProviderTemplate, TokenRequestAuthMethod, interpolate};
use crate::repositories::Integration;
use crate::token_minter::{AppStoreSigner, mint_app_jwt};

const GITHUB_ACCEPT: &str = "application/vnd.github.v3+json";

/// Provider-facing half of the refresh protocol
#[async_trait]
pub trait CredentialExchanger: Send + Sync {
    /// Obtain new credentials of the same variant as `current`.
    async fn exchange(
        &self,
        template: &ProviderTemplate,
        integration: &Integration,
        connection_config: &Map<String, Value>,
        current: &Credentials,
    ) -> Result<Credentials, ServiceError>;

    /// True only when the provider's introspection endpoint says the token is inactive.
    async fn token_invalid(
        &self,
        template: &ProviderTemplate,
        integration: &Integration,
        current: &Credentials,
    ) -> bool;
}

/// [`CredentialExchanger`] over `reqwest`
#[derive(Debug, Clone)]
pub struct HttpCredentialExchanger {
    client: Client,
}

impl HttpCredentialExchanger {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("credential-hub/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    async fn refresh_oauth2(
        &self,
        template: &ProviderTemplate,
        integration: &Integration,
        connection_config: &Map<String, Value>,
        current: &OAuth2Credentials,
    ) -> Result<Credentials, ServiceError> {
        let url = match template.refresh_url.as_deref() {
            Some(url) => interpolate(url, connection_config),
            None => token_url(template, AuthMode::OAuth2, connection_config)?,
        };

        let mut params = BTreeMap::new();
        params.insert("grant_type".to_string(), "refresh_token".to_string());
        if let Some(refresh_token) = &current.refresh_token {
            params.insert("refresh_token".to_string(), refresh_token.clone());
        }
        let request = with_client_auth(
            self.client.post(&url).header(ACCEPT, "application/json"),
            template.token_request_auth_method,
            integration.oauth_client_id.as_deref().unwrap_or_default(),
            integration.oauth_client_secret.as_deref().unwrap_or_default(),
            &mut params,
        );
        params.extend(template.refresh_params.clone());

        let response = with_body(request, template.body_format, &params)
            .send()
            .await
            .map_err(|error| ServiceError::refresh_external(error.to_string()))?;
        let raw = read_json(response, ErrorKind::InvalidOauth2Credentials, |status| {
            status.is_success()
        })
        .await?;

        let mut credentials = parse_raw_credentials(&raw, AuthMode::OAuth2)?;
        if let Credentials::OAuth2(refreshed) = &mut credentials {
            if refreshed.refresh_token.is_none() {
                refreshed.refresh_token = current.refresh_token.clone();
            }
        }
        Ok(credentials)
    }

    /// Client-credentials grant
    pub async fn fetch_client_credentials(
        &self,
        template: &ProviderTemplate,
        connection_config: &Map<String, Value>,
        client_id: &str,
        client_secret: &str,
    ) -> Result<Credentials, ServiceError> {
        let url = token_url(template, AuthMode::OAuth2Cc, connection_config)?;

        let mut params = BTreeMap::new();
        let request = with_client_auth(
            self.client.post(&url).header(ACCEPT, "application/json"),
            template.token_request_auth_method,
            client_id,
            client_secret,
            &mut params,
        );
        params.extend(template.token_params.clone());
        if let Some(scopes) = connection_config
            .get("oauth_scopes")
            .and_then(Value::as_str)
            .filter(|scopes| !scopes.is_empty())
        {
            let scope = scopes.split(',').collect::<Vec<_>>().join(template.scope_separator());
            params.insert("scope".to_string(), scope);
        }

        let response = with_body(request, template.body_format, &params)
            .send()
            .await
            .map_err(|error| {
                warn!(error = %error, "Client credentials request failed");
                transport_error(ErrorKind::ClientCredentialsFetchError, &error)
            })?;
        let raw = read_json(response, ErrorKind::InvalidClientCredentials, |status| {
            status == reqwest::StatusCode::OK
        })
        .await?;

        let mut credentials = parse_raw_credentials(&raw, AuthMode::OAuth2Cc)?;
        if let Credentials::OAuth2Cc(fetched) = &mut credentials {
            fetched.client_id = client_id.to_string();
            fetched.client_secret = client_secret.to_string();
        }
        Ok(credentials)
    }

    /// Installation token for an app, authenticated with a freshly minted RS256 JWT
    pub async fn fetch_app_credentials(
        &self,
        template: &ProviderTemplate,
        integration: &Integration,
        connection_config: &Map<String, Value>,
    ) -> Result<Credentials, ServiceError> {
        let url = token_url(template, AuthMode::App, connection_config)?;
        let app_id = integration.app_id().ok_or_else(|| {
            ServiceError::new(ErrorKind::InvalidAppCredentials).with_message("missing app id")
        })?;
        let private_key = integration.app_private_key().ok_or_else(|| {
            ServiceError::new(ErrorKind::InvalidAppCredentials).with_message("missing private key")
        })?;

        let jwt = mint_app_jwt(&app_id, &private_key, Utc::now()).map_err(|error| {
            ServiceError::new(ErrorKind::InvalidAppCredentials).with_message(error.to_string())
        })?;

        let response = self
            .client
            .post(&url)
            .header(ACCEPT, GITHUB_ACCEPT)
            .header(AUTHORIZATION, format!("Bearer {jwt}"))
            .json(&json!({}))
            .send()
            .await
            .map_err(|error| ServiceError::refresh_external(error.to_string()))?;
        let raw = read_json(response, ErrorKind::InvalidAppCredentials, |status| {
            status.is_success()
        })
        .await?;

        parse_raw_credentials(&raw, AuthMode::App)
    }

    /// App Store Connect token from an ES256 assertion; `private_key` is kept on the result
    pub async fn fetch_app_store_credentials(
        &self,
        template: &ProviderTemplate,
        connection_config: &Map<String, Value>,
        private_key: &str,
    ) -> Result<Credentials, ServiceError> {
        let url = token_url(template, AuthMode::AppStore, connection_config)?;
        let jwt = AppStoreSigner::new(
            config_str(connection_config, "privateKeyId"),
            config_str(connection_config, "issuerId"),
            private_key,
        )
        .and_then(|signer| {
            signer.sign(
                template
                    .authorization_params
                    .get("audience")
                    .map(String::as_str),
                connection_config.get("scope"),
                Utc::now(),
            )
        })
        .map_err(|error| {
            ServiceError::new(ErrorKind::InvalidAppCredentials).with_message(error.to_string())
        })?;

        let response = self
            .client
            .post(&url)
            .header(ACCEPT, "application/json")
            .header(AUTHORIZATION, format!("Bearer {jwt}"))
            .json(&json!({}))
            .send()
            .await
            .map_err(|error| ServiceError::refresh_external(error.to_string()))?;
        let raw = read_json(response, ErrorKind::InvalidAppCredentials, |status| {
            status.is_success()
        })
        .await?;

        let mut credentials = parse_raw_credentials(&raw, AuthMode::AppStore)?;
        if let Credentials::AppStore(fetched) = &mut credentials {
            fetched.private_key = private_key.to_string();
        }
        Ok(credentials)
    }

    /// Tableau session token from a personal access token
    pub async fn fetch_tableau_credentials(
        &self,
        template: &ProviderTemplate,
        connection_config: &Map<String, Value>,
        pat_name: &str,
        pat_secret: &str,
        content_url: Option<&str>,
    ) -> Result<Credentials, ServiceError> {
        let url = token_url(template, AuthMode::Tableau, connection_config)?;
        let body = json!({
            "credentials": {
                "personalAccessTokenName": pat_name,
                "personalAccessTokenSecret": pat_secret,
                "site": { "contentUrl": content_url.unwrap_or_default() }
            }
        });

        let response = self
            .client
            .post(&url)
            .header(ACCEPT, "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|error| {
                warn!(error = %error, "Tableau sign-in request failed");
                transport_error(ErrorKind::TableauTokensFetchError, &error)
            })?;
        let raw = read_json(response, ErrorKind::InvalidTableauCredentials, |status| {
            status == reqwest::StatusCode::OK
        })
        .await?;

        let mut credentials = parse_raw_credentials(&raw, AuthMode::Tableau)?;
        if let Credentials::Tableau(fetched) = &mut credentials {
            fetched.pat_name = pat_name.to_string();
            fetched.pat_secret = pat_secret.to_string();
            fetched.content_url = Some(content_url.unwrap_or_default().to_string());
        }
        Ok(credentials)
    }
}

#[async_trait]
impl CredentialExchanger for HttpCredentialExchanger {
    #[instrument(skip_all, fields(provider = %integration.provider, mode = %template.auth_mode))]
    async fn exchange(
        &self,
        template: &ProviderTemplate,
        integration: &Integration,
        connection_config: &Map<String, Value>,
        current: &Credentials,
    ) -> Result<Credentials, ServiceError> {
        match (template.auth_mode, current) {
            (AuthMode::OAuth2Cc, current) => {
                let (client_id, client_secret) = match current {
                    Credentials::OAuth2Cc(OAuth2ClientCredentials {
                        client_id,
                        client_secret,
                        ..
                    }) => (client_id.clone(), client_secret.clone()),
                    _ => (
                        integration.oauth_client_id.clone().unwrap_or_default(),
                        integration.oauth_client_secret.clone().unwrap_or_default(),
                    ),
                };
                self.fetch_client_credentials(template, connection_config, &client_id, &client_secret)
                    .await
            }
            (AuthMode::AppStore, Credentials::AppStore(AppStoreCredentials { private_key, .. })) => {
                self.fetch_app_store_credentials(template, connection_config, private_key)
                    .await
            }
            (AuthMode::AppStore, _) => Err(ServiceError::new(ErrorKind::InvalidAuthMode)
                .with_message("APP_STORE refresh needs stored APP_STORE credentials")),
            (AuthMode::App, _) => {
                self.fetch_app_credentials(template, integration, connection_config)
                    .await
            }
            (AuthMode::Custom, current) if !matches!(current, Credentials::OAuth2(_)) => {
                self.fetch_app_credentials(template, integration, connection_config)
                    .await
            }
            (
                AuthMode::Tableau,
                Credentials::Tableau(TableauCredentials {
                    pat_name,
                    pat_secret,
                    content_url,
                    ..
                }),
            ) => {
                self.fetch_tableau_credentials(
                    template,
                    connection_config,
                    pat_name,
                    pat_secret,
                    content_url.as_deref(),
                )
                .await
            }
            (AuthMode::Tableau, _) => Err(ServiceError::new(ErrorKind::InvalidAuthMode)
                .with_message("TABLEAU refresh needs stored TABLEAU credentials")),
            (_, Credentials::OAuth2(oauth)) => {
                self.refresh_oauth2(template, integration, connection_config, oauth)
                    .await
            }
            (mode, current) => Err(ServiceError::new(ErrorKind::InvalidAuthMode).with_payload(
                json!({
                    "auth_mode": mode.as_str(),
                    "credentials_type": current.auth_mode().as_str(),
                }),
            )),
        }
    }

    async fn token_invalid(
        &self,
        template: &ProviderTemplate,
        integration: &Integration,
        current: &Credentials,
    ) -> bool {
        let Some(url) = template.introspection_url.as_deref() else {
            return false;
        };
        let Credentials::OAuth2(oauth) = current else {
            return false;
        };

        let form = [
            ("token", oauth.access_token.as_str()),
            (
                "client_id",
                integration.oauth_client_id.as_deref().unwrap_or_default(),
            ),
            (
                "client_secret",
                integration.oauth_client_secret.as_deref().unwrap_or_default(),
            ),
        ];

        let response = match self
            .client
            .post(url)
            .header(ACCEPT, "application/json")
            .form(&form)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                warn!(status = %response.status(), "Token introspection rejected");
                return false;
            }
            Err(error) => {
                warn!(error = %error, "Token introspection failed");
                return false;
            }
        };

        match response.json::<Value>().await {
            Ok(body) => {
                let inactive = body.get("active").and_then(Value::as_bool) == Some(false);
                debug!(inactive, "Token introspected");
                inactive
            }
            Err(error) => {
                warn!(error = %error, "Token introspection returned an unreadable body");
                false
            }
        }
    }
}

fn config_str<'a>(connection_config: &'a Map<String, Value>, key: &str) -> &'a str {
    connection_config
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
}

fn token_url(
    template: &ProviderTemplate,
    mode: AuthMode,
    connection_config: &Map<String, Value>,
) -> Result<String, ServiceError> {
    template
        .token_url_for(mode)
        .map(|url| interpolate(url, connection_config))
        .ok_or_else(|| {
            ServiceError::new(ErrorKind::UnknownProviderTemplate)
                .with_payload(json!({ "missing": "token_url", "auth_mode": mode.as_str() }))
        })
}

fn with_client_auth(
    request: RequestBuilder,
    method: TokenRequestAuthMethod,
    client_id: &str,
    client_secret: &str,
    params: &mut BTreeMap<String, String>,
) -> RequestBuilder {
    match method {
        TokenRequestAuthMethod::Basic => request.basic_auth(client_id, Some(client_secret)),
        TokenRequestAuthMethod::Custom => {
            params.insert("username".to_string(), client_id.to_string());
            params.insert("password".to_string(), client_secret.to_string());
            request
        }
        TokenRequestAuthMethod::Body => {
            params.insert("client_id".to_string(), client_id.to_string());
            params.insert("client_secret".to_string(), client_secret.to_string());
            request
        }
    }
}

fn with_body(
    request: RequestBuilder,
    format: BodyFormat,
    params: &BTreeMap<String, String>,
) -> RequestBuilder {
    match format {
        BodyFormat::Form => request.form(params),
        BodyFormat::Json => request.json(params),
    }
}

fn transport_error(kind: ErrorKind, error: &reqwest::Error) -> ServiceError {
    let name = if error.is_timeout() {
        "TimeoutError"
    } else if error.is_connect() {
        "ConnectError"
    } else {
        "RequestError"
    };
    ServiceError::new(kind).with_payload(json!({
        "message": error.to_string(),
        "name": name,
    }))
}

/// Read a JSON body, turning unaccepted statuses and non-JSON bodies into `rejection`.
async fn read_json(
    response: Response,
    rejection: ErrorKind,
    accept: impl Fn(reqwest::StatusCode) -> bool,
) -> Result<Value, ServiceError> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|error| ServiceError::refresh_external(error.to_string()))?;

    if !accept(status) {
        warn!(status = %status, kind = %rejection, "Provider rejected token request");
        return Err(ServiceError::provider_rejection(
            rejection,
            status.as_u16(),
            &body,
        ));
    }

    serde_json::from_str(&body)
        .map_err(|_| ServiceError::provider_rejection(rejection, status.as_u16(), &body))
}
