//! Provider template catalog
//!
//! A template describes how a provider authenticates: its auth mode, token endpoints and
//! request dialect. The built-in catalog is compiled in; an optional JSON file can override
//! or extend entries by provider name.

use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
    sync::LazyLock,
};

use chrono::Duration;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::credentials::AuthMode;

const BUILTIN_TEMPLATES: &str = include_str!("builtin.json");

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("failed to read provider templates from {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid provider template JSON: {0}")]
    Parse(#[from] serde_json::Error),
}

/// How client credentials travel in a token request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenRequestAuthMethod {
    /// `client_id` / `client_secret` in the body
    #[default]
    Body,
    /// `Authorization: Basic`
    Basic,
    /// `username` / `password` in the body
    Custom,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyFormat {
    #[default]
    Form,
    Json,
}

/// Either one URL for every mode or a per-auth-mode map keyed by mode name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TokenUrl {
    Single(String),
    PerMode(BTreeMap<String, String>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderTemplate {
    pub auth_mode: AuthMode,
    #[serde(default)]
    pub token_url: Option<TokenUrl>,
    #[serde(default)]
    pub refresh_url: Option<String>,
    #[serde(default)]
    pub token_params: BTreeMap<String, String>,
    #[serde(default)]
    pub refresh_params: BTreeMap<String, String>,
    #[serde(default)]
    pub authorization_params: BTreeMap<String, String>,
    #[serde(default)]
    pub token_request_auth_method: TokenRequestAuthMethod,
    #[serde(default)]
    pub body_format: BodyFormat,
    #[serde(default)]
    pub scope_separator: Option<String>,
    /// Seconds before expiry at which a token counts as expiring
    #[serde(default)]
    pub token_expiration_buffer: Option<i64>,
    #[serde(default)]
    pub introspection_url: Option<String>,
    /// Refresh plain OAuth2 tokens even when no refresh token was issued
    #[serde(default)]
    pub refresh_without_refresh_token: bool,
}

impl ProviderTemplate {
    /// Minimal template for a mode, mostly useful when registering providers by hand
    pub fn new(auth_mode: AuthMode) -> Self {
        Self {
            auth_mode,
            token_url: None,
            refresh_url: None,
            token_params: BTreeMap::new(),
            refresh_params: BTreeMap::new(),
            authorization_params: BTreeMap::new(),
            token_request_auth_method: TokenRequestAuthMethod::Body,
            body_format: BodyFormat::Form,
            scope_separator: None,
            token_expiration_buffer: None,
            introspection_url: None,
            refresh_without_refresh_token: false,
        }
    }

    /// Token URL for `mode`. A single URL applies to every mode.
    pub fn token_url_for(&self, mode: AuthMode) -> Option<&str> {
        match self.token_url.as_ref()? {
            TokenUrl::Single(url) => Some(url.as_str()),
            TokenUrl::PerMode(urls) => urls.get(mode.as_str()).map(String::as_str),
        }
    }

    pub fn expiration_buffer(&self, default: Duration) -> Duration {
        self.token_expiration_buffer
            .and_then(Duration::try_seconds)
            .unwrap_or(default)
    }

    pub fn scope_separator(&self) -> &str {
        self.scope_separator.as_deref().unwrap_or(" ")
    }
}

/// Provider name to template lookup
#[derive(Debug, Clone, Default)]
pub struct TemplateCatalog {
    templates: HashMap<String, ProviderTemplate>,
}

impl TemplateCatalog {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn builtin() -> Result<Self, TemplateError> {
        Self::from_json(BUILTIN_TEMPLATES)
    }

    pub fn from_json(json: &str) -> Result<Self, TemplateError> {
        let templates: HashMap<String, ProviderTemplate> = serde_json::from_str(json)?;
        Ok(Self { templates })
    }

    /// Built-in catalog with entries from `overrides` layered on top
    pub fn load(overrides: Option<&Path>) -> Result<Self, TemplateError> {
        let mut catalog = Self::builtin()?;
        if let Some(path) = overrides {
            let content = std::fs::read_to_string(path).map_err(|source| TemplateError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            let extra = Self::from_json(&content)?;
            tracing::info!(
                path = %path.display(),
                count = extra.templates.len(),
                "Loaded provider template overrides"
            );
            catalog.templates.extend(extra.templates);
        }
        Ok(catalog)
    }

    pub fn insert(&mut self, provider: impl Into<String>, template: ProviderTemplate) {
        self.templates.insert(provider.into(), template);
    }

    pub fn get(&self, provider: &str) -> Option<&ProviderTemplate> {
        self.templates.get(provider)
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{(?:connectionConfig\.)?([^{}]+)\}").expect("placeholder pattern is valid")
});

/// Replace `${key}` and `${connectionConfig.key}` with string or number values from `config`.
/// Placeholders without a usable value are left untouched.
pub fn interpolate(template: &str, config: &Map<String, Value>) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &regex::Captures<'_>| {
            match config.get(&caps[1]) {
                Some(Value::String(value)) => value.clone(),
                Some(Value::Number(value)) => value.to_string(),
                _ => caps[0].to_string(),
            }
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builtin_catalog_parses() {
        let catalog = TemplateCatalog::builtin().unwrap();
        assert!(!catalog.is_empty());

        let github_app = catalog.get("github-app").unwrap();
        assert_eq!(github_app.auth_mode, AuthMode::App);
        assert!(github_app.token_url_for(AuthMode::App).is_some());

        let facebook = catalog.get("facebook").unwrap();
        assert!(facebook.refresh_without_refresh_token);

        let tableau = catalog.get("tableau").unwrap();
        assert_eq!(tableau.auth_mode, AuthMode::Tableau);
    }

    #[test]
    fn test_per_mode_token_url() {
        let template: ProviderTemplate = serde_json::from_value(json!({
            "auth_mode": "OAUTH2_CC",
            "token_url": {"OAUTH2_CC": "https://cc.example.com/token", "OAUTH2": "https://example.com/token"}
        }))
        .unwrap();

        assert_eq!(
            template.token_url_for(AuthMode::OAuth2Cc),
            Some("https://cc.example.com/token")
        );
        assert_eq!(template.token_url_for(AuthMode::App), None);
        assert_eq!(template.token_request_auth_method, TokenRequestAuthMethod::Body);
        assert_eq!(template.body_format, BodyFormat::Form);
    }

    #[test]
    fn test_interpolate_both_placeholder_styles() {
        let config = json!({"subdomain": "acme", "installation_id": 42})
            .as_object()
            .cloned()
            .unwrap();

        assert_eq!(
            interpolate("https://${subdomain}.example.com/oauth/token", &config),
            "https://acme.example.com/oauth/token"
        );
        assert_eq!(
            interpolate(
                "https://api.github.com/app/installations/${connectionConfig.installation_id}/access_tokens",
                &config
            ),
            "https://api.github.com/app/installations/42/access_tokens"
        );
        assert_eq!(interpolate("https://${missing}.io", &config), "https://${missing}.io");
    }

    #[test]
    fn test_overrides_extend_builtin() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("providers.json");
        std::fs::write(
            &path,
            r#"{"internal-crm": {"auth_mode": "API_KEY"}, "github-app": {"auth_mode": "APP", "token_url": "https://ghe.internal/token"}}"#,
        )
        .unwrap();

        let catalog = TemplateCatalog::load(Some(&path)).unwrap();
        assert_eq!(catalog.get("internal-crm").unwrap().auth_mode, AuthMode::ApiKey);
        assert_eq!(
            catalog.get("github-app").unwrap().token_url_for(AuthMode::App),
            Some("https://ghe.internal/token")
        );
        assert!(catalog.get("tableau").is_some());
    }

    #[test]
    fn test_missing_override_file_is_an_error() {
        let result = TemplateCatalog::load(Some(Path::new("/nonexistent/providers.json")));
        assert!(matches!(result, Err(TemplateError::Read { .. })));
    }

    #[test]
    fn test_expiration_buffer_default() {
        let mut template = ProviderTemplate::new(AuthMode::OAuth2);
        assert_eq!(
            template.expiration_buffer(Duration::seconds(900)),
            Duration::seconds(900)
        );
        template.token_expiration_buffer = Some(60);
        assert_eq!(
            template.expiration_buffer(Duration::seconds(900)),
            Duration::seconds(60)
        );
    }
}
