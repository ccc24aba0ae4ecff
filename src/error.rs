//! # Error Handling
//!
//! Two layers of errors live here:
//!
//! - [`ServiceError`] is the typed engine error. It serializes to the
//!   `{type, status, payload}` triple ([`ErrorPayload`]) and can be rebuilt
//!   from it on the receiving side.
//! - [`ApiError`] is the HTTP boundary error, rendered as `application/problem+json`
//!   with trace ID propagation.

use std::{fmt, str::FromStr};

use axum::{
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use thiserror::Error;
use utoipa::ToSchema;

use crate::{crypto::CryptoError, repositories::ConnectionRef, telemetry};

/// Closed set of engine failure kinds. The snake_case name is the wire `type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    MissingConnection,
    MissingProviderConfig,
    MissingEnvironment,
    UnknownConnection,
    UnknownProviderConfig,
    UnknownProviderTemplate,
    IncompleteRawCredentials,
    InvalidAuthMode,
    InvalidClientCredentials,
    InvalidTableauCredentials,
    InvalidAppCredentials,
    InvalidOauth2Credentials,
    ClientCredentialsFetchError,
    TableauTokensFetchError,
    RefreshTokenExternalError,
    CredentialTypeMismatch,
    DuplicateConnection,
    StorageError,
    CryptoError,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 19] = [
        ErrorKind::MissingConnection,
        ErrorKind::MissingProviderConfig,
        ErrorKind::MissingEnvironment,
        ErrorKind::UnknownConnection,
        ErrorKind::UnknownProviderConfig,
        ErrorKind::UnknownProviderTemplate,
        ErrorKind::IncompleteRawCredentials,
        ErrorKind::InvalidAuthMode,
        ErrorKind::InvalidClientCredentials,
        ErrorKind::InvalidTableauCredentials,
        ErrorKind::InvalidAppCredentials,
        ErrorKind::InvalidOauth2Credentials,
        ErrorKind::ClientCredentialsFetchError,
        ErrorKind::TableauTokensFetchError,
        ErrorKind::RefreshTokenExternalError,
        ErrorKind::CredentialTypeMismatch,
        ErrorKind::DuplicateConnection,
        ErrorKind::StorageError,
        ErrorKind::CryptoError,
    ];

    /// Typical HTTP status for this kind
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorKind::UnknownConnection | ErrorKind::UnknownProviderConfig => {
                StatusCode::NOT_FOUND
            }
            ErrorKind::CredentialTypeMismatch | ErrorKind::DuplicateConnection => {
                StatusCode::CONFLICT
            }
            ErrorKind::StorageError | ErrorKind::CryptoError => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    /// Wire name, e.g. `unknown_connection`
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::MissingConnection => "missing_connection",
            ErrorKind::MissingProviderConfig => "missing_provider_config",
            ErrorKind::MissingEnvironment => "missing_environment",
            ErrorKind::UnknownConnection => "unknown_connection",
            ErrorKind::UnknownProviderConfig => "unknown_provider_config",
            ErrorKind::UnknownProviderTemplate => "unknown_provider_template",
            ErrorKind::IncompleteRawCredentials => "incomplete_raw_credentials",
            ErrorKind::InvalidAuthMode => "invalid_auth_mode",
            ErrorKind::InvalidClientCredentials => "invalid_client_credentials",
            ErrorKind::InvalidTableauCredentials => "invalid_tableau_credentials",
            ErrorKind::InvalidAppCredentials => "invalid_app_credentials",
            ErrorKind::InvalidOauth2Credentials => "invalid_oauth2_credentials",
            ErrorKind::ClientCredentialsFetchError => "client_credentials_fetch_error",
            ErrorKind::TableauTokensFetchError => "tableau_tokens_fetch_error",
            ErrorKind::RefreshTokenExternalError => "refresh_token_external_error",
            ErrorKind::CredentialTypeMismatch => "credential_type_mismatch",
            ErrorKind::DuplicateConnection => "duplicate_connection",
            ErrorKind::StorageError => "storage_error",
            ErrorKind::CryptoError => "crypto_error",
        }
    }

    /// Human-readable message for this kind
    pub fn message(&self) -> &'static str {
        match self {
            ErrorKind::MissingConnection => "Missing connection id",
            ErrorKind::MissingProviderConfig => "Missing provider config key",
            ErrorKind::MissingEnvironment => "Missing environment",
            ErrorKind::UnknownConnection => "No connection matches the given identifiers",
            ErrorKind::UnknownProviderConfig => "No integration matches the provider config key",
            ErrorKind::UnknownProviderTemplate => "No provider template for this integration",
            ErrorKind::IncompleteRawCredentials => "Incomplete raw credentials",
            ErrorKind::InvalidAuthMode => "Invalid auth mode",
            ErrorKind::InvalidClientCredentials => "Invalid client credentials",
            ErrorKind::InvalidTableauCredentials => "Invalid Tableau credentials",
            ErrorKind::InvalidAppCredentials => "Invalid app credentials",
            ErrorKind::InvalidOauth2Credentials => "Provider rejected the refresh token",
            ErrorKind::ClientCredentialsFetchError => "Failed to fetch client credentials",
            ErrorKind::TableauTokensFetchError => "Failed to fetch Tableau tokens",
            ErrorKind::RefreshTokenExternalError => "Failed to refresh credentials",
            ErrorKind::CredentialTypeMismatch => "Credential type cannot change after creation",
            ErrorKind::DuplicateConnection => "Connection already exists",
            ErrorKind::StorageError => "Storage error",
            ErrorKind::CryptoError => "Credential encryption error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown error type '{0}'")]
pub struct UnknownErrorKind(pub String);

impl FromStr for ErrorKind {
    type Err = UnknownErrorKind;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        ErrorKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == value)
            .ok_or_else(|| UnknownErrorKind(value.to_string()))
    }
}

/// Serialized shape of a [`ServiceError`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ErrorPayload {
    #[serde(rename = "type")]
    pub kind: String,
    pub status: u16,
    #[serde(default = "empty_object")]
    pub payload: Value,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

/// Typed engine error carrying a kind, an HTTP-ish status and a diagnostic payload.
///
/// The payload is always a JSON object and never contains credential material.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind}: {}", .kind.message())]
pub struct ServiceError {
    kind: ErrorKind,
    status: u16,
    payload: Value,
}

impl ServiceError {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            status: kind.status_code().as_u16(),
            payload: empty_object(),
        }
    }

    /// Attach a payload. Non-object values are wrapped as `{"message": value}`.
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = match payload {
            Value::Object(_) => payload,
            Value::Null => empty_object(),
            other => json!({ "message": other }),
        };
        self
    }

    pub fn with_message(self, message: impl Into<String>) -> Self {
        self.with_payload(json!({ "message": message.into() }))
    }

    /// Same kind and status, payload replaced by the connection triple
    pub fn for_connection(self, connection: &ConnectionRef) -> Self {
        self.with_payload(connection.to_payload())
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload {
            kind: self.kind.as_str().to_string(),
            status: self.status,
            payload: self.payload.clone(),
        }
    }

    pub fn from_payload(payload: ErrorPayload) -> Result<Self, UnknownErrorKind> {
        let kind = payload.kind.parse::<ErrorKind>()?;
        Ok(Self {
            kind,
            status: payload.status,
            payload: payload.payload,
        }
        .normalize_payload())
    }

    fn normalize_payload(self) -> Self {
        let payload = self.payload.clone();
        self.with_payload(payload)
    }

    pub fn unknown_connection(connection: &ConnectionRef) -> Self {
        Self::new(ErrorKind::UnknownConnection).for_connection(connection)
    }

    pub fn unknown_provider_config(provider_config_key: &str, environment_id: i32) -> Self {
        Self::new(ErrorKind::UnknownProviderConfig).with_payload(json!({
            "provider_config_key": provider_config_key,
            "environment_id": environment_id,
        }))
    }

    pub fn refresh_external(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RefreshTokenExternalError).with_message(message)
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::StorageError).with_message(message)
    }

    pub fn incomplete_raw_credentials(missing: &str) -> Self {
        Self::new(ErrorKind::IncompleteRawCredentials)
            .with_payload(json!({ "missing_field": missing }))
    }

    /// Upstream rejection during a token exchange with a truncated body for diagnosis
    pub fn provider_rejection(kind: ErrorKind, status: u16, body: &str) -> Self {
        Self::new(kind).with_payload(json!({
            "status": status,
            "body": body_snippet(body),
        }))
    }
}

impl From<sea_orm::DbErr> for ServiceError {
    fn from(error: sea_orm::DbErr) -> Self {
        if is_unique_violation(&error) {
            tracing::debug!(?error, "Unique constraint violation detected");
            return ServiceError::new(ErrorKind::DuplicateConnection);
        }

        tracing::error!(error = %error, "Database error");
        match error {
            sea_orm::DbErr::Conn(_) | sea_orm::DbErr::ConnectionAcquire(_) => {
                ServiceError::storage("Database unavailable")
            }
            _ => ServiceError::storage("Database error occurred"),
        }
    }
}

impl From<CryptoError> for ServiceError {
    fn from(error: CryptoError) -> Self {
        tracing::error!(error = %error, "Credential crypto failure");
        ServiceError::new(ErrorKind::CryptoError).with_message(error.to_string())
    }
}

/// Truncate an upstream response body to at most 200 characters (UTF-8 safe)
pub fn body_snippet(body: &str) -> String {
    if body.chars().count() > 200 {
        let truncated: String = body.chars().take(200).collect();
        format!("{}...", truncated)
    } else {
        body.to_string()
    }
}

pub(crate) fn is_unique_violation(error: &sea_orm::DbErr) -> bool {
    use sea_orm::RuntimeErr;

    const PG_UNIQUE: &str = "23505";
    const SQLITE_DUPLICATE_CODES: &[&str] = &["1555", "2067"];

    let runtime_err = match error {
        sea_orm::DbErr::Query(RuntimeErr::SqlxError(sqlx_err))
        | sea_orm::DbErr::Exec(RuntimeErr::SqlxError(sqlx_err)) => sqlx_err,
        _ => return false,
    };

    let Some(db_error) = runtime_err.as_database_error() else {
        return false;
    };

    if db_error.is_unique_violation() {
        return true;
    }

    db_error
        .code()
        .is_some_and(|code| code == PG_UNIQUE || SQLITE_DUPLICATE_CODES.contains(&code.as_ref()))
}

/// Unified API error response structure
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ApiError {
    /// HTTP status code for the response
    #[serde(skip_serializing, skip_deserializing)]
    pub status: StatusCode,
    /// Error code for programmatic handling
    pub code: Box<str>,
    /// Human-readable error message
    pub message: Box<str>,
    /// Additional error details (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Box<Value>>,
    /// Correlation trace ID for debugging (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<Box<str>>,
}

impl ApiError {
    pub fn new<S: Into<String>>(status: StatusCode, code: S, message: S) -> Self {
        Self {
            status,
            code: code.into().into_boxed_str(),
            message: message.into().into_boxed_str(),
            details: None,
            trace_id: Self::current_trace_id(),
        }
    }

    pub fn with_details<V: Into<Value>>(mut self, details: V) -> Self {
        self.details = Some(Box::new(details.into()));
        self
    }

    /// Current trace ID, falling back to a short correlation ID
    fn current_trace_id() -> Option<Box<str>> {
        telemetry::current_trace_id()
            .map(|trace_id| trace_id.into_boxed_str())
            .or_else(|| {
                Some(format!("corr-{}", &uuid::Uuid::new_v4().to_string()[..8]).into_boxed_str())
            })
    }

    pub fn service_unavailable(message: &str) -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "SERVICE_UNAVAILABLE",
            message,
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(
            "content-type",
            HeaderValue::from_static("application/problem+json"),
        );

        (self.status, headers, axum::Json(self)).into_response()
    }
}

impl From<ServiceError> for ApiError {
    fn from(error: ServiceError) -> Self {
        let status =
            StatusCode::from_u16(error.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let api = ApiError::new(status, error.kind().as_str(), error.kind().message());
        match error.payload() {
            Value::Object(map) if map.is_empty() => api,
            payload => api.with_details(payload.clone()),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        tracing::error!("Internal error: {:?}", error);

        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_SERVER_ERROR",
            "An internal error occurred",
        )
    }
}
