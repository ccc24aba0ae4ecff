use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::{Value, json};

use super::{
    AppCredentials, AppStoreCredentials, AuthMode, Credentials, OAuth1Credentials,
    OAuth2ClientCredentials, OAuth2Credentials, TableauCredentials,
};
use crate::error::{ErrorKind, ServiceError};

/// Lifetime assumed for client-credentials tokens issued without any expiry hint
const DEFAULT_CLIENT_CREDENTIALS_TTL_SECONDS: i64 = 3600;

/// Epoch values above this are read as milliseconds
const EPOCH_MILLIS_THRESHOLD: i64 = 10_000_000_000;

/// Map a raw provider token response onto the credential variant for `mode`.
///
/// Pure and deterministic apart from `expires_in` being anchored at the current time.
/// Structurally incomplete responses fail with `incomplete_raw_credentials`; modes that
/// have no token response fail with `invalid_auth_mode`. Fields the response cannot
/// carry (client id/secret, PAT pair, private key) are left empty for the caller to fill.
pub fn parse_raw_credentials(raw: &Value, mode: AuthMode) -> Result<Credentials, ServiceError> {
    let now = Utc::now();

    match mode {
        AuthMode::OAuth2 => {
            let access_token = required_str(raw, "access_token")?;
            Ok(Credentials::OAuth2(OAuth2Credentials {
                access_token,
                refresh_token: optional_str(raw, "refresh_token"),
                expires_at: expiry_from_response(raw, now)?,
                raw: raw.clone(),
            }))
        }
        AuthMode::OAuth1 => Ok(Credentials::OAuth1(OAuth1Credentials {
            oauth_token: required_str(raw, "oauth_token")?,
            oauth_token_secret: required_str(raw, "oauth_token_secret")?,
            raw: raw.clone(),
        })),
        AuthMode::OAuth2Cc => {
            let token = optional_str(raw, "access_token")
                .or_else(|| raw.pointer("/data/token").and_then(string_value))
                .or_else(|| optional_str(raw, "jwt"))
                .ok_or_else(|| ServiceError::incomplete_raw_credentials("access_token"))?;
            let expires_at = match expiry_from_response(raw, now)? {
                Some(at) => at,
                None => now + Duration::seconds(DEFAULT_CLIENT_CREDENTIALS_TTL_SECONDS),
            };
            Ok(Credentials::OAuth2Cc(OAuth2ClientCredentials {
                token,
                expires_at: Some(expires_at),
                client_id: String::new(),
                client_secret: String::new(),
                raw: raw.clone(),
            }))
        }
        AuthMode::Tableau => {
            let token = raw
                .pointer("/credentials/token")
                .and_then(string_value)
                .ok_or_else(|| ServiceError::incomplete_raw_credentials("credentials.token"))?;
            let expires_at = match raw
                .pointer("/credentials/estimatedTimeToExpiration")
                .and_then(Value::as_str)
                .and_then(parse_tableau_expiration)
            {
                Some(lifetime) => Some(now.checked_add_signed(lifetime).ok_or_else(|| {
                    ServiceError::incomplete_raw_credentials(
                        "credentials.estimatedTimeToExpiration",
                    )
                })?),
                None => None,
            };
            Ok(Credentials::Tableau(TableauCredentials {
                token,
                expires_at,
                pat_name: String::new(),
                pat_secret: String::new(),
                content_url: None,
                raw: raw.clone(),
            }))
        }
        AuthMode::App => {
            let access_token = optional_str(raw, "token")
                .or_else(|| optional_str(raw, "access_token"))
                .ok_or_else(|| ServiceError::incomplete_raw_credentials("token"))?;
            Ok(Credentials::App(AppCredentials {
                access_token,
                expires_at: expiry_from_response(raw, now)?,
                raw: raw.clone(),
            }))
        }
        AuthMode::AppStore => {
            let access_token = optional_str(raw, "access_token")
                .or_else(|| optional_str(raw, "token"))
                .ok_or_else(|| ServiceError::incomplete_raw_credentials("access_token"))?;
            Ok(Credentials::AppStore(AppStoreCredentials {
                access_token,
                expires_at: expiry_from_response(raw, now)?,
                private_key: String::new(),
                raw: raw.clone(),
            }))
        }
        other => Err(ServiceError::new(ErrorKind::InvalidAuthMode)
            .with_payload(json!({ "auth_mode": other.as_str() }))),
    }
}

/// Parse Tableau's `estimatedTimeToExpiration` (`hours:minutes:seconds`).
///
/// Hours have no fixed upper bound in the format; values `chrono` cannot represent yield `None`.
pub fn parse_tableau_expiration(value: &str) -> Option<Duration> {
    let mut parts = value.trim().split(':');
    let hours: i64 = parts.next()?.parse().ok()?;
    let minutes: i64 = parts.next()?.parse().ok()?;
    let seconds: i64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || hours < 0 || !(0..60).contains(&minutes) || !(0..60).contains(&seconds)
    {
        return None;
    }
    Duration::try_hours(hours)?
        .checked_add(&Duration::try_minutes(minutes)?)?
        .checked_add(&Duration::try_seconds(seconds)?)
}

/// Decode a stored or provider-supplied timestamp: RFC 3339, epoch seconds or epoch millis
pub(crate) fn timestamp_from_value(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|f| f as i64))
            .and_then(timestamp_from_epoch),
        Value::String(text) => {
            let text = text.trim();
            if let Ok(epoch) = text.parse::<i64>() {
                return timestamp_from_epoch(epoch);
            }
            DateTime::parse_from_rfc3339(text)
                .map(|at| at.with_timezone(&Utc))
                .ok()
        }
        _ => None,
    }
}

fn timestamp_from_epoch(epoch: i64) -> Option<DateTime<Utc>> {
    if epoch.abs() >= EPOCH_MILLIS_THRESHOLD {
        Utc.timestamp_millis_opt(epoch).single()
    } else {
        Utc.timestamp_opt(epoch, 0).single()
    }
}

/// Absolute expiry from `expires_at`, else `expires_in` seconds from `now`.
/// An `expires_in` that does not fit a timestamp is rejected rather than trusted.
fn expiry_from_response(
    raw: &Value,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, ServiceError> {
    if let Some(at) = raw.get("expires_at").and_then(timestamp_from_value) {
        return Ok(Some(at));
    }
    let expires_in = match raw.get("expires_in") {
        Some(Value::Number(number)) => number.as_i64(),
        Some(Value::String(text)) => text.trim().parse::<i64>().ok(),
        _ => None,
    };
    let Some(expires_in) = expires_in else {
        return Ok(None);
    };
    Duration::try_seconds(expires_in)
        .and_then(|lifetime| now.checked_add_signed(lifetime))
        .map(Some)
        .ok_or_else(|| ServiceError::incomplete_raw_credentials("expires_in"))
}

fn string_value(value: &Value) -> Option<String> {
    match value {
        Value::String(text) if !text.is_empty() => Some(text.clone()),
        _ => None,
    }
}

fn optional_str(raw: &Value, key: &str) -> Option<String> {
    raw.get(key).and_then(string_value)
}

fn required_str(raw: &Value, key: &str) -> Result<String, ServiceError> {
    optional_str(raw, key).ok_or_else(|| ServiceError::incomplete_raw_credentials(key))
}
