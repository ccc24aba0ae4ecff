//! # Credential model
//!
//! Every auth scheme a connection can use is a variant of the [`Credentials`]
//! union, tagged by `type` on the wire. The tag never changes after a connection
//! is created; refreshes only rewrite the fields inside the variant.

mod parse;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use utoipa::ToSchema;

pub use parse::{parse_raw_credentials, parse_tableau_expiration};

/// Auth scheme declared by a provider template and carried by each credential variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
pub enum AuthMode {
    #[serde(rename = "OAUTH1")]
    OAuth1,
    #[serde(rename = "OAUTH2")]
    OAuth2,
    #[serde(rename = "OAUTH2_CC")]
    OAuth2Cc,
    #[serde(rename = "APP")]
    App,
    #[serde(rename = "APP_STORE")]
    AppStore,
    #[serde(rename = "TABLEAU")]
    Tableau,
    #[serde(rename = "API_KEY")]
    ApiKey,
    #[serde(rename = "BASIC")]
    Basic,
    #[serde(rename = "TBA")]
    Tba,
    #[serde(rename = "CUSTOM")]
    Custom,
    #[serde(rename = "UNAUTH", alias = "NONE")]
    Unauth,
}

impl AuthMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMode::OAuth1 => "OAUTH1",
            AuthMode::OAuth2 => "OAUTH2",
            AuthMode::OAuth2Cc => "OAUTH2_CC",
            AuthMode::App => "APP",
            AuthMode::AppStore => "APP_STORE",
            AuthMode::Tableau => "TABLEAU",
            AuthMode::ApiKey => "API_KEY",
            AuthMode::Basic => "BASIC",
            AuthMode::Tba => "TBA",
            AuthMode::Custom => "CUSTOM",
            AuthMode::Unauth => "UNAUTH",
        }
    }

    /// Kinds the refresh protocol runs for when credentials are read
    pub fn is_refreshable(&self) -> bool {
        matches!(
            self,
            AuthMode::OAuth2 | AuthMode::App | AuthMode::OAuth2Cc | AuthMode::Tableau
        )
    }
}

impl std::fmt::Display for AuthMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuth1Credentials {
    pub oauth_token: String,
    pub oauth_token_secret: String,
    #[serde(default)]
    pub raw: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuth2Credentials {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, with = "expiry", skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub raw: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuth2ClientCredentials {
    pub token: String,
    #[serde(default, with = "expiry", skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub client_id: String,
    pub client_secret: String,
    #[serde(default)]
    pub raw: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppCredentials {
    pub access_token: String,
    #[serde(default, with = "expiry", skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub raw: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppStoreCredentials {
    pub access_token: String,
    #[serde(default, with = "expiry", skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Base64 encoded PEM used to mint the next assertion
    pub private_key: String,
    #[serde(default)]
    pub raw: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableauCredentials {
    pub token: String,
    #[serde(default, with = "expiry", skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub pat_name: String,
    pub pat_secret: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_url: Option<String>,
    #[serde(default)]
    pub raw: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiKeyCredentials {
    pub api_key: String,
    #[serde(default)]
    pub raw: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasicCredentials {
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub raw: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TbaCredentials {
    pub token_id: String,
    pub token_secret: String,
    #[serde(default)]
    pub raw: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomCredentials {
    #[serde(default)]
    pub raw: Value,
    #[serde(flatten)]
    pub values: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UnauthCredentials {
    #[serde(default)]
    pub raw: Value,
}

/// Tagged credential union
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Credentials {
    #[serde(rename = "OAUTH1")]
    OAuth1(OAuth1Credentials),
    #[serde(rename = "OAUTH2")]
    OAuth2(OAuth2Credentials),
    #[serde(rename = "OAUTH2_CC")]
    OAuth2Cc(OAuth2ClientCredentials),
    #[serde(rename = "APP")]
    App(AppCredentials),
    #[serde(rename = "APP_STORE")]
    AppStore(AppStoreCredentials),
    #[serde(rename = "TABLEAU")]
    Tableau(TableauCredentials),
    #[serde(rename = "API_KEY")]
    ApiKey(ApiKeyCredentials),
    #[serde(rename = "BASIC")]
    Basic(BasicCredentials),
    #[serde(rename = "TBA")]
    Tba(TbaCredentials),
    #[serde(rename = "CUSTOM")]
    Custom(CustomCredentials),
    #[serde(rename = "UNAUTH", alias = "NONE")]
    Unauth(UnauthCredentials),
}

impl Credentials {
    pub fn auth_mode(&self) -> AuthMode {
        match self {
            Credentials::OAuth1(_) => AuthMode::OAuth1,
            Credentials::OAuth2(_) => AuthMode::OAuth2,
            Credentials::OAuth2Cc(_) => AuthMode::OAuth2Cc,
            Credentials::App(_) => AuthMode::App,
            Credentials::AppStore(_) => AuthMode::AppStore,
            Credentials::Tableau(_) => AuthMode::Tableau,
            Credentials::ApiKey(_) => AuthMode::ApiKey,
            Credentials::Basic(_) => AuthMode::Basic,
            Credentials::Tba(_) => AuthMode::Tba,
            Credentials::Custom(_) => AuthMode::Custom,
            Credentials::Unauth(_) => AuthMode::Unauth,
        }
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Credentials::OAuth2(c) => c.expires_at,
            Credentials::OAuth2Cc(c) => c.expires_at,
            Credentials::App(c) => c.expires_at,
            Credentials::AppStore(c) => c.expires_at,
            Credentials::Tableau(c) => c.expires_at,
            _ => None,
        }
    }

    pub fn refresh_token(&self) -> Option<&str> {
        match self {
            Credentials::OAuth2(c) => c.refresh_token.as_deref(),
            _ => None,
        }
    }

    pub fn raw(&self) -> &Value {
        match self {
            Credentials::OAuth1(c) => &c.raw,
            Credentials::OAuth2(c) => &c.raw,
            Credentials::OAuth2Cc(c) => &c.raw,
            Credentials::App(c) => &c.raw,
            Credentials::AppStore(c) => &c.raw,
            Credentials::Tableau(c) => &c.raw,
            Credentials::ApiKey(c) => &c.raw,
            Credentials::Basic(c) => &c.raw,
            Credentials::Tba(c) => &c.raw,
            Credentials::Custom(c) => &c.raw,
            Credentials::Unauth(c) => &c.raw,
        }
    }

    /// True when `expires_at` falls inside `buffer` from `now`
    pub fn is_expiring(&self, buffer: Duration, now: DateTime<Utc>) -> bool {
        self.expires_at()
            .is_some_and(|expires_at| expires_at - now < buffer)
    }
}

/// Serde adapter for `expires_at`.
///
/// Writes RFC 3339. Reads RFC 3339 strings, epoch seconds and epoch milliseconds
/// (as numbers or numeric strings), so legacy rows decode to a canonical UTC timestamp.
pub(crate) mod expiry {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};
    use serde_json::Value;

    pub fn serialize<S: Serializer>(
        value: &Option<DateTime<Utc>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(at) => serializer.serialize_str(&at.to_rfc3339()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let value = Option::<Value>::deserialize(deserializer)?;
        match value {
            None | Some(Value::Null) => Ok(None),
            Some(value) => super::parse::timestamp_from_value(&value)
                .map(Some)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid expires_at: {value}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_tag_names_match_auth_modes() {
        let samples = vec![
            json!({"type": "OAUTH2", "access_token": "a"}),
            json!({"type": "OAUTH2_CC", "token": "t", "client_id": "c", "client_secret": "s"}),
            json!({"type": "APP", "access_token": "a"}),
            json!({"type": "API_KEY", "api_key": "k"}),
            json!({"type": "UNAUTH"}),
        ];

        for sample in samples {
            let tag = sample["type"].as_str().unwrap().to_string();
            let credentials: Credentials = serde_json::from_value(sample).unwrap();
            assert_eq!(credentials.auth_mode().as_str(), tag);
            let back = serde_json::to_value(&credentials).unwrap();
            assert_eq!(back["type"], tag);
        }
    }

    #[test]
    fn test_legacy_expiry_formats_decode_to_the_same_instant() {
        let expected = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let variants = [
            json!(expected.timestamp()),
            json!(expected.timestamp_millis()),
            json!(expected.timestamp().to_string()),
            json!("2024-05-01T12:00:00Z"),
            json!("2024-05-01T14:00:00+02:00"),
        ];

        for expires_at in variants {
            let credentials: Credentials = serde_json::from_value(json!({
                "type": "OAUTH2",
                "access_token": "a",
                "expires_at": expires_at,
            }))
            .unwrap();
            assert_eq!(credentials.expires_at(), Some(expected));
        }
    }

    #[test]
    fn test_expiry_serializes_as_rfc3339() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let credentials = Credentials::App(AppCredentials {
            access_token: "ghs_x".into(),
            expires_at: Some(at),
            raw: Value::Null,
        });
        let value = serde_json::to_value(&credentials).unwrap();
        assert_eq!(value["expires_at"], "2024-05-01T12:00:00+00:00");
    }

    #[test]
    fn test_custom_credentials_keep_arbitrary_fields() {
        let credentials: Credentials = serde_json::from_value(json!({
            "type": "CUSTOM",
            "tenant": "acme",
            "secret": "s",
        }))
        .unwrap();
        let Credentials::Custom(custom) = &credentials else {
            panic!("expected custom credentials");
        };
        assert_eq!(custom.values["tenant"], "acme");
        assert!(!custom.values.contains_key("type"));
    }

    #[test]
    fn test_is_expiring_respects_buffer() {
        let now = Utc::now();
        let credentials = Credentials::OAuth2(OAuth2Credentials {
            access_token: "a".into(),
            refresh_token: Some("r".into()),
            expires_at: Some(now + Duration::minutes(10)),
            raw: Value::Null,
        });

        assert!(credentials.is_expiring(Duration::minutes(15), now));
        assert!(!credentials.is_expiring(Duration::minutes(5), now));
        assert_eq!(credentials.refresh_token(), Some("r"));
        assert!(credentials.auth_mode().is_refreshable());
        assert!(!AuthMode::AppStore.is_refreshable());
    }
}
