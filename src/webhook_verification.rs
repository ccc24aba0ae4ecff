//! # Webhook Signature Verification
//!
//! HMAC-SHA256 checks for the two signing dialects the router understands, both compared
//! in constant time:
//!
//! - GitHub style: `X-Hub-Signature-256: sha256=<hex>` over the raw body
//! - Stripe style: `Stripe-Signature: t=<ts>,v1=<hex>[,v1=<hex>]` over `{t}.{raw body}`

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

pub const GITHUB_SIGNATURE_HEADER: &str = "x-hub-signature-256";
pub const STRIPE_SIGNATURE_HEADER: &str = "stripe-signature";

/// Errors that can occur during webhook signature verification
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerificationError {
    #[error("Missing required signature header: {header}")]
    MissingSignature { header: String },

    #[error("Invalid signature format: {reason}")]
    InvalidSignatureFormat { reason: String },

    #[error("Signature verification failed")]
    VerificationFailed,

    #[error("Signature header carries no timestamp")]
    MissingTimestamp,

    #[error("Timestamp outside tolerance: {seconds}s off, max allowed: {max_seconds}s")]
    StaleTimestamp { seconds: u64, max_seconds: u64 },

    #[error("No webhook secret configured for integration {provider_config_key}")]
    MissingSecret { provider_config_key: String },
}

impl VerificationError {
    /// Short label for the `reason` metric dimension
    pub fn reason(&self) -> &'static str {
        match self {
            VerificationError::MissingSignature { .. } => "missing_signature",
            VerificationError::InvalidSignatureFormat { .. } => "malformed_signature",
            VerificationError::VerificationFailed => "mismatch",
            VerificationError::MissingTimestamp => "missing_timestamp",
            VerificationError::StaleTimestamp { .. } => "stale_timestamp",
            VerificationError::MissingSecret { .. } => "missing_secret",
        }
    }
}

/// Result type for webhook verification
pub type VerificationResult<T> = Result<T, VerificationError>;

fn hmac_sha256(secret: &str, parts: &[&[u8]]) -> VerificationResult<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| VerificationError::VerificationFailed)?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac.finalize().into_bytes().to_vec())
}

fn constant_time_matches(expected: &[u8], provided: &[u8]) -> bool {
    expected.ct_eq(provided).into()
}

/// Verifies GitHub webhook signature using HMAC-SHA256
pub fn verify_github_signature(
    body: &[u8],
    signature_header: &str,
    secret: &str,
) -> VerificationResult<()> {
    debug!(
        body_size = body.len(),
        "Starting GitHub signature verification"
    );

    if signature_header.is_empty() {
        return Err(VerificationError::MissingSignature {
            header: "X-Hub-Signature-256".to_string(),
        });
    }

    let Some(provided_hex) = signature_header.strip_prefix("sha256=") else {
        return Err(VerificationError::InvalidSignatureFormat {
            reason: "X-Hub-Signature-256 must start with 'sha256='".to_string(),
        });
    };

    let provided = hex::decode(provided_hex).map_err(|_| {
        VerificationError::InvalidSignatureFormat {
            reason: "X-Hub-Signature-256 contains invalid hex".to_string(),
        }
    })?;

    let expected = hmac_sha256(secret, &[body])?;
    if constant_time_matches(&expected, &provided) {
        Ok(())
    } else {
        Err(VerificationError::VerificationFailed)
    }
}

/// Verifies a Stripe-style signature. Any one `v1` entry matching is enough.
///
/// With `tolerance_seconds` set, `t` must also lie within that many seconds of `now`.
pub fn verify_stripe_signature(
    body: &[u8],
    signature_header: &str,
    secret: &str,
    now: i64,
    tolerance_seconds: Option<u64>,
) -> VerificationResult<()> {
    if signature_header.is_empty() {
        return Err(VerificationError::MissingSignature {
            header: "Stripe-Signature".to_string(),
        });
    }

    let parts: Vec<(&str, &str)> = signature_header
        .split(',')
        .filter_map(|part| part.trim().split_once('='))
        .collect();
    if parts.len() < 2 {
        return Err(VerificationError::InvalidSignatureFormat {
            reason: "Stripe-Signature needs t= and v1= entries".to_string(),
        });
    }

    let timestamp = parts
        .iter()
        .find(|(key, _)| *key == "t")
        .map(|(_, value)| *value)
        .filter(|value| !value.is_empty())
        .ok_or(VerificationError::MissingTimestamp)?;

    let signatures: Vec<&str> = parts
        .iter()
        .filter(|(key, _)| *key == "v1")
        .map(|(_, value)| *value)
        .collect();
    if signatures.is_empty() {
        return Err(VerificationError::InvalidSignatureFormat {
            reason: "Stripe-Signature carries no v1 signature".to_string(),
        });
    }

    if let Some(max_seconds) = tolerance_seconds {
        let issued_at =
            timestamp
                .parse::<i64>()
                .map_err(|_| VerificationError::InvalidSignatureFormat {
                    reason: "Stripe-Signature timestamp is not a number".to_string(),
                })?;
        let seconds = now.abs_diff(issued_at);
        if seconds > max_seconds {
            return Err(VerificationError::StaleTimestamp {
                seconds,
                max_seconds,
            });
        }
    }

    let expected = hmac_sha256(secret, &[timestamp.as_bytes(), b".", body])?;
    let matched = signatures.iter().any(|candidate| {
        hex::decode(candidate).is_ok_and(|provided| constant_time_matches(&expected, &provided))
    });

    if matched {
        Ok(())
    } else {
        Err(VerificationError::VerificationFailed)
    }
}

/// Hex HMAC-SHA256 of `parts` under `secret`, for building test signatures and fixtures
pub fn sign_hex(secret: &str, parts: &[&[u8]]) -> String {
    match hmac_sha256(secret, parts) {
        Ok(bytes) => hex::encode(bytes),
        Err(_) => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test";

    #[test]
    fn test_github_signature_valid() {
        let body = br#"{"action":"created"}"#;
        let header = format!("sha256={}", sign_hex(SECRET, &[body]));
        assert!(verify_github_signature(body, &header, SECRET).is_ok());
    }

    #[test]
    fn test_github_signature_rejections() {
        let body = b"{}";
        assert!(matches!(
            verify_github_signature(body, "", SECRET),
            Err(VerificationError::MissingSignature { .. })
        ));
        assert!(matches!(
            verify_github_signature(body, "sha1=abcd", SECRET),
            Err(VerificationError::InvalidSignatureFormat { .. })
        ));
        assert!(matches!(
            verify_github_signature(body, "sha256=zz", SECRET),
            Err(VerificationError::InvalidSignatureFormat { .. })
        ));
        let wrong = format!("sha256={}", sign_hex("other", &[body]));
        assert_eq!(
            verify_github_signature(body, &wrong, SECRET),
            Err(VerificationError::VerificationFailed)
        );
    }

    #[test]
    fn test_stripe_signature_valid_with_rotated_secret_entry() {
        let body = br#"{"type":"deal.updated"}"#;
        let now = 1_700_000_000;
        let good = sign_hex(SECRET, &[b"1700000000", b".", body]);
        let header = format!("t=1700000000,v1={},v1={good}", "00".repeat(32));

        assert!(verify_stripe_signature(body, &header, SECRET, now, Some(300)).is_ok());
    }

    #[test]
    fn test_stripe_signature_rejections() {
        let body = b"{}";
        let now = 1_700_000_000;
        let good = sign_hex(SECRET, &[b"1700000000", b".", body]);

        assert!(matches!(
            verify_stripe_signature(body, "", SECRET, now, None),
            Err(VerificationError::MissingSignature { .. })
        ));
        assert!(matches!(
            verify_stripe_signature(body, "garbage", SECRET, now, None),
            Err(VerificationError::InvalidSignatureFormat { .. })
        ));
        assert_eq!(
            verify_stripe_signature(body, &format!("v0=1,v1={good}"), SECRET, now, None),
            Err(VerificationError::MissingTimestamp)
        );
        assert!(matches!(
            verify_stripe_signature(
                body,
                &format!("t=1700000000,v1={good}"),
                SECRET,
                now + 301,
                Some(300)
            ),
            Err(VerificationError::StaleTimestamp { .. })
        ));
        assert_eq!(
            verify_stripe_signature(body, "t=1700000000,v1=abcd", SECRET, now, None),
            Err(VerificationError::VerificationFailed)
        );
        assert_eq!(
            verify_stripe_signature(
                b"{\"tampered\":true}",
                &format!("t=1700000000,v1={good}"),
                SECRET,
                now,
                None
            ),
            Err(VerificationError::VerificationFailed)
        );
    }

    #[test]
    fn test_reason_labels() {
        assert_eq!(VerificationError::VerificationFailed.reason(), "mismatch");
        assert_eq!(
            VerificationError::MissingSecret {
                provider_config_key: "x".into()
            }
            .reason(),
            "missing_secret"
        );
    }
}
