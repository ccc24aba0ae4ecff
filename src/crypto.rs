//! Credential encryption using AES-256-GCM
//!
//! The serialized credential union is sealed with a random nonce and bound to its
//! connection by additional authenticated data (`environment|provider_config_key|connection_id`),
//! so a blob copied onto another row fails to open.

#![allow(deprecated)]

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{credentials::Credentials, repositories::ConnectionRef};

const VERSION_ENCRYPTED: u8 = 0x01;
const VERSION_FIELD_LEN: usize = 1;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const MIN_ENCRYPTED_LEN: usize = VERSION_FIELD_LEN + NONCE_LEN + TAG_LEN;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),
    #[error("invalid ciphertext format")]
    InvalidFormat,
    #[error("empty ciphertext")]
    EmptyCiphertext,
    #[error("invalid key length: expected 32 bytes, got {0}")]
    InvalidKeyLength(usize),
    #[error("credential payload could not be (de)serialized: {0}")]
    Serialization(String),
}

/// Secure wrapper for encryption keys with zeroization
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ZeroizingKey(Vec<u8>);

pub type CryptoKey = ZeroizingKey;

impl CryptoKey {
    pub fn new(bytes: Vec<u8>) -> Result<Self, CryptoError> {
        if bytes.len() != 32 {
            return Err(CryptoError::InvalidKeyLength(bytes.len()));
        }
        Ok(ZeroizingKey(bytes))
    }

    /// Random key for throwaway local and test runs
    pub fn ephemeral() -> Self {
        let key = Aes256Gcm::generate_key(&mut OsRng);
        ZeroizingKey(key.to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for ZeroizingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CryptoKey(***)")
    }
}

pub fn encrypt_bytes(
    key: &CryptoKey,
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let mut ciphertext = cipher
        .encrypt(
            &nonce,
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    let mut result = Vec::with_capacity(VERSION_FIELD_LEN + NONCE_LEN + ciphertext.len());
    result.push(VERSION_ENCRYPTED);
    result.extend_from_slice(&nonce);
    result.append(&mut ciphertext);

    Ok(result)
}

/// Decrypt bytes sealed by [`encrypt_bytes`]. Payloads without the version marker
/// are legacy plaintext and returned unchanged.
pub fn decrypt_bytes(
    key: &CryptoKey,
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.is_empty() {
        return Err(CryptoError::EmptyCiphertext);
    }

    if ciphertext[0] != VERSION_ENCRYPTED {
        return Ok(ciphertext.to_vec());
    }

    if ciphertext.len() < MIN_ENCRYPTED_LEN {
        return Err(CryptoError::InvalidFormat);
    }

    let nonce = Nonce::from_slice(&ciphertext[VERSION_FIELD_LEN..VERSION_FIELD_LEN + NONCE_LEN]);
    let sealed = &ciphertext[VERSION_FIELD_LEN + NONCE_LEN..];
    debug_assert!(sealed.len() >= TAG_LEN);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    cipher
        .decrypt(nonce, Payload { msg: sealed, aad })
        .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
}

pub fn is_encrypted_payload(ciphertext: &[u8]) -> bool {
    ciphertext.len() >= MIN_ENCRYPTED_LEN && ciphertext[0] == VERSION_ENCRYPTED
}

fn credentials_aad(connection: &ConnectionRef) -> String {
    format!(
        "{}|{}|{}",
        connection.environment_id, connection.provider_config_key, connection.connection_id
    )
}

/// Serialize and seal a credential union for the given connection
pub fn encrypt_credentials(
    key: &CryptoKey,
    connection: &ConnectionRef,
    credentials: &Credentials,
) -> Result<Vec<u8>, CryptoError> {
    let plaintext =
        serde_json::to_vec(credentials).map_err(|e| CryptoError::Serialization(e.to_string()))?;
    encrypt_bytes(key, credentials_aad(connection).as_bytes(), &plaintext)
}

/// Open a stored credential blob. Legacy plaintext JSON rows are accepted as-is.
pub fn decrypt_credentials(
    key: &CryptoKey,
    connection: &ConnectionRef,
    ciphertext: &[u8],
) -> Result<Credentials, CryptoError> {
    let plaintext = decrypt_bytes(key, credentials_aad(connection).as_bytes(), ciphertext)?;
    serde_json::from_slice(&plaintext).map_err(|e| CryptoError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{ApiKeyCredentials, Credentials};
    use serde_json::json;

    fn test_key() -> CryptoKey {
        CryptoKey::new(vec![0u8; 32]).expect("valid test key")
    }

    fn api_key(value: &str) -> Credentials {
        Credentials::ApiKey(ApiKeyCredentials {
            api_key: value.to_string(),
            raw: json!({ "api_key": value }),
        })
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = test_key();
        let encrypted = encrypt_bytes(&key, b"aad", b"secret message").unwrap();
        let decrypted = decrypt_bytes(&key, b"aad", &encrypted).unwrap();
        assert_eq!(decrypted, b"secret message");
    }

    #[test]
    fn test_different_aad_fails() {
        let key = test_key();
        let encrypted = encrypt_bytes(&key, b"aad-1", b"secret message").unwrap();
        assert!(decrypt_bytes(&key, b"aad-2", &encrypted).is_err());
    }

    #[test]
    fn test_modified_ciphertext_fails() {
        let key = test_key();
        let mut encrypted = encrypt_bytes(&key, b"aad", b"secret message").unwrap();
        encrypted[13] ^= 0x01;
        assert!(decrypt_bytes(&key, b"aad", &encrypted).is_err());
    }

    #[test]
    fn test_nonce_uniqueness() {
        let key = test_key();
        let first = encrypt_bytes(&key, b"aad", b"secret").unwrap();
        let second = encrypt_bytes(&key, b"aad", b"secret").unwrap();
        assert_ne!(&first[1..13], &second[1..13]);
    }

    #[test]
    fn test_insufficient_ciphertext_length() {
        let key = test_key();
        let result = decrypt_bytes(&key, b"aad", &[VERSION_ENCRYPTED, 0x02]);
        assert!(matches!(result, Err(CryptoError::InvalidFormat)));
    }

    #[test]
    fn test_invalid_key_length_rejected() {
        assert!(matches!(
            CryptoKey::new(vec![0u8; 16]),
            Err(CryptoError::InvalidKeyLength(16))
        ));
        assert_eq!(CryptoKey::ephemeral().as_bytes().len(), 32);
    }

    #[test]
    fn test_credentials_are_bound_to_their_connection() {
        let key = test_key();
        let owner = ConnectionRef::new("conn-a", "stripe", 1);
        let other = ConnectionRef::new("conn-b", "stripe", 1);

        let sealed = encrypt_credentials(&key, &owner, &api_key("sk_live_123")).unwrap();
        assert!(is_encrypted_payload(&sealed));
        assert!(!String::from_utf8_lossy(&sealed).contains("sk_live_123"));

        let opened = decrypt_credentials(&key, &owner, &sealed).unwrap();
        assert_eq!(opened, api_key("sk_live_123"));
        assert!(decrypt_credentials(&key, &other, &sealed).is_err());
    }

    #[test]
    fn test_legacy_plaintext_credentials_are_accepted() {
        let key = test_key();
        let connection = ConnectionRef::new("conn-a", "stripe", 1);
        let legacy = br#"{"type":"API_KEY","api_key":"legacy","raw":{}}"#;

        let opened = decrypt_credentials(&key, &connection, legacy).unwrap();
        assert!(matches!(opened, Credentials::ApiKey(ref c) if c.api_key == "legacy"));
    }

    #[test]
    fn test_debug_never_prints_key_material() {
        let key = CryptoKey::new(vec![7u8; 32]).unwrap();
        assert_eq!(format!("{key:?}"), "CryptoKey(***)");
    }
}
