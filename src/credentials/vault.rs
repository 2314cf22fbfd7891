//! Symmetric encryption of the transport secret at rest
//!
//! Blob layout: `[iv_len: u8][iv][ciphertext + GCM tag]`. The IV is 12 random
//! bytes drawn fresh for every encryption.

use super::CredentialError;
use crate::config::Environment;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::{error, warn};

pub const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KEY_DOMAIN: &[u8] = b"hostlink-agent/credential-vault/v1:";
const FALLBACK_IDENTITY: &str = "hostlink-default-identity";

/// 256-bit vault key; never printed
#[derive(Clone, PartialEq, Eq)]
pub struct VaultKey([u8; 32]);

impl std::fmt::Debug for VaultKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("VaultKey(***)")
    }
}

/// Derived key plus whether it came from the well-known fallback identity
#[derive(Debug, Clone)]
pub struct DerivedKey {
    pub key: VaultKey,
    pub fallback: bool,
}

fn key_for(identity: &str) -> VaultKey {
    let mut hasher = Sha256::new();
    hasher.update(KEY_DOMAIN);
    hasher.update(identity.as_bytes());
    VaultKey(hasher.finalize().into())
}

/// Derive the vault key from the agent's stable identity.
///
/// A missing or blank identity falls back to a fixed key. That is a security
/// downgrade and is always logged, but it never fails.
pub fn derive_key(agent_id: Option<&str>, environment: Environment) -> DerivedKey {
    match agent_id.map(str::trim).filter(|id| !id.is_empty()) {
        Some(id) => DerivedKey {
            key: key_for(id),
            fallback: false,
        },
        None => {
            if environment.is_production() {
                error!(
                    security = true,
                    "No agent identity available in production; credential vault is using the well-known fallback key"
                );
            } else {
                warn!(
                    security = true,
                    "No agent identity available; credential vault is using the well-known fallback key"
                );
            }
            DerivedKey {
                key: key_for(FALLBACK_IDENTITY),
                fallback: true,
            }
        }
    }
}

fn cipher(key: &VaultKey) -> Aes256Gcm {
    Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key.0))
}

pub fn encrypt(secret: &str, key: &VaultKey) -> Result<Vec<u8>, CredentialError> {
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);

    let ciphertext = cipher(key)
        .encrypt(Nonce::from_slice(&iv), secret.as_bytes())
        .map_err(|_| CredentialError::Corrupt("encryption failed".to_string()))?;

    let mut blob = Vec::with_capacity(1 + IV_LEN + ciphertext.len());
    blob.push(IV_LEN as u8);
    blob.extend_from_slice(&iv);
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

pub fn decrypt(blob: &[u8], key: &VaultKey) -> Result<String, CredentialError> {
    let (&iv_len, rest) = blob
        .split_first()
        .ok_or_else(|| CredentialError::Corrupt("empty blob".to_string()))?;

    if iv_len as usize != IV_LEN {
        return Err(CredentialError::Corrupt(format!(
            "unexpected IV length {iv_len}"
        )));
    }
    if rest.len() < IV_LEN + TAG_LEN {
        return Err(CredentialError::Corrupt(format!(
            "blob truncated to {} bytes",
            blob.len()
        )));
    }

    let (iv, ciphertext) = rest.split_at(IV_LEN);
    let plaintext = cipher(key)
        .decrypt(Nonce::from_slice(iv), ciphertext)
        .map_err(|_| CredentialError::Corrupt("authentication tag mismatch".to_string()))?;

    String::from_utf8(plaintext)
        .map_err(|_| CredentialError::Corrupt("plaintext is not UTF-8".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn key(id: &str) -> VaultKey {
        derive_key(Some(id), Environment::Development).key
    }

    #[test]
    fn test_key_derivation_is_deterministic() {
        assert_eq!(key("srv-1"), key("srv-1"));
        assert_ne!(key("srv-1"), key("srv-2"));
    }

    #[test]
    fn test_missing_identity_uses_flagged_fallback() {
        let derived = derive_key(None, Environment::Development);
        assert!(derived.fallback);

        let blank = derive_key(Some("   "), Environment::Production);
        assert!(blank.fallback);
        assert_eq!(blank.key, derived.key);

        assert!(!derive_key(Some("srv-1"), Environment::Production).fallback);
    }

    #[test]
    fn test_fresh_iv_per_encryption() {
        let k = key("srv-1");
        let a = encrypt("amqp://u:p@broker", &k).unwrap();
        let b = encrypt("amqp://u:p@broker", &k).unwrap();
        assert_ne!(a, b);
        assert_eq!(a[0] as usize, IV_LEN);
    }

    #[test]
    fn test_malformed_iv_length_rejected() {
        let k = key("srv-1");
        let mut blob = encrypt("secret", &k).unwrap();
        blob[0] = 16;
        assert!(matches!(
            decrypt(&blob, &k),
            Err(CredentialError::Corrupt(_))
        ));
    }

    #[test]
    fn test_empty_blob_rejected() {
        assert!(matches!(
            decrypt(&[], &key("srv-1")),
            Err(CredentialError::Corrupt(_))
        ));
    }

    #[test]
    fn test_debug_does_not_leak_key() {
        assert_eq!(format!("{:?}", key("srv-1")), "VaultKey(***)");
    }

    proptest! {
        #[test]
        fn prop_round_trip(secret in "\\PC{1,200}", id in "[a-zA-Z0-9._-]{1,32}") {
            let k = key(&id);
            let blob = encrypt(&secret, &k).unwrap();
            prop_assert_eq!(decrypt(&blob, &k).unwrap(), secret);
        }

        #[test]
        fn prop_wrong_key_never_decrypts(secret in "\\PC{1,64}", a in "[a-z]{1,16}", b in "[A-Z]{1,16}") {
            let blob = encrypt(&secret, &key(&a)).unwrap();
            prop_assert!(decrypt(&blob, &key(&b)).is_err());
        }

        #[test]
        fn prop_truncated_blob_fails(secret in "\\PC{1,64}", cut in 0usize..1000) {
            let k = key("srv-1");
            let blob = encrypt(&secret, &k).unwrap();
            let cut = cut % blob.len();
            prop_assert!(decrypt(&blob[..cut], &k).is_err());
        }
    }
}
