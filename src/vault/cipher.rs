//! AES-256-GCM cipher capability used by the credential vault.
//!
//! Secrets are stored as a versioned envelope: `enc:v1:` followed by the
//! base64 encoding of `nonce || ciphertext+tag`. The nonce is fresh per
//! write; rotating the process key invalidates all stored secrets.

use aes_gcm::aead::{Aead, KeyInit, OsRng, Payload};
use aes_gcm::Aes256Gcm;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use orcheo_types::{EncryptedSecret, OrcheoError};
use sha2::{Digest, Sha256};

const ENVELOPE_PREFIX: &str = "enc:v1:";
const NONCE_BYTES: usize = 12;
const VAULT_AAD: &[u8] = b"orcheo-credential-vault-v1";
const MIN_KEY_CHARS: usize = 8;

/// Process-wide secret cipher. The configured key material is digested
/// into a 256-bit key.
pub struct SecretCipher {
    cipher: Aes256Gcm,
}

impl SecretCipher {
    pub fn new(key: &str) -> Result<Self, OrcheoError> {
        let key = key.trim();
        if key.len() < MIN_KEY_CHARS {
            return Err(OrcheoError::Config(format!(
                "vault encryption key must be at least {MIN_KEY_CHARS} characters"
            )));
        }
        let digest = Sha256::digest(key.as_bytes());
        let cipher = Aes256Gcm::new_from_slice(&digest)
            .map_err(|_| OrcheoError::Config("vault key material has invalid length".to_string()))?;
        Ok(SecretCipher { cipher })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<EncryptedSecret, OrcheoError> {
        if plaintext.trim().is_empty() {
            return Err(OrcheoError::Validation(
                "credential secret must not be empty".to_string(),
            ));
        }
        let mut nonce = [0u8; NONCE_BYTES];
        use aes_gcm::aead::rand_core::RngCore as _;
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(
                (&nonce).into(),
                Payload {
                    msg: plaintext.as_bytes(),
                    aad: VAULT_AAD,
                },
            )
            .map_err(|_| OrcheoError::Validation("credential encryption failed".to_string()))?;
        let mut envelope = Vec::with_capacity(NONCE_BYTES + ciphertext.len());
        envelope.extend_from_slice(&nonce);
        envelope.extend_from_slice(&ciphertext);
        Ok(EncryptedSecret {
            ciphertext: format!("{ENVELOPE_PREFIX}{}", BASE64_STANDARD.encode(envelope)),
        })
    }

    pub fn decrypt(&self, secret: &EncryptedSecret) -> Result<String, OrcheoError> {
        let payload = secret
            .ciphertext
            .strip_prefix(ENVELOPE_PREFIX)
            .ok_or_else(|| {
                OrcheoError::Validation("credential envelope prefix is invalid".to_string())
            })?;
        let raw = BASE64_STANDARD.decode(payload).map_err(|_| {
            OrcheoError::Validation("credential envelope encoding is invalid".to_string())
        })?;
        if raw.len() <= NONCE_BYTES {
            return Err(OrcheoError::Validation(
                "credential envelope is truncated".to_string(),
            ));
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_BYTES);
        let plaintext = self
            .cipher
            .decrypt(
                nonce.into(),
                Payload {
                    msg: ciphertext,
                    aad: VAULT_AAD,
                },
            )
            .map_err(|_| {
                OrcheoError::Validation("credential integrity check failed".to_string())
            })?;
        String::from_utf8(plaintext)
            .map_err(|_| OrcheoError::Validation("credential payload is not UTF-8".to_string()))
    }
}
