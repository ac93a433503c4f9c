//! AES-256-GCM sealing of credential tokens at rest.
//!
//! Payload layout: `version (1) | nonce (12) | ciphertext + tag (16)`. The additional
//! authenticated data binds every ciphertext to its connection identity, so a token
//! copied onto another row fails to decrypt.

#![allow(deprecated)]

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::domain::{OwnerId, Provider};

const VERSION_ENCRYPTED: u8 = 0x01;
const VERSION_FIELD_LEN: usize = 1;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const MIN_ENCRYPTED_LEN: usize = VERSION_FIELD_LEN + NONCE_LEN + TAG_LEN;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key length: expected 32 bytes, got {0}")]
    InvalidKeyLength(usize),
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),
    #[error("invalid ciphertext format")]
    InvalidFormat,
    #[error("empty ciphertext")]
    EmptyCiphertext,
}

/// 32-byte key wiped from memory on drop.
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

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for ZeroizingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CryptoKey([REDACTED])")
    }
}

/// Connection identity mixed into the AAD of its tokens.
#[derive(Debug, Clone, Copy)]
pub struct TokenBinding<'a> {
    pub owner_id: OwnerId,
    pub provider: Provider,
    pub external_account_id: &'a str,
}

impl TokenBinding<'_> {
    fn aad(&self) -> String {
        format!(
            "{}|{}|{}",
            self.owner_id,
            self.provider.slug(),
            self.external_account_id
        )
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

    let mut sealed = Vec::with_capacity(VERSION_FIELD_LEN + NONCE_LEN + ciphertext.len());
    sealed.push(VERSION_ENCRYPTED);
    sealed.extend_from_slice(&nonce);
    sealed.append(&mut ciphertext);
    Ok(sealed)
}

pub fn decrypt_bytes(
    key: &CryptoKey,
    aad: &[u8],
    sealed: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if sealed.is_empty() {
        return Err(CryptoError::EmptyCiphertext);
    }
    if !is_encrypted_payload(sealed) {
        return Err(CryptoError::InvalidFormat);
    }

    let nonce = Nonce::from_slice(&sealed[VERSION_FIELD_LEN..VERSION_FIELD_LEN + NONCE_LEN]);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));

    cipher
        .decrypt(
            nonce,
            Payload {
                msg: &sealed[VERSION_FIELD_LEN + NONCE_LEN..],
                aad,
            },
        )
        .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
}

pub fn is_encrypted_payload(sealed: &[u8]) -> bool {
    sealed.len() >= MIN_ENCRYPTED_LEN && sealed[0] == VERSION_ENCRYPTED
}

pub fn seal_token(
    key: &CryptoKey,
    binding: TokenBinding<'_>,
    token: &str,
) -> Result<Vec<u8>, CryptoError> {
    encrypt_bytes(key, binding.aad().as_bytes(), token.as_bytes())
}

pub fn open_token(
    key: &CryptoKey,
    binding: TokenBinding<'_>,
    sealed: &[u8],
) -> Result<String, CryptoError> {
    let bytes = decrypt_bytes(key, binding.aad().as_bytes(), sealed)?;
    String::from_utf8(bytes).map_err(|e| CryptoError::DecryptionFailed(format!("invalid UTF-8: {e}")))
}
