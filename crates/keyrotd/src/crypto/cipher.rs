//! Record envelopes: seal and open one stored value under one [`Key`].
//!
//! # Envelope format
//!
//! ```text
//! k8s:enc:<mode>:v1:<key-name>:<payload>
//! ```
//!
//! - `aescbc`: payload is a 16-byte random IV followed by AES-256-CBC
//!   ciphertext with PKCS#7 padding.
//! - `aesgcm`: payload is a 12-byte random nonce followed by AES-256-GCM
//!   ciphertext and tag.
//! - identity: no envelope at all, the bytes are stored as written.
//!
//! The key name in the prefix selects which key to try, so a reader holding
//! several keys never has to guess.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes_gcm::{
    aead::{rand_core::RngCore, Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use thiserror::Error;

use crate::encryption::model::{Key, KeyMode, KEY_LEN};

/// Leading bytes of every enveloped record.
pub const ENVELOPE_MARKER: &[u8] = b"k8s:enc:";

/// Envelope format version.
pub const ENVELOPE_VERSION: &str = "v1";

const CBC_IV_LEN: usize = 16;
const GCM_NONCE_LEN: usize = 12;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Errors produced by the envelope layer.
#[derive(Debug, Error)]
pub enum CipherError {
    /// The key is the wrong length (must be [`KEY_LEN`] bytes).
    #[error("invalid key length: expected {KEY_LEN} bytes")]
    InvalidKeyLength,

    /// The record does not carry this key's envelope prefix.
    #[error("record is not sealed with key {0}")]
    PrefixMismatch(String),

    /// The payload is shorter than its IV / nonce.
    #[error("envelope payload truncated")]
    Truncated,

    /// Decryption, padding or authentication failed.
    #[error("decryption failed with key {0}")]
    DecryptFailure(String),

    /// Encryption failed (unreachable with a valid key).
    #[error("encryption failed")]
    EncryptFailure,

    /// The identity key was asked to read data that carries an envelope.
    #[error("record is enveloped, identity cannot read it")]
    NotCleartext,

    /// No key in the set could open the record.
    #[error("no configured key can open the record: {0}")]
    NoMatchingKey(String),
}

/// Envelope prefix written in front of records sealed by `key`. Empty for
/// the identity key.
pub fn envelope_prefix(key: &Key) -> Vec<u8> {
    match key.mode {
        KeyMode::Identity => Vec::new(),
        mode => format!(
            "k8s:enc:{}:{}:{}:",
            mode.as_str(),
            ENVELOPE_VERSION,
            key.name
        )
        .into_bytes(),
    }
}

/// Whether `data` carries any envelope at all.
pub fn is_enveloped(data: &[u8]) -> bool {
    data.starts_with(ENVELOPE_MARKER)
}

/// Whether `data` was sealed by `key`, judged by its envelope prefix.
pub fn sealed_by(key: &Key, data: &[u8]) -> bool {
    match key.mode {
        KeyMode::Identity => !is_enveloped(data),
        _ => data.starts_with(&envelope_prefix(key)),
    }
}

/// Seal `plaintext` under `key`.
///
/// # Errors
///
/// Returns [`CipherError::InvalidKeyLength`] if a real key is not
/// [`KEY_LEN`] bytes.
pub fn seal(key: &Key, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
    let mut out = envelope_prefix(key);
    match key.mode {
        KeyMode::Identity => out.extend_from_slice(plaintext),
        KeyMode::AesCbc => {
            let mut iv = [0u8; CBC_IV_LEN];
            OsRng.fill_bytes(&mut iv);
            let enc = Aes256CbcEnc::new_from_slices(checked(key)?, &iv)
                .map_err(|_| CipherError::InvalidKeyLength)?;
            out.extend_from_slice(&iv);
            out.extend_from_slice(&enc.encrypt_padded_vec_mut::<Pkcs7>(plaintext));
        }
        KeyMode::AesGcm => {
            let cipher = Aes256Gcm::new_from_slice(checked(key)?)
                .map_err(|_| CipherError::InvalidKeyLength)?;
            let mut nonce = [0u8; GCM_NONCE_LEN];
            OsRng.fill_bytes(&mut nonce);
            let ciphertext = cipher
                .encrypt(Nonce::from_slice(&nonce), plaintext)
                .map_err(|_| CipherError::EncryptFailure)?;
            out.extend_from_slice(&nonce);
            out.extend_from_slice(&ciphertext);
        }
    }
    Ok(out)
}

/// Open a record previously sealed by `key`.
///
/// # Errors
///
/// - [`CipherError::PrefixMismatch`] if `data` was not sealed by `key`.
/// - [`CipherError::NotCleartext`] if `key` is identity and `data` is enveloped.
/// - [`CipherError::DecryptFailure`] on a wrong key or tampered payload.
pub fn open(key: &Key, data: &[u8]) -> Result<Vec<u8>, CipherError> {
    if key.mode == KeyMode::Identity {
        if is_enveloped(data) {
            return Err(CipherError::NotCleartext);
        }
        return Ok(data.to_vec());
    }

    let prefix = envelope_prefix(key);
    let payload = data
        .strip_prefix(prefix.as_slice())
        .ok_or_else(|| CipherError::PrefixMismatch(key.name.clone()))?;

    match key.mode {
        KeyMode::AesCbc => {
            if payload.len() < CBC_IV_LEN {
                return Err(CipherError::Truncated);
            }
            let (iv, ciphertext) = payload.split_at(CBC_IV_LEN);
            let dec = Aes256CbcDec::new_from_slices(checked(key)?, iv)
                .map_err(|_| CipherError::InvalidKeyLength)?;
            dec.decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
                .map_err(|_| CipherError::DecryptFailure(key.name.clone()))
        }
        KeyMode::AesGcm => {
            if payload.len() < GCM_NONCE_LEN {
                return Err(CipherError::Truncated);
            }
            let (nonce, ciphertext) = payload.split_at(GCM_NONCE_LEN);
            let cipher = Aes256Gcm::new_from_slice(checked(key)?)
                .map_err(|_| CipherError::InvalidKeyLength)?;
            cipher
                .decrypt(Nonce::from_slice(nonce), ciphertext)
                .map_err(|_| CipherError::DecryptFailure(key.name.clone()))
        }
        KeyMode::Identity => unreachable!("identity handled above"),
    }
}

fn checked(key: &Key) -> Result<&[u8], CipherError> {
    let bytes = key.secret.as_bytes();
    if bytes.len() != KEY_LEN {
        return Err(CipherError::InvalidKeyLength);
    }
    Ok(bytes)
}
