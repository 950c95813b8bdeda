//! AES-256-GCM-SIV sealing of the cluster-shared generation marker.
//!
//! The marker carries key material through the shared datastore, so it is
//! sealed under a key derived from the cluster token that every server holds:
//!
//! ```text
//! key = HMAC-SHA256(cluster_token, "keyrot generation marker")
//! v1.<base64url-no-pad(nonce)>.<base64url-no-pad(ciphertext+tag)>
//! ```

use aes_gcm_siv::{
    aead::{rand_core::RngCore, Aead, KeyInit, OsRng},
    Aes256GcmSiv, Nonce,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

/// Byte length of an AES-GCM-SIV nonce.
pub const NONCE_LEN: usize = 12;

/// Prefix that appears at the start of every sealed blob.
pub const VERSION_PREFIX: &str = "v1";

const DERIVATION_LABEL: &[u8] = b"keyrot generation marker";

#[derive(Debug, Error)]
pub enum SealError {
    #[error("invalid sealed blob format")]
    InvalidFormat,

    /// Wrong cluster token or tampered blob.
    #[error("aead operation failed")]
    AeadFailure,

    #[error("cluster token must not be empty")]
    EmptyToken,
}

/// Seals and opens blobs under the token-derived key.
#[derive(Clone)]
pub struct TokenSealer {
    cipher: Aes256GcmSiv,
}

impl std::fmt::Debug for TokenSealer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TokenSealer([REDACTED])")
    }
}

impl TokenSealer {
    /// Derive the sealing key from `token`.
    pub fn from_token(token: &str) -> Result<Self, SealError> {
        if token.is_empty() {
            return Err(SealError::EmptyToken);
        }
        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(token.as_bytes())
            .map_err(|_| SealError::EmptyToken)?;
        mac.update(DERIVATION_LABEL);
        let derived = mac.finalize().into_bytes();
        let cipher =
            Aes256GcmSiv::new_from_slice(&derived).map_err(|_| SealError::AeadFailure)?;
        Ok(Self { cipher })
    }

    /// Seal `plaintext` with a fresh random nonce.
    pub fn seal(&self, plaintext: &[u8]) -> Result<String, SealError> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| SealError::AeadFailure)?;
        Ok(format!(
            "{}.{}.{}",
            VERSION_PREFIX,
            URL_SAFE_NO_PAD.encode(nonce),
            URL_SAFE_NO_PAD.encode(ciphertext),
        ))
    }

    /// Open a blob produced by [`Self::seal`].
    pub fn open(&self, sealed: &str) -> Result<Vec<u8>, SealError> {
        let parts: Vec<&str> = sealed.trim().splitn(3, '.').collect();
        if parts.len() != 3 || parts[0] != VERSION_PREFIX {
            return Err(SealError::InvalidFormat);
        }
        let nonce = URL_SAFE_NO_PAD
            .decode(parts[1])
            .map_err(|_| SealError::InvalidFormat)?;
        if nonce.len() != NONCE_LEN {
            return Err(SealError::InvalidFormat);
        }
        let ciphertext = URL_SAFE_NO_PAD
            .decode(parts[2])
            .map_err(|_| SealError::InvalidFormat)?;
        self.cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_ref())
            .map_err(|_| SealError::AeadFailure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let sealer = TokenSealer::from_token("K10abc::server:secret").unwrap();
        let blob = sealer.seal(b"{\"generation\":1}").unwrap();
        assert!(blob.starts_with("v1."));
        assert_eq!(sealer.open(&blob).unwrap(), b"{\"generation\":1}");
    }

    #[test]
    fn nonces_differ_between_calls() {
        let sealer = TokenSealer::from_token("t").unwrap();
        assert_ne!(sealer.seal(b"x").unwrap(), sealer.seal(b"x").unwrap());
    }

    #[test]
    fn other_token_cannot_open() {
        let blob = TokenSealer::from_token("one").unwrap().seal(b"x").unwrap();
        let other = TokenSealer::from_token("two").unwrap();
        assert!(matches!(other.open(&blob), Err(SealError::AeadFailure)));
    }

    #[test]
    fn malformed_blobs_are_rejected() {
        let sealer = TokenSealer::from_token("t").unwrap();
        for bad in ["", "v1", "v2.AAAA.AAAA", "v1.!!.AAAA", "v1.AAAA.AAAA"] {
            assert!(sealer.open(bad).is_err(), "{bad} should not open");
        }
    }

    #[test]
    fn empty_token_is_rejected() {
        assert!(matches!(
            TokenSealer::from_token(""),
            Err(SealError::EmptyToken)
        ));
    }
}
