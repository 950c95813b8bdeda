//! Cryptographic primitives.
//!
//! - [`cipher`]: per-record envelopes for the configured key modes.
//! - [`seal`]: token-derived sealing of the shared generation marker.
//! - [`KeySet`]: an ordered key list used to read and write records.
//!
//! Nothing here touches the filesystem, the datastore or HTTP.

pub mod cipher;
pub mod seal;

pub use cipher::CipherError;
pub use seal::{SealError, TokenSealer};

use crate::encryption::model::{EncryptionConfig, Key};

/// Ordered keys taken from an [`EncryptionConfig`]: the first seals, any of
/// them may open.
#[derive(Debug, Clone)]
pub struct KeySet {
    keys: Vec<Key>,
}

impl KeySet {
    pub fn from_config(cfg: &EncryptionConfig) -> Self {
        Self {
            keys: cfg.keys.clone(),
        }
    }

    pub fn primary(&self) -> Option<&Key> {
        self.keys.first()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().map(|k| k.name.as_str())
    }

    /// Seal `plaintext` under the primary key.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let primary = self
            .primary()
            .ok_or_else(|| CipherError::NoMatchingKey("key set is empty".into()))?;
        cipher::seal(primary, plaintext)
    }

    /// Open `data` with the first key whose envelope matches and whose
    /// material authenticates.
    pub fn open(&self, data: &[u8]) -> Result<Vec<u8>, CipherError> {
        let mut last = None;
        for key in self.keys.iter().filter(|k| cipher::sealed_by(k, data)) {
            match cipher::open(key, data) {
                Ok(plain) => return Ok(plain),
                Err(e) => last = Some(e),
            }
        }
        Err(match last {
            Some(e) => CipherError::NoMatchingKey(e.to_string()),
            None => CipherError::NoMatchingKey(describe_envelope(data)),
        })
    }

    /// Whether `data` is already sealed by the primary key.
    pub fn sealed_by_primary(&self, data: &[u8]) -> bool {
        self.primary().is_some_and(|k| cipher::sealed_by(k, data))
    }
}

fn describe_envelope(data: &[u8]) -> String {
    if !cipher::is_enveloped(data) {
        return "record is cleartext and identity is not configured".into();
    }
    let head = data.iter().take(96).copied().collect::<Vec<u8>>();
    let head = String::from_utf8_lossy(&head);
    let name = head.split(':').nth(4).unwrap_or("?");
    format!("record sealed with unknown key {name}")
}
