//! [`Keyring`]: the key set this process reads and writes records with.
//!
//! The keyring is loaded from the local configuration at startup and again on
//! an explicit reload, which stands in for a server restart. A stage change
//! written to disk does not reach the keyring until then.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use common::EncryptionError;
use thiserror::Error;

use super::model::EncryptionConfig;
use crate::crypto::{CipherError, KeySet};

#[derive(Debug, Error)]
pub enum KeyringError {
    /// No configuration has been installed yet.
    #[error("keyring not yet initialised")]
    NotInitialised,

    #[error(transparent)]
    Cipher(#[from] CipherError),
}

impl From<KeyringError> for EncryptionError {
    fn from(e: KeyringError) -> Self {
        match e {
            KeyringError::NotInitialised => EncryptionError::Unavailable(e.to_string()),
            KeyringError::Cipher(e) => EncryptionError::RecordUnreadable(e.to_string()),
        }
    }
}

/// Lock-free handle to the active [`KeySet`].
///
/// Readers take a snapshot with [`Keyring::current`]; [`Keyring::install`]
/// swaps in a whole new set atomically.
#[derive(Clone, Debug, Default)]
pub struct Keyring {
    inner: Arc<ArcSwapOption<KeySet>>,
}

impl Keyring {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_ready(&self) -> bool {
        self.inner.load().is_some()
    }

    /// Replace the active key set with the keys of `cfg`.
    pub fn install(&self, cfg: &EncryptionConfig) {
        self.inner.store(Some(Arc::new(KeySet::from_config(cfg))));
    }

    /// # Errors
    ///
    /// Returns [`KeyringError::NotInitialised`] before the first install.
    pub fn current(&self) -> Result<Arc<KeySet>, KeyringError> {
        self.inner.load_full().ok_or(KeyringError::NotInitialised)
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, KeyringError> {
        Ok(self.current()?.seal(plaintext)?)
    }

    pub fn open(&self, data: &[u8]) -> Result<Vec<u8>, KeyringError> {
        Ok(self.current()?.open(data)?)
    }
}
