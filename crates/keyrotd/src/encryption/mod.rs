//! Local encryption configuration: its typed model, its on-disk store, and
//! the in-process keyring built from it.

pub mod keyring;
pub mod model;
pub mod store;

pub use keyring::{Keyring, KeyringError};
pub use model::{EncryptionConfig, Key, KeyMode, KeySecret};
pub use store::EncryptionConfigStore;
