//! Typed representation of a node's encryption configuration.
//!
//! The first key in [`EncryptionConfig::keys`] is the primary and seals every
//! new write; the rest are legacy keys kept only so older ciphertext can still
//! be opened. Serialization preserves key order exactly, and that serialized
//! form is what [`EncryptionConfig::hash`] digests.

use std::collections::HashSet;
use std::fmt;

use aes_gcm_siv::aead::{rand_core::RngCore, OsRng};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use common::protocol::NodeState;
use common::Stage;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Byte length of every real key (AES-256).
pub const KEY_LEN: usize = 32;

/// Name carried by the identity pseudo-key.
pub const IDENTITY_KEY_NAME: &str = "identity";

/// Cipher a key is used with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyMode {
    #[serde(rename = "aescbc")]
    AesCbc,
    #[serde(rename = "aesgcm")]
    AesGcm,
    /// No encryption: records are stored as written.
    #[serde(rename = "identity")]
    Identity,
}

impl KeyMode {
    /// Provider name as it appears in envelopes and configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyMode::AesCbc => "aescbc",
            KeyMode::AesGcm => "aesgcm",
            KeyMode::Identity => "identity",
        }
    }

    /// Label shown to operators in status output.
    pub fn label(&self) -> &'static str {
        match self {
            KeyMode::AesCbc => "AES-CBC",
            KeyMode::AesGcm => "AES-GCM",
            KeyMode::Identity => "Identity",
        }
    }

    /// Parse a configured provider name. Identity is not a provider that new
    /// keys can be generated for.
    pub fn provider(name: &str) -> Option<Self> {
        match name {
            "aescbc" => Some(KeyMode::AesCbc),
            "aesgcm" => Some(KeyMode::AesGcm),
            _ => None,
        }
    }
}

/// Raw key material.
///
/// Zeroed on drop and never printed, not even in debug output.
#[derive(Clone, PartialEq, Eq)]
pub struct KeySecret(Vec<u8>);

impl KeySecret {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Drop for KeySecret {
    fn drop(&mut self) {
        self.0.iter_mut().for_each(|b| *b = 0);
    }
}

impl fmt::Debug for KeySecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeySecret([REDACTED])")
    }
}

impl Serialize for KeySecret {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for KeySecret {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(KeySecret)
            .map_err(serde::de::Error::custom)
    }
}

/// A named encryption key. Field order is part of the canonical form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Key {
    pub name: String,
    pub mode: KeyMode,
    pub secret: KeySecret,
}

impl Key {
    /// Generate a fresh random key for `mode`. Asking for identity yields
    /// [`Key::identity`].
    pub fn generate(mode: KeyMode) -> Self {
        if mode == KeyMode::Identity {
            return Self::identity();
        }
        let mut bytes = vec![0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self {
            name: format!("{}key-{}", mode.as_str(), Uuid::new_v4().simple()),
            mode,
            secret: KeySecret::new(bytes),
        }
    }

    /// The identity pseudo-key: when primary, records are written in cleartext.
    pub fn identity() -> Self {
        Self {
            name: IDENTITY_KEY_NAME.into(),
            mode: KeyMode::Identity,
            secret: KeySecret::new(Vec::new()),
        }
    }

    pub fn is_identity(&self) -> bool {
        self.mode == KeyMode::Identity
    }

    /// `"AES-CBC aescbckey-…"`.
    pub fn label(&self) -> String {
        format!("{} {}", self.mode.label(), self.name)
    }
}

/// Ordered key list plus the node's rotation stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionConfig {
    pub keys: Vec<Key>,
    pub stage: Stage,
    pub enabled: bool,
}

impl EncryptionConfig {
    /// First-bootstrap configuration: one generated primary key, `stage=start`.
    pub fn bootstrap(provider: KeyMode) -> Self {
        Self {
            keys: vec![Key::generate(provider)],
            stage: Stage::Start,
            enabled: true,
        }
    }

    pub fn primary(&self) -> Option<&Key> {
        self.keys.first()
    }

    /// Canonical serialization: compact JSON, struct field order.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Lowercase hex SHA-256 of [`Self::canonical_bytes`].
    pub fn hash(&self) -> String {
        // Serializing plain structs, strings and enums cannot fail.
        let bytes = self.canonical_bytes().unwrap_or_default();
        format!("{:x}", Sha256::digest(&bytes))
    }

    /// Check the structural invariants every persisted configuration must hold.
    pub fn validate(&self) -> Result<(), String> {
        let primary = self.primary().ok_or("key list is empty")?;
        if self.enabled == primary.is_identity() {
            return Err(format!(
                "enabled={} does not agree with primary key {}",
                self.enabled, primary.name
            ));
        }
        let mut names = HashSet::new();
        for key in &self.keys {
            if !names.insert(key.name.as_str()) {
                return Err(format!("duplicate key name {}", key.name));
            }
            match key.mode {
                KeyMode::Identity if !key.secret.is_empty() => {
                    return Err("identity key must not carry a secret".into());
                }
                KeyMode::AesCbc | KeyMode::AesGcm if key.secret.len() != KEY_LEN => {
                    return Err(format!(
                        "key {} has {} bytes, expected {KEY_LEN}",
                        key.name,
                        key.secret.len()
                    ));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Insert `key` directly behind the primary, as a decrypt-only secondary.
    pub fn insert_secondary(&mut self, key: Key) {
        let at = self.keys.len().min(1);
        self.keys.insert(at, key);
    }

    /// Promote the secondary key to primary.
    pub fn swap_primary(&mut self) {
        if self.keys.len() >= 2 {
            self.keys.swap(0, 1);
        }
    }

    /// Drop every legacy key.
    pub fn retain_primary(&mut self) {
        self.keys.truncate(1);
    }

    /// Operator-facing labels: the active key (unless identity is primary)
    /// and every non-identity legacy key.
    pub fn key_labels(&self) -> (Option<String>, Vec<String>) {
        let active = self.primary().filter(|k| !k.is_identity()).map(Key::label);
        let inactive = self
            .keys
            .iter()
            .skip(1)
            .filter(|k| !k.is_identity())
            .map(Key::label)
            .collect();
        (active, inactive)
    }

    /// Snapshot served to peers and status callers.
    pub fn node_state(&self, node_id: &str) -> NodeState {
        let (active_key, inactive_keys) = self.key_labels();
        NodeState {
            node_id: node_id.to_owned(),
            stage: self.stage,
            enabled: self.enabled,
            config_hash: self.hash(),
            active_key,
            inactive_keys,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_key(name: &str, byte: u8) -> Key {
        Key {
            name: name.into(),
            mode: KeyMode::AesCbc,
            secret: KeySecret::new(vec![byte; KEY_LEN]),
        }
    }

    fn two_key_config() -> EncryptionConfig {
        EncryptionConfig {
            keys: vec![fixed_key("a", 1), fixed_key("b", 2)],
            stage: Stage::Prepare,
            enabled: true,
        }
    }

    #[test]
    fn identical_configs_hash_equal() {
        assert_eq!(two_key_config().hash(), two_key_config().hash());
    }

    #[test]
    fn key_order_changes_hash() {
        let a = two_key_config();
        let mut b = two_key_config();
        b.swap_primary();
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn stage_and_material_change_hash() {
        let a = two_key_config();
        let mut staged = two_key_config();
        staged.stage = Stage::Rotate;
        assert_ne!(a.hash(), staged.hash());

        let mut material = two_key_config();
        material.keys[1] = fixed_key("b", 3);
        assert_ne!(a.hash(), material.hash());
    }

    #[test]
    fn bootstrap_has_single_primary() {
        let cfg = EncryptionConfig::bootstrap(KeyMode::AesGcm);
        assert_eq!(cfg.keys.len(), 1);
        assert_eq!(cfg.stage, Stage::Start);
        assert!(cfg.enabled);
        assert!(cfg.keys[0].name.starts_with("aesgcmkey-"));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn insert_secondary_keeps_primary_first() {
        let mut cfg = EncryptionConfig {
            keys: vec![fixed_key("a", 1), Key::identity()],
            stage: Stage::Start,
            enabled: true,
        };
        cfg.insert_secondary(fixed_key("new", 9));
        let names: Vec<_> = cfg.keys.iter().map(|k| k.name.as_str()).collect();
        assert_eq!(names, ["a", "new", "identity"]);
    }

    #[test]
    fn validate_rejects_bad_configs() {
        let empty = EncryptionConfig {
            keys: vec![],
            stage: Stage::Start,
            enabled: true,
        };
        assert!(empty.validate().is_err());

        let mut dup = two_key_config();
        dup.keys[1].name = "a".into();
        assert!(dup.validate().is_err());

        let mut disagree = two_key_config();
        disagree.enabled = false;
        assert!(disagree.validate().is_err());

        let mut short = two_key_config();
        short.keys[0].secret = KeySecret::new(vec![0u8; 16]);
        assert!(short.validate().is_err());
    }

    #[test]
    fn labels_skip_identity() {
        let cfg = EncryptionConfig {
            keys: vec![Key::identity(), fixed_key("a", 1)],
            stage: Stage::ReencryptFinished,
            enabled: false,
        };
        let (active, inactive) = cfg.key_labels();
        assert!(active.is_none());
        assert_eq!(inactive, vec!["AES-CBC a".to_string()]);
    }

    #[test]
    fn secret_round_trips_as_base64_and_is_redacted() {
        let key = fixed_key("a", 0x42);
        let json = serde_json::to_string(&key).unwrap();
        assert!(json.contains(&STANDARD.encode([0x42u8; KEY_LEN])));
        let back: Key = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
        assert!(format!("{key:?}").contains("REDACTED"));
    }
}
