//! Generation marker: the one record through which nodes converge.
//!
//! Every committed transition publishes the node's full configuration under
//! [`MARKER_KEY`], sealed with the cluster token. Other nodes pick it up on
//! their next reload.

use std::sync::Arc;

use common::EncryptionError;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::crypto::{SealError, TokenSealer};
use crate::datastore::{Datastore, DatastoreError};
use crate::encryption::EncryptionConfig;

/// Datastore key the marker lives under.
pub const MARKER_KEY: &str = "/bootstrap/encryption-generation-marker";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationMarker {
    pub generation: u64,
    /// Node that published this generation.
    pub origin: String,
    pub config: EncryptionConfig,
}

#[derive(Debug, Error)]
pub enum MarkerError {
    #[error(transparent)]
    Datastore(#[from] DatastoreError),

    #[error("generation marker cannot be opened: {0}")]
    Seal(#[from] SealError),

    #[error("generation marker is malformed: {0}")]
    Malformed(String),
}

impl From<MarkerError> for EncryptionError {
    fn from(e: MarkerError) -> Self {
        match e {
            MarkerError::Datastore(e) => e.into(),
            other => EncryptionError::ConfigCorrupt(other.to_string()),
        }
    }
}

/// Reads and writes the sealed marker.
#[derive(Clone)]
pub struct MarkerPublisher {
    datastore: Arc<dyn Datastore>,
    sealer: TokenSealer,
}

impl MarkerPublisher {
    pub fn new(datastore: Arc<dyn Datastore>, cluster_token: &str) -> Result<Self, MarkerError> {
        Ok(Self {
            datastore,
            sealer: TokenSealer::from_token(cluster_token)?,
        })
    }

    /// Current marker, or `None` if nothing has been published yet.
    pub async fn fetch(&self) -> Result<Option<GenerationMarker>, MarkerError> {
        let Some(raw) = self.datastore.get(MARKER_KEY).await? else {
            return Ok(None);
        };
        let text = std::str::from_utf8(&raw)
            .map_err(|e| MarkerError::Malformed(e.to_string()))?;
        let plain = self.sealer.open(text)?;
        let marker: GenerationMarker =
            serde_json::from_slice(&plain).map_err(|e| MarkerError::Malformed(e.to_string()))?;
        marker.config.validate().map_err(MarkerError::Malformed)?;
        Ok(Some(marker))
    }

    /// Publish `config` as the next generation. Returns the new marker.
    pub async fn publish(
        &self,
        origin: &str,
        config: &EncryptionConfig,
    ) -> Result<GenerationMarker, MarkerError> {
        let previous = match self.fetch().await {
            Ok(m) => m.map_or(0, |m| m.generation),
            // An unreadable marker is replaced, not extended.
            Err(MarkerError::Seal(_) | MarkerError::Malformed(_)) => 0,
            Err(e) => return Err(e),
        };
        let marker = GenerationMarker {
            generation: previous + 1,
            origin: origin.to_owned(),
            config: config.clone(),
        };
        let plain =
            serde_json::to_vec(&marker).map_err(|e| MarkerError::Malformed(e.to_string()))?;
        let sealed = self.sealer.seal(&plain)?;
        self.datastore.put(MARKER_KEY, sealed.into_bytes()).await?;
        info!(
            generation = marker.generation,
            stage = %config.stage,
            hash = %config.hash(),
            "generation marker published"
        );
        Ok(marker)
    }
}

impl std::fmt::Debug for MarkerPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarkerPublisher").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::MemoryDatastore;
    use crate::encryption::KeyMode;

    fn publisher(store: &MemoryDatastore, token: &str) -> MarkerPublisher {
        MarkerPublisher::new(Arc::new(store.clone()), token).unwrap()
    }

    #[tokio::test]
    async fn empty_datastore_has_no_marker() {
        let store = MemoryDatastore::new();
        assert!(publisher(&store, "t").fetch().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn publish_increments_generation() {
        let store = MemoryDatastore::new();
        let p = publisher(&store, "t");
        let cfg = EncryptionConfig::bootstrap(KeyMode::AesCbc);

        assert_eq!(p.publish("s1", &cfg).await.unwrap().generation, 1);
        let second = p.publish("s2", &cfg).await.unwrap();
        assert_eq!(second.generation, 2);

        let fetched = publisher(&store, "t").fetch().await.unwrap().unwrap();
        assert_eq!(fetched, second);
        assert_eq!(fetched.config.hash(), cfg.hash());
    }

    #[tokio::test]
    async fn stored_marker_does_not_expose_key_material() {
        let store = MemoryDatastore::new();
        let cfg = EncryptionConfig::bootstrap(KeyMode::AesCbc);
        publisher(&store, "t").publish("s1", &cfg).await.unwrap();
        let raw = store.get(MARKER_KEY).await.unwrap().unwrap();
        let raw = String::from_utf8(raw).unwrap();
        assert!(!raw.contains(&cfg.keys[0].name));
    }

    #[tokio::test]
    async fn wrong_token_is_config_corrupt() {
        let store = MemoryDatastore::new();
        let cfg = EncryptionConfig::bootstrap(KeyMode::AesCbc);
        publisher(&store, "right").publish("s1", &cfg).await.unwrap();

        let err = publisher(&store, "wrong").fetch().await.unwrap_err();
        assert!(matches!(
            EncryptionError::from(err),
            EncryptionError::ConfigCorrupt(_)
        ));
    }

    #[tokio::test]
    async fn garbage_marker_is_replaced_on_publish() {
        let store = MemoryDatastore::new();
        store.put(MARKER_KEY, b"garbage".to_vec()).await.unwrap();
        let p = publisher(&store, "t");
        assert!(p.fetch().await.is_err());
        let cfg = EncryptionConfig::bootstrap(KeyMode::AesGcm);
        assert_eq!(p.publish("s1", &cfg).await.unwrap().generation, 1);
    }
}
