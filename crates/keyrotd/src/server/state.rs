//! Shared application state injected into every Axum handler.

use std::sync::Arc;

use crate::rotation::RotationController;
use crate::verifier::{ConsistencyVerifier, LocalNode, NodeHandle};

/// Application state shared across all request handlers.
///
/// Every field is `Arc`-backed or `Copy`-cheap so Axum can clone the state
/// per request.
#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<RotationController>,
    /// This node, as the verifier sees it.
    pub local: Arc<dyn NodeHandle>,
    pub peers: Arc<Vec<Arc<dyn NodeHandle>>>,
    pub verifier: ConsistencyVerifier,
}

impl AppState {
    pub fn new(
        controller: Arc<RotationController>,
        peers: Vec<Arc<dyn NodeHandle>>,
        verifier: ConsistencyVerifier,
    ) -> Self {
        Self {
            local: Arc::new(LocalNode::new(Arc::clone(&controller))),
            controller,
            peers: Arc::new(peers),
            verifier,
        }
    }
}

#[cfg(test)]
impl AppState {
    /// Single unconfigured node over an in-memory datastore. The returned
    /// directory must outlive the state.
    pub(crate) fn for_tests() -> (tempfile::TempDir, Self) {
        use crate::datastore::{Datastore, MemoryDatastore};
        use crate::encryption::{EncryptionConfigStore, KeyMode};
        use crate::marker::MarkerPublisher;
        use crate::reencrypt::ReencryptionEngine;

        let dir = tempfile::tempdir().unwrap();
        let datastore: Arc<dyn Datastore> = Arc::new(MemoryDatastore::new());
        let marker = MarkerPublisher::new(Arc::clone(&datastore), "test-token").unwrap();
        let controller = RotationController::new(
            "server-1",
            EncryptionConfigStore::in_data_dir(dir.path()),
            datastore,
            marker,
            ReencryptionEngine::new("/registry/secrets/"),
            KeyMode::AesCbc,
        );
        let state = Self::new(Arc::new(controller), Vec::new(), ConsistencyVerifier::default());
        (dir, state)
    }
}
