//! `keyrotd`: secrets-encryption key rotation for control-plane nodes.
//!
//! Each node keeps its encryption configuration in a local file and
//! converges with its peers through a sealed generation marker in the shared
//! datastore. No node coordinates another.
//!
//! - [`encryption`]: configuration model, file store, keyring.
//! - [`crypto`]: record envelopes and marker sealing.
//! - [`datastore`]: shared key-value store.
//! - [`marker`]: generation marker publish / fetch.
//! - [`rotation`]: stage transitions.
//! - [`reencrypt`]: the re-encryption pass.
//! - [`verifier`]: cluster status fan-out.
//! - [`server`]: node HTTP API.

pub mod config;
pub mod crypto;
pub mod datastore;
pub mod encryption;
pub mod marker;
pub mod reencrypt;
pub mod rotation;
pub mod server;
pub mod telemetry;
pub mod verifier;
