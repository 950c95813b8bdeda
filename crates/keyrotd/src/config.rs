//! Configuration loading and validation for the node daemon.
//!
//! All values are read from environment variables at startup. The process will
//! exit with a clear error message if any required variable is missing or invalid.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::encryption::KeyMode;

/// Validated daemon configuration.
///
/// Deliberately not `Debug`: it carries the cluster token.
#[derive(Clone, Deserialize)]
pub struct Config {
    /// Name this node reports in status output. **Required.**
    pub node_name: String,

    /// Directory holding `cred/encryption-config.json`.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Directory backing the shared datastore, mounted by every node. **Required.**
    pub datastore_dir: PathBuf,

    /// Shared cluster secret; seals the generation marker. **Required.**
    pub cluster_token: String,

    /// Port the HTTP(S) API listens on.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Other control-plane nodes, `name=url` separated by commas.
    #[serde(default)]
    pub peers: String,

    /// Cipher for newly generated keys: `aescbc` or `aesgcm`.
    #[serde(default = "default_encryption_provider")]
    pub encryption_provider: String,

    /// Datastore prefix walked by the re-encryption pass.
    #[serde(default = "default_record_prefix")]
    pub record_prefix: String,

    /// Per-node timeout for status fan-out.
    #[serde(default = "default_status_timeout_ms")]
    pub status_timeout_ms: u64,

    /// PEM certificate chain; with `tls_key_path` switches the API to HTTPS.
    #[serde(default)]
    pub tls_cert_path: Option<String>,

    #[serde(default)]
    pub tls_key_path: Option<String>,

    /// CA bundle used to verify HTTPS peers.
    #[serde(default)]
    pub tls_ca_path: Option<String>,

    /// OTLP endpoint; spans are only exported when set.
    #[serde(default)]
    pub otel_exporter_otlp_endpoint: Option<String>,

    /// Tracing log level (e.g. `"info"`, `"debug"`).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// One `name=url` entry of `PEERS`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSpec {
    pub name: String,
    pub url: String,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/keyrot")
}
fn default_listen_port() -> u16 {
    9345
}
fn default_encryption_provider() -> String {
    "aescbc".into()
}
fn default_record_prefix() -> String {
    "/registry/secrets/".into()
}
fn default_status_timeout_ms() -> u64 {
    5000
}
fn default_log_level() -> String {
    "info".into()
}

impl Config {
    /// Load and validate configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if any required variable is absent or cannot be parsed.
    pub fn from_env() -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::Environment::default())
            .build()
            .context("failed to build configuration from environment")?;

        let c: Config = cfg
            .try_deserialize()
            .context("failed to deserialise configuration")?;

        c.validate()?;
        Ok(c)
    }

    /// Validate all fields, returning a descriptive error on the first failure.
    pub fn validate(&self) -> Result<()> {
        ensure_non_empty(&self.node_name, "NODE_NAME")?;
        ensure_non_empty(&self.cluster_token, "CLUSTER_TOKEN")?;
        if self.datastore_dir.as_os_str().is_empty() {
            anyhow::bail!("DATASTORE_DIR is required and must not be empty");
        }
        self.provider()?;
        self.peer_list()?;

        if self.record_prefix.is_empty() {
            anyhow::bail!("RECORD_PREFIX must not be empty");
        }
        if self.status_timeout_ms == 0 {
            anyhow::bail!("STATUS_TIMEOUT_MS must be > 0");
        }
        if self.tls_cert_path.is_some() != self.tls_key_path.is_some() {
            anyhow::bail!("TLS_CERT_PATH and TLS_KEY_PATH must be set together");
        }
        Ok(())
    }

    pub fn provider(&self) -> Result<KeyMode> {
        KeyMode::provider(&self.encryption_provider).with_context(|| {
            format!(
                "ENCRYPTION_PROVIDER must be aescbc or aesgcm, got {:?}",
                self.encryption_provider
            )
        })
    }

    /// Parse `PEERS`. Blank entries are ignored; names must be unique and
    /// must not repeat `NODE_NAME`.
    pub fn peer_list(&self) -> Result<Vec<PeerSpec>> {
        let mut peers: Vec<PeerSpec> = Vec::new();
        for entry in self.peers.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (name, url) = entry
                .split_once('=')
                .with_context(|| format!("PEERS entry {entry:?} is not name=url"))?;
            let (name, url) = (name.trim(), url.trim());
            if name.is_empty() || url.is_empty() {
                anyhow::bail!("PEERS entry {entry:?} is not name=url");
            }
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                anyhow::bail!("PEERS url for {name} must start with http:// or https://");
            }
            if name == self.node_name || peers.iter().any(|p| p.name == name) {
                anyhow::bail!("PEERS names {name} more than once");
            }
            peers.push(PeerSpec {
                name: name.to_owned(),
                url: url.to_owned(),
            });
        }
        Ok(peers)
    }

    pub fn status_timeout(&self) -> Duration {
        Duration::from_millis(self.status_timeout_ms)
    }

    /// Cert and key paths when HTTPS is configured.
    pub fn tls_paths(&self) -> Option<(&str, &str)> {
        match (&self.tls_cert_path, &self.tls_key_path) {
            (Some(cert), Some(key)) => Some((cert.as_str(), key.as_str())),
            _ => None,
        }
    }
}

fn ensure_non_empty(value: &str, name: &str) -> Result<()> {
    if value.trim().is_empty() {
        anyhow::bail!("{name} is required and must not be empty");
    }
    Ok(())
}
