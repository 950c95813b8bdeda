//! [`EncryptionConfigStore`]: sole owner of the node's local configuration file.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use common::EncryptionError;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::model::EncryptionConfig;

/// File name of the per-node configuration, under `<data_dir>/cred/`.
pub const CONFIG_FILE_NAME: &str = "encryption-config.json";

/// Reads and atomically replaces the local encryption configuration file.
///
/// The file holds raw key material and is always written with mode `0600`.
#[derive(Debug, Clone)]
pub struct EncryptionConfigStore {
    path: PathBuf,
}

impl EncryptionConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store rooted at `<data_dir>/cred/encryption-config.json`.
    pub fn in_data_dir(data_dir: impl AsRef<Path>) -> Self {
        Self::new(data_dir.as_ref().join("cred").join(CONFIG_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load and validate the configuration.
    ///
    /// # Errors
    ///
    /// - [`EncryptionError::ConfigMissing`] if the file does not exist.
    /// - [`EncryptionError::ConfigCorrupt`] if it is empty, unparsable, or
    ///   violates a configuration invariant.
    /// - [`EncryptionError::PersistenceFailure`] on any other read error.
    pub async fn load(&self) -> Result<EncryptionConfig, EncryptionError> {
        let bytes = match fs::read(&self.path).await {
            Ok(b) => b,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(EncryptionError::ConfigMissing(self.path.display().to_string()));
            }
            Err(e) => {
                return Err(EncryptionError::PersistenceFailure(format!(
                    "failed to read {}: {e}",
                    self.path.display()
                )));
            }
        };

        let cfg: EncryptionConfig = serde_json::from_slice(&bytes).map_err(|e| {
            EncryptionError::ConfigCorrupt(format!("{}: {e}", self.path.display()))
        })?;
        cfg.validate().map_err(|e| {
            EncryptionError::ConfigCorrupt(format!("{}: {e}", self.path.display()))
        })?;
        Ok(cfg)
    }

    /// Persist `cfg` with write-to-temp, fsync, rename.
    ///
    /// A concurrent [`Self::load`] observes either the previous file or the
    /// new one, never a partial write.
    ///
    /// # Errors
    ///
    /// Returns [`EncryptionError::PersistenceFailure`] if any step fails; the
    /// previous file is left in place.
    pub async fn save(&self, cfg: &EncryptionConfig) -> Result<(), EncryptionError> {
        cfg.validate()
            .map_err(|e| EncryptionError::PersistenceFailure(format!("refusing to save: {e}")))?;
        let bytes = cfg
            .canonical_bytes()
            .map_err(|e| EncryptionError::PersistenceFailure(e.to_string()))?;
        self.write_atomic(&bytes).await.map_err(|e| {
            EncryptionError::PersistenceFailure(format!(
                "failed to write {}: {e}",
                self.path.display()
            ))
        })?;
        debug!(path = %self.path.display(), stage = %cfg.stage, "encryption config saved");
        Ok(())
    }

    /// Digest of the configuration currently on disk.
    pub async fn hash(&self) -> Result<String, EncryptionError> {
        self.load().await.map(|cfg| cfg.hash())
    }

    /// Remove the file. Only used to undo a first save that the cluster
    /// never saw; a missing file is not an error.
    pub async fn discard(&self) -> Result<(), EncryptionError> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EncryptionError::PersistenceFailure(format!(
                "failed to remove {}: {e}",
                self.path.display()
            ))),
        }
    }

    async fn write_atomic(&self, bytes: &[u8]) -> std::io::Result<()> {
        if let Some(dir) = self.path.parent() {
            create_private_dir(dir).await?;
        }
        let tmp = self.path.with_extension("json.tmp");

        let mut opts = OpenOptions::new();
        opts.write(true).create(true).truncate(true);
        #[cfg(unix)]
        opts.mode(0o600);
        let mut file = opts.open(&tmp).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(std::fs::Permissions::from_mode(0o600))
                .await?;
        }
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&tmp, &self.path).await
    }
}

async fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    if dir.as_os_str().is_empty() || fs::try_exists(dir).await? {
        return Ok(());
    }
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(0o700);
    builder.create(dir).await
}
