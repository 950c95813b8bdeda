//! [`RotationController`]: validates and executes stage transitions on one node.

use std::sync::Arc;

use common::protocol::NodeState;
use common::{EncryptionError, Stage};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::datastore::Datastore;
use crate::encryption::{EncryptionConfig, EncryptionConfigStore, Key, KeyMode, Keyring};
use crate::marker::MarkerPublisher;
use crate::reencrypt::ReencryptionEngine;

/// Flags accepted by `reencrypt`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReencryptOptions {
    /// Bypass the stage-ordering precondition.
    pub force: bool,
    /// Advance to `reencrypt_finished` without touching records or keys.
    pub skip: bool,
}

/// Per-node transition executor.
///
/// Every public transition takes the node's transition lock, reads the
/// configuration from disk, validates, and commits. Nothing is cached between
/// calls, so a failed save never leaves a stale in-memory view behind.
pub struct RotationController {
    node_id: String,
    store: EncryptionConfigStore,
    datastore: Arc<dyn Datastore>,
    marker: MarkerPublisher,
    engine: ReencryptionEngine,
    keyring: Keyring,
    provider: KeyMode,
    lock: Arc<Mutex<()>>,
    cancel: CancellationToken,
}

impl RotationController {
    pub fn new(
        node_id: impl Into<String>,
        store: EncryptionConfigStore,
        datastore: Arc<dyn Datastore>,
        marker: MarkerPublisher,
        engine: ReencryptionEngine,
        provider: KeyMode,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            store,
            datastore,
            marker,
            engine,
            keyring: Keyring::new(),
            provider,
            lock: Arc::new(Mutex::new(())),
            cancel: CancellationToken::new(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn keyring(&self) -> &Keyring {
        &self.keyring
    }

    /// Token that aborts a running re-encryption pass.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    // -----------------------------------------------------------------------
    // Startup and convergence
    // -----------------------------------------------------------------------

    /// Make sure this node has a configuration, then load it.
    ///
    /// A node without a local file adopts the published marker if there is
    /// one; the very first node generates a key and publishes generation 1.
    pub async fn bootstrap(&self) -> Result<NodeState, EncryptionError> {
        let _guard = self.lock.lock().await;
        match self.store.load().await {
            Ok(_) => {}
            Err(EncryptionError::ConfigMissing(_)) => match self.marker.fetch().await? {
                Some(marker) => {
                    self.store.save(&marker.config).await?;
                    info!(
                        generation = marker.generation,
                        origin = %marker.origin,
                        "encryption config adopted from generation marker"
                    );
                }
                None => {
                    let cfg = EncryptionConfig::bootstrap(self.provider);
                    self.commit(None, &cfg).await?;
                    info!(provider = self.provider.as_str(), "encryption config bootstrapped");
                }
            },
            Err(e) => return Err(e),
        }
        self.reload_locked().await?;
        self.local_state().await
    }

    /// Converge on the published marker and refresh the keyring.
    ///
    /// Stands in for a server restart. Returns whether a different
    /// configuration was adopted.
    pub async fn reload(&self) -> Result<bool, EncryptionError> {
        let _guard = self.lock.lock().await;
        self.reload_locked().await
    }

    async fn reload_locked(&self) -> Result<bool, EncryptionError> {
        let local = self.store.load().await?;
        let adopted = match self.marker.fetch().await? {
            Some(marker) if marker.config.hash() != local.hash() => {
                self.store.save(&marker.config).await?;
                info!(
                    generation = marker.generation,
                    origin = %marker.origin,
                    stage = %marker.config.stage,
                    "adopted newer encryption config"
                );
                self.keyring.install(&marker.config);
                true
            }
            _ => {
                self.keyring.install(&local);
                false
            }
        };
        Ok(adopted)
    }

    /// This node's stage, flag and hash, read from disk.
    pub async fn local_state(&self) -> Result<NodeState, EncryptionError> {
        Ok(self.store.load().await?.node_state(&self.node_id))
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    /// Generate a new key and stage it as a decrypt-only secondary.
    pub async fn prepare(&self, force: bool) -> Result<NodeState, EncryptionError> {
        let _guard = self.lock.lock().await;
        self.prepare_locked(force).await
    }

    /// Promote the prepared key to primary.
    pub async fn rotate(&self, force: bool) -> Result<NodeState, EncryptionError> {
        let _guard = self.lock.lock().await;
        self.rotate_locked(force).await
    }

    /// Re-encrypt every record under the primary key and retire legacy keys.
    pub async fn reencrypt(&self, opts: ReencryptOptions) -> Result<NodeState, EncryptionError> {
        let _guard = self.lock.lock().await;
        let active = self.begin_reencrypt(opts).await?;
        self.finish_reencrypt(active, opts).await
    }

    /// Validate and persist `reencrypt_active`, then finish the pass on a
    /// background task that keeps the transition lock until it is done.
    pub async fn start_reencrypt(
        self: &Arc<Self>,
        opts: ReencryptOptions,
    ) -> Result<(NodeState, JoinHandle<Result<NodeState, EncryptionError>>), EncryptionError> {
        let guard: OwnedMutexGuard<()> = Arc::clone(&self.lock).lock_owned().await;
        let active = self.begin_reencrypt(opts).await?;
        let state = active.node_state(&self.node_id);

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let _guard = guard;
            let result = this.finish_reencrypt(active, opts).await;
            if let Err(e) = &result {
                error!(error = %e, "background re-encryption failed");
            }
            result
        });
        Ok((state, handle))
    }

    /// `prepare`, `rotate` and `reencrypt` in one call, each stage committed.
    pub async fn rotate_keys(&self) -> Result<NodeState, EncryptionError> {
        let _guard = self.lock.lock().await;
        self.prepare_locked(false).await?;
        self.rotate_locked(false).await?;
        let opts = ReencryptOptions::default();
        let active = self.begin_reencrypt(opts).await?;
        self.finish_reencrypt(active, opts).await
    }

    /// Make identity the primary so new writes are stored in cleartext.
    ///
    /// Real keys stay as legacy readers. A no-op when already disabled.
    pub async fn disable(&self) -> Result<NodeState, EncryptionError> {
        let _guard = self.lock.lock().await;
        let cfg = self.store.load().await?;
        if !cfg.enabled {
            info!("secrets encryption already disabled");
            return Ok(cfg.node_state(&self.node_id));
        }
        require_stage(&cfg, &[Stage::ReencryptFinished], "disable")?;

        let mut next = cfg.clone();
        next.keys.retain(|k| !k.is_identity());
        next.keys.insert(0, Key::identity());
        next.enabled = false;
        self.commit(Some(&cfg), &next).await?;
        info!("secrets encryption disabled");
        Ok(next.node_state(&self.node_id))
    }

    /// Put a real key back in front. Identity stays behind it so records
    /// written while disabled remain readable. A no-op when already enabled.
    pub async fn enable(&self) -> Result<NodeState, EncryptionError> {
        let _guard = self.lock.lock().await;
        let cfg = self.store.load().await?;
        if cfg.enabled {
            info!("secrets encryption already enabled");
            return Ok(cfg.node_state(&self.node_id));
        }
        require_stage(&cfg, &[Stage::ReencryptFinished], "enable")?;

        let mut next = cfg.clone();
        let key = match next.keys.iter().position(|k| !k.is_identity()) {
            Some(idx) => next.keys.remove(idx),
            None => Key::generate(self.provider),
        };
        next.keys.insert(0, key);
        next.enabled = true;
        self.commit(Some(&cfg), &next).await?;
        info!("secrets encryption enabled");
        Ok(next.node_state(&self.node_id))
    }

    // -----------------------------------------------------------------------
    // Record access through the keyring
    // -----------------------------------------------------------------------

    /// Read and open one record with the loaded keys.
    pub async fn read_record(&self, key: &str) -> Result<Option<Vec<u8>>, EncryptionError> {
        match self.datastore.get(key).await? {
            Some(raw) => Ok(Some(self.keyring.open(&raw)?)),
            None => Ok(None),
        }
    }

    /// Seal `plaintext` with the loaded primary key and store it.
    pub async fn write_record(&self, key: &str, plaintext: &[u8]) -> Result<(), EncryptionError> {
        let sealed = self.keyring.seal(plaintext)?;
        self.datastore.put(key, sealed).await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Internals (caller holds the transition lock)
    // -----------------------------------------------------------------------

    async fn prepare_locked(&self, force: bool) -> Result<NodeState, EncryptionError> {
        let cfg = self.store.load().await?;
        require_enabled(&cfg, "prepare")?;
        if !force && !cfg.stage.accepts_new_cycle() {
            return Err(illegal("prepare", cfg.stage));
        }

        let mut next = cfg.clone();
        let key = Key::generate(self.provider);
        info!(key = %key.name, "prepared new encryption key");
        next.insert_secondary(key);
        next.stage = Stage::Prepare;
        self.commit(Some(&cfg), &next).await?;
        Ok(next.node_state(&self.node_id))
    }

    async fn rotate_locked(&self, force: bool) -> Result<NodeState, EncryptionError> {
        let cfg = self.store.load().await?;
        require_enabled(&cfg, "rotate")?;
        if !force {
            require_stage(&cfg, &[Stage::Prepare], "rotate")?;
        }
        match cfg.keys.get(1) {
            None => {
                return Err(EncryptionError::IllegalTransition(
                    "rotate needs a prepared secondary key".into(),
                ));
            }
            Some(k) if k.is_identity() => {
                return Err(EncryptionError::IllegalTransition(
                    "rotate cannot promote the identity key".into(),
                ));
            }
            Some(_) => {}
        }

        let mut next = cfg.clone();
        next.swap_primary();
        next.stage = Stage::Rotate;
        self.commit(Some(&cfg), &next).await?;
        info!(primary = %next.keys[0].name, "encryption keys rotated");
        Ok(next.node_state(&self.node_id))
    }

    /// Validate and move to `reencrypt_active`. Resuming from
    /// `reencrypt_active` does not publish a new generation.
    async fn begin_reencrypt(
        &self,
        opts: ReencryptOptions,
    ) -> Result<EncryptionConfig, EncryptionError> {
        let cfg = self.store.load().await?;
        if !opts.force {
            require_stage(&cfg, &[Stage::Rotate, Stage::ReencryptActive], "reencrypt")?;
        }
        if cfg.stage == Stage::ReencryptActive {
            warn!("resuming interrupted re-encryption");
            return Ok(cfg);
        }
        let mut next = cfg.clone();
        next.stage = Stage::ReencryptActive;
        self.commit(Some(&cfg), &next).await?;
        Ok(next)
    }

    async fn finish_reencrypt(
        &self,
        active: EncryptionConfig,
        opts: ReencryptOptions,
    ) -> Result<NodeState, EncryptionError> {
        let mut next = active.clone();
        if opts.skip {
            info!("re-encryption skipped, legacy keys retained");
        } else {
            self.engine
                .run(self.datastore.as_ref(), &active, &self.cancel)
                .await?;
            next.retain_primary();
        }
        next.stage = Stage::ReencryptFinished;
        self.commit(Some(&active), &next).await?;
        Ok(next.node_state(&self.node_id))
    }

    /// Save `next` locally, then publish it. If publishing fails the local
    /// file goes back to `previous` (or away, on first bootstrap).
    async fn commit(
        &self,
        previous: Option<&EncryptionConfig>,
        next: &EncryptionConfig,
    ) -> Result<(), EncryptionError> {
        self.store.save(next).await?;
        if let Err(e) = self.marker.publish(&self.node_id, next).await {
            let restored = match previous {
                Some(prev) => self.store.save(prev).await,
                None => self.store.discard().await,
            };
            if let Err(re) = restored {
                error!(error = %re, "failed to restore encryption config after publish failure");
            }
            return Err(EncryptionError::PersistenceFailure(format!(
                "publishing generation marker: {e}"
            )));
        }
        info!(stage = %next.stage, enabled = next.enabled, hash = %next.hash(), "encryption config committed");
        Ok(())
    }
}

impl std::fmt::Debug for RotationController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RotationController")
            .field("node_id", &self.node_id)
            .field("store", &self.store)
            .field("provider", &self.provider)
            .finish_non_exhaustive()
    }
}

fn illegal(op: &str, stage: Stage) -> EncryptionError {
    EncryptionError::IllegalTransition(format!("cannot {op} from stage {stage}"))
}

fn require_stage(cfg: &EncryptionConfig, allowed: &[Stage], op: &str) -> Result<(), EncryptionError> {
    if allowed.contains(&cfg.stage) {
        Ok(())
    } else {
        Err(illegal(op, cfg.stage))
    }
}

fn require_enabled(cfg: &EncryptionConfig, op: &str) -> Result<(), EncryptionError> {
    if cfg.enabled {
        Ok(())
    } else {
        Err(EncryptionError::IllegalTransition(format!(
            "cannot {op} while secrets encryption is disabled"
        )))
    }
}
