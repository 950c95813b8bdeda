//! [`ReencryptionEngine`]: rewrite every stored record under the primary key.

use common::EncryptionError;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::crypto::KeySet;
use crate::datastore::Datastore;
use crate::encryption::EncryptionConfig;

/// Records fetched per datastore page.
pub const DEFAULT_PAGE_SIZE: usize = 20;

const PROGRESS_EVERY: u64 = 50;

/// Outcome of a completed pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReencryptSummary {
    pub scanned: u64,
    pub rewritten: u64,
    /// Already sealed by the primary key.
    pub skipped: u64,
    /// Replaced by a live writer between listing and rewriting. The live
    /// write already used the primary key, so it is kept.
    pub conflicts: u64,
}

#[derive(Debug, Clone)]
pub struct ReencryptionEngine {
    prefix: String,
    page_size: usize,
}

impl ReencryptionEngine {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Walk every record under the prefix and seal it with the primary key of
    /// `config`.
    ///
    /// Records already sealed by the primary are left alone, so running the
    /// pass twice is harmless. Each record is replaced with a conditional
    /// write against the value that was listed, so a concurrent write from a
    /// live node is never overwritten. An aborted pass leaves every record
    /// readable with `config`'s keys.
    ///
    /// # Errors
    ///
    /// [`EncryptionError::ReencryptionFailure`] if a record cannot be opened
    /// by any key, the datastore fails, or `cancel` fires.
    pub async fn run(
        &self,
        datastore: &dyn Datastore,
        config: &EncryptionConfig,
        cancel: &CancellationToken,
    ) -> Result<ReencryptSummary, EncryptionError> {
        let keys = KeySet::from_config(config);
        let primary = keys
            .primary()
            .map(|k| k.name.clone())
            .ok_or_else(|| failure("configuration has no keys"))?;
        info!(prefix = %self.prefix, primary = %primary, "re-encryption started");

        let mut summary = ReencryptSummary::default();
        let mut cursor: Option<String> = None;

        loop {
            let page = datastore
                .list(&self.prefix, cursor.as_deref(), self.page_size)
                .await
                .map_err(|e| failure(format!("listing {}: {e}", self.prefix)))?;
            let Some(last) = page.last() else { break };
            cursor = Some(last.key.clone());
            let full_page = page.len() == self.page_size;

            for record in page {
                if cancel.is_cancelled() {
                    return Err(failure(format!(
                        "cancelled after {} records",
                        summary.scanned
                    )));
                }
                summary.scanned += 1;

                if keys.sealed_by_primary(&record.value) {
                    summary.skipped += 1;
                } else {
                    let plain = keys
                        .open(&record.value)
                        .map_err(|e| failure(format!("{}: {e}", record.key)))?;
                    let sealed = keys
                        .seal(&plain)
                        .map_err(|e| failure(format!("{}: {e}", record.key)))?;
                    let replaced = datastore
                        .put_if(&record.key, &record.value, sealed)
                        .await
                        .map_err(|e| failure(format!("{}: {e}", record.key)))?;
                    if replaced {
                        summary.rewritten += 1;
                        debug!(key = %record.key, "record re-encrypted");
                    } else {
                        summary.conflicts += 1;
                        debug!(key = %record.key, "record changed concurrently, keeping live write");
                    }
                }

                if summary.scanned % PROGRESS_EVERY == 0 {
                    info!(scanned = summary.scanned, rewritten = summary.rewritten, "re-encryption progress");
                }
            }

            if !full_page {
                break;
            }
        }

        info!(
            scanned = summary.scanned,
            rewritten = summary.rewritten,
            skipped = summary.skipped,
            conflicts = summary.conflicts,
            "re-encryption finished"
        );
        Ok(summary)
    }
}

fn failure(msg: impl Into<String>) -> EncryptionError {
    EncryptionError::ReencryptionFailure(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::cipher;
    use crate::datastore::{MemoryDatastore, Record};
    use async_trait::async_trait;
    use crate::encryption::{Key, KeyMode};
    use common::Stage;

    const PREFIX: &str = "/registry/secrets/";

    fn config(keys: Vec<Key>) -> EncryptionConfig {
        let enabled = !keys[0].is_identity();
        EncryptionConfig {
            keys,
            stage: Stage::ReencryptActive,
            enabled,
        }
    }

    async fn seed(store: &MemoryDatastore, key: &Key, n: usize) {
        for i in 0..n {
            let sealed = cipher::seal(key, format!("secret-{i}").as_bytes()).unwrap();
            store
                .put(&format!("{PREFIX}default/s{i:03}"), sealed)
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn rewrites_legacy_records_under_primary() {
        let store = MemoryDatastore::new();
        let old = Key::generate(KeyMode::AesCbc);
        let new = Key::generate(KeyMode::AesCbc);
        seed(&store, &old, 45).await;
        store.put("/registry/configmaps/x", b"untouched".to_vec()).await.unwrap();

        let cfg = config(vec![new.clone(), old]);
        let engine = ReencryptionEngine::new(PREFIX);
        let summary = engine
            .run(&store, &cfg, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            summary,
            ReencryptSummary {
                scanned: 45,
                rewritten: 45,
                skipped: 0,
                conflicts: 0,
            }
        );

        let only_new = KeySet::from_config(&config(vec![new]));
        for r in store.list(PREFIX, None, 100).await.unwrap() {
            assert!(only_new.sealed_by_primary(&r.value));
            assert!(String::from_utf8(only_new.open(&r.value).unwrap())
                .unwrap()
                .starts_with("secret-"));
        }
        assert_eq!(
            store.get("/registry/configmaps/x").await.unwrap(),
            Some(b"untouched".to_vec())
        );
    }

    #[tokio::test]
    async fn second_run_changes_nothing() {
        let store = MemoryDatastore::new();
        let old = Key::generate(KeyMode::AesGcm);
        let new = Key::generate(KeyMode::AesGcm);
        seed(&store, &old, 7).await;
        let cfg = config(vec![new, old]);
        let engine = ReencryptionEngine::new(PREFIX).with_page_size(3);
        let cancel = CancellationToken::new();

        engine.run(&store, &cfg, &cancel).await.unwrap();
        let before = store.list(PREFIX, None, 100).await.unwrap();
        let again = engine.run(&store, &cfg, &cancel).await.unwrap();
        let after = store.list(PREFIX, None, 100).await.unwrap();

        assert_eq!(again.rewritten, 0);
        assert_eq!(again.skipped, 7);
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn identity_primary_decrypts_to_cleartext() {
        let store = MemoryDatastore::new();
        let real = Key::generate(KeyMode::AesCbc);
        seed(&store, &real, 3).await;
        let cfg = config(vec![Key::identity(), real]);
        ReencryptionEngine::new(PREFIX)
            .run(&store, &cfg, &CancellationToken::new())
            .await
            .unwrap();
        let first = store.get(&format!("{PREFIX}default/s000")).await.unwrap();
        assert_eq!(first, Some(b"secret-0".to_vec()));
    }

    #[tokio::test]
    async fn unknown_key_aborts() {
        let store = MemoryDatastore::new();
        seed(&store, &Key::generate(KeyMode::AesCbc), 2).await;
        let cfg = config(vec![Key::generate(KeyMode::AesCbc)]);
        let err = ReencryptionEngine::new(PREFIX)
            .run(&store, &cfg, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EncryptionError::ReencryptionFailure(_)));
    }

    #[tokio::test]
    async fn cancelled_pass_fails_without_rewriting() {
        let store = MemoryDatastore::new();
        let old = Key::generate(KeyMode::AesCbc);
        seed(&store, &old, 5).await;
        let before = store.list(PREFIX, None, 100).await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let cfg = config(vec![Key::generate(KeyMode::AesCbc), old]);
        let err = ReencryptionEngine::new(PREFIX)
            .run(&store, &cfg, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, EncryptionError::ReencryptionFailure(_)));
        assert_eq!(store.list(PREFIX, None, 100).await.unwrap(), before);
    }

    /// Hands out each page, then lets a live node overwrite one of the
    /// listed records before the pass gets to it.
    struct RacingDatastore {
        inner: MemoryDatastore,
        key: String,
        live_value: Vec<u8>,
    }

    #[async_trait]
    impl Datastore for RacingDatastore {
        async fn get(&self, key: &str) -> crate::datastore::Result<Option<Vec<u8>>> {
            self.inner.get(key).await
        }

        async fn put(&self, key: &str, value: Vec<u8>) -> crate::datastore::Result<()> {
            self.inner.put(key, value).await
        }

        async fn put_if(
            &self,
            key: &str,
            expected: &[u8],
            value: Vec<u8>,
        ) -> crate::datastore::Result<bool> {
            self.inner.put_if(key, expected, value).await
        }

        async fn list(
            &self,
            prefix: &str,
            start_after: Option<&str>,
            limit: usize,
        ) -> crate::datastore::Result<Vec<Record>> {
            let page = self.inner.list(prefix, start_after, limit).await?;
            if page.iter().any(|r| r.key == self.key) {
                self.inner.put(&self.key, self.live_value.clone()).await?;
            }
            Ok(page)
        }
    }

    #[tokio::test]
    async fn concurrent_write_is_not_overwritten() {
        let old = Key::generate(KeyMode::AesCbc);
        let new = Key::generate(KeyMode::AesCbc);
        let inner = MemoryDatastore::new();
        seed(&inner, &old, 3).await;
        let raced = format!("{PREFIX}default/s001");
        let live_value = cipher::seal(&new, b"written-during-pass").unwrap();
        let store = RacingDatastore {
            inner: inner.clone(),
            key: raced.clone(),
            live_value: live_value.clone(),
        };

        let cfg = config(vec![new.clone(), old]);
        let summary = ReencryptionEngine::new(PREFIX)
            .run(&store, &cfg, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.scanned, 3);
        assert_eq!(summary.rewritten, 2);
        assert_eq!(summary.conflicts, 1);

        assert_eq!(inner.get(&raced).await.unwrap(), Some(live_value));
        let keys = KeySet::from_config(&cfg);
        let value = keys.open(&inner.get(&raced).await.unwrap().unwrap()).unwrap();
        assert_eq!(value, b"written-during-pass");
    }

    #[tokio::test]
    async fn empty_prefix_is_a_no_op() {
        let store = MemoryDatastore::new();
        let cfg = config(vec![Key::generate(KeyMode::AesCbc)]);
        let summary = ReencryptionEngine::new(PREFIX)
            .run(&store, &cfg, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary, ReencryptSummary::default());
    }
}
