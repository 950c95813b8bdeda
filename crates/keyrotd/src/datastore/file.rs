//! [`DirDatastore`]: one file per key in a directory shared by every node.
//!
//! Keys are encoded with unpadded base64url so any key maps to a flat, valid
//! file name. Writes go to a hidden temp file and are renamed into place.
//! Every write to a key holds that key's hidden lock file, created
//! exclusively, so a conditional write on one node cannot interleave with a
//! write from another.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::warn;
use uuid::Uuid;

use super::{check_key, Datastore, DatastoreError, Record, Result};

const LOCK_RETRY: Duration = Duration::from_millis(10);
const LOCK_ATTEMPTS: u32 = 500;
/// A lock file older than this was left by a crashed writer.
const LOCK_STALE: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct DirDatastore {
    root: PathBuf,
}

impl DirDatastore {
    /// Open (creating if needed) the datastore directory.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await.map_err(|source| DatastoreError::Io {
            key: root.display().to_string(),
            source,
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(URL_SAFE_NO_PAD.encode(key.as_bytes()))
    }

    fn lock_path_for(&self, key: &str) -> PathBuf {
        self.root
            .join(format!(".{}.lock", URL_SAFE_NO_PAD.encode(key.as_bytes())))
    }

    async fn lock(&self, key: &str) -> Result<KeyLock> {
        let path = self.lock_path_for(key);
        for _ in 0..LOCK_ATTEMPTS {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(_) => return Ok(KeyLock { path }),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if lock_is_stale(&path).await {
                        warn!(key, "breaking stale datastore lock");
                        let _ = fs::remove_file(&path).await;
                        continue;
                    }
                    tokio::time::sleep(LOCK_RETRY).await;
                }
                Err(e) => return Err(io_err(key)(e)),
            }
        }
        Err(io_err(key)(std::io::Error::new(
            ErrorKind::TimedOut,
            "record lock held by another writer",
        )))
    }

    /// Temp-then-rename write. Caller holds the key's lock.
    async fn write_locked(&self, key: &str, value: &[u8]) -> Result<()> {
        let target = self.path_for(key);
        let tmp = self.root.join(format!(".{}.tmp", Uuid::new_v4().simple()));

        let mut file = fs::File::create(&tmp).await.map_err(io_err(key))?;
        file.write_all(value).await.map_err(io_err(key))?;
        file.sync_all().await.map_err(io_err(key))?;
        drop(file);

        if let Err(e) = fs::rename(&tmp, &target).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(io_err(key)(e));
        }
        Ok(())
    }
}

/// Held exclusive lock on one key. Released explicitly; a lock leaked by a
/// crash is broken once it turns stale.
struct KeyLock {
    path: PathBuf,
}

impl KeyLock {
    async fn release(self) {
        if let Err(e) = fs::remove_file(&self.path).await {
            warn!(path = %self.path.display(), error = %e, "failed to release datastore lock");
        }
    }
}

async fn lock_is_stale(path: &Path) -> bool {
    fs::metadata(path)
        .await
        .ok()
        .and_then(|m| m.modified().ok())
        .and_then(|t| t.elapsed().ok())
        .is_some_and(|age| age > LOCK_STALE)
}

fn io_err(key: &str) -> impl FnOnce(std::io::Error) -> DatastoreError + '_ {
    move |source| DatastoreError::Io {
        key: key.to_owned(),
        source,
    }
}

/// Decode a directory entry back into its key. Temp files and foreign
/// names yield `None`.
fn decode_name(name: &str) -> Option<String> {
    if name.starts_with('.') {
        return None;
    }
    let bytes = URL_SAFE_NO_PAD.decode(name.as_bytes()).ok()?;
    String::from_utf8(bytes).ok()
}

#[async_trait]
impl Datastore for DirDatastore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        check_key(key)?;
        match fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_err(key)(e)),
        }
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        check_key(key)?;
        let lock = self.lock(key).await?;
        let result = self.write_locked(key, &value).await;
        lock.release().await;
        result
    }

    async fn put_if(&self, key: &str, expected: &[u8], value: Vec<u8>) -> Result<bool> {
        check_key(key)?;
        let lock = self.lock(key).await?;
        let result = match self.get(key).await {
            Ok(Some(current)) if current == expected => {
                self.write_locked(key, &value).await.map(|()| true)
            }
            Ok(_) => Ok(false),
            Err(e) => Err(e),
        };
        lock.release().await;
        result
    }

    async fn list(
        &self,
        prefix: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Record>> {
        let mut entries = fs::read_dir(&self.root).await.map_err(io_err(prefix))?;
        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_err(prefix))? {
            let Some(key) = entry.file_name().to_str().and_then(decode_name) else {
                continue;
            };
            if key.starts_with(prefix) && start_after.map_or(true, |after| key.as_str() > after)
            {
                keys.push(key);
            }
        }
        keys.sort();
        keys.truncate(limit);

        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            // A concurrent writer may have replaced the file, never removed it.
            if let Some(value) = self.get(&key).await? {
                records.push(Record { key, value });
            }
        }
        Ok(records)
    }
}
