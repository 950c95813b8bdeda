use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{check_key, Datastore, Record, Result};

/// In-process datastore. Clones share the same map, so several simulated
/// nodes can be handed one instance.
#[derive(Clone, Debug, Default)]
pub struct MemoryDatastore {
    inner: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

#[async_trait]
impl Datastore for MemoryDatastore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        check_key(key)?;
        self.inner.write().await.insert(key.to_owned(), value);
        Ok(())
    }

    async fn put_if(&self, key: &str, expected: &[u8], value: Vec<u8>) -> Result<bool> {
        check_key(key)?;
        let mut map = self.inner.write().await;
        match map.get_mut(key) {
            Some(current) if current.as_slice() == expected => {
                *current = value;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list(
        &self,
        prefix: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Record>> {
        let lower = match start_after {
            Some(after) if after >= prefix => Bound::Excluded(after.to_owned()),
            _ => Bound::Included(prefix.to_owned()),
        };
        let map = self.inner.read().await;
        Ok(map
            .range((lower, Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .take(limit)
            .map(|(k, v)| Record {
                key: k.clone(),
                value: v.clone(),
            })
            .collect())
    }
}
