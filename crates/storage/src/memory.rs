use std::collections::BTreeMap;

use tokio::sync::RwLock;

use super::error::StorageResult;
use super::{BoxFuture, LocalStore, Namespace};

/// Process-local store for ephemeral runs; contents vanish on exit.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<(&'static str, String), String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocalStore for MemoryStore {
    fn get<'a>(
        &'a self,
        namespace: Namespace,
        key: &'a str,
    ) -> BoxFuture<'a, StorageResult<Option<String>>> {
        Box::pin(async move {
            let entries = self.entries.read().await;
            Ok(entries.get(&(namespace.as_str(), key.to_string())).cloned())
        })
    }

    fn put<'a>(
        &'a self,
        namespace: Namespace,
        key: &'a str,
        value: String,
    ) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            let mut entries = self.entries.write().await;
            entries.insert((namespace.as_str(), key.to_string()), value);
            Ok(())
        })
    }

    fn remove<'a>(&'a self, namespace: Namespace, key: &'a str) -> BoxFuture<'a, StorageResult<bool>> {
        Box::pin(async move {
            let mut entries = self.entries.write().await;
            Ok(entries
                .remove(&(namespace.as_str(), key.to_string()))
                .is_some())
        })
    }

    fn keys<'a>(&'a self, namespace: Namespace) -> BoxFuture<'a, StorageResult<Vec<String>>> {
        Box::pin(async move {
            let entries = self.entries.read().await;
            Ok(entries
                .keys()
                .filter(|(entry_namespace, _)| *entry_namespace == namespace.as_str())
                .map(|(_, key)| key.clone())
                .collect())
        })
    }
}
