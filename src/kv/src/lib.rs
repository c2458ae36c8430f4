//! The checkpoint KV backend (§2, §6). Treated as an opaque put/get/delete
//! store namespaced by `f"{controller_name}-{controller_namespace}"`; this
//! crate only defines the trait boundary and ships an in-memory double for
//! tests. No production backend (etcd, Redis, ...) is implemented here.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("transient I/O error talking to the KV store: {0}")]
    TransientIo(String),
}

/// Namespacing per §6: `f"{controller_name}-{controller_namespace}"`.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Namespace(pub String);

impl Namespace {
    pub fn new(controller_name: &str, controller_namespace: &str) -> Self {
        Namespace(format!("{controller_name}-{controller_namespace}"))
    }
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn put(
        &self,
        namespace: &Namespace,
        key: &str,
        value: Vec<u8>,
        overwrite: bool,
    ) -> Result<(), KvError>;

    async fn get(&self, namespace: &Namespace, key: &str) -> Result<Option<Vec<u8>>, KvError>;

    async fn delete(&self, namespace: &Namespace, key: &str) -> Result<(), KvError>;
}

/// An in-memory `KvStore`, used by tests and as the default backend for
/// the monitor/serve binaries when no external store is wired up.
#[derive(Default, Clone)]
pub struct InMemoryKvStore {
    inner: Arc<Mutex<BTreeMap<(String, String), Vec<u8>>>>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn put(
        &self,
        namespace: &Namespace,
        key: &str,
        value: Vec<u8>,
        overwrite: bool,
    ) -> Result<(), KvError> {
        let mut guard = self.inner.lock();
        let map_key = (namespace.0.clone(), key.to_string());
        if !overwrite && guard.contains_key(&map_key) {
            return Ok(());
        }
        guard.insert(map_key, value);
        Ok(())
    }

    async fn get(&self, namespace: &Namespace, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        let guard = self.inner.lock();
        Ok(guard.get(&(namespace.0.clone(), key.to_string())).cloned())
    }

    async fn delete(&self, namespace: &Namespace, key: &str) -> Result<(), KvError> {
        let mut guard = self.inner.lock();
        guard.remove(&(namespace.0.clone(), key.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_delete_round_trip() {
        let store = InMemoryKvStore::new();
        let ns = Namespace::new("serve", "default");
        store.put(&ns, "k", b"v1".to_vec(), true).await.unwrap();
        assert_eq!(store.get(&ns, "k").await.unwrap(), Some(b"v1".to_vec()));
        store.delete(&ns, "k").await.unwrap();
        assert_eq!(store.get(&ns, "k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn put_without_overwrite_keeps_first_value() {
        let store = InMemoryKvStore::new();
        let ns = Namespace::new("serve", "default");
        store.put(&ns, "k", b"v1".to_vec(), true).await.unwrap();
        store.put(&ns, "k", b"v2".to_vec(), false).await.unwrap();
        assert_eq!(store.get(&ns, "k").await.unwrap(), Some(b"v1".to_vec()));
    }

    #[tokio::test]
    async fn namespaces_do_not_collide() {
        let store = InMemoryKvStore::new();
        let a = Namespace::new("ctrl-a", "ns");
        let b = Namespace::new("ctrl-b", "ns");
        store.put(&a, "k", b"a".to_vec(), true).await.unwrap();
        store.put(&b, "k", b"b".to_vec(), true).await.unwrap();
        assert_eq!(store.get(&a, "k").await.unwrap(), Some(b"a".to_vec()));
        assert_eq!(store.get(&b, "k").await.unwrap(), Some(b"b".to_vec()));
    }
}
