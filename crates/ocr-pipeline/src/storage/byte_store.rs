//! Keyed byte storage used by the result cache

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::Result;

/// Trait for raw byte storage
///
/// Implementations:
/// - `InMemoryByteStore`: process-local map
#[async_trait]
pub trait ByteStore: Send + Sync {
    /// Store `data` under `key`, replacing any previous value
    ///
    /// Returns the key the data was stored under
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<String>;

    /// Retrieve data, `None` when absent
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Delete data; `false` when the key did not exist
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Every stored key
    async fn keys(&self) -> Result<Vec<String>>;

    /// Stored size in bytes, `None` when absent
    async fn size(&self, key: &str) -> Result<Option<u64>>;

    /// Delete everything, returning how many keys existed
    async fn clear(&self) -> Result<usize>;
}

/// In-memory byte store
#[derive(Debug, Default)]
pub struct InMemoryByteStore {
    entries: DashMap<String, Vec<u8>>,
}

impl InMemoryByteStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl ByteStore for InMemoryByteStore {
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<String> {
        self.entries.insert(key.to_string(), data);
        Ok(key.to_string())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.get(key).map(|e| e.value().clone()))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.entries.iter().map(|e| e.key().clone()).collect())
    }

    async fn size(&self, key: &str) -> Result<Option<u64>> {
        Ok(self.entries.get(key).map(|e| e.value().len() as u64))
    }

    async fn clear(&self) -> Result<usize> {
        let count = self.entries.len();
        self.entries.clear();
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = InMemoryByteStore::new();
        let key = tokio_test::assert_ok!(store.put("a", vec![1, 2, 3]).await);
        assert_eq!(key, "a");
        assert_eq!(store.get("a").await.unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(store.size("a").await.unwrap(), Some(3));

        assert!(store.delete("a").await.unwrap());
        assert!(!store.delete("a").await.unwrap());
        assert!(store.get("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clear_reports_count() {
        let store = InMemoryByteStore::new();
        store.put("a", vec![1]).await.unwrap();
        store.put("b", vec![2]).await.unwrap();

        let mut keys = store.keys().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["a", "b"]);
        assert_eq!(store.clear().await.unwrap(), 2);
        assert!(store.is_empty());
    }
}
