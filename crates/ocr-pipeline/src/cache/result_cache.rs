//! Result caching keyed by a hash of the submitted document
//!
//! Records are serialized to JSON and kept in a [`ByteStore`] under
//! `ocr-result:<hex hash>`. Expiry is lazy: an expired record reads as a miss
//! but stays in the store until [`ResultCache::cleanup_expired`] runs.
//!
//! Every operation that writes to the store, including the access-count
//! bump on a hit, runs under one async mutex.

use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

use crate::cancellation;
use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::providers::ContentHasher;
use crate::storage::ByteStore;

const KEY_PREFIX: &str = "ocr-result:";

/// A cached recognition result with bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResult {
    /// Hex content hash
    pub cache_key: String,
    pub result: serde_json::Value,
    /// Taken from the payload's `documentType`/`document_type` field
    pub document_type: Option<String>,
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub access_count: u64,
    /// Serialized size of `result`
    pub size_bytes: u64,
}

impl CachedResult {
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// Cache statistics
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatistics {
    pub entries: usize,
    pub total_size_bytes: u64,
    pub average_size_bytes: f64,
    pub hits: u64,
    pub misses: u64,
    /// Percentage; 0 when there have been no lookups
    pub hit_rate: f64,
}

impl CacheStatistics {
    fn hit_rate(hits: u64, misses: u64) -> f64 {
        let lookups = hits + misses;
        if lookups == 0 {
            0.0
        } else {
            hits as f64 / lookups as f64 * 100.0
        }
    }
}

/// Content-addressed OCR result cache
pub struct ResultCache {
    store: Arc<dyn ByteStore>,
    hasher: Arc<dyn ContentHasher>,
    default_ttl_minutes: u32,
    hits: AtomicU64,
    misses: AtomicU64,
    writes: Mutex<()>,
}

impl ResultCache {
    /// Create a cache over the given store and hash function
    pub fn new(store: Arc<dyn ByteStore>, hasher: Arc<dyn ContentHasher>, config: &CacheConfig) -> Self {
        Self {
            store,
            hasher,
            default_ttl_minutes: config.default_ttl_minutes,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            writes: Mutex::new(()),
        }
    }

    async fn lock(&self, cancel: &CancellationToken) -> Result<MutexGuard<'_, ()>> {
        cancellation::run_cancellable(cancel, self.writes.lock()).await
    }

    fn storage_key(hash: &str) -> String {
        format!("{}{}", KEY_PREFIX, hash)
    }

    fn content_hash(&self, content: &[u8]) -> Result<String> {
        if content.is_empty() {
            return Err(Error::invalid_argument("Content cannot be empty"));
        }
        Ok(self.hasher.hash_hex(content))
    }

    /// Hash over content plus processing configuration
    fn composite_hash(&self, content: &[u8], config: &[u8]) -> Result<String> {
        if content.is_empty() {
            return Err(Error::invalid_argument("Content cannot be empty"));
        }
        let mut combined = Vec::with_capacity(content.len() + config.len() + 1);
        combined.extend_from_slice(content);
        combined.push(0);
        combined.extend_from_slice(config);
        Ok(self.hasher.hash_hex(&combined))
    }

    fn document_type_of(result: &serde_json::Value) -> Option<String> {
        ["documentType", "document_type"]
            .iter()
            .find_map(|field| result.get(*field).and_then(|v| v.as_str()))
            .map(str::to_string)
    }

    /// Cache `result` for `content`; `ttl_minutes` falls back to the configured default
    ///
    /// Returns the content hash the result is addressed by
    pub async fn store(
        &self,
        content: &[u8],
        result: serde_json::Value,
        ttl_minutes: Option<u32>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let hash = self.content_hash(content)?;
        self.store_under(hash, result, ttl_minutes, cancel).await
    }

    /// Like [`store`](Self::store), keyed by content and configuration together
    pub async fn store_with_config(
        &self,
        content: &[u8],
        config: &[u8],
        result: serde_json::Value,
        ttl_minutes: Option<u32>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let hash = self.composite_hash(content, config)?;
        self.store_under(hash, result, ttl_minutes, cancel).await
    }

    async fn store_under(
        &self,
        hash: String,
        result: serde_json::Value,
        ttl_minutes: Option<u32>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        if result.is_null() {
            return Err(Error::invalid_argument("Result cannot be null"));
        }
        cancellation::check(cancel)?;

        let ttl = ttl_minutes.unwrap_or(self.default_ttl_minutes);
        let cached_at = Utc::now();
        let size_bytes = serde_json::to_vec(&result)?.len() as u64;
        let record = CachedResult {
            cache_key: hash.clone(),
            document_type: Self::document_type_of(&result),
            result,
            cached_at,
            expires_at: cached_at + Duration::minutes(i64::from(ttl)),
            access_count: 0,
            size_bytes,
        };

        let bytes = serde_json::to_vec(&record)?;
        let _writes = self.lock(cancel).await?;
        cancellation::run_cancellable(cancel, self.store.put(&Self::storage_key(&hash), bytes)).await??;
        tracing::debug!("Cached OCR result {} (ttl {}m)", &hash[..hash.len().min(12)], ttl);
        Ok(hash)
    }

    /// Cached result for `content`, or `None` on a miss or an expired record
    pub async fn get(&self, content: &[u8], cancel: &CancellationToken) -> Result<Option<CachedResult>> {
        let hash = self.content_hash(content)?;
        self.get_under(&hash, cancel).await
    }

    /// Lookup counterpart of [`store_with_config`](Self::store_with_config)
    pub async fn get_with_config(
        &self,
        content: &[u8],
        config: &[u8],
        cancel: &CancellationToken,
    ) -> Result<Option<CachedResult>> {
        let hash = self.composite_hash(content, config)?;
        self.get_under(&hash, cancel).await
    }

    async fn get_under(&self, hash: &str, cancel: &CancellationToken) -> Result<Option<CachedResult>> {
        cancellation::check(cancel)?;
        let key = Self::storage_key(hash);
        let short = &hash[..hash.len().min(12)];
        let _writes = self.lock(cancel).await?;

        let Some(bytes) = cancellation::run_cancellable(cancel, self.store.get(&key)).await?? else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("Cache miss: {}", short);
            return Ok(None);
        };

        let mut record: CachedResult = serde_json::from_slice(&bytes)?;
        if record.is_expired() {
            self.misses.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("Cache miss (expired): {}", short);
            return Ok(None);
        }

        record.access_count += 1;
        let updated = serde_json::to_vec(&record)?;
        cancellation::run_cancellable(cancel, self.store.put(&key, updated)).await??;

        self.hits.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Cache hit: {} (accesses: {})", short, record.access_count);
        Ok(Some(record))
    }

    async fn cache_keys(&self, cancel: &CancellationToken) -> Result<Vec<String>> {
        Ok(cancellation::run_cancellable(cancel, self.store.keys())
            .await??
            .into_iter()
            .filter(|k| k.starts_with(KEY_PREFIX))
            .collect())
    }

    async fn load(&self, key: &str, cancel: &CancellationToken) -> Result<Option<CachedResult>> {
        let Some(bytes) = cancellation::run_cancellable(cancel, self.store.get(key)).await?? else {
            return Ok(None);
        };
        match serde_json::from_slice(&bytes) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                tracing::warn!("Skipping unreadable cache record {}: {}", key, e);
                Ok(None)
            }
        }
    }

    /// Remove every record whose document type matches (case-insensitive)
    pub async fn invalidate_by_type(&self, document_type: &str, cancel: &CancellationToken) -> Result<usize> {
        let _writes = self.lock(cancel).await?;
        let mut removed = 0;
        for key in self.cache_keys(cancel).await? {
            let Some(record) = self.load(&key, cancel).await? else {
                continue;
            };
            let matches = record
                .document_type
                .as_deref()
                .is_some_and(|t| t.eq_ignore_ascii_case(document_type));
            if matches && cancellation::run_cancellable(cancel, self.store.delete(&key)).await?? {
                removed += 1;
            }
        }

        if removed > 0 {
            tracing::info!("Invalidated {} cached results of type {}", removed, document_type);
        }
        Ok(removed)
    }

    /// Remove every expired record
    pub async fn cleanup_expired(&self, cancel: &CancellationToken) -> Result<usize> {
        let _writes = self.lock(cancel).await?;
        let mut removed = 0;
        for key in self.cache_keys(cancel).await? {
            let Some(record) = self.load(&key, cancel).await? else {
                continue;
            };
            if record.is_expired() && cancellation::run_cancellable(cancel, self.store.delete(&key)).await?? {
                removed += 1;
            }
        }

        if removed > 0 {
            tracing::info!("Removed {} expired cached results", removed);
        }
        Ok(removed)
    }

    /// Remove everything from the backing store
    pub async fn clear_all(&self, cancel: &CancellationToken) -> Result<usize> {
        let _writes = self.lock(cancel).await?;
        let removed = cancellation::run_cancellable(cancel, self.store.clear()).await??;
        tracing::info!("Result cache cleared ({} entries)", removed);
        Ok(removed)
    }

    /// Entry, size and hit/miss statistics
    pub async fn statistics(&self, cancel: &CancellationToken) -> Result<CacheStatistics> {
        let keys = self.cache_keys(cancel).await?;
        let sizes =
            cancellation::run_cancellable(cancel, join_all(keys.iter().map(|key| self.store.size(key)))).await?;
        let mut total_size_bytes = 0;
        for size in sizes {
            total_size_bytes += size?.unwrap_or(0);
        }

        let entries = keys.len();
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        Ok(CacheStatistics {
            entries,
            total_size_bytes,
            average_size_bytes: if entries == 0 {
                0.0
            } else {
                total_size_bytes as f64 / entries as f64
            },
            hits,
            misses,
            hit_rate: CacheStatistics::hit_rate(hits, misses),
        })
    }
}
