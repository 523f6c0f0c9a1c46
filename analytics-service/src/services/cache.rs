//! Response cache for analytics results.
//!
//! Entries carry a TTL and a set of tags; invalidating a tag drops every entry
//! stored under it. The engine never touches the cache, only the HTTP layer.

use async_trait::async_trait;
use dashmap::DashMap;
use redis::{aio::ConnectionManager, Client};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinHandle;

const KEY_PREFIX: &str = "analytics";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Backend(String),

    #[error("cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        CacheError::Backend(err.to_string())
    }
}

pub fn cache_key(org_id: &str, operation: &str, params: &str) -> String {
    format!("{}:{}:{}:{}", KEY_PREFIX, org_id, operation, params)
}

pub fn org_tag(org_id: &str) -> String {
    format!("org:{}", org_id)
}

#[async_trait]
pub trait AnalyticsCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
        tags: &[String],
    ) -> Result<(), CacheError>;

    /// Remove every entry stored under `tag`. Returns the number removed.
    async fn invalidate_tag(&self, tag: &str) -> Result<usize, CacheError>;

    /// Drop expired entries. Returns the number removed.
    async fn purge_expired(&self) -> Result<usize, CacheError>;
}

pub async fn get_json<T: DeserializeOwned>(
    cache: &dyn AnalyticsCache,
    key: &str,
) -> Result<Option<T>, CacheError> {
    match cache.get(key).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

pub async fn set_json<T: Serialize + Sync>(
    cache: &dyn AnalyticsCache,
    key: &str,
    value: &T,
    ttl: Duration,
    tags: &[String],
) -> Result<(), CacheError> {
    let raw = serde_json::to_string(value)?;
    cache.set(key, raw, ttl, tags).await
}

/// Periodically purge expired entries until the runtime shuts down.
pub fn spawn_purge_task(cache: Arc<dyn AnalyticsCache>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match cache.purge_expired().await {
                Ok(0) => {}
                Ok(removed) => tracing::debug!(removed, "Purged expired cache entries"),
                Err(e) => tracing::warn!("Cache purge failed: {}", e),
            }
        }
    })
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

struct CacheEntry {
    value: String,
    expires_at: Instant,
    tags: Vec<String>,
}

#[derive(Clone, Default)]
pub struct InMemoryCache {
    entries: Arc<DashMap<String, CacheEntry>>,
    tags: Arc<DashMap<String, HashSet<String>>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn remove_entry(&self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some((_, entry)) => {
                self.unindex(key, &entry.tags);
                true
            }
            None => false,
        }
    }

    fn unindex(&self, key: &str, tags: &[String]) {
        for tag in tags {
            if let Some(mut keys) = self.tags.get_mut(tag) {
                keys.remove(key);
            }
            self.tags.remove_if(tag, |_, keys| keys.is_empty());
        }
    }

    #[cfg(test)]
    fn indexed_tags(&self) -> usize {
        self.tags.len()
    }
}

#[async_trait]
impl AnalyticsCache for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let now = Instant::now();
        let lookup = self
            .entries
            .get(key)
            .map(|entry| (entry.expires_at > now).then(|| entry.value.clone()));

        match lookup {
            Some(Some(value)) => Ok(Some(value)),
            Some(None) => {
                self.remove_entry(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
        tags: &[String],
    ) -> Result<(), CacheError> {
        // The entry goes in before its tags are indexed, so an invalidation
        // that sees the tag always finds the entry.
        let replaced = self.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: Instant::now() + ttl,
                tags: tags.to_vec(),
            },
        );
        if let Some(old) = replaced {
            let stale: Vec<String> = old
                .tags
                .into_iter()
                .filter(|tag| !tags.contains(tag))
                .collect();
            self.unindex(key, &stale);
        }
        for tag in tags {
            self.tags
                .entry(tag.clone())
                .or_default()
                .insert(key.to_string());
        }
        Ok(())
    }

    async fn invalidate_tag(&self, tag: &str) -> Result<usize, CacheError> {
        let keys = match self.tags.remove(tag) {
            Some((_, keys)) => keys,
            None => return Ok(0),
        };
        Ok(keys.iter().filter(|key| self.remove_entry(key)).count())
    }

    async fn purge_expired(&self) -> Result<usize, CacheError> {
        let now = Instant::now();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.expires_at <= now)
            .map(|entry| entry.key().clone())
            .collect();
        Ok(expired.iter().filter(|key| self.remove_entry(key)).count())
    }
}

// ---------------------------------------------------------------------------
// Redis
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct RedisCache {
    manager: ConnectionManager,
}

impl RedisCache {
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        tracing::info!("Connecting to Redis cache");
        let client = Client::open(url)?;

        // ConnectionManager reconnects automatically.
        let manager = client.get_connection_manager().await.map_err(|e| {
            tracing::error!("Failed to get Redis connection manager: {}", e);
            CacheError::Backend(format!("Failed to connect to Redis: {}", e))
        })?;

        tracing::info!("Connected to Redis cache");
        Ok(Self { manager })
    }

    fn tag_key(tag: &str) -> String {
        format!("{}:tag:{}", KEY_PREFIX, tag)
    }
}

#[async_trait]
impl AnalyticsCache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.manager.clone();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
        tags: &[String],
    ) -> Result<(), CacheError> {
        let mut conn = self.manager.clone();
        let seconds = ttl.as_secs().max(1);

        let mut pipe = redis::pipe();
        pipe.cmd("SET").arg(key).arg(value).arg("EX").arg(seconds).ignore();
        for tag in tags {
            let tag_key = Self::tag_key(tag);
            pipe.cmd("SADD").arg(&tag_key).arg(key).ignore();
            // Tag sets outlive their members by at most one TTL.
            pipe.cmd("EXPIRE").arg(&tag_key).arg(seconds).ignore();
        }
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn invalidate_tag(&self, tag: &str) -> Result<usize, CacheError> {
        let mut conn = self.manager.clone();
        let tag_key = Self::tag_key(tag);

        let keys: Vec<String> = redis::cmd("SMEMBERS")
            .arg(&tag_key)
            .query_async(&mut conn)
            .await?;

        let mut del = redis::cmd("DEL");
        del.arg(&tag_key);
        for key in &keys {
            del.arg(key);
        }
        let _: i64 = del.query_async(&mut conn).await?;
        Ok(keys.len())
    }

    async fn purge_expired(&self) -> Result<usize, CacheError> {
        // Redis expires keys itself.
        Ok(0)
    }
}

// ---------------------------------------------------------------------------
// Disabled
// ---------------------------------------------------------------------------

/// Used when caching is disabled. Stores nothing.
#[derive(Clone, Copy, Default)]
pub struct NoopCache;

#[async_trait]
impl AnalyticsCache for NoopCache {
    async fn get(&self, _key: &str) -> Result<Option<String>, CacheError> {
        Ok(None)
    }

    async fn set(
        &self,
        _key: &str,
        _value: String,
        _ttl: Duration,
        _tags: &[String],
    ) -> Result<(), CacheError> {
        Ok(())
    }

    async fn invalidate_tag(&self, _tag: &str) -> Result<usize, CacheError> {
        Ok(0)
    }

    async fn purge_expired(&self) -> Result<usize, CacheError> {
        Ok(0)
    }
}
