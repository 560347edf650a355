use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Cache backend error: {0}")]
    Backend(String),
    #[error("Cache operation timed out")]
    Timeout,
    #[error("Operation against a key holding the wrong kind of value: {0}")]
    WrongType(String),
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        CacheError::Backend(err.to_string())
    }
}

/// Remaining lifetime of a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    Missing,
    Persistent,
    Expires(Duration),
}

/// Key/value store primitives the cache service is built on.
///
/// Semantics follow Redis: writing a key replaces its value and expiry,
/// collection writes keep the existing expiry, and reading or deleting
/// a missing key is not an error.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError>;
    /// Returns the number of keys removed
    async fn delete(&self, keys: &[String]) -> Result<u64, CacheError>;
    async fn ttl(&self, key: &str) -> Result<KeyTtl, CacheError>;
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), CacheError>;
    async fn persist(&self, key: &str) -> Result<(), CacheError>;
    async fn sadd(&self, key: &str, member: &str) -> Result<(), CacheError>;
    async fn smembers(&self, key: &str) -> Result<Vec<String>, CacheError>;
    async fn incr_by(&self, key: &str, by: i64) -> Result<i64, CacheError>;
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), CacheError>;
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, CacheError>;
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, CacheError>;
    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<(), CacheError>;
    /// Members ordered by ascending score; negative indexes count from the end
    async fn zrange(&self, key: &str, start: isize, stop: isize)
        -> Result<Vec<String>, CacheError>;
    async fn flush(&self) -> Result<(), CacheError>;
    async fn ping(&self) -> Result<(), CacheError>;
}

#[derive(Debug, Clone)]
enum StoredValue {
    Text(String),
    Set(BTreeSet<String>),
    Hash(HashMap<String, String>),
    SortedSet(Vec<(f64, String)>),
}

impl StoredValue {
    fn kind(&self) -> &'static str {
        match self {
            StoredValue::Text(_) => "string",
            StoredValue::Set(_) => "set",
            StoredValue::Hash(_) => "hash",
            StoredValue::SortedSet(_) => "zset",
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: StoredValue,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn new(value: StoredValue, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|d| Instant::now() + d),
        }
    }

    fn is_expired(&self) -> bool {
        if let Some(expires_at) = self.expires_at {
            Instant::now() >= expires_at
        } else {
            false
        }
    }
}

/// Process-local backend with TTL support, for single-node deployments and tests
#[derive(Debug, Default)]
pub struct InMemoryCacheBackend {
    store: RwLock<HashMap<String, CacheEntry>>,
}

impl InMemoryCacheBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live entry for `key`, dropping it first if it has expired
    fn live<'a>(
        store: &'a mut HashMap<String, CacheEntry>,
        key: &str,
    ) -> Option<&'a mut CacheEntry> {
        if store.get(key).map(CacheEntry::is_expired).unwrap_or(false) {
            store.remove(key);
        }
        store.get_mut(key)
    }

    fn wrong_type(key: &str, entry: &CacheEntry) -> CacheError {
        CacheError::WrongType(format!("{} holds a {}", key, entry.value.kind()))
    }
}

/// Resolves Redis-style inclusive, possibly negative, range bounds
fn range_bounds(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    let len = len as isize;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}

#[async_trait]
impl CacheBackend for InMemoryCacheBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut store = self.store.write().await;
        match Self::live(&mut store, key) {
            None => Ok(None),
            Some(CacheEntry {
                value: StoredValue::Text(v),
                ..
            }) => Ok(Some(v.clone())),
            Some(entry) => Err(Self::wrong_type(key, entry)),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        let mut store = self.store.write().await;
        store.insert(
            key.to_string(),
            CacheEntry::new(StoredValue::Text(value.to_string()), ttl),
        );
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64, CacheError> {
        let mut store = self.store.write().await;
        let mut removed = 0;
        for key in keys {
            if let Some(entry) = store.remove(key) {
                if !entry.is_expired() {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl, CacheError> {
        let mut store = self.store.write().await;
        Ok(match Self::live(&mut store, key) {
            None => KeyTtl::Missing,
            Some(CacheEntry {
                expires_at: None, ..
            }) => KeyTtl::Persistent,
            Some(CacheEntry {
                expires_at: Some(at),
                ..
            }) => KeyTtl::Expires(at.saturating_duration_since(Instant::now())),
        })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut store = self.store.write().await;
        if let Some(entry) = Self::live(&mut store, key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn persist(&self, key: &str) -> Result<(), CacheError> {
        let mut store = self.store.write().await;
        if let Some(entry) = Self::live(&mut store, key) {
            entry.expires_at = None;
        }
        Ok(())
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<(), CacheError> {
        let mut store = self.store.write().await;
        match Self::live(&mut store, key) {
            None => {
                let members = BTreeSet::from([member.to_string()]);
                store.insert(
                    key.to_string(),
                    CacheEntry::new(StoredValue::Set(members), None),
                );
                Ok(())
            }
            Some(CacheEntry {
                value: StoredValue::Set(members),
                ..
            }) => {
                members.insert(member.to_string());
                Ok(())
            }
            Some(entry) => Err(Self::wrong_type(key, entry)),
        }
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, CacheError> {
        let mut store = self.store.write().await;
        match Self::live(&mut store, key) {
            None => Ok(Vec::new()),
            Some(CacheEntry {
                value: StoredValue::Set(members),
                ..
            }) => Ok(members.iter().cloned().collect()),
            Some(entry) => Err(Self::wrong_type(key, entry)),
        }
    }

    async fn incr_by(&self, key: &str, by: i64) -> Result<i64, CacheError> {
        let mut store = self.store.write().await;
        match Self::live(&mut store, key) {
            None => {
                store.insert(
                    key.to_string(),
                    CacheEntry::new(StoredValue::Text(by.to_string()), None),
                );
                Ok(by)
            }
            Some(CacheEntry {
                value: StoredValue::Text(current),
                ..
            }) => {
                let next = current
                    .parse::<i64>()
                    .map_err(|_| CacheError::WrongType(format!("{} is not an integer", key)))?
                    .checked_add(by)
                    .ok_or_else(|| CacheError::Backend(format!("{} would overflow", key)))?;
                *current = next.to_string();
                Ok(next)
            }
            Some(entry) => Err(Self::wrong_type(key, entry)),
        }
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), CacheError> {
        let mut store = self.store.write().await;
        match Self::live(&mut store, key) {
            None => {
                let fields = HashMap::from([(field.to_string(), value.to_string())]);
                store.insert(
                    key.to_string(),
                    CacheEntry::new(StoredValue::Hash(fields), None),
                );
                Ok(())
            }
            Some(CacheEntry {
                value: StoredValue::Hash(fields),
                ..
            }) => {
                fields.insert(field.to_string(), value.to_string());
                Ok(())
            }
            Some(entry) => Err(Self::wrong_type(key, entry)),
        }
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, CacheError> {
        Ok(self.hgetall(key).await?.remove(field))
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, CacheError> {
        let mut store = self.store.write().await;
        match Self::live(&mut store, key) {
            None => Ok(HashMap::new()),
            Some(CacheEntry {
                value: StoredValue::Hash(fields),
                ..
            }) => Ok(fields.clone()),
            Some(entry) => Err(Self::wrong_type(key, entry)),
        }
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<(), CacheError> {
        let mut store = self.store.write().await;
        match Self::live(&mut store, key) {
            None => {
                let members = vec![(score, member.to_string())];
                store.insert(
                    key.to_string(),
                    CacheEntry::new(StoredValue::SortedSet(members), None),
                );
                Ok(())
            }
            Some(CacheEntry {
                value: StoredValue::SortedSet(members),
                ..
            }) => {
                members.retain(|(_, m)| m != member);
                members.push((score, member.to_string()));
                members.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
                Ok(())
            }
            Some(entry) => Err(Self::wrong_type(key, entry)),
        }
    }

    async fn zrange(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, CacheError> {
        let mut store = self.store.write().await;
        match Self::live(&mut store, key) {
            None => Ok(Vec::new()),
            Some(CacheEntry {
                value: StoredValue::SortedSet(members),
                ..
            }) => Ok(match range_bounds(members.len(), start, stop) {
                Some((from, to)) => members[from..=to].iter().map(|(_, m)| m.clone()).collect(),
                None => Vec::new(),
            }),
            Some(entry) => Err(Self::wrong_type(key, entry)),
        }
    }

    async fn flush(&self) -> Result<(), CacheError> {
        self.store.write().await.clear();
        Ok(())
    }

    async fn ping(&self) -> Result<(), CacheError> {
        Ok(())
    }
}
