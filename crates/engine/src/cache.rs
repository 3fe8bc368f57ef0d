//! Cache port and the in-memory implementation.

use std::any::type_name;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;

use cachet_core::{CacheKey, Freshness};

/// Values the engine can fetch, cache and hand to notifiers.
pub trait Cacheable: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> Cacheable for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// Cache error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    /// Stored data could not be read back (IO, corruption, decoding).
    #[error("cache loading failed: {0}")]
    Loading(String),
    /// Data could not be persisted.
    #[error("cache saving failed: {0}")]
    Saving(String),
    /// The backing storage could not be created or opened.
    #[error("cache creation failed: {0}")]
    Creation(String),
}

impl CacheError {
    pub fn loading(msg: impl Into<String>) -> Self {
        Self::Loading(msg.into())
    }

    pub fn saving(msg: impl Into<String>) -> Self {
        Self::Saving(msg.into())
    }

    pub fn creation(msg: impl Into<String>) -> Self {
        Self::Creation(msg.into())
    }
}

/// Keyed artifact storage with expiry.
///
/// Entries are namespaced by value type: the same key may hold one entry per
/// `T`. Implementations must be safe for concurrent use by many jobs.
pub trait CachePort: Send + Sync {
    /// Load the entry for `key` if it satisfies `freshness`.
    ///
    /// Returns `Ok(None)` on a miss or when the entry is expired.
    fn load<T: Cacheable>(
        &self,
        key: &CacheKey,
        freshness: Freshness,
    ) -> Result<Option<T>, CacheError>;

    /// Persist `value` under `key` and return the stored value.
    fn save<T: Cacheable>(&self, value: &T, key: &CacheKey) -> Result<T, CacheError>;

    /// Remove the entry for `key`. Removing a missing entry is not an error.
    fn remove<T: Cacheable>(&self, key: &CacheKey) -> Result<(), CacheError>;
}

impl<C> CachePort for Arc<C>
where
    C: CachePort + ?Sized,
{
    fn load<T: Cacheable>(
        &self,
        key: &CacheKey,
        freshness: Freshness,
    ) -> Result<Option<T>, CacheError> {
        (**self).load(key, freshness)
    }

    fn save<T: Cacheable>(&self, value: &T, key: &CacheKey) -> Result<T, CacheError> {
        (**self).save(value, key)
    }

    fn remove<T: Cacheable>(&self, key: &CacheKey) -> Result<(), CacheError> {
        (**self).remove::<T>(key)
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    data: serde_json::Value,
    cached_at: DateTime<Utc>,
}

type EntryKey = (&'static str, CacheKey);

/// In-memory cache for tests/dev.
///
/// Values are stored as JSON documents, so `save` hands back a decoded copy
/// the same way a persistent backend would.
#[derive(Debug, Default)]
pub struct InMemoryCache {
    entries: RwLock<HashMap<EntryKey, CacheEntry>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Store `value` as if it had been cached `age` ago.
    pub fn insert_with_age<T: Cacheable>(
        &self,
        key: &CacheKey,
        value: &T,
        age: Duration,
    ) -> Result<(), CacheError> {
        let data = serde_json::to_value(value).map_err(|e| CacheError::saving(e.to_string()))?;
        let age = chrono::Duration::from_std(age).unwrap_or(chrono::Duration::zero());
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                (type_name::<T>(), key.clone()),
                CacheEntry {
                    data,
                    cached_at: Utc::now() - age,
                },
            );
        Ok(())
    }

    /// Whether an entry of type `T` exists for `key`, regardless of age.
    pub fn contains<T: Cacheable>(&self, key: &CacheKey) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&(type_name::<T>(), key.clone()))
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.write().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

impl CachePort for InMemoryCache {
    fn load<T: Cacheable>(
        &self,
        key: &CacheKey,
        freshness: Freshness,
    ) -> Result<Option<T>, CacheError> {
        if !freshness.allows_cache_read() {
            return Ok(None);
        }

        let entry = {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            match entries.get(&(type_name::<T>(), key.clone())) {
                Some(entry) => entry.clone(),
                None => return Ok(None),
            }
        };

        let age = Utc::now()
            .signed_duration_since(entry.cached_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        if freshness.is_expired(age) {
            return Ok(None);
        }

        serde_json::from_value(entry.data)
            .map(Some)
            .map_err(|e| CacheError::loading(format!("{key}: {e}")))
    }

    fn save<T: Cacheable>(&self, value: &T, key: &CacheKey) -> Result<T, CacheError> {
        let data = serde_json::to_value(value).map_err(|e| CacheError::saving(e.to_string()))?;
        let stored =
            serde_json::from_value(data.clone()).map_err(|e| CacheError::saving(e.to_string()))?;

        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                (type_name::<T>(), key.clone()),
                CacheEntry {
                    data,
                    cached_at: Utc::now(),
                },
            );

        Ok(stored)
    }

    fn remove<T: Cacheable>(&self, key: &CacheKey) -> Result<(), CacheError> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(type_name::<T>(), key.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Forecast {
        city: String,
        celsius: i32,
    }

    fn key(k: &str) -> CacheKey {
        CacheKey::new(k).unwrap()
    }

    fn forecast() -> Forecast {
        Forecast {
            city: "Lyon".to_string(),
            celsius: 21,
        }
    }

    #[test]
    fn save_then_load_within_window() {
        let cache = InMemoryCache::new();
        let stored = cache.save(&forecast(), &key("lyon")).unwrap();
        assert_eq!(stored, forecast());

        let loaded: Option<Forecast> = cache
            .load(&key("lyon"), Freshness::max_age(Freshness::ONE_MINUTE))
            .unwrap();
        assert_eq!(loaded, Some(forecast()));
    }

    #[test]
    fn expired_entries_are_absent_unless_always_valid() {
        let cache = InMemoryCache::new();
        cache
            .insert_with_age(&key("lyon"), &forecast(), Freshness::ONE_DAY)
            .unwrap();

        let fresh: Option<Forecast> = cache
            .load(&key("lyon"), Freshness::max_age(Freshness::ONE_HOUR))
            .unwrap();
        assert_eq!(fresh, None);

        let stale: Option<Forecast> = cache.load(&key("lyon"), Freshness::AlwaysValid).unwrap();
        assert_eq!(stale, Some(forecast()));

        let never: Option<Forecast> = cache.load(&key("lyon"), Freshness::AlwaysExpired).unwrap();
        assert_eq!(never, None);
    }

    #[test]
    fn entries_are_namespaced_by_type() {
        let cache = InMemoryCache::new();
        cache.save(&42u32, &key("shared")).unwrap();

        assert!(cache.contains::<u32>(&key("shared")));
        assert!(!cache.contains::<String>(&key("shared")));

        cache.remove::<String>(&key("shared")).unwrap();
        assert!(cache.contains::<u32>(&key("shared")));

        cache.remove::<u32>(&key("shared")).unwrap();
        assert!(cache.is_empty());
    }

    #[test]
    fn same_key_different_type_is_a_miss() {
        let cache = InMemoryCache::new();
        cache.save(&"not a forecast".to_string(), &key("x")).unwrap();

        let miss: Option<Forecast> = cache.load(&key("x"), Freshness::AlwaysValid).unwrap();
        assert_eq!(miss, None);
    }
}
