use lru::LruCache;
use parking_lot::Mutex;
use std::{
    num::NonZeroUsize,
    sync::atomic::{AtomicU64, Ordering},
    sync::Arc,
};
use tracing::trace;

use super::Translation;
use crate::error::PgResult;

/// Identifies a cached translation.
///
/// Translations fold session values such as `current_user` into literals,
/// so the session context is part of the key alongside the query text.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub user: String,
    pub database: String,
    pub sql: String,
}

/// Shared LRU cache of statement translations.
///
/// Only successful translations are stored; a statement that failed to
/// translate is retried in full the next time it is seen. Translations do
/// not depend on the schema, so DDL never invalidates entries.
///
/// ## Example
/// ```ignore
/// let cache = TranslationCache::new(256);
/// let key = CacheKey { user: "app".into(), database: "main".into(), sql: sql.into() };
/// let translation = cache.get_or_translate(key, || translate(sql, &ctx))?;
/// ```
pub struct TranslationCache {
    entries: Mutex<LruCache<CacheKey, Arc<Translation>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl TranslationCache {
    /// Creates a cache holding at most `capacity` translations (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Returns the cached translation for `key`, translating and caching it
    /// on a miss.
    ///
    /// The lock is not held while `translate` runs, so two sessions missing
    /// on the same key may both translate; the later insert wins.
    pub fn get_or_translate<F>(&self, key: CacheKey, translate: F) -> PgResult<Arc<Translation>>
    where
        F: FnOnce() -> PgResult<Translation>,
    {
        if let Some(found) = self.entries.lock().get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            trace!(sql = %key.sql, "translation cache hit");
            return Ok(Arc::clone(found));
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let translation = Arc::new(translate()?);
        self.entries.lock().put(key, Arc::clone(&translation));
        Ok(translation)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `(hits, misses)` since the cache was created.
    pub fn stats(&self) -> (u64, u64) {
        (self.hits.load(Ordering::Relaxed), self.misses.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PgError;

    fn key(user: &str, sql: &str) -> CacheKey {
        CacheKey {
            user: user.into(),
            database: "db".into(),
            sql: sql.into(),
        }
    }

    #[test]
    fn hits_after_first_translation() {
        let cache = TranslationCache::new(4);
        let mut calls = 0;
        for _ in 0..3 {
            cache
                .get_or_translate(key("a", "SELECT 1"), || {
                    calls += 1;
                    Ok(Translation::Empty)
                })
                .unwrap();
        }
        assert_eq!(calls, 1);
        assert_eq!(cache.stats(), (2, 1));
    }

    #[test]
    fn session_context_is_part_of_the_key() {
        let cache = TranslationCache::new(4);
        cache.get_or_translate(key("a", "SELECT current_user"), || Ok(Translation::Empty)).unwrap();
        cache.get_or_translate(key("b", "SELECT current_user"), || Ok(Translation::Empty)).unwrap();
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn evicts_least_recently_used_and_skips_errors() {
        let cache = TranslationCache::new(2);
        cache.get_or_translate(key("a", "1"), || Ok(Translation::Empty)).unwrap();
        cache.get_or_translate(key("a", "2"), || Ok(Translation::Empty)).unwrap();
        cache.get_or_translate(key("a", "3"), || Ok(Translation::Empty)).unwrap();
        assert_eq!(cache.len(), 2);

        let failed = cache.get_or_translate(key("a", "bad"), || Err(PgError::syntax("nope")));
        assert!(failed.is_err());
        assert_eq!(cache.len(), 2);
    }
}
