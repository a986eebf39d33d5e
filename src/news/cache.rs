use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::NaiveDate;
use moka::future::Cache;

use crate::models::NewsContext;
use crate::telemetry::{NEWS_CACHE_HITS, NEWS_CACHE_MISSES};

const MAX_ENTRIES: u64 = 256;

/// Reference date plus the lowercased, sorted, deduplicated topic terms.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub reference_date: NaiveDate,
    pub terms: Vec<String>,
}

impl CacheKey {
    pub fn new(reference_date: NaiveDate, terms: &[String]) -> Self {
        let mut terms: Vec<String> = terms
            .iter()
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        terms.sort();
        terms.dedup();
        Self {
            reference_date,
            terms,
        }
    }
}

/// TTL cache of successful news fetches, shared across runs.
pub struct NewsCache {
    cache: Cache<CacheKey, NewsContext>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl NewsCache {
    pub fn new(ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(MAX_ENTRIES)
            .time_to_live(ttl)
            .build();

        Self {
            cache,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub async fn get(&self, key: &CacheKey) -> Option<NewsContext> {
        let found = self.cache.get(key).await;
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            NEWS_CACHE_HITS.add(1, &[]);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            NEWS_CACHE_MISSES.add(1, &[]);
        }
        found
    }

    pub async fn insert(&self, key: CacheKey, context: NewsContext) {
        self.cache.insert(key, context).await;
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}
