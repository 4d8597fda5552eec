//! Embedding generation capability and its memoization cache.
//!
//! The database never loads models itself: any backend implementing
//! [`EmbeddingGenerator`] plugs in. The cache memoizes text → vector by a
//! sha-256 fingerprint of the text; entries are pure function results of
//! (text, model) and are never invalidated by writes.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::EmbeddingError;

#[async_trait]
pub trait EmbeddingGenerator: Send + Sync {
    /// Load the model. May be called more than once; later calls should be
    /// cheap no-ops.
    async fn initialize(&self) -> Result<(), EmbeddingError>;

    /// Embed one text. Output length must equal [`Self::dimensions`];
    /// vectors must be L2-normalized when serving a cosine index.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// Embed a batch; the default delegates to [`Self::embed`] per item.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }

    /// Output dimensionality, known after (or before) initialization.
    fn dimensions(&self) -> usize;

    /// Release model resources; best-effort.
    async fn dispose(&self) {}
}

/// Retry `initialize` with exponential backoff: `retry_delay · 2^attempt`,
/// up to `max_retries` retries after the first attempt. Device fallback on
/// retry is the generator's concern; it just sees another `initialize`.
pub async fn initialize_with_retry(
    generator: &dyn EmbeddingGenerator,
    max_retries: u32,
    retry_delay: Duration,
) -> Result<(), EmbeddingError> {
    let mut attempt: u32 = 0;
    loop {
        match generator.initialize().await {
            Ok(()) => return Ok(()),
            Err(err) if attempt < max_retries => {
                let delay = retry_delay * 2u32.saturating_pow(attempt);
                tracing::warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "embedding model load failed; retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

struct CacheEntry {
    vector: Vec<f32>,
    created: Instant,
    tick: u64,
}

/// Entry-count-bounded LRU from text fingerprint to embedding, with an
/// optional TTL.
pub struct EmbeddingCache {
    capacity: usize,
    ttl: Option<Duration>,
    tick: u64,
    entries: HashMap<String, CacheEntry>,
    recency: BTreeMap<u64, String>,
}

impl EmbeddingCache {
    pub fn new(capacity: usize, ttl: Option<Duration>) -> Self {
        Self {
            capacity,
            ttl,
            tick: 0,
            entries: HashMap::new(),
            recency: BTreeMap::new(),
        }
    }

    /// Sha-256 fingerprint of the input text.
    pub fn fingerprint(text: &str) -> String {
        let digest = Sha256::digest(text.as_bytes());
        let mut out = String::with_capacity(64);
        for byte in digest {
            out.push_str(&format!("{byte:02x}"));
        }
        out
    }

    pub fn get(&mut self, text: &str) -> Option<Vec<f32>> {
        let key = Self::fingerprint(text);
        if let Some(ttl) = self.ttl {
            if let Some(entry) = self.entries.get(&key) {
                if entry.created.elapsed() > ttl {
                    self.remove_key(&key);
                    return None;
                }
            }
        }
        self.tick += 1;
        let tick = self.tick;
        let entry = self.entries.get_mut(&key)?;
        self.recency.remove(&entry.tick);
        entry.tick = tick;
        self.recency.insert(tick, key);
        Some(entry.vector.clone())
    }

    pub fn put(&mut self, text: &str, vector: Vec<f32>) {
        if self.capacity == 0 {
            return;
        }
        let key = Self::fingerprint(text);
        self.remove_key(&key);
        while self.entries.len() >= self.capacity {
            let Some((&tick, _)) = self.recency.iter().next() else {
                break;
            };
            if let Some(victim) = self.recency.remove(&tick) {
                self.entries.remove(&victim);
            }
        }
        self.tick += 1;
        self.recency.insert(self.tick, key.clone());
        self.entries.insert(
            key,
            CacheEntry {
                vector,
                created: Instant::now(),
                tick: self.tick,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.recency.clear();
    }

    fn remove_key(&mut self, key: &str) {
        if let Some(entry) = self.entries.remove(key) {
            self.recency.remove(&entry.tick);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn memoizes_by_text() {
        let mut cache = EmbeddingCache::new(4, None);
        assert!(cache.get("hello").is_none());
        cache.put("hello", vec![1.0, 2.0]);
        assert_eq!(cache.get("hello"), Some(vec![1.0, 2.0]));
        assert!(cache.get("other").is_none());
    }

    #[test]
    fn bounded_by_entry_count_lru() {
        let mut cache = EmbeddingCache::new(2, None);
        cache.put("a", vec![1.0]);
        cache.put("b", vec![2.0]);
        assert!(cache.get("a").is_some()); // promote "a"
        cache.put("c", vec![3.0]);
        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none(), "lru entry evicted");
        assert!(cache.get("c").is_some());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn zero_ttl_expires_immediately() {
        let mut cache = EmbeddingCache::new(4, Some(Duration::ZERO));
        cache.put("a", vec![1.0]);
        std::thread::sleep(Duration::from_millis(2));
        assert!(cache.get("a").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn fingerprint_is_stable_hex() {
        let fp = EmbeddingCache::fingerprint("abc");
        assert_eq!(fp.len(), 64);
        assert_eq!(fp, EmbeddingCache::fingerprint("abc"));
        assert_ne!(fp, EmbeddingCache::fingerprint("abd"));
    }

    struct FlakyGenerator {
        failures_left: AtomicU32,
    }

    #[async_trait]
    impl EmbeddingGenerator for FlakyGenerator {
        async fn initialize(&self) -> Result<(), EmbeddingError> {
            if self.failures_left.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                n.checked_sub(1)
            }).is_ok()
            {
                Err(EmbeddingError::ModelLoad("transient".into()))
            } else {
                Ok(())
            }
        }

        async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
            Ok(vec![0.0; 2])
        }

        fn dimensions(&self) -> usize {
            2
        }
    }

    #[tokio::test]
    async fn retry_eventually_succeeds() {
        let generator = FlakyGenerator {
            failures_left: AtomicU32::new(2),
        };
        initialize_with_retry(&generator, 3, Duration::from_millis(1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn retry_gives_up_after_budget() {
        let generator = FlakyGenerator {
            failures_left: AtomicU32::new(10),
        };
        let err = initialize_with_retry(&generator, 2, Duration::from_millis(1))
            .await
            .unwrap_err();
        assert!(matches!(err, EmbeddingError::ModelLoad(_)));
    }
}
