use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

struct CacheEntry {
    body: String,
    inserted: Instant,
}

/// In-memory page cache keyed by normalized URL.
///
/// Expired entries are never returned; they are dropped when next looked up,
/// or when room is needed in a full cache. Nothing sweeps in the background.
pub struct FetchCache {
    ttl: Duration,
    max_entries: usize,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl FetchCache {
    /// `max_entries == 0` means unbounded.
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, url: &str) -> Option<String> {
        self.get_at(url, Instant::now()).await
    }

    pub async fn set(&self, url: &str, body: String) {
        self.set_at(url, body, Instant::now()).await
    }

    pub(crate) async fn get_at(&self, url: &str, now: Instant) -> Option<String> {
        let key = cache_key(url);
        let mut entries = self.entries.lock().await;
        let expired = match entries.get(&key) {
            None => return None,
            Some(entry) => now.saturating_duration_since(entry.inserted) > self.ttl,
        };
        if expired {
            debug!(url = %key, "Cache entry expired");
            entries.remove(&key);
            return None;
        }
        entries.get(&key).map(|e| e.body.clone())
    }

    pub(crate) async fn set_at(&self, url: &str, body: String, now: Instant) {
        let key = cache_key(url);
        let mut entries = self.entries.lock().await;

        if self.max_entries > 0 && entries.len() >= self.max_entries && !entries.contains_key(&key) {
            let ttl = self.ttl;
            entries.retain(|_, e| now.saturating_duration_since(e.inserted) <= ttl);
            if entries.len() >= self.max_entries {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, e)| e.inserted)
                    .map(|(k, _)| k.clone());
                if let Some(oldest) = oldest {
                    debug!(url = %oldest, "Evicting oldest cache entry");
                    entries.remove(&oldest);
                }
            }
        }

        entries.insert(key, CacheEntry { body, inserted: now });
    }

    pub async fn clear(&self) {
        let mut entries = self.entries.lock().await;
        let n = entries.len();
        entries.clear();
        debug!(entries = n, "Fetch cache cleared");
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for FetchCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL, 512)
    }
}

/// Trim whitespace and drop the fragment; scheme and host are already
/// lowercased by the URL parser.
fn cache_key(raw: &str) -> String {
    let trimmed = raw.trim();
    match url::Url::parse(trimmed) {
        Ok(mut url) => {
            url.set_fragment(None);
            url.to_string()
        }
        Err(_) => trimmed.to_string(),
    }
}
