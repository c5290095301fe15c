use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{RagError, Result};
use crate::search::types::SearchResult;

pub const DEFAULT_CAPACITY: usize = 256;

/// Opaque handle for one retrieval. Minted per request, never reused within a
/// process, so identical query strings never share an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestToken(u64);

impl fmt::Display for RequestToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{:06}", self.0)
    }
}

/// The raw result set one retrieval produced, exactly as used for generation.
#[derive(Debug)]
pub struct CachedResults {
    pub query: String,
    pub results: Arc<Vec<SearchResult>>,
    pub stored_at: DateTime<Utc>,
}

#[derive(Default)]
struct Entries {
    by_token: HashMap<RequestToken, Arc<CachedResults>>,
    /// Insertion order, oldest first.
    order: VecDeque<RequestToken>,
}

/// Bounded, process-wide store of recent result sets, keyed by request token.
pub struct ResultCache {
    capacity: usize,
    next_token: AtomicU64,
    entries: RwLock<Entries>,
}

impl ResultCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            next_token: AtomicU64::new(1),
            entries: RwLock::new(Entries::default()),
        }
    }

    /// Store a result set and return the token that retrieves it.
    /// Evicts the oldest entry when the cache is full.
    pub async fn insert(&self, query: &str, results: Arc<Vec<SearchResult>>) -> RequestToken {
        let token = RequestToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        let entry = Arc::new(CachedResults {
            query: query.to_string(),
            results,
            stored_at: Utc::now(),
        });

        let mut entries = self.entries.write().await;
        while entries.order.len() >= self.capacity {
            let Some(oldest) = entries.order.pop_front() else {
                break;
            };
            entries.by_token.remove(&oldest);
            debug!(token = %oldest, "result cache entry evicted");
        }
        entries.by_token.insert(token, entry);
        entries.order.push_back(token);

        token
    }

    pub async fn get(&self, token: RequestToken) -> Result<Arc<CachedResults>> {
        self.entries
            .read()
            .await
            .by_token
            .get(&token)
            .cloned()
            .ok_or(RagError::CacheMiss(token))
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.by_token.len()
    }
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
