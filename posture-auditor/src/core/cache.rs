/*!
Run-scoped memoization of upstream listing calls
*/

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use tokio::sync::{Mutex, OnceCell};
use tracing::debug;

/// Key/value cache shared by every check in one audit run.
///
/// Values are immutable once stored and handed out as `Arc`s, so any number
/// of checks may hold the same listing at once. Each key gets its own
/// `OnceCell`: concurrent first requests for a key wait on a single in-flight
/// computation, and a failed computation leaves the key empty for the next
/// caller to retry.
#[derive(Debug, Default)]
pub struct RunCache {
    entries: Mutex<HashMap<String, Arc<OnceCell<Arc<Value>>>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl RunCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the value stored under `key`, computing and storing it first if absent
    pub async fn get_or_compute<F, Fut, E>(&self, key: &str, compute: F) -> Result<Arc<Value>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, E>>,
    {
        let cell = {
            let mut entries = self.entries.lock().await;
            Arc::clone(entries.entry(key.to_string()).or_default())
        };

        if let Some(value) = cell.get() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(key, "cache hit");
            return Ok(Arc::clone(value));
        }

        let mut computed = false;
        let value = cell
            .get_or_try_init(|| async {
                computed = true;
                compute().await.map(Arc::new)
            })
            .await?;

        if computed {
            self.misses.fetch_add(1, Ordering::Relaxed);
            debug!(key, "cache populated");
        } else {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        Ok(Arc::clone(value))
    }

    /// Whether `key` currently holds a value
    pub async fn contains(&self, key: &str) -> bool {
        self.entries
            .lock()
            .await
            .get(key)
            .is_some_and(|cell| cell.initialized())
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

/// Hit/miss counters for one run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}
