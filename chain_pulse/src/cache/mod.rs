use crate::model::{AnalyticsFrame, TopicKey};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::warn;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),
    #[error("cache call exceeded {0:?}")]
    Timeout(Duration),
}

/// Latest-frame store keyed by topic. Backends may be remote, so every call
/// is async and fallible; callers treat failures as a cache miss.
#[async_trait]
pub trait ResultCache: Send + Sync {
    async fn set(
        &self,
        key: &TopicKey,
        frame: Arc<AnalyticsFrame>,
        ttl: Duration,
    ) -> Result<(), CacheError>;

    async fn get(&self, key: &TopicKey) -> Result<Option<Arc<AnalyticsFrame>>, CacheError>;

    /// Backends that can count their entries cheaply report them here.
    fn stats(&self) -> Option<CacheStats> {
        None
    }
}

#[derive(Debug, Clone)]
struct CachedFrame {
    frame: Arc<AnalyticsFrame>,
    expires_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub live_entries: usize,
}

#[derive(Clone, Default)]
pub struct InMemoryCache {
    inner: Arc<RwLock<HashMap<TopicKey, CachedFrame>>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Drops expired entries and returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut guard = self.inner.write();
        let before = guard.len();
        guard.retain(|_, cached| cached.expires_at > now);
        before - guard.len()
    }

    pub fn entry_stats(&self) -> CacheStats {
        let guard = self.inner.read();
        let now = Instant::now();
        let live_entries = guard
            .values()
            .fold(0usize, |acc, cached| acc + (cached.expires_at > now) as usize);
        CacheStats {
            entries: guard.len(),
            live_entries,
        }
    }
}

#[async_trait]
impl ResultCache for InMemoryCache {
    async fn set(
        &self,
        key: &TopicKey,
        frame: Arc<AnalyticsFrame>,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let mut guard = self.inner.write();
        guard.insert(
            key.clone(),
            CachedFrame {
                frame,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &TopicKey) -> Result<Option<Arc<AnalyticsFrame>>, CacheError> {
        let guard = self.inner.read();
        Ok(guard
            .get(key)
            .filter(|cached| cached.expires_at > Instant::now())
            .map(|cached| Arc::clone(&cached.frame)))
    }

    fn stats(&self) -> Option<CacheStats> {
        Some(self.entry_stats())
    }
}

/// Runs a cache call under `limit`, collapsing errors and timeouts into
/// `None` after logging them.
pub async fn bounded<T, F>(limit: Duration, op: &'static str, key: &TopicKey, call: F) -> Option<T>
where
    F: Future<Output = Result<T, CacheError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(err)) => {
            warn!(target: "cache", topic = %key, op, error = %err, "cache call failed");
            None
        }
        Err(_) => {
            let err = CacheError::Timeout(limit);
            warn!(target: "cache", topic = %key, op, error = %err, "cache call timed out");
            None
        }
    }
}

/// Cache that always fails. Exercises the degrade-to-no-cache path.
pub struct UnavailableCache;

#[async_trait]
impl ResultCache for UnavailableCache {
    async fn set(
        &self,
        _key: &TopicKey,
        _frame: Arc<AnalyticsFrame>,
        _ttl: Duration,
    ) -> Result<(), CacheError> {
        Err(CacheError::Unavailable("cache disabled".into()))
    }

    async fn get(&self, _key: &TopicKey) -> Result<Option<Arc<AnalyticsFrame>>, CacheError> {
        Err(CacheError::Unavailable("cache disabled".into()))
    }
}
