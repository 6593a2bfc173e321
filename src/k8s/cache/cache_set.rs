use super::config::CacheConfig;
use super::errors::invalidated_error;
use super::watch_cache::{WatchCache, WatchKey};
use crate::error::Result;
use crate::k8s::registry::{ConnectionKey, InvalidationListener};
use crate::k8s::source::{Object, ResourceSource};
use crate::k8s::stream::StreamBroker;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Every watch cache of one kind, keyed by connection and scope.
///
/// Creation is single-flight: concurrent callers asking for the same key get
/// the same entry and the upstream is watched once.
pub struct WatchCacheSet<K: Object> {
    caches: Mutex<HashMap<WatchKey, Arc<WatchCache<K>>>>,
    broker: Arc<StreamBroker>,
    config: Arc<CacheConfig>,
}

impl<K: Object> WatchCacheSet<K> {
    #[must_use]
    pub fn new(broker: Arc<StreamBroker>, config: Arc<CacheConfig>) -> Self {
        Self {
            caches: Mutex::new(HashMap::new()),
            broker,
            config,
        }
    }

    /// Return the started entry for `key`, creating it from `source` when
    /// absent or no longer live. `connection_token` is the token of the
    /// connection the source was bound to. Entries that stopped on their own
    /// are dropped along the way.
    ///
    /// # Errors
    ///
    /// Returns `Invalidated` when the connection was invalidated after it was
    /// resolved; the caller should resolve it again.
    pub async fn get_or_create(
        &self,
        key: WatchKey,
        connection_token: &CancellationToken,
        source: impl FnOnce() -> Arc<dyn ResourceSource<K>>,
    ) -> Result<Arc<WatchCache<K>>> {
        if connection_token.is_cancelled() {
            return Err(invalidated_error(&key.to_string()));
        }

        let mut caches = self.caches.lock().await;
        caches.retain(|_, cache| cache.is_live());
        if let Some(cache) = caches.get(&key) {
            return Ok(Arc::clone(cache));
        }

        debug!("🆕 Creating watch cache {}", key);
        let cache = WatchCache::new(
            key.clone(),
            source(),
            Arc::clone(&self.broker),
            Arc::clone(&self.config),
            connection_token.child_token(),
        );
        cache.start();
        if !cache.is_live() {
            return Err(invalidated_error(&key.to_string()));
        }
        caches.insert(key, Arc::clone(&cache));
        Ok(cache)
    }

    pub async fn get(&self, key: &WatchKey) -> Option<Arc<WatchCache<K>>> {
        self.caches.lock().await.get(key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.caches.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.caches.lock().await.is_empty()
    }

    /// Stop and drop every entry of `connection`. Returns how many were removed.
    pub async fn remove_connection(&self, connection: &ConnectionKey) -> usize {
        let removed: Vec<Arc<WatchCache<K>>> = {
            let mut caches = self.caches.lock().await;
            let keys: Vec<WatchKey> = caches
                .keys()
                .filter(|key| &key.connection == connection)
                .cloned()
                .collect();
            keys.iter().filter_map(|key| caches.remove(key)).collect()
        };

        for cache in &removed {
            cache.shutdown();
        }
        if !removed.is_empty() {
            info!("🧹 Removed {} watch caches for {}", removed.len(), connection);
        }
        removed.len()
    }
}

#[async_trait]
impl<K: Object> InvalidationListener for WatchCacheSet<K> {
    async fn invalidate(&self, key: &ConnectionKey) {
        self.remove_connection(key).await;
    }
}
