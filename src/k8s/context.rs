/**
 * Application context
 *
 * Owns the connection registry, the stream broker and the cache
 * configuration shared by every resource controller. Controllers register
 * their watch-cache sets with the registry so invalidating a profile tears
 * down caches and streams together.
 */
use super::cache::CacheConfig;
use super::client::{ConnectionProfile, KubeConnector};
use super::registry::{ConnectionRegistry, Connector, InvalidationListener};
use super::stream::StreamBroker;
use kube::Client;
use std::sync::Arc;
use tracing::info;

pub struct StreamContext<C> {
    registry: ConnectionRegistry<C>,
    broker: Arc<StreamBroker>,
    config: Arc<CacheConfig>,
}

impl<C: Clone + Send + Sync + 'static> StreamContext<C> {
    #[must_use]
    pub fn new(connector: Arc<dyn Connector<Client = C>>, config: CacheConfig) -> Arc<Self> {
        let broker = Arc::new(StreamBroker::from_config(&config));
        let registry = ConnectionRegistry::new(connector);
        registry.add_listener(Arc::clone(&broker) as Arc<dyn InvalidationListener>);
        Arc::new(Self {
            registry,
            broker,
            config: Arc::new(config),
        })
    }

    #[must_use]
    pub const fn registry(&self) -> &ConnectionRegistry<C> {
        &self.registry
    }

    #[must_use]
    pub const fn broker(&self) -> &Arc<StreamBroker> {
        &self.broker
    }

    #[must_use]
    pub const fn config(&self) -> &Arc<CacheConfig> {
        &self.config
    }

    /// Tear down every client, cache and stream of `profile_id`. Returns the
    /// number of connections removed.
    pub async fn invalidate(&self, profile_id: &str) -> usize {
        self.registry.invalidate(profile_id).await
    }
}

impl StreamContext<Client> {
    /// Replace a profile's credentials. Everything built from the old
    /// credentials is torn down first.
    pub async fn reload_profile(&self, connector: &KubeConnector, profile: ConnectionProfile) -> usize {
        let removed = self.invalidate(&profile.id).await;
        info!("📇 Reloading profile {}", profile.id);
        connector.upsert(profile);
        removed
    }

    pub async fn remove_profile(&self, connector: &KubeConnector, profile_id: &str) -> usize {
        let removed = self.invalidate(profile_id).await;
        connector.remove(profile_id);
        removed
    }
}
