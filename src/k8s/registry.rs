/**
 * Connection registry
 *
 * Resolves a (profile, cluster) pair to a live cluster client and owns the
 * client's lifetime. Removing or reloading a profile invalidates every client
 * built from it and cascades to the watch caches and streams layered on top.
 */
use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Identifies one isolation domain: every client, cache and stream is
/// partitioned by it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionKey {
    pub profile_id: String,
    pub cluster: String,
}

impl ConnectionKey {
    #[must_use]
    pub fn new(profile_id: impl Into<String>, cluster: impl Into<String>) -> Self {
        Self {
            profile_id: profile_id.into(),
            cluster: cluster.into(),
        }
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.profile_id, self.cluster)
    }
}

/// Builds cluster clients. Construction may validate credentials against the
/// cluster; failures are reported to the caller and never retried here.
#[async_trait]
pub trait Connector: Send + Sync {
    type Client: Clone + Send + Sync + 'static;

    async fn connect(&self, key: &ConnectionKey) -> Result<Self::Client>;
}

/// Anything holding state derived from a connection that must be torn down
/// when the connection goes away.
#[async_trait]
pub trait InvalidationListener: Send + Sync {
    async fn invalidate(&self, key: &ConnectionKey);
}

/// A resolved connection: the client plus the token cancelled when the
/// connection is invalidated.
#[derive(Debug, Clone)]
pub struct ConnectionHandle<C> {
    pub key: ConnectionKey,
    pub client: C,
    pub token: CancellationToken,
}

pub struct ConnectionRegistry<C> {
    connector: Arc<dyn Connector<Client = C>>,
    clients: RwLock<HashMap<ConnectionKey, ConnectionHandle<C>>>,
    /// One gate per key being connected; the client map is never locked
    /// across a connect
    connecting: std::sync::Mutex<HashMap<ConnectionKey, Arc<Mutex<()>>>>,
    /// Bumped by every invalidation so a connect racing it is discarded
    generation: AtomicU64,
    listeners: std::sync::RwLock<Vec<Arc<dyn InvalidationListener>>>,
}

impl<C: Clone + Send + Sync + 'static> ConnectionRegistry<C> {
    #[must_use]
    pub fn new(connector: Arc<dyn Connector<Client = C>>) -> Self {
        Self {
            connector,
            clients: RwLock::new(HashMap::new()),
            connecting: std::sync::Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            listeners: std::sync::RwLock::new(Vec::new()),
        }
    }

    /// Register state that must be torn down on invalidation
    pub fn add_listener(&self, listener: Arc<dyn InvalidationListener>) {
        match self.listeners.write() {
            Ok(mut listeners) => listeners.push(listener),
            Err(poisoned) => poisoned.into_inner().push(listener),
        }
    }

    /// Get or create the client for `key`. Repeated resolution of the same key
    /// returns the same client until the key is invalidated.
    ///
    /// Connecting happens outside the client map lock: a slow or hung cluster
    /// only delays callers resolving that same key.
    ///
    /// # Errors
    ///
    /// Returns the connector's error if the client cannot be built. Failures
    /// are not cached, the next call tries again.
    pub async fn resolve(&self, key: &ConnectionKey) -> Result<ConnectionHandle<C>> {
        if let Some(handle) = self.cached(key).await {
            debug!("♻️ Reusing client for {}", key);
            return Ok(handle);
        }

        let gate = self.gate(key);
        let _connecting = gate.lock().await;
        let result = self.connect_once(key).await;
        self.release_gate(key, &gate);
        result
    }

    async fn cached(&self, key: &ConnectionKey) -> Option<ConnectionHandle<C>> {
        self.clients.read().await.get(key).cloned()
    }

    async fn connect_once(&self, key: &ConnectionKey) -> Result<ConnectionHandle<C>> {
        loop {
            // a caller ahead of us at the gate may have connected already
            if let Some(handle) = self.cached(key).await {
                return Ok(handle);
            }

            let generation = self.generation.load(Ordering::SeqCst);
            debug!("🔧 Creating client for {}", key);
            let client = self.connector.connect(key).await.map_err(|e| {
                error!("❌ Failed to connect to {}: {}", key, e);
                e
            })?;

            let mut clients = self.clients.write().await;
            if self.generation.load(Ordering::SeqCst) != generation {
                debug!("🔁 {} was invalidated while connecting, reconnecting", key);
                continue;
            }
            let handle = ConnectionHandle {
                key: key.clone(),
                client,
                token: CancellationToken::new(),
            };
            clients.insert(key.clone(), handle.clone());
            info!("✅ Connected to {}", key);
            return Ok(handle);
        }
    }

    fn gate(&self, key: &ConnectionKey) -> Arc<Mutex<()>> {
        let mut connecting = match self.connecting.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(connecting.entry(key.clone()).or_default())
    }

    fn release_gate(&self, key: &ConnectionKey, gate: &Arc<Mutex<()>>) {
        let mut connecting = match self.connecting.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if connecting.get(key).is_some_and(|current| Arc::ptr_eq(current, gate)) {
            connecting.remove(key);
        }
    }

    /// Tear down every client of `profile_id` and everything built on them.
    ///
    /// The registry lock is held until every listener has finished, so no
    /// caller can resolve a half torn-down connection. Returns the number of
    /// connections removed.
    pub async fn invalidate(&self, profile_id: &str) -> usize {
        let mut clients = self.clients.write().await;
        self.generation.fetch_add(1, Ordering::SeqCst);
        let keys: Vec<ConnectionKey> = clients
            .keys()
            .filter(|key| key.profile_id == profile_id)
            .cloned()
            .collect();

        for key in &keys {
            if let Some(handle) = clients.remove(key) {
                self.teardown(handle).await;
            }
        }
        drop(clients);

        info!("🧹 Invalidated profile {} ({} connections)", profile_id, keys.len());
        keys.len()
    }

    /// Tear down a single connection
    pub async fn invalidate_key(&self, key: &ConnectionKey) -> bool {
        let mut clients = self.clients.write().await;
        self.generation.fetch_add(1, Ordering::SeqCst);
        let Some(handle) = clients.remove(key) else {
            return false;
        };
        self.teardown(handle).await;
        drop(clients);
        info!("🧹 Invalidated {}", key);
        true
    }

    async fn teardown(&self, handle: ConnectionHandle<C>) {
        handle.token.cancel();
        let listeners: Vec<Arc<dyn InvalidationListener>> = match self.listeners.read() {
            Ok(listeners) => listeners.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        for listener in listeners {
            listener.invalidate(&handle.key).await;
        }
    }

    pub async fn has_client(&self, key: &ConnectionKey) -> bool {
        self.clients.read().await.contains_key(key)
    }

    pub async fn connections(&self) -> Vec<ConnectionKey> {
        self.clients.read().await.keys().cloned().collect()
    }
}
