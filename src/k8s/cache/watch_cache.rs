/**
 * Watch cache entry
 *
 * Mirrors one kind (and scope) of one connection. A single worker lists the
 * kind, then follows the watch stream from the listed resource version,
 * applying every change to the store and notifying the coalescer. Readers
 * never block the worker for longer than a snapshot copy.
 */
use super::backoff::Backoff;
use super::coalescer::Coalescer;
use super::config::{CHANGE_QUEUE_CAPACITY, CacheConfig, MAX_QUIET_RELIST_FAILURES};
use super::errors::{invalidated_error, sync_timeout_error};
use super::store::Store;
use super::view::FlushTarget;
use crate::error::{Error, Result};
use crate::k8s::registry::ConnectionKey;
use crate::k8s::source::{Object, ResourceSource, SourceEvent, WatchScope, kind_of};
use crate::k8s::stream::{StreamBroker, StreamTopic};
use futures::StreamExt;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{RwLock, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Why an entry is not serving fresh data
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokenReason {
    Connection(String),
    Permission {
        verb: String,
        resource: String,
        message: String,
    },
    Other(String),
}

impl BrokenReason {
    #[must_use]
    pub fn from_error(err: &Error) -> Self {
        match err {
            Error::Connection { message, .. } => Self::Connection(message.clone()),
            Error::Permission {
                verb,
                resource,
                message,
            } => Self::Permission {
                verb: verb.clone(),
                resource: resource.clone(),
                message: message.clone(),
            },
            other => Self::Other(other.to_string()),
        }
    }

    /// The error reported to callers waiting on a broken entry
    #[must_use]
    pub fn to_error(&self, target: &str) -> Error {
        match self {
            Self::Connection(message) => Error::Connection {
                target: target.to_string(),
                message: message.clone(),
            },
            Self::Permission {
                verb,
                resource,
                message,
            } => Error::Permission {
                verb: verb.clone(),
                resource: resource.clone(),
                message: message.clone(),
            },
            Self::Other(message) => Error::Custom(format!("{target}: {message}")),
        }
    }
}

/// Lifecycle of a watch cache entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheState {
    Uninitialized,
    /// Worker running, list not yet issued
    Starting,
    /// Initial list in flight
    WaitingForSync,
    Ready,
    /// Lost the connection or permission; retrying with backoff
    Broken(BrokenReason),
    /// Torn down by invalidation; never leaves this state
    Stopped,
}

impl CacheState {
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    #[must_use]
    pub const fn is_broken(&self) -> bool {
        matches!(self, Self::Broken(_))
    }
}

/// Identity of one watch: at most one cache exists per key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchKey {
    pub connection: ConnectionKey,
    pub kind: String,
    pub scope: WatchScope,
}

impl WatchKey {
    #[must_use]
    pub fn new<K: Object>(connection: ConnectionKey, scope: WatchScope) -> Self {
        Self {
            connection,
            kind: kind_of::<K>(),
            scope,
        }
    }
}

impl fmt::Display for WatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.connection, self.kind)?;
        if let Some(namespace) = &self.scope.namespace {
            write!(f, "[ns={namespace}]")?;
        }
        if let Some(selector) = &self.scope.field_selector {
            write!(f, "[{selector}]")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct WatchStats {
    pub state: CacheState,
    pub objects: usize,
    pub relists: u64,
    pub flushes: u64,
}

/// Change notices from the worker and topic releases from the broker
type Notices = (mpsc::Receiver<()>, broadcast::Receiver<StreamTopic>);

pub struct WatchCache<K: Object> {
    key: WatchKey,
    source: Arc<dyn ResourceSource<K>>,
    store: RwLock<Store<K>>,
    dirty: AtomicBool,
    state: watch::Sender<CacheState>,
    changes: mpsc::Sender<()>,
    pending_notices: Mutex<Option<Notices>>,
    coalescer: Coalescer<K>,
    config: Arc<CacheConfig>,
    token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    relists: AtomicU64,
}

impl<K: Object> WatchCache<K> {
    /// Create an idle entry. `token` should be a child of the connection's
    /// token so invalidating the connection stops the worker.
    #[must_use]
    pub fn new(
        key: WatchKey,
        source: Arc<dyn ResourceSource<K>>,
        broker: Arc<StreamBroker>,
        config: Arc<CacheConfig>,
        token: CancellationToken,
    ) -> Arc<Self> {
        let (changes, notices) = mpsc::channel(CHANGE_QUEUE_CAPACITY);
        let (state, _) = watch::channel(CacheState::Uninitialized);
        let period = config.flush_period(&key.kind);
        let released = broker.released();
        Arc::new(Self {
            key,
            source,
            store: RwLock::new(Store::new()),
            dirty: AtomicBool::new(false),
            state,
            changes,
            pending_notices: Mutex::new(Some((notices, released))),
            coalescer: Coalescer::new(period, broker),
            config,
            token,
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            relists: AtomicU64::new(0),
        })
    }

    #[must_use]
    pub const fn key(&self) -> &WatchKey {
        &self.key
    }

    #[must_use]
    pub const fn coalescer(&self) -> &Coalescer<K> {
        &self.coalescer
    }

    #[must_use]
    pub fn state(&self) -> CacheState {
        self.state.borrow().clone()
    }

    /// Receiver that observes every state transition
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<CacheState> {
        self.state.subscribe()
    }

    /// Spawn the list-watch worker and the coalescer. Calling it again is a
    /// no-op.
    pub fn start(self: &Arc<Self>) {
        if self.token.is_cancelled() {
            // the connection went away before the entry was started
            self.set_state(CacheState::Stopped);
            return;
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let notices = match self.pending_notices.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        let mut handles = vec![tokio::spawn(Arc::clone(self).run_list_watch())];
        if let Some((notices, released)) = notices {
            handles.push(tokio::spawn(Coalescer::run(
                Arc::clone(self),
                notices,
                released,
                self.token.clone(),
            )));
        }

        match self.tasks.lock() {
            Ok(mut tasks) => tasks.extend(handles),
            Err(poisoned) => poisoned.into_inner().extend(handles),
        }
    }

    /// Wait until the entry is `Ready`.
    ///
    /// # Errors
    ///
    /// Returns immediately with the connection or permission error when the
    /// entry is broken, `Invalidated` once it is stopped, and `SyncTimeout`
    /// when `timeout` elapses first.
    pub async fn wait_for_sync(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.state.subscribe();
        let target = self.key.to_string();

        let wait = async {
            loop {
                let outcome = match &*rx.borrow_and_update() {
                    CacheState::Ready => Some(Ok(())),
                    CacheState::Broken(reason) => Some(Err(reason.to_error(&target))),
                    CacheState::Stopped => Some(Err(invalidated_error(&target))),
                    _ => None,
                };
                if let Some(outcome) = outcome {
                    return outcome;
                }
                if rx.changed().await.is_err() {
                    return Err(invalidated_error(&target));
                }
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(sync_timeout_error(self.key.to_string(), timeout)),
        }
    }

    /// Point-in-time copy of every mirrored object, ordered by namespace and
    /// name
    pub async fn snapshot(&self) -> Vec<Arc<K>> {
        self.store.read().await.snapshot()
    }

    pub async fn get(&self, name: &str, namespace: Option<&str>) -> Option<Arc<K>> {
        self.store.read().await.get(name, namespace)
    }

    /// Clear the dirty flag, returning whether it was set
    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::SeqCst)
    }

    /// Register a flush target; returns `false` if its topic already had one.
    /// Subscribers attached to a ready cache are primed by the caller.
    ///
    /// # Errors
    ///
    /// Returns `Invalidated` once the entry is stopped or closing
    pub fn register_target(&self, target: Arc<dyn FlushTarget<K>>) -> Result<bool> {
        if !self.is_live() {
            return Err(invalidated_error(&self.key.to_string()));
        }
        self.coalescer
            .register(target)
            .ok_or_else(|| invalidated_error(&self.key.to_string()))
    }

    /// Flush immediately, bypassing the coalescing window
    pub async fn flush_now(&self) -> usize {
        self.coalescer.flush(self).await
    }

    pub async fn stats(&self) -> WatchStats {
        WatchStats {
            state: self.state(),
            objects: self.store.read().await.len(),
            relists: self.relists.load(Ordering::SeqCst),
            flushes: self.coalescer.flushes(),
        }
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        matches!(*self.state.borrow(), CacheState::Stopped)
    }

    /// Still able to serve: not stopped, not cancelled and not closed for
    /// lack of subscribers
    #[must_use]
    pub fn is_live(&self) -> bool {
        !self.is_stopped() && !self.token.is_cancelled() && !self.coalescer.is_closed()
    }

    /// Stop the worker and coalescer for good
    pub fn shutdown(&self) {
        self.token.cancel();
        let handles: Vec<JoinHandle<()>> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        for handle in handles {
            handle.abort();
        }
        self.set_state(CacheState::Stopped);
        info!("🛑 Watch cache {} stopped", self.key);
    }

    fn set_state(&self, next: CacheState) {
        self.state.send_if_modified(|current| {
            // Stopped is terminal
            if *current == CacheState::Stopped || *current == next {
                return false;
            }
            debug!("🔁 {}: {:?} -> {:?}", self.key, current, next);
            *current = next;
            true
        });
    }

    fn mark_changed(&self) {
        self.dirty.store(true, Ordering::SeqCst);
        // a full queue already holds a pending notice
        let _ = self.changes.try_send(());
    }

    async fn run_list_watch(self: Arc<Self>) {
        info!("🔍 Starting {} watcher", self.key);
        let mut backoff = Backoff::new(self.config.initial_backoff, self.config.max_backoff);

        loop {
            self.set_state(CacheState::Starting);
            let err = tokio::select! {
                () = self.token.cancelled() => break,
                err = self.list_then_watch(&mut backoff) => err,
            };

            let delay = backoff.next_delay();
            error!(
                "❌ {} watcher failed (attempt {}): {}, restarting in {:?}",
                self.key,
                backoff.attempts(),
                err,
                delay
            );
            self.set_state(CacheState::Broken(BrokenReason::from_error(&err)));

            tokio::select! {
                () = self.token.cancelled() => break,
                () = sleep(delay) => {}
            }
        }

        self.set_state(CacheState::Stopped);
        debug!("🔍 {} watcher exited", self.key);
    }

    /// List, then follow the watch stream until something fails. Returns the
    /// error that ended the run.
    async fn list_then_watch(&self, backoff: &mut Backoff) -> Error {
        self.set_state(CacheState::WaitingForSync);
        if let Err(e) = self.relist().await {
            return e;
        }
        backoff.reset();

        'watch: loop {
            let resource_version = self
                .store
                .read()
                .await
                .resource_version()
                .map_or_else(|| "0".to_string(), str::to_string);

            let mut stream = match self.source.watch(&resource_version).await {
                Ok(stream) => stream,
                Err(Error::TokenExpired) => {
                    if let Err(e) = self.recover_expired().await {
                        return e;
                    }
                    continue 'watch;
                }
                Err(e) => return e,
            };

            while let Some(item) = stream.next().await {
                match item {
                    Ok(SourceEvent::Applied(obj)) => {
                        self.store.write().await.apply(obj);
                        self.mark_changed();
                    }
                    Ok(SourceEvent::Deleted(obj)) => {
                        if self.store.write().await.delete(&obj) {
                            self.mark_changed();
                        }
                    }
                    Ok(SourceEvent::Bookmark(rv)) => {
                        self.store.write().await.set_resource_version(rv);
                    }
                    Ok(SourceEvent::Expired) | Err(Error::TokenExpired) => {
                        if let Err(e) = self.recover_expired().await {
                            return e;
                        }
                        continue 'watch;
                    }
                    Err(e) => return e,
                }
            }

            debug!("🔍 {} watch stream ended, resuming from {}", self.key, resource_version);
        }
    }

    /// Re-list after the resume token expired. The entry stays `Ready`
    /// through a few failed attempts before giving up.
    async fn recover_expired(&self) -> Result<()> {
        info!("♻️ {} resource version expired, re-listing", self.key);
        let mut backoff = Backoff::new(self.config.initial_backoff, self.config.max_backoff);
        loop {
            match self.relist().await {
                Ok(()) => return Ok(()),
                Err(e) if backoff.attempts() < MAX_QUIET_RELIST_FAILURES => {
                    let delay = backoff.next_delay();
                    warn!("⚠️ {} re-list failed: {}, retrying in {:?}", self.key, e, delay);
                    sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Replace the store with a fresh list and force the next flush
    async fn relist(&self) -> Result<()> {
        let page = self.source.list().await?;
        let count = page.items.len();
        self.store
            .write()
            .await
            .replace(page.items, page.resource_version);
        self.relists.fetch_add(1, Ordering::SeqCst);
        self.set_state(CacheState::Ready);
        self.mark_changed();
        info!("✅ {} synced ({} objects)", self.key, count);
        Ok(())
    }
}

impl<K: Object> Drop for WatchCache<K> {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
