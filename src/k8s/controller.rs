/**
 * Resource controllers
 *
 * One controller per object kind. Reads and streams are served from the
 * kind's shared watch cache; detail, YAML and delete go straight to the
 * cluster. Every operation is scoped by a `ConnectionKey`.
 */
use super::cache::errors::invalidated_error;
use super::cache::view::render_rows;
use super::cache::{
    CacheState, FlushTarget, OwnedTarget, OwnedTrigger, ResourceView, ViewTarget, WatchCache,
    WatchCacheSet, WatchKey, empty_snapshot,
};
use super::context::StreamContext;
use super::registry::{ConnectionHandle, ConnectionKey, InvalidationListener};
use super::source::{Object, ResourceSource, SourceBinder, WatchScope, kind_of, plural_of};
use super::stream::{StreamBroker, StreamQuery, StreamTopic, Subscriber};
use crate::error::{Error, Result};
use bytes::Bytes;
use k8s_openapi::api::core::v1::Event;
use k8s_openapi::serde_json::{self, Value};
use kube::ResourceExt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Qualifier of per-object event streams
pub const EVENTS_QUALIFIER: &str = "events";

pub struct ResourceController<C, K: Object> {
    ctx: Arc<StreamContext<C>>,
    binder: Arc<dyn SourceBinder<C, K>>,
    view: Arc<dyn ResourceView<K>>,
    caches: Arc<WatchCacheSet<K>>,
    events: Option<Arc<ResourceController<C, Event>>>,
}

impl<C: Clone + Send + Sync + 'static, K: Object> ResourceController<C, K> {
    /// Create a controller and register its caches for invalidation
    #[must_use]
    pub fn new(
        ctx: Arc<StreamContext<C>>,
        binder: Arc<dyn SourceBinder<C, K>>,
        view: Arc<dyn ResourceView<K>>,
    ) -> Self {
        let caches = Arc::new(WatchCacheSet::new(
            Arc::clone(ctx.broker()),
            Arc::clone(ctx.config()),
        ));
        ctx.registry()
            .add_listener(Arc::clone(&caches) as Arc<dyn InvalidationListener>);
        Self {
            ctx,
            binder,
            view,
            caches,
            events: None,
        }
    }

    /// Serve per-object event streams through `events`
    #[must_use]
    pub fn with_events(mut self, events: Arc<ResourceController<C, Event>>) -> Self {
        self.events = Some(events);
        self
    }

    #[must_use]
    pub const fn view(&self) -> &Arc<dyn ResourceView<K>> {
        &self.view
    }

    #[must_use]
    pub const fn caches(&self) -> &Arc<WatchCacheSet<K>> {
        &self.caches
    }

    /// The kind's cluster-wide cache for `key`, created and started on first
    /// use
    ///
    /// # Errors
    ///
    /// Returns the registry's error when no client can be built for `key`
    pub async fn cache(&self, key: &ConnectionKey) -> Result<Arc<WatchCache<K>>> {
        self.scoped_cache(key, WatchScope::all()).await
    }

    async fn scoped_cache(
        &self,
        key: &ConnectionKey,
        scope: WatchScope,
    ) -> Result<Arc<WatchCache<K>>> {
        match self.try_scoped_cache(key, &scope).await {
            // invalidated between resolving and creating; the next resolve
            // builds a fresh connection
            Err(Error::Invalidated(_)) => self.try_scoped_cache(key, &scope).await,
            other => other,
        }
    }

    async fn try_scoped_cache(
        &self,
        key: &ConnectionKey,
        scope: &WatchScope,
    ) -> Result<Arc<WatchCache<K>>> {
        let ConnectionHandle { client, token, .. } = self.ctx.registry().resolve(key).await?;
        let watch_key = WatchKey::new::<K>(key.clone(), scope.clone());
        let binder = Arc::clone(&self.binder);
        self.caches
            .get_or_create(watch_key, &token, move || binder.bind(&client, scope))
            .await
    }

    async fn direct(&self, key: &ConnectionKey) -> Result<Arc<dyn ResourceSource<K>>> {
        let handle = self.ctx.registry().resolve(key).await?;
        Ok(self.binder.bind(&handle.client, &WatchScope::all()))
    }

    /// # Errors
    ///
    /// Returns the registry's error when no client can be built for `key`
    pub async fn state(&self, key: &ConnectionKey) -> Result<CacheState> {
        Ok(self.cache(key).await?.state())
    }

    /// Rendered snapshot of the kind, optionally limited to `namespace`
    ///
    /// # Errors
    ///
    /// Returns the cache's sync error (`SyncTimeout`, `Connection`,
    /// `Permission` or `Invalidated`) when it is not ready in time
    pub async fn list(&self, key: &ConnectionKey, namespace: Option<&str>) -> Result<Bytes> {
        let cache = self.cache(key).await?;
        cache.wait_for_sync(self.ctx.config().sync_timeout).await?;

        let objects: Vec<Arc<K>> = cache
            .snapshot()
            .await
            .into_iter()
            .filter(|obj| namespace.is_none_or(|ns| obj.namespace().as_deref() == Some(ns)))
            .collect();
        debug!("📋 Listed {} {} for {}", objects.len(), plural_of::<K>(), key);
        Ok(render_rows(self.view.as_ref(), &objects))
    }

    /// Stream of the kind, optionally narrowed by namespace and name. A query
    /// qualified with `events` is served as [`Self::events`].
    ///
    /// # Errors
    ///
    /// Fails immediately when the cache is broken or the query is invalid
    pub async fn subscribe(&self, query: &StreamQuery) -> Result<Subscriber> {
        match query.qualifier.as_deref() {
            None => {}
            Some(EVENTS_QUALIFIER) => {
                let name = query.name.as_deref().ok_or_else(|| {
                    Error::InvalidQuery("an events stream needs a name".to_string())
                })?;
                return self
                    .events(&query.connection, name, query.namespace.as_deref())
                    .await;
            }
            Some(other) => {
                return Err(Error::InvalidQuery(format!("unsupported qualifier {other}")));
            }
        }

        let cache = self.cache(&query.connection).await?;
        let target = ViewTarget::new(query.topic(&kind_of::<K>()), Arc::clone(&self.view))
            .selecting(query.namespace.clone(), query.name.clone());
        attach(self.ctx.broker(), &cache, Arc::new(target)).await
    }

    /// Full object as JSON, read directly from the cluster. Falls back to the
    /// cache when the source has no direct reads.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the object does not exist
    pub async fn detail(
        &self,
        key: &ConnectionKey,
        name: &str,
        namespace: Option<&str>,
    ) -> Result<Value> {
        let obj = self.fetch(key, name, namespace).await?;
        Ok(serde_json::to_value(&obj)?)
    }

    /// Object as YAML without `managedFields`
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the object does not exist
    pub async fn yaml(
        &self,
        key: &ConnectionKey,
        name: &str,
        namespace: Option<&str>,
    ) -> Result<String> {
        let mut obj = self.fetch(key, name, namespace).await?;
        obj.meta_mut().managed_fields = None;
        Ok(serde_yaml::to_string(&obj)?)
    }

    /// Delete on the cluster. The cache sees the removal through its watch.
    ///
    /// # Errors
    ///
    /// Returns the cluster's error, e.g. `NotFound` or `Permission`
    pub async fn delete(
        &self,
        key: &ConnectionKey,
        name: &str,
        namespace: Option<&str>,
    ) -> Result<()> {
        self.direct(key).await?.delete(name, namespace).await?;
        info!("🗑️ Deleted {} {} on {}", kind_of::<K>(), name, key);
        Ok(())
    }

    /// Events whose involved object is `name`, from a watch narrowed to that
    /// object
    ///
    /// # Errors
    ///
    /// Returns `Unsupported` when no events controller is attached
    pub async fn events(
        &self,
        key: &ConnectionKey,
        name: &str,
        namespace: Option<&str>,
    ) -> Result<Subscriber> {
        let events = self
            .events
            .as_ref()
            .ok_or_else(|| Error::Unsupported(format!("events for {}", plural_of::<K>())))?;
        let topic = StreamTopic::new(key.clone(), kind_of::<K>())
            .namespace(namespace)
            .name(Some(name))
            .qualifier(EVENTS_QUALIFIER);
        let involved = name.to_string();
        let involved_namespace = namespace.map(str::to_string);
        let kind = kind_of::<K>();
        let target: Arc<dyn FlushTarget<Event>> = Arc::new(
            ViewTarget::new(topic, Arc::clone(&events.view)).filtered(move |event: &Event| {
                let object = &event.involved_object;
                object.name.as_deref() == Some(involved.as_str())
                    && object.kind.as_deref().is_none_or(|k| k == kind)
                    && involved_namespace
                        .as_deref()
                        .is_none_or(|ns| object.namespace.as_deref() == Some(ns))
            }),
        );

        // the scoped watch closes with its last subscriber; one that closed
        // while we attached is replaced by a fresh one
        let scope = WatchScope::involving(name, namespace);
        let cache = events.scoped_cache(key, scope.clone()).await?;
        match attach(self.ctx.broker(), &cache, Arc::clone(&target)).await {
            Err(Error::Invalidated(_)) => {
                let cache = events.scoped_cache(key, scope).await?;
                attach(self.ctx.broker(), &cache, target).await
            }
            other => other,
        }
    }

    /// Objects of `children`'s kind owned by the named object, e.g. the pods
    /// of a `ReplicaSet`. Re-published when either kind changes.
    ///
    /// # Errors
    ///
    /// Fails immediately when either cache is broken
    pub async fn owned<S: Object>(
        &self,
        children: &ResourceController<C, S>,
        key: &ConnectionKey,
        name: &str,
        namespace: Option<&str>,
    ) -> Result<Subscriber> {
        let owners = self.cache(key).await?;
        let kids = children.cache(key).await?;
        ensure_usable(&owners)?;
        ensure_usable(&kids)?;

        let topic = StreamTopic::new(key.clone(), kind_of::<K>())
            .namespace(namespace)
            .name(Some(name))
            .qualifier(plural_of::<S>());
        let target = Arc::new(OwnedTarget::new(
            topic.clone(),
            name.to_string(),
            namespace.map(str::to_string),
            &owners,
            &kids,
            Arc::clone(children.view()),
        ));

        let _owners_gate = owners.coalescer().hold().await;
        let _kids_gate = kids.coalescer().hold().await;
        let mut subscriber = self.ctx.broker().subscribe(topic);
        owners.register_target(Arc::clone(&target) as Arc<dyn FlushTarget<K>>)?;
        kids.register_target(Arc::new(OwnedTrigger(Arc::clone(&target))))?;

        if owners.state().is_ready() && kids.state().is_ready() {
            let objects = owners.snapshot().await;
            subscriber.prime(render_or_empty::<K>(target.as_ref(), &objects).await);
        }
        Ok(subscriber)
    }

    async fn fetch(&self, key: &ConnectionKey, name: &str, namespace: Option<&str>) -> Result<K> {
        match self.direct(key).await?.get(name, namespace).await {
            Err(Error::Unsupported(_)) => {
                debug!("📦 Reading {} {} from cache", kind_of::<K>(), name);
                let cache = self.cache(key).await?;
                cache.wait_for_sync(self.ctx.config().sync_timeout).await?;
                cache
                    .get(name, namespace)
                    .await
                    .map(|obj| obj.as_ref().clone())
                    .ok_or_else(|| Error::NotFound {
                        resource: plural_of::<K>(),
                        name: name.to_string(),
                    })
            }
            other => other,
        }
    }
}

fn ensure_usable<T: Object>(cache: &WatchCache<T>) -> Result<()> {
    match cache.state() {
        CacheState::Broken(reason) => Err(reason.to_error(&cache.key().to_string())),
        CacheState::Stopped => Err(invalidated_error(&cache.key().to_string())),
        _ => Ok(()),
    }
}

async fn render_or_empty<T: Object>(target: &dyn FlushTarget<T>, objects: &[Arc<T>]) -> Bytes {
    target.render(objects).await.unwrap_or_else(|e| {
        warn!("⚠️ Render of {} failed, priming empty snapshot: {}", target.topic(), e);
        empty_snapshot()
    })
}

/// Subscribe to `target`'s topic and register it on `cache`. A ready cache
/// primes the subscriber with the current rendering; flushes wait meanwhile
/// so nothing older than the priming frame follows it.
async fn attach<T: Object>(
    broker: &Arc<StreamBroker>,
    cache: &Arc<WatchCache<T>>,
    target: Arc<dyn FlushTarget<T>>,
) -> Result<Subscriber> {
    ensure_usable(cache)?;

    let _gate = cache.coalescer().hold().await;
    let mut subscriber = broker.subscribe(target.topic().clone());
    cache.register_target(Arc::clone(&target))?;
    if cache.state().is_ready() {
        let objects = cache.snapshot().await;
        subscriber.prime(render_or_empty(target.as_ref(), &objects).await);
    }
    debug!("📡 Subscriber {} on {}", subscriber.id(), subscriber.topic());
    Ok(subscriber)
}
