/**
 * Change coalescer
 *
 * Turns a high-frequency stream of change notices from one watch cache into a
 * bounded-rate stream of flushes. The first notice after an idle period opens
 * a window of one flush period; notices inside the window merge; when the
 * window closes the snapshot is rendered once per registered target and
 * handed to the broker. A zero period flushes on every notice.
 */
use super::view::{FlushTarget, empty_snapshot};
use super::watch_cache::WatchCache;
use crate::k8s::source::Object;
use crate::k8s::stream::{StreamBroker, StreamTopic};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, MutexGuard, broadcast, mpsc};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct Targets<K> {
    by_topic: HashMap<StreamTopic, Arc<dyn FlushTarget<K>>>,
    /// Set once the last target of a scoped cache is pruned
    closed: bool,
}

pub struct Coalescer<K> {
    period: Duration,
    broker: Arc<StreamBroker>,
    targets: RwLock<Targets<K>>,
    gate: Mutex<()>,
    flushes: AtomicU64,
}

impl<K: Object> Coalescer<K> {
    #[must_use]
    pub fn new(period: Duration, broker: Arc<StreamBroker>) -> Self {
        Self {
            period,
            broker,
            targets: RwLock::new(Targets {
                by_topic: HashMap::new(),
                closed: false,
            }),
            gate: Mutex::new(()),
            flushes: AtomicU64::new(0),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Targets<K>> {
        match self.targets.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, Targets<K>> {
        match self.targets.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    #[must_use]
    pub const fn period(&self) -> Duration {
        self.period
    }

    /// Number of flushes that published at least one payload
    #[must_use]
    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::SeqCst)
    }

    /// Add a target unless one is already registered for its topic.
    /// Returns `Some(true)` when added and `None` once the coalescer is closed.
    pub fn register(&self, target: Arc<dyn FlushTarget<K>>) -> Option<bool> {
        let mut targets = self.write();
        if targets.closed {
            return None;
        }
        if targets.by_topic.contains_key(target.topic()) {
            return Some(false);
        }
        debug!("🎯 Flush target {}", target.topic());
        targets.by_topic.insert(target.topic().clone(), target);
        Some(true)
    }

    #[must_use]
    pub fn targets(&self) -> Vec<Arc<dyn FlushTarget<K>>> {
        self.read().by_topic.values().cloned().collect()
    }

    #[must_use]
    pub fn target_count(&self) -> usize {
        self.read().by_topic.len()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.read().closed
    }

    /// Drop targets whose topic has no subscribers left: just `topic` when
    /// given, every target otherwise. With `close_when_empty`, pruning the
    /// last target closes the coalescer to new targets and returns `true`.
    pub fn prune(&self, topic: Option<&StreamTopic>, close_when_empty: bool) -> bool {
        let mut targets = self.write();
        let before = targets.by_topic.len();
        let broker = &self.broker;
        targets.by_topic.retain(|candidate, _| {
            topic.is_some_and(|only| only != candidate) || broker.has_subscribers(candidate)
        });
        let pruned = before - targets.by_topic.len();
        if pruned == 0 {
            return false;
        }

        debug!("🧹 Dropped {} flush targets", pruned);
        if close_when_empty && targets.by_topic.is_empty() {
            targets.closed = true;
            return true;
        }
        false
    }

    /// Hold off flushes while a subscriber is attached and primed, so no
    /// frame rendered from an older snapshot follows its priming frame
    pub async fn hold(&self) -> MutexGuard<'_, ()> {
        self.gate.lock().await
    }

    /// Publish the current snapshot to every target with subscribers if the
    /// cache changed since the last flush. Returns the number of topics
    /// published to.
    pub async fn flush(&self, cache: &WatchCache<K>) -> usize {
        let _gate = self.gate.lock().await;
        if !cache.take_dirty() {
            return 0;
        }

        let targets: Vec<Arc<dyn FlushTarget<K>>> = self
            .targets()
            .into_iter()
            .filter(|target| self.broker.has_subscribers(target.topic()))
            .collect();
        if targets.is_empty() {
            return 0;
        }

        let objects = cache.snapshot().await;
        for target in &targets {
            let payload = match target.render(&objects).await {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("⚠️ Render of {} failed, publishing empty snapshot: {}", target.topic(), e);
                    empty_snapshot()
                }
            };
            self.broker.publish(target.topic(), payload);
        }

        self.flushes.fetch_add(1, Ordering::SeqCst);
        debug!("🚿 Flushed {} ({} objects, {} topics)", cache.key(), objects.len(), targets.len());
        targets.len()
    }

    /// Coalescing loop for one cache; runs until `token` is cancelled or the
    /// notice queue closes. Also drops targets whose topics were released; a
    /// scoped cache left without targets shuts itself down.
    pub(crate) async fn run(
        cache: Arc<WatchCache<K>>,
        mut notices: mpsc::Receiver<()>,
        mut released: broadcast::Receiver<StreamTopic>,
        token: CancellationToken,
    ) {
        let period = cache.coalescer().period();
        let close_when_empty = !cache.key().scope.is_all();
        let mut deadline: Option<Instant> = None;
        let mut releases_open = true;

        loop {
            let window = deadline;
            let tick = async move {
                match window {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                () = token.cancelled() => break,
                notice = notices.recv() => {
                    if notice.is_none() {
                        break;
                    }
                    if period.is_zero() {
                        cache.coalescer().flush(&cache).await;
                    } else if deadline.is_none() {
                        deadline = Some(Instant::now() + period);
                    }
                }
                topic = released.recv(), if releases_open => {
                    let closed = match topic {
                        Ok(topic) => cache.coalescer().prune(Some(&topic), close_when_empty),
                        Err(RecvError::Lagged(_)) => cache.coalescer().prune(None, close_when_empty),
                        Err(RecvError::Closed) => {
                            releases_open = false;
                            false
                        }
                    };
                    if closed {
                        info!("🧹 {} has no subscribers left", cache.key());
                        cache.shutdown();
                        break;
                    }
                }
                () = tick => {
                    deadline = None;
                    cache.coalescer().flush(&cache).await;
                }
            }
        }
        debug!("🚿 Coalescer for {} stopped", cache.key());
    }
}
