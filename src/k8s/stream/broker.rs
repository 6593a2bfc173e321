/**
 * Stream broker
 *
 * Topic-keyed many-readers broadcast, independent of any cache. Each topic is
 * a bounded broadcast ring: publishing never waits on a reader, and a reader
 * that falls behind loses its oldest frames (its next frame is marked stale)
 * without affecting anyone else. A reader that keeps overflowing is
 * disconnected. Topics losing their last subscriber are announced on a
 * released feed so whatever renders for them can let go.
 */
use super::topic::StreamTopic;
use crate::error::{Error, Result};
use crate::k8s::cache::config::{CacheConfig, RELEASE_QUEUE_CAPACITY};
use crate::k8s::registry::{ConnectionKey, InvalidationListener};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use uuid::Uuid;

struct TopicChannel {
    tx: broadcast::Sender<Bytes>,
    subscribers: HashSet<Uuid>,
}

pub struct StreamBroker {
    topics: RwLock<HashMap<StreamTopic, TopicChannel>>,
    released: broadcast::Sender<StreamTopic>,
    buffer: usize,
    max_lag_events: u32,
}

impl StreamBroker {
    #[must_use]
    pub fn new(buffer: usize, max_lag_events: u32) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            released: broadcast::channel(RELEASE_QUEUE_CAPACITY).0,
            buffer: buffer.max(1),
            max_lag_events,
        }
    }

    #[must_use]
    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.subscriber_buffer, config.max_lag_events)
    }

    /// Feed of topics that just lost their last subscriber
    #[must_use]
    pub fn released(&self) -> broadcast::Receiver<StreamTopic> {
        self.released.subscribe()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<StreamTopic, TopicChannel>> {
        match self.topics.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<StreamTopic, TopicChannel>> {
        match self.topics.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register a new subscriber on `topic`. Returns immediately.
    pub fn subscribe(self: &Arc<Self>, topic: StreamTopic) -> Subscriber {
        let id = Uuid::new_v4();
        let rx = {
            let mut topics = self.write();
            let channel = topics.entry(topic.clone()).or_insert_with(|| TopicChannel {
                tx: broadcast::channel(self.buffer).0,
                subscribers: HashSet::new(),
            });
            channel.subscribers.insert(id);
            channel.tx.subscribe()
        };

        debug!("➕ Subscriber {} on {}", id, topic);
        Subscriber {
            id,
            topic,
            rx,
            primed: None,
            broker: Arc::downgrade(self),
            max_lag_events: self.max_lag_events,
            lag_events: 0,
            skipped: 0,
            stale: false,
            detached: false,
        }
    }

    /// Deliver `payload` to every current subscriber of `topic`.
    ///
    /// Never waits on a subscriber. Returns the number of subscribers reached.
    pub fn publish(&self, topic: &StreamTopic, payload: Bytes) -> usize {
        let topics = self.read();
        let Some(channel) = topics.get(topic) else {
            return 0;
        };
        let reached = channel.tx.send(payload).unwrap_or(0);
        debug!("📤 Published to {} ({} subscribers)", topic, reached);
        reached
    }

    /// Remove one subscriber. Idempotent. The topic disappears with its last
    /// subscriber; caches feeding it are unaffected.
    pub fn unsubscribe(&self, topic: &StreamTopic, id: Uuid) -> bool {
        let mut topics = self.write();
        let Some(channel) = topics.get_mut(topic) else {
            return false;
        };
        let removed = channel.subscribers.remove(&id);
        let emptied = channel.subscribers.is_empty();
        if emptied {
            topics.remove(topic);
        }
        drop(topics);

        if removed {
            debug!("➖ Subscriber {} left {}", id, topic);
        }
        if emptied {
            // nobody listening is fine
            let _ = self.released.send(topic.clone());
        }
        removed
    }

    #[must_use]
    pub fn has_subscribers(&self, topic: &StreamTopic) -> bool {
        self.subscriber_count(topic) > 0
    }

    #[must_use]
    pub fn subscriber_count(&self, topic: &StreamTopic) -> usize {
        self.read()
            .get(topic)
            .map_or(0, |channel| channel.subscribers.len())
    }

    #[must_use]
    pub fn topic_count(&self) -> usize {
        self.read().len()
    }

    /// Drop every topic of `key`. Their subscribers see end-of-stream once
    /// they have drained what was already delivered.
    pub fn close_connection(&self, key: &ConnectionKey) -> usize {
        let mut topics = self.write();
        let before = topics.len();
        topics.retain(|topic, _| !topic.belongs_to(key));
        let closed = before - topics.len();
        drop(topics);

        if closed > 0 {
            info!("🔌 Closed {} topics for {}", closed, key);
        }
        closed
    }
}

#[async_trait]
impl InvalidationListener for StreamBroker {
    async fn invalidate(&self, key: &ConnectionKey) {
        self.close_connection(key);
    }
}

/// One delivered snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub payload: Bytes,
    /// Earlier frames were dropped because this subscriber fell behind
    pub stale: bool,
}

/// Live sink bound to one topic. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscriber {
    id: Uuid,
    topic: StreamTopic,
    rx: broadcast::Receiver<Bytes>,
    primed: Option<Bytes>,
    broker: Weak<StreamBroker>,
    max_lag_events: u32,
    lag_events: u32,
    skipped: u64,
    stale: bool,
    detached: bool,
}

impl Subscriber {
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub const fn topic(&self) -> &StreamTopic {
        &self.topic
    }

    /// Frames dropped so far because this subscriber fell behind
    #[must_use]
    pub const fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Queue `payload` to be delivered before anything published
    pub fn prime(&mut self, payload: Bytes) {
        self.primed = Some(payload);
    }

    /// Wait for the next frame. `Ok(None)` means the topic was closed.
    ///
    /// # Errors
    ///
    /// Returns `Error::SlowConsumer` once this subscriber has overflowed its
    /// buffer more than the configured number of times without catching up;
    /// it is unsubscribed at that point.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.detached {
            return Ok(None);
        }
        if let Some(payload) = self.primed.take() {
            return Ok(Some(Frame {
                payload,
                stale: false,
            }));
        }

        loop {
            match self.rx.recv().await {
                Ok(payload) => {
                    if self.rx.is_empty() {
                        self.lag_events = 0;
                    }
                    return Ok(Some(Frame {
                        payload,
                        stale: std::mem::take(&mut self.stale),
                    }));
                }
                Err(RecvError::Lagged(skipped)) => {
                    self.skipped += skipped;
                    self.lag_events += 1;
                    self.stale = true;
                    warn!(
                        "🐢 Subscriber {} on {} skipped {} frames ({} overflows)",
                        self.id, self.topic, skipped, self.lag_events
                    );
                    if self.lag_events > self.max_lag_events {
                        self.detach();
                        return Err(Error::SlowConsumer {
                            topic: self.topic.to_string(),
                            skipped: self.skipped,
                        });
                    }
                }
                Err(RecvError::Closed) => return Ok(None),
            }
        }
    }

    fn detach(&mut self) {
        if self.detached {
            return;
        }
        self.detached = true;
        if let Some(broker) = self.broker.upgrade() {
            broker.unsubscribe(&self.topic, self.id);
        }
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.detach();
    }
}
