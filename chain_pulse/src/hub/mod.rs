use crate::delivery::{FrameSink, SendOutcome, StreamEvent, Transport};
use crate::model::{AnalyticsFrame, TopicKey};
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

struct Subscriber {
    id: u64,
    sink: Arc<dyn FrameSink>,
    joined_at: DateTime<Utc>,
    /// Millis since epoch of the last delivered frame, 0 before the first.
    last_delivered: AtomicI64,
}

impl Subscriber {
    fn last_activity(&self) -> DateTime<Utc> {
        match self.last_delivered.load(Ordering::Relaxed) {
            0 => self.joined_at,
            ms => DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or(self.joined_at),
        }
    }
}

#[derive(Default)]
struct Topic {
    subscribers: Vec<Subscriber>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeOutcome {
    pub id: u64,
    pub topic_created: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    pub lagged: usize,
    pub removed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    pub topics: usize,
    pub subscribers: usize,
    pub push: usize,
    pub event_stream: usize,
    pub pull: usize,
    pub stale: usize,
}

/// Per-topic fan-out. Broadcast holds only the read lock and never awaits;
/// membership changes take the write lock.
#[derive(Clone, Default)]
pub struct SubscriptionHub {
    topics: Arc<RwLock<HashMap<TopicKey, Topic>>>,
    next_id: Arc<AtomicU64>,
}

impl SubscriptionHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, key: &TopicKey, sink: Arc<dyn FrameSink>) -> SubscribeOutcome {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let transport = sink.transport();
        let mut guard = self.topics.write();
        let topic_created = !guard.contains_key(key);
        guard.entry(key.clone()).or_default().subscribers.push(Subscriber {
            id,
            sink,
            joined_at: Utc::now(),
            last_delivered: AtomicI64::new(0),
        });
        debug!(target: "hub", topic = %key, id, %transport, topic_created, "subscriber joined");
        SubscribeOutcome { id, topic_created }
    }

    /// Removes one subscriber. Returns true when that left the topic empty
    /// and the topic was destroyed.
    pub fn unsubscribe(&self, key: &TopicKey, id: u64) -> bool {
        let mut guard = self.topics.write();
        let Some(topic) = guard.get_mut(key) else {
            return false;
        };
        topic.subscribers.retain(|sub| sub.id != id);
        if topic.subscribers.is_empty() {
            guard.remove(key);
            info!(target: "hub", topic = %key, "topic destroyed");
            true
        } else {
            debug!(target: "hub", topic = %key, id, "subscriber left");
            false
        }
    }

    pub fn publish(&self, frame: &Arc<AnalyticsFrame>) -> PublishReport {
        let key = frame.topic();
        self.broadcast(&key, || StreamEvent::Frame(Arc::clone(frame)), true)
    }

    pub fn publish_error(&self, key: &TopicKey, message: &str) -> PublishReport {
        self.broadcast(key, || StreamEvent::Error(message.to_string()), false)
    }

    fn broadcast<F>(&self, key: &TopicKey, event: F, is_frame: bool) -> PublishReport
    where
        F: Fn() -> StreamEvent,
    {
        let mut report = PublishReport::default();
        let mut closed = Vec::new();
        {
            let guard = self.topics.read();
            let Some(topic) = guard.get(key) else {
                return report;
            };
            let now_ms = Utc::now().timestamp_millis();
            for sub in &topic.subscribers {
                if sub.sink.is_closed() {
                    closed.push(sub.id);
                    continue;
                }
                match sub.sink.send(event()) {
                    SendOutcome::Delivered => {
                        report.delivered += 1;
                        if is_frame {
                            sub.last_delivered.store(now_ms, Ordering::Relaxed);
                        }
                    }
                    SendOutcome::Lagged => report.lagged += 1,
                    SendOutcome::Closed => closed.push(sub.id),
                }
            }
        }

        if !closed.is_empty() {
            // The topic itself stays until its subscription guards unsubscribe.
            let mut guard = self.topics.write();
            if let Some(topic) = guard.get_mut(key) {
                let before = topic.subscribers.len();
                topic.subscribers.retain(|sub| !closed.contains(&sub.id));
                report.removed = before - topic.subscribers.len();
            }
            debug!(target: "hub", topic = %key, removed = report.removed, "dropped closed sinks");
        }
        report
    }

    pub fn subscriber_count(&self, key: &TopicKey) -> usize {
        self.topics
            .read()
            .get(key)
            .map(|topic| topic.subscribers.len())
            .unwrap_or(0)
    }

    pub fn has_topic(&self, key: &TopicKey) -> bool {
        self.topics.read().contains_key(key)
    }

    pub fn topics(&self) -> Vec<TopicKey> {
        let mut keys: Vec<TopicKey> = self.topics.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn stats(&self, stale_after: Duration) -> HubStats {
        let guard = self.topics.read();
        let now = Utc::now();
        guard
            .values()
            .flat_map(|topic| topic.subscribers.iter())
            .fold(
                HubStats {
                    topics: guard.len(),
                    ..HubStats::default()
                },
                |mut acc, sub| {
                    acc.subscribers += 1;
                    match sub.sink.transport() {
                        Transport::Push => acc.push += 1,
                        Transport::EventStream => acc.event_stream += 1,
                        Transport::Pull => acc.pull += 1,
                    }
                    if now - sub.last_activity() > stale_after {
                        acc.stale += 1;
                    }
                    acc
                },
            )
    }
}
