//! In-process pub/sub with a durable append-only log and batched, retried
//! fan-out to subscribers.
//!
//! There's no single teacher module this generalizes (spiral-core's Discord
//! layer pushes messages directly rather than through a named stream); the
//! buffering/backpressure/retry shape follows the same patterns the teacher
//! uses for its circuit breaker (bounded state behind a mutex, a background
//! tokio task driving a periodic tick) and rate limiter (governor-style
//! token accounting), adapted into an actor that owns the buffer.

use crate::config::EventBusConfig;
use crate::models::{EventPriority, StreamEvent};
use crate::store::Store;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

type Filter = Arc<dyn Fn(&StreamEvent) -> bool + Send + Sync>;

#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct EventBusStats {
    pub published: u64,
    pub dropped: u64,
    pub delivered: u64,
    pub retried: u64,
    pub delivery_failed: u64,
}

struct Subscriber {
    sender: mpsc::UnboundedSender<EventBatch>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct EventBatch {
    pub batch_id: String,
    pub stream_name: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub event_count: usize,
    pub events: Vec<StreamEvent>,
}

struct Inner {
    buffer: VecDeque<StreamEvent>,
    filters: HashMap<String, Filter>,
    subscribers: HashMap<String, Subscriber>,
}

/// A single named stream per process (§4.2). Publish never blocks: when the
/// bounded buffer is full the event is dropped and counted, never queued.
pub struct EventBus {
    stream_name: String,
    config: EventBusConfig,
    inner: Mutex<Inner>,
    store: Arc<Store>,
    published: AtomicU64,
    dropped: AtomicU64,
    delivered: AtomicU64,
    retried: AtomicU64,
    delivery_failed: AtomicU64,
}

impl EventBus {
    pub fn new(stream_name: impl Into<String>, config: EventBusConfig, store: Arc<Store>) -> Arc<Self> {
        Arc::new(Self {
            stream_name: stream_name.into(),
            config,
            inner: Mutex::new(Inner {
                buffer: VecDeque::new(),
                filters: HashMap::new(),
                subscribers: HashMap::new(),
            }),
            store,
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            delivery_failed: AtomicU64::new(0),
        })
    }

    /// Spawns the periodic flush loop. Must be called once per bus instance.
    pub fn spawn_flush_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let bus = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(bus.config.flush_interval);
            loop {
                ticker.tick().await;
                bus.flush().await;
            }
        })
    }

    /// O(1): accepted unless the buffer is at capacity. Filters run before
    /// buffering and rejecting via a filter does not count as dropped.
    pub async fn publish(&self, event: StreamEvent) -> bool {
        let mut inner = self.inner.lock().await;
        for filter in inner.filters.values() {
            if !filter(&event) {
                debug!(event_id = %event.event_id, "event rejected by filter");
                return false;
            }
        }
        if inner.buffer.len() >= self.config.buffer_size {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(event_id = %event.event_id, "event buffer full, dropping event");
            return false;
        }
        self.published.fetch_add(1, Ordering::Relaxed);
        inner.buffer.push_back(event);
        true
    }

    pub async fn subscribe(&self, consumer_id: impl Into<String>) -> mpsc::UnboundedReceiver<EventBatch> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().await;
        inner
            .subscribers
            .insert(consumer_id.into(), Subscriber { sender: tx });
        rx
    }

    pub async fn unsubscribe(&self, consumer_id: &str) {
        let mut inner = self.inner.lock().await;
        inner.subscribers.remove(consumer_id);
    }

    pub async fn add_filter(
        &self,
        name: impl Into<String>,
        predicate: impl Fn(&StreamEvent) -> bool + Send + Sync + 'static,
    ) {
        let mut inner = self.inner.lock().await;
        inner.filters.insert(name.into(), Arc::new(predicate));
    }

    pub async fn remove_filter(&self, name: &str) {
        let mut inner = self.inner.lock().await;
        inner.filters.remove(name);
    }

    /// Drains up to `batch_size` events, orders them highest-priority-first
    /// (stable, so same-partition events keep their relative order unless
    /// split across priorities), persists them to the durable log, and hands
    /// the batch to every subscriber with retrying delivery.
    pub async fn flush(&self) {
        let (drained, subscriber_senders) = {
            let mut inner = self.inner.lock().await;
            if inner.buffer.is_empty() {
                return;
            }
            let n = self.config.batch_size.min(inner.buffer.len());
            let mut drained: Vec<StreamEvent> = inner.buffer.drain(..n).collect();
            drained.sort_by(|a, b| b.priority.cmp(&a.priority));
            let senders: Vec<(String, mpsc::UnboundedSender<EventBatch>)> = inner
                .subscribers
                .iter()
                .map(|(id, s)| (id.clone(), s.sender.clone()))
                .collect();
            (drained, senders)
        };

        for event in &drained {
            if let Err(e) = self.store.append_event(event) {
                warn!("failed to persist event {}: {}", event.event_id, e);
            }
        }

        if subscriber_senders.is_empty() {
            return;
        }

        let batch = EventBatch {
            batch_id: uuid::Uuid::new_v4().to_string(),
            stream_name: self.stream_name.clone(),
            timestamp: chrono::Utc::now(),
            event_count: drained.len(),
            events: drained,
        };

        for (consumer_id, sender) in subscriber_senders {
            self.deliver_with_retry(&consumer_id, &sender, batch.clone())
                .await;
        }
    }

    async fn deliver_with_retry(
        &self,
        consumer_id: &str,
        sender: &mpsc::UnboundedSender<EventBatch>,
        batch: EventBatch,
    ) {
        let mut attempt = 0;
        loop {
            match sender.send(batch.clone()) {
                Ok(()) => {
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(_) => {
                    if attempt >= self.config.max_retries {
                        self.delivery_failed.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            "giving up delivering batch {} to {} after {} attempts",
                            batch.batch_id, consumer_id, attempt
                        );
                        return;
                    }
                    self.retried.fetch_add(1, Ordering::Relaxed);
                    let delay = self.config.retry_delay * (attempt + 1);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    pub fn stats(&self) -> EventBusStats {
        EventBusStats {
            published: self.published.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            delivery_failed: self.delivery_failed.load(Ordering::Relaxed),
        }
    }

    pub async fn flush_all_pending(&self) {
        loop {
            let empty = {
                let inner = self.inner.lock().await;
                inner.buffer.is_empty()
            };
            if empty {
                return;
            }
            self.flush().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EventPriority;
    use std::time::Duration;

    fn test_config() -> EventBusConfig {
        EventBusConfig {
            buffer_size: 4,
            flush_interval: Duration::from_millis(10),
            batch_size: 10,
            max_retries: 2,
            retry_delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn publish_drops_when_buffer_full() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let bus = EventBus::new("test", test_config(), store);
        for i in 0..4 {
            let accepted = bus
                .publish(StreamEvent::new(
                    "t",
                    "p1",
                    EventPriority::Low,
                    serde_json::json!({ "i": i }),
                ))
                .await;
            assert!(accepted);
        }
        let accepted = bus
            .publish(StreamEvent::new(
                "t",
                "p1",
                EventPriority::Low,
                serde_json::json!({}),
            ))
            .await;
        assert!(!accepted);
        assert_eq!(bus.stats().dropped, 1);
    }

    #[tokio::test]
    async fn filter_rejection_does_not_count_as_dropped() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let bus = EventBus::new("test", test_config(), store);
        bus.add_filter("no-low", |e| e.priority != EventPriority::Low)
            .await;
        let accepted = bus
            .publish(StreamEvent::new(
                "t",
                "p1",
                EventPriority::Low,
                serde_json::json!({}),
            ))
            .await;
        assert!(!accepted);
        assert_eq!(bus.stats().dropped, 0);
    }

    #[tokio::test]
    async fn subscriber_receives_flushed_batch() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let bus = EventBus::new("test", test_config(), store);
        let mut rx = bus.subscribe("consumer-1").await;
        bus.publish(StreamEvent::new(
            "t",
            "p1",
            EventPriority::High,
            serde_json::json!({}),
        ))
        .await;
        bus.flush().await;
        let batch = rx.recv().await.expect("batch should arrive");
        assert_eq!(batch.event_count, 1);
        assert_eq!(bus.stats().delivered, 1);
    }
}
