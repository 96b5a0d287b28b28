//! In-process transport used by tests and single-binary deployments.

use crate::config::RouteConfig;
use crate::route::{Delivery, PublishReceipt, Route, RouteDyn, RouteError};
use crate::router::{RouteFactory, RouterError};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, VecDeque<Delivery>>,
    in_flight: HashMap<String, Delivery>,
}

struct BrokerInner {
    state: Mutex<BrokerState>,
    notify: Notify,
    max_depth: Option<usize>,
}

/// Per-subject FIFO queues with in-flight tracking.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::with_max_depth(None)
    }

    /// Publishing to a subject holding `max_depth` messages fails.
    pub fn with_max_depth(max_depth: Option<usize>) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                state: Mutex::new(BrokerState::default()),
                notify: Notify::new(),
                max_depth,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn enqueue(&self, subject: &str, payload: Vec<u8>) -> PublishReceipt {
        let id = uuid::Uuid::now_v7().to_string();
        {
            let mut state = self.lock();
            let queue = state.queues.entry(subject.to_owned()).or_default();
            if self.inner.max_depth.is_some_and(|max| queue.len() >= max) {
                tracing::warn!(subject, depth = queue.len(), "queue full, rejecting message");
                return PublishReceipt::failed(id, format!("queue {subject} is full"));
            }
            queue.push_back(Delivery {
                id: id.clone(),
                subject: subject.to_owned(),
                payload,
                redelivered: false,
            });
        }
        self.inner.notify.notify_waiters();
        PublishReceipt::queued(id)
    }

    fn try_dequeue(&self, subject: &str) -> Option<Delivery> {
        let mut state = self.lock();
        let delivery = state.queues.get_mut(subject)?.pop_front()?;
        state.in_flight.insert(delivery.id.clone(), delivery.clone());
        Some(delivery)
    }

    pub async fn dequeue(&self, subject: &str, wait: Duration) -> Option<Delivery> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(delivery) = self.try_dequeue(subject) {
                return Some(delivery);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_dequeue(subject);
            }
        }
    }

    pub fn ack(&self, delivery_id: &str) -> bool {
        self.lock().in_flight.remove(delivery_id).is_some()
    }

    /// Puts every unacknowledged message of `subject` back at the head of its queue.
    pub fn redeliver_unacked(&self, subject: &str) -> usize {
        let count = {
            let mut state = self.lock();
            let mut pending: Vec<Delivery> = Vec::new();
            state.in_flight.retain(|_, delivery| {
                if delivery.subject == subject {
                    pending.push(delivery.clone());
                    false
                } else {
                    true
                }
            });
            pending.sort_by(|a, b| a.id.cmp(&b.id));
            let queue = state.queues.entry(subject.to_owned()).or_default();
            for mut delivery in pending.iter().rev().cloned() {
                delivery.redelivered = true;
                queue.push_front(delivery);
            }
            pending.len()
        };
        if count > 0 {
            self.inner.notify.notify_waiters();
        }
        count
    }

    pub fn depth(&self, subject: &str) -> usize {
        self.lock().queues.get(subject).map_or(0, VecDeque::len)
    }

    pub fn in_flight(&self) -> usize {
        self.lock().in_flight.len()
    }
}

pub struct MemoryRoute {
    config: RouteConfig,
    broker: MemoryBroker,
    connected: AtomicBool,
    subscribed: AtomicBool,
}

impl MemoryRoute {
    pub fn new(config: RouteConfig, broker: MemoryBroker) -> Self {
        Self {
            config,
            broker,
            connected: AtomicBool::new(false),
            subscribed: AtomicBool::new(false),
        }
    }

    fn subject(&self) -> Result<&str, RouteError> {
        self.config
            .destination()
            .ok_or_else(|| RouteError::Transport(format!("route {} has no destination", self.config.selector)))
    }

    fn ensure_connected(&self) -> Result<(), RouteError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RouteError::NotConnected(self.config.selector.clone()))
        }
    }
}

impl Route for MemoryRoute {
    fn config(&self) -> &RouteConfig {
        &self.config
    }

    async fn connect(&self) -> Result<(), RouteError> {
        self.connected.store(true, Ordering::SeqCst);
        tracing::debug!(selector = %self.config.selector, "memory route connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), RouteError> {
        self.connected.store(false, Ordering::SeqCst);
        self.subscribed.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(&self) -> Result<(), RouteError> {
        self.ensure_connected()?;
        self.subscribed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(&self, payload: Vec<u8>) -> Result<PublishReceipt, RouteError> {
        self.ensure_connected()?;
        Ok(self.broker.enqueue(self.subject()?, payload))
    }

    async fn consume(&self, wait: Duration) -> Result<Option<Delivery>, RouteError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(RouteError::Disconnected(self.config.selector.clone()));
        }
        if !self.subscribed.swap(true, Ordering::SeqCst) {
            tracing::debug!(selector = %self.config.selector, "implicit subscribe on consume");
        }
        Ok(self.broker.dequeue(self.subject()?, wait).await)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<bool, RouteError> {
        Ok(self.broker.ack(&delivery.id))
    }
}

/// Builds [`MemoryRoute`]s that all share one broker.
#[derive(Clone, Default)]
pub struct MemoryRouteFactory {
    broker: MemoryBroker,
}

impl MemoryRouteFactory {
    pub fn new(broker: MemoryBroker) -> Self {
        Self { broker }
    }

    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }
}

impl RouteFactory for MemoryRouteFactory {
    fn create(&self, config: &RouteConfig) -> Result<Arc<dyn RouteDyn>, RouterError> {
        Ok(Arc::new(MemoryRoute::new(config.clone(), self.broker.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(broker: &MemoryBroker) -> Arc<dyn RouteDyn> {
        Arc::new(MemoryRoute::new(RouteConfig::new("test", "subject.test"), broker.clone()))
    }

    #[tokio::test]
    async fn test_publish_consume_ack() {
        let broker = MemoryBroker::new();
        let route = route(&broker);
        route.connect().await.unwrap();
        let receipt = route.publish(b"hello".to_vec()).await.unwrap();
        assert!(receipt.is_queued());

        let delivery = route.consume(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(delivery.payload, b"hello");
        assert_eq!(delivery.id, receipt.id);
        assert_eq!(broker.in_flight(), 1);
        assert!(route.ack(&delivery).await.unwrap());
        assert!(!route.ack(&delivery).await.unwrap());
        assert_eq!(broker.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_consume_times_out_empty() {
        let broker = MemoryBroker::new();
        let route = route(&broker);
        route.connect().await.unwrap();
        assert!(route.consume(Duration::from_millis(5)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_consume_wakes_on_publish() {
        let broker = MemoryBroker::new();
        let route = route(&broker);
        route.connect().await.unwrap();
        let publisher = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.enqueue("subject.test", b"late".to_vec());
        });
        let delivery = route.consume(Duration::from_secs(5)).await.unwrap().unwrap();
        assert_eq!(delivery.payload, b"late");
    }

    #[tokio::test]
    async fn test_unconnected_route_errors() {
        let broker = MemoryBroker::new();
        let route = route(&broker);
        let err = route.publish(Vec::new()).await.unwrap_err();
        assert_eq!(err, RouteError::NotConnected("test".into()));
        let err = route.consume(Duration::ZERO).await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_redelivery_and_depth_limit() {
        let broker = MemoryBroker::with_max_depth(Some(2));
        assert!(broker.enqueue("s", b"1".to_vec()).is_queued());
        assert!(broker.enqueue("s", b"2".to_vec()).is_queued());
        let rejected = broker.enqueue("s", b"3".to_vec());
        assert!(!rejected.is_queued());
        assert!(rejected.error.is_some());

        let first = broker.dequeue("s", Duration::ZERO).await.unwrap();
        assert_eq!(broker.redeliver_unacked("s"), 1);
        assert_eq!(broker.depth("s"), 2);
        let again = broker.dequeue("s", Duration::ZERO).await.unwrap();
        assert_eq!(again.id, first.id);
        assert!(again.redelivered);
    }
}
