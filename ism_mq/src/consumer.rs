//! Receive, decode, dispatch and acknowledge loop for one route.

use crate::backoff::Backoff;
use crate::monitor::StatusReporter;
use crate::route::{Delivery, RouteDyn};
use eyre::{Result, WrapErr};
use ism_core::{Message, QueryStateMessage};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

pub trait MessageHandler: Send {
    fn handle(&mut self, message: &QueryStateMessage) -> impl Future<Output = Result<()>> + Send;
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub receive_wait: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    /// Stops the loop after this many iterations.
    pub max_loops: Option<u64>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            receive_wait: Duration::from_millis(500),
            backoff_initial: Duration::from_millis(100),
            backoff_max: Duration::from_secs(5),
            max_loops: None,
        }
    }
}

impl ConsumerConfig {
    pub fn with_max_loops(mut self, max_loops: u64) -> Self {
        self.max_loops = Some(max_loops);
        self
    }

    pub fn with_receive_wait(mut self, wait: Duration) -> Self {
        self.receive_wait = wait;
        self
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.backoff_initial = initial;
        self.backoff_max = max;
        self
    }
}

/// Cloneable stop switch checked at the top of every loop iteration.
#[derive(Debug, Clone, Default)]
pub struct ShutdownHandle {
    stopped: Arc<AtomicBool>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub loops: u64,
    pub received: u64,
    pub handled: u64,
    pub failed: u64,
    pub empty_polls: u64,
}

pub struct Consumer<H: MessageHandler, R: StatusReporter> {
    route: Arc<dyn RouteDyn>,
    handler: H,
    reporter: R,
    config: ConsumerConfig,
    backoff: Backoff,
    shutdown: ShutdownHandle,
    stats: ConsumerStats,
}

impl<H: MessageHandler, R: StatusReporter> Consumer<H, R> {
    pub fn new(route: Arc<dyn RouteDyn>, handler: H, reporter: R, config: ConsumerConfig) -> Self {
        let backoff = Backoff::new(config.backoff_initial, config.backoff_max);
        Self {
            route,
            handler,
            reporter,
            config,
            backoff,
            shutdown: ShutdownHandle::default(),
            stats: ConsumerStats::default(),
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn stats(&self) -> &ConsumerStats {
        &self.stats
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn into_handler(self) -> H {
        self.handler
    }

    /// Runs until shutdown, `max_loops`, or a fatal transport error.
    pub async fn run(&mut self) -> Result<ConsumerStats> {
        let selector = self.route.selector().to_owned();
        tracing::info!(selector = %selector, "consumer started");
        loop {
            if self.shutdown.is_shutdown() {
                tracing::info!(selector = %selector, "consumer shutdown requested");
                break;
            }
            if self
                .config
                .max_loops
                .is_some_and(|max| self.stats.loops >= max)
            {
                break;
            }
            self.stats.loops += 1;

            match self.route.consume(self.config.receive_wait).await {
                Ok(Some(delivery)) => {
                    self.backoff.reset();
                    self.stats.received += 1;
                    self.dispatch(&delivery).await;
                    match self.route.ack(&delivery).await {
                        Ok(true) => {}
                        Ok(false) => {
                            tracing::warn!(selector = %selector, delivery_id = %delivery.id, "ack for unknown delivery");
                        }
                        Err(err) => {
                            tracing::warn!(selector = %selector, error = %err, "failed to ack delivery");
                        }
                    }
                }
                Ok(None) => {
                    self.stats.empty_polls += 1;
                    tokio::time::sleep(self.backoff.next_delay()).await;
                }
                Err(err) if !err.is_fatal() => {
                    tracing::debug!(selector = %selector, error = %err, "receive timed out");
                    tokio::time::sleep(self.backoff.next_delay()).await;
                }
                Err(err) => {
                    tracing::error!(selector = %selector, error = %err, "consumer stopped on transport error");
                    return Err(err).wrap_err_with(|| format!("consumer on {selector} stopped"));
                }
            }
        }
        tracing::info!(selector = %selector, stats = ?self.stats, "consumer finished");
        Ok(self.stats.clone())
    }

    async fn dispatch(&mut self, delivery: &Delivery) {
        let message = match Message::decode(&delivery.payload) {
            Ok(Message::QueryState(message)) => message,
            Ok(Message::ProcessorState(message)) => {
                self.reject(
                    &message.route_id,
                    "processor_state messages cannot be processed",
                    delivery,
                )
                .await;
                return;
            }
            Err(err) => {
                let route_id = raw_route_id(&delivery.payload)
                    .unwrap_or_else(|| self.route.selector().to_owned());
                self.reject(&route_id, &err.to_string(), delivery).await;
                return;
            }
        };

        let route_id = message.route_id.clone();
        self.reporter.pre_execute(&route_id).await;
        self.reporter.intra_execute(&route_id).await;
        match self.handler.handle(&message).await {
            Ok(()) => {
                self.stats.handled += 1;
                self.reporter.post_execute(&route_id).await;
            }
            Err(err) => {
                self.stats.failed += 1;
                tracing::error!(route_id = %route_id, error = %err, "handler failed");
                let data = serde_json::to_value(&message.query_state).ok();
                self.reporter
                    .failed(&route_id, &format!("{err:#}"), data)
                    .await;
            }
        }
    }

    async fn reject(&mut self, route_id: &str, reason: &str, delivery: &Delivery) {
        self.stats.failed += 1;
        tracing::warn!(route_id = %route_id, reason, "rejecting message");
        let data = serde_json::from_slice::<Value>(&delivery.payload)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&delivery.payload).into_owned()));
        self.reporter.failed(route_id, reason, Some(data)).await;
    }
}

fn raw_route_id(payload: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(payload).ok()?;
    value.get("route_id")?.as_str().map(str::to_owned)
}
