//! Status events published to the monitor route.

use crate::route::RouteDyn;
use ism_core::{Message, ProcessorStateMessage, ProcessorStatus};
use serde_json::Value;
use std::sync::Arc;

pub trait StatusReporter: Send + Sync {
    fn report(&self, message: ProcessorStateMessage) -> impl Future<Output = ()> + Send;

    fn pre_execute(&self, route_id: &str) -> impl Future<Output = ()> + Send {
        self.report(ProcessorStateMessage::new(route_id, ProcessorStatus::Queued))
    }

    fn intra_execute(&self, route_id: &str) -> impl Future<Output = ()> + Send {
        self.report(ProcessorStateMessage::new(route_id, ProcessorStatus::Running))
    }

    fn post_execute(&self, route_id: &str) -> impl Future<Output = ()> + Send {
        self.report(ProcessorStateMessage::new(route_id, ProcessorStatus::Completed))
    }

    fn failed(
        &self,
        route_id: &str,
        exception: &str,
        data: Option<Value>,
    ) -> impl Future<Output = ()> + Send {
        let mut message =
            ProcessorStateMessage::new(route_id, ProcessorStatus::Failed).with_exception(exception);
        message.data = data;
        self.report(message)
    }
}

/// Publishes status events on an optional monitor route.
///
/// Failures to publish are logged and never reach the caller.
#[derive(Clone, Default)]
pub struct MonitorPublisher {
    route: Option<Arc<dyn RouteDyn>>,
}

impl MonitorPublisher {
    pub fn new(route: Arc<dyn RouteDyn>) -> Self {
        Self { route: Some(route) }
    }

    /// Publisher that only logs.
    pub fn disabled() -> Self {
        Self { route: None }
    }
}

impl StatusReporter for MonitorPublisher {
    async fn report(&self, message: ProcessorStateMessage) {
        tracing::debug!(route_id = %message.route_id, status = %message.status, "status event");
        let Some(route) = &self.route else {
            return;
        };
        let route_id = message.route_id.clone();
        let payload = match Message::ProcessorState(message).encode() {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!(route_id = %route_id, error = %err, "failed to encode status event");
                return;
            }
        };
        match route.publish(payload).await {
            Ok(receipt) if receipt.is_queued() => {}
            Ok(receipt) => {
                tracing::warn!(route_id = %route_id, error = ?receipt.error, "monitor route rejected status event");
            }
            Err(err) => {
                tracing::warn!(route_id = %route_id, error = %err, "failed to publish status event");
            }
        }
    }
}

/// Keeps every reported event in memory.
#[derive(Clone, Default)]
pub struct RecordingReporter {
    events: Arc<std::sync::Mutex<Vec<ProcessorStateMessage>>>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProcessorStateMessage> {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub fn statuses(&self) -> Vec<ProcessorStatus> {
        self.events().into_iter().map(|event| event.status).collect()
    }
}

impl StatusReporter for RecordingReporter {
    async fn report(&self, message: ProcessorStateMessage) {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(message);
    }
}
