use crate::config::RouteConfig;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PublishStatus {
    Queued,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReceipt {
    pub id: String,
    pub status: PublishStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PublishReceipt {
    pub fn queued(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: PublishStatus::Queued,
            error: None,
        }
    }

    pub fn failed(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: PublishStatus::Failed,
            error: Some(error.into()),
        }
    }

    pub fn is_queued(&self) -> bool {
        self.status == PublishStatus::Queued
    }
}

/// One received message, handed back to [`Route::ack`] once processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub id: String,
    pub subject: String,
    pub payload: Vec<u8>,
    pub redelivered: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("Route {0} is not connected")]
    NotConnected(String),
    #[error("Route {0} was disconnected")]
    Disconnected(String),
    #[error("Timed out waiting on {0}")]
    Timeout(String),
    #[error("Transport error: {0}")]
    Transport(String),
}

impl RouteError {
    /// Errors after which a consumer loop cannot make progress.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, RouteError::Timeout(_))
    }
}

pub trait Route: Send + Sync {
    fn config(&self) -> &RouteConfig;
    fn connect(&self) -> impl Future<Output = Result<(), RouteError>> + Send;
    fn disconnect(&self) -> impl Future<Output = Result<(), RouteError>> + Send;
    fn subscribe(&self) -> impl Future<Output = Result<(), RouteError>> + Send;
    fn publish(&self, payload: Vec<u8>) -> impl Future<Output = Result<PublishReceipt, RouteError>> + Send;
    /// Waits up to `wait` for the next message; `None` when nothing arrived.
    fn consume(
        &self,
        wait: Duration,
    ) -> impl Future<Output = Result<Option<Delivery>, RouteError>> + Send;
    fn ack(&self, delivery: &Delivery) -> impl Future<Output = Result<bool, RouteError>> + Send;

    fn boxed(self) -> Box<dyn RouteDyn>
    where
        Self: Sized + 'static,
    {
        Box::new(self)
    }
}

pub trait RouteDyn: Send + Sync {
    fn config(&self) -> &RouteConfig;
    fn connect(&self) -> Pin<Box<dyn Future<Output = Result<(), RouteError>> + Send + '_>>;
    fn disconnect(&self) -> Pin<Box<dyn Future<Output = Result<(), RouteError>> + Send + '_>>;
    fn subscribe(&self) -> Pin<Box<dyn Future<Output = Result<(), RouteError>> + Send + '_>>;
    fn publish(
        &self,
        payload: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<PublishReceipt, RouteError>> + Send + '_>>;
    fn consume(
        &self,
        wait: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Delivery>, RouteError>> + Send + '_>>;
    fn ack<'a>(
        &'a self,
        delivery: &'a Delivery,
    ) -> Pin<Box<dyn Future<Output = Result<bool, RouteError>> + Send + 'a>>;

    fn selector(&self) -> &str {
        &self.config().selector
    }
}

impl<T: Route + 'static> RouteDyn for T {
    fn config(&self) -> &RouteConfig {
        Route::config(self)
    }

    fn connect(&self) -> Pin<Box<dyn Future<Output = Result<(), RouteError>> + Send + '_>> {
        Box::pin(Route::connect(self))
    }

    fn disconnect(&self) -> Pin<Box<dyn Future<Output = Result<(), RouteError>> + Send + '_>> {
        Box::pin(Route::disconnect(self))
    }

    fn subscribe(&self) -> Pin<Box<dyn Future<Output = Result<(), RouteError>> + Send + '_>> {
        Box::pin(Route::subscribe(self))
    }

    fn publish(
        &self,
        payload: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<PublishReceipt, RouteError>> + Send + '_>> {
        Box::pin(Route::publish(self, payload))
    }

    fn consume(
        &self,
        wait: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Delivery>, RouteError>> + Send + '_>> {
        Box::pin(Route::consume(self, wait))
    }

    fn ack<'a>(
        &'a self,
        delivery: &'a Delivery,
    ) -> Pin<Box<dyn Future<Output = Result<bool, RouteError>> + Send + 'a>> {
        Box::pin(Route::ack(self, delivery))
    }
}
