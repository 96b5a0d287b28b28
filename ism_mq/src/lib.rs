pub mod backoff;
pub mod config;
pub mod consumer;
pub mod memory;
pub mod monitor;
pub mod route;
pub mod router;

pub use backoff::Backoff;
pub use config::{ConfigError, RouteConfig, RoutingConfig};
pub use consumer::{Consumer, ConsumerConfig, ConsumerStats, MessageHandler, ShutdownHandle};
pub use ism_core::envelope::DecodeError;
pub use memory::{MemoryBroker, MemoryRoute, MemoryRouteFactory};
pub use monitor::{MonitorPublisher, RecordingReporter, StatusReporter};
pub use route::{Delivery, PublishReceipt, PublishStatus, Route, RouteDyn, RouteError};
pub use router::{RouteFactory, Router, RouterError};
