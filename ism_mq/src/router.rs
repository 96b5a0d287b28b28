use crate::config::{ConfigError, RouteConfig, RoutingConfig};
use crate::route::{PublishReceipt, RouteDyn, RouteError};
use ism_core::Message;
use serde_yaml::Value as YamlValue;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("No route for selector: {0}")]
    RouteNotFound(String),
    #[error("Route already registered for selector: {0}")]
    DuplicateRoute(String),
    #[error("Route {selector} failed: {source}")]
    Route {
        selector: String,
        source: RouteError,
    },
    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Factory could not build route {selector}: {reason}")]
    Factory { selector: String, reason: String },
}

/// Builds transport routes from their configuration.
pub trait RouteFactory: Send + Sync {
    fn create(&self, config: &RouteConfig) -> Result<Arc<dyn RouteDyn>, RouterError>;
}

/// Selector-indexed set of routes. Lookups never fall back to another route.
pub struct Router {
    routes: BTreeMap<String, Arc<dyn RouteDyn>>,
    factory: Arc<dyn RouteFactory>,
}

impl Router {
    pub fn new(factory: Arc<dyn RouteFactory>) -> Self {
        Self {
            routes: BTreeMap::new(),
            factory,
        }
    }

    pub fn from_config(config: &RoutingConfig, factory: Arc<dyn RouteFactory>) -> Result<Self, RouterError> {
        config.validate()?;
        let mut router = Self::new(factory);
        for route in config.routes() {
            router.register(route)?;
        }
        Ok(router)
    }

    pub fn register(&mut self, config: &RouteConfig) -> Result<Arc<dyn RouteDyn>, RouterError> {
        if self.routes.contains_key(&config.selector) {
            return Err(RouterError::DuplicateRoute(config.selector.clone()));
        }
        let route = self.factory.create(config)?;
        self.routes.insert(config.selector.clone(), route.clone());
        tracing::debug!(selector = %config.selector, destination = ?config.destination(), "route registered");
        Ok(route)
    }

    pub fn find_route(&self, selector: &str) -> Result<Arc<dyn RouteDyn>, RouterError> {
        self.routes
            .get(selector)
            .cloned()
            .ok_or_else(|| RouterError::RouteNotFound(selector.to_owned()))
    }

    pub fn selectors(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    /// Selectors whose routes share `subject` (a subject group).
    pub fn selectors_for_subject(&self, subject: &str) -> Vec<&str> {
        self.routes
            .iter()
            .filter(|(_, route)| route.config().destination() == Some(subject))
            .map(|(selector, _)| selector.as_str())
            .collect()
    }

    pub async fn connect_all(&self) -> Result<(), RouterError> {
        for (selector, route) in &self.routes {
            route.connect().await.map_err(|source| RouterError::Route {
                selector: selector.clone(),
                source,
            })?;
        }
        tracing::info!(routes = self.routes.len(), "routes connected");
        Ok(())
    }

    /// Disconnects every route, logging failures instead of stopping at the first.
    pub async fn disconnect_all(&self) {
        for (selector, route) in &self.routes {
            if let Err(err) = route.disconnect().await {
                tracing::warn!(selector = %selector, error = %err, "failed to disconnect route");
            }
        }
    }

    pub async fn publish(&self, selector: &str, message: &Message) -> Result<PublishReceipt, RouterError> {
        let route = self.find_route(selector)?;
        let payload = message.encode()?;
        route.publish(payload).await.map_err(|source| RouterError::Route {
            selector: selector.to_owned(),
            source,
        })
    }

    /// Registers a copy of `selector`'s route under `new_selector`.
    pub fn clone_route(
        &mut self,
        selector: &str,
        new_selector: &str,
        overrides: &BTreeMap<String, YamlValue>,
    ) -> Result<Arc<dyn RouteDyn>, RouterError> {
        let source = self.find_route(selector)?;
        let config = source.config().with_overrides(new_selector, overrides);
        self.register(&config)
    }
}
