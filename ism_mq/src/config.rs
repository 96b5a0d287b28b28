//! YAML routing configuration.
//!
//! ```yaml
//! messageConfig:
//!   routes:
//!     - selector: processor/monitor
//!       name: monitor
//!       subject: ism.monitor
//!       url: nats://localhost:4222
//! ```

use serde::{Deserialize, Serialize};
use serde_yaml::Value as YamlValue;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read routing config {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("Invalid routing config: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Route {0} has neither a subject nor a topic")]
    MissingDestination(String),
    #[error("Duplicate route selector: {0}")]
    DuplicateSelector(String),
    #[error("Route with empty selector")]
    EmptySelector,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteConfig {
    pub selector: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Transport specific settings, passed through untouched.
    #[serde(flatten)]
    pub extra: BTreeMap<String, YamlValue>,
}

impl RouteConfig {
    pub fn new(selector: impl Into<String>, subject: impl Into<String>) -> Self {
        let selector = selector.into();
        Self {
            name: selector.clone(),
            selector,
            subject: Some(subject.into()),
            topic: None,
            url: None,
            extra: BTreeMap::new(),
        }
    }

    /// Subject, falling back to the topic.
    pub fn destination(&self) -> Option<&str> {
        self.subject.as_deref().or(self.topic.as_deref())
    }

    /// Copy under a new selector with `overrides` merged over the original fields.
    pub fn with_overrides(&self, selector: &str, overrides: &BTreeMap<String, YamlValue>) -> Self {
        let mut cloned = self.clone();
        cloned.selector = selector.to_owned();
        cloned.name = selector.to_owned();
        for (key, value) in overrides {
            let text = value.as_str().map(str::to_owned);
            match key.as_str() {
                "name" => {
                    if let Some(text) = text {
                        cloned.name = text;
                    }
                }
                "subject" => cloned.subject = text,
                "topic" => cloned.topic = text,
                "url" => cloned.url = text,
                _ => {
                    cloned.extra.insert(key.clone(), value.clone());
                }
            }
        }
        cloned
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingConfig {
    #[serde(default)]
    pub message_config: MessageConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageConfig {
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

impl RoutingConfig {
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let config: RoutingConfig = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&text)
    }

    pub fn routes(&self) -> &[RouteConfig] {
        &self.message_config.routes
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for route in self.routes() {
            if route.selector.is_empty() {
                return Err(ConfigError::EmptySelector);
            }
            if route.destination().is_none() {
                return Err(ConfigError::MissingDestination(route.selector.clone()));
            }
            if !seen.insert(route.selector.as_str()) {
                return Err(ConfigError::DuplicateSelector(route.selector.clone()));
            }
        }
        Ok(())
    }
}
