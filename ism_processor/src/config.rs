use crate::pool::PoolConfig;
use ism_mq::ConsumerConfig;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const ROUTING_CONFIG_VAR: &str = "ISM_ROUTING_CONFIG";
pub const DATABASE_URL_VAR: &str = "ISM_DATABASE_URL";
pub const MONITOR_SELECTOR_VAR: &str = "ISM_MONITOR_SELECTOR";
pub const MAX_LOOPS_VAR: &str = "ISM_MAX_LOOPS";
pub const BACKOFF_INITIAL_VAR: &str = "ISM_BACKOFF_INITIAL_MS";
pub const BACKOFF_MAX_VAR: &str = "ISM_BACKOFF_MAX_MS";
pub const WORKERS_VAR: &str = "ISM_WORKERS";
pub const INPUT_SELECTOR_VAR: &str = "ISM_INPUT_SELECTOR";
pub const FORWARD_SELECTOR_VAR: &str = "ISM_FORWARD_SELECTOR";
pub const DEFAULT_MODEL_VAR: &str = "ISM_DEFAULT_MODEL";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("Invalid value for {var}: {value:?} ({reason})")]
pub struct RuntimeConfigError {
    pub var: &'static str,
    pub value: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    pub routing_config: PathBuf,
    pub database_url: String,
    /// Status events are only published when set.
    pub monitor_selector: Option<String>,
    /// Route the `run` service consumes.
    pub input_selector: String,
    /// New output rows are forwarded on this route when set.
    pub forward_selector: Option<String>,
    /// Model used when neither the processor nor the output state names one.
    pub default_model: String,
    pub max_loops: Option<u64>,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub workers: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            routing_config: PathBuf::from("routing.yaml"),
            database_url: "sqlite::memory:".to_owned(),
            monitor_selector: None,
            input_selector: "processor/input".to_owned(),
            forward_selector: None,
            default_model: "claude-sonnet-4-20250514".to_owned(),
            max_loops: None,
            backoff_initial: Duration::from_millis(100),
            backoff_max: Duration::from_secs(5),
            workers: 4,
        }
    }
}

fn parse<T>(var: &'static str, value: String) -> Result<T, RuntimeConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|err: T::Err| RuntimeConfigError {
        var,
        reason: err.to_string(),
        value,
    })
}

impl RuntimeConfig {
    pub fn from_env() -> Result<Self, RuntimeConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Builds the config from any variable source; unset or empty variables keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, RuntimeConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| lookup(var).filter(|value| !value.trim().is_empty());
        let mut config = Self::default();
        if let Some(value) = get(ROUTING_CONFIG_VAR) {
            config.routing_config = PathBuf::from(value);
        }
        if let Some(value) = get(DATABASE_URL_VAR) {
            config.database_url = value;
        }
        config.monitor_selector = get(MONITOR_SELECTOR_VAR);
        if let Some(value) = get(INPUT_SELECTOR_VAR) {
            config.input_selector = value;
        }
        config.forward_selector = get(FORWARD_SELECTOR_VAR);
        if let Some(value) = get(DEFAULT_MODEL_VAR) {
            config.default_model = value;
        }
        if let Some(value) = get(MAX_LOOPS_VAR) {
            config.max_loops = Some(parse(MAX_LOOPS_VAR, value)?);
        }
        if let Some(value) = get(BACKOFF_INITIAL_VAR) {
            config.backoff_initial = Duration::from_millis(parse(BACKOFF_INITIAL_VAR, value)?);
        }
        if let Some(value) = get(BACKOFF_MAX_VAR) {
            config.backoff_max = Duration::from_millis(parse(BACKOFF_MAX_VAR, value)?);
        }
        if let Some(value) = get(WORKERS_VAR) {
            let workers: usize = parse(WORKERS_VAR, value.clone())?;
            if workers == 0 {
                return Err(RuntimeConfigError {
                    var: WORKERS_VAR,
                    value,
                    reason: "must be at least 1".to_owned(),
                });
            }
            config.workers = workers;
        }
        Ok(config)
    }

    pub fn consumer_config(&self) -> ConsumerConfig {
        let config = ConsumerConfig::default().with_backoff(self.backoff_initial, self.backoff_max);
        match self.max_loops {
            Some(max_loops) => config.with_max_loops(max_loops),
            None => config,
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            workers: self.workers,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |var| vars.get(var).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = RuntimeConfig::from_lookup(lookup(&[(MONITOR_SELECTOR_VAR, " ")])).unwrap();
        assert_eq!(config, RuntimeConfig::default());
    }

    #[test]
    fn test_overrides() {
        let config = RuntimeConfig::from_lookup(lookup(&[
            (ROUTING_CONFIG_VAR, "/etc/ism/routes.yaml"),
            (DATABASE_URL_VAR, "sqlite://ism.db"),
            (MONITOR_SELECTOR_VAR, "processor/monitor"),
            (MAX_LOOPS_VAR, "10"),
            (BACKOFF_INITIAL_VAR, "50"),
            (BACKOFF_MAX_VAR, "2000"),
            (WORKERS_VAR, "8"),
            (INPUT_SELECTOR_VAR, "facts/input"),
            (FORWARD_SELECTOR_VAR, "facts/forward"),
        ]))
        .unwrap();
        assert_eq!(config.routing_config, PathBuf::from("/etc/ism/routes.yaml"));
        assert_eq!(config.monitor_selector.as_deref(), Some("processor/monitor"));
        assert_eq!(config.consumer_config().max_loops, Some(10));
        assert_eq!(config.consumer_config().backoff_initial, Duration::from_millis(50));
        assert_eq!(config.backoff_max, Duration::from_secs(2));
        assert_eq!(config.pool_config().workers, 8);
        assert_eq!(config.input_selector, "facts/input");
        assert_eq!(config.forward_selector.as_deref(), Some("facts/forward"));
        assert_eq!(config.default_model, RuntimeConfig::default().default_model);
    }

    #[test]
    fn test_invalid_values() {
        let err = RuntimeConfig::from_lookup(lookup(&[(MAX_LOOPS_VAR, "many")])).unwrap_err();
        assert_eq!(err.var, MAX_LOOPS_VAR);
        assert_eq!(err.value, "many");
        let err = RuntimeConfig::from_lookup(lookup(&[(WORKERS_VAR, "0")])).unwrap_err();
        assert_eq!(err.reason, "must be at least 1");
    }
}
