//! File and report helpers behind the `ism` binary.

use eyre::{Result, WrapErr};
use ism_core::{Message, Record, State};
use ism_mq::{Consumer, ConsumerStats, MemoryRouteFactory, MonitorPublisher, Router, RoutingConfig, ShutdownHandle};
use ism_processor::{ExecutorDyn, ProcessorHandler, RuntimeConfig, StorageBackend, WorkerPool};
use serde_json::Value;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateFormat {
    Json,
    Binary,
}

impl StateFormat {
    /// `.json` files are JSON, everything else is the binary format.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => StateFormat::Json,
            _ => StateFormat::Binary,
        }
    }
}

pub fn read_state(path: &Path) -> Result<State> {
    let state = match StateFormat::from_path(path) {
        StateFormat::Json => {
            let text = std::fs::read_to_string(path).wrap_err_with(|| format!("failed to read {}", path.display()))?;
            State::from_json(&text)?
        }
        StateFormat::Binary => {
            let bytes = std::fs::read(path).wrap_err_with(|| format!("failed to read {}", path.display()))?;
            State::from_binary(&bytes)?
        }
    };
    Ok(state)
}

pub fn write_state(state: &State, path: &Path, pretty: bool) -> Result<()> {
    let bytes = match StateFormat::from_path(path) {
        StateFormat::Json => state.to_json(pretty)?.into_bytes(),
        StateFormat::Binary => state.to_binary()?,
    };
    std::fs::write(path, bytes).wrap_err_with(|| format!("failed to write {}", path.display()))?;
    tracing::info!(state_id = %state.id, path = %path.display(), rows = state.count(), "state written");
    Ok(())
}

/// One tab separated line per route: selector, name, destination.
pub fn describe_routes(config: &RoutingConfig) -> Vec<String> {
    config
        .routes()
        .iter()
        .map(|route| {
            format!(
                "{}\t{}\t{}",
                route.selector,
                if route.name.is_empty() { "-" } else { route.name.as_str() },
                route.destination().unwrap_or("-")
            )
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct StateSummary {
    pub id: String,
    pub state_type: String,
    pub rows: usize,
    pub keys: usize,
    pub columns: Vec<(String, String)>,
}

impl fmt::Display for StateSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "state:   {}", self.id)?;
        writeln!(f, "type:    {}", self.state_type)?;
        writeln!(f, "rows:    {}", self.rows)?;
        writeln!(f, "keys:    {}", self.keys)?;
        write!(f, "columns:")?;
        for (name, data_type) in &self.columns {
            write!(f, "\n  {name}: {data_type}")?;
        }
        Ok(())
    }
}

pub fn summarize_state(state: &State) -> StateSummary {
    StateSummary {
        id: state.id.clone(),
        state_type: state.state_type().to_string(),
        rows: state.count(),
        keys: state.row_keys().count(),
        columns: state
            .columns()
            .map(|column| {
                let data_type = serde_json::to_value(&column.data_type)
                    .ok()
                    .and_then(|value| value.as_str().map(str::to_owned))
                    .unwrap_or_default();
                (column.name.clone(), data_type)
            })
            .collect(),
    }
}

pub fn preview_rows(state: &State, limit: usize) -> Vec<Record> {
    state.iter_query_states().take(limit).collect()
}

pub fn render_rows(rows: &[Record]) -> Result<String> {
    let rows: Vec<Value> = rows.iter().cloned().map(Value::Object).collect();
    Ok(serde_json::to_string_pretty(&rows)?)
}

/// Publishes every envelope of a JSON lines file on `selector`; blank lines are skipped.
pub async fn enqueue_messages(router: &Router, selector: &str, path: &Path) -> Result<usize> {
    let text = std::fs::read_to_string(path).wrap_err_with(|| format!("failed to read {}", path.display()))?;
    let mut count = 0;
    for (number, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let message = Message::decode(line.as_bytes())
            .wrap_err_with(|| format!("{}:{}: invalid message", path.display(), number + 1))?;
        let receipt = router.publish(selector, &message).await?;
        if !receipt.is_queued() {
            eyre::bail!(
                "route {selector} refused message {}: {}",
                number + 1,
                receipt.error.unwrap_or_default()
            );
        }
        count += 1;
    }
    Ok(count)
}

/// Runs one consumer on the input route until it is shut down or hits its loop limit.
///
/// Routes are served by the in-process broker; `enqueue` preloads the input route.
pub async fn run_service<S: StorageBackend>(
    config: &RuntimeConfig,
    routing: &RoutingConfig,
    storage: S,
    executor: Arc<dyn ExecutorDyn>,
    enqueue: Option<&Path>,
    on_start: impl FnOnce(ShutdownHandle),
) -> Result<ConsumerStats> {
    let router = Arc::new(Router::from_config(routing, Arc::new(MemoryRouteFactory::default()))?);
    router.connect_all().await?;
    if let Some(path) = enqueue {
        let count = enqueue_messages(&router, &config.input_selector, path).await?;
        tracing::info!(count, selector = %config.input_selector, "messages enqueued");
    }

    let reporter = match &config.monitor_selector {
        Some(selector) => MonitorPublisher::new(router.find_route(selector)?),
        None => MonitorPublisher::disabled(),
    };
    let pool = Arc::new(WorkerPool::new(config.pool_config()));
    let mut handler = ProcessorHandler::new(storage, executor, reporter.clone()).with_pool(pool.clone());
    if let Some(selector) = &config.forward_selector {
        router.find_route(selector)?;
        handler = handler.with_forwarding(router.clone(), selector.clone());
    }

    let input = router.find_route(&config.input_selector)?;
    let mut consumer = Consumer::new(input, handler, reporter, config.consumer_config());
    on_start(consumer.shutdown_handle());
    let stats = consumer.run().await;

    drop(consumer);
    if let Ok(pool) = Arc::try_unwrap(pool) {
        pool.shutdown().await;
    }
    router.disconnect_all().await;
    stats
}
