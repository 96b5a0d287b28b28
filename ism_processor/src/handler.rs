//! Binds the consumer loop to processors stored in a [`StorageBackend`].

use crate::executor::ExecutorDyn;
use crate::pool::WorkerPool;
use crate::processor::{BatchOutcome, ProcessorProfile, StateProcessor};
use crate::storage::{Processor, ProcessorStateQuery, StorageBackend};
use eyre::{OptionExt, Result, WrapErr};
use ism_core::{
    Message, ProcessorState, ProcessorStatus, QueryStateMessage, RouteId, State, StateDirection,
};
use ism_mq::{MessageHandler, Router, StatusReporter};
use serde_json::{Map, Value};
use std::sync::Arc;

pub struct ProcessorHandler<S: StorageBackend, R: StatusReporter + Clone> {
    storage: S,
    executor: Arc<dyn ExecutorDyn>,
    reporter: R,
    forward: Option<(Arc<Router>, String)>,
    pool: Option<Arc<WorkerPool>>,
}

impl<S: StorageBackend, R: StatusReporter + Clone> ProcessorHandler<S, R> {
    pub fn new(storage: S, executor: Arc<dyn ExecutorDyn>, reporter: R) -> Self {
        Self {
            storage,
            executor,
            reporter,
            forward: None,
            pool: None,
        }
    }

    /// Executes batches on `pool` instead of one record at a time.
    pub fn with_pool(mut self, pool: Arc<WorkerPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// New output rows are published on `selector` for every downstream processor.
    pub fn with_forwarding(mut self, router: Arc<Router>, selector: impl Into<String>) -> Self {
        self.forward = Some((router, selector.into()));
        self
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    async fn template_content(&self, candidates: [Option<&String>; 3]) -> Result<Option<String>> {
        let Some(id) = candidates.into_iter().flatten().next() else {
            return Ok(None);
        };
        let template = self
            .storage
            .fetch_template(id)
            .await
            .wrap_err_with(|| format!("failed to fetch template {id}"))?;
        Ok(Some(template.template_content))
    }

    async fn profile(&self, processor: &Processor, output: &State) -> Result<ProcessorProfile> {
        let provider = self
            .storage
            .fetch_processor_provider(&processor.provider_id)
            .await
            .wrap_err("failed to fetch processor provider")?;
        let lm = output.config.lm();
        let user_template = self
            .template_content([
                processor.user_template_id.as_ref(),
                provider.user_template_id.as_ref(),
                lm.and_then(|lm| lm.user_template_path.as_ref()),
            ])
            .await?
            .ok_or_eyre(format!("processor {} has no user template", processor.id))?;
        let system_template = self
            .template_content([
                processor.system_template_id.as_ref(),
                provider.system_template_id.as_ref(),
                lm.and_then(|lm| lm.system_template_path.as_ref()),
            ])
            .await?;

        let mut properties = Map::new();
        if let Some(lm) = lm {
            if let Some(model_name) = &lm.model_name {
                properties.insert("model_name".to_owned(), Value::from(model_name.clone()));
            }
            if let Some(temperature) = lm.temperature {
                properties.insert("temperature".to_owned(), Value::from(temperature));
            }
            if let Some(max_tokens) = lm.max_tokens {
                properties.insert("max_tokens".to_owned(), Value::from(max_tokens));
            }
        }
        properties.extend(processor.properties.clone());

        let mut profile = ProcessorProfile::new(processor.id.clone(), user_template).with_properties(properties);
        profile.system_template = system_template;
        Ok(profile)
    }

    async fn output_state(&self, processor_id: &str) -> Result<State> {
        let query = ProcessorStateQuery::Processor {
            processor_id: processor_id.to_owned(),
            direction: Some(StateDirection::Output),
        };
        let output = self
            .storage
            .fetch_processor_state_route(&query)
            .await?
            .into_iter()
            .next()
            .ok_or_eyre(format!("processor {processor_id} has no output state"))?;
        Ok(self.storage.load_state(&output.state_id, true).await?)
    }

    /// Moves the input association to RUNNING. A completed route starts a new run;
    /// failed and terminated routes stay closed until reset through storage.
    async fn start_run(&self, route_id: &RouteId) -> Result<ProcessorState> {
        let query = ProcessorStateQuery::RouteId {
            route_id: route_id.to_string(),
            direction: StateDirection::Input,
        };
        let mut input = match self.storage.fetch_processor_state_route(&query).await?.into_iter().next() {
            Some(input) => input,
            None => ProcessorState::new(&route_id.processor_id, &route_id.state_id, StateDirection::Input),
        };
        match input.status {
            ProcessorStatus::Terminate => eyre::bail!("processor state {route_id} is terminated"),
            ProcessorStatus::Completed => {
                tracing::info!(route_id = %route_id, "starting a new run on a completed processor state");
                input.reset();
            }
            _ => {}
        }
        input
            .transition(ProcessorStatus::Running)
            .wrap_err_with(|| format!("processor state {route_id} cannot run"))?;
        Ok(self.storage.upsert_processor_state(&input).await?)
    }

    async fn run(&self, message: &QueryStateMessage, input: &mut ProcessorState) -> Result<BatchOutcome> {
        let processor = self
            .storage
            .fetch_processor(&input.processor_id)
            .await
            .wrap_err("failed to fetch processor")?;
        let mut output = self.output_state(&processor.id).await?;
        let profile = self.profile(&processor, &output).await?;
        let force = profile.properties.get("force").and_then(Value::as_bool).unwrap_or(false);

        let state_processor =
            StateProcessor::new(profile, self.executor.clone(), self.reporter.clone()).with_route_id(&message.route_id);
        let outcome = match &self.pool {
            Some(pool) => {
                state_processor
                    .process_input_data_parallel(&mut output, &message.query_state, force, pool)
                    .await
            }
            None => {
                state_processor
                    .process_input_data(&mut output, &message.query_state, force)
                    .await
            }
        };
        self.storage.save_state(&output).await.wrap_err("failed to save output state")?;

        input.record_progress(input.current_index + message.query_state.len() as u64, output.count() as u64);
        let output_query = ProcessorStateQuery::RouteId {
            route_id: format!("{}:{}", output.id, processor.id),
            direction: StateDirection::Output,
        };
        for mut association in self.storage.fetch_processor_state_route(&output_query).await? {
            association.record_progress(output.count() as u64, output.count() as u64);
            self.storage.upsert_processor_state(&association).await?;
        }

        tracing::info!(
            route_id = %message.route_id,
            output_state = %output.id,
            processed = outcome.processed,
            skipped = outcome.skipped,
            failed = outcome.failed,
            "query states processed"
        );
        self.forward_rows(&output, &outcome).await?;
        Ok(outcome)
    }

    async fn forward_rows(&self, output: &State, outcome: &BatchOutcome) -> Result<()> {
        let Some((router, selector)) = &self.forward else {
            return Ok(());
        };
        if outcome.rows.is_empty() {
            return Ok(());
        }
        let query = ProcessorStateQuery::State {
            state_id: output.id.clone(),
            direction: Some(StateDirection::Input),
        };
        for downstream in self.storage.fetch_processor_state_route(&query).await? {
            let message = Message::QueryState(QueryStateMessage::new(downstream.route_id(), outcome.rows.clone()));
            let receipt = router
                .publish(selector, &message)
                .await
                .wrap_err_with(|| format!("failed to forward rows to {}", downstream.route_id()))?;
            if !receipt.is_queued() {
                eyre::bail!(
                    "route {selector} refused rows for {}: {}",
                    downstream.route_id(),
                    receipt.error.unwrap_or_default()
                );
            }
            tracing::debug!(route_id = %downstream.route_id(), rows = outcome.rows.len(), "rows forwarded");
        }
        Ok(())
    }
}

impl<S: StorageBackend, R: StatusReporter + Clone> MessageHandler for ProcessorHandler<S, R> {
    async fn handle(&mut self, message: &QueryStateMessage) -> Result<()> {
        let route_id: RouteId = message.route_id.parse()?;
        let mut input = self.start_run(&route_id).await?;
        match self.run(message, &mut input).await {
            Ok(_) => {
                input.transition(ProcessorStatus::Completed)?;
                self.storage.upsert_processor_state(&input).await?;
                Ok(())
            }
            Err(err) => {
                if let Err(status_err) = self
                    .storage
                    .update_processor_status(&route_id.to_string(), StateDirection::Input, ProcessorStatus::Failed)
                    .await
                {
                    tracing::error!(route_id = %route_id, error = %status_err, "failed to mark processor state as failed");
                }
                Err(err)
            }
        }
    }
}

