//! Runs input records through an executor and writes the results into an output State.

use crate::executor::{ExecutionRequest, ExecutionResponse, ExecutorDyn};
use crate::pool::WorkerPool;
use ism_core::keys::{self, KeyDefinition, STATE_ITEM_KEY, STATE_KEY};
use ism_core::response::{flatten, parse_response_json};
use ism_core::template::build_template_text;
use ism_core::{Record, State};
use ism_mq::StatusReporter;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseFormat {
    #[default]
    Json,
    Text,
}

/// Everything a processor needs besides its executor.
#[derive(Debug, Clone, Default)]
pub struct ProcessorProfile {
    pub processor_id: String,
    pub user_template: String,
    pub system_template: Option<String>,
    pub properties: Map<String, Value>,
    pub response_format: ResponseFormat,
}

impl ProcessorProfile {
    pub fn new(processor_id: impl Into<String>, user_template: impl Into<String>) -> Self {
        Self {
            processor_id: processor_id.into(),
            user_template: user_template.into(),
            ..Default::default()
        }
    }

    pub fn with_system_template(mut self, template: impl Into<String>) -> Self {
        self.system_template = Some(template.into());
        self
    }

    /// Sets the properties, picking up `response_format` when present.
    pub fn with_properties(mut self, properties: Map<String, Value>) -> Self {
        if let Some(format) = properties
            .get("response_format")
            .and_then(|value| serde_json::from_value::<ResponseFormat>(value.clone()).ok())
        {
            self.response_format = format;
        }
        self.properties = properties;
        self
    }

    pub fn with_response_format(mut self, format: ResponseFormat) -> Self {
        self.response_format = format;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error(transparent)]
    Core(#[from] ism_core::Error),
    #[error("Executor failed: {0:#}")]
    Executor(eyre::Report),
}

#[derive(Debug, Clone, PartialEq)]
pub enum EntryOutcome {
    Empty,
    Skipped { state_key: String },
    Applied(Vec<Record>),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutcome {
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Rows written to the output state, in write order.
    pub rows: Vec<Record>,
}

impl BatchOutcome {
    fn absorb(&mut self, outcome: EntryOutcome) {
        match outcome {
            EntryOutcome::Empty => {}
            EntryOutcome::Skipped { .. } => self.skipped += 1,
            EntryOutcome::Applied(rows) => {
                self.processed += 1;
                self.rows.extend(rows);
            }
        }
    }
}

/// An input that passed the empty and skip checks.
#[derive(Debug, Clone)]
struct PreparedEntry {
    input: Record,
    state_key: String,
    request: ExecutionRequest,
}

enum Plan {
    Empty,
    Skipped(String),
    Ready(PreparedEntry),
}

pub struct StateProcessor<R: StatusReporter> {
    profile: ProcessorProfile,
    executor: Arc<dyn ExecutorDyn>,
    reporter: R,
    route_id: Option<String>,
}

impl<R: StatusReporter> StateProcessor<R> {
    pub fn new(profile: ProcessorProfile, executor: Arc<dyn ExecutorDyn>, reporter: R) -> Self {
        Self {
            profile,
            executor,
            reporter,
            route_id: None,
        }
    }

    /// Route id used on failure events; defaults to the processor id.
    pub fn with_route_id(mut self, route_id: impl Into<String>) -> Self {
        self.route_id = Some(route_id.into());
        self
    }

    pub fn profile(&self) -> &ProcessorProfile {
        &self.profile
    }

    fn route_id(&self) -> &str {
        self.route_id.as_deref().unwrap_or(&self.profile.processor_id)
    }

    fn plan(&self, output: &State, input: &Record, force: bool) -> Result<Plan, ProcessError> {
        if input.is_empty() {
            return Ok(Plan::Empty);
        }
        let (state_key, _) = output.build_row_key_from_query_state(input)?;
        if !force && output.row_indexes(&state_key).is_some() {
            return Ok(Plan::Skipped(state_key));
        }
        let user_prompt = build_template_text(&self.profile.user_template, input);
        let system_prompt = self
            .profile
            .system_template
            .as_deref()
            .map(|template| build_template_text(template, input));
        Ok(Plan::Ready(PreparedEntry {
            input: input.clone(),
            state_key,
            request: ExecutionRequest {
                user_prompt,
                system_prompt,
                properties: self.profile.properties.clone(),
                query_state: input.clone(),
            },
        }))
    }

    fn build_rows(
        &self,
        output: &State,
        entry: &PreparedEntry,
        response: &ExecutionResponse,
    ) -> Result<Vec<Record>, ProcessError> {
        let (payloads, fan_out) = match self.profile.response_format {
            ResponseFormat::Text => (Vec::new(), false),
            ResponseFormat::Json => {
                let parsed = parse_response_json(&response.raw)?;
                let is_array = parsed.is_array();
                let rows = flatten(parsed);
                let fan_out = is_array || rows.len() > 1;
                (rows, fan_out)
            }
        };

        let inherited = inherited_fields(output, &entry.input)?;
        let mut envelope = Record::new();
        envelope.insert(STATE_KEY.to_owned(), Value::String(entry.state_key.clone()));
        envelope.insert("user_prompt".to_owned(), Value::String(entry.request.user_prompt.clone()));
        envelope.insert(
            "system_prompt".to_owned(),
            entry.request.system_prompt.clone().map_or(Value::Null, Value::String),
        );
        envelope.insert("response".to_owned(), Value::String(response.raw.clone()));
        envelope.insert("status".to_owned(), Value::String("Success".to_owned()));

        if payloads.is_empty() {
            let mut row = inherited;
            row.extend(envelope);
            return Ok(vec![row]);
        }
        Ok(payloads
            .into_iter()
            .map(|payload| {
                let item_key = fan_out.then(|| keys::hash_record(&payload));
                let mut row = payload;
                row.extend(inherited.clone());
                row.extend(envelope.clone());
                if let Some(item_key) = item_key {
                    row.insert(STATE_ITEM_KEY.to_owned(), Value::String(item_key));
                }
                row
            })
            .collect())
    }

    fn persist(&self, output: &mut State, rows: Vec<Record>, force: bool) -> Result<Vec<Record>, ProcessError> {
        let skip_dedup = force || rows.len() > 1;
        Ok(output.apply_query_states(rows, skip_dedup)?)
    }

    fn complete(
        &self,
        output: &mut State,
        entry: &PreparedEntry,
        response: eyre::Result<ExecutionResponse>,
        force: bool,
    ) -> Result<EntryOutcome, ProcessError> {
        let response = response.map_err(ProcessError::Executor)?;
        let rows = self.build_rows(output, entry, &response)?;
        let rows = self.persist(output, rows, force)?;
        tracing::debug!(
            processor_id = %self.profile.processor_id,
            state_key = %entry.state_key,
            rows = rows.len(),
            "query state processed"
        );
        Ok(EntryOutcome::Applied(rows))
    }

    pub async fn process_input_data_entry(
        &self,
        output: &mut State,
        input: &Record,
        force: bool,
    ) -> Result<EntryOutcome, ProcessError> {
        let entry = match self.plan(output, input, force)? {
            Plan::Empty => return Ok(EntryOutcome::Empty),
            Plan::Skipped(state_key) => {
                tracing::debug!(processor_id = %self.profile.processor_id, %state_key, "skipping processed query state");
                return Ok(EntryOutcome::Skipped { state_key });
            }
            Plan::Ready(entry) => entry,
        };
        let response = self.executor.execute(entry.request.clone()).await;
        self.complete(output, &entry, response, force)
    }

    async fn report_failure(&self, input: &Record, err: &ProcessError) {
        tracing::error!(processor_id = %self.profile.processor_id, error = %err, "query state failed");
        self.reporter
            .failed(self.route_id(), &err.to_string(), Some(Value::Object(input.clone())))
            .await;
    }

    /// Processes inputs one at a time. Failures are reported and counted.
    pub async fn process_input_data(&self, output: &mut State, inputs: &[Record], force: bool) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for input in inputs {
            match self.process_input_data_entry(output, input, force).await {
                Ok(entry) => outcome.absorb(entry),
                Err(err) => {
                    self.report_failure(input, &err).await;
                    outcome.failed += 1;
                }
            }
        }
        outcome
    }

    /// Executes on the pool; rows are built and written on this task in completion order.
    pub async fn process_input_data_parallel(
        &self,
        output: &mut State,
        inputs: &[Record],
        force: bool,
        pool: &WorkerPool,
    ) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let mut submitted = 0usize;

        for input in inputs {
            let entry = match self.plan(output, input, force) {
                Ok(Plan::Ready(entry)) => entry,
                Ok(Plan::Empty) => continue,
                Ok(Plan::Skipped(state_key)) => {
                    outcome.absorb(EntryOutcome::Skipped { state_key });
                    continue;
                }
                Err(err) => {
                    self.report_failure(input, &err).await;
                    outcome.failed += 1;
                    continue;
                }
            };
            let executor = self.executor.clone();
            let sender = sender.clone();
            let request = entry.request.clone();
            let job = async move {
                let response = executor.execute(request).await;
                if sender.send((entry, response)).is_err() {
                    tracing::warn!("query state result dropped, the batch is no longer collecting");
                }
            };
            match pool.submit(job).await {
                Ok(()) => submitted += 1,
                Err(err) => {
                    tracing::warn!(processor_id = %self.profile.processor_id, error = %err, "could not submit query state");
                    self.reporter
                        .failed(self.route_id(), &err.to_string(), Some(Value::Object(input.clone())))
                        .await;
                    outcome.failed += 1;
                }
            }
        }
        drop(sender);

        let mut received = 0usize;
        while received < submitted {
            let Some((entry, response)) = receiver.recv().await else {
                break;
            };
            received += 1;
            match self.complete(output, &entry, response, force) {
                Ok(entry) => outcome.absorb(entry),
                Err(err) => {
                    self.report_failure(&entry.input, &err).await;
                    outcome.failed += 1;
                }
            }
        }
        // jobs dropped by a stopped pool never answer
        outcome.failed += submitted - received;
        outcome
    }
}

/// Inheritance fields under their alias, then output key fields under their own name.
fn inherited_fields(output: &State, input: &Record) -> Result<Record, ProcessError> {
    let state_config = &output.config.state;
    let mut inherited = keys::extract_values_from_query_state_by_key_definition(
        input,
        &state_config.query_state_inheritance_key_definition,
    )?;
    let key_fields: Vec<KeyDefinition> = state_config
        .primary_key_definition
        .iter()
        .filter(|definition| input.get(&definition.name).is_some_and(|value| !value.is_null()))
        .map(|definition| KeyDefinition::new(definition.name.clone()))
        .collect();
    inherited.extend(keys::extract_values_from_query_state_by_key_definition(input, &key_fields)?);
    Ok(inherited)
}
