//! Persistence for states, templates, processors, processor-state routes and workflows.
//!
//! Each concern is a narrow trait; [`Storage`] composes one implementation per
//! concern and forwards every call. Implementations hand out owned copies so a
//! caller can mutate a [`State`] without holding any storage lock.

pub mod memory;
pub mod models;
pub mod sqlite;

pub use memory::MemoryStorage;
pub use models::{Processor, ProcessorProvider, Template, Workflow};
pub use sqlite::SqliteStorage;

use ism_core::{ProcessorState, ProcessorStatus, State, StateDirection, TransitionError};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("State error: {0}")]
    State(#[from] ism_core::Error),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("Corrupt {kind} record {id}: {reason}")]
    Corrupt {
        kind: &'static str,
        id: String,
        reason: String,
    },
}

impl StorageError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        StorageError::NotFound { kind, id: id.into() }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessorStateQuery {
    /// The single association behind a route id in one direction.
    RouteId {
        route_id: String,
        direction: StateDirection,
    },
    Processor {
        processor_id: String,
        direction: Option<StateDirection>,
    },
    State {
        state_id: String,
        direction: Option<StateDirection>,
    },
}

impl ProcessorStateQuery {
    pub fn matches(&self, candidate: &ProcessorState) -> bool {
        match self {
            ProcessorStateQuery::RouteId { route_id, direction } => {
                candidate.direction == *direction && candidate.route_id() == *route_id
            }
            ProcessorStateQuery::Processor {
                processor_id,
                direction,
            } => candidate.processor_id == *processor_id && direction.is_none_or(|d| d == candidate.direction),
            ProcessorStateQuery::State { state_id, direction } => {
                candidate.state_id == *state_id && direction.is_none_or(|d| d == candidate.direction)
            }
        }
    }
}

pub trait StateStorage: Send + Sync {
    /// Loads a state; without `load_data` only columns and config come back.
    fn load_state(&self, id: &str, load_data: bool) -> impl Future<Output = Result<State, StorageError>> + Send;

    fn save_state(&self, state: &State) -> impl Future<Output = Result<State, StorageError>> + Send;
}

pub trait TemplateStorage: Send + Sync {
    fn fetch_template(&self, id: &str) -> impl Future<Output = Result<Template, StorageError>> + Send;

    fn insert_template(&self, template: &Template) -> impl Future<Output = Result<Template, StorageError>> + Send;
}

pub trait ProcessorStorage: Send + Sync {
    fn fetch_processor(&self, id: &str) -> impl Future<Output = Result<Processor, StorageError>> + Send;

    fn fetch_processor_provider(
        &self,
        id: &str,
    ) -> impl Future<Output = Result<ProcessorProvider, StorageError>> + Send;

    fn insert_processor(&self, processor: &Processor) -> impl Future<Output = Result<Processor, StorageError>> + Send;

    fn insert_processor_provider(
        &self,
        provider: &ProcessorProvider,
    ) -> impl Future<Output = Result<ProcessorProvider, StorageError>> + Send;
}

pub trait ProcessorStateRouteStorage: Send + Sync {
    fn fetch_processor_state_route(
        &self,
        query: &ProcessorStateQuery,
    ) -> impl Future<Output = Result<Vec<ProcessorState>, StorageError>> + Send;

    fn upsert_processor_state(
        &self,
        state: &ProcessorState,
    ) -> impl Future<Output = Result<ProcessorState, StorageError>> + Send;

    /// Moves the association to `status`, refusing transitions the lifecycle forbids.
    fn update_processor_status(
        &self,
        route_id: &str,
        direction: StateDirection,
        status: ProcessorStatus,
    ) -> impl Future<Output = Result<ProcessorState, StorageError>> + Send {
        async move {
            let query = ProcessorStateQuery::RouteId {
                route_id: route_id.to_owned(),
                direction,
            };
            let mut current = self
                .fetch_processor_state_route(&query)
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| StorageError::not_found("processor state", route_id))?;
            current.transition(status)?;
            self.upsert_processor_state(&current).await
        }
    }

    /// Administrative restart: puts the association back to `CREATED` whatever its status.
    fn reset_processor_state(
        &self,
        route_id: &str,
        direction: StateDirection,
    ) -> impl Future<Output = Result<ProcessorState, StorageError>> + Send {
        async move {
            let query = ProcessorStateQuery::RouteId {
                route_id: route_id.to_owned(),
                direction,
            };
            let mut current = self
                .fetch_processor_state_route(&query)
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| StorageError::not_found("processor state", route_id))?;
            tracing::info!(route_id, from = %current.status, "resetting processor state");
            current.reset();
            self.upsert_processor_state(&current).await
        }
    }
}

pub trait WorkflowStorage: Send + Sync {
    fn fetch_workflow(&self, id: &str) -> impl Future<Output = Result<Workflow, StorageError>> + Send;

    fn insert_workflow(&self, workflow: &Workflow) -> impl Future<Output = Result<Workflow, StorageError>> + Send;
}

/// Everything the message handler needs from persistence.
pub trait StorageBackend:
    StateStorage
    + TemplateStorage
    + ProcessorStorage
    + ProcessorStateRouteStorage
    + WorkflowStorage
    + Clone
    + 'static
{
}

impl<T> StorageBackend for T where
    T: StateStorage
        + TemplateStorage
        + ProcessorStorage
        + ProcessorStateRouteStorage
        + WorkflowStorage
        + Clone
        + 'static
{
}

/// Composes one implementation per concern.
#[derive(Debug, Clone)]
pub struct Storage<S, T, P, R, W> {
    pub states: S,
    pub templates: T,
    pub processors: P,
    pub routes: R,
    pub workflows: W,
}

impl<S, T, P, R, W> Storage<S, T, P, R, W> {
    pub fn new(states: S, templates: T, processors: P, routes: R, workflows: W) -> Self {
        Self {
            states,
            templates,
            processors,
            routes,
            workflows,
        }
    }
}

impl<B: Clone> Storage<B, B, B, B, B> {
    /// Every concern served by the same backend.
    pub fn from_single(backend: B) -> Self {
        Self::new(backend.clone(), backend.clone(), backend.clone(), backend.clone(), backend)
    }
}

impl<S: StateStorage, T: Send + Sync, P: Send + Sync, R: Send + Sync, W: Send + Sync> StateStorage
    for Storage<S, T, P, R, W>
{
    async fn load_state(&self, id: &str, load_data: bool) -> Result<State, StorageError> {
        self.states.load_state(id, load_data).await
    }

    async fn save_state(&self, state: &State) -> Result<State, StorageError> {
        self.states.save_state(state).await
    }
}

impl<S: Send + Sync, T: TemplateStorage, P: Send + Sync, R: Send + Sync, W: Send + Sync> TemplateStorage
    for Storage<S, T, P, R, W>
{
    async fn fetch_template(&self, id: &str) -> Result<Template, StorageError> {
        self.templates.fetch_template(id).await
    }

    async fn insert_template(&self, template: &Template) -> Result<Template, StorageError> {
        self.templates.insert_template(template).await
    }
}

impl<S: Send + Sync, T: Send + Sync, P: ProcessorStorage, R: Send + Sync, W: Send + Sync> ProcessorStorage
    for Storage<S, T, P, R, W>
{
    async fn fetch_processor(&self, id: &str) -> Result<Processor, StorageError> {
        self.processors.fetch_processor(id).await
    }

    async fn fetch_processor_provider(&self, id: &str) -> Result<ProcessorProvider, StorageError> {
        self.processors.fetch_processor_provider(id).await
    }

    async fn insert_processor(&self, processor: &Processor) -> Result<Processor, StorageError> {
        self.processors.insert_processor(processor).await
    }

    async fn insert_processor_provider(&self, provider: &ProcessorProvider) -> Result<ProcessorProvider, StorageError> {
        self.processors.insert_processor_provider(provider).await
    }
}

impl<S: Send + Sync, T: Send + Sync, P: Send + Sync, R: ProcessorStateRouteStorage, W: Send + Sync>
    ProcessorStateRouteStorage for Storage<S, T, P, R, W>
{
    async fn fetch_processor_state_route(
        &self,
        query: &ProcessorStateQuery,
    ) -> Result<Vec<ProcessorState>, StorageError> {
        self.routes.fetch_processor_state_route(query).await
    }

    async fn upsert_processor_state(&self, state: &ProcessorState) -> Result<ProcessorState, StorageError> {
        self.routes.upsert_processor_state(state).await
    }

    async fn update_processor_status(
        &self,
        route_id: &str,
        direction: StateDirection,
        status: ProcessorStatus,
    ) -> Result<ProcessorState, StorageError> {
        self.routes.update_processor_status(route_id, direction, status).await
    }

    async fn reset_processor_state(
        &self,
        route_id: &str,
        direction: StateDirection,
    ) -> Result<ProcessorState, StorageError> {
        self.routes.reset_processor_state(route_id, direction).await
    }
}

impl<S: Send + Sync, T: Send + Sync, P: Send + Sync, R: Send + Sync, W: WorkflowStorage> WorkflowStorage
    for Storage<S, T, P, R, W>
{
    async fn fetch_workflow(&self, id: &str) -> Result<Workflow, StorageError> {
        self.workflows.fetch_workflow(id).await
    }

    async fn insert_workflow(&self, workflow: &Workflow) -> Result<Workflow, StorageError> {
        self.workflows.insert_workflow(workflow).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ism_core::{Config, StateConfig};

    #[tokio::test]
    async fn test_facade_delegates_per_concern() {
        let states = MemoryStorage::new();
        let rest = MemoryStorage::new();
        let storage = Storage::new(states.clone(), rest.clone(), rest.clone(), rest.clone(), rest.clone());

        storage
            .save_state(&State::new("animals", Config::new(StateConfig::default())))
            .await
            .unwrap();
        storage
            .insert_template(&Template::new("t1", "user_template", "{animal}"))
            .await
            .unwrap();

        assert!(states.load_state("animals", true).await.is_ok());
        assert!(rest.load_state("animals", true).await.unwrap_err().is_not_found());
        assert!(rest.fetch_template("t1").await.is_ok());
        assert!(states.fetch_template("t1").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_status_update_enforces_lifecycle() {
        let storage = Storage::from_single(MemoryStorage::new());
        storage
            .upsert_processor_state(&ProcessorState::new("p1", "s1", StateDirection::Input))
            .await
            .unwrap();

        let running = storage
            .update_processor_status("s1:p1", StateDirection::Input, ProcessorStatus::Running)
            .await
            .unwrap();
        assert_eq!(running.status, ProcessorStatus::Running);

        let err = storage
            .update_processor_status("s1:p1", StateDirection::Input, ProcessorStatus::Created)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Transition(_)));

        let missing = storage
            .update_processor_status("s1:p1", StateDirection::Output, ProcessorStatus::Running)
            .await
            .unwrap_err();
        assert!(missing.is_not_found());
    }

    #[test]
    fn test_query_matching() {
        let input = ProcessorState::new("p1", "s1", StateDirection::Input);
        let by_route = ProcessorStateQuery::RouteId {
            route_id: "s1:p1".into(),
            direction: StateDirection::Input,
        };
        assert!(by_route.matches(&input));
        let by_state = ProcessorStateQuery::State {
            state_id: "s1".into(),
            direction: Some(StateDirection::Output),
        };
        assert!(!by_state.matches(&input));
        let by_processor = ProcessorStateQuery::Processor {
            processor_id: "p1".into(),
            direction: None,
        };
        assert!(by_processor.matches(&input));
    }
}
