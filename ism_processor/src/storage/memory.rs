use super::{
    Processor, ProcessorProvider, ProcessorStateQuery, ProcessorStateRouteStorage, ProcessorStorage, StateStorage,
    StorageError, Template, TemplateStorage, Workflow, WorkflowStorage,
};
use ism_core::{ProcessorState, State, StateDirection};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

type ProcessorStateKey = (String, String, StateDirection);

#[derive(Default)]
struct Tables {
    states: HashMap<String, State>,
    templates: HashMap<String, Template>,
    processors: HashMap<String, Processor>,
    providers: HashMap<String, ProcessorProvider>,
    processor_states: Vec<(ProcessorStateKey, ProcessorState)>,
    workflows: HashMap<String, Workflow>,
}

/// Process-local storage; clones share the same tables.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    tables: Arc<RwLock<Tables>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

fn processor_state_key(state: &ProcessorState) -> ProcessorStateKey {
    (state.processor_id.clone(), state.state_id.clone(), state.direction)
}

impl StateStorage for MemoryStorage {
    async fn load_state(&self, id: &str, load_data: bool) -> Result<State, StorageError> {
        let tables = self.tables.read().await;
        let state = tables
            .states
            .get(id)
            .ok_or_else(|| StorageError::not_found("state", id))?;
        Ok(if load_data { state.clone() } else { state.metadata_only() })
    }

    async fn save_state(&self, state: &State) -> Result<State, StorageError> {
        let mut tables = self.tables.write().await;
        tables.states.insert(state.id.clone(), state.clone());
        Ok(state.clone())
    }
}

impl TemplateStorage for MemoryStorage {
    async fn fetch_template(&self, id: &str) -> Result<Template, StorageError> {
        self.tables
            .read()
            .await
            .templates
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("template", id))
    }

    async fn insert_template(&self, template: &Template) -> Result<Template, StorageError> {
        let mut tables = self.tables.write().await;
        tables.templates.insert(template.id.clone(), template.clone());
        Ok(template.clone())
    }
}

impl ProcessorStorage for MemoryStorage {
    async fn fetch_processor(&self, id: &str) -> Result<Processor, StorageError> {
        self.tables
            .read()
            .await
            .processors
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("processor", id))
    }

    async fn fetch_processor_provider(&self, id: &str) -> Result<ProcessorProvider, StorageError> {
        self.tables
            .read()
            .await
            .providers
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("processor provider", id))
    }

    async fn insert_processor(&self, processor: &Processor) -> Result<Processor, StorageError> {
        let mut tables = self.tables.write().await;
        tables.processors.insert(processor.id.clone(), processor.clone());
        Ok(processor.clone())
    }

    async fn insert_processor_provider(&self, provider: &ProcessorProvider) -> Result<ProcessorProvider, StorageError> {
        let mut tables = self.tables.write().await;
        tables.providers.insert(provider.id.clone(), provider.clone());
        Ok(provider.clone())
    }
}

impl ProcessorStateRouteStorage for MemoryStorage {
    async fn fetch_processor_state_route(
        &self,
        query: &ProcessorStateQuery,
    ) -> Result<Vec<ProcessorState>, StorageError> {
        let tables = self.tables.read().await;
        Ok(tables
            .processor_states
            .iter()
            .filter(|(_, state)| query.matches(state))
            .map(|(_, state)| state.clone())
            .collect())
    }

    async fn upsert_processor_state(&self, state: &ProcessorState) -> Result<ProcessorState, StorageError> {
        let key = processor_state_key(state);
        let mut tables = self.tables.write().await;
        // insertion order is kept so downstream fan-out is stable
        match tables.processor_states.iter_mut().find(|(existing, _)| *existing == key) {
            Some((_, existing)) => *existing = state.clone(),
            None => tables.processor_states.push((key, state.clone())),
        }
        Ok(state.clone())
    }
}

impl WorkflowStorage for MemoryStorage {
    async fn fetch_workflow(&self, id: &str) -> Result<Workflow, StorageError> {
        self.tables
            .read()
            .await
            .workflows
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("workflow", id))
    }

    async fn insert_workflow(&self, workflow: &Workflow) -> Result<Workflow, StorageError> {
        let mut tables = self.tables.write().await;
        tables.workflows.insert(workflow.id.clone(), workflow.clone());
        Ok(workflow.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ism_core::{Config, StateConfig};
    use serde_json::json;

    #[tokio::test]
    async fn test_load_without_data_keeps_columns() {
        let storage = MemoryStorage::new();
        let mut state = State::new("animals", Config::new(StateConfig::default()));
        state
            .apply_query_state(json!({"animal": "cat"}).as_object().cloned().unwrap(), false)
            .unwrap();
        storage.save_state(&state).await.unwrap();

        let full = storage.load_state("animals", true).await.unwrap();
        assert_eq!(full.count(), 1);
        let bare = storage.load_state("animals", false).await.unwrap();
        assert_eq!(bare.count(), 0);
        assert!(bare.column("animal").is_some());
    }

    #[tokio::test]
    async fn test_returned_state_is_a_copy() {
        let storage = MemoryStorage::new();
        storage
            .save_state(&State::new("animals", Config::new(StateConfig::default())))
            .await
            .unwrap();
        let mut loaded = storage.load_state("animals", true).await.unwrap();
        loaded
            .apply_query_state(json!({"animal": "dog"}).as_object().cloned().unwrap(), false)
            .unwrap();
        assert_eq!(storage.load_state("animals", true).await.unwrap().count(), 0);
    }
}
