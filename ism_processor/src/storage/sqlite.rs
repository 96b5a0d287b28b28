use super::{
    Processor, ProcessorProvider, ProcessorStateQuery, ProcessorStateRouteStorage, ProcessorStorage, StateStorage,
    StorageError, Template, TemplateStorage, Workflow, WorkflowStorage,
};
use chrono::{DateTime, Utc};
use ism_core::{ProcessorState, ProcessorStatus, State, StateDirection};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use std::str::FromStr;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// SQLite storage. States are stored as CBOR documents next to their type.
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct StateRow {
    id: String,
    document: Vec<u8>,
}

#[derive(sqlx::FromRow)]
struct TemplateRow {
    id: String,
    project_id: Option<String>,
    template_path: String,
    template_type: String,
    template_content: String,
    created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct ProviderRow {
    id: String,
    name: String,
    version: String,
    class_name: String,
    user_template_id: Option<String>,
    system_template_id: Option<String>,
    created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct ProcessorRow {
    id: String,
    provider_id: String,
    project_id: Option<String>,
    name: Option<String>,
    status: String,
    user_template_id: Option<String>,
    system_template_id: Option<String>,
    properties: String,
    created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct ProcessorStateRow {
    processor_id: String,
    state_id: String,
    direction: String,
    status: String,
    current_index: i64,
    maximum_index: i64,
    count: i64,
}

#[derive(sqlx::FromRow)]
struct WorkflowRow {
    id: String,
    project_id: Option<String>,
    workflow_name: String,
    nodes: String,
    created_at: DateTime<Utc>,
}

fn corrupt(kind: &'static str, id: &str, reason: impl ToString) -> StorageError {
    StorageError::Corrupt {
        kind,
        id: id.to_owned(),
        reason: reason.to_string(),
    }
}

impl TryFrom<ProcessorRow> for Processor {
    type Error = StorageError;

    fn try_from(row: ProcessorRow) -> Result<Self, Self::Error> {
        let status = ProcessorStatus::from_str(&row.status).map_err(|err| corrupt("processor", &row.id, err))?;
        let properties = serde_json::from_str(&row.properties)?;
        Ok(Processor {
            id: row.id,
            provider_id: row.provider_id,
            project_id: row.project_id,
            name: row.name,
            status,
            user_template_id: row.user_template_id,
            system_template_id: row.system_template_id,
            properties,
            created_at: row.created_at,
        })
    }
}

impl TryFrom<ProcessorStateRow> for ProcessorState {
    type Error = StorageError;

    fn try_from(row: ProcessorStateRow) -> Result<Self, Self::Error> {
        let id = format!("{}:{}", row.state_id, row.processor_id);
        let direction = StateDirection::from_str(&row.direction).map_err(|err| corrupt("processor state", &id, err))?;
        let status = ProcessorStatus::from_str(&row.status).map_err(|err| corrupt("processor state", &id, err))?;
        Ok(ProcessorState {
            processor_id: row.processor_id,
            state_id: row.state_id,
            direction,
            status,
            current_index: row.current_index.max(0) as u64,
            maximum_index: row.maximum_index.max(0) as u64,
            count: row.count.max(0) as u64,
        })
    }
}

impl SqliteStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str) -> Result<Self, StorageError> {
        let pool = SqlitePool::connect(url).await?;
        Ok(Self::new(pool))
    }

    /// Private in-memory database; a single long-lived connection keeps it alive.
    pub async fn in_memory() -> Result<Self, StorageError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> Result<(), StorageError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

impl StateStorage for SqliteStorage {
    async fn load_state(&self, id: &str, load_data: bool) -> Result<State, StorageError> {
        let row = sqlx::query_as::<_, StateRow>("SELECT id, document FROM states WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::not_found("state", id))?;
        let state = State::from_binary(&row.document).map_err(|err| corrupt("state", &row.id, err))?;
        Ok(if load_data { state } else { state.metadata_only() })
    }

    async fn save_state(&self, state: &State) -> Result<State, StorageError> {
        let document = state.to_binary()?;
        sqlx::query(
            r#"
            INSERT INTO states (id, project_id, state_type, row_count, document, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                project_id = excluded.project_id,
                state_type = excluded.state_type,
                row_count = excluded.row_count,
                document = excluded.document,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&state.id)
        .bind(&state.project_id)
        .bind(state.state_type().as_str())
        .bind(state.count() as i64)
        .bind(document)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        tracing::debug!(state_id = %state.id, rows = state.count(), "state saved");
        Ok(state.clone())
    }
}

impl TemplateStorage for SqliteStorage {
    async fn fetch_template(&self, id: &str) -> Result<Template, StorageError> {
        let row = sqlx::query_as::<_, TemplateRow>("SELECT * FROM templates WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::not_found("template", id))?;
        Ok(Template {
            id: row.id,
            project_id: row.project_id,
            template_path: row.template_path,
            template_type: row.template_type,
            template_content: row.template_content,
            created_at: row.created_at,
        })
    }

    async fn insert_template(&self, template: &Template) -> Result<Template, StorageError> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO templates (id, project_id, template_path, template_type, template_content, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&template.id)
        .bind(&template.project_id)
        .bind(&template.template_path)
        .bind(&template.template_type)
        .bind(&template.template_content)
        .bind(template.created_at)
        .execute(&self.pool)
        .await?;
        Ok(template.clone())
    }
}

impl ProcessorStorage for SqliteStorage {
    async fn fetch_processor(&self, id: &str) -> Result<Processor, StorageError> {
        sqlx::query_as::<_, ProcessorRow>("SELECT * FROM processors WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::not_found("processor", id))?
            .try_into()
    }

    async fn fetch_processor_provider(&self, id: &str) -> Result<ProcessorProvider, StorageError> {
        let row = sqlx::query_as::<_, ProviderRow>("SELECT * FROM processor_providers WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::not_found("processor provider", id))?;
        Ok(ProcessorProvider {
            id: row.id,
            name: row.name,
            version: row.version,
            class_name: row.class_name,
            user_template_id: row.user_template_id,
            system_template_id: row.system_template_id,
            created_at: row.created_at,
        })
    }

    async fn insert_processor(&self, processor: &Processor) -> Result<Processor, StorageError> {
        let properties = serde_json::to_string(&processor.properties)?;
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO processors
                (id, provider_id, project_id, name, status, user_template_id, system_template_id, properties, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&processor.id)
        .bind(&processor.provider_id)
        .bind(&processor.project_id)
        .bind(&processor.name)
        .bind(processor.status.as_str())
        .bind(&processor.user_template_id)
        .bind(&processor.system_template_id)
        .bind(properties)
        .bind(processor.created_at)
        .execute(&self.pool)
        .await?;
        Ok(processor.clone())
    }

    async fn insert_processor_provider(&self, provider: &ProcessorProvider) -> Result<ProcessorProvider, StorageError> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO processor_providers
                (id, name, version, class_name, user_template_id, system_template_id, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&provider.id)
        .bind(&provider.name)
        .bind(&provider.version)
        .bind(&provider.class_name)
        .bind(&provider.user_template_id)
        .bind(&provider.system_template_id)
        .bind(provider.created_at)
        .execute(&self.pool)
        .await?;
        Ok(provider.clone())
    }
}

impl ProcessorStateRouteStorage for SqliteStorage {
    async fn fetch_processor_state_route(
        &self,
        query: &ProcessorStateQuery,
    ) -> Result<Vec<ProcessorState>, StorageError> {
        let (column, value, direction) = match query {
            ProcessorStateQuery::RouteId { route_id, direction } => {
                let route_id: ism_core::RouteId = route_id
                    .parse()
                    .map_err(|err| corrupt("processor state", route_id, err))?;
                let rows = sqlx::query_as::<_, ProcessorStateRow>(
                    "SELECT * FROM processor_states WHERE state_id = ? AND processor_id = ? AND direction = ? ORDER BY rowid",
                )
                .bind(&route_id.state_id)
                .bind(&route_id.processor_id)
                .bind(direction.as_str())
                .fetch_all(&self.pool)
                .await?;
                return rows.into_iter().map(ProcessorState::try_from).collect();
            }
            ProcessorStateQuery::Processor {
                processor_id,
                direction,
            } => ("processor_id", processor_id, direction),
            ProcessorStateQuery::State { state_id, direction } => ("state_id", state_id, direction),
        };
        let mut sql = format!("SELECT * FROM processor_states WHERE {column} = ?");
        if direction.is_some() {
            sql.push_str(" AND direction = ?");
        }
        sql.push_str(" ORDER BY rowid");
        let mut statement = sqlx::query_as::<_, ProcessorStateRow>(&sql).bind(value);
        if let Some(direction) = direction {
            statement = statement.bind(direction.as_str());
        }
        let rows = statement.fetch_all(&self.pool).await?;
        rows.into_iter().map(ProcessorState::try_from).collect()
    }

    async fn upsert_processor_state(&self, state: &ProcessorState) -> Result<ProcessorState, StorageError> {
        sqlx::query(
            r#"
            INSERT INTO processor_states
                (processor_id, state_id, direction, status, current_index, maximum_index, count)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(processor_id, state_id, direction) DO UPDATE SET
                status = excluded.status,
                current_index = excluded.current_index,
                maximum_index = excluded.maximum_index,
                count = excluded.count
            "#,
        )
        .bind(&state.processor_id)
        .bind(&state.state_id)
        .bind(state.direction.as_str())
        .bind(state.status.as_str())
        .bind(state.current_index as i64)
        .bind(state.maximum_index as i64)
        .bind(state.count as i64)
        .execute(&self.pool)
        .await?;
        Ok(state.clone())
    }
}

impl WorkflowStorage for SqliteStorage {
    async fn fetch_workflow(&self, id: &str) -> Result<Workflow, StorageError> {
        let row = sqlx::query_as::<_, WorkflowRow>("SELECT * FROM workflows WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::not_found("workflow", id))?;
        Ok(Workflow {
            nodes: serde_json::from_str(&row.nodes)?,
            id: row.id,
            project_id: row.project_id,
            workflow_name: row.workflow_name,
            created_at: row.created_at,
        })
    }

    async fn insert_workflow(&self, workflow: &Workflow) -> Result<Workflow, StorageError> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO workflows (id, project_id, workflow_name, nodes, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&workflow.id)
        .bind(&workflow.project_id)
        .bind(&workflow.workflow_name)
        .bind(serde_json::to_string(&workflow.nodes)?)
        .bind(workflow.created_at)
        .execute(&self.pool)
        .await?;
        Ok(workflow.clone())
    }
}
