use chrono::{DateTime, Utc};
use ism_core::ProcessorStatus;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    #[serde(default)]
    pub project_id: Option<String>,
    pub template_path: String,
    /// `user_template` or `system_template`; free-form.
    pub template_type: String,
    pub template_content: String,
    pub created_at: DateTime<Utc>,
}

impl Template {
    pub fn new(id: impl Into<String>, template_type: impl Into<String>, content: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            template_path: id.clone(),
            id,
            project_id: None,
            template_type: template_type.into(),
            template_content: content.into(),
            created_at: Utc::now(),
        }
    }
}

/// Catalogue entry for a kind of processor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessorProvider {
    pub id: String,
    pub name: String,
    pub version: String,
    pub class_name: String,
    #[serde(default)]
    pub user_template_id: Option<String>,
    #[serde(default)]
    pub system_template_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ProcessorProvider {
    pub fn new(id: impl Into<String>, name: impl Into<String>, class_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: "1".to_owned(),
            class_name: class_name.into(),
            user_template_id: None,
            system_template_id: None,
            created_at: Utc::now(),
        }
    }
}

/// A configured instance of a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Processor {
    pub id: String,
    pub provider_id: String,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: ProcessorStatus,
    #[serde(default)]
    pub user_template_id: Option<String>,
    #[serde(default)]
    pub system_template_id: Option<String>,
    #[serde(default)]
    pub properties: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl Processor {
    pub fn new(id: impl Into<String>, provider_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            provider_id: provider_id.into(),
            project_id: None,
            name: None,
            status: ProcessorStatus::Created,
            user_template_id: None,
            system_template_id: None,
            properties: Map::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_templates(mut self, user_template_id: Option<String>, system_template_id: Option<String>) -> Self {
        self.user_template_id = user_template_id;
        self.system_template_id = system_template_id;
        self
    }

    pub fn with_properties(mut self, properties: Map<String, Value>) -> Self {
        self.properties = properties;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    #[serde(default)]
    pub project_id: Option<String>,
    pub workflow_name: String,
    /// Processor ids in execution order.
    #[serde(default)]
    pub nodes: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Workflow {
    pub fn new(id: impl Into<String>, workflow_name: impl Into<String>, nodes: Vec<String>) -> Self {
        Self {
            id: id.into(),
            project_id: None,
            workflow_name: workflow_name.into(),
            nodes,
            created_at: Utc::now(),
        }
    }
}
