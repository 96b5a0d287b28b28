//! State configuration.
//!
//! A persisted config is one flat JSON object. The `state_type` discriminator
//! stored next to it decides which variant settings are read from that object;
//! the common [`StateConfig`] fields are always present.

use crate::keys::KeyDefinition;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum StateType {
    #[default]
    StateConfig,
    #[serde(rename = "StateConfigLM")]
    StateConfigLm,
    #[serde(rename = "StateConfigDB")]
    StateConfigDb,
    StateConfigCode,
}

impl StateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateType::StateConfig => "StateConfig",
            StateType::StateConfigLm => "StateConfigLM",
            StateType::StateConfigDb => "StateConfigDB",
            StateType::StateConfigCode => "StateConfigCode",
        }
    }
}

impl fmt::Display for StateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StateType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "StateConfig" => Ok(StateType::StateConfig),
            "StateConfigLM" => Ok(StateType::StateConfigLm),
            "StateConfigDB" => Ok(StateType::StateConfigDb),
            "StateConfigCode" => Ok(StateType::StateConfigCode),
            other => Err(Error::UnknownStateType(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageClass {
    #[default]
    Memory,
    Database,
}

/// New field name for a remapped field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Alias {
    Literal(String),
    /// Expression evaluated against the whole record; its rendered result is the new name.
    Resolver { expression: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemapRule {
    pub name: String,
    pub alias: Alias,
}

impl RemapRule {
    pub fn literal(name: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            alias: Alias::Literal(alias.into()),
        }
    }

    pub fn resolver(name: impl Into<String>, expression: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            alias: Alias::Resolver {
                expression: expression.into(),
            },
        }
    }
}

/// Fields shared by every config variant.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StateConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub primary_key_definition: Vec<KeyDefinition>,
    #[serde(default)]
    pub query_state_inheritance_key_definition: Vec<KeyDefinition>,
    #[serde(default)]
    pub remap_query_state_columns: Vec<RemapRule>,
    /// Record fields whose value is itself a template over the record.
    #[serde(default)]
    pub template_columns: Vec<String>,
    #[serde(default)]
    pub storage_class: StorageClass,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LmSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_template_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_template_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DbSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_name: Option<String>,
    #[serde(default)]
    pub embedding_columns: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_model: Option<String>,
}

/// Stored code contract. Never executed.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CodeSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum ConfigKind {
    #[default]
    Plain,
    Lm(LmSettings),
    Db(DbSettings),
    Code(CodeSettings),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Config {
    pub state: StateConfig,
    pub kind: ConfigKind,
}

impl Config {
    pub fn new(state: StateConfig) -> Self {
        Self {
            state,
            kind: ConfigKind::Plain,
        }
    }

    pub fn with_kind(mut self, kind: ConfigKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_primary_key(mut self, keys: Vec<KeyDefinition>) -> Self {
        self.state.primary_key_definition = keys;
        self
    }

    pub fn state_type(&self) -> StateType {
        match self.kind {
            ConfigKind::Plain => StateType::StateConfig,
            ConfigKind::Lm(_) => StateType::StateConfigLm,
            ConfigKind::Db(_) => StateType::StateConfigDb,
            ConfigKind::Code(_) => StateType::StateConfigCode,
        }
    }

    pub fn lm(&self) -> Option<&LmSettings> {
        match &self.kind {
            ConfigKind::Lm(settings) => Some(settings),
            _ => None,
        }
    }

    /// Rebuilds a config from its flat document, upgrading legacy field layouts.
    pub fn from_parts(state_type: StateType, value: Value) -> Result<Self> {
        let value = upgrade_legacy(value);
        let state: StateConfig = serde_json::from_value(value.clone())?;
        let kind = match state_type {
            StateType::StateConfig => ConfigKind::Plain,
            StateType::StateConfigLm => ConfigKind::Lm(serde_json::from_value(value)?),
            StateType::StateConfigDb => ConfigKind::Db(serde_json::from_value(value)?),
            StateType::StateConfigCode => ConfigKind::Code(serde_json::from_value(value)?),
        };
        Ok(Self { state, kind })
    }

    /// Flat document: the common fields merged with the variant settings.
    pub fn to_value(&self) -> Result<Value> {
        let mut merged = as_object(serde_json::to_value(&self.state)?);
        let settings = match &self.kind {
            ConfigKind::Plain => Value::Null,
            ConfigKind::Lm(settings) => serde_json::to_value(settings)?,
            ConfigKind::Db(settings) => serde_json::to_value(settings)?,
            ConfigKind::Code(settings) => serde_json::to_value(settings)?,
        };
        merged.extend(as_object(settings));
        Ok(Value::Object(merged))
    }
}

fn as_object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

const KEY_LIST_FIELDS: [&str; 2] = [
    "primary_key_definition",
    "query_state_inheritance_key_definition",
];

/// Rewrites older config layouts in place.
///
/// `primary_key` is renamed to `primary_key_definition` and key lists stored as
/// bare strings become key definition objects.
pub fn upgrade_legacy(value: Value) -> Value {
    let Value::Object(mut map) = value else {
        return Value::Object(Map::new());
    };
    if let Some(legacy) = map.remove("primary_key") {
        map.entry("primary_key_definition").or_insert(legacy);
    }
    for field in KEY_LIST_FIELDS {
        if let Some(Value::Array(items)) = map.get_mut(field) {
            for item in items.iter_mut() {
                if let Value::String(name) = item {
                    *item = serde_json::json!({ "name": name, "required": true });
                }
            }
        }
    }
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_state_type_names() {
        for state_type in [
            StateType::StateConfig,
            StateType::StateConfigLm,
            StateType::StateConfigDb,
            StateType::StateConfigCode,
        ] {
            let parsed: StateType = state_type.as_str().parse().unwrap();
            assert_eq!(parsed, state_type);
            assert_eq!(
                serde_json::to_value(state_type).unwrap(),
                json!(state_type.as_str())
            );
        }
        assert!(matches!(
            "StateConfigVault".parse::<StateType>(),
            Err(Error::UnknownStateType(_))
        ));
    }

    #[test]
    fn test_lm_config_flat_document() {
        let config = Config::new(StateConfig {
            primary_key_definition: vec![KeyDefinition::required("animal")],
            ..Default::default()
        })
        .with_kind(ConfigKind::Lm(LmSettings {
            model_name: Some("gpt-4o-mini".into()),
            temperature: Some(0.2),
            ..Default::default()
        }));
        let value = config.to_value().unwrap();
        assert_eq!(value["model_name"], json!("gpt-4o-mini"));
        assert_eq!(value["primary_key_definition"][0]["name"], json!("animal"));

        let restored = Config::from_parts(StateType::StateConfigLm, value).unwrap();
        assert_eq!(restored, config);
        assert_eq!(restored.state_type(), StateType::StateConfigLm);
    }

    #[test]
    fn test_legacy_primary_key_is_upgraded() {
        let legacy = json!({
            "primary_key": ["animal", "color"],
            "query_state_inheritance_key_definition": ["animal"],
            "table_name": "animals"
        });
        let config = Config::from_parts(StateType::StateConfigDb, legacy).unwrap();
        assert_eq!(
            config.state.primary_key_definition,
            vec![
                KeyDefinition::required("animal"),
                KeyDefinition::required("color")
            ]
        );
        assert_eq!(
            config.state.query_state_inheritance_key_definition,
            vec![KeyDefinition::required("animal")]
        );
        assert!(matches!(
            config.kind,
            ConfigKind::Db(DbSettings { table_name: Some(ref t), .. }) if t == "animals"
        ));
    }

    #[test]
    fn test_remap_alias_forms() {
        let rules: Vec<RemapRule> = serde_json::from_value(json!([
            {"name": "a", "alias": "b"},
            {"name": "c", "alias": {"expression": "concat('x_', query_state.kind)"}}
        ]))
        .unwrap();
        assert_eq!(rules[0], RemapRule::literal("a", "b"));
        assert_eq!(
            rules[1],
            RemapRule::resolver("c", "concat('x_', query_state.kind)")
        );
    }
}
