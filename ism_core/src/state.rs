//! Columnar, append-only dataset with key-based deduplication.

use crate::column::{ColumnDefinition, ColumnIndex, DataType, RowColumnData};
use crate::config::{Alias, Config, StateType};
use crate::expr::{self, Scope};
use crate::keys::{self, STATE_KEY, STATE_KEY_PLAIN};
use crate::template::{build_template_text, render_value};
use crate::{Error, Record, Result};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Row key of a record: hash plus the sorted pairs it was computed from.
pub type RowKey = (String, Vec<(String, Value)>);

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "StateDocument")]
pub struct State {
    pub id: String,
    pub project_id: Option<String>,
    pub config: Config,
    columns: BTreeMap<String, ColumnDefinition>,
    data: BTreeMap<String, RowColumnData>,
    mapping: BTreeMap<String, ColumnIndex>,
    count: usize,
    column_set_hash: Option<String>,
    /// Columns inferred from a null value; typed by their first non-null value.
    untyped: BTreeSet<String>,
}

impl State {
    pub fn new(id: impl Into<String>, config: Config) -> Self {
        Self {
            id: id.into(),
            project_id: None,
            config,
            columns: BTreeMap::new(),
            data: BTreeMap::new(),
            mapping: BTreeMap::new(),
            count: 0,
            column_set_hash: None,
            untyped: BTreeSet::new(),
        }
    }

    pub fn with_project_id(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn state_type(&self) -> StateType {
        self.config.state_type()
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.keys().map(String::as_str).collect()
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDefinition> {
        self.columns.get(name)
    }

    pub fn columns(&self) -> impl Iterator<Item = &ColumnDefinition> {
        self.columns.values()
    }

    pub fn get_column_values(&self, name: &str) -> Option<&[Value]> {
        self.data.get(name).map(|column| column.values.as_slice())
    }

    pub fn row_keys(&self) -> impl Iterator<Item = &str> {
        self.mapping.keys().map(String::as_str)
    }

    pub fn row_indexes(&self, state_key: &str) -> Option<&[usize]> {
        self.mapping
            .get(state_key)
            .map(|index| index.positions.as_slice())
    }

    pub fn add_column(&mut self, column: ColumnDefinition) -> Result<()> {
        if self.columns.contains_key(&column.name) {
            return Err(Error::ColumnExists(column.name));
        }
        self.data
            .insert(column.name.clone(), RowColumnData::nulls(self.count));
        self.columns.insert(column.name.clone(), column);
        Ok(())
    }

    pub fn add_columns(&mut self, columns: impl IntoIterator<Item = ColumnDefinition>) -> Result<()> {
        for column in columns {
            self.add_column(column)?;
        }
        Ok(())
    }

    /// Adds `column` and back-fills every existing row with `value_func(state, row)`.
    pub fn expand_columns<F>(&mut self, column: ColumnDefinition, mut value_func: F) -> Result<()>
    where
        F: FnMut(&State, usize) -> Result<Value>,
    {
        if self.columns.contains_key(&column.name) {
            return Err(Error::ColumnExists(column.name));
        }
        let state: &State = self;
        let values = (0..state.count)
            .map(|index| value_func(state, index))
            .collect::<Result<Vec<_>>>()?;
        self.data
            .insert(column.name.clone(), RowColumnData { values });
        self.columns.insert(column.name.clone(), column);
        Ok(())
    }

    fn scope(&self, record: &Record, config: &Value) -> Scope {
        Scope::new()
            .bind("query_state", Value::Object(record.clone()))
            .bind("state_id", self.id.clone())
            .bind("state_type", self.state_type().as_str())
            .bind("config", config.clone())
    }

    fn needs_scope(&self) -> bool {
        self.columns.values().any(|column| column.callable && column.is_derived())
            || self
                .config
                .state
                .remap_query_state_columns
                .iter()
                .any(|rule| matches!(rule.alias, Alias::Resolver { .. }))
    }

    /// Runs the pure part of the apply pipeline: remap, templates, derived
    /// columns, name cleaning and key attachment.
    pub fn prepare_query_state(&self, record: Record) -> Result<Record> {
        Ok(self.prepare_with_key(record)?.0)
    }

    fn prepare_with_key(&self, mut record: Record) -> Result<(Record, RowKey)> {
        if record.is_empty() {
            return Err(Error::Validation("query state is empty".to_owned()));
        }
        let config = if self.needs_scope() {
            self.config.to_value()?
        } else {
            Value::Null
        };

        for rule in &self.config.state.remap_query_state_columns {
            if !record.contains_key(&rule.name) {
                continue;
            }
            let alias = match &rule.alias {
                Alias::Literal(alias) => alias.clone(),
                Alias::Resolver { expression } => {
                    render_value(&expr::evaluate(expression, &self.scope(&record, &config))?)
                }
            };
            if alias.is_empty() || alias == rule.name {
                continue;
            }
            if let Some(value) = record.remove(&rule.name) {
                record.insert(alias, value);
            }
        }

        for name in &self.config.state.template_columns {
            let rendered = match record.get(name) {
                Some(Value::String(template)) => build_template_text(template, &record),
                _ => continue,
            };
            record.insert(name.clone(), Value::String(rendered));
        }

        let derived = self
            .columns
            .values()
            .filter(|column| column.is_derived())
            .map(|column| -> Result<(String, Value)> {
                let value = match &column.value {
                    Some(Value::String(source)) if column.callable => {
                        expr::evaluate(source, &self.scope(&record, &config))?
                    }
                    Some(value) => value.clone(),
                    None => Value::Null,
                };
                Ok((column.name.clone(), value))
            })
            .collect::<Result<Vec<_>>>()?;
        record.extend(derived);

        let mut record = keys::clean_record_keys(record);
        let key = self.row_key(&record)?;
        record.insert(STATE_KEY.to_owned(), Value::String(key.0.clone()));
        record.insert(STATE_KEY_PLAIN.to_owned(), keys::plain_key(&key.1));
        Ok((record, key))
    }

    /// Keyless states key on every field except the reserved key columns.
    fn row_key(&self, record: &Record) -> Result<RowKey> {
        keys::build_key(record, &self.config.state.primary_key_definition)
    }

    pub fn build_row_key_from_query_state(&self, record: &Record) -> Result<RowKey> {
        Ok(self.prepare_with_key(record.clone())?.1)
    }

    pub fn has_query_state(&self, record: &Record) -> Result<bool> {
        let (hash, _) = self.build_row_key_from_query_state(record)?;
        Ok(self.mapping.contains_key(&hash))
    }

    /// Applies one record and returns it as stored (or as found, when deduplicated).
    pub fn apply_query_state(&mut self, record: Record, skip_dedup: bool) -> Result<Record> {
        let (record, (hash, _)) = self.prepare_with_key(record)?;
        Ok(self.append_prepared(record, hash, skip_dedup))
    }

    /// Applies records as one unit: all of them are prepared before the first
    /// row is appended, so a failing record leaves the state untouched.
    pub fn apply_query_states(&mut self, records: Vec<Record>, skip_dedup: bool) -> Result<Vec<Record>> {
        let prepared = records
            .into_iter()
            .map(|record| self.prepare_with_key(record))
            .collect::<Result<Vec<_>>>()?;
        Ok(prepared
            .into_iter()
            .map(|(record, (hash, _))| self.append_prepared(record, hash, skip_dedup))
            .collect())
    }

    fn append_prepared(&mut self, record: Record, hash: String, skip_dedup: bool) -> Record {
        if !skip_dedup && self.mapping.contains_key(&hash) {
            tracing::debug!(state_id = %self.id, state_key = %hash, "query state already applied");
            return record;
        }

        self.reconcile_columns(&record);
        self.heal_alignment();

        for (name, column) in self.data.iter_mut() {
            let value = record.get(name).cloned().unwrap_or(Value::Null);
            if !value.is_null() && self.untyped.remove(name) {
                if let Some(definition) = self.columns.get_mut(name) {
                    definition.data_type = DataType::infer(&value);
                }
            }
            column.push(value);
        }
        self.mapping.entry(hash).or_default().push(self.count);
        self.count += 1;
        record
    }

    fn reconcile_columns(&mut self, record: &Record) {
        let mut sorted: Vec<&String> = record.keys().collect();
        sorted.sort();
        let set_hash = keys::hash_names(&sorted);
        if self.column_set_hash.as_deref() == Some(set_hash.as_str()) {
            return;
        }
        let added: Vec<String> = sorted
            .into_iter()
            .filter(|name| !self.columns.contains_key(*name))
            .cloned()
            .collect();
        if !added.is_empty() && self.count > 0 {
            tracing::warn!(
                state_id = %self.id,
                columns = ?added,
                rows = self.count,
                "column set changed, back-filling new columns with null"
            );
        }
        for name in added {
            let value = record.get(&name).unwrap_or(&Value::Null);
            if value.is_null() {
                self.untyped.insert(name.clone());
            }
            self.data
                .insert(name.clone(), RowColumnData::nulls(self.count));
            self.columns
                .insert(name.clone(), ColumnDefinition::inferred(name, value));
        }
        self.column_set_hash = Some(set_hash);
    }

    /// Every column gets a definition and exactly `count` values.
    fn heal_alignment(&mut self) {
        let longest = self.data.values().map(RowColumnData::len).max().unwrap_or(0);
        if longest > self.count {
            tracing::warn!(state_id = %self.id, count = self.count, longest, "row count behind column data");
            self.count = longest;
        }
        for name in self.columns.keys() {
            self.data.entry(name.clone()).or_default();
        }
        for (name, column) in self.data.iter_mut() {
            if column.len() < self.count {
                tracing::warn!(state_id = %self.id, column = %name, "padding short column");
                column.pad_to(self.count);
            }
            if !self.columns.contains_key(name) {
                let first = column.values.iter().find(|v| !v.is_null()).unwrap_or(&Value::Null);
                self.columns
                    .insert(name.clone(), ColumnDefinition::inferred(name.clone(), first));
            }
        }
    }

    pub fn build_query_state_from_row_data(&self, index: usize) -> Result<Record> {
        if index >= self.count {
            return Err(Error::RowOutOfRange {
                index,
                count: self.count,
            });
        }
        Ok(self
            .data
            .iter()
            .map(|(name, column)| (name.clone(), column.get(index).cloned().unwrap_or(Value::Null)))
            .collect())
    }

    pub fn get_query_state_by_key(&self, state_key: &str) -> Result<Option<Record>> {
        match self.mapping.get(state_key).and_then(ColumnIndex::first) {
            Some(index) => self.build_query_state_from_row_data(index).map(Some),
            None => Ok(None),
        }
    }

    pub fn iter_query_states(&self) -> impl Iterator<Item = Record> + '_ {
        (0..self.count).filter_map(|index| self.build_query_state_from_row_data(index).ok())
    }

    /// Every pair of rows merged into one record; the right side wins on clashes.
    pub fn cross_join(&self, other: &State) -> Vec<Record> {
        let strip = |record: Record| -> Record {
            record
                .into_iter()
                .filter(|(name, _)| !keys::is_reserved(name))
                .collect()
        };
        let right: Vec<Record> = other.iter_query_states().map(strip).collect();
        self.iter_query_states()
            .map(strip)
            .flat_map(|left| {
                right.iter().map(move |right| {
                    let mut merged = left.clone();
                    merged.extend(right.clone());
                    merged
                })
            })
            .collect()
    }

    /// Copy carrying the configuration and column definitions only.
    pub fn metadata_only(&self) -> State {
        State {
            data: self
                .columns
                .keys()
                .map(|name| (name.clone(), RowColumnData::default()))
                .collect(),
            mapping: BTreeMap::new(),
            count: 0,
            column_set_hash: None,
            ..self.clone()
        }
    }

    pub fn to_json(&self, pretty: bool) -> Result<String> {
        Ok(if pretty {
            serde_json::to_string_pretty(self)?
        } else {
            serde_json::to_string(self)?
        })
    }

    pub fn from_json(text: &str) -> Result<State> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_binary(&self) -> Result<Vec<u8>> {
        Ok(serde_cbor::to_vec(self)?)
    }

    pub fn from_binary(bytes: &[u8]) -> Result<State> {
        Ok(serde_cbor::from_slice(bytes)?)
    }
}

#[derive(Serialize)]
struct StateDocumentRef<'a> {
    id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    project_id: Option<&'a str>,
    state_type: StateType,
    config: Value,
    columns: &'a BTreeMap<String, ColumnDefinition>,
    data: &'a BTreeMap<String, RowColumnData>,
    mapping: &'a BTreeMap<String, ColumnIndex>,
    count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    column_set_hash: Option<&'a str>,
}

#[derive(Deserialize)]
struct StateDocument {
    id: String,
    #[serde(default)]
    project_id: Option<String>,
    #[serde(default)]
    state_type: StateType,
    #[serde(default)]
    config: Value,
    #[serde(default)]
    columns: BTreeMap<String, ColumnDefinition>,
    #[serde(default)]
    data: BTreeMap<String, RowColumnData>,
    #[serde(default)]
    mapping: BTreeMap<String, ColumnIndex>,
    #[serde(default)]
    count: Option<usize>,
    #[serde(default)]
    column_set_hash: Option<String>,
}

impl Serialize for State {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let config = self.config.to_value().map_err(serde::ser::Error::custom)?;
        StateDocumentRef {
            id: &self.id,
            project_id: self.project_id.as_deref(),
            state_type: self.state_type(),
            config,
            columns: &self.columns,
            data: &self.data,
            mapping: &self.mapping,
            count: self.count,
            column_set_hash: self.column_set_hash.as_deref(),
        }
        .serialize(serializer)
    }
}

impl TryFrom<StateDocument> for State {
    type Error = Error;

    fn try_from(document: StateDocument) -> Result<Self> {
        let config = Config::from_parts(document.state_type, document.config)?;
        let count = document.count.unwrap_or_else(|| {
            document.data.values().map(RowColumnData::len).max().unwrap_or(0)
        });
        let mut state = State {
            id: document.id,
            project_id: document.project_id,
            config,
            columns: document.columns,
            data: document.data,
            mapping: document.mapping,
            count,
            column_set_hash: document.column_set_hash,
            untyped: BTreeSet::new(),
        };
        state.heal_alignment();
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RemapRule, StateConfig};
    use crate::keys::KeyDefinition;
    use serde_json::json;

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    fn keyed_state(keys: &[&str]) -> State {
        let config = Config::new(StateConfig {
            primary_key_definition: keys.iter().map(|k| KeyDefinition::required(*k)).collect(),
            ..Default::default()
        });
        State::new("animals", config)
    }

    #[test]
    fn test_apply_is_idempotent() {
        let mut state = keyed_state(&["animal"]);
        let first = state
            .apply_query_state(record(json!({"animal": "cat", "color": "black"})), false)
            .unwrap();
        let again = state
            .apply_query_state(record(json!({"color": "black", "animal": "cat"})), false)
            .unwrap();
        assert_eq!(state.count(), 1);
        assert_eq!(first[STATE_KEY], again[STATE_KEY]);
        assert_eq!(state.row_indexes(first[STATE_KEY].as_str().unwrap()), Some(&[0][..]));
    }

    #[test]
    fn test_skip_dedup_appends_duplicates() {
        let mut state = keyed_state(&["animal"]);
        let row = record(json!({"animal": "cat"}));
        state.apply_query_state(row.clone(), true).unwrap();
        let applied = state.apply_query_state(row, true).unwrap();
        assert_eq!(state.count(), 2);
        assert_eq!(
            state.row_indexes(applied[STATE_KEY].as_str().unwrap()),
            Some(&[0, 1][..])
        );
    }

    #[test]
    fn test_empty_and_missing_key_rejected() {
        let mut state = keyed_state(&["animal"]);
        assert!(matches!(
            state.apply_query_state(Record::new(), false),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            state.apply_query_state(record(json!({"color": "red"})), false),
            Err(Error::MissingField(ref f)) if f == "animal"
        ));
        assert_eq!(state.count(), 0);
        assert!(state.has_query_state(&Record::new()).is_err());
    }

    #[test]
    fn test_drift_backfills_new_columns() {
        let mut state = keyed_state(&["id"]);
        state.apply_query_state(record(json!({"id": 1, "a": "x"})), false).unwrap();
        state.apply_query_state(record(json!({"id": 2, "b": true})), false).unwrap();
        assert_eq!(state.count(), 2);
        for name in state.column_names() {
            assert_eq!(state.get_column_values(name).unwrap().len(), 2, "{name}");
        }
        assert_eq!(state.get_column_values("b").unwrap(), &[Value::Null, json!(true)]);
        assert_eq!(state.get_column_values("a").unwrap(), &[json!("x"), Value::Null]);
        assert_eq!(state.column("b").unwrap().data_type, DataType::Bool);
    }

    #[test]
    fn test_null_first_value_types_column_later() {
        let mut state = keyed_state(&["id"]);
        state.apply_query_state(record(json!({"id": 1, "score": null})), false).unwrap();
        state.apply_query_state(record(json!({"id": 2, "score": 0.5})), false).unwrap();
        assert_eq!(state.column("score").unwrap().data_type, DataType::Float);
    }

    #[test]
    fn test_names_are_cleaned_and_key_attached() {
        let mut state = keyed_state(&[]);
        let applied = state
            .apply_query_state(record(json!({"first name": "Ada"})), false)
            .unwrap();
        assert_eq!(applied["first_name"], json!("Ada"));
        assert_eq!(applied[STATE_KEY_PLAIN], json!([["first_name", "Ada"]]));
        assert!(state.column("first_name").is_some());
    }

    #[test]
    fn test_remap_template_and_derived_columns() {
        let config = Config::new(StateConfig {
            remap_query_state_columns: vec![
                RemapRule::literal("kind", "animal"),
                RemapRule::resolver("noise", "concat(query_state.animal, '_sound')"),
            ],
            template_columns: vec!["prompt".into()],
            ..Default::default()
        });
        let mut state = State::new("zoo", config);
        state
            .add_columns([
                ColumnDefinition::constant("source", json!("import")),
                ColumnDefinition::callable("label", "upper(query_state.animal) + '@' + state_id"),
            ])
            .unwrap();
        let applied = state
            .apply_query_state(
                record(json!({
                    "kind": "cat",
                    "noise": "meow",
                    "prompt": "what does a {animal} say?",
                    "source": "ignored"
                })),
                false,
            )
            .unwrap();
        assert_eq!(applied["animal"], json!("cat"));
        assert_eq!(applied["cat_sound"], json!("meow"));
        assert_eq!(applied["prompt"], json!("what does a cat say?"));
        assert_eq!(applied["source"], json!("import"));
        assert_eq!(applied["label"], json!("CAT@zoo"));
        assert!(!applied.contains_key("kind"));
    }

    #[test]
    fn test_batch_apply_is_all_or_nothing() {
        let mut state = keyed_state(&["id"]);
        state
            .add_column(ColumnDefinition::callable("label", "upper(query_state.name)"))
            .unwrap();
        let err = state
            .apply_query_states(
                vec![record(json!({"id": 1, "name": "a"})), record(json!({"id": 2, "name": 7}))],
                false,
            )
            .unwrap_err();
        assert!(matches!(err, Error::Expression(_)));
        assert_eq!(state.count(), 0);
        assert_eq!(state.get_column_values("label").unwrap().len(), 0);

        let applied = state
            .apply_query_states(
                vec![
                    record(json!({"id": 1, "name": "a"})),
                    record(json!({"id": 1, "name": "a"})),
                    record(json!({"id": 2, "name": "b"})),
                ],
                false,
            )
            .unwrap();
        assert_eq!(applied.len(), 3);
        assert_eq!(state.count(), 2, "duplicates inside one batch are still deduplicated");
        assert_eq!(state.get_column_values("label").unwrap(), &[json!("A"), json!("B")][..]);
    }

    #[test]
    fn test_row_access_and_out_of_range() {
        let mut state = keyed_state(&["id"]);
        let applied = state.apply_query_state(record(json!({"id": 7})), false).unwrap();
        let row = state.build_query_state_from_row_data(0).unwrap();
        assert_eq!(row["id"], json!(7));
        assert!(matches!(
            state.build_query_state_from_row_data(1),
            Err(Error::RowOutOfRange { index: 1, count: 1 })
        ));
        let by_key = state
            .get_query_state_by_key(applied[STATE_KEY].as_str().unwrap())
            .unwrap();
        assert_eq!(by_key, Some(row));
    }

    #[test]
    fn test_expand_columns_backfills_every_row() {
        let mut state = keyed_state(&["id"]);
        for id in 0..3 {
            state.apply_query_state(record(json!({"id": id})), false).unwrap();
        }
        state
            .expand_columns(ColumnDefinition::new("double", DataType::Int), |state, row| {
                let id = state.get_column_values("id").unwrap()[row].as_i64().unwrap_or(0);
                Ok(json!(id * 2))
            })
            .unwrap();
        assert_eq!(
            state.get_column_values("double").unwrap(),
            &[json!(0), json!(2), json!(4)]
        );
        assert!(matches!(
            state.expand_columns(ColumnDefinition::new("double", DataType::Int), |_, _| Ok(Value::Null)),
            Err(Error::ColumnExists(_))
        ));
    }

    #[test]
    fn test_cross_join_right_side_wins() {
        let mut left = keyed_state(&["a"]);
        left.apply_query_state(record(json!({"a": 1, "shared": "left"})), false).unwrap();
        left.apply_query_state(record(json!({"a": 2, "shared": "left"})), false).unwrap();
        let mut right = keyed_state(&["b"]);
        right.apply_query_state(record(json!({"b": "x", "shared": "right"})), false).unwrap();
        let joined = left.cross_join(&right);
        assert_eq!(joined.len(), 2);
        assert!(joined.iter().all(|row| row["shared"] == json!("right")));
        assert!(joined.iter().all(|row| !row.contains_key(STATE_KEY)));
    }

    #[test]
    fn test_keyless_state_keys_on_all_fields() {
        let mut state = keyed_state(&[]);
        for name in ["a", "b", "c"] {
            let applied = state
                .apply_query_state(record(json!({"state_key": "parent", "name": name})), false)
                .unwrap();
            assert_ne!(applied[STATE_KEY], json!("parent"));
        }
        assert_eq!(state.count(), 3);

        state
            .apply_query_state(record(json!({"state_key": "other", "name": "a"})), false)
            .unwrap();
        assert_eq!(state.count(), 3, "an upstream key does not change the identity");
        assert!(state.has_query_state(&record(json!({"name": "b"}))).unwrap());
        assert!(!state.has_query_state(&record(json!({"name": "d"}))).unwrap());
    }
}
