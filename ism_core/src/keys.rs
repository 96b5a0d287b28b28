//! Row identity and field projection.
//!
//! Primary keys are hashed over the sorted `(name, value)` pairs picked by a
//! list of [`KeyDefinition`]s. Values go through a canonical JSON rendering
//! with object keys sorted at every level so the hash never depends on the
//! insertion order of a record.

use crate::{Error, Record, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

pub const STATE_KEY: &str = "state_key";
pub const STATE_KEY_PLAIN: &str = "state_key_plain";
pub const STATE_ITEM_KEY: &str = "state_item_key";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default)]
    pub required: bool,
}

impl KeyDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            alias: None,
            required: false,
        }
    }

    pub fn required(name: impl Into<String>) -> Self {
        Self {
            required: true,
            ..Self::new(name)
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Name the value is published under after extraction.
    pub fn output_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

/// Reserved envelope fields that never take part in an implicit key.
pub fn is_reserved(name: &str) -> bool {
    matches!(name, STATE_KEY | STATE_KEY_PLAIN)
}

/// DDL-safe field name: ASCII alphanumerics and `_`, everything else becomes `_`.
pub fn clean_name(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

pub fn clean_record_keys(record: Record) -> Record {
    record
        .into_iter()
        .map(|(key, value)| (clean_name(&key), value))
        .collect()
}

fn lookup<'a>(record: &'a Record, name: &str) -> Option<&'a Value> {
    record.get(name).or_else(|| record.get(&clean_name(name)))
}

/// Projects `record` through `key_definitions`.
///
/// Missing or null required fields fail with [`Error::MissingField`]; missing
/// optional fields bind `null`. Output is keyed by alias, falling back to the
/// definition name.
pub fn extract_values_from_query_state_by_key_definition(
    record: &Record,
    key_definitions: &[KeyDefinition],
) -> Result<Record> {
    let mut values = Record::new();
    for definition in key_definitions {
        match lookup(record, &definition.name) {
            Some(value) if !value.is_null() => {
                values.insert(definition.output_name().to_owned(), value.clone());
            }
            _ if definition.required => {
                return Err(Error::MissingField(definition.name.clone()));
            }
            _ => {
                values.insert(definition.output_name().to_owned(), Value::Null);
            }
        }
    }
    Ok(values)
}

/// Computes `(hash, sorted pairs)` for a record.
///
/// An empty definition list keys on every non-reserved field of the record.
pub fn build_key(
    record: &Record,
    key_definitions: &[KeyDefinition],
) -> Result<(String, Vec<(String, Value)>)> {
    let mut pairs: Vec<(String, Value)> = if key_definitions.is_empty() {
        record
            .iter()
            .filter(|(name, _)| !is_reserved(name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    } else {
        extract_values_from_query_state_by_key_definition(record, key_definitions)?
            .into_iter()
            .collect()
    };
    if pairs.is_empty() {
        return Err(Error::Validation(
            "cannot build a row key from an empty record".to_owned(),
        ));
    }
    pairs.sort_by(|a, b| a.0.cmp(&b.0));
    Ok((hash_pairs(&pairs), pairs))
}

/// Hash of every field of a record; used as the secondary key of fan-out rows.
pub fn hash_record(record: &Record) -> String {
    let mut pairs: Vec<(String, Value)> = record
        .iter()
        .filter(|(name, _)| !is_reserved(name))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    pairs.sort_by(|a, b| a.0.cmp(&b.0));
    hash_pairs(&pairs)
}

pub fn hash_pairs(pairs: &[(String, Value)]) -> String {
    let mut text = String::from("[");
    for (i, (name, value)) in pairs.iter().enumerate() {
        if i > 0 {
            text.push(',');
        }
        text.push('[');
        text.push_str(&Value::String(name.clone()).to_string());
        text.push(',');
        write_canonical(value, &mut text);
        text.push(']');
    }
    text.push(']');
    sha256_hex(&text)
}

pub fn hash_names<S: AsRef<str>>(names: &[S]) -> String {
    let joined = names
        .iter()
        .map(|name| name.as_ref())
        .collect::<Vec<_>>()
        .join("\u{1f}");
    sha256_hex(&joined)
}

/// Human readable form of a key, stored next to the hash.
pub fn plain_key(pairs: &[(String, Value)]) -> Value {
    Value::Array(
        pairs
            .iter()
            .map(|(name, value)| Value::Array(vec![Value::String(name.clone()), value.clone()]))
            .collect(),
    )
}

fn sha256_hex(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, value)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(value, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_clean_name() {
        assert_eq!(clean_name("first name"), "first_name");
        assert_eq!(clean_name("price($)"), "price___");
        assert_eq!(clean_name("already_clean_1"), "already_clean_1");
    }

    #[test]
    fn test_extract_uses_alias_and_binds_optional_null() {
        let row = record(json!({"animal": "cat", "color": "black"}));
        let defs = vec![
            KeyDefinition::required("animal").with_alias("species"),
            KeyDefinition::new("size"),
        ];
        let values = extract_values_from_query_state_by_key_definition(&row, &defs).unwrap();
        assert_eq!(values.get("species"), Some(&json!("cat")));
        assert_eq!(values.get("size"), Some(&Value::Null));
        assert!(!values.contains_key("color"));
    }

    #[test]
    fn test_extract_missing_required_names_field() {
        let row = record(json!({"animal": "cat"}));
        let err = extract_values_from_query_state_by_key_definition(
            &row,
            &[KeyDefinition::required("color")],
        )
        .unwrap_err();
        assert!(matches!(err, Error::MissingField(ref name) if name == "color"));
    }

    #[test]
    fn test_key_is_stable_under_reordering() {
        let a = record(json!({"b": 2, "a": {"y": 1, "x": [1, 2]}, "c": "z"}));
        let mut b = Record::new();
        b.insert("c".into(), json!("z"));
        b.insert("a".into(), json!({"x": [1, 2], "y": 1}));
        b.insert("b".into(), json!(2));
        let (hash_a, pairs_a) = build_key(&a, &[]).unwrap();
        let (hash_b, pairs_b) = build_key(&b, &[]).unwrap();
        assert_eq!(hash_a, hash_b);
        assert_eq!(pairs_a, pairs_b);
        assert_eq!(hash_a.len(), 64);
    }

    #[test]
    fn test_key_ignores_unrelated_fields() {
        let defs = vec![KeyDefinition::required("id")];
        let (a, _) = build_key(&record(json!({"id": 1, "text": "one"})), &defs).unwrap();
        let (b, _) = build_key(&record(json!({"text": "two", "id": 1})), &defs).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_canonical_json_sorts_nested_keys() {
        let value = json!({"b": {"d": 1, "c": 2}, "a": null});
        assert_eq!(canonical_json(&value), r#"{"a":null,"b":{"c":2,"d":1}}"#);
    }
}
