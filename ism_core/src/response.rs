//! Turning raw model output into rows.

use crate::keys::clean_name;
use crate::{Error, Record, Result};
use serde_json::{Map, Value};

const FENCE: &str = "```";

/// Parses a model response into JSON with every object key cleaned.
///
/// Tries the raw text, then the first JSON body inside a fenced block (or
/// anywhere in the text), then both again with literal `\n` escapes removed.
pub fn parse_response_json(text: &str) -> Result<Value> {
    let sanitized = text.replace("\\n", "");
    for candidate in [text, sanitized.as_str()] {
        if let Some(value) = parse_candidate(candidate) {
            return Ok(clean_keys(value));
        }
    }
    Err(Error::ResponseParse {
        payload: text.to_owned(),
    })
}

/// Parses and flattens a response into rows.
pub fn parse_response(text: &str) -> Result<Vec<Record>> {
    Ok(flatten(parse_response_json(text)?))
}

fn parse_candidate(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }
    extract_embedded(fenced_body(trimmed).unwrap_or(trimmed))
}

/// Text between the first fence and its closing fence, language tag included.
fn fenced_body(text: &str) -> Option<&str> {
    let start = text.find(FENCE)? + FENCE.len();
    let rest = &text[start..];
    let end = rest.find(FENCE).unwrap_or(rest.len());
    Some(&rest[..end])
}

/// First complete JSON document in `body`.
///
/// The earliest opener wins, so an array holding objects is taken whole and an
/// object holding arrays is never cut down to its first array. The other
/// bracket kind is tried when the earliest one does not parse.
fn extract_embedded(body: &str) -> Option<Value> {
    let mut openers: Vec<usize> = ['{', '[']
        .into_iter()
        .filter_map(|open| body.find(open))
        .collect();
    openers.sort_unstable();
    openers.into_iter().find_map(|start| {
        let end = document_end(body, start)?;
        serde_json::from_str(&body[start..=end]).ok()
    })
}

/// Byte index of the bracket closing the one at `start`, skipping string contents.
fn document_end(body: &str, start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, c) in body[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(start + offset);
                }
            }
            _ => {}
        }
    }
    None
}

pub fn clean_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, value)| (clean_name(&key), clean_keys(value)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(clean_keys).collect()),
        other => other,
    }
}

/// Flattens a parsed response into rows.
///
/// Objects copy scalar fields, prefix nested object fields with `parent_`,
/// and multiply rows for every field holding an array of objects.
pub fn flatten(value: Value) -> Vec<Record> {
    match value {
        Value::Object(map) => flatten_object(map),
        Value::Array(items) => items
            .into_iter()
            .flat_map(|item| match item {
                Value::Object(map) => flatten_object(map),
                other => vec![value_row(other)],
            })
            .collect(),
        scalar => vec![value_row(scalar)],
    }
}

fn value_row(value: Value) -> Record {
    let mut row = Record::new();
    row.insert("value".to_owned(), value);
    row
}

fn is_object_array(items: &[Value]) -> bool {
    !items.is_empty() && items.iter().all(Value::is_object)
}

fn flatten_object(map: Map<String, Value>) -> Vec<Record> {
    let mut rows = vec![Record::new()];
    for (key, value) in map {
        match value {
            Value::Object(child) => {
                let prefixed = flatten_object(child)
                    .into_iter()
                    .map(|row| {
                        row.into_iter()
                            .map(|(name, value)| (format!("{key}_{name}"), value))
                            .collect()
                    })
                    .collect::<Vec<Record>>();
                rows = product(rows, &prefixed);
            }
            Value::Array(items) if is_object_array(&items) => {
                let elements = items
                    .into_iter()
                    .flat_map(|item| match item {
                        Value::Object(child) => flatten_object(child),
                        _ => Vec::new(),
                    })
                    .collect::<Vec<Record>>();
                rows = product(rows, &elements);
            }
            other => {
                for row in rows.iter_mut() {
                    row.insert(key.clone(), other.clone());
                }
            }
        }
    }
    rows
}

fn product(rows: Vec<Record>, extensions: &[Record]) -> Vec<Record> {
    if extensions.is_empty() {
        return rows;
    }
    rows.into_iter()
        .flat_map(|row| {
            extensions.iter().map(move |extension| {
                let mut merged = row.clone();
                merged.extend(extension.clone());
                merged
            })
        })
        .collect()
}
