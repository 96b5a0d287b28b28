//! Wire envelopes exchanged over routes.

use crate::Record;
use crate::status::ProcessorStatus;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Invalid JSON payload: {0}")]
    InvalidJson(serde_json::Error),
    #[error("Payload is not a JSON object")]
    NotAnObject,
    #[error("Invalid message: {0}")]
    InvalidMessage(serde_json::Error),
    #[error("Invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    QueryState(QueryStateMessage),
    ProcessorState(ProcessorStateMessage),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryStateMessage {
    pub route_id: String,
    #[serde(deserialize_with = "one_or_many")]
    pub query_state: Vec<Record>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessorStateMessage {
    pub route_id: String,
    pub status: ProcessorStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ProcessorStateMessage {
    pub fn new(route_id: impl Into<String>, status: ProcessorStatus) -> Self {
        Self {
            route_id: route_id.into(),
            status,
            exception: None,
            data: None,
        }
    }

    pub fn with_exception(mut self, exception: impl Into<String>) -> Self {
        self.exception = Some(exception.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

fn one_or_many<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Record>, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Object(record) => Ok(vec![record]),
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::Object(record) => Ok(record),
                other => Err(D::Error::custom(format!("query_state expects objects, got {other}"))),
            })
            .collect(),
        other => Err(D::Error::custom(format!(
            "query_state expects an object or an array of objects, got {other}"
        ))),
    }
}

impl QueryStateMessage {
    pub fn new(route_id: impl Into<String>, query_state: Vec<Record>) -> Self {
        Self {
            route_id: route_id.into(),
            query_state,
        }
    }
}

impl Message {
    pub fn route_id(&self) -> &str {
        match self {
            Message::QueryState(message) => &message.route_id,
            Message::ProcessorState(message) => &message.route_id,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Strict decoding: the payload must be a JSON object carrying a known
    /// `type` and a non-empty `route_id`.
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let value: Value = serde_json::from_slice(payload).map_err(DecodeError::InvalidJson)?;
        if !value.is_object() {
            return Err(DecodeError::NotAnObject);
        }
        let message: Message = serde_json::from_value(value).map_err(DecodeError::InvalidMessage)?;
        if message.route_id().is_empty() {
            return Err(DecodeError::InvalidField {
                field: "route_id",
                reason: "expected a non-empty string".to_owned(),
            });
        }
        Ok(message)
    }
}

/// `"<state_id>:<processor_id>"`; the processor id never contains `:`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteId {
    pub state_id: String,
    pub processor_id: String,
}

impl RouteId {
    pub fn new(state_id: impl Into<String>, processor_id: impl Into<String>) -> Self {
        Self {
            state_id: state_id.into(),
            processor_id: processor_id.into(),
        }
    }
}

impl FromStr for RouteId {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.rsplit_once(':') {
            Some((state_id, processor_id)) if !state_id.is_empty() && !processor_id.is_empty() => {
                Ok(RouteId::new(state_id, processor_id))
            }
            _ => Err(DecodeError::InvalidField {
                field: "route_id",
                reason: format!("expected <state_id>:<processor_id>, got {s}"),
            }),
        }
    }
}

impl fmt::Display for RouteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.state_id, self.processor_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_single_record_is_normalized() {
        let payload = json!({"type": "query_state", "route_id": "s1:p1", "query_state": {"a": 1}});
        let Message::QueryState(message) = Message::decode(payload.to_string().as_bytes()).unwrap() else {
            panic!("expected query_state");
        };
        assert_eq!(message.query_state.len(), 1);
        assert_eq!(message.query_state[0]["a"], json!(1));

        let serde_path: Message = serde_json::from_value(payload).unwrap();
        assert_eq!(serde_path, Message::QueryState(message));
    }

    #[test]
    fn test_rejected_payloads() {
        let cases = [
            ("not json", "Invalid JSON"),
            ("[1]", "not a JSON object"),
            (r#"{"route_id": "s:p"}"#, "missing field `type`"),
            (r#"{"type": "bogus", "route_id": "s:p"}"#, "unknown variant `bogus`"),
            (r#"{"type": "query_state", "query_state": []}"#, "missing field `route_id`"),
            (r#"{"type": "query_state", "route_id": "", "query_state": []}"#, "non-empty"),
            (r#"{"type": "query_state", "route_id": "s:p"}"#, "missing field `query_state`"),
            (r#"{"type": "query_state", "route_id": "s:p", "query_state": null}"#, "query_state expects"),
            (r#"{"type": "query_state", "route_id": "s:p", "query_state": [1]}"#, "query_state expects objects"),
            (r#"{"type": "processor_state", "route_id": "s:p", "status": "DONE"}"#, "unknown variant `DONE`"),
        ];
        for (payload, needle) in cases {
            let err = Message::decode(payload.as_bytes()).unwrap_err();
            assert!(err.to_string().contains(needle), "{payload}: {err}");
        }
    }

    #[test]
    fn test_processor_state_encoding() {
        let message = Message::ProcessorState(
            ProcessorStateMessage::new("s1:p1", ProcessorStatus::Failed)
                .with_exception("boom")
                .with_data(json!({"a": 1})),
        );
        let encoded = message.encode().unwrap();
        let value: Value = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(value["type"], json!("processor_state"));
        assert_eq!(value["status"], json!("FAILED"));
        assert_eq!(Message::decode(&encoded).unwrap(), message);
    }

    #[test]
    fn test_route_id() {
        let route: RouteId = "state:with:colons:proc-1".parse().unwrap();
        assert_eq!(route.state_id, "state:with:colons");
        assert_eq!(route.processor_id, "proc-1");
        assert_eq!(route.to_string(), "state:with:colons:proc-1");
        assert!("nocolon".parse::<RouteId>().is_err());
    }
}
