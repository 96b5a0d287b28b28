use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    #[default]
    Str,
    Int,
    Float,
    Bool,
    Json,
    Vector,
    Datetime,
}

impl DataType {
    /// Best guess for a column from one of its values.
    pub fn infer(value: &Value) -> Self {
        match value {
            Value::Bool(_) => DataType::Bool,
            Value::Number(n) if n.is_i64() || n.is_u64() => DataType::Int,
            Value::Number(_) => DataType::Float,
            Value::Array(items) if !items.is_empty() && items.iter().all(Value::is_number) => {
                DataType::Vector
            }
            Value::Array(_) | Value::Object(_) => DataType::Json,
            Value::String(_) | Value::Null => DataType::Str,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDefinition {
    pub name: String,
    #[serde(default)]
    pub data_type: DataType,
    #[serde(default)]
    pub required: bool,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    /// Constant value, or an expression source when `callable` is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default)]
    pub callable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<u32>,
}

fn default_nullable() -> bool {
    true
}

impl ColumnDefinition {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            required: false,
            nullable: true,
            value: None,
            callable: false,
            max_length: None,
            dimensions: None,
        }
    }

    pub fn inferred(name: impl Into<String>, value: &Value) -> Self {
        Self::new(name, DataType::infer(value))
    }

    pub fn constant(name: impl Into<String>, value: Value) -> Self {
        let data_type = DataType::infer(&value);
        Self {
            value: Some(value),
            ..Self::new(name, data_type)
        }
    }

    pub fn callable(name: impl Into<String>, expression: impl Into<String>) -> Self {
        Self {
            value: Some(Value::String(expression.into())),
            callable: true,
            ..Self::new(name, DataType::Str)
        }
    }

    pub fn with_required(mut self, required: bool) -> Self {
        self.required = required;
        self.nullable = !required;
        self
    }

    pub fn with_max_length(mut self, max_length: u32) -> Self {
        self.max_length = Some(max_length);
        self
    }

    pub fn with_dimensions(mut self, dimensions: u32) -> Self {
        self.dimensions = Some(dimensions);
        self
    }

    /// Columns that inject a value into every applied record.
    pub fn is_derived(&self) -> bool {
        self.value.as_ref().is_some_and(|value| !value.is_null())
    }
}

/// Values of one column, one entry per row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowColumnData {
    pub values: Vec<Value>,
}

impl RowColumnData {
    pub fn nulls(count: usize) -> Self {
        Self {
            values: vec![Value::Null; count],
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn push(&mut self, value: Value) {
        self.values.push(value);
    }

    /// Pads with nulls up to `count` entries.
    pub fn pad_to(&mut self, count: usize) {
        if self.values.len() < count {
            self.values.resize(count, Value::Null);
        }
    }
}

/// Row positions that share one row key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ColumnIndex {
    pub positions: Vec<usize>,
}

impl ColumnIndex {
    pub fn first(&self) -> Option<usize> {
        self.positions.first().copied()
    }

    pub fn push(&mut self, position: usize) {
        self.positions.push(position);
    }
}
