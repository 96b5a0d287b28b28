#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Row index {index} out of range for state with {count} rows")]
    RowOutOfRange { index: usize, count: usize },
    #[error("Column already exists: {0}")]
    ColumnExists(String),
    #[error("Unknown state type: {0}")]
    UnknownStateType(String),
    #[error("Could not parse response as JSON: {payload}")]
    ResponseParse { payload: String },
    #[error(transparent)]
    Transition(#[from] crate::status::TransitionError),
    #[error("Expression error: {0}")]
    Expression(#[from] crate::expr::ExprError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Binary serialization error: {0}")]
    Binary(#[from] serde_cbor::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
