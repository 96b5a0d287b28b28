pub mod column;
pub mod config;
pub mod envelope;
pub mod error;
pub mod expr;
pub mod keys;
pub mod response;
pub mod state;
pub mod status;
pub mod template;

pub use column::{ColumnDefinition, ColumnIndex, DataType, RowColumnData};
pub use config::{Alias, Config, ConfigKind, RemapRule, StateConfig, StateType, StorageClass};
pub use envelope::{DecodeError, Message, ProcessorStateMessage, QueryStateMessage, RouteId};
pub use error::{Error, Result};
pub use keys::KeyDefinition;
pub use state::State;
pub use status::{ProcessorState, ProcessorStatus, StateDirection, TransitionError};

/// One flat key-value row flowing through the pipeline.
pub type Record = serde_json::Map<String, serde_json::Value>;
