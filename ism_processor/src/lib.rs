pub mod config;
pub mod executor;
pub mod handler;
pub mod llm;
pub mod pool;
pub mod processor;
pub mod storage;

pub use config::{RuntimeConfig, RuntimeConfigError};
pub use executor::{
    ExecutionRequest, ExecutionResponse, Executor, ExecutorDyn, FnExecutor, RetryPolicy, RetryingExecutor,
};
pub use handler::ProcessorHandler;
pub use llm::{Completion, CompletionResponse, FinishReason, LLMClientDyn, LlmExecutor, anthropic_from_env};
pub use pool::{PoolConfig, PoolError, WorkerPool};
pub use processor::{BatchOutcome, EntryOutcome, ProcessError, ProcessorProfile, ResponseFormat, StateProcessor};
pub use storage::{
    MemoryStorage, ProcessorStateQuery, ProcessorStateRouteStorage, ProcessorStorage, SqliteStorage, StateStorage,
    Storage, StorageBackend, StorageError, TemplateStorage, WorkflowStorage,
};
