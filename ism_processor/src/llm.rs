//! Language model client types and the executor that drives them.

use crate::executor::{ExecutionRequest, ExecutionResponse, Executor};
use eyre::{Result, WrapErr};
use rig::client::CompletionClient;
use rig::completion::{AssistantContent, CompletionModel as _};
use rig::message::Message;
use serde_json::Value;
use std::pin::Pin;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub enum FinishReason {
    Stop,
    MaxTokens,
}

#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub choice: rig::OneOrMany<AssistantContent>,
    pub finish_reason: FinishReason,
    pub output_tokens: u64,
    pub input_tokens: u64,
}

impl CompletionResponse {
    /// Concatenated text parts of the response.
    pub fn text(&self) -> String {
        self.choice
            .iter()
            .filter_map(|content| match content {
                AssistantContent::Text(text) => Some(text.text.as_str()),
                _ => None,
            })
            .collect()
    }
}

pub struct Completion {
    pub model: String,
    pub message: Message,
    pub preamble: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
}

impl Completion {
    pub fn new(model: String, message: Message) -> Self {
        Self {
            model,
            message,
            preamble: None,
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn preamble(mut self, preamble: String) -> Self {
        self.preamble = Some(preamble);
        self
    }

    pub fn temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn max_tokens(mut self, max_tokens: u64) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

pub trait LLMClientDyn: Send + Sync {
    fn completion(
        &self,
        completion: Completion,
    ) -> Pin<Box<dyn Future<Output = Result<CompletionResponse>> + Send + '_>>;
}

/// Anthropic rejects requests without an output budget.
const DEFAULT_MAX_TOKENS: u64 = 4096;

impl LLMClientDyn for rig::providers::anthropic::Client {
    fn completion(
        &self,
        completion: Completion,
    ) -> Pin<Box<dyn Future<Output = Result<CompletionResponse>> + Send + '_>> {
        Box::pin(async move {
            let model = self.completion_model(&completion.model);
            let mut request = model
                .completion_request(completion.message)
                .max_tokens(completion.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS));
            if let Some(preamble) = completion.preamble {
                request = request.preamble(preamble);
            }
            if let Some(temperature) = completion.temperature {
                request = request.temperature(temperature);
            }
            let response = request.send().await?;
            Ok(CompletionResponse {
                choice: response.choice,
                finish_reason: FinishReason::Stop,
                output_tokens: response.usage.output_tokens,
                input_tokens: response.usage.input_tokens,
            })
        })
    }
}

pub const ANTHROPIC_API_KEY_VAR: &str = "ANTHROPIC_API_KEY";

pub fn anthropic_from_env() -> Result<Arc<dyn LLMClientDyn>> {
    let api_key =
        std::env::var(ANTHROPIC_API_KEY_VAR).wrap_err_with(|| format!("{ANTHROPIC_API_KEY_VAR} is not set"))?;
    Ok(Arc::new(rig::providers::anthropic::Client::new(&api_key)))
}

/// Executes requests as a single-turn chat completion.
///
/// `model_name`, `temperature` and `max_tokens` are read from the request
/// properties; the model falls back to the executor default.
pub struct LlmExecutor {
    client: Arc<dyn LLMClientDyn>,
    default_model: String,
}

impl LlmExecutor {
    pub fn new(client: Arc<dyn LLMClientDyn>, default_model: impl Into<String>) -> Self {
        Self {
            client,
            default_model: default_model.into(),
        }
    }

    fn completion(&self, request: ExecutionRequest) -> Completion {
        let properties = &request.properties;
        let model = properties
            .get("model_name")
            .and_then(Value::as_str)
            .unwrap_or(&self.default_model)
            .to_owned();
        let mut completion = Completion::new(model, Message::user(request.user_prompt.clone()));
        if let Some(system_prompt) = request.system_prompt.clone().filter(|s| !s.is_empty()) {
            completion = completion.preamble(system_prompt);
        }
        if let Some(temperature) = properties.get("temperature").and_then(Value::as_f64) {
            completion = completion.temperature(temperature);
        }
        if let Some(max_tokens) = properties.get("max_tokens").and_then(Value::as_u64) {
            completion = completion.max_tokens(max_tokens);
        }
        completion
    }
}

impl Executor for LlmExecutor {
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResponse> {
        let completion = self.completion(request);
        let model = completion.model.clone();
        let response = self.client.completion(completion).await?;
        tracing::debug!(
            model = %model,
            input_tokens = response.input_tokens,
            output_tokens = response.output_tokens,
            "completion finished"
        );
        let text = response.text();
        if text.is_empty() {
            eyre::bail!("model {model} returned no text content");
        }
        Ok(ExecutionResponse::new(text))
    }
}
