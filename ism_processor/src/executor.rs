//! Boundary between a processor and whatever produces its responses.

use eyre::Result;
use ism_core::Record;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub user_prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// Processor properties such as model name, temperature and max tokens.
    #[serde(default)]
    pub properties: Map<String, Value>,
    #[serde(default)]
    pub query_state: Record,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResponse {
    pub raw: String,
}

impl ExecutionResponse {
    pub fn new(raw: impl Into<String>) -> Self {
        Self { raw: raw.into() }
    }
}

pub trait Executor: Send + Sync {
    fn execute(&self, request: ExecutionRequest) -> impl Future<Output = Result<ExecutionResponse>> + Send;

    fn into_dyn(self) -> Arc<dyn ExecutorDyn>
    where
        Self: Sized + 'static,
    {
        Arc::new(self)
    }
}

pub trait ExecutorDyn: Send + Sync {
    fn execute(
        &self,
        request: ExecutionRequest,
    ) -> Pin<Box<dyn Future<Output = Result<ExecutionResponse>> + Send + '_>>;
}

impl<T: Executor> ExecutorDyn for T {
    fn execute(
        &self,
        request: ExecutionRequest,
    ) -> Pin<Box<dyn Future<Output = Result<ExecutionResponse>> + Send + '_>> {
        Box::pin(Executor::execute(self, request))
    }
}

/// Synchronous executor backed by a closure.
pub struct FnExecutor<F> {
    func: F,
}

impl<F> FnExecutor<F>
where
    F: Fn(&ExecutionRequest) -> Result<ExecutionResponse> + Send + Sync,
{
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

impl<F> Executor for FnExecutor<F>
where
    F: Fn(&ExecutionRequest) -> Result<ExecutionResponse> + Send + Sync,
{
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResponse> {
        (self.func)(&request)
    }
}

/// Exponential backoff with proportional jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the delay added at random, `0.0` disables jitter.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let base = self
            .initial_delay
            .saturating_mul(1 << exponent)
            .min(self.max_delay);
        if self.jitter <= 0.0 {
            return base;
        }
        let factor = rand::thread_rng().gen_range(0.0..=self.jitter);
        base.mul_f64(1.0 + factor).min(self.max_delay)
    }
}

pub struct RetryingExecutor<E: Executor> {
    inner: E,
    policy: RetryPolicy,
}

impl<E: Executor> RetryingExecutor<E> {
    pub fn new(inner: E, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

impl<E: Executor> Executor for RetryingExecutor<E> {
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResponse> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match Executor::execute(&self.inner, request.clone()).await {
                Ok(response) => return Ok(response),
                Err(err) if attempt < max_attempts => {
                    let delay = self.policy.delay_for(attempt);
                    tracing::warn!(attempt, max_attempts, ?delay, error = %err, "execution failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    return Err(err.wrap_err(format!("execution failed after {attempt} attempts")));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            jitter: 0.5,
        }
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let flaky = FnExecutor::new(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                eyre::bail!("transient");
            }
            Ok(ExecutionResponse::new("ok"))
        });
        let executor = RetryingExecutor::new(flaky, fast_policy(3));
        let response = Executor::execute(&executor, ExecutionRequest::default())
            .await
            .unwrap();
        assert_eq!(response.raw, "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up() {
        let failing = FnExecutor::new(|_| Err(eyre::eyre!("down")));
        let executor = RetryingExecutor::new(failing, fast_policy(2)).into_dyn();
        let err = executor.execute(ExecutionRequest::default()).await.unwrap_err();
        let text = format!("{err:#}");
        assert!(text.contains("after 2 attempts"), "{text}");
        assert!(text.contains("down"), "{text}");
    }

    #[test]
    fn test_delay_growth_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            jitter: 0.0,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(350));
        let jittered = RetryPolicy { jitter: 0.5, ..policy };
        let delay = jittered.delay_for(1);
        assert!(delay >= Duration::from_millis(100) && delay <= Duration::from_millis(151));
    }
}
