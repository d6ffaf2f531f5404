use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tonic::{Code, Status};

use crate::config::AppConfig;
use crate::errors::{ErrorCategory, ServiceError};
use crate::metrics::Metrics;

// ============================================================================
// RPC command contract
// ============================================================================
//
// Command handlers are retried only on transient (optimistic concurrency)
// failures, with exponential backoff. Whatever still fails is reported to
// the caller as a tonic Status whose code follows the error category.
//
// ============================================================================

#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub retries: u32,
    /// Delay before the first retry
    pub min_delay: Duration,
    /// Multiplier applied to the delay after each retry
    pub factor: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 2,
            min_delay: Duration::from_millis(50),
            factor: 2,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            retries: config.rpc_retries,
            min_delay: config.rpc_retry_min_delay,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1);
        self.min_delay
            .saturating_mul(self.factor.max(1).saturating_pow(exponent))
    }
}

pub fn status_code(category: ErrorCategory) -> Code {
    match category {
        ErrorCategory::Aborted => Code::Aborted,
        ErrorCategory::InvalidArgument => Code::InvalidArgument,
        ErrorCategory::NotFound => Code::NotFound,
        ErrorCategory::AlreadyExists => Code::AlreadyExists,
        ErrorCategory::Unavailable => Code::Unavailable,
        ErrorCategory::Internal => Code::Internal,
    }
}

pub fn to_status<E: ServiceError>(error: &E) -> Status {
    Status::new(status_code(error.category()), error.to_string())
}

/// Runs command handlers under a `RetryPolicy`.
#[derive(Clone, Default)]
pub struct CommandRunner {
    policy: RetryPolicy,
    metrics: Option<Arc<Metrics>>,
}

impl CommandRunner {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, metrics: None }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// `operation` receives the attempt number, starting at 1.
    pub async fn handle_command<F, Fut, T, E>(&self, name: &str, mut operation: F) -> Result<T, Status>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: ServiceError,
    {
        let mut attempt = 0;

        loop {
            attempt += 1;

            match operation(attempt).await {
                Ok(result) => {
                    if attempt > 1 {
                        tracing::info!(command = %name, attempt = attempt, "Command succeeded after retry");
                    }
                    return Ok(result);
                }
                Err(error) => {
                    if !error.is_transient() {
                        tracing::warn!(
                            command = %name,
                            category = error.category().as_str(),
                            error = %error,
                            "Command failed"
                        );
                        return Err(to_status(&error));
                    }

                    if attempt > self.policy.retries {
                        tracing::error!(
                            command = %name,
                            attempt = attempt,
                            error = %error,
                            "Command failed after all retries"
                        );
                        return Err(to_status(&error));
                    }

                    let delay = self.policy.delay(attempt);
                    tracing::warn!(
                        command = %name,
                        attempt = attempt,
                        error = %error,
                        delay_ms = delay.as_millis() as u64,
                        "Transient failure, retrying after delay"
                    );
                    if let Some(metrics) = &self.metrics {
                        metrics.record_command_retry(name);
                    }

                    sleep(delay).await;
                }
            }
        }
    }
}
