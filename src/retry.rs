//! Retry/backoff policy shared by the crawl controller and the state machine

use crate::context::CallContext;
use crate::error::CallError;
use crate::quota::ApiResource;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

pub const INITIAL_BACKOFF_MS: u64 = 2000;
pub const BACKOFF_MULTIPLIER: u32 = 2;
const MAX_BACKOFF_SECS: u64 = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    #[serde(with = "duration_ms")]
    pub delay: Duration,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            backoff: Backoff::Fixed,
        }
    }

    pub fn exponential(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            backoff: Backoff::Exponential,
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.delay,
            Backoff::Exponential => {
                let factor = BACKOFF_MULTIPLIER.saturating_pow(retry.saturating_sub(1));
                self.delay
                    .saturating_mul(factor)
                    .min(Duration::from_secs(MAX_BACKOFF_SECS))
            }
        }
    }
}

/// Attempt ceilings per call kind. Cheap reads get more attempts than
/// mutating calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPlan {
    pub search: RetryPolicy,
    pub read: RetryPolicy,
    pub fork: RetryPolicy,
    pub clone: RetryPolicy,
    pub push: RetryPolicy,
    pub pull_request: RetryPolicy,
}

impl Default for RetryPlan {
    fn default() -> Self {
        let backoff = Duration::from_millis(INITIAL_BACKOFF_MS);
        Self {
            search: RetryPolicy::exponential(5, backoff),
            read: RetryPolicy::exponential(5, backoff),
            fork: RetryPolicy::exponential(3, Duration::from_secs(5)),
            clone: RetryPolicy::fixed(3, Duration::from_secs(3)),
            push: RetryPolicy::exponential(3, backoff),
            pull_request: RetryPolicy::exponential(3, backoff),
        }
    }
}

/// What is being called, for pacing and log lines.
#[derive(Debug, Clone, Copy)]
pub struct Call<'a> {
    pub label: &'a str,
    /// Budget consulted before each attempt. `None` for calls that do not
    /// hit the API (git transport, local disk).
    pub resource: Option<ApiResource>,
}

impl<'a> Call<'a> {
    pub fn api(label: &'a str, resource: ApiResource) -> Self {
        Self {
            label,
            resource: Some(resource),
        }
    }

    pub fn local(label: &'a str) -> Self {
        Self {
            label,
            resource: None,
        }
    }
}

/// Run `op` until it succeeds, fails terminally, or runs out of attempts.
pub async fn with_retry<T, F, Fut>(
    ctx: &CallContext,
    call: Call<'_>,
    policy: &RetryPolicy,
    mut op: F,
) -> Result<T, CallError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CallError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        if ctx.is_cancelled() {
            return Err(CallError::Cancelled);
        }
        attempt += 1;

        if let Some(resource) = call.resource {
            ctx.pace(resource).await?;
        }

        let err = match op().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(call = call.label, attempt, "succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        if !err.is_retryable() {
            return Err(err);
        }

        if attempt >= max_attempts {
            return Err(CallError::Exhausted {
                label: call.label.to_string(),
                attempts: attempt,
                last: Box::new(err),
            });
        }

        let delay = err
            .retry_after()
            .unwrap_or_else(|| policy.delay_for(attempt));
        warn!(
            call = call.label,
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "transient failure, retrying"
        );
        ctx.sleep(delay).await?;
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
