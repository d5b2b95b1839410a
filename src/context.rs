//! Explicit call context
//!
//! Bundles the clock, the shared quota state and the run's cancellation token.
//! Every wrapper around an external call takes a `&CallContext` instead of
//! reaching for globals.

use crate::clock::{Clock, SystemClock};
use crate::error::CallError;
use crate::quota::{ApiResource, PacingPolicy, QuotaGate};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Clone)]
pub struct CallContext {
    clock: Arc<dyn Clock>,
    quota: QuotaGate,
    cancel: CancellationToken,
}

impl CallContext {
    pub fn new(clock: Arc<dyn Clock>, quota: QuotaGate, cancel: CancellationToken) -> Self {
        Self {
            clock,
            quota,
            cancel,
        }
    }

    /// Real clock, default pacing, fresh cancellation token.
    pub fn system(policy: PacingPolicy) -> Self {
        Self::new(
            Arc::new(SystemClock),
            QuotaGate::new(policy),
            CancellationToken::new(),
        )
    }

    pub fn quota(&self) -> &QuotaGate {
        &self.quota
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Sleep on the context clock. Returns `Cancelled` if the token fires first.
    pub async fn sleep(&self, duration: Duration) -> Result<(), CallError> {
        if self.cancel.is_cancelled() {
            return Err(CallError::Cancelled);
        }
        tokio::select! {
            _ = self.cancel.cancelled() => Err(CallError::Cancelled),
            _ = self.clock.sleep(duration) => Ok(()),
        }
    }

    /// Wait out an exhausted budget, then count the upcoming call against it.
    pub async fn pace(&self, resource: ApiResource) -> Result<(), CallError> {
        if let Some(wait) = self.quota.wait_for(resource, self.clock.now()) {
            info!(
                resource = resource.as_str(),
                wait_secs = wait.as_secs(),
                "API budget low, pausing until reset"
            );
            self.sleep(wait).await?;
            self.quota.mark_reset(resource);
        }
        self.quota.consume(resource);
        Ok(())
    }
}

impl std::fmt::Debug for CallContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallContext")
            .field("quota", &self.quota)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}
