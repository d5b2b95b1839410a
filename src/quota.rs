//! API call budget tracking
//!
//! GitHub reports the remaining budget and its reset time on every response.
//! [`QuotaGate`] keeps the latest report per resource and answers one
//! question before each call: how long do we have to wait?

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Budgets GitHub tracks separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiResource {
    Search,
    Core,
}

impl ApiResource {
    /// Parse the `X-RateLimit-Resource` header value.
    pub fn from_header(value: &str) -> Option<Self> {
        match value.trim() {
            "search" | "code_search" => Some(ApiResource::Search),
            "core" => Some(ApiResource::Core),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ApiResource::Search => "search",
            ApiResource::Core => "core",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
pub struct PacingPolicy {
    /// Sleep once the remaining budget drops below this.
    pub low_water: u32,
    /// Added on top of the reported reset time.
    pub safety_margin: Duration,
}

impl Default for PacingPolicy {
    fn default() -> Self {
        Self {
            low_water: 5,
            safety_margin: Duration::from_secs(5),
        }
    }
}

impl Quota {
    /// How long to wait before the next call, if at all.
    pub fn wait_needed(&self, now: DateTime<Utc>, policy: &PacingPolicy) -> Option<Duration> {
        if self.remaining >= policy.low_water {
            return None;
        }
        let until_reset = (self.reset_at - now).to_std().unwrap_or(Duration::ZERO);
        Some(until_reset + policy.safety_margin)
    }
}

/// Process-wide quota state. Cloning shares the same state.
#[derive(Debug, Clone, Default)]
pub struct QuotaGate {
    inner: Arc<Mutex<HashMap<ApiResource, Quota>>>,
    policy: PacingPolicy,
}

impl QuotaGate {
    pub fn new(policy: PacingPolicy) -> Self {
        Self {
            inner: Arc::default(),
            policy,
        }
    }

    /// Store the latest server report for a resource.
    pub fn record(&self, resource: ApiResource, quota: Quota) {
        self.lock().insert(resource, quota);
    }

    pub fn get(&self, resource: ApiResource) -> Option<Quota> {
        self.lock().get(&resource).copied()
    }

    /// Count one call against the local view of the budget. The next response
    /// header overwrites this with the authoritative value.
    pub fn consume(&self, resource: ApiResource) {
        if let Some(quota) = self.lock().get_mut(&resource) {
            quota.remaining = quota.remaining.saturating_sub(1);
        }
    }

    pub fn wait_for(&self, resource: ApiResource, now: DateTime<Utc>) -> Option<Duration> {
        self.get(resource)
            .and_then(|quota| quota.wait_needed(now, &self.policy))
    }

    /// Forget the report for a resource once its reset time has passed.
    pub fn mark_reset(&self, resource: ApiResource) {
        self.lock().remove(&resource);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ApiResource, Quota>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
