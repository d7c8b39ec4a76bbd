use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tandem_core::protocol::SyncOperation;
use tokio::sync::Mutex;

use crate::config::AppConfig;
use crate::error::AppError;

/// Fixed-window limiter keyed by operation and user
#[derive(Clone)]
pub struct SyncRateLimiter {
    state: Arc<Mutex<HashMap<String, RateWindow>>>,
    window: Duration,
    limit: u32,
    metrics: Arc<RateLimitMetrics>,
}

#[derive(Default)]
struct OperationCounters {
    allowed: AtomicU64,
    limited: AtomicU64,
}

#[derive(Default)]
struct RateLimitMetrics {
    pull: OperationCounters,
    push: OperationCounters,
    conflict_resolution: OperationCounters,
}

impl RateLimitMetrics {
    const fn counters(&self, operation: SyncOperation) -> &OperationCounters {
        match operation {
            SyncOperation::Pull => &self.pull,
            SyncOperation::Push => &self.push,
            SyncOperation::ConflictResolution => &self.conflict_resolution,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct RateLimitMetricsSnapshot {
    pub pull_allowed: u64,
    pub pull_limited: u64,
    pub push_allowed: u64,
    pub push_limited: u64,
    pub resolution_allowed: u64,
    pub resolution_limited: u64,
}

#[derive(Debug, Clone, Copy)]
struct RateWindow {
    started_at: Instant,
    count: u32,
}

impl SyncRateLimiter {
    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.rate_limit_window, config.sync_rate_limit_per_window)
    }

    pub fn new(window: Duration, limit: u32) -> Self {
        Self {
            state: Arc::new(Mutex::new(HashMap::new())),
            window,
            limit,
            metrics: Arc::new(RateLimitMetrics::default()),
        }
    }

    pub async fn check(&self, operation: SyncOperation, user_id: &str) -> Result<(), AppError> {
        let key = format!("{}:{user_id}", operation.as_str());
        let now = Instant::now();
        let mut guard = self.state.lock().await;
        let entry = guard.entry(key).or_insert(RateWindow {
            started_at: now,
            count: 0,
        });

        if now.duration_since(entry.started_at) >= self.window {
            entry.started_at = now;
            entry.count = 0;
        }

        let counters = self.metrics.counters(operation);
        if entry.count >= self.limit {
            let retry_after_secs = self
                .window
                .saturating_sub(now.duration_since(entry.started_at))
                .as_secs()
                .max(1);
            counters.limited.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                operation = operation.as_str(),
                user = user_fingerprint(user_id),
                retry_after_secs,
                "Rate limit exceeded"
            );
            return Err(AppError::too_many_requests(
                "Rate limit exceeded for sync operation",
                retry_after_secs,
            ));
        }

        entry.count += 1;
        counters.allowed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn metrics_snapshot(&self) -> RateLimitMetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        RateLimitMetricsSnapshot {
            pull_allowed: load(&self.metrics.pull.allowed),
            pull_limited: load(&self.metrics.pull.limited),
            push_allowed: load(&self.metrics.push.allowed),
            push_limited: load(&self.metrics.push.limited),
            resolution_allowed: load(&self.metrics.conflict_resolution.allowed),
            resolution_limited: load(&self.metrics.conflict_resolution.limited),
        }
    }
}

/// Stable per-process hash so user ids never reach the logs
pub fn user_fingerprint(user_id: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    user_id.hash(&mut hasher);
    hasher.finish()
}
