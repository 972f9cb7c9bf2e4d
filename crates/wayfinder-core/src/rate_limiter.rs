//! Sliding-window request budget for one source.
//!
//! Each adapter owns its own [`RateLimiter`]; budgets are never shared
//! between sources.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::AppError;

/// Requests allowed per window, as it appears in source configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub requests: u32,
    pub window_ms: u64,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            requests: 10,
            window_ms: 60_000,
        }
    }
}

impl RateLimit {
    pub fn new(requests: u32, window: Duration) -> Self {
        Self {
            requests,
            window_ms: window.as_millis() as u64,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.requests == 0 || self.window_ms == 0 {
            return Err(AppError::ConfigError(format!(
                "rate limit must allow at least one request per non-empty window (got {}/{}ms)",
                self.requests, self.window_ms
            )));
        }
        Ok(())
    }
}

/// Async throttle: [`wait`](Self::wait) suspends until the window has room.
///
/// Cheap to clone; clones share the same budget.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    limit: RateLimit,
    /// Send times inside the current window, oldest first.
    sent: Arc<Mutex<VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(limit: RateLimit) -> Self {
        let limit = RateLimit {
            requests: limit.requests.max(1),
            window_ms: limit.window_ms.max(1),
        };
        Self {
            limit,
            sent: Arc::new(Mutex::new(VecDeque::with_capacity(limit.requests as usize))),
        }
    }

    pub fn limit(&self) -> RateLimit {
        self.limit
    }

    /// Wait until a request slot is free, then claim it.
    pub async fn wait(&self) {
        let window = self.limit.window();
        loop {
            let mut sent = self.sent.lock().await;
            let now = Instant::now();
            prune(&mut sent, now, window);

            if sent.len() < self.limit.requests as usize {
                sent.push_back(now);
                return;
            }

            let Some(&oldest) = sent.front() else {
                continue;
            };
            let wake_at = oldest + window;
            // Drop the lock while sleeping so try_acquire callers aren't blocked.
            drop(sent);
            tracing::debug!(
                sleep_ms = %wake_at.saturating_duration_since(now).as_millis(),
                "Rate limit reached, waiting for window"
            );
            tokio::time::sleep_until(wake_at).await;
        }
    }

    /// Claim a slot without waiting. Returns false if the budget is spent.
    pub async fn try_acquire(&self) -> bool {
        let mut sent = self.sent.lock().await;
        let now = Instant::now();
        prune(&mut sent, now, self.limit.window());
        if sent.len() < self.limit.requests as usize {
            sent.push_back(now);
            true
        } else {
            false
        }
    }

    /// Remaining slots in the current window.
    pub async fn available(&self) -> u32 {
        let mut sent = self.sent.lock().await;
        prune(&mut sent, Instant::now(), self.limit.window());
        self.limit.requests.saturating_sub(sent.len() as u32)
    }
}

fn prune(sent: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(&front) = sent.front() {
        if now.duration_since(front) >= window {
            sent.pop_front();
        } else {
            break;
        }
    }
}
