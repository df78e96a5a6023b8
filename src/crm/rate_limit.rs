//! Call-rate limiter for the CRM API.
//!
//! Enforces a minimum interval between calls (≤ `rate_limit` calls per
//! second). The lock is held across the wait, so concurrent callers queue up
//! and leave in arrival order even when batch calls and plan-projector calls
//! are dispatched from different workers.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

pub struct RateLimiter {
    min_interval: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl RateLimiter {
    /// `rate_per_second` must be positive (validated by configuration).
    pub fn new(rate_per_second: f64) -> Self {
        Self {
            min_interval: Duration::from_secs_f64(1.0 / rate_per_second),
            last_call: Mutex::new(None),
        }
    }

    /// Wait until a call slot is free and claim it.
    pub async fn acquire(&self) {
        let mut last_call = self.last_call.lock().await;
        if let Some(previous) = *last_call {
            let due = previous + self.min_interval;
            let now = Instant::now();
            if now < due {
                sleep(due - now).await;
            }
        }
        *last_call = Some(Instant::now());
    }
}
