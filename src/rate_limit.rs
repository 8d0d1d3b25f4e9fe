//! Shared sliding-window request guard.
//!
//! One [`RateLimiter`] is shared by every adapter (and geocoding provider)
//! in the process; windows are keyed by source id. Each key keeps the
//! timestamps of its requests over the last 60 seconds.
//!
//! ```text
//! acquire(key, limit)
//!   ├─ drop timestamps older than 60s
//!   ├─ < requests_per_minute in the last 60s
//!   │  and < burst in the last 1s ?  ── yes ──▶ record now, return
//!   └─ no ──▶ sleep until the oldest blocking timestamp leaves its window, retry
//! ```
//!
//! Callers wait; a request is never rejected or dropped.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use casewatch_core::models::RateLimit;

const MINUTE: Duration = Duration::from_secs(60);
const SECOND: Duration = Duration::from_secs(1);

#[derive(Default)]
pub struct RateLimiter {
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until a request for `key` fits inside `limit`, then record it.
    pub async fn acquire(&self, key: &str, limit: RateLimit) {
        let per_minute = limit.requests_per_minute.max(1) as usize;
        let burst = limit.burst.max(1) as usize;

        loop {
            let wait = {
                let mut windows = self.windows.lock().await;
                let window = windows.entry(key.to_string()).or_default();
                let now = Instant::now();

                while window
                    .front()
                    .is_some_and(|&t| now.duration_since(t) >= MINUTE)
                {
                    window.pop_front();
                }

                let in_last_second = window
                    .iter()
                    .rev()
                    .take_while(|&&t| now.duration_since(t) < SECOND)
                    .count();

                if window.len() < per_minute && in_last_second < burst {
                    window.push_back(now);
                    return;
                }

                let mut wait = Duration::ZERO;
                if window.len() >= per_minute {
                    // The request that must age out is the one `per_minute` back.
                    let blocking = window[window.len() - per_minute];
                    wait = wait.max(MINUTE.saturating_sub(now.duration_since(blocking)));
                }
                if in_last_second >= burst {
                    let blocking = window[window.len() - burst];
                    wait = wait.max(SECOND.saturating_sub(now.duration_since(blocking)));
                }
                wait
            };

            if wait > SECOND {
                tracing::warn!(
                    source_id = key,
                    wait_ms = wait.as_millis() as u64,
                    "rate limit reached, waiting for window"
                );
            } else {
                tracing::debug!(source_id = key, wait_ms = wait.as_millis() as u64, "burst limit reached");
            }
            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
        }
    }

    /// Requests recorded for `key` in the last 60 seconds.
    pub async fn in_window(&self, key: &str) -> usize {
        let windows = self.windows.lock().await;
        let now = Instant::now();
        windows
            .get(key)
            .map(|w| w.iter().filter(|&&t| now.duration_since(t) < MINUTE).count())
            .unwrap_or(0)
    }
}
