use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::cancel::CancelToken;
use crate::config::{HttpConfig, RateLimit};
use crate::error::Result;

/// Sliding list of request timestamps for one host.
#[derive(Debug)]
pub struct RateWindow {
    limit: RateLimit,
    stamps: VecDeque<Instant>,
}

impl RateWindow {
    pub fn new(limit: RateLimit) -> Self {
        Self {
            limit,
            stamps: VecDeque::with_capacity(limit.max_requests),
        }
    }

    /// Records `now` if the window has room, otherwise returns how long until it does.
    pub fn try_reserve(&mut self, now: Instant) -> std::result::Result<(), Duration> {
        while let Some(oldest) = self.stamps.front() {
            if now.duration_since(*oldest) >= self.limit.window {
                self.stamps.pop_front();
            } else {
                break;
            }
        }
        if self.stamps.len() < self.limit.max_requests {
            self.stamps.push_back(now);
            return Ok(());
        }
        let oldest = self.stamps.front().copied().unwrap_or(now);
        Err((oldest + self.limit.window).saturating_duration_since(now))
    }

    pub fn len(&self) -> usize {
        self.stamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stamps.is_empty()
    }
}

/// Per-host windows. Each host has its own lock, so a busy provider never
/// blocks requests to another one.
#[derive(Debug)]
pub struct RateLimiter {
    default_limit: RateLimit,
    limits: HashMap<String, RateLimit>,
    windows: Mutex<HashMap<String, Arc<Mutex<RateWindow>>>>,
}

impl RateLimiter {
    pub fn new(config: &HttpConfig) -> Self {
        Self {
            default_limit: config.default_rate_limit,
            limits: config.rate_limits.clone(),
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Blocks until `host` has room in its window, then records the request.
    pub fn acquire(&self, host: &str, cancel: &CancelToken) -> Result<Duration> {
        let window = self.window_for(host);
        let mut waited = Duration::ZERO;
        loop {
            cancel.check()?;
            let verdict = {
                let mut window = window.lock().unwrap_or_else(|e| e.into_inner());
                window.try_reserve(Instant::now())
            };
            match verdict {
                Ok(()) => return Ok(waited),
                Err(wait) => {
                    debug!(host = %host, wait_ms = wait.as_millis() as u64, "rate limit window full");
                    // Lock is released before sleeping.
                    cancel.sleep(wait.max(Duration::from_millis(1)))?;
                    waited += wait;
                }
            }
        }
    }

    fn window_for(&self, host: &str) -> Arc<Mutex<RateWindow>> {
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        windows
            .entry(host.to_string())
            .or_insert_with(|| {
                let limit = self.limits.get(host).copied().unwrap_or(self.default_limit);
                Arc::new(Mutex::new(RateWindow::new(limit)))
            })
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_reports_wait_until_oldest_expires() {
        let mut window = RateWindow::new(RateLimit::new(2, Duration::from_secs(10)));
        let t0 = Instant::now();
        assert!(window.try_reserve(t0).is_ok());
        assert!(window.try_reserve(t0 + Duration::from_secs(1)).is_ok());
        let wait = window
            .try_reserve(t0 + Duration::from_secs(4))
            .expect_err("window is full");
        assert_eq!(wait, Duration::from_secs(6));
        assert!(window.try_reserve(t0 + Duration::from_secs(10)).is_ok());
        assert_eq!(window.len(), 2);
    }
}
