//! Adaptive per-host rate limiting
//!
//! Each remote host gets its own request rate. A `429` halves it (down to a
//! floor), a streak of `2xx` responses adds a fixed step back (up to a
//! ceiling). Permits are spaced `1 / rate` seconds apart per host.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::core::config::RateLimitConfig;

/// Outcome of [`RateLimiter::acquire`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    /// The request may be sent now
    Permit,
    /// Try again after this delay
    MustWait(Duration),
}

/// Pacing state of one host, read-only outside this module
#[derive(Debug, Clone, PartialEq)]
pub struct HostRateState {
    /// Requests per second
    pub current_rate: f64,
    pub consecutive_error_count: u32,
    pub consecutive_success_count: u32,
    pub last_adjusted_at: Instant,
}

impl HostRateState {
    fn new(rate: f64) -> Self {
        Self {
            current_rate: rate,
            consecutive_error_count: 0,
            consecutive_success_count: 0,
            last_adjusted_at: Instant::now(),
        }
    }
}

struct HostEntry {
    state: HostRateState,
    last_granted: Option<Instant>,
}

/// Per-host AIMD rate limiter, cheap to clone and share
#[derive(Clone)]
pub struct RateLimiter {
    hosts: Arc<RwLock<HashMap<String, HostEntry>>>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            hosts: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn fresh_entry(&self) -> HostEntry {
        HostEntry {
            state: HostRateState::new(self.config.default_rate),
            last_granted: None,
        }
    }

    /// Ask for permission to send one request to `host`
    pub async fn acquire(&self, host: &str) -> Acquire {
        let mut hosts = self.hosts.write().await;
        let entry = hosts.entry(host.to_string()).or_insert_with(|| self.fresh_entry());

        let now = Instant::now();
        let interval = Duration::from_secs_f64(1.0 / entry.state.current_rate);

        match entry.last_granted {
            Some(last) if now.duration_since(last) < interval => {
                Acquire::MustWait(interval - now.duration_since(last))
            }
            _ => {
                entry.last_granted = Some(now);
                Acquire::Permit
            }
        }
    }

    /// Wait until a permit for `host` is granted
    pub async fn until_permitted(&self, host: &str) {
        loop {
            match self.acquire(host).await {
                Acquire::Permit => return,
                Acquire::MustWait(delay) => {
                    debug!(host = %host, delay_ms = delay.as_millis() as u64, "Pacing request");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Feed back the status code of a completed request
    pub async fn on_response(&self, host: &str, status: u16) {
        let mut hosts = self.hosts.write().await;
        let entry = hosts.entry(host.to_string()).or_insert_with(|| self.fresh_entry());
        let state = &mut entry.state;

        match status {
            429 => {
                let previous = state.current_rate;
                state.current_rate = (previous * self.config.backoff_factor).max(self.config.floor);
                state.consecutive_error_count = state.consecutive_error_count.saturating_add(1);
                state.consecutive_success_count = 0;
                state.last_adjusted_at = Instant::now();

                debug!(host = %host, from = previous, to = state.current_rate, "Backing off");
                if previous > self.config.floor && state.current_rate <= self.config.floor {
                    warn!(
                        host = %host,
                        rate = state.current_rate,
                        errors = state.consecutive_error_count,
                        "Host throttled down to the floor rate"
                    );
                }
            }
            200..=299 => {
                state.consecutive_success_count = state.consecutive_success_count.saturating_add(1);
                state.consecutive_error_count = 0;

                if state.consecutive_success_count >= self.config.success_streak
                    && state.current_rate < self.config.ceiling
                {
                    state.current_rate =
                        (state.current_rate + self.config.recovery_step).min(self.config.ceiling);
                    state.consecutive_success_count = 0;
                    state.last_adjusted_at = Instant::now();
                    debug!(host = %host, rate = state.current_rate, "Recovering rate");
                }
            }
            _ => {
                state.consecutive_success_count = 0;
            }
        }
    }

    /// Forget everything about `host`; it starts over at the default rate
    pub async fn reset(&self, host: &str) {
        self.hosts.write().await.remove(host);
    }

    /// Current rate of `host`, the default for hosts never seen
    pub async fn current_rate(&self, host: &str) -> f64 {
        self.hosts
            .read()
            .await
            .get(host)
            .map(|e| e.state.current_rate)
            .unwrap_or(self.config.default_rate)
    }

    pub async fn snapshot(&self, host: &str) -> Option<HostRateState> {
        self.hosts.read().await.get(host).map(|e| e.state.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn limiter() -> RateLimiter {
        RateLimiter::new(RateLimitConfig::default())
    }

    #[tokio::test]
    async fn test_backoff_on_429() {
        let limiter = limiter();
        let before = limiter.current_rate("a.example").await;

        for _ in 0..3 {
            limiter.on_response("a.example", 429).await;
        }

        let state = limiter.snapshot("a.example").await.unwrap();
        assert!(state.current_rate < before);
        assert_eq!(state.consecutive_error_count, 3);
        assert_eq!(state.consecutive_success_count, 0);
    }

    #[tokio::test]
    async fn test_backoff_respects_floor() {
        let limiter = limiter();
        for _ in 0..50 {
            limiter.on_response("a.example", 429).await;
        }
        assert_eq!(limiter.current_rate("a.example").await, limiter.config().floor);
    }

    #[tokio::test]
    async fn test_recovery_after_success_streak() {
        let limiter = limiter();
        limiter.on_response("a.example", 429).await;
        let throttled = limiter.current_rate("a.example").await;

        limiter.on_response("a.example", 200).await;
        limiter.on_response("a.example", 200).await;
        assert_eq!(limiter.current_rate("a.example").await, throttled);

        limiter.on_response("a.example", 204).await;
        let state = limiter.snapshot("a.example").await.unwrap();
        assert!(state.current_rate > throttled);
        assert_eq!(state.consecutive_error_count, 0);
    }

    #[tokio::test]
    async fn test_other_status_breaks_streak() {
        let limiter = limiter();
        limiter.on_response("a.example", 200).await;
        limiter.on_response("a.example", 200).await;
        limiter.on_response("a.example", 500).await;
        limiter.on_response("a.example", 200).await;

        let state = limiter.snapshot("a.example").await.unwrap();
        assert_eq!(state.current_rate, limiter.config().default_rate);
        assert_eq!(state.consecutive_success_count, 1);
    }

    #[tokio::test]
    async fn test_long_streaks_saturate() {
        let limiter = limiter();
        limiter.on_response("a.example", 429).await;
        limiter.hosts.write().await.get_mut("a.example").unwrap().state.consecutive_error_count = u32::MAX;
        limiter.on_response("a.example", 429).await;
        let state = limiter.snapshot("a.example").await.unwrap();
        assert_eq!(state.consecutive_error_count, u32::MAX);
        assert_eq!(state.current_rate, 0.5);

        let at_ceiling = RateLimiter::new(RateLimitConfig { default_rate: 10.0, ..Default::default() });
        at_ceiling.on_response("b.example", 200).await;
        at_ceiling.hosts.write().await.get_mut("b.example").unwrap().state.consecutive_success_count = u32::MAX;
        at_ceiling.on_response("b.example", 200).await;
        let state = at_ceiling.snapshot("b.example").await.unwrap();
        assert_eq!(state.consecutive_success_count, u32::MAX);
        assert_eq!(state.current_rate, 10.0);
    }

    #[tokio::test]
    async fn test_hosts_independent() {
        let limiter = limiter();
        limiter.on_response("b.example", 200).await;
        let b_before = limiter.snapshot("b.example").await.unwrap();

        for _ in 0..4 {
            limiter.on_response("a.example", 429).await;
        }

        assert_eq!(limiter.snapshot("b.example").await.unwrap(), b_before);
        assert_eq!(limiter.acquire("b.example").await, Acquire::Permit);
    }

    #[tokio::test]
    async fn test_reset_restores_default() {
        let limiter = limiter();
        limiter.on_response("a.example", 429).await;
        limiter.reset("a.example").await;

        assert!(limiter.snapshot("a.example").await.is_none());
        assert_eq!(limiter.current_rate("a.example").await, limiter.config().default_rate);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_spacing() {
        let limiter = limiter();
        assert_eq!(limiter.acquire("a.example").await, Acquire::Permit);

        match limiter.acquire("a.example").await {
            Acquire::MustWait(delay) => assert!(delay <= Duration::from_millis(500)),
            Acquire::Permit => panic!("second request should be paced"),
        }

        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(limiter.acquire("a.example").await, Acquire::Permit);
    }

    #[tokio::test(start_paused = true)]
    async fn test_until_permitted_waits_out_backoff() {
        let limiter = limiter();
        limiter.on_response("a.example", 429).await;
        limiter.until_permitted("a.example").await;

        let started = Instant::now();
        limiter.until_permitted("a.example").await;
        assert!(started.elapsed() >= Duration::from_secs(1));
    }

    proptest! {
        #[test]
        fn prop_rate_stays_within_bounds(statuses in prop::collection::vec(
            prop_oneof![Just(200u16), Just(204u16), Just(429u16), Just(503u16)], 0..200
        )) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap();
            rt.block_on(async {
                let limiter = limiter();
                for status in statuses {
                    limiter.on_response("h", status).await;
                    let rate = limiter.current_rate("h").await;
                    prop_assert!(rate >= limiter.config().floor);
                    prop_assert!(rate <= limiter.config().ceiling);
                }
                Ok(())
            })?;
        }

        #[test]
        fn prop_consecutive_429_strictly_lowers(n in 1usize..20) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap();
            rt.block_on(async {
                let limiter = limiter();
                let before = limiter.current_rate("h").await;
                for _ in 0..n {
                    limiter.on_response("h", 429).await;
                }
                prop_assert!(limiter.current_rate("h").await < before);
                Ok(())
            })?;
        }

        #[test]
        fn prop_successes_never_exceed_ceiling(m in 3usize..400) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap();
            rt.block_on(async {
                let limiter = limiter();
                let before = limiter.current_rate("h").await;
                for _ in 0..m {
                    limiter.on_response("h", 200).await;
                }
                let after = limiter.current_rate("h").await;
                prop_assert!(after > before);
                prop_assert!(after <= limiter.config().ceiling);
                Ok(())
            })?;
        }
    }
}
