use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tracing::{debug, info};
use url::Url;

/// Latency window length per endpoint.
const LATENCY_WINDOW: usize = 500;
/// RPS accounting window in seconds.
const RPS_WINDOW_SECS: u64 = 10;
/// Dynamic requests-per-second limit bounds and start value.
const RPS_LIMIT_INITIAL: f64 = 100.0;
const RPS_LIMIT_MIN: f64 = 3.0;
const RPS_LIMIT_MAX: f64 = 500.0;
/// Consecutive high-utilization windows required before raising the limit.
const HIGH_USAGE_WINDOWS_TO_GROW: u32 = 10;
/// Growth and decay factors applied to the limit.
const RPS_GROWTH: f64 = 1.08;
const RPS_DECAY: f64 = 0.95;
/// Warm-up endpoints take at most this many concurrent requests.
const WARMING_UP_CONNECTION_CAP: usize = 3;
/// Reactivation backoff bounds.
const REACTIVATION_DELAY_INITIAL_MS: u64 = 100;
const REACTIVATION_DELAY_MAX_MS: u64 = 5_000;

/// Why an endpoint is being put on cooldown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CooldownReason {
    RateLimited,
    Timeout,
}

#[derive(Debug)]
struct LatencySample {
    millis: f64,
    success: bool,
}

#[derive(Debug)]
struct EndpointState {
    active: bool,
    warming_up: bool,
    latencies: VecDeque<LatencySample>,
    /// Running sum over successful samples currently in the window.
    latency_sum_ms: f64,
    successful_samples: usize,
    /// Per-second request counts for the trailing window, newest last.
    rps_buckets: VecDeque<(u64, u32)>,
    rps_limit: f64,
    consecutive_successful_requests: u64,
    high_usage_windows: u32,
    reactivation_delay_ms: u64,
}

impl EndpointState {
    fn new() -> Self {
        EndpointState {
            active: true,
            warming_up: false,
            latencies: VecDeque::with_capacity(LATENCY_WINDOW),
            latency_sum_ms: 0.0,
            successful_samples: 0,
            rps_buckets: VecDeque::new(),
            rps_limit: RPS_LIMIT_INITIAL,
            consecutive_successful_requests: 0,
            high_usage_windows: 0,
            reactivation_delay_ms: REACTIVATION_DELAY_INITIAL_MS,
        }
    }

    /// Drop RPS samples older than the window and fold completed seconds
    /// into the high-utilization streak.
    fn prune_rps(&mut self, now_sec: u64) {
        let cutoff = now_sec.saturating_sub(RPS_WINDOW_SECS);
        while let Some(&(second, count)) = self.rps_buckets.front() {
            if second > cutoff {
                break;
            }
            if f64::from(count) >= self.rps_limit * 0.9 {
                self.high_usage_windows += 1;
            } else {
                self.high_usage_windows = 0;
            }
            self.rps_buckets.pop_front();
        }
    }

    fn current_second_count(&self, now_sec: u64) -> u32 {
        match self.rps_buckets.back() {
            Some(&(second, count)) if second == now_sec => count,
            _ => 0,
        }
    }

    fn windowed_average(&self) -> f64 {
        if self.rps_buckets.is_empty() {
            return 0.0;
        }
        let total: u64 = self.rps_buckets.iter().map(|&(_, c)| u64::from(c)).sum();
        total as f64 / RPS_WINDOW_SECS as f64
    }

    fn push_sample(&mut self, sample: LatencySample) {
        if self.latencies.len() == LATENCY_WINDOW {
            if let Some(evicted) = self.latencies.pop_front() {
                if evicted.success {
                    self.latency_sum_ms -= evicted.millis;
                    self.successful_samples -= 1;
                }
            }
        }
        if sample.success {
            self.latency_sum_ms += sample.millis;
            self.successful_samples += 1;
        }
        self.latencies.push_back(sample);
    }

    fn expected_latency(&self) -> f64 {
        if self.successful_samples == 0 {
            // Unproven endpoints look fast so they get sampled.
            0.0
        } else {
            self.latency_sum_ms / self.successful_samples as f64
        }
    }
}

/// One upstream JSON-RPC endpoint with its adaptive rate-control state.
#[derive(Debug)]
pub(crate) struct Endpoint {
    pub url: Url,
    active_connections: AtomicUsize,
    state: Mutex<EndpointState>,
}

impl Endpoint {
    pub fn new(url: Url) -> Self {
        Endpoint {
            url,
            active_connections: AtomicUsize::new(0),
            state: Mutex::new(EndpointState::new()),
        }
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Whether the endpoint may take one more request right now.
    pub fn is_available(&self, now_sec: u64) -> bool {
        let mut state = self.state.lock().unwrap();
        if !state.active {
            return false;
        }
        state.prune_rps(now_sec);

        if f64::from(state.current_second_count(now_sec) + 1) > state.rps_limit {
            return false;
        }
        if state.windowed_average() > state.rps_limit {
            return false;
        }
        if state.warming_up && self.active_connections() > WARMING_UP_CONNECTION_CAP {
            return false;
        }
        true
    }

    pub fn expected_latency(&self) -> f64 {
        self.state.lock().unwrap().expected_latency()
    }

    /// Account one outgoing request against the current second.
    pub fn begin_request(&self, now_sec: u64) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock().unwrap();
        state.prune_rps(now_sec);
        match state.rps_buckets.back_mut() {
            Some((second, count)) if *second == now_sec => *count += 1,
            _ => state.rps_buckets.push_back((now_sec, 1)),
        }
    }

    pub fn end_request(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_success(&self, latency: Duration) {
        let mut state = self.state.lock().unwrap();
        state.push_sample(LatencySample { millis: latency.as_secs_f64() * 1000.0, success: true });
        state.consecutive_successful_requests += 1;
        if state.warming_up {
            state.warming_up = false;
        }

        // Only raise the limit once sustained utilization proves demand and a
        // long success streak proves the provider tolerates it.
        if state.high_usage_windows >= HIGH_USAGE_WINDOWS_TO_GROW
            && state.consecutive_successful_requests as f64 >= 5.0 * state.rps_limit
        {
            let previous = state.rps_limit;
            state.rps_limit = (state.rps_limit * RPS_GROWTH).min(RPS_LIMIT_MAX);
            state.high_usage_windows = 0;
            state.consecutive_successful_requests = 0;
            info!(
                endpoint = %self.url,
                previous_limit = previous,
                new_limit = state.rps_limit,
                "raised endpoint rps limit"
            );
        }
    }

    pub fn record_failure(&self, latency: Duration) {
        let mut state = self.state.lock().unwrap();
        state.push_sample(LatencySample { millis: latency.as_secs_f64() * 1000.0, success: false });
        state.consecutive_successful_requests = 0;
    }

    /// Deactivate after a rate-limit or timeout and return how long to wait
    /// before reactivating.
    pub fn cooldown(&self, reason: CooldownReason) -> Duration {
        let mut state = self.state.lock().unwrap();
        state.active = false;
        state.rps_limit = (state.rps_limit * RPS_DECAY).max(RPS_LIMIT_MIN);
        state.consecutive_successful_requests = 0;

        let delay_ms = state.reactivation_delay_ms;
        state.reactivation_delay_ms = match reason {
            CooldownReason::RateLimited => {
                (delay_ms * 3 / 2).min(REACTIVATION_DELAY_MAX_MS)
            }
            CooldownReason::Timeout => REACTIVATION_DELAY_INITIAL_MS,
        };

        debug!(
            endpoint = %self.url,
            ?reason,
            delay_ms,
            rps_limit = state.rps_limit,
            "endpoint placed on cooldown"
        );
        Duration::from_millis(delay_ms)
    }

    pub fn reactivate(&self) {
        let mut state = self.state.lock().unwrap();
        state.active = true;
        state.warming_up = true;
        debug!(endpoint = %self.url, "endpoint reactivated, warming up");
    }

    #[cfg(test)]
    pub fn rps_limit(&self) -> f64 {
        self.state.lock().unwrap().rps_limit
    }

    #[cfg(test)]
    pub fn is_active(&self) -> bool {
        self.state.lock().unwrap().active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> Endpoint {
        Endpoint::new(Url::parse("http://localhost:5050").unwrap())
    }

    #[test]
    fn test_expected_latency_ignores_failures() {
        let ep = endpoint();
        ep.record_success(Duration::from_millis(100));
        ep.record_success(Duration::from_millis(200));
        ep.record_failure(Duration::from_millis(10_000));

        let expected = ep.expected_latency();
        assert!((expected - 150.0).abs() < 1e-6);
    }

    #[test]
    fn test_rps_limit_decays_on_cooldown_and_floors() {
        let ep = endpoint();
        for _ in 0..200 {
            ep.cooldown(CooldownReason::RateLimited);
            ep.reactivate();
        }
        assert!((ep.rps_limit() - 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_reactivation_delay_grows_then_resets_on_timeout() {
        let ep = endpoint();
        let first = ep.cooldown(CooldownReason::RateLimited);
        assert_eq!(first, Duration::from_millis(100));
        let second = ep.cooldown(CooldownReason::RateLimited);
        assert_eq!(second, Duration::from_millis(150));

        // Timeouts use the current delay but reset the backoff afterwards.
        let third = ep.cooldown(CooldownReason::Timeout);
        assert_eq!(third, Duration::from_millis(225));
        let fourth = ep.cooldown(CooldownReason::RateLimited);
        assert_eq!(fourth, Duration::from_millis(100));
    }

    #[test]
    fn test_reactivation_delay_caps_at_five_seconds() {
        let ep = endpoint();
        let mut last = Duration::ZERO;
        for _ in 0..30 {
            last = ep.cooldown(CooldownReason::RateLimited);
        }
        assert_eq!(last, Duration::from_millis(5_000));
    }

    #[test]
    fn test_availability_respects_per_second_budget() {
        let ep = endpoint();
        {
            let mut state = ep.state.lock().unwrap();
            state.rps_limit = 3.0;
        }
        let now = 1_000;
        assert!(ep.is_available(now));
        for _ in 0..3 {
            ep.begin_request(now);
            ep.end_request();
        }
        assert!(!ep.is_available(now));
        // The next second opens a fresh budget.
        assert!(ep.is_available(now + 1));
    }

    #[test]
    fn test_inactive_endpoint_unavailable_until_reactivated() {
        let ep = endpoint();
        ep.cooldown(CooldownReason::Timeout);
        assert!(!ep.is_available(1_000));
        ep.reactivate();
        assert!(ep.is_available(1_000));
    }
}
