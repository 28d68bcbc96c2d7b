//! Reconnect policy for the decoder side of a feed.
//!
//! Exponential backoff with uniform jitter in `[0, 0.1 * current_delay]`,
//! capped at `max_delay`. After `max_consecutive_failures` the policy orders
//! an extended cooldown and resets itself.

use rand::Rng;
use std::time::Duration;

use crate::config::ResilienceConfig;

/// What the caller should do after reporting a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffAction {
    /// Sleep this long, then reconnect
    Retry(Duration),
    /// Too many consecutive failures: sleep the extended cooldown, counters
    /// are already reset
    Cooldown(Duration),
}

#[derive(Debug)]
pub struct ReconnectPolicy {
    base_delay: Duration,
    max_delay: Duration,
    cooldown: Duration,
    max_consecutive_failures: u32,

    consecutive_failures: u32,
    current_delay: Duration,
}

impl ReconnectPolicy {
    pub fn new(cfg: &ResilienceConfig) -> Self {
        let base_delay = Duration::from_millis(cfg.base_delay_ms);
        ReconnectPolicy {
            base_delay,
            max_delay: Duration::from_millis(cfg.max_delay_ms),
            cooldown: Duration::from_millis(cfg.extended_cooldown_ms),
            max_consecutive_failures: cfg.max_consecutive_failures,
            consecutive_failures: 0,
            current_delay: base_delay,
        }
    }

    /// A connection produced at least one frame: reset the state machine
    pub fn on_success(&mut self) {
        self.consecutive_failures = 0;
        self.current_delay = self.base_delay;
    }

    pub fn on_failure(&mut self) -> BackoffAction {
        let jitter_frac = rand::thread_rng().gen_range(0.0..1.0);
        self.on_failure_with_jitter(jitter_frac)
    }

    /// Deterministic core: `jitter_frac` in [0, 1) selects the point inside
    /// the jitter window `[0, 0.1 * current_delay]`.
    pub fn on_failure_with_jitter(&mut self, jitter_frac: f64) -> BackoffAction {
        self.consecutive_failures += 1;

        if self.consecutive_failures >= self.max_consecutive_failures {
            let cooldown = self.cooldown;
            self.consecutive_failures = 0;
            self.current_delay = self.base_delay;
            return BackoffAction::Cooldown(cooldown);
        }

        let jitter = self.current_delay.mul_f64(0.1 * jitter_frac);
        let delay = (self.current_delay + jitter).min(self.max_delay);

        self.current_delay = (self.current_delay * 2).min(self.max_delay);
        BackoffAction::Retry(delay)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_failures: u32) -> ReconnectPolicy {
        ReconnectPolicy::new(&ResilienceConfig {
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            max_consecutive_failures: max_failures,
            extended_cooldown_ms: 60_000,
            max_frame_errors: 50,
        })
    }

    #[test]
    fn delays_double_until_cap() {
        let mut p = policy(100);
        let mut delays = Vec::new();
        for _ in 0..8 {
            match p.on_failure_with_jitter(0.0) {
                BackoffAction::Retry(d) => delays.push(d.as_millis() as u64),
                BackoffAction::Cooldown(_) => panic!("unexpected cooldown"),
            }
        }
        assert_eq!(delays, vec![500, 1000, 2000, 4000, 8000, 16000, 30000, 30000]);
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        let mut p = policy(100);
        match p.on_failure_with_jitter(1.0 - f64::EPSILON) {
            BackoffAction::Retry(d) => {
                assert!(d >= Duration::from_millis(500));
                assert!(d <= Duration::from_millis(550));
            }
            _ => panic!("unexpected cooldown"),
        }
    }

    #[test]
    fn cooldown_after_max_failures_resets_counters() {
        let mut p = policy(3);

        assert!(matches!(p.on_failure_with_jitter(0.0), BackoffAction::Retry(_)));
        assert!(matches!(p.on_failure_with_jitter(0.0), BackoffAction::Retry(_)));

        match p.on_failure_with_jitter(0.0) {
            BackoffAction::Cooldown(d) => assert_eq!(d, Duration::from_secs(60)),
            _ => panic!("expected cooldown on third failure"),
        }

        assert_eq!(p.consecutive_failures(), 0);
        assert_eq!(p.current_delay(), Duration::from_millis(500));
    }

    #[test]
    fn total_retry_sleep_is_bounded() {
        // With max_consecutive_failures = 3 the two retry sleeps before the
        // cooldown total between 1500 ms and 1650 ms (1.1x with full jitter).
        let mut lo = policy(3);
        let mut hi = policy(3);
        let mut total_lo = Duration::ZERO;
        let mut total_hi = Duration::ZERO;

        for _ in 0..2 {
            if let BackoffAction::Retry(d) = lo.on_failure_with_jitter(0.0) {
                total_lo += d;
            }
            if let BackoffAction::Retry(d) = hi.on_failure_with_jitter(1.0 - f64::EPSILON) {
                total_hi += d;
            }
        }

        assert_eq!(total_lo, Duration::from_millis(1500));
        assert!(total_hi <= Duration::from_millis(1650));
        assert!(total_hi >= total_lo);
    }

    #[test]
    fn success_resets_progression() {
        let mut p = policy(10);
        for _ in 0..4 {
            let _ = p.on_failure_with_jitter(0.0);
        }
        p.on_success();
        match p.on_failure_with_jitter(0.0) {
            BackoffAction::Retry(d) => assert_eq!(d, Duration::from_millis(500)),
            _ => panic!("unexpected cooldown"),
        }
    }
}
