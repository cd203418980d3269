//! Retry policies and backoff.
//!
//! Every error class maps to a policy `{max_attempts, base_delay, max_delay}`.
//! Backoff is exponential, `min(base * 2^(attempt-1), max)`, plus uniform
//! jitter in `[0, delay/2]`. Between attempts the orchestrator sleeps on the
//! runtime; it never spins.

use std::time::Duration;

use rand::Rng;
use tracing::{debug, instrument, warn};

use crate::error::ErrorClass;

/// Retry policy for one error class.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. 1 means no retry.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub const fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Whether another attempt is allowed after `attempt` failures.
    pub fn allows(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// The delay before the given attempt (1-based), jittered.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let raw = self.base_delay.saturating_mul(1u32 << exponent);
        let capped = raw.min(self.max_delay);
        if capped.is_zero() {
            return capped;
        }
        let jitter = rand::thread_rng().gen_range(Duration::ZERO..=capped / 2);
        capped + jitter
    }
}

/// The per-class policy table.
#[derive(Clone, Debug)]
pub struct RetryPolicies {
    transient_network: RetryPolicy,
    transient_io: RetryPolicy,
    worker_timeout: RetryPolicy,
    worker_crash: RetryPolicy,
    remote_cache_miss: RetryPolicy,
}

impl Default for RetryPolicies {
    fn default() -> Self {
        Self {
            transient_network: RetryPolicy {
                max_attempts: 4,
                base_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(5),
            },
            transient_io: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(50),
                max_delay: Duration::from_secs(2),
            },
            worker_timeout: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(10),
            },
            worker_crash: RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(250),
                max_delay: Duration::from_secs(5),
            },
            remote_cache_miss: RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(50),
                max_delay: Duration::from_millis(500),
            },
        }
    }
}

impl RetryPolicies {
    /// The policy for an error class. Compile failures, sandbox violations,
    /// cycles, and anything fatal never retry.
    pub fn policy_for(&self, class: ErrorClass) -> RetryPolicy {
        match class {
            ErrorClass::TransientNetwork => self.transient_network,
            ErrorClass::TransientIo => self.transient_io,
            ErrorClass::WorkerTimeout => self.worker_timeout,
            ErrorClass::WorkerCrash => self.worker_crash,
            ErrorClass::RemoteCacheMiss => self.remote_cache_miss,
            ErrorClass::CompileFailure
            | ErrorClass::SandboxViolation
            | ErrorClass::Cycle
            | ErrorClass::Fatal => RetryPolicy::no_retry(),
        }
    }

    /// Decide whether to retry after `attempt` failures of class `class`,
    /// returning the jittered delay to wait first.
    #[instrument(name = "RetryPolicies::decide", skip(self))]
    pub fn decide(&self, class: ErrorClass, attempt: u32) -> Option<Duration> {
        let policy = self.policy_for(class);
        if !policy.allows(attempt) {
            debug!(%class, attempt, max = policy.max_attempts, "retries exhausted");
            return None;
        }
        let delay = policy.delay(attempt);
        debug!(%class, attempt, ?delay, "retrying");
        Some(delay)
    }
}

/// Configuration for the optional per-tool circuit breaker.
///
/// The scheduler only constructs a breaker when this is present (the
/// `--breaker` flag on `builder build`); the default build runs without one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Consecutive failures on one tool before the breaker opens.
    pub threshold: u32,
    /// How long an open breaker sheds load before closing again.
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 3,
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Breaker state for one external tool.
#[derive(Debug)]
struct BreakerState {
    consecutive_failures: u32,
    open_until: Option<std::time::Instant>,
    /// While half-open, every other request is shed.
    shed_toggle: bool,
}

/// Executor-level circuit breaker for repeatedly failing external tools.
///
/// After `threshold` consecutive failures on the same tool the breaker
/// opens: for `cooldown`, half of the requests are shed so a broken
/// toolchain cannot saturate the executor. Optional; disabled by default.
#[derive(Debug)]
pub struct ToolBreaker {
    threshold: u32,
    cooldown: Duration,
    tools: std::sync::Mutex<std::collections::HashMap<String, BreakerState>>,
}

impl ToolBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold,
            cooldown,
            tools: std::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }

    /// Whether a request for `tool` may proceed right now.
    pub fn allow(&self, tool: &str) -> bool {
        let mut tools = self.tools.lock().expect("breaker lock poisoned");
        let Some(state) = tools.get_mut(tool) else {
            return true;
        };
        match state.open_until {
            Some(until) if std::time::Instant::now() < until => {
                // Open: shed alternating requests (half throughput).
                state.shed_toggle = !state.shed_toggle;
                state.shed_toggle
            }
            Some(_) => {
                state.open_until = None;
                state.consecutive_failures = 0;
                true
            }
            None => true,
        }
    }

    /// Record an execution outcome for `tool`.
    pub fn record(&self, tool: &str, success: bool) {
        let mut tools = self.tools.lock().expect("breaker lock poisoned");
        let state = tools.entry(tool.to_string()).or_insert(BreakerState {
            consecutive_failures: 0,
            open_until: None,
            shed_toggle: false,
        });

        if success {
            state.consecutive_failures = 0;
            return;
        }

        state.consecutive_failures += 1;
        if state.consecutive_failures >= self.threshold && state.open_until.is_none() {
            warn!(%tool, failures = state.consecutive_failures, "circuit breaker opened");
            state.open_until = Some(std::time::Instant::now() + self.cooldown);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn delays_grow_exponentially_and_cap() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
        };

        // Jitter adds at most half the capped delay.
        for attempt in 1..=8 {
            let expected_base = Duration::from_millis(100)
                .saturating_mul(1 << (attempt - 1))
                .min(Duration::from_secs(1));
            let delay = policy.delay(attempt);
            assert!(delay >= expected_base, "attempt {attempt}: {delay:?}");
            assert!(delay <= expected_base + expected_base / 2);
        }
    }

    #[test]
    fn compile_failures_never_retry() {
        let policies = RetryPolicies::default();
        assert_eq!(policies.decide(ErrorClass::CompileFailure, 1), None);
        assert_eq!(policies.decide(ErrorClass::Cycle, 1), None);
        assert_eq!(policies.decide(ErrorClass::SandboxViolation, 1), None);
    }

    #[test]
    fn transient_classes_retry_until_exhausted() {
        let policies = RetryPolicies::default();
        assert!(policies.decide(ErrorClass::TransientNetwork, 1).is_some());
        assert!(policies.decide(ErrorClass::TransientNetwork, 3).is_some());
        assert_eq!(policies.decide(ErrorClass::TransientNetwork, 4), None);
    }

    #[test]
    fn breaker_opens_after_threshold_and_halves_throughput() {
        let breaker = ToolBreaker::new(3, Duration::from_secs(60));
        for _ in 0..3 {
            breaker.record("cc", false);
        }

        // Open: alternating requests are shed.
        let admitted = (0..10).filter(|_| breaker.allow("cc")).count();
        assert_eq!(admitted, 5);

        // Other tools are unaffected.
        assert!(breaker.allow("rustc"));
    }

    #[test]
    fn breaker_success_resets_counter() {
        let breaker = ToolBreaker::new(3, Duration::from_secs(60));
        breaker.record("cc", false);
        breaker.record("cc", false);
        breaker.record("cc", true);
        breaker.record("cc", false);
        assert!(breaker.allow("cc"));
    }
}
