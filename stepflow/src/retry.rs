//! Per-step attempt accounting and exponential backoff

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::dag::Step;

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Stand-in deadline for delays too large to add to an `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Attempt bookkeeping for one step within one execution
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryState {
    /// Failed attempts so far
    pub failures: u32,
    /// Earliest instant the step may be dispatched again
    pub next_eligible_at: Option<Instant>,
}

/// Decides whether failed steps retry and when
///
/// Stateless rules (`should_retry`, `next_delay`) plus the per-execution
/// [`RetryState`] map. The computed delay is uncapped; callers apply their
/// own ceiling through [`RetryController::with_max_delay`].
#[derive(Debug, Default)]
pub struct RetryController {
    states: HashMap<String, RetryState>,
    max_delay: Option<Duration>,
}

impl RetryController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap applied when scheduling the next attempt
    pub fn with_max_delay(mut self, max_delay: Option<Duration>) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// True while `failure_count < max_attempts`
    pub fn should_retry(step: &Step, failure_count: u32) -> bool {
        failure_count < step.retry.max_attempts
    }

    /// `base_delay * 2^(failure_count - 1)`, saturating on overflow
    pub fn next_delay(step: &Step, failure_count: u32) -> Duration {
        let base = step.retry.base_delay();
        if failure_count == 0 || base.is_zero() {
            return base;
        }

        let exponent = (failure_count - 1).min(127);
        let Some(nanos) = base.as_nanos().checked_mul(1u128 << exponent) else {
            return Duration::MAX;
        };
        match u64::try_from(nanos / NANOS_PER_SEC) {
            Ok(secs) => Duration::new(secs, (nanos % NANOS_PER_SEC) as u32),
            Err(_) => Duration::MAX,
        }
    }

    /// Record a failed attempt. Returns the delay before the next attempt, or
    /// `None` when the step has used its whole budget.
    pub fn record_failure(&mut self, step: &Step, now: Instant) -> Option<Duration> {
        let state = self.states.entry(step.id.clone()).or_default();
        state.failures += 1;

        if !Self::should_retry(step, state.failures) {
            state.next_eligible_at = None;
            return None;
        }

        let mut delay = Self::next_delay(step, state.failures);
        if let Some(max) = self.max_delay {
            delay = delay.min(max);
        }
        state.next_eligible_at = Some(now.checked_add(delay).unwrap_or_else(|| now + FAR_FUTURE));
        Some(delay)
    }

    /// Whether the step's backoff (if any) has elapsed
    pub fn is_eligible(&self, step_id: &str, now: Instant) -> bool {
        self.states
            .get(step_id)
            .and_then(|s| s.next_eligible_at)
            .map(|at| at <= now)
            .unwrap_or(true)
    }

    /// Earliest backoff deadline among the given steps that are still waiting
    pub fn earliest_eligible<'a>(
        &self,
        step_ids: impl IntoIterator<Item = &'a String>,
        now: Instant,
    ) -> Option<Instant> {
        step_ids
            .into_iter()
            .filter_map(|id| self.states.get(id).and_then(|s| s.next_eligible_at))
            .filter(|at| *at > now)
            .min()
    }

    pub fn failures(&self, step_id: &str) -> u32 {
        self.states.get(step_id).map(|s| s.failures).unwrap_or(0)
    }

    pub fn state(&self, step_id: &str) -> Option<&RetryState> {
        self.states.get(step_id)
    }
}
