//! Circuit breaker around the model backend
//!
//! After `threshold` consecutive failures the breaker opens and model calls
//! fail fast. Once `cooldown` has elapsed a single trial call is let
//! through; its outcome closes or re-opens the breaker. A trial that is
//! dropped without reporting (cancelled caller) frees the slot for the next
//! caller.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls allowed
    Closed,
    /// Failing fast
    Open,
    /// Cooldown elapsed, one trial allowed
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: Option<u64>,
    next_trial: u64,
}

/// Permission to make one call, returned by [`CircuitBreaker::try_acquire`].
/// Keep it alive for the duration of the call.
#[derive(Debug)]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: Option<u64>,
}

impl CallPermit<'_> {
    /// Whether this call is the half-open trial
    pub fn is_trial(&self) -> bool {
        self.trial.is_some()
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if let Some(id) = self.trial {
            let mut inner = self.breaker.inner();
            if inner.trial_in_flight == Some(id) {
                inner.trial_in_flight = None;
            }
        }
    }
}

/// Breaker shared by every call made through one client
///
/// ```
/// use sandbox_agent::{CircuitBreaker, CircuitState};
///
/// let breaker = CircuitBreaker::new(2, std::time::Duration::from_secs(60));
/// breaker.record_failure();
/// breaker.record_failure();
/// assert_eq!(breaker.state(), CircuitState::Open);
/// assert!(breaker.try_acquire().is_none());
/// ```
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown,
            inner: Mutex::new(Inner {
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: None,
                next_trial: 0,
            }),
        }
    }

    fn inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> CircuitState {
        let inner = self.inner();
        match inner.opened_at {
            None => CircuitState::Closed,
            Some(opened) if opened.elapsed() >= self.cooldown => CircuitState::HalfOpen,
            Some(_) => CircuitState::Open,
        }
    }

    /// Ask permission for a call. In the half-open state only the first
    /// caller gets through until that trial reports back or is dropped.
    pub fn try_acquire(&self) -> Option<CallPermit<'_>> {
        let mut inner = self.inner();
        let trial = match inner.opened_at {
            None => None,
            Some(opened) if opened.elapsed() >= self.cooldown => {
                if inner.trial_in_flight.is_some() {
                    return None;
                }
                let id = inner.next_trial;
                inner.next_trial = inner.next_trial.wrapping_add(1);
                inner.trial_in_flight = Some(id);
                Some(id)
            }
            Some(_) => return None,
        };
        Some(CallPermit {
            breaker: self,
            trial,
        })
    }

    pub fn record_success(&self) {
        let mut inner = self.inner();
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.trial_in_flight = None;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.trial_in_flight = None;
        if inner.consecutive_failures >= self.threshold {
            inner.opened_at = Some(Instant::now());
        }
    }

    pub fn failure_count(&self) -> u32 {
        self.inner().consecutive_failures
    }

    /// Time left before a trial is allowed (zero unless open)
    pub fn time_until_retry(&self) -> Duration {
        match self.inner().opened_at {
            Some(opened) => self.cooldown.saturating_sub(opened.elapsed()),
            None => Duration::ZERO,
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(60))
    }
}
