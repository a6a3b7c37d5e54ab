use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Breaker state, in the usual three-state scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Calls flow; consecutive failures are counted.
    Closed,
    /// Calls are rejected until the cool-down elapses.
    Open,
    /// One probe call is in flight; its outcome decides the next state.
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Circuit breaker guarding the consensus store.
///
/// The interesting consumer-visible event is the Half-Open → Closed
/// transition: the election campaign that was running when the store went
/// away died with its session, so the proxy must start a fresh campaign
/// exactly once per reclose or this instance stays silently out of the
/// election. [`CircuitBreaker::on_success`] reports that transition.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: &'static str,
    failure_threshold: u32,
    cool_down: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, failure_threshold: u32, cool_down: Duration) -> Self {
        Self {
            name,
            failure_threshold,
            cool_down,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
        }
    }

    /// Whether a call may proceed. When the cool-down has elapsed this
    /// transitions Open → Half-Open and admits exactly one probe.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => false,
            BreakerState::Open => {
                let cooled = inner
                    .opened_at
                    .map(|t| t.elapsed() >= self.cool_down)
                    .unwrap_or(true);
                if cooled {
                    inner.state = BreakerState::HalfOpen;
                    tracing::info!(breaker = self.name, "cool-down elapsed, probing");
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful call. Returns true iff this success reclosed the
    /// breaker (Half-Open → Closed), which is the caller's signal to restart
    /// the election campaign.
    pub fn on_success(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let reclosed = inner.state == BreakerState::HalfOpen;
        if reclosed {
            tracing::info!(breaker = self.name, "probe succeeded, closing");
        }
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        reclosed
    }

    /// Record a failed call: trips Closed → Open past the threshold and
    /// re-opens from Half-Open immediately.
    pub fn on_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::HalfOpen => {
                tracing::warn!(breaker = self.name, "probe failed, re-opening");
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
            }
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.failure_threshold {
                    tracing::warn!(
                        breaker = self.name,
                        failures = inner.consecutive_failures,
                        "failure threshold reached, opening"
                    );
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            BreakerState::Open => {}
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().unwrap().state
    }
}
