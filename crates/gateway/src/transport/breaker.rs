//! Per-backend circuit breaker: closed/open/half-open state machine driven
//! by a rolling failure-rate window.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::backend::BreakerParams;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    /// Numeric encoding used for the `breaker_state` gauge: closed=0,
    /// open=1, half-open=2.
    pub fn as_gauge_value(self) -> i64 {
        match self {
            BreakerState::Closed => 0,
            BreakerState::Open => 1,
            BreakerState::HalfOpen => 2,
        }
    }
}

struct Inner {
    state: BreakerState,
    /// (timestamp, was_failure) for requests within the rolling window.
    events: VecDeque<(Instant, bool)>,
    opened_at: Option<Instant>,
    half_open_in_flight: u32,
}

pub struct CircuitBreaker {
    params: BreakerParams,
    inner: Mutex<Inner>,
}

pub enum Admission {
    Allowed,
    Rejected,
}

impl CircuitBreaker {
    pub fn new(params: BreakerParams) -> Self {
        Self {
            params,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                events: VecDeque::new(),
                opened_at: None,
                half_open_in_flight: 0,
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().unwrap().state
    }

    /// Call before dispatching a request. In `Open` state, transitions to
    /// `HalfOpen` once `open_timeout` has elapsed and admits a bounded
    /// number of probes; otherwise rejects outright.
    pub fn try_admit(&self) -> Admission {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::Closed => Admission::Allowed,
            BreakerState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.params.open_timeout {
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_in_flight = 1;
                    Admission::Allowed
                } else {
                    Admission::Rejected
                }
            },
            BreakerState::HalfOpen => {
                if inner.half_open_in_flight < self.params.half_open_max_requests {
                    inner.half_open_in_flight += 1;
                    Admission::Allowed
                } else {
                    Admission::Rejected
                }
            },
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == BreakerState::HalfOpen {
            inner.state = BreakerState::Closed;
            inner.events.clear();
            inner.half_open_in_flight = 0;
            inner.opened_at = None;
            return;
        }
        self.record(&mut inner, false);
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == BreakerState::HalfOpen {
            inner.state = BreakerState::Open;
            inner.opened_at = Some(Instant::now());
            inner.half_open_in_flight = 0;
            return;
        }
        self.record(&mut inner, true);
    }

    fn record(&self, inner: &mut Inner, failed: bool) {
        let now = Instant::now();
        inner.events.push_back((now, failed));
        self.evict_expired(inner, now);

        if inner.events.len() < self.params.minimum_requests as usize {
            return;
        }
        let failures = inner.events.iter().filter(|(_, f)| *f).count();
        let rate = failures as f64 / inner.events.len() as f64;
        if rate >= self.params.failure_threshold {
            inner.state = BreakerState::Open;
            inner.opened_at = Some(now);
            inner.events.clear();
        }
    }

    fn evict_expired(&self, inner: &mut Inner, now: Instant) {
        let window = self.params.window;
        while let Some((t, _)) = inner.events.front() {
            if now.duration_since(*t) > window {
                inner.events.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> BreakerParams {
        BreakerParams {
            failure_threshold: 0.5,
            window: Duration::from_secs(60),
            minimum_requests: 3,
            open_timeout: Duration::from_millis(20),
            half_open_max_requests: 1,
        }
    }

    #[test]
    fn opens_after_failure_rate_exceeds_threshold() {
        let breaker = CircuitBreaker::new(params());
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
        breaker.record_success();
        assert!(matches!(breaker.state(), BreakerState::Closed | BreakerState::Open));
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn rejects_while_open_then_probes_after_timeout() {
        let breaker = CircuitBreaker::new(params());
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(matches!(breaker.try_admit(), Admission::Rejected));
        std::thread::sleep(Duration::from_millis(30));
        assert!(matches!(breaker.try_admit(), Admission::Allowed));
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
    }

    #[test]
    fn half_open_limits_concurrent_probes() {
        let breaker = CircuitBreaker::new(params());
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(30));
        assert!(matches!(breaker.try_admit(), Admission::Allowed));
        assert!(matches!(breaker.try_admit(), Admission::Rejected));
    }

    #[test]
    fn half_open_success_closes_breaker() {
        let breaker = CircuitBreaker::new(params());
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(30));
        breaker.try_admit();
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_failure_reopens_breaker() {
        let breaker = CircuitBreaker::new(params());
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(30));
        breaker.try_admit();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
    }
}
