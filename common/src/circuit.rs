//! Circuit breaker: a three-phase controller guarding calls to a single
//! dependency (the engine or the queue broker), one instance per
//! (component, dependency) pair.

use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    HalfOpen,
    Open,
}

impl CircuitState {
    /// The gauge encoding used by `circuit_breaker_state`: Closed=0, HalfOpen=1, Open=2.
    fn as_gauge_value(self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 1.0,
            CircuitState::Open => 2.0,
        }
    }
}

struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    entered_at: Instant,
    /// Consecutive-failure count observed at the moment the breaker last
    /// tripped to Open, retained for reporting after the live counter resets.
    last_trip_failures: u32,
    /// Set while a HalfOpen probe is admitted and unresolved. Guards against
    /// a second caller being admitted concurrently: HalfOpen allows exactly
    /// one attempt at a time.
    half_open_probe_claimed: bool,
}

/// Sentinel returned by [`CircuitBreaker::guard`] when the breaker is Open,
/// or when a HalfOpen probe is already in flight: the guarded call must not
/// be attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitOpen;

/// A token representing a call admitted through the breaker. The caller
/// must report the outcome via [`Attempt::succeeded`] or [`Attempt::failed`]
/// so the breaker can transition state.
#[must_use]
pub struct Attempt<'a> {
    breaker: &'a CircuitBreaker,
    is_probe: bool,
}

impl Attempt<'_> {
    pub fn succeeded(self) {
        self.breaker.record_success();
    }

    pub fn failed(self) {
        self.breaker.record_failure();
    }

    /// Whether this attempt is the single HalfOpen probe, as opposed to a
    /// normal Closed-state call. Callers that retry on failure must not
    /// retry a probe attempt: HalfOpen allows exactly one try.
    pub fn is_probe(&self) -> bool {
        self.is_probe
    }
}

pub struct CircuitBreaker {
    service: String,
    component: String,
    threshold: u32,
    open_timeout: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(service: &str, component: &str, threshold: u32, open_timeout: Duration) -> Self {
        let breaker = Self {
            service: service.to_owned(),
            component: component.to_owned(),
            threshold,
            open_timeout,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                entered_at: Instant::now(),
                last_trip_failures: 0,
                half_open_probe_claimed: false,
            }),
        };
        breaker.publish_state(CircuitState::Closed);
        breaker
    }

    /// Construct the engine breaker per spec: 5 consecutive failures, 30s Open timeout.
    pub fn for_engine() -> Self {
        Self::new("worker", "engine", 5, Duration::from_secs(30))
    }

    /// Construct the queue breaker per spec: 3 consecutive failures, 30s Open timeout.
    pub fn for_queue(service: &str) -> Self {
        Self::new(service, "queue", 3, Duration::from_secs(30))
    }

    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock().expect("circuit breaker mutex poisoned");
        self.transition_if_due(&mut inner);
        inner.state
    }

    /// Consecutive-failure count observed when the breaker last tripped Open.
    pub fn last_trip_failures(&self) -> u32 {
        self.inner
            .lock()
            .expect("circuit breaker mutex poisoned")
            .last_trip_failures
    }

    /// The live consecutive-failure count, for reporting while still Closed.
    pub fn consecutive_failures(&self) -> u32 {
        self.inner
            .lock()
            .expect("circuit breaker mutex poisoned")
            .consecutive_failures
    }

    /// `last_trip_failures` if Open, else the live `consecutive_failures`.
    pub fn failure_count(&self) -> u32 {
        if self.state() == CircuitState::Open {
            self.last_trip_failures()
        } else {
            self.consecutive_failures()
        }
    }

    /// Atomically decide whether a call should proceed. Returns `Err(CircuitOpen)`
    /// without touching the dependency if the breaker is Open (I4), or if it
    /// is HalfOpen and a probe is already in flight: HalfOpen admits exactly
    /// one concurrent attempt. Otherwise returns an [`Attempt`] the caller
    /// must resolve.
    pub fn guard(&self) -> Result<Attempt<'_>, CircuitOpen> {
        let mut inner = self.inner.lock().expect("circuit breaker mutex poisoned");
        self.transition_if_due(&mut inner);

        match inner.state {
            CircuitState::Open => Err(CircuitOpen),
            CircuitState::Closed => Ok(Attempt { breaker: self, is_probe: false }),
            CircuitState::HalfOpen => {
                if inner.half_open_probe_claimed {
                    Err(CircuitOpen)
                } else {
                    inner.half_open_probe_claimed = true;
                    Ok(Attempt { breaker: self, is_probe: true })
                }
            }
        }
    }

    fn transition_if_due(&self, inner: &mut Inner) {
        if inner.state == CircuitState::Open && inner.entered_at.elapsed() >= self.open_timeout {
            self.enter(inner, CircuitState::HalfOpen);
        }
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock().expect("circuit breaker mutex poisoned");
        inner.consecutive_failures = 0;
        if inner.state != CircuitState::Closed {
            self.enter(&mut inner, CircuitState::Closed);
        }
    }

    fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("circuit breaker mutex poisoned");
        inner.consecutive_failures += 1;

        match inner.state {
            CircuitState::HalfOpen => self.enter(&mut inner, CircuitState::Open),
            CircuitState::Closed if inner.consecutive_failures >= self.threshold => {
                self.enter(&mut inner, CircuitState::Open);
            }
            _ => {}
        }
    }

    fn enter(&self, inner: &mut Inner, state: CircuitState) {
        inner.state = state;
        inner.entered_at = Instant::now();
        inner.half_open_probe_claimed = false;
        if state == CircuitState::Open {
            inner.last_trip_failures = inner.consecutive_failures;
            inner.consecutive_failures = 0;
            metrics::counter!(
                "circuit_breaker_failures_total",
                "service" => self.service.clone(),
                "component" => self.component.clone(),
            )
            .increment(1);
        }
        self.publish_state(state);
    }

    fn publish_state(&self, state: CircuitState) {
        metrics::gauge!(
            "circuit_breaker_state",
            "service" => self.service.clone(),
            "component" => self.component.clone(),
        )
        .set(state.as_gauge_value());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let breaker = CircuitBreaker::new("api", "queue", 3, Duration::from_secs(30));

        for _ in 0..2 {
            breaker.guard().unwrap().failed();
            assert_eq!(breaker.state(), CircuitState::Closed);
        }
        breaker.guard().unwrap().failed();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn open_rejects_without_attempt() {
        let breaker = CircuitBreaker::new("api", "queue", 1, Duration::from_secs(30));
        breaker.guard().unwrap().failed();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.guard().is_err());
    }

    #[test]
    fn half_open_probe_success_closes() {
        let breaker = CircuitBreaker::new("api", "queue", 1, Duration::from_millis(1));
        breaker.guard().unwrap().failed();
        assert_eq!(breaker.state(), CircuitState::Open);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.guard().unwrap().succeeded();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_probe_failure_reopens_and_restarts_timer() {
        let breaker = CircuitBreaker::new("api", "queue", 1, Duration::from_millis(20));
        breaker.guard().unwrap().failed();
        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.guard().unwrap().failed();
        assert_eq!(breaker.state(), CircuitState::Open);

        // Timer restarted: immediately after the probe failure we should
        // still be open, not half-open.
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn half_open_admits_exactly_one_probe_at_a_time() {
        let breaker = CircuitBreaker::new("api", "queue", 1, Duration::from_millis(1));
        breaker.guard().unwrap().failed();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        let probe = breaker.guard().expect("first probe is admitted");
        assert!(probe.is_probe());
        assert!(breaker.guard().is_err(), "second concurrent probe must be rejected");

        probe.succeeded();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_releases_probe_slot_after_failure() {
        let breaker = CircuitBreaker::new("api", "queue", 1, Duration::from_millis(1));
        breaker.guard().unwrap().failed();
        std::thread::sleep(Duration::from_millis(5));

        let probe = breaker.guard().unwrap();
        probe.failed();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn closed_attempts_are_not_probes() {
        let breaker = CircuitBreaker::new("api", "queue", 3, Duration::from_secs(30));
        assert!(!breaker.guard().unwrap().is_probe());
    }

    #[test]
    fn state_only_ever_takes_documented_values() {
        let breaker = CircuitBreaker::new("api", "queue", 1, Duration::from_millis(1));
        let mut seen = Vec::new();
        seen.push(breaker.state());
        breaker.guard().unwrap().failed();
        seen.push(breaker.state());
        std::thread::sleep(Duration::from_millis(5));
        seen.push(breaker.state());
        for state in seen {
            assert!(matches!(
                state,
                CircuitState::Closed | CircuitState::HalfOpen | CircuitState::Open
            ));
        }
    }
}
