//! Contextual classifier adapter: hard timeout plus circuit breaker around a
//! [`ContextJudge`]. Failures never escape; they become [`ClassifierOutcome::Unavailable`].

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lifeline_core::{ClassifierError, ContextJudge, JudgeVerdict, Message};
use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Clone, Debug, PartialEq)]
pub enum ClassifierOutcome {
    Opinion(JudgeVerdict),
    Unavailable(ClassifierError),
    /// No classifier is configured.
    Disabled,
}

impl ClassifierOutcome {
    pub fn verdict(&self) -> Option<JudgeVerdict> {
        match self {
            Self::Opinion(v) => Some(*v),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct BreakerConfig {
    pub threshold: u32,
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum CircuitState {
    Closed,
    Open { since: Instant },
    HalfOpen,
}

/// Closed -> Open after `threshold` consecutive failures -> HalfOpen after
/// `cooldown` -> Closed on the next success.
///
/// While half-open exactly one trial call is in flight; everyone else is
/// short-circuited until it reports back.
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: RwLock<CircuitState>,
    consecutive_failures: AtomicU32,
    trial_in_flight: AtomicBool,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: RwLock::new(CircuitState::Closed),
            consecutive_failures: AtomicU32::new(0),
            trial_in_flight: AtomicBool::new(false),
        }
    }

    /// Whether a call may go through right now. A caller that gets `Ok` must
    /// report back through `record_success`, `record_failure` or `end_trial`.
    pub fn check(&self) -> Result<(), ClassifierError> {
        if *self.state.read() == CircuitState::Closed {
            return Ok(());
        }
        let mut state = self.state.write();
        match *state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open { since } if since.elapsed() < self.config.cooldown => {
                Err(ClassifierError::CircuitOpen)
            }
            CircuitState::Open { .. } => {
                *state = CircuitState::HalfOpen;
                self.trial_in_flight.store(true, Ordering::SeqCst);
                debug!("circuit breaker half-open, probing classifier");
                Ok(())
            }
            CircuitState::HalfOpen => {
                if self.trial_in_flight.swap(true, Ordering::SeqCst) {
                    Err(ClassifierError::CircuitOpen)
                } else {
                    Ok(())
                }
            }
        }
    }

    /// The call finished without saying anything about classifier health.
    pub fn end_trial(&self) {
        self.trial_in_flight.store(false, Ordering::SeqCst);
    }

    pub fn record_success(&self) {
        self.trial_in_flight.store(false, Ordering::SeqCst);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        let mut state = self.state.write();
        if *state != CircuitState::Closed {
            info!("circuit breaker closed after successful classification");
            *state = CircuitState::Closed;
        }
    }

    pub fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        let mut state = self.state.write();
        self.trial_in_flight.store(false, Ordering::SeqCst);
        let trip = match *state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => failures >= self.config.threshold,
            CircuitState::Open { .. } => false,
        };
        if trip {
            warn!(
                failures,
                cooldown_ms = self.config.cooldown.as_millis() as u64,
                "classifier circuit breaker opened"
            );
            *state = CircuitState::Open { since: Instant::now() };
        }
    }

    pub fn state_name(&self) -> &'static str {
        match &*self.state.read() {
            CircuitState::Closed => "closed",
            CircuitState::Open { .. } => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

struct Guarded {
    judge: Arc<dyn ContextJudge>,
    timeout: Duration,
    breaker: CircuitBreaker,
    unavailable: AtomicU64,
}

/// Wraps an optional judge. Cloned detectors share the same breaker.
#[derive(Clone)]
pub struct ClassifierAdapter {
    inner: Option<Arc<Guarded>>,
}

impl ClassifierAdapter {
    pub fn new(judge: Arc<dyn ContextJudge>, timeout: Duration, breaker: BreakerConfig) -> Self {
        Self {
            inner: Some(Arc::new(Guarded {
                judge,
                timeout,
                breaker: CircuitBreaker::new(breaker),
                unavailable: AtomicU64::new(0),
            })),
        }
    }

    pub fn disabled() -> Self {
        Self { inner: None }
    }

    pub fn is_configured(&self) -> bool {
        self.inner.is_some()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.inner.as_ref().map(|g| g.timeout)
    }

    pub fn breaker_state(&self) -> &'static str {
        self.inner.as_ref().map_or("disabled", |g| g.breaker.state_name())
    }

    /// Calls that ended without an opinion since startup.
    pub fn unavailable_count(&self) -> u64 {
        self.inner
            .as_ref()
            .map_or(0, |g| g.unavailable.load(Ordering::Relaxed))
    }

    pub async fn classify(&self, text: &str, context: &[Message]) -> ClassifierOutcome {
        let Some(g) = &self.inner else {
            return ClassifierOutcome::Disabled;
        };

        let mut called = false;
        let result = match g.breaker.check() {
            Err(e) => Err(e),
            Ok(()) => {
                called = true;
                match tokio::time::timeout(g.timeout, g.judge.classify(text, context)).await {
                    Ok(r) => r,
                    Err(_) => Err(ClassifierError::Timeout(g.timeout)),
                }
            }
        };

        match result {
            Ok(verdict) => {
                g.breaker.record_success();
                ClassifierOutcome::Opinion(JudgeVerdict {
                    tier: verdict.tier,
                    confidence: verdict.confidence.clamp(0.0, 1.0),
                })
            }
            Err(e) => {
                if e.counts_as_failure() {
                    g.breaker.record_failure();
                } else if called {
                    g.breaker.end_trial();
                }
                g.unavailable.fetch_add(1, Ordering::Relaxed);
                debug!(judge = g.judge.name(), kind = e.error_kind(), error = %e, "classifier unavailable");
                ClassifierOutcome::Unavailable(e)
            }
        }
    }
}
