//! Circuit breaker.
//!
//! A request fails when its status is at or above `error_threshold` or when
//! the handler panics. The circuit opens after `max_failures` consecutive
//! failures, or once `failure_ratio` of at least `min_requests` calls failed.
//! While open every request is answered `503` without reaching the handler.
//! After `timeout` up to `half_open_max_calls` probes are let through; that
//! many successes close the circuit and any failure opens it again.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use keel_config::{CircuitBreakerOptions, MiddlewareName};
use keel_core::{BoxFuture, Context, Handler, KeelError, Middleware};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::FactoryError;
use crate::factory::{downcast, AnyConfig, MiddlewareFactory};
use crate::stage::Stage;

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests flow normally.
    Closed,
    /// Requests are rejected.
    Open,
    /// A limited number of probes are admitted.
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
enum Inner {
    Closed {
        consecutive: u32,
        requests: u32,
        failures: u32,
    },
    Open {
        until: Instant,
    },
    HalfOpen {
        in_flight: u32,
        successes: u32,
    },
}

impl Inner {
    const fn closed() -> Self {
        Self::Closed {
            consecutive: 0,
            requests: 0,
            failures: 0,
        }
    }
}

#[derive(Debug, Clone)]
struct Settings {
    max_failures: u32,
    failure_ratio: f64,
    min_requests: u32,
    timeout: Duration,
    half_open_max_calls: u32,
    error_threshold: u16,
}

/// Rejects requests while the downstream keeps failing.
#[derive(Debug, Clone)]
pub struct CircuitBreakerStage {
    settings: Arc<Settings>,
    skip: keel_config::PathMatcher,
    state: Arc<Mutex<Inner>>,
}

impl Default for CircuitBreakerStage {
    fn default() -> Self {
        Self::new(CircuitBreakerOptions::default())
    }
}

impl CircuitBreakerStage {
    /// Creates a closed breaker.
    pub fn new(options: CircuitBreakerOptions) -> Self {
        let options = options.complete();
        Self {
            settings: Arc::new(Settings {
                max_failures: options.max_failures,
                failure_ratio: options.failure_ratio,
                min_requests: options.min_requests,
                timeout: options.timeout.to_std(),
                half_open_max_calls: options.half_open_max_calls.max(1),
                error_threshold: options.error_threshold,
            }),
            skip: options.skip,
            state: Arc::new(Mutex::new(Inner::closed())),
        }
    }

    /// Current state. An open circuit whose cool-down elapsed reports
    /// `HalfOpen`.
    pub fn state(&self) -> CircuitState {
        match *self.state.lock() {
            Inner::Closed { .. } => CircuitState::Closed,
            Inner::Open { until } if Instant::now() >= until => CircuitState::HalfOpen,
            Inner::Open { .. } => CircuitState::Open,
            Inner::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }

    /// Returns whether the request may proceed, and whether it is a probe.
    fn admit(&self) -> Option<bool> {
        let mut state = self.state.lock();
        match *state {
            Inner::Closed { .. } => Some(false),
            Inner::Open { until } => {
                if Instant::now() < until {
                    return None;
                }
                info!("circuit half-open, admitting probe");
                *state = Inner::HalfOpen {
                    in_flight: 1,
                    successes: 0,
                };
                Some(true)
            }
            Inner::HalfOpen {
                in_flight,
                successes,
            } => {
                if in_flight + successes >= self.settings.half_open_max_calls {
                    return None;
                }
                *state = Inner::HalfOpen {
                    in_flight: in_flight + 1,
                    successes,
                };
                Some(true)
            }
        }
    }

    fn record(&self, probe: bool, failed: bool) {
        let settings = &self.settings;
        let mut state = self.state.lock();
        let next = match *state {
            Inner::HalfOpen {
                in_flight,
                successes,
            } if probe => {
                if failed {
                    warn!("circuit probe failed, reopening");
                    self.open_state()
                } else if successes + 1 >= settings.half_open_max_calls {
                    info!("circuit closed");
                    Inner::closed()
                } else {
                    Inner::HalfOpen {
                        in_flight: in_flight.saturating_sub(1),
                        successes: successes + 1,
                    }
                }
            }
            Inner::Closed {
                consecutive,
                requests,
                failures,
            } => {
                let requests = requests.saturating_add(1);
                let (consecutive, failures) = if failed {
                    (consecutive + 1, failures.saturating_add(1))
                } else {
                    (0, failures)
                };
                let consecutive_trip = settings.max_failures > 0 && consecutive >= settings.max_failures;
                let ratio_trip = settings.failure_ratio > 0.0
                    && requests >= settings.min_requests
                    && f64::from(failures) / f64::from(requests) >= settings.failure_ratio;
                if consecutive_trip || ratio_trip {
                    warn!(consecutive, requests, failures, "circuit opened");
                    self.open_state()
                } else {
                    Inner::Closed {
                        consecutive,
                        requests,
                        failures,
                    }
                }
            }
            other => other,
        };
        *state = next;
    }

    /// Returns a probe slot whose request ended without a verdict.
    fn release_probe(&self) {
        let mut state = self.state.lock();
        if let Inner::HalfOpen {
            in_flight,
            successes,
        } = *state
        {
            debug!("circuit probe abandoned, slot released");
            *state = Inner::HalfOpen {
                in_flight: in_flight.saturating_sub(1),
                successes,
            };
        }
    }

    fn open_state(&self) -> Inner {
        Inner::Open {
            until: Instant::now() + self.settings.timeout,
        }
    }
}

impl Stage for CircuitBreakerStage {
    fn name(&self) -> &'static str {
        "circuit_breaker"
    }

    fn handle(self: Arc<Self>, ctx: Context, next: Handler) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            if self.skip.should_skip(ctx.path()) {
                next(ctx).await;
                return;
            }

            let Some(probe) = self.admit() else {
                ctx.error(&KeelError::unavailable("circuit breaker is open"));
                return;
            };
            let admission = Admission {
                stage: Arc::clone(&self),
                probe,
                settled: false,
            };

            match AssertUnwindSafe(next(ctx.clone())).catch_unwind().await {
                Ok(()) => {
                    let failed = ctx.response().status().as_u16() >= self.settings.error_threshold;
                    admission.settle(failed);
                }
                Err(payload) => {
                    admission.settle(true);
                    std::panic::resume_unwind(payload);
                }
            }
        })
    }
}

/// An admitted request. Dropped unsettled (the request future was
/// cancelled), a probe gives its half-open slot back.
struct Admission {
    stage: Arc<CircuitBreakerStage>,
    probe: bool,
    settled: bool,
}

impl Admission {
    fn settle(mut self, failed: bool) {
        self.settled = true;
        self.stage.record(self.probe, failed);
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        if self.probe && !self.settled {
            self.stage.release_probe();
        }
    }
}

/// Builds [`CircuitBreakerStage`] from [`CircuitBreakerOptions`].
#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerFactory;

impl MiddlewareFactory for CircuitBreakerFactory {
    fn name(&self) -> MiddlewareName {
        MiddlewareName::CircuitBreaker
    }

    fn create(&self, config: &dyn AnyConfig) -> Result<Middleware, FactoryError> {
        let options: &CircuitBreakerOptions = downcast(self.name(), config)?;
        Ok(CircuitBreakerStage::new(options.clone()).into_middleware())
    }
}
