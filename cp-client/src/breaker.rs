// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Circuit breaker guarding control plane calls.
//!
//! Closed: requests pass, consecutive failures are counted. Open: requests
//! are rejected until `open_duration` elapses. HalfOpen: a bounded number of
//! probes may pass; enough successes close the circuit, any failure reopens
//! it.

use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use wren_common::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Closed => write!(f, "closed"),
            State::Open => write!(f, "open"),
            State::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures in Closed before the circuit opens.
    pub failure_threshold: u32,
    /// Successes in HalfOpen before the circuit closes.
    pub success_threshold: u32,
    /// How long Open lasts before probing resumes.
    pub open_duration: Duration,
    /// Concurrent probes permitted in HalfOpen.
    pub half_open_max: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            open_duration: Duration::from_secs(30),
            half_open_max: 1,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Rejection {
    #[error("circuit breaker is open")]
    CircuitOpen,

    #[error("too many requests in half-open state")]
    TooManyProbes,
}

struct Inner {
    state: State,
    failures: u32,
    successes: u32,
    half_open_inflight: u32,
    last_failure: Option<Instant>,
}

pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: State::Closed,
                failures: 0,
                successes: 0,
                half_open_inflight: 0,
                last_failure: None,
            }),
        }
    }

    pub fn state(&self) -> State {
        lock!(self.inner).state
    }

    /// Gate a request. In Open this also performs the timed transition to
    /// HalfOpen; in HalfOpen it accounts for the probe slot.
    pub fn allow(&self) -> Result<(), Rejection> {
        let mut inner = lock!(self.inner);
        match inner.state {
            State::Closed => Ok(()),
            State::Open => {
                let elapsed = inner
                    .last_failure
                    .map(|t| t.elapsed() >= self.config.open_duration)
                    .unwrap_or(true);
                if elapsed {
                    inner.state = State::HalfOpen;
                    inner.half_open_inflight = 1;
                    inner.successes = 0;
                    Ok(())
                } else {
                    Err(Rejection::CircuitOpen)
                }
            }
            State::HalfOpen => {
                if inner.half_open_inflight >= self.config.half_open_max {
                    return Err(Rejection::TooManyProbes);
                }
                inner.half_open_inflight += 1;
                Ok(())
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = lock!(self.inner);
        match inner.state {
            State::Closed => inner.failures = 0,
            State::HalfOpen => {
                inner.successes += 1;
                inner.half_open_inflight =
                    inner.half_open_inflight.saturating_sub(1);
                if inner.successes >= self.config.success_threshold {
                    inner.state = State::Closed;
                    inner.failures = 0;
                    inner.successes = 0;
                }
            }
            State::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = lock!(self.inner);
        inner.last_failure = Some(Instant::now());
        match inner.state {
            State::Closed => {
                inner.failures += 1;
                if inner.failures >= self.config.failure_threshold {
                    inner.state = State::Open;
                }
            }
            State::HalfOpen => {
                inner.state = State::Open;
                inner.half_open_inflight = 0;
            }
            State::Open => {}
        }
    }

    /// Clear all counters and return to Closed.
    pub fn reset(&self) {
        let mut inner = lock!(self.inner);
        inner.state = State::Closed;
        inner.failures = 0;
        inner.successes = 0;
        inner.half_open_inflight = 0;
        inner.last_failure = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick() -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            failure_threshold: 5,
            success_threshold: 3,
            open_duration: Duration::from_millis(40),
            half_open_max: 1,
        })
    }

    #[test]
    fn opens_after_failure_threshold() {
        let cb = quick();
        for _ in 0..4 {
            cb.allow().unwrap();
            cb.record_failure();
        }
        assert_eq!(cb.state(), State::Closed);
        cb.allow().unwrap();
        cb.record_failure();
        assert_eq!(cb.state(), State::Open);
        assert_eq!(cb.allow().unwrap_err(), Rejection::CircuitOpen);
    }

    #[test]
    fn success_resets_closed_failure_count() {
        let cb = quick();
        for _ in 0..4 {
            cb.record_failure();
        }
        cb.record_success();
        for _ in 0..4 {
            cb.record_failure();
        }
        assert_eq!(cb.state(), State::Closed);
    }

    #[test]
    fn half_open_probe_cycle_closes_circuit() {
        let cb = quick();
        for _ in 0..5 {
            cb.record_failure();
        }
        assert_eq!(cb.state(), State::Open);

        std::thread::sleep(Duration::from_millis(50));
        // First allow after the window is the probe.
        cb.allow().unwrap();
        assert_eq!(cb.state(), State::HalfOpen);
        cb.record_success();
        cb.allow().unwrap();
        cb.record_success();
        cb.allow().unwrap();
        cb.record_success();
        assert_eq!(cb.state(), State::Closed);
    }

    #[test]
    fn half_open_limits_concurrent_probes() {
        let cb = quick();
        for _ in 0..5 {
            cb.record_failure();
        }
        std::thread::sleep(Duration::from_millis(50));
        cb.allow().unwrap();
        assert_eq!(cb.allow().unwrap_err(), Rejection::TooManyProbes);
    }

    #[test]
    fn half_open_failure_reopens() {
        let cb = quick();
        for _ in 0..5 {
            cb.record_failure();
        }
        std::thread::sleep(Duration::from_millis(50));
        cb.allow().unwrap();
        cb.record_failure();
        assert_eq!(cb.state(), State::Open);
        assert_eq!(cb.allow().unwrap_err(), Rejection::CircuitOpen);
    }

    #[test]
    fn reset_returns_to_closed() {
        let cb = quick();
        for _ in 0..5 {
            cb.record_failure();
        }
        cb.reset();
        assert_eq!(cb.state(), State::Closed);
        cb.allow().unwrap();
    }
}
