//! Circuit breaker gating traffic to unhealthy providers
//!
//! State transitions are serialized under a short mutex and never held
//! across awaits, so admission and completion can also run from drop
//! guards on cancelled futures.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Circuit phases
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CircuitPhase {
    /// Requests flow normally
    Closed,
    /// Requests fail fast
    Open,
    /// A single probe request is admitted to test recovery
    HalfOpen,
}

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit. The default is one more
    /// than the default retry budget, so exhausting one request's retries
    /// plus a single further failure trips the breaker.
    pub failure_threshold: u32,
    /// Time the circuit stays open before admitting a probe
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 4,
            cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    phase: CircuitPhase,
    failure_count: u32,
    opened_at: Option<DateTime<Utc>>,
    next_probe_at: Option<Instant>,
    probe_in_flight: bool,
    total_calls: u64,
    successful_calls: u64,
    failed_calls: u64,
}

/// Per-provider circuit breaker
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(BreakerState {
                phase: CircuitPhase::Closed,
                failure_count: 0,
                opened_at: None,
                next_probe_at: None,
                probe_in_flight: false,
                total_calls: 0,
                successful_calls: 0,
                failed_calls: 0,
            }),
        }
    }

    /// Admit or reject a call.
    ///
    /// While open and before the probe time, fails fast with `CircuitOpen`.
    /// In half-open, exactly one probe is admitted; the flag is cleared by
    /// `record_call_result` or `release_probe`, one of which every admitted
    /// call must reach.
    pub fn try_acquire(&self) -> Result<()> {
        let mut state = self.state.lock();
        match state.phase {
            CircuitPhase::Closed => Ok(()),
            CircuitPhase::Open => {
                let due = state
                    .next_probe_at
                    .map(|at| Instant::now() >= at)
                    .unwrap_or(false);
                if due {
                    info!("circuit '{}' half-open, admitting probe", self.name);
                    state.phase = CircuitPhase::HalfOpen;
                    state.probe_in_flight = true;
                    Ok(())
                } else {
                    Err(Error::CircuitOpen(self.name.clone()))
                }
            }
            CircuitPhase::HalfOpen => {
                if state.probe_in_flight {
                    Err(Error::CircuitOpen(self.name.clone()))
                } else {
                    state.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Record the outcome of an admitted call
    pub fn record_call_result(&self, success: bool) {
        let mut state = self.state.lock();
        state.total_calls += 1;
        if success {
            state.successful_calls += 1;
        } else {
            state.failed_calls += 1;
        }

        match state.phase {
            CircuitPhase::Closed => {
                if success {
                    state.failure_count = 0;
                } else {
                    state.failure_count += 1;
                    if state.failure_count >= self.config.failure_threshold {
                        warn!(
                            "circuit '{}' opening after {} consecutive failures",
                            self.name, state.failure_count
                        );
                        state.phase = CircuitPhase::Open;
                        state.opened_at = Some(Utc::now());
                        state.next_probe_at = Some(Instant::now() + self.config.cooldown);
                    }
                }
            }
            CircuitPhase::HalfOpen => {
                state.probe_in_flight = false;
                if success {
                    info!("circuit '{}' closing after successful probe", self.name);
                    state.phase = CircuitPhase::Closed;
                    state.failure_count = 0;
                    state.opened_at = None;
                    state.next_probe_at = None;
                } else {
                    warn!("circuit '{}' reopening after failed probe", self.name);
                    state.phase = CircuitPhase::Open;
                    state.failure_count += 1;
                    state.opened_at = Some(Utc::now());
                    state.next_probe_at = Some(Instant::now() + self.config.cooldown);
                }
            }
            CircuitPhase::Open => {
                // A call completing after the circuit opened; nothing to gate.
                debug!("circuit '{}' received result while open", self.name);
            }
        }
    }

    /// Release an admitted probe without recording a result.
    /// Used when an admitted call is cancelled before completion.
    pub fn release_probe(&self) {
        let mut state = self.state.lock();
        if state.phase == CircuitPhase::HalfOpen {
            state.probe_in_flight = false;
        }
    }

    pub fn phase(&self) -> CircuitPhase {
        self.state.lock().phase
    }

    /// Current state snapshot for the operational surface
    pub fn snapshot(&self) -> CircuitSnapshot {
        let state = self.state.lock();
        let cooldown_remaining_ms = state.next_probe_at.map(|at| {
            at.checked_duration_since(Instant::now())
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0)
        });
        CircuitSnapshot {
            name: self.name.clone(),
            phase: state.phase,
            failure_count: state.failure_count,
            opened_at: state.opened_at,
            cooldown_remaining_ms,
            total_calls: state.total_calls,
            successful_calls: state.successful_calls,
            failed_calls: state.failed_calls,
        }
    }

    /// Reset to closed with clean counters
    pub fn reset(&self) {
        let mut state = self.state.lock();
        info!("resetting circuit '{}'", self.name);
        state.phase = CircuitPhase::Closed;
        state.failure_count = 0;
        state.opened_at = None;
        state.next_probe_at = None;
        state.probe_in_flight = false;
    }

    /// Force the circuit open, e.g. from the operational surface
    pub fn force_open(&self) {
        let mut state = self.state.lock();
        warn!("forcing circuit '{}' open", self.name);
        state.phase = CircuitPhase::Open;
        state.opened_at = Some(Utc::now());
        state.next_probe_at = Some(Instant::now() + self.config.cooldown);
        state.probe_in_flight = false;
    }
}

/// Serializable circuit state for health reports
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CircuitSnapshot {
    pub name: String,
    pub phase: CircuitPhase,
    pub failure_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opened_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooldown_remaining_ms: Option<u64>,
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
}

/// Execute an operation under circuit breaker protection
pub async fn with_circuit_breaker<F, T>(breaker: &CircuitBreaker, operation: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    breaker.try_acquire()?;
    let result = operation.await;
    breaker.record_call_result(result.is_ok());
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tokio::time::sleep;

    fn fast_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            cooldown: Duration::from_millis(50),
        }
    }

    #[test]
    fn starts_closed_and_allows_calls() {
        let cb = CircuitBreaker::new("test", fast_config());
        assert_eq!(cb.phase(), CircuitPhase::Closed);
        assert!(cb.try_acquire().is_ok());
    }

    #[test]
    fn opens_at_failure_threshold() {
        let cb = CircuitBreaker::new("test", fast_config());
        for _ in 0..3 {
            cb.try_acquire().unwrap();
            cb.record_call_result(false);
        }
        assert_eq!(cb.phase(), CircuitPhase::Open);
        assert_matches!(cb.try_acquire(), Err(Error::CircuitOpen(_)));
    }

    #[test]
    fn success_resets_failure_count() {
        let cb = CircuitBreaker::new("test", fast_config());
        cb.record_call_result(false);
        cb.record_call_result(false);
        cb.record_call_result(true);
        cb.record_call_result(false);
        cb.record_call_result(false);
        assert_eq!(cb.phase(), CircuitPhase::Closed);
    }

    #[tokio::test]
    async fn half_open_admits_exactly_one_probe() {
        let cb = CircuitBreaker::new("test", fast_config());
        for _ in 0..3 {
            cb.record_call_result(false);
        }
        sleep(Duration::from_millis(60)).await;

        assert!(cb.try_acquire().is_ok());
        assert_eq!(cb.phase(), CircuitPhase::HalfOpen);
        assert_matches!(cb.try_acquire(), Err(Error::CircuitOpen(_)));
    }

    #[tokio::test]
    async fn successful_probe_closes_circuit() {
        let cb = CircuitBreaker::new("test", fast_config());
        for _ in 0..3 {
            cb.record_call_result(false);
        }
        sleep(Duration::from_millis(60)).await;

        cb.try_acquire().unwrap();
        cb.record_call_result(true);
        assert_eq!(cb.phase(), CircuitPhase::Closed);
        assert!(cb.try_acquire().is_ok());
    }

    #[tokio::test]
    async fn failed_probe_reopens_with_fresh_cooldown() {
        let cb = CircuitBreaker::new("test", fast_config());
        for _ in 0..3 {
            cb.record_call_result(false);
        }
        sleep(Duration::from_millis(60)).await;

        cb.try_acquire().unwrap();
        cb.record_call_result(false);
        assert_eq!(cb.phase(), CircuitPhase::Open);
        assert_matches!(cb.try_acquire(), Err(Error::CircuitOpen(_)));

        sleep(Duration::from_millis(60)).await;
        assert!(cb.try_acquire().is_ok());
    }

    #[tokio::test]
    async fn helper_records_results() {
        let cb = CircuitBreaker::new("test", fast_config());
        let ok: Result<u32> = with_circuit_breaker(&cb, async { Ok(42) }).await;
        assert_eq!(ok.unwrap(), 42);

        for _ in 0..3 {
            let _: Result<u32> = with_circuit_breaker(&cb, async {
                Err(Error::Network("down".to_string()))
            })
            .await;
        }
        assert_eq!(cb.phase(), CircuitPhase::Open);
    }

    #[test]
    fn force_open_blocks_traffic() {
        let cb = CircuitBreaker::new("test", fast_config());
        cb.force_open();
        assert_matches!(cb.try_acquire(), Err(Error::CircuitOpen(_)));
        cb.reset();
        assert!(cb.try_acquire().is_ok());
    }

    #[tokio::test]
    async fn released_probe_can_be_retaken() {
        let cb = CircuitBreaker::new("test", fast_config());
        for _ in 0..3 {
            cb.record_call_result(false);
        }
        sleep(Duration::from_millis(60)).await;

        cb.try_acquire().unwrap();
        cb.release_probe();
        assert!(cb.try_acquire().is_ok());
    }

    #[test]
    fn snapshot_reports_counters() {
        let cb = CircuitBreaker::new("test", fast_config());
        cb.record_call_result(true);
        cb.record_call_result(false);
        let snapshot = cb.snapshot();
        assert_eq!(snapshot.total_calls, 2);
        assert_eq!(snapshot.successful_calls, 1);
        assert_eq!(snapshot.failed_calls, 1);
        assert_eq!(snapshot.phase, CircuitPhase::Closed);
    }
}
