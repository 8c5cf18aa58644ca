//! Provider health tracking and report types

use crate::circuit_breaker::CircuitSnapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Rolling window length for the error-rate calculation
const ERROR_RATE_WINDOW: usize = 20;

/// Provider health status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

/// Request-level metrics for one provider
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderMetrics {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub average_latency_ms: f64,
    /// Failure ratio over the most recent calls
    pub error_rate_window: f64,
    pub last_latency_ms: u64,
}

/// Mutable health state for a registered provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthState {
    pub status: ProviderStatus,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub metrics: ProviderMetrics,
    #[serde(skip)]
    recent_outcomes: VecDeque<bool>,
}

impl Default for HealthState {
    fn default() -> Self {
        Self {
            status: ProviderStatus::Unknown,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_error: None,
            metrics: ProviderMetrics::default(),
            recent_outcomes: VecDeque::with_capacity(ERROR_RATE_WINDOW),
        }
    }
}

impl HealthState {
    pub fn record_success(&mut self, latency_ms: u64) {
        self.metrics.requests += 1;
        self.metrics.successes += 1;
        self.metrics.last_latency_ms = latency_ms;
        self.update_latency(latency_ms);
        self.consecutive_successes += 1;
        self.consecutive_failures = 0;
        self.last_error = None;
        self.push_outcome(true);
        self.recompute_status();
    }

    pub fn record_failure(&mut self, error: impl Into<String>, latency_ms: u64) {
        self.metrics.requests += 1;
        self.metrics.failures += 1;
        self.metrics.last_latency_ms = latency_ms;
        self.update_latency(latency_ms);
        self.consecutive_failures += 1;
        self.consecutive_successes = 0;
        self.last_error = Some(error.into());
        self.push_outcome(false);
        self.recompute_status();
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self.status, ProviderStatus::Healthy | ProviderStatus::Unknown)
    }

    /// Exponential moving average, weighted toward history
    fn update_latency(&mut self, latency_ms: u64) {
        if self.metrics.average_latency_ms == 0.0 {
            self.metrics.average_latency_ms = latency_ms as f64;
        } else {
            self.metrics.average_latency_ms =
                self.metrics.average_latency_ms * 0.7 + latency_ms as f64 * 0.3;
        }
    }

    fn push_outcome(&mut self, success: bool) {
        if self.recent_outcomes.len() >= ERROR_RATE_WINDOW {
            self.recent_outcomes.pop_front();
        }
        self.recent_outcomes.push_back(success);
        let failures = self.recent_outcomes.iter().filter(|s| !**s).count();
        self.metrics.error_rate_window = failures as f64 / self.recent_outcomes.len() as f64;
    }

    fn recompute_status(&mut self) {
        self.status = if self.consecutive_failures >= 3 {
            ProviderStatus::Unhealthy
        } else if self.consecutive_failures > 0 || self.metrics.error_rate_window > 0.25 {
            ProviderStatus::Degraded
        } else {
            ProviderStatus::Healthy
        };
    }
}

/// Health snapshot for one provider
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub provider: String,
    pub status: ProviderStatus,
    pub is_healthy: bool,
    pub metrics: ProviderMetrics,
    pub circuit: CircuitSnapshot,
    pub timestamp: DateTime<Utc>,
}

/// Aggregate snapshot across all providers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateHealthReport {
    pub healthy_providers: usize,
    pub total_providers: usize,
    pub providers: Vec<HealthReport>,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_state_is_unknown() {
        let state = HealthState::default();
        assert_eq!(state.status, ProviderStatus::Unknown);
        assert!(state.is_healthy());
    }

    #[test]
    fn successes_mark_healthy() {
        let mut state = HealthState::default();
        state.record_success(120);
        state.record_success(90);
        assert_eq!(state.status, ProviderStatus::Healthy);
        assert_eq!(state.metrics.successes, 2);
        assert_eq!(state.consecutive_successes, 2);
    }

    #[test]
    fn failures_degrade_then_mark_unhealthy() {
        let mut state = HealthState::default();
        state.record_success(100);
        state.record_failure("boom", 50);
        assert_eq!(state.status, ProviderStatus::Degraded);

        state.record_failure("boom", 50);
        state.record_failure("boom", 50);
        assert_eq!(state.status, ProviderStatus::Unhealthy);
        assert_eq!(state.consecutive_failures, 3);
        assert_eq!(state.last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn success_after_failures_recovers() {
        let mut state = HealthState::default();
        for _ in 0..3 {
            state.record_failure("boom", 50);
        }
        for _ in 0..12 {
            state.record_success(80);
        }
        assert_eq!(state.status, ProviderStatus::Healthy);
        assert_eq!(state.consecutive_failures, 0);
    }

    #[test]
    fn latency_average_moves_toward_new_samples() {
        let mut state = HealthState::default();
        state.record_success(100);
        assert!((state.metrics.average_latency_ms - 100.0).abs() < 0.01);
        state.record_success(200);
        assert!(state.metrics.average_latency_ms > 100.0);
        assert!(state.metrics.average_latency_ms < 200.0);
    }

    #[test]
    fn error_rate_tracks_recent_window() {
        let mut state = HealthState::default();
        for _ in 0..10 {
            state.record_success(50);
        }
        state.record_failure("boom", 50);
        assert!((state.metrics.error_rate_window - 1.0 / 11.0).abs() < 0.01);
    }
}
