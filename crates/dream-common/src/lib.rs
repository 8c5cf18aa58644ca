//! Common types and utilities for the Dreamscape Gateway
//!
//! This crate provides the dream artifact data model, the error taxonomy
//! and classifier, the circuit breaker, and configuration shared across
//! all components of the gateway.

pub mod backoff;
pub mod circuit_breaker;
pub mod classify;
pub mod config;
pub mod error;
pub mod health;
pub mod types;

pub use circuit_breaker::{
    with_circuit_breaker, CircuitBreaker, CircuitBreakerConfig, CircuitPhase, CircuitSnapshot,
};
pub use classify::{
    ClassifiedError, ClassifierConfig, ClassifyContext, ErrorClassifier, ErrorType, RecoveryAction,
    RecoveryKind, RecoveryStrategy, SanitizedContext, Severity,
};
pub use config::Config;
pub use error::{Error, Result};
pub use health::{
    AggregateHealthReport, HealthReport, HealthState, ProviderMetrics, ProviderStatus,
};
pub use types::*;
