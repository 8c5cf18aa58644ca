//! Configuration for the Dreamscape Gateway

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub providers: Vec<ProviderConfig>,
    pub selection: SelectionStrategy,
    pub cache: CacheConfig,
    pub circuit: CircuitConfig,
    pub orchestrator: OrchestratorConfig,
}

/// Per-provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub endpoint: String,
    pub api_key: Option<String>,
    pub model: String,
    pub timeout_ms: u64,
    pub max_concurrent: u32,
    /// Lower value wins under the priority strategy
    pub priority: u32,
    /// Relative share under the weighted strategy
    pub weight: u32,
}

impl ProviderConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endpoint: String::new(),
            api_key: None,
            model: "default".to_string(),
            timeout_ms: 30_000,
            max_concurrent: 8,
            priority: 100,
            weight: 1,
        }
    }
}

/// Provider selection strategies
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    Priority,
    RoundRobin,
    Weighted,
    Performance,
}

impl Default for SelectionStrategy {
    fn default() -> Self {
        SelectionStrategy::Priority
    }
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub max_size: usize,
    pub ttl_draft_ms: u64,
    pub ttl_standard_ms: u64,
    pub ttl_high_ms: u64,
    pub ttl_cinematic_ms: u64,
    pub sweep_interval_ms: u64,
    pub shared_cache_url: Option<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            ttl_draft_ms: 5 * 60 * 1000,
            ttl_standard_ms: 30 * 60 * 1000,
            ttl_high_ms: 60 * 60 * 1000,
            ttl_cinematic_ms: 2 * 60 * 60 * 1000,
            sweep_interval_ms: 60 * 1000,
            shared_cache_url: None,
        }
    }
}

impl CacheConfig {
    /// TTL for a quality tier
    pub fn ttl_for(&self, quality: crate::types::RequestQuality) -> Duration {
        use crate::types::RequestQuality;
        let ms = match quality {
            RequestQuality::Draft => self.ttl_draft_ms,
            RequestQuality::Medium => self.ttl_standard_ms,
            RequestQuality::High => self.ttl_high_ms,
            RequestQuality::Cinematic => self.ttl_cinematic_ms,
        };
        Duration::from_millis(ms)
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitConfig {
    /// Consecutive failures that open a provider's circuit
    /// (`CIRCUIT_FAILURE_THRESHOLD`). Defaults to `max_retry_attempts + 1`:
    /// one exhausted retry budget plus a single further failure.
    pub failure_threshold: u32,
    pub cooldown_ms: u64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 4,
            cooldown_ms: 30_000,
        }
    }
}

/// Request orchestration configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Total wall-time budget for one request
    pub request_deadline_ms: u64,
    pub max_retry_attempts: u32,
    /// Cap on fallback chain hops per request
    pub max_fallback_hops: u32,
    pub max_repair_attempts: u32,
    /// Grace period for draining in-flight work on shutdown
    pub shutdown_grace_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            request_deadline_ms: 45_000,
            max_retry_attempts: 3,
            max_fallback_hops: 4,
            max_repair_attempts: 2,
            shutdown_grace_ms: 10_000,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            providers: Vec::new(),
            selection: SelectionStrategy::default(),
            cache: CacheConfig::default(),
            circuit: CircuitConfig::default(),
            orchestrator: OrchestratorConfig::default(),
        }
    }
}

impl Config {
    /// Build configuration from the process environment.
    ///
    /// `MCP_PROVIDERS` holds the ordered list of enabled providers; each
    /// provider reads `<NAME>_API_KEY`, `<NAME>_ENDPOINT`, `<NAME>_MODEL`,
    /// `<NAME>_TIMEOUT_MS` and `<NAME>_MAX_CONCURRENT`. Unset values fall
    /// back to defaults.
    pub fn from_env() -> Self {
        let mut config = Config::default();

        if let Ok(list) = std::env::var("MCP_PROVIDERS") {
            for (index, raw_name) in list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .enumerate()
            {
                let prefix = raw_name.to_ascii_uppercase().replace('-', "_");
                let mut provider = ProviderConfig::named(raw_name);
                provider.api_key = std::env::var(format!("{prefix}_API_KEY")).ok();
                if let Ok(endpoint) = std::env::var(format!("{prefix}_ENDPOINT")) {
                    provider.endpoint = endpoint;
                }
                if let Ok(model) = std::env::var(format!("{prefix}_MODEL")) {
                    provider.model = model;
                }
                provider.timeout_ms =
                    env_parse(&format!("{prefix}_TIMEOUT_MS"), provider.timeout_ms);
                provider.max_concurrent =
                    env_parse(&format!("{prefix}_MAX_CONCURRENT"), provider.max_concurrent);
                // List order doubles as default priority
                provider.priority = env_parse(&format!("{prefix}_PRIORITY"), index as u32 + 1);
                provider.weight = env_parse(&format!("{prefix}_WEIGHT"), provider.weight);
                config.providers.push(provider);
            }
        }

        if let Ok(strategy) = std::env::var("MCP_SELECTION_STRATEGY") {
            config.selection = match strategy.to_ascii_lowercase().as_str() {
                "round_robin" => SelectionStrategy::RoundRobin,
                "weighted" => SelectionStrategy::Weighted,
                "performance" => SelectionStrategy::Performance,
                _ => SelectionStrategy::Priority,
            };
        }

        config.cache.max_size = env_parse("CACHE_MAX_SIZE", config.cache.max_size);
        config.cache.ttl_draft_ms = env_parse("CACHE_TTL_DRAFT", config.cache.ttl_draft_ms);
        config.cache.ttl_standard_ms =
            env_parse("CACHE_TTL_STANDARD", config.cache.ttl_standard_ms);
        config.cache.ttl_high_ms = env_parse("CACHE_TTL_HIGH", config.cache.ttl_high_ms);
        config.cache.ttl_cinematic_ms =
            env_parse("CACHE_TTL_CINEMATIC", config.cache.ttl_cinematic_ms);
        config.cache.shared_cache_url = std::env::var("SHARED_CACHE_URL").ok();

        config.circuit.failure_threshold =
            env_parse("CIRCUIT_FAILURE_THRESHOLD", config.circuit.failure_threshold);
        config.circuit.cooldown_ms = env_parse("CIRCUIT_COOLDOWN_MS", config.circuit.cooldown_ms);

        config.orchestrator.request_deadline_ms = env_parse(
            "REQUEST_DEADLINE_MS",
            config.orchestrator.request_deadline_ms,
        );
        config.orchestrator.max_retry_attempts =
            env_parse("MAX_RETRY_ATTEMPTS", config.orchestrator.max_retry_attempts);

        config
    }

    /// Reject configurations the gateway cannot start with
    pub fn validate(&self) -> crate::error::Result<()> {
        for provider in &self.providers {
            if provider.endpoint.is_empty() {
                return Err(crate::error::Error::Configuration(format!(
                    "provider '{}' has no endpoint configured",
                    provider.name
                )));
            }
            if provider.timeout_ms == 0 {
                return Err(crate::error::Error::Configuration(format!(
                    "provider '{}' has a zero timeout",
                    provider.name
                )));
            }
        }
        if self.cache.max_size == 0 {
            return Err(crate::error::Error::Configuration(
                "cache max size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
