//! Provider registry, selection and fallback-chain dispatch
//!
//! The manager owns every registered adapter together with its health
//! state, circuit breaker and concurrency limit. Generation runs as an
//! explicit select→dispatch→classify→decide loop with a bounded step
//! budget: retry the same provider, switch to the next in the chain, or
//! give up and let the orchestrator fall back.

use crate::adapter::{GenerateParams, ProviderAdapter};
use dashmap::DashMap;
use dream_common::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot};
use dream_common::classify::{ClassifierConfig, ClassifyContext, ErrorClassifier, ErrorType};
use dream_common::config::{CircuitConfig, ProviderConfig, SelectionStrategy};
use dream_common::health::{AggregateHealthReport, HealthReport, HealthState, ProviderStatus};
use dream_common::{Error, Result};
use dream_parse::RawResponse;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, info, warn};

/// One registered upstream with its per-provider state
struct RegisteredProvider {
    name: String,
    adapter: Arc<dyn ProviderAdapter>,
    config: ProviderConfig,
    health: RwLock<HealthState>,
    circuit: CircuitBreaker,
    semaphore: Arc<Semaphore>,
    in_flight: AtomicU32,
}

impl RegisteredProvider {
    fn is_dispatchable(&self) -> bool {
        let snapshot = self.circuit.snapshot();
        match snapshot.phase {
            dream_common::CircuitPhase::Open => {
                snapshot.cooldown_remaining_ms.map(|ms| ms == 0).unwrap_or(false)
            }
            _ => true,
        }
    }

    fn load(&self) -> f64 {
        self.in_flight.load(Ordering::Relaxed) as f64 / self.config.max_concurrent.max(1) as f64
    }
}

/// Releases in-flight accounting (and an unrecorded circuit probe) on
/// every exit path, including cancellation mid-call.
struct CallGuard<'a> {
    total: &'a AtomicU32,
    provider: &'a RegisteredProvider,
    completed: bool,
}

impl<'a> CallGuard<'a> {
    fn new(total: &'a AtomicU32, provider: &'a RegisteredProvider) -> Self {
        total.fetch_add(1, Ordering::SeqCst);
        provider.in_flight.fetch_add(1, Ordering::SeqCst);
        Self {
            total,
            provider,
            completed: false,
        }
    }

    /// Mark the call as recorded so drop only releases the counters
    fn complete(mut self) {
        self.completed = true;
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.total.fetch_sub(1, Ordering::SeqCst);
        self.provider.in_flight.fetch_sub(1, Ordering::SeqCst);
        if !self.completed {
            self.provider.circuit.release_probe();
        }
    }
}

/// Manager configuration
#[derive(Debug, Clone)]
pub struct ProviderManagerConfig {
    pub selection: SelectionStrategy,
    pub circuit: CircuitConfig,
    pub max_retry_attempts: u32,
    pub max_fallback_hops: u32,
    pub admission_timeout_ms: u64,
    /// Base delay for in-chain retry backoff
    pub retry_backoff_base_ms: u64,
    /// Cap on concurrent dispatches across all providers
    pub global_max_concurrent: u32,
}

impl Default for ProviderManagerConfig {
    fn default() -> Self {
        Self {
            selection: SelectionStrategy::Priority,
            circuit: CircuitConfig::default(),
            max_retry_attempts: 3,
            max_fallback_hops: 4,
            admission_timeout_ms: 5_000,
            retry_backoff_base_ms: 1_000,
            global_max_concurrent: 64,
        }
    }
}

/// Why a provider was chosen
#[derive(Debug, Clone, PartialEq)]
pub struct SelectionReason {
    pub provider: String,
    pub reason: String,
}

/// Result of a successful chain dispatch
#[derive(Debug, Clone)]
pub struct DispatchOutcome<T> {
    pub value: T,
    pub provider: String,
    pub model: String,
    pub latency: Duration,
    pub attempts: u32,
}

/// Registry and fallback-chain driver over all upstream providers
pub struct ProviderManager {
    providers: DashMap<String, Arc<RegisteredProvider>>,
    config: ProviderManagerConfig,
    classifier: ErrorClassifier,
    round_robin: AtomicUsize,
    global_semaphore: Arc<Semaphore>,
    in_flight_total: AtomicU32,
    shutting_down: AtomicBool,
}

impl ProviderManager {
    pub fn new(config: ProviderManagerConfig) -> Self {
        let classifier = ErrorClassifier::new(ClassifierConfig {
            max_retry_attempts: config.max_retry_attempts,
            backoff_base_ms: config.retry_backoff_base_ms,
            ..ClassifierConfig::default()
        });
        let global_semaphore = Arc::new(Semaphore::new(config.global_max_concurrent.max(1) as usize));
        Self {
            providers: DashMap::new(),
            config,
            classifier,
            round_robin: AtomicUsize::new(0),
            global_semaphore,
            in_flight_total: AtomicU32::new(0),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Register an adapter under a provider name
    pub fn register(
        &self,
        name: impl Into<String>,
        adapter: Arc<dyn ProviderAdapter>,
        config: ProviderConfig,
    ) {
        let name = name.into();
        info!(provider = %name, "registering provider");
        let breaker_config = CircuitBreakerConfig {
            failure_threshold: self.config.circuit.failure_threshold,
            cooldown: Duration::from_millis(self.config.circuit.cooldown_ms),
        };
        let provider = Arc::new(RegisteredProvider {
            name: name.clone(),
            semaphore: Arc::new(Semaphore::new(config.max_concurrent.max(1) as usize)),
            circuit: CircuitBreaker::new(name.clone(), breaker_config),
            health: RwLock::new(HealthState::default()),
            adapter,
            config,
            in_flight: AtomicU32::new(0),
        });
        self.providers.insert(name, provider);
    }

    pub fn unregister(&self, name: &str) -> bool {
        info!(provider = %name, "unregistering provider");
        self.providers.remove(name).is_some()
    }

    pub fn provider_count(&self) -> usize {
        self.providers.len()
    }

    /// Select the provider the next request would be routed to
    pub async fn select(&self, provider_hint: Option<&str>) -> Result<SelectionReason> {
        let chain = self.build_chain(provider_hint).await;
        let first = chain.first().ok_or_else(|| {
            Error::Unknown("no eligible providers available".to_string())
        })?;
        let reason = match provider_hint {
            Some(hint) if first.name == hint => "caller hint".to_string(),
            _ => format!("{:?} strategy", self.config.selection),
        };
        Ok(SelectionReason {
            provider: first.name.clone(),
            reason,
        })
    }

    /// Ordered fallback chain for one request, capped at the hop budget.
    /// Providers with an open circuit (and cooldown still running) are
    /// excluded; degraded providers stay eligible with a scoring penalty.
    async fn build_chain(&self, provider_hint: Option<&str>) -> Vec<Arc<RegisteredProvider>> {
        let mut eligible = Vec::new();
        for entry in self.providers.iter() {
            let provider = Arc::clone(entry.value());
            if provider.is_dispatchable() {
                eligible.push(provider);
            }
        }

        match self.config.selection {
            SelectionStrategy::Priority => {
                eligible.sort_by(|a, b| {
                    a.config
                        .priority
                        .cmp(&b.config.priority)
                        .then_with(|| a.name.cmp(&b.name))
                });
            }
            SelectionStrategy::RoundRobin => {
                eligible.sort_by(|a, b| a.name.cmp(&b.name));
                if !eligible.is_empty() {
                    let offset = self.round_robin.fetch_add(1, Ordering::Relaxed) % eligible.len();
                    eligible.rotate_left(offset);
                }
            }
            SelectionStrategy::Weighted => {
                // Weighted shuffle: heavier providers sort earlier more often
                let mut rng = rand::thread_rng();
                let mut keyed: Vec<(f64, Arc<RegisteredProvider>)> = eligible
                    .into_iter()
                    .map(|p| {
                        let weight = p.config.weight.max(1) as f64;
                        let draw: f64 = rng.gen_range(f64::EPSILON..1.0);
                        (-draw.ln() / weight, p)
                    })
                    .collect();
                keyed.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
                eligible = keyed.into_iter().map(|(_, p)| p).collect();
            }
            SelectionStrategy::Performance => {
                let mut scored = Vec::with_capacity(eligible.len());
                for provider in eligible {
                    let score = Self::performance_score(&provider).await;
                    scored.push((score, provider));
                }
                scored.sort_by(|a, b| {
                    b.0.partial_cmp(&a.0)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| a.1.config.priority.cmp(&b.1.config.priority))
                        .then_with(|| a.1.name.cmp(&b.1.name))
                });
                eligible = scored.into_iter().map(|(_, p)| p).collect();
            }
        }

        if let Some(hint) = provider_hint {
            if let Some(index) = eligible.iter().position(|p| p.name == hint) {
                let pinned = eligible.remove(index);
                eligible.insert(0, pinned);
            }
        }

        eligible.truncate(self.config.max_fallback_hops.max(1) as usize);
        eligible
    }

    /// `w₁·successRate − w₂·avgLatency − w₃·load`, with penalties for
    /// degraded and unhealthy status
    async fn performance_score(provider: &RegisteredProvider) -> f64 {
        let health = provider.health.read().await;
        let success_rate = if health.metrics.requests > 0 {
            health.metrics.successes as f64 / health.metrics.requests as f64
        } else {
            1.0
        };
        let latency_norm = (health.metrics.average_latency_ms / 10_000.0).min(1.0);
        let mut score = success_rate - 0.5 * latency_norm - 0.3 * provider.load();
        match health.status {
            ProviderStatus::Degraded => score -= 0.2,
            ProviderStatus::Unhealthy => score -= 0.5,
            _ => {}
        }
        score
    }

    /// Dispatch a prompt through the fallback chain and return the raw
    /// provider response.
    pub async fn generate(
        &self,
        prompt: &str,
        params: &GenerateParams,
        provider_hint: Option<&str>,
    ) -> Result<DispatchOutcome<RawResponse>> {
        self.generate_with(prompt, params, provider_hint, |response, _| Ok(response))
            .await
    }

    /// Dispatch with a content acceptor.
    ///
    /// The acceptor turns a raw response into the caller's value; its
    /// failures count as provider failures (classified, fed to health and
    /// circuit state) and drive the same retry/switch machinery as
    /// transport errors.
    pub async fn generate_with<T>(
        &self,
        prompt: &str,
        params: &GenerateParams,
        provider_hint: Option<&str>,
        accept: impl Fn(RawResponse, &str) -> Result<T>,
    ) -> Result<DispatchOutcome<T>> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(Error::Unknown("provider manager is shutting down".to_string()));
        }

        let chain = self.build_chain(provider_hint).await;
        if chain.is_empty() {
            warn!("fallback chain is empty, no eligible providers");
            return Err(Error::Unknown("no eligible providers available".to_string()));
        }
        let chain_len = chain.len();

        let mut attempt_number = 0u32;
        let mut last_error: Option<Error> = None;

        'chain: for (hop, provider) in chain.into_iter().enumerate() {
            let mut provider_attempts = 0u32;
            let mut waited_for_rate_limit = false;
            let mut retried_parse_failure = false;

            loop {
                if provider.circuit.try_acquire().is_err() {
                    debug!(provider = %provider.name, "circuit rejected dispatch");
                    last_error = Some(Error::CircuitOpen(provider.name.clone()));
                    continue 'chain;
                }

                attempt_number += 1;
                provider_attempts += 1;
                let started = Instant::now();
                let call_result = {
                    let guard = CallGuard::new(&self.in_flight_total, &provider);
                    let result = self
                        .call_adapter(&provider, prompt, params)
                        .await
                        .and_then(|response| accept(response, &provider.name));
                    provider.circuit.record_call_result(result.is_ok());
                    guard.complete();
                    result
                };
                let latency = started.elapsed();

                match call_result {
                    Ok(value) => {
                        provider.health.write().await.record_success(latency.as_millis() as u64);
                        debug!(
                            provider = %provider.name,
                            attempts = attempt_number,
                            "generation succeeded"
                        );
                        return Ok(DispatchOutcome {
                            value,
                            provider: provider.name.clone(),
                            model: provider.config.model.clone(),
                            latency,
                            attempts: attempt_number,
                        });
                    }
                    Err(error) => {
                        let consecutive_failures = {
                            let mut health = provider.health.write().await;
                            health.record_failure(error.to_string(), latency.as_millis() as u64);
                            health.consecutive_failures
                        };

                        let mut context =
                            ClassifyContext::new(provider.name.clone(), "generate");
                        context.attempt_number = attempt_number;
                        context.consecutive_failures = consecutive_failures;
                        context.response_time_ms = Some(latency.as_millis() as u64);
                        context.all_providers_failed = hop + 1 == chain_len;
                        if let Error::RateLimit {
                            retry_after_secs: Some(secs),
                            ..
                        } = &error
                        {
                            context.response_headers = Some(HashMap::from([(
                                "Retry-After".to_string(),
                                secs.to_string(),
                            )]));
                        }
                        let classified = self.classifier.classify(&error, &context);

                        if classified.error_type.is_terminal() {
                            // Surfaced to the caller; exactly one dispatch
                            return Err(error);
                        }
                        if !classified.retryable {
                            last_error = Some(error);
                            break 'chain;
                        }

                        let switch = match classified.error_type {
                            ErrorType::ResponseParsing => {
                                let done = retried_parse_failure;
                                retried_parse_failure = true;
                                done
                            }
                            ErrorType::RateLimit => {
                                let done = waited_for_rate_limit;
                                waited_for_rate_limit = true;
                                done
                            }
                            _ => provider_attempts >= self.config.max_retry_attempts,
                        };
                        last_error = Some(error);

                        if switch {
                            debug!(provider = %provider.name, "switching provider");
                            continue 'chain;
                        }

                        let delay = classified
                            .retry_delay(provider_attempts)
                            .min(Duration::from_secs(30));
                        if !delay.is_zero() {
                            debug!(provider = %provider.name, ?delay, "backing off before retry");
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| Error::Unknown("fallback chain exhausted".to_string())))
    }

    /// One admitted call: semaphore admission, then the adapter call
    /// bounded by the request timeout. The permit is RAII; in-flight
    /// accounting lives in the caller's guard.
    async fn call_adapter(
        &self,
        provider: &Arc<RegisteredProvider>,
        prompt: &str,
        params: &GenerateParams,
    ) -> Result<RawResponse> {
        let admission = Duration::from_millis(self.config.admission_timeout_ms.max(1));
        let _global = match tokio::time::timeout(
            admission,
            Arc::clone(&self.global_semaphore).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(Error::Unknown("global semaphore closed".to_string()))
            }
            Err(_) => {
                return Err(Error::Timeout(
                    "global admission queue timed out".to_string(),
                ))
            }
        };
        let _permit = match tokio::time::timeout(
            admission,
            Arc::clone(&provider.semaphore).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(Error::Unknown(format!(
                    "semaphore closed for provider '{}'",
                    provider.name
                )))
            }
            Err(_) => {
                return Err(Error::Timeout(format!(
                    "admission queue timed out for provider '{}'",
                    provider.name
                )))
            }
        };

        tokio::time::timeout(params.timeout, provider.adapter.generate(prompt, params))
            .await
            .unwrap_or_else(|_| {
                Err(Error::Timeout(format!(
                    "provider '{}' exceeded {}ms",
                    provider.name,
                    params.timeout.as_millis()
                )))
            })
    }

    /// Health report for one provider
    pub async fn get_provider_health(&self, name: &str) -> Result<HealthReport> {
        let provider = self
            .providers
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| Error::Configuration(format!("unknown provider '{name}'")))?;

        let health = provider.health.read().await.clone();
        Ok(HealthReport {
            provider: provider.name.clone(),
            status: health.status,
            is_healthy: health.is_healthy(),
            metrics: health.metrics,
            circuit: provider.circuit.snapshot(),
            timestamp: chrono::Utc::now(),
        })
    }

    /// Aggregate health report across all providers
    pub async fn get_health(&self) -> AggregateHealthReport {
        let mut reports = Vec::new();
        for entry in self.providers.iter() {
            let provider = Arc::clone(entry.value());
            let health = provider.health.read().await.clone();
            reports.push(HealthReport {
                provider: provider.name.clone(),
                status: health.status,
                is_healthy: health.is_healthy(),
                metrics: health.metrics,
                circuit: provider.circuit.snapshot(),
                timestamp: chrono::Utc::now(),
            });
        }
        reports.sort_by(|a, b| a.provider.cmp(&b.provider));
        AggregateHealthReport {
            healthy_providers: reports.iter().filter(|r| r.is_healthy).count(),
            total_providers: reports.len(),
            providers: reports,
            timestamp: chrono::Utc::now(),
        }
    }

    /// Circuit snapshots for the operational surface
    pub async fn circuit_snapshots(&self) -> Vec<CircuitSnapshot> {
        let mut snapshots = Vec::new();
        for entry in self.providers.iter() {
            snapshots.push(entry.value().circuit.snapshot());
        }
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    /// Reset a provider's circuit to closed
    pub async fn reset_circuit(&self, name: &str) -> Result<()> {
        let provider = self
            .providers
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| Error::Configuration(format!("unknown provider '{name}'")))?;
        provider.circuit.reset();
        Ok(())
    }

    /// Run the adapter's liveness check and fold it into health state
    pub async fn probe(&self, name: &str) -> Result<bool> {
        let provider = self
            .providers
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| Error::Configuration(format!("unknown provider '{name}'")))?;

        let started = Instant::now();
        let alive = provider.adapter.test_connection().await.unwrap_or(false);
        let latency = started.elapsed().as_millis() as u64;
        let mut health = provider.health.write().await;
        if alive {
            health.record_success(latency);
        } else {
            health.record_failure("liveness check failed", latency);
        }
        Ok(alive)
    }

    /// Refuse new work and drain in-flight requests within the grace period
    pub async fn shutdown(&self, grace: Duration) {
        info!("provider manager shutting down");
        self.shutting_down.store(true, Ordering::SeqCst);
        let deadline = Instant::now() + grace;
        while self.in_flight_total.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let remaining = self.in_flight_total.load(Ordering::SeqCst);
        if remaining > 0 {
            warn!(remaining, "shutdown grace period expired with requests in flight");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FailKind, ScriptedAdapter, Step};
    use assert_matches::assert_matches;
    use dream_common::CircuitPhase;
    use dream_parse::ResponseExtractor;

    fn provider_config(name: &str, priority: u32) -> ProviderConfig {
        let mut config = ProviderConfig::named(name);
        config.endpoint = format!("https://{name}.example/v1");
        config.priority = priority;
        config
    }

    fn manager_config() -> ProviderManagerConfig {
        ProviderManagerConfig {
            circuit: CircuitConfig {
                failure_threshold: 3,
                cooldown_ms: 60_000,
            },
            retry_backoff_base_ms: 1,
            ..ProviderManagerConfig::default()
        }
    }

    fn valid_json() -> String {
        r#"{"title": "ok"}"#.to_string()
    }

    #[tokio::test]
    async fn happy_path_uses_primary_provider() {
        let manager = ProviderManager::new(manager_config());
        manager.register(
            "alpha",
            Arc::new(ScriptedAdapter::new(vec![Step::Chat(valid_json())])),
            provider_config("alpha", 1),
        );
        manager.register(
            "beta",
            Arc::new(ScriptedAdapter::new(vec![Step::Chat(valid_json())])),
            provider_config("beta", 2),
        );

        let outcome = manager
            .generate("prompt", &GenerateParams::default(), None)
            .await
            .unwrap();
        assert_eq!(outcome.provider, "alpha");
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn provider_hint_pins_first_hop() {
        let manager = ProviderManager::new(manager_config());
        manager.register(
            "alpha",
            Arc::new(ScriptedAdapter::new(vec![Step::Chat(valid_json())])),
            provider_config("alpha", 1),
        );
        manager.register(
            "beta",
            Arc::new(ScriptedAdapter::new(vec![Step::Chat(valid_json())])),
            provider_config("beta", 2),
        );

        let selection = manager.select(Some("beta")).await.unwrap();
        assert_eq!(selection.provider, "beta");
        assert_eq!(selection.reason, "caller hint");
    }

    #[tokio::test]
    async fn failover_after_repeated_server_errors() {
        let manager = ProviderManager::new(manager_config());
        let alpha = Arc::new(ScriptedAdapter::new(vec![
            Step::Fail(FailKind::Status(503)),
            Step::Fail(FailKind::Status(503)),
            Step::Fail(FailKind::Status(503)),
        ]));
        manager.register("alpha", alpha.clone(), provider_config("alpha", 1));
        manager.register(
            "beta",
            Arc::new(ScriptedAdapter::new(vec![Step::Chat(valid_json())])),
            provider_config("beta", 2),
        );

        let outcome = manager
            .generate("prompt", &GenerateParams::default(), None)
            .await
            .unwrap();
        assert_eq!(outcome.provider, "beta");
        assert_eq!(alpha.calls(), 3);

        // Three consecutive failures tripped alpha's circuit
        let health = manager.get_provider_health("alpha").await.unwrap();
        assert!(health.circuit.failure_count >= 3);
        assert_eq!(health.circuit.phase, CircuitPhase::Open);

        // The next request skips alpha entirely
        let outcome = manager
            .generate("prompt", &GenerateParams::default(), None)
            .await
            .unwrap();
        assert_eq!(outcome.provider, "beta");
        assert_eq!(alpha.calls(), 3);
    }

    #[tokio::test]
    async fn authentication_errors_surface_after_one_dispatch() {
        let manager = ProviderManager::new(manager_config());
        let alpha = Arc::new(ScriptedAdapter::new(vec![Step::Fail(FailKind::Auth)]));
        manager.register("alpha", alpha.clone(), provider_config("alpha", 1));
        manager.register(
            "beta",
            Arc::new(ScriptedAdapter::new(vec![Step::Chat(valid_json())])),
            provider_config("beta", 2),
        );

        let error = manager
            .generate("prompt", &GenerateParams::default(), None)
            .await
            .unwrap_err();
        assert_matches!(error, Error::Authentication(_));
        assert_eq!(alpha.calls(), 1);
    }

    #[tokio::test]
    async fn rate_limit_waits_once_then_switches() {
        let manager = ProviderManager::new(manager_config());
        let alpha = Arc::new(ScriptedAdapter::new(vec![
            Step::Fail(FailKind::RateLimit(Some(0))),
            Step::Fail(FailKind::RateLimit(Some(0))),
        ]));
        manager.register("alpha", alpha.clone(), provider_config("alpha", 1));
        let beta = Arc::new(ScriptedAdapter::new(vec![Step::Chat(valid_json())]));
        manager.register("beta", beta.clone(), provider_config("beta", 2));

        let outcome = manager
            .generate("prompt", &GenerateParams::default(), None)
            .await
            .unwrap();
        // One in-request wait and retry on alpha, then a switch to beta
        assert_eq!(alpha.calls(), 2);
        assert_eq!(outcome.provider, "beta");
    }

    #[tokio::test]
    async fn rate_limit_retry_can_succeed_on_same_provider() {
        let manager = ProviderManager::new(manager_config());
        let alpha = Arc::new(ScriptedAdapter::new(vec![
            Step::Fail(FailKind::RateLimit(Some(0))),
            Step::Chat(valid_json()),
        ]));
        manager.register("alpha", alpha.clone(), provider_config("alpha", 1));

        let outcome = manager
            .generate("prompt", &GenerateParams::default(), None)
            .await
            .unwrap();
        assert_eq!(outcome.provider, "alpha");
        assert_eq!(alpha.calls(), 2);
    }

    #[tokio::test]
    async fn empty_content_retries_once_then_switches() {
        let manager = ProviderManager::new(manager_config());
        let alpha = Arc::new(ScriptedAdapter::new(vec![
            Step::Content(String::new()),
            Step::Content(String::new()),
        ]));
        manager.register("alpha", alpha.clone(), provider_config("alpha", 1));
        let beta = Arc::new(ScriptedAdapter::new(vec![Step::Chat(valid_json())]));
        manager.register("beta", beta.clone(), provider_config("beta", 2));

        let extractor = ResponseExtractor::new();
        let outcome = manager
            .generate_with("prompt", &GenerateParams::default(), None, |response, name| {
                match extractor.extract(&response, name) {
                    Some(content) if !content.trim().is_empty() => Ok(content),
                    _ => Err(Error::ResponseParsing(format!(
                        "provider '{name}' returned empty content"
                    ))),
                }
            })
            .await
            .unwrap();
        assert_eq!(alpha.calls(), 2);
        assert_eq!(outcome.provider, "beta");
    }

    #[tokio::test]
    async fn exhausted_chain_returns_last_error() {
        let manager = ProviderManager::new(manager_config());
        manager.register(
            "alpha",
            Arc::new(ScriptedAdapter::repeating(Step::Fail(FailKind::Network))),
            provider_config("alpha", 1),
        );

        let error = manager
            .generate("prompt", &GenerateParams::default(), None)
            .await
            .unwrap_err();
        assert_matches!(error, Error::Network(_));
    }

    #[tokio::test]
    async fn no_providers_is_an_error() {
        let manager = ProviderManager::new(manager_config());
        let error = manager
            .generate("prompt", &GenerateParams::default(), None)
            .await
            .unwrap_err();
        assert_matches!(error, Error::Unknown(_));
    }

    #[tokio::test]
    async fn round_robin_rotates_providers() {
        let mut config = manager_config();
        config.selection = SelectionStrategy::RoundRobin;
        let manager = ProviderManager::new(config);
        manager.register(
            "alpha",
            Arc::new(ScriptedAdapter::repeating(Step::Chat(valid_json()))),
            provider_config("alpha", 1),
        );
        manager.register(
            "beta",
            Arc::new(ScriptedAdapter::repeating(Step::Chat(valid_json()))),
            provider_config("beta", 1),
        );

        let first = manager.select(None).await.unwrap().provider;
        let second = manager.select(None).await.unwrap().provider;
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn performance_strategy_avoids_failing_provider() {
        let mut config = manager_config();
        config.selection = SelectionStrategy::Performance;
        config.circuit.failure_threshold = 10;
        let manager = ProviderManager::new(config);
        let alpha = Arc::new(ScriptedAdapter::new(vec![
            Step::Fail(FailKind::Network),
            Step::Fail(FailKind::Network),
        ]));
        manager.register("alpha", alpha, provider_config("alpha", 1));
        manager.register(
            "beta",
            Arc::new(ScriptedAdapter::repeating(Step::Chat(valid_json()))),
            provider_config("beta", 2),
        );

        // Tarnish alpha's health, then selection should prefer beta
        let mut params = GenerateParams::default();
        params.timeout = Duration::from_secs(1);
        let _ = manager.generate("prompt", &params, Some("alpha")).await;

        let selection = manager.select(None).await.unwrap();
        assert_eq!(selection.provider, "beta");
    }

    #[tokio::test]
    async fn shutdown_refuses_new_work() {
        let manager = ProviderManager::new(manager_config());
        manager.register(
            "alpha",
            Arc::new(ScriptedAdapter::repeating(Step::Chat(valid_json()))),
            provider_config("alpha", 1),
        );
        manager.shutdown(Duration::from_millis(50)).await;

        let error = manager
            .generate("prompt", &GenerateParams::default(), None)
            .await
            .unwrap_err();
        assert_matches!(error, Error::Unknown(_));
    }

    #[tokio::test]
    async fn admission_timeout_surfaces_as_timeout() {
        let mut config = manager_config();
        config.admission_timeout_ms = 30;
        let manager = Arc::new(ProviderManager::new(config));
        let mut provider = provider_config("alpha", 1);
        provider.max_concurrent = 1;
        manager.register(
            "alpha",
            Arc::new(ScriptedAdapter::repeating(Step::Slow(
                Duration::from_millis(300),
                valid_json(),
            ))),
            provider,
        );

        let slow = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                manager
                    .generate("prompt", &GenerateParams::default(), None)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let error = manager
            .generate("prompt", &GenerateParams::default(), None)
            .await
            .unwrap_err();
        assert_matches!(error, Error::Timeout(_));
        let _ = slow.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn unregister_removes_provider() {
        let manager = ProviderManager::new(manager_config());
        manager.register(
            "alpha",
            Arc::new(ScriptedAdapter::repeating(Step::Chat(valid_json()))),
            provider_config("alpha", 1),
        );
        assert_eq!(manager.provider_count(), 1);
        assert!(manager.unregister("alpha"));
        assert_eq!(manager.provider_count(), 0);
    }

    #[tokio::test]
    async fn health_report_for_unknown_provider_is_configuration_error() {
        let manager = ProviderManager::new(manager_config());
        let error = manager.get_provider_health("ghost").await.unwrap_err();
        assert_matches!(error, Error::Configuration(_));
    }
}
