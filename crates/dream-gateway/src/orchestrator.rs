//! End-to-end request orchestration
//!
//! One request flows cache → compose → provider chain → extract → JSON
//! repair → schema repair → cache. Callers always receive a schema-valid
//! artifact or a structured failure; provider trouble degrades through
//! the fallback tiers instead of propagating.

use crate::composer::PromptComposer;
use crate::fallback;
use crate::surface::{ErrorSummary, MetricsSurface, StatsSnapshot};
use chrono::Utc;
use dream_cache::{
    CacheStats, DreamCache, Fingerprint, Flight, HttpSharedCache, InvalidationStrategy,
    SingleFlight,
};
use dream_common::classify::{ClassifyContext, ErrorClassifier};
use dream_common::config::Config;
use dream_common::health::{AggregateHealthReport, HealthReport};
use dream_common::types::*;
use dream_common::{CircuitSnapshot, Error};
use dream_parse::{repair_json, ResponseExtractor};
use dream_providers::adapter::{GenerateParams, ProviderAdapter};
use dream_providers::manager::{ProviderManager, ProviderManagerConfig};
use dream_providers::HttpProviderAdapter;
use dream_schema::{RepairContext, RepairPipeline, RepairVerdict};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

type BuildResult = std::result::Result<DreamArtifact, GatewayFailure>;

/// Parsed provider content plus what JSON repair had to do to it
struct ParsedContent {
    value: Value,
    json_repaired: bool,
    notes: Vec<String>,
}

/// The gateway facade: orchestration plus the operational surface
pub struct DreamGateway {
    config: Config,
    cache: Arc<DreamCache>,
    flights: SingleFlight<BuildResult>,
    manager: Arc<ProviderManager>,
    composer: PromptComposer,
    extractor: ResponseExtractor,
    repair: RepairPipeline,
    classifier: ErrorClassifier,
    metrics: Arc<MetricsSurface>,
    background: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl DreamGateway {
    /// Build a gateway from configuration, creating an HTTP adapter per
    /// configured provider.
    pub fn new(config: Config) -> dream_common::Result<Self> {
        config.validate()?;

        let manager = Arc::new(ProviderManager::new(ProviderManagerConfig {
            selection: config.selection,
            circuit: config.circuit.clone(),
            max_retry_attempts: config.orchestrator.max_retry_attempts,
            max_fallback_hops: config.orchestrator.max_fallback_hops,
            ..ProviderManagerConfig::default()
        }));
        for provider in &config.providers {
            let adapter = HttpProviderAdapter::new(provider.clone())?;
            manager.register(provider.name.clone(), Arc::new(adapter), provider.clone());
        }

        let mut cache = DreamCache::new(config.cache.clone());
        if let Some(url) = &config.cache.shared_cache_url {
            cache = cache.with_shared(Arc::new(HttpSharedCache::new(url.clone())?));
        }

        Ok(Self::with_components(config, manager, Arc::new(cache)))
    }

    /// Wire a gateway from prebuilt components. Used by tests and by
    /// embedders that register adapters themselves.
    pub fn with_components(
        config: Config,
        manager: Arc<ProviderManager>,
        cache: Arc<DreamCache>,
    ) -> Self {
        let repair = RepairPipeline::new(config.orchestrator.max_repair_attempts);
        Self {
            config,
            cache,
            flights: SingleFlight::new(),
            manager,
            composer: PromptComposer::new(),
            extractor: ResponseExtractor::new(),
            repair,
            classifier: ErrorClassifier::default(),
            metrics: Arc::new(MetricsSurface::new()),
            background: parking_lot::Mutex::new(None),
        }
    }

    /// Register an additional provider adapter
    pub fn register_provider(
        &self,
        name: impl Into<String>,
        adapter: Arc<dyn ProviderAdapter>,
        provider_config: dream_common::config::ProviderConfig,
    ) {
        self.manager.register(name, adapter, provider_config);
    }

    /// Start background maintenance (cache expiry sweeps)
    pub fn start_background(&self) {
        let mut background = self.background.lock();
        if background.is_none() {
            *background = Some(self.cache.start_sweeper());
        }
    }

    pub fn manager(&self) -> &Arc<ProviderManager> {
        &self.manager
    }

    /// Generate a dream artifact for the given text and style.
    ///
    /// Always returns either a schema-valid artifact (possibly with
    /// fallback provenance) or a structured failure for caller errors.
    pub async fn generate(
        &self,
        text: &str,
        style: &str,
        options: GenerateOptions,
    ) -> BuildResult {
        let started = Instant::now();
        self.metrics.record_request();

        let text = text.trim();
        let length = text.chars().count();
        if !(10..=2000).contains(&length) {
            self.metrics.record_failure();
            return Err(GatewayFailure {
                code: "validation".to_string(),
                message: format!("dream text must be 10-2000 characters, got {length}"),
                hint: "describe the dream in a short paragraph".to_string(),
            });
        }

        let style = if style.trim().is_empty() {
            DreamStyle::default()
        } else {
            match style.trim().parse::<DreamStyle>() {
                Ok(style) => style,
                Err(()) => {
                    self.metrics.record_failure();
                    return Err(GatewayFailure {
                        code: "validation".to_string(),
                        message: format!("unknown style '{style}'"),
                        hint: "use one of: ethereal, cyberpunk, surreal, fantasy, nightmare"
                            .to_string(),
                    });
                }
            }
        };

        if let Some(duration) = options.duration {
            if !(10.0..=300.0).contains(&duration) {
                self.metrics.record_failure();
                return Err(GatewayFailure {
                    code: "validation".to_string(),
                    message: format!("duration must be 10-300 seconds, got {duration}"),
                    hint: "pick a duration between 10 and 300 seconds".to_string(),
                });
            }
        }

        let fingerprint = Fingerprint::compute(text, style, &options);

        if let Some(hit) = self.cache.get(&fingerprint, options.quality).await {
            self.metrics.record_cache_hit();
            let mut artifact = hit.artifact;
            artifact.metadata.cache_hit = Some(true);
            artifact.metadata.processing_time = started.elapsed().as_millis() as u64;
            self.metrics
                .record_completion(artifact.metadata.source, started.elapsed(), 0);
            debug!(%fingerprint, "served from cache");
            return Ok(artifact);
        }

        match self.flights.join(&fingerprint).await {
            Flight::Completed(result) => {
                self.metrics.record_coalesced();
                debug!(%fingerprint, "coalesced onto in-flight build");
                result
            }
            Flight::Leader(lease) => {
                let deadline =
                    Duration::from_millis(self.config.orchestrator.request_deadline_ms.max(1));
                let result = match tokio::time::timeout(
                    deadline,
                    self.build(text, style, &options, &fingerprint, started),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(%fingerprint, "request deadline exceeded, short-circuiting to local fallback");
                        Ok(self.finish_fallback(
                            fallback::local_fallback(text, style, &options, fingerprint.seed()),
                            started,
                        ))
                    }
                };

                if let Ok(artifact) = &result {
                    self.cache
                        .put(fingerprint.clone(), artifact.clone(), options.quality, None)
                        .await;
                }
                lease.publish(result.clone());

                match &result {
                    Ok(artifact) => {
                        let attempts = artifact.metadata.repair_attempts.unwrap_or(0);
                        self.metrics.record_completion(
                            artifact.metadata.source,
                            started.elapsed(),
                            attempts,
                        );
                    }
                    Err(_) => self.metrics.record_failure(),
                }
                result
            }
        }
    }

    /// The uncached build path: compose, dispatch, parse, repair, tier down
    async fn build(
        &self,
        text: &str,
        style: DreamStyle,
        options: &GenerateOptions,
        fingerprint: &Fingerprint,
        started: Instant,
    ) -> BuildResult {
        let params = GenerateParams {
            temperature: 0.7,
            max_tokens: 4096,
            timeout: Duration::from_millis(
                self.config
                    .orchestrator
                    .request_deadline_ms
                    .min(30_000)
                    .max(1),
            ),
            style,
            quality: options.quality,
        };
        let repair_ctx = RepairContext {
            style,
            title_hint: fallback::derive_title(text),
            requested_duration: options.duration,
            seed: options.seed.or(Some(fingerprint.seed())),
        };

        let composed = self
            .composer
            .compose(text, style, options.quality, options.complexity, None, params.max_tokens)
            .await;
        debug!(template = %composed.template_id, variant = %composed.variant, "composed prompt");

        match self
            .dispatch_and_repair(&composed.prompt, &params, options, &repair_ctx)
            .await
        {
            Ok(artifact) => Ok(self.stamp(artifact, started)),
            Err(BuildError::Regenerate(addendum)) => {
                // Tier (a): one simplified retry at reduced quality
                info!("artifact needs regeneration, retrying once with a simplified prompt");
                let simple = self
                    .composer
                    .compose(
                        text,
                        style,
                        RequestQuality::Draft,
                        RequestComplexity::Simple,
                        Some(&addendum),
                        params.max_tokens,
                    )
                    .await;
                let mut simple_params = params.clone();
                simple_params.quality = RequestQuality::Draft;
                match self
                    .dispatch_and_repair(&simple.prompt, &simple_params, options, &repair_ctx)
                    .await
                {
                    Ok(mut artifact) => {
                        artifact.push_assumption(
                            "regenerated with a simplified prompt after an incomplete response",
                        );
                        Ok(self.stamp(artifact, started))
                    }
                    Err(BuildError::Surfaced(failure)) => Err(failure),
                    Err(_) => Ok(self.finish_fallback(
                        fallback::local_fallback(text, style, options, fingerprint.seed()),
                        started,
                    )),
                }
            }
            Err(BuildError::Surfaced(failure)) => Err(failure),
            Err(BuildError::Exhausted) => Ok(self.finish_fallback(
                fallback::local_fallback(text, style, options, fingerprint.seed()),
                started,
            )),
        }
    }

    /// One pass through the provider chain and the repair pipeline
    async fn dispatch_and_repair(
        &self,
        prompt: &str,
        params: &GenerateParams,
        options: &GenerateOptions,
        repair_ctx: &RepairContext,
    ) -> std::result::Result<DreamArtifact, BuildError> {
        let extractor = self.extractor.clone();
        let outcome = self
            .manager
            .generate_with(
                prompt,
                params,
                options.provider_hint.as_deref(),
                move |response, provider| {
                    let content = extractor
                        .extract(&response, provider)
                        .filter(|content| !content.trim().is_empty())
                        .ok_or_else(|| {
                            Error::ResponseParsing(format!(
                                "provider '{provider}' returned no usable content"
                            ))
                        })?;
                    let repaired = repair_json(&content);
                    match repaired.value {
                        Some(value) => Ok(ParsedContent {
                            value,
                            json_repaired: repaired.repaired,
                            notes: repaired.notes,
                        }),
                        None => Err(Error::ResponseParsing(format!(
                            "provider '{provider}' returned unparseable JSON: {}",
                            repaired.notes.join("; ")
                        ))),
                    }
                },
            )
            .await;

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(error) => return Err(self.build_error_from(error)),
        };

        let ParsedContent {
            mut value,
            json_repaired,
            notes,
        } = outcome.value;
        self.inject_bookkeeping(&mut value, options);

        let result = self.repair.run(value, repair_ctx);
        match result.verdict {
            RepairVerdict::Valid { repaired } => {
                let mut artifact = match result.artifact {
                    Some(artifact) => artifact,
                    None => return Err(BuildError::Exhausted),
                };
                let content_repaired = repaired || json_repaired;
                artifact.metadata.source = if content_repaired {
                    ArtifactSource::AiRepaired
                } else {
                    ArtifactSource::Ai
                };
                artifact.metadata.provider = Some(outcome.provider);
                artifact.metadata.model = Some(outcome.model);
                artifact.metadata.repair_attempts = Some(result.attempts);
                if json_repaired {
                    for note in notes {
                        artifact.push_assumption(note);
                    }
                }
                Ok(artifact)
            }
            RepairVerdict::NeedsRegeneration {
                prompt_addendum, ..
            } => Err(BuildError::Regenerate(prompt_addendum)),
        }
    }

    /// Fill in the orchestrator-owned fields before validation so their
    /// absence in provider output does not count as a content repair.
    fn inject_bookkeeping(&self, value: &mut Value, options: &GenerateOptions) {
        let root = match value.as_object_mut() {
            Some(root) => root,
            None => return,
        };
        let now = Utc::now().to_rfc3339();

        if !root.get("id").map(Value::is_string).unwrap_or(false) {
            root.insert("id".to_string(), Value::String(format!("dream-{}", Uuid::new_v4())));
        }
        if root.get("seed").map(Value::is_null).unwrap_or(true) {
            if let Some(seed) = options.seed {
                root.insert("seed".to_string(), serde_json::json!(seed));
            }
        }
        root.insert(
            "metadata".to_string(),
            serde_json::json!({
                "source": "ai",
                "generatedAt": now,
                "processingTime": 0,
                "cacheHit": false,
            }),
        );
        for field in ["created", "modified"] {
            let valid = root
                .get(field)
                .and_then(Value::as_str)
                .map(|s| chrono::DateTime::parse_from_rfc3339(s).is_ok())
                .unwrap_or(false);
            if !valid {
                root.insert(field.to_string(), Value::String(now.clone()));
            }
        }
    }

    fn build_error_from(&self, error: Error) -> BuildError {
        let classified = self
            .classifier
            .classify(&error, &ClassifyContext::new("gateway", "generate"));
        self.metrics
            .record_error(classified.error_type, classified.severity);

        match error {
            Error::Authentication(_)
            | Error::Configuration(_)
            | Error::Validation(_)
            | Error::ProviderMethod(_) => BuildError::Surfaced(failure_from(&error)),
            _ => BuildError::Exhausted,
        }
    }

    fn stamp(&self, mut artifact: DreamArtifact, started: Instant) -> DreamArtifact {
        artifact.metadata.generated_at = Utc::now();
        artifact.metadata.processing_time = started.elapsed().as_millis() as u64;
        artifact.metadata.cache_hit = Some(false);
        artifact.modified = Utc::now();
        artifact
    }

    fn finish_fallback(&self, artifact: DreamArtifact, started: Instant) -> DreamArtifact {
        info!(source = %artifact.metadata.source, "returning fallback artifact");
        self.stamp(artifact, started)
    }

    // --- Operational surface (§ metrics/health) ---

    /// Health for one provider or the aggregate when `name` is `None`
    pub async fn get_health(
        &self,
        name: Option<&str>,
    ) -> std::result::Result<HealthView, GatewayFailure> {
        match name {
            Some(name) => self
                .manager
                .get_provider_health(name)
                .await
                .map(HealthView::Single)
                .map_err(|e| failure_from(&e)),
            None => Ok(HealthView::All(self.manager.get_health().await)),
        }
    }

    pub async fn circuit_snapshots(&self) -> Vec<CircuitSnapshot> {
        self.manager.circuit_snapshots().await
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.stats().await
    }

    pub async fn cache_performance(&self) -> dream_cache::CachePerformance {
        self.cache.performance().await
    }

    pub async fn cache_optimize(&self) -> dream_cache::OptimizeReport {
        self.cache.optimize().await
    }

    /// Invalidate cache entries: `failed_ai`, `age` (seconds), `source`
    /// (a provenance tag), or `all`.
    pub async fn invalidate_cache(
        &self,
        strategy: &str,
        value: Option<&str>,
    ) -> std::result::Result<usize, GatewayFailure> {
        let strategy = match strategy {
            "failed_ai" => InvalidationStrategy::FailedAi,
            "all" => InvalidationStrategy::All,
            "age" => {
                let secs = value.and_then(|v| v.parse::<u64>().ok()).ok_or_else(|| {
                    GatewayFailure {
                        code: "validation".to_string(),
                        message: "age invalidation needs a positive number of seconds".to_string(),
                        hint: "pass the age threshold in seconds".to_string(),
                    }
                })?;
                InvalidationStrategy::ByAge(Duration::from_secs(secs))
            }
            "source" => {
                let source = value.and_then(parse_source).ok_or_else(|| GatewayFailure {
                    code: "validation".to_string(),
                    message: format!("unknown source '{}'", value.unwrap_or("")),
                    hint: "use one of: ai, ai_repaired, local_fallback, safe_fallback, \
                           emergency_fallback"
                        .to_string(),
                })?;
                InvalidationStrategy::BySource(source)
            }
            other => {
                return Err(GatewayFailure {
                    code: "validation".to_string(),
                    message: format!("unknown invalidation strategy '{other}'"),
                    hint: "use one of: failed_ai, age, source, all".to_string(),
                })
            }
        };
        Ok(self.cache.invalidate(strategy).await)
    }

    pub fn errors_summary(&self) -> ErrorSummary {
        self.metrics.errors_summary()
    }

    pub fn get_stats(&self) -> StatsSnapshot {
        self.metrics.snapshot()
    }

    /// Refuse new work and drain in-flight requests
    pub async fn shutdown(&self) {
        let grace = Duration::from_millis(self.config.orchestrator.shutdown_grace_ms);
        self.manager.shutdown(grace).await;
        if let Some(handle) = self.background.lock().take() {
            handle.abort();
        }
    }
}

/// Health response: one provider or the aggregate
#[derive(Debug, Clone)]
pub enum HealthView {
    Single(HealthReport),
    All(AggregateHealthReport),
}

enum BuildError {
    /// Ask the chain again with a simplified prompt
    Regenerate(String),
    /// Caller-facing failure, never retried
    Surfaced(GatewayFailure),
    /// Recovery exhausted; fall back locally
    Exhausted,
}

fn failure_from(error: &Error) -> GatewayFailure {
    let code = error.category().to_string();
    let hint = match code.as_str() {
        "authentication" => "check the provider API key configuration",
        "configuration" => "review the gateway provider configuration",
        "validation" => "correct the request and try again",
        "provider_method" => "the provider adapter is incomplete; report this",
        _ => "try the request again later",
    };
    GatewayFailure {
        code,
        message: error.to_string(),
        hint: hint.to_string(),
    }
}

fn parse_source(value: &str) -> Option<ArtifactSource> {
    match value {
        "ai" => Some(ArtifactSource::Ai),
        "ai_repaired" => Some(ArtifactSource::AiRepaired),
        "local_fallback" => Some(ArtifactSource::LocalFallback),
        "safe_fallback" => Some(ArtifactSource::SafeFallback),
        "emergency_fallback" => Some(ArtifactSource::EmergencyFallback),
        _ => None,
    }
}
