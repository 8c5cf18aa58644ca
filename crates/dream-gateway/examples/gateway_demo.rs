//! Run the gateway end to end against a scripted provider.
//!
//! ```sh
//! cargo run -p dream-gateway --example gateway_demo
//! ```

use dream_cache::DreamCache;
use dream_common::config::{Config, ProviderConfig, SelectionStrategy};
use dream_common::types::GenerateOptions;
use dream_gateway::DreamGateway;
use dream_providers::manager::{ProviderManager, ProviderManagerConfig};
use dream_providers::testing::{ScriptedAdapter, Step};
use std::sync::Arc;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let scene = serde_json::json!({
        "title": "A glass lighthouse over a neon sea",
        "style": "cyberpunk",
        "environment": {
            "preset": "night",
            "fog": 0.35,
            "skyColor": "#0d0221",
            "ambientLight": 0.9
        },
        "structures": [
            {"id": "lighthouse", "template": "crystal_tower", "pos": [0.0, 30.0, 0.0], "scale": 4.0}
        ],
        "entities": [
            {"id": "sparks", "type": "floating_orbs", "count": 40,
             "params": {"speed": 1.2, "glow": 0.9, "size": 0.4, "color": "#00ffcc"}}
        ],
        "cinematography": {
            "durationSec": 30.0,
            "shots": [
                {"type": "establish", "duration": 12.0},
                {"type": "orbital", "target": "lighthouse", "duration": 18.0}
            ]
        }
    })
    .to_string();

    let config = Config::default();
    let manager = Arc::new(ProviderManager::new(ProviderManagerConfig {
        selection: SelectionStrategy::Priority,
        circuit: config.circuit.clone(),
        max_retry_attempts: config.orchestrator.max_retry_attempts,
        max_fallback_hops: config.orchestrator.max_fallback_hops,
        ..ProviderManagerConfig::default()
    }));
    let mut provider = ProviderConfig::named("demo");
    provider.endpoint = "https://demo.invalid/v1".to_string();
    manager.register(
        "demo",
        Arc::new(ScriptedAdapter::repeating(Step::Chat(scene))),
        provider,
    );
    let cache = Arc::new(DreamCache::new(config.cache.clone()));

    let gateway = DreamGateway::with_components(config, manager, cache);
    gateway.start_background();

    let artifact = gateway
        .generate(
            "I dreamed of a glass lighthouse sweeping a neon sea",
            "cyberpunk",
            GenerateOptions::default(),
        )
        .await
        .expect("generation");
    println!("{}", serde_json::to_string_pretty(&artifact).expect("serialize"));

    let stats = gateway.get_stats();
    println!(
        "requests={} cache_hits={} sources={:?}",
        stats.requests, stats.cache_hits, stats.sources
    );
    gateway.shutdown().await;
}
