//! Dreamscape Gateway
//!
//! A creative-AI orchestration gateway: accepts a natural-language dream
//! description plus a style hint and returns a schema-valid scene
//! specification, even when upstream providers are slow, flaky or
//! returning malformed output.
//!
//! The northbound surface is [`DreamGateway`]: `generate`, `get_health`,
//! `invalidate_cache` and `get_stats`.

pub mod composer;
pub mod fallback;
pub mod orchestrator;
pub mod surface;

pub use composer::{ComposedPrompt, PromptComposer};
pub use orchestrator::{DreamGateway, HealthView};
pub use surface::{ErrorSummary, HistogramSnapshot, LatencyHistogram, MetricsSurface, StatsSnapshot};

pub use dream_common::config::Config;
pub use dream_common::types::{
    ArtifactSource, DreamArtifact, DreamStyle, GatewayFailure, GenerateOptions, RequestComplexity,
    RequestQuality,
};
