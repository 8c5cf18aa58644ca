//! Uniform adapter contract over upstream LLM providers

use async_trait::async_trait;
use dream_common::types::{DreamStyle, RequestQuality};
use dream_common::Result;
use dream_parse::RawResponse;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Generation options passed to an adapter
#[derive(Debug, Clone)]
pub struct GenerateParams {
    pub temperature: f64,
    pub max_tokens: u32,
    pub timeout: Duration,
    pub style: DreamStyle,
    pub quality: RequestQuality,
}

impl Default for GenerateParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 4096,
            timeout: Duration::from_secs(30),
            style: DreamStyle::Ethereal,
            quality: RequestQuality::Medium,
        }
    }
}

/// Static capabilities a provider advertises
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub max_tokens: u32,
    pub supports_streaming: bool,
    pub supports_system_prompt: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            max_tokens: 8192,
            supports_streaming: false,
            supports_system_prompt: true,
        }
    }
}

/// Contract every registered upstream implements.
///
/// Adapters own their HTTP/SDK specifics; the rest of the gateway only
/// sees `RawResponse` values and typed errors. Failures must surface as
/// `Err`, never as error-shaped success payloads.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Run one generation call against the upstream
    async fn generate(&self, prompt: &str, params: &GenerateParams) -> Result<RawResponse>;

    /// Cheap liveness check
    async fn test_connection(&self) -> Result<bool>;

    /// Advertised capabilities
    fn capabilities(&self) -> Capabilities;
}
