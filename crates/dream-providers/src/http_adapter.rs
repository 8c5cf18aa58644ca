//! HTTP adapter for chat-completions style upstreams

use crate::adapter::{Capabilities, GenerateParams, ProviderAdapter};
use async_trait::async_trait;
use dream_common::config::ProviderConfig;
use dream_common::{Error, Result};
use dream_parse::RawResponse;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

/// Adapter speaking the common chat-completions wire shape
pub struct HttpProviderAdapter {
    name: String,
    client: reqwest::Client,
    config: ProviderConfig,
    capabilities: Capabilities,
}

impl HttpProviderAdapter {
    pub fn new(config: ProviderConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .user_agent("dreamscape-gateway/0.1")
            .build()
            .map_err(|e| Error::Configuration(format!("http client for '{}': {e}", config.name)))?;

        Ok(Self {
            name: config.name.clone(),
            client,
            config,
            capabilities: Capabilities::default(),
        })
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    fn auth_header(&self) -> Option<String> {
        self.config.api_key.as_ref().map(|key| format!("Bearer {key}"))
    }

    /// Map a failed HTTP response to a typed error, draining the body for
    /// the message. Rate-limit waits are read from the response headers.
    async fn error_from_response(&self, response: reqwest::Response) -> Error {
        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get("Retry-After")
            .or_else(|| response.headers().get("X-RateLimit-Reset"))
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let body = response.text().await.unwrap_or_default();
        let message = if body.is_empty() {
            format!("upstream returned status {status}")
        } else {
            body.chars().take(512).collect()
        };

        match status {
            429 => Error::RateLimit {
                message,
                retry_after_secs: retry_after,
            },
            401 | 403 => Error::Authentication(message),
            400 => Error::Validation(message),
            _ => Error::Provider { status, message },
        }
    }

    fn error_from_transport(&self, error: reqwest::Error) -> Error {
        if error.is_timeout() {
            Error::Timeout(format!("request to '{}' timed out", self.name))
        } else if error.is_connect() {
            Error::Network(format!("connection to '{}' failed: {error}", self.name))
        } else {
            Error::Network(format!("transport error for '{}': {error}", self.name))
        }
    }
}

#[async_trait]
impl ProviderAdapter for HttpProviderAdapter {
    async fn generate(&self, prompt: &str, params: &GenerateParams) -> Result<RawResponse> {
        debug!(provider = %self.name, "dispatching generation request");

        let body = json!({
            "model": self.config.model,
            "messages": [
                {"role": "user", "content": prompt}
            ],
            "temperature": params.temperature,
            "max_tokens": params.max_tokens.min(self.capabilities.max_tokens),
        });

        let mut request = self
            .client
            .post(&self.config.endpoint)
            .json(&body)
            .timeout(params.timeout);
        if let Some(auth) = self.auth_header() {
            request = request.header("Authorization", auth);
        }

        let response = request
            .send()
            .await
            .map_err(|e| self.error_from_transport(e))?;

        if !response.status().is_success() {
            let error = self.error_from_response(response).await;
            warn!(provider = %self.name, "upstream call failed: {error}");
            return Err(error);
        }

        let text = response
            .text()
            .await
            .map_err(|e| Error::Network(format!("reading body from '{}': {e}", self.name)))?;
        Ok(RawResponse::from_text(text))
    }

    async fn test_connection(&self) -> Result<bool> {
        let url = format!("{}/health", self.config.endpoint.trim_end_matches('/'));
        let mut request = self.client.get(&url).timeout(Duration::from_secs(5));
        if let Some(auth) = self.auth_header() {
            request = request.header("Authorization", auth);
        }
        match request.send().await {
            Ok(response) => Ok(response.status().is_success()),
            Err(e) => {
                warn!(provider = %self.name, "liveness check failed: {e}");
                Ok(false)
            }
        }
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(endpoint: String) -> ProviderConfig {
        ProviderConfig {
            name: "alpha".to_string(),
            endpoint,
            api_key: Some("test-key".to_string()),
            model: "dream-v1".to_string(),
            timeout_ms: 2_000,
            max_concurrent: 4,
            priority: 1,
            weight: 1,
        }
    }

    #[tokio::test]
    async fn sends_chat_request_with_auth() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat"))
            .and(header("Authorization", "Bearer test-key"))
            .and(body_partial_json(json!({"model": "dream-v1"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"content": "{\"title\": \"ok\"}"}}]
            })))
            .mount(&server)
            .await;

        let adapter = HttpProviderAdapter::new(config(format!("{}/v1/chat", server.uri()))).unwrap();
        let response = adapter
            .generate("dream prompt", &GenerateParams::default())
            .await
            .unwrap();
        assert_matches!(response, RawResponse::Chat(_));
    }

    #[tokio::test]
    async fn rate_limit_carries_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("Retry-After", "2")
                    .set_body_string("rate limit exceeded"),
            )
            .mount(&server)
            .await;

        let adapter = HttpProviderAdapter::new(config(server.uri())).unwrap();
        let error = adapter
            .generate("p", &GenerateParams::default())
            .await
            .unwrap_err();
        assert_matches!(
            error,
            Error::RateLimit {
                retry_after_secs: Some(2),
                ..
            }
        );
    }

    #[tokio::test]
    async fn auth_failures_are_typed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid api key"))
            .mount(&server)
            .await;

        let adapter = HttpProviderAdapter::new(config(server.uri())).unwrap();
        let error = adapter
            .generate("p", &GenerateParams::default())
            .await
            .unwrap_err();
        assert_matches!(error, Error::Authentication(_));
    }

    #[tokio::test]
    async fn server_errors_carry_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("upstream down"))
            .mount(&server)
            .await;

        let adapter = HttpProviderAdapter::new(config(server.uri())).unwrap();
        let error = adapter
            .generate("p", &GenerateParams::default())
            .await
            .unwrap_err();
        assert_matches!(error, Error::Provider { status: 503, .. });
    }

    #[tokio::test]
    async fn connection_refused_is_network_error() {
        let adapter = HttpProviderAdapter::new(config("http://127.0.0.1:1".to_string())).unwrap();
        let error = adapter
            .generate("p", &GenerateParams::default())
            .await
            .unwrap_err();
        assert_matches!(error, Error::Network(_) | Error::Timeout(_));
    }

    #[tokio::test]
    async fn liveness_check_hits_health_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let adapter = HttpProviderAdapter::new(config(server.uri())).unwrap();
        assert!(adapter.test_connection().await.unwrap());
    }
}
