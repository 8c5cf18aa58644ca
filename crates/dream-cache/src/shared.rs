//! Optional shared cache tier
//!
//! A second cache layer shared between gateway instances, keyed by the
//! same fingerprints. Strictly best-effort: every failure degrades to the
//! in-process tier and never blocks or fails the request path.

use crate::fingerprint::Fingerprint;
use async_trait::async_trait;
use dream_common::types::DreamArtifact;
use std::time::Duration;
use tracing::{debug, warn};

/// Narrow contract for a shared cache backend
#[async_trait]
pub trait SharedCache: Send + Sync {
    /// Fetch an artifact; `None` on miss or backend failure
    async fn get(&self, fingerprint: &Fingerprint) -> Option<DreamArtifact>;

    /// Store an artifact; returns false on backend failure
    async fn put(&self, fingerprint: &Fingerprint, artifact: &DreamArtifact, ttl: Duration) -> bool;

    /// Remove one entry; best-effort
    async fn invalidate(&self, fingerprint: &Fingerprint);
}

/// HTTP-backed shared cache client
pub struct HttpSharedCache {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSharedCache {
    pub fn new(base_url: impl Into<String>) -> dream_common::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(2_000))
            .user_agent("dreamscape-gateway/0.1")
            .build()
            .map_err(|e| {
                dream_common::Error::Configuration(format!("shared cache client: {e}"))
            })?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self { client, base_url })
    }

    fn entry_url(&self, fingerprint: &Fingerprint) -> String {
        format!("{}/cache/{}", self.base_url, fingerprint)
    }
}

#[async_trait]
impl SharedCache for HttpSharedCache {
    async fn get(&self, fingerprint: &Fingerprint) -> Option<DreamArtifact> {
        let response = match self.client.get(self.entry_url(fingerprint)).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!("shared cache get failed: {e}");
                return None;
            }
        };

        if !response.status().is_success() {
            debug!(%fingerprint, status = %response.status(), "shared cache miss");
            return None;
        }

        match response.json::<DreamArtifact>().await {
            Ok(artifact) => Some(artifact),
            Err(e) => {
                warn!("shared cache returned an unparseable artifact: {e}");
                None
            }
        }
    }

    async fn put(&self, fingerprint: &Fingerprint, artifact: &DreamArtifact, ttl: Duration) -> bool {
        let result = self
            .client
            .put(self.entry_url(fingerprint))
            .query(&[("ttl_ms", ttl.as_millis().to_string())])
            .json(artifact)
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                warn!(status = %response.status(), "shared cache put rejected");
                false
            }
            Err(e) => {
                warn!("shared cache put failed: {e}");
                false
            }
        }
    }

    async fn invalidate(&self, fingerprint: &Fingerprint) {
        if let Err(e) = self.client.delete(self.entry_url(fingerprint)).send().await {
            warn!("shared cache invalidate failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use dream_common::types::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn artifact() -> DreamArtifact {
        DreamArtifact {
            id: "shared-1".to_string(),
            title: "shared dream".to_string(),
            style: DreamStyle::Ethereal,
            seed: None,
            environment: Environment::default(),
            structures: vec![],
            entities: vec![],
            cinematography: Cinematography {
                duration_sec: 30.0,
                shots: vec![Shot {
                    shot_type: ShotType::Orbital,
                    target: None,
                    duration: 30.0,
                    start_pos: None,
                    end_pos: None,
                }],
            },
            render: None,
            assumptions: None,
            metadata: ArtifactMetadata::new(ArtifactSource::Ai),
            created: Utc::now(),
            modified: Utc::now(),
        }
    }

    fn fingerprint() -> Fingerprint {
        Fingerprint::compute("shared dream", DreamStyle::Ethereal, &GenerateOptions::default())
    }

    #[tokio::test]
    async fn get_parses_a_cached_artifact() {
        let server = MockServer::start().await;
        let fp = fingerprint();
        Mock::given(method("GET"))
            .and(path(format!("/cache/{fp}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(artifact()))
            .mount(&server)
            .await;

        let shared = HttpSharedCache::new(server.uri()).unwrap();
        let fetched = shared.get(&fp).await.expect("artifact");
        assert_eq!(fetched.id, "shared-1");
    }

    #[tokio::test]
    async fn get_miss_returns_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let shared = HttpSharedCache::new(server.uri()).unwrap();
        assert!(shared.get(&fingerprint()).await.is_none());
    }

    #[tokio::test]
    async fn put_reports_success() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let shared = HttpSharedCache::new(server.uri()).unwrap();
        assert!(shared.put(&fingerprint(), &artifact(), Duration::from_secs(60)).await);
    }

    #[tokio::test]
    async fn backend_failure_degrades_to_miss() {
        // Nothing listening on this port
        let shared = HttpSharedCache::new("http://127.0.0.1:1").unwrap();
        assert!(shared.get(&fingerprint()).await.is_none());
        assert!(!shared.put(&fingerprint(), &artifact(), Duration::from_secs(60)).await);
    }
}
