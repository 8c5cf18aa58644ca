//! Scriptable adapter for exercising the manager without a network
//!
//! Used by this crate's tests and by downstream integration suites to
//! script provider behavior step by step.

use crate::adapter::{Capabilities, GenerateParams, ProviderAdapter};
use async_trait::async_trait;
use dream_common::{Error, Result};
use dream_parse::RawResponse;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// One scripted provider behavior
#[derive(Debug, Clone)]
pub enum Step {
    /// Return this body verbatim
    Content(String),
    /// Wrap the body in a chat-completions response
    Chat(String),
    /// Sleep, then return the body as a chat response
    Slow(Duration, String),
    /// Fail with a typed error
    Fail(FailKind),
}

#[derive(Debug, Clone)]
pub enum FailKind {
    Status(u16),
    Timeout,
    Network,
    RateLimit(Option<u64>),
    Auth,
}

impl FailKind {
    fn into_error(self) -> Error {
        match self {
            FailKind::Status(status) => Error::Provider {
                status,
                message: format!("scripted status {status}"),
            },
            FailKind::Timeout => Error::Timeout("scripted timeout".to_string()),
            FailKind::Network => Error::Network("scripted connection failed".to_string()),
            FailKind::RateLimit(retry_after_secs) => Error::RateLimit {
                message: "scripted rate limit".to_string(),
                retry_after_secs,
            },
            FailKind::Auth => Error::Authentication("scripted invalid api key".to_string()),
        }
    }
}

fn chat_response(body: &str) -> RawResponse {
    RawResponse::from_value(serde_json::json!({
        "choices": [{"message": {"content": body}}]
    }))
}

/// Adapter that plays back a queue of scripted steps
pub struct ScriptedAdapter {
    steps: Mutex<VecDeque<Step>>,
    repeat: Option<Step>,
    calls: AtomicU32,
    alive: bool,
}

impl ScriptedAdapter {
    /// Play the steps once; further calls fail with an exhausted-script error
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            repeat: None,
            calls: AtomicU32::new(0),
            alive: true,
        }
    }

    /// Play the same step on every call
    pub fn repeating(step: Step) -> Self {
        Self {
            steps: Mutex::new(VecDeque::new()),
            repeat: Some(step),
            calls: AtomicU32::new(0),
            alive: true,
        }
    }

    /// Report the adapter as down from `test_connection`
    pub fn offline(mut self) -> Self {
        self.alive = false;
        self
    }

    /// Number of generate calls received
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    async fn generate(&self, _prompt: &str, _params: &GenerateParams) -> Result<RawResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self
            .steps
            .lock()
            .pop_front()
            .or_else(|| self.repeat.clone());

        match step {
            Some(Step::Content(body)) => Ok(RawResponse::from_text(body)),
            Some(Step::Chat(body)) => Ok(chat_response(&body)),
            Some(Step::Slow(delay, body)) => {
                tokio::time::sleep(delay).await;
                Ok(chat_response(&body))
            }
            Some(Step::Fail(kind)) => Err(kind.into_error()),
            None => Err(Error::Unknown("script exhausted".to_string())),
        }
    }

    async fn test_connection(&self) -> Result<bool> {
        Ok(self.alive)
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }
}
