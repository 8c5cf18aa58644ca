//! Content extraction from heterogeneous provider responses
//!
//! Provider responses are normalized into a tagged `RawResponse` at the
//! adapter boundary; the extractor pattern-matches exhaustively and never
//! walks arbitrary object graphs. Extraction never panics, whatever the
//! payload.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Chat-style message body
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub content: String,
}

/// One chat-style completion choice
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatChoice {
    pub message: ChatMessage,
}

/// One legacy completion choice
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LegacyChoice {
    pub text: String,
}

/// Tagged provider response shapes, in extraction priority order
#[derive(Debug, Clone, PartialEq)]
pub enum RawResponse {
    /// `{"choices":[{"message":{"content":"…"}}]}`
    Chat(Vec<ChatChoice>),
    /// `{"choices":[{"text":"…"}]}`
    Legacy(Vec<LegacyChoice>),
    /// `{"content":"…"}` (streaming collapsed)
    Plain(String),
    /// Structured payload not matching a known shape
    Json(Value),
    /// Direct string body
    Raw(String),
}

impl RawResponse {
    /// Classify a response body. JSON bodies become one of the structured
    /// variants; everything else stays raw text.
    pub fn from_text(body: impl Into<String>) -> Self {
        let body = body.into();
        match serde_json::from_str::<Value>(&body) {
            Ok(value) => Self::from_value(value),
            Err(_) => RawResponse::Raw(body),
        }
    }

    /// Classify an already-parsed JSON payload
    pub fn from_value(value: Value) -> Self {
        if let Value::String(s) = value {
            return RawResponse::Raw(s);
        }

        if let Some(choices) = value.get("choices").and_then(Value::as_array) {
            let chat: Vec<ChatChoice> = choices
                .iter()
                .filter_map(|c| {
                    c.get("message")
                        .and_then(|m| m.get("content"))
                        .and_then(Value::as_str)
                        .map(|content| ChatChoice {
                            message: ChatMessage {
                                content: content.to_string(),
                            },
                        })
                })
                .collect();
            if !chat.is_empty() {
                return RawResponse::Chat(chat);
            }

            let legacy: Vec<LegacyChoice> = choices
                .iter()
                .filter_map(|c| {
                    c.get("text").and_then(Value::as_str).map(|text| LegacyChoice {
                        text: text.to_string(),
                    })
                })
                .collect();
            if !legacy.is_empty() {
                return RawResponse::Legacy(legacy);
            }
        }

        if let Some(content) = value.get("content").and_then(Value::as_str) {
            return RawResponse::Plain(content.to_string());
        }

        RawResponse::Json(value)
    }
}

type ShapeAdapter = Arc<dyn Fn(&Value) -> Option<String> + Send + Sync>;

/// Extractor with optional per-provider shape adapters
#[derive(Default, Clone)]
pub struct ResponseExtractor {
    adapters: HashMap<String, ShapeAdapter>,
}

impl ResponseExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a custom shape adapter for a provider
    pub fn register_shape<F>(&mut self, provider: impl Into<String>, adapter: F)
    where
        F: Fn(&Value) -> Option<String> + Send + Sync + 'static,
    {
        self.adapters.insert(provider.into(), Arc::new(adapter));
    }

    /// Extract text content from a provider response.
    ///
    /// Returns `None` when no content is present. Never panics.
    pub fn extract(&self, response: &RawResponse, provider: &str) -> Option<String> {
        match response {
            RawResponse::Raw(s) => Some(s.clone()),
            RawResponse::Chat(choices) => {
                choices.first().map(|c| c.message.content.clone())
            }
            RawResponse::Legacy(choices) => choices.first().map(|c| c.text.clone()),
            RawResponse::Plain(content) => Some(content.clone()),
            RawResponse::Json(value) => self.extract_unrecognized(value, provider),
        }
    }

    /// Last-resort extraction for shapes no variant claimed: a registered
    /// provider adapter, then the known field paths. No recursive descent.
    fn extract_unrecognized(&self, value: &Value, provider: &str) -> Option<String> {
        if let Some(adapter) = self.adapters.get(provider) {
            if let Some(content) = adapter(value) {
                return Some(content);
            }
        }

        let by_path = value
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|cs| cs.first())
            .and_then(|c| {
                c.get("message")
                    .and_then(|m| m.get("content"))
                    .or_else(|| c.get("text"))
            })
            .and_then(Value::as_str)
            .or_else(|| value.get("content").and_then(Value::as_str));

        if by_path.is_none() {
            debug!(provider, "no content found in unrecognized response shape");
        }
        by_path.map(|s| s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn extractor() -> ResponseExtractor {
        ResponseExtractor::new()
    }

    #[test]
    fn direct_string_passes_through() {
        let response = RawResponse::from_text("plain body");
        assert_eq!(
            extractor().extract(&response, "alpha"),
            Some("plain body".to_string())
        );
    }

    #[test]
    fn json_string_body_is_raw() {
        let response = RawResponse::from_text("\"quoted body\"");
        assert_eq!(
            extractor().extract(&response, "alpha"),
            Some("quoted body".to_string())
        );
    }

    #[test]
    fn chat_shape_takes_first_choice() {
        let body = json!({
            "choices": [
                {"message": {"content": "first"}},
                {"message": {"content": "second"}}
            ]
        });
        let response = RawResponse::from_value(body);
        assert!(matches!(response, RawResponse::Chat(_)));
        assert_eq!(extractor().extract(&response, "alpha"), Some("first".to_string()));
    }

    #[test]
    fn legacy_shape_reads_text_field() {
        let body = json!({"choices": [{"text": "legacy content"}]});
        let response = RawResponse::from_value(body);
        assert!(matches!(response, RawResponse::Legacy(_)));
        assert_eq!(
            extractor().extract(&response, "alpha"),
            Some("legacy content".to_string())
        );
    }

    #[test]
    fn plain_content_field_is_supported() {
        let body = json!({"content": "collapsed stream"});
        let response = RawResponse::from_value(body);
        assert_eq!(
            extractor().extract(&response, "alpha"),
            Some("collapsed stream".to_string())
        );
    }

    #[test]
    fn chat_wins_over_plain_when_both_present() {
        let body = json!({
            "choices": [{"message": {"content": "from chat"}}],
            "content": "from plain"
        });
        let response = RawResponse::from_value(body);
        assert_eq!(
            extractor().extract(&response, "alpha"),
            Some("from chat".to_string())
        );
    }

    #[test]
    fn unknown_shape_without_adapter_yields_none() {
        let body = json!({"data": {"result": "hidden"}});
        let response = RawResponse::from_value(body);
        assert_eq!(extractor().extract(&response, "alpha"), None);
    }

    #[test]
    fn registered_adapter_handles_custom_shape() {
        let mut extractor = ResponseExtractor::new();
        extractor.register_shape("custom", |value| {
            value
                .get("data")
                .and_then(|d| d.get("result"))
                .and_then(serde_json::Value::as_str)
                .map(|s| s.to_string())
        });

        let response = RawResponse::from_value(json!({"data": {"result": "found"}}));
        assert_eq!(extractor.extract(&response, "custom"), Some("found".to_string()));
        assert_eq!(extractor.extract(&response, "other"), None);
    }

    #[test]
    fn null_and_malformed_values_do_not_panic() {
        for body in [
            json!(null),
            json!({"choices": null}),
            json!({"choices": []}),
            json!({"choices": [{"message": null}]}),
            json!({"choices": [{"message": {"content": 42}}]}),
            json!({"content": {"nested": true}}),
            json!([1, 2, 3]),
        ] {
            let response = RawResponse::from_value(body);
            let _ = extractor().extract(&response, "alpha");
        }
    }

    #[test]
    fn large_payload_extracts_in_one_pass() {
        let big = "x".repeat(64 * 1024);
        let body = json!({"choices": [{"message": {"content": big}}]});
        let response = RawResponse::from_value(body);
        let content = extractor().extract(&response, "alpha").unwrap();
        assert_eq!(content.len(), 64 * 1024);
    }

    #[test]
    fn non_json_garbage_is_preserved_raw() {
        let response = RawResponse::from_text("<<<not json>>>");
        assert_eq!(
            extractor().extract(&response, "alpha"),
            Some("<<<not json>>>".to_string())
        );
    }
}
