//! Prompt composition
//!
//! Combines the base scene-generation template with style guidance,
//! quality directives and optional caller context into the final prompt.
//! Compiled templates are cached per (style, quality, context) tuple and
//! carry a deterministic template id for analytics.

use dream_common::types::{DreamStyle, RequestComplexity, RequestQuality};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Rough chars-per-token budget used when truncating context
const CHARS_PER_TOKEN: usize = 4;

/// Chars reserved for the response inside the token budget
const RESPONSE_RESERVE_TOKENS: usize = 2048;

const BASE_TEMPLATE: &str = "You are a dream scene designer. Convert the dream description \
into one JSON object with the fields: id, title, style, environment {preset, fog, skyColor, \
ambientLight}, structures (up to 20 of {id, template, pos, scale, rotation?, features?}), \
entities (up to 10 of {id, type, count, params {speed, glow, size, color}}), cinematography \
{durationSec, shots (1-10 of {type, target?, duration, startPos?, endPos?})}, created, \
modified. Use only the documented enum values. Respond with JSON only, no prose, no \
markdown fences.";

/// A composed prompt plus its analytics metadata
#[derive(Debug, Clone, PartialEq)]
pub struct ComposedPrompt {
    pub prompt: String,
    pub template_id: String,
    pub variant: String,
}

#[derive(Debug)]
struct CompiledTemplate {
    prefix: String,
    template_id: String,
    variant: String,
}

type TemplateKey = (DreamStyle, RequestQuality, bool);

/// Template-caching prompt composer
#[derive(Default)]
pub struct PromptComposer {
    compiled: RwLock<HashMap<TemplateKey, Arc<CompiledTemplate>>>,
}

impl PromptComposer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compose the final prompt for one request.
    ///
    /// Deterministic: identical inputs produce the identical prompt and
    /// template id. Context is truncated to fit the provider's token
    /// budget.
    pub async fn compose(
        &self,
        text: &str,
        style: DreamStyle,
        quality: RequestQuality,
        complexity: RequestComplexity,
        context: Option<&str>,
        max_tokens: u32,
    ) -> ComposedPrompt {
        let template = self.compiled_template(style, quality, context.is_some()).await;

        let budget_chars = (max_tokens as usize)
            .saturating_sub(RESPONSE_RESERVE_TOKENS)
            .saturating_mul(CHARS_PER_TOKEN)
            .max(1024);

        let mut prompt = String::with_capacity(template.prefix.len() + text.len() + 256);
        prompt.push_str(&template.prefix);
        prompt.push_str("\n\nComplexity: ");
        prompt.push_str(complexity_directive(complexity));

        if let Some(context) = context {
            let used = prompt.len() + text.len() + 64;
            let room = budget_chars.saturating_sub(used);
            if room > 0 {
                let truncated = truncate_chars(context, room);
                if truncated.len() < context.len() {
                    debug!(
                        dropped = context.len() - truncated.len(),
                        "truncated prompt context to fit token budget"
                    );
                }
                prompt.push_str("\n\nContext:\n");
                prompt.push_str(&truncated);
            }
        }

        prompt.push_str("\n\nDream description:\n");
        prompt.push_str(text);

        ComposedPrompt {
            prompt,
            template_id: template.template_id.clone(),
            variant: template.variant.clone(),
        }
    }

    async fn compiled_template(
        &self,
        style: DreamStyle,
        quality: RequestQuality,
        has_context: bool,
    ) -> Arc<CompiledTemplate> {
        let key = (style, quality, has_context);
        if let Some(template) = self.compiled.read().await.get(&key) {
            return Arc::clone(template);
        }

        let mut prefix = String::from(BASE_TEMPLATE);
        prefix.push_str("\n\nStyle: ");
        prefix.push_str(style_guidance(style));
        prefix.push_str("\nQuality: ");
        prefix.push_str(quality_directive(quality));

        let mut hasher = Sha256::new();
        hasher.update(prefix.as_bytes());
        let digest = hasher.finalize();
        let template_id: String = digest.iter().take(8).map(|b| format!("{b:02x}")).collect();

        let template = Arc::new(CompiledTemplate {
            prefix,
            template_id,
            variant: format!("{style}-{quality}"),
        });
        self.compiled.write().await.insert(key, Arc::clone(&template));
        template
    }
}

fn style_guidance(style: DreamStyle) -> &'static str {
    match style {
        DreamStyle::Ethereal => {
            "soft luminous forms, pastel light, weightless drifting structures, gentle motion"
        }
        DreamStyle::Cyberpunk => {
            "neon-lit geometry, dark skies, holographic surfaces, dense vertical architecture"
        }
        DreamStyle::Surreal => {
            "impossible geometry, melting perspective, dreamlike scale shifts, unexpected juxtaposition"
        }
        DreamStyle::Fantasy => {
            "mythic architecture, enchanted light, floating castles, magical creatures"
        }
        DreamStyle::Nightmare => {
            "oppressive shadow, distorted forms, unsettling silhouettes, cold desaturated light"
        }
    }
}

fn quality_directive(quality: RequestQuality) -> &'static str {
    match quality {
        RequestQuality::Draft => "keep the scene minimal: a few structures, simple shots",
        RequestQuality::Medium => "a balanced scene with moderate detail",
        RequestQuality::High => "a detailed scene: varied structures, layered entities, deliberate shot pacing",
        RequestQuality::Cinematic => {
            "maximum visual richness: full structure variety, dense entities, choreographed multi-shot cinematography"
        }
    }
}

fn complexity_directive(complexity: RequestComplexity) -> &'static str {
    match complexity {
        RequestComplexity::Simple => "2-3 structures, 1-2 entity groups",
        RequestComplexity::Moderate => "4-8 structures, 2-4 entity groups",
        RequestComplexity::Complex => "8-15 structures, 4-8 entity groups",
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.len() <= max_chars {
        return text.to_string();
    }
    let mut cut = max_chars;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text[..cut].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn composition_is_deterministic() {
        let composer = PromptComposer::new();
        let a = composer
            .compose(
                "a spaceship",
                DreamStyle::Cyberpunk,
                RequestQuality::High,
                RequestComplexity::Moderate,
                None,
                8192,
            )
            .await;
        let b = composer
            .compose(
                "a spaceship",
                DreamStyle::Cyberpunk,
                RequestQuality::High,
                RequestComplexity::Moderate,
                None,
                8192,
            )
            .await;
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn prompt_contains_text_style_and_quality_directives() {
        let composer = PromptComposer::new();
        let composed = composer
            .compose(
                "a spaceship orbiting the earth",
                DreamStyle::Cyberpunk,
                RequestQuality::Cinematic,
                RequestComplexity::Complex,
                None,
                8192,
            )
            .await;
        assert!(composed.prompt.contains("a spaceship orbiting the earth"));
        assert!(composed.prompt.contains("neon-lit"));
        assert!(composed.prompt.contains("choreographed"));
        assert_eq!(composed.variant, "cyberpunk-cinematic");
    }

    #[tokio::test]
    async fn template_ids_differ_by_style_and_quality() {
        let composer = PromptComposer::new();
        let a = composer
            .compose("x", DreamStyle::Ethereal, RequestQuality::Draft, RequestComplexity::Simple, None, 8192)
            .await;
        let b = composer
            .compose("x", DreamStyle::Nightmare, RequestQuality::Draft, RequestComplexity::Simple, None, 8192)
            .await;
        let c = composer
            .compose("x", DreamStyle::Ethereal, RequestQuality::High, RequestComplexity::Simple, None, 8192)
            .await;
        assert_ne!(a.template_id, b.template_id);
        assert_ne!(a.template_id, c.template_id);
    }

    #[tokio::test]
    async fn oversized_context_is_truncated() {
        let composer = PromptComposer::new();
        let context = "c".repeat(100_000);
        let composed = composer
            .compose(
                "short dream",
                DreamStyle::Ethereal,
                RequestQuality::Medium,
                RequestComplexity::Simple,
                Some(&context),
                4096,
            )
            .await;
        assert!(composed.prompt.len() < 100_000);
        assert!(composed.prompt.contains("short dream"));
    }

    #[tokio::test]
    async fn compiled_templates_are_cached() {
        let composer = PromptComposer::new();
        let _ = composer
            .compose("x", DreamStyle::Ethereal, RequestQuality::Draft, RequestComplexity::Simple, None, 8192)
            .await;
        assert_eq!(composer.compiled.read().await.len(), 1);
        let _ = composer
            .compose("y", DreamStyle::Ethereal, RequestQuality::Draft, RequestComplexity::Simple, None, 8192)
            .await;
        assert_eq!(composer.compiled.read().await.len(), 1);
    }
}
