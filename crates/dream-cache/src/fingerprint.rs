//! Request fingerprinting
//!
//! A fingerprint identifies a generate request for caching and
//! single-flight. It is stable across whitespace differences, prose
//! casing and option ordering.

use dream_common::types::{DreamStyle, GenerateOptions};
use sha2::{Digest, Sha256};
use std::fmt;

/// Stable hash identifying one generate request
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Compute the fingerprint for a request
    pub fn compute(text: &str, style: DreamStyle, options: &GenerateOptions) -> Self {
        let normalized = normalize_text(text);
        // Fixed field order makes the hash independent of caller option order
        let canonical = format!(
            "text={normalized}|style={style}|quality={}|complexity={:?}|duration={}|seed={}|hint={}",
            options.quality,
            options.complexity,
            options
                .duration
                .map(|d| format!("{d:.1}"))
                .unwrap_or_else(|| "none".to_string()),
            options
                .seed
                .map(|s| s.to_string())
                .unwrap_or_else(|| "none".to_string()),
            options.provider_hint.as_deref().unwrap_or("none"),
        );

        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let digest = hasher.finalize();
        let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        Fingerprint(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Derive a deterministic u64 seed from the fingerprint
    pub fn seed(&self) -> u64 {
        let mut seed = 0u64;
        for (i, byte) in self.0.as_bytes().iter().take(8).enumerate() {
            seed |= (*byte as u64) << (i * 8);
        }
        seed
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Collapse whitespace runs and lowercase the prose
fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
