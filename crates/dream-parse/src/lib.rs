//! Response extraction and JSON repair for the Dreamscape Gateway
//!
//! Upstream providers disagree about response shapes and frequently return
//! partially malformed JSON. This crate normalizes both problems: the
//! extractor maps any provider response onto a raw string, and the repair
//! module turns near-JSON into parseable JSON without inventing content.

pub mod extract;
pub mod json_repair;

pub use extract::{ChatChoice, ChatMessage, LegacyChoice, RawResponse, ResponseExtractor};
pub use json_repair::{repair_json, RepairOutcome};
