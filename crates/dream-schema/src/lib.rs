//! Schema validation and repair for dream artifacts
//!
//! The validator enforces the full artifact schema and reports every
//! violation; the repair pipeline drives a validate→repair→revalidate loop
//! until the artifact is valid or regeneration is required.

pub mod repair;
pub mod validator;

pub use repair::{RepairContext, RepairPipeline, RepairResult, RepairVerdict};
pub use validator::{validate_artifact, validate_value, ValidationError, ValidationReport};
