//! Core types and error definitions for the Warden orchestration engine.
//!
//! This crate provides the foundational types shared across all Warden crates:
//! the error taxonomy, the tagged execution outcome, analysis findings, the
//! per-run execution context, and the language-generation capability.
//!
//! # Main types
//!
//! - [`WardenError`] — Unified error enum for all Warden subsystems.
//! - [`WardenResult`] — Convenience alias for `Result<T, WardenError>`.
//! - [`Outcome`] — Success / Retryable / Fatal result of an execution.
//! - [`Finding`] — A structured analysis result produced by an agent.
//! - [`ExecutionContext`] — Shared input for one run.
//! - [`GenerationBackend`] — Capability to call a language-generation provider.

/// Per-run execution context.
pub mod context;
/// Error taxonomy.
pub mod error;
/// Findings and the model-output parser.
pub mod finding;
/// Language-generation capability.
pub mod generation;
/// Tagged execution outcome.
pub mod outcome;

pub use context::ExecutionContext;
pub use error::{WardenError, WardenResult};
pub use finding::{parse_findings, Finding, FindingCategory, RiskLevel};
pub use generation::{Generation, GenerationBackend, GenerationRequest};
pub use outcome::Outcome;
