//! Output safety for the Warden orchestration engine.
//!
//! Provides credential redaction, near-duplicate detection, and the
//! strictness-graded validator applied to every agent input and output.
//!
//! # Main types
//!
//! - [`Sanitizer`] — Control-character stripping and idempotent secret redaction.
//! - [`Validator`] — Structural, quality, duplicate and safety checks.
//! - [`Strictness`] — MINIMAL / STANDARD / STRICT / PARANOID check levels.
//! - [`ValidationReport`] — Errors, warnings and counters from one pass.

/// Input sanitization and secret redaction.
pub mod sanitizer;
/// Ratcliff/Obershelp text similarity.
pub mod similarity;
/// Strictness-graded validation of inputs, findings and result documents.
pub mod validator;

pub use sanitizer::{SanitizeResult, Sanitizer, REDACTED};
pub use similarity::similarity_ratio;
pub use validator::{
    CheckKind, FindingValidation, Strictness, ValidationIssue, ValidationReport, ValidationRules,
    Validator,
};
