//! # sieve-core
//!
//! Rule model and pure helpers for sieve page-content classification.
//!
//! This crate is synchronous and side-effect free. It knows how to:
//! - Parse the rule DSL into typed [`Rule`] values
//! - Validate and match the domain patterns a rule is scoped to
//! - Compute cosine similarity between embedding vectors
//!
//! Everything that talks to a language model lives in `sieve-runtime`.
//!
//! ## Example
//!
//! ```rust
//! use sieve_core::{parse, RuleKind};
//!
//! let rule = parse("example.org#?#div.card:contains-meaning-prompt('is a sponsored post')")?;
//! assert_eq!(rule.kind(), RuleKind::Prompt);
//! assert_eq!(rule.selector, "div.card");
//! assert!(rule.applies_to("https://www.example.org/feed"));
//! # Ok::<(), sieve_core::RuleError>(())
//! ```

pub mod rule;
pub mod similarity;

pub use rule::{
    domain::{domain_matches, validate_domain},
    parse, validate, Condition, Rule, RuleError, RuleKind, RuleSet,
};
pub use similarity::cosine_similarity;
