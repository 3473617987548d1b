//! Question answering over semi-structured data by program synthesis.
//!
//! This crate drives a bounded generate/validate/execute/repair loop: a
//! collaborator proposes a small query-script program for a natural-language
//! question, the program is statically validated against an allow-list,
//! executed in a deterministic resource-limited sandbox, and repaired from
//! structured feedback when it fails. The architecture enforces a strict
//! separation:
//!
//! - **[`lang`], [`validate`], [`sandbox`]**: Pure, deterministic logic
//!   (parsing, static checks, interpretation). No I/O, fully testable in
//!   isolation.
//! - **[`synthesis`]**: The collaborator seam. Production wiring and
//!   scripted test doubles implement the same traits.
//!
//! [`looping`] coordinates the two to implement one session per question,
//! with [`session`] holding the attempt trace and its invariants.

pub mod config;
pub mod lang;
pub mod logging;
pub mod looping;
pub mod prompt;
pub mod sandbox;
pub mod session;
pub mod synthesis;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod validate;
