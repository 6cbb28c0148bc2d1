//! Domain layer types and invariants.

pub mod error;
pub mod request;
pub mod rewrite;
pub mod types;
