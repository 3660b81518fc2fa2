//! Identifier newtypes shared across the orchestrator.

pub mod ids;

pub use ids::*;
