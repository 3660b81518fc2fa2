//! Host-side pieces of `scanflowd`: plan files and simulated stage handlers.

pub mod demo;
pub mod plan;
