//! Scan orchestration: admission control over shared resource pools,
//! dependency planning, stage execution and background monitoring.
//!
//! [`runtime::OrchestratorRuntime`] is the entry point; the remaining modules
//! hold the pieces it wires together.

pub mod admission;
pub mod collaborators;
pub mod config;
pub mod dispatcher;
pub mod events;
pub mod executor;
pub mod master;
pub mod monitor;
pub mod persistence;
pub mod planner;
pub mod queue;
pub mod request;
pub mod resources;
pub mod runtime;
pub mod stage;
pub mod status;

pub use admission::*;
pub use collaborators::*;
pub use config::*;
pub use dispatcher::*;
pub use events::*;
pub use executor::*;
pub use master::*;
pub use monitor::*;
pub use persistence::*;
pub use planner::*;
pub use queue::*;
pub use request::*;
pub use resources::*;
pub use runtime::*;
pub use stage::*;
pub use status::*;
