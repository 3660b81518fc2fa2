//! Single-process runtime for the orchestrator: the coordinator that owns the
//! live registry and background loops, plus the in-process event bus.

mod event_bus;
mod supervisor;

pub use event_bus::*;
pub use supervisor::*;
