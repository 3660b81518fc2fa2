//! Configuration loading for the scanflow orchestrator.
//!
//! Layers a TOML file, an optional `.env` file and `SCANFLOW_*` environment
//! overrides on top of [`OrchestratorConfig`](scanflow_core::orchestration::OrchestratorConfig)
//! defaults, then runs guard rails that either warn or refuse to start.

/// Source resolution and layering
pub mod loader;
/// Raw file and environment inputs
pub mod sources;
/// Guard rails and warnings
pub mod validation;

pub use loader::{
    ConfigLoad, ConfigLoadError, ConfigLoader, ConfigLoaderOptions, ConfigMetadata, ScanflowConfig,
};
pub use sources::{EnvConfig, FileConfig, FileLoggingConfig};
pub use validation::{ConfigGuardRailError, ConfigWarning, ConfigWarnings, apply_guard_rails};
