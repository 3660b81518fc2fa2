//! # Scanflow Core
//!
//! Scan orchestration engine: admits scan requests against bounded resource
//! pools, plans their stages as a dependency graph, runs the stages with
//! retries and timeouts, and keeps a background watch over health,
//! utilization and the pending queue.
//!
//! ## Architecture
//!
//! - [`orchestration::resources`]: capacity accounting with all-or-nothing reservations
//! - [`orchestration::planner`]: dependency graph, cycle detection and critical path
//! - [`orchestration::admission`]: validation, priority queue and concurrency limits
//! - [`orchestration::executor`]: ready-set stage scheduling for one orchestration
//! - [`orchestration::monitor`]: utilization history and optimization recommendations
//! - [`orchestration::runtime`]: the coordinator tying these together
//!
//! ## Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use scanflow_core::orchestration::{
//!     OrchestrationRequest, OrchestratorConfig, OrchestratorRuntime, StageDefinition,
//!     StageHandlerRegistry, StageType,
//! };
//! # use scanflow_core::orchestration::StageHandler;
//!
//! async fn run(handler: Arc<dyn StageHandler>) -> scanflow_core::error::Result<()> {
//!     let runtime = OrchestratorRuntime::builder(OrchestratorConfig::default())
//!         .with_handlers(StageHandlerRegistry::new().with_handler(handler))
//!         .build()?;
//!     runtime.start().await?;
//!
//!     let request = OrchestrationRequest::new("nightly")
//!         .with_stage(StageDefinition::new("scan", StageType::DataSourceScan));
//!     let submitted = runtime.submit(request).await?;
//!     let status = runtime.get_status(submitted.orchestration_id()).await?;
//!     println!("{} is {}", status.name, status.status);
//!
//!     runtime.shutdown().await
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(missing_docs)]

/// Error types for orchestration and request validation
pub mod error;

/// Admission, planning, execution and monitoring of scan orchestrations
pub mod orchestration;

/// Identifier newtypes
pub mod types;

pub use error::{OrchestrationError, Result, ValidationError};
pub use orchestration::{
    CancelMode, CancelOutcome, CancelResult, ListFilter, OptimizationReport, OptimizationScope,
    OrchestrationRequest, OrchestrationStatus, OrchestratorConfig, OrchestratorRuntime,
    StatusView, SubmitResult,
};
