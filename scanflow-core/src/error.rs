use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::orchestration::resources::ResourceType;
use crate::orchestration::stage::StageType;

#[derive(Error, Debug)]
pub enum OrchestrationError {
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("Orchestration not found: {0}")]
    NotFound(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Stage '{stage}' failed: {message}")]
    StageExecution { stage: String, message: String },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Collaborator unavailable: {0}")]
    Collaborator(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl OrchestrationError {
    pub fn is_validation(&self) -> bool {
        matches!(self, OrchestrationError::Validation(_))
    }
}

/// Reasons a request is refused before it touches any shared state.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationError {
    #[error("scope {scope} requires a target identifier")]
    MissingTarget { scope: String },

    #[error("request declares no stages")]
    EmptyPlan,

    #[error("duplicate stage id '{0}'")]
    DuplicateStage(String),

    #[error("malformed dependency edge '{0}' (expected \"A->B\")")]
    MalformedEdge(String),

    #[error("dependency references unknown stage '{0}'")]
    UnknownStage(String),

    #[error("circular dependency between stages: {}", .cycle.join(" -> "))]
    CircularDependency { cycle: Vec<String> },

    #[error("no handler registered for stage type {0}")]
    MissingHandler(StageType),

    #[error("unknown data source '{0}'")]
    UnknownDataSource(String),

    #[error("unknown rule ids: {}", .0.join(", "))]
    InvalidRules(Vec<String>),

    #[error("validation lookup failed: {0}")]
    LookupFailed(String),

    #[error("requested {requested} {resource} exceeds total capacity {capacity}")]
    ExceedsCapacity {
        resource: ResourceType,
        requested: u64,
        capacity: u64,
    },

    #[error("unknown prerequisite orchestration '{0}'")]
    UnknownPrerequisite(String),

    #[error("circular prerequisite chain through orchestration '{0}'")]
    PrerequisiteCycle(String),

    #[error("deadline already passed")]
    DeadlineInPast,

    #[error("rate limit exceeded for requester '{0}'")]
    RateLimited(String),

    #[error("pending queue is full ({0} entries)")]
    QueueFull(usize),

    #[error("orchestration id '{0}' is already in use")]
    DuplicateOrchestration(String),
}

pub type Result<T> = std::result::Result<T, OrchestrationError>;
