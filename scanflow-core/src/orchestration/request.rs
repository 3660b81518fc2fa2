use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::resources::ResourceRequirements;
use super::stage::StageDefinition;
use crate::types::ids::OrchestrationId;

/// Priority bands; `Critical` is served first.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Medium,
    Low,
    Background,
}

impl Priority {
    /// Lower rank is served first.
    pub fn rank(self) -> u8 {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Medium => 2,
            Priority::Low => 3,
            Priority::Background => 4,
        }
    }

    pub fn from_rank(rank: u8) -> Self {
        match rank {
            0 => Priority::Critical,
            1 => Priority::High,
            2 => Priority::Medium,
            3 => Priority::Low,
            _ => Priority::Background,
        }
    }

    /// One band up; `Critical` stays put.
    pub fn promoted(self) -> Self {
        Self::from_rank(self.rank().saturating_sub(1))
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Critical => write!(f, "critical"),
            Priority::High => write!(f, "high"),
            Priority::Medium => write!(f, "medium"),
            Priority::Low => write!(f, "low"),
            Priority::Background => write!(f, "background"),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeKind {
    #[default]
    SystemWide,
    GroupLevel,
    SourceSpecific,
    Custom,
}

impl fmt::Display for ScopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeKind::SystemWide => write!(f, "system_wide"),
            ScopeKind::GroupLevel => write!(f, "group_level"),
            ScopeKind::SourceSpecific => write!(f, "source_specific"),
            ScopeKind::Custom => write!(f, "custom"),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Sequential,
    Parallel,
}

/// A request to run one or more scan stages. Treated as immutable once the
/// coordinator accepts it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationRequest {
    #[serde(default)]
    pub id: OrchestrationId,
    pub name: String,
    pub stages: Vec<StageDefinition>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub scope: ScopeKind,
    /// Group / source / custom target; required unless the scope is system wide.
    #[serde(default)]
    pub target_id: Option<String>,
    #[serde(default)]
    pub data_source_ids: Vec<String>,
    #[serde(default)]
    pub rule_ids: Vec<String>,
    /// Extra stage edges in `"A->B"` form (A runs before B).
    #[serde(default)]
    pub dependency_edges: Vec<String>,
    /// Orchestrations that must be terminal before this one is admitted.
    #[serde(default)]
    pub prerequisites: Vec<OrchestrationId>,
    /// Skip cross-orchestration prerequisite gating.
    #[serde(default)]
    pub override_dependencies: bool,
    #[serde(default)]
    pub resource_hints: ResourceRequirements,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    #[serde(default)]
    pub max_parallel_stages: Option<usize>,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub max_duration_secs: Option<u64>,
    #[serde(default)]
    pub requested_by: Option<String>,
    #[serde(default)]
    pub correlation_id: Option<Uuid>,
}

impl OrchestrationRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: OrchestrationId::new(),
            name: name.into(),
            stages: Vec::new(),
            priority: Priority::default(),
            scope: ScopeKind::default(),
            target_id: None,
            data_source_ids: Vec::new(),
            rule_ids: Vec::new(),
            dependency_edges: Vec::new(),
            prerequisites: Vec::new(),
            override_dependencies: false,
            resource_hints: ResourceRequirements::new(),
            execution_mode: ExecutionMode::default(),
            max_parallel_stages: None,
            deadline: None,
            max_duration_secs: None,
            requested_by: None,
            correlation_id: None,
        }
    }

    pub fn with_stage(mut self, stage: StageDefinition) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_scope(mut self, scope: ScopeKind, target_id: Option<String>) -> Self {
        self.scope = scope;
        self.target_id = target_id;
        self
    }

    pub fn with_edge(mut self, edge: impl Into<String>) -> Self {
        self.dependency_edges.push(edge.into());
        self
    }

    pub fn with_data_source(mut self, id: impl Into<String>) -> Self {
        self.data_source_ids.push(id.into());
        self
    }

    pub fn with_rule(mut self, id: impl Into<String>) -> Self {
        self.rule_ids.push(id.into());
        self
    }

    pub fn with_prerequisite(mut self, id: OrchestrationId) -> Self {
        self.prerequisites.push(id);
        self
    }

    pub fn with_resources(mut self, hints: ResourceRequirements) -> Self {
        self.resource_hints = hints;
        self
    }

    pub fn with_execution_mode(mut self, mode: ExecutionMode) -> Self {
        self.execution_mode = mode;
        self
    }

    pub fn with_max_duration(mut self, secs: u64) -> Self {
        self.max_duration_secs = Some(secs);
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn requested_by(mut self, requester: impl Into<String>) -> Self {
        self.requested_by = Some(requester.into());
        self
    }

    pub fn max_duration(&self) -> Option<Duration> {
        self.max_duration_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn promotion_stops_at_critical() {
        assert_eq!(Priority::Background.promoted(), Priority::Low);
        assert_eq!(Priority::High.promoted(), Priority::Critical);
        assert_eq!(Priority::Critical.promoted(), Priority::Critical);
    }

    #[test]
    fn request_deserializes_with_defaults() {
        let raw = r#"{
            "name": "nightly",
            "stages": [{"id": "scan", "stage_type": "data_source_scan"}],
            "resource_hints": {"cpu": 20}
        }"#;
        let request: OrchestrationRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(request.priority, Priority::Medium);
        assert_eq!(request.scope, ScopeKind::SystemWide);
        assert_eq!(request.execution_mode, ExecutionMode::Sequential);
        assert_eq!(
            request
                .resource_hints
                .get(super::super::resources::ResourceType::Cpu),
            20
        );
        assert!(!request.stages[0].critical);
    }
}
