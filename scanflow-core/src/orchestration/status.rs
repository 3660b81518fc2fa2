//! Result types returned by the coordinator's public operations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::master::{OrchestrationMaster, OrchestrationStatus};
use super::queue::{PendingQueueEntry, WaitReason};
use super::request::{Priority, ScopeKind};
use super::resources::ResourceRequirements;
use super::stage::StageExecution;
use crate::error::ValidationError;
use crate::types::ids::{OrchestrationId, SessionId};

/// Snapshot of one orchestration as seen by callers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatusView {
    pub orchestration_id: OrchestrationId,
    pub name: String,
    pub status: OrchestrationStatus,
    pub priority: Priority,
    pub scope: ScopeKind,
    pub requested_by: Option<String>,
    /// 0.0..=1.0
    pub progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub waiting_on: Option<WaitReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    /// Held while active; the released footprint once terminal.
    pub resources: ResourceRequirements,
    pub stages_total: usize,
    pub stages_completed: usize,
    pub stages_failed: usize,
    pub stages_skipped: usize,
    pub success_rate: Option<f64>,
    pub stages: Vec<StageExecution>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub estimated_completion: Option<DateTime<Utc>>,
    pub terminal_reason: Option<String>,
}

impl StatusView {
    pub fn from_master(master: &OrchestrationMaster) -> Self {
        Self {
            orchestration_id: master.id,
            name: master.name.clone(),
            status: master.status,
            priority: master.priority,
            scope: master.scope,
            requested_by: master.requested_by.clone(),
            progress: master.completion_percentage / 100.0,
            queue_position: None,
            waiting_on: None,
            session_id: Some(master.session_id),
            resources: master.resources.clone(),
            stages_total: master.stages_total,
            stages_completed: master.stages_completed,
            stages_failed: master.stages_failed,
            stages_skipped: master.stages_skipped,
            success_rate: master.success_rate.or_else(|| master.compute_success_rate()),
            stages: master.stages.clone(),
            errors: master.errors.clone(),
            warnings: master.warnings.clone(),
            submitted_at: master.submitted_at,
            started_at: master.actual_start,
            completed_at: master.completed_at,
            estimated_completion: master.estimated_completion,
            terminal_reason: master.terminal_reason.clone(),
        }
    }

    pub fn queued(entry: &PendingQueueEntry, position: usize) -> Self {
        let request = &entry.request;
        Self {
            orchestration_id: request.id,
            name: request.name.clone(),
            status: OrchestrationStatus::Queued,
            priority: entry.priority,
            scope: request.scope,
            requested_by: request.requested_by.clone(),
            progress: 0.0,
            queue_position: Some(position),
            waiting_on: Some(entry.wait.clone()),
            session_id: None,
            resources: ResourceRequirements::new(),
            stages_total: entry.plan.len(),
            stages_completed: 0,
            stages_failed: 0,
            stages_skipped: 0,
            success_rate: None,
            stages: Vec::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
            submitted_at: entry.enqueued_at,
            started_at: None,
            completed_at: None,
            estimated_completion: None,
            terminal_reason: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum SubmitResult {
    Executing {
        orchestration_id: OrchestrationId,
        session_id: SessionId,
    },
    Queued {
        orchestration_id: OrchestrationId,
        position: usize,
    },
    Rejected {
        orchestration_id: OrchestrationId,
        reason: ValidationError,
    },
}

impl SubmitResult {
    pub fn orchestration_id(&self) -> OrchestrationId {
        match self {
            SubmitResult::Executing {
                orchestration_id, ..
            }
            | SubmitResult::Queued {
                orchestration_id, ..
            }
            | SubmitResult::Rejected {
                orchestration_id, ..
            } => *orchestration_id,
        }
    }

    pub fn is_executing(&self) -> bool {
        matches!(self, SubmitResult::Executing { .. })
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelMode {
    /// Stop scheduling and wait (bounded) for in-flight handlers.
    #[default]
    Graceful,
    /// Stop scheduling, signal handlers and detach at once.
    Immediate,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    Cancelled,
    RemovedFromQueue,
    /// Nothing to do; the orchestration had already finished.
    AlreadyTerminal(OrchestrationStatus),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CancelResult {
    pub orchestration_id: OrchestrationId,
    pub outcome: CancelOutcome,
    /// Amounts returned to the pools by this call.
    pub resources_released: ResourceRequirements,
}

/// Filter for `list_active`. Empty fields match everything.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListFilter {
    pub statuses: Vec<OrchestrationStatus>,
    pub priority: Option<Priority>,
    pub scope: Option<ScopeKind>,
    pub requested_by: Option<String>,
    /// Include queued entries alongside running ones.
    pub include_queued: bool,
}

impl ListFilter {
    pub fn all() -> Self {
        Self {
            include_queued: true,
            ..Self::default()
        }
    }

    pub fn matches(&self, view: &StatusView) -> bool {
        if view.status == OrchestrationStatus::Queued && !self.include_queued {
            return false;
        }
        if !self.statuses.is_empty() && !self.statuses.contains(&view.status) {
            return false;
        }
        if self.priority.is_some_and(|p| p != view.priority) {
            return false;
        }
        if self.scope.is_some_and(|s| s != view.scope) {
            return false;
        }
        if let Some(requester) = &self.requested_by
            && view.requested_by.as_ref() != Some(requester)
        {
            return false;
        }
        true
    }
}
