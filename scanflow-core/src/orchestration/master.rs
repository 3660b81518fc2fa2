use std::fmt;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

use super::planner::{CriticalPath, ExecutionPlan};
use super::request::{OrchestrationRequest, Priority, ScopeKind};
use super::resources::ResourceRequirements;
use super::stage::{StageExecution, StageOutcome, StageStatus};
use crate::types::ids::{OrchestrationId, SessionId};

/// Orchestration-level state machine:
/// `Pending -> Planning -> Running -> {Completed | CompletedWithWarnings | Failed | Cancelled}`.
/// `Queued` covers validated requests waiting for admission.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationStatus {
    Queued,
    Pending,
    Planning,
    Running,
    Completed,
    CompletedWithWarnings,
    Failed,
    Cancelled,
}

impl OrchestrationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrchestrationStatus::Completed
                | OrchestrationStatus::CompletedWithWarnings
                | OrchestrationStatus::Failed
                | OrchestrationStatus::Cancelled
        )
    }

    /// Forward-only transitions; terminal states accept nothing.
    pub fn can_transition_to(self, next: OrchestrationStatus) -> bool {
        use OrchestrationStatus::*;
        match (self, next) {
            (Queued, Pending) => true,
            (Pending, Planning) => true,
            (Planning, Running) => true,
            (from, to) if !from.is_terminal() && to.is_terminal() => true,
            _ => false,
        }
    }
}

impl fmt::Display for OrchestrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrchestrationStatus::Queued => "queued",
            OrchestrationStatus::Pending => "pending",
            OrchestrationStatus::Planning => "planning",
            OrchestrationStatus::Running => "running",
            OrchestrationStatus::Completed => "completed",
            OrchestrationStatus::CompletedWithWarnings => "completed_with_warnings",
            OrchestrationStatus::Failed => "failed",
            OrchestrationStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Aggregate record for an admitted orchestration. Mutated only by the
/// executor and the monitor; frozen once terminal.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OrchestrationMaster {
    pub id: OrchestrationId,
    pub session_id: SessionId,
    pub name: String,
    pub status: OrchestrationStatus,
    pub priority: Priority,
    pub scope: ScopeKind,
    pub target_id: Option<String>,
    pub requested_by: Option<String>,
    /// Stage executions in planned order.
    pub stages: Vec<StageExecution>,
    pub critical_path: CriticalPath,
    pub resources: ResourceRequirements,
    pub stages_total: usize,
    pub stages_completed: usize,
    pub stages_failed: usize,
    pub stages_skipped: usize,
    pub completion_percentage: f64,
    pub success_rate: Option<f64>,
    pub submitted_at: DateTime<Utc>,
    pub scheduled_start: DateTime<Utc>,
    pub actual_start: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub estimated_completion: Option<DateTime<Utc>>,
    /// Footprint units multiplied by estimated hours.
    pub estimated_cost: f64,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub terminal_reason: Option<String>,
}

impl OrchestrationMaster {
    pub fn new(
        request: &OrchestrationRequest,
        plan: &ExecutionPlan,
        session_id: SessionId,
        resources: ResourceRequirements,
        submitted_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        let stages = plan
            .stages
            .iter()
            .map(|planned| StageExecution::new(request.id, &planned.stage))
            .collect::<Vec<_>>();
        let eta = plan.estimated_duration(request.execution_mode);
        let estimated_cost = resources.total() as f64 * eta.as_secs_f64() / 3_600.0;

        Self {
            id: request.id,
            session_id,
            name: request.name.clone(),
            status: OrchestrationStatus::Pending,
            priority: request.priority,
            scope: request.scope,
            target_id: request.target_id.clone(),
            requested_by: request.requested_by.clone(),
            stages_total: stages.len(),
            stages,
            critical_path: plan.critical_path.clone(),
            resources,
            stages_completed: 0,
            stages_failed: 0,
            stages_skipped: 0,
            completion_percentage: 0.0,
            success_rate: None,
            submitted_at,
            scheduled_start: now,
            actual_start: None,
            completed_at: None,
            estimated_completion: ChronoDuration::from_std(eta).ok().map(|eta| now + eta),
            estimated_cost,
            warnings: Vec::new(),
            errors: Vec::new(),
            terminal_reason: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Applies a non-terminal transition. Returns false if refused.
    pub fn advance(&mut self, next: OrchestrationStatus, now: DateTime<Utc>) -> bool {
        if next.is_terminal() || !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        if next == OrchestrationStatus::Running {
            self.actual_start = Some(now);
        }
        true
    }

    pub fn stage(&self, stage_id: &str) -> Option<&StageExecution> {
        self.stages.iter().find(|s| s.stage_id == stage_id)
    }

    fn stage_mut(&mut self, stage_id: &str) -> Option<&mut StageExecution> {
        self.stages.iter_mut().find(|s| s.stage_id == stage_id)
    }

    pub fn mark_stage_running(&mut self, stage_id: &str, now: DateTime<Utc>) {
        if self.is_terminal() {
            return;
        }
        if let Some(stage) = self.stage_mut(stage_id) {
            stage.start(now);
        }
    }

    /// Records a finished handler call. Non-critical failures become
    /// orchestration-level warnings; critical ones become errors.
    pub fn record_stage_result(
        &mut self,
        stage_id: &str,
        outcome: StageOutcome,
        attempts: u32,
        now: DateTime<Utc>,
    ) {
        if self.is_terminal() {
            return;
        }
        let Some(stage) = self.stage_mut(stage_id) else {
            return;
        };
        stage.finish(outcome, attempts, now);
        let (status, critical, errors) = (stage.status, stage.critical, stage.errors.clone());

        match status {
            StageStatus::Completed => self.stages_completed += 1,
            StageStatus::Failed => {
                self.stages_failed += 1;
                let detail = format!("stage '{stage_id}' failed: {}", errors.join("; "));
                if critical {
                    self.errors.push(detail);
                } else {
                    self.warnings.push(detail);
                }
            }
            _ => {}
        }
        self.refresh_progress();
    }

    pub fn mark_stage_skipped(&mut self, stage_id: &str, reason: &str, now: DateTime<Utc>) {
        if self.is_terminal() {
            return;
        }
        if let Some(stage) = self.stage_mut(stage_id)
            && !stage.status.is_finished()
        {
            stage.skip(reason, now);
            self.stages_skipped += 1;
            self.refresh_progress();
        }
    }

    fn refresh_progress(&mut self) {
        if self.stages_total == 0 {
            self.completion_percentage = 100.0;
            return;
        }
        let finished = self.stages_completed + self.stages_failed + self.stages_skipped;
        self.completion_percentage = finished as f64 * 100.0 / self.stages_total as f64;
    }

    pub fn attempted_stages(&self) -> usize {
        self.stages.iter().filter(|s| s.was_attempted()).count()
    }

    /// `completed / attempted`; `None` when nothing ran.
    pub fn compute_success_rate(&self) -> Option<f64> {
        let attempted = self.attempted_stages();
        (attempted > 0).then(|| self.stages_completed as f64 / attempted as f64)
    }

    pub fn has_critical_failure(&self) -> bool {
        self.stages
            .iter()
            .any(|s| s.critical && s.status == StageStatus::Failed)
    }

    /// Terminal status for a run that was not cancelled or timed out.
    pub fn settle_status(&self, success_threshold: f64) -> OrchestrationStatus {
        if self.has_critical_failure() {
            return OrchestrationStatus::Failed;
        }
        match self.compute_success_rate() {
            Some(rate) if rate < success_threshold => OrchestrationStatus::CompletedWithWarnings,
            _ => OrchestrationStatus::Completed,
        }
    }

    /// One-way terminal transition. Unfinished stages are closed as skipped,
    /// except in-flight ones which are marked failed with `reason`.
    pub fn finalize(
        &mut self,
        status: OrchestrationStatus,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> bool {
        if !status.is_terminal() || !self.status.can_transition_to(status) {
            return false;
        }
        let note = reason.clone().unwrap_or_else(|| format!("orchestration {status}"));
        for stage in &mut self.stages {
            match stage.status {
                StageStatus::Running => {
                    stage.status = StageStatus::Failed;
                    stage.completed_at = Some(now);
                    stage.errors.push(note.clone());
                    self.stages_failed += 1;
                }
                StageStatus::Pending => {
                    stage.skip(note.clone(), now);
                    self.stages_skipped += 1;
                }
                _ => {}
            }
        }
        self.refresh_progress();
        self.success_rate = self.compute_success_rate();
        self.status = status;
        self.completed_at = Some(now);
        if status == OrchestrationStatus::Failed
            && let Some(reason) = &reason
            && !self.errors.contains(reason)
        {
            self.errors.push(reason.clone());
        }
        self.terminal_reason = reason;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::planner::DependencyPlanner;
    use crate::orchestration::stage::{StageDefinition, StageType};

    fn master() -> OrchestrationMaster {
        let request = OrchestrationRequest::new("m")
            .with_stage(StageDefinition::new("A", StageType::DataSourceScan))
            .with_stage(StageDefinition::new("B", StageType::Classification).depends_on(["A"]))
            .with_stage(StageDefinition::new("C", StageType::LineageAnalysis).depends_on(["A"]));
        let plan = DependencyPlanner::new().plan(&request).unwrap();
        let now = Utc::now();
        OrchestrationMaster::new(
            &request,
            &plan,
            SessionId::new(),
            ResourceRequirements::new(),
            now,
            now,
        )
    }

    #[test]
    fn terminal_states_reject_transitions() {
        use OrchestrationStatus::*;
        assert!(Pending.can_transition_to(Planning));
        assert!(Running.can_transition_to(Cancelled));
        assert!(!Running.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Cancelled.can_transition_to(Running));
    }

    #[test]
    fn non_critical_failure_yields_warnings_status() {
        let mut m = master();
        let now = Utc::now();
        assert!(m.advance(OrchestrationStatus::Planning, now));
        assert!(m.advance(OrchestrationStatus::Running, now));
        for id in ["A", "B", "C"] {
            m.mark_stage_running(id, now);
        }
        m.record_stage_result("A", StageOutcome::success(serde_json::json!({})), 1, now);
        m.record_stage_result("B", StageOutcome::failure("boom"), 1, now);
        m.record_stage_result("C", StageOutcome::success(serde_json::json!({})), 1, now);

        let rate = m.compute_success_rate().unwrap();
        assert!((rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(m.settle_status(0.8), OrchestrationStatus::CompletedWithWarnings);
        assert_eq!(m.warnings.len(), 1);
        assert!(m.errors.is_empty());
    }

    #[test]
    fn finalize_is_one_shot_and_closes_open_stages() {
        let mut m = master();
        let now = Utc::now();
        m.advance(OrchestrationStatus::Planning, now);
        m.advance(OrchestrationStatus::Running, now);
        m.mark_stage_running("A", now);

        assert!(m.finalize(OrchestrationStatus::Cancelled, Some("user".into()), now));
        assert_eq!(m.stage("A").unwrap().status, StageStatus::Failed);
        assert_eq!(m.stage("B").unwrap().status, StageStatus::Skipped);
        assert_eq!(m.completion_percentage, 100.0);

        let frozen = m.clone();
        assert!(!m.finalize(OrchestrationStatus::Failed, None, now));
        m.record_stage_result("B", StageOutcome::success(serde_json::Value::Null), 1, now);
        assert_eq!(m.status, OrchestrationStatus::Cancelled);
        assert_eq!(m.stages_completed, frozen.stages_completed);
    }
}
