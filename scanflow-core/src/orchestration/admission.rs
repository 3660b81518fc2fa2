//! Admission control: validates requests, reserves their footprint and either
//! admits them as sessions or parks them in the pending queue.
//!
//! Lock order is always admission state first, then the pool manager. Nothing
//! in this module awaits a stage handler.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use super::collaborators::{RateLimiter, ValidationLookups};
use super::config::{AdmissionConfig, ExecutionConfig, OrchestratorConfig, ResourceCapacityConfig};
use super::dispatcher::StageHandlerRegistry;
use super::monitor::QueueSummary;
use super::planner::{
    DependencyPlanner, ExecutionPlan, PrerequisiteCheck, PrerequisiteState, check_prerequisites,
    detect_prerequisite_cycle,
};
use super::queue::{PendingQueue, PendingQueueEntry, WaitReason};
use super::request::{ExecutionMode, OrchestrationRequest, Priority, ScopeKind};
use super::resources::{
    ReservationOutcome, ResourcePoolManager, ResourceRequirements, ResourceReservation,
};
use super::status::StatusView;
use crate::error::{Result, ValidationError};
use crate::types::ids::{OrchestrationId, SessionId};

/// Concurrent stages an orchestration may run, after applying the global cap.
pub fn effective_parallelism(request: &OrchestrationRequest, execution: &ExecutionConfig) -> usize {
    match request.execution_mode {
        ExecutionMode::Sequential => 1,
        ExecutionMode::Parallel => request
            .max_parallel_stages
            .unwrap_or(execution.max_parallel_stages)
            .min(execution.max_parallel_stages)
            .max(1),
    }
}

/// Resource hints verbatim, else the per-stage default times concurrent width.
pub fn estimate_footprint(
    request: &OrchestrationRequest,
    plan: &ExecutionPlan,
    execution: &ExecutionConfig,
) -> ResourceRequirements {
    if !request.resource_hints.is_empty() {
        return request.resource_hints.clone();
    }
    let width = effective_parallelism(request, execution)
        .min(plan.max_width.max(1))
        .max(1);
    execution.default_stage_footprint.scaled(width as u64)
}

/// A request that passed every validation step.
#[derive(Clone, Debug)]
pub struct ValidatedRequest {
    pub request: Arc<OrchestrationRequest>,
    pub plan: Arc<ExecutionPlan>,
    pub footprint: ResourceRequirements,
    pub submitted_at: DateTime<Utc>,
}

/// An admitted orchestration ready to be handed to the executor.
#[derive(Clone, Debug)]
pub struct AdmittedOrchestration {
    pub session_id: SessionId,
    pub request: Arc<OrchestrationRequest>,
    pub plan: Arc<ExecutionPlan>,
    pub reservation: ResourceReservation,
    pub submitted_at: DateTime<Utc>,
    pub admitted_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub enum AdmissionDecision {
    Admitted(AdmittedOrchestration),
    Queued {
        position: usize,
        wait: WaitReason,
    },
}

/// An admitted request while it runs. Dropping it frees the concurrency slot.
struct ScanSession {
    session_id: SessionId,
    priority: Priority,
    reservation: ResourceReservation,
    admitted_at: DateTime<Utc>,
    _permit: OwnedSemaphorePermit,
}

/// Public view of a live session.
#[derive(Clone, Debug)]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub orchestration_id: OrchestrationId,
    pub priority: Priority,
    pub resources: ResourceRequirements,
    pub admitted_at: DateTime<Utc>,
}

struct AdmissionState {
    queue: PendingQueue,
    sessions: HashMap<OrchestrationId, ScanSession>,
    /// Ids that left the queue or the session map, newest last.
    retired: VecDeque<OrchestrationId>,
    retired_index: HashSet<OrchestrationId>,
}

impl AdmissionState {
    fn in_progress(&self, id: &OrchestrationId) -> bool {
        self.queue.contains(id) || self.sessions.contains_key(id)
    }

    fn retire(&mut self, id: OrchestrationId, capacity: usize) {
        if self.retired_index.insert(id) {
            self.retired.push_back(id);
        }
        while self.retired.len() > capacity {
            if let Some(old) = self.retired.pop_front() {
                self.retired_index.remove(&old);
            }
        }
    }
}

pub struct AdmissionController {
    admission: AdmissionConfig,
    execution: ExecutionConfig,
    capacity: ResourceCapacityConfig,
    retired_capacity: usize,
    planner: DependencyPlanner,
    pools: Arc<dyn ResourcePoolManager>,
    lookups: Arc<dyn ValidationLookups>,
    rate_limiter: Arc<dyn RateLimiter>,
    handlers: Arc<StageHandlerRegistry>,
    slots: Arc<Semaphore>,
    state: Mutex<AdmissionState>,
}

impl fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("AdmissionController");
        debug
            .field("max_concurrent", &self.admission.max_concurrent_orchestrations)
            .field("free_slots", &self.slots.available_permits());
        match self.state.try_lock() {
            Ok(state) => {
                debug
                    .field("queued", &state.queue.len())
                    .field("sessions", &state.sessions.len());
            }
            Err(_) => {
                debug.field("state", &"<locked>");
            }
        }
        debug.finish()
    }
}

impl AdmissionController {
    pub fn new(
        config: &OrchestratorConfig,
        pools: Arc<dyn ResourcePoolManager>,
        lookups: Arc<dyn ValidationLookups>,
        rate_limiter: Arc<dyn RateLimiter>,
        handlers: Arc<StageHandlerRegistry>,
    ) -> Self {
        let slots = config.admission.max_concurrent_orchestrations.max(1);
        Self {
            admission: config.admission.clone(),
            execution: config.execution.clone(),
            capacity: config.resources.clone(),
            retired_capacity: config.events.history_capacity.max(1),
            planner: DependencyPlanner::new(),
            pools,
            lookups,
            rate_limiter,
            handlers,
            slots: Arc::new(Semaphore::new(slots)),
            state: Mutex::new(AdmissionState {
                queue: PendingQueue::new(),
                sessions: HashMap::new(),
                retired: VecDeque::new(),
                retired_index: HashSet::new(),
            }),
        }
    }

    /// Fail-fast validation. Touches no shared state.
    pub async fn validate(
        &self,
        request: OrchestrationRequest,
        now: DateTime<Utc>,
    ) -> std::result::Result<ValidatedRequest, ValidationError> {
        self.check_structure(&request, now)?;
        self.check_references(&request).await?;

        let plan = self.planner.plan(&request)?;

        let footprint = estimate_footprint(&request, &plan, &self.execution);
        if let Some((resource, requested, capacity)) = footprint.first_exceeding(&self.capacity) {
            return Err(ValidationError::ExceedsCapacity {
                resource,
                requested,
                capacity,
            });
        }

        if let Some(requester) = &request.requested_by {
            match self.rate_limiter.check(requester).await {
                Ok(true) => {}
                Ok(false) => return Err(ValidationError::RateLimited(requester.clone())),
                Err(err) => {
                    warn!(
                        target: "scanflow::admission",
                        requester = %requester,
                        error = %err,
                        "rate limiter unavailable; allowing request"
                    );
                }
            }
        }

        Ok(ValidatedRequest {
            request: Arc::new(request),
            plan: Arc::new(plan),
            footprint,
            submitted_at: now,
        })
    }

    fn check_structure(
        &self,
        request: &OrchestrationRequest,
        now: DateTime<Utc>,
    ) -> std::result::Result<(), ValidationError> {
        let has_target = request
            .target_id
            .as_deref()
            .is_some_and(|t| !t.trim().is_empty());
        if request.scope != ScopeKind::SystemWide && !has_target {
            return Err(ValidationError::MissingTarget {
                scope: request.scope.to_string(),
            });
        }
        if request.stages.is_empty() {
            return Err(ValidationError::EmptyPlan);
        }
        if let Some(missing) = request
            .stages
            .iter()
            .map(|s| s.stage_type)
            .find(|t| !self.handlers.supports(*t))
        {
            return Err(ValidationError::MissingHandler(missing));
        }
        if request.deadline.is_some_and(|deadline| deadline <= now) {
            return Err(ValidationError::DeadlineInPast);
        }
        Ok(())
    }

    async fn check_references(
        &self,
        request: &OrchestrationRequest,
    ) -> std::result::Result<(), ValidationError> {
        for id in &request.data_source_ids {
            match self.lookups.data_source_exists(id).await {
                Ok(true) => {}
                Ok(false) => return Err(ValidationError::UnknownDataSource(id.clone())),
                Err(err) => return Err(ValidationError::LookupFailed(err.to_string())),
            }
        }
        if !request.rule_ids.is_empty() {
            let invalid = self
                .lookups
                .invalid_rule_ids(&request.rule_ids)
                .await
                .map_err(|err| ValidationError::LookupFailed(err.to_string()))?;
            if !invalid.is_empty() {
                return Err(ValidationError::InvalidRules(invalid));
            }
        }
        Ok(())
    }

    /// Admits or queues a validated request. `terminal` holds prerequisite
    /// ids the caller already knows to be finished.
    pub async fn admit(
        &self,
        validated: ValidatedRequest,
        terminal: &HashSet<OrchestrationId>,
        now: DateTime<Utc>,
    ) -> Result<AdmissionDecision> {
        let ValidatedRequest {
            request,
            plan,
            footprint,
            submitted_at,
        } = validated;
        let id = request.id;
        let mut state = self.state.lock().await;

        if state.in_progress(&id) || state.retired_index.contains(&id) || terminal.contains(&id) {
            return Err(ValidationError::DuplicateOrchestration(id.to_string()).into());
        }

        if !request.override_dependencies && !request.prerequisites.is_empty() {
            let check = check_prerequisites(&request.prerequisites, |prereq| {
                if state.in_progress(prereq) {
                    PrerequisiteState::InProgress
                } else if state.retired_index.contains(prereq) || terminal.contains(prereq) {
                    PrerequisiteState::Terminal
                } else {
                    PrerequisiteState::Unknown
                }
            });
            match check {
                PrerequisiteCheck::Satisfied => {}
                PrerequisiteCheck::Unknown(prereq) => {
                    return Err(ValidationError::UnknownPrerequisite(prereq.to_string()).into());
                }
                PrerequisiteCheck::Waiting(waiting) => {
                    let parked = state.queue.waiting_prerequisites();
                    if let Some(through) =
                        detect_prerequisite_cycle(id, &request.prerequisites, &parked)
                    {
                        return Err(ValidationError::PrerequisiteCycle(through.to_string()).into());
                    }
                    let wait = WaitReason::Prerequisites(waiting);
                    let entry =
                        PendingQueueEntry::new(request, plan, footprint, wait.clone(), submitted_at);
                    let position = self.enqueue(&mut state, entry)?;
                    return Ok(AdmissionDecision::Queued { position, wait });
                }
            }
        }

        if self.admission.fair_admission
            && state.queue.has_resource_waiter_at_or_above(request.priority)
        {
            debug!(
                target: "scanflow::admission",
                orchestration_id = %id,
                priority = %request.priority,
                "queueing behind earlier requests of equal or higher priority"
            );
            let entry =
                PendingQueueEntry::new(request, plan, footprint, WaitReason::Resources, submitted_at);
            let position = self.enqueue(&mut state, entry)?;
            return Ok(AdmissionDecision::Queued {
                position,
                wait: WaitReason::Resources,
            });
        }

        let entry = PendingQueueEntry::new(request, plan, footprint, WaitReason::Resources, submitted_at);
        match self.try_admit_locked(&mut state, &entry, now).await? {
            Some(admitted) => Ok(AdmissionDecision::Admitted(admitted)),
            None => {
                let position = self.enqueue(&mut state, entry)?;
                Ok(AdmissionDecision::Queued {
                    position,
                    wait: WaitReason::Resources,
                })
            }
        }
    }

    fn enqueue(&self, state: &mut AdmissionState, entry: PendingQueueEntry) -> Result<usize> {
        if state.queue.len() >= self.admission.max_queue_depth {
            return Err(ValidationError::QueueFull(self.admission.max_queue_depth).into());
        }
        let id = entry.id();
        let position = state.queue.push(entry);
        info!(
            target: "scanflow::queue",
            orchestration_id = %id,
            position,
            depth = state.queue.len(),
            "orchestration queued"
        );
        Ok(position)
    }

    /// Takes a concurrency slot and reserves the footprint, or neither.
    async fn try_admit_locked(
        &self,
        state: &mut AdmissionState,
        entry: &PendingQueueEntry,
        now: DateTime<Utc>,
    ) -> Result<Option<AdmittedOrchestration>> {
        let Ok(permit) = Arc::clone(&self.slots).try_acquire_owned() else {
            debug!(
                target: "scanflow::admission",
                orchestration_id = %entry.id(),
                "concurrency limit reached"
            );
            return Ok(None);
        };

        let reservation = match self.pools.reserve(entry.id(), &entry.footprint).await? {
            ReservationOutcome::Granted(reservation) => reservation,
            ReservationOutcome::Denied(denial) => {
                debug!(
                    target: "scanflow::admission",
                    orchestration_id = %entry.id(),
                    resource = %denial.resource,
                    requested = denial.requested,
                    available = denial.available,
                    reason = ?denial.reason,
                    "reservation denied"
                );
                return Ok(None);
            }
        };

        let session_id = SessionId::new();
        state.sessions.insert(
            entry.id(),
            ScanSession {
                session_id,
                priority: entry.priority,
                reservation: reservation.clone(),
                admitted_at: now,
                _permit: permit,
            },
        );
        info!(
            target: "scanflow::admission",
            orchestration_id = %entry.id(),
            session_id = %session_id,
            active = state.sessions.len(),
            "orchestration admitted"
        );

        Ok(Some(AdmittedOrchestration {
            session_id,
            request: Arc::clone(&entry.request),
            plan: Arc::clone(&entry.plan),
            reservation,
            submitted_at: entry.enqueued_at,
            admitted_at: now,
        }))
    }

    /// Admits queued entries in order until the first one that does not fit.
    /// Entries still waiting on prerequisites are stepped over.
    pub async fn drain(&self, now: DateTime<Utc>) -> Result<Vec<AdmittedOrchestration>> {
        let mut state = self.state.lock().await;
        let mut admitted = Vec::new();

        for id in state.queue.ids_in_order() {
            let Some(entry) = state.queue.get(&id) else {
                continue;
            };
            if let WaitReason::Prerequisites(waiting) = &entry.wait {
                let still: Vec<OrchestrationId> = waiting
                    .iter()
                    .copied()
                    .filter(|prereq| state.in_progress(prereq))
                    .collect();
                let changed = still.len() != waiting.len();
                if let Some(entry) = state.queue.get_mut(&id)
                    && changed
                {
                    entry.wait = if still.is_empty() {
                        WaitReason::Resources
                    } else {
                        WaitReason::Prerequisites(still.clone())
                    };
                }
                if !still.is_empty() {
                    continue;
                }
            }

            let Some(entry) = state.queue.get(&id).cloned() else {
                continue;
            };
            match self.try_admit_locked(&mut state, &entry, now).await? {
                Some(ready) => {
                    state.queue.remove(&id);
                    admitted.push(ready);
                }
                None => break,
            }
        }

        if !admitted.is_empty() {
            info!(
                target: "scanflow::queue",
                admitted = admitted.len(),
                remaining = state.queue.len(),
                "drained pending queue"
            );
        }
        Ok(admitted)
    }

    /// Ends a session: returns its reservation to the pools and frees the
    /// slot. Returns the amounts released; empty if there was no session.
    pub async fn release(&self, id: &OrchestrationId) -> Result<ResourceRequirements> {
        let mut state = self.state.lock().await;
        let Some(session) = state.sessions.remove(id) else {
            return Ok(ResourceRequirements::new());
        };
        state.retire(*id, self.retired_capacity);
        let released = self.pools.release(&session.reservation).await?;
        debug!(
            target: "scanflow::admission",
            orchestration_id = %id,
            session_id = %session.session_id,
            held_for_ms = (Utc::now() - session.admitted_at).num_milliseconds(),
            "session released"
        );
        Ok(released)
    }

    /// Drops a queued entry. Queued entries hold no reservation.
    pub async fn remove_queued(&self, id: &OrchestrationId) -> Option<PendingQueueEntry> {
        let mut state = self.state.lock().await;
        let entry = state.queue.remove(id)?;
        state.retire(*id, self.retired_capacity);
        Some(entry)
    }

    pub async fn queued_view(&self, id: &OrchestrationId) -> Option<StatusView> {
        let state = self.state.lock().await;
        let entry = state.queue.get(id)?;
        let position = state.queue.position(id)?;
        Some(StatusView::queued(entry, position))
    }

    pub async fn queued_views(&self) -> Vec<StatusView> {
        let state = self.state.lock().await;
        state
            .queue
            .iter()
            .enumerate()
            .map(|(index, entry)| StatusView::queued(entry, index + 1))
            .collect()
    }

    pub async fn queued_ids(&self) -> Vec<OrchestrationId> {
        self.state.lock().await.queue.ids_in_order()
    }

    pub async fn session(&self, id: &OrchestrationId) -> Option<SessionInfo> {
        let state = self.state.lock().await;
        state.sessions.get(id).map(|session| SessionInfo {
            session_id: session.session_id,
            orchestration_id: *id,
            priority: session.priority,
            resources: session.reservation.amounts.clone(),
            admitted_at: session.admitted_at,
        })
    }

    pub async fn active_sessions(&self) -> usize {
        self.state.lock().await.sessions.len()
    }

    pub async fn queue_depth(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    pub async fn is_in_progress(&self, id: &OrchestrationId) -> bool {
        self.state.lock().await.in_progress(id)
    }

    pub async fn queue_summary(&self, now: DateTime<Utc>) -> QueueSummary {
        let state = self.state.lock().await;
        QueueSummary {
            depth: state.queue.len(),
            resource_waiters: state.queue.iter().filter(|e| e.waiting_for_resources()).count(),
            longest_waiting: state.queue.longest_waiting(now),
        }
    }

    /// Aging pass: promotes entries that waited past the configured window.
    pub async fn promote_aged(&self, now: DateTime<Utc>) -> Vec<(OrchestrationId, Priority)> {
        let window = ChronoDuration::seconds(self.admission.queue_aging_secs.min(i64::MAX as u64) as i64);
        let promoted = self.state.lock().await.queue.promote_aged(now, window);
        for (id, priority) in &promoted {
            debug!(
                target: "scanflow::queue",
                orchestration_id = %id,
                priority = %priority,
                "promoted aged queue entry"
            );
        }
        promoted
    }

    pub async fn promote(&self, id: &OrchestrationId, now: DateTime<Utc>) -> Option<Priority> {
        self.state.lock().await.queue.promote(id, now)
    }

    pub fn aging_window(&self) -> ChronoDuration {
        ChronoDuration::seconds(self.admission.queue_aging_secs.min(i64::MAX as u64) as i64)
    }
}
