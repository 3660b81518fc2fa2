use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::{Mutex, Notify, RwLock, broadcast};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

use super::event_bus::InProcEventBus;
use crate::error::{OrchestrationError, Result};
use crate::orchestration::admission::{
    AdmissionController, AdmissionDecision, AdmittedOrchestration, ValidatedRequest,
};
use crate::orchestration::collaborators::{
    Alert, AlertSeverity, AlertSink, NoopRateLimiter, RateLimiter, StaticValidationLookups,
    TelemetrySink, TracingAlertSink, TracingTelemetry, ValidationLookups,
};
use crate::orchestration::config::OrchestratorConfig;
use crate::orchestration::dispatcher::StageHandlerRegistry;
use crate::orchestration::events::{
    OrchestrationEvent, OrchestrationEventPayload, OrchestrationEventPublisher,
};
use crate::orchestration::executor::{ActiveOrchestration, StageExecutor};
use crate::orchestration::master::OrchestrationStatus;
use crate::orchestration::monitor::{
    HeuristicScoring, OptimizationReport, OptimizationScope, RecommendedAction, ResourceOptimizer,
    ScoringStrategy, UtilizationHistory, UtilizationSample, overdue_reason,
};
use crate::orchestration::persistence::{InMemoryOrchestrationRepository, OrchestrationRepository};
use crate::orchestration::request::OrchestrationRequest;
use crate::orchestration::resources::{
    InMemoryResourcePools, PoolSnapshot, ResourcePoolManager, ResourceRequirements, ResourceType,
};
use crate::orchestration::status::{
    CancelMode, CancelOutcome, CancelResult, ListFilter, StatusView, SubmitResult,
};
use crate::types::ids::OrchestrationId;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

type Registry = HashMap<OrchestrationId, Arc<ActiveOrchestration>>;

/// Where an accepted request ended up.
enum Placement {
    Running(Arc<ActiveOrchestration>),
    Queued(usize),
}

/// Frozen terminal views, oldest evicted first.
struct TerminalHistory {
    views: HashMap<OrchestrationId, StatusView>,
    order: VecDeque<OrchestrationId>,
    capacity: usize,
}

impl TerminalHistory {
    fn new(capacity: usize) -> Self {
        Self {
            views: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn insert(&mut self, view: StatusView) {
        let id = view.orchestration_id;
        if self.views.insert(id, view).is_none() {
            self.order.push_back(id);
        }
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.views.remove(&old);
            }
        }
    }

    fn get(&self, id: &OrchestrationId) -> Option<&StatusView> {
        self.views.get(id)
    }
}

struct RuntimeInner {
    config: OrchestratorConfig,
    pools: Arc<dyn ResourcePoolManager>,
    admission: AdmissionController,
    executor: StageExecutor,
    events: Arc<dyn OrchestrationEventPublisher>,
    bus: Option<Arc<InProcEventBus>>,
    telemetry: Arc<dyn TelemetrySink>,
    alerts: Arc<dyn AlertSink>,
    repository: Arc<dyn OrchestrationRepository>,
    optimizer: ResourceOptimizer,
    active: RwLock<Registry>,
    history: RwLock<TerminalHistory>,
    utilization: Mutex<UtilizationHistory>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    queue_wake: Notify,
    started: AtomicBool,
    loop_errors: AtomicU64,
}

/// The scan session coordinator. Owns the live registry, the terminal
/// history and the supervised background loops; cheap to clone.
#[derive(Clone)]
pub struct OrchestratorRuntime {
    inner: Arc<RuntimeInner>,
}

impl fmt::Debug for OrchestratorRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let active = self
            .inner
            .active
            .try_read()
            .map(|guard| guard.len())
            .unwrap_or_default();
        let history = self
            .inner
            .history
            .try_read()
            .map(|guard| guard.views.len())
            .unwrap_or_default();

        f.debug_struct("OrchestratorRuntime")
            .field("config", &self.inner.config)
            .field("admission", &self.inner.admission)
            .field("executor", &self.inner.executor)
            .field("optimizer", &self.inner.optimizer)
            .field("active", &active)
            .field("terminal_history", &history)
            .field("tasks", &self.inner.tracker.len())
            .field("started", &self.inner.started.load(Ordering::Acquire))
            .field("shutdown_cancelled", &self.inner.shutdown.is_cancelled())
            .finish()
    }
}

impl OrchestratorRuntime {
    pub fn builder(config: OrchestratorConfig) -> OrchestratorRuntimeBuilder {
        OrchestratorRuntimeBuilder::new(config)
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    /// Present when the runtime publishes to its own in-process bus.
    pub fn subscribe_events(&self) -> Option<broadcast::Receiver<OrchestrationEvent>> {
        self.inner.bus.as_ref().map(|bus| bus.subscribe())
    }

    pub async fn pool_snapshot(&self) -> Result<PoolSnapshot> {
        self.inner.pools.snapshot().await
    }

    /// Background loop iterations that failed or panicked so far.
    pub fn loop_error_count(&self) -> u64 {
        self.inner.loop_errors.load(Ordering::Relaxed)
    }

    /// Starts the named background loops. Calling it twice is a no-op.
    pub async fn start(&self) -> Result<()> {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let monitor = &self.inner.config.monitor;
        info!(
            target: "scanflow::monitor",
            health_ms = monitor.health_interval_ms,
            queue_ms = monitor.queue_interval_ms,
            metrics_ms = monitor.metrics_interval_ms,
            optimization_ms = monitor.optimization_interval_ms,
            autonomous = monitor.autonomous_mode,
            "starting orchestrator background loops"
        );

        self.spawn_loop("health", monitor.health_interval(), false, |inner| async move {
            inner.health_tick().await
        });
        self.spawn_loop("queue", monitor.queue_interval(), true, |inner| async move {
            inner.queue_tick().await
        });
        self.spawn_loop("metrics", monitor.metrics_interval(), false, |inner| async move {
            inner.metrics_tick().await
        });
        self.spawn_loop(
            "optimization",
            monitor.optimization_interval(),
            false,
            |inner| async move { inner.optimization_tick().await },
        );
        Ok(())
    }

    /// Runs `tick` every `interval` until shutdown. A failing or panicking
    /// iteration is logged and counted; the loop keeps going.
    fn spawn_loop<F, Fut>(&self, name: &'static str, interval: Duration, wake_on_queue_change: bool, tick: F)
    where
        F: Fn(Arc<RuntimeInner>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let shutdown = inner.shutdown.clone();
        let interval = interval.max(Duration::from_millis(1));
        self.inner.tracker.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!(target: "scanflow::monitor", loop_name = name, "background loop shutting down");
                        break;
                    }
                    _ = ticker.tick() => {}
                    _ = inner.queue_wake.notified(), if wake_on_queue_change => {}
                }

                let failure = match AssertUnwindSafe(tick(Arc::clone(&inner))).catch_unwind().await {
                    Ok(Ok(())) => None,
                    Ok(Err(err)) => Some(err.to_string()),
                    Err(_) => Some("iteration panicked".to_string()),
                };
                if let Some(error) = failure {
                    inner.loop_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        target: "scanflow::monitor",
                        loop_name = name,
                        error = %error,
                        "background loop iteration failed"
                    );
                    inner
                        .telemetry
                        .increment("scanflow_loop_errors_total", vec![("loop", name.to_string())])
                        .await;
                }
            }
        });
    }

    /// Validates and admits or queues a request. Validation failures come
    /// back as `Rejected`; only collaborator faults surface as `Err`.
    #[instrument(
        target = "scanflow::admission",
        skip(self, request),
        fields(orchestration_id = %request.id, priority = %request.priority)
    )]
    pub async fn submit(&self, request: OrchestrationRequest) -> Result<SubmitResult> {
        self.inner.submit(request).await
    }

    /// Live view while active, queue position while pending, or the frozen
    /// terminal view. Falls back to the repository for evicted history.
    pub async fn get_status(&self, id: OrchestrationId) -> Result<StatusView> {
        self.inner.get_status(id).await
    }

    #[instrument(target = "scanflow::admission", skip(self))]
    pub async fn cancel(&self, id: OrchestrationId, mode: CancelMode) -> Result<CancelResult> {
        self.inner.cancel(id, mode).await
    }

    /// Analyzes recent utilization for `scope` and, in autonomous mode only,
    /// applies the actionable recommendations.
    pub async fn optimize_resources(&self, scope: Option<OptimizationScope>) -> Result<OptimizationReport> {
        self.inner.optimize(scope.unwrap_or_default()).await
    }

    /// Running (and optionally queued) orchestrations matching `filter`.
    pub async fn list_active(&self, filter: &ListFilter) -> Vec<StatusView> {
        self.inner.list_active(filter).await
    }

    /// Stops the loops, cancels every active orchestration (releasing its
    /// resources) and waits for supervised tasks to finish.
    pub async fn shutdown(&self) -> Result<()> {
        info!(target: "scanflow::monitor", "Initiating graceful shutdown of orchestrator runtime");
        self.inner.shutdown.cancel();

        let active: Vec<Arc<ActiveOrchestration>> =
            self.inner.active.read().await.values().cloned().collect();
        for run in active {
            self.inner
                .finalize(
                    &run,
                    OrchestrationStatus::Cancelled,
                    Some("runtime shutting down".into()),
                )
                .await;
        }

        self.inner.tracker.close();
        if tokio::time::timeout(SHUTDOWN_GRACE, self.inner.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                target: "scanflow::monitor",
                remaining = self.inner.tracker.len(),
                "tasks still running after shutdown grace period"
            );
        }
        info!(target: "scanflow::monitor", "Orchestrator runtime shutdown complete");
        Ok(())
    }
}

impl RuntimeInner {
    async fn publish(&self, correlation: Option<uuid::Uuid>, id: Option<OrchestrationId>, payload: OrchestrationEventPayload) {
        if let Err(err) = self
            .events
            .publish(OrchestrationEvent::new(correlation, id, payload))
            .await
        {
            debug!(target: "scanflow::admission", error = %err, "event publish failed");
        }
    }

    async fn submit(self: &Arc<Self>, request: OrchestrationRequest) -> Result<SubmitResult> {
        if self.shutdown.is_cancelled() {
            return Err(OrchestrationError::Cancelled("runtime is shutting down".into()));
        }
        let id = request.id;
        let correlation = request.correlation_id;
        let priority = request.priority.to_string();
        self.telemetry
            .increment(
                "scanflow_orchestrations_submitted_total",
                vec![("priority", priority.clone())],
            )
            .await;
        self.publish(
            correlation,
            Some(id),
            OrchestrationEventPayload::Submitted {
                orchestration_id: id,
                priority: request.priority,
                stages: request.stages.len(),
            },
        )
        .await;

        let now = Utc::now();
        let terminal = self.known_terminal(&request).await;
        let placement = match self.admission.validate(request, now).await {
            Ok(validated) => self.admit(validated, &terminal, now).await,
            Err(reason) => Err(reason.into()),
        };

        match placement {
            Ok(Placement::Running(active)) => {
                let session_id = active.session_id;
                self.start_run(active).await;
                Ok(SubmitResult::Executing {
                    orchestration_id: id,
                    session_id,
                })
            }
            Ok(Placement::Queued(position)) => {
                self.telemetry
                    .increment("scanflow_orchestrations_queued_total", vec![("priority", priority)])
                    .await;
                self.publish(
                    correlation,
                    Some(id),
                    OrchestrationEventPayload::Queued {
                        orchestration_id: id,
                        position,
                    },
                )
                .await;
                Ok(SubmitResult::Queued {
                    orchestration_id: id,
                    position,
                })
            }
            Err(OrchestrationError::Validation(reason)) => {
                info!(
                    target: "scanflow::admission",
                    orchestration_id = %id,
                    reason = %reason,
                    "orchestration rejected"
                );
                self.telemetry
                    .increment("scanflow_orchestrations_rejected_total", vec![])
                    .await;
                self.publish(
                    correlation,
                    Some(id),
                    OrchestrationEventPayload::Rejected {
                        orchestration_id: id,
                        reason: reason.clone(),
                    },
                )
                .await;
                Ok(SubmitResult::Rejected {
                    orchestration_id: id,
                    reason,
                })
            }
            Err(err) => Err(err),
        }
    }

    /// Prerequisites (and the request's own id) already known to be finished,
    /// from the in-memory history or the repository.
    async fn known_terminal(&self, request: &OrchestrationRequest) -> HashSet<OrchestrationId> {
        let mut candidates = vec![request.id];
        if !request.override_dependencies {
            candidates.extend(request.prerequisites.iter().copied());
        }
        let mut terminal = HashSet::new();
        for id in candidates {
            if self.history.read().await.get(&id).is_some() {
                terminal.insert(id);
                continue;
            }
            match self.repository.load_master(id).await {
                Ok(Some(master)) if master.is_terminal() => {
                    terminal.insert(id);
                }
                Ok(_) => {}
                Err(err) => warn!(
                    target: "scanflow::admission",
                    orchestration_id = %id,
                    error = %err,
                    "repository lookup failed"
                ),
            }
        }
        terminal
    }

    /// Admits under the registry write guard, so an admitted id is never
    /// missing from both the queue and the registry.
    async fn admit(
        &self,
        validated: ValidatedRequest,
        terminal: &HashSet<OrchestrationId>,
        now: DateTime<Utc>,
    ) -> Result<Placement> {
        let mut registry = self.active.write().await;
        match self.admission.admit(validated, terminal, now).await? {
            AdmissionDecision::Admitted(admitted) => {
                Ok(Placement::Running(self.register(&mut registry, admitted)))
            }
            AdmissionDecision::Queued { position, .. } => Ok(Placement::Queued(position)),
        }
    }

    fn register(&self, registry: &mut Registry, admitted: AdmittedOrchestration) -> Arc<ActiveOrchestration> {
        let active = Arc::new(ActiveOrchestration::new(admitted, &self.shutdown));
        registry.insert(active.id(), Arc::clone(&active));
        active
    }

    /// Re-attempts admission for the pending queue and starts whatever fits.
    async fn drain_queue(self: &Arc<Self>) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Ok(());
        }
        let now = Utc::now();
        let admitted: Vec<Arc<ActiveOrchestration>> = {
            let mut registry = self.active.write().await;
            self.admission
                .drain(now)
                .await?
                .into_iter()
                .map(|admitted| self.register(&mut registry, admitted))
                .collect()
        };
        for active in admitted {
            self.start_run(active).await;
        }
        Ok(())
    }

    /// Persists and announces a registered run, then spawns its executor.
    async fn start_run(self: &Arc<Self>, active: Arc<ActiveOrchestration>) {
        if active.is_terminal() {
            return;
        }
        let id = active.id();
        let snapshot = active.master().lock().await.clone();
        if let Err(err) = self.repository.upsert_master(&snapshot).await {
            warn!(target: "scanflow::admission", orchestration_id = %id, error = %err, "failed to persist master");
        }
        self.telemetry
            .increment(
                "scanflow_orchestrations_admitted_total",
                vec![("priority", active.request.priority.to_string())],
            )
            .await;
        self.publish(
            active.request.correlation_id,
            Some(id),
            OrchestrationEventPayload::Admitted {
                orchestration_id: id,
                session_id: active.session_id,
                resources: active.reservation.amounts.clone(),
            },
        )
        .await;

        self.tracker.spawn(supervise_run(Arc::clone(self), active));
    }

    /// The one terminal transition. Returns false if another caller already
    /// performed it.
    async fn finalize(
        self: &Arc<Self>,
        active: &Arc<ActiveOrchestration>,
        status: OrchestrationStatus,
        reason: Option<String>,
    ) -> bool {
        if !active.try_begin_terminal() {
            return false;
        }
        active.interrupt();
        let id = active.id();
        let now = Utc::now();

        let master = {
            let mut master = active.master().lock().await;
            master.finalize(status, reason, now);
            master.clone()
        };

        let released = match self.admission.release(&id).await {
            Ok(released) => released,
            Err(err) => {
                warn!(target: "scanflow::admission", orchestration_id = %id, error = %err, "resource release failed");
                ResourceRequirements::new()
            }
        };

        let view = StatusView::from_master(&master);
        self.history.write().await.insert(view);
        self.active.write().await.remove(&id);
        active.publish_status(master.status);

        if let Err(err) = self.repository.upsert_master(&master).await {
            warn!(target: "scanflow::admission", orchestration_id = %id, error = %err, "failed to persist terminal master");
        }

        let status_label = master.status.to_string();
        self.telemetry
            .increment(
                "scanflow_orchestrations_terminal_total",
                vec![("status", status_label.clone())],
            )
            .await;
        if let Some(started) = master.actual_start {
            self.telemetry
                .histogram(
                    "scanflow_orchestration_duration_ms",
                    (now - started).num_milliseconds().max(0) as f64,
                    vec![("status", status_label)],
                )
                .await;
        }
        self.publish(
            active.request.correlation_id,
            Some(id),
            OrchestrationEventPayload::Terminal {
                orchestration_id: id,
                status: master.status,
                success_rate: master.success_rate,
                resources_released: released.clone(),
            },
        )
        .await;

        info!(
            target: "scanflow::executor",
            orchestration_id = %id,
            status = %master.status,
            success_rate = ?master.success_rate,
            released = ?released,
            reason = ?master.terminal_reason,
            "orchestration finished"
        );
        if let Err(err) = self.drain_queue().await {
            warn!(target: "scanflow::queue", orchestration_id = %id, error = %err, "queue drain after release failed");
        }
        true
    }

    async fn get_status(&self, id: OrchestrationId) -> Result<StatusView> {
        let active = self.active.read().await.get(&id).cloned();
        if let Some(active) = active {
            return Ok(active.view().await);
        }
        if let Some(view) = self.history.read().await.get(&id) {
            return Ok(view.clone());
        }
        if let Some(view) = self.admission.queued_view(&id).await {
            return Ok(view);
        }
        // Drained after the first registry read; the read below waits out
        // the drain's registration.
        if let Some(active) = self.registered_session(&id).await {
            return Ok(active.view().await);
        }
        match self.repository.load_master(id).await {
            Ok(Some(master)) => return Ok(StatusView::from_master(&master)),
            Ok(None) => {}
            Err(err) => warn!(
                target: "scanflow::admission",
                orchestration_id = %id,
                error = %err,
                "repository lookup failed"
            ),
        }
        Err(OrchestrationError::NotFound(id.to_string()))
    }

    async fn registered_session(&self, id: &OrchestrationId) -> Option<Arc<ActiveOrchestration>> {
        self.admission.session(id).await?;
        self.active.read().await.get(id).cloned()
    }

    async fn cancel(self: &Arc<Self>, id: OrchestrationId, mode: CancelMode) -> Result<CancelResult> {
        let active = self.active.read().await.get(&id).cloned();
        if let Some(active) = active {
            return Ok(self.cancel_active(active, mode).await);
        }

        if let Some(entry) = self.admission.remove_queued(&id).await {
            let now = Utc::now();
            let mut view = StatusView::queued(&entry, 0);
            view.status = OrchestrationStatus::Cancelled;
            view.queue_position = None;
            view.waiting_on = None;
            view.completed_at = Some(now);
            view.terminal_reason = Some("cancelled while queued".into());
            self.history.write().await.insert(view);
            self.publish(
                entry.request.correlation_id,
                Some(id),
                OrchestrationEventPayload::Terminal {
                    orchestration_id: id,
                    status: OrchestrationStatus::Cancelled,
                    success_rate: None,
                    resources_released: ResourceRequirements::new(),
                },
            )
            .await;
            info!(target: "scanflow::queue", orchestration_id = %id, "queued orchestration cancelled");
            self.queue_wake.notify_one();
            return Ok(CancelResult {
                orchestration_id: id,
                outcome: CancelOutcome::RemovedFromQueue,
                resources_released: ResourceRequirements::new(),
            });
        }

        if let Some(active) = self.registered_session(&id).await {
            return Ok(self.cancel_active(active, mode).await);
        }

        if let Some(view) = self.history.read().await.get(&id) {
            return Ok(CancelResult {
                orchestration_id: id,
                outcome: CancelOutcome::AlreadyTerminal(view.status),
                resources_released: ResourceRequirements::new(),
            });
        }
        Err(OrchestrationError::NotFound(id.to_string()))
    }

    async fn cancel_active(self: &Arc<Self>, active: Arc<ActiveOrchestration>, mode: CancelMode) -> CancelResult {
        let id = active.id();
        match mode {
            CancelMode::Immediate => active.interrupt(),
            CancelMode::Graceful => {
                active.stop_scheduling();
                let mut status = active.subscribe_status();
                let timeout = self.config.execution.graceful_cancel_timeout();
                if tokio::time::timeout(timeout, status.wait_for(|s| s.is_terminal()))
                    .await
                    .is_err()
                {
                    debug!(
                        target: "scanflow::executor",
                        orchestration_id = %id,
                        timeout_ms = timeout.as_millis() as u64,
                        "graceful cancel timed out; detaching in-flight stages"
                    );
                }
            }
        }

        let won = self
            .finalize(
                &active,
                OrchestrationStatus::Cancelled,
                Some(format!("cancelled ({mode:?})").to_lowercase()),
            )
            .await;

        let final_status = active.master().lock().await.status;
        let outcome = if won || final_status == OrchestrationStatus::Cancelled {
            CancelOutcome::Cancelled
        } else {
            CancelOutcome::AlreadyTerminal(final_status)
        };
        let resources_released = match outcome {
            CancelOutcome::Cancelled => active.reservation.amounts.clone(),
            _ => ResourceRequirements::new(),
        };
        CancelResult {
            orchestration_id: id,
            outcome,
            resources_released,
        }
    }

    async fn list_active(&self, filter: &ListFilter) -> Vec<StatusView> {
        let running: Vec<Arc<ActiveOrchestration>> =
            self.active.read().await.values().cloned().collect();
        let mut views = Vec::with_capacity(running.len());
        for active in running {
            let view = active.view().await;
            if !view.is_terminal() && filter.matches(&view) {
                views.push(view);
            }
        }
        views.sort_by_key(|view| (view.submitted_at, view.orchestration_id));
        if filter.include_queued {
            views.extend(
                self.admission
                    .queued_views()
                    .await
                    .into_iter()
                    .filter(|view| filter.matches(view)),
            );
        }
        views
    }

    async fn sample(&self) -> Result<(PoolSnapshot, UtilizationSample)> {
        let snapshot = self.pools.snapshot().await?;
        let queue_depth = self.admission.queue_depth().await;
        let active = self.active.read().await.len();
        let sample = UtilizationSample::from_snapshot(&snapshot, queue_depth, active);
        self.utilization.lock().await.push(sample.clone());
        Ok((snapshot, sample))
    }

    async fn optimize(&self, scope: OptimizationScope) -> Result<OptimizationReport> {
        if self.utilization.lock().await.is_empty() {
            self.sample().await?;
        }
        let now = Utc::now();
        let history = self.utilization.lock().await.clone();
        let threshold = self.pools.utilization_threshold().await;
        let queue = self.admission.queue_summary(now).await;
        let starvation_after = self.admission.aging_window() * 2;

        let mut report = self
            .optimizer
            .analyze(scope, &history, threshold, &queue, starvation_after, now);

        if self.optimizer.autonomous() {
            for recommendation in &report.recommendations {
                let applied = match &recommendation.action {
                    RecommendedAction::AdjustUtilizationThreshold { to, .. } => {
                        self.pools.set_utilization_threshold(*to).await?;
                        true
                    }
                    RecommendedAction::PromoteQueued {
                        orchestration_id, ..
                    } => self.admission.promote(orchestration_id, now).await.is_some(),
                    RecommendedAction::IncreaseCapacity { .. } => false,
                };
                if applied {
                    info!(
                        target: "scanflow::monitor",
                        action = ?recommendation.action,
                        "applied optimization"
                    );
                    report.applied_actions.push(recommendation.action.clone());
                }
            }
            report.applied = !report.applied_actions.is_empty();
            if report.applied {
                self.queue_wake.notify_one();
            }
        }

        if !report.recommendations.is_empty() {
            self.publish(
                None,
                None,
                OrchestrationEventPayload::OptimizationProposed {
                    recommendations: report.recommendations.clone(),
                    applied: report.applied,
                },
            )
            .await;
        }
        Ok(report)
    }

    async fn health_tick(self: Arc<Self>) -> Result<()> {
        let now = Utc::now();
        let running: Vec<Arc<ActiveOrchestration>> =
            self.active.read().await.values().cloned().collect();
        for active in running {
            if active.is_terminal() {
                continue;
            }
            let max = active
                .request
                .max_duration()
                .unwrap_or_else(|| self.config.execution.default_max_execution());
            let started = active.started_at().await;
            let Some(reason) = overdue_reason(started, max, active.request.deadline, now) else {
                continue;
            };
            warn!(
                target: "scanflow::monitor",
                orchestration_id = %active.id(),
                reason = %reason,
                "forcing overdue orchestration to failed"
            );
            if self
                .finalize(&active, OrchestrationStatus::Failed, Some(format!("timed out: {reason}")))
                .await
            {
                self.telemetry
                    .increment("scanflow_orchestration_timeouts_total", vec![])
                    .await;
                let alert = Alert::new(
                    AlertSeverity::Warning,
                    "health",
                    format!("orchestration {} timed out: {reason}", active.id()),
                );
                if let Err(err) = self.alerts.notify(alert).await {
                    warn!(target: "scanflow::monitor", error = %err, "alert sink failed");
                }
            }
        }
        Ok(())
    }

    async fn queue_tick(self: Arc<Self>) -> Result<()> {
        let now = Utc::now();
        self.admission.promote_aged(now).await;
        self.drain_queue().await
    }

    async fn metrics_tick(self: Arc<Self>) -> Result<()> {
        let (snapshot, sample) = self.sample().await?;
        for kind in ResourceType::ALL {
            let utilization = snapshot.utilization(kind);
            self.telemetry
                .gauge(
                    "scanflow_pool_utilization",
                    utilization,
                    vec![("resource", kind.to_string())],
                )
                .await;
            if utilization >= self.config.monitor.alert_utilization {
                let alert = Alert::new(
                    AlertSeverity::Warning,
                    "metrics",
                    format!("{kind} utilization at {:.0}%", utilization * 100.0),
                )
                .with_value(utilization);
                if let Err(err) = self.alerts.notify(alert).await {
                    warn!(target: "scanflow::monitor", error = %err, "alert sink failed");
                }
            }
        }
        self.telemetry
            .gauge("scanflow_queue_depth", sample.queue_depth as f64, vec![])
            .await;
        self.telemetry
            .gauge("scanflow_active_orchestrations", sample.active as f64, vec![])
            .await;

        let running: Vec<Arc<ActiveOrchestration>> =
            self.active.read().await.values().cloned().collect();
        for active in running {
            let progress = active.master().lock().await.completion_percentage / 100.0;
            self.telemetry
                .gauge(
                    "scanflow_orchestration_progress",
                    progress,
                    vec![("orchestration_id", active.id().to_string())],
                )
                .await;
        }

        if let Err(err) = self.repository.record_pool_snapshot(&snapshot).await {
            warn!(target: "scanflow::monitor", error = %err, "failed to persist pool snapshot");
        }
        Ok(())
    }

    async fn optimization_tick(self: Arc<Self>) -> Result<()> {
        let report = self.optimize(OptimizationScope::All).await?;
        if !report.recommendations.is_empty() {
            info!(
                target: "scanflow::monitor",
                recommendations = report.recommendations.len(),
                applied = report.applied,
                "optimization pass finished"
            );
        }
        Ok(())
    }
}

/// Executor task for one run. Boxed because `finalize` drains the queue,
/// which spawns further runs.
fn supervise_run(
    inner: Arc<RuntimeInner>,
    active: Arc<ActiveOrchestration>,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
        let outcome = AssertUnwindSafe(inner.executor.run(Arc::clone(&active)))
            .catch_unwind()
            .await;
        let (status, reason) = match outcome {
            Ok(outcome) => (outcome.status, outcome.reason),
            Err(_) => (
                OrchestrationStatus::Failed,
                Some("executor panicked".to_string()),
            ),
        };
        inner.finalize(&active, status, reason).await;
    })
}

/// Wires the coordinator. Only the stage handler registry is mandatory; every
/// other collaborator falls back to its in-process default.
pub struct OrchestratorRuntimeBuilder {
    config: OrchestratorConfig,
    pools: Option<Arc<dyn ResourcePoolManager>>,
    handlers: Option<StageHandlerRegistry>,
    lookups: Option<Arc<dyn ValidationLookups>>,
    rate_limiter: Option<Arc<dyn RateLimiter>>,
    events: Option<Arc<dyn OrchestrationEventPublisher>>,
    telemetry: Option<Arc<dyn TelemetrySink>>,
    alerts: Option<Arc<dyn AlertSink>>,
    repository: Option<Arc<dyn OrchestrationRepository>>,
    scoring: Option<Arc<dyn ScoringStrategy>>,
}

impl fmt::Debug for OrchestratorRuntimeBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrchestratorRuntimeBuilder")
            .field("config", &self.config)
            .field("handlers", &self.handlers)
            .field("custom_pools", &self.pools.is_some())
            .field("custom_events", &self.events.is_some())
            .finish()
    }
}

impl OrchestratorRuntimeBuilder {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            pools: None,
            handlers: None,
            lookups: None,
            rate_limiter: None,
            events: None,
            telemetry: None,
            alerts: None,
            repository: None,
            scoring: None,
        }
    }

    pub fn with_pools(mut self, pools: Arc<dyn ResourcePoolManager>) -> Self {
        self.pools = Some(pools);
        self
    }

    pub fn with_handlers(mut self, handlers: StageHandlerRegistry) -> Self {
        self.handlers = Some(handlers);
        self
    }

    pub fn with_lookups(mut self, lookups: Arc<dyn ValidationLookups>) -> Self {
        self.lookups = Some(lookups);
        self
    }

    pub fn with_rate_limiter(mut self, rate_limiter: Arc<dyn RateLimiter>) -> Self {
        self.rate_limiter = Some(rate_limiter);
        self
    }

    /// Replaces the in-process bus; `subscribe_events` then returns `None`.
    pub fn with_event_publisher(mut self, events: Arc<dyn OrchestrationEventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn with_alerts(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    pub fn with_repository(mut self, repository: Arc<dyn OrchestrationRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn with_scoring(mut self, scoring: Arc<dyn ScoringStrategy>) -> Self {
        self.scoring = Some(scoring);
        self
    }

    pub fn build(self) -> Result<OrchestratorRuntime> {
        let handlers = self
            .handlers
            .ok_or_else(|| OrchestrationError::Internal("stage handler registry missing".into()))?;
        if handlers.is_empty() {
            return Err(OrchestrationError::Internal(
                "stage handler registry is empty".into(),
            ));
        }
        let handlers = Arc::new(handlers);
        let config = self.config;

        let pools = self.pools.unwrap_or_else(|| {
            Arc::new(InMemoryResourcePools::new(
                config.resources.clone(),
                config.admission.utilization_threshold,
            ))
        });
        let lookups = self
            .lookups
            .unwrap_or_else(|| Arc::new(StaticValidationLookups::permissive()));
        let rate_limiter = self.rate_limiter.unwrap_or_else(|| Arc::new(NoopRateLimiter));
        let (events, bus): (Arc<dyn OrchestrationEventPublisher>, _) = match self.events {
            Some(events) => (events, None),
            None => {
                let bus = Arc::new(InProcEventBus::new(config.events.channel_capacity));
                (bus.clone(), Some(bus))
            }
        };
        let telemetry = self.telemetry.unwrap_or_else(|| Arc::new(TracingTelemetry));
        let alerts = self.alerts.unwrap_or_else(|| Arc::new(TracingAlertSink));
        let repository = self.repository.unwrap_or_else(|| {
            Arc::new(InMemoryOrchestrationRepository::new(
                config.monitor.history_samples,
            ))
        });
        let scoring = self.scoring.unwrap_or_else(|| Arc::new(HeuristicScoring));

        let admission = AdmissionController::new(
            &config,
            Arc::clone(&pools),
            lookups,
            rate_limiter,
            Arc::clone(&handlers),
        );
        let executor = StageExecutor::new(
            handlers,
            Arc::clone(&pools),
            Arc::clone(&events),
            Arc::clone(&telemetry),
            Arc::clone(&repository),
            config.execution.clone(),
            config.retry,
        );
        let optimizer = ResourceOptimizer::new(config.monitor.clone(), scoring);

        Ok(OrchestratorRuntime {
            inner: Arc::new(RuntimeInner {
                utilization: Mutex::new(UtilizationHistory::new(config.monitor.history_samples)),
                history: RwLock::new(TerminalHistory::new(config.events.history_capacity)),
                config,
                pools,
                admission,
                executor,
                events,
                bus,
                telemetry,
                alerts,
                repository,
                optimizer,
                active: RwLock::new(HashMap::new()),
                tracker: TaskTracker::new(),
                shutdown: CancellationToken::new(),
                queue_wake: Notify::new(),
                started: AtomicBool::new(false),
                loop_errors: AtomicU64::new(0),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::collaborators::{InMemoryTelemetry, RecordingAlertSink};
    use crate::orchestration::dispatcher::{StageHandler, StageInvocation};
    use crate::orchestration::stage::{StageDefinition, StageOutcome, StageType};
    use async_trait::async_trait;

    struct Sleepy(Duration);

    #[async_trait]
    impl StageHandler for Sleepy {
        fn stage_type(&self) -> StageType {
            StageType::DataSourceScan
        }

        async fn execute(&self, invocation: StageInvocation) -> Result<StageOutcome> {
            tokio::select! {
                _ = invocation.cancel.cancelled() => Ok(StageOutcome::failure("interrupted")),
                _ = tokio::time::sleep(self.0) => Ok(StageOutcome::success(serde_json::Value::Null)),
            }
        }
    }

    fn fast_config() -> OrchestratorConfig {
        let mut config = OrchestratorConfig::default();
        config.monitor.health_interval_ms = 10;
        config.monitor.queue_interval_ms = 10;
        config.monitor.metrics_interval_ms = 10;
        config.monitor.optimization_interval_ms = 10;
        config.admission.utilization_threshold = 1.0;
        config
    }

    fn runtime(config: OrchestratorConfig, delay: Duration) -> OrchestratorRuntime {
        OrchestratorRuntime::builder(config)
            .with_handlers(StageHandlerRegistry::new().with_handler(Arc::new(Sleepy(delay))))
            .build()
            .unwrap()
    }

    fn request() -> OrchestrationRequest {
        OrchestrationRequest::new("t")
            .with_stage(StageDefinition::new("scan", StageType::DataSourceScan))
    }

    async fn wait_terminal(runtime: &OrchestratorRuntime, id: OrchestrationId) -> StatusView {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let view = runtime.get_status(id).await.unwrap();
                if view.is_terminal() {
                    return view;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap()
    }

    #[test]
    fn builder_requires_handlers() {
        let err = OrchestratorRuntime::builder(OrchestratorConfig::default())
            .build()
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::Internal(_)));
    }

    #[test]
    fn history_evicts_oldest() {
        let mut history = TerminalHistory::new(2);
        let views: Vec<StatusView> = (0..3)
            .map(|_| {
                let entry_request = request();
                let plan = crate::orchestration::planner::DependencyPlanner::new()
                    .plan(&entry_request)
                    .unwrap();
                let entry = crate::orchestration::queue::PendingQueueEntry::new(
                    Arc::new(entry_request),
                    Arc::new(plan),
                    ResourceRequirements::new(),
                    crate::orchestration::queue::WaitReason::Resources,
                    Utc::now(),
                );
                StatusView::queued(&entry, 1)
            })
            .collect();
        for view in &views {
            history.insert(view.clone());
        }
        assert!(history.get(&views[0].orchestration_id).is_none());
        assert!(history.get(&views[2].orchestration_id).is_some());
    }

    #[tokio::test]
    async fn immediate_cancel_releases_everything() {
        let runtime = runtime(fast_config(), Duration::from_secs(30));
        let submitted = runtime.submit(request()).await.unwrap();
        let id = submitted.orchestration_id();
        assert!(submitted.is_executing());

        let result = runtime.cancel(id, CancelMode::Immediate).await.unwrap();
        assert_eq!(result.outcome, CancelOutcome::Cancelled);
        assert!(!result.resources_released.is_empty());

        let snapshot = runtime.pool_snapshot().await.unwrap();
        assert!(snapshot.pools.values().all(|p| p.allocated + p.reserved == 0));
        let view = runtime.get_status(id).await.unwrap();
        assert_eq!(view.status, OrchestrationStatus::Cancelled);

        let again = runtime.cancel(id, CancelMode::Immediate).await.unwrap();
        assert_eq!(
            again.outcome,
            CancelOutcome::AlreadyTerminal(OrchestrationStatus::Cancelled)
        );
        runtime.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn health_loop_fails_overdue_runs() {
        let alerts = RecordingAlertSink::new();
        let runtime = OrchestratorRuntime::builder(fast_config())
            .with_handlers(
                StageHandlerRegistry::new().with_handler(Arc::new(Sleepy(Duration::from_secs(30)))),
            )
            .with_alerts(Arc::new(alerts.clone()))
            .build()
            .unwrap();
        runtime.start().await.unwrap();

        let mut req = request();
        req.max_duration_secs = Some(0);
        let id = runtime.submit(req).await.unwrap().orchestration_id();
        let view = wait_terminal(&runtime, id).await;
        assert_eq!(view.status, OrchestrationStatus::Failed);
        assert!(view.terminal_reason.unwrap().contains("timed out"));
        assert!(!alerts.alerts().await.is_empty());
        runtime.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn metrics_loop_feeds_telemetry() {
        let telemetry = InMemoryTelemetry::new();
        let runtime = OrchestratorRuntime::builder(fast_config())
            .with_handlers(
                StageHandlerRegistry::new().with_handler(Arc::new(Sleepy(Duration::from_millis(1)))),
            )
            .with_telemetry(Arc::new(telemetry.clone()))
            .build()
            .unwrap();
        runtime.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(telemetry.last_gauge("scanflow_queue_depth").await, Some(0.0));
        assert_eq!(runtime.loop_error_count(), 0);
        runtime.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn autonomous_optimizer_raises_blocking_threshold() {
        let mut config = fast_config();
        config.resources.cpu = 100;
        config.admission.utilization_threshold = 0.5;
        config.monitor.autonomous_mode = true;
        let runtime = runtime(config, Duration::from_secs(30));

        let hint = ResourceRequirements::new().with(ResourceType::Cpu, 60);
        runtime.submit(request().with_resources(hint.clone())).await.unwrap();
        let second = runtime.submit(request().with_resources(hint.with(ResourceType::Cpu, 10))).await.unwrap();
        assert!(matches!(second, SubmitResult::Queued { position: 1, .. }));

        let report = runtime
            .optimize_resources(Some(OptimizationScope::Resource(ResourceType::Cpu)))
            .await
            .unwrap();
        assert!(report.applied);
        assert!(matches!(
            report.applied_actions[0],
            RecommendedAction::AdjustUtilizationThreshold { .. }
        ));
        assert!(runtime.pool_snapshot().await.unwrap().utilization_threshold > 0.5);
        runtime.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn supervised_optimizer_only_recommends() {
        let mut config = fast_config();
        config.admission.utilization_threshold = 0.5;
        let runtime = runtime(config, Duration::from_secs(30));
        let hint = ResourceRequirements::new().with(ResourceType::Cpu, 60);
        runtime.submit(request().with_resources(hint.clone())).await.unwrap();
        runtime.submit(request().with_resources(hint)).await.unwrap();

        let report = runtime.optimize_resources(None).await.unwrap();
        assert!(!report.applied);
        assert!(!report.recommendations.is_empty());
        assert_eq!(runtime.pool_snapshot().await.unwrap().utilization_threshold, 0.5);
        runtime.shutdown().await.unwrap();
    }
}
