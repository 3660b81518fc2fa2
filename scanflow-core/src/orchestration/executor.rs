//! Walks an admitted orchestration's plan, invoking stage handlers outside of
//! every coordinator lock and recording results on the master record.

use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::admission::{AdmittedOrchestration, effective_parallelism};
use super::collaborators::TelemetrySink;
use super::config::{ExecutionConfig, RetryConfig};
use super::dispatcher::{StageHandler, StageHandlerRegistry, StageInvocation};
use super::events::{OrchestrationEvent, OrchestrationEventPayload, OrchestrationEventPublisher};
use super::master::{OrchestrationMaster, OrchestrationStatus};
use super::persistence::OrchestrationRepository;
use super::planner::ExecutionPlan;
use super::request::OrchestrationRequest;
use super::resources::{ResourcePoolManager, ResourceReservation};
use super::stage::{StageDefinition, StageOutcome, StageStatus};
use super::status::StatusView;
use crate::types::ids::{OrchestrationId, SessionId};

/// Live handle for an admitted orchestration, shared by the executor, the
/// coordinator and the monitor loops.
pub struct ActiveOrchestration {
    pub request: Arc<OrchestrationRequest>,
    pub plan: Arc<ExecutionPlan>,
    pub session_id: SessionId,
    pub reservation: ResourceReservation,
    pub admitted_at: DateTime<Utc>,
    master: Mutex<OrchestrationMaster>,
    /// Stops scheduling new stages and retries.
    stop: CancellationToken,
    /// Parent of every handler token; implies `stop`.
    interrupt: CancellationToken,
    terminal: AtomicBool,
    status_tx: watch::Sender<OrchestrationStatus>,
}

impl fmt::Debug for ActiveOrchestration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveOrchestration")
            .field("id", &self.request.id)
            .field("session_id", &self.session_id)
            .field("status", &*self.status_tx.borrow())
            .field("terminal", &self.terminal.load(Ordering::Acquire))
            .finish()
    }
}

impl ActiveOrchestration {
    pub fn new(admitted: AdmittedOrchestration, parent: &CancellationToken) -> Self {
        let master = OrchestrationMaster::new(
            &admitted.request,
            &admitted.plan,
            admitted.session_id,
            admitted.reservation.amounts.clone(),
            admitted.submitted_at,
            admitted.admitted_at,
        );
        let interrupt = parent.child_token();
        let stop = interrupt.child_token();
        let (status_tx, _) = watch::channel(OrchestrationStatus::Pending);
        Self {
            request: admitted.request,
            plan: admitted.plan,
            session_id: admitted.session_id,
            reservation: admitted.reservation,
            admitted_at: admitted.admitted_at,
            master: Mutex::new(master),
            stop,
            interrupt,
            terminal: AtomicBool::new(false),
            status_tx,
        }
    }

    pub fn id(&self) -> OrchestrationId {
        self.request.id
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal.load(Ordering::Acquire)
    }

    /// Single terminal-transition guard. Exactly one caller wins.
    pub fn try_begin_terminal(&self) -> bool {
        self.terminal
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Graceful: no new stages, in-flight handlers keep running.
    pub fn stop_scheduling(&self) {
        self.stop.cancel();
    }

    /// Immediate: also signals every in-flight handler.
    pub fn interrupt(&self) {
        self.interrupt.cancel();
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub fn status(&self) -> OrchestrationStatus {
        *self.status_tx.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<OrchestrationStatus> {
        self.status_tx.subscribe()
    }

    pub(crate) fn publish_status(&self, status: OrchestrationStatus) {
        self.status_tx.send_replace(status);
    }

    pub(crate) fn master(&self) -> &Mutex<OrchestrationMaster> {
        &self.master
    }

    /// When the run actually started, or admission time before that.
    pub async fn started_at(&self) -> DateTime<Utc> {
        self.master
            .lock()
            .await
            .actual_start
            .unwrap_or(self.admitted_at)
    }

    pub async fn view(&self) -> StatusView {
        StatusView::from_master(&*self.master.lock().await)
    }
}

/// How a run ended from the executor's point of view.
#[derive(Clone, Debug, PartialEq)]
pub struct RunOutcome {
    pub status: OrchestrationStatus,
    pub reason: Option<String>,
}

struct StageRun {
    stage_id: String,
    outcome: StageOutcome,
    attempts: u32,
}

pub struct StageExecutor {
    handlers: Arc<StageHandlerRegistry>,
    pools: Arc<dyn ResourcePoolManager>,
    events: Arc<dyn OrchestrationEventPublisher>,
    telemetry: Arc<dyn TelemetrySink>,
    repository: Arc<dyn OrchestrationRepository>,
    execution: ExecutionConfig,
    retry: RetryConfig,
}

impl fmt::Debug for StageExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageExecutor")
            .field("handlers", &self.handlers)
            .field("max_parallel_stages", &self.execution.max_parallel_stages)
            .field("retry", &self.retry)
            .finish()
    }
}

impl StageExecutor {
    pub fn new(
        handlers: Arc<StageHandlerRegistry>,
        pools: Arc<dyn ResourcePoolManager>,
        events: Arc<dyn OrchestrationEventPublisher>,
        telemetry: Arc<dyn TelemetrySink>,
        repository: Arc<dyn OrchestrationRepository>,
        execution: ExecutionConfig,
        retry: RetryConfig,
    ) -> Self {
        Self {
            handlers,
            pools,
            events,
            telemetry,
            repository,
            execution,
            retry,
        }
    }

    async fn publish(&self, active: &ActiveOrchestration, payload: OrchestrationEventPayload) {
        let event = OrchestrationEvent::new(active.request.correlation_id, Some(active.id()), payload);
        if let Err(err) = self.events.publish(event).await {
            debug!(target: "scanflow::executor", error = %err, "event publish failed");
        }
    }

    async fn advance(&self, active: &ActiveOrchestration, next: OrchestrationStatus) -> bool {
        let advanced = active.master().lock().await.advance(next, Utc::now());
        if advanced {
            active.publish_status(next);
        }
        advanced
    }

    /// Drives the orchestration to the end of its plan. Does not perform the
    /// terminal transition; the caller owns that.
    #[tracing::instrument(
        target = "scanflow::executor",
        skip_all,
        fields(orchestration_id = %active.id(), session_id = %active.session_id)
    )]
    pub async fn run(&self, active: Arc<ActiveOrchestration>) -> RunOutcome {
        if active.is_stopping() || !self.advance(&active, OrchestrationStatus::Planning).await {
            return RunOutcome {
                status: OrchestrationStatus::Cancelled,
                reason: Some("cancelled before planning".into()),
            };
        }
        self.publish(
            &active,
            OrchestrationEventPayload::Planned {
                orchestration_id: active.id(),
                order: active.plan.order().into_iter().map(str::to_owned).collect(),
                critical_path_secs: active.plan.critical_path.estimated_duration_secs,
            },
        )
        .await;

        if let Err(err) = self.pools.commit(&active.reservation).await {
            return RunOutcome {
                status: OrchestrationStatus::Failed,
                reason: Some(format!("could not commit reservation: {err}")),
            };
        }
        if active.is_stopping() || !self.advance(&active, OrchestrationStatus::Running).await {
            return RunOutcome {
                status: OrchestrationStatus::Cancelled,
                reason: Some("cancelled before start".into()),
            };
        }
        info!(
            target: "scanflow::executor",
            stages = active.plan.len(),
            mode = ?active.request.execution_mode,
            "orchestration running"
        );

        let aborted = self.run_stages(&active).await;

        if let Some(reason) = aborted {
            return RunOutcome {
                status: OrchestrationStatus::Failed,
                reason: Some(reason),
            };
        }
        if active.is_stopping() {
            return RunOutcome {
                status: OrchestrationStatus::Cancelled,
                reason: Some("cancellation requested".into()),
            };
        }
        let status = active
            .master()
            .lock()
            .await
            .settle_status(self.execution.success_threshold);
        RunOutcome {
            status,
            reason: None,
        }
    }

    /// Launches ready stages in plan order, up to the parallelism bound.
    /// Returns the abort reason if a critical stage failed.
    async fn run_stages(&self, active: &Arc<ActiveOrchestration>) -> Option<String> {
        let limit = effective_parallelism(&active.request, &self.execution);
        let mut progress: HashMap<String, StageStatus> = active
            .plan
            .stages
            .iter()
            .map(|planned| (planned.stage.id.clone(), StageStatus::Pending))
            .collect();
        let mut in_flight = FuturesUnordered::new();
        let mut aborted: Option<String> = None;

        loop {
            if aborted.is_none() && !active.is_stopping() {
                for planned in &active.plan.stages {
                    let id = &planned.stage.id;
                    if progress.get(id) != Some(&StageStatus::Pending) {
                        continue;
                    }
                    let blocked_by = planned.predecessors.iter().find(|pred| {
                        matches!(
                            progress.get(*pred),
                            Some(StageStatus::Failed | StageStatus::Skipped)
                        )
                    });
                    if let Some(pred) = blocked_by {
                        let reason = format!("predecessor '{pred}' did not complete");
                        self.skip_stage(active, id, &reason).await;
                        progress.insert(id.clone(), StageStatus::Skipped);
                        continue;
                    }
                    let ready = planned
                        .predecessors
                        .iter()
                        .all(|pred| progress.get(pred) == Some(&StageStatus::Completed));
                    if !ready || in_flight.len() >= limit {
                        continue;
                    }
                    progress.insert(id.clone(), StageStatus::Running);
                    let run = self.launch(active, &planned.stage).await;
                    in_flight.push(run);
                }
            }

            let Some(run) = in_flight.next().await else {
                break;
            };
            let failed_critical = self.record(active, &run).await;
            let status = if run.outcome.success {
                StageStatus::Completed
            } else {
                StageStatus::Failed
            };
            progress.insert(run.stage_id.clone(), status);
            if failed_critical && aborted.is_none() {
                warn!(
                    target: "scanflow::executor",
                    stage = %run.stage_id,
                    "critical stage failed; aborting orchestration"
                );
                aborted = Some(format!(
                    "critical stage '{}' failed: {}",
                    run.stage_id,
                    run.outcome.errors.join("; ")
                ));
                active.stop_scheduling();
            }
        }

        aborted
    }

    async fn skip_stage(&self, active: &ActiveOrchestration, stage_id: &str, reason: &str) {
        active
            .master()
            .lock()
            .await
            .mark_stage_skipped(stage_id, reason, Utc::now());
        debug!(target: "scanflow::executor", stage = %stage_id, reason, "stage skipped");
        self.publish(
            active,
            OrchestrationEventPayload::StageSkipped {
                orchestration_id: active.id(),
                stage_id: stage_id.to_string(),
                reason: reason.to_string(),
            },
        )
        .await;
    }

    async fn launch(
        &self,
        active: &Arc<ActiveOrchestration>,
        stage: &StageDefinition,
    ) -> impl Future<Output = StageRun> + Send + 'static {
        active
            .master()
            .lock()
            .await
            .mark_stage_running(&stage.id, Utc::now());
        self.publish(
            active,
            OrchestrationEventPayload::StageStarted {
                orchestration_id: active.id(),
                stage_id: stage.id.clone(),
                stage_type: stage.stage_type,
                attempt: 1,
            },
        )
        .await;

        let handler = self.handlers.get(stage.stage_type);
        let timeout = stage
            .timeout()
            .unwrap_or_else(|| self.execution.default_stage_timeout());
        let invocation = StageInvocation {
            orchestration_id: active.id(),
            stage: stage.clone(),
            data_source_ids: active.request.data_source_ids.clone(),
            rule_ids: active.request.rule_ids.clone(),
            attempt: 1,
            cancel: active.interrupt.child_token(),
        };
        let stop = active.stop.clone();
        let interrupt = active.interrupt.clone();
        let retry = self.retry;

        async move {
            let stage_id = invocation.stage.id.clone();
            let Some(handler) = handler else {
                return StageRun {
                    stage_id,
                    outcome: StageOutcome::failure("no handler registered"),
                    attempts: 0,
                };
            };
            let (outcome, attempts) =
                invoke_with_retries(handler, invocation, timeout, retry, stop, interrupt).await;
            StageRun {
                stage_id,
                outcome,
                attempts,
            }
        }
    }

    /// Writes a finished stage to the master record. Returns true when a
    /// critical stage failed.
    async fn record(&self, active: &ActiveOrchestration, run: &StageRun) -> bool {
        let (execution, critical) = {
            let mut master = active.master().lock().await;
            master.record_stage_result(&run.stage_id, run.outcome.clone(), run.attempts, Utc::now());
            let execution = master.stage(&run.stage_id).cloned();
            let critical = execution.as_ref().is_some_and(|e| e.critical);
            (execution, critical)
        };
        let stage_type = execution
            .as_ref()
            .map(|e| e.stage_type.to_string())
            .unwrap_or_default();

        if let Some(execution) = &execution
            && let Err(err) = self.repository.upsert_stage_execution(execution).await
        {
            warn!(target: "scanflow::executor", error = %err, "failed to persist stage execution");
        }

        if run.outcome.success {
            let duration_ms = execution.as_ref().and_then(|e| e.duration_ms).unwrap_or(0);
            self.telemetry
                .histogram(
                    "scanflow_stage_duration_ms",
                    duration_ms as f64,
                    vec![("stage_type", stage_type)],
                )
                .await;
            self.publish(
                active,
                OrchestrationEventPayload::StageCompleted {
                    orchestration_id: active.id(),
                    stage_id: run.stage_id.clone(),
                    duration_ms,
                },
            )
            .await;
            false
        } else {
            warn!(
                target: "scanflow::executor",
                stage = %run.stage_id,
                critical,
                attempts = run.attempts,
                errors = ?run.outcome.errors,
                "stage failed"
            );
            self.telemetry
                .increment(
                    "scanflow_stage_failures_total",
                    vec![("stage_type", stage_type), ("critical", critical.to_string())],
                )
                .await;
            self.publish(
                active,
                OrchestrationEventPayload::StageFailed {
                    orchestration_id: active.id(),
                    stage_id: run.stage_id.clone(),
                    critical,
                    errors: run.outcome.errors.clone(),
                },
            )
            .await;
            critical
        }
    }
}

/// Calls the handler until it succeeds or runs out of retries. Each attempt
/// is bounded by `timeout`; a panic counts as a failed attempt.
async fn invoke_with_retries(
    handler: Arc<dyn StageHandler>,
    mut invocation: StageInvocation,
    timeout: Duration,
    retry: RetryConfig,
    stop: CancellationToken,
    interrupt: CancellationToken,
) -> (StageOutcome, u32) {
    let max_attempts = invocation.stage.max_retries.saturating_add(1);
    let mut attempt = 1;
    loop {
        invocation.attempt = attempt;
        let token = invocation.cancel.clone();
        let call = AssertUnwindSafe(handler.execute(invocation.clone())).catch_unwind();
        let outcome = match tokio::time::timeout(timeout, call).await {
            Ok(Ok(Ok(outcome))) => outcome,
            Ok(Ok(Err(err))) => StageOutcome::failure(err.to_string()),
            Ok(Err(_panic)) => StageOutcome::failure("stage handler panicked"),
            Err(_) => {
                token.cancel();
                StageOutcome::failure(format!("timed out after {}s", timeout.as_secs()))
            }
        };

        if outcome.success || attempt >= max_attempts || stop.is_cancelled() {
            return (outcome, attempt);
        }

        let delay = retry.delay_for(attempt);
        debug!(
            target: "scanflow::executor",
            stage = %invocation.stage.id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "retrying stage"
        );
        tokio::select! {
            _ = stop.cancelled() => return (outcome, attempt),
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
        invocation.cancel = interrupt.child_token();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{OrchestrationError, Result};
    use crate::orchestration::collaborators::InMemoryTelemetry;
    use crate::orchestration::config::OrchestratorConfig;
    use crate::orchestration::persistence::InMemoryOrchestrationRepository;
    use crate::orchestration::planner::DependencyPlanner;
    use crate::orchestration::request::ExecutionMode;
    use crate::orchestration::resources::{
        InMemoryResourcePools, ReservationOutcome, ResourceRequirements, ResourceType,
    };
    use crate::orchestration::stage::StageType;
    use crate::orchestration::runtime::InProcEventBus;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    /// Fails the stages named in `fail`, succeeds otherwise, and records the
    /// start order.
    struct Scripted {
        fail: Vec<&'static str>,
        started: Arc<std::sync::Mutex<Vec<String>>>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl StageHandler for Scripted {
        fn stage_type(&self) -> StageType {
            StageType::DataSourceScan
        }

        async fn execute(&self, invocation: StageInvocation) -> Result<StageOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.started
                .lock()
                .unwrap()
                .push(invocation.stage.id.clone());
            if invocation.stage.id == "panic" {
                panic!("handler bug");
            }
            if self.fail.contains(&invocation.stage.id.as_str()) {
                return Err(OrchestrationError::StageExecution {
                    stage: invocation.stage.id,
                    message: "scripted failure".into(),
                });
            }
            Ok(StageOutcome::success(serde_json::Value::Null))
        }
    }

    struct Fixture {
        executor: StageExecutor,
        handler: Arc<Scripted>,
        pools: Arc<InMemoryResourcePools>,
    }

    fn fixture(fail: Vec<&'static str>) -> Fixture {
        let handler = Arc::new(Scripted {
            fail,
            started: Arc::new(std::sync::Mutex::new(Vec::new())),
            calls: AtomicU32::new(0),
        });
        let mut registry = StageHandlerRegistry::new();
        registry.register(handler.clone());
        let config = OrchestratorConfig::default();
        let pools = Arc::new(InMemoryResourcePools::new(config.resources.clone(), 1.0));
        let mut retry = config.retry;
        retry.backoff_base_ms = 1;
        retry.backoff_max_ms = 2;
        let executor = StageExecutor::new(
            Arc::new(registry),
            pools.clone(),
            Arc::new(InProcEventBus::new(64)),
            Arc::new(InMemoryTelemetry::new()),
            Arc::new(InMemoryOrchestrationRepository::default()),
            config.execution.clone(),
            retry,
        );
        Fixture {
            executor,
            handler,
            pools,
        }
    }

    async fn activate(fx: &Fixture, request: OrchestrationRequest) -> Arc<ActiveOrchestration> {
        let plan = DependencyPlanner::new().plan(&request).unwrap();
        let footprint = ResourceRequirements::new().with(ResourceType::Cpu, 10);
        let ReservationOutcome::Granted(reservation) =
            fx.pools.reserve(request.id, &footprint).await.unwrap()
        else {
            panic!("reservation denied");
        };
        let now = Utc::now();
        let admitted = AdmittedOrchestration {
            session_id: SessionId::new(),
            request: Arc::new(request),
            plan: Arc::new(plan),
            reservation,
            submitted_at: now,
            admitted_at: now,
        };
        Arc::new(ActiveOrchestration::new(admitted, &CancellationToken::new()))
    }

    fn scan(id: &str) -> StageDefinition {
        StageDefinition::new(id, StageType::DataSourceScan)
    }

    #[tokio::test]
    async fn non_critical_failure_skips_only_its_dependents() {
        let fx = fixture(vec!["B"]);
        let request = OrchestrationRequest::new("warn")
            .with_execution_mode(ExecutionMode::Parallel)
            .with_stage(scan("A"))
            .with_stage(scan("B").depends_on(["A"]))
            .with_stage(scan("C").depends_on(["A"]))
            .with_stage(scan("D").depends_on(["B"]));
        let active = activate(&fx, request).await;

        let outcome = fx.executor.run(active.clone()).await;
        assert_eq!(outcome.status, OrchestrationStatus::CompletedWithWarnings);

        let view = active.view().await;
        let status_of = |id: &str| view.stages.iter().find(|s| s.stage_id == id).unwrap().status;
        assert_eq!(status_of("D"), StageStatus::Skipped);
        assert_eq!(status_of("C"), StageStatus::Completed);
        assert!(!fx.handler.started.lock().unwrap().contains(&"D".to_string()));
    }

    #[tokio::test]
    async fn critical_failure_aborts_transitive_dependents() {
        let fx = fixture(vec!["A"]);
        let request = OrchestrationRequest::new("abort")
            .with_stage(scan("A").critical(true))
            .with_stage(scan("B").depends_on(["A"]))
            .with_stage(scan("C").depends_on(["B"]));
        let active = activate(&fx, request).await;

        let outcome = fx.executor.run(active).await;
        assert_eq!(outcome.status, OrchestrationStatus::Failed);
        assert!(outcome.reason.unwrap().contains("critical stage 'A'"));
        assert_eq!(*fx.handler.started.lock().unwrap(), vec!["A".to_string()]);
    }

    #[tokio::test]
    async fn sequential_runs_follow_plan_order() {
        let fx = fixture(vec![]);
        let request = OrchestrationRequest::new("order")
            .with_stage(scan("load").depends_on(["extract"]))
            .with_stage(scan("extract"))
            .with_stage(scan("report").depends_on(["load"]));
        let active = activate(&fx, request).await;
        let outcome = fx.executor.run(active.clone()).await;
        assert_eq!(outcome.status, OrchestrationStatus::Completed);
        assert_eq!(
            *fx.handler.started.lock().unwrap(),
            active.plan.order().into_iter().map(String::from).collect::<Vec<_>>()
        );
        let cpu = fx.pools.snapshot().await.unwrap().pools[&ResourceType::Cpu].clone();
        assert_eq!((cpu.reserved, cpu.allocated), (0, 10));
    }

    #[tokio::test]
    async fn retries_then_gives_up() {
        let fx = fixture(vec!["flaky"]);
        let request =
            OrchestrationRequest::new("retry").with_stage(scan("flaky").with_retries(2));
        let active = activate(&fx, request).await;
        fx.executor.run(active.clone()).await;
        assert_eq!(fx.handler.calls.load(Ordering::SeqCst), 3);
        assert_eq!(active.view().await.stages[0].attempts, 3);
    }

    #[tokio::test]
    async fn panicking_handler_is_a_stage_failure() {
        let fx = fixture(vec![]);
        let request = OrchestrationRequest::new("panic")
            .with_stage(scan("panic"))
            .with_stage(scan("after"));
        let active = activate(&fx, request).await;
        let outcome = fx.executor.run(active.clone()).await;
        assert_eq!(outcome.status, OrchestrationStatus::CompletedWithWarnings);
        let view = active.view().await;
        assert!(view.stages[0].errors[0].contains("panicked"));
    }

    #[tokio::test]
    async fn stopped_before_start_is_cancelled() {
        let fx = fixture(vec![]);
        let active = activate(&fx, OrchestrationRequest::new("stop").with_stage(scan("A"))).await;
        active.stop_scheduling();
        let outcome = fx.executor.run(active).await;
        assert_eq!(outcome.status, OrchestrationStatus::Cancelled);
        assert!(fx.handler.started.lock().unwrap().is_empty());
    }
}
