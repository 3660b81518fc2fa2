use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, watch};

use scanflow_core::error::{Result, ValidationError};
use scanflow_core::orchestration::{
    CancelMode, CancelOutcome, ExecutionMode, InMemoryOrchestrationRepository, ListFilter,
    OrchestrationEventPayload, OrchestrationMaster, OrchestrationRepository, OrchestrationRequest,
    OrchestrationStatus, OrchestratorConfig, OrchestratorRuntime, PoolSnapshot, Priority,
    ResourceRequirements, ResourceType, StageDefinition, StageExecution, StageHandler,
    StageHandlerRegistry, StageInvocation, StageOutcome, StageStatus, StageType, StatusView,
    SubmitResult, WaitReason,
};
use scanflow_core::types::ids::OrchestrationId;

/// Test handler: fails the stage ids in `fail`, optionally blocks on a gate,
/// and tracks start order and peak concurrency.
struct Harness {
    fail: HashSet<String>,
    gate: watch::Sender<bool>,
    gated: bool,
    started: Mutex<Vec<String>>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl Harness {
    fn new(fail: &[&str], gated: bool) -> Arc<Self> {
        let (gate, _) = watch::channel(false);
        Arc::new(Self {
            fail: fail.iter().map(|s| s.to_string()).collect(),
            gate,
            gated,
            started: Mutex::new(Vec::new()),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    fn open(&self) {
        self.gate.send_replace(true);
    }

    async fn started(&self) -> Vec<String> {
        self.started.lock().await.clone()
    }
}

#[async_trait]
impl StageHandler for Harness {
    fn stage_type(&self) -> StageType {
        StageType::DataSourceScan
    }

    async fn execute(&self, invocation: StageInvocation) -> Result<StageOutcome> {
        self.started.lock().await.push(invocation.stage.id.clone());
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let outcome = if self.gated {
            let mut gate = self.gate.subscribe();
            tokio::select! {
                _ = invocation.cancel.cancelled() => StageOutcome::failure("interrupted"),
                _ = gate.wait_for(|open| *open) => StageOutcome::success(serde_json::Value::Null),
            }
        } else {
            tokio::time::sleep(Duration::from_millis(5)).await;
            StageOutcome::success(serde_json::Value::Null)
        };
        self.running.fetch_sub(1, Ordering::SeqCst);

        if self.fail.contains(&invocation.stage.id) {
            return Ok(StageOutcome::failure(format!("{} failed", invocation.stage.id)));
        }
        Ok(outcome)
    }
}

fn config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.monitor.health_interval_ms = 20;
    config.monitor.queue_interval_ms = 10;
    config.monitor.metrics_interval_ms = 20;
    config.monitor.optimization_interval_ms = 50;
    config.execution.graceful_cancel_timeout_ms = 50;
    config.retry.backoff_base_ms = 1;
    config.retry.backoff_max_ms = 2;
    config
}

async fn runtime(config: OrchestratorConfig, harness: Arc<Harness>) -> OrchestratorRuntime {
    let runtime = OrchestratorRuntime::builder(config)
        .with_handlers(StageHandlerRegistry::new().with_handler(harness))
        .build()
        .expect("runtime builds");
    runtime.start().await.expect("loops start");
    runtime
}

fn scan(id: &str) -> StageDefinition {
    StageDefinition::new(id, StageType::DataSourceScan)
}

fn single(name: &str) -> OrchestrationRequest {
    OrchestrationRequest::new(name).with_stage(scan("scan"))
}

fn cpu(amount: u64) -> ResourceRequirements {
    ResourceRequirements::new().with(ResourceType::Cpu, amount)
}

async fn wait_for<F>(runtime: &OrchestratorRuntime, id: OrchestrationId, done: F) -> StatusView
where
    F: Fn(&StatusView) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(view) = runtime.get_status(id).await
                && done(&view)
            {
                return view;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition reached in time")
}

async fn wait_terminal(runtime: &OrchestratorRuntime, id: OrchestrationId) -> StatusView {
    wait_for(runtime, id, StatusView::is_terminal).await
}

async fn assert_pools_idle(runtime: &OrchestratorRuntime) {
    let snapshot = runtime.pool_snapshot().await.expect("snapshot");
    for pool in snapshot.pools.values() {
        assert_eq!(pool.allocated, 0, "{} still allocated", pool.resource_type);
        assert_eq!(pool.reserved, 0, "{} still reserved", pool.resource_type);
    }
}

#[tokio::test]
async fn non_critical_failure_completes_with_warnings() {
    let harness = Harness::new(&["B"], false);
    let runtime = runtime(config(), harness.clone()).await;
    let mut events = runtime.subscribe_events().expect("in-process bus");

    let request = OrchestrationRequest::new("warnings")
        .with_execution_mode(ExecutionMode::Parallel)
        .with_stage(scan("A"))
        .with_stage(scan("B").depends_on(["A"]))
        .with_stage(scan("C").depends_on(["A"]));
    let submitted = runtime.submit(request).await.expect("submit");
    assert!(submitted.is_executing());

    let view = wait_terminal(&runtime, submitted.orchestration_id()).await;
    assert_eq!(view.status, OrchestrationStatus::CompletedWithWarnings);
    let rate = view.success_rate.expect("rate recorded");
    assert!((rate - 2.0 / 3.0).abs() < 1e-3, "rate was {rate}");
    assert_eq!(view.stages_failed, 1);
    assert!(!view.warnings.is_empty());
    assert_pools_idle(&runtime).await;

    let mut saw_terminal = false;
    while let Ok(event) = events.try_recv() {
        if let OrchestrationEventPayload::Terminal { status, .. } = event.payload {
            assert_eq!(status, OrchestrationStatus::CompletedWithWarnings);
            saw_terminal = true;
        }
    }
    assert!(saw_terminal);
    runtime.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn second_request_waits_for_capacity_then_runs() {
    let harness = Harness::new(&[], true);
    let mut config = config();
    config.resources.cpu = 100;
    let runtime = runtime(config, harness.clone()).await;

    let first = runtime
        .submit(single("first").with_resources(cpu(60)))
        .await
        .expect("submit first");
    let second = runtime
        .submit(single("second").with_resources(cpu(60)))
        .await
        .expect("submit second");
    assert!(first.is_executing());
    assert!(matches!(second, SubmitResult::Queued { position: 1, .. }));

    let queued = runtime
        .get_status(second.orchestration_id())
        .await
        .expect("queued status");
    assert_eq!(queued.status, OrchestrationStatus::Queued);
    assert_eq!(queued.queue_position, Some(1));
    assert_eq!(queued.waiting_on, Some(WaitReason::Resources));

    harness.open();
    let done = wait_terminal(&runtime, first.orchestration_id()).await;
    assert_eq!(done.status, OrchestrationStatus::Completed);

    let admitted = wait_for(&runtime, second.orchestration_id(), |v| v.session_id.is_some()).await;
    assert_ne!(admitted.status, OrchestrationStatus::Queued);
    let finished = wait_terminal(&runtime, second.orchestration_id()).await;
    assert_eq!(finished.status, OrchestrationStatus::Completed);
    assert_pools_idle(&runtime).await;
    runtime.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn critical_failure_never_starts_dependents() {
    let harness = Harness::new(&["A"], false);
    let runtime = runtime(config(), harness.clone()).await;

    let request = OrchestrationRequest::new("critical")
        .with_execution_mode(ExecutionMode::Parallel)
        .with_stage(scan("A").critical(true))
        .with_stage(scan("B").depends_on(["A"]))
        .with_stage(scan("C").depends_on(["B"]))
        .with_stage(scan("D").depends_on(["A", "C"]));
    let id = runtime.submit(request).await.expect("submit").orchestration_id();

    let view = wait_terminal(&runtime, id).await;
    assert_eq!(view.status, OrchestrationStatus::Failed);
    assert_eq!(harness.started().await, vec!["A".to_string()]);
    for stage in view.stages.iter().filter(|s| s.stage_id != "A") {
        assert_eq!(stage.status, StageStatus::Skipped, "{}", stage.stage_id);
    }
    assert_pools_idle(&runtime).await;
    runtime.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn cyclic_plan_is_rejected_without_reserving() {
    let harness = Harness::new(&[], false);
    let runtime = runtime(config(), harness.clone()).await;

    let request = OrchestrationRequest::new("cycle")
        .with_stage(scan("A"))
        .with_stage(scan("B"))
        .with_stage(scan("C"))
        .with_edge("A->B")
        .with_edge("B->C")
        .with_edge("C->A");
    let result = runtime.submit(request).await.expect("submit");

    match result {
        SubmitResult::Rejected {
            reason: ValidationError::CircularDependency { cycle },
            ..
        } => assert_eq!(cycle, vec!["A", "B", "C"]),
        other => panic!("expected a cycle rejection, got {other:?}"),
    }
    assert!(harness.started().await.is_empty());
    assert_pools_idle(&runtime).await;
    runtime.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn cancelling_a_queued_request_removes_it() {
    let harness = Harness::new(&[], true);
    let mut config = config();
    config.resources.cpu = 100;
    let runtime = runtime(config, harness.clone()).await;

    let running = runtime
        .submit(single("running").with_resources(cpu(80)))
        .await
        .expect("submit");
    let queued = runtime
        .submit(single("queued").with_resources(cpu(80)))
        .await
        .expect("submit");
    let queued_id = queued.orchestration_id();

    let result = runtime
        .cancel(queued_id, CancelMode::Graceful)
        .await
        .expect("cancel");
    assert_eq!(result.outcome, CancelOutcome::RemovedFromQueue);
    assert!(result.resources_released.is_empty());

    let view = runtime.get_status(queued_id).await.expect("status");
    assert_eq!(view.status, OrchestrationStatus::Cancelled);
    let active = runtime.list_active(&ListFilter::all()).await;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].orchestration_id, running.orchestration_id());

    harness.open();
    wait_terminal(&runtime, running.orchestration_id()).await;
    runtime.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn graceful_cancel_of_running_work_releases_resources() {
    let harness = Harness::new(&[], true);
    let runtime = runtime(config(), harness.clone()).await;

    let request = OrchestrationRequest::new("long")
        .with_stage(scan("A"))
        .with_stage(scan("B").depends_on(["A"]))
        .with_resources(cpu(30));
    let id = runtime.submit(request).await.expect("submit").orchestration_id();
    wait_for(&runtime, id, |v| v.status == OrchestrationStatus::Running).await;

    let result = runtime.cancel(id, CancelMode::Graceful).await.expect("cancel");
    assert_eq!(result.outcome, CancelOutcome::Cancelled);
    assert_eq!(result.resources_released, cpu(30));

    let view = runtime.get_status(id).await.expect("status");
    assert_eq!(view.status, OrchestrationStatus::Cancelled);
    assert!(!harness.started().await.contains(&"B".to_string()));
    assert_pools_idle(&runtime).await;

    let again = runtime.cancel(id, CancelMode::Immediate).await.expect("cancel");
    assert_eq!(
        again.outcome,
        CancelOutcome::AlreadyTerminal(OrchestrationStatus::Cancelled)
    );
    runtime.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn stages_start_in_dependency_order() {
    let harness = Harness::new(&[], false);
    let runtime = runtime(config(), harness.clone()).await;

    let request = OrchestrationRequest::new("ordered")
        .with_stage(scan("report").depends_on(["classify", "lineage"]))
        .with_stage(scan("classify").depends_on(["discover"]))
        .with_stage(scan("lineage").depends_on(["discover"]))
        .with_stage(scan("discover"));
    let id = runtime.submit(request).await.expect("submit").orchestration_id();
    let view = wait_terminal(&runtime, id).await;
    assert_eq!(view.status, OrchestrationStatus::Completed);

    let started = harness.started().await;
    let at = |id: &str| started.iter().position(|s| s == id).expect("stage started");
    assert!(at("discover") < at("classify"));
    assert!(at("discover") < at("lineage"));
    assert!(at("classify") < at("report"));
    assert!(at("lineage") < at("report"));
    runtime.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn terminal_status_is_stable() {
    let harness = Harness::new(&[], false);
    let runtime = runtime(config(), harness).await;

    let id = runtime
        .submit(single("stable"))
        .await
        .expect("submit")
        .orchestration_id();
    let first = wait_terminal(&runtime, id).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    let second = runtime.get_status(id).await.expect("status");
    assert_eq!(first, second);

    let unknown = runtime.get_status(OrchestrationId::new()).await;
    assert!(unknown.is_err());
    runtime.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn concurrency_limit_is_never_exceeded() {
    let harness = Harness::new(&[], false);
    let mut config = config();
    config.admission.max_concurrent_orchestrations = 2;
    let runtime = runtime(config, harness.clone()).await;

    let mut ids = Vec::new();
    for n in 0..6 {
        let submitted = runtime
            .submit(single(&format!("batch-{n}")).with_resources(cpu(5)))
            .await
            .expect("submit");
        assert!(!matches!(submitted, SubmitResult::Rejected { .. }));
        ids.push(submitted.orchestration_id());
    }
    for id in ids {
        let view = wait_terminal(&runtime, id).await;
        assert_eq!(view.status, OrchestrationStatus::Completed);
    }
    assert!(harness.peak.load(Ordering::SeqCst) <= 2);
    assert_pools_idle(&runtime).await;
    runtime.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn higher_priority_is_queued_ahead() {
    let harness = Harness::new(&[], true);
    let mut config = config();
    config.admission.max_concurrent_orchestrations = 1;
    let runtime = runtime(config, harness.clone()).await;

    runtime.submit(single("blocker")).await.expect("submit");
    let low = runtime
        .submit(single("low").with_priority(Priority::Low))
        .await
        .expect("submit");
    let high = runtime
        .submit(single("high").with_priority(Priority::High))
        .await
        .expect("submit");
    assert!(matches!(high, SubmitResult::Queued { position: 1, .. }));
    let low_view = runtime.get_status(low.orchestration_id()).await.expect("status");
    assert_eq!(low_view.queue_position, Some(2));

    harness.open();
    wait_terminal(&runtime, low.orchestration_id()).await;
    let high_view = runtime.get_status(high.orchestration_id()).await.expect("status");
    let low_view = runtime.get_status(low.orchestration_id()).await.expect("status");
    assert!(high_view.started_at <= low_view.started_at);
    runtime.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn prerequisite_holds_request_until_finished() {
    let harness = Harness::new(&[], true);
    let runtime = runtime(config(), harness.clone()).await;

    let first = runtime.submit(single("first")).await.expect("submit");
    let dependent = runtime
        .submit(single("dependent").with_prerequisite(first.orchestration_id()))
        .await
        .expect("submit");
    let SubmitResult::Queued { .. } = dependent else {
        panic!("dependent should wait, got {dependent:?}");
    };
    let view = runtime
        .get_status(dependent.orchestration_id())
        .await
        .expect("status");
    assert_eq!(
        view.waiting_on,
        Some(WaitReason::Prerequisites(vec![first.orchestration_id()]))
    );

    let unknown = runtime
        .submit(single("orphan").with_prerequisite(OrchestrationId::new()))
        .await
        .expect("submit");
    assert!(matches!(
        unknown,
        SubmitResult::Rejected {
            reason: ValidationError::UnknownPrerequisite(_),
            ..
        }
    ));

    harness.open();
    let done = wait_terminal(&runtime, dependent.orchestration_id()).await;
    assert_eq!(done.status, OrchestrationStatus::Completed);
    runtime.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn shutdown_cancels_active_work() {
    let harness = Harness::new(&[], true);
    let runtime = runtime(config(), harness).await;

    let id = runtime
        .submit(single("interrupted"))
        .await
        .expect("submit")
        .orchestration_id();
    runtime.shutdown().await.expect("shutdown");

    let view = runtime.get_status(id).await.expect("status");
    assert_eq!(view.status, OrchestrationStatus::Cancelled);
    assert_pools_idle(&runtime).await;
    assert!(runtime.submit(single("late")).await.is_err());
}

/// Repository that stalls when persisting freshly admitted masters.
#[derive(Default)]
struct SlowAdmissionRepository {
    inner: InMemoryOrchestrationRepository,
}

#[async_trait]
impl OrchestrationRepository for SlowAdmissionRepository {
    async fn upsert_master(&self, master: &OrchestrationMaster) -> Result<()> {
        if master.status == OrchestrationStatus::Pending {
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
        self.inner.upsert_master(master).await
    }

    async fn load_master(&self, id: OrchestrationId) -> Result<Option<OrchestrationMaster>> {
        self.inner.load_master(id).await
    }

    async fn upsert_stage_execution(&self, execution: &StageExecution) -> Result<()> {
        self.inner.upsert_stage_execution(execution).await
    }

    async fn stage_executions(&self, id: OrchestrationId) -> Result<Vec<StageExecution>> {
        self.inner.stage_executions(id).await
    }

    async fn record_pool_snapshot(&self, snapshot: &PoolSnapshot) -> Result<()> {
        self.inner.record_pool_snapshot(snapshot).await
    }

    async fn recent_pool_snapshots(&self, limit: usize) -> Result<Vec<PoolSnapshot>> {
        self.inner.recent_pool_snapshots(limit).await
    }
}

#[tokio::test]
async fn drained_entries_are_visible_and_cancellable_while_starting() {
    let harness = Harness::new(&[], true);
    let mut config = config();
    config.resources.cpu = 100;
    let runtime = OrchestratorRuntime::builder(config)
        .with_handlers(StageHandlerRegistry::new().with_handler(harness.clone()))
        .with_repository(Arc::new(SlowAdmissionRepository::default()))
        .build()
        .expect("runtime builds");

    let blocker = runtime
        .submit(single("blocker").with_resources(cpu(100)))
        .await
        .expect("submit blocker")
        .orchestration_id();
    let first = runtime
        .submit(single("first").with_resources(cpu(50)))
        .await
        .expect("submit first")
        .orchestration_id();
    let second = runtime
        .submit(single("second").with_resources(cpu(50)))
        .await
        .expect("submit second")
        .orchestration_id();
    wait_for(&runtime, blocker, |v| v.status == OrchestrationStatus::Running).await;

    // The release drains both entries, then stalls persisting the first.
    let releasing = {
        let runtime = runtime.clone();
        tokio::spawn(async move { runtime.cancel(blocker, CancelMode::Immediate).await })
    };
    wait_for(&runtime, first, |v| v.session_id.is_some()).await;

    let view = runtime.get_status(second).await.expect("second is visible");
    assert_eq!(view.status, OrchestrationStatus::Pending);
    assert!(view.session_id.is_some());

    let cancelled = runtime
        .cancel(second, CancelMode::Immediate)
        .await
        .expect("second is cancellable");
    assert_eq!(cancelled.outcome, CancelOutcome::Cancelled);
    assert_eq!(cancelled.resources_released, cpu(50));

    let released = releasing.await.expect("join").expect("cancel blocker");
    assert_eq!(released.outcome, CancelOutcome::Cancelled);

    wait_for(&runtime, first, |v| v.status == OrchestrationStatus::Running).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let view = runtime.get_status(second).await.expect("status");
    assert_eq!(view.status, OrchestrationStatus::Cancelled);
    assert_eq!(harness.started().await.len(), 2, "second never started a stage");

    harness.open();
    let done = wait_terminal(&runtime, first).await;
    assert_eq!(done.status, OrchestrationStatus::Completed);
    assert_pools_idle(&runtime).await;
    runtime.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn release_admits_queued_work_without_background_loops() {
    let harness = Harness::new(&[], true);
    let mut config = config();
    config.resources.cpu = 100;
    let runtime = OrchestratorRuntime::builder(config)
        .with_handlers(StageHandlerRegistry::new().with_handler(harness.clone()))
        .build()
        .expect("runtime builds");

    let first = runtime
        .submit(single("first").with_resources(cpu(60)))
        .await
        .expect("submit first");
    let second = runtime
        .submit(single("second").with_resources(cpu(60)))
        .await
        .expect("submit second");
    assert!(first.is_executing());
    assert!(matches!(second, SubmitResult::Queued { position: 1, .. }));

    harness.open();
    wait_terminal(&runtime, first.orchestration_id()).await;
    let done = wait_terminal(&runtime, second.orchestration_id()).await;
    assert_eq!(done.status, OrchestrationStatus::Completed);
    assert_eq!(runtime.loop_error_count(), 0);
    assert_pools_idle(&runtime).await;
    runtime.shutdown().await.expect("shutdown");
}
