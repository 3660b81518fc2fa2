//! Simulated stage handlers for driving the orchestrator without real scan
//! backends. Behaviour is read from each stage's `configuration.simulate`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use scanflow_core::error::Result;
use scanflow_core::orchestration::{
    StageHandler, StageHandlerRegistry, StageInvocation, StageOutcome, StageType,
};

const DEFAULT_DURATION_MS: u64 = 100;

/// `configuration.simulate` block of a stage definition.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct SimulationSpec {
    pub duration_ms: u64,
    /// Fail every attempt.
    pub fail: bool,
    /// Fail this many attempts before succeeding.
    pub fail_attempts: u32,
    pub warning: Option<String>,
    pub rows: u64,
}

impl Default for SimulationSpec {
    fn default() -> Self {
        Self {
            duration_ms: DEFAULT_DURATION_MS,
            fail: false,
            fail_attempts: 0,
            warning: None,
            rows: 1_000,
        }
    }
}

impl SimulationSpec {
    pub fn from_configuration(configuration: &serde_json::Value) -> Self {
        configuration
            .get("simulate")
            .and_then(|raw| serde_json::from_value(raw.clone()).ok())
            .unwrap_or_default()
    }

    fn fails_on(&self, attempt: u32) -> bool {
        self.fail || attempt <= self.fail_attempts
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SimulatedStageHandler {
    stage_type: StageType,
}

impl SimulatedStageHandler {
    pub fn new(stage_type: StageType) -> Self {
        Self { stage_type }
    }
}

#[async_trait]
impl StageHandler for SimulatedStageHandler {
    fn stage_type(&self) -> StageType {
        self.stage_type
    }

    async fn execute(&self, invocation: StageInvocation) -> Result<StageOutcome> {
        let spec = SimulationSpec::from_configuration(&invocation.stage.configuration);
        debug!(
            target: "scanflow::executor",
            orchestration_id = %invocation.orchestration_id,
            stage = %invocation.stage.id,
            attempt = invocation.attempt,
            duration_ms = spec.duration_ms,
            "simulating stage"
        );

        tokio::select! {
            _ = invocation.cancel.cancelled() => {
                return Ok(StageOutcome::failure("cancelled before completion"));
            }
            _ = tokio::time::sleep(Duration::from_millis(spec.duration_ms)) => {}
        }

        if spec.fails_on(invocation.attempt) {
            return Ok(StageOutcome::failure(format!(
                "simulated {} failure on attempt {}",
                self.stage_type, invocation.attempt
            )));
        }

        let mut outcome = StageOutcome::success(json!({
            "stage_type": self.stage_type,
            "data_sources": invocation.data_source_ids.len(),
            "rows_scanned": spec.rows,
        }))
        .with_metric("simulated_ms", spec.duration_ms as f64);
        if let Some(warning) = spec.warning {
            outcome = outcome.with_warning(warning);
        }
        Ok(outcome)
    }
}

/// One simulated handler per stage type.
pub fn simulated_registry() -> StageHandlerRegistry {
    let mut registry = StageHandlerRegistry::new();
    for stage_type in StageType::ALL {
        registry.register(Arc::new(SimulatedStageHandler::new(stage_type)));
    }
    registry
}
