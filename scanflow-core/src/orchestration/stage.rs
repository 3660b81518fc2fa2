use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::ids::{OrchestrationId, StageExecutionId};

/// Handler kinds a stage can be dispatched to.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageType {
    DataSourceScan,
    RuleApplication,
    CatalogDiscovery,
    Classification,
    ComplianceCheck,
    LineageAnalysis,
    QualityAssessment,
}

impl StageType {
    pub const ALL: [StageType; 7] = [
        StageType::DataSourceScan,
        StageType::RuleApplication,
        StageType::CatalogDiscovery,
        StageType::Classification,
        StageType::ComplianceCheck,
        StageType::LineageAnalysis,
        StageType::QualityAssessment,
    ];
}

impl fmt::Display for StageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageType::DataSourceScan => write!(f, "data_source_scan"),
            StageType::RuleApplication => write!(f, "rule_application"),
            StageType::CatalogDiscovery => write!(f, "catalog_discovery"),
            StageType::Classification => write!(f, "classification"),
            StageType::ComplianceCheck => write!(f, "compliance_check"),
            StageType::LineageAnalysis => write!(f, "lineage_analysis"),
            StageType::QualityAssessment => write!(f, "quality_assessment"),
        }
    }
}

/// One unit of work inside an orchestration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StageDefinition {
    /// Key used by dependency edges; unique within a request.
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub stage_type: StageType,
    #[serde(default)]
    pub order: u32,
    #[serde(default)]
    pub critical: bool,
    /// Stage ids that must finish successfully before this one starts.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Opaque to the orchestrator; forwarded to the handler.
    #[serde(default)]
    pub configuration: Value,
    #[serde(default)]
    pub estimated_duration_secs: u64,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_retries: u32,
}

impl StageDefinition {
    pub fn new(id: impl Into<String>, stage_type: StageType) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            stage_type,
            order: 0,
            critical: false,
            depends_on: Vec::new(),
            configuration: Value::Null,
            estimated_duration_secs: 0,
            timeout_secs: None,
            max_retries: 0,
        }
    }

    pub fn critical(mut self, critical: bool) -> Self {
        self.critical = critical;
        self
    }

    pub fn depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn with_configuration(mut self, configuration: Value) -> Self {
        self.configuration = configuration;
        self
    }

    pub fn with_estimated_duration(mut self, secs: u64) -> Self {
        self.estimated_duration_secs = secs;
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Failed,
    /// Never started because a predecessor failed or the run was aborted.
    Skipped,
}

impl StageStatus {
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            StageStatus::Completed | StageStatus::Failed | StageStatus::Skipped
        )
    }
}

/// What a stage handler reports back.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StageOutcome {
    pub success: bool,
    #[serde(default)]
    pub output: Value,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl StageOutcome {
    pub fn success(output: Value) -> Self {
        Self {
            success: true,
            output,
            ..Self::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            errors: vec![error.into()],
            ..Self::default()
        }
    }

    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }
}

/// Per-run record of a stage inside one orchestration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StageExecution {
    pub id: StageExecutionId,
    pub orchestration_id: OrchestrationId,
    pub stage_id: String,
    pub stage_type: StageType,
    pub critical: bool,
    pub status: StageStatus,
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub output_summary: Option<Value>,
    pub metrics: BTreeMap<String, f64>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl StageExecution {
    pub fn new(orchestration_id: OrchestrationId, stage: &StageDefinition) -> Self {
        Self {
            id: StageExecutionId::new(),
            orchestration_id,
            stage_id: stage.id.clone(),
            stage_type: stage.stage_type,
            critical: stage.critical,
            status: StageStatus::Pending,
            attempts: 0,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            output_summary: None,
            metrics: BTreeMap::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn start(&mut self, now: DateTime<Utc>) {
        self.status = StageStatus::Running;
        self.started_at = Some(now);
    }

    pub fn finish(&mut self, outcome: StageOutcome, attempts: u32, now: DateTime<Utc>) {
        self.status = if outcome.success {
            StageStatus::Completed
        } else {
            StageStatus::Failed
        };
        self.attempts = attempts;
        self.completed_at = Some(now);
        self.duration_ms = self
            .started_at
            .map(|started| (now - started).num_milliseconds().max(0) as u64);
        self.output_summary = Some(outcome.output);
        self.metrics = outcome.metrics;
        self.errors = outcome.errors;
        self.warnings = outcome.warnings;
    }

    pub fn skip(&mut self, reason: impl Into<String>, now: DateTime<Utc>) {
        self.status = StageStatus::Skipped;
        self.completed_at = Some(now);
        self.warnings.push(reason.into());
    }

    pub fn was_attempted(&self) -> bool {
        self.started_at.is_some()
    }
}
