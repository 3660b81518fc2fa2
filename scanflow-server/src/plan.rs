//! JSON plan files: a batch of orchestration requests submitted together.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

use scanflow_core::orchestration::{DependencyPlanner, ExecutionPlan, OrchestrationRequest};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanFile {
    pub requests: Vec<OrchestrationRequest>,
}

/// Dry-run summary for one request.
#[derive(Debug, Clone, Serialize)]
pub struct PlanPreview {
    pub name: String,
    pub order: Vec<String>,
    pub critical_path: Vec<String>,
    pub critical_path_secs: u64,
    pub estimated_secs: u64,
    pub max_width: usize,
}

impl PlanFile {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read plan {}", path.display()))?;
        let plan: PlanFile = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse plan {}", path.display()))?;
        plan.check_unique_ids()?;
        Ok(plan)
    }

    fn check_unique_ids(&self) -> anyhow::Result<()> {
        let mut seen = HashSet::new();
        for request in &self.requests {
            if !seen.insert(request.id) {
                bail!("plan contains request id {} more than once", request.id);
            }
        }
        Ok(())
    }

    /// Plans every request without submitting; the first invalid one aborts.
    pub fn preview(&self) -> anyhow::Result<Vec<PlanPreview>> {
        let planner = DependencyPlanner::new();
        self.requests
            .iter()
            .map(|request| {
                let plan = planner
                    .plan(request)
                    .with_context(|| format!("request {:?} is invalid", request.name))?;
                Ok(PlanPreview::new(request, &plan))
            })
            .collect()
    }
}

impl PlanPreview {
    fn new(request: &OrchestrationRequest, plan: &ExecutionPlan) -> Self {
        Self {
            name: request.name.clone(),
            order: plan.order().into_iter().map(str::to_string).collect(),
            critical_path: plan.critical_path.stages.clone(),
            critical_path_secs: plan.critical_path.estimated_duration_secs,
            estimated_secs: plan.estimated_duration(request.execution_mode).as_secs(),
            max_width: plan.max_width,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const NIGHTLY: &str = r#"{
        "requests": [
            {
                "name": "nightly",
                "priority": "high",
                "stages": [
                    { "id": "discover", "stage_type": "catalog_discovery", "estimated_duration_secs": 30 },
                    { "id": "scan", "stage_type": "data_source_scan", "depends_on": ["discover"], "estimated_duration_secs": 120, "critical": true },
                    { "id": "classify", "stage_type": "classification", "depends_on": ["scan"], "estimated_duration_secs": 60 },
                    { "id": "quality", "stage_type": "quality_assessment", "depends_on": ["scan"], "estimated_duration_secs": 20 }
                ]
            }
        ]
    }"#;

    fn write(dir: &TempDir, contents: &str) -> std::path::PathBuf {
        let path = dir.path().join("plan.json");
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn loads_and_previews_plan() {
        let dir = TempDir::new().unwrap();
        let plan = PlanFile::load(&write(&dir, NIGHTLY)).unwrap();
        let previews = plan.preview().unwrap();

        assert_eq!(previews.len(), 1);
        let preview = &previews[0];
        assert_eq!(preview.order[0], "discover");
        assert_eq!(preview.order[1], "scan");
        assert_eq!(preview.critical_path, vec!["discover", "scan", "classify"]);
        assert_eq!(preview.critical_path_secs, 210);
        assert_eq!(preview.max_width, 2);
    }

    #[test]
    fn cyclic_request_fails_preview() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            r#"{ "requests": [ { "name": "loop", "stages": [
                { "id": "a", "stage_type": "data_source_scan", "depends_on": ["b"] },
                { "id": "b", "stage_type": "classification", "depends_on": ["a"] }
            ] } ] }"#,
        );
        let plan = PlanFile::load(&path).unwrap();
        let err = plan.preview().unwrap_err();
        assert!(err.to_string().contains("loop"));
    }

    #[test]
    fn malformed_plan_reports_path() {
        let dir = TempDir::new().unwrap();
        let err = PlanFile::load(&write(&dir, "{ not json")).unwrap_err();
        assert!(err.to_string().contains("plan.json"));
    }
}
