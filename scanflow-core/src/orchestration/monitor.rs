//! Analysis used by the background loops: utilization history, health
//! evaluation and the optimizer. The loops themselves live in the runtime.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

use super::config::MonitorConfig;
use super::resources::{PoolSnapshot, ResourceType};
use crate::types::ids::OrchestrationId;

/// Largest threshold the optimizer will ever propose.
pub const MAX_PROPOSED_THRESHOLD: f64 = 0.98;
const THRESHOLD_STEP: f64 = 0.05;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UtilizationSample {
    pub sampled_at: DateTime<Utc>,
    pub utilization: BTreeMap<ResourceType, f64>,
    pub queue_depth: usize,
    pub active: usize,
}

impl UtilizationSample {
    pub fn from_snapshot(snapshot: &PoolSnapshot, queue_depth: usize, active: usize) -> Self {
        Self {
            sampled_at: snapshot.sampled_at,
            utilization: ResourceType::ALL
                .iter()
                .map(|kind| (*kind, snapshot.utilization(*kind)))
                .collect(),
            queue_depth,
            active,
        }
    }
}

/// Ring buffer of recent samples.
#[derive(Clone, Debug)]
pub struct UtilizationHistory {
    samples: VecDeque<UtilizationSample>,
    capacity: usize,
}

impl UtilizationHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, sample: UtilizationSample) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn latest(&self) -> Option<&UtilizationSample> {
        self.samples.back()
    }

    pub fn average(&self, kind: ResourceType) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let sum: f64 = self
            .samples
            .iter()
            .map(|s| s.utilization.get(&kind).copied().unwrap_or(0.0))
            .sum();
        sum / self.samples.len() as f64
    }

    pub fn peak(&self, kind: ResourceType) -> f64 {
        self.samples
            .iter()
            .map(|s| s.utilization.get(&kind).copied().unwrap_or(0.0))
            .fold(0.0, f64::max)
    }
}

/// Which resource kinds an optimization pass looks at.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationScope {
    #[default]
    All,
    Resource(ResourceType),
}

impl OptimizationScope {
    pub fn kinds(self) -> Vec<ResourceType> {
        match self {
            OptimizationScope::All => ResourceType::ALL.to_vec(),
            OptimizationScope::Resource(kind) => vec![kind],
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum RecommendedAction {
    /// Raise the admission threshold so queued work can use idle capacity.
    AdjustUtilizationThreshold { from: f64, to: f64 },
    /// Move a starving queued request up one priority band.
    PromoteQueued {
        orchestration_id: OrchestrationId,
        waited_secs: i64,
    },
    /// Advisory only; capacity is owned by the deployment.
    IncreaseCapacity {
        resource: ResourceType,
        average_utilization: f64,
    },
}

impl RecommendedAction {
    /// Whether autonomous mode may apply this action.
    pub fn is_applicable(&self) -> bool {
        !matches!(self, RecommendedAction::IncreaseCapacity { .. })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub resource: Option<ResourceType>,
    pub action: RecommendedAction,
    pub score: f64,
    pub rationale: String,
}

/// Pluggable numeric scoring for recommendations. Higher is more urgent; a
/// score of zero or below drops the recommendation.
pub trait ScoringStrategy: Send + Sync {
    fn score(&self, recommendation: &Recommendation, history: &UtilizationHistory) -> f64;
}

/// Keeps the heuristic's own score.
#[derive(Clone, Copy, Debug, Default)]
pub struct HeuristicScoring;

impl ScoringStrategy for HeuristicScoring {
    fn score(&self, recommendation: &Recommendation, _history: &UtilizationHistory) -> f64 {
        recommendation.score
    }
}

/// Queue facts the optimizer needs.
#[derive(Clone, Debug, Default)]
pub struct QueueSummary {
    pub depth: usize,
    pub resource_waiters: usize,
    pub longest_waiting: Option<(OrchestrationId, ChronoDuration)>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OptimizationReport {
    pub generated_at: DateTime<Utc>,
    pub scope: OptimizationScope,
    pub samples_considered: usize,
    pub average_utilization: BTreeMap<ResourceType, f64>,
    pub peak_utilization: BTreeMap<ResourceType, f64>,
    pub utilization_threshold: f64,
    pub queue_depth: usize,
    pub recommendations: Vec<Recommendation>,
    /// True only when autonomous mode applied at least one action.
    pub applied: bool,
    pub applied_actions: Vec<RecommendedAction>,
}

pub struct ResourceOptimizer {
    config: MonitorConfig,
    strategy: Arc<dyn ScoringStrategy>,
}

impl fmt::Debug for ResourceOptimizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceOptimizer")
            .field("autonomous_mode", &self.config.autonomous_mode)
            .field("high_watermark", &self.config.high_watermark)
            .field("low_watermark", &self.config.low_watermark)
            .finish()
    }
}

impl ResourceOptimizer {
    pub fn new(config: MonitorConfig, strategy: Arc<dyn ScoringStrategy>) -> Self {
        Self { config, strategy }
    }

    pub fn autonomous(&self) -> bool {
        self.config.autonomous_mode
    }

    /// Builds a report with scored recommendations; `applied` is left false.
    pub fn analyze(
        &self,
        scope: OptimizationScope,
        history: &UtilizationHistory,
        threshold: f64,
        queue: &QueueSummary,
        starvation_after: ChronoDuration,
        now: DateTime<Utc>,
    ) -> OptimizationReport {
        let kinds = scope.kinds();
        let average: BTreeMap<_, _> = kinds.iter().map(|k| (*k, history.average(*k))).collect();
        let peak: BTreeMap<_, _> = kinds.iter().map(|k| (*k, history.peak(*k))).collect();
        let latest = history.latest();

        let mut candidates = Vec::new();

        if queue.resource_waiters > 0 {
            // Threshold is the blocker: utilization sits at or above it but raw
            // capacity is still free.
            let blocking = kinds.iter().copied().find(|kind| {
                let current = latest
                    .and_then(|s| s.utilization.get(kind).copied())
                    .unwrap_or(0.0);
                current >= threshold && current < 1.0
            });
            if let Some(kind) = blocking
                && threshold < MAX_PROPOSED_THRESHOLD
            {
                let to = (threshold + THRESHOLD_STEP).min(MAX_PROPOSED_THRESHOLD);
                candidates.push(Recommendation {
                    resource: Some(kind),
                    action: RecommendedAction::AdjustUtilizationThreshold { from: threshold, to },
                    score: 0.5 + queue.resource_waiters.min(10) as f64 * 0.05,
                    rationale: format!(
                        "{} request(s) waiting while {kind} is held back by the {threshold:.2} threshold",
                        queue.resource_waiters
                    ),
                });
            }

            for kind in &kinds {
                let avg = average.get(kind).copied().unwrap_or(0.0);
                if avg >= self.config.high_watermark {
                    candidates.push(Recommendation {
                        resource: Some(*kind),
                        action: RecommendedAction::IncreaseCapacity {
                            resource: *kind,
                            average_utilization: avg,
                        },
                        score: avg,
                        rationale: format!(
                            "{kind} averaged {:.0}% with work queued",
                            avg * 100.0
                        ),
                    });
                }
            }
        }

        if let Some((id, waited)) = queue.longest_waiting
            && waited >= starvation_after
        {
            candidates.push(Recommendation {
                resource: None,
                action: RecommendedAction::PromoteQueued {
                    orchestration_id: id,
                    waited_secs: waited.num_seconds(),
                },
                score: 0.4,
                rationale: format!("{id} has waited {}s for admission", waited.num_seconds()),
            });
        }

        let mut recommendations: Vec<Recommendation> = candidates
            .into_iter()
            .filter_map(|mut rec| {
                rec.score = self.strategy.score(&rec, history);
                (rec.score > 0.0).then_some(rec)
            })
            .collect();
        recommendations.sort_by(|a, b| b.score.total_cmp(&a.score));

        OptimizationReport {
            generated_at: now,
            scope,
            samples_considered: history.len(),
            average_utilization: average,
            peak_utilization: peak,
            utilization_threshold: threshold,
            queue_depth: queue.depth,
            recommendations,
            applied: false,
            applied_actions: Vec::new(),
        }
    }
}

/// Why the health loop should fail a running orchestration, if at all.
pub fn overdue_reason(
    started_at: DateTime<Utc>,
    max_duration: Duration,
    deadline: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Option<String> {
    if let Some(deadline) = deadline
        && now >= deadline
    {
        return Some(format!("deadline {deadline} passed"));
    }
    let limit = ChronoDuration::from_std(max_duration).unwrap_or(ChronoDuration::MAX);
    if now - started_at >= limit {
        return Some(format!(
            "exceeded max execution time of {}s",
            max_duration.as_secs()
        ));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(cpu: f64) -> UtilizationSample {
        UtilizationSample {
            sampled_at: Utc::now(),
            utilization: BTreeMap::from([(ResourceType::Cpu, cpu), (ResourceType::Memory, 0.1)]),
            queue_depth: 1,
            active: 1,
        }
    }

    fn optimizer() -> ResourceOptimizer {
        ResourceOptimizer::new(MonitorConfig::default(), Arc::new(HeuristicScoring))
    }

    #[test]
    fn history_is_a_bounded_ring() {
        let mut history = UtilizationHistory::new(2);
        history.push(sample(0.2));
        history.push(sample(0.4));
        history.push(sample(0.6));
        assert_eq!(history.len(), 2);
        assert!((history.average(ResourceType::Cpu) - 0.5).abs() < 1e-9);
        assert_eq!(history.peak(ResourceType::Cpu), 0.6);
    }

    #[test]
    fn threshold_blocking_queued_work_is_raised() {
        let mut history = UtilizationHistory::new(4);
        history.push(sample(0.92));
        let queue = QueueSummary {
            depth: 2,
            resource_waiters: 2,
            longest_waiting: None,
        };
        let report = optimizer().analyze(
            OptimizationScope::All,
            &history,
            0.9,
            &queue,
            ChronoDuration::seconds(600),
            Utc::now(),
        );
        assert!(!report.applied);
        let raise = report
            .recommendations
            .iter()
            .find_map(|r| match r.action {
                RecommendedAction::AdjustUtilizationThreshold { from, to } => Some((from, to)),
                _ => None,
            })
            .unwrap();
        assert_eq!(raise.0, 0.9);
        assert!((raise.1 - 0.95).abs() < 1e-9);
        // Average 0.92 is above the 0.85 watermark as well.
        assert!(
            report
                .recommendations
                .iter()
                .any(|r| matches!(r.action, RecommendedAction::IncreaseCapacity { .. }))
        );
    }

    #[test]
    fn scope_limits_the_kinds_considered() {
        let mut history = UtilizationHistory::new(4);
        history.push(sample(0.92));
        let queue = QueueSummary {
            depth: 1,
            resource_waiters: 1,
            longest_waiting: None,
        };
        let report = optimizer().analyze(
            OptimizationScope::Resource(ResourceType::Memory),
            &history,
            0.9,
            &queue,
            ChronoDuration::seconds(600),
            Utc::now(),
        );
        assert!(report.recommendations.is_empty());
        assert_eq!(report.average_utilization.len(), 1);
    }

    struct Silence;

    impl ScoringStrategy for Silence {
        fn score(&self, _: &Recommendation, _: &UtilizationHistory) -> f64 {
            0.0
        }
    }

    #[test]
    fn strategy_can_veto_recommendations() {
        let optimizer = ResourceOptimizer::new(MonitorConfig::default(), Arc::new(Silence));
        let queue = QueueSummary {
            depth: 1,
            resource_waiters: 1,
            longest_waiting: Some((OrchestrationId::new(), ChronoDuration::seconds(900))),
        };
        let report = optimizer.analyze(
            OptimizationScope::All,
            &UtilizationHistory::new(1),
            0.9,
            &queue,
            ChronoDuration::seconds(600),
            Utc::now(),
        );
        assert!(report.recommendations.is_empty());
    }

    #[test]
    fn overdue_prefers_deadline() {
        let now = Utc::now();
        let started = now - ChronoDuration::seconds(10);
        assert!(overdue_reason(started, Duration::from_secs(60), None, now).is_none());
        assert!(
            overdue_reason(started, Duration::from_secs(5), None, now)
                .unwrap()
                .contains("max execution")
        );
        assert!(
            overdue_reason(started, Duration::from_secs(60), Some(now), now)
                .unwrap()
                .contains("deadline")
        );
    }
}
