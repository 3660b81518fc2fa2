use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::resources::{ResourceRequirements, ResourceType};

/// Global knobs that tune orchestrator behaviour.
///
/// All fields carry defaults so deployments can supply only the sections they
/// care about.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Total capacity per resource kind.
    pub resources: ResourceCapacityConfig,
    /// Admission bounds and queue policy.
    pub admission: AdmissionConfig,
    /// Stage execution limits and terminal-status policy.
    pub execution: ExecutionConfig,
    /// Retry/backoff policy for failed stage handlers.
    pub retry: RetryConfig,
    /// Background loop cadence and optimizer tuning.
    pub monitor: MonitorConfig,
    /// Event bus and terminal history sizing.
    pub events: EventConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceCapacityConfig {
    pub cpu: u64,
    pub memory: u64,
    pub network: u64,
    pub storage: u64,
    pub db_connections: u64,
}

impl Default for ResourceCapacityConfig {
    fn default() -> Self {
        Self {
            cpu: 100,
            memory: 16_384,
            network: 1_000,
            storage: 102_400,
            db_connections: 50,
        }
    }
}

impl ResourceCapacityConfig {
    pub fn capacity(&self, kind: ResourceType) -> u64 {
        match kind {
            ResourceType::Cpu => self.cpu,
            ResourceType::Memory => self.memory,
            ResourceType::Network => self.network,
            ResourceType::Storage => self.storage,
            ResourceType::DbConnections => self.db_connections,
        }
    }

    pub fn set_capacity(&mut self, kind: ResourceType, value: u64) {
        match kind {
            ResourceType::Cpu => self.cpu = value,
            ResourceType::Memory => self.memory = value,
            ResourceType::Network => self.network = value,
            ResourceType::Storage => self.storage = value,
            ResourceType::DbConnections => self.db_connections = value,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Upper bound on concurrently executing orchestrations.
    pub max_concurrent_orchestrations: usize,
    /// Pool utilization (0..=1) above which new work is queued even if raw
    /// capacity remains.
    pub utilization_threshold: f64,
    /// Pending entries beyond this are rejected outright.
    pub max_queue_depth: usize,
    /// Queued entries older than this are promoted one priority band.
    pub queue_aging_secs: u64,
    /// When set, a new request never overtakes waiting entries of equal or
    /// higher priority.
    pub fair_admission: bool,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_orchestrations: 10,
            utilization_threshold: 0.9,
            max_queue_depth: 1_000,
            queue_aging_secs: 300,
            fair_admission: true,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Concurrent stage bound inside a Parallel orchestration.
    pub max_parallel_stages: usize,
    pub default_stage_timeout_secs: u64,
    pub default_max_execution_secs: u64,
    /// How long a graceful cancel waits for in-flight stages before detaching.
    pub graceful_cancel_timeout_ms: u64,
    /// Success rate at or above which a run is `Completed` rather than
    /// `CompletedWithWarnings`.
    pub success_threshold: f64,
    /// Footprint reserved per concurrently running stage when a request
    /// carries no resource hints.
    pub default_stage_footprint: ResourceRequirements,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_parallel_stages: 4,
            default_stage_timeout_secs: 60 * 60,
            default_max_execution_secs: 6 * 60 * 60,
            graceful_cancel_timeout_ms: 5_000,
            success_threshold: 0.8,
            default_stage_footprint: ResourceRequirements::from_iter([
                (ResourceType::Cpu, 10),
                (ResourceType::Memory, 512),
                (ResourceType::DbConnections, 1),
            ]),
        }
    }
}

impl ExecutionConfig {
    pub fn default_stage_timeout(&self) -> Duration {
        Duration::from_secs(self.default_stage_timeout_secs)
    }

    pub fn default_max_execution(&self) -> Duration {
        Duration::from_secs(self.default_max_execution_secs)
    }

    pub fn graceful_cancel_timeout(&self) -> Duration {
        Duration::from_millis(self.graceful_cancel_timeout_ms)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl RetryConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    /// Exponential delay before retry `attempt` (1-based), capped at the max.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self.backoff_base().saturating_mul(1u32 << exp);
        delay.min(self.backoff_max())
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            backoff_base_ms: 2_000,
            backoff_max_ms: 5 * 60 * 1_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub health_interval_ms: u64,
    pub queue_interval_ms: u64,
    pub metrics_interval_ms: u64,
    pub optimization_interval_ms: u64,
    /// Utilization samples retained for the optimizer.
    pub history_samples: usize,
    /// Utilization at which the alert sink is notified.
    pub alert_utilization: f64,
    /// Apply optimizer recommendations without supervision.
    pub autonomous_mode: bool,
    /// Sustained utilization above this with a non-empty queue is "saturated".
    pub high_watermark: f64,
    /// Sustained utilization below this with a non-empty queue means the
    /// admission threshold is too strict.
    pub low_watermark: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            health_interval_ms: 30_000,
            queue_interval_ms: 5_000,
            metrics_interval_ms: 60_000,
            optimization_interval_ms: 5 * 60 * 1_000,
            history_samples: 120,
            alert_utilization: 0.95,
            autonomous_mode: false,
            high_watermark: 0.85,
            low_watermark: 0.3,
        }
    }
}

impl MonitorConfig {
    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }

    pub fn queue_interval(&self) -> Duration {
        Duration::from_millis(self.queue_interval_ms)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_millis(self.metrics_interval_ms)
    }

    pub fn optimization_interval(&self) -> Duration {
        Duration::from_millis(self.optimization_interval_ms)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    pub channel_capacity: usize,
    /// Terminal status views retained in memory for `get_status`.
    pub history_capacity: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
            history_capacity: 1_024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_grows_and_caps() {
        let retry = RetryConfig {
            backoff_base_ms: 100,
            backoff_max_ms: 350,
        };
        assert_eq!(retry.delay_for(1), Duration::from_millis(100));
        assert_eq!(retry.delay_for(2), Duration::from_millis(200));
        assert_eq!(retry.delay_for(3), Duration::from_millis(350));
        assert_eq!(retry.delay_for(30), Duration::from_millis(350));
    }

    #[test]
    fn partial_config_keeps_defaults() {
        let cfg: OrchestratorConfig =
            serde_json::from_str(r#"{"resources":{"cpu":8},"monitor":{"autonomous_mode":true}}"#)
                .unwrap();
        assert_eq!(cfg.resources.cpu, 8);
        assert_eq!(cfg.resources.db_connections, 50);
        assert!(cfg.monitor.autonomous_mode);
        assert_eq!(cfg.admission.max_concurrent_orchestrations, 10);
    }
}
