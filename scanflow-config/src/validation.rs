use thiserror::Error;

use scanflow_core::orchestration::{OrchestratorConfig, ResourceType};

/// Settings the orchestrator refuses to start with.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigGuardRailError {
    /// A resource pool has no capacity.
    #[error("resources.{resource} capacity must be greater than zero")]
    ZeroCapacity {
        /// Offending pool.
        resource: ResourceType,
    },
    /// A count or interval is zero.
    #[error("{field} must be greater than zero")]
    ZeroValue {
        /// Dotted config key.
        field: &'static str,
    },
    /// A ratio lies outside `(0, 1]`.
    #[error("{field} must be within (0, 1], got {value}")]
    RatioOutOfRange {
        /// Dotted config key.
        field: &'static str,
        /// Configured value.
        value: f64,
    },
    /// The default per-stage footprint could never be admitted.
    #[error(
        "execution.default_stage_footprint needs {requested} {resource} but capacity is {capacity}"
    )]
    FootprintExceedsCapacity {
        /// Pool that is too small.
        resource: ResourceType,
        /// Amount one stage asks for.
        requested: u64,
        /// Total pool capacity.
        capacity: u64,
    },
}

/// A legal but suspicious setting.
#[derive(Debug, Clone)]
pub struct ConfigWarning {
    /// What is off.
    pub message: String,
    /// Suggested change, when there is an obvious one.
    pub hint: Option<String>,
}

/// Ordered collection of [`ConfigWarning`]s.
#[derive(Debug, Default, Clone)]
pub struct ConfigWarnings {
    /// Warnings in the order they were raised.
    pub items: Vec<ConfigWarning>,
}

impl ConfigWarnings {
    /// Adds a warning without a hint.
    pub fn push<S: Into<String>>(&mut self, message: S) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: None,
        });
    }

    /// Adds a warning with a suggested fix.
    pub fn push_with_hint<S: Into<String>, H: Into<String>>(&mut self, message: S, hint: H) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: Some(hint.into()),
        });
    }

    /// True when nothing was raised.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Number of warnings.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Appends `other`, keeping order.
    pub fn extend(&mut self, other: ConfigWarnings) {
        self.items.extend(other.items);
    }

    /// Whether any message contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.items.iter().any(|w| w.message.contains(needle))
    }
}

/// Rejects configurations the orchestrator cannot run with and warns about
/// ones that are legal but likely unintended.
pub fn apply_guard_rails(config: &OrchestratorConfig) -> Result<ConfigWarnings, ConfigGuardRailError> {
    let mut warnings = ConfigWarnings::default();

    for resource in ResourceType::ALL {
        if config.resources.capacity(resource) == 0 {
            return Err(ConfigGuardRailError::ZeroCapacity { resource });
        }
    }

    let counts = [
        (
            "admission.max_concurrent_orchestrations",
            config.admission.max_concurrent_orchestrations as u64,
        ),
        ("execution.max_parallel_stages", config.execution.max_parallel_stages as u64),
        ("execution.default_stage_timeout_secs", config.execution.default_stage_timeout_secs),
        ("execution.default_max_execution_secs", config.execution.default_max_execution_secs),
        ("monitor.health_interval_ms", config.monitor.health_interval_ms),
        ("monitor.queue_interval_ms", config.monitor.queue_interval_ms),
        ("monitor.metrics_interval_ms", config.monitor.metrics_interval_ms),
        ("monitor.optimization_interval_ms", config.monitor.optimization_interval_ms),
        ("monitor.history_samples", config.monitor.history_samples as u64),
        ("events.channel_capacity", config.events.channel_capacity as u64),
        ("events.history_capacity", config.events.history_capacity as u64),
    ];
    if let Some((field, _)) = counts.into_iter().find(|(_, value)| *value == 0) {
        return Err(ConfigGuardRailError::ZeroValue { field });
    }

    let ratios = [
        ("admission.utilization_threshold", config.admission.utilization_threshold),
        ("execution.success_threshold", config.execution.success_threshold),
        ("monitor.alert_utilization", config.monitor.alert_utilization),
        ("monitor.high_watermark", config.monitor.high_watermark),
    ];
    for (field, value) in ratios {
        if !(value > 0.0 && value <= 1.0) {
            return Err(ConfigGuardRailError::RatioOutOfRange { field, value });
        }
    }

    if let Some((resource, requested, capacity)) = config
        .execution
        .default_stage_footprint
        .first_exceeding(&config.resources)
    {
        return Err(ConfigGuardRailError::FootprintExceedsCapacity {
            resource,
            requested,
            capacity,
        });
    }

    if config.admission.utilization_threshold < 0.5 {
        warnings.push_with_hint(
            format!(
                "admission.utilization_threshold is {:.2}; most requests will queue while anything runs",
                config.admission.utilization_threshold
            ),
            "Raise it towards 0.9 unless pools are deliberately kept idle",
        );
    }

    if config.monitor.alert_utilization < config.admission.utilization_threshold {
        warnings.push(
            "monitor.alert_utilization is below the admission threshold; alerts will fire during normal load",
        );
    }

    if config.monitor.low_watermark >= config.monitor.high_watermark {
        warnings.push("monitor.low_watermark is not below monitor.high_watermark");
    }

    if config.admission.max_queue_depth == 0 {
        warnings.push_with_hint(
            "admission.max_queue_depth is 0; requests that cannot start immediately are rejected",
            "Set a positive queue depth to let work wait for capacity",
        );
    }

    if config.admission.queue_aging_secs == 0 {
        warnings.push("admission.queue_aging_secs is 0; queued entries are promoted on every pass");
    }

    if config.execution.graceful_cancel_timeout_ms == 0 {
        warnings.push(
            "execution.graceful_cancel_timeout_ms is 0; graceful cancels behave like immediate ones",
        );
    }

    if config.retry.backoff_max_ms < config.retry.backoff_base_ms {
        warnings.push("retry.backoff_max_ms is below retry.backoff_base_ms; every retry waits the maximum");
    }

    if config.monitor.autonomous_mode {
        warnings.push_with_hint(
            "monitor.autonomous_mode is on; optimizer recommendations are applied without review",
            "Disable it to receive recommendations only",
        );
    }

    Ok(warnings)
}
