use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use scanflow_core::orchestration::OrchestratorConfig;

/// Raw configuration as defined in a TOML file. Orchestrator sections sit at
/// the top level (`[resources]`, `[admission]`, ...).
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct FileConfig {
    /// Orchestrator sections.
    #[serde(flatten)]
    pub orchestrator: OrchestratorConfig,
    /// `[logging]` section.
    #[serde(default)]
    pub logging: FileLoggingConfig,
}

/// `[logging]` table.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileLoggingConfig {
    /// `tracing` filter directive, e.g. `info,scanflow::executor=debug`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

/// `SCANFLOW_*` overrides. Values that fail to parse are kept in `invalid`
/// so the loader can report them instead of silently dropping them.
#[derive(Debug, Default, Clone)]
pub struct EnvConfig {
    /// `SCANFLOW_CONFIG`
    pub config_path: Option<PathBuf>,
    /// `SCANFLOW_MAX_CONCURRENT`
    pub max_concurrent: Option<usize>,
    /// `SCANFLOW_UTILIZATION_THRESHOLD`
    pub utilization_threshold: Option<f64>,
    /// `SCANFLOW_AUTONOMOUS_MODE`
    pub autonomous_mode: Option<bool>,
    /// `SCANFLOW_MAX_PARALLEL_STAGES`
    pub max_parallel_stages: Option<usize>,
    /// `SCANFLOW_CPU_CAPACITY`
    pub cpu_capacity: Option<u64>,
    /// `SCANFLOW_MEMORY_CAPACITY`
    pub memory_capacity: Option<u64>,
    /// `SCANFLOW_LOG`
    pub log_filter: Option<String>,
    /// `(variable, raw value)` pairs that did not parse.
    pub invalid: Vec<(String, String)>,
}

impl EnvConfig {
    /// Reads the current process environment.
    pub fn gather() -> Self {
        Self::from_vars(std::env::vars())
    }

    /// Builds overrides from explicit pairs; non-`SCANFLOW_` keys are ignored.
    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars: HashMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .filter(|(k, _)| k.starts_with("SCANFLOW_"))
            .collect();
        let mut env = Self::default();

        env.config_path = non_empty(&vars, "SCANFLOW_CONFIG").map(PathBuf::from);
        env.log_filter = non_empty(&vars, "SCANFLOW_LOG").map(str::to_string);
        env.max_concurrent = env.parse(&vars, "SCANFLOW_MAX_CONCURRENT", |s| s.parse().ok());
        env.utilization_threshold =
            env.parse(&vars, "SCANFLOW_UTILIZATION_THRESHOLD", |s| s.parse().ok());
        env.autonomous_mode = env.parse(&vars, "SCANFLOW_AUTONOMOUS_MODE", parse_bool);
        env.max_parallel_stages =
            env.parse(&vars, "SCANFLOW_MAX_PARALLEL_STAGES", |s| s.parse().ok());
        env.cpu_capacity = env.parse(&vars, "SCANFLOW_CPU_CAPACITY", |s| s.parse().ok());
        env.memory_capacity = env.parse(&vars, "SCANFLOW_MEMORY_CAPACITY", |s| s.parse().ok());
        env
    }

    fn parse<T>(
        &mut self,
        vars: &HashMap<String, String>,
        name: &str,
        parse: impl Fn(&str) -> Option<T>,
    ) -> Option<T> {
        let raw = non_empty(vars, name)?;
        let parsed = parse(raw);
        if parsed.is_none() {
            self.invalid.push((name.to_string(), raw.to_string()));
        }
        parsed
    }

    /// Writes every present override into `config`.
    pub fn apply(&self, config: &mut OrchestratorConfig) {
        if let Some(value) = self.max_concurrent {
            config.admission.max_concurrent_orchestrations = value;
        }
        if let Some(value) = self.utilization_threshold {
            config.admission.utilization_threshold = value;
        }
        if let Some(value) = self.autonomous_mode {
            config.monitor.autonomous_mode = value;
        }
        if let Some(value) = self.max_parallel_stages {
            config.execution.max_parallel_stages = value;
        }
        if let Some(value) = self.cpu_capacity {
            config.resources.cpu = value;
        }
        if let Some(value) = self.memory_capacity {
            config.resources.memory = value;
        }
    }
}

fn non_empty<'a>(vars: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    vars.get(name).map(|v| v.trim()).filter(|v| !v.is_empty())
}

/// Accepts `1/true/yes/on` and `0/false/no/off`, case-insensitively.
pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_overrides_parse_and_report_garbage() {
        let env = EnvConfig::from_vars([
            ("SCANFLOW_MAX_CONCURRENT", "4"),
            ("SCANFLOW_AUTONOMOUS_MODE", "yes"),
            ("SCANFLOW_CPU_CAPACITY", "lots"),
            ("SCANFLOW_LOG", "  "),
            ("UNRELATED", "1"),
        ]);
        assert_eq!(env.max_concurrent, Some(4));
        assert_eq!(env.autonomous_mode, Some(true));
        assert_eq!(env.cpu_capacity, None);
        assert_eq!(env.log_filter, None);
        assert_eq!(
            env.invalid,
            vec![("SCANFLOW_CPU_CAPACITY".to_string(), "lots".to_string())]
        );

        let mut config = OrchestratorConfig::default();
        env.apply(&mut config);
        assert_eq!(config.admission.max_concurrent_orchestrations, 4);
        assert!(config.monitor.autonomous_mode);
        assert_eq!(config.resources.cpu, 100);
    }

    #[test]
    fn file_sections_are_flattened() {
        let file: FileConfig = toml::from_str(
            r#"
            [resources]
            cpu = 8

            [admission]
            fair_admission = false

            [logging]
            filter = "debug"
            "#,
        )
        .unwrap();
        assert_eq!(file.orchestrator.resources.cpu, 8);
        assert_eq!(file.orchestrator.resources.memory, 16_384);
        assert!(!file.orchestrator.admission.fair_admission);
        assert_eq!(file.logging.filter.as_deref(), Some("debug"));
    }
}
