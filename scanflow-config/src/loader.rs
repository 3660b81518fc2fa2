use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use scanflow_core::orchestration::OrchestratorConfig;

use crate::sources::{EnvConfig, FileConfig};
use crate::validation::{self, ConfigGuardRailError, ConfigWarnings};

const DEFAULT_CONFIG_LOCATIONS: [&str; 2] = ["scanflow.toml", "config/scanflow.toml"];
const DEFAULT_LOG_FILTER: &str = "info,scanflow=info";

/// Fully resolved configuration plus where it came from.
#[derive(Debug, Clone)]
pub struct ScanflowConfig {
    /// Settings handed to the orchestrator runtime.
    pub orchestrator: OrchestratorConfig,
    /// Default `tracing` filter, used when `RUST_LOG` is unset.
    pub log_filter: String,
    /// Provenance of the loaded values.
    pub metadata: ConfigMetadata,
}

/// Which sources contributed to a [`ScanflowConfig`].
#[derive(Debug, Default, Clone)]
pub struct ConfigMetadata {
    /// File the settings were read from; `None` means built-in defaults.
    pub config_path: Option<PathBuf>,
    /// Whether a `.env` file was found and applied.
    pub env_file_loaded: bool,
}

/// Result of [`ConfigLoader::load`].
#[derive(Debug)]
pub struct ConfigLoad {
    /// The resolved configuration.
    pub config: ScanflowConfig,
    /// Non-fatal guard-rail findings and ignored overrides.
    pub warnings: ConfigWarnings,
}

/// Reasons configuration loading stops the process.
#[derive(Debug, Error)]
pub enum ConfigLoadError {
    /// An explicitly requested file does not exist.
    #[error("configuration file missing: {path}")]
    MissingConfig {
        /// Requested path.
        path: PathBuf,
    },
    /// The file exists but could not be read.
    #[error("failed to read configuration {path}")]
    Io {
        /// File being read.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },
    /// The file is not valid TOML for [`FileConfig`].
    #[error("failed to parse configuration {path}")]
    Parse {
        /// File being parsed.
        path: PathBuf,
        /// Parser error with location.
        #[source]
        source: toml::de::Error,
    },
    /// A fatal guard rail tripped.
    #[error(transparent)]
    GuardRail(#[from] ConfigGuardRailError),
    /// The `.env` file exists but is malformed.
    #[error(transparent)]
    EnvFile(#[from] dotenvy::Error),
}

/// Inputs that normally come from the command line.
#[derive(Debug, Default, Clone)]
pub struct ConfigLoaderOptions {
    /// Explicit config file; must exist when set.
    pub config_path: Option<PathBuf>,
    /// `.env` file to load instead of searching the working directory.
    pub env_file: Option<PathBuf>,
    /// Search root for the default locations; the working directory if unset.
    pub search_root: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PathProvenance {
    Explicit,
    Environment,
    Default,
}

/// Resolution order: explicit path, then `SCANFLOW_CONFIG`, then the first
/// default location that exists. Environment overrides are applied last.
#[derive(Debug, Default)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
    env: Option<EnvConfig>,
}

impl ConfigLoader {
    /// Loader reading the process environment and default locations.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loader seeded from CLI-provided options.
    pub fn with_options(options: ConfigLoaderOptions) -> Self {
        Self { options, env: None }
    }

    /// Sets the explicit config file.
    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    /// Sets the `.env` file to load.
    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.env_file = Some(path.into());
        self
    }

    /// Directory searched for the default config locations.
    pub fn with_search_root<P: Into<PathBuf>>(mut self, root: P) -> Self {
        self.options.search_root = Some(root.into());
        self
    }

    /// Uses `env` instead of the process environment; no `.env` file is read.
    pub fn with_env(mut self, env: EnvConfig) -> Self {
        self.env = Some(env);
        self
    }

    /// Reads every source, applies overrides and runs the guard rails.
    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let (env, env_file_loaded) = match &self.env {
            Some(env) => (env.clone(), false),
            None => {
                let loaded = self.load_env_file()?;
                (EnvConfig::gather(), loaded)
            }
        };

        let (file_config, config_path) = self.load_file_config(&env)?;
        let mut warnings = ConfigWarnings::default();
        if config_path.is_none() {
            warnings.push_with_hint(
                "No scanflow.toml detected; using built-in defaults and SCANFLOW_* overrides",
                "Create scanflow.toml or point SCANFLOW_CONFIG at a configuration file",
            );
        }
        for (name, raw) in &env.invalid {
            warnings.push(format!("ignoring {name}={raw}: not a valid value"));
        }

        let file = file_config.unwrap_or_default();
        let mut orchestrator = file.orchestrator;
        env.apply(&mut orchestrator);
        warnings.extend(validation::apply_guard_rails(&orchestrator)?);

        let log_filter = env
            .log_filter
            .clone()
            .or(file.logging.filter)
            .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());

        debug!(
            config_path = ?config_path,
            env_file_loaded,
            warnings = warnings.len(),
            "configuration loaded"
        );

        Ok(ConfigLoad {
            config: ScanflowConfig {
                orchestrator,
                log_filter,
                metadata: ConfigMetadata {
                    config_path,
                    env_file_loaded,
                },
            },
            warnings,
        })
    }

    fn load_env_file(&self) -> Result<bool, ConfigLoadError> {
        let result = match &self.options.env_file {
            Some(path) => dotenvy::from_path(path).map(|_| true),
            None => dotenvy::dotenv().map(|_| true),
        };
        result.or_else(|err| match err {
            dotenvy::Error::Io(_) => Ok(false),
            other => Err(other.into()),
        })
    }

    fn resolve_path(&self, env: &EnvConfig) -> Option<(PathBuf, PathProvenance)> {
        if let Some(explicit) = &self.options.config_path {
            return Some((explicit.clone(), PathProvenance::Explicit));
        }
        if let Some(from_env) = &env.config_path {
            return Some((from_env.clone(), PathProvenance::Environment));
        }
        let root = self
            .options
            .search_root
            .clone()
            .unwrap_or_else(|| PathBuf::from("."));
        DEFAULT_CONFIG_LOCATIONS
            .iter()
            .map(|candidate| root.join(candidate))
            .find(|candidate| candidate.exists())
            .map(|path| (path, PathProvenance::Default))
    }

    fn load_file_config(
        &self,
        env: &EnvConfig,
    ) -> Result<(Option<FileConfig>, Option<PathBuf>), ConfigLoadError> {
        let Some((path, provenance)) = self.resolve_path(env) else {
            return Ok((None, None));
        };
        if !path.exists() {
            if provenance != PathProvenance::Default {
                return Err(ConfigLoadError::MissingConfig { path });
            }
            return Ok((None, None));
        }
        let file_config = read_file_config(&path)?;
        Ok((Some(file_config), Some(path)))
    }
}

fn read_file_config(path: &Path) -> Result<FileConfig, ConfigLoadError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigLoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigLoadError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
