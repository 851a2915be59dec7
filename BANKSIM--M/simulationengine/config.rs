use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use shared_event_bus::FileNoticePublisher;
use shared_logging::LogLevel;

use crate::helper::SimulationTelemetry;

/// Runtime settings for scenario loading, result output and telemetry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulationConfig {
    /// Root of the scenario template tree.
    pub template_directory: PathBuf,
    /// Directory receiving result and event-history exports.
    pub results_directory: PathBuf,
    /// JSON-lines log file; logging is off when unset.
    pub log_path: Option<PathBuf>,
    /// Minimum level written to the log.
    pub log_level: LogLevel,
    /// JSON-lines file receiving lifecycle notices; notices are off when unset.
    pub notice_log: Option<PathBuf>,
    /// Module label stamped on log records and notices.
    pub module: String,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            template_directory: PathBuf::from(default_template_directory()),
            results_directory: PathBuf::from(default_results_directory()),
            log_path: None,
            log_level: LogLevel::Info,
            notice_log: None,
            module: default_module(),
        }
    }
}

impl SimulationConfig {
    /// Loads configuration from a TOML file. Relative paths resolve against the
    /// file's directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading simulation config {}", path.display()))?;
        let document: SimulationConfigSerde =
            toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        if document.module.trim().is_empty() {
            bail!("module label must not be empty");
        }
        let base = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let resolve = |candidate: PathBuf| {
            if candidate.is_relative() {
                base.join(candidate)
            } else {
                candidate
            }
        };
        Ok(Self {
            template_directory: resolve(document.template_directory),
            results_directory: resolve(document.results_directory),
            log_path: document.log_path.map(resolve),
            log_level: document.log_level,
            notice_log: document.notice_log.map(resolve),
            module: document.module,
        })
    }

    /// Builds the telemetry handle described by this configuration.
    pub fn telemetry(&self) -> Result<SimulationTelemetry> {
        let mut builder = SimulationTelemetry::builder(&self.module).min_level(self.log_level);
        if let Some(path) = &self.log_path {
            builder = builder.log_path(path);
        }
        if let Some(path) = &self.notice_log {
            builder = builder.notice_publisher(Arc::new(FileNoticePublisher::new(path)?));
        }
        builder.build()
    }
}

#[derive(Debug, Deserialize)]
struct SimulationConfigSerde {
    #[serde(default = "default_template_directory_path")]
    template_directory: PathBuf,
    #[serde(default = "default_results_directory_path")]
    results_directory: PathBuf,
    #[serde(default)]
    log_path: Option<PathBuf>,
    #[serde(default)]
    log_level: LogLevel,
    #[serde(default)]
    notice_log: Option<PathBuf>,
    #[serde(default = "default_module")]
    module: String,
}

const fn default_template_directory() -> &'static str {
    "configs/scenario_templates"
}

const fn default_results_directory() -> &'static str {
    "simulation_outputs"
}

fn default_template_directory_path() -> PathBuf {
    PathBuf::from(default_template_directory())
}

fn default_results_directory_path() -> PathBuf {
    PathBuf::from(default_results_directory())
}

fn default_module() -> String {
    "simulation".into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_keys_fall_back_to_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("simulation.toml");
        fs::write(&path, "module = \"bank-sim\"\n").unwrap();
        let config = SimulationConfig::load(&path).unwrap();
        assert_eq!(config.module, "bank-sim");
        assert_eq!(
            config.template_directory,
            dir.path().join("configs/scenario_templates")
        );
        assert_eq!(config.log_level, LogLevel::Info);
        assert!(config.log_path.is_none());
    }

    #[test]
    fn relative_paths_resolve_against_config_dir() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("simulation.toml");
        fs::write(
            &path,
            "results_directory = \"out\"\nlog_path = \"logs/sim.log\"\nlog_level = \"WARN\"\n",
        )
        .unwrap();
        let config = SimulationConfig::load(&path).unwrap();
        assert_eq!(config.results_directory, dir.path().join("out"));
        assert_eq!(config.log_path, Some(dir.path().join("logs/sim.log")));
        assert_eq!(config.log_level, LogLevel::Warn);
        let telemetry = config.telemetry().unwrap();
        assert_eq!(telemetry.module(), "simulation");
    }

    #[test]
    fn empty_module_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("simulation.toml");
        fs::write(&path, "module = \"  \"\n").unwrap();
        assert!(SimulationConfig::load(&path).is_err());
    }
}
