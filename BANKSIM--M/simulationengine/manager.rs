//! Scenario orchestration: loading templates, validating them, turning their
//! timelines into events, and driving full runs.

use std::{
    collections::BTreeSet,
    fmt, fs,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use shared_logging::LogLevel;
use walkdir::WalkDir;

use crate::{
    config::SimulationConfig,
    error::{SimResult, SimulationError},
    event_system::EventSystem,
    events::EventKind,
    helper::SimulationTelemetry,
    metrics::{is_sampling_step, tracked_metrics, validate_outcomes, MetricProbe, MetricSample, MetricSeries},
    report::{self, ReportFormat, ScenarioComparison, SimulationResults},
    scenario::{slugify, Difficulty, Scenario},
};

/// Installs handlers on every event system the manager creates.
pub type HandlerInstaller = Box<dyn Fn(&mut EventSystem)>;

/// Scenario event the factory could not turn into an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedInjection {
    /// Position in the scenario timeline.
    pub index: usize,
    /// Type tag as written in the scenario.
    pub event_type: String,
    /// Scheduled step.
    pub step: u64,
    /// Factory error text.
    pub reason: String,
}

/// Result of `execute_scenario`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    /// Scenario name.
    pub scenario_name: String,
    /// Events queued in the target system.
    pub events_injected: usize,
    /// Timeline entries rejected by the factory.
    pub events_failed: usize,
    /// Timeline length.
    pub total_events: usize,
    /// Details of each rejection.
    pub failed_injections: Vec<FailedInjection>,
    /// When the injection happened.
    pub executed_at: DateTime<Utc>,
}

/// Structural report on a scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioValidation {
    /// No issues found.
    pub valid: bool,
    /// Problems that would make a run meaningless.
    pub issues: Vec<String>,
    /// Suspicious but runnable constructs.
    pub warnings: Vec<String>,
    /// Timeline length.
    pub event_count: usize,
    /// Configured duration.
    pub duration: u64,
    /// Rough size of the scenario in `[0, 1]`.
    pub complexity_score: f64,
}

/// Catalogue entry for a template on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioListing {
    /// Path relative to the template directory.
    pub path: PathBuf,
    /// Scenario name.
    pub name: String,
    /// Scenario description.
    pub description: String,
    /// Difficulty.
    pub difficulty_level: Difficulty,
    /// Tags.
    pub tags: Vec<String>,
    /// Configured duration.
    pub duration_steps: u64,
    /// Timeline length.
    pub event_count: usize,
}

/// Loads, validates, executes and records scenarios.
pub struct ScenarioManager {
    template_dir: PathBuf,
    results_dir: PathBuf,
    telemetry: Option<SimulationTelemetry>,
    installer: Option<HandlerInstaller>,
    probe: Option<Box<dyn MetricProbe>>,
    loaded: IndexMap<String, Scenario>,
    execution_results: IndexMap<String, SimulationResults>,
}

impl fmt::Debug for ScenarioManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScenarioManager")
            .field("template_dir", &self.template_dir)
            .field("results_dir", &self.results_dir)
            .field("loaded", &self.loaded.len())
            .field("execution_results", &self.execution_results.len())
            .finish_non_exhaustive()
    }
}

impl ScenarioManager {
    /// Returns a builder.
    #[must_use]
    pub fn builder() -> ScenarioManagerBuilder {
        ScenarioManagerBuilder::default()
    }

    /// Wires directories and telemetry from a loaded config.
    pub fn from_config(config: &SimulationConfig) -> Result<Self> {
        Ok(Self::builder()
            .template_dir(&config.template_directory)
            .results_dir(&config.results_directory)
            .telemetry(config.telemetry()?)
            .build())
    }

    /// Root that relative scenario paths resolve against.
    #[must_use]
    pub fn template_directory(&self) -> &Path {
        &self.template_dir
    }

    /// Where run artifacts and reports are written.
    #[must_use]
    pub fn results_directory(&self) -> &Path {
        &self.results_dir
    }

    /// Loads a scenario template, logs its structural warnings and caches it by name.
    pub fn load_scenario(&mut self, relative_path: impl AsRef<Path>) -> SimResult<Scenario> {
        let path = self.template_dir.join(relative_path);
        let scenario = Scenario::from_json_file(&path)?;
        for warning in scenario.structural_warnings() {
            self.log(
                LogLevel::Warn,
                "scenario.validation.warning",
                json!({ "scenario": scenario.name(), "warning": warning }),
            );
        }
        let payload = json!({
            "scenario": scenario.name(),
            "path": path.display().to_string(),
            "events": scenario.events().len(),
        });
        self.log(LogLevel::Info, "scenario.loaded", payload.clone());
        self.notice("scenario.loaded", None, payload);
        self.loaded.insert(scenario.name().to_string(), scenario.clone());
        Ok(scenario)
    }

    /// Writes `scenario` under the template directory.
    pub fn save_scenario(&self, scenario: &Scenario, relative_path: impl AsRef<Path>) -> SimResult<PathBuf> {
        let path = self.template_dir.join(relative_path);
        scenario.export_to_json(&path)?;
        self.log(
            LogLevel::Info,
            "simulation.export.written",
            json!({ "path": path.display().to_string(), "kind": "scenario" }),
        );
        Ok(path)
    }

    /// Validates strictly, then saves as `<slug>_scenario.json`.
    pub fn create_scenario_template(&self, scenario: &Scenario) -> SimResult<PathBuf> {
        self.validate_scenario_strict(scenario)?;
        self.save_scenario(scenario, format!("{}_scenario.json", scenario.slug()))
    }

    /// Every readable scenario under the template tree, sorted by name.
    ///
    /// Files that fail to load are skipped with a warning.
    #[must_use]
    pub fn list_available_scenarios(&self) -> Vec<ScenarioListing> {
        let mut listings = Vec::new();
        for entry in WalkDir::new(&self.template_dir).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    self.log(
                        LogLevel::Warn,
                        "scenario.listing.skipped",
                        json!({ "error": err.to_string() }),
                    );
                    continue;
                }
            };
            let path = entry.path();
            if !entry.file_type().is_file() || path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            match Scenario::from_json_file(path) {
                Ok(scenario) => listings.push(ScenarioListing {
                    path: path
                        .strip_prefix(&self.template_dir)
                        .unwrap_or(path)
                        .to_path_buf(),
                    name: scenario.name().to_string(),
                    description: scenario.metadata().description.clone(),
                    difficulty_level: scenario.metadata().difficulty_level,
                    tags: scenario.metadata().tags.clone(),
                    duration_steps: scenario.simulation_parameters().duration_steps,
                    event_count: scenario.events().len(),
                }),
                Err(err) => self.log(
                    LogLevel::Warn,
                    "scenario.listing.skipped",
                    json!({ "path": path.display().to_string(), "error": err.to_string() }),
                ),
            }
        }
        listings.sort_by(|a, b| a.name.cmp(&b.name));
        listings
    }

    /// Structural check without executing anything.
    ///
    /// Issues: timeline entries the factory rejects, measurement steps past the
    /// duration, negative tolerances. Warnings: the scenario's own structural
    /// warnings plus steps where a branch closure meets a marketing campaign.
    #[must_use]
    pub fn validate_scenario(&self, scenario: &Scenario) -> ScenarioValidation {
        let duration = scenario.simulation_parameters().duration_steps;
        let mut issues = Vec::new();
        for (index, entry) in scenario.events().iter().enumerate() {
            if let Err(err) = entry.to_event() {
                issues.push(format!("event {index} at step {}: {err}", entry.step));
            }
        }
        for outcome in scenario.expected_outcomes() {
            let late: Vec<u64> = outcome
                .measurement_steps
                .iter()
                .copied()
                .filter(|step| *step > duration)
                .collect();
            if !late.is_empty() {
                issues.push(format!(
                    "outcome `{}` measures steps {late:?} beyond simulation duration {duration}",
                    outcome.metric_name
                ));
            }
            if outcome.tolerance < 0.0 {
                issues.push(format!("outcome `{}` has a negative tolerance", outcome.metric_name));
            }
        }

        let mut warnings = scenario.structural_warnings();
        let conflicts = conflicting_steps(scenario);
        if !conflicts.is_empty() {
            warnings.push(format!(
                "branch closures and marketing campaigns coincide at steps {conflicts:?}"
            ));
        }

        ScenarioValidation {
            valid: issues.is_empty(),
            issues,
            warnings,
            event_count: scenario.events().len(),
            duration,
            complexity_score: complexity_score(scenario),
        }
    }

    /// Like [`Self::validate_scenario`] but fails when any issue exists.
    pub fn validate_scenario_strict(&self, scenario: &Scenario) -> SimResult<ScenarioValidation> {
        let validation = self.validate_scenario(scenario);
        if validation.valid {
            Ok(validation)
        } else {
            Err(SimulationError::InvalidScenario(format!(
                "{}: {}",
                scenario.name(),
                validation.issues.join("; ")
            )))
        }
    }

    /// Clears `system`, then builds an event per timeline entry and
    /// batch-injects them.
    ///
    /// Clearing drops queued events and both logs but keeps handlers. Entries
    /// the factory rejects are counted and logged; they never abort the batch.
    pub fn execute_scenario(&self, scenario: &Scenario, system: &mut EventSystem) -> ExecutionSummary {
        system.clear_events();
        let mut built = Vec::with_capacity(scenario.events().len());
        let mut failed_injections = Vec::new();
        for (index, entry) in scenario.events().iter().enumerate() {
            match entry.to_event() {
                Ok(event) => built.push(event),
                Err(err) => {
                    self.log(
                        LogLevel::Warn,
                        "scenario.injection.failed",
                        json!({
                            "scenario": scenario.name(),
                            "event_type": entry.event_type,
                            "step": entry.step,
                            "error": err.to_string(),
                        }),
                    );
                    failed_injections.push(FailedInjection {
                        index,
                        event_type: entry.event_type.clone(),
                        step: entry.step,
                        reason: err.to_string(),
                    });
                }
            }
        }
        let events_injected = system.inject_events_batch(built);
        let summary = ExecutionSummary {
            scenario_name: scenario.name().to_string(),
            events_injected,
            events_failed: failed_injections.len(),
            total_events: scenario.events().len(),
            failed_injections,
            executed_at: Utc::now(),
        };
        self.log(
            LogLevel::Info,
            "scenario.executed",
            json!({
                "scenario": summary.scenario_name,
                "events_injected": summary.events_injected,
                "events_failed": summary.events_failed,
            }),
        );
        summary
    }

    /// Fresh event system carrying the manager's telemetry and handlers.
    #[must_use]
    pub fn new_event_system(&self) -> EventSystem {
        let mut system = self
            .telemetry
            .clone()
            .map_or_else(EventSystem::new, EventSystem::with_telemetry);
        if let Some(install) = &self.installer {
            install(&mut system);
        }
        system
    }

    /// Runs `scenario` end to end on a fresh event system.
    pub fn run_full_simulation(&mut self, scenario: &Scenario) -> Result<SimulationResults> {
        let system = self.new_event_system();
        self.run_with_system(scenario, system)
    }

    /// Runs `scenario` end to end on a caller-prepared event system.
    ///
    /// Handlers registered on `system` are kept; its queued events and logs
    /// are cleared before injection.
    /// Steps 1 through the duration are processed in order. Handler failures
    /// are counted, never raised. Results and event history are written to the
    /// results directory and kept for reporting.
    pub fn run_with_system(&mut self, scenario: &Scenario, mut system: EventSystem) -> Result<SimulationResults> {
        let started_at = Utc::now();
        let duration = scenario.simulation_parameters().duration_steps;
        self.log(
            LogLevel::Info,
            "simulation.run.started",
            json!({ "scenario": scenario.name(), "duration_steps": duration }),
        );

        system.set_running(true);
        let execution = self.execute_scenario(scenario, &mut system);
        let tracked = tracked_metrics(scenario);
        let mut metrics: MetricSeries = tracked.iter().map(|name| (name.clone(), Vec::new())).collect();
        self.sample_metrics(&tracked, 0, &system, &mut metrics);

        let mut events_processed = 0;
        let mut handler_failures = 0;
        let mut steps_completed = 0;
        for step in 1..=duration {
            let dispatched = system.process_events(step);
            let processed = dispatched.iter().filter(|d| d.is_processed()).count();
            events_processed += processed;
            handler_failures += dispatched.len() - processed;
            if !dispatched.is_empty() {
                self.notice(
                    "simulation.step.completed",
                    Some(step),
                    json!({
                        "scenario": scenario.name(),
                        "processed": processed,
                        "failed": dispatched.len() - processed,
                    }),
                );
            }
            if is_sampling_step(scenario, step) {
                self.sample_metrics(&tracked, step, &system, &mut metrics);
            }
            steps_completed = step;
        }
        system.set_running(false);

        let slug = scenario.slug();
        fs::create_dir_all(&self.results_dir)
            .with_context(|| format!("creating results directory {}", self.results_dir.display()))?;
        let event_history_file =
            system.export_event_history(self.results_dir.join(format!("{slug}_event_history.json")))?;
        let results_file = self.results_dir.join(format!("{slug}_results.json"));

        let results = SimulationResults {
            scenario_name: scenario.name().to_string(),
            metadata: scenario.metadata().clone(),
            started_at,
            finished_at: Utc::now(),
            steps_completed,
            events_injected: execution.events_injected,
            events_processed,
            events_failed: execution.events_failed,
            handler_failures,
            events_pending: system.pending_count(),
            validation_results: validate_outcomes(scenario.expected_outcomes(), &metrics),
            metrics,
            results_file: results_file.clone(),
            event_history_file,
        };
        fs::write(&results_file, serde_json::to_vec_pretty(&results)?)
            .with_context(|| format!("writing results {}", results_file.display()))?;
        self.log(
            LogLevel::Info,
            "simulation.export.written",
            json!({ "path": results_file.display().to_string(), "kind": "results" }),
        );

        let payload = json!({
            "scenario": results.scenario_name,
            "steps_completed": results.steps_completed,
            "events_injected": results.events_injected,
            "events_processed": results.events_processed,
            "events_failed": results.events_failed,
            "handler_failures": results.handler_failures,
        });
        self.log(LogLevel::Info, "simulation.run.completed", payload.clone());
        self.notice("simulation.run.completed", Some(steps_completed), payload);

        self.execution_results
            .insert(results.scenario_name.clone(), results.clone());
        Ok(results)
    }

    /// Writes a report for a recorded run as `<slug>_report.<ext>`.
    pub fn generate_report(&self, scenario_name: &str, format: ReportFormat) -> Result<PathBuf> {
        let results = self
            .execution_results
            .get(scenario_name)
            .ok_or_else(|| anyhow!("no recorded run for scenario `{scenario_name}`"))?;
        let rendered = report::render(results, format)?;
        fs::create_dir_all(&self.results_dir)
            .with_context(|| format!("creating results directory {}", self.results_dir.display()))?;
        let path = self
            .results_dir
            .join(format!("{}_report.{}", slugify(scenario_name), format.extension()));
        fs::write(&path, rendered).with_context(|| format!("writing report {}", path.display()))?;
        self.log(
            LogLevel::Info,
            "simulation.export.written",
            json!({ "path": path.display().to_string(), "kind": "report" }),
        );
        Ok(path)
    }

    /// Compares recorded runs; names without a run are listed as missing.
    #[must_use]
    pub fn compare_scenarios(&self, scenario_names: &[&str]) -> ScenarioComparison {
        let mut runs = Vec::new();
        let mut missing = Vec::new();
        for name in scenario_names {
            match self.execution_results.get(*name) {
                Some(results) => runs.push(results),
                None => missing.push((*name).to_string()),
            }
        }
        report::compare(&runs, missing)
    }

    /// Cached scenario loaded under `name`.
    #[must_use]
    pub fn get_scenario_by_name(&self, name: &str) -> Option<&Scenario> {
        self.loaded.get(name)
    }

    /// Recorded results of the last run of `name`.
    #[must_use]
    pub fn execution_results(&self, name: &str) -> Option<&SimulationResults> {
        self.execution_results.get(name)
    }

    /// Forgets loaded scenarios and recorded runs.
    pub fn clear_cache(&mut self) {
        self.loaded.clear();
        self.execution_results.clear();
    }

    fn sample_metrics(&mut self, tracked: &[String], step: u64, system: &EventSystem, metrics: &mut MetricSeries) {
        let Some(probe) = self.probe.as_mut() else {
            return;
        };
        for metric in tracked {
            if let Some(value) = probe.sample(metric, step, system) {
                metrics
                    .entry(metric.clone())
                    .or_default()
                    .push(MetricSample { step, value });
            }
        }
    }

    fn log(&self, level: LogLevel, message: &str, metadata: Value) {
        if let Some(tel) = &self.telemetry {
            tel.log_or_report(level, message, metadata);
        }
    }

    fn notice(&self, kind: &str, step: Option<u64>, payload: Value) {
        if let Some(tel) = &self.telemetry {
            tel.notice_or_report(kind, step, payload);
        }
    }
}

/// Steps where a branch closure and a marketing campaign are both scheduled.
fn conflicting_steps(scenario: &Scenario) -> Vec<u64> {
    let steps_of = |kind: EventKind| -> BTreeSet<u64> {
        scenario
            .get_events_by_type(kind.tag())
            .into_iter()
            .map(|entry| entry.step)
            .collect()
    };
    steps_of(EventKind::BranchClosure)
        .intersection(&steps_of(EventKind::MarketingCampaign))
        .copied()
        .collect()
}

#[allow(clippy::cast_precision_loss)]
fn complexity_score(scenario: &Scenario) -> f64 {
    let params = scenario.simulation_parameters();
    let unique_types: BTreeSet<&str> = scenario
        .events()
        .iter()
        .map(|entry| entry.event_type.as_str())
        .collect();
    let score = (scenario.events().len() as f64 / 20.0).min(0.3)
        + (unique_types.len() as f64 / 7.0).min(0.2)
        + (params.duration_steps as f64 / 200.0).min(0.2)
        + (params.agent_population as f64 / 5000.0).min(0.2)
        + (scenario.expected_outcomes().len() as f64 / 10.0).min(0.1);
    score.min(1.0)
}

/// Builder for [`ScenarioManager`].
pub struct ScenarioManagerBuilder {
    template_dir: PathBuf,
    results_dir: PathBuf,
    telemetry: Option<SimulationTelemetry>,
    installer: Option<HandlerInstaller>,
    probe: Option<Box<dyn MetricProbe>>,
}

impl Default for ScenarioManagerBuilder {
    fn default() -> Self {
        Self {
            template_dir: PathBuf::from("configs/scenario_templates"),
            results_dir: PathBuf::from("simulation_outputs"),
            telemetry: None,
            installer: None,
            probe: None,
        }
    }
}

impl fmt::Debug for ScenarioManagerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScenarioManagerBuilder")
            .field("template_dir", &self.template_dir)
            .field("results_dir", &self.results_dir)
            .finish_non_exhaustive()
    }
}

impl ScenarioManagerBuilder {
    /// Sets the template root.
    #[must_use]
    pub fn template_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.template_dir = dir.into();
        self
    }

    /// Sets the results directory.
    #[must_use]
    pub fn results_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.results_dir = dir.into();
        self
    }

    /// Sets telemetry.
    #[must_use]
    pub fn telemetry(mut self, telemetry: SimulationTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Sets the handler installer applied to every fresh event system.
    #[must_use]
    pub fn handlers<F>(mut self, install: F) -> Self
    where
        F: Fn(&mut EventSystem) + 'static,
    {
        self.installer = Some(Box::new(install));
        self
    }

    /// Sets the metric probe.
    #[must_use]
    pub fn metric_probe(mut self, probe: impl MetricProbe + 'static) -> Self {
        self.probe = Some(Box::new(probe));
        self
    }

    /// Builds the manager.
    #[must_use]
    pub fn build(self) -> ScenarioManager {
        ScenarioManager {
            template_dir: self.template_dir,
            results_dir: self.results_dir,
            telemetry: self.telemetry,
            installer: self.installer,
            probe: self.probe,
            loaded: IndexMap::new(),
            execution_results: IndexMap::new(),
        }
    }
}
