//! Serializable scenario bundles: parameters, an abstract event timeline, and
//! the outcomes a run is expected to reach.

use std::{collections::HashSet, fs, path::Path};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::{SimResult, SimulationError},
    events::{create_event, Event},
};

/// Authoring difficulty of a scenario.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    /// Introductory.
    Easy,
    /// Typical.
    #[default]
    Medium,
    /// Demanding.
    Hard,
    /// Stress scenario.
    Expert,
}

/// Descriptive scenario metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioMetadata {
    /// Scenario name, also used to name exported files.
    pub name: String,
    /// Free-form description.
    pub description: String,
    /// Template version, `major.minor`.
    #[serde(default = "default_version")]
    pub version: String,
    /// Author.
    #[serde(default)]
    pub author: String,
    /// Creation date, `YYYY-MM-DD`.
    #[serde(default = "today")]
    pub created_date: String,
    /// Search tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Difficulty label.
    #[serde(default)]
    pub difficulty_level: Difficulty,
    /// Rough run length in steps, informational only.
    #[serde(default = "default_estimated_duration")]
    pub estimated_duration: u64,
}

impl ScenarioMetadata {
    /// Metadata with the given name and description and default everything else.
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            version: default_version(),
            author: String::new(),
            created_date: today(),
            tags: Vec::new(),
            difficulty_level: Difficulty::default(),
            estimated_duration: default_estimated_duration(),
        }
    }
}

/// Execution parameters of a scenario run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationParameters {
    /// Number of steps driven by a full run. Must be positive.
    pub duration_steps: u64,
    /// Steps before measurements are meaningful. Should be below `duration_steps`.
    pub warm_up_steps: u64,
    /// Size of the agent population. Must be positive.
    pub agent_population: u64,
    /// Seed handed to the agent simulation.
    pub random_seed: Option<u64>,
    /// Metric sampling interval in steps. Must be positive.
    pub output_frequency: u64,
    /// Whether intermediate results should be kept.
    pub save_intermediate_results: bool,
    /// Whether a live view is requested.
    pub enable_real_time_visualization: bool,
}

impl Default for SimulationParameters {
    fn default() -> Self {
        Self {
            duration_steps: 100,
            warm_up_steps: 10,
            agent_population: 1000,
            random_seed: None,
            output_frequency: 5,
            save_intermediate_results: true,
            enable_real_time_visualization: false,
        }
    }
}

/// Not-yet-instantiated event on a scenario timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioEvent {
    /// Event type tag, resolved through the event factory.
    pub event_type: String,
    /// Step at which the event is due.
    pub step: u64,
    /// Kind-specific parameters.
    #[serde(default)]
    pub parameters: IndexMap<String, Value>,
    /// Author-assigned id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    /// Author notes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ScenarioEvent {
    /// Timeline entry without id or description.
    #[must_use]
    pub fn new(
        event_type: impl Into<String>,
        step: u64,
        parameters: IndexMap<String, Value>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            step,
            parameters,
            event_id: None,
            description: None,
        }
    }

    /// Builds the concrete event through the factory.
    pub fn to_event(&self) -> SimResult<Event> {
        create_event(&self.event_type, self.step, &self.parameters)
    }
}

/// Target a metric is compared against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TargetValue {
    /// Numeric target.
    Number(f64),
    /// Categorical target.
    Text(String),
}

/// How a measured value is compared with its target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonType {
    /// Strictly above the target.
    GreaterThan,
    /// Strictly below the target.
    LessThan,
    /// Within `tolerance` of the target.
    #[default]
    Equals,
    /// Within `tolerance` of the target.
    #[serde(alias = "range")]
    WithinTolerance,
}

/// Success criterion measured at specific steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpectedOutcome {
    /// Metric measured.
    pub metric_name: String,
    /// Target value.
    pub target_value: TargetValue,
    /// Allowed absolute deviation for tolerance comparisons.
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
    /// Steps at which the metric is checked; empty means every sampled step.
    #[serde(default)]
    pub measurement_steps: Vec<u64>,
    /// Comparison applied.
    #[serde(default)]
    pub comparison_type: ComparisonType,
    /// Keys the core does not interpret, kept for round-trips.
    #[serde(flatten)]
    pub extra: IndexMap<String, Value>,
}

impl ExpectedOutcome {
    /// Numeric outcome with the default tolerance and no measurement steps.
    #[must_use]
    pub fn new(metric_name: impl Into<String>, target: f64, comparison: ComparisonType) -> Self {
        Self {
            metric_name: metric_name.into(),
            target_value: TargetValue::Number(target),
            tolerance: default_tolerance(),
            measurement_steps: Vec::new(),
            comparison_type: comparison,
            extra: IndexMap::new(),
        }
    }

    /// Sets the measurement steps.
    #[must_use]
    pub fn at_steps(mut self, steps: impl IntoIterator<Item = u64>) -> Self {
        self.measurement_steps = steps.into_iter().collect();
        self
    }

    /// Whether the outcome is checked at `step`.
    #[must_use]
    pub fn applies_at(&self, step: u64) -> bool {
        self.measurement_steps.is_empty() || self.measurement_steps.contains(&step)
    }

    /// Whether `actual` satisfies the outcome. Text targets never match a numeric sample.
    #[must_use]
    pub fn evaluate(&self, actual: f64) -> bool {
        let TargetValue::Number(target) = self.target_value else {
            return false;
        };
        match self.comparison_type {
            ComparisonType::GreaterThan => actual > target,
            ComparisonType::LessThan => actual < target,
            ComparisonType::Equals | ComparisonType::WithinTolerance => {
                (actual - target).abs() <= self.tolerance
            }
        }
    }
}

/// Named, parameterised simulation run with its event timeline and success criteria.
///
/// Hard invariants are enforced on construction and deserialization; softer
/// problems are reported by [`Scenario::structural_warnings`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ScenarioDocument")]
pub struct Scenario {
    #[serde(rename = "scenario_metadata")]
    metadata: ScenarioMetadata,
    simulation_parameters: SimulationParameters,
    events: Vec<ScenarioEvent>,
    expected_outcomes: Vec<ExpectedOutcome>,
    #[serde(rename = "key_metrics_to_track")]
    key_metrics: Vec<String>,
    risk_factors: Vec<Value>,
}

#[derive(Deserialize)]
struct ScenarioDocument {
    scenario_metadata: ScenarioMetadata,
    #[serde(default)]
    simulation_parameters: SimulationParameters,
    events: Vec<ScenarioEvent>,
    #[serde(default)]
    expected_outcomes: Vec<ExpectedOutcome>,
    #[serde(default)]
    key_metrics_to_track: Vec<String>,
    #[serde(default)]
    risk_factors: Vec<Value>,
}

impl TryFrom<ScenarioDocument> for Scenario {
    type Error = SimulationError;

    fn try_from(doc: ScenarioDocument) -> Result<Self, Self::Error> {
        let scenario = Self {
            metadata: doc.scenario_metadata,
            simulation_parameters: doc.simulation_parameters,
            events: doc.events,
            expected_outcomes: doc.expected_outcomes,
            key_metrics: doc.key_metrics_to_track,
            risk_factors: doc.risk_factors,
        };
        scenario.check_invariants()?;
        Ok(scenario)
    }
}

impl Scenario {
    /// Starts a builder.
    #[must_use]
    pub fn builder(metadata: ScenarioMetadata) -> ScenarioBuilder {
        ScenarioBuilder {
            metadata,
            parameters: SimulationParameters::default(),
            events: Vec::new(),
            outcomes: Vec::new(),
            key_metrics: Vec::new(),
            risk_factors: Vec::new(),
        }
    }

    /// Parses and validates a scenario document.
    pub fn from_json_str(raw: &str) -> SimResult<Self> {
        let doc: ScenarioDocument = serde_json::from_str(raw)?;
        Self::try_from(doc)
    }

    /// Loads a scenario file, separating missing files, malformed documents and
    /// documents that break hard invariants.
    pub fn from_json_file(path: impl AsRef<Path>) -> SimResult<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(SimulationError::ScenarioNotFound(path.to_path_buf()));
        }
        let raw = fs::read(path)?;
        let doc: ScenarioDocument =
            serde_json::from_slice(&raw).map_err(|err| SimulationError::ScenarioParse {
                path: path.to_path_buf(),
                reason: err.to_string(),
            })?;
        Self::try_from(doc)
    }

    /// Writes the scenario as pretty JSON, creating parent directories.
    pub fn export_to_json(&self, path: impl AsRef<Path>) -> SimResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    /// Scenario name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// File-name friendly form of the name: lowercase, spaces as underscores.
    #[must_use]
    pub fn slug(&self) -> String {
        slugify(&self.metadata.name)
    }

    /// Metadata.
    #[must_use]
    pub const fn metadata(&self) -> &ScenarioMetadata {
        &self.metadata
    }

    /// Run parameters.
    #[must_use]
    pub const fn simulation_parameters(&self) -> &SimulationParameters {
        &self.simulation_parameters
    }

    /// Event timeline in authoring order.
    #[must_use]
    pub fn events(&self) -> &[ScenarioEvent] {
        &self.events
    }

    /// Success criteria.
    #[must_use]
    pub fn expected_outcomes(&self) -> &[ExpectedOutcome] {
        &self.expected_outcomes
    }

    /// Metrics sampled during a run.
    #[must_use]
    pub fn key_metrics(&self) -> &[String] {
        &self.key_metrics
    }

    /// Free-form risk notes.
    #[must_use]
    pub fn risk_factors(&self) -> &[Value] {
        &self.risk_factors
    }

    /// Timeline entries due at `step`.
    #[must_use]
    pub fn get_events_by_step(&self, step: u64) -> Vec<&ScenarioEvent> {
        self.events.iter().filter(|e| e.step == step).collect()
    }

    /// Timeline entries with the given type tag.
    #[must_use]
    pub fn get_events_by_type(&self, event_type: &str) -> Vec<&ScenarioEvent> {
        self.events
            .iter()
            .filter(|e| e.event_type == event_type)
            .collect()
    }

    /// Non-fatal problems: late events, warm-up as long as the run, repeated
    /// event types at one step.
    #[must_use]
    pub fn structural_warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        let duration = self.simulation_parameters.duration_steps;
        if let Some(max_step) = self.events.iter().map(|e| e.step).max() {
            if max_step > duration {
                warnings.push(format!(
                    "event at step {max_step} exceeds simulation duration {duration}"
                ));
            }
        }
        let warm_up = self.simulation_parameters.warm_up_steps;
        if warm_up >= duration {
            warnings.push(format!(
                "warm-up of {warm_up} steps is not shorter than simulation duration {duration}"
            ));
        }
        let mut seen = HashSet::new();
        for event in &self.events {
            if !seen.insert((event.step, event.event_type.as_str())) {
                warnings.push(format!(
                    "duplicate {} events at step {} may conflict",
                    event.event_type, event.step
                ));
            }
        }
        warnings
    }

    fn check_invariants(&self) -> SimResult<()> {
        let params = &self.simulation_parameters;
        let problem = if self.metadata.name.trim().is_empty() {
            Some("scenario name must not be empty")
        } else if params.duration_steps == 0 {
            Some("duration_steps must be greater than zero")
        } else if params.agent_population == 0 {
            Some("agent_population must be greater than zero")
        } else if params.output_frequency == 0 {
            Some("output_frequency must be greater than zero")
        } else {
            None
        };
        problem.map_or(Ok(()), |reason| {
            Err(SimulationError::InvalidScenario(reason.to_string()))
        })
    }
}

pub(crate) fn slugify(name: &str) -> String {
    name.trim().to_lowercase().replace(' ', "_")
}

/// Builder for [`Scenario`].
#[derive(Debug)]
pub struct ScenarioBuilder {
    metadata: ScenarioMetadata,
    parameters: SimulationParameters,
    events: Vec<ScenarioEvent>,
    outcomes: Vec<ExpectedOutcome>,
    key_metrics: Vec<String>,
    risk_factors: Vec<Value>,
}

impl ScenarioBuilder {
    /// Sets run parameters.
    #[must_use]
    pub fn parameters(mut self, parameters: SimulationParameters) -> Self {
        self.parameters = parameters;
        self
    }

    /// Appends a timeline entry.
    #[must_use]
    pub fn event(mut self, event: ScenarioEvent) -> Self {
        self.events.push(event);
        self
    }

    /// Appends an expected outcome.
    #[must_use]
    pub fn outcome(mut self, outcome: ExpectedOutcome) -> Self {
        self.outcomes.push(outcome);
        self
    }

    /// Appends a metric to sample.
    #[must_use]
    pub fn key_metric(mut self, metric: impl Into<String>) -> Self {
        self.key_metrics.push(metric.into());
        self
    }

    /// Appends a risk note.
    #[must_use]
    pub fn risk_factor(mut self, risk: Value) -> Self {
        self.risk_factors.push(risk);
        self
    }

    /// Builds the scenario, enforcing hard invariants.
    pub fn build(self) -> SimResult<Scenario> {
        Scenario::try_from(ScenarioDocument {
            scenario_metadata: self.metadata,
            simulation_parameters: self.parameters,
            events: self.events,
            expected_outcomes: self.outcomes,
            key_metrics_to_track: self.key_metrics,
            risk_factors: self.risk_factors,
        })
    }
}

fn default_version() -> String {
    "1.0".into()
}

fn today() -> String {
    chrono::Local::now().format("%Y-%m-%d").to_string()
}

const fn default_estimated_duration() -> u64 {
    100
}

const fn default_tolerance() -> f64 {
    0.1
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::indexmap;
    use serde_json::json;
    use tempfile::tempdir;

    fn sample() -> Scenario {
        let mut outcome = ExpectedOutcome::new("client_retention_rate", 0.85, ComparisonType::GreaterThan)
            .at_steps([50, 100]);
        outcome.extra.insert("priority".into(), json!("high"));
        Scenario::builder(ScenarioMetadata::new("Digital Push", "Campaign then closure"))
            .parameters(SimulationParameters {
                duration_steps: 100,
                random_seed: Some(7),
                ..SimulationParameters::default()
            })
            .event(ScenarioEvent::new(
                "MarketingCampaignEvent",
                5,
                indexmap! { "intensity".to_string() => json!(0.7) },
            ))
            .event(ScenarioEvent {
                event_id: Some("closure-sfax".into()),
                description: Some("Close Sfax".into()),
                ..ScenarioEvent::new(
                    "BranchClosureEvent",
                    40,
                    indexmap! { "location".to_string() => json!("Sfax") },
                )
            })
            .outcome(outcome)
            .key_metric("client_retention_rate")
            .risk_factor(json!({ "name": "churn", "level": "medium" }))
            .build()
            .unwrap()
    }

    #[test]
    fn export_then_load_reproduces_the_bundle() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/digital_push.json");
        let scenario = sample();
        scenario.export_to_json(&path).unwrap();
        let loaded = Scenario::from_json_file(&path).unwrap();
        assert_eq!(loaded, scenario);
        assert_eq!(loaded.expected_outcomes()[0].extra["priority"], json!("high"));
    }

    #[test]
    fn exported_document_uses_template_keys() {
        let value = serde_json::to_value(sample()).unwrap();
        assert_eq!(value["scenario_metadata"]["name"], "Digital Push");
        assert_eq!(value["key_metrics_to_track"][0], "client_retention_rate");
        assert_eq!(value["expected_outcomes"][0]["comparison_type"], "greater_than");
        assert_eq!(value["expected_outcomes"][0]["priority"], "high");
        assert!(value["events"][0].get("event_id").is_none());
    }

    #[test]
    fn minimal_document_takes_defaults() {
        let scenario = Scenario::from_json_str(
            r#"{
                "scenario_metadata": { "name": "Minimal", "description": "d" },
                "events": [ { "event_type": "EconomicShockEvent", "step": 3 } ]
            }"#,
        )
        .unwrap();
        assert_eq!(scenario.simulation_parameters().duration_steps, 100);
        assert_eq!(scenario.metadata().version, "1.0");
        assert_eq!(scenario.metadata().difficulty_level, Difficulty::Medium);
        assert!(scenario.events()[0].parameters.is_empty());
        assert!(scenario.structural_warnings().is_empty());
    }

    #[test]
    fn zero_duration_is_fatal() {
        let err = Scenario::builder(ScenarioMetadata::new("Broken", "d"))
            .parameters(SimulationParameters {
                duration_steps: 0,
                ..SimulationParameters::default()
            })
            .build()
            .unwrap_err();
        assert!(matches!(err, SimulationError::InvalidScenario(_)));
    }

    #[test]
    fn late_event_is_a_warning_not_an_error() {
        let scenario = Scenario::builder(ScenarioMetadata::new("Late", "d"))
            .parameters(SimulationParameters {
                duration_steps: 50,
                ..SimulationParameters::default()
            })
            .event(ScenarioEvent::new("BranchClosureEvent", 100, IndexMap::new()))
            .build()
            .unwrap();
        let warnings = scenario.structural_warnings();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("exceeds simulation duration"));
    }

    #[test]
    fn duplicate_kind_at_one_step_and_long_warm_up_warn() {
        let scenario = Scenario::builder(ScenarioMetadata::new("Crowded", "d"))
            .parameters(SimulationParameters {
                duration_steps: 10,
                warm_up_steps: 10,
                ..SimulationParameters::default()
            })
            .event(ScenarioEvent::new("ProductLaunchEvent", 2, IndexMap::new()))
            .event(ScenarioEvent::new("ProductLaunchEvent", 2, IndexMap::new()))
            .build()
            .unwrap();
        let warnings = scenario.structural_warnings();
        assert_eq!(warnings.len(), 2);
        assert!(warnings.iter().any(|w| w.contains("warm-up")));
        assert!(warnings.iter().any(|w| w.contains("duplicate ProductLaunchEvent")));
        assert_eq!(scenario.get_events_by_step(2).len(), 2);
        assert_eq!(scenario.get_events_by_type("ProductLaunchEvent").len(), 2);
    }

    #[test]
    fn missing_and_malformed_files_are_distinguished() {
        let dir = tempdir().unwrap();
        let missing = Scenario::from_json_file(dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(missing, SimulationError::ScenarioNotFound(_)));

        let bad = dir.path().join("bad.json");
        fs::write(&bad, "{ not json").unwrap();
        let parse = Scenario::from_json_file(&bad).unwrap_err();
        assert!(matches!(parse, SimulationError::ScenarioParse { .. }));

        let negative = dir.path().join("negative.json");
        fs::write(
            &negative,
            r#"{"scenario_metadata":{"name":"n","description":"d"},"events":[{"event_type":"BranchClosureEvent","step":-1}]}"#,
        )
        .unwrap();
        assert!(matches!(
            Scenario::from_json_file(&negative).unwrap_err(),
            SimulationError::ScenarioParse { .. }
        ));
    }

    #[test]
    fn non_utf8_file_is_a_parse_error() {
        let dir = tempdir().unwrap();
        let binary = dir.path().join("bin.json");
        fs::write(&binary, [0xff, 0xfe, b'{']).unwrap();
        let err = Scenario::from_json_file(&binary).unwrap_err();
        assert!(matches!(err, SimulationError::ScenarioParse { ref path, .. } if *path == binary));
    }

    #[test]
    fn outcome_comparisons() {
        let above = ExpectedOutcome::new("m", 0.5, ComparisonType::GreaterThan);
        assert!(above.evaluate(0.6));
        assert!(!above.evaluate(0.5));
        let below = ExpectedOutcome::new("m", 0.5, ComparisonType::LessThan);
        assert!(below.evaluate(0.4));
        let near = ExpectedOutcome::new("m", 1.0, ComparisonType::WithinTolerance);
        assert!(near.evaluate(1.05));
        assert!(!near.evaluate(1.2));
        let text = ExpectedOutcome {
            target_value: TargetValue::Text("stable".into()),
            ..ExpectedOutcome::new("m", 0.0, ComparisonType::Equals)
        };
        assert!(!text.evaluate(0.0));
        let scoped = ExpectedOutcome::new("m", 0.0, ComparisonType::Equals).at_steps([10]);
        assert!(scoped.applies_at(10));
        assert!(!scoped.applies_at(11));
    }

    #[test]
    fn range_is_accepted_as_within_tolerance() {
        let outcome: ExpectedOutcome = serde_json::from_value(json!({
            "metric_name": "digital_adoption",
            "target_value": 0.3,
            "comparison_type": "range",
            "tolerance": 0.05
        }))
        .unwrap();
        assert_eq!(outcome.comparison_type, ComparisonType::WithinTolerance);
        assert!(outcome.extra.is_empty());
    }

    #[test]
    fn timeline_entries_build_concrete_events() {
        let scenario = sample();
        let event = scenario.events()[1].to_event().unwrap();
        assert_eq!(event.step(), 40);
        assert_eq!(event.event_type(), "BranchClosureEvent");
        assert_eq!(scenario.slug(), "digital_push");
    }
}
