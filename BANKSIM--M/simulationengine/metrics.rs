use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{
    event_system::EventSystem,
    scenario::{ComparisonType, ExpectedOutcome, Scenario, TargetValue},
};

/// Source of metric values supplied by the surrounding agent simulation.
///
/// The core never computes business metrics itself; it only asks the probe
/// at sampling steps and records what comes back.
pub trait MetricProbe {
    /// Value of `metric` at `step`, or `None` when the metric is unavailable.
    fn sample(&mut self, metric: &str, step: u64, events: &EventSystem) -> Option<f64>;
}

impl<F> MetricProbe for F
where
    F: FnMut(&str, u64, &EventSystem) -> Option<f64>,
{
    fn sample(&mut self, metric: &str, step: u64, events: &EventSystem) -> Option<f64> {
        self(metric, step, events)
    }
}

/// One recorded metric value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    /// Step at which the value was taken.
    pub step: u64,
    /// Recorded value.
    pub value: f64,
}

/// Samples per metric, in sampling order.
pub type MetricSeries = IndexMap<String, Vec<MetricSample>>;

/// Result of checking one outcome at one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepCheck {
    /// Step checked.
    pub step: u64,
    /// Value recorded at that step, if any.
    pub actual_value: Option<f64>,
    /// Target the value was compared with.
    pub target_value: TargetValue,
    /// Whether the comparison held.
    pub valid: bool,
    /// Why the check could not be performed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// All checks for one expected outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeValidation {
    /// Metric measured.
    pub metric_name: String,
    /// Comparison applied.
    pub comparison_type: ComparisonType,
    /// Per-step checks.
    pub results: Vec<StepCheck>,
}

impl OutcomeValidation {
    /// True when at least one check ran and every check held.
    #[must_use]
    pub fn passed(&self) -> bool {
        !self.results.is_empty() && self.results.iter().all(|check| check.valid)
    }

    /// Number of checks that held.
    #[must_use]
    pub fn valid_count(&self) -> usize {
        self.results.iter().filter(|check| check.valid).count()
    }
}

/// Metrics sampled for a scenario: its key metrics followed by any outcome
/// metric not already listed.
#[must_use]
pub fn tracked_metrics(scenario: &Scenario) -> Vec<String> {
    let mut metrics: Vec<String> = Vec::new();
    let outcome_metrics = scenario
        .expected_outcomes()
        .iter()
        .map(|outcome| &outcome.metric_name);
    for metric in scenario.key_metrics().iter().chain(outcome_metrics) {
        if !metrics.contains(metric) {
            metrics.push(metric.clone());
        }
    }
    metrics
}

/// Whether metrics are sampled at `step`: every `output_frequency` steps and
/// at every outcome measurement step.
#[must_use]
pub fn is_sampling_step(scenario: &Scenario, step: u64) -> bool {
    let frequency = scenario.simulation_parameters().output_frequency.max(1);
    step % frequency == 0
        || scenario
            .expected_outcomes()
            .iter()
            .any(|outcome| outcome.measurement_steps.contains(&step))
}

/// Checks every outcome against the recorded samples.
///
/// Outcomes with measurement steps are checked at exactly those steps; a step
/// with no sample fails with an error. Outcomes without measurement steps are
/// checked at every sample of their metric.
#[must_use]
pub fn validate_outcomes(outcomes: &[ExpectedOutcome], metrics: &MetricSeries) -> Vec<OutcomeValidation> {
    outcomes
        .iter()
        .map(|outcome| {
            let samples = metrics
                .get(&outcome.metric_name)
                .map_or(&[][..], Vec::as_slice);
            let results = if outcome.measurement_steps.is_empty() {
                samples
                    .iter()
                    .map(|sample| check(outcome, sample.step, Some(sample.value)))
                    .collect()
            } else {
                outcome
                    .measurement_steps
                    .iter()
                    .map(|step| {
                        let value = samples
                            .iter()
                            .find(|sample| sample.step == *step)
                            .map(|sample| sample.value);
                        check(outcome, *step, value)
                    })
                    .collect()
            };
            OutcomeValidation {
                metric_name: outcome.metric_name.clone(),
                comparison_type: outcome.comparison_type,
                results,
            }
        })
        .collect()
}

fn check(outcome: &ExpectedOutcome, step: u64, value: Option<f64>) -> StepCheck {
    match value {
        Some(actual) => StepCheck {
            step,
            actual_value: Some(actual),
            target_value: outcome.target_value.clone(),
            valid: outcome.evaluate(actual),
            error: None,
        },
        None => StepCheck {
            step,
            actual_value: None,
            target_value: outcome.target_value.clone(),
            valid: false,
            error: Some("metric not collected for step".into()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::{ScenarioMetadata, SimulationParameters};
    use indexmap::indexmap;

    fn series(values: &[(u64, f64)]) -> Vec<MetricSample> {
        values
            .iter()
            .map(|(step, value)| MetricSample {
                step: *step,
                value: *value,
            })
            .collect()
    }

    #[test]
    fn measurement_steps_are_checked_individually() {
        let outcome = ExpectedOutcome::new("retention", 0.8, ComparisonType::GreaterThan)
            .at_steps([10, 20, 30]);
        let metrics = indexmap! {
            "retention".to_string() => series(&[(10, 0.9), (20, 0.7)]),
        };
        let validation = validate_outcomes(&[outcome], &metrics);
        let checks = &validation[0].results;
        assert!(checks[0].valid);
        assert!(!checks[1].valid);
        assert_eq!(checks[2].actual_value, None);
        assert_eq!(checks[2].error.as_deref(), Some("metric not collected for step"));
        assert_eq!(validation[0].valid_count(), 1);
        assert!(!validation[0].passed());
    }

    #[test]
    fn unscoped_outcome_checks_every_sample() {
        let outcome = ExpectedOutcome::new("adoption", 0.5, ComparisonType::WithinTolerance);
        let metrics = indexmap! { "adoption".to_string() => series(&[(5, 0.45), (10, 0.55)]) };
        let validation = validate_outcomes(&[outcome.clone()], &metrics);
        assert!(validation[0].passed());
        let empty = validate_outcomes(&[outcome], &MetricSeries::new());
        assert!(empty[0].results.is_empty());
        assert!(!empty[0].passed());
    }

    #[test]
    fn tracked_metrics_merge_key_metrics_and_outcomes() {
        let scenario = Scenario::builder(ScenarioMetadata::new("m", "d"))
            .parameters(SimulationParameters {
                output_frequency: 10,
                ..SimulationParameters::default()
            })
            .key_metric("retention")
            .outcome(ExpectedOutcome::new("retention", 0.8, ComparisonType::Equals))
            .outcome(ExpectedOutcome::new("churn", 0.1, ComparisonType::LessThan).at_steps([15]))
            .build()
            .unwrap();
        assert_eq!(tracked_metrics(&scenario), vec!["retention", "churn"]);
        assert!(is_sampling_step(&scenario, 20));
        assert!(is_sampling_step(&scenario, 15));
        assert!(!is_sampling_step(&scenario, 16));
    }

    #[test]
    fn closures_act_as_probes() {
        let mut probe = |metric: &str, step: u64, events: &EventSystem| {
            (metric == "pending" && events.pending_count() == 0).then_some(if step == 3 { 1.5 } else { 0.0 })
        };
        let system = EventSystem::new();
        assert_eq!(MetricProbe::sample(&mut probe, "pending", 3, &system), Some(1.5));
        assert_eq!(MetricProbe::sample(&mut probe, "other", 3, &system), None);
    }
}
