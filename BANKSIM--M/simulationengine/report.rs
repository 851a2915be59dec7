use std::{fmt::Write as _, path::PathBuf, str::FromStr};

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{
    metrics::{MetricSeries, OutcomeValidation},
    scenario::ScenarioMetadata,
};

/// Outcome of a full scenario run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationResults {
    /// Scenario name.
    pub scenario_name: String,
    /// Scenario metadata at run time.
    pub metadata: ScenarioMetadata,
    /// When the run began.
    pub started_at: DateTime<Utc>,
    /// When the run ended.
    pub finished_at: DateTime<Utc>,
    /// Number of steps advanced.
    pub steps_completed: u64,
    /// Events accepted into the queue.
    pub events_injected: usize,
    /// Events whose handlers all succeeded.
    pub events_processed: usize,
    /// Scenario events the factory rejected.
    pub events_failed: usize,
    /// Events whose handler chain failed during dispatch.
    pub handler_failures: usize,
    /// Events left in the queue after the last step.
    pub events_pending: usize,
    /// Sampled metric values.
    pub metrics: MetricSeries,
    /// Outcome checks.
    pub validation_results: Vec<OutcomeValidation>,
    /// Where the results document was written.
    pub results_file: PathBuf,
    /// Where the event history was exported.
    pub event_history_file: PathBuf,
}

impl SimulationResults {
    /// Outcomes whose every check held.
    #[must_use]
    pub fn outcomes_passed(&self) -> usize {
        self.validation_results
            .iter()
            .filter(|validation| validation.passed())
            .count()
    }
}

/// Output format for run reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    /// Pretty-printed JSON.
    #[default]
    Json,
    /// Human-readable Markdown.
    Markdown,
}

impl ReportFormat {
    /// File extension used for the format.
    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Markdown => "md",
        }
    }
}

impl FromStr for ReportFormat {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "markdown" | "md" => Ok(Self::Markdown),
            other => bail!("unsupported report format `{other}`"),
        }
    }
}

/// Renders a report for one run.
pub fn render(results: &SimulationResults, format: ReportFormat) -> Result<String> {
    match format {
        ReportFormat::Json => Ok(serde_json::to_string_pretty(results)?),
        ReportFormat::Markdown => Ok(render_markdown(results)),
    }
}

fn render_markdown(results: &SimulationResults) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Simulation Report: {}", results.scenario_name);
    let _ = writeln!(out);
    if !results.metadata.description.is_empty() {
        let _ = writeln!(out, "{}", results.metadata.description);
        let _ = writeln!(out);
    }
    let _ = writeln!(out, "## Run");
    let _ = writeln!(out);
    let _ = writeln!(out, "- Started: {}", results.started_at.to_rfc3339());
    let _ = writeln!(out, "- Finished: {}", results.finished_at.to_rfc3339());
    let _ = writeln!(out, "- Steps completed: {}", results.steps_completed);
    let _ = writeln!(out, "- Events injected: {}", results.events_injected);
    let _ = writeln!(out, "- Events processed: {}", results.events_processed);
    let _ = writeln!(out, "- Events rejected: {}", results.events_failed);
    let _ = writeln!(out, "- Handler failures: {}", results.handler_failures);
    let _ = writeln!(out, "- Events pending: {}", results.events_pending);
    let _ = writeln!(out);

    let _ = writeln!(out, "## Expected Outcomes");
    let _ = writeln!(out);
    if results.validation_results.is_empty() {
        let _ = writeln!(out, "No expected outcomes defined.");
    } else {
        let _ = writeln!(out, "| Metric | Comparison | Checks | Status |");
        let _ = writeln!(out, "| --- | --- | --- | --- |");
        for validation in &results.validation_results {
            let status = if validation.passed() { "PASS" } else { "FAIL" };
            let _ = writeln!(
                out,
                "| {} | {:?} | {}/{} | {status} |",
                validation.metric_name,
                validation.comparison_type,
                validation.valid_count(),
                validation.results.len(),
            );
        }
    }
    let _ = writeln!(out);

    let _ = writeln!(out, "## Metrics");
    let _ = writeln!(out);
    if results.metrics.is_empty() {
        let _ = writeln!(out, "No metrics collected.");
    }
    for (metric, samples) in &results.metrics {
        let last = samples
            .last()
            .map_or_else(|| "n/a".to_string(), |sample| format!("{:.4} @ step {}", sample.value, sample.step));
        let _ = writeln!(out, "- {metric}: {} samples, last {last}", samples.len());
    }
    out
}

/// Side-by-side summary of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparedScenario {
    /// Scenario name.
    pub scenario_name: String,
    /// Steps advanced.
    pub steps_completed: u64,
    /// Successful dispatches.
    pub events_processed: usize,
    /// Dispatches with a failing handler.
    pub handler_failures: usize,
    /// Outcomes that passed.
    pub outcomes_passed: usize,
    /// Outcomes defined.
    pub outcomes_total: usize,
}

/// Cross-run comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioComparison {
    /// Compared runs in request order.
    pub scenarios: Vec<ComparedScenario>,
    /// Last sampled value of each metric per scenario.
    pub final_metrics: IndexMap<String, IndexMap<String, f64>>,
    /// Requested names with no stored run.
    pub missing: Vec<String>,
    /// When the comparison was made.
    pub generated_at: DateTime<Utc>,
}

/// Compares stored runs. Metrics are keyed by metric then scenario.
pub fn compare(runs: &[&SimulationResults], missing: Vec<String>) -> ScenarioComparison {
    let mut final_metrics: IndexMap<String, IndexMap<String, f64>> = IndexMap::new();
    for run in runs {
        for (metric, samples) in &run.metrics {
            if let Some(last) = samples.last() {
                final_metrics
                    .entry(metric.clone())
                    .or_default()
                    .insert(run.scenario_name.clone(), last.value);
            }
        }
    }
    ScenarioComparison {
        scenarios: runs
            .iter()
            .map(|run| ComparedScenario {
                scenario_name: run.scenario_name.clone(),
                steps_completed: run.steps_completed,
                events_processed: run.events_processed,
                handler_failures: run.handler_failures,
                outcomes_passed: run.outcomes_passed(),
                outcomes_total: run.validation_results.len(),
            })
            .collect(),
        final_metrics,
        missing,
        generated_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        metrics::{MetricSample, StepCheck},
        scenario::{ComparisonType, TargetValue},
    };
    use indexmap::indexmap;

    fn results(name: &str, last: f64) -> SimulationResults {
        SimulationResults {
            scenario_name: name.into(),
            metadata: ScenarioMetadata::new(name, "quarterly retention push"),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            steps_completed: 20,
            events_injected: 2,
            events_processed: 2,
            events_failed: 0,
            handler_failures: 0,
            events_pending: 0,
            metrics: indexmap! {
                "retention".to_string() => vec![
                    MetricSample { step: 10, value: 0.5 },
                    MetricSample { step: 20, value: last },
                ],
            },
            validation_results: vec![OutcomeValidation {
                metric_name: "retention".into(),
                comparison_type: ComparisonType::GreaterThan,
                results: vec![StepCheck {
                    step: 20,
                    actual_value: Some(last),
                    target_value: TargetValue::Number(0.6),
                    valid: last > 0.6,
                    error: None,
                }],
            }],
            results_file: PathBuf::from("out/r.json"),
            event_history_file: PathBuf::from("out/h.json"),
        }
    }

    #[test]
    fn markdown_report_lists_outcomes_and_metrics() {
        let rendered = render(&results("Spring Push", 0.7), ReportFormat::Markdown).unwrap();
        assert!(rendered.starts_with("# Simulation Report: Spring Push"));
        assert!(rendered.contains("| retention | GreaterThan | 1/1 | PASS |"));
        assert!(rendered.contains("- retention: 2 samples, last 0.7000 @ step 20"));
    }

    #[test]
    fn json_report_is_parseable() {
        let rendered = render(&results("a", 0.4), ReportFormat::Json).unwrap();
        let value: serde_json::Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(value["scenario_name"], "a");
        assert_eq!(value["validation_results"][0]["results"][0]["valid"], false);
    }

    #[test]
    fn comparison_keys_final_metrics_by_scenario() {
        let a = results("a", 0.7);
        let b = results("b", 0.4);
        let comparison = compare(&[&a, &b], vec!["c".into()]);
        assert_eq!(comparison.scenarios[0].outcomes_passed, 1);
        assert_eq!(comparison.scenarios[1].outcomes_passed, 0);
        assert!((comparison.final_metrics["retention"]["b"] - 0.4).abs() < f64::EPSILON);
        assert_eq!(comparison.missing, vec!["c".to_string()]);
    }

    #[test]
    fn formats_parse_case_insensitively() {
        assert_eq!("Markdown".parse::<ReportFormat>().unwrap(), ReportFormat::Markdown);
        assert_eq!("md".parse::<ReportFormat>().unwrap().extension(), "md");
        assert!("pdf".parse::<ReportFormat>().is_err());
    }
}
