#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rust_2018_idioms,
    missing_docs
)]

//! Bank simulation core: typed business events, a step-ordered event system,
//! and scenario orchestration with outcome checks.

/// Error taxonomy.
#[path = "../error.rs"]
pub mod error;

/// Event kinds, payloads and the factory.
#[path = "../events.rs"]
pub mod events;

/// Event queue and dispatch.
#[path = "../event_system.rs"]
pub mod event_system;

/// Scenario bundles.
#[path = "../scenario.rs"]
pub mod scenario;

/// Metric sampling and outcome validation.
#[path = "../metrics.rs"]
pub mod metrics;

/// Scenario manager.
#[path = "../manager.rs"]
pub mod manager;

/// Run results, reports and comparisons.
#[path = "../report.rs"]
pub mod report;

/// Telemetry for the simulation core.
#[path = "../helper.rs"]
pub mod helper;

/// File-based configuration.
#[path = "../config.rs"]
pub mod config;

pub use config::SimulationConfig;
pub use error::{SimResult, SimulationError};
pub use event_system::{Dispatch, DispatchOutcome, EventHandler, EventSystem};
pub use events::{create_event, Event, EventKind, EventPayload};
pub use helper::{SimulationTelemetry, SimulationTelemetryBuilder};
pub use manager::{ExecutionSummary, ScenarioManager, ScenarioManagerBuilder, ScenarioValidation};
pub use metrics::MetricProbe;
pub use report::{ReportFormat, ScenarioComparison, SimulationResults};
pub use scenario::{ExpectedOutcome, Scenario, ScenarioEvent, ScenarioMetadata, SimulationParameters};
