use std::path::PathBuf;

use thiserror::Error;

/// Failures surfaced by the simulation core.
#[derive(Debug, Error)]
pub enum SimulationError {
    /// A type tag that does not name any known event kind.
    #[error("unknown event type: {0}")]
    UnknownEventType(String),
    /// Parameters that cannot be turned into the named event kind.
    #[error("invalid parameters for {event_type}: {reason}")]
    InvalidEventParameters {
        /// Tag of the event being built.
        event_type: String,
        /// Why the parameters were rejected.
        reason: String,
    },
    /// Scenario file missing from the template tree.
    #[error("scenario file not found: {}", .0.display())]
    ScenarioNotFound(PathBuf),
    /// Scenario file that is not a well-formed scenario document.
    #[error("failed to parse scenario {}: {reason}", path.display())]
    ScenarioParse {
        /// File that failed to parse.
        path: PathBuf,
        /// Parser message.
        reason: String,
    },
    /// Scenario that fails hard validation.
    #[error("invalid scenario: {0}")]
    InvalidScenario(String),
    /// Filesystem failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// JSON encoding failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result alias for fallible core operations.
pub type SimResult<T> = std::result::Result<T, SimulationError>;
