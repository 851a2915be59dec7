//! Step-ordered event queue with per-kind handler dispatch.

use std::{
    collections::{BTreeMap, HashSet},
    fmt, fs,
    panic::{self, AssertUnwindSafe},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::json;
use shared_logging::LogLevel;
use uuid::Uuid;

use crate::{
    events::{Event, EventKind},
    helper::SimulationTelemetry,
};

/// Handler bound to one event kind. Returning `Err` or panicking marks the
/// event as failed.
pub type EventHandler = Box<dyn FnMut(&Event) -> Result<()>>;

/// What happened to one event taken off the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "error", rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// Every handler succeeded, or none was registered.
    Processed,
    /// A handler returned an error or panicked; the message says which.
    Failed(String),
}

/// Record of one event removed from the queue by [`EventSystem::process_events`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Dispatch {
    /// Id of the dispatched event.
    pub event_id: Uuid,
    /// Kind of the dispatched event.
    pub event_type: EventKind,
    /// Step the event was scheduled for.
    pub step: u64,
    /// Result of running its handlers.
    pub outcome: DispatchOutcome,
}

impl Dispatch {
    /// Whether the event ended up in the processed log.
    #[must_use]
    pub const fn is_processed(&self) -> bool {
        matches!(self.outcome, DispatchOutcome::Processed)
    }
}

/// Event whose dispatch failed, with the handler's error message.
#[derive(Debug, PartialEq, Serialize)]
pub struct FailedEvent {
    /// The event itself.
    #[serde(flatten)]
    pub event: Event,
    /// Handler error message.
    pub error: String,
}

/// Pending and processed events of one kind. Failed events are not included.
#[derive(Debug)]
pub struct EventsByType<'a> {
    /// Still queued.
    pub pending: Vec<&'a Event>,
    /// Successfully dispatched.
    pub processed: Vec<&'a Event>,
}

/// Aggregate counts over the queue and both logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventSummary {
    /// Pending plus processed plus failed.
    pub total_events: usize,
    /// Events still queued.
    pub pending_events: usize,
    /// Events dispatched successfully.
    pub processed_events: usize,
    /// Events whose dispatch failed.
    pub failed_events: usize,
    /// Last step passed to `process_events`.
    pub current_step: u64,
    /// Occurrences per kind across queue and logs.
    pub event_types: IndexMap<EventKind, usize>,
    /// Number of handlers per kind.
    pub registered_handlers: IndexMap<EventKind, usize>,
}

/// Structural consistency report. Problems are reported, never raised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SystemValidation {
    /// True when `issues` is empty.
    pub valid: bool,
    /// Broken invariants.
    pub issues: Vec<String>,
    /// Suspicious but legal state, e.g. queued kinds nobody handles.
    pub warnings: Vec<String>,
}

#[derive(Serialize)]
struct EventHistoryExport<'a> {
    exported_at: DateTime<Utc>,
    summary: EventSummary,
    processed: &'a [Event],
    failed: &'a [FailedEvent],
    pending: Vec<&'a Event>,
}

/// Owns pending events, handlers, and the processed/failed logs.
///
/// The queue is keyed by `(step, insertion sequence)`, so it is always sorted
/// by step and events sharing a step keep their injection order.
pub struct EventSystem {
    queue: BTreeMap<(u64, u64), Event>,
    next_seq: u64,
    handlers: IndexMap<EventKind, Vec<EventHandler>>,
    processed: Vec<Event>,
    failed: Vec<FailedEvent>,
    current_step: u64,
    is_running: bool,
    telemetry: Option<SimulationTelemetry>,
}

impl fmt::Debug for EventSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSystem")
            .field("pending", &self.queue.len())
            .field("processed", &self.processed.len())
            .field("failed", &self.failed.len())
            .field("current_step", &self.current_step)
            .field("is_running", &self.is_running)
            .finish_non_exhaustive()
    }
}

impl Default for EventSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSystem {
    /// Creates an empty system without telemetry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            queue: BTreeMap::new(),
            next_seq: 0,
            handlers: IndexMap::new(),
            processed: Vec::new(),
            failed: Vec::new(),
            current_step: 0,
            is_running: false,
            telemetry: None,
        }
    }

    /// Creates an empty system logging through `telemetry`.
    #[must_use]
    pub fn with_telemetry(telemetry: SimulationTelemetry) -> Self {
        Self {
            telemetry: Some(telemetry),
            ..Self::new()
        }
    }

    /// Appends a handler for `kind`. Handlers run in registration order.
    pub fn register_event_handler<F>(&mut self, kind: EventKind, handler: F)
    where
        F: FnMut(&Event) -> Result<()> + 'static,
    {
        self.handlers.entry(kind).or_default().push(Box::new(handler));
    }

    /// Drops every handler for `kind`, returning how many were removed.
    pub fn clear_handlers(&mut self, kind: EventKind) -> usize {
        self.handlers.shift_remove(&kind).map_or(0, |removed| removed.len())
    }

    /// Number of handlers registered for `kind`.
    #[must_use]
    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers.get(&kind).map_or(0, Vec::len)
    }

    /// Queues an event behind every queued event with a step lower or equal to its own.
    ///
    /// Always returns `true`; there is no duplicate rejection because events
    /// cannot be cloned.
    pub fn inject_event(&mut self, event: Event) -> bool {
        self.log(
            LogLevel::Debug,
            "event_system.injected",
            json!({ "event_type": event.event_type(), "step": event.step() }),
        );
        self.queue.insert((event.step(), self.next_seq), event);
        self.next_seq += 1;
        true
    }

    /// Injects events in order and returns how many were queued.
    pub fn inject_events_batch(&mut self, events: impl IntoIterator<Item = Event>) -> usize {
        events
            .into_iter()
            .map(|event| self.inject_event(event))
            .filter(|queued| *queued)
            .count()
    }

    /// Dispatches every queued event with `event.step <= step`, in queue order.
    ///
    /// Each event moves to exactly one log: processed when all of its handlers
    /// succeed (or it has none), failed at the first handler error. Later
    /// handlers for a failed event are skipped. Errors never abort the loop.
    pub fn process_events(&mut self, step: u64) -> Vec<Dispatch> {
        self.current_step = step;
        let due = match step.checked_add(1) {
            Some(next) => {
                let later = self.queue.split_off(&(next, 0));
                std::mem::replace(&mut self.queue, later)
            }
            None => std::mem::take(&mut self.queue),
        };

        let mut dispatched = Vec::with_capacity(due.len());
        for event in due.into_values() {
            let outcome = match run_handlers(&mut self.handlers, &event) {
                Some(outcome) => outcome,
                None => {
                    self.log(
                        LogLevel::Debug,
                        "event_system.dispatch.unhandled",
                        json!({ "event_type": event.event_type(), "step": event.step() }),
                    );
                    DispatchOutcome::Processed
                }
            };
            dispatched.push(Dispatch {
                event_id: event.id(),
                event_type: event.kind(),
                step: event.step(),
                outcome: outcome.clone(),
            });
            match outcome {
                DispatchOutcome::Processed => self.processed.push(event),
                DispatchOutcome::Failed(error) => {
                    self.log(
                        LogLevel::Error,
                        "event_system.dispatch.failed",
                        json!({
                            "event_type": event.event_type(),
                            "step": event.step(),
                            "current_step": step,
                            "error": error,
                        }),
                    );
                    self.failed.push(FailedEvent { event, error });
                }
            }
        }
        dispatched
    }

    /// Last step passed to `process_events`.
    #[must_use]
    pub const fn current_step(&self) -> u64 {
        self.current_step
    }

    /// Advisory running flag; nothing in the system reads it.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.is_running
    }

    /// Sets the advisory running flag.
    pub fn set_running(&mut self, running: bool) {
        self.is_running = running;
    }

    /// Queued events in dispatch order, optionally only those scheduled at `step_filter`.
    #[must_use]
    pub fn get_pending_events(&self, step_filter: Option<u64>) -> Vec<&Event> {
        match step_filter {
            Some(step) => self
                .queue
                .range((step, 0)..=(step, u64::MAX))
                .map(|(_, event)| event)
                .collect(),
            None => self.queue.values().collect(),
        }
    }

    /// Successfully dispatched events, optionally only those scheduled at `step_filter`.
    #[must_use]
    pub fn get_processed_events(&self, step_filter: Option<u64>) -> Vec<&Event> {
        self.processed
            .iter()
            .filter(|event| step_filter.is_none_or(|step| event.step() == step))
            .collect()
    }

    /// Processed log in dispatch order.
    #[must_use]
    pub fn processed_events(&self) -> &[Event] {
        &self.processed
    }

    /// Failed log in dispatch order.
    #[must_use]
    pub fn failed_events(&self) -> &[FailedEvent] {
        &self.failed
    }

    /// Number of queued events.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.queue.len()
    }

    /// Pending and processed events of `kind`.
    #[must_use]
    pub fn get_events_by_type(&self, kind: EventKind) -> EventsByType<'_> {
        EventsByType {
            pending: self.queue.values().filter(|e| e.kind() == kind).collect(),
            processed: self.processed.iter().filter(|e| e.kind() == kind).collect(),
        }
    }

    /// Every event scheduled at exactly `step`, whatever its state.
    #[must_use]
    pub fn get_events_at_step(&self, step: u64) -> Vec<&Event> {
        self.get_pending_events(Some(step))
            .into_iter()
            .chain(self.processed.iter().filter(|e| e.step() == step))
            .chain(self.failed.iter().map(|f| &f.event).filter(|e| e.step() == step))
            .collect()
    }

    /// Empties the queue and both logs. Handlers stay registered.
    pub fn clear_events(&mut self) {
        self.queue.clear();
        self.processed.clear();
        self.failed.clear();
        self.log(LogLevel::Info, "event_system.cleared", json!({}));
    }

    /// Counts over the queue and both logs.
    #[must_use]
    pub fn get_event_summary(&self) -> EventSummary {
        let mut event_types = IndexMap::new();
        for event in self.all_events() {
            *event_types.entry(event.kind()).or_insert(0) += 1;
        }
        EventSummary {
            total_events: self.queue.len() + self.processed.len() + self.failed.len(),
            pending_events: self.queue.len(),
            processed_events: self.processed.len(),
            failed_events: self.failed.len(),
            current_step: self.current_step,
            event_types,
            registered_handlers: self
                .handlers
                .iter()
                .map(|(kind, handlers)| (*kind, handlers.len()))
                .collect(),
        }
    }

    /// Checks queue ordering and that no event id sits in two places.
    #[must_use]
    pub fn validate_system_state(&self) -> SystemValidation {
        let mut issues = Vec::new();
        let mut warnings = Vec::new();

        let mut previous_step = 0;
        for ((key_step, _), event) in &self.queue {
            if *key_step != event.step() {
                issues.push(format!(
                    "event {} queued under step {key_step} but scheduled for step {}",
                    event.id(),
                    event.step()
                ));
            }
            if event.step() < previous_step {
                issues.push(format!(
                    "queue out of order: step {} follows step {previous_step}",
                    event.step()
                ));
            }
            previous_step = event.step();
        }

        let mut seen = HashSet::new();
        for event in self.all_events() {
            if !seen.insert(event.id()) {
                issues.push(format!("event {} appears in more than one list", event.id()));
            }
        }

        let mut unhandled: Vec<EventKind> = Vec::new();
        for event in self.queue.values() {
            let kind = event.kind();
            if self.handler_count(kind) == 0 && !unhandled.contains(&kind) {
                unhandled.push(kind);
            }
        }
        if !unhandled.is_empty() {
            let tags: Vec<_> = unhandled.iter().map(|kind| kind.tag()).collect();
            warnings.push(format!("unhandled event types: {}", tags.join(", ")));
        }

        SystemValidation {
            valid: issues.is_empty(),
            issues,
            warnings,
        }
    }

    /// Writes processed, failed and pending events to a JSON file.
    pub fn export_event_history(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating export directory {}", parent.display()))?;
        }
        let export = EventHistoryExport {
            exported_at: Utc::now(),
            summary: self.get_event_summary(),
            processed: &self.processed,
            failed: &self.failed,
            pending: self.queue.values().collect(),
        };
        let data = serde_json::to_vec_pretty(&export)?;
        fs::write(path, data)
            .with_context(|| format!("writing event history {}", path.display()))?;
        self.log(
            LogLevel::Info,
            "simulation.export.written",
            json!({ "path": path.display().to_string(), "kind": "event_history" }),
        );
        Ok(path.to_path_buf())
    }

    fn all_events(&self) -> impl Iterator<Item = &Event> {
        self.queue
            .values()
            .chain(self.processed.iter())
            .chain(self.failed.iter().map(|failed| &failed.event))
    }

    fn log(&self, level: LogLevel, message: &str, metadata: serde_json::Value) {
        if let Some(tel) = &self.telemetry {
            tel.log_or_report(level, message, metadata);
        }
    }
}

/// Runs the handlers for `event`; `None` when its kind has no handler.
fn run_handlers(
    handlers: &mut IndexMap<EventKind, Vec<EventHandler>>,
    event: &Event,
) -> Option<DispatchOutcome> {
    let handlers = handlers.get_mut(&event.kind()).filter(|list| !list.is_empty())?;
    for handler in handlers.iter_mut() {
        match panic::catch_unwind(AssertUnwindSafe(|| handler(event))) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Some(DispatchOutcome::Failed(err.to_string())),
            Err(payload) => {
                let reason = payload
                    .downcast_ref::<&str>()
                    .map(|msg| (*msg).to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".into());
                return Some(DispatchOutcome::Failed(format!("handler panicked: {reason}")));
            }
        }
    }
    Some(DispatchOutcome::Processed)
}
