use std::{
    fmt,
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use anyhow::Result;
use serde_json::Value;
use shared_event_bus::{NoticePublisher, NoticeRecord};
use shared_logging::{JsonLogger, LogLevel, LogRecord};
use uuid::Uuid;

/// Telemetry builder for the simulation core.
pub struct SimulationTelemetryBuilder {
    module: String,
    log_path: Option<PathBuf>,
    min_level: LogLevel,
    publisher: Option<Arc<dyn NoticePublisher>>,
}

impl SimulationTelemetryBuilder {
    /// Creates a new builder scoped to a module label.
    #[must_use]
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            log_path: None,
            min_level: LogLevel::Debug,
            publisher: None,
        }
    }

    /// Sets the JSON-lines log path.
    #[must_use]
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Drops log records below `level`.
    #[must_use]
    pub const fn min_level(mut self, level: LogLevel) -> Self {
        self.min_level = level;
        self
    }

    /// Sets the notice publisher.
    #[must_use]
    pub fn notice_publisher(mut self, publisher: Arc<dyn NoticePublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Builds telemetry.
    pub fn build(self) -> Result<SimulationTelemetry> {
        let logger = match self.log_path {
            Some(path) => Some(JsonLogger::with_min_level(path, self.min_level)?),
            None => None,
        };
        Ok(SimulationTelemetry {
            inner: Arc::new(TelemetryInner {
                module: self.module,
                logger,
                publisher: self.publisher,
                failures: AtomicUsize::new(0),
            }),
        })
    }
}

/// Telemetry handle shared across simulation components.
#[derive(Clone)]
pub struct SimulationTelemetry {
    inner: Arc<TelemetryInner>,
}

impl fmt::Debug for SimulationTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulationTelemetry")
            .field("module", &self.inner.module)
            .field("logging", &self.inner.logger.is_some())
            .field("notices", &self.inner.publisher.is_some())
            .finish()
    }
}

struct TelemetryInner {
    module: String,
    logger: Option<JsonLogger>,
    publisher: Option<Arc<dyn NoticePublisher>>,
    failures: AtomicUsize,
}

impl TelemetryInner {
    /// Counts a failed write; only the first one reaches stderr.
    fn report_failure(&self, what: &str, err: &anyhow::Error) {
        if self.failures.fetch_add(1, Ordering::Relaxed) == 0 {
            eprintln!(
                "simulation telemetry `{}` {what} failed: {err:?} (later failures are only counted)",
                self.module
            );
        }
    }
}

impl SimulationTelemetry {
    /// Returns a builder.
    #[must_use]
    pub fn builder(module: impl Into<String>) -> SimulationTelemetryBuilder {
        SimulationTelemetryBuilder::new(module)
    }

    /// Module label attached to every record.
    #[must_use]
    pub fn module(&self) -> &str {
        &self.inner.module
    }

    /// Appends a structured log line.
    pub fn log(&self, level: LogLevel, message: &str, metadata: Value) -> Result<()> {
        if let Some(logger) = &self.inner.logger {
            let record = LogRecord::new(&self.inner.module, level, message).with_metadata(metadata);
            logger.log(&record)?;
        }
        Ok(())
    }

    /// Publishes a lifecycle notice.
    ///
    /// Inside a tokio runtime the publish is spawned; otherwise it runs to
    /// completion on a throwaway current-thread runtime.
    pub fn notice(&self, kind: &str, step: Option<u64>, payload: Value) -> Result<()> {
        let Some(publisher) = &self.inner.publisher else {
            return Ok(());
        };
        let record = NoticeRecord {
            id: format!("notice-{}", Uuid::new_v4()),
            source: self.inner.module.clone(),
            kind: kind.into(),
            step,
            timestamp: chrono::Utc::now().to_rfc3339(),
            payload,
        };
        if tokio::runtime::Handle::try_current().is_ok() {
            let publisher = Arc::clone(publisher);
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                if let Err(err) = publisher.publish(record).await {
                    inner.report_failure("notice publish", &err);
                }
            });
            Ok(())
        } else {
            tokio::runtime::Builder::new_current_thread()
                .build()?
                .block_on(publisher.publish(record))
        }
    }

    /// Like [`Self::log`] for callers that must not fail on telemetry.
    pub fn log_or_report(&self, level: LogLevel, message: &str, metadata: Value) {
        if let Err(err) = self.log(level, message, metadata) {
            self.inner.report_failure("log write", &err);
        }
    }

    /// Like [`Self::notice`] for callers that must not fail on telemetry.
    pub fn notice_or_report(&self, kind: &str, step: Option<u64>, payload: Value) {
        if let Err(err) = self.notice(kind, step, payload) {
            self.inner.report_failure("notice publish", &err);
        }
    }

    /// Log or notice writes that failed so far.
    #[must_use]
    pub fn failure_count(&self) -> usize {
        self.inner.failures.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shared_event_bus::MemoryNoticeBus;
    use tempfile::tempdir;

    #[test]
    fn telemetry_writes_log_and_notice() {
        let tmp = tempdir().unwrap();
        let bus = Arc::new(MemoryNoticeBus::new(4));
        let log_path = tmp.path().join("sim.log");
        let telemetry = SimulationTelemetry::builder("simulation")
            .log_path(&log_path)
            .notice_publisher(bus.clone())
            .build()
            .unwrap();
        telemetry
            .log(LogLevel::Info, "simulation.run.started", json!({ "scenario": "demo" }))
            .unwrap();
        telemetry
            .notice("simulation.run.completed", None, json!({ "status": "ok" }))
            .unwrap();
        assert!(std::fs::read_to_string(&log_path)
            .unwrap()
            .contains("simulation.run.started"));
        let notices = bus.snapshot();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].source, "simulation");
    }

    struct RejectingPublisher;

    #[async_trait::async_trait]
    impl NoticePublisher for RejectingPublisher {
        async fn publish(&self, _notice: NoticeRecord) -> Result<()> {
            anyhow::bail!("notice sink offline")
        }
    }

    #[test]
    fn failed_writes_are_counted_not_raised() {
        let telemetry = SimulationTelemetry::builder("simulation")
            .notice_publisher(Arc::new(RejectingPublisher))
            .build()
            .unwrap();
        assert!(telemetry.notice("scenario.loaded", None, Value::Null).is_err());
        telemetry.notice_or_report("scenario.loaded", None, Value::Null);
        telemetry.notice_or_report("simulation.run.completed", Some(3), Value::Null);
        assert_eq!(telemetry.failure_count(), 2);
        let clone = telemetry.clone();
        clone.log_or_report(LogLevel::Info, "simulation.run.started", Value::Null);
        assert_eq!(clone.failure_count(), 2);
    }

    #[test]
    fn telemetry_without_sinks_is_silent() {
        let telemetry = SimulationTelemetry::builder("quiet").build().unwrap();
        telemetry.log(LogLevel::Error, "nothing", Value::Null).unwrap();
        telemetry.notice("nothing", Some(1), Value::Null).unwrap();
        assert_eq!(telemetry.module(), "quiet");
    }
}
