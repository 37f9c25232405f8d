use std::{fmt, path::PathBuf, sync::Arc};

use anyhow::Result;
use serde_json::Value;
use shared_logging::{JsonLogger, LogLevel, LogRecord};
use uuid::Uuid;

/// Builder for selection telemetry sinks.
pub struct SelectionTelemetryBuilder {
    module: String,
    log_path: Option<PathBuf>,
    min_level: LogLevel,
    echo: bool,
    run_id: Option<Uuid>,
}

impl SelectionTelemetryBuilder {
    /// Creates the builder.
    #[must_use]
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            log_path: None,
            min_level: LogLevel::Info,
            echo: false,
            run_id: None,
        }
    }

    /// Sets the JSON-lines log path.
    #[must_use]
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Drops records below `level`.
    #[must_use]
    pub const fn min_level(mut self, level: LogLevel) -> Self {
        self.min_level = level;
        self
    }

    /// Mirrors records to stderr.
    #[must_use]
    pub const fn echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    /// Pins the run id instead of drawing a fresh one.
    #[must_use]
    pub const fn run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }

    /// Builds the telemetry handle.
    pub fn build(self) -> Result<SelectionTelemetry> {
        let logger = match self.log_path {
            Some(path) => Some(
                JsonLogger::new(path)?
                    .with_min_level(self.min_level)
                    .with_echo(self.echo),
            ),
            None => None,
        };
        Ok(SelectionTelemetry {
            inner: Arc::new(TelemetryInner {
                module: self.module,
                run_id: self.run_id.unwrap_or_else(Uuid::new_v4),
                logger,
                min_level: self.min_level,
                echo: self.echo,
            }),
        })
    }
}

/// Telemetry handle shared across selection components.
///
/// Every record carries the run id so interleaved logs of several runs can be
/// separated.
#[derive(Clone)]
pub struct SelectionTelemetry {
    inner: Arc<TelemetryInner>,
}

impl fmt::Debug for SelectionTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectionTelemetry")
            .field("module", &self.inner.module)
            .field("run_id", &self.inner.run_id)
            .finish()
    }
}

struct TelemetryInner {
    module: String,
    run_id: Uuid,
    logger: Option<JsonLogger>,
    min_level: LogLevel,
    echo: bool,
}

impl SelectionTelemetry {
    /// Returns a builder.
    #[must_use]
    pub fn builder(module: impl Into<String>) -> SelectionTelemetryBuilder {
        SelectionTelemetryBuilder::new(module)
    }

    /// Identifier stamped on every record of this run.
    #[must_use]
    pub fn run_id(&self) -> Uuid {
        self.inner.run_id
    }

    /// Logs structured metadata.
    pub fn log(&self, level: LogLevel, message: &str, metadata: Value) -> Result<()> {
        if level < self.inner.min_level {
            return Ok(());
        }
        let mut record = LogRecord::new(&self.inner.module, level, message).with_metadata(metadata);
        record
            .metadata
            .insert("run_id".into(), Value::String(self.inner.run_id.to_string()));
        match &self.inner.logger {
            Some(logger) => logger.log(&record)?,
            None if self.inner.echo => eprintln!("{}", record.render_line()),
            None => {}
        }
        Ok(())
    }
}

/// Logs through an optional handle, ignoring sink failures.
pub(crate) fn log(telemetry: Option<&SelectionTelemetry>, level: LogLevel, message: &str, metadata: Value) {
    if let Some(tel) = telemetry {
        let _ = tel.log(level, message, metadata);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn records_carry_run_id_and_respect_level() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("selection.jsonl");
        let run_id = Uuid::new_v4();
        let telemetry = SelectionTelemetry::builder("selector")
            .log_path(&path)
            .run_id(run_id)
            .build()
            .unwrap();
        telemetry
            .log(LogLevel::Debug, "selection.candidate_scored", json!({ "feature": "x1" }))
            .unwrap();
        telemetry
            .log(LogLevel::Info, "selection.round_committed", json!({ "round": 1 }))
            .unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 1);
        let record: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(record["message"], "selection.round_committed");
        assert_eq!(record["metadata"]["run_id"], run_id.to_string());
        assert_eq!(telemetry.run_id(), run_id);
    }

    #[test]
    fn handle_without_sinks_is_silent() {
        let telemetry = SelectionTelemetry::builder("grid").build().unwrap();
        assert!(telemetry.log(LogLevel::Error, "noop", Value::Null).is_ok());
    }
}
