//! Progress records emitted by the image task worker
//!
//! The worker writes one JSON log record per stdout line. A record reports
//! progress when it carries a non-empty object at `record.extra.progress`,
//! for example:
//!
//! ```json
//! {"text": "...", "record": {"message": "Drew circle 3/15", "extra": {"progress": {"circles": 20.0}}}}
//! ```

use serde_json::{Map, Value as JsonValue};

/// Latest observed progress of a running job
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    /// Named metrics, e.g. `{"circles": 20.0}`
    pub metrics: Map<String, JsonValue>,
    /// The log message the metrics were attached to, if any
    pub message: Option<String>,
}

/// Classification of a single worker log line
#[derive(Debug, Clone, PartialEq)]
pub enum LogLine {
    /// Blank or not a JSON object
    Unstructured,
    /// A structured record without progress metrics
    Record,
    /// A structured record carrying progress metrics
    Progress(ProgressEvent),
}

impl LogLine {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return LogLine::Unstructured;
        }

        let Ok(JsonValue::Object(record)) = serde_json::from_str::<JsonValue>(line) else {
            return LogLine::Unstructured;
        };

        let inner = record.get("record");
        let metrics = inner
            .and_then(|r| r.get("extra"))
            .and_then(|extra| extra.get("progress"))
            .and_then(JsonValue::as_object);

        match metrics {
            Some(metrics) if !metrics.is_empty() => LogLine::Progress(ProgressEvent {
                metrics: metrics.clone(),
                message: inner
                    .and_then(|r| r.get("message"))
                    .and_then(JsonValue::as_str)
                    .map(str::to_string),
            }),
            _ => LogLine::Record,
        }
    }
}

impl ProgressEvent {
    /// Metrics as a JSON object value
    pub fn metrics_value(&self) -> JsonValue {
        JsonValue::Object(self.metrics.clone())
    }
}
