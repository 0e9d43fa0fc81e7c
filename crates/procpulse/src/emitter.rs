//! Structured log events and the emitters that write them
//!
//! An [`Event`] is a named record with a level and a flat set of key/value
//! attributes. Emitters turn events into output lines; the reporter and
//! the detector only depend on the [`LogEmitter`] trait.

use serde::Serialize;
use serde_json::{Map, Value};
use std::io::Write;
use std::sync::Mutex;
use tracing::{error, info, warn};

/// Value of the `via` attribute attached to every event
pub const VIA: &str = "procpulse";

/// Severity of an emitted event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Info,
    Error,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Info => "info",
            Level::Error => "error",
        }
    }
}

/// Kind of metric carried by an event's `type` attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    /// Point-in-time value
    Gauge,
    /// Monotonically increasing value
    Counter,
}

impl MetricType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::Gauge => "gauge",
            MetricType::Counter => "counter",
        }
    }
}

/// A single structured log event
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub source: String,
    pub level: Level,
    pub title: String,
    pub attributes: Map<String, Value>,
}

impl Event {
    pub fn new(source: impl Into<String>, level: Level, title: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            level,
            title: title.into(),
            attributes: Map::new(),
        }
    }

    /// Add or replace an attribute
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    /// Numeric `value` attribute, if present
    pub fn value(&self) -> Option<f64> {
        self.attribute("value").and_then(Value::as_f64)
    }

    /// Flatten into a single JSON object
    ///
    /// `source`, `level` and `title` always win over attributes with the
    /// same key.
    pub fn to_json(&self) -> Value {
        let mut line = self.attributes.clone();
        line.insert("source".to_string(), Value::from(self.source.clone()));
        line.insert("level".to_string(), Value::from(self.level.as_str()));
        line.insert("title".to_string(), Value::from(self.title.clone()));
        Value::Object(line)
    }
}

/// Common attributes stamped onto every event from one reporter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventTags {
    pub source: String,
    pub env: String,
}

impl EventTags {
    pub fn new(source: impl Into<String>, env: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            env: env.into(),
        }
    }

    /// Event carrying `env` and `via` but no metric fields
    pub fn event(&self, level: Level, title: impl Into<String>) -> Event {
        Event::new(self.source.clone(), level, title)
            .with("env", self.env.clone())
            .with("via", VIA)
    }

    /// Info-level metric event with `type` and `value`
    pub fn metric(&self, title: impl Into<String>, kind: MetricType, value: impl Into<Value>) -> Event {
        self.event(Level::Info, title)
            .with("type", kind.as_str())
            .with("value", value)
    }

    pub fn gauge(&self, title: impl Into<String>, value: impl Into<Value>) -> Event {
        self.metric(title, MetricType::Gauge, value)
    }
}

/// Sink for structured events
pub trait LogEmitter: Send + Sync {
    fn emit(&self, event: &Event);
}

/// Writes each event as one JSON object per line
pub struct JsonLineEmitter<W: Write + Send> {
    writer: Mutex<W>,
    timestamps: bool,
}

impl JsonLineEmitter<std::io::Stderr> {
    /// Emitter writing to the process's standard error
    pub fn stderr() -> Self {
        Self::new(std::io::stderr())
    }
}

impl<W: Write + Send> JsonLineEmitter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
            timestamps: false,
        }
    }

    /// Add an RFC 3339 `timestamp` attribute to every line
    pub fn with_timestamps(mut self) -> Self {
        self.timestamps = true;
        self
    }

    /// Recover the underlying writer
    pub fn into_inner(self) -> W {
        self.writer
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn format_line(&self, event: &Event) -> serde_json::Result<Vec<u8>> {
        let mut line = event.to_json();
        if self.timestamps {
            if let Value::Object(map) = &mut line {
                map.insert(
                    "timestamp".to_string(),
                    Value::from(chrono::Utc::now().to_rfc3339()),
                );
            }
        }
        let mut bytes = serde_json::to_vec(&line)?;
        bytes.push(b'\n');
        Ok(bytes)
    }
}

impl<W: Write + Send> LogEmitter for JsonLineEmitter<W> {
    fn emit(&self, event: &Event) {
        let bytes = match self.format_line(event) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(title = %event.title, error = %e, "Failed to format event");
                return;
            }
        };

        let mut writer = self
            .writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Err(e) = writer.write_all(&bytes).and_then(|_| writer.flush()) {
            warn!(title = %event.title, error = %e, "Failed to write event");
        }
    }
}

/// Forwards events into `tracing`, for hosts that already ship their
/// tracing output to the log pipeline
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEmitter;

impl LogEmitter for TracingEmitter {
    fn emit(&self, event: &Event) {
        let attributes = Value::Object(event.attributes.clone());
        match event.level {
            Level::Info => info!(
                target: "procpulse::events",
                source = %event.source,
                title = %event.title,
                attributes = %attributes,
                "{}",
                event.title
            ),
            Level::Error => error!(
                target: "procpulse::events",
                source = %event.source,
                title = %event.title,
                attributes = %attributes,
                "{}",
                event.title
            ),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Emitter that keeps every event in memory
    #[derive(Default)]
    pub struct CapturingEmitter {
        events: Mutex<Vec<Event>>,
    }

    impl CapturingEmitter {
        pub fn events(&self) -> Vec<Event> {
            self.events.lock().unwrap().clone()
        }

        pub fn titled(&self, title: &str) -> Vec<Event> {
            self.events()
                .into_iter()
                .filter(|e| e.title == title)
                .collect()
        }
    }

    impl LogEmitter for CapturingEmitter {
        fn emit(&self, event: &Event) {
            self.events.lock().unwrap().push(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags() -> EventTags {
        EventTags::new("billing-api", "production")
    }

    #[test]
    fn test_gauge_carries_common_attributes() {
        let event = tags().gauge("rss", 300u64);

        assert_eq!(event.source, "billing-api");
        assert_eq!(event.level, Level::Info);
        assert_eq!(event.title, "rss");
        assert_eq!(event.attribute("type"), Some(&Value::from("gauge")));
        assert_eq!(event.attribute("env"), Some(&Value::from("production")));
        assert_eq!(event.attribute("via"), Some(&Value::from(VIA)));
        assert_eq!(event.value(), Some(300.0));
    }

    #[test]
    fn test_plain_event_has_no_metric_fields() {
        let event = tags().event(Level::Error, "active-connections");

        assert_eq!(event.level, Level::Error);
        assert!(event.attribute("type").is_none());
        assert!(event.attribute("value").is_none());
    }

    #[test]
    fn test_json_line_format() {
        let emitter = JsonLineEmitter::new(Vec::new());
        emitter.emit(&tags().gauge("heap-used", 100u64));
        emitter.emit(&tags().event(Level::Info, "Pause Detected").with("pause_duration", 1200.5));

        let output = String::from_utf8(emitter.into_inner()).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["source"], "billing-api");
        assert_eq!(first["level"], "info");
        assert_eq!(first["title"], "heap-used");
        assert_eq!(first["type"], "gauge");
        assert_eq!(first["value"], 100);
        assert_eq!(first["env"], "production");

        let second: Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["title"], "Pause Detected");
        assert_eq!(second["pause_duration"], 1200.5);
    }

    #[test]
    fn test_enums_serialize_lowercase() {
        assert_eq!(serde_json::to_value(Level::Error).unwrap(), "error");
        assert_eq!(serde_json::to_value(MetricType::Gauge).unwrap(), "gauge");
        assert_eq!(
            serde_json::to_value(MetricType::Gauge).unwrap(),
            MetricType::Gauge.as_str()
        );
    }

    #[test]
    fn test_header_fields_cannot_be_overridden() {
        let event = tags().gauge("rss", 1u64).with("title", "spoofed");
        let line = event.to_json();
        assert_eq!(line["title"], "rss");
    }

    #[test]
    fn test_json_line_timestamps() {
        let emitter = JsonLineEmitter::new(Vec::new()).with_timestamps();
        emitter.emit(&tags().gauge("rss", 1u64));

        let output = String::from_utf8(emitter.into_inner()).unwrap();
        let line: Value = serde_json::from_str(output.trim()).unwrap();
        let timestamp = line["timestamp"].as_str().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(timestamp).is_ok());
    }

    #[test]
    fn test_tracing_emitter_accepts_both_levels() {
        let emitter = TracingEmitter;
        emitter.emit(&tags().gauge("rss", 1u64));
        emitter.emit(&tags().event(Level::Error, "active-connections"));
    }
}
