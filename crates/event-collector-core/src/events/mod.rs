//! Canonical in-memory event model.
//!
//! Producers publish JSON envelopes with a shared header and a family-specific
//! `data` payload. The collector models this as [`EventHeader`] plus a tagged
//! [`EventPayload`] over the three families (log, metrics, trace). The original
//! `data` JSON is kept verbatim next to the typed view so unknown fields
//! survive the trip into the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;

pub mod codec;
pub mod validation;

pub use codec::{decode, encode, schema_major, DecodeError};
pub use validation::{ValidationCode, ValidationError, Validator};

/// Event family, derived from the `eventType` prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventFamily {
    Log,
    Metrics,
    Trace,
}

impl EventFamily {
    /// Family of a dotted event type such as `log.user.created`
    pub fn of_event_type(event_type: &str) -> Option<EventFamily> {
        match event_type.split('.').next() {
            Some("log") => Some(EventFamily::Log),
            Some("metrics") => Some(EventFamily::Metrics),
            Some("trace") => Some(EventFamily::Trace),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventFamily::Log => "log",
            EventFamily::Metrics => "metrics",
            EventFamily::Trace => "trace",
        }
    }
}

/// Originating service identity carried by every event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSource {
    pub service: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

/// W3C-style tracing context; `baggage` is preserved verbatim
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TracingContext {
    pub trace_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flags: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub baggage: Option<Value>,
}

/// Delivery metadata attached to every event.
///
/// `priority` and `environment` stay as strings on the wire model; the
/// validator checks them against [`Priority`] and [`Environment`] so that a
/// bad value is reported as a validation failure rather than a decode
/// failure. Free-form fields are captured in `extra` and persisted verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMetadata {
    pub priority: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_url: Option<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl Default for EventMetadata {
    fn default() -> Self {
        Self {
            priority: Priority::Normal.as_str().to_string(),
            tags: None,
            environment: None,
            retry_count: None,
            schema_url: None,
            extra: HashMap::new(),
        }
    }
}

impl EventMetadata {
    pub fn new(priority: Priority) -> Self {
        Self {
            priority: priority.as_str().to_string(),
            ..Default::default()
        }
    }

    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.environment = Some(environment.as_str().to_string());
        self
    }

    pub fn add_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }
}

/// Event priority levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    Normal,
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

impl FromStr for Priority {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "critical" => Ok(Priority::Critical),
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            _ => Err(()),
        }
    }
}

/// Deployment environments accepted in event metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Production,
    Staging,
    Development,
    Testing,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Production => "production",
            Environment::Staging => "staging",
            Environment::Development => "development",
            Environment::Testing => "testing",
        }
    }
}

impl FromStr for Environment {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "production" => Ok(Environment::Production),
            "staging" => Ok(Environment::Staging),
            "development" => Ok(Environment::Development),
            "testing" => Ok(Environment::Testing),
            _ => Err(()),
        }
    }
}

/// Shared header present on every event regardless of family.
///
/// Identifier fields stay as strings so that malformed values surface as
/// validation failures with a field path instead of opaque decode errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventHeader {
    pub event_id: String,
    pub event_type: String,
    #[serde(alias = "version")]
    pub schema_version: String,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,
    pub source: EventSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tracing: Option<TracingContext>,
    #[serde(default)]
    pub metadata: EventMetadata,
}

// ================================
// Family payloads
// ================================

/// Reference to the code location that produced a log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogSourceRef {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,
}

/// Typed view over a `log.*` payload.
///
/// All fields are optional at decode time; the validator enforces presence so
/// that a missing `message` routes to the dead-letter store as a validation
/// failure, not a decode crash. Nested objects stay as raw JSON, they are
/// persisted verbatim into jsonb columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct LogData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logger: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structured: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<LogSourceRef>,
}

/// Log severity levels
pub const LOG_LEVELS: [&str; 6] = ["TRACE", "DEBUG", "INFO", "WARN", "ERROR", "FATAL"];

/// Metric kinds accepted by the validator
pub const METRIC_TYPES: [&str; 5] = ["counter", "gauge", "histogram", "summary", "timer"];

/// Typed view over a `metrics.*` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MetricsData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub metric_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buckets: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exemplars: Option<Value>,
}

/// Typed view over a `trace.*` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TraceData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Span duration in microseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logs: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub references: Option<Value>,
}

/// Family-specific payload, tagged by the `eventType` prefix
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    Log(LogData),
    Metrics(MetricsData),
    Trace(TraceData),
}

impl EventPayload {
    pub fn family(&self) -> EventFamily {
        match self {
            EventPayload::Log(_) => EventFamily::Log,
            EventPayload::Metrics(_) => EventFamily::Metrics,
            EventPayload::Trace(_) => EventFamily::Trace,
        }
    }
}

/// Canonical decoded event: shared header, typed payload view, and the
/// original `data` JSON preserved verbatim for round-tripping.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub header: EventHeader,
    pub payload: EventPayload,
    pub raw_data: Value,
}

impl Event {
    pub fn family(&self) -> EventFamily {
        self.payload.family()
    }

    pub fn event_id(&self) -> &str {
        &self.header.event_id
    }

    pub fn correlation_id(&self) -> &str {
        &self.header.correlation_id
    }

    /// Cache key tuple for the per-service metadata cache
    pub fn source_key(&self) -> (String, String, String) {
        (
            self.header.source.service.clone(),
            self.header.source.version.clone(),
            self.header
                .metadata
                .environment
                .clone()
                .unwrap_or_else(|| "production".to_string()),
        )
    }
}
