//! Rule-based event validation.
//!
//! Runs after decoding, before deduplication. All rules are compiled once at
//! startup; nothing on the hot path builds a regex or allocates beyond the
//! error case. Validation failures are terminal for the message, the caller
//! routes them to the dead-letter store instead of retrying.

use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::codec::parse_major;
use super::{
    Environment, Event, EventPayload, LogData, MetricsData, Priority, TraceData, LOG_LEVELS,
    METRIC_TYPES,
};

/// Schema MAJOR this collector understands
pub const SUPPORTED_SCHEMA_MAJOR: u64 = 1;

/// Maximum accepted log message length in bytes
pub const MAX_LOG_MESSAGE_LEN: usize = 32_768;

/// Maximum accepted metric name length
pub const MAX_METRIC_NAME_LEN: usize = 255;

static EVENT_TYPE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(log|metrics|trace)\.[a-z][a-z0-9_-]*\.[a-z][a-z0-9_-]*$")
        .expect("event type pattern compiles")
});

static METRIC_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9._]*$").expect("metric name pattern compiles"));

/// Machine-readable validation failure codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationCode {
    Required,
    Format,
    Range,
    Enum,
    UnsupportedVersion,
}

impl fmt::Display for ValidationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            ValidationCode::Required => "VE_Required",
            ValidationCode::Format => "VE_Format",
            ValidationCode::Range => "VE_Range",
            ValidationCode::Enum => "VE_Enum",
            ValidationCode::UnsupportedVersion => "VE_UnsupportedVersion",
        };
        f.write_str(code)
    }
}

/// A single validation failure, naming the offending field
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{code}: {field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
    pub code: ValidationCode,
}

impl ValidationError {
    fn new(code: ValidationCode, field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
            code,
        }
    }

    fn required(field: &str) -> Self {
        Self::new(ValidationCode::Required, field, "field is required")
    }
}

/// Structural and semantic validator for decoded events
#[derive(Debug, Clone)]
pub struct Validator {
    clock_skew: Duration,
    supported_major: u64,
}

impl Default for Validator {
    fn default() -> Self {
        Self::new(std::time::Duration::from_secs(60))
    }
}

impl Validator {
    pub fn new(clock_skew: std::time::Duration) -> Self {
        Self {
            clock_skew: Duration::from_std(clock_skew).unwrap_or_else(|_| Duration::seconds(60)),
            supported_major: SUPPORTED_SCHEMA_MAJOR,
        }
    }

    /// Validate a single event. Returns the first rule violation.
    pub fn validate(&self, event: &Event) -> Result<(), ValidationError> {
        self.validate_header(event)?;
        match &event.payload {
            EventPayload::Log(data) => self.validate_log(data),
            EventPayload::Metrics(data) => self.validate_metrics(data),
            EventPayload::Trace(data) => self.validate_trace(data),
        }
    }

    /// Validate every element; no short-circuit across elements.
    pub fn validate_batch(&self, events: &[Event]) -> Vec<Result<(), ValidationError>> {
        events.iter().map(|e| self.validate(e)).collect()
    }

    fn validate_header(&self, event: &Event) -> Result<(), ValidationError> {
        let header = &event.header;

        check_uuid_v4("eventId", &header.event_id)?;
        check_uuid_v4("correlationId", &header.correlation_id)?;
        if let Some(causation_id) = &header.causation_id {
            check_uuid_v4("causationId", causation_id)?;
        }

        if !EVENT_TYPE_RE.is_match(&header.event_type) {
            return Err(ValidationError::new(
                ValidationCode::Format,
                "eventType",
                format!(
                    "'{}' does not match <family>.<entity>.<action>",
                    header.event_type
                ),
            ));
        }

        match parse_major(&header.schema_version) {
            None => {
                return Err(ValidationError::new(
                    ValidationCode::Format,
                    "schemaVersion",
                    format!("'{}' is not MAJOR.MINOR.PATCH", header.schema_version),
                ));
            }
            Some(major) if major != self.supported_major => {
                return Err(ValidationError::new(
                    ValidationCode::UnsupportedVersion,
                    "schemaVersion",
                    format!(
                        "schema major {} is not supported (expected {})",
                        major, self.supported_major
                    ),
                ));
            }
            Some(_) => {}
        }

        self.check_not_future("timestamp", header.timestamp)?;

        if header.source.service.is_empty() {
            return Err(ValidationError::required("source.service"));
        }
        if parse_major(&header.source.version).is_none() {
            return Err(ValidationError::new(
                ValidationCode::Format,
                "source.version",
                format!("'{}' is not MAJOR.MINOR.PATCH", header.source.version),
            ));
        }

        if Priority::from_str(&header.metadata.priority).is_err() {
            return Err(ValidationError::new(
                ValidationCode::Enum,
                "metadata.priority",
                format!(
                    "'{}' is not one of critical|high|normal|low",
                    header.metadata.priority
                ),
            ));
        }
        if let Some(environment) = &header.metadata.environment {
            if Environment::from_str(environment).is_err() {
                return Err(ValidationError::new(
                    ValidationCode::Enum,
                    "metadata.environment",
                    format!(
                        "'{}' is not one of production|staging|development|testing",
                        environment
                    ),
                ));
            }
        }

        if let Some(tracing) = &header.tracing {
            check_hex_id("tracing.traceId", &tracing.trace_id, &[16, 32])?;
            if let Some(span_id) = &tracing.span_id {
                check_hex_id("tracing.spanId", span_id, &[16])?;
            }
            if let Some(parent) = &tracing.parent_span_id {
                check_hex_id("tracing.parentSpanId", parent, &[16])?;
            }
        }

        Ok(())
    }

    fn validate_log(&self, data: &LogData) -> Result<(), ValidationError> {
        let level = data
            .level
            .as_deref()
            .ok_or_else(|| ValidationError::required("data.level"))?;
        if !LOG_LEVELS.contains(&level) {
            return Err(ValidationError::new(
                ValidationCode::Enum,
                "data.level",
                format!("'{}' is not a log level", level),
            ));
        }

        let message = data
            .message
            .as_deref()
            .ok_or_else(|| ValidationError::required("data.message"))?;
        if message.is_empty() || message.len() > MAX_LOG_MESSAGE_LEN {
            return Err(ValidationError::new(
                ValidationCode::Range,
                "data.message",
                format!(
                    "message length {} outside 1..={}",
                    message.len(),
                    MAX_LOG_MESSAGE_LEN
                ),
            ));
        }

        let timestamp = data
            .timestamp
            .ok_or_else(|| ValidationError::required("data.timestamp"))?;
        self.check_not_future("data.timestamp", timestamp)?;

        if let Some(source) = &data.source {
            if let Some(line) = source.line {
                if line < 1 {
                    return Err(ValidationError::new(
                        ValidationCode::Range,
                        "data.source.line",
                        format!("line {} must be >= 1", line),
                    ));
                }
            }
        }

        Ok(())
    }

    fn validate_metrics(&self, data: &MetricsData) -> Result<(), ValidationError> {
        let name = data
            .name
            .as_deref()
            .ok_or_else(|| ValidationError::required("data.name"))?;
        if name.len() > MAX_METRIC_NAME_LEN {
            return Err(ValidationError::new(
                ValidationCode::Range,
                "data.name",
                format!("name length {} exceeds {}", name.len(), MAX_METRIC_NAME_LEN),
            ));
        }
        if !METRIC_NAME_RE.is_match(name) {
            return Err(ValidationError::new(
                ValidationCode::Format,
                "data.name",
                format!("'{}' is not a valid metric name", name),
            ));
        }

        let metric_type = data
            .metric_type
            .as_deref()
            .ok_or_else(|| ValidationError::required("data.type"))?;
        if !METRIC_TYPES.contains(&metric_type) {
            return Err(ValidationError::new(
                ValidationCode::Enum,
                "data.type",
                format!("'{}' is not a metric type", metric_type),
            ));
        }

        let value = data
            .value
            .as_ref()
            .ok_or_else(|| ValidationError::required("data.value"))?;
        check_metric_value(value)?;

        if data.unit.is_none() {
            return Err(ValidationError::required("data.unit"));
        }

        let timestamp = data
            .timestamp
            .ok_or_else(|| ValidationError::required("data.timestamp"))?;
        self.check_not_future("data.timestamp", timestamp)?;

        Ok(())
    }

    fn validate_trace(&self, data: &TraceData) -> Result<(), ValidationError> {
        let trace_id = data
            .trace_id
            .as_deref()
            .ok_or_else(|| ValidationError::required("data.traceId"))?;
        check_hex_id("data.traceId", trace_id, &[16, 32])?;

        let span_id = data
            .span_id
            .as_deref()
            .ok_or_else(|| ValidationError::required("data.spanId"))?;
        check_hex_id("data.spanId", span_id, &[16])?;

        if let Some(parent) = &data.parent_span_id {
            check_hex_id("data.parentSpanId", parent, &[16])?;
        }

        let operation_name = data
            .operation_name
            .as_deref()
            .ok_or_else(|| ValidationError::required("data.operationName"))?;
        if operation_name.is_empty() {
            return Err(ValidationError::new(
                ValidationCode::Range,
                "data.operationName",
                "operation name must not be empty",
            ));
        }

        if data.start_time.is_none() {
            return Err(ValidationError::required("data.startTime"));
        }

        if let Some(duration) = data.duration {
            if duration < 0 {
                return Err(ValidationError::new(
                    ValidationCode::Range,
                    "data.duration",
                    format!("duration {} must be >= 0", duration),
                ));
            }
        }

        Ok(())
    }

    fn check_not_future(
        &self,
        field: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<(), ValidationError> {
        let limit = Utc::now() + self.clock_skew;
        if timestamp > limit {
            return Err(ValidationError::new(
                ValidationCode::Range,
                field,
                format!("timestamp {} is beyond the clock skew tolerance", timestamp),
            ));
        }
        Ok(())
    }
}

fn check_uuid_v4(field: &str, value: &str) -> Result<(), ValidationError> {
    let parsed = Uuid::parse_str(value).map_err(|_| {
        ValidationError::new(
            ValidationCode::Format,
            field,
            format!("'{}' is not a UUID", value),
        )
    })?;
    if parsed.get_version_num() != 4 {
        return Err(ValidationError::new(
            ValidationCode::Format,
            field,
            format!("'{}' is not a v4 UUID", value),
        ));
    }
    Ok(())
}

fn check_hex_id(field: &str, value: &str, lengths: &[usize]) -> Result<(), ValidationError> {
    let hex = value.len() == value.bytes().filter(u8::is_ascii_hexdigit).count();
    if !hex || !lengths.contains(&value.len()) {
        return Err(ValidationError::new(
            ValidationCode::Format,
            field,
            format!("'{}' is not a {:?}-char hex id", value, lengths),
        ));
    }
    Ok(())
}

// A metric value is a plain number or an aggregate carrying at least
// numeric `sum` and `count`.
fn check_metric_value(value: &Value) -> Result<(), ValidationError> {
    if value.is_number() {
        return Ok(());
    }
    if let Some(object) = value.as_object() {
        let sum_ok = object.get("sum").map(Value::is_number).unwrap_or(false);
        let count_ok = object.get("count").map(Value::is_number).unwrap_or(false);
        if sum_ok && count_ok {
            return Ok(());
        }
    }
    Err(ValidationError::new(
        ValidationCode::Format,
        "data.value",
        "value must be a number or an aggregate with numeric sum and count",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventHeader, EventMetadata, EventSource, TracingContext};
    use test_case::test_case;

    fn header() -> EventHeader {
        EventHeader {
            event_id: Uuid::new_v4().to_string(),
            event_type: "log.user.created".to_string(),
            schema_version: "1.0.0".to_string(),
            timestamp: Utc::now(),
            correlation_id: Uuid::new_v4().to_string(),
            causation_id: None,
            source: EventSource {
                service: "user-service".to_string(),
                version: "1.0.0".to_string(),
                instance: None,
                region: None,
            },
            tracing: None,
            metadata: EventMetadata::default(),
        }
    }

    fn log_event() -> Event {
        let data = LogData {
            level: Some("INFO".to_string()),
            message: Some("hello".to_string()),
            timestamp: Some(Utc::now()),
            ..Default::default()
        };
        Event {
            header: header(),
            raw_data: serde_json::to_value(&data).unwrap(),
            payload: EventPayload::Log(data),
        }
    }

    fn metrics_event() -> Event {
        let mut header = header();
        header.event_type = "metrics.orders.rate".to_string();
        let data = MetricsData {
            name: Some("orders.created_total".to_string()),
            metric_type: Some("counter".to_string()),
            value: Some(serde_json::json!(17)),
            unit: Some("1".to_string()),
            timestamp: Some(Utc::now()),
            ..Default::default()
        };
        Event {
            header,
            raw_data: serde_json::to_value(&data).unwrap(),
            payload: EventPayload::Metrics(data),
        }
    }

    fn trace_event() -> Event {
        let mut header = header();
        header.event_type = "trace.checkout.span".to_string();
        let data = TraceData {
            trace_id: Some("4bf92f3577b34da6a3ce929d0e0e4736".to_string()),
            span_id: Some("00f067aa0ba902b7".to_string()),
            operation_name: Some("checkout".to_string()),
            start_time: Some(Utc::now()),
            ..Default::default()
        };
        Event {
            header,
            raw_data: serde_json::to_value(&data).unwrap(),
            payload: EventPayload::Trace(data),
        }
    }

    fn expect_code(result: Result<(), ValidationError>, code: ValidationCode, field: &str) {
        let err = result.expect_err("expected validation failure");
        assert_eq!(err.code, code, "unexpected code: {}", err);
        assert_eq!(err.field, field, "unexpected field: {}", err);
    }

    #[test]
    fn valid_events_pass() {
        let validator = Validator::default();
        validator.validate(&log_event()).unwrap();
        validator.validate(&metrics_event()).unwrap();
        validator.validate(&trace_event()).unwrap();
    }

    #[test]
    fn non_v4_uuid_is_a_format_error() {
        let validator = Validator::default();
        let mut event = log_event();
        event.header.event_id = "00000000-0000-0000-0000-000000000000".to_string();
        expect_code(validator.validate(&event), ValidationCode::Format, "eventId");
    }

    #[test]
    fn unsupported_major_is_rejected() {
        let validator = Validator::default();
        let mut event = log_event();
        event.header.schema_version = "2.0.0".to_string();
        expect_code(
            validator.validate(&event),
            ValidationCode::UnsupportedVersion,
            "schemaVersion",
        );
    }

    #[test]
    fn malformed_semver_is_a_format_error() {
        let validator = Validator::default();
        let mut event = log_event();
        event.header.schema_version = "1.0".to_string();
        expect_code(
            validator.validate(&event),
            ValidationCode::Format,
            "schemaVersion",
        );
    }

    #[test]
    fn future_timestamp_beyond_skew_is_rejected() {
        let validator = Validator::new(std::time::Duration::from_secs(60));
        let mut event = log_event();
        event.header.timestamp = Utc::now() + Duration::seconds(120);
        expect_code(validator.validate(&event), ValidationCode::Range, "timestamp");
    }

    #[test]
    fn future_timestamp_within_skew_is_accepted() {
        let validator = Validator::new(std::time::Duration::from_secs(60));
        let mut event = log_event();
        event.header.timestamp = Utc::now() + Duration::seconds(30);
        validator.validate(&event).unwrap();
    }

    #[test]
    fn message_at_limit_accepted_one_past_rejected() {
        let validator = Validator::default();

        let mut event = log_event();
        if let EventPayload::Log(data) = &mut event.payload {
            data.message = Some("x".repeat(MAX_LOG_MESSAGE_LEN));
        }
        validator.validate(&event).unwrap();

        if let EventPayload::Log(data) = &mut event.payload {
            data.message = Some("x".repeat(MAX_LOG_MESSAGE_LEN + 1));
        }
        expect_code(
            validator.validate(&event),
            ValidationCode::Range,
            "data.message",
        );
    }

    #[test]
    fn empty_message_is_a_range_error() {
        let validator = Validator::default();
        let mut event = log_event();
        if let EventPayload::Log(data) = &mut event.payload {
            data.message = Some(String::new());
        }
        expect_code(
            validator.validate(&event),
            ValidationCode::Range,
            "data.message",
        );
    }

    #[test]
    fn missing_log_level_is_required() {
        let validator = Validator::default();
        let mut event = log_event();
        if let EventPayload::Log(data) = &mut event.payload {
            data.level = None;
        }
        expect_code(
            validator.validate(&event),
            ValidationCode::Required,
            "data.level",
        );
    }

    #[test]
    fn lowercase_log_level_is_an_enum_error() {
        let validator = Validator::default();
        let mut event = log_event();
        if let EventPayload::Log(data) = &mut event.payload {
            data.level = Some("info".to_string());
        }
        expect_code(validator.validate(&event), ValidationCode::Enum, "data.level");
    }

    #[test_case("orders.created_total", true; "dotted name")]
    #[test_case("http_requests", true; "underscore name")]
    #[test_case("1badstart", false; "leading digit")]
    #[test_case("bad-dash", false; "dash not allowed")]
    #[test_case("", false; "empty")]
    fn metric_name_pattern(name: &str, valid: bool) {
        let validator = Validator::default();
        let mut event = metrics_event();
        if let EventPayload::Metrics(data) = &mut event.payload {
            data.name = Some(name.to_string());
        }
        assert_eq!(validator.validate(&event).is_ok(), valid);
    }

    #[test]
    fn metric_name_over_255_is_a_range_error() {
        let validator = Validator::default();
        let mut event = metrics_event();
        if let EventPayload::Metrics(data) = &mut event.payload {
            data.name = Some("m".repeat(MAX_METRIC_NAME_LEN + 1));
        }
        expect_code(validator.validate(&event), ValidationCode::Range, "data.name");
    }

    #[test]
    fn aggregated_metric_value_requires_sum_and_count() {
        let validator = Validator::default();
        let mut event = metrics_event();
        if let EventPayload::Metrics(data) = &mut event.payload {
            data.value = Some(serde_json::json!({"sum": 12.5, "count": 4, "max": 9.1}));
        }
        validator.validate(&event).unwrap();

        if let EventPayload::Metrics(data) = &mut event.payload {
            data.value = Some(serde_json::json!({"sum": 12.5}));
        }
        expect_code(
            validator.validate(&event),
            ValidationCode::Format,
            "data.value",
        );
    }

    #[test]
    fn bad_metric_type_is_an_enum_error() {
        let validator = Validator::default();
        let mut event = metrics_event();
        if let EventPayload::Metrics(data) = &mut event.payload {
            data.metric_type = Some("meter".to_string());
        }
        expect_code(validator.validate(&event), ValidationCode::Enum, "data.type");
    }

    #[test_case("4bf92f3577b34da6a3ce929d0e0e4736", true; "32 hex")]
    #[test_case("00f067aa0ba902b7", true; "16 hex")]
    #[test_case("00f067aa0ba902", false; "14 hex")]
    #[test_case("zzf067aa0ba902b7", false; "not hex")]
    fn trace_id_lengths(trace_id: &str, valid: bool) {
        let validator = Validator::default();
        let mut event = trace_event();
        if let EventPayload::Trace(data) = &mut event.payload {
            data.trace_id = Some(trace_id.to_string());
        }
        assert_eq!(validator.validate(&event).is_ok(), valid);
    }

    #[test]
    fn header_tracing_span_id_must_be_16_hex() {
        let validator = Validator::default();
        let mut event = log_event();
        event.header.tracing = Some(TracingContext {
            trace_id: "4bf92f3577b34da6a3ce929d0e0e4736".to_string(),
            span_id: Some("short".to_string()),
            parent_span_id: None,
            flags: None,
            baggage: None,
        });
        expect_code(
            validator.validate(&event),
            ValidationCode::Format,
            "tracing.spanId",
        );
    }

    #[test]
    fn bad_priority_is_an_enum_error() {
        let validator = Validator::default();
        let mut event = log_event();
        event.header.metadata.priority = "urgent".to_string();
        expect_code(
            validator.validate(&event),
            ValidationCode::Enum,
            "metadata.priority",
        );
    }

    #[test]
    fn validate_batch_reports_every_element() {
        let validator = Validator::default();
        let good = log_event();
        let mut bad = log_event();
        bad.header.schema_version = "9.0.0".to_string();

        let results = validator.validate_batch(&[good, bad, log_event()]);
        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
        assert!(results[2].is_ok());
    }

    #[test]
    fn error_display_carries_code_and_field() {
        let err = ValidationError::new(ValidationCode::Range, "data.message", "too long");
        let rendered = err.to_string();
        assert!(rendered.contains("VE_Range"));
        assert!(rendered.contains("data.message"));
    }
}
