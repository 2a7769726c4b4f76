//! Insertable row models and event-to-row conversion.
//!
//! Rows are built by workers after validation, so identifier parsing here is
//! expected to succeed; a failure still maps to an error rather than a panic
//! because the conversion is also exercised directly by tests and the DLQ
//! path. The `metadata` column carries the event's delivery metadata, source
//! identity, and tracing context verbatim so nothing is lost on the way into
//! the store.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde_json::Value;
use uuid::Uuid;

use event_collector_core::{
    CollectorError, CollectorResult, Event, EventFamily, EventPayload,
};

use super::schema::{logs, metrics, traces};

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = logs)]
#[diesel(treat_none_as_default_value = false)]
pub struct LogRow {
    pub event_id: Uuid,
    pub correlation_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub service: String,
    pub message: String,
    pub context: Option<Value>,
    pub error: Option<Value>,
    pub structured: Option<Value>,
    pub metadata: Value,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = metrics)]
#[diesel(treat_none_as_default_value = false)]
pub struct MetricRow {
    pub event_id: Uuid,
    pub correlation_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub name: String,
    pub metric_type: String,
    pub value: Value,
    pub unit: String,
    pub service: String,
    pub dimensions: Option<Value>,
    pub metadata: Value,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = traces)]
#[diesel(treat_none_as_default_value = false)]
pub struct TraceRow {
    pub event_id: Uuid,
    pub correlation_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub operation_name: String,
    pub service: String,
    pub duration_us: Option<i64>,
    pub status: Option<Value>,
    pub tags: Option<Value>,
    pub metadata: Value,
}

/// A typed row for one of the three event tables
#[derive(Debug, Clone)]
pub enum EventRow {
    Log(LogRow),
    Metrics(MetricRow),
    Trace(TraceRow),
}

impl EventRow {
    pub fn family(&self) -> EventFamily {
        match self {
            EventRow::Log(_) => EventFamily::Log,
            EventRow::Metrics(_) => EventFamily::Metrics,
            EventRow::Trace(_) => EventFamily::Trace,
        }
    }

    pub fn event_id(&self) -> Uuid {
        match self {
            EventRow::Log(row) => row.event_id,
            EventRow::Metrics(row) => row.event_id,
            EventRow::Trace(row) => row.event_id,
        }
    }

    /// Build the row for a validated event.
    ///
    /// `source_attributes` is the (usually cached) serialized source identity
    /// merged into the metadata column.
    pub fn from_event(event: &Event, source_attributes: &Value) -> CollectorResult<EventRow> {
        let header = &event.header;
        let event_id = parse_uuid("eventId", &header.event_id)?;
        let correlation_id = parse_uuid("correlationId", &header.correlation_id)?;
        let metadata = metadata_column(event, source_attributes);

        match &event.payload {
            EventPayload::Log(data) => Ok(EventRow::Log(LogRow {
                event_id,
                correlation_id,
                timestamp: data.timestamp.unwrap_or(header.timestamp),
                level: data.level.clone().unwrap_or_default(),
                service: header.source.service.clone(),
                message: data.message.clone().unwrap_or_default(),
                context: data.context.clone(),
                error: data.error.clone(),
                structured: data.structured.clone(),
                metadata,
            })),
            EventPayload::Metrics(data) => Ok(EventRow::Metrics(MetricRow {
                event_id,
                correlation_id,
                timestamp: data.timestamp.unwrap_or(header.timestamp),
                name: data.name.clone().unwrap_or_default(),
                metric_type: data.metric_type.clone().unwrap_or_default(),
                value: data.value.clone().unwrap_or(Value::Null),
                unit: data.unit.clone().unwrap_or_default(),
                service: header.source.service.clone(),
                dimensions: data.dimensions.clone(),
                metadata,
            })),
            EventPayload::Trace(data) => Ok(EventRow::Trace(TraceRow {
                event_id,
                correlation_id,
                timestamp: data.start_time.unwrap_or(header.timestamp),
                trace_id: data.trace_id.clone().unwrap_or_default(),
                span_id: data.span_id.clone().unwrap_or_default(),
                parent_span_id: data.parent_span_id.clone(),
                operation_name: data.operation_name.clone().unwrap_or_default(),
                service: header.source.service.clone(),
                duration_us: span_duration_us(data),
                status: data.status.clone(),
                tags: data.tags.clone(),
                metadata,
            })),
        }
    }
}

/// Rows of one batch, grouped by target table. Insert order within each
/// group matches enqueue order; the copy protocol preserves it on write.
#[derive(Debug, Clone, Default)]
pub struct RowBatch {
    pub logs: Vec<LogRow>,
    pub metrics: Vec<MetricRow>,
    pub traces: Vec<TraceRow>,
}

impl RowBatch {
    pub fn push(&mut self, row: EventRow) {
        match row {
            EventRow::Log(row) => self.logs.push(row),
            EventRow::Metrics(row) => self.metrics.push(row),
            EventRow::Trace(row) => self.traces.push(row),
        }
    }

    pub fn len(&self) -> usize {
        self.logs.len() + self.metrics.len() + self.traces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn parse_uuid(field: &str, value: &str) -> CollectorResult<Uuid> {
    Uuid::parse_str(value).map_err(|_| CollectorError::SerializationError {
        message: format!("{} '{}' is not a UUID", field, value),
    })
}

fn metadata_column(event: &Event, source_attributes: &Value) -> Value {
    let header = &event.header;
    let mut metadata = serde_json::json!({
        "eventType": header.event_type,
        "schemaVersion": header.schema_version,
        "priority": header.metadata.priority,
        "source": source_attributes,
    });
    let object = metadata.as_object_mut().expect("literal object");

    if let Some(tags) = &header.metadata.tags {
        object.insert("tags".to_string(), serde_json::json!(tags));
    }
    if let Some(environment) = &header.metadata.environment {
        object.insert("environment".to_string(), Value::String(environment.clone()));
    }
    if let Some(retry_count) = header.metadata.retry_count {
        object.insert("retryCount".to_string(), serde_json::json!(retry_count));
    }
    if let Some(schema_url) = &header.metadata.schema_url {
        object.insert("schemaUrl".to_string(), Value::String(schema_url.clone()));
    }
    for (key, value) in &header.metadata.extra {
        object.insert(key.clone(), value.clone());
    }
    if let Some(causation_id) = &header.causation_id {
        object.insert("causationId".to_string(), Value::String(causation_id.clone()));
    }
    if let Some(tracing) = &header.tracing {
        // baggage travels inside the tracing context, verbatim
        if let Ok(tracing_value) = serde_json::to_value(tracing) {
            object.insert("tracing".to_string(), tracing_value);
        }
    }

    metadata
}

fn span_duration_us(data: &event_collector_core::TraceData) -> Option<i64> {
    if let Some(duration) = data.duration {
        return Some(duration);
    }
    match (data.start_time, data.end_time) {
        (Some(start), Some(end)) => (end - start).num_microseconds(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use event_collector_core::{
        EventHeader, EventMetadata, EventSource, LogData, TraceData, TracingContext,
    };

    fn log_event() -> Event {
        let data = LogData {
            level: Some("INFO".to_string()),
            message: Some("hello".to_string()),
            timestamp: Some(Utc::now()),
            context: Some(serde_json::json!({"userId": 42})),
            ..Default::default()
        };
        Event {
            header: EventHeader {
                event_id: Uuid::new_v4().to_string(),
                event_type: "log.user.created".to_string(),
                schema_version: "1.0.0".to_string(),
                timestamp: Utc::now(),
                correlation_id: Uuid::new_v4().to_string(),
                causation_id: Some(Uuid::new_v4().to_string()),
                source: EventSource {
                    service: "user-service".to_string(),
                    version: "1.0.0".to_string(),
                    instance: None,
                    region: None,
                },
                tracing: Some(TracingContext {
                    trace_id: "4bf92f3577b34da6a3ce929d0e0e4736".to_string(),
                    span_id: None,
                    parent_span_id: None,
                    flags: None,
                    baggage: Some(serde_json::json!({"tenant": "acme"})),
                }),
                metadata: EventMetadata::default(),
            },
            raw_data: serde_json::to_value(&data).unwrap(),
            payload: EventPayload::Log(data),
        }
    }

    #[test]
    fn log_row_carries_service_level_and_metadata() {
        let event = log_event();
        let source_attributes = serde_json::json!({"service": "user-service", "version": "1.0.0"});
        let row = EventRow::from_event(&event, &source_attributes).unwrap();

        match row {
            EventRow::Log(row) => {
                assert_eq!(row.service, "user-service");
                assert_eq!(row.level, "INFO");
                assert_eq!(row.message, "hello");
                assert_eq!(row.metadata["priority"], "normal");
                assert_eq!(row.metadata["tracing"]["baggage"]["tenant"], "acme");
                assert!(row.metadata["causationId"].is_string());
            }
            other => panic!("expected log row, got {:?}", other),
        }
    }

    #[test]
    fn trace_duration_falls_back_to_start_end_delta() {
        let start = Utc::now();
        let data = TraceData {
            trace_id: Some("4bf92f3577b34da6a3ce929d0e0e4736".to_string()),
            span_id: Some("00f067aa0ba902b7".to_string()),
            operation_name: Some("checkout".to_string()),
            start_time: Some(start),
            end_time: Some(start + chrono::Duration::milliseconds(250)),
            ..Default::default()
        };
        assert_eq!(span_duration_us(&data), Some(250_000));

        let explicit = TraceData {
            duration: Some(1_500),
            ..data
        };
        assert_eq!(span_duration_us(&explicit), Some(1_500));
    }

    #[test]
    fn row_batch_groups_by_family() {
        let event = log_event();
        let attributes = serde_json::json!({});
        let mut batch = RowBatch::default();
        batch.push(EventRow::from_event(&event, &attributes).unwrap());
        batch.push(EventRow::from_event(&event, &attributes).unwrap());

        assert_eq!(batch.len(), 2);
        assert_eq!(batch.logs.len(), 2);
        assert!(batch.metrics.is_empty());
        assert!(!batch.is_empty());
    }

    #[test]
    fn bad_uuid_surfaces_as_serialization_error() {
        let mut event = log_event();
        event.header.event_id = "not-a-uuid".to_string();
        let result = EventRow::from_event(&event, &serde_json::json!({}));
        assert!(matches!(
            result,
            Err(CollectorError::SerializationError { .. })
        ));
    }
}
