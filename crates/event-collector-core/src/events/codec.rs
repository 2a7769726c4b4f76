//! Wire codec: bytes to typed [`Event`] and back.
//!
//! Decoding is the ingress hot path. It parses the JSON envelope once, keeps
//! the original `data` blob verbatim, and builds the family-typed payload
//! view from it. Encoding reserializes the header with the preserved blob so
//! unknown payload fields survive a round trip.

use serde_json::Value;

use super::{Event, EventFamily, EventHeader, EventPayload, LogData, MetricsData, TraceData};

/// Decode failure. Terminal for the message that produced it; the delivery
/// routes to the dead-letter store and is acked.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum DecodeError {
    #[error("Malformed payload: {reason}")]
    Malformed {
        reason: String,
        offset: Option<usize>,
    },

    #[error("Missing required field: {path}")]
    MissingField { path: String },

    #[error("Unknown event type: {event_type}")]
    UnknownEventType { event_type: String },
}

impl DecodeError {
    fn malformed(err: &serde_json::Error) -> Self {
        DecodeError::Malformed {
            reason: err.to_string(),
            offset: Some(err.column()),
        }
    }
}

/// Decode a broker message body into a typed event.
///
/// The envelope must be a JSON object carrying the shared header fields and a
/// `data` object. The `eventType` prefix selects the payload family.
pub fn decode(bytes: &[u8]) -> Result<Event, DecodeError> {
    let mut envelope: Value = serde_json::from_slice(bytes).map_err(|e| DecodeError::malformed(&e))?;

    let object = envelope.as_object_mut().ok_or_else(|| DecodeError::Malformed {
        reason: "envelope is not a JSON object".to_string(),
        offset: None,
    })?;

    let raw_data = object
        .remove("data")
        .ok_or_else(|| DecodeError::MissingField {
            path: "data".to_string(),
        })?;

    let header: EventHeader =
        serde_json::from_value(envelope).map_err(|e| classify_header_error(&e))?;

    let family = EventFamily::of_event_type(&header.event_type).ok_or_else(|| {
        DecodeError::UnknownEventType {
            event_type: header.event_type.clone(),
        }
    })?;

    let payload = payload_from_raw(family, &raw_data)?;

    Ok(Event {
        header,
        payload,
        raw_data,
    })
}

/// Encode a typed event back into the wire envelope.
///
/// The preserved `data` blob is emitted verbatim, so
/// `decode(encode(e)) == e` for all decodable events modulo timestamp
/// normalization.
pub fn encode(event: &Event) -> Result<Vec<u8>, DecodeError> {
    let mut envelope = serde_json::to_value(&event.header).map_err(|e| DecodeError::Malformed {
        reason: format!("header serialization failed: {}", e),
        offset: None,
    })?;

    envelope
        .as_object_mut()
        .expect("header serializes to an object")
        .insert("data".to_string(), event.raw_data.clone());

    serde_json::to_vec(&envelope).map_err(|e| DecodeError::Malformed {
        reason: format!("envelope serialization failed: {}", e),
        offset: None,
    })
}

/// MAJOR component of the event's `schemaVersion`, if it parses as semver
pub fn schema_major(event: &Event) -> Option<u64> {
    parse_major(&event.header.schema_version)
}

pub(crate) fn parse_major(schema_version: &str) -> Option<u64> {
    // require the full MAJOR.MINOR.PATCH shape
    let mut parts = schema_version.split('.');
    let major = parts.next()?.parse().ok()?;
    parts.next()?.parse::<u64>().ok()?;
    parts.next()?.parse::<u64>().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some(major)
}

fn payload_from_raw(family: EventFamily, raw_data: &Value) -> Result<EventPayload, DecodeError> {
    if !raw_data.is_object() {
        return Err(DecodeError::Malformed {
            reason: "data is not a JSON object".to_string(),
            offset: None,
        });
    }

    match family {
        EventFamily::Log => {
            let data: LogData = lenient_from_value(raw_data)?;
            Ok(EventPayload::Log(data))
        }
        EventFamily::Metrics => {
            let data: MetricsData = lenient_from_value(raw_data)?;
            Ok(EventPayload::Metrics(data))
        }
        EventFamily::Trace => {
            let data: TraceData = lenient_from_value(raw_data)?;
            Ok(EventPayload::Trace(data))
        }
    }
}

// Payload fields are all optional; a type mismatch inside `data` (e.g. a
// numeric `message`) is still a malformed payload.
fn lenient_from_value<T: serde::de::DeserializeOwned>(value: &Value) -> Result<T, DecodeError> {
    serde_json::from_value(value.clone()).map_err(|e| DecodeError::Malformed {
        reason: format!("data: {}", e),
        offset: None,
    })
}

fn classify_header_error(err: &serde_json::Error) -> DecodeError {
    let text = err.to_string();
    // serde_json reports absent struct fields as "missing field `name`"
    if let Some(rest) = text.strip_prefix("missing field `") {
        if let Some(field) = rest.split('`').next() {
            return DecodeError::MissingField {
                path: field.to_string(),
            };
        }
    }
    DecodeError::Malformed {
        reason: text,
        offset: Some(err.column()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn sample_log_bytes() -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "eventId": "6d9f8a3e-1f4b-4c2a-9d3e-7b1a2c3d4e5f",
            "eventType": "log.user.created",
            "schemaVersion": "1.0.0",
            "timestamp": "2024-07-01T12:00:00Z",
            "correlationId": "8e2ac9f1-63c8-4f11-9282-0a3c2f4e1d10",
            "source": {"service": "user-service", "version": "1.0.0"},
            "metadata": {"priority": "normal"},
            "data": {
                "level": "INFO",
                "message": "user created",
                "timestamp": "2024-07-01T12:00:00Z",
                "context": {"userId": 42},
                "futureField": {"nested": true}
            }
        }))
        .unwrap()
    }

    #[test]
    fn decodes_log_event() {
        let event = decode(&sample_log_bytes()).unwrap();
        assert_eq!(event.family(), EventFamily::Log);
        assert_eq!(event.event_id(), "6d9f8a3e-1f4b-4c2a-9d3e-7b1a2c3d4e5f");
        assert_eq!(
            event.header.timestamp,
            Utc.with_ymd_and_hms(2024, 7, 1, 12, 0, 0).unwrap()
        );
        match &event.payload {
            EventPayload::Log(log) => {
                assert_eq!(log.level.as_deref(), Some("INFO"));
                assert_eq!(log.message.as_deref(), Some("user created"));
            }
            other => panic!("expected log payload, got {:?}", other),
        }
    }

    #[test]
    fn unknown_fields_survive_round_trip() {
        let event = decode(&sample_log_bytes()).unwrap();
        let encoded = encode(&event).unwrap();
        let reparsed: serde_json::Value = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(reparsed["data"]["futureField"]["nested"], true);

        let decoded_again = decode(&encoded).unwrap();
        assert_eq!(decoded_again, event);
    }

    #[test]
    fn malformed_json_reports_malformed() {
        match decode(b"{").unwrap_err() {
            DecodeError::Malformed { .. } => {}
            other => panic!("expected Malformed, got {:?}", other),
        }
    }

    #[test]
    fn missing_data_reports_field_path() {
        let bytes = serde_json::to_vec(&serde_json::json!({
            "eventId": "6d9f8a3e-1f4b-4c2a-9d3e-7b1a2c3d4e5f",
            "eventType": "log.user.created",
            "schemaVersion": "1.0.0",
            "timestamp": "2024-07-01T12:00:00Z",
            "correlationId": "8e2ac9f1-63c8-4f11-9282-0a3c2f4e1d10",
            "source": {"service": "user-service", "version": "1.0.0"}
        }))
        .unwrap();
        assert_eq!(
            decode(&bytes).unwrap_err(),
            DecodeError::MissingField {
                path: "data".to_string()
            }
        );
    }

    #[test]
    fn missing_header_field_reports_field_path() {
        let bytes = serde_json::to_vec(&serde_json::json!({
            "eventId": "6d9f8a3e-1f4b-4c2a-9d3e-7b1a2c3d4e5f",
            "eventType": "log.user.created",
            "schemaVersion": "1.0.0",
            "timestamp": "2024-07-01T12:00:00Z",
            "source": {"service": "user-service", "version": "1.0.0"},
            "data": {"level": "INFO", "message": "x", "timestamp": "2024-07-01T12:00:00Z"}
        }))
        .unwrap();
        assert_eq!(
            decode(&bytes).unwrap_err(),
            DecodeError::MissingField {
                path: "correlationId".to_string()
            }
        );
    }

    #[test]
    fn unknown_family_is_rejected() {
        let bytes = serde_json::to_vec(&serde_json::json!({
            "eventId": "6d9f8a3e-1f4b-4c2a-9d3e-7b1a2c3d4e5f",
            "eventType": "audit.user.created",
            "schemaVersion": "1.0.0",
            "timestamp": "2024-07-01T12:00:00Z",
            "correlationId": "8e2ac9f1-63c8-4f11-9282-0a3c2f4e1d10",
            "source": {"service": "user-service", "version": "1.0.0"},
            "data": {}
        }))
        .unwrap();
        assert_eq!(
            decode(&bytes).unwrap_err(),
            DecodeError::UnknownEventType {
                event_type: "audit.user.created".to_string()
            }
        );
    }

    #[test]
    fn fractional_second_timestamps_normalize_to_utc() {
        let bytes = serde_json::to_vec(&serde_json::json!({
            "eventId": "6d9f8a3e-1f4b-4c2a-9d3e-7b1a2c3d4e5f",
            "eventType": "log.user.created",
            "schemaVersion": "1.0.0",
            "timestamp": "2024-07-01T14:00:00.123456789+02:00",
            "correlationId": "8e2ac9f1-63c8-4f11-9282-0a3c2f4e1d10",
            "source": {"service": "user-service", "version": "1.0.0"},
            "data": {"level": "INFO", "message": "x", "timestamp": "2024-07-01T12:00:00Z"}
        }))
        .unwrap();
        let event = decode(&bytes).unwrap();
        assert_eq!(
            event.header.timestamp,
            Utc.with_ymd_and_hms(2024, 7, 1, 12, 0, 0).unwrap()
                + chrono::Duration::nanoseconds(123_456_789)
        );
    }

    #[test]
    fn schema_major_requires_full_semver() {
        assert_eq!(parse_major("1.0.0"), Some(1));
        assert_eq!(parse_major("2.13.4"), Some(2));
        assert_eq!(parse_major("1.0"), None);
        assert_eq!(parse_major("1.0.0.0"), None);
        assert_eq!(parse_major("v1.0.0"), None);
        assert_eq!(parse_major(""), None);
    }
}
