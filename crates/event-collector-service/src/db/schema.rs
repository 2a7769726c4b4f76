diesel::table! {
    use diesel::sql_types::*;

    logs (event_id) {
        event_id -> Uuid,
        correlation_id -> Uuid,
        timestamp -> Timestamptz,
        level -> Text,
        service -> Text,
        message -> Text,
        context -> Nullable<Jsonb>,
        error -> Nullable<Jsonb>,
        structured -> Nullable<Jsonb>,
        metadata -> Jsonb,
    }
}

diesel::table! {
    use diesel::sql_types::*;

    metrics (event_id) {
        event_id -> Uuid,
        correlation_id -> Uuid,
        timestamp -> Timestamptz,
        name -> Text,
        metric_type -> Text,
        value -> Jsonb,
        unit -> Text,
        service -> Text,
        dimensions -> Nullable<Jsonb>,
        metadata -> Jsonb,
    }
}

diesel::table! {
    use diesel::sql_types::*;

    traces (event_id) {
        event_id -> Uuid,
        correlation_id -> Uuid,
        timestamp -> Timestamptz,
        trace_id -> Text,
        span_id -> Text,
        parent_span_id -> Nullable<Text>,
        operation_name -> Text,
        service -> Text,
        duration_us -> Nullable<Int8>,
        status -> Nullable<Jsonb>,
        tags -> Nullable<Jsonb>,
        metadata -> Jsonb,
    }
}

diesel::table! {
    use diesel::sql_types::*;

    dead_letter_events (id) {
        id -> Uuid,
        event_id -> Nullable<Uuid>,
        routing_key -> Text,
        original_message -> Bytea,
        error_message -> Text,
        error_details -> Jsonb,
        retry_count -> Int4,
        max_retries -> Int4,
        last_retry_at -> Nullable<Timestamptz>,
        next_retry_at -> Nullable<Timestamptz>,
        resolved -> Bool,
        created_at -> Timestamptz,
    }
}
