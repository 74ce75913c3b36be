//! Diesel table definitions for the rebuild engine.
//!
//! Tables: rebuild_events, rebuild_artifact_builds, rebuild_event_dependencies.
//! Enumerations are stored as lowercase VARCHAR values.

diesel::table! {
    rebuild_events (id) {
        id -> Int8,
        message_id -> Varchar,
        event_type -> Varchar,
        search_key -> Varchar,
        state -> Varchar,
        state_reason -> Text,
        dry_run -> Bool,
        requester -> Nullable<Varchar>,
        handler_results -> Jsonb,
        time_created -> Timestamptz,
        time_done -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    rebuild_artifact_builds (id) {
        id -> Int8,
        event_id -> Int8,
        name -> Varchar,
        artifact_type -> Varchar,
        original_nvr -> Varchar,
        rebuilt_nvr -> Nullable<Varchar>,
        state -> Varchar,
        state_reason -> Text,
        rebuild_reason -> Varchar,
        dep_on_id -> Nullable<Int8>,
        build_args -> Jsonb,
        task_id -> Nullable<Varchar>,
        retry_count -> Int4,
        time_created -> Timestamptz,
        time_submitted -> Nullable<Timestamptz>,
        time_completed -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    rebuild_event_dependencies (event_id, depends_on_id) {
        event_id -> Int8,
        depends_on_id -> Int8,
    }
}

// Foreign key relationships
diesel::joinable!(rebuild_artifact_builds -> rebuild_events (event_id));

diesel::allow_tables_to_appear_in_same_query!(
    rebuild_events,
    rebuild_artifact_builds,
    rebuild_event_dependencies,
);
