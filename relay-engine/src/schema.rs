// @generated manually — mirrors the migrations in migrations/.

diesel::table! {
    subscriptions (id) {
        id -> Uuid,
        tenant_id -> Text,
        url -> Text,
        name -> Text,
        description -> Nullable<Text>,
        event_mask -> Array<Text>,
        secret -> Text,
        active -> Bool,
        retry_enabled -> Bool,
        max_attempts -> Int4,
        backoff_base_ms -> Int8,
        max_payload_bytes -> Int4,
        notify_on_failure -> Bool,
        total_calls -> Int8,
        success_calls -> Int8,
        failure_calls -> Int8,
        last_call_at -> Nullable<Timestamptz>,
        last_status_code -> Nullable<Int4>,
        avg_response_ms -> Double,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    delivery_attempts (id) {
        id -> Uuid,
        subscription_id -> Uuid,
        tenant_id -> Text,
        source_event_id -> Nullable<Uuid>,
        event_type -> Text,
        payload -> Jsonb,
        status -> Text,
        attempts_made -> Int4,
        max_attempts -> Int4,
        next_retry_at -> Nullable<Timestamptz>,
        last_error -> Nullable<Text>,
        last_http_code -> Nullable<Int4>,
        last_attempt_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
        sent_at -> Nullable<Timestamptz>,
        signature -> Nullable<Text>,
        request_duration_ms -> Nullable<Int4>,
    }
}

diesel::joinable!(delivery_attempts -> subscriptions (subscription_id));
diesel::allow_tables_to_appear_in_same_query!(subscriptions, delivery_attempts);
