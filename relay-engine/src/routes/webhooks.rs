use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use relay_shared::errors::{AppError, AppResult};
use relay_shared::types::api::ApiResponse;
use relay_shared::types::auth::TenantPrincipal;
use relay_shared::types::pagination::{Paginated, PaginationParams};

use crate::models::{DeliveryAttempt, SubscriptionWithSecret};
use crate::outbox::{self, AttemptFilters};
use crate::registry::{self, CreateSubscriptionInput, ListFilters, UpdateSubscriptionInput};
use crate::signing;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateWebhookRequest {
    pub url: String,
    pub name: String,
    pub description: Option<String>,
    pub events: Vec<String>,
    pub max_attempts: Option<i32>,
    pub backoff_base_ms: Option<i64>,
    pub notify_on_failure: Option<bool>,
}

/// POST /webhooks
pub async fn create(
    State(state): State<Arc<AppState>>,
    principal: TenantPrincipal,
    Json(body): Json<CreateWebhookRequest>,
) -> AppResult<Json<ApiResponse<SubscriptionWithSecret>>> {
    let input = CreateSubscriptionInput {
        url: body.url,
        name: body.name,
        description: body.description,
        event_mask: body.events,
        max_attempts: body.max_attempts,
        backoff_base_ms: body.backoff_base_ms,
        max_payload_bytes: None,
        notify_on_failure: body.notify_on_failure,
    };

    let db = state.db.clone();
    let tenant_id = principal.tenant_id.clone();
    let sub = tokio::task::spawn_blocking(move || registry::create(&db, &tenant_id, input))
        .await
        .map_err(|e| AppError::internal(format!("create task panicked: {e}")))??;

    Ok(Json(ApiResponse::ok(sub.with_secret())))
}

fn default_page() -> u64 {
    1
}
fn default_per_page() -> u64 {
    20
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default = "default_page")]
    pub page: u64,
    #[serde(default = "default_per_page")]
    pub per_page: u64,
    pub active: Option<bool>,
}

/// GET /webhooks
pub async fn list(
    State(state): State<Arc<AppState>>,
    principal: TenantPrincipal,
    Query(query): Query<ListQuery>,
) -> AppResult<Json<ApiResponse<Paginated<crate::models::Subscription>>>> {
    let db = state.db.clone();
    let tenant_id = principal.tenant_id.clone();
    let params = PaginationParams {
        page: query.page,
        per_page: query.per_page,
    };
    let filters = ListFilters { active: query.active };

    let page = tokio::task::spawn_blocking(move || registry::list(&db, &tenant_id, filters, &params))
        .await
        .map_err(|e| AppError::internal(format!("list task panicked: {e}")))??;

    Ok(Json(ApiResponse::ok(page)))
}

/// GET /webhooks/{id}
pub async fn get(
    State(state): State<Arc<AppState>>,
    principal: TenantPrincipal,
    Path(id): Path<Uuid>,
) -> AppResult<Json<ApiResponse<SubscriptionWithSecret>>> {
    let db = state.db.clone();
    let tenant_id = principal.tenant_id.clone();
    let sub = tokio::task::spawn_blocking(move || registry::get(&db, &tenant_id, id))
        .await
        .map_err(|e| AppError::internal(format!("get task panicked: {e}")))??;

    Ok(Json(ApiResponse::ok(sub.with_secret())))
}

#[derive(Debug, Deserialize)]
pub struct UpdateWebhookRequest {
    pub url: Option<String>,
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub events: Option<Vec<String>>,
    pub active: Option<bool>,
    pub retry_enabled: Option<bool>,
    pub max_attempts: Option<i32>,
    pub backoff_base_ms: Option<i64>,
    pub notify_on_failure: Option<bool>,
}

/// PUT /webhooks/{id}
pub async fn update(
    State(state): State<Arc<AppState>>,
    principal: TenantPrincipal,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateWebhookRequest>,
) -> AppResult<Json<ApiResponse<crate::models::Subscription>>> {
    let patch = UpdateSubscriptionInput {
        url: body.url,
        name: body.name,
        description: body.description,
        event_mask: body.events,
        active: body.active,
        retry_enabled: body.retry_enabled,
        max_attempts: body.max_attempts,
        backoff_base_ms: body.backoff_base_ms,
        notify_on_failure: body.notify_on_failure,
    };

    let db = state.db.clone();
    let tenant_id = principal.tenant_id.clone();
    let sub = tokio::task::spawn_blocking(move || registry::update(&db, &tenant_id, id, patch))
        .await
        .map_err(|e| AppError::internal(format!("update task panicked: {e}")))??;

    Ok(Json(ApiResponse::ok(sub)))
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub deleted: bool,
}

/// DELETE /webhooks/{id}
pub async fn delete(
    State(state): State<Arc<AppState>>,
    principal: TenantPrincipal,
    Path(id): Path<Uuid>,
) -> AppResult<Json<ApiResponse<DeleteResponse>>> {
    let db = state.db.clone();
    let tenant_id = principal.tenant_id.clone();
    tokio::task::spawn_blocking(move || registry::delete(&db, &tenant_id, id))
        .await
        .map_err(|e| AppError::internal(format!("delete task panicked: {e}")))??;

    Ok(Json(ApiResponse::ok(DeleteResponse { deleted: true })))
}

/// POST /webhooks/{id}/rotate-secret
pub async fn rotate_secret(
    State(state): State<Arc<AppState>>,
    principal: TenantPrincipal,
    Path(id): Path<Uuid>,
) -> AppResult<Json<ApiResponse<SubscriptionWithSecret>>> {
    let db = state.db.clone();
    let tenant_id = principal.tenant_id.clone();
    let sub = tokio::task::spawn_blocking(move || registry::rotate_secret(&db, &tenant_id, id))
        .await
        .map_err(|e| AppError::internal(format!("rotate_secret task panicked: {e}")))??;

    Ok(Json(ApiResponse::ok(sub.with_secret())))
}

#[derive(Debug, Serialize)]
pub struct TestProbeResponse {
    pub ok: bool,
    pub http_code: Option<u16>,
    pub latency_ms: i64,
    pub error: Option<String>,
}

/// POST /webhooks/{id}/test — a synchronous probe with no Outbox row (spec §4.6).
pub async fn test(
    State(state): State<Arc<AppState>>,
    principal: TenantPrincipal,
    Path(id): Path<Uuid>,
) -> AppResult<Json<ApiResponse<TestProbeResponse>>> {
    let db = state.db.clone();
    let tenant_id = principal.tenant_id.clone();
    let sub = tokio::task::spawn_blocking(move || registry::get(&db, &tenant_id, id))
        .await
        .map_err(|e| AppError::internal(format!("test task panicked: {e}")))??;

    let payload = serde_json::json!({
        "event": "webhook.test",
        "data": { "message": "this is a test delivery" },
        "sent_at": Utc::now(),
    });
    let body = serde_json::to_vec(&payload).map_err(|e| AppError::internal(e.to_string()))?;
    let signature = signing::sign(&sub.secret, &body);

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .redirect(reqwest::redirect::Policy::limited(3))
        .build()
        .map_err(|e| AppError::internal(e.to_string()))?;

    let started = Instant::now();
    let result = client
        .post(&sub.url)
        .header("Content-Type", "application/json")
        .header("X-Webhook-Signature", &signature)
        .header("X-Webhook-Event", "webhook.test")
        .body(body)
        .send()
        .await;
    let latency_ms = started.elapsed().as_millis() as i64;

    let response = match result {
        Ok(resp) => {
            let status = resp.status().as_u16();
            TestProbeResponse {
                ok: (200..400).contains(&status),
                http_code: Some(status),
                latency_ms,
                error: None,
            }
        }
        Err(e) => TestProbeResponse {
            ok: false,
            http_code: None,
            latency_ms,
            error: Some(e.to_string()),
        },
    };

    Ok(Json(ApiResponse::ok(response)))
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    #[serde(default = "default_page")]
    pub page: u64,
    #[serde(default = "default_per_page")]
    pub per_page: u64,
    pub status: Option<String>,
    pub event_type: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

/// GET /webhooks/{id}/events
pub async fn events(
    State(state): State<Arc<AppState>>,
    principal: TenantPrincipal,
    Path(id): Path<Uuid>,
    Query(query): Query<EventsQuery>,
) -> AppResult<Json<ApiResponse<Paginated<DeliveryAttempt>>>> {
    let db = state.db.clone();
    let tenant_id = principal.tenant_id.clone();
    // Enforces tenant isolation before touching delivery_attempts.
    tokio::task::spawn_blocking({
        let db = db.clone();
        let tenant_id = tenant_id.clone();
        move || registry::get(&db, &tenant_id, id)
    })
    .await
    .map_err(|e| AppError::internal(format!("events task panicked: {e}")))??;

    let filters = AttemptFilters {
        status: query.status,
        event_type: query.event_type,
        start: query.start,
        end: query.end,
    };
    let params = PaginationParams {
        page: query.page,
        per_page: query.per_page,
    };
    let page = tokio::task::spawn_blocking(move || {
        outbox::list_for_subscription(&db, id, filters, &params)
    })
    .await
    .map_err(|e| AppError::internal(format!("events task panicked: {e}")))??;

    Ok(Json(ApiResponse::ok(page)))
}

#[derive(Debug, Serialize)]
pub struct EventTypeCount {
    pub event_type: String,
    pub count: i64,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub total_calls: i64,
    pub success_calls: i64,
    pub failure_calls: i64,
    pub avg_response_ms: f64,
    pub last_call_at: Option<DateTime<Utc>>,
    pub last_status_code: Option<i32>,
    pub pending_count: i64,
    pub in_flight_count: i64,
    pub success_count: i64,
    pub failed_count: i64,
    pub by_event_type: Vec<EventTypeCount>,
    pub recent_attempts: Vec<DeliveryAttempt>,
}

/// GET /webhooks/{id}/stats — C1.stats plus a real aggregation over C3
/// (status counts and per-event_type counts), not a sample of recent rows.
pub async fn stats(
    State(state): State<Arc<AppState>>,
    principal: TenantPrincipal,
    Path(id): Path<Uuid>,
) -> AppResult<Json<ApiResponse<StatsResponse>>> {
    let db = state.db.clone();
    let tenant_id = principal.tenant_id.clone();
    let sub = tokio::task::spawn_blocking(move || registry::get(&db, &tenant_id, id))
        .await
        .map_err(|e| AppError::internal(format!("stats task panicked: {e}")))??;

    let db = state.db.clone();
    let aggregates = tokio::task::spawn_blocking(move || outbox::aggregate_for_subscription(&db, id))
        .await
        .map_err(|e| AppError::internal(format!("stats task panicked: {e}")))??;

    let db = state.db.clone();
    let recent = tokio::task::spawn_blocking(move || {
        outbox::list_for_subscription(
            &db,
            id,
            AttemptFilters::default(),
            &PaginationParams { page: 1, per_page: 10 },
        )
    })
    .await
    .map_err(|e| AppError::internal(format!("stats task panicked: {e}")))??;

    Ok(Json(ApiResponse::ok(StatsResponse {
        total_calls: sub.total_calls,
        success_calls: sub.success_calls,
        failure_calls: sub.failure_calls,
        avg_response_ms: sub.avg_response_ms,
        last_call_at: sub.last_call_at,
        last_status_code: sub.last_status_code,
        pending_count: aggregates.pending,
        in_flight_count: aggregates.in_flight,
        success_count: aggregates.success,
        failed_count: aggregates.failed,
        by_event_type: aggregates
            .by_event_type
            .into_iter()
            .map(|(event_type, count)| EventTypeCount { event_type, count })
            .collect(),
        recent_attempts: recent.items,
    })))
}
