use chrono::Utc;
use diesel::prelude::*;
use uuid::Uuid;

use relay_shared::clients::db::DbPool;
use relay_shared::errors::{AppError, AppResult, ErrorCode};
use relay_shared::types::pagination::{Paginated, PaginationParams};

use crate::models::{DeliveryOutcomeKind, EventType, NewSubscription, Subscription};
use crate::schema::subscriptions;
use crate::signing;

const VALID_EVENT_TYPES: [&str; 5] = [
    "sms.sent",
    "sms.delivered",
    "sms.failed",
    "sms.bounced",
    "sms.read",
];

pub struct CreateSubscriptionInput {
    pub url: String,
    pub name: String,
    pub description: Option<String>,
    pub event_mask: Vec<String>,
    pub max_attempts: Option<i32>,
    pub backoff_base_ms: Option<i64>,
    pub max_payload_bytes: Option<i32>,
    pub notify_on_failure: Option<bool>,
}

#[derive(Default)]
pub struct UpdateSubscriptionInput {
    pub url: Option<String>,
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub event_mask: Option<Vec<String>>,
    pub active: Option<bool>,
    pub retry_enabled: Option<bool>,
    pub max_attempts: Option<i32>,
    pub backoff_base_ms: Option<i64>,
    pub notify_on_failure: Option<bool>,
}

fn validate_url(url: &str) -> AppResult<()> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| AppError::new(ErrorCode::ValidationError, format!("invalid url: {e}")))?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(AppError::new(
            ErrorCode::ValidationError,
            "url must use http or https",
        ));
    }
    Ok(())
}

fn validate_event_mask(mask: &[String]) -> AppResult<()> {
    if mask.is_empty() {
        return Err(AppError::new(
            ErrorCode::ValidationError,
            "event_mask must not be empty",
        ));
    }
    for ev in mask {
        if !VALID_EVENT_TYPES.contains(&ev.as_str()) {
            return Err(AppError::new(
                ErrorCode::ValidationError,
                format!("unknown event type in event_mask: {ev}"),
            ));
        }
    }
    Ok(())
}

fn validate_max_attempts(n: i32) -> AppResult<()> {
    if !(1..=10).contains(&n) {
        return Err(AppError::new(
            ErrorCode::ValidationError,
            "max_attempts must be between 1 and 10",
        ));
    }
    Ok(())
}

fn validate_backoff_base_ms(ms: i64) -> AppResult<()> {
    if !(1_000..=3_600_000).contains(&ms) {
        return Err(AppError::new(
            ErrorCode::ValidationError,
            "backoff_base_ms must be between 1,000 and 3,600,000",
        ));
    }
    Ok(())
}

fn get_conn(pool: &DbPool) -> AppResult<diesel::r2d2::PooledConnection<diesel::r2d2::ConnectionManager<diesel::PgConnection>>> {
    pool.get().map_err(|e| {
        tracing::error!(error = %e, "failed to get db connection");
        AppError::internal("database connection error")
    })
}

/// `Create(tenant, spec) → Subscription` — spec §4.1.
pub fn create(pool: &DbPool, tenant_id: &str, input: CreateSubscriptionInput) -> AppResult<Subscription> {
    validate_url(&input.url)?;
    validate_event_mask(&input.event_mask)?;
    let max_attempts = input.max_attempts.unwrap_or(3);
    validate_max_attempts(max_attempts)?;
    let backoff_base_ms = input.backoff_base_ms.unwrap_or(1_000);
    validate_backoff_base_ms(backoff_base_ms)?;
    let max_payload_bytes = input.max_payload_bytes.unwrap_or(1024 * 1024);
    if !(10 * 1024..=10 * 1024 * 1024).contains(&max_payload_bytes) {
        return Err(AppError::new(
            ErrorCode::ValidationError,
            "max_payload_bytes must be between 10 KiB and 10 MiB",
        ));
    }

    let mut conn = get_conn(pool)?;
    let now = Utc::now();
    let new_sub = NewSubscription {
        id: Uuid::now_v7(),
        tenant_id: tenant_id.to_string(),
        url: input.url,
        name: input.name,
        description: input.description,
        event_mask: input.event_mask,
        secret: signing::generate_secret(),
        active: true,
        retry_enabled: true,
        max_attempts,
        backoff_base_ms,
        max_payload_bytes,
        notify_on_failure: input.notify_on_failure.unwrap_or(false),
        created_at: now,
        updated_at: now,
    };

    let sub = diesel::insert_into(subscriptions::table)
        .values(&new_sub)
        .get_result::<Subscription>(&mut conn)?;

    tracing::debug!(subscription_id = %sub.id, tenant_id = %tenant_id, "subscription created");
    Ok(sub)
}

/// `Get(tenant, id) → Subscription` — includes `secret`.
pub fn get(pool: &DbPool, tenant_id: &str, id: Uuid) -> AppResult<Subscription> {
    let mut conn = get_conn(pool)?;
    let sub = subscriptions::table
        .find(id)
        .first::<Subscription>(&mut conn)
        .map_err(|e| match e {
            diesel::result::Error::NotFound => {
                AppError::new(ErrorCode::SubscriptionNotFound, "subscription not found")
            }
            other => AppError::Database(other),
        })?;

    if sub.tenant_id != tenant_id {
        return Err(AppError::forbidden("subscription belongs to another tenant"));
    }

    Ok(sub)
}

pub struct ListFilters {
    pub active: Option<bool>,
}

/// `List(tenant, {active?, limit, offset}) → Page<Subscription>` — secret redacted
/// by the caller (the `Subscription` struct's `Serialize` impl skips it).
pub fn list(
    pool: &DbPool,
    tenant_id: &str,
    filters: ListFilters,
    params: &PaginationParams,
) -> AppResult<Paginated<Subscription>> {
    let mut conn = get_conn(pool)?;

    let mut count_query = subscriptions::table
        .filter(subscriptions::tenant_id.eq(tenant_id))
        .into_boxed();
    let mut items_query = subscriptions::table
        .filter(subscriptions::tenant_id.eq(tenant_id))
        .into_boxed();

    if let Some(active) = filters.active {
        count_query = count_query.filter(subscriptions::active.eq(active));
        items_query = items_query.filter(subscriptions::active.eq(active));
    }

    let total: i64 = count_query.count().get_result(&mut conn)?;

    let items = items_query
        .order((subscriptions::created_at.desc(), subscriptions::id.asc()))
        .limit(params.limit() as i64)
        .offset(params.offset() as i64)
        .load::<Subscription>(&mut conn)?;

    Ok(Paginated::new(items, total as u64, params))
}

/// `Update(tenant, id, patch) → Subscription`.
pub fn update(
    pool: &DbPool,
    tenant_id: &str,
    id: Uuid,
    patch: UpdateSubscriptionInput,
) -> AppResult<Subscription> {
    // Enforce isolation before mutating.
    let existing = get(pool, tenant_id, id)?;

    if let Some(url) = &patch.url {
        validate_url(url)?;
    }
    if let Some(mask) = &patch.event_mask {
        validate_event_mask(mask)?;
    }
    if let Some(n) = patch.max_attempts {
        validate_max_attempts(n)?;
    }
    if let Some(ms) = patch.backoff_base_ms {
        validate_backoff_base_ms(ms)?;
    }

    let mut conn = get_conn(pool)?;

    let updated = diesel::update(subscriptions::table.find(id))
        .set((
            subscriptions::url.eq(patch.url.unwrap_or(existing.url)),
            subscriptions::name.eq(patch.name.unwrap_or(existing.name)),
            subscriptions::description.eq(patch.description.unwrap_or(existing.description)),
            subscriptions::event_mask.eq(patch.event_mask.unwrap_or(existing.event_mask)),
            subscriptions::active.eq(patch.active.unwrap_or(existing.active)),
            subscriptions::retry_enabled.eq(patch.retry_enabled.unwrap_or(existing.retry_enabled)),
            subscriptions::max_attempts.eq(patch.max_attempts.unwrap_or(existing.max_attempts)),
            subscriptions::backoff_base_ms
                .eq(patch.backoff_base_ms.unwrap_or(existing.backoff_base_ms)),
            subscriptions::notify_on_failure
                .eq(patch.notify_on_failure.unwrap_or(existing.notify_on_failure)),
            subscriptions::updated_at.eq(Utc::now()),
        ))
        .get_result::<Subscription>(&mut conn)?;

    tracing::debug!(subscription_id = %id, "subscription updated");
    Ok(updated)
}

/// `Delete(tenant, id)` — hard delete; DeliveryAttempts age out on their own TTL.
pub fn delete(pool: &DbPool, tenant_id: &str, id: Uuid) -> AppResult<()> {
    get(pool, tenant_id, id)?;
    let mut conn = get_conn(pool)?;
    diesel::delete(subscriptions::table.find(id)).execute(&mut conn)?;
    tracing::debug!(subscription_id = %id, "subscription deleted");
    Ok(())
}

/// `RotateSecret(tenant, id) → Subscription`.
pub fn rotate_secret(pool: &DbPool, tenant_id: &str, id: Uuid) -> AppResult<Subscription> {
    get(pool, tenant_id, id)?;
    let mut conn = get_conn(pool)?;
    let new_secret = signing::generate_secret();

    let updated = diesel::update(subscriptions::table.find(id))
        .set((
            subscriptions::secret.eq(new_secret),
            subscriptions::updated_at.eq(Utc::now()),
        ))
        .get_result::<Subscription>(&mut conn)?;

    tracing::info!(subscription_id = %id, "subscription secret rotated");
    Ok(updated)
}

/// `IncrementStats(id, outcome, latency_ms)` — single atomic `UPDATE`, no
/// read-modify-write (spec §9's redesign flag on stats updates).
pub fn increment_stats(
    pool: &DbPool,
    id: Uuid,
    outcome: DeliveryOutcomeKind,
    http_code: Option<i32>,
    latency_ms: i64,
) -> AppResult<()> {
    let mut conn = get_conn(pool)?;
    let now = Utc::now();

    let affected = match outcome {
        DeliveryOutcomeKind::Success => diesel::sql_query(
            "UPDATE subscriptions SET \
                total_calls = total_calls + 1, \
                success_calls = success_calls + 1, \
                last_call_at = $1, \
                last_status_code = $2, \
                avg_response_ms = avg_response_ms + ($3 - avg_response_ms) / (total_calls + 1) \
             WHERE id = $4",
        )
        .bind::<diesel::sql_types::Timestamptz, _>(now)
        .bind::<diesel::sql_types::Nullable<diesel::sql_types::Int4>, _>(http_code)
        .bind::<diesel::sql_types::Double, _>(latency_ms as f64)
        .bind::<diesel::sql_types::Uuid, _>(id)
        .execute(&mut conn)?,
        DeliveryOutcomeKind::Failure => diesel::sql_query(
            "UPDATE subscriptions SET \
                total_calls = total_calls + 1, \
                failure_calls = failure_calls + 1, \
                last_call_at = $1, \
                last_status_code = $2, \
                avg_response_ms = avg_response_ms + ($3 - avg_response_ms) / (total_calls + 1) \
             WHERE id = $4",
        )
        .bind::<diesel::sql_types::Timestamptz, _>(now)
        .bind::<diesel::sql_types::Nullable<diesel::sql_types::Int4>, _>(http_code)
        .bind::<diesel::sql_types::Double, _>(latency_ms as f64)
        .bind::<diesel::sql_types::Uuid, _>(id)
        .execute(&mut conn)?,
    };

    if affected == 0 {
        tracing::warn!(subscription_id = %id, "increment_stats affected no rows");
    }
    Ok(())
}

pub fn event_type_mask(sub: &Subscription) -> Vec<EventType> {
    sub.event_mask
        .iter()
        .filter_map(|s| s.parse().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_url_rejects_non_http_scheme() {
        assert!(validate_url("ftp://example.com").is_err());
        assert!(validate_url("https://example.com/hook").is_ok());
        assert!(validate_url("http://example.com/hook").is_ok());
    }

    #[test]
    fn validate_event_mask_rejects_empty_and_unknown() {
        assert!(validate_event_mask(&[]).is_err());
        assert!(validate_event_mask(&["sms.exploded".to_string()]).is_err());
        assert!(validate_event_mask(&["sms.delivered".to_string()]).is_ok());
    }

    #[test]
    fn validate_max_attempts_bounds() {
        assert!(validate_max_attempts(0).is_err());
        assert!(validate_max_attempts(11).is_err());
        assert!(validate_max_attempts(1).is_ok());
        assert!(validate_max_attempts(10).is_ok());
    }

    #[test]
    fn validate_backoff_base_ms_bounds() {
        assert!(validate_backoff_base_ms(999).is_err());
        assert!(validate_backoff_base_ms(3_600_001).is_err());
        assert!(validate_backoff_base_ms(1_000).is_ok());
        assert!(validate_backoff_base_ms(3_600_000).is_ok());
    }
}
