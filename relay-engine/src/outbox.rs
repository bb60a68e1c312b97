use chrono::{DateTime, Utc};
use diesel::prelude::*;
use uuid::Uuid;

use relay_shared::clients::db::DbPool;
use relay_shared::errors::{AppError, AppResult};
use relay_shared::types::pagination::{Paginated, PaginationParams};

use crate::models::{DeliveryAttempt, NewDeliveryAttempt};
use crate::schema::delivery_attempts;

fn get_conn(
    pool: &DbPool,
) -> AppResult<diesel::r2d2::PooledConnection<diesel::r2d2::ConnectionManager<diesel::PgConnection>>>
{
    pool.get().map_err(|e| {
        tracing::error!(error = %e, "failed to get db connection");
        AppError::internal("database connection error")
    })
}

/// `Insert(attempt)` — persist a new `Pending` row.
pub fn insert(pool: &DbPool, attempt: NewDeliveryAttempt) -> AppResult<DeliveryAttempt> {
    let mut conn = get_conn(pool)?;
    let row = diesel::insert_into(delivery_attempts::table)
        .values(&attempt)
        .get_result::<DeliveryAttempt>(&mut conn)?;
    Ok(row)
}

/// Claims a single row by id if it is still `Pending` — the fast path the
/// Router uses to hand a fresh emission straight to the Dispatcher without
/// waiting for the next scheduler tick. Returns `None` if the row was
/// already claimed by a concurrent sweep (no-op, not an error).
pub fn claim_specific(pool: &DbPool, id: Uuid) -> AppResult<Option<DeliveryAttempt>> {
    let mut conn = get_conn(pool)?;
    let now = Utc::now();
    let updated = diesel::update(
        delivery_attempts::table
            .filter(delivery_attempts::id.eq(id))
            .filter(delivery_attempts::status.eq("pending")),
    )
    .set((
        delivery_attempts::status.eq("in_flight"),
        delivery_attempts::last_attempt_at.eq(now),
    ))
    .get_result::<DeliveryAttempt>(&mut conn)
    .optional()?;
    Ok(updated)
}

/// `ClaimDue(now, max) → [DeliveryAttempt]` — spec §4.3. Two competing workers
/// never claim the same row: the `SELECT ... FOR UPDATE SKIP LOCKED` holds
/// row locks for the duration of the transaction, so a concurrent claimer
/// skips rows this one is already holding.
pub fn claim_due(pool: &DbPool, now: DateTime<Utc>, max: i64) -> AppResult<Vec<DeliveryAttempt>> {
    let mut conn = get_conn(pool)?;

    conn.transaction(|conn| {
        let ids: Vec<Uuid> = delivery_attempts::table
            .select(delivery_attempts::id)
            .filter(delivery_attempts::status.eq("pending"))
            .filter(
                delivery_attempts::next_retry_at
                    .is_null()
                    .or(delivery_attempts::next_retry_at.le(now)),
            )
            .order((
                delivery_attempts::next_retry_at.asc(),
                delivery_attempts::created_at.asc(),
            ))
            .limit(max)
            .for_update()
            .skip_locked()
            .load(conn)?;

        if ids.is_empty() {
            return Ok(Vec::new());
        }

        diesel::update(delivery_attempts::table.filter(delivery_attempts::id.eq_any(&ids)))
            .set((
                delivery_attempts::status.eq("in_flight"),
                delivery_attempts::last_attempt_at.eq(now),
            ))
            .get_results::<DeliveryAttempt>(conn)
    })
    .map_err(AppError::Database)
}

/// `MarkSuccess(id, http_code, duration_ms)` — only valid from `InFlight`.
/// A row already moved by another worker is a silent no-op (spec §4.3).
pub fn mark_success(pool: &DbPool, id: Uuid, http_code: i32, duration_ms: i32) -> AppResult<()> {
    let mut conn = get_conn(pool)?;
    let now = Utc::now();
    diesel::update(
        delivery_attempts::table
            .filter(delivery_attempts::id.eq(id))
            .filter(delivery_attempts::status.eq("in_flight")),
    )
    .set((
        delivery_attempts::status.eq("success"),
        delivery_attempts::attempts_made.eq(delivery_attempts::attempts_made + 1),
        delivery_attempts::last_http_code.eq(http_code),
        delivery_attempts::sent_at.eq(now),
        delivery_attempts::request_duration_ms.eq(duration_ms),
    ))
    .execute(&mut conn)?;
    Ok(())
}

/// `ScheduleRetry(id, next_retry_at, error, http_code)` — only valid from `InFlight`.
pub fn schedule_retry(
    pool: &DbPool,
    id: Uuid,
    next_retry_at: DateTime<Utc>,
    error: &str,
    http_code: Option<i32>,
) -> AppResult<()> {
    let mut conn = get_conn(pool)?;
    diesel::update(
        delivery_attempts::table
            .filter(delivery_attempts::id.eq(id))
            .filter(delivery_attempts::status.eq("in_flight")),
    )
    .set((
        delivery_attempts::status.eq("pending"),
        delivery_attempts::attempts_made.eq(delivery_attempts::attempts_made + 1),
        delivery_attempts::next_retry_at.eq(next_retry_at),
        delivery_attempts::last_error.eq(truncate(error)),
        delivery_attempts::last_http_code.eq(http_code),
    ))
    .execute(&mut conn)?;
    Ok(())
}

/// `MarkFailed(id, error, http_code)` — only valid from `InFlight`.
pub fn mark_failed(pool: &DbPool, id: Uuid, error: &str, http_code: Option<i32>) -> AppResult<()> {
    let mut conn = get_conn(pool)?;
    diesel::update(
        delivery_attempts::table
            .filter(delivery_attempts::id.eq(id))
            .filter(delivery_attempts::status.eq("in_flight")),
    )
    .set((
        delivery_attempts::status.eq("failed"),
        delivery_attempts::attempts_made.eq(delivery_attempts::attempts_made + 1),
        delivery_attempts::last_error.eq(truncate(error)),
        delivery_attempts::last_http_code.eq(http_code),
    ))
    .execute(&mut conn)?;
    Ok(())
}

/// Reclaims rows stuck in `InFlight` past the crash-recovery threshold back
/// to `Pending`, leaving `attempts_made` unchanged (spec §4.5).
pub fn reclaim_stuck(pool: &DbPool, cutoff: DateTime<Utc>) -> AppResult<i64> {
    let mut conn = get_conn(pool)?;
    let affected = diesel::update(
        delivery_attempts::table
            .filter(delivery_attempts::status.eq("in_flight"))
            .filter(delivery_attempts::last_attempt_at.lt(cutoff)),
    )
    .set((
        delivery_attempts::status.eq("pending"),
        delivery_attempts::next_retry_at.eq(Option::<DateTime<Utc>>::None),
    ))
    .execute(&mut conn)?;
    Ok(affected as i64)
}

#[derive(Default)]
pub struct AttemptFilters {
    pub status: Option<String>,
    pub event_type: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

/// `ListForSubscription(sub_id, filters, page) → Page<DeliveryAttempt>`.
pub fn list_for_subscription(
    pool: &DbPool,
    subscription_id: Uuid,
    filters: AttemptFilters,
    params: &PaginationParams,
) -> AppResult<Paginated<DeliveryAttempt>> {
    let mut conn = get_conn(pool)?;

    let mut count_q = delivery_attempts::table
        .filter(delivery_attempts::subscription_id.eq(subscription_id))
        .into_boxed();
    let mut items_q = delivery_attempts::table
        .filter(delivery_attempts::subscription_id.eq(subscription_id))
        .into_boxed();

    if let Some(status) = &filters.status {
        count_q = count_q.filter(delivery_attempts::status.eq(status.clone()));
        items_q = items_q.filter(delivery_attempts::status.eq(status.clone()));
    }
    if let Some(event_type) = &filters.event_type {
        count_q = count_q.filter(delivery_attempts::event_type.eq(event_type.clone()));
        items_q = items_q.filter(delivery_attempts::event_type.eq(event_type.clone()));
    }
    if let Some(start) = filters.start {
        count_q = count_q.filter(delivery_attempts::created_at.ge(start));
        items_q = items_q.filter(delivery_attempts::created_at.ge(start));
    }
    if let Some(end) = filters.end {
        count_q = count_q.filter(delivery_attempts::created_at.le(end));
        items_q = items_q.filter(delivery_attempts::created_at.le(end));
    }

    let total: i64 = count_q.count().get_result(&mut conn)?;
    let items = items_q
        .order(delivery_attempts::created_at.desc())
        .limit(params.limit() as i64)
        .offset(params.offset() as i64)
        .load::<DeliveryAttempt>(&mut conn)?;

    Ok(Paginated::new(items, total as u64, params))
}

#[derive(Debug, Default)]
pub struct AttemptAggregates {
    pub pending: i64,
    pub in_flight: i64,
    pub success: i64,
    pub failed: i64,
    pub by_event_type: Vec<(String, i64)>,
}

/// Aggregates C3 rows for one subscription: status counts (pending/in_flight/
/// success/failed) and a count per `event_type` — spec §4.6. Two `GROUP BY`
/// queries rather than pulling every row into application code.
pub fn aggregate_for_subscription(pool: &DbPool, subscription_id: Uuid) -> AppResult<AttemptAggregates> {
    let mut conn = get_conn(pool)?;

    let status_counts: Vec<(String, i64)> = delivery_attempts::table
        .filter(delivery_attempts::subscription_id.eq(subscription_id))
        .group_by(delivery_attempts::status)
        .select((delivery_attempts::status, diesel::dsl::count_star()))
        .load(&mut conn)?;

    let event_type_counts: Vec<(String, i64)> = delivery_attempts::table
        .filter(delivery_attempts::subscription_id.eq(subscription_id))
        .group_by(delivery_attempts::event_type)
        .select((delivery_attempts::event_type, diesel::dsl::count_star()))
        .load(&mut conn)?;

    let mut aggregates = AttemptAggregates {
        by_event_type: event_type_counts,
        ..Default::default()
    };
    for (status, count) in status_counts {
        match status.as_str() {
            "pending" => aggregates.pending = count,
            "in_flight" => aggregates.in_flight = count,
            "success" => aggregates.success = count,
            "failed" => aggregates.failed = count,
            _ => {}
        }
    }

    Ok(aggregates)
}

fn truncate(s: &str) -> String {
    const MAX: usize = 2000;
    if s.len() > MAX {
        s.chars().take(MAX).collect()
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_leaves_short_strings_alone() {
        assert_eq!(truncate("short error"), "short error");
    }

    #[test]
    fn truncate_caps_long_strings() {
        let long = "x".repeat(5000);
        assert_eq!(truncate(&long).len(), 2000);
    }
}
