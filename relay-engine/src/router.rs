use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use relay_shared::clients::db::DbPool;

use crate::dispatcher::DispatchJob;
use crate::models::NewDeliveryAttempt;
use crate::schema::subscriptions;

/// The external SMS lifecycle event `Router::emit` accepts. Producer-side
/// concerns (provider adapters) are out of scope; this type is the contract
/// boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmsLifecycleEvent {
    pub tenant_id: String,
    pub source_event_id: Option<Uuid>,
    pub event_type: String,
    pub recipient: String,
    pub provider: String,
    pub provider_message_id: Option<String>,
    pub cost: Option<f64>,
    pub currency: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub error_reason: Option<String>,
    pub error_code: Option<String>,
}

/// Hands a newly-claimed or newly-inserted row to the Dispatcher pool.
/// Cloning is cheap (the pool and channel sender are both `Clone`).
#[derive(Clone)]
pub struct Router {
    db: DbPool,
    dispatch_tx: tokio::sync::mpsc::Sender<DispatchJob>,
}

impl Router {
    pub fn new(db: DbPool, dispatch_tx: tokio::sync::mpsc::Sender<DispatchJob>) -> Self {
        Self { db, dispatch_tx }
    }

    /// `Emit(tenant_id, event_type, payload) → fire-and-forget` — spec §4.2.
    ///
    /// Never blocks the caller past the durable inserts, and never surfaces
    /// downstream delivery failures — those live entirely in the Outbox row.
    pub async fn emit(&self, event: SmsLifecycleEvent) {
        let db = self.db.clone();
        let tenant_id = event.tenant_id.clone();
        let event_type = event.event_type.clone();
        let source_event_id = event.source_event_id;
        let payload = match serde_json::to_value(&event) {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize sms lifecycle event, dropping emission");
                return;
            }
        };

        let inserted = tokio::task::spawn_blocking(move || {
            insert_matching(&db, &tenant_id, &event_type, source_event_id, payload)
        })
        .await;

        let ids = match inserted {
            Ok(Ok(ids)) => ids,
            Ok(Err(e)) => {
                tracing::error!(error = %e, "emit failed to persist delivery attempts");
                return;
            }
            Err(e) => {
                tracing::error!(error = %e, "emit's blocking insert task panicked");
                return;
            }
        };

        for id in ids {
            // Non-blocking handoff: if the channel is saturated, the row stays
            // Pending and the Retry Scheduler's sweep will pick it up.
            if self.dispatch_tx.try_send(DispatchJob::Pending(id)).is_err() {
                tracing::debug!(delivery_id = %id, "dispatch channel saturated, deferring to scheduler sweep");
            }
        }
    }
}

fn insert_matching(
    db: &DbPool,
    tenant_id: &str,
    event_type: &str,
    source_event_id: Option<Uuid>,
    payload: serde_json::Value,
) -> anyhow::Result<Vec<Uuid>> {
    let mut conn = db.get()?;

    let matches: Vec<(Uuid, i32)> = subscriptions::table
        .filter(subscriptions::tenant_id.eq(tenant_id))
        .filter(subscriptions::active.eq(true))
        .filter(subscriptions::event_mask.contains(vec![event_type.to_string()]))
        .select((subscriptions::id, subscriptions::max_attempts))
        .load(&mut conn)?;

    let now = Utc::now();
    let mut ids = Vec::with_capacity(matches.len());

    for (subscription_id, max_attempts) in matches {
        let id = Uuid::now_v7();
        let new_attempt = NewDeliveryAttempt {
            id,
            subscription_id,
            tenant_id: tenant_id.to_string(),
            source_event_id,
            event_type: event_type.to_string(),
            payload: payload.clone(),
            status: "pending".to_string(),
            attempts_made: 0,
            max_attempts,
            created_at: now,
        };

        diesel::insert_into(crate::schema::delivery_attempts::table)
            .values(&new_attempt)
            .execute(&mut conn)?;

        ids.push(id);
    }

    Ok(ids)
}
