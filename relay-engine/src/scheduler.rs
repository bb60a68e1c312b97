use std::time::Duration;

use chrono::Utc;
use relay_shared::clients::db::DbPool;

use crate::dispatcher::DispatchJob;
use crate::outbox;

/// Runs the Retry Scheduler's periodic sweep (spec §4.5) until `shutdown`
/// fires. One logical timer per process — leader election is out of scope
/// because `ClaimDue` is atomic, so two processes racing the same tick is
/// harmless.
pub async fn run(
    db: DbPool,
    tick: Duration,
    batch_size: i64,
    stuck_threshold: Duration,
    dispatch_tx: tokio::sync::mpsc::Sender<DispatchJob>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(tick);
    tracing::info!(tick_secs = tick.as_secs(), batch_size, "retry scheduler started");

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        if let Err(e) = tick_once(&db, batch_size, stuck_threshold, &dispatch_tx).await {
            tracing::error!(error = %e, "retry scheduler tick failed");
        }
    }

    tracing::info!("retry scheduler stopped");
}

async fn tick_once(
    db: &DbPool,
    batch_size: i64,
    stuck_threshold: Duration,
    dispatch_tx: &tokio::sync::mpsc::Sender<DispatchJob>,
) -> anyhow::Result<()> {
    let now = Utc::now();
    let cutoff = now - chrono::Duration::from_std(stuck_threshold)?;

    let db_clone = db.clone();
    let reclaimed = tokio::task::spawn_blocking(move || outbox::reclaim_stuck(&db_clone, cutoff)).await??;
    if reclaimed > 0 {
        tracing::warn!(count = reclaimed, "reclaimed stuck in-flight rows");
    }

    let db_clone = db.clone();
    let claimed =
        tokio::task::spawn_blocking(move || outbox::claim_due(&db_clone, now, batch_size)).await??;

    let total = claimed.len();
    let mut handed_off = 0;
    for attempt in claimed {
        // Non-blocking handoff: a full channel means the pool is saturated,
        // so stop claiming further rows this tick. The row is already
        // durable as `in_flight` and the next tick (or a stuck-row reclaim)
        // will pick it back up.
        match dispatch_tx.try_send(DispatchJob::Claimed(attempt)) {
            Ok(()) => handed_off += 1,
            Err(tokio::sync::mpsc::error::TrySendError::Full(_)) => {
                tracing::debug!("dispatch channel saturated, deferring remaining claims to next tick");
                break;
            }
            Err(tokio::sync::mpsc::error::TrySendError::Closed(_)) => {
                tracing::error!("dispatch channel closed, stopping scheduler handoff for this tick");
                break;
            }
        }
    }

    if handed_off > 0 {
        tracing::debug!(handed_off, total, "retry scheduler handed off due rows");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stuck_threshold_is_multiplier_of_timeout() {
        // spec §4.5: stuck_claim_multiplier(default 5) * dispatcher_timeout_secs(default 10) = 50s
        let multiplier: i64 = 5;
        let timeout_secs: u64 = 10;
        let threshold = Duration::from_secs(multiplier as u64 * timeout_secs);
        assert_eq!(threshold, Duration::from_secs(50));
    }
}
