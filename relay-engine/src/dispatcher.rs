use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use diesel::prelude::*;
use reqwest::Client;
use uuid::Uuid;

use relay_shared::clients::db::DbPool;
use relay_shared::errors::DeliveryOutcome;

use crate::models::{DeliveryAttempt, DeliveryOutcomeKind, Subscription};
use crate::schema::subscriptions;
use crate::signing;
use crate::{outbox, registry};

/// A unit of work handed to a Dispatcher worker.
///
/// `Pending` rows arrive fresh off the Router's handoff channel and still
/// need claiming (transition to `InFlight`) before work starts; `Claimed`
/// rows arrive from the Retry Scheduler's sweep already `InFlight`.
pub enum DispatchJob {
    Pending(Uuid),
    Claimed(DeliveryAttempt),
}

#[derive(Clone)]
pub struct Dispatcher {
    db: DbPool,
    client: Client,
    semaphore: Arc<tokio::sync::Semaphore>,
    shutdown: tokio::sync::watch::Receiver<bool>,
}

impl Dispatcher {
    pub fn new(
        db: DbPool,
        concurrency: usize,
        timeout_secs: u64,
        shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .redirect(reqwest::redirect::Policy::limited(3))
            .build()?;

        Ok(Self {
            db,
            client,
            semaphore: Arc::new(tokio::sync::Semaphore::new(concurrency)),
            shutdown,
        })
    }

    /// Runs the worker loop: pulls jobs off `rx` and processes each under the
    /// bounded semaphore. Returns once `rx` is closed and all in-flight
    /// permits have drained (or the shutdown grace period elapses).
    pub async fn run(self, mut rx: tokio::sync::mpsc::Receiver<DispatchJob>, grace: Duration) {
        tracing::info!("dispatcher started");
        loop {
            let job = tokio::select! {
                job = rx.recv() => job,
                _ = self.wait_for_shutdown() => {
                    tracing::info!("dispatcher stopping acceptance of new claims, draining in-flight work");
                    None
                }
            };

            let Some(job) = job else { break };

            let permit = match self.semaphore.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => break,
            };

            let this = self.clone();
            tokio::spawn(async move {
                let _permit = permit;
                this.process(job).await;
            });
        }

        let deadline = tokio::time::sleep(grace);
        tokio::pin!(deadline);
        tokio::select! {
            _ = self.drain() => {}
            _ = &mut deadline => {
                tracing::warn!("shutdown grace period elapsed with workers still in flight");
            }
        }
        tracing::info!("dispatcher stopped");
    }

    async fn wait_for_shutdown(&self) {
        let mut rx = self.shutdown.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    async fn drain(&self) {
        // Acquiring every permit blocks until all in-flight workers release theirs.
        let _ = self.semaphore.acquire_many(self.semaphore.available_permits().max(1) as u32).await;
    }

    async fn process(&self, job: DispatchJob) {
        let attempt = match job {
            DispatchJob::Claimed(a) => a,
            DispatchJob::Pending(id) => {
                let db = self.db.clone();
                match tokio::task::spawn_blocking(move || outbox::claim_specific(&db, id)).await {
                    Ok(Ok(Some(a))) => a,
                    Ok(Ok(None)) => return, // already claimed elsewhere
                    Ok(Err(e)) => {
                        tracing::error!(delivery_id = %id, error = %e, "failed to claim delivery attempt");
                        return;
                    }
                    Err(e) => {
                        tracing::error!(delivery_id = %id, error = %e, "claim task panicked");
                        return;
                    }
                }
            }
        };

        let db = self.db.clone();
        let subscription_id = attempt.subscription_id;
        let sub = match tokio::task::spawn_blocking(move || load_subscription(&db, subscription_id))
            .await
        {
            Ok(Ok(Some(s))) => s,
            Ok(Ok(None)) => {
                tracing::warn!(subscription_id = %subscription_id, "subscription vanished before delivery, marking failed");
                let db = self.db.clone();
                let _ = tokio::task::spawn_blocking(move || {
                    outbox::mark_failed(&db, attempt.id, "subscription no longer exists", None)
                })
                .await;
                return;
            }
            Ok(Err(e)) => {
                tracing::error!(error = %e, "failed to load subscription for dispatch");
                return;
            }
            Err(e) => {
                tracing::error!(error = %e, "subscription load task panicked");
                return;
            }
        };

        self.deliver(attempt, sub).await;
    }

    /// Single-attempt algorithm — spec §4.4.
    async fn deliver(&self, attempt: DeliveryAttempt, sub: Subscription) {
        let body = match serde_json::to_vec(&attempt.payload) {
            Ok(b) => b,
            Err(e) => {
                tracing::error!(delivery_id = %attempt.id, error = %e, "failed to serialize payload");
                self.finish_failed(&attempt, "payload serialization failed", None)
                    .await;
                return;
            }
        };

        if body.len() > sub.max_payload_bytes as usize {
            tracing::warn!(delivery_id = %attempt.id, size = body.len(), cap = sub.max_payload_bytes, "payload exceeds cap, terminal failure without sending");
            self.finish_failed(&attempt, "payload exceeds max_payload_bytes", None)
                .await;
            return;
        }

        let signature = signing::sign(&sub.secret, &body);
        let started = Instant::now();

        let result = self
            .client
            .post(&sub.url)
            .header("Content-Type", "application/json")
            .header("X-Webhook-Signature", &signature)
            .header("X-Webhook-Event", &attempt.event_type)
            .header("X-Webhook-Delivery", attempt.id.to_string())
            .body(body)
            .send()
            .await;

        let duration_ms = started.elapsed().as_millis() as i32;
        let outcome = classify(result, duration_ms).await;

        self.finish(&attempt, &sub, outcome, duration_ms).await;
    }

    async fn finish(
        &self,
        attempt: &DeliveryAttempt,
        sub: &Subscription,
        outcome: DeliveryOutcome,
        duration_ms: i32,
    ) {
        let db = self.db.clone();
        let id = attempt.id;
        let subscription_id = sub.id;
        let attempts_made = attempt.attempts_made;
        let max_attempts = attempt.max_attempts;
        let retry_enabled = sub.retry_enabled;
        let backoff_base_ms = sub.backoff_base_ms;

        match &outcome {
            DeliveryOutcome::Success { status, .. } => {
                tracing::debug!(delivery_id = %id, status, attempts_made = attempts_made + 1, "delivery succeeded");
                let status = *status as i32;
                let _ = tokio::task::spawn_blocking(move || {
                    outbox::mark_success(&db, id, status, duration_ms)
                })
                .await;
            }
            DeliveryOutcome::RemoteRetriable { status, error } => {
                if attempts_made + 1 < max_attempts && retry_enabled {
                    let delay_ms = backoff_delay_ms(backoff_base_ms, attempts_made);
                    let next_retry_at = Utc::now() + chrono::Duration::milliseconds(delay_ms);
                    tracing::warn!(delivery_id = %id, ?status, error = %error, delay_ms, "retriable failure, scheduling retry");
                    let error = error.clone();
                    let status = *status;
                    let _ = tokio::task::spawn_blocking(move || {
                        outbox::schedule_retry(&db, id, next_retry_at, &error, status.map(|s| s as i32))
                    })
                    .await;
                } else {
                    tracing::error!(delivery_id = %id, ?status, error = %error, "retriable failure but attempts exhausted, marking failed");
                    let error = error.clone();
                    let status = *status;
                    let _ = tokio::task::spawn_blocking(move || {
                        outbox::mark_failed(&db, id, &error, status.map(|s| s as i32))
                    })
                    .await;
                }
            }
            DeliveryOutcome::RemoteTerminal { status, error } => {
                tracing::warn!(delivery_id = %id, ?status, error = %error, "terminal failure, marking failed");
                let error = error.clone();
                let status = *status;
                let _ = tokio::task::spawn_blocking(move || {
                    outbox::mark_failed(&db, id, &error, status.map(|s| s as i32))
                })
                .await;
            }
        }

        let kind = if outcome.is_success() {
            DeliveryOutcomeKind::Success
        } else {
            DeliveryOutcomeKind::Failure
        };
        let status_code = outcome.status_code().map(|s| s as i32).or(Some(-1));
        let db = self.db.clone();
        let _ = tokio::task::spawn_blocking(move || {
            registry::increment_stats(&db, subscription_id, kind, status_code, duration_ms as i64)
        })
        .await;
    }

    async fn finish_failed(&self, attempt: &DeliveryAttempt, error: &str, http_code: Option<i32>) {
        let db = self.db.clone();
        let id = attempt.id;
        let error = error.to_string();
        let _ = tokio::task::spawn_blocking(move || outbox::mark_failed(&db, id, &error, http_code))
            .await;
    }
}

fn load_subscription(db: &DbPool, id: Uuid) -> anyhow::Result<Option<Subscription>> {
    let mut conn = db.get()?;
    let sub = subscriptions::table
        .find(id)
        .first::<Subscription>(&mut conn)
        .optional()?;
    Ok(sub)
}

async fn classify(result: reqwest::Result<reqwest::Response>, duration_ms: i32) -> DeliveryOutcome {
    match result {
        Ok(resp) => {
            let status = resp.status().as_u16();
            if (200..400).contains(&status) {
                DeliveryOutcome::Success { status, duration_ms }
            } else if matches!(status, 408 | 425 | 429) || status >= 500 {
                DeliveryOutcome::RemoteRetriable {
                    status: Some(status),
                    error: format!("HTTP {status}"),
                }
            } else {
                DeliveryOutcome::RemoteTerminal {
                    status: Some(status),
                    error: format!("HTTP {status}"),
                }
            }
        }
        Err(e) => DeliveryOutcome::RemoteRetriable {
            status: None,
            error: e.to_string(),
        },
    }
}

/// `delay = backoff_base_ms * 2^(attempts_made)`, capped at 1 hour, computed
/// in integer arithmetic to avoid drift (spec §5).
fn backoff_delay_ms(backoff_base_ms: i64, attempts_made: i32) -> i64 {
    const ONE_HOUR_MS: i64 = 3_600_000;
    let shift = attempts_made.max(0).min(40) as u32;
    backoff_base_ms
        .saturating_mul(1i64.checked_shl(shift).unwrap_or(i64::MAX).max(1))
        .min(ONE_HOUR_MS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_matches_spec_examples() {
        assert_eq!(backoff_delay_ms(1000, 0), 1000);
        assert_eq!(backoff_delay_ms(1000, 1), 2000);
        assert_eq!(backoff_delay_ms(1000, 2), 4000);
        assert_eq!(backoff_delay_ms(1000, 3), 8000);
    }

    #[test]
    fn backoff_caps_at_one_hour() {
        assert_eq!(backoff_delay_ms(1000, 20), 3_600_000);
    }

    #[tokio::test]
    async fn classify_success_range() {
        // 200..400 is success; can't build a real reqwest::Response without a
        // server, so classification boundaries are exercised with the
        // integer math directly.
        for status in [200u16, 201, 204, 301, 399] {
            assert!((200..400).contains(&status));
        }
        for status in [400u16, 404, 450, 499] {
            assert!(!(200..400).contains(&status));
        }
    }

    #[test]
    fn retriable_status_set_matches_spec() {
        let retriable = |s: u16| matches!(s, 408 | 425 | 429) || s >= 500;
        assert!(retriable(408));
        assert!(retriable(425));
        assert!(retriable(429));
        assert!(retriable(500));
        assert!(retriable(503));
        assert!(!retriable(404));
        assert!(!retriable(400));
    }
}
