use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::schema::{delivery_attempts, subscriptions};

/// The event types an SMS lifecycle producer can emit. A subscription's
/// `event_mask` is a subset of these, stored as a `TEXT[]` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    #[serde(rename = "sms.sent")]
    SmsSent,
    #[serde(rename = "sms.delivered")]
    SmsDelivered,
    #[serde(rename = "sms.failed")]
    SmsFailed,
    #[serde(rename = "sms.bounced")]
    SmsBounced,
    #[serde(rename = "sms.read")]
    SmsRead,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SmsSent => "sms.sent",
            Self::SmsDelivered => "sms.delivered",
            Self::SmsFailed => "sms.failed",
            Self::SmsBounced => "sms.bounced",
            Self::SmsRead => "sms.read",
        }
    }

    pub fn all() -> &'static [EventType] {
        &[
            Self::SmsSent,
            Self::SmsDelivered,
            Self::SmsFailed,
            Self::SmsBounced,
            Self::SmsRead,
        ]
    }
}

impl std::str::FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sms.sent" => Ok(Self::SmsSent),
            "sms.delivered" => Ok(Self::SmsDelivered),
            "sms.failed" => Ok(Self::SmsFailed),
            "sms.bounced" => Ok(Self::SmsBounced),
            "sms.read" => Ok(Self::SmsRead),
            other => Err(format!("unknown event type: {other}")),
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Status of a `DeliveryAttempt`, stored as text to keep the migration
/// story simple (no Postgres enum type to alter later).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    InFlight,
    Success,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

impl std::str::FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_flight" => Ok(Self::InFlight),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown delivery status: {other}")),
        }
    }
}

/// Coarse outcome fed to `increment_stats` — the two buckets the subscription's
/// counters distinguish, independent of the richer retry/terminal classification
/// the dispatcher uses internally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcomeKind {
    Success,
    Failure,
}

#[derive(Debug, Clone, Queryable, Identifiable, Serialize)]
#[diesel(table_name = subscriptions)]
pub struct Subscription {
    pub id: Uuid,
    pub tenant_id: String,
    pub url: String,
    pub name: String,
    pub description: Option<String>,
    pub event_mask: Vec<String>,
    #[serde(skip_serializing)]
    pub secret: String,
    pub active: bool,
    pub retry_enabled: bool,
    pub max_attempts: i32,
    pub backoff_base_ms: i64,
    pub max_payload_bytes: i32,
    pub notify_on_failure: bool,
    pub total_calls: i64,
    pub success_calls: i64,
    pub failure_calls: i64,
    pub last_call_at: Option<DateTime<Utc>>,
    pub last_status_code: Option<i32>,
    pub avg_response_ms: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// `Subscription` serialized with `secret` included — used only by
    /// `Create`, `Get`, and `RotateSecret` responses (§3 invariant: the
    /// secret is never returned from `List`).
    pub fn with_secret(&self) -> SubscriptionWithSecret {
        SubscriptionWithSecret {
            id: self.id,
            tenant_id: self.tenant_id.clone(),
            url: self.url.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            event_mask: self.event_mask.clone(),
            secret: self.secret.clone(),
            active: self.active,
            retry_enabled: self.retry_enabled,
            max_attempts: self.max_attempts,
            backoff_base_ms: self.backoff_base_ms,
            max_payload_bytes: self.max_payload_bytes,
            notify_on_failure: self.notify_on_failure,
            total_calls: self.total_calls,
            success_calls: self.success_calls,
            failure_calls: self.failure_calls,
            last_call_at: self.last_call_at,
            last_status_code: self.last_status_code,
            avg_response_ms: self.avg_response_ms,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionWithSecret {
    pub id: Uuid,
    pub tenant_id: String,
    pub url: String,
    pub name: String,
    pub description: Option<String>,
    pub event_mask: Vec<String>,
    pub secret: String,
    pub active: bool,
    pub retry_enabled: bool,
    pub max_attempts: i32,
    pub backoff_base_ms: i64,
    pub max_payload_bytes: i32,
    pub notify_on_failure: bool,
    pub total_calls: i64,
    pub success_calls: i64,
    pub failure_calls: i64,
    pub last_call_at: Option<DateTime<Utc>>,
    pub last_status_code: Option<i32>,
    pub avg_response_ms: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = subscriptions)]
pub struct NewSubscription {
    pub id: Uuid,
    pub tenant_id: String,
    pub url: String,
    pub name: String,
    pub description: Option<String>,
    pub event_mask: Vec<String>,
    pub secret: String,
    pub active: bool,
    pub retry_enabled: bool,
    pub max_attempts: i32,
    pub backoff_base_ms: i64,
    pub max_payload_bytes: i32,
    pub notify_on_failure: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Serialize)]
#[diesel(table_name = delivery_attempts)]
pub struct DeliveryAttempt {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub tenant_id: String,
    pub source_event_id: Option<Uuid>,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub attempts_made: i32,
    pub max_attempts: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_http_code: Option<i32>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub signature: Option<String>,
    pub request_duration_ms: Option<i32>,
}

impl DeliveryAttempt {
    pub fn status(&self) -> DeliveryStatus {
        self.status
            .parse()
            .expect("status column holds only values written by this engine")
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = delivery_attempts)]
pub struct NewDeliveryAttempt {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub tenant_id: String,
    pub source_event_id: Option<Uuid>,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub attempts_made: i32,
    pub max_attempts: i32,
    pub created_at: DateTime<Utc>,
}
