use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A SendGrid event as stored in the `sendgrid_webhook_events` table.
#[derive(sqlx::FromRow, Debug)]
pub struct WebhookEvent {
    /// A unique id identifying a stored event.
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// When SendGrid says the event happened.
    pub timestamp: Option<DateTime<Utc>>,
    pub email: String,
    pub event: String,
    /// SendGrid's unique id for the event. Deduplication key.
    pub sg_event_id: String,
    pub sg_message_id: Option<String>,
    /// The event object as received.
    pub payload: sqlx::types::Json<Value>,
    pub categories: Option<sqlx::types::Json<Vec<String>>>,
}

/// A new event to be inserted by the `EventStore`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewWebhookEvent {
    pub timestamp: Option<DateTime<Utc>>,
    pub email: String,
    pub event: String,
    pub sg_event_id: String,
    pub sg_message_id: Option<String>,
    pub payload: sqlx::types::Json<Value>,
    pub categories: Option<sqlx::types::Json<Vec<String>>>,
}

/// Event types documented by SendGrid's Event Webhook.
/// Only used to keep metric labels bounded; the stored `event` column keeps whatever was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Processed,
    Dropped,
    Delivered,
    Deferred,
    Bounce,
    Open,
    Click,
    #[serde(rename = "spamreport")]
    SpamReport,
    Unsubscribe,
    GroupUnsubscribe,
    GroupResubscribe,
    Other,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Processed => "processed",
            EventType::Dropped => "dropped",
            EventType::Delivered => "delivered",
            EventType::Deferred => "deferred",
            EventType::Bounce => "bounce",
            EventType::Open => "open",
            EventType::Click => "click",
            EventType::SpamReport => "spamreport",
            EventType::Unsubscribe => "unsubscribe",
            EventType::GroupUnsubscribe => "group_unsubscribe",
            EventType::GroupResubscribe => "group_resubscribe",
            EventType::Other => "other",
        }
    }
}

/// Unknown event types map to `EventType::Other`, so parsing never fails.
impl FromStr for EventType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "processed" => EventType::Processed,
            "dropped" => EventType::Dropped,
            "delivered" => EventType::Delivered,
            "deferred" => EventType::Deferred,
            "bounce" => EventType::Bounce,
            "open" => EventType::Open,
            "click" => EventType::Click,
            "spamreport" => EventType::SpamReport,
            "unsubscribe" => EventType::Unsubscribe,
            "group_unsubscribe" => EventType::GroupUnsubscribe,
            "group_resubscribe" => EventType::GroupResubscribe,
            _ => EventType::Other,
        })
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
