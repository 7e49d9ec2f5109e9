use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;
use uuid::Uuid;

/// Kinds of interaction the pixel records. Serialized in snake_case on the wire.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    PageView,
    Click,
    FormSubmit,
    ChatInteraction,
    ButtonClick,
    Engagement,
    Custom,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::PageView => "page_view",
            EventType::Click => "click",
            EventType::FormSubmit => "form_submit",
            EventType::ChatInteraction => "chat_interaction",
            EventType::ButtonClick => "button_click",
            EventType::Engagement => "engagement",
            EventType::Custom => "custom",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_ref() {
            "page_view" | "pageview" => Ok(EventType::PageView),
            "click" => Ok(EventType::Click),
            "form_submit" => Ok(EventType::FormSubmit),
            "chat_interaction" => Ok(EventType::ChatInteraction),
            "button_click" => Ok(EventType::ButtonClick),
            "engagement" | "user_engagement" => Ok(EventType::Engagement),
            "custom" => Ok(EventType::Custom),
            _ => Err(format!("Unknown event type: {s}")),
        }
    }
}

/// A single recorded interaction. Built once by the client, never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedEvent {
    pub pixel_id: Uuid,
    pub session_id: Uuid,
    pub event_type: EventType,
    pub current_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referrer_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hashed_user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
    /// Client clock, unix milliseconds
    pub timestamp: i64,
}

impl TrackedEvent {
    pub fn metadata_value(&self, key: &str) -> Option<&Value> {
        self.metadata.as_ref().and_then(|m| m.get(key))
    }
}

/// Wire body of the ingest endpoint.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct EventBatch {
    pub events: Vec<TrackedEvent>,
}

impl EventBatch {
    pub fn new(events: Vec<TrackedEvent>) -> Self {
        Self { events }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

pub fn now_millis() -> i64 {
    to_millis(OffsetDateTime::now_utc())
}

pub fn to_millis(time: OffsetDateTime) -> i64 {
    (time.unix_timestamp_nanos() / 1_000_000) as i64
}
