use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use pixel_common::TrackedEvent;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

/// Body of every JSON answer: `{"success":true}` or `{"success":false,"error":...}`.
#[derive(Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct IngestResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IngestResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }
}

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("failed to parse request: {0}")]
    RequestParsingError(#[from] serde_json::Error),
    #[error("request body must be an object with an events array")]
    MissingEvents,
    #[error("userId is required")]
    MissingUserId,
    #[error("invalid time range: {0}")]
    InvalidTimeRange(String),

    #[error("opt-out registry unavailable")]
    RegistryUnavailable,

    #[error("transient error, please retry")]
    RetryableSinkError,
    #[error("invalid event could not be processed")]
    NonRetryableSinkError,
}

impl IntoResponse for CaptureError {
    fn into_response(self) -> Response {
        let status = match self {
            CaptureError::RequestParsingError(_)
            | CaptureError::MissingEvents
            | CaptureError::MissingUserId
            | CaptureError::InvalidTimeRange(_)
            | CaptureError::NonRetryableSinkError => StatusCode::BAD_REQUEST,

            CaptureError::RegistryUnavailable | CaptureError::RetryableSinkError => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        };

        (
            status,
            Json(IngestResponse {
                success: false,
                error: Some(self.to_string()),
            }),
        )
            .into_response()
    }
}

/// Which door the event came through.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Api,
    Pixel,
}

/// Server-observed context taken from the request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    /// Already anonymized
    pub ip: String,
    pub user_agent: Option<String>,
    pub referrer: Option<String>,
}

/// A client event plus what the server saw when it arrived.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct ProcessedEvent {
    pub uuid: Uuid,
    pub source: EventSource,
    pub event: TrackedEvent,
    pub ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referrer: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub received_at: OffsetDateTime,
}

impl ProcessedEvent {
    pub fn new(
        event: TrackedEvent,
        source: EventSource,
        context: &RequestContext,
        received_at: OffsetDateTime,
    ) -> Self {
        Self {
            uuid: Uuid::now_v7(),
            source,
            event,
            ip: context.ip.clone(),
            user_agent: context.user_agent.clone(),
            referrer: context.referrer.clone(),
            received_at,
        }
    }

    pub fn received_at_ms(&self) -> i64 {
        pixel_common::event::to_millis(self.received_at)
    }
}
