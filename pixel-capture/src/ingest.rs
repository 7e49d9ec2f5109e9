use axum::extract::State;
use axum::http::header::{HeaderName, REFERER, USER_AGENT};
use axum::http::HeaderMap;
use axum::Json;
use axum_client_ip::InsecureClientIp;
use bytes::Bytes;
use pixel_common::privacy::{anonymize_addr, UNKNOWN_IP};
use pixel_common::TrackedEvent;
use serde_json::Value;
use tracing::{debug, instrument, warn, Span};

use crate::api::{CaptureError, EventSource, IngestResponse, ProcessedEvent, RequestContext};
use crate::prometheus::{report_dropped_events, report_received_events};
use crate::router;

/// Keep the event unless it belongs to a user who opted out.
pub fn should_persist(event: &TrackedEvent, opted_out: bool) -> bool {
    event.hashed_user_id.is_none() || !opted_out
}

impl RequestContext {
    pub fn from_request(ip: Option<InsecureClientIp>, headers: &HeaderMap) -> Self {
        let header = |name: HeaderName| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        };

        Self {
            ip: ip
                .map(|InsecureClientIp(ip)| anonymize_addr(ip).to_string())
                .unwrap_or_else(|| UNKNOWN_IP.to_string()),
            user_agent: header(USER_AGENT),
            referrer: header(REFERER),
        }
    }
}

/// Splits the body into events, dropping the elements that do not decode.
/// Only the outer shape is mandatory: an object holding an `events` array.
pub fn decode_batch(body: &[u8]) -> Result<Vec<TrackedEvent>, CaptureError> {
    let Value::Object(mut root) = serde_json::from_slice::<Value>(body)? else {
        return Err(CaptureError::MissingEvents);
    };
    let Some(Value::Array(items)) = root.remove("events") else {
        return Err(CaptureError::MissingEvents);
    };

    let received = items.len();
    report_received_events(received as u64);

    let events: Vec<TrackedEvent> = items
        .into_iter()
        .filter_map(|item| match serde_json::from_value(item) {
            Ok(event) => Some(event),
            Err(err) => {
                debug!("dropping invalid event: {}", err);
                None
            }
        })
        .collect();

    let invalid = received - events.len();
    if invalid > 0 {
        report_dropped_events("invalid_event", invalid as u64);
    }

    Ok(events)
}

/// Enrich, filter through the opt-out registry and hand over to the sink.
/// Returns how many events were stored.
pub async fn persist(
    state: &router::State,
    events: Vec<TrackedEvent>,
    source: EventSource,
    context: &RequestContext,
) -> Result<usize, CaptureError> {
    let received_at = state.timesource.current_time();
    let mut processed = Vec::with_capacity(events.len());

    for event in events {
        let opted_out = match &event.hashed_user_id {
            None => false,
            Some(user_id) => match state.registry.has_opted_out(user_id).await {
                Ok(opted_out) => opted_out,
                Err(err) => {
                    // fail closed
                    warn!("opt-out lookup failed, dropping event: {}", err);
                    report_dropped_events("registry_unavailable", 1);
                    continue;
                }
            },
        };

        if !should_persist(&event, opted_out) {
            report_dropped_events("opted_out", 1);
            continue;
        }

        processed.push(ProcessedEvent::new(event, source, context, received_at));
    }

    let stored = processed.len();
    match stored {
        0 => {}
        1 => state.sink.send(processed.remove(0)).await?,
        _ => state.sink.send_batch(processed).await?,
    }

    Ok(stored)
}

async fn ingest(
    state: router::State,
    ip: Option<InsecureClientIp>,
    headers: HeaderMap,
    body: Bytes,
    source: EventSource,
) -> Result<Json<IngestResponse>, CaptureError> {
    let events = decode_batch(&body)?;
    Span::current().record("batch_size", events.len());

    let context = RequestContext::from_request(ip, &headers);
    let stored = persist(&state, events, source, &context).await?;
    debug!("stored {} events", stored);

    // Same answer whether or not events were dropped for opt-out
    Ok(Json(IngestResponse::ok()))
}

#[instrument(skip_all, fields(batch_size))]
pub async fn track(
    State(state): State<router::State>,
    ip: Option<InsecureClientIp>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<IngestResponse>, CaptureError> {
    ingest(state, ip, headers, body, EventSource::Api).await
}

#[instrument(skip_all, fields(batch_size))]
pub async fn track_pixel(
    State(state): State<router::State>,
    ip: Option<InsecureClientIp>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<IngestResponse>, CaptureError> {
    ingest(state, ip, headers, body, EventSource::Pixel).await
}
