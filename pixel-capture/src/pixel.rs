use axum::extract::{RawQuery, State};
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum_client_ip::InsecureClientIp;
use pixel_common::event::to_millis;
use pixel_common::{EventType, TrackedEvent};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::api::{EventSource, RequestContext};
use crate::ingest::persist;
use crate::router;

/// Transparent 1x1 GIF89a.
pub const PIXEL_GIF: [u8; 43] = [
    0x47, 0x49, 0x46, 0x38, 0x39, 0x61, 0x01, 0x00, 0x01, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00,
    0x00, 0xff, 0xff, 0xff, 0x21, 0xf9, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00, 0x2c, 0x00, 0x00,
    0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x02, 0x02, 0x44, 0x01, 0x00, 0x3b,
];

#[derive(Debug, Default, Deserialize)]
pub struct PixelQuery {
    pub pid: Option<String>,
    pub event: Option<String>,
    pub url: Option<String>,
    #[serde(rename = "ref")]
    pub referrer: Option<String>,
    pub sid: Option<String>,
}

impl PixelQuery {
    /// Needs both identifiers. Unknown event names are kept as `custom`.
    fn into_event(self, timestamp: i64) -> Option<TrackedEvent> {
        let pixel_id = Uuid::parse_str(self.pid.as_deref()?).ok()?;
        let session_id = Uuid::parse_str(self.sid.as_deref()?).ok()?;

        let mut metadata = Map::new();
        let event_type = match self.event.as_deref() {
            None | Some("") => EventType::PageView,
            Some(name) => name.parse::<EventType>().unwrap_or_else(|_| {
                metadata.insert("name".to_string(), Value::from(name));
                EventType::Custom
            }),
        };

        Some(TrackedEvent {
            pixel_id,
            session_id,
            event_type,
            current_url: self.url.unwrap_or_default(),
            referrer_url: self.referrer.filter(|r| !r.is_empty()),
            hashed_user_id: None,
            metadata: (!metadata.is_empty()).then_some(metadata),
            timestamp,
        })
    }
}

fn gif() -> impl IntoResponse {
    (
        [(CONTENT_TYPE, "image/gif"), (CACHE_CONTROL, "no-store")],
        PIXEL_GIF.as_slice(),
    )
}

/// Image fallback for hosts that can only load a URL. Whatever the query,
/// the answer is the GIF: recording is best effort.
#[instrument(skip_all)]
pub async fn pixel_gif(
    State(state): State<router::State>,
    ip: Option<InsecureClientIp>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
) -> impl IntoResponse {
    let query: PixelQuery = match serde_urlencoded::from_str(query.as_deref().unwrap_or_default())
    {
        Ok(query) => query,
        Err(err) => {
            debug!("unreadable pixel query: {}", err);
            return gif();
        }
    };

    let timestamp = to_millis(state.timesource.current_time());
    let Some(event) = query.into_event(timestamp) else {
        debug!("pixel hit without valid identifiers");
        return gif();
    };

    let context = RequestContext::from_request(ip, &headers);
    if let Err(err) = persist(&state, vec![event], EventSource::Pixel, &context).await {
        debug!("failed to record pixel event: {}", err);
    }

    gif()
}
