use std::collections::{BTreeMap, HashMap, HashSet};

use axum::extract::{Query, State};
use axum::Json;
use pixel_common::event::to_millis;
use pixel_common::EventType;
use serde::{Deserialize, Serialize};
use tracing::instrument;
use url::Url;

use crate::api::{CaptureError, ProcessedEvent};
use crate::router;

const DEFAULT_WINDOW_MS: i64 = 7 * 24 * 60 * 60 * 1000;
const POPULAR_PAGES: usize = 10;

#[derive(Debug, Default, Deserialize)]
pub struct StatsQuery {
    /// Unix milliseconds
    pub start: Option<i64>,
    pub end: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageCount {
    pub path: String,
    pub views: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Engagement {
    pub unique_sessions: usize,
    pub chat_interactions: usize,
    pub avg_interactions_per_session: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: i64,
    pub end: i64,
}

/// Aggregates only: nothing in here points back at an individual.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSummary {
    pub total_events: usize,
    pub event_types: BTreeMap<String, usize>,
    pub popular_pages: Vec<PageCount>,
    pub engagement: Engagement,
    pub time_range: TimeRange,
}

fn page_path(url: &str) -> String {
    match Url::parse(url) {
        Ok(parsed) => parsed.path().to_string(),
        // relative urls are already paths, minus query and fragment
        Err(_) => url
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .to_string(),
    }
}

pub fn summarize(events: &[ProcessedEvent], time_range: TimeRange) -> StatsSummary {
    let mut event_types = BTreeMap::new();
    let mut pages: HashMap<String, usize> = HashMap::new();
    let mut sessions = HashSet::new();
    let mut chat_interactions = 0;

    for processed in events {
        let event = &processed.event;
        *event_types
            .entry(event.event_type.as_str().to_string())
            .or_insert(0) += 1;
        sessions.insert(event.session_id);

        match event.event_type {
            EventType::PageView => {
                let path = page_path(&event.current_url);
                if !path.is_empty() {
                    *pages.entry(path).or_insert(0) += 1;
                }
            }
            EventType::ChatInteraction => chat_interactions += 1,
            _ => {}
        }
    }

    let mut popular_pages: Vec<PageCount> = pages
        .into_iter()
        .map(|(path, views)| PageCount { path, views })
        .collect();
    // ties broken by path so the answer is stable
    popular_pages.sort_by(|a, b| b.views.cmp(&a.views).then_with(|| a.path.cmp(&b.path)));
    popular_pages.truncate(POPULAR_PAGES);

    let unique_sessions = sessions.len();
    let avg_interactions_per_session = if unique_sessions > 0 {
        chat_interactions as f64 / unique_sessions as f64
    } else {
        0.0
    };

    StatsSummary {
        total_events: events.len(),
        event_types,
        popular_pages,
        engagement: Engagement {
            unique_sessions,
            chat_interactions,
            avg_interactions_per_session,
        },
        time_range,
    }
}

#[instrument(skip_all)]
pub async fn stats(
    State(state): State<router::State>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<StatsSummary>, CaptureError> {
    let end = query
        .end
        .unwrap_or_else(|| to_millis(state.timesource.current_time()));
    let start = match query.start {
        Some(start) => start,
        None => end.checked_sub(DEFAULT_WINDOW_MS).ok_or_else(|| {
            CaptureError::InvalidTimeRange(format!("end {end} leaves no room for a default window"))
        })?,
    };
    if start > end {
        return Err(CaptureError::InvalidTimeRange(format!(
            "start {start} is after end {end}"
        )));
    }

    let events = state.sink.events_between(start, end).await?;
    Ok(Json(summarize(&events, TimeRange { start, end })))
}
