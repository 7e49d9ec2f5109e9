use async_trait::async_trait;
use sqlx::sqlite::SqliteArguments;
use sqlx::{Pool, Sqlite};
use tracing::{error, info, instrument, warn};

use crate::api::{CaptureError, ProcessedEvent};
use crate::prometheus::report_ingested_events;
use crate::sinks::Event;

#[derive(sqlx::FromRow)]
struct PayloadRow {
    payload: String,
}

struct EventRow {
    uuid: String,
    event_type: &'static str,
    session_id: String,
    received_at_ms: i64,
    payload: String,
}

impl EventRow {
    fn from_event(event: &ProcessedEvent) -> Result<Self, CaptureError> {
        let payload = serde_json::to_string(event).map_err(|e| {
            error!("Failed to serialize event: {}", e);
            CaptureError::NonRetryableSinkError
        })?;

        Ok(Self {
            uuid: event.uuid.to_string(),
            event_type: event.event.event_type.as_str(),
            session_id: event.event.session_id.to_string(),
            received_at_ms: event.received_at_ms(),
            payload,
        })
    }

    fn insert(&self) -> sqlx::query::Query<'_, Sqlite, SqliteArguments<'_>> {
        sqlx::query(
            r#"
            INSERT INTO tracked_events (uuid, event_type, session_id, received_at_ms, payload)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(self.uuid.as_str())
        .bind(self.event_type)
        .bind(self.session_id.as_str())
        .bind(self.received_at_ms)
        .bind(self.payload.as_str())
    }
}

/// Durable event storage in the `tracked_events` table.
pub struct SqliteSink {
    pool: Pool<Sqlite>,
}

impl SqliteSink {
    pub async fn new(pool: Pool<Sqlite>) -> anyhow::Result<SqliteSink> {
        info!("Initializing SQLite event sink");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tracked_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                uuid TEXT NOT NULL,
                event_type TEXT NOT NULL,
                session_id TEXT NOT NULL,
                received_at_ms INTEGER NOT NULL,
                payload TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS tracked_events_received_at ON tracked_events (received_at_ms)",
        )
        .execute(&pool)
        .await?;

        Ok(SqliteSink { pool })
    }
}

fn retryable(e: sqlx::Error) -> CaptureError {
    error!("SQLite event sink failure: {}", e);
    CaptureError::RetryableSinkError
}

#[async_trait]
impl Event for SqliteSink {
    #[instrument(skip_all)]
    async fn send(&self, event: ProcessedEvent) -> Result<(), CaptureError> {
        let row = EventRow::from_event(&event)?;
        row.insert().execute(&self.pool).await.map_err(retryable)?;

        report_ingested_events(1);
        Ok(())
    }

    /// All or nothing: the batch is written in a single transaction.
    #[instrument(skip_all, fields(events = events.len()))]
    async fn send_batch(&self, events: Vec<ProcessedEvent>) -> Result<(), CaptureError> {
        let rows = events
            .iter()
            .map(EventRow::from_event)
            .collect::<Result<Vec<_>, _>>()?;

        let mut tx = self.pool.begin().await.map_err(retryable)?;
        for row in &rows {
            row.insert().execute(&mut *tx).await.map_err(retryable)?;
        }
        tx.commit().await.map_err(retryable)?;

        report_ingested_events(rows.len());
        Ok(())
    }

    async fn events_between(
        &self,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<ProcessedEvent>, CaptureError> {
        let rows = sqlx::query_as::<_, PayloadRow>(
            r#"
            SELECT payload
            FROM tracked_events
            WHERE received_at_ms BETWEEN ? AND ?
            ORDER BY id ASC
            "#,
        )
        .bind(start_ms)
        .bind(end_ms)
        .fetch_all(&self.pool)
        .await
        .map_err(retryable)?;

        Ok(rows
            .into_iter()
            .filter_map(|row| match serde_json::from_str(&row.payload) {
                Ok(event) => Some(event),
                Err(e) => {
                    warn!("Skipping unreadable stored event: {}", e);
                    None
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use pixel_common::{EventType, TrackedEvent};
    use time::macros::datetime;
    use uuid::Uuid;

    use super::*;
    use crate::api::{EventSource, RequestContext};
    use crate::server::connect_sqlite;

    fn event_at(received_at: time::OffsetDateTime) -> ProcessedEvent {
        ProcessedEvent::new(
            TrackedEvent {
                pixel_id: Uuid::new_v4(),
                session_id: Uuid::new_v4(),
                event_type: EventType::PageView,
                current_url: "https://neuvera.ai/".to_string(),
                referrer_url: None,
                hashed_user_id: None,
                metadata: None,
                timestamp: 0,
            },
            EventSource::Api,
            &RequestContext {
                ip: "10.0.0.0".to_string(),
                ..Default::default()
            },
            received_at,
        )
    }

    async fn setup_test_sink() -> (SqliteSink, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("events.db").display());
        let pool = connect_sqlite(&url).await.expect("failed to open database");
        let sink = SqliteSink::new(pool)
            .await
            .expect("Failed to create SQLite sink");

        (sink, dir)
    }

    #[tokio::test]
    async fn stores_and_reads_back_a_window() {
        let (sink, _dir) = setup_test_sink().await;

        let early = event_at(datetime!(2024-01-01 00:00 UTC));
        let late = event_at(datetime!(2024-01-03 00:00 UTC));
        sink.send(early.clone()).await.unwrap();
        sink.send_batch(vec![late.clone(), late.clone()])
            .await
            .unwrap();

        let all = sink.events_between(0, i64::MAX).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0], early);

        let window = sink
            .events_between(late.received_at_ms(), late.received_at_ms())
            .await
            .unwrap();
        assert_eq!(window, vec![late.clone(), late]);
    }
}
