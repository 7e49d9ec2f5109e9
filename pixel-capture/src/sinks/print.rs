use async_trait::async_trait;
use tracing::info;

use crate::api::{CaptureError, ProcessedEvent};
use crate::prometheus::report_ingested_events;
use crate::sinks::Event;

pub struct PrintSink {}

#[async_trait]
impl Event for PrintSink {
    async fn send(&self, event: ProcessedEvent) -> Result<(), CaptureError> {
        info!("single event: {:?}", event);
        report_ingested_events(1);

        Ok(())
    }

    async fn send_batch(&self, events: Vec<ProcessedEvent>) -> Result<(), CaptureError> {
        let span = tracing::span!(tracing::Level::INFO, "batch of events");
        let _enter = span.enter();

        report_ingested_events(events.len());
        for event in events {
            info!("event: {event:?}");
        }

        Ok(())
    }

    async fn events_between(
        &self,
        _start_ms: i64,
        _end_ms: i64,
    ) -> Result<Vec<ProcessedEvent>, CaptureError> {
        Ok(Vec::new())
    }
}
