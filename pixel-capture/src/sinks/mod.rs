use async_trait::async_trait;

use crate::api::{CaptureError, ProcessedEvent};

pub mod memory;
pub mod print;
pub mod sqlite;

#[async_trait]
pub trait Event {
    async fn send(&self, event: ProcessedEvent) -> Result<(), CaptureError>;
    async fn send_batch(&self, events: Vec<ProcessedEvent>) -> Result<(), CaptureError>;

    /// Stored events received within `[start_ms, end_ms]`, oldest first.
    /// Sinks that retain nothing answer with an empty window.
    async fn events_between(
        &self,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<ProcessedEvent>, CaptureError>;
}
