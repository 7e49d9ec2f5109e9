use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::api::{CaptureError, ProcessedEvent};
use crate::prometheus::report_ingested_events;
use crate::sinks::Event;

/// Keeps everything in memory. Clones share the same storage, so a test can
/// hand one to the router and inspect the other.
#[derive(Clone, Default)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<ProcessedEvent>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ProcessedEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn events(&self) -> Vec<ProcessedEvent> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[async_trait]
impl Event for MemorySink {
    async fn send(&self, event: ProcessedEvent) -> Result<(), CaptureError> {
        self.lock().push(event);
        report_ingested_events(1);
        Ok(())
    }

    async fn send_batch(&self, events: Vec<ProcessedEvent>) -> Result<(), CaptureError> {
        report_ingested_events(events.len());
        self.lock().extend(events);
        Ok(())
    }

    async fn events_between(
        &self,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<ProcessedEvent>, CaptureError> {
        Ok(self
            .lock()
            .iter()
            .filter(|event| (start_ms..=end_ms).contains(&event.received_at_ms()))
            .cloned()
            .collect())
    }
}
