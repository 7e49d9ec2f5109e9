pub mod event;
pub mod privacy;
pub mod sanitize;

pub use event::{EventBatch, EventType, TrackedEvent};
