pub mod batcher;
pub mod config;
pub mod identity;
pub mod network;
pub mod privacy;
pub mod storage;
pub mod tracker;
pub mod transport;

pub use config::TrackerConfig;
pub use tracker::{Tracker, TrackerDeps};
