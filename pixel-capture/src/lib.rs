pub mod api;
pub mod config;
pub mod ingest;
pub mod optout;
pub mod pixel;
pub mod prometheus;
pub mod router;
pub mod server;
pub mod sinks;
pub mod stats;
pub mod time;
