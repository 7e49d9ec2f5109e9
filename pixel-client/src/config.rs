use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::privacy::ConsentPolicy;

/// Single configuration surface for the tracker.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Full URL of the ingest endpoint
    pub endpoint: String,
    pub opt_out_endpoint: String,
    pub opt_in_endpoint: String,
    pub flush_interval: Duration,
    /// Queue length that triggers an immediate flush
    pub max_queue_size: usize,
    /// Delivery attempts per event, the first send included
    pub max_attempts: u32,
    pub beacon_max_bytes: usize,
    pub beacon_capacity: usize,
    pub request_timeout: Duration,
    pub consent_policy: ConsentPolicy,
    pub anonymize_user_id: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:3000/api/track".to_string(),
            opt_out_endpoint: "http://127.0.0.1:3000/api/privacy/opt-out".to_string(),
            opt_in_endpoint: "http://127.0.0.1:3000/api/privacy/opt-in".to_string(),
            flush_interval: Duration::from_secs(5),
            max_queue_size: 10,
            max_attempts: 2,
            beacon_max_bytes: 64 * 1024,
            beacon_capacity: 32,
            request_timeout: Duration::from_secs(10),
            consent_policy: ConsentPolicy::NotRequired,
            anonymize_user_id: true,
        }
    }
}

impl TrackerConfig {
    pub fn with_endpoint(base_url: &str) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            endpoint: format!("{base}/api/track"),
            opt_out_endpoint: format!("{base}/api/privacy/opt-out"),
            opt_in_endpoint: format!("{base}/api/privacy/opt-in"),
            ..Default::default()
        }
    }
}
