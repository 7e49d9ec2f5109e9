#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::response::Response;
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use time::macros::datetime;
use time::OffsetDateTime;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tower::ServiceExt;
use tracing::Level;
use uuid::Uuid;

use pixel_capture::api::{CaptureError, ProcessedEvent};
use pixel_capture::config::Config;
use pixel_capture::optout::{MemoryOptOutRegistry, OptOutRegistry, RegistryError};
use pixel_capture::router::{router, RouterOptions};
use pixel_capture::server::serve;
use pixel_capture::sinks::memory::MemorySink;
use pixel_capture::sinks::Event;
use pixel_capture::time::FixedTime;

pub const NOW: OffsetDateTime = datetime!(2024-05-01 12:00 UTC);

pub fn now_ms() -> i64 {
    pixel_common::event::to_millis(NOW)
}

/// In-process router over memory-backed storage.
pub struct TestApp {
    pub router: Router,
    pub sink: MemorySink,
    pub registry: Arc<MemoryOptOutRegistry>,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_options(RouterOptions::default())
    }

    pub fn with_options(options: RouterOptions) -> Self {
        let sink = MemorySink::new();
        let registry = Arc::new(MemoryOptOutRegistry::new());
        let router = router(
            FixedTime { time: NOW },
            Arc::new(sink.clone()),
            registry.clone(),
            options,
        );

        Self {
            router,
            sink,
            registry,
        }
    }

    pub async fn send(&self, request: Request<Body>) -> Response {
        self.router.clone().oneshot(request).await.unwrap()
    }

    pub async fn post(&self, uri: &str, body: impl Into<Body>) -> (StatusCode, Value) {
        let response = self
            .send(
                Request::builder()
                    .method(Method::POST)
                    .uri(uri)
                    .header(header::CONTENT_TYPE, "application/json")
                    .header("x-forwarded-for", "203.0.113.9")
                    .header(header::USER_AGENT, "pixel-tests/1.0")
                    .header(header::REFERER, "https://neuvera.ai/chat")
                    .body(body.into())
                    .unwrap(),
            )
            .await;

        let status = response.status();
        (status, body_json(response).await)
    }

    pub async fn get(&self, uri: &str) -> Response {
        self.send(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
    }
}

/// Router over caller-provided sink and registry, for failure injection.
pub fn app_with(
    sink: Arc<dyn Event + Send + Sync>,
    registry: Arc<dyn OptOutRegistry + Send + Sync>,
) -> Router {
    router(FixedTime { time: NOW }, sink, registry, RouterOptions::default())
}

pub async fn body_bytes(response: Response) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .unwrap()
        .to_bytes()
        .to_vec()
}

pub async fn body_json(response: Response) -> Value {
    let bytes = body_bytes(response).await;
    serde_json::from_slice(&bytes).unwrap_or(Value::Null)
}

pub fn event_json(event_type: &str, url: &str, hashed_user_id: Option<&str>) -> Value {
    let mut event = json!({
        "pixelId": Uuid::new_v4(),
        "sessionId": Uuid::new_v4(),
        "eventType": event_type,
        "currentUrl": url,
        "timestamp": now_ms(),
    });
    if let Some(user) = hashed_user_id {
        event["hashedUserId"] = json!(user);
    }
    event
}

pub fn batch(events: Vec<Value>) -> String {
    json!({ "events": events }).to_string()
}

pub struct FailingSink {
    pub retryable: bool,
}

impl FailingSink {
    fn error(&self) -> CaptureError {
        if self.retryable {
            CaptureError::RetryableSinkError
        } else {
            CaptureError::NonRetryableSinkError
        }
    }
}

#[async_trait]
impl Event for FailingSink {
    async fn send(&self, _event: ProcessedEvent) -> Result<(), CaptureError> {
        Err(self.error())
    }

    async fn send_batch(&self, _events: Vec<ProcessedEvent>) -> Result<(), CaptureError> {
        Err(self.error())
    }

    async fn events_between(
        &self,
        _start_ms: i64,
        _end_ms: i64,
    ) -> Result<Vec<ProcessedEvent>, CaptureError> {
        Err(self.error())
    }
}

pub struct BrokenRegistry;

#[async_trait]
impl OptOutRegistry for BrokenRegistry {
    async fn opt_out(&self, _hashed_user_id: &str) -> Result<(), RegistryError> {
        Err(RegistryError::Database(sqlx::Error::PoolClosed))
    }

    async fn opt_in(&self, _hashed_user_id: &str) -> Result<(), RegistryError> {
        Err(RegistryError::Database(sqlx::Error::PoolClosed))
    }

    async fn has_opted_out(&self, _hashed_user_id: &str) -> Result<bool, RegistryError> {
        Err(RegistryError::Database(sqlx::Error::PoolClosed))
    }
}

pub fn test_config(database: &Path) -> Config {
    Config {
        print_sink: false,
        address: SocketAddr::from_str("127.0.0.1:0").unwrap(),
        database_url: format!("sqlite://{}?mode=rwc", database.display()),
        otel_url: None,
        otel_sampling_rate: 0.0,
        otel_service_name: "pixel-capture-testing".to_string(),
        export_prometheus: false,
        log_level: Level::INFO,
        max_body_bytes: 1024 * 1024,
        concurrency_limit: None,
    }
}

/// A real server on an ephemeral port, stopped on drop.
pub struct ServerHandle {
    pub addr: SocketAddr,
    shutdown: Arc<Notify>,
    client: reqwest::Client,
}

impl ServerHandle {
    pub async fn for_config(config: Config) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0".parse::<SocketAddr>().unwrap())
            .await
            .unwrap();
        let addr = listener.local_addr().expect("could not get local address");
        let notify = Arc::new(Notify::new());
        let shutdown = notify.clone();

        tokio::spawn(async move {
            serve(config, listener, async move { notify.notified().await })
                .await
                .expect("server failed")
        });

        Self {
            addr,
            shutdown,
            client: reqwest::Client::new(),
        }
    }

    pub async fn post(&self, path: &str, body: String) -> reqwest::Response {
        // the database is opened asynchronously after spawn, retry until it answers
        for _ in 0..50 {
            let result = self
                .client
                .post(format!("http://{}{}", self.addr, path))
                .header("content-type", "application/json")
                .body(body.clone())
                .send()
                .await;
            if let Ok(response) = result {
                return response;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        panic!("server at {} never answered", self.addr);
    }

    pub async fn get(&self, path: &str) -> reqwest::Response {
        self.client
            .get(format!("http://{}{}", self.addr, path))
            .send()
            .await
            .expect("failed to send request")
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown.notify_one()
    }
}
