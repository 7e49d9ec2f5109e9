use async_trait::async_trait;
use bytes::Bytes;
use pixel_common::EventBatch;
use reqwest::header::{CONNECTION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde_json::json;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, instrument};

use crate::config::TrackerConfig;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("failed to encode batch: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("batch rejected by server with status {0}")]
    Rejected(u16),
    #[error("server unavailable, status {0}")]
    Unavailable(u16),
}

impl TransportError {
    /// Rejections and encoding failures would fail the same way again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::Request(_) | TransportError::Unavailable(_)
        )
    }
}

#[async_trait]
pub trait Transport {
    async fn send(&self, batch: &EventBatch) -> Result<(), TransportError>;

    async fn notify_opt_out(&self, _hashed_user_id: &str) -> Result<(), TransportError> {
        Ok(())
    }

    async fn notify_opt_in(&self, _hashed_user_id: &str) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Fire-and-forget delivery: bodies handed over are posted by a background
/// task that keeps running after the caller is gone. Acceptance is answered
/// synchronously, delivery failures are only logged.
pub struct Beacon {
    sender: mpsc::Sender<Bytes>,
    max_bytes: usize,
}

impl Beacon {
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        client: reqwest::Client,
        endpoint: String,
        max_bytes: usize,
        capacity: usize,
    ) -> Self {
        let (sender, mut receiver) = mpsc::channel::<Bytes>(capacity.max(1));

        tokio::spawn(async move {
            while let Some(body) = receiver.recv().await {
                let result = client
                    .post(&endpoint)
                    .header(CONTENT_TYPE, "application/json")
                    .body(body)
                    .send()
                    .await;
                match result {
                    Ok(response) if response.status().is_success() => {}
                    Ok(response) => debug!("beacon delivery answered {}", response.status()),
                    Err(err) => debug!("beacon delivery failed: {}", err),
                }
            }
        });

        Self { sender, max_bytes }
    }

    pub fn try_send(&self, body: Bytes) -> bool {
        if body.len() > self.max_bytes {
            return false;
        }
        self.sender.try_send(body).is_ok()
    }
}

pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    opt_out_endpoint: String,
    opt_in_endpoint: String,
    beacon: Option<Beacon>,
}

impl HttpTransport {
    /// Beacon first, keep-alive POST as fallback. Outside a tokio runtime the
    /// beacon cannot run and only the POST path is used.
    pub fn new(config: &TrackerConfig) -> Result<Self, TransportError> {
        let mut transport = Self::without_beacon(config)?;
        if tokio::runtime::Handle::try_current().is_ok() {
            transport.beacon = Some(Beacon::spawn(
                transport.client.clone(),
                config.endpoint.clone(),
                config.beacon_max_bytes,
                config.beacon_capacity,
            ));
        }
        Ok(transport)
    }

    pub fn without_beacon(config: &TrackerConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            opt_out_endpoint: config.opt_out_endpoint.clone(),
            opt_in_endpoint: config.opt_in_endpoint.clone(),
            beacon: None,
        })
    }
}

fn classify(status: StatusCode) -> Result<(), TransportError> {
    if status.is_success() {
        Ok(())
    } else if status.is_client_error() {
        Err(TransportError::Rejected(status.as_u16()))
    } else {
        Err(TransportError::Unavailable(status.as_u16()))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    #[instrument(skip_all, fields(events = batch.len()))]
    async fn send(&self, batch: &EventBatch) -> Result<(), TransportError> {
        let body = Bytes::from(serde_json::to_vec(batch)?);

        if let Some(beacon) = &self.beacon {
            if beacon.try_send(body.clone()) {
                return Ok(());
            }
            debug!("beacon refused {} bytes, falling back to POST", body.len());
        }

        let response = self
            .client
            .post(&self.endpoint)
            .header(CONTENT_TYPE, "application/json")
            .header(CONNECTION, "keep-alive")
            .body(body)
            .send()
            .await?;

        classify(response.status())
    }

    async fn notify_opt_out(&self, hashed_user_id: &str) -> Result<(), TransportError> {
        self.post_privacy(&self.opt_out_endpoint, hashed_user_id).await
    }

    async fn notify_opt_in(&self, hashed_user_id: &str) -> Result<(), TransportError> {
        self.post_privacy(&self.opt_in_endpoint, hashed_user_id).await
    }
}

impl HttpTransport {
    async fn post_privacy(
        &self,
        endpoint: &str,
        hashed_user_id: &str,
    ) -> Result<(), TransportError> {
        let response = self
            .client
            .post(endpoint)
            .json(&json!({ "userId": hashed_user_id }))
            .send()
            .await?;

        classify(response.status())
    }
}
