use std::future::ready;
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::Method;
use axum::{
    routing::{get, post},
    Router,
};
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::optout::OptOutRegistry;
use crate::prometheus::{setup_metrics_recorder, track_metrics};
use crate::time::TimeSource;
use crate::{ingest, optout, pixel, sinks, stats};

pub const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Clone)]
pub struct State {
    pub sink: Arc<dyn sinks::Event + Send + Sync>,
    pub timesource: Arc<dyn TimeSource + Send + Sync>,
    pub registry: Arc<dyn OptOutRegistry + Send + Sync>,
}

/// Knobs that shape the HTTP stack rather than the handlers.
#[derive(Debug, Clone, Copy)]
pub struct RouterOptions {
    pub metrics: bool,
    pub max_body_bytes: usize,
    pub concurrency_limit: Option<usize>,
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self {
            metrics: false,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            concurrency_limit: None,
        }
    }
}

async fn index() -> &'static str {
    "pixel-capture"
}

pub fn router<TZ: TimeSource + Send + Sync + 'static>(
    timesource: TZ,
    sink: Arc<dyn sinks::Event + Send + Sync>,
    registry: Arc<dyn OptOutRegistry + Send + Sync>,
    options: RouterOptions,
) -> Router {
    let state = State {
        sink,
        timesource: Arc::new(timesource),
        registry,
    };

    // The pixel is embedded on arbitrary origins
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
        .allow_origin(AllowOrigin::mirror_request());

    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(index))
        .route("/api/track", post(ingest::track))
        .route("/api/tracking", post(ingest::track))
        .route("/api/tracking/pixel", post(ingest::track_pixel))
        .route("/api/tracking/stats", get(stats::stats))
        .route("/api/pixel.gif", get(pixel::pixel_gif))
        .route("/api/privacy/opt-out", post(optout::opt_out))
        .route("/api/privacy/opt-in", post(optout::opt_in))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(options.max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(axum::middleware::from_fn(track_metrics))
        .with_state(state);

    let router = match options.concurrency_limit {
        Some(limit) => router.layer(ConcurrencyLimitLayer::new(limit)),
        None => router,
    };

    // Don't install metrics unless asked to
    // Installing a global recorder when used as a library (during tests etc)
    // does not work well.
    if options.metrics {
        let recorder_handle = setup_metrics_recorder();
        router.route("/metrics", get(move || ready(recorder_handle.render())))
    } else {
        router
    }
}
