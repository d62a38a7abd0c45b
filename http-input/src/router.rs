use std::convert::Infallible;
use std::future::ready;
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::{
    routing::{get, post},
    Router,
};
use health::HealthRegistry;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::decode::Decoder;
use crate::prometheus::{setup_metrics_recorder, track_metrics};
use crate::{input, sinks, time::TimeSource};

#[derive(Clone)]
pub struct State {
    pub sink: Arc<dyn sinks::EventSink + Send + Sync>,
    pub timesource: Arc<dyn TimeSource + Send + Sync>,
    pub decoder: Decoder,
}

async fn index() -> &'static str {
    "http-input"
}

/// Request handling limits, applied to the input routes only.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub concurrency: usize,
    pub max_body_size: usize,
}

pub fn router<
    TZ: TimeSource + Send + Sync + 'static,
    S: sinks::EventSink + Send + Sync + 'static,
>(
    timesource: TZ,
    liveness: HealthRegistry,
    sink: S,
    decoder: Decoder,
    limits: Limits,
    metrics: bool,
) -> Router {
    let state = State {
        sink: Arc::new(sink),
        timesource: Arc::new(timesource),
        decoder,
    };

    // One permit pool shared by every input route
    let ingest = post(input::event)
        .layer::<_, Infallible>(GlobalConcurrencyLimitLayer::new(limits.concurrency))
        .layer(DefaultBodyLimit::max(limits.max_body_size));

    // Any path is a tag, the root path being the empty tag. Static routes win over
    // the wildcard, so the ambient endpoints also accept posted events.
    let mut router = Router::new()
        .route("/", ingest.clone().get(index))
        .route(
            "/_liveness",
            ingest.clone().get(move || ready(liveness.get_status())),
        )
        .route("/*tag", ingest.clone());

    // Installing a global recorder more than once per process fails, tests leave it off
    if metrics {
        match setup_metrics_recorder() {
            Ok(recorder_handle) => {
                router = router.route(
                    "/metrics",
                    ingest.get(move || ready(recorder_handle.render())),
                );
            }
            Err(err) => warn!("failed to install metrics recorder: {}", err),
        }
    }

    router
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(track_metrics))
        .with_state(state)
}
