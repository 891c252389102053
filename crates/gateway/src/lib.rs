//! Multi-protocol artifact registry reverse proxy: routes OCI Distribution,
//! Maven, and npm traffic to configured upstream backends behind a single
//! GitHub-authenticated front door.

pub mod backend;
pub mod config;
pub mod detect;
pub mod error;
pub mod handlers;
pub mod identity;
pub mod metrics;
pub mod middleware;
pub mod ratelimit;
pub mod state;
pub mod transport;

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, Uri};
use axum::middleware as axum_middleware;
use axum::response::IntoResponse;
use axum::routing::{any, get};

use detect::Protocol;
use state::GatewayState;

pub fn build_router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics_endpoint))
        .fallback(any(dispatch))
        .layer(axum_middleware::from_fn_with_state(state.clone(), middleware::concurrency_gate))
        .layer(axum_middleware::from_fn_with_state(state.clone(), middleware::timeout))
        .layer(axum_middleware::from_fn(middleware::catch_panic))
        .layer(axum_middleware::from_fn(middleware::request_id))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    StatusCode::OK
}

async fn ready(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    if state.bindings.is_empty() {
        (StatusCode::SERVICE_UNAVAILABLE, "no protocols configured")
    } else {
        (StatusCode::OK, "ready")
    }
}

async fn metrics_endpoint(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    (
        [(axum::http::header::CONTENT_TYPE, "application/openmetrics-text; version=1.0.0; charset=utf-8")],
        state.metrics.encode(),
    )
}

/// Routes an inbound request to the protocol handler chosen by the detector
/// chain, reconstructing the externally-visible host first since detection
/// may key off it.
async fn dispatch(
    State(state): State<Arc<GatewayState>>,
    req: axum::extract::Request,
) -> axum::response::Response {
    let external = detect::reconstruct_external_address(req.headers(), req.uri(), true);
    let path = req.uri().path();
    let content_type =
        req.headers().get(axum::http::header::CONTENT_TYPE).and_then(|v| v.to_str().ok());
    let user_agent = req.headers().get(axum::http::header::USER_AGENT).and_then(|v| v.to_str().ok());
    let ctx = detect::DetectionContext { content_type, user_agent };
    let protocol = state.detectors.detect(Some(external.host.as_str()), path, ctx);

    match protocol {
        Some(Protocol::Oci) => handlers::oci::handle(State(state), req).await,
        Some(Protocol::Maven) => handlers::maven::handle(State(state), req).await,
        Some(Protocol::Npm) => handlers::npm::handle(State(state), req).await,
        None => not_found(req.uri()).await,
    }
}

async fn not_found(uri: &Uri) -> axum::response::Response {
    tracing::debug!(path = %uri.path(), "no protocol detector matched");
    (StatusCode::NOT_FOUND, "no protocol matched this request").into_response()
}
