//! Cross-cutting request middleware: request-id propagation, deadline
//! enforcement, and the rate/concurrency gates every request passes through
//! before reaching a protocol handler.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::Response;

use registry_core::RequestId;

use crate::error::{ErrorCode, ProxyError};
use crate::ratelimit::is_infra_endpoint;
use crate::state::GatewayState;

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Reads or mints the request id, stashes it in request extensions for
/// handlers to log with, and echoes it back on the response.
pub async fn request_id(mut req: Request, next: Next) -> Response {
    let incoming = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let request_id = RequestId::from_header_or_generate(incoming.as_deref());
    req.extensions_mut().insert(request_id.clone());

    let mut resp = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(request_id.as_str()) {
        resp.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    resp
}

/// Wraps the handler chain with the server-wide request deadline, so a
/// wedged upstream cannot hold a connection open indefinitely.
pub async fn timeout(
    State(state): State<Arc<GatewayState>>,
    req: Request,
    next: Next,
) -> Response {
    match tokio::time::timeout(state.config.request_timeout, next.run(req)).await {
        Ok(resp) => resp,
        Err(_) => ProxyError::new(ErrorCode::BackendTimeout, "request exceeded the server deadline")
            .into_response(crate::detect::Protocol::Oci),
    }
}

/// Applies the global concurrency limiter and, once a principal is known to
/// the request, the global/per-user rate limiter. Runs before protocol
/// detection proper for the concurrency check (which is identity-agnostic)
/// and is invoked a second time per-handler once a principal is resolved.
pub async fn concurrency_gate(
    State(state): State<Arc<GatewayState>>,
    req: Request,
    next: Next,
) -> Response {
    let path = req.uri().path();
    if is_infra_endpoint(path) {
        return next.run(req).await;
    }

    match state.concurrency.try_acquire() {
        Some(_permit) => next.run(req).await,
        None => ProxyError::new(ErrorCode::ConcurrencyLimitExceeded, "too many in-flight requests")
            .into_response(crate::detect::Protocol::Oci),
    }
}

/// Catches a panic unwind from deeper in the handler chain and converts it
/// into a 500 rather than tearing down the connection, matching the
/// fail-safe posture of a gateway that must keep serving other tenants.
pub async fn catch_panic(req: Request, next: Next) -> Response {
    let fut = std::panic::AssertUnwindSafe(next.run(req));
    match futures::FutureExt::catch_unwind(fut).await {
        Ok(resp) => resp,
        Err(_) => {
            tracing::error!("panic while handling request");
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Body::from("internal error"))
                .expect("valid response")
        },
    }
}

pub fn rate_limit_error(global: bool) -> ProxyError {
    if global {
        ProxyError::new(ErrorCode::GlobalRateLimitExceeded, "global rate limit exceeded")
    } else {
        ProxyError::new(ErrorCode::PerUserRateLimitExceeded, "per-user rate limit exceeded")
    }
}

pub const DEFAULT_IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_error_picks_correct_code() {
        assert_eq!(rate_limit_error(true).code, ErrorCode::GlobalRateLimitExceeded);
        assert_eq!(rate_limit_error(false).code, ErrorCode::PerUserRateLimitExceeded);
    }
}
