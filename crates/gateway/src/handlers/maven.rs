//! Maven repository protocol handler: single-backend passthrough with
//! credential substitution and backend-URL rewriting in textual payloads
//! (POM/metadata XML, directory-listing HTML).

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{Response, StatusCode, header};

use crate::detect::{Protocol, reconstruct_external_address};
use crate::error::{ErrorCode, ProxyError};
use crate::handlers::{authenticate, check_rate_limit};
use crate::state::GatewayState;
use crate::transport::breaker::Admission;
use crate::transport::{apply_backend_auth, strip_hop_by_hop};

fn is_rewritable_content_type(content_type: &str) -> bool {
    let ct = content_type.split(';').next().unwrap_or("").trim();
    matches!(
        ct,
        "application/xml" | "text/xml" | "text/html" | "text/plain"
    )
}

pub async fn handle(State(state): State<Arc<GatewayState>>, req: Request) -> Response<Body> {
    let (mut parts, body) = req.into_parts();
    let principal = match authenticate(&state, Protocol::Maven, &mut parts).await {
        Ok(p) => p,
        Err(e) => return e.into_response(Protocol::Maven),
    };
    if let Err(e) = check_rate_limit(&state, &principal.login) {
        return e.into_response(Protocol::Maven);
    }

    let Some((binding, _)) = state.bindings.get(&Protocol::Maven) else {
        return ProxyError::new(ErrorCode::InternalError, "maven not configured")
            .into_response(Protocol::Maven);
    };
    let Some(backend) = binding.primary() else {
        return ProxyError::new(ErrorCode::InternalError, "no maven backend configured")
            .into_response(Protocol::Maven);
    };

    let external = reconstruct_external_address(&parts.headers, &parts.uri, true);

    let breaker = state.transport.breaker_for(backend);
    if matches!(breaker.try_admit(), Admission::Rejected) {
        return ProxyError::new(ErrorCode::BackendCircuitOpen, "backend circuit is open")
            .into_response(Protocol::Maven);
    }

    let client = state.transport.client_for(backend);
    let url = format!(
        "{}{}{}",
        backend.url,
        parts.uri.path(),
        parts.uri.query().map(|q| format!("?{q}")).unwrap_or_default()
    );

    let mut headers = parts.headers.clone();
    strip_hop_by_hop(&mut headers);
    if let Err(e) = apply_backend_auth(&mut headers, &backend.auth) {
        breaker.record_failure();
        return e.into_response(Protocol::Maven);
    }

    let method = match reqwest::Method::from_bytes(parts.method.as_str().as_bytes()) {
        Ok(m) => m,
        Err(e) => {
            breaker.record_failure();
            return ProxyError::new(ErrorCode::InternalError, e.to_string()).into_response(Protocol::Maven);
        },
    };

    let body_bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(b) => b,
        Err(e) => return ProxyError::new(ErrorCode::InternalError, e.to_string()).into_response(Protocol::Maven),
    };

    let resp = client.request(method, &url).headers(headers).body(body_bytes).send().await;
    let resp = match resp {
        Ok(r) => r,
        Err(e) => {
            breaker.record_failure();
            return ProxyError::new(ErrorCode::BackendNetworkFailure, e.to_string())
                .into_response(Protocol::Maven);
        },
    };

    if resp.status().is_server_error() {
        breaker.record_failure();
    } else {
        breaker.record_success();
    }

    let status = StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let content_type = resp
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let mut out_headers = resp.headers().clone();

    if is_rewritable_content_type(&content_type) {
        let bytes = match resp.bytes().await {
            Ok(b) => b,
            Err(e) => return ProxyError::new(ErrorCode::BackendNetworkFailure, e.to_string())
                .into_response(Protocol::Maven),
        };
        let path_prefix = state.config.maven.as_ref().and_then(|c| c.path_prefix.as_deref()).unwrap_or("");
        let external_base = format!("{}{}", external.base_url(), path_prefix);
        let rewritten = String::from_utf8_lossy(&bytes).replace(&backend.url, &external_base);
        strip_hop_by_hop(&mut out_headers);
        out_headers.remove(header::CONTENT_LENGTH);
        let mut builder = Response::builder().status(status);
        *builder.headers_mut().unwrap() = out_headers;
        builder.body(Body::from(rewritten)).expect("valid response")
    } else {
        strip_hop_by_hop(&mut out_headers);
        let mut builder = Response::builder().status(status);
        *builder.headers_mut().unwrap() = out_headers;
        builder.body(crate::transport::stream_body(resp)).expect("valid response")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_rewritable_content_types() {
        assert!(is_rewritable_content_type("text/xml; charset=utf-8"));
        assert!(is_rewritable_content_type("application/xml"));
        assert!(is_rewritable_content_type("text/html"));
        assert!(!is_rewritable_content_type("application/java-archive"));
        assert!(!is_rewritable_content_type("application/octet-stream"));
    }
}
