//! Outbound HTTP transport: a pooled `reqwest::Client` per backend, hop-by-hop
//! header hygiene, and credential substitution on the way upstream.

pub mod breaker;

use std::sync::Arc;

use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use bytes::Bytes;
use dashmap::DashMap;
use secrecy::ExposeSecret;

use crate::backend::{BackendAuth, BackendDescriptor};
use crate::error::{ErrorCode, ProxyError};
use crate::transport::breaker::CircuitBreaker;

/// Headers defined as hop-by-hop by RFC 9110 §7.6.1, stripped unconditionally
/// on both the request and response path.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Removes hop-by-hop headers, including any extra header named inside a
/// `Connection:` value (RFC 9110 permits a server to nominate additional
/// per-connection headers this way).
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let mut extra: Vec<String> = Vec::new();
    for value in headers.get_all("connection") {
        if let Ok(s) = value.to_str() {
            extra.extend(s.split(',').map(|p| p.trim().to_ascii_lowercase()).filter(|p| !p.is_empty()));
        }
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
    for name in extra {
        if let Ok(header_name) = HeaderName::try_from(name.as_str()) {
            headers.remove(header_name);
        }
    }
}

/// Headers a backend auth substitution must never be allowed to inject
/// alongside, beyond the literal CR/LF check `HeaderValue` already performs.
const FORBIDDEN_INJECTED_HEADERS: &[&str] = &["host", "content-length"];

/// Strips any inbound `Authorization` and applies this backend's own
/// configured credential instead, so a caller's GitHub token never reaches
/// an upstream registry.
pub fn apply_backend_auth(headers: &mut HeaderMap, auth: &BackendAuth) -> Result<(), ProxyError> {
    headers.remove(axum::http::header::AUTHORIZATION);
    match auth {
        BackendAuth::None => Ok(()),
        BackendAuth::Basic { username, password } => {
            let encoded = base64::Engine::encode(
                &base64::engine::general_purpose::STANDARD,
                format!("{username}:{}", password.expose_secret()),
            );
            let value = HeaderValue::from_str(&format!("Basic {encoded}"))
                .map_err(|_| ProxyError::new(ErrorCode::InternalError, "invalid basic auth value"))?;
            headers.insert(axum::http::header::AUTHORIZATION, value);
            Ok(())
        },
        BackendAuth::Bearer { token } => {
            let value = HeaderValue::from_str(&format!("Bearer {}", token.expose_secret()))
                .map_err(|_| ProxyError::new(ErrorCode::InternalError, "invalid bearer auth value"))?;
            headers.insert(axum::http::header::AUTHORIZATION, value);
            Ok(())
        },
        BackendAuth::CustomHeader { name, value } => {
            if FORBIDDEN_INJECTED_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
                return Err(ProxyError::new(ErrorCode::InternalError, "backend auth header name is reserved"));
            }
            let header_name = HeaderName::try_from(name.as_str())
                .map_err(|_| ProxyError::new(ErrorCode::InternalError, "invalid backend auth header name"))?;
            let header_value = HeaderValue::from_str(value.expose_secret())
                .map_err(|_| ProxyError::new(ErrorCode::InternalError, "invalid backend auth header value"))?;
            headers.insert(header_name, header_value);
            Ok(())
        },
    }
}

struct PooledBackend {
    client: reqwest::Client,
    breaker: Arc<CircuitBreaker>,
}

/// Owns one pooled `reqwest::Client` and one `CircuitBreaker` per configured
/// backend name, built lazily and cached for the life of the process.
pub struct TransportPool {
    backends: DashMap<String, Arc<PooledBackend>>,
}

impl Default for TransportPool {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportPool {
    pub fn new() -> Self {
        Self { backends: DashMap::new() }
    }

    pub fn client_for(&self, backend: &BackendDescriptor) -> reqwest::Client {
        self.entry_for(backend).client.clone()
    }

    pub fn breaker_for(&self, backend: &BackendDescriptor) -> Arc<CircuitBreaker> {
        self.entry_for(backend).breaker.clone()
    }

    fn entry_for(&self, backend: &BackendDescriptor) -> Arc<PooledBackend> {
        if let Some(existing) = self.backends.get(&backend.name) {
            return existing.clone();
        }
        // Double-checked: build outside the entry API so constructing a
        // reqwest::Client (non-trivial work) never happens under a shard lock.
        let built = Arc::new(PooledBackend {
            client: build_client(backend),
            breaker: Arc::new(CircuitBreaker::new(backend.breaker.clone())),
        });
        self.backends.entry(backend.name.clone()).or_insert(built).clone()
    }
}

fn build_client(backend: &BackendDescriptor) -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(backend.pool.pool_max_idle_per_host)
        .connect_timeout(backend.pool.connect_timeout)
        .timeout(backend.pool.request_timeout)
        .build()
        .expect("reqwest client builds")
}

/// Classifies an upstream outcome for cascading-pull purposes: whether this
/// response means "keep trying the next backend" or is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CascadeOutcome {
    Success,
    /// 404/401/403/5xx, or a network failure: try the next backend.
    TryNext,
    /// Any other 4xx: stop and surface this response.
    Terminal,
}

pub fn classify_cascade_outcome(status: reqwest::StatusCode) -> CascadeOutcome {
    if status.is_success() || status.is_redirection() {
        CascadeOutcome::Success
    } else if status == reqwest::StatusCode::NOT_FOUND
        || status == reqwest::StatusCode::UNAUTHORIZED
        || status == reqwest::StatusCode::FORBIDDEN
        || status.is_server_error()
    {
        CascadeOutcome::TryNext
    } else {
        CascadeOutcome::Terminal
    }
}

/// Reads a reqwest response body fully into memory. Used for small
/// JSON/XML metadata payloads that must be parsed and rewritten before
/// re-emission; large blobs should stream via [`stream_body`] instead.
pub async fn read_fully(resp: reqwest::Response) -> Result<Bytes, ProxyError> {
    resp.bytes().await.map_err(|e| ProxyError::new(ErrorCode::BackendNetworkFailure, e.to_string()))
}

/// Wraps a reqwest response body as an axum streaming [`Body`], so large
/// blob transfers never have to be buffered in this process. The body
/// stream is dropped (and with it, the underlying connection released back
/// to the pool or closed) as soon as the axum response completes, whichever
/// exit path that takes.
pub fn stream_body(resp: reqwest::Response) -> Body {
    Body::from_stream(resp.bytes_stream())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn strips_standard_hop_by_hop_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-request-id", HeaderValue::from_static("abc"));
        strip_hop_by_hop(&mut headers);
        assert!(!headers.contains_key("connection"));
        assert!(!headers.contains_key("keep-alive"));
        assert!(headers.contains_key("x-request-id"));
    }

    #[test]
    fn strips_headers_named_dynamically_in_connection() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("x-custom-hop"));
        headers.insert("x-custom-hop", HeaderValue::from_static("drop-me"));
        strip_hop_by_hop(&mut headers);
        assert!(!headers.contains_key("x-custom-hop"));
    }

    #[test]
    fn apply_backend_auth_removes_inbound_authorization() {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::AUTHORIZATION, HeaderValue::from_static("Bearer caller-token"));
        apply_backend_auth(&mut headers, &BackendAuth::None).unwrap();
        assert!(!headers.contains_key(axum::http::header::AUTHORIZATION));
    }

    #[test]
    fn apply_backend_auth_injects_bearer() {
        let mut headers = HeaderMap::new();
        apply_backend_auth(
            &mut headers,
            &BackendAuth::Bearer { token: secrecy::SecretString::from("upstream-token".to_string()) },
        )
        .unwrap();
        assert_eq!(
            headers.get(axum::http::header::AUTHORIZATION).unwrap(),
            "Bearer upstream-token"
        );
    }

    #[test]
    fn apply_backend_auth_rejects_reserved_custom_header_name() {
        let mut headers = HeaderMap::new();
        let err = apply_backend_auth(
            &mut headers,
            &BackendAuth::CustomHeader {
                name: "Host".to_string(),
                value: secrecy::SecretString::from("evil".to_string()),
            },
        )
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::InternalError);
    }

    #[test]
    fn classifies_cascade_outcomes() {
        assert_eq!(classify_cascade_outcome(reqwest::StatusCode::OK), CascadeOutcome::Success);
        assert_eq!(classify_cascade_outcome(reqwest::StatusCode::NOT_FOUND), CascadeOutcome::TryNext);
        assert_eq!(classify_cascade_outcome(reqwest::StatusCode::UNAUTHORIZED), CascadeOutcome::TryNext);
        assert_eq!(
            classify_cascade_outcome(reqwest::StatusCode::BAD_GATEWAY),
            CascadeOutcome::TryNext
        );
        assert_eq!(
            classify_cascade_outcome(reqwest::StatusCode::BAD_REQUEST),
            CascadeOutcome::Terminal
        );
    }
}
