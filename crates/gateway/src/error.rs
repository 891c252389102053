//! Error taxonomy (spec §7) plus the machinery for turning any variant into
//! a protocol-appropriate HTTP response.

use axum::body::Body;
use axum::http::{HeaderValue, Response, StatusCode, header};
use serde::Serialize;

use crate::detect::Protocol;

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    #[error("INVALID_TOKEN_SHAPE")]
    InvalidTokenShape,
    #[error("AUTH_HEADER_MISSING")]
    AuthHeaderMissing,
    #[error("AUTH_HEADER_UNSUPPORTED")]
    AuthHeaderUnsupported,
    #[error("INSUFFICIENT_PERMISSIONS")]
    InsufficientPermissions,
    #[error("BACKEND_NETWORK_FAILURE")]
    BackendNetworkFailure,
    #[error("BACKEND_TIMEOUT")]
    BackendTimeout,
    #[error("BACKEND_CIRCUIT_OPEN")]
    BackendCircuitOpen,
    #[error("BACKEND_TOO_MANY_HALF_OPEN")]
    BackendTooManyHalfOpen,
    #[error("IMAGE_NOT_FOUND")]
    ImageNotFound,
    #[error("REGISTRY_UNAVAILABLE")]
    RegistryUnavailable,
    #[error("GLOBAL_RATE_LIMIT_EXCEEDED")]
    GlobalRateLimitExceeded,
    #[error("PER_USER_RATE_LIMIT_EXCEEDED")]
    PerUserRateLimitExceeded,
    #[error("CONCURRENCY_LIMIT_EXCEEDED")]
    ConcurrencyLimitExceeded,
    #[error("INTERNAL_ERROR")]
    InternalError,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::InvalidTokenShape => "INVALID_TOKEN_SHAPE",
            ErrorCode::AuthHeaderMissing => "AUTH_HEADER_MISSING",
            ErrorCode::AuthHeaderUnsupported => "AUTH_HEADER_UNSUPPORTED",
            ErrorCode::InsufficientPermissions => "INSUFFICIENT_PERMISSIONS",
            ErrorCode::BackendNetworkFailure => "BACKEND_NETWORK_FAILURE",
            ErrorCode::BackendTimeout => "BACKEND_TIMEOUT",
            ErrorCode::BackendCircuitOpen => "BACKEND_CIRCUIT_OPEN",
            ErrorCode::BackendTooManyHalfOpen => "BACKEND_TOO_MANY_HALF_OPEN",
            ErrorCode::ImageNotFound => "IMAGE_NOT_FOUND",
            ErrorCode::RegistryUnavailable => "REGISTRY_UNAVAILABLE",
            ErrorCode::GlobalRateLimitExceeded => "GLOBAL_RATE_LIMIT_EXCEEDED",
            ErrorCode::PerUserRateLimitExceeded => "PER_USER_RATE_LIMIT_EXCEEDED",
            ErrorCode::ConcurrencyLimitExceeded => "CONCURRENCY_LIMIT_EXCEEDED",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }

    fn status(self) -> StatusCode {
        match self {
            ErrorCode::InvalidTokenShape
            | ErrorCode::AuthHeaderMissing
            | ErrorCode::AuthHeaderUnsupported
            | ErrorCode::InsufficientPermissions => StatusCode::UNAUTHORIZED,
            ErrorCode::ImageNotFound => StatusCode::NOT_FOUND,
            ErrorCode::GlobalRateLimitExceeded | ErrorCode::PerUserRateLimitExceeded => {
                StatusCode::TOO_MANY_REQUESTS
            },
            ErrorCode::BackendCircuitOpen
            | ErrorCode::BackendTooManyHalfOpen
            | ErrorCode::ConcurrencyLimitExceeded
            | ErrorCode::RegistryUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::BackendTimeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorCode::BackendNetworkFailure => StatusCode::BAD_GATEWAY,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// A proxy-level error, carrying the taxonomy code plus human prose. The
/// specific authorization-failure cause is attached only for logging; it is
/// never rendered into the response body (spec §7 "propagation policy").
#[derive(Debug)]
pub struct ProxyError {
    pub code: ErrorCode,
    pub message: String,
    pub log_cause: Option<String>,
}

#[derive(Serialize)]
struct JsonBody<'a> {
    error: &'a str,
    message: &'a str,
}

impl ProxyError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            log_cause: None,
        }
    }

    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.log_cause = Some(cause.into());
        self
    }

    /// Coalesces any authorization-shaped failure into the generic message
    /// the spec mandates, logging the real cause separately so operators can
    /// still diagnose misconfiguration without it leaking to the caller.
    pub fn insufficient_permissions(cause: impl Into<String>) -> Self {
        let cause = cause.into();
        tracing::info!(cause = %cause, "authorization check failed");
        ProxyError::new(ErrorCode::InsufficientPermissions, "insufficient permissions")
            .with_cause(cause)
    }

    /// Renders this error as a response in the given protocol's native
    /// error envelope.
    pub fn into_response(self, protocol: Protocol) -> Response<Body> {
        let status = self.code.status();
        match protocol {
            Protocol::Oci => oci_error_envelope(status, self.code, &self.message),
            _ => {
                let body = JsonBody {
                    error: self.code.as_str(),
                    message: &self.message,
                };
                let payload = serde_json::to_vec(&body).unwrap_or_default();
                let mut resp = Response::builder()
                    .status(status)
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(payload))
                    .expect("valid response");
                resp
                    .headers_mut()
                    .insert("x-error-code", HeaderValue::from_static(self.code.as_str()));
                resp
            },
        }
    }
}

impl std::fmt::Display for ProxyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

impl std::error::Error for ProxyError {}

/// OCI Distribution error code accompanying an HTTP status, per the
/// Distribution spec's error envelope.
fn oci_code_for(code: ErrorCode) -> &'static str {
    match code {
        ErrorCode::ImageNotFound => "NAME_UNKNOWN",
        ErrorCode::InvalidTokenShape
        | ErrorCode::AuthHeaderMissing
        | ErrorCode::AuthHeaderUnsupported
        | ErrorCode::InsufficientPermissions => "UNAUTHORIZED",
        ErrorCode::RegistryUnavailable
        | ErrorCode::BackendCircuitOpen
        | ErrorCode::BackendTooManyHalfOpen => "UNAVAILABLE",
        _ => "UNKNOWN",
    }
}

pub fn oci_error_envelope(status: StatusCode, code: ErrorCode, message: &str) -> Response<Body> {
    let body = serde_json::json!({
        "errors": [{
            "code": oci_code_for(code),
            "message": message,
        }]
    });
    let mut resp = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("valid response");
    let headers = resp.headers_mut();
    headers.insert("x-error-code", HeaderValue::from_static(code.as_str()));
    headers.insert(
        "docker-distribution-api-version",
        HeaderValue::from_static("registry/2.0"),
    );
    resp
}
