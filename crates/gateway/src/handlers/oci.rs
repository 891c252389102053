//! OCI Distribution protocol handler: write passthrough to the push
//! backend, cascading pull across ordered read backends, and response
//! rewriting to keep registry URLs pointing back at this gateway.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderValue, Method, Response, StatusCode};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::backend::BackendDescriptor;
use crate::detect::{Protocol, reconstruct_external_address};
use crate::error::{ErrorCode, ProxyError, oci_error_envelope};
use crate::handlers::{authenticate, check_rate_limit};
use crate::state::GatewayState;
use crate::transport::breaker::Admission;
use crate::transport::{CascadeOutcome, apply_backend_auth, classify_cascade_outcome, strip_hop_by_hop};

/// Session-URL marker for a blob upload in progress: any method against a
/// path containing this is a write, regardless of what the method would
/// otherwise imply.
const BLOB_UPLOAD_SESSION: &str = "/blobs/uploads/";
const BLOB_UPLOAD_START: &str = "/blobs/uploads";

/// Write detection is path-and-method based, not method-only: a `POST` to
/// start a blob upload, any method against an in-progress upload session URL,
/// a `PUT` to a manifest, or a `DELETE` of anything, is a write. Everything
/// else reads.
fn is_write_request(method: &Method, path: &str) -> bool {
    if path.contains(BLOB_UPLOAD_SESSION) {
        return true;
    }
    if *method == Method::POST && path.contains(BLOB_UPLOAD_START) {
        return true;
    }
    if *method == Method::PUT && path.contains("/manifests/") {
        return true;
    }
    *method == Method::DELETE
}

/// Extracts the org — the path component immediately after `/v2/` — used
/// both for cascade eligibility and namespace scoping. Returns `None` for
/// the bare ping endpoint or a malformed path.
fn org_from_path(path: &str) -> Option<&str> {
    let rest = path.strip_prefix("/v2/")?;
    let org = rest.split('/').next()?;
    if org.is_empty() { None } else { Some(org) }
}

/// Rewrites an OCI repository path for a specific backend's namespace. The
/// bare `/v2/` ping endpoint is never rewritten — it carries no repository
/// name to remap and exists purely for capability discovery.
fn rewrite_path(path: &str, backend: &BackendDescriptor) -> String {
    if path == "/v2/" || path == "/v2" {
        return path.to_string();
    }
    let Some(rest) = path.strip_prefix("/v2/") else {
        return path.to_string();
    };

    let mut rest = rest.to_string();
    if backend.oci.add_library_prefix {
        // A single path segment ahead of the operation keyword
        // (manifests/blobs/tags/_catalog) implies a Docker Hub "official
        // image" name.
        if let Some((repo_and_op, remainder)) = split_at_operation(&rest) {
            if !repo_and_op.contains('/') {
                rest = format!("library/{repo_and_op}{remainder}");
            }
        }
    }

    if let Some(namespace) = &backend.oci.upstream_namespace {
        format!("/v2/{namespace}/{rest}")
    } else {
        format!("/v2/{rest}")
    }
}

/// Splits `name/manifests/tag` into `("name", "/manifests/tag")`.
fn split_at_operation(rest: &str) -> Option<(&str, &str)> {
    for op in ["/manifests/", "/blobs/", "/tags/", "/_catalog"] {
        if let Some(idx) = rest.find(op) {
            return Some((&rest[..idx], &rest[idx..]));
        }
    }
    None
}

pub async fn handle(State(state): State<Arc<GatewayState>>, req: Request) -> Response<Body> {
    let (mut parts, body) = req.into_parts();
    let principal = match authenticate(&state, Protocol::Oci, &mut parts).await {
        Ok(p) => p,
        Err(e) => return e.into_response(Protocol::Oci),
    };
    if let Err(e) = check_rate_limit(&state, &principal.login) {
        return e.into_response(Protocol::Oci);
    }

    let Some((binding, requirement)) = state.bindings.get(&Protocol::Oci) else {
        return ProxyError::new(ErrorCode::InternalError, "oci not configured").into_response(Protocol::Oci);
    };

    let external = reconstruct_external_address(&parts.headers, &parts.uri, true);

    if is_write_request(&parts.method, parts.uri.path()) {
        let Some(backend) = binding.primary() else {
            return ProxyError::new(ErrorCode::InternalError, "no oci backend configured")
                .into_response(Protocol::Oci);
        };
        return proxy_once(&state, backend, &parts, body, &external).await;
    }

    let org = org_from_path(parts.uri.path()).unwrap_or_default();
    let eligible = binding.eligible_oci_backends(org, requirement.required_org.as_deref());
    if eligible.is_empty() {
        return oci_error_envelope(StatusCode::NOT_FOUND, ErrorCode::ImageNotFound, "no eligible backend for org");
    }

    let mut tried_any = false;
    let mut saw_server_failure = false;
    for backend in eligible {
        let breaker = state.transport.breaker_for(backend);
        if matches!(breaker.try_admit(), Admission::Rejected) {
            saw_server_failure = true;
            continue;
        }

        tried_any = true;
        match proxy_read(&state, backend, &parts, &external).await {
            Ok((status, response)) => {
                let outcome = classify_cascade_outcome(status);
                match outcome {
                    CascadeOutcome::Success => {
                        breaker.record_success();
                        return response;
                    },
                    CascadeOutcome::TryNext => {
                        breaker.record_failure();
                        if status.is_server_error() {
                            saw_server_failure = true;
                        }
                    },
                    CascadeOutcome::Terminal => {
                        breaker.record_success();
                        return response;
                    },
                }
            },
            Err(_) => {
                breaker.record_failure();
                saw_server_failure = true;
            },
        }
    }

    if saw_server_failure {
        oci_error_envelope(
            StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::RegistryUnavailable,
            "all eligible backends are unavailable",
        )
    } else if tried_any {
        oci_error_envelope(StatusCode::NOT_FOUND, ErrorCode::ImageNotFound, "manifest or blob not found")
    } else {
        oci_error_envelope(StatusCode::NOT_FOUND, ErrorCode::ImageNotFound, "all eligible backends were skipped")
    }
}

async fn proxy_read(
    state: &Arc<GatewayState>,
    backend: &BackendDescriptor,
    parts: &axum::http::request::Parts,
    external: &crate::detect::ExternalAddress,
) -> Result<(reqwest::StatusCode, Response<Body>), ProxyError> {
    let client = state.transport.client_for(backend);
    let path = rewrite_path(parts.uri.path(), backend);
    let url = format!(
        "{}{}{}",
        backend.url,
        path,
        parts.uri.query().map(|q| format!("?{q}")).unwrap_or_default()
    );

    let mut headers = parts.headers.clone();
    strip_hop_by_hop(&mut headers);
    apply_backend_auth(&mut headers, &backend.auth)?;

    let method = reqwest::Method::from_bytes(parts.method.as_str().as_bytes())
        .map_err(|e| ProxyError::new(ErrorCode::InternalError, e.to_string()))?;

    let resp = client
        .request(method, url)
        .headers(headers)
        .send()
        .await
        .map_err(|e| ProxyError::new(ErrorCode::BackendNetworkFailure, e.to_string()))?;

    let status = resp.status();
    let response = build_response(resp, parts.method.clone(), external, &backend.url);
    Ok((status, response))
}

/// Write path: the push backend's credentials replace the caller's, and the
/// request is issued without path rewriting — the client already addressed
/// the push backend's own namespace.
async fn proxy_once(
    state: &Arc<GatewayState>,
    backend: &BackendDescriptor,
    parts: &axum::http::request::Parts,
    body: Body,
    external: &crate::detect::ExternalAddress,
) -> Response<Body> {
    let client = state.transport.client_for(backend);
    let path = parts.uri.path();
    let url = format!(
        "{}{}{}",
        backend.url,
        path,
        parts.uri.query().map(|q| format!("?{q}")).unwrap_or_default()
    );

    let mut headers = parts.headers.clone();
    strip_hop_by_hop(&mut headers);
    if let Err(e) = apply_backend_auth(&mut headers, &backend.auth) {
        return e.into_response(Protocol::Oci);
    }

    let method = match reqwest::Method::from_bytes(parts.method.as_str().as_bytes()) {
        Ok(m) => m,
        Err(e) => return ProxyError::new(ErrorCode::InternalError, e.to_string()).into_response(Protocol::Oci),
    };

    let body_bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(b) => b,
        Err(e) => return ProxyError::new(ErrorCode::InternalError, e.to_string()).into_response(Protocol::Oci),
    };

    let breaker = state.transport.breaker_for(backend);
    if matches!(breaker.try_admit(), Admission::Rejected) {
        return ProxyError::new(ErrorCode::BackendCircuitOpen, "backend circuit is open")
            .into_response(Protocol::Oci);
    }

    let resp = client.request(method, url).headers(headers).body(body_bytes).send().await;
    match resp {
        Ok(resp) => {
            if resp.status().is_server_error() {
                breaker.record_failure();
            } else {
                breaker.record_success();
            }
            build_response(resp, parts.method.clone(), external, &backend.url)
        },
        Err(e) => {
            breaker.record_failure();
            ProxyError::new(ErrorCode::BackendNetworkFailure, e.to_string()).into_response(Protocol::Oci)
        },
    }
}

fn build_response(
    resp: reqwest::Response,
    method: Method,
    external: &crate::detect::ExternalAddress,
    backend_url: &str,
) -> Response<Body> {
    let status = StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut headers = resp.headers().clone();

    rewrite_location_header(&mut headers, external, backend_url);
    rewrite_www_authenticate(&mut headers, external);

    let mut builder = Response::builder().status(status);
    {
        let out_headers = builder.headers_mut().expect("builder has headers");
        for (name, value) in headers.iter() {
            out_headers.insert(name.clone(), value.clone());
        }
        out_headers.insert(
            "docker-distribution-api-version",
            HeaderValue::from_static("registry/2.0"),
        );
        crate::transport::strip_hop_by_hop(out_headers);
        if method != Method::HEAD {
            // Content-Length is meaningful on HEAD (it reports the would-be
            // body size); chunked streaming makes it stale on every other
            // method.
            out_headers.remove(axum::http::header::CONTENT_LENGTH);
        }
        if method == Method::HEAD {
            out_headers.remove("transfer-encoding");
        }
    }

    if method == Method::HEAD {
        builder.body(Body::empty()).expect("valid response")
    } else {
        builder.body(crate::transport::stream_body(resp)).expect("valid response")
    }
}

/// Rewrites `Location`: a path-only value is prefixed with the externally
/// visible base URL; a value that begins with the backend's own URL is
/// rebased onto the external URL, preserving everything after that prefix
/// (including the backend's port, which `reqwest::Url`-based rebasing would
/// otherwise silently drop when it didn't match the new host).
fn rewrite_location_header(
    headers: &mut axum::http::HeaderMap,
    external: &crate::detect::ExternalAddress,
    backend_url: &str,
) {
    let Some(loc) = headers.get(axum::http::header::LOCATION).cloned() else {
        return;
    };
    let Ok(loc_str) = loc.to_str() else {
        return;
    };

    let rewritten = if let Some(rest) = loc_str.strip_prefix(backend_url) {
        format!("{}{}", external.base_url(), rest)
    } else if loc_str.starts_with('/') {
        format!("{}{}", external.base_url(), loc_str)
    } else {
        return;
    };

    if let Ok(value) = HeaderValue::from_str(&rewritten) {
        headers.insert(axum::http::header::LOCATION, value);
    }
}

/// Matches the `realm` parameter of a `WWW-Authenticate` challenge, capturing
/// the scheme/host/port portion so it can be rebased onto the external
/// address while the rest of the realm (its path) is preserved verbatim.
static REALM_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"realm="https?://[^/"]+((?:/[^"]*)?)""#).unwrap());

fn rewrite_www_authenticate(headers: &mut axum::http::HeaderMap, external: &crate::detect::ExternalAddress) {
    let Some(value) = headers.get(axum::http::header::WWW_AUTHENTICATE).cloned() else {
        return;
    };
    let Ok(s) = value.to_str() else {
        return;
    };

    let rewritten = REALM_PATTERN.replace(s, |caps: &regex::Captures| {
        format!("realm=\"{}{}\"", external.base_url(), &caps[1])
    });

    if let Ok(new_value) = HeaderValue::from_str(&rewritten) {
        headers.insert(axum::http::header::WWW_AUTHENTICATE, new_value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendAuth, BreakerParams, OciBackendExtra, PoolParams};
    use crate::detect::ExternalAddress;

    fn backend(namespace: Option<&str>, add_library_prefix: bool) -> BackendDescriptor {
        BackendDescriptor {
            name: "b".into(),
            url: "https://upstream.example.com".into(),
            auth: BackendAuth::None,
            pool: PoolParams::default(),
            breaker: BreakerParams::default(),
            oci: OciBackendExtra {
                upstream_namespace: namespace.map(str::to_string),
                add_library_prefix,
                scope: vec![],
            },
        }
    }

    #[test]
    fn ping_endpoint_is_never_rewritten() {
        let b = backend(Some("mirror"), true);
        assert_eq!(rewrite_path("/v2/", &b), "/v2/");
    }

    #[test]
    fn applies_upstream_namespace() {
        let b = backend(Some("mirror"), false);
        assert_eq!(
            rewrite_path("/v2/foo/manifests/latest", &b),
            "/v2/mirror/foo/manifests/latest"
        );
    }

    #[test]
    fn adds_library_prefix_for_single_segment_repo() {
        let b = backend(None, true);
        assert_eq!(rewrite_path("/v2/nginx/manifests/latest", &b), "/v2/library/nginx/manifests/latest");
    }

    #[test]
    fn does_not_add_library_prefix_for_namespaced_repo() {
        let b = backend(None, true);
        assert_eq!(rewrite_path("/v2/acme/app/manifests/latest", &b), "/v2/acme/app/manifests/latest");
    }

    #[test]
    fn manifest_put_is_a_write() {
        assert!(is_write_request(&Method::PUT, "/v2/acme/app/manifests/latest"));
    }

    #[test]
    fn blob_put_is_not_force_routed_as_a_write() {
        assert!(!is_write_request(&Method::PUT, "/v2/acme/app/blobs/sha256:abc"));
    }

    #[test]
    fn blob_upload_start_post_is_a_write() {
        assert!(is_write_request(&Method::POST, "/v2/acme/app/blobs/uploads/"));
    }

    #[test]
    fn get_on_upload_session_url_is_a_write() {
        assert!(is_write_request(
            &Method::GET,
            "/v2/acme/app/blobs/uploads/4c7d3d2e-0c1e-4b8a-9f7e-abc123"
        ));
    }

    #[test]
    fn delete_is_always_a_write() {
        assert!(is_write_request(&Method::DELETE, "/v2/acme/app/manifests/latest"));
    }

    #[test]
    fn plain_get_is_a_read() {
        assert!(!is_write_request(&Method::GET, "/v2/acme/app/manifests/latest"));
        assert!(!is_write_request(&Method::HEAD, "/v2/acme/app/blobs/sha256:abc"));
    }

    #[test]
    fn org_from_path_extracts_first_segment() {
        assert_eq!(org_from_path("/v2/acme/app/manifests/latest"), Some("acme"));
        assert_eq!(org_from_path("/v2/"), None);
    }

    fn external() -> ExternalAddress {
        ExternalAddress { scheme: "https".into(), host: "gateway.example.com".into() }
    }

    #[test]
    fn rewrites_path_only_location() {
        let mut headers = axum::http::HeaderMap::new();
        headers.insert(
            axum::http::header::LOCATION,
            HeaderValue::from_static("/v2/acme/app/blobs/uploads/abc123"),
        );
        rewrite_location_header(&mut headers, &external(), "https://upstream.example.com");
        assert_eq!(
            headers.get(axum::http::header::LOCATION).unwrap(),
            "https://gateway.example.com/v2/acme/app/blobs/uploads/abc123"
        );
    }

    #[test]
    fn rewrites_absolute_location_prefixed_by_backend_url() {
        let mut headers = axum::http::HeaderMap::new();
        headers.insert(
            axum::http::header::LOCATION,
            HeaderValue::from_static("https://upstream.example.com:8443/v2/acme/app/blobs/uploads/abc123"),
        );
        rewrite_location_header(&mut headers, &external(), "https://upstream.example.com");
        assert_eq!(
            headers.get(axum::http::header::LOCATION).unwrap(),
            "https://gateway.example.com:8443/v2/acme/app/blobs/uploads/abc123"
        );
    }

    #[test]
    fn rewrites_www_authenticate_realm_host_and_scheme() {
        let mut headers = axum::http::HeaderMap::new();
        headers.insert(
            axum::http::header::WWW_AUTHENTICATE,
            HeaderValue::from_static(
                r#"Bearer realm="https://upstream.example.com/token",service="upstream""#,
            ),
        );
        rewrite_www_authenticate(&mut headers, &external());
        let rewritten = headers.get(axum::http::header::WWW_AUTHENTICATE).unwrap().to_str().unwrap();
        assert!(rewritten.contains(r#"realm="https://gateway.example.com/token""#));
    }

    #[test]
    fn rewrites_www_authenticate_with_http_realm() {
        let mut headers = axum::http::HeaderMap::new();
        headers.insert(
            axum::http::header::WWW_AUTHENTICATE,
            HeaderValue::from_static(r#"Bearer realm="http://upstream.example.com/token""#),
        );
        rewrite_www_authenticate(&mut headers, &external());
        let rewritten = headers.get(axum::http::header::WWW_AUTHENTICATE).unwrap().to_str().unwrap();
        assert!(rewritten.contains(r#"realm="https://gateway.example.com/token""#));
    }
}
