//! npm registry protocol handler: single-backend passthrough plus a bounded
//! recursive rewrite of package metadata JSON so tarball URLs point back at
//! this gateway instead of the upstream registry.

use std::io::Read;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{Response, StatusCode, header};
use flate2::read::GzDecoder;
use serde_json::Value;

use crate::detect::{ExternalAddress, Protocol, reconstruct_external_address};
use crate::error::{ErrorCode, ProxyError};
use crate::handlers::{authenticate, check_rate_limit};
use crate::state::GatewayState;
use crate::transport::breaker::Admission;
use crate::transport::{apply_backend_auth, strip_hop_by_hop};

/// Fields known to carry an absolute URL into the upstream registry,
/// anywhere they appear in the metadata document.
const URL_FIELDS: &[&str] = &["tarball", "url", "homepage", "repository", "bugs"];

/// NPM install media type alongside the plain JSON types that trigger a
/// metadata rewrite.
const NPM_INSTALL_MEDIA_TYPE: &str = "application/vnd.npm.install-v1+json";

/// Whether a response's content type should be rewritten: plain/install JSON
/// or any `text/*` body.
fn is_rewritable_content_type(content_type: &str) -> bool {
    let ct = content_type.split(';').next().unwrap_or("").trim();
    ct == NPM_INSTALL_MEDIA_TYPE || ct.starts_with("application/json") || ct.starts_with("text/")
}

/// Recursion is bounded because npm metadata documents are a handful of
/// levels deep at most (package -> versions -> dist -> url); a runaway
/// depth means something is wrong with the payload, not that more rewriting
/// is needed.
const MAX_REWRITE_DEPTH: usize = 10;

/// Above this size, parsing and re-serializing the full JSON tree is wasteful;
/// fall back to a scheme-agnostic textual replacement instead.
const SIZE_THRESHOLD_BYTES: usize = 10 * 1024 * 1024;

fn host_port(url: &str) -> Option<String> {
    reqwest::Url::parse(url).ok().map(|u| match u.port() {
        Some(p) => format!("{}:{p}", u.host_str().unwrap_or_default()),
        None => u.host_str().unwrap_or_default().to_string(),
    })
}

/// Rewrites every recognized URL field whose host:port matches the backend's
/// so it instead points at `external`, leaving everything else untouched.
pub fn rewrite_metadata(value: &mut Value, backend_url: &str, external: &ExternalAddress, depth: usize) {
    if depth > MAX_REWRITE_DEPTH {
        return;
    }
    let Some(backend_host_port) = host_port(backend_url) else { return };

    match value {
        Value::Object(map) => {
            for (key, v) in map.iter_mut() {
                if URL_FIELDS.contains(&key.as_str())
                    && let Value::String(s) = v
                    && host_port(s).as_deref() == Some(backend_host_port.as_str())
                    && let Ok(parsed) = reqwest::Url::parse(s)
                {
                    let mut rewritten = parsed.clone();
                    let _ = rewritten.set_scheme(&external.scheme);
                    let host_only = external.host.split(':').next().unwrap_or(&external.host);
                    let _ = rewritten.set_host(Some(host_only));
                    if let Some(port) = external.host.split(':').nth(1).and_then(|p| p.parse().ok()) {
                        let _ = rewritten.set_port(Some(port));
                    }
                    *v = Value::String(rewritten.to_string());
                } else {
                    rewrite_metadata(v, backend_url, external, depth + 1);
                }
            }
        },
        Value::Array(items) => {
            for item in items.iter_mut() {
                rewrite_metadata(item, backend_url, external, depth + 1);
            }
        },
        _ => {},
    }
}

fn decompress_gzip(bytes: &[u8]) -> Option<Vec<u8>> {
    let mut decoder = GzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).ok()?;
    Some(out)
}

/// Scheme-agnostic textual fallback: replaces both `http://` and `https://`
/// occurrences of the backend's host:port with the external URL, preserving
/// whatever path/query/fragment followed.
fn text_replace_fallback(raw: &[u8], backend_url: &str, external: &ExternalAddress) -> Vec<u8> {
    let backend_host_port = host_port(backend_url).unwrap_or_default();
    let text = String::from_utf8_lossy(raw);
    let external_base = external.base_url();
    let rewritten = text
        .replace(&format!("http://{backend_host_port}"), &external_base)
        .replace(&format!("https://{backend_host_port}"), &external_base);
    rewritten.into_bytes()
}

/// Applies the rewrite to a raw (possibly gzip-encoded) response body. Large
/// bodies are rewritten with a plain scheme://host:port string substitution
/// rather than a full JSON parse, trading precision for staying off the
/// allocator for multi-megabyte metadata blobs. The result is always
/// uncompressed: callers must drop `Content-Encoding` and `Content-Length`.
fn rewrite_body(bytes: &[u8], gzipped: bool, backend_url: &str, external: &ExternalAddress) -> Vec<u8> {
    let raw = if gzipped { decompress_gzip(bytes).unwrap_or_else(|| bytes.to_vec()) } else { bytes.to_vec() };

    if raw.len() > SIZE_THRESHOLD_BYTES {
        return text_replace_fallback(&raw, backend_url, external);
    }

    match serde_json::from_slice::<Value>(&raw) {
        Ok(mut value) => {
            rewrite_metadata(&mut value, backend_url, external, 0);
            serde_json::to_vec(&value).unwrap_or(raw)
        },
        Err(_) => text_replace_fallback(&raw, backend_url, external),
    }
}

pub async fn handle(State(state): State<Arc<GatewayState>>, req: Request) -> Response<Body> {
    let (mut parts, body) = req.into_parts();
    let principal = match authenticate(&state, Protocol::Npm, &mut parts).await {
        Ok(p) => p,
        Err(e) => return e.into_response(Protocol::Npm),
    };
    if let Err(e) = check_rate_limit(&state, &principal.login) {
        return e.into_response(Protocol::Npm);
    }

    let Some((binding, _)) = state.bindings.get(&Protocol::Npm) else {
        return ProxyError::new(ErrorCode::InternalError, "npm not configured").into_response(Protocol::Npm);
    };
    let Some(backend) = binding.primary() else {
        return ProxyError::new(ErrorCode::InternalError, "no npm backend configured")
            .into_response(Protocol::Npm);
    };

    let external = reconstruct_external_address(&parts.headers, &parts.uri, true);

    let breaker = state.transport.breaker_for(backend);
    if matches!(breaker.try_admit(), Admission::Rejected) {
        return ProxyError::new(ErrorCode::BackendCircuitOpen, "backend circuit is open")
            .into_response(Protocol::Npm);
    }

    // The configured path prefix (e.g. "/npm/") is stripped before
    // forwarding, since the upstream registry is mounted at its own root.
    let binding_path_prefix = state
        .config
        .npm
        .as_ref()
        .and_then(|c| c.path_prefix.clone())
        .unwrap_or_default();
    let upstream_path = parts.uri.path().strip_prefix(&binding_path_prefix).unwrap_or(parts.uri.path());

    let client = state.transport.client_for(backend);
    let url = format!(
        "{}/{}{}",
        backend.url.trim_end_matches('/'),
        upstream_path.trim_start_matches('/'),
        parts.uri.query().map(|q| format!("?{q}")).unwrap_or_default()
    );

    let mut headers = parts.headers.clone();
    strip_hop_by_hop(&mut headers);
    if let Err(e) = apply_backend_auth(&mut headers, &backend.auth) {
        breaker.record_failure();
        return e.into_response(Protocol::Npm);
    }

    let method = match reqwest::Method::from_bytes(parts.method.as_str().as_bytes()) {
        Ok(m) => m,
        Err(e) => {
            breaker.record_failure();
            return ProxyError::new(ErrorCode::InternalError, e.to_string()).into_response(Protocol::Npm);
        },
    };

    let body_bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(b) => b,
        Err(e) => return ProxyError::new(ErrorCode::InternalError, e.to_string()).into_response(Protocol::Npm),
    };

    let resp = match client.request(method, &url).headers(headers).body(body_bytes).send().await {
        Ok(r) => r,
        Err(e) => {
            breaker.record_failure();
            return ProxyError::new(ErrorCode::BackendNetworkFailure, e.to_string())
                .into_response(Protocol::Npm);
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
    let gzipped = resp
        .headers()
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("gzip"))
        .unwrap_or(false);
    let mut out_headers = resp.headers().clone();

    if is_rewritable_content_type(&content_type) {
        let bytes = match resp.bytes().await {
            Ok(b) => b,
            Err(e) => return ProxyError::new(ErrorCode::BackendNetworkFailure, e.to_string())
                .into_response(Protocol::Npm),
        };
        let rewritten = rewrite_body(&bytes, gzipped, &backend.url, &external);
        strip_hop_by_hop(&mut out_headers);
        out_headers.remove(header::CONTENT_LENGTH);
        out_headers.remove(header::CONTENT_ENCODING);
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
    use serde_json::json;

    fn external() -> ExternalAddress {
        ExternalAddress { scheme: "https".into(), host: "gateway.example.com".into() }
    }

    #[test]
    fn rewrites_matching_tarball_urls() {
        let mut doc = json!({
            "name": "left-pad",
            "versions": {
                "1.0.0": {
                    "dist": {
                        "tarball": "https://registry.npmjs.org/left-pad/-/left-pad-1.0.0.tgz"
                    }
                }
            }
        });
        rewrite_metadata(&mut doc, "https://registry.npmjs.org", &external(), 0);
        let tarball = doc["versions"]["1.0.0"]["dist"]["tarball"].as_str().unwrap();
        assert!(tarball.starts_with("https://gateway.example.com"));
    }

    #[test]
    fn leaves_non_matching_host_untouched() {
        let mut doc = json!({ "url": "https://cdn.example.org/asset.tgz" });
        rewrite_metadata(&mut doc, "https://registry.npmjs.org", &external(), 0);
        assert_eq!(doc["url"], "https://cdn.example.org/asset.tgz");
    }

    #[test]
    fn rewrite_is_idempotent() {
        let mut doc = json!({ "dist": { "tarball": "https://registry.npmjs.org/a/-/a-1.0.0.tgz" } });
        rewrite_metadata(&mut doc, "https://registry.npmjs.org", &external(), 0);
        let once = doc.clone();
        rewrite_metadata(&mut doc, "https://registry.npmjs.org", &external(), 0);
        assert_eq!(doc, once);
    }

    #[test]
    fn host_port_handles_explicit_port() {
        assert_eq!(host_port("https://registry.example.com:4873/pkg").unwrap(), "registry.example.com:4873");
        assert_eq!(host_port("https://registry.example.com/pkg").unwrap(), "registry.example.com");
    }

    #[test]
    fn recognizes_rewritable_content_types() {
        assert!(is_rewritable_content_type("application/json; charset=utf-8"));
        assert!(is_rewritable_content_type("application/vnd.npm.install-v1+json"));
        assert!(is_rewritable_content_type("text/plain"));
        assert!(!is_rewritable_content_type("application/octet-stream"));
    }

    #[test]
    fn gzip_rewrite_emits_uncompressed_bytes() {
        use std::io::Write;
        let doc = json!({ "dist": { "tarball": "https://registry.npmjs.org/a/-/a-1.0.0.tgz" } });
        let raw = serde_json::to_vec(&doc).unwrap();
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&raw).unwrap();
        let gzipped_input = encoder.finish().unwrap();

        let out = rewrite_body(&gzipped_input, true, "https://registry.npmjs.org", &external());
        let value: Value = serde_json::from_slice(&out).expect("output is plain, uncompressed JSON");
        let tarball = value["dist"]["tarball"].as_str().unwrap();
        assert!(tarball.starts_with("https://gateway.example.com"));
    }

    #[test]
    fn unparseable_body_falls_back_to_text_replace() {
        let raw = b"<html>https://registry.npmjs.org/left-pad</html>".to_vec();
        let out = rewrite_body(&raw, false, "https://registry.npmjs.org", &external());
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("https://gateway.example.com/left-pad"));
    }

    #[test]
    fn url_fields_include_homepage_repository_and_bugs() {
        assert!(URL_FIELDS.contains(&"homepage"));
        assert!(URL_FIELDS.contains(&"repository"));
        assert!(URL_FIELDS.contains(&"bugs"));
    }
}
