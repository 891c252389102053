//! Header redaction for the structured access log.
//!
//! The caller's credential must never reach a log line. This module owns the
//! fixed, case-insensitive deny-list of header names the logging middleware
//! scrubs before emitting a record.

use http::HeaderMap;

/// Header names that are never emitted verbatim in a log line or metric
/// label, regardless of case.
const SENSITIVE_HEADERS: &[&str] = &[
    "authorization",
    "cookie",
    "set-cookie",
    "x-auth-token",
    "x-api-key",
    "proxy-authorization",
    "x-csrf-token",
    "x-session-token",
];

/// Returns true if `name` (compared case-insensitively) must be scrubbed.
pub fn is_sensitive_header(name: &str) -> bool {
    SENSITIVE_HEADERS
        .iter()
        .any(|candidate| candidate.eq_ignore_ascii_case(name))
}

/// Renders a header map into `(name, value)` pairs suitable for a log record,
/// replacing the value of every sensitive header with `"[redacted]"`.
pub fn redact_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            let name = name.as_str().to_string();
            if is_sensitive_header(&name) {
                (name, "[redacted]".to_string())
            } else {
                let value = value.to_str().unwrap_or("[non-utf8]").to_string();
                (name, value)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn sensitive_names_match_case_insensitively() {
        assert!(is_sensitive_header("Authorization"));
        assert!(is_sensitive_header("AUTHORIZATION"));
        assert!(is_sensitive_header("x-api-key"));
        assert!(!is_sensitive_header("x-request-id"));
    }

    #[test]
    fn redact_headers_scrubs_sensitive_values_only() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer secret"));
        headers.insert("x-request-id", HeaderValue::from_static("abc-123"));
        let rendered = redact_headers(&headers);
        let auth = rendered.iter().find(|(n, _)| n == "authorization").unwrap();
        assert_eq!(auth.1, "[redacted]");
        let rid = rendered.iter().find(|(n, _)| n == "x-request-id").unwrap();
        assert_eq!(rid.1, "abc-123");
    }
}
