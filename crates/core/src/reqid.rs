//! `X-Request-ID` extraction/generation, echoed back on every response.

use std::fmt;

use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestId(String);

impl RequestId {
    /// Uses the inbound header value when present and non-empty, otherwise
    /// mints a fresh v4 UUID.
    pub fn from_header_or_generate(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(v) if !v.is_empty() => RequestId(v.to_string()),
            _ => RequestId(Uuid::new_v4().to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_when_absent() {
        let id = RequestId::from_header_or_generate(None);
        assert!(!id.as_str().is_empty());
    }

    #[test]
    fn echoes_supplied_value() {
        let id = RequestId::from_header_or_generate(Some("abc-123"));
        assert_eq!(id.as_str(), "abc-123");
    }

    #[test]
    fn generates_when_blank() {
        let id = RequestId::from_header_or_generate(Some("   "));
        assert_ne!(id.as_str(), "   ");
    }
}
