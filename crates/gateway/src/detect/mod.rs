//! Protocol detection: decides whether an inbound request is OCI Distribution,
//! Maven, or npm traffic, from the reconstructed external host, the request
//! path, and (as a fallback) protocol-specific content signals.

use axum::http::{HeaderMap, Uri};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Oci,
    Maven,
    Npm,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Oci => "oci",
            Protocol::Maven => "maven",
            Protocol::Npm => "npm",
        }
    }
}

/// A single protocol's detection rule: an optional host match and an
/// optional path-prefix match. At least one of the two must be configured;
/// `matches` requires every configured criterion to hold.
#[derive(Debug, Clone)]
pub struct Detector {
    pub protocol: Protocol,
    pub host: Option<String>,
    pub path_prefix: Option<String>,
    /// Higher priority wins when more than one detector matches.
    pub priority: i32,
}

impl Detector {
    pub fn matches(&self, host: Option<&str>, path: &str) -> bool {
        let host_ok = match &self.host {
            Some(expected) => host.is_some_and(|h| h.eq_ignore_ascii_case(expected)),
            None => true,
        };
        let path_ok = match &self.path_prefix {
            Some(prefix) => path.starts_with(prefix.as_str()),
            None => true,
        };
        host_ok && path_ok && (self.host.is_some() || self.path_prefix.is_some())
    }
}

/// Request-level signals consulted only when no detector's host/path-prefix
/// criteria conclusively match a configured protocol.
#[derive(Debug, Clone, Copy, Default)]
pub struct DetectionContext<'a> {
    pub content_type: Option<&'a str>,
    pub user_agent: Option<&'a str>,
}

const MAVEN_EXTENSIONS: &[&str] = &[".jar", ".pom", ".war", ".aar", ".module", ".sha1", ".md5"];
const MAVEN_USER_AGENTS: &[&str] = &["maven", "gradle", "sbt"];
const NPM_USER_AGENTS: &[&str] = &["npm", "yarn", "pnpm"];
const NPM_INSTALL_MEDIA_TYPE: &str = "application/vnd.npm.install-v1+json";
const DOCKER_DISTRIBUTION_MEDIA_TYPE_MARKERS: &[&str] = &["vnd.docker.distribution", "vnd.oci.image"];

/// Falls back to protocol-specific signals when host/path-prefix binding is
/// absent or didn't match: media types, user agents, and path shapes
/// characteristic of each protocol's clients.
fn signal_matches(protocol: Protocol, path: &str, ctx: DetectionContext<'_>) -> bool {
    let content_type = ctx.content_type.unwrap_or("").to_ascii_lowercase();
    let user_agent = ctx.user_agent.unwrap_or("").to_ascii_lowercase();

    match protocol {
        Protocol::Oci => {
            path.starts_with("/v2")
                || DOCKER_DISTRIBUTION_MEDIA_TYPE_MARKERS.iter().any(|m| content_type.contains(m))
        },
        Protocol::Maven => {
            MAVEN_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
                || path.ends_with("maven-metadata.xml")
                || MAVEN_USER_AGENTS.iter().any(|ua| user_agent.contains(ua))
                || is_maven_shaped_path(path)
        },
        Protocol::Npm => {
            path.starts_with("/-/")
                || path.trim_start_matches('/').starts_with('@')
                || content_type.contains(NPM_INSTALL_MEDIA_TYPE)
                || (NPM_USER_AGENTS.iter().any(|ua| user_agent.contains(ua)) && is_plausible_package_path(path))
        },
    }
}

/// A Maven-shaped path is at least `group/artifact/version/file`: three or
/// more slash-separated segments ending in a filename with an extension.
fn is_maven_shaped_path(path: &str) -> bool {
    let segments: Vec<&str> = path.trim_start_matches('/').split('/').filter(|s| !s.is_empty()).collect();
    segments.len() >= 4 && segments.last().is_some_and(|last| last.contains('.'))
}

/// A plausible npm package path has at least one non-empty segment after the
/// leading slash and isn't obviously something else (no `..`).
fn is_plausible_package_path(path: &str) -> bool {
    let trimmed = path.trim_start_matches('/');
    !trimmed.is_empty() && !trimmed.contains("..")
}

/// Ordered collection of detectors, evaluated highest-priority-first.
#[derive(Debug, Clone, Default)]
pub struct DetectorChain {
    detectors: Vec<Detector>,
}

impl DetectorChain {
    pub fn new(mut detectors: Vec<Detector>) -> Self {
        detectors.sort_by(|a, b| b.priority.cmp(&a.priority));
        Self { detectors }
    }

    /// Tries host/path-prefix matching first; if nothing matches, falls back
    /// to protocol-specific signals for each configured protocol, in the same
    /// priority order.
    pub fn detect(&self, host: Option<&str>, path: &str, ctx: DetectionContext<'_>) -> Option<Protocol> {
        if let Some(d) = self.detectors.iter().find(|d| d.matches(host, path)) {
            return Some(d.protocol);
        }
        self.detectors.iter().find(|d| signal_matches(d.protocol, path, ctx)).map(|d| d.protocol)
    }
}

/// The externally-visible host/scheme pair a request was addressed to,
/// reconstructed from forwarding headers so detection and rewrite logic see
/// what the client actually typed rather than this process's bind address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalAddress {
    pub scheme: String,
    pub host: String,
}

impl ExternalAddress {
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.scheme, self.host)
    }
}

/// Takes the leftmost value of a comma-separated forwarding header, trimmed
/// of surrounding whitespace — the convention for `X-Forwarded-*` headers,
/// where each proxy hop appends its own value and the first entry is the one
/// the original client actually saw.
fn leftmost(value: &str) -> &str {
    value.split(',').next().unwrap_or(value).trim()
}

/// Resolution order: `Forwarded` (RFC 7239) first, then the `X-Forwarded-*`
/// pair, then the request's own `Host` header and the transport's scheme.
/// When no scheme can be determined, or the forwarded scheme isn't literally
/// `http` or `https`, defaults to `https` — a misdetected scheme should fail
/// safe toward the secure assumption rather than silently downgrading
/// credentials to plaintext.
pub fn reconstruct_external_address(
    headers: &HeaderMap,
    uri: &Uri,
    transport_is_tls: bool,
) -> ExternalAddress {
    let _ = transport_is_tls;

    if let Some(forwarded) = headers.get("forwarded").and_then(|v| v.to_str().ok())
        && let Some(addr) = parse_forwarded(forwarded)
    {
        return addr;
    }

    let host = headers
        .get("x-forwarded-host")
        .and_then(|v| v.to_str().ok())
        .map(leftmost)
        .map(str::to_string)
        .or_else(|| headers.get("host").and_then(|v| v.to_str().ok()).map(str::to_string))
        .or_else(|| uri.host().map(str::to_string))
        .unwrap_or_else(|| "unknown".to_string());

    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .map(leftmost)
        .filter(|v| *v == "http" || *v == "https")
        .map(str::to_string)
        .unwrap_or_else(|| "https".to_string());

    ExternalAddress { scheme, host }
}

fn parse_forwarded(value: &str) -> Option<ExternalAddress> {
    // Only the first hop's entry is authoritative for what the client sent.
    let first = value.split(',').next()?;
    let mut host = None;
    let mut proto = None;
    for pair in first.split(';') {
        let mut parts = pair.trim().splitn(2, '=');
        let key = parts.next()?.trim().to_ascii_lowercase();
        let val = parts.next()?.trim().trim_matches('"').to_string();
        match key.as_str() {
            "host" => host = Some(val),
            "proto" => proto = Some(val),
            _ => {},
        }
    }
    let host = host?;
    let scheme = proto.unwrap_or_else(|| "https".to_string());
    Some(ExternalAddress { scheme, host })
}
