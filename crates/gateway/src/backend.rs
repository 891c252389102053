//! Static description of a proxied upstream: how to reach it, how to
//! authenticate to it, and (for OCI) how its namespace maps onto ours.

use secrecy::SecretString;
use std::time::Duration;

use crate::detect::Protocol;

#[derive(Debug, Clone)]
pub enum BackendAuth {
    None,
    Basic { username: String, password: SecretString },
    Bearer { token: SecretString },
    /// An arbitrary header injected verbatim, e.g. a registry-specific
    /// `X-JFrog-Art-Api` key.
    CustomHeader { name: String, value: SecretString },
}

#[derive(Debug, Clone)]
pub struct PoolParams {
    pub pool_max_idle_per_host: usize,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for PoolParams {
    fn default() -> Self {
        Self {
            pool_max_idle_per_host: 32,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerParams {
    pub failure_threshold: f64,
    pub window: Duration,
    pub minimum_requests: u32,
    pub open_timeout: Duration,
    pub half_open_max_requests: u32,
}

impl Default for BreakerParams {
    fn default() -> Self {
        Self {
            failure_threshold: 0.5,
            window: Duration::from_secs(30),
            minimum_requests: 3,
            open_timeout: Duration::from_secs(30),
            half_open_max_requests: 1,
        }
    }
}

/// OCI-specific cascading-pull configuration: where in this backend's own
/// namespace our repository path lands, and which orgs it is eligible to
/// serve.
#[derive(Debug, Clone, Default)]
pub struct OciBackendExtra {
    /// Prefix prepended to the repository path when forwarding upstream,
    /// e.g. mapping `foo/bar` to `mirror/foo/bar`.
    pub upstream_namespace: Option<String>,
    /// Docker Hub convention: single-segment repository names get `library/`
    /// inserted ahead of them.
    pub add_library_prefix: bool,
    /// Orgs this backend is eligible to serve; empty means "all orgs".
    pub scope: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct BackendDescriptor {
    pub name: String,
    pub url: String,
    pub auth: BackendAuth,
    pub pool: PoolParams,
    pub breaker: BreakerParams,
    pub oci: OciBackendExtra,
}

/// Binds a set of backends to the protocol they serve. OCI may cascade
/// across several ordered backends; Maven and npm proxy to exactly one.
#[derive(Debug, Clone)]
pub struct ProtocolBinding {
    pub protocol: Protocol,
    pub backends: Vec<BackendDescriptor>,
}

/// Scope wildcard accepting any org, alongside an explicit scope list.
const SCOPE_WILDCARD: &str = "*";

impl ProtocolBinding {
    /// Returns this binding's OCI pull cascade, filtered to backends eligible
    /// for `org` (the org parsed from the request path), in configured
    /// order. A backend with a non-empty `scope` must list `"*"` or `org`
    /// explicitly; a backend with an empty `scope` defers to the binding's
    /// globally required org, if one is configured, and is otherwise
    /// eligible for any org.
    pub fn eligible_oci_backends<'a>(
        &'a self,
        org: &str,
        required_org: Option<&str>,
    ) -> Vec<&'a BackendDescriptor> {
        self.backends
            .iter()
            .filter(|b| {
                if b.oci.scope.is_empty() {
                    required_org.map(|required| required == org).unwrap_or(true)
                } else {
                    b.oci.scope.iter().any(|s| s == SCOPE_WILDCARD || s == org)
                }
            })
            .collect()
    }

    pub fn primary(&self) -> Option<&BackendDescriptor> {
        self.backends.first()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(name: &str, scope: Vec<&str>) -> BackendDescriptor {
        BackendDescriptor {
            name: name.to_string(),
            url: format!("https://{name}.example.com"),
            auth: BackendAuth::None,
            pool: PoolParams::default(),
            breaker: BreakerParams::default(),
            oci: OciBackendExtra {
                scope: scope.into_iter().map(str::to_string).collect(),
                ..Default::default()
            },
        }
    }

    #[test]
    fn unscoped_backend_is_eligible_for_any_org() {
        let binding = ProtocolBinding { protocol: Protocol::Oci, backends: vec![backend("mirror", vec![])] };
        assert_eq!(binding.eligible_oci_backends("acme", None).len(), 1);
    }

    #[test]
    fn scoped_backend_filters_by_org() {
        let binding = ProtocolBinding {
            protocol: Protocol::Oci,
            backends: vec![backend("internal", vec!["acme"]), backend("public", vec![])],
        };
        assert_eq!(binding.eligible_oci_backends("acme", None).len(), 2);
        assert_eq!(binding.eligible_oci_backends("other", None).len(), 1);
    }

    #[test]
    fn wildcard_scope_matches_any_org() {
        let binding =
            ProtocolBinding { protocol: Protocol::Oci, backends: vec![backend("mirror", vec!["*"])] };
        assert_eq!(binding.eligible_oci_backends("acme", None).len(), 1);
        assert_eq!(binding.eligible_oci_backends("other", None).len(), 1);
    }

    #[test]
    fn unscoped_backend_honors_globally_required_org() {
        let binding = ProtocolBinding { protocol: Protocol::Oci, backends: vec![backend("mirror", vec![])] };
        assert_eq!(binding.eligible_oci_backends("acme", Some("acme")).len(), 1);
        assert_eq!(binding.eligible_oci_backends("other", Some("acme")).len(), 0);
    }
}
