//! YAML configuration with `${VAR}` environment expansion, plus the
//! validation rules that keep protocol bindings internally consistent.

use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use secrecy::SecretString;
use serde::Deserialize;

use crate::backend::{BackendAuth, BackendDescriptor, BreakerParams, OciBackendExtra, PoolParams};
use crate::identity::AuthRequirement;

#[derive(Debug, Deserialize)]
pub struct RawConfig {
    pub server: ServerConfig,
    pub github: GitHubConfig,
    pub protocols: ProtocolsConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub bind: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

fn default_request_timeout_secs() -> u64 {
    60
}
fn default_max_concurrency() -> usize {
    512
}

#[derive(Debug, Deserialize)]
pub struct GitHubConfig {
    #[serde(default = "default_identity_cache_ttl_secs")]
    pub identity_cache_ttl_secs: u64,
    /// Token-bucket buffer in front of outbound GitHub API calls made during
    /// credential validation, independent of the gateway's own inbound rate
    /// limiter.
    #[serde(default = "default_github_rate_limit_per_second")]
    pub rate_limit_per_second: f64,
    #[serde(default = "default_github_rate_limit_burst")]
    pub rate_limit_burst: f64,
}

fn default_identity_cache_ttl_secs() -> u64 {
    300
}

fn default_github_rate_limit_per_second() -> f64 {
    crate::identity::provider::DEFAULT_GITHUB_RATE_LIMIT_PER_SECOND
}
fn default_github_rate_limit_burst() -> f64 {
    crate::identity::provider::DEFAULT_GITHUB_RATE_LIMIT_BURST
}

#[derive(Debug, Deserialize, Default)]
pub struct ProtocolsConfig {
    #[serde(default)]
    pub oci: Option<RawProtocolSection>,
    #[serde(default)]
    pub maven: Option<RawProtocolSection>,
    #[serde(default)]
    pub npm: Option<RawProtocolSection>,
}

#[derive(Debug, Deserialize)]
pub struct RawProtocolSection {
    pub host: Option<String>,
    pub path_prefix: Option<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub required_org: Option<String>,
    #[serde(default)]
    pub required_teams: Vec<String>,
    pub backends: Vec<RawBackend>,
}

#[derive(Debug, Deserialize)]
pub struct RawBackend {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub auth: RawBackendAuth,
    #[serde(default)]
    pub pool_max_idle_per_host: Option<usize>,
    #[serde(default)]
    pub connect_timeout_secs: Option<u64>,
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
    #[serde(default)]
    pub failure_threshold: Option<f64>,
    #[serde(default)]
    pub breaker_window_secs: Option<u64>,
    #[serde(default)]
    pub minimum_requests: Option<u32>,
    #[serde(default)]
    pub open_timeout_secs: Option<u64>,
    #[serde(default)]
    pub half_open_max_requests: Option<u32>,
    #[serde(default)]
    pub upstream_namespace: Option<String>,
    #[serde(default)]
    pub add_library_prefix: bool,
    #[serde(default)]
    pub scope: Vec<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RawBackendAuth {
    #[default]
    None,
    Basic {
        username: String,
        password: String,
    },
    Bearer {
        token: String,
    },
    CustomHeader {
        name: String,
        value: String,
    },
}

#[derive(Debug, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_global_rate")]
    pub global_rate: f64,
    #[serde(default = "default_global_burst")]
    pub global_burst: f64,
    #[serde(default = "default_per_user_rate")]
    pub per_user_rate: f64,
    #[serde(default = "default_per_user_burst")]
    pub per_user_burst: f64,
}

fn default_global_rate() -> f64 {
    200.0
}
fn default_global_burst() -> f64 {
    400.0
}
fn default_per_user_rate() -> f64 {
    10.0
}
fn default_per_user_burst() -> f64 {
    30.0
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            global_rate: default_global_rate(),
            global_burst: default_global_burst(),
            per_user_rate: default_per_user_rate(),
            per_user_burst: default_per_user_burst(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_format")]
    pub format: String,
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

fn default_log_format() -> String {
    "json".to_string()
}
fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { format: default_log_format(), filter: default_log_filter() }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("{0}")]
    Invalid(String),
}

static ENV_VAR_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap());

/// Expands `${VAR}` references against the process environment. A reference
/// to an unset variable is left untouched rather than erroring, since some
/// deployments intentionally template a config file that also works
/// unexpanded in local development.
pub fn expand_env(raw: &str) -> String {
    ENV_VAR_PATTERN
        .replace_all(raw, |caps: &regex::Captures| {
            let name = &caps[1];
            std::env::var(name).unwrap_or_else(|_| caps[0].to_string())
        })
        .into_owned()
}

#[derive(Debug)]
pub struct GatewayConfig {
    pub bind: String,
    pub request_timeout: Duration,
    pub max_concurrency: usize,
    pub identity_cache_ttl: Duration,
    pub github_rate_limit_per_second: f64,
    pub github_rate_limit_burst: f64,
    pub rate_limit: RateLimitConfig,
    pub logging: LoggingConfig,
    pub metrics_enabled: bool,
    pub oci: Option<ProtocolConfig>,
    pub maven: Option<ProtocolConfig>,
    pub npm: Option<ProtocolConfig>,
}

#[derive(Debug)]
pub struct ProtocolConfig {
    pub host: Option<String>,
    pub path_prefix: Option<String>,
    pub priority: i32,
    pub requirement: AuthRequirement,
    pub backends: Vec<BackendDescriptor>,
}

impl GatewayConfig {
    pub fn from_yaml(raw_yaml: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env(raw_yaml);
        let raw: RawConfig = serde_yaml::from_str(&expanded)?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        let oci = raw.protocols.oci.map(convert_section).transpose()?;
        let maven = raw.protocols.maven.map(convert_section).transpose()?;
        let npm = raw.protocols.npm.map(convert_section).transpose()?;

        if oci.is_none() && maven.is_none() && npm.is_none() {
            return Err(ConfigError::Invalid("at least one protocol must be configured".into()));
        }

        for section in [&oci, &maven, &npm].into_iter().flatten() {
            if section.requirement.required_org.is_none() && !section.requirement.required_teams.is_empty()
            {
                return Err(ConfigError::Invalid(
                    "required_teams cannot be set without required_org".into(),
                ));
            }
            if let Some(prefix) = &section.path_prefix
                && !prefix.starts_with('/')
            {
                return Err(ConfigError::Invalid(format!("path_prefix {prefix:?} must start with /")));
            }
        }

        let mut seen_prefixes = Vec::new();
        for section in [&oci, &maven, &npm].into_iter().flatten() {
            if let Some(prefix) = &section.path_prefix {
                if seen_prefixes.contains(prefix) {
                    return Err(ConfigError::Invalid(format!("duplicate path_prefix {prefix:?}")));
                }
                seen_prefixes.push(prefix.clone());
            }
        }

        Ok(GatewayConfig {
            bind: raw.server.bind,
            request_timeout: Duration::from_secs(raw.server.request_timeout_secs),
            max_concurrency: raw.server.max_concurrency,
            identity_cache_ttl: Duration::from_secs(raw.github.identity_cache_ttl_secs),
            github_rate_limit_per_second: raw.github.rate_limit_per_second,
            github_rate_limit_burst: raw.github.rate_limit_burst,
            rate_limit: raw.rate_limit,
            logging: raw.logging,
            metrics_enabled: raw.metrics.enabled,
            oci,
            maven,
            npm,
        })
    }
}

fn convert_section(raw: RawProtocolSection) -> Result<ProtocolConfig, ConfigError> {
    if raw.host.is_none() && raw.path_prefix.is_none() {
        return Err(ConfigError::Invalid("protocol section needs host or path_prefix".into()));
    }
    if raw.backends.is_empty() {
        return Err(ConfigError::Invalid("protocol section needs at least one backend".into()));
    }
    let backends = raw.backends.into_iter().map(convert_backend).collect::<Result<_, _>>()?;
    Ok(ProtocolConfig {
        host: raw.host,
        path_prefix: raw.path_prefix,
        priority: raw.priority,
        requirement: AuthRequirement { required_org: raw.required_org, required_teams: raw.required_teams },
        backends,
    })
}

fn convert_backend(raw: RawBackend) -> Result<BackendDescriptor, ConfigError> {
    let auth = match raw.auth {
        RawBackendAuth::None => BackendAuth::None,
        RawBackendAuth::Basic { username, password } => {
            BackendAuth::Basic { username, password: SecretString::from(password) }
        },
        RawBackendAuth::Bearer { token } => BackendAuth::Bearer { token: SecretString::from(token) },
        RawBackendAuth::CustomHeader { name, value } => {
            BackendAuth::CustomHeader { name, value: SecretString::from(value) }
        },
    };

    let mut pool = PoolParams::default();
    if let Some(v) = raw.pool_max_idle_per_host {
        pool.pool_max_idle_per_host = v;
    }
    if let Some(v) = raw.connect_timeout_secs {
        pool.connect_timeout = Duration::from_secs(v);
    }
    if let Some(v) = raw.request_timeout_secs {
        pool.request_timeout = Duration::from_secs(v);
    }

    let mut breaker = BreakerParams::default();
    if let Some(v) = raw.failure_threshold {
        breaker.failure_threshold = v;
    }
    if let Some(v) = raw.breaker_window_secs {
        breaker.window = Duration::from_secs(v);
    }
    if let Some(v) = raw.minimum_requests {
        breaker.minimum_requests = v;
    }
    if let Some(v) = raw.open_timeout_secs {
        breaker.open_timeout = Duration::from_secs(v);
    }
    if let Some(v) = raw.half_open_max_requests {
        breaker.half_open_max_requests = v;
    }

    Ok(BackendDescriptor {
        name: raw.name,
        url: raw.url,
        auth,
        pool,
        breaker,
        oci: OciBackendExtra {
            upstream_namespace: raw.upstream_namespace,
            add_library_prefix: raw.add_library_prefix,
            scope: raw.scope,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_known_env_var() {
        // SAFETY: test-local env mutation, not shared across threads in this crate's test binary.
        unsafe { std::env::set_var("GATEWAY_TEST_TOKEN", "secret123") };
        let out = expand_env("token: ${GATEWAY_TEST_TOKEN}");
        assert_eq!(out, "token: secret123");
        unsafe { std::env::remove_var("GATEWAY_TEST_TOKEN") };
    }

    #[test]
    fn leaves_unset_var_reference_untouched() {
        let out = expand_env("token: ${GATEWAY_DEFINITELY_UNSET_VAR}");
        assert_eq!(out, "token: ${GATEWAY_DEFINITELY_UNSET_VAR}");
    }

    const MINIMAL_YAML: &str = r#"
server:
  bind: "0.0.0.0:8080"
github:
  identity_cache_ttl_secs: 300
protocols:
  oci:
    path_prefix: "/v2/"
    required_org: "acme"
    backends:
      - name: primary
        url: "https://registry-1.docker.io"
"#;

    #[test]
    fn parses_minimal_config() {
        let config = GatewayConfig::from_yaml(MINIMAL_YAML).unwrap();
        assert!(config.oci.is_some());
        assert!(config.maven.is_none());
    }

    #[test]
    fn rejects_required_teams_without_required_org() {
        let yaml = r#"
server:
  bind: "0.0.0.0:8080"
github:
  identity_cache_ttl_secs: 300
protocols:
  oci:
    path_prefix: "/v2/"
    required_teams: ["platform"]
    backends:
      - name: primary
        url: "https://registry-1.docker.io"
"#;
        let err = GatewayConfig::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_path_prefix_without_leading_slash() {
        let yaml = r#"
server:
  bind: "0.0.0.0:8080"
github:
  identity_cache_ttl_secs: 300
protocols:
  oci:
    path_prefix: "v2/"
    backends:
      - name: primary
        url: "https://registry-1.docker.io"
"#;
        let err = GatewayConfig::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
