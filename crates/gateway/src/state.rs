//! Shared, `Arc`-wrapped state handed to every axum handler.

use std::sync::Arc;

use crate::backend::ProtocolBinding;
use crate::config::GatewayConfig;
use crate::detect::{Detector, DetectorChain, Protocol};
use crate::identity::{AuthRequirement, GitHubIdentityProvider, IdentityCache, IdentityProvider};
use crate::metrics::Metrics;
use crate::ratelimit::{ConcurrencyLimiter, RateLimiter, RateLimiterConfig};
use crate::transport::TransportPool;

pub struct GatewayState {
    pub config: GatewayConfig,
    pub detectors: DetectorChain,
    pub bindings: std::collections::HashMap<Protocol, (ProtocolBinding, AuthRequirement)>,
    pub identity_cache: IdentityCache,
    pub identity_provider: Arc<dyn IdentityProvider>,
    pub rate_limiter: RateLimiter,
    pub concurrency: ConcurrencyLimiter,
    pub transport: TransportPool,
    pub metrics: Metrics,
}

impl GatewayState {
    pub fn new(config: GatewayConfig) -> Arc<Self> {
        let mut detectors = Vec::new();
        let mut bindings = std::collections::HashMap::new();

        for (protocol, section) in [
            (Protocol::Oci, &config.oci),
            (Protocol::Maven, &config.maven),
            (Protocol::Npm, &config.npm),
        ] {
            if let Some(section) = section {
                detectors.push(Detector {
                    protocol,
                    host: section.host.clone(),
                    path_prefix: section.path_prefix.clone(),
                    priority: section.priority,
                });
                bindings.insert(
                    protocol,
                    (
                        ProtocolBinding { protocol, backends: section.backends.clone() },
                        AuthRequirement {
                            required_org: section.requirement.required_org.clone(),
                            required_teams: section.requirement.required_teams.clone(),
                        },
                    ),
                );
            }
        }

        let identity_cache_ttl = config.identity_cache_ttl;
        let rate_limit = RateLimiterConfig {
            global_rate: config.rate_limit.global_rate,
            global_burst: config.rate_limit.global_burst,
            per_user_rate: config.rate_limit.per_user_rate,
            per_user_burst: config.rate_limit.per_user_burst,
            idle_eviction: identity_cache_ttl * 2,
        };
        let max_concurrency = config.max_concurrency;
        let identity_provider = Arc::new(GitHubIdentityProvider::new(
            config.github_rate_limit_per_second,
            config.github_rate_limit_burst,
        ));

        Arc::new(Self {
            config,
            detectors: DetectorChain::new(detectors),
            bindings,
            identity_cache: IdentityCache::new(identity_cache_ttl),
            identity_provider,
            rate_limiter: RateLimiter::new(rate_limit),
            concurrency: ConcurrencyLimiter::new(max_concurrency),
            transport: TransportPool::new(),
            metrics: Metrics::new(),
        })
    }

    /// Spawns the periodic sweepers for the identity cache and rate limiter,
    /// at roughly `2 * ttl` cadence so expired state doesn't accumulate
    /// between requests.
    pub fn spawn_sweepers(self: &Arc<Self>) {
        let state = self.clone();
        let interval = state.config.identity_cache_ttl * 2;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(std::time::Duration::from_secs(1)));
            loop {
                ticker.tick().await;
                state.identity_cache.sweep_expired();
                state.rate_limiter.sweep_idle();
            }
        });
    }
}
