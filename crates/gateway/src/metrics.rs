//! Prometheus metrics registry.

use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

#[derive(Debug, Clone, PartialEq, Eq, Hash, EncodeLabelSet)]
pub struct BackendLabel {
    pub backend: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, EncodeLabelSet)]
pub struct ProtocolLabel {
    pub protocol: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EncodeLabelValue)]
pub enum Outcome {
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, EncodeLabelSet)]
pub struct RequestLabel {
    pub protocol: String,
    pub outcome: Outcome,
}

pub struct Metrics {
    registry: Registry,
    pub breaker_state: Family<BackendLabel, Gauge>,
    pub requests_total: Family<RequestLabel, Counter>,
    pub identity_cache_hits: Counter,
    pub identity_cache_misses: Counter,
    pub rate_limit_rejections: Family<ProtocolLabel, Counter>,
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let breaker_state = Family::<BackendLabel, Gauge>::default();
        registry.register(
            "backend_circuit_breaker_state",
            "Circuit breaker state per backend: 0=closed, 1=open, 2=half-open",
            breaker_state.clone(),
        );

        let requests_total = Family::<RequestLabel, Counter>::default();
        registry.register(
            "proxy_requests_total",
            "Total proxied requests by protocol and outcome",
            requests_total.clone(),
        );

        let identity_cache_hits = Counter::default();
        registry.register("identity_cache_hits_total", "Identity cache hits", identity_cache_hits.clone());

        let identity_cache_misses = Counter::default();
        registry.register(
            "identity_cache_misses_total",
            "Identity cache misses",
            identity_cache_misses.clone(),
        );

        let rate_limit_rejections = Family::<ProtocolLabel, Counter>::default();
        registry.register(
            "rate_limit_rejections_total",
            "Requests rejected by the rate limiter, by protocol",
            rate_limit_rejections.clone(),
        );

        Self {
            registry,
            breaker_state,
            requests_total,
            identity_cache_hits,
            identity_cache_misses,
            rate_limit_rejections,
        }
    }

    pub fn encode(&self) -> String {
        let mut buf = String::new();
        encode(&mut buf, &self.registry).expect("metrics encode");
        buf
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_registered_families() {
        let metrics = Metrics::new();
        metrics
            .breaker_state
            .get_or_create(&BackendLabel { backend: "primary".into() })
            .set(1);
        let text = metrics.encode();
        assert!(text.contains("backend_circuit_breaker_state"));
    }
}
