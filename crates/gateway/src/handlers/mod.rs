pub mod maven;
pub mod npm;
pub mod oci;

use std::sync::Arc;

use axum::http::request::Parts;
use secrecy::ExposeSecret;

use crate::detect::Protocol;
use crate::error::ProxyError;
use crate::identity::{CredentialDigest, Principal, extract_credential};
use crate::middleware::rate_limit_error;
use crate::state::GatewayState;

/// Resolves the caller's principal for `protocol`: extracts a credential,
/// classifies its shape, validates it (via the coalesced cache) against the
/// protocol's configured org/team requirement, then checks it against the
/// rate limiter.
pub async fn authenticate(
    state: &Arc<GatewayState>,
    protocol: Protocol,
    parts: &mut Parts,
) -> Result<Principal, ProxyError> {
    let extracted = extract_credential(parts).await?;
    let (_, requirement) = state
        .bindings
        .get(&protocol)
        .ok_or_else(|| ProxyError::new(crate::error::ErrorCode::InternalError, "protocol not configured"))?;

    let digest = CredentialDigest::of(extracted.credential.expose_secret());
    let provider = state.identity_provider.clone();
    let credential = extracted.credential.clone();
    let shape = extracted.shape;
    let requirement = requirement.clone();

    state
        .identity_cache
        .get_or_validate(digest, move || async move {
            provider.validate(&credential, shape, &requirement).await
        })
        .await
        .map_err(|arc_err| ProxyError::new(arc_err.code, arc_err.message.clone()))
}

/// Checks the global and per-user token buckets for `principal`, translating
/// a rejection into the appropriately-coded error.
pub fn check_rate_limit(state: &Arc<GatewayState>, principal: &str) -> Result<(), ProxyError> {
    state.rate_limiter.check(principal).map_err(rate_limit_error)
}
