//! Singleflight-coalesced, TTL-bounded cache of identity validation results.
//!
//! Concurrent lookups for the same credential digest share one in-flight
//! validation via `tokio::sync::OnceCell::get_or_init` — the cell itself is
//! the coalescing point, so no separate mutex or waiter list is needed.
//! Failures are never cached: a failed cell is removed immediately so the
//! next lookup gets a fresh attempt rather than a frozen error.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::sync::OnceCell;

use crate::error::ProxyError;
use crate::identity::provider::Principal;

/// Opaque cache key: the SHA-256 digest of the raw credential, so the
/// credential itself is never retained once the cache entry is built.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CredentialDigest([u8; 32]);

impl CredentialDigest {
    pub fn of(credential: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(credential.as_bytes());
        let out = hasher.finalize();
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&out);
        CredentialDigest(bytes)
    }
}

struct Entry {
    cell: Arc<OnceCell<Result<Principal, Arc<ProxyError>>>>,
    inserted_at: Instant,
}

#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub size: usize,
    pub hit_rate: f64,
}

pub struct IdentityCache {
    entries: DashMap<CredentialDigest, Entry>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl IdentityCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Resolves `digest`, running `validate` at most once per live cache
    /// entry even under concurrent callers. A negative result (`Err`) is
    /// evicted right away so it is never served to a later caller.
    pub async fn get_or_validate<F, Fut>(
        &self,
        digest: CredentialDigest,
        validate: F,
    ) -> Result<Principal, Arc<ProxyError>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Principal, ProxyError>>,
    {
        // `entry()` holds the shard lock for the match below, so the
        // freshness check and the possible replacement are atomic — two
        // racing first-time callers cannot each install their own OnceCell
        // and silently defeat the singleflight coalescing.
        use dashmap::mapref::entry::Entry as DashEntry;
        let cell = match self.entries.entry(digest.clone()) {
            DashEntry::Occupied(occupied) if occupied.get().inserted_at.elapsed() < self.ttl => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                occupied.get().cell.clone()
            },
            DashEntry::Occupied(mut occupied) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                let fresh = Entry { cell: Arc::new(OnceCell::new()), inserted_at: Instant::now() };
                let cell = fresh.cell.clone();
                occupied.insert(fresh);
                cell
            },
            DashEntry::Vacant(vacant) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                let fresh = Entry { cell: Arc::new(OnceCell::new()), inserted_at: Instant::now() };
                let cell = fresh.cell.clone();
                vacant.insert(fresh);
                cell
            },
        };

        let result = cell
            .get_or_init(|| async { validate().await.map_err(Arc::new) })
            .await
            .clone();

        if result.is_err() {
            self.entries.remove(&digest);
        }

        result
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            hits,
            misses,
            size: self.entries.len(),
            hit_rate: if total == 0 { 0.0 } else { hits as f64 / total as f64 },
        }
    }

    /// Drops entries whose TTL has elapsed. Intended to run on a periodic
    /// sweeper at roughly `2 * ttl` cadence so expired-but-unqueried entries
    /// don't linger indefinitely in memory.
    pub fn sweep_expired(&self) {
        let ttl = self.ttl;
        self.entries.retain(|_, entry| entry.inserted_at.elapsed() < ttl);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::provider::CredentialKind;
    use std::sync::atomic::AtomicUsize;

    fn test_principal(login: &str) -> Principal {
        Principal {
            login: login.into(),
            orgs: vec![],
            teams: vec![],
            credential_kind: CredentialKind::Pat,
            repository: None,
        }
    }

    #[tokio::test]
    async fn concurrent_lookups_coalesce_into_one_validation() {
        let cache = Arc::new(IdentityCache::new(Duration::from_secs(60)));
        let calls = Arc::new(AtomicUsize::new(0));
        let digest = CredentialDigest::of("token-a");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            let digest = digest.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_validate(digest, || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Ok(test_principal("alice"))
                    })
                    .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let cache = IdentityCache::new(Duration::from_secs(60));
        let digest = CredentialDigest::of("token-b");
        let first = cache
            .get_or_validate(digest.clone(), || async {
                Err(ProxyError::new(crate::error::ErrorCode::InsufficientPermissions, "no"))
            })
            .await;
        assert!(first.is_err());

        let second = cache.get_or_validate(digest, || async { Ok(test_principal("bob")) }).await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn expired_entries_are_revalidated() {
        let cache = IdentityCache::new(Duration::from_millis(5));
        let digest = CredentialDigest::of("token-c");
        cache
            .get_or_validate(digest.clone(), || async { Ok(test_principal("carol")) })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let calls = Arc::new(AtomicUsize::new(0));
        cache
            .get_or_validate(digest, || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(test_principal("carol"))
                }
            })
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
