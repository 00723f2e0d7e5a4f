//! Time-bounded in-memory secret cache using [`moka`].
//!
//! A [`SecretCache`] maps a vault id to a secret string.  Expiry is
//! *sliding*: every hit and every put restarts the entry's idle clock, and an
//! entry left idle for longer than the TTL is never returned again.  moka
//! evicts such entries lazily during its housekeeping; there is no
//! background sweeper thread of our own.
//!
//! The caches are unbounded.  A size bound would let moka's admission
//! policy reject or evict a fresh `put`, and a `put` must always be
//! readable back until it expires or is removed.
//!
//! Two independent instances exist per broker, bundled in [`BrokerCaches`]:
//! one for derived (PBKDF) passwords and one for decrypted vault passwords.
//! A derived password and a vault password for the same vault id are
//! unrelated entries and expire independently.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use secrecy::{ExposeSecret, SecretString};
use tracing::debug;

/// Default idle time-to-live of a cached secret (one hour).
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60 * 60);

// ── cache stats ──────────────────────────────────────────────────────

/// Counters tracking cache effectiveness.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheStats {
    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hits={} misses={}", self.hits(), self.misses())
    }
}

// ── secret cache ─────────────────────────────────────────────────────

/// Concurrent, sliding-expiry map from vault id to secret.
///
/// Cloning is cheap and yields a handle to the same entries.
#[derive(Clone)]
pub struct SecretCache {
    name: &'static str,
    ttl: Duration,
    inner: Cache<String, Arc<SecretString>>,
    stats: Arc<CacheStats>,
}

impl SecretCache {
    /// Start building a new cache.
    pub fn builder(name: &'static str) -> SecretCacheBuilder {
        SecretCacheBuilder {
            name,
            ttl: DEFAULT_CACHE_TTL,
        }
    }

    /// A cache with the given idle TTL.
    pub fn new(name: &'static str, ttl: Duration) -> Self {
        Self::builder(name).ttl(ttl).build()
    }

    /// Look up `key`.  A hit restarts the entry's idle clock.
    pub async fn get(&self, key: &str) -> Option<SecretString> {
        match self.inner.get(key).await {
            Some(secret) => {
                self.stats.record_hit();
                debug!(cache = self.name, key = key, "cache hit");
                Some(SecretString::from(secret.expose_secret().to_owned()))
            }
            None => {
                self.stats.record_miss();
                debug!(cache = self.name, key = key, "cache miss");
                None
            }
        }
    }

    /// Store `secret` under `key`, replacing any previous value.
    pub async fn put(&self, key: &str, secret: SecretString) {
        self.inner.insert(key.to_string(), Arc::new(secret)).await;
        debug!(cache = self.name, key = key, "cache put");
    }

    /// Drop the entry for `key`.  No-op when absent.
    pub async fn remove(&self, key: &str) {
        self.inner.invalidate(key).await;
        debug!(cache = self.name, key = key, "cache remove");
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }
}

impl fmt::Debug for SecretCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretCache")
            .field("name", &self.name)
            .field("ttl", &self.ttl)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

// ── builder ──────────────────────────────────────────────────────────

/// Builder for [`SecretCache`].
pub struct SecretCacheBuilder {
    name: &'static str,
    ttl: Duration,
}

impl SecretCacheBuilder {
    /// Idle time after which an entry is gone.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn build(self) -> SecretCache {
        let inner = Cache::builder().time_to_idle(self.ttl).build();

        debug!(
            name = self.name,
            ttl_secs = self.ttl.as_secs(),
            "secret cache created"
        );

        SecretCache {
            name: self.name,
            ttl: self.ttl,
            inner,
            stats: Arc::new(CacheStats::default()),
        }
    }
}

// ── broker caches ────────────────────────────────────────────────────

/// The two cache instances a broker works with.
///
/// Constructed explicitly and handed to the broker, so every test can start
/// from fresh, isolated caches.
#[derive(Debug, Clone)]
pub struct BrokerCaches {
    /// Derived (PBKDF) passwords produced by the external tool.
    pub pbkdf_passwords: SecretCache,
    /// Decrypted vault passwords.
    pub vault_passwords: SecretCache,
}

impl BrokerCaches {
    pub fn new(ttl: Duration) -> Self {
        Self {
            pbkdf_passwords: SecretCache::new("pbkdf-passwords", ttl),
            vault_passwords: SecretCache::new("vault-passwords", ttl),
        }
    }

    /// Forget everything cached for `vault_id` in both caches.
    pub async fn forget(&self, vault_id: &str) {
        self.pbkdf_passwords.remove(vault_id).await;
        self.vault_passwords.remove(vault_id).await;
    }
}

impl Default for BrokerCaches {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_TTL)
    }
}

// ── tests ────────────────────────────────────────────────────────────
