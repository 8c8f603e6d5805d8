//! TTL-classed result cache
//!
//! [`CacheManager`] stores idempotent discovery and read results keyed by
//! fingerprint (see [`crate::codec::fingerprint`]). Each entry belongs to a
//! [`CacheClass`] whose TTL comes from configuration. Expired entries are
//! treated as misses and evicted when touched. A capability-list-changed
//! signal drops every discovery entry at once.
//!
//! Lookups take a read lock and clone the stored value, so readers never
//! block each other.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::config::CacheConfig;
use crate::types::{CacheClass, CapabilityKind};

/// Which pipeline produced an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheScope {
    /// A page of a discovery listing.
    Discovery,
    /// A resource read.
    Read,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    expires_at: Instant,
    version: u64,
    scope: CacheScope,
    kind: CapabilityKind,
}

/// A snapshot returned by [`CacheManager::get`].
#[derive(Debug, Clone, PartialEq)]
pub struct CachedValue {
    pub value: Value,
    /// Monotonically increasing across all inserts.
    pub version: u64,
}

/// Hit/miss counters and current size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// Fingerprint-keyed cache with per-class TTLs.
#[derive(Debug)]
pub struct CacheManager {
    config: CacheConfig,
    entries: RwLock<HashMap<String, CacheEntry>>,
    next_version: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheManager {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: RwLock::new(HashMap::new()),
            next_version: AtomicU64::new(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Fresh value for `fingerprint`, or `None` on a miss.
    pub fn get(&self, fingerprint: &str) -> Option<CachedValue> {
        self.get_at(fingerprint, Instant::now())
    }

    fn get_at(&self, fingerprint: &str, now: Instant) -> Option<CachedValue> {
        let expired = {
            let entries = self.entries.read().unwrap_or_else(|p| p.into_inner());
            match entries.get(fingerprint) {
                Some(entry) if entry.expires_at > now => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(CachedValue {
                        value: entry.value.clone(),
                        version: entry.version,
                    });
                }
                Some(_) => true,
                None => false,
            }
        };

        if expired {
            let mut entries = self.entries.write().unwrap_or_else(|p| p.into_inner());
            // Re-check under the write lock; a concurrent insert may have
            // refreshed the entry.
            if entries
                .get(fingerprint)
                .is_some_and(|entry| entry.expires_at <= now)
            {
                entries.remove(fingerprint);
                tracing::trace!(fingerprint, "evicted expired cache entry");
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store `value` under `fingerprint` with the TTL of `class`. Returns
    /// the entry version, or `None` when the class is never cached.
    pub fn insert(
        &self,
        fingerprint: String,
        value: Value,
        class: CacheClass,
        scope: CacheScope,
        kind: CapabilityKind,
    ) -> Option<u64> {
        let ttl = self.config.ttl(class)?;
        self.insert_with_ttl(fingerprint, value, ttl, scope, kind, Instant::now())
    }

    fn insert_with_ttl(
        &self,
        fingerprint: String,
        value: Value,
        ttl: Duration,
        scope: CacheScope,
        kind: CapabilityKind,
        now: Instant,
    ) -> Option<u64> {
        if ttl.is_zero() {
            return None;
        }
        let version = self.next_version.fetch_add(1, Ordering::Relaxed);
        let entry = CacheEntry {
            value,
            expires_at: now + ttl,
            version,
            scope,
            kind,
        };
        self.entries
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(fingerprint, entry);
        Some(version)
    }

    /// Drop one entry.
    pub fn invalidate(&self, fingerprint: &str) -> bool {
        self.entries
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(fingerprint)
            .is_some()
    }

    /// Drop every discovery entry, or only those for `kind`. Returns how
    /// many were removed.
    pub fn invalidate_discovery(&self, kind: Option<CapabilityKind>) -> usize {
        let mut entries = self.entries.write().unwrap_or_else(|p| p.into_inner());
        let before = entries.len();
        entries.retain(|_, e| {
            !(e.scope == CacheScope::Discovery && kind.map_or(true, |k| k == e.kind))
        });
        before - entries.len()
    }

    /// Eagerly remove every expired entry.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().unwrap_or_else(|p| p.into_inner());
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        before - entries.len()
    }

    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self
                .entries
                .read()
                .unwrap_or_else(|p| p.into_inner())
                .len(),
        }
    }
}
