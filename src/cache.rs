use crate::model::{AddressRecord, Coordinates};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const CACHE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedExtraction {
    pub records: Vec<AddressRecord>,
    pub cached_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedLocation {
    pub coordinates: Option<Coordinates>,
    pub cached_at: DateTime<Utc>,
}

/// Serializable cache contents. Documents are keyed by fingerprint,
/// addresses by their normalized text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheState {
    pub schema_version: u32,
    #[serde(default)]
    pub documents: BTreeMap<String, CachedExtraction>,
    #[serde(default)]
    pub addresses: BTreeMap<String, CachedLocation>,
}

impl Default for CacheState {
    fn default() -> Self {
        Self {
            schema_version: CACHE_SCHEMA_VERSION,
            documents: BTreeMap::new(),
            addresses: BTreeMap::new(),
        }
    }
}

/// Time-bounded cache for extraction results and geocode outcomes.
#[derive(Debug, Clone)]
pub struct Cache {
    state: CacheState,
    ttl: Duration,
}

impl Cache {
    pub fn new(ttl_secs: u64) -> Self {
        Self::from_state(CacheState::default(), ttl_secs)
    }

    pub fn from_state(state: CacheState, ttl_secs: u64) -> Self {
        let ttl = i64::try_from(ttl_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .unwrap_or(Duration::MAX);
        Self { state, ttl }
    }

    pub fn state(&self) -> &CacheState {
        &self.state
    }

    pub fn document(&self, fingerprint: &str, now: DateTime<Utc>) -> Option<Vec<AddressRecord>> {
        self.state
            .documents
            .get(fingerprint)
            .filter(|entry| self.is_fresh(entry.cached_at, now))
            .map(|entry| entry.records.clone())
    }

    pub fn store_document(
        &mut self,
        fingerprint: &str,
        records: &[AddressRecord],
        now: DateTime<Utc>,
    ) {
        self.state.documents.insert(
            fingerprint.to_string(),
            CachedExtraction {
                records: records.to_vec(),
                cached_at: now,
            },
        );
    }

    /// Cached outcome for an address. The outer `Option` is hit/miss; the
    /// inner one is whether the service knew the address.
    pub fn address(&self, raw_address: &str, now: DateTime<Utc>) -> Option<Option<Coordinates>> {
        self.state
            .addresses
            .get(&normalize_address(raw_address))
            .filter(|entry| self.is_fresh(entry.cached_at, now))
            .map(|entry| entry.coordinates)
    }

    pub fn store_address(
        &mut self,
        raw_address: &str,
        coordinates: Option<Coordinates>,
        now: DateTime<Utc>,
    ) {
        self.state.addresses.insert(
            normalize_address(raw_address),
            CachedLocation {
                coordinates,
                cached_at: now,
            },
        );
    }

    /// Drops expired entries and returns how many were removed.
    pub fn prune(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.state.documents.len() + self.state.addresses.len();
        let ttl = self.ttl;
        let fresh = |cached_at: DateTime<Utc>| now.signed_duration_since(cached_at) < ttl;
        self.state.documents.retain(|_, entry| fresh(entry.cached_at));
        self.state.addresses.retain(|_, entry| fresh(entry.cached_at));
        before - (self.state.documents.len() + self.state.addresses.len())
    }

    fn is_fresh(&self, cached_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(cached_at) < self.ttl
    }
}

/// Trimmed, whitespace-collapsed, lowercased address used as cache key.
pub fn normalize_address(address: &str) -> String {
    address
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
