//! Time-boxed, capacity-bounded cache of completion-service responses.
//!
//! Keys bind a response to the exact input that produced it: the document
//! fingerprint, the field group, and a snapshot token hashed from the field
//! values that were sent. Editing a field changes the token, so stale
//! suggestions simply stop matching.
//!
//! Entries expire after the TTL; when full, the least recently used entry is
//! displaced. The cache is advisory: racing writers to one key overwrite each
//! other, and a miss only costs an extra external call.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::fields::FieldGroup;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub document_fingerprint: String,
    pub group: FieldGroup,
    pub snapshot_token: String,
}

impl CacheKey {
    pub fn new(
        document_fingerprint: impl Into<String>,
        group: FieldGroup,
        snapshot_token: impl Into<String>,
    ) -> Self {
        Self {
            document_fingerprint: document_fingerprint.into(),
            group,
            snapshot_token: snapshot_token.into(),
        }
    }
}

/// A stored response plus any intermediate rendered artifacts (for example
/// page crops sent alongside the request).
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub payload: Value,
    pub artifacts: BTreeMap<String, Vec<u8>>,
    pub inserted_at: Instant,
}

struct Slot {
    entry: CacheEntry,
    last_used: u64,
}

struct Inner {
    slots: HashMap<CacheKey, Slot>,
    tick: u64,
}

pub struct FallbackCache {
    ttl: Duration,
    capacity: usize,
    inner: Mutex<Inner>,
}

impl FallbackCache {
    /// `capacity` is clamped to at least one entry.
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity: capacity.max(1),
            inner: Mutex::new(Inner {
                slots: HashMap::new(),
                tick: 0,
            }),
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.get_at(key, Instant::now())
    }

    pub fn insert(&self, key: CacheKey, payload: Value) {
        self.insert_at(key, payload, BTreeMap::new(), Instant::now());
    }

    pub fn insert_with_artifacts(
        &self,
        key: CacheKey,
        payload: Value,
        artifacts: BTreeMap<String, Vec<u8>>,
    ) {
        self.insert_at(key, payload, artifacts, Instant::now());
    }

    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let ttl = self.ttl;
        let mut inner = self.lock();
        let before = inner.slots.len();
        inner
            .slots
            .retain(|_, slot| now.duration_since(slot.entry.inserted_at) < ttl);
        before - inner.slots.len()
    }

    fn get_at(&self, key: &CacheKey, now: Instant) -> Option<CacheEntry> {
        let mut inner = self.lock();
        let expired = match inner.slots.get(key) {
            None => return None,
            Some(slot) => now.duration_since(slot.entry.inserted_at) >= self.ttl,
        };
        if expired {
            inner.slots.remove(key);
            return None;
        }
        inner.tick += 1;
        let tick = inner.tick;
        let slot = inner.slots.get_mut(key)?;
        slot.last_used = tick;
        Some(slot.entry.clone())
    }

    fn insert_at(
        &self,
        key: CacheKey,
        payload: Value,
        artifacts: BTreeMap<String, Vec<u8>>,
        now: Instant,
    ) {
        let mut inner = self.lock();
        inner.tick += 1;
        let tick = inner.tick;

        if !inner.slots.contains_key(&key) {
            let ttl = self.ttl;
            inner
                .slots
                .retain(|_, slot| now.duration_since(slot.entry.inserted_at) < ttl);
            while inner.slots.len() >= self.capacity {
                let lru = inner
                    .slots
                    .iter()
                    .min_by_key(|(_, slot)| slot.last_used)
                    .map(|(k, _)| k.clone());
                match lru {
                    Some(k) => {
                        tracing::debug!(group = %k.group, "evicting least recently used cache entry");
                        inner.slots.remove(&k);
                    }
                    None => break,
                }
            }
        }

        inner.slots.insert(
            key,
            Slot {
                entry: CacheEntry {
                    payload,
                    artifacts,
                    inserted_at: now,
                },
                last_used: tick,
            },
        );
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic mid-update cannot leave an entry half-written, so a
        // poisoned guard is still usable.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// SHA-256 hex digest of the source document bytes.
pub fn document_fingerprint(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// SHA-256 hex digest of the values sent for one group. The map is ordered,
/// so equal inputs always hash equally.
pub fn snapshot_token(sent: &BTreeMap<String, Value>) -> String {
    let canonical = serde_json::to_string(sent).unwrap_or_default();
    hex::encode(Sha256::digest(canonical.as_bytes()))
}
