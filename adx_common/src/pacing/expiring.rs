//! # Expiring Map
//!
//! A string-keyed map whose entries live for a fixed TTL after their last
//! write. An expired entry is invisible to readers as soon as its deadline
//! passes; memory is reclaimed separately by [`ExpiringMap::purge_expired`].
//!
//! All access goes through one mutex. Critical sections are a single lookup
//! or insert, so a panic inside one (from an `update` closure) leaves the map
//! consistent and a poisoned lock is simply taken over.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::clock::to_chrono;

#[derive(Debug, Clone)]
struct Slot<V> {
    value: V,
    expires_at: DateTime<Utc>,
}

impl<V> Slot<V> {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

#[derive(Debug)]
pub struct ExpiringMap<V> {
    entries: Mutex<HashMap<String, Slot<V>>>,
    ttl: chrono::Duration,
}

impl<V: Clone> ExpiringMap<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl: to_chrono(ttl),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Slot<V>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replaces the value under `key` with `f(current)`, where `current` is
    /// `None` for absent or expired entries, and restarts its TTL. Returns the
    /// stored value.
    pub fn update<F>(&self, key: &str, now: DateTime<Utc>, f: F) -> V
    where
        F: FnOnce(Option<&V>) -> V,
    {
        let mut entries = self.lock();
        let current = entries
            .get(key)
            .filter(|slot| slot.is_live(now))
            .map(|slot| &slot.value);
        let value = f(current);
        entries.insert(
            key.to_string(),
            Slot {
                value: value.clone(),
                expires_at: now + self.ttl,
            },
        );
        value
    }

    pub fn get(&self, key: &str, now: DateTime<Utc>) -> Option<V> {
        self.lock()
            .get(key)
            .filter(|slot| slot.is_live(now))
            .map(|slot| slot.value.clone())
    }

    /// Entries that have not expired at `now`.
    pub fn len_live(&self, now: DateTime<Utc>) -> usize {
        self.lock()
            .values()
            .filter(|slot| slot.is_live(now))
            .count()
    }

    /// Entries held in memory, expired or not.
    pub fn len_stored(&self) -> usize {
        self.lock().len()
    }

    /// Drops every expired entry and returns how many were dropped.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, slot| slot.is_live(now));
        before - entries.len()
    }
}
