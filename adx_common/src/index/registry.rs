//! # Index Registry
//!
//! Holds the one live [`IndexSnapshot`]. Readers take an owned `Arc` with
//! [`IndexRegistry::current`] and keep it for the length of one request; the
//! refresh task swaps in a new snapshot with [`IndexRegistry::publish`].
//! Readers never lock and never see a half-built index. A retired snapshot is
//! freed when its last reader lets go.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use tracing::info;

use super::engine::SearchIndex;
use crate::inventory::IngestStats;

/// One complete, immutable build of the offer index.
#[derive(Debug)]
pub struct IndexSnapshot<I> {
    index: I,
    generation: u64,
    built_at: DateTime<Utc>,
    stats: BTreeMap<String, IngestStats>,
}

impl<I: SearchIndex> IndexSnapshot<I> {
    pub fn index(&self) -> &I {
        &self.index
    }

    /// Zero for the empty snapshot a registry starts with, then strictly
    /// increasing by one per publish.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn built_at(&self) -> DateTime<Utc> {
        self.built_at
    }

    /// Per-channel ingestion counters of the build.
    pub fn stats(&self) -> &BTreeMap<String, IngestStats> {
        &self.stats
    }

    pub fn documents(&self) -> usize {
        self.index.len()
    }
}

pub struct IndexRegistry<I> {
    current: ArcSwap<IndexSnapshot<I>>,
    publish_lock: Mutex<()>,
}

impl<I: SearchIndex> IndexRegistry<I> {
    /// Starts serving `initial` (normally empty) as generation 0.
    pub fn new(initial: I, now: DateTime<Utc>) -> Self {
        let snapshot = IndexSnapshot {
            index: initial,
            generation: 0,
            built_at: now,
            stats: BTreeMap::new(),
        };
        Self {
            current: ArcSwap::from_pointee(snapshot),
            publish_lock: Mutex::new(()),
        }
    }

    /// The live snapshot. Wait-free.
    pub fn current(&self) -> Arc<IndexSnapshot<I>> {
        self.current.load_full()
    }

    pub fn generation(&self) -> u64 {
        self.current.load().generation
    }

    /// Makes `index` the live snapshot and returns the one it replaced.
    pub fn publish(
        &self,
        index: I,
        built_at: DateTime<Utc>,
        stats: BTreeMap<String, IngestStats>,
    ) -> Arc<IndexSnapshot<I>> {
        let _guard = self
            .publish_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let generation = self.current.load().generation + 1;
        let snapshot = Arc::new(IndexSnapshot {
            index,
            generation,
            built_at,
            stats,
        });
        let documents = snapshot.documents();
        let retired = self.current.swap(snapshot);

        info!(
            generation,
            documents,
            retired_documents = retired.documents(),
            "Published index snapshot"
        );
        retired
    }
}
