//! Latest published samples per collector.
//!
//! Each collector's entry is an immutable `Arc<RegistryEntry>`. Publishing
//! swaps the `Arc` under a short write lock and taking a snapshot clones the
//! `Arc`s under a short read lock, so readers never see a half-replaced
//! sample set and no lock is held while a scrape is being encoded.

use crate::collector::CollectorId;
use crate::sample::Sample;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

/// The most recent successful result of one collector
#[derive(Debug)]
pub struct RegistryEntry {
    samples: Vec<Sample>,
    updated_at: DateTime<Utc>,
    /// Number of publishes for this collector so far, starting at 1
    generation: u64,
}

impl RegistryEntry {
    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Shared store of the latest sample set per collector.
#[derive(Debug, Default)]
pub struct Registry {
    entries: RwLock<HashMap<CollectorId, Arc<RegistryEntry>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the sample set for `id` and return the new generation.
    pub fn publish(&self, id: &CollectorId, samples: Vec<Sample>) -> u64 {
        let updated_at = Utc::now();
        // The map only ever holds complete entries, so a poisoned lock is safe to reuse.
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let generation = entries.get(id).map_or(0, |e| e.generation) + 1;
        entries.insert(
            id.clone(),
            Arc::new(RegistryEntry {
                samples,
                updated_at,
                generation,
            }),
        );
        generation
    }

    /// Take a point-in-time copy of every published entry.
    pub fn snapshot(&self) -> Snapshot {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        Snapshot {
            entries: entries
                .iter()
                .map(|(id, entry)| (id.clone(), Arc::clone(entry)))
                .collect(),
        }
    }

    /// Number of collectors that have published at least once
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A consistent, immutable view of the registry.
///
/// Entries are shared with the registry but never mutated, so a snapshot
/// cannot change after it has been taken.
#[derive(Debug, Clone)]
pub struct Snapshot {
    entries: BTreeMap<CollectorId, Arc<RegistryEntry>>,
}

impl Snapshot {
    pub fn get(&self, id: &CollectorId) -> Option<&RegistryEntry> {
        self.entries.get(id).map(Arc::as_ref)
    }

    /// Entries in collector-id order
    pub fn iter(&self) -> impl Iterator<Item = (&CollectorId, &RegistryEntry)> {
        self.entries.iter().map(|(id, entry)| (id, entry.as_ref()))
    }

    /// All samples of all collectors, in collector-id order
    pub fn samples(&self) -> impl Iterator<Item = &Sample> {
        self.entries.values().flat_map(|entry| entry.samples.iter())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
