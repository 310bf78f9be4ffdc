//! Vector clocks for causal ordering of operations.
//!
//! Each site owns one entry and only ever raises its own counter. Comparing
//! two clocks tells whether one edit observed the other or whether they
//! happened concurrently, which is what the conflict pipeline keys on.

use crate::SiteId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Causal relationship between two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CausalOrder {
    /// Strictly happened before the other clock.
    Less,
    /// Strictly happened after the other clock.
    Greater,
    /// Identical clocks.
    Equal,
    /// Neither clock dominates.
    Concurrent,
}

/// A mapping of site id to a logical counter.
///
/// Missing entries count as zero; zero entries are never stored, so two
/// clocks describing the same history compare equal with `==` as well.
/// A `BTreeMap` keeps serialization deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<SiteId, u64>", into = "BTreeMap<SiteId, u64>")]
pub struct VectorClock {
    entries: BTreeMap<SiteId, u64>,
}

impl From<BTreeMap<SiteId, u64>> for VectorClock {
    fn from(entries: BTreeMap<SiteId, u64>) -> Self {
        Self::from_entries(entries)
    }
}

impl From<VectorClock> for BTreeMap<SiteId, u64> {
    fn from(clock: VectorClock) -> Self {
        clock.entries
    }
}

impl VectorClock {
    /// Create an empty clock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a clock from explicit `(site, counter)` pairs.
    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, u64)>,
        S: Into<SiteId>,
    {
        let entries = entries
            .into_iter()
            .filter(|(_, counter)| *counter > 0)
            .map(|(site, counter)| (site.into(), counter))
            .collect();
        Self { entries }
    }

    /// Counter for a site (zero if the site never ticked).
    pub fn get(&self, site: &str) -> u64 {
        self.entries.get(site).copied().unwrap_or(0)
    }

    /// Raise `site`'s own counter by exactly one and return the new value.
    pub fn increment(&mut self, site: &str) -> u64 {
        let counter = self.entries.entry(site.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Pointwise maximum with another clock.
    pub fn merge(&mut self, other: &VectorClock) {
        for (site, &counter) in &other.entries {
            let entry = self.entries.entry(site.clone()).or_insert(0);
            if counter > *entry {
                *entry = counter;
            }
        }
    }

    /// Pointwise maximum, returning a new clock.
    pub fn merged(&self, other: &VectorClock) -> VectorClock {
        let mut clock = self.clone();
        clock.merge(other);
        clock
    }

    /// Compare two clocks causally.
    pub fn compare(&self, other: &VectorClock) -> CausalOrder {
        let mut less = false;
        let mut greater = false;

        for site in self.entries.keys().chain(other.entries.keys()) {
            let mine = self.get(site);
            let theirs = other.get(site);
            if mine < theirs {
                less = true;
            } else if mine > theirs {
                greater = true;
            }
            if less && greater {
                return CausalOrder::Concurrent;
            }
        }

        match (less, greater) {
            (false, false) => CausalOrder::Equal,
            (true, false) => CausalOrder::Less,
            (false, true) => CausalOrder::Greater,
            (true, true) => CausalOrder::Concurrent,
        }
    }

    /// True if this clock strictly happened before `other`.
    pub fn happened_before(&self, other: &VectorClock) -> bool {
        self.compare(other) == CausalOrder::Less
    }

    /// True if neither clock dominates the other.
    pub fn is_concurrent_with(&self, other: &VectorClock) -> bool {
        self.compare(other) == CausalOrder::Concurrent
    }

    /// True if this clock has seen everything `other` has seen.
    pub fn dominates(&self, other: &VectorClock) -> bool {
        matches!(
            self.compare(other),
            CausalOrder::Greater | CausalOrder::Equal
        )
    }

    /// Per-site signed difference `other - self`, omitting equal entries.
    pub fn difference(&self, other: &VectorClock) -> BTreeMap<SiteId, i64> {
        let mut diff = BTreeMap::new();
        for site in self.entries.keys().chain(other.entries.keys()) {
            let delta = other.get(site) as i64 - self.get(site) as i64;
            if delta != 0 {
                diff.insert(site.clone(), delta);
            }
        }
        diff
    }

    /// Sum of all counters. Strictly increases along every causal chain.
    pub fn total(&self) -> u64 {
        self.entries.values().sum()
    }

    /// Iterate over `(site, counter)` pairs in site order.
    pub fn iter(&self) -> impl Iterator<Item = (&SiteId, &u64)> {
        self.entries.iter()
    }

    /// True if no site has ticked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl From<std::cmp::Ordering> for CausalOrder {
    fn from(ordering: std::cmp::Ordering) -> Self {
        match ordering {
            std::cmp::Ordering::Less => CausalOrder::Less,
            std::cmp::Ordering::Equal => CausalOrder::Equal,
            std::cmp::Ordering::Greater => CausalOrder::Greater,
        }
    }
}
