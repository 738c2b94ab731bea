use std::time::Duration;

use hashbrown::HashMap;
use tracing::{debug, trace};
use typed_builder::TypedBuilder;

use super::{
    adapter::{FragmentStore, FreshFragment, PatternKey},
    error::ConfigError,
    machine::State,
    protocol::PatternRecord,
};
use crate::mesh::Rank;

#[derive(Clone, Debug, PartialEq, TypedBuilder)]
pub struct CacheConfig {
    /// Entries held before an insert triggers eviction.
    #[builder(default = 10_000)]
    pub max_size: usize,
    /// Share of the entries one eviction pass removes, oldest first. A pass
    /// always removes at least one entry, even when the share rounds to zero,
    /// so a full cache can still take a new fragment.
    #[builder(default = 0.25)]
    pub eviction_fraction: f64,
    /// Fragments solved faster than this are not worth remembering.
    #[builder(default = Duration::ZERO)]
    pub min_solve_time: Duration,
    /// Uses before a local entry is offered to peers.
    #[builder(default = 3)]
    pub min_use_count: u32,
    /// Most records the collector distributes per round.
    #[builder(default = 1000)]
    pub exchange_cap: usize,
    /// Share of the offered records the collector distributes.
    #[builder(default = 0.1)]
    pub exchange_fraction: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_size == 0 {
            Err(ConfigError::invalid("cache.max_size", "must be at least 1"))?
        }
        if !(self.eviction_fraction > 0.0 && self.eviction_fraction <= 1.0) {
            Err(ConfigError::invalid(
                "cache.eviction_fraction",
                format!("must be in (0, 1], got {}", self.eviction_fraction),
            ))?
        }
        if !(self.exchange_fraction > 0.0 && self.exchange_fraction <= 1.0) {
            Err(ConfigError::invalid(
                "cache.exchange_fraction",
                format!("must be in (0, 1], got {}", self.exchange_fraction),
            ))?
        }
        if self.exchange_cap == 0 {
            Err(ConfigError::invalid("cache.exchange_cap", "must be at least 1"))?
        }
        Ok(())
    }

    /// Number of records kept out of `offered` distinct ones.
    pub fn selection_size(&self, offered: usize) -> usize {
        if offered == 0 {
            return 0;
        }
        let share = (offered as f64 * self.exchange_fraction).ceil() as usize;
        share.max(1).min(self.exchange_cap)
    }

    /// Number of entries an eviction pass removes from a cache holding `len`:
    /// the configured share rounded down, but never fewer than one.
    pub fn eviction_size(&self, len: usize) -> usize {
        ((len as f64 * self.eviction_fraction).floor() as usize)
            .max(1)
            .min(len)
    }
}

/// Who solved an entry first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Origin {
    Local,
    Remote(Rank),
}

#[derive(Clone, Debug, PartialEq)]
pub struct CacheEntry {
    pub pattern: PatternKey,
    pub partial_states: Vec<State>,
    pub accumulated_cost: f64,
    pub use_count: u32,
    /// Logical time of the last insert or hit.
    pub last_used: u64,
    pub solve_time: Duration,
    pub origin: Origin,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub inserted: u64,
    pub rejected: u64,
    pub evicted: u64,
    pub eviction_passes: u64,
    pub remote_merged: u64,
    pub remote_skipped: u64,
}

/// Bounded map from fragment keys to solved schedules, evicting the least
/// recently used share of its entries when full.
pub struct PatternCache {
    config: CacheConfig,
    entries: HashMap<PatternKey, CacheEntry>,
    tick: u64,
    stats: CacheStats,
}

impl PatternCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: HashMap::with_capacity(config.max_size.min(1 << 16)),
            config,
            tick: 0,
            stats: CacheStats::default(),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Looks up `key`, counting the hit or miss. A hit marks the entry as
    /// used.
    pub fn lookup(&mut self, key: &PatternKey) -> Option<&CacheEntry> {
        let tick = self.tick + 1;
        match self.entries.get_mut(key) {
            Some(entry) => {
                self.tick = tick;
                self.stats.hits += 1;
                entry.use_count = entry.use_count.saturating_add(1);
                entry.last_used = tick;
                Some(entry)
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// Looks up `key` without touching statistics or recency.
    pub fn peek(&self, key: &PatternKey) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &PatternKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Counts a use of every key in `keys` that is still cached, as if each
    /// had been looked up.
    pub fn record_uses<'a>(&mut self, keys: impl IntoIterator<Item = &'a PatternKey>) {
        for key in keys {
            let _ = self.lookup(key);
        }
    }

    /// Remembers a freshly solved fragment. Returns whether it was stored.
    pub fn insert(
        &mut self,
        key: PatternKey,
        states: Vec<State>,
        cost: f64,
        solve_time: Duration,
    ) -> bool {
        if self.entries.contains_key(&key) {
            return false;
        }
        if solve_time < self.config.min_solve_time {
            self.stats.rejected += 1;
            trace!(%key, ?solve_time, "too cheap to cache");
            return false;
        }
        self.make_room();
        let tick = self.next_tick();
        self.entries.insert(
            key,
            CacheEntry {
                pattern: key,
                partial_states: states,
                accumulated_cost: cost,
                use_count: 1,
                last_used: tick,
                solve_time,
                origin: Origin::Local,
            },
        );
        self.stats.inserted += 1;
        true
    }

    pub fn insert_fresh(&mut self, fresh: FreshFragment) -> bool {
        self.insert(fresh.key, fresh.states, fresh.cost, fresh.solve_time)
    }

    /// Adopts a record distributed by a peer unless the key is already known.
    /// Malformed records are skipped.
    pub fn merge_remote(&mut self, record: &PatternRecord) -> bool {
        let (Some(key), Some(states)) = (record.key(), record.schedule()) else {
            self.stats.remote_skipped += 1;
            return false;
        };
        if self.entries.contains_key(&key) {
            self.stats.remote_skipped += 1;
            return false;
        }
        self.make_room();
        let tick = self.next_tick();
        self.entries.insert(
            key,
            CacheEntry {
                pattern: key,
                partial_states: states,
                accumulated_cost: record.cost,
                use_count: 0,
                last_used: tick,
                solve_time: Duration::from_micros(record.solve_time_us),
                origin: Origin::Remote(record.origin as Rank),
            },
        );
        self.stats.remote_merged += 1;
        true
    }

    fn make_room(&mut self) {
        if self.entries.len() >= self.config.max_size {
            self.evict();
        }
    }

    /// Drops the least recently used share of the entries.
    fn evict(&mut self) {
        let count = self.config.eviction_size(self.entries.len());
        if count == 0 {
            return;
        }
        let mut ages: Vec<(u64, PatternKey)> = self
            .entries
            .values()
            .map(|entry| (entry.last_used, entry.pattern))
            .collect();
        ages.select_nth_unstable(count - 1);
        for (_, key) in &ages[..count] {
            self.entries.remove(key);
        }
        self.stats.evicted += count as u64;
        self.stats.eviction_passes += 1;
        debug!(evicted = count, remaining = self.entries.len(), "cache eviction");
    }

    /// Entries used often enough to be worth offering to peers, packed as
    /// exchange records from `rank`.
    pub fn valuable(&self, rank: Rank) -> Vec<PatternRecord> {
        let mut records: Vec<PatternRecord> = self
            .entries
            .values()
            .filter(|entry| {
                entry.use_count >= self.config.min_use_count
                    && entry.solve_time >= self.config.min_solve_time
            })
            .filter_map(|entry| PatternRecord::from_entry(entry, rank))
            .collect();
        // map order is not stable across ranks
        records.sort_by(|a, b| a.pattern.cmp(&b.pattern));
        records
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }
}

impl FragmentStore for PatternCache {
    fn fetch(&mut self, key: &PatternKey) -> Option<&[State]> {
        self.lookup(key).map(|entry| entry.partial_states.as_slice())
    }
}

/// Read-only view of a cache shared by the jobs of a parallel batch. Each job
/// keeps the fragments it solved itself in a private overlay and records which
/// cached keys it used, so the owner can fold both back in afterwards.
pub struct CacheView<'a> {
    base: &'a PatternCache,
    overlay: HashMap<PatternKey, Vec<State>>,
    touched: Vec<PatternKey>,
}

impl<'a> CacheView<'a> {
    pub fn new(base: &'a PatternCache) -> Self {
        Self {
            base,
            overlay: HashMap::new(),
            touched: Vec::new(),
        }
    }

    /// Makes a fragment solved by this job visible to its later scenarios.
    pub fn remember(&mut self, fresh: &FreshFragment) {
        if !self.base.contains(&fresh.key) {
            self.overlay
                .entry(fresh.key)
                .or_insert_with(|| fresh.states.clone());
        }
    }

    /// Keys of shared entries this job used, in order of use.
    pub fn into_touched(self) -> Vec<PatternKey> {
        self.touched
    }
}

impl FragmentStore for CacheView<'_> {
    fn fetch(&mut self, key: &PatternKey) -> Option<&[State]> {
        if self.overlay.contains_key(key) {
            return self.overlay.get(key).map(Vec::as_slice);
        }
        let base = self.base;
        let entry = base.peek(key)?;
        self.touched.push(*key);
        Some(&entry.partial_states)
    }
}
