//! Bounded cache for resolved rule decisions

use crate::index::LookupKey;
use ipguard_common::IpRuleStatus;
use moka::sync::Cache;
use std::sync::atomic::{AtomicU64, Ordering};

/// Default capacity (entries)
pub const DEFAULT_CACHE_CAPACITY: u64 = 10_000;

/// Decision cache with generation-stamped entries.
///
/// Every entry records the generation it was computed at. Invalidation bumps
/// the generation before clearing, so a lookup that raced with a rule change
/// and inserts afterwards can never be served.
pub struct DecisionCache {
    cache: Cache<LookupKey, (u64, IpRuleStatus)>, // (generation, status)
    generation: AtomicU64,
    capacity: u64,
}

impl DecisionCache {
    /// Create cache with capacity
    pub fn new(capacity: u64) -> Self {
        let cache = Cache::builder().max_capacity(capacity).build();

        Self {
            cache,
            generation: AtomicU64::new(0),
            capacity,
        }
    }

    /// Current generation; read it before consulting the rule index
    #[inline(always)]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Cached decision, if computed at the current generation
    #[inline(always)]
    pub fn get(&self, key: &LookupKey) -> Option<IpRuleStatus> {
        let current = self.generation();
        self.cache
            .get(key)
            .and_then(|(generation, status)| (generation == current).then_some(status))
    }

    /// Insert a decision computed at `generation`
    #[inline(always)]
    pub fn insert(&self, key: LookupKey, generation: u64, status: IpRuleStatus) {
        if generation == self.generation() {
            self.cache.insert(key, (generation, status));
        }
    }

    /// Drop every cached decision
    pub fn invalidate_all(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.cache.invalidate_all();
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Approximate number of entries
    pub fn len(&self) -> u64 {
        self.cache.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.entry_count() == 0
    }
}

impl Default for DecisionCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}
