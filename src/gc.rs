//! Reference-counted eviction.
//!
//! Every record written to the store is registered with a count of zero.
//! Subscriptions, range membership and in-flight fetches raise and lower
//! counts. A record whose count has been zero for longer than the grace
//! period is evicted by the next sweep.

use crate::error::{CacheError, Result};
use crate::records::{MembershipChange, RecordStore};
use crate::types::DataId;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Result of a sweep.
#[derive(Clone, Debug, Default)]
pub struct CollectResult {
    /// Records that were evicted.
    pub evicted: Vec<DataId>,
    /// Unreferenced records still inside the grace period.
    pub deferred: usize,
}

/// Reference counts per record plus zero-count timestamps.
#[derive(Debug)]
pub struct GarbageCollector {
    counts: HashMap<DataId, usize>,
    zero_since: HashMap<DataId, Instant>,
    grace_period: Duration,
}

impl GarbageCollector {
    pub fn new(grace_period: Duration) -> Self {
        Self {
            counts: HashMap::new(),
            zero_since: HashMap::new(),
            grace_period,
        }
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Start tracking `id` if it is not tracked yet.
    pub fn register(&mut self, id: &DataId, now: Instant) {
        if !self.counts.contains_key(id) {
            self.counts.insert(id.clone(), 0);
            self.zero_since.insert(id.clone(), now);
        }
    }

    pub fn increment_reference_count(&mut self, id: &DataId) {
        *self.counts.entry(id.clone()).or_insert(0) += 1;
        self.zero_since.remove(id);
    }

    /// Lower the count of `id`. Going below zero is an invariant violation.
    pub fn decrement_reference_count(&mut self, id: &DataId, now: Instant) -> Result<()> {
        let count = match self.counts.get_mut(id) {
            Some(count) if *count > 0 => count,
            _ => {
                return Err(CacheError::inconsistent(format!(
                    "reference count of `{}` would drop below zero",
                    id
                )))
            }
        };
        *count -= 1;
        if *count == 0 {
            self.zero_since.insert(id.clone(), now);
        }
        Ok(())
    }

    pub fn reference_count(&self, id: &DataId) -> usize {
        self.counts.get(id).copied().unwrap_or(0)
    }

    /// Number of tracked records.
    pub fn tracked(&self) -> usize {
        self.counts.len()
    }

    /// Apply range membership changes drained from the store.
    pub fn apply_membership(&mut self, changes: Vec<MembershipChange>, now: Instant) -> Result<()> {
        for change in changes {
            match change {
                MembershipChange::Retained(id) => self.increment_reference_count(&id),
                MembershipChange::Released(id) => self.decrement_reference_count(&id, now)?,
            }
        }
        Ok(())
    }

    /// Evict records unreferenced for at least the grace period.
    pub fn collect(&mut self, store: &mut RecordStore, now: Instant) -> Result<CollectResult> {
        self.sweep(store, now, Some(self.grace_period))
    }

    /// Evict every unreferenced record, ignoring the grace period, until
    /// no eviction frees anything more.
    pub fn collect_now(&mut self, store: &mut RecordStore, now: Instant) -> Result<CollectResult> {
        let mut total = CollectResult::default();
        loop {
            let pass = self.sweep(store, now, None)?;
            if pass.evicted.is_empty() {
                break;
            }
            total.evicted.extend(pass.evicted);
            self.apply_membership(store.take_membership(), now)?;
        }
        Ok(total)
    }

    fn sweep(&mut self, store: &mut RecordStore, now: Instant, grace: Option<Duration>) -> Result<CollectResult> {
        let mut result = CollectResult::default();
        let mut candidates: Vec<DataId> = Vec::new();
        for (id, since) in &self.zero_since {
            let expired = match grace {
                Some(grace) => now.saturating_duration_since(*since) >= grace,
                None => true,
            };
            if expired {
                candidates.push(id.clone());
            } else {
                result.deferred += 1;
            }
        }
        candidates.sort();

        for id in candidates {
            self.zero_since.remove(&id);
            self.counts.remove(&id);
            store.evict_record(&id);
            result.evicted.push(id);
        }
        if !result.evicted.is_empty() {
            tracing::debug!(evicted = result.evicted.len(), deferred = result.deferred, "gc sweep");
        }
        Ok(result)
    }
}
