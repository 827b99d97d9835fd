//! LRU (Least Recently Used) candidate order.

use std::collections::{BTreeMap, HashMap};

/// Tracks cached positions in access order.
///
/// Each access stamps the position with a fresh tick from a logical clock.
/// `order` is keyed by stamp, so iterating it yields the least recently
/// used position first. The replacer does not know about pinning; the
/// cache skips kept objects when it walks the candidates.
#[derive(Debug, Default)]
pub struct LruReplacer {
    /// Logical clock, advanced on every access.
    clock: u64,

    /// Position -> stamp of its latest access.
    stamps: HashMap<u64, u64>,

    /// Stamp -> position, oldest first.
    order: BTreeMap<u64, u64>,
}

impl LruReplacer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `position` was accessed, making it the most recent.
    pub fn record_access(&mut self, position: u64) {
        self.clock += 1;
        if let Some(old) = self.stamps.insert(position, self.clock) {
            self.order.remove(&old);
        }
        self.order.insert(self.clock, position);
    }

    /// Stop tracking `position`.
    pub fn remove(&mut self, position: u64) {
        if let Some(stamp) = self.stamps.remove(&position) {
            self.order.remove(&stamp);
        }
    }

    /// Tracked positions, least recently used first.
    pub fn candidates(&self) -> impl Iterator<Item = u64> + '_ {
        self.order.values().copied()
    }

    /// Number of tracked positions.
    pub fn size(&self) -> usize {
        self.stamps.len()
    }

    pub fn clear(&mut self) {
        self.stamps.clear();
        self.order.clear();
    }
}
