//! Bounded list of reusable byte ranges.

use std::collections::{BTreeMap, BTreeSet};

/// Free ranges of one table space, indexed two ways.
///
/// `by_position` maps start offset to length and is used for merging
/// neighbours. `by_size` orders the same ranges by `(length, start)` and is
/// used to find a range large enough for a request.
///
/// Ranges never overlap. The list holds at most `capacity` entries; callers
/// check [`is_full`](Self::is_full) and make room before adding.
#[derive(Debug, Clone)]
pub struct FreeList {
    by_position: BTreeMap<u64, u64>,
    by_size: BTreeSet<(u64, u64)>,
    capacity: usize,
}

impl FreeList {
    pub fn new(capacity: usize) -> Self {
        Self {
            by_position: BTreeMap::new(),
            by_size: BTreeSet::new(),
            capacity,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.by_position.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.by_position.is_empty()
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.by_position.len() >= self.capacity
    }

    /// Sum of all range lengths.
    pub fn total_size(&self) -> u64 {
        self.by_position.values().sum()
    }

    /// Insert a range. Zero-length ranges are ignored.
    pub fn add(&mut self, position: u64, size: u64) {
        if size == 0 {
            return;
        }
        debug_assert!(
            !self.overlaps(position, size),
            "free range {}+{} overlaps an existing range",
            position,
            size
        );
        self.by_position.insert(position, size);
        self.by_size.insert((size, position));
    }

    /// Remove the range starting at `position`, returning its length.
    pub fn remove(&mut self, position: u64) -> Option<u64> {
        let size = self.by_position.remove(&position)?;
        self.by_size.remove(&(size, position));
        Some(size)
    }

    /// The range a request of `size` bytes would be served from.
    ///
    /// The lowest-positioned range wins if it is large enough. Otherwise
    /// the smallest range that fits, the lower position breaking ties.
    pub fn first_fit(&self, size: u64) -> Option<(u64, u64)> {
        if let Some((&position, &length)) = self.by_position.iter().next() {
            if length >= size {
                return Some((position, length));
            }
        }

        self.by_size
            .range((size, 0)..)
            .next()
            .map(|&(length, position)| (position, length))
    }

    /// Take `size` bytes from the [`first_fit`](Self::first_fit) range.
    /// Any remainder stays in the list.
    pub fn take(&mut self, size: u64) -> Option<u64> {
        let (position, length) = self.first_fit(size)?;
        self.remove(position);
        self.add(position + size, length - size);
        Some(position)
    }

    /// Take `size` bytes from a range that starts on a multiple of `unit`.
    pub fn take_aligned(&mut self, size: u64, unit: u64) -> Option<u64> {
        let (length, position) = self
            .by_size
            .range((size, 0)..)
            .find(|&&(_, position)| position % unit == 0)
            .copied()?;

        self.remove(position);
        self.add(position + size, length - size);
        Some(position)
    }

    /// Merge physically adjacent ranges. Returns how many merges happened.
    pub fn compact(&mut self) -> usize {
        let mut merged: BTreeMap<u64, u64> = BTreeMap::new();
        let mut merges = 0;
        let mut current: Option<(u64, u64)> = None;

        for (&position, &size) in &self.by_position {
            current = match current {
                Some((start, length)) if start + length == position => {
                    merges += 1;
                    Some((start, length + size))
                }
                Some((start, length)) => {
                    merged.insert(start, length);
                    Some((position, size))
                }
                None => Some((position, size)),
            };
        }
        if let Some((start, length)) = current {
            merged.insert(start, length);
        }

        if merges > 0 {
            self.by_size = merged.iter().map(|(&p, &s)| (s, p)).collect();
            self.by_position = merged;
        }
        merges
    }

    /// Remove the `count` smallest ranges and return their total length.
    pub fn remove_smallest(&mut self, count: usize) -> u64 {
        let victims: Vec<(u64, u64)> = self.by_size.iter().take(count).copied().collect();
        let mut removed = 0;
        for (size, position) in victims {
            self.by_size.remove(&(size, position));
            self.by_position.remove(&position);
            removed += size;
        }
        removed
    }

    /// Number of ranges shorter than `size`.
    pub fn count_smaller_than(&self, size: u64) -> usize {
        self.by_size.range(..(size, 0)).count()
    }

    /// Ranges in position order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.by_position.iter().map(|(&p, &s)| (p, s))
    }

    pub fn clear(&mut self) {
        self.by_position.clear();
        self.by_size.clear();
    }

    fn overlaps(&self, position: u64, size: u64) -> bool {
        let end = position + size;
        if let Some((&before, &length)) = self.by_position.range(..=position).next_back() {
            if before + length > position {
                return true;
            }
        }
        self.by_position.range(position..end).next().is_some()
    }
}
