//! Presence Map
//!
//! Records which physical byte ranges of a capture were never acquired.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Sparse set of absent physical ranges, kept merged and non-overlapping.
///
/// Everything not listed is resident.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceMap {
    /// start -> end (exclusive)
    absent: BTreeMap<u64, u64>,
}

impl PresenceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `[start, end)` absent, merging with neighbouring ranges.
    pub fn mark_absent(&mut self, start: u64, end: u64) {
        if start >= end {
            return;
        }

        let mut new_start = start;
        let mut new_end = end;

        // A range starting before `start` may reach into (or touch) the new one
        if let Some((&s, &e)) = self.absent.range(..=start).next_back() {
            if e >= start {
                new_start = s;
                new_end = new_end.max(e);
            }
        }

        let swallowed: Vec<u64> = self
            .absent
            .range(new_start..=new_end)
            .map(|(&s, _)| s)
            .collect();
        for s in swallowed {
            if let Some(e) = self.absent.remove(&s) {
                new_end = new_end.max(e);
            }
        }

        self.absent.insert(new_start, new_end);
    }

    /// Mark `[start, end)` absent after rounding outward to `page_size`.
    pub fn mark_absent_pages(&mut self, start: u64, end: u64, page_size: u64) {
        let start = start - start % page_size;
        let end = end.div_ceil(page_size).saturating_mul(page_size);
        self.mark_absent(start, end);
    }

    /// First absent byte within `[start, end)`, if any.
    pub fn first_absent(&self, start: u64, end: u64) -> Option<u64> {
        if start >= end {
            return None;
        }

        if let Some((_, &e)) = self.absent.range(..=start).next_back() {
            if e > start {
                return Some(start);
            }
        }

        self.absent
            .range(start..end)
            .next()
            .map(|(&s, _)| s)
    }

    pub fn is_absent(&self, offset: u64) -> bool {
        self.first_absent(offset, offset.saturating_add(1)).is_some()
    }

    /// Absent ranges as `(start, end)` pairs in ascending order.
    pub fn ranges(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.absent.iter().map(|(&s, &e)| (s, e))
    }

    /// Total absent bytes that fall below `limit`.
    pub fn absent_bytes(&self, limit: u64) -> u64 {
        self.ranges()
            .filter(|&(s, _)| s < limit)
            .map(|(s, e)| e.min(limit) - s)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.absent.is_empty()
    }
}
