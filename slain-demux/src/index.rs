//! Per-stream seek index.
//!
//! Entries stay sorted by timestamp with no duplicates. Containers with an
//! on-disk index fill it during `read_header`; generic-index formats grow it
//! one key packet at a time while reading.

use bitflags::bitflags;

use crate::seek::SeekFlags;
use crate::timestamps::{is_relative, RELATIVE_TS_BASE};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct IndexFlags: u32 {
        const KEYFRAME = 0x0001;
        /// Present in the file but not meant for output (e.g. edit-list preroll).
        const DISCARD = 0x0002;
    }
}

pub const MAX_INDEX_ENTRY_SIZE: i32 = 0x3fff_ffff;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub pos: i64,
    pub timestamp: i64,
    pub flags: IndexFlags,
    pub size: i32,
    /// Bytes to the previous keyframe; lets a seek skip reading.
    pub min_distance: i32,
}

impl IndexEntry {
    pub fn is_keyframe(&self) -> bool {
        self.flags.contains(IndexFlags::KEYFRAME)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SeekIndex {
    entries: Vec<IndexEntry>,
}

impl SeekIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entry budget for a memory ceiling of `max_index_size` bytes.
    pub fn max_entries(max_index_size: usize) -> usize {
        max_index_size / std::mem::size_of::<IndexEntry>()
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, i: usize) -> Option<&IndexEntry> {
        self.entries.get(i)
    }

    pub fn last(&self) -> Option<&IndexEntry> {
        self.entries.last()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Inserts or updates the entry for `timestamp` and returns its position.
    ///
    /// Rejects a missing timestamp, a size outside `0..=MAX_INDEX_ENTRY_SIZE`
    /// and an index already at the `u32` ceiling. Relative timestamps are
    /// rebased before insertion.
    pub fn add(
        &mut self,
        pos: i64,
        timestamp: Option<i64>,
        size: i32,
        distance: i32,
        flags: IndexFlags,
    ) -> Option<usize> {
        if self.entries.len() + 1 >= u32::MAX as usize / std::mem::size_of::<IndexEntry>() {
            return None;
        }
        let mut timestamp = timestamp?;
        if !(0..=MAX_INDEX_ENTRY_SIZE).contains(&size) {
            return None;
        }
        if is_relative(timestamp) {
            timestamp -= RELATIVE_TS_BASE;
        }

        let mut distance = distance;
        let index = match self.search(timestamp, SeekFlags::ANY) {
            None => {
                self.entries.push(IndexEntry { pos, timestamp, flags, size, min_distance: distance });
                return Some(self.entries.len() - 1);
            }
            Some(i) => i,
        };

        let existing = self.entries[index];
        if existing.timestamp != timestamp {
            if existing.timestamp <= timestamp {
                return None;
            }
            self.entries.insert(index, existing);
        } else if existing.pos == pos && distance < existing.min_distance {
            distance = existing.min_distance;
        }
        self.entries[index] = IndexEntry { pos, timestamp, flags, size, min_distance: distance };
        Some(index)
    }

    /// Finds the entry for `wanted`.
    ///
    /// Without `BACKWARD` the result is the first entry at or after
    /// `wanted`, with it the last entry at or before. Unless `ANY` is set
    /// the search continues in that direction to the nearest keyframe.
    /// Discarded entries are stepped over during the bisection.
    pub fn search(&self, wanted: i64, flags: SeekFlags) -> Option<usize> {
        let entries = &self.entries;
        let n = entries.len() as isize;
        let mut a: isize = -1;
        let mut b: isize = n;

        if n > 0 && entries[(n - 1) as usize].timestamp < wanted {
            a = n - 1;
        }

        while b - a > 1 {
            let mut m = (a + b) >> 1;
            while entries[m as usize].flags.contains(IndexFlags::DISCARD) && m < b && m < n - 1 {
                m += 1;
                if m == b && entries[m as usize].timestamp >= wanted {
                    m = b - 1;
                    break;
                }
            }
            let ts = entries[m as usize].timestamp;
            if ts >= wanted {
                b = m;
            }
            if ts <= wanted {
                a = m;
            }
        }

        let backward = flags.contains(SeekFlags::BACKWARD);
        let mut m = if backward { a } else { b };
        if !flags.contains(SeekFlags::ANY) {
            while m >= 0 && m < n && !entries[m as usize].is_keyframe() {
                m += if backward { -1 } else { 1 };
            }
        }
        if m < 0 || m >= n {
            return None;
        }
        Some(m as usize)
    }

    /// Halves the index (keeping every other entry) once it holds
    /// `max_entries`.
    pub fn reduce(&mut self, max_entries: usize) {
        if self.entries.len() < max_entries {
            return;
        }
        let mut i = 0;
        while 2 * i < self.entries.len() {
            self.entries[i] = self.entries[2 * i];
            i += 1;
        }
        self.entries.truncate(i);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn key_index(ts: &[i64]) -> SeekIndex {
        let mut idx = SeekIndex::new();
        for (i, &t) in ts.iter().enumerate() {
            idx.add(i as i64 * 100, Some(t), 10, 0, IndexFlags::KEYFRAME).expect("insert");
        }
        idx
    }

    #[test]
    fn rejects_missing_timestamp_and_oversize() {
        let mut idx = SeekIndex::new();
        assert!(idx.add(0, None, 0, 0, IndexFlags::KEYFRAME).is_none());
        assert!(idx.add(0, Some(1), MAX_INDEX_ENTRY_SIZE + 1, 0, IndexFlags::KEYFRAME).is_none());
        assert!(idx.add(0, Some(1), -1, 0, IndexFlags::KEYFRAME).is_none());
        assert!(idx.is_empty());
    }

    #[test]
    fn out_of_order_insert_lands_in_place() {
        let idx = key_index(&[0, 30, 10, 20]);
        let ts: Vec<i64> = idx.entries().iter().map(|e| e.timestamp).collect();
        assert_eq!(ts, vec![0, 10, 20, 30]);
    }

    #[test]
    fn duplicate_keeps_larger_distance_for_same_pos() {
        let mut idx = SeekIndex::new();
        idx.add(500, Some(7), 4, 90, IndexFlags::KEYFRAME);
        idx.add(500, Some(7), 4, 10, IndexFlags::KEYFRAME);
        assert_eq!(idx.len(), 1);
        assert_eq!(idx.entries()[0].min_distance, 90);
    }

    #[test]
    fn relative_timestamps_are_rebased() {
        let mut idx = SeekIndex::new();
        idx.add(0, Some(RELATIVE_TS_BASE + 42), 0, 0, IndexFlags::KEYFRAME);
        assert_eq!(idx.entries()[0].timestamp, 42);
    }

    #[test]
    fn search_directions_and_keyframes() {
        let mut idx = SeekIndex::new();
        idx.add(0, Some(0), 1, 0, IndexFlags::KEYFRAME);
        idx.add(1, Some(10), 1, 0, IndexFlags::empty());
        idx.add(2, Some(20), 1, 0, IndexFlags::KEYFRAME);
        idx.add(3, Some(30), 1, 0, IndexFlags::empty());

        assert_eq!(idx.search(15, SeekFlags::BACKWARD), Some(0));
        assert_eq!(idx.search(15, SeekFlags::empty()), Some(2));
        assert_eq!(idx.search(15, SeekFlags::ANY), Some(2));
        assert_eq!(idx.search(15, SeekFlags::BACKWARD | SeekFlags::ANY), Some(1));
        assert_eq!(idx.search(25, SeekFlags::empty()), None);
        assert_eq!(idx.search(-5, SeekFlags::BACKWARD), None);
        assert_eq!(idx.search(100, SeekFlags::BACKWARD), Some(2));
    }

    #[test]
    fn search_over_discarded_entries() {
        let mut idx = SeekIndex::new();
        idx.add(0, Some(0), 1, 0, IndexFlags::KEYFRAME);
        idx.add(1, Some(10), 1, 0, IndexFlags::DISCARD);
        idx.add(2, Some(20), 1, 0, IndexFlags::DISCARD);
        idx.add(3, Some(30), 1, 0, IndexFlags::KEYFRAME);
        idx.add(4, Some(40), 1, 0, IndexFlags::KEYFRAME);
        assert_eq!(idx.search(25, SeekFlags::empty()), Some(3));
        assert_eq!(idx.search(25, SeekFlags::BACKWARD), Some(0));
    }

    #[test]
    fn reduce_keeps_even_entries() {
        let mut idx = key_index(&[0, 1, 2, 3, 4]);
        idx.reduce(10);
        assert_eq!(idx.len(), 5);
        idx.reduce(5);
        let ts: Vec<i64> = idx.entries().iter().map(|e| e.timestamp).collect();
        assert_eq!(ts, vec![0, 2, 4]);
    }

    proptest! {
        #[test]
        fn stays_sorted_and_unique(ts in proptest::collection::vec(-1000i64..1000, 0..200)) {
            let mut idx = SeekIndex::new();
            for (i, t) in ts.iter().enumerate() {
                idx.add(i as i64, Some(*t), 0, 0, IndexFlags::KEYFRAME);
            }
            let e = idx.entries();
            for w in e.windows(2) {
                prop_assert!(w[0].timestamp < w[1].timestamp);
            }
            let mut uniq = ts.clone();
            uniq.sort_unstable();
            uniq.dedup();
            prop_assert_eq!(e.len(), uniq.len());
        }

        #[test]
        fn backward_search_never_overshoots(
            ts in proptest::collection::btree_set(0i64..10_000, 1..100),
            wanted in 0i64..10_000,
        ) {
            let sorted: Vec<i64> = ts.into_iter().collect();
            let idx = key_index(&sorted);
            match idx.search(wanted, SeekFlags::BACKWARD) {
                Some(i) => {
                    prop_assert!(idx.entries()[i].timestamp <= wanted);
                    if let Some(next) = idx.get(i + 1) {
                        prop_assert!(next.timestamp > wanted);
                    }
                }
                None => prop_assert!(sorted[0] > wanted),
            }
        }
    }
}
