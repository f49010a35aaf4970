//! Per-thread record of what was touched since the last flush.

use crate::weights::UpdateGranularity;
use std::ops::Range;

#[derive(Debug, Clone)]
enum Entries {
    /// Whole matrix touched or not.
    Full { touched: bool },
    /// Sorted, disjoint, non-adjacent row ranges.
    Ranges(Vec<Range<usize>>),
    /// Sorted unique ids: segment indices or single rows.
    Ids(Vec<usize>),
}

/// Dirty-row buffer of one thread for one shared weight.
///
/// A row (or segment) appears at most once between flushes: inserting an
/// id or range that is already covered changes nothing.
#[derive(Debug, Clone)]
pub struct DirtyBuffer {
    granularity: UpdateGranularity,
    capacity: usize,
    entries: Entries,
}

impl DirtyBuffer {
    /// Empty buffer holding at most `capacity` entries (ranges or ids).
    pub fn new(granularity: UpdateGranularity, capacity: usize) -> Self {
        let entries = match granularity {
            UpdateGranularity::Full => Entries::Full { touched: false },
            UpdateGranularity::Part => Entries::Ranges(Vec::new()),
            UpdateGranularity::Segment { .. } | UpdateGranularity::OneShot => {
                Entries::Ids(Vec::new())
            }
        };
        Self {
            granularity,
            capacity: capacity.max(1),
            entries,
        }
    }

    /// Marks rows `rows` as touched.
    pub fn mark_rows(&mut self, rows: Range<usize>) {
        if rows.is_empty() {
            return;
        }
        match (&mut self.entries, self.granularity) {
            (Entries::Full { touched }, _) => *touched = true,
            (Entries::Ranges(ranges), _) => insert_range(ranges, rows),
            (Entries::Ids(ids), UpdateGranularity::Segment { rows: seg }) => {
                let seg = seg.max(1);
                for id in rows.start / seg..=(rows.end - 1) / seg {
                    insert_id(ids, id);
                }
            }
            (Entries::Ids(ids), _) => {
                for id in rows {
                    insert_id(ids, id);
                }
            }
        }
    }

    /// Number of entries (ranges, ids, or 1 for a touched full matrix).
    pub fn len(&self) -> usize {
        match &self.entries {
            Entries::Full { touched } => usize::from(*touched),
            Entries::Ranges(ranges) => ranges.len(),
            Entries::Ids(ids) => ids.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when another distinct entry would exceed the capacity.
    pub fn is_full(&self) -> bool {
        match &self.entries {
            Entries::Full { .. } => false,
            _ => self.len() >= self.capacity,
        }
    }

    /// Touched rows as sorted disjoint ranges, clipped to `total_rows`.
    pub fn row_ranges(&self, total_rows: usize) -> Vec<Range<usize>> {
        match (&self.entries, self.granularity) {
            (Entries::Full { touched: true }, _) => vec![0..total_rows],
            (Entries::Full { touched: false }, _) => Vec::new(),
            (Entries::Ranges(ranges), _) => ranges.clone(),
            (Entries::Ids(ids), UpdateGranularity::Segment { rows: seg }) => {
                let seg = seg.max(1);
                ids.iter()
                    .map(|&id| id * seg..((id + 1) * seg).min(total_rows))
                    .collect()
            }
            (Entries::Ids(ids), _) => ids.iter().map(|&id| id..id + 1).collect(),
        }
    }

    /// Forgets every entry.
    pub fn clear(&mut self) {
        match &mut self.entries {
            Entries::Full { touched } => *touched = false,
            Entries::Ranges(ranges) => ranges.clear(),
            Entries::Ids(ids) => ids.clear(),
        }
    }
}

fn insert_id(ids: &mut Vec<usize>, id: usize) {
    if let Err(pos) = ids.binary_search(&id) {
        ids.insert(pos, id);
    }
}

/// Inserts `new` into sorted disjoint `ranges`, merging overlapping and
/// adjacent ranges.
fn insert_range(ranges: &mut Vec<Range<usize>>, new: Range<usize>) {
    // first range that ends at or after new.start (could merge)
    let first = ranges.partition_point(|r| r.end < new.start);
    // first range that starts strictly after new.end (cannot merge)
    let last = ranges.partition_point(|r| r.start <= new.end);

    if first == last {
        ranges.insert(first, new);
        return;
    }
    let start = new.start.min(ranges[first].start);
    let end = new.end.max(ranges[last - 1].end);
    ranges.splice(first..last, std::iter::once(start..end));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_part_ranges_merge() {
        let mut dirty = DirtyBuffer::new(UpdateGranularity::Part, 16);
        dirty.mark_rows(10..12);
        dirty.mark_rows(2..4);
        dirty.mark_rows(4..6); // adjacent
        dirty.mark_rows(20..22);
        assert_eq!(dirty.row_ranges(100), vec![2..6, 10..12, 20..22]);

        dirty.mark_rows(5..21); // bridges everything after 2..6
        assert_eq!(dirty.row_ranges(100), vec![2..22]);
        assert_eq!(dirty.len(), 1);
    }

    #[test]
    fn test_rows_appear_once() {
        let mut dirty = DirtyBuffer::new(UpdateGranularity::OneShot, 16);
        dirty.mark_rows(3..4);
        dirty.mark_rows(3..4);
        dirty.mark_rows(1..2);
        assert_eq!(dirty.len(), 2);
        assert_eq!(dirty.row_ranges(10), vec![1..2, 3..4]);

        let mut dirty = DirtyBuffer::new(UpdateGranularity::Part, 16);
        dirty.mark_rows(0..5);
        dirty.mark_rows(1..3);
        assert_eq!(dirty.row_ranges(10), vec![0..5]);
    }

    #[test]
    fn test_segments() {
        let mut dirty = DirtyBuffer::new(UpdateGranularity::Segment { rows: 4 }, 16);
        dirty.mark_rows(3..6); // segments 0 and 1
        dirty.mark_rows(9..10); // segment 2
        assert_eq!(dirty.len(), 3);
        assert_eq!(dirty.row_ranges(10), vec![0..4, 4..8, 8..10]);
    }

    #[test]
    fn test_full_and_capacity() {
        let mut full = DirtyBuffer::new(UpdateGranularity::Full, 1);
        assert!(full.is_empty());
        full.mark_rows(0..1);
        full.mark_rows(5..7);
        assert_eq!(full.len(), 1);
        assert!(!full.is_full());
        assert_eq!(full.row_ranges(8), vec![0..8]);

        let mut ids = DirtyBuffer::new(UpdateGranularity::OneShot, 2);
        ids.mark_rows(0..1);
        assert!(!ids.is_full());
        ids.mark_rows(4..5);
        assert!(ids.is_full());

        ids.clear();
        assert!(ids.is_empty());
    }
}
