//! Free-space accounting for block allocation
//!
//! The content engine allocates payload and sector-bitmap blocks first-fit
//! from the gaps between reserved structures, extending the file when no
//! gap is large enough.

use std::collections::BTreeMap;

/// An interval set of free file ranges
#[derive(Debug, Clone)]
pub struct FreeSpaceTable {
    /// start -> length, non-overlapping, non-adjacent
    free: BTreeMap<u64, u64>,
    file_end: u64,
}

impl FreeSpaceTable {
    /// A table covering `[0, file_len)`, all free; callers reserve the
    /// structures they know about
    pub fn new(file_len: u64) -> Self {
        let mut free = BTreeMap::new();
        if file_len > 0 {
            free.insert(0, file_len);
        }
        Self {
            free,
            file_end: file_len,
        }
    }

    pub fn file_end(&self) -> u64 {
        self.file_end
    }

    /// Mark `[start, start+len)` as in use
    pub fn reserve(&mut self, start: u64, len: u64) {
        if len == 0 {
            return;
        }
        let end = start + len;

        // Collect overlapping free intervals
        let overlapping: Vec<(u64, u64)> = self
            .free
            .range(..end)
            .filter(|(&s, &l)| s + l > start)
            .map(|(&s, &l)| (s, l))
            .collect();

        for (s, l) in overlapping {
            self.free.remove(&s);
            if s < start {
                self.free.insert(s, start - s);
            }
            if s + l > end {
                self.free.insert(end, s + l - end);
            }
        }
    }

    /// First-fit allocation of `len` bytes aligned to `align`
    pub fn allocate(&mut self, len: u64, align: u64) -> Option<u64> {
        let candidate = self.free.iter().find_map(|(&start, &length)| {
            let aligned = start.next_multiple_of(align);
            let padding = aligned - start;
            (length >= padding + len).then_some(aligned)
        })?;
        self.reserve(candidate, len);
        Some(candidate)
    }

    /// Record that the file grew; the new tail `[old_end, new_end)` is free
    pub fn extend_file(&mut self, new_end: u64) {
        if new_end <= self.file_end {
            return;
        }
        let start = self.file_end;
        let len = new_end - start;
        self.file_end = new_end;

        // Coalesce with a trailing free interval if present
        if let Some((&prev_start, &prev_len)) = self.free.range(..=start).next_back() {
            if prev_start + prev_len == start {
                self.free.insert(prev_start, prev_len + len);
                return;
            }
        }
        self.free.insert(start, len);
    }

    #[cfg(test)]
    fn free_ranges(&self) -> Vec<(u64, u64)> {
        self.free.iter().map(|(&s, &l)| (s, l)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: u64 = 1024 * 1024;

    #[test]
    fn test_reserve_splits_interval() {
        let mut table = FreeSpaceTable::new(10 * MB);
        table.reserve(2 * MB, MB);
        assert_eq!(table.free_ranges(), vec![(0, 2 * MB), (3 * MB, 7 * MB)]);
    }

    #[test]
    fn test_reserve_overlapping_edges() {
        let mut table = FreeSpaceTable::new(10 * MB);
        table.reserve(0, MB);
        table.reserve(9 * MB, 2 * MB); // reaches past the end
        assert_eq!(table.free_ranges(), vec![(MB, 8 * MB)]);
    }

    #[test]
    fn test_allocate_first_fit_aligned() {
        let mut table = FreeSpaceTable::new(10 * MB);
        table.reserve(0, MB + 512); // leaves a misaligned gap start

        let got = table.allocate(MB, MB).unwrap();
        assert_eq!(got, 2 * MB);

        // The padding before the aligned start stays free
        assert!(table
            .free_ranges()
            .contains(&(MB + 512, MB - 512)));
    }

    #[test]
    fn test_allocate_exhausted() {
        let mut table = FreeSpaceTable::new(2 * MB);
        table.reserve(0, 2 * MB);
        assert_eq!(table.allocate(MB, MB), None);
    }

    #[test]
    fn test_extend_file_coalesces() {
        let mut table = FreeSpaceTable::new(2 * MB);
        table.reserve(0, MB);
        table.extend_file(4 * MB);
        assert_eq!(table.free_ranges(), vec![(MB, 3 * MB)]);
        assert_eq!(table.file_end(), 4 * MB);

        let got = table.allocate(3 * MB, MB).unwrap();
        assert_eq!(got, MB);
    }
}
