//! In-memory mirror of which clusters are in use, one bit per cluster.
//!
//! Free space is searched a machine word at a time: fully used and fully free
//! words are skipped or absorbed whole, and the longest free run inside a mixed
//! word decides whether the word needs to be walked bit by bit at all.

const WORD_BITS: u32 = u64::BITS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeRun {
    pub start: u32,
    pub len: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterBitmap {
    /// Bit `i` of word `w` is cluster `w * 64 + i`; set means used.
    words: Vec<u64>,
    cluster_count: u32,
    free: u32,
}

/// Length of the longest run of clear bits in `word`.
pub fn longest_free_run(word: u64) -> u32 {
    let mut free = !word;
    let mut len = 0;
    while free != 0 {
        free &= free << 1;
        len += 1;
    }
    len
}

/// Lowest bit position starting `count` consecutive set bits of `free`.
fn run_position(free: u64, count: u32) -> Option<u32> {
    let mut mask = free;
    for shift in 1..count {
        mask &= free >> shift;
    }
    (mask != 0).then(|| mask.trailing_zeros())
}

impl ClusterBitmap {
    /// Every data cluster `1..=cluster_count` starts free. Cluster 0 and the
    /// padding past the last cluster are permanently used.
    pub fn new(cluster_count: u32) -> Self {
        let bits = u64::from(cluster_count) + 1;
        let word_count = bits.div_ceil(u64::from(WORD_BITS)) as usize;
        let mut words = vec![0u64; word_count];
        words[0] |= 1;
        let tail_bits = (bits % u64::from(WORD_BITS)) as u32;
        if tail_bits != 0 {
            if let Some(last) = words.last_mut() {
                *last |= !0u64 << tail_bits;
            }
        }
        Self {
            words,
            cluster_count,
            free: cluster_count,
        }
    }

    pub fn cluster_count(&self) -> u32 {
        self.cluster_count
    }

    pub fn free_count(&self) -> u32 {
        self.free
    }

    pub fn used_count(&self) -> u32 {
        self.cluster_count - self.free
    }

    fn locate(cluster: u32) -> (usize, u64) {
        ((cluster / WORD_BITS) as usize, 1u64 << (cluster % WORD_BITS))
    }

    fn in_range(&self, cluster: u32) -> bool {
        cluster >= 1 && cluster <= self.cluster_count
    }

    pub fn is_free(&self, cluster: u32) -> bool {
        if !self.in_range(cluster) {
            return false;
        }
        let (word, bit) = Self::locate(cluster);
        self.words[word] & bit == 0
    }

    pub fn mark_used(&mut self, cluster: u32) {
        if !self.in_range(cluster) {
            return;
        }
        let (word, bit) = Self::locate(cluster);
        if self.words[word] & bit == 0 {
            self.words[word] |= bit;
            self.free -= 1;
        }
    }

    pub fn mark_free(&mut self, cluster: u32) {
        if !self.in_range(cluster) {
            return;
        }
        let (word, bit) = Self::locate(cluster);
        if self.words[word] & bit != 0 {
            self.words[word] &= !bit;
            self.free += 1;
        }
    }

    /// First contiguous run of at least `count` free clusters, in address
    /// order.
    pub fn first_fit(&self, count: u32) -> Option<u32> {
        if count == 0 || count > self.free {
            return None;
        }
        let count = u64::from(count);
        let mut run_start = 0u64;
        let mut run_len = 0u64;

        for (index, &word) in self.words.iter().enumerate() {
            let base = index as u64 * u64::from(WORD_BITS);
            let free = !word;

            if free == 0 {
                run_len = 0;
                continue;
            }
            if free == u64::MAX {
                if run_len == 0 {
                    run_start = base;
                }
                run_len += u64::from(WORD_BITS);
                if run_len >= count {
                    return Some(run_start as u32);
                }
                continue;
            }

            let low = u64::from(free.trailing_ones());
            if low > 0 {
                if run_len == 0 {
                    run_start = base;
                }
                if run_len + low >= count {
                    return Some(run_start as u32);
                }
            }

            if count < u64::from(WORD_BITS) && u64::from(longest_free_run(word)) >= count {
                if let Some(position) = run_position(free, count as u32) {
                    return Some((base + u64::from(position)) as u32);
                }
            }

            let high = u64::from(free.leading_ones());
            run_len = high;
            run_start = base + u64::from(WORD_BITS) - high;
        }
        None
    }

    /// Every maximal free run, in address order.
    pub fn free_runs(&self) -> Vec<FreeRun> {
        let mut runs = Vec::new();
        let mut run_start = 0u64;
        let mut run_len = 0u64;

        fn close(start: u64, len: &mut u64, runs: &mut Vec<FreeRun>) {
            if *len > 0 {
                runs.push(FreeRun {
                    start: start as u32,
                    len: *len as u32,
                });
                *len = 0;
            }
        }

        for (index, &word) in self.words.iter().enumerate() {
            let base = index as u64 * u64::from(WORD_BITS);
            let free = !word;
            if free == 0 {
                close(run_start, &mut run_len, &mut runs);
                continue;
            }
            if free == u64::MAX {
                if run_len == 0 {
                    run_start = base;
                }
                run_len += u64::from(WORD_BITS);
                continue;
            }

            let mut bit = 0u32;
            while bit < WORD_BITS {
                let rest = free >> bit;
                if rest & 1 == 1 {
                    let ones = rest.trailing_ones().min(WORD_BITS - bit);
                    if run_len == 0 {
                        run_start = base + u64::from(bit);
                    }
                    run_len += u64::from(ones);
                    bit += ones;
                } else {
                    close(run_start, &mut run_len, &mut runs);
                    bit += rest.trailing_zeros().min(WORD_BITS - bit);
                }
            }
        }
        close(run_start, &mut run_len, &mut runs);
        runs
    }

    /// Picks `count` free clusters without marking them. A single contiguous
    /// run is preferred; otherwise the largest runs are combined (ties go to
    /// the lower address) and returned in ascending address order. `None`
    /// when fewer than `count` clusters are free.
    pub fn select(&self, count: u32) -> Option<Vec<u32>> {
        if count == 0 {
            return Some(Vec::new());
        }
        if count > self.free {
            return None;
        }
        if let Some(start) = self.first_fit(count) {
            return Some((start..start + count).collect());
        }

        let runs = self.free_runs();
        let mut order: Vec<usize> = (0..runs.len()).collect();
        order.sort_by(|a, b| runs[*b].len.cmp(&runs[*a].len).then(a.cmp(b)));

        let mut remaining = count;
        let mut picked = Vec::new();
        for index in order {
            if remaining == 0 {
                break;
            }
            let take = runs[index].len.min(remaining);
            picked.push(FreeRun {
                start: runs[index].start,
                len: take,
            });
            remaining -= take;
        }
        picked.sort_by_key(|run| run.start);
        Some(
            picked
                .into_iter()
                .flat_map(|run| run.start..run.start + run.len)
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bitmap_with_used(cluster_count: u32, used: &[u32]) -> ClusterBitmap {
        let mut bitmap = ClusterBitmap::new(cluster_count);
        for cluster in used {
            bitmap.mark_used(*cluster);
        }
        bitmap
    }

    #[test]
    fn longest_run_counts_clear_bits() {
        assert_eq!(longest_free_run(u64::MAX), 0);
        assert_eq!(longest_free_run(0), 64);
        assert_eq!(longest_free_run(0b1000_0001), 56);
        assert_eq!(longest_free_run(!0b0111_0000u64), 3);
    }

    #[test]
    fn new_bitmap_reserves_cluster_zero_and_padding() {
        let bitmap = ClusterBitmap::new(70);
        assert_eq!(bitmap.free_count(), 70);
        assert!(!bitmap.is_free(0));
        assert!(bitmap.is_free(1));
        assert!(bitmap.is_free(70));
        assert!(!bitmap.is_free(71));
        assert_eq!(bitmap.first_fit(70), Some(1));
        assert_eq!(bitmap.first_fit(71), None);
    }

    #[test]
    fn marking_tracks_free_count() {
        let mut bitmap = ClusterBitmap::new(10);
        bitmap.mark_used(3);
        bitmap.mark_used(3);
        assert_eq!(bitmap.free_count(), 9);
        assert_eq!(bitmap.used_count(), 1);
        bitmap.mark_free(3);
        bitmap.mark_free(3);
        assert_eq!(bitmap.free_count(), 10);
        bitmap.mark_used(0);
        bitmap.mark_used(11);
        assert_eq!(bitmap.free_count(), 10);
    }

    #[test]
    fn first_fit_spans_word_boundaries() {
        let used: Vec<u32> = (1..60).collect();
        let bitmap = bitmap_with_used(200, &used);
        assert_eq!(bitmap.first_fit(10), Some(60));
        assert_eq!(bitmap.first_fit(141), Some(60));
        assert_eq!(bitmap.first_fit(142), None);
    }

    #[test]
    fn first_fit_finds_interior_runs() {
        let mut used: Vec<u32> = (1..=20).collect();
        used.extend(24..=40);
        let bitmap = bitmap_with_used(40, &used);
        assert_eq!(bitmap.first_fit(3), Some(21));
        assert_eq!(bitmap.first_fit(4), None);
    }

    #[test]
    fn free_runs_are_reported_in_address_order() {
        let used: Vec<u32> = vec![3, 4, 64, 65, 66, 100];
        let bitmap = bitmap_with_used(130, &used);
        let runs = bitmap.free_runs();
        assert_eq!(
            runs,
            vec![
                FreeRun { start: 1, len: 2 },
                FreeRun { start: 5, len: 59 },
                FreeRun { start: 67, len: 33 },
                FreeRun { start: 101, len: 30 },
            ]
        );
        let total: u32 = runs.iter().map(|run| run.len).sum();
        assert_eq!(total, bitmap.free_count());
    }

    #[test]
    fn select_prefers_one_contiguous_run() {
        let bitmap = bitmap_with_used(20, &[2, 5]);
        assert_eq!(bitmap.select(3), Some(vec![6, 7, 8]));
        assert_eq!(bitmap.select(2), Some(vec![3, 4]));
        assert_eq!(bitmap.select(0), Some(vec![]));
    }

    #[test]
    fn select_fragments_across_largest_runs() {
        // Free runs: [1,2] (2 clusters) and [5,6,7] (3 clusters).
        let bitmap = bitmap_with_used(8, &[3, 4, 8]);
        assert_eq!(bitmap.select(4), Some(vec![1, 5, 6, 7]));
        assert_eq!(bitmap.select(5), Some(vec![1, 2, 5, 6, 7]));
        assert_eq!(bitmap.select(6), None);
    }

    #[test]
    fn select_breaks_ties_by_discovery_order() {
        // Free runs of two at 1, 4 and 7.
        let bitmap = bitmap_with_used(9, &[3, 6, 9]);
        assert_eq!(bitmap.select(3), Some(vec![1, 2, 4]));
    }
}
