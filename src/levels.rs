//! Per-region coverage level tracking.
//!
//! [`LevelMachine`] consumes a strictly increasing stream of
//! (position, depth) samples and partitions the region into contiguous runs
//! of bases sharing a coverage level. Levels are the configured thresholds
//! with 0 prepended (once) and an implicit +inf upper bound, so every depth
//! lands in exactly one bucket.

/// Final output of a [`LevelMachine`]: total coverage plus the run intervals
/// `(start, stop, level)` covering the whole region span.
#[derive(Debug, Clone, PartialEq)]
pub struct LevelReport {
    pub coverage_sum: u64,
    /// Half-open runs sorted by start; the union equals `[start, stop)`.
    pub intervals: Vec<(u64, u64, u32)>,
}

/// Streams (position, depth) into per-level contiguous run intervals.
///
/// Positions must advance strictly; skipped positions are synthesized at
/// depth 0. Feeding a position at or before the current one is a caller bug
/// and panics.
#[derive(Debug)]
pub struct LevelMachine {
    start: u64,
    stop: u64,
    /// Bucket floors: 0, then the user thresholds; bucket i spans
    /// `[levels[i], levels[i+1])` with an implicit +inf after the last.
    levels: Vec<u32>,
    runs: Vec<Vec<(u64, u64)>>,
    coverage_sum: u64,
    cur_bucket: usize,
    run_start: u64,
    /// Last position processed; `start - 1` before the first sample.
    cur_pos: i64,
}

impl LevelMachine {
    /// Create a machine for `[start, stop)` with the given strictly
    /// increasing thresholds. A leading 0 is prepended exactly once.
    pub fn new(start: u64, stop: u64, thresholds: &[u32]) -> Self {
        let mut levels = Vec::with_capacity(thresholds.len() + 1);
        if thresholds.first() != Some(&0) {
            levels.push(0);
        }
        levels.extend_from_slice(thresholds);

        let runs = vec![Vec::new(); levels.len()];
        Self {
            start,
            stop,
            levels,
            runs,
            coverage_sum: 0,
            cur_bucket: 0,
            run_start: start,
            cur_pos: start as i64 - 1,
        }
    }

    /// Feed the depth at `pos`. Gap positions since the previous sample are
    /// treated as depth 0.
    ///
    /// # Panics
    ///
    /// Panics if `pos` does not advance past the previously fed position.
    pub fn add(&mut self, pos: u64, depth: u32) {
        let expected = self.cur_pos + 1;
        assert!(
            pos as i64 >= expected,
            "LevelMachine positions must advance left to right: got {} after {}",
            pos,
            self.cur_pos
        );
        if pos as i64 > expected {
            // All gap positions sit in bucket 0, so a single step at the gap
            // start stands in for the whole run of zeros.
            self.step(expected as u64, 0);
            self.cur_pos = pos as i64 - 1;
        }
        self.step(pos, depth);
    }

    fn step(&mut self, pos: u64, depth: u32) {
        self.coverage_sum += depth as u64;

        // Depth changes are typically small, so walking adjacent buckets is
        // amortized O(1).
        let mut bucket = self.cur_bucket;
        while let Some(&upper) = self.levels.get(bucket + 1) {
            if depth >= upper {
                bucket += 1;
            } else {
                break;
            }
        }
        while depth < self.levels[bucket] {
            bucket -= 1;
        }

        if bucket != self.cur_bucket {
            if self.cur_pos >= self.run_start as i64 {
                self.runs[self.cur_bucket].push((self.run_start, pos));
            }
            self.run_start = pos;
            self.cur_bucket = bucket;
        }
        self.cur_pos = pos as i64;
    }

    /// Close the open run at `stop` and return the coverage sum plus the
    /// sorted run intervals spanning `[start, stop)`.
    pub fn report(mut self) -> LevelReport {
        self.runs[self.cur_bucket].push((self.run_start, self.stop));

        let mut intervals = Vec::new();
        for (bucket, runs) in self.runs.iter().enumerate() {
            let level = self.levels[bucket];
            for &(a, b) in runs {
                intervals.push((a, b, level));
            }
        }
        intervals.sort_unstable_by_key(|iv| iv.0);

        LevelReport {
            coverage_sum: self.coverage_sum,
            intervals,
        }
    }
}
